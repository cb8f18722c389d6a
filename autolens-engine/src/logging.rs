//! Session log sink
//!
//! [`SessionLog`] is a [`log::Log`] implementation that writes every record
//! to a per-session file and keeps the last [`RING_SIZE`] lines in memory.
//! A crash marker file exists for as long as the session runs; it is
//! rewritten with the ring buffer on every warning or error and removed by
//! [`SessionLog::finish`]. Finding a marker when a session opens means the
//! previous process did not shut down cleanly.
//!
//! The sink installs nothing globally. Hosts either register it with
//! `log::set_boxed_logger` or forward records to it from their own logger.

use crate::types::Result;
use chrono::{DateTime, Local};
use log::{Level, LevelFilter, Log, Metadata, Record};
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::fs::{self, File};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::time::Instant;

/// Session files kept in the log directory, the current one included
pub const MAX_LOG_FILES: usize = 10;

/// Lines kept in memory for the crash marker
pub const RING_SIZE: usize = 50;

pub const CRASH_MARKER_NAME: &str = "autolens_crash_marker.txt";

const FILE_PREFIX: &str = "autolens_";
const FILE_SUFFIX: &str = ".log";
const RULE: &str = "============================================================";

#[derive(Debug)]
struct SinkState {
    file: Option<BufWriter<File>>,
    ring: VecDeque<String>,
    messages: u64,
    warnings: u64,
    errors: u64,
}

/// Per-session file logger with a crash marker
#[derive(Debug)]
pub struct SessionLog {
    dir: PathBuf,
    session_path: PathBuf,
    started: DateTime<Local>,
    uptime: Instant,
    level: LevelFilter,
    previous_crash: Option<String>,
    state: Mutex<SinkState>,
}

impl SessionLog {
    /// Open a new session in `dir`
    ///
    /// Creates the directory if needed, prunes old session files, writes the
    /// session banner and creates the crash marker.
    pub fn open(dir: impl AsRef<Path>, version: &str) -> Result<Self> {
        let dir = dir.as_ref().to_path_buf();
        fs::create_dir_all(&dir)?;

        let marker = dir.join(CRASH_MARKER_NAME);
        let previous_crash = if marker.exists() {
            Some(fs::read_to_string(&marker).unwrap_or_default())
        } else {
            None
        };

        prune_sessions(&dir, MAX_LOG_FILES.saturating_sub(1))?;

        let started = Local::now();
        let session_path = unique_session_path(&dir, &started);
        let mut file = BufWriter::new(
            fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(&session_path)?,
        );

        writeln!(file, "{}", RULE)?;
        writeln!(file, "  AutoLens Log - Session Start")?;
        if !version.is_empty() {
            writeln!(file, "  Version:    {}", version)?;
        }
        writeln!(file, "  Timestamp:  {}", started.format("%Y-%m-%dT%H:%M:%S%.3f"))?;
        writeln!(file, "  Platform:   {} {}", std::env::consts::OS, std::env::consts::ARCH)?;
        writeln!(file, "  Log file:   {}", session_path.display())?;
        if previous_crash.is_some() {
            writeln!(file, "  PREVIOUS SESSION CRASHED - see crash marker for details")?;
        }
        writeln!(file, "{}", RULE)?;
        writeln!(file)?;
        file.flush()?;

        let sink = Self {
            dir,
            session_path,
            started,
            uptime: Instant::now(),
            level: LevelFilter::Debug,
            previous_crash,
            state: Mutex::new(SinkState {
                file: Some(file),
                ring: VecDeque::with_capacity(RING_SIZE),
                messages: 0,
                warnings: 0,
                errors: 0,
            }),
        };
        sink.write_crash_marker(&sink.state.lock());
        Ok(sink)
    }

    /// Most verbose level accepted (default: debug)
    pub fn with_level(mut self, level: LevelFilter) -> Self {
        self.level = level;
        self
    }

    pub fn session_path(&self) -> &Path {
        &self.session_path
    }

    pub fn crash_marker_path(&self) -> PathBuf {
        self.dir.join(CRASH_MARKER_NAME)
    }

    /// True if a crash marker from an earlier session was found on open
    pub fn previous_session_crashed(&self) -> bool {
        self.previous_crash.is_some()
    }

    /// Contents of the earlier session's crash marker
    pub fn previous_crash_report(&self) -> Option<&str> {
        self.previous_crash.as_deref()
    }

    /// The ring buffer, oldest first
    pub fn recent(&self) -> Vec<String> {
        self.state.lock().ring.iter().cloned().collect()
    }

    /// (messages, warnings, errors) logged so far
    pub fn counts(&self) -> (u64, u64, u64) {
        let state = self.state.lock();
        (state.messages, state.warnings, state.errors)
    }

    /// Write the session-end banner, close the file and remove the marker
    ///
    /// Records logged afterwards are dropped.
    pub fn finish(&self) {
        let mut state = self.state.lock();
        let (messages, warnings, errors) = (state.messages, state.warnings, state.errors);
        if let Some(mut file) = state.file.take() {
            let _ = writeln!(file);
            let _ = writeln!(file, "{}", RULE);
            let _ = writeln!(file, "  SESSION END - Clean shutdown");
            let _ = writeln!(file, "  Uptime:     {:.3} seconds", self.uptime.elapsed().as_secs_f64());
            let _ = writeln!(
                file,
                "  Messages:   {} total  ({} warnings, {} errors)",
                messages, warnings, errors
            );
            let _ = writeln!(file, "  Timestamp:  {}", Local::now().format("%Y-%m-%dT%H:%M:%S%.3f"));
            let _ = writeln!(file, "{}", RULE);
            let _ = file.flush();
        }
        let _ = fs::remove_file(self.crash_marker_path());
    }

    fn write_crash_marker(&self, state: &SinkState) {
        let write = || -> std::io::Result<()> {
            let mut out = BufWriter::new(File::create(self.crash_marker_path())?);
            writeln!(out, "AutoLens Crash Marker")?;
            writeln!(out, "Session: {}", self.started.format("%Y-%m-%dT%H:%M:%S%.3f"))?;
            writeln!(out, "Log:     {}", self.session_path.display())?;
            writeln!(out, "Uptime:  {:.3} seconds", self.uptime.elapsed().as_secs_f64())?;
            writeln!(out)?;
            writeln!(out, "-- Last {} messages before marker --", RING_SIZE)?;
            for line in &state.ring {
                writeln!(out, "{}", line)?;
            }
            out.flush()
        };
        if let Err(e) = write() {
            eprintln!("[SessionLog] cannot write crash marker: {}", e);
        }
    }
}

impl Log for SessionLog {
    fn enabled(&self, metadata: &Metadata) -> bool {
        metadata.level() <= self.level
    }

    fn log(&self, record: &Record) {
        if !self.enabled(record.metadata()) {
            return;
        }
        let line = format_record(record, &Local::now());
        let level = record.level();

        let mut state = self.state.lock();
        if state.file.is_none() {
            return;
        }
        state.messages += 1;
        match level {
            Level::Warn => state.warnings += 1,
            Level::Error => state.errors += 1,
            _ => {}
        }
        if let Some(file) = state.file.as_mut() {
            let _ = writeln!(file, "{}", line);
            if level <= Level::Warn {
                let _ = file.flush();
            }
        }
        if state.ring.len() == RING_SIZE {
            state.ring.pop_front();
        }
        state.ring.push_back(line);

        if level <= Level::Warn {
            self.write_crash_marker(&state);
        }
    }

    fn flush(&self) {
        if let Some(file) = self.state.lock().file.as_mut() {
            let _ = file.flush();
        }
    }
}

/// `[yyyy-MM-dd hh:mm:ss.zzz] [LVL] [thread] message`, plus the source
/// location for warnings and errors
pub fn format_record(record: &Record, now: &DateTime<Local>) -> String {
    let thread = std::thread::current();
    let thread_name = match thread.name() {
        Some(name) => name.to_string(),
        None => format!("{:?}", thread.id()),
    };
    let mut line = format!(
        "[{}] [{}] [{}] {}",
        now.format("%Y-%m-%d %H:%M:%S%.3f"),
        level_tag(record.level()),
        thread_name,
        record.args()
    );
    if record.level() <= Level::Warn {
        if let (Some(file), Some(lineno)) = (record.file(), record.line()) {
            let file = Path::new(file)
                .file_name()
                .map(|f| f.to_string_lossy().into_owned())
                .unwrap_or_else(|| file.to_string());
            line.push_str(&format!(" ({}:{})", file, lineno));
        }
    }
    line
}

pub fn level_tag(level: Level) -> &'static str {
    match level {
        Level::Error => "ERR",
        Level::Warn => "WRN",
        Level::Info => "INF",
        Level::Debug | Level::Trace => "DBG",
    }
}

fn unique_session_path(dir: &Path, started: &DateTime<Local>) -> PathBuf {
    let stamp = started.format("%Y%m%d_%H%M%S").to_string();
    let path = dir.join(format!("{}{}{}", FILE_PREFIX, stamp, FILE_SUFFIX));
    if !path.exists() {
        return path;
    }
    (1..)
        .map(|n| dir.join(format!("{}{}_{}{}", FILE_PREFIX, stamp, n, FILE_SUFFIX)))
        .find(|p| !p.exists())
        .unwrap_or(path)
}

/// Session files in `dir`, oldest first
pub fn session_files(dir: &Path) -> Result<Vec<PathBuf>> {
    let mut files: Vec<PathBuf> = fs::read_dir(dir)?
        .filter_map(|entry| entry.ok().map(|e| e.path()))
        .filter(|path| {
            path.file_name()
                .and_then(|n| n.to_str())
                .map(|n| n.starts_with(FILE_PREFIX) && n.ends_with(FILE_SUFFIX))
                .unwrap_or(false)
        })
        .collect();
    // names embed the start time, so name order is age order
    files.sort();
    Ok(files)
}

/// Delete the oldest session files until at most `keep` remain
fn prune_sessions(dir: &Path, keep: usize) -> Result<()> {
    let files = session_files(dir)?;
    if files.len() <= keep {
        return Ok(());
    }
    for path in &files[..files.len() - keep] {
        if let Err(e) = fs::remove_file(path) {
            eprintln!("[SessionLog] cannot remove {}: {}", path.display(), e);
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn emit(sink: &SessionLog, level: Level, message: &str) {
        sink.log(
            &Record::builder()
                .level(level)
                .args(format_args!("{}", message))
                .file(Some("src/engine.rs"))
                .line(Some(42))
                .build(),
        );
    }

    #[test]
    fn test_session_lifecycle() {
        let dir = tempdir().unwrap();
        let sink = SessionLog::open(dir.path(), "1.2.3").unwrap();
        assert!(!sink.previous_session_crashed());
        assert!(sink.crash_marker_path().exists());

        emit(&sink, Level::Info, "hello");
        emit(&sink, Level::Warn, "careful");
        emit(&sink, Level::Trace, "filtered by level");
        assert_eq!(sink.counts(), (2, 1, 0));

        let marker = fs::read_to_string(sink.crash_marker_path()).unwrap();
        assert!(marker.contains("careful (engine.rs:42)"));

        sink.finish();
        assert!(!sink.crash_marker_path().exists());

        let text = fs::read_to_string(sink.session_path()).unwrap();
        assert!(text.contains("Version:    1.2.3"));
        assert!(text.contains("[INF]"));
        assert!(text.contains("] hello"));
        assert!(text.contains("[WRN]"));
        assert!(text.contains("2 total  (1 warnings, 0 errors)"));
    }

    #[test]
    fn test_previous_crash_detected() {
        let dir = tempdir().unwrap();
        let first = SessionLog::open(dir.path(), "").unwrap();
        emit(&first, Level::Error, "boom");
        // no finish: marker stays behind
        drop(first);

        let second = SessionLog::open(dir.path(), "").unwrap();
        assert!(second.previous_session_crashed());
        assert!(second.previous_crash_report().unwrap().contains("boom"));
        second.finish();
    }

    #[test]
    fn test_ring_buffer_bounded() {
        let dir = tempdir().unwrap();
        let sink = SessionLog::open(dir.path(), "").unwrap();
        for i in 0..(RING_SIZE + 7) {
            emit(&sink, Level::Debug, &format!("line {}", i));
        }
        let recent = sink.recent();
        assert_eq!(recent.len(), RING_SIZE);
        assert!(recent[0].ends_with("line 7"));
        assert!(recent[0].contains("[DBG]"));
        sink.finish();
    }

    #[test]
    fn test_old_sessions_pruned() {
        let dir = tempdir().unwrap();
        for day in 1..=12 {
            let name = format!("autolens_202401{:02}_120000.log", day);
            fs::write(dir.path().join(name), "old").unwrap();
        }
        fs::write(dir.path().join("unrelated.txt"), "keep").unwrap();

        let sink = SessionLog::open(dir.path(), "").unwrap();
        let files = session_files(dir.path()).unwrap();
        assert_eq!(files.len(), MAX_LOG_FILES);
        assert!(!dir.path().join("autolens_20240101_120000.log").exists());
        assert!(dir.path().join("unrelated.txt").exists());
        assert!(files.iter().any(|f| f == sink.session_path()));
        sink.finish();
    }
}
