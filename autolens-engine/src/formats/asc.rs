//! ASC (Vector ASCII log) reader and writer
//!
//! ## Frame lines
//! ```text
//!    1.234567 2  18DB33F1x Tx     d 4 01 02 03 04
//!    0.010000 1  0C4  Rx     CANFD 9 A0 0F ... 00  BRS
//!    0.020000 1  100  Rx     r 8
//!    0.030000 1  000  Rx     ErrorFrame
//! ```
//!
//! Timestamps are absolute seconds with microsecond resolution. The reader
//! is lenient: it skips comments, metadata lines and anything it cannot
//! make sense of, and only fails when a file yields no frames at all.

use crate::dlc::{dlc_to_length, length_to_dlc};
use crate::formats::LogFileParser;
use crate::types::{CanFrame, EngineError, Result, MAX_DATA_LEN, MAX_EXTENDED_ID, MAX_STANDARD_ID};
use chrono::{DateTime, Local};
use std::fmt::Write as _;
use std::fs::File;
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::Path;

/// Application line written into the header
const APPLICATION: &str = concat!("AutoLens  v", env!("CARGO_PKG_VERSION"));

/// Streaming ASC writer
pub struct AscWriter<W: Write> {
    out: W,
    frames: usize,
}

impl<W: Write> AscWriter<W> {
    /// Write the header block and return the writer
    pub fn new(mut out: W, started: DateTime<Local>) -> std::io::Result<Self> {
        writeln!(out, "date {}", started.format("%a %b %d %I:%M:%S%.3f %P %Y"))?;
        writeln!(out, "base hex  timestamps absolute")?;
        writeln!(out, "no internal events logged")?;
        writeln!(out, "// version 9.0.0")?;
        writeln!(out, "// Application: {}", APPLICATION)?;
        writeln!(out, "Begin Triggerblock")?;
        Ok(Self { out, frames: 0 })
    }

    pub fn write_frame(&mut self, frame: &CanFrame) -> std::io::Result<()> {
        writeln!(self.out, "{}", format_frame_line(frame))?;
        self.frames += 1;
        Ok(())
    }

    /// Close the trigger block; returns the number of frame lines written
    pub fn finish(mut self) -> std::io::Result<usize> {
        writeln!(self.out, "End TriggerBlock")?;
        self.out.flush()?;
        Ok(self.frames)
    }
}

/// Write `frames` to an ASC file
pub fn write_asc_file(path: &Path, frames: &[CanFrame]) -> Result<usize> {
    let write = || -> std::io::Result<usize> {
        let file = File::create(path)?;
        let mut writer = AscWriter::new(BufWriter::new(file), Local::now())?;
        for frame in frames {
            writer.write_frame(frame)?;
        }
        writer.finish()
    };
    let written = write().map_err(|e| EngineError::write(path.display(), e.to_string()))?;
    log::info!("Wrote {} frames to ASC file {:?}", written, path);
    Ok(written)
}

/// One frame as an ASC line, without the newline
pub fn format_frame_line(frame: &CanFrame) -> String {
    let seconds = frame.timestamp_ns as f64 / 1e9;
    let id = if frame.is_extended {
        format!("{:08X}x", frame.id)
    } else {
        format!("{:03X}", frame.id)
    };
    let dir = if frame.is_tx_echo { "Tx" } else { "Rx" };
    let mut line = format!("   {:>12.6} {}  {}  {:<4}   ", seconds, frame.channel, id, dir);

    if frame.is_error_frame {
        line.push_str("ErrorFrame");
    } else if frame.is_remote_frame {
        let _ = write!(line, "r {}", frame.dlc);
    } else if frame.is_fd {
        let _ = write!(line, "CANFD {} {}", frame.dlc, hex_bytes(frame.payload()));
        if frame.brs {
            line.push_str("  BRS");
        }
        if frame.esi {
            line.push_str(" ESI");
        }
    } else {
        let _ = write!(line, "d {} {}", frame.dlc, hex_bytes(frame.payload()));
    }
    line
}

fn hex_bytes(bytes: &[u8]) -> String {
    let mut text = String::with_capacity(bytes.len() * 3);
    for (i, b) in bytes.iter().enumerate() {
        if i > 0 {
            text.push(' ');
        }
        let _ = write!(text, "{:02X}", b);
    }
    text
}

/// ASC file parser
pub struct AscParser;

impl AscParser {
    /// Open an ASC file and return an iterator over its frames
    pub fn parse(path: &Path) -> Result<AscFrameIterator<BufReader<File>>> {
        log::info!("Parsing ASC file: {:?}", path);

        if !path.exists() {
            return Err(EngineError::FileNotFound(path.display().to_string()));
        }
        let file = File::open(path)?;
        Ok(AscFrameIterator::new(BufReader::new(file)))
    }
}

/// Iterator over the frames of an ASC stream
pub struct AscFrameIterator<R: BufRead> {
    reader: R,
    line: Vec<u8>,
    line_number: usize,
    skipped: usize,
    done: bool,
}

impl<R: BufRead> AscFrameIterator<R> {
    pub fn new(reader: R) -> Self {
        Self {
            reader,
            line: Vec::with_capacity(256),
            line_number: 0,
            skipped: 0,
            done: false,
        }
    }

    /// Non-empty lines that were neither metadata nor a frame
    pub fn skipped_lines(&self) -> usize {
        self.skipped
    }
}

impl<R: BufRead> Iterator for AscFrameIterator<R> {
    type Item = Result<CanFrame>;

    fn next(&mut self) -> Option<Self::Item> {
        while !self.done {
            self.line.clear();
            match self.reader.read_until(b'\n', &mut self.line) {
                Ok(0) => {
                    self.done = true;
                    if self.skipped > 0 {
                        log::debug!("ASC: skipped {} unrecognised lines", self.skipped);
                    }
                }
                Ok(_) => {
                    self.line_number += 1;
                    let text = String::from_utf8_lossy(&self.line);
                    let trimmed = text.trim();
                    if trimmed.is_empty() || is_metadata(trimmed) {
                        continue;
                    }
                    match parse_frame_line(trimmed) {
                        Some(frame) => return Some(Ok(frame)),
                        None => {
                            log::trace!("ASC line {} skipped: {}", self.line_number, trimmed);
                            self.skipped += 1;
                        }
                    }
                }
                Err(e) => {
                    self.done = true;
                    return Some(Err(e.into()));
                }
            }
        }
        None
    }
}

impl LogFileParser for AscFrameIterator<BufReader<File>> {
    fn parse(path: &Path) -> Result<Self> {
        AscParser::parse(path)
    }
}

fn is_metadata(line: &str) -> bool {
    let lower = line.to_ascii_lowercase();
    lower.starts_with("//")
        || lower.starts_with("date ")
        || lower.starts_with("base ")
        || lower.starts_with("no internal events")
        || lower.starts_with("begin triggerblock")
        || lower.starts_with("end triggerblock")
        || lower.starts_with("begin trigger block")
        || lower.starts_with("end trigger block")
}

/// Parse one frame line; `None` for anything that is not a frame
pub fn parse_frame_line(line: &str) -> Option<CanFrame> {
    let tokens: Vec<&str> = line.split_whitespace().collect();
    if tokens.len() < 5 {
        return None;
    }

    let seconds: f64 = tokens[0].parse().ok()?;
    if !seconds.is_finite() || seconds < 0.0 {
        return None;
    }
    let (id, extended) = parse_id(tokens[2])?;
    let tx = match tokens[3].to_ascii_lowercase().as_str() {
        "rx" => false,
        "tx" => true,
        _ => return None,
    };

    let mut frame = CanFrame {
        id,
        is_extended: extended || id > MAX_STANDARD_ID,
        is_tx_echo: tx,
        channel: parse_channel(tokens[1]),
        timestamp_ns: (seconds * 1e9).round() as u64,
        ..CanFrame::default()
    };

    let kind = tokens[4].to_ascii_lowercase();
    let rest = &tokens[5..];
    match kind.as_str() {
        "errorframe" | "error" => {
            frame.is_error_frame = true;
        }
        "r" => {
            frame.is_remote_frame = true;
            frame.dlc = rest.first().and_then(|t| parse_dlc(t)).unwrap_or(0).min(15) as u8;
        }
        "canfd" | "fd" => {
            let declared = rest.first().and_then(|t| parse_dlc(t))?;
            let dlc = if declared > 15 {
                length_to_dlc(declared as usize)
            } else {
                declared as u8
            };
            let count = read_bytes(&rest[1..], MAX_DATA_LEN, &mut frame.data);
            frame.is_fd = true;
            frame.dlc = if count == dlc_to_length(dlc) {
                dlc
            } else {
                length_to_dlc(count)
            };
            for flag in &rest[1 + count..] {
                match flag.to_ascii_uppercase().as_str() {
                    "BRS" => frame.brs = true,
                    "ESI" => frame.esi = true,
                    _ => {}
                }
            }
        }
        "d" => {
            let dlc = rest.first().and_then(|t| parse_dlc(t))?.min(8) as usize;
            let count = read_bytes(&rest[1..], dlc, &mut frame.data);
            frame.dlc = count.min(dlc) as u8;
        }
        _ => return None,
    }
    Some(frame)
}

/// Accepts `18DB33F1x`, `0C4h`, `0x0C4` and naked hex
fn parse_id(token: &str) -> Option<(u32, bool)> {
    let lower = token.to_ascii_lowercase();
    let (text, extended) = match lower.strip_suffix('x') {
        Some(stripped) => (stripped, true),
        None => (lower.as_str(), false),
    };
    let text = text.strip_suffix('h').unwrap_or(text);
    let text = text.strip_prefix("0x").unwrap_or(text);
    let id = u32::from_str_radix(text, 16).ok()?;
    (id <= MAX_EXTENDED_ID).then_some((id, extended))
}

/// Digits only, 1..=255, else channel 1
fn parse_channel(token: &str) -> u8 {
    let digits: String = token.chars().filter(|c| c.is_ascii_digit()).collect();
    match digits.parse::<u32>() {
        Ok(n) if (1..=255).contains(&n) => n as u8,
        _ => 1,
    }
}

/// DLC tokens are decimal, with hex as a fallback (`A` to `F`)
fn parse_dlc(token: &str) -> Option<u32> {
    token
        .parse::<u32>()
        .ok()
        .or_else(|| u32::from_str_radix(token, 16).ok())
}

/// Read up to `max` hex byte tokens into `data`; stops at the first non-byte
fn read_bytes(tokens: &[&str], max: usize, data: &mut [u8; MAX_DATA_LEN]) -> usize {
    let mut count = 0;
    for token in tokens.iter().take(max.min(MAX_DATA_LEN)) {
        if token.len() > 2 {
            break;
        }
        match u8::from_str_radix(token, 16) {
            Ok(b) => {
                data[count] = b;
                count += 1;
            }
            Err(_) => break,
        }
    }
    count
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    fn read_all(text: &str) -> Vec<CanFrame> {
        AscFrameIterator::new(Cursor::new(text.as_bytes()))
            .collect::<Result<Vec<_>>>()
            .unwrap()
    }

    #[test]
    fn test_extended_tx_line() {
        let mut frame = CanFrame::classic(0x18DB33F1, &[1, 2, 3, 4])
            .on_channel(2)
            .at(1_234_567_000);
        frame.is_tx_echo = true;

        let line = format_frame_line(&frame);
        let tokens: Vec<&str> = line.split_whitespace().collect();
        assert_eq!(
            tokens,
            vec!["1.234567", "2", "18DB33F1x", "Tx", "d", "4", "01", "02", "03", "04"]
        );
        assert!(line.starts_with("       1.234567 2  18DB33F1x  Tx  "));
    }

    #[test]
    fn test_special_line_shapes() {
        let err = format_frame_line(&CanFrame::error_frame(1, 30_000_000));
        assert!(err.ends_with("ErrorFrame"));

        let mut remote = CanFrame::classic(0x100, &[]);
        remote.is_remote_frame = true;
        remote.dlc = 8;
        assert!(format_frame_line(&remote).ends_with("Rx     r 8"));

        let fd = CanFrame::fd(0x0C4, &[0xAA; 12], true);
        let line = format_frame_line(&fd);
        assert!(line.contains("CANFD 9 AA AA"));
        assert!(line.ends_with("AA  BRS"));
    }

    #[test]
    fn test_reader_skips_metadata_and_garbage() {
        let text = "\
date Tue Mar 04 10:11:12.000 am 2025
base hex  timestamps absolute
no internal events logged
// version 9.0.0
Begin Triggerblock

   0.010000 1  0C4  Rx   d 3 A0 0F 54
   0.020000 x  7DFh  Rx   d 2 02 01
   0.025000 1  100  Rx   Statistic: D 3 R 0
   0.030000 2  18DB33F1x  Tx   CANFD 12 01 02 03 04 05 06 07 08 09 0A 0B 0C  BRS
   0.040000 1  200  Rx   r 4
   0.050000 1  0  Rx   ErrorFrame
   garbage line here
End TriggerBlock
";
        let frames = read_all(text);
        assert_eq!(frames.len(), 5);

        assert_eq!(frames[0].id, 0x0C4);
        assert_eq!(frames[0].payload(), &[0xA0, 0x0F, 0x54]);
        assert_eq!(frames[0].timestamp_ns, 10_000_000);

        assert_eq!(frames[1].id, 0x7DF);
        assert_eq!(frames[1].channel, 1);

        let fd = &frames[2];
        assert!(fd.is_fd && fd.brs && fd.is_extended && fd.is_tx_echo);
        assert_eq!(fd.dlc, 9);
        assert_eq!(fd.data_len(), 12);
        assert_eq!(fd.channel, 2);

        assert!(frames[3].is_remote_frame);
        assert_eq!(frames[3].dlc, 4);
        assert!(frames[4].is_error_frame);
    }

    #[test]
    fn test_reader_promotes_large_ids_and_clamps() {
        let frames = read_all(
            "   0.000001 300  1ABCDE  Rx   d 12 01 02\n   0.000002 1  0x123  Rx   d 8 01 02 03 04 05 06 07 08 09\n",
        );
        assert!(frames[0].is_extended);
        assert_eq!(frames[0].id, 0x1ABCDE);
        assert_eq!(frames[0].channel, 1);
        assert_eq!(frames[0].dlc, 2);
        assert_eq!(frames[0].timestamp_ns, 1_000);

        assert_eq!(frames[1].id, 0x123);
        assert_eq!(frames[1].dlc, 8);
    }

    #[test]
    fn test_short_fd_payload_adjusts_dlc() {
        let frames = read_all("   0.1 1  100  Rx   CANFD F 01 02 03\n");
        assert_eq!(frames[0].dlc, 3);
        assert!(!frames[0].brs);
    }
}
