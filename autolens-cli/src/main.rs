//! AutoLens command-line front end
//!
//! Drives the engine without a GUI:
//! - `decode`: import a trace, decode with DBCs, print rows or JSON lines
//! - `convert`: ASC/BLF/CSV conversion, several inputs in parallel
//! - `simulate`: capture from the Demo driver and save the trace
//! - `dbc`: DBC statistics and parse issues
//! - `summary`: frame counts per channel and id

use anyhow::{bail, Context, Result};
use autolens_engine::trace::{Column, TraceFilter};
use autolens_engine::{
    parse_dbc_file, read_trace, write_trace, Decoder, DisplayMode, Engine, SessionLog,
    SignalDatabase, SimulatedDriver, TraceEntry, MAX_CHANNELS,
};
use clap::{Parser, Subcommand, ValueEnum};
use log::{LevelFilter, Log};
use rayon::prelude::*;
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

mod config;
mod report;

use config::{CliConfig, OutputFormat};

/// AutoLens - CAN/CAN-FD bus analyzer
#[derive(Parser, Debug)]
#[command(name = "autolens")]
#[command(about = "Capture, decode and convert CAN/CAN-FD traces (ASC, BLF)", long_about = None)]
#[command(version)]
struct Args {
    /// Path to configuration file (default: ./autolens.toml when present)
    #[arg(short, long, value_name = "FILE", global = true)]
    config: Option<PathBuf>,

    /// Write a session log file into this directory
    #[arg(long, value_name = "DIR", global = true)]
    log_dir: Option<PathBuf>,

    /// Verbosity level (can be repeated: -v, -vv, -vvv)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    /// Suppress all output except errors
    #[arg(short, long, global = true)]
    quiet: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Import a trace and print decoded rows
    Decode {
        /// ASC or BLF trace file
        trace: PathBuf,
        /// DBC file(s), one per channel slot (can be repeated)
        #[arg(long, value_name = "FILE")]
        dbc: Vec<PathBuf>,
        /// Print one JSON object per row
        #[arg(long)]
        json: bool,
        /// Case-insensitive text filter over the visible columns
        #[arg(long, value_name = "TEXT")]
        filter: Option<String>,
        /// Sort rows by a column
        #[arg(long, value_enum)]
        sort: Option<SortColumn>,
        /// Sort descending
        #[arg(long, requires = "sort")]
        desc: bool,
        /// Keep only the latest frame per id/channel
        #[arg(long)]
        in_place: bool,
        /// Do not print signal rows
        #[arg(long)]
        no_signals: bool,
        /// Maximum number of rows to print
        #[arg(long, value_name = "COUNT")]
        max_rows: Option<usize>,
    },
    /// Convert traces between ASC, BLF and CSV
    Convert {
        /// Input trace files (ASC or BLF)
        #[arg(required = true)]
        inputs: Vec<PathBuf>,
        /// Output format (default from config)
        #[arg(long, value_enum)]
        to: Option<OutputFormat>,
        /// Output directory (default from config)
        #[arg(long, value_name = "DIR")]
        out_dir: Option<PathBuf>,
        /// DBC file(s) used for message names in CSV output
        #[arg(long, value_name = "FILE")]
        dbc: Vec<PathBuf>,
    },
    /// Capture traffic from the Demo driver and save it
    Simulate {
        /// Capture duration in seconds
        #[arg(short, long, default_value_t = 5.0)]
        duration: f64,
        /// DBC file(s) shaping the generated traffic
        #[arg(long, value_name = "FILE")]
        dbc: Vec<PathBuf>,
        /// Output file; extension picks the format
        #[arg(short, long, value_name = "FILE")]
        output: Option<PathBuf>,
    },
    /// Print DBC statistics and parse issues
    Dbc {
        /// DBC files
        #[arg(required = true)]
        files: Vec<PathBuf>,
    },
    /// Frame counts per channel and id
    Summary {
        /// ASC or BLF trace file
        trace: PathBuf,
        /// DBC file(s) used for message names
        #[arg(long, value_name = "FILE")]
        dbc: Vec<PathBuf>,
        /// Print JSON instead of a table
        #[arg(long)]
        json: bool,
    },
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum SortColumn {
    Time,
    Name,
    Id,
    Chn,
    Event,
    Dir,
    Dlc,
    Data,
}

impl From<SortColumn> for Column {
    fn from(column: SortColumn) -> Self {
        match column {
            SortColumn::Time => Column::Time,
            SortColumn::Name => Column::Name,
            SortColumn::Id => Column::Id,
            SortColumn::Chn => Column::Channel,
            SortColumn::Event => Column::EventType,
            SortColumn::Dir => Column::Direction,
            SortColumn::Dlc => Column::Dlc,
            SortColumn::Data => Column::Data,
        }
    }
}

fn main() -> Result<()> {
    let args = Args::parse();
    let config = config::resolve_config(args.config.as_deref())?;

    let log_dir = args.log_dir.clone().or_else(|| config.log.dir.clone());
    let session = match &log_dir {
        Some(dir) => Some(Arc::new(
            SessionLog::open(dir, autolens_engine::VERSION)
                .with_context(|| format!("Failed to open session log in {:?}", dir))?,
        )),
        None => None,
    };
    init_logging(args.verbose, args.quiet, session.clone())?;

    log::info!("AutoLens CLI v{}", env!("CARGO_PKG_VERSION"));
    log::info!("Using engine library v{}", autolens_engine::VERSION);

    let result = match args.command {
        Command::Decode {
            trace,
            dbc,
            json,
            filter,
            sort,
            desc,
            in_place,
            no_signals,
            max_rows,
        } => decode_command(
            &config,
            &trace,
            &dbc,
            DecodeOptions {
                json,
                filter,
                sort: sort.map(|s| (Column::from(s), !desc)),
                in_place: in_place || config.settings.trace.in_place,
                signals: !no_signals,
                max_rows,
            },
        ),
        Command::Convert {
            inputs,
            to,
            out_dir,
            dbc,
        } => convert_command(
            &inputs,
            to.unwrap_or(config.output.format),
            &out_dir.unwrap_or_else(|| config.output_dir()),
            &dbc,
        ),
        Command::Simulate {
            duration,
            dbc,
            output,
        } => simulate_command(&config, duration, &dbc, output, session.clone()),
        Command::Dbc { files } => dbc_command(&files),
        Command::Summary { trace, dbc, json } => summary_command(&trace, &dbc, json),
    };

    if let Err(e) = &result {
        log::error!("{:#}", e);
    }
    if let Some(session) = &session {
        log::logger().flush();
        session.finish();
    }
    result
}

struct DecodeOptions {
    json: bool,
    filter: Option<String>,
    sort: Option<(Column, bool)>,
    in_place: bool,
    signals: bool,
    max_rows: Option<usize>,
}

/// Engine over the Demo driver with DBCs bound to slots in order
fn offline_engine(config: &CliConfig, dbc: &[PathBuf]) -> Result<Engine> {
    if dbc.len() > MAX_CHANNELS {
        bail!("At most {} DBC files (one per channel slot)", MAX_CHANNELS);
    }
    let mut engine = Engine::with_driver(config.settings.clone(), Box::new(SimulatedDriver::new()));
    if dbc.is_empty() {
        return Ok(engine);
    }
    for (slot, path) in dbc.iter().enumerate() {
        let info = engine
            .preload_channel_dbc(slot, &path.to_string_lossy())
            .with_context(|| format!("Failed to load DBC {:?}", path))?;
        log::info!("CH{} DBC: {}", slot + 1, info);
    }
    // slots given on the command line replace the configured ones
    let mut configs = engine.channel_configs();
    for (slot, cfg) in configs.iter_mut().enumerate() {
        cfg.enabled = slot < dbc.len();
    }
    engine.apply_channel_configs(configs);
    Ok(engine)
}

fn decode_command(config: &CliConfig, trace: &Path, dbc: &[PathBuf], options: DecodeOptions) -> Result<()> {
    let mut engine = offline_engine(config, dbc)?;
    if options.in_place {
        engine.set_display_mode(DisplayMode::InPlace);
    }
    let imported = engine
        .import_trace(&trace.to_string_lossy(), false)
        .with_context(|| format!("Failed to import trace {:?}", trace))?;
    log::info!("{}", engine.status_text());

    let mut filter = TraceFilter::new();
    if let Some(text) = &options.filter {
        filter.set_filter_text(text.clone());
    }
    if let Some((column, ascending)) = options.sort {
        filter.sort_by_column(column, ascending);
    }
    let rows = filter.view(engine.model());
    let limit = options.max_rows.unwrap_or(usize::MAX);
    log::debug!("{} of {} imported rows pass the filter", rows.len(), imported);

    let stdout = io::stdout();
    let mut out = BufWriter::new(stdout.lock());
    for &row in rows.iter().take(limit) {
        let Some(entry) = engine.model().entry(row) else {
            continue;
        };
        if options.json {
            serde_json::to_writer(&mut out, entry)?;
            writeln!(out)?;
        } else {
            write_row(&mut out, entry, options.signals)?;
        }
    }
    out.flush()?;
    Ok(())
}

fn write_row(out: &mut impl Write, entry: &TraceEntry, signals: bool) -> io::Result<()> {
    writeln!(
        out,
        "{:>14}  {:<20} {:>10} {:>3}  {:<12} {:<2} {:>3}  {}",
        entry.time,
        entry.name,
        entry.id,
        entry.channel,
        entry.event_type,
        entry.direction,
        entry.dlc,
        entry.data
    )?;
    if signals {
        for signal in &entry.signals {
            writeln!(out, "{:>16}  {:<24} {:<20} {}", "", signal.name, signal.value, signal.raw)?;
        }
    }
    Ok(())
}

fn load_database(dbc: &[PathBuf]) -> Result<SignalDatabase> {
    let mut decoder = Decoder::new();
    for path in dbc {
        let load = decoder
            .add_dbc(path)
            .with_context(|| format!("Failed to load DBC {:?}", path))?;
        for issue in &load.issues {
            log::warn!("{:?}: {}", path, issue);
        }
    }
    Ok(decoder.database().clone())
}

fn convert_command(inputs: &[PathBuf], to: OutputFormat, out_dir: &Path, dbc: &[PathBuf]) -> Result<()> {
    let db = load_database(dbc)?;
    std::fs::create_dir_all(out_dir)
        .with_context(|| format!("Failed to create output directory {:?}", out_dir))?;

    let results: Vec<(PathBuf, Result<(PathBuf, usize)>)> = inputs
        .par_iter()
        .map(|input| (input.clone(), convert_one(input, to, out_dir, &db)))
        .collect();

    let mut failed = 0;
    for (input, result) in results {
        match result {
            Ok((output, frames)) => println!("✓ {:?} → {:?} ({} frames)", input, output, frames),
            Err(e) => {
                failed += 1;
                eprintln!("✗ {:?}: {:#}", input, e);
            }
        }
    }
    if failed > 0 {
        bail!("{} of {} conversions failed", failed, inputs.len());
    }
    Ok(())
}

fn convert_one(input: &Path, to: OutputFormat, out_dir: &Path, db: &SignalDatabase) -> Result<(PathBuf, usize)> {
    let frames = read_trace(input).with_context(|| format!("Failed to read {:?}", input))?;
    let stem = input
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| "trace".to_string());
    let output = out_dir.join(format!("{}.{}", stem, to.extension()));
    if output == input {
        bail!("Output would overwrite the input");
    }

    let entries: Vec<TraceEntry> = frames.into_iter().map(|f| TraceEntry::new(f, db)).collect();
    let (written, format) =
        write_trace(&output, &entries).with_context(|| format!("Failed to write {:?}", output))?;
    log::debug!("{:?}: {} records as {}", output, written, format.label());
    Ok((output, written))
}

fn simulate_command(
    config: &CliConfig,
    duration: f64,
    dbc: &[PathBuf],
    output: Option<PathBuf>,
    session: Option<Arc<SessionLog>>,
) -> Result<()> {
    if !(duration > 0.0 && duration.is_finite()) {
        bail!("Duration must be a positive number of seconds");
    }
    let mut engine = offline_engine(config, dbc)?;
    if let Some(session) = session {
        engine = engine.with_log_sink(session);
    }

    engine.start_init_sequence();
    if !engine.wait_for_init(Duration::from_secs(10)) {
        bail!("Engine startup did not complete");
    }
    engine.start().context("Failed to start measurement")?;
    log::info!("{}", engine.status_text());

    let end = Instant::now() + Duration::from_secs_f64(duration);
    while Instant::now() < end {
        engine.poll(Instant::now());
        std::thread::sleep(Duration::from_millis(10));
    }
    engine.stop();
    println!("{}", engine.status_text());

    let output = output.unwrap_or_else(|| {
        let name = format!(
            "capture_{}.{}",
            chrono::Local::now().format("%Y%m%d_%H%M%S"),
            config.output.format.extension()
        );
        config.output_dir().join(name)
    });
    if let Some(parent) = output.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create output directory {:?}", parent))?;
    }
    let saved = engine.save_trace(&output.to_string_lossy());
    println!("{}", engine.status_text());
    engine.shutdown();
    saved.with_context(|| format!("Failed to save {:?}", output))?;
    Ok(())
}

fn dbc_command(files: &[PathBuf]) -> Result<()> {
    for path in files {
        let load = parse_dbc_file(path).with_context(|| format!("Failed to load DBC {:?}", path))?;
        let stats = load.database.stats();
        println!("{}", path.display());
        println!("  Messages:    {}", stats.message_count);
        println!("  Signals:     {}", stats.signal_count);
        println!("  Multiplexed: {}", stats.multiplexed_count);
        if load.issues.is_empty() {
            println!("  No issues");
        } else {
            println!("  Issues:      {}", load.issues.len());
            for issue in &load.issues {
                println!("    {}", issue);
            }
        }
    }
    Ok(())
}

fn summary_command(trace: &Path, dbc: &[PathBuf], json: bool) -> Result<()> {
    let db = load_database(dbc)?;
    let frames = read_trace(trace).with_context(|| format!("Failed to read {:?}", trace))?;
    let summary = report::summarize(&trace.to_string_lossy(), &frames, &db);
    if json {
        println!("{}", serde_json::to_string_pretty(&summary)?);
    } else {
        print!("{}", report::render_text(&summary));
    }
    Ok(())
}

/// Console logger plus optional session log
struct CliLogger {
    console: env_logger::Logger,
    session: Option<Arc<SessionLog>>,
}

impl log::Log for CliLogger {
    fn enabled(&self, metadata: &log::Metadata) -> bool {
        self.console.enabled(metadata) || self.session.as_ref().is_some_and(|s| s.enabled(metadata))
    }

    fn log(&self, record: &log::Record) {
        self.console.log(record);
        if let Some(session) = &self.session {
            session.log(record);
        }
    }

    fn flush(&self) {
        self.console.flush();
        if let Some(session) = &self.session {
            session.flush();
        }
    }
}

/// Initialize logging based on verbosity level
fn init_logging(verbose: u8, quiet: bool, session: Option<Arc<SessionLog>>) -> Result<()> {
    use env_logger::Builder;

    let level = if quiet {
        LevelFilter::Error
    } else {
        match verbose {
            0 => LevelFilter::Info,
            1 => LevelFilter::Debug,
            _ => LevelFilter::Trace,
        }
    };

    let console = Builder::new()
        .filter_level(level)
        .format(|buf, record| {
            writeln!(
                buf,
                "[{} {}] {}",
                record.level(),
                record.target(),
                record.args()
            )
        })
        .build();

    let max_level = match &session {
        Some(_) => level.max(LevelFilter::Debug),
        None => level,
    };
    let logger = CliLogger { console, session };
    log::set_boxed_logger(Box::new(logger)).context("Logger already initialised")?;
    log::set_max_level(max_level);
    Ok(())
}
