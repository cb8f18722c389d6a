//! Trace file formats (ASC, BLF, CSV)
//!
//! ASC and BLF are read and written; CSV is export only. Readers follow
//! the iterator pattern: `parse(path)` validates the file and returns an
//! iterator over `Result<CanFrame>`.

use crate::trace::TraceEntry;
use crate::types::{CanFrame, EngineError, Result};
use std::path::Path;

pub mod asc;
pub mod blf;
pub mod csv;

pub use asc::{AscFrameIterator, AscParser, AscWriter};
pub use blf::{BlfFrameIterator, BlfParser, BlfWriter};

/// Common trait for all log file parsers
///
/// Each parser returns an iterator over CanFrame objects.
pub trait LogFileParser: Iterator<Item = Result<CanFrame>> + Sized {
    /// Parse a log file and return an iterator over CAN frames
    fn parse(path: &Path) -> Result<Self>;
}

/// Trace file formats known by extension
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TraceFormat {
    Asc,
    Blf,
    Csv,
}

impl TraceFormat {
    /// Format from the file extension, case-insensitive
    pub fn from_path(path: &Path) -> Option<TraceFormat> {
        let ext = path.extension()?.to_str()?.to_ascii_lowercase();
        match ext.as_str() {
            "asc" => Some(TraceFormat::Asc),
            "blf" => Some(TraceFormat::Blf),
            "csv" => Some(TraceFormat::Csv),
            _ => None,
        }
    }

    /// Upper-case extension, e.g. `"BLF"`
    pub fn label(self) -> &'static str {
        match self {
            TraceFormat::Asc => "ASC",
            TraceFormat::Blf => "BLF",
            TraceFormat::Csv => "CSV",
        }
    }

    pub fn can_read(self) -> bool {
        !matches!(self, TraceFormat::Csv)
    }
}

/// Read every frame of an ASC or BLF file
///
/// Fails on the first corrupt record and when the file holds no frames.
pub fn read_trace(path: &Path) -> Result<Vec<CanFrame>> {
    if !path.exists() {
        return Err(EngineError::FileNotFound(path.display().to_string()));
    }
    let frames = match TraceFormat::from_path(path) {
        Some(TraceFormat::Asc) => collect_frames::<AscFrameIterator<_>>(path)?,
        Some(TraceFormat::Blf) => collect_frames::<BlfFrameIterator<_>>(path)?,
        _ => {
            return Err(EngineError::UnsupportedFormat(
                path.extension()
                    .map(|e| e.to_string_lossy().into_owned())
                    .unwrap_or_else(|| path.display().to_string()),
            ))
        }
    };

    if frames.is_empty() {
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        return Err(EngineError::parse(
            path.display(),
            format!("No CAN frames found in {} file: {}", format_label(path), name),
        ));
    }
    log::info!("Read {} frames from {:?}", frames.len(), path);
    Ok(frames)
}

fn collect_frames<P: LogFileParser>(path: &Path) -> Result<Vec<CanFrame>> {
    P::parse(path)?.collect()
}

fn format_label(path: &Path) -> &'static str {
    TraceFormat::from_path(path).map(TraceFormat::label).unwrap_or("trace")
}

/// Write trace rows in the format given by the extension
///
/// Unknown or missing extensions are written as CSV. Returns the number
/// of records written and the format used.
pub fn write_trace(path: &Path, entries: &[TraceEntry]) -> Result<(usize, TraceFormat)> {
    let format = TraceFormat::from_path(path).unwrap_or(TraceFormat::Csv);
    let written = match format {
        TraceFormat::Asc | TraceFormat::Blf => {
            let frames: Vec<CanFrame> = entries.iter().map(|e| e.frame).collect();
            write_frames(path, format, &frames)?
        }
        TraceFormat::Csv => csv::write_csv_file(path, entries)?,
    };
    Ok((written, format))
}

/// Write bare frames as ASC or BLF
pub fn write_frames(path: &Path, format: TraceFormat, frames: &[CanFrame]) -> Result<usize> {
    match format {
        TraceFormat::Asc => asc::write_asc_file(path, frames),
        TraceFormat::Blf => blf::write_blf_file(path, frames),
        TraceFormat::Csv => Err(EngineError::UnsupportedFormat(
            "CSV export needs trace rows".to_string(),
        )),
    }
}
