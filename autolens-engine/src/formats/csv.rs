//! CSV trace export
//!
//! One header row, then one row per frame using the trace row's display
//! strings. Cells containing a comma or a double quote are quoted with
//! inner quotes doubled; nothing else is quoted.

use crate::trace::TraceEntry;
use crate::types::{EngineError, Result};
use std::fs::File;
use std::io::Write;
use std::path::Path;

pub const CSV_HEADER: [&str; 8] = ["Time(ms)", "Name", "ID", "Chn", "EventType", "Dir", "DLC", "Data"];

/// Write trace rows as CSV to any sink; returns the number of rows
pub fn write_csv<W: Write>(out: W, entries: &[TraceEntry]) -> std::result::Result<usize, csv::Error> {
    let mut writer = csv::WriterBuilder::new()
        .quote_style(csv::QuoteStyle::Necessary)
        .terminator(csv::Terminator::Any(b'\n'))
        .from_writer(out);

    writer.write_record(CSV_HEADER)?;
    for entry in entries {
        writer.write_record([
            entry.time.as_str(),
            entry.name.as_str(),
            entry.id.as_str(),
            entry.channel.as_str(),
            entry.event_type.as_str(),
            entry.direction.as_str(),
            entry.dlc.as_str(),
            entry.data.as_str(),
        ])?;
    }
    writer.flush()?;
    Ok(entries.len())
}

/// Write trace rows to a CSV file
pub fn write_csv_file(path: &Path, entries: &[TraceEntry]) -> Result<usize> {
    let file = File::create(path).map_err(|e| EngineError::write(path.display(), e.to_string()))?;
    let written = write_csv(file, entries).map_err(|e| EngineError::write(path.display(), e.to_string()))?;
    log::info!("Wrote {} rows to CSV file {:?}", written, path);
    Ok(written)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::signals::{MessageDefinition, SignalDatabase, SignalDefinition};
    use crate::types::CanFrame;

    #[test]
    fn test_header_and_rows() {
        let db = SignalDatabase::new();
        let entries = vec![TraceEntry::new(CanFrame::classic(0x0C4, &[0xA0, 0x0F]).at(1_500_000), &db)];
        let mut out = Vec::new();
        assert_eq!(write_csv(&mut out, &entries).unwrap(), 1);

        let text = String::from_utf8(out).unwrap();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines[0], "Time(ms),Name,ID,Chn,EventType,Dir,DLC,Data");
        assert_eq!(lines[1], "1.500000,,0C4h,1,CAN,Rx,2,A0 0F");
    }

    #[test]
    fn test_quoting_only_when_needed() {
        let db = SignalDatabase::from_messages(vec![MessageDefinition {
            id: 0x100,
            is_extended: false,
            name: "Odd,\"Name\"".to_string(),
            dlc: 1,
            transmitter: String::new(),
            signals: vec![SignalDefinition::new("S", 0, 8)],
        }]);
        let entries = vec![TraceEntry::new(CanFrame::classic(0x100, &[1]), &db)];
        let mut out = Vec::new();
        write_csv(&mut out, &entries).unwrap();

        let text = String::from_utf8(out).unwrap();
        assert!(text.contains(",\"Odd,\"\"Name\"\"\",100h,"));
    }
}
