//! Trace rows
//!
//! A [`TraceEntry`] holds a frame plus every display string the trace view
//! needs, formatted once when the row is built so reading a cell is a plain
//! field access.

use crate::decoder::{decode_frame, DecodedMessage};
use crate::signals::SignalDatabase;
use crate::types::CanFrame;
use serde::Serialize;
use std::fmt::Write as _;

/// Number of trace columns
pub const COLUMN_COUNT: usize = 8;

/// Trace columns in display order
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum Column {
    Time,
    Name,
    Id,
    Channel,
    EventType,
    Direction,
    Dlc,
    Data,
}

impl Column {
    pub const ALL: [Column; COLUMN_COUNT] = [
        Column::Time,
        Column::Name,
        Column::Id,
        Column::Channel,
        Column::EventType,
        Column::Direction,
        Column::Dlc,
        Column::Data,
    ];

    /// Column at a position, if any
    pub fn from_index(index: usize) -> Option<Column> {
        Self::ALL.get(index).copied()
    }

    pub fn index(self) -> usize {
        self as usize
    }

    /// Header label
    pub fn header(self) -> &'static str {
        match self {
            Column::Time => "Time (ms)",
            Column::Name => "Name",
            Column::Id => "ID",
            Column::Channel => "Chn",
            Column::EventType => "Event Type",
            Column::Direction => "Dir",
            Column::Dlc => "DLC",
            Column::Data => "Data",
        }
    }
}

/// One decoded signal shown as a child row
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SignalRow {
    /// Signal name
    pub name: String,
    /// Physical value with unit and label, e.g. `"1000 rpm"`
    pub value: String,
    /// Raw bit pattern, e.g. `"0xFA0"`
    pub raw: String,
}

/// One frame row with pre-formatted columns
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TraceEntry {
    /// The frame this row displays
    #[serde(skip)]
    pub frame: CanFrame,
    pub time: String,
    /// Message name, empty when the id is not in the database
    pub name: String,
    pub id: String,
    pub channel: String,
    pub event_type: String,
    pub direction: String,
    pub dlc: String,
    pub data: String,
    /// Decoded signals in declaration order
    pub signals: Vec<SignalRow>,
}

impl TraceEntry {
    /// Build a row, decoding the frame against `db`
    pub fn new(frame: CanFrame, db: &SignalDatabase) -> Self {
        let decoded = if db.is_empty() {
            None
        } else {
            decode_frame(&frame, db)
        };
        Self::with_decoded(frame, decoded)
    }

    /// Build a row from an already decoded frame
    pub fn with_decoded(frame: CanFrame, decoded: Option<DecodedMessage>) -> Self {
        let (name, signals) = match decoded {
            Some(message) => (
                message.name,
                message
                    .signals
                    .into_iter()
                    .map(|s| SignalRow {
                        name: s.name,
                        value: s.value_text,
                        raw: s.raw_text,
                    })
                    .collect(),
            ),
            None => (String::new(), Vec::new()),
        };

        Self {
            time: format!("{:.6}", frame.timestamp_ns as f64 / 1.0e6),
            name,
            id: format_id(frame.id, frame.is_extended),
            channel: frame.channel.to_string(),
            event_type: event_type(&frame).to_string(),
            direction: if frame.is_tx_echo { "Tx" } else { "Rx" }.to_string(),
            dlc: if frame.is_fd && frame.dlc > 8 {
                frame.data_len().to_string()
            } else {
                frame.dlc.to_string()
            },
            data: format_data(frame.payload()),
            signals,
            frame,
        }
    }

    /// Display text of a frame cell
    pub fn column_text(&self, column: Column) -> &str {
        match column {
            Column::Time => &self.time,
            Column::Name => &self.name,
            Column::Id => &self.id,
            Column::Channel => &self.channel,
            Column::EventType => &self.event_type,
            Column::Direction => &self.direction,
            Column::Dlc => &self.dlc,
            Column::Data => &self.data,
        }
    }

    /// True if the frame matched a database message
    pub fn is_decoded(&self) -> bool {
        !self.name.is_empty()
    }

    /// Identity used by in-place mode
    ///
    /// Id, channel and frame flags; payload bytes are not part of it.
    pub fn fingerprint(&self) -> u64 {
        let f = &self.frame;
        let flags = (f.is_extended as u64)
            | (f.is_fd as u64) << 1
            | (f.is_remote_frame as u64) << 2
            | (f.is_error_frame as u64) << 3
            | (f.is_tx_echo as u64) << 4;
        (f.id as u64) | (f.channel as u64) << 32 | flags << 40
    }
}

impl SignalRow {
    /// Display text of a signal cell; only Name, ID and Data are populated
    pub fn column_text(&self, column: Column) -> &str {
        match column {
            Column::Name => &self.name,
            Column::Id => &self.value,
            Column::Data => &self.raw,
            _ => "",
        }
    }
}

/// Event type label: Error Frame > Remote Frame > CAN FD BRS / CAN FD > CAN
pub fn event_type(frame: &CanFrame) -> &'static str {
    if frame.is_error_frame {
        "Error Frame"
    } else if frame.is_remote_frame {
        "Remote Frame"
    } else if frame.is_fd {
        if frame.brs {
            "CAN FD BRS"
        } else {
            "CAN FD"
        }
    } else {
        "CAN"
    }
}

/// Identifier in trace style: `0C4h` or `18DB33F1h`
pub fn format_id(id: u32, is_extended: bool) -> String {
    if is_extended {
        format!("{:08X}h", id)
    } else {
        format!("{:03X}h", id)
    }
}

/// Bytes as uppercase hex separated by spaces
pub fn format_data(bytes: &[u8]) -> String {
    let mut text = String::with_capacity(bytes.len() * 3);
    for (i, b) in bytes.iter().enumerate() {
        if i > 0 {
            text.push(' ');
        }
        let _ = write!(text, "{:02X}", b);
    }
    text
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::signals::{MessageDefinition, SignalDefinition};

    #[test]
    fn test_undecoded_row() {
        let frame = CanFrame::classic(0x0C4, &[0xA0, 0x0F, 0x54])
            .on_channel(2)
            .at(1_234_567_000);
        let entry = TraceEntry::new(frame, &SignalDatabase::new());

        assert_eq!(entry.time, "1234.567000");
        assert_eq!(entry.id, "0C4h");
        assert_eq!(entry.channel, "2");
        assert_eq!(entry.event_type, "CAN");
        assert_eq!(entry.direction, "Rx");
        assert_eq!(entry.dlc, "3");
        assert_eq!(entry.data, "A0 0F 54");
        assert!(!entry.is_decoded());
        assert!(entry.signals.is_empty());
    }

    #[test]
    fn test_decoded_row_and_signal_cells() {
        let db = SignalDatabase::from_messages(vec![MessageDefinition {
            id: 0x0C4,
            is_extended: false,
            name: "EngineData".to_string(),
            dlc: 8,
            transmitter: String::new(),
            signals: vec![SignalDefinition::new("EngineRPM", 0, 16)
                .with_scaling(0.25, 0.0)
                .with_unit("rpm")],
        }]);
        let entry = TraceEntry::new(CanFrame::classic(0x0C4, &[0xA0, 0x0F, 0, 0, 0, 0, 0, 0]), &db);

        assert_eq!(entry.column_text(Column::Name), "EngineData");
        let signal = &entry.signals[0];
        assert_eq!(signal.column_text(Column::Name), "EngineRPM");
        assert_eq!(signal.column_text(Column::Id), "1000 rpm");
        assert_eq!(signal.column_text(Column::Data), "0xFA0");
        assert_eq!(signal.column_text(Column::Time), "");
    }

    #[test]
    fn test_fd_and_special_frames() {
        let payload = [0x11u8; 20];
        let fd = TraceEntry::new(CanFrame::fd(0x18DB33F1, &payload, true).on_channel(1), &SignalDatabase::new());
        assert_eq!(fd.id, "18DB33F1h");
        assert_eq!(fd.event_type, "CAN FD BRS");
        assert_eq!(fd.dlc, "20");

        let err = TraceEntry::new(CanFrame::error_frame(1, 0), &SignalDatabase::new());
        assert_eq!(err.event_type, "Error Frame");
        assert_eq!(err.data, "");

        let mut echo = CanFrame::classic(0x100, &[1]);
        echo.is_tx_echo = true;
        assert_eq!(TraceEntry::new(echo, &SignalDatabase::new()).direction, "Tx");
    }

    #[test]
    fn test_fingerprint_ignores_payload() {
        let db = SignalDatabase::new();
        let a = TraceEntry::new(CanFrame::classic(0x100, &[1]), &db);
        let b = TraceEntry::new(CanFrame::classic(0x100, &[2, 3]), &db);
        let c = TraceEntry::new(CanFrame::classic(0x100, &[1]).on_channel(2), &db);
        assert_eq!(a.fingerprint(), b.fingerprint());
        assert_ne!(a.fingerprint(), c.fingerprint());
    }

    #[test]
    fn test_headers() {
        let headers: Vec<_> = Column::ALL.iter().map(|c| c.header()).collect();
        assert_eq!(
            headers,
            vec!["Time (ms)", "Name", "ID", "Chn", "Event Type", "Dir", "DLC", "Data"]
        );
        assert_eq!(Column::from_index(7), Some(Column::Data));
        assert_eq!(Column::from_index(8), None);
    }
}
