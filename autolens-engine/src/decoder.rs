//! Frame decoder
//!
//! Turns a raw [`CanFrame`] into display-ready signal values using a
//! [`SignalDatabase`]. The decoder owns the database it decodes against;
//! the engine swaps in a new merged database whenever the channel setup
//! changes.

use crate::signals::codec;
use crate::signals::{DbcLoad, MessageDefinition, MuxIndicator, SignalDatabase, SignalDefinition};
use crate::types::{CanFrame, DecodedSignal, Result};
use std::path::Path;

/// Significant digits used for physical values
pub const VALUE_DIGITS: usize = 8;

/// A frame decoded against its message definition
#[derive(Debug, Clone, PartialEq)]
pub struct DecodedMessage {
    /// Message name from the DBC
    pub name: String,
    /// Decoded signals in declaration order
    pub signals: Vec<DecodedSignal>,
    /// Raw selector value if the message has a selector
    pub multiplexer_value: Option<u64>,
}

/// Decoder holding the active signal database
#[derive(Debug, Default, Clone)]
pub struct Decoder {
    signal_db: SignalDatabase,
}

impl Decoder {
    /// Create a decoder with an empty database
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a decoder around an existing database
    pub fn with_database(signal_db: SignalDatabase) -> Self {
        Self { signal_db }
    }

    /// Load a DBC file and merge its messages into the database
    ///
    /// # Arguments
    /// * `path` - Path to the DBC file
    ///
    /// # Returns
    /// The parse result, so callers can report skipped lines
    ///
    /// # Example
    /// ```no_run
    /// use autolens_engine::Decoder;
    /// use std::path::Path;
    ///
    /// let mut decoder = Decoder::new();
    /// let load = decoder.add_dbc(Path::new("powertrain.dbc")).unwrap();
    /// println!("{} issues", load.issues.len());
    /// ```
    pub fn add_dbc(&mut self, path: &Path) -> Result<DbcLoad> {
        log::info!("Loading DBC file: {:?}", path);
        let load = crate::signals::parse_dbc_file(path)?;
        self.signal_db.merge(&load.database);
        log::info!("DBC file loaded successfully: {:?}", path);
        Ok(load)
    }

    /// Replace the database
    pub fn set_database(&mut self, signal_db: SignalDatabase) {
        self.signal_db = signal_db;
    }

    /// The active database
    pub fn database(&self) -> &SignalDatabase {
        &self.signal_db
    }

    /// Decode one frame
    ///
    /// Returns `None` for frames without a message definition.
    pub fn decode(&self, frame: &CanFrame) -> Option<DecodedMessage> {
        decode_frame(frame, &self.signal_db)
    }
}

/// Decode a frame against a database
///
/// The selector is evaluated first; plain signals are always emitted and
/// multiplexed signals only when their value matches the selector. Without a
/// selector, multiplexed signals are emitted unconditionally.
pub fn decode_frame(frame: &CanFrame, db: &SignalDatabase) -> Option<DecodedMessage> {
    if frame.is_error_frame || frame.is_remote_frame {
        return None;
    }
    let message = db.message_by_id(frame.id)?;
    Some(decode_message(frame.payload(), message))
}

/// Decode a payload against one message definition
pub fn decode_message(data: &[u8], message: &MessageDefinition) -> DecodedMessage {
    let multiplexer_value = message
        .selector()
        .map(|selector| codec::extract_bits(selector, data));

    let signals = message
        .signals
        .iter()
        .filter(|signal| match (signal.mux, multiplexer_value) {
            (MuxIndicator::Multiplexed(value), Some(active)) => value == active,
            _ => true,
        })
        .map(|signal| decode_signal(data, signal))
        .collect();

    DecodedMessage {
        name: message.name.clone(),
        signals,
        multiplexer_value,
    }
}

/// Decode a single signal into its display form
pub fn decode_signal(data: &[u8], signal: &SignalDefinition) -> DecodedSignal {
    let bits = codec::extract_bits(signal, data);
    let raw = codec::extract(signal, data);
    let physical = codec::raw_bits_to_physical(signal, bits);

    let value_description = signal.value_descriptions.get(&raw).cloned();

    let mut value_text = format_significant(physical, VALUE_DIGITS);
    if !signal.unit.is_empty() {
        value_text.push(' ');
        value_text.push_str(&signal.unit);
    }
    if let Some(label) = &value_description {
        value_text.push_str(&format!(" ({})", label));
    }

    DecodedSignal {
        name: signal.name.clone(),
        physical,
        raw,
        value_text,
        raw_text: format!("0x{:X}", bits),
        unit: signal.unit.clone(),
        value_description,
    }
}

/// Format a value with `digits` significant digits, `%g` style
///
/// Scientific notation is used when the decimal exponent is below -4 or at
/// least `digits`; trailing zeros are removed.
///
/// # Example
/// ```
/// use autolens_engine::decoder::format_significant;
///
/// assert_eq!(format_significant(1000.0, 8), "1000");
/// assert_eq!(format_significant(-50.0, 8), "-50");
/// assert_eq!(format_significant(0.1 + 0.2, 8), "0.3");
/// assert_eq!(format_significant(1.5e9, 8), "1.5e+09");
/// ```
pub fn format_significant(value: f64, digits: usize) -> String {
    if value.is_nan() {
        return "nan".to_string();
    }
    if value.is_infinite() {
        return if value > 0.0 { "inf" } else { "-inf" }.to_string();
    }
    if value == 0.0 {
        return "0".to_string();
    }
    let digits = digits.max(1);

    // Rounded scientific form decides the exponent
    let sci = format!("{:.*e}", digits - 1, value);
    let (mantissa, exponent) = match sci.split_once('e') {
        Some((m, e)) => (m, e.parse::<i32>().unwrap_or(0)),
        None => (sci.as_str(), 0),
    };

    if exponent < -4 || exponent >= digits as i32 {
        let mantissa = trim_fraction(mantissa);
        let sign = if exponent < 0 { '-' } else { '+' };
        format!("{}e{}{:02}", mantissa, sign, exponent.abs())
    } else {
        let decimals = (digits as i32 - 1 - exponent).max(0) as usize;
        trim_fraction(&format!("{:.*}", decimals, value)).to_string()
    }
}

fn trim_fraction(text: &str) -> &str {
    if text.contains('.') {
        text.trim_end_matches('0').trim_end_matches('.')
    } else {
        text
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::signals::{ByteOrder, ValueType};

    fn engine_message() -> MessageDefinition {
        MessageDefinition {
            id: 0x0C4,
            is_extended: false,
            name: "EngineData".to_string(),
            dlc: 8,
            transmitter: "ECM".to_string(),
            signals: vec![
                SignalDefinition::new("EngineRPM", 0, 16)
                    .with_scaling(0.25, 0.0)
                    .with_unit("rpm"),
                SignalDefinition::new("ThrottlePos", 16, 8)
                    .with_scaling(0.5, 0.0)
                    .with_unit("%"),
            ],
        }
    }

    #[test]
    fn test_classic_decode() {
        let db = SignalDatabase::from_messages(vec![engine_message()]);
        let frame = CanFrame::classic(0x0C4, &[0xA0, 0x0F, 0x54, 0, 0, 0, 0, 0]);

        let decoded = decode_frame(&frame, &db).expect("known id");
        assert_eq!(decoded.name, "EngineData");
        assert_eq!(decoded.signals.len(), 2);
        assert_eq!(decoded.signals[0].value_text, "1000 rpm");
        assert_eq!(decoded.signals[0].raw_text, "0xFA0");
        assert_eq!(decoded.signals[1].value_text, "42 %");
        assert_eq!(decoded.signals[1].raw_text, "0x54");
    }

    #[test]
    fn test_unknown_id_is_undecoded() {
        let db = SignalDatabase::from_messages(vec![engine_message()]);
        assert!(decode_frame(&CanFrame::classic(0x123, &[0; 8]), &db).is_none());
    }

    #[test]
    fn test_value_label_and_signed_raw_text() {
        let mut msg = engine_message();
        msg.signals = vec![
            SignalDefinition::new("Gear", 0, 4).with_value_description(3, "Third"),
            SignalDefinition::new("Steer", 15, 16)
                .with_byte_order(ByteOrder::BigEndian)
                .with_value_type(ValueType::Signed)
                .with_scaling(0.1, 0.0)
                .with_unit("deg"),
        ];
        let decoded = decode_message(&[0x03, 0xFE, 0x0C, 0, 0, 0, 0, 0], &msg);
        assert_eq!(decoded.signals[0].value_text, "3 (Third)");
        assert_eq!(decoded.signals[1].raw, -500);
        assert_eq!(decoded.signals[1].raw_text, "0xFE0C");
        assert_eq!(decoded.signals[1].value_text, "-50 deg");
    }

    #[test]
    fn test_multiplex_selectivity() {
        let msg = MessageDefinition {
            id: 0x200,
            is_extended: false,
            name: "Mux".to_string(),
            dlc: 8,
            transmitter: String::new(),
            signals: vec![
                SignalDefinition::new("Mux", 0, 4).with_mux(MuxIndicator::Selector),
                SignalDefinition::new("Counter", 4, 4),
                SignalDefinition::new("Tmp1", 8, 8).with_mux(MuxIndicator::Multiplexed(1)),
                SignalDefinition::new("Tmp2", 8, 8).with_mux(MuxIndicator::Multiplexed(2)),
            ],
        };

        let names = |data: &[u8]| -> Vec<String> {
            decode_message(data, &msg)
                .signals
                .into_iter()
                .map(|s| s.name)
                .collect()
        };
        assert_eq!(names(&[0x02, 0x10]), vec!["Mux", "Counter", "Tmp2"]);
        assert_eq!(names(&[0x01, 0x10]), vec!["Mux", "Counter", "Tmp1"]);
        assert_eq!(names(&[0x05, 0x10]), vec!["Mux", "Counter"]);
    }

    #[test]
    fn test_format_significant() {
        assert_eq!(format_significant(0.0, 8), "0");
        assert_eq!(format_significant(42.0, 8), "42");
        assert_eq!(format_significant(3.14159265358979, 8), "3.1415927");
        assert_eq!(format_significant(12345678.0, 8), "12345678");
        assert_eq!(format_significant(123456789.0, 8), "1.2345679e+08");
        assert_eq!(format_significant(0.0001, 8), "0.0001");
        assert_eq!(format_significant(0.00001, 8), "1e-05");
        assert_eq!(format_significant(-0.25, 8), "-0.25");
    }
}
