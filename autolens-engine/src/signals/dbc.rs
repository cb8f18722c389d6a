//! DBC file parser
//!
//! Parses Vector DBC files into a [`SignalDatabase`]. Parsing is tolerant:
//! malformed lines are reported with their line number and skipped, and
//! signals that cannot be decoded safely (bit range past the message size,
//! duplicate names, a second selector) are reported and dropped. A file with
//! nothing usable yields an empty database, not an error.
//!
//! Recognised sections: `BO_`, `SG_`, `VAL_`, `SIG_VALTYPE_` and
//! `BA_ "GenSigStartValue"`. Everything else is skipped.

use crate::signals::codec;
use crate::signals::database::{
    ByteOrder, MessageDefinition, MuxIndicator, SignalDatabase, SignalDefinition, ValueType,
};
use crate::types::{EngineError, Result, MAX_EXTENDED_ID};
use std::collections::HashSet;
use std::fmt;
use std::path::Path;

/// DBC marker bit for extended identifiers in `BO_` lines
const DBC_EXTENDED_FLAG: u32 = 0x8000_0000;

/// Pseudo-message some tools use to park unassigned signals
const INDEPENDENT_SIG_MSG: &str = "VECTOR__INDEPENDENT_SIG_MSG";

/// A problem found while parsing
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParseIssue {
    /// 1-based line number
    pub line: usize,
    /// What went wrong
    pub message: String,
}

impl fmt::Display for ParseIssue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "line {}: {}", self.line, self.message)
    }
}

/// Result of parsing a DBC document
#[derive(Debug, Clone, Default)]
pub struct DbcLoad {
    /// Parsed database, already indexed
    pub database: SignalDatabase,
    /// Lines that were skipped and signals that were dropped
    pub issues: Vec<ParseIssue>,
}

/// Parse a DBC file from disk
///
/// Non-UTF-8 files are read as Latin-1.
///
/// # Errors
/// Only I/O failures are errors; a missing file is `FileNotFound`.
pub fn parse_dbc_file(path: &Path) -> Result<DbcLoad> {
    log::info!("Parsing DBC file: {:?}", path);

    let bytes = std::fs::read(path).map_err(|e| match e.kind() {
        std::io::ErrorKind::NotFound => EngineError::FileNotFound(path.display().to_string()),
        _ => EngineError::parse(path.display(), e.to_string()),
    })?;

    // Try UTF-8 first, then fall back to Latin-1
    let content = match String::from_utf8(bytes) {
        Ok(text) => text,
        Err(e) => {
            log::warn!("DBC file is not UTF-8, trying Latin-1 encoding");
            e.into_bytes().iter().map(|&b| b as char).collect()
        }
    };

    let load = parse_dbc_str(&content);
    log::info!(
        "Parsed {} messages, {} signals from {:?} ({} issues)",
        load.database.message_count(),
        load.database.total_signal_count(),
        path,
        load.issues.len()
    );
    for issue in &load.issues {
        log::debug!("{:?}: {}", path, issue);
    }
    Ok(load)
}

/// Parse DBC text
pub fn parse_dbc_str(content: &str) -> DbcLoad {
    let mut parser = Parser::default();
    let mut in_multiline = false;

    for (idx, raw_line) in content.lines().enumerate() {
        let line_no = idx + 1;
        let line = raw_line.trim();

        // Continuation of a quoted string spanning lines (CM_, BA_DEF_ ...)
        if in_multiline {
            if line.matches('"').count() % 2 == 1 {
                in_multiline = false;
            }
            continue;
        }

        if line.is_empty() || line.starts_with("//") {
            continue;
        }

        let keyword = line.split_whitespace().next().unwrap_or("");
        match keyword {
            "BO_" => parser.message_line(line_no, line),
            "SG_" => parser.signal_line(line_no, line),
            "VAL_" => parser.value_description_line(line_no, line),
            "SIG_VALTYPE_" => parser.value_type_line(line_no, line),
            "BA_" => parser.attribute_line(line_no, line),
            _ => {
                if line.matches('"').count() % 2 == 1 {
                    in_multiline = true;
                }
            }
        }
    }

    parser.finish()
}

#[derive(Default)]
struct Parser {
    messages: Vec<MessageDefinition>,
    issues: Vec<ParseIssue>,
    /// True while the current BO_ is a pseudo message whose signals are ignored
    skipping_message: bool,
    /// Signal names of the current message
    current_names: HashSet<String>,
}

impl Parser {
    fn issue(&mut self, line: usize, message: impl Into<String>) {
        self.issues.push(ParseIssue {
            line,
            message: message.into(),
        });
    }

    /// `BO_ <id> <name>: <dlc> <transmitter>`
    fn message_line(&mut self, line_no: usize, line: &str) {
        self.current_names.clear();
        self.skipping_message = false;

        let rest = line["BO_".len()..].trim();
        let Some((head, tail)) = rest.split_once(':') else {
            self.skipping_message = true;
            self.issue(line_no, "BO_ line without ':'");
            return;
        };
        let mut head_tokens = head.split_whitespace();
        let raw_id = head_tokens.next().and_then(|t| t.parse::<u32>().ok());
        let name = head_tokens.next();
        let mut tail_tokens = tail.split_whitespace();
        let dlc = tail_tokens.next().and_then(|t| t.parse::<u8>().ok());
        let transmitter = tail_tokens.next().unwrap_or("").to_string();

        let (Some(raw_id), Some(name), Some(dlc)) = (raw_id, name, dlc) else {
            self.skipping_message = true;
            self.issue(line_no, format!("malformed BO_ line: {}", line));
            return;
        };

        if name == INDEPENDENT_SIG_MSG {
            self.skipping_message = true;
            return;
        }

        self.messages.push(MessageDefinition {
            id: raw_id & MAX_EXTENDED_ID,
            is_extended: raw_id & DBC_EXTENDED_FLAG != 0,
            name: name.to_string(),
            dlc,
            transmitter,
            signals: Vec::new(),
        });
    }

    /// `SG_ <name> [M|mN] : <start>|<len>@<order><sign> (<factor>,<offset>) [<min>|<max>] "<unit>" <receivers>`
    fn signal_line(&mut self, line_no: usize, line: &str) {
        if self.skipping_message {
            return;
        }
        if self.messages.is_empty() {
            self.issue(line_no, "SG_ outside of a BO_ block");
            return;
        }

        let signal = match parse_signal(line) {
            Ok(signal) => signal,
            Err(reason) => {
                self.issue(line_no, reason);
                return;
            }
        };

        let Some(message) = self.messages.last() else {
            return;
        };
        if codec::required_bytes(&signal) > message.dlc as usize {
            let msg = format!(
                "signal '{}' ({}|{}) exceeds {} byte message '{}', dropped",
                signal.name, signal.start_bit, signal.length, message.dlc, message.name
            );
            self.issue(line_no, msg);
            return;
        }
        if self.current_names.contains(&signal.name) {
            let msg = format!(
                "duplicate signal '{}' in message '{}', dropped",
                signal.name, message.name
            );
            self.issue(line_no, msg);
            return;
        }
        if signal.mux == MuxIndicator::Selector && message.selector().is_some() {
            let msg = format!(
                "second multiplex selector '{}' in message '{}', dropped",
                signal.name, message.name
            );
            self.issue(line_no, msg);
            return;
        }

        self.current_names.insert(signal.name.clone());
        if let Some(message) = self.messages.last_mut() {
            message.signals.push(signal);
        }
    }

    /// `VAL_ <id> <signal> <raw> "<label>" ... ;`
    fn value_description_line(&mut self, line_no: usize, line: &str) {
        let rest = line["VAL_".len()..].trim().trim_end_matches(';');
        let mut tokens = rest.splitn(3, char::is_whitespace);
        let id = tokens.next().and_then(|t| t.parse::<u32>().ok());
        let signal_name = tokens.next();
        let pairs = tokens.next().unwrap_or("");

        let (Some(id), Some(signal_name)) = (id, signal_name) else {
            // VAL_ of a value table (VAL_TABLE_ style) or garbage
            self.issue(line_no, format!("malformed VAL_ line: {}", line));
            return;
        };

        let descriptions = match parse_value_pairs(pairs) {
            Ok(d) => d,
            Err(reason) => {
                self.issue(line_no, reason);
                return;
            }
        };

        let found = match self.find_signal_mut(id, signal_name) {
            Some(signal) => {
                signal.value_descriptions.extend(descriptions);
                true
            }
            None => false,
        };
        if !found {
            let msg = format!(
                "VAL_ for unknown signal {} in 0x{:X}",
                signal_name,
                id & MAX_EXTENDED_ID
            );
            self.issue(line_no, msg);
        }
    }

    /// `SIG_VALTYPE_ <id> <signal> : <1|2>;`
    fn value_type_line(&mut self, line_no: usize, line: &str) {
        let rest = line["SIG_VALTYPE_".len()..].trim().trim_end_matches(';');
        let cleaned = rest.replace(':', " ");
        let tokens: Vec<&str> = cleaned.split_whitespace().collect();
        if tokens.len() < 3 {
            self.issue(line_no, format!("malformed SIG_VALTYPE_ line: {}", line));
            return;
        }
        let (Ok(id), Ok(kind)) = (tokens[0].parse::<u32>(), tokens[2].parse::<u8>()) else {
            self.issue(line_no, format!("malformed SIG_VALTYPE_ line: {}", line));
            return;
        };
        let (value_type, width) = match kind {
            1 => (ValueType::Float32, 32),
            2 => (ValueType::Float64, 64),
            _ => return,
        };

        let name = tokens[1];
        let outcome = match self.find_signal_mut(id, name) {
            Some(signal) if signal.length == width => {
                signal.value_type = value_type;
                None
            }
            Some(signal) => Some(format!(
                "signal '{}' is {} bits, cannot be float{}",
                signal.name, signal.length, width
            )),
            None => Some(format!("SIG_VALTYPE_ for unknown signal {}", name)),
        };
        if let Some(msg) = outcome {
            self.issue(line_no, msg);
        }
    }

    /// `BA_ "GenSigStartValue" SG_ <id> <signal> <raw>;`
    fn attribute_line(&mut self, line_no: usize, line: &str) {
        let rest = line["BA_".len()..].trim().trim_end_matches(';');
        let tokens: Vec<&str> = rest.split_whitespace().collect();
        if tokens.first() != Some(&"\"GenSigStartValue\"") {
            return;
        }
        if tokens.len() < 5 || tokens[1] != "SG_" {
            self.issue(line_no, format!("malformed GenSigStartValue: {}", line));
            return;
        }
        let (Ok(id), Ok(raw)) = (tokens[2].parse::<u32>(), tokens[4].parse::<f64>()) else {
            self.issue(line_no, format!("malformed GenSigStartValue: {}", line));
            return;
        };
        let name = tokens[3];
        if let Some(signal) = self.find_signal_mut(id, name) {
            signal.initial_value = if signal.value_type.is_float() {
                raw
            } else {
                raw * signal.factor + signal.offset
            };
        }
    }

    fn find_signal_mut(&mut self, raw_id: u32, name: &str) -> Option<&mut SignalDefinition> {
        let id = raw_id & MAX_EXTENDED_ID;
        self.messages
            .iter_mut()
            .rev()
            .find(|m| m.id == id)
            .and_then(|m| m.signals.iter_mut().find(|s| s.name == name))
    }

    fn finish(mut self) -> DbcLoad {
        // Multiplexed values must be producible by the selector
        let mut dropped = Vec::new();
        for message in &mut self.messages {
            let Some(limit) = message.selector().map(|s| max_raw(s.length)) else {
                continue;
            };
            message.signals.retain(|s| match s.mux {
                MuxIndicator::Multiplexed(v) if v > limit => {
                    dropped.push(format!(
                        "signal '{}' in '{}' uses mux value {} beyond selector range, dropped",
                        s.name, message.name, v
                    ));
                    false
                }
                _ => true,
            });
        }
        for message in dropped {
            self.issues.push(ParseIssue { line: 0, message });
        }

        DbcLoad {
            database: SignalDatabase::from_messages(self.messages),
            issues: self.issues,
        }
    }
}

fn max_raw(length: u16) -> u64 {
    if length >= 64 {
        u64::MAX
    } else {
        (1u64 << length) - 1
    }
}

fn parse_signal(line: &str) -> std::result::Result<SignalDefinition, String> {
    let rest = line["SG_".len()..].trim();
    let (head, body) = rest
        .split_once(':')
        .ok_or_else(|| format!("SG_ line without ':': {}", line))?;

    let mut head_tokens = head.split_whitespace();
    let name = head_tokens
        .next()
        .ok_or_else(|| "SG_ line without a name".to_string())?
        .to_string();
    let mux = match head_tokens.next() {
        None => MuxIndicator::Plain,
        Some("M") => MuxIndicator::Selector,
        Some(tok) if tok.starts_with('m') => {
            let digits: String = tok[1..].chars().take_while(|c| c.is_ascii_digit()).collect();
            let value = digits
                .parse::<u64>()
                .map_err(|_| format!("bad multiplex indicator '{}' on {}", tok, name))?;
            MuxIndicator::Multiplexed(value)
        }
        Some(tok) => return Err(format!("bad multiplex indicator '{}' on {}", tok, name)),
    };

    let body = body.trim();
    let layout = body
        .split_whitespace()
        .next()
        .ok_or_else(|| format!("signal '{}' has no bit layout", name))?;
    let (position, format) = layout
        .split_once('@')
        .ok_or_else(|| format!("signal '{}' layout '{}' lacks '@'", name, layout))?;
    let (start, length) = position
        .split_once('|')
        .ok_or_else(|| format!("signal '{}' layout '{}' lacks '|'", name, layout))?;
    let start_bit: u16 = start
        .parse()
        .map_err(|_| format!("signal '{}' has bad start bit '{}'", name, start))?;
    let length: u16 = length
        .parse()
        .map_err(|_| format!("signal '{}' has bad length '{}'", name, length))?;
    if length == 0 || length > 64 {
        return Err(format!("signal '{}' has unsupported length {}", name, length));
    }

    let mut format_chars = format.chars();
    let byte_order = match format_chars.next() {
        Some('1') => ByteOrder::LittleEndian,
        Some('0') => ByteOrder::BigEndian,
        _ => return Err(format!("signal '{}' has bad byte order in '{}'", name, layout)),
    };
    let value_type = match format_chars.next() {
        Some('+') => ValueType::Unsigned,
        Some('-') => ValueType::Signed,
        _ => return Err(format!("signal '{}' has bad sign in '{}'", name, layout)),
    };

    let (factor, offset) = delimited(body, '(', ')')
        .and_then(|s| s.split_once(','))
        .and_then(|(f, o)| Some((f.trim().parse::<f64>().ok()?, o.trim().parse::<f64>().ok()?)))
        .ok_or_else(|| format!("signal '{}' has bad (factor,offset)", name))?;
    let (min, max) = delimited(body, '[', ']')
        .and_then(|s| s.split_once('|'))
        .and_then(|(a, b)| Some((a.trim().parse::<f64>().ok()?, b.trim().parse::<f64>().ok()?)))
        .unwrap_or((0.0, 0.0));
    let unit = delimited(body, '"', '"').unwrap_or("").to_string();

    Ok(SignalDefinition {
        name,
        start_bit,
        length,
        byte_order,
        value_type,
        factor,
        offset,
        min,
        max,
        unit,
        value_descriptions: Default::default(),
        mux,
        initial_value: 0.0,
    })
}

/// Text between the first `open` and the next `close`
fn delimited(text: &str, open: char, close: char) -> Option<&str> {
    let start = text.find(open)? + open.len_utf8();
    let end = text[start..].find(close)? + start;
    Some(&text[start..end])
}

/// `0 "Off" 1 "On" 2 "Fault"`
fn parse_value_pairs(text: &str) -> std::result::Result<Vec<(i64, String)>, String> {
    let mut pairs = Vec::new();
    let mut rest = text.trim();
    while !rest.is_empty() {
        let (number, after) = rest
            .split_once(char::is_whitespace)
            .ok_or_else(|| format!("dangling value '{}' in VAL_", rest))?;
        let raw = number
            .parse::<f64>()
            .map_err(|_| format!("bad value '{}' in VAL_", number))? as i64;
        let after = after.trim_start();
        let label_body = after
            .strip_prefix('"')
            .ok_or_else(|| format!("missing label for value {} in VAL_", raw))?;
        let end = label_body
            .find('"')
            .ok_or_else(|| format!("unterminated label for value {} in VAL_", raw))?;
        pairs.push((raw, label_body[..end].to_string()));
        rest = label_body[end + 1..].trim_start();
    }
    Ok(pairs)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    const POWERTRAIN: &str = r#"VERSION ""

NS_ :
    CM_
    BA_DEF_

BS_:

BU_: ECM TCM

BO_ 196 EngineData: 8 ECM
 SG_ EngineRPM : 0|16@1+ (0.25,0) [0|16383.75] "rpm" TCM
 SG_ ThrottlePos : 16|8@1+ (0.5,0) [0|100] "%" TCM
 SG_ Gear : 24|4@1+ (1,0) [0|15] "" TCM

BO_ 2565615601 DiagResponse: 8 TCM
 SG_ SteerAngle : 7|16@0- (0.1,0) [-800|800] "deg" ECM

CM_ SG_ 196 EngineRPM "Engine speed
spanning two lines";
BA_ "GenSigStartValue" SG_ 196 EngineRPM 3200;
VAL_ 196 Gear 0 "Neutral" 1 "First" 2 "Second" ;
"#;

    #[test]
    fn test_parse_simple_dbc() {
        let load = parse_dbc_str(POWERTRAIN);
        assert!(load.issues.is_empty(), "{:?}", load.issues);

        let db = &load.database;
        assert_eq!(db.message_count(), 2);
        assert_eq!(db.total_signal_count(), 4);

        let engine = db.message_by_id(0xC4).expect("EngineData");
        assert_eq!(engine.name, "EngineData");
        assert_eq!(engine.transmitter, "ECM");
        let rpm = engine.signal("EngineRPM").expect("EngineRPM");
        assert_eq!(rpm.factor, 0.25);
        assert_eq!(rpm.unit, "rpm");
        assert_eq!(rpm.max, 16383.75);
        assert_eq!(rpm.initial_value, 800.0);

        let gear = engine.signal("Gear").expect("Gear");
        assert_eq!(gear.value_descriptions.get(&1).map(String::as_str), Some("First"));
    }

    #[test]
    fn test_extended_id_and_motorola() {
        let load = parse_dbc_str(POWERTRAIN);
        let diag = load.database.message_by_id(0x18DB33F1).expect("DiagResponse");
        assert!(diag.is_extended);
        let steer = &diag.signals[0];
        assert_eq!(steer.byte_order, ByteOrder::BigEndian);
        assert_eq!(steer.value_type, ValueType::Signed);
    }

    #[test]
    fn test_parse_multiplexed_signals() {
        let text = r#"
BO_ 512 MuxMsg: 8 Node
 SG_ Mux M : 0|4@1+ (1,0) [0|15] "" Node
 SG_ Tmp1 m1 : 8|8@1+ (1,-40) [-40|215] "degC" Node
 SG_ Tmp2 m2 : 8|8@1+ (1,-40) [-40|215] "degC" Node
 SG_ Bad m20 : 16|8@1+ (1,0) [0|0] "" Node
"#;
        let load = parse_dbc_str(text);
        let msg = load.database.message_by_id(512).expect("MuxMsg");
        assert_eq!(msg.selector().map(|s| s.name.as_str()), Some("Mux"));
        assert_eq!(msg.signals.len(), 3);
        assert_eq!(msg.signal("Tmp2").map(|s| s.mux), Some(MuxIndicator::Multiplexed(2)));
        assert_eq!(load.issues.len(), 1);
    }

    #[test]
    fn test_semantic_errors_are_dropped() {
        let text = r#"
BO_ 256 Small: 2 Node
 SG_ Fits : 0|16@1+ (1,0) [0|0] "" Node
 SG_ TooFar : 8|16@1+ (1,0) [0|0] "" Node
 SG_ Fits : 0|8@1+ (1,0) [0|0] "" Node
 SG_ Broken 0|8@1+ (1,0) [0|0] "" Node
"#;
        let load = parse_dbc_str(text);
        let msg = load.database.message_by_id(256).expect("Small");
        assert_eq!(msg.signals.len(), 1);
        assert_eq!(load.issues.len(), 3);
        assert_eq!(load.issues[0].line, 4);
    }

    #[test]
    fn test_float_value_type() {
        let text = r#"
BO_ 300 Floats: 8 Node
 SG_ Temp : 0|32@1- (1,0) [0|0] "C" Node
 SG_ Narrow : 32|16@1- (1,0) [0|0] "" Node
SIG_VALTYPE_ 300 Temp : 1;
SIG_VALTYPE_ 300 Narrow : 1;
"#;
        let load = parse_dbc_str(text);
        let msg = load.database.message_by_id(300).expect("Floats");
        assert_eq!(msg.signals[0].value_type, ValueType::Float32);
        assert_eq!(msg.signals[1].value_type, ValueType::Signed);
        assert_eq!(load.issues.len(), 1);
    }

    #[test]
    fn test_garbage_yields_empty_database() {
        let load = parse_dbc_str("this is not\na dbc file\n");
        assert!(load.database.is_empty());
    }

    #[test]
    fn test_parse_file_with_latin1() {
        let mut file = NamedTempFile::new().unwrap();
        file.write_all(b"BO_ 100 Msg: 8 N\n SG_ Temp : 0|8@1+ (1,0) [0|0] \"\xB0C\" N\n")
            .unwrap();
        let load = parse_dbc_file(file.path()).unwrap();
        let msg = load.database.message_by_id(100).unwrap();
        assert_eq!(msg.signals[0].unit, "\u{B0}C");
    }

    #[test]
    fn test_missing_file() {
        let err = parse_dbc_file(Path::new("/definitely/not/here.dbc")).unwrap_err();
        assert_eq!(err.kind(), crate::types::ErrorKind::FileNotFound);
    }
}
