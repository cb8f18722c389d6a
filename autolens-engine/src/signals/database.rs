//! Signal database
//!
//! Ordered collection of message definitions with an identifier index.
//! Per-channel databases are merged into one by concatenation; identifier
//! collisions resolve last-wins once the index is rebuilt.

use std::collections::{BTreeMap, HashMap};

/// A CAN message definition
#[derive(Debug, Clone, PartialEq)]
pub struct MessageDefinition {
    /// CAN message ID (without the DBC extended-id marker bit)
    pub id: u32,
    /// True if the DBC declares a 29-bit identifier
    pub is_extended: bool,
    /// Message name
    pub name: String,
    /// Message size in bytes
    pub dlc: u8,
    /// Transmitting node (may be empty)
    pub transmitter: String,
    /// Signals in declaration order
    pub signals: Vec<SignalDefinition>,
}

impl MessageDefinition {
    /// The multiplex selector signal, if the message has one
    pub fn selector(&self) -> Option<&SignalDefinition> {
        self.signals
            .iter()
            .find(|s| s.mux == MuxIndicator::Selector)
    }

    /// True if any signal depends on a selector value
    pub fn is_multiplexed(&self) -> bool {
        self.signals
            .iter()
            .any(|s| matches!(s.mux, MuxIndicator::Multiplexed(_)))
    }

    /// Find a signal by name
    pub fn signal(&self, name: &str) -> Option<&SignalDefinition> {
        self.signals.iter().find(|s| s.name == name)
    }
}

/// A CAN signal definition
#[derive(Debug, Clone, PartialEq)]
pub struct SignalDefinition {
    /// Signal name
    pub name: String,
    /// Start bit as written in the DBC
    ///
    /// For Motorola signals this addresses the MSB.
    pub start_bit: u16,
    /// Length in bits
    pub length: u16,
    /// Byte order
    pub byte_order: ByteOrder,
    /// Value type
    pub value_type: ValueType,
    /// Scale factor to convert raw value to physical value
    pub factor: f64,
    /// Offset to add after scaling
    pub offset: f64,
    /// Minimum physical value
    pub min: f64,
    /// Maximum physical value
    pub max: f64,
    /// Engineering unit (may be empty)
    pub unit: String,
    /// Raw value -> label
    pub value_descriptions: BTreeMap<i64, String>,
    /// Multiplex role
    pub mux: MuxIndicator,
    /// Initial physical value
    pub initial_value: f64,
}

impl SignalDefinition {
    /// Plain unsigned little-endian signal with factor 1 and no range
    pub fn new(name: impl Into<String>, start_bit: u16, length: u16) -> Self {
        Self {
            name: name.into(),
            start_bit,
            length,
            byte_order: ByteOrder::LittleEndian,
            value_type: ValueType::Unsigned,
            factor: 1.0,
            offset: 0.0,
            min: 0.0,
            max: 0.0,
            unit: String::new(),
            value_descriptions: BTreeMap::new(),
            mux: MuxIndicator::Plain,
            initial_value: 0.0,
        }
    }

    pub fn with_byte_order(mut self, byte_order: ByteOrder) -> Self {
        self.byte_order = byte_order;
        self
    }

    pub fn with_value_type(mut self, value_type: ValueType) -> Self {
        self.value_type = value_type;
        self
    }

    pub fn with_scaling(mut self, factor: f64, offset: f64) -> Self {
        self.factor = factor;
        self.offset = offset;
        self
    }

    pub fn with_range(mut self, min: f64, max: f64) -> Self {
        self.min = min;
        self.max = max;
        self
    }

    pub fn with_unit(mut self, unit: impl Into<String>) -> Self {
        self.unit = unit.into();
        self
    }

    pub fn with_mux(mut self, mux: MuxIndicator) -> Self {
        self.mux = mux;
        self
    }

    pub fn with_value_description(mut self, raw: i64, label: impl Into<String>) -> Self {
        self.value_descriptions.insert(raw, label.into());
        self
    }

    /// True if the DBC gives a usable min/max range
    pub fn has_range(&self) -> bool {
        self.max > self.min && self.min.is_finite() && self.max.is_finite()
    }
}

/// Byte order for signal extraction
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ByteOrder {
    /// Little-endian (Intel format)
    LittleEndian,
    /// Big-endian (Motorola format)
    BigEndian,
}

/// Value type for signal interpretation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValueType {
    /// Unsigned integer
    Unsigned,
    /// Two's complement signed integer
    Signed,
    /// IEEE-754 single precision (32 bits)
    Float32,
    /// IEEE-754 double precision (64 bits)
    Float64,
}

impl ValueType {
    pub fn is_float(self) -> bool {
        matches!(self, ValueType::Float32 | ValueType::Float64)
    }
}

/// Multiplex role of a signal
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MuxIndicator {
    /// Always present
    Plain,
    /// Selects the active multiplexed branch (`M`)
    Selector,
    /// Present only when the selector equals the value (`mN`)
    Multiplexed(u64),
}

/// Database statistics
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DatabaseStats {
    /// Number of messages
    pub message_count: usize,
    /// Number of signals across all messages
    pub signal_count: usize,
    /// Number of multiplexed messages
    pub multiplexed_count: usize,
}

/// The signal database
#[derive(Debug, Clone, Default)]
pub struct SignalDatabase {
    messages: Vec<MessageDefinition>,
    /// CAN ID -> position in `messages`
    index: HashMap<u32, usize>,
}

impl SignalDatabase {
    /// Create a new empty database
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a database from message definitions and index it
    pub fn from_messages(messages: Vec<MessageDefinition>) -> Self {
        let mut db = Self {
            messages,
            index: HashMap::new(),
        };
        db.build_index();
        db
    }

    /// Messages in declaration order
    pub fn messages(&self) -> &[MessageDefinition] {
        &self.messages
    }

    /// Mutable access to the message list
    ///
    /// Call [`SignalDatabase::build_index`] afterwards.
    pub fn messages_mut(&mut self) -> &mut Vec<MessageDefinition> {
        &mut self.messages
    }

    /// Append all messages of `other`
    ///
    /// The index is rebuilt, so an identifier present in both resolves to
    /// the message from `other`.
    pub fn merge(&mut self, other: &SignalDatabase) {
        self.messages.extend(other.messages.iter().cloned());
        self.build_index();
    }

    /// Rebuild the identifier index
    pub fn build_index(&mut self) {
        self.index.clear();
        self.index.reserve(self.messages.len());
        for (pos, msg) in self.messages.iter().enumerate() {
            // Later declarations overwrite earlier ones
            self.index.insert(msg.id, pos);
        }
    }

    /// Look up a message by CAN ID
    ///
    /// The index is keyed on the bare identifier, so a standard and an
    /// extended message sharing the same numeric id collide: the one
    /// declared last answers for both frame kinds.
    pub fn message_by_id(&self, id: u32) -> Option<&MessageDefinition> {
        self.index.get(&id).and_then(|&pos| self.messages.get(pos))
    }

    /// True iff the database holds no messages
    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    /// Number of messages
    pub fn message_count(&self) -> usize {
        self.messages.len()
    }

    /// Number of signals across all messages
    pub fn total_signal_count(&self) -> usize {
        self.messages.iter().map(|m| m.signals.len()).sum()
    }

    /// Get database statistics
    pub fn stats(&self) -> DatabaseStats {
        DatabaseStats {
            message_count: self.message_count(),
            signal_count: self.total_signal_count(),
            multiplexed_count: self.messages.iter().filter(|m| m.is_multiplexed()).count(),
        }
    }
}
