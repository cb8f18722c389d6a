//! Signal definitions: DBC parsing, the signal database and the bit-field codec

pub mod codec;
pub mod database;
pub mod dbc;

pub use database::{
    ByteOrder, DatabaseStats, MessageDefinition, MuxIndicator, SignalDatabase, SignalDefinition,
    ValueType,
};
pub use dbc::{parse_dbc_file, parse_dbc_str, DbcLoad, ParseIssue};
