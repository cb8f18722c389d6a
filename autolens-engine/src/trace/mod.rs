//! Trace rows, the bounded trace model and its filtered view

pub mod entry;
pub mod filter;
pub mod model;

pub use entry::{Column, SignalRow, TraceEntry};
pub use filter::TraceFilter;
pub use model::{DisplayMode, ModelChange, RowRef, TraceModel, MAX_ROWS, PURGE_CHUNK};
