//! AutoLens CAN/CAN-FD Bus Analyzer Engine
//!
//! Captures frames from a CAN adapter (or a built-in simulator), decodes
//! them against DBC signal definitions and keeps a bounded trace that can
//! be saved to and loaded from Vector ASC/BLF files.
//!
//! # Architecture
//!
//! - [`driver`]: adapter interface, the Vector XL driver and the simulator
//! - [`pipeline`]: gate and pending buffer between driver and trace
//! - [`signals`]: DBC parsing, the signal database and the bit-field codec
//! - [`decoder`]: frame → named physical values
//! - [`trace`]: display rows and the bounded, tree-shaped trace model
//! - [`formats`]: ASC and BLF readers/writers, CSV export
//! - [`engine`]: the façade a host drives through [`Engine::poll`]
//! - [`logging`]: per-session log file with crash marker
//!
//! # Example Usage
//!
//! ```no_run
//! use autolens_engine::{Engine, Settings};
//! use std::time::{Duration, Instant};
//!
//! let mut engine = Engine::new(Settings::default());
//! engine.start_init_sequence();
//! engine.wait_for_init(Duration::from_secs(5));
//!
//! engine.start().unwrap();
//! for _ in 0..100 {
//!     engine.poll(Instant::now());
//!     std::thread::sleep(Duration::from_millis(10));
//! }
//! engine.stop();
//! engine.save_trace("capture.blf").unwrap();
//! engine.shutdown();
//! ```

pub mod config;
pub mod decoder;
pub mod dlc;
pub mod driver;
pub mod engine;
pub mod formats;
pub mod logging;
pub mod pipeline;
pub mod signals;
pub mod trace;
pub mod types;

pub use config::{BusConfig, ChannelConfig, Settings, MAX_CHANNELS};
pub use decoder::{decode_frame, DecodedMessage, Decoder};
pub use driver::{CanDriver, ChannelInfo, DriverEvent, SimulatedDriver, VectorDriver};
pub use engine::{Engine, EngineEvent, EngineState};
pub use formats::{read_trace, write_trace, TraceFormat};
pub use logging::SessionLog;
pub use signals::{parse_dbc_file, parse_dbc_str, DatabaseStats, SignalDatabase};
pub use trace::{DisplayMode, TraceEntry, TraceModel};
pub use types::{CanFrame, DecodedSignal, EngineError, ErrorKind, Result};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_library_basics() {
        let engine = Engine::with_driver(Settings::default(), Box::new(SimulatedDriver::new()));
        assert_eq!(engine.state(), EngineState::Closed);
        assert_eq!(engine.frame_count(), 0);
        assert!(!engine.is_dbc_loaded());
    }
}
