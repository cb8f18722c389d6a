//! Core types for the AutoLens engine
//!
//! This module defines the frame record every other component passes around,
//! the decoded-signal record produced by the DBC decoder, and the error type
//! surfaced by all fallible engine operations.

use crate::dlc::{dlc_to_length, length_to_dlc};
use serde::Serialize;
use std::fmt;

/// Result type for engine operations
pub type Result<T> = std::result::Result<T, EngineError>;

/// Maximum payload size of a CAN-FD frame
pub const MAX_DATA_LEN: usize = 64;

/// Largest 29-bit arbitration identifier
pub const MAX_EXTENDED_ID: u32 = 0x1FFF_FFFF;

/// Largest 11-bit arbitration identifier
pub const MAX_STANDARD_ID: u32 = 0x7FF;

/// A single CAN or CAN-FD frame
///
/// Frames are plain values: drivers and importers build them, everything
/// downstream only reads them. The payload lives in a fixed 64-byte buffer;
/// bytes past `data_len()` are always zero.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CanFrame {
    /// Arbitration identifier (11 or 29 bits)
    pub id: u32,
    /// True if this frame uses a 29-bit identifier
    pub is_extended: bool,
    /// Payload buffer, zero-padded
    pub data: [u8; MAX_DATA_LEN],
    /// Data length code (0-15)
    pub dlc: u8,
    /// True if this is a CAN-FD frame
    pub is_fd: bool,
    /// CAN-FD bit-rate switch
    pub brs: bool,
    /// CAN-FD error state indicator
    pub esi: bool,
    /// True if this is a remote frame
    pub is_remote_frame: bool,
    /// True if this is an error frame
    pub is_error_frame: bool,
    /// True if this frame is the echo of a transmitted frame
    pub is_tx_echo: bool,
    /// Logical channel, 1-based
    pub channel: u8,
    /// Timestamp in nanoseconds from the adapter epoch
    pub timestamp_ns: u64,
}

impl Default for CanFrame {
    fn default() -> Self {
        Self {
            id: 0,
            is_extended: false,
            data: [0; MAX_DATA_LEN],
            dlc: 0,
            is_fd: false,
            brs: false,
            esi: false,
            is_remote_frame: false,
            is_error_frame: false,
            is_tx_echo: false,
            channel: 1,
            timestamp_ns: 0,
        }
    }
}

impl CanFrame {
    /// Build a classic data frame
    ///
    /// At most 8 bytes of `payload` are used; the DLC is the payload length.
    ///
    /// # Example
    /// ```
    /// use autolens_engine::CanFrame;
    ///
    /// let frame = CanFrame::classic(0x0C4, &[0xA0, 0x0F, 0x54]);
    /// assert_eq!(frame.dlc, 3);
    /// assert_eq!(frame.payload(), &[0xA0, 0x0F, 0x54]);
    /// ```
    pub fn classic(id: u32, payload: &[u8]) -> Self {
        let len = payload.len().min(8);
        let mut frame = Self {
            id,
            is_extended: id > MAX_STANDARD_ID,
            dlc: len as u8,
            ..Self::default()
        };
        frame.data[..len].copy_from_slice(&payload[..len]);
        frame
    }

    /// Build a CAN-FD data frame
    ///
    /// The DLC is the smallest code able to carry `payload`; the gap up to
    /// the DLC length stays zero.
    pub fn fd(id: u32, payload: &[u8], brs: bool) -> Self {
        let len = payload.len().min(MAX_DATA_LEN);
        let mut frame = Self {
            id,
            is_extended: id > MAX_STANDARD_ID,
            dlc: length_to_dlc(len),
            is_fd: true,
            brs,
            ..Self::default()
        };
        frame.data[..len].copy_from_slice(&payload[..len]);
        frame
    }

    /// Build an error frame on the given channel
    pub fn error_frame(channel: u8, timestamp_ns: u64) -> Self {
        Self {
            is_error_frame: true,
            channel,
            timestamp_ns,
            ..Self::default()
        }
    }

    /// Set the channel (builder style)
    pub fn on_channel(mut self, channel: u8) -> Self {
        self.channel = channel;
        self
    }

    /// Set the timestamp (builder style)
    pub fn at(mut self, timestamp_ns: u64) -> Self {
        self.timestamp_ns = timestamp_ns;
        self
    }

    /// Number of meaningful payload bytes
    ///
    /// Remote and error frames carry no data regardless of their DLC.
    pub fn data_len(&self) -> usize {
        if self.is_remote_frame || self.is_error_frame {
            return 0;
        }
        let len = dlc_to_length(self.dlc);
        if self.is_fd {
            len
        } else {
            len.min(8)
        }
    }

    /// The meaningful payload bytes
    pub fn payload(&self) -> &[u8] {
        &self.data[..self.data_len()]
    }

    /// Timestamp in seconds
    pub fn timestamp_secs(&self) -> f64 {
        self.timestamp_ns as f64 / 1e9
    }
}

/// A decoded signal value, ready for display
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DecodedSignal {
    /// Signal name from the DBC
    pub name: String,
    /// Physical value (raw * factor + offset, or the float itself)
    pub physical: f64,
    /// Raw integer after sign extension
    pub raw: i64,
    /// Physical value with unit and value label, e.g. `"1000 rpm"`
    pub value_text: String,
    /// Unsigned bit pattern of the field as `0x`-prefixed uppercase hex
    pub raw_text: String,
    /// Engineering unit (may be empty)
    pub unit: String,
    /// Value description label, if the raw value has one
    pub value_description: Option<String>,
}

/// Fieldless error classification
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    DriverUnavailable,
    DriverInitTimeout,
    ChannelOpenFailed,
    HardwareRemoved,
    NoChannels,
    NotConnected,
    FileNotFound,
    FileParseError,
    FileWriteError,
    UnsupportedFormat,
    TransmitFailed,
    Io,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ErrorKind::DriverUnavailable => "driver-unavailable",
            ErrorKind::DriverInitTimeout => "driver-init-timeout",
            ErrorKind::ChannelOpenFailed => "channel-open-failed",
            ErrorKind::HardwareRemoved => "hardware-removed",
            ErrorKind::NoChannels => "no-channels",
            ErrorKind::NotConnected => "not-connected",
            ErrorKind::FileNotFound => "file-not-found",
            ErrorKind::FileParseError => "file-parse-error",
            ErrorKind::FileWriteError => "file-write-error",
            ErrorKind::UnsupportedFormat => "unsupported-format",
            ErrorKind::TransmitFailed => "transmit-failed",
            ErrorKind::Io => "io",
        };
        f.write_str(s)
    }
}

/// Errors surfaced by engine operations
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("CAN driver unavailable: {0}")]
    DriverUnavailable(String),

    #[error("Driver initialization timed out after {0} ms")]
    DriverInitTimeout(u64),

    #[error("Failed to open channel: {0}")]
    ChannelOpenFailed(String),

    #[error("Hardware removed: {0}")]
    HardwareRemoved(String),

    #[error("No CAN channels available")]
    NoChannels,

    #[error("Not connected")]
    NotConnected,

    #[error("File not found: {0}")]
    FileNotFound(String),

    #[error("Failed to parse {path}: {reason}")]
    FileParseError { path: String, reason: String },

    #[error("Failed to write {path}: {reason}")]
    FileWriteError { path: String, reason: String },

    #[error("Unsupported file format: {0}")]
    UnsupportedFormat(String),

    #[error("TX failed: {0}")]
    TransmitFailed(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl EngineError {
    /// Classify this error without inspecting its message
    pub fn kind(&self) -> ErrorKind {
        match self {
            EngineError::DriverUnavailable(_) => ErrorKind::DriverUnavailable,
            EngineError::DriverInitTimeout(_) => ErrorKind::DriverInitTimeout,
            EngineError::ChannelOpenFailed(_) => ErrorKind::ChannelOpenFailed,
            EngineError::HardwareRemoved(_) => ErrorKind::HardwareRemoved,
            EngineError::NoChannels => ErrorKind::NoChannels,
            EngineError::NotConnected => ErrorKind::NotConnected,
            EngineError::FileNotFound(_) => ErrorKind::FileNotFound,
            EngineError::FileParseError { .. } => ErrorKind::FileParseError,
            EngineError::FileWriteError { .. } => ErrorKind::FileWriteError,
            EngineError::UnsupportedFormat(_) => ErrorKind::UnsupportedFormat,
            EngineError::TransmitFailed(_) => ErrorKind::TransmitFailed,
            EngineError::Io(_) => ErrorKind::Io,
        }
    }

    pub(crate) fn parse(path: impl fmt::Display, reason: impl Into<String>) -> Self {
        EngineError::FileParseError {
            path: path.to_string(),
            reason: reason.into(),
        }
    }

    pub(crate) fn write(path: impl fmt::Display, reason: impl Into<String>) -> Self {
        EngineError::FileWriteError {
            path: path.to_string(),
            reason: reason.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classic_frame_construction() {
        let frame = CanFrame::classic(0x123, &[1, 2, 3, 4, 5, 6, 7, 8, 9, 10]);
        assert_eq!(frame.dlc, 8);
        assert_eq!(frame.data_len(), 8);
        assert!(!frame.is_extended);
        assert_eq!(frame.data[8], 0);
    }

    #[test]
    fn test_fd_frame_rounds_dlc_up() {
        let frame = CanFrame::fd(0x18DB33F1, &[0xAA; 10], true);
        assert!(frame.is_extended);
        assert_eq!(frame.dlc, 9);
        assert_eq!(frame.data_len(), 12);
        assert_eq!(&frame.payload()[10..], &[0, 0]);
    }

    #[test]
    fn test_remote_and_error_frames_carry_no_data() {
        let mut remote = CanFrame::classic(0x100, &[1, 2]);
        remote.is_remote_frame = true;
        assert!(remote.payload().is_empty());

        let err = CanFrame::error_frame(2, 1000);
        assert_eq!(err.data_len(), 0);
        assert_eq!(err.channel, 2);
    }

    #[test]
    fn test_error_kind_and_message() {
        let err = EngineError::TransmitFailed("queue full".into());
        assert_eq!(err.kind(), ErrorKind::TransmitFailed);
        assert_eq!(err.to_string(), "TX failed: queue full");
        assert_eq!(ErrorKind::FileParseError.to_string(), "file-parse-error");
    }
}
