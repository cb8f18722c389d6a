//! Engine configuration types
//!
//! Bus parameters handed to a driver when a channel is opened, the
//! per-slot channel configuration, and the persisted settings document.
//! Settings are stored as TOML; every field has a serde default so older or
//! partial files load cleanly.

use crate::types::{EngineError, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Number of logical channel slots
pub const MAX_CHANNELS: usize = 4;

/// Bus parameters for opening a channel
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BusConfig {
    /// Nominal bit rate in bit/s
    #[serde(default = "default_bitrate")]
    pub bitrate: u32,
    /// Enable CAN-FD
    #[serde(default)]
    pub fd_enabled: bool,
    /// FD data-phase bit rate in bit/s
    #[serde(default = "default_data_bitrate")]
    pub data_bitrate: u32,
    /// Listen-only: no acknowledgements are sent
    #[serde(default)]
    pub listen_only: bool,
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            bitrate: default_bitrate(),
            fd_enabled: false,
            data_bitrate: default_data_bitrate(),
            listen_only: false,
        }
    }
}

impl BusConfig {
    /// Create a new bus configuration with defaults (500 kbit/s, classic)
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the nominal bit rate
    pub fn with_bitrate(mut self, bitrate: u32) -> Self {
        self.bitrate = bitrate;
        self
    }

    /// Enable CAN-FD with the given data-phase bit rate
    pub fn with_fd(mut self, data_bitrate: u32) -> Self {
        self.fd_enabled = true;
        self.data_bitrate = data_bitrate;
        self
    }

    /// Enable or disable listen-only mode
    pub fn with_listen_only(mut self, listen_only: bool) -> Self {
        self.listen_only = listen_only;
        self
    }
}

fn default_bitrate() -> u32 {
    500_000
}

fn default_data_bitrate() -> u32 {
    2_000_000
}

fn default_x() -> i32 {
    100
}

fn default_y() -> i32 {
    100
}

fn default_width() -> i32 {
    1280
}

fn default_height() -> i32 {
    760
}

fn default_true() -> bool {
    true
}

fn default_hw_index() -> i32 {
    -1
}

/// Configuration of one logical channel slot
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelConfig {
    /// Slot index 0..3
    pub slot: usize,
    /// Whether the slot takes part in connect and DBC merge
    #[serde(default)]
    pub enabled: bool,
    /// Display alias, "CH1".."CH4" by default
    #[serde(default)]
    pub alias: String,
    /// Index into the detected adapter channel list, -1 if unbound
    #[serde(default = "default_hw_index")]
    pub hw_channel_index: i32,
    /// CAN-FD mode
    #[serde(default)]
    pub fd_enabled: bool,
    /// Nominal bit rate in bit/s
    #[serde(default = "default_bitrate")]
    pub bitrate: u32,
    /// FD data-phase bit rate in bit/s
    #[serde(default = "default_data_bitrate")]
    pub data_bitrate: u32,
    /// DBC file bound to this channel (empty for none)
    #[serde(default)]
    pub dbc_path: String,
    /// Summary of the parsed DBC, e.g. `"file.dbc  |  3 msg  |  12 sig"`
    #[serde(default)]
    pub dbc_info: String,
}

impl ChannelConfig {
    /// Default configuration for a slot
    pub fn for_slot(slot: usize) -> Self {
        Self {
            slot,
            enabled: false,
            alias: format!("CH{}", slot + 1),
            hw_channel_index: -1,
            fd_enabled: false,
            bitrate: default_bitrate(),
            data_bitrate: default_data_bitrate(),
            dbc_path: String::new(),
            dbc_info: String::new(),
        }
    }

    /// Enable the slot and bind it to an adapter channel
    pub fn with_hw_channel(mut self, index: i32) -> Self {
        self.enabled = true;
        self.hw_channel_index = index;
        self
    }

    /// Bind a DBC file
    pub fn with_dbc(mut self, path: impl Into<String>) -> Self {
        self.dbc_path = path.into();
        self
    }

    /// Enable CAN-FD with the given data-phase bit rate
    pub fn with_fd(mut self, data_bitrate: u32) -> Self {
        self.fd_enabled = true;
        self.data_bitrate = data_bitrate;
        self
    }

    /// True if the slot has a DBC path
    pub fn has_dbc(&self) -> bool {
        !self.dbc_path.trim().is_empty()
    }

    /// Bus parameters for opening this channel
    pub fn bus_config(&self, listen_only: bool) -> BusConfig {
        BusConfig {
            bitrate: self.bitrate,
            fd_enabled: self.fd_enabled,
            data_bitrate: self.data_bitrate,
            listen_only,
        }
    }
}

/// Default slot configurations 0..3
pub fn default_channel_configs() -> Vec<ChannelConfig> {
    (0..MAX_CHANNELS).map(ChannelConfig::for_slot).collect()
}

/// Main window geometry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct WindowState {
    #[serde(default = "default_x")]
    pub x: i32,
    #[serde(default = "default_y")]
    pub y: i32,
    #[serde(default = "default_width")]
    pub width: i32,
    #[serde(default = "default_height")]
    pub height: i32,
    #[serde(default)]
    pub maximized: bool,
}

impl Default for WindowState {
    fn default() -> Self {
        Self {
            x: default_x(),
            y: default_y(),
            width: default_width(),
            height: default_height(),
            maximized: false,
        }
    }
}

/// Theme selection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ThemeSettings {
    #[serde(default = "default_true")]
    pub is_day: bool,
}

impl Default for ThemeSettings {
    fn default() -> Self {
        Self { is_day: true }
    }
}

/// Trace view preferences
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TraceSettings {
    #[serde(default)]
    pub in_place: bool,
}

/// Persisted application settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Settings {
    #[serde(default = "default_channel_configs")]
    pub channels: Vec<ChannelConfig>,
    #[serde(default)]
    pub window: WindowState,
    #[serde(default)]
    pub theme: ThemeSettings,
    #[serde(default)]
    pub trace: TraceSettings,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            channels: default_channel_configs(),
            window: WindowState::default(),
            theme: ThemeSettings::default(),
            trace: TraceSettings::default(),
        }
    }
}

impl Settings {
    /// Load settings from a TOML file
    ///
    /// A missing file yields defaults. Channel slots are normalised to
    /// exactly `MAX_CHANNELS` entries ordered by slot.
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            log::debug!("No settings file at {:?}, using defaults", path);
            return Ok(Self::default());
        }
        let text = std::fs::read_to_string(path)?;
        let mut settings: Settings =
            toml::from_str(&text).map_err(|e| EngineError::parse(path.display(), e.to_string()))?;
        settings.normalize_channels();
        log::info!("Loaded settings from {:?}", path);
        Ok(settings)
    }

    /// Write settings to a TOML file, creating parent directories
    pub fn save(&self, path: &Path) -> Result<()> {
        let text =
            toml::to_string_pretty(self).map_err(|e| EngineError::write(path.display(), e.to_string()))?;
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)
                    .map_err(|e| EngineError::write(path.display(), e.to_string()))?;
            }
        }
        std::fs::write(path, text).map_err(|e| EngineError::write(path.display(), e.to_string()))?;
        log::debug!("Saved settings to {:?}", path);
        Ok(())
    }

    /// Reduce `channels` to exactly `MAX_CHANNELS` entries ordered by slot
    pub fn normalize_channels(&mut self) {
        let mut slots = default_channel_configs();
        for cfg in self.channels.drain(..) {
            if cfg.slot < MAX_CHANNELS {
                let slot = cfg.slot;
                slots[slot] = cfg;
            } else {
                log::warn!("Ignoring channel config for slot {}", cfg.slot);
            }
        }
        for cfg in &mut slots {
            if cfg.alias.is_empty() {
                cfg.alias = format!("CH{}", cfg.slot + 1);
            }
        }
        self.channels = slots;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_channel_defaults() {
        let configs = default_channel_configs();
        assert_eq!(configs.len(), MAX_CHANNELS);
        assert_eq!(configs[2].alias, "CH3");
        assert_eq!(configs[0].hw_channel_index, -1);
        assert_eq!(configs[0].bitrate, 500_000);
        assert!(!configs[0].enabled);
    }

    #[test]
    fn test_bus_config_builder() {
        let cfg = BusConfig::new().with_bitrate(250_000).with_fd(4_000_000).with_listen_only(true);
        assert_eq!(cfg.bitrate, 250_000);
        assert!(cfg.fd_enabled);
        assert_eq!(cfg.data_bitrate, 4_000_000);
        assert!(cfg.listen_only);
    }

    #[test]
    fn test_settings_round_trip() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("nested").join("autolens.toml");

        let mut settings = Settings::default();
        settings.channels[1] = ChannelConfig::for_slot(1).with_hw_channel(0).with_dbc("body.dbc");
        settings.window.maximized = true;
        settings.trace.in_place = true;
        settings.save(&path).unwrap();

        let loaded = Settings::load(&path).unwrap();
        assert_eq!(loaded, settings);
    }

    #[test]
    fn test_partial_settings_file() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("settings.toml");
        std::fs::write(
            &path,
            "[[channels]]\nslot = 2\nenabled = true\n\n[theme]\nis_day = false\n",
        )
        .unwrap();

        let loaded = Settings::load(&path).unwrap();
        assert_eq!(loaded.channels.len(), MAX_CHANNELS);
        assert!(loaded.channels[2].enabled);
        assert_eq!(loaded.channels[2].alias, "CH3");
        assert_eq!(loaded.channels[2].bitrate, 500_000);
        assert!(!loaded.theme.is_day);
        assert_eq!(loaded.window.width, 1280);
    }

    #[test]
    fn test_missing_and_malformed_settings() {
        let dir = tempdir().unwrap();
        let missing = Settings::load(&dir.path().join("none.toml")).unwrap();
        assert_eq!(missing, Settings::default());

        let bad = dir.path().join("bad.toml");
        std::fs::write(&bad, "channels = 12 = oops").unwrap();
        let err = Settings::load(&bad).unwrap_err();
        assert_eq!(err.kind(), crate::types::ErrorKind::FileParseError);
    }
}
