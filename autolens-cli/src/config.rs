//! CLI configuration (`autolens.toml`)
//!
//! The engine settings document plus two CLI-only tables:
//!
//! ```toml
//! [output]
//! format = "blf"      # asc | blf | csv
//! dir = "captures"
//!
//! [log]
//! dir = "logs"
//! ```

use anyhow::{Context, Result};
use autolens_engine::Settings;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

pub const DEFAULT_CONFIG_FILE: &str = "autolens.toml";

/// Full CLI configuration
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct CliConfig {
    /// Engine settings: `[[channels]]`, `[window]`, `[theme]`, `[trace]`
    #[serde(flatten)]
    pub settings: Settings,
    #[serde(default)]
    pub output: OutputConfig,
    #[serde(default)]
    pub log: LogConfig,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct OutputConfig {
    /// Format used when an output name has no extension
    #[serde(default)]
    pub format: OutputFormat,
    /// Directory for converted and captured files
    pub dir: Option<PathBuf>,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct LogConfig {
    /// Session log directory; no session log when unset
    pub dir: Option<PathBuf>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, Serialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum OutputFormat {
    Asc,
    #[default]
    Blf,
    Csv,
}

impl OutputFormat {
    pub fn extension(self) -> &'static str {
        match self {
            OutputFormat::Asc => "asc",
            OutputFormat::Blf => "blf",
            OutputFormat::Csv => "csv",
        }
    }
}

impl CliConfig {
    /// Directory for output files, falling back to the current directory
    pub fn output_dir(&self) -> PathBuf {
        self.output.dir.clone().unwrap_or_else(|| PathBuf::from("."))
    }
}

/// Load configuration from a TOML file
pub fn load_config(path: &Path) -> Result<CliConfig> {
    let content = fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {:?}", path))?;

    let mut config: CliConfig = toml::from_str(&content)
        .with_context(|| format!("Failed to parse config file: {:?}", path))?;
    config.settings.normalize_channels();

    log::debug!(
        "Config {:?}: output={:?}, {} channel slot(s)",
        path,
        config.output.format,
        config.settings.channels.len()
    );
    Ok(config)
}

/// Load `explicit` if given, else `autolens.toml` when present, else defaults
pub fn resolve_config(explicit: Option<&Path>) -> Result<CliConfig> {
    match explicit {
        Some(path) => load_config(path),
        None if Path::new(DEFAULT_CONFIG_FILE).exists() => load_config(Path::new(DEFAULT_CONFIG_FILE)),
        None => Ok(CliConfig::default()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_config_deserialization() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        let toml_content = r#"
            [output]
            format = "asc"
            dir = "captures"

            [log]
            dir = "logs"

            [trace]
            in_place = true

            [[channels]]
            slot = 1
            enabled = true
            dbc_path = "powertrain.dbc"
        "#;

        file.write_all(toml_content.as_bytes()).unwrap();

        let config = load_config(file.path()).unwrap();
        assert_eq!(config.output.format, OutputFormat::Asc);
        assert_eq!(config.output_dir(), PathBuf::from("captures"));
        assert_eq!(config.log.dir, Some(PathBuf::from("logs")));
        assert!(config.settings.trace.in_place);
        assert_eq!(config.settings.channels.len(), 4);
        assert_eq!(config.settings.channels[1].dbc_path, "powertrain.dbc");
        assert_eq!(config.settings.channels[1].alias, "CH2");
    }

    #[test]
    fn test_empty_config_uses_defaults() {
        let config: CliConfig = toml::from_str("").unwrap();
        assert_eq!(config.output.format, OutputFormat::Blf);
        assert!(config.settings.theme.is_day);
        assert_eq!(config.settings.window.width, 1280);
    }

    #[test]
    fn test_bad_config_has_context() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[output]\nformat = \"mp4\"").unwrap();
        let err = load_config(file.path()).unwrap_err();
        assert!(err.to_string().starts_with("Failed to parse config file"));
    }
}
