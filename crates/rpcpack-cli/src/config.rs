//! CLI configuration.
//!
//! All settings live in a single `config.toml` file at
//! `~/.config/rpcpack/config.toml` by default.
//!
//! ```toml
//! [codec]
//! max_message_size = 16777216
//! progress_failure_warn_limit = 10
//!
//! [logging]
//! level = "warn"
//! format = "compact"
//! ```

use std::path::{Path, PathBuf};
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use tracing::Level;

use rpcpack_protocol::FormatterOptions;

use crate::error::{CliError, CliResult};
use crate::tracing::{TracingConfig, TracingOutputFormat};

/// Configuration for the rpcpack CLI.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CliConfig {
    /// Codec settings.
    pub codec: FormatterOptions,

    /// Logging settings.
    pub logging: LoggingSettings,
}

/// Logging settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingSettings {
    /// Default level when `RUST_LOG` is not set.
    pub level: String,

    /// Output format.
    pub format: TracingOutputFormat,
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            level: "warn".to_string(),
            format: TracingOutputFormat::Compact,
        }
    }
}

impl LoggingSettings {
    /// Parses the configured level.
    pub fn level(&self) -> CliResult<Level> {
        Level::from_str(&self.level)
            .map_err(|_| CliError::Config(format!("invalid log level: {}", self.level)))
    }
}

impl CliConfig {
    /// Loads configuration from the default path.
    pub fn load() -> CliResult<Self> {
        let path = Self::default_path();
        if path.exists() {
            Self::load_from(&path)
        } else {
            Ok(Self::default())
        }
    }

    /// Loads configuration from a specific path.
    pub fn load_from(path: &Path) -> CliResult<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| CliError::Config(format!("failed to read {}: {}", path.display(), e)))?;
        toml::from_str(&content)
            .map_err(|e| CliError::Config(format!("failed to parse {}: {}", path.display(), e)))
    }

    /// Returns the default configuration file path.
    pub fn default_path() -> PathBuf {
        Self::default_config_dir().join("config.toml")
    }

    /// Returns the default configuration directory.
    pub fn default_config_dir() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("rpcpack")
    }

    /// Checks values that parse but cannot work.
    pub fn validate(&self) -> CliResult<()> {
        if self.codec.max_message_size == 0 {
            return Err(CliError::Config(
                "codec.max_message_size must be greater than zero".to_string(),
            ));
        }
        self.logging.level()?;
        Ok(())
    }

    /// Tracing setup for these settings; `debug` forces debug output.
    pub fn tracing(&self, debug: bool) -> TracingConfig {
        if debug {
            return TracingConfig::cli_debug();
        }
        let level = self.logging.level().unwrap_or(Level::WARN);
        TracingConfig::default()
            .with_level(level)
            .with_format(self.logging.format)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn empty_file_gives_defaults() {
        let config: CliConfig = toml::from_str("").unwrap();
        assert_eq!(config, CliConfig::default());
        assert_eq!(config.codec.max_message_size, 16 * 1024 * 1024);
        assert_eq!(config.logging.level, "warn");
    }

    #[test]
    fn partial_sections_keep_defaults() {
        let toml_content = r#"
[codec]
max_message_size = 1024

[logging]
format = "json"
"#;
        let config: CliConfig = toml::from_str(toml_content).unwrap();
        assert_eq!(config.codec.max_message_size, 1024);
        assert_eq!(config.codec.progress_failure_warn_limit, 10);
        assert_eq!(config.logging.format, TracingOutputFormat::Json);
        assert_eq!(config.logging.level, "warn");
    }

    #[test]
    fn load_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[logging]\nlevel = \"debug\"").unwrap();
        let config = CliConfig::load_from(file.path()).unwrap();
        assert_eq!(config.logging.level().unwrap(), Level::DEBUG);
    }

    #[test]
    fn load_from_missing_file_errors() {
        let dir = tempfile::tempdir().unwrap();
        let err = CliConfig::load_from(&dir.path().join("absent.toml")).unwrap_err();
        assert!(err.to_string().contains("failed to read"));
    }

    #[test]
    fn load_from_invalid_toml_errors() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[codec\nmax_message_size = ").unwrap();
        let err = CliConfig::load_from(file.path()).unwrap_err();
        assert!(err.to_string().contains("failed to parse"));
    }

    #[test]
    fn validate_rejects_bad_values() {
        let mut config = CliConfig::default();
        assert!(config.validate().is_ok());

        config.logging.level = "loud".to_string();
        assert!(config.validate().is_err());

        let mut config = CliConfig::default();
        config.codec.max_message_size = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn tracing_follows_logging_settings() {
        let mut config = CliConfig::default();
        config.logging.level = "info".to_string();
        config.logging.format = TracingOutputFormat::Pretty;
        let tracing = config.tracing(false);
        assert_eq!(tracing.default_level, Level::INFO);
        assert_eq!(tracing.output_format, TracingOutputFormat::Pretty);

        assert_eq!(config.tracing(true).default_level, Level::DEBUG);
    }

    #[test]
    fn default_path_ends_with_config_toml() {
        let path = CliConfig::default_path();
        assert!(path.ends_with("rpcpack/config.toml"));
    }
}
