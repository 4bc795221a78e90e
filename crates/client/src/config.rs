//! Configuration management for the cmdproc client.
//!
//! This module provides TOML-based configuration file loading and saving.
//! The default configuration path is `~/.config/cmdproc/config.toml`.
//! Configuration is read once at startup and is immutable afterwards.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use protocol::{Endpoint, Scheme, PWD_PATH, RUN_PATH};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::channel::DEFAULT_OUTPUT_CAPACITY;
use crate::multiplexer::HalfClosePolicy;

/// Configuration validation errors.
#[derive(Debug, Error, PartialEq)]
pub enum ConfigError {
    #[error("host must not be empty")]
    EmptyHost,

    #[error("port must be between 1 and 65535, got {0}")]
    InvalidPort(u16),

    #[error("{field} must start with '/', got {value}")]
    InvalidPath { field: &'static str, value: String },

    #[error("output_capacity must be between 1 and {max}, got {got}")]
    InvalidCapacity { got: usize, max: usize },

    #[error("{field} must be between 1 and 3600 seconds, got {value}")]
    InvalidTimeout { field: &'static str, value: u64 },

    #[error("log level must be one of: trace, debug, info, warn, error; got {0}")]
    InvalidLogLevel(String),
}

/// Valid log level values for tracing configuration.
const VALID_LOG_LEVELS: &[&str] = &["trace", "debug", "info", "warn", "error"];

/// Upper bound for the output ring size.
const MAX_OUTPUT_CAPACITY: usize = 1 << 20;

/// Upper bound for any timeout, in seconds.
const MAX_TIMEOUT_SECS: u64 = 3600;

/// Main configuration structure for the cmdproc client.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(default)]
pub struct Config {
    /// Where the remote execution host lives.
    pub endpoint: EndpointConfig,

    /// Session behaviour.
    pub session: SessionConfig,

    /// Channel sizing.
    pub channels: ChannelConfig,

    /// Logging settings.
    pub logging: LoggingConfig,
}

/// Address of the remote execution host.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct EndpointConfig {
    /// `http` or `https`; the WebSocket uses `ws` or `wss` accordingly.
    pub scheme: Scheme,

    /// Host name or IP address.
    pub host: String,

    /// TCP port.
    pub port: u16,

    /// Path of the persistent command connection.
    pub run_path: String,

    /// Path of the working-directory resource.
    pub pwd_path: String,
}

/// Session behaviour.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct SessionConfig {
    /// Handshake timeout in seconds.
    pub connect_timeout_secs: u64,

    /// Timeout for one-shot requests in seconds.
    pub request_timeout_secs: u64,

    /// What happens to one pump when the other stops.
    pub half_close: HalfClosePolicy,
}

/// Channel sizing.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ChannelConfig {
    /// Ring size of the output channel. Commands are never bounded.
    pub output_capacity: usize,
}

/// Logging settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct LoggingConfig {
    /// Logging level (trace, debug, info, warn, error).
    pub level: String,

    /// Optional log file. Logs go to stderr when unset.
    pub file: Option<PathBuf>,
}

impl Default for EndpointConfig {
    fn default() -> Self {
        Self {
            scheme: Scheme::Http,
            host: "127.0.0.1".to_string(),
            port: 8000,
            run_path: RUN_PATH.to_string(),
            pwd_path: PWD_PATH.to_string(),
        }
    }
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            connect_timeout_secs: 10,
            request_timeout_secs: 10,
            half_close: HalfClosePolicy::default(),
        }
    }
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            output_capacity: DEFAULT_OUTPUT_CAPACITY,
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            file: None,
        }
    }
}

impl SessionConfig {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}

/// Returns the default configuration file path.
pub fn default_config_path() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("cmdproc")
        .join("config.toml")
}

impl Config {
    /// Builds the endpoint described by this configuration.
    pub fn endpoint(&self) -> Endpoint {
        Endpoint::new(
            self.endpoint.scheme,
            self.endpoint.host.clone(),
            self.endpoint.port,
        )
        .with_run_path(self.endpoint.run_path.clone())
        .with_pwd_path(self.endpoint.pwd_path.clone())
    }

    /// Apply environment variable overrides to the configuration.
    ///
    /// Environment variables take precedence over config file values.
    /// Supported variables:
    /// - CMDPROC_SCHEME: Override the scheme (http, https)
    /// - CMDPROC_HOST: Override the host
    /// - CMDPROC_PORT: Override the port
    /// - CMDPROC_LOG_LEVEL: Override log level (trace, debug, info, warn, error)
    ///
    /// Runs before logging exists, so the caller logs the returned overrides
    /// once the subscriber is installed.
    pub fn apply_env_overrides(&mut self) -> Vec<EnvOverride> {
        let mut overrides = Vec::new();

        if let Some(value) = non_empty_env("CMDPROC_SCHEME") {
            match value.parse::<Scheme>() {
                Ok(scheme) => {
                    self.endpoint.scheme = scheme;
                    overrides.push(EnvOverride::applied("CMDPROC_SCHEME", value));
                }
                Err(e) => overrides.push(EnvOverride::ignored("CMDPROC_SCHEME", value, e)),
            }
        }

        if let Some(host) = non_empty_env("CMDPROC_HOST") {
            self.endpoint.host = host.clone();
            overrides.push(EnvOverride::applied("CMDPROC_HOST", host));
        }

        if let Some(value) = non_empty_env("CMDPROC_PORT") {
            match value.parse::<u16>() {
                Ok(port) => {
                    self.endpoint.port = port;
                    overrides.push(EnvOverride::applied("CMDPROC_PORT", value));
                }
                Err(e) => overrides.push(EnvOverride::ignored("CMDPROC_PORT", value, e)),
            }
        }

        if let Some(level) = non_empty_env("CMDPROC_LOG_LEVEL") {
            self.logging.level = level.clone();
            overrides.push(EnvOverride::applied("CMDPROC_LOG_LEVEL", level));
        }

        overrides
    }

    /// Validate the configuration values.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.endpoint.host.trim().is_empty() {
            return Err(ConfigError::EmptyHost);
        }

        if self.endpoint.port == 0 {
            return Err(ConfigError::InvalidPort(self.endpoint.port));
        }

        for (field, value) in [
            ("run_path", &self.endpoint.run_path),
            ("pwd_path", &self.endpoint.pwd_path),
        ] {
            if !value.starts_with('/') {
                return Err(ConfigError::InvalidPath {
                    field,
                    value: value.clone(),
                });
            }
        }

        let capacity = self.channels.output_capacity;
        if capacity == 0 || capacity > MAX_OUTPUT_CAPACITY {
            return Err(ConfigError::InvalidCapacity {
                got: capacity,
                max: MAX_OUTPUT_CAPACITY,
            });
        }

        for (field, value) in [
            ("connect_timeout_secs", self.session.connect_timeout_secs),
            ("request_timeout_secs", self.session.request_timeout_secs),
        ] {
            if value == 0 || value > MAX_TIMEOUT_SECS {
                return Err(ConfigError::InvalidTimeout { field, value });
            }
        }

        let level = self.logging.level.to_lowercase();
        if !VALID_LOG_LEVELS.contains(&level.as_str()) {
            return Err(ConfigError::InvalidLogLevel(self.logging.level.clone()));
        }

        Ok(())
    }

    /// Load configuration from a file.
    ///
    /// If the file does not exist, returns the default configuration.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();

        if !path.exists() {
            tracing::debug!("Config file not found at {:?}, using defaults", path);
            return Ok(Self::default());
        }

        let contents = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        Self::from_toml(&contents)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))
    }

    /// Load configuration from the default path.
    pub fn load_default() -> Result<Self> {
        Self::load(default_config_path())
    }

    /// Parse configuration from a TOML string.
    pub fn from_toml(toml_str: &str) -> Result<Self> {
        toml::from_str(toml_str)
            .map_err(|e| anyhow::anyhow!("Invalid TOML configuration: {}", format_toml_error(&e)))
    }

    /// Save configuration to a file, creating parent directories as needed.
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let path = path.as_ref();

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).with_context(|| {
                format!("Failed to create config directory: {}", parent.display())
            })?;
        }

        let contents = self.to_toml()?;
        fs::write(path, contents)
            .with_context(|| format!("Failed to write config file: {}", path.display()))?;

        tracing::debug!("Configuration saved to {:?}", path);
        Ok(())
    }

    /// Serialize configuration to a TOML string.
    pub fn to_toml(&self) -> Result<String> {
        toml::to_string_pretty(self).context("Failed to serialize configuration to TOML")
    }
}

/// One environment variable seen by [`Config::apply_env_overrides`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EnvOverride {
    Applied {
        variable: &'static str,
        value: String,
    },
    Ignored {
        variable: &'static str,
        value: String,
        reason: String,
    },
}

impl EnvOverride {
    fn applied(variable: &'static str, value: String) -> Self {
        Self::Applied { variable, value }
    }

    fn ignored(variable: &'static str, value: String, reason: impl std::fmt::Display) -> Self {
        Self::Ignored {
            variable,
            value,
            reason: reason.to_string(),
        }
    }

    /// Emit this override through `tracing`.
    pub fn log(&self) {
        match self {
            Self::Applied { variable, value } => {
                tracing::info!(%variable, %value, "Overriding configuration from environment")
            }
            Self::Ignored {
                variable,
                value,
                reason,
            } => tracing::warn!(%variable, %value, %reason, "Ignoring environment override"),
        }
    }
}

fn non_empty_env(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|value| !value.is_empty())
}

/// Format a TOML deserialization error for user-friendly display.
fn format_toml_error(error: &toml::de::Error) -> String {
    let mut msg = error.message().to_string();

    if let Some(span) = error.span() {
        msg.push_str(&format!(" (at position {}..{})", span.start, span.end));
    }

    msg
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;
    use tempfile::TempDir;

    #[test]
    fn test_default_config() {
        let config = Config::default();

        assert_eq!(config.endpoint.scheme, Scheme::Http);
        assert_eq!(config.endpoint.host, "127.0.0.1");
        assert_eq!(config.endpoint.port, 8000);
        assert_eq!(config.endpoint.run_path, "/run");
        assert_eq!(config.endpoint.pwd_path, "/pwd");
        assert_eq!(config.session.connect_timeout_secs, 10);
        assert_eq!(config.session.half_close, HalfClosePolicy::CloseBoth);
        assert_eq!(config.channels.output_capacity, DEFAULT_OUTPUT_CAPACITY);
        assert_eq!(config.logging.level, "info");
        assert!(config.logging.file.is_none());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_endpoint_from_config() {
        let config = Config::default();
        let endpoint = config.endpoint();
        assert_eq!(
            endpoint.run_url().unwrap().as_str(),
            "ws://127.0.0.1:8000/run"
        );
        assert_eq!(
            endpoint.pwd_url().unwrap().as_str(),
            "http://127.0.0.1:8000/pwd"
        );
    }

    #[test]
    fn test_from_toml_empty() {
        let config = Config::from_toml("").unwrap();
        assert_eq!(config, Config::default());
    }

    #[test]
    fn test_from_toml_partial() {
        let toml = r#"
[endpoint]
host = "192.168.220.103"

[session]
half_close = "independent"
"#;
        let config = Config::from_toml(toml).unwrap();

        assert_eq!(config.endpoint.host, "192.168.220.103");
        assert_eq!(config.session.half_close, HalfClosePolicy::Independent);
        assert_eq!(config.endpoint.port, 8000);
        assert_eq!(config.session.request_timeout_secs, 10);
    }

    #[test]
    fn test_from_toml_full() {
        let toml = r#"
[endpoint]
scheme = "https"
host = "shell.example.com"
port = 8443
run_path = "/ws/run"
pwd_path = "/ws/pwd"

[session]
connect_timeout_secs = 3
request_timeout_secs = 4
half_close = "close-both"

[channels]
output_capacity = 64

[logging]
level = "trace"
file = "/tmp/cmdproc.log"
"#;
        let config = Config::from_toml(toml).unwrap();

        assert_eq!(config.endpoint.scheme, Scheme::Https);
        assert_eq!(config.endpoint.host, "shell.example.com");
        assert_eq!(config.endpoint.port, 8443);
        assert_eq!(config.endpoint.run_path, "/ws/run");
        assert_eq!(config.endpoint.pwd_path, "/ws/pwd");
        assert_eq!(config.session.connect_timeout(), Duration::from_secs(3));
        assert_eq!(config.session.request_timeout(), Duration::from_secs(4));
        assert_eq!(config.session.half_close, HalfClosePolicy::CloseBoth);
        assert_eq!(config.channels.output_capacity, 64);
        assert_eq!(config.logging.level, "trace");
        assert_eq!(config.logging.file, Some(PathBuf::from("/tmp/cmdproc.log")));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_from_toml_invalid_syntax() {
        let toml = r#"
[endpoint
host = "x"
"#;
        let err = Config::from_toml(toml).unwrap_err().to_string();
        assert!(err.contains("Invalid TOML"));
    }

    #[test]
    fn test_from_toml_unknown_scheme() {
        let toml = r#"
[endpoint]
scheme = "gopher"
"#;
        assert!(Config::from_toml(toml).is_err());
    }

    #[test]
    fn test_roundtrip_custom() {
        let mut original = Config::default();
        original.endpoint.host = "10.0.0.5".to_string();
        original.endpoint.port = 9001;
        original.session.half_close = HalfClosePolicy::Independent;
        original.logging.file = Some(PathBuf::from("/var/log/cmdproc.log"));

        let toml = original.to_toml().unwrap();
        let loaded = Config::from_toml(&toml).unwrap();
        assert_eq!(original, loaded);
    }

    #[test]
    fn test_load_missing_file() {
        let config = Config::load("/nonexistent/path/config.toml").unwrap();
        assert_eq!(config, Config::default());
    }

    #[test]
    fn test_save_and_load() {
        let temp_dir = TempDir::new().unwrap();
        let config_path = temp_dir.path().join("nested").join("config.toml");

        let mut original = Config::default();
        original.endpoint.host = "example.internal".to_string();
        original.channels.output_capacity = 32;

        original.save(&config_path).unwrap();
        assert!(config_path.exists());
        let loaded = Config::load(&config_path).unwrap();
        assert_eq!(original, loaded);
    }

    #[test]
    fn test_load_invalid_file_mentions_path() {
        let temp_dir = TempDir::new().unwrap();
        let config_path = temp_dir.path().join("config.toml");
        fs::write(&config_path, "[channels]\noutput_capacity = \"many\"\n").unwrap();

        let err = Config::load(&config_path).unwrap_err();
        assert!(format!("{:#}", err).contains("config.toml"));
    }

    #[test]
    fn test_validate_empty_host() {
        let mut config = Config::default();
        config.endpoint.host = " ".to_string();
        assert_eq!(config.validate(), Err(ConfigError::EmptyHost));
    }

    #[test]
    fn test_validate_port_zero() {
        let mut config = Config::default();
        config.endpoint.port = 0;
        assert_eq!(config.validate(), Err(ConfigError::InvalidPort(0)));
    }

    #[test]
    fn test_validate_relative_path() {
        let mut config = Config::default();
        config.endpoint.run_path = "run".to_string();
        assert_eq!(
            config.validate(),
            Err(ConfigError::InvalidPath {
                field: "run_path",
                value: "run".to_string()
            })
        );
    }

    #[test]
    fn test_validate_capacity() {
        let mut config = Config::default();
        config.channels.output_capacity = 0;
        assert!(matches!(
            config.validate(),
            Err(ConfigError::InvalidCapacity { got: 0, .. })
        ));
    }

    #[test]
    fn test_validate_timeouts() {
        let mut config = Config::default();
        config.session.request_timeout_secs = 0;
        assert_eq!(
            config.validate(),
            Err(ConfigError::InvalidTimeout {
                field: "request_timeout_secs",
                value: 0
            })
        );

        let mut config = Config::default();
        config.session.connect_timeout_secs = 3601;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_log_level() {
        let mut config = Config::default();
        config.logging.level = "loud".to_string();
        assert_eq!(
            config.validate(),
            Err(ConfigError::InvalidLogLevel("loud".to_string()))
        );

        config.logging.level = "DEBUG".to_string();
        assert!(config.validate().is_ok());
    }

    #[test]
    #[serial]
    fn test_env_overrides() {
        std::env::set_var("CMDPROC_HOST", "override.host");
        std::env::set_var("CMDPROC_PORT", "9999");
        std::env::set_var("CMDPROC_SCHEME", "https");
        std::env::set_var("CMDPROC_LOG_LEVEL", "debug");

        let mut config = Config::default();
        let overrides = config.apply_env_overrides();

        std::env::remove_var("CMDPROC_HOST");
        std::env::remove_var("CMDPROC_PORT");
        std::env::remove_var("CMDPROC_SCHEME");
        std::env::remove_var("CMDPROC_LOG_LEVEL");

        assert_eq!(overrides.len(), 4);
        assert!(overrides.contains(&EnvOverride::Applied {
            variable: "CMDPROC_HOST",
            value: "override.host".to_string(),
        }));
        assert!(overrides
            .iter()
            .all(|o| matches!(o, EnvOverride::Applied { .. })));

        assert_eq!(config.endpoint.host, "override.host");
        assert_eq!(config.endpoint.port, 9999);
        assert_eq!(config.endpoint.scheme, Scheme::Https);
        assert_eq!(config.logging.level, "debug");
    }

    #[test]
    #[serial]
    fn test_env_overrides_ignore_invalid_values() {
        std::env::set_var("CMDPROC_PORT", "not-a-port");
        std::env::set_var("CMDPROC_SCHEME", "gopher");
        std::env::set_var("CMDPROC_HOST", "");

        let mut config = Config::default();
        let overrides = config.apply_env_overrides();

        std::env::remove_var("CMDPROC_PORT");
        std::env::remove_var("CMDPROC_SCHEME");
        std::env::remove_var("CMDPROC_HOST");

        assert_eq!(config, Config::default());
        // The empty host is skipped, the other two are reported.
        assert_eq!(overrides.len(), 2);
        assert!(overrides.iter().any(|o| matches!(
            o,
            EnvOverride::Ignored { variable: "CMDPROC_PORT", value, .. } if value == "not-a-port"
        )));
        assert!(overrides.iter().any(|o| matches!(
            o,
            EnvOverride::Ignored { variable: "CMDPROC_SCHEME", value, .. } if value == "gopher"
        )));
    }

    #[test]
    fn test_default_config_path() {
        let path = default_config_path();
        assert!(path.ends_with("cmdproc/config.toml"));
    }
}
