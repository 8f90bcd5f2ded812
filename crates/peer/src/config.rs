//! Configuration management for the DashDrop peer.
//!
//! This module provides TOML-based configuration file loading and saving.
//! The default configuration path is `~/.config/dashdrop/config.toml`.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use protocol::DeviceType;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::session::SaveDirProvider;

/// Configuration validation errors.
#[derive(Debug, Error, PartialEq)]
pub enum ConfigError {
    #[error("device name must not be empty")]
    EmptyDeviceName,

    #[error("device_type must be one of: python, java, swift; got {0}")]
    InvalidDeviceType(String),

    #[error("{name} must be a non-zero port")]
    ZeroPort { name: &'static str },

    #[error("{first} and {second} must differ, both are {port}")]
    PortCollision {
        first: &'static str,
        second: &'static str,
        port: u16,
    },

    #[error("broadcast_address is not an IPv4 address: {0}")]
    InvalidBroadcastAddress(String),

    #[error("discovery_attempts must be greater than 0")]
    ZeroDiscoveryAttempts,

    #[error("discovery_window_secs must be greater than 0")]
    ZeroDiscoveryWindow,

    #[error("max_password_attempts must be greater than 0")]
    ZeroPasswordAttempts,

    #[error("log_level must be one of: trace, debug, info, warn, error; got {0}")]
    InvalidLogLevel(String),
}

/// Valid log level values for tracing configuration.
const VALID_LOG_LEVELS: &[&str] = &["trace", "debug", "info", "warn", "error"];

/// Main configuration structure for a DashDrop peer.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(default)]
pub struct Config {
    /// How this peer presents itself.
    pub device: DeviceConfig,

    /// Discovery and handshake ports.
    pub network: NetworkConfig,

    /// Where received files go and how they are protected.
    pub transfer: TransferConfig,

    /// Log output settings.
    pub logging: LoggingConfig,
}

/// Identity announced during discovery and the handshake.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct DeviceConfig {
    /// Display name sent in discovery replies.
    pub name: String,

    /// Device type tag sent in the handshake.
    pub device_type: String,
}

/// Network configuration for discovery and session setup.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct NetworkConfig {
    /// UDP port receivers listen on for `DISCOVER`.
    pub discovery_port: u16,

    /// UDP port senders collect `RECEIVER:` replies on.
    pub reply_port: u16,

    /// TCP port of the handshake listener.
    pub handshake_port: u16,

    /// Destination of discovery broadcasts.
    pub broadcast_address: String,

    /// Seconds to collect replies per discovery attempt.
    pub discovery_window_secs: u64,

    /// Broadcast attempts before giving up with an empty list.
    pub discovery_attempts: u32,

    /// Timeout for outgoing TCP connects.
    pub connect_timeout_secs: u64,

    /// Fixed data listener port. Unset uses the profile default; 0 picks an
    /// ephemeral port.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data_port: Option<u16>,
}

/// Transfer configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct TransferConfig {
    /// Default directory for received files.
    pub save_dir: PathBuf,

    /// Scratch directory for encrypted copies before sending.
    pub temp_dir: PathBuf,

    /// Encrypt outgoing files by default.
    pub encryption: bool,

    /// Password attempts before pending encrypted files are deleted.
    pub max_password_attempts: u32,
}

/// Logging configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct LoggingConfig {
    /// Logging level (trace, debug, info, warn, error).
    pub level: String,

    /// Directory for the rolling log file.
    pub directory: PathBuf,
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            name: default_device_name(),
            device_type: DeviceType::Desktop.as_tag().to_string(),
        }
    }
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            discovery_port: 12345,
            reply_port: 12346,
            handshake_port: 12348,
            broadcast_address: "255.255.255.255".to_string(),
            discovery_window_secs: 5,
            discovery_attempts: 3,
            connect_timeout_secs: 10,
            data_port: None,
        }
    }
}

impl Default for TransferConfig {
    fn default() -> Self {
        Self {
            save_dir: default_save_dir(),
            temp_dir: default_cache_dir().join("tmp"),
            encryption: false,
            max_password_attempts: 3,
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            directory: default_cache_dir(),
        }
    }
}

/// Returns the default configuration file path.
pub fn default_config_path() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("dashdrop")
        .join("config.toml")
}

fn default_save_dir() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("received")
}

fn default_cache_dir() -> PathBuf {
    dirs::cache_dir()
        .unwrap_or_else(std::env::temp_dir)
        .join("dashdrop")
}

/// Host name from the environment, falling back to a fixed name.
fn default_device_name() -> String {
    ["HOSTNAME", "COMPUTERNAME"]
        .iter()
        .filter_map(|var| std::env::var(var).ok())
        .find(|name| !name.trim().is_empty())
        .unwrap_or_else(|| "dashdrop".to_string())
}

impl NetworkConfig {
    pub fn discovery_window(&self) -> Duration {
        Duration::from_secs(self.discovery_window_secs)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }
}

impl Config {
    /// Device type parsed from its tag.
    pub fn device_type(&self) -> DeviceType {
        DeviceType::from_tag(&self.device.device_type)
    }

    /// Apply environment variable overrides to the configuration.
    ///
    /// Environment variables take precedence over config file values.
    /// Supported variables:
    /// - DASHDROP_DEVICE_NAME: Override the announced device name
    /// - DASHDROP_SAVE_DIR: Override the default save directory
    /// - DASHDROP_LOG_LEVEL: Override log level (trace, debug, info, warn, error)
    pub fn apply_env_overrides(&mut self) {
        if let Ok(name) = std::env::var("DASHDROP_DEVICE_NAME") {
            if !name.is_empty() {
                tracing::info!("Overriding device name from environment: {}", name);
                self.device.name = name;
            }
        }

        if let Ok(dir) = std::env::var("DASHDROP_SAVE_DIR") {
            if !dir.is_empty() {
                tracing::info!("Overriding save_dir from environment: {}", dir);
                self.transfer.save_dir = PathBuf::from(dir);
            }
        }

        if let Ok(level) = std::env::var("DASHDROP_LOG_LEVEL") {
            if !level.is_empty() {
                tracing::info!("Overriding log level from environment: {}", level);
                self.logging.level = level;
            }
        }
    }

    /// Validate the configuration values.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.device.name.trim().is_empty() {
            return Err(ConfigError::EmptyDeviceName);
        }

        if !self.device_type().is_compatible() {
            return Err(ConfigError::InvalidDeviceType(self.device.device_type.clone()));
        }

        let ports = [
            ("discovery_port", self.network.discovery_port),
            ("reply_port", self.network.reply_port),
            ("handshake_port", self.network.handshake_port),
        ];
        for (name, port) in ports {
            if port == 0 {
                return Err(ConfigError::ZeroPort { name });
            }
        }
        for (i, (first, a)) in ports.iter().enumerate() {
            for (second, b) in &ports[i + 1..] {
                if a == b {
                    return Err(ConfigError::PortCollision {
                        first: *first,
                        second: *second,
                        port: *a,
                    });
                }
            }
        }

        if self
            .network
            .broadcast_address
            .parse::<std::net::Ipv4Addr>()
            .is_err()
        {
            return Err(ConfigError::InvalidBroadcastAddress(
                self.network.broadcast_address.clone(),
            ));
        }

        if self.network.discovery_attempts == 0 {
            return Err(ConfigError::ZeroDiscoveryAttempts);
        }

        if self.network.discovery_window_secs == 0 {
            return Err(ConfigError::ZeroDiscoveryWindow);
        }

        if self.transfer.max_password_attempts == 0 {
            return Err(ConfigError::ZeroPasswordAttempts);
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
    /// If the file exists but is invalid TOML, returns an error with
    /// a helpful message.
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

    /// Save configuration to a file.
    ///
    /// Creates parent directories if they don't exist.
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

impl SaveDirProvider for Config {
    fn save_dir(&self) -> PathBuf {
        self.transfer.save_dir.clone()
    }
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

        assert_eq!(config.device.device_type, "python");
        assert!(!config.device.name.is_empty());
        assert_eq!(config.network.discovery_port, 12345);
        assert_eq!(config.network.reply_port, 12346);
        assert_eq!(config.network.handshake_port, 12348);
        assert_eq!(config.network.broadcast_address, "255.255.255.255");
        assert_eq!(config.network.discovery_window(), Duration::from_secs(5));
        assert_eq!(config.network.discovery_attempts, 3);
        assert_eq!(config.network.data_port, None);
        assert!(!config.transfer.encryption);
        assert_eq!(config.transfer.max_password_attempts, 3);
        assert!(config.transfer.save_dir.ends_with("received"));
        assert_eq!(config.logging.level, "info");
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_from_toml_empty() {
        let config = Config::from_toml("").unwrap();
        assert_eq!(config, Config::default());
    }

    #[test]
    fn test_from_toml_partial() {
        let toml = r#"
[device]
name = "studio-mac"

[transfer]
encryption = true
"#;
        let config = Config::from_toml(toml).unwrap();

        assert_eq!(config.device.name, "studio-mac");
        assert!(config.transfer.encryption);
        assert_eq!(config.network, NetworkConfig::default());
    }

    #[test]
    fn test_from_toml_full() {
        let toml = r#"
[device]
name = "laptop"
device_type = "python"

[network]
discovery_port = 22345
reply_port = 22346
handshake_port = 22348
broadcast_address = "192.168.1.255"
discovery_window_secs = 2
discovery_attempts = 5
connect_timeout_secs = 3
data_port = 0

[transfer]
save_dir = "/srv/inbox"
temp_dir = "/tmp/dd"
encryption = true
max_password_attempts = 5

[logging]
level = "debug"
directory = "/var/log/dashdrop"
"#;
        let config = Config::from_toml(toml).unwrap();

        assert_eq!(config.network.discovery_port, 22345);
        assert_eq!(config.network.broadcast_address, "192.168.1.255");
        assert_eq!(config.network.data_port, Some(0));
        assert_eq!(config.network.connect_timeout(), Duration::from_secs(3));
        assert_eq!(config.transfer.save_dir, PathBuf::from("/srv/inbox"));
        assert_eq!(config.transfer.temp_dir, PathBuf::from("/tmp/dd"));
        assert_eq!(config.transfer.max_password_attempts, 5);
        assert_eq!(config.logging.directory, PathBuf::from("/var/log/dashdrop"));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_from_toml_invalid_syntax() {
        let toml = r#"
[device
name = "x"
"#;
        let err = Config::from_toml(toml).unwrap_err().to_string();
        assert!(err.contains("Invalid TOML"));
    }

    #[test]
    fn test_from_toml_wrong_type() {
        let toml = r#"
[network]
discovery_port = "not a number"
"#;
        assert!(Config::from_toml(toml).is_err());
    }

    #[test]
    fn test_roundtrip_custom() {
        let mut original = Config::default();
        original.device.name = "kitchen".to_string();
        original.network.data_port = Some(40000);
        original.transfer.encryption = true;

        let toml = original.to_toml().unwrap();
        assert!(toml.contains("[device]"));
        assert!(toml.contains("[transfer]"));
        assert_eq!(Config::from_toml(&toml).unwrap(), original);
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
        original.logging.level = "debug".to_string();
        original.save(&config_path).unwrap();

        assert_eq!(Config::load(&config_path).unwrap(), original);
    }

    #[test]
    fn test_load_invalid_file() {
        let temp_dir = TempDir::new().unwrap();
        let config_path = temp_dir.path().join("config.toml");
        fs::write(&config_path, "invalid [ toml").unwrap();

        let err = Config::load(&config_path).unwrap_err().to_string();
        assert!(err.contains("Failed to parse config file"));
    }

    #[test]
    fn test_default_config_path() {
        let path = default_config_path();
        assert!(path.to_string_lossy().contains("dashdrop"));
        assert!(path.ends_with("config.toml"));
    }

    #[test]
    fn test_save_dir_provider() {
        let mut config = Config::default();
        config.transfer.save_dir = PathBuf::from("/data/inbox");
        assert_eq!(SaveDirProvider::save_dir(&config), PathBuf::from("/data/inbox"));
    }

    #[test]
    fn test_validate_rejects_empty_name() {
        let mut config = Config::default();
        config.device.name = "  ".to_string();
        assert_eq!(config.validate(), Err(ConfigError::EmptyDeviceName));
    }

    #[test]
    fn test_validate_rejects_unknown_device_type() {
        let mut config = Config::default();
        config.device.device_type = "kotlin".to_string();
        assert_eq!(
            config.validate(),
            Err(ConfigError::InvalidDeviceType("kotlin".to_string()))
        );
    }

    #[test]
    fn test_validate_ports() {
        let mut config = Config::default();
        config.network.reply_port = 0;
        assert_eq!(
            config.validate(),
            Err(ConfigError::ZeroPort { name: "reply_port" })
        );

        let mut config = Config::default();
        config.network.handshake_port = config.network.discovery_port;
        assert_eq!(
            config.validate(),
            Err(ConfigError::PortCollision {
                first: "discovery_port",
                second: "handshake_port",
                port: 12345,
            })
        );
    }

    #[test]
    fn test_validate_discovery_and_attempts() {
        let mut config = Config::default();
        config.network.discovery_attempts = 0;
        assert_eq!(config.validate(), Err(ConfigError::ZeroDiscoveryAttempts));

        let mut config = Config::default();
        config.network.discovery_window_secs = 0;
        assert_eq!(config.validate(), Err(ConfigError::ZeroDiscoveryWindow));

        let mut config = Config::default();
        config.transfer.max_password_attempts = 0;
        assert_eq!(config.validate(), Err(ConfigError::ZeroPasswordAttempts));

        let mut config = Config::default();
        config.network.broadcast_address = "everyone".to_string();
        assert!(matches!(
            config.validate(),
            Err(ConfigError::InvalidBroadcastAddress(_))
        ));
    }

    #[test]
    fn test_validate_log_level() {
        let mut config = Config::default();
        config.logging.level = "WARN".to_string();
        assert!(config.validate().is_ok());

        config.logging.level = "verbose".to_string();
        assert_eq!(
            config.validate(),
            Err(ConfigError::InvalidLogLevel("verbose".to_string()))
        );
    }

    #[test]
    #[serial]
    fn test_env_overrides() {
        std::env::set_var("DASHDROP_DEVICE_NAME", "env-device");
        std::env::set_var("DASHDROP_SAVE_DIR", "/env/inbox");
        std::env::set_var("DASHDROP_LOG_LEVEL", "trace");

        let mut config = Config::default();
        config.apply_env_overrides();

        assert_eq!(config.device.name, "env-device");
        assert_eq!(config.transfer.save_dir, PathBuf::from("/env/inbox"));
        assert_eq!(config.logging.level, "trace");

        std::env::remove_var("DASHDROP_DEVICE_NAME");
        std::env::remove_var("DASHDROP_SAVE_DIR");
        std::env::remove_var("DASHDROP_LOG_LEVEL");
    }

    #[test]
    #[serial]
    fn test_env_override_empty_does_not_override() {
        std::env::set_var("DASHDROP_DEVICE_NAME", "");

        let mut config = Config::default();
        let original = config.device.name.clone();
        config.apply_env_overrides();
        assert_eq!(config.device.name, original);

        std::env::remove_var("DASHDROP_DEVICE_NAME");
    }
}
