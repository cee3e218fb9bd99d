//! Client configuration.
//!
//! Configuration is loaded in the following order (later overrides earlier):
//! 1. Default values
//! 2. YAML config file (if specified via HSMWIRE_CONFIG)
//! 3. Environment variables

use hsmwire_deadline::CoordinatorConfig;
use hsmwire_protocol::frame::MAX_TRACE_WIDTH;
use hsmwire_protocol::CodecConfig;
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Default read buffer size (8 KiB).
pub const DEFAULT_READ_BUFFER_SIZE: usize = 8 * 1024;

/// Minimum read buffer size (256 bytes).
pub const MIN_READ_BUFFER_SIZE: usize = 256;

/// Maximum read buffer size (1 MiB).
pub const MAX_READ_BUFFER_SIZE: usize = 1024 * 1024;

/// Client configuration.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Network configuration.
    pub network: NetworkConfig,
    /// Codec configuration (trace width, masking, transforms).
    pub protocol: CodecConfig,
    /// Deadline coordinator configuration.
    pub deadline: CoordinatorConfig,
    /// Command catalog location.
    pub catalog: CatalogConfig,
}

impl Config {
    /// Loads configuration from file, then applies environment variable overrides.
    pub fn load() -> Result<Self, ConfigError> {
        let mut config = Self::default();

        if let Ok(path) = std::env::var("HSMWIRE_CONFIG") {
            config = Self::from_file(&path)?;
        }

        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    /// Loads configuration from a YAML file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::IoError(path.to_path_buf(), e))?;
        let config: Config = serde_yaml::from_str(&content)
            .map_err(|e| ConfigError::ParseError(path.to_path_buf(), e.to_string()))?;
        Ok(config)
    }

    /// Loads configuration from environment variables only.
    pub fn from_env() -> Self {
        let mut config = Self::default();
        config.apply_env_overrides();
        config
    }

    fn apply_env_overrides(&mut self) {
        self.network.apply_env_overrides();
        self.catalog.apply_env_overrides();

        if let Ok(width) = std::env::var("HSMWIRE_TRACE_WIDTH") {
            if let Ok(w) = width.parse() {
                self.protocol.trace_width = w;
            }
        }

        if let Ok(fields) = std::env::var("HSMWIRE_MASKED_FIELDS") {
            self.protocol.masking.fields = fields
                .split(',')
                .map(str::trim)
                .filter(|f| !f.is_empty())
                .map(String::from)
                .collect();
        }

        if let Ok(interval) = std::env::var("HSMWIRE_SWEEP_INTERVAL_MS") {
            if let Ok(ms) = interval.parse() {
                self.deadline.sweep_interval_ms = ms;
            }
        }
    }

    /// Checks values that would otherwise fail later at connection time.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let width = self.protocol.trace_width;
        if width == 0 || width > MAX_TRACE_WIDTH {
            return Err(ConfigError::ValidationError(format!(
                "protocol.trace_width must be between 1 and {}, got {}",
                MAX_TRACE_WIDTH, width
            )));
        }
        if self.deadline.sweep_interval_ms == 0 {
            return Err(ConfigError::ValidationError(
                "deadline.sweep_interval_ms must be positive".to_string(),
            ));
        }
        if self.catalog.path.as_os_str().is_empty() {
            return Err(ConfigError::ValidationError(
                "catalog.path must be set".to_string(),
            ));
        }
        Ok(())
    }

    /// Saves configuration to a YAML file.
    pub fn save(&self, path: impl AsRef<Path>) -> Result<(), ConfigError> {
        let path = path.as_ref();
        let content = serde_yaml::to_string(self)
            .map_err(|e| ConfigError::ParseError(path.to_path_buf(), e.to_string()))?;
        std::fs::write(path, content).map_err(|e| ConfigError::IoError(path.to_path_buf(), e))?;
        Ok(())
    }
}

/// Network configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    /// HSM address.
    #[serde(with = "socket_addr_serde")]
    pub addr: SocketAddr,
    /// TCP connect timeout in milliseconds.
    pub connect_timeout_ms: u64,
    /// Deadline applied to requests that carry none, in milliseconds (0 = unbounded).
    pub request_timeout_ms: u64,
    /// Read buffer size for socket reads.
    pub read_buffer_size: usize,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            addr: SocketAddr::from(([127, 0, 0, 1], hsmwire_protocol::DEFAULT_PORT)),
            connect_timeout_ms: 5_000,
            request_timeout_ms: 10_000,
            read_buffer_size: DEFAULT_READ_BUFFER_SIZE,
        }
    }
}

impl NetworkConfig {
    fn apply_env_overrides(&mut self) {
        if let Ok(addr) = std::env::var("HSMWIRE_ADDR") {
            if let Ok(parsed) = addr.parse() {
                self.addr = parsed;
            }
        }

        if let Ok(timeout) = std::env::var("HSMWIRE_CONNECT_TIMEOUT_MS") {
            if let Ok(ms) = timeout.parse() {
                self.connect_timeout_ms = ms;
            }
        }

        if let Ok(timeout) = std::env::var("HSMWIRE_REQUEST_TIMEOUT_MS") {
            if let Ok(ms) = timeout.parse() {
                self.request_timeout_ms = ms;
            }
        }
    }

    /// Returns connect timeout as Duration.
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    /// Returns the default request timeout, if requests are bounded.
    pub fn request_timeout(&self) -> Option<Duration> {
        (self.request_timeout_ms > 0).then(|| Duration::from_millis(self.request_timeout_ms))
    }
}

/// Command catalog configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CatalogConfig {
    /// Path to the YAML or JSON catalog.
    pub path: PathBuf,
}

impl Default for CatalogConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("./catalog/payshield.yaml"),
        }
    }
}

impl CatalogConfig {
    fn apply_env_overrides(&mut self) {
        if let Ok(path) = std::env::var("HSMWIRE_CATALOG") {
            self.path = PathBuf::from(path);
        }
    }
}

/// Configuration error.
#[derive(Debug)]
pub enum ConfigError {
    IoError(PathBuf, std::io::Error),
    ParseError(PathBuf, String),
    ValidationError(String),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::IoError(path, e) => {
                write!(f, "failed to read config file '{}': {}", path.display(), e)
            }
            ConfigError::ParseError(path, e) => {
                write!(f, "failed to parse config file '{}': {}", path.display(), e)
            }
            ConfigError::ValidationError(msg) => {
                write!(f, "configuration validation failed: {}", msg)
            }
        }
    }
}

impl std::error::Error for ConfigError {}

/// Custom serde module for SocketAddr (to handle as string in YAML).
mod socket_addr_serde {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::net::SocketAddr;

    pub fn serialize<S>(addr: &SocketAddr, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&addr.to_string())
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<SocketAddr, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.network.addr.port(), 1500);
        assert_eq!(config.network.request_timeout(), Some(Duration::from_secs(10)));
        assert_eq!(config.protocol.trace_width, 4);
        assert_eq!(config.deadline.sweep_interval(), Duration::from_millis(500));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_unbounded_requests() {
        let network = NetworkConfig {
            request_timeout_ms: 0,
            ..NetworkConfig::default()
        };
        assert_eq!(network.request_timeout(), None);
    }

    #[test]
    fn test_from_file_partial() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("hsmwire.yaml");
        std::fs::write(
            &path,
            r##"
network:
  addr: "10.0.0.5:1501"
protocol:
  trace_width: 6
  masking:
    fields: [key, pin_block]
    mask_char: "#"
  non_correctable_fields: [data]
deadline:
  sweep_interval_ms: 250
catalog:
  path: /etc/hsmwire/catalog.yaml
"##,
        )
        .unwrap();

        let config = Config::from_file(&path).unwrap();
        assert_eq!(config.network.addr, "10.0.0.5:1501".parse().unwrap());
        assert_eq!(config.network.connect_timeout(), Duration::from_secs(5));
        assert_eq!(config.protocol.trace_width, 6);
        assert!(config.protocol.masking.is_masked("pin_block"));
        assert_eq!(config.protocol.masking.mask_char, '#');
        assert_eq!(config.protocol.key_schemes.len(), 1);
        assert_eq!(config.deadline.sweep_interval_ms, 250);
        assert_eq!(config.catalog.path, PathBuf::from("/etc/hsmwire/catalog.yaml"));
    }

    #[test]
    fn test_from_file_errors() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("missing.yaml");
        assert!(matches!(
            Config::from_file(&missing),
            Err(ConfigError::IoError(..))
        ));

        let bad = dir.path().join("bad.yaml");
        std::fs::write(&bad, "network: [not, a, map]").unwrap();
        let err = Config::from_file(&bad).unwrap_err();
        assert!(err.to_string().contains("failed to parse"));
    }

    #[test]
    fn test_validation() {
        let mut config = Config::default();
        config.protocol.trace_width = 19;
        assert!(matches!(
            config.validate(),
            Err(ConfigError::ValidationError(_))
        ));

        let mut config = Config::default();
        config.deadline.sweep_interval_ms = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_yaml_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("roundtrip.yaml");
        let config = Config::default();
        config.save(&path).unwrap();
        assert_eq!(Config::from_file(&path).unwrap(), config);
    }
}
