//! Configuration
//!
//! TOML-based configuration with environment variable overrides
//! (`TETHERMQ_*` prefix) and `${VAR}` / `${VAR:-default}` substitution
//! inside the config file.

use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;

use config::{Environment, File, FileFormat};
use regex::Regex;
use serde::Deserialize;

use crate::broker::{BrokerConfig, TlsConfig};
use crate::transport::TransportConfig;


/// Substitute environment variables in a string.
/// Supports `${VAR}` and `${VAR:-default}` syntax.
fn substitute_env_vars(content: &str) -> String {
    let re = Regex::new(r"\$\{([^}:]+)(?::-([^}]*))?\}").unwrap();
    re.replace_all(content, |caps: &regex::Captures| {
        let var_name = &caps[1];
        let default = caps.get(2).map(|m| m.as_str()).unwrap_or("");
        std::env::var(var_name).unwrap_or_else(|_| default.to_string())
    })
    .to_string()
}

/// Configuration error types
#[derive(Debug)]
pub enum ConfigError {
    /// IO error reading the config file
    Io(std::io::Error),
    /// Config crate error
    Config(config::ConfigError),
    /// Validation error
    Validation(String),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::Io(e) => write!(f, "IO error: {}", e),
            ConfigError::Config(e) => write!(f, "config error: {}", e),
            ConfigError::Validation(msg) => write!(f, "validation error: {}", msg),
        }
    }
}

impl std::error::Error for ConfigError {}

impl From<std::io::Error> for ConfigError {
    fn from(e: std::io::Error) -> Self {
        ConfigError::Io(e)
    }
}

impl From<config::ConfigError> for ConfigError {
    fn from(e: config::ConfigError) -> Self {
        ConfigError::Config(e)
    }
}

/// Root configuration structure
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct Config {
    /// Logging configuration
    pub log: LogConfig,
    /// Listener configuration
    pub server: ServerConfig,
    /// Connection limits
    pub limits: LimitsConfig,
}

/// Logging configuration
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    /// Log level: error, warn, info, debug, trace
    pub level: String,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

/// Listener configuration
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// MQTT over TCP bind address
    pub bind: Option<SocketAddr>,
    /// MQTT over TLS bind address (requires `tls`)
    pub tls_bind: Option<SocketAddr>,
    /// MQTT over WebSocket bind address
    pub ws_bind: Option<SocketAddr>,
    /// MQTT over WebSocket-over-TLS bind address (requires `tls`)
    pub wss_bind: Option<SocketAddr>,
    /// WebSocket upgrade path
    pub ws_path: String,
    /// Metrics and debug HTTP bind address
    pub admin_bind: Option<SocketAddr>,
    /// TLS configuration (required when tls_bind or wss_bind is set)
    pub tls: Option<ServerTlsConfig>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: Some("0.0.0.0:1883".parse().unwrap()),
            tls_bind: None,
            ws_bind: None,
            wss_bind: None,
            ws_path: "/mqtt".to_string(),
            admin_bind: None,
            tls: None,
        }
    }
}

/// TLS certificate locations
#[derive(Debug, Clone, Deserialize, Default)]
pub struct ServerTlsConfig {
    /// Path to the certificate chain (PEM)
    pub cert: String,
    /// Path to the private key (PEM)
    pub key: String,
}

/// Connection limits
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LimitsConfig {
    /// Live connections allowed per remote IP (0 = unlimited)
    pub max_connections_per_ip: usize,
    /// Live connections allowed per username (0 = unlimited)
    pub max_connections_per_user: usize,
    /// Maximum accepted packet size in bytes
    pub max_packet_size: usize,
    /// How long a fresh connection may take to present its CONNECT
    #[serde(with = "humantime_serde")]
    pub connect_timeout: Duration,
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            max_connections_per_ip: 0,
            max_connections_per_user: 0,
            max_packet_size: crate::codec::DEFAULT_MAX_PACKET_SIZE,
            connect_timeout: Duration::from_secs(30),
        }
    }
}

impl Config {
    /// Load configuration from a TOML file, with `${VAR}` substitution and
    /// `TETHERMQ_*` environment overrides applied on top.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        let content = substitute_env_vars(&content);

        let config = config::Config::builder()
            .add_source(File::from_str(&content, FileFormat::Toml))
            .add_source(Environment::with_prefix("TETHERMQ").separator("__"))
            .build()?;

        let config: Config = config.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    /// Configuration from environment variables and defaults only
    pub fn from_env() -> Result<Self, ConfigError> {
        let config = config::Config::builder()
            .add_source(Environment::with_prefix("TETHERMQ").separator("__"))
            .build()?;

        let config: Config = config.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if (self.server.tls_bind.is_some() || self.server.wss_bind.is_some())
            && self.server.tls.is_none()
        {
            return Err(ConfigError::Validation(
                "tls_bind/wss_bind require a [server.tls] section".to_string(),
            ));
        }
        if self.server.bind.is_none()
            && self.server.tls_bind.is_none()
            && self.server.ws_bind.is_none()
            && self.server.wss_bind.is_none()
        {
            return Err(ConfigError::Validation(
                "at least one listener must be configured".to_string(),
            ));
        }
        Ok(())
    }

    /// Translate into the broker's runtime configuration
    pub fn broker_config(&self) -> BrokerConfig {
        BrokerConfig {
            bind_addr: self.server.bind,
            tls_bind_addr: self.server.tls_bind,
            ws_bind_addr: self.server.ws_bind,
            wss_bind_addr: self.server.wss_bind,
            ws_path: self.server.ws_path.clone(),
            admin_bind_addr: self.server.admin_bind,
            tls: self.server.tls.as_ref().map(|tls| TlsConfig {
                cert_path: tls.cert.clone(),
                key_path: tls.key.clone(),
            }),
            max_packet_size: self.limits.max_packet_size,
            max_connections_per_ip: self.limits.max_connections_per_ip,
            max_connections_per_user: self.limits.max_connections_per_user,
            connect_timeout: self.limits.connect_timeout,
            transport: TransportConfig::default(),
        }
    }
}
