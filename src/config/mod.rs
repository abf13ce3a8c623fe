//! Configuration Module
//!
//! TOML configuration for TideMQ, layered as:
//! - built-in defaults
//! - an optional file, with `${VAR}` / `${VAR:-default}` substitution
//! - environment overrides (`TIDEMQ__` prefix)

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::Path;
use std::time::Duration;

use config::{Environment, File, FileFormat};
use regex::Regex;
use serde::Deserialize;

use crate::broker::{BrokerConfig, PoolConfig};
use crate::codec::MAX_REMAINING_LENGTH;
use crate::hooks::StaticCredentials;


/// Substitute environment variables in a string.
/// Supports `${VAR}` and `${VAR:-default}` syntax.
fn substitute_env_vars(content: &str) -> Result<String, ConfigError> {
    let re = Regex::new(r"\$\{([^}:]+)(?::-([^}]*))?\}")
        .map_err(|e| ConfigError::Validation(e.to_string()))?;
    Ok(re
        .replace_all(content, |caps: &regex::Captures| {
            let default = caps.get(2).map(|m| m.as_str()).unwrap_or("");
            std::env::var(&caps[1]).unwrap_or_else(|_| default.to_string())
        })
        .into_owned())
}

/// Configuration error types
#[derive(Debug)]
pub enum ConfigError {
    /// IO error reading config file
    Io(std::io::Error),
    /// TOML parsing error
    Parse(toml::de::Error),
    /// Config crate error
    Config(config::ConfigError),
    /// Validation error
    Validation(String),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::Io(e) => write!(f, "IO error: {}", e),
            ConfigError::Parse(e) => write!(f, "Parse error: {}", e),
            ConfigError::Config(e) => write!(f, "Config error: {}", e),
            ConfigError::Validation(msg) => write!(f, "Validation error: {}", msg),
        }
    }
}

impl std::error::Error for ConfigError {}

impl From<std::io::Error> for ConfigError {
    fn from(e: std::io::Error) -> Self {
        ConfigError::Io(e)
    }
}

impl From<toml::de::Error> for ConfigError {
    fn from(e: toml::de::Error) -> Self {
        ConfigError::Parse(e)
    }
}

impl From<config::ConfigError> for ConfigError {
    fn from(e: config::ConfigError) -> Self {
        ConfigError::Config(e)
    }
}

/// Root configuration structure
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    pub log: LogConfig,
    pub server: ServerConfig,
    pub limits: LimitsConfig,
    pub session: SessionConfig,
    /// Request dispatch pool
    pub workers: WorkersConfig,
    /// Publish fan-out pool
    pub fanout: FanoutConfig,
    /// HTTP admin surface
    pub admin: AdminConfig,
    /// CONNECT authentication
    pub auth: AuthConfig,
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
    /// Name reported by the admin server info
    pub name: String,
    pub ip: IpAddr,
    pub port: u16,
    /// Only "tcp" is supported
    pub transport: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            name: "tidemq".to_string(),
            ip: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            port: 1883,
            transport: "tcp".to_string(),
        }
    }
}

impl ServerConfig {
    pub fn bind_addr(&self) -> SocketAddr {
        SocketAddr::new(self.ip, self.port)
    }
}

/// Connection limits configuration
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LimitsConfig {
    /// Maximum number of bound connections
    pub max_connections: usize,
    /// Maximum remaining length of an inbound packet
    pub max_packet_size: usize,
    /// Per-connection outbound frame queue capacity
    pub outbound_queue_capacity: usize,
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            max_connections: 100,
            max_packet_size: 2048,
            outbound_queue_capacity: 1024,
        }
    }
}

/// Session configuration
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Liveness timeout in seconds; 0 disables it
    pub keep_alive: u64,
    /// Seconds a new transport has to send CONNECT
    pub connect_timeout: u64,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            keep_alive: 120,
            connect_timeout: 30,
        }
    }
}

impl SessionConfig {
    pub fn keep_alive_duration(&self) -> Duration {
        Duration::from_secs(self.keep_alive)
    }

    pub fn connect_timeout_duration(&self) -> Duration {
        Duration::from_secs(self.connect_timeout)
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct WorkersConfig {
    /// Dispatch through the worker pool; when false every request gets its own task
    pub enabled: bool,
    pub pool_size: usize,
    pub queue_capacity: usize,
}

impl Default for WorkersConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            pool_size: 10,
            queue_capacity: 1024,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct FanoutConfig {
    pub pool_size: usize,
    pub queue_capacity: usize,
}

impl Default for FanoutConfig {
    fn default() -> Self {
        Self {
            pool_size: 10,
            queue_capacity: 1024,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AdminConfig {
    pub enabled: bool,
    pub bind: SocketAddr,
}

impl Default for AdminConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            bind: SocketAddr::from(([127, 0, 0, 1], 8080)),
        }
    }
}

/// Authentication configuration
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct AuthConfig {
    /// Require the credentials below on every CONNECT
    pub enabled: bool,
    pub username: String,
    pub password: String,
}

impl AuthConfig {
    /// The CONNECT verifier to install, if authentication is enabled
    pub fn verifier(&self) -> Option<StaticCredentials> {
        self.enabled
            .then(|| StaticCredentials::new(self.username.clone(), self.password.as_bytes()))
    }
}

impl Config {
    /// Load configuration from a TOML file with environment variable overrides.
    ///
    /// A missing file is not an error; the defaults are used. Overrides use
    /// the `TIDEMQ__` prefix with double underscores for nesting:
    /// - `TIDEMQ__SERVER__PORT=1884` overrides `server.port`
    /// - `TIDEMQ__WORKERS__POOL_SIZE=4` overrides `workers.pool_size`
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let mut builder = config::Config::builder()
            .set_default("log.level", "info")?
            .set_default("server.name", "tidemq")?
            .set_default("server.ip", "0.0.0.0")?
            .set_default("server.port", 1883)?
            .set_default("server.transport", "tcp")?
            .set_default("limits.max_connections", 100)?
            .set_default("limits.max_packet_size", 2048)?
            .set_default("limits.outbound_queue_capacity", 1024)?
            .set_default("session.keep_alive", 120)?
            .set_default("session.connect_timeout", 30)?
            .set_default("workers.enabled", true)?
            .set_default("workers.pool_size", 10)?
            .set_default("workers.queue_capacity", 1024)?
            .set_default("fanout.pool_size", 10)?
            .set_default("fanout.queue_capacity", 1024)?
            .set_default("admin.enabled", false)?
            .set_default("admin.bind", "127.0.0.1:8080")?
            .set_default("auth.enabled", false)?
            .set_default("auth.username", "")?
            .set_default("auth.password", "")?;

        let path = path.as_ref();
        match std::fs::read_to_string(path) {
            Ok(content) => {
                let substituted = substitute_env_vars(&content)?;
                builder = builder.add_source(File::from_str(&substituted, FileFormat::Toml));
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(ConfigError::Io(e)),
        }

        let cfg = builder
            .add_source(
                Environment::with_prefix("TIDEMQ")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        let config: Config = cfg.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    /// Defaults plus environment overrides, no file
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::load(Path::new(""))
    }

    /// Parse configuration from a string (no env var support)
    pub fn parse(content: &str) -> Result<Self, ConfigError> {
        let config: Config = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if !self.server.transport.eq_ignore_ascii_case("tcp") {
            return Err(ConfigError::Validation(format!(
                "unsupported transport '{}', only tcp is available",
                self.server.transport
            )));
        }
        if self.limits.max_connections == 0 {
            return Err(ConfigError::Validation(
                "limits.max_connections must be greater than 0".to_string(),
            ));
        }
        if self.limits.max_packet_size > MAX_REMAINING_LENGTH {
            return Err(ConfigError::Validation(format!(
                "limits.max_packet_size must not exceed {}",
                MAX_REMAINING_LENGTH
            )));
        }

        if self.auth.enabled && self.auth.username.is_empty() {
            return Err(ConfigError::Validation(
                "auth.username must be set when auth is enabled".to_string(),
            ));
        }

        let sizes = [
            ("limits.outbound_queue_capacity", self.limits.outbound_queue_capacity),
            ("workers.pool_size", self.workers.pool_size),
            ("workers.queue_capacity", self.workers.queue_capacity),
            ("fanout.pool_size", self.fanout.pool_size),
            ("fanout.queue_capacity", self.fanout.queue_capacity),
        ];
        for (key, value) in sizes {
            if value == 0 {
                return Err(ConfigError::Validation(format!(
                    "{} must be greater than 0",
                    key
                )));
            }
        }

        Ok(())
    }
}

impl From<&Config> for BrokerConfig {
    fn from(config: &Config) -> Self {
        Self {
            name: config.server.name.clone(),
            bind_addr: config.server.bind_addr(),
            max_connections: config.limits.max_connections,
            max_packet_size: config.limits.max_packet_size,
            outbound_queue_capacity: config.limits.outbound_queue_capacity,
            keep_alive: config.session.keep_alive_duration(),
            connect_timeout: config.session.connect_timeout_duration(),
            workers: PoolConfig {
                enabled: config.workers.enabled,
                size: config.workers.pool_size,
                queue_capacity: config.workers.queue_capacity,
            },
            fanout: PoolConfig {
                enabled: true,
                size: config.fanout.pool_size,
                queue_capacity: config.fanout.queue_capacity,
            },
        }
    }
}
