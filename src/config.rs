//! Tunnel configuration, read once from a TOML file at startup.

use crate::protocol::SECRET_LENGTH;
use serde::Deserialize;
use std::fs;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

/// Upper bound for every configured timeout, in seconds.
pub const MAX_TIMEOUT_SECS: f64 = 86_400.0;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("failed to parse configuration: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("invalid configuration: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    #[serde(default)]
    pub pidfile: Option<PathBuf>,
    #[serde(default)]
    pub log: LogConfig,
    #[serde(default)]
    pub listen: ListenConfig,
    pub tls: TlsConfig,
    pub broker: BrokerConfig,
    #[serde(default)]
    pub tunnel: TunnelConfig,
    #[serde(default)]
    pub admin: AdminConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct LogConfig {
    /// `tracing` filter directive, e.g. "info" or "ticket_tunnel=debug".
    pub level: String,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ListenConfig {
    pub address: IpAddr,
    pub port: u16,
}

impl Default for ListenConfig {
    fn default() -> Self {
        Self {
            address: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            port: 4443,
        }
    }
}

impl ListenConfig {
    pub fn socket_addr(&self) -> SocketAddr {
        SocketAddr::new(self.address, self.port)
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TlsConfig {
    /// PEM certificate chain.
    pub certificate: PathBuf,
    /// PEM private key (PKCS#8, PKCS#1 or SEC1).
    pub certificate_key: PathBuf,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct BrokerConfig {
    /// Base URL; ticket, action and token are appended as path segments.
    pub url: String,
    pub token: String,
    /// Request timeout in seconds.
    #[serde(default = "default_broker_timeout")]
    pub timeout: f64,
    #[serde(default = "default_true")]
    pub verify_ssl: bool,
}

impl BrokerConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs_f64(self.timeout)
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct TunnelConfig {
    /// Worker event loops; 0 means one per CPU.
    pub workers: usize,
    /// Require the magic handshake before TLS.
    pub handshake: bool,
    pub handshake_timeout: f64,
    pub command_timeout: f64,
    pub connect_timeout: f64,
    /// Time the second relay direction gets to drain once the first ends.
    pub relay_grace: f64,
    /// Time workers wait on stop for open sessions and pending notifications.
    pub shutdown_grace: f64,
}

impl Default for TunnelConfig {
    fn default() -> Self {
        Self {
            workers: 0,
            handshake: true,
            handshake_timeout: 3.0,
            command_timeout: 3.0,
            connect_timeout: 10.0,
            relay_grace: 5.0,
            shutdown_grace: 5.0,
        }
    }
}

impl TunnelConfig {
    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_secs_f64(self.handshake_timeout)
    }

    pub fn command_timeout(&self) -> Duration {
        Duration::from_secs_f64(self.command_timeout)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs_f64(self.connect_timeout)
    }

    pub fn relay_grace(&self) -> Duration {
        Duration::from_secs_f64(self.relay_grace)
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_secs_f64(self.shutdown_grace)
    }

    pub fn worker_count(&self) -> usize {
        if self.workers > 0 {
            return self.workers;
        }
        std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1)
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct AdminConfig {
    /// Shared secret for STAT/INFO; empty disables them.
    pub secret: String,
    pub allow: Vec<IpAddr>,
}

impl Default for AdminConfig {
    fn default() -> Self {
        Self {
            secret: String::new(),
            allow: vec![IpAddr::V4(Ipv4Addr::LOCALHOST)],
        }
    }
}

impl AdminConfig {
    pub fn is_allowed(&self, ip: IpAddr) -> bool {
        let ip = ip.to_canonical();
        self.allow.iter().any(|a| a.to_canonical() == ip)
    }
}

fn default_broker_timeout() -> f64 {
    10.0
}

fn default_true() -> bool {
    true
}

impl Config {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        text.parse()
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.broker.url.trim().is_empty() {
            return Err(ConfigError::Invalid("broker.url is empty".into()));
        }
        if self.broker.token.is_empty() {
            return Err(ConfigError::Invalid("broker.token is empty".into()));
        }
        let timeouts = [
            ("broker.timeout", self.broker.timeout),
            ("tunnel.handshake_timeout", self.tunnel.handshake_timeout),
            ("tunnel.command_timeout", self.tunnel.command_timeout),
            ("tunnel.connect_timeout", self.tunnel.connect_timeout),
            ("tunnel.relay_grace", self.tunnel.relay_grace),
            ("tunnel.shutdown_grace", self.tunnel.shutdown_grace),
        ];
        for (name, value) in timeouts {
            if !value.is_finite() || value <= 0.0 {
                return Err(ConfigError::Invalid(format!(
                    "{name} must be a positive number of seconds"
                )));
            }
            if value > MAX_TIMEOUT_SECS || Duration::try_from_secs_f64(value).is_err() {
                return Err(ConfigError::Invalid(format!(
                    "{name} must not exceed {MAX_TIMEOUT_SECS} seconds"
                )));
            }
        }
        if self.admin.secret.len() > SECRET_LENGTH {
            return Err(ConfigError::Invalid(format!(
                "admin.secret longer than {SECRET_LENGTH} bytes"
            )));
        }
        Ok(())
    }
}

impl std::str::FromStr for Config {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let config: Config = toml::from_str(s)?;
        config.validate()?;
        Ok(config)
    }
}
