//! Listener and call configuration, loaded from the environment.
//!
//! Values that fail to parse fall back to their defaults rather than aborting
//! startup; [`ServerConfig::validate`] catches combinations that can never
//! work, such as an inverted port range or certificate files with TLS off.

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::TransportError;

pub const DEFAULT_PORT_MIN: u16 = 18000;
pub const DEFAULT_PORT_MAX: u16 = 18100;
pub const DEFAULT_BIND_ADDRESS: &str = "0.0.0.0";
pub const DEFAULT_MAX_MESSAGE_SIZE: usize = 1_048_576;
pub const DEFAULT_RPC_TIMEOUT_MS: u64 = 5000;

/// Inclusive port range scanned by the listener.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortRange {
    pub min: u16,
    pub max: u16,
}

impl PortRange {
    #[must_use]
    pub fn new(min: u16, max: u16) -> Self {
        Self { min, max }
    }

    /// A range containing exactly one port.
    #[must_use]
    pub fn single(port: u16) -> Self {
        Self { min: port, max: port }
    }

    pub fn ports(self) -> impl Iterator<Item = u16> {
        self.min..=self.max
    }
}

/// PEM certificate chain and private key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TlsCertificateFiles {
    pub cert: PathBuf,
    pub key: PathBuf,
}

/// Listener configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerConfig {
    pub port_range: PortRange,
    #[serde(default = "default_bind_address")]
    pub bind_address: String,
    #[serde(default)]
    pub enable_tls: bool,
    /// Without files and with `enable_tls`, a self-signed certificate is generated.
    #[serde(default)]
    pub tls_certificate_files: Option<TlsCertificateFiles>,
    /// Largest accepted websocket message, in bytes.
    #[serde(default)]
    pub max_message_size: Option<usize>,
}

fn default_bind_address() -> String {
    DEFAULT_BIND_ADDRESS.to_owned()
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port_range: PortRange::new(DEFAULT_PORT_MIN, DEFAULT_PORT_MAX),
            bind_address: default_bind_address(),
            enable_tls: false,
            tls_certificate_files: None,
            max_message_size: None,
        }
    }
}

impl ServerConfig {
    #[must_use]
    pub fn new(port_range: PortRange) -> Self {
        Self { port_range, ..Self::default() }
    }

    /// Read `RPC_PORT_MIN`, `RPC_PORT_MAX`, `RPC_BIND_ADDRESS`, `RPC_TLS`,
    /// `RPC_TLS_CERT`, `RPC_TLS_KEY` and `RPC_MAX_MESSAGE_SIZE`.
    #[must_use]
    pub fn from_env() -> Self {
        let tls_certificate_files = match (std::env::var("RPC_TLS_CERT"), std::env::var("RPC_TLS_KEY")) {
            (Ok(cert), Ok(key)) => Some(TlsCertificateFiles { cert: cert.into(), key: key.into() }),
            _ => None,
        };

        Self {
            port_range: PortRange::new(
                env_parse("RPC_PORT_MIN", DEFAULT_PORT_MIN),
                env_parse("RPC_PORT_MAX", DEFAULT_PORT_MAX),
            ),
            bind_address: std::env::var("RPC_BIND_ADDRESS").unwrap_or_else(|_| default_bind_address()),
            enable_tls: env_parse("RPC_TLS", false),
            tls_certificate_files,
            max_message_size: std::env::var("RPC_MAX_MESSAGE_SIZE").ok().and_then(|v| v.parse().ok()),
        }
    }

    #[must_use]
    pub fn with_tls(mut self, files: Option<TlsCertificateFiles>) -> Self {
        self.enable_tls = true;
        self.tls_certificate_files = files;
        self
    }

    #[must_use]
    pub fn with_max_message_size(mut self, bytes: usize) -> Self {
        self.max_message_size = Some(bytes);
        self
    }

    /// Effective message limit.
    #[must_use]
    pub fn message_limit(&self) -> usize {
        self.max_message_size.unwrap_or(DEFAULT_MAX_MESSAGE_SIZE)
    }

    /// # Errors
    ///
    /// Returns [`TransportError::InvalidConfig`] for an inverted port range, a
    /// zero message limit, or certificate files supplied with TLS disabled.
    pub fn validate(&self) -> Result<(), TransportError> {
        if self.port_range.min > self.port_range.max {
            return Err(TransportError::InvalidConfig(format!(
                "port range min {} exceeds max {}",
                self.port_range.min, self.port_range.max
            )));
        }
        if self.max_message_size == Some(0) {
            return Err(TransportError::InvalidConfig("max message size must be positive".to_owned()));
        }
        if !self.enable_tls && self.tls_certificate_files.is_some() {
            return Err(TransportError::InvalidConfig("certificate files given but tls is disabled".to_owned()));
        }
        Ok(())
    }
}

/// Call-side defaults for one endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RpcConfig {
    /// Deadline applied when a call does not specify one.
    #[serde(with = "millis")]
    pub default_timeout: Duration,
}

impl Default for RpcConfig {
    fn default() -> Self {
        Self { default_timeout: Duration::from_millis(DEFAULT_RPC_TIMEOUT_MS) }
    }
}

impl RpcConfig {
    /// Read `RPC_TIMEOUT_MS`.
    #[must_use]
    pub fn from_env() -> Self {
        Self { default_timeout: Duration::from_millis(env_parse("RPC_TIMEOUT_MS", DEFAULT_RPC_TIMEOUT_MS)) }
    }
}

pub(crate) fn env_parse<T>(key: &str, default: T) -> T
where
    T: std::str::FromStr + Copy,
{
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse::<T>().ok())
        .unwrap_or(default)
}

mod millis {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub(super) fn serialize<S: Serializer>(value: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(u64::try_from(value.as_millis()).unwrap_or(u64::MAX))
    }

    pub(super) fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        u64::deserialize(d).map(Duration::from_millis)
    }
}

#[cfg(test)]
#[path = "config_test.rs"]
mod tests;
