//! Attach configuration handed from the controller to the target.
//!
//! An [`AttachConfig`] is built once on the controller side, consumed once by
//! the bootstrap inside the target, and never mutated in between.

use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::DomainError;

/// Direction in which the command channel is established.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AttachMode {
    /// The target opens a server endpoint and waits for a controller.
    Listen,
    /// The target dials a controller that is already listening.
    Connect,
}

impl AttachMode {
    /// Returns the wire name of the mode.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Listen => "listen",
            Self::Connect => "connect",
        }
    }
}

impl fmt::Display for AttachMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AttachMode {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "listen" => Ok(Self::Listen),
            "connect" => Ok(Self::Connect),
            other => Err(DomainError::invalid("mode", other, "\"listen\" or \"connect\"")),
        }
    }
}

/// Host and port of a transport endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Address {
    pub host: String,
    pub port: u16,
}

impl Address {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }

    /// Loopback address with the given port (0 = pick an ephemeral port).
    pub fn localhost(port: u16) -> Self {
        Self::new("127.0.0.1", port)
    }

    /// Returns a copy with a different port.
    #[must_use]
    pub fn with_port(&self, port: u16) -> Self {
        Self::new(self.host.clone(), port)
    }

    /// `host:port` form accepted by `tokio::net::lookup_host`.
    pub fn to_endpoint(&self) -> String {
        if self.host.contains(':') && !self.host.starts_with('[') {
            format!("[{}]:{}", self.host, self.port)
        } else {
            format!("{}:{}", self.host, self.port)
        }
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_endpoint())
    }
}

impl FromStr for Address {
    type Err = DomainError;

    /// Parses `host:port`; a bare port means localhost.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let parse_port = |p: &str| {
            p.parse::<u16>()
                .map_err(|_| DomainError::invalid("port", p, "an integer in 0..=65535"))
        };

        match s.rsplit_once(':') {
            Some((host, port)) => {
                let host = host.trim_start_matches('[').trim_end_matches(']');
                if host.is_empty() {
                    return Err(DomainError::invalid("host", s, "a non-empty host name"));
                }
                Ok(Self::new(host, parse_port(port)?))
            }
            None => Ok(Self::localhost(parse_port(s)?)),
        }
    }
}

/// Immutable attach configuration.
///
/// Fields are private; use the constructors and `with_*` builders, which
/// consume `self`, so a config is fixed once it leaves the controller.
#[derive(Clone, PartialEq, Eq)]
pub struct AttachConfig {
    mode: AttachMode,
    address: Address,
    access_token: Option<String>,
    log_to: Option<PathBuf>,
}

impl AttachConfig {
    pub fn new(mode: AttachMode, address: Address) -> Self {
        Self {
            mode,
            address,
            access_token: None,
            log_to: None,
        }
    }

    /// Target listens on `address`.
    pub fn listen(address: Address) -> Self {
        Self::new(AttachMode::Listen, address)
    }

    /// Target dials a controller at `address`.
    pub fn connect(address: Address) -> Self {
        Self::new(AttachMode::Connect, address)
    }

    #[must_use]
    pub fn with_access_token(mut self, token: impl Into<String>) -> Self {
        self.access_token = Some(token.into());
        self
    }

    #[must_use]
    pub fn with_log_to(mut self, path: impl Into<PathBuf>) -> Self {
        self.log_to = Some(path.into());
        self
    }

    pub fn mode(&self) -> AttachMode {
        self.mode
    }

    pub fn address(&self) -> &Address {
        &self.address
    }

    pub fn access_token(&self) -> Option<&str> {
        self.access_token.as_deref()
    }

    pub fn log_to(&self) -> Option<&Path> {
        self.log_to.as_deref()
    }
}

// Never print the token itself; logs are the first place configs end up.
impl fmt::Debug for AttachConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AttachConfig")
            .field("mode", &self.mode)
            .field("address", &self.address.to_endpoint())
            .field("access_token", &self.access_token.as_ref().map(|_| "<redacted>"))
            .field("log_to", &self.log_to)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mode_parse() {
        assert_eq!("listen".parse::<AttachMode>().unwrap(), AttachMode::Listen);
        assert_eq!("connect".parse::<AttachMode>().unwrap(), AttachMode::Connect);
        assert!("Listen".parse::<AttachMode>().is_err());
        assert!("attach".parse::<AttachMode>().is_err());
    }

    #[test]
    fn test_mode_serde_lowercase() {
        let json = serde_json::to_string(&AttachMode::Connect).unwrap();
        assert_eq!(json, "\"connect\"");
    }

    #[test]
    fn test_address_parse() {
        let addr: Address = "localhost:5678".parse().unwrap();
        assert_eq!(addr, Address::new("localhost", 5678));

        let bare: Address = "5678".parse().unwrap();
        assert_eq!(bare, Address::localhost(5678));

        let v6: Address = "[::1]:80".parse().unwrap();
        assert_eq!(v6.host, "::1");
        assert_eq!(v6.to_endpoint(), "[::1]:80");

        assert!("host:notaport".parse::<Address>().is_err());
        assert!(":80".parse::<Address>().is_err());
    }

    #[test]
    fn test_config_builders() {
        let config = AttachConfig::connect(Address::localhost(4000))
            .with_access_token("s3cret")
            .with_log_to("/tmp/tether-logs");

        assert_eq!(config.mode(), AttachMode::Connect);
        assert_eq!(config.address().port, 4000);
        assert_eq!(config.access_token(), Some("s3cret"));
        assert_eq!(config.log_to(), Some(Path::new("/tmp/tether-logs")));
    }

    #[test]
    fn test_debug_redacts_token() {
        let config = AttachConfig::listen(Address::localhost(1)).with_access_token("s3cret");
        let debug = format!("{config:?}");
        assert!(!debug.contains("s3cret"));
        assert!(debug.contains("<redacted>"));
    }
}
