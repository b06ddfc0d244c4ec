//! Controller configuration.
//!
//! Loaded from TOML (default `<config dir>/tether/controller.toml`).
//! Command-line flags override what the file sets. Every field has a
//! default except `exit_on_disconnect`: a session is only established once
//! the file or the command line states it.
//!
//! ```toml
//! host = "127.0.0.1"
//! port = 5678
//! access_token = "s3cret"
//! exit_on_disconnect = false
//! request_timeout_ms = 10000
//! retry_initial_delay_ms = 200
//! retry_multiplier = 2.0
//! max_attempts = 3
//! ```

use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::debug;

use tether_core::{Address, SessionOptions};

use crate::error::{ControllerError, Result};

/// Default port (the usual debug adapter port)
pub const DEFAULT_PORT: u16 = 5678;

/// Connection and session settings of a controller.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ControllerConfig {
    /// Target endpoint (connect) or local bind address (listen).
    pub host: String,
    pub port: u16,

    /// Token a dialing target must present in connect mode.
    pub access_token: Option<String>,

    /// Terminate the target when the session ends. Never defaulted.
    pub exit_on_disconnect: Option<bool>,

    pub connect_timeout_ms: u64,
    pub handshake_timeout_ms: u64,
    pub request_timeout_ms: u64,

    /// Initial delay before the first retry after a failed connect.
    pub retry_initial_delay_ms: u64,

    /// Maximum delay between retry attempts.
    pub retry_max_delay_ms: u64,

    /// Multiplier for exponential backoff (2.0 doubles the delay).
    pub retry_multiplier: f64,

    /// Connect attempts before giving up (at least one is made). More
    /// than one lets a reattach ride out the previous session's release.
    pub max_attempts: u32,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: DEFAULT_PORT,
            access_token: None,
            exit_on_disconnect: None,
            connect_timeout_ms: 10_000,
            handshake_timeout_ms: 10_000,
            request_timeout_ms: 10_000,
            retry_initial_delay_ms: 200,
            retry_max_delay_ms: 5_000,
            retry_multiplier: 2.0,
            max_attempts: 3,
        }
    }
}

impl ControllerConfig {
    /// `<config dir>/tether/controller.toml`, if the platform has one.
    pub fn default_path() -> Option<PathBuf> {
        dirs::config_dir().map(|dir| dir.join("tether").join("controller.toml"))
    }

    /// Reads a config file.
    ///
    /// # Errors
    ///
    /// - `ControllerError::Config` if the file cannot be read or parsed
    pub fn load(path: &Path) -> Result<Self> {
        let text = fs::read_to_string(path).map_err(|e| ControllerError::Config {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?;
        let config: Self = toml::from_str(&text).map_err(|e| ControllerError::Config {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?;
        debug!(path = %path.display(), "Loaded controller config");
        Ok(config)
    }

    /// Reads `path`, or the default path when `None`. A missing default
    /// file yields the defaults; a missing explicit file is an error.
    pub fn load_or_default(path: Option<&Path>) -> Result<Self> {
        if let Some(path) = path {
            return Self::load(path);
        }
        match Self::default_path() {
            Some(path) => match fs::metadata(&path) {
                Ok(_) => Self::load(&path),
                Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(Self::default()),
                Err(e) => Err(ControllerError::Config {
                    path,
                    reason: e.to_string(),
                }),
            },
            None => Ok(Self::default()),
        }
    }

    pub fn address(&self) -> Address {
        Address::new(self.host.clone(), self.port)
    }

    #[must_use]
    pub fn with_exit_on_disconnect(mut self, exit_on_disconnect: bool) -> Self {
        self.exit_on_disconnect = Some(exit_on_disconnect);
        self
    }

    /// Options stated in every handshake.
    ///
    /// # Errors
    ///
    /// - `ControllerError::Unset` if `exit_on_disconnect` was never given
    pub fn session_options(&self) -> Result<SessionOptions> {
        self.exit_on_disconnect
            .map(SessionOptions::new)
            .ok_or(ControllerError::Unset {
                option: "exit_on_disconnect",
            })
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_millis(self.handshake_timeout_ms)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    pub fn retry_initial_delay(&self) -> Duration {
        Duration::from_millis(self.retry_initial_delay_ms)
    }

    pub fn retry_max_delay(&self) -> Duration {
        Duration::from_millis(self.retry_max_delay_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partial_file_keeps_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("controller.toml");
        fs::write(&path, "port = 7000\nexit_on_disconnect = true\n").unwrap();

        let config = ControllerConfig::load(&path).unwrap();
        assert_eq!(config.port, 7000);
        assert_eq!(config.exit_on_disconnect, Some(true));
        assert_eq!(config.host, "127.0.0.1");
        assert_eq!(config.request_timeout(), Duration::from_secs(10));
        assert_eq!(config.session_options().unwrap(), SessionOptions::new(true));
    }

    #[test]
    fn test_exit_on_disconnect_is_never_defaulted() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("controller.toml");
        fs::write(&path, "port = 7000\n").unwrap();

        let config = ControllerConfig::load(&path).unwrap();
        assert_eq!(config.exit_on_disconnect, None);
        assert!(matches!(
            config.session_options(),
            Err(ControllerError::Unset { option: "exit_on_disconnect" })
        ));
        assert!(ControllerConfig::default().session_options().is_err());

        let stated = config.with_exit_on_disconnect(false);
        assert_eq!(stated.session_options().unwrap(), SessionOptions::new(false));
    }

    #[test]
    fn test_default_retries_a_reattach() {
        assert!(ControllerConfig::default().max_attempts > 1);
    }

    #[test]
    fn test_bad_file_names_path() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("controller.toml");
        fs::write(&path, "port = \"many\"").unwrap();

        let err = ControllerConfig::load(&path).unwrap_err();
        assert!(matches!(err, ControllerError::Config { .. }));
        assert!(err.to_string().contains("controller.toml"));
    }

    #[test]
    fn test_explicit_missing_file_is_error() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("nope.toml");
        assert!(ControllerConfig::load_or_default(Some(&missing)).is_err());
    }
}
