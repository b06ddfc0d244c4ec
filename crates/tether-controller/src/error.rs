//! Error types for the controller.
//!
//! **Panic-Free Policy:** No `.unwrap()`, `.expect()`, `panic!()`,
//! `unreachable!()`, or `todo!()` in this crate.

use std::io;
use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

use tether_protocol::{ErrorCode, NegotiationError};
use tether_target::InjectionError;

/// Controller errors.
#[derive(Error, Debug)]
pub enum ControllerError {
    /// The session could not be established.
    #[error(transparent)]
    Negotiation(#[from] NegotiationError),

    /// Attach-by-pid failed inside the bootstrap.
    #[error(transparent)]
    Injection(#[from] InjectionError),

    /// The target answered a command with a failure response.
    #[error("{command} failed ({code}): {message}")]
    CommandFailed {
        command: String,
        code: ErrorCodeDisplay,
        message: String,
    },

    /// The target answered with a body the command never produces.
    #[error("unexpected response to {command}")]
    UnexpectedResponse { command: String },

    /// No answer within the request timeout.
    #[error("{what} timed out after {after:?}")]
    Timeout { what: String, after: Duration },

    /// The session is gone.
    #[error("session disconnected")]
    Disconnected,

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Config file unreadable or invalid.
    #[error("invalid config {path}: {reason}")]
    Config { path: PathBuf, reason: String },

    /// A setting the controller must state was never given.
    #[error("{option} is not set; state it in the config file or on the command line")]
    Unset { option: &'static str },
}

impl ControllerError {
    /// Code of a failed command, if this is one.
    pub fn code(&self) -> Option<ErrorCode> {
        match self {
            Self::CommandFailed { code, .. } => code.0,
            _ => None,
        }
    }
}

/// Optional [`ErrorCode`] with a `Display` for messages.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ErrorCodeDisplay(pub Option<ErrorCode>);

impl std::fmt::Display for ErrorCodeDisplay {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.0 {
            Some(code) => write!(f, "{code}"),
            None => f.write_str("unspecified"),
        }
    }
}

/// Result type alias for controller operations.
pub type Result<T> = std::result::Result<T, ControllerError>;
