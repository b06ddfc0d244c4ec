//! Errors raised while establishing a session.

use std::fmt;
use std::io;
use std::time::Duration;

use thiserror::Error;

use crate::codec::CodecError;
use crate::version::ProtocolVersion;

/// Step of session establishment an error happened in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NegotiationPhase {
    Bind,
    Accept,
    Connect,
    Handshake,
}

impl fmt::Display for NegotiationPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Bind => "bind",
            Self::Accept => "accept",
            Self::Connect => "connect",
            Self::Handshake => "handshake",
        };
        f.write_str(s)
    }
}

/// Session establishment failures.
///
/// Every variant names the address or peer involved so a log line is
/// enough to tell which endpoint misbehaved.
#[derive(Error, Debug)]
pub enum NegotiationError {
    #[error("failed to bind {address}: {source}")]
    Bind {
        address: String,
        #[source]
        source: io::Error,
    },

    #[error("failed to connect to {address}: {source}")]
    Connect {
        address: String,
        #[source]
        source: io::Error,
    },

    #[error("failed to accept on {address}: {source}")]
    Accept {
        address: String,
        #[source]
        source: io::Error,
    },

    #[error("{phase} with {peer} timed out after {after:?}")]
    Timeout {
        phase: NegotiationPhase,
        peer: String,
        after: Duration,
    },

    #[error("protocol version mismatch with {peer}: local {local}, remote {remote}")]
    VersionMismatch {
        peer: String,
        local: ProtocolVersion,
        remote: ProtocolVersion,
    },

    #[error("{peer} presented no access token")]
    MissingToken { peer: String },

    #[error("{peer} presented a wrong access token")]
    TokenMismatch { peer: String },

    #[error("rejected by {peer}: {reason}")]
    Rejected { peer: String, reason: String },

    #[error("malformed handshake from {peer}: {reason}")]
    Malformed { peer: String, reason: String },

    #[error("{peer} did not state exit_on_disconnect")]
    MissingSessionOptions { peer: String },

    #[error("session already active, refused {peer}")]
    SessionBusy { peer: String },

    #[error("target has terminated")]
    TargetTerminated,

    #[error("{peer} closed the connection during {phase}")]
    Closed {
        peer: String,
        phase: NegotiationPhase,
    },

    #[error("transport error with {peer}: {source}")]
    Transport {
        peer: String,
        #[source]
        source: CodecError,
    },
}

impl NegotiationError {
    /// True for failures caused by the peer's credentials.
    pub fn is_auth_failure(&self) -> bool {
        matches!(self, Self::MissingToken { .. } | Self::TokenMismatch { .. })
    }

    /// True when retrying the same endpoint may succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Connect { .. } | Self::Timeout { .. } | Self::SessionBusy { .. }
        )
    }
}
