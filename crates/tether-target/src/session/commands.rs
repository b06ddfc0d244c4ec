//! Session commands, errors, and lifecycle events.
//!
//! - `SessionCommand`: requests from the embedding program to a session task
//! - `ProtocolError`: a controller command that could not be honored
//! - `SessionLifecycle`: notifications for the embedding program

use thiserror::Error;
use tokio::sync::oneshot;

use tether_core::{DisconnectCause, SessionId, SessionState, SessionSummary, StopReason};
use tether_protocol::ErrorCode;

use crate::engine::EngineError;

// ============================================================================
// Session Commands
// ============================================================================

/// Requests sent from a [`SessionHandle`](super::SessionHandle) to the
/// session task.
#[derive(Debug)]
pub enum SessionCommand {
    /// Read-only snapshot of the session.
    GetSummary {
        respond_to: oneshot::Sender<SessionSummary>,
    },

    /// End the session from inside the target.
    Disconnect {
        /// Terminate the target instead of detaching.
        terminate: bool,
        /// Leave the target halted.
        suspend: bool,
        respond_to: oneshot::Sender<()>,
    },
}

/// What to do with the target once a session ends.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DisconnectPlan {
    pub terminate: bool,
    pub suspend: bool,
}

impl DisconnectPlan {
    /// Detach and let the target run on.
    pub const DETACH: DisconnectPlan = DisconnectPlan {
        terminate: false,
        suspend: false,
    };
}

/// How a session ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionOutcome {
    pub cause: DisconnectCause,
    pub plan: DisconnectPlan,
}

// ============================================================================
// Errors
// ============================================================================

/// Errors talking to a session task.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SessionError {
    #[error("session {0} has ended")]
    Ended(SessionId),
}

/// A controller command the session refused.
///
/// Reported to the controller as a failure response; the session itself
/// carries on.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    #[error("{command} is not allowed while {state}")]
    WrongState {
        command: &'static str,
        state: SessionState,
    },

    #[error("malformed command: {reason}")]
    Malformed { reason: String },

    #[error("no breakpoint at {0}")]
    NoSuchBreakpoint(String),

    #[error(transparent)]
    Engine(#[from] EngineError),
}

impl ProtocolError {
    /// Code carried by the failure response.
    pub fn code(&self) -> ErrorCode {
        match self {
            Self::WrongState { .. } => ErrorCode::WrongState,
            Self::Malformed { .. } => ErrorCode::Malformed,
            Self::NoSuchBreakpoint(_) => ErrorCode::UnknownReference,
            Self::Engine(e) if e.is_unknown_reference() => ErrorCode::UnknownReference,
            Self::Engine(_) => ErrorCode::EngineFailure,
        }
    }
}

// ============================================================================
// Lifecycle Events
// ============================================================================

/// Published to subscribers of a session handle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionLifecycle {
    Bound { session_id: SessionId },
    Stopped { session_id: SessionId, reason: StopReason },
    Resumed { session_id: SessionId },
    Disconnected {
        session_id: SessionId,
        cause: DisconnectCause,
    },
}

#[cfg(test)]
mod tests {
    use super::*;
    use tether_core::ThreadId;

    #[test]
    fn test_error_codes() {
        let wrong = ProtocolError::WrongState {
            command: "continue",
            state: SessionState::Running,
        };
        assert_eq!(wrong.code(), ErrorCode::WrongState);
        assert_eq!(wrong.to_string(), "continue is not allowed while running");

        let unknown = ProtocolError::from(EngineError::UnknownThread(ThreadId(4)));
        assert_eq!(unknown.code(), ErrorCode::UnknownReference);

        let refused = ProtocolError::from(EngineError::NotHalted);
        assert_eq!(refused.code(), ErrorCode::EngineFailure);
    }
}
