//! Session domain types.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::breakpoint::SourceLocation;
use crate::error::DomainError;
use crate::stop::{StopReason, ThreadId};

// ============================================================================
// Identifiers
// ============================================================================

/// Identifier of one controller session on a target.
///
/// Sessions on the same target are numbered in bind order, so a reattached
/// controller always gets a larger id than the one it replaces.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionId(u64);

impl SessionId {
    pub const fn new(n: u64) -> Self {
        Self(n)
    }

    pub const fn as_u64(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "session-{}", self.0)
    }
}

// ============================================================================
// Session State Machine
// ============================================================================

/// Lifecycle of a single session.
///
/// ```text
/// Binding ──▶ Running ◀──▶ Stopped
///    │           │            │
///    └───────────┴────────────┴──▶ Disconnected
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionState {
    /// Transport is up, handshake done, engine state not yet synchronized.
    #[default]
    Binding,
    /// Target executes; commands and events flow.
    Running,
    /// Target halted; mutation commands allowed.
    Stopped,
    /// Terminal for this session instance.
    Disconnected,
}

impl SessionState {
    #[must_use]
    pub fn label(&self) -> &'static str {
        match self {
            Self::Binding => "binding",
            Self::Running => "running",
            Self::Stopped => "stopped",
            Self::Disconnected => "disconnected",
        }
    }

    /// Returns true if the transition is part of the state machine.
    #[must_use]
    pub fn can_transition_to(&self, next: SessionState) -> bool {
        use SessionState::*;
        matches!(
            (self, next),
            (Binding, Running)
                | (Binding, Stopped)
                | (Running, Stopped)
                | (Stopped, Running)
                | (Stopped, Stopped)
                | (Binding, Disconnected)
                | (Running, Disconnected)
                | (Stopped, Disconnected)
        )
    }

    /// Validated transition.
    pub fn transition(&mut self, next: SessionState) -> Result<(), DomainError> {
        if !self.can_transition_to(next) {
            return Err(DomainError::InvalidTransition {
                from: self.label().to_string(),
                to: next.label().to_string(),
            });
        }
        *self = next;
        Ok(())
    }

    /// True while the session accepts controller commands.
    #[must_use]
    pub fn is_bound(&self) -> bool {
        matches!(self, Self::Running | Self::Stopped)
    }

    #[must_use]
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Disconnected)
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

// ============================================================================
// Options and Disconnect Causes
// ============================================================================

/// Options the controller chooses when a session is created.
///
/// `exit_on_disconnect` has no serde default: a controller that does not
/// state it fails the handshake.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionOptions {
    /// Terminate the target when this session ends.
    pub exit_on_disconnect: bool,
}

impl SessionOptions {
    pub const fn new(exit_on_disconnect: bool) -> Self {
        Self { exit_on_disconnect }
    }
}

/// Why a session reached `Disconnected`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DisconnectCause {
    /// Controller sent an explicit disconnect command.
    ControllerRequest,
    /// Either side closed the transport, or it became unusable.
    TransportClosed,
    /// The embedding program or host shut the session down.
    Cancelled,
    /// The target program finished.
    TargetExited,
}

impl fmt::Display for DisconnectCause {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ControllerRequest => write!(f, "controller requested disconnect"),
            Self::TransportClosed => write!(f, "transport closed"),
            Self::Cancelled => write!(f, "session cancelled"),
            Self::TargetExited => write!(f, "target exited"),
        }
    }
}

// ============================================================================
// Session Summary (read-only view)
// ============================================================================

/// Read-only snapshot of a session, for the embedding program and logs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionSummary {
    pub id: SessionId,
    pub state: SessionState,
    pub breakpoints: Vec<SourceLocation>,
    pub stop_reason: Option<StopReason>,
    pub active_thread: Option<ThreadId>,
    pub options: SessionOptions,
    pub bound_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub disconnect_cause: Option<DisconnectCause>,
}
