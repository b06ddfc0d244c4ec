//! In-process interface to a running session.
//!
//! A [`SessionHandle`] is cheap to clone. The embedding program uses it to
//! read the session state, wait for it to end, or end it from inside the
//! target.
//!
//! # Panic-Free Guarantees
//!
//! - No `.unwrap()`, `.expect()`, `panic!()`, `unreachable!()`, `todo!()`
//! - Channel errors are mapped to `SessionError::Ended`

use tokio::sync::{broadcast, mpsc, oneshot, watch};

use tether_core::{BreakpointSet, SessionId, SessionState, SessionSummary};

use super::commands::{SessionCommand, SessionError, SessionLifecycle, SessionOutcome};

/// Handle for one session task.
#[derive(Clone)]
pub struct SessionHandle {
    id: SessionId,
    sender: mpsc::Sender<SessionCommand>,
    state: watch::Receiver<SessionState>,
    lifecycle: broadcast::Sender<SessionLifecycle>,
    finished: watch::Receiver<Option<SessionOutcome>>,
}

impl SessionHandle {
    pub(crate) fn new(
        id: SessionId,
        sender: mpsc::Sender<SessionCommand>,
        state: watch::Receiver<SessionState>,
        lifecycle: broadcast::Sender<SessionLifecycle>,
        finished: watch::Receiver<Option<SessionOutcome>>,
    ) -> Self {
        Self {
            id,
            sender,
            state,
            lifecycle,
            finished,
        }
    }

    pub fn id(&self) -> SessionId {
        self.id
    }

    /// Latest published state. Never blocks.
    pub fn state(&self) -> SessionState {
        *self.state.borrow()
    }

    /// True until the session task has fully finished, including the
    /// disconnect plan.
    pub fn is_active(&self) -> bool {
        self.finished.borrow().is_none()
    }

    /// Full snapshot from the session task.
    ///
    /// # Errors
    ///
    /// - `SessionError::Ended` if the session has disconnected
    pub async fn summary(&self) -> Result<SessionSummary, SessionError> {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(SessionCommand::GetSummary { respond_to: tx })
            .await
            .map_err(|_| SessionError::Ended(self.id))?;
        rx.await.map_err(|_| SessionError::Ended(self.id))
    }

    /// The session's breakpoint view.
    pub async fn breakpoints(&self) -> Result<BreakpointSet, SessionError> {
        let summary = self.summary().await?;
        Ok(summary.breakpoints.into_iter().collect())
    }

    /// Ends the session from inside the target and waits until the
    /// disconnect plan has been applied.
    ///
    /// # Errors
    ///
    /// - `SessionError::Ended` if the session already disconnected
    pub async fn disconnect(&self, terminate: bool, suspend: bool) -> Result<(), SessionError> {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(SessionCommand::Disconnect {
                terminate,
                suspend,
                respond_to: tx,
            })
            .await
            .map_err(|_| SessionError::Ended(self.id))?;
        rx.await.map_err(|_| SessionError::Ended(self.id))
    }

    /// Waits for the session to finish and returns how it ended.
    ///
    /// Returns `None` only if the session task was aborted.
    pub async fn closed(&self) -> Option<SessionOutcome> {
        let mut finished = self.finished.clone();
        let waited = finished.wait_for(Option::is_some).await.map(|outcome| *outcome);
        let outcome = match waited {
            Ok(outcome) => outcome,
            // Sender gone: the last published value is final.
            Err(_) => *finished.borrow(),
        };
        outcome
    }

    /// Subscribes to lifecycle notifications.
    pub fn subscribe(&self) -> broadcast::Receiver<SessionLifecycle> {
        self.lifecycle.subscribe()
    }
}

impl std::fmt::Debug for SessionHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionHandle")
            .field("id", &self.id)
            .field("state", &self.state())
            .finish()
    }
}
