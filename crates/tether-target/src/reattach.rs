//! Handoff of target state between consecutive sessions.
//!
//! The coordinator runs at both ends of every session:
//! - on bind it reads the engine's live breakpoint set and current halt
//! - on disconnect it applies the disconnect plan: terminate, or keep the
//!   hook and breakpoints live and resume (or stay halted)
//!
//! Nothing about a session is cached here. A reattaching controller sees
//! whatever the engine holds at bind time.

use std::sync::Arc;

use thiserror::Error;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use tether_core::{BreakpointSet, DisconnectCause, SessionId, StopEvent};

use crate::attach::{AttachError, AttachState};
use crate::engine::{EngineError, EngineEvent, ExecutionEngine};
use crate::session::SessionOutcome;

/// Engine state a session starts from.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BindSnapshot {
    pub breakpoints: BreakpointSet,
    /// Outstanding halt, forwarded to the controller immediately.
    pub stop: Option<StopEvent>,
}

/// A disconnect plan that could not be fully applied.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ReattachError {
    #[error("engine failed during handoff: {0}")]
    Engine(#[from] EngineError),

    #[error(transparent)]
    Attach(#[from] AttachError),
}

/// Binds sessions to, and releases them from, the shared target state.
pub struct ReattachCoordinator {
    state: Arc<AttachState>,
    engine: Arc<dyn ExecutionEngine>,
}

impl ReattachCoordinator {
    pub fn new(state: Arc<AttachState>, engine: Arc<dyn ExecutionEngine>) -> Self {
        Self { state, engine }
    }

    pub fn engine(&self) -> Arc<dyn ExecutionEngine> {
        Arc::clone(&self.engine)
    }

    pub fn state(&self) -> &Arc<AttachState> {
        &self.state
    }

    /// Marks the controller attached, snapshots the engine, and returns
    /// the event stream that continues from the snapshot.
    ///
    /// The stream starts exactly at the snapshot, so a halt that was
    /// resumed and replaced before binding is never replayed after it.
    pub async fn on_bind(&self, id: SessionId) -> (BindSnapshot, broadcast::Receiver<EngineEvent>) {
        self.engine.controller_attached(true).await;
        let (events, stop) = self.engine.subscribe_with_halt().await;
        let snapshot = BindSnapshot {
            breakpoints: self.engine.breakpoints().await,
            stop,
        };
        debug!(
            session_id = %id,
            breakpoints = snapshot.breakpoints.len(),
            halted = snapshot.stop.is_some(),
            "Session bound to engine state"
        );
        (snapshot, events)
    }

    /// Applies the outcome of a finished session.
    ///
    /// The session slot is always released or the target terminated, even
    /// when the engine fails part of the plan.
    pub async fn on_disconnect(
        &self,
        id: SessionId,
        outcome: SessionOutcome,
    ) -> Result<(), ReattachError> {
        self.engine.controller_attached(false).await;

        if outcome.cause == DisconnectCause::TargetExited {
            info!(session_id = %id, "Target exited, attach state terminated");
            self.state.terminate();
            return Ok(());
        }

        if outcome.plan.terminate {
            info!(session_id = %id, cause = %outcome.cause, "Terminating target on disconnect");
            let result = self.engine.terminate().await;
            self.state.terminate();
            return result.map_err(ReattachError::from);
        }

        let mut resume_err = None;
        if !outcome.plan.suspend && self.engine.current_stop().await.is_some() {
            if let Err(e) = self.engine.resume().await {
                warn!(session_id = %id, error = %e, "Failed to resume target on detach");
                resume_err = Some(e);
            }
        }

        self.state.release_session(id)?;
        let breakpoint_count = self.engine.breakpoints().await.len();
        info!(
            session_id = %id,
            suspended = outcome.plan.suspend,
            breakpoints = breakpoint_count,
            "Detached; target ready for reattach"
        );

        match resume_err {
            Some(e) => Err(e.into()),
            None => Ok(()),
        }
    }
}

impl std::fmt::Debug for ReattachCoordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReattachCoordinator")
            .field("phase", &self.state.phase())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::DisconnectPlan;
    use crate::sim::{SimulatedEngine, Statement, ThreadScript};
    use std::time::Duration;
    use tether_core::{Address, AttachConfig, AttachPhase, SourceLocation};

    fn setup() -> (ReattachCoordinator, SimulatedEngine, SessionId) {
        let engine = SimulatedEngine::new();
        let state = Arc::new(AttachState::new());
        state
            .install_hook(AttachConfig::listen(Address::localhost(0)))
            .unwrap();
        let id = state.try_bind_session().unwrap();
        (
            ReattachCoordinator::new(state, Arc::new(engine.clone())),
            engine,
            id,
        )
    }

    #[tokio::test]
    async fn test_detach_keeps_breakpoints_and_rearms() {
        let (coordinator, engine, id) = setup();
        engine
            .add_breakpoint(SourceLocation::new("main.rs", 3))
            .await
            .unwrap();

        let outcome = SessionOutcome {
            cause: DisconnectCause::ControllerRequest,
            plan: DisconnectPlan::DETACH,
        };
        coordinator.on_disconnect(id, outcome).await.unwrap();

        assert_eq!(coordinator.state().phase(), AttachPhase::Hooked);
        assert_eq!(coordinator.state().active_session(), None);

        let next = coordinator.state().try_bind_session().unwrap();
        let (snapshot, _events) = coordinator.on_bind(next).await;
        assert!(snapshot
            .breakpoints
            .contains(&SourceLocation::new("main.rs", 3)));
        assert!(snapshot.stop.is_none());
    }

    #[tokio::test]
    async fn test_terminate_plan_ends_target() {
        let (coordinator, engine, id) = setup();
        let outcome = SessionOutcome {
            cause: DisconnectCause::TransportClosed,
            plan: DisconnectPlan {
                terminate: true,
                suspend: false,
            },
        };
        coordinator.on_disconnect(id, outcome).await.unwrap();

        assert_eq!(coordinator.state().phase(), AttachPhase::Terminated);
        assert!(engine.wait_for_exit(Duration::from_secs(1)).await.is_some());
    }

    #[tokio::test]
    async fn test_suspend_leaves_target_halted() {
        let (coordinator, engine, id) = setup();
        let thread = engine.spawn(
            ThreadScript::new("worker", "work.rs")
                .body(vec![Statement::sleep(1, Duration::from_millis(2))])
                .forever(),
        );
        engine.pause(Some(thread)).await.unwrap();
        let stop = engine.wait_for_halt(Duration::from_secs(5)).await.unwrap();

        let outcome = SessionOutcome {
            cause: DisconnectCause::ControllerRequest,
            plan: DisconnectPlan {
                terminate: false,
                suspend: true,
            },
        };
        coordinator.on_disconnect(id, outcome).await.unwrap();
        assert_eq!(engine.current_stop().await, Some(stop.clone()));

        let next = coordinator.state().try_bind_session().unwrap();
        let (snapshot, _events) = coordinator.on_bind(next).await;
        assert_eq!(snapshot.stop, Some(stop));

        engine.terminate().await.unwrap();
    }

    #[tokio::test]
    async fn test_bind_stream_starts_after_snapshot() {
        let (coordinator, engine, id) = setup();
        let thread = engine.spawn(
            ThreadScript::new("worker", "work.rs")
                .body(vec![Statement::sleep(1, Duration::from_millis(2))])
                .forever(),
        );
        let mut before = engine.subscribe();

        // Halt, resume, halt again before anyone binds.
        engine.pause(Some(thread)).await.unwrap();
        engine.wait_for_halt(Duration::from_secs(5)).await.unwrap();
        engine.resume().await.unwrap();
        engine.pause(Some(thread)).await.unwrap();
        let stop = engine.wait_for_halt(Duration::from_secs(5)).await.unwrap();

        let (snapshot, mut events) = coordinator.on_bind(id).await;
        assert_eq!(snapshot.stop, Some(stop));
        assert!(matches!(
            events.try_recv(),
            Err(broadcast::error::TryRecvError::Empty)
        ));

        // An earlier subscriber does hold the stale history.
        assert!(matches!(before.try_recv(), Ok(EngineEvent::Stopped(_))));
        assert!(matches!(before.try_recv(), Ok(EngineEvent::Continued { .. })));

        engine.terminate().await.unwrap();
    }
}
