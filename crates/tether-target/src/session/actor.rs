//! Session actor - owns one session's state and applies controller commands.
//!
//! The actor is the single writer for breakpoints and execution control
//! while its session is bound. Every mutation goes to the engine first; the
//! session's breakpoint view is then re-read from the engine, so the view
//! and the live set never diverge.
//!
//! # Panic-Free Guarantees
//!
//! - No `.unwrap()`, `.expect()`, `panic!()`, `unreachable!()`, `todo!()`
//! - Rejected transitions are reported, never forced
//! - Channel send failures are ignored (subscribers may be gone)

use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::sync::{broadcast, watch};
use tracing::{debug, info, warn};

use tether_core::{
    BreakpointSet, DisconnectCause, SessionId, SessionOptions, SessionState, SessionSummary,
    StopEvent, StopReason, ThreadId,
};
use tether_protocol::{Command, ControllerMessage, Response, ResponseBody, TargetMessage};

use super::commands::{DisconnectPlan, ProtocolError, SessionLifecycle};
use crate::engine::{EngineEvent, ExecutionEngine};
use crate::reattach::BindSnapshot;

/// Result of handling one controller message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reply {
    /// Send the response and keep going.
    Respond(Response),
    /// Send the response, then end the session with `plan`.
    Disconnect(Response, DisconnectPlan),
}

/// What to do with an engine event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EventAction {
    Forward(TargetMessage),
    /// Duplicate of a halt already reported.
    Drop,
    /// Forward, then end the session: the target is gone.
    Exit(TargetMessage),
}

/// State of one bound session.
pub struct SessionActor {
    id: SessionId,
    state: SessionState,
    breakpoints: BreakpointSet,
    stop_reason: Option<StopReason>,
    active_thread: Option<ThreadId>,
    /// Last halt forwarded, used to drop repeats of the same halt.
    last_stop: Option<StopEvent>,
    options: SessionOptions,
    bound_at: DateTime<Utc>,
    disconnect_cause: Option<DisconnectCause>,
    engine: Arc<dyn ExecutionEngine>,
    state_tx: watch::Sender<SessionState>,
    lifecycle: broadcast::Sender<SessionLifecycle>,
}

impl SessionActor {
    pub fn new(
        id: SessionId,
        options: SessionOptions,
        engine: Arc<dyn ExecutionEngine>,
        state_tx: watch::Sender<SessionState>,
        lifecycle: broadcast::Sender<SessionLifecycle>,
    ) -> Self {
        Self {
            id,
            state: SessionState::Binding,
            breakpoints: BreakpointSet::new(),
            stop_reason: None,
            active_thread: None,
            last_stop: None,
            options,
            bound_at: Utc::now(),
            disconnect_cause: None,
            engine,
            state_tx,
            lifecycle,
        }
    }

    pub fn id(&self) -> SessionId {
        self.id
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn breakpoints(&self) -> &BreakpointSet {
        &self.breakpoints
    }

    pub fn options(&self) -> SessionOptions {
        self.options
    }

    /// Plan applied when the transport goes away without a disconnect
    /// command.
    pub fn transport_loss_plan(&self) -> DisconnectPlan {
        DisconnectPlan {
            terminate: self.options.exit_on_disconnect,
            suspend: false,
        }
    }

    pub fn summary(&self) -> SessionSummary {
        SessionSummary {
            id: self.id,
            state: self.state,
            breakpoints: self.breakpoints.to_vec(),
            stop_reason: self.stop_reason,
            active_thread: self.active_thread,
            options: self.options,
            bound_at: self.bound_at,
            disconnect_cause: self.disconnect_cause,
        }
    }

    // ========================================================================
    // Lifecycle
    // ========================================================================

    /// Completes `Binding` from the engine snapshot.
    ///
    /// Returns the messages to send right away: the current halt, if the
    /// target is stopped.
    pub fn bind(&mut self, snapshot: BindSnapshot) -> Vec<TargetMessage> {
        self.breakpoints = snapshot.breakpoints;
        self.publish(SessionLifecycle::Bound {
            session_id: self.id,
        });

        let mut out = Vec::new();
        match snapshot.stop {
            Some(stop) => {
                if self.enter_stopped(&stop) {
                    out.push(TargetMessage::stopped(stop));
                }
            }
            None => self.set_state(SessionState::Running),
        }

        info!(
            session_id = %self.id,
            state = %self.state,
            breakpoints = self.breakpoints.len(),
            "Session bound"
        );
        out
    }

    /// Moves to `Disconnected`. Idempotent.
    pub fn disconnect(&mut self, cause: DisconnectCause) {
        if self.state.is_terminal() {
            return;
        }
        self.set_state(SessionState::Disconnected);
        self.disconnect_cause = Some(cause);
        self.publish(SessionLifecycle::Disconnected {
            session_id: self.id,
            cause,
        });
        info!(session_id = %self.id, cause = %cause, "Session disconnected");
    }

    // ========================================================================
    // Controller commands
    // ========================================================================

    /// Applies one controller message and builds its response.
    pub async fn handle(&mut self, msg: ControllerMessage) -> Reply {
        let seq = msg.seq;
        let name = msg.command.name();
        debug!(session_id = %self.id, seq, command = name, "Command received");

        if let Command::Disconnect { terminate, suspend } = msg.command {
            let plan = DisconnectPlan {
                terminate: terminate.unwrap_or(self.options.exit_on_disconnect),
                suspend,
            };
            return Reply::Disconnect(Response::ok(seq, name, ResponseBody::Ack), plan);
        }

        match self.execute(msg.command).await {
            Ok(body) => Reply::Respond(Response::ok(seq, name, body)),
            Err(e) => {
                debug!(session_id = %self.id, seq, command = name, error = %e, "Command failed");
                Reply::Respond(Response::failure(seq, name, e.code(), &e.to_string()))
            }
        }
    }

    async fn execute(&mut self, command: Command) -> Result<ResponseBody, ProtocolError> {
        let name = command.name();
        match command {
            Command::Ping => Ok(ResponseBody::Pong),
            // Handled before dispatch
            Command::Disconnect { .. } => Ok(ResponseBody::Ack),

            Command::Pause { thread_id } => {
                self.require_bound(name)?;
                // Already halted: nothing new to report.
                if self.state != SessionState::Stopped {
                    self.engine.pause(thread_id).await?;
                }
                Ok(ResponseBody::Ack)
            }

            Command::Continue => {
                self.require_stopped(name)?;
                self.engine.resume().await?;
                self.enter_running();
                Ok(ResponseBody::Ack)
            }

            Command::Step { thread_id } => {
                self.require_stopped(name)?;
                self.engine.step(thread_id).await?;
                self.enter_running();
                Ok(ResponseBody::Ack)
            }

            Command::AddBreakpoint { location } => {
                self.require_bound(name)?;
                if location.line == 0 {
                    return Err(ProtocolError::Malformed {
                        reason: "breakpoint line must be positive".to_string(),
                    });
                }
                self.engine.add_breakpoint(location).await?;
                self.sync_breakpoints().await;
                Ok(ResponseBody::Ack)
            }

            Command::RemoveBreakpoint { location } => {
                self.require_bound(name)?;
                let removed = self.engine.remove_breakpoint(&location).await?;
                self.sync_breakpoints().await;
                if removed {
                    Ok(ResponseBody::Ack)
                } else {
                    Err(ProtocolError::NoSuchBreakpoint(location.to_string()))
                }
            }

            Command::RemoveAllBreakpoints => {
                self.require_bound(name)?;
                self.engine.clear_breakpoints().await?;
                self.sync_breakpoints().await;
                Ok(ResponseBody::Ack)
            }

            Command::SetBreakpoints { source, lines } => {
                self.require_bound(name)?;
                if lines.contains(&0) {
                    return Err(ProtocolError::Malformed {
                        reason: "breakpoint line must be positive".to_string(),
                    });
                }
                let live = self.engine.breakpoints().await;
                let (removed, added) = live.diff_for_source(&source, &lines);
                for location in &removed {
                    self.engine.remove_breakpoint(location).await?;
                }
                for location in added {
                    self.engine.add_breakpoint(location).await?;
                }
                self.sync_breakpoints().await;
                let breakpoints = self
                    .breakpoints
                    .iter()
                    .filter(|loc| loc.source == source)
                    .cloned()
                    .collect();
                Ok(ResponseBody::Breakpoints { breakpoints })
            }

            Command::ListBreakpoints => {
                self.sync_breakpoints().await;
                Ok(ResponseBody::Breakpoints {
                    breakpoints: self.breakpoints.to_vec(),
                })
            }

            Command::SetExpression {
                thread_id,
                frame_id,
                expression,
                value,
            } => {
                self.require_stopped(name)?;
                let value = self
                    .engine
                    .set_expression(thread_id, frame_id, &expression, &value)
                    .await?;
                Ok(ResponseBody::Expression { value })
            }

            Command::Threads => Ok(ResponseBody::Threads {
                threads: self.engine.threads().await,
            }),

            Command::StackTrace { thread_id } => Ok(ResponseBody::StackTrace {
                frames: self.engine.stack_trace(thread_id).await?,
            }),
        }
    }

    fn require_bound(&self, command: &'static str) -> Result<(), ProtocolError> {
        if self.state.is_bound() {
            Ok(())
        } else {
            Err(ProtocolError::WrongState {
                command,
                state: self.state,
            })
        }
    }

    fn require_stopped(&self, command: &'static str) -> Result<(), ProtocolError> {
        if self.state == SessionState::Stopped {
            Ok(())
        } else {
            Err(ProtocolError::WrongState {
                command,
                state: self.state,
            })
        }
    }

    async fn sync_breakpoints(&mut self) {
        self.breakpoints = self.engine.breakpoints().await;
    }

    // ========================================================================
    // Engine events
    // ========================================================================

    /// Updates state for an engine event and decides what reaches the
    /// controller.
    pub fn on_engine_event(&mut self, event: EngineEvent) -> EventAction {
        match event {
            EngineEvent::Stopped(stop) => {
                if self.enter_stopped(&stop) {
                    EventAction::Forward(TargetMessage::stopped(stop))
                } else {
                    EventAction::Drop
                }
            }
            EngineEvent::Continued { .. } => {
                if self.state == SessionState::Stopped {
                    self.enter_running();
                }
                EventAction::Forward(TargetMessage::Event(event.into()))
            }
            EngineEvent::Output { .. } => EventAction::Forward(TargetMessage::Event(event.into())),
            EngineEvent::Exited { .. } => EventAction::Exit(TargetMessage::Event(event.into())),
        }
    }

    /// Re-reads the halt state after missed engine events.
    pub async fn resync(&mut self) -> Option<TargetMessage> {
        self.sync_breakpoints().await;
        match self.engine.current_stop().await {
            Some(stop) => self
                .enter_stopped(&stop)
                .then(|| TargetMessage::stopped(stop)),
            None => {
                if self.state == SessionState::Stopped {
                    self.enter_running();
                }
                None
            }
        }
    }

    /// Records a halt. Returns false if it repeats the one already reported
    /// or the session can no longer stop.
    fn enter_stopped(&mut self, stop: &StopEvent) -> bool {
        if self.state == SessionState::Stopped && self.last_stop.as_ref() == Some(stop) {
            debug!(session_id = %self.id, thread_id = %stop.thread_id, "Dropping repeated stop");
            return false;
        }
        if !self.state.can_transition_to(SessionState::Stopped) {
            warn!(session_id = %self.id, state = %self.state, "Stop after session end ignored");
            return false;
        }

        self.set_state(SessionState::Stopped);
        self.stop_reason = Some(stop.reason);
        self.active_thread = Some(stop.thread_id);
        self.last_stop = Some(stop.clone());
        self.publish(SessionLifecycle::Stopped {
            session_id: self.id,
            reason: stop.reason,
        });
        debug!(
            session_id = %self.id,
            reason = %stop.reason,
            thread_id = %stop.thread_id,
            location = ?stop.location(),
            "Target stopped"
        );
        true
    }

    fn enter_running(&mut self) {
        if self.state == SessionState::Running {
            return;
        }
        self.set_state(SessionState::Running);
        self.stop_reason = None;
        self.active_thread = None;
        self.last_stop = None;
        self.publish(SessionLifecycle::Resumed {
            session_id: self.id,
        });
    }

    fn set_state(&mut self, next: SessionState) {
        if let Err(e) = self.state.transition(next) {
            warn!(session_id = %self.id, error = %e, "Rejected session transition");
            return;
        }
        self.state_tx.send_replace(next);
    }

    fn publish(&self, event: SessionLifecycle) {
        // No subscribers is fine
        let _ = self.lifecycle.send(event);
    }
}
