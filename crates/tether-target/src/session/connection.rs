//! Session connection loop.
//!
//! Each bound session gets one `SessionConnection` that:
//! - Sends the current halt (if any) right after binding
//! - Decodes controller frames and routes them through the [`SessionActor`]
//! - Relays engine events to the controller
//! - Serves [`SessionCommand`]s from the embedding program
//!
//! The loop ends on an explicit disconnect, transport loss, target exit,
//! or cancellation. What happens to the target afterwards is decided by the
//! returned [`SessionOutcome`], not here.
//!
//! # Panic-Free Guarantees
//!
//! - No `.unwrap()`, `.expect()`, `panic!()`, `unreachable!()`, `todo!()`
//! - Transport errors end the session; they are logged, never propagated
//! - Malformed frames are answered with a failure response and skipped

use std::net::SocketAddr;
use std::time::Duration;

use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use tether_core::DisconnectCause;
use tether_protocol::{CodecError, ErrorCode, Inbound, Response, TargetMessage, TargetTransport};

use super::actor::{EventAction, Reply, SessionActor};
use super::commands::{DisconnectPlan, SessionCommand, SessionOutcome};
use crate::engine::EngineEvent;
use crate::reattach::BindSnapshot;

/// Write timeout (10 seconds)
const WRITE_TIMEOUT: Duration = Duration::from_secs(10);

/// Command name used when a malformed frame names none.
const UNKNOWN_COMMAND: &str = "unknown";

/// Drives one session until it disconnects.
pub struct SessionConnection {
    actor: SessionActor,
    transport: TargetTransport,
    commands: mpsc::Receiver<SessionCommand>,
    events: broadcast::Receiver<EngineEvent>,
    cancel: CancellationToken,
    peer: SocketAddr,
}

impl SessionConnection {
    pub fn new(
        actor: SessionActor,
        transport: TargetTransport,
        commands: mpsc::Receiver<SessionCommand>,
        events: broadcast::Receiver<EngineEvent>,
        cancel: CancellationToken,
    ) -> Self {
        let peer = transport.peer();
        Self {
            actor,
            transport,
            commands,
            events,
            cancel,
            peer,
        }
    }

    /// Runs the session to completion.
    ///
    /// Also returns the acknowledgement channel of an in-process
    /// disconnect request, so the caller can answer it once the
    /// disconnect plan has been applied.
    pub async fn run(mut self, snapshot: BindSnapshot) -> (SessionOutcome, Option<oneshot::Sender<()>>) {
        let session_id = self.actor.id();

        let initial = self.actor.bind(snapshot);
        let mut ended = None;
        for msg in initial {
            if let Err(e) = self.send(msg).await {
                warn!(session_id = %session_id, peer = %self.peer, error = %e, "Failed to send initial stop");
                ended = Some((DisconnectCause::TransportClosed, self.actor.transport_loss_plan(), None));
                break;
            }
        }

        let (cause, plan, ack) = match ended {
            Some(end) => end,
            None => self.process().await,
        };

        self.actor.disconnect(cause);
        self.transport.close().await;

        info!(
            session_id = %session_id,
            peer = %self.peer,
            cause = %cause,
            terminate = plan.terminate,
            suspend = plan.suspend,
            "Session ended"
        );
        (SessionOutcome { cause, plan }, ack)
    }

    async fn process(
        &mut self,
    ) -> (DisconnectCause, DisconnectPlan, Option<oneshot::Sender<()>>) {
        let session_id = self.actor.id();
        let mut commands_open = true;

        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => {
                    debug!(session_id = %session_id, "Session cancelled");
                    return (DisconnectCause::Cancelled, DisconnectPlan::DETACH, None);
                }

                cmd = self.commands.recv(), if commands_open => match cmd {
                    Some(SessionCommand::GetSummary { respond_to }) => {
                        let _ = respond_to.send(self.actor.summary());
                    }
                    Some(SessionCommand::Disconnect { terminate, suspend, respond_to }) => {
                        let plan = DisconnectPlan { terminate, suspend };
                        return (DisconnectCause::Cancelled, plan, Some(respond_to));
                    }
                    None => commands_open = false,
                },

                frame = self.transport.recv() => match frame {
                    None => {
                        debug!(session_id = %session_id, peer = %self.peer, "Controller closed the transport");
                        return (DisconnectCause::TransportClosed, self.actor.transport_loss_plan(), None);
                    }
                    Some(Err(e)) => {
                        warn!(session_id = %session_id, peer = %self.peer, error = %e, "Transport failed");
                        return (DisconnectCause::TransportClosed, self.actor.transport_loss_plan(), None);
                    }
                    Some(Ok(Inbound::Malformed { seq, reason })) => {
                        warn!(session_id = %session_id, seq = ?seq, reason = %reason, "Malformed controller frame");
                        let resp = Response::failure(seq.unwrap_or(0), UNKNOWN_COMMAND, ErrorCode::Malformed, &reason);
                        if self.send(resp.into()).await.is_err() {
                            return (DisconnectCause::TransportClosed, self.actor.transport_loss_plan(), None);
                        }
                    }
                    Some(Ok(Inbound::Message(msg))) => match self.actor.handle(msg).await {
                        Reply::Respond(resp) => {
                            if self.send(resp.into()).await.is_err() {
                                return (DisconnectCause::TransportClosed, self.actor.transport_loss_plan(), None);
                            }
                        }
                        Reply::Disconnect(resp, plan) => {
                            // The controller may close first; the ack is best effort.
                            let _ = self.send(resp.into()).await;
                            return (DisconnectCause::ControllerRequest, plan, None);
                        }
                    },
                },

                event = self.events.recv() => match event {
                    Ok(event) => match self.actor.on_engine_event(event) {
                        EventAction::Forward(msg) => {
                            if self.send(msg).await.is_err() {
                                return (DisconnectCause::TransportClosed, self.actor.transport_loss_plan(), None);
                            }
                        }
                        EventAction::Drop => {}
                        EventAction::Exit(msg) => {
                            let _ = self.send(msg).await;
                            return (DisconnectCause::TargetExited, DisconnectPlan::DETACH, None);
                        }
                    },
                    Err(RecvError::Lagged(missed)) => {
                        warn!(session_id = %session_id, missed, "Engine events lagged, resynchronizing");
                        if let Some(msg) = self.actor.resync().await {
                            if self.send(msg).await.is_err() {
                                return (DisconnectCause::TransportClosed, self.actor.transport_loss_plan(), None);
                            }
                        }
                    }
                    Err(RecvError::Closed) => {
                        debug!(session_id = %session_id, "Engine event channel closed");
                        return (DisconnectCause::TargetExited, DisconnectPlan::DETACH, None);
                    }
                },
            }
        }
    }

    async fn send(&mut self, msg: TargetMessage) -> Result<(), CodecError> {
        self.transport.send_timeout(msg, WRITE_TIMEOUT).await
    }
}
