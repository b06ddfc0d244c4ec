//! Controller sessions using the actor pattern.
//!
//! A session is one controller bound to the target over one transport.
//! The [`SessionActor`] owns the session state; [`SessionConnection`] feeds
//! it controller frames and engine events on a dedicated task.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────┐  frames   ┌───────────────────┐  calls   ┌─────────────────┐
//! │  Controller  │──────────▶│ SessionConnection │─────────▶│ ExecutionEngine │
//! └──────────────┘◀──────────│   (SessionActor)  │◀─────────└─────────────────┘
//!      responses, events     └─────────┬─────────┘  EngineEvent (broadcast)
//!                                      │
//!                   SessionCommand     │    SessionLifecycle
//!                   (mpsc channel)     ▼    (broadcast)
//!                            ┌───────────────────┐
//!                            │   SessionHandle   │
//!                            └───────────────────┘
//! ```
//!
//! Binding and teardown go through the [`ReattachCoordinator`], so the
//! engine state a session leaves behind is exactly what the next session
//! finds.
//!
//! # Panic-Free Guarantees
//!
//! - No `.unwrap()` or `.expect()` in production code
//! - Channel operations handle closure gracefully

use std::sync::Arc;

use tokio::sync::{broadcast, mpsc, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use tether_core::{SessionId, SessionState};

mod actor;
mod commands;
mod connection;
mod handle;

pub use actor::{EventAction, Reply, SessionActor};
pub use commands::{
    DisconnectPlan, ProtocolError, SessionCommand, SessionError, SessionLifecycle, SessionOutcome,
};
pub use connection::SessionConnection;
pub use handle::SessionHandle;

use crate::negotiate::Negotiated;
use crate::reattach::ReattachCoordinator;

/// Channel buffer sizes
const COMMAND_BUFFER: usize = 16;
const EVENT_BUFFER: usize = 64;

/// Spawns the task for a freshly negotiated session.
///
/// The engine subscription is taken together with the bind snapshot, so
/// the session relays every event after the snapshot and none before it.
/// Binding, the connection loop, and the disconnect plan all run on the
/// spawned task; the returned handle reports the outcome via
/// [`SessionHandle::closed`].
pub fn spawn_session(
    id: SessionId,
    negotiated: Negotiated,
    coordinator: Arc<ReattachCoordinator>,
    cancel: CancellationToken,
) -> SessionHandle {
    let (cmd_tx, cmd_rx) = mpsc::channel(COMMAND_BUFFER);
    let (state_tx, state_rx) = watch::channel(SessionState::Binding);
    let (lifecycle_tx, _) = broadcast::channel(EVENT_BUFFER);
    let (finished_tx, finished_rx) = watch::channel(None);

    let actor = SessionActor::new(
        id,
        negotiated.options,
        coordinator.engine(),
        state_tx,
        lifecycle_tx.clone(),
    );
    let handle = SessionHandle::new(id, cmd_tx, state_rx, lifecycle_tx, finished_rx);

    tokio::spawn(async move {
        let (snapshot, events) = coordinator.on_bind(id).await;
        let connection = SessionConnection::new(actor, negotiated.transport, cmd_rx, events, cancel);
        let (outcome, ack) = connection.run(snapshot).await;

        if let Err(e) = coordinator.on_disconnect(id, outcome).await {
            warn!(session_id = %id, error = %e, "Disconnect plan incomplete");
        }

        finished_tx.send_replace(Some(outcome));
        if let Some(ack) = ack {
            let _ = ack.send(());
        }
        debug!(session_id = %id, "Session task finished");
    });

    handle
}
