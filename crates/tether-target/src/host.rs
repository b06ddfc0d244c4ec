//! The target's control entry point.
//!
//! [`TargetHost`] is what both a self-attaching program and the injection
//! bootstrap call into. It owns the process-wide [`AttachState`], the
//! engine, and the current session, and it runs the listen-mode accept
//! loop in the background so the embedding program is never blocked
//! except in [`TargetHost::wait_for_client`].
//!
//! # Architecture
//!
//! ```text
//!   attach(config) ──▶ install_hook ──┬─ listen ──▶ accept loop ──┐
//!                                     │                           │ handshake task
//!                                     └─ connect ─▶ dial ─────────┤
//!                                                                 ▼
//!                                             reserve slot, bind, spawn_session
//! ```
//!
//! # Panic-Free Guarantees
//!
//! - No `.unwrap()`, `.expect()`, `panic!()`, `unreachable!()`, `todo!()`
//! - A failed handshake only drops its transport; the accept loop goes on

use std::net::SocketAddr;
use std::sync::{Arc, Mutex, MutexGuard, OnceLock, PoisonError};
use std::time::Duration;

use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use tether_core::{Address, AttachConfig, AttachMode, ProcessId, SessionId};
use tether_protocol::NegotiationError;

use crate::attach::AttachState;
use crate::engine::ExecutionEngine;
use crate::logging;
use crate::negotiate::{self, Negotiated, NegotiationOptions};
use crate::reattach::ReattachCoordinator;
use crate::session::{spawn_session, SessionHandle};

/// Result of a successful attach.
#[derive(Debug)]
pub enum AttachOutcome {
    /// Listen mode: controllers can connect to `address`.
    Listening { address: SocketAddr },
    /// Connect mode: the session with the dialed controller.
    Connected { session: SessionHandle },
}

impl AttachOutcome {
    pub fn address(&self) -> Option<SocketAddr> {
        match self {
            Self::Listening { address } => Some(*address),
            Self::Connected { .. } => None,
        }
    }

    pub fn session(&self) -> Option<&SessionHandle> {
        match self {
            Self::Listening { .. } => None,
            Self::Connected { session } => Some(session),
        }
    }
}

struct HostShared {
    state: Arc<AttachState>,
    coordinator: Arc<ReattachCoordinator>,
    options: NegotiationOptions,
    cancel: CancellationToken,
    current: Mutex<Option<SessionHandle>>,
    listening: Mutex<Option<SocketAddr>>,
}

impl HostShared {
    fn current(&self) -> MutexGuard<'_, Option<SessionHandle>> {
        self.current.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn listening(&self) -> MutexGuard<'_, Option<SocketAddr>> {
        self.listening.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn start_session(&self, id: SessionId, negotiated: Negotiated) -> SessionHandle {
        info!(session_id = %id, peer = %negotiated.peer, "Starting session");
        let handle = spawn_session(
            id,
            negotiated,
            Arc::clone(&self.coordinator),
            self.cancel.child_token(),
        );
        *self.current() = Some(handle.clone());
        handle
    }

    /// Accepts controllers until shutdown. Each handshake runs on its own
    /// task so a silent connector cannot hold up the next one.
    async fn accept_loop(self: Arc<Self>, listener: TcpListener) {
        let terminated = self.state.terminated();
        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => {
                    debug!("Accept loop stopping: host shut down");
                    break;
                }
                _ = terminated.cancelled() => {
                    debug!("Accept loop stopping: target terminated");
                    break;
                }
                result = negotiate::accept(&listener) => match result {
                    Ok(stream) => {
                        tokio::spawn(Arc::clone(&self).serve(stream));
                    }
                    Err(e) => warn!(error = %e, "Failed to accept controller"),
                },
            }
        }
        *self.listening() = None;
    }

    async fn serve(self: Arc<Self>, stream: TcpStream) {
        let handshake = negotiate::handshake_incoming(stream, &self.options, &self.state);
        let (negotiated, reservation) = match handshake.await {
            Ok(negotiated) => negotiated,
            Err(e) => {
                warn!(error = %e, "Controller handshake failed");
                return;
            }
        };
        if self.cancel.is_cancelled() {
            debug!(peer = %negotiated.peer, "Host shut down during handshake");
            return;
        }

        match reservation.bind() {
            Ok(id) => {
                self.start_session(id, negotiated);
            }
            Err(e) => {
                let err = negotiate::slot_error(e, &negotiated.peer.to_string());
                warn!(peer = %negotiated.peer, error = %err, "Dropping negotiated controller");
            }
        }
    }
}

/// Attach machinery of one target process.
pub struct TargetHost {
    pid: ProcessId,
    engine: Arc<dyn ExecutionEngine>,
    shared: Arc<HostShared>,
}

impl TargetHost {
    pub fn new(engine: Arc<dyn ExecutionEngine>) -> Self {
        Self::with_options(engine, NegotiationOptions::default())
    }

    pub fn with_options(engine: Arc<dyn ExecutionEngine>, options: NegotiationOptions) -> Self {
        let state = Arc::new(AttachState::new());
        let coordinator = Arc::new(ReattachCoordinator::new(
            Arc::clone(&state),
            Arc::clone(&engine),
        ));
        Self {
            pid: ProcessId::current(),
            engine,
            shared: Arc::new(HostShared {
                state,
                coordinator,
                options,
                cancel: CancellationToken::new(),
                current: Mutex::new(None),
                listening: Mutex::new(None),
            }),
        }
    }

    /// Overrides the reported process id (several hosts in one process).
    #[must_use]
    pub fn with_pid(mut self, pid: ProcessId) -> Self {
        self.pid = pid;
        self
    }

    pub fn pid(&self) -> ProcessId {
        self.pid
    }

    pub fn engine(&self) -> &Arc<dyn ExecutionEngine> {
        &self.engine
    }

    pub fn state(&self) -> &Arc<AttachState> {
        &self.shared.state
    }

    // ========================================================================
    // Attach entry point
    // ========================================================================

    /// Installs the hook with `config` and sets up the transport it names.
    ///
    /// Listen mode returns as soon as the endpoint is bound. Connect mode
    /// returns once the controller accepted the handshake. Calling it
    /// again re-arms the hook: in listen mode it reports the live endpoint,
    /// in connect mode it dials again (reattach).
    pub async fn attach(&self, config: AttachConfig) -> Result<AttachOutcome, NegotiationError> {
        info!(pid = %self.pid, config = ?config, "Applying attach config");

        if let Some(path) = config.log_to() {
            match logging::log_to(path) {
                Ok(true) => info!(path = %path.display(), "Target logs redirected"),
                Ok(false) => debug!(path = %path.display(), "Keeping existing log subscriber"),
                Err(e) => warn!(path = %path.display(), error = %e, "Cannot open log file"),
            }
        }

        self.shared
            .state
            .install_hook(config.clone())
            .map_err(|_| NegotiationError::TargetTerminated)?;

        match config.mode() {
            AttachMode::Listen => {
                let address = self.listen(config.address()).await?;
                Ok(AttachOutcome::Listening { address })
            }
            AttachMode::Connect => {
                let session = self
                    .connect(config.address(), config.access_token())
                    .await?;
                Ok(AttachOutcome::Connected { session })
            }
        }
    }

    /// Binds `address` and accepts controllers in the background.
    ///
    /// Returns the bound address (the real port when `address` asked for
    /// port 0). A host that is already listening returns its endpoint.
    pub async fn listen(&self, address: &Address) -> Result<SocketAddr, NegotiationError> {
        if let Some(bound) = *self.shared.listening() {
            debug!(address = %bound, "Already listening");
            return Ok(bound);
        }

        let listener = negotiate::bind(address).await?;
        let bound = listener
            .local_addr()
            .map_err(|source| NegotiationError::Bind {
                address: address.to_endpoint(),
                source,
            })?;
        *self.shared.listening() = Some(bound);

        tokio::spawn(Arc::clone(&self.shared).accept_loop(listener));
        Ok(bound)
    }

    /// Dials a listening controller and binds a session with it.
    pub async fn connect(
        &self,
        address: &Address,
        access_token: Option<&str>,
    ) -> Result<SessionHandle, NegotiationError> {
        let reservation = self
            .shared
            .state
            .reserve_session()
            .map_err(|e| negotiate::slot_error(e, &address.to_endpoint()))?;

        let negotiated = negotiate::dial(address, access_token, &self.shared.options).await?;
        let id = reservation
            .bind()
            .map_err(|e| negotiate::slot_error(e, &negotiated.peer.to_string()))?;
        Ok(self.shared.start_session(id, negotiated))
    }

    // ========================================================================
    // Embedding program queries
    // ========================================================================

    /// Blocks until a controller is bound, the target terminates, or
    /// `timeout` elapses. Returns whether a controller is bound.
    pub async fn wait_for_client(&self, timeout: Option<Duration>) -> bool {
        let mut client = self.shared.state.watch_client();
        let terminated = self.shared.state.terminated();

        let wait = async {
            tokio::select! {
                result = client.wait_for(|connected| *connected) => result.is_ok(),
                _ = terminated.cancelled() => false,
            }
        };

        match timeout {
            Some(limit) => tokio::time::timeout(limit, wait).await.unwrap_or(false),
            None => wait.await,
        }
    }

    pub fn is_client_connected(&self) -> bool {
        self.shared.state.is_client_connected()
    }

    /// Handle of the session currently running, if any.
    pub fn active_session(&self) -> Option<SessionHandle> {
        self.shared
            .current()
            .as_ref()
            .filter(|handle| handle.is_active())
            .cloned()
    }

    /// Address of the listen-mode endpoint while it accepts.
    pub fn listening_address(&self) -> Option<SocketAddr> {
        *self.shared.listening()
    }

    /// Stops accepting and cancels the running session (which detaches).
    pub async fn shutdown(&self) {
        info!(pid = %self.pid, "Shutting down attach host");
        self.shared.cancel.cancel();
        let current = self.shared.current().take();
        if let Some(handle) = current {
            handle.closed().await;
        }
    }
}

impl std::fmt::Debug for TargetHost {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TargetHost")
            .field("pid", &self.pid)
            .field("phase", &self.shared.state.phase())
            .field("listening", &self.listening_address())
            .finish_non_exhaustive()
    }
}

// ============================================================================
// Process-wide instance
// ============================================================================

static GLOBAL: OnceLock<Arc<TargetHost>> = OnceLock::new();

/// Installs the host used by the injection bootstrap of this process.
///
/// Returns the host that is actually installed: the first one wins.
pub fn install_global(host: Arc<TargetHost>) -> Arc<TargetHost> {
    Arc::clone(GLOBAL.get_or_init(|| host))
}

/// The process-wide host, once installed.
pub fn global() -> Option<Arc<TargetHost>> {
    GLOBAL.get().cloned()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sim::SimulatedEngine;

    fn host() -> TargetHost {
        TargetHost::new(Arc::new(SimulatedEngine::new()))
    }

    #[tokio::test]
    async fn test_listen_reports_bound_port() {
        let host = host();
        let outcome = host
            .attach(AttachConfig::listen(Address::localhost(0)))
            .await
            .unwrap();
        let address = outcome.address().unwrap();
        assert_ne!(address.port(), 0);
        assert_eq!(host.listening_address(), Some(address));

        // Re-attaching keeps the same endpoint.
        let again = host
            .attach(AttachConfig::listen(Address::localhost(0)))
            .await
            .unwrap();
        assert_eq!(again.address(), Some(address));
        host.shutdown().await;
    }

    #[tokio::test]
    async fn test_wait_for_client_times_out() {
        let host = host();
        host.attach(AttachConfig::listen(Address::localhost(0)))
            .await
            .unwrap();
        assert!(!host.wait_for_client(Some(Duration::from_millis(50))).await);
        assert!(!host.is_client_connected());
        host.shutdown().await;
    }

    #[tokio::test]
    async fn test_attach_after_termination_fails() {
        let host = host();
        host.state().terminate();
        let err = host
            .attach(AttachConfig::listen(Address::localhost(0)))
            .await
            .unwrap_err();
        assert!(matches!(err, NegotiationError::TargetTerminated));
    }

    #[tokio::test]
    async fn test_global_first_install_wins() {
        let first = Arc::new(host().with_pid(ProcessId::new(4242)));
        let installed = install_global(Arc::clone(&first));
        let second = install_global(Arc::new(host().with_pid(ProcessId::new(1))));
        assert_eq!(installed.pid(), second.pid());
        assert!(global().is_some());
    }
}
