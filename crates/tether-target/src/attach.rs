//! Process-wide attach state.
//!
//! One [`AttachState`] exists per target process. It records the attach
//! phase, whether main-thread identity correction already ran, which
//! session (if any) is bound, and whether the bootstrap machinery is
//! currently exposed. All phase changes go through a single lock.
//!
//! # Panic-Free Guarantees
//!
//! - No `.unwrap()` or `.expect()` in production code
//! - A poisoned lock is recovered, since every critical section leaves the
//!   state consistent before it can panic

use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use thiserror::Error;
use tokio::sync::{watch, OnceCell};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use tether_core::{AttachConfig, AttachPhase, DomainError, SessionId};

/// Errors from attach phase changes.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AttachError {
    #[error(transparent)]
    Transition(#[from] DomainError),

    #[error("{active} is already bound")]
    SessionBusy { active: SessionId },

    #[error("another controller is negotiating")]
    Reserved,

    #[error("{0} is not the active session")]
    NotActive(SessionId),

    #[error("target has terminated")]
    Terminated,

    #[error("attach machinery is already exposed")]
    MachineryBusy,
}

#[derive(Debug, Default)]
struct AttachInner {
    phase: AttachPhase,
    config: Option<AttachConfig>,
    active: Option<SessionId>,
    /// A handshake holds the slot.
    reserved: bool,
    sessions_bound: u64,
}

/// Single-writer attach state of one target process.
#[derive(Debug)]
pub struct AttachState {
    inner: Mutex<AttachInner>,
    identity: OnceCell<()>,
    machinery: AtomicBool,
    client: watch::Sender<bool>,
    terminated: CancellationToken,
}

impl Default for AttachState {
    fn default() -> Self {
        Self::new()
    }
}

impl AttachState {
    pub fn new() -> Self {
        let (client, _) = watch::channel(false);
        Self {
            inner: Mutex::new(AttachInner::default()),
            identity: OnceCell::new(),
            machinery: AtomicBool::new(false),
            client,
            terminated: CancellationToken::new(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, AttachInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn phase(&self) -> AttachPhase {
        self.lock().phase
    }

    /// Config of the most recent hook installation.
    pub fn config(&self) -> Option<AttachConfig> {
        self.lock().config.clone()
    }

    /// Installs (or re-arms) the execution hook with `config`.
    pub fn install_hook(&self, config: AttachConfig) -> Result<(), AttachError> {
        let mut inner = self.lock();
        match inner.phase {
            AttachPhase::Terminated => return Err(AttachError::Terminated),
            // A second attach while a session is bound keeps the session.
            AttachPhase::Sessioned => {}
            _ => inner.phase.transition(AttachPhase::Hooked)?,
        }
        info!(config = ?config, phase = %inner.phase, "Attach hook installed");
        inner.config = Some(config);
        Ok(())
    }

    fn check_slot(inner: &AttachInner) -> Result<(), AttachError> {
        match (inner.phase, inner.active) {
            (AttachPhase::Terminated, _) => Err(AttachError::Terminated),
            (_, Some(active)) => Err(AttachError::SessionBusy { active }),
            _ if inner.reserved => Err(AttachError::Reserved),
            _ => Ok(()),
        }
    }

    fn bind_locked(&self, inner: &mut AttachInner) -> Result<SessionId, AttachError> {
        inner.phase.transition(AttachPhase::Sessioned)?;
        inner.sessions_bound += 1;
        let id = SessionId::new(inner.sessions_bound);
        inner.active = Some(id);
        self.client.send_replace(true);
        debug!(session_id = %id, "Session slot bound");
        Ok(id)
    }

    /// Takes the single session slot and numbers the new session.
    pub fn try_bind_session(&self) -> Result<SessionId, AttachError> {
        let mut inner = self.lock();
        Self::check_slot(&inner)?;
        self.bind_locked(&mut inner)
    }

    /// Holds the session slot while a handshake runs.
    ///
    /// Nothing is counted and no client is reported until
    /// [`SlotReservation::bind`]; dropping the reservation frees the slot.
    pub fn reserve_session(self: &Arc<Self>) -> Result<SlotReservation, AttachError> {
        let mut inner = self.lock();
        Self::check_slot(&inner)?;
        inner.reserved = true;
        debug!("Session slot reserved for a handshake");
        Ok(SlotReservation {
            state: Arc::clone(self),
            bound: false,
        })
    }

    /// Frees the session slot so a later controller can reattach.
    pub fn release_session(&self, id: SessionId) -> Result<(), AttachError> {
        let mut inner = self.lock();
        if inner.active != Some(id) {
            return Err(AttachError::NotActive(id));
        }
        inner.active = None;
        self.client.send_replace(false);
        if inner.phase == AttachPhase::Sessioned {
            inner.phase.transition(AttachPhase::Hooked)?;
        }
        debug!(session_id = %id, "Session slot released");
        Ok(())
    }

    /// Moves to the terminal phase. Idempotent.
    pub fn terminate(&self) {
        let mut inner = self.lock();
        if inner.phase != AttachPhase::Terminated {
            // every non-terminal phase may terminate
            let _ = inner.phase.transition(AttachPhase::Terminated);
            inner.active = None;
            info!("Attach state terminated");
        }
        self.client.send_replace(false);
        self.terminated.cancel();
    }

    pub fn active_session(&self) -> Option<SessionId> {
        self.lock().active
    }

    /// Number of sessions bound over the process lifetime.
    pub fn sessions_bound(&self) -> u64 {
        self.lock().sessions_bound
    }

    pub fn is_client_connected(&self) -> bool {
        *self.client.borrow()
    }

    pub fn watch_client(&self) -> watch::Receiver<bool> {
        self.client.subscribe()
    }

    /// Cancelled once the target terminates.
    pub fn terminated(&self) -> CancellationToken {
        self.terminated.clone()
    }

    // ========================================================================
    // Identity correction
    // ========================================================================

    /// Runs `correct` unless an earlier call already succeeded.
    ///
    /// Returns `Ok(true)` when the correction ran during this call. A failed
    /// attempt is not recorded, so a later attach retries it.
    pub async fn correct_identity_once<F, Fut, E>(&self, correct: F) -> Result<bool, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<(), E>>,
    {
        let mut ran = false;
        self.identity
            .get_or_try_init(|| {
                ran = true;
                correct()
            })
            .await?;
        Ok(ran)
    }

    pub fn identity_corrected(&self) -> bool {
        self.identity.initialized()
    }

    // ========================================================================
    // Bootstrap machinery
    // ========================================================================

    /// Marks the bootstrap machinery as loaded into the target.
    pub fn expose_machinery(&self) -> Result<(), AttachError> {
        self.machinery
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .map(|_| ())
            .map_err(|_| AttachError::MachineryBusy)
    }

    pub fn retract_machinery(&self) {
        self.machinery.store(false, Ordering::Release);
    }

    pub fn machinery_exposed(&self) -> bool {
        self.machinery.load(Ordering::Acquire)
    }
}

/// Claim on the session slot, released on drop unless bound.
#[derive(Debug)]
pub struct SlotReservation {
    state: Arc<AttachState>,
    bound: bool,
}

impl SlotReservation {
    /// Turns the claim into the bound session.
    pub fn bind(mut self) -> Result<SessionId, AttachError> {
        self.bound = true;
        let mut inner = self.state.lock();
        inner.reserved = false;
        if inner.phase == AttachPhase::Terminated {
            return Err(AttachError::Terminated);
        }
        self.state.bind_locked(&mut inner)
    }
}

impl Drop for SlotReservation {
    fn drop(&mut self) {
        if !self.bound {
            self.state.lock().reserved = false;
            debug!("Session slot reservation dropped");
        }
    }
}
