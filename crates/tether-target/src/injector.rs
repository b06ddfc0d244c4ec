//! Out-of-process injection bootstrap.
//!
//! [`Injector::install`] attaches to a live process in three steps:
//! 1. open the process and, if its runtime started concurrency late,
//!    correct the main thread's identity (once per process lifetime)
//! 2. expose the attach machinery inside a [`MachineryScope`]
//! 3. call the same entry point a self-attaching target uses
//!
//! A failure in any step is logged with its phase, the pid, and a
//! backtrace, then returned. Nothing is retried.
//!
//! The OS-level part (process lookup, loading code into the target) is
//! behind [`InjectionPrimitive`] / [`TargetRuntime`].

use std::backtrace::Backtrace;
use std::fmt;

use async_trait::async_trait;
use thiserror::Error;
use tracing::{debug, error, info};

use tether_core::{AttachConfig, DomainError, ProcessId};
use tether_protocol::{NegotiationError, RawAttachRequest};

use crate::attach::AttachError;
use crate::engine::{EngineError, SeverityCallbacks};
use crate::host::AttachOutcome;

// ============================================================================
// Errors
// ============================================================================

/// Step of the bootstrap that failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InjectionPhase {
    Config,
    Open,
    IdentityCorrection,
    Machinery,
    Entry,
}

impl fmt::Display for InjectionPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Config => "config",
            Self::Open => "open",
            Self::IdentityCorrection => "identity correction",
            Self::Machinery => "machinery",
            Self::Entry => "entry",
        };
        f.write_str(s)
    }
}

/// Bootstrap failures. Every variant names the target pid.
#[derive(Error, Debug)]
pub enum InjectionError {
    #[error("process {pid} not found")]
    ProcessNotFound { pid: ProcessId },

    #[error("process {pid} refused injection: {reason}")]
    Refused { pid: ProcessId, reason: String },

    #[error("process {pid} cannot be hooked: {reason}")]
    Unhookable { pid: ProcessId, reason: String },

    #[error("main thread identity correction failed in process {pid}: {reason}")]
    IdentityCorrection { pid: ProcessId, reason: String },

    #[error("invalid attach config for process {pid}: {source}")]
    InvalidConfig {
        pid: ProcessId,
        #[source]
        source: DomainError,
    },

    #[error("negotiation for process {pid} failed: {source}")]
    Negotiation {
        pid: ProcessId,
        #[source]
        source: NegotiationError,
    },
}

impl InjectionError {
    pub fn pid(&self) -> ProcessId {
        match self {
            Self::ProcessNotFound { pid }
            | Self::Refused { pid, .. }
            | Self::Unhookable { pid, .. }
            | Self::IdentityCorrection { pid, .. }
            | Self::InvalidConfig { pid, .. }
            | Self::Negotiation { pid, .. } => *pid,
        }
    }

    pub fn phase(&self) -> InjectionPhase {
        match self {
            Self::InvalidConfig { .. } => InjectionPhase::Config,
            Self::ProcessNotFound { .. } | Self::Refused { .. } => InjectionPhase::Open,
            Self::IdentityCorrection { .. } => InjectionPhase::IdentityCorrection,
            Self::Unhookable { .. } => InjectionPhase::Machinery,
            Self::Negotiation { .. } => InjectionPhase::Entry,
        }
    }
}

// ============================================================================
// Collaborator traits
// ============================================================================

/// OS-level access to other processes.
#[async_trait]
pub trait InjectionPrimitive: Send + Sync {
    /// Opens the process `pid` for injection.
    ///
    /// # Errors
    ///
    /// - `InjectionError::ProcessNotFound` if there is no such process
    /// - `InjectionError::Refused` if the process cannot be opened
    async fn open(&self, pid: ProcessId) -> Result<Box<dyn TargetRuntime>, InjectionError>;
}

/// An opened target process.
#[async_trait]
pub trait TargetRuntime: Send + Sync {
    fn pid(&self) -> ProcessId;

    /// True when the runtime started its threading support late.
    fn needs_identity_correction(&self) -> bool;

    /// Re-identifies the main thread unless that already happened in this
    /// process. Returns whether the correction ran now.
    async fn correct_identity(&self, callbacks: &SeverityCallbacks) -> Result<bool, EngineError>;

    /// Loads the attach machinery into the target.
    fn expose_machinery(&self) -> Result<(), AttachError>;

    /// Unloads what [`expose_machinery`](Self::expose_machinery) loaded.
    fn retract_machinery(&self);

    /// Calls the target's control entry point.
    async fn enter(&self, config: AttachConfig) -> Result<AttachOutcome, NegotiationError>;
}

/// Keeps the attach machinery exposed for its lifetime.
pub struct MachineryScope<'a> {
    runtime: &'a dyn TargetRuntime,
}

impl<'a> MachineryScope<'a> {
    pub fn expose(runtime: &'a dyn TargetRuntime) -> Result<Self, AttachError> {
        runtime.expose_machinery()?;
        debug!(pid = %runtime.pid(), "Attach machinery exposed");
        Ok(Self { runtime })
    }
}

impl Drop for MachineryScope<'_> {
    fn drop(&mut self) {
        self.runtime.retract_machinery();
        debug!(pid = %self.runtime.pid(), "Attach machinery retracted");
    }
}

// ============================================================================
// Injector
// ============================================================================

/// Attaches to processes through an [`InjectionPrimitive`].
pub struct Injector<P> {
    primitive: P,
    callbacks: SeverityCallbacks,
}

impl<P: InjectionPrimitive> Injector<P> {
    pub fn new(primitive: P) -> Self {
        Self {
            primitive,
            callbacks: SeverityCallbacks::default(),
        }
    }

    /// Diagnostic sinks for identity correction.
    #[must_use]
    pub fn with_callbacks(mut self, callbacks: SeverityCallbacks) -> Self {
        self.callbacks = callbacks;
        self
    }

    pub fn primitive(&self) -> &P {
        &self.primitive
    }

    /// Installs the hook into `pid` and applies `config`.
    pub async fn install(
        &self,
        pid: ProcessId,
        config: AttachConfig,
    ) -> Result<AttachOutcome, InjectionError> {
        let address = config.address().to_endpoint();
        match self.try_install(pid, config).await {
            Ok(outcome) => {
                info!(pid = %pid, address = %address, "Attach installed");
                Ok(outcome)
            }
            Err(e) => {
                let backtrace = Backtrace::capture();
                error!(
                    pid = %pid,
                    phase = %e.phase(),
                    address = %address,
                    error = %e,
                    backtrace = %backtrace,
                    "Attach failed"
                );
                Err(e)
            }
        }
    }

    /// Like [`install`](Self::install) for a request in wire shape.
    pub async fn install_request(
        &self,
        request: RawAttachRequest,
    ) -> Result<AttachOutcome, InjectionError> {
        let pid = request.process_id;
        let config = request
            .config
            .into_config()
            .map_err(|source| InjectionError::InvalidConfig { pid, source })?;
        self.install(pid, config).await
    }

    async fn try_install(
        &self,
        pid: ProcessId,
        config: AttachConfig,
    ) -> Result<AttachOutcome, InjectionError> {
        let runtime = self.primitive.open(pid).await?;
        debug!(pid = %pid, "Process opened");

        if runtime.needs_identity_correction() {
            let ran = runtime
                .correct_identity(&self.callbacks)
                .await
                .map_err(|e| InjectionError::IdentityCorrection {
                    pid,
                    reason: e.to_string(),
                })?;
            debug!(pid = %pid, ran, "Main thread identity checked");
        }

        let _scope = MachineryScope::expose(runtime.as_ref()).map_err(|e| {
            InjectionError::Unhookable {
                pid,
                reason: e.to_string(),
            }
        })?;

        runtime
            .enter(config)
            .await
            .map_err(|source| InjectionError::Negotiation { pid, source })
    }
}

impl<P> fmt::Debug for Injector<P> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Injector").finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::sync::Arc;
    use tether_core::Address;

    #[derive(Default)]
    struct Probe {
        exposed: AtomicBool,
        retracted: AtomicUsize,
    }

    struct FailingRuntime {
        probe: Arc<Probe>,
    }

    #[async_trait]
    impl TargetRuntime for FailingRuntime {
        fn pid(&self) -> ProcessId {
            ProcessId::new(77)
        }

        fn needs_identity_correction(&self) -> bool {
            false
        }

        async fn correct_identity(&self, _: &SeverityCallbacks) -> Result<bool, EngineError> {
            Ok(false)
        }

        fn expose_machinery(&self) -> Result<(), AttachError> {
            self.probe.exposed.store(true, Ordering::SeqCst);
            Ok(())
        }

        fn retract_machinery(&self) {
            self.probe.retracted.fetch_add(1, Ordering::SeqCst);
        }

        async fn enter(&self, _: AttachConfig) -> Result<AttachOutcome, NegotiationError> {
            Err(NegotiationError::TargetTerminated)
        }
    }

    struct OnePrimitive {
        probe: Arc<Probe>,
    }

    #[async_trait]
    impl InjectionPrimitive for OnePrimitive {
        async fn open(&self, pid: ProcessId) -> Result<Box<dyn TargetRuntime>, InjectionError> {
            if pid == ProcessId::new(77) {
                Ok(Box::new(FailingRuntime {
                    probe: Arc::clone(&self.probe),
                }))
            } else {
                Err(InjectionError::ProcessNotFound { pid })
            }
        }
    }

    #[tokio::test]
    async fn test_machinery_retracted_on_failure() {
        let probe = Arc::new(Probe::default());
        let injector = Injector::new(OnePrimitive {
            probe: Arc::clone(&probe),
        });

        let err = injector
            .install(ProcessId::new(77), AttachConfig::listen(Address::localhost(0)))
            .await
            .unwrap_err();
        assert_eq!(err.phase(), InjectionPhase::Entry);
        assert_eq!(err.pid(), ProcessId::new(77));
        assert!(probe.exposed.load(Ordering::SeqCst));
        assert_eq!(probe.retracted.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_unknown_pid() {
        let injector = Injector::new(OnePrimitive {
            probe: Arc::new(Probe::default()),
        });
        let err = injector
            .install(ProcessId::new(5), AttachConfig::listen(Address::localhost(0)))
            .await
            .unwrap_err();
        assert!(matches!(err, InjectionError::ProcessNotFound { .. }));
        assert_eq!(err.phase(), InjectionPhase::Open);
    }

    #[tokio::test]
    async fn test_invalid_mode_in_request() {
        let injector = Injector::new(OnePrimitive {
            probe: Arc::new(Probe::default()),
        });
        let request: RawAttachRequest = serde_json::from_str(
            r#"{"processId": 77, "mode": "sideways", "host": "127.0.0.1", "port": 0}"#,
        )
        .unwrap();
        let err = injector.install_request(request).await.unwrap_err();
        assert!(matches!(err, InjectionError::InvalidConfig { .. }));
        assert_eq!(err.pid(), ProcessId::new(77));
    }
}
