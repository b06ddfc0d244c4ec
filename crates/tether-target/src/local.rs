//! In-process injection primitive.
//!
//! Resolves pids against a table of [`TargetHost`]s living in the current
//! process. Lets attach-by-pid run end to end without OS-level injection,
//! for tests and the demo binaries.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use tracing::debug;

use tether_core::{AttachConfig, ProcessId};
use tether_protocol::NegotiationError;

use crate::attach::AttachError;
use crate::engine::{EngineError, SeverityCallbacks};
use crate::host::{AttachOutcome, TargetHost};
use crate::injector::{InjectionError, InjectionPrimitive, TargetRuntime};

#[derive(Clone)]
enum Entry {
    Host(Arc<TargetHost>),
    Denied(String),
}

/// Table of injectable in-process targets.
#[derive(Clone, Default)]
pub struct InProcessInjection {
    table: Arc<Mutex<HashMap<ProcessId, Entry>>>,
}

impl InProcessInjection {
    pub fn new() -> Self {
        Self::default()
    }

    fn table(&self) -> MutexGuard<'_, HashMap<ProcessId, Entry>> {
        self.table.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Makes `host` injectable under its pid.
    pub fn register(&self, host: Arc<TargetHost>) {
        let pid = host.pid();
        self.table().insert(pid, Entry::Host(host));
        debug!(pid = %pid, "Registered in-process target");
    }

    /// Makes `pid` refuse injection with `reason`.
    pub fn deny(&self, pid: ProcessId, reason: impl Into<String>) {
        self.table().insert(pid, Entry::Denied(reason.into()));
    }

    pub fn unregister(&self, pid: ProcessId) -> bool {
        self.table().remove(&pid).is_some()
    }
}

impl std::fmt::Debug for InProcessInjection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InProcessInjection")
            .field("targets", &self.table().len())
            .finish()
    }
}

#[async_trait]
impl InjectionPrimitive for InProcessInjection {
    async fn open(&self, pid: ProcessId) -> Result<Box<dyn TargetRuntime>, InjectionError> {
        let entry = self.table().get(&pid).cloned();
        match entry {
            Some(Entry::Host(host)) => Ok(Box::new(InProcessRuntime { host })),
            Some(Entry::Denied(reason)) => Err(InjectionError::Refused { pid, reason }),
            None => Err(InjectionError::ProcessNotFound { pid }),
        }
    }
}

/// A [`TargetHost`] opened for injection.
struct InProcessRuntime {
    host: Arc<TargetHost>,
}

#[async_trait]
impl TargetRuntime for InProcessRuntime {
    fn pid(&self) -> ProcessId {
        self.host.pid()
    }

    fn needs_identity_correction(&self) -> bool {
        self.host.engine().needs_identity_correction()
    }

    async fn correct_identity(&self, callbacks: &SeverityCallbacks) -> Result<bool, EngineError> {
        let engine = self.host.engine();
        self.host
            .state()
            .correct_identity_once(|| engine.correct_main_thread_identity(callbacks))
            .await
    }

    fn expose_machinery(&self) -> Result<(), AttachError> {
        self.host.state().expose_machinery()
    }

    fn retract_machinery(&self) {
        self.host.state().retract_machinery();
    }

    async fn enter(&self, config: AttachConfig) -> Result<AttachOutcome, NegotiationError> {
        self.host.attach(config).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::injector::Injector;
    use crate::sim::SimulatedEngine;
    use tether_core::Address;

    #[tokio::test]
    async fn test_identity_corrected_once_across_installs() {
        let engine = SimulatedEngine::new().with_late_concurrency();
        let host = Arc::new(
            TargetHost::new(Arc::new(engine.clone())).with_pid(ProcessId::new(3100)),
        );
        let primitive = InProcessInjection::new();
        primitive.register(Arc::clone(&host));
        let injector = Injector::new(primitive);

        let config = AttachConfig::listen(Address::localhost(0));
        injector
            .install(ProcessId::new(3100), config.clone())
            .await
            .unwrap();
        injector.install(ProcessId::new(3100), config).await.unwrap();

        assert_eq!(engine.identity_corrections(), 1);
        assert!(host.state().identity_corrected());
        assert!(!host.state().machinery_exposed());
        host.shutdown().await;
    }

    #[tokio::test]
    async fn test_denied_pid_is_refused() {
        let primitive = InProcessInjection::new();
        primitive.deny(ProcessId::new(1), "protected process");
        let injector = Injector::new(primitive);

        let err = injector
            .install(ProcessId::new(1), AttachConfig::listen(Address::localhost(0)))
            .await
            .unwrap_err();
        assert!(matches!(err, InjectionError::Refused { .. }));
        assert!(err.to_string().contains("protected process"));
    }
}
