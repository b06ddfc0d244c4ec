//! The execution engine seam.
//!
//! Everything that actually stops, steps, and inspects program threads lives
//! behind [`ExecutionEngine`]. The attach machinery only drives it: sessions
//! forward commands to it and relay the [`EngineEvent`]s it publishes.
//!
//! The engine owns the live breakpoint set. Sessions never keep their own
//! copy beyond a view that is re-read from the engine after every change.

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::broadcast;
use tracing::{error, warn};

use tether_core::{BreakpointSet, FrameId, SourceLocation, StackFrame, StopEvent, ThreadId, ThreadInfo};
use tether_protocol::{OutputCategory, TargetEvent};

// ============================================================================
// Events
// ============================================================================

/// Notifications published by the engine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EngineEvent {
    /// A thread halted. At most one halt is outstanding at a time.
    Stopped(StopEvent),
    /// The halted thread (and every waiting thread) resumed.
    Continued { thread_id: Option<ThreadId> },
    /// Program output.
    Output { category: OutputCategory, text: String },
    /// The program finished or was terminated.
    Exited { exit_code: i32 },
}

impl From<EngineEvent> for TargetEvent {
    fn from(event: EngineEvent) -> Self {
        match event {
            EngineEvent::Stopped(stop) => TargetEvent::Stopped(stop),
            EngineEvent::Continued { thread_id } => TargetEvent::Continued {
                thread_id,
                all_threads: true,
            },
            EngineEvent::Output { category, text } => TargetEvent::Output {
                category,
                output: text,
            },
            EngineEvent::Exited { exit_code } => TargetEvent::Exited { exit_code },
        }
    }
}

// ============================================================================
// Errors
// ============================================================================

/// Failures reported by an [`ExecutionEngine`].
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum EngineError {
    #[error("target is not halted")]
    NotHalted,

    #[error("thread {0} is not the halted thread")]
    ThreadNotHalted(ThreadId),

    #[error("unknown thread {0}")]
    UnknownThread(ThreadId),

    #[error("unknown frame {0}")]
    UnknownFrame(FrameId),

    #[error("cannot assign to expression {0:?}")]
    InvalidExpression(String),

    #[error("target has terminated")]
    Terminated,

    #[error("engine refused: {0}")]
    Refused(String),
}

impl EngineError {
    /// True when the error names a thread or frame that does not exist.
    pub fn is_unknown_reference(&self) -> bool {
        matches!(self, Self::UnknownThread(_) | Self::UnknownFrame(_))
    }
}

// ============================================================================
// Severity callbacks
// ============================================================================

type SeverityFn = Arc<dyn Fn(&str) + Send + Sync>;

/// Three diagnostic sinks handed to the identity-correction step.
///
/// Messages routed here never abort an attach; they only record that the
/// correction was partial. The defaults forward to `tracing`.
#[derive(Clone)]
pub struct SeverityCallbacks {
    warning: SeverityFn,
    error: SeverityFn,
    critical: SeverityFn,
}

impl SeverityCallbacks {
    #[must_use]
    pub fn on_warning(mut self, f: impl Fn(&str) + Send + Sync + 'static) -> Self {
        self.warning = Arc::new(f);
        self
    }

    #[must_use]
    pub fn on_error(mut self, f: impl Fn(&str) + Send + Sync + 'static) -> Self {
        self.error = Arc::new(f);
        self
    }

    #[must_use]
    pub fn on_critical(mut self, f: impl Fn(&str) + Send + Sync + 'static) -> Self {
        self.critical = Arc::new(f);
        self
    }

    pub fn warning(&self, message: &str) {
        (self.warning)(message);
    }

    pub fn error(&self, message: &str) {
        (self.error)(message);
    }

    pub fn critical(&self, message: &str) {
        (self.critical)(message);
    }
}

impl Default for SeverityCallbacks {
    fn default() -> Self {
        Self {
            warning: Arc::new(|msg| warn!(message = %msg, "Identity correction warning")),
            error: Arc::new(|msg| error!(message = %msg, "Identity correction error")),
            critical: Arc::new(|msg| error!(message = %msg, critical = true, "Identity correction critical")),
        }
    }
}

impl fmt::Debug for SeverityCallbacks {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SeverityCallbacks").finish_non_exhaustive()
    }
}

// ============================================================================
// Engine trait
// ============================================================================

/// Collaborator that executes and halts the target program.
///
/// Mutating methods return only after the change is in effect, so a
/// session can acknowledge a command as soon as the call returns.
#[async_trait]
pub trait ExecutionEngine: Send + Sync + 'static {
    /// Requests a halt of `thread` (any thread when `None`). Other threads
    /// keep running. A request while already halted is a no-op.
    async fn pause(&self, thread: Option<ThreadId>) -> Result<(), EngineError>;

    /// Resumes the halted thread and any thread waiting to halt.
    async fn resume(&self) -> Result<(), EngineError>;

    /// Resumes `thread` and halts it again at its next statement.
    async fn step(&self, thread: ThreadId) -> Result<(), EngineError>;

    /// Returns false if the breakpoint already existed.
    async fn add_breakpoint(&self, location: SourceLocation) -> Result<bool, EngineError>;

    /// Returns false if there was no such breakpoint.
    async fn remove_breakpoint(&self, location: &SourceLocation) -> Result<bool, EngineError>;

    async fn clear_breakpoints(&self) -> Result<(), EngineError>;

    /// The live breakpoint set.
    async fn breakpoints(&self) -> BreakpointSet;

    /// Assigns `value` to `expression` in a frame of the halted thread and
    /// returns the value now held.
    async fn set_expression(
        &self,
        thread: ThreadId,
        frame: FrameId,
        expression: &str,
        value: &str,
    ) -> Result<String, EngineError>;

    async fn threads(&self) -> Vec<ThreadInfo>;

    async fn stack_trace(&self, thread: ThreadId) -> Result<Vec<StackFrame>, EngineError>;

    /// The outstanding halt, if any.
    async fn current_stop(&self) -> Option<StopEvent>;

    /// Ends the program.
    async fn terminate(&self) -> Result<(), EngineError>;

    /// Tells the engine whether a controller is bound. Programmatic
    /// breakpoints only halt while one is.
    async fn controller_attached(&self, attached: bool);

    /// True when the runtime started its threading support outside the
    /// normal startup path, so the main thread must be re-identified.
    fn needs_identity_correction(&self) -> bool;

    /// Re-identifies the main thread. Partial problems go to `callbacks`;
    /// only a hard failure is returned.
    async fn correct_main_thread_identity(
        &self,
        callbacks: &SeverityCallbacks,
    ) -> Result<(), EngineError>;

    fn subscribe(&self) -> broadcast::Receiver<EngineEvent>;

    /// Subscribes and reads the outstanding halt in one step, under the
    /// guard that publishes halt changes. Every `Stopped` or `Continued`
    /// on the receiver happened after the returned halt.
    async fn subscribe_with_halt(&self) -> (broadcast::Receiver<EngineEvent>, Option<StopEvent>);
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;
    use tether_core::StopReason;

    #[test]
    fn test_engine_event_to_wire() {
        let stop = StopEvent::new(StopReason::Pause, ThreadId(2), Vec::new());
        assert_eq!(
            TargetEvent::from(EngineEvent::Stopped(stop.clone())),
            TargetEvent::Stopped(stop)
        );
        assert_eq!(
            TargetEvent::from(EngineEvent::Continued { thread_id: None }),
            TargetEvent::Continued {
                thread_id: None,
                all_threads: true
            }
        );
    }

    #[test]
    fn test_custom_callbacks_receive_messages() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let callbacks = SeverityCallbacks::default()
            .on_critical(move |msg| sink.lock().unwrap().push(msg.to_string()));

        callbacks.warning("goes to tracing");
        callbacks.critical("kept");
        assert_eq!(*seen.lock().unwrap(), vec!["kept".to_string()]);
    }

    #[test]
    fn test_unknown_reference_classification() {
        assert!(EngineError::UnknownThread(ThreadId(9)).is_unknown_reference());
        assert!(!EngineError::NotHalted.is_unknown_reference());
    }
}
