//! Tether Core - Shared types for attaching a controller to a live target
//!
//! This crate provides the domain types shared between the in-target
//! machinery (`tether-target`) and the controller (`tether-controller`).
//!
//! All code follows the panic-free policy: no `.unwrap()`, `.expect()`,
//! `panic!()`, `unreachable!()`, `todo!()`, or direct indexing `[i]`.

pub mod attach;
pub mod breakpoint;
pub mod config;
pub mod error;
pub mod process;
pub mod session;
pub mod stop;

// Re-exports for convenience
pub use attach::AttachPhase;
pub use breakpoint::{BreakpointSet, SourceLocation};
pub use config::{Address, AttachConfig, AttachMode};
pub use error::{DomainError, DomainResult};
pub use process::ProcessId;
pub use session::{DisconnectCause, SessionId, SessionOptions, SessionState, SessionSummary};
pub use stop::{FrameId, StackFrame, StopEvent, StopReason, ThreadId, ThreadInfo};
