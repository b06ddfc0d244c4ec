//! Tether Target - attach machinery living inside the debugged process
//!
//! This crate provides everything the target side needs:
//! - `host` - control entry point, listen-mode accept loop, process-wide instance
//! - `injector` - out-of-process bootstrap over an injection primitive
//! - `negotiate` - transport setup in either direction
//! - `session` - per-controller session actor and connection loop
//! - `reattach` - state handoff between consecutive sessions
//! - `sim` - scripted execution engine for tests and demos
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                       target process                        │
//! ├─────────────────────────────────────────────────────────────┤
//! │                                                             │
//! │  ┌─────────────────┐     ┌─────────────────────────────┐    │
//! │  │    Injector     │────▶│        TargetHost           │    │
//! │  │  (bootstrap)    │     │  (AttachState, listener)    │    │
//! │  └─────────────────┘     └──────────────┬──────────────┘    │
//! │                                         │ negotiated        │
//! │                                         ▼                   │
//! │  ┌─────────────────┐     ┌─────────────────────────────┐    │
//! │  │ ExecutionEngine │◀───▶│ SessionConnection + Actor   │    │
//! │  │  (collaborator) │     │ (one at a time, reattach)   │    │
//! │  └─────────────────┘     └─────────────────────────────┘    │
//! │                                                             │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Panic-Free Guarantees
//!
//! All production code in this crate follows the panic-free policy:
//! - No `.unwrap()`, `.expect()`, `panic!()`, `unreachable!()`, `todo!()`
//! - All fallible operations return `Result` or `Option`
//! - Channel operations handle closure gracefully

pub mod attach;
pub mod engine;
pub mod host;
pub mod injector;
pub mod local;
pub mod logging;
pub mod negotiate;
pub mod reattach;
pub mod session;
pub mod sim;

pub use attach::{AttachError, AttachState, SlotReservation};
pub use engine::{EngineError, EngineEvent, ExecutionEngine, SeverityCallbacks};
pub use host::{global, install_global, AttachOutcome, TargetHost};
pub use injector::{
    InjectionError, InjectionPhase, InjectionPrimitive, Injector, MachineryScope, TargetRuntime,
};
pub use local::InProcessInjection;
pub use negotiate::{Negotiated, NegotiationOptions};
pub use reattach::{BindSnapshot, ReattachCoordinator, ReattachError};
pub use session::{
    DisconnectPlan, SessionError, SessionHandle, SessionLifecycle, SessionOutcome,
};
pub use sim::{SimulatedEngine, Statement, ThreadScript};
