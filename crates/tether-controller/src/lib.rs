//! Tether Controller - the debugger side of a tether session
//!
//! This crate provides:
//! - `config` - TOML-backed connection settings
//! - `connect` - dialing a listening target, accepting a dialing target
//! - `attach` - attach by pid through an injector
//! - `session` - typed commands, response correlation, event stream
//!
//! # Panic-Free Guarantees
//!
//! All production code in this crate follows the panic-free policy:
//! - No `.unwrap()`, `.expect()`, `panic!()`, `unreachable!()`, `todo!()`
//! - All fallible operations return `Result`

pub mod attach;
pub mod config;
pub mod connect;
pub mod error;
pub mod session;

pub use attach::attach_by_pid;
pub use config::{ControllerConfig, DEFAULT_PORT};
pub use connect::{connect, connect_once, connect_with_retry, ControllerListener};
pub use error::{ControllerError, Result};
pub use session::ControllerSession;
