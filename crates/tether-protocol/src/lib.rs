//! Tether Protocol - wire protocol between controller and target
//!
//! This crate provides the length-prefixed JSON framing, the handshake
//! round, the session command/event messages, and parsing of attach
//! requests arriving from outside the workspace.

pub mod codec;
pub mod error;
pub mod handshake;
pub mod message;
pub mod parse;
pub mod transport;
pub mod version;

pub use codec::{CodecError, Inbound, MessageCodec, MAX_FRAME_LENGTH};
pub use error::{NegotiationError, NegotiationPhase};
pub use handshake::{AcceptPolicy, Greeting, Handshake, HandshakeTransport, PeerInfo, PeerRole};
pub use message::{
    Command, ControllerMessage, ErrorCode, OutputCategory, Response, ResponseBody, TargetEvent,
    TargetMessage,
};
pub use parse::{RawAttachConfig, RawAttachRequest};
pub use transport::{Transport, TransportRole, TransportSink, TransportStream};
pub use version::{ProtocolVersion, VersionError};

/// Transport as seen by the target once a session is bound.
pub type TargetTransport = Transport<ControllerMessage, TargetMessage>;

/// Transport as seen by the controller once a session is bound.
pub type ControllerTransport = Transport<TargetMessage, ControllerMessage>;
