//! The single handshake round that precedes every session.
//!
//! ```text
//! connector                       listener
//!     │ ── Hello ──────────────────▶ │  version check, token check,
//!     │                              │  session-options check, busy check
//!     │ ◀──────── Welcome/Rejected ─ │
//! ```
//!
//! Either side can be the controller. The controller's message always
//! carries [`SessionOptions`]; the target's never does.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use tether_core::SessionOptions;

use crate::codec::Inbound;
use crate::error::{NegotiationError, NegotiationPhase};
use crate::transport::Transport;
use crate::version::ProtocolVersion;

/// Which end of a session a peer is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PeerRole {
    Controller,
    Target,
}

/// Handshake frames.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Handshake {
    /// First frame, sent by the connector.
    Hello {
        protocol_version: ProtocolVersion,
        role: PeerRole,
        #[serde(default)]
        capabilities: Vec<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        access_token: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        session: Option<SessionOptions>,
    },

    /// Listener accepted the connector.
    Welcome {
        protocol_version: ProtocolVersion,
        role: PeerRole,
        #[serde(default)]
        capabilities: Vec<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        session: Option<SessionOptions>,
    },

    /// Listener refused the connector; the transport is closed after this.
    Rejected {
        protocol_version: ProtocolVersion,
        reason: String,
    },
}

/// Wire reason of a busy refusal. A connector maps it back to
/// [`NegotiationError::SessionBusy`] so it can be retried.
const BUSY_REASON: &str = "session already active";

/// Transport carrying handshake frames in both directions.
pub type HandshakeTransport = Transport<Handshake, Handshake>;

/// What the local side announces.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Greeting {
    pub role: PeerRole,
    pub capabilities: Vec<String>,
    /// Presented only by a connector.
    pub access_token: Option<String>,
    /// Set by the controller, `None` for the target.
    pub session: Option<SessionOptions>,
}

impl Greeting {
    pub fn controller(options: SessionOptions) -> Self {
        Self {
            role: PeerRole::Controller,
            capabilities: Vec::new(),
            access_token: None,
            session: Some(options),
        }
    }

    pub fn target() -> Self {
        Self {
            role: PeerRole::Target,
            capabilities: Vec::new(),
            access_token: None,
            session: None,
        }
    }

    #[must_use]
    pub fn with_access_token(mut self, token: Option<String>) -> Self {
        self.access_token = token;
        self
    }

    #[must_use]
    pub fn with_capabilities(mut self, capabilities: Vec<String>) -> Self {
        self.capabilities = capabilities;
        self
    }
}

/// What was learned about the remote side.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerInfo {
    pub protocol_version: ProtocolVersion,
    pub role: PeerRole,
    pub capabilities: Vec<String>,
    pub session: Option<SessionOptions>,
}

impl PeerInfo {
    /// Session options stated by a controller peer.
    pub fn session_options(&self, peer: &str) -> Result<SessionOptions, NegotiationError> {
        self.session
            .ok_or_else(|| NegotiationError::MissingSessionOptions {
                peer: peer.to_string(),
            })
    }
}

/// Checks the listener applies to an incoming `Hello`.
#[derive(Debug, Clone, Default)]
pub struct AcceptPolicy {
    /// Token the connector must present. `None` disables the check.
    pub expected_token: Option<String>,
    /// Require the connector to state [`SessionOptions`].
    pub require_session_options: bool,
    /// Refuse because a session is already active.
    pub busy: bool,
}

/// Runs the connector side: send `Hello`, wait for the answer.
pub async fn initiate(
    transport: &mut HandshakeTransport,
    local: Greeting,
    timeout: Duration,
) -> Result<PeerInfo, NegotiationError> {
    let peer = transport.peer().to_string();

    let hello = Handshake::Hello {
        protocol_version: ProtocolVersion::CURRENT,
        role: local.role,
        capabilities: local.capabilities,
        access_token: local.access_token,
        session: local.session,
    };
    transport
        .send_timeout(hello, timeout)
        .await
        .map_err(|source| NegotiationError::Transport {
            peer: peer.clone(),
            source,
        })?;

    match read_frame(transport, &peer, timeout).await? {
        Handshake::Welcome {
            protocol_version,
            role,
            capabilities,
            session,
        } => {
            if !ProtocolVersion::CURRENT.is_compatible_with(&protocol_version) {
                return Err(NegotiationError::VersionMismatch {
                    peer,
                    local: ProtocolVersion::CURRENT,
                    remote: protocol_version,
                });
            }
            debug!(peer = %peer, version = %protocol_version, role = ?role, "Handshake accepted");
            Ok(PeerInfo {
                protocol_version,
                role,
                capabilities,
                session,
            })
        }
        Handshake::Rejected { reason, .. } if reason == BUSY_REASON => {
            debug!(peer = %peer, "Peer already has a session");
            Err(NegotiationError::SessionBusy { peer })
        }
        Handshake::Rejected { reason, .. } => {
            warn!(peer = %peer, reason = %reason, "Handshake rejected by peer");
            Err(NegotiationError::Rejected { peer, reason })
        }
        Handshake::Hello { .. } => Err(NegotiationError::Malformed {
            peer,
            reason: "expected welcome or rejected, got hello".to_string(),
        }),
    }
}

/// Runs the listener side: read `Hello`, validate it, answer.
///
/// On any validation failure a `Rejected` frame is sent (best effort) and
/// the error is returned; the caller drops the transport.
pub async fn accept(
    transport: &mut HandshakeTransport,
    local: Greeting,
    policy: &AcceptPolicy,
    timeout: Duration,
) -> Result<PeerInfo, NegotiationError> {
    accept_admitting(transport, local, policy, timeout, |_| Ok(()))
        .await
        .map(|(info, ())| info)
}

/// Like [`accept`], with a last admission step.
///
/// `admit` runs once the `Hello` passed every policy check and before
/// `Welcome` is written. Its error becomes the rejection. Whatever it
/// returns is handed back with the peer info, so a claim taken there (a
/// reserved session slot) is held across the reply and dropped on failure.
pub async fn accept_admitting<T, F>(
    transport: &mut HandshakeTransport,
    local: Greeting,
    policy: &AcceptPolicy,
    timeout: Duration,
    admit: F,
) -> Result<(PeerInfo, T), NegotiationError>
where
    F: FnOnce(&str) -> Result<T, NegotiationError>,
{
    let peer = transport.peer().to_string();

    let (protocol_version, role, capabilities, access_token, session) =
        match read_frame(transport, &peer, timeout).await? {
            Handshake::Hello {
                protocol_version,
                role,
                capabilities,
                access_token,
                session,
            } => (protocol_version, role, capabilities, access_token, session),
            _ => {
                let err = NegotiationError::Malformed {
                    peer,
                    reason: "first frame must be hello".to_string(),
                };
                reject(transport, "expected hello", timeout).await;
                return Err(err);
            }
        };

    let refusal = if !ProtocolVersion::CURRENT.is_compatible_with(&protocol_version) {
        Some(NegotiationError::VersionMismatch {
            peer: peer.clone(),
            local: ProtocolVersion::CURRENT,
            remote: protocol_version,
        })
    } else if let Some(expected) = policy.expected_token.as_deref() {
        match access_token.as_deref() {
            None => Some(NegotiationError::MissingToken { peer: peer.clone() }),
            Some(given) if given != expected => {
                Some(NegotiationError::TokenMismatch { peer: peer.clone() })
            }
            Some(_) => None,
        }
    } else {
        None
    };

    let refusal = refusal.or_else(|| {
        if policy.require_session_options && session.is_none() {
            Some(NegotiationError::MissingSessionOptions { peer: peer.clone() })
        } else if policy.busy {
            Some(NegotiationError::SessionBusy { peer: peer.clone() })
        } else {
            None
        }
    });

    let admitted = match refusal {
        Some(err) => Err(err),
        None => admit(&peer),
    };
    let admitted = match admitted {
        Ok(admitted) => admitted,
        Err(err) => {
            warn!(peer = %peer, error = %err, "Rejecting handshake");
            reject(transport, &rejection_reason(&err), timeout).await;
            return Err(err);
        }
    };

    let welcome = Handshake::Welcome {
        protocol_version: ProtocolVersion::CURRENT,
        role: local.role,
        capabilities: local.capabilities,
        session: local.session,
    };
    transport
        .send_timeout(welcome, timeout)
        .await
        .map_err(|source| NegotiationError::Transport {
            peer: peer.clone(),
            source,
        })?;

    debug!(peer = %peer, version = %protocol_version, role = ?role, "Handshake completed");
    let info = PeerInfo {
        protocol_version,
        role,
        capabilities,
        session,
    };
    Ok((info, admitted))
}

/// Sends `Rejected` and closes the write side. Failures are ignored; the
/// transport is being discarded anyway.
pub async fn reject(transport: &mut HandshakeTransport, reason: &str, timeout: Duration) {
    let frame = Handshake::Rejected {
        protocol_version: ProtocolVersion::CURRENT,
        reason: reason.to_string(),
    };
    if let Err(e) = transport.send_timeout(frame, timeout).await {
        debug!(peer = %transport.peer(), error = %e, "Could not deliver rejection");
    }
    transport.close().await;
}

/// Reason string sent on the wire for a refusal.
fn rejection_reason(err: &NegotiationError) -> String {
    match err {
        NegotiationError::MissingToken { .. } => "access token missing".to_string(),
        NegotiationError::TokenMismatch { .. } => "access token mismatch".to_string(),
        NegotiationError::SessionBusy { .. } => BUSY_REASON.to_string(),
        NegotiationError::MissingSessionOptions { .. } => {
            "session options missing exit_on_disconnect".to_string()
        }
        NegotiationError::VersionMismatch { local, remote, .. } => {
            format!("unsupported protocol version {remote}, expected {local}")
        }
        other => other.to_string(),
    }
}

async fn read_frame(
    transport: &mut HandshakeTransport,
    peer: &str,
    timeout: Duration,
) -> Result<Handshake, NegotiationError> {
    let frame = transport
        .recv_timeout(timeout)
        .await
        .map_err(|_| NegotiationError::Timeout {
            phase: NegotiationPhase::Handshake,
            peer: peer.to_string(),
            after: timeout,
        })?;

    match frame {
        None => Err(NegotiationError::Closed {
            peer: peer.to_string(),
            phase: NegotiationPhase::Handshake,
        }),
        Some(Err(source)) => Err(NegotiationError::Transport {
            peer: peer.to_string(),
            source,
        }),
        Some(Ok(Inbound::Malformed { reason, .. })) => Err(NegotiationError::Malformed {
            peer: peer.to_string(),
            reason,
        }),
        Some(Ok(Inbound::Message(msg))) => Ok(msg),
    }
}
