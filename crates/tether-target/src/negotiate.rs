//! Transport negotiation from the target's side.
//!
//! - listen mode: bind, then accept controllers, each handshake on its own task
//! - connect mode: dial a listening controller and present the access token
//!
//! Either way the result is a session transport plus the controller's
//! [`SessionOptions`], or a [`NegotiationError`] naming the phase and peer.
//! A failed negotiation only drops its transport.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::net::{lookup_host, TcpListener, TcpStream};
use tracing::{debug, info, warn};

use tether_core::{Address, SessionOptions};
use tether_protocol::handshake::{self, AcceptPolicy, Greeting, HandshakeTransport};
use tether_protocol::{
    NegotiationError, NegotiationPhase, TargetTransport, Transport, TransportRole,
};

use crate::attach::{AttachError, AttachState, SlotReservation};

/// Handshake and connect time limits (10 s)
const DEFAULT_TIMEOUT: Duration = Duration::from_secs(10);

/// Tunables for negotiation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NegotiationOptions {
    /// Bound on every handshake read and write.
    pub handshake_timeout: Duration,
    /// Bound on dialing a controller in connect mode.
    pub connect_timeout: Duration,
    /// Capabilities announced in the handshake.
    pub capabilities: Vec<String>,
}

impl Default for NegotiationOptions {
    fn default() -> Self {
        Self {
            handshake_timeout: DEFAULT_TIMEOUT,
            connect_timeout: DEFAULT_TIMEOUT,
            capabilities: vec![
                "breakpoints".to_string(),
                "pause".to_string(),
                "step".to_string(),
                "set_expression".to_string(),
            ],
        }
    }
}

/// A negotiated transport, ready for a session.
#[derive(Debug)]
pub struct Negotiated {
    pub transport: TargetTransport,
    pub options: SessionOptions,
    pub peer: SocketAddr,
}

/// Binds the listen-mode endpoint. Port 0 picks an ephemeral port.
pub async fn bind(address: &Address) -> Result<TcpListener, NegotiationError> {
    let endpoint = address.to_endpoint();
    let listener = TcpListener::bind(&endpoint)
        .await
        .map_err(|source| NegotiationError::Bind {
            address: endpoint.clone(),
            source,
        })?;
    if let Ok(local) = listener.local_addr() {
        info!(address = %local, "Listening for controllers");
    }
    Ok(listener)
}

/// Accepts one TCP connection.
pub async fn accept(listener: &TcpListener) -> Result<TcpStream, NegotiationError> {
    let (stream, peer) = listener.accept().await.map_err(|source| {
        let address = listener
            .local_addr()
            .map(|a| a.to_string())
            .unwrap_or_else(|_| "<unbound>".to_string());
        NegotiationError::Accept { address, source }
    })?;
    debug!(peer = %peer, "Controller connection accepted");
    Ok(stream)
}

/// Runs the listener side of the handshake on an accepted connection.
///
/// The session slot is reserved after the `Hello` checks and before
/// `Welcome` goes out, so a controller that is welcomed always gets the
/// slot. A busy target answers with a rejection instead of a silent close.
pub async fn handshake_incoming(
    stream: TcpStream,
    options: &NegotiationOptions,
    state: &Arc<AttachState>,
) -> Result<(Negotiated, SlotReservation), NegotiationError> {
    let mut transport: HandshakeTransport = Transport::new(stream, TransportRole::Listener)
        .map_err(|source| NegotiationError::Transport {
            peer: "<unknown>".to_string(),
            source,
        })?;
    let peer = transport.peer();

    let policy = AcceptPolicy {
        expected_token: None,
        require_session_options: true,
        busy: false,
    };
    let greeting = Greeting::target().with_capabilities(options.capabilities.clone());
    let (info, reservation) = handshake::accept_admitting(
        &mut transport,
        greeting,
        &policy,
        options.handshake_timeout,
        |peer| state.reserve_session().map_err(|e| slot_error(e, peer)),
    )
    .await?;
    let session_options = info.session_options(&peer.to_string())?;

    info!(peer = %peer, exit_on_disconnect = session_options.exit_on_disconnect, "Controller handshake completed");
    let negotiated = Negotiated {
        transport: transport.retype(),
        options: session_options,
        peer,
    };
    Ok((negotiated, reservation))
}

/// Negotiation failure for a session slot that could not be taken.
pub fn slot_error(err: AttachError, peer: &str) -> NegotiationError {
    match err {
        AttachError::SessionBusy { .. } | AttachError::Reserved => NegotiationError::SessionBusy {
            peer: peer.to_string(),
        },
        _ => NegotiationError::TargetTerminated,
    }
}

/// Dials a listening controller and runs the connector side of the
/// handshake, presenting `access_token` when set.
pub async fn dial(
    address: &Address,
    access_token: Option<&str>,
    options: &NegotiationOptions,
) -> Result<Negotiated, NegotiationError> {
    let endpoint = address.to_endpoint();
    let stream = connect_stream(&endpoint, options.connect_timeout).await?;

    let mut transport: HandshakeTransport = Transport::new(stream, TransportRole::Connector)
        .map_err(|source| NegotiationError::Transport {
            peer: endpoint.clone(),
            source,
        })?;
    let peer = transport.peer();

    let greeting = Greeting::target()
        .with_capabilities(options.capabilities.clone())
        .with_access_token(access_token.map(str::to_string));
    let info = handshake::initiate(&mut transport, greeting, options.handshake_timeout).await?;

    let session_options = match info.session_options(&peer.to_string()) {
        Ok(opts) => opts,
        Err(e) => {
            warn!(peer = %peer, error = %e, "Controller welcome lacked session options");
            transport.close().await;
            return Err(e);
        }
    };

    info!(peer = %peer, exit_on_disconnect = session_options.exit_on_disconnect, "Connected to controller");
    Ok(Negotiated {
        transport: transport.retype(),
        options: session_options,
        peer,
    })
}

/// Resolves `endpoint` and connects to the first address that answers.
pub async fn connect_stream(endpoint: &str, limit: Duration) -> Result<TcpStream, NegotiationError> {
    let attempt = async {
        let mut last_err = None;
        for addr in lookup_host(endpoint).await? {
            match TcpStream::connect(addr).await {
                Ok(stream) => return Ok(stream),
                Err(e) => last_err = Some(e),
            }
        }
        Err::<TcpStream, std::io::Error>(last_err.unwrap_or_else(|| {
            std::io::Error::new(std::io::ErrorKind::NotFound, "address resolved to nothing")
        }))
    };

    match tokio::time::timeout(limit, attempt).await {
        Ok(Ok(stream)) => Ok(stream),
        Ok(Err(source)) => Err(NegotiationError::Connect {
            address: endpoint.to_string(),
            source,
        }),
        Err(_) => Err(NegotiationError::Timeout {
            phase: NegotiationPhase::Connect,
            peer: endpoint.to_string(),
            after: limit,
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_bind_ephemeral_port() {
        let listener = bind(&Address::localhost(0)).await.unwrap();
        assert_ne!(listener.local_addr().unwrap().port(), 0);
    }

    #[tokio::test]
    async fn test_bind_in_use_names_address() {
        let first = bind(&Address::localhost(0)).await.unwrap();
        let port = first.local_addr().unwrap().port();
        let err = bind(&Address::localhost(port)).await.unwrap_err();
        assert!(err.to_string().contains(&format!("127.0.0.1:{port}")));
    }

    #[tokio::test]
    async fn test_dial_nobody_fails_with_connect_error() {
        let port = {
            let l = bind(&Address::localhost(0)).await.unwrap();
            l.local_addr().unwrap().port()
        };
        let options = NegotiationOptions {
            connect_timeout: Duration::from_secs(2),
            ..NegotiationOptions::default()
        };
        let err = dial(&Address::localhost(port), None, &options)
            .await
            .unwrap_err();
        assert!(matches!(err, NegotiationError::Connect { .. }));
    }
}
