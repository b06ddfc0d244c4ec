//! Establishing sessions from the controller's side.
//!
//! - [`connect`]: dial a target that is listening, retrying with
//!   exponential backoff on transient failures
//! - [`ControllerListener`]: wait for a target that dials in (connect
//!   mode), checking its access token

use std::net::SocketAddr;

use tokio::net::TcpListener;
use tokio::time::{sleep, Duration};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use tether_core::{Address, SessionOptions};
use tether_protocol::handshake::{self, AcceptPolicy, Greeting, HandshakeTransport};
use tether_protocol::{NegotiationError, Transport, TransportRole};
use tether_target::negotiate;

use crate::config::ControllerConfig;
use crate::error::{ControllerError, Result};
use crate::session::ControllerSession;

// ============================================================================
// Connect (target listens)
// ============================================================================

/// Dials `address` once and runs the connector side of the handshake.
pub async fn connect_once(address: &Address, config: &ControllerConfig) -> Result<ControllerSession> {
    let options = config.session_options()?;
    let endpoint = address.to_endpoint();
    let stream = negotiate::connect_stream(&endpoint, config.connect_timeout()).await?;
    let mut transport: HandshakeTransport = Transport::new(stream, TransportRole::Connector)
        .map_err(|source| NegotiationError::Transport {
            peer: endpoint.clone(),
            source,
        })?;

    let greeting = Greeting::controller(options);
    let info = handshake::initiate(&mut transport, greeting, config.handshake_timeout()).await?;
    Ok(ControllerSession::new(
        transport.retype(),
        info,
        config.request_timeout(),
    ))
}

/// Dials the configured address, retrying transient failures.
pub async fn connect(config: &ControllerConfig) -> Result<ControllerSession> {
    connect_with_retry(&config.address(), config, &CancellationToken::new()).await
}

/// Dials `address` until it answers, the attempts run out, or `cancel`
/// fires.
///
/// Only failures for which retrying can help are retried (refused
/// connection, timeout, target busy with another session). Rejections and
/// version mismatches return immediately.
pub async fn connect_with_retry(
    address: &Address,
    config: &ControllerConfig,
    cancel: &CancellationToken,
) -> Result<ControllerSession> {
    let mut delay = config.retry_initial_delay();
    let max_delay = config.retry_max_delay();
    let max_attempts = config.max_attempts.max(1);
    let mut attempt: u32 = 0;

    loop {
        attempt = attempt.saturating_add(1);
        match connect_once(address, config).await {
            Ok(session) => {
                if attempt > 1 {
                    info!(address = %address, attempt, "Connected after retry");
                }
                return Ok(session);
            }
            Err(ControllerError::Negotiation(e)) if e.is_retryable() && attempt < max_attempts => {
                warn!(
                    address = %address,
                    attempt,
                    error = %e,
                    retry_in_ms = delay.as_millis() as u64,
                    "Connect failed, retrying"
                );
            }
            Err(e) => return Err(e),
        }

        tokio::select! {
            _ = sleep(delay) => {
                delay = Duration::from_millis(
                    (delay.as_millis() as f64 * config.retry_multiplier) as u64,
                )
                .min(max_delay);
            }
            _ = cancel.cancelled() => {
                debug!(address = %address, "Connect cancelled");
                return Err(ControllerError::Disconnected);
            }
        }
    }
}

// ============================================================================
// Listen (target connects)
// ============================================================================

/// Accepts targets dialing in.
#[derive(Debug)]
pub struct ControllerListener {
    listener: TcpListener,
    options: SessionOptions,
    config: ControllerConfig,
}

impl ControllerListener {
    /// Binds the configured address. Port 0 picks an ephemeral port.
    pub async fn bind(config: ControllerConfig) -> Result<Self> {
        let options = config.session_options()?;
        let listener = negotiate::bind(&config.address()).await?;
        Ok(Self {
            listener,
            options,
            config,
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// Accepts one target and handshakes with it.
    ///
    /// A target presenting a missing or wrong token is rejected and the
    /// error returned; no session exists afterwards.
    pub async fn accept(&self) -> Result<ControllerSession> {
        let stream = negotiate::accept(&self.listener).await?;
        let mut transport: HandshakeTransport = Transport::new(stream, TransportRole::Listener)
            .map_err(|source| NegotiationError::Transport {
                peer: "<unknown>".to_string(),
                source,
            })?;
        let peer = transport.peer();

        let policy = AcceptPolicy {
            expected_token: self.config.access_token.clone(),
            require_session_options: false,
            busy: false,
        };
        let greeting = Greeting::controller(self.options);
        let info = handshake::accept(
            &mut transport,
            greeting,
            &policy,
            self.config.handshake_timeout(),
        )
        .await?;

        info!(peer = %peer, "Target connected");
        Ok(ControllerSession::new(
            transport.retype(),
            info,
            self.config.request_timeout(),
        ))
    }

    /// Like [`accept`](Self::accept), but skips targets that fail the
    /// handshake and keeps waiting.
    pub async fn accept_authorized(&self) -> Result<ControllerSession> {
        loop {
            match self.accept().await {
                Ok(session) => return Ok(session),
                Err(ControllerError::Negotiation(e)) if !matches!(e, NegotiationError::Accept { .. }) => {
                    warn!(error = %e, "Target handshake failed, still listening");
                }
                Err(e) => return Err(e),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_refused_connect_is_not_retried_past_limit() {
        // Grab a free port and release it so nothing listens there.
        let port = {
            let probe = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
            probe.local_addr().unwrap().port()
        };
        let config = ControllerConfig {
            port,
            max_attempts: 2,
            retry_initial_delay_ms: 1,
            ..ControllerConfig::default()
        }
        .with_exit_on_disconnect(false);
        let err = connect(&config).await.unwrap_err();
        assert!(matches!(
            err,
            ControllerError::Negotiation(NegotiationError::Connect { .. })
        ));
    }

    #[tokio::test]
    async fn test_cancelled_retry_stops() {
        let port = {
            let probe = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
            probe.local_addr().unwrap().port()
        };
        let config = ControllerConfig {
            port,
            max_attempts: u32::MAX,
            retry_initial_delay_ms: 10_000,
            ..ControllerConfig::default()
        }
        .with_exit_on_disconnect(false);
        let cancel = CancellationToken::new();
        let canceller = cancel.clone();
        tokio::spawn(async move {
            sleep(Duration::from_millis(50)).await;
            canceller.cancel();
        });
        let err = connect_with_retry(&config.address(), &config, &cancel)
            .await
            .unwrap_err();
        assert!(matches!(err, ControllerError::Disconnected));
    }

    #[tokio::test]
    async fn test_unstated_exit_policy_fails_before_dialing() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let config = ControllerConfig {
            port: listener.local_addr().unwrap().port(),
            ..ControllerConfig::default()
        };
        listener.set_nonblocking(true).unwrap();

        let err = connect(&config).await.unwrap_err();
        assert!(matches!(
            err,
            ControllerError::Unset { option: "exit_on_disconnect" }
        ));
        // Nothing was dialed.
        assert!(listener.accept().is_err());

        let err = ControllerListener::bind(ControllerConfig {
            port: 0,
            ..ControllerConfig::default()
        })
        .await
        .unwrap_err();
        assert!(matches!(err, ControllerError::Unset { .. }));
    }
}
