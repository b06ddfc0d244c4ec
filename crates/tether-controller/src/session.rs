//! Controller end of a bound session.
//!
//! A [`ControllerSession`] owns the write half of the transport and a reader
//! task that owns the read half. Commands get a fresh `seq`; the reader
//! routes each response to the waiter registered under its `request_seq`
//! and fans events out over a broadcast channel.
//!
//! ```text
//!   request() ──seq──▶ sink ──────────▶ target
//!       ▲                                 │
//!       │ oneshot (pending[seq])          │
//!   reader task ◀─────── stream ◀─────────┘
//!       │
//!       └──▶ broadcast<TargetEvent> ──▶ wait_for_stop() / subscribe()
//! ```
//!
//! # Panic-Free Guarantees
//!
//! - No `.unwrap()`, `.expect()`, `panic!()` in this module
//! - A closed transport fails pending requests with `Disconnected`

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use tokio::sync::{broadcast, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use tether_core::{FrameId, SourceLocation, StackFrame, StopEvent, ThreadId, ThreadInfo};
use tether_protocol::handshake::PeerInfo;
use tether_protocol::{
    Command, ControllerMessage, ControllerTransport, Inbound, Response, ResponseBody,
    TargetEvent, TargetMessage, TransportSink, TransportStream,
};

use crate::error::{ControllerError, ErrorCodeDisplay, Result};

// ============================================================================
// Constants
// ============================================================================

/// Events buffered per subscriber before it lags
const EVENT_BUFFER: usize = 256;

type Pending = Arc<Mutex<HashMap<u64, oneshot::Sender<Response>>>>;

fn lock(pending: &Pending) -> MutexGuard<'_, HashMap<u64, oneshot::Sender<Response>>> {
    pending.lock().unwrap_or_else(PoisonError::into_inner)
}

// ============================================================================
// ControllerSession
// ============================================================================

/// A live session with one target.
pub struct ControllerSession {
    peer: SocketAddr,
    capabilities: Vec<String>,
    sink: tokio::sync::Mutex<TransportSink<TargetMessage, ControllerMessage>>,
    next_seq: AtomicU64,
    pending: Pending,
    events: broadcast::Sender<TargetEvent>,
    /// Subscribed before the reader starts, so no event is missed.
    primary: tokio::sync::Mutex<broadcast::Receiver<TargetEvent>>,
    closed: CancellationToken,
    request_timeout: Duration,
}

impl ControllerSession {
    /// Wraps a transport whose handshake has completed and starts the
    /// reader task.
    pub fn new(transport: ControllerTransport, info: PeerInfo, request_timeout: Duration) -> Self {
        let peer = transport.peer();
        let (sink, stream) = transport.into_split();
        let (events, primary) = broadcast::channel(EVENT_BUFFER);
        let pending: Pending = Arc::new(Mutex::new(HashMap::new()));
        let closed = CancellationToken::new();

        tokio::spawn(read_loop(
            peer,
            stream,
            Arc::clone(&pending),
            events.clone(),
            closed.clone(),
        ));

        info!(peer = %peer, version = %info.protocol_version, "Session bound");
        Self {
            peer,
            capabilities: info.capabilities,
            sink: tokio::sync::Mutex::new(sink),
            next_seq: AtomicU64::new(1),
            pending,
            events,
            primary: tokio::sync::Mutex::new(primary),
            closed,
            request_timeout,
        }
    }

    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    /// Capabilities the target announced in its handshake.
    pub fn capabilities(&self) -> &[String] {
        &self.capabilities
    }

    pub fn is_closed(&self) -> bool {
        self.closed.is_cancelled()
    }

    /// Resolves once the transport is gone.
    pub async fn closed(&self) {
        self.closed.cancelled().await;
    }

    /// Independent event stream starting now.
    pub fn subscribe(&self) -> broadcast::Receiver<TargetEvent> {
        self.events.subscribe()
    }

    /// Sends `command` and waits for its response.
    ///
    /// # Errors
    ///
    /// - `CommandFailed` when the target answers with a failure
    /// - `Timeout` when no answer arrives within the request timeout
    /// - `Disconnected` when the transport closes first
    pub async fn request(&self, command: Command) -> Result<ResponseBody> {
        let name = command.name();
        let seq = self.next_seq.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        lock(&self.pending).insert(seq, tx);
        // The reader marks the session closed before it drains `pending`,
        // so a waiter inserted after the drain is caught here.
        if self.is_closed() {
            lock(&self.pending).remove(&seq);
            return Err(ControllerError::Disconnected);
        }

        let sent = {
            let mut sink = self.sink.lock().await;
            tokio::time::timeout(
                self.request_timeout,
                sink.send(ControllerMessage::new(seq, command)),
            )
            .await
        };
        match sent {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                lock(&self.pending).remove(&seq);
                debug!(peer = %self.peer, seq, error = %e, "Send failed");
                return Err(ControllerError::Disconnected);
            }
            Err(_) => {
                lock(&self.pending).remove(&seq);
                return Err(ControllerError::Timeout {
                    what: name.to_string(),
                    after: self.request_timeout,
                });
            }
        }

        match tokio::time::timeout(self.request_timeout, rx).await {
            Ok(Ok(response)) => into_body(response),
            Ok(Err(_)) => Err(ControllerError::Disconnected),
            Err(_) => {
                lock(&self.pending).remove(&seq);
                Err(ControllerError::Timeout {
                    what: name.to_string(),
                    after: self.request_timeout,
                })
            }
        }
    }

    // ========================================================================
    // Typed commands
    // ========================================================================

    pub async fn ping(&self) -> Result<()> {
        match self.request(Command::Ping).await? {
            ResponseBody::Pong => Ok(()),
            _ => Err(unexpected("ping")),
        }
    }

    /// Requests a halt of `thread_id`, or of a thread the target picks.
    pub async fn pause(&self, thread_id: Option<ThreadId>) -> Result<()> {
        self.request(Command::Pause { thread_id }).await.map(drop)
    }

    /// Resumes every thread.
    pub async fn resume(&self) -> Result<()> {
        self.request(Command::Continue).await.map(drop)
    }

    pub async fn step(&self, thread_id: ThreadId) -> Result<()> {
        self.request(Command::Step { thread_id }).await.map(drop)
    }

    pub async fn add_breakpoint(&self, location: SourceLocation) -> Result<()> {
        self.request(Command::AddBreakpoint { location }).await.map(drop)
    }

    pub async fn remove_breakpoint(&self, location: SourceLocation) -> Result<()> {
        self.request(Command::RemoveBreakpoint { location })
            .await
            .map(drop)
    }

    pub async fn clear_breakpoints(&self) -> Result<()> {
        self.request(Command::RemoveAllBreakpoints).await.map(drop)
    }

    /// Replaces the breakpoints of `source`; returns the full set after the
    /// change.
    pub async fn set_breakpoints(
        &self,
        source: impl Into<String>,
        lines: Vec<u32>,
    ) -> Result<Vec<SourceLocation>> {
        let command = Command::SetBreakpoints {
            source: source.into(),
            lines,
        };
        match self.request(command).await? {
            ResponseBody::Breakpoints { breakpoints } => Ok(breakpoints),
            ResponseBody::Ack => self.breakpoints().await,
            _ => Err(unexpected("set_breakpoints")),
        }
    }

    pub async fn breakpoints(&self) -> Result<Vec<SourceLocation>> {
        match self.request(Command::ListBreakpoints).await? {
            ResponseBody::Breakpoints { breakpoints } => Ok(breakpoints),
            _ => Err(unexpected("list_breakpoints")),
        }
    }

    /// Assigns `value` to `expression` in a stopped frame; returns the
    /// value the target reports back.
    pub async fn set_expression(
        &self,
        thread_id: ThreadId,
        frame_id: FrameId,
        expression: impl Into<String>,
        value: impl Into<String>,
    ) -> Result<String> {
        let command = Command::SetExpression {
            thread_id,
            frame_id,
            expression: expression.into(),
            value: value.into(),
        };
        match self.request(command).await? {
            ResponseBody::Expression { value } => Ok(value),
            _ => Err(unexpected("set_expression")),
        }
    }

    pub async fn threads(&self) -> Result<Vec<ThreadInfo>> {
        match self.request(Command::Threads).await? {
            ResponseBody::Threads { threads } => Ok(threads),
            _ => Err(unexpected("threads")),
        }
    }

    pub async fn stack_trace(&self, thread_id: ThreadId) -> Result<Vec<StackFrame>> {
        match self.request(Command::StackTrace { thread_id }).await? {
            ResponseBody::StackTrace { frames } => Ok(frames),
            _ => Err(unexpected("stack_trace")),
        }
    }

    /// Ends the session.
    ///
    /// `terminate` overrides the exit-on-disconnect option stated in the
    /// handshake; `suspend` leaves the target halted.
    pub async fn disconnect(&self, terminate: Option<bool>, suspend: bool) -> Result<()> {
        let result = self
            .request(Command::Disconnect { terminate, suspend })
            .await
            .map(drop);
        self.close().await;
        result
    }

    /// Closes the write half and stops the reader without a `disconnect`
    /// command. The target sees a transport loss.
    pub async fn close(&self) {
        let mut sink = self.sink.lock().await;
        if let Err(e) = sink.close().await {
            debug!(peer = %self.peer, error = %e, "Close failed");
        }
        self.closed.cancel();
    }

    // ========================================================================
    // Events
    // ========================================================================

    /// Next event on the primary stream, or `None` after `timeout` or once
    /// the session closed.
    pub async fn next_event(&self, timeout: Duration) -> Option<TargetEvent> {
        let mut primary = self.primary.lock().await;
        let wait = async {
            loop {
                tokio::select! {
                    biased;
                    received = primary.recv() => match received {
                        Ok(event) => return Some(event),
                        Err(broadcast::error::RecvError::Lagged(skipped)) => {
                            warn!(peer = %self.peer, skipped, "Event stream lagged");
                        }
                        Err(broadcast::error::RecvError::Closed) => return None,
                    },
                    _ = self.closed.cancelled() => return None,
                }
            }
        };
        tokio::time::timeout(timeout, wait).await.ok().flatten()
    }

    /// Waits for the next `stopped` event, skipping everything else on the
    /// primary stream.
    ///
    /// # Errors
    ///
    /// - `Timeout` if no stop arrives in time
    /// - `Disconnected` if the session closes or the target exits first
    pub async fn wait_for_stop(&self, timeout: Duration) -> Result<StopEvent> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
            if remaining.is_zero() {
                return Err(ControllerError::Timeout {
                    what: "wait for stop".to_string(),
                    after: timeout,
                });
            }
            match self.next_event(remaining).await {
                Some(TargetEvent::Stopped(stop)) => return Ok(stop),
                Some(TargetEvent::Exited { exit_code }) => {
                    debug!(peer = %self.peer, exit_code, "Target exited while waiting for a stop");
                    return Err(ControllerError::Disconnected);
                }
                Some(_) => continue,
                None if self.is_closed() => return Err(ControllerError::Disconnected),
                None => {
                    return Err(ControllerError::Timeout {
                        what: "wait for stop".to_string(),
                        after: timeout,
                    })
                }
            }
        }
    }
}

impl Drop for ControllerSession {
    fn drop(&mut self) {
        self.closed.cancel();
    }
}

impl std::fmt::Debug for ControllerSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ControllerSession")
            .field("peer", &self.peer)
            .field("closed", &self.is_closed())
            .field("pending", &lock(&self.pending).len())
            .finish()
    }
}

// ============================================================================
// Reader
// ============================================================================

async fn read_loop(
    peer: SocketAddr,
    mut stream: TransportStream<TargetMessage, ControllerMessage>,
    pending: Pending,
    events: broadcast::Sender<TargetEvent>,
    closed: CancellationToken,
) {
    loop {
        let frame = tokio::select! {
            _ = closed.cancelled() => break,
            frame = stream.next() => frame,
        };
        match frame {
            Some(Ok(Inbound::Message(TargetMessage::Response(response)))) => {
                let waiter = lock(&pending).remove(&response.request_seq);
                match waiter {
                    Some(tx) => {
                        let _ = tx.send(response);
                    }
                    None => warn!(
                        peer = %peer,
                        request_seq = response.request_seq,
                        command = %response.command,
                        "Response for unknown request"
                    ),
                }
            }
            Some(Ok(Inbound::Message(TargetMessage::Event(event)))) => {
                // No subscribers is fine
                let _ = events.send(event);
            }
            Some(Ok(Inbound::Malformed { reason, .. })) => {
                warn!(peer = %peer, reason = %reason, "Malformed frame from target");
            }
            Some(Err(e)) => {
                warn!(peer = %peer, error = %e, "Transport error");
                break;
            }
            None => {
                debug!(peer = %peer, "Target closed the transport");
                break;
            }
        }
    }
    closed.cancel();
    // Dropping the senders fails every waiter with Disconnected.
    lock(&pending).clear();
}

fn into_body(response: Response) -> Result<ResponseBody> {
    if response.success {
        Ok(response.body.unwrap_or(ResponseBody::Ack))
    } else {
        Err(ControllerError::CommandFailed {
            command: response.command,
            code: ErrorCodeDisplay(response.error_code),
            message: response.message.unwrap_or_default(),
        })
    }
}

fn unexpected(command: &str) -> ControllerError {
    ControllerError::UnexpectedResponse {
        command: command.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tether_protocol::{ErrorCode, PeerRole, ProtocolVersion, Transport, TransportRole};
    use tokio::net::{TcpListener, TcpStream};

    async fn session_with_vanishing_target(request_timeout: Duration) -> ControllerSession {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (dialed, accepted) = tokio::join!(TcpStream::connect(addr), listener.accept());
        drop(accepted.unwrap());

        let transport: ControllerTransport =
            Transport::new(dialed.unwrap(), TransportRole::Connector).unwrap();
        let info = PeerInfo {
            protocol_version: ProtocolVersion::CURRENT,
            role: PeerRole::Target,
            capabilities: Vec::new(),
            session: None,
        };
        ControllerSession::new(transport, info, request_timeout)
    }

    #[tokio::test]
    async fn test_requests_racing_transport_loss_report_disconnected() {
        let session = Arc::new(session_with_vanishing_target(Duration::from_secs(30)).await);

        let requests: Vec<_> = (0..32)
            .map(|_| {
                let session = Arc::clone(&session);
                tokio::spawn(async move { session.ping().await })
            })
            .collect();
        for request in requests {
            let result = tokio::time::timeout(Duration::from_secs(5), request)
                .await
                .expect("request waited for its timeout")
                .unwrap();
            assert!(matches!(result, Err(ControllerError::Disconnected)));
        }

        tokio::time::timeout(Duration::from_secs(5), session.closed())
            .await
            .unwrap();
        assert!(matches!(session.ping().await, Err(ControllerError::Disconnected)));
        assert_eq!(lock(&session.pending).len(), 0);
    }

    #[test]
    fn test_failure_response_maps_to_command_failed() {
        let response = Response::failure(3, "step", ErrorCode::WrongState, "not stopped");
        match into_body(response) {
            Err(ControllerError::CommandFailed { command, code, message }) => {
                assert_eq!(command, "step");
                assert_eq!(code.0, Some(ErrorCode::WrongState));
                assert_eq!(message, "not stopped");
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_success_without_body_is_ack() {
        let mut response = Response::ok(1, "continue", ResponseBody::Ack);
        response.body = None;
        assert_eq!(into_body(response).unwrap(), ResponseBody::Ack);
    }
}
