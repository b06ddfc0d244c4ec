//! Framed TCP transport between a controller and a target.
//!
//! A transport starts life speaking [`Handshake`](crate::Handshake) frames and
//! is re-typed to session messages with [`Transport::retype`] once the
//! handshake succeeds. Bytes already buffered are kept across the switch.

use std::fmt;
use std::net::SocketAddr;
use std::time::Duration;

use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::net::TcpStream;
use tokio_util::codec::Framed;

use crate::codec::{CodecError, Inbound, MessageCodec};

/// Which side opened the server endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportRole {
    /// Accepted the connection.
    Listener,
    /// Dialed the connection.
    Connector,
}

impl fmt::Display for TransportRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Listener => f.write_str("listener"),
            Self::Connector => f.write_str("connector"),
        }
    }
}

type FramedStream<In, Out> = Framed<TcpStream, MessageCodec<In, Out>>;

/// Write half after [`Transport::into_split`].
pub type TransportSink<In, Out> = SplitSink<FramedStream<In, Out>, Out>;

/// Read half after [`Transport::into_split`].
pub type TransportStream<In, Out> = SplitStream<FramedStream<In, Out>>;

/// A connected, framed, typed byte stream.
pub struct Transport<In, Out> {
    framed: FramedStream<In, Out>,
    role: TransportRole,
    peer: SocketAddr,
}

impl<In, Out> Transport<In, Out>
where
    In: DeserializeOwned,
    Out: Serialize,
{
    /// Wraps an established TCP stream.
    pub fn new(stream: TcpStream, role: TransportRole) -> Result<Self, CodecError> {
        let peer = stream.peer_addr()?;
        // Small request/response frames; waiting for Nagle only adds latency.
        stream.set_nodelay(true)?;
        Ok(Self {
            framed: Framed::new(stream, MessageCodec::new()),
            role,
            peer,
        })
    }

    pub fn role(&self) -> TransportRole {
        self.role
    }

    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    /// Sends one message and flushes it.
    pub async fn send(&mut self, msg: Out) -> Result<(), CodecError> {
        self.framed.send(msg).await
    }

    /// Sends one message, failing with [`CodecError::WriteTimeout`] if the
    /// peer does not drain it in time.
    pub async fn send_timeout(&mut self, msg: Out, limit: Duration) -> Result<(), CodecError> {
        match tokio::time::timeout(limit, self.framed.send(msg)).await {
            Ok(result) => result,
            Err(_) => Err(CodecError::WriteTimeout),
        }
    }

    /// Next inbound frame, or `None` once the peer closed the stream.
    pub async fn recv(&mut self) -> Option<Result<Inbound<In>, CodecError>> {
        self.framed.next().await
    }

    /// Like [`recv`](Self::recv) but gives up after `limit`.
    pub async fn recv_timeout(
        &mut self,
        limit: Duration,
    ) -> Result<Option<Result<Inbound<In>, CodecError>>, tokio::time::error::Elapsed> {
        tokio::time::timeout(limit, self.framed.next()).await
    }

    /// Switches the message types carried by this transport.
    pub fn retype<In2, Out2>(self) -> Transport<In2, Out2>
    where
        In2: DeserializeOwned,
        Out2: Serialize,
    {
        Transport {
            framed: self.framed.map_codec(|_| MessageCodec::new()),
            role: self.role,
            peer: self.peer,
        }
    }

    /// Splits into independently owned write and read halves.
    pub fn into_split(self) -> (TransportSink<In, Out>, TransportStream<In, Out>) {
        self.framed.split()
    }

    /// Flushes and shuts down the write side. Errors are ignored; the peer
    /// may already be gone.
    pub async fn close(&mut self) {
        let _ = SinkExt::<Out>::close(&mut self.framed).await;
    }
}

impl<In, Out> fmt::Debug for Transport<In, Out> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Transport")
            .field("role", &self.role)
            .field("peer", &self.peer)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::{Command, ControllerMessage, Response, ResponseBody, TargetMessage};
    use tokio::net::TcpListener;

    async fn pair() -> (
        Transport<ControllerMessage, TargetMessage>,
        Transport<TargetMessage, ControllerMessage>,
    ) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (dialed, accepted) = tokio::join!(TcpStream::connect(addr), listener.accept());
        let target = Transport::new(accepted.unwrap().0, TransportRole::Listener).unwrap();
        let controller = Transport::new(dialed.unwrap(), TransportRole::Connector).unwrap();
        (target, controller)
    }

    #[tokio::test]
    async fn test_request_response_over_tcp() {
        let (mut target, mut controller) = pair().await;

        controller
            .send(ControllerMessage::new(1, Command::Ping))
            .await
            .unwrap();

        let received = target.recv().await.unwrap().unwrap();
        assert_eq!(
            received,
            Inbound::Message(ControllerMessage::new(1, Command::Ping))
        );

        target
            .send(Response::ok(1, "ping", ResponseBody::Pong).into())
            .await
            .unwrap();
        match controller.recv().await.unwrap().unwrap() {
            Inbound::Message(TargetMessage::Response(r)) => {
                assert_eq!(r.request_seq, 1);
                assert!(r.success);
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_recv_sees_close() {
        let (mut target, mut controller) = pair().await;
        controller.close().await;
        drop(controller);
        assert!(target.recv().await.is_none());
    }

    #[tokio::test]
    async fn test_recv_timeout_elapses() {
        let (mut target, _controller) = pair().await;
        let result = target.recv_timeout(Duration::from_millis(20)).await;
        assert!(result.is_err());
    }
}
