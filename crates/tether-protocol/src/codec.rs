//! Length-prefixed JSON framing.
//!
//! Each frame is a 4-byte big-endian length followed by one UTF-8 JSON
//! document. A frame that is well-formed but does not decode into the
//! expected message type is surfaced as [`Inbound::Malformed`] instead of an
//! error, so one bad command does not tear down the session.

use std::io;
use std::marker::PhantomData;

use bytes::{Bytes, BytesMut};
use serde::de::DeserializeOwned;
use serde::Serialize;
use thiserror::Error;
use tokio_util::codec::{Decoder, Encoder, LengthDelimitedCodec};

/// Largest frame either side accepts or produces (1 MiB).
pub const MAX_FRAME_LENGTH: usize = 1024 * 1024;

/// Errors from the framing layer. All of them end the transport.
#[derive(Error, Debug)]
pub enum CodecError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("failed to encode message: {0}")]
    Encode(#[from] serde_json::Error),

    #[error("frame of {len} bytes exceeds the {max} byte limit")]
    FrameTooLarge { len: usize, max: usize },

    #[error("write timed out")]
    WriteTimeout,
}

/// One decoded frame.
#[derive(Debug, Clone, PartialEq)]
pub enum Inbound<T> {
    /// Frame decoded into the expected type.
    Message(T),

    /// Frame was valid JSON framing but not a valid message.
    Malformed {
        /// `seq` recovered from the raw document, when it had one.
        seq: Option<u64>,
        reason: String,
    },
}

/// Codec decoding `In` and encoding `Out`.
pub struct MessageCodec<In, Out> {
    frames: LengthDelimitedCodec,
    _marker: PhantomData<fn(Out) -> In>,
}

impl<In, Out> MessageCodec<In, Out> {
    pub fn new() -> Self {
        Self {
            frames: LengthDelimitedCodec::builder()
                .length_field_length(4)
                .big_endian()
                .max_frame_length(MAX_FRAME_LENGTH)
                .new_codec(),
            _marker: PhantomData,
        }
    }
}

impl<In, Out> Default for MessageCodec<In, Out> {
    fn default() -> Self {
        Self::new()
    }
}

impl<In, Out> std::fmt::Debug for MessageCodec<In, Out> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MessageCodec")
            .field("max_frame_length", &MAX_FRAME_LENGTH)
            .finish()
    }
}

impl<In: DeserializeOwned, Out> Decoder for MessageCodec<In, Out> {
    type Item = Inbound<In>;
    type Error = CodecError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        let Some(frame) = self.frames.decode(src)? else {
            return Ok(None);
        };

        let item = match serde_json::from_slice::<In>(&frame) {
            Ok(msg) => Inbound::Message(msg),
            Err(e) => Inbound::Malformed {
                seq: recover_seq(&frame),
                reason: e.to_string(),
            },
        };
        Ok(Some(item))
    }
}

impl<In, Out: Serialize> Encoder<Out> for MessageCodec<In, Out> {
    type Error = CodecError;

    fn encode(&mut self, item: Out, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let json = serde_json::to_vec(&item)?;
        if json.len() > MAX_FRAME_LENGTH {
            return Err(CodecError::FrameTooLarge {
                len: json.len(),
                max: MAX_FRAME_LENGTH,
            });
        }
        self.frames.encode(Bytes::from(json), dst)?;
        Ok(())
    }
}

/// Best-effort extraction of `seq` from a frame that failed to decode.
fn recover_seq(frame: &[u8]) -> Option<u64> {
    serde_json::from_slice::<serde_json::Value>(frame)
        .ok()?
        .get("seq")?
        .as_u64()
}
