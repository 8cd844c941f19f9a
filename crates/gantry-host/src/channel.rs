//! Length-prefixed message transport over a bidirectional byte stream.
//!
//! Wire contract: every message is `[4-byte little-endian length]`
//! followed by a UTF-8 JSON payload of exactly that length. Writers emit
//! length, payload, and flush as one logical unit. Readers loop until
//! exactly the declared byte count has arrived or the stream
//! disconnects.
//!
//! Short-read semantics are pinned per read site, which is why this is
//! explicit `read_exact`/`write_all` plumbing rather than a codec:
//!
//! - a read expecting a [`Command`] raises the I/O failure to the serve
//!   loop (which decides whether to answer or close)
//! - a read expecting a [`HostMessage`] never fails: disconnects and
//!   truncation degrade to a typed `gone` response, so the engine side
//!   cannot hang on a half-written frame
//!
//! Serialization failures on the write path degrade to a `bad_request`
//! response which is itself serialized and sent instead of propagating.

use gantry_core::protocol::{HostMessage, Response, FRAME_HEADER_LEN, MAX_FRAME_LEN};
use gantry_core::Command;
use serde::Serialize;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::warn;

/// Byte stream a framed channel can run over.
pub trait ByteStream: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T: AsyncRead + AsyncWrite + Unpin + Send> ByteStream for T {}

/// Boxed stream for callers that pick the transport at runtime.
pub type BoxedStream = Box<dyn ByteStream>;

/// Channel-layer errors.
#[derive(Debug, thiserror::Error)]
pub enum ChannelError {
    /// Irrecoverable stream failure (includes disconnects mid-frame).
    #[error("I/O failure on framed channel: {0}")]
    Io(#[from] std::io::Error),

    /// Payload could not be encoded or decoded.
    #[error("message serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Declared frame length exceeds the accepted maximum.
    #[error("frame of {len} bytes exceeds the {max}-byte limit")]
    FrameTooLarge {
        /// Declared length.
        len: usize,
        /// Accepted maximum.
        max: usize,
    },
}

impl ChannelError {
    /// Returns `true` when the peer closed the stream.
    #[must_use]
    pub fn is_disconnect(&self) -> bool {
        matches!(
            self,
            Self::Io(error) if error.kind() == std::io::ErrorKind::UnexpectedEof
        )
    }
}

/// Reliable framed transport over any [`ByteStream`].
pub struct FramedChannel<S> {
    stream: S,
}

impl<S: ByteStream> FramedChannel<S> {
    /// Wrap a connected stream.
    pub fn new(stream: S) -> Self {
        Self { stream }
    }

    /// Serialize and send one message as a single frame.
    ///
    /// A payload that fails to serialize is replaced by a `bad_request`
    /// response describing the failure; only the replacement travels.
    ///
    /// # Errors
    ///
    /// Returns an error on stream failure, on an over-long frame, or in
    /// the pathological case that the replacement response itself fails
    /// to encode.
    pub async fn send<T: Serialize>(&mut self, message: &T) -> Result<(), ChannelError> {
        let payload = match serde_json::to_vec(message) {
            Ok(payload) => payload,
            Err(error) => {
                warn!(%error, "outgoing message failed to serialize; degrading to bad_request");
                let fallback =
                    Response::bad_request(format!("failed to serialize outgoing message: {error}"));
                serde_json::to_vec(&fallback)?
            }
        };
        if payload.len() > MAX_FRAME_LEN {
            return Err(ChannelError::FrameTooLarge {
                len: payload.len(),
                max: MAX_FRAME_LEN,
            });
        }

        // Length, payload, flush: one logical unit.
        #[allow(clippy::cast_possible_truncation)] // bounded by MAX_FRAME_LEN
        let len = payload.len() as u32;
        let mut frame = Vec::with_capacity(FRAME_HEADER_LEN + payload.len());
        frame.extend_from_slice(&len.to_le_bytes());
        frame.extend_from_slice(&payload);
        self.stream.write_all(&frame).await?;
        self.stream.flush().await?;
        Ok(())
    }

    /// Read one framed command. I/O failures (including truncation)
    /// surface to the caller.
    ///
    /// # Errors
    ///
    /// Returns `Io` when the stream fails or disconnects mid-frame,
    /// `FrameTooLarge` for an over-long declared length, and
    /// `Serialization` when the payload is not a valid command.
    pub async fn read_command(&mut self) -> Result<Command, ChannelError> {
        let payload = self.read_frame().await?;
        Ok(serde_json::from_slice(&payload)?)
    }

    /// Read one framed host message. Never fails: a severed or truncated
    /// stream degrades to a `gone` response, and an undecodable payload
    /// degrades to an `internal_error` response.
    pub async fn read_host_message(&mut self) -> HostMessage {
        match self.read_frame().await {
            Ok(payload) => match serde_json::from_slice(&payload) {
                Ok(message) => message,
                Err(error) => {
                    warn!(%error, "undecodable host message");
                    HostMessage::Response(Response::internal_error(
                        &gantry_core::FaultPayload {
                            kind: "protocol_failure".to_string(),
                            message: format!("undecodable host message: {error}"),
                        },
                    ))
                }
            },
            Err(error) => {
                HostMessage::Response(Response::gone(format!("connection interrupted: {error}")))
            }
        }
    }

    async fn read_frame(&mut self) -> Result<Vec<u8>, ChannelError> {
        let mut header = [0u8; FRAME_HEADER_LEN];
        self.stream.read_exact(&mut header).await?;
        let len = u32::from_le_bytes(header) as usize;
        if len > MAX_FRAME_LEN {
            return Err(ChannelError::FrameTooLarge {
                len,
                max: MAX_FRAME_LEN,
            });
        }
        let mut payload = vec![0u8; len];
        self.stream.read_exact(&mut payload).await?;
        Ok(payload)
    }
}
