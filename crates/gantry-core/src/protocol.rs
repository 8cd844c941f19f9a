//! Wire protocol: typed commands, responses, and frame helpers.
//!
//! Every message on the channel is `[4-byte little-endian length]`
//! followed by a UTF-8 JSON payload of exactly that length. Payloads are
//! tagged serde enums so both ends can round-trip them, including fault
//! payloads on failure. Serialization failures on the write path degrade
//! gracefully: instead of propagating, the writer encodes a
//! `bad_request` response and sends that.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::case::TestCase;
use crate::events::TestEvent;

/// Length-prefix size in bytes.
pub const FRAME_HEADER_LEN: usize = 4;

/// Maximum accepted payload length.
pub const MAX_FRAME_LEN: usize = 16 * 1024 * 1024;

/// Typed request sent from the engine to a command executor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Command {
    /// Liveness probe.
    Ping,

    /// Run a suite by qualified name.
    RunSuite {
        /// Qualified suite name, resolved against the registry.
        suite: String,

        /// Optional case filter; empty means every discovered case.
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        cases: Vec<TestCase>,
    },

    /// Ask the remote end to exit its serve loop.
    Shutdown,
}

/// Response status codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResponseStatus {
    /// Command executed; payload carries the result.
    Ok,
    /// Malformed or unknown command.
    BadRequest,
    /// Handler raised; payload carries the serialized fault.
    InternalError,
    /// Channel severed or execution cancelled.
    Gone,
}

impl ResponseStatus {
    /// Numeric code, for diagnostics.
    #[must_use]
    pub const fn code(self) -> u16 {
        match self {
            Self::Ok => 200,
            Self::BadRequest => 400,
            Self::InternalError => 500,
            Self::Gone => 410,
        }
    }
}

impl std::fmt::Display for ResponseStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let label = match self {
            Self::Ok => "ok",
            Self::BadRequest => "bad request",
            Self::InternalError => "internal error",
            Self::Gone => "gone",
        };
        write!(f, "{label} ({})", self.code())
    }
}

/// Serialized fault carried in an `InternalError` payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FaultPayload {
    /// Fault classification, e.g. `unhandled_panic`.
    pub kind: String,
    /// Human-readable description.
    pub message: String,
}

/// Status plus serialized JSON payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Response {
    /// Outcome of the command.
    pub status: ResponseStatus,
    /// Serialized JSON payload; shape depends on `status`.
    pub payload: String,
}

impl Response {
    /// Successful response carrying `payload`.
    ///
    /// A payload that fails to serialize degrades to a `bad_request`
    /// response describing the encoding failure, so callers never see a
    /// serialization error escape the response boundary.
    #[must_use]
    pub fn ok<T: Serialize>(payload: &T) -> Self {
        match serde_json::to_string(payload) {
            Ok(payload) => Self {
                status: ResponseStatus::Ok,
                payload,
            },
            Err(error) => Self::bad_request(format!("failed to serialize payload: {error}")),
        }
    }

    /// Malformed-command response.
    #[must_use]
    pub fn bad_request(message: impl Into<String>) -> Self {
        Self {
            status: ResponseStatus::BadRequest,
            payload: Self::message_payload(&message.into()),
        }
    }

    /// Handler-fault response carrying the serialized fault.
    #[must_use]
    pub fn internal_error(fault: &FaultPayload) -> Self {
        Self {
            status: ResponseStatus::InternalError,
            payload: serde_json::to_string(fault)
                .unwrap_or_else(|_| Self::message_payload(&fault.message)),
        }
    }

    /// Severed-channel / cancelled response.
    #[must_use]
    pub fn gone(message: impl Into<String>) -> Self {
        Self {
            status: ResponseStatus::Gone,
            payload: Self::message_payload(&message.into()),
        }
    }

    /// Deserialize the payload into `T`.
    ///
    /// # Errors
    ///
    /// Returns the underlying JSON error if the payload does not match.
    pub fn payload_as<T: DeserializeOwned>(&self) -> Result<T, serde_json::Error> {
        serde_json::from_str(&self.payload)
    }

    /// Returns `true` for `Ok` status.
    #[must_use]
    pub const fn is_ok(&self) -> bool {
        matches!(self.status, ResponseStatus::Ok)
    }

    fn message_payload(message: &str) -> String {
        serde_json::json!({ "message": message }).to_string()
    }
}

/// One framed message sent from the host back to the engine: listener
/// events interleave with the final response.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum HostMessage {
    /// Lifecycle event for listener fan-out.
    Event(TestEvent),
    /// Final answer for the in-flight command.
    Response(Response),
}

/// Frame a payload for transport: little-endian length, then bytes.
#[must_use]
#[allow(clippy::cast_possible_truncation)] // frames are bounded by MAX_FRAME_LEN
pub fn frame_message(payload: &[u8]) -> Vec<u8> {
    let len = payload.len() as u32;
    let mut framed = Vec::with_capacity(FRAME_HEADER_LEN + payload.len());
    framed.extend_from_slice(&len.to_le_bytes());
    framed.extend_from_slice(payload);
    framed
}

/// Parse a frame's length prefix, if a complete header is present.
#[must_use]
pub fn parse_frame_length(buffer: &[u8]) -> Option<usize> {
    if buffer.len() < FRAME_HEADER_LEN {
        return None;
    }
    let len = u32::from_le_bytes([buffer[0], buffer[1], buffer[2], buffer[3]]);
    Some(len as usize)
}

/// Protocol-layer errors.
#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    /// Irrecoverable I/O failure; the channel closes.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Payload did not serialize or deserialize.
    #[error("serialization error: {0}")]
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
