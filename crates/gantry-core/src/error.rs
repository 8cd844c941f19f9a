//! Engine failure taxonomy.

use std::time::Duration;

use crate::protocol::ProtocolError;

/// Failures the engine distinguishes when classifying outcomes and
/// reporting them to callers.
///
/// Stage-level conditions (validation, assertion, timeout, panic) never
/// surface as `Err` values from a suite run; they become reports on the
/// active context. This type covers the paths that do abort: executor
/// start/stop, process supervision, and protocol plumbing.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    /// A stage declaration does not match its callable's contract.
    #[error("stage signature validation failed: {0}")]
    Validation(String),

    /// Expected-vs-actual mismatch raised across the assertion boundary.
    #[error("assertion failed: {0}")]
    Assertion(String),

    /// A stage or signal wait exceeded its budget.
    #[error("operation exceeded its {0:?} budget")]
    TimedOut(Duration),

    /// Anything else raised by user or library code.
    #[error("unhandled failure: {0}")]
    Unhandled(String),

    /// The external runtime failed its capability check, failed to
    /// start, or failed to compile. Aborts the whole run for the suite
    /// batch, since no test body can meaningfully execute.
    #[error("runtime process failure: {0}")]
    Process(String),

    /// Malformed or truncated framed message, or a serialization error.
    #[error("protocol failure: {0}")]
    Protocol(#[from] ProtocolError),
}
