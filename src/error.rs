//! Domain-specific error types for the scry protocol core.
//!
//! All fallible operations return `Result<T, ScryError>`.
//! Every error carries a stable [`ErrorKind`] tag next to its
//! human-readable message, so callers can branch without string matching.

use std::fmt;
use std::time::Duration;

use thiserror::Error;

/// The canonical error type for the protocol core.
#[derive(Debug, Error)]
pub enum ScryError {
    // ── Transport Errors ─────────────────────────────────────────
    /// The device tunnel failed: unreachable device, push or spawn failure.
    #[error("transport error: {0}")]
    Transport(String),

    /// The session configuration is unusable before any I/O happened.
    #[error("invalid session config: {0}")]
    InvalidConfig(String),

    // ── Handshake Errors ─────────────────────────────────────────
    /// The server-side handshake did not follow the protocol.
    #[error("handshake failed: {0}")]
    Handshake(String),

    /// A codec id read from the wire maps to no known codec.
    #[error("unknown codec id: {0:#010x}")]
    UnknownCodecId(u32),

    // ── Framing Errors ───────────────────────────────────────────
    /// A frame violated the wire layout with an impossible value.
    #[error("malformed frame: {0}")]
    MalformedFrame(String),

    /// A payload length exceeded the configured safety cap.
    #[error("payload too large: {size} bytes (cap {cap})")]
    PayloadTooLarge { size: usize, cap: usize },

    /// The stream ended in the middle of a frame or field.
    #[error("truncated frame: needed {needed} bytes, {available} available")]
    TruncatedFrame { needed: usize, available: usize },

    // ── Control Channel Errors ───────────────────────────────────
    /// The control channel observed an inbound parse error and is unusable.
    #[error("control channel broken")]
    ChannelBroken,

    // ── Lifecycle Errors ─────────────────────────────────────────
    /// An operation was attempted while the session is shutting down.
    #[error("session is shutting down")]
    SessionClosing,

    /// An operation was attempted after the session closed.
    #[error("session closed")]
    SessionClosed,

    /// A bounded operation exceeded its deadline.
    #[error("timeout after {0:?}")]
    Timeout(Duration),

    /// The session state machine rejected a transition or operation.
    #[error("invalid session state: {0}")]
    InvalidState(&'static str),

    // ── Plumbing ─────────────────────────────────────────────────
    /// The TCP/IO layer reported an error.
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    /// An internal channel was closed unexpectedly.
    #[error("channel closed")]
    ChannelClosed,

    /// UTF-8 conversion failed.
    #[error("invalid utf-8: {0}")]
    InvalidUtf8(#[from] std::string::FromUtf8Error),
}

impl ScryError {
    /// The stable kind tag for this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            ScryError::Transport(_) | ScryError::InvalidConfig(_) => ErrorKind::Transport,
            ScryError::Handshake(_) | ScryError::UnknownCodecId(_) => ErrorKind::Handshake,
            ScryError::MalformedFrame(_) | ScryError::PayloadTooLarge { .. } => {
                ErrorKind::MalformedFrame
            }
            ScryError::TruncatedFrame { .. } => ErrorKind::TruncatedFrame,
            ScryError::ChannelBroken => ErrorKind::ChannelBroken,
            ScryError::SessionClosing => ErrorKind::SessionClosing,
            ScryError::SessionClosed => ErrorKind::SessionClosed,
            ScryError::Timeout(_) => ErrorKind::Timeout,
            ScryError::InvalidState(_) => ErrorKind::Internal,
            ScryError::Io(_) | ScryError::ChannelClosed | ScryError::InvalidUtf8(_) => {
                ErrorKind::Io
            }
        }
    }
}

impl<T> From<tokio::sync::mpsc::error::SendError<T>> for ScryError {
    fn from(_: tokio::sync::mpsc::error::SendError<T>) -> Self {
        ScryError::ChannelClosed
    }
}

// ── ErrorKind ────────────────────────────────────────────────────

/// Stable error classification, independent of the variant payloads.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    Transport,
    Handshake,
    MalformedFrame,
    TruncatedFrame,
    ChannelBroken,
    SessionClosing,
    SessionClosed,
    Timeout,
    Io,
    Internal,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

// ── TerminationReason ────────────────────────────────────────────

/// Why a session ended. Observable after the session reaches `Closed`.
///
/// Set exactly once; the first failure (or the caller's stop request) wins.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TerminationReason {
    pub kind: ErrorKind,
    pub message: String,
}

impl TerminationReason {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    /// Capture the kind and message of an error as a termination reason.
    pub fn from_error(err: &ScryError) -> Self {
        Self {
            kind: err.kind(),
            message: err.to_string(),
        }
    }
}

impl fmt::Display for TerminationReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.kind, self.message)
    }
}
