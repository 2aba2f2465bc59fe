//! Error types for framebus.

use thiserror::Error;

/// Main error type for all bus operations.
#[derive(Debug, Error)]
pub enum BusError {
    /// I/O error on a session stream.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// MsgPack serialization error (header or payload).
    #[error("encode error: {0}")]
    Encode(#[from] rmp_serde::encode::Error),

    /// MsgPack deserialization error (header or payload).
    #[error("decode error: {0}")]
    Decode(#[from] rmp_serde::decode::Error),

    /// JSON rendering error (telemetry path only).
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Encoded header exceeds the reserved headroom.
    #[error("message head is too long: {size} bytes")]
    HeadTooLong { size: usize },

    /// Malformed frame (bad prefix, truncated header, oversized frame).
    #[error("protocol error: {0}")]
    Protocol(String),

    /// No session or endpoint could be resolved for the message.
    #[error("invalid route: {0}")]
    InvalidRoute(String),

    /// Operation not permitted in the current state or from the current worker.
    #[error("invalid operation: {0}")]
    InvalidOp(String),

    /// A pending request timed out.
    #[error("request timed out")]
    Timeout,

    /// Session send failed.
    #[error("transport error: {0}")]
    Transport(String),

    /// The context worker or a session channel has shut down.
    #[error("connection closed")]
    ConnectionClosed,
}

/// Result type alias using BusError.
pub type Result<T> = std::result::Result<T, BusError>;
