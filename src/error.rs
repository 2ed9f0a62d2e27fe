//! Error types for milterwire.

use thiserror::Error;

/// Main error type for all milter session operations.
#[derive(Debug, Error)]
pub enum MilterError {
    /// I/O error during socket operations.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON error while loading configuration.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Protocol error (malformed payload, bad negotiation, etc.).
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// A command code this side does not know how to handle.
    #[error("Unsupported command {code:?} (qid: {})", qid.as_deref().unwrap_or("-"))]
    Unsupported {
        /// The offending command byte, as a char.
        code: char,
        /// Queue id of the session, if known.
        qid: Option<String>,
    },

    /// A frame declared a length above the configured limit.
    #[error("Frame size {size} exceeds maximum {max}")]
    FrameTooLarge {
        /// Declared frame length.
        size: usize,
        /// Configured limit.
        max: usize,
    },

    /// Connection closed unexpectedly.
    #[error("Connection closed")]
    ConnectionClosed,
}

/// Result type alias using MilterError.
pub type Result<T> = std::result::Result<T, MilterError>;
