//! Pipeline error taxonomy.
//!
//! Backpressure is deliberately absent: a full ring or a back-pressured
//! publication is flow control, handled by retry under the idle strategy,
//! and never surfaces as an error value.

use mmb_transport::TransportError;
use mmb_types::ProtocolError;

/// Errors surfaced by pipeline construction and lifecycle operations.
#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    /// Caller misuse: double start, close before start, registration after
    /// start, invalid configuration. Not recoverable.
    #[error("usage error: {0}")]
    Usage(String),

    #[error("transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("journal error: {0}")]
    Journal(std::io::Error),

    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl PipelineError {
    pub(crate) fn usage(message: impl Into<String>) -> Self {
        Self::Usage(message.into())
    }
}

/// Result type for pipeline operations.
pub type Result<T> = std::result::Result<T, PipelineError>;
