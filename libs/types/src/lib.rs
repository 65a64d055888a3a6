//! Shared message-type definitions for the MMB pipeline.
//!
//! The pipeline is payload-opaque: the only structure it understands is the
//! 32-bit message-type identifier stamped on every framed record, and the
//! administrative message bodies used for snapshot markers. Both live here so
//! that transports, stages and user handlers agree on the exact bytes.

pub mod admin;
pub mod message_type;

pub use admin::{
    AdminMessage, AdminTemplate, MessageHeader, MmbHeader, ADMIN_MESSAGE_LENGTH, SCHEMA_ID,
    SCHEMA_VERSION,
};
pub use message_type::{
    is_administrative, is_valid_msg_type_id, ADMINISTRATIVE_MSG_ID, APPLICATION_MSG_ID,
    PADDING_MSG_TYPE_ID,
};

/// Errors raised while encoding or decoding protocol structures.
#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    #[error("buffer too short: need {needed} bytes, have {available}")]
    Truncated { needed: usize, available: usize },

    #[error("unknown administrative template id: {0}")]
    UnknownTemplate(u16),

    #[error("schema id mismatch: expected {expected}, got {actual}")]
    SchemaMismatch { expected: u16, actual: u16 },

    #[error("reserved message type id: {0}")]
    ReservedMessageType(i32),
}

/// Result type for codec operations.
pub type Result<T> = std::result::Result<T, ProtocolError>;
