//! The 32-bit message-type identifier space.
//!
//! Every record framed into a ring buffer carries one of these identifiers.
//! Identifiers zero and below are reserved by the framing layer; the rest of
//! the space is split between application traffic and the administrative
//! range used for snapshot markers. The two ranges never overlap, so a stage
//! can discriminate with a single comparison.

/// In-ring padding sentinel. Fills the tail of a ring buffer when a record
/// would straddle the wrap point; never delivered to a handler.
pub const PADDING_MSG_TYPE_ID: i32 = -1;

/// Message type carried by application records entering from the transport.
pub const APPLICATION_MSG_ID: i32 = 1;

/// Message type carried by administrative records (snapshot markers).
/// Sub-templates are discriminated by the [`admin`](crate::admin) header.
pub const ADMINISTRATIVE_MSG_ID: i32 = 2;

/// A message type id is writable if it is strictly positive; zero and
/// negative ids are reserved for the framing layer.
#[inline]
pub const fn is_valid_msg_type_id(msg_type_id: i32) -> bool {
    msg_type_id > 0
}

/// Whether a record belongs to the administrative range.
#[inline]
pub const fn is_administrative(msg_type_id: i32) -> bool {
    msg_type_id == ADMINISTRATIVE_MSG_ID
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reserved_ids_are_invalid() {
        assert!(!is_valid_msg_type_id(0));
        assert!(!is_valid_msg_type_id(-1));
        assert!(!is_valid_msg_type_id(i32::MIN));
        assert!(is_valid_msg_type_id(APPLICATION_MSG_ID));
        assert!(is_valid_msg_type_id(ADMINISTRATIVE_MSG_ID));
    }

    #[test]
    fn ranges_do_not_overlap() {
        assert_ne!(APPLICATION_MSG_ID, ADMINISTRATIVE_MSG_ID);
        assert!(!is_administrative(APPLICATION_MSG_ID));
        assert!(is_administrative(ADMINISTRATIVE_MSG_ID));
    }
}
