//! Administrative message codec.
//!
//! Administrative records mark snapshot points in the pipeline. Their body is
//! a fixed little-endian layout: an 8-byte message header followed by an MMB
//! header block carrying the node identifier.
//!
//! ```text
//! ┌──────────────────────────────┬──────────────────┐
//! │ MessageHeader (8 bytes)      │ MmbHeader (2 B)  │
//! │ block_length | template_id   │ node_id          │
//! │ schema_id    | version       │                  │
//! └──────────────────────────────┴──────────────────┘
//! ```
//!
//! Field ordering is wire format, not convenience: all fields are `U16<LE>`
//! so the struct is the exact byte image on every platform.

use num_enum::{IntoPrimitive, TryFromPrimitive};
use zerocopy::byteorder::{LittleEndian, U16};
use zerocopy::{AsBytes, FromBytes, FromZeroes, Ref};

use crate::ProtocolError;

/// Schema identifier stamped into every administrative header.
pub const SCHEMA_ID: u16 = 1;

/// Schema version stamped into every administrative header.
pub const SCHEMA_VERSION: u16 = 0;

/// Total encoded length of an administrative message body.
pub const ADMIN_MESSAGE_LENGTH: usize = MessageHeader::SIZE + MmbHeader::SIZE;

/// Administrative sub-templates, discriminated by `template_id`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, IntoPrimitive, TryFromPrimitive)]
#[repr(u16)]
pub enum AdminTemplate {
    /// Replay state from the last snapshot; injected once at pipeline start.
    LoadSnapshot = 1,
    /// Persist current state; injected periodically by the snapshot timer.
    SaveSnapshot = 2,
}

/// Fixed 8-byte administrative message header.
#[repr(C)]
#[derive(Debug, Clone, Copy, AsBytes, FromBytes, FromZeroes)]
pub struct MessageHeader {
    pub block_length: U16<LittleEndian>,
    pub template_id: U16<LittleEndian>,
    pub schema_id: U16<LittleEndian>,
    pub version: U16<LittleEndian>,
}

impl MessageHeader {
    /// Header size in bytes.
    pub const SIZE: usize = 8;
}

/// Body block shared by all administrative templates.
#[repr(C)]
#[derive(Debug, Clone, Copy, AsBytes, FromBytes, FromZeroes)]
pub struct MmbHeader {
    pub node_id: U16<LittleEndian>,
}

impl MmbHeader {
    /// Block size in bytes.
    pub const SIZE: usize = 2;
}

/// A decoded administrative message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AdminMessage {
    pub template: AdminTemplate,
    pub node_id: u16,
}

impl AdminMessage {
    pub fn new(template: AdminTemplate, node_id: u16) -> Self {
        Self { template, node_id }
    }

    /// Encode into `buf`, returning the encoded length.
    ///
    /// `buf` must hold at least [`ADMIN_MESSAGE_LENGTH`] bytes.
    pub fn encode(&self, buf: &mut [u8]) -> crate::Result<usize> {
        if buf.len() < ADMIN_MESSAGE_LENGTH {
            return Err(ProtocolError::Truncated {
                needed: ADMIN_MESSAGE_LENGTH,
                available: buf.len(),
            });
        }

        let header = MessageHeader {
            block_length: U16::new(MmbHeader::SIZE as u16),
            template_id: U16::new(self.template.into()),
            schema_id: U16::new(SCHEMA_ID),
            version: U16::new(SCHEMA_VERSION),
        };
        let body = MmbHeader {
            node_id: U16::new(self.node_id),
        };

        buf[..MessageHeader::SIZE].copy_from_slice(header.as_bytes());
        buf[MessageHeader::SIZE..ADMIN_MESSAGE_LENGTH].copy_from_slice(body.as_bytes());
        Ok(ADMIN_MESSAGE_LENGTH)
    }

    /// Decode from `buf`.
    pub fn decode(buf: &[u8]) -> crate::Result<Self> {
        if buf.len() < ADMIN_MESSAGE_LENGTH {
            return Err(ProtocolError::Truncated {
                needed: ADMIN_MESSAGE_LENGTH,
                available: buf.len(),
            });
        }

        let (header, rest) = Ref::<_, MessageHeader>::new_from_prefix(buf)
            .expect("length checked above");
        let header = *header;

        if header.schema_id.get() != SCHEMA_ID {
            return Err(ProtocolError::SchemaMismatch {
                expected: SCHEMA_ID,
                actual: header.schema_id.get(),
            });
        }

        let template = AdminTemplate::try_from(header.template_id.get())
            .map_err(|_| ProtocolError::UnknownTemplate(header.template_id.get()))?;

        let body = Ref::<_, MmbHeader>::new_from_prefix(rest)
            .expect("length checked above")
            .0;

        Ok(Self {
            template,
            node_id: body.node_id.get(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_size_is_exact() {
        assert_eq!(std::mem::size_of::<MessageHeader>(), MessageHeader::SIZE);
        assert_eq!(std::mem::size_of::<MmbHeader>(), MmbHeader::SIZE);
        assert_eq!(ADMIN_MESSAGE_LENGTH, 10);
    }

    #[test]
    fn encode_is_bit_exact_little_endian() {
        let msg = AdminMessage::new(AdminTemplate::SaveSnapshot, 0x0102);
        let mut buf = [0u8; ADMIN_MESSAGE_LENGTH];
        let len = msg.encode(&mut buf).unwrap();

        assert_eq!(len, ADMIN_MESSAGE_LENGTH);
        // block_length = 2, template = 2, schema = 1, version = 0, node = 0x0102
        assert_eq!(buf, [2, 0, 2, 0, 1, 0, 0, 0, 0x02, 0x01]);
    }

    #[test]
    fn round_trip() {
        for template in [AdminTemplate::LoadSnapshot, AdminTemplate::SaveSnapshot] {
            let msg = AdminMessage::new(template, 7);
            let mut buf = [0u8; ADMIN_MESSAGE_LENGTH];
            msg.encode(&mut buf).unwrap();
            assert_eq!(AdminMessage::decode(&buf).unwrap(), msg);
        }
    }

    #[test]
    fn decode_rejects_short_buffer() {
        let err = AdminMessage::decode(&[0u8; 4]).unwrap_err();
        assert!(matches!(err, ProtocolError::Truncated { needed: 10, .. }));
    }

    #[test]
    fn decode_rejects_unknown_template() {
        let msg = AdminMessage::new(AdminTemplate::LoadSnapshot, 0);
        let mut buf = [0u8; ADMIN_MESSAGE_LENGTH];
        msg.encode(&mut buf).unwrap();
        buf[2] = 99; // template_id low byte
        assert!(matches!(
            AdminMessage::decode(&buf).unwrap_err(),
            ProtocolError::UnknownTemplate(99)
        ));
    }

    #[test]
    fn decode_rejects_schema_mismatch() {
        let msg = AdminMessage::new(AdminTemplate::LoadSnapshot, 0);
        let mut buf = [0u8; ADMIN_MESSAGE_LENGTH];
        msg.encode(&mut buf).unwrap();
        buf[4] = 9; // schema_id low byte
        assert!(matches!(
            AdminMessage::decode(&buf).unwrap_err(),
            ProtocolError::SchemaMismatch { expected: 1, actual: 9 }
        ));
    }
}
