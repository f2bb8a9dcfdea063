use bytes::{Buf, BufMut, BytesMut};

use crate::error::DecodeError;

/// Magic carried by every tRPC frame.
pub const TRPC_MAGIC: u16 = 0x930b;

/// Size of the fixed prefix that opens every frame.
pub const FIXED_HEADER_LEN: usize = 16;

/// The 16-byte fixed prefix of a tRPC frame, in wire order: magic (2),
/// data-frame-type (1), data-frame-state (1), total frame size (4, BE),
/// protobuf header size (2, BE), stream id (2, BE), reserved (4).
///
/// `data_frame_size` counts the prefix itself plus the protobuf header plus
/// the body.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FixedHeader {
    pub data_frame_type: u8,
    pub data_frame_state: u8,
    pub data_frame_size: u32,
    pub pb_header_size: u16,
    pub stream_id: u16,
}

impl FixedHeader {
    /// Prefix plus protobuf header, in bytes.
    pub fn header_size(&self) -> u32 {
        FIXED_HEADER_LEN as u32 + u32::from(self.pb_header_size)
    }

    /// Body length implied by the size fields.
    pub fn payload_size(&self) -> u32 {
        self.data_frame_size - self.header_size()
    }

    /// Non-destructive decode of the first [`FIXED_HEADER_LEN`] bytes of
    /// `buf`. The caller guarantees at least that many bytes are available;
    /// nothing is drained.
    pub fn peek(buf: &[u8]) -> Result<Self, DecodeError> {
        debug_assert!(buf.len() >= FIXED_HEADER_LEN);
        let mut cur = &buf[..FIXED_HEADER_LEN];

        let magic = cur.get_u16();
        if magic != TRPC_MAGIC {
            return Err(DecodeError::ProtocolInvalid(format!(
                "bad magic 0x{:04x}",
                magic
            )));
        }

        let header = FixedHeader {
            data_frame_type: cur.get_u8(),
            data_frame_state: cur.get_u8(),
            data_frame_size: cur.get_u32(),
            pb_header_size: cur.get_u16(),
            stream_id: cur.get_u16(),
        };

        if header.data_frame_size < header.header_size() {
            return Err(DecodeError::ProtocolInvalid(format!(
                "frame size {} shorter than headers {}",
                header.data_frame_size,
                header.header_size()
            )));
        }

        Ok(header)
    }

    /// Append the encoded prefix to `buf`. The reserved field is zeroed.
    pub fn encode(&self, buf: &mut BytesMut) {
        buf.reserve(FIXED_HEADER_LEN);
        buf.put_u16(TRPC_MAGIC);
        buf.put_u8(self.data_frame_type);
        buf.put_u8(self.data_frame_state);
        buf.put_u32(self.data_frame_size);
        buf.put_u16(self.pb_header_size);
        buf.put_u16(self.stream_id);
        buf.put_u32(0);
    }
}
