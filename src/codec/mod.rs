//! Streaming decoder for concatenated, partially-buffered tRPC frames.
//!
//! The decoder never blocks and never over-reads: when the buffer does not
//! yet hold enough bytes for the current stage it reports underflow and
//! leaves the buffer untouched. Complete frames are moved out of the input
//! buffer and handed to the sink in arrival order.

mod frame;

pub use frame::{FixedHeader, FIXED_HEADER_LEN, TRPC_MAGIC};

use bytes::{Bytes, BytesMut};
use tracing::trace;

use crate::error::DecodeError;

/// Callbacks invoked by [`FrameDecoder`] as a frame takes shape.
///
/// Implemented by the downstream request checker, the router's response side
/// and the health-check session.
pub trait DecoderCallbacks {
    /// The fixed prefix of the next frame has been parsed. The frame bytes
    /// themselves are still in the input buffer.
    fn on_fixed_header(&mut self, header: FixedHeader);

    /// The raw protobuf header bytes of the frame. Returns `false` when the
    /// bytes do not parse, which the decoder raises as
    /// [`DecodeError::HeaderParseFailed`].
    fn on_protocol_header(&mut self, raw: &[u8]) -> bool;

    /// One complete frame (fixed prefix + protobuf header + body), moved out
    /// of the input buffer.
    fn on_frame(&mut self, frame: Bytes);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DecodeStage {
    FixedHeader,
    ProtocolHeader,
    Payload,
    Done,
}

/// Incremental tRPC frame decoder.
///
/// One instance decodes one direction of one connection; it is re-entrant
/// across [`FrameDecoder::on_data`] calls, never within one.
pub struct FrameDecoder {
    stage: DecodeStage,
    total_size: usize,
    pb_header_size: usize,
}

impl Default for FrameDecoder {
    fn default() -> Self {
        Self {
            stage: DecodeStage::FixedHeader,
            total_size: 0,
            pb_header_size: 0,
        }
    }
}

impl FrameDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Advance the decoder over `buf`, delivering at most one complete frame
    /// to `sink`. Returns `Ok(true)` when more bytes are needed before
    /// further progress (underflow); `Ok(false)` means a frame was delivered
    /// and bytes remain, so the caller should invoke `on_data` again.
    pub fn on_data<S: DecoderCallbacks>(
        &mut self,
        buf: &mut BytesMut,
        sink: &mut S,
    ) -> Result<bool, DecodeError> {
        trace!(len = buf.len(), "decoder on_data");

        while self.stage != DecodeStage::Done {
            let next = match self.stage {
                DecodeStage::FixedHeader => self.decode_fixed_header(buf, sink)?,
                DecodeStage::ProtocolHeader => self.decode_protocol_header(buf, sink)?,
                DecodeStage::Payload => self.decode_payload(buf, sink),
                DecodeStage::Done => unreachable!("done handled by the loop condition"),
            };

            match next {
                Some(stage) => self.stage = stage,
                None => return Ok(true),
            }
        }

        self.stage = DecodeStage::FixedHeader;
        self.total_size = 0;
        self.pb_header_size = 0;

        Ok(buf.is_empty())
    }

    fn decode_fixed_header<S: DecoderCallbacks>(
        &mut self,
        buf: &BytesMut,
        sink: &mut S,
    ) -> Result<Option<DecodeStage>, DecodeError> {
        if buf.len() < FIXED_HEADER_LEN {
            return Ok(None);
        }

        let header = FixedHeader::peek(buf)?;
        self.total_size = header.data_frame_size as usize;
        self.pb_header_size = header.pb_header_size as usize;
        sink.on_fixed_header(header);

        Ok(Some(DecodeStage::ProtocolHeader))
    }

    fn decode_protocol_header<S: DecoderCallbacks>(
        &mut self,
        buf: &BytesMut,
        sink: &mut S,
    ) -> Result<Option<DecodeStage>, DecodeError> {
        if buf.len() < FIXED_HEADER_LEN + self.pb_header_size {
            return Ok(None);
        }

        let raw = &buf[FIXED_HEADER_LEN..FIXED_HEADER_LEN + self.pb_header_size];
        if !sink.on_protocol_header(raw) {
            return Err(DecodeError::HeaderParseFailed);
        }

        Ok(Some(DecodeStage::Payload))
    }

    fn decode_payload<S: DecoderCallbacks>(
        &mut self,
        buf: &mut BytesMut,
        sink: &mut S,
    ) -> Option<DecodeStage> {
        if buf.len() < self.total_size {
            return None;
        }

        let frame = buf.split_to(self.total_size).freeze();
        sink.on_frame(frame);

        Some(DecodeStage::Done)
    }
}
