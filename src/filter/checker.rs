//! Downstream codec driver: splits the request byte stream into tRPC frames
//! and materializes one active message per frame.

use std::sync::Arc;

use bytes::{Bytes, BytesMut};
use prost::Message as _;
use tracing::debug;

use crate::codec::{DecoderCallbacks, FixedHeader, FrameDecoder};
use crate::error::DecodeError;
use crate::proto::RequestProtocol;

use super::conn_manager::{Action, ConnCore, MessageId};
use super::message::ActiveMessage;
use super::metadata::MessageMetadata;

pub struct RequestChecker {
    decoder: FrameDecoder,
    /// Prefix of the frame currently being decoded; memory for the message
    /// is committed only once the protobuf header parses.
    fixed_header: Option<FixedHeader>,
    current: Option<MessageId>,
}

impl Default for RequestChecker {
    fn default() -> Self {
        Self {
            decoder: FrameDecoder::new(),
            fixed_header: None,
            current: None,
        }
    }
}

impl RequestChecker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Pull frames out of `buffer` until it underflows; this is the only
    /// place downstream frames are consumed.
    pub fn on_data(
        &mut self,
        buffer: &mut BytesMut,
        core: &mut ConnCore,
        messages: &mut Vec<ActiveMessage>,
        next_id: &mut MessageId,
        out: &mut Vec<Action>,
    ) -> Result<(), DecodeError> {
        loop {
            let mut sink = DownstreamSink {
                core: &mut *core,
                messages: &mut *messages,
                next_id: &mut *next_id,
                fixed_header: &mut self.fixed_header,
                current: &mut self.current,
                out: &mut *out,
            };
            if self.decoder.on_data(buffer, &mut sink)? {
                return Ok(());
            }
        }
    }
}

struct DownstreamSink<'a> {
    core: &'a mut ConnCore,
    messages: &'a mut Vec<ActiveMessage>,
    next_id: &'a mut MessageId,
    fixed_header: &'a mut Option<FixedHeader>,
    current: &'a mut Option<MessageId>,
    out: &'a mut Vec<Action>,
}

impl DecoderCallbacks for DownstreamSink<'_> {
    fn on_fixed_header(&mut self, header: FixedHeader) {
        *self.fixed_header = Some(header);
    }

    fn on_protocol_header(&mut self, raw: &[u8]) -> bool {
        let Ok(header) = RequestProtocol::decode(raw) else {
            return false;
        };
        let Some(fixed) = self.fixed_header.take() else {
            return false;
        };

        let metadata = Arc::new(MessageMetadata::new(fixed.data_frame_size, header));
        let id = *self.next_id;
        *self.next_id += 1;
        debug!("new message, id={}, request_id={}", id, metadata.request_id());

        self.messages.push(ActiveMessage::new(id, metadata, self.core));
        *self.current = Some(id);
        true
    }

    fn on_frame(&mut self, frame: Bytes) {
        let Some(id) = self.current.take() else {
            return;
        };
        let Some(message) = self.messages.iter_mut().find(|m| m.id() == id) else {
            return;
        };
        message.on_stream_decoded(self.core, frame, self.out);
    }
}
