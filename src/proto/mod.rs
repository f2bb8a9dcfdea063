//! tRPC protocol headers and framework return codes.
//!
//! The message structs mirror the `RequestProtocol` / `ResponseProtocol`
//! definitions of the tRPC protocol (field tags included) so that frames
//! re-encoded here are byte-identical to ones produced by a tRPC client
//! using the same protobuf implementation.

use bytes::BytesMut;
use prost::Message;

use crate::codec::{FixedHeader, FIXED_HEADER_LEN};

/// Call types carried in `RequestProtocol::call_type`.
pub const TRPC_UNARY_CALL: u32 = 0;
pub const TRPC_ONEWAY_CALL: u32 = 1;

/// Serialization type for protobuf payloads.
pub const TRPC_PROTO_ENCODE: u32 = 0;

/// Framework-level return codes (`ResponseProtocol::ret`).
pub const TRPC_INVOKE_SUCCESS: i32 = 0;
pub const TRPC_SERVER_DECODE_ERR: i32 = 1;
pub const TRPC_SERVER_NOSERVICE_ERR: i32 = 11;
pub const TRPC_SERVER_TIMEOUT_ERR: i32 = 21;
pub const TRPC_SERVER_OVERLOAD_ERR: i32 = 22;
pub const TRPC_SERVER_SYSTEM_ERR: i32 = 31;

/// Request packet header, one per unary or oneway invocation.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct RequestProtocol {
    #[prost(uint32, tag = "1")]
    pub version: u32,
    #[prost(uint32, tag = "2")]
    pub call_type: u32,
    #[prost(uint32, tag = "3")]
    pub request_id: u32,
    /// Client-side deadline in milliseconds; forwarded untouched.
    #[prost(uint32, tag = "4")]
    pub timeout: u32,
    #[prost(string, tag = "5")]
    pub caller: ::prost::alloc::string::String,
    /// Target service name; drives routing.
    #[prost(string, tag = "6")]
    pub callee: ::prost::alloc::string::String,
    #[prost(string, tag = "7")]
    pub func: ::prost::alloc::string::String,
    #[prost(uint32, tag = "10")]
    pub content_type: u32,
    #[prost(uint32, tag = "11")]
    pub content_encoding: u32,
}

/// Response packet header; success means `ret == 0 && func_ret == 0`.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ResponseProtocol {
    #[prost(uint32, tag = "1")]
    pub version: u32,
    #[prost(uint32, tag = "2")]
    pub call_type: u32,
    #[prost(uint32, tag = "3")]
    pub request_id: u32,
    /// Framework-level status.
    #[prost(int32, tag = "4")]
    pub ret: i32,
    /// Application-level status.
    #[prost(int32, tag = "5")]
    pub func_ret: i32,
    #[prost(string, tag = "6")]
    pub error_msg: ::prost::alloc::string::String,
    #[prost(uint32, tag = "9")]
    pub content_type: u32,
    #[prost(uint32, tag = "10")]
    pub content_encoding: u32,
}

/// Append one complete tRPC frame (fixed prefix + protobuf header + body)
/// to `buf`. The size fields of the prefix are computed here.
pub fn encode_frame<M: Message>(header: &M, body: &[u8], buf: &mut BytesMut) {
    let pb_header_size = header.encoded_len();
    let total = FIXED_HEADER_LEN + pb_header_size + body.len();

    FixedHeader {
        data_frame_type: 0,
        data_frame_state: 0,
        data_frame_size: total as u32,
        pb_header_size: pb_header_size as u16,
        stream_id: 0,
    }
    .encode(buf);

    buf.reserve(pb_header_size + body.len());
    header
        .encode(buf)
        .expect("encoding into BytesMut cannot run out of capacity");
    buf.extend_from_slice(body);
}

/// A locally-generated error reply, sent downstream when a request cannot be
/// proxied. The encoded frame echoes the identity fields of the request it
/// answers and carries an empty body.
pub struct ErrorReply {
    code: i32,
    message: String,
}

impl ErrorReply {
    pub fn new(code: i32, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    pub fn code(&self) -> i32 {
        self.code
    }

    /// Encode the reply frame for the given request header into `buf`.
    pub fn encode(&self, request: &RequestProtocol, buf: &mut BytesMut) {
        let header = ResponseProtocol {
            version: request.version,
            call_type: request.call_type,
            request_id: request.request_id,
            ret: self.code,
            func_ret: self.code,
            error_msg: self.message.clone(),
            content_type: request.content_type,
            content_encoding: request.content_encoding,
        };
        encode_frame(&header, &[], buf);
    }
}
