use std::fmt;

/// Errors raised while decoding a tRPC byte stream.
///
/// Both variants are fatal for the direction they occur on: a downstream
/// decode error closes the downstream connection, an upstream decode error
/// is answered with a local error reply and closes the upstream connection.
/// Partial data is never an error — the codec reports underflow instead.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DecodeError {
    /// The 16-byte fixed prefix did not carry the tRPC magic, or its size
    /// fields are inconsistent.
    ProtocolInvalid(String),
    /// The protobuf request/response header could not be parsed.
    HeaderParseFailed,
}

impl fmt::Display for DecodeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DecodeError::ProtocolInvalid(msg) => write!(f, "protocol invalid: {}", msg),
            DecodeError::HeaderParseFailed => write!(f, "parse header failed"),
        }
    }
}

impl std::error::Error for DecodeError {}
