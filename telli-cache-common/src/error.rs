//! # Codec Errors
//!
//! Failures raised while decoding RESP2 frames. Both sides of the wire treat
//! these as fatal for the connection: once framing is lost there is no safe
//! way to resynchronise the stream.

use thiserror::Error;

/// Result alias for codec operations.
pub type ProtocolResult<T> = Result<T, ProtocolError>;

/// Malformed RESP2 input.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProtocolError {
    /// First byte of a frame is not a known RESP2 type marker.
    #[error("invalid frame type byte 0x{0:02x}")]
    InvalidType(u8),
    /// A frame header line carried no type marker at all.
    #[error("empty frame header")]
    EmptyLine,
    /// A line or bulk payload was not terminated by CRLF.
    #[error("frame not terminated by CRLF")]
    MissingCrlf,
    /// An integer or length field could not be parsed.
    #[error("invalid integer in frame header")]
    InvalidInteger,
    /// A bulk or array length is negative (other than -1) or too large.
    #[error("invalid frame length {0}")]
    InvalidLength(i64),
    /// A header line grew past the limit without a line terminator.
    #[error("frame header exceeds {0} bytes")]
    LineTooLong(usize),
    /// Arrays nested beyond the supported depth.
    #[error("frame nesting exceeds {0} levels")]
    TooDeep(usize),
    /// A request frame was not an array of bulk strings.
    #[error("command must be a non-empty array of bulk strings")]
    NotACommand,
}
