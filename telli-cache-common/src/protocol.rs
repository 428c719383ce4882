//! # RESP2 Encoding and Parsing
//!
//! Purpose: Encode commands and replies and parse frames incrementally from a
//! socket buffer, for both the cache client and the in-memory server.
//!
//! ## Design Principles
//! 1. **Incremental Parsing**: `decode` never consumes a partial frame; it
//!    reports `Ok(None)` and waits for more bytes.
//! 2. **Buffer Reuse**: Encoders append into a caller-owned `Vec<u8>`.
//! 3. **Binary-Safe**: Bulk strings are treated as raw bytes.
//! 4. **Fail Fast**: Invalid framing returns protocol errors immediately.

use bytes::{Buf, BytesMut};

use crate::error::{ProtocolError, ProtocolResult};

/// Largest bulk string accepted, matching the Redis `proto-max-bulk-len` default.
pub const MAX_BULK_LEN: i64 = 512 * 1024 * 1024;

/// Largest array accepted in a single frame.
pub const MAX_ARRAY_LEN: i64 = 1024 * 1024;

/// Deepest array nesting accepted.
pub const MAX_DEPTH: usize = 8;

/// Longest unterminated header line buffered before the peer is rejected,
/// matching the Redis inline request limit.
pub const MAX_LINE_LEN: usize = 64 * 1024;

/// RESP response value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RespValue {
    /// +OK or +PONG style responses.
    Simple(Vec<u8>),
    /// -ERR ... responses.
    Error(Vec<u8>),
    /// :123 responses.
    Integer(i64),
    /// $... bulk strings, with None for null.
    Bulk(Option<Vec<u8>>),
    /// *... arrays, with None for the null array.
    Array(Option<Vec<RespValue>>),
}

impl RespValue {
    /// `+OK`
    pub fn ok() -> Self {
        RespValue::Simple(b"OK".to_vec())
    }

    /// `-ERR <message>`
    pub fn error(message: &str) -> Self {
        let mut buf = Vec::with_capacity(message.len() + 4);
        buf.extend_from_slice(b"ERR ");
        buf.extend_from_slice(message.as_bytes());
        RespValue::Error(buf)
    }

    pub fn bulk(data: impl Into<Vec<u8>>) -> Self {
        RespValue::Bulk(Some(data.into()))
    }

    pub fn null() -> Self {
        RespValue::Bulk(None)
    }

    /// Converts a request frame into its argument list.
    ///
    /// Requests are arrays of bulk strings; anything else is rejected.
    pub fn into_command_args(self) -> ProtocolResult<Vec<Vec<u8>>> {
        let items = match self {
            RespValue::Array(Some(items)) if !items.is_empty() => items,
            _ => return Err(ProtocolError::NotACommand),
        };
        items
            .into_iter()
            .map(|item| match item {
                RespValue::Bulk(Some(data)) => Ok(data),
                _ => Err(ProtocolError::NotACommand),
            })
            .collect()
    }
}

/// Encodes a RESP2 array command into the provided buffer.
pub fn encode_command(args: &[&[u8]], out: &mut Vec<u8>) {
    out.push(b'*');
    push_decimal(out, args.len() as i64);
    out.extend_from_slice(b"\r\n");
    for arg in args {
        push_bulk(out, arg);
    }
}

/// Encodes any RESP2 value, used for server replies.
pub fn encode_value(value: &RespValue, out: &mut Vec<u8>) {
    match value {
        RespValue::Simple(text) => push_line(out, b'+', text),
        RespValue::Error(text) => push_line(out, b'-', text),
        RespValue::Integer(n) => {
            out.push(b':');
            push_decimal(out, *n);
            out.extend_from_slice(b"\r\n");
        }
        RespValue::Bulk(None) => out.extend_from_slice(b"$-1\r\n"),
        RespValue::Bulk(Some(data)) => push_bulk(out, data),
        RespValue::Array(None) => out.extend_from_slice(b"*-1\r\n"),
        RespValue::Array(Some(items)) => {
            out.push(b'*');
            push_decimal(out, items.len() as i64);
            out.extend_from_slice(b"\r\n");
            for item in items {
                encode_value(item, out);
            }
        }
    }
}

/// Decodes one complete frame from the front of `buf`.
///
/// Returns `Ok(None)` and leaves `buf` untouched when the frame is incomplete.
/// On success exactly the bytes of that frame are consumed.
///
/// Parsing restarts from the front of the frame on every call, so an array
/// reply that trickles in over many reads is re-scanned each time. Replies
/// here are bounded by the `SCAN` page size, which keeps that cheap.
pub fn decode(buf: &mut BytesMut) -> ProtocolResult<Option<RespValue>> {
    let mut pos = 0;
    match parse_value(&buf[..], &mut pos, 0)? {
        Some(value) => {
            buf.advance(pos);
            Ok(Some(value))
        }
        None => Ok(None),
    }
}

fn parse_value(data: &[u8], pos: &mut usize, depth: usize) -> ProtocolResult<Option<RespValue>> {
    if depth > MAX_DEPTH {
        return Err(ProtocolError::TooDeep(MAX_DEPTH));
    }

    let (start, end) = match find_line(data, *pos)? {
        Some(bounds) => bounds,
        None => return Ok(None),
    };
    let line = &data[start..end];
    if line.is_empty() {
        return Err(ProtocolError::EmptyLine);
    }
    // Skip past the CRLF.
    *pos = end + 2;

    let body = &line[1..];
    match line[0] {
        b'+' => Ok(Some(RespValue::Simple(body.to_vec()))),
        b'-' => Ok(Some(RespValue::Error(body.to_vec()))),
        b':' => Ok(Some(RespValue::Integer(parse_i64(body)?))),
        b'$' => parse_bulk(data, pos, parse_i64(body)?),
        b'*' => parse_array(data, pos, parse_i64(body)?, depth),
        other => Err(ProtocolError::InvalidType(other)),
    }
}

fn parse_bulk(data: &[u8], pos: &mut usize, len: i64) -> ProtocolResult<Option<RespValue>> {
    if len == -1 {
        return Ok(Some(RespValue::Bulk(None)));
    }
    if !(0..=MAX_BULK_LEN).contains(&len) {
        return Err(ProtocolError::InvalidLength(len));
    }

    let len = len as usize;
    let end = *pos + len;
    if data.len() < end + 2 {
        return Ok(None);
    }
    if &data[end..end + 2] != b"\r\n" {
        return Err(ProtocolError::MissingCrlf);
    }

    let payload = data[*pos..end].to_vec();
    *pos = end + 2;
    Ok(Some(RespValue::Bulk(Some(payload))))
}

fn parse_array(
    data: &[u8],
    pos: &mut usize,
    len: i64,
    depth: usize,
) -> ProtocolResult<Option<RespValue>> {
    if len == -1 {
        return Ok(Some(RespValue::Array(None)));
    }
    if !(0..=MAX_ARRAY_LEN).contains(&len) {
        return Err(ProtocolError::InvalidLength(len));
    }

    // Cap the preallocation; the length is peer-controlled.
    let mut items = Vec::with_capacity((len as usize).min(64));
    for _ in 0..len {
        match parse_value(data, pos, depth + 1)? {
            Some(item) => items.push(item),
            None => return Ok(None),
        }
    }
    Ok(Some(RespValue::Array(Some(items))))
}

/// Locates the next CRLF-terminated line starting at `from`.
///
/// Returns the line bounds excluding the terminator.
fn find_line(data: &[u8], from: usize) -> ProtocolResult<Option<(usize, usize)>> {
    let rest = match data.get(from..) {
        Some(rest) => rest,
        None => return Ok(None),
    };
    let newline = match rest.iter().position(|&b| b == b'\n') {
        Some(offset) => from + offset,
        None if rest.len() > MAX_LINE_LEN => {
            return Err(ProtocolError::LineTooLong(MAX_LINE_LEN))
        }
        None => return Ok(None),
    };
    if newline == from || data[newline - 1] != b'\r' {
        return Err(ProtocolError::MissingCrlf);
    }
    Ok(Some((from, newline - 1)))
}

fn parse_i64(data: &[u8]) -> ProtocolResult<i64> {
    std::str::from_utf8(data)
        .ok()
        .and_then(|text| text.parse::<i64>().ok())
        .ok_or(ProtocolError::InvalidInteger)
}

fn push_line(out: &mut Vec<u8>, marker: u8, text: &[u8]) {
    out.push(marker);
    out.extend_from_slice(text);
    out.extend_from_slice(b"\r\n");
}

fn push_bulk(out: &mut Vec<u8>, data: &[u8]) {
    out.push(b'$');
    push_decimal(out, data.len() as i64);
    out.extend_from_slice(b"\r\n");
    out.extend_from_slice(data);
    out.extend_from_slice(b"\r\n");
}

fn push_decimal(out: &mut Vec<u8>, value: i64) {
    // itoa-style formatting into a stack buffer keeps encoding allocation-free.
    let mut buf = [0u8; 20];
    let mut len = 0;
    let negative = value < 0;
    let mut magnitude = value.unsigned_abs();
    if magnitude == 0 {
        buf[0] = b'0';
        len = 1;
    }
    while magnitude > 0 {
        buf[len] = b'0' + (magnitude % 10) as u8;
        magnitude /= 10;
        len += 1;
    }
    if negative {
        out.push(b'-');
    }
    for idx in (0..len).rev() {
        out.push(buf[idx]);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn decode_all(input: &[u8]) -> ProtocolResult<Option<RespValue>> {
        let mut buf = BytesMut::from(input);
        decode(&mut buf)
    }

    #[test]
    fn encodes_command() {
        let mut buf = Vec::new();
        encode_command(&[b"GET", b"key"], &mut buf);
        assert_eq!(&buf, b"*2\r\n$3\r\nGET\r\n$3\r\nkey\r\n");
    }

    #[test]
    fn encodes_negative_integer() {
        let mut buf = Vec::new();
        encode_value(&RespValue::Integer(-2), &mut buf);
        assert_eq!(&buf, b":-2\r\n");
    }

    #[test]
    fn encodes_nested_reply() {
        let reply = RespValue::Array(Some(vec![
            RespValue::bulk("0"),
            RespValue::Array(Some(vec![RespValue::bulk("a")])),
        ]));
        let mut buf = Vec::new();
        encode_value(&reply, &mut buf);
        assert_eq!(&buf, b"*2\r\n$1\r\n0\r\n*1\r\n$1\r\na\r\n");
    }

    #[test]
    fn parses_simple_string() {
        assert_eq!(decode_all(b"+OK\r\n").unwrap(), Some(RespValue::ok()));
    }

    #[test]
    fn parses_bulk_string() {
        assert_eq!(
            decode_all(b"$5\r\nhello\r\n").unwrap(),
            Some(RespValue::bulk("hello"))
        );
    }

    #[test]
    fn parses_binary_bulk_with_embedded_crlf() {
        assert_eq!(
            decode_all(b"$4\r\na\r\nb\r\n").unwrap(),
            Some(RespValue::bulk(b"a\r\nb".to_vec()))
        );
    }

    #[test]
    fn parses_null_bulk_string() {
        assert_eq!(decode_all(b"$-1\r\n").unwrap(), Some(RespValue::null()));
    }

    #[test]
    fn parses_integer_and_error() {
        assert_eq!(decode_all(b":42\r\n").unwrap(), Some(RespValue::Integer(42)));
        assert_eq!(
            decode_all(b"-ERR bad\r\n").unwrap(),
            Some(RespValue::Error(b"ERR bad".to_vec()))
        );
    }

    #[test]
    fn partial_frames_are_not_consumed() {
        let mut buf = BytesMut::from(&b"*2\r\n$3\r\nGET\r\n$3\r\nke"[..]);
        assert_eq!(decode(&mut buf).unwrap(), None);
        assert_eq!(buf.len(), 19);

        buf.extend_from_slice(b"y\r\n");
        let value = decode(&mut buf).unwrap().unwrap();
        assert!(buf.is_empty());
        assert_eq!(
            value.into_command_args().unwrap(),
            vec![b"GET".to_vec(), b"key".to_vec()]
        );
    }

    #[test]
    fn pipelined_frames_decode_in_order() {
        let mut buf = BytesMut::from(&b"+OK\r\n:1\r\n"[..]);
        assert_eq!(decode(&mut buf).unwrap(), Some(RespValue::ok()));
        assert_eq!(decode(&mut buf).unwrap(), Some(RespValue::Integer(1)));
        assert_eq!(decode(&mut buf).unwrap(), None);
    }

    #[test]
    fn rejects_malformed_frames() {
        assert_eq!(decode_all(b"?what\r\n"), Err(ProtocolError::InvalidType(b'?')));
        assert_eq!(decode_all(b"+OK\n"), Err(ProtocolError::MissingCrlf));
        assert_eq!(decode_all(b":abc\r\n"), Err(ProtocolError::InvalidInteger));
        assert_eq!(decode_all(b"$-5\r\n"), Err(ProtocolError::InvalidLength(-5)));
        assert_eq!(decode_all(b"$3\r\nabcXY"), Err(ProtocolError::MissingCrlf));
        assert_eq!(decode_all(b"\r\n"), Err(ProtocolError::EmptyLine));
    }

    #[test]
    fn unterminated_header_is_capped() {
        let mut input = vec![b'+'];
        input.resize(MAX_LINE_LEN, b'a');
        assert_eq!(decode_all(&input), Ok(None));

        input.extend_from_slice(b"aa");
        assert_eq!(decode_all(&input), Err(ProtocolError::LineTooLong(MAX_LINE_LEN)));
    }

    #[test]
    fn rejects_excessive_nesting() {
        let input = b"*1\r\n".repeat(MAX_DEPTH + 2);
        assert_eq!(decode_all(&input), Err(ProtocolError::TooDeep(MAX_DEPTH)));
    }

    #[test]
    fn non_array_is_not_a_command() {
        assert_eq!(
            RespValue::bulk("GET").into_command_args(),
            Err(ProtocolError::NotACommand)
        );
        assert_eq!(
            RespValue::Array(Some(Vec::new())).into_command_args(),
            Err(ProtocolError::NotACommand)
        );
    }
}
