//! Incremental RESP Decoder
//!
//! Parses RESP2 and RESP3 frames out of a byte buffer. The decoder is
//! incremental: callers append network reads to a buffer and retry until a
//! complete top-level value is available.
//!
//! The contract per call:
//! - `Ok(Some((value, consumed)))` - one complete value, `consumed` bytes used
//! - `Ok(None)` - the frame is incomplete, read more bytes and retry
//! - `Err(ParseError)` - malformed framing; the caller must close the
//!   connection (protocol errors are not recoverable mid-stream)
//!
//! Commands arrive as arrays of bulk strings; bulk payloads are binary-safe
//! and may contain NUL or CRLF bytes. Lines that start with an unknown
//! prefix are treated as inline commands (whitespace-separated words), which
//! keeps `redis-cli`'s plain-text mode working.

use crate::protocol::types::{prefix, RespValue, CRLF};
use bytes::Bytes;
use std::num::ParseIntError;
use thiserror::Error;

/// Errors that can occur during RESP parsing.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum ParseError {
    /// Unknown type prefix byte
    #[error("unknown type prefix: {0:#04x}")]
    UnknownPrefix(u8),

    /// Invalid integer format
    #[error("invalid integer: {0}")]
    InvalidInteger(String),

    /// Invalid double format
    #[error("invalid double: {0}")]
    InvalidDouble(String),

    /// Invalid UTF-8 in a simple string or error message
    #[error("invalid UTF-8: {0}")]
    InvalidUtf8(String),

    /// Bulk string length is negative (but not -1 for null)
    #[error("invalid bulk string length: {0}")]
    InvalidBulkLength(i64),

    /// Aggregate length is negative (but not -1 for null)
    #[error("invalid aggregate length: {0}")]
    InvalidAggregateLength(i64),

    /// Protocol violation (missing CRLF, bad boolean, etc.)
    #[error("protocol error: {0}")]
    ProtocolError(String),

    /// The message exceeds maximum allowed size
    #[error("message too large: {size} bytes (max: {max})")]
    MessageTooLarge { size: usize, max: usize },
}

/// Result type for parsing operations.
pub type ParseResult<T> = Result<T, ParseError>;

/// Maximum size for a single bulk string (512 MB, same as Redis)
pub const MAX_BULK_SIZE: usize = 512 * 1024 * 1024;

/// Maximum aggregate nesting depth (prevent stack overflow)
pub const MAX_NESTING_DEPTH: usize = 32;

/// An incremental RESP decoder.
///
/// # Example
///
/// ```ignore
/// use postkeys::protocol::RespParser;
/// use bytes::BytesMut;
///
/// let mut parser = RespParser::new();
/// let mut buffer = BytesMut::from(&b"*2\r\n$3\r\nGET\r\n$4\r\nname\r\n"[..]);
///
/// if let Some((value, consumed)) = parser.parse(&buffer)? {
///     buffer.advance(consumed);
/// }
/// ```
#[derive(Debug, Default)]
pub struct RespParser {
    /// Current nesting depth (for aggregate parsing)
    depth: usize,
}

impl RespParser {
    pub fn new() -> Self {
        Self { depth: 0 }
    }

    /// Attempts to parse one complete RESP value from the buffer.
    pub fn parse(&mut self, buf: &[u8]) -> ParseResult<Option<(RespValue, usize)>> {
        self.depth = 0;
        self.parse_value(buf)
    }

    fn parse_value(&mut self, buf: &[u8]) -> ParseResult<Option<(RespValue, usize)>> {
        if buf.is_empty() {
            return Ok(None);
        }

        if self.depth > MAX_NESTING_DEPTH {
            return Err(ParseError::ProtocolError(format!(
                "maximum nesting depth exceeded: {}",
                MAX_NESTING_DEPTH
            )));
        }

        match buf[0] {
            prefix::SIMPLE_STRING => self.parse_line(buf, |s| Ok(RespValue::SimpleString(s))),
            prefix::ERROR => self.parse_line(buf, |s| Ok(RespValue::Error(s))),
            prefix::INTEGER => self.parse_line(buf, |s| {
                let n: i64 = s
                    .parse()
                    .map_err(|e: ParseIntError| ParseError::InvalidInteger(e.to_string()))?;
                Ok(RespValue::Integer(n))
            }),
            prefix::BULK_STRING => self.parse_bulk_string(buf),
            prefix::ARRAY => self.parse_aggregate(buf, Aggregate::Array),
            prefix::MAP => self.parse_aggregate(buf, Aggregate::Map),
            prefix::SET => self.parse_aggregate(buf, Aggregate::Set),
            prefix::PUSH => self.parse_aggregate(buf, Aggregate::Push),
            prefix::NULL => self.parse_null(buf),
            prefix::DOUBLE => self.parse_line(buf, |s| {
                let d = match s.as_str() {
                    "inf" | "+inf" => f64::INFINITY,
                    "-inf" => f64::NEG_INFINITY,
                    other => other
                        .parse()
                        .map_err(|_| ParseError::InvalidDouble(other.to_string()))?,
                };
                Ok(RespValue::Double(d))
            }),
            prefix::BOOLEAN => self.parse_line(buf, |s| match s.as_str() {
                "t" => Ok(RespValue::Boolean(true)),
                "f" => Ok(RespValue::Boolean(false)),
                other => Err(ParseError::ProtocolError(format!(
                    "invalid boolean: {}",
                    other
                ))),
            }),
            prefix::BIG_NUMBER => self.parse_line(buf, |s| {
                let digits = s.strip_prefix(&['-', '+'][..]).unwrap_or(&s);
                if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
                    return Err(ParseError::InvalidInteger(s));
                }
                Ok(RespValue::BigNumber(s))
            }),
            prefix::VERBATIM => self.parse_verbatim(buf),
            _ => self.parse_inline(buf),
        }
    }

    /// Parses a one-line frame (`<prefix><payload>\r\n`) and maps the payload.
    fn parse_line<F>(&mut self, buf: &[u8], f: F) -> ParseResult<Option<(RespValue, usize)>>
    where
        F: FnOnce(String) -> ParseResult<RespValue>,
    {
        match find_crlf(&buf[1..]) {
            Some(pos) => {
                let content = &buf[1..1 + pos];
                let s = std::str::from_utf8(content)
                    .map_err(|e| ParseError::InvalidUtf8(e.to_string()))?;
                let consumed = 1 + pos + 2;
                Ok(Some((f(s.to_string())?, consumed)))
            }
            None => Ok(None), // Incomplete
        }
    }

    /// Parses the RESP3 null frame: `_\r\n`
    fn parse_null(&mut self, buf: &[u8]) -> ParseResult<Option<(RespValue, usize)>> {
        if buf.len() < 3 {
            return Ok(None);
        }
        if &buf[1..3] != CRLF {
            return Err(ParseError::ProtocolError(
                "null frame missing CRLF".to_string(),
            ));
        }
        Ok(Some((RespValue::Null, 3)))
    }

    /// Parses a bulk string: `$<length>\r\n<data>\r\n`
    fn parse_bulk_string(&mut self, buf: &[u8]) -> ParseResult<Option<(RespValue, usize)>> {
        let (length, header) = match self.parse_length(buf)? {
            Some(v) => v,
            None => return Ok(None),
        };

        // $-1\r\n is the RESP2 null bulk string
        if length == -1 {
            return Ok(Some((RespValue::Null, header)));
        }
        if length < 0 {
            return Err(ParseError::InvalidBulkLength(length));
        }

        let length = length as usize;
        if length > MAX_BULK_SIZE {
            return Err(ParseError::MessageTooLarge {
                size: length,
                max: MAX_BULK_SIZE,
            });
        }

        let total_needed = header + length + 2;
        if buf.len() < total_needed {
            return Ok(None); // Incomplete
        }

        if &buf[header + length..header + length + 2] != CRLF {
            return Err(ParseError::ProtocolError(
                "bulk string missing trailing CRLF".to_string(),
            ));
        }

        let data = Bytes::copy_from_slice(&buf[header..header + length]);
        Ok(Some((RespValue::Bulk(data), total_needed)))
    }

    /// Parses a verbatim string: `=<length>\r\n<fmt>:<data>\r\n`
    fn parse_verbatim(&mut self, buf: &[u8]) -> ParseResult<Option<(RespValue, usize)>> {
        let (length, header) = match self.parse_length(buf)? {
            Some(v) => v,
            None => return Ok(None),
        };
        if length < 4 {
            return Err(ParseError::InvalidBulkLength(length));
        }
        let length = length as usize;
        if length > MAX_BULK_SIZE {
            return Err(ParseError::MessageTooLarge {
                size: length,
                max: MAX_BULK_SIZE,
            });
        }

        let total_needed = header + length + 2;
        if buf.len() < total_needed {
            return Ok(None);
        }
        if buf[header + 3] != b':' {
            return Err(ParseError::ProtocolError(
                "verbatim string missing format separator".to_string(),
            ));
        }
        let format = [buf[header], buf[header + 1], buf[header + 2]];
        let text = Bytes::copy_from_slice(&buf[header + 4..header + length]);
        Ok(Some((RespValue::Verbatim { format, text }, total_needed)))
    }

    /// Parses `<prefix><signed length>\r\n`, returning the length and the
    /// number of header bytes consumed.
    fn parse_length(&mut self, buf: &[u8]) -> ParseResult<Option<(i64, usize)>> {
        let end = match find_crlf(&buf[1..]) {
            Some(pos) => pos,
            None => return Ok(None),
        };
        let s = std::str::from_utf8(&buf[1..1 + end])
            .map_err(|e| ParseError::InvalidUtf8(e.to_string()))?;
        let length: i64 = s
            .parse()
            .map_err(|e: ParseIntError| ParseError::InvalidInteger(e.to_string()))?;
        Ok(Some((length, 1 + end + 2)))
    }

    /// Parses array-shaped aggregates (`*`, `%`, `~`, `>`).
    fn parse_aggregate(
        &mut self,
        buf: &[u8],
        kind: Aggregate,
    ) -> ParseResult<Option<(RespValue, usize)>> {
        let (count, header) = match self.parse_length(buf)? {
            Some(v) => v,
            None => return Ok(None),
        };

        // *-1\r\n is the RESP2 null array
        if count == -1 && kind == Aggregate::Array {
            return Ok(Some((RespValue::NullArray, header)));
        }
        if count < 0 {
            return Err(ParseError::InvalidAggregateLength(count));
        }

        // Maps hold count pairs, everything else count elements
        let elements_needed = match kind {
            Aggregate::Map => (count as usize) * 2,
            _ => count as usize,
        };

        let mut elements = Vec::with_capacity(elements_needed);
        let mut consumed = header;

        self.depth += 1;

        for _ in 0..elements_needed {
            if consumed >= buf.len() {
                return Ok(None); // Incomplete
            }
            match self.parse_value(&buf[consumed..])? {
                Some((value, used)) => {
                    elements.push(value);
                    consumed += used;
                }
                None => return Ok(None), // Incomplete
            }
        }

        self.depth -= 1;

        let value = match kind {
            Aggregate::Array => RespValue::Array(elements),
            Aggregate::Set => RespValue::Set(elements),
            Aggregate::Push => RespValue::Push(elements),
            Aggregate::Map => {
                let mut pairs = Vec::with_capacity(count as usize);
                let mut it = elements.into_iter();
                while let (Some(k), Some(v)) = (it.next(), it.next()) {
                    pairs.push((k, v));
                }
                RespValue::Map(pairs)
            }
        };
        Ok(Some((value, consumed)))
    }

    /// Parses an inline command line: whitespace-separated words up to CRLF.
    fn parse_inline(&mut self, buf: &[u8]) -> ParseResult<Option<(RespValue, usize)>> {
        let crlf_pos = match find_crlf(buf) {
            Some(pos) => pos,
            None => return Ok(None),
        };

        let line = std::str::from_utf8(&buf[..crlf_pos])
            .map_err(|e| ParseError::InvalidUtf8(e.to_string()))?;

        let parts: Vec<&str> = line.split_whitespace().collect();
        if parts.is_empty() {
            return Err(ParseError::ProtocolError("empty inline command".to_string()));
        }

        let elements: Vec<RespValue> = parts
            .into_iter()
            .map(|s| RespValue::Bulk(Bytes::from(s.to_string())))
            .collect();

        Ok(Some((RespValue::Array(elements), crlf_pos + 2)))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Aggregate {
    Array,
    Map,
    Set,
    Push,
}

/// Finds the position of CRLF in the buffer.
#[inline]
fn find_crlf(buf: &[u8]) -> Option<usize> {
    for i in 0..buf.len().saturating_sub(1) {
        if buf[i] == b'\r' && buf[i + 1] == b'\n' {
            return Some(i);
        }
    }
    None
}

/// Parses a single RESP message from bytes. Convenience wrapper for tests
/// and one-shot callers.
pub fn parse_message(buf: &[u8]) -> ParseResult<Option<(RespValue, usize)>> {
    RespParser::new().parse(buf)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::types::RespVersion;

    #[test]
    fn test_parse_simple_string() {
        let result = parse_message(b"+OK\r\n").unwrap().unwrap();
        assert_eq!(result.0, RespValue::SimpleString("OK".to_string()));
        assert_eq!(result.1, 5);
    }

    #[test]
    fn test_parse_simple_string_incomplete() {
        assert!(parse_message(b"+OK").unwrap().is_none());
    }

    #[test]
    fn test_parse_error() {
        let result = parse_message(b"-ERR unknown command\r\n").unwrap().unwrap();
        assert_eq!(result.0, RespValue::Error("ERR unknown command".to_string()));
        assert_eq!(result.1, 22);
    }

    #[test]
    fn test_parse_integer() {
        let result = parse_message(b":1000\r\n").unwrap().unwrap();
        assert_eq!(result.0, RespValue::Integer(1000));
        let result = parse_message(b":-42\r\n").unwrap().unwrap();
        assert_eq!(result.0, RespValue::Integer(-42));
    }

    #[test]
    fn test_parse_bulk_string() {
        let result = parse_message(b"$5\r\nhello\r\n").unwrap().unwrap();
        assert_eq!(result.0, RespValue::Bulk(Bytes::from("hello")));
        assert_eq!(result.1, 11);
    }

    #[test]
    fn test_parse_null_bulk_string() {
        let result = parse_message(b"$-1\r\n").unwrap().unwrap();
        assert_eq!(result.0, RespValue::Null);
    }

    #[test]
    fn test_parse_empty_bulk_string() {
        let result = parse_message(b"$0\r\n\r\n").unwrap().unwrap();
        assert_eq!(result.0, RespValue::Bulk(Bytes::from("")));
        assert_eq!(result.1, 6);
    }

    #[test]
    fn test_parse_bulk_string_incomplete() {
        assert!(parse_message(b"$5\r\nhel").unwrap().is_none());
    }

    #[test]
    fn test_parse_array() {
        let result = parse_message(b"*2\r\n$3\r\nGET\r\n$4\r\nname\r\n")
            .unwrap()
            .unwrap();
        assert_eq!(
            result.0,
            RespValue::Array(vec![
                RespValue::Bulk(Bytes::from("GET")),
                RespValue::Bulk(Bytes::from("name")),
            ])
        );
        assert_eq!(result.1, 23);
    }

    #[test]
    fn test_parse_null_array() {
        let result = parse_message(b"*-1\r\n").unwrap().unwrap();
        assert_eq!(result.0, RespValue::NullArray);
    }

    #[test]
    fn test_parse_empty_array() {
        let result = parse_message(b"*0\r\n").unwrap().unwrap();
        assert_eq!(result.0, RespValue::Array(vec![]));
    }

    #[test]
    fn test_parse_nested_array() {
        let result = parse_message(b"*2\r\n:1\r\n*2\r\n:2\r\n:3\r\n")
            .unwrap()
            .unwrap();
        assert_eq!(
            result.0,
            RespValue::Array(vec![
                RespValue::Integer(1),
                RespValue::Array(vec![RespValue::Integer(2), RespValue::Integer(3)]),
            ])
        );
    }

    #[test]
    fn test_parse_resp3_null() {
        let result = parse_message(b"_\r\n").unwrap().unwrap();
        assert_eq!(result.0, RespValue::Null);
        assert_eq!(result.1, 3);
    }

    #[test]
    fn test_parse_resp3_double() {
        let result = parse_message(b",1.23\r\n").unwrap().unwrap();
        assert_eq!(result.0, RespValue::Double(1.23));
        let result = parse_message(b",-inf\r\n").unwrap().unwrap();
        assert_eq!(result.0, RespValue::Double(f64::NEG_INFINITY));
    }

    #[test]
    fn test_parse_resp3_boolean() {
        assert_eq!(
            parse_message(b"#t\r\n").unwrap().unwrap().0,
            RespValue::Boolean(true)
        );
        assert_eq!(
            parse_message(b"#f\r\n").unwrap().unwrap().0,
            RespValue::Boolean(false)
        );
        assert!(parse_message(b"#x\r\n").is_err());
    }

    #[test]
    fn test_parse_resp3_map() {
        let result = parse_message(b"%1\r\n+key\r\n:1\r\n").unwrap().unwrap();
        assert_eq!(
            result.0,
            RespValue::Map(vec![(
                RespValue::SimpleString("key".to_string()),
                RespValue::Integer(1)
            )])
        );
    }

    #[test]
    fn test_parse_resp3_set() {
        let result = parse_message(b"~2\r\n:1\r\n:2\r\n").unwrap().unwrap();
        assert_eq!(
            result.0,
            RespValue::Set(vec![RespValue::Integer(1), RespValue::Integer(2)])
        );
    }

    #[test]
    fn test_parse_resp3_push() {
        let result = parse_message(b">2\r\n+message\r\n+hi\r\n").unwrap().unwrap();
        assert!(matches!(result.0, RespValue::Push(ref v) if v.len() == 2));
    }

    #[test]
    fn test_parse_resp3_big_number() {
        let result = parse_message(b"(3492890328409238509324850943850\r\n")
            .unwrap()
            .unwrap();
        assert_eq!(
            result.0,
            RespValue::BigNumber("3492890328409238509324850943850".to_string())
        );
        assert!(parse_message(b"(12a\r\n").is_err());
    }

    #[test]
    fn test_parse_resp3_verbatim() {
        let result = parse_message(b"=15\r\ntxt:Some string\r\n").unwrap().unwrap();
        assert_eq!(
            result.0,
            RespValue::Verbatim {
                format: *b"txt",
                text: Bytes::from("Some string")
            }
        );
    }

    #[test]
    fn test_parse_inline_command() {
        let result = parse_message(b"PING hello\r\n").unwrap().unwrap();
        assert_eq!(
            result.0,
            RespValue::Array(vec![
                RespValue::Bulk(Bytes::from("PING")),
                RespValue::Bulk(Bytes::from("hello")),
            ])
        );
        assert_eq!(result.1, 12);
    }

    #[test]
    fn test_parse_invalid_integer() {
        let result = parse_message(b":not_a_number\r\n");
        assert!(matches!(result, Err(ParseError::InvalidInteger(_))));
    }

    #[test]
    fn test_roundtrip() {
        let original = RespValue::Array(vec![
            RespValue::bulk(Bytes::from("SET")),
            RespValue::bulk(Bytes::from("key")),
            RespValue::bulk(Bytes::from("value")),
        ]);

        let encoded = original.encode(RespVersion::Resp2);
        let (parsed, _) = parse_message(&encoded).unwrap().unwrap();
        assert_eq!(original, parsed);
    }

    #[test]
    fn test_resp3_roundtrip() {
        let original = RespValue::Map(vec![
            (
                RespValue::SimpleString("proto".to_string()),
                RespValue::Integer(3),
            ),
            (
                RespValue::SimpleString("flag".to_string()),
                RespValue::Boolean(false),
            ),
        ]);
        let encoded = original.encode(RespVersion::Resp3);
        let (parsed, _) = parse_message(&encoded).unwrap().unwrap();
        assert_eq!(original, parsed);
    }

    #[test]
    fn test_binary_safe_bulk_string() {
        let result = parse_message(b"$5\r\nhel\x00o\r\n").unwrap().unwrap();
        assert_eq!(result.0, RespValue::Bulk(Bytes::from(&b"hel\x00o"[..])));
    }

    #[test]
    fn test_pipelined_values_consume_exactly_one() {
        let input = b"+OK\r\n:1\r\n";
        let (first, consumed) = parse_message(input).unwrap().unwrap();
        assert_eq!(first, RespValue::SimpleString("OK".to_string()));
        let (second, _) = parse_message(&input[consumed..]).unwrap().unwrap();
        assert_eq!(second, RespValue::Integer(1));
    }
}
