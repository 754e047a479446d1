//! RESP (Redis Serialization Protocol) Data Types
//!
//! This module defines the value union shared by the decoder and encoder.
//! RESP2 covers the five classic types; RESP3 adds maps, sets, doubles,
//! booleans, big numbers, verbatim strings, a first-class null, and push
//! frames for out-of-band delivery.
//!
//! Encoding is version-aware: the same [`RespValue`] renders differently
//! depending on the protocol version a session negotiated via `HELLO`.
//! RESP3-only shapes degrade to their RESP2 equivalents (a map becomes a
//! flat array, a boolean becomes `:0`/`:1`, and so on), so command code can
//! build one reply and let the session's version decide the wire form.
//!
//! ## Examples
//!
//! Simple String: `+OK\r\n`
//! Error: `-ERR unknown command\r\n`
//! Integer: `:1000\r\n`
//! Bulk String: `$5\r\nhello\r\n`
//! Array: `*2\r\n$3\r\nGET\r\n$4\r\nname\r\n`
//! RESP3 Null: `_\r\n`
//! RESP3 Map: `%1\r\n+key\r\n+value\r\n`

use bytes::Bytes;
use std::fmt;

/// The CRLF terminator used in RESP protocol
pub const CRLF: &[u8] = b"\r\n";

/// RESP protocol type prefixes
pub mod prefix {
    pub const SIMPLE_STRING: u8 = b'+';
    pub const ERROR: u8 = b'-';
    pub const INTEGER: u8 = b':';
    pub const BULK_STRING: u8 = b'$';
    pub const ARRAY: u8 = b'*';
    // RESP3
    pub const NULL: u8 = b'_';
    pub const DOUBLE: u8 = b',';
    pub const BOOLEAN: u8 = b'#';
    pub const BIG_NUMBER: u8 = b'(';
    pub const VERBATIM: u8 = b'=';
    pub const MAP: u8 = b'%';
    pub const SET: u8 = b'~';
    pub const PUSH: u8 = b'>';
}

/// Protocol version negotiated per session via `HELLO`.
///
/// Every session starts at RESP2; `HELLO 3` upgrades it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RespVersion {
    #[default]
    Resp2,
    Resp3,
}

impl RespVersion {
    pub fn as_number(self) -> i64 {
        match self {
            RespVersion::Resp2 => 2,
            RespVersion::Resp3 => 3,
        }
    }

    pub fn from_number(n: i64) -> Option<Self> {
        match n {
            2 => Some(RespVersion::Resp2),
            3 => Some(RespVersion::Resp3),
            _ => None,
        }
    }
}

/// A value in the RESP protocol, covering RESP2 and RESP3 shapes.
#[derive(Debug, Clone, PartialEq)]
pub enum RespValue {
    /// Non-binary-safe string without CRLF. Format: `+<string>\r\n`
    SimpleString(String),

    /// Error reply. Format: `-<KIND> <message>\r\n`
    Error(String),

    /// 64-bit signed integer. Format: `:<integer>\r\n`
    Integer(i64),

    /// Binary-safe string. Format: `$<length>\r\n<data>\r\n`
    Bulk(Bytes),

    /// Null bulk string (`$-1\r\n` in RESP2, `_\r\n` in RESP3).
    Null,

    /// Null array (`*-1\r\n` in RESP2, `_\r\n` in RESP3). Kept distinct from
    /// [`RespValue::Null`] because an aborted EXEC replies with a nil *array*.
    NullArray,

    /// Array of values. Format: `*<count>\r\n<elements...>`
    Array(Vec<RespValue>),

    /// RESP3 map; degrades to a flat key/value array on RESP2.
    Map(Vec<(RespValue, RespValue)>),

    /// RESP3 set; degrades to an array on RESP2.
    Set(Vec<RespValue>),

    /// RESP3 double; degrades to a bulk string on RESP2.
    Double(f64),

    /// RESP3 boolean; degrades to `:1`/`:0` on RESP2.
    Boolean(bool),

    /// RESP3 big number, carried as its decimal text.
    BigNumber(String),

    /// RESP3 verbatim string with a 3-byte format tag (`txt`, `mkd`).
    Verbatim { format: [u8; 3], text: Bytes },

    /// RESP3 push frame (pub/sub delivery); degrades to an array on RESP2.
    Push(Vec<RespValue>),
}

impl RespValue {
    pub fn simple_string(s: impl Into<String>) -> Self {
        RespValue::SimpleString(s.into())
    }

    pub fn error(s: impl Into<String>) -> Self {
        RespValue::Error(s.into())
    }

    pub fn integer(n: i64) -> Self {
        RespValue::Integer(n)
    }

    pub fn bulk(data: impl Into<Bytes>) -> Self {
        RespValue::Bulk(data.into())
    }

    /// Bulk string from anything stringly; used for numeric replies that
    /// RESP2 renders as text (INCRBYFLOAT, ZSCORE).
    pub fn bulk_from_string(s: impl Into<String>) -> Self {
        RespValue::Bulk(Bytes::from(s.into()))
    }

    pub fn array(values: Vec<RespValue>) -> Self {
        RespValue::Array(values)
    }

    pub fn ok() -> Self {
        RespValue::SimpleString("OK".to_string())
    }

    pub fn pong() -> Self {
        RespValue::SimpleString("PONG".to_string())
    }

    /// Serializes to a fresh buffer. See [`RespValue::encode_into`].
    pub fn encode(&self, version: RespVersion) -> Vec<u8> {
        let mut buf = Vec::new();
        self.encode_into(&mut buf, version);
        buf
    }

    /// Serializes the value into `buf` in the given protocol version.
    ///
    /// The encoder writes a value whole; interleaving protection (the
    /// session write mutex) is the caller's job.
    pub fn encode_into(&self, buf: &mut Vec<u8>, version: RespVersion) {
        match self {
            RespValue::SimpleString(s) => {
                buf.push(prefix::SIMPLE_STRING);
                buf.extend_from_slice(s.as_bytes());
                buf.extend_from_slice(CRLF);
            }
            RespValue::Error(s) => {
                buf.push(prefix::ERROR);
                buf.extend_from_slice(s.as_bytes());
                buf.extend_from_slice(CRLF);
            }
            RespValue::Integer(n) => {
                buf.push(prefix::INTEGER);
                buf.extend_from_slice(n.to_string().as_bytes());
                buf.extend_from_slice(CRLF);
            }
            RespValue::Bulk(data) => {
                buf.push(prefix::BULK_STRING);
                buf.extend_from_slice(data.len().to_string().as_bytes());
                buf.extend_from_slice(CRLF);
                buf.extend_from_slice(data);
                buf.extend_from_slice(CRLF);
            }
            RespValue::Null => match version {
                RespVersion::Resp2 => buf.extend_from_slice(b"$-1\r\n"),
                RespVersion::Resp3 => {
                    buf.push(prefix::NULL);
                    buf.extend_from_slice(CRLF);
                }
            },
            RespValue::NullArray => match version {
                RespVersion::Resp2 => buf.extend_from_slice(b"*-1\r\n"),
                RespVersion::Resp3 => {
                    buf.push(prefix::NULL);
                    buf.extend_from_slice(CRLF);
                }
            },
            RespValue::Array(values) => {
                buf.push(prefix::ARRAY);
                buf.extend_from_slice(values.len().to_string().as_bytes());
                buf.extend_from_slice(CRLF);
                for value in values {
                    value.encode_into(buf, version);
                }
            }
            RespValue::Map(pairs) => {
                match version {
                    RespVersion::Resp2 => {
                        buf.push(prefix::ARRAY);
                        buf.extend_from_slice((pairs.len() * 2).to_string().as_bytes());
                    }
                    RespVersion::Resp3 => {
                        buf.push(prefix::MAP);
                        buf.extend_from_slice(pairs.len().to_string().as_bytes());
                    }
                }
                buf.extend_from_slice(CRLF);
                for (k, v) in pairs {
                    k.encode_into(buf, version);
                    v.encode_into(buf, version);
                }
            }
            RespValue::Set(values) => {
                match version {
                    RespVersion::Resp2 => buf.push(prefix::ARRAY),
                    RespVersion::Resp3 => buf.push(prefix::SET),
                }
                buf.extend_from_slice(values.len().to_string().as_bytes());
                buf.extend_from_slice(CRLF);
                for value in values {
                    value.encode_into(buf, version);
                }
            }
            RespValue::Double(d) => match version {
                RespVersion::Resp2 => {
                    RespValue::bulk_from_string(format_double(*d)).encode_into(buf, version)
                }
                RespVersion::Resp3 => {
                    buf.push(prefix::DOUBLE);
                    buf.extend_from_slice(format_double(*d).as_bytes());
                    buf.extend_from_slice(CRLF);
                }
            },
            RespValue::Boolean(b) => match version {
                RespVersion::Resp2 => RespValue::Integer(i64::from(*b)).encode_into(buf, version),
                RespVersion::Resp3 => {
                    buf.push(prefix::BOOLEAN);
                    buf.push(if *b { b't' } else { b'f' });
                    buf.extend_from_slice(CRLF);
                }
            },
            RespValue::BigNumber(s) => match version {
                RespVersion::Resp2 => {
                    RespValue::bulk_from_string(s.clone()).encode_into(buf, version)
                }
                RespVersion::Resp3 => {
                    buf.push(prefix::BIG_NUMBER);
                    buf.extend_from_slice(s.as_bytes());
                    buf.extend_from_slice(CRLF);
                }
            },
            RespValue::Verbatim { format, text } => match version {
                RespVersion::Resp2 => RespValue::Bulk(text.clone()).encode_into(buf, version),
                RespVersion::Resp3 => {
                    buf.push(prefix::VERBATIM);
                    buf.extend_from_slice((text.len() + 4).to_string().as_bytes());
                    buf.extend_from_slice(CRLF);
                    buf.extend_from_slice(format);
                    buf.push(b':');
                    buf.extend_from_slice(text);
                    buf.extend_from_slice(CRLF);
                }
            },
            RespValue::Push(values) => {
                match version {
                    RespVersion::Resp2 => buf.push(prefix::ARRAY),
                    RespVersion::Resp3 => buf.push(prefix::PUSH),
                }
                buf.extend_from_slice(values.len().to_string().as_bytes());
                buf.extend_from_slice(CRLF);
                for value in values {
                    value.encode_into(buf, version);
                }
            }
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, RespValue::Null | RespValue::NullArray)
    }

    pub fn is_error(&self) -> bool {
        matches!(self, RespValue::Error(_))
    }

    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            RespValue::Bulk(b) => Some(b),
            _ => None,
        }
    }

    pub fn as_array(&self) -> Option<&[RespValue]> {
        match self {
            RespValue::Array(arr) => Some(arr),
            _ => None,
        }
    }

    pub fn into_array(self) -> Option<Vec<RespValue>> {
        match self {
            RespValue::Array(arr) => Some(arr),
            _ => None,
        }
    }
}

/// Formats a double the way Redis renders scores: integral values lose the
/// decimal point, infinities become `inf`/`-inf`.
pub fn format_double(d: f64) -> String {
    if d.is_infinite() {
        if d > 0.0 {
            "inf".to_string()
        } else {
            "-inf".to_string()
        }
    } else if d == d.trunc() && d.abs() < 1e17 {
        format!("{}", d as i64)
    } else {
        format!("{}", d)
    }
}

impl fmt::Display for RespValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RespValue::SimpleString(s) => write!(f, "\"{}\"", s),
            RespValue::Error(s) => write!(f, "(error) {}", s),
            RespValue::Integer(n) => write!(f, "(integer) {}", n),
            RespValue::Bulk(data) => {
                if let Ok(s) = std::str::from_utf8(data) {
                    write!(f, "\"{}\"", s)
                } else {
                    write!(f, "(binary data, {} bytes)", data.len())
                }
            }
            RespValue::Null | RespValue::NullArray => write!(f, "(nil)"),
            RespValue::Array(values) | RespValue::Set(values) | RespValue::Push(values) => {
                if values.is_empty() {
                    write!(f, "(empty array)")
                } else {
                    writeln!(f)?;
                    for (i, v) in values.iter().enumerate() {
                        writeln!(f, "{}) {}", i + 1, v)?;
                    }
                    Ok(())
                }
            }
            RespValue::Map(pairs) => {
                writeln!(f)?;
                for (k, v) in pairs {
                    writeln!(f, "{} => {}", k, v)?;
                }
                Ok(())
            }
            RespValue::Double(d) => write!(f, "(double) {}", format_double(*d)),
            RespValue::Boolean(b) => write!(f, "({})", if *b { "true" } else { "false" }),
            RespValue::BigNumber(s) => write!(f, "(big number) {}", s),
            RespValue::Verbatim { text, .. } => {
                write!(f, "\"{}\"", String::from_utf8_lossy(text))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn enc2(v: &RespValue) -> Vec<u8> {
        v.encode(RespVersion::Resp2)
    }

    fn enc3(v: &RespValue) -> Vec<u8> {
        v.encode(RespVersion::Resp3)
    }

    #[test]
    fn test_simple_string_encode() {
        assert_eq!(enc2(&RespValue::ok()), b"+OK\r\n");
    }

    #[test]
    fn test_error_encode() {
        let value = RespValue::error("ERR unknown command");
        assert_eq!(enc2(&value), b"-ERR unknown command\r\n");
    }

    #[test]
    fn test_integer_encode() {
        assert_eq!(enc2(&RespValue::integer(1000)), b":1000\r\n");
        assert_eq!(enc2(&RespValue::integer(-42)), b":-42\r\n");
    }

    #[test]
    fn test_bulk_encode() {
        let value = RespValue::bulk(Bytes::from("hello"));
        assert_eq!(enc2(&value), b"$5\r\nhello\r\n");
    }

    #[test]
    fn test_null_encodes_per_version() {
        assert_eq!(enc2(&RespValue::Null), b"$-1\r\n");
        assert_eq!(enc3(&RespValue::Null), b"_\r\n");
        assert_eq!(enc2(&RespValue::NullArray), b"*-1\r\n");
        assert_eq!(enc3(&RespValue::NullArray), b"_\r\n");
    }

    #[test]
    fn test_array_encode() {
        let value = RespValue::array(vec![
            RespValue::bulk(Bytes::from("GET")),
            RespValue::bulk(Bytes::from("name")),
        ]);
        assert_eq!(enc2(&value), b"*2\r\n$3\r\nGET\r\n$4\r\nname\r\n");
    }

    #[test]
    fn test_map_degrades_to_flat_array_on_resp2() {
        let value = RespValue::Map(vec![(
            RespValue::simple_string("server"),
            RespValue::simple_string("postkeys"),
        )]);
        assert_eq!(enc2(&value), b"*2\r\n+server\r\n+postkeys\r\n");
        assert_eq!(enc3(&value), b"%1\r\n+server\r\n+postkeys\r\n");
    }

    #[test]
    fn test_set_encode() {
        let value = RespValue::Set(vec![RespValue::bulk(Bytes::from("a"))]);
        assert_eq!(enc2(&value), b"*1\r\n$1\r\na\r\n");
        assert_eq!(enc3(&value), b"~1\r\n$1\r\na\r\n");
    }

    #[test]
    fn test_double_encode() {
        assert_eq!(enc3(&RespValue::Double(1.5)), b",1.5\r\n");
        assert_eq!(enc3(&RespValue::Double(3.0)), b",3\r\n");
        assert_eq!(enc3(&RespValue::Double(f64::INFINITY)), b",inf\r\n");
        assert_eq!(enc2(&RespValue::Double(1.5)), b"$3\r\n1.5\r\n");
    }

    #[test]
    fn test_boolean_encode() {
        assert_eq!(enc3(&RespValue::Boolean(true)), b"#t\r\n");
        assert_eq!(enc3(&RespValue::Boolean(false)), b"#f\r\n");
        assert_eq!(enc2(&RespValue::Boolean(true)), b":1\r\n");
    }

    #[test]
    fn test_big_number_encode() {
        let value = RespValue::BigNumber("3492890328409238509324850943850".to_string());
        assert_eq!(enc3(&value), b"(3492890328409238509324850943850\r\n");
        assert_eq!(enc2(&value), b"$31\r\n3492890328409238509324850943850\r\n");
    }

    #[test]
    fn test_verbatim_encode() {
        let value = RespValue::Verbatim {
            format: *b"txt",
            text: Bytes::from("Some string"),
        };
        assert_eq!(enc3(&value), b"=15\r\ntxt:Some string\r\n");
        assert_eq!(enc2(&value), b"$11\r\nSome string\r\n");
    }

    #[test]
    fn test_push_encode() {
        let value = RespValue::Push(vec![
            RespValue::bulk(Bytes::from("message")),
            RespValue::bulk(Bytes::from("chan")),
            RespValue::bulk(Bytes::from("payload")),
        ]);
        assert!(enc3(&value).starts_with(b">3\r\n"));
        assert!(enc2(&value).starts_with(b"*3\r\n"));
    }

    #[test]
    fn test_format_double() {
        assert_eq!(format_double(3.0), "3");
        assert_eq!(format_double(-0.5), "-0.5");
        assert_eq!(format_double(f64::NEG_INFINITY), "-inf");
    }
}
