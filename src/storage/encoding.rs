//! Binary-Safe Key and Field Encoding
//!
//! Keys and hash field names live in `text` columns so primary keys,
//! `LIKE` scans and NOTIFY payloads stay plain SQL, but Redis allows
//! arbitrary bytes in both. Names that are clean UTF-8 without NUL are
//! stored verbatim; anything else is stored as a reserved prefix plus
//! base64 of the raw bytes. A clean name that happens to *start* with the
//! reserved prefix is also encoded, so decoding is unambiguous.
//!
//! Value and member bytes are `bytea` columns and are never re-encoded.

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use bytes::Bytes;

/// Reserved marker for base64-encoded names. Starts with a control byte no
/// sane client uses at the start of a printable key.
const B64_PREFIX: &str = "\u{1}b64:";

/// Encodes raw name bytes into their stored text form.
pub fn encode_name(raw: &[u8]) -> String {
    if let Ok(s) = std::str::from_utf8(raw) {
        if !s.contains('\0') && !s.starts_with(B64_PREFIX) {
            return s.to_string();
        }
    }
    format!("{}{}", B64_PREFIX, BASE64.encode(raw))
}

/// Decodes a stored text form back into raw name bytes.
///
/// An undecodable payload after the prefix is returned verbatim; that can
/// only happen if the table was edited out-of-band.
pub fn decode_name(stored: &str) -> Bytes {
    match stored.strip_prefix(B64_PREFIX) {
        Some(encoded) => match BASE64.decode(encoded) {
            Ok(raw) => Bytes::from(raw),
            Err(_) => Bytes::copy_from_slice(stored.as_bytes()),
        },
        None => Bytes::copy_from_slice(stored.as_bytes()),
    }
}

/// Translates a Redis glob pattern into a SQL LIKE pattern: `*` becomes
/// `%`, `?` becomes `_`, and LIKE metacharacters in literal positions are
/// escaped with `\`.
pub fn glob_to_like(pattern: &[u8]) -> String {
    let mut out = String::with_capacity(pattern.len());
    for &b in pattern {
        match b {
            b'*' => out.push('%'),
            b'?' => out.push('_'),
            b'%' => out.push_str("\\%"),
            b'_' => out.push_str("\\_"),
            b'\\' => out.push_str("\\\\"),
            other => out.push(other as char),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_clean_names_are_identity() {
        assert_eq!(encode_name(b"user:101"), "user:101");
        assert_eq!(decode_name("user:101"), Bytes::from("user:101"));
    }

    #[test]
    fn test_nul_bytes_round_trip() {
        let raw = b"a\x00b";
        let stored = encode_name(raw);
        assert!(stored.starts_with('\u{1}'));
        assert_eq!(decode_name(&stored), Bytes::from(&raw[..]));
    }

    #[test]
    fn test_invalid_utf8_round_trips() {
        let raw = [0xff, 0xfe, 0x01];
        let stored = encode_name(&raw);
        assert_eq!(decode_name(&stored), Bytes::from(raw.to_vec()));
    }

    #[test]
    fn test_prefix_collision_is_escaped() {
        let tricky = format!("\u{1}b64:looks-encoded");
        let stored = encode_name(tricky.as_bytes());
        assert_ne!(stored, tricky);
        assert_eq!(decode_name(&stored), Bytes::from(tricky));
    }

    #[test]
    fn test_glob_to_like() {
        assert_eq!(glob_to_like(b"user:*"), "user:%");
        assert_eq!(glob_to_like(b"h?llo"), "h_llo");
        assert_eq!(glob_to_like(b"100%_done"), "100\\%\\_done");
        assert_eq!(glob_to_like(b"a\\b"), "a\\\\b");
    }
}
