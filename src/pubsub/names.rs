//! Database Channel Naming
//!
//! PostgreSQL caps LISTEN/NOTIFY channel names at 63 bytes and requires
//! text, while Redis channels and keys are arbitrary byte strings. This
//! module maps between the two worlds:
//!
//! - a client channel that fits (clean UTF-8, NUL-free, <= 63 bytes) is
//!   used verbatim as the database channel;
//! - anything else becomes `h_<40-hex>` from SHA-1 of the raw name;
//! - keyspace channels (`__keyspace@0__:<key>`) truncate the key and
//!   append an 8-hex hash suffix when the full name would not fit;
//! - when a channel was hashed, or the message itself is not NUL-free
//!   UTF-8, the NOTIFY payload is wrapped as `\x1EPKW:<base64(json)>` so
//!   receivers can recover the original channel name and raw bytes.
//!
//! Hash-suffixed keyspace channels can collide across distinct keys in
//! theory; BRPOP/BLPOP tolerate the spurious wakeup because they re-check
//! the list under a transaction before replying.

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use sha1::{Digest, Sha1};

/// PostgreSQL's channel identifier limit (NAMEDATALEN - 1).
pub const PG_CHANNEL_MAX: usize = 63;

/// Fixed channel for distributed cache invalidation.
pub const CACHE_INVALIDATE_CHANNEL: &str = "postkeys_cache_invalidate";

/// Prefix for per-key list push notifications.
const KEYSPACE_PREFIX: &str = "__keyspace@0__:";

/// Marker that a NOTIFY payload is wrapped.
const WRAP_MARKER: &str = "\x1ePKW:";

/// A database channel name plus whether the original had to be hashed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DbChannel {
    pub name: String,
    pub hashed: bool,
}

/// Maps a client-facing pub/sub channel to its database channel.
pub fn db_channel(channel: &[u8]) -> DbChannel {
    if channel.len() <= PG_CHANNEL_MAX {
        if let Ok(name) = std::str::from_utf8(channel) {
            if !name.contains('\0') {
                return DbChannel {
                    name: name.to_string(),
                    hashed: false,
                };
            }
        }
    }
    DbChannel {
        name: format!("h_{}", hex_digest(channel)),
        hashed: true,
    }
}

/// Maps a key to its keyspace notification channel.
pub fn keyspace_channel(key: &[u8]) -> String {
    if KEYSPACE_PREFIX.len() + key.len() <= PG_CHANNEL_MAX {
        if let Ok(text) = std::str::from_utf8(key) {
            if !text.contains('\0') {
                return format!("{}{}", KEYSPACE_PREFIX, text);
            }
        }
    }

    // Truncate to a clean prefix and disambiguate with a short hash so the
    // name stays within the limit: prefix + key-head + ':' + 8 hex.
    let budget = PG_CHANNEL_MAX - KEYSPACE_PREFIX.len() - 1 - 8;
    let head: String = key
        .iter()
        .take(budget)
        .map(|&b| {
            if b.is_ascii_graphic() && b != b':' {
                b as char
            } else {
                '_'
            }
        })
        .collect();
    let suffix = &hex_digest(key)[..8];
    format!("{}{}:{}", KEYSPACE_PREFIX, head, suffix)
}

/// Wrapped payload body: channel and message, both base64 so arbitrary
/// bytes survive the text-only NOTIFY hop.
#[derive(Debug, Serialize, Deserialize)]
struct WrappedPayload {
    c: String,
    m: String,
}

/// Builds the NOTIFY payload for a PUBLISH, wrapping when needed.
pub fn publish_payload(channel: &[u8], message: &[u8], hashed: bool) -> String {
    let clean_message = std::str::from_utf8(message)
        .map(|s| !s.contains('\0'))
        .unwrap_or(false);

    if !hashed && clean_message {
        // Safe to ship raw; the receiver resolves the channel by name.
        return String::from_utf8(message.to_vec()).unwrap_or_default();
    }

    let body = WrappedPayload {
        c: BASE64.encode(channel),
        m: BASE64.encode(message),
    };
    let json = serde_json::to_string(&body).unwrap_or_default();
    format!("{}{}", WRAP_MARKER, BASE64.encode(json.as_bytes()))
}

/// Unwraps a NOTIFY payload. Returns the original channel (when the
/// payload was wrapped) and the raw message bytes.
pub fn unwrap_payload(payload: &str) -> (Option<Bytes>, Bytes) {
    let Some(encoded) = payload.strip_prefix(WRAP_MARKER) else {
        return (None, Bytes::copy_from_slice(payload.as_bytes()));
    };

    let unwrapped = BASE64
        .decode(encoded)
        .ok()
        .and_then(|json| serde_json::from_slice::<WrappedPayload>(&json).ok())
        .and_then(|body| {
            let channel = BASE64.decode(&body.c).ok()?;
            let message = BASE64.decode(&body.m).ok()?;
            Some((Bytes::from(channel), Bytes::from(message)))
        });

    match unwrapped {
        Some((channel, message)) => (Some(channel), message),
        // Malformed wrapper: deliver the payload as-is rather than drop it
        None => (None, Bytes::copy_from_slice(payload.as_bytes())),
    }
}

/// Transaction-scoped advisory lock key for list pushes on `key`.
///
/// Derived from SHA-1 under a fixed namespace tag so the value is stable
/// across front-ends and cannot collide with future lock families.
pub fn list_lock_key(key: &[u8]) -> i64 {
    let mut hasher = Sha1::new();
    hasher.update(b"postkeys:list:");
    hasher.update(key);
    let digest = hasher.finalize();
    i64::from_be_bytes(digest[..8].try_into().unwrap())
}

fn hex_digest(input: &[u8]) -> String {
    let digest = Sha1::digest(input);
    let mut out = String::with_capacity(40);
    for b in digest {
        out.push_str(&format!("{:02x}", b));
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_short_channel_is_identity() {
        let ch = db_channel(b"news.tech");
        assert_eq!(ch.name, "news.tech");
        assert!(!ch.hashed);
    }

    #[test]
    fn test_long_channel_is_hashed() {
        let long = vec![b'c'; 200];
        let ch = db_channel(&long);
        assert!(ch.hashed);
        assert!(ch.name.starts_with("h_"));
        assert_eq!(ch.name.len(), 2 + 40);
        assert!(ch.name.len() <= PG_CHANNEL_MAX);
        // Deterministic
        assert_eq!(db_channel(&long), ch);
    }

    #[test]
    fn test_binary_channel_is_hashed() {
        let ch = db_channel(b"bin\x00chan");
        assert!(ch.hashed);
    }

    #[test]
    fn test_sixty_three_byte_boundary() {
        let at_limit = vec![b'a'; 63];
        assert!(!db_channel(&at_limit).hashed);
        let over = vec![b'a'; 64];
        assert!(db_channel(&over).hashed);
    }

    #[test]
    fn test_keyspace_channel_short_key() {
        assert_eq!(keyspace_channel(b"queue"), "__keyspace@0__:queue");
    }

    #[test]
    fn test_keyspace_channel_long_key_fits_limit() {
        let long = vec![b'k'; 200];
        let name = keyspace_channel(&long);
        assert!(name.len() <= PG_CHANNEL_MAX);
        assert!(name.starts_with("__keyspace@0__:"));
        // Distinct keys with the same head stay distinct via the suffix
        let mut other = long.clone();
        *other.last_mut().unwrap() = b'x';
        assert_ne!(name, keyspace_channel(&other));
    }

    #[test]
    fn test_plain_payload_round_trip() {
        let payload = publish_payload(b"chan", b"hello", false);
        assert_eq!(payload, "hello");
        let (channel, message) = unwrap_payload(&payload);
        assert!(channel.is_none());
        assert_eq!(message, Bytes::from("hello"));
    }

    #[test]
    fn test_hashed_channel_payload_round_trip() {
        let long: Vec<u8> = vec![b'c'; 200];
        let payload = publish_payload(&long, b"hello", true);
        assert!(payload.starts_with("\x1ePKW:"));
        let (channel, message) = unwrap_payload(&payload);
        assert_eq!(channel, Some(Bytes::from(long)));
        assert_eq!(message, Bytes::from("hello"));
    }

    #[test]
    fn test_binary_message_gets_wrapped() {
        let payload = publish_payload(b"chan", b"a\x00b", false);
        assert!(payload.starts_with("\x1ePKW:"));
        let (channel, message) = unwrap_payload(&payload);
        assert_eq!(channel, Some(Bytes::from("chan")));
        assert_eq!(message, Bytes::from(&b"a\x00b"[..]));
    }

    #[test]
    fn test_malformed_wrapper_is_delivered_raw() {
        let (channel, message) = unwrap_payload("\x1ePKW:!!!not-base64");
        assert!(channel.is_none());
        assert_eq!(message, Bytes::from("\x1ePKW:!!!not-base64"));
    }

    #[test]
    fn test_list_lock_key_stable_and_distinct() {
        assert_eq!(list_lock_key(b"queue"), list_lock_key(b"queue"));
        assert_ne!(list_lock_key(b"queue"), list_lock_key(b"queue2"));
    }
}
