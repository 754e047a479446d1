//! String Operations
//!
//! SQL-backed semantics for the string family: SET with its condition and
//! expiry options, the INCR/DECR group, APPEND, and byte-range reads and
//! writes. Multi-statement mutations assume the caller opened a
//! transaction; plain reads run on any client.

use crate::protocol::format_double;
use crate::storage::encoding::encode_name;
use crate::storage::error::StorageError;
use crate::storage::schema::LIVE;
use crate::storage::{
    check_type, current_expiry, key_type, purge_key, set_meta, KeyType,
};
use bytes::Bytes;
use chrono::{DateTime, Utc};
use tokio_postgres::GenericClient;

/// Conditional-set mode (`NX` / `XX`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SetCondition {
    #[default]
    Always,
    IfAbsent,
    IfPresent,
}

/// What a write does to the key's TTL.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Expiry {
    /// Clear any TTL (plain SET).
    #[default]
    Clear,
    /// Keep the current TTL (`KEEPTTL`, and every non-SET mutation).
    Keep,
    /// Expire this many milliseconds from now (`EX`/`PX`).
    InMillis(i64),
    /// Expire at this unix-epoch millisecond (`EXAT`/`PXAT`).
    AtMillis(i64),
}

/// Resolves an [`Expiry`] to a concrete instant using the database clock,
/// which is the only clock shared by every front-end.
pub async fn resolve_expiry<C: GenericClient>(
    client: &C,
    key: &[u8],
    expiry: Expiry,
) -> Result<Option<DateTime<Utc>>, StorageError> {
    match expiry {
        Expiry::Clear => Ok(None),
        Expiry::Keep => current_expiry(client, key).await,
        Expiry::InMillis(ms) => {
            let row = client
                .query_one(
                    "SELECT now() + make_interval(secs => $1::float8 / 1000.0)",
                    &[&(ms as f64)],
                )
                .await?;
            Ok(Some(row.get(0)))
        }
        Expiry::AtMillis(ms) => {
            let row = client
                .query_one("SELECT to_timestamp($1::float8 / 1000.0)", &[&(ms as f64)])
                .await?;
            Ok(Some(row.get(0)))
        }
    }
}

/// The result of a SET: whether it applied, and the prior value when the
/// caller asked for it (`GET` flag / GETSET).
#[derive(Debug)]
pub struct SetOutcome {
    pub applied: bool,
    pub old_value: Option<Bytes>,
}

/// SET with the full option surface. Runs inside a transaction.
pub async fn set<C: GenericClient>(
    client: &C,
    key: &[u8],
    value: &[u8],
    condition: SetCondition,
    expiry: Expiry,
    return_old: bool,
) -> Result<SetOutcome, StorageError> {
    let existing = key_type(client, key).await?;

    // The GET flag is only legal against a string (or absent) key
    if return_old && matches!(existing, Some(t) if t != KeyType::String) {
        return Err(StorageError::WrongType);
    }

    let old_value = if return_old && existing == Some(KeyType::String) {
        get_raw(client, key).await?
    } else {
        None
    };

    let blocked = match condition {
        SetCondition::Always => false,
        SetCondition::IfAbsent => existing.is_some(),
        SetCondition::IfPresent => existing.is_none(),
    };
    if blocked {
        return Ok(SetOutcome {
            applied: false,
            old_value,
        });
    }

    let expires_at = resolve_expiry(client, key, expiry).await?;

    // Retype: a SET over a non-string key replaces it wholesale
    if matches!(existing, Some(t) if t != KeyType::String) {
        purge_key(client, key).await?;
    }

    upsert_value(client, key, value, expires_at).await?;
    set_meta(client, key, KeyType::String, expires_at).await?;

    Ok(SetOutcome {
        applied: true,
        old_value,
    })
}

/// GET. Wrong-type keys fail; absent and expired keys read as nil.
pub async fn get<C: GenericClient>(
    client: &C,
    key: &[u8],
) -> Result<Option<Bytes>, StorageError> {
    if !check_type(client, key, KeyType::String).await? {
        return Ok(None);
    }
    get_raw(client, key).await
}

/// GET plus the remaining TTL in milliseconds, fetched in one statement.
/// The read path uses this to hand the cache policy a real TTL.
pub async fn get_with_ttl<C: GenericClient>(
    client: &C,
    key: &[u8],
) -> Result<Option<(Bytes, Option<i64>)>, StorageError> {
    if !check_type(client, key, KeyType::String).await? {
        return Ok(None);
    }
    let row = client
        .query_opt(
            &format!(
                "SELECT value, \
                        (EXTRACT(EPOCH FROM (expires_at - now())) * 1000.0)::bigint \
                 FROM kv_strings WHERE key = $1 AND {LIVE}"
            ),
            &[&encode_name(key)],
        )
        .await?;
    Ok(row.map(|r| (Bytes::from(r.get::<_, Vec<u8>>(0)), r.get(1))))
}

/// GETDEL. Runs inside a transaction.
pub async fn getdel<C: GenericClient>(
    client: &C,
    key: &[u8],
) -> Result<Option<Bytes>, StorageError> {
    if !check_type(client, key, KeyType::String).await? {
        return Ok(None);
    }
    let old = get_raw(client, key).await?;
    if old.is_some() {
        purge_key(client, key).await?;
    }
    Ok(old)
}

/// GETEX: read and optionally re-stamp the TTL. Runs inside a transaction.
pub async fn getex<C: GenericClient>(
    client: &C,
    key: &[u8],
    expiry: Option<Expiry>,
) -> Result<Option<Bytes>, StorageError> {
    if !check_type(client, key, KeyType::String).await? {
        return Ok(None);
    }
    let value = get_raw(client, key).await?;
    if value.is_some() {
        if let Some(expiry) = expiry {
            let expires_at = resolve_expiry(client, key, expiry).await?;
            let stored = encode_name(key);
            client
                .execute(
                    "UPDATE kv_strings SET expires_at = $2 WHERE key = $1",
                    &[&stored, &expires_at],
                )
                .await?;
            client
                .execute(
                    "UPDATE kv_meta SET expires_at = $2 WHERE key = $1",
                    &[&stored, &expires_at],
                )
                .await?;
        }
    }
    Ok(value)
}

/// MGET: one statement for the whole batch. Wrong-type and absent keys
/// both read as nil, matching Redis.
pub async fn mget<C: GenericClient>(
    client: &C,
    keys: &[Bytes],
) -> Result<Vec<Option<Bytes>>, StorageError> {
    let stored: Vec<String> = keys.iter().map(|k| encode_name(k)).collect();
    let rows = client
        .query(
            &format!("SELECT key, value FROM kv_strings WHERE key = ANY($1) AND {LIVE}"),
            &[&stored],
        )
        .await?;

    let mut found = std::collections::HashMap::with_capacity(rows.len());
    for row in rows {
        found.insert(row.get::<_, String>(0), Bytes::from(row.get::<_, Vec<u8>>(1)));
    }
    Ok(stored.iter().map(|k| found.get(k).cloned()).collect())
}

/// MSET. Runs inside a transaction; each key is retyped as needed.
pub async fn mset<C: GenericClient>(
    client: &C,
    pairs: &[(Bytes, Bytes)],
) -> Result<(), StorageError> {
    for (key, value) in pairs {
        let expires_at = match key_type(client, key).await? {
            Some(KeyType::String) | None => None,
            Some(_) => {
                purge_key(client, key).await?;
                None
            }
        };
        upsert_value(client, key, value, expires_at).await?;
        set_meta(client, key, KeyType::String, expires_at).await?;
    }
    Ok(())
}

/// INCR / INCRBY / DECR / DECRBY. Runs inside a transaction.
pub async fn incr_by<C: GenericClient>(
    client: &C,
    key: &[u8],
    delta: i64,
) -> Result<i64, StorageError> {
    let current = read_for_update(client, key).await?;
    let current = match current {
        Some(bytes) => parse_i64(&bytes)?,
        None => 0,
    };
    let next = current.checked_add(delta).ok_or(StorageError::Overflow)?;
    write_preserving_ttl(client, key, next.to_string().as_bytes()).await?;
    Ok(next)
}

/// INCRBYFLOAT. Returns the formatted new value. Runs inside a transaction.
pub async fn incr_by_float<C: GenericClient>(
    client: &C,
    key: &[u8],
    delta: f64,
) -> Result<String, StorageError> {
    let current = read_for_update(client, key).await?;
    let current = match current {
        Some(bytes) => parse_f64(&bytes)?,
        None => 0.0,
    };
    let next = current + delta;
    if !next.is_finite() {
        return Err(StorageError::Other(
            "increment would produce NaN or Infinity".to_string(),
        ));
    }
    let formatted = format_double(next);
    write_preserving_ttl(client, key, formatted.as_bytes()).await?;
    Ok(formatted)
}

/// APPEND. Returns the new length. Runs inside a transaction.
pub async fn append<C: GenericClient>(
    client: &C,
    key: &[u8],
    suffix: &[u8],
) -> Result<i64, StorageError> {
    let mut value = read_for_update(client, key).await?.unwrap_or_default().to_vec();
    value.extend_from_slice(suffix);
    let len = value.len() as i64;
    write_preserving_ttl(client, key, &value).await?;
    Ok(len)
}

/// STRLEN.
pub async fn strlen<C: GenericClient>(client: &C, key: &[u8]) -> Result<i64, StorageError> {
    if !check_type(client, key, KeyType::String).await? {
        return Ok(0);
    }
    let row = client
        .query_opt(
            &format!("SELECT octet_length(value)::bigint FROM kv_strings WHERE key = $1 AND {LIVE}"),
            &[&encode_name(key)],
        )
        .await?;
    Ok(row.map(|r| r.get(0)).unwrap_or(0))
}

/// GETRANGE with negative-offset normalization.
pub async fn getrange<C: GenericClient>(
    client: &C,
    key: &[u8],
    start: i64,
    stop: i64,
) -> Result<Bytes, StorageError> {
    let Some(value) = get(client, key).await? else {
        return Ok(Bytes::new());
    };
    match crate::storage::normalize_range(start, stop, value.len() as i64) {
        Some((a, b)) => Ok(value.slice(a as usize..b as usize)),
        None => Ok(Bytes::new()),
    }
}

/// SETRANGE: zero-pads to the offset when the value is shorter. Returns
/// the new length. Runs inside a transaction.
pub async fn setrange<C: GenericClient>(
    client: &C,
    key: &[u8],
    offset: usize,
    patch: &[u8],
) -> Result<i64, StorageError> {
    let mut value = read_for_update(client, key).await?.unwrap_or_default().to_vec();
    let end = offset + patch.len();
    if value.len() < end {
        value.resize(end, 0);
    }
    value[offset..end].copy_from_slice(patch);
    let len = value.len() as i64;
    if len > 0 {
        write_preserving_ttl(client, key, &value).await?;
    }
    Ok(len)
}

/// Reads the current string value after the type gate; shared by every
/// read-modify-write in this module and in [`crate::storage::bitmap`].
pub(crate) async fn read_for_update<C: GenericClient>(
    client: &C,
    key: &[u8],
) -> Result<Option<Bytes>, StorageError> {
    if !check_type(client, key, KeyType::String).await? {
        return Ok(None);
    }
    get_raw(client, key).await
}

/// Writes a string value, inheriting the key's current TTL. Shared with
/// the bitmap module. Runs inside a transaction.
pub(crate) async fn write_preserving_ttl<C: GenericClient>(
    client: &C,
    key: &[u8],
    value: &[u8],
) -> Result<(), StorageError> {
    let expires_at = current_expiry(client, key).await?;
    upsert_value(client, key, value, expires_at).await?;
    set_meta(client, key, KeyType::String, expires_at).await?;
    Ok(())
}

async fn get_raw<C: GenericClient>(
    client: &C,
    key: &[u8],
) -> Result<Option<Bytes>, StorageError> {
    let row = client
        .query_opt(
            &format!("SELECT value FROM kv_strings WHERE key = $1 AND {LIVE}"),
            &[&encode_name(key)],
        )
        .await?;
    Ok(row.map(|r| Bytes::from(r.get::<_, Vec<u8>>(0))))
}

async fn upsert_value<C: GenericClient>(
    client: &C,
    key: &[u8],
    value: &[u8],
    expires_at: Option<DateTime<Utc>>,
) -> Result<(), StorageError> {
    client
        .execute(
            "INSERT INTO kv_strings (key, value, expires_at) VALUES ($1, $2, $3) \
             ON CONFLICT (key) DO UPDATE \
             SET value = EXCLUDED.value, expires_at = EXCLUDED.expires_at",
            &[&encode_name(key), &value, &expires_at],
        )
        .await?;
    Ok(())
}

pub(crate) fn parse_i64(bytes: &[u8]) -> Result<i64, StorageError> {
    std::str::from_utf8(bytes)
        .ok()
        .and_then(|s| s.parse().ok())
        .ok_or(StorageError::NotInteger)
}

pub(crate) fn parse_f64(bytes: &[u8]) -> Result<f64, StorageError> {
    let value: f64 = std::str::from_utf8(bytes)
        .ok()
        .and_then(|s| s.parse().ok())
        .ok_or(StorageError::NotFloat)?;
    if value.is_finite() {
        Ok(value)
    } else {
        Err(StorageError::NotFloat)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_i64() {
        assert_eq!(parse_i64(b"42").unwrap(), 42);
        assert_eq!(parse_i64(b"-7").unwrap(), -7);
        assert!(matches!(parse_i64(b"4.2"), Err(StorageError::NotInteger)));
        assert!(matches!(parse_i64(b"abc"), Err(StorageError::NotInteger)));
        assert!(matches!(parse_i64(b"\xff"), Err(StorageError::NotInteger)));
    }

    #[test]
    fn test_parse_f64_rejects_non_finite() {
        assert_eq!(parse_f64(b"3.25").unwrap(), 3.25);
        assert!(matches!(parse_f64(b"nan"), Err(StorageError::NotFloat)));
        assert!(matches!(parse_f64(b"inf"), Err(StorageError::NotFloat)));
        assert!(matches!(parse_f64(b"x"), Err(StorageError::NotFloat)));
    }

    #[test]
    fn test_normalize_range() {
        use crate::storage::normalize_range;
        assert_eq!(normalize_range(0, -1, 5), Some((0, 5)));
        assert_eq!(normalize_range(1, 3, 5), Some((1, 4)));
        assert_eq!(normalize_range(-2, -1, 5), Some((3, 5)));
        assert_eq!(normalize_range(3, 1, 5), None);
        assert_eq!(normalize_range(10, 20, 5), None);
        assert_eq!(normalize_range(0, 0, 0), None);
        assert_eq!(normalize_range(-100, 100, 5), Some((0, 5)));
    }
}
