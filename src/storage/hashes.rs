//! Hash Operations
//!
//! Hashes are `(key, field) -> value` rows. Field names go through the
//! binary-safe text encoding; values stay raw bytea. New rows inherit the
//! key's current TTL so the janitor's per-table scans stay index-driven.
//!
//! HSET reports the number of *newly created* fields, computed by counting
//! the pre-existing ones before the batch upsert.

use crate::protocol::format_double;
use crate::storage::encoding::{decode_name, encode_name};
use crate::storage::error::StorageError;
use crate::storage::schema::LIVE;
use crate::storage::strings::{parse_f64, parse_i64};
use crate::storage::{
    check_type, current_expiry, delete_meta_if_empty, upsert_meta, KeyType,
};
use bytes::Bytes;
use tokio_postgres::GenericClient;

/// HSET / HMSET. Returns the number of fields that did not exist before.
/// Runs inside a transaction.
pub async fn hset<C: GenericClient>(
    client: &C,
    key: &[u8],
    pairs: &[(Bytes, Bytes)],
) -> Result<i64, StorageError> {
    check_type(client, key, KeyType::Hash).await?;

    // Later duplicates win; count distinct fields for the newness math
    let mut fields: Vec<String> = Vec::new();
    for (field, _) in pairs {
        let stored = encode_name(field);
        if !fields.contains(&stored) {
            fields.push(stored);
        }
    }

    let existing: i64 = client
        .query_one(
            &format!(
                "SELECT COUNT(*) FROM kv_hashes \
                 WHERE key = $1 AND field = ANY($2) AND {LIVE}"
            ),
            &[&encode_name(key), &fields],
        )
        .await?
        .get(0);

    let expires_at = current_expiry(client, key).await?;
    for (field, value) in pairs {
        client
            .execute(
                "INSERT INTO kv_hashes (key, field, value, expires_at) \
                 VALUES ($1, $2, $3, $4) \
                 ON CONFLICT (key, field) DO UPDATE \
                 SET value = EXCLUDED.value, expires_at = EXCLUDED.expires_at",
                &[&encode_name(key), &encode_name(field), &&value[..], &expires_at],
            )
            .await?;
    }
    upsert_meta(client, key, KeyType::Hash).await?;

    Ok(fields.len() as i64 - existing)
}

/// HSETNX. Runs inside a transaction.
pub async fn hsetnx<C: GenericClient>(
    client: &C,
    key: &[u8],
    field: &[u8],
    value: &[u8],
) -> Result<bool, StorageError> {
    check_type(client, key, KeyType::Hash).await?;
    if hget(client, key, field).await?.is_some() {
        return Ok(false);
    }
    hset(client, key, &[(Bytes::copy_from_slice(field), Bytes::copy_from_slice(value))])
        .await?;
    Ok(true)
}

pub async fn hget<C: GenericClient>(
    client: &C,
    key: &[u8],
    field: &[u8],
) -> Result<Option<Bytes>, StorageError> {
    if !check_type(client, key, KeyType::Hash).await? {
        return Ok(None);
    }
    let row = client
        .query_opt(
            &format!("SELECT value FROM kv_hashes WHERE key = $1 AND field = $2 AND {LIVE}"),
            &[&encode_name(key), &encode_name(field)],
        )
        .await?;
    Ok(row.map(|r| Bytes::from(r.get::<_, Vec<u8>>(0))))
}

pub async fn hmget<C: GenericClient>(
    client: &C,
    key: &[u8],
    fields: &[Bytes],
) -> Result<Vec<Option<Bytes>>, StorageError> {
    if !check_type(client, key, KeyType::Hash).await? {
        return Ok(vec![None; fields.len()]);
    }
    let stored: Vec<String> = fields.iter().map(|f| encode_name(f)).collect();
    let rows = client
        .query(
            &format!(
                "SELECT field, value FROM kv_hashes \
                 WHERE key = $1 AND field = ANY($2) AND {LIVE}"
            ),
            &[&encode_name(key), &stored],
        )
        .await?;
    let mut found = std::collections::HashMap::with_capacity(rows.len());
    for row in rows {
        found.insert(row.get::<_, String>(0), Bytes::from(row.get::<_, Vec<u8>>(1)));
    }
    Ok(stored.iter().map(|f| found.get(f).cloned()).collect())
}

/// HGETALL. Field order is unspecified; rows come back in field order for
/// determinism in tests.
pub async fn hgetall<C: GenericClient>(
    client: &C,
    key: &[u8],
) -> Result<Vec<(Bytes, Bytes)>, StorageError> {
    if !check_type(client, key, KeyType::Hash).await? {
        return Ok(Vec::new());
    }
    let rows = client
        .query(
            &format!(
                "SELECT field, value FROM kv_hashes \
                 WHERE key = $1 AND {LIVE} ORDER BY field"
            ),
            &[&encode_name(key)],
        )
        .await?;
    Ok(rows
        .into_iter()
        .map(|r| {
            (
                decode_name(r.get::<_, &str>(0)),
                Bytes::from(r.get::<_, Vec<u8>>(1)),
            )
        })
        .collect())
}

pub async fn hkeys<C: GenericClient>(client: &C, key: &[u8]) -> Result<Vec<Bytes>, StorageError> {
    Ok(hgetall(client, key).await?.into_iter().map(|(f, _)| f).collect())
}

pub async fn hvals<C: GenericClient>(client: &C, key: &[u8]) -> Result<Vec<Bytes>, StorageError> {
    Ok(hgetall(client, key).await?.into_iter().map(|(_, v)| v).collect())
}

pub async fn hlen<C: GenericClient>(client: &C, key: &[u8]) -> Result<i64, StorageError> {
    if !check_type(client, key, KeyType::Hash).await? {
        return Ok(0);
    }
    let row = client
        .query_one(
            &format!("SELECT COUNT(*) FROM kv_hashes WHERE key = $1 AND {LIVE}"),
            &[&encode_name(key)],
        )
        .await?;
    Ok(row.get(0))
}

pub async fn hexists<C: GenericClient>(
    client: &C,
    key: &[u8],
    field: &[u8],
) -> Result<bool, StorageError> {
    Ok(hget(client, key, field).await?.is_some())
}

pub async fn hstrlen<C: GenericClient>(
    client: &C,
    key: &[u8],
    field: &[u8],
) -> Result<i64, StorageError> {
    Ok(hget(client, key, field)
        .await?
        .map(|v| v.len() as i64)
        .unwrap_or(0))
}

/// HDEL. Returns the number of removed fields; drops the meta row when the
/// hash empties. Runs inside a transaction.
pub async fn hdel<C: GenericClient>(
    client: &C,
    key: &[u8],
    fields: &[Bytes],
) -> Result<i64, StorageError> {
    if !check_type(client, key, KeyType::Hash).await? {
        return Ok(0);
    }
    let stored: Vec<String> = fields.iter().map(|f| encode_name(f)).collect();
    let removed = client
        .execute(
            &format!("DELETE FROM kv_hashes WHERE key = $1 AND field = ANY($2) AND {LIVE}"),
            &[&encode_name(key), &stored],
        )
        .await? as i64;
    if removed > 0 {
        delete_meta_if_empty(client, key, KeyType::Hash).await?;
    }
    Ok(removed)
}

/// HINCRBY. Runs inside a transaction.
pub async fn hincrby<C: GenericClient>(
    client: &C,
    key: &[u8],
    field: &[u8],
    delta: i64,
) -> Result<i64, StorageError> {
    let current = match hget(client, key, field).await? {
        Some(v) => parse_i64(&v)?,
        None => 0,
    };
    let next = current.checked_add(delta).ok_or(StorageError::Overflow)?;
    hset(
        client,
        key,
        &[(
            Bytes::copy_from_slice(field),
            Bytes::from(next.to_string()),
        )],
    )
    .await?;
    Ok(next)
}

/// HINCRBYFLOAT. Returns the formatted new value. Runs inside a transaction.
pub async fn hincrbyfloat<C: GenericClient>(
    client: &C,
    key: &[u8],
    field: &[u8],
    delta: f64,
) -> Result<String, StorageError> {
    let current = match hget(client, key, field).await? {
        Some(v) => parse_f64(&v)?,
        None => 0.0,
    };
    let next = current + delta;
    if !next.is_finite() {
        return Err(StorageError::Other(
            "increment would produce NaN or Infinity".to_string(),
        ));
    }
    let formatted = format_double(next);
    hset(
        client,
        key,
        &[(
            Bytes::copy_from_slice(field),
            Bytes::from(formatted.clone()),
        )],
    )
    .await?;
    Ok(formatted)
}

/// HSCAN: offset cursor over field order. Returns the next cursor (0 when
/// exhausted) and the page of field/value pairs before MATCH filtering.
pub async fn hscan<C: GenericClient>(
    client: &C,
    key: &[u8],
    cursor: i64,
    count: i64,
) -> Result<(i64, Vec<(Bytes, Bytes)>), StorageError> {
    if !check_type(client, key, KeyType::Hash).await? {
        return Ok((0, Vec::new()));
    }
    let rows = client
        .query(
            &format!(
                "SELECT field, value FROM kv_hashes \
                 WHERE key = $1 AND {LIVE} ORDER BY field LIMIT $2 OFFSET $3"
            ),
            &[&encode_name(key), &(count + 1), &cursor],
        )
        .await?;

    let more = rows.len() as i64 > count;
    let page: Vec<(Bytes, Bytes)> = rows
        .into_iter()
        .take(count as usize)
        .map(|r| {
            (
                decode_name(r.get::<_, &str>(0)),
                Bytes::from(r.get::<_, Vec<u8>>(1)),
            )
        })
        .collect();
    let next = if more { cursor + page.len() as i64 } else { 0 };
    Ok((next, page))
}
