//! Key Administration
//!
//! DEL, EXISTS, the expiry family, KEYS/SCAN, TYPE, RENAME, COPY, DBSIZE
//! and FLUSHDB. `kv_meta` drives everything: a key exists iff its meta row
//! is live, and expiry updates are written to the meta row and mirrored
//! into the key's data table so janitor scans stay index-driven.

use crate::storage::encoding::{decode_name, encode_name, glob_to_like};
use crate::storage::error::StorageError;
use crate::storage::schema::{DATA_TABLES, LIVE};
use crate::storage::strings::{resolve_expiry, Expiry};
use crate::storage::{key_type, purge_key, KeyType};
use bytes::Bytes;
use chrono::{DateTime, Utc};
use tokio_postgres::GenericClient;

/// DEL / UNLINK. Returns how many of the keys existed. Runs inside a
/// transaction.
pub async fn del<C: GenericClient>(client: &C, keys: &[Bytes]) -> Result<i64, StorageError> {
    let mut removed = 0i64;
    for key in keys {
        if purge_key(client, key).await? {
            removed += 1;
        }
    }
    Ok(removed)
}

/// EXISTS with multiplicity: a key named twice counts twice.
pub async fn exists<C: GenericClient>(client: &C, keys: &[Bytes]) -> Result<i64, StorageError> {
    let mut count = 0i64;
    for key in keys {
        if key_type(client, key).await?.is_some() {
            count += 1;
        }
    }
    Ok(count)
}

/// EXPIRE / PEXPIRE / EXPIREAT / PEXPIREAT. Returns whether a timeout was
/// set. An instant at or before now deletes the key outright. Runs inside
/// a transaction.
pub async fn set_expiry<C: GenericClient>(
    client: &C,
    key: &[u8],
    expiry: Expiry,
) -> Result<bool, StorageError> {
    let Some(kt) = key_type(client, key).await? else {
        return Ok(false);
    };

    let expires_at = resolve_expiry(client, key, expiry).await?;
    if let Some(at) = expires_at {
        let now: DateTime<Utc> = client.query_one("SELECT now()", &[]).await?.get(0);
        if at <= now {
            purge_key(client, key).await?;
            return Ok(true);
        }
    }

    write_expiry(client, key, kt, expires_at).await?;
    Ok(true)
}

/// TTL / PTTL. -2 for a missing key, -1 for a key without expiry.
pub async fn ttl<C: GenericClient>(
    client: &C,
    key: &[u8],
    millis: bool,
) -> Result<i64, StorageError> {
    let row = client
        .query_opt(
            &format!(
                "SELECT (EXTRACT(EPOCH FROM (expires_at - now())) * 1000.0)::bigint \
                 FROM kv_meta WHERE key = $1 AND {LIVE}"
            ),
            &[&encode_name(key)],
        )
        .await?;
    match row {
        None => Ok(-2),
        Some(r) => match r.get::<_, Option<i64>>(0) {
            None => Ok(-1),
            Some(ms) => Ok(if millis {
                ms
            } else {
                // Round half-up, like Redis: 900 ms left reports 1 second
                (ms + 500) / 1000
            }),
        },
    }
}

/// PERSIST. Returns whether an expiry was removed. Runs inside a
/// transaction.
pub async fn persist<C: GenericClient>(client: &C, key: &[u8]) -> Result<bool, StorageError> {
    let Some(kt) = key_type(client, key).await? else {
        return Ok(false);
    };
    let had_expiry = client
        .query_one(
            &format!(
                "SELECT expires_at IS NOT NULL FROM kv_meta WHERE key = $1 AND {LIVE}"
            ),
            &[&encode_name(key)],
        )
        .await?
        .get::<_, bool>(0);
    if !had_expiry {
        return Ok(false);
    }
    write_expiry(client, key, kt, None).await?;
    Ok(true)
}

/// KEYS: the glob is translated to LIKE (`*` to `%`, `?` to `_`) and
/// evaluated by the database over the stored key text.
pub async fn keys<C: GenericClient>(
    client: &C,
    pattern: &[u8],
) -> Result<Vec<Bytes>, StorageError> {
    let rows = client
        .query(
            &format!(
                "SELECT key FROM kv_meta WHERE key LIKE $1 ESCAPE '\\' AND {LIVE} ORDER BY key"
            ),
            &[&glob_to_like(pattern)],
        )
        .await?;
    Ok(rows
        .into_iter()
        .map(|r| decode_name(r.get::<_, &str>(0)))
        .collect())
}

/// SCAN: offset cursor over key order; MATCH filtering happens at the
/// command layer on the decoded names, so a page may come back short.
pub async fn scan<C: GenericClient>(
    client: &C,
    cursor: i64,
    count: i64,
) -> Result<(i64, Vec<Bytes>), StorageError> {
    let rows = client
        .query(
            &format!(
                "SELECT key FROM kv_meta WHERE {LIVE} ORDER BY key LIMIT $1 OFFSET $2"
            ),
            &[&(count + 1), &cursor],
        )
        .await?;
    let more = rows.len() as i64 > count;
    let page: Vec<Bytes> = rows
        .into_iter()
        .take(count as usize)
        .map(|r| decode_name(r.get::<_, &str>(0)))
        .collect();
    let next = if more { cursor + page.len() as i64 } else { 0 };
    Ok((next, page))
}

/// RENAME / RENAMENX. Moves the data rows and the meta row; the
/// destination is replaced (RENAME) or must be absent (RENAMENX). Returns
/// whether the rename happened; a missing source is an error. Runs inside
/// a transaction.
pub async fn rename<C: GenericClient>(
    client: &C,
    source: &[u8],
    destination: &[u8],
    only_if_absent: bool,
) -> Result<bool, StorageError> {
    let Some(kt) = key_type(client, source).await? else {
        return Err(StorageError::NoSuchKey);
    };
    if only_if_absent && key_type(client, destination).await?.is_some() {
        return Ok(false);
    }

    purge_key(client, destination).await?;
    let src = encode_name(source);
    let dst = encode_name(destination);
    client
        .execute(
            &format!("UPDATE {} SET key = $2 WHERE key = $1", kt.table()),
            &[&src, &dst],
        )
        .await?;
    client
        .execute("UPDATE kv_meta SET key = $2 WHERE key = $1", &[&src, &dst])
        .await?;
    Ok(true)
}

/// COPY. Duplicates the data rows and meta (expiry included). Returns
/// whether the copy happened. Runs inside a transaction.
pub async fn copy<C: GenericClient>(
    client: &C,
    source: &[u8],
    destination: &[u8],
    replace: bool,
) -> Result<bool, StorageError> {
    let Some(kt) = key_type(client, source).await? else {
        return Ok(false);
    };
    if key_type(client, destination).await?.is_some() {
        if !replace {
            return Ok(false);
        }
        purge_key(client, destination).await?;
    }

    let src = encode_name(source);
    let dst = encode_name(destination);
    let columns = match kt {
        KeyType::String => "value, expires_at",
        KeyType::Hash => "field, value, expires_at",
        KeyType::List => "idx, value, expires_at",
        KeyType::Set => "member, expires_at",
        KeyType::ZSet => "member, score, expires_at",
        KeyType::HyperLogLog => "registers, expires_at",
    };
    client
        .execute(
            &format!(
                "INSERT INTO {table} (key, {columns}) \
                 SELECT $2, {columns} FROM {table} WHERE key = $1 AND {LIVE}",
                table = kt.table()
            ),
            &[&src, &dst],
        )
        .await?;
    client
        .execute(
            "INSERT INTO kv_meta (key, key_type, expires_at) \
             SELECT $2, key_type, expires_at FROM kv_meta WHERE key = $1",
            &[&src, &dst],
        )
        .await?;
    Ok(true)
}

/// DBSIZE: live key count.
pub async fn dbsize<C: GenericClient>(client: &C) -> Result<i64, StorageError> {
    let row = client
        .query_one(&format!("SELECT COUNT(*) FROM kv_meta WHERE {LIVE}"), &[])
        .await?;
    Ok(row.get(0))
}

/// FLUSHDB: truncates everything in one statement.
pub async fn flushdb<C: GenericClient>(client: &C) -> Result<(), StorageError> {
    let tables = DATA_TABLES.join(", ");
    client
        .batch_execute(&format!("TRUNCATE {tables}, kv_meta"))
        .await?;
    Ok(())
}

/// RANDOMKEY.
pub async fn randomkey<C: GenericClient>(client: &C) -> Result<Option<Bytes>, StorageError> {
    let row = client
        .query_opt(
            &format!("SELECT key FROM kv_meta WHERE {LIVE} ORDER BY random() LIMIT 1"),
            &[],
        )
        .await?;
    Ok(row.map(|r| decode_name(r.get::<_, &str>(0))))
}

/// Writes an expiry to the meta row and mirrors it into the data table.
async fn write_expiry<C: GenericClient>(
    client: &C,
    key: &[u8],
    kt: KeyType,
    expires_at: Option<DateTime<Utc>>,
) -> Result<(), StorageError> {
    let stored = encode_name(key);
    client
        .execute(
            "UPDATE kv_meta SET expires_at = $2 WHERE key = $1",
            &[&stored, &expires_at],
        )
        .await?;
    client
        .execute(
            &format!("UPDATE {} SET expires_at = $2 WHERE key = $1", kt.table()),
            &[&stored, &expires_at],
        )
        .await?;
    Ok(())
}
