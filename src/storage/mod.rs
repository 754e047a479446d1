//! SQL-Backed Storage
//!
//! Implements every Redis data-type command as statements against the
//! tables in [`schema`]. Operations are free functions generic over
//! [`tokio_postgres::GenericClient`], so the same code runs on a pooled
//! connection (autocommit path) and inside a single SQL transaction (the
//! MULTI/EXEC path and every multi-statement mutation).
//!
//! ## Conventions
//!
//! - Keys and hash fields are stored through [`encoding`]; values and
//!   members are raw `bytea`.
//! - Every read carries the liveness predicate from [`schema::LIVE`], so
//!   an expired row is never visible between janitor ticks.
//! - Mutations that can change a key's type run inside a transaction that
//!   checks `kv_meta`, touches the data table, and upserts `kv_meta`; the
//!   caller opens the transaction, the operation assumes it.
//! - A key exists iff its `kv_meta` row is live. Collection operations
//!   delete the meta row when the last element goes away.

pub mod bitmap;
pub mod encoding;
pub mod error;
pub mod hashes;
pub mod hyperloglog;
pub mod janitor;
pub mod keys;
pub mod lists;
pub mod schema;
pub mod sets;
pub mod strings;
pub mod zsets;

pub use error::StorageError;
pub use janitor::{start_janitor, Janitor};

use chrono::{DateTime, Utc};
use deadpool_postgres::{Object, Pool};
use encoding::encode_name;
use schema::LIVE;
use tokio_postgres::GenericClient;

/// The Redis-level type of a live key, as recorded in `kv_meta`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyType {
    String,
    Hash,
    List,
    Set,
    ZSet,
    HyperLogLog,
}

impl KeyType {
    pub fn as_str(self) -> &'static str {
        match self {
            KeyType::String => "string",
            KeyType::Hash => "hash",
            KeyType::List => "list",
            KeyType::Set => "set",
            KeyType::ZSet => "zset",
            KeyType::HyperLogLog => "hyperloglog",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "string" => Some(KeyType::String),
            "hash" => Some(KeyType::Hash),
            "list" => Some(KeyType::List),
            "set" => Some(KeyType::Set),
            "zset" => Some(KeyType::ZSet),
            "hyperloglog" => Some(KeyType::HyperLogLog),
            _ => None,
        }
    }

    /// The data table backing this type.
    pub fn table(self) -> &'static str {
        match self {
            KeyType::String => "kv_strings",
            KeyType::Hash => "kv_hashes",
            KeyType::List => "kv_lists",
            KeyType::Set => "kv_sets",
            KeyType::ZSet => "kv_zsets",
            KeyType::HyperLogLog => "kv_hyperloglog",
        }
    }
}

/// Handle on the shared connection pool.
///
/// Shared by every session task; listener tasks hold their own dedicated
/// connections instead because `LISTEN` is session-scoped.
#[derive(Clone)]
pub struct Store {
    pool: Pool,
}

impl std::fmt::Debug for Store {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Store").finish()
    }
}

impl Store {
    pub fn new(pool: Pool) -> Self {
        Self { pool }
    }

    /// Checks a pooled connection out; callers open transactions on it as
    /// needed and return it by drop.
    pub async fn client(&self) -> Result<Object, StorageError> {
        Ok(self.pool.get().await?)
    }

    pub fn pool(&self) -> &Pool {
        &self.pool
    }
}

/// Looks up the live type of a key.
pub async fn key_type<C: GenericClient>(
    client: &C,
    key: &[u8],
) -> Result<Option<KeyType>, StorageError> {
    let row = client
        .query_opt(
            &format!("SELECT key_type FROM kv_meta WHERE key = $1 AND {LIVE}"),
            &[&encode_name(key)],
        )
        .await?;
    Ok(row.and_then(|r| KeyType::from_str(r.get::<_, &str>(0))))
}

/// Verifies a key is either absent or of the expected type.
///
/// Returns whether the key exists; fails with `WRONGTYPE` on a mismatch.
pub async fn check_type<C: GenericClient>(
    client: &C,
    key: &[u8],
    expected: KeyType,
) -> Result<bool, StorageError> {
    match key_type(client, key).await? {
        None => Ok(false),
        Some(t) if t == expected => Ok(true),
        Some(_) => Err(StorageError::WrongType),
    }
}

/// Current expiry of a key, if any.
pub async fn current_expiry<C: GenericClient>(
    client: &C,
    key: &[u8],
) -> Result<Option<DateTime<Utc>>, StorageError> {
    let row = client
        .query_opt(
            &format!("SELECT expires_at FROM kv_meta WHERE key = $1 AND {LIVE}"),
            &[&encode_name(key)],
        )
        .await?;
    Ok(row.and_then(|r| r.get(0)))
}

/// Records a key's type in `kv_meta`, preserving any existing expiry.
pub async fn upsert_meta<C: GenericClient>(
    client: &C,
    key: &[u8],
    key_type: KeyType,
) -> Result<(), StorageError> {
    client
        .execute(
            "INSERT INTO kv_meta (key, key_type) VALUES ($1, $2) \
             ON CONFLICT (key) DO UPDATE SET key_type = EXCLUDED.key_type",
            &[&encode_name(key), &key_type.as_str()],
        )
        .await?;
    Ok(())
}

/// Records a key's type and expiry in `kv_meta`, overwriting both.
pub async fn set_meta<C: GenericClient>(
    client: &C,
    key: &[u8],
    key_type: KeyType,
    expires_at: Option<DateTime<Utc>>,
) -> Result<(), StorageError> {
    client
        .execute(
            "INSERT INTO kv_meta (key, key_type, expires_at) VALUES ($1, $2, $3) \
             ON CONFLICT (key) DO UPDATE \
             SET key_type = EXCLUDED.key_type, expires_at = EXCLUDED.expires_at",
            &[&encode_name(key), &key_type.as_str(), &expires_at],
        )
        .await?;
    Ok(())
}

/// Deletes a key's rows from every table. Returns whether the key existed
/// (had a live meta row). Used by DEL, and by retyping writes.
pub async fn purge_key<C: GenericClient>(client: &C, key: &[u8]) -> Result<bool, StorageError> {
    let stored = encode_name(key);
    let existed = client
        .execute(
            &format!("DELETE FROM kv_meta WHERE key = $1 AND {LIVE}"),
            &[&stored],
        )
        .await?
        > 0;
    // Reap rows (live or not) from every data table plus any expired meta
    client
        .execute("DELETE FROM kv_meta WHERE key = $1", &[&stored])
        .await?;
    for table in schema::DATA_TABLES {
        client
            .execute(&format!("DELETE FROM {table} WHERE key = $1"), &[&stored])
            .await?;
    }
    Ok(existed)
}

/// Normalizes a Redis start/stop pair (negative offsets count from the
/// end, inclusive stop) into a half-open `[start, end)` window over a
/// sequence of `len` items. `None` means the selection is empty.
pub fn normalize_range(start: i64, stop: i64, len: i64) -> Option<(i64, i64)> {
    if len == 0 {
        return None;
    }
    let mut start = if start < 0 { len + start } else { start };
    let mut stop = if stop < 0 { len + stop } else { stop };
    start = start.max(0);
    stop = stop.min(len - 1);
    if start > stop || start >= len {
        return None;
    }
    Some((start, stop + 1))
}

/// Drops the meta row of a collection key when its last element is gone.
pub async fn delete_meta_if_empty<C: GenericClient>(
    client: &C,
    key: &[u8],
    key_type: KeyType,
) -> Result<(), StorageError> {
    let table = key_type.table();
    client
        .execute(
            &format!(
                "DELETE FROM kv_meta WHERE key = $1 \
                 AND NOT EXISTS (SELECT 1 FROM {table} WHERE key = $1 AND {LIVE})"
            ),
            &[&encode_name(key)],
        )
        .await?;
    Ok(())
}
