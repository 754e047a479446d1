//! List Operations
//!
//! Lists are `(key, idx) -> value` rows with a monotonically assigned
//! index: LPUSH allocates downward from the current MIN, RPUSH upward from
//! the current MAX, and nothing ever recompacts, so both ends stay cheap
//! and element order is the index order. Index gaps are normal (pops and
//! LREM leave them).
//!
//! Concurrency contract:
//!
//! - pushes and LINSERT take a transaction-scoped advisory lock on the key
//!   before reading MIN/MAX, serializing index assignment across every
//!   front-end sharing the database;
//! - pops are a single `DELETE ... RETURNING` statement over a
//!   `FOR UPDATE SKIP LOCKED` candidate set, so concurrent poppers never
//!   observe the same element and never wait on each other;
//! - a committed push NOTIFYs the key's keyspace channel from inside the
//!   transaction, which is what wakes BRPOP/BLPOP waiters; an aborted push
//!   notifies nobody because the database discards the NOTIFY.

use crate::pubsub::names::{keyspace_channel, list_lock_key};
use crate::storage::encoding::encode_name;
use crate::storage::error::StorageError;
use crate::storage::schema::LIVE;
use crate::storage::{
    check_type, current_expiry, delete_meta_if_empty, upsert_meta, KeyType,
};
use bytes::Bytes;
use tokio_postgres::GenericClient;

/// Which end of the list an operation works on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Side {
    Left,
    Right,
}

/// Index shift staging offset for LINSERT; far outside any reachable idx
/// so the two-step move never trips the primary key.
const SHIFT_STAGE: i64 = 1 << 40;

/// LPUSH / RPUSH / LPUSHX / RPUSHX. Returns the new length, or 0 when
/// `require_exists` is set and the key is absent. Runs inside a
/// transaction.
pub async fn push<C: GenericClient>(
    client: &C,
    key: &[u8],
    side: Side,
    values: &[Bytes],
    require_exists: bool,
) -> Result<i64, StorageError> {
    lock_key(client, key).await?;
    let exists = check_type(client, key, KeyType::List).await?;
    if require_exists && !exists {
        return Ok(0);
    }

    let stored = encode_name(key);
    let expires_at = current_expiry(client, key).await?;

    // The advisory lock makes this read-then-insert race-free
    let edge: Option<i64> = client
        .query_one(
            &format!(
                "SELECT {} FROM kv_lists WHERE key = $1 AND {LIVE}",
                match side {
                    Side::Left => "MIN(idx)",
                    Side::Right => "MAX(idx)",
                }
            ),
            &[&stored],
        )
        .await?
        .get(0);

    let mut next = match (side, edge) {
        (Side::Left, Some(min)) => min - 1,
        (Side::Right, Some(max)) => max + 1,
        (_, None) => 0,
    };

    for value in values {
        client
            .execute(
                "INSERT INTO kv_lists (key, idx, value, expires_at) VALUES ($1, $2, $3, $4)",
                &[&stored, &next, &&value[..], &expires_at],
            )
            .await?;
        next += match side {
            Side::Left => -1,
            Side::Right => 1,
        };
    }

    upsert_meta(client, key, KeyType::List).await?;
    notify_push(client, key, side).await?;
    llen(client, key).await
}

/// LPOP / RPOP with a count. The delete is one statement; SKIP LOCKED
/// keeps concurrent poppers disjoint. Runs inside a transaction.
pub async fn pop<C: GenericClient>(
    client: &C,
    key: &[u8],
    side: Side,
    count: i64,
) -> Result<Vec<Bytes>, StorageError> {
    if !check_type(client, key, KeyType::List).await? {
        return Ok(Vec::new());
    }

    let order = match side {
        Side::Left => "ASC",
        Side::Right => "DESC",
    };
    let rows = client
        .query(
            &format!(
                "WITH candidate AS ( \
                     SELECT idx FROM kv_lists \
                     WHERE key = $1 AND {LIVE} \
                     ORDER BY idx {order} LIMIT $2 \
                     FOR UPDATE SKIP LOCKED \
                 ), popped AS ( \
                     DELETE FROM kv_lists l USING candidate c \
                     WHERE l.key = $1 AND l.idx = c.idx \
                     RETURNING l.idx, l.value \
                 ) SELECT value FROM popped ORDER BY idx {order}"
            ),
            &[&encode_name(key), &count],
        )
        .await?;

    let values: Vec<Bytes> = rows
        .into_iter()
        .map(|r| Bytes::from(r.get::<_, Vec<u8>>(0)))
        .collect();
    if !values.is_empty() {
        delete_meta_if_empty(client, key, KeyType::List).await?;
    }
    Ok(values)
}

pub async fn llen<C: GenericClient>(client: &C, key: &[u8]) -> Result<i64, StorageError> {
    if !check_type(client, key, KeyType::List).await? {
        return Ok(0);
    }
    let row = client
        .query_one(
            &format!("SELECT COUNT(*) FROM kv_lists WHERE key = $1 AND {LIVE}"),
            &[&encode_name(key)],
        )
        .await?;
    Ok(row.get(0))
}

/// LRANGE with negative-offset normalization.
pub async fn lrange<C: GenericClient>(
    client: &C,
    key: &[u8],
    start: i64,
    stop: i64,
) -> Result<Vec<Bytes>, StorageError> {
    let len = llen(client, key).await?;
    let Some((from, to)) = crate::storage::normalize_range(start, stop, len) else {
        return Ok(Vec::new());
    };
    let rows = client
        .query(
            &format!(
                "SELECT value FROM kv_lists WHERE key = $1 AND {LIVE} \
                 ORDER BY idx LIMIT $2 OFFSET $3"
            ),
            &[&encode_name(key), &(to - from), &from],
        )
        .await?;
    Ok(rows
        .into_iter()
        .map(|r| Bytes::from(r.get::<_, Vec<u8>>(0)))
        .collect())
}

/// LINDEX. Negative indices count from the tail.
pub async fn lindex<C: GenericClient>(
    client: &C,
    key: &[u8],
    index: i64,
) -> Result<Option<Bytes>, StorageError> {
    let len = llen(client, key).await?;
    let offset = if index < 0 { len + index } else { index };
    if offset < 0 || offset >= len {
        return Ok(None);
    }
    let row = client
        .query_opt(
            &format!(
                "SELECT value FROM kv_lists WHERE key = $1 AND {LIVE} \
                 ORDER BY idx LIMIT 1 OFFSET $2"
            ),
            &[&encode_name(key), &offset],
        )
        .await?;
    Ok(row.map(|r| Bytes::from(r.get::<_, Vec<u8>>(0))))
}

/// LSET. Fails with `ERR no such key` on a missing key and
/// `ERR index out of range` past either end. Runs inside a transaction.
pub async fn lset<C: GenericClient>(
    client: &C,
    key: &[u8],
    index: i64,
    value: &[u8],
) -> Result<(), StorageError> {
    if !check_type(client, key, KeyType::List).await? {
        return Err(StorageError::NoSuchKey);
    }
    let len = llen(client, key).await?;
    let offset = if index < 0 { len + index } else { index };
    if offset < 0 || offset >= len {
        return Err(StorageError::IndexOutOfRange);
    }
    client
        .execute(
            &format!(
                "UPDATE kv_lists SET value = $3 WHERE key = $1 AND idx = ( \
                     SELECT idx FROM kv_lists WHERE key = $1 AND {LIVE} \
                     ORDER BY idx LIMIT 1 OFFSET $2)"
            ),
            &[&encode_name(key), &offset, &value],
        )
        .await?;
    Ok(())
}

/// LREM: removes up to `count` occurrences of `value` (head-first for
/// positive counts, tail-first for negative, all for zero). Runs inside a
/// transaction.
pub async fn lrem<C: GenericClient>(
    client: &C,
    key: &[u8],
    count: i64,
    value: &[u8],
) -> Result<i64, StorageError> {
    if !check_type(client, key, KeyType::List).await? {
        return Ok(0);
    }
    let (order, limit) = if count >= 0 {
        ("ASC", count)
    } else {
        ("DESC", -count)
    };
    let limit_clause = if limit == 0 {
        String::new()
    } else {
        format!("LIMIT {limit}")
    };
    let removed = client
        .execute(
            &format!(
                "DELETE FROM kv_lists WHERE key = $1 AND idx IN ( \
                     SELECT idx FROM kv_lists \
                     WHERE key = $1 AND value = $2 AND {LIVE} \
                     ORDER BY idx {order} {limit_clause})"
            ),
            &[&encode_name(key), &value],
        )
        .await? as i64;
    if removed > 0 {
        delete_meta_if_empty(client, key, KeyType::List).await?;
    }
    Ok(removed)
}

/// LTRIM: keeps only the normalized `[start, stop]` window. Runs inside a
/// transaction.
pub async fn ltrim<C: GenericClient>(
    client: &C,
    key: &[u8],
    start: i64,
    stop: i64,
) -> Result<(), StorageError> {
    if !check_type(client, key, KeyType::List).await? {
        return Ok(());
    }
    let len = llen(client, key).await?;
    let stored = encode_name(key);
    match crate::storage::normalize_range(start, stop, len) {
        None => {
            // Empty window trims the whole list away
            client
                .execute("DELETE FROM kv_lists WHERE key = $1", &[&stored])
                .await?;
        }
        Some((from, to)) => {
            client
                .execute(
                    &format!(
                        "DELETE FROM kv_lists WHERE key = $1 AND idx IN ( \
                             SELECT idx FROM ( \
                                 SELECT idx, row_number() OVER (ORDER BY idx) - 1 AS rn \
                                 FROM kv_lists WHERE key = $1 AND {LIVE} \
                             ) ranked WHERE rn < $2 OR rn >= $3)"
                    ),
                    &[&stored, &from, &to],
                )
                .await?;
        }
    }
    delete_meta_if_empty(client, key, KeyType::List).await?;
    Ok(())
}

/// LINSERT BEFORE/AFTER pivot. Shifts only the elements from the pivot
/// onward (staged through a far-away index range so the primary key never
/// sees a transient duplicate). Returns the new length, -1 when the pivot
/// is missing, 0 when the key is absent. Runs inside a transaction.
pub async fn linsert<C: GenericClient>(
    client: &C,
    key: &[u8],
    before: bool,
    pivot: &[u8],
    value: &[u8],
) -> Result<i64, StorageError> {
    lock_key(client, key).await?;
    if !check_type(client, key, KeyType::List).await? {
        return Ok(0);
    }

    let stored = encode_name(key);
    let pivot_idx: Option<i64> = client
        .query_opt(
            &format!(
                "SELECT idx FROM kv_lists \
                 WHERE key = $1 AND value = $2 AND {LIVE} \
                 ORDER BY idx LIMIT 1"
            ),
            &[&stored, &pivot],
        )
        .await?
        .map(|r| r.get(0));
    let Some(pivot_idx) = pivot_idx else {
        return Ok(-1);
    };

    // BEFORE vacates the pivot's slot, AFTER the one past it
    let insert_at = if before { pivot_idx } else { pivot_idx + 1 };
    client
        .execute(
            "UPDATE kv_lists SET idx = idx + $2 WHERE key = $1 AND idx >= $3",
            &[&stored, &SHIFT_STAGE, &insert_at],
        )
        .await?;
    client
        .execute(
            "UPDATE kv_lists SET idx = idx - $2 + 1 WHERE key = $1 AND idx >= $2",
            &[&stored, &SHIFT_STAGE],
        )
        .await?;

    let expires_at = current_expiry(client, key).await?;
    client
        .execute(
            "INSERT INTO kv_lists (key, idx, value, expires_at) VALUES ($1, $2, $3, $4)",
            &[&stored, &insert_at, &value, &expires_at],
        )
        .await?;

    notify_push(client, key, if before { Side::Left } else { Side::Right }).await?;
    llen(client, key).await
}

/// LPOS: rank/count scan over the list in index order.
pub async fn lpos<C: GenericClient>(
    client: &C,
    key: &[u8],
    element: &[u8],
    rank: i64,
    count: Option<i64>,
) -> Result<Vec<i64>, StorageError> {
    if !check_type(client, key, KeyType::List).await? {
        return Ok(Vec::new());
    }
    let rows = client
        .query(
            &format!("SELECT value FROM kv_lists WHERE key = $1 AND {LIVE} ORDER BY idx"),
            &[&encode_name(key)],
        )
        .await?;
    let values: Vec<Vec<u8>> = rows.into_iter().map(|r| r.get(0)).collect();

    let positions: Vec<i64> = if rank >= 0 {
        values
            .iter()
            .enumerate()
            .filter(|(_, v)| v.as_slice() == element)
            .map(|(i, _)| i as i64)
            .collect()
    } else {
        values
            .iter()
            .enumerate()
            .rev()
            .filter(|(_, v)| v.as_slice() == element)
            .map(|(i, _)| i as i64)
            .collect()
    };

    // RANK skips |rank| - 1 matches in the scan direction
    let skip = (rank.unsigned_abs().max(1) - 1) as usize;
    let take = count.map(|c| if c == 0 { usize::MAX } else { c as usize }).unwrap_or(1);
    Ok(positions.into_iter().skip(skip).take(take).collect())
}

/// RPOPLPUSH: atomically moves the source tail to the destination head.
/// Locks both keys in a stable order to stay deadlock-free. Runs inside a
/// transaction.
pub async fn rpoplpush<C: GenericClient>(
    client: &C,
    source: &[u8],
    destination: &[u8],
) -> Result<Option<Bytes>, StorageError> {
    let mut locks = [list_lock_key(source), list_lock_key(destination)];
    locks.sort_unstable();
    for lock in locks {
        client
            .execute("SELECT pg_advisory_xact_lock($1)", &[&lock])
            .await?;
    }

    check_type(client, destination, KeyType::List).await?;
    let mut popped = pop(client, source, Side::Right, 1).await?;
    let Some(value) = popped.pop() else {
        return Ok(None);
    };

    // Push without re-locking (push's advisory lock is re-entrant within
    // the same transaction)
    push_one_unlocked(client, destination, Side::Left, &value).await?;
    Ok(Some(value))
}

async fn push_one_unlocked<C: GenericClient>(
    client: &C,
    key: &[u8],
    side: Side,
    value: &[u8],
) -> Result<(), StorageError> {
    let stored = encode_name(key);
    let expires_at = current_expiry(client, key).await?;
    let edge: Option<i64> = client
        .query_one(
            &format!(
                "SELECT {} FROM kv_lists WHERE key = $1 AND {LIVE}",
                match side {
                    Side::Left => "MIN(idx)",
                    Side::Right => "MAX(idx)",
                }
            ),
            &[&stored],
        )
        .await?
        .get(0);
    let idx = match (side, edge) {
        (Side::Left, Some(min)) => min - 1,
        (Side::Right, Some(max)) => max + 1,
        (_, None) => 0,
    };
    client
        .execute(
            "INSERT INTO kv_lists (key, idx, value, expires_at) VALUES ($1, $2, $3, $4)",
            &[&stored, &idx, &value, &expires_at],
        )
        .await?;
    upsert_meta(client, key, KeyType::List).await?;
    notify_push(client, key, side).await?;
    Ok(())
}

/// Takes the transaction-scoped advisory lock that serializes index
/// assignment for this key.
async fn lock_key<C: GenericClient>(client: &C, key: &[u8]) -> Result<(), StorageError> {
    client
        .execute("SELECT pg_advisory_xact_lock($1)", &[&list_lock_key(key)])
        .await?;
    Ok(())
}

/// NOTIFYs the key's keyspace channel from inside the transaction; the
/// database delivers it only on commit.
async fn notify_push<C: GenericClient>(
    client: &C,
    key: &[u8],
    side: Side,
) -> Result<(), StorageError> {
    let channel = keyspace_channel(key);
    let op = match side {
        Side::Left => "lpush",
        Side::Right => "rpush",
    };
    client
        .execute("SELECT pg_notify($1, $2)", &[&channel, &op])
        .await?;
    Ok(())
}
