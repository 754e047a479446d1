//! Set Operations
//!
//! Sets are `(key, member)` rows with raw bytea members. The binary
//! combinators map straight onto SQL set algebra: INTERSECT, UNION and
//! EXCEPT over per-key SELECTs, evaluated left to right the way Redis
//! folds its operands. Random picks (SPOP, SRANDMEMBER) use the server's
//! `random()` so no process-local RNG is involved.

use crate::storage::encoding::encode_name;
use crate::storage::error::StorageError;
use crate::storage::schema::LIVE;
use crate::storage::{
    check_type, current_expiry, delete_meta_if_empty, purge_key, set_meta, upsert_meta, KeyType,
};
use bytes::Bytes;
use tokio_postgres::types::ToSql;
use tokio_postgres::GenericClient;

/// The binary set combinator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SetOp {
    Inter,
    Union,
    Diff,
}

impl SetOp {
    fn sql(self) -> &'static str {
        match self {
            SetOp::Inter => "INTERSECT",
            SetOp::Union => "UNION",
            SetOp::Diff => "EXCEPT",
        }
    }
}

/// SADD. Returns the number of members actually added. Runs inside a
/// transaction.
pub async fn sadd<C: GenericClient>(
    client: &C,
    key: &[u8],
    members: &[Bytes],
) -> Result<i64, StorageError> {
    check_type(client, key, KeyType::Set).await?;
    let stored = encode_name(key);
    let expires_at = current_expiry(client, key).await?;

    let mut added = 0i64;
    for member in members {
        added += client
            .execute(
                "INSERT INTO kv_sets (key, member, expires_at) VALUES ($1, $2, $3) \
                 ON CONFLICT (key, member) DO NOTHING",
                &[&stored, &&member[..], &expires_at],
            )
            .await? as i64;
    }
    if added > 0 {
        upsert_meta(client, key, KeyType::Set).await?;
    }
    Ok(added)
}

/// SREM. Runs inside a transaction.
pub async fn srem<C: GenericClient>(
    client: &C,
    key: &[u8],
    members: &[Bytes],
) -> Result<i64, StorageError> {
    if !check_type(client, key, KeyType::Set).await? {
        return Ok(0);
    }
    let stored = encode_name(key);
    let mut removed = 0i64;
    for member in members {
        removed += client
            .execute(
                &format!("DELETE FROM kv_sets WHERE key = $1 AND member = $2 AND {LIVE}"),
                &[&stored, &&member[..]],
            )
            .await? as i64;
    }
    if removed > 0 {
        delete_meta_if_empty(client, key, KeyType::Set).await?;
    }
    Ok(removed)
}

pub async fn smembers<C: GenericClient>(
    client: &C,
    key: &[u8],
) -> Result<Vec<Bytes>, StorageError> {
    if !check_type(client, key, KeyType::Set).await? {
        return Ok(Vec::new());
    }
    let rows = client
        .query(
            &format!("SELECT member FROM kv_sets WHERE key = $1 AND {LIVE} ORDER BY member"),
            &[&encode_name(key)],
        )
        .await?;
    Ok(rows
        .into_iter()
        .map(|r| Bytes::from(r.get::<_, Vec<u8>>(0)))
        .collect())
}

pub async fn sismember<C: GenericClient>(
    client: &C,
    key: &[u8],
    member: &[u8],
) -> Result<bool, StorageError> {
    if !check_type(client, key, KeyType::Set).await? {
        return Ok(false);
    }
    let row = client
        .query_opt(
            &format!("SELECT 1 FROM kv_sets WHERE key = $1 AND member = $2 AND {LIVE}"),
            &[&encode_name(key), &member],
        )
        .await?;
    Ok(row.is_some())
}

pub async fn smismember<C: GenericClient>(
    client: &C,
    key: &[u8],
    members: &[Bytes],
) -> Result<Vec<bool>, StorageError> {
    if !check_type(client, key, KeyType::Set).await? {
        return Ok(vec![false; members.len()]);
    }
    let byte_members: Vec<&[u8]> = members.iter().map(|m| &m[..]).collect();
    let rows = client
        .query(
            &format!("SELECT member FROM kv_sets WHERE key = $1 AND member = ANY($2) AND {LIVE}"),
            &[&encode_name(key), &byte_members],
        )
        .await?;
    let present: std::collections::HashSet<Vec<u8>> =
        rows.into_iter().map(|r| r.get(0)).collect();
    Ok(members.iter().map(|m| present.contains(&m[..])).collect())
}

pub async fn scard<C: GenericClient>(client: &C, key: &[u8]) -> Result<i64, StorageError> {
    if !check_type(client, key, KeyType::Set).await? {
        return Ok(0);
    }
    let row = client
        .query_one(
            &format!("SELECT COUNT(*) FROM kv_sets WHERE key = $1 AND {LIVE}"),
            &[&encode_name(key)],
        )
        .await?;
    Ok(row.get(0))
}

/// SPOP: removes and returns up to `count` random members. Runs inside a
/// transaction.
pub async fn spop<C: GenericClient>(
    client: &C,
    key: &[u8],
    count: i64,
) -> Result<Vec<Bytes>, StorageError> {
    if !check_type(client, key, KeyType::Set).await? {
        return Ok(Vec::new());
    }
    let rows = client
        .query(
            &format!(
                "WITH candidate AS ( \
                     SELECT member FROM kv_sets \
                     WHERE key = $1 AND {LIVE} \
                     ORDER BY random() LIMIT $2 \
                     FOR UPDATE SKIP LOCKED \
                 ) DELETE FROM kv_sets s USING candidate c \
                   WHERE s.key = $1 AND s.member = c.member \
                   RETURNING s.member"
            ),
            &[&encode_name(key), &count],
        )
        .await?;
    let members: Vec<Bytes> = rows
        .into_iter()
        .map(|r| Bytes::from(r.get::<_, Vec<u8>>(0)))
        .collect();
    if !members.is_empty() {
        delete_meta_if_empty(client, key, KeyType::Set).await?;
    }
    Ok(members)
}

/// SRANDMEMBER. A negative count samples with repetition, a positive one
/// returns distinct members.
pub async fn srandmember<C: GenericClient>(
    client: &C,
    key: &[u8],
    count: i64,
) -> Result<Vec<Bytes>, StorageError> {
    if !check_type(client, key, KeyType::Set).await? {
        return Ok(Vec::new());
    }
    let stored = encode_name(key);

    if count >= 0 {
        let rows = client
            .query(
                &format!(
                    "SELECT member FROM kv_sets WHERE key = $1 AND {LIVE} \
                     ORDER BY random() LIMIT $2"
                ),
                &[&stored, &count],
            )
            .await?;
        return Ok(rows
            .into_iter()
            .map(|r| Bytes::from(r.get::<_, Vec<u8>>(0)))
            .collect());
    }

    // With repetition: draw server-side random ordinals, then map them
    let members = smembers(client, key).await?;
    if members.is_empty() {
        return Ok(Vec::new());
    }
    let rows = client
        .query(
            "SELECT floor(random() * $1)::bigint FROM generate_series(1::bigint, $2)",
            &[&(members.len() as f64), &(-count)],
        )
        .await?;
    Ok(rows
        .into_iter()
        .map(|r| {
            let ordinal = (r.get::<_, i64>(0) as usize).min(members.len() - 1);
            members[ordinal].clone()
        })
        .collect())
}

/// SMOVE. Runs inside a transaction.
pub async fn smove<C: GenericClient>(
    client: &C,
    source: &[u8],
    destination: &[u8],
    member: &[u8],
) -> Result<bool, StorageError> {
    if !check_type(client, source, KeyType::Set).await? {
        return Ok(false);
    }
    check_type(client, destination, KeyType::Set).await?;

    let removed = client
        .execute(
            &format!("DELETE FROM kv_sets WHERE key = $1 AND member = $2 AND {LIVE}"),
            &[&encode_name(source), &member],
        )
        .await?;
    if removed == 0 {
        return Ok(false);
    }

    let expires_at = current_expiry(client, destination).await?;
    client
        .execute(
            "INSERT INTO kv_sets (key, member, expires_at) VALUES ($1, $2, $3) \
             ON CONFLICT (key, member) DO NOTHING",
            &[&encode_name(destination), &member, &expires_at],
        )
        .await?;
    upsert_meta(client, destination, KeyType::Set).await?;
    delete_meta_if_empty(client, source, KeyType::Set).await?;
    Ok(true)
}

/// SINTER / SUNION / SDIFF: set algebra over the operand keys, folded
/// left to right.
pub async fn combine<C: GenericClient>(
    client: &C,
    op: SetOp,
    keys: &[Bytes],
) -> Result<Vec<Bytes>, StorageError> {
    for key in keys {
        check_type(client, key, KeyType::Set).await?;
    }

    let stored: Vec<String> = keys.iter().map(|k| encode_name(k)).collect();
    let selects: Vec<String> = (1..=stored.len())
        .map(|i| format!("SELECT member FROM kv_sets WHERE key = ${i} AND {LIVE}"))
        .collect();
    let sql = format!(
        "SELECT member FROM ({}) combined ORDER BY member",
        selects.join(&format!(" {} ", op.sql()))
    );

    let params: Vec<&(dyn ToSql + Sync)> =
        stored.iter().map(|k| k as &(dyn ToSql + Sync)).collect();
    let rows = client.query(&sql, &params).await?;
    Ok(rows
        .into_iter()
        .map(|r| Bytes::from(r.get::<_, Vec<u8>>(0)))
        .collect())
}

/// SINTERSTORE / SUNIONSTORE / SDIFFSTORE. Replaces the destination
/// wholesale; an empty result deletes it. Returns the result cardinality.
/// Runs inside a transaction.
pub async fn combine_store<C: GenericClient>(
    client: &C,
    op: SetOp,
    destination: &[u8],
    keys: &[Bytes],
) -> Result<i64, StorageError> {
    let members = combine(client, op, keys).await?;

    purge_key(client, destination).await?;
    if members.is_empty() {
        return Ok(0);
    }

    let stored = encode_name(destination);
    for member in &members {
        client
            .execute(
                "INSERT INTO kv_sets (key, member) VALUES ($1, $2)",
                &[&stored, &&member[..]],
            )
            .await?;
    }
    set_meta(client, destination, KeyType::Set, None).await?;
    Ok(members.len() as i64)
}

/// SSCAN: offset cursor over member order.
pub async fn sscan<C: GenericClient>(
    client: &C,
    key: &[u8],
    cursor: i64,
    count: i64,
) -> Result<(i64, Vec<Bytes>), StorageError> {
    if !check_type(client, key, KeyType::Set).await? {
        return Ok((0, Vec::new()));
    }
    let rows = client
        .query(
            &format!(
                "SELECT member FROM kv_sets WHERE key = $1 AND {LIVE} \
                 ORDER BY member LIMIT $2 OFFSET $3"
            ),
            &[&encode_name(key), &(count + 1), &cursor],
        )
        .await?;
    let more = rows.len() as i64 > count;
    let page: Vec<Bytes> = rows
        .into_iter()
        .take(count as usize)
        .map(|r| Bytes::from(r.get::<_, Vec<u8>>(0)))
        .collect();
    let next = if more { cursor + page.len() as i64 } else { 0 };
    Ok((next, page))
}
