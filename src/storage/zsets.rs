//! Sorted-Set Operations
//!
//! Sorted sets are `(key, member) -> score` rows ordered by
//! `(score ASC, member ASC)`; ties always break on member bytes, which is
//! what the `(key, score)` index plus the member sort key give every range
//! query below. Scores are `float8`, and ±infinity travel natively.

use crate::storage::encoding::encode_name;
use crate::storage::error::StorageError;
use crate::storage::schema::LIVE;
use crate::storage::{
    check_type, current_expiry, delete_meta_if_empty, purge_key, set_meta, upsert_meta, KeyType,
};
use bytes::Bytes;
use tokio_postgres::types::ToSql;
use tokio_postgres::GenericClient;

/// A score interval endpoint (`(1.5`, `2`, `-inf`, ...).
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ScoreBound {
    pub value: f64,
    pub exclusive: bool,
}

impl ScoreBound {
    pub fn inclusive(value: f64) -> Self {
        Self {
            value,
            exclusive: false,
        }
    }

    fn min_op(self) -> &'static str {
        if self.exclusive {
            ">"
        } else {
            ">="
        }
    }

    fn max_op(self) -> &'static str {
        if self.exclusive {
            "<"
        } else {
            "<="
        }
    }
}

/// ZADD update conditions.
#[derive(Debug, Clone, Copy, Default)]
pub struct ZAddOptions {
    pub nx: bool,
    pub xx: bool,
    pub gt: bool,
    pub lt: bool,
    pub ch: bool,
    pub incr: bool,
}

/// What ZADD reports back.
#[derive(Debug)]
pub enum ZAddResult {
    /// Number of added (or, with CH, added-plus-changed) members.
    Count(i64),
    /// New score for INCR mode; `None` when NX/XX/GT/LT blocked the write.
    IncrScore(Option<f64>),
}

/// ZADD. Runs inside a transaction.
pub async fn zadd<C: GenericClient>(
    client: &C,
    key: &[u8],
    options: ZAddOptions,
    pairs: &[(f64, Bytes)],
) -> Result<ZAddResult, StorageError> {
    check_type(client, key, KeyType::ZSet).await?;
    let expires_at = current_expiry(client, key).await?;

    let mut added = 0i64;
    let mut changed = 0i64;
    let mut incr_score = None;

    for (score, member) in pairs {
        let existing = score_of(client, key, member).await?;

        let new_score = if options.incr {
            match existing {
                Some(old) => {
                    let next = old + score;
                    if next.is_nan() {
                        return Err(StorageError::Other(
                            "resulting score is not a number (NaN)".to_string(),
                        ));
                    }
                    next
                }
                None => *score,
            }
        } else {
            *score
        };

        let blocked = match existing {
            Some(old) => {
                options.nx
                    || (options.gt && new_score <= old)
                    || (options.lt && new_score >= old)
            }
            None => options.xx,
        };
        if blocked {
            if options.incr {
                incr_score = None;
            }
            continue;
        }

        match existing {
            None => {
                client
                    .execute(
                        "INSERT INTO kv_zsets (key, member, score, expires_at) \
                         VALUES ($1, $2, $3, $4)",
                        &[&encode_name(key), &&member[..], &new_score, &expires_at],
                    )
                    .await?;
                added += 1;
                changed += 1;
            }
            Some(old) => {
                if old != new_score {
                    client
                        .execute(
                            &format!(
                                "UPDATE kv_zsets SET score = $3 \
                                 WHERE key = $1 AND member = $2 AND {LIVE}"
                            ),
                            &[&encode_name(key), &&member[..], &new_score],
                        )
                        .await?;
                    changed += 1;
                }
            }
        }
        if options.incr {
            incr_score = Some(new_score);
        }
    }

    if added > 0 {
        upsert_meta(client, key, KeyType::ZSet).await?;
    }

    if options.incr {
        Ok(ZAddResult::IncrScore(incr_score))
    } else if options.ch {
        Ok(ZAddResult::Count(changed))
    } else {
        Ok(ZAddResult::Count(added))
    }
}

pub async fn zscore<C: GenericClient>(
    client: &C,
    key: &[u8],
    member: &[u8],
) -> Result<Option<f64>, StorageError> {
    if !check_type(client, key, KeyType::ZSet).await? {
        return Ok(None);
    }
    score_of(client, key, member).await
}

pub async fn zmscore<C: GenericClient>(
    client: &C,
    key: &[u8],
    members: &[Bytes],
) -> Result<Vec<Option<f64>>, StorageError> {
    if !check_type(client, key, KeyType::ZSet).await? {
        return Ok(vec![None; members.len()]);
    }
    let mut out = Vec::with_capacity(members.len());
    for member in members {
        out.push(score_of(client, key, member).await?);
    }
    Ok(out)
}

pub async fn zcard<C: GenericClient>(client: &C, key: &[u8]) -> Result<i64, StorageError> {
    if !check_type(client, key, KeyType::ZSet).await? {
        return Ok(0);
    }
    let row = client
        .query_one(
            &format!("SELECT COUNT(*) FROM kv_zsets WHERE key = $1 AND {LIVE}"),
            &[&encode_name(key)],
        )
        .await?;
    Ok(row.get(0))
}

pub async fn zcount<C: GenericClient>(
    client: &C,
    key: &[u8],
    min: ScoreBound,
    max: ScoreBound,
) -> Result<i64, StorageError> {
    if !check_type(client, key, KeyType::ZSet).await? {
        return Ok(0);
    }
    let row = client
        .query_one(
            &format!(
                "SELECT COUNT(*) FROM kv_zsets \
                 WHERE key = $1 AND {LIVE} AND score {} $2 AND score {} $3",
                min.min_op(),
                max.max_op()
            ),
            &[&encode_name(key), &min.value, &max.value],
        )
        .await?;
    Ok(row.get(0))
}

/// ZINCRBY. Runs inside a transaction.
pub async fn zincrby<C: GenericClient>(
    client: &C,
    key: &[u8],
    delta: f64,
    member: &[u8],
) -> Result<f64, StorageError> {
    let result = zadd(
        client,
        key,
        ZAddOptions {
            incr: true,
            ..Default::default()
        },
        &[(delta, Bytes::copy_from_slice(member))],
    )
    .await?;
    match result {
        ZAddResult::IncrScore(Some(score)) => Ok(score),
        // Unconditional INCR is never blocked
        _ => Err(StorageError::Other("ZINCRBY failed".to_string())),
    }
}

/// ZRANGE / ZREVRANGE by rank.
pub async fn zrange_by_rank<C: GenericClient>(
    client: &C,
    key: &[u8],
    start: i64,
    stop: i64,
    rev: bool,
) -> Result<Vec<(Bytes, f64)>, StorageError> {
    let card = zcard(client, key).await?;
    let Some((from, to)) = crate::storage::normalize_range(start, stop, card) else {
        return Ok(Vec::new());
    };
    let order = if rev {
        "score DESC, member DESC"
    } else {
        "score ASC, member ASC"
    };
    let rows = client
        .query(
            &format!(
                "SELECT member, score FROM kv_zsets WHERE key = $1 AND {LIVE} \
                 ORDER BY {order} LIMIT $2 OFFSET $3"
            ),
            &[&encode_name(key), &(to - from), &from],
        )
        .await?;
    Ok(rows
        .into_iter()
        .map(|r| (Bytes::from(r.get::<_, Vec<u8>>(0)), r.get(1)))
        .collect())
}

/// ZRANGEBYSCORE / ZREVRANGEBYSCORE with LIMIT.
pub async fn zrange_by_score<C: GenericClient>(
    client: &C,
    key: &[u8],
    min: ScoreBound,
    max: ScoreBound,
    rev: bool,
    offset: i64,
    count: i64,
) -> Result<Vec<(Bytes, f64)>, StorageError> {
    if !check_type(client, key, KeyType::ZSet).await? {
        return Ok(Vec::new());
    }
    let order = if rev {
        "score DESC, member DESC"
    } else {
        "score ASC, member ASC"
    };
    let limit = if count < 0 {
        "ALL".to_string()
    } else {
        count.to_string()
    };
    let rows = client
        .query(
            &format!(
                "SELECT member, score FROM kv_zsets \
                 WHERE key = $1 AND {LIVE} AND score {} $2 AND score {} $3 \
                 ORDER BY {order} LIMIT {limit} OFFSET $4",
                min.min_op(),
                max.max_op()
            ),
            &[&encode_name(key), &min.value, &max.value, &offset.max(0)],
        )
        .await?;
    Ok(rows
        .into_iter()
        .map(|r| (Bytes::from(r.get::<_, Vec<u8>>(0)), r.get(1)))
        .collect())
}

/// ZRANK / ZREVRANK.
pub async fn zrank<C: GenericClient>(
    client: &C,
    key: &[u8],
    member: &[u8],
    rev: bool,
) -> Result<Option<i64>, StorageError> {
    if !check_type(client, key, KeyType::ZSet).await? {
        return Ok(None);
    }
    let Some(score) = score_of(client, key, member).await? else {
        return Ok(None);
    };
    let before = if rev {
        "(score > $2 OR (score = $2 AND member > $3))"
    } else {
        "(score < $2 OR (score = $2 AND member < $3))"
    };
    let row = client
        .query_one(
            &format!("SELECT COUNT(*) FROM kv_zsets WHERE key = $1 AND {LIVE} AND {before}"),
            &[&encode_name(key), &score, &member],
        )
        .await?;
    Ok(Some(row.get(0)))
}

/// ZREM. Runs inside a transaction.
pub async fn zrem<C: GenericClient>(
    client: &C,
    key: &[u8],
    members: &[Bytes],
) -> Result<i64, StorageError> {
    if !check_type(client, key, KeyType::ZSet).await? {
        return Ok(0);
    }
    let byte_members: Vec<&[u8]> = members.iter().map(|m| &m[..]).collect();
    let removed = client
        .execute(
            &format!("DELETE FROM kv_zsets WHERE key = $1 AND member = ANY($2) AND {LIVE}"),
            &[&encode_name(key), &byte_members],
        )
        .await? as i64;
    if removed > 0 {
        delete_meta_if_empty(client, key, KeyType::ZSet).await?;
    }
    Ok(removed)
}

/// ZPOPMIN / ZPOPMAX. Single-statement delete with SKIP LOCKED, same
/// pattern as list pops. Runs inside a transaction.
pub async fn zpop<C: GenericClient>(
    client: &C,
    key: &[u8],
    pop_max: bool,
    count: i64,
) -> Result<Vec<(Bytes, f64)>, StorageError> {
    if !check_type(client, key, KeyType::ZSet).await? {
        return Ok(Vec::new());
    }
    let order = if pop_max {
        "score DESC, member DESC"
    } else {
        "score ASC, member ASC"
    };
    let rows = client
        .query(
            &format!(
                "WITH candidate AS ( \
                     SELECT member FROM kv_zsets \
                     WHERE key = $1 AND {LIVE} \
                     ORDER BY {order} LIMIT $2 \
                     FOR UPDATE SKIP LOCKED \
                 ), popped AS ( \
                     DELETE FROM kv_zsets z USING candidate c \
                     WHERE z.key = $1 AND z.member = c.member \
                     RETURNING z.member, z.score \
                 ) SELECT member, score FROM popped ORDER BY {order}"
            ),
            &[&encode_name(key), &count],
        )
        .await?;
    let popped: Vec<(Bytes, f64)> = rows
        .into_iter()
        .map(|r| (Bytes::from(r.get::<_, Vec<u8>>(0)), r.get(1)))
        .collect();
    if !popped.is_empty() {
        delete_meta_if_empty(client, key, KeyType::ZSet).await?;
    }
    Ok(popped)
}

/// ZREMRANGEBYSCORE. Runs inside a transaction.
pub async fn zremrangebyscore<C: GenericClient>(
    client: &C,
    key: &[u8],
    min: ScoreBound,
    max: ScoreBound,
) -> Result<i64, StorageError> {
    if !check_type(client, key, KeyType::ZSet).await? {
        return Ok(0);
    }
    let removed = client
        .execute(
            &format!(
                "DELETE FROM kv_zsets \
                 WHERE key = $1 AND {LIVE} AND score {} $2 AND score {} $3",
                min.min_op(),
                max.max_op()
            ),
            &[&encode_name(key), &min.value, &max.value],
        )
        .await? as i64;
    if removed > 0 {
        delete_meta_if_empty(client, key, KeyType::ZSet).await?;
    }
    Ok(removed)
}

/// ZREMRANGEBYRANK. Runs inside a transaction.
pub async fn zremrangebyrank<C: GenericClient>(
    client: &C,
    key: &[u8],
    start: i64,
    stop: i64,
) -> Result<i64, StorageError> {
    let card = zcard(client, key).await?;
    let Some((from, to)) = crate::storage::normalize_range(start, stop, card) else {
        return Ok(0);
    };
    let removed = client
        .execute(
            &format!(
                "DELETE FROM kv_zsets WHERE key = $1 AND member IN ( \
                     SELECT member FROM ( \
                         SELECT member, row_number() OVER (ORDER BY score, member) - 1 AS rn \
                         FROM kv_zsets WHERE key = $1 AND {LIVE} \
                     ) ranked WHERE rn >= $2 AND rn < $3)"
            ),
            &[&encode_name(key), &from, &to],
        )
        .await? as i64;
    if removed > 0 {
        delete_meta_if_empty(client, key, KeyType::ZSet).await?;
    }
    Ok(removed)
}

/// ZSCAN: offset cursor over member order.
pub async fn zscan<C: GenericClient>(
    client: &C,
    key: &[u8],
    cursor: i64,
    count: i64,
) -> Result<(i64, Vec<(Bytes, f64)>), StorageError> {
    if !check_type(client, key, KeyType::ZSet).await? {
        return Ok((0, Vec::new()));
    }
    let rows = client
        .query(
            &format!(
                "SELECT member, score FROM kv_zsets WHERE key = $1 AND {LIVE} \
                 ORDER BY member LIMIT $2 OFFSET $3"
            ),
            &[&encode_name(key), &(count + 1), &cursor],
        )
        .await?;
    let more = rows.len() as i64 > count;
    let page: Vec<(Bytes, f64)> = rows
        .into_iter()
        .take(count as usize)
        .map(|r| (Bytes::from(r.get::<_, Vec<u8>>(0)), r.get(1)))
        .collect();
    let next = if more { cursor + page.len() as i64 } else { 0 };
    Ok((next, page))
}

/// Score aggregation for ZUNIONSTORE / ZINTERSTORE.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Aggregate {
    #[default]
    Sum,
    Min,
    Max,
}

impl Aggregate {
    fn sql(self) -> &'static str {
        match self {
            Aggregate::Sum => "SUM",
            Aggregate::Min => "MIN",
            Aggregate::Max => "MAX",
        }
    }
}

/// ZUNIONSTORE / ZINTERSTORE with WEIGHTS and AGGREGATE. Replaces the
/// destination wholesale; returns the result cardinality. Runs inside a
/// transaction.
pub async fn zstore<C: GenericClient>(
    client: &C,
    intersect: bool,
    destination: &[u8],
    keys: &[Bytes],
    weights: &[f64],
    aggregate: Aggregate,
) -> Result<i64, StorageError> {
    for key in keys {
        check_type(client, key, KeyType::ZSet).await?;
    }

    let stored: Vec<String> = keys.iter().map(|k| encode_name(k)).collect();
    let selects: Vec<String> = (0..stored.len())
        .map(|i| {
            format!(
                "SELECT member, score * ${} AS weighted FROM kv_zsets \
                 WHERE key = ${} AND {LIVE}",
                2 * i + 2,
                2 * i + 1
            )
        })
        .collect();
    let having = if intersect {
        format!("HAVING COUNT(*) = {}", keys.len())
    } else {
        String::new()
    };
    let sql = format!(
        "SELECT member, {}(weighted) FROM ({}) src GROUP BY member {having}",
        aggregate.sql(),
        selects.join(" UNION ALL ")
    );

    let mut params: Vec<&(dyn ToSql + Sync)> = Vec::with_capacity(keys.len() * 2);
    for (key, weight) in stored.iter().zip(weights.iter()) {
        params.push(key as &(dyn ToSql + Sync));
        params.push(weight as &(dyn ToSql + Sync));
    }
    let rows = client.query(&sql, &params).await?;
    let members: Vec<(Vec<u8>, f64)> = rows
        .into_iter()
        .map(|r| (r.get::<_, Vec<u8>>(0), r.get(1)))
        .collect();

    purge_key(client, destination).await?;
    if members.is_empty() {
        return Ok(0);
    }
    let dest_stored = encode_name(destination);
    for (member, score) in &members {
        client
            .execute(
                "INSERT INTO kv_zsets (key, member, score) VALUES ($1, $2, $3)",
                &[&dest_stored, &member.as_slice(), &score],
            )
            .await?;
    }
    set_meta(client, destination, KeyType::ZSet, None).await?;
    Ok(members.len() as i64)
}

async fn score_of<C: GenericClient>(
    client: &C,
    key: &[u8],
    member: &[u8],
) -> Result<Option<f64>, StorageError> {
    let row = client
        .query_opt(
            &format!("SELECT score FROM kv_zsets WHERE key = $1 AND member = $2 AND {LIVE}"),
            &[&encode_name(key), &member],
        )
        .await?;
    Ok(row.map(|r| r.get(0)))
}
