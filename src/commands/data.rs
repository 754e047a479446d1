//! Data-Command Execution
//!
//! One entry point, [`run`], maps a parsed data command onto the storage
//! operations. It is generic over the client so the same code serves the
//! autocommit path (pooled connection, per-command transaction for
//! writes) and MULTI/EXEC replay (every queued command against one
//! transaction). Session-state commands (AUTH, MULTI, SUBSCRIBE, ...)
//! never reach this module.
//!
//! Blocking list commands appear here in their non-blocking form: inside
//! a transaction BLPOP degrades to a single try, which is also what Redis
//! does inside MULTI.

use crate::protocol::{format_double, RespValue};
use crate::storage::bitmap::{self, BitfieldOp, FieldSpec, OverflowMode, RangeUnit};
use crate::storage::lists::{self, Side};
use crate::storage::sets::{self, SetOp};
use crate::storage::strings::{self, Expiry, SetCondition};
use crate::storage::zsets::{self, Aggregate, ScoreBound, ZAddOptions, ZAddResult};
use crate::storage::{hashes, hyperloglog, keys, StorageError};
use crate::glob::glob_match;
use bytes::Bytes;
use tokio_postgres::GenericClient;

/// Executes one data command. The caller has already validated arity
/// against the command table; option parsing can still fail here.
pub async fn run<C: GenericClient>(
    client: &C,
    name: &str,
    args: &[Bytes],
) -> Result<RespValue, StorageError> {
    match name {
        // ---- strings ---------------------------------------------------
        "SET" => cmd_set(client, args).await,
        "SETNX" => {
            let outcome = strings::set(
                client,
                &args[0],
                &args[1],
                SetCondition::IfAbsent,
                Expiry::Clear,
                false,
            )
            .await?;
            Ok(RespValue::Integer(i64::from(outcome.applied)))
        }
        "SETEX" | "PSETEX" => {
            let amount = int_arg(&args[1])?;
            if amount <= 0 {
                return Err(StorageError::Other(format!(
                    "invalid expire time in '{}' command",
                    name.to_lowercase()
                )));
            }
            let millis = if name == "SETEX" { amount * 1000 } else { amount };
            strings::set(
                client,
                &args[0],
                &args[2],
                SetCondition::Always,
                Expiry::InMillis(millis),
                false,
            )
            .await?;
            Ok(RespValue::ok())
        }
        "GET" => Ok(bulk_or_null(strings::get(client, &args[0]).await?)),
        "GETSET" => {
            // Like SET with GET: any TTL on the key is discarded
            let outcome = strings::set(
                client,
                &args[0],
                &args[1],
                SetCondition::Always,
                Expiry::Clear,
                true,
            )
            .await?;
            Ok(bulk_or_null(outcome.old_value))
        }
        "GETDEL" => Ok(bulk_or_null(strings::getdel(client, &args[0]).await?)),
        "GETEX" => cmd_getex(client, args).await,
        "MGET" => {
            let values = strings::mget(client, args).await?;
            Ok(RespValue::Array(values.into_iter().map(bulk_or_null).collect()))
        }
        "MSET" => {
            let pairs = pair_up(&args[..])?;
            strings::mset(client, &pairs).await?;
            Ok(RespValue::ok())
        }
        "STRLEN" => Ok(RespValue::Integer(strings::strlen(client, &args[0]).await?)),
        "APPEND" => Ok(RespValue::Integer(
            strings::append(client, &args[0], &args[1]).await?,
        )),
        "INCR" => Ok(RespValue::Integer(strings::incr_by(client, &args[0], 1).await?)),
        "DECR" => Ok(RespValue::Integer(strings::incr_by(client, &args[0], -1).await?)),
        "INCRBY" => {
            let delta = int_arg(&args[1])?;
            Ok(RespValue::Integer(strings::incr_by(client, &args[0], delta).await?))
        }
        "DECRBY" => {
            let delta = int_arg(&args[1])?;
            let delta = delta.checked_neg().ok_or(StorageError::Overflow)?;
            Ok(RespValue::Integer(strings::incr_by(client, &args[0], delta).await?))
        }
        "INCRBYFLOAT" => {
            let delta = float_arg(&args[1])?;
            if !delta.is_finite() {
                return Err(StorageError::NotFloat);
            }
            let value = strings::incr_by_float(client, &args[0], delta).await?;
            Ok(RespValue::bulk_from_string(value))
        }
        "GETRANGE" | "SUBSTR" => {
            let (start, stop) = (int_arg(&args[1])?, int_arg(&args[2])?);
            Ok(RespValue::Bulk(
                strings::getrange(client, &args[0], start, stop).await?,
            ))
        }
        "SETRANGE" => {
            let offset = int_arg(&args[1])?;
            if offset < 0 {
                return Err(StorageError::Other(
                    "offset is out of range".to_string(),
                ));
            }
            Ok(RespValue::Integer(
                strings::setrange(client, &args[0], offset as usize, &args[2]).await?,
            ))
        }

        // ---- bitmaps ---------------------------------------------------
        "SETBIT" => {
            let offset = uint_arg(&args[1])?;
            let bit = match int_arg(&args[2])? {
                0 => false,
                1 => true,
                _ => {
                    return Err(StorageError::Other(
                        "bit is not an integer or out of range".to_string(),
                    ))
                }
            };
            Ok(RespValue::Integer(
                bitmap::setbit(client, &args[0], offset, bit).await?,
            ))
        }
        "GETBIT" => {
            let offset = uint_arg(&args[1])?;
            Ok(RespValue::Integer(bitmap::getbit(client, &args[0], offset).await?))
        }
        "BITCOUNT" => cmd_bitcount(client, args).await,
        "BITPOS" => cmd_bitpos(client, args).await,
        "BITOP" => {
            let op = upper_str(&args[0])?;
            if !matches!(op.as_str(), "AND" | "OR" | "XOR" | "NOT") {
                return Err(StorageError::Other("syntax error".to_string()));
            }
            if op == "NOT" && args.len() != 3 {
                return Err(StorageError::Other(
                    "BITOP NOT must be called with a single source key.".to_string(),
                ));
            }
            Ok(RespValue::Integer(
                bitmap::bitop(client, &op, &args[1], &args[2..]).await?,
            ))
        }
        "BITFIELD" => {
            let ops = parse_bitfield_ops(&args[1..])?;
            let results = bitmap::bitfield(client, &args[0], &ops).await?;
            Ok(RespValue::Array(
                results
                    .into_iter()
                    .map(|r| match r {
                        Some(v) => RespValue::Integer(v),
                        None => RespValue::Null,
                    })
                    .collect(),
            ))
        }

        // ---- hashes ----------------------------------------------------
        "HSET" | "HMSET" => {
            let pairs = pair_up(&args[1..])?;
            let new_fields = hashes::hset(client, &args[0], &pairs).await?;
            if name == "HMSET" {
                Ok(RespValue::ok())
            } else {
                Ok(RespValue::Integer(new_fields))
            }
        }
        "HSETNX" => Ok(RespValue::Integer(i64::from(
            hashes::hsetnx(client, &args[0], &args[1], &args[2]).await?,
        ))),
        "HGET" => Ok(bulk_or_null(hashes::hget(client, &args[0], &args[1]).await?)),
        "HMGET" => {
            let values = hashes::hmget(client, &args[0], &args[1..]).await?;
            Ok(RespValue::Array(values.into_iter().map(bulk_or_null).collect()))
        }
        "HDEL" => Ok(RespValue::Integer(
            hashes::hdel(client, &args[0], &args[1..]).await?,
        )),
        "HGETALL" => {
            let pairs = hashes::hgetall(client, &args[0]).await?;
            Ok(RespValue::Map(
                pairs
                    .into_iter()
                    .map(|(f, v)| (RespValue::Bulk(f), RespValue::Bulk(v)))
                    .collect(),
            ))
        }
        "HKEYS" => Ok(bulk_array(hashes::hkeys(client, &args[0]).await?)),
        "HVALS" => Ok(bulk_array(hashes::hvals(client, &args[0]).await?)),
        "HLEN" => Ok(RespValue::Integer(hashes::hlen(client, &args[0]).await?)),
        "HEXISTS" => Ok(RespValue::Integer(i64::from(
            hashes::hexists(client, &args[0], &args[1]).await?,
        ))),
        "HSTRLEN" => Ok(RespValue::Integer(
            hashes::hstrlen(client, &args[0], &args[1]).await?,
        )),
        "HINCRBY" => {
            let delta = int_arg(&args[2])?;
            Ok(RespValue::Integer(
                hashes::hincrby(client, &args[0], &args[1], delta).await?,
            ))
        }
        "HINCRBYFLOAT" => {
            let delta = float_arg(&args[2])?;
            if !delta.is_finite() {
                return Err(StorageError::NotFloat);
            }
            let value = hashes::hincrbyfloat(client, &args[0], &args[1], delta).await?;
            Ok(RespValue::bulk_from_string(value))
        }
        "HSCAN" => {
            let (cursor, pattern, count) = parse_scan_args(&args[1..])?;
            let (next, page) = hashes::hscan(client, &args[0], cursor, count).await?;
            let mut flat = Vec::new();
            for (field, value) in page {
                if pattern.as_ref().map(|p| glob_match(p, &field)).unwrap_or(true) {
                    flat.push(RespValue::Bulk(field));
                    flat.push(RespValue::Bulk(value));
                }
            }
            Ok(scan_reply(next, flat))
        }

        // ---- lists -----------------------------------------------------
        "LPUSH" | "LPUSHX" => Ok(RespValue::Integer(
            lists::push(client, &args[0], Side::Left, &args[1..], name == "LPUSHX").await?,
        )),
        "RPUSH" | "RPUSHX" => Ok(RespValue::Integer(
            lists::push(client, &args[0], Side::Right, &args[1..], name == "RPUSHX").await?,
        )),
        "LPOP" | "RPOP" => {
            let side = if name == "LPOP" { Side::Left } else { Side::Right };
            let count = match args.get(1) {
                Some(raw) => {
                    let n = int_arg(raw)?;
                    if n < 0 {
                        return Err(StorageError::Other(
                            "value is out of range, must be positive".to_string(),
                        ));
                    }
                    Some(n)
                }
                None => None,
            };
            let popped = lists::pop(client, &args[0], side, count.unwrap_or(1)).await?;
            match count {
                // Without a count the reply is a single bulk or nil
                None => Ok(popped.into_iter().next().map(RespValue::Bulk).unwrap_or(RespValue::Null)),
                Some(_) if popped.is_empty() => Ok(RespValue::NullArray),
                Some(_) => Ok(bulk_array(popped)),
            }
        }
        "LLEN" => Ok(RespValue::Integer(lists::llen(client, &args[0]).await?)),
        "LRANGE" => {
            let (start, stop) = (int_arg(&args[1])?, int_arg(&args[2])?);
            Ok(bulk_array(lists::lrange(client, &args[0], start, stop).await?))
        }
        "LINDEX" => {
            let index = int_arg(&args[1])?;
            Ok(bulk_or_null(lists::lindex(client, &args[0], index).await?))
        }
        "LSET" => {
            let index = int_arg(&args[1])?;
            lists::lset(client, &args[0], index, &args[2]).await?;
            Ok(RespValue::ok())
        }
        "LREM" => {
            let count = int_arg(&args[1])?;
            Ok(RespValue::Integer(
                lists::lrem(client, &args[0], count, &args[2]).await?,
            ))
        }
        "LTRIM" => {
            let (start, stop) = (int_arg(&args[1])?, int_arg(&args[2])?);
            lists::ltrim(client, &args[0], start, stop).await?;
            Ok(RespValue::ok())
        }
        "LINSERT" => {
            let place = upper_str(&args[1])?;
            let before = match place.as_str() {
                "BEFORE" => true,
                "AFTER" => false,
                _ => return Err(StorageError::Other("syntax error".to_string())),
            };
            Ok(RespValue::Integer(
                lists::linsert(client, &args[0], before, &args[2], &args[3]).await?,
            ))
        }
        "LPOS" => cmd_lpos(client, args).await,
        "RPOPLPUSH" => Ok(bulk_or_null(
            lists::rpoplpush(client, &args[0], &args[1]).await?,
        )),
        // Non-blocking form used inside MULTI: one try, nil on empty
        "BLPOP" | "BRPOP" => {
            let side = if name == "BLPOP" { Side::Left } else { Side::Right };
            let list_keys = &args[..args.len() - 1];
            for key in list_keys {
                let mut popped = lists::pop(client, key, side, 1).await?;
                if let Some(value) = popped.pop() {
                    return Ok(RespValue::Array(vec![
                        RespValue::Bulk(key.clone()),
                        RespValue::Bulk(value),
                    ]));
                }
            }
            Ok(RespValue::NullArray)
        }

        // ---- sets ------------------------------------------------------
        "SADD" => Ok(RespValue::Integer(
            sets::sadd(client, &args[0], &args[1..]).await?,
        )),
        "SREM" => Ok(RespValue::Integer(
            sets::srem(client, &args[0], &args[1..]).await?,
        )),
        "SMEMBERS" => Ok(bulk_set(sets::smembers(client, &args[0]).await?)),
        "SISMEMBER" => Ok(RespValue::Integer(i64::from(
            sets::sismember(client, &args[0], &args[1]).await?,
        ))),
        "SMISMEMBER" => {
            let hits = sets::smismember(client, &args[0], &args[1..]).await?;
            Ok(RespValue::Array(
                hits.into_iter().map(|h| RespValue::Integer(i64::from(h))).collect(),
            ))
        }
        "SCARD" => Ok(RespValue::Integer(sets::scard(client, &args[0]).await?)),
        "SPOP" => {
            let count = match args.get(1) {
                Some(raw) => {
                    let n = int_arg(raw)?;
                    if n < 0 {
                        return Err(StorageError::Other(
                            "value is out of range, must be positive".to_string(),
                        ));
                    }
                    Some(n)
                }
                None => None,
            };
            let popped = sets::spop(client, &args[0], count.unwrap_or(1)).await?;
            match count {
                None => Ok(popped.into_iter().next().map(RespValue::Bulk).unwrap_or(RespValue::Null)),
                Some(_) => Ok(bulk_set(popped)),
            }
        }
        "SRANDMEMBER" => {
            let count = match args.get(1) {
                Some(raw) => Some(int_arg(raw)?),
                None => None,
            };
            let members = sets::srandmember(client, &args[0], count.unwrap_or(1)).await?;
            match count {
                None => Ok(members.into_iter().next().map(RespValue::Bulk).unwrap_or(RespValue::Null)),
                Some(_) => Ok(bulk_array(members)),
            }
        }
        "SMOVE" => Ok(RespValue::Integer(i64::from(
            sets::smove(client, &args[0], &args[1], &args[2]).await?,
        ))),
        "SINTER" => Ok(bulk_set(sets::combine(client, SetOp::Inter, args).await?)),
        "SUNION" => Ok(bulk_set(sets::combine(client, SetOp::Union, args).await?)),
        "SDIFF" => Ok(bulk_set(sets::combine(client, SetOp::Diff, args).await?)),
        "SINTERSTORE" => Ok(RespValue::Integer(
            sets::combine_store(client, SetOp::Inter, &args[0], &args[1..]).await?,
        )),
        "SUNIONSTORE" => Ok(RespValue::Integer(
            sets::combine_store(client, SetOp::Union, &args[0], &args[1..]).await?,
        )),
        "SDIFFSTORE" => Ok(RespValue::Integer(
            sets::combine_store(client, SetOp::Diff, &args[0], &args[1..]).await?,
        )),
        "SSCAN" => {
            let (cursor, pattern, count) = parse_scan_args(&args[1..])?;
            let (next, page) = sets::sscan(client, &args[0], cursor, count).await?;
            let members: Vec<RespValue> = page
                .into_iter()
                .filter(|m| pattern.as_ref().map(|p| glob_match(p, m)).unwrap_or(true))
                .map(RespValue::Bulk)
                .collect();
            Ok(scan_reply(next, members))
        }

        // ---- sorted sets -----------------------------------------------
        "ZADD" => cmd_zadd(client, args).await,
        "ZSCORE" => Ok(score_or_null(
            zsets::zscore(client, &args[0], &args[1]).await?,
        )),
        "ZMSCORE" => {
            let scores = zsets::zmscore(client, &args[0], &args[1..]).await?;
            Ok(RespValue::Array(scores.into_iter().map(score_or_null).collect()))
        }
        "ZCARD" => Ok(RespValue::Integer(zsets::zcard(client, &args[0]).await?)),
        "ZCOUNT" => {
            let (min, max) = (score_bound(&args[1])?, score_bound(&args[2])?);
            Ok(RespValue::Integer(
                zsets::zcount(client, &args[0], min, max).await?,
            ))
        }
        "ZINCRBY" => {
            let delta = float_arg(&args[1])?;
            let score = zsets::zincrby(client, &args[0], delta, &args[2]).await?;
            Ok(RespValue::bulk_from_string(format_double(score)))
        }
        "ZRANGE" | "ZREVRANGE" => cmd_zrange(client, name, args).await,
        "ZRANGEBYSCORE" | "ZREVRANGEBYSCORE" => cmd_zrangebyscore(client, name, args).await,
        "ZRANK" => Ok(rank_or_null(
            zsets::zrank(client, &args[0], &args[1], false).await?,
        )),
        "ZREVRANK" => Ok(rank_or_null(
            zsets::zrank(client, &args[0], &args[1], true).await?,
        )),
        "ZREM" => Ok(RespValue::Integer(
            zsets::zrem(client, &args[0], &args[1..]).await?,
        )),
        "ZPOPMIN" | "ZPOPMAX" => {
            let count = match args.get(1) {
                Some(raw) => int_arg(raw)?,
                None => 1,
            };
            let popped = zsets::zpop(client, &args[0], name == "ZPOPMAX", count.max(0)).await?;
            Ok(scored_array(popped, true))
        }
        "ZREMRANGEBYSCORE" => {
            let (min, max) = (score_bound(&args[1])?, score_bound(&args[2])?);
            Ok(RespValue::Integer(
                zsets::zremrangebyscore(client, &args[0], min, max).await?,
            ))
        }
        "ZREMRANGEBYRANK" => {
            let (start, stop) = (int_arg(&args[1])?, int_arg(&args[2])?);
            Ok(RespValue::Integer(
                zsets::zremrangebyrank(client, &args[0], start, stop).await?,
            ))
        }
        "ZSCAN" => {
            let (cursor, pattern, count) = parse_scan_args(&args[1..])?;
            let (next, page) = zsets::zscan(client, &args[0], cursor, count).await?;
            let mut flat = Vec::new();
            for (member, score) in page {
                if pattern.as_ref().map(|p| glob_match(p, &member)).unwrap_or(true) {
                    flat.push(RespValue::Bulk(member));
                    flat.push(RespValue::bulk_from_string(format_double(score)));
                }
            }
            Ok(scan_reply(next, flat))
        }
        "ZUNIONSTORE" | "ZINTERSTORE" => cmd_zstore(client, name, args).await,

        // ---- hyperloglog -----------------------------------------------
        "PFADD" => Ok(RespValue::Integer(i64::from(
            hyperloglog::pfadd(client, &args[0], &args[1..]).await?,
        ))),
        "PFCOUNT" => Ok(RespValue::Integer(hyperloglog::pfcount(client, args).await?)),
        "PFMERGE" => {
            hyperloglog::pfmerge(client, &args[0], &args[1..]).await?;
            Ok(RespValue::ok())
        }

        // ---- key admin -------------------------------------------------
        "DEL" | "UNLINK" => Ok(RespValue::Integer(keys::del(client, args).await?)),
        "EXISTS" => Ok(RespValue::Integer(keys::exists(client, args).await?)),
        "EXPIRE" | "PEXPIRE" => {
            let amount = int_arg(&args[1])?;
            let millis = if name == "EXPIRE" {
                amount.saturating_mul(1000)
            } else {
                amount
            };
            Ok(RespValue::Integer(i64::from(
                keys::set_expiry(client, &args[0], Expiry::InMillis(millis)).await?,
            )))
        }
        "EXPIREAT" | "PEXPIREAT" => {
            let at = int_arg(&args[1])?;
            let millis = if name == "EXPIREAT" {
                at.saturating_mul(1000)
            } else {
                at
            };
            Ok(RespValue::Integer(i64::from(
                keys::set_expiry(client, &args[0], Expiry::AtMillis(millis)).await?,
            )))
        }
        "TTL" => Ok(RespValue::Integer(keys::ttl(client, &args[0], false).await?)),
        "PTTL" => Ok(RespValue::Integer(keys::ttl(client, &args[0], true).await?)),
        "PERSIST" => Ok(RespValue::Integer(i64::from(
            keys::persist(client, &args[0]).await?,
        ))),
        "KEYS" => Ok(bulk_array(keys::keys(client, &args[0]).await?)),
        "SCAN" => {
            let cursor = int_arg(&args[0])?;
            let (_, pattern, count) = parse_scan_args_from(&args[1..])?;
            let (next, page) = keys::scan(client, cursor, count).await?;
            let names: Vec<RespValue> = page
                .into_iter()
                .filter(|k| pattern.as_ref().map(|p| glob_match(p, k)).unwrap_or(true))
                .map(RespValue::Bulk)
                .collect();
            Ok(scan_reply(next, names))
        }
        "TYPE" => {
            let kt = crate::storage::key_type(client, &args[0]).await?;
            Ok(RespValue::simple_string(
                kt.map(|t| t.as_str()).unwrap_or("none"),
            ))
        }
        "RENAME" => {
            keys::rename(client, &args[0], &args[1], false).await?;
            Ok(RespValue::ok())
        }
        "RENAMENX" => Ok(RespValue::Integer(i64::from(
            keys::rename(client, &args[0], &args[1], true).await?,
        ))),
        "COPY" => {
            let replace = match args.get(2) {
                Some(raw) if upper_str(raw)? == "REPLACE" => true,
                Some(_) => return Err(StorageError::Other("syntax error".to_string())),
                None => false,
            };
            Ok(RespValue::Integer(i64::from(
                keys::copy(client, &args[0], &args[1], replace).await?,
            )))
        }
        "RANDOMKEY" => Ok(bulk_or_null(keys::randomkey(client).await?)),
        "DBSIZE" => Ok(RespValue::Integer(keys::dbsize(client).await?)),
        "FLUSHDB" | "FLUSHALL" => {
            keys::flushdb(client).await?;
            Ok(RespValue::ok())
        }

        // Queueable session commands, so they replay inside EXEC
        "PING" => Ok(match args.first() {
            Some(message) => RespValue::Bulk(message.clone()),
            None => RespValue::pong(),
        }),
        "ECHO" => Ok(RespValue::Bulk(args[0].clone())),
        "SELECT" => match &args[0][..] {
            b"0" => Ok(RespValue::ok()),
            _ => Err(StorageError::Other("DB index is out of range".to_string())),
        },
        "TIME" => {
            let now = std::time::SystemTime::now()
                .duration_since(std::time::UNIX_EPOCH)
                .unwrap_or_default();
            Ok(RespValue::Array(vec![
                RespValue::bulk_from_string(now.as_secs().to_string()),
                RespValue::bulk_from_string(now.subsec_micros().to_string()),
            ]))
        }

        other => Err(StorageError::Other(format!(
            "unknown command '{}'",
            other.to_lowercase()
        ))),
    }
}

// ---- option parsing ----------------------------------------------------

async fn cmd_set<C: GenericClient>(
    client: &C,
    args: &[Bytes],
) -> Result<RespValue, StorageError> {
    let mut condition = SetCondition::Always;
    let mut expiry = Expiry::Clear;
    let mut return_old = false;

    let mut i = 2;
    while i < args.len() {
        let option = upper_str(&args[i])?;
        match option.as_str() {
            "NX" => condition = SetCondition::IfAbsent,
            "XX" => condition = SetCondition::IfPresent,
            "GET" => return_old = true,
            "KEEPTTL" => expiry = Expiry::Keep,
            "EX" | "PX" | "EXAT" | "PXAT" => {
                let raw = args
                    .get(i + 1)
                    .ok_or_else(|| StorageError::Other("syntax error".to_string()))?;
                let amount = int_arg(raw)?;
                if matches!(option.as_str(), "EX" | "PX") && amount <= 0 {
                    return Err(StorageError::Other(
                        "invalid expire time in 'set' command".to_string(),
                    ));
                }
                expiry = match option.as_str() {
                    "EX" => Expiry::InMillis(amount.saturating_mul(1000)),
                    "PX" => Expiry::InMillis(amount),
                    "EXAT" => Expiry::AtMillis(amount.saturating_mul(1000)),
                    _ => Expiry::AtMillis(amount),
                };
                i += 1;
            }
            _ => return Err(StorageError::Other("syntax error".to_string())),
        }
        i += 1;
    }

    let outcome = strings::set(client, &args[0], &args[1], condition, expiry, return_old).await?;
    if return_old {
        Ok(bulk_or_null(outcome.old_value))
    } else if outcome.applied {
        Ok(RespValue::ok())
    } else {
        Ok(RespValue::Null)
    }
}

async fn cmd_getex<C: GenericClient>(
    client: &C,
    args: &[Bytes],
) -> Result<RespValue, StorageError> {
    let mut expiry = None;
    let mut i = 1;
    while i < args.len() {
        let option = upper_str(&args[i])?;
        match option.as_str() {
            "PERSIST" => expiry = Some(Expiry::Clear),
            "EX" | "PX" | "EXAT" | "PXAT" => {
                let raw = args
                    .get(i + 1)
                    .ok_or_else(|| StorageError::Other("syntax error".to_string()))?;
                let amount = int_arg(raw)?;
                expiry = Some(match option.as_str() {
                    "EX" => Expiry::InMillis(amount.saturating_mul(1000)),
                    "PX" => Expiry::InMillis(amount),
                    "EXAT" => Expiry::AtMillis(amount.saturating_mul(1000)),
                    _ => Expiry::AtMillis(amount),
                });
                i += 1;
            }
            _ => return Err(StorageError::Other("syntax error".to_string())),
        }
        i += 1;
    }
    Ok(bulk_or_null(strings::getex(client, &args[0], expiry).await?))
}

async fn cmd_bitcount<C: GenericClient>(
    client: &C,
    args: &[Bytes],
) -> Result<RespValue, StorageError> {
    let range = match args.len() {
        1 => None,
        3 | 4 => {
            let (start, stop) = (int_arg(&args[1])?, int_arg(&args[2])?);
            let unit = match args.get(3) {
                Some(raw) => match upper_str(raw)?.as_str() {
                    "BYTE" => RangeUnit::Byte,
                    "BIT" => RangeUnit::Bit,
                    _ => return Err(StorageError::Other("syntax error".to_string())),
                },
                None => RangeUnit::Byte,
            };
            Some((start, stop, unit))
        }
        _ => return Err(StorageError::Other("syntax error".to_string())),
    };
    Ok(RespValue::Integer(bitmap::bitcount(client, &args[0], range).await?))
}

async fn cmd_bitpos<C: GenericClient>(
    client: &C,
    args: &[Bytes],
) -> Result<RespValue, StorageError> {
    let bit = match int_arg(&args[1])? {
        0 => false,
        1 => true,
        _ => {
            return Err(StorageError::Other(
                "The bit argument must be 1 or 0.".to_string(),
            ))
        }
    };
    let start = match args.get(2) {
        Some(raw) => Some(int_arg(raw)?),
        None => None,
    };
    let stop = match args.get(3) {
        Some(raw) => Some(int_arg(raw)?),
        None => None,
    };
    let unit = match args.get(4) {
        Some(raw) => match upper_str(raw)?.as_str() {
            "BYTE" => RangeUnit::Byte,
            "BIT" => RangeUnit::Bit,
            _ => return Err(StorageError::Other("syntax error".to_string())),
        },
        None => RangeUnit::Byte,
    };
    Ok(RespValue::Integer(
        bitmap::bitpos(client, &args[0], bit, start, stop, unit).await?,
    ))
}

fn parse_bitfield_ops(args: &[Bytes]) -> Result<Vec<BitfieldOp>, StorageError> {
    let mut ops = Vec::new();
    let mut i = 0;
    while i < args.len() {
        let word = upper_str(&args[i])?;
        match word.as_str() {
            "OVERFLOW" => {
                let mode = upper_str(
                    args.get(i + 1)
                        .ok_or_else(|| StorageError::Other("syntax error".to_string()))?,
                )?;
                let mode = match mode.as_str() {
                    "WRAP" => OverflowMode::Wrap,
                    "SAT" => OverflowMode::Sat,
                    "FAIL" => OverflowMode::Fail,
                    _ => {
                        return Err(StorageError::Other(
                            "Invalid OVERFLOW type specified".to_string(),
                        ))
                    }
                };
                ops.push(BitfieldOp::Overflow(mode));
                i += 2;
            }
            "GET" => {
                let spec = parse_field_spec(args.get(i + 1), args.get(i + 2))?;
                ops.push(BitfieldOp::Get(spec));
                i += 3;
            }
            "SET" => {
                let spec = parse_field_spec(args.get(i + 1), args.get(i + 2))?;
                let value = int_arg(
                    args.get(i + 3)
                        .ok_or_else(|| StorageError::Other("syntax error".to_string()))?,
                )?;
                ops.push(BitfieldOp::Set(spec, value));
                i += 4;
            }
            "INCRBY" => {
                let spec = parse_field_spec(args.get(i + 1), args.get(i + 2))?;
                let delta = int_arg(
                    args.get(i + 3)
                        .ok_or_else(|| StorageError::Other("syntax error".to_string()))?,
                )?;
                ops.push(BitfieldOp::IncrBy(spec, delta));
                i += 4;
            }
            _ => return Err(StorageError::Other("syntax error".to_string())),
        }
    }
    Ok(ops)
}

fn parse_field_spec(
    ty: Option<&Bytes>,
    offset: Option<&Bytes>,
) -> Result<FieldSpec, StorageError> {
    let bad_type = || {
        StorageError::Other(
            "Invalid bitfield type. Use something like i16 u8. \
             Note that u64 is not supported but i64 is."
                .to_string(),
        )
    };
    let ty = ty.ok_or_else(bad_type)?;
    let ty_str = std::str::from_utf8(ty).map_err(|_| bad_type())?;
    let (signed, bits_str) = match ty_str.split_at(1) {
        ("i", rest) => (true, rest),
        ("u", rest) => (false, rest),
        _ => return Err(bad_type()),
    };
    let bits: u8 = bits_str.parse().map_err(|_| bad_type())?;
    if bits == 0 || bits > 64 || (!signed && bits > 63) {
        return Err(bad_type());
    }

    let offset = offset.ok_or_else(|| StorageError::Other("syntax error".to_string()))?;
    let offset_str = std::str::from_utf8(offset)
        .map_err(|_| StorageError::Other("bit offset is not an integer or out of range".to_string()))?;
    let resolved = if let Some(stripped) = offset_str.strip_prefix('#') {
        let n: u64 = stripped.parse().map_err(|_| {
            StorageError::Other("bit offset is not an integer or out of range".to_string())
        })?;
        n * bits as u64
    } else {
        offset_str.parse().map_err(|_| {
            StorageError::Other("bit offset is not an integer or out of range".to_string())
        })?
    };
    Ok(FieldSpec {
        signed,
        bits,
        offset: resolved,
    })
}

async fn cmd_lpos<C: GenericClient>(
    client: &C,
    args: &[Bytes],
) -> Result<RespValue, StorageError> {
    let mut rank = 1i64;
    let mut count: Option<i64> = None;
    let mut i = 2;
    while i < args.len() {
        match upper_str(&args[i])?.as_str() {
            "RANK" => {
                rank = int_arg(
                    args.get(i + 1)
                        .ok_or_else(|| StorageError::Other("syntax error".to_string()))?,
                )?;
                if rank == 0 {
                    return Err(StorageError::Other(
                        "RANK can't be zero".to_string(),
                    ));
                }
                i += 2;
            }
            "COUNT" => {
                let c = int_arg(
                    args.get(i + 1)
                        .ok_or_else(|| StorageError::Other("syntax error".to_string()))?,
                )?;
                if c < 0 {
                    return Err(StorageError::Other(
                        "COUNT can't be negative".to_string(),
                    ));
                }
                count = Some(c);
                i += 2;
            }
            // MAXLEN is accepted and ignored: the scan is bounded anyway
            "MAXLEN" => i += 2,
            _ => return Err(StorageError::Other("syntax error".to_string())),
        }
    }

    let positions = lists::lpos(client, &args[0], &args[1], rank, count).await?;
    match count {
        None => Ok(positions
            .first()
            .map(|p| RespValue::Integer(*p))
            .unwrap_or(RespValue::Null)),
        Some(_) => Ok(RespValue::Array(
            positions.into_iter().map(RespValue::Integer).collect(),
        )),
    }
}

async fn cmd_zadd<C: GenericClient>(
    client: &C,
    args: &[Bytes],
) -> Result<RespValue, StorageError> {
    let mut options = ZAddOptions::default();
    let mut i = 1;
    while i < args.len() {
        match upper_str(&args[i])?.as_str() {
            "NX" => options.nx = true,
            "XX" => options.xx = true,
            "GT" => options.gt = true,
            "LT" => options.lt = true,
            "CH" => options.ch = true,
            "INCR" => options.incr = true,
            _ => break,
        }
        i += 1;
    }
    if options.nx && (options.xx || options.gt || options.lt) {
        return Err(StorageError::Other(
            "GT, LT, and/or NX options at the same time are not compatible".to_string(),
        ));
    }

    let rest = &args[i..];
    if rest.is_empty() || rest.len() % 2 != 0 {
        return Err(StorageError::Other("syntax error".to_string()));
    }
    if options.incr && rest.len() != 2 {
        return Err(StorageError::Other(
            "INCR option supports a single increment-element pair".to_string(),
        ));
    }

    let mut pairs = Vec::with_capacity(rest.len() / 2);
    for chunk in rest.chunks(2) {
        pairs.push((score_arg(&chunk[0])?, chunk[1].clone()));
    }

    match zsets::zadd(client, &args[0], options, &pairs).await? {
        ZAddResult::Count(n) => Ok(RespValue::Integer(n)),
        ZAddResult::IncrScore(Some(score)) => {
            Ok(RespValue::bulk_from_string(format_double(score)))
        }
        ZAddResult::IncrScore(None) => Ok(RespValue::Null),
    }
}

async fn cmd_zrange<C: GenericClient>(
    client: &C,
    name: &str,
    args: &[Bytes],
) -> Result<RespValue, StorageError> {
    let (start, stop) = (int_arg(&args[1])?, int_arg(&args[2])?);
    let mut rev = name == "ZREVRANGE";
    let mut withscores = false;
    for raw in &args[3..] {
        match upper_str(raw)?.as_str() {
            "WITHSCORES" => withscores = true,
            "REV" if name == "ZRANGE" => rev = true,
            _ => return Err(StorageError::Other("syntax error".to_string())),
        }
    }
    let entries = zsets::zrange_by_rank(client, &args[0], start, stop, rev).await?;
    Ok(scored_array(entries, withscores))
}

async fn cmd_zrangebyscore<C: GenericClient>(
    client: &C,
    name: &str,
    args: &[Bytes],
) -> Result<RespValue, StorageError> {
    let rev = name == "ZREVRANGEBYSCORE";
    // In the REV form the bounds arrive max-first
    let (min, max) = if rev {
        (score_bound(&args[2])?, score_bound(&args[1])?)
    } else {
        (score_bound(&args[1])?, score_bound(&args[2])?)
    };

    let mut withscores = false;
    let mut offset = 0i64;
    let mut count = -1i64;
    let mut i = 3;
    while i < args.len() {
        match upper_str(&args[i])?.as_str() {
            "WITHSCORES" => {
                withscores = true;
                i += 1;
            }
            "LIMIT" => {
                offset = int_arg(
                    args.get(i + 1)
                        .ok_or_else(|| StorageError::Other("syntax error".to_string()))?,
                )?;
                count = int_arg(
                    args.get(i + 2)
                        .ok_or_else(|| StorageError::Other("syntax error".to_string()))?,
                )?;
                i += 3;
            }
            _ => return Err(StorageError::Other("syntax error".to_string())),
        }
    }

    let entries =
        zsets::zrange_by_score(client, &args[0], min, max, rev, offset, count).await?;
    Ok(scored_array(entries, withscores))
}

async fn cmd_zstore<C: GenericClient>(
    client: &C,
    name: &str,
    args: &[Bytes],
) -> Result<RespValue, StorageError> {
    let numkeys = int_arg(&args[1])?;
    if numkeys <= 0 {
        return Err(StorageError::Other(
            "at least 1 input key is needed for ZUNIONSTORE/ZINTERSTORE".to_string(),
        ));
    }
    let numkeys = numkeys as usize;
    if args.len() < 2 + numkeys {
        return Err(StorageError::Other("syntax error".to_string()));
    }
    let source_keys = &args[2..2 + numkeys];
    let mut weights = vec![1.0f64; numkeys];
    let mut aggregate = Aggregate::Sum;

    let mut i = 2 + numkeys;
    while i < args.len() {
        match upper_str(&args[i])?.as_str() {
            "WEIGHTS" => {
                if args.len() < i + 1 + numkeys {
                    return Err(StorageError::Other("syntax error".to_string()));
                }
                for (w, raw) in weights.iter_mut().zip(&args[i + 1..i + 1 + numkeys]) {
                    *w = score_arg(raw)?;
                }
                i += 1 + numkeys;
            }
            "AGGREGATE" => {
                aggregate = match upper_str(
                    args.get(i + 1)
                        .ok_or_else(|| StorageError::Other("syntax error".to_string()))?,
                )?
                .as_str()
                {
                    "SUM" => Aggregate::Sum,
                    "MIN" => Aggregate::Min,
                    "MAX" => Aggregate::Max,
                    _ => return Err(StorageError::Other("syntax error".to_string())),
                };
                i += 2;
            }
            _ => return Err(StorageError::Other("syntax error".to_string())),
        }
    }

    let stored = zsets::zstore(
        client,
        name == "ZINTERSTORE",
        &args[0],
        source_keys,
        &weights,
        aggregate,
    )
    .await?;
    Ok(RespValue::Integer(stored))
}

// ---- argument helpers --------------------------------------------------

pub(crate) fn int_arg(raw: &Bytes) -> Result<i64, StorageError> {
    std::str::from_utf8(raw)
        .ok()
        .and_then(|s| s.parse().ok())
        .ok_or(StorageError::NotInteger)
}

fn uint_arg(raw: &Bytes) -> Result<u64, StorageError> {
    std::str::from_utf8(raw)
        .ok()
        .and_then(|s| s.parse().ok())
        .ok_or(StorageError::NotInteger)
}

fn float_arg(raw: &Bytes) -> Result<f64, StorageError> {
    std::str::from_utf8(raw)
        .ok()
        .and_then(|s| s.parse().ok())
        .ok_or(StorageError::NotFloat)
}

/// Score parsing accepts the infinity spellings ZADD allows.
fn score_arg(raw: &Bytes) -> Result<f64, StorageError> {
    let s = std::str::from_utf8(raw).map_err(|_| StorageError::NotFloat)?;
    match s.to_ascii_lowercase().as_str() {
        "inf" | "+inf" | "infinity" | "+infinity" => Ok(f64::INFINITY),
        "-inf" | "-infinity" => Ok(f64::NEG_INFINITY),
        _ => s.parse().map_err(|_| StorageError::NotFloat),
    }
}

/// Interval endpoint: optional `(` prefix for exclusive, plus infinities.
fn score_bound(raw: &Bytes) -> Result<ScoreBound, StorageError> {
    let s = std::str::from_utf8(raw)
        .map_err(|_| StorageError::Other("min or max is not a float".to_string()))?;
    let (exclusive, rest) = match s.strip_prefix('(') {
        Some(rest) => (true, rest),
        None => (false, s),
    };
    let value = match rest.to_ascii_lowercase().as_str() {
        "inf" | "+inf" | "infinity" | "+infinity" => f64::INFINITY,
        "-inf" | "-infinity" => f64::NEG_INFINITY,
        _ => rest
            .parse()
            .map_err(|_| StorageError::Other("min or max is not a float".to_string()))?,
    };
    Ok(ScoreBound { value, exclusive })
}

fn upper_str(raw: &Bytes) -> Result<String, StorageError> {
    std::str::from_utf8(raw)
        .map(|s| s.to_uppercase())
        .map_err(|_| StorageError::Other("syntax error".to_string()))
}

fn pair_up(args: &[Bytes]) -> Result<Vec<(Bytes, Bytes)>, StorageError> {
    if args.is_empty() || args.len() % 2 != 0 {
        return Err(StorageError::Other("wrong number of arguments".to_string()));
    }
    Ok(args
        .chunks(2)
        .map(|c| (c[0].clone(), c[1].clone()))
        .collect())
}

/// `MATCH` / `COUNT` options for the SCAN family (after the cursor).
fn parse_scan_args(args: &[Bytes]) -> Result<(i64, Option<Bytes>, i64), StorageError> {
    let cursor = int_arg(&args[0])?;
    let (_, pattern, count) = parse_scan_args_from(&args[1..])?;
    Ok((cursor, pattern, count))
}

fn parse_scan_args_from(rest: &[Bytes]) -> Result<(i64, Option<Bytes>, i64), StorageError> {
    let mut pattern = None;
    let mut count = 10i64;
    let mut i = 0;
    while i < rest.len() {
        match upper_str(&rest[i])?.as_str() {
            "MATCH" => {
                pattern = Some(
                    rest.get(i + 1)
                        .ok_or_else(|| StorageError::Other("syntax error".to_string()))?
                        .clone(),
                );
                i += 2;
            }
            "COUNT" => {
                count = int_arg(
                    rest.get(i + 1)
                        .ok_or_else(|| StorageError::Other("syntax error".to_string()))?,
                )?;
                if count <= 0 {
                    return Err(StorageError::Other("syntax error".to_string()));
                }
                i += 2;
            }
            _ => return Err(StorageError::Other("syntax error".to_string())),
        }
    }
    Ok((0, pattern, count))
}

// ---- reply helpers -----------------------------------------------------

fn bulk_or_null(value: Option<Bytes>) -> RespValue {
    value.map(RespValue::Bulk).unwrap_or(RespValue::Null)
}

fn bulk_array(values: Vec<Bytes>) -> RespValue {
    RespValue::Array(values.into_iter().map(RespValue::Bulk).collect())
}

fn bulk_set(values: Vec<Bytes>) -> RespValue {
    RespValue::Set(values.into_iter().map(RespValue::Bulk).collect())
}

fn score_or_null(score: Option<f64>) -> RespValue {
    score
        .map(|s| RespValue::bulk_from_string(format_double(s)))
        .unwrap_or(RespValue::Null)
}

fn rank_or_null(rank: Option<i64>) -> RespValue {
    rank.map(RespValue::Integer).unwrap_or(RespValue::Null)
}

fn scored_array(entries: Vec<(Bytes, f64)>, withscores: bool) -> RespValue {
    let mut out = Vec::with_capacity(entries.len() * if withscores { 2 } else { 1 });
    for (member, score) in entries {
        out.push(RespValue::Bulk(member));
        if withscores {
            out.push(RespValue::bulk_from_string(format_double(score)));
        }
    }
    RespValue::Array(out)
}

fn scan_reply(cursor: i64, items: Vec<RespValue>) -> RespValue {
    RespValue::Array(vec![
        RespValue::bulk_from_string(cursor.to_string()),
        RespValue::Array(items),
    ])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_score_bound_parsing() {
        let b = score_bound(&Bytes::from("1.5")).unwrap();
        assert_eq!(b, ScoreBound { value: 1.5, exclusive: false });
        let b = score_bound(&Bytes::from("(2")).unwrap();
        assert_eq!(b, ScoreBound { value: 2.0, exclusive: true });
        let b = score_bound(&Bytes::from("-inf")).unwrap();
        assert_eq!(b.value, f64::NEG_INFINITY);
        assert!(score_bound(&Bytes::from("abc")).is_err());
    }

    #[test]
    fn test_bitfield_spec_parsing() {
        let spec = parse_field_spec(Some(&Bytes::from("u8")), Some(&Bytes::from("16"))).unwrap();
        assert!(!spec.signed);
        assert_eq!(spec.bits, 8);
        assert_eq!(spec.offset, 16);

        // '#' offsets are in units of the field width
        let spec = parse_field_spec(Some(&Bytes::from("i16")), Some(&Bytes::from("#3"))).unwrap();
        assert!(spec.signed);
        assert_eq!(spec.offset, 48);

        // u64 is not a thing, i64 is
        assert!(parse_field_spec(Some(&Bytes::from("u64")), Some(&Bytes::from("0"))).is_err());
        assert!(parse_field_spec(Some(&Bytes::from("i64")), Some(&Bytes::from("0"))).is_ok());
    }

    #[test]
    fn test_scan_option_parsing() {
        let (cursor, pattern, count) =
            parse_scan_args(&[Bytes::from("40"), Bytes::from("MATCH"), Bytes::from("u:*")])
                .unwrap();
        assert_eq!(cursor, 40);
        assert_eq!(pattern, Some(Bytes::from("u:*")));
        assert_eq!(count, 10);

        let (_, _, count) = parse_scan_args(&[
            Bytes::from("0"),
            Bytes::from("count"),
            Bytes::from("200"),
        ])
        .unwrap();
        assert_eq!(count, 200);
    }

    #[test]
    fn test_pair_up_rejects_odd() {
        assert!(pair_up(&[Bytes::from("a")]).is_err());
        assert_eq!(
            pair_up(&[Bytes::from("a"), Bytes::from("1")]).unwrap(),
            vec![(Bytes::from("a"), Bytes::from("1"))]
        );
    }
}
