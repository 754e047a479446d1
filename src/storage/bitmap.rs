//! Bitmap Operations
//!
//! Bitmaps are plain string values addressed at the bit level. Every
//! operation here fetches the value, works on it in memory, and (for
//! writes) stores it back inside the caller's transaction, which keeps the
//! read-modify-write atomic without bit arithmetic in SQL.

use crate::storage::error::StorageError;
use crate::storage::strings::{read_for_update, write_preserving_ttl};
use crate::storage::{check_type, purge_key, KeyType};
use bytes::Bytes;
use tokio_postgres::GenericClient;

/// Redis caps bit offsets at 4 Gi (512 MB strings).
const MAX_BIT_OFFSET: u64 = 4 * 1024 * 1024 * 1024 - 1;

/// Range unit for BITCOUNT / BITPOS.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RangeUnit {
    Byte,
    Bit,
}

/// A BITFIELD field descriptor: `u8`/`i16`/… plus a resolved bit offset.
#[derive(Debug, Clone, Copy)]
pub struct FieldSpec {
    pub signed: bool,
    pub bits: u8,
    pub offset: u64,
}

/// BITFIELD overflow behavior.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OverflowMode {
    #[default]
    Wrap,
    Sat,
    Fail,
}

/// One BITFIELD subcommand.
#[derive(Debug, Clone, Copy)]
pub enum BitfieldOp {
    Get(FieldSpec),
    Set(FieldSpec, i64),
    IncrBy(FieldSpec, i64),
    Overflow(OverflowMode),
}

/// SETBIT. Returns the previous bit. Runs inside a transaction.
pub async fn setbit<C: GenericClient>(
    client: &C,
    key: &[u8],
    offset: u64,
    bit: bool,
) -> Result<i64, StorageError> {
    if offset > MAX_BIT_OFFSET {
        return Err(StorageError::Other(
            "bit offset is not an integer or out of range".to_string(),
        ));
    }
    let mut value = read_for_update(client, key).await?.unwrap_or_default().to_vec();
    let byte = (offset / 8) as usize;
    if value.len() <= byte {
        value.resize(byte + 1, 0);
    }
    let mask = 0x80u8 >> (offset % 8);
    let old = (value[byte] & mask) != 0;
    if bit {
        value[byte] |= mask;
    } else {
        value[byte] &= !mask;
    }
    write_preserving_ttl(client, key, &value).await?;
    Ok(i64::from(old))
}

/// GETBIT. Bits past the end of the value read as 0.
pub async fn getbit<C: GenericClient>(
    client: &C,
    key: &[u8],
    offset: u64,
) -> Result<i64, StorageError> {
    if offset > MAX_BIT_OFFSET {
        return Err(StorageError::Other(
            "bit offset is not an integer or out of range".to_string(),
        ));
    }
    let Some(value) = crate::storage::strings::get(client, key).await? else {
        return Ok(0);
    };
    let byte = (offset / 8) as usize;
    if byte >= value.len() {
        return Ok(0);
    }
    Ok(i64::from((value[byte] & (0x80 >> (offset % 8))) != 0))
}

/// BITCOUNT over an optional byte- or bit-addressed range.
pub async fn bitcount<C: GenericClient>(
    client: &C,
    key: &[u8],
    range: Option<(i64, i64, RangeUnit)>,
) -> Result<i64, StorageError> {
    let Some(value) = crate::storage::strings::get(client, key).await? else {
        return Ok(0);
    };

    match range {
        None => Ok(value.iter().map(|b| b.count_ones() as i64).sum()),
        Some((start, stop, RangeUnit::Byte)) => {
            match crate::storage::normalize_range(start, stop, value.len() as i64) {
                Some((a, b)) => Ok(value[a as usize..b as usize]
                    .iter()
                    .map(|x| x.count_ones() as i64)
                    .sum()),
                None => Ok(0),
            }
        }
        Some((start, stop, RangeUnit::Bit)) => {
            let total_bits = value.len() as i64 * 8;
            match crate::storage::normalize_range(start, stop, total_bits) {
                Some((a, b)) => {
                    let mut count = 0i64;
                    for pos in a..b {
                        let byte = value[(pos / 8) as usize];
                        if byte & (0x80 >> (pos % 8)) != 0 {
                            count += 1;
                        }
                    }
                    Ok(count)
                }
                None => Ok(0),
            }
        }
    }
}

/// BITPOS: first position of `bit` within the range. Follows Redis's edge
/// cases: a missing key is all zeros; searching for 0 in an all-ones
/// value without an explicit end returns one past the last bit.
pub async fn bitpos<C: GenericClient>(
    client: &C,
    key: &[u8],
    bit: bool,
    start: Option<i64>,
    stop: Option<i64>,
    unit: RangeUnit,
) -> Result<i64, StorageError> {
    let value = crate::storage::strings::get(client, key).await?;
    let Some(value) = value else {
        return Ok(if bit { -1 } else { 0 });
    };

    let total_bits = value.len() as i64 * 8;
    let explicit_end = stop.is_some();
    let (lo, hi) = match unit {
        RangeUnit::Byte => {
            let start = start.unwrap_or(0);
            let stop = stop.unwrap_or(-1);
            match crate::storage::normalize_range(start, stop, value.len() as i64) {
                Some((a, b)) => (a * 8, b * 8),
                None => return Ok(-1),
            }
        }
        RangeUnit::Bit => {
            let start = start.unwrap_or(0);
            let stop = stop.unwrap_or(-1);
            match crate::storage::normalize_range(start, stop, total_bits) {
                Some((a, b)) => (a, b),
                None => return Ok(-1),
            }
        }
    };

    for pos in lo..hi {
        let is_set = value[(pos / 8) as usize] & (0x80 >> (pos % 8)) != 0;
        if is_set == bit {
            return Ok(pos);
        }
    }

    // Searching for 0 over the whole tail of an all-ones value finds the
    // first bit past the value
    if !bit && !explicit_end {
        return Ok(total_bits);
    }
    Ok(-1)
}

/// BITOP. Stores the combined value at `dest`, returns its length. Runs
/// inside a transaction.
pub async fn bitop<C: GenericClient>(
    client: &C,
    op: &str,
    dest: &[u8],
    keys: &[Bytes],
) -> Result<i64, StorageError> {
    let mut sources = Vec::with_capacity(keys.len());
    for key in keys {
        sources.push(
            crate::storage::strings::get(client, key)
                .await?
                .unwrap_or_default(),
        );
    }

    let result: Vec<u8> = match op {
        "NOT" => sources[0].iter().map(|b| !b).collect(),
        _ => {
            let len = sources.iter().map(|s| s.len()).max().unwrap_or(0);
            let mut out = vec![0u8; len];
            for (i, slot) in out.iter_mut().enumerate() {
                let mut acc = sources[0].get(i).copied().unwrap_or(0);
                for src in &sources[1..] {
                    let b = src.get(i).copied().unwrap_or(0);
                    acc = match op {
                        "AND" => acc & b,
                        "OR" => acc | b,
                        "XOR" => acc ^ b,
                        _ => unreachable!("validated by the dispatcher"),
                    };
                }
                *slot = acc;
            }
            out
        }
    };

    check_type(client, dest, KeyType::String).await?;
    if result.is_empty() {
        purge_key(client, dest).await?;
    } else {
        write_preserving_ttl(client, dest, &result).await?;
    }
    Ok(result.len() as i64)
}

/// BITFIELD: executes the subcommand list left to right, one result per
/// GET/SET/INCRBY. Runs inside a transaction; on OVERFLOW FAIL a blocked
/// write yields a nil slot and leaves the value untouched.
pub async fn bitfield<C: GenericClient>(
    client: &C,
    key: &[u8],
    ops: &[BitfieldOp],
) -> Result<Vec<Option<i64>>, StorageError> {
    let mut value = read_for_update(client, key).await?.unwrap_or_default().to_vec();
    let mut results = Vec::new();
    let mut overflow = OverflowMode::Wrap;
    let mut dirty = false;

    for op in ops {
        match *op {
            BitfieldOp::Overflow(mode) => overflow = mode,
            BitfieldOp::Get(spec) => {
                results.push(Some(read_field(&value, spec)));
            }
            BitfieldOp::Set(spec, new) => {
                let old = read_field(&value, spec);
                match clamp(new as i128, spec, overflow) {
                    Some(stored) => {
                        write_field(&mut value, spec, stored);
                        dirty = true;
                        results.push(Some(old));
                    }
                    None => results.push(None),
                }
            }
            BitfieldOp::IncrBy(spec, delta) => {
                let current = read_field(&value, spec);
                match clamp(current as i128 + delta as i128, spec, overflow) {
                    Some(stored) => {
                        write_field(&mut value, spec, stored);
                        dirty = true;
                        results.push(Some(stored));
                    }
                    None => results.push(None),
                }
            }
        }
    }

    if dirty {
        write_preserving_ttl(client, key, &value).await?;
    }
    Ok(results)
}

/// Reads a field as its (possibly sign-extended) integer value.
fn read_field(buf: &[u8], spec: FieldSpec) -> i64 {
    let mut raw: u64 = 0;
    for i in 0..spec.bits as u64 {
        let pos = spec.offset + i;
        let bit = buf
            .get((pos / 8) as usize)
            .map(|b| (b & (0x80 >> (pos % 8))) != 0)
            .unwrap_or(false);
        raw = (raw << 1) | u64::from(bit);
    }
    if spec.signed && spec.bits < 64 && (raw >> (spec.bits - 1)) & 1 == 1 {
        (raw as i64) - (1i64 << spec.bits)
    } else {
        raw as i64
    }
}

/// Writes a field value, growing the buffer as needed.
fn write_field(buf: &mut Vec<u8>, spec: FieldSpec, value: i64) {
    let last_byte = ((spec.offset + spec.bits as u64 - 1) / 8) as usize;
    if buf.len() <= last_byte {
        buf.resize(last_byte + 1, 0);
    }
    let raw = value as u64;
    for i in 0..spec.bits as u64 {
        let pos = spec.offset + i;
        let mask = 0x80u8 >> (pos % 8);
        let bit = (raw >> (spec.bits as u64 - 1 - i)) & 1 == 1;
        let byte = &mut buf[(pos / 8) as usize];
        if bit {
            *byte |= mask;
        } else {
            *byte &= !mask;
        }
    }
}

/// Applies the overflow policy to a candidate value. `None` means the
/// write is blocked (FAIL mode).
fn clamp(candidate: i128, spec: FieldSpec, mode: OverflowMode) -> Option<i64> {
    let (min, max): (i128, i128) = if spec.signed {
        (
            -(1i128 << (spec.bits - 1)),
            (1i128 << (spec.bits - 1)) - 1,
        )
    } else {
        (0, (1i128 << spec.bits) - 1)
    };

    if (min..=max).contains(&candidate) {
        return Some(candidate as i64);
    }
    match mode {
        OverflowMode::Fail => None,
        OverflowMode::Sat => Some(if candidate < min { min } else { max } as i64),
        OverflowMode::Wrap => {
            let span = 1i128 << spec.bits;
            let wrapped = (candidate - min).rem_euclid(span) + min;
            Some(wrapped as i64)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spec(signed: bool, bits: u8, offset: u64) -> FieldSpec {
        FieldSpec {
            signed,
            bits,
            offset,
        }
    }

    #[test]
    fn test_field_round_trip_unsigned() {
        let mut buf = Vec::new();
        write_field(&mut buf, spec(false, 8, 0), 255);
        assert_eq!(read_field(&buf, spec(false, 8, 0)), 255);
        write_field(&mut buf, spec(false, 4, 8), 9);
        assert_eq!(read_field(&buf, spec(false, 4, 8)), 9);
        // Neighbors untouched
        assert_eq!(read_field(&buf, spec(false, 8, 0)), 255);
    }

    #[test]
    fn test_field_round_trip_signed() {
        let mut buf = Vec::new();
        write_field(&mut buf, spec(true, 8, 3), -100);
        assert_eq!(read_field(&buf, spec(true, 8, 3)), -100);
        write_field(&mut buf, spec(true, 16, 32), -30000);
        assert_eq!(read_field(&buf, spec(true, 16, 32)), -30000);
    }

    #[test]
    fn test_read_past_end_is_zero() {
        assert_eq!(read_field(&[], spec(false, 16, 0)), 0);
        assert_eq!(read_field(&[0xff], spec(false, 16, 0)), 0xff00);
    }

    #[test]
    fn test_clamp_wrap() {
        // u8: 250 + 10 wraps to 4
        assert_eq!(clamp(260, spec(false, 8, 0), OverflowMode::Wrap), Some(4));
        // i8: 127 + 1 wraps to -128
        assert_eq!(clamp(128, spec(true, 8, 0), OverflowMode::Wrap), Some(-128));
    }

    #[test]
    fn test_clamp_sat() {
        assert_eq!(clamp(260, spec(false, 8, 0), OverflowMode::Sat), Some(255));
        assert_eq!(clamp(-5, spec(false, 8, 0), OverflowMode::Sat), Some(0));
        assert_eq!(clamp(200, spec(true, 8, 0), OverflowMode::Sat), Some(127));
    }

    #[test]
    fn test_clamp_fail() {
        assert_eq!(clamp(260, spec(false, 8, 0), OverflowMode::Fail), None);
        assert_eq!(clamp(255, spec(false, 8, 0), OverflowMode::Fail), Some(255));
    }

    #[test]
    fn test_clamp_in_range_is_identity() {
        for mode in [OverflowMode::Wrap, OverflowMode::Sat, OverflowMode::Fail] {
            assert_eq!(clamp(-128, spec(true, 8, 0), mode), Some(-128));
            assert_eq!(clamp(127, spec(true, 8, 0), mode), Some(127));
        }
    }
}
