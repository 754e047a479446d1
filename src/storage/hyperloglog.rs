//! HyperLogLog Row Access
//!
//! PFADD / PFCOUNT / PFMERGE over the `kv_hyperloglog` table. The pattern
//! is always read-registers, mutate in memory via [`crate::hll`], write
//! back in the caller's transaction. Multi-key PFCOUNT merges in memory
//! and never writes.

use crate::hll::HyperLogLog;
use crate::storage::encoding::encode_name;
use crate::storage::error::StorageError;
use crate::storage::schema::LIVE;
use crate::storage::{check_type, current_expiry, upsert_meta, KeyType};
use bytes::Bytes;
use tokio_postgres::GenericClient;

/// PFADD. Returns whether the estimate changed (also true when the key
/// was created). Runs inside a transaction.
pub async fn pfadd<C: GenericClient>(
    client: &C,
    key: &[u8],
    elements: &[Bytes],
) -> Result<bool, StorageError> {
    let existed = check_type(client, key, KeyType::HyperLogLog).await?;
    let mut hll = match read_registers(client, key).await? {
        Some(registers) => HyperLogLog::from_bytes(&registers)?,
        None => HyperLogLog::new(),
    };

    let mut changed = !existed;
    for element in elements {
        if hll.add(element) {
            changed = true;
        }
    }

    if changed {
        write_registers(client, key, &hll).await?;
    }
    Ok(changed)
}

/// PFCOUNT. One key reads its block; several keys merge in memory. Never
/// writes.
pub async fn pfcount<C: GenericClient>(
    client: &C,
    keys: &[Bytes],
) -> Result<i64, StorageError> {
    let mut merged = HyperLogLog::new();
    for key in keys {
        if !check_type(client, key, KeyType::HyperLogLog).await? {
            continue;
        }
        if let Some(registers) = read_registers(client, key).await? {
            merged.merge(&HyperLogLog::from_bytes(&registers)?);
        }
    }
    Ok(merged.count())
}

/// PFMERGE: register-wise max of every source into the destination (which
/// also counts as a source when it exists). Runs inside a transaction.
pub async fn pfmerge<C: GenericClient>(
    client: &C,
    destination: &[u8],
    sources: &[Bytes],
) -> Result<(), StorageError> {
    check_type(client, destination, KeyType::HyperLogLog).await?;
    let mut merged = match read_registers(client, destination).await? {
        Some(registers) => HyperLogLog::from_bytes(&registers)?,
        None => HyperLogLog::new(),
    };

    for source in sources {
        if !check_type(client, source, KeyType::HyperLogLog).await? {
            continue;
        }
        if let Some(registers) = read_registers(client, source).await? {
            merged.merge(&HyperLogLog::from_bytes(&registers)?);
        }
    }

    write_registers(client, destination, &merged).await?;
    Ok(())
}

async fn read_registers<C: GenericClient>(
    client: &C,
    key: &[u8],
) -> Result<Option<Vec<u8>>, StorageError> {
    let row = client
        .query_opt(
            &format!("SELECT registers FROM kv_hyperloglog WHERE key = $1 AND {LIVE}"),
            &[&encode_name(key)],
        )
        .await?;
    Ok(row.map(|r| r.get(0)))
}

async fn write_registers<C: GenericClient>(
    client: &C,
    key: &[u8],
    hll: &HyperLogLog,
) -> Result<(), StorageError> {
    let expires_at = current_expiry(client, key).await?;
    client
        .execute(
            "INSERT INTO kv_hyperloglog (key, registers, expires_at) VALUES ($1, $2, $3) \
             ON CONFLICT (key) DO UPDATE \
             SET registers = EXCLUDED.registers, expires_at = EXCLUDED.expires_at",
            &[&encode_name(key), &hll.to_bytes(), &expires_at],
        )
        .await?;
    upsert_meta(client, key, KeyType::HyperLogLog).await?;
    Ok(())
}
