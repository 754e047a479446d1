//! Relational Schema
//!
//! Six data tables (one per Redis type) plus `kv_meta`, the single source
//! of truth for a key's type and TTL. Expiry is mirrored into the data
//! tables so the janitor can reap with index-only scans. Creation is
//! idempotent (`CREATE TABLE IF NOT EXISTS`); boot also migrates legacy
//! `text` value columns to `bytea` when it finds them.

use crate::storage::error::StorageError;
use tokio_postgres::GenericClient;
use tracing::{info, warn};

/// Liveness predicate shared by every read.
pub const LIVE: &str = "(expires_at IS NULL OR expires_at > now())";

/// The data tables, in janitor order.
pub const DATA_TABLES: [&str; 6] = [
    "kv_strings",
    "kv_hashes",
    "kv_lists",
    "kv_sets",
    "kv_zsets",
    "kv_hyperloglog",
];

const DDL: &str = "
CREATE TABLE IF NOT EXISTS kv_meta (
    key        text PRIMARY KEY,
    key_type   text NOT NULL,
    expires_at timestamptz
);
CREATE INDEX IF NOT EXISTS kv_meta_expires_idx
    ON kv_meta (expires_at) WHERE expires_at IS NOT NULL;

CREATE TABLE IF NOT EXISTS kv_strings (
    key        text PRIMARY KEY,
    value      bytea NOT NULL,
    expires_at timestamptz
);
CREATE INDEX IF NOT EXISTS kv_strings_expires_idx
    ON kv_strings (expires_at) WHERE expires_at IS NOT NULL;

CREATE TABLE IF NOT EXISTS kv_hashes (
    key        text NOT NULL,
    field      text NOT NULL,
    value      bytea NOT NULL,
    expires_at timestamptz,
    PRIMARY KEY (key, field)
);
CREATE INDEX IF NOT EXISTS kv_hashes_expires_idx
    ON kv_hashes (expires_at) WHERE expires_at IS NOT NULL;

CREATE TABLE IF NOT EXISTS kv_lists (
    key        text NOT NULL,
    idx        bigint NOT NULL,
    value      bytea NOT NULL,
    expires_at timestamptz,
    PRIMARY KEY (key, idx)
);
CREATE INDEX IF NOT EXISTS kv_lists_expires_idx
    ON kv_lists (expires_at) WHERE expires_at IS NOT NULL;

CREATE TABLE IF NOT EXISTS kv_sets (
    key        text NOT NULL,
    member     bytea NOT NULL,
    expires_at timestamptz,
    PRIMARY KEY (key, member)
);
CREATE INDEX IF NOT EXISTS kv_sets_expires_idx
    ON kv_sets (expires_at) WHERE expires_at IS NOT NULL;

CREATE TABLE IF NOT EXISTS kv_zsets (
    key        text NOT NULL,
    member     bytea NOT NULL,
    score      float8 NOT NULL,
    expires_at timestamptz,
    PRIMARY KEY (key, member)
);
CREATE INDEX IF NOT EXISTS kv_zsets_score_idx ON kv_zsets (key, score);
CREATE INDEX IF NOT EXISTS kv_zsets_expires_idx
    ON kv_zsets (expires_at) WHERE expires_at IS NOT NULL;

CREATE TABLE IF NOT EXISTS kv_hyperloglog (
    key        text PRIMARY KEY,
    registers  bytea NOT NULL,
    expires_at timestamptz
);
CREATE INDEX IF NOT EXISTS kv_hyperloglog_expires_idx
    ON kv_hyperloglog (expires_at) WHERE expires_at IS NOT NULL;
";

/// Creates the tables and runs pending migrations.
pub async fn ensure_schema<C: GenericClient>(client: &C) -> Result<(), StorageError> {
    client.batch_execute(DDL).await?;
    migrate_text_values(client).await?;
    info!("schema ready");
    Ok(())
}

/// Legacy deployments stored values as `text`; convert in place.
async fn migrate_text_values<C: GenericClient>(client: &C) -> Result<(), StorageError> {
    let rows = client
        .query(
            "SELECT table_name, column_name FROM information_schema.columns \
             WHERE table_name = ANY($1) \
               AND column_name IN ('value', 'registers') \
               AND data_type = 'text'",
            &[&DATA_TABLES.to_vec()],
        )
        .await?;

    for row in rows {
        let table: String = row.get(0);
        let column: String = row.get(1);
        warn!(table = %table, column = %column, "migrating legacy text column to bytea");
        client
            .batch_execute(&format!(
                "ALTER TABLE {table} ALTER COLUMN {column} TYPE bytea \
                 USING convert_to({column}, 'UTF8')"
            ))
            .await?;
    }
    Ok(())
}
