//! Storage Error Types
//!
//! Every storage operation returns `Result<_, StorageError>`. User-level
//! failures (wrong type, bad number, missing key) carry their exact RESP
//! error text; backend failures (pool, SQL) are logged and collapsed into a
//! generic `ERR` reply so internals never leak to clients. Errors never
//! cross the command boundary as faults: the dispatcher folds each one into
//! an error reply and the session keeps running.

use crate::hll::HllError;
use crate::protocol::RespValue;
use thiserror::Error;
use tracing::error;

#[derive(Debug, Error)]
pub enum StorageError {
    /// Command applied to a key of an incompatible type.
    #[error("WRONGTYPE Operation against a key holding the wrong kind of value")]
    WrongType,

    /// Value failed to parse as a signed 64-bit integer.
    #[error("ERR value is not an integer or out of range")]
    NotInteger,

    /// Value failed to parse as a finite float.
    #[error("ERR value is not a valid float")]
    NotFloat,

    /// INCR/DECR would overflow; never wrapped.
    #[error("ERR increment or decrement would overflow")]
    Overflow,

    /// RENAME/COPY source missing.
    #[error("ERR no such key")]
    NoSuchKey,

    /// LSET/LINDEX past either end of the list.
    #[error("ERR index out of range")]
    IndexOutOfRange,

    /// Syntax-level failure detected during execution.
    #[error("ERR {0}")]
    Other(String),

    /// Stored register block is not a valid HyperLogLog.
    #[error("WRONGTYPE Key is not a valid HyperLogLog string value.")]
    CorruptHll(#[from] HllError),

    #[error("database error: {0}")]
    Db(#[from] tokio_postgres::Error),

    #[error("pool error: {0}")]
    Pool(#[from] deadpool_postgres::PoolError),
}

impl StorageError {
    /// Folds the error into its RESP reply. Backend errors get a generic
    /// message; everything else is already phrased for the wire.
    pub fn to_resp(&self) -> RespValue {
        match self {
            StorageError::Db(e) => {
                error!(error = %e, "database error during command");
                RespValue::error("ERR database error")
            }
            StorageError::Pool(e) => {
                error!(error = %e, "connection pool error during command");
                RespValue::error("ERR database unavailable")
            }
            other => RespValue::error(other.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wrongtype_text_is_verbatim() {
        assert_eq!(
            StorageError::WrongType.to_string(),
            "WRONGTYPE Operation against a key holding the wrong kind of value"
        );
    }

    #[test]
    fn test_user_errors_map_to_their_text() {
        assert_eq!(
            StorageError::NotInteger.to_resp(),
            RespValue::error("ERR value is not an integer or out of range")
        );
        assert_eq!(
            StorageError::NoSuchKey.to_resp(),
            RespValue::error("ERR no such key")
        );
    }
}
