//! Distributed Cache Invalidation
//!
//! Every front-end process broadcasts its string-key invalidations on one
//! fixed database channel; every front-end also runs a listener that
//! applies incoming invalidations to its local cache. Delivery is
//! at-least-once, which is fine because deleting a cache entry twice is a
//! no-op.
//!
//! The listener owns a dedicated connection. Waits are bounded at 5
//! seconds so shutdown stays responsive; a lost connection reconnects
//! with exponential backoff from 100 ms up to 30 s, re-issuing LISTEN and
//! resetting the backoff on success.

use crate::cache::memory::Cache;
use crate::pubsub::names::CACHE_INVALIDATE_CHANNEL;
use crate::pubsub::{connect_listener, quote_channel};
use crate::storage::encoding::{decode_name, encode_name};
use bytes::Bytes;
use deadpool_postgres::Pool;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Wait bound per notification poll.
const WAIT_TIMEOUT: Duration = Duration::from_secs(5);
/// Reconnect backoff bounds.
const BACKOFF_INITIAL: Duration = Duration::from_millis(100);
const BACKOFF_MAX: Duration = Duration::from_secs(30);

/// The wire payload: a key batch or a full flush.
#[derive(Debug, Default, Serialize, Deserialize)]
struct InvalidationMessage {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    keys: Vec<String>,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    flush: bool,
}

/// Publishes invalidations through the shared pool.
#[derive(Clone)]
pub struct InvalidationPublisher {
    pool: Pool,
}

impl std::fmt::Debug for InvalidationPublisher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InvalidationPublisher").finish()
    }
}

impl InvalidationPublisher {
    pub fn new(pool: Pool) -> Self {
        Self { pool }
    }

    /// Broadcasts a key-batch invalidation. Failures are logged, not
    /// surfaced: the write already committed, and remote caches will age
    /// the stale entry out via TTL.
    pub async fn publish_keys(&self, keys: &[Bytes]) {
        let message = InvalidationMessage {
            keys: keys.iter().map(|k| encode_name(k)).collect(),
            flush: false,
        };
        self.publish(&message).await;
    }

    /// Broadcasts a full flush.
    pub async fn publish_flush(&self) {
        self.publish(&InvalidationMessage {
            keys: Vec::new(),
            flush: true,
        })
        .await;
    }

    async fn publish(&self, message: &InvalidationMessage) {
        let payload = match serde_json::to_string(message) {
            Ok(p) => p,
            Err(e) => {
                warn!(error = %e, "failed to encode invalidation payload");
                return;
            }
        };
        let result = async {
            let client = self.pool.get().await?;
            client
                .execute(
                    "SELECT pg_notify($1, $2)",
                    &[&CACHE_INVALIDATE_CHANNEL, &payload],
                )
                .await?;
            Ok::<_, crate::storage::StorageError>(())
        }
        .await;
        if let Err(e) = result {
            warn!(error = %e, "failed to publish cache invalidation");
        }
    }
}

/// Spawns the invalidation listener task.
pub fn spawn_invalidation_listener(
    pg_config: tokio_postgres::Config,
    cache: Arc<Cache>,
    shutdown_rx: watch::Receiver<bool>,
) -> JoinHandle<()> {
    tokio::spawn(listener_loop(pg_config, cache, shutdown_rx))
}

async fn listener_loop(
    pg_config: tokio_postgres::Config,
    cache: Arc<Cache>,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    let mut backoff = BACKOFF_INITIAL;
    loop {
        if *shutdown_rx.borrow() {
            return;
        }

        match run_session(&pg_config, &cache, &mut shutdown_rx).await {
            SessionEnd::Shutdown => {
                debug!("invalidation listener stopped");
                return;
            }
            SessionEnd::ListenEstablished => {
                // The session ran after a successful LISTEN; start the
                // backoff ladder over for the next failure
                backoff = BACKOFF_INITIAL;
            }
            SessionEnd::Failed(e) => {
                warn!(error = %e, backoff_ms = backoff.as_millis() as u64,
                      "invalidation listener reconnecting");
            }
        }

        tokio::select! {
            _ = tokio::time::sleep(backoff) => {}
            _ = shutdown_rx.changed() => return,
        }
        backoff = (backoff * 2).min(BACKOFF_MAX);
    }
}

enum SessionEnd {
    Shutdown,
    ListenEstablished,
    Failed(tokio_postgres::Error),
}

async fn run_session(
    pg_config: &tokio_postgres::Config,
    cache: &Cache,
    shutdown_rx: &mut watch::Receiver<bool>,
) -> SessionEnd {
    let (client, mut notifications) = match connect_listener(pg_config).await {
        Ok(pair) => pair,
        Err(e) => return SessionEnd::Failed(e),
    };
    if let Err(e) = client
        .batch_execute(&format!("LISTEN {}", quote_channel(CACHE_INVALIDATE_CHANNEL)))
        .await
    {
        return SessionEnd::Failed(e);
    }
    info!("cache invalidation listener connected");

    loop {
        tokio::select! {
            _ = shutdown_rx.changed() => {
                if *shutdown_rx.borrow() {
                    return SessionEnd::Shutdown;
                }
            }
            result = tokio::time::timeout(WAIT_TIMEOUT, notifications.recv()) => {
                match result {
                    // Timeout: just re-check shutdown and wait again
                    Err(_) => {}
                    Ok(Some(notification)) => apply(cache, notification.payload()),
                    // Channel closed: the connection died
                    Ok(None) => return SessionEnd::ListenEstablished,
                }
            }
        }
    }
}

fn apply(cache: &Cache, payload: &str) {
    let message: InvalidationMessage = match serde_json::from_str(payload) {
        Ok(m) => m,
        Err(e) => {
            warn!(error = %e, "ignoring malformed invalidation payload");
            return;
        }
    };
    if message.flush {
        debug!("flushing local cache on broadcast");
        cache.flush();
        return;
    }
    let keys: Vec<Bytes> = message.keys.iter().map(|k| decode_name(k)).collect();
    let removed = cache.delete_multi(keys.iter().map(|k| &k[..]));
    debug!(keys = message.keys.len(), removed, "applied invalidation batch");
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_apply_deletes_listed_keys() {
        let cache = Cache::new(Duration::from_secs(60), 0, None);
        cache.set(Bytes::from("a"), Bytes::from("1"));
        cache.set(Bytes::from("b"), Bytes::from("2"));
        apply(&cache, r#"{"keys":["a"]}"#);
        assert_eq!(cache.get(b"a"), None);
        assert_eq!(cache.get(b"b"), Some(Bytes::from("2")));
    }

    #[tokio::test]
    async fn test_apply_flush() {
        let cache = Cache::new(Duration::from_secs(60), 0, None);
        cache.set(Bytes::from("a"), Bytes::from("1"));
        apply(&cache, r#"{"flush":true}"#);
        assert_eq!(cache.size(), 0);
    }

    #[tokio::test]
    async fn test_apply_ignores_garbage() {
        let cache = Cache::new(Duration::from_secs(60), 0, None);
        cache.set(Bytes::from("a"), Bytes::from("1"));
        apply(&cache, "not-json");
        assert_eq!(cache.get(b"a"), Some(Bytes::from("1")));
    }

    #[test]
    fn test_payload_shapes() {
        let keys = InvalidationMessage {
            keys: vec!["k1".into(), "k2".into()],
            flush: false,
        };
        assert_eq!(
            serde_json::to_string(&keys).unwrap(),
            r#"{"keys":["k1","k2"]}"#
        );
        let flush = InvalidationMessage {
            keys: Vec::new(),
            flush: true,
        };
        assert_eq!(serde_json::to_string(&flush).unwrap(), r#"{"flush":true}"#);
    }

    #[tokio::test]
    async fn test_binary_keys_survive_the_payload() {
        let cache = Cache::new(Duration::from_secs(60), 0, None);
        let key = Bytes::from(&b"bin\x00key"[..]);
        cache.set(key.clone(), Bytes::from("v"));

        let message = InvalidationMessage {
            keys: vec![encode_name(&key)],
            flush: false,
        };
        apply(&cache, &serde_json::to_string(&message).unwrap());
        assert_eq!(cache.get(&key), None);
    }
}
