//! In-Process Read Cache
//!
//! A TTL map from key to cached string value, shared by every session of
//! one front-end process. The database stays authoritative; this cache only
//! shortens the read path for string `GET`s, so correctness rests on
//! invalidation (local on write, distributed via the invalidator) rather
//! than on freshness of the entries themselves.
//!
//! Contract:
//!
//! - The TTL is fixed at construction; `set` stamps
//!   `expires_at = now + ttl`, and `set_with_ttl` lets the read path cap
//!   an entry at the backing key's remaining lifetime so a cached value
//!   can never outlive the key it shadows.
//! - When the map holds `max_size` entries and the key is absent, the new
//!   entry is rejected outright (no LRU); updates of existing keys always
//!   land. `max_size == 0` means unbounded.
//! - `get` treats `expires_at <= now` as not-found even before the janitor
//!   reclaims the entry.
//! - A janitor task runs every `cleanup_interval` (default `ttl / 2`,
//!   floored at 10 ms) and deletes expired entries.
//! - `stop` is idempotent; dropping the cache stops the janitor too.

use bytes::Bytes;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::RwLock;
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tracing::{debug, trace};

/// Janitor interval floor.
const MIN_CLEANUP_INTERVAL: Duration = Duration::from_millis(10);

/// A cached value with its expiry instant.
#[derive(Debug, Clone)]
struct CacheEntry {
    value: Bytes,
    expires_at: Instant,
}

impl CacheEntry {
    #[inline]
    fn is_expired(&self) -> bool {
        Instant::now() >= self.expires_at
    }
}

/// Counters exported for observability (INFO, log lines).
#[derive(Debug, Default)]
pub struct CacheStats {
    pub hits: AtomicU64,
    pub misses: AtomicU64,
    pub rejected: AtomicU64,
    pub expired: AtomicU64,
}

/// The per-process TTL cache.
///
/// All operations are safe under concurrent access; readers run in
/// parallel, writers take the map exclusively.
pub struct Cache {
    entries: RwLock<HashMap<Bytes, CacheEntry>>,
    ttl: Duration,
    max_size: usize,
    stats: CacheStats,
    shutdown_tx: watch::Sender<bool>,
}

impl std::fmt::Debug for Cache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Cache")
            .field("size", &self.size())
            .field("ttl", &self.ttl)
            .field("max_size", &self.max_size)
            .finish()
    }
}

impl Cache {
    /// Creates a cache and starts its janitor task.
    ///
    /// `max_size == 0` disables the size cap. `cleanup_interval == None`
    /// defaults to half the TTL, floored at 10 ms.
    pub fn new(
        ttl: Duration,
        max_size: usize,
        cleanup_interval: Option<Duration>,
    ) -> std::sync::Arc<Self> {
        let interval = cleanup_interval
            .unwrap_or(ttl / 2)
            .max(MIN_CLEANUP_INTERVAL);

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let cache = std::sync::Arc::new(Self {
            entries: RwLock::new(HashMap::new()),
            ttl,
            max_size,
            stats: CacheStats::default(),
            shutdown_tx,
        });

        tokio::spawn(janitor_loop(
            std::sync::Arc::downgrade(&cache),
            interval,
            shutdown_rx,
        ));

        cache
    }

    /// Looks a key up, treating expired entries as absent.
    pub fn get(&self, key: &[u8]) -> Option<Bytes> {
        let entries = self.entries.read().unwrap();
        match entries.get(key) {
            Some(entry) if !entry.is_expired() => {
                self.stats.hits.fetch_add(1, Ordering::Relaxed);
                Some(entry.value.clone())
            }
            _ => {
                self.stats.misses.fetch_add(1, Ordering::Relaxed);
                None
            }
        }
    }

    /// Inserts or refreshes a key with the cache-wide TTL.
    ///
    /// Returns `false` when the entry was rejected because the cache is at
    /// capacity and the key is not already present.
    pub fn set(&self, key: Bytes, value: Bytes) -> bool {
        self.set_with_ttl(key, value, self.ttl)
    }

    /// Inserts or refreshes a key with an explicit entry lifetime. Used by
    /// the read path to cap an entry at the key's remaining TTL.
    pub fn set_with_ttl(&self, key: Bytes, value: Bytes, ttl: Duration) -> bool {
        let mut entries = self.entries.write().unwrap();

        if self.max_size > 0 && entries.len() >= self.max_size && !entries.contains_key(&key) {
            self.stats.rejected.fetch_add(1, Ordering::Relaxed);
            trace!(size = entries.len(), "cache full, rejecting new entry");
            return false;
        }

        entries.insert(
            key,
            CacheEntry {
                value,
                expires_at: Instant::now() + ttl,
            },
        );
        true
    }

    /// The cache-wide TTL entries default to.
    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Removes a key. Returns whether it was present.
    pub fn delete(&self, key: &[u8]) -> bool {
        self.entries.write().unwrap().remove(key).is_some()
    }

    /// Removes a batch of keys in one lock acquisition.
    pub fn delete_multi<I, K>(&self, keys: I) -> usize
    where
        I: IntoIterator<Item = K>,
        K: AsRef<[u8]>,
    {
        let mut entries = self.entries.write().unwrap();
        let mut removed = 0;
        for key in keys {
            if entries.remove(key.as_ref()).is_some() {
                removed += 1;
            }
        }
        removed
    }

    /// Drops every entry.
    pub fn flush(&self) {
        self.entries.write().unwrap().clear();
    }

    /// Current number of entries, expired ones included until reclaimed.
    pub fn size(&self) -> usize {
        self.entries.read().unwrap().len()
    }

    pub fn stats(&self) -> &CacheStats {
        &self.stats
    }

    /// Stops the janitor. Safe to call more than once.
    pub fn stop(&self) {
        let _ = self.shutdown_tx.send(true);
    }

    /// Removes every expired entry; returns how many were reclaimed.
    fn cleanup_expired(&self) -> usize {
        let mut entries = self.entries.write().unwrap();
        let before = entries.len();
        entries.retain(|_, entry| !entry.is_expired());
        let reclaimed = before - entries.len();
        if reclaimed > 0 {
            self.stats
                .expired
                .fetch_add(reclaimed as u64, Ordering::Relaxed);
        }
        reclaimed
    }
}

impl Drop for Cache {
    fn drop(&mut self) {
        let _ = self.shutdown_tx.send(true);
    }
}

/// Janitor task: reclaims expired entries until stopped or the cache is
/// dropped. Holds only a weak handle so a forgotten cache still frees.
async fn janitor_loop(
    cache: std::sync::Weak<Cache>,
    interval: Duration,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            _ = tokio::time::sleep(interval) => {}
            result = shutdown_rx.changed() => {
                if result.is_err() || *shutdown_rx.borrow() {
                    debug!("cache janitor stopped");
                    return;
                }
            }
        }

        let Some(cache) = cache.upgrade() else {
            return;
        };
        let reclaimed = cache.cleanup_expired();
        if reclaimed > 0 {
            debug!(reclaimed, remaining = cache.size(), "cache janitor pass");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_set_get_delete() {
        let cache = Cache::new(Duration::from_secs(60), 0, None);
        assert!(cache.set(Bytes::from("k"), Bytes::from("v")));
        assert_eq!(cache.get(b"k"), Some(Bytes::from("v")));
        assert!(cache.delete(b"k"));
        assert_eq!(cache.get(b"k"), None);
        assert!(!cache.delete(b"k"));
    }

    #[tokio::test]
    async fn test_expired_entry_is_invisible_before_janitor() {
        let cache = Cache::new(Duration::from_millis(20), 0, Some(Duration::from_secs(3600)));
        cache.set(Bytes::from("k"), Bytes::from("v"));
        tokio::time::sleep(Duration::from_millis(40)).await;
        // The janitor will not run for an hour; lazy expiry must hide it.
        assert_eq!(cache.get(b"k"), None);
        assert_eq!(cache.size(), 1);
    }

    #[tokio::test]
    async fn test_set_with_ttl_expires_before_cache_ttl() {
        let cache = Cache::new(Duration::from_secs(60), 0, Some(Duration::from_secs(3600)));
        cache.set_with_ttl(Bytes::from("short"), Bytes::from("v"), Duration::from_millis(20));
        cache.set(Bytes::from("long"), Bytes::from("v"));
        assert_eq!(cache.get(b"short"), Some(Bytes::from("v")));
        tokio::time::sleep(Duration::from_millis(40)).await;
        assert_eq!(cache.get(b"short"), None);
        assert_eq!(cache.get(b"long"), Some(Bytes::from("v")));
    }

    #[tokio::test]
    async fn test_janitor_reclaims() {
        let cache = Cache::new(Duration::from_millis(20), 0, Some(Duration::from_millis(10)));
        for i in 0..10 {
            cache.set(Bytes::from(format!("k{}", i)), Bytes::from("v"));
        }
        tokio::time::sleep(Duration::from_millis(120)).await;
        assert_eq!(cache.size(), 0);
    }

    #[tokio::test]
    async fn test_full_cache_rejects_new_accepts_update() {
        let cache = Cache::new(Duration::from_secs(60), 2, None);
        assert!(cache.set(Bytes::from("a"), Bytes::from("1")));
        assert!(cache.set(Bytes::from("b"), Bytes::from("2")));
        // At capacity: new key rejected
        assert!(!cache.set(Bytes::from("c"), Bytes::from("3")));
        assert_eq!(cache.get(b"c"), None);
        // Update of an existing key still lands
        assert!(cache.set(Bytes::from("a"), Bytes::from("9")));
        assert_eq!(cache.get(b"a"), Some(Bytes::from("9")));
        assert_eq!(cache.stats().rejected.load(Ordering::Relaxed), 1);
    }

    #[tokio::test]
    async fn test_zero_max_size_is_unbounded() {
        let cache = Cache::new(Duration::from_secs(60), 0, None);
        for i in 0..1000 {
            assert!(cache.set(Bytes::from(format!("k{}", i)), Bytes::from("v")));
        }
        assert_eq!(cache.size(), 1000);
    }

    #[tokio::test]
    async fn test_delete_multi_and_flush() {
        let cache = Cache::new(Duration::from_secs(60), 0, None);
        for i in 0..5 {
            cache.set(Bytes::from(format!("k{}", i)), Bytes::from("v"));
        }
        assert_eq!(cache.delete_multi([&b"k0"[..], &b"k1"[..], &b"zz"[..]]), 2);
        cache.flush();
        assert_eq!(cache.size(), 0);
    }

    #[tokio::test]
    async fn test_stop_is_idempotent() {
        let cache = Cache::new(Duration::from_secs(60), 0, None);
        cache.stop();
        cache.stop();
        cache.stop();
        // Still usable as a plain map after the janitor is gone
        cache.set(Bytes::from("k"), Bytes::from("v"));
        assert_eq!(cache.get(b"k"), Some(Bytes::from("v")));
    }
}
