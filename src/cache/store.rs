//! Write-Through Invalidation Layer
//!
//! Glues the local cache, the admission policy and the distributed
//! invalidator to the command path. Reads consult the cache only for
//! string `GET`; every other command bypasses it. Writes go to storage
//! first and, on success, *delete* the affected keys here (and broadcast
//! when distributed invalidation is on) — entries are never updated in
//! place.
//!
//! Transactions bypass the cache entirely; a committed EXEC that
//! contained any writer triggers a conservative local flush plus a flush
//! broadcast, because individual effects are not tracked inside the
//! transaction.

use crate::cache::invalidator::InvalidationPublisher;
use crate::cache::memory::Cache;
use crate::cache::policy::CachePolicy;
use bytes::Bytes;
use std::sync::Arc;
use std::time::Duration;
use tracing::trace;

/// The keys a successful write touched, as seen by the cache.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WriteEffect {
    /// Read-only command; nothing to invalidate.
    None,
    /// Invalidate this batch of keys.
    Keys(Vec<Bytes>),
    /// Drop everything (FLUSHDB, or any EXEC containing a writer).
    Flush,
}

/// The cache side of the command path. Constructed once and shared.
pub struct CacheLayer {
    cache: Option<Arc<Cache>>,
    policy: Option<CachePolicy>,
    publisher: Option<InvalidationPublisher>,
}

impl std::fmt::Debug for CacheLayer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CacheLayer")
            .field("enabled", &self.cache.is_some())
            .field("policy", &self.policy.is_some())
            .field("distributed", &self.publisher.is_some())
            .finish()
    }
}

impl CacheLayer {
    pub fn new(
        cache: Option<Arc<Cache>>,
        policy: Option<CachePolicy>,
        publisher: Option<InvalidationPublisher>,
    ) -> Self {
        Self {
            cache,
            policy,
            publisher,
        }
    }

    /// A layer that caches nothing and broadcasts nothing.
    pub fn disabled() -> Self {
        Self {
            cache: None,
            policy: None,
            publisher: None,
        }
    }

    pub fn enabled(&self) -> bool {
        self.cache.is_some()
    }

    pub fn cache(&self) -> Option<&Arc<Cache>> {
        self.cache.as_ref()
    }

    /// GET fast path.
    pub fn lookup(&self, key: &[u8]) -> Option<Bytes> {
        self.cache.as_ref()?.get(key)
    }

    /// Fills the cache after a read miss, if the policy admits the key.
    /// `remaining_ttl` is the key's TTL at read time (`None` = no expiry).
    /// The entry's lifetime is capped at that remaining TTL so a cached
    /// value never outlives the key: a `SET k v EX 1` read into the cache
    /// must still read as absent once the second passes.
    pub fn fill(&self, key: &[u8], value: &Bytes, remaining_ttl: Option<Duration>) {
        let Some(cache) = self.cache.as_ref() else {
            return;
        };
        if let Some(policy) = self.policy.as_ref() {
            let decision = policy.decide(key, remaining_ttl);
            if !decision.should_cache() {
                trace!(decision = ?decision, "cache fill skipped by policy");
                return;
            }
        }
        let entry_ttl = match remaining_ttl {
            Some(remaining) => remaining.min(cache.ttl()),
            None => cache.ttl(),
        };
        cache.set_with_ttl(Bytes::copy_from_slice(key), value.clone(), entry_ttl);
    }

    /// Records a write with the policy's frequency tracker. Called for
    /// every storage write, cached or not, so hot keys are seen as hot.
    pub fn record_write(&self, effect: &WriteEffect) {
        let Some(policy) = self.policy.as_ref() else {
            return;
        };
        if let WriteEffect::Keys(keys) = effect {
            for key in keys {
                policy.record_write(key);
            }
        }
    }

    /// Applies a committed write's invalidation: local delete first, then
    /// the distributed broadcast.
    pub async fn invalidate(&self, effect: &WriteEffect) {
        let Some(cache) = self.cache.as_ref() else {
            return;
        };
        match effect {
            WriteEffect::None => {}
            WriteEffect::Keys(keys) => {
                cache.delete_multi(keys.iter().map(|k| &k[..]));
                if let Some(publisher) = self.publisher.as_ref() {
                    publisher.publish_keys(keys).await;
                }
            }
            WriteEffect::Flush => {
                cache.flush();
                if let Some(publisher) = self.publisher.as_ref() {
                    publisher.publish_flush().await;
                }
            }
        }
    }

    /// Stops the cache janitor (idempotent).
    pub fn stop(&self) {
        if let Some(cache) = self.cache.as_ref() {
            cache.stop();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::policy::PolicyConfig;

    fn layer_with_cache() -> CacheLayer {
        CacheLayer::new(
            Some(Cache::new(Duration::from_secs(60), 0, None)),
            None,
            None,
        )
    }

    #[tokio::test]
    async fn test_disabled_layer_is_inert() {
        let layer = CacheLayer::disabled();
        assert!(!layer.enabled());
        assert_eq!(layer.lookup(b"k"), None);
        layer.fill(b"k", &Bytes::from("v"), None);
        assert_eq!(layer.lookup(b"k"), None);
        layer.invalidate(&WriteEffect::Flush).await;
    }

    #[tokio::test]
    async fn test_fill_then_lookup() {
        let layer = layer_with_cache();
        layer.fill(b"k", &Bytes::from("v"), None);
        assert_eq!(layer.lookup(b"k"), Some(Bytes::from("v")));
    }

    #[tokio::test]
    async fn test_fill_caps_entry_at_remaining_ttl() {
        // Cache TTL is 60s, but the key only has 30ms left to live; the
        // cached entry must go away with the key
        let layer = layer_with_cache();
        layer.fill(b"k", &Bytes::from("v"), Some(Duration::from_millis(30)));
        assert_eq!(layer.lookup(b"k"), Some(Bytes::from("v")));
        tokio::time::sleep(Duration::from_millis(60)).await;
        assert_eq!(layer.lookup(b"k"), None);
    }

    #[tokio::test]
    async fn test_invalidate_keys_deletes_locally() {
        let layer = layer_with_cache();
        layer.fill(b"a", &Bytes::from("1"), None);
        layer.fill(b"b", &Bytes::from("2"), None);
        layer
            .invalidate(&WriteEffect::Keys(vec![Bytes::from("a")]))
            .await;
        assert_eq!(layer.lookup(b"a"), None);
        assert_eq!(layer.lookup(b"b"), Some(Bytes::from("2")));
    }

    #[tokio::test]
    async fn test_invalidate_flush_clears_everything() {
        let layer = layer_with_cache();
        layer.fill(b"a", &Bytes::from("1"), None);
        layer.fill(b"b", &Bytes::from("2"), None);
        layer.invalidate(&WriteEffect::Flush).await;
        assert_eq!(layer.lookup(b"a"), None);
        assert_eq!(layer.lookup(b"b"), None);
    }

    #[tokio::test]
    async fn test_policy_gates_fill() {
        let layer = CacheLayer::new(
            Some(Cache::new(Duration::from_secs(60), 0, None)),
            Some(CachePolicy::new(PolicyConfig {
                exclude: vec![Bytes::from("session:*")],
                ..Default::default()
            })),
            None,
        );
        layer.fill(b"session:x", &Bytes::from("v"), None);
        assert_eq!(layer.lookup(b"session:x"), None);
        layer.fill(b"user:1", &Bytes::from("v"), None);
        assert_eq!(layer.lookup(b"user:1"), Some(Bytes::from("v")));
    }
}
