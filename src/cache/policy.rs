//! Cache Admission Policy
//!
//! Decides, per key, whether a value is worth caching. Consulted on the
//! write path before a cache populate and on the read path before a cache
//! fill. The policy never affects correctness (the database stays
//! authoritative); it only trims cache churn:
//!
//! - writes carrying a TTL shorter than `min_ttl` skip the cache, since the
//!   entry would expire before it pays for itself;
//! - keys written more often than `max_write_freq` per second (measured
//!   over `write_tracking_window`) are "hot" and skipped, since every write
//!   invalidates anyway;
//! - `include`/`exclude` glob lists pin the decision: include wins over
//!   exclude and over the TTL/frequency checks, exclude wins over
//!   TTL/frequency.
//!
//! Each skip carries a reason tag that feeds the skip counters.

use crate::glob::glob_match;
use bytes::Bytes;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::{Duration, Instant};

/// Cap on tracked keys before stale windows are pruned.
const MAX_TRACKED_KEYS: usize = 16 * 1024;

/// Why a key was not cached.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    /// The write carried a TTL below the configured minimum.
    TtlTooShort,
    /// The key exceeds the write-frequency threshold.
    HotKey,
    /// The key matches an exclude pattern.
    Excluded,
}

impl SkipReason {
    pub fn as_str(self) -> &'static str {
        match self {
            SkipReason::TtlTooShort => "ttl_too_short",
            SkipReason::HotKey => "hot_key",
            SkipReason::Excluded => "excluded",
        }
    }
}

/// The admission verdict.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheDecision {
    Cache,
    Skip(SkipReason),
}

impl CacheDecision {
    pub fn should_cache(self) -> bool {
        matches!(self, CacheDecision::Cache)
    }
}

/// Skip counters, one per reason.
#[derive(Debug, Default)]
pub struct PolicyStats {
    pub skipped_ttl: AtomicU64,
    pub skipped_hot: AtomicU64,
    pub skipped_excluded: AtomicU64,
}

impl PolicyStats {
    fn record(&self, reason: SkipReason) {
        let counter = match reason {
            SkipReason::TtlTooShort => &self.skipped_ttl,
            SkipReason::HotKey => &self.skipped_hot,
            SkipReason::Excluded => &self.skipped_excluded,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }
}

/// Per-key write counter over the current tracking window.
#[derive(Debug, Clone, Copy)]
struct WriteWindow {
    window_start: Instant,
    count: u64,
}

/// Configuration for [`CachePolicy`].
#[derive(Debug, Clone, Default)]
pub struct PolicyConfig {
    /// Writes with a shorter TTL are not cached. `None` disables the check.
    pub min_ttl: Option<Duration>,
    /// Maximum writes per second before a key is declared hot. `None`
    /// disables the check.
    pub max_write_freq: Option<f64>,
    /// Length of the rolling window used for frequency tracking.
    pub write_tracking_window: Duration,
    /// Always-cache patterns. Wins over every other check.
    pub include: Vec<Bytes>,
    /// Never-cache patterns. Wins over the TTL/frequency checks.
    pub exclude: Vec<Bytes>,
}

/// The admission policy.
pub struct CachePolicy {
    config: PolicyConfig,
    windows: Mutex<HashMap<Bytes, WriteWindow>>,
    stats: PolicyStats,
}

impl std::fmt::Debug for CachePolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CachePolicy")
            .field("config", &self.config)
            .finish()
    }
}

impl CachePolicy {
    pub fn new(mut config: PolicyConfig) -> Self {
        if config.write_tracking_window.is_zero() {
            config.write_tracking_window = Duration::from_secs(10);
        }
        Self {
            config,
            windows: Mutex::new(HashMap::new()),
            stats: PolicyStats::default(),
        }
    }

    /// Records a write against the key's rolling window. Call on every
    /// storage write regardless of the admission outcome, otherwise hot
    /// keys cool off the moment they stop being cached.
    pub fn record_write(&self, key: &[u8]) {
        let mut windows = self.windows.lock().unwrap();
        let now = Instant::now();

        if windows.len() >= MAX_TRACKED_KEYS {
            let window = self.config.write_tracking_window;
            windows.retain(|_, w| now.duration_since(w.window_start) <= window);
        }

        match windows.get_mut(key) {
            Some(w) if now.duration_since(w.window_start) <= self.config.write_tracking_window => {
                w.count += 1;
            }
            _ => {
                windows.insert(
                    Bytes::copy_from_slice(key),
                    WriteWindow {
                        window_start: now,
                        count: 1,
                    },
                );
            }
        }
    }

    /// Decides whether to cache `key`, given the TTL the write carried
    /// (`None` for writes without expiry).
    pub fn decide(&self, key: &[u8], ttl: Option<Duration>) -> CacheDecision {
        let decision = self.evaluate(key, ttl);
        if let CacheDecision::Skip(reason) = decision {
            self.stats.record(reason);
        }
        decision
    }

    pub fn stats(&self) -> &PolicyStats {
        &self.stats
    }

    fn evaluate(&self, key: &[u8], ttl: Option<Duration>) -> CacheDecision {
        if self.matches_any(&self.config.include, key) {
            return CacheDecision::Cache;
        }
        if self.matches_any(&self.config.exclude, key) {
            return CacheDecision::Skip(SkipReason::Excluded);
        }
        if let (Some(min_ttl), Some(ttl)) = (self.config.min_ttl, ttl) {
            if ttl < min_ttl {
                return CacheDecision::Skip(SkipReason::TtlTooShort);
            }
        }
        if let Some(max_freq) = self.config.max_write_freq {
            if self.write_rate(key) > max_freq {
                return CacheDecision::Skip(SkipReason::HotKey);
            }
        }
        CacheDecision::Cache
    }

    fn matches_any(&self, patterns: &[Bytes], key: &[u8]) -> bool {
        patterns.iter().any(|p| glob_match(p, key))
    }

    /// Writes per second over the key's current window.
    fn write_rate(&self, key: &[u8]) -> f64 {
        let windows = self.windows.lock().unwrap();
        let Some(w) = windows.get(key) else {
            return 0.0;
        };
        let elapsed = Instant::now().duration_since(w.window_start);
        if elapsed > self.config.write_tracking_window {
            return 0.0;
        }
        // Rate against the full window so a burst at window start does not
        // divide by near-zero.
        w.count as f64 / self.config.write_tracking_window.as_secs_f64()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy(config: PolicyConfig) -> CachePolicy {
        CachePolicy::new(config)
    }

    #[test]
    fn test_default_caches_everything() {
        let p = policy(PolicyConfig::default());
        assert_eq!(p.decide(b"any:key", None), CacheDecision::Cache);
        assert_eq!(
            p.decide(b"any:key", Some(Duration::from_millis(1))),
            CacheDecision::Cache
        );
    }

    #[test]
    fn test_min_ttl_skips_short_lived() {
        let p = policy(PolicyConfig {
            min_ttl: Some(Duration::from_secs(5)),
            ..Default::default()
        });
        assert_eq!(
            p.decide(b"k", Some(Duration::from_secs(1))),
            CacheDecision::Skip(SkipReason::TtlTooShort)
        );
        assert_eq!(p.decide(b"k", Some(Duration::from_secs(10))), CacheDecision::Cache);
        // No TTL at all means no TTL check
        assert_eq!(p.decide(b"k", None), CacheDecision::Cache);
        assert_eq!(p.stats().skipped_ttl.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn test_hot_key_detection() {
        let p = policy(PolicyConfig {
            max_write_freq: Some(2.0),
            write_tracking_window: Duration::from_secs(1),
            ..Default::default()
        });
        for _ in 0..10 {
            p.record_write(b"hot");
        }
        p.record_write(b"cold");
        assert_eq!(p.decide(b"hot", None), CacheDecision::Skip(SkipReason::HotKey));
        assert_eq!(p.decide(b"cold", None), CacheDecision::Cache);
    }

    #[test]
    fn test_exclude_patterns() {
        let p = policy(PolicyConfig {
            exclude: vec![Bytes::from("session:*")],
            ..Default::default()
        });
        assert_eq!(
            p.decide(b"session:abc", None),
            CacheDecision::Skip(SkipReason::Excluded)
        );
        assert_eq!(p.decide(b"user:1", None), CacheDecision::Cache);
    }

    #[test]
    fn test_include_wins_over_everything() {
        let p = policy(PolicyConfig {
            min_ttl: Some(Duration::from_secs(60)),
            max_write_freq: Some(0.1),
            write_tracking_window: Duration::from_secs(1),
            include: vec![Bytes::from("pin:*")],
            exclude: vec![Bytes::from("pin:*")],
        });
        for _ in 0..100 {
            p.record_write(b"pin:1");
        }
        // Hot, excluded, and below min TTL, yet included
        assert_eq!(
            p.decide(b"pin:1", Some(Duration::from_millis(1))),
            CacheDecision::Cache
        );
    }

    #[test]
    fn test_exclude_wins_over_ttl_and_frequency() {
        let p = policy(PolicyConfig {
            min_ttl: Some(Duration::from_secs(60)),
            exclude: vec![Bytes::from("x:*")],
            ..Default::default()
        });
        // Both the exclude and the TTL check would skip; reason must be the
        // pattern, which is evaluated first.
        assert_eq!(
            p.decide(b"x:1", Some(Duration::from_secs(1))),
            CacheDecision::Skip(SkipReason::Excluded)
        );
    }

    #[test]
    fn test_skip_reason_tags() {
        assert_eq!(SkipReason::TtlTooShort.as_str(), "ttl_too_short");
        assert_eq!(SkipReason::HotKey.as_str(), "hot_key");
        assert_eq!(SkipReason::Excluded.as_str(), "excluded");
    }
}
