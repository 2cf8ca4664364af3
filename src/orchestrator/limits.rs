//! Windowed rate limiting and idempotency-key deduplication.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use tokio::time::Instant;

use crate::config::{DedupConfig, RateLimitConfig};

// ============================================================================
// Rate Limiter
// ============================================================================

/// Per-identity counter for one rate-limit window.
#[derive(Debug, Clone, Copy)]
struct RateLimitEntry {
    count: u32,
    window_reset_at: Instant,
}

impl RateLimitEntry {
    fn fresh(window: Duration) -> Self {
        Self {
            count: 0,
            window_reset_at: Instant::now() + window,
        }
    }
}

/// Fixed-window rate limiter with per-sender and global budgets.
///
/// The count resets exactly once per window. A request is rejected with the
/// remaining time-to-reset when either budget is exhausted; otherwise both
/// counters are incremented and the request proceeds.
pub struct RateLimiter {
    config: RateLimitConfig,
    senders: Mutex<HashMap<String, RateLimitEntry>>,
    global: Mutex<RateLimitEntry>,
}

impl RateLimiter {
    pub fn new(config: RateLimitConfig) -> Self {
        let window = config.window();
        Self {
            config,
            senders: Mutex::new(HashMap::new()),
            global: Mutex::new(RateLimitEntry::fresh(window)),
        }
    }

    /// Admit or reject a request for the given sender.
    ///
    /// Returns `Err(retry_after)` when a budget is exhausted.
    pub fn check(&self, sender_id: &str) -> Result<(), Duration> {
        let now = Instant::now();
        let window = self.config.window();

        let mut global = match self.global.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        if now >= global.window_reset_at {
            *global = RateLimitEntry::fresh(window);
        }
        if global.count >= self.config.global_max {
            return Err(global.window_reset_at - now);
        }

        let mut senders = match self.senders.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        let entry = senders
            .entry(sender_id.to_string())
            .or_insert_with(|| RateLimitEntry::fresh(window));
        if now >= entry.window_reset_at {
            *entry = RateLimitEntry::fresh(window);
        }
        if entry.count >= self.config.per_sender_max {
            return Err(entry.window_reset_at - now);
        }

        entry.count += 1;
        global.count += 1;
        Ok(())
    }
}

impl std::fmt::Debug for RateLimiter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RateLimiter")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

// ============================================================================
// Dedup Cache
// ============================================================================

/// Short-TTL cache of idempotency keys so redelivered gateway events never
/// trigger a second turn for the same logical request.
pub struct DedupCache {
    config: DedupConfig,
    entries: Mutex<HashMap<String, Instant>>,
}

impl DedupCache {
    pub fn new(config: DedupConfig) -> Self {
        Self {
            config,
            entries: Mutex::new(HashMap::new()),
        }
    }

    /// Record a key. Returns `true` if the key was fresh, `false` when it
    /// was seen within the TTL (a duplicate).
    pub fn insert(&self, key: &str) -> bool {
        let now = Instant::now();
        let ttl = self.config.ttl();

        let mut entries = match self.entries.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };

        if entries.len() >= self.config.max_entries {
            entries.retain(|_, seen_at| now.duration_since(*seen_at) < ttl);
        }

        match entries.get(key) {
            Some(seen_at) if now.duration_since(*seen_at) < ttl => false,
            _ => {
                entries.insert(key.to_string(), now);
                true
            }
        }
    }
}

impl std::fmt::Debug for DedupCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DedupCache")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn limit_config(per_sender: u32, global: u32, window_secs: u64) -> RateLimitConfig {
        RateLimitConfig {
            per_sender_max: per_sender,
            global_max: global,
            window_secs,
        }
    }

    // ------------------------------------------------------------------------
    // RateLimiter
    // ------------------------------------------------------------------------

    #[tokio::test]
    async fn exactly_max_requests_succeed_per_window() {
        let limiter = RateLimiter::new(limit_config(3, 100, 60));

        for _ in 0..3 {
            assert!(limiter.check("alice").is_ok());
        }

        let retry_after = limiter.check("alice").unwrap_err();
        assert!(retry_after > Duration::ZERO);
    }

    #[tokio::test]
    async fn senders_have_independent_budgets() {
        let limiter = RateLimiter::new(limit_config(1, 100, 60));

        assert!(limiter.check("alice").is_ok());
        assert!(limiter.check("bob").is_ok());
        assert!(limiter.check("alice").is_err());
        assert!(limiter.check("bob").is_err());
    }

    #[tokio::test]
    async fn global_budget_caps_all_senders() {
        let limiter = RateLimiter::new(limit_config(10, 2, 60));

        assert!(limiter.check("alice").is_ok());
        assert!(limiter.check("bob").is_ok());

        let retry_after = limiter.check("carol").unwrap_err();
        assert!(retry_after > Duration::ZERO);
    }

    #[tokio::test(start_paused = true)]
    async fn window_expiry_resets_count_once() {
        let limiter = RateLimiter::new(limit_config(2, 100, 60));

        assert!(limiter.check("alice").is_ok());
        assert!(limiter.check("alice").is_ok());
        assert!(limiter.check("alice").is_err());

        tokio::time::advance(Duration::from_secs(61)).await;

        assert!(limiter.check("alice").is_ok());
        assert!(limiter.check("alice").is_ok());
        assert!(limiter.check("alice").is_err());
    }

    #[tokio::test]
    async fn rejected_requests_do_not_consume_budget() {
        let limiter = RateLimiter::new(limit_config(5, 1, 60));

        assert!(limiter.check("alice").is_ok());
        // Global exhausted: bob's rejection must not touch his own counter.
        assert!(limiter.check("bob").is_err());
    }

    // ------------------------------------------------------------------------
    // DedupCache
    // ------------------------------------------------------------------------

    fn dedup_config(ttl_secs: u64, max_entries: usize) -> DedupConfig {
        DedupConfig {
            ttl_secs,
            max_entries,
        }
    }

    #[tokio::test]
    async fn duplicate_key_within_ttl_is_rejected() {
        let cache = DedupCache::new(dedup_config(300, 1024));

        assert!(cache.insert("msg-1"));
        assert!(!cache.insert("msg-1"));
        assert!(cache.insert("msg-2"));
    }

    #[tokio::test(start_paused = true)]
    async fn key_is_fresh_again_after_ttl() {
        let cache = DedupCache::new(dedup_config(10, 1024));

        assert!(cache.insert("msg-1"));
        tokio::time::advance(Duration::from_secs(11)).await;
        assert!(cache.insert("msg-1"));
    }

    #[tokio::test(start_paused = true)]
    async fn cache_prunes_expired_entries_at_capacity() {
        let cache = DedupCache::new(dedup_config(10, 2));

        assert!(cache.insert("a"));
        assert!(cache.insert("b"));
        tokio::time::advance(Duration::from_secs(11)).await;

        // At capacity: expired entries are pruned, new key admitted.
        assert!(cache.insert("c"));
        assert!(cache.insert("a"));
    }
}
