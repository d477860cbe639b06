//! Sliding-window rate limiting over the durable admission log.
//!
//! `check` is a pure read; the caller commits exactly one row per scope key
//! only after *every* rate policy has admitted the request, so a rejected
//! request leaves no trace in the window.

use chrono::{DateTime, Duration, Utc};
use std::collections::HashSet;
use std::sync::Arc;

use crate::models::policy::RateLimitConfig;
use crate::store::RateWindowStore;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RateDecision {
    pub allowed: bool,
    pub limit: u64,
    pub window_seconds: u64,
    /// Requests already in the window at check time.
    pub current: u64,
    /// How long until the oldest in-window admission falls out.
    pub retry_after_ms: u64,
}

pub struct RateLimiter {
    store: Arc<dyn RateWindowStore>,
}

impl RateLimiter {
    pub fn new(store: Arc<dyn RateWindowStore>) -> Self {
        Self { store }
    }

    /// Would admitting one more request at `now` stay within `cfg`?
    pub async fn check(
        &self,
        scope_key: &str,
        cfg: &RateLimitConfig,
        now: DateTime<Utc>,
    ) -> anyhow::Result<RateDecision> {
        // 0 means "no limit".
        if cfg.limit == 0 {
            return Ok(RateDecision {
                allowed: true,
                limit: 0,
                window_seconds: cfg.window_seconds,
                current: 0,
                retry_after_ms: 0,
            });
        }

        let window = Duration::seconds(cfg.window_seconds as i64);
        let stats = self.store.window_stats(scope_key, now - window).await?;

        if stats.count + 1 > cfg.limit {
            let retry_after_ms = stats
                .oldest
                .map(|oldest| {
                    let window_end = oldest + window;
                    (window_end - now).num_milliseconds().max(0) as u64
                })
                .unwrap_or(0)
                .max(1);
            return Ok(RateDecision {
                allowed: false,
                limit: cfg.limit,
                window_seconds: cfg.window_seconds,
                current: stats.count,
                retry_after_ms,
            });
        }

        Ok(RateDecision {
            allowed: true,
            limit: cfg.limit,
            window_seconds: cfg.window_seconds,
            current: stats.count,
            retry_after_ms: 0,
        })
    }

    /// Record the admitted request: one row per distinct scope key. Called
    /// only after the full admission decision succeeded across all
    /// rate-limit policies.
    pub async fn commit(&self, scope_keys: &[String], now: DateTime<Utc>) -> anyhow::Result<()> {
        let mut seen = HashSet::new();
        for key in scope_keys {
            if seen.insert(key.as_str()) {
                self.store.append(key, now).await?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::memory::MemoryStore;
    use chrono::TimeZone;

    fn cfg(limit: u64, window_seconds: u64) -> RateLimitConfig {
        RateLimitConfig { limit, window_seconds }
    }

    fn limiter() -> (RateLimiter, Arc<MemoryStore>) {
        let store = Arc::new(MemoryStore::new());
        (RateLimiter::new(store.clone()), store)
    }

    #[tokio::test]
    async fn test_admits_under_limit() {
        let (limiter, _) = limiter();
        let now = Utc::now();
        let decision = limiter.check("org:a", &cfg(2, 60), now).await.unwrap();
        assert!(decision.allowed);
        assert_eq!(decision.current, 0);
    }

    #[tokio::test]
    async fn test_denies_at_limit_with_retry_after() {
        let (limiter, _) = limiter();
        let now = Utc.with_ymd_and_hms(2025, 6, 1, 12, 0, 0).unwrap();

        limiter.commit(&["org:a".to_string()], now).await.unwrap();
        let at = now + Duration::seconds(1);
        let decision = limiter.check("org:a", &cfg(1, 60), at).await.unwrap();
        assert!(!decision.allowed);
        assert_eq!(decision.current, 1);
        // Oldest admission at t0, window 60s, checked at t0+1s → 59s left.
        assert_eq!(decision.retry_after_ms, 59_000);
    }

    #[tokio::test]
    async fn test_window_slides() {
        let (limiter, _) = limiter();
        let t0 = Utc.with_ymd_and_hms(2025, 6, 1, 12, 0, 0).unwrap();
        limiter.commit(&["org:a".to_string()], t0).await.unwrap();

        // Inside the window: denied.
        let denied = limiter.check("org:a", &cfg(1, 60), t0 + Duration::seconds(30)).await.unwrap();
        assert!(!denied.allowed);

        // After the window has slid past the admission: allowed again.
        let allowed = limiter.check("org:a", &cfg(1, 60), t0 + Duration::seconds(61)).await.unwrap();
        assert!(allowed.allowed);
    }

    #[tokio::test]
    async fn test_check_does_not_append() {
        let (limiter, store) = limiter();
        let now = Utc::now();
        for _ in 0..5 {
            limiter.check("org:a", &cfg(1, 60), now).await.unwrap();
        }
        assert!(store.rate_rows_for("org:a").is_empty());
    }

    #[tokio::test]
    async fn test_commit_dedupes_scope_keys() {
        let (limiter, store) = limiter();
        let now = Utc::now();
        // Two policies sharing the same scope commit a single row.
        let keys = vec!["org:a".to_string(), "org:a".to_string(), "org:a:app:b".to_string()];
        limiter.commit(&keys, now).await.unwrap();
        assert_eq!(store.rate_rows_for("org:a").len(), 1);
        assert_eq!(store.rate_rows_for("org:a:app:b").len(), 1);
    }

    #[tokio::test]
    async fn test_zero_limit_means_unlimited() {
        let (limiter, _) = limiter();
        let now = Utc::now();
        for _ in 0..10 {
            limiter.commit(&["org:a".to_string()], now).await.unwrap();
        }
        let decision = limiter.check("org:a", &cfg(0, 60), now).await.unwrap();
        assert!(decision.allowed);
    }

    #[tokio::test]
    async fn test_scopes_are_independent() {
        let (limiter, _) = limiter();
        let now = Utc::now();
        limiter.commit(&["org:a".to_string()], now).await.unwrap();
        let other = limiter.check("org:b", &cfg(1, 60), now).await.unwrap();
        assert!(other.allowed);
    }
}
