//! Background maintenance: the rate-window reaper and the budget-period
//! compactor. Both are idempotent and crash-safe — a missed tick just means
//! slightly more rows for the next one.

use chrono::{Duration as ChronoDuration, Utc};
use std::sync::Arc;
use std::time::Duration;
use tokio::time;

use crate::store::{BudgetStore, RateWindowStore};

/// Reap cadence for the rate-window log.
const REAP_INTERVAL: Duration = Duration::from_secs(60);

/// Daily cadence for the budget compactor.
const COMPACT_INTERVAL: Duration = Duration::from_secs(24 * 3600);

/// Closed daily buckets older than this are compacted away; monthly and
/// yearly buckets are kept indefinitely.
const DAILY_RETENTION_DAYS: i64 = 400;

/// Spawn the rate-window reaper. Rows older than `max_window × 2` are
/// deleted every minute; `max_window` is the largest window the deployment
/// allows policies to configure.
pub fn spawn_rate_reaper(store: Arc<dyn RateWindowStore>, max_window: Duration) {
    tokio::spawn(async move {
        let mut interval = time::interval(REAP_INTERVAL);
        loop {
            interval.tick().await;
            if let Err(e) = reap_rate_windows(store.as_ref(), max_window).await {
                tracing::error!(error = %e, "rate-window reaper failed");
            }
        }
    });
}

pub async fn reap_rate_windows(
    store: &dyn RateWindowStore,
    max_window: Duration,
) -> anyhow::Result<u64> {
    let horizon = ChronoDuration::from_std(max_window * 2).unwrap_or(ChronoDuration::hours(2));
    let cutoff = Utc::now() - horizon;
    let removed = store.delete_older_than(cutoff).await?;
    if removed > 0 {
        tracing::debug!(removed, "reaped rate-window rows");
    }
    Ok(removed)
}

/// Spawn the optional budget-period compactor.
pub fn spawn_budget_compactor(store: Arc<dyn BudgetStore>) {
    tokio::spawn(async move {
        let mut interval = time::interval(COMPACT_INTERVAL);
        loop {
            interval.tick().await;
            if let Err(e) = compact_budget_periods(store.as_ref()).await {
                tracing::error!(error = %e, "budget compactor failed");
            }
        }
    });
}

pub async fn compact_budget_periods(store: &dyn BudgetStore) -> anyhow::Result<u64> {
    let cutoff = Utc::now() - ChronoDuration::days(DAILY_RETENTION_DAYS);
    let removed = store.delete_daily_before(cutoff).await?;
    if removed > 0 {
        tracing::info!(removed, "compacted closed daily budget buckets");
    }
    Ok(removed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::memory::MemoryStore;
    use crate::store::{Period, RateWindowStore};
    use rust_decimal::Decimal;

    #[tokio::test]
    async fn test_reap_removes_only_stale_rows() {
        let store = MemoryStore::new();
        let now = Utc::now();
        store.append("org:a", now - ChronoDuration::hours(5)).await.unwrap();
        store.append("org:a", now).await.unwrap();

        let removed = reap_rate_windows(&store, Duration::from_secs(3600)).await.unwrap();
        assert_eq!(removed, 1);
        assert_eq!(store.rate_rows_for("org:a").len(), 1);

        // Second pass finds nothing: idempotent.
        let removed = reap_rate_windows(&store, Duration::from_secs(3600)).await.unwrap();
        assert_eq!(removed, 0);
    }

    #[tokio::test]
    async fn test_compactor_keeps_recent_and_non_daily_buckets() {
        let store = MemoryStore::new();
        let old = Utc::now() - ChronoDuration::days(500);
        let recent = Utc::now();
        store.record_cost("org:a", old, Decimal::ONE).await.unwrap();
        store.record_cost("org:a", recent, Decimal::ONE).await.unwrap();

        let removed = compact_budget_periods(&store).await.unwrap();
        assert_eq!(removed, 1); // only the stale daily bucket

        // Recent daily bucket and the yearly buckets survive.
        assert!(store
            .budget_bucket("org:a", Period::Daily, Period::Daily.start_of(recent))
            .is_some());
        assert!(store
            .budget_bucket("org:a", Period::Yearly, Period::Yearly.start_of(old))
            .is_some());
    }
}
