//! Repository traits the pipeline is written against.
//!
//! `PgStore` implements them over a bounded connection pool; `MemoryStore`
//! implements them in-process for tests and the `--store memory` dev mode.
//! Any operation touching more than one row runs inside a transaction in
//! the Postgres implementation.

pub mod memory;
pub mod postgres;

use async_trait::async_trait;
use chrono::{DateTime, Datelike, TimeZone, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::models::audit::InferenceRecord;
use crate::models::policy::Policy;

// ── Period buckets ────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Period {
    Daily,
    Monthly,
    Yearly,
}

impl Period {
    pub const ALL: [Period; 3] = [Period::Daily, Period::Monthly, Period::Yearly];

    pub fn as_str(&self) -> &'static str {
        match self {
            Period::Daily => "daily",
            Period::Monthly => "monthly",
            Period::Yearly => "yearly",
        }
    }

    /// UTC truncation of `at` to the enclosing period boundary.
    pub fn start_of(&self, at: DateTime<Utc>) -> DateTime<Utc> {
        match self {
            Period::Daily => Utc
                .with_ymd_and_hms(at.year(), at.month(), at.day(), 0, 0, 0)
                .unwrap(),
            Period::Monthly => Utc.with_ymd_and_hms(at.year(), at.month(), 1, 0, 0, 0).unwrap(),
            Period::Yearly => Utc.with_ymd_and_hms(at.year(), 1, 1, 0, 0, 0).unwrap(),
        }
    }
}

/// Aggregate over a rate-limit scope's admission log within a window.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct WindowStats {
    pub count: u64,
    pub oldest: Option<DateTime<Utc>>,
}

// ── Repository traits ─────────────────────────────────────────

#[async_trait]
pub trait PolicyStore: Send + Sync {
    /// All enabled policies whose scope matches `(org, app, user)`, ordered
    /// by descending priority then descending `updated_at`.
    async fn applicable_policies(
        &self,
        org: Uuid,
        app: Uuid,
        user: Option<Uuid>,
    ) -> anyhow::Result<Vec<Policy>>;
}

#[async_trait]
pub trait RateWindowStore: Send + Sync {
    /// Count and oldest timestamp of admissions for `scope_key` since `from`.
    async fn window_stats(&self, scope_key: &str, from: DateTime<Utc>) -> anyhow::Result<WindowStats>;

    /// Append one admission row. Single-row and linearizable per scope.
    async fn append(&self, scope_key: &str, at: DateTime<Utc>) -> anyhow::Result<()>;

    /// Reaper support: drop rows older than `cutoff`. Idempotent.
    async fn delete_older_than(&self, cutoff: DateTime<Utc>) -> anyhow::Result<u64>;
}

#[async_trait]
pub trait BudgetStore: Send + Sync {
    /// Cumulative spend in one period bucket; zero when the row does not
    /// exist yet (buckets are created lazily on first write).
    async fn period_spend(
        &self,
        scope_key: &str,
        period: Period,
        period_start: DateTime<Utc>,
    ) -> anyhow::Result<Decimal>;

    /// Upsert all three period rows for `scope_key` in one transaction,
    /// adding `cost` and incrementing the request count.
    async fn record_cost(&self, scope_key: &str, at: DateTime<Utc>, cost: Decimal) -> anyhow::Result<()>;

    /// Compactor support: drop closed daily buckets older than `cutoff`.
    async fn delete_daily_before(&self, cutoff: DateTime<Utc>) -> anyhow::Result<u64>;
}

#[async_trait]
pub trait AuditStore: Send + Sync {
    async fn insert_record(&self, record: &InferenceRecord) -> anyhow::Result<()>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_period_start_truncation() {
        let at = Utc.with_ymd_and_hms(2025, 6, 15, 13, 45, 12).unwrap();
        assert_eq!(
            Period::Daily.start_of(at),
            Utc.with_ymd_and_hms(2025, 6, 15, 0, 0, 0).unwrap()
        );
        assert_eq!(
            Period::Monthly.start_of(at),
            Utc.with_ymd_and_hms(2025, 6, 1, 0, 0, 0).unwrap()
        );
        assert_eq!(
            Period::Yearly.start_of(at),
            Utc.with_ymd_and_hms(2025, 1, 1, 0, 0, 0).unwrap()
        );
    }

    #[test]
    fn test_period_start_is_idempotent() {
        let at = Utc.with_ymd_and_hms(2025, 12, 31, 23, 59, 59).unwrap();
        for period in Period::ALL {
            let start = period.start_of(at);
            assert_eq!(period.start_of(start), start);
        }
    }
}
