//! In-process repositories.
//!
//! Backs the hermetic end-to-end tests and the `--store memory` development
//! mode. Mutex-per-table keeps the per-scope linearizability the rate
//! limiter relies on; there is no cross-table atomicity to emulate because
//! each trait method owns its tables.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use std::collections::HashMap;
use std::sync::Mutex;
use uuid::Uuid;

use crate::models::audit::InferenceRecord;
use crate::models::policy::Policy;

use super::{AuditStore, BudgetStore, Period, PolicyStore, RateWindowStore, WindowStats};

#[derive(Default)]
pub struct MemoryStore {
    policies: Mutex<Vec<Policy>>,
    rate_rows: Mutex<Vec<(String, DateTime<Utc>)>>,
    budgets: Mutex<HashMap<(String, Period, DateTime<Utc>), (Decimal, i64)>>,
    records: Mutex<Vec<InferenceRecord>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_policy(&self, policy: Policy) {
        self.policies.lock().unwrap().push(policy);
    }

    /// Test support: all audit records written so far.
    pub fn audit_records(&self) -> Vec<InferenceRecord> {
        self.records.lock().unwrap().clone()
    }

    /// Test support: admission rows for one scope key.
    pub fn rate_rows_for(&self, scope_key: &str) -> Vec<DateTime<Utc>> {
        self.rate_rows
            .lock()
            .unwrap()
            .iter()
            .filter(|(k, _)| k == scope_key)
            .map(|(_, ts)| *ts)
            .collect()
    }

    /// Test support: one period bucket's `(total_cost, request_count)`.
    pub fn budget_bucket(
        &self,
        scope_key: &str,
        period: Period,
        period_start: DateTime<Utc>,
    ) -> Option<(Decimal, i64)> {
        self.budgets
            .lock()
            .unwrap()
            .get(&(scope_key.to_string(), period, period_start))
            .copied()
    }
}

#[async_trait]
impl PolicyStore for MemoryStore {
    async fn applicable_policies(
        &self,
        org: Uuid,
        app: Uuid,
        user: Option<Uuid>,
    ) -> anyhow::Result<Vec<Policy>> {
        let mut matched: Vec<Policy> = self
            .policies
            .lock()
            .unwrap()
            .iter()
            .filter(|p| p.applies_to(org, app, user))
            .cloned()
            .collect();
        matched.sort_by(|a, b| {
            b.priority
                .cmp(&a.priority)
                .then(b.updated_at.cmp(&a.updated_at))
        });
        Ok(matched)
    }
}

#[async_trait]
impl RateWindowStore for MemoryStore {
    async fn window_stats(&self, scope_key: &str, from: DateTime<Utc>) -> anyhow::Result<WindowStats> {
        let rows = self.rate_rows.lock().unwrap();
        let in_window: Vec<DateTime<Utc>> = rows
            .iter()
            .filter(|(k, ts)| k == scope_key && *ts >= from)
            .map(|(_, ts)| *ts)
            .collect();
        Ok(WindowStats {
            count: in_window.len() as u64,
            oldest: in_window.iter().min().copied(),
        })
    }

    async fn append(&self, scope_key: &str, at: DateTime<Utc>) -> anyhow::Result<()> {
        self.rate_rows.lock().unwrap().push((scope_key.to_string(), at));
        Ok(())
    }

    async fn delete_older_than(&self, cutoff: DateTime<Utc>) -> anyhow::Result<u64> {
        let mut rows = self.rate_rows.lock().unwrap();
        let before = rows.len();
        rows.retain(|(_, ts)| *ts >= cutoff);
        Ok((before - rows.len()) as u64)
    }
}

#[async_trait]
impl BudgetStore for MemoryStore {
    async fn period_spend(
        &self,
        scope_key: &str,
        period: Period,
        period_start: DateTime<Utc>,
    ) -> anyhow::Result<Decimal> {
        Ok(self
            .budgets
            .lock()
            .unwrap()
            .get(&(scope_key.to_string(), period, period_start))
            .map(|(cost, _)| *cost)
            .unwrap_or(Decimal::ZERO))
    }

    async fn record_cost(&self, scope_key: &str, at: DateTime<Utc>, cost: Decimal) -> anyhow::Result<()> {
        let mut budgets = self.budgets.lock().unwrap();
        for period in Period::ALL {
            let entry = budgets
                .entry((scope_key.to_string(), period, period.start_of(at)))
                .or_insert((Decimal::ZERO, 0));
            entry.0 += cost;
            entry.1 += 1;
        }
        Ok(())
    }

    async fn delete_daily_before(&self, cutoff: DateTime<Utc>) -> anyhow::Result<u64> {
        let mut budgets = self.budgets.lock().unwrap();
        let before = budgets.len();
        budgets.retain(|(_, period, start), _| !(*period == Period::Daily && *start < cutoff));
        Ok((before - budgets.len()) as u64)
    }
}

#[async_trait]
impl AuditStore for MemoryStore {
    async fn insert_record(&self, record: &InferenceRecord) -> anyhow::Result<()> {
        self.records.lock().unwrap().push(record.clone());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::policy::PolicyKind;
    use chrono::TimeZone;

    fn policy(org: Uuid, priority: i32, updated_at: DateTime<Utc>) -> Policy {
        Policy {
            id: Uuid::new_v4(),
            org_id: org,
            app_id: None,
            user_id: None,
            kind: PolicyKind::RateLimit,
            config: serde_json::json!({"requests_per_minute": 10}),
            priority,
            enabled: true,
            created_at: updated_at,
            updated_at,
        }
    }

    #[tokio::test]
    async fn test_policy_ordering() {
        let store = MemoryStore::new();
        let org = Uuid::new_v4();
        let app = Uuid::new_v4();
        let older = Utc.with_ymd_and_hms(2025, 1, 1, 0, 0, 0).unwrap();
        let newer = Utc.with_ymd_and_hms(2025, 2, 1, 0, 0, 0).unwrap();

        let low = policy(org, 1, older);
        let high = policy(org, 10, older);
        let high_newer = policy(org, 10, newer);
        store.add_policy(low.clone());
        store.add_policy(high.clone());
        store.add_policy(high_newer.clone());

        let got = store.applicable_policies(org, app, None).await.unwrap();
        assert_eq!(got[0].id, high_newer.id);
        assert_eq!(got[1].id, high.id);
        assert_eq!(got[2].id, low.id);
    }

    #[tokio::test]
    async fn test_window_stats_and_reap() {
        let store = MemoryStore::new();
        let t0 = Utc.with_ymd_and_hms(2025, 6, 1, 12, 0, 0).unwrap();
        store.append("org:a", t0).await.unwrap();
        store.append("org:a", t0 + chrono::Duration::seconds(30)).await.unwrap();
        store.append("org:b", t0).await.unwrap();

        let stats = store.window_stats("org:a", t0).await.unwrap();
        assert_eq!(stats.count, 2);
        assert_eq!(stats.oldest, Some(t0));

        let removed = store
            .delete_older_than(t0 + chrono::Duration::seconds(10))
            .await
            .unwrap();
        assert_eq!(removed, 2); // both t0 rows, across scopes
        assert_eq!(store.window_stats("org:a", t0).await.unwrap().count, 1);
    }

    #[tokio::test]
    async fn test_record_cost_updates_all_periods() {
        let store = MemoryStore::new();
        let at = Utc.with_ymd_and_hms(2025, 6, 15, 10, 0, 0).unwrap();
        store.record_cost("org:x", at, Decimal::new(150, 2)).await.unwrap();
        store.record_cost("org:x", at, Decimal::new(50, 2)).await.unwrap();

        for period in Period::ALL {
            let spend = store
                .period_spend("org:x", period, period.start_of(at))
                .await
                .unwrap();
            assert_eq!(spend, Decimal::new(200, 2), "period {:?}", period);
        }
        let (_, count) = store
            .budget_bucket("org:x", Period::Daily, Period::Daily.start_of(at))
            .unwrap();
        assert_eq!(count, 2);
    }
}
