//! Period-bucketed budget enforcement.
//!
//! `check_budget` is a read-only gate against an *estimated* cost; the true
//! debit happens post-call via `record_cost`, which upserts all three period
//! rows in one transaction. Reads may trail concurrent writes — a pair of
//! requests racing past the check yields a transiently over-budget period
//! that the next check rejects.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use std::sync::Arc;
use uuid::Uuid;

use crate::models::policy::BudgetConfig;
use crate::store::{BudgetStore, Period};

#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct CurrentSpend {
    pub daily: Decimal,
    pub monthly: Decimal,
    pub yearly: Decimal,
}

impl CurrentSpend {
    pub fn get(&self, period: Period) -> Decimal {
        match period {
            Period::Daily => self.daily,
            Period::Monthly => self.monthly,
            Period::Yearly => self.yearly,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct BudgetDecision {
    pub allowed: bool,
    pub violated_period: Option<Period>,
    pub reason: Option<String>,
    pub current_spend: CurrentSpend,
}

pub struct BudgetLedger {
    store: Arc<dyn BudgetStore>,
}

impl BudgetLedger {
    pub fn new(store: Arc<dyn BudgetStore>) -> Self {
        Self { store }
    }

    /// Would spending `estimated_cost` breach any configured cap? Caps of
    /// zero are "no limit". The first violated period (daily before monthly
    /// before yearly) wins.
    pub async fn check_budget(
        &self,
        scope_key: &str,
        cfg: &BudgetConfig,
        estimated_cost: Decimal,
        now: DateTime<Utc>,
    ) -> anyhow::Result<BudgetDecision> {
        let mut current = CurrentSpend::default();
        for period in Period::ALL {
            let spend = self
                .store
                .period_spend(scope_key, period, period.start_of(now))
                .await?;
            match period {
                Period::Daily => current.daily = spend,
                Period::Monthly => current.monthly = spend,
                Period::Yearly => current.yearly = spend,
            }
        }

        let caps = [
            (Period::Daily, cfg.max_daily_cost),
            (Period::Monthly, cfg.max_monthly_cost),
            (Period::Yearly, cfg.max_yearly_cost),
        ];

        for (period, cap) in caps {
            if cap <= Decimal::ZERO {
                continue;
            }
            let spend = current.get(period);
            if spend + estimated_cost > cap {
                return Ok(BudgetDecision {
                    allowed: false,
                    violated_period: Some(period),
                    reason: Some(format!(
                        "{} budget cap of {} {} would be exceeded (current {}, estimated {})",
                        period.as_str(),
                        cap,
                        cfg.currency,
                        spend,
                        estimated_cost
                    )),
                    current_spend: current,
                });
            }
        }

        Ok(BudgetDecision {
            allowed: true,
            violated_period: None,
            reason: None,
            current_spend: current,
        })
    }

    /// Debit the true cost after the upstream call. All three period rows
    /// move together in one transaction.
    #[allow(clippy::too_many_arguments)]
    pub async fn record_cost(
        &self,
        scope_key: &str,
        true_cost: Decimal,
        tokens: u32,
        provider: &str,
        model: &str,
        request_id: Uuid,
        now: DateTime<Utc>,
    ) -> anyhow::Result<()> {
        self.store.record_cost(scope_key, now, true_cost).await?;
        tracing::debug!(
            scope_key,
            %true_cost,
            tokens,
            provider,
            model,
            %request_id,
            "budget ledger debited"
        );
        Ok(())
    }
}
