//! Postgres-backed repositories over one bounded `PgPool`.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use sqlx::postgres::PgPoolOptions;
use sqlx::{PgPool, Row};
use std::time::Duration;
use uuid::Uuid;

use crate::config::DatabaseConfig;
use crate::models::audit::InferenceRecord;
use crate::models::policy::{Policy, PolicyKind};

use super::{AuditStore, BudgetStore, Period, PolicyStore, RateWindowStore, WindowStats};

#[derive(Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub async fn connect(cfg: &DatabaseConfig) -> anyhow::Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(cfg.max_open_conns)
            .min_connections(cfg.max_idle_conns.min(cfg.max_open_conns))
            .max_lifetime(Duration::from_secs(cfg.conn_max_lifetime_secs))
            .connect(&cfg.url)
            .await?;
        Ok(Self { pool })
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Create the core's tables. The tenant tables are owned by the external
    /// CRUD surface; they are created here too so a fresh database works for
    /// local development.
    pub async fn migrate(&self) -> anyhow::Result<()> {
        // The schema is a multi-statement script; raw_sql runs it outside
        // the prepared-statement path.
        sqlx::raw_sql(SCHEMA).execute(&self.pool).await?;
        Ok(())
    }
}

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS organizations (
    id UUID PRIMARY KEY,
    slug TEXT NOT NULL UNIQUE,
    name TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS applications (
    id UUID PRIMARY KEY,
    org_id UUID NOT NULL REFERENCES organizations(id),
    name TEXT NOT NULL,
    api_key_fingerprint TEXT NOT NULL UNIQUE
);

CREATE TABLE IF NOT EXISTS users (
    id UUID PRIMARY KEY,
    org_id UUID NOT NULL REFERENCES organizations(id),
    external_subject TEXT NOT NULL UNIQUE,
    email TEXT NOT NULL,
    role TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS policies (
    id UUID PRIMARY KEY,
    org_id UUID NOT NULL,
    app_id UUID,
    user_id UUID,
    policy_type TEXT NOT NULL,
    config JSONB NOT NULL DEFAULT '{}',
    priority INT NOT NULL DEFAULT 0,
    enabled BOOLEAN NOT NULL DEFAULT TRUE,
    created_at TIMESTAMPTZ NOT NULL DEFAULT now(),
    updated_at TIMESTAMPTZ NOT NULL DEFAULT now()
);
CREATE INDEX IF NOT EXISTS idx_policies_org_enabled
    ON policies (org_id, enabled, priority DESC);

CREATE TABLE IF NOT EXISTS budget_tracking (
    id UUID PRIMARY KEY DEFAULT gen_random_uuid(),
    scope_key TEXT NOT NULL,
    period TEXT NOT NULL,
    period_start TIMESTAMPTZ NOT NULL,
    total_cost NUMERIC(18, 8) NOT NULL DEFAULT 0,
    request_count BIGINT NOT NULL DEFAULT 0,
    UNIQUE (scope_key, period, period_start)
);

CREATE TABLE IF NOT EXISTS rate_limit_requests (
    id BIGSERIAL PRIMARY KEY,
    key TEXT NOT NULL,
    timestamp TIMESTAMPTZ NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_rate_limit_key_ts
    ON rate_limit_requests (key, timestamp);

CREATE TABLE IF NOT EXISTS audit_logs (
    id UUID PRIMARY KEY,
    org_id UUID NOT NULL,
    app_id UUID NOT NULL,
    user_id UUID,
    request_id UUID NOT NULL,
    action TEXT NOT NULL,
    provider TEXT,
    model TEXT,
    prompt_tokens INT,
    completion_tokens INT,
    cost NUMERIC(18, 8),
    latency_ms BIGINT,
    status TEXT NOT NULL,
    error_kind TEXT,
    policies_applied JSONB NOT NULL DEFAULT '[]',
    ip_address TEXT,
    user_agent TEXT,
    timestamp TIMESTAMPTZ NOT NULL,
    details JSONB NOT NULL DEFAULT '{}'
);
CREATE INDEX IF NOT EXISTS idx_audit_org_ts ON audit_logs (org_id, timestamp);
"#;

// ── PolicyStore ───────────────────────────────────────────────

#[derive(sqlx::FromRow)]
struct PolicyRow {
    id: Uuid,
    org_id: Uuid,
    app_id: Option<Uuid>,
    user_id: Option<Uuid>,
    policy_type: String,
    config: serde_json::Value,
    priority: i32,
    enabled: bool,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

#[async_trait]
impl PolicyStore for PgStore {
    async fn applicable_policies(
        &self,
        org: Uuid,
        app: Uuid,
        user: Option<Uuid>,
    ) -> anyhow::Result<Vec<Policy>> {
        let rows = sqlx::query_as::<_, PolicyRow>(
            r#"
            SELECT id, org_id, app_id, user_id, policy_type, config,
                   priority, enabled, created_at, updated_at
            FROM policies
            WHERE org_id = $1
              AND enabled
              AND (app_id IS NULL OR app_id = $2)
              AND (user_id IS NULL OR user_id = $3)
            ORDER BY priority DESC, updated_at DESC
            "#,
        )
        .bind(org)
        .bind(app)
        .bind(user)
        .fetch_all(&self.pool)
        .await?;

        let mut policies = Vec::with_capacity(rows.len());
        for row in rows {
            let Some(kind) = PolicyKind::parse(&row.policy_type) else {
                tracing::warn!(policy_id = %row.id, policy_type = %row.policy_type,
                    "skipping policy with unknown type");
                continue;
            };
            policies.push(Policy {
                id: row.id,
                org_id: row.org_id,
                app_id: row.app_id,
                user_id: row.user_id,
                kind,
                config: row.config,
                priority: row.priority,
                enabled: row.enabled,
                created_at: row.created_at,
                updated_at: row.updated_at,
            });
        }
        Ok(policies)
    }
}

// ── RateWindowStore ───────────────────────────────────────────

#[async_trait]
impl RateWindowStore for PgStore {
    async fn window_stats(&self, scope_key: &str, from: DateTime<Utc>) -> anyhow::Result<WindowStats> {
        let row = sqlx::query(
            r#"
            SELECT COUNT(*) AS count, MIN(timestamp) AS oldest
            FROM rate_limit_requests
            WHERE key = $1 AND timestamp >= $2
            "#,
        )
        .bind(scope_key)
        .bind(from)
        .fetch_one(&self.pool)
        .await?;

        Ok(WindowStats {
            count: row.get::<i64, _>("count") as u64,
            oldest: row.get::<Option<DateTime<Utc>>, _>("oldest"),
        })
    }

    async fn append(&self, scope_key: &str, at: DateTime<Utc>) -> anyhow::Result<()> {
        sqlx::query("INSERT INTO rate_limit_requests (key, timestamp) VALUES ($1, $2)")
            .bind(scope_key)
            .bind(at)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn delete_older_than(&self, cutoff: DateTime<Utc>) -> anyhow::Result<u64> {
        let result = sqlx::query("DELETE FROM rate_limit_requests WHERE timestamp < $1")
            .bind(cutoff)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }
}

// ── BudgetStore ───────────────────────────────────────────────

#[async_trait]
impl BudgetStore for PgStore {
    async fn period_spend(
        &self,
        scope_key: &str,
        period: Period,
        period_start: DateTime<Utc>,
    ) -> anyhow::Result<Decimal> {
        let spend: Option<Decimal> = sqlx::query_scalar(
            r#"
            SELECT total_cost FROM budget_tracking
            WHERE scope_key = $1 AND period = $2 AND period_start = $3
            "#,
        )
        .bind(scope_key)
        .bind(period.as_str())
        .bind(period_start)
        .fetch_optional(&self.pool)
        .await?;
        Ok(spend.unwrap_or(Decimal::ZERO))
    }

    async fn record_cost(&self, scope_key: &str, at: DateTime<Utc>, cost: Decimal) -> anyhow::Result<()> {
        // All three period rows in one transaction; each upsert is a single
        // conflict-update statement so concurrent writers never lose a debit.
        let mut tx = self.pool.begin().await?;
        for period in Period::ALL {
            sqlx::query(
                r#"
                INSERT INTO budget_tracking (id, scope_key, period, period_start, total_cost, request_count)
                VALUES (gen_random_uuid(), $1, $2, $3, $4, 1)
                ON CONFLICT (scope_key, period, period_start)
                DO UPDATE SET
                    total_cost = budget_tracking.total_cost + EXCLUDED.total_cost,
                    request_count = budget_tracking.request_count + 1
                "#,
            )
            .bind(scope_key)
            .bind(period.as_str())
            .bind(period.start_of(at))
            .bind(cost)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    async fn delete_daily_before(&self, cutoff: DateTime<Utc>) -> anyhow::Result<u64> {
        let result = sqlx::query(
            "DELETE FROM budget_tracking WHERE period = 'daily' AND period_start < $1",
        )
        .bind(cutoff)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }
}

// ── AuditStore ────────────────────────────────────────────────

#[async_trait]
impl AuditStore for PgStore {
    async fn insert_record(&self, record: &InferenceRecord) -> anyhow::Result<()> {
        sqlx::query(
            r#"
            INSERT INTO audit_logs (
                id, org_id, app_id, user_id, request_id, action, provider, model,
                prompt_tokens, completion_tokens, cost, latency_ms, status,
                error_kind, policies_applied, ip_address, user_agent, timestamp, details
            ) VALUES ($1,$2,$3,$4,$5,$6,$7,$8,$9,$10,$11,$12,$13,$14,$15,$16,$17,$18,$19)
            "#,
        )
        .bind(record.id)
        .bind(record.org_id)
        .bind(record.app_id)
        .bind(record.user_id)
        .bind(record.request_id)
        .bind(&record.action)
        .bind(&record.provider)
        .bind(&record.model)
        .bind(record.prompt_tokens.map(|t| t as i32))
        .bind(record.completion_tokens.map(|t| t as i32))
        .bind(record.cost)
        .bind(record.latency_ms.map(|l| l as i64))
        .bind(record.status.as_str())
        .bind(&record.error_kind)
        .bind(serde_json::to_value(&record.policies_applied)?)
        .bind(&record.ip)
        .bind(&record.user_agent)
        .bind(record.timestamp)
        .bind(&record.details)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}
