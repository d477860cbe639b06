//! Policy rows and their kind-tagged configuration blobs.
//!
//! A policy row stores `config` as loose JSON; `Policy::parse_config`
//! performs the strict per-kind parse. Unknown fields are tolerated, a
//! malformed required field invalidates that one policy only — the engine
//! logs and skips it so a single bad row never blocks a tenant.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use uuid::Uuid;

use crate::inspect::pii::PiiType;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Policy {
    pub id: Uuid,
    pub org_id: Uuid,
    pub app_id: Option<Uuid>,
    pub user_id: Option<Uuid>,
    pub kind: PolicyKind,
    pub config: serde_json::Value,
    pub priority: i32,
    pub enabled: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Policy {
    /// Scope predicate: a null `app_id`/`user_id` means "applies to all".
    pub fn applies_to(&self, org: Uuid, app: Uuid, user: Option<Uuid>) -> bool {
        self.enabled
            && self.org_id == org
            && self.app_id.map_or(true, |a| a == app)
            && self.user_id.map_or(true, |u| Some(u) == user)
    }

    pub fn parse_config(&self) -> anyhow::Result<PolicyConfig> {
        PolicyConfig::parse(self.kind, &self.config)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PolicyKind {
    RateLimit,
    Budget,
    Routing,
    PiiDetection,
    InjectionGuard,
    Rag,
    Retry,
    Fallback,
    LoadBalance,
}

impl PolicyKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            PolicyKind::RateLimit => "rate_limit",
            PolicyKind::Budget => "budget",
            PolicyKind::Routing => "routing",
            PolicyKind::PiiDetection => "pii_detection",
            PolicyKind::InjectionGuard => "injection_guard",
            PolicyKind::Rag => "rag",
            PolicyKind::Retry => "retry",
            PolicyKind::Fallback => "fallback",
            PolicyKind::LoadBalance => "load_balance",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "rate_limit" => Some(PolicyKind::RateLimit),
            "budget" => Some(PolicyKind::Budget),
            "routing" => Some(PolicyKind::Routing),
            "pii_detection" => Some(PolicyKind::PiiDetection),
            "injection_guard" => Some(PolicyKind::InjectionGuard),
            "rag" => Some(PolicyKind::Rag),
            "retry" => Some(PolicyKind::Retry),
            "fallback" => Some(PolicyKind::Fallback),
            "load_balance" => Some(PolicyKind::LoadBalance),
            _ => None,
        }
    }
}

// ── Typed configs ────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq)]
pub enum PolicyConfig {
    RateLimit(RateLimitConfig),
    Budget(BudgetConfig),
    Routing(RoutingConfig),
    PiiDetection(PiiDetectionConfig),
    InjectionGuard(InjectionGuardConfig),
    Rag(RagConfig),
    Retry(RetryConfig),
    Fallback(FallbackConfig),
    LoadBalance(LoadBalanceConfig),
}

impl PolicyConfig {
    pub fn parse(kind: PolicyKind, raw: &serde_json::Value) -> anyhow::Result<Self> {
        let parsed = match kind {
            PolicyKind::RateLimit => PolicyConfig::RateLimit(RateLimitConfig::parse(raw)?),
            PolicyKind::Budget => {
                let cfg: BudgetConfig = serde_json::from_value(raw.clone())?;
                cfg.validate()?;
                PolicyConfig::Budget(cfg)
            }
            PolicyKind::Routing => PolicyConfig::Routing(serde_json::from_value(raw.clone())?),
            PolicyKind::PiiDetection => {
                PolicyConfig::PiiDetection(serde_json::from_value(raw.clone())?)
            }
            PolicyKind::InjectionGuard => {
                let cfg: InjectionGuardConfig = serde_json::from_value(raw.clone())?;
                cfg.validate()?;
                PolicyConfig::InjectionGuard(cfg)
            }
            PolicyKind::Rag => PolicyConfig::Rag(RagConfig {}),
            PolicyKind::Retry => {
                let cfg: RetryConfig = serde_json::from_value(raw.clone())?;
                cfg.validate()?;
                PolicyConfig::Retry(cfg)
            }
            PolicyKind::Fallback => PolicyConfig::Fallback(serde_json::from_value(raw.clone())?),
            PolicyKind::LoadBalance => {
                PolicyConfig::LoadBalance(serde_json::from_value(raw.clone())?)
            }
        };
        Ok(parsed)
    }
}

/// Rate-limit config. Accepts either the shorthand `requests_per_minute`
/// or the explicit `{limit, window_seconds}` pair. 0 means "no limit".
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct RateLimitConfig {
    pub limit: u64,
    pub window_seconds: u64,
}

impl RateLimitConfig {
    fn parse(raw: &serde_json::Value) -> anyhow::Result<Self> {
        #[derive(Deserialize)]
        struct Raw {
            requests_per_minute: Option<u64>,
            limit: Option<u64>,
            window_seconds: Option<u64>,
        }
        let raw: Raw = serde_json::from_value(raw.clone())?;
        match (raw.requests_per_minute, raw.limit) {
            (Some(rpm), _) => Ok(Self { limit: rpm, window_seconds: 60 }),
            (None, Some(limit)) => Ok(Self {
                limit,
                window_seconds: raw
                    .window_seconds
                    .ok_or_else(|| anyhow::anyhow!("window_seconds is required with limit"))?,
            }),
            (None, None) => {
                anyhow::bail!("rate_limit requires requests_per_minute or limit/window_seconds")
            }
        }
    }

    pub fn window(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.window_seconds)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BudgetConfig {
    #[serde(default)]
    pub max_daily_cost: Decimal,
    #[serde(default)]
    pub max_monthly_cost: Decimal,
    #[serde(default)]
    pub max_yearly_cost: Decimal,
    #[serde(default = "default_currency")]
    pub currency: String,
}

fn default_currency() -> String {
    "USD".to_string()
}

impl BudgetConfig {
    fn validate(&self) -> anyhow::Result<()> {
        for (name, v) in [
            ("max_daily_cost", self.max_daily_cost),
            ("max_monthly_cost", self.max_monthly_cost),
            ("max_yearly_cost", self.max_yearly_cost),
        ] {
            if v < Decimal::ZERO {
                anyhow::bail!("{} must be non-negative", name);
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RoutingConfig {
    pub strategy: RoutingStrategy,
    #[serde(default)]
    pub fallback_providers: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RoutingStrategy {
    ModelBased,
    RoundRobin,
    LowestCost,
    Fastest,
    Failover,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PiiDetectionConfig {
    pub enabled: bool,
    #[serde(default)]
    pub mode: InspectionMode,
    /// Restrict detection to these types; `None` means all.
    #[serde(default)]
    pub types: Option<Vec<PiiType>>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InspectionMode {
    Strict,
    Redact,
    #[default]
    Warn,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct InjectionGuardConfig {
    pub enabled: bool,
    pub max_risk_score: f64,
}

impl InjectionGuardConfig {
    fn validate(&self) -> anyhow::Result<()> {
        if !(0.0..=1.0).contains(&self.max_risk_score) {
            anyhow::bail!("max_risk_score must be in [0, 1]");
        }
        Ok(())
    }
}

/// The retriever is an empty interface; the config carries nothing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RagConfig {}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RetryConfig {
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_initial_delay_ms")]
    pub initial_delay_ms: u64,
    #[serde(default = "default_multiplier")]
    pub multiplier: f64,
}

fn default_max_attempts() -> u32 {
    3
}
fn default_initial_delay_ms() -> u64 {
    200
}
fn default_multiplier() -> f64 {
    2.0
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            initial_delay_ms: default_initial_delay_ms(),
            multiplier: default_multiplier(),
        }
    }
}

impl RetryConfig {
    fn validate(&self) -> anyhow::Result<()> {
        if self.max_attempts == 0 {
            anyhow::bail!("max_attempts must be > 0");
        }
        if self.multiplier < 1.0 {
            anyhow::bail!("multiplier must be >= 1.0");
        }
        Ok(())
    }

    /// Delay before attempt `n` (1-based; attempt 1 has no delay).
    pub fn delay_for_attempt(&self, attempt: u32) -> std::time::Duration {
        if attempt <= 1 {
            return std::time::Duration::ZERO;
        }
        let ms = self.initial_delay_ms as f64 * self.multiplier.powi(attempt as i32 - 2);
        std::time::Duration::from_millis(ms as u64)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FallbackConfig {
    pub providers: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoadBalanceConfig {
    pub weights: HashMap<String, u32>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn policy(kind: PolicyKind, config: serde_json::Value) -> Policy {
        Policy {
            id: Uuid::new_v4(),
            org_id: Uuid::new_v4(),
            app_id: None,
            user_id: None,
            kind,
            config,
            priority: 0,
            enabled: true,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    #[test]
    fn test_rate_limit_shorthand() {
        let p = policy(PolicyKind::RateLimit, json!({"requests_per_minute": 100}));
        match p.parse_config().unwrap() {
            PolicyConfig::RateLimit(cfg) => {
                assert_eq!(cfg.limit, 100);
                assert_eq!(cfg.window_seconds, 60);
            }
            other => panic!("unexpected config: {:?}", other),
        }
    }

    #[test]
    fn test_rate_limit_explicit_pair() {
        let p = policy(PolicyKind::RateLimit, json!({"limit": 10, "window_seconds": 5}));
        match p.parse_config().unwrap() {
            PolicyConfig::RateLimit(cfg) => {
                assert_eq!(cfg.limit, 10);
                assert_eq!(cfg.window_seconds, 5);
            }
            other => panic!("unexpected config: {:?}", other),
        }
    }

    #[test]
    fn test_rate_limit_missing_both_shapes_fails() {
        let p = policy(PolicyKind::RateLimit, json!({"window_seconds": 60}));
        assert!(p.parse_config().is_err());
    }

    #[test]
    fn test_unknown_fields_tolerated() {
        let p = policy(
            PolicyKind::RateLimit,
            json!({"requests_per_minute": 5, "comment": "legacy field"}),
        );
        assert!(p.parse_config().is_ok());
    }

    #[test]
    fn test_budget_defaults_and_negative_rejected() {
        let p = policy(PolicyKind::Budget, json!({"max_daily_cost": "10.00"}));
        match p.parse_config().unwrap() {
            PolicyConfig::Budget(cfg) => {
                assert_eq!(cfg.max_daily_cost, Decimal::new(1000, 2));
                assert_eq!(cfg.max_monthly_cost, Decimal::ZERO);
                assert_eq!(cfg.currency, "USD");
            }
            other => panic!("unexpected config: {:?}", other),
        }

        let p = policy(PolicyKind::Budget, json!({"max_daily_cost": "-1"}));
        assert!(p.parse_config().is_err());
    }

    #[test]
    fn test_routing_strategies() {
        for (name, expect) in [
            ("model_based", RoutingStrategy::ModelBased),
            ("round_robin", RoutingStrategy::RoundRobin),
            ("lowest_cost", RoutingStrategy::LowestCost),
            ("fastest", RoutingStrategy::Fastest),
            ("failover", RoutingStrategy::Failover),
        ] {
            let p = policy(PolicyKind::Routing, json!({"strategy": name}));
            match p.parse_config().unwrap() {
                PolicyConfig::Routing(cfg) => assert_eq!(cfg.strategy, expect),
                other => panic!("unexpected config: {:?}", other),
            }
        }
    }

    #[test]
    fn test_injection_guard_score_bounds() {
        let p = policy(PolicyKind::InjectionGuard, json!({"enabled": true, "max_risk_score": 0.5}));
        assert!(p.parse_config().is_ok());

        let p = policy(PolicyKind::InjectionGuard, json!({"enabled": true, "max_risk_score": 1.5}));
        assert!(p.parse_config().is_err());
    }

    #[test]
    fn test_retry_defaults_and_delays() {
        let p = policy(PolicyKind::Retry, json!({}));
        let cfg = match p.parse_config().unwrap() {
            PolicyConfig::Retry(cfg) => cfg,
            other => panic!("unexpected config: {:?}", other),
        };
        assert_eq!(cfg.max_attempts, 3);
        assert_eq!(cfg.delay_for_attempt(1), std::time::Duration::ZERO);
        assert_eq!(cfg.delay_for_attempt(2), std::time::Duration::from_millis(200));
        assert_eq!(cfg.delay_for_attempt(3), std::time::Duration::from_millis(400));
    }

    #[test]
    fn test_applies_to_scopes() {
        let org = Uuid::new_v4();
        let app = Uuid::new_v4();
        let user = Uuid::new_v4();

        let mut p = policy(PolicyKind::RateLimit, json!({"requests_per_minute": 1}));
        p.org_id = org;

        // Org-wide: applies to any app/user within the org.
        assert!(p.applies_to(org, app, None));
        assert!(p.applies_to(org, app, Some(user)));
        assert!(!p.applies_to(Uuid::new_v4(), app, None));

        // App-scoped.
        p.app_id = Some(app);
        assert!(p.applies_to(org, app, None));
        assert!(!p.applies_to(org, Uuid::new_v4(), None));

        // User-scoped: does not apply to anonymous requests.
        p.user_id = Some(user);
        assert!(p.applies_to(org, app, Some(user)));
        assert!(!p.applies_to(org, app, None));
        assert!(!p.applies_to(org, app, Some(Uuid::new_v4())));

        // Disabled policies never apply.
        p.enabled = false;
        assert!(!p.applies_to(org, app, Some(user)));
    }

    #[test]
    fn test_kind_round_trip() {
        for kind in [
            PolicyKind::RateLimit,
            PolicyKind::Budget,
            PolicyKind::Routing,
            PolicyKind::PiiDetection,
            PolicyKind::InjectionGuard,
            PolicyKind::Rag,
            PolicyKind::Retry,
            PolicyKind::Fallback,
            PolicyKind::LoadBalance,
        ] {
            assert_eq!(PolicyKind::parse(kind.as_str()), Some(kind));
        }
        assert_eq!(PolicyKind::parse("bogus"), None);
    }
}
