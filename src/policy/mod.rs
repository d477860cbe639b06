//! Policy engine: resolves the applicable policy set for a tenant scope and
//! exposes typed, kind-grouped views ordered by priority.

use std::collections::HashMap;
use std::sync::Arc;
use uuid::Uuid;

use crate::models::policy::{
    FallbackConfig, InjectionGuardConfig, PiiDetectionConfig, PolicyConfig, PolicyKind,
    RetryConfig, RoutingConfig,
};
use crate::store::PolicyStore;

/// One applicable policy with its parsed config. Scope columns ride along
/// so downstream consumers can derive per-policy bucket keys.
#[derive(Debug, Clone)]
pub struct ActivePolicy {
    pub id: Uuid,
    pub app_id: Option<Uuid>,
    pub user_id: Option<Uuid>,
    pub priority: i32,
    pub config: PolicyConfig,
}

/// Kind-grouped view of the applicable set. Lists preserve the engine's
/// (priority desc, updated_at desc) ordering.
#[derive(Debug, Clone, Default)]
pub struct PolicySet {
    by_kind: HashMap<PolicyKind, Vec<ActivePolicy>>,
}

impl PolicySet {
    pub fn of_kind(&self, kind: PolicyKind) -> &[ActivePolicy] {
        self.by_kind.get(&kind).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn is_empty(&self) -> bool {
        self.by_kind.values().all(Vec::is_empty)
    }

    pub fn len(&self) -> usize {
        self.by_kind.values().map(Vec::len).sum()
    }

    /// Highest-priority routing policy, if any.
    pub fn routing(&self) -> Option<(Uuid, &RoutingConfig)> {
        self.of_kind(PolicyKind::Routing).first().and_then(|p| match &p.config {
            PolicyConfig::Routing(cfg) => Some((p.id, cfg)),
            _ => None,
        })
    }

    pub fn pii_detection(&self) -> Option<(Uuid, &PiiDetectionConfig)> {
        self.of_kind(PolicyKind::PiiDetection).first().and_then(|p| match &p.config {
            PolicyConfig::PiiDetection(cfg) => Some((p.id, cfg)),
            _ => None,
        })
    }

    pub fn injection_guard(&self) -> Option<(Uuid, &InjectionGuardConfig)> {
        self.of_kind(PolicyKind::InjectionGuard).first().and_then(|p| match &p.config {
            PolicyConfig::InjectionGuard(cfg) => Some((p.id, cfg)),
            _ => None,
        })
    }

    pub fn retry(&self) -> Option<(Uuid, &RetryConfig)> {
        self.of_kind(PolicyKind::Retry).first().and_then(|p| match &p.config {
            PolicyConfig::Retry(cfg) => Some((p.id, cfg)),
            _ => None,
        })
    }

    pub fn fallback(&self) -> Option<(Uuid, &FallbackConfig)> {
        self.of_kind(PolicyKind::Fallback).first().and_then(|p| match &p.config {
            PolicyConfig::Fallback(cfg) => Some((p.id, cfg)),
            _ => None,
        })
    }

    /// Every policy id in the set, for audit attribution.
    pub fn all_ids(&self) -> Vec<Uuid> {
        let mut ids: Vec<Uuid> = self.by_kind.values().flatten().map(|p| p.id).collect();
        ids.sort();
        ids.dedup();
        ids
    }
}

pub struct PolicyEngine {
    store: Arc<dyn PolicyStore>,
}

impl PolicyEngine {
    pub fn new(store: Arc<dyn PolicyStore>) -> Self {
        Self { store }
    }

    /// Load and group the applicable policies for `(org, app, user)`.
    ///
    /// A policy whose config fails its per-kind parse is logged and skipped;
    /// the rest of the set survives.
    pub async fn load_applicable(
        &self,
        org: Uuid,
        app: Uuid,
        user: Option<Uuid>,
    ) -> anyhow::Result<PolicySet> {
        let rows = self.store.applicable_policies(org, app, user).await?;

        let mut set = PolicySet::default();
        for row in rows {
            let config = match row.parse_config() {
                Ok(config) => config,
                Err(e) => {
                    tracing::warn!(
                        policy_id = %row.id,
                        kind = row.kind.as_str(),
                        error = %e,
                        "skipping policy with malformed config"
                    );
                    continue;
                }
            };
            set.by_kind.entry(row.kind).or_default().push(ActivePolicy {
                id: row.id,
                app_id: row.app_id,
                user_id: row.user_id,
                priority: row.priority,
                config,
            });
        }
        Ok(set)
    }
}
