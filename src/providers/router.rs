//! Routing strategies over the provider registry.
//!
//! Every strategy filters by `is_available()` and honors an exclusion list
//! so the pipeline can drop providers it has already failed over from.

use dashmap::DashMap;
use rust_decimal::Decimal;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crate::errors::AppError;
use crate::models::chat::ChatRequest;
use crate::models::policy::RoutingStrategy;

use super::registry::ProviderRegistry;
use super::Provider;

/// EWMA of observed upstream latency per provider, fed by the pipeline
/// after every successful call. Drives the `fastest` strategy.
#[derive(Default)]
pub struct LatencyTracker {
    ewma_ms: DashMap<String, f64>,
}

const EWMA_ALPHA: f64 = 0.3;

impl LatencyTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&self, provider: &str, latency_ms: u64) {
        let mut entry = self.ewma_ms.entry(provider.to_string()).or_insert(latency_ms as f64);
        *entry = EWMA_ALPHA * latency_ms as f64 + (1.0 - EWMA_ALPHA) * *entry;
    }

    pub fn get(&self, provider: &str) -> Option<f64> {
        self.ewma_ms.get(provider).map(|v| *v)
    }
}

/// What the router needs to pick a provider for one request.
pub struct RouteQuery<'a> {
    pub strategy: RoutingStrategy,
    pub provider_override: Option<&'a str>,
    pub fallback_providers: &'a [String],
    /// Providers already tried (and failed) for this request.
    pub exclude: &'a [String],
}

pub struct ProviderRouter {
    registry: Arc<ProviderRegistry>,
    latency: LatencyTracker,
    round_robin: DashMap<String, Arc<AtomicU64>>,
}

impl ProviderRouter {
    pub fn new(registry: Arc<ProviderRegistry>) -> Self {
        Self {
            registry,
            latency: LatencyTracker::new(),
            round_robin: DashMap::new(),
        }
    }

    pub fn registry(&self) -> &ProviderRegistry {
        &self.registry
    }

    pub fn record_latency(&self, provider: &str, latency_ms: u64) {
        self.latency.record(provider, latency_ms);
    }

    /// Resolve a concrete provider for `req` under the given strategy.
    pub async fn route(
        &self,
        req: &ChatRequest,
        query: &RouteQuery<'_>,
    ) -> Result<Arc<dyn Provider>, AppError> {
        // A request-level override bypasses strategy selection entirely.
        if let Some(name) = query.provider_override {
            let provider = self
                .registry
                .get(name)
                .await
                .filter(|p| p.is_available() && p.validate_model(&req.model))
                .ok_or_else(|| {
                    AppError::ProviderUnavailable(format!(
                        "requested provider '{}' cannot serve model '{}'",
                        name, req.model
                    ))
                })?;
            return Ok(provider);
        }

        let candidates = self.capable(&req.model, query.exclude).await;
        if candidates.is_empty() {
            return Err(AppError::ProviderUnavailable(format!(
                "no available provider serves model '{}'",
                req.model
            )));
        }

        let chosen = match query.strategy {
            RoutingStrategy::ModelBased => candidates[0].clone(),
            RoutingStrategy::RoundRobin => {
                let counter = self
                    .round_robin
                    .entry(req.model.clone())
                    .or_insert_with(|| Arc::new(AtomicU64::new(0)))
                    .clone();
                let idx = counter.fetch_add(1, Ordering::Relaxed) as usize % candidates.len();
                candidates[idx].clone()
            }
            RoutingStrategy::LowestCost => {
                let mut best: Option<(Arc<dyn Provider>, Decimal)> = None;
                for candidate in &candidates {
                    let Some(cost) = candidate.estimate_cost(req) else {
                        continue;
                    };
                    if best.as_ref().map_or(true, |(_, c)| cost < *c) {
                        best = Some((candidate.clone(), cost));
                    }
                }
                best.map(|(p, _)| p).unwrap_or_else(|| candidates[0].clone())
            }
            RoutingStrategy::Fastest => {
                let mut best: Option<(Arc<dyn Provider>, f64)> = None;
                for candidate in &candidates {
                    let Some(ms) = self.latency.get(candidate.name()) else {
                        continue;
                    };
                    if best.as_ref().map_or(true, |(_, b)| ms < *b) {
                        best = Some((candidate.clone(), ms));
                    }
                }
                // Cold start: no latency data yet → model_based.
                best.map(|(p, _)| p).unwrap_or_else(|| candidates[0].clone())
            }
            RoutingStrategy::Failover => {
                // model_based first; once providers have been excluded by
                // earlier failures, prefer the configured fallbacks in order,
                // then any remaining capable provider.
                if query.exclude.is_empty() {
                    candidates[0].clone()
                } else {
                    query
                        .fallback_providers
                        .iter()
                        .find_map(|name| candidates.iter().find(|c| c.name() == name).cloned())
                        .unwrap_or_else(|| candidates[0].clone())
                }
            }
        };

        Ok(chosen)
    }

    async fn capable(&self, model: &str, exclude: &[String]) -> Vec<Arc<dyn Provider>> {
        self.registry
            .providers_for_model(model)
            .await
            .into_iter()
            .filter(|p| p.is_available())
            .filter(|p| !exclude.iter().any(|e| e == p.name()))
            .collect()
    }
}
