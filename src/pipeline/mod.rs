//! The inference pipeline: one request's walk from policy resolution through
//! upstream call, accounting and audit emission.
//!
//! ```text
//! Received → PoliciesLoaded → PromptValidated → Admitted
//!         → BudgetReserved → Routed → UpstreamCalled
//!         → ResponseValidated → Accounted → Completed
//! ```
//!
//! Any state can short-circuit to Rejected (a policy said no) or Failed
//! (provider or internal fault). Every terminal state emits exactly one
//! `InferenceRecord` before the result reaches the caller.

use chrono::Utc;
use rust_decimal::Decimal;
use serde_json::json;
use std::future::Future;
use std::sync::Arc;
use std::time::Instant;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::audit::AuditSink;
use crate::config::PipelineConfig;
use crate::context::TenantContext;
use crate::errors::AppError;
use crate::inspect::{Inspection, InspectionConfig, Inspector};
use crate::limits::budget::BudgetLedger;
use crate::limits::rate::RateLimiter;
use crate::models::audit::{InferenceRecord, RecordStatus};
use crate::models::chat::{ChatOutcome, ChatRequest, ChatResponse, FinishReason};
use crate::models::policy::{
    InspectionMode, PolicyConfig, PolicyKind, RetryConfig, RoutingStrategy,
};
use crate::policy::PolicyEngine;
use crate::providers::router::{ProviderRouter, RouteQuery};
use crate::providers::{final_cost, Provider, ProviderError};

pub struct Pipeline {
    policies: PolicyEngine,
    inspector: Inspector,
    rate: RateLimiter,
    budget: BudgetLedger,
    router: Arc<ProviderRouter>,
    audit: AuditSink,
    config: PipelineConfig,
}

impl Pipeline {
    pub fn new(
        policies: PolicyEngine,
        rate: RateLimiter,
        budget: BudgetLedger,
        router: Arc<ProviderRouter>,
        audit: AuditSink,
        config: PipelineConfig,
    ) -> Self {
        Self {
            policies,
            inspector: Inspector::new(),
            rate,
            budget,
            router,
            audit,
            config,
        }
    }

    /// Drive one chat completion end to end. The audit record is written
    /// before this returns, for every terminal state.
    #[tracing::instrument(skip_all, fields(request_id = %ctx.request_id, org_id = %ctx.org_id, model = %req.model))]
    pub async fn process_chat_completion(
        &self,
        ctx: TenantContext,
        mut req: ChatRequest,
        cancel: CancellationToken,
    ) -> Result<ChatOutcome, AppError> {
        let mut record = InferenceRecord::for_chat(&ctx, &req.model);

        let result = self.run(&ctx, &mut req, &cancel, &mut record).await;

        match &result {
            Ok(_) => {
                record.status = RecordStatus::Success;
            }
            Err(e) => {
                record.error_kind = Some(e.audit_kind().to_string());
                // A response-validation rejection after a billed upstream call
                // already marked itself FailedAfterBilling.
                if record.status != RecordStatus::FailedAfterBilling {
                    record.status = match e {
                        AppError::Forbidden { .. }
                        | AppError::RateLimitExceeded { .. }
                        | AppError::BudgetExceeded { .. } => RecordStatus::Rejected,
                        _ => RecordStatus::Failed,
                    };
                }
                if let Some(details) = e.details() {
                    record.detail("error_details", details);
                }
            }
        }

        self.audit.emit(&record).await;
        result
    }

    async fn run(
        &self,
        ctx: &TenantContext,
        req: &mut ChatRequest,
        cancel: &CancellationToken,
        record: &mut InferenceRecord,
    ) -> Result<ChatOutcome, AppError> {
        let started = Instant::now();
        let mut warnings: Vec<String> = Vec::new();

        // ── Received → PoliciesLoaded ─────────────────────────
        let set = cancellable(cancel, self.policies.load_applicable(ctx.org_id, ctx.app_id, ctx.user_id))
            .await?
            .map_err(AppError::Internal)?;
        record.detail("state", json!("policies_loaded"));
        tracing::debug!(policies = set.len(), "policies loaded");

        // ── PoliciesLoaded → PromptValidated ──────────────────
        let pii_policy = set.pii_detection();
        let guard_policy = set.injection_guard();
        if let Some((id, _)) = pii_policy {
            record.policies_applied.push(id);
        }
        if let Some((id, _)) = guard_policy {
            record.policies_applied.push(id);
        }
        let inspection_cfg = InspectionConfig::from_policies(
            pii_policy.map(|(_, cfg)| cfg),
            guard_policy.map(|(_, cfg)| cfg),
        );

        let mut pii_count = 0usize;
        for message in req.messages.iter_mut() {
            let inspection = self.inspector.validate(&message.content, &inspection_cfg);
            if !inspection.ok {
                record.detail("violations", json!(inspection.errors));
                return Err(reject_prompt(inspection));
            }
            pii_count += inspection.pii.len() + inspection.secrets.len();
            warnings.extend(inspection.warnings);
            if inspection_cfg.pii_mode == InspectionMode::Redact
                && inspection.redacted_text != message.content
            {
                message.content = inspection.redacted_text;
            }
        }
        if pii_count > 0 {
            record.detail("pii_detected", json!(pii_count));
        }
        // Warnings ride on the audit record even when a later stage rejects.
        if !warnings.is_empty() {
            record.detail("warnings", json!(warnings));
        }
        record.detail("state", json!("prompt_validated"));

        // ── PromptValidated → Admitted ────────────────────────
        let now = Utc::now();
        let mut admitted_keys: Vec<String> = Vec::new();
        for policy in set.of_kind(PolicyKind::RateLimit) {
            let PolicyConfig::RateLimit(cfg) = &policy.config else {
                continue;
            };
            let scope_key = ctx.scope_key_for(policy.app_id, policy.user_id);
            let decision = cancellable(cancel, self.rate.check(&scope_key, cfg, now))
                .await?
                .map_err(AppError::Internal)?;
            record.policies_applied.push(policy.id);
            if !decision.allowed {
                return Err(AppError::RateLimitExceeded {
                    retry_after_ms: decision.retry_after_ms,
                    details: json!({
                        "limit": decision.limit,
                        "window": decision.window_seconds,
                        "retry_after_ms": decision.retry_after_ms,
                    }),
                });
            }
            admitted_keys.push(scope_key);
        }
        // Committed only now that every rate policy admitted the request.
        self.rate
            .commit(&admitted_keys, now)
            .await
            .map_err(AppError::Internal)?;
        record.detail("state", json!("admitted"));

        // ── Admitted → BudgetReserved ─────────────────────────
        let estimated_cost = self.estimate_cost(req).await;
        let mut budget_keys: Vec<String> = Vec::new();
        for policy in set.of_kind(PolicyKind::Budget) {
            let PolicyConfig::Budget(cfg) = &policy.config else {
                continue;
            };
            let scope_key = ctx.scope_key_for(policy.app_id, policy.user_id);
            let decision = cancellable(
                cancel,
                self.budget.check_budget(&scope_key, cfg, estimated_cost, now),
            )
            .await?
            .map_err(AppError::Internal)?;
            record.policies_applied.push(policy.id);
            if !decision.allowed {
                let period = decision.violated_period.map(|p| p.as_str()).unwrap_or("daily");
                return Err(AppError::BudgetExceeded {
                    reason: decision.reason.unwrap_or_else(|| "budget cap exceeded".into()),
                    details: json!({
                        "violated_period": period,
                        "estimated_cost": estimated_cost,
                        "current_spend": {
                            "daily": decision.current_spend.daily,
                            "monthly": decision.current_spend.monthly,
                            "yearly": decision.current_spend.yearly,
                        },
                    }),
                });
            }
            if !budget_keys.contains(&scope_key) {
                budget_keys.push(scope_key);
            }
        }
        // No budget policy still leaves a spend trail for the tenant scope.
        if budget_keys.is_empty() {
            budget_keys.push(ctx.scope_key());
        }
        record.detail("state", json!("budget_reserved"));

        // ── BudgetReserved → Routed → UpstreamCalled ──────────
        let (strategy, mut fallback_providers) = match set.routing() {
            Some((id, cfg)) => {
                record.policies_applied.push(id);
                (cfg.strategy, cfg.fallback_providers.clone())
            }
            None => (RoutingStrategy::ModelBased, Vec::new()),
        };
        let fallback_policy = set.fallback();
        if let Some((_, cfg)) = &fallback_policy {
            for name in &cfg.providers {
                if !fallback_providers.contains(name) {
                    fallback_providers.push(name.clone());
                }
            }
        }
        let retry_cfg = match set.retry() {
            Some((id, cfg)) => {
                record.policies_applied.push(id);
                *cfg
            }
            None => RetryConfig::default(),
        };

        let response = self
            .call_upstream(
                req,
                cancel,
                record,
                strategy,
                &fallback_providers,
                fallback_policy.map(|(id, _)| id),
                &retry_cfg,
            )
            .await?;
        let provider_name = response.provider.clone();
        record.provider = Some(provider_name.clone());
        record.latency_ms = Some(response.latency_ms);
        record.detail("state", json!("upstream_called"));

        // ── UpstreamCalled → ResponseValidated ────────────────
        let usage = response.usage;
        let info = self
            .router
            .registry()
            .get(&provider_name)
            .await
            .and_then(|p| p.get_model_info(&req.model));
        let true_cost = info
            .as_ref()
            .map(|i| final_cost(i, usage.prompt_tokens, usage.completion_tokens))
            .unwrap_or(Decimal::ZERO);

        let (response_text, finish_reason) = match self
            .validate_response(&response, &inspection_cfg, &mut warnings, record)
        {
            Ok(validated) => validated,
            Err(e) => {
                // The upstream call was billed: account before failing.
                record.status = RecordStatus::FailedAfterBilling;
                record.prompt_tokens = Some(usage.prompt_tokens);
                record.completion_tokens = Some(usage.completion_tokens);
                record.cost = Some(true_cost);
                self.debit(&budget_keys, true_cost, &usage, &provider_name, req, ctx).await;
                return Err(e);
            }
        };
        record.detail("state", json!("response_validated"));

        // ── ResponseValidated → Accounted ─────────────────────
        self.debit(&budget_keys, true_cost, &usage, &provider_name, req, ctx).await;
        self.router.record_latency(&provider_name, response.latency_ms);
        record.prompt_tokens = Some(usage.prompt_tokens);
        record.completion_tokens = Some(usage.completion_tokens);
        record.cost = Some(true_cost);
        record.detail("state", json!("accounted"));

        // ── Accounted → Completed ─────────────────────────────
        if !warnings.is_empty() {
            record.detail("warnings", json!(warnings));
        }
        record.policies_applied.sort();
        record.policies_applied.dedup();
        record.detail("total_latency_ms", json!(started.elapsed().as_millis() as u64));
        record.detail("state", json!("completed"));

        Ok(ChatOutcome {
            request_id: ctx.request_id,
            provider: provider_name,
            model: response.model,
            response_text,
            finish_reason,
            prompt_tokens: usage.prompt_tokens,
            completion_tokens: usage.completion_tokens,
            latency_ms: response.latency_ms,
            cost: true_cost,
            policies_applied: record.policies_applied.clone(),
        })
    }

    /// Retry-then-fallback loop: exhaust the retry policy on the current
    /// provider, then ask the router for the next one, bounded by the total
    /// wall-clock budget.
    #[allow(clippy::too_many_arguments)]
    async fn call_upstream(
        &self,
        req: &ChatRequest,
        cancel: &CancellationToken,
        record: &mut InferenceRecord,
        strategy: RoutingStrategy,
        fallback_providers: &[String],
        fallback_policy_id: Option<Uuid>,
        retry_cfg: &RetryConfig,
    ) -> Result<ChatResponse, AppError> {
        let deadline = Instant::now() + self.config.total_budget();
        let mut tried: Vec<String> = Vec::new();
        let mut last_error: Option<AppError> = None;

        loop {
            if Instant::now() >= deadline {
                return Err(last_error.unwrap_or_else(|| {
                    AppError::ProviderUnavailable("upstream wall-clock budget exhausted".into())
                }));
            }

            let query = RouteQuery {
                strategy,
                provider_override: req.provider_override.as_deref(),
                fallback_providers,
                exclude: &tried,
            };
            let provider: Arc<dyn Provider> = match self.router.route(req, &query).await {
                Ok(p) => p,
                Err(e) => return Err(last_error.unwrap_or(e)),
            };

            if !tried.is_empty() {
                // Moving past the primary means a fallback policy took effect.
                if let Some(id) = fallback_policy_id {
                    record.policies_applied.push(id);
                }
                tracing::info!(provider = provider.name(), "failing over to fallback provider");
            }

            for attempt in 1..=retry_cfg.max_attempts {
                let delay = retry_cfg.delay_for_attempt(attempt);
                if !delay.is_zero() {
                    tokio::select! {
                        _ = tokio::time::sleep(delay) => {}
                        _ = cancel.cancelled() => return Err(AppError::Cancelled),
                    }
                }
                if Instant::now() >= deadline {
                    break;
                }

                match provider.chat_completion(req, cancel).await {
                    Ok(response) => return Ok(response),
                    Err(ProviderError::Cancelled) => return Err(AppError::Cancelled),
                    Err(e) if e.retryable() => {
                        tracing::warn!(
                            provider = provider.name(),
                            attempt,
                            error = %e,
                            "retryable upstream failure"
                        );
                        last_error = Some(AppError::ProviderUnavailable(e.to_string()));
                    }
                    Err(e) => {
                        return Err(AppError::ProviderUnavailable(e.to_string()));
                    }
                }
            }

            // Retries exhausted on this provider; move to the next fallback.
            tried.push(provider.name().to_string());

            // Nothing to fall back to: a pinned provider, or a non-failover
            // strategy with no fallback policy configured.
            let can_fall_back = req.provider_override.is_none()
                && (strategy == RoutingStrategy::Failover || !fallback_providers.is_empty());
            if !can_fall_back {
                return Err(last_error.unwrap_or_else(|| {
                    AppError::ProviderUnavailable("provider exhausted retries".into())
                }));
            }
        }
    }

    /// Re-run inspection against the response text for PII/secret leakage.
    fn validate_response(
        &self,
        response: &ChatResponse,
        cfg: &InspectionConfig,
        warnings: &mut Vec<String>,
        record: &mut InferenceRecord,
    ) -> Result<(String, FinishReason), AppError> {
        let text = response.text().unwrap_or_default().to_string();
        let finish_reason = response
            .choices
            .first()
            .map(|c| c.finish_reason)
            .unwrap_or(FinishReason::Stop);

        if !cfg.pii_enabled {
            return Ok((text, finish_reason));
        }

        // Injection scoring is a prompt-side concern; the response pass only
        // looks for leakage.
        let mut response_cfg = cfg.clone();
        response_cfg.injection_enabled = false;

        let inspection = self.inspector.validate(&text, &response_cfg);
        if !inspection.ok {
            record.detail("violations", json!(inspection.errors));
            return Err(AppError::Forbidden {
                reason: "response contained sensitive data".into(),
                details: json!({"violations": inspection.errors}),
            });
        }
        for w in &inspection.warnings {
            warnings.push(format!("response: {}", w));
        }

        let text = if response_cfg.pii_mode == InspectionMode::Redact {
            inspection.redacted_text
        } else {
            text
        };
        Ok((text, finish_reason))
    }

    /// Pre-routing estimate uses the `model_based` provider's prices; with
    /// no capable provider the estimate is zero and routing fails one step
    /// later.
    async fn estimate_cost(&self, req: &ChatRequest) -> Decimal {
        let capable = self.router.registry().providers_for_model(&req.model).await;
        capable
            .iter()
            .find(|p| p.is_available())
            .and_then(|p| p.estimate_cost(req))
            .unwrap_or(Decimal::ZERO)
    }

    /// Debit every budget scope. Deliberately not cancellation-gated: once
    /// an upstream call was billed the ledger must move.
    async fn debit(
        &self,
        budget_keys: &[String],
        true_cost: Decimal,
        usage: &crate::models::chat::Usage,
        provider: &str,
        req: &ChatRequest,
        ctx: &TenantContext,
    ) {
        let now = Utc::now();
        for key in budget_keys {
            if let Err(e) = self
                .budget
                .record_cost(
                    key,
                    true_cost,
                    usage.total_tokens,
                    provider,
                    &req.model,
                    ctx.request_id,
                    now,
                )
                .await
            {
                tracing::error!(scope_key = %key, error = %e, "budget debit failed");
            }
        }
    }
}

/// Race a pipeline I/O step against request cancellation.
async fn cancellable<T>(
    cancel: &CancellationToken,
    fut: impl Future<Output = T>,
) -> Result<T, AppError> {
    tokio::select! {
        result = fut => Ok(result),
        _ = cancel.cancelled() => Err(AppError::Cancelled),
    }
}

fn reject_prompt(inspection: Inspection) -> AppError {
    AppError::Forbidden {
        reason: inspection
            .errors
            .first()
            .cloned()
            .unwrap_or_else(|| "prompt rejected by policy".into()),
        details: json!({"violations": inspection.errors}),
    }
}
