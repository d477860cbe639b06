//! Inbound HTTP surface: the OpenAI-compatible chat-completions endpoint.
//!
//! Authentication is the front door's job. By the time a request reaches
//! this router the external auth layer has resolved the caller's tenant and
//! forwarded it in identity headers, which `tenant_middleware` materializes
//! into a request-scoped `TenantContext`.

use std::sync::Arc;

use axum::extract::State;
use axum::http::HeaderMap;
use axum::middleware::Next;
use axum::response::Response;
use axum::routing::post;
use axum::{Extension, Json, Router};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::context::TenantContext;
use crate::errors::AppError;
use crate::models::chat::{ChatCompletionBody, ChatCompletionReply, ChatRequest};
use crate::pipeline::Pipeline;

pub struct AppState {
    pub pipeline: Pipeline,
}

pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/v1/chat/completions", post(chat_completions))
        .layer(axum::middleware::from_fn(tenant_middleware))
        .with_state(state)
}

/// Resolve the tenant context from the identity headers set by the auth
/// front door. Requests without a resolvable tenant never reach the
/// pipeline.
pub async fn tenant_middleware(
    mut request: axum::extract::Request,
    next: Next,
) -> Result<Response, AppError> {
    let ctx = tenant_from_headers(request.headers())?;
    request.extensions_mut().insert(ctx);
    Ok(next.run(request).await)
}

fn tenant_from_headers(headers: &HeaderMap) -> Result<TenantContext, AppError> {
    let parse_uuid = |name: &str| -> Result<Option<Uuid>, AppError> {
        match headers.get(name).map(|v| v.to_str()) {
            None => Ok(None),
            Some(Ok(raw)) => raw
                .parse()
                .map(Some)
                .map_err(|_| AppError::Unauthorized),
            Some(Err(_)) => Err(AppError::Unauthorized),
        }
    };

    let org_id = parse_uuid("x-org-id")?.ok_or(AppError::Unauthorized)?;
    let app_id = parse_uuid("x-app-id")?.ok_or(AppError::Unauthorized)?;
    let user_id = parse_uuid("x-user-id")?;

    let mut ctx = TenantContext::new(org_id, app_id, user_id);
    ctx.ip = headers
        .get("x-forwarded-for")
        .or_else(|| headers.get("x-real-ip"))
        .and_then(|v| v.to_str().ok())
        .map(|s| s.split(',').next().unwrap_or(s).trim().to_string());
    ctx.user_agent = headers
        .get("user-agent")
        .and_then(|v| v.to_str().ok())
        .map(String::from);
    Ok(ctx)
}

async fn chat_completions(
    State(state): State<Arc<AppState>>,
    Extension(ctx): Extension<TenantContext>,
    Json(body): Json<ChatCompletionBody>,
) -> Result<Response, AppError> {
    body.validate()?;
    let request_id = ctx.request_id;
    let req = ChatRequest::from_body(body);

    // Run the pipeline on its own task so a client disconnect (this handler
    // future being dropped) cancels in-flight I/O while still letting the
    // pipeline reach its terminal audit write.
    let cancel = CancellationToken::new();
    let task_cancel = cancel.clone();
    let _guard = cancel.drop_guard();
    let task = tokio::spawn(async move {
        state.pipeline.process_chat_completion(ctx, req, task_cancel).await
    });

    let outcome = task
        .await
        .map_err(|e| AppError::Internal(anyhow::anyhow!("pipeline task failed: {}", e)))??;

    let reply = ChatCompletionReply::from_outcome(&outcome);
    let mut response = axum::response::IntoResponse::into_response(Json(reply));
    if let Ok(value) = axum::http::HeaderValue::from_str(&request_id.to_string()) {
        response.headers_mut().insert("x-request-id", value);
    }
    Ok(response)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audit::AuditSink;
    use crate::config::PipelineConfig;
    use crate::limits::budget::BudgetLedger;
    use crate::limits::rate::RateLimiter;
    use crate::policy::PolicyEngine;
    use crate::providers::registry::ProviderRegistry;
    use crate::providers::router::ProviderRouter;
    use crate::store::memory::MemoryStore;
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use tower::ServiceExt;

    fn test_router() -> Router {
        let store = Arc::new(MemoryStore::new());
        let registry = Arc::new(ProviderRegistry::new());
        let pipeline = Pipeline::new(
            PolicyEngine::new(store.clone()),
            RateLimiter::new(store.clone()),
            BudgetLedger::new(store.clone()),
            Arc::new(ProviderRouter::new(registry)),
            AuditSink::new(store),
            PipelineConfig { request_timeout_secs: 5, total_budget_secs: 5 },
        );
        router(Arc::new(AppState { pipeline }))
    }

    fn chat_body() -> String {
        serde_json::json!({
            "model": "gpt-4",
            "messages": [{"role": "user", "content": "Hi"}]
        })
        .to_string()
    }

    #[tokio::test]
    async fn test_missing_tenant_headers_is_unauthorized() {
        let response = test_router()
            .oneshot(
                Request::post("/v1/chat/completions")
                    .header("content-type", "application/json")
                    .body(Body::from(chat_body()))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn test_malformed_tenant_header_is_unauthorized() {
        let response = test_router()
            .oneshot(
                Request::post("/v1/chat/completions")
                    .header("content-type", "application/json")
                    .header("x-org-id", "not-a-uuid")
                    .header("x-app-id", Uuid::new_v4().to_string())
                    .body(Body::from(chat_body()))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn test_invalid_params_rejected() {
        let body = serde_json::json!({
            "model": "gpt-4",
            "messages": [{"role": "user", "content": "Hi"}],
            "temperature": 9.0
        })
        .to_string();
        let response = test_router()
            .oneshot(
                Request::post("/v1/chat/completions")
                    .header("content-type", "application/json")
                    .header("x-org-id", Uuid::new_v4().to_string())
                    .header("x-app-id", Uuid::new_v4().to_string())
                    .body(Body::from(body))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_no_provider_maps_to_bad_gateway() {
        let response = test_router()
            .oneshot(
                Request::post("/v1/chat/completions")
                    .header("content-type", "application/json")
                    .header("x-org-id", Uuid::new_v4().to_string())
                    .header("x-app-id", Uuid::new_v4().to_string())
                    .body(Body::from(chat_body()))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_GATEWAY);
    }
}
