use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::{json, Value};
use thiserror::Error;

/// Error taxonomy for the inference pipeline and its HTTP surface.
///
/// Each variant carries a kind (mapped to an HTTP status), a human message,
/// and — where the caller can act on it — a structured `details` map
/// (e.g. `{limit, window, retry_after_ms}` for rate limits).
#[derive(Debug, Error)]
pub enum AppError {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("missing tenant context")]
    Unauthorized,

    #[error("forbidden: {reason}")]
    Forbidden { reason: String, details: Value },

    #[error("rate limit exceeded")]
    RateLimitExceeded { retry_after_ms: u64, details: Value },

    #[error("budget exceeded: {reason}")]
    BudgetExceeded { reason: String, details: Value },

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("provider unavailable: {0}")]
    ProviderUnavailable(String),

    #[error("request cancelled")]
    Cancelled,

    #[error("internal error: {0}")]
    Internal(#[from] anyhow::Error),
}

impl AppError {
    /// Whether the client may retry the same request later.
    pub fn retryable(&self) -> bool {
        matches!(
            self,
            AppError::RateLimitExceeded { .. } | AppError::ProviderUnavailable(_)
        )
    }

    /// Classification label stored on the audit record's `error_kind` column.
    pub fn audit_kind(&self) -> &'static str {
        match self {
            AppError::NotFound(_) => "NotFound",
            AppError::InvalidInput(_) => "InvalidInput",
            AppError::Unauthorized => "Unauthorized",
            AppError::Forbidden { .. } => "PolicyViolation",
            AppError::RateLimitExceeded { .. } => "RateLimit",
            AppError::BudgetExceeded { .. } => "Budget",
            AppError::Conflict(_) => "Conflict",
            AppError::ProviderUnavailable(_) => "ProviderUnavailable",
            AppError::Cancelled => "Cancelled",
            AppError::Internal(_) => "Internal",
        }
    }

    pub fn status(&self) -> StatusCode {
        match self {
            AppError::NotFound(_) => StatusCode::NOT_FOUND,
            AppError::InvalidInput(_) => StatusCode::BAD_REQUEST,
            AppError::Unauthorized => StatusCode::UNAUTHORIZED,
            AppError::Forbidden { .. } => StatusCode::FORBIDDEN,
            AppError::RateLimitExceeded { .. } => StatusCode::TOO_MANY_REQUESTS,
            AppError::BudgetExceeded { .. } => StatusCode::TOO_MANY_REQUESTS,
            AppError::Conflict(_) => StatusCode::CONFLICT,
            AppError::ProviderUnavailable(_) => StatusCode::BAD_GATEWAY,
            // 499 Client Closed Request (nginx convention)
            AppError::Cancelled => StatusCode::from_u16(499).unwrap(),
            AppError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Wire label in the response body's `error` field. Derived from the
    /// status, so rate-limit and budget rejections share `rate_limit_exceeded`
    /// and are disambiguated by `details`.
    pub fn wire_kind(&self) -> &'static str {
        match self {
            AppError::NotFound(_) => "not_found",
            AppError::InvalidInput(_) => "invalid_input",
            AppError::Unauthorized => "unauthorized",
            AppError::Forbidden { .. } => "forbidden",
            AppError::RateLimitExceeded { .. } | AppError::BudgetExceeded { .. } => {
                "rate_limit_exceeded"
            }
            AppError::Conflict(_) => "conflict",
            AppError::ProviderUnavailable(_) => "provider_unavailable",
            AppError::Cancelled => "cancelled",
            AppError::Internal(_) => "internal_error",
        }
    }

    /// Structured details for the response body, if any.
    pub fn details(&self) -> Option<Value> {
        match self {
            AppError::Forbidden { details, .. }
            | AppError::RateLimitExceeded { details, .. }
            | AppError::BudgetExceeded { details, .. } => Some(details.clone()),
            _ => None,
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = self.status();

        let msg = match &self {
            // Never leak the underlying cause of internal errors.
            AppError::Internal(e) => {
                tracing::error!("internal error: {:#}", e);
                "internal server error".to_string()
            }
            other => other.to_string(),
        };

        let mut body = json!({
            "error": self.wire_kind(),
            "message": msg,
        });
        if let Some(details) = self.details() {
            body["details"] = details;
        }

        let mut response = (status, Json(body)).into_response();

        if let AppError::RateLimitExceeded { retry_after_ms, .. } = &self {
            // Retry-After is whole seconds; round up so clients never retry early.
            let secs = retry_after_ms.div_ceil(1000).max(1);
            if let Ok(val) = axum::http::HeaderValue::from_str(&secs.to_string()) {
                response.headers_mut().insert("retry-after", val);
            }
        }

        response
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_mapping() {
        assert_eq!(AppError::NotFound("x".into()).status(), StatusCode::NOT_FOUND);
        assert_eq!(AppError::InvalidInput("x".into()).status(), StatusCode::BAD_REQUEST);
        assert_eq!(AppError::Unauthorized.status(), StatusCode::UNAUTHORIZED);
        assert_eq!(
            AppError::Forbidden { reason: "x".into(), details: json!({}) }.status(),
            StatusCode::FORBIDDEN
        );
        assert_eq!(
            AppError::RateLimitExceeded { retry_after_ms: 100, details: json!({}) }.status(),
            StatusCode::TOO_MANY_REQUESTS
        );
        assert_eq!(
            AppError::BudgetExceeded { reason: "x".into(), details: json!({}) }.status(),
            StatusCode::TOO_MANY_REQUESTS
        );
        assert_eq!(AppError::Cancelled.status().as_u16(), 499);
        assert_eq!(
            AppError::ProviderUnavailable("x".into()).status(),
            StatusCode::BAD_GATEWAY
        );
    }

    #[test]
    fn test_retryable_flags() {
        assert!(AppError::RateLimitExceeded { retry_after_ms: 1, details: json!({}) }.retryable());
        assert!(AppError::ProviderUnavailable("down".into()).retryable());
        // Budget rejections are terminal for the period — not retryable.
        assert!(!AppError::BudgetExceeded { reason: "cap".into(), details: json!({}) }.retryable());
        assert!(!AppError::Cancelled.retryable());
    }

    #[test]
    fn test_budget_shares_rate_limit_wire_kind() {
        let e = AppError::BudgetExceeded {
            reason: "daily cap".into(),
            details: json!({"violated_period": "daily"}),
        };
        assert_eq!(e.wire_kind(), "rate_limit_exceeded");
        assert_eq!(e.details().unwrap()["violated_period"], "daily");
    }

    #[test]
    fn test_forbidden_audit_kind_is_policy_violation() {
        let e = AppError::Forbidden { reason: "injection".into(), details: json!({}) };
        assert_eq!(e.audit_kind(), "PolicyViolation");
    }

    #[test]
    fn test_internal_message_does_not_leak() {
        let e = AppError::Internal(anyhow::anyhow!("password=hunter2"));
        let resp = e.into_response();
        assert_eq!(resp.status(), StatusCode::INTERNAL_SERVER_ERROR);
    }
}
