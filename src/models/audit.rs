//! The audit entity: one `InferenceRecord` per pipeline invocation,
//! including rejections and failures.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::context::TenantContext;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InferenceRecord {
    pub id: Uuid,
    pub org_id: Uuid,
    pub app_id: Uuid,
    pub user_id: Option<Uuid>,
    pub request_id: Uuid,
    pub action: String,
    pub provider: Option<String>,
    pub model: Option<String>,
    pub prompt_tokens: Option<u32>,
    pub completion_tokens: Option<u32>,
    pub cost: Option<Decimal>,
    pub latency_ms: Option<u64>,
    pub status: RecordStatus,
    pub error_kind: Option<String>,
    pub policies_applied: Vec<Uuid>,
    pub ip: Option<String>,
    pub user_agent: Option<String>,
    pub timestamp: DateTime<Utc>,
    /// Free-form context: pipeline warnings, rejection details, final state.
    pub details: serde_json::Value,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecordStatus {
    Success,
    Rejected,
    Failed,
    /// The upstream call was billed but the pipeline failed afterwards
    /// (e.g. response validation rejected the completion).
    FailedAfterBilling,
}

impl RecordStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RecordStatus::Success => "success",
            RecordStatus::Rejected => "rejected",
            RecordStatus::Failed => "failed",
            RecordStatus::FailedAfterBilling => "failed_after_billing",
        }
    }
}

impl InferenceRecord {
    /// Base record for a chat-completion invocation; the pipeline fills in
    /// the terminal fields before emitting.
    pub fn for_chat(ctx: &TenantContext, model: &str) -> Self {
        Self {
            id: Uuid::new_v4(),
            org_id: ctx.org_id,
            app_id: ctx.app_id,
            user_id: ctx.user_id,
            request_id: ctx.request_id,
            action: "chat.completion".to_string(),
            provider: None,
            model: Some(model.to_string()),
            prompt_tokens: None,
            completion_tokens: None,
            cost: None,
            latency_ms: None,
            status: RecordStatus::Failed,
            error_kind: None,
            policies_applied: Vec::new(),
            ip: ctx.ip.clone(),
            user_agent: ctx.user_agent.clone(),
            timestamp: Utc::now(),
            details: serde_json::Value::Object(Default::default()),
        }
    }

    pub fn detail(&mut self, key: &str, value: serde_json::Value) {
        if let Some(map) = self.details.as_object_mut() {
            map.insert(key.to_string(), value);
        }
    }
}
