//! Chat-completion wire types and the provider-agnostic shapes the pipeline
//! passes around.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::errors::AppError;

// ── Inbound wire body (OpenAI-compatible) ─────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatCompletionBody {
    pub model: String,
    pub messages: Vec<Message>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub top_p: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stream: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stop: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user: Option<String>,
    /// Request-level provider override (bypasses the routing policy).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub provider: Option<String>,
}

impl ChatCompletionBody {
    /// Edge validation per the public contract. Parameter bounds are checked
    /// here so the pipeline only ever sees well-formed requests.
    pub fn validate(&self) -> Result<(), AppError> {
        if self.model.trim().is_empty() {
            return Err(AppError::InvalidInput("model is required".into()));
        }
        if self.messages.is_empty() {
            return Err(AppError::InvalidInput("messages must not be empty".into()));
        }
        if self.messages.iter().any(|m| m.content.is_empty()) {
            return Err(AppError::InvalidInput("message content must not be empty".into()));
        }
        if let Some(t) = self.temperature {
            if !(0.0..=2.0).contains(&t) {
                return Err(AppError::InvalidInput("temperature must be in [0, 2]".into()));
            }
        }
        if let Some(p) = self.top_p {
            if !(0.0..=1.0).contains(&p) {
                return Err(AppError::InvalidInput("top_p must be in [0, 1]".into()));
            }
        }
        if let Some(m) = self.max_tokens {
            if m == 0 {
                return Err(AppError::InvalidInput("max_tokens must be > 0".into()));
            }
        }
        if self.stream == Some(true) {
            return Err(AppError::InvalidInput("streaming is not supported".into()));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Message {
    pub role: Role,
    pub content: String,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

// ── Unified request (what the pipeline routes) ────────────────

#[derive(Debug, Clone)]
pub struct ChatRequest {
    pub model: String,
    pub provider_override: Option<String>,
    pub messages: Vec<Message>,
    pub temperature: Option<f32>,
    pub max_tokens: Option<u32>,
    pub top_p: Option<f32>,
    pub stop: Option<Vec<String>>,
}

impl ChatRequest {
    pub fn from_body(body: ChatCompletionBody) -> Self {
        Self {
            model: body.model,
            provider_override: body.provider,
            messages: body.messages,
            temperature: body.temperature,
            max_tokens: body.max_tokens,
            top_p: body.top_p,
            stop: body.stop,
        }
    }

    /// Total characters across all message contents, used by the cost
    /// estimator's chars/4 token heuristic.
    pub fn prompt_chars(&self) -> usize {
        self.messages.iter().map(|m| m.content.len()).sum()
    }

    /// Concatenated message text for prompt inspection.
    pub fn joined_text(&self) -> String {
        self.messages
            .iter()
            .map(|m| m.content.as_str())
            .collect::<Vec<_>>()
            .join("\n")
    }
}

// ── Unified response (provider-agnostic) ──────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FinishReason {
    Stop,
    Length,
    ContentFilter,
    FunctionCall,
}

impl FinishReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            FinishReason::Stop => "stop",
            FinishReason::Length => "length",
            FinishReason::ContentFilter => "content_filter",
            FinishReason::FunctionCall => "function_call",
        }
    }

    /// Lenient parse of upstream-reported finish reasons; unknown values
    /// collapse to `stop`.
    pub fn parse(s: &str) -> Self {
        match s {
            "length" => FinishReason::Length,
            "content_filter" => FinishReason::ContentFilter,
            "function_call" | "tool_calls" => FinishReason::FunctionCall,
            _ => FinishReason::Stop,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct Usage {
    pub prompt_tokens: u32,
    pub completion_tokens: u32,
    pub total_tokens: u32,
}

#[derive(Debug, Clone)]
pub struct ChatChoice {
    pub index: u32,
    pub message: Message,
    pub finish_reason: FinishReason,
}

/// The unified chat response shape every adapter normalizes into.
#[derive(Debug, Clone)]
pub struct ChatResponse {
    pub id: String,
    pub model: String,
    pub provider: String,
    pub choices: Vec<ChatChoice>,
    pub usage: Usage,
    pub latency_ms: u64,
    pub created: DateTime<Utc>,
}

impl ChatResponse {
    /// The assistant text of the first choice, if any.
    pub fn text(&self) -> Option<&str> {
        self.choices.first().map(|c| c.message.content.as_str())
    }
}

// ── Pipeline result ───────────────────────────────────────────

/// Terminal `Completed` output of one pipeline invocation.
#[derive(Debug, Clone)]
pub struct ChatOutcome {
    pub request_id: Uuid,
    pub provider: String,
    pub model: String,
    pub response_text: String,
    pub finish_reason: FinishReason,
    pub prompt_tokens: u32,
    pub completion_tokens: u32,
    pub latency_ms: u64,
    pub cost: Decimal,
    pub policies_applied: Vec<Uuid>,
}

// ── Outbound wire body (OpenAI-compatible) ────────────────────

#[derive(Debug, Serialize, Deserialize)]
pub struct ChatCompletionReply {
    pub id: String,
    pub object: String,
    pub created: i64,
    pub model: String,
    pub choices: Vec<ReplyChoice>,
    pub usage: Usage,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ReplyChoice {
    pub index: u32,
    pub message: Message,
    pub finish_reason: String,
}

impl ChatCompletionReply {
    pub fn from_outcome(outcome: &ChatOutcome) -> Self {
        Self {
            id: format!("chatcmpl-{}", outcome.request_id.simple()),
            object: "chat.completion".to_string(),
            created: Utc::now().timestamp(),
            model: outcome.model.clone(),
            choices: vec![ReplyChoice {
                index: 0,
                message: Message {
                    role: Role::Assistant,
                    content: outcome.response_text.clone(),
                },
                finish_reason: outcome.finish_reason.as_str().to_string(),
            }],
            usage: Usage {
                prompt_tokens: outcome.prompt_tokens,
                completion_tokens: outcome.completion_tokens,
                total_tokens: outcome.prompt_tokens + outcome.completion_tokens,
            },
        }
    }
}
