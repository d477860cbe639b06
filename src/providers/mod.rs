//! Provider abstraction: a polymorphic capability set over upstream LLM
//! APIs, plus the registry and routing strategies built on top of it.

pub mod openai;
pub mod registry;
pub mod router;

use async_trait::async_trait;
use rust_decimal::Decimal;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

use crate::models::chat::{ChatRequest, ChatResponse};

/// Static description of one servable model.
#[derive(Debug, Clone, PartialEq)]
pub struct ModelInfo {
    pub id: String,
    pub max_tokens: u32,
    pub context_window: u32,
    /// USD per prompt token.
    pub prompt_token_price: Decimal,
    /// USD per completion token.
    pub completion_token_price: Decimal,
    pub supports_chat: bool,
    pub supports_functions: bool,
    pub supports_vision: bool,
}

#[derive(Debug, Error)]
pub enum ProviderError {
    #[error("upstream returned {status}: {message}")]
    Upstream {
        status: u16,
        message: String,
        retryable: bool,
    },

    #[error("network error: {0}")]
    Network(String),

    #[error("model '{0}' is not served by this provider")]
    UnknownModel(String),

    #[error("invalid upstream response: {0}")]
    InvalidResponse(String),

    #[error("request cancelled")]
    Cancelled,
}

impl ProviderError {
    /// Retryable errors may be re-attempted on the same provider and count
    /// as fallback triggers at the pipeline level.
    pub fn retryable(&self) -> bool {
        match self {
            ProviderError::Upstream { retryable, .. } => *retryable,
            ProviderError::Network(_) => true,
            _ => false,
        }
    }
}

/// The capability set every upstream adapter implements.
#[async_trait]
pub trait Provider: Send + Sync + std::fmt::Debug {
    fn name(&self) -> &str;

    /// One unary chat completion. Adapters handle their own bounded retry
    /// schedule for transient upstream faults and must abort promptly when
    /// `cancel` fires.
    async fn chat_completion(
        &self,
        req: &ChatRequest,
        cancel: &CancellationToken,
    ) -> Result<ChatResponse, ProviderError>;

    fn is_available(&self) -> bool;

    fn validate_model(&self, model: &str) -> bool;

    fn get_model_info(&self, model: &str) -> Option<ModelInfo>;

    fn list_models(&self) -> Vec<ModelInfo>;

    /// Pre-call cost estimate: chars/4 prompt-token heuristic plus the
    /// requested (or default 500) completion allowance.
    fn estimate_cost(&self, req: &ChatRequest) -> Option<Decimal> {
        self.get_model_info(&req.model).map(|info| estimate_cost(&info, req))
    }
}

/// `(prompt_chars / 4) × prompt_price + (max_tokens or 500) × completion_price`.
pub fn estimate_cost(info: &ModelInfo, req: &ChatRequest) -> Decimal {
    let prompt_tokens = Decimal::from(req.prompt_chars() as u64 / 4);
    let completion_tokens = Decimal::from(req.max_tokens.unwrap_or(500));
    prompt_tokens * info.prompt_token_price + completion_tokens * info.completion_token_price
}

/// True cost from actual token usage.
pub fn final_cost(info: &ModelInfo, prompt_tokens: u32, completion_tokens: u32) -> Decimal {
    Decimal::from(prompt_tokens) * info.prompt_token_price
        + Decimal::from(completion_tokens) * info.completion_token_price
}
