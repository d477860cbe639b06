//! OpenAI-compatible chat-completions adapter — the reference provider
//! implementation. Anything speaking the same wire schema (Azure OpenAI,
//! vLLM, LiteLLM, …) can be registered under another name with its own
//! base URL and catalog.

use async_trait::async_trait;
use chrono::Utc;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::str::FromStr;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;

use crate::config::OpenAiConfig;
use crate::models::chat::{ChatChoice, ChatRequest, ChatResponse, FinishReason, Message, Role, Usage};

use super::{ModelInfo, Provider, ProviderError};

#[derive(Debug)]
pub struct OpenAiProvider {
    name: String,
    client: reqwest::Client,
    base_url: String,
    api_key: String,
    organization: Option<String>,
    max_retries: u32,
    retry_delay: Duration,
    models: Vec<ModelInfo>,
}

impl OpenAiProvider {
    pub fn new(cfg: &OpenAiConfig) -> Self {
        Self::named("openai", cfg)
    }

    /// Build an adapter under a custom registry name (e.g. a second
    /// OpenAI-compatible endpoint used as a failover target).
    pub fn named(name: &str, cfg: &OpenAiConfig) -> Self {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(cfg.timeout_secs))
            .build()
            .unwrap_or_default();
        Self {
            name: name.to_string(),
            client,
            base_url: cfg.base_url.trim_end_matches('/').to_string(),
            api_key: cfg.api_key.clone(),
            organization: cfg.organization.clone(),
            max_retries: cfg.max_retries,
            retry_delay: Duration::from_millis(500),
            models: default_catalog(),
        }
    }

    /// Replace the model catalog (tests, custom deployments).
    pub fn with_models(mut self, models: Vec<ModelInfo>) -> Self {
        self.models = models;
        self
    }

    fn completions_url(&self) -> String {
        format!("{}/chat/completions", self.base_url)
    }

    async fn attempt(&self, body: &WireRequest<'_>) -> Result<ChatResponse, ProviderError> {
        let started = Instant::now();

        let mut request = self
            .client
            .post(self.completions_url())
            .bearer_auth(&self.api_key)
            .json(body);
        if let Some(org) = &self.organization {
            request = request.header("OpenAI-Organization", org);
        }

        let response = request
            .send()
            .await
            .map_err(|e| ProviderError::Network(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let retryable = status.as_u16() == 429 || status.is_server_error();
            let message = response
                .text()
                .await
                .ok()
                .and_then(|raw| extract_error_message(&raw))
                .unwrap_or_else(|| status.to_string());
            return Err(ProviderError::Upstream {
                status: status.as_u16(),
                message,
                retryable,
            });
        }

        let wire: WireResponse = response
            .json()
            .await
            .map_err(|e| ProviderError::InvalidResponse(e.to_string()))?;

        let choices = wire
            .choices
            .into_iter()
            .map(|c| ChatChoice {
                index: c.index,
                message: Message {
                    role: Role::Assistant,
                    content: c.message.content.unwrap_or_default(),
                },
                finish_reason: FinishReason::parse(c.finish_reason.as_deref().unwrap_or("stop")),
            })
            .collect::<Vec<_>>();

        if choices.is_empty() {
            return Err(ProviderError::InvalidResponse("no choices in response".into()));
        }

        Ok(ChatResponse {
            id: wire.id,
            model: wire.model,
            provider: self.name.clone(),
            choices,
            usage: Usage {
                prompt_tokens: wire.usage.prompt_tokens,
                completion_tokens: wire.usage.completion_tokens,
                total_tokens: wire.usage.total_tokens,
            },
            latency_ms: started.elapsed().as_millis() as u64,
            created: Utc::now(),
        })
    }
}

#[async_trait]
impl Provider for OpenAiProvider {
    fn name(&self) -> &str {
        &self.name
    }

    #[tracing::instrument(skip(self, req, cancel), fields(provider = %self.name, model = %req.model))]
    async fn chat_completion(
        &self,
        req: &ChatRequest,
        cancel: &CancellationToken,
    ) -> Result<ChatResponse, ProviderError> {
        if !self.validate_model(&req.model) {
            return Err(ProviderError::UnknownModel(req.model.clone()));
        }

        let body = WireRequest::from_chat(req);
        let mut attempt: u32 = 0;

        loop {
            attempt += 1;

            let result = tokio::select! {
                r = self.attempt(&body) => r,
                _ = cancel.cancelled() => return Err(ProviderError::Cancelled),
            };

            match result {
                Ok(response) => return Ok(response),
                Err(e) if e.retryable() && attempt <= self.max_retries => {
                    // Linear schedule: delay × attempt.
                    let wait = self.retry_delay * attempt;
                    tracing::warn!(
                        attempt,
                        max_retries = self.max_retries,
                        error = %e,
                        "upstream attempt failed, retrying in {:?}",
                        wait
                    );
                    tokio::select! {
                        _ = tokio::time::sleep(wait) => {}
                        _ = cancel.cancelled() => return Err(ProviderError::Cancelled),
                    }
                }
                Err(e) => return Err(e),
            }
        }
    }

    fn is_available(&self) -> bool {
        !self.api_key.is_empty()
    }

    fn validate_model(&self, model: &str) -> bool {
        self.models.iter().any(|m| m.id == model)
    }

    fn get_model_info(&self, model: &str) -> Option<ModelInfo> {
        self.models.iter().find(|m| m.id == model).cloned()
    }

    fn list_models(&self) -> Vec<ModelInfo> {
        self.models.clone()
    }
}

// ── Wire schema ──────────────────────────────────────────────

#[derive(Serialize)]
struct WireRequest<'a> {
    model: &'a str,
    messages: &'a [Message],
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_tokens: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    top_p: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    stop: Option<&'a [String]>,
    stream: bool,
}

impl<'a> WireRequest<'a> {
    fn from_chat(req: &'a ChatRequest) -> Self {
        Self {
            model: &req.model,
            messages: &req.messages,
            temperature: req.temperature,
            max_tokens: req.max_tokens,
            top_p: req.top_p,
            stop: req.stop.as_deref(),
            stream: false,
        }
    }
}

#[derive(Deserialize)]
struct WireResponse {
    id: String,
    model: String,
    choices: Vec<WireChoice>,
    #[serde(default)]
    usage: WireUsage,
}

#[derive(Deserialize)]
struct WireChoice {
    #[serde(default)]
    index: u32,
    message: WireMessage,
    finish_reason: Option<String>,
}

#[derive(Deserialize)]
struct WireMessage {
    content: Option<String>,
}

#[derive(Deserialize, Default)]
struct WireUsage {
    #[serde(default)]
    prompt_tokens: u32,
    #[serde(default)]
    completion_tokens: u32,
    #[serde(default)]
    total_tokens: u32,
}

fn extract_error_message(raw: &str) -> Option<String> {
    let v: serde_json::Value = serde_json::from_str(raw).ok()?;
    v.get("error")?
        .get("message")?
        .as_str()
        .map(|s| s.to_string())
}

/// Default catalog with prices per token (sourced per 1M and divided down).
fn default_catalog() -> Vec<ModelInfo> {
    let per_m = |s: &str| Decimal::from_str(s).unwrap() / Decimal::from(1_000_000);
    let chat = |id: &str, max_tokens: u32, context: u32, input: &str, output: &str| ModelInfo {
        id: id.to_string(),
        max_tokens,
        context_window: context,
        prompt_token_price: per_m(input),
        completion_token_price: per_m(output),
        supports_chat: true,
        supports_functions: true,
        supports_vision: false,
    };

    vec![
        chat("gpt-4", 8192, 8192, "30.00", "60.00"),
        chat("gpt-4-turbo", 4096, 128_000, "10.00", "30.00"),
        ModelInfo { supports_vision: true, ..chat("gpt-4o", 16_384, 128_000, "2.50", "10.00") },
        ModelInfo { supports_vision: true, ..chat("gpt-4o-mini", 16_384, 128_000, "0.15", "0.60") },
        chat("gpt-3.5-turbo", 4096, 16_385, "0.50", "1.50"),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::chat::{Message, Role};
    use wiremock::matchers::{body_partial_json, header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn config(base_url: &str) -> OpenAiConfig {
        OpenAiConfig {
            api_key: "sk-test".into(),
            base_url: base_url.into(),
            timeout_secs: 5,
            max_retries: 2,
            organization: None,
        }
    }

    fn request(model: &str) -> ChatRequest {
        ChatRequest {
            model: model.into(),
            provider_override: None,
            messages: vec![Message { role: Role::User, content: "Hi".into() }],
            temperature: None,
            max_tokens: None,
            top_p: None,
            stop: None,
        }
    }

    fn ok_body() -> serde_json::Value {
        serde_json::json!({
            "id": "chatcmpl-123",
            "object": "chat.completion",
            "created": 1700000000,
            "model": "gpt-4",
            "choices": [{
                "index": 0,
                "message": {"role": "assistant", "content": "Hello!"},
                "finish_reason": "stop"
            }],
            "usage": {"prompt_tokens": 5, "completion_tokens": 3, "total_tokens": 8}
        })
    }

    #[tokio::test]
    async fn test_successful_completion_parses_unified_response() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/chat/completions"))
            .and(header("authorization", "Bearer sk-test"))
            .and(body_partial_json(serde_json::json!({"model": "gpt-4", "stream": false})))
            .respond_with(ResponseTemplate::new(200).set_body_json(ok_body()))
            .mount(&server)
            .await;

        let provider = OpenAiProvider::new(&config(&format!("{}/v1", server.uri())));
        let cancel = CancellationToken::new();
        let response = provider.chat_completion(&request("gpt-4"), &cancel).await.unwrap();

        assert_eq!(response.provider, "openai");
        assert_eq!(response.text(), Some("Hello!"));
        assert_eq!(response.usage.prompt_tokens, 5);
        assert_eq!(response.usage.completion_tokens, 3);
        assert_eq!(response.choices[0].finish_reason, FinishReason::Stop);
    }

    #[tokio::test]
    async fn test_retries_on_503_then_succeeds() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/chat/completions"))
            .respond_with(ResponseTemplate::new(503))
            .up_to_n_times(1)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/v1/chat/completions"))
            .respond_with(ResponseTemplate::new(200).set_body_json(ok_body()))
            .mount(&server)
            .await;

        let mut provider = OpenAiProvider::new(&config(&format!("{}/v1", server.uri())));
        provider.retry_delay = Duration::from_millis(10);
        let cancel = CancellationToken::new();
        let response = provider.chat_completion(&request("gpt-4"), &cancel).await.unwrap();
        assert_eq!(response.text(), Some("Hello!"));
    }

    #[tokio::test]
    async fn test_400_is_not_retried() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/chat/completions"))
            .respond_with(ResponseTemplate::new(400).set_body_json(serde_json::json!({
                "error": {"message": "bad request", "type": "invalid_request_error"}
            })))
            .expect(1)
            .mount(&server)
            .await;

        let provider = OpenAiProvider::new(&config(&format!("{}/v1", server.uri())));
        let cancel = CancellationToken::new();
        let err = provider.chat_completion(&request("gpt-4"), &cancel).await.unwrap_err();
        match err {
            ProviderError::Upstream { status, message, retryable } => {
                assert_eq!(status, 400);
                assert_eq!(message, "bad request");
                assert!(!retryable);
            }
            other => panic!("unexpected error: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_retries_exhaust_on_persistent_429() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/chat/completions"))
            .respond_with(ResponseTemplate::new(429))
            .expect(3) // 1 original + 2 retries
            .mount(&server)
            .await;

        let mut provider = OpenAiProvider::new(&config(&format!("{}/v1", server.uri())));
        provider.retry_delay = Duration::from_millis(5);
        let cancel = CancellationToken::new();
        let err = provider.chat_completion(&request("gpt-4"), &cancel).await.unwrap_err();
        assert!(err.retryable());
    }

    #[tokio::test]
    async fn test_unknown_model_fails_fast() {
        let provider = OpenAiProvider::new(&config("http://127.0.0.1:1/v1"));
        let cancel = CancellationToken::new();
        let err = provider
            .chat_completion(&request("claude-3-opus"), &cancel)
            .await
            .unwrap_err();
        assert!(matches!(err, ProviderError::UnknownModel(_)));
    }

    #[tokio::test]
    async fn test_cancellation_aborts_call() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/chat/completions"))
            .respond_with(ResponseTemplate::new(200).set_body_json(ok_body()).set_delay(Duration::from_secs(5)))
            .mount(&server)
            .await;

        let provider = OpenAiProvider::new(&config(&format!("{}/v1", server.uri())));
        let cancel = CancellationToken::new();
        let cancel_clone = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            cancel_clone.cancel();
        });
        let err = provider.chat_completion(&request("gpt-4"), &cancel).await.unwrap_err();
        assert!(matches!(err, ProviderError::Cancelled));
    }

    #[test]
    fn test_availability_requires_api_key() {
        let mut cfg = config("https://api.openai.com/v1");
        let provider = OpenAiProvider::new(&cfg);
        assert!(provider.is_available());

        cfg.api_key = String::new();
        let unconfigured = OpenAiProvider::new(&cfg);
        assert!(!unconfigured.is_available());
    }

    #[test]
    fn test_catalog_lookup_and_estimate() {
        let provider = OpenAiProvider::new(&config("https://api.openai.com/v1"));
        assert!(provider.validate_model("gpt-4"));
        assert!(!provider.validate_model("gemini-pro"));

        let info = provider.get_model_info("gpt-4").unwrap();
        // $30 per 1M prompt tokens.
        assert_eq!(info.prompt_token_price * Decimal::from(1_000_000), Decimal::from(30));

        let mut req = request("gpt-4");
        req.max_tokens = Some(10_000);
        // Estimate dominated by 10k completion tokens at $60/1M = $0.60.
        let estimate = provider.estimate_cost(&req).unwrap();
        assert!(estimate > Decimal::from_str("0.59").unwrap());
    }
}
