//! OpenAI-compatible chat-completions client
//!
//! Speaks the `/chat/completions` wire format, so any compatible endpoint
//! (OpenAI, Azure-style proxies, local servers) can be targeted through
//! `base_url`.

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use super::{ChatMessage, ModelCallResult, ModelClient, ModelReply};
use crate::domain::TokenUsage;

/// Model endpoint configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ModelConfig {
    /// Model identifier sent with every request
    pub model: String,
    /// API root; `/chat/completions` is appended
    pub base_url: String,
    /// Bearer token. Never written back out.
    #[serde(skip_serializing)]
    pub api_key: Option<String>,
    pub max_tokens: u32,
    pub temperature: f32,
    /// Per-request timeout
    pub request_timeout_secs: u64,
}

impl Default for ModelConfig {
    fn default() -> Self {
        ModelConfig {
            model: "gpt-4o-mini".to_string(),
            base_url: "https://api.openai.com/v1".to_string(),
            api_key: None,
            max_tokens: 800,
            temperature: 0.1,
            request_timeout_secs: 60,
        }
    }
}

impl ModelConfig {
    /// Overlay `GRADER_MODEL`, `GRADER_MODEL_BASE_URL` and
    /// `GRADER_OPENAI_API_KEY` (falling back to `OPENAI_API_KEY`) onto `self`.
    pub fn merge_env(mut self) -> Self {
        if let Ok(model) = std::env::var("GRADER_MODEL") {
            self.model = model;
        }
        if let Ok(url) = std::env::var("GRADER_MODEL_BASE_URL") {
            self.base_url = url;
        }
        if let Some(key) = std::env::var("GRADER_OPENAI_API_KEY")
            .or_else(|_| std::env::var("OPENAI_API_KEY"))
            .ok()
        {
            self.api_key = Some(key);
        }
        self
    }

    /// Set authentication token
    pub fn with_api_key(mut self, key: &str) -> Self {
        self.api_key = Some(key.to_string());
        self
    }

    fn endpoint(&self) -> String {
        format!("{}/chat/completions", self.base_url.trim_end_matches('/'))
    }
}

/// Errors inside the HTTP client. Flattened to `ModelCallResult::Failure`
/// at the `ModelClient` boundary.
#[derive(Debug, thiserror::Error)]
pub enum ModelError {
    #[error("no API key configured (set GRADER_OPENAI_API_KEY or OPENAI_API_KEY)")]
    MissingApiKey,

    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("model API returned {status}: {body}")]
    Status { status: u16, body: String },
}

#[derive(Serialize)]
struct CompletionRequest<'a> {
    model: &'a str,
    messages: &'a [ChatMessage],
    max_tokens: u32,
    temperature: f32,
}

#[derive(Deserialize)]
struct CompletionResponse {
    #[serde(default)]
    choices: Vec<Choice>,
    #[serde(default)]
    usage: Option<Usage>,
}

#[derive(Deserialize)]
struct Choice {
    #[serde(default)]
    message: Option<ResponseMessage>,
}

#[derive(Deserialize)]
struct ResponseMessage {
    #[serde(default)]
    content: Option<String>,
}

#[derive(Deserialize)]
struct Usage {
    #[serde(default)]
    prompt_tokens: u64,
    #[serde(default)]
    completion_tokens: u64,
    #[serde(default)]
    total_tokens: u64,
}

/// First non-blank choice content, trimmed, with its token usage.
fn reply_from_response(response: CompletionResponse) -> Option<ModelReply> {
    let content = response
        .choices
        .into_iter()
        .filter_map(|c| c.message.and_then(|m| m.content))
        .map(|c| c.trim().to_string())
        .find(|c| !c.is_empty())?;
    let tokens = response
        .usage
        .map(|u| TokenUsage {
            input: u.prompt_tokens,
            output: u.completion_tokens,
            total: u.total_tokens.max(u.prompt_tokens + u.completion_tokens),
        })
        .unwrap_or_default();
    Some(ModelReply { content, tokens })
}

/// HTTP model client
pub struct OpenAiClient {
    config: ModelConfig,
    http_client: reqwest::Client,
}

impl OpenAiClient {
    /// Create a new client. Fails if no API key is configured.
    pub fn new(config: ModelConfig) -> Result<Self, ModelError> {
        if config.api_key.as_deref().map_or(true, str::is_empty) {
            return Err(ModelError::MissingApiKey);
        }
        let http_client = reqwest::Client::builder()
            .user_agent(concat!("rubric-grader/", env!("CARGO_PKG_VERSION")))
            .timeout(Duration::from_secs(config.request_timeout_secs))
            .build()?;
        Ok(OpenAiClient {
            config,
            http_client,
        })
    }

    pub fn config(&self) -> &ModelConfig {
        &self.config
    }

    async fn complete(&self, messages: &[ChatMessage]) -> Result<Option<ModelReply>, ModelError> {
        let body = CompletionRequest {
            model: &self.config.model,
            messages,
            max_tokens: self.config.max_tokens,
            temperature: self.config.temperature,
        };
        let response = self
            .http_client
            .post(self.config.endpoint())
            .bearer_auth(self.config.api_key.as_deref().unwrap_or_default())
            .json(&body)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(ModelError::Status {
                status: status.as_u16(),
                body,
            });
        }
        let parsed: CompletionResponse = response.json().await?;
        Ok(reply_from_response(parsed))
    }
}

#[async_trait]
impl ModelClient for OpenAiClient {
    async fn call(&self, messages: &[ChatMessage]) -> ModelCallResult {
        match self.complete(messages).await {
            Ok(Some(reply)) => {
                debug!(model = %self.config.model, tokens = reply.tokens.total, "model call succeeded");
                ModelCallResult::Success(reply)
            }
            Ok(None) => {
                warn!(model = %self.config.model, "model returned no content");
                ModelCallResult::Empty
            }
            Err(e) => {
                warn!(model = %self.config.model, error = %e, "model call failed");
                ModelCallResult::failure(e.to_string())
            }
        }
    }
}
