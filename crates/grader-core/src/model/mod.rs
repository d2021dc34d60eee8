//! Model-call boundary.
//!
//! The external model is unreliable by contract: it may answer, answer with
//! nothing, or fail. [`ModelCallResult`] makes each case explicit and every
//! consumer matches on it exhaustively.

pub mod openai;

use std::convert::Infallible;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::cache::{CacheLayer, Cached};
use crate::domain::TokenUsage;

pub use openai::{ModelConfig, ModelError, OpenAiClient};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: Role,
    pub content: String,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: Role::System,
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
        }
    }
}

/// Text the model-call cache keys on: the last user message, or every
/// message's content when there is no user turn.
pub fn prompt_content(messages: &[ChatMessage]) -> String {
    match messages.iter().rev().find(|m| m.role == Role::User) {
        Some(m) => m.content.clone(),
        None => messages
            .iter()
            .map(|m| m.content.as_str())
            .collect::<Vec<_>>()
            .join("\n"),
    }
}

/// A non-empty model answer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelReply {
    pub content: String,
    pub tokens: TokenUsage,
}

/// Outcome of one model call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ModelCallResult {
    Success(ModelReply),
    /// The call completed but produced no content.
    Empty,
    Failure { reason: String },
}

impl ModelCallResult {
    pub fn failure(reason: impl Into<String>) -> Self {
        ModelCallResult::Failure {
            reason: reason.into(),
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, ModelCallResult::Success(_))
    }
}

/// Anything that can answer a chat prompt.
///
/// Implementations never return `Err`; transport and API errors become
/// [`ModelCallResult::Failure`].
#[async_trait]
pub trait ModelClient: Send + Sync {
    async fn call(&self, messages: &[ChatMessage]) -> ModelCallResult;
}

/// Model client routed through the model-call cache site.
///
/// Only successful replies are stored, so a transient failure is retried
/// on the next identical prompt.
#[derive(Clone)]
pub struct CachedModelClient {
    inner: Arc<dyn ModelClient>,
    cache: CacheLayer,
}

impl CachedModelClient {
    pub fn new(inner: Arc<dyn ModelClient>, cache: CacheLayer) -> Self {
        Self { inner, cache }
    }

    pub fn cache(&self) -> &CacheLayer {
        &self.cache
    }

    pub async fn call(&self, messages: &[ChatMessage]) -> Cached<ModelCallResult> {
        let prompt = prompt_content(messages);
        let inner = Arc::clone(&self.inner);
        let outcome = self
            .cache
            .with_prompt_cache(
                "chat_completion",
                &prompt,
                || async move { Ok::<_, Infallible>(inner.call(messages).await) },
                ModelCallResult::is_success,
            )
            .await;
        match outcome {
            Ok(cached) => cached,
            Err(never) => match never {},
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::CacheSite;
    use grader_state::MemoryCacheBackend;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingClient {
        calls: AtomicUsize,
        reply: ModelCallResult,
    }

    #[async_trait]
    impl ModelClient for CountingClient {
        async fn call(&self, _messages: &[ChatMessage]) -> ModelCallResult {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.reply.clone()
        }
    }

    fn client(reply: ModelCallResult) -> (Arc<CountingClient>, CachedModelClient) {
        let inner = Arc::new(CountingClient {
            calls: AtomicUsize::new(0),
            reply,
        });
        let cache = CacheLayer::new(Arc::new(MemoryCacheBackend::new()), CacheSite::ModelCall);
        (inner.clone(), CachedModelClient::new(inner, cache))
    }

    fn success(text: &str) -> ModelCallResult {
        ModelCallResult::Success(ModelReply {
            content: text.to_string(),
            tokens: TokenUsage::new(10, 2),
        })
    }

    #[test]
    fn prompt_content_prefers_last_user_message() {
        let messages = vec![
            ChatMessage::system("you are evaluator_1"),
            ChatMessage::user("first"),
            ChatMessage::user("second"),
        ];
        assert_eq!(prompt_content(&messages), "second");
        assert_eq!(
            prompt_content(&[ChatMessage::system("a"), ChatMessage::system("b")]),
            "a\nb"
        );
    }

    #[tokio::test]
    async fn same_prompt_with_different_system_message_hits_cache() {
        let (inner, cached) = client(success("correct"));
        let a = cached
            .call(&[ChatMessage::system("one"), ChatMessage::user("grade")])
            .await;
        let b = cached
            .call(&[ChatMessage::system("two"), ChatMessage::user("grade")])
            .await;
        assert!(!a.insight.hit);
        assert!(b.insight.hit);
        assert_eq!(b.value, success("correct"));
        assert_eq!(inner.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn failures_are_not_cached() {
        let (inner, cached) = client(ModelCallResult::failure("timeout"));
        for _ in 0..2 {
            let out = cached.call(&[ChatMessage::user("grade")]).await;
            assert!(!out.insight.set);
        }
        assert_eq!(inner.calls.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn call_result_serializes_tagged() {
        let json = serde_json::to_value(ModelCallResult::Empty).unwrap();
        assert_eq!(json, serde_json::json!({"kind": "empty"}));
    }
}
