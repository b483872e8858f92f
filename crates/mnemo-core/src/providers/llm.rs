//! LLM chat client
//!
//! The extractors depend on a single-turn generation contract: prompt in,
//! text out. [`OpenAiChatClient`] speaks the OpenAI-compatible
//! `/chat/completions` wire format; tests substitute deterministic stubs.

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::json;
use std::time::Duration;

use super::retry::retry_with_backoff;
use super::{ProviderError, ProviderResult};

// ============================================================================
// CONTRACT
// ============================================================================

/// Single-turn text generation
#[async_trait]
pub trait ChatModel: Send + Sync {
    /// Generate a completion for one prompt
    async fn generate(&self, prompt: &str) -> ProviderResult<String>;
}

// ============================================================================
// CONFIGURATION
// ============================================================================

/// Configuration for an OpenAI-compatible chat provider
#[derive(Debug, Clone)]
pub struct LlmConfig {
    /// API root, e.g. `https://api.deepinfra.com/v1/openai`
    pub base_url: String,
    /// Bearer token; empty means no auth header
    pub api_key: String,
    /// Model name
    pub model: String,
    /// Sampling temperature
    pub temperature: f32,
    /// Completion token cap
    pub max_tokens: u32,
    /// Per-request timeout
    pub timeout: Duration,
    /// Retry attempts per request
    pub max_retries: usize,
}

impl LlmConfig {
    /// Profile for any OpenAI-compatible endpoint
    pub fn openai_compatible(
        base_url: impl Into<String>,
        api_key: impl Into<String>,
        model: impl Into<String>,
    ) -> Self {
        Self {
            base_url: base_url.into(),
            api_key: api_key.into(),
            model: model.into(),
            temperature: 0.3,
            max_tokens: 4096,
            timeout: Duration::from_secs(60),
            max_retries: 3,
        }
    }
}

// ============================================================================
// WIRE TYPES
// ============================================================================

#[derive(Debug, Deserialize)]
struct ChatResponse {
    choices: Vec<ChatChoice>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: ChatMessage,
}

#[derive(Debug, Deserialize)]
struct ChatMessage {
    #[serde(default)]
    content: String,
}

// ============================================================================
// CLIENT
// ============================================================================

/// OpenAI-compatible chat completion client
pub struct OpenAiChatClient {
    config: LlmConfig,
    client: reqwest::Client,
}

impl OpenAiChatClient {
    /// Build a client for the given endpoint
    pub fn new(config: LlmConfig) -> ProviderResult<Self> {
        let client = reqwest::Client::builder()
            .timeout(config.timeout)
            .build()
            .map_err(|e| ProviderError::Connection(e.to_string()))?;
        Ok(Self { config, client })
    }
}

#[async_trait]
impl ChatModel for OpenAiChatClient {
    async fn generate(&self, prompt: &str) -> ProviderResult<String> {
        let url = format!(
            "{}/chat/completions",
            self.config.base_url.trim_end_matches('/')
        );
        let body = json!({
            "model": self.config.model,
            "messages": [{"role": "user", "content": prompt}],
            "temperature": self.config.temperature,
            "max_tokens": self.config.max_tokens,
        });

        retry_with_backoff(self.config.max_retries, Duration::from_secs(1), || {
            let request = self.client.post(&url).json(&body);
            let request = if self.config.api_key.is_empty() {
                request
            } else {
                request.bearer_auth(&self.config.api_key)
            };
            async move {
                let response = request.send().await.map_err(ProviderError::from_reqwest)?;
                let status = response.status();
                if status.as_u16() == 429 {
                    return Err(ProviderError::RateLimited);
                }
                if !status.is_success() {
                    let body = response.text().await.unwrap_or_default();
                    return Err(ProviderError::Http {
                        status: status.as_u16(),
                        body: body.chars().take(512).collect(),
                    });
                }
                let parsed: ChatResponse = response
                    .json()
                    .await
                    .map_err(|e| ProviderError::InvalidResponse(e.to_string()))?;
                parsed
                    .choices
                    .into_iter()
                    .next()
                    .map(|choice| choice.message.content)
                    .ok_or_else(|| {
                        ProviderError::InvalidResponse("no choices in completion".to_string())
                    })
            }
        })
        .await
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_unreachable_endpoint_is_exhausted() {
        let mut config = LlmConfig::openai_compatible("http://127.0.0.1:1/v1", "", "test-model");
        config.max_retries = 1;
        config.timeout = Duration::from_millis(200);
        let client = OpenAiChatClient::new(config).unwrap();
        let err = client.generate("hello").await.unwrap_err();
        assert!(matches!(err, ProviderError::Exhausted { .. }));
    }

    #[test]
    fn test_chat_response_parsing() {
        let json = r#"{"choices": [{"message": {"role": "assistant", "content": "hi"}}]}"#;
        let parsed: ChatResponse = serde_json::from_str(json).unwrap();
        assert_eq!(parsed.choices[0].message.content, "hi");
    }
}
