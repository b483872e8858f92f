//! HTTP embedding client
//!
//! Speaks the OpenAI-compatible `/embeddings` wire format. Two provider
//! profiles exist:
//!
//! - **vLLM** self-hosted: no `dimensions` parameter; when the model returns
//!   longer vectors than configured, the client truncates.
//! - **DeepInfra**: accepts `dimensions`; the client forwards it and never
//!   truncates.

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::json;
use std::time::Duration;
use tokio::sync::Semaphore;
use tracing::debug;

use super::retry::retry_with_backoff;
use super::{EmbedOptions, ProviderError, ProviderResult, Vectorizer};

/// Instruction prepended to query embeddings when the caller gives none
pub const DEFAULT_QUERY_INSTRUCTION: &str =
    "Given a search query, retrieve relevant passages that answer the query";

// ============================================================================
// CONFIGURATION
// ============================================================================

/// Configuration for an OpenAI-compatible embedding provider
#[derive(Debug, Clone)]
pub struct EmbeddingConfig {
    /// API root, e.g. `http://localhost:12000/v1`
    pub base_url: String,
    /// Bearer token; empty means no auth header
    pub api_key: String,
    /// Model name
    pub model: String,
    /// Target vector dimensions
    pub dimensions: usize,
    /// Per-request timeout
    pub timeout: Duration,
    /// Retry attempts per request
    pub max_retries: usize,
    /// Texts per wire request
    pub batch_size: usize,
    /// Concurrent in-flight requests
    pub max_concurrent_requests: usize,
    /// Forward `dimensions` to the API
    pub pass_dimensions: bool,
    /// Truncate over-long vectors client-side
    pub truncate_client_side: bool,
}

impl EmbeddingConfig {
    /// Profile for a self-hosted vLLM endpoint
    pub fn vllm(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            api_key: String::new(),
            model: "Qwen/Qwen3-Embedding-4B".to_string(),
            dimensions: 1024,
            timeout: Duration::from_secs(30),
            max_retries: 3,
            batch_size: 10,
            max_concurrent_requests: 5,
            pass_dimensions: false,
            truncate_client_side: true,
        }
    }

    /// Profile for the DeepInfra API
    pub fn deepinfra(base_url: impl Into<String>, api_key: impl Into<String>) -> Self {
        Self {
            api_key: api_key.into(),
            pass_dimensions: true,
            truncate_client_side: false,
            ..Self::vllm(base_url)
        }
    }
}

// ============================================================================
// WIRE TYPES
// ============================================================================

#[derive(Debug, Deserialize)]
struct EmbeddingResponse {
    data: Vec<EmbeddingDatum>,
}

#[derive(Debug, Deserialize)]
struct EmbeddingDatum {
    embedding: Vec<f32>,
}

// ============================================================================
// CLIENT
// ============================================================================

/// OpenAI-compatible embedding client
pub struct HttpVectorizer {
    config: EmbeddingConfig,
    client: reqwest::Client,
    semaphore: Semaphore,
}

impl HttpVectorizer {
    /// Build a client for the given provider profile
    pub fn new(config: EmbeddingConfig) -> ProviderResult<Self> {
        let client = reqwest::Client::builder()
            .timeout(config.timeout)
            .build()
            .map_err(|e| ProviderError::Connection(e.to_string()))?;
        let semaphore = Semaphore::new(config.max_concurrent_requests.max(1));
        Ok(Self {
            config,
            client,
            semaphore,
        })
    }

    fn format_texts(&self, texts: &[String], opts: &EmbedOptions) -> Vec<String> {
        if !opts.is_query {
            return texts.to_vec();
        }
        let instruction = opts
            .instruction
            .as_deref()
            .unwrap_or(DEFAULT_QUERY_INSTRUCTION);
        texts
            .iter()
            .map(|text| format!("Instruct: {instruction}\nQuery: {text}"))
            .collect()
    }

    async fn request_embeddings(&self, inputs: &[String]) -> ProviderResult<Vec<Vec<f32>>> {
        if self.config.model.is_empty() {
            return Err(ProviderError::Unsupported(
                "Embedding model is not configured".to_string(),
            ));
        }

        let url = format!("{}/embeddings", self.config.base_url.trim_end_matches('/'));
        let mut body = json!({
            "model": self.config.model,
            "input": inputs,
            "encoding_format": "float",
        });
        if self.config.pass_dimensions && self.config.dimensions > 0 {
            body["dimensions"] = json!(self.config.dimensions);
        }

        let _permit = self
            .semaphore
            .acquire()
            .await
            .map_err(|_| ProviderError::Connection("semaphore closed".to_string()))?;

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
                let parsed: EmbeddingResponse = response
                    .json()
                    .await
                    .map_err(|e| ProviderError::InvalidResponse(e.to_string()))?;
                if parsed.data.is_empty() {
                    return Err(ProviderError::InvalidResponse(
                        "missing embeddings in response".to_string(),
                    ));
                }
                Ok(parsed.data.into_iter().map(|d| d.embedding).collect())
            }
        })
        .await
        .map(|vectors: Vec<Vec<f32>>| {
            vectors
                .into_iter()
                .map(|v| self.postprocess(v))
                .collect()
        })
    }

    /// Truncate to the target dimensionality when the provider does not
    /// support `dimensions` itself
    fn postprocess(&self, mut vector: Vec<f32>) -> Vec<f32> {
        if self.config.truncate_client_side
            && self.config.dimensions > 0
            && vector.len() > self.config.dimensions
        {
            debug!(
                "Client-side truncation: {}D -> {}D",
                vector.len(),
                self.config.dimensions
            );
            vector.truncate(self.config.dimensions);
        }
        vector
    }
}

#[async_trait]
impl Vectorizer for HttpVectorizer {
    async fn embed(&self, text: &str, opts: &EmbedOptions) -> ProviderResult<Vec<f32>> {
        let inputs = self.format_texts(std::slice::from_ref(&text.to_string()), opts);
        let mut vectors = self.request_embeddings(&inputs).await?;
        vectors
            .drain(..)
            .next()
            .ok_or_else(|| ProviderError::InvalidResponse("empty embedding list".to_string()))
    }

    async fn embed_batch(
        &self,
        texts: &[String],
        opts: &EmbedOptions,
    ) -> ProviderResult<Vec<Vec<f32>>> {
        if texts.is_empty() {
            return Ok(vec![]);
        }
        let formatted = self.format_texts(texts, opts);
        let batch_size = self.config.batch_size.max(1);

        // batches within one call run sequentially; callers parallelise
        // across calls under their own semaphores
        let mut all = Vec::with_capacity(texts.len());
        for chunk in formatted.chunks(batch_size) {
            let vectors = self.request_embeddings(chunk).await?;
            if vectors.len() != chunk.len() {
                return Err(ProviderError::InvalidResponse(format!(
                    "expected {} embeddings, got {}",
                    chunk.len(),
                    vectors.len()
                )));
            }
            all.extend(vectors);
        }
        Ok(all)
    }

    fn model_name(&self) -> &str {
        &self.config.model
    }
}

// ============================================================================
// TESTS
// ============================================================================
