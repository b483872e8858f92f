//! HTTP rerank client
//!
//! Two wire formats exist in the wild and both are supported behind one
//! adapter:
//!
//! - **Standard** (vLLM `/rerank` and compatibles): `{model, query,
//!   documents}` answered with `results: [{index, relevance_score}]`.
//! - **QwenInstruct** (DeepInfra inference endpoint): the query and each
//!   document are wrapped in the Qwen-reranker chat template and posted as
//!   `{queries, documents}`; the answer carries parallel `scores`.
//!
//! Passages are split into batches issued concurrently under a semaphore.
//! A batch that fails after all retries contributes the sentinel
//! [`FAILED_BATCH_SCORE`] for its passages so they sink to the bottom
//! without losing their positions.

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tracing::{error, warn};

use super::retry::retry_with_backoff;
use super::{PassageReranker, ProviderError, ProviderResult, RerankOptions, RerankScore};

/// Sentinel score assigned to passages of a batch that exhausted its retries
pub const FAILED_BATCH_SCORE: f32 = -100.0;

/// Instruction used when the caller gives none
const DEFAULT_RERANK_INSTRUCTION: &str = "Given a question and a passage, determine if the \
     passage contains information relevant to answering the question.";

const QWEN_PREFIX: &str = "<|im_start|>system\nJudge whether the Document meets the requirements \
     based on the Query and the Instruct provided. Note that the answer can only be \"yes\" or \
     \"no\".<|im_end|>\n<|im_start|>user\n";
const QWEN_SUFFIX: &str = "<|im_end|>\n<|im_start|>assistant\n<think>\n\n</think>\n\n";

// ============================================================================
// CONFIGURATION
// ============================================================================

/// Wire format variant of a rerank provider
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RerankWireFormat {
    /// OpenAI-style `{query, documents}` JSON
    Standard,
    /// Qwen-reranker system+instruct template, `{queries, documents}` pairs
    QwenInstruct,
}

/// Configuration for a rerank provider
#[derive(Debug, Clone)]
pub struct RerankConfig {
    /// Full endpoint URL
    pub base_url: String,
    /// Bearer token; empty means no auth header
    pub api_key: String,
    /// Model name
    pub model: String,
    /// Per-request timeout
    pub timeout: Duration,
    /// Retry attempts per batch
    pub max_retries: usize,
    /// Passages per batch
    pub batch_size: usize,
    /// Concurrent in-flight batches
    pub max_concurrent_requests: usize,
    /// Wire format
    pub wire: RerankWireFormat,
}

impl RerankConfig {
    /// Profile for a self-hosted vLLM `/rerank` endpoint
    pub fn vllm(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            api_key: String::new(),
            model: "Qwen/Qwen3-Reranker-4B".to_string(),
            timeout: Duration::from_secs(30),
            max_retries: 3,
            batch_size: 10,
            max_concurrent_requests: 5,
            wire: RerankWireFormat::Standard,
        }
    }

    /// Profile for the DeepInfra inference endpoint
    pub fn deepinfra(base_url: impl Into<String>, api_key: impl Into<String>) -> Self {
        Self {
            api_key: api_key.into(),
            wire: RerankWireFormat::QwenInstruct,
            ..Self::vllm(base_url)
        }
    }
}

// ============================================================================
// WIRE TYPES
// ============================================================================

#[derive(Debug, Deserialize)]
struct StandardResponse {
    results: Vec<StandardResult>,
}

#[derive(Debug, Deserialize)]
struct StandardResult {
    index: usize,
    #[serde(default)]
    relevance_score: f32,
}

#[derive(Debug, Deserialize)]
struct ScoresResponse {
    #[serde(default)]
    scores: Vec<f32>,
}

// ============================================================================
// CLIENT
// ============================================================================

/// HTTP rerank client supporting both wire formats
pub struct HttpReranker {
    config: RerankConfig,
    client: reqwest::Client,
    semaphore: Arc<Semaphore>,
}

impl HttpReranker {
    /// Build a client for the given provider profile
    pub fn new(config: RerankConfig) -> ProviderResult<Self> {
        let client = reqwest::Client::builder()
            .timeout(config.timeout)
            .build()
            .map_err(|e| ProviderError::Connection(e.to_string()))?;
        let semaphore = Arc::new(Semaphore::new(config.max_concurrent_requests.max(1)));
        Ok(Self {
            config,
            client,
            semaphore,
        })
    }

    fn build_body(&self, query: &str, documents: &[String], instruction: &str) -> serde_json::Value {
        match self.config.wire {
            RerankWireFormat::Standard => json!({
                "model": self.config.model,
                "query": query,
                "documents": documents,
                "instruction": instruction,
            }),
            RerankWireFormat::QwenInstruct => {
                let formatted_query =
                    format!("{QWEN_PREFIX}<Instruct>: {instruction}\n<Query>: {query}\n");
                let queries: Vec<String> = documents.iter().map(|_| formatted_query.clone()).collect();
                let docs: Vec<String> = documents
                    .iter()
                    .map(|doc| format!("<Document>: {doc}{QWEN_SUFFIX}"))
                    .collect();
                json!({
                    "queries": queries,
                    "documents": docs,
                })
            }
        }
    }

    /// Endpoint for the configured wire format; the Qwen variant addresses
    /// the model by path.
    fn endpoint(&self) -> String {
        match self.config.wire {
            RerankWireFormat::Standard => self.config.base_url.clone(),
            RerankWireFormat::QwenInstruct => {
                let base = self.config.base_url.trim_end_matches('/');
                if base.ends_with(self.config.model.as_str()) {
                    base.to_string()
                } else {
                    format!("{base}/{}", self.config.model)
                }
            }
        }
    }

    /// Score one batch; returns scores in input order
    async fn score_batch(&self, query: &str, batch: &[String], instruction: &str) -> ProviderResult<Vec<f32>> {
        let url = self.endpoint();
        let body = self.build_body(query, batch, instruction);
        let batch_len = batch.len();

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
                let value: serde_json::Value = response
                    .json()
                    .await
                    .map_err(|e| ProviderError::InvalidResponse(e.to_string()))?;
                parse_scores(&value, batch_len)
            }
        })
        .await
    }
}

/// Parse either response shape into per-document scores in input order
fn parse_scores(value: &serde_json::Value, expected: usize) -> ProviderResult<Vec<f32>> {
    if value.get("results").is_some_and(|r| r.is_array()) {
        let parsed: StandardResponse = serde_json::from_value(value.clone())
            .map_err(|e| ProviderError::InvalidResponse(e.to_string()))?;
        let mut scores = vec![0.0; expected];
        for item in parsed.results {
            if item.index < expected {
                scores[item.index] = item.relevance_score;
            }
        }
        return Ok(scores);
    }
    if value.get("scores").is_some_and(|s| s.is_array()) {
        let parsed: ScoresResponse = serde_json::from_value(value.clone())
            .map_err(|e| ProviderError::InvalidResponse(e.to_string()))?;
        let mut scores = parsed.scores;
        if scores.len() < expected {
            scores.resize(expected, 0.0);
        }
        scores.truncate(expected);
        return Ok(scores);
    }
    Err(ProviderError::InvalidResponse(
        "rerank response carries neither 'results' nor 'scores'".to_string(),
    ))
}

#[async_trait]
impl PassageReranker for HttpReranker {
    async fn rerank(
        &self,
        query: &str,
        passages: &[String],
        opts: &RerankOptions,
    ) -> ProviderResult<Vec<RerankScore>> {
        if passages.is_empty() {
            return Ok(vec![]);
        }
        let instruction = opts
            .instruction
            .clone()
            .unwrap_or_else(|| DEFAULT_RERANK_INSTRUCTION.to_string());

        let batch_size = self.config.batch_size.max(1);
        let batches: Vec<&[String]> = passages.chunks(batch_size).collect();

        // batches are issued concurrently; the semaphore inside score_batch
        // bounds in-flight requests
        let futures = batches
            .iter()
            .map(|batch| self.score_batch(query, batch, &instruction));
        let batch_results = futures::future::join_all(futures).await;

        let mut scores = Vec::with_capacity(passages.len());
        for (i, result) in batch_results.into_iter().enumerate() {
            match result {
                Ok(batch_scores) => scores.extend(batch_scores),
                Err(e) => {
                    error!("Rerank batch {i} failed after retries: {e}");
                    scores.extend(std::iter::repeat_n(FAILED_BATCH_SCORE, batches[i].len()));
                }
            }
        }
        if scores.len() != passages.len() {
            warn!(
                "Rerank returned {} scores for {} passages; padding",
                scores.len(),
                passages.len()
            );
            scores.resize(passages.len(), FAILED_BATCH_SCORE);
        }

        let mut ranked: Vec<RerankScore> = scores
            .into_iter()
            .enumerate()
            .map(|(index, score)| RerankScore { index, score })
            .collect();
        ranked.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(std::cmp::Ordering::Equal));
        if let Some(top_k) = opts.top_k {
            ranked.truncate(top_k);
        }
        Ok(ranked)
    }

    fn model_name(&self) -> &str {
        &self.config.model
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_standard_results() {
        let value = json!({
            "results": [
                {"index": 1, "relevance_score": 0.9},
                {"index": 0, "relevance_score": 0.2},
            ]
        });
        let scores = parse_scores(&value, 2).unwrap();
        assert_eq!(scores, vec![0.2, 0.9]);
    }

    #[test]
    fn test_parse_scores_array_pads_and_truncates() {
        let value = json!({"scores": [0.5]});
        assert_eq!(parse_scores(&value, 3).unwrap(), vec![0.5, 0.0, 0.0]);

        let value = json!({"scores": [0.5, 0.6, 0.7, 0.8]});
        assert_eq!(parse_scores(&value, 2).unwrap(), vec![0.5, 0.6]);
    }

    #[test]
    fn test_parse_rejects_unknown_shape() {
        let value = json!({"data": []});
        assert!(parse_scores(&value, 1).is_err());
    }

    #[test]
    fn test_qwen_body_templates_documents() {
        let client = HttpReranker::new(RerankConfig::deepinfra("http://x/v1/inference", "k")).unwrap();
        let body = client.build_body("q", &["d1".to_string(), "d2".to_string()], "instr");
        let queries = body["queries"].as_array().unwrap();
        let docs = body["documents"].as_array().unwrap();
        assert_eq!(queries.len(), 2);
        assert!(queries[0].as_str().unwrap().contains("<Query>: q"));
        assert!(docs[1].as_str().unwrap().starts_with("<Document>: d2"));
    }

    #[test]
    fn test_qwen_endpoint_appends_model_once() {
        let mut config = RerankConfig::deepinfra("http://x/v1/inference", "k");
        config.model = "m/r".to_string();
        let client = HttpReranker::new(config).unwrap();
        assert_eq!(client.endpoint(), "http://x/v1/inference/m/r");

        let mut config = RerankConfig::deepinfra("http://x/v1/inference/m/r", "k");
        config.model = "m/r".to_string();
        let client = HttpReranker::new(config).unwrap();
        assert_eq!(client.endpoint(), "http://x/v1/inference/m/r");
    }

    #[tokio::test]
    async fn test_unreachable_provider_sinks_all_batches() {
        let mut config = RerankConfig::vllm("http://127.0.0.1:1/rerank");
        config.max_retries = 1;
        config.timeout = Duration::from_millis(200);
        let client = HttpReranker::new(config).unwrap();

        let passages = vec!["a".to_string(), "b".to_string()];
        let ranked = client
            .rerank("q", &passages, &RerankOptions::default())
            .await
            .unwrap();
        assert_eq!(ranked.len(), 2);
        assert!(ranked.iter().all(|r| r.score == FAILED_BATCH_SCORE));
    }
}
