//! Deterministic provider stubs
//!
//! The LLM is a non-deterministic oracle in production; here every provider
//! is scripted so the state machine can be driven through exact scenarios:
//! - [`MockOracle`] routes prompts by their markers and replays queued
//!   boundary verdicts
//! - [`HashVectorizer`] derives stable pseudo-embeddings from text
//! - [`FailingVectorizer`] / [`FailingReranker`] simulate provider outages

use async_trait::async_trait;
use std::collections::VecDeque;
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};

use mnemo_core::providers::RerankOptions;
use mnemo_core::{
    ChatModel, EmbedOptions, PassageReranker, ProviderError, RerankScore, Vectorizer,
};

type ProviderResult<T> = Result<T, ProviderError>;

// ============================================================================
// ORACLE
// ============================================================================

/// Prompt-routing chat stub.
///
/// Boundary prompts pop from a queue (empty queue means "no boundary");
/// the other extraction prompts answer with fixed, configurable payloads.
pub struct MockOracle {
    boundary_responses: Mutex<VecDeque<String>>,
    pub episode_text: Mutex<String>,
    pub semantic_json: Mutex<String>,
    pub eventlog_json: Mutex<String>,
    pub profile_json: Mutex<String>,
    pub calls: AtomicUsize,
}

impl Default for MockOracle {
    fn default() -> Self {
        Self {
            boundary_responses: Mutex::new(VecDeque::new()),
            episode_text: Mutex::new("A narrative of the covered episode.".to_string()),
            semantic_json: Mutex::new("[]".to_string()),
            eventlog_json: Mutex::new(r#"{"atomic_fact": []}"#.to_string()),
            profile_json: Mutex::new(r#"{"operations": []}"#.to_string()),
            calls: AtomicUsize::new(0),
        }
    }
}

impl MockOracle {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue a "boundary found" verdict covering messages `0..=index`
    pub fn push_boundary(&self, index: usize, summary: &str) {
        self.boundary_responses.lock().unwrap().push_back(format!(
            r#"{{"boundary": true, "boundary_index": {index}, "summary": "{summary}"}}"#
        ));
    }

    /// Queue a raw boundary response (malformed output, wait signals, ...)
    pub fn push_boundary_raw(&self, response: &str) {
        self.boundary_responses
            .lock()
            .unwrap()
            .push_back(response.to_string());
    }

    /// Set the episode-narrative payload
    pub fn set_episode(&self, text: &str) {
        *self.episode_text.lock().unwrap() = text.to_string();
    }

    /// Set the semantic-extraction payload
    pub fn set_semantic(&self, json: &str) {
        *self.semantic_json.lock().unwrap() = json.to_string();
    }

    /// Set the event-log payload
    pub fn set_eventlog(&self, json: &str) {
        *self.eventlog_json.lock().unwrap() = json.to_string();
    }
}

#[async_trait]
impl ChatModel for MockOracle {
    async fn generate(&self, prompt: &str) -> ProviderResult<String> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if prompt.contains("segment group conversations") {
            let queued = self.boundary_responses.lock().unwrap().pop_front();
            return Ok(queued.unwrap_or_else(|| r#"{"boundary": false}"#.to_string()));
        }
        if prompt.contains("third-person narrative") {
            return Ok(self.episode_text.lock().unwrap().clone());
        }
        if prompt.contains("Extract durable facts") {
            return Ok(self.semantic_json.lock().unwrap().clone());
        }
        if prompt.contains("atomic facts") {
            return Ok(self.eventlog_json.lock().unwrap().clone());
        }
        if prompt.contains("maintain a user profile") || prompt.contains("condense it") {
            return Ok(self.profile_json.lock().unwrap().clone());
        }
        Err(ProviderError::InvalidResponse(format!(
            "unrouted prompt: {}",
            prompt.chars().take(60).collect::<String>()
        )))
    }
}

// ============================================================================
// VECTORIZERS
// ============================================================================

/// Stable pseudo-embeddings: the same text always maps to the same unit
/// vector, and different texts rarely collide.
pub struct HashVectorizer {
    pub dims: usize,
    pub calls: AtomicUsize,
}

impl HashVectorizer {
    pub fn new(dims: usize) -> Self {
        Self {
            dims,
            calls: AtomicUsize::new(0),
        }
    }

    fn vector_for(&self, text: &str) -> Vec<f32> {
        // FNV-style rolling seed per dimension
        let mut seed: u64 = 0xcbf29ce484222325;
        for byte in text.bytes() {
            seed ^= byte as u64;
            seed = seed.wrapping_mul(0x100000001b3);
        }
        let mut vector: Vec<f32> = (0..self.dims)
            .map(|i| {
                let mut x = seed.wrapping_add((i as u64).wrapping_mul(0x9e3779b97f4a7c15));
                x ^= x >> 33;
                x = x.wrapping_mul(0xff51afd7ed558ccd);
                x ^= x >> 33;
                ((x % 2000) as f32 / 1000.0) - 1.0
            })
            .collect();
        let norm = vector.iter().map(|v| v * v).sum::<f32>().sqrt();
        if norm > 0.0 {
            for v in &mut vector {
                *v /= norm;
            }
        }
        vector
    }
}

#[async_trait]
impl Vectorizer for HashVectorizer {
    async fn embed(&self, text: &str, _opts: &EmbedOptions) -> ProviderResult<Vec<f32>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(self.vector_for(text))
    }

    async fn embed_batch(
        &self,
        texts: &[String],
        _opts: &EmbedOptions,
    ) -> ProviderResult<Vec<Vec<f32>>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(texts.iter().map(|t| self.vector_for(t)).collect())
    }

    fn model_name(&self) -> &str {
        "hash-vectorizer"
    }
}

/// Always-down embedding provider
pub struct FailingVectorizer {
    pub calls: AtomicUsize,
}

impl FailingVectorizer {
    pub fn new() -> Self {
        Self {
            calls: AtomicUsize::new(0),
        }
    }
}

#[async_trait]
impl Vectorizer for FailingVectorizer {
    async fn embed(&self, _text: &str, _opts: &EmbedOptions) -> ProviderResult<Vec<f32>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Err(ProviderError::Connection("provider down".to_string()))
    }

    async fn embed_batch(
        &self,
        _texts: &[String],
        _opts: &EmbedOptions,
    ) -> ProviderResult<Vec<Vec<f32>>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Err(ProviderError::Connection("provider down".to_string()))
    }

    fn model_name(&self) -> &str {
        "failing-vectorizer"
    }
}

// ============================================================================
// RERANKERS
// ============================================================================

/// Scores each passage by naive term overlap with the query; deterministic
/// and order-sensitive enough for ranking assertions.
pub struct OverlapReranker;

#[async_trait]
impl PassageReranker for OverlapReranker {
    async fn rerank(
        &self,
        query: &str,
        passages: &[String],
        opts: &RerankOptions,
    ) -> ProviderResult<Vec<RerankScore>> {
        let query_lower = query.to_lowercase();
        let terms: Vec<&str> = query_lower.split_whitespace().collect();
        let mut scores: Vec<RerankScore> = passages
            .iter()
            .enumerate()
            .map(|(index, passage)| {
                let passage_lower = passage.to_lowercase();
                let overlap = terms
                    .iter()
                    .filter(|t| passage_lower.contains(**t))
                    .count();
                RerankScore {
                    index,
                    score: overlap as f32,
                }
            })
            .collect();
        scores.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap());
        if let Some(top_k) = opts.top_k {
            scores.truncate(top_k);
        }
        Ok(scores)
    }

    fn model_name(&self) -> &str {
        "overlap-reranker"
    }
}

/// Always-down rerank provider
pub struct FailingReranker;

#[async_trait]
impl PassageReranker for FailingReranker {
    async fn rerank(
        &self,
        _query: &str,
        _passages: &[String],
        _opts: &RerankOptions,
    ) -> ProviderResult<Vec<RerankScore>> {
        Err(ProviderError::Connection("rerank down".to_string()))
    }

    fn model_name(&self) -> &str {
        "failing-reranker"
    }
}
