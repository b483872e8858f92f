//! Provider layer
//!
//! Async contracts for the external model services (embedding, passage
//! reranking, and the LLM used by the extractors), plus the
//! OpenAI-compatible HTTP implementations and the resilient
//! primary-plus-fallback wrappers.

mod embed;
mod llm;
mod rerank;
mod resilient;
pub mod retry;

pub use embed::{EmbeddingConfig, HttpVectorizer};
pub use llm::{ChatModel, LlmConfig, OpenAiChatClient};
pub use rerank::{HttpReranker, RerankConfig, RerankWireFormat, FAILED_BATCH_SCORE};
pub use resilient::{ResilientReranker, ResilientVectorizer};

use async_trait::async_trait;

// ============================================================================
// ERROR TYPES
// ============================================================================

/// Provider error type
#[non_exhaustive]
#[derive(Debug, thiserror::Error)]
pub enum ProviderError {
    /// Request exceeded the provider timeout
    #[error("Provider timeout")]
    Timeout,
    /// Could not reach the provider
    #[error("Connection error: {0}")]
    Connection(String),
    /// Provider throttled the request
    #[error("Rate limited")]
    RateLimited,
    /// Provider answered with a non-success status
    #[error("HTTP {status}: {body}")]
    Http {
        /// Status code
        status: u16,
        /// Response body (truncated)
        body: String,
    },
    /// Response parsed but is missing required fields
    #[error("Invalid response: {0}")]
    InvalidResponse(String),
    /// Model or dimension mismatch
    #[error("Unsupported: {0}")]
    Unsupported(String),
    /// All retry attempts failed
    #[error("Exhausted after {attempts} attempts: {last}")]
    Exhausted {
        /// How many attempts were made
        attempts: usize,
        /// Last underlying error
        last: String,
    },
    /// Primary and fallback both failed
    #[error("Primary failed: {primary}; fallback failed: {fallback}")]
    BothFailed {
        /// Primary cause
        primary: String,
        /// Fallback cause
        fallback: String,
    },
}

impl ProviderError {
    /// Classify a reqwest error into a provider error kind
    pub fn from_reqwest(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            ProviderError::Timeout
        } else if err.is_connect() {
            ProviderError::Connection(err.to_string())
        } else {
            ProviderError::InvalidResponse(err.to_string())
        }
    }
}

/// Provider result type
pub type ProviderResult<T> = std::result::Result<T, ProviderError>;

// ============================================================================
// EMBEDDING CONTRACT
// ============================================================================

/// Options for an embedding request
#[derive(Debug, Clone, Default)]
pub struct EmbedOptions {
    /// Whether the text is a search query (providers prepend an instruction)
    pub is_query: bool,
    /// Override of the default query instruction
    pub instruction: Option<String>,
}

impl EmbedOptions {
    /// Options for embedding a search query
    pub fn query() -> Self {
        Self {
            is_query: true,
            instruction: None,
        }
    }

    /// Options for embedding a document/passage
    pub fn document() -> Self {
        Self::default()
    }
}

/// Text → fixed-dimension vector service
#[async_trait]
pub trait Vectorizer: Send + Sync {
    /// Embed a single text
    async fn embed(&self, text: &str, opts: &EmbedOptions) -> ProviderResult<Vec<f32>>;

    /// Embed many texts; output order matches input order
    async fn embed_batch(
        &self,
        texts: &[String],
        opts: &EmbedOptions,
    ) -> ProviderResult<Vec<Vec<f32>>>;

    /// Model identifier (for logs and diagnostics)
    fn model_name(&self) -> &str;
}

// ============================================================================
// RERANK CONTRACT
// ============================================================================

/// Options for a rerank request
#[derive(Debug, Clone, Default)]
pub struct RerankOptions {
    /// Task instruction given to the reranker
    pub instruction: Option<String>,
    /// Keep only the best `top_k` results
    pub top_k: Option<usize>,
}

/// One rerank result; `index` refers to the input passage position
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RerankScore {
    /// Input position of the passage
    pub index: usize,
    /// Relevance score (higher is better)
    pub score: f32,
}

/// (query, passages) → relevance scores, sorted descending
#[async_trait]
pub trait PassageReranker: Send + Sync {
    /// Score every passage against the query.
    ///
    /// Output is sorted by score descending. A batch that fails after all
    /// retries yields the sentinel low score for its passages instead of
    /// failing the whole call.
    async fn rerank(
        &self,
        query: &str,
        passages: &[String],
        opts: &RerankOptions,
    ) -> ProviderResult<Vec<RerankScore>>;

    /// Model identifier (for logs and diagnostics)
    fn model_name(&self) -> &str;
}

// ============================================================================
// TESTS
// ============================================================================
