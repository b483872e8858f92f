//! # Mnemo Core
//!
//! Conversational memory engine. Ingests a live stream of chat messages,
//! detects episode boundaries with an LLM, distills typed memory records,
//! and serves relevance-ranked retrieval over them:
//!
//! - **Windowed ingest**: per-group message log with a monotone
//!   state-machine cursor, single writer per group
//! - **Boundary detection**: LLM-guided episode segmentation with smart
//!   masking for long windows
//! - **Write fan-out**: one MemCell becomes an episode record, N semantic
//!   memories and M atomic facts across document store + vector index +
//!   inverted index with structural child ids
//! - **Hybrid retrieval**: BM25 (FTS5) + HNSW (USearch) with rerank or
//!   Reciprocal Rank Fusion, grouped by conversation and ordered by a
//!   per-group importance score
//! - **Resilient providers**: OpenAI-compatible embedding/rerank clients
//!   with primary + fallback failover and failure counting
//! - **Profiles**: incremental explicit/implicit user digests with episode
//!   clustering and capacity compaction
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use mnemo_core::{MemoryConfig, MemoryEngine, RawMessage};
//!
//! let engine = MemoryEngine::from_config(&MemoryConfig::default())?;
//!
//! // Ingest one chat turn
//! let message: RawMessage = serde_json::from_str(payload)?;
//! let outcome = engine.memorize(message).await?;
//!
//! // Search
//! let response = engine.retrieve(&request).await?;
//! ```

#![warn(rustdoc::missing_crate_level_docs)]
#![warn(missing_docs)]

// ============================================================================
// MODULES
// ============================================================================

pub mod config;
pub mod engine;
pub mod error;
pub mod extract;
pub mod filter;
pub mod ingest;
pub mod memory;
pub mod profile;
pub mod providers;
pub mod retrieval;
pub mod search;
pub mod storage;
pub mod sync;

// ============================================================================
// PUBLIC API RE-EXPORTS
// ============================================================================

// Engine facade
pub use engine::{MemoryEngine, MetaPatch};

// Configuration
pub use config::{LlmSettings, MemoryConfig, ProviderSettings};

// Errors
pub use error::{EngineError, Result};

// Data model
pub use memory::{
    child_record_id, parse_child_record_id, ClusterState, ConversationMeta, ConversationStatus,
    EpisodicRecord, EventLog, EventType, ImportanceEvidence, MemCell, MemoryNode, ProfileItem,
    RawMessage, RecordKind, Role, Scene, SemanticMemory, SyncStatus, UserProfile, WindowEntry,
    MAGIC_ALL, MAX_FETCH_LIMIT,
};

// Filters
pub use filter::ScopeFilter;

// Ingest
pub use ingest::{IngestOutcome, IngestService, IngestStatus};

// Retrieval
pub use retrieval::{
    RetrievalService, RetrieveMethod, RetrieveRequest, RetrieveResponse, RetrievedMemory,
};

// Sync
pub use sync::{SyncService, SyncStats};

// Providers
pub use providers::{
    ChatModel, EmbedOptions, EmbeddingConfig, HttpReranker, HttpVectorizer, LlmConfig,
    OpenAiChatClient, PassageReranker, ProviderError, RerankConfig, RerankOptions, RerankScore,
    ResilientReranker, ResilientVectorizer, Vectorizer,
};

// Storage
pub use storage::{DocumentStore, SortOrder, StorageError};

// Search
pub use search::{KeywordIndex, VectorIndex, VectorIndexConfig};

// ============================================================================
// VERSION INFO
// ============================================================================

/// Crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
