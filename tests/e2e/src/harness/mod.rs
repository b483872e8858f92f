//! Test harness
//!
//! Builds a fully wired [`MemoryEngine`] on a temporary database with
//! scripted providers, plus factories for raw messages.

use chrono::{DateTime, Utc};
use std::sync::Arc;
use tempfile::TempDir;

use mnemo_core::{
    ChatModel, MemoryConfig, MemoryEngine, PassageReranker, RawMessage, Role, Vectorizer,
};

use crate::mocks::{HashVectorizer, MockOracle, OverlapReranker};

/// Embedding dimensions used across the suite
pub const TEST_DIMS: usize = 16;

/// One isolated engine instance with its scripted oracle
pub struct TestHarness {
    pub engine: MemoryEngine,
    pub oracle: Arc<MockOracle>,
    pub vectorizer: Arc<HashVectorizer>,
    _dir: TempDir,
}

impl TestHarness {
    /// Engine with scripted oracle, hash embeddings and an overlap reranker
    pub fn new() -> Self {
        let oracle = Arc::new(MockOracle::new());
        let vectorizer = Arc::new(HashVectorizer::new(TEST_DIMS));
        Self::with_providers(
            Arc::clone(&oracle) as Arc<dyn ChatModel>,
            Arc::clone(&vectorizer) as Arc<dyn Vectorizer>,
            Arc::new(OverlapReranker),
            oracle,
            vectorizer,
        )
    }

    /// Engine with a custom reranker (outage scenarios)
    pub fn with_reranker(reranker: Arc<dyn PassageReranker>) -> Self {
        let oracle = Arc::new(MockOracle::new());
        let vectorizer = Arc::new(HashVectorizer::new(TEST_DIMS));
        Self::with_providers(
            Arc::clone(&oracle) as Arc<dyn ChatModel>,
            Arc::clone(&vectorizer) as Arc<dyn Vectorizer>,
            reranker,
            oracle,
            vectorizer,
        )
    }

    fn with_providers(
        chat: Arc<dyn ChatModel>,
        vectorizer_dyn: Arc<dyn Vectorizer>,
        reranker: Arc<dyn PassageReranker>,
        oracle: Arc<MockOracle>,
        vectorizer: Arc<HashVectorizer>,
    ) -> Self {
        let dir = TempDir::new().expect("temp dir");
        let config = MemoryConfig {
            db_path: Some(dir.path().join("mnemo-test.db")),
            dimensions: TEST_DIMS,
            enable_profiles: false,
            ..Default::default()
        };
        let engine = MemoryEngine::with_providers(&config, chat, vectorizer_dyn, reranker)
            .expect("engine assembly");
        Self {
            engine,
            oracle,
            vectorizer,
            _dir: dir,
        }
    }
}

impl Default for TestHarness {
    fn default() -> Self {
        Self::new()
    }
}

// ============================================================================
// MESSAGE FACTORY
// ============================================================================

/// A raw message at an RFC 3339 timestamp
pub fn message_at(group: &str, id: &str, sender: &str, rfc3339: &str, content: &str) -> RawMessage {
    RawMessage {
        message_id: id.to_string(),
        group_id: Some(group.to_string()),
        sender: sender.to_string(),
        sender_name: None,
        role: Role::User,
        content: content.to_string(),
        create_time: DateTime::parse_from_rfc3339(rfc3339)
            .expect("valid rfc3339 in fixture")
            .with_timezone(&Utc),
        refer_list: vec![],
    }
}

/// A raw message at an epoch-second timestamp
pub fn message(group: &str, id: &str, sender: &str, secs: i64, content: &str) -> RawMessage {
    RawMessage {
        message_id: id.to_string(),
        group_id: Some(group.to_string()),
        sender: sender.to_string(),
        sender_name: None,
        role: Role::User,
        content: content.to_string(),
        create_time: DateTime::from_timestamp(secs, 0).expect("valid epoch in fixture"),
        refer_list: vec![],
    }
}
