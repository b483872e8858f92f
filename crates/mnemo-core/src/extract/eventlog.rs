//! Event-log extraction
//!
//! Distills an emitted MemCell into at most one [`EventLog`] of atomic
//! facts. Each fact is embedded independently; fact embedding runs
//! concurrently under a semaphore to bound external QPS.

use chrono::{DateTime, Utc};
use serde::Deserialize;
use std::sync::Arc;
use tokio::sync::Semaphore;
use tracing::warn;

use crate::memory::{EventLog, MemCell};
use crate::providers::{ChatModel, EmbedOptions, Vectorizer};

use super::parse_json_block;

/// Default concurrent fact embeddings
pub const DEFAULT_FACT_CONCURRENCY: usize = 20;

// ============================================================================
// WIRE TYPES
// ============================================================================

#[derive(Debug, Deserialize)]
struct RawEventLog {
    #[serde(default)]
    time: Option<DateTime<Utc>>,
    #[serde(default)]
    atomic_fact: Vec<String>,
}

// ============================================================================
// EXTRACTOR
// ============================================================================

/// MemCell → event log of atomic facts
pub struct EventLogExtractor {
    chat: Arc<dyn ChatModel>,
    vectorizer: Arc<dyn Vectorizer>,
    fact_semaphore: Arc<Semaphore>,
}

impl EventLogExtractor {
    /// Build an extractor over a chat model and an embedding service
    pub fn new(chat: Arc<dyn ChatModel>, vectorizer: Arc<dyn Vectorizer>) -> Self {
        Self::with_concurrency(chat, vectorizer, DEFAULT_FACT_CONCURRENCY)
    }

    /// Build with an explicit fact-embedding concurrency cap
    pub fn with_concurrency(
        chat: Arc<dyn ChatModel>,
        vectorizer: Arc<dyn Vectorizer>,
        fact_concurrency: usize,
    ) -> Self {
        Self {
            chat,
            vectorizer,
            fact_semaphore: Arc::new(Semaphore::new(fact_concurrency.max(1))),
        }
    }

    /// Extract and embed the event log for a cell.
    ///
    /// Returns `None` when the oracle produced nothing useful or when any
    /// fact failed to embed: a partial log would break the
    /// facts/embeddings length invariant the sync service enforces.
    pub async fn extract(&self, cell: &MemCell) -> Option<EventLog> {
        let prompt = self.prompt(cell);
        let response = match self.chat.generate(&prompt).await {
            Ok(text) => text,
            Err(e) => {
                warn!("Event-log extraction failed for {}: {e}", cell.event_id);
                return None;
            }
        };

        let raw: RawEventLog = parse_json_block(&response)?;
        let facts: Vec<String> = raw
            .atomic_fact
            .into_iter()
            .filter(|fact| !fact.trim().is_empty())
            .collect();
        if facts.is_empty() {
            return None;
        }

        // embed each fact independently, bounded by the semaphore
        let futures = facts.iter().map(|fact| {
            let semaphore = Arc::clone(&self.fact_semaphore);
            let vectorizer = Arc::clone(&self.vectorizer);
            let fact = fact.clone();
            async move {
                let _permit = semaphore.acquire().await;
                vectorizer.embed(&fact, &EmbedOptions::document()).await
            }
        });
        let results = futures::future::join_all(futures).await;

        let mut embeddings = Vec::with_capacity(facts.len());
        for result in results {
            match result {
                Ok(vector) => embeddings.push(vector),
                Err(e) => {
                    warn!("Fact embedding failed for {}: {e}; dropping event log", cell.event_id);
                    return None;
                }
            }
        }

        Some(EventLog {
            time: raw.time.or(Some(cell.timestamp)),
            atomic_fact: facts,
            fact_embeddings: embeddings,
        })
    }

    fn prompt(&self, cell: &MemCell) -> String {
        let transcript: String = cell
            .original_data
            .iter()
            .map(|m| format!("{}: {}\n", m.sender, m.content))
            .collect();
        format!(
            "List the concrete events in this episode as atomic facts. \
             One short sentence per fact, past tense, named subjects.\n\
             Messages:\n{transcript}\n\
             Answer with JSON only:\n\
             {{\"time\": \"RFC3339 timestamp or null\", \"atomic_fact\": [\"...\"]}}\n\
             Use an empty list when nothing noteworthy happened."
        )
    }
}

// ============================================================================
// TESTS
// ============================================================================
