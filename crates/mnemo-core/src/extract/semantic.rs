//! Semantic memory extraction
//!
//! Distills an emitted MemCell into zero or more durable, optionally dated
//! facts, then embeds each fact's content. Embedding runs in batches under a
//! semaphore so a burst of extractions cannot exceed the provider's QPS.

use chrono::{DateTime, NaiveDate, Utc};
use serde::Deserialize;
use std::sync::Arc;
use tokio::sync::Semaphore;
use tracing::warn;

use crate::memory::{MemCell, SemanticMemory};
use crate::providers::{ChatModel, EmbedOptions, Vectorizer};

use super::parse_json_block;

/// Default concurrent embedding batches
pub const DEFAULT_BATCH_CONCURRENCY: usize = 10;

/// Texts per embedding batch
const EMBED_BATCH_SIZE: usize = 16;

// ============================================================================
// WIRE TYPES
// ============================================================================

/// One fact as the LLM reports it (dates arrive as `YYYY-MM-DD` strings)
#[derive(Debug, Deserialize)]
struct RawFact {
    #[serde(default)]
    content: String,
    #[serde(default)]
    start_time: Option<String>,
    #[serde(default)]
    end_time: Option<String>,
    #[serde(default)]
    duration_days: Option<i64>,
    #[serde(default)]
    evidence: Option<String>,
}

// ============================================================================
// EXTRACTOR
// ============================================================================

/// MemCell → semantic memories
pub struct SemanticExtractor {
    chat: Arc<dyn ChatModel>,
    vectorizer: Arc<dyn Vectorizer>,
    batch_semaphore: Arc<Semaphore>,
}

impl SemanticExtractor {
    /// Build an extractor over a chat model and an embedding service
    pub fn new(chat: Arc<dyn ChatModel>, vectorizer: Arc<dyn Vectorizer>) -> Self {
        Self {
            chat,
            vectorizer,
            batch_semaphore: Arc::new(Semaphore::new(DEFAULT_BATCH_CONCURRENCY)),
        }
    }

    /// Extract and embed semantic memories for a cell.
    ///
    /// Oracle failures yield an empty list; embedding failures leave the
    /// affected items without vectors (the sync service skips their vector
    /// writes). The parent cell is never blocked by this extractor.
    pub async fn extract(&self, cell: &MemCell) -> Vec<SemanticMemory> {
        let prompt = self.prompt(cell);
        let response = match self.chat.generate(&prompt).await {
            Ok(text) => text,
            Err(e) => {
                warn!("Semantic extraction failed for {}: {e}", cell.event_id);
                return vec![];
            }
        };

        let Some(raw_facts) = parse_json_block::<Vec<RawFact>>(&response) else {
            warn!("Semantic extraction returned unparseable output for {}", cell.event_id);
            return vec![];
        };

        let mut memories: Vec<SemanticMemory> = raw_facts
            .into_iter()
            .filter(|fact| !fact.content.trim().is_empty())
            .map(|fact| SemanticMemory {
                content: fact.content,
                start_time: fact.start_time.as_deref().and_then(parse_day_start),
                end_time: fact.end_time.as_deref().and_then(parse_day_end),
                duration_days: fact.duration_days,
                source_episode_id: Some(cell.event_id.clone()),
                evidence: fact.evidence,
                embedding: vec![],
            })
            .collect();

        if memories.is_empty() {
            return memories;
        }

        let contents: Vec<String> = memories.iter().map(|m| m.content.clone()).collect();
        match self.embed_all(&contents).await {
            Ok(vectors) => {
                for (memory, vector) in memories.iter_mut().zip(vectors) {
                    memory.embedding = vector;
                }
            }
            Err(e) => {
                warn!("Semantic embedding failed for {}: {e}", cell.event_id);
            }
        }
        memories
    }

    /// Embed contents in parallel batches under the semaphore
    async fn embed_all(
        &self,
        contents: &[String],
    ) -> Result<Vec<Vec<f32>>, crate::providers::ProviderError> {
        let futures = contents.chunks(EMBED_BATCH_SIZE).map(|chunk| {
            let semaphore = Arc::clone(&self.batch_semaphore);
            let vectorizer = Arc::clone(&self.vectorizer);
            let chunk = chunk.to_vec();
            async move {
                let _permit = semaphore.acquire().await;
                vectorizer.embed_batch(&chunk, &EmbedOptions::document()).await
            }
        });
        let batches = futures::future::join_all(futures).await;
        let mut all = Vec::with_capacity(contents.len());
        for batch in batches {
            all.extend(batch?);
        }
        Ok(all)
    }

    fn prompt(&self, cell: &MemCell) -> String {
        let transcript: String = cell
            .original_data
            .iter()
            .map(|m| format!("{}: {}\n", m.sender, m.content))
            .collect();
        format!(
            "Extract durable facts about the participants from this episode. \
             A fact is something worth remembering weeks later (preferences, plans, \
             relationships, life events). Skip small talk.\n\
             Episode summary: {}\n\
             Messages:\n{transcript}\n\
             Answer with a JSON array (possibly empty):\n\
             [{{\"content\": \"...\", \"start_time\": \"YYYY-MM-DD\" or null, \
             \"end_time\": \"YYYY-MM-DD\" or null, \"duration_days\": int or null, \
             \"evidence\": \"short quote\"}}]",
            cell.episode
        )
    }
}

/// Parse a date string as the start of that day (UTC)
fn parse_day_start(s: &str) -> Option<DateTime<Utc>> {
    let date = NaiveDate::parse_from_str(s, "%Y-%m-%d").ok()?;
    Some(date.and_hms_opt(0, 0, 0)?.and_utc())
}

/// Parse a date string as the end of that day (UTC)
fn parse_day_end(s: &str) -> Option<DateTime<Utc>> {
    let date = NaiveDate::parse_from_str(s, "%Y-%m-%d").ok()?;
    Some(date.and_hms_opt(23, 59, 59)?.and_utc())
}

// ============================================================================
// TESTS
// ============================================================================
