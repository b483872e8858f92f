//! MemCell - the unit of extracted memory
//!
//! A MemCell is the parent record produced when the boundary detector decides
//! a conversational episode has ended. It owns its semantic memories and at
//! most one event log; the flattened records written to the indexes are
//! derived from it (see [`MemCell::derive_nodes`]).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use uuid::Uuid;

use super::message::RawMessage;

// ============================================================================
// EVENT TYPES
// ============================================================================

/// Kind of raw data a MemCell was extracted from
#[non_exhaustive]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum EventType {
    /// Chat conversation (the only kind the ingest pipeline produces today)
    #[default]
    Conversation,
}

impl EventType {
    /// String representation stored with index records
    pub fn as_str(&self) -> &'static str {
        match self {
            EventType::Conversation => "conversation",
        }
    }
}

// ============================================================================
// SEMANTIC MEMORY
// ============================================================================

/// A durable, typically dated fact inferred from an episode
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct SemanticMemory {
    /// The fact text
    pub content: String,
    /// Start of the validity interval (date precision)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start_time: Option<DateTime<Utc>>,
    /// End of the validity interval
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end_time: Option<DateTime<Utc>>,
    /// Length of the validity interval in days, when the LLM provided one
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration_days: Option<i64>,
    /// Episode the fact was inferred from
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_episode_id: Option<String>,
    /// Supporting quote or paraphrase
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub evidence: Option<String>,
    /// Embedding of `content`; filled by the semantic extractor
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub embedding: Vec<f32>,
}

// ============================================================================
// EVENT LOG
// ============================================================================

/// Atomic-fact log of an episode.
///
/// Invariant: `atomic_fact.len() == fact_embeddings.len()` once embedded.
/// The sync service refuses to fan out a log that violates it.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct EventLog {
    /// When the logged events happened
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub time: Option<DateTime<Utc>>,
    /// Single-sentence factoids, in order
    #[serde(default)]
    pub atomic_fact: Vec<String>,
    /// One embedding per fact, same order
    #[serde(default)]
    pub fact_embeddings: Vec<Vec<f32>>,
}

impl EventLog {
    /// Whether facts and embeddings line up one-to-one
    pub fn is_consistent(&self) -> bool {
        self.atomic_fact.len() == self.fact_embeddings.len()
    }
}

// ============================================================================
// MEMCELL
// ============================================================================

/// Parent record of extracted memory for one conversational episode
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemCell {
    /// Opaque parent identity, allocated at extraction
    pub event_id: String,
    /// Kind of source data
    #[serde(rename = "type", default)]
    pub event_type: EventType,
    /// Primary user the cell is attributed to
    pub user_id: String,
    /// All user ids the request named
    #[serde(default)]
    pub user_id_list: Vec<String>,
    /// Conversation group
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub group_id: Option<String>,
    /// Union of senders over the covered messages
    #[serde(default)]
    pub participants: Vec<String>,
    /// Timestamp of the latest covered message
    pub timestamp: DateTime<Utc>,
    /// Short topic line
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subject: Option<String>,
    /// One-sentence episode summary from the boundary detector
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub summary: Option<String>,
    /// Long-form narrative of the episode (the indexed text)
    pub episode: String,
    /// Durable facts inferred from the episode
    #[serde(default)]
    pub semantic_memories: Vec<SemanticMemory>,
    /// Atomic-fact log, when the extractor produced one
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub event_log: Option<EventLog>,
    /// Snapshots of the covered raw messages
    #[serde(default)]
    pub original_data: Vec<RawMessage>,
    /// Free-form extension map; holds the episode embedding under `"embedding"`
    #[serde(default)]
    pub extend: BTreeMap<String, Value>,
}

impl MemCell {
    /// Allocate a fresh MemCell around an episode text
    pub fn new(
        user_id: impl Into<String>,
        group_id: Option<String>,
        participants: Vec<String>,
        timestamp: DateTime<Utc>,
        episode: impl Into<String>,
    ) -> Self {
        Self {
            event_id: Uuid::new_v4().to_string(),
            event_type: EventType::Conversation,
            user_id: user_id.into(),
            user_id_list: Vec::new(),
            group_id,
            participants,
            timestamp,
            subject: None,
            summary: None,
            episode: episode.into(),
            semantic_memories: Vec::new(),
            event_log: None,
            original_data: Vec::new(),
            extend: BTreeMap::new(),
        }
    }

    /// Stash the episode embedding so sync does not recompute it
    pub fn set_episode_embedding(&mut self, embedding: &[f32]) {
        if let Ok(value) = serde_json::to_value(embedding) {
            self.extend.insert("embedding".to_string(), value);
        }
    }

    /// Episode embedding previously stashed under `extend.embedding`
    pub fn episode_embedding(&self) -> Option<Vec<f32>> {
        let value = self.extend.get("embedding")?;
        serde_json::from_value(value.clone()).ok()
    }

    /// Derive the flattened child nodes written to the indexes.
    ///
    /// Order: episode, then semantic memories, then event-log facts; the
    /// ordinals in the derived ids follow this enumeration. An event log
    /// whose facts and embeddings disagree in length yields no nodes for its
    /// kind (the caller logs and skips the whole group).
    pub fn derive_nodes(&self) -> Vec<MemoryNode<'_>> {
        let mut nodes = Vec::new();

        if !self.episode.is_empty() {
            nodes.push(MemoryNode::Episode { cell: self });
        }

        for (ordinal, memory) in self.semantic_memories.iter().enumerate() {
            nodes.push(MemoryNode::Semantic {
                cell: self,
                ordinal,
                memory,
            });
        }

        if let Some(log) = &self.event_log {
            if log.is_consistent() {
                for (ordinal, fact) in log.atomic_fact.iter().enumerate() {
                    nodes.push(MemoryNode::EventLog {
                        cell: self,
                        log,
                        ordinal,
                        fact: fact.as_str(),
                    });
                }
            }
        }

        nodes
    }
}

// ============================================================================
// MEMORY NODE (tagged union over derived records)
// ============================================================================

/// One derived child of a MemCell, about to become an indexed record.
///
/// Parsing into this sum type happens once, at derivation; downstream code
/// never re-inspects dynamic shapes.
#[derive(Debug, Clone)]
pub enum MemoryNode<'a> {
    /// The long-form episode body
    Episode {
        /// Parent cell
        cell: &'a MemCell,
    },
    /// One semantic memory
    Semantic {
        /// Parent cell
        cell: &'a MemCell,
        /// Zero-based position within the semantic memories
        ordinal: usize,
        /// The semantic memory itself
        memory: &'a SemanticMemory,
    },
    /// One atomic fact of the event log
    EventLog {
        /// Parent cell
        cell: &'a MemCell,
        /// The owning log
        log: &'a EventLog,
        /// Zero-based fact position
        ordinal: usize,
        /// The fact text
        fact: &'a str,
    },
}

// ============================================================================
// TESTS
// ============================================================================
