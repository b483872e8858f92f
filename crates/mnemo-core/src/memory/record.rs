//! Flattened index records
//!
//! An [`EpisodicRecord`] is the denormalised view of one derived MemCell
//! child, written identically (minus the vector) to the vector index and the
//! inverted index. Its id is structural: `<parent_event_id>_<kind>_<k>`, so
//! a record can always be traced back to its parent without a join.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

use super::memcell::{MemCell, MemoryNode};

/// Maximum episode prefix carried in `search_content`
const SEARCH_CONTENT_EPISODE_PREFIX: usize = 500;

// ============================================================================
// RECORD KIND
// ============================================================================

/// Kind of a derived record, part of its wire-visible identity
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecordKind {
    /// The long-form episode body
    Episode,
    /// A semantic memory
    SemanticMemory,
    /// An atomic fact of the event log
    EventLog,
}

impl RecordKind {
    /// Id segment used when composing child ids
    pub fn id_segment(&self) -> &'static str {
        match self {
            RecordKind::Episode => "episode",
            RecordKind::SemanticMemory => "semantic",
            RecordKind::EventLog => "eventlog",
        }
    }

    /// The `memory_sub_type` scalar stored with the record
    pub fn as_str(&self) -> &'static str {
        match self {
            RecordKind::Episode => "episode",
            RecordKind::SemanticMemory => "semantic_memory",
            RecordKind::EventLog => "event_log",
        }
    }

    /// Parse from either the id segment or the stored sub-type string
    pub fn parse_name(s: &str) -> Option<Self> {
        match s {
            "episode" => Some(RecordKind::Episode),
            "semantic" | "semantic_memory" => Some(RecordKind::SemanticMemory),
            "eventlog" | "event_log" => Some(RecordKind::EventLog),
            _ => None,
        }
    }
}

/// Compose the structural child id `<parent>_<kind>_<k>`.
///
/// The episode carries no ordinal: there is exactly one per parent.
pub fn child_record_id(parent_event_id: &str, kind: RecordKind, ordinal: usize) -> String {
    match kind {
        RecordKind::Episode => format!("{parent_event_id}_episode"),
        RecordKind::SemanticMemory => format!("{parent_event_id}_semantic_{ordinal}"),
        RecordKind::EventLog => format!("{parent_event_id}_eventlog_{ordinal}"),
    }
}

/// Split a structural child id back into `(parent, kind, ordinal)`
pub fn parse_child_record_id(id: &str) -> Option<(String, RecordKind, usize)> {
    if let Some(parent) = id.strip_suffix("_episode") {
        return Some((parent.to_string(), RecordKind::Episode, 0));
    }
    for (marker, kind) in [
        ("_semantic_", RecordKind::SemanticMemory),
        ("_eventlog_", RecordKind::EventLog),
    ] {
        if let Some(pos) = id.rfind(marker) {
            let parent = &id[..pos];
            let ordinal: usize = id[pos + marker.len()..].parse().ok()?;
            return Some((parent.to_string(), kind, ordinal));
        }
    }
    None
}

// ============================================================================
// EPISODIC RECORD
// ============================================================================

/// Denormalised record written to the vector and inverted indexes
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EpisodicRecord {
    /// Structural id `<parent>_<kind>_<k>`, the primary key in both indexes
    pub record_id: String,
    /// Kind of the record
    pub memory_sub_type: RecordKind,
    /// Source data kind of the parent
    pub event_type: String,
    /// Owning user
    pub user_id: String,
    /// Conversation group of the parent
    pub group_id: Option<String>,
    /// Participants of the parent episode
    pub participants: Vec<String>,
    /// Timestamp of the parent episode
    pub timestamp: DateTime<Utc>,
    /// The indexable text (episode body, fact, or semantic content)
    pub episode: String,
    /// Short strings fed to the keyword index
    pub search_content: Vec<String>,
    /// Parent MemCell id
    pub parent_event_id: String,
    /// Parent cells a hit references (composed results may carry several)
    pub memcell_event_id_list: Vec<String>,
    /// Validity start (semantic memories only), epoch seconds, 0 when absent
    pub start_time: i64,
    /// Validity end, epoch seconds, 0 when absent
    pub end_time: i64,
    /// Free-form metadata carried alongside the scalars
    pub metadata: Value,
    /// Embedding; empty means "skip the vector index"
    pub vector: Vec<f32>,
}

impl EpisodicRecord {
    /// Build the record for one derived node.
    ///
    /// A missing embedding yields an empty `vector`; the sync service writes
    /// such records to the document and inverted stores only.
    pub fn from_node(node: &MemoryNode<'_>) -> Self {
        match node {
            MemoryNode::Episode { cell } => {
                let mut search_content = Vec::new();
                if let Some(subject) = &cell.subject {
                    search_content.push(subject.clone());
                }
                if let Some(summary) = &cell.summary {
                    search_content.push(summary.clone());
                }
                search_content.push(truncate_chars(&cell.episode, SEARCH_CONTENT_EPISODE_PREFIX));

                Self {
                    record_id: child_record_id(&cell.event_id, RecordKind::Episode, 0),
                    memory_sub_type: RecordKind::Episode,
                    event_type: cell.event_type.as_str().to_string(),
                    user_id: cell.user_id.clone(),
                    group_id: cell.group_id.clone(),
                    participants: cell.participants.clone(),
                    timestamp: cell.timestamp,
                    episode: cell.episode.clone(),
                    search_content,
                    parent_event_id: cell.event_id.clone(),
                    memcell_event_id_list: vec![cell.event_id.clone()],
                    start_time: 0,
                    end_time: 0,
                    metadata: json!({
                        "subject": cell.subject,
                        "summary": cell.summary,
                        "participants": cell.participants,
                        "memcell_event_id_list": [cell.event_id],
                    }),
                    vector: cell.episode_embedding().unwrap_or_default(),
                }
            }
            MemoryNode::Semantic { cell, ordinal, memory } => Self {
                record_id: child_record_id(&cell.event_id, RecordKind::SemanticMemory, *ordinal),
                memory_sub_type: RecordKind::SemanticMemory,
                event_type: cell.event_type.as_str().to_string(),
                user_id: cell.user_id.clone(),
                group_id: cell.group_id.clone(),
                participants: cell.participants.clone(),
                timestamp: cell.timestamp,
                episode: memory.content.clone(),
                search_content: vec![memory.content.clone()],
                parent_event_id: cell.event_id.clone(),
                memcell_event_id_list: vec![cell.event_id.clone()],
                start_time: memory.start_time.map(|t| t.timestamp()).unwrap_or(0),
                end_time: memory.end_time.map(|t| t.timestamp()).unwrap_or(0),
                metadata: json!({
                    "duration_days": memory.duration_days,
                    "source_episode_id": memory.source_episode_id,
                    "memcell_event_id_list": [cell.event_id],
                }),
                vector: memory.embedding.clone(),
            },
            MemoryNode::EventLog { cell, log, ordinal, fact } => Self {
                record_id: child_record_id(&cell.event_id, RecordKind::EventLog, *ordinal),
                memory_sub_type: RecordKind::EventLog,
                event_type: cell.event_type.as_str().to_string(),
                user_id: cell.user_id.clone(),
                group_id: cell.group_id.clone(),
                participants: cell.participants.clone(),
                timestamp: cell.timestamp,
                episode: (*fact).to_string(),
                search_content: vec![(*fact).to_string()],
                parent_event_id: cell.event_id.clone(),
                memcell_event_id_list: vec![cell.event_id.clone()],
                start_time: 0,
                end_time: 0,
                metadata: json!({
                    "event_log_time": log.time,
                    "atomic_fact_index": ordinal,
                    "total_atomic_facts": log.atomic_fact.len(),
                    "memcell_event_id_list": [cell.event_id],
                }),
                vector: log.fact_embeddings.get(*ordinal).cloned().unwrap_or_default(),
            },
        }
    }

    /// Derive all records for a MemCell, in id-ordinal order
    pub fn from_memcell(cell: &MemCell) -> Vec<Self> {
        cell.derive_nodes().iter().map(Self::from_node).collect()
    }
}

/// Truncate on a char boundary so multi-byte text never splits mid-codepoint
fn truncate_chars(s: &str, max_chars: usize) -> String {
    s.chars().take(max_chars).collect()
}

// ============================================================================
// TESTS
// ============================================================================
