//! Data model
//!
//! The typed records that flow through the pipeline: raw messages and the
//! window log, the per-group cursor, MemCells and their derived index
//! records, user profiles, and conversation metadata.

mod memcell;
mod message;
mod meta;
mod profile;
mod record;
mod status;

pub use memcell::{EventLog, EventType, MemCell, MemoryNode, SemanticMemory};
pub use message::{RawMessage, Role, SyncStatus, WindowEntry};
pub use meta::{ConversationMeta, Scene};
pub use profile::{
    aggregate_importance, ClusterState, ImportanceEvidence, ProfileItem, UserProfile,
};
pub use record::{child_record_id, parse_child_record_id, EpisodicRecord, RecordKind};
pub use status::ConversationStatus;

/// Magic filter value meaning "do not filter on this field"
pub const MAGIC_ALL: &str = "__all__";

/// Hard cap applied to every fetch/range limit before it reaches an adapter
pub const MAX_FETCH_LIMIT: usize = 500;
