//! Raw messages and the window log
//!
//! A [`RawMessage`] is one chat turn as received on the wire. Messages are
//! immutable once written; the window repository stores them as
//! [`WindowEntry`] with a [`SyncStatus`] lifecycle that only ever advances.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

// ============================================================================
// ROLES
// ============================================================================

/// Speaker role of a chat turn
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    /// A human participant
    #[default]
    User,
    /// The agent side of the conversation
    Assistant,
}

impl Role {
    /// String representation as stored and serialized
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::User => "user",
            Role::Assistant => "assistant",
        }
    }

    /// Parse from the stored string; unknown values default to `User`
    pub fn parse_name(s: &str) -> Self {
        match s {
            "assistant" => Role::Assistant,
            _ => Role::User,
        }
    }
}

// ============================================================================
// MESSAGE REFERENCES
// ============================================================================

/// One entry of `refer_list`.
///
/// The wire format accepts either a bare message id string or an object
/// carrying at least `message_id`. Both collapse to the referenced id.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(untagged)]
enum ReferEntry {
    Id(String),
    Object { message_id: String },
}

impl ReferEntry {
    fn into_id(self) -> String {
        match self {
            ReferEntry::Id(id) => id,
            ReferEntry::Object { message_id } => message_id,
        }
    }
}

/// Deserialize a refer_list of mixed string/object entries into plain ids
fn deserialize_refer_list<'de, D>(deserializer: D) -> Result<Vec<String>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    let entries: Option<Vec<ReferEntry>> = Option::deserialize(deserializer)?;
    Ok(entries
        .unwrap_or_default()
        .into_iter()
        .map(ReferEntry::into_id)
        .collect())
}

// ============================================================================
// RAW MESSAGE
// ============================================================================

/// One chat turn as submitted to the ingest endpoint.
///
/// `(group_id, message_id)` is the dedup key across the whole pipeline.
/// A missing `group_id` means the default/DM conversation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RawMessage {
    /// Unique identifier within its group
    pub message_id: String,
    /// Conversation group; `None` means the default/DM conversation
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub group_id: Option<String>,
    /// Sender user id
    pub sender: String,
    /// Display name of the sender
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sender_name: Option<String>,
    /// Speaker role
    #[serde(default)]
    pub role: Role,
    /// Message text
    pub content: String,
    /// Creation time (RFC 3339 with timezone)
    pub create_time: DateTime<Utc>,
    /// Referenced message ids, in order. Accepts strings or objects on the wire.
    #[serde(default, deserialize_with = "deserialize_refer_list")]
    pub refer_list: Vec<String>,
}

impl RawMessage {
    /// The group key used for locking and storage (`""` for the default group)
    pub fn group_key(&self) -> &str {
        self.group_id.as_deref().unwrap_or("")
    }

    /// Creation time as epoch milliseconds (range-query column)
    pub fn create_time_ms(&self) -> i64 {
        self.create_time.timestamp_millis()
    }
}

// ============================================================================
// SYNC STATUS
// ============================================================================

/// Lifecycle status of a message in the window repository.
///
/// Transitions are strictly monotone: `Log` → `Accumulating` → `Consumed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum SyncStatus {
    /// Received by the HTTP edge, not yet part of a window
    #[default]
    Log,
    /// Accepted into a group's active window
    Accumulating,
    /// Covered by a successfully extracted MemCell
    Consumed,
}

impl SyncStatus {
    /// Integer representation stored in the database
    pub fn as_i64(&self) -> i64 {
        match self {
            SyncStatus::Log => -1,
            SyncStatus::Accumulating => 0,
            SyncStatus::Consumed => 1,
        }
    }

    /// Parse from the stored integer
    pub fn from_i64(v: i64) -> Self {
        match v {
            1 => SyncStatus::Consumed,
            0 => SyncStatus::Accumulating,
            _ => SyncStatus::Log,
        }
    }
}

// ============================================================================
// WINDOW ENTRY
// ============================================================================

/// A raw message persisted in the window repository
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WindowEntry {
    /// The persisted message
    pub message: RawMessage,
    /// Current lifecycle status
    pub sync_status: SyncStatus,
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_refer_list_accepts_strings_and_objects() {
        let json = r#"{
            "message_id": "m1",
            "sender": "alice",
            "content": "see above",
            "create_time": "2025-02-01T10:00:00Z",
            "refer_list": ["m0", {"message_id": "m2", "content": "quoted"}]
        }"#;
        let msg: RawMessage = serde_json::from_str(json).unwrap();
        assert_eq!(msg.refer_list, vec!["m0".to_string(), "m2".to_string()]);
    }

    #[test]
    fn test_missing_optional_fields_default() {
        let json = r#"{
            "message_id": "m1",
            "sender": "alice",
            "content": "hi",
            "create_time": "2025-02-01T10:00:00+08:00"
        }"#;
        let msg: RawMessage = serde_json::from_str(json).unwrap();
        assert!(msg.group_id.is_none());
        assert_eq!(msg.role, Role::User);
        assert!(msg.refer_list.is_empty());
        assert_eq!(msg.group_key(), "");
    }

    #[test]
    fn test_sync_status_roundtrip() {
        for status in [SyncStatus::Log, SyncStatus::Accumulating, SyncStatus::Consumed] {
            assert_eq!(SyncStatus::from_i64(status.as_i64()), status);
        }
    }

    #[test]
    fn test_sync_status_ordering() {
        assert!(SyncStatus::Log < SyncStatus::Accumulating);
        assert!(SyncStatus::Accumulating < SyncStatus::Consumed);
    }
}
