//! Conversation metadata
//!
//! Per-group configuration records. A single record with `group_id = None`
//! acts as the default fallback returned when no group-specific record
//! exists.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

// ============================================================================
// SCENE
// ============================================================================

/// Conversation scene, a closed set
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum Scene {
    /// Multi-party group chat
    #[default]
    GroupChat,
    /// One-on-one assistant conversation
    Assistant,
}

impl Scene {
    /// String form stored and serialized
    pub fn as_str(&self) -> &'static str {
        match self {
            Scene::GroupChat => "group_chat",
            Scene::Assistant => "assistant",
        }
    }

    /// Parse from the stored string; unknown values are rejected
    pub fn parse_name(s: &str) -> Option<Self> {
        match s {
            "group_chat" => Some(Scene::GroupChat),
            "assistant" => Some(Scene::Assistant),
            _ => None,
        }
    }
}

// ============================================================================
// CONVERSATION META
// ============================================================================

/// Per-group configuration record
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConversationMeta {
    /// Group the record configures; `None` is the default-fallback record
    #[serde(default)]
    pub group_id: Option<String>,
    /// Conversation scene
    #[serde(default)]
    pub scene: Scene,
    /// Display name
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    /// Free-form description
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// Scene-specific description fed to prompts
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scene_desc: Option<String>,
    /// Per-user details (display names, roles, ...)
    #[serde(default)]
    pub user_details: BTreeMap<String, Value>,
    /// Tags
    #[serde(default)]
    pub tags: Vec<String>,
    /// IANA timezone applied when messages omit one
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default_timezone: Option<String>,
    /// Format version of the record
    #[serde(default = "default_meta_version")]
    pub version: String,
    /// Creation time
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_at: Option<DateTime<Utc>>,
    /// Last update time
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<DateTime<Utc>>,
}

fn default_meta_version() -> String {
    "1.0".to_string()
}

impl Default for ConversationMeta {
    fn default() -> Self {
        Self {
            group_id: None,
            scene: Scene::GroupChat,
            name: None,
            description: None,
            scene_desc: None,
            user_details: BTreeMap::new(),
            tags: Vec::new(),
            default_timezone: None,
            version: default_meta_version(),
            created_at: None,
            updated_at: None,
        }
    }
}

// ============================================================================
// TESTS
// ============================================================================
