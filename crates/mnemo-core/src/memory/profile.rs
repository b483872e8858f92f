//! User profiles, clustering state, and importance evidence
//!
//! Profiles are incremental digests of a user across episodes: explicit
//! information the user stated outright, and implicit traits inferred from
//! behaviour. Each item keeps its evidence and the episodes it came from.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

// ============================================================================
// PROFILE ITEMS
// ============================================================================

/// One profile entry.
///
/// For explicit info `label` is the category (job, family, preference, ...);
/// for implicit traits it is the trait name. `sources` are
/// `"timestamp|episode_id"` strings tying the item to its episodes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct ProfileItem {
    /// Category (explicit) or trait name (implicit)
    #[serde(default, alias = "category", alias = "trait")]
    pub label: String,
    /// The statement itself
    #[serde(default)]
    pub description: String,
    /// Supporting quote or paraphrase
    #[serde(default)]
    pub evidence: String,
    /// `"timestamp|episode_id"` provenance strings
    #[serde(default)]
    pub sources: Vec<String>,
}

impl ProfileItem {
    /// Case-insensitive description key used for dedup and merge-back
    pub fn description_key(&self) -> String {
        self.description.trim().to_lowercase()
    }
}

// ============================================================================
// USER PROFILE
// ============================================================================

/// Per-user running digest (explicit info + implicit traits)
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct UserProfile {
    /// Owning user
    pub user_id: String,
    /// Group the profile was last updated from
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub group_id: Option<String>,
    /// Facts the user stated outright
    #[serde(default)]
    pub explicit_info: Vec<ProfileItem>,
    /// Traits inferred from behaviour
    #[serde(default)]
    pub implicit_traits: Vec<ProfileItem>,
    /// Episodes already folded in; append-only, checked before extraction
    #[serde(default)]
    pub processed_episode_ids: Vec<String>,
    /// Seed lines merged in via the custom-profile endpoint
    #[serde(default)]
    pub initial_profile: Vec<String>,
    /// Last update time
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_updated: Option<DateTime<Utc>>,
}

impl UserProfile {
    /// Empty profile for a user
    pub fn new(user_id: impl Into<String>, group_id: Option<String>) -> Self {
        Self {
            user_id: user_id.into(),
            group_id,
            ..Default::default()
        }
    }

    /// Total item count across both lists (the capacity that compaction bounds)
    pub fn total_items(&self) -> usize {
        self.explicit_info.len() + self.implicit_traits.len()
    }

    /// Whether the episode was already folded into this profile
    pub fn has_processed(&self, episode_id: &str) -> bool {
        self.processed_episode_ids.iter().any(|id| id == episode_id)
    }

    /// Drop exact duplicates by case-insensitive description, keeping the
    /// first occurrence. Run after compaction merge-back.
    pub fn dedup_by_description(&mut self) {
        for list in [&mut self.explicit_info, &mut self.implicit_traits] {
            let mut seen = std::collections::HashSet::new();
            list.retain(|item| {
                let key = item.description_key();
                !key.is_empty() && seen.insert(key)
            });
        }
    }
}

// ============================================================================
// CLUSTER STATE
// ============================================================================

/// Per-group running clustering over episode embeddings.
///
/// Mutated only by the profile manager, persisted atomically per group.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ClusterState {
    /// Episode ids in assignment order
    #[serde(default)]
    pub event_ids: Vec<String>,
    /// Episode timestamps, same order
    #[serde(default)]
    pub timestamps: Vec<DateTime<Utc>>,
    /// Cluster each episode landed in, same order
    #[serde(default)]
    pub cluster_ids: Vec<u32>,
    /// event_id → cluster
    #[serde(default)]
    pub eventid_to_cluster: BTreeMap<String, u32>,
    /// cluster → running centroid
    #[serde(default)]
    pub cluster_centroids: BTreeMap<u32, Vec<f32>>,
    /// cluster → member count
    #[serde(default)]
    pub cluster_counts: BTreeMap<u32, u64>,
    /// cluster → last assignment time
    #[serde(default)]
    pub cluster_last_ts: BTreeMap<u32, DateTime<Utc>>,
    /// Next cluster index to allocate
    #[serde(default)]
    pub next_cluster_idx: u32,
}

impl ClusterState {
    /// Members of a cluster, most recent last
    pub fn members_of(&self, cluster: u32) -> Vec<&str> {
        self.event_ids
            .iter()
            .zip(self.cluster_ids.iter())
            .filter(|(_, c)| **c == cluster)
            .map(|(id, _)| id.as_str())
            .collect()
    }
}

// ============================================================================
// IMPORTANCE EVIDENCE
// ============================================================================

/// Activity counters for one user in one group.
///
/// The retrieval coordinator aggregates these into the group importance
/// score `(speak + refer) / conversations`.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Default)]
pub struct ImportanceEvidence {
    /// Messages the user sent
    pub speak_count: u64,
    /// Times the user was referenced by others
    pub refer_count: u64,
    /// Episodes the user participated in
    pub conversation_count: u64,
}

impl ImportanceEvidence {
    /// `(speak + refer) / conversations`, 0 when the denominator is 0
    pub fn score(&self) -> f64 {
        if self.conversation_count == 0 {
            return 0.0;
        }
        (self.speak_count + self.refer_count) as f64 / self.conversation_count as f64
    }
}

/// Sum importance evidence rows into one group score
pub fn aggregate_importance(rows: &[ImportanceEvidence]) -> f64 {
    let mut total = ImportanceEvidence::default();
    for row in rows {
        total.speak_count += row.speak_count;
        total.refer_count += row.refer_count;
        total.conversation_count += row.conversation_count;
    }
    total.score()
}

// ============================================================================
// TESTS
// ============================================================================
