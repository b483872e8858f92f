//! Incremental profile extraction
//!
//! Updates a user's profile from a new episode plus its topical cluster.
//! The LLM sees the current profile with index numbers and answers with an
//! operation list (`add` / `update` / `delete` / `none`) instead of a full
//! rewrite. Explicit deletes need a reason, and anything the model dropped
//! implicitly is merged back. Episode ids are shortened to `ep1, ep2, ...`
//! in the prompt to cut token use, and mapped back on the way out.

use chrono::{DateTime, SecondsFormat, Utc};
use serde::Deserialize;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;
use tracing::{info, warn};

use crate::memory::{MemCell, ProfileItem, UserProfile};
use crate::providers::ChatModel;

use super::parse_json_block;

/// Default profile capacity
pub const DEFAULT_MAX_ITEMS: usize = 25;

// ============================================================================
// EPISODE DIGEST
// ============================================================================

/// Compact episode view handed to the profile prompts
#[derive(Debug, Clone)]
pub struct EpisodeDigest {
    /// Long episode id (MemCell event id)
    pub id: String,
    /// Episode timestamp
    pub created_at: DateTime<Utc>,
    /// One-sentence summary
    pub summary: String,
    /// Rendered message transcript
    pub transcript: String,
}

impl EpisodeDigest {
    /// Build a digest from a MemCell
    pub fn from_memcell(cell: &MemCell) -> Self {
        let transcript = cell
            .original_data
            .iter()
            .map(|m| format!("{}: {}", m.sender, m.content))
            .collect::<Vec<_>>()
            .join("\n");
        Self {
            id: cell.event_id.clone(),
            created_at: cell.timestamp,
            summary: cell.summary.clone().unwrap_or_default(),
            transcript,
        }
    }
}

// ============================================================================
// ID MAPPING
// ============================================================================

/// Map long episode ids to short labels `ep1, ep2, ...` in first-seen order
pub fn create_id_mapping(long_ids: &[String]) -> BTreeMap<String, String> {
    let mut map = BTreeMap::new();
    let mut next = 1;
    for id in long_ids {
        if id.is_empty() || map.contains_key(id) {
            continue;
        }
        map.insert(id.clone(), format!("ep{next}"));
        next += 1;
    }
    map
}

/// Rewrite one `"timestamp|id"` (or bare id) source through a map
fn map_source(source: &str, map: &HashMap<&str, &str>) -> String {
    let (ts, id) = match source.rsplit_once('|') {
        Some((ts, id)) => (Some(ts), id.trim()),
        None => (None, source.trim()),
    };
    let mapped = map.get(id).copied().unwrap_or(id);
    match ts {
        Some(ts) => format!("{ts}|{mapped}"),
        None => mapped.to_string(),
    }
}

fn map_item_sources(items: &mut [ProfileItem], map: &HashMap<&str, &str>) {
    for item in items {
        for source in &mut item.sources {
            *source = map_source(source, map);
        }
    }
}

// ============================================================================
// OPERATIONS
// ============================================================================

/// Action of one profile operation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum ProfileAction {
    /// Append a new item
    Add,
    /// Merge fields into an existing item
    Update,
    /// Remove an item (requires a reason)
    Delete,
    /// No change
    #[default]
    None,
}

/// Which list an operation targets
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProfileItemKind {
    /// `explicit_info`
    ExplicitInfo,
    /// `implicit_traits`
    ImplicitTraits,
}

/// One operation from the LLM
#[derive(Debug, Deserialize)]
pub struct ProfileOperation {
    /// What to do
    #[serde(default)]
    pub action: ProfileAction,
    /// Target list
    #[serde(rename = "type", default)]
    pub kind: Option<ProfileItemKind>,
    /// Target index for update/delete
    #[serde(default)]
    pub index: Option<usize>,
    /// Payload for add/update
    #[serde(default)]
    pub data: Option<ProfileItem>,
    /// Mandatory justification for delete
    #[serde(default)]
    pub reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct OperationsResponse {
    #[serde(default)]
    operations: Vec<ProfileOperation>,
}

#[derive(Debug, Deserialize)]
struct CompactResponse {
    #[serde(default)]
    explicit_info: Vec<ProfileItem>,
    #[serde(default)]
    implicit_traits: Vec<ProfileItem>,
}

// ============================================================================
// EXTRACTOR
// ============================================================================

/// Operations-based incremental profile extractor
pub struct ProfileLifeExtractor {
    chat: Arc<dyn ChatModel>,
    max_items: usize,
}

impl ProfileLifeExtractor {
    /// Build an extractor with the default capacity
    pub fn new(chat: Arc<dyn ChatModel>) -> Self {
        Self::with_max_items(chat, DEFAULT_MAX_ITEMS)
    }

    /// Build with an explicit capacity; compaction thresholds derive from it
    pub fn with_max_items(chat: Arc<dyn ChatModel>, max_items: usize) -> Self {
        Self {
            chat,
            max_items: max_items.max(1),
        }
    }

    /// Fold a new episode (plus its cluster context) into a user's profile.
    ///
    /// Idempotent per episode: an already-processed episode returns the
    /// profile unchanged. Oracle failures keep the old items; the episode is
    /// still marked processed so replays stay cheap.
    pub async fn extract(
        &self,
        user_id: &str,
        group_id: Option<&str>,
        old_profile: Option<UserProfile>,
        cluster_episodes: &[EpisodeDigest],
        new_episode: &EpisodeDigest,
    ) -> UserProfile {
        let mut profile = old_profile
            .unwrap_or_else(|| UserProfile::new(user_id, group_id.map(str::to_string)));

        if profile.has_processed(&new_episode.id) {
            info!("Episode {} already folded into profile of {user_id}", new_episode.id);
            return profile;
        }

        let mut all_ids: Vec<String> = profile.processed_episode_ids.clone();
        all_ids.extend(cluster_episodes.iter().map(|ep| ep.id.clone()));
        all_ids.push(new_episode.id.clone());
        let id_map = create_id_mapping(&all_ids);
        let id_to_ts = self.timestamp_map(&profile, cluster_episodes, new_episode);

        match self
            .run_update(&profile, cluster_episodes, new_episode, &id_map, &id_to_ts)
            .await
        {
            Some(update) => {
                let old_explicit = std::mem::replace(&mut profile.explicit_info, update.explicit);
                let old_implicit = std::mem::replace(&mut profile.implicit_traits, update.implicit);
                merge_back_dropped(&mut profile.explicit_info, &old_explicit, &update.deleted_keys);
                merge_back_dropped(&mut profile.implicit_traits, &old_implicit, &update.deleted_keys);
                profile.last_updated = Some(Utc::now());
            }
            None => {
                warn!("Profile update produced no usable operations for {user_id}");
            }
        }

        profile.processed_episode_ids.push(new_episode.id.clone());

        let compact_threshold = self.max_items * 3 / 2;
        if profile.total_items() > compact_threshold {
            let target = self.max_items * 7 / 10;
            info!(
                "Profile of {user_id} has {} items (threshold {compact_threshold}), compacting to {target}",
                profile.total_items()
            );
            self.compact(&mut profile, target, &id_map).await;
        }
        profile.dedup_by_description();
        profile
    }

    /// Run the operations pass; returns the updated item lists
    async fn run_update(
        &self,
        profile: &UserProfile,
        cluster_episodes: &[EpisodeDigest],
        new_episode: &EpisodeDigest,
        id_map: &BTreeMap<String, String>,
        id_to_ts: &HashMap<String, String>,
    ) -> Option<ProfileUpdate> {
        let shorten: HashMap<&str, &str> = id_map
            .iter()
            .map(|(long, short)| (long.as_str(), short.as_str()))
            .collect();
        let lengthen: HashMap<&str, &str> = id_map
            .iter()
            .map(|(long, short)| (short.as_str(), long.as_str()))
            .collect();

        let mut prompt_explicit = profile.explicit_info.clone();
        let mut prompt_implicit = profile.implicit_traits.clone();
        map_item_sources(&mut prompt_explicit, &shorten);
        map_item_sources(&mut prompt_implicit, &shorten);

        let prompt = self.update_prompt(
            &prompt_explicit,
            &prompt_implicit,
            cluster_episodes,
            new_episode,
            id_map,
        );
        let response = match self.chat.generate(&prompt).await {
            Ok(text) => text,
            Err(e) => {
                warn!("Profile update oracle failed: {e}");
                return None;
            }
        };
        let parsed: OperationsResponse = parse_json_block(&response)?;

        let mut explicit = profile.explicit_info.clone();
        let mut implicit = profile.implicit_traits.clone();
        let mut deleted_keys = HashSet::new();

        for op in parsed.operations {
            let Some(kind) = op.kind else { continue };
            let target = match kind {
                ProfileItemKind::ExplicitInfo => &mut explicit,
                ProfileItemKind::ImplicitTraits => &mut implicit,
            };
            match op.action {
                ProfileAction::None => {}
                ProfileAction::Add => {
                    let Some(mut data) = op.data else { continue };
                    if data.description.trim().is_empty() {
                        continue;
                    }
                    data.sources = data
                        .sources
                        .iter()
                        .map(|s| attach_timestamp(&map_source(s, &lengthen), id_to_ts))
                        .collect();
                    target.push(data);
                }
                ProfileAction::Update => {
                    let Some(index) = op.index else { continue };
                    let Some(data) = op.data else { continue };
                    // unknown indices are ignored
                    let Some(existing) = target.get_mut(index) else { continue };
                    if !data.label.trim().is_empty() {
                        existing.label = data.label;
                    }
                    if !data.description.trim().is_empty() {
                        existing.description = data.description;
                    }
                    if !data.evidence.trim().is_empty() {
                        existing.evidence = data.evidence;
                    }
                    if !data.sources.is_empty() {
                        let mut merged: Vec<String> = existing.sources.clone();
                        for source in data.sources {
                            let mapped =
                                attach_timestamp(&map_source(&source, &lengthen), id_to_ts);
                            if !merged.contains(&mapped) {
                                merged.push(mapped);
                            }
                        }
                        existing.sources = merged;
                    }
                }
                ProfileAction::Delete => {
                    let Some(index) = op.index else { continue };
                    let reason = op.reason.unwrap_or_default();
                    if reason.trim().is_empty() || index >= target.len() {
                        continue;
                    }
                    let removed = target.remove(index);
                    warn!("Profile item deleted ({}): {}", reason, removed.description);
                    deleted_keys.insert(removed.description_key());
                }
            }
        }

        Some(ProfileUpdate {
            explicit,
            implicit,
            deleted_keys,
        })
    }

    /// LLM-driven compaction down to `target` items
    async fn compact(
        &self,
        profile: &mut UserProfile,
        target: usize,
        id_map: &BTreeMap<String, String>,
    ) {
        let shorten: HashMap<&str, &str> = id_map
            .iter()
            .map(|(long, short)| (long.as_str(), short.as_str()))
            .collect();
        let lengthen: HashMap<&str, &str> = id_map
            .iter()
            .map(|(long, short)| (short.as_str(), long.as_str()))
            .collect();

        let mut prompt_explicit = profile.explicit_info.clone();
        let mut prompt_implicit = profile.implicit_traits.clone();
        map_item_sources(&mut prompt_explicit, &shorten);
        map_item_sources(&mut prompt_implicit, &shorten);

        let prompt = format!(
            "This user profile has {} items; condense it to at most {target} items by \
             merging overlapping entries and dropping the least informative ones. \
             Keep the `evidence` and `sources` fields of everything you keep.\n\
             {}\n\
             Answer with JSON only:\n\
             {{\"explicit_info\": [{{\"category\": \"...\", \"description\": \"...\", \
             \"evidence\": \"...\", \"sources\": [\"...\"]}}], \
             \"implicit_traits\": [{{\"trait\": \"...\", \"description\": \"...\", \
             \"evidence\": \"...\", \"sources\": [\"...\"]}}]}}",
            profile.total_items(),
            render_profile(&prompt_explicit, &prompt_implicit),
        );

        let response = match self.chat.generate(&prompt).await {
            Ok(text) => text,
            Err(e) => {
                warn!("Profile compaction oracle failed: {e}; keeping profile as-is");
                return;
            }
        };
        let Some(mut parsed) = parse_json_block::<CompactResponse>(&response) else {
            warn!("Profile compaction returned unparseable output; keeping profile as-is");
            return;
        };

        parsed.explicit_info.retain(|item| !item.description.trim().is_empty());
        parsed.implicit_traits.retain(|item| !item.description.trim().is_empty());
        map_item_sources(&mut parsed.explicit_info, &lengthen);
        map_item_sources(&mut parsed.implicit_traits, &lengthen);
        profile.explicit_info = parsed.explicit_info;
        profile.implicit_traits = parsed.implicit_traits;
        profile.last_updated = Some(Utc::now());
    }

    /// episode_id → timestamp strings, from old sources and current episodes
    fn timestamp_map(
        &self,
        profile: &UserProfile,
        cluster_episodes: &[EpisodeDigest],
        new_episode: &EpisodeDigest,
    ) -> HashMap<String, String> {
        let mut map = HashMap::new();
        for item in profile.explicit_info.iter().chain(profile.implicit_traits.iter()) {
            for source in &item.sources {
                if let Some((ts, id)) = source.rsplit_once('|') {
                    map.insert(id.trim().to_string(), ts.trim().to_string());
                }
            }
        }
        for ep in cluster_episodes.iter().chain(std::iter::once(new_episode)) {
            map.insert(
                ep.id.clone(),
                ep.created_at.to_rfc3339_opts(SecondsFormat::Secs, true),
            );
        }
        map
    }

    fn update_prompt(
        &self,
        explicit: &[ProfileItem],
        implicit: &[ProfileItem],
        cluster_episodes: &[EpisodeDigest],
        new_episode: &EpisodeDigest,
        id_map: &BTreeMap<String, String>,
    ) -> String {
        let profile_text = render_profile(explicit, implicit);
        let profile_text = if profile_text.is_empty() {
            "(Empty, no records yet)".to_string()
        } else {
            profile_text
        };

        let mut conversations = String::new();
        for ep in cluster_episodes.iter().chain(std::iter::once(new_episode)) {
            let short = id_map.get(&ep.id).cloned().unwrap_or_else(|| ep.id.clone());
            conversations.push_str(&format!(
                "--- {short} at {} ---\nSummary: {}\n{}\n",
                ep.created_at.to_rfc3339_opts(SecondsFormat::Secs, true),
                ep.summary,
                ep.transcript,
            ));
        }

        format!(
            "You maintain a user profile from conversations.\n\
             Current profile (indexed):\n{profile_text}\n\n\
             Conversations (the last one is new):\n{conversations}\n\
             Answer with JSON operations against the indexed profile:\n\
             {{\"operations\": [{{\"action\": \"add|update|delete|none\", \
             \"type\": \"explicit_info|implicit_traits\", \"index\": <int, for update/delete>, \
             \"data\": {{\"category\": \"...\", \"description\": \"...\", \"evidence\": \"...\", \
             \"sources\": [\"ep id\"]}}, \"reason\": \"required for delete\"}}]}}\n\
             Only record durable information. Use `none` when nothing changed."
        )
    }
}

/// Format the indexed profile for prompts
fn render_profile(explicit: &[ProfileItem], implicit: &[ProfileItem]) -> String {
    let mut lines = Vec::new();
    if !explicit.is_empty() {
        lines.push("[Explicit Info]".to_string());
        for (i, item) in explicit.iter().enumerate() {
            lines.push(format!("  [{i}] [{}] {}", item.label, item.description));
            if !item.evidence.is_empty() {
                lines.push(format!("      evidence: {}", item.evidence));
            }
        }
    }
    if !implicit.is_empty() {
        lines.push("[Implicit Traits]".to_string());
        for (i, item) in implicit.iter().enumerate() {
            lines.push(format!("  [{i}] {}: {}", item.label, item.description));
            if !item.evidence.is_empty() {
                lines.push(format!("      evidence: {}", item.evidence));
            }
        }
    }
    lines.join("\n")
}

/// Attach a timestamp to a bare-source string when one is known
fn attach_timestamp(source: &str, id_to_ts: &HashMap<String, String>) -> String {
    if source.contains('|') || source.is_empty() {
        return source.to_string();
    }
    match id_to_ts.get(source.trim()) {
        Some(ts) => format!("{ts}|{}", source.trim()),
        None => source.to_string(),
    }
}

/// Result of one operations pass
struct ProfileUpdate {
    explicit: Vec<ProfileItem>,
    implicit: Vec<ProfileItem>,
    /// description keys removed by an explicit, reasoned delete
    deleted_keys: HashSet<String>,
}

/// Restore old items absent from the new list by case-insensitive
/// description match; the LLM is not trusted to delete implicitly. Keys in
/// `explicitly_deleted` stay gone.
fn merge_back_dropped(
    new_items: &mut Vec<ProfileItem>,
    old_items: &[ProfileItem],
    explicitly_deleted: &HashSet<String>,
) {
    let kept: HashSet<String> = new_items.iter().map(ProfileItem::description_key).collect();
    for item in old_items {
        let key = item.description_key();
        if key.is_empty() || kept.contains(&key) || explicitly_deleted.contains(&key) {
            continue;
        }
        warn!("Recovered implicitly dropped profile item: {}", item.description);
        new_items.push(item.clone());
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::providers::{ProviderError, ProviderResult};
    use async_trait::async_trait;
    use std::sync::Mutex;

    struct ScriptedChat(Mutex<Vec<ProviderResult<String>>>);

    impl ScriptedChat {
        fn new(responses: Vec<&str>) -> Arc<Self> {
            Arc::new(Self(Mutex::new(
                responses.into_iter().map(|s| Ok(s.to_string())).collect(),
            )))
        }
    }

    #[async_trait]
    impl ChatModel for ScriptedChat {
        async fn generate(&self, _prompt: &str) -> ProviderResult<String> {
            let mut responses = self.0.lock().unwrap();
            if responses.is_empty() {
                Err(ProviderError::Timeout)
            } else {
                Ok(responses.remove(0).unwrap())
            }
        }
    }

    fn digest(id: &str, secs: i64) -> EpisodeDigest {
        EpisodeDigest {
            id: id.to_string(),
            created_at: DateTime::from_timestamp(secs, 0).unwrap(),
            summary: "summary".to_string(),
            transcript: "alice: hi".to_string(),
        }
    }

    #[test]
    fn test_id_mapping_is_stable_and_dedups() {
        let ids = vec!["long-a".to_string(), "long-b".to_string(), "long-a".to_string()];
        let map = create_id_mapping(&ids);
        assert_eq!(map.len(), 2);
        assert_eq!(map["long-a"], "ep1");
        assert_eq!(map["long-b"], "ep2");
    }

    #[test]
    fn test_map_source_keeps_timestamp() {
        let map: HashMap<&str, &str> = [("long-a", "ep1")].into_iter().collect();
        assert_eq!(map_source("2025-01-01T00:00:00Z|long-a", &map), "2025-01-01T00:00:00Z|ep1");
        assert_eq!(map_source("long-a", &map), "ep1");
        assert_eq!(map_source("unknown", &map), "unknown");
    }

    #[tokio::test]
    async fn test_add_operation_appends_with_sources() {
        let chat = ScriptedChat::new(vec![
            r#"{"operations": [{"action": "add", "type": "explicit_info",
                "data": {"category": "job", "description": "Works as a nurse",
                         "evidence": "said so", "sources": ["ep1"]}}]}"#,
        ]);
        let extractor = ProfileLifeExtractor::new(chat);
        let new_ep = digest("long-episode-1", 1000);

        let profile = extractor.extract("u1", Some("g1"), None, &[], &new_ep).await;
        assert_eq!(profile.explicit_info.len(), 1);
        let item = &profile.explicit_info[0];
        assert_eq!(item.label, "job");
        // short id mapped back to the long id, timestamp attached
        assert!(item.sources[0].ends_with("|long-episode-1"));
        assert!(profile.has_processed("long-episode-1"));
    }

    #[tokio::test]
    async fn test_delete_requires_reason() {
        let old = {
            let mut p = UserProfile::new("u1", None);
            p.explicit_info.push(ProfileItem {
                label: "job".into(),
                description: "nurse".into(),
                ..Default::default()
            });
            p.explicit_info.push(ProfileItem {
                label: "home".into(),
                description: "lives in Lyon".into(),
                ..Default::default()
            });
            p
        };
        let chat = ScriptedChat::new(vec![
            r#"{"operations": [
                {"action": "delete", "type": "explicit_info", "index": 0},
                {"action": "delete", "type": "explicit_info", "index": 1,
                 "reason": "user moved away"}]}"#,
        ]);
        let extractor = ProfileLifeExtractor::new(chat);
        let profile = extractor
            .extract("u1", None, Some(old), &[], &digest("ep-x", 10))
            .await;
        // reasonless delete ignored; reasoned delete applied
        assert_eq!(profile.explicit_info.len(), 1);
        assert_eq!(profile.explicit_info[0].description, "nurse");
    }

    #[tokio::test]
    async fn test_update_merges_fields_and_ignores_unknown_index() {
        let old = {
            let mut p = UserProfile::new("u1", None);
            p.implicit_traits.push(ProfileItem {
                label: "curious".into(),
                description: "asks questions".into(),
                evidence: "old evidence".into(),
                sources: vec!["t0|ep-old".into()],
            });
            p
        };
        let chat = ScriptedChat::new(vec![
            r#"{"operations": [
                {"action": "update", "type": "implicit_traits", "index": 0,
                 "data": {"description": "asks deep follow-up questions", "sources": ["ep1"]}},
                {"action": "update", "type": "implicit_traits", "index": 9,
                 "data": {"description": "ghost"}}]}"#,
        ]);
        let extractor = ProfileLifeExtractor::new(chat);
        let profile = extractor
            .extract("u1", None, Some(old), &[], &digest("ep-new", 10))
            .await;
        assert_eq!(profile.implicit_traits.len(), 1);
        let item = &profile.implicit_traits[0];
        assert_eq!(item.description, "asks deep follow-up questions");
        assert_eq!(item.evidence, "old evidence");
        assert_eq!(item.sources.len(), 2);
    }

    #[tokio::test]
    async fn test_processed_episode_is_skipped() {
        let mut old = UserProfile::new("u1", None);
        old.processed_episode_ids.push("ep-seen".into());
        // the oracle must not be consulted for an already-processed episode
        let chat = ScriptedChat::new(vec![]);
        let extractor = ProfileLifeExtractor::new(chat);
        let profile = extractor
            .extract("u1", None, Some(old), &[], &digest("ep-seen", 10))
            .await;
        assert_eq!(profile.processed_episode_ids, vec!["ep-seen".to_string()]);
    }

    #[tokio::test]
    async fn test_oracle_failure_keeps_items_and_marks_processed() {
        let mut old = UserProfile::new("u1", None);
        old.explicit_info.push(ProfileItem {
            description: "nurse".into(),
            ..Default::default()
        });
        let chat = ScriptedChat::new(vec![]);
        let extractor = ProfileLifeExtractor::new(chat);
        let profile = extractor
            .extract("u1", None, Some(old), &[], &digest("ep-a", 10))
            .await;
        assert_eq!(profile.explicit_info.len(), 1);
        assert!(profile.has_processed("ep-a"));
    }

    #[tokio::test]
    async fn test_compaction_triggers_above_threshold() {
        let mut old = UserProfile::new("u1", None);
        for i in 0..8 {
            old.explicit_info.push(ProfileItem {
                label: "misc".into(),
                description: format!("fact number {i}"),
                ..Default::default()
            });
        }
        // max_items=4 → threshold 6, target 2
        let chat = ScriptedChat::new(vec![
            r#"{"operations": []}"#,
            r#"{"explicit_info": [
                {"category": "misc", "description": "merged fact", "evidence": "", "sources": []}],
                "implicit_traits": []}"#,
        ]);
        let extractor = ProfileLifeExtractor::with_max_items(chat, 4);
        let profile = extractor
            .extract("u1", None, Some(old), &[], &digest("ep-b", 10))
            .await;
        assert_eq!(profile.total_items(), 1);
        assert_eq!(profile.explicit_info[0].description, "merged fact");
    }
}
