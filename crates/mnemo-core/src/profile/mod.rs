//! Profile manager
//!
//! Runs after a MemCell is emitted, still under the group lock. Assigns the
//! new episode to a topical cluster (cosine similarity over running
//! centroids), gathers the cluster's recent episodes as context, and folds
//! the episode into each participant's profile through the operations-based
//! extractor.

use std::sync::Arc;
use tracing::{debug, warn};

use crate::error::Result;
use crate::extract::{EpisodeDigest, ProfileLifeExtractor};
use crate::memory::{ClusterState, MemCell};
use crate::storage::DocumentStore;

/// Minimum cosine similarity to join an existing cluster
pub const DEFAULT_CLUSTER_THRESHOLD: f32 = 0.60;

/// How many recent cluster episodes are given to the extractor as context
pub const DEFAULT_CLUSTER_CONTEXT: usize = 5;

// ============================================================================
// PROFILE MANAGER
// ============================================================================

/// Incremental per-user profile updates with episode clustering
pub struct ProfileManager {
    store: Arc<DocumentStore>,
    extractor: ProfileLifeExtractor,
    cluster_threshold: f32,
    cluster_context: usize,
}

impl ProfileManager {
    /// Build a manager with default clustering parameters
    pub fn new(store: Arc<DocumentStore>, extractor: ProfileLifeExtractor) -> Self {
        Self {
            store,
            extractor,
            cluster_threshold: DEFAULT_CLUSTER_THRESHOLD,
            cluster_context: DEFAULT_CLUSTER_CONTEXT,
        }
    }

    /// Fold an emitted MemCell into the profiles of its participants.
    ///
    /// Caller holds the group lock; cluster state is persisted atomically
    /// per group before the per-user extraction starts.
    pub async fn update_for_memcell(&self, cell: &MemCell) -> Result<()> {
        let group_id = cell.group_id.as_deref().unwrap_or("");

        let mut state = self
            .store
            .get_cluster_state(group_id)?
            .unwrap_or_default();
        let cluster = self.assign_cluster(&mut state, cell);
        self.store.put_cluster_state(group_id, &state)?;

        let context = self.cluster_context_digests(&state, cluster, &cell.event_id)?;
        let new_episode = EpisodeDigest::from_memcell(cell);

        for user_id in &cell.participants {
            let old_profile = self.store.get_profile(user_id)?;
            if old_profile
                .as_ref()
                .is_some_and(|p| p.has_processed(&cell.event_id))
            {
                continue;
            }
            let profile = self
                .extractor
                .extract(user_id, cell.group_id.as_deref(), old_profile, &context, &new_episode)
                .await;
            self.store.put_profile(&profile)?;
        }
        Ok(())
    }

    /// Assign the episode to the nearest cluster or open a new one
    fn assign_cluster(&self, state: &mut ClusterState, cell: &MemCell) -> u32 {
        let embedding = cell.episode_embedding();

        let chosen = match &embedding {
            Some(vector) => {
                let mut best: Option<(u32, f32)> = None;
                for (cluster, centroid) in &state.cluster_centroids {
                    let similarity = cosine_similarity(vector, centroid);
                    if similarity >= self.cluster_threshold
                        && best.is_none_or(|(_, s)| similarity > s)
                    {
                        best = Some((*cluster, similarity));
                    }
                }
                best.map(|(cluster, _)| cluster)
            }
            None => None,
        };

        let cluster = chosen.unwrap_or_else(|| {
            let cluster = state.next_cluster_idx;
            state.next_cluster_idx += 1;
            cluster
        });

        state.event_ids.push(cell.event_id.clone());
        state.timestamps.push(cell.timestamp);
        state.cluster_ids.push(cluster);
        state
            .eventid_to_cluster
            .insert(cell.event_id.clone(), cluster);
        let count = state.cluster_counts.entry(cluster).or_insert(0);

        if let Some(vector) = &embedding {
            match state.cluster_centroids.get_mut(&cluster) {
                Some(centroid) if centroid.len() == vector.len() => {
                    // running mean over the cluster members
                    let n = *count as f32;
                    for (c, v) in centroid.iter_mut().zip(vector) {
                        *c = (*c * n + v) / (n + 1.0);
                    }
                }
                _ => {
                    state.cluster_centroids.insert(cluster, vector.clone());
                }
            }
        }
        *count += 1;
        state.cluster_last_ts.insert(cluster, cell.timestamp);

        debug!("Episode {} assigned to cluster {cluster}", cell.event_id);
        cluster
    }

    /// Most recent cluster members as digests, the new episode excluded
    fn cluster_context_digests(
        &self,
        state: &ClusterState,
        cluster: u32,
        exclude_event_id: &str,
    ) -> Result<Vec<EpisodeDigest>> {
        let member_ids: Vec<&str> = state
            .members_of(cluster)
            .into_iter()
            .filter(|id| *id != exclude_event_id)
            .collect();
        let recent = member_ids
            .iter()
            .rev()
            .take(self.cluster_context)
            .rev();

        let mut digests = Vec::new();
        for event_id in recent {
            match self.store.get_memcell(event_id)? {
                Some(cell) => digests.push(EpisodeDigest::from_memcell(&cell)),
                None => warn!("Cluster member {event_id} not found in the document store"),
            }
        }
        Ok(digests)
    }
}

/// Cosine similarity between two vectors
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() {
        return 0.0;
    }
    let mut dot = 0.0_f32;
    let mut norm_a = 0.0_f32;
    let mut norm_b = 0.0_f32;
    for (x, y) in a.iter().zip(b.iter()) {
        dot += x * y;
        norm_a += x * x;
        norm_b += y * y;
    }
    let denominator = (norm_a * norm_b).sqrt();
    if denominator > 0.0 { dot / denominator } else { 0.0 }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::providers::{ChatModel, ProviderError, ProviderResult};
    use async_trait::async_trait;
    use chrono::Utc;
    use tempfile::TempDir;

    struct SilentChat;

    #[async_trait]
    impl ChatModel for SilentChat {
        async fn generate(&self, _prompt: &str) -> ProviderResult<String> {
            Err(ProviderError::Timeout)
        }
    }

    fn manager() -> (ProfileManager, TempDir) {
        let dir = TempDir::new().unwrap();
        let store = Arc::new(DocumentStore::open(Some(dir.path().join("p.db"))).unwrap());
        let extractor = ProfileLifeExtractor::new(Arc::new(SilentChat));
        (ProfileManager::new(store, extractor), dir)
    }

    fn cell_with_embedding(seed: f32) -> MemCell {
        let mut cell = MemCell::new("u1", Some("g1".into()), vec!["u1".into()], Utc::now(), "ep");
        let vector: Vec<f32> = (0..8).map(|i| ((i as f32 + seed) / 8.0).sin()).collect();
        cell.set_episode_embedding(&vector);
        cell
    }

    #[test]
    fn test_cosine_similarity_bounds() {
        let a = vec![1.0, 0.0];
        assert!((cosine_similarity(&a, &a) - 1.0).abs() < 1e-6);
        assert!(cosine_similarity(&a, &[0.0, 1.0]).abs() < 1e-6);
        assert_eq!(cosine_similarity(&a, &[1.0]), 0.0);
    }

    #[test]
    fn test_similar_episodes_share_a_cluster() {
        let (manager, _dir) = manager();
        let mut state = ClusterState::default();

        let first = cell_with_embedding(1.0);
        let near = cell_with_embedding(1.001);
        let far = {
            let mut c = cell_with_embedding(0.0);
            c.set_episode_embedding(&[-1.0, 1.0, -1.0, 1.0, -1.0, 1.0, -1.0, 1.0]);
            c
        };

        let c1 = manager.assign_cluster(&mut state, &first);
        let c2 = manager.assign_cluster(&mut state, &near);
        let c3 = manager.assign_cluster(&mut state, &far);

        assert_eq!(c1, c2);
        assert_ne!(c1, c3);
        assert_eq!(state.cluster_counts[&c1], 2);
        assert_eq!(state.event_ids.len(), 3);
    }

    #[test]
    fn test_missing_embedding_opens_new_cluster() {
        let (manager, _dir) = manager();
        let mut state = ClusterState::default();
        let cell = MemCell::new("u1", Some("g1".into()), vec![], Utc::now(), "ep");
        let cluster = manager.assign_cluster(&mut state, &cell);
        assert_eq!(cluster, 0);
        assert_eq!(state.next_cluster_idx, 1);
        assert!(state.cluster_centroids.is_empty());
    }

    #[tokio::test]
    async fn test_update_persists_cluster_state_and_profiles() {
        let (manager, _dir) = manager();
        let cell = cell_with_embedding(2.0);
        manager.update_for_memcell(&cell).await.unwrap();

        let state = manager.store.get_cluster_state("g1").unwrap().unwrap();
        assert_eq!(state.event_ids, vec![cell.event_id.clone()]);

        // extractor oracle fails, but the profile is still persisted with
        // the episode marked processed
        let profile = manager.store.get_profile("u1").unwrap().unwrap();
        assert!(profile.has_processed(&cell.event_id));
    }
}
