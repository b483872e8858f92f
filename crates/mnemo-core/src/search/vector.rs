//! Vector Index
//!
//! HNSW approximate nearest neighbor index over episodic records, built on
//! USearch with cosine similarity. Scalar fields live in a sidecar map keyed
//! by record id; filtered searches over-fetch from the ANN index and
//! post-filter on the scalars.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use usearch::{Index, IndexOptions, MetricKind, ScalarKind};

use crate::filter::ScopeFilter;
use crate::memory::EpisodicRecord;

// ============================================================================
// CONSTANTS
// ============================================================================

/// Default embedding dimensions (Qwen3-Embedding family)
pub const DEFAULT_DIMENSIONS: usize = 1024;

/// HNSW connectivity parameter (higher = better recall, more memory)
pub const DEFAULT_CONNECTIVITY: usize = 16;

/// HNSW expansion factor for index building
pub const DEFAULT_EXPANSION_ADD: usize = 128;

/// HNSW expansion factor for search
pub const DEFAULT_EXPANSION_SEARCH: usize = 64;

/// Over-fetch multiplier applied before scalar post-filtering
const FILTER_OVERFETCH: usize = 4;

// ============================================================================
// ERROR TYPES
// ============================================================================

/// Vector index error types
#[non_exhaustive]
#[derive(Debug, thiserror::Error)]
pub enum VectorIndexError {
    /// Failed to create the index
    #[error("Index creation failed: {0}")]
    IndexCreation(String),
    /// Failed to add a vector
    #[error("Failed to add vector: {0}")]
    IndexAdd(String),
    /// Search failed
    #[error("Search failed: {0}")]
    IndexSearch(String),
    /// Persistence failed
    #[error("Persistence failed: {0}")]
    IndexPersistence(String),
    /// Dimension mismatch
    #[error("Invalid dimensions: expected {0}, got {1}")]
    InvalidDimensions(usize, usize),
}

/// Vector index result type
pub type Result<T> = std::result::Result<T, VectorIndexError>;

// ============================================================================
// CONFIGURATION
// ============================================================================

/// Configuration for the vector index
#[derive(Debug, Clone)]
pub struct VectorIndexConfig {
    /// Number of dimensions
    pub dimensions: usize,
    /// HNSW connectivity parameter
    pub connectivity: usize,
    /// Expansion factor for adding vectors
    pub expansion_add: usize,
    /// Expansion factor for searching
    pub expansion_search: usize,
}

impl Default for VectorIndexConfig {
    fn default() -> Self {
        Self {
            dimensions: DEFAULT_DIMENSIONS,
            connectivity: DEFAULT_CONNECTIVITY,
            expansion_add: DEFAULT_EXPANSION_ADD,
            expansion_search: DEFAULT_EXPANSION_SEARCH,
        }
    }
}

// ============================================================================
// ENTRIES AND HITS
// ============================================================================

/// Scalar fields stored alongside each vector
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct VectorEntry {
    /// Structural record id (primary key)
    pub record_id: String,
    /// Owning user
    pub user_id: String,
    /// Conversation group
    pub group_id: Option<String>,
    /// Participants of the parent episode
    pub participants: Vec<String>,
    /// Record timestamp, epoch milliseconds
    pub timestamp_ms: i64,
    /// Record kind (`episode` / `semantic_memory` / `event_log`)
    pub memory_sub_type: String,
    /// Source data kind
    pub event_type: String,
    /// Parent MemCell id
    pub parent_event_id: String,
    /// Parent cells the record references
    pub memcell_event_id_list: Vec<String>,
    /// Metadata JSON string
    pub metadata: String,
    /// Keyword snippets carried for parity with the inverted index
    pub search_content: Vec<String>,
    /// Validity start, epoch seconds, 0 when absent
    pub start_time: i64,
    /// Validity end, epoch seconds, 0 when absent
    pub end_time: i64,
    /// Indexed text (used for reranking)
    pub episode: String,
}

impl VectorEntry {
    /// Build the scalar entry for a derived record
    pub fn from_record(record: &EpisodicRecord) -> Self {
        Self {
            record_id: record.record_id.clone(),
            user_id: record.user_id.clone(),
            group_id: record.group_id.clone(),
            participants: record.participants.clone(),
            timestamp_ms: record.timestamp.timestamp_millis(),
            memory_sub_type: record.memory_sub_type.as_str().to_string(),
            event_type: record.event_type.clone(),
            parent_event_id: record.parent_event_id.clone(),
            memcell_event_id_list: record.memcell_event_id_list.clone(),
            metadata: record.metadata.to_string(),
            search_content: record.search_content.clone(),
            start_time: record.start_time,
            end_time: record.end_time,
            episode: record.episode.clone(),
        }
    }
}

/// One ANN hit with its scalar fields
#[derive(Debug, Clone)]
pub struct VectorHit {
    /// Scalar fields of the matched record
    pub entry: VectorEntry,
    /// Cosine similarity (higher is closer)
    pub score: f32,
}

// ============================================================================
// VECTOR INDEX
// ============================================================================

/// HNSW vector index with scalar post-filtering
pub struct VectorIndex {
    index: Index,
    config: VectorIndexConfig,
    entries: HashMap<String, (u64, VectorEntry)>,
    id_to_key: HashMap<u64, String>,
    next_id: u64,
    persist_path: Option<PathBuf>,
}

impl VectorIndex {
    /// Create an in-memory index with default configuration
    pub fn new() -> Result<Self> {
        Self::with_config(VectorIndexConfig::default())
    }

    /// Create an in-memory index with custom configuration
    pub fn with_config(config: VectorIndexConfig) -> Result<Self> {
        let options = IndexOptions {
            dimensions: config.dimensions,
            metric: MetricKind::Cos,
            quantization: ScalarKind::F32,
            connectivity: config.connectivity,
            expansion_add: config.expansion_add,
            expansion_search: config.expansion_search,
            multi: false,
        };
        let index =
            Index::new(&options).map_err(|e| VectorIndexError::IndexCreation(e.to_string()))?;
        Ok(Self {
            index,
            config,
            entries: HashMap::new(),
            id_to_key: HashMap::new(),
            next_id: 0,
            persist_path: None,
        })
    }

    /// Persist the index (and its scalar sidecar) under this path on `flush`
    pub fn with_persistence(mut self, path: PathBuf) -> Self {
        self.persist_path = Some(path);
        self
    }

    /// Number of vectors in the index
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the index is empty
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Configured dimensions
    pub fn dimensions(&self) -> usize {
        self.config.dimensions
    }

    fn reserve(&self, capacity: usize) -> Result<()> {
        self.index
            .reserve(capacity)
            .map_err(|e| VectorIndexError::IndexCreation(format!("Failed to reserve capacity: {e}")))
    }

    /// Insert (or replace) one record with its embedding.
    ///
    /// USearch has no in-place update: an existing key is removed and
    /// re-added under the same internal id.
    pub fn insert(&mut self, record: &EpisodicRecord) -> Result<()> {
        if record.vector.len() != self.config.dimensions {
            return Err(VectorIndexError::InvalidDimensions(
                self.config.dimensions,
                record.vector.len(),
            ));
        }

        let entry = VectorEntry::from_record(record);

        if let Some((existing_id, _)) = self.entries.get(&record.record_id) {
            let existing_id = *existing_id;
            self.index
                .remove(existing_id)
                .map_err(|e| VectorIndexError::IndexAdd(e.to_string()))?;
            self.reserve(self.index.size() + 1)?;
            self.index
                .add(existing_id, &record.vector)
                .map_err(|e| VectorIndexError::IndexAdd(e.to_string()))?;
            self.entries.insert(record.record_id.clone(), (existing_id, entry));
            return Ok(());
        }

        // usearch requires reserve() before add() once capacity is exhausted
        let capacity = self.index.capacity();
        if self.index.size() >= capacity {
            self.reserve(std::cmp::max(capacity * 2, 16))?;
        }

        let id = self.next_id;
        self.next_id += 1;
        self.index
            .add(id, &record.vector)
            .map_err(|e| VectorIndexError::IndexAdd(e.to_string()))?;
        self.id_to_key.insert(id, record.record_id.clone());
        self.entries.insert(record.record_id.clone(), (id, entry));
        Ok(())
    }

    /// Whether a record id is present
    pub fn contains(&self, record_id: &str) -> bool {
        self.entries.contains_key(record_id)
    }

    /// ANN search with scalar filters and a similarity floor.
    ///
    /// `radius` is the minimum cosine similarity a hit must reach (0.0
    /// disables the floor). Over-fetches from the ANN layer, filters, then
    /// truncates to `k`.
    pub fn vector_search(
        &self,
        query: &[f32],
        filter: &ScopeFilter,
        k: usize,
        radius: f32,
    ) -> Result<Vec<VectorHit>> {
        if query.len() != self.config.dimensions {
            return Err(VectorIndexError::InvalidDimensions(
                self.config.dimensions,
                query.len(),
            ));
        }
        if self.is_empty() || k == 0 {
            return Ok(vec![]);
        }

        let fetch = (k * FILTER_OVERFETCH).min(self.len()).max(k);
        let results = self
            .index
            .search(query, fetch)
            .map_err(|e| VectorIndexError::IndexSearch(e.to_string()))?;

        let mut hits = Vec::new();
        for (internal_id, distance) in results.keys.iter().zip(results.distances.iter()) {
            let Some(record_id) = self.id_to_key.get(internal_id) else {
                continue;
            };
            let Some((_, entry)) = self.entries.get(record_id) else {
                continue;
            };
            // cosine distance → similarity
            let score = 1.0 - distance;
            if score < radius {
                continue;
            }
            if !filter.matches(&entry.user_id, entry.group_id.as_deref(), entry.timestamp_ms) {
                continue;
            }
            hits.push(VectorHit {
                entry: entry.clone(),
                score,
            });
            if hits.len() >= k {
                break;
            }
        }
        Ok(hits)
    }

    /// Remove every record derived from a parent MemCell
    pub fn remove_by_parent(&mut self, parent_event_id: &str) -> Result<usize> {
        let keys: Vec<String> = self
            .entries
            .iter()
            .filter(|(_, (_, entry))| entry.parent_event_id == parent_event_id)
            .map(|(key, _)| key.clone())
            .collect();
        for key in &keys {
            if let Some((id, _)) = self.entries.remove(key) {
                self.id_to_key.remove(&id);
                self.index
                    .remove(id)
                    .map_err(|e| VectorIndexError::IndexAdd(e.to_string()))?;
            }
        }
        Ok(keys.len())
    }

    /// Persist the index and its sidecar if a path was configured.
    ///
    /// Idempotent; a no-op for in-memory indexes.
    pub fn flush(&self) -> Result<()> {
        let Some(path) = &self.persist_path else {
            return Ok(());
        };
        let path_str = path
            .to_str()
            .ok_or_else(|| VectorIndexError::IndexPersistence("Invalid path".to_string()))?;
        self.index
            .save(path_str)
            .map_err(|e| VectorIndexError::IndexPersistence(e.to_string()))?;

        let sidecar = serde_json::json!({
            "next_id": self.next_id,
            "entries": self.entries,
        });
        let sidecar_path = path.with_extension("scalars.json");
        std::fs::write(
            &sidecar_path,
            serde_json::to_string(&sidecar)
                .map_err(|e| VectorIndexError::IndexPersistence(e.to_string()))?,
        )
        .map_err(|e| VectorIndexError::IndexPersistence(e.to_string()))?;
        Ok(())
    }

    /// Load a persisted index (and sidecar) from disk
    pub fn load(path: &Path, config: VectorIndexConfig) -> Result<Self> {
        let options = IndexOptions {
            dimensions: config.dimensions,
            metric: MetricKind::Cos,
            quantization: ScalarKind::F32,
            connectivity: config.connectivity,
            expansion_add: config.expansion_add,
            expansion_search: config.expansion_search,
            multi: false,
        };
        let index =
            Index::new(&options).map_err(|e| VectorIndexError::IndexCreation(e.to_string()))?;
        let path_str = path
            .to_str()
            .ok_or_else(|| VectorIndexError::IndexPersistence("Invalid path".to_string()))?;
        index
            .load(path_str)
            .map_err(|e| VectorIndexError::IndexPersistence(e.to_string()))?;

        let sidecar_path = path.with_extension("scalars.json");
        let sidecar_str = std::fs::read_to_string(&sidecar_path)
            .map_err(|e| VectorIndexError::IndexPersistence(e.to_string()))?;
        let sidecar: serde_json::Value = serde_json::from_str(&sidecar_str)
            .map_err(|e| VectorIndexError::IndexPersistence(e.to_string()))?;
        let entries: HashMap<String, (u64, VectorEntry)> =
            serde_json::from_value(sidecar["entries"].clone())
                .map_err(|e| VectorIndexError::IndexPersistence(e.to_string()))?;
        let next_id = sidecar["next_id"].as_u64().unwrap_or(0);
        let id_to_key = entries
            .iter()
            .map(|(key, (id, _))| (*id, key.clone()))
            .collect();

        Ok(Self {
            index,
            config,
            entries,
            id_to_key,
            next_id,
            persist_path: Some(path.to_path_buf()),
        })
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::{MemCell, RecordKind};
    use chrono::Utc;

    fn record(id: &str, user: &str, group: &str, seed: f32, dims: usize) -> EpisodicRecord {
        let cell = MemCell::new(user, Some(group.into()), vec![user.into()], Utc::now(), "body");
        EpisodicRecord {
            record_id: id.to_string(),
            memory_sub_type: RecordKind::Episode,
            event_type: "conversation".into(),
            user_id: user.to_string(),
            group_id: Some(group.to_string()),
            participants: vec![user.to_string()],
            timestamp: cell.timestamp,
            episode: format!("episode {id}"),
            search_content: vec![],
            parent_event_id: cell.event_id,
            memcell_event_id_list: vec![],
            start_time: 0,
            end_time: 0,
            metadata: serde_json::json!({}),
            vector: (0..dims).map(|i| ((i as f32 + seed) / dims as f32).sin()).collect(),
        }
    }

    fn small_index() -> VectorIndex {
        VectorIndex::with_config(VectorIndexConfig {
            dimensions: 8,
            ..Default::default()
        })
        .unwrap()
    }

    #[test]
    fn test_insert_and_search() {
        let mut index = small_index();
        let a = record("r1", "u1", "g1", 1.0, 8);
        let b = record("r2", "u1", "g1", 50.0, 8);
        index.insert(&a).unwrap();
        index.insert(&b).unwrap();

        let hits = index
            .vector_search(&a.vector, &ScopeFilter::default(), 2, 0.0)
            .unwrap();
        assert_eq!(hits[0].entry.record_id, "r1");
        assert!(hits[0].score > hits[1].score);
    }

    #[test]
    fn test_dimension_mismatch_rejected() {
        let mut index = small_index();
        let bad = record("r1", "u1", "g1", 1.0, 4);
        assert!(matches!(
            index.insert(&bad),
            Err(VectorIndexError::InvalidDimensions(8, 4))
        ));
    }

    #[test]
    fn test_scalar_filter_applies() {
        let mut index = small_index();
        index.insert(&record("r1", "u1", "g1", 1.0, 8)).unwrap();
        index.insert(&record("r2", "u2", "g2", 1.1, 8)).unwrap();

        let query = record("q", "u", "g", 1.0, 8).vector;
        let hits = index
            .vector_search(&query, &ScopeFilter::for_user("u2"), 10, 0.0)
            .unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].entry.record_id, "r2");
    }

    #[test]
    fn test_radius_floor() {
        let mut index = small_index();
        index.insert(&record("r1", "u1", "g1", 1.0, 8)).unwrap();
        let query = vec![0.0; 8];
        // zero query has no direction; nothing should clear a 0.99 floor
        let hits = index
            .vector_search(&query, &ScopeFilter::default(), 10, 0.99)
            .unwrap();
        assert!(hits.is_empty());
    }

    #[test]
    fn test_upsert_keeps_len() {
        let mut index = small_index();
        let a = record("r1", "u1", "g1", 1.0, 8);
        index.insert(&a).unwrap();
        index.insert(&a).unwrap();
        assert_eq!(index.len(), 1);
    }

    #[test]
    fn test_remove_by_parent() {
        let mut index = small_index();
        let mut a = record("p1_episode", "u1", "g1", 1.0, 8);
        a.parent_event_id = "p1".into();
        let mut b = record("p1_semantic_0", "u1", "g1", 2.0, 8);
        b.parent_event_id = "p1".into();
        let mut c = record("p2_episode", "u1", "g1", 3.0, 8);
        c.parent_event_id = "p2".into();
        for r in [&a, &b, &c] {
            index.insert(r).unwrap();
        }
        assert_eq!(index.remove_by_parent("p1").unwrap(), 2);
        assert_eq!(index.len(), 1);
        assert!(index.contains("p2_episode"));
    }
}
