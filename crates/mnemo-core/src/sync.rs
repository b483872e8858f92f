//! Write fan-out
//!
//! Splits one MemCell into its derived records and writes each to the
//! document store, the vector index (vectors present only) and the inverted
//! index, all under the parent's identity. Per-record failures are logged
//! and skipped; the operation as a whole succeeds iff the episode record
//! reached the document store. Finishes with `flush`/`refresh` so a
//! retrieval issued after the ingest response observes the new records.

use std::sync::{Arc, Mutex};
use tracing::{info, warn};

use crate::error::{EngineError, Result};
use crate::memory::{EpisodicRecord, MemCell, RecordKind};
use crate::search::{KeywordIndex, VectorIndex};
use crate::storage::DocumentStore;

// ============================================================================
// STATS
// ============================================================================

/// Per-kind write counts of one fan-out
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, serde::Serialize)]
pub struct SyncStats {
    /// Episode records written to the vector index (0 or 1)
    pub episode: usize,
    /// Semantic records written to the vector index
    pub semantic_memory: usize,
    /// Event-log records written to the vector index
    pub event_log: usize,
    /// Records written to the inverted index
    pub es_records: usize,
}

// ============================================================================
// SYNC SERVICE
// ============================================================================

/// MemCell → document store + vector index + inverted index
pub struct SyncService {
    store: Arc<DocumentStore>,
    vector: Arc<Mutex<VectorIndex>>,
    keyword: Arc<KeywordIndex>,
}

impl SyncService {
    /// Build the fan-out over the three stores
    pub fn new(
        store: Arc<DocumentStore>,
        vector: Arc<Mutex<VectorIndex>>,
        keyword: Arc<KeywordIndex>,
    ) -> Self {
        Self {
            store,
            vector,
            keyword,
        }
    }

    /// Fan one MemCell out across the stores.
    ///
    /// Child identities are structural (`<parent>_<kind>_<k>`); an event log
    /// whose facts and embeddings disagree in length is skipped as a group,
    /// and a record without an embedding skips the vector index only.
    pub fn sync_memcell(&self, cell: &MemCell) -> Result<SyncStats> {
        if let Some(log) = &cell.event_log {
            if !log.is_consistent() {
                warn!(
                    "Event log of {} has {} facts but {} embeddings; skipping its records",
                    cell.event_id,
                    log.atomic_fact.len(),
                    log.fact_embeddings.len()
                );
            }
        }

        let records = EpisodicRecord::from_memcell(cell);
        let mut stats = SyncStats::default();
        let mut episode_wrote = false;
        let mut episode_expected = false;

        for record in &records {
            if record.memory_sub_type == RecordKind::Episode {
                episode_expected = true;
            }

            if let Err(e) = self.store.insert_record(record) {
                warn!("Document write failed for {}: {e}", record.record_id);
                continue;
            }
            if record.memory_sub_type == RecordKind::Episode {
                episode_wrote = true;
            }

            if record.vector.is_empty() {
                warn!(
                    "Record {} has no embedding; skipping vector index",
                    record.record_id
                );
            } else {
                let mut vector = self.vector.lock().unwrap_or_else(|e| e.into_inner());
                match vector.insert(record) {
                    Ok(()) => match record.memory_sub_type {
                        RecordKind::Episode => stats.episode += 1,
                        RecordKind::SemanticMemory => stats.semantic_memory += 1,
                        RecordKind::EventLog => stats.event_log += 1,
                    },
                    Err(e) => warn!("Vector write failed for {}: {e}", record.record_id),
                }
            }

            match self.keyword.upsert(record) {
                Ok(()) => stats.es_records += 1,
                Err(e) => warn!("Inverted-index write failed for {}: {e}", record.record_id),
            }
        }

        // make the new records visible before the ingest response returns
        if let Err(e) = self.vector.lock().unwrap_or_else(|e| e.into_inner()).flush() {
            warn!("Vector flush failed: {e}");
        }
        if let Err(e) = self.keyword.refresh() {
            warn!("Inverted-index refresh failed: {e}");
        }

        if episode_expected && !episode_wrote {
            return Err(EngineError::SyncFailed(format!(
                "episode record of {} did not reach the document store",
                cell.event_id
            )));
        }

        info!(
            "Synced MemCell {}: episode={}, semantic={}, event_log={}, inverted={}",
            cell.event_id, stats.episode, stats.semantic_memory, stats.event_log, stats.es_records
        );
        Ok(stats)
    }
}

// ============================================================================
// TESTS
// ============================================================================
