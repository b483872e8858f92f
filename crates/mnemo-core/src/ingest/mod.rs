//! Ingest coordinator
//!
//! The per-group critical section that advances the conversation state
//! machine. One call handles one received message: verify it is logged,
//! take the group lock, re-materialise the history/pending windows from the
//! repository, ask the boundary detector, and on an emitted MemCell run the
//! extractors, the write fan-out, the cursor advance and the best-effort
//! profile update, in that order, all under the lock.

mod locks;

pub use locks::GroupLocks;

use chrono::{Duration, Utc};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::error::Result;
use crate::extract::{EventLogExtractor, ExtractOutcome, MemCellExtractor, SemanticExtractor};
use crate::memory::{
    ConversationStatus, MemCell, RawMessage, SyncStatus, WindowEntry, MAX_FETCH_LIMIT,
};
use crate::profile::ProfileManager;
use crate::providers::{EmbedOptions, Vectorizer};
use crate::storage::DocumentStore;
use crate::sync::SyncService;

// ============================================================================
// OUTCOME
// ============================================================================

/// Caller-visible status of one ingest call
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IngestStatus {
    /// Message stored; no memory produced yet
    Accumulated,
    /// At least one MemCell was produced by this call
    Extracted,
}

impl IngestStatus {
    /// Wire string for the HTTP response
    pub fn as_str(&self) -> &'static str {
        match self {
            IngestStatus::Accumulated => "accumulated",
            IngestStatus::Extracted => "extracted",
        }
    }
}

/// Result of one ingest call
#[derive(Debug, Clone, Copy)]
pub struct IngestOutcome {
    /// Number of memories extracted by this call
    pub count: usize,
    /// Status reported to the caller
    pub status: IngestStatus,
}

impl IngestOutcome {
    fn accumulated() -> Self {
        Self {
            count: 0,
            status: IngestStatus::Accumulated,
        }
    }
}

// ============================================================================
// INGEST SERVICE
// ============================================================================

/// Per-group serialised ingest pipeline
pub struct IngestService {
    store: Arc<DocumentStore>,
    locks: GroupLocks,
    extractor: MemCellExtractor,
    semantic: SemanticExtractor,
    eventlog: EventLogExtractor,
    sync: SyncService,
    vectorizer: Arc<dyn Vectorizer>,
    profile_manager: Option<Arc<ProfileManager>>,
}

impl IngestService {
    /// Wire the coordinator over its collaborators
    pub fn new(
        store: Arc<DocumentStore>,
        extractor: MemCellExtractor,
        semantic: SemanticExtractor,
        eventlog: EventLogExtractor,
        sync: SyncService,
        vectorizer: Arc<dyn Vectorizer>,
        profile_manager: Option<Arc<ProfileManager>>,
    ) -> Self {
        Self {
            store,
            locks: GroupLocks::new(),
            extractor,
            semantic,
            eventlog,
            sync,
            vectorizer,
            profile_manager,
        }
    }

    /// Process one received message (single writer per group).
    ///
    /// Idempotent per `(group_id, message_id)`: replays change nothing
    /// because the window log dedups and consumed messages fall outside the
    /// re-materialised windows.
    pub async fn memorize(&self, message: RawMessage) -> Result<IngestOutcome> {
        // 1. make sure the message is logged (the HTTP edge usually did this)
        self.store.append_message(&message)?;

        let group_id = message.group_key().to_string();
        let lock = self.locks.lock_for(&group_id);
        let _guard = lock.lock().await;

        let now = Utc::now().max(message.create_time + Duration::seconds(1));

        // 3. load or create the cursor
        let mut status = match self.store.get_status(&group_id)? {
            Some(status) => status,
            None => {
                let status = ConversationStatus::new_conversation(&group_id, message.create_time);
                self.store.put_status(&status)?;
                status
            }
        };

        // 4. out-of-order guard: rewind when a not-yet-windowed entry
        // predates the pending window (late arrivals on the wire). The
        // incoming message is already appended, so the minimum covers it iff
        // it is still in Log status; replays of consumed or accumulating
        // messages never move the cursor.
        if let Some(t_min) = self
            .store
            .min_pending_log_time(&group_id)?
            .and_then(chrono::DateTime::from_timestamp_millis)
        {
            if status.rewind_to(t_min, now) {
                debug!(
                    "Rewound cursor of {group_id}: new_msg_start_time={}",
                    status.new_msg_start_time
                );
                self.store.put_status(&status)?;
            }
        }

        // 5. re-materialise the windows from the repository
        let history_entries = self.store.window_range(
            &group_id,
            status.old_msg_start_time.timestamp_millis(),
            status.new_msg_start_time.timestamp_millis(),
            MAX_FETCH_LIMIT,
        )?;
        let new_entries = self.store.window_range(
            &group_id,
            status.new_msg_start_time.timestamp_millis(),
            now.timestamp_millis() + 1,
            MAX_FETCH_LIMIT,
        )?;
        if new_entries.is_empty() {
            return Ok(IngestOutcome::accumulated());
        }

        // 6. the whole window is now accumulating
        let window_ids: Vec<String> = history_entries
            .iter()
            .chain(new_entries.iter())
            .map(|e| e.message.message_id.clone())
            .collect();
        self.store
            .set_sync_status(&group_id, &window_ids, SyncStatus::Accumulating)?;

        let history: Vec<RawMessage> =
            history_entries.iter().map(|e| e.message.clone()).collect();
        let pending: Vec<RawMessage> = new_entries.iter().map(|e| e.message.clone()).collect();

        // 7. boundary decision
        let outcome = self
            .extractor
            .extract(&history, &pending, message.group_id.as_deref(), &[])
            .await;

        match outcome {
            ExtractOutcome::Wait => {
                debug!("Boundary inconclusive for {group_id}; holding window");
                Ok(IngestOutcome::accumulated())
            }
            ExtractOutcome::Accumulate => {
                if let Some(last) = pending.last() {
                    status.accumulate_to(last.create_time, now);
                    self.store.put_status(&status)?;
                }
                Ok(IngestOutcome::accumulated())
            }
            ExtractOutcome::Emit(cell) => {
                self.finish_extraction(cell, &group_id, status, now).await
            }
        }
    }

    /// Steps 8a–8g: enrich, persist, fan out, advance, best-effort profile
    async fn finish_extraction(
        &self,
        mut cell: MemCell,
        group_id: &str,
        mut status: ConversationStatus,
        now: chrono::DateTime<Utc>,
    ) -> Result<IngestOutcome> {
        // 8a. episode embedding, stashed so sync does not recompute it
        match self
            .vectorizer
            .embed(&cell.episode, &EmbedOptions::document())
            .await
        {
            Ok(vector) => cell.set_episode_embedding(&vector),
            Err(e) => warn!(
                "Episode embedding failed for {}: {e}; vector write will be skipped",
                cell.event_id
            ),
        }

        // 8b. typed sub-memories (embeddings included)
        cell.semantic_memories = self.semantic.extract(&cell).await;
        cell.event_log = self.eventlog.extract(&cell).await;

        self.store.insert_memcell(&cell)?;

        // 8c. fan-out must succeed before the cursor advances; otherwise the
        // cell stays persisted and the next ingest retries the same window
        if let Err(e) = self.sync.sync_memcell(&cell) {
            warn!(
                "Sync failed for {}; cursor held so the window is retried: {e}",
                cell.event_id
            );
            return Ok(IngestOutcome::accumulated());
        }

        // 8d. cursor advance past the covered range
        let last_covered = cell
            .original_data
            .last()
            .map(|m| m.create_time)
            .unwrap_or(cell.timestamp);
        status.advance_after_extraction(last_covered, cell.timestamp, now);
        self.store.put_status(&status)?;

        // 8e. covered messages are consumed
        let covered_ids: Vec<String> = cell
            .original_data
            .iter()
            .map(|m| m.message_id.clone())
            .collect();
        self.store
            .set_sync_status(group_id, &covered_ids, SyncStatus::Consumed)?;

        // activity counters feeding the retrieval importance score
        if let Err(e) = self.record_importance(group_id, &cell) {
            warn!("Importance update failed for {group_id}: {e}");
        }

        // 8f. profile update, best-effort, still under the group lock so
        // profiles see episodes in order
        if let Some(manager) = &self.profile_manager {
            if let Err(e) = manager.update_for_memcell(&cell).await {
                warn!("Profile update failed for {}: {e}", cell.event_id);
            }
        }

        info!(
            "Extracted MemCell {} covering {} messages in {group_id}",
            cell.event_id,
            cell.original_data.len()
        );
        Ok(IngestOutcome {
            count: 1,
            status: IngestStatus::Extracted,
        })
    }

    /// Bump speak/refer/conversation counters for the covered episode
    fn record_importance(&self, group_id: &str, cell: &MemCell) -> Result<()> {
        let mut speak: HashMap<&str, u64> = HashMap::new();
        let mut refer: HashMap<&str, u64> = HashMap::new();
        let by_id: HashMap<&str, &RawMessage> = cell
            .original_data
            .iter()
            .map(|m| (m.message_id.as_str(), m))
            .collect();

        for message in &cell.original_data {
            *speak.entry(message.sender.as_str()).or_default() += 1;
            for referenced in &message.refer_list {
                if let Some(target) = by_id.get(referenced.as_str()) {
                    *refer.entry(target.sender.as_str()).or_default() += 1;
                }
            }
        }

        for user in &cell.participants {
            self.store.bump_importance(
                user,
                group_id,
                speak.get(user.as_str()).copied().unwrap_or(0),
                refer.get(user.as_str()).copied().unwrap_or(0),
                1,
            )?;
        }
        Ok(())
    }

    /// Window entries of a group (audit/test hook)
    pub fn window(&self, group_id: &str) -> Result<Vec<WindowEntry>> {
        Ok(self
            .store
            .window_range(group_id, 0, i64::MAX, MAX_FETCH_LIMIT)?)
    }
}
