//! SQLite Document Store
//!
//! Typed CRUD over every persisted document: the window log, the per-group
//! cursor, MemCells, flattened episodic records, profiles, cluster state,
//! conversation metadata, importance evidence and request logs.
//!
//! Uses separate reader/writer connections for interior mutability. All
//! methods take `&self`, making the store `Send + Sync` so the service layer
//! can hold `Arc<DocumentStore>`.

use chrono::{DateTime, Utc};
use directories::ProjectDirs;
use rusqlite::{Connection, OptionalExtension, params};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use crate::filter::ScopeFilter;
use crate::memory::{
    ConversationMeta, ConversationStatus, ImportanceEvidence, MemCell, RawMessage, Role,
    SyncStatus, UserProfile, WindowEntry, ClusterState, EpisodicRecord, MAX_FETCH_LIMIT,
};

// ============================================================================
// ERROR TYPES
// ============================================================================

/// Storage error type
#[non_exhaustive]
#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    /// Database error
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),
    /// Document (de)serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    /// Document not found
    #[error("Not found: {0}")]
    NotFound(String),
    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    /// Initialization error
    #[error("Initialization error: {0}")]
    Init(String),
}

/// Storage result type
pub type Result<T> = std::result::Result<T, StorageError>;

// ============================================================================
// SORTING
// ============================================================================

/// Sort order for paged queries
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SortOrder {
    /// Newest first
    #[default]
    Desc,
    /// Oldest first
    Asc,
}

impl SortOrder {
    fn sql(&self) -> &'static str {
        match self {
            SortOrder::Desc => "DESC",
            SortOrder::Asc => "ASC",
        }
    }

    /// Parse from the wire value; unknown strings fall back to descending
    pub fn parse_name(s: &str) -> Self {
        match s {
            "asc" => SortOrder::Asc,
            _ => SortOrder::Desc,
        }
    }
}

// ============================================================================
// DOCUMENT STORE
// ============================================================================

/// SQLite-backed document store
pub struct DocumentStore {
    writer: Mutex<Connection>,
    reader: Mutex<Connection>,
    db_path: PathBuf,
}

impl DocumentStore {
    /// Apply PRAGMAs to a connection
    fn configure_connection(conn: &Connection) -> Result<()> {
        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA synchronous = NORMAL;
             PRAGMA cache_size = -64000;
             PRAGMA temp_store = MEMORY;
             PRAGMA foreign_keys = ON;
             PRAGMA busy_timeout = 5000;",
        )?;
        Ok(())
    }

    /// Open (and migrate) the store at the given path, or the default
    /// platform data directory when `None`.
    pub fn open(db_path: Option<PathBuf>) -> Result<Self> {
        let path = match db_path {
            Some(p) => p,
            None => {
                let proj_dirs = ProjectDirs::from("ai", "mnemo", "mnemo").ok_or_else(|| {
                    StorageError::Init("Could not determine project directories".to_string())
                })?;
                let data_dir = proj_dirs.data_dir();
                std::fs::create_dir_all(data_dir)?;
                data_dir.join("mnemo.db")
            }
        };

        let writer_conn = Connection::open(&path)?;
        Self::configure_connection(&writer_conn)?;
        super::migrations::apply_migrations(&writer_conn)?;

        let reader_conn = Connection::open(&path)?;
        Self::configure_connection(&reader_conn)?;

        Ok(Self {
            writer: Mutex::new(writer_conn),
            reader: Mutex::new(reader_conn),
            db_path: path,
        })
    }

    /// Path of the backing database file
    pub fn db_path(&self) -> &Path {
        &self.db_path
    }

    fn write(&self) -> std::sync::MutexGuard<'_, Connection> {
        self.writer.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn read(&self) -> std::sync::MutexGuard<'_, Connection> {
        self.reader.lock().unwrap_or_else(|e| e.into_inner())
    }

    // ========================================================================
    // WINDOW REPOSITORY
    // ========================================================================

    /// Append a message to the window log with status `Log`.
    ///
    /// Idempotent on `(group_id, message_id)`: returns `false` when the
    /// entry already existed (the duplicate is dropped, never updated).
    pub fn append_message(&self, message: &RawMessage) -> Result<bool> {
        let conn = self.write();
        let inserted = conn.execute(
            "INSERT OR IGNORE INTO window_entries
             (group_id, message_id, sender, sender_name, role, content,
              create_time, create_time_ms, refer_list, sync_status)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
            params![
                message.group_key(),
                message.message_id,
                message.sender,
                message.sender_name,
                message.role.as_str(),
                message.content,
                message.create_time.to_rfc3339(),
                message.create_time_ms(),
                serde_json::to_string(&message.refer_list)?,
                SyncStatus::Log.as_i64(),
            ],
        )?;
        Ok(inserted > 0)
    }

    /// Unconsumed entries of a group with `create_time_ms ∈ [start_ms,
    /// end_ms)`, ordered by `(create_time_ms, rowid)` and capped at 500.
    ///
    /// Consumed entries are excluded: they already belong to exactly one
    /// MemCell and must never be re-covered, even after a cursor rewind.
    pub fn window_range(
        &self,
        group_id: &str,
        start_ms: i64,
        end_ms_exclusive: i64,
        limit: usize,
    ) -> Result<Vec<WindowEntry>> {
        let limit = limit.min(MAX_FETCH_LIMIT);
        let conn = self.read();
        let mut stmt = conn.prepare(
            "SELECT message_id, sender, sender_name, role, content,
                    create_time_ms, refer_list, sync_status
             FROM window_entries
             WHERE group_id = ?1 AND create_time_ms >= ?2 AND create_time_ms < ?3
               AND sync_status < 1
             ORDER BY create_time_ms ASC, rowid ASC
             LIMIT ?4",
        )?;
        let group_owned = group_id.to_string();
        let rows = stmt.query_map(
            params![group_id, start_ms, end_ms_exclusive, limit as i64],
            move |row| {
                let refer_json: String = row.get(6)?;
                let role: String = row.get(3)?;
                let create_time_ms: i64 = row.get(5)?;
                Ok(WindowEntry {
                    message: RawMessage {
                        message_id: row.get(0)?,
                        group_id: if group_owned.is_empty() {
                            None
                        } else {
                            Some(group_owned.clone())
                        },
                        sender: row.get(1)?,
                        sender_name: row.get(2)?,
                        role: Role::parse_name(&role),
                        content: row.get(4)?,
                        create_time: DateTime::from_timestamp_millis(create_time_ms)
                            .unwrap_or_else(Utc::now),
                        refer_list: serde_json::from_str(&refer_json).unwrap_or_default(),
                    },
                    sync_status: SyncStatus::from_i64(row.get(7)?),
                })
            },
        )?;
        rows.collect::<rusqlite::Result<Vec<_>>>().map_err(Into::into)
    }

    /// Advance status for a batch of messages. Monotone: a row never moves
    /// backwards, so replays cannot demote `Consumed` entries.
    pub fn set_sync_status(
        &self,
        group_id: &str,
        message_ids: &[String],
        status: SyncStatus,
    ) -> Result<usize> {
        if message_ids.is_empty() {
            return Ok(0);
        }
        let mut conn = self.write();
        let tx = conn.transaction()?;
        let mut updated = 0;
        {
            let mut stmt = tx.prepare(
                "UPDATE window_entries
                 SET sync_status = MAX(sync_status, ?1)
                 WHERE group_id = ?2 AND message_id = ?3",
            )?;
            for message_id in message_ids {
                updated += stmt.execute(params![status.as_i64(), group_id, message_id])?;
            }
        }
        tx.commit()?;
        Ok(updated)
    }

    /// Minimum `create_time_ms` across a group's entries still in `Log`
    /// status, i.e. arrivals not yet accepted into any window. Drives the
    /// out-of-order rewind; accumulating history entries must not retrigger
    /// it, and consumed entries never can.
    pub fn min_pending_log_time(&self, group_id: &str) -> Result<Option<i64>> {
        let conn = self.read();
        conn.query_row(
            "SELECT MIN(create_time_ms) FROM window_entries
             WHERE group_id = ?1 AND sync_status = ?2",
            params![group_id, SyncStatus::Log.as_i64()],
            |row| row.get(0),
        )
        .map_err(Into::into)
    }

    /// Current status of one window entry (test and audit hook)
    pub fn message_status(&self, group_id: &str, message_id: &str) -> Result<Option<SyncStatus>> {
        let conn = self.read();
        conn.query_row(
            "SELECT sync_status FROM window_entries WHERE group_id = ?1 AND message_id = ?2",
            params![group_id, message_id],
            |row| row.get::<_, i64>(0),
        )
        .optional()
        .map(|v| v.map(SyncStatus::from_i64))
        .map_err(Into::into)
    }

    // ========================================================================
    // CONVERSATION STATUS
    // ========================================================================

    /// Load the cursor for a group
    pub fn get_status(&self, group_id: &str) -> Result<Option<ConversationStatus>> {
        let conn = self.read();
        conn.query_row(
            "SELECT old_msg_start_ms, new_msg_start_ms, last_memcell_ms, updated_at_ms
             FROM conversation_status WHERE group_id = ?1",
            params![group_id],
            |row| {
                Ok((
                    row.get::<_, i64>(0)?,
                    row.get::<_, i64>(1)?,
                    row.get::<_, i64>(2)?,
                    row.get::<_, i64>(3)?,
                ))
            },
        )
        .optional()
        .map_err(StorageError::from)
        .map(|row| {
            row.map(|(old_ms, new_ms, cell_ms, updated_ms)| ConversationStatus {
                group_id: group_id.to_string(),
                old_msg_start_time: ms_to_time(old_ms),
                new_msg_start_time: ms_to_time(new_ms),
                last_memcell_time: ms_to_time(cell_ms),
                updated_at: ms_to_time(updated_ms),
            })
        })
    }

    /// Upsert the cursor for a group
    pub fn put_status(&self, status: &ConversationStatus) -> Result<()> {
        let conn = self.write();
        conn.execute(
            "INSERT INTO conversation_status
             (group_id, old_msg_start_ms, new_msg_start_ms, last_memcell_ms, updated_at_ms)
             VALUES (?1, ?2, ?3, ?4, ?5)
             ON CONFLICT(group_id) DO UPDATE SET
               old_msg_start_ms = excluded.old_msg_start_ms,
               new_msg_start_ms = excluded.new_msg_start_ms,
               last_memcell_ms = excluded.last_memcell_ms,
               updated_at_ms = excluded.updated_at_ms",
            params![
                status.group_id,
                status.old_msg_start_time.timestamp_millis(),
                status.new_msg_start_time.timestamp_millis(),
                status.last_memcell_time.timestamp_millis(),
                status.updated_at.timestamp_millis(),
            ],
        )?;
        Ok(())
    }

    // ========================================================================
    // MEMCELLS
    // ========================================================================

    /// Upsert a MemCell by `event_id`
    pub fn insert_memcell(&self, cell: &MemCell) -> Result<()> {
        let conn = self.write();
        conn.execute(
            "INSERT INTO memcells (event_id, user_id, group_id, timestamp_ms, doc, deleted_at_ms)
             VALUES (?1, ?2, ?3, ?4, ?5, NULL)
             ON CONFLICT(event_id) DO UPDATE SET
               user_id = excluded.user_id,
               group_id = excluded.group_id,
               timestamp_ms = excluded.timestamp_ms,
               doc = excluded.doc",
            params![
                cell.event_id,
                cell.user_id,
                cell.group_id,
                cell.timestamp.timestamp_millis(),
                serde_json::to_string(cell)?,
            ],
        )?;
        Ok(())
    }

    /// Fetch a MemCell by id, excluding soft-deleted rows
    pub fn get_memcell(&self, event_id: &str) -> Result<Option<MemCell>> {
        let conn = self.read();
        let doc: Option<String> = conn
            .query_row(
                "SELECT doc FROM memcells WHERE event_id = ?1 AND deleted_at_ms IS NULL",
                params![event_id],
                |row| row.get(0),
            )
            .optional()?;
        match doc {
            Some(doc) => Ok(Some(serde_json::from_str(&doc)?)),
            None => Ok(None),
        }
    }

    /// Paged MemCell query with a total count.
    ///
    /// `limit` is capped at 500 before it reaches SQL.
    pub fn find_memcells(
        &self,
        filter: &ScopeFilter,
        order: SortOrder,
        limit: usize,
        offset: usize,
    ) -> Result<(Vec<MemCell>, usize)> {
        let limit = limit.min(MAX_FETCH_LIMIT);
        let mut clauses = vec!["deleted_at_ms IS NULL".to_string()];
        let mut binds: Vec<Box<dyn rusqlite::ToSql>> = Vec::new();
        if let Some(user_id) = &filter.user_id {
            binds.push(Box::new(user_id.clone()));
            clauses.push(format!("user_id = ?{}", binds.len()));
        }
        if let Some(group_id) = &filter.group_id {
            binds.push(Box::new(group_id.clone()));
            clauses.push(format!("group_id = ?{}", binds.len()));
        }
        if let Some(start) = filter.start_ms {
            binds.push(Box::new(start));
            clauses.push(format!("timestamp_ms >= ?{}", binds.len()));
        }
        if let Some(end) = filter.end_ms {
            binds.push(Box::new(end));
            clauses.push(format!("timestamp_ms <= ?{}", binds.len()));
        }
        let where_clause = clauses.join(" AND ");

        let conn = self.read();
        let total: usize = conn.query_row(
            &format!("SELECT COUNT(*) FROM memcells WHERE {where_clause}"),
            rusqlite::params_from_iter(binds.iter().map(|b| b.as_ref())),
            |row| row.get::<_, i64>(0).map(|n| n as usize),
        )?;

        let sql = format!(
            "SELECT doc FROM memcells WHERE {where_clause}
             ORDER BY timestamp_ms {} LIMIT {limit} OFFSET {offset}",
            order.sql()
        );
        let mut stmt = conn.prepare(&sql)?;
        let docs = stmt.query_map(
            rusqlite::params_from_iter(binds.iter().map(|b| b.as_ref())),
            |row| row.get::<_, String>(0),
        )?;
        let mut cells = Vec::new();
        for doc in docs {
            cells.push(serde_json::from_str(&doc?)?);
        }
        Ok((cells, total))
    }

    /// Soft-delete MemCells matching the criteria; returns ids of the rows
    /// actually deleted so the caller can cascade into the indexes.
    pub fn soft_delete_memcells(
        &self,
        event_id: Option<&str>,
        user_id: Option<&str>,
        group_id: Option<&str>,
    ) -> Result<Vec<String>> {
        let mut clauses = vec!["deleted_at_ms IS NULL".to_string()];
        let mut binds: Vec<Box<dyn rusqlite::ToSql>> = Vec::new();
        if let Some(event_id) = event_id {
            binds.push(Box::new(event_id.to_string()));
            clauses.push(format!("event_id = ?{}", binds.len()));
        }
        if let Some(user_id) = user_id {
            binds.push(Box::new(user_id.to_string()));
            clauses.push(format!("user_id = ?{}", binds.len()));
        }
        if let Some(group_id) = group_id {
            binds.push(Box::new(group_id.to_string()));
            clauses.push(format!("group_id = ?{}", binds.len()));
        }
        let where_clause = clauses.join(" AND ");

        let mut conn = self.write();
        let tx = conn.transaction()?;
        let ids: Vec<String> = {
            let mut stmt =
                tx.prepare(&format!("SELECT event_id FROM memcells WHERE {where_clause}"))?;
            let rows = stmt.query_map(
                rusqlite::params_from_iter(binds.iter().map(|b| b.as_ref())),
                |row| row.get::<_, String>(0),
            )?;
            rows.collect::<rusqlite::Result<Vec<_>>>()?
        };
        let now_ms = Utc::now().timestamp_millis();
        {
            let mut stmt = tx.prepare(
                "UPDATE memcells SET deleted_at_ms = ?1 WHERE event_id = ?2",
            )?;
            for id in &ids {
                stmt.execute(params![now_ms, id])?;
            }
            let mut records = tx.prepare(
                "UPDATE episodic_records SET deleted_at_ms = ?1 WHERE parent_event_id = ?2",
            )?;
            for id in &ids {
                records.execute(params![now_ms, id])?;
            }
        }
        tx.commit()?;
        Ok(ids)
    }

    // ========================================================================
    // EPISODIC RECORDS (typed document view of the fan-out)
    // ========================================================================

    /// Upsert one flattened record (the vector is not stored here)
    pub fn insert_record(&self, record: &EpisodicRecord) -> Result<()> {
        let conn = self.write();
        conn.execute(
            "INSERT INTO episodic_records
             (record_id, parent_event_id, memory_sub_type, event_type, user_id, group_id,
              participants, timestamp_ms, episode, search_content, memcell_event_id_list,
              start_time, end_time, metadata, deleted_at_ms)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, NULL)
             ON CONFLICT(record_id) DO UPDATE SET
               episode = excluded.episode,
               search_content = excluded.search_content,
               metadata = excluded.metadata,
               timestamp_ms = excluded.timestamp_ms,
               deleted_at_ms = NULL",
            params![
                record.record_id,
                record.parent_event_id,
                record.memory_sub_type.as_str(),
                record.event_type,
                record.user_id,
                record.group_id,
                serde_json::to_string(&record.participants)?,
                record.timestamp.timestamp_millis(),
                record.episode,
                serde_json::to_string(&record.search_content)?,
                serde_json::to_string(&record.memcell_event_id_list)?,
                record.start_time,
                record.end_time,
                serde_json::to_string(&record.metadata)?,
            ],
        )?;
        Ok(())
    }

    /// Count of live episodic records (audit/test hook)
    pub fn count_records(&self) -> Result<usize> {
        let conn = self.read();
        conn.query_row(
            "SELECT COUNT(*) FROM episodic_records WHERE deleted_at_ms IS NULL",
            [],
            |row| row.get::<_, i64>(0).map(|n| n as usize),
        )
        .map_err(Into::into)
    }

    // ========================================================================
    // PROFILES
    // ========================================================================

    /// Load a user profile
    pub fn get_profile(&self, user_id: &str) -> Result<Option<UserProfile>> {
        let conn = self.read();
        let doc: Option<String> = conn
            .query_row(
                "SELECT doc FROM profiles WHERE user_id = ?1",
                params![user_id],
                |row| row.get(0),
            )
            .optional()?;
        match doc {
            Some(doc) => Ok(Some(serde_json::from_str(&doc)?)),
            None => Ok(None),
        }
    }

    /// Persist a profile as the entire new value (the group lock serialises
    /// writers; no optimistic locking)
    pub fn put_profile(&self, profile: &UserProfile) -> Result<()> {
        let conn = self.write();
        conn.execute(
            "INSERT INTO profiles (user_id, doc, updated_at_ms) VALUES (?1, ?2, ?3)
             ON CONFLICT(user_id) DO UPDATE SET doc = excluded.doc, updated_at_ms = excluded.updated_at_ms",
            params![
                profile.user_id,
                serde_json::to_string(profile)?,
                Utc::now().timestamp_millis(),
            ],
        )?;
        Ok(())
    }

    // ========================================================================
    // CLUSTER STATE
    // ========================================================================

    /// Load a group's cluster state
    pub fn get_cluster_state(&self, group_id: &str) -> Result<Option<ClusterState>> {
        let conn = self.read();
        let doc: Option<String> = conn
            .query_row(
                "SELECT doc FROM cluster_state WHERE group_id = ?1",
                params![group_id],
                |row| row.get(0),
            )
            .optional()?;
        match doc {
            Some(doc) => Ok(Some(serde_json::from_str(&doc)?)),
            None => Ok(None),
        }
    }

    /// Persist a group's cluster state atomically
    pub fn put_cluster_state(&self, group_id: &str, state: &ClusterState) -> Result<()> {
        let conn = self.write();
        conn.execute(
            "INSERT INTO cluster_state (group_id, doc, updated_at_ms) VALUES (?1, ?2, ?3)
             ON CONFLICT(group_id) DO UPDATE SET doc = excluded.doc, updated_at_ms = excluded.updated_at_ms",
            params![group_id, serde_json::to_string(state)?, Utc::now().timestamp_millis()],
        )?;
        Ok(())
    }

    // ========================================================================
    // CONVERSATION META
    // ========================================================================

    /// Load the meta record for a group key (`""` is the default record)
    pub fn get_meta(&self, group_key: &str) -> Result<Option<ConversationMeta>> {
        let conn = self.read();
        let doc: Option<String> = conn
            .query_row(
                "SELECT doc FROM conversation_meta WHERE group_key = ?1",
                params![group_key],
                |row| row.get(0),
            )
            .optional()?;
        match doc {
            Some(doc) => Ok(Some(serde_json::from_str(&doc)?)),
            None => Ok(None),
        }
    }

    /// Upsert a meta record (full replace)
    pub fn put_meta(&self, meta: &ConversationMeta) -> Result<()> {
        let group_key = meta.group_id.as_deref().unwrap_or("");
        let now_ms = Utc::now().timestamp_millis();
        let conn = self.write();
        conn.execute(
            "INSERT INTO conversation_meta (group_key, doc, created_at_ms, updated_at_ms)
             VALUES (?1, ?2, ?3, ?3)
             ON CONFLICT(group_key) DO UPDATE SET doc = excluded.doc, updated_at_ms = ?3",
            params![group_key, serde_json::to_string(meta)?, now_ms],
        )?;
        Ok(())
    }

    // ========================================================================
    // IMPORTANCE EVIDENCE
    // ========================================================================

    /// Increment the activity counters for one (user, group)
    pub fn bump_importance(
        &self,
        user_id: &str,
        group_id: &str,
        speak: u64,
        refer: u64,
        conversations: u64,
    ) -> Result<()> {
        let conn = self.write();
        conn.execute(
            "INSERT INTO importance_evidence
             (user_id, group_id, speak_count, refer_count, conversation_count)
             VALUES (?1, ?2, ?3, ?4, ?5)
             ON CONFLICT(user_id, group_id) DO UPDATE SET
               speak_count = speak_count + ?3,
               refer_count = refer_count + ?4,
               conversation_count = conversation_count + ?5",
            params![user_id, group_id, speak as i64, refer as i64, conversations as i64],
        )?;
        Ok(())
    }

    /// All evidence rows for a group
    pub fn importance_for_group(&self, group_id: &str) -> Result<Vec<ImportanceEvidence>> {
        let conn = self.read();
        let mut stmt = conn.prepare(
            "SELECT speak_count, refer_count, conversation_count
             FROM importance_evidence WHERE group_id = ?1",
        )?;
        let rows = stmt.query_map(params![group_id], |row| {
            Ok(ImportanceEvidence {
                speak_count: row.get::<_, i64>(0)? as u64,
                refer_count: row.get::<_, i64>(1)? as u64,
                conversation_count: row.get::<_, i64>(2)? as u64,
            })
        })?;
        rows.collect::<rusqlite::Result<Vec<_>>>().map_err(Into::into)
    }

    // ========================================================================
    // REQUEST LOGS
    // ========================================================================

    /// Record one accepted ingest request (audit trail)
    pub fn log_request(
        &self,
        endpoint: &str,
        method: &str,
        url: &str,
        group_id: Option<&str>,
        message_id: Option<&str>,
        payload: &serde_json::Value,
    ) -> Result<()> {
        let conn = self.write();
        conn.execute(
            "INSERT INTO request_logs (endpoint, method, url, group_id, message_id, payload, received_at_ms)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                endpoint,
                method,
                url,
                group_id,
                message_id,
                payload.to_string(),
                Utc::now().timestamp_millis(),
            ],
        )?;
        Ok(())
    }
}

fn ms_to_time(ms: i64) -> DateTime<Utc> {
    DateTime::from_timestamp_millis(ms).unwrap_or_else(Utc::now)
}

// ============================================================================
// TESTS
// ============================================================================
