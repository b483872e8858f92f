//! Database Migrations
//!
//! Schema migration definitions for the document store and the keyword
//! index. Both live in the same SQLite file; migrations are applied once by
//! the writer connection.

/// Migration definitions
pub const MIGRATIONS: &[Migration] = &[
    Migration {
        version: 1,
        description: "Initial schema: window log, cursor, memcells, episodic records, keyword index",
        up: MIGRATION_V1_UP,
    },
    Migration {
        version: 2,
        description: "Profiles, cluster state, conversation meta, importance evidence, request logs",
        up: MIGRATION_V2_UP,
    },
];

/// A database migration
#[derive(Debug, Clone)]
pub struct Migration {
    /// Version number
    pub version: u32,
    /// Description
    pub description: &'static str,
    /// SQL to apply
    pub up: &'static str,
}

/// V1: window log, conversation cursor, memcells, episodic records, FTS5 keyword index
const MIGRATION_V1_UP: &str = r#"
CREATE TABLE IF NOT EXISTS schema_version (
    version INTEGER NOT NULL,
    applied_at TEXT NOT NULL
);
INSERT INTO schema_version (version, applied_at)
SELECT 0, datetime('now') WHERE NOT EXISTS (SELECT 1 FROM schema_version);

-- Window log: one row per (group, message), status only ever advances
CREATE TABLE IF NOT EXISTS window_entries (
    group_id TEXT NOT NULL,
    message_id TEXT NOT NULL,
    sender TEXT NOT NULL,
    sender_name TEXT,
    role TEXT NOT NULL DEFAULT 'user',
    content TEXT NOT NULL,
    create_time TEXT NOT NULL,
    create_time_ms INTEGER NOT NULL,
    refer_list TEXT NOT NULL DEFAULT '[]',
    sync_status INTEGER NOT NULL DEFAULT -1,
    PRIMARY KEY (group_id, message_id)
);
CREATE INDEX IF NOT EXISTS idx_window_group_time ON window_entries(group_id, create_time_ms);
CREATE INDEX IF NOT EXISTS idx_window_status ON window_entries(group_id, sync_status);

-- Per-group state machine cursor
CREATE TABLE IF NOT EXISTS conversation_status (
    group_id TEXT PRIMARY KEY,
    old_msg_start_ms INTEGER NOT NULL,
    new_msg_start_ms INTEGER NOT NULL,
    last_memcell_ms INTEGER NOT NULL,
    updated_at_ms INTEGER NOT NULL
);

-- Parent memory records; the full cell is stored as JSON
CREATE TABLE IF NOT EXISTS memcells (
    event_id TEXT PRIMARY KEY,
    user_id TEXT NOT NULL,
    group_id TEXT,
    timestamp_ms INTEGER NOT NULL,
    doc TEXT NOT NULL,
    deleted_at_ms INTEGER
);
CREATE INDEX IF NOT EXISTS idx_memcells_user ON memcells(user_id, timestamp_ms);
CREATE INDEX IF NOT EXISTS idx_memcells_group ON memcells(group_id, timestamp_ms);

-- Flattened child records (typed document view)
CREATE TABLE IF NOT EXISTS episodic_records (
    record_id TEXT PRIMARY KEY,
    parent_event_id TEXT NOT NULL,
    memory_sub_type TEXT NOT NULL,
    event_type TEXT NOT NULL,
    user_id TEXT NOT NULL,
    group_id TEXT,
    participants TEXT NOT NULL DEFAULT '[]',
    timestamp_ms INTEGER NOT NULL,
    episode TEXT NOT NULL,
    search_content TEXT NOT NULL DEFAULT '[]',
    memcell_event_id_list TEXT NOT NULL DEFAULT '[]',
    start_time INTEGER NOT NULL DEFAULT 0,
    end_time INTEGER NOT NULL DEFAULT 0,
    metadata TEXT NOT NULL DEFAULT '{}',
    deleted_at_ms INTEGER
);
CREATE INDEX IF NOT EXISTS idx_records_parent ON episodic_records(parent_event_id);
CREATE INDEX IF NOT EXISTS idx_records_user_time ON episodic_records(user_id, timestamp_ms);

-- Keyword index documents (the inverted-index adapter owns these)
CREATE TABLE IF NOT EXISTS keyword_docs (
    record_id TEXT PRIMARY KEY,
    parent_event_id TEXT NOT NULL,
    memory_sub_type TEXT NOT NULL,
    event_type TEXT NOT NULL,
    user_id TEXT NOT NULL,
    group_id TEXT,
    timestamp_ms INTEGER NOT NULL,
    search_text TEXT NOT NULL,
    source TEXT NOT NULL,
    deleted INTEGER NOT NULL DEFAULT 0
);
CREATE INDEX IF NOT EXISTS idx_keyword_user_time ON keyword_docs(user_id, timestamp_ms);
CREATE INDEX IF NOT EXISTS idx_keyword_parent ON keyword_docs(parent_event_id);

-- FTS5 virtual table for BM25 keyword search (porter stemming)
CREATE VIRTUAL TABLE IF NOT EXISTS keyword_fts USING fts5(
    record_id, search_text,
    content='keyword_docs',
    content_rowid='rowid',
    tokenize='porter ascii'
);

CREATE TRIGGER IF NOT EXISTS keyword_ai AFTER INSERT ON keyword_docs BEGIN
    INSERT INTO keyword_fts(rowid, record_id, search_text)
    VALUES (NEW.rowid, NEW.record_id, NEW.search_text);
END;

CREATE TRIGGER IF NOT EXISTS keyword_ad AFTER DELETE ON keyword_docs BEGIN
    INSERT INTO keyword_fts(keyword_fts, rowid, record_id, search_text)
    VALUES ('delete', OLD.rowid, OLD.record_id, OLD.search_text);
END;

CREATE TRIGGER IF NOT EXISTS keyword_au AFTER UPDATE ON keyword_docs BEGIN
    INSERT INTO keyword_fts(keyword_fts, rowid, record_id, search_text)
    VALUES ('delete', OLD.rowid, OLD.record_id, OLD.search_text);
    INSERT INTO keyword_fts(rowid, record_id, search_text)
    VALUES (NEW.rowid, NEW.record_id, NEW.search_text);
END;

UPDATE schema_version SET version = 1, applied_at = datetime('now');
"#;

/// V2: profiles, clustering, conversation metadata, importance, request audit log
const MIGRATION_V2_UP: &str = r#"
CREATE TABLE IF NOT EXISTS profiles (
    user_id TEXT PRIMARY KEY,
    doc TEXT NOT NULL,
    updated_at_ms INTEGER NOT NULL
);

CREATE TABLE IF NOT EXISTS cluster_state (
    group_id TEXT PRIMARY KEY,
    doc TEXT NOT NULL,
    updated_at_ms INTEGER NOT NULL
);

-- group_key '' is the default-fallback record (group_id = null on the wire)
CREATE TABLE IF NOT EXISTS conversation_meta (
    group_key TEXT PRIMARY KEY,
    doc TEXT NOT NULL,
    created_at_ms INTEGER NOT NULL,
    updated_at_ms INTEGER NOT NULL
);

CREATE TABLE IF NOT EXISTS importance_evidence (
    user_id TEXT NOT NULL,
    group_id TEXT NOT NULL,
    speak_count INTEGER NOT NULL DEFAULT 0,
    refer_count INTEGER NOT NULL DEFAULT 0,
    conversation_count INTEGER NOT NULL DEFAULT 0,
    PRIMARY KEY (user_id, group_id)
);
CREATE INDEX IF NOT EXISTS idx_importance_group ON importance_evidence(group_id);

CREATE TABLE IF NOT EXISTS request_logs (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    endpoint TEXT NOT NULL,
    method TEXT NOT NULL,
    url TEXT NOT NULL,
    group_id TEXT,
    message_id TEXT,
    payload TEXT NOT NULL,
    received_at_ms INTEGER NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_request_logs_group ON request_logs(group_id, received_at_ms);

UPDATE schema_version SET version = 2, applied_at = datetime('now');
"#;

/// Read the current schema version (0 when the version table is missing)
pub fn get_current_version(conn: &rusqlite::Connection) -> rusqlite::Result<u32> {
    let exists: bool = conn.query_row(
        "SELECT EXISTS(SELECT 1 FROM sqlite_master WHERE type='table' AND name='schema_version')",
        [],
        |row| row.get(0),
    )?;
    if !exists {
        return Ok(0);
    }
    conn.query_row("SELECT version FROM schema_version LIMIT 1", [], |row| row.get(0))
}

/// Apply all pending migrations, returning how many ran
pub fn apply_migrations(conn: &rusqlite::Connection) -> rusqlite::Result<u32> {
    let current_version = get_current_version(conn)?;
    let mut applied = 0;

    for migration in MIGRATIONS {
        if migration.version > current_version {
            tracing::info!(
                "Applying migration v{}: {}",
                migration.version,
                migration.description
            );
            conn.execute_batch(migration.up)?;
            applied += 1;
        }
    }

    Ok(applied)
}

// ============================================================================
// TESTS
// ============================================================================
