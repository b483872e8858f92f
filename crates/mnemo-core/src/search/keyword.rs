//! Keyword Index
//!
//! Inverted-index adapter over SQLite FTS5 (porter stemming, BM25 ranking).
//! Owns its own connection to the shared database file; the document store
//! never writes the keyword tables, so fan-out counts stay honest per index.

use rusqlite::{Connection, params};
use std::path::Path;
use std::sync::Mutex;

use crate::filter::ScopeFilter;
use crate::memory::{EpisodicRecord, MAX_FETCH_LIMIT};

// ============================================================================
// ERROR TYPES
// ============================================================================

/// Keyword index error type
#[non_exhaustive]
#[derive(Debug, thiserror::Error)]
pub enum KeywordIndexError {
    /// Database error
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),
    /// Document (de)serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Keyword index result type
pub type Result<T> = std::result::Result<T, KeywordIndexError>;

// ============================================================================
// TOKENIZATION
// ============================================================================

/// Stopwords dropped from queries before matching
const STOPWORDS: &[&str] = &[
    "the", "a", "an", "and", "or", "but", "of", "to", "in", "on", "at", "for", "with", "is",
    "are", "was", "were", "be", "been", "it", "its", "this", "that", "these", "those", "as",
    "by", "from", "about", "into", "than", "then", "so", "do", "does", "did", "has", "have",
    "had", "what", "when", "where", "who", "how", "why", "which",
];

/// Tokenize a query into search terms.
///
/// Alphanumeric runs become word tokens; runs of CJK characters are split
/// into character bigrams so untokenized scripts still match. Stopwords and
/// tokens shorter than 2 characters are dropped.
pub fn tokenize_query(query: &str) -> Vec<String> {
    let mut terms = Vec::new();
    let mut word = String::new();
    let mut cjk_run: Vec<char> = Vec::new();

    let flush_word = |word: &mut String, terms: &mut Vec<String>| {
        if word.chars().count() >= 2 && !STOPWORDS.contains(&word.as_str()) {
            terms.push(word.clone());
        }
        word.clear();
    };
    let flush_cjk = |run: &mut Vec<char>, terms: &mut Vec<String>| {
        match run.len() {
            0 => {}
            1 => {} // single CJK char is below the minimum token length
            _ => {
                for pair in run.windows(2) {
                    terms.push(pair.iter().collect());
                }
            }
        }
        run.clear();
    };

    for ch in query.chars() {
        if is_cjk(ch) {
            flush_word(&mut word, &mut terms);
            cjk_run.push(ch);
        } else if ch.is_alphanumeric() {
            flush_cjk(&mut cjk_run, &mut terms);
            word.extend(ch.to_lowercase());
        } else {
            flush_word(&mut word, &mut terms);
            flush_cjk(&mut cjk_run, &mut terms);
        }
    }
    flush_word(&mut word, &mut terms);
    flush_cjk(&mut cjk_run, &mut terms);
    terms
}

fn is_cjk(ch: char) -> bool {
    matches!(ch as u32,
        0x4E00..=0x9FFF | 0x3400..=0x4DBF | 0x3040..=0x30FF | 0xAC00..=0xD7AF)
}

/// Quote a term for an FTS5 MATCH expression
fn sanitize_term(term: &str) -> String {
    format!("\"{}\"", term.replace('"', ""))
}

// ============================================================================
// HITS
// ============================================================================

/// One BM25 hit with its source document
#[derive(Debug, Clone)]
pub struct KeywordHit {
    /// The stored record (vector always empty on this path)
    pub record: EpisodicRecord,
    /// BM25 relevance (higher is better)
    pub score: f32,
}

// ============================================================================
// KEYWORD INDEX
// ============================================================================

/// FTS5-backed inverted index over episodic records
pub struct KeywordIndex {
    conn: Mutex<Connection>,
}

impl KeywordIndex {
    /// Open the adapter against the shared database file.
    ///
    /// Migrations must already be applied (the document store does this).
    pub fn open(db_path: &Path) -> Result<Self> {
        let conn = Connection::open(db_path)?;
        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA synchronous = NORMAL;
             PRAGMA busy_timeout = 5000;",
        )?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Upsert one record into the index.
    ///
    /// `search_text` is the record's search snippets joined with newlines;
    /// the FTS triggers keep the virtual table in sync.
    pub fn upsert(&self, record: &EpisodicRecord) -> Result<()> {
        let mut source = record.clone();
        source.vector = Vec::new();
        let search_text = record.search_content.join("\n");

        let conn = self.lock();
        conn.execute(
            "INSERT INTO keyword_docs
             (record_id, parent_event_id, memory_sub_type, event_type, user_id, group_id,
              timestamp_ms, search_text, source, deleted)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, 0)
             ON CONFLICT(record_id) DO UPDATE SET
               search_text = excluded.search_text,
               source = excluded.source,
               timestamp_ms = excluded.timestamp_ms,
               deleted = 0",
            params![
                record.record_id,
                record.parent_event_id,
                record.memory_sub_type.as_str(),
                record.event_type,
                record.user_id,
                record.group_id,
                record.timestamp.timestamp_millis(),
                search_text,
                serde_json::to_string(&source)?,
            ],
        )?;
        Ok(())
    }

    /// Multi-term BM25 search with scalar filters and offset paging.
    ///
    /// Terms are OR-combined; an empty term list returns no hits.
    pub fn multi_search(
        &self,
        terms: &[String],
        filter: &ScopeFilter,
        size: usize,
        from: usize,
    ) -> Result<Vec<KeywordHit>> {
        if terms.is_empty() || size == 0 {
            return Ok(vec![]);
        }
        let size = size.min(MAX_FETCH_LIMIT);
        let match_expr = terms
            .iter()
            .map(|t| sanitize_term(t))
            .collect::<Vec<_>>()
            .join(" OR ");

        let mut clauses = vec!["d.deleted = 0".to_string()];
        let mut binds: Vec<Box<dyn rusqlite::ToSql>> = vec![Box::new(match_expr)];
        if let Some(user_id) = &filter.user_id {
            binds.push(Box::new(user_id.clone()));
            clauses.push(format!("d.user_id = ?{}", binds.len()));
        }
        if let Some(group_id) = &filter.group_id {
            binds.push(Box::new(group_id.clone()));
            clauses.push(format!("d.group_id = ?{}", binds.len()));
        }
        if let Some(start) = filter.start_ms {
            binds.push(Box::new(start));
            clauses.push(format!("d.timestamp_ms >= ?{}", binds.len()));
        }
        if let Some(end) = filter.end_ms {
            binds.push(Box::new(end));
            clauses.push(format!("d.timestamp_ms <= ?{}", binds.len()));
        }

        let sql = format!(
            "SELECT d.source, bm25(keyword_fts) AS rank
             FROM keyword_fts f
             JOIN keyword_docs d ON d.rowid = f.rowid
             WHERE keyword_fts MATCH ?1 AND {}
             ORDER BY rank ASC
             LIMIT {size} OFFSET {from}",
            clauses.join(" AND ")
        );

        let conn = self.lock();
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map(
            rusqlite::params_from_iter(binds.iter().map(|b| b.as_ref())),
            |row| {
                let source: String = row.get(0)?;
                let rank: f64 = row.get(1)?;
                Ok((source, rank))
            },
        )?;

        let mut hits = Vec::new();
        for row in rows {
            let (source, rank) = row?;
            let record: EpisodicRecord = serde_json::from_str(&source)?;
            // bm25() is lower-is-better; negate so callers sort descending
            hits.push(KeywordHit {
                record,
                score: (-rank) as f32,
            });
        }
        Ok(hits)
    }

    /// Soft-delete every record derived from a parent MemCell
    pub fn soft_delete_by_parent(&self, parent_event_id: &str) -> Result<usize> {
        let conn = self.lock();
        let updated = conn.execute(
            "UPDATE keyword_docs SET deleted = 1 WHERE parent_event_id = ?1 AND deleted = 0",
            params![parent_event_id],
        )?;
        Ok(updated)
    }

    /// Make pending writes visible to other connections. Idempotent.
    pub fn refresh(&self) -> Result<()> {
        let conn = self.lock();
        conn.execute_batch("PRAGMA wal_checkpoint(PASSIVE);")?;
        Ok(())
    }

    /// Live document count (audit/test hook)
    pub fn count(&self) -> Result<usize> {
        let conn = self.lock();
        conn.query_row(
            "SELECT COUNT(*) FROM keyword_docs WHERE deleted = 0",
            [],
            |row| row.get::<_, i64>(0).map(|n| n as usize),
        )
        .map_err(Into::into)
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::{MemCell, RecordKind};
    use crate::storage::DocumentStore;
    use chrono::Utc;
    use tempfile::TempDir;

    fn open_temp() -> (KeywordIndex, TempDir) {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("test.db");
        // the document store applies migrations for the shared file
        let _store = DocumentStore::open(Some(path.clone())).unwrap();
        (KeywordIndex::open(&path).unwrap(), dir)
    }

    fn record(id: &str, user: &str, text: &str) -> EpisodicRecord {
        let cell = MemCell::new(user, Some("g1".into()), vec![], Utc::now(), text);
        EpisodicRecord {
            record_id: id.to_string(),
            memory_sub_type: RecordKind::Episode,
            event_type: "conversation".into(),
            user_id: user.to_string(),
            group_id: Some("g1".to_string()),
            participants: vec![],
            timestamp: cell.timestamp,
            episode: text.to_string(),
            search_content: vec![text.to_string()],
            parent_event_id: cell.event_id,
            memcell_event_id_list: vec![],
            start_time: 0,
            end_time: 0,
            metadata: serde_json::json!({}),
            vector: vec![],
        }
    }

    #[test]
    fn test_tokenize_filters_stopwords_and_short_tokens() {
        let terms = tokenize_query("What is the Plan for a coffee meeting?");
        assert!(terms.contains(&"plan".to_string()));
        assert!(terms.contains(&"coffee".to_string()));
        assert!(terms.contains(&"meeting".to_string()));
        assert!(!terms.contains(&"is".to_string()));
        assert!(!terms.contains(&"a".to_string()));
    }

    #[test]
    fn test_tokenize_cjk_bigrams() {
        let terms = tokenize_query("咖啡计划");
        assert!(terms.contains(&"咖啡".to_string()));
        assert!(terms.contains(&"啡计".to_string()));
        assert!(terms.contains(&"计划".to_string()));
    }

    #[test]
    fn test_upsert_and_search() {
        let (index, _dir) = open_temp();
        index.upsert(&record("r1", "u1", "the team discussed coffee machines")).unwrap();
        index.upsert(&record("r2", "u1", "quarterly budget planning session")).unwrap();

        let hits = index
            .multi_search(&["coffee".to_string()], &ScopeFilter::default(), 10, 0)
            .unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].record.record_id, "r1");
        assert!(hits[0].score.is_finite());
    }

    #[test]
    fn test_search_applies_user_filter() {
        let (index, _dir) = open_temp();
        index.upsert(&record("r1", "u1", "coffee notes")).unwrap();
        index.upsert(&record("r2", "u2", "coffee notes")).unwrap();

        let hits = index
            .multi_search(&["coffee".to_string()], &ScopeFilter::for_user("u2"), 10, 0)
            .unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].record.user_id, "u2");
    }

    #[test]
    fn test_soft_delete_hides_hits() {
        let (index, _dir) = open_temp();
        let r = record("r1", "u1", "coffee notes");
        index.upsert(&r).unwrap();
        assert_eq!(index.soft_delete_by_parent(&r.parent_event_id).unwrap(), 1);

        let hits = index
            .multi_search(&["coffee".to_string()], &ScopeFilter::default(), 10, 0)
            .unwrap();
        assert!(hits.is_empty());
        assert_eq!(index.count().unwrap(), 0);
    }

    #[test]
    fn test_empty_terms_return_nothing() {
        let (index, _dir) = open_temp();
        index.upsert(&record("r1", "u1", "coffee")).unwrap();
        assert!(index.multi_search(&[], &ScopeFilter::default(), 10, 0).unwrap().is_empty());
    }

    #[test]
    fn test_upsert_is_replace() {
        let (index, _dir) = open_temp();
        index.upsert(&record("r1", "u1", "coffee")).unwrap();
        index.upsert(&record("r1", "u1", "tea ceremony")).unwrap();
        assert_eq!(index.count().unwrap(), 1);

        let coffee = index
            .multi_search(&["coffee".to_string()], &ScopeFilter::default(), 10, 0)
            .unwrap();
        assert!(coffee.is_empty());
        let tea = index
            .multi_search(&["ceremony".to_string()], &ScopeFilter::default(), 10, 0)
            .unwrap();
        assert_eq!(tea.len(), 1);
    }
}
