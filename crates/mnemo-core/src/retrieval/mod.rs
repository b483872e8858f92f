//! Retrieval coordinator
//!
//! Routes a query to keyword, vector, or fused retrieval, merges and
//! reranks the hits, and shapes the response: hits grouped by `group_id`,
//! groups ordered by the importance score aggregated from user activity,
//! memories inside a group ordered by time.

use chrono::{DateTime, Utc};
use lru::LruCache;
use serde::Serialize;
use serde_json::Value;
use std::collections::HashMap;
use std::num::NonZeroUsize;
use std::sync::{Arc, Mutex};
use tracing::{debug, warn};

use crate::error::{EngineError, Result};
use crate::filter::ScopeFilter;
use crate::memory::{aggregate_importance, RawMessage, MAX_FETCH_LIMIT};
use crate::providers::{EmbedOptions, PassageReranker, RerankOptions, Vectorizer};
use crate::search::{
    reciprocal_rank_fusion, tokenize_query, KeywordHit, KeywordIndex, VectorHit, VectorIndex,
    DEFAULT_RRF_K,
};
use crate::storage::DocumentStore;

/// Default cosine floor for vector retrieval
pub const DEFAULT_RADIUS: f32 = 0.6;

/// Capacity of the query-embedding cache
const QUERY_CACHE_SIZE: usize = 100;

// ============================================================================
// REQUEST / RESPONSE
// ============================================================================

/// Supported retrieval methods
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RetrieveMethod {
    /// BM25 keyword search
    #[default]
    Keyword,
    /// ANN vector search
    Vector,
    /// Union of both, reranked
    Hybrid,
    /// Union of both, fused by reciprocal rank
    Rrf,
    /// Accepted on the wire; served by the hybrid path
    Agentic,
}

impl RetrieveMethod {
    /// Parse the wire value
    pub fn parse_name(s: &str) -> Option<Self> {
        match s {
            "keyword" => Some(RetrieveMethod::Keyword),
            "vector" => Some(RetrieveMethod::Vector),
            "hybrid" => Some(RetrieveMethod::Hybrid),
            "rrf" => Some(RetrieveMethod::Rrf),
            "agentic" => Some(RetrieveMethod::Agentic),
            _ => None,
        }
    }
}

/// A retrieval query
#[derive(Debug, Clone, Default)]
pub struct RetrieveRequest {
    /// User scope; `None` means unfiltered (`__all__` on the wire)
    pub user_id: Option<String>,
    /// Group scope; `None` means unfiltered
    pub group_id: Option<String>,
    /// Query text
    pub query: String,
    /// Retrieval method
    pub retrieve_method: RetrieveMethod,
    /// Result budget
    pub top_k: usize,
    /// Memory kinds to include (empty means all)
    pub memory_types: Vec<String>,
    /// Closed lower time bound, epoch milliseconds
    pub start_ms: Option<i64>,
    /// Closed upper time bound, epoch milliseconds
    pub end_ms: Option<i64>,
    /// Cosine floor override for the vector path
    pub radius: Option<f32>,
}

/// One retrieved memory as returned to callers
#[derive(Debug, Clone, Serialize)]
pub struct RetrievedMemory {
    /// Always `episode_summary` for this index family
    pub memory_type: String,
    /// Record id in the indexes
    pub record_id: String,
    /// Record kind
    pub memory_sub_type: String,
    /// Owning user
    pub user_id: String,
    /// Conversation group
    pub group_id: Option<String>,
    /// Episode timestamp
    pub timestamp: DateTime<Utc>,
    /// Topic line of the parent, when known
    pub subject: Option<String>,
    /// One-sentence summary of the parent, when known
    pub summary: Option<String>,
    /// The indexed text
    pub episode: String,
    /// Participants of the parent episode
    pub participants: Vec<String>,
    /// Parent MemCells backing this hit
    pub memcell_event_id_list: Vec<String>,
    /// Which retriever surfaced the hit (`keyword` / `vector`)
    #[serde(rename = "_search_source")]
    pub search_source: &'static str,
}

/// Response metadata block
#[derive(Debug, Clone, Serialize)]
pub struct Metadata {
    /// Which subsystem answered
    pub source: String,
    /// Echo of the user scope
    pub user_id: String,
    /// Operation label
    pub memory_type: String,
}

/// Grouped retrieval response: parallel per-group lists, importance-ordered
#[derive(Debug, Clone, Serialize)]
pub struct RetrieveResponse {
    /// One `{group_id: [memory, ...]}` entry per group, importance-ordered
    pub memories: Vec<HashMap<String, Vec<RetrievedMemory>>>,
    /// Native scores, same shape as `memories`
    pub scores: Vec<HashMap<String, Vec<f32>>>,
    /// Importance score per group, same order
    pub importance_scores: Vec<f64>,
    /// Raw covered messages per group, same order
    pub original_data: Vec<HashMap<String, Vec<Vec<RawMessage>>>>,
    /// Total memories across groups
    pub total_count: usize,
    /// Whether more results exist beyond `top_k`
    pub has_more: bool,
    /// Response metadata
    pub metadata: Metadata,
}

// ============================================================================
// INTERNAL HIT
// ============================================================================

/// Retriever-agnostic hit
#[derive(Debug, Clone)]
struct Hit {
    record_id: String,
    user_id: String,
    group_id: Option<String>,
    timestamp: DateTime<Utc>,
    episode: String,
    memory_sub_type: String,
    participants: Vec<String>,
    memcell_event_id_list: Vec<String>,
    metadata: Value,
    score: f32,
    search_source: &'static str,
}

impl Hit {
    fn from_keyword(hit: KeywordHit) -> Self {
        let record = hit.record;
        Self {
            record_id: record.record_id,
            user_id: record.user_id,
            group_id: record.group_id,
            timestamp: record.timestamp,
            episode: record.episode,
            memory_sub_type: record.memory_sub_type.as_str().to_string(),
            participants: record.participants,
            memcell_event_id_list: record.memcell_event_id_list,
            metadata: record.metadata,
            score: hit.score,
            search_source: "keyword",
        }
    }

    fn from_vector(hit: VectorHit) -> Self {
        let entry = hit.entry;
        Self {
            record_id: entry.record_id,
            user_id: entry.user_id,
            group_id: entry.group_id,
            timestamp: DateTime::from_timestamp_millis(entry.timestamp_ms)
                .unwrap_or_else(Utc::now),
            episode: entry.episode,
            memory_sub_type: entry.memory_sub_type,
            participants: entry.participants,
            memcell_event_id_list: entry.memcell_event_id_list,
            metadata: serde_json::from_str(&entry.metadata).unwrap_or(Value::Null),
            score: hit.score,
            search_source: "vector",
        }
    }

    /// Text handed to the reranker, shaped per memory kind
    fn rerank_text(&self) -> String {
        match self.memory_sub_type.as_str() {
            "episode" => format!("Episode Memory: {}", self.episode),
            "event_log" => format!("Atomic Fact: {}", self.episode),
            _ => self.episode.clone(),
        }
    }

    fn meta_str(&self, key: &str) -> Option<String> {
        self.metadata
            .get(key)
            .and_then(Value::as_str)
            .map(str::to_string)
    }

    fn into_memory(self) -> (RetrievedMemory, f32) {
        let subject = self.meta_str("subject");
        let summary = self.meta_str("summary");
        let score = self.score;
        (
            RetrievedMemory {
                memory_type: "episode_summary".to_string(),
                record_id: self.record_id,
                memory_sub_type: self.memory_sub_type,
                user_id: self.user_id,
                group_id: self.group_id,
                timestamp: self.timestamp,
                subject,
                summary,
                episode: self.episode,
                participants: self.participants,
                memcell_event_id_list: self.memcell_event_id_list,
                search_source: self.search_source,
            },
            score,
        )
    }
}

// ============================================================================
// RETRIEVAL SERVICE
// ============================================================================

/// Query routing, fusion, grouping and the admin delete path
pub struct RetrievalService {
    store: Arc<DocumentStore>,
    vector: Arc<Mutex<VectorIndex>>,
    keyword: Arc<KeywordIndex>,
    vectorizer: Arc<dyn Vectorizer>,
    reranker: Arc<dyn PassageReranker>,
    query_cache: Mutex<LruCache<String, Vec<f32>>>,
    default_radius: f32,
    rrf_k: f32,
}

impl RetrievalService {
    /// Wire the coordinator over its collaborators
    pub fn new(
        store: Arc<DocumentStore>,
        vector: Arc<Mutex<VectorIndex>>,
        keyword: Arc<KeywordIndex>,
        vectorizer: Arc<dyn Vectorizer>,
        reranker: Arc<dyn PassageReranker>,
    ) -> Self {
        Self {
            store,
            vector,
            keyword,
            vectorizer,
            reranker,
            query_cache: Mutex::new(LruCache::new(
                NonZeroUsize::new(QUERY_CACHE_SIZE).expect("cache size is non-zero"),
            )),
            default_radius: DEFAULT_RADIUS,
            rrf_k: DEFAULT_RRF_K,
        }
    }

    /// Serve one retrieval request
    pub async fn retrieve(&self, request: &RetrieveRequest) -> Result<RetrieveResponse> {
        if request.query.trim().is_empty() {
            return Err(EngineError::InvalidArgument("query is required".to_string()));
        }
        if request.user_id.is_none() && request.group_id.is_none() {
            return Err(EngineError::InvalidArgument(
                "at least one of user_id and group_id must be a real value".to_string(),
            ));
        }
        let top_k = request.top_k.clamp(1, MAX_FETCH_LIMIT);
        let filter = ScopeFilter {
            user_id: request.user_id.clone(),
            group_id: request.group_id.clone(),
            start_ms: request.start_ms,
            end_ms: request.end_ms,
        };

        let (hits, source) = match request.retrieve_method {
            RetrieveMethod::Keyword => (
                self.keyword_hits(&request.query, &filter, top_k)?,
                "keyword_index",
            ),
            RetrieveMethod::Vector => (
                self.vector_hits(&request.query, &filter, top_k, request.radius)
                    .await?,
                "vector_index",
            ),
            RetrieveMethod::Hybrid | RetrieveMethod::Agentic => (
                self.hybrid_hits(request, &filter, top_k).await?,
                "hybrid_retrieval",
            ),
            RetrieveMethod::Rrf => (
                self.rrf_hits(request, &filter, top_k).await?,
                "rrf_retrieval",
            ),
        };

        let hits = filter_memory_types(hits, &request.memory_types);
        self.group_response(hits, source, request)
    }

    // ========================================================================
    // RETRIEVER PATHS
    // ========================================================================

    fn keyword_hits(
        &self,
        query: &str,
        filter: &ScopeFilter,
        top_k: usize,
    ) -> Result<Vec<Hit>> {
        let terms = tokenize_query(query);
        debug!("Keyword terms: {terms:?}");
        let hits = self.keyword.multi_search(&terms, filter, top_k, 0)?;
        Ok(hits.into_iter().map(Hit::from_keyword).collect())
    }

    async fn vector_hits(
        &self,
        query: &str,
        filter: &ScopeFilter,
        top_k: usize,
        radius: Option<f32>,
    ) -> Result<Vec<Hit>> {
        let query_vector = self.embed_query(query).await?;
        let radius = radius.unwrap_or(self.default_radius);
        let hits = {
            let index = self.vector.lock().unwrap_or_else(|e| e.into_inner());
            index.vector_search(&query_vector, filter, top_k, radius)?
        };
        Ok(hits.into_iter().map(Hit::from_vector).collect())
    }

    /// Union of keyword and vector hits, reranked; falls back to native
    /// score ordering when the reranker is down.
    async fn hybrid_hits(
        &self,
        request: &RetrieveRequest,
        filter: &ScopeFilter,
        top_k: usize,
    ) -> Result<Vec<Hit>> {
        let (keyword_hits, vector_hits) = self.both_sides(request, filter, top_k).await;
        let union = dedup_union(keyword_hits, vector_hits);
        if union.is_empty() {
            return Ok(vec![]);
        }

        let texts: Vec<String> = union.iter().map(Hit::rerank_text).collect();
        let options = RerankOptions {
            instruction: None,
            top_k: Some(top_k),
        };
        match self.reranker.rerank(&request.query, &texts, &options).await {
            Ok(ranked) => {
                let mut out = Vec::with_capacity(ranked.len());
                for item in ranked {
                    if let Some(hit) = union.get(item.index) {
                        let mut hit = hit.clone();
                        hit.score = item.score;
                        out.push(hit);
                    }
                }
                Ok(out)
            }
            Err(e) => {
                warn!("Rerank failed, falling back to native score ordering: {e}");
                let mut out = union;
                out.sort_by(|a, b| {
                    b.score.partial_cmp(&a.score).unwrap_or(std::cmp::Ordering::Equal)
                });
                out.truncate(top_k);
                Ok(out)
            }
        }
    }

    /// Union of both sides fused with Reciprocal Rank Fusion
    async fn rrf_hits(
        &self,
        request: &RetrieveRequest,
        filter: &ScopeFilter,
        top_k: usize,
    ) -> Result<Vec<Hit>> {
        let (keyword_hits, vector_hits) = self.both_sides(request, filter, top_k).await;

        let keyword_ranked: Vec<(String, f32)> = keyword_hits
            .iter()
            .map(|h| (h.record_id.clone(), h.score))
            .collect();
        let vector_ranked: Vec<(String, f32)> = vector_hits
            .iter()
            .map(|h| (h.record_id.clone(), h.score))
            .collect();
        let fused = reciprocal_rank_fusion(&keyword_ranked, &vector_ranked, self.rrf_k);

        let mut by_id: HashMap<String, Hit> = HashMap::new();
        for hit in vector_hits.into_iter().chain(keyword_hits) {
            by_id.insert(hit.record_id.clone(), hit);
        }

        let mut out = Vec::new();
        for (record_id, fused_score) in fused.into_iter().take(top_k) {
            if let Some(mut hit) = by_id.remove(&record_id) {
                hit.score = fused_score;
                out.push(hit);
            }
        }
        Ok(out)
    }

    /// Run both retrievers; a failing side degrades to empty instead of
    /// failing the whole query.
    async fn both_sides(
        &self,
        request: &RetrieveRequest,
        filter: &ScopeFilter,
        top_k: usize,
    ) -> (Vec<Hit>, Vec<Hit>) {
        let keyword_hits = match self.keyword_hits(&request.query, filter, top_k) {
            Ok(hits) => hits,
            Err(e) => {
                warn!("Keyword side failed in fused retrieval: {e}");
                vec![]
            }
        };
        let vector_hits = match self
            .vector_hits(&request.query, filter, top_k, request.radius)
            .await
        {
            Ok(hits) => hits,
            Err(e) => {
                warn!("Vector side failed in fused retrieval: {e}");
                vec![]
            }
        };
        (keyword_hits, vector_hits)
    }

    /// Embed the query with `is_query` semantics, cached per query text
    async fn embed_query(&self, query: &str) -> Result<Vec<f32>> {
        {
            let mut cache = self.query_cache.lock().unwrap_or_else(|e| e.into_inner());
            if let Some(vector) = cache.get(query) {
                return Ok(vector.clone());
            }
        }
        let vector = self.vectorizer.embed(query, &EmbedOptions::query()).await?;
        let mut cache = self.query_cache.lock().unwrap_or_else(|e| e.into_inner());
        cache.put(query.to_string(), vector.clone());
        Ok(vector)
    }

    // ========================================================================
    // GROUPING
    // ========================================================================

    /// Group hits by `group_id`, hydrate parent cells, compute importance,
    /// and order groups by it.
    fn group_response(
        &self,
        hits: Vec<Hit>,
        source: &str,
        request: &RetrieveRequest,
    ) -> Result<RetrieveResponse> {
        struct GroupAccumulator {
            memories: Vec<(RetrievedMemory, f32)>,
            original_data: Vec<Vec<RawMessage>>,
        }

        let mut groups: HashMap<String, GroupAccumulator> = HashMap::new();
        let mut cell_cache: HashMap<String, Option<Vec<RawMessage>>> = HashMap::new();

        for hit in hits {
            let group_key = hit.group_id.clone().unwrap_or_default();
            let accumulator = groups.entry(group_key).or_insert_with(|| GroupAccumulator {
                memories: Vec::new(),
                original_data: Vec::new(),
            });

            for event_id in &hit.memcell_event_id_list {
                let original = cell_cache
                    .entry(event_id.clone())
                    .or_insert_with(|| {
                        match self.store.get_memcell(event_id) {
                            Ok(Some(cell)) => Some(cell.original_data),
                            Ok(None) => {
                                warn!("Parent MemCell {event_id} not found");
                                None
                            }
                            Err(e) => {
                                warn!("Parent MemCell {event_id} load failed: {e}");
                                None
                            }
                        }
                    })
                    .clone();
                if let Some(messages) = original {
                    accumulator.original_data.push(messages);
                }
            }

            accumulator.memories.push(hit.into_memory());
        }

        // importance per group, then order groups by it
        let mut ordered: Vec<(String, f64, GroupAccumulator)> = Vec::new();
        for (group_key, mut accumulator) in groups {
            let importance = match self.store.importance_for_group(&group_key) {
                Ok(rows) => aggregate_importance(&rows),
                Err(e) => {
                    warn!("Importance lookup failed for {group_key}: {e}");
                    0.0
                }
            };
            // within a group, memories are time-ordered
            accumulator
                .memories
                .sort_by_key(|(memory, _)| memory.timestamp);
            ordered.push((group_key, importance, accumulator));
        }
        ordered.sort_by(|a, b| {
            b.1.partial_cmp(&a.1)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.0.cmp(&b.0))
        });

        let mut memories = Vec::new();
        let mut scores = Vec::new();
        let mut importance_scores = Vec::new();
        let mut original_data = Vec::new();
        let mut total_count = 0;
        for (group_key, importance, accumulator) in ordered {
            let (group_memories, group_scores): (Vec<_>, Vec<_>) =
                accumulator.memories.into_iter().unzip();
            total_count += group_memories.len();
            memories.push(HashMap::from([(group_key.clone(), group_memories)]));
            scores.push(HashMap::from([(group_key.clone(), group_scores)]));
            original_data.push(HashMap::from([(group_key, accumulator.original_data)]));
            importance_scores.push(importance);
        }

        Ok(RetrieveResponse {
            memories,
            scores,
            importance_scores,
            original_data,
            total_count,
            has_more: false,
            metadata: Metadata {
                source: source.to_string(),
                user_id: request.user_id.clone().unwrap_or_default(),
                memory_type: "retrieve".to_string(),
            },
        })
    }

    // ========================================================================
    // SOFT DELETE (admin path)
    // ========================================================================

    /// Soft-delete MemCells by any combination of filters and cascade into
    /// both indexes by parent id. At least one filter must be a real value.
    pub fn soft_delete(
        &self,
        event_id: Option<&str>,
        user_id: Option<&str>,
        group_id: Option<&str>,
    ) -> Result<(Vec<String>, usize)> {
        if event_id.is_none() && user_id.is_none() && group_id.is_none() {
            return Err(EngineError::InvalidArgument(
                "at least one of event_id, user_id, group_id must be a real value".to_string(),
            ));
        }

        let deleted = self.store.soft_delete_memcells(event_id, user_id, group_id)?;
        if deleted.is_empty() {
            return Err(EngineError::NotFound(
                "No memories found matching the criteria or already deleted".to_string(),
            ));
        }

        // best-effort cascade into the indexes
        for parent_id in &deleted {
            if let Err(e) = self
                .vector
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .remove_by_parent(parent_id)
            {
                warn!("Vector cascade delete failed for {parent_id}: {e}");
            }
            if let Err(e) = self.keyword.soft_delete_by_parent(parent_id) {
                warn!("Inverted-index cascade delete failed for {parent_id}: {e}");
            }
        }

        let mut filters = Vec::new();
        if let Some(v) = event_id {
            filters.push(format!("event_id={v}"));
        }
        if let Some(v) = user_id {
            filters.push(format!("user_id={v}"));
        }
        if let Some(v) = group_id {
            filters.push(format!("group_id={v}"));
        }
        Ok((filters, deleted.len()))
    }
}

/// Drop hits whose kind is excluded by the request
fn filter_memory_types(hits: Vec<Hit>, memory_types: &[String]) -> Vec<Hit> {
    if memory_types.is_empty() {
        return hits;
    }
    hits.into_iter()
        .filter(|hit| {
            memory_types.iter().any(|t| {
                t == &hit.memory_sub_type
                    || (t == "episodic_memory" && hit.memory_sub_type == "episode")
            })
        })
        .collect()
}

/// Union keyword and vector hit lists, dropping duplicate record ids
/// (the keyword copy wins: it carries the full stored source document).
fn dedup_union(keyword_hits: Vec<Hit>, vector_hits: Vec<Hit>) -> Vec<Hit> {
    let mut seen: std::collections::HashSet<String> = std::collections::HashSet::new();
    let mut union = Vec::with_capacity(keyword_hits.len() + vector_hits.len());
    for hit in keyword_hits.into_iter().chain(vector_hits) {
        if seen.insert(hit.record_id.clone()) {
            union.push(hit);
        }
    }
    union
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_method_parsing() {
        assert_eq!(RetrieveMethod::parse_name("keyword"), Some(RetrieveMethod::Keyword));
        assert_eq!(RetrieveMethod::parse_name("rrf"), Some(RetrieveMethod::Rrf));
        assert_eq!(RetrieveMethod::parse_name("telepathy"), None);
    }

    fn hit(id: &str, kind: &str) -> Hit {
        Hit {
            record_id: id.to_string(),
            user_id: "u".into(),
            group_id: Some("g".into()),
            timestamp: Utc::now(),
            episode: "text".into(),
            memory_sub_type: kind.to_string(),
            participants: vec![],
            memcell_event_id_list: vec![],
            metadata: Value::Null,
            score: 1.0,
            search_source: "keyword",
        }
    }

    #[test]
    fn test_filter_memory_types() {
        let hits = vec![hit("a", "episode"), hit("b", "event_log"), hit("c", "semantic_memory")];
        let kept = filter_memory_types(hits.clone(), &["event_log".to_string()]);
        assert_eq!(kept.len(), 1);
        assert_eq!(kept[0].record_id, "b");

        // the wire alias `episodic_memory` selects episode records
        let kept = filter_memory_types(hits.clone(), &["episodic_memory".to_string()]);
        assert_eq!(kept.len(), 1);
        assert_eq!(kept[0].record_id, "a");

        assert_eq!(filter_memory_types(hits, &[]).len(), 3);
    }

    #[test]
    fn test_rerank_text_by_kind() {
        assert!(hit("a", "episode").rerank_text().starts_with("Episode Memory:"));
        assert!(hit("a", "event_log").rerank_text().starts_with("Atomic Fact:"));
        assert_eq!(hit("a", "semantic_memory").rerank_text(), "text");
    }

    #[test]
    fn test_dedup_union_prefers_keyword_copy() {
        let mut kw = hit("a", "episode");
        kw.search_source = "keyword";
        let mut vec_hit = hit("a", "episode");
        vec_hit.search_source = "vector";
        let union = dedup_union(vec![kw], vec![vec_hit, hit("b", "episode")]);
        assert_eq!(union.len(), 2);
        assert_eq!(union[0].search_source, "keyword");
    }
}
