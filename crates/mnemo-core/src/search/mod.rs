//! Search indexes
//!
//! The two ranked retrievers and their fusion:
//! - Vector search using HNSW (USearch) with scalar post-filtering
//! - Keyword search using BM25/FTS5
//! - Reciprocal Rank Fusion for the hybrid/rrf retrieval paths

mod hybrid;
mod keyword;
mod vector;

pub use hybrid::{reciprocal_rank_fusion, DEFAULT_RRF_K};
pub use keyword::{tokenize_query, KeywordHit, KeywordIndex, KeywordIndexError};
pub use vector::{
    VectorEntry, VectorHit, VectorIndex, VectorIndexConfig, VectorIndexError,
    DEFAULT_CONNECTIVITY, DEFAULT_DIMENSIONS,
};
