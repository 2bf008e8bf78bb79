//! Hybrid Search
//!
//! Parallel FTS5 + dense-vector retrieval over memories with a
//! salience-weighted ranker:
//! - Keyword side: sanitized prefix-token MATCH, BM25-ordered
//! - Semantic side: exact cosine over the active model's vectors
//! - Post-filters, combined scoring, reinforcement side effects

mod hybrid;
mod keyword;
mod vector;

pub use hybrid::{
    HybridSearcher, MatchType, RankWeights, Result, SearchError, SearchMode, SearchRequest,
    SearchResult,
};
pub use keyword::{normalize_rank, sanitize_fts_query};
pub use vector::{vector_search, VectorHit};
