//! Hybrid memory search
//!
//! Runs lexical (FTS5/BM25) and dense-vector retrieval concurrently, merges
//! candidates, applies post-filters, and ranks with a salience-weighted
//! score. Survivors are reinforced after ranking is finalized, so the side
//! effect is never observable in the caller's own result set.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use chrono::Utc;
use serde::{Deserialize, Serialize};

use crate::config::SearchConfig;
use crate::embeddings::EmbeddingService;
use crate::memory::types::{
    Memory, MemoryType, Sector, Tier, UsageType, SALIENCE_MAX, SEARCH_REINFORCE,
};
use crate::storage::{StorageError, Store};

use super::keyword::{normalize_rank, sanitize_fts_query};
use super::vector::vector_search;

// ============================================================================
// ERROR TYPES
// ============================================================================

/// Search error type
#[non_exhaustive]
#[derive(Debug, thiserror::Error)]
pub enum SearchError {
    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),
    #[error("Validation error: {0}")]
    Validation(String),
    #[error("Not found: {0}")]
    NotFound(String),
}

/// Search result type
pub type Result<T> = std::result::Result<T, SearchError>;

// ============================================================================
// REQUEST / RESPONSE
// ============================================================================

/// Search mode
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SearchMode {
    #[default]
    Hybrid,
    Semantic,
    Keyword,
}

/// Ranking weight profile. Declared once; caller-overridable per request.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RankWeights {
    pub similarity: f64,
    pub keyword: f64,
    pub salience: f64,
    pub recency: f64,
    pub access: f64,
}

impl Default for RankWeights {
    fn default() -> Self {
        Self::from(&SearchConfig::default())
    }
}

impl From<&SearchConfig> for RankWeights {
    fn from(config: &SearchConfig) -> Self {
        Self {
            similarity: config.semantic_weight,
            keyword: config.keyword_weight,
            salience: config.salience_weight,
            recency: config.recency_weight,
            access: config.access_weight,
        }
    }
}

/// A hybrid search request
#[derive(Debug, Clone)]
pub struct SearchRequest {
    pub query: String,
    pub project_id: Option<String>,
    pub sector: Option<Sector>,
    pub tier: Option<Tier>,
    pub memory_type: Option<MemoryType>,
    pub limit: usize,
    pub min_salience: f64,
    pub include_superseded: bool,
    /// Restrict to memories linked to this session, and link survivors to it
    /// with `usage_type = recalled`
    pub session_id: Option<String>,
    pub mode: SearchMode,
    pub weights: Option<RankWeights>,
}

impl Default for SearchRequest {
    fn default() -> Self {
        Self {
            query: String::new(),
            project_id: None,
            sector: None,
            tier: None,
            memory_type: None,
            limit: 10,
            min_salience: 0.0,
            include_superseded: false,
            session_id: None,
            mode: SearchMode::Hybrid,
            weights: None,
        }
    }
}

impl SearchRequest {
    pub fn new(query: impl Into<String>) -> Self {
        Self {
            query: query.into(),
            ..Default::default()
        }
    }

    /// A request seeded from configured search defaults
    pub fn with_config(query: impl Into<String>, config: &SearchConfig) -> Self {
        Self {
            query: query.into(),
            limit: config.default_limit,
            include_superseded: config.include_superseded,
            weights: Some(RankWeights::from(config)),
            ..Default::default()
        }
    }
}

/// Which retrieval side(s) produced a result
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MatchType {
    Semantic,
    Keyword,
    Both,
}

/// One ranked search result with enrichment
#[derive(Debug, Clone)]
pub struct SearchResult {
    pub memory: Memory,
    pub score: f64,
    pub match_type: MatchType,
    /// FTS snippet with match markers, when the keyword side contributed
    pub highlights: Option<String>,
    /// Session that created the memory
    pub source_session: Option<String>,
    pub is_superseded: bool,
    pub superseded_by: Option<String>,
    pub related_memory_count: i64,
}

// ============================================================================
// CANDIDATES
// ============================================================================

#[derive(Debug, Default, Clone)]
struct Candidate {
    fts_rank: Option<f64>,
    similarity: Option<f32>,
    snippet: Option<String>,
}

// ============================================================================
// SEARCHER
// ============================================================================

/// Hybrid searcher over the shared store
pub struct HybridSearcher {
    store: Arc<Store>,
    embeddings: Option<Arc<EmbeddingService>>,
}

impl HybridSearcher {
    pub fn new(store: Arc<Store>, embeddings: Option<Arc<EmbeddingService>>) -> Self {
        Self { store, embeddings }
    }

    /// Execute a search request
    pub async fn search(&self, request: SearchRequest) -> Result<Vec<SearchResult>> {
        if request.query.trim().is_empty() {
            return Err(SearchError::Validation("query must not be empty".into()));
        }

        // Degrade to keyword when no embedding service is configured
        let mut mode = request.mode;
        if self.embeddings.is_none() && mode != SearchMode::Keyword {
            tracing::warn!("No embedding service configured; degrading search to keyword mode");
            mode = SearchMode::Keyword;
        }

        let fetch_limit = request.limit.max(1) * 2;
        let project_id = request.project_id.as_deref();

        let fts_side = async {
            if mode == SearchMode::Semantic {
                return Ok(Vec::new());
            }
            let match_query = sanitize_fts_query(&request.query);
            self.store
                .fts_search_memories(&match_query, project_id, fetch_limit)
        };

        let vector_side = async {
            if mode == SearchMode::Keyword {
                return Vec::new();
            }
            let embeddings = self.embeddings.as_ref().expect("checked above");
            // The query is embedded exactly once per call
            match embeddings.embed(&request.query).await {
                Ok((query_vector, _meta)) => {
                    let model_id = embeddings.get_active_model_id();
                    match vector_search(
                        &self.store,
                        project_id,
                        &model_id,
                        &query_vector,
                        fetch_limit,
                    ) {
                        Ok(hits) => hits,
                        Err(e) => {
                            tracing::warn!(error = %e, "Vector search failed; keyword side only");
                            Vec::new()
                        }
                    }
                }
                Err(e) => {
                    tracing::warn!(error = %e, "Query embedding failed; keyword side only");
                    Vec::new()
                }
            }
        };

        let (fts_hits, vector_hits) = tokio::join!(fts_side, vector_side);
        let fts_hits = fts_hits?;

        // Merge into a candidate map keyed by memory id
        let mut candidates: HashMap<String, Candidate> = HashMap::new();
        for hit in fts_hits {
            let entry = candidates.entry(hit.memory_id).or_default();
            entry.fts_rank = Some(hit.rank);
            entry.snippet = hit.snippet;
        }
        for hit in vector_hits {
            candidates.entry(hit.memory_id).or_default().similarity = Some(hit.similarity);
        }

        if candidates.is_empty() {
            return Ok(Vec::new());
        }

        // Fetch candidate memories once, then post-filter
        let ids: Vec<String> = candidates.keys().cloned().collect();
        let memories = self.store.get_memories_by_ids(&ids)?;

        let session_members: Option<HashSet<String>> = match &request.session_id {
            Some(session_id) => Some(
                self.store
                    .memories_for_session(session_id)?
                    .into_iter()
                    .map(|m| m.id)
                    .collect(),
            ),
            None => None,
        };

        let weights = request.weights.unwrap_or_default();
        let now = Utc::now();

        let mut scored: Vec<(Memory, Candidate, f64)> = Vec::new();
        for memory in memories {
            if memory.is_deleted {
                continue;
            }
            if let Some(sector) = request.sector {
                if memory.sector != sector {
                    continue;
                }
            }
            if let Some(tier) = request.tier {
                if memory.tier != tier {
                    continue;
                }
            }
            if let Some(memory_type) = request.memory_type {
                if memory.memory_type != Some(memory_type) {
                    continue;
                }
            }
            if memory.salience < request.min_salience {
                continue;
            }
            if !request.include_superseded && memory.is_superseded() {
                continue;
            }
            if let Some(members) = &session_members {
                if !members.contains(&memory.id) {
                    continue;
                }
            }

            let candidate = candidates.remove(&memory.id).unwrap_or_default();
            let score = combined_score(&memory, &candidate, &weights, now);
            scored.push((memory, candidate, score));
        }

        // Sort by score, tie-break on updated_at, both descending
        scored.sort_by(|a, b| {
            b.2.partial_cmp(&a.2)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| b.0.updated_at.cmp(&a.0.updated_at))
        });
        scored.truncate(request.limit);

        // Reinforcement fires after ranking is finalized; the caller's
        // result set shows pre-reinforcement state
        for (memory, _, _) in &scored {
            let next =
                (memory.salience + SEARCH_REINFORCE * (1.0 - memory.salience)).min(SALIENCE_MAX);
            if let Err(e) = self.store.set_salience(&memory.id, next, true) {
                tracing::warn!(memory = %memory.id, error = %e, "Search reinforcement failed");
            }
            if let Some(session_id) = &request.session_id {
                if let Err(e) =
                    self.store
                        .link_to_session(session_id, &memory.id, UsageType::Recalled)
                {
                    tracing::warn!(memory = %memory.id, error = %e, "Recall link failed");
                }
            }
        }

        // Batched enrichment, one query each
        let result_ids: Vec<String> = scored.iter().map(|(m, _, _)| m.id.clone()).collect();
        let source_sessions = self.store.source_sessions(&result_ids)?;
        let superseding = self.store.superseding_map(&result_ids)?;
        let related = self.store.related_counts(&result_ids)?;

        Ok(scored
            .into_iter()
            .map(|(memory, candidate, score)| {
                let match_type = match (candidate.fts_rank.is_some(), candidate.similarity.is_some())
                {
                    (true, true) => MatchType::Both,
                    (false, true) => MatchType::Semantic,
                    _ => MatchType::Keyword,
                };
                SearchResult {
                    source_session: source_sessions.get(&memory.id).cloned(),
                    superseded_by: superseding.get(&memory.id).cloned(),
                    is_superseded: memory.is_superseded(),
                    related_memory_count: related.get(&memory.id).copied().unwrap_or(0),
                    highlights: candidate.snippet,
                    match_type,
                    score,
                    memory,
                }
            })
            .collect())
    }
}

/// `w_sim·similarity + w_fts·normalize(rank) + w_sal·salience +
/// w_recency·recency + w_access·min(1, accesses/10)`
fn combined_score(
    memory: &Memory,
    candidate: &Candidate,
    weights: &RankWeights,
    now: chrono::DateTime<Utc>,
) -> f64 {
    let similarity = candidate.similarity.unwrap_or(0.0) as f64;
    let keyword = candidate.fts_rank.map(normalize_rank).unwrap_or(0.0);
    let days_idle = (now - memory.updated_at).num_seconds().max(0) as f64 / 86_400.0;
    let recency = (-days_idle / 30.0).exp();
    let access = (memory.access_count as f64 / 10.0).min(1.0);

    weights.similarity * similarity
        + weights.keyword * keyword
        + weights.salience * memory.salience
        + weights.recency * recency
        + weights.access * access
}

// ============================================================================
// TESTS
// ============================================================================
