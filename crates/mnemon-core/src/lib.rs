//! # Mnemon Core
//!
//! Per-developer, per-project persistent memory and code-search engine for
//! LLM coding assistants:
//!
//! - **Memory Engine**: classifies, deduplicates (64-bit SimHash), ranks,
//!   decays, and supersedes free-text memories; hybrid FTS5 + dense-vector
//!   retrieval with a salience-weighted ranker
//! - **Code Indexing Pipeline**: bounded, backpressured five-stage streaming
//!   pipeline (scan → read → chunk → embed → write) with layered ignore
//!   rules, a refunding token-bucket rate limiter, and incremental updates
//!   via a debounced file watcher that injects directly into the pipeline
//! - **Embedding Providers**: local Ollama-compatible HTTP with remote
//!   OpenAI-compatible fallback, availability probing, and model registry
//! - **Storage**: one SQLite store (WAL, FTS5 mirrors, float32 vector blobs)
//!   shared by both subsystems
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use mnemon_core::{CreateMemoryInput, MemoryStore, SearchRequest, HybridSearcher, Store};
//!
//! let store = Arc::new(Store::open_default()?);
//! let project = store.upsert_project("/home/dev/app", "app")?;
//!
//! let memories = MemoryStore::new(store.clone(), None);
//! memories.create(&project.id, CreateMemoryInput {
//!     content: "The API endpoint is /api/users".to_string(),
//!     ..Default::default()
//! }).await?;
//!
//! let searcher = HybridSearcher::new(store, None);
//! let results = searcher.search(SearchRequest::new("api endpoint")).await?;
//! ```
//!
//! The CLI, Web UI, and MCP transport are external consumers of this crate.

// ============================================================================
// MODULES
// ============================================================================

pub mod config;
pub mod dedup;
pub mod embeddings;
pub mod index;
pub mod memory;
pub mod search;
pub mod storage;
pub mod watch;

// ============================================================================
// PUBLIC API RE-EXPORTS
// ============================================================================

// Configuration + layout
pub use config::{
    data_dir, database_path, project_hash, watcher_lock_path, Config, DecayConfig,
    EmbeddingConfig, IndexConfig, ProviderKind, SearchConfig,
};

// Storage layer
pub use storage::{Document, EmbeddingModelRow, StorageError, Store};

// Memory engine
pub use memory::{
    classify_sector, decay_salience, CreateMemoryInput, CreateOutcome, DecayTask, ExtractedBy,
    ListFilter, ListOrder, Memory, MemoryError, MemoryPatch, MemoryRelationship, MemoryStats,
    MemoryStore, MemoryType, Project, RelationshipType, Sector, Session, Tier, Timeline,
    UsageType,
};

// Dedup / similarity
pub use dedup::{content_hash, hamming_distance, simhash, DUPLICATE_THRESHOLD};

// Embedding providers
pub use embeddings::{
    cosine_similarity, EmbeddingError, EmbeddingMetadata, EmbeddingProvider, EmbeddingService,
    OllamaProvider, OpenAiProvider,
};

// Hybrid search
pub use search::{
    HybridSearcher, MatchType, RankWeights, SearchError, SearchMode, SearchRequest, SearchResult,
};

// Code indexing
pub use index::{
    chunk_file, ChunkType, CodeChunk, CodeIndexer, IndexReport, Pipeline, PipelineConfig,
    PipelineFile, PipelineResult, ProgressEvent, RateLimiter, RunningPipeline, ScanReport,
    ScannedFile, Scanner,
};

// Watcher + coordination
pub use watch::{CodeWatcher, LockHandle, WatchEvent, WatchSink, WatcherConfig, WatcherLock};

// ============================================================================
// VERSION INFO
// ============================================================================

/// Crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

// ============================================================================
// PRELUDE
// ============================================================================

/// Convenient imports for common usage
pub mod prelude {
    pub use crate::{
        Config, CreateMemoryInput, HybridSearcher, Memory, MemoryStore, SearchMode,
        SearchRequest, Sector, Store, Tier,
    };

    pub use crate::{EmbeddingProvider, EmbeddingService};

    pub use crate::{CodeIndexer, CodeWatcher, LockHandle, Pipeline, PipelineConfig, Scanner};
}
