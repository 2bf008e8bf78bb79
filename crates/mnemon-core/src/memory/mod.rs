//! Memory Engine
//!
//! Classifies, deduplicates, ranks, decays, and supersedes free-text memories
//! derived from tool observations, user preferences, and session summaries.
//!
//! - [`MemoryStore`]: CRUD, soft delete, dedup-with-reinforcement, session
//!   linking, timeline, stats
//! - [`classifier`]: sector classification + concept/file extraction
//! - [`decay`]: salience decay math and the background decay task
//! - [`relationships`]: typed directed edges

pub mod classifier;
pub mod decay;
pub mod relationships;
pub mod types;

pub use classifier::{classify_sector, extract_concepts, extract_files};
pub use decay::{decay_salience, DecayStats, DecayTask};
pub use relationships::{ExtractedBy, MemoryRelationship, RelationshipType};
pub use types::{
    CreateMemoryInput, ListFilter, ListOrder, Memory, MemoryPatch, MemoryStats, MemoryType,
    Project, Sector, Session, Tier, UsageType, DEEMPHASIZE_DEFAULT, REINFORCE_DEFAULT,
    SALIENCE_FLOOR, SALIENCE_MAX,
};

use std::sync::Arc;

use chrono::Utc;

use crate::dedup;
use crate::embeddings::EmbeddingService;
use crate::storage::{StorageError, Store};
use types::{MAX_CONTENT_LEN, MIN_CONTENT_LEN, PROMOTION_SALIENCE};

// ============================================================================
// ERROR TYPES
// ============================================================================

/// Memory service error type
#[non_exhaustive]
#[derive(Debug, thiserror::Error)]
pub enum MemoryError {
    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),
    #[error("Not found: {0}")]
    NotFound(String),
    #[error("Validation error: {0}")]
    Validation(String),
}

/// Memory service result type
pub type Result<T> = std::result::Result<T, MemoryError>;

// ============================================================================
// OUTPUT TYPES
// ============================================================================

/// Result of `create`: either a fresh memory or the reinforced duplicate
#[derive(Debug, Clone)]
pub struct CreateOutcome {
    pub memory: Memory,
    /// True when an existing near-duplicate was reinforced instead of
    /// inserting a new row
    pub deduplicated: bool,
}

/// One entry of a timeline view
#[derive(Debug, Clone)]
pub struct TimelineEntry {
    pub memory: Memory,
    /// Session that created the memory, when known
    pub source_session_id: Option<String>,
}

/// Project memories around an anchor, ordered oldest → newest
#[derive(Debug, Clone)]
pub struct Timeline {
    pub anchor: TimelineEntry,
    pub before: Vec<TimelineEntry>,
    pub after: Vec<TimelineEntry>,
}

// ============================================================================
// MEMORY STORE
// ============================================================================

/// How many recent memories the SimHash duplicate scan examines
const DUPLICATE_SCAN_LIMIT: usize = 256;

/// Memory engine over the shared store. Embedding is optional; creation and
/// search degrade gracefully without it.
pub struct MemoryStore {
    store: Arc<Store>,
    embeddings: Option<Arc<EmbeddingService>>,
}

impl MemoryStore {
    pub fn new(store: Arc<Store>, embeddings: Option<Arc<EmbeddingService>>) -> Self {
        Self { store, embeddings }
    }

    pub fn store(&self) -> &Arc<Store> {
        &self.store
    }

    pub fn embeddings(&self) -> Option<&Arc<EmbeddingService>> {
        self.embeddings.as_ref()
    }

    // ========================================================================
    // Sessions
    // ========================================================================

    /// Start a session for a project; any prior active session is ended
    pub fn start_session(&self, project_id: &str, context: Option<&str>) -> Result<Session> {
        Ok(self.store.start_session(project_id, context)?)
    }

    /// End a session and promote its high-salience session-tier memories to
    /// project tier. Returns the number promoted.
    pub fn end_session(&self, session_id: &str, summary: Option<&str>) -> Result<usize> {
        self.store.end_session(session_id, summary)?;
        let promoted = self
            .store
            .promote_session_memories(session_id, PROMOTION_SALIENCE)?;
        if promoted > 0 {
            tracing::info!(session = session_id, promoted, "Promoted session memories");
        }
        Ok(promoted)
    }

    // ========================================================================
    // Create (dedup-with-reinforcement)
    // ========================================================================

    /// Create a memory, or reinforce and return an existing near-duplicate.
    ///
    /// Embedding failures are logged and non-fatal: the memory is stored
    /// without a vector and keyword search still reaches it.
    pub async fn create(&self, project_id: &str, input: CreateMemoryInput) -> Result<CreateOutcome> {
        if input.content.len() < MIN_CONTENT_LEN {
            return Err(MemoryError::Validation(format!(
                "content too short (min {} chars)",
                MIN_CONTENT_LEN
            )));
        }
        if input.content.len() > MAX_CONTENT_LEN {
            return Err(MemoryError::Validation(format!(
                "content too long (max {} chars)",
                MAX_CONTENT_LEN
            )));
        }

        let content_hash = dedup::content_hash(&input.content);
        let simhash = dedup::simhash(&input.content);
        let session_id = match &input.session_id {
            Some(id) => Some(id.clone()),
            None => self.store.active_session(project_id)?.map(|s| s.id),
        };

        // Exact-hash fast path, then the SimHash candidate scan
        let duplicate_id = match self.store.find_by_content_hash(project_id, &content_hash)? {
            Some(id) => Some(id),
            None => self
                .store
                .duplicate_candidates(project_id, DUPLICATE_SCAN_LIMIT)?
                .into_iter()
                .find(|(_, candidate)| dedup::is_duplicate(&simhash, candidate))
                .map(|(id, _)| id),
        };

        if let Some(existing_id) = duplicate_id {
            let memory = self.reinforce(&existing_id, REINFORCE_DEFAULT)?;
            if let Some(session_id) = &session_id {
                self.store
                    .link_to_session(session_id, &memory.id, UsageType::Reinforced)?;
            }
            tracing::debug!(memory = %memory.id, "Duplicate content reinforced existing memory");
            return Ok(CreateOutcome {
                memory,
                deduplicated: true,
            });
        }

        let sector = input
            .sector
            .unwrap_or_else(|| classifier::classify_sector(&input.content));

        let mut files = classifier::extract_files(&input.content);
        for file in &input.files {
            if !files.contains(file) {
                files.push(file.clone());
            }
        }

        let now = Utc::now();
        let memory = Memory {
            id: uuid::Uuid::new_v4().to_string(),
            project_id: project_id.to_string(),
            content: input.content.clone(),
            summary: input.summary,
            content_hash,
            simhash: Some(simhash),
            sector,
            tier: input.tier.unwrap_or_default(),
            memory_type: input.memory_type,
            importance: input.importance.unwrap_or(0.5).clamp(0.0, 1.0),
            salience: SALIENCE_MAX,
            access_count: 0,
            created_at: now,
            updated_at: now,
            last_accessed: now,
            valid_from: input.valid_from,
            valid_until: None,
            is_deleted: false,
            deleted_at: None,
            tags: input.tags,
            concepts: classifier::extract_concepts(&input.content),
            files,
            categories: input.categories,
        };

        self.store.insert_memory(&memory)?;
        self.embed_best_effort(&memory.id, &memory.content).await;

        if let Some(session_id) = &session_id {
            self.store
                .link_to_session(session_id, &memory.id, UsageType::Created)?;
        }

        Ok(CreateOutcome {
            memory,
            deduplicated: false,
        })
    }

    /// Generate and persist the embedding; failure is logged, never fatal
    async fn embed_best_effort(&self, memory_id: &str, content: &str) {
        let Some(embeddings) = &self.embeddings else {
            return;
        };
        match embeddings.embed(content).await {
            Ok((vector, meta)) => {
                if let Err(e) =
                    self.store
                        .upsert_memory_vector(memory_id, &embeddings.get_active_model_id(), &vector)
                {
                    tracing::warn!(memory = memory_id, error = %e, "Failed to persist embedding");
                } else {
                    tracing::trace!(memory = memory_id, model = %meta.model, "Embedding stored");
                }
            }
            Err(e) => {
                tracing::warn!(memory = memory_id, error = %e, "Embedding failed; memory stored without vector");
            }
        }
    }

    // ========================================================================
    // Read / update / delete
    // ========================================================================

    /// Returns soft-deleted memories too, so callers can distinguish deleted
    /// from missing
    pub fn get(&self, id: &str) -> Result<Option<Memory>> {
        Ok(self.store.get_memory(id)?)
    }

    /// Apply a field patch. Content changes recompute hashes, extracted
    /// concepts/files, and the embedding.
    pub async fn update(&self, id: &str, patch: MemoryPatch) -> Result<Memory> {
        let mut memory = self
            .store
            .get_memory(id)?
            .ok_or_else(|| MemoryError::NotFound(id.to_string()))?;

        let mut content_changed = false;
        if let Some(content) = patch.content {
            if content != memory.content {
                memory.content_hash = dedup::content_hash(&content);
                memory.simhash = Some(dedup::simhash(&content));
                memory.concepts = classifier::extract_concepts(&content);
                memory.files = classifier::extract_files(&content);
                memory.content = content;
                content_changed = true;
            }
        }
        if let Some(summary) = patch.summary {
            memory.summary = summary;
        }
        if let Some(importance) = patch.importance {
            memory.importance = importance.clamp(0.0, 1.0);
        }
        if let Some(tier) = patch.tier {
            memory.tier = tier;
        }
        if let Some(memory_type) = patch.memory_type {
            memory.memory_type = memory_type;
        }
        if let Some(tags) = patch.tags {
            memory.tags = tags;
        }
        if let Some(categories) = patch.categories {
            memory.categories = categories;
        }

        self.store.update_memory(&memory)?;
        if content_changed {
            self.embed_best_effort(&memory.id, &memory.content).await;
        }

        // Re-read for the fresh updated_at
        Ok(self
            .store
            .get_memory(id)?
            .ok_or_else(|| MemoryError::NotFound(id.to_string()))?)
    }

    /// Soft delete by default; hard delete removes the row and cascades
    pub fn delete(&self, id: &str, hard: bool) -> Result<()> {
        if hard {
            self.store.hard_delete_memory(id)?;
        } else {
            self.store.soft_delete_memory(id)?;
        }
        Ok(())
    }

    pub fn restore(&self, id: &str) -> Result<()> {
        Ok(self.store.restore_memory(id)?)
    }

    pub fn list(&self, filter: &ListFilter) -> Result<Vec<Memory>> {
        Ok(self.store.list_memories(filter)?)
    }

    pub fn get_by_session(&self, session_id: &str) -> Result<Vec<Memory>> {
        Ok(self.store.memories_for_session(session_id)?)
    }

    pub fn stats(&self, project_id: &str) -> Result<MemoryStats> {
        Ok(self.store.memory_stats(project_id)?)
    }

    // ========================================================================
    // Salience lifecycle
    // ========================================================================

    /// `salience ← min(1, salience + amount·(1−salience))`, with an access
    /// bump. Diminishing returns as salience approaches 1.
    pub fn reinforce(&self, id: &str, amount: f64) -> Result<Memory> {
        let memory = self
            .store
            .get_memory(id)?
            .ok_or_else(|| MemoryError::NotFound(id.to_string()))?;
        let next = (memory.salience + amount * (1.0 - memory.salience)).min(SALIENCE_MAX);
        self.store.set_salience(id, next, true)?;
        Ok(self
            .store
            .get_memory(id)?
            .ok_or_else(|| MemoryError::NotFound(id.to_string()))?)
    }

    /// `salience ← max(0.05, salience − amount)`
    pub fn deemphasize(&self, id: &str, amount: f64) -> Result<Memory> {
        let memory = self
            .store
            .get_memory(id)?
            .ok_or_else(|| MemoryError::NotFound(id.to_string()))?;
        let next = (memory.salience - amount).max(SALIENCE_FLOOR);
        self.store.set_salience(id, next, false)?;
        Ok(self
            .store
            .get_memory(id)?
            .ok_or_else(|| MemoryError::NotFound(id.to_string()))?)
    }

    /// Update last_accessed and bump access_count
    pub fn touch(&self, id: &str) -> Result<()> {
        Ok(self.store.touch_memory(id)?)
    }

    /// Idempotent session link
    pub fn link_to_session(
        &self,
        session_id: &str,
        memory_id: &str,
        usage: UsageType,
    ) -> Result<()> {
        Ok(self.store.link_to_session(session_id, memory_id, usage)?)
    }

    // ========================================================================
    // Timeline
    // ========================================================================

    /// Project memories around an anchor. Fails when the anchor is missing
    /// or deleted; deleted neighbours are excluded.
    pub fn timeline(
        &self,
        anchor_id: &str,
        depth_before: usize,
        depth_after: usize,
    ) -> Result<Timeline> {
        let anchor = self
            .store
            .get_memory(anchor_id)?
            .filter(|m| !m.is_deleted)
            .ok_or_else(|| MemoryError::NotFound(anchor_id.to_string()))?;

        let mut before = self
            .store
            .memories_before(&anchor.project_id, anchor.created_at, depth_before)?;
        before.reverse(); // newest-first query, oldest-first view
        let after = self
            .store
            .memories_after(&anchor.project_id, anchor.created_at, depth_after)?;

        let mut ids: Vec<String> = Vec::with_capacity(before.len() + after.len() + 1);
        ids.push(anchor.id.clone());
        ids.extend(before.iter().map(|m| m.id.clone()));
        ids.extend(after.iter().map(|m| m.id.clone()));
        let sessions = self.store.source_sessions(&ids)?;

        let entry = |memory: Memory| {
            let source_session_id = sessions.get(&memory.id).cloned();
            TimelineEntry {
                memory,
                source_session_id,
            }
        };

        Ok(Timeline {
            anchor: entry(anchor),
            before: before.into_iter().map(entry).collect(),
            after: after.into_iter().map(entry).collect(),
        })
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn service() -> (TempDir, MemoryStore, String) {
        let temp = TempDir::new().unwrap();
        let store = Arc::new(Store::open(temp.path().join("memories.db")).unwrap());
        let project = store.upsert_project("/p", "p").unwrap();
        (temp, MemoryStore::new(store, None), project.id)
    }

    fn input(content: &str) -> CreateMemoryInput {
        CreateMemoryInput {
            content: content.to_string(),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn create_classifies_and_extracts() {
        let (_temp, service, project) = service();
        let outcome = service
            .create(&project, input("To deploy: first run build, then push to main"))
            .await
            .unwrap();
        assert!(!outcome.deduplicated);
        assert_eq!(outcome.memory.sector, Sector::Procedural);
        assert_eq!(outcome.memory.salience, 1.0);
        assert!(outcome.memory.simhash.is_some());
    }

    #[tokio::test]
    async fn create_rejects_bad_lengths() {
        let (_temp, service, project) = service();
        assert!(matches!(
            service.create(&project, input("hey")).await,
            Err(MemoryError::Validation(_))
        ));
        let huge = "x".repeat(MAX_CONTENT_LEN + 1);
        assert!(matches!(
            service.create(&project, input(&huge)).await,
            Err(MemoryError::Validation(_))
        ));
    }

    #[tokio::test]
    async fn duplicate_content_reinforces_existing() {
        let (_temp, service, project) = service();
        let first = service
            .create(&project, input("The API endpoint is /api/users"))
            .await
            .unwrap();
        assert!(!first.deduplicated);

        service
            .deemphasize(&first.memory.id, 0.5)
            .unwrap();

        let second = service
            .create(&project, input("The API endpoint is /api/users"))
            .await
            .unwrap();
        assert!(second.deduplicated);
        assert_eq!(second.memory.id, first.memory.id);
        assert!(second.memory.salience > 0.5);
        assert!(second.memory.salience <= 1.0);
        assert_eq!(second.memory.access_count, first.memory.access_count + 1);
    }

    #[tokio::test]
    async fn near_duplicate_whitespace_variant_is_caught() {
        let (_temp, service, project) = service();
        let first = service
            .create(&project, input("The API endpoint is /api/users"))
            .await
            .unwrap();
        let second = service
            .create(&project, input("The  API endpoint is /api/users "))
            .await
            .unwrap();
        assert!(second.deduplicated);
        assert_eq!(second.memory.id, first.memory.id);
    }

    #[tokio::test]
    async fn different_projects_do_not_dedup() {
        let (_temp, service, project) = service();
        let other = service
            .store()
            .upsert_project("/other", "other")
            .unwrap();

        let first = service
            .create(&project, input("Shared fact across projects"))
            .await
            .unwrap();
        let second = service
            .create(&other.id, input("Shared fact across projects"))
            .await
            .unwrap();
        assert!(!second.deduplicated);
        assert_ne!(first.memory.id, second.memory.id);
    }

    #[tokio::test]
    async fn reinforce_monotone_with_diminishing_returns() {
        let (_temp, service, project) = service();
        let memory = service
            .create(&project, input("Reinforcement target memory"))
            .await
            .unwrap()
            .memory;

        let low = service.deemphasize(&memory.id, 0.7).unwrap();
        let gain_low = service.reinforce(&memory.id, 0.1).unwrap().salience - low.salience;

        let high = service.reinforce(&memory.id, 0.5).unwrap();
        let gain_high = service.reinforce(&memory.id, 0.1).unwrap().salience - high.salience;
        assert!(gain_high < gain_low);

        // At the ceiling, reinforcement is a no-op
        for _ in 0..20 {
            service.reinforce(&memory.id, 1.0).unwrap();
        }
        let maxed = service.reinforce(&memory.id, 0.5).unwrap();
        assert_eq!(maxed.salience, SALIENCE_MAX);
    }

    #[tokio::test]
    async fn deemphasize_converges_to_floor() {
        let (_temp, service, project) = service();
        let memory = service
            .create(&project, input("Deemphasize target memory"))
            .await
            .unwrap()
            .memory;

        for _ in 0..5 {
            service.deemphasize(&memory.id, 1.0).unwrap();
        }
        let floored = service.get(&memory.id).unwrap().unwrap();
        assert_eq!(floored.salience, SALIENCE_FLOOR);
    }

    #[tokio::test]
    async fn session_links_are_created_and_promoted() {
        let (_temp, service, project) = service();
        let session = service.start_session(&project, None).unwrap();

        let outcome = service
            .create(
                &project,
                CreateMemoryInput {
                    content: "Session-scoped observation worth keeping".to_string(),
                    tier: Some(Tier::Session),
                    ..Default::default()
                },
            )
            .await
            .unwrap();

        let linked = service.get_by_session(&session.id).unwrap();
        assert_eq!(linked.len(), 1);
        assert_eq!(linked[0].id, outcome.memory.id);

        let promoted = service.end_session(&session.id, Some("wrap up")).unwrap();
        assert_eq!(promoted, 1);
        assert_eq!(
            service.get(&outcome.memory.id).unwrap().unwrap().tier,
            Tier::Project
        );
    }

    #[tokio::test]
    async fn update_content_recomputes_derived_fields() {
        let (_temp, service, project) = service();
        let memory = service
            .create(&project, input("Original text about src/old.rs"))
            .await
            .unwrap()
            .memory;

        let updated = service
            .update(
                &memory.id,
                MemoryPatch {
                    content: Some("Rewritten text about src/new.rs".to_string()),
                    ..Default::default()
                },
            )
            .await
            .unwrap();

        assert_ne!(updated.content_hash, memory.content_hash);
        assert_eq!(updated.files, vec!["src/new.rs"]);
        assert!(updated.updated_at >= memory.updated_at);
    }

    #[tokio::test]
    async fn update_missing_is_not_found() {
        let (_temp, service, _project) = service();
        assert!(matches!(
            service.update("nope", MemoryPatch::default()).await,
            Err(MemoryError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn timeline_orders_around_anchor() {
        let (_temp, service, project) = service();
        let mut ids = Vec::new();
        for i in 0..5 {
            let outcome = service
                .create(&project, input(&format!("Timeline event number {}", i)))
                .await
                .unwrap();
            ids.push(outcome.memory.id.clone());
            tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        }

        let timeline = service.timeline(&ids[2], 2, 2).unwrap();
        assert_eq!(timeline.anchor.memory.id, ids[2]);
        assert_eq!(
            timeline.before.iter().map(|e| e.memory.id.clone()).collect::<Vec<_>>(),
            vec![ids[0].clone(), ids[1].clone()]
        );
        assert_eq!(
            timeline.after.iter().map(|e| e.memory.id.clone()).collect::<Vec<_>>(),
            vec![ids[3].clone(), ids[4].clone()]
        );

        // Deleted anchor fails; deleted neighbours are excluded
        service.delete(&ids[3], false).unwrap();
        let timeline = service.timeline(&ids[2], 2, 2).unwrap();
        assert_eq!(timeline.after.len(), 1);
        assert_eq!(timeline.after[0].memory.id, ids[4]);
        service.delete(&ids[2], false).unwrap();
        assert!(service.timeline(&ids[2], 1, 1).is_err());
    }
}
