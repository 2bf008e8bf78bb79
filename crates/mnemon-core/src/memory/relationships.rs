//! Typed directed edges over memories
//!
//! Edges carry bi-temporal validity: queries default to open edges
//! (`valid_until IS NULL`) unless history is explicitly requested. A
//! SUPERSEDES edge additionally closes the target memory's validity window.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::storage::{Result, StorageError, Store};

use super::types::Memory;

// ============================================================================
// EDGE TYPES
// ============================================================================

/// Relationship kinds between memories
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RelationshipType {
    Supersedes,
    Contradicts,
    RelatedTo,
    BuildsOn,
    Confirms,
    AppliesTo,
    DependsOn,
    AlternativeTo,
}

impl RelationshipType {
    pub fn as_str(&self) -> &'static str {
        match self {
            RelationshipType::Supersedes => "SUPERSEDES",
            RelationshipType::Contradicts => "CONTRADICTS",
            RelationshipType::RelatedTo => "RELATED_TO",
            RelationshipType::BuildsOn => "BUILDS_ON",
            RelationshipType::Confirms => "CONFIRMS",
            RelationshipType::AppliesTo => "APPLIES_TO",
            RelationshipType::DependsOn => "DEPENDS_ON",
            RelationshipType::AlternativeTo => "ALTERNATIVE_TO",
        }
    }
}

impl std::fmt::Display for RelationshipType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for RelationshipType {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_uppercase().as_str() {
            "SUPERSEDES" => Ok(RelationshipType::Supersedes),
            "CONTRADICTS" => Ok(RelationshipType::Contradicts),
            "RELATED_TO" => Ok(RelationshipType::RelatedTo),
            "BUILDS_ON" => Ok(RelationshipType::BuildsOn),
            "CONFIRMS" => Ok(RelationshipType::Confirms),
            "APPLIES_TO" => Ok(RelationshipType::AppliesTo),
            "DEPENDS_ON" => Ok(RelationshipType::DependsOn),
            "ALTERNATIVE_TO" => Ok(RelationshipType::AlternativeTo),
            _ => Err(format!("Unknown relationship type: {}", s)),
        }
    }
}

/// Who produced an edge
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExtractedBy {
    User,
    Llm,
    System,
}

impl ExtractedBy {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExtractedBy::User => "user",
            ExtractedBy::Llm => "llm",
            ExtractedBy::System => "system",
        }
    }
}

impl std::str::FromStr for ExtractedBy {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "user" => Ok(ExtractedBy::User),
            "llm" => Ok(ExtractedBy::Llm),
            "system" => Ok(ExtractedBy::System),
            _ => Err(format!("Unknown extractor: {}", s)),
        }
    }
}

/// A directed edge between two memories
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MemoryRelationship {
    pub id: String,
    pub source_memory_id: String,
    pub target_memory_id: String,
    pub relationship_type: RelationshipType,
    pub confidence: f64,
    pub extracted_by: ExtractedBy,
    pub created_at: DateTime<Utc>,
    pub valid_from: Option<DateTime<Utc>>,
    pub valid_until: Option<DateTime<Utc>>,
}

// ============================================================================
// OPERATIONS
// ============================================================================

/// Create an edge. User- and system-extracted edges default to confidence
/// 1.0; LLM-extracted edges carry the supplied confidence.
pub fn create(
    store: &Store,
    source_memory_id: &str,
    target_memory_id: &str,
    relationship_type: RelationshipType,
    extracted_by: ExtractedBy,
    confidence: Option<f64>,
) -> Result<MemoryRelationship> {
    if store.get_memory(source_memory_id)?.is_none() {
        return Err(StorageError::NotFound(source_memory_id.to_string()));
    }
    if store.get_memory(target_memory_id)?.is_none() {
        return Err(StorageError::NotFound(target_memory_id.to_string()));
    }

    let confidence = match extracted_by {
        ExtractedBy::User | ExtractedBy::System => confidence.unwrap_or(1.0),
        ExtractedBy::Llm => confidence.unwrap_or(0.5),
    }
    .clamp(0.0, 1.0);

    let relationship = MemoryRelationship {
        id: uuid::Uuid::new_v4().to_string(),
        source_memory_id: source_memory_id.to_string(),
        target_memory_id: target_memory_id.to_string(),
        relationship_type,
        confidence,
        extracted_by,
        created_at: Utc::now(),
        valid_from: None,
        valid_until: None,
    };
    store.insert_relationship(&relationship)?;
    Ok(relationship)
}

/// Supersede `old` with `new`: insert a SUPERSEDES edge new→old and close
/// the old memory's validity window, only if it is still open.
pub fn supersede(store: &Store, old_id: &str, new_id: &str) -> Result<MemoryRelationship> {
    let edge = create(
        store,
        new_id,
        old_id,
        RelationshipType::Supersedes,
        ExtractedBy::System,
        None,
    )?;
    let closed = store.close_memory_validity(old_id, edge.created_at)?;
    if !closed {
        tracing::debug!(memory = old_id, "Validity window already closed");
    }
    Ok(edge)
}

/// The memory that supersedes this one, if any
pub fn get_superseding(store: &Store, memory_id: &str) -> Result<Option<Memory>> {
    store.get_superseding(memory_id)
}

/// Edges touching a memory; open edges only unless history is requested
pub fn list(
    store: &Store,
    memory_id: &str,
    include_history: bool,
) -> Result<Vec<MemoryRelationship>> {
    store.relationships_for(memory_id, include_history)
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::types::{Sector, Tier};
    use tempfile::TempDir;

    fn seeded_store() -> (TempDir, Store, String, String, String) {
        let temp = TempDir::new().unwrap();
        let store = Store::open(temp.path().join("memories.db")).unwrap();
        let project = store.upsert_project("/p", "p").unwrap();
        let a = insert(&store, &project.id, "Old fact about the config");
        let b = insert(&store, &project.id, "New fact about the config");
        (temp, store, project.id, a, b)
    }

    fn insert(store: &Store, project_id: &str, content: &str) -> String {
        let now = Utc::now();
        let memory = Memory {
            id: uuid::Uuid::new_v4().to_string(),
            project_id: project_id.to_string(),
            content: content.to_string(),
            summary: None,
            content_hash: crate::dedup::content_hash(content),
            simhash: Some(crate::dedup::simhash(content)),
            sector: Sector::Semantic,
            tier: Tier::Project,
            memory_type: None,
            importance: 0.5,
            salience: 1.0,
            access_count: 0,
            created_at: now,
            updated_at: now,
            last_accessed: now,
            valid_from: None,
            valid_until: None,
            is_deleted: false,
            deleted_at: None,
            tags: vec![],
            concepts: vec![],
            files: vec![],
            categories: vec![],
        };
        store.insert_memory(&memory).unwrap();
        memory.id
    }

    #[test]
    fn create_defaults_confidence_by_extractor() {
        let (_temp, store, _project, a, b) = seeded_store();
        let user_edge = create(&store, &a, &b, RelationshipType::RelatedTo, ExtractedBy::User, None)
            .unwrap();
        assert_eq!(user_edge.confidence, 1.0);

        let llm_edge = create(
            &store,
            &a,
            &b,
            RelationshipType::Contradicts,
            ExtractedBy::Llm,
            Some(0.8),
        )
        .unwrap();
        assert_eq!(llm_edge.confidence, 0.8);
    }

    #[test]
    fn create_rejects_missing_endpoints() {
        let (_temp, store, _project, a, _b) = seeded_store();
        let result = create(
            &store,
            &a,
            "missing-id",
            RelationshipType::RelatedTo,
            ExtractedBy::System,
            None,
        );
        assert!(matches!(result, Err(StorageError::NotFound(_))));
    }

    #[test]
    fn supersede_sets_valid_until_once() {
        let (_temp, store, _project, old, new) = seeded_store();
        supersede(&store, &old, &new).unwrap();

        let old_memory = store.get_memory(&old).unwrap().unwrap();
        let first_until = old_memory.valid_until.unwrap();

        let superseding = get_superseding(&store, &old).unwrap().unwrap();
        assert_eq!(superseding.id, new);

        // A second supersede keeps the original timestamp (no auto-reopen)
        supersede(&store, &old, &new).unwrap();
        let old_memory = store.get_memory(&old).unwrap().unwrap();
        assert_eq!(old_memory.valid_until.unwrap(), first_until);
    }

    #[test]
    fn superseding_by_deleted_memory_is_ignored() {
        let (_temp, store, _project, old, new) = seeded_store();
        supersede(&store, &old, &new).unwrap();
        store.soft_delete_memory(&new).unwrap();
        assert!(get_superseding(&store, &old).unwrap().is_none());
    }

    #[test]
    fn list_filters_closed_edges_by_default() {
        let (_temp, store, _project, a, b) = seeded_store();
        let edge = create(&store, &a, &b, RelationshipType::BuildsOn, ExtractedBy::System, None)
            .unwrap();

        // Close the edge manually
        {
            let writer_edge = MemoryRelationship {
                valid_until: Some(Utc::now()),
                id: uuid::Uuid::new_v4().to_string(),
                ..edge.clone()
            };
            store.insert_relationship(&writer_edge).unwrap();
        }

        let open = list(&store, &a, false).unwrap();
        assert_eq!(open.len(), 1);
        let all = list(&store, &a, true).unwrap();
        assert_eq!(all.len(), 2);
    }

    #[test]
    fn relationship_type_roundtrip() {
        use std::str::FromStr;
        for rt in [
            RelationshipType::Supersedes,
            RelationshipType::Contradicts,
            RelationshipType::RelatedTo,
            RelationshipType::BuildsOn,
            RelationshipType::Confirms,
            RelationshipType::AppliesTo,
            RelationshipType::DependsOn,
            RelationshipType::AlternativeTo,
        ] {
            assert_eq!(RelationshipType::from_str(rt.as_str()).unwrap(), rt);
        }
    }
}
