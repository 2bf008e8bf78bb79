//! Dense-vector retrieval over stored memory vectors
//!
//! Exact cosine scoring over rows whose model matches the active one and
//! whose dimension equals the query's. Stale-dimension rows are skipped by
//! the store, never migrated.

use crate::embeddings::cosine_similarity;
use crate::storage::{Result, Store};

/// A scored vector hit
#[derive(Debug, Clone)]
pub struct VectorHit {
    pub memory_id: String,
    pub similarity: f32,
}

/// Score all eligible memory vectors against the query and return the top
/// `limit` with positive similarity.
pub fn vector_search(
    store: &Store,
    project_id: Option<&str>,
    model_id: &str,
    query: &[f32],
    limit: usize,
) -> Result<Vec<VectorHit>> {
    if query.is_empty() {
        return Ok(Vec::new());
    }

    let rows = store.memory_vector_rows(project_id, model_id, query.len())?;
    let mut hits: Vec<VectorHit> = rows
        .into_iter()
        .map(|(memory_id, vector)| VectorHit {
            similarity: cosine_similarity(query, &vector),
            memory_id,
        })
        .filter(|hit| hit.similarity > 0.0)
        .collect();

    hits.sort_by(|a, b| {
        b.similarity
            .partial_cmp(&a.similarity)
            .unwrap_or(std::cmp::Ordering::Equal)
    });
    hits.truncate(limit);
    Ok(hits)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::types::{Memory, Sector, Tier};
    use chrono::Utc;
    use tempfile::TempDir;

    fn seed(store: &Store, project_id: &str, content: &str, vector: &[f32]) -> String {
        let now = Utc::now();
        let memory = Memory {
            id: uuid::Uuid::new_v4().to_string(),
            project_id: project_id.to_string(),
            content: content.to_string(),
            summary: None,
            content_hash: crate::dedup::content_hash(content),
            simhash: None,
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
        store
            .upsert_memory_vector(&memory.id, "stub:model", vector)
            .unwrap();
        memory.id
    }

    #[test]
    fn ranks_by_cosine() {
        let temp = TempDir::new().unwrap();
        let store = Store::open(temp.path().join("m.db")).unwrap();
        let project = store.upsert_project("/p", "p").unwrap();

        let close = seed(&store, &project.id, "close", &[1.0, 0.1, 0.0]);
        let far = seed(&store, &project.id, "far", &[0.1, 1.0, 0.0]);
        let _orthogonal = seed(&store, &project.id, "orthogonal", &[0.0, 0.0, 1.0]);

        let hits = vector_search(&store, Some(&project.id), "stub:model", &[1.0, 0.0, 0.0], 10)
            .unwrap();
        // Orthogonal has zero similarity and is dropped
        assert_eq!(hits.len(), 2);
        assert_eq!(hits[0].memory_id, close);
        assert_eq!(hits[1].memory_id, far);
        assert!(hits[0].similarity > hits[1].similarity);
    }

    #[test]
    fn mismatched_dimension_rows_are_invisible() {
        let temp = TempDir::new().unwrap();
        let store = Store::open(temp.path().join("m.db")).unwrap();
        let project = store.upsert_project("/p", "p").unwrap();
        seed(&store, &project.id, "wide vector", &[1.0, 0.0, 0.0, 0.0]);

        let hits = vector_search(&store, Some(&project.id), "stub:model", &[1.0, 0.0, 0.0], 10)
            .unwrap();
        assert!(hits.is_empty());
    }

    #[test]
    fn truncates_to_limit() {
        let temp = TempDir::new().unwrap();
        let store = Store::open(temp.path().join("m.db")).unwrap();
        let project = store.upsert_project("/p", "p").unwrap();
        for i in 0..5 {
            seed(
                &store,
                &project.id,
                &format!("memory {}", i),
                &[1.0, i as f32 * 0.1, 0.0],
            );
        }
        let hits =
            vector_search(&store, Some(&project.id), "stub:model", &[1.0, 0.0, 0.0], 3).unwrap();
        assert_eq!(hits.len(), 3);
    }
}
