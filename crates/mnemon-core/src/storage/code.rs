//! Code-index storage: documents, chunks, vectors, incremental state
//!
//! The pipeline writer lands batches here; each flush is one transaction
//! regardless of how many files it contains.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use rusqlite::{params, params_from_iter, OptionalExtension, Row};

use super::sqlite::{blob_to_vec, vec_to_blob, Result, Store};

// ============================================================================
// ROW TYPES
// ============================================================================

/// An indexed file from the code pipeline
#[derive(Debug, Clone)]
pub struct Document {
    pub id: String,
    pub project_id: String,
    pub source_path: String,
    pub language: Option<String>,
    pub line_count: i64,
    pub checksum: String,
    pub is_code: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// A chunk row ready for insertion
#[derive(Debug, Clone)]
pub struct ChunkRow {
    pub chunk_index: usize,
    pub content: String,
    pub start_line: usize,
    pub end_line: usize,
    pub chunk_type: String,
    pub symbols: Vec<String>,
    pub tokens_estimate: usize,
    pub cache_key: String,
    /// `(model_id, vector)`; absent when embedding was skipped entirely
    pub vector: Option<(String, Vec<f32>)>,
}

/// A fully processed file, written in one batch
#[derive(Debug, Clone)]
pub struct ProcessedFileRow {
    pub path: String,
    pub language: Option<String>,
    pub line_count: usize,
    pub checksum: String,
    pub is_code: bool,
    pub full_content: String,
    pub mtime: i64,
    pub chunks: Vec<ChunkRow>,
}

/// A single operation in a writer flush
#[derive(Debug, Clone)]
pub enum WriteBatchOp {
    /// Replace the document + chunks for a file and upsert its indexed_file row
    UpsertFile(ProcessedFileRow),
    /// Targeted delete by path (file vanished or renamed away)
    DeleteFile { path: String },
}

/// Incremental-indexing bookkeeping for one file
#[derive(Debug, Clone)]
pub struct IndexedFileRow {
    pub path: String,
    pub checksum: String,
    pub mtime: i64,
    pub indexed_at: DateTime<Utc>,
}

/// Per-project code index state
#[derive(Debug, Clone, Default)]
pub struct CodeIndexState {
    pub last_indexed_at: Option<DateTime<Utc>>,
    pub indexed_files: i64,
    pub gitignore_hash: Option<String>,
}

/// An FTS hit over document content
#[derive(Debug, Clone)]
pub struct DocumentHit {
    pub document_id: String,
    pub source_path: String,
    pub rank: f64,
    pub snippet: Option<String>,
}

// ============================================================================
// STORE IMPL
// ============================================================================

impl Store {
    // ========================================================================
    // Incremental state
    // ========================================================================

    pub fn get_indexed_file(&self, project_id: &str, path: &str) -> Result<Option<IndexedFileRow>> {
        let reader = self.reader()?;
        Ok(reader
            .query_row(
                "SELECT path, checksum, mtime, indexed_at FROM indexed_files
                 WHERE project_id = ?1 AND path = ?2",
                params![project_id, path],
                indexed_file_from_row,
            )
            .optional()?)
    }

    pub fn list_indexed_files(&self, project_id: &str) -> Result<Vec<IndexedFileRow>> {
        let reader = self.reader()?;
        let mut stmt = reader.prepare(
            "SELECT path, checksum, mtime, indexed_at FROM indexed_files WHERE project_id = ?1",
        )?;
        let rows = stmt.query_map(params![project_id], indexed_file_from_row)?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    pub fn code_index_state(&self, project_id: &str) -> Result<CodeIndexState> {
        let reader = self.reader()?;
        Ok(reader
            .query_row(
                "SELECT last_indexed_at, indexed_files, gitignore_hash FROM code_index_state
                 WHERE project_id = ?1",
                params![project_id],
                |row| {
                    Ok(CodeIndexState {
                        last_indexed_at: row.get(0)?,
                        indexed_files: row.get(1)?,
                        gitignore_hash: row.get(2)?,
                    })
                },
            )
            .optional()?
            .unwrap_or_default())
    }

    pub fn update_code_index_state(
        &self,
        project_id: &str,
        indexed_files: i64,
        gitignore_hash: Option<&str>,
    ) -> Result<()> {
        let writer = self.writer()?;
        writer.execute(
            "INSERT INTO code_index_state (project_id, last_indexed_at, indexed_files, gitignore_hash)
             VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT (project_id) DO UPDATE SET
                last_indexed_at = excluded.last_indexed_at,
                indexed_files = excluded.indexed_files,
                gitignore_hash = COALESCE(excluded.gitignore_hash, code_index_state.gitignore_hash)",
            params![project_id, Utc::now(), indexed_files, gitignore_hash],
        )?;
        Ok(())
    }

    // ========================================================================
    // Documents
    // ========================================================================

    pub fn get_document(&self, project_id: &str, path: &str) -> Result<Option<Document>> {
        let reader = self.reader()?;
        Ok(reader
            .query_row(
                "SELECT id, project_id, source_path, language, line_count, checksum, is_code,
                        created_at, updated_at
                 FROM documents WHERE project_id = ?1 AND source_path = ?2",
                params![project_id, path],
                document_from_row,
            )
            .optional()?)
    }

    pub fn document_count(&self, project_id: &str) -> Result<i64> {
        let reader = self.reader()?;
        Ok(reader.query_row(
            "SELECT COUNT(*) FROM documents WHERE project_id = ?1",
            params![project_id],
            |row| row.get(0),
        )?)
    }

    /// Chunk indices of a document in physical insertion order. Used to
    /// verify arrival-order preservation.
    pub fn chunk_indices(&self, document_id: &str) -> Result<Vec<i64>> {
        let reader = self.reader()?;
        let mut stmt = reader.prepare(
            "SELECT chunk_index FROM document_chunks WHERE document_id = ?1 ORDER BY rowid",
        )?;
        let rows = stmt.query_map(params![document_id], |row| row.get(0))?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    pub fn chunk_count(&self, project_id: &str) -> Result<i64> {
        let reader = self.reader()?;
        Ok(reader.query_row(
            "SELECT COUNT(*) FROM document_chunks c
             JOIN documents d ON d.id = c.document_id
             WHERE d.project_id = ?1",
            params![project_id],
            |row| row.get(0),
        )?)
    }

    /// FTS over document content, BM25-ordered
    pub fn fts_search_documents(
        &self,
        match_query: &str,
        project_id: &str,
        limit: usize,
    ) -> Result<Vec<DocumentHit>> {
        if match_query.is_empty() {
            return Ok(Vec::new());
        }
        let reader = self.reader()?;
        let mut stmt = reader.prepare(
            "SELECT d.id, d.source_path, f.rank, snippet(documents_fts, 0, '[', ']', '…', 16)
             FROM documents_fts f
             JOIN documents d ON d.rowid = f.rowid
             WHERE documents_fts MATCH ?1 AND d.project_id = ?2
             ORDER BY f.rank LIMIT ?3",
        )?;
        let rows = stmt.query_map(params![match_query, project_id, limit as i64], |row| {
            Ok(DocumentHit {
                document_id: row.get(0)?,
                source_path: row.get(1)?,
                rank: row.get(2)?,
                snippet: row.get(3)?,
            })
        })?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    // ========================================================================
    // Embedding reuse
    // ========================================================================

    /// Existing chunk vectors for the given cache keys under one model.
    /// Only vectors at the expected dimension are returned.
    pub fn embeddings_by_cache_keys(
        &self,
        cache_keys: &[String],
        model_id: &str,
        dim: usize,
    ) -> Result<HashMap<String, Vec<f32>>> {
        if cache_keys.is_empty() {
            return Ok(HashMap::new());
        }
        let reader = self.reader()?;
        let placeholders = vec!["?"; cache_keys.len()].join(", ");
        let sql = format!(
            "SELECT c.cache_key, v.vector, v.dim FROM document_vectors v
             JOIN document_chunks c ON c.id = v.chunk_id
             WHERE v.model_id = ? AND c.cache_key IN ({placeholders})"
        );
        let mut stmt = reader.prepare(&sql)?;

        let mut args: Vec<&dyn rusqlite::ToSql> = vec![&model_id];
        for key in cache_keys {
            args.push(key);
        }

        let mut out = HashMap::new();
        let mut rows = stmt.query(params_from_iter(args))?;
        while let Some(row) = rows.next()? {
            let key: String = row.get(0)?;
            let blob: Vec<u8> = row.get(1)?;
            let row_dim: i64 = row.get(2)?;
            if row_dim as usize != dim {
                continue;
            }
            if let Some(vector) = blob_to_vec(&blob) {
                out.insert(key, vector);
            }
        }
        Ok(out)
    }

    // ========================================================================
    // Batched writes
    // ========================================================================

    /// Apply one writer flush in a single transaction: delete superseded
    /// chunks for changed files, insert new chunks and vectors, upsert
    /// document and indexed_file rows, and drop vanished files.
    pub fn apply_write_batch(&self, project_id: &str, ops: &[WriteBatchOp]) -> Result<()> {
        if ops.is_empty() {
            return Ok(());
        }
        let mut writer = self.writer()?;
        let tx = writer.transaction()?;
        let now = Utc::now();

        for op in ops {
            match op {
                WriteBatchOp::UpsertFile(file) => {
                    // Superseded chunks go first; cascades take the vectors
                    if let Some(existing_id) = tx
                        .query_row(
                            "SELECT id FROM documents WHERE project_id = ?1 AND source_path = ?2",
                            params![project_id, file.path],
                            |row| row.get::<_, String>(0),
                        )
                        .optional()?
                    {
                        tx.execute(
                            "DELETE FROM document_chunks WHERE document_id = ?1",
                            params![existing_id],
                        )?;
                        tx.execute(
                            "UPDATE documents SET language = ?2, line_count = ?3, checksum = ?4,
                                is_code = ?5, full_content = ?6, updated_at = ?7
                             WHERE id = ?1",
                            params![
                                existing_id,
                                file.language,
                                file.line_count as i64,
                                file.checksum,
                                file.is_code as i64,
                                file.full_content,
                                now,
                            ],
                        )?;
                        insert_chunks(&tx, &existing_id, file, now)?;
                    } else {
                        let document_id = uuid::Uuid::new_v4().to_string();
                        tx.execute(
                            "INSERT INTO documents (id, project_id, source_path, language, line_count,
                                checksum, is_code, full_content, created_at, updated_at)
                             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?9)",
                            params![
                                document_id,
                                project_id,
                                file.path,
                                file.language,
                                file.line_count as i64,
                                file.checksum,
                                file.is_code as i64,
                                file.full_content,
                                now,
                            ],
                        )?;
                        insert_chunks(&tx, &document_id, file, now)?;
                    }

                    tx.execute(
                        "INSERT INTO indexed_files (project_id, path, checksum, mtime, indexed_at)
                         VALUES (?1, ?2, ?3, ?4, ?5)
                         ON CONFLICT (project_id, path) DO UPDATE SET
                            checksum = excluded.checksum, mtime = excluded.mtime,
                            indexed_at = excluded.indexed_at",
                        params![project_id, file.path, file.checksum, file.mtime, now],
                    )?;
                }
                WriteBatchOp::DeleteFile { path } => {
                    tx.execute(
                        "DELETE FROM documents WHERE project_id = ?1 AND source_path = ?2",
                        params![project_id, path],
                    )?;
                    tx.execute(
                        "DELETE FROM indexed_files WHERE project_id = ?1 AND path = ?2",
                        params![project_id, path],
                    )?;
                }
            }
        }

        tx.commit()?;
        Ok(())
    }

    /// Remove a file from the index outside a batch (watcher fast path)
    pub fn delete_indexed_path(&self, project_id: &str, path: &str) -> Result<()> {
        self.apply_write_batch(
            project_id,
            &[WriteBatchOp::DeleteFile {
                path: path.to_string(),
            }],
        )
    }
}

fn insert_chunks(
    tx: &rusqlite::Transaction<'_>,
    document_id: &str,
    file: &ProcessedFileRow,
    now: DateTime<Utc>,
) -> Result<()> {
    for chunk in &file.chunks {
        let chunk_id = uuid::Uuid::new_v4().to_string();
        tx.execute(
            "INSERT INTO document_chunks (id, document_id, chunk_index, content, start_line,
                end_line, chunk_type, symbols, tokens_estimate, cache_key, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
            params![
                chunk_id,
                document_id,
                chunk.chunk_index as i64,
                chunk.content,
                chunk.start_line as i64,
                chunk.end_line as i64,
                chunk.chunk_type,
                serde_json::to_string(&chunk.symbols).unwrap_or_else(|_| "[]".to_string()),
                chunk.tokens_estimate as i64,
                chunk.cache_key,
                now,
            ],
        )?;
        if let Some((model_id, vector)) = &chunk.vector {
            tx.execute(
                "INSERT INTO document_vectors (chunk_id, model_id, vector, dim, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5)
                 ON CONFLICT (chunk_id, model_id) DO UPDATE SET
                    vector = excluded.vector, dim = excluded.dim, created_at = excluded.created_at",
                params![chunk_id, model_id, vec_to_blob(vector), vector.len() as i64, now],
            )?;
        }
    }
    Ok(())
}

// ============================================================================
// ROW MAPPING
// ============================================================================

fn indexed_file_from_row(row: &Row<'_>) -> rusqlite::Result<IndexedFileRow> {
    Ok(IndexedFileRow {
        path: row.get(0)?,
        checksum: row.get(1)?,
        mtime: row.get(2)?,
        indexed_at: row.get(3)?,
    })
}

fn document_from_row(row: &Row<'_>) -> rusqlite::Result<Document> {
    Ok(Document {
        id: row.get(0)?,
        project_id: row.get(1)?,
        source_path: row.get(2)?,
        language: row.get(3)?,
        line_count: row.get(4)?,
        checksum: row.get(5)?,
        is_code: row.get::<_, i64>(6)? != 0,
        created_at: row.get(7)?,
        updated_at: row.get(8)?,
    })
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn test_store() -> (TempDir, Store, String) {
        let temp = TempDir::new().unwrap();
        let store = Store::open(temp.path().join("memories.db")).unwrap();
        let project = store.upsert_project("/p", "p").unwrap();
        (temp, store, project.id)
    }

    fn sample_file(path: &str, content: &str) -> ProcessedFileRow {
        ProcessedFileRow {
            path: path.to_string(),
            language: Some("rust".to_string()),
            line_count: content.lines().count(),
            checksum: crate::dedup::content_hash(content),
            is_code: true,
            full_content: content.to_string(),
            mtime: 1_700_000_000,
            chunks: vec![ChunkRow {
                chunk_index: 0,
                content: content.to_string(),
                start_line: 1,
                end_line: content.lines().count().max(1),
                chunk_type: "block".to_string(),
                symbols: vec!["main".to_string()],
                tokens_estimate: content.len().div_ceil(4),
                cache_key: crate::dedup::content_hash(content),
                vector: Some(("ollama:test".to_string(), vec![0.5, 0.5])),
            }],
        }
    }

    #[test]
    fn upsert_then_reindex_replaces_chunks() {
        let (_temp, store, project) = test_store();
        let file = sample_file("src/main.rs", "fn main() {}\n");
        store
            .apply_write_batch(&project, &[WriteBatchOp::UpsertFile(file.clone())])
            .unwrap();
        assert_eq!(store.document_count(&project).unwrap(), 1);
        assert_eq!(store.chunk_count(&project).unwrap(), 1);

        let mut updated = sample_file("src/main.rs", "fn main() { run(); }\n");
        updated.chunks.push(ChunkRow {
            chunk_index: 1,
            content: "fn run() {}".to_string(),
            start_line: 2,
            end_line: 2,
            chunk_type: "function".to_string(),
            symbols: vec!["run".to_string()],
            tokens_estimate: 3,
            cache_key: "other-key".to_string(),
            vector: None,
        });
        store
            .apply_write_batch(&project, &[WriteBatchOp::UpsertFile(updated)])
            .unwrap();

        // Still one document, now two chunks; old chunks superseded
        assert_eq!(store.document_count(&project).unwrap(), 1);
        assert_eq!(store.chunk_count(&project).unwrap(), 2);
    }

    #[test]
    fn delete_file_removes_document_and_state() {
        let (_temp, store, project) = test_store();
        store
            .apply_write_batch(
                &project,
                &[WriteBatchOp::UpsertFile(sample_file("src/lib.rs", "pub fn a() {}"))],
            )
            .unwrap();
        assert!(store.get_indexed_file(&project, "src/lib.rs").unwrap().is_some());

        store.delete_indexed_path(&project, "src/lib.rs").unwrap();
        assert_eq!(store.document_count(&project).unwrap(), 0);
        assert!(store.get_indexed_file(&project, "src/lib.rs").unwrap().is_none());
        assert_eq!(store.chunk_count(&project).unwrap(), 0);
    }

    #[test]
    fn cache_key_lookup_honours_model_and_dim() {
        let (_temp, store, project) = test_store();
        let file = sample_file("src/a.rs", "fn alpha() {}\n");
        let key = file.chunks[0].cache_key.clone();
        store
            .apply_write_batch(&project, &[WriteBatchOp::UpsertFile(file)])
            .unwrap();

        let found = store
            .embeddings_by_cache_keys(&[key.clone()], "ollama:test", 2)
            .unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[&key], vec![0.5, 0.5]);

        // Wrong model or dimension: skipped
        assert!(store
            .embeddings_by_cache_keys(&[key.clone()], "openai:other", 2)
            .unwrap()
            .is_empty());
        assert!(store
            .embeddings_by_cache_keys(&[key], "ollama:test", 768)
            .unwrap()
            .is_empty());
    }

    #[test]
    fn code_index_state_roundtrip() {
        let (_temp, store, project) = test_store();
        let initial = store.code_index_state(&project).unwrap();
        assert!(initial.last_indexed_at.is_none());

        store
            .update_code_index_state(&project, 42, Some("abc123"))
            .unwrap();
        let state = store.code_index_state(&project).unwrap();
        assert_eq!(state.indexed_files, 42);
        assert_eq!(state.gitignore_hash.as_deref(), Some("abc123"));

        // Passing None keeps the stored gitignore hash
        store.update_code_index_state(&project, 43, None).unwrap();
        let state = store.code_index_state(&project).unwrap();
        assert_eq!(state.indexed_files, 43);
        assert_eq!(state.gitignore_hash.as_deref(), Some("abc123"));
    }

    #[test]
    fn document_fts_finds_content() {
        let (_temp, store, project) = test_store();
        store
            .apply_write_batch(
                &project,
                &[WriteBatchOp::UpsertFile(sample_file(
                    "src/auth.rs",
                    "fn verify_token(token: &str) -> bool { token.starts_with(\"Bearer\") }",
                ))],
            )
            .unwrap();

        let hits = store
            .fts_search_documents("\"bearer\"*", &project, 10)
            .unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].source_path, "src/auth.rs");
    }
}
