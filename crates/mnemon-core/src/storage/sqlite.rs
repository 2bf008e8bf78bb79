//! SQLite Storage Implementation
//!
//! One relational store per data directory, opened in WAL mode with
//! synchronous=NORMAL and foreign keys enabled. Reader and writer use separate
//! connections behind mutexes so all methods take `&self` and the store is
//! `Send + Sync`; WAL gives readers concurrency while the writer serializes
//! write transactions.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use rusqlite::{params, params_from_iter, Connection, OptionalExtension, Row};

use crate::memory::relationships::{ExtractedBy, MemoryRelationship, RelationshipType};
use crate::memory::types::{
    ListFilter, ListOrder, Memory, MemoryStats, MemoryType, Project, Sector, Session, Tier,
    UsageType, SALIENCE_FLOOR, SALIENCE_MAX,
};

// ============================================================================
// ERROR TYPES
// ============================================================================

/// Storage error type
#[non_exhaustive]
#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    /// Database error
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),
    /// Referenced row missing
    #[error("Not found: {0}")]
    NotFound(String),
    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    /// Initialization or migration error
    #[error("Initialization error: {0}")]
    Init(String),
}

/// Storage result type
pub type Result<T> = std::result::Result<T, StorageError>;

// ============================================================================
// VECTOR ENCODING
// ============================================================================

/// Encode a vector as a little-endian float32 blob
pub fn vec_to_blob(vector: &[f32]) -> Vec<u8> {
    vector.iter().flat_map(|f| f.to_le_bytes()).collect()
}

/// Decode a little-endian float32 blob. Returns `None` for ragged blobs.
pub fn blob_to_vec(bytes: &[u8]) -> Option<Vec<f32>> {
    if bytes.len() % 4 != 0 {
        return None;
    }
    Some(
        bytes
            .chunks_exact(4)
            .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
            .collect(),
    )
}

// ============================================================================
// ROW TYPES
// ============================================================================

/// A registered embedding model
#[derive(Debug, Clone)]
pub struct EmbeddingModelRow {
    pub id: String,
    pub provider: String,
    pub name: String,
    pub dimensions: usize,
    pub is_active: bool,
}

/// An FTS hit over memory content
#[derive(Debug, Clone)]
pub struct FtsHit {
    pub memory_id: String,
    /// Raw BM25 rank from FTS5 (negative; more negative = better)
    pub rank: f64,
    pub snippet: Option<String>,
}

// ============================================================================
// STORE
// ============================================================================

const MEMORY_COLUMNS: &str = "id, project_id, content, summary, content_hash, simhash, sector, tier, \
     memory_type, importance, salience, access_count, created_at, updated_at, last_accessed, \
     valid_from, valid_until, is_deleted, deleted_at, tags, concepts, files, categories";

/// The shared relational + FTS + vector store
pub struct Store {
    writer: Mutex<Connection>,
    reader: Mutex<Connection>,
    path: PathBuf,
}

impl Store {
    /// Apply PRAGMAs to a connection
    fn configure_connection(conn: &Connection) -> Result<()> {
        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA synchronous = NORMAL;
             PRAGMA cache_size = -64000;
             PRAGMA temp_store = MEMORY;
             PRAGMA foreign_keys = ON;
             PRAGMA busy_timeout = 5000;",
        )?;
        Ok(())
    }

    /// Open (or create) the store at the given path and run pending
    /// migrations. Migration failure is fatal.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let writer = Connection::open(&path)?;
        Self::configure_connection(&writer)?;
        super::migrations::apply_migrations(&writer)
            .map_err(|e| StorageError::Init(format!("migration failed: {}", e)))?;

        let reader = Connection::open(&path)?;
        Self::configure_connection(&reader)?;

        Ok(Self {
            writer: Mutex::new(writer),
            reader: Mutex::new(reader),
            path,
        })
    }

    /// Open the store at the default data-directory location
    pub fn open_default() -> Result<Self> {
        Self::open(crate::config::database_path())
    }

    /// Path of the backing database file
    pub fn path(&self) -> &Path {
        &self.path
    }

    pub(crate) fn writer(&self) -> Result<std::sync::MutexGuard<'_, Connection>> {
        self.writer
            .lock()
            .map_err(|_| StorageError::Init("writer lock poisoned".to_string()))
    }

    pub(crate) fn reader(&self) -> Result<std::sync::MutexGuard<'_, Connection>> {
        self.reader
            .lock()
            .map_err(|_| StorageError::Init("reader lock poisoned".to_string()))
    }

    // ========================================================================
    // Projects
    // ========================================================================

    /// Get or create the project rooted at `path`
    pub fn upsert_project(&self, path: &str, name: &str) -> Result<Project> {
        let writer = self.writer()?;
        let existing: Option<Project> = writer
            .query_row(
                "SELECT id, path, name, created_at, updated_at FROM projects WHERE path = ?1",
                params![path],
                project_from_row,
            )
            .optional()?;

        if let Some(project) = existing {
            return Ok(project);
        }

        let now = Utc::now();
        let id = uuid::Uuid::new_v4().to_string();
        writer.execute(
            "INSERT INTO projects (id, path, name, created_at, updated_at) VALUES (?1, ?2, ?3, ?4, ?5)",
            params![id, path, name, now, now],
        )?;

        Ok(Project {
            id,
            path: path.to_string(),
            name: name.to_string(),
            created_at: now,
            updated_at: now,
        })
    }

    pub fn get_project(&self, id: &str) -> Result<Option<Project>> {
        let reader = self.reader()?;
        Ok(reader
            .query_row(
                "SELECT id, path, name, created_at, updated_at FROM projects WHERE id = ?1",
                params![id],
                project_from_row,
            )
            .optional()?)
    }

    // ========================================================================
    // Sessions
    // ========================================================================

    /// Start a session, ending all prior active sessions of the project.
    /// Concurrent starters across processes may double-end; accepted.
    pub fn start_session(&self, project_id: &str, context: Option<&str>) -> Result<Session> {
        let now = Utc::now();
        let id = uuid::Uuid::new_v4().to_string();

        let writer = self.writer()?;
        writer.execute(
            "UPDATE sessions SET ended_at = ?1 WHERE project_id = ?2 AND ended_at IS NULL",
            params![now, project_id],
        )?;
        writer.execute(
            "INSERT INTO sessions (id, project_id, started_at, context) VALUES (?1, ?2, ?3, ?4)",
            params![id, project_id, now, context],
        )?;

        Ok(Session {
            id,
            project_id: project_id.to_string(),
            started_at: now,
            ended_at: None,
            summary: None,
            context: context.map(String::from),
        })
    }

    /// End a session. No-op on an already-ended session.
    pub fn end_session(&self, session_id: &str, summary: Option<&str>) -> Result<()> {
        let writer = self.writer()?;
        writer.execute(
            "UPDATE sessions SET ended_at = COALESCE(ended_at, ?1), summary = COALESCE(?2, summary)
             WHERE id = ?3",
            params![Utc::now(), summary, session_id],
        )?;
        Ok(())
    }

    pub fn get_session(&self, id: &str) -> Result<Option<Session>> {
        let reader = self.reader()?;
        Ok(reader
            .query_row(
                "SELECT id, project_id, started_at, ended_at, summary, context FROM sessions WHERE id = ?1",
                params![id],
                session_from_row,
            )
            .optional()?)
    }

    /// The project's single active session, if any
    pub fn active_session(&self, project_id: &str) -> Result<Option<Session>> {
        let reader = self.reader()?;
        Ok(reader
            .query_row(
                "SELECT id, project_id, started_at, ended_at, summary, context FROM sessions
                 WHERE project_id = ?1 AND ended_at IS NULL
                 ORDER BY started_at DESC LIMIT 1",
                params![project_id],
                session_from_row,
            )
            .optional()?)
    }

    /// Promote session-tier memories of a session to project tier when their
    /// salience clears the promotion bar. Returns the number promoted.
    pub fn promote_session_memories(&self, session_id: &str, min_salience: f64) -> Result<usize> {
        let writer = self.writer()?;
        let promoted = writer.execute(
            "UPDATE memories SET tier = 'project', updated_at = ?1
             WHERE tier = 'session' AND is_deleted = 0 AND salience >= ?2
               AND id IN (SELECT memory_id FROM session_memories WHERE session_id = ?3)",
            params![Utc::now(), min_salience, session_id],
        )?;
        Ok(promoted)
    }

    // ========================================================================
    // Memories
    // ========================================================================

    pub fn insert_memory(&self, memory: &Memory) -> Result<()> {
        let writer = self.writer()?;
        writer.execute(
            &format!("INSERT INTO memories ({MEMORY_COLUMNS}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17, ?18, ?19, ?20, ?21, ?22, ?23)"),
            params![
                memory.id,
                memory.project_id,
                memory.content,
                memory.summary,
                memory.content_hash,
                memory.simhash,
                memory.sector.as_str(),
                memory.tier.as_str(),
                memory.memory_type.map(|t| t.as_str()),
                memory.importance,
                memory.salience,
                memory.access_count,
                memory.created_at,
                memory.updated_at,
                memory.last_accessed,
                memory.valid_from,
                memory.valid_until,
                memory.is_deleted as i64,
                memory.deleted_at,
                json_array(&memory.tags),
                json_array(&memory.concepts),
                json_array(&memory.files),
                json_array(&memory.categories),
            ],
        )?;
        Ok(())
    }

    /// Returns the memory regardless of soft-delete state so callers can
    /// distinguish deleted from missing.
    pub fn get_memory(&self, id: &str) -> Result<Option<Memory>> {
        let reader = self.reader()?;
        Ok(reader
            .query_row(
                &format!("SELECT {MEMORY_COLUMNS} FROM memories WHERE id = ?1"),
                params![id],
                memory_from_row,
            )
            .optional()?)
    }

    pub fn get_memories_by_ids(&self, ids: &[String]) -> Result<Vec<Memory>> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        let reader = self.reader()?;
        let placeholders = placeholders(ids.len());
        let mut stmt = reader.prepare(&format!(
            "SELECT {MEMORY_COLUMNS} FROM memories WHERE id IN ({placeholders})"
        ))?;
        let rows = stmt.query_map(params_from_iter(ids.iter()), memory_from_row)?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    /// Persist every mutable field of a memory row. Touches `updated_at`.
    pub fn update_memory(&self, memory: &Memory) -> Result<()> {
        let writer = self.writer()?;
        let changed = writer.execute(
            "UPDATE memories SET content = ?2, summary = ?3, content_hash = ?4, simhash = ?5,
                sector = ?6, tier = ?7, memory_type = ?8, importance = ?9, salience = ?10,
                access_count = ?11, updated_at = ?12, last_accessed = ?13, valid_from = ?14,
                valid_until = ?15, is_deleted = ?16, deleted_at = ?17, tags = ?18,
                concepts = ?19, files = ?20, categories = ?21
             WHERE id = ?1",
            params![
                memory.id,
                memory.content,
                memory.summary,
                memory.content_hash,
                memory.simhash,
                memory.sector.as_str(),
                memory.tier.as_str(),
                memory.memory_type.map(|t| t.as_str()),
                memory.importance,
                memory.salience,
                memory.access_count,
                Utc::now(),
                memory.last_accessed,
                memory.valid_from,
                memory.valid_until,
                memory.is_deleted as i64,
                memory.deleted_at,
                json_array(&memory.tags),
                json_array(&memory.concepts),
                json_array(&memory.files),
                json_array(&memory.categories),
            ],
        )?;
        if changed == 0 {
            return Err(StorageError::NotFound(memory.id.clone()));
        }
        Ok(())
    }

    pub fn soft_delete_memory(&self, id: &str) -> Result<()> {
        let writer = self.writer()?;
        writer.execute(
            "UPDATE memories SET is_deleted = 1, deleted_at = ?1, updated_at = ?1 WHERE id = ?2",
            params![Utc::now(), id],
        )?;
        Ok(())
    }

    /// Row removal; vectors and edges cascade
    pub fn hard_delete_memory(&self, id: &str) -> Result<()> {
        let writer = self.writer()?;
        writer.execute("DELETE FROM memories WHERE id = ?1", params![id])?;
        Ok(())
    }

    pub fn restore_memory(&self, id: &str) -> Result<()> {
        let writer = self.writer()?;
        writer.execute(
            "UPDATE memories SET is_deleted = 0, deleted_at = NULL, updated_at = ?1 WHERE id = ?2",
            params![Utc::now(), id],
        )?;
        Ok(())
    }

    /// Set salience (already clamped by the caller) and optionally count the
    /// access. Single write, linearized per memory id by the writer lock.
    pub fn set_salience(&self, id: &str, salience: f64, count_access: bool) -> Result<()> {
        let salience = salience.clamp(SALIENCE_FLOOR, SALIENCE_MAX);
        let now = Utc::now();
        let writer = self.writer()?;
        if count_access {
            writer.execute(
                "UPDATE memories SET salience = ?1, access_count = access_count + 1,
                    last_accessed = ?2, updated_at = ?2 WHERE id = ?3",
                params![salience, now, id],
            )?;
        } else {
            writer.execute(
                "UPDATE memories SET salience = ?1, updated_at = ?2 WHERE id = ?3",
                params![salience, now, id],
            )?;
        }
        Ok(())
    }

    /// Persist decayed salience without touching access metadata
    pub fn set_decayed_salience(&self, id: &str, salience: f64) -> Result<()> {
        let salience = salience.clamp(SALIENCE_FLOOR, SALIENCE_MAX);
        let writer = self.writer()?;
        writer.execute(
            "UPDATE memories SET salience = ?1, updated_at = ?2 WHERE id = ?3",
            params![salience, Utc::now(), id],
        )?;
        Ok(())
    }

    /// Bump access metadata only
    pub fn touch_memory(&self, id: &str) -> Result<()> {
        let writer = self.writer()?;
        writer.execute(
            "UPDATE memories SET access_count = access_count + 1, last_accessed = ?1 WHERE id = ?2",
            params![Utc::now(), id],
        )?;
        Ok(())
    }

    /// Idempotent session link; the duplicate key is silently ignored
    pub fn link_to_session(
        &self,
        session_id: &str,
        memory_id: &str,
        usage: UsageType,
    ) -> Result<()> {
        let writer = self.writer()?;
        writer.execute(
            "INSERT OR IGNORE INTO session_memories (session_id, memory_id, usage_type, created_at)
             VALUES (?1, ?2, ?3, ?4)",
            params![session_id, memory_id, usage.as_str(), Utc::now()],
        )?;
        Ok(())
    }

    pub fn memories_for_session(&self, session_id: &str) -> Result<Vec<Memory>> {
        let reader = self.reader()?;
        let columns = qualified_columns("m");
        let mut stmt = reader.prepare(&format!(
            "SELECT DISTINCT {columns} FROM memories m
             JOIN session_memories sm ON sm.memory_id = m.id
             WHERE sm.session_id = ?1
             ORDER BY m.created_at ASC"
        ))?;
        let rows = stmt.query_map(params![session_id], memory_from_row)?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    /// Whether a memory is linked to a session (any usage)
    pub fn is_linked_to_session(&self, session_id: &str, memory_id: &str) -> Result<bool> {
        let reader = self.reader()?;
        Ok(reader.query_row(
            "SELECT EXISTS (SELECT 1 FROM session_memories WHERE session_id = ?1 AND memory_id = ?2)",
            params![session_id, memory_id],
            |row| row.get(0),
        )?)
    }

    pub fn list_memories(&self, filter: &ListFilter) -> Result<Vec<Memory>> {
        let mut sql = format!("SELECT {MEMORY_COLUMNS} FROM memories WHERE 1=1");
        let mut args: Vec<Box<dyn rusqlite::types::ToSql>> = Vec::new();

        if let Some(project_id) = &filter.project_id {
            sql.push_str(" AND project_id = ?");
            args.push(Box::new(project_id.clone()));
        }
        if let Some(sector) = filter.sector {
            sql.push_str(" AND sector = ?");
            args.push(Box::new(sector.as_str()));
        }
        if let Some(tier) = filter.tier {
            sql.push_str(" AND tier = ?");
            args.push(Box::new(tier.as_str()));
        }
        if let Some(memory_type) = filter.memory_type {
            sql.push_str(" AND memory_type = ?");
            args.push(Box::new(memory_type.as_str()));
        }
        if let Some(min_salience) = filter.min_salience {
            sql.push_str(" AND salience >= ?");
            args.push(Box::new(min_salience));
        }
        if !filter.include_deleted {
            sql.push_str(" AND is_deleted = 0");
        }

        sql.push_str(match filter.order {
            ListOrder::CreatedDesc => " ORDER BY created_at DESC",
            ListOrder::UpdatedDesc => " ORDER BY updated_at DESC",
            ListOrder::SalienceDesc => " ORDER BY salience DESC",
        });

        if let Some(limit) = filter.limit {
            sql.push_str(&format!(" LIMIT {}", limit));
        }

        let reader = self.reader()?;
        let mut stmt = reader.prepare(&sql)?;
        let rows = stmt.query_map(
            params_from_iter(args.iter().map(|a| a.as_ref())),
            memory_from_row,
        )?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    // ========================================================================
    // Dedup support
    // ========================================================================

    /// Exact-hash fast path: newest non-deleted memory with the same content
    /// hash in the project
    pub fn find_by_content_hash(&self, project_id: &str, hash: &str) -> Result<Option<String>> {
        let reader = self.reader()?;
        Ok(reader
            .query_row(
                "SELECT id FROM memories
                 WHERE project_id = ?1 AND content_hash = ?2 AND is_deleted = 0
                 ORDER BY created_at DESC LIMIT 1",
                params![project_id, hash],
                |row| row.get(0),
            )
            .optional()?)
    }

    /// SimHash candidates for the duplicate scan: non-deleted, non-null
    /// simhash, newest first
    pub fn duplicate_candidates(
        &self,
        project_id: &str,
        limit: usize,
    ) -> Result<Vec<(String, String)>> {
        let reader = self.reader()?;
        let mut stmt = reader.prepare(
            "SELECT id, simhash FROM memories
             WHERE project_id = ?1 AND is_deleted = 0 AND simhash IS NOT NULL
             ORDER BY created_at DESC LIMIT ?2",
        )?;
        let rows = stmt.query_map(params![project_id, limit as i64], |row| {
            Ok((row.get(0)?, row.get(1)?))
        })?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    // ========================================================================
    // Memory vectors
    // ========================================================================

    /// Replace the memory's vector (at most one per memory)
    pub fn upsert_memory_vector(
        &self,
        memory_id: &str,
        model_id: &str,
        vector: &[f32],
    ) -> Result<()> {
        let writer = self.writer()?;
        writer.execute(
            "INSERT INTO memory_vectors (memory_id, model_id, vector, dim, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5)
             ON CONFLICT (memory_id) DO UPDATE SET
                model_id = excluded.model_id, vector = excluded.vector,
                dim = excluded.dim, created_at = excluded.created_at",
            params![memory_id, model_id, vec_to_blob(vector), vector.len() as i64, Utc::now()],
        )?;
        Ok(())
    }

    /// Vector rows usable for a query: matching model and exact dimension.
    /// Rows with a stale dimension are silently skipped, not migrated.
    pub fn memory_vector_rows(
        &self,
        project_id: Option<&str>,
        model_id: &str,
        dim: usize,
    ) -> Result<Vec<(String, Vec<f32>)>> {
        let reader = self.reader()?;
        let mut out = Vec::new();

        let mut collect = |rows: &mut rusqlite::Rows<'_>| -> rusqlite::Result<()> {
            while let Some(row) = rows.next()? {
                let id: String = row.get(0)?;
                let blob: Vec<u8> = row.get(1)?;
                if let Some(vector) = blob_to_vec(&blob) {
                    if vector.len() == dim {
                        out.push((id, vector));
                    }
                }
            }
            Ok(())
        };

        match project_id {
            Some(project_id) => {
                let mut stmt = reader.prepare(
                    "SELECT v.memory_id, v.vector FROM memory_vectors v
                     JOIN memories m ON m.id = v.memory_id
                     WHERE m.project_id = ?1 AND m.is_deleted = 0
                       AND v.model_id = ?2 AND v.dim = ?3",
                )?;
                let mut rows = stmt.query(params![project_id, model_id, dim as i64])?;
                collect(&mut rows)?;
            }
            None => {
                let mut stmt = reader.prepare(
                    "SELECT v.memory_id, v.vector FROM memory_vectors v
                     JOIN memories m ON m.id = v.memory_id
                     WHERE m.is_deleted = 0 AND v.model_id = ?1 AND v.dim = ?2",
                )?;
                let mut rows = stmt.query(params![model_id, dim as i64])?;
                collect(&mut rows)?;
            }
        }

        Ok(out)
    }

    // ========================================================================
    // Full-text search
    // ========================================================================

    /// FTS over memory content, BM25-ordered, best first
    pub fn fts_search_memories(
        &self,
        match_query: &str,
        project_id: Option<&str>,
        limit: usize,
    ) -> Result<Vec<FtsHit>> {
        if match_query.is_empty() {
            return Ok(Vec::new());
        }
        let reader = self.reader()?;

        let map_hit = |row: &Row<'_>| -> rusqlite::Result<FtsHit> {
            Ok(FtsHit {
                memory_id: row.get(0)?,
                rank: row.get(1)?,
                snippet: row.get(2)?,
            })
        };

        let hits = match project_id {
            Some(project_id) => {
                let mut stmt = reader.prepare(
                    "SELECT m.id, f.rank, snippet(memories_fts, 0, '[', ']', '…', 12)
                     FROM memories_fts f
                     JOIN memories m ON m.rowid = f.rowid
                     WHERE memories_fts MATCH ?1 AND m.project_id = ?2
                     ORDER BY f.rank LIMIT ?3",
                )?;
                let rows = stmt.query_map(params![match_query, project_id, limit as i64], map_hit)?;
                rows.collect::<rusqlite::Result<Vec<_>>>()?
            }
            None => {
                let mut stmt = reader.prepare(
                    "SELECT m.id, f.rank, snippet(memories_fts, 0, '[', ']', '…', 12)
                     FROM memories_fts f
                     JOIN memories m ON m.rowid = f.rowid
                     WHERE memories_fts MATCH ?1
                     ORDER BY f.rank LIMIT ?2",
                )?;
                let rows = stmt.query_map(params![match_query, limit as i64], map_hit)?;
                rows.collect::<rusqlite::Result<Vec<_>>>()?
            }
        };

        Ok(hits)
    }

    // ========================================================================
    // Decay support
    // ========================================================================

    /// Next decay batch: non-deleted memories above the floor, least recently
    /// updated first
    pub fn decay_batch(&self, floor: f64, batch_size: usize) -> Result<Vec<Memory>> {
        let reader = self.reader()?;
        let mut stmt = reader.prepare(&format!(
            "SELECT {MEMORY_COLUMNS} FROM memories
             WHERE is_deleted = 0 AND salience > ?1
             ORDER BY updated_at ASC LIMIT ?2"
        ))?;
        let rows = stmt.query_map(params![floor, batch_size as i64], memory_from_row)?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    // ========================================================================
    // Search enrichment (one query each)
    // ========================================================================

    /// Source session for each memory: the first `created` link
    pub fn source_sessions(&self, memory_ids: &[String]) -> Result<HashMap<String, String>> {
        if memory_ids.is_empty() {
            return Ok(HashMap::new());
        }
        let reader = self.reader()?;
        let placeholders = placeholders(memory_ids.len());
        // SQLite picks the bare column from the row matching MIN(created_at)
        let mut stmt = reader.prepare(&format!(
            "SELECT memory_id, session_id, MIN(created_at) FROM session_memories
             WHERE usage_type = 'created' AND memory_id IN ({placeholders})
             GROUP BY memory_id"
        ))?;
        let rows = stmt.query_map(params_from_iter(memory_ids.iter()), |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
        })?;
        Ok(rows.collect::<rusqlite::Result<HashMap<_, _>>>()?)
    }

    /// Superseding-memory map: for each input id, the newest non-deleted
    /// SUPERSEDES source whose edge is still open
    pub fn superseding_map(&self, memory_ids: &[String]) -> Result<HashMap<String, String>> {
        if memory_ids.is_empty() {
            return Ok(HashMap::new());
        }
        let reader = self.reader()?;
        let placeholders = placeholders(memory_ids.len());
        let mut stmt = reader.prepare(&format!(
            "SELECT r.target_memory_id, r.source_memory_id FROM memory_relationships r
             JOIN memories s ON s.id = r.source_memory_id
             WHERE r.relationship_type = 'SUPERSEDES' AND r.valid_until IS NULL
               AND s.is_deleted = 0 AND r.target_memory_id IN ({placeholders})
             ORDER BY r.created_at ASC"
        ))?;
        let rows = stmt.query_map(params_from_iter(memory_ids.iter()), |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
        })?;
        // Ascending order + HashMap insert leaves the newest edge in place
        Ok(rows.collect::<rusqlite::Result<HashMap<_, _>>>()?)
    }

    /// Open-edge counts with the memory at either endpoint
    pub fn related_counts(&self, memory_ids: &[String]) -> Result<HashMap<String, i64>> {
        if memory_ids.is_empty() {
            return Ok(HashMap::new());
        }
        let reader = self.reader()?;
        let placeholders = placeholders(memory_ids.len());
        let sql = format!(
            "SELECT id, (
                SELECT COUNT(*) FROM memory_relationships r
                WHERE r.valid_until IS NULL
                  AND (r.source_memory_id = memories.id OR r.target_memory_id = memories.id)
             ) FROM memories WHERE id IN ({placeholders})"
        );
        let mut stmt = reader.prepare(&sql)?;
        let rows = stmt.query_map(params_from_iter(memory_ids.iter()), |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?))
        })?;
        Ok(rows.collect::<rusqlite::Result<HashMap<_, _>>>()?)
    }

    // ========================================================================
    // Timeline
    // ========================================================================

    /// Non-deleted project memories strictly before `at`, newest first
    pub fn memories_before(
        &self,
        project_id: &str,
        at: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<Memory>> {
        let reader = self.reader()?;
        let mut stmt = reader.prepare(&format!(
            "SELECT {MEMORY_COLUMNS} FROM memories
             WHERE project_id = ?1 AND is_deleted = 0 AND created_at < ?2
             ORDER BY created_at DESC LIMIT ?3"
        ))?;
        let rows = stmt.query_map(params![project_id, at, limit as i64], memory_from_row)?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    /// Non-deleted project memories strictly after `at`, oldest first
    pub fn memories_after(
        &self,
        project_id: &str,
        at: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<Memory>> {
        let reader = self.reader()?;
        let mut stmt = reader.prepare(&format!(
            "SELECT {MEMORY_COLUMNS} FROM memories
             WHERE project_id = ?1 AND is_deleted = 0 AND created_at > ?2
             ORDER BY created_at ASC LIMIT ?3"
        ))?;
        let rows = stmt.query_map(params![project_id, at, limit as i64], memory_from_row)?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    // ========================================================================
    // Relationships
    // ========================================================================

    pub fn insert_relationship(&self, relationship: &MemoryRelationship) -> Result<()> {
        let writer = self.writer()?;
        writer.execute(
            "INSERT INTO memory_relationships
                (id, source_memory_id, target_memory_id, relationship_type, confidence,
                 extracted_by, created_at, valid_from, valid_until)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
            params![
                relationship.id,
                relationship.source_memory_id,
                relationship.target_memory_id,
                relationship.relationship_type.as_str(),
                relationship.confidence,
                relationship.extracted_by.as_str(),
                relationship.created_at,
                relationship.valid_from,
                relationship.valid_until,
            ],
        )?;
        Ok(())
    }

    /// Edges touching a memory. History (closed edges) is excluded unless
    /// requested.
    pub fn relationships_for(
        &self,
        memory_id: &str,
        include_history: bool,
    ) -> Result<Vec<MemoryRelationship>> {
        let reader = self.reader()?;
        let history = if include_history {
            ""
        } else {
            " AND valid_until IS NULL"
        };
        let mut stmt = reader.prepare(&format!(
            "SELECT id, source_memory_id, target_memory_id, relationship_type, confidence,
                    extracted_by, created_at, valid_from, valid_until
             FROM memory_relationships
             WHERE (source_memory_id = ?1 OR target_memory_id = ?1){history}
             ORDER BY created_at DESC"
        ))?;
        let rows = stmt.query_map(params![memory_id], relationship_from_row)?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    /// Close a memory's validity window, only if still open. Returns whether
    /// the window was closed by this call.
    pub fn close_memory_validity(&self, memory_id: &str, at: DateTime<Utc>) -> Result<bool> {
        let writer = self.writer()?;
        let changed = writer.execute(
            "UPDATE memories SET valid_until = ?1, updated_at = ?1
             WHERE id = ?2 AND valid_until IS NULL",
            params![at, memory_id],
        )?;
        Ok(changed > 0)
    }

    /// Newest open SUPERSEDES source for a memory, skipping deleted sources
    pub fn get_superseding(&self, memory_id: &str) -> Result<Option<Memory>> {
        let reader = self.reader()?;
        Ok(reader
            .query_row(
                &format!(
                    "SELECT {MEMORY_COLUMNS} FROM memories
                     WHERE is_deleted = 0 AND id = (
                        SELECT r.source_memory_id FROM memory_relationships r
                        JOIN memories s ON s.id = r.source_memory_id
                        WHERE r.relationship_type = 'SUPERSEDES' AND r.target_memory_id = ?1
                          AND r.valid_until IS NULL AND s.is_deleted = 0
                        ORDER BY r.created_at DESC LIMIT 1
                     )"
                ),
                params![memory_id],
                memory_from_row,
            )
            .optional()?)
    }

    // ========================================================================
    // Embedding model registry
    // ========================================================================

    /// Upsert a model row and mark it active, demoting all others
    pub fn register_active_model(
        &self,
        id: &str,
        provider: &str,
        name: &str,
        dimensions: usize,
    ) -> Result<()> {
        let writer = self.writer()?;
        writer.execute("UPDATE embedding_models SET is_active = 0", [])?;
        writer.execute(
            "INSERT INTO embedding_models (id, provider, name, dimensions, is_active, created_at)
             VALUES (?1, ?2, ?3, ?4, 1, ?5)
             ON CONFLICT (id) DO UPDATE SET
                provider = excluded.provider, name = excluded.name,
                dimensions = excluded.dimensions, is_active = 1",
            params![id, provider, name, dimensions as i64, Utc::now()],
        )?;
        Ok(())
    }

    /// The single active embedding model, if any
    pub fn active_model(&self) -> Result<Option<EmbeddingModelRow>> {
        let reader = self.reader()?;
        Ok(reader
            .query_row(
                "SELECT id, provider, name, dimensions, is_active FROM embedding_models
                 WHERE is_active = 1 LIMIT 1",
                [],
                |row| {
                    Ok(EmbeddingModelRow {
                        id: row.get(0)?,
                        provider: row.get(1)?,
                        name: row.get(2)?,
                        dimensions: row.get::<_, i64>(3)? as usize,
                        is_active: row.get::<_, i64>(4)? != 0,
                    })
                },
            )
            .optional()?)
    }

    // ========================================================================
    // Stats
    // ========================================================================

    pub fn memory_stats(&self, project_id: &str) -> Result<MemoryStats> {
        let reader = self.reader()?;

        let (total, deleted, average_salience): (i64, i64, f64) = reader.query_row(
            "SELECT COUNT(*),
                    COALESCE(SUM(is_deleted), 0),
                    COALESCE(AVG(CASE WHEN is_deleted = 0 THEN salience END), 0.0)
             FROM memories WHERE project_id = ?1",
            params![project_id],
            |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
        )?;

        let embedded: i64 = reader.query_row(
            "SELECT COUNT(*) FROM memory_vectors v
             JOIN memories m ON m.id = v.memory_id
             WHERE m.project_id = ?1 AND m.is_deleted = 0",
            params![project_id],
            |row| row.get(0),
        )?;

        let mut by_sector = Vec::new();
        let mut stmt = reader.prepare(
            "SELECT sector, COUNT(*) FROM memories
             WHERE project_id = ?1 AND is_deleted = 0 GROUP BY sector",
        )?;
        let rows = stmt.query_map(params![project_id], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?))
        })?;
        for row in rows {
            by_sector.push(row?);
        }

        let mut by_tier = Vec::new();
        let mut stmt = reader.prepare(
            "SELECT tier, COUNT(*) FROM memories
             WHERE project_id = ?1 AND is_deleted = 0 GROUP BY tier",
        )?;
        let rows = stmt.query_map(params![project_id], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?))
        })?;
        for row in rows {
            by_tier.push(row?);
        }

        Ok(MemoryStats {
            total,
            deleted,
            embedded,
            average_salience,
            by_sector,
            by_tier,
        })
    }
}

// ============================================================================
// ROW MAPPING
// ============================================================================

fn placeholders(n: usize) -> String {
    vec!["?"; n].join(", ")
}

/// `MEMORY_COLUMNS` with a table alias prefix, for joined queries
fn qualified_columns(alias: &str) -> String {
    MEMORY_COLUMNS
        .split(", ")
        .map(|column| format!("{alias}.{column}"))
        .collect::<Vec<_>>()
        .join(", ")
}

fn json_array(values: &[String]) -> String {
    serde_json::to_string(values).unwrap_or_else(|_| "[]".to_string())
}

fn parse_json_array(raw: String) -> Vec<String> {
    serde_json::from_str(&raw).unwrap_or_default()
}

fn project_from_row(row: &Row<'_>) -> rusqlite::Result<Project> {
    Ok(Project {
        id: row.get(0)?,
        path: row.get(1)?,
        name: row.get(2)?,
        created_at: row.get(3)?,
        updated_at: row.get(4)?,
    })
}

fn session_from_row(row: &Row<'_>) -> rusqlite::Result<Session> {
    Ok(Session {
        id: row.get(0)?,
        project_id: row.get(1)?,
        started_at: row.get(2)?,
        ended_at: row.get(3)?,
        summary: row.get(4)?,
        context: row.get(5)?,
    })
}

pub(crate) fn memory_from_row(row: &Row<'_>) -> rusqlite::Result<Memory> {
    let sector: String = row.get(6)?;
    let tier: String = row.get(7)?;
    let memory_type: Option<String> = row.get(8)?;
    Ok(Memory {
        id: row.get(0)?,
        project_id: row.get(1)?,
        content: row.get(2)?,
        summary: row.get(3)?,
        content_hash: row.get(4)?,
        simhash: row.get(5)?,
        sector: Sector::from_str(&sector).unwrap_or_default(),
        tier: Tier::from_str(&tier).unwrap_or_default(),
        memory_type: memory_type.and_then(|t| MemoryType::from_str(&t).ok()),
        importance: row.get(9)?,
        salience: row.get(10)?,
        access_count: row.get(11)?,
        created_at: row.get(12)?,
        updated_at: row.get(13)?,
        last_accessed: row.get(14)?,
        valid_from: row.get(15)?,
        valid_until: row.get(16)?,
        is_deleted: row.get::<_, i64>(17)? != 0,
        deleted_at: row.get(18)?,
        tags: parse_json_array(row.get(19)?),
        concepts: parse_json_array(row.get(20)?),
        files: parse_json_array(row.get(21)?),
        categories: parse_json_array(row.get(22)?),
    })
}

fn relationship_from_row(row: &Row<'_>) -> rusqlite::Result<MemoryRelationship> {
    let relationship_type: String = row.get(3)?;
    let extracted_by: String = row.get(5)?;
    Ok(MemoryRelationship {
        id: row.get(0)?,
        source_memory_id: row.get(1)?,
        target_memory_id: row.get(2)?,
        relationship_type: RelationshipType::from_str(&relationship_type)
            .unwrap_or(RelationshipType::RelatedTo),
        confidence: row.get(4)?,
        extracted_by: ExtractedBy::from_str(&extracted_by).unwrap_or(ExtractedBy::System),
        created_at: row.get(6)?,
        valid_from: row.get(7)?,
        valid_until: row.get(8)?,
    })
}

// ============================================================================
// TESTS
// ============================================================================
