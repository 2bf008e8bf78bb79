//! Database Migrations
//!
//! Schema migration definitions for the storage layer. Migrations are applied
//! in ascending version order inside one connection; any failure aborts
//! startup.

/// Migration definitions
pub const MIGRATIONS: &[Migration] = &[
    Migration {
        version: 1,
        name: "memory schema with FTS5 and bi-temporal validity",
        up: MIGRATION_V1_UP,
    },
    Migration {
        version: 2,
        name: "code index: documents, chunks, vectors, incremental state",
        up: MIGRATION_V2_UP,
    },
    Migration {
        version: 3,
        name: "richer memory classification",
        up: MIGRATION_V3_UP,
    },
];

/// A database migration
#[derive(Debug, Clone)]
pub struct Migration {
    /// Version number
    pub version: u32,
    /// Short description
    pub name: &'static str,
    /// SQL to apply
    pub up: &'static str,
}

/// V1: memories, sessions, relationships, vectors, FTS5 mirror
const MIGRATION_V1_UP: &str = r#"
CREATE TABLE IF NOT EXISTS projects (
    id TEXT PRIMARY KEY,
    path TEXT NOT NULL UNIQUE,
    name TEXT NOT NULL,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS sessions (
    id TEXT PRIMARY KEY,
    project_id TEXT NOT NULL REFERENCES projects(id) ON DELETE CASCADE,
    started_at TEXT NOT NULL,
    ended_at TEXT,
    summary TEXT,
    context TEXT
);

CREATE INDEX IF NOT EXISTS idx_sessions_project ON sessions(project_id);
CREATE INDEX IF NOT EXISTS idx_sessions_active ON sessions(project_id, ended_at);

CREATE TABLE IF NOT EXISTS memories (
    id TEXT PRIMARY KEY,
    project_id TEXT NOT NULL REFERENCES projects(id) ON DELETE CASCADE,
    content TEXT NOT NULL,
    summary TEXT,
    content_hash TEXT NOT NULL,
    simhash TEXT,
    sector TEXT NOT NULL DEFAULT 'semantic',
    tier TEXT NOT NULL DEFAULT 'project',
    importance REAL NOT NULL DEFAULT 0.5,
    salience REAL NOT NULL DEFAULT 1.0,
    access_count INTEGER NOT NULL DEFAULT 0,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL,
    last_accessed TEXT NOT NULL,

    -- Bi-temporal validity, independent of wall-clock insertion
    valid_from TEXT,
    valid_until TEXT,

    -- Soft delete
    is_deleted INTEGER NOT NULL DEFAULT 0,
    deleted_at TEXT,

    -- JSON string arrays; empty array is the canonical "none"
    tags TEXT NOT NULL DEFAULT '[]',
    concepts TEXT NOT NULL DEFAULT '[]',
    files TEXT NOT NULL DEFAULT '[]',
    categories TEXT NOT NULL DEFAULT '[]'
);

CREATE INDEX IF NOT EXISTS idx_memories_project ON memories(project_id);
CREATE INDEX IF NOT EXISTS idx_memories_simhash ON memories(project_id, simhash);
CREATE INDEX IF NOT EXISTS idx_memories_content_hash ON memories(project_id, content_hash);
CREATE INDEX IF NOT EXISTS idx_memories_salience ON memories(salience);
CREATE INDEX IF NOT EXISTS idx_memories_updated ON memories(updated_at);
CREATE INDEX IF NOT EXISTS idx_memories_deleted ON memories(is_deleted);

-- Embedding vectors: at most one per memory, replaced on re-embed.
-- vector is a little-endian float32 array; dim matches its length.
CREATE TABLE IF NOT EXISTS memory_vectors (
    memory_id TEXT PRIMARY KEY REFERENCES memories(id) ON DELETE CASCADE,
    model_id TEXT NOT NULL,
    vector BLOB NOT NULL,
    dim INTEGER NOT NULL,
    created_at TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_memory_vectors_model ON memory_vectors(model_id, dim);

CREATE TABLE IF NOT EXISTS session_memories (
    session_id TEXT NOT NULL REFERENCES sessions(id) ON DELETE CASCADE,
    memory_id TEXT NOT NULL REFERENCES memories(id) ON DELETE CASCADE,
    usage_type TEXT NOT NULL,
    created_at TEXT NOT NULL,
    PRIMARY KEY (session_id, memory_id, usage_type)
);

CREATE INDEX IF NOT EXISTS idx_session_memories_memory ON session_memories(memory_id);

CREATE TABLE IF NOT EXISTS memory_relationships (
    id TEXT PRIMARY KEY,
    source_memory_id TEXT NOT NULL REFERENCES memories(id) ON DELETE CASCADE,
    target_memory_id TEXT NOT NULL REFERENCES memories(id) ON DELETE CASCADE,
    relationship_type TEXT NOT NULL,
    confidence REAL NOT NULL DEFAULT 1.0,
    extracted_by TEXT NOT NULL DEFAULT 'system',
    created_at TEXT NOT NULL,
    valid_from TEXT,
    valid_until TEXT
);

CREATE INDEX IF NOT EXISTS idx_relationships_source ON memory_relationships(source_memory_id);
CREATE INDEX IF NOT EXISTS idx_relationships_target ON memory_relationships(target_memory_id);
CREATE INDEX IF NOT EXISTS idx_relationships_type ON memory_relationships(relationship_type);

-- FTS5 mirror of memory content, kept in sync by triggers
CREATE VIRTUAL TABLE IF NOT EXISTS memories_fts USING fts5(
    content,
    content='memories',
    content_rowid='rowid',
    tokenize='porter ascii'
);

CREATE TRIGGER IF NOT EXISTS memories_fts_ai AFTER INSERT ON memories BEGIN
    INSERT INTO memories_fts(rowid, content) VALUES (NEW.rowid, NEW.content);
END;

CREATE TRIGGER IF NOT EXISTS memories_fts_ad AFTER DELETE ON memories BEGIN
    INSERT INTO memories_fts(memories_fts, rowid, content)
    VALUES ('delete', OLD.rowid, OLD.content);
END;

CREATE TRIGGER IF NOT EXISTS memories_fts_au AFTER UPDATE OF content ON memories BEGIN
    INSERT INTO memories_fts(memories_fts, rowid, content)
    VALUES ('delete', OLD.rowid, OLD.content);
    INSERT INTO memories_fts(rowid, content) VALUES (NEW.rowid, NEW.content);
END;
"#;

/// V2: code indexing tables
const MIGRATION_V2_UP: &str = r#"
CREATE TABLE IF NOT EXISTS documents (
    id TEXT PRIMARY KEY,
    project_id TEXT NOT NULL REFERENCES projects(id) ON DELETE CASCADE,
    source_path TEXT NOT NULL,
    language TEXT,
    line_count INTEGER NOT NULL DEFAULT 0,
    checksum TEXT NOT NULL,
    is_code INTEGER NOT NULL DEFAULT 1,
    full_content TEXT NOT NULL DEFAULT '',
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL,
    UNIQUE (project_id, source_path)
);

CREATE TABLE IF NOT EXISTS document_chunks (
    id TEXT PRIMARY KEY,
    document_id TEXT NOT NULL REFERENCES documents(id) ON DELETE CASCADE,
    chunk_index INTEGER NOT NULL,
    content TEXT NOT NULL,
    start_line INTEGER NOT NULL,
    end_line INTEGER NOT NULL,
    chunk_type TEXT NOT NULL DEFAULT 'block',
    symbols TEXT NOT NULL DEFAULT '[]',
    tokens_estimate INTEGER NOT NULL DEFAULT 0,
    cache_key TEXT NOT NULL,
    created_at TEXT NOT NULL,
    UNIQUE (document_id, chunk_index)
);

CREATE INDEX IF NOT EXISTS idx_chunks_document ON document_chunks(document_id);
CREATE INDEX IF NOT EXISTS idx_chunks_cache_key ON document_chunks(cache_key);

-- At most one vector per chunk per model
CREATE TABLE IF NOT EXISTS document_vectors (
    chunk_id TEXT NOT NULL REFERENCES document_chunks(id) ON DELETE CASCADE,
    model_id TEXT NOT NULL,
    vector BLOB NOT NULL,
    dim INTEGER NOT NULL,
    created_at TEXT NOT NULL,
    PRIMARY KEY (chunk_id, model_id)
);

CREATE TABLE IF NOT EXISTS indexed_files (
    project_id TEXT NOT NULL REFERENCES projects(id) ON DELETE CASCADE,
    path TEXT NOT NULL,
    checksum TEXT NOT NULL,
    mtime INTEGER NOT NULL,
    indexed_at TEXT NOT NULL,
    PRIMARY KEY (project_id, path)
);

CREATE TABLE IF NOT EXISTS code_index_state (
    project_id TEXT PRIMARY KEY REFERENCES projects(id) ON DELETE CASCADE,
    last_indexed_at TEXT,
    indexed_files INTEGER NOT NULL DEFAULT 0,
    gitignore_hash TEXT
);

CREATE TABLE IF NOT EXISTS embedding_models (
    id TEXT PRIMARY KEY,
    provider TEXT NOT NULL,
    name TEXT NOT NULL,
    dimensions INTEGER NOT NULL,
    is_active INTEGER NOT NULL DEFAULT 0,
    created_at TEXT NOT NULL
);

-- FTS5 mirror of document content
CREATE VIRTUAL TABLE IF NOT EXISTS documents_fts USING fts5(
    full_content,
    content='documents',
    content_rowid='rowid',
    tokenize='porter ascii'
);

CREATE TRIGGER IF NOT EXISTS documents_fts_ai AFTER INSERT ON documents BEGIN
    INSERT INTO documents_fts(rowid, full_content) VALUES (NEW.rowid, NEW.full_content);
END;

CREATE TRIGGER IF NOT EXISTS documents_fts_ad AFTER DELETE ON documents BEGIN
    INSERT INTO documents_fts(documents_fts, rowid, full_content)
    VALUES ('delete', OLD.rowid, OLD.full_content);
END;

CREATE TRIGGER IF NOT EXISTS documents_fts_au AFTER UPDATE OF full_content ON documents BEGIN
    INSERT INTO documents_fts(documents_fts, rowid, full_content)
    VALUES ('delete', OLD.rowid, OLD.full_content);
    INSERT INTO documents_fts(rowid, full_content) VALUES (NEW.rowid, NEW.full_content);
END;
"#;

/// V3: optional richer memory classification on top of sectors
const MIGRATION_V3_UP: &str = r#"
ALTER TABLE memories ADD COLUMN memory_type TEXT;

CREATE INDEX IF NOT EXISTS idx_memories_type ON memories(memory_type);
"#;

/// Get current schema version from the database
pub fn current_version(conn: &rusqlite::Connection) -> rusqlite::Result<u32> {
    let exists: bool = conn.query_row(
        "SELECT EXISTS (SELECT 1 FROM sqlite_master WHERE type = 'table' AND name = 'schema_migrations')",
        [],
        |row| row.get(0),
    )?;
    if !exists {
        return Ok(0);
    }
    conn.query_row(
        "SELECT COALESCE(MAX(version), 0) FROM schema_migrations",
        [],
        |row| row.get(0),
    )
}

/// Apply pending migrations in ascending order. Returns the number applied.
pub fn apply_migrations(conn: &rusqlite::Connection) -> rusqlite::Result<u32> {
    conn.execute(
        "CREATE TABLE IF NOT EXISTS schema_migrations (
            version INTEGER PRIMARY KEY,
            name TEXT NOT NULL,
            applied_at TEXT NOT NULL
        )",
        [],
    )?;

    let current = current_version(conn)?;
    let mut applied = 0;

    for migration in MIGRATIONS {
        if migration.version > current {
            tracing::info!(
                version = migration.version,
                name = migration.name,
                "Applying migration"
            );

            // execute_batch handles multi-statement SQL including triggers
            conn.execute_batch(migration.up)?;
            conn.execute(
                "INSERT INTO schema_migrations (version, name, applied_at) VALUES (?1, ?2, datetime('now'))",
                rusqlite::params![migration.version, migration.name],
            )?;

            applied += 1;
        }
    }

    Ok(applied)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rusqlite::Connection;

    #[test]
    fn migrations_apply_cleanly_in_memory() {
        let conn = Connection::open_in_memory().unwrap();
        let applied = apply_migrations(&conn).unwrap();
        assert_eq!(applied as usize, MIGRATIONS.len());
        assert_eq!(
            current_version(&conn).unwrap(),
            MIGRATIONS.last().unwrap().version
        );
    }

    #[test]
    fn migrations_are_idempotent() {
        let conn = Connection::open_in_memory().unwrap();
        apply_migrations(&conn).unwrap();
        let applied = apply_migrations(&conn).unwrap();
        assert_eq!(applied, 0);
    }

    #[test]
    fn versions_are_strictly_ascending() {
        for pair in MIGRATIONS.windows(2) {
            assert!(pair[0].version < pair[1].version);
        }
    }

    #[test]
    fn migration_table_records_names() {
        let conn = Connection::open_in_memory().unwrap();
        apply_migrations(&conn).unwrap();
        let count: i64 = conn
            .query_row(
                "SELECT COUNT(*) FROM schema_migrations WHERE name != ''",
                [],
                |row| row.get(0),
            )
            .unwrap();
        assert_eq!(count as usize, MIGRATIONS.len());
    }
}
