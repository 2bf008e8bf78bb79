//! Storage Module
//!
//! SQLite-based storage layer with:
//! - WAL-mode durability, separate reader/writer connections
//! - Versioned migrations (failure aborts startup)
//! - FTS5 mirrors of memory and document content
//! - Little-endian float32 vector blobs

mod code;
mod migrations;
mod sqlite;

pub use code::{
    ChunkRow, CodeIndexState, Document, DocumentHit, IndexedFileRow, ProcessedFileRow,
    WriteBatchOp,
};
pub use migrations::{apply_migrations, Migration, MIGRATIONS};
pub use sqlite::{
    blob_to_vec, vec_to_blob, EmbeddingModelRow, FtsHit, Result, StorageError, Store,
};
