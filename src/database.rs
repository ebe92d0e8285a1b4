use crate::chunking::TextChunk;
use crate::error::{RagError, Result};
use chrono::{DateTime, SecondsFormat, Utc};
use log::debug;
use rusqlite::{params, Connection, OptionalExtension, Row};
use std::collections::HashMap;
use std::fs;
use std::path::Path;
use std::sync::{Mutex, RwLock};

/// File name of the chunk database inside the data directory
pub const CHUNK_DB_FILE: &str = "chunks.db";

/// Durable keyed store of chunk records. Append-only: there is no update
/// or delete.
pub trait ChunkStore: Send + Sync {
    /// Store a chunk. The record is durable once this returns.
    fn insert(&self, chunk: &TextChunk) -> Result<()>;

    /// Look up a chunk by id, failing with `ChunkNotFound` when absent
    fn get_by_id(&self, id: &str) -> Result<TextChunk>;

    /// Number of stored chunks
    fn count(&self) -> Result<usize>;
}

/// Chunk store backed by a single SQLite table
pub struct SqliteChunkStore {
    conn: Mutex<Connection>,
}

impl SqliteChunkStore {
    /// Open (or create) the database at `db_path`
    pub fn open<P: AsRef<Path>>(db_path: P) -> Result<Self> {
        let db_path = db_path.as_ref().to_path_buf();

        if let Some(parent) = db_path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }

        let conn = Connection::open(&db_path)?;

        // synchronous=FULL makes every committed insert survive a crash
        conn.execute_batch(
            "PRAGMA journal_mode=WAL;
             PRAGMA synchronous=FULL;
             CREATE TABLE IF NOT EXISTS chunks (
                 id          TEXT PRIMARY KEY,
                 content     TEXT NOT NULL,
                 source_file TEXT NOT NULL,
                 chunk_index INTEGER NOT NULL,
                 created_at  TEXT NOT NULL
             );",
        )?;

        debug!("Opened chunk store at {}", db_path.display());

        Ok(SqliteChunkStore {
            conn: Mutex::new(conn),
        })
    }
}

impl ChunkStore for SqliteChunkStore {
    fn insert(&self, chunk: &TextChunk) -> Result<()> {
        let conn = self.conn.lock()?;
        conn.execute(
            "INSERT INTO chunks (id, content, source_file, chunk_index, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                chunk.id,
                chunk.content,
                chunk.source_file,
                chunk.chunk_index as i64,
                chunk
                    .created_at
                    .to_rfc3339_opts(SecondsFormat::Nanos, true),
            ],
        )?;
        Ok(())
    }

    fn get_by_id(&self, id: &str) -> Result<TextChunk> {
        let conn = self.conn.lock()?;
        conn.query_row(
            "SELECT id, content, source_file, chunk_index, created_at
             FROM chunks WHERE id = ?1",
            params![id],
            chunk_from_row,
        )
        .optional()?
        .ok_or_else(|| RagError::ChunkNotFound(id.to_string()))
    }

    fn count(&self) -> Result<usize> {
        let conn = self.conn.lock()?;
        let count: i64 = conn.query_row("SELECT COUNT(*) FROM chunks", [], |row| row.get(0))?;
        Ok(count as usize)
    }
}

fn chunk_from_row(row: &Row<'_>) -> rusqlite::Result<TextChunk> {
    let chunk_index: i64 = row.get(3)?;
    let created_at: String = row.get(4)?;
    let created_at = DateTime::parse_from_rfc3339(&created_at)
        .map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(4, rusqlite::types::Type::Text, Box::new(e))
        })?
        .with_timezone(&Utc);

    Ok(TextChunk {
        id: row.get(0)?,
        content: row.get(1)?,
        source_file: row.get(2)?,
        chunk_index: chunk_index as usize,
        created_at,
    })
}

/// In-memory chunk store for tests and throwaway corpora
#[derive(Default)]
pub struct MemoryChunkStore {
    chunks: RwLock<HashMap<String, TextChunk>>,
}

impl MemoryChunkStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl ChunkStore for MemoryChunkStore {
    fn insert(&self, chunk: &TextChunk) -> Result<()> {
        let mut chunks = self.chunks.write()?;
        if chunks.contains_key(&chunk.id) {
            return Err(RagError::Storage(format!("duplicate chunk id {}", chunk.id)));
        }
        chunks.insert(chunk.id.clone(), chunk.clone());
        Ok(())
    }

    fn get_by_id(&self, id: &str) -> Result<TextChunk> {
        self.chunks
            .read()?
            .get(id)
            .cloned()
            .ok_or_else(|| RagError::ChunkNotFound(id.to_string()))
    }

    fn count(&self) -> Result<usize> {
        Ok(self.chunks.read()?.len())
    }
}
