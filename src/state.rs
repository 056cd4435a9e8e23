//! Durable indexing state
//!
//! One row of cursor + counters plus the set of indexed chunk hashes.
//! `record_chunks` and `reset` are single transactions: the cursor only
//! ever reflects fully completed batches, which is what makes indexing
//! resumable after a crash.

use std::collections::HashSet;
use std::path::Path;

use rusqlite::{params, Connection, OpenFlags};
use tracing::debug;

use crate::error::Result;
use crate::types::{ChunkRecord, IndexingState, StateUpdate};

/// Durable cursor + chunk-hash set for incremental indexing
pub struct StateStore {
    conn: Connection,
}

impl StateStore {
    /// Open (or create) the state database, initializing the schema and
    /// the singleton state row on first use
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let flags = OpenFlags::SQLITE_OPEN_READ_WRITE
            | OpenFlags::SQLITE_OPEN_CREATE
            | OpenFlags::SQLITE_OPEN_NO_MUTEX;
        let conn = Connection::open_with_flags(path, flags)?;
        Self::from_connection(conn)
    }

    /// In-memory store for tests
    pub fn open_in_memory() -> Result<Self> {
        Self::from_connection(Connection::open_in_memory()?)
    }

    fn from_connection(conn: Connection) -> Result<Self> {
        conn.execute_batch(
            r#"
            PRAGMA journal_mode=WAL;
            PRAGMA synchronous=NORMAL;
            PRAGMA busy_timeout=30000;

            CREATE TABLE IF NOT EXISTS indexing_state (
                id INTEGER PRIMARY KEY CHECK (id = 1),
                last_message_rowid INTEGER NOT NULL DEFAULT 0,
                last_indexed_at INTEGER,
                total_messages_indexed INTEGER NOT NULL DEFAULT 0,
                total_chunks_created INTEGER NOT NULL DEFAULT 0
            );

            CREATE TABLE IF NOT EXISTS indexed_chunks (
                chunk_hash TEXT PRIMARY KEY,
                message_rowids TEXT NOT NULL,
                document_id TEXT NOT NULL,
                created_at INTEGER NOT NULL
            );

            INSERT OR IGNORE INTO indexing_state (id) VALUES (1);
            "#,
        )?;
        Ok(Self { conn })
    }

    /// Current cursor and counters
    pub fn state(&self) -> Result<IndexingState> {
        Ok(self.conn.query_row(
            "SELECT last_message_rowid, last_indexed_at, total_messages_indexed,
                    total_chunks_created
             FROM indexing_state WHERE id = 1",
            [],
            |row| {
                Ok(IndexingState {
                    last_message_rowid: row.get(0)?,
                    last_indexed_at: row.get(1)?,
                    total_messages_indexed: row.get(2)?,
                    total_chunks_created: row.get(3)?,
                })
            },
        )?)
    }

    /// Apply a partial state update; `None` fields are untouched
    pub fn update_state(&self, update: &StateUpdate) -> Result<()> {
        self.conn.execute(
            "UPDATE indexing_state SET
                last_message_rowid = COALESCE(?1, last_message_rowid),
                last_indexed_at = COALESCE(?2, last_indexed_at),
                total_messages_indexed = COALESCE(?3, total_messages_indexed),
                total_chunks_created = COALESCE(?4, total_chunks_created)
             WHERE id = 1",
            params![
                update.last_message_rowid,
                update.last_indexed_at,
                update.total_messages_indexed,
                update.total_chunks_created,
            ],
        )?;
        Ok(())
    }

    pub fn is_chunk_indexed(&self, chunk_hash: &str) -> Result<bool> {
        let count: i64 = self.conn.query_row(
            "SELECT COUNT(*) FROM indexed_chunks WHERE chunk_hash = ?1",
            [chunk_hash],
            |row| row.get(0),
        )?;
        Ok(count > 0)
    }

    /// Full hash set, snapshotted for in-memory dedup during a run
    pub fn indexed_chunk_hashes(&self) -> Result<HashSet<String>> {
        let mut stmt = self.conn.prepare("SELECT chunk_hash FROM indexed_chunks")?;
        let rows = stmt.query_map([], |row| row.get::<_, String>(0))?;
        let mut hashes = HashSet::new();
        for row in rows {
            hashes.insert(row?);
        }
        Ok(hashes)
    }

    /// Record a batch of indexed chunks atomically: all entries or none
    pub fn record_chunks(&mut self, records: &[ChunkRecord]) -> Result<()> {
        let tx = self.conn.transaction()?;
        {
            let mut stmt = tx.prepare(
                "INSERT OR REPLACE INTO indexed_chunks
                    (chunk_hash, message_rowids, document_id, created_at)
                 VALUES (?1, ?2, ?3, ?4)",
            )?;
            for record in records {
                stmt.execute(params![
                    record.chunk_hash,
                    serde_json::to_string(&record.message_rowids)?,
                    record.document_id,
                    record.created_at,
                ])?;
            }
        }
        tx.commit()?;
        debug!(count = records.len(), "recorded indexed chunks");
        Ok(())
    }

    /// Empty the chunk set and zero the counters in one transaction
    pub fn reset(&mut self) -> Result<()> {
        let tx = self.conn.transaction()?;
        tx.execute("DELETE FROM indexed_chunks", [])?;
        tx.execute(
            "UPDATE indexing_state SET
                last_message_rowid = 0,
                last_indexed_at = NULL,
                total_messages_indexed = 0,
                total_chunks_created = 0
             WHERE id = 1",
            [],
        )?;
        tx.commit()?;
        Ok(())
    }

    pub fn chunk_count(&self) -> Result<i64> {
        Ok(self
            .conn
            .query_row("SELECT COUNT(*) FROM indexed_chunks", [], |row| row.get(0))?)
    }

    /// Release the underlying handle
    pub fn close(self) {
        drop(self.conn);
    }
}
