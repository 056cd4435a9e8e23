//! Hybrid full-text + dense-vector index store
//!
//! A single-file embedded index: documents live in one table with their
//! facets, an external-content FTS5 table provides BM25 keyword scoring,
//! and embedding vectors are stored as little-endian f32 blobs scored by
//! cosine similarity at query time. No server, no shards, no replicas.

mod search;

pub use search::escape_fts_query;

use std::path::Path;

use rusqlite::{Connection, OpenFlags};
use tracing::{debug, warn};

use crate::embedding::{bytes_to_vector, vector_to_bytes};
use crate::error::{RecollectError, Result};
use crate::types::{EnrichedChunk, IndexStats, IndexedDocument};

/// Documents per write transaction
pub const INDEX_BATCH_SIZE: usize = 100;

/// Embedded hybrid search index
pub struct SearchIndex {
    conn: Connection,
}

impl SearchIndex {
    /// Open (or create) the index database at `path`
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let flags = OpenFlags::SQLITE_OPEN_READ_WRITE
            | OpenFlags::SQLITE_OPEN_CREATE
            | OpenFlags::SQLITE_OPEN_NO_MUTEX;
        let conn = Connection::open_with_flags(path, flags)
            .map_err(|e| RecollectError::IndexUnavailable(format!("{}: {}", path.display(), e)))?;
        Self::configure(&conn)?;
        Ok(Self { conn })
    }

    /// In-memory index for tests
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        Self::configure(&conn)?;
        Ok(Self { conn })
    }

    fn configure(conn: &Connection) -> Result<()> {
        conn.execute_batch(
            r#"
            PRAGMA journal_mode=WAL;
            PRAGMA synchronous=NORMAL;
            PRAGMA busy_timeout=30000;
            PRAGMA cache_size=-64000;
            PRAGMA temp_store=MEMORY;
            "#,
        )?;
        Ok(())
    }

    /// Idempotent schema creation
    pub fn initialize(&self) -> Result<()> {
        self.conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS documents (
                seq INTEGER PRIMARY KEY AUTOINCREMENT,
                id TEXT NOT NULL UNIQUE,
                text TEXT NOT NULL,
                chat_id TEXT NOT NULL,
                chat_name TEXT,
                sender TEXT NOT NULL,
                sender_is_me INTEGER NOT NULL,
                participants TEXT NOT NULL DEFAULT '[]',
                participant_count INTEGER NOT NULL,
                is_dm INTEGER NOT NULL,
                is_group_chat INTEGER NOT NULL,
                year INTEGER NOT NULL,
                month INTEGER NOT NULL,
                day_of_week TEXT NOT NULL,
                hour_of_day INTEGER NOT NULL,
                has_attachment INTEGER NOT NULL,
                has_image INTEGER NOT NULL,
                start_ts INTEGER NOT NULL,
                end_ts INTEGER NOT NULL,
                message_rowids TEXT NOT NULL DEFAULT '[]',
                message_count INTEGER NOT NULL,
                text_embedding BLOB,
                image_embedding BLOB
            );

            CREATE VIRTUAL TABLE IF NOT EXISTS documents_fts USING fts5(
                text,
                content='documents',
                content_rowid='seq',
                tokenize='porter unicode61'
            );

            CREATE TRIGGER IF NOT EXISTS documents_ai AFTER INSERT ON documents BEGIN
                INSERT INTO documents_fts(rowid, text) VALUES (new.seq, new.text);
            END;
            CREATE TRIGGER IF NOT EXISTS documents_ad AFTER DELETE ON documents BEGIN
                INSERT INTO documents_fts(documents_fts, rowid, text)
                VALUES ('delete', old.seq, old.text);
            END;
            CREATE TRIGGER IF NOT EXISTS documents_au AFTER UPDATE ON documents BEGIN
                INSERT INTO documents_fts(documents_fts, rowid, text)
                VALUES ('delete', old.seq, old.text);
                INSERT INTO documents_fts(rowid, text) VALUES (new.seq, new.text);
            END;

            CREATE INDEX IF NOT EXISTS idx_documents_chat ON documents(chat_id);
            CREATE INDEX IF NOT EXISTS idx_documents_start ON documents(start_ts);
            CREATE INDEX IF NOT EXISTS idx_documents_sender ON documents(sender);
            "#,
        )?;
        Ok(())
    }

    /// Cheap liveness probe; failure is the store-unavailable condition
    pub fn health_check(&self) -> Result<()> {
        self.conn
            .query_row("SELECT 1", [], |_| Ok(()))
            .map_err(|e| RecollectError::IndexUnavailable(e.to_string()))
    }

    /// Bulk insert-or-replace by document id.
    ///
    /// Per-document failures are logged (first 3) and skipped without
    /// aborting the batch. Returns the ids actually written; callers
    /// must only mark those as indexed.
    pub fn index_documents(&mut self, docs: &[IndexedDocument]) -> Result<Vec<String>> {
        let mut written = Vec::with_capacity(docs.len());
        let mut failures = 0_usize;

        for batch in docs.chunks(INDEX_BATCH_SIZE) {
            let tx = self.conn.transaction()?;
            for doc in batch {
                match write_document(&tx, doc) {
                    Ok(()) => written.push(doc.chunk.id.clone()),
                    Err(e) => {
                        failures += 1;
                        if failures <= 3 {
                            warn!(id = %doc.chunk.id, error = %e, "failed to index document");
                        }
                    }
                }
            }
            tx.commit()?;
        }

        if failures > 3 {
            warn!(failures, "additional document failures suppressed");
        }
        debug!(written = written.len(), failures, "indexed document batch");
        Ok(written)
    }

    /// Make the latest batch durable (post-batch refresh)
    pub fn refresh(&self) -> Result<()> {
        // WAL checkpoint; harmless no-op for in-memory databases
        self.conn
            .execute_batch("PRAGMA wal_checkpoint(PASSIVE);")?;
        Ok(())
    }

    pub fn get_document(&self, id: &str) -> Result<Option<EnrichedChunk>> {
        let mut stmt = self
            .conn
            .prepare(&format!("SELECT {} FROM documents d WHERE d.id = ?1", DOC_COLUMNS))?;
        let mut rows = stmt.query_map([id], document_from_row)?;
        match rows.next() {
            Some(row) => Ok(Some(row?)),
            None => Ok(None),
        }
    }

    pub fn document_exists(&self, id: &str) -> Result<bool> {
        let count: i64 = self.conn.query_row(
            "SELECT COUNT(*) FROM documents WHERE id = ?1",
            [id],
            |row| row.get(0),
        )?;
        Ok(count > 0)
    }

    pub fn stats(&self) -> Result<IndexStats> {
        let document_count: i64 =
            self.conn
                .query_row("SELECT COUNT(*) FROM documents", [], |row| row.get(0))?;
        let index_size_bytes: i64 = self.conn.query_row(
            "SELECT page_count * page_size FROM pragma_page_count(), pragma_page_size()",
            [],
            |row| row.get(0),
        )?;
        Ok(IndexStats {
            document_count,
            index_size_bytes,
        })
    }

    /// Drop the index outright; `initialize()` is required before the
    /// next write.
    pub fn clear(&mut self) -> Result<()> {
        self.conn.execute_batch(
            r#"
            DROP TRIGGER IF EXISTS documents_ai;
            DROP TRIGGER IF EXISTS documents_ad;
            DROP TRIGGER IF EXISTS documents_au;
            DROP TABLE IF EXISTS documents_fts;
            DROP TABLE IF EXISTS documents;
            "#,
        )?;
        Ok(())
    }

    /// Release the underlying handle
    pub fn close(self) {
        drop(self.conn);
    }

    pub(crate) fn connection(&self) -> &Connection {
        &self.conn
    }
}

pub(crate) const DOC_COLUMNS: &str = "d.id, d.text, d.chat_id, d.chat_name, d.sender, d.sender_is_me,
     d.participants, d.participant_count, d.is_dm, d.is_group_chat,
     d.year, d.month, d.day_of_week, d.hour_of_day,
     d.has_attachment, d.has_image, d.start_ts, d.end_ts,
     d.message_rowids, d.message_count";

fn write_document(conn: &Connection, doc: &IndexedDocument) -> Result<()> {
    let c = &doc.chunk;
    conn.execute(
        "INSERT INTO documents (
            id, text, chat_id, chat_name, sender, sender_is_me,
            participants, participant_count, is_dm, is_group_chat,
            year, month, day_of_week, hour_of_day,
            has_attachment, has_image, start_ts, end_ts,
            message_rowids, message_count, text_embedding, image_embedding
         ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14,
                   ?15, ?16, ?17, ?18, ?19, ?20, ?21, ?22)
         ON CONFLICT(id) DO UPDATE SET
            text = excluded.text,
            chat_id = excluded.chat_id,
            chat_name = excluded.chat_name,
            sender = excluded.sender,
            sender_is_me = excluded.sender_is_me,
            participants = excluded.participants,
            participant_count = excluded.participant_count,
            is_dm = excluded.is_dm,
            is_group_chat = excluded.is_group_chat,
            year = excluded.year,
            month = excluded.month,
            day_of_week = excluded.day_of_week,
            hour_of_day = excluded.hour_of_day,
            has_attachment = excluded.has_attachment,
            has_image = excluded.has_image,
            start_ts = excluded.start_ts,
            end_ts = excluded.end_ts,
            message_rowids = excluded.message_rowids,
            message_count = excluded.message_count,
            text_embedding = excluded.text_embedding,
            image_embedding = excluded.image_embedding",
        rusqlite::params![
            c.id,
            c.text,
            c.chat_id,
            c.chat_name,
            c.sender,
            c.sender_is_me as i64,
            serde_json::to_string(&c.participants)?,
            c.participant_count as i64,
            c.is_dm as i64,
            c.is_group_chat as i64,
            c.year,
            c.month,
            c.day_of_week,
            c.hour_of_day,
            c.has_attachment as i64,
            c.has_image as i64,
            c.start_ts,
            c.end_ts,
            serde_json::to_string(&c.message_rowids)?,
            c.message_count as i64,
            doc.text_embedding.as_deref().map(vector_to_bytes),
            doc.image_embedding.as_deref().map(vector_to_bytes),
        ],
    )?;
    Ok(())
}

pub(crate) fn document_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<EnrichedChunk> {
    let participants_json: String = row.get(6)?;
    let rowids_json: String = row.get(18)?;
    Ok(EnrichedChunk {
        id: row.get(0)?,
        text: row.get(1)?,
        chat_id: row.get(2)?,
        chat_name: row.get(3)?,
        sender: row.get(4)?,
        sender_is_me: row.get::<_, i64>(5)? != 0,
        participants: serde_json::from_str(&participants_json).unwrap_or_default(),
        participant_count: row.get::<_, i64>(7)? as usize,
        is_dm: row.get::<_, i64>(8)? != 0,
        is_group_chat: row.get::<_, i64>(9)? != 0,
        year: row.get(10)?,
        month: row.get::<_, i64>(11)? as u32,
        day_of_week: row.get(12)?,
        hour_of_day: row.get::<_, i64>(13)? as u32,
        has_attachment: row.get::<_, i64>(14)? != 0,
        has_image: row.get::<_, i64>(15)? != 0,
        start_ts: row.get(16)?,
        end_ts: row.get(17)?,
        message_rowids: serde_json::from_str(&rowids_json).unwrap_or_default(),
        message_count: row.get::<_, i64>(19)? as usize,
    })
}

/// Read an embedding blob column as a vector
pub(crate) fn embedding_column(row: &rusqlite::Row<'_>, idx: usize) -> rusqlite::Result<Option<Vec<f32>>> {
    let blob: Option<Vec<u8>> = row.get(idx)?;
    Ok(blob.map(|b| bytes_to_vector(&b)))
}

#[cfg(test)]
pub(crate) mod test_support {
    use crate::types::{EnrichedChunk, IndexedDocument};

    /// Build a test document with sensible facet defaults
    pub fn doc(id: &str, text: &str) -> IndexedDocument {
        IndexedDocument {
            chunk: EnrichedChunk {
                id: id.to_string(),
                text: text.to_string(),
                chat_id: "chat1".to_string(),
                chat_name: None,
                sender: "Alice".to_string(),
                sender_is_me: false,
                participants: vec!["Alice".to_string(), "Me".to_string()],
                participant_count: 2,
                is_dm: true,
                is_group_chat: false,
                year: 2024,
                month: 6,
                day_of_week: "saturday".to_string(),
                hour_of_day: 10,
                has_attachment: false,
                has_image: false,
                start_ts: 1_718_400_000,
                end_ts: 1_718_400_300,
                message_rowids: vec![1, 2],
                message_count: 2,
            },
            text_embedding: None,
            image_embedding: None,
        }
    }

}

#[cfg(test)]
mod tests {
    use super::test_support::doc;
    use super::SearchIndex;

    #[test]
    fn test_initialize_idempotent() {
        let index = SearchIndex::open_in_memory().unwrap();
        index.initialize().unwrap();
        index.initialize().unwrap();
        index.health_check().unwrap();
    }

    #[test]
    fn test_index_and_get_round_trip() {
        let mut index = SearchIndex::open_in_memory().unwrap();
        index.initialize().unwrap();

        let mut d = doc("abc123", "dinner on friday at seven");
        d.text_embedding = Some(vec![0.5, 0.5, 0.0]);
        let written = index.index_documents(&[d]).unwrap();
        assert_eq!(written, vec!["abc123".to_string()]);

        assert!(index.document_exists("abc123").unwrap());
        let got = index.get_document("abc123").unwrap().unwrap();
        assert_eq!(got.text, "dinner on friday at seven");
        assert_eq!(got.participants, vec!["Alice", "Me"]);
        assert_eq!(got.message_rowids, vec![1, 2]);

        let stats = index.stats().unwrap();
        assert_eq!(stats.document_count, 1);
        assert!(stats.index_size_bytes > 0);
    }

    #[test]
    fn test_replace_by_id_keeps_one_copy() {
        let mut index = SearchIndex::open_in_memory().unwrap();
        index.initialize().unwrap();

        index.index_documents(&[doc("same", "first body")]).unwrap();
        index
            .index_documents(&[doc("same", "replacement body")])
            .unwrap();

        assert_eq!(index.stats().unwrap().document_count, 1);
        let got = index.get_document("same").unwrap().unwrap();
        assert_eq!(got.text, "replacement body");
    }

    #[test]
    fn test_clear_requires_reinitialize() {
        let mut index = SearchIndex::open_in_memory().unwrap();
        index.initialize().unwrap();
        index
            .index_documents(&[doc("a", "hello world wide")])
            .unwrap();

        index.clear().unwrap();
        assert!(index.stats().is_err());

        index.initialize().unwrap();
        assert_eq!(index.stats().unwrap().document_count, 0);
    }
}
