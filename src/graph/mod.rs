//! Canonical chat/person graph
//!
//! Maps platform chat identifiers and correspondent handles to stable
//! internal identities: persons with handles, aliases, relationships and
//! attributes; chats with aliases and participants. Lookups that miss
//! can auto-create records (`auto_created = true`) so ingestion never
//! blocks on curation.

mod resolve;

pub use resolve::{ChatResolution, PersonResolution};

use std::path::Path;

use dashmap::DashMap;
use rusqlite::{params, Connection, OpenFlags, OptionalExtension};
use tracing::debug;
use uuid::Uuid;

use crate::contacts::normalize_handle;
use crate::error::{RecollectError, Result};
use crate::timeutil::now_unix;

/// Max suggestion strings returned by fuzzy resolution
pub const MAX_SUGGESTIONS: usize = 5;

/// A canonical person record
#[derive(Debug, Clone, PartialEq)]
pub struct Person {
    pub id: String,
    pub display_name: String,
    pub notes: Option<String>,
    pub is_owner: bool,
    pub auto_created: bool,
    pub created_at: i64,
    pub updated_at: i64,
}

/// Handle type, inferred from the raw form
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandleKind {
    Phone,
    Email,
    AppleId,
}

impl HandleKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            HandleKind::Phone => "phone",
            HandleKind::Email => "email",
            HandleKind::AppleId => "appleid",
        }
    }

    pub fn infer(raw: &str) -> Self {
        if raw.contains('@') {
            HandleKind::Email
        } else if raw.chars().any(|c| c.is_ascii_digit()) {
            HandleKind::Phone
        } else {
            HandleKind::AppleId
        }
    }
}

/// Closed set of relationship labels
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelationshipKind {
    Spouse,
    Partner,
    Parent,
    Child,
    Sibling,
    Friend,
    Coworker,
    Other,
}

impl RelationshipKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            RelationshipKind::Spouse => "spouse",
            RelationshipKind::Partner => "partner",
            RelationshipKind::Parent => "parent",
            RelationshipKind::Child => "child",
            RelationshipKind::Sibling => "sibling",
            RelationshipKind::Friend => "friend",
            RelationshipKind::Coworker => "coworker",
            RelationshipKind::Other => "other",
        }
    }
}

impl std::str::FromStr for RelationshipKind {
    type Err = RecollectError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "spouse" => Ok(RelationshipKind::Spouse),
            "partner" => Ok(RelationshipKind::Partner),
            "parent" => Ok(RelationshipKind::Parent),
            "child" => Ok(RelationshipKind::Child),
            "sibling" => Ok(RelationshipKind::Sibling),
            "friend" => Ok(RelationshipKind::Friend),
            "coworker" => Ok(RelationshipKind::Coworker),
            "other" => Ok(RelationshipKind::Other),
            _ => Err(RecollectError::InvalidInput(format!(
                "unknown relationship kind: {}",
                s
            ))),
        }
    }
}

/// A canonical chat record
#[derive(Debug, Clone, PartialEq)]
pub struct ChatEntry {
    pub id: String,
    pub platform_id: String,
    pub display_name: Option<String>,
    pub is_group_chat: bool,
    pub notes: Option<String>,
    pub auto_created: bool,
}

/// Chat/person graph over its own SQLite database
pub struct ChatGraph {
    conn: Connection,
    /// Hot-path map: platform chat id -> internal chat id
    chat_cache: DashMap<String, String>,
}

impl ChatGraph {
    /// Open (or create) the graph database
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

    /// In-memory graph for tests
    pub fn open_in_memory() -> Result<Self> {
        Self::from_connection(Connection::open_in_memory()?)
    }

    fn from_connection(conn: Connection) -> Result<Self> {
        conn.execute_batch(
            r#"
            PRAGMA journal_mode=WAL;
            PRAGMA synchronous=NORMAL;
            PRAGMA busy_timeout=30000;
            PRAGMA foreign_keys=ON;

            CREATE TABLE IF NOT EXISTS persons (
                id TEXT PRIMARY KEY,
                display_name TEXT NOT NULL,
                notes TEXT,
                is_owner INTEGER NOT NULL DEFAULT 0,
                auto_created INTEGER NOT NULL DEFAULT 0,
                created_at INTEGER NOT NULL,
                updated_at INTEGER NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_persons_owner ON persons(is_owner);

            CREATE TABLE IF NOT EXISTS handles (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                person_id TEXT NOT NULL REFERENCES persons(id) ON DELETE CASCADE,
                raw TEXT NOT NULL,
                normalized TEXT NOT NULL,
                kind TEXT NOT NULL
            );
            CREATE UNIQUE INDEX IF NOT EXISTS idx_handles_normalized ON handles(normalized);

            CREATE TABLE IF NOT EXISTS aliases (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                person_id TEXT NOT NULL REFERENCES persons(id) ON DELETE CASCADE,
                alias TEXT NOT NULL,
                alias_lower TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_aliases_lower ON aliases(alias_lower);

            CREATE TABLE IF NOT EXISTS relationships (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                from_person TEXT NOT NULL REFERENCES persons(id) ON DELETE CASCADE,
                to_person TEXT NOT NULL REFERENCES persons(id) ON DELETE CASCADE,
                kind TEXT NOT NULL,
                UNIQUE(from_person, to_person, kind)
            );

            CREATE TABLE IF NOT EXISTS person_attributes (
                person_id TEXT NOT NULL REFERENCES persons(id) ON DELETE CASCADE,
                attribute_key TEXT NOT NULL,
                attribute_value TEXT,
                UNIQUE(person_id, attribute_key)
            );

            CREATE TABLE IF NOT EXISTS chats (
                id TEXT PRIMARY KEY,
                platform_id TEXT NOT NULL UNIQUE,
                display_name TEXT,
                is_group_chat INTEGER NOT NULL DEFAULT 0,
                notes TEXT,
                auto_created INTEGER NOT NULL DEFAULT 0,
                created_at INTEGER NOT NULL,
                updated_at INTEGER NOT NULL
            );

            CREATE TABLE IF NOT EXISTS chat_aliases (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                chat_id TEXT NOT NULL REFERENCES chats(id) ON DELETE CASCADE,
                alias TEXT NOT NULL,
                alias_lower TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_chat_aliases_lower ON chat_aliases(alias_lower);

            CREATE TABLE IF NOT EXISTS chat_participants (
                chat_id TEXT NOT NULL REFERENCES chats(id) ON DELETE CASCADE,
                person_id TEXT NOT NULL REFERENCES persons(id) ON DELETE CASCADE,
                joined_at INTEGER,
                left_at INTEGER,
                UNIQUE(chat_id, person_id)
            );
            "#,
        )?;

        let graph = Self {
            conn,
            chat_cache: DashMap::new(),
        };
        graph.warm_chat_cache()?;
        Ok(graph)
    }

    fn warm_chat_cache(&self) -> Result<()> {
        let mut stmt = self.conn.prepare("SELECT platform_id, id FROM chats")?;
        let rows = stmt.query_map([], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
        })?;
        for row in rows {
            let (platform_id, id) = row?;
            self.chat_cache.insert(platform_id, id);
        }
        debug!(chats = self.chat_cache.len(), "warmed chat-id cache");
        Ok(())
    }

    // ---- persons -------------------------------------------------------

    /// Create a person record
    pub fn create_person(&self, display_name: &str, auto_created: bool) -> Result<Person> {
        let now = now_unix();
        let person = Person {
            id: Uuid::new_v4().to_string(),
            display_name: display_name.to_string(),
            notes: None,
            is_owner: false,
            auto_created,
            created_at: now,
            updated_at: now,
        };
        self.conn.execute(
            "INSERT INTO persons (id, display_name, is_owner, auto_created, created_at, updated_at)
             VALUES (?1, ?2, 0, ?3, ?4, ?4)",
            params![person.id, person.display_name, auto_created as i64, now],
        )?;
        Ok(person)
    }

    /// The unique owner record, creating it on first use
    pub fn ensure_owner(&self, display_name: &str) -> Result<Person> {
        if let Some(owner) = self.owner()? {
            return Ok(owner);
        }
        let now = now_unix();
        let id = Uuid::new_v4().to_string();
        self.conn.execute(
            "INSERT INTO persons (id, display_name, is_owner, auto_created, created_at, updated_at)
             VALUES (?1, ?2, 1, 0, ?3, ?3)",
            params![id, display_name, now],
        )?;
        self.person(&id)?
            .ok_or_else(|| RecollectError::Internal("owner row vanished".to_string()))
    }

    pub fn owner(&self) -> Result<Option<Person>> {
        Ok(self
            .conn
            .query_row(
                &format!("SELECT {} FROM persons WHERE is_owner = 1", PERSON_COLUMNS),
                [],
                person_from_row,
            )
            .optional()?)
    }

    pub fn person(&self, id: &str) -> Result<Option<Person>> {
        Ok(self
            .conn
            .query_row(
                &format!("SELECT {} FROM persons WHERE id = ?1", PERSON_COLUMNS),
                [id],
                person_from_row,
            )
            .optional()?)
    }

    /// Attach a handle to a person. The normalized form is unique across
    /// the whole graph: re-adding to the same person is a no-op, adding
    /// to a different person is an error.
    pub fn add_handle(&self, person_id: &str, raw: &str) -> Result<()> {
        let normalized = normalize_handle(raw);
        if normalized.is_empty() {
            return Err(RecollectError::InvalidInput(format!(
                "handle normalizes to nothing: {:?}",
                raw
            )));
        }

        let existing: Option<String> = self
            .conn
            .query_row(
                "SELECT person_id FROM handles WHERE normalized = ?1",
                [&normalized],
                |row| row.get(0),
            )
            .optional()?;
        match existing {
            Some(owner) if owner == person_id => return Ok(()),
            Some(owner) => {
                return Err(RecollectError::InvalidInput(format!(
                    "handle {} already belongs to person {}",
                    raw, owner
                )))
            }
            None => {}
        }

        self.conn.execute(
            "INSERT INTO handles (person_id, raw, normalized, kind) VALUES (?1, ?2, ?3, ?4)",
            params![person_id, raw, normalized, HandleKind::infer(raw).as_str()],
        )?;
        Ok(())
    }

    pub fn person_by_handle(&self, raw: &str) -> Result<Option<Person>> {
        let normalized = normalize_handle(raw);
        Ok(self
            .conn
            .query_row(
                &format!(
                    "SELECT {} FROM persons p
                     JOIN handles h ON h.person_id = p.id
                     WHERE h.normalized = ?1",
                    PERSON_COLUMNS_P
                ),
                [&normalized],
                person_from_row,
            )
            .optional()?)
    }

    /// Resolve by handle, or create an auto person carrying `display_name`
    /// and the handle in one transaction
    pub fn resolve_or_create_person(&mut self, raw: &str, display_name: &str) -> Result<Person> {
        if let Some(person) = self.person_by_handle(raw)? {
            return Ok(person);
        }

        let now = now_unix();
        let id = Uuid::new_v4().to_string();
        let normalized = normalize_handle(raw);
        let tx = self.conn.transaction()?;
        tx.execute(
            "INSERT INTO persons (id, display_name, is_owner, auto_created, created_at, updated_at)
             VALUES (?1, ?2, 0, 1, ?3, ?3)",
            params![id, display_name, now],
        )?;
        tx.execute(
            "INSERT INTO handles (person_id, raw, normalized, kind) VALUES (?1, ?2, ?3, ?4)",
            params![id, raw, normalized, HandleKind::infer(raw).as_str()],
        )?;
        tx.commit()?;

        self.person(&id)?
            .ok_or_else(|| RecollectError::Internal("person row vanished".to_string()))
    }

    pub fn add_alias(&self, person_id: &str, alias: &str) -> Result<()> {
        self.conn.execute(
            "INSERT INTO aliases (person_id, alias, alias_lower) VALUES (?1, ?2, ?3)",
            params![person_id, alias, alias.to_lowercase()],
        )?;
        Ok(())
    }

    pub fn set_attribute(&self, person_id: &str, key: &str, value: &str) -> Result<()> {
        self.conn.execute(
            "INSERT INTO person_attributes (person_id, attribute_key, attribute_value)
             VALUES (?1, ?2, ?3)
             ON CONFLICT(person_id, attribute_key) DO UPDATE SET attribute_value = excluded.attribute_value",
            params![person_id, key, value],
        )?;
        Ok(())
    }

    /// Directed labeled edge; duplicates on the (from, to, kind) triple
    /// are ignored
    pub fn add_relationship(
        &self,
        from_person: &str,
        to_person: &str,
        kind: RelationshipKind,
    ) -> Result<()> {
        self.conn.execute(
            "INSERT OR IGNORE INTO relationships (from_person, to_person, kind) VALUES (?1, ?2, ?3)",
            params![from_person, to_person, kind.as_str()],
        )?;
        Ok(())
    }

    /// Delete a person; handles, aliases, attributes, relationships, and
    /// chat participation cascade
    pub fn delete_person(&self, id: &str) -> Result<()> {
        let deleted = self
            .conn
            .execute("DELETE FROM persons WHERE id = ?1", [id])?;
        if deleted == 0 {
            return Err(RecollectError::NotFound(format!("person {}", id)));
        }
        Ok(())
    }

    // ---- chats ---------------------------------------------------------

    /// Internal chat id for a platform chat identifier (cache first)
    pub fn chat_id_for_platform(&self, platform_id: &str) -> Result<Option<String>> {
        if let Some(hit) = self.chat_cache.get(platform_id) {
            return Ok(Some(hit.value().clone()));
        }
        let id: Option<String> = self
            .conn
            .query_row(
                "SELECT id FROM chats WHERE platform_id = ?1",
                [platform_id],
                |row| row.get(0),
            )
            .optional()?;
        if let Some(id) = &id {
            self.chat_cache.insert(platform_id.to_string(), id.clone());
        }
        Ok(id)
    }

    pub fn chat(&self, id: &str) -> Result<Option<ChatEntry>> {
        Ok(self
            .conn
            .query_row(
                &format!("SELECT {} FROM chats WHERE id = ?1", CHAT_COLUMNS),
                [id],
                chat_from_row,
            )
            .optional()?)
    }

    /// Resolve a platform chat id, allocating an auto-created record (and
    /// an alias row for its display name) on miss
    pub fn resolve_or_create_chat(
        &mut self,
        platform_id: &str,
        display_name: Option<&str>,
        is_group_chat: bool,
    ) -> Result<ChatEntry> {
        if let Some(id) = self.chat_id_for_platform(platform_id)? {
            return self
                .chat(&id)?
                .ok_or_else(|| RecollectError::Internal("chat row vanished".to_string()));
        }

        let now = now_unix();
        let id = Uuid::new_v4().to_string();
        let tx = self.conn.transaction()?;
        tx.execute(
            "INSERT INTO chats (id, platform_id, display_name, is_group_chat, auto_created, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, 1, ?5, ?5)",
            params![id, platform_id, display_name, is_group_chat as i64, now],
        )?;
        if let Some(name) = display_name.filter(|n| !n.is_empty()) {
            tx.execute(
                "INSERT INTO chat_aliases (chat_id, alias, alias_lower) VALUES (?1, ?2, ?3)",
                params![id, name, name.to_lowercase()],
            )?;
        }
        tx.commit()?;

        self.chat_cache.insert(platform_id.to_string(), id.clone());
        self.chat(&id)?
            .ok_or_else(|| RecollectError::Internal("chat row vanished".to_string()))
    }

    pub fn add_chat_alias(&self, chat_id: &str, alias: &str) -> Result<()> {
        self.conn.execute(
            "INSERT INTO chat_aliases (chat_id, alias, alias_lower) VALUES (?1, ?2, ?3)",
            params![chat_id, alias, alias.to_lowercase()],
        )?;
        Ok(())
    }

    /// Idempotently record chat membership
    pub fn ensure_participants(&self, chat_id: &str, person_ids: &[String]) -> Result<()> {
        let now = now_unix();
        for person_id in person_ids {
            self.conn.execute(
                "INSERT OR IGNORE INTO chat_participants (chat_id, person_id, joined_at)
                 VALUES (?1, ?2, ?3)",
                params![chat_id, person_id, now],
            )?;
        }
        Ok(())
    }

    /// Present participants (null `left_at`) of a chat
    pub fn participants(&self, chat_id: &str) -> Result<Vec<Person>> {
        let mut stmt = self.conn.prepare(&format!(
            "SELECT {} FROM persons p
             JOIN chat_participants cp ON cp.person_id = p.id
             WHERE cp.chat_id = ?1 AND cp.left_at IS NULL
             ORDER BY p.display_name",
            PERSON_COLUMNS_P
        ))?;
        let rows = stmt.query_map([chat_id], person_from_row)?;
        Ok(rows.filter_map(|r| r.ok()).collect())
    }

    /// Delete a chat; aliases and participant rows cascade
    pub fn delete_chat(&self, id: &str) -> Result<()> {
        let platform_id: Option<String> = self
            .conn
            .query_row("SELECT platform_id FROM chats WHERE id = ?1", [id], |row| {
                row.get(0)
            })
            .optional()?;
        let deleted = self.conn.execute("DELETE FROM chats WHERE id = ?1", [id])?;
        if deleted == 0 {
            return Err(RecollectError::NotFound(format!("chat {}", id)));
        }
        if let Some(platform_id) = platform_id {
            self.chat_cache.remove(&platform_id);
        }
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

const PERSON_COLUMNS: &str =
    "id, display_name, notes, is_owner, auto_created, created_at, updated_at";
const PERSON_COLUMNS_P: &str =
    "p.id, p.display_name, p.notes, p.is_owner, p.auto_created, p.created_at, p.updated_at";
const CHAT_COLUMNS: &str = "id, platform_id, display_name, is_group_chat, notes, auto_created";

fn person_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Person> {
    Ok(Person {
        id: row.get(0)?,
        display_name: row.get(1)?,
        notes: row.get(2)?,
        is_owner: row.get::<_, i64>(3)? != 0,
        auto_created: row.get::<_, i64>(4)? != 0,
        created_at: row.get(5)?,
        updated_at: row.get(6)?,
    })
}

fn chat_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<ChatEntry> {
    Ok(ChatEntry {
        id: row.get(0)?,
        platform_id: row.get(1)?,
        display_name: row.get(2)?,
        is_group_chat: row.get::<_, i64>(3)? != 0,
        notes: row.get(4)?,
        auto_created: row.get::<_, i64>(5)? != 0,
    })
}
