//! Core types for Recollect

use std::collections::HashMap;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// ROWID into the platform message table
pub type MessageRowId = i64;

/// A message row streamed out of the platform store.
///
/// `text` is always non-empty: rows whose plain-text column is empty are
/// only emitted when text could be recovered from the attributed-body blob.
#[derive(Debug, Clone)]
pub struct RawMessage {
    pub rowid: MessageRowId,
    pub text: String,
    /// Unix seconds
    pub timestamp: i64,
    pub is_from_me: bool,
    /// Phone number or email of the correspondent, absent for some system rows
    pub handle: Option<String>,
    /// Platform chat identifier (e.g. `chat123…` or a bare handle for DMs)
    pub chat_id: String,
    /// Group display name, when the chat has one
    pub group_name: Option<String>,
    pub service: String,
}

/// An attachment row associated with a message.
#[derive(Debug, Clone)]
pub struct AttachmentRow {
    pub rowid: i64,
    pub guid: String,
    /// Absolute path with leading `~` expanded
    pub path: PathBuf,
    pub mime_type: String,
    pub is_image: bool,
    pub message_rowid: MessageRowId,
    pub chat_id: String,
    /// Unix seconds
    pub created_at: i64,
    pub transfer_name: String,
    pub total_bytes: i64,
}

/// A content-addressed conversation segment.
///
/// `id` is the SHA-256 hex digest of `text`, so identical formatted text
/// always produces the identical chunk across runs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Chunk {
    pub id: String,
    /// One `[sender HH:MM] text` line per message, newline-joined
    pub text: String,
    pub start_ts: i64,
    pub end_ts: i64,
    /// Distinct resolved display names; the owner appears as "Me"
    pub participants: Vec<String>,
    pub chat_id: String,
    pub group_name: Option<String>,
    pub is_group_chat: bool,
    pub message_rowids: Vec<MessageRowId>,
    pub message_count: usize,
}

/// A chunk with every derived facet the index stores.
///
/// Exactly one of `is_dm` / `is_group_chat` is true.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EnrichedChunk {
    pub id: String,
    pub text: String,
    pub chat_id: String,
    pub chat_name: Option<String>,
    /// Primary sender: most frequent non-owner, owner only on majority
    pub sender: String,
    pub sender_is_me: bool,
    pub participants: Vec<String>,
    pub participant_count: usize,
    pub is_dm: bool,
    pub is_group_chat: bool,
    pub year: i32,
    /// 1..=12
    pub month: u32,
    /// lowercase weekday name, sunday..saturday
    pub day_of_week: String,
    /// 0..=23
    pub hour_of_day: u32,
    pub has_attachment: bool,
    pub has_image: bool,
    pub start_ts: i64,
    pub end_ts: i64,
    pub message_rowids: Vec<MessageRowId>,
    pub message_count: usize,
}

/// A document as written to the search index: an enriched chunk plus its
/// optional dense vectors. Vectors never come back out of search results.
#[derive(Debug, Clone)]
pub struct IndexedDocument {
    pub chunk: EnrichedChunk,
    pub text_embedding: Option<Vec<f32>>,
    pub image_embedding: Option<Vec<f32>>,
}

/// A scored search result without vectors
#[derive(Debug, Clone, Serialize)]
pub struct SearchHit {
    pub id: String,
    pub score: f32,
    pub document: EnrichedChunk,
}

/// Structured filter clauses understood by the index store
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct SearchFilters {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sender: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sender_is_me: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub participants: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub chat_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub chat_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub is_dm: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub is_group_chat: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub year: Option<i32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub month: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub months: Option<Vec<u32>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub day_of_week: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub hour_of_day_gte: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub hour_of_day_lte: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub has_image: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timestamp_gte: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timestamp_lte: Option<i64>,
}

/// Must-not clauses
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct SearchExclusions {
    /// Exclude direct conversations with this participant
    #[serde(skip_serializing_if = "Option::is_none")]
    pub is_dm_with: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sender: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub chat_id: Option<String>,
}

impl SearchExclusions {
    pub fn is_empty(&self) -> bool {
        self.is_dm_with.is_none() && self.sender.is_none() && self.chat_id.is_none()
    }
}

/// Additive score boosts attached to matching terms
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct SearchBoosts {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sender_is_me: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub is_group_chat: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub is_dm: Option<f32>,
}

/// Options for a single hybrid search against the index store
#[derive(Debug, Clone, Default)]
pub struct HybridSearchOptions {
    pub keyword_query: Option<String>,
    pub text_embedding: Option<Vec<f32>>,
    pub filters: SearchFilters,
    pub exclusions: SearchExclusions,
    pub boosts: SearchBoosts,
    pub limit: usize,
}

/// Kind of retrieval a parsed query asks for
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum QueryKind {
    Semantic,
    Keyword,
    #[default]
    Hybrid,
    Image,
    MetadataOnly,
}

/// Relative temporal tokens the query parser may emit
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RelativePeriod {
    Today,
    Yesterday,
    ThisWeek,
    LastWeek,
    ThisMonth,
    LastMonth,
    ThisYear,
    LastYear,
}

/// Temporal block of a parsed query: either a relative token resolved
/// against the current local time, or explicit ISO date bounds.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct TemporalExpr {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub relative: Option<RelativePeriod>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub date_gte: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub date_lte: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub year: Option<i32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub month: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub months: Option<Vec<u32>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub day_of_week: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub hour_gte: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub hour_lte: Option<u32>,
}

/// Structured intent produced by the natural-language query parser
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ParsedQuery {
    #[serde(default)]
    pub query_type: QueryKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub semantic_query: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub keyword_query: Option<String>,
    #[serde(default)]
    pub filters: SearchFilters,
    #[serde(default)]
    pub exclusions: SearchExclusions,
    #[serde(default)]
    pub boosts: SearchBoosts,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temporal: Option<TemporalExpr>,
    #[serde(default)]
    pub reasoning: String,
}

/// Aggregate counts over the search index
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IndexStats {
    pub document_count: i64,
    pub index_size_bytes: i64,
}

/// Shape of the message corpus, for status and verification
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessageStats {
    pub total_messages: i64,
    pub min_rowid: i64,
    pub max_rowid: i64,
    /// Unix seconds, 0 when the store is empty
    pub oldest_date: i64,
    pub newest_date: i64,
}

/// Status block printed by `recollect status`
#[derive(Debug, Clone, Serialize)]
pub struct IndexerStatus {
    pub last_message_rowid: i64,
    pub last_indexed_at: Option<i64>,
    pub total_messages_indexed: i64,
    pub total_chunks_created: i64,
    pub index_stats: IndexStats,
    pub message_stats: MessageStats,
    pub pending_messages: i64,
}

/// Persisted indexing cursor + counters (row id=1 in the state store)
#[derive(Debug, Clone, Default, PartialEq)]
pub struct IndexingState {
    pub last_message_rowid: i64,
    pub last_indexed_at: Option<i64>,
    pub total_messages_indexed: i64,
    pub total_chunks_created: i64,
}

/// Partial update to the indexing state; `None` fields are left untouched
#[derive(Debug, Clone, Default)]
pub struct StateUpdate {
    pub last_message_rowid: Option<i64>,
    pub last_indexed_at: Option<i64>,
    pub total_messages_indexed: Option<i64>,
    pub total_chunks_created: Option<i64>,
}

/// One indexed-chunk record in the state store
#[derive(Debug, Clone)]
pub struct ChunkRecord {
    pub chunk_hash: String,
    pub message_rowids: Vec<MessageRowId>,
    pub document_id: String,
    /// Unix seconds
    pub created_at: i64,
}

/// Process configuration, resolved from environment variables with
/// platform defaults. All paths are tilde-expanded.
#[derive(Debug, Clone)]
pub struct AppConfig {
    /// Platform message store (default `~/Library/Messages/chat.db`)
    pub chat_db_path: PathBuf,
    /// Address-book base directory; `None` uses the platform default
    pub address_book_root: Option<PathBuf>,
    /// Search index database
    pub index_db_path: PathBuf,
    /// Indexing-state database
    pub state_db_path: PathBuf,
    /// Chat-graph database
    pub graph_db_path: PathBuf,
    /// Text embedding + query parsing credentials
    pub openai_api_key: Option<String>,
    pub embedding_model: String,
    pub query_model: String,
    /// CLIP image-tower ONNX file; image vectors are skipped when absent
    pub vision_model_path: Option<PathBuf>,
}

impl AppConfig {
    /// Resolve configuration from the environment.
    ///
    /// `RECOLLECT_CHAT_DB` overrides the message-store path and
    /// `RECOLLECT_DATA_DIR` relocates the writable databases.
    pub fn from_env() -> Self {
        let env: HashMap<String, String> = std::env::vars().collect();
        Self::from_map(&env)
    }

    /// Resolve configuration from an explicit variable map (testable form)
    pub fn from_map(env: &HashMap<String, String>) -> Self {
        let home = dirs::home_dir().unwrap_or_else(|| PathBuf::from("/"));

        let chat_db_path = env
            .get("RECOLLECT_CHAT_DB")
            .map(|p| PathBuf::from(shellexpand::tilde(p).to_string()))
            .unwrap_or_else(|| home.join("Library/Messages/chat.db"));

        let data_dir = env
            .get("RECOLLECT_DATA_DIR")
            .map(|p| PathBuf::from(shellexpand::tilde(p).to_string()))
            .unwrap_or_else(|| {
                dirs::data_local_dir()
                    .unwrap_or_else(|| home.join(".local/share"))
                    .join("recollect")
            });

        Self {
            chat_db_path,
            address_book_root: env
                .get("RECOLLECT_ADDRESS_BOOK")
                .map(|p| PathBuf::from(shellexpand::tilde(p).to_string())),
            index_db_path: env
                .get("RECOLLECT_INDEX_DB")
                .map(|p| PathBuf::from(shellexpand::tilde(p).to_string()))
                .unwrap_or_else(|| data_dir.join("index.db")),
            state_db_path: data_dir.join("state.db"),
            graph_db_path: data_dir.join("graph.db"),
            openai_api_key: env.get("OPENAI_API_KEY").cloned(),
            embedding_model: env
                .get("RECOLLECT_EMBEDDING_MODEL")
                .cloned()
                .unwrap_or_else(|| "text-embedding-3-small".to_string()),
            query_model: env
                .get("RECOLLECT_QUERY_MODEL")
                .cloned()
                .unwrap_or_else(|| "gpt-4o-mini".to_string()),
            vision_model_path: env
                .get("RECOLLECT_VISION_MODEL")
                .map(|p| PathBuf::from(shellexpand::tilde(p).to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_overrides() {
        let mut env = HashMap::new();
        env.insert("RECOLLECT_CHAT_DB".to_string(), "/tmp/chat.db".to_string());
        env.insert("RECOLLECT_DATA_DIR".to_string(), "/tmp/rc".to_string());

        let config = AppConfig::from_map(&env);
        assert_eq!(config.chat_db_path, PathBuf::from("/tmp/chat.db"));
        assert_eq!(config.index_db_path, PathBuf::from("/tmp/rc/index.db"));
        assert_eq!(config.state_db_path, PathBuf::from("/tmp/rc/state.db"));
    }

    #[test]
    fn test_parsed_query_deserializes_sparse_json() {
        let parsed: ParsedQuery = serde_json::from_str(
            r#"{"query_type": "semantic", "semantic_query": "dinner plans", "reasoning": "topic search"}"#,
        )
        .unwrap();
        assert_eq!(parsed.query_type, QueryKind::Semantic);
        assert_eq!(parsed.semantic_query.as_deref(), Some("dinner plans"));
        assert!(parsed.filters.sender.is_none());
        assert!(parsed.temporal.is_none());
    }

    #[test]
    fn test_relative_period_tokens() {
        let t: TemporalExpr = serde_json::from_str(r#"{"relative": "last_month"}"#).unwrap();
        assert_eq!(t.relative, Some(RelativePeriod::LastMonth));
    }
}
