//! Error types for Recollect

use thiserror::Error;

/// Result type alias for Recollect operations
pub type Result<T> = std::result::Result<T, RecollectError>;

/// Main error type for Recollect
#[derive(Error, Debug)]
pub enum RecollectError {
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("Search index unavailable: {0}")]
    IndexUnavailable(String),

    #[error("Message store unreadable: {0}")]
    MessageStoreUnreadable(String),

    #[error("Contact source missing: {0}")]
    ContactSourceMissing(String),

    #[error("Embedding error: {0}")]
    Embedding(String),

    #[error("Image embedding error: {0}")]
    ImageEmbed(String),

    #[error("Search error: {0}")]
    Search(String),

    #[error("Query parse error: {0}")]
    QueryParse(String),

    #[error("Timed out: {0}")]
    Timeout(String),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("HTTP request error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl RecollectError {
    /// Check if error is retryable (transient network / upstream failures)
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            RecollectError::Embedding(_) | RecollectError::Http(_) | RecollectError::Timeout(_)
        )
    }

    /// One-line operator guidance for fatal startup errors
    pub fn hint(&self) -> Option<&'static str> {
        match self {
            RecollectError::MessageStoreUnreadable(_) => Some(
                "grant Full Disk Access to your terminal in System Settings > Privacy & Security",
            ),
            RecollectError::IndexUnavailable(_) => {
                Some("check the index path is writable, or run `recollect index --full`")
            }
            _ => None,
        }
    }
}
