//! Recollect - local chat-history search
//!
//! Builds and maintains a searchable index over the macOS Messages
//! database with hybrid keyword (BM25), semantic-vector, and image-vector
//! retrieval over enriched conversation chunks.

pub mod contacts;
pub mod embedding;
pub mod error;
pub mod graph;
pub mod hash;
pub mod index;
pub mod indexer;
pub mod pipeline;
pub mod query;
pub mod reader;
pub mod state;
pub mod timeutil;
pub mod types;

pub use error::{RecollectError, Result};
pub use index::SearchIndex;
pub use types::*;

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
