//! Ingestion pipeline stages
//!
//! Implements:
//! - Chunking of ordered messages into conversation segments (time gap,
//!   message count, and character budget limiters)
//! - Enrichment with sender, chat-kind, temporal, and attachment facets

mod chunker;
mod enricher;

pub use chunker::{chunk_messages, dedup_chunks, ChunkerConfig};
pub use enricher::{enrich_chunk, parse_chunk_line, ChunkLine};
