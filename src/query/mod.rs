//! Natural-language query handling
//!
//! Implements:
//! - LLM-backed parsing of a request into structured intent
//! - Relative-date resolution against the local clock
//! - Composition of the structured intent into index-store searches
//!   with person/chat resolution and result formatting

mod builder;
mod parser;
mod temporal;

pub use builder::{execute_query, format_hits, QUERY_TIMEOUT};
pub use parser::QueryParser;
pub use temporal::{resolve_temporal_filter, resolve_temporal_filter_at};
