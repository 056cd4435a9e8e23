//! Query building and execution
//!
//! Turns a [`ParsedQuery`] into one (or, for wrap-around hour windows,
//! two) index-store searches: person and chat references resolve through
//! the chat graph first, temporal blocks resolve against the local
//! clock, and vector query kinds embed their query text before the
//! search runs.

use std::time::Duration;

use tracing::debug;

use super::temporal::resolve_temporal_filter;
use crate::embedding::TextEmbedder;
use crate::error::Result;
use crate::graph::ChatGraph;
use crate::index::SearchIndex;
use crate::timeutil::{format_date, format_time};
use crate::types::{
    HybridSearchOptions, ParsedQuery, QueryKind, SearchFilters, SearchHit,
};

/// Per-query wall-clock budget (network stages carry their own client
/// timeouts underneath this)
pub const QUERY_TIMEOUT: Duration = Duration::from_secs(45);

const DEFAULT_LIMIT: usize = 10;

/// Execute a parsed query end to end
pub fn execute_query(
    parsed: &ParsedQuery,
    index: &SearchIndex,
    graph: &ChatGraph,
    embedder: &dyn TextEmbedder,
    limit: usize,
) -> Result<Vec<SearchHit>> {
    let limit = if limit == 0 { DEFAULT_LIMIT } else { limit };

    let mut filters = merge_filters(&parsed.filters, resolve_temporal_filter(parsed.temporal.as_ref()));
    let mut exclusions = parsed.exclusions.clone();
    resolve_references(graph, &mut filters, &mut exclusions)?;

    if parsed.query_type == QueryKind::Image {
        // Image intent narrows to image-bearing chunks; the dedicated
        // image-vector path is for callers who already hold a vector
        filters.has_image = Some(true);
    }

    let keyword_query = match parsed.query_type {
        QueryKind::Keyword | QueryKind::Hybrid | QueryKind::Image => parsed
            .keyword_query
            .clone()
            .or_else(|| parsed.semantic_query.clone()),
        _ => None,
    };

    let text_embedding = match parsed.query_type {
        QueryKind::Semantic | QueryKind::Hybrid | QueryKind::Image => {
            let text = parsed
                .semantic_query
                .as_deref()
                .or(parsed.keyword_query.as_deref());
            match text {
                Some(text) if !text.trim().is_empty() => Some(embedder.embed(text)?),
                _ => None,
            }
        }
        _ => None,
    };

    let options = HybridSearchOptions {
        keyword_query,
        text_embedding,
        filters,
        exclusions,
        boosts: parsed.boosts.clone(),
        limit,
    };

    run_search(index, options, limit)
}

/// Run one search, splitting wrap-around hour windows into two queries
/// merged by score
fn run_search(
    index: &SearchIndex,
    options: HybridSearchOptions,
    limit: usize,
) -> Result<Vec<SearchHit>> {
    let wraps = matches!(
        (options.filters.hour_of_day_gte, options.filters.hour_of_day_lte),
        (Some(gte), Some(lte)) if gte > lte
    );
    if !wraps {
        return index.hybrid_search(&options);
    }

    debug!(
        gte = options.filters.hour_of_day_gte,
        lte = options.filters.hour_of_day_lte,
        "splitting wrap-around hour window"
    );

    let mut late = options.clone();
    late.filters.hour_of_day_lte = None;
    let mut early = options;
    early.filters.hour_of_day_gte = None;

    let mut merged = index.hybrid_search(&late)?;
    for hit in index.hybrid_search(&early)? {
        if !merged.iter().any(|h| h.id == hit.id) {
            merged.push(hit);
        }
    }
    merged.sort_by(|a, b| {
        b.score
            .partial_cmp(&a.score)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| a.id.cmp(&b.id))
    });
    merged.truncate(limit);
    Ok(merged)
}

/// Map person and chat references from the parser onto the names and
/// identifiers the index actually stores
fn resolve_references(
    graph: &ChatGraph,
    filters: &mut SearchFilters,
    exclusions: &mut crate::types::SearchExclusions,
) -> Result<()> {
    if let Some(sender) = filters.sender.take() {
        filters.sender = Some(resolve_person_name(graph, &sender)?);
    }
    if let Some(participants) = filters.participants.take() {
        let resolved: Result<Vec<String>> = participants
            .iter()
            .map(|p| resolve_person_name(graph, p))
            .collect();
        filters.participants = Some(resolved?);
    }
    if let Some(name) = exclusions.is_dm_with.take() {
        exclusions.is_dm_with = Some(resolve_person_name(graph, &name)?);
    }
    if let Some(sender) = exclusions.sender.take() {
        exclusions.sender = Some(resolve_person_name(graph, &sender)?);
    }

    if let Some(chat_name) = filters.chat_name.take() {
        let resolution = graph.resolve_chat(&chat_name)?;
        match resolution.found {
            Some(chat) => {
                // Prefer the precise platform identifier
                filters.chat_id = Some(chat.platform_id);
            }
            None => {
                debug!(query = %chat_name, suggestions = ?resolution.suggestions, "chat reference unresolved");
                filters.chat_name = Some(chat_name);
            }
        }
    }

    Ok(())
}

fn resolve_person_name(graph: &ChatGraph, reference: &str) -> Result<String> {
    let resolution = graph.resolve_person(reference)?;
    Ok(match resolution.found {
        Some(person) => person.display_name,
        None => reference.to_string(),
    })
}

fn merge_filters(base: &SearchFilters, temporal: SearchFilters) -> SearchFilters {
    let mut merged = base.clone();
    merged.timestamp_gte = temporal.timestamp_gte.or(merged.timestamp_gte);
    merged.timestamp_lte = temporal.timestamp_lte.or(merged.timestamp_lte);
    merged.year = temporal.year.or(merged.year);
    merged.month = temporal.month.or(merged.month);
    merged.months = temporal.months.or(merged.months);
    merged.day_of_week = temporal.day_of_week.or(merged.day_of_week);
    merged.hour_of_day_gte = temporal.hour_of_day_gte.or(merged.hour_of_day_gte);
    merged.hour_of_day_lte = temporal.hour_of_day_lte.or(merged.hour_of_day_lte);
    merged
}

/// Human-readable result block for the CLI
pub fn format_hits(hits: &[SearchHit]) -> String {
    if hits.is_empty() {
        return "No results.".to_string();
    }

    let mut out = String::new();
    for (i, hit) in hits.iter().enumerate() {
        let doc = &hit.document;
        let header = match &doc.chat_name {
            Some(name) => name.clone(),
            None => doc.participants.join(", "),
        };
        out.push_str(&format!(
            "{}. [{:.2}] {} — {} {}\n",
            i + 1,
            hit.score,
            header,
            format_date(doc.start_ts),
            format_time(doc.start_ts),
        ));
        for line in doc.text.lines() {
            out.push_str("   ");
            out.push_str(line);
            out.push('\n');
        }
        if i + 1 < hits.len() {
            out.push('\n');
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::embedding::HashingEmbedder;
    use crate::index::SearchIndex;
    use crate::types::{EnrichedChunk, IndexedDocument, SearchBoosts, TemporalExpr};

    fn doc(id: &str, text: &str, sender: &str, hour: u32) -> IndexedDocument {
        IndexedDocument {
            chunk: EnrichedChunk {
                id: id.to_string(),
                text: text.to_string(),
                chat_id: "chat1".to_string(),
                chat_name: None,
                sender: sender.to_string(),
                sender_is_me: sender == "Me",
                participants: vec![sender.to_string(), "Me".to_string()],
                participant_count: 2,
                is_dm: true,
                is_group_chat: false,
                year: 2024,
                month: 6,
                day_of_week: "saturday".to_string(),
                hour_of_day: hour,
                has_attachment: false,
                has_image: false,
                start_ts: 1_718_400_000 + hour as i64,
                end_ts: 1_718_400_300,
                message_rowids: vec![1],
                message_count: 1,
            },
            text_embedding: None,
            image_embedding: None,
        }
    }

    fn seeded() -> (SearchIndex, ChatGraph) {
        let mut index = SearchIndex::open_in_memory().unwrap();
        index.initialize().unwrap();
        index
            .index_documents(&[
                doc("aaa", "dinner plans tonight with everyone", "Alice Chen", 23),
                doc("bbb", "dinner plans tomorrow maybe", "Me", 2),
                doc("ccc", "dinner plans next month sometime", "Bob", 12),
            ])
            .unwrap();

        let mut graph = ChatGraph::open_in_memory().unwrap();
        let alice = graph.create_person("Alice Chen", false).unwrap();
        graph.add_handle(&alice.id, "+14155551234").unwrap();
        graph.add_alias(&alice.id, "Allie").unwrap();
        (index, graph)
    }

    fn keyword_parsed(q: &str) -> ParsedQuery {
        crate::query::QueryParser::keyword_fallback(q)
    }

    #[test]
    fn test_keyword_query_executes() {
        let (index, graph) = seeded();
        let parsed = keyword_parsed("dinner plans");
        let hits =
            execute_query(&parsed, &index, &graph, &HashingEmbedder::new(32), 10).unwrap();
        assert_eq!(hits.len(), 3);
    }

    #[test]
    fn test_sender_alias_resolves_through_graph() {
        let (index, graph) = seeded();
        let mut parsed = keyword_parsed("dinner plans");
        parsed.filters.sender = Some("Allie".to_string());

        let hits =
            execute_query(&parsed, &index, &graph, &HashingEmbedder::new(32), 10).unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].document.sender, "Alice Chen");
    }

    #[test]
    fn test_wraparound_hour_window_splits() {
        let (index, graph) = seeded();
        let mut parsed = keyword_parsed("dinner plans");
        parsed.temporal = Some(TemporalExpr {
            hour_gte: Some(22),
            hour_lte: Some(3),
            ..Default::default()
        });

        let hits =
            execute_query(&parsed, &index, &graph, &HashingEmbedder::new(32), 10).unwrap();
        // 23:00 and 02:00 match; 12:00 does not
        let ids: Vec<&str> = hits.iter().map(|h| h.id.as_str()).collect();
        assert!(ids.contains(&"aaa"));
        assert!(ids.contains(&"bbb"));
        assert!(!ids.contains(&"ccc"));
    }

    #[test]
    fn test_semantic_query_uses_embedder() {
        let mut index = SearchIndex::open_in_memory().unwrap();
        index.initialize().unwrap();
        let embedder = HashingEmbedder::new(32);
        let mut d = doc("aaa", "dinner plans tonight", "Alice Chen", 10);
        d.text_embedding = Some(embedder.embed("dinner plans tonight").unwrap());
        index.index_documents(&[d]).unwrap();
        let graph = ChatGraph::open_in_memory().unwrap();

        let mut parsed = keyword_parsed("");
        parsed.query_type = QueryKind::Semantic;
        parsed.semantic_query = Some("dinner plans".to_string());
        parsed.keyword_query = None;

        let hits = execute_query(&parsed, &index, &graph, &embedder, 10).unwrap();
        assert_eq!(hits.len(), 1);
        assert!(hits[0].score > 0.0);
    }

    #[test]
    fn test_boosts_carry_through() {
        let (index, graph) = seeded();
        let mut parsed = keyword_parsed("dinner plans");
        parsed.boosts = SearchBoosts {
            sender_is_me: Some(2.0),
            ..Default::default()
        };

        let hits =
            execute_query(&parsed, &index, &graph, &HashingEmbedder::new(32), 10).unwrap();
        assert_eq!(hits[0].id, "bbb");
    }

    #[test]
    fn test_format_hits_rounding_and_layout() {
        let (index, graph) = seeded();
        let parsed = keyword_parsed("dinner plans");
        let hits =
            execute_query(&parsed, &index, &graph, &HashingEmbedder::new(32), 2).unwrap();

        let formatted = format_hits(&hits);
        assert!(formatted.starts_with("1. ["));
        assert!(formatted.contains("Alice Chen, Me"));
        // Two-decimal score
        let bracket = formatted.split('[').nth(1).unwrap();
        let score_text = bracket.split(']').next().unwrap();
        assert_eq!(score_text.split('.').nth(1).unwrap().len(), 2);

        assert_eq!(format_hits(&[]), "No results.");
    }
}
