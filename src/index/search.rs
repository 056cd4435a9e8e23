//! Hybrid search over the index store
//!
//! Composes BM25 keyword scoring, cosine similarity over stored text
//! embeddings, structured filter clauses, must-not exclusions, and
//! additive term boosts into one ranked result list. BM25 scores from
//! FTS5 are negative-is-better and get normalized to (0, 1] so keyword
//! and cosine contributions are summable.

use std::collections::HashMap;

use rusqlite::Connection;

use super::{document_from_row, embedding_column, SearchIndex, DOC_COLUMNS};
use crate::embedding::cosine_similarity;
use crate::error::Result;
use crate::types::{
    EnrichedChunk, HybridSearchOptions, SearchBoosts, SearchExclusions, SearchFilters, SearchHit,
};

/// Candidate pool multiplier for vector scans
const CANDIDATE_FACTOR: usize = 10;

impl SearchIndex {
    /// Hybrid search: keyword + semantic + filters + exclusions + boosts.
    ///
    /// When a keyword query or a text embedding is present, a document
    /// must match at least one of them to appear; boosts alone never
    /// admit a document. Ties are broken by document id ascending so
    /// equal-score orderings are deterministic.
    pub fn hybrid_search(&self, opts: &HybridSearchOptions) -> Result<Vec<SearchHit>> {
        let limit = if opts.limit == 0 { 10 } else { opts.limit };
        let filter = FilterSql::build(&opts.filters, &opts.exclusions);
        let conn = self.connection();

        let mut scores: HashMap<String, f32> = HashMap::new();

        if let Some(query) = opts.keyword_query.as_deref().filter(|q| !q.trim().is_empty()) {
            for (id, score) in keyword_scores(conn, query, &filter, limit * CANDIDATE_FACTOR)? {
                *scores.entry(id).or_insert(0.0) += score;
            }
        }

        if let Some(embedding) = opts.text_embedding.as_deref() {
            for (id, score) in
                semantic_scores(conn, embedding, &filter, limit * CANDIDATE_FACTOR)?
            {
                *scores.entry(id).or_insert(0.0) += score;
            }
        }

        let has_should = opts.keyword_query.as_deref().is_some_and(|q| !q.trim().is_empty())
            || opts.text_embedding.is_some();

        let mut hits: Vec<SearchHit> = if has_should {
            let ids: Vec<&str> = scores.keys().map(|s| s.as_str()).collect();
            load_documents(conn, &ids)?
                .into_iter()
                .map(|doc| {
                    let base = scores.get(&doc.id).copied().unwrap_or(0.0);
                    let score = base + boost_score(&doc, &opts.boosts);
                    SearchHit {
                        id: doc.id.clone(),
                        score,
                        document: doc,
                    }
                })
                .collect()
        } else {
            // Metadata-only: every filter match qualifies, ranked by
            // boosts then recency-independent id order
            filtered_documents(conn, &filter, limit * CANDIDATE_FACTOR)?
                .into_iter()
                .map(|doc| SearchHit {
                    id: doc.id.clone(),
                    score: boost_score(&doc, &opts.boosts),
                    document: doc,
                })
                .collect()
        };

        sort_hits(&mut hits);
        hits.truncate(limit);
        Ok(hits)
    }

    /// Convenience wrapper: dense-vector search only
    pub fn semantic_search(
        &self,
        embedding: &[f32],
        limit: usize,
        filters: SearchFilters,
    ) -> Result<Vec<SearchHit>> {
        self.hybrid_search(&HybridSearchOptions {
            text_embedding: Some(embedding.to_vec()),
            filters,
            limit,
            ..Default::default()
        })
    }

    /// Convenience wrapper: BM25 only
    pub fn keyword_search(
        &self,
        query: &str,
        limit: usize,
        filters: SearchFilters,
    ) -> Result<Vec<SearchHit>> {
        self.hybrid_search(&HybridSearchOptions {
            keyword_query: Some(query.to_string()),
            filters,
            limit,
            ..Default::default()
        })
    }

    /// Dedicated kNN path over image embeddings.
    ///
    /// `has_image = true` is forced into the filter regardless of what
    /// the caller passes; the candidate pool is `10 * k` most recent
    /// matches.
    pub fn image_search(
        &self,
        vector: &[f32],
        limit: usize,
        mut filters: SearchFilters,
    ) -> Result<Vec<SearchHit>> {
        let limit = if limit == 0 { 10 } else { limit };
        filters.has_image = Some(true);
        let filter = FilterSql::build(&filters, &SearchExclusions::default());

        let sql = format!(
            "SELECT {}, d.image_embedding FROM documents d
             WHERE d.image_embedding IS NOT NULL{}
             ORDER BY d.start_ts DESC LIMIT ?",
            DOC_COLUMNS,
            filter.and_clause()
        );

        let conn = self.connection();
        let mut stmt = conn.prepare(&sql)?;
        let mut params = filter.params();
        let pool = (limit * CANDIDATE_FACTOR) as i64;
        params.push(Box::new(pool));
        let param_refs: Vec<&dyn rusqlite::ToSql> = params.iter().map(|b| b.as_ref()).collect();

        let rows = stmt.query_map(param_refs.as_slice(), |row| {
            let doc = document_from_row(row)?;
            let embedding = embedding_column(row, 20)?;
            Ok((doc, embedding))
        })?;

        let mut hits = Vec::new();
        for row in rows {
            let (doc, embedding) = row?;
            if let Some(embedding) = embedding {
                hits.push(SearchHit {
                    id: doc.id.clone(),
                    score: cosine_similarity(vector, &embedding),
                    document: doc,
                });
            }
        }

        sort_hits(&mut hits);
        hits.truncate(limit);
        Ok(hits)
    }
}

fn sort_hits(hits: &mut [SearchHit]) {
    hits.sort_by(|a, b| {
        b.score
            .partial_cmp(&a.score)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| a.id.cmp(&b.id))
    });
}

fn boost_score(doc: &EnrichedChunk, boosts: &SearchBoosts) -> f32 {
    let mut score = 0.0;
    if doc.sender_is_me {
        score += boosts.sender_is_me.unwrap_or(0.0);
    }
    if doc.is_group_chat {
        score += boosts.is_group_chat.unwrap_or(0.0);
    }
    if doc.is_dm {
        score += boosts.is_dm.unwrap_or(0.0);
    }
    score
}

fn keyword_scores(
    conn: &Connection,
    query: &str,
    filter: &FilterSql,
    pool: usize,
) -> Result<Vec<(String, f32)>> {
    let escaped = escape_fts_query(query);
    if escaped.is_empty() {
        return Ok(vec![]);
    }

    let sql = format!(
        "SELECT d.id, bm25(documents_fts) AS raw_score
         FROM documents_fts f
         JOIN documents d ON d.seq = f.rowid
         WHERE documents_fts MATCH ?{}
         ORDER BY bm25(documents_fts) LIMIT ?",
        filter.and_clause()
    );

    let mut stmt = conn.prepare(&sql)?;
    let mut params: Vec<Box<dyn rusqlite::ToSql>> = vec![Box::new(escaped)];
    params.extend(filter.params());
    params.push(Box::new(pool as i64));
    let param_refs: Vec<&dyn rusqlite::ToSql> = params.iter().map(|b| b.as_ref()).collect();

    let rows = stmt.query_map(param_refs.as_slice(), |row| {
        let id: String = row.get(0)?;
        let raw: f64 = row.get(1)?;
        Ok((id, raw))
    })?;

    // FTS5 bm25 is negative-is-better; normalize into (0, 1]
    let mut scored = Vec::new();
    for row in rows {
        let (id, raw) = row?;
        scored.push((id, 1.0 / (1.0 + raw.abs() as f32)));
    }
    Ok(scored)
}

fn semantic_scores(
    conn: &Connection,
    embedding: &[f32],
    filter: &FilterSql,
    pool: usize,
) -> Result<Vec<(String, f32)>> {
    let sql = format!(
        "SELECT d.id, d.text_embedding FROM documents d
         WHERE d.text_embedding IS NOT NULL{}
         ORDER BY d.start_ts DESC LIMIT ?",
        filter.and_clause()
    );

    let mut stmt = conn.prepare(&sql)?;
    let mut params = filter.params();
    params.push(Box::new(pool as i64));
    let param_refs: Vec<&dyn rusqlite::ToSql> = params.iter().map(|b| b.as_ref()).collect();

    let rows = stmt.query_map(param_refs.as_slice(), |row| {
        let id: String = row.get(0)?;
        let embedding = embedding_column(row, 1)?;
        Ok((id, embedding))
    })?;

    let mut scored = Vec::new();
    for row in rows {
        let (id, stored) = row?;
        if let Some(stored) = stored {
            scored.push((id, cosine_similarity(embedding, &stored)));
        }
    }
    Ok(scored)
}

fn load_documents(conn: &Connection, ids: &[&str]) -> Result<Vec<EnrichedChunk>> {
    if ids.is_empty() {
        return Ok(vec![]);
    }
    let placeholders: Vec<&str> = ids.iter().map(|_| "?").collect();
    let sql = format!(
        "SELECT {} FROM documents d WHERE d.id IN ({})",
        DOC_COLUMNS,
        placeholders.join(", ")
    );
    let mut stmt = conn.prepare(&sql)?;
    let params: Vec<&dyn rusqlite::ToSql> = ids.iter().map(|id| id as &dyn rusqlite::ToSql).collect();
    let rows = stmt.query_map(params.as_slice(), document_from_row)?;
    Ok(rows.filter_map(|r| r.ok()).collect())
}

fn filtered_documents(
    conn: &Connection,
    filter: &FilterSql,
    pool: usize,
) -> Result<Vec<EnrichedChunk>> {
    let sql = format!(
        "SELECT {} FROM documents d WHERE 1=1{}
         ORDER BY d.start_ts DESC LIMIT ?",
        DOC_COLUMNS,
        filter.and_clause()
    );
    let mut stmt = conn.prepare(&sql)?;
    let mut params = filter.params();
    params.push(Box::new(pool as i64));
    let param_refs: Vec<&dyn rusqlite::ToSql> = params.iter().map(|b| b.as_ref()).collect();
    let rows = stmt.query_map(param_refs.as_slice(), document_from_row)?;
    Ok(rows.filter_map(|r| r.ok()).collect())
}

/// Quote every token so user text can never break FTS5 query syntax
pub fn escape_fts_query(query: &str) -> String {
    query
        .split_whitespace()
        .map(|token| format!("\"{}\"", token.replace('"', "")))
        .filter(|t| t.len() > 2)
        .collect::<Vec<_>>()
        .join(" ")
}

/// Dynamic WHERE-clause builder over boxed parameters
struct FilterSql {
    clauses: Vec<String>,
    params: Vec<ParamValue>,
}

/// Cloneable parameter payloads for rebuilding boxed ToSql vectors
#[derive(Clone)]
enum ParamValue {
    Text(String),
    Int(i64),
}

impl FilterSql {
    fn build(filters: &SearchFilters, exclusions: &SearchExclusions) -> Self {
        let mut f = Self {
            clauses: Vec::new(),
            params: Vec::new(),
        };

        if let Some(sender) = &filters.sender {
            f.push("d.sender = ?", ParamValue::Text(sender.clone()));
        }
        if let Some(flag) = filters.sender_is_me {
            f.push("d.sender_is_me = ?", ParamValue::Int(flag as i64));
        }
        if let Some(participants) = &filters.participants {
            for name in participants {
                f.push(
                    "EXISTS (SELECT 1 FROM json_each(d.participants) WHERE json_each.value = ?)",
                    ParamValue::Text(name.clone()),
                );
            }
        }
        if let Some(chat_id) = &filters.chat_id {
            f.push("d.chat_id = ?", ParamValue::Text(chat_id.clone()));
        }
        if let Some(chat_name) = &filters.chat_name {
            f.push("d.chat_name = ?", ParamValue::Text(chat_name.clone()));
        }
        if let Some(flag) = filters.is_dm {
            f.push("d.is_dm = ?", ParamValue::Int(flag as i64));
        }
        if let Some(flag) = filters.is_group_chat {
            f.push("d.is_group_chat = ?", ParamValue::Int(flag as i64));
        }
        if let Some(year) = filters.year {
            f.push("d.year = ?", ParamValue::Int(year as i64));
        }
        if let Some(month) = filters.month {
            f.push("d.month = ?", ParamValue::Int(month as i64));
        }
        if let Some(months) = &filters.months {
            if !months.is_empty() {
                let placeholders: Vec<&str> = months.iter().map(|_| "?").collect();
                f.clauses
                    .push(format!("d.month IN ({})", placeholders.join(", ")));
                for month in months {
                    f.params.push(ParamValue::Int(*month as i64));
                }
            }
        }
        if let Some(day) = &filters.day_of_week {
            f.push("d.day_of_week = ?", ParamValue::Text(day.to_lowercase()));
        }
        if let Some(hour) = filters.hour_of_day_gte {
            f.push("d.hour_of_day >= ?", ParamValue::Int(hour as i64));
        }
        if let Some(hour) = filters.hour_of_day_lte {
            f.push("d.hour_of_day <= ?", ParamValue::Int(hour as i64));
        }
        if let Some(flag) = filters.has_image {
            f.push("d.has_image = ?", ParamValue::Int(flag as i64));
        }
        if let Some(ts) = filters.timestamp_gte {
            f.push("d.start_ts >= ?", ParamValue::Int(ts));
        }
        if let Some(ts) = filters.timestamp_lte {
            f.push("d.start_ts <= ?", ParamValue::Int(ts));
        }

        // must-not clauses
        if let Some(name) = &exclusions.is_dm_with {
            f.push(
                "NOT (d.is_dm = 1 AND EXISTS (SELECT 1 FROM json_each(d.participants) WHERE json_each.value = ?))",
                ParamValue::Text(name.clone()),
            );
        }
        if let Some(sender) = &exclusions.sender {
            f.push("d.sender != ?", ParamValue::Text(sender.clone()));
        }
        if let Some(chat_id) = &exclusions.chat_id {
            f.push("d.chat_id != ?", ParamValue::Text(chat_id.clone()));
        }

        f
    }

    fn push(&mut self, clause: &str, param: ParamValue) {
        self.clauses.push(clause.to_string());
        self.params.push(param);
    }

    /// ` AND c1 AND c2 …`, empty when no clauses
    fn and_clause(&self) -> String {
        if self.clauses.is_empty() {
            String::new()
        } else {
            format!(" AND {}", self.clauses.join(" AND "))
        }
    }

    /// Fresh boxed parameter vector (callable multiple times per search)
    fn params(&self) -> Vec<Box<dyn rusqlite::ToSql>> {
        self.params
            .iter()
            .map(|p| match p {
                ParamValue::Text(s) => Box::new(s.clone()) as Box<dyn rusqlite::ToSql>,
                ParamValue::Int(i) => Box::new(*i) as Box<dyn rusqlite::ToSql>,
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::super::test_support::doc;
    use super::*;

    fn seeded_index() -> SearchIndex {
        let mut index = SearchIndex::open_in_memory().unwrap();
        index.initialize().unwrap();

        let mut from_me = doc("aaa", "dinner plans for friday evening");
        from_me.chunk.sender = "Me".to_string();
        from_me.chunk.sender_is_me = true;

        let from_alice = doc("bbb", "dinner plans for friday evening");

        let mut group = doc("ccc", "weekend hiking trip photos");
        group.chunk.is_dm = false;
        group.chunk.is_group_chat = true;
        group.chunk.chat_name = Some("Trail Crew".to_string());
        group.chunk.participants = vec![
            "Alice".to_string(),
            "Bob".to_string(),
            "Me".to_string(),
        ];
        group.chunk.has_image = true;
        group.image_embedding = Some(vec![1.0, 0.0, 0.0]);

        let mut semantic = doc("ddd", "thinking about what to cook tonight");
        semantic.text_embedding = Some(vec![0.9, 0.1, 0.0]);

        index
            .index_documents(&[from_me, from_alice, group, semantic])
            .unwrap();
        index
    }

    #[test]
    fn test_keyword_search_matches() {
        let index = seeded_index();
        let hits = index
            .keyword_search("dinner friday", 10, SearchFilters::default())
            .unwrap();
        assert_eq!(hits.len(), 2);
        assert!(hits.iter().all(|h| h.document.text.contains("dinner")));
    }

    #[test]
    fn test_equal_scores_tie_break_by_id() {
        let index = seeded_index();
        let hits = index
            .keyword_search("dinner friday", 10, SearchFilters::default())
            .unwrap();
        // Identical text, identical score: id order decides
        assert_eq!(hits[0].id, "aaa");
        assert_eq!(hits[1].id, "bbb");
    }

    #[test]
    fn test_sender_is_me_boost_reorders() {
        let index = seeded_index();
        let hits = index
            .hybrid_search(&HybridSearchOptions {
                keyword_query: Some("dinner friday".to_string()),
                boosts: SearchBoosts {
                    sender_is_me: Some(2.0),
                    ..Default::default()
                },
                limit: 10,
                ..Default::default()
            })
            .unwrap();
        assert_eq!(hits[0].id, "aaa");
        assert!(hits[0].score > hits[1].score);
    }

    #[test]
    fn test_semantic_search_ranks_by_cosine() {
        let index = seeded_index();
        let hits = index
            .semantic_search(&[1.0, 0.0, 0.0], 10, SearchFilters::default())
            .unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].id, "ddd");
        assert!(hits[0].score > 0.9);
    }

    #[test]
    fn test_filters_restrict_matches() {
        let index = seeded_index();
        let hits = index
            .keyword_search(
                "dinner friday",
                10,
                SearchFilters {
                    sender: Some("Alice".to_string()),
                    ..Default::default()
                },
            )
            .unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].id, "bbb");
    }

    #[test]
    fn test_participant_filter_uses_membership() {
        let index = seeded_index();
        let hits = index
            .hybrid_search(&HybridSearchOptions {
                keyword_query: Some("hiking trip".to_string()),
                filters: SearchFilters {
                    participants: Some(vec!["Bob".to_string()]),
                    ..Default::default()
                },
                limit: 10,
                ..Default::default()
            })
            .unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].id, "ccc");
    }

    #[test]
    fn test_exclusion_is_dm_with() {
        let index = seeded_index();
        let hits = index
            .hybrid_search(&HybridSearchOptions {
                keyword_query: Some("dinner friday".to_string()),
                exclusions: SearchExclusions {
                    is_dm_with: Some("Alice".to_string()),
                    ..Default::default()
                },
                limit: 10,
                ..Default::default()
            })
            .unwrap();
        // Both dinner docs are DMs with Alice
        assert!(hits.is_empty());
    }

    #[test]
    fn test_metadata_only_search() {
        let index = seeded_index();
        let hits = index
            .hybrid_search(&HybridSearchOptions {
                filters: SearchFilters {
                    is_group_chat: Some(true),
                    ..Default::default()
                },
                limit: 10,
                ..Default::default()
            })
            .unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].id, "ccc");
    }

    #[test]
    fn test_image_search_forces_has_image() {
        let mut index = seeded_index();
        // A document with an image vector but has_image erroneously false
        let mut sneaky = doc("eee", "not really an image document");
        sneaky.image_embedding = Some(vec![1.0, 0.0, 0.0]);
        index.index_documents(&[sneaky]).unwrap();

        let hits = index
            .image_search(&[1.0, 0.0, 0.0], 10, SearchFilters::default())
            .unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].id, "ccc");
        assert!(hits[0].document.has_image);
    }

    #[test]
    fn test_hour_range_filter() {
        let index = seeded_index();
        let hits = index
            .hybrid_search(&HybridSearchOptions {
                keyword_query: Some("dinner friday".to_string()),
                filters: SearchFilters {
                    hour_of_day_gte: Some(9),
                    hour_of_day_lte: Some(11),
                    ..Default::default()
                },
                limit: 10,
                ..Default::default()
            })
            .unwrap();
        assert_eq!(hits.len(), 2);

        let none = index
            .hybrid_search(&HybridSearchOptions {
                keyword_query: Some("dinner friday".to_string()),
                filters: SearchFilters {
                    hour_of_day_gte: Some(20),
                    ..Default::default()
                },
                limit: 10,
                ..Default::default()
            })
            .unwrap();
        assert!(none.is_empty());
    }

    #[test]
    fn test_results_never_carry_vectors() {
        // SearchHit's document type has no embedding fields by
        // construction; assert the scored doc round-trips cleanly
        let index = seeded_index();
        let hits = index
            .semantic_search(&[1.0, 0.0, 0.0], 10, SearchFilters::default())
            .unwrap();
        let json = serde_json::to_value(&hits[0]).unwrap();
        assert!(json.get("document").unwrap().get("text_embedding").is_none());
    }

    #[test]
    fn test_escape_fts_query() {
        assert_eq!(escape_fts_query("dinner friday"), "\"dinner\" \"friday\"");
        assert_eq!(escape_fts_query("say \"hi\""), "\"say\" \"hi\"");
        assert_eq!(escape_fts_query("  "), "");
    }

    #[test]
    fn test_boosted_doc_without_match_is_absent() {
        let index = seeded_index();
        // "hiking" matches only ccc; the dinner docs must not appear
        // just because they'd earn a sender_is_me boost
        let hits = index
            .hybrid_search(&HybridSearchOptions {
                keyword_query: Some("hiking".to_string()),
                boosts: SearchBoosts {
                    sender_is_me: Some(5.0),
                    ..Default::default()
                },
                limit: 10,
                ..Default::default()
            })
            .unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].id, "ccc");
    }

    #[test]
    fn test_months_set_filter() {
        let index = seeded_index();
        let hits = index
            .hybrid_search(&HybridSearchOptions {
                keyword_query: Some("dinner friday".to_string()),
                filters: SearchFilters {
                    months: Some(vec![5, 6, 7]),
                    ..Default::default()
                },
                limit: 10,
                ..Default::default()
            })
            .unwrap();
        assert_eq!(hits.len(), 2);

        let none = index
            .hybrid_search(&HybridSearchOptions {
                keyword_query: Some("dinner friday".to_string()),
                filters: SearchFilters {
                    months: Some(vec![1, 2]),
                    ..Default::default()
                },
                limit: 10,
                ..Default::default()
            })
            .unwrap();
        assert!(none.is_empty());
    }

    #[test]
    fn test_timestamp_range_filter() {
        let index = seeded_index();
        // Seeded docs start at 1_718_400_000
        let hits = index
            .hybrid_search(&HybridSearchOptions {
                keyword_query: Some("dinner friday".to_string()),
                filters: SearchFilters {
                    timestamp_gte: Some(1_718_000_000),
                    timestamp_lte: Some(1_719_000_000),
                    ..Default::default()
                },
                limit: 10,
                ..Default::default()
            })
            .unwrap();
        assert_eq!(hits.len(), 2);

        let none = index
            .hybrid_search(&HybridSearchOptions {
                keyword_query: Some("dinner friday".to_string()),
                filters: SearchFilters {
                    timestamp_gte: Some(1_719_000_000),
                    ..Default::default()
                },
                limit: 10,
                ..Default::default()
            })
            .unwrap();
        assert!(none.is_empty());
    }
}
