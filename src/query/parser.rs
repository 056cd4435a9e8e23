//! Natural-language query parsing
//!
//! Hands the raw request to a language model (temperature 0, JSON
//! output) and deserializes the reply into a [`ParsedQuery`]. Any
//! transport or shape failure falls back to a keyword-only query over
//! the raw string, so search always degrades instead of erroring.

use std::time::Duration;

use tracing::{debug, warn};

use crate::error::{RecollectError, Result};
use crate::types::{AppConfig, ParsedQuery, QueryKind};

const SYSTEM_PROMPT: &str = r#"You translate natural-language questions about a personal chat history into a JSON search intent. Respond with a single JSON object and nothing else.

Fields:
- query_type: one of "semantic", "keyword", "hybrid", "image", "metadata_only"
- semantic_query: rephrased topical query for embedding search (optional)
- keyword_query: literal terms worth matching exactly (optional)
- filters: object; any of sender, participants (array), is_dm, is_group_chat, has_image, chat_name
- exclusions: object; any of is_dm_with, sender, chat_id
- boosts: object; any of sender_is_me, is_group_chat, is_dm (numbers)
- temporal: object; either relative (today|yesterday|this_week|last_week|this_month|last_month|this_year|last_year) or date_gte/date_lte (ISO dates), plus optional year, month, months (array), day_of_week, hour_gte, hour_lte
- reasoning: one short sentence on why you chose this structure

Use people's names exactly as written in the question. Prefer "hybrid" unless the question is clearly topical (semantic) or clearly literal (keyword). Use "image" when the question asks about photos or pictures."#;

/// Stateless parser over an LLM endpoint
pub struct QueryParser {
    client: reqwest::Client,
    api_key: Option<String>,
    model: String,
}

impl QueryParser {
    pub fn new(config: &AppConfig) -> Self {
        Self {
            client: reqwest::Client::builder()
                .timeout(Duration::from_secs(20))
                .build()
                .unwrap_or_default(),
            api_key: config.openai_api_key.clone(),
            model: config.query_model.clone(),
        }
    }

    /// Parse a request into structured intent.
    ///
    /// Never fails: parse trouble of any kind degrades to a
    /// keyword-only query over the raw string.
    pub async fn parse(&self, query: &str) -> ParsedQuery {
        match self.parse_with_model(query).await {
            Ok(parsed) => parsed,
            Err(e) => {
                warn!(error = %e, "query parse failed; falling back to keyword search");
                Self::keyword_fallback(query)
            }
        }
    }

    async fn parse_with_model(&self, query: &str) -> Result<ParsedQuery> {
        let api_key = self.api_key.as_ref().ok_or_else(|| {
            RecollectError::QueryParse("no language-model credentials configured".to_string())
        })?;

        let response = self
            .client
            .post("https://api.openai.com/v1/chat/completions")
            .header("Authorization", format!("Bearer {}", api_key))
            .json(&serde_json::json!({
                "model": self.model,
                "temperature": 0,
                "response_format": {"type": "json_object"},
                "messages": [
                    {"role": "system", "content": SYSTEM_PROMPT},
                    {"role": "user", "content": query},
                ],
            }))
            .send()
            .await
            .map_err(map_transport_error)?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(RecollectError::QueryParse(format!(
                "model API error {}: {}",
                status, body
            )));
        }

        let reply: serde_json::Value = response.json().await.map_err(map_transport_error)?;
        let content = reply["choices"][0]["message"]["content"]
            .as_str()
            .ok_or_else(|| RecollectError::QueryParse("empty model reply".to_string()))?;

        let parsed: ParsedQuery = serde_json::from_str(content)
            .map_err(|e| RecollectError::QueryParse(format!("malformed intent JSON: {}", e)))?;

        debug!(query_type = ?parsed.query_type, reasoning = %parsed.reasoning, "parsed query");
        Ok(parsed)
    }

    /// Keyword-only intent over the raw string
    pub fn keyword_fallback(query: &str) -> ParsedQuery {
        ParsedQuery {
            query_type: QueryKind::Keyword,
            keyword_query: Some(query.to_string()),
            reasoning: "fallback: keyword search over the raw query".to_string(),
            ..Default::default()
        }
    }
}

fn map_transport_error(e: reqwest::Error) -> RecollectError {
    if e.is_timeout() {
        RecollectError::Timeout(format!("query parse: {}", e))
    } else {
        RecollectError::Http(e)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_keyword_fallback_shape() {
        let parsed = QueryParser::keyword_fallback("dinner with alice last week");
        assert_eq!(parsed.query_type, QueryKind::Keyword);
        assert_eq!(
            parsed.keyword_query.as_deref(),
            Some("dinner with alice last week")
        );
        assert!(parsed.semantic_query.is_none());
        assert!(parsed.temporal.is_none());
    }

    #[tokio::test]
    async fn test_parse_without_credentials_falls_back() {
        let config = AppConfig::from_map(&HashMap::new());
        let parser = QueryParser::new(&config);
        let parsed = parser.parse("photos from mom this month").await;
        assert_eq!(parsed.query_type, QueryKind::Keyword);
        assert_eq!(
            parsed.keyword_query.as_deref(),
            Some("photos from mom this month")
        );
    }

    #[test]
    fn test_model_intent_json_round_trip() {
        // The exact shape the system prompt asks the model to emit
        let content = r#"{
            "query_type": "hybrid",
            "semantic_query": "plans for dinner",
            "keyword_query": "dinner",
            "filters": {"sender": "Alice", "is_dm": true},
            "boosts": {"sender_is_me": 2.0},
            "temporal": {"relative": "last_week"},
            "reasoning": "topical question scoped to one sender"
        }"#;
        let parsed: ParsedQuery = serde_json::from_str(content).unwrap();
        assert_eq!(parsed.query_type, QueryKind::Hybrid);
        assert_eq!(parsed.filters.sender.as_deref(), Some("Alice"));
        assert_eq!(parsed.filters.is_dm, Some(true));
        assert_eq!(parsed.boosts.sender_is_me, Some(2.0));
        assert!(parsed.temporal.is_some());
    }
}
