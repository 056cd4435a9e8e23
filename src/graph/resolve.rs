//! Fuzzy resolution of people and chats
//!
//! The chat ladder, in order: exact display-name match, exact alias
//! match, single substring display match, multi-match suggestions,
//! single substring alias match, alias-space suggestions. Suggestions
//! are ranked by edit distance and capped at five.

use levenshtein::levenshtein;

use super::{person_from_row, ChatEntry, ChatGraph, Person, MAX_SUGGESTIONS};
use super::{chat_from_row, CHAT_COLUMNS, PERSON_COLUMNS, PERSON_COLUMNS_P};
use crate::error::Result;

/// Outcome of a chat lookup
#[derive(Debug, Clone, Default)]
pub struct ChatResolution {
    pub found: Option<ChatEntry>,
    pub suggestions: Vec<String>,
}

/// Outcome of a person lookup
#[derive(Debug, Clone, Default)]
pub struct PersonResolution {
    pub found: Option<Person>,
    pub suggestions: Vec<String>,
}

impl ChatGraph {
    /// Resolve a person reference: handle first, then exact display
    /// name, then exact alias, then substring fallbacks.
    pub fn resolve_person(&self, query: &str) -> Result<PersonResolution> {
        let trimmed = query.trim();
        if trimmed.is_empty() {
            return Ok(PersonResolution::default());
        }

        if let Some(person) = self.person_by_handle(trimmed)? {
            return Ok(PersonResolution {
                found: Some(person),
                suggestions: vec![],
            });
        }

        let lower = trimmed.to_lowercase();

        if let Some(person) = self.person_by_exact_name(&lower)? {
            return Ok(PersonResolution {
                found: Some(person),
                suggestions: vec![],
            });
        }

        if let Some(person) = self.person_by_exact_alias(&lower)? {
            return Ok(PersonResolution {
                found: Some(person),
                suggestions: vec![],
            });
        }

        // Substring over display names
        let name_matches = self.persons_matching_name(&lower)?;
        match name_matches.len() {
            1 => {
                return Ok(PersonResolution {
                    found: Some(name_matches.into_iter().next().unwrap()),
                    suggestions: vec![],
                })
            }
            n if n > 1 => {
                return Ok(PersonResolution {
                    found: None,
                    suggestions: rank_suggestions(
                        &lower,
                        name_matches.into_iter().map(|p| p.display_name).collect(),
                    ),
                })
            }
            _ => {}
        }

        // Substring over aliases
        let alias_matches = self.persons_matching_alias(&lower)?;
        match alias_matches.len() {
            1 => Ok(PersonResolution {
                found: Some(alias_matches.into_iter().next().unwrap()),
                suggestions: vec![],
            }),
            0 => Ok(PersonResolution::default()),
            _ => Ok(PersonResolution {
                found: None,
                suggestions: rank_suggestions(
                    &lower,
                    alias_matches.into_iter().map(|p| p.display_name).collect(),
                ),
            }),
        }
    }

    /// Resolve a chat reference by display name or alias with fuzzy
    /// substring fallback.
    pub fn resolve_chat(&self, query: &str) -> Result<ChatResolution> {
        let trimmed = query.trim();
        if trimmed.is_empty() {
            return Ok(ChatResolution::default());
        }
        let lower = trimmed.to_lowercase();

        if let Some(chat) = self.chat_by_exact_name(&lower)? {
            return Ok(ChatResolution {
                found: Some(chat),
                suggestions: vec![],
            });
        }

        if let Some(chat) = self.chat_by_exact_alias(&lower)? {
            return Ok(ChatResolution {
                found: Some(chat),
                suggestions: vec![],
            });
        }

        let name_matches = self.chats_matching_name(&lower)?;
        match name_matches.len() {
            1 => {
                return Ok(ChatResolution {
                    found: Some(name_matches.into_iter().next().unwrap()),
                    suggestions: vec![],
                })
            }
            n if n > 1 => {
                let names = name_matches
                    .into_iter()
                    .filter_map(|c| c.display_name)
                    .collect();
                return Ok(ChatResolution {
                    found: None,
                    suggestions: rank_suggestions(&lower, names),
                });
            }
            _ => {}
        }

        let alias_matches = self.chats_matching_alias(&lower)?;
        match alias_matches.len() {
            1 => Ok(ChatResolution {
                found: Some(alias_matches.into_iter().next().unwrap().0),
                suggestions: vec![],
            }),
            0 => Ok(ChatResolution::default()),
            _ => {
                let names = alias_matches.into_iter().map(|(_, alias)| alias).collect();
                Ok(ChatResolution {
                    found: None,
                    suggestions: rank_suggestions(&lower, names),
                })
            }
        }
    }

    fn person_by_exact_name(&self, lower: &str) -> Result<Option<Person>> {
        use rusqlite::OptionalExtension;
        Ok(self
            .connection()
            .query_row(
                &format!(
                    "SELECT {} FROM persons WHERE LOWER(display_name) = ?1",
                    PERSON_COLUMNS
                ),
                [lower],
                person_from_row,
            )
            .optional()?)
    }

    fn person_by_exact_alias(&self, lower: &str) -> Result<Option<Person>> {
        use rusqlite::OptionalExtension;
        Ok(self
            .connection()
            .query_row(
                &format!(
                    "SELECT {} FROM persons p
                     JOIN aliases a ON a.person_id = p.id
                     WHERE a.alias_lower = ?1
                     LIMIT 1",
                    PERSON_COLUMNS_P
                ),
                [lower],
                person_from_row,
            )
            .optional()?)
    }

    fn persons_matching_name(&self, lower: &str) -> Result<Vec<Person>> {
        let mut stmt = self.connection().prepare(&format!(
            "SELECT {} FROM persons WHERE LOWER(display_name) LIKE '%' || ?1 || '%'
             ORDER BY display_name",
            PERSON_COLUMNS
        ))?;
        let rows = stmt.query_map([lower], person_from_row)?;
        Ok(rows.filter_map(|r| r.ok()).collect())
    }

    fn persons_matching_alias(&self, lower: &str) -> Result<Vec<Person>> {
        let mut stmt = self.connection().prepare(&format!(
            "SELECT DISTINCT {} FROM persons p
             JOIN aliases a ON a.person_id = p.id
             WHERE a.alias_lower LIKE '%' || ?1 || '%'
             ORDER BY p.display_name",
            PERSON_COLUMNS_P
        ))?;
        let rows = stmt.query_map([lower], person_from_row)?;
        Ok(rows.filter_map(|r| r.ok()).collect())
    }

    fn chat_by_exact_name(&self, lower: &str) -> Result<Option<ChatEntry>> {
        use rusqlite::OptionalExtension;
        Ok(self
            .connection()
            .query_row(
                &format!(
                    "SELECT {} FROM chats WHERE LOWER(display_name) = ?1",
                    CHAT_COLUMNS
                ),
                [lower],
                chat_from_row,
            )
            .optional()?)
    }

    fn chat_by_exact_alias(&self, lower: &str) -> Result<Option<ChatEntry>> {
        use rusqlite::OptionalExtension;
        Ok(self
            .connection()
            .query_row(
                "SELECT c.id, c.platform_id, c.display_name, c.is_group_chat, c.notes, c.auto_created
                 FROM chats c
                 JOIN chat_aliases a ON a.chat_id = c.id
                 WHERE a.alias_lower = ?1
                 LIMIT 1",
                [lower],
                chat_from_row,
            )
            .optional()?)
    }

    fn chats_matching_name(&self, lower: &str) -> Result<Vec<ChatEntry>> {
        let mut stmt = self.connection().prepare(&format!(
            "SELECT {} FROM chats WHERE LOWER(display_name) LIKE '%' || ?1 || '%'
             ORDER BY display_name",
            CHAT_COLUMNS
        ))?;
        let rows = stmt.query_map([lower], chat_from_row)?;
        Ok(rows.filter_map(|r| r.ok()).collect())
    }

    fn chats_matching_alias(&self, lower: &str) -> Result<Vec<(ChatEntry, String)>> {
        let mut stmt = self.connection().prepare(
            "SELECT c.id, c.platform_id, c.display_name, c.is_group_chat, c.notes, c.auto_created,
                    a.alias
             FROM chats c
             JOIN chat_aliases a ON a.chat_id = c.id
             WHERE a.alias_lower LIKE '%' || ?1 || '%'
             ORDER BY a.alias",
        )?;
        let rows = stmt.query_map([lower], |row| {
            let chat = chat_from_row(row)?;
            let alias: String = row.get(6)?;
            Ok((chat, alias))
        })?;
        Ok(rows.filter_map(|r| r.ok()).collect())
    }
}

/// Order candidates by edit distance to the query, capped
fn rank_suggestions(query: &str, mut candidates: Vec<String>) -> Vec<String> {
    candidates.sort_by_key(|c| levenshtein(query, &c.to_lowercase()));
    candidates.dedup();
    candidates.truncate(MAX_SUGGESTIONS);
    candidates
}

#[cfg(test)]
mod tests {
    use super::*;

    fn squad_graph() -> ChatGraph {
        let mut graph = ChatGraph::open_in_memory().unwrap();
        let chat = graph
            .resolve_or_create_chat("chat1", Some("Data Driven Squad"), true)
            .unwrap();
        graph.add_chat_alias(&chat.id, "DDS").unwrap();
        graph.add_chat_alias(&chat.id, "dds").unwrap();
        graph
            .resolve_or_create_chat("chat2", Some("Data Platform"), true)
            .unwrap();
        graph
    }

    #[test]
    fn test_resolve_chat_by_alias() {
        let graph = squad_graph();
        let resolution = graph.resolve_chat("dds").unwrap();
        assert!(resolution.found.is_some());
        assert_eq!(
            resolution.found.unwrap().display_name.as_deref(),
            Some("Data Driven Squad")
        );
    }

    #[test]
    fn test_resolve_chat_multiple_substring_gives_suggestions() {
        let graph = squad_graph();
        let resolution = graph.resolve_chat("Data").unwrap();
        assert!(resolution.found.is_none());
        assert!(!resolution.suggestions.is_empty());
        assert!(resolution.suggestions.len() <= MAX_SUGGESTIONS);
        assert!(resolution
            .suggestions
            .contains(&"Data Driven Squad".to_string()));
    }

    #[test]
    fn test_resolve_chat_unknown_is_empty() {
        let graph = squad_graph();
        let resolution = graph.resolve_chat("xyzno").unwrap();
        assert!(resolution.found.is_none());
        assert!(resolution.suggestions.is_empty());
    }

    #[test]
    fn test_resolve_chat_exact_display_name() {
        let graph = squad_graph();
        let resolution = graph.resolve_chat("data driven squad").unwrap();
        assert!(resolution.found.is_some());
    }

    #[test]
    fn test_resolve_chat_single_substring() {
        let graph = squad_graph();
        let resolution = graph.resolve_chat("Squad").unwrap();
        assert!(resolution.found.is_some());
        assert!(resolution.suggestions.is_empty());
    }

    #[test]
    fn test_resolve_person_ladder() {
        let mut graph = ChatGraph::open_in_memory().unwrap();
        let alice = graph.create_person("Alice Chen", false).unwrap();
        graph.add_handle(&alice.id, "+14155551234").unwrap();
        graph.add_alias(&alice.id, "Allie").unwrap();
        graph.create_person("Alicia Keys", false).unwrap();

        // Handle
        let by_handle = graph.resolve_person("415-555-1234").unwrap();
        assert_eq!(by_handle.found.unwrap().id, alice.id);

        // Exact display name
        let by_name = graph.resolve_person("alice chen").unwrap();
        assert_eq!(by_name.found.unwrap().id, alice.id);

        // Exact alias
        let by_alias = graph.resolve_person("allie").unwrap();
        assert_eq!(by_alias.found.unwrap().id, alice.id);

        // Ambiguous substring yields suggestions
        let ambiguous = graph.resolve_person("Alic").unwrap();
        assert!(ambiguous.found.is_none());
        assert_eq!(ambiguous.suggestions.len(), 2);

        // Unknown
        let unknown = graph.resolve_person("nobody").unwrap();
        assert!(unknown.found.is_none());
        assert!(unknown.suggestions.is_empty());
    }

    #[test]
    fn test_suggestions_ranked_by_distance() {
        let ranked = rank_suggestions(
            "data",
            vec!["Data Platform Working Group".to_string(), "Data".to_string()],
        );
        assert_eq!(ranked[0], "Data");
    }
}
