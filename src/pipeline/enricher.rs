//! Chunk enrichment
//!
//! Derives the indexed facets from a chunk: primary sender, chat kind,
//! local-time temporal facets, and attachment flags. Chunk lines are
//! parsed once into a tagged record and all aggregation runs over those
//! records.

use std::collections::HashMap;

use chrono::{Datelike, Local, TimeZone, Timelike, Weekday};
use once_cell::sync::Lazy;
use regex::Regex;

use crate::types::{Chunk, EnrichedChunk};

/// One parsed `[sender HH:MM] text` line
#[derive(Debug, Clone, PartialEq)]
pub struct ChunkLine {
    pub sender: String,
    pub hour: u32,
    pub minute: u32,
    pub body: String,
}

static LINE_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^\[(.+) (\d{2}):(\d{2})\] (.*)$").expect("line regex"));

/// Parse a formatted chunk line; returns `None` for malformed lines
pub fn parse_chunk_line(line: &str) -> Option<ChunkLine> {
    let caps = LINE_RE.captures(line)?;
    Some(ChunkLine {
        sender: caps[1].to_string(),
        hour: caps[2].parse().ok()?,
        minute: caps[3].parse().ok()?,
        body: caps[4].to_string(),
    })
}

/// Derive the indexed facets for a chunk.
///
/// Temporal facets come from `start_ts` in the host's local zone; the
/// query side resolves its filters in the same zone.
pub fn enrich_chunk(chunk: &Chunk, has_attachment: bool, has_image: bool) -> EnrichedChunk {
    let lines: Vec<ChunkLine> = chunk
        .text
        .lines()
        .filter_map(parse_chunk_line)
        .collect();

    let (sender, sender_is_me) = primary_sender(&lines);

    let start = Local
        .timestamp_opt(chunk.start_ts, 0)
        .single()
        .unwrap_or_else(|| Local.timestamp_opt(0, 0).unwrap());

    EnrichedChunk {
        id: chunk.id.clone(),
        text: chunk.text.clone(),
        chat_id: chunk.chat_id.clone(),
        chat_name: chunk.group_name.clone(),
        sender,
        sender_is_me,
        participants: chunk.participants.clone(),
        participant_count: chunk.participants.len(),
        is_dm: !chunk.is_group_chat,
        is_group_chat: chunk.is_group_chat,
        year: start.year(),
        month: start.month(),
        day_of_week: weekday_name(start.weekday()).to_string(),
        hour_of_day: start.hour(),
        has_attachment,
        has_image,
        start_ts: chunk.start_ts,
        end_ts: chunk.end_ts,
        message_rowids: chunk.message_rowids.clone(),
        message_count: chunk.message_count,
    }
}

/// Most frequent non-owner sender by line count; the owner takes over
/// only when no one else spoke or when they hold a strict majority.
fn primary_sender(lines: &[ChunkLine]) -> (String, bool) {
    let mut counts: HashMap<&str, usize> = HashMap::new();
    let mut first_seen: Vec<&str> = Vec::new();
    for line in lines {
        let entry = counts.entry(line.sender.as_str()).or_insert(0);
        *entry += 1;
        if *entry == 1 {
            first_seen.push(line.sender.as_str());
        }
    }

    let total = lines.len();
    let owner_lines = counts.get("Me").copied().unwrap_or(0);
    if owner_lines * 2 > total {
        return ("Me".to_string(), true);
    }

    // Ties break toward the sender seen first, keeping output stable
    let mut top: Option<(&str, usize)> = None;
    for sender in first_seen.iter().filter(|s| **s != "Me") {
        let count = counts.get(sender).copied().unwrap_or(0);
        if top.is_none_or(|(_, best)| count > best) {
            top = Some((sender, count));
        }
    }

    match top {
        Some((name, _)) => (name.to_string(), false),
        None => ("Me".to_string(), true),
    }
}

fn weekday_name(weekday: Weekday) -> &'static str {
    match weekday {
        Weekday::Sun => "sunday",
        Weekday::Mon => "monday",
        Weekday::Tue => "tuesday",
        Weekday::Wed => "wednesday",
        Weekday::Thu => "thursday",
        Weekday::Fri => "friday",
        Weekday::Sat => "saturday",
    }
}
