//! Read-only iterator over the platform message database
//!
//! Pagination is by `message.ROWID` strictly greater than the caller's
//! cursor. ROWID order is the correctness contract here: row ids and
//! message dates are imperfectly correlated, and a date-ordered cursor
//! can jump past unindexed rows whose ids sort below it.

use std::path::Path;

use rusqlite::{Connection, OpenFlags};
use tracing::debug;

use crate::error::{RecollectError, Result};
use crate::timeutil::apple_ns_to_unix;
use crate::types::{MessageStats, RawMessage};

/// Rows qualify when the text column is usable or the attributed-body
/// blob is big enough to plausibly hold a string payload.
const ROW_PREDICATE: &str = "((m.text IS NOT NULL AND m.text != '')
     OR (m.attributedBody IS NOT NULL AND length(m.attributedBody) > 10))";

/// Read-only handle to the platform message store
#[derive(Debug)]
pub struct MessageReader {
    conn: Connection,
}

impl MessageReader {
    /// Open the message database read-only.
    ///
    /// Failure is fatal for indexing and carries one-line operator
    /// guidance (the usual cause is missing Full Disk Access).
    pub fn open(path: &Path) -> Result<Self> {
        let flags = OpenFlags::SQLITE_OPEN_READ_ONLY | OpenFlags::SQLITE_OPEN_NO_MUTEX;
        let conn = Connection::open_with_flags(path, flags).map_err(|e| {
            RecollectError::MessageStoreUnreadable(format!("{}: {}", path.display(), e))
        })?;
        debug!(path = %path.display(), "opened message store");
        Ok(Self { conn })
    }

    /// Stream messages with `ROWID > since_rowid`, ascending, up to
    /// `limit` rows (`None` reads to the end of the table).
    ///
    /// Rows whose plain text is empty and whose attributed body yields
    /// nothing are dropped.
    pub fn read_messages(
        &self,
        since_rowid: i64,
        limit: Option<usize>,
    ) -> Result<Vec<RawMessage>> {
        let sql = format!(
            "SELECT m.ROWID, m.text, m.attributedBody, m.date, m.is_from_me,
                    h.id, c.chat_identifier, c.display_name, m.service
             FROM message m
             LEFT JOIN handle h ON m.handle_id = h.ROWID
             LEFT JOIN chat_message_join cmj ON cmj.message_id = m.ROWID
             LEFT JOIN chat c ON c.ROWID = cmj.chat_id
             WHERE m.ROWID > ?1 AND {}
             ORDER BY m.ROWID ASC
             LIMIT ?2",
            ROW_PREDICATE
        );

        let mut stmt = self.conn.prepare(&sql)?;
        let sql_limit: i64 = limit.map(|l| l as i64).unwrap_or(-1);

        let rows = stmt.query_map(rusqlite::params![since_rowid, sql_limit], |row| {
            let rowid: i64 = row.get(0)?;
            let text: Option<String> = row.get(1)?;
            let blob: Option<Vec<u8>> = row.get(2)?;
            let date_ns: i64 = row.get(3)?;
            let is_from_me: i64 = row.get(4)?;
            let handle: Option<String> = row.get(5)?;
            let chat_identifier: Option<String> = row.get(6)?;
            let display_name: Option<String> = row.get(7)?;
            let service: Option<String> = row.get(8)?;
            Ok((
                rowid,
                text,
                blob,
                date_ns,
                is_from_me != 0,
                handle,
                chat_identifier,
                display_name,
                service,
            ))
        })?;

        let mut messages = Vec::new();
        for row in rows {
            let (rowid, text, blob, date_ns, is_from_me, handle, chat_identifier, display_name, service) =
                row?;

            let body = match text.filter(|t| !t.trim().is_empty()) {
                Some(t) => t,
                None => match blob.as_deref().and_then(extract_attributed_text) {
                    Some(t) => t,
                    // Extraction failure drops the row silently
                    None => continue,
                },
            };

            let chat_id = chat_identifier
                .filter(|c| !c.is_empty())
                .or_else(|| handle.clone())
                .unwrap_or_else(|| "unknown".to_string());

            messages.push(RawMessage {
                rowid,
                text: body,
                timestamp: apple_ns_to_unix(date_ns),
                is_from_me,
                handle,
                chat_id,
                group_name: display_name.filter(|n| !n.is_empty()),
                service: service.unwrap_or_default(),
            });
        }

        Ok(messages)
    }

    /// Count rows matching the read predicate past a cursor
    pub fn count_pending(&self, since_rowid: i64) -> Result<i64> {
        let sql = format!(
            "SELECT COUNT(*) FROM message m WHERE m.ROWID > ?1 AND {}",
            ROW_PREDICATE
        );
        Ok(self
            .conn
            .query_row(&sql, [since_rowid], |row| row.get(0))?)
    }

    /// Corpus shape over predicate-matching rows
    pub fn stats(&self) -> Result<MessageStats> {
        let sql = format!(
            "SELECT COUNT(*), COALESCE(MIN(m.ROWID), 0), COALESCE(MAX(m.ROWID), 0),
                    COALESCE(MIN(m.date), 0), COALESCE(MAX(m.date), 0)
             FROM message m WHERE {}",
            ROW_PREDICATE
        );
        let (total, min_rowid, max_rowid, oldest_ns, newest_ns) =
            self.conn.query_row(&sql, [], |row| {
                Ok((
                    row.get::<_, i64>(0)?,
                    row.get::<_, i64>(1)?,
                    row.get::<_, i64>(2)?,
                    row.get::<_, i64>(3)?,
                    row.get::<_, i64>(4)?,
                ))
            })?;

        Ok(MessageStats {
            total_messages: total,
            min_rowid,
            max_rowid,
            oldest_date: if total > 0 { apple_ns_to_unix(oldest_ns) } else { 0 },
            newest_date: if total > 0 { apple_ns_to_unix(newest_ns) } else { 0 },
        })
    }

    /// Release the underlying handle. The platform database is a shared
    /// system resource; readers must not idle with it open.
    pub fn close(self) {
        drop(self.conn);
    }
}

/// Recover message text from a serialized attributed-string blob.
///
/// The blob format is undocumented; this is the field-tested heuristic:
/// anchor on the literal `NSString`, scan for the `0x01 0x2B` marker whose
/// next byte is a length (low 7 bits when the high bit is set), and take
/// that many bytes as UTF-8. A printable-run scan after the anchor is the
/// fallback. Returns `None` when neither path yields text.
pub fn extract_attributed_text(blob: &[u8]) -> Option<String> {
    let marker = b"NSString";
    let pos = blob.windows(marker.len()).position(|w| w == marker)?;
    let after = &blob[pos + marker.len()..];

    if let Some(text) = extract_marked_string(after) {
        return Some(text);
    }
    extract_printable_run(after)
}

fn extract_marked_string(data: &[u8]) -> Option<String> {
    let mark = data.windows(2).position(|w| w == [0x01, 0x2B])?;
    let rest = &data[mark + 2..];

    let len_byte = *rest.first()?;
    let len = if len_byte < 0x80 {
        len_byte as usize
    } else {
        (len_byte & 0x7F) as usize
    };

    let body = rest.get(1..1 + len)?;
    let text = String::from_utf8(body.to_vec()).ok()?;
    let cleaned = strip_extraction_noise(&text);
    if cleaned.is_empty() {
        None
    } else {
        Some(cleaned)
    }
}

/// Strip leading control characters and a stray single-digit length
/// indicator that sometimes precedes the payload.
fn strip_extraction_noise(s: &str) -> String {
    let stripped = s.trim_start_matches(|c: char| {
        let u = c as u32;
        u <= 0x1F || (0x7F..=0x9F).contains(&u)
    });

    let mut chars = stripped.chars();
    if let Some(first) = chars.next() {
        if first.is_ascii_digit() {
            let rest = chars.as_str();
            if rest.chars().next().is_some_and(|c| c.is_alphabetic()) {
                return rest.to_string();
            }
        }
    }
    stripped.to_string()
}

/// Longest ASCII-printable run after the anchor; skips the short marker
/// runs that precede the payload.
fn extract_printable_run(data: &[u8]) -> Option<String> {
    let mut best: Option<(usize, usize)> = None;
    let mut run_start: Option<usize> = None;

    for (i, &b) in data.iter().enumerate() {
        let printable = (0x20..0x7F).contains(&b);
        match (printable, run_start) {
            (true, None) => run_start = Some(i),
            (false, Some(start)) => {
                if best.is_none_or(|(_, len)| i - start > len) {
                    best = Some((start, i - start));
                }
                run_start = None;
            }
            _ => {}
        }
    }
    if let Some(start) = run_start {
        if best.is_none_or(|(_, len)| data.len() - start > len) {
            best = Some((start, data.len() - start));
        }
    }

    let (start, len) = best?;
    if len < 2 {
        return None;
    }
    let text = String::from_utf8(data[start..start + len].to_vec()).ok()?;
    let trimmed = text.trim().to_string();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::timeutil::unix_to_apple_ns;

    /// Minimal chat.db shaped fixture
    pub(crate) fn fixture_db(path: &Path) -> Connection {
        let conn = Connection::open(path).unwrap();
        conn.execute_batch(
            "CREATE TABLE message (
                ROWID INTEGER PRIMARY KEY,
                text TEXT,
                attributedBody BLOB,
                date INTEGER NOT NULL,
                is_from_me INTEGER NOT NULL DEFAULT 0,
                handle_id INTEGER,
                service TEXT
             );
             CREATE TABLE handle (ROWID INTEGER PRIMARY KEY, id TEXT NOT NULL);
             CREATE TABLE chat (
                ROWID INTEGER PRIMARY KEY,
                chat_identifier TEXT NOT NULL,
                display_name TEXT
             );
             CREATE TABLE chat_message_join (chat_id INTEGER, message_id INTEGER);
             CREATE TABLE attachment (
                ROWID INTEGER PRIMARY KEY,
                guid TEXT NOT NULL,
                filename TEXT,
                mime_type TEXT,
                created_date INTEGER NOT NULL DEFAULT 0,
                transfer_name TEXT,
                total_bytes INTEGER NOT NULL DEFAULT 0
             );
             CREATE TABLE message_attachment_join (message_id INTEGER, attachment_id INTEGER);",
        )
        .unwrap();
        conn
    }

    pub(crate) fn insert_message(
        conn: &Connection,
        rowid: i64,
        text: &str,
        unix_ts: i64,
        from_me: bool,
        handle_rowid: Option<i64>,
        chat_rowid: i64,
    ) {
        conn.execute(
            "INSERT INTO message (ROWID, text, date, is_from_me, handle_id, service)
             VALUES (?1, ?2, ?3, ?4, ?5, 'iMessage')",
            rusqlite::params![rowid, text, unix_to_apple_ns(unix_ts), from_me as i64, handle_rowid],
        )
        .unwrap();
        conn.execute(
            "INSERT INTO chat_message_join (chat_id, message_id) VALUES (?1, ?2)",
            rusqlite::params![chat_rowid, rowid],
        )
        .unwrap();
    }

    fn marked_blob(text: &str) -> Vec<u8> {
        let mut blob = vec![0x04, 0x0B];
        blob.extend_from_slice(b"streamtyped");
        blob.extend_from_slice(b"NSString");
        blob.extend_from_slice(&[0x01, 0x95, 0x84, 0x01, 0x2B]);
        blob.push(text.len() as u8);
        blob.extend_from_slice(text.as_bytes());
        blob.extend_from_slice(&[0x86, 0x84]);
        blob
    }

    #[test]
    fn test_extract_marked_string() {
        let blob = marked_blob("see you at 7");
        assert_eq!(extract_attributed_text(&blob).as_deref(), Some("see you at 7"));
    }

    #[test]
    fn test_extract_high_bit_length() {
        // Length byte with the high bit set keeps only its low 7 bits
        let text = "x".repeat(5);
        let mut blob = Vec::new();
        blob.extend_from_slice(b"NSString");
        blob.extend_from_slice(&[0x01, 0x2B, 0x85]);
        blob.extend_from_slice(text.as_bytes());
        assert_eq!(extract_attributed_text(&blob).as_deref(), Some("xxxxx"));
    }

    #[test]
    fn test_extract_no_marker_falls_back_to_printable_run() {
        let mut blob = Vec::new();
        blob.extend_from_slice(b"NSString");
        blob.extend_from_slice(&[0x01, 0x02]);
        blob.extend_from_slice(b"fallback text here");
        blob.push(0x00);
        assert_eq!(
            extract_attributed_text(&blob).as_deref(),
            Some("fallback text here")
        );
    }

    #[test]
    fn test_extract_rejects_garbage() {
        assert_eq!(extract_attributed_text(b""), None);
        assert_eq!(extract_attributed_text(b"no anchor at all"), None);
        assert_eq!(extract_attributed_text(b"NSString\x00\x01"), None);
    }

    #[test]
    fn test_strip_leading_digit_indicator() {
        assert_eq!(strip_extraction_noise("\u{01}5hello"), "hello");
        // Digits followed by digits are payload, not an indicator
        assert_eq!(strip_extraction_noise("42 is the answer"), "42 is the answer");
    }

    #[test]
    fn test_read_messages_rowid_pagination() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("chat.db");
        let conn = fixture_db(&path);
        conn.execute(
            "INSERT INTO chat (ROWID, chat_identifier) VALUES (1, 'chat1')",
            [],
        )
        .unwrap();
        conn.execute("INSERT INTO handle (ROWID, id) VALUES (1, '+14155551234')", [])
            .unwrap();

        // Row ids with gaps, dates NOT aligned with rowid order
        insert_message(&conn, 10, "newest by date", 2_000, false, Some(1), 1);
        insert_message(&conn, 500, "oldest by date", 1_000, false, Some(1), 1);
        insert_message(&conn, 70_000, "middle by date", 1_500, true, None, 1);
        drop(conn);

        let reader = MessageReader::open(&path).unwrap();
        let all = reader.read_messages(0, None).unwrap();
        assert_eq!(
            all.iter().map(|m| m.rowid).collect::<Vec<_>>(),
            vec![10, 500, 70_000]
        );

        let after = reader.read_messages(10, Some(1)).unwrap();
        assert_eq!(after.len(), 1);
        assert_eq!(after[0].rowid, 500);
        assert_eq!(after[0].text, "oldest by date");
        assert_eq!(after[0].timestamp, 1_000);
        assert_eq!(after[0].handle.as_deref(), Some("+14155551234"));

        assert_eq!(reader.count_pending(10).unwrap(), 2);

        let stats = reader.stats().unwrap();
        assert_eq!(stats.total_messages, 3);
        assert_eq!(stats.min_rowid, 10);
        assert_eq!(stats.max_rowid, 70_000);
        assert_eq!(stats.oldest_date, 1_000);
        assert_eq!(stats.newest_date, 2_000);
    }

    #[test]
    fn test_blob_only_rows_and_silent_drops() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("chat.db");
        let conn = fixture_db(&path);
        conn.execute(
            "INSERT INTO chat (ROWID, chat_identifier) VALUES (1, 'chat1')",
            [],
        )
        .unwrap();

        // Text row, blob-only row, and a blob that fails extraction
        insert_message(&conn, 1, "plain", 100, false, None, 1);
        conn.execute(
            "INSERT INTO message (ROWID, text, attributedBody, date, is_from_me, service)
             VALUES (2, NULL, ?1, ?2, 0, 'iMessage')",
            rusqlite::params![marked_blob("from the blob"), unix_to_apple_ns(200)],
        )
        .unwrap();
        conn.execute(
            "INSERT INTO chat_message_join (chat_id, message_id) VALUES (1, 2)",
            [],
        )
        .unwrap();
        conn.execute(
            "INSERT INTO message (ROWID, text, attributedBody, date, is_from_me, service)
             VALUES (3, NULL, ?1, ?2, 0, 'iMessage')",
            rusqlite::params![vec![0u8; 32], unix_to_apple_ns(300)],
        )
        .unwrap();
        drop(conn);

        let reader = MessageReader::open(&path).unwrap();
        let messages = reader.read_messages(0, None).unwrap();
        assert_eq!(messages.len(), 2);
        assert_eq!(messages[1].text, "from the blob");
        // The unextractable row still counts toward the predicate total
        assert_eq!(reader.stats().unwrap().total_messages, 3);
    }

    #[test]
    fn test_open_missing_store_is_fatal_with_hint() {
        let err = MessageReader::open(Path::new("/nonexistent/chat.db")).unwrap_err();
        assert!(matches!(err, RecollectError::MessageStoreUnreadable(_)));
        assert!(err.hint().is_some());
    }
}
