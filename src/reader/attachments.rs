//! Attachment rows from the platform message store
//!
//! Only rows with a filename survive; MIME classification marks images
//! either by `image/*` type or by a known raster extension so HEIC files
//! with missing MIME still count.

use std::path::{Path, PathBuf};

use rusqlite::{Connection, OpenFlags};
use tracing::debug;

use crate::error::{RecollectError, Result};
use crate::timeutil::apple_ns_to_unix;
use crate::types::AttachmentRow;

const IMAGE_EXTENSIONS: &[&str] = &[
    "jpg", "jpeg", "png", "gif", "heic", "heif", "webp", "tiff", "bmp",
];

const SELECT_COLUMNS: &str = "a.ROWID, a.guid, a.filename, a.mime_type, a.created_date,
       a.transfer_name, a.total_bytes, maj.message_id, c.chat_identifier";

/// Read-only handle over attachment rows
pub struct AttachmentReader {
    conn: Connection,
}

impl AttachmentReader {
    /// Open the message database read-only (same store as the message
    /// reader, separate handle)
    pub fn open(path: &Path) -> Result<Self> {
        let flags = OpenFlags::SQLITE_OPEN_READ_ONLY | OpenFlags::SQLITE_OPEN_NO_MUTEX;
        let conn = Connection::open_with_flags(path, flags).map_err(|e| {
            RecollectError::MessageStoreUnreadable(format!("{}: {}", path.display(), e))
        })?;
        debug!(path = %path.display(), "opened attachment reader");
        Ok(Self { conn })
    }

    /// Image attachments with `ROWID > since_rowid`, ascending
    pub fn read_images(&self, since_rowid: i64, limit: Option<usize>) -> Result<Vec<AttachmentRow>> {
        let sql = format!(
            "SELECT {}
             FROM attachment a
             JOIN message_attachment_join maj ON maj.attachment_id = a.ROWID
             LEFT JOIN chat_message_join cmj ON cmj.message_id = maj.message_id
             LEFT JOIN chat c ON c.ROWID = cmj.chat_id
             WHERE a.ROWID > ?1 AND a.filename IS NOT NULL
             ORDER BY a.ROWID ASC
             LIMIT ?2",
            SELECT_COLUMNS
        );
        let mut stmt = self.conn.prepare(&sql)?;
        let sql_limit: i64 = limit.map(|l| l as i64).unwrap_or(-1);
        let rows = stmt.query_map(rusqlite::params![since_rowid, sql_limit], row_to_attachment)?;

        Ok(rows
            .filter_map(|r| r.ok())
            .filter(|a| a.is_image)
            .collect())
    }

    /// Every attachment (image or not) joined to one message
    pub fn attachments_for_message(&self, message_rowid: i64) -> Result<Vec<AttachmentRow>> {
        let sql = format!(
            "SELECT {}
             FROM attachment a
             JOIN message_attachment_join maj ON maj.attachment_id = a.ROWID
             LEFT JOIN chat_message_join cmj ON cmj.message_id = maj.message_id
             LEFT JOIN chat c ON c.ROWID = cmj.chat_id
             WHERE maj.message_id = ?1 AND a.filename IS NOT NULL
             ORDER BY a.ROWID ASC",
            SELECT_COLUMNS
        );
        let mut stmt = self.conn.prepare(&sql)?;
        let rows = stmt.query_map([message_rowid], row_to_attachment)?;
        Ok(rows.filter_map(|r| r.ok()).collect())
    }

    /// Image attachments for one message
    pub fn images_for_message(&self, message_rowid: i64) -> Result<Vec<AttachmentRow>> {
        Ok(self
            .attachments_for_message(message_rowid)?
            .into_iter()
            .filter(|a| a.is_image)
            .collect())
    }

    /// Release the underlying handle
    pub fn close(self) {
        drop(self.conn);
    }
}

fn row_to_attachment(row: &rusqlite::Row<'_>) -> rusqlite::Result<AttachmentRow> {
    let rowid: i64 = row.get(0)?;
    let guid: String = row.get(1)?;
    let filename: String = row.get(2)?;
    let mime_type: Option<String> = row.get(3)?;
    let created_ns: i64 = row.get(4)?;
    let transfer_name: Option<String> = row.get(5)?;
    let total_bytes: i64 = row.get(6)?;
    let message_rowid: i64 = row.get(7)?;
    let chat_id: Option<String> = row.get(8)?;

    let mime = mime_type.unwrap_or_default();
    Ok(AttachmentRow {
        rowid,
        guid,
        is_image: classify_image(&filename, &mime),
        path: resolve_path(&filename),
        mime_type: mime,
        message_rowid,
        chat_id: chat_id.unwrap_or_default(),
        created_at: apple_ns_to_unix(created_ns),
        transfer_name: transfer_name.unwrap_or_default(),
        total_bytes,
    })
}

/// Expand a leading `~` against the home directory
fn resolve_path(filename: &str) -> PathBuf {
    PathBuf::from(shellexpand::tilde(filename).to_string())
}

fn classify_image(filename: &str, mime_type: &str) -> bool {
    if mime_type.starts_with("image/") {
        return true;
    }
    Path::new(filename)
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| IMAGE_EXTENSIONS.contains(&e.to_lowercase().as_str()))
        .unwrap_or(false)
}
