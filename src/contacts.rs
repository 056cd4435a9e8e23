//! Contact resolution against the macOS address book
//!
//! Loads phone-number and email records from every reachable address-book
//! database (the primary store plus per-account `Sources/*/` copies) into
//! in-memory maps keyed by normalized handle. Sources that cannot be
//! opened are skipped; an entirely empty load is reported once as a
//! warning and the resolver degrades to echoing raw handles.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use rusqlite::{Connection, OpenFlags};
use tracing::{debug, warn};

const ADDRESS_BOOK_DB: &str = "AddressBook-v22.abcddb";

/// In-memory handle → display-name lookup
pub struct ContactResolver {
    by_handle: HashMap<String, String>,
}

/// Normalize a phone number for lookup.
///
/// Strips everything but digits; US-style 11-digit numbers lose their
/// leading 1; longer international forms keep their last 10 digits.
pub fn normalize_phone(raw: &str) -> String {
    let digits: String = raw.chars().filter(|c| c.is_ascii_digit()).collect();
    if digits.len() == 11 && digits.starts_with('1') {
        digits[1..].to_string()
    } else if digits.len() >= 10 {
        digits[digits.len() - 10..].to_string()
    } else {
        digits
    }
}

/// Normalize an email handle for lookup
pub fn normalize_email(raw: &str) -> String {
    raw.trim().to_lowercase()
}

/// Normalize any handle: emails by case, everything else as a phone number
pub fn normalize_handle(raw: &str) -> String {
    if raw.contains('@') {
        normalize_email(raw)
    } else {
        normalize_phone(raw)
    }
}

impl ContactResolver {
    /// Load every reachable address-book database under `root`.
    ///
    /// `None` uses the platform location
    /// (`~/Library/Application Support/AddressBook`).
    pub fn load(root: Option<&Path>) -> Self {
        let base = match root {
            Some(p) => p.to_path_buf(),
            None => dirs::home_dir()
                .unwrap_or_else(|| PathBuf::from("/"))
                .join("Library/Application Support/AddressBook"),
        };

        let mut sources = vec![base.join(ADDRESS_BOOK_DB)];
        if let Ok(entries) = std::fs::read_dir(base.join("Sources")) {
            for entry in entries.flatten() {
                sources.push(entry.path().join(ADDRESS_BOOK_DB));
            }
        }

        Self::load_from_paths(&sources)
    }

    /// Load from an explicit list of database paths (first source wins on
    /// collision)
    pub fn load_from_paths(paths: &[PathBuf]) -> Self {
        let mut by_handle = HashMap::new();

        for path in paths {
            match Self::load_source(path, &mut by_handle) {
                Ok(added) => {
                    debug!(path = %path.display(), added, "loaded address-book source")
                }
                Err(e) => debug!(path = %path.display(), error = %e, "skipped address-book source"),
            }
        }

        if by_handle.is_empty() {
            warn!("no contacts loaded from any address-book source; handles will not resolve to names");
        }

        Self { by_handle }
    }

    /// Empty resolver (handles echo back unchanged)
    pub fn empty() -> Self {
        Self {
            by_handle: HashMap::new(),
        }
    }

    fn load_source(
        path: &Path,
        by_handle: &mut HashMap<String, String>,
    ) -> rusqlite::Result<usize> {
        let conn = Connection::open_with_flags(
            path,
            OpenFlags::SQLITE_OPEN_READ_ONLY | OpenFlags::SQLITE_OPEN_NO_MUTEX,
        )?;
        let mut added = 0;

        let mut stmt = conn.prepare(
            "SELECT r.ZFIRSTNAME, r.ZLASTNAME, p.ZFULLNUMBER
             FROM ZABCDPHONENUMBER p
             JOIN ZABCDRECORD r ON p.ZOWNER = r.Z_PK",
        )?;
        let rows = stmt.query_map([], |row| {
            let first: Option<String> = row.get(0)?;
            let last: Option<String> = row.get(1)?;
            let number: Option<String> = row.get(2)?;
            Ok((display_name(first, last), number))
        })?;
        for row in rows.flatten() {
            if let (Some(name), Some(number)) = row {
                let key = normalize_phone(&number);
                if !key.is_empty() && !by_handle.contains_key(&key) {
                    by_handle.insert(key, name);
                    added += 1;
                }
            }
        }

        let mut stmt = conn.prepare(
            "SELECT r.ZFIRSTNAME, r.ZLASTNAME, e.ZADDRESS
             FROM ZABCDEMAILADDRESS e
             JOIN ZABCDRECORD r ON e.ZOWNER = r.Z_PK",
        )?;
        let rows = stmt.query_map([], |row| {
            let first: Option<String> = row.get(0)?;
            let last: Option<String> = row.get(1)?;
            let address: Option<String> = row.get(2)?;
            Ok((display_name(first, last), address))
        })?;
        for row in rows.flatten() {
            if let (Some(name), Some(address)) = row {
                let key = normalize_email(&address);
                if !key.is_empty() && !by_handle.contains_key(&key) {
                    by_handle.insert(key, name);
                    added += 1;
                }
            }
        }

        Ok(added)
    }

    /// Resolve a raw handle to a display name; unknown handles echo back
    pub fn resolve(&self, handle: &str) -> String {
        self.by_handle
            .get(&normalize_handle(handle))
            .cloned()
            .unwrap_or_else(|| handle.to_string())
    }

    pub fn len(&self) -> usize {
        self.by_handle.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_handle.is_empty()
    }

    /// Insert a mapping directly (test fixtures)
    #[cfg(test)]
    pub fn insert(&mut self, handle: &str, name: &str) {
        self.by_handle
            .insert(normalize_handle(handle), name.to_string());
    }
}

fn display_name(first: Option<String>, last: Option<String>) -> Option<String> {
    let name = format!(
        "{} {}",
        first.unwrap_or_default().trim(),
        last.unwrap_or_default().trim()
    )
    .trim()
    .to_string();
    if name.is_empty() {
        None
    } else {
        Some(name)
    }
}
