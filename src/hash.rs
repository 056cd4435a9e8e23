//! Content hashing and deterministic identifiers
//!
//! Chunk ids are SHA-256 digests of the formatted chunk text, so the same
//! conversation segment always maps to the same document across runs. A
//! UUIDv5 variant exists for stores that require UUID point ids.

use sha2::{Digest, Sha256};
use uuid::Uuid;

/// Fixed namespace for deterministic point UUIDs
const POINT_NAMESPACE: Uuid = Uuid::from_bytes([
    0x8f, 0x2c, 0x1a, 0x5e, 0x47, 0xd3, 0x4b, 0x09, 0x9e, 0x61, 0x2a, 0xb8, 0xc4, 0x0d, 0x73,
    0x5f,
]);

/// SHA-256 hex digest of the formatted chunk text
pub fn chunk_id(text: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(text.as_bytes());
    hex::encode(hasher.finalize())
}

/// Deterministic UUID for a chunk hash (UUIDv5 over the hex digest)
pub fn point_uuid(chunk_hash: &str) -> Uuid {
    Uuid::new_v5(&POINT_NAMESPACE, chunk_hash.as_bytes())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_chunk_id_deterministic() {
        let a = chunk_id("[Alice 14:02] lunch?");
        let b = chunk_id("[Alice 14:02] lunch?");
        assert_eq!(a, b);
        assert_eq!(a.len(), 64);
        assert!(a.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn test_chunk_id_differs_on_content() {
        assert_ne!(chunk_id("hello"), chunk_id("hello "));
    }

    #[test]
    fn test_point_uuid_stable() {
        let hash = chunk_id("some chunk");
        assert_eq!(point_uuid(&hash), point_uuid(&hash));
        assert_ne!(point_uuid(&hash), point_uuid(&chunk_id("other chunk")));
    }
}
