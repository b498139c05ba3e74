//! Content hashing. SHA-256 is the authoritative identity for reindex
//! decisions; chunk ids are derived from it so they survive restarts and
//! stay stable while content does not change.

use sha2::{Digest, Sha256};

/// Lowercase hex SHA-256 of a byte slice.
pub fn hash_bytes(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex_encode(&hasher.finalize())
}

/// Stable chunk id: the first 16 bytes of `SHA-256(fileHash ":" index)`
/// rendered as a UUID. Valid as a vector-store point id, deterministic
/// across process restarts and platforms.
pub fn chunk_id(file_content_hash: &str, chunk_index: usize) -> String {
    let mut hasher = Sha256::new();
    hasher.update(file_content_hash.as_bytes());
    hasher.update(b":");
    hasher.update(chunk_index.to_string().as_bytes());
    let digest = hasher.finalize();
    let mut bytes = [0u8; 16];
    bytes.copy_from_slice(&digest[..16]);
    uuid::Uuid::from_bytes(bytes).to_string()
}

fn hex_encode(bytes: &[u8]) -> String {
    let mut out = String::with_capacity(bytes.len() * 2);
    for b in bytes {
        out.push_str(&format!("{b:02x}"));
    }
    out
}
