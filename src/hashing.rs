//! Content digests shared by the cache, checkpoint store and audit chain.

use base64::Engine;
use serde::Serialize;
use sha2::{Digest, Sha256};

/// SHA-256 digest of raw bytes, base64 encoded.
pub fn digest_bytes(bytes: &[u8]) -> String {
    let hash = Sha256::digest(bytes);
    base64::engine::general_purpose::STANDARD.encode(hash)
}

/// Digest of the canonical JSON serialization of `value`.
///
/// Canonical here means serde field order: structs serialize their fields in
/// declaration order and sequences keep their order, so equal values always
/// produce equal bytes.
pub fn digest_json<T: Serialize + ?Sized>(value: &T) -> Result<String, serde_json::Error> {
    let bytes = serde_json::to_vec(value)?;
    Ok(digest_bytes(&bytes))
}

/// Digest over length-prefixed parts, so ("ab", "c") and ("a", "bc") differ.
pub fn digest_parts(parts: &[&str]) -> String {
    let mut hasher = Sha256::new();
    for part in parts {
        hasher.update((part.len() as u64).to_le_bytes());
        hasher.update(part.as_bytes());
    }
    base64::engine::general_purpose::STANDARD.encode(hasher.finalize())
}
