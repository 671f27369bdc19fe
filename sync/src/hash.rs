use sha2::{Digest, Sha256};

/// Hex SHA-256 of `bytes`; the dedup key for uploads.
pub fn content_hash(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    format!("{:x}", hasher.finalize())
}
