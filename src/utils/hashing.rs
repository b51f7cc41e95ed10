//! Content hashing for the `Prompt` root mirror's `sync_hash` field.

use sha2::{Digest, Sha256};

/// Hex-encoded SHA-256 of `content`, used as `Prompt.sync_hash` so the
/// sync engine can detect content drift without comparing full bodies.
pub fn sha256_hex(content: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(content.as_bytes());
    format!("{:x}", hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn same_content_hashes_identically() {
        assert_eq!(sha256_hex("hello"), sha256_hex("hello"));
    }

    #[test]
    fn different_content_hashes_differently() {
        assert_ne!(sha256_hex("hello"), sha256_hex("world"));
    }
}
