// crates/alphred-core/src/core/hashing.rs
// ============================================================================
// Module: Alphred Content Hashing
// Description: SHA-256 content hashing for context envelopes.
// Purpose: Provide deterministic digests of full artifact contents.
// Dependencies: sha2
// ============================================================================

//! ## Overview
//! Context envelopes embed a digest of the FULL original artifact content so
//! downstream consumers can detect truncation tampering. Only SHA-256 is
//! supported; digests render as lowercase hex.

// ============================================================================
// SECTION: Imports
// ============================================================================

use sha2::Digest;
use sha2::Sha256;

// ============================================================================
// SECTION: Hashing Helpers
// ============================================================================

/// Hashes UTF-8 text with SHA-256 and returns lowercase hex.
#[must_use]
pub fn sha256_hex(content: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(content.as_bytes());
    hex_encode(&hasher.finalize())
}

/// Encodes bytes as a lowercase hex string.
fn hex_encode(bytes: &[u8]) -> String {
    const HEX: &[u8; 16] = b"0123456789abcdef";
    let mut out = String::with_capacity(bytes.len() * 2);
    for byte in bytes {
        out.push(HEX[(byte >> 4) as usize] as char);
        out.push(HEX[(byte & 0x0f) as usize] as char);
    }
    out
}

// ============================================================================
// SECTION: Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::sha256_hex;

    /// Matches the well-known digest of the empty string.
    #[test]
    fn empty_string_digest() {
        assert_eq!(
            sha256_hex(""),
            "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"
        );
    }

    /// Produces 64 lowercase hex characters.
    #[test]
    fn digest_shape() {
        let digest = sha256_hex("alphred");
        assert_eq!(digest.len(), 64);
        assert!(digest.chars().all(|c| c.is_ascii_hexdigit() && !c.is_ascii_uppercase()));
    }
}
