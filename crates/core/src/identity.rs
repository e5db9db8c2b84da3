//! Content-derived identity keys.
//!
//! Record identity is a digest over the fields that define "the same
//! product row": strong identity hashes (title, identifier, sku, price);
//! quarantine match keys hash only (title, sku) so that re-ingested
//! low-confidence rows collapse onto the same triage entry.

use sha2::{Digest, Sha256};

/// SHA-256 hex digest of arbitrary bytes.
pub fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    let digest = hasher.finalize();
    let mut out = String::with_capacity(64);
    for b in digest {
        out.push_str(&format!("{b:02x}"));
    }
    out
}

/// Digest of a raw feed payload, used for change detection.
pub fn content_digest(bytes: &[u8]) -> String {
    sha256_hex(bytes)
}

/// Strong identity key for an indexable record.
///
/// Fields are joined with a separator that cannot appear in the hashed
/// representation, so ("ab", "c") and ("a", "bc") hash differently.
pub fn record_key(title: &str, identifier: &str, sku: &str, price_cents: i64) -> String {
    let material = format!(
        "{}\x1f{}\x1f{}\x1f{}",
        title.trim().to_lowercase(),
        identifier.trim().to_lowercase(),
        sku.trim().to_lowercase(),
        price_cents
    );
    sha256_hex(material.as_bytes())
}

/// Match key deduplicating quarantined rows within one feed.
pub fn match_key(title: &str, sku: &str) -> String {
    let material = format!(
        "{}\x1f{}",
        title.trim().to_lowercase(),
        sku.trim().to_lowercase()
    );
    sha256_hex(material.as_bytes())
}
