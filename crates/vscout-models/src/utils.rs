//! Small helpers shared by identity derivation.

use sha2::{Digest, Sha256};

/// Normalize a free-text attribute for hashing: trim, lowercase, and
/// collapse internal whitespace runs to a single space.
///
/// # Examples
/// ```
/// use vscout_models::utils::normalize_text;
/// assert_eq!(normalize_text("  Dark   BLUE "), "dark blue");
/// ```
pub fn normalize_text(input: &str) -> String {
    input
        .split_whitespace()
        .map(|word| word.to_lowercase())
        .collect::<Vec<_>>()
        .join(" ")
}

/// Hex SHA-256 of the parts joined with `|`.
pub fn digest_parts(parts: &[&str]) -> String {
    format!("{:x}", Sha256::digest(parts.join("|").as_bytes()))
}

/// Prefixed, truncated digest used for entity and event identifiers.
pub fn short_id(prefix: &str, parts: &[&str]) -> String {
    let digest = digest_parts(parts);
    format!("{}_{}", prefix, &digest[..16])
}
