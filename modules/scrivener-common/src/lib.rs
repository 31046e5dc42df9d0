pub mod canonical;
pub mod config;
pub mod error;
pub mod types;

pub use canonical::{canonicalize, host_key, is_fetchable, CanonicalRules};
pub use config::*;
pub use error::{Result, ScrivenerError};
pub use types::*;

use sha2::{Digest, Sha256};

/// SHA-256 over content bytes, hex-encoded.
pub fn content_hash(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}

/// Count whitespace-separated words in a text body.
pub fn word_count(text: &str) -> u64 {
    text.split_whitespace().count() as u64
}

/// Normalize a title into a URL-safe slug: lowercase, strip non-alphanumeric
/// (keeping spaces), collapse whitespace, replace spaces with hyphens.
pub fn slugify(name: &str) -> String {
    let lowered = name.to_lowercase();
    let cleaned: String = lowered
        .chars()
        .map(|c| if c.is_alphanumeric() || c == ' ' { c } else { ' ' })
        .collect();
    cleaned.split_whitespace().collect::<Vec<&str>>().join("-")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn content_hash_is_stable() {
        let a = content_hash(b"hello world");
        let b = content_hash(b"hello world");
        assert_eq!(a, b);
        assert_eq!(a.len(), 64);
    }

    #[test]
    fn content_hash_differs_on_content() {
        assert_ne!(content_hash(b"a"), content_hash(b"b"));
    }

    #[test]
    fn word_count_splits_on_whitespace() {
        assert_eq!(word_count("one two\tthree\nfour"), 4);
        assert_eq!(word_count(""), 0);
        assert_eq!(word_count("   "), 0);
    }

    #[test]
    fn slugify_normalizes() {
        assert_eq!(slugify("The Daily: Episode 412!"), "the-daily-episode-412");
        assert_eq!(slugify("  Multiple   Spaces  "), "multiple-spaces");
    }
}
