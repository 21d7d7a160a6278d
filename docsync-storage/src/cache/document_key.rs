//! Cache keys for documents.
//!
//! Every document lives in the cache under `doc:<url>`. The prefix lets the
//! synchronizer enumerate documents without touching unrelated keys that
//! may share the same cache.

use std::fmt;

/// Prefix shared by every document key.
pub const DOCUMENT_KEY_PREFIX: &str = "doc:";

/// A cache key that addresses exactly one document.
///
/// Can only be built from a url or parsed from an encoded key that carries
/// the document prefix, so a raw url can never be used as a key by mistake.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DocumentKey {
    encoded: String,
}

impl DocumentKey {
    /// Key for the document with this url.
    pub fn for_url(url: &str) -> Self {
        let mut encoded = String::with_capacity(DOCUMENT_KEY_PREFIX.len() + url.len());
        encoded.push_str(DOCUMENT_KEY_PREFIX);
        encoded.push_str(url);
        Self { encoded }
    }

    /// Parse an encoded key. Returns `None` for keys outside the document
    /// namespace or with an empty url.
    pub fn parse(raw: &str) -> Option<Self> {
        let url = raw.strip_prefix(DOCUMENT_KEY_PREFIX)?;
        if url.is_empty() {
            return None;
        }
        Some(Self {
            encoded: raw.to_string(),
        })
    }

    /// The url this key addresses.
    pub fn url(&self) -> &str {
        &self.encoded[DOCUMENT_KEY_PREFIX.len()..]
    }

    /// The full encoded key.
    pub fn as_str(&self) -> &str {
        &self.encoded
    }

    /// The encoded key as bytes, for byte-keyed backends.
    pub fn as_bytes(&self) -> &[u8] {
        self.encoded.as_bytes()
    }
}

impl fmt::Display for DocumentKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.encoded)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_for_url_adds_prefix() {
        let key = DocumentKey::for_url("https://example.com/a");
        assert_eq!(key.as_str(), "doc:https://example.com/a");
        assert_eq!(key.url(), "https://example.com/a");
    }

    #[test]
    fn test_parse_rejects_foreign_keys() {
        assert!(DocumentKey::parse("session:abc").is_none());
        assert!(DocumentKey::parse("https://example.com").is_none());
        assert!(DocumentKey::parse("doc:").is_none());
    }

    #[test]
    fn test_parse_accepts_document_keys() {
        let key = DocumentKey::parse("doc:https://example.com/b").expect("valid key");
        assert_eq!(key.url(), "https://example.com/b");
    }

    #[test]
    fn test_url_containing_prefix_survives() {
        let key = DocumentKey::for_url("doc:nested");
        assert_eq!(key.as_str(), "doc:doc:nested");
        assert_eq!(key.url(), "doc:nested");
    }

    proptest! {
        #[test]
        fn prop_parse_inverts_for_url(url in ".{1,64}") {
            let key = DocumentKey::for_url(&url);
            let parsed = DocumentKey::parse(key.as_str()).expect("round trip");
            prop_assert_eq!(parsed.url(), url.as_str());
        }
    }
}
