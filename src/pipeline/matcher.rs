//! Keyword matcher — literal, case-insensitive substring presence.
//!
//! Substring semantics are intentional: `leak` matches `leakage`. Matching is
//! pure; the same text and keyword set always yield the same result.

use std::collections::BTreeSet;

use tracing::debug;

/// Normalized watch list: lowercased, trimmed, non-empty, deduplicated.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct KeywordSet {
    keywords: BTreeSet<String>,
}

impl KeywordSet {
    /// Build from any iterator of keyword strings.
    pub fn new<I, S>(keywords: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let keywords = keywords
            .into_iter()
            .map(|k| k.as_ref().trim().to_lowercase())
            .filter(|k| !k.is_empty())
            .collect();
        Self { keywords }
    }

    /// Parse the flat comma-delimited source form (`"brand1, Brand2,,x"`).
    pub fn parse(source: &str) -> Self {
        Self::new(source.split(','))
    }

    pub fn is_empty(&self) -> bool {
        self.keywords.is_empty()
    }

    pub fn len(&self) -> usize {
        self.keywords.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = &str> {
        self.keywords.iter().map(String::as_str)
    }
}

/// Return the subset of `keywords` present in `text`.
///
/// `text` is lowercased again here so callers holding un-normalized text
/// still get case-insensitive behavior.
pub fn match_keywords(text: &str, keywords: &KeywordSet) -> BTreeSet<String> {
    if keywords.is_empty() || text.is_empty() {
        return BTreeSet::new();
    }

    let haystack = text.to_lowercase();
    let found: BTreeSet<String> = keywords
        .iter()
        .filter(|k| haystack.contains(k))
        .map(String::from)
        .collect();

    if !found.is_empty() {
        debug!(count = found.len(), "Keywords matched");
    }
    found
}
