//! Tag normalization.

use super::TagDraft;
use regex::Regex;
use std::collections::HashSet;
use std::sync::LazyLock;

static WHITESPACE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\s+").expect("whitespace regex must compile"));

/// Normalize a tag label: trim, lower-case, collapse inner whitespace to `_`.
///
/// Returns `None` for labels that are empty after trimming.
pub fn normalize_tag(raw: &str) -> Option<String> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return None;
    }
    Some(WHITESPACE.replace_all(&trimmed.to_lowercase(), "_").into_owned())
}

/// Normalize and deduplicate tags, keeping the first occurrence of each name.
pub fn normalize_tags(tags: impl IntoIterator<Item = TagDraft>) -> Vec<TagDraft> {
    let mut seen = HashSet::new();
    tags.into_iter()
        .filter_map(|tag| {
            let name = normalize_tag(&tag.name)?;
            seen.insert(name.clone()).then_some(TagDraft {
                name,
                category: tag.category,
            })
        })
        .collect()
}
