//! Title preprocessing for embedding generation.
//!
//! A bookmark title is split into segments at separator punctuation
//! ("Rust Book | Ownership - Rust" -> ["Rust Book", "Ownership", "Rust"]),
//! each segment is embedded separately and the record stores them in order.

use once_cell::sync::Lazy;
use regex::Regex;

/// Maximum segment length for embedding input (characters, not tokens)
const MAX_SEGMENT_LENGTH: usize = 512;

/// Ellipsis suffix when a segment is truncated
const TRUNCATION_SUFFIX: &str = "...";

/// Separator punctuation. Hyphens and dashes only count when surrounded by
/// whitespace so that words like "e-mail" stay whole.
static SEPARATOR_REGEX: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"\s+[-–—]\s+|[|｜·•:：;；,，。/]").expect("separator regex is valid")
});

/// Split a title into trimmed, non-empty segments.
///
/// Returns an empty list for a blank title. A title without separators
/// yields a single segment.
pub fn segment_title(title: &str) -> Vec<String> {
    let title = title.trim();
    if title.is_empty() {
        return vec![];
    }

    let segments: Vec<String> = SEPARATOR_REGEX
        .split(title)
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(truncate_segment)
        .collect();

    if segments.is_empty() {
        // title made only of separators
        vec![truncate_segment(title)]
    } else {
        segments
    }
}

/// Text segments to embed for a bookmark: the title, or the url when the
/// title is blank. `None` when neither carries any text.
pub fn embedding_input(title: &str, url: Option<&str>) -> Option<Vec<String>> {
    let segments = segment_title(title);
    if !segments.is_empty() {
        return Some(segments);
    }

    url.map(str::trim)
        .filter(|u| !u.is_empty())
        .map(|u| vec![truncate_segment(u)])
}

/// Truncate to MAX_SEGMENT_LENGTH characters, adding ellipsis if truncated.
fn truncate_segment(content: &str) -> String {
    if content.chars().count() <= MAX_SEGMENT_LENGTH {
        return content.to_string();
    }

    let max_chars = MAX_SEGMENT_LENGTH - TRUNCATION_SUFFIX.len();
    let truncated: String = content.chars().take(max_chars).collect();

    format!("{}{}", truncated, TRUNCATION_SUFFIX)
}

/// Hash of the trimmed title, used to detect renames that need re-embedding.
///
/// CRC32 so the value is stable across builds and can be persisted.
pub fn content_hash(title: &str) -> u64 {
    crc32fast::hash(title.trim().as_bytes()) as u64
}
