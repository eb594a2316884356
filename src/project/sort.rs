//! Natural ("human") ordering for test labels.
//!
//! `"blank 2"` sorts before `"blank 10"`: digit runs compare by numeric
//! value, everything else compares as text.

use regex::Regex;
use std::cmp::Ordering;
use std::sync::OnceLock;

static CHUNKS: OnceLock<Regex> = OnceLock::new();

fn chunk_regex() -> &'static Regex {
    CHUNKS.get_or_init(|| Regex::new(r"[0-9]+|[^0-9]+").expect("chunk pattern is valid"))
}

#[derive(Debug, PartialEq, Eq, PartialOrd, Ord)]
enum Chunk<'a> {
    Text(&'a str),
    /// Digit run with leading zeros stripped; longer runs are larger.
    Number(usize, &'a str),
}

fn natural_key(label: &str) -> Vec<Chunk<'_>> {
    let mut key = Vec::new();
    // keys always open with a text chunk so text and numbers stay aligned
    if label.chars().next().map_or(true, |c| c.is_ascii_digit()) {
        key.push(Chunk::Text(""));
    }
    for m in chunk_regex().find_iter(label) {
        let part = m.as_str();
        if part.as_bytes()[0].is_ascii_digit() {
            let trimmed = part.trim_start_matches('0');
            key.push(Chunk::Number(trimmed.len(), trimmed));
        } else {
            key.push(Chunk::Text(part));
        }
    }
    key
}

/// Compare two labels in natural order.
pub fn natural_cmp(a: &str, b: &str) -> Ordering {
    natural_key(a).cmp(&natural_key(b))
}

/// Sort labels in natural order, in place.
pub fn sort_nicely(labels: &mut [String]) {
    labels.sort_by(|a, b| natural_cmp(a, b));
}
