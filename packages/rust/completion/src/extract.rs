//! Tolerant extraction of structured data from model output.
//!
//! Models wrap answers in prose, markdown fences, and trailing commentary.
//! These helpers find the first well-formed structure and ignore the rest.

use std::sync::LazyLock;

use regex::Regex;
use serde_json::{Map, Value};

// ---------------------------------------------------------------------------
// Regex patterns (compiled once)
// ---------------------------------------------------------------------------

/// Matches a fenced code block: captures the info string and the body.
static FENCE_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?s)```[ \t]*([A-Za-z0-9_+.-]*)[^\n]*\n(.*?)```").expect("fence regex")
});

// ---------------------------------------------------------------------------
// Balanced scanning
// ---------------------------------------------------------------------------

/// Return the balanced `open ... close` span starting at byte `start`.
/// Brackets inside double-quoted string literals are ignored.
fn balanced_at(text: &str, start: usize, open: u8, close: u8) -> Option<&str> {
    let mut depth = 0usize;
    let mut in_string = false;
    let mut escaped = false;

    for (i, &b) in text.as_bytes().iter().enumerate().skip(start) {
        if in_string {
            if escaped {
                escaped = false;
            } else if b == b'\\' {
                escaped = true;
            } else if b == b'"' {
                in_string = false;
            }
            continue;
        }
        if b == b'"' {
            in_string = true;
        } else if b == open {
            depth += 1;
        } else if b == close {
            depth -= 1;
            if depth == 0 {
                return Some(&text[start..=i]);
            }
        }
    }
    None
}

/// Every balanced span opened by `open`, in order of appearance.
fn balanced_spans(text: &str, open: char, close: char) -> impl Iterator<Item = &str> {
    text.match_indices(open)
        .filter_map(move |(start, _)| balanced_at(text, start, open as u8, close as u8))
}

// ---------------------------------------------------------------------------
// Public helpers
// ---------------------------------------------------------------------------

/// Extract the first well-formed JSON array of strings embedded in `text`.
///
/// `Sure! Here you go: ["a","b","c"] hope that helps.` yields `["a","b","c"]`.
/// Arrays holding anything other than strings are skipped.
pub fn first_string_array(text: &str) -> Option<Vec<String>> {
    balanced_spans(text, '[', ']').find_map(|span| serde_json::from_str::<Vec<String>>(span).ok())
}

/// Extract the first well-formed JSON object embedded in `text`.
pub fn first_json_object(text: &str) -> Option<Map<String, Value>> {
    balanced_spans(text, '{', '}').find_map(|span| serde_json::from_str(span).ok())
}

/// Interpret a strict yes/no answer. Case and surrounding whitespace are
/// ignored, as is a single trailing `.` or `!`. Anything else is `None`.
pub fn parse_yes_no(text: &str) -> Option<bool> {
    let trimmed = text.trim();
    let word = trimmed
        .strip_suffix('.')
        .or_else(|| trimmed.strip_suffix('!'))
        .unwrap_or(trimmed)
        .trim();
    if word.eq_ignore_ascii_case("yes") {
        Some(true)
    } else if word.eq_ignore_ascii_case("no") {
        Some(false)
    } else {
        None
    }
}

/// Body of the first fenced block tagged `lang` (case-insensitive), or of
/// the first fenced block of any kind when `lang` is `None`.
pub fn fenced_block(text: &str, lang: Option<&str>) -> Option<String> {
    FENCE_RE
        .captures_iter(text)
        .find(|caps| match lang {
            Some(lang) => caps[1].eq_ignore_ascii_case(lang),
            None => true,
        })
        .map(|caps| caps[2].trim_end().to_string())
}

/// Strip markdown fencing from generated code: prefer a block tagged
/// `lang`, then any block, then the trimmed text itself.
pub fn strip_code_fence(text: &str, lang: &str) -> String {
    fenced_block(text, Some(lang))
        .or_else(|| fenced_block(text, None))
        .unwrap_or_else(|| text.trim().to_string())
}
