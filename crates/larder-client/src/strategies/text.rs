//! Shared helpers for reading text out of recipe markup.

use std::sync::LazyLock;

use regex::Regex;
use scraper::{ElementRef, Html, Selector};

static ISO_DURATION: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?i)^P(?:(\d+)D)?(?:T(?:(\d+(?:\.\d+)?)H)?(?:(\d+(?:\.\d+)?)M)?(?:(\d+(?:\.\d+)?)S)?)?$",
    )
    .expect("valid regex")
});
static TEXT_HOURS: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)(\d+(?:\.\d+)?)\s*(?:h|hr|hrs|hour|hours)\b").expect("valid regex")
});
static TEXT_MINUTES: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)(\d+)\s*(?:m|min|mins|minute|minutes)\b").expect("valid regex")
});
static TAGS: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"<[^>]*>").expect("valid regex"));

/// Minutes in an ISO-8601 duration (`PT1H30M`) or free text (`1 hr 30 mins`).
///
/// Zero-length durations are treated as absent.
pub fn parse_duration_minutes(raw: &str) -> Option<u32> {
    let raw = raw.trim();
    if raw.is_empty() {
        return None;
    }

    let minutes = if let Some(caps) = ISO_DURATION.captures(raw) {
        let part = |i: usize| {
            caps.get(i)
                .and_then(|m| m.as_str().parse::<f64>().ok())
                .unwrap_or(0.0)
        };
        part(1) * 1440.0 + part(2) * 60.0 + part(3) + part(4) / 60.0
    } else if let Ok(bare) = raw.parse::<f64>() {
        bare
    } else {
        let hours: f64 = TEXT_HOURS
            .captures_iter(raw)
            .filter_map(|c| c[1].parse::<f64>().ok())
            .sum();
        let mins: f64 = TEXT_MINUTES
            .captures_iter(raw)
            .filter_map(|c| c[1].parse::<f64>().ok())
            .sum();
        hours * 60.0 + mins
    };

    let rounded = minutes.round();
    (rounded >= 1.0 && rounded < u32::MAX as f64).then_some(rounded as u32)
}

/// All text beneath an element, whitespace-joined.
pub fn element_text(el: ElementRef<'_>) -> String {
    el.text()
        .map(str::trim)
        .filter(|t| !t.is_empty())
        .collect::<Vec<_>>()
        .join(" ")
}

/// Remove inline markup some sites leave inside JSON-LD strings.
pub fn strip_tags(raw: &str) -> String {
    if raw.contains('<') {
        TAGS.replace_all(raw, " ").into_owned()
    } else {
        raw.to_string()
    }
}

/// Split a block of text into non-empty lines.
pub fn split_lines(raw: &str) -> Vec<String> {
    raw.lines()
        .map(str::trim)
        .filter(|l| !l.is_empty())
        .map(String::from)
        .collect()
}

/// Treat blank strings as absent.
pub fn non_empty(value: String) -> Option<String> {
    let trimmed = value.trim();
    (!trimmed.is_empty()).then(|| trimmed.to_string())
}

/// `content` of the first `<meta>` matching `selector`.
pub fn meta_content(document: &Html, selector: &Selector) -> Option<String> {
    document
        .select(selector)
        .filter_map(|el| el.value().attr("content"))
        .map(String::from)
        .find_map(non_empty)
}

/// Text of the first element matching `selector`.
pub fn first_text(scope: ElementRef<'_>, selector: &Selector) -> Option<String> {
    scope
        .select(selector)
        .map(element_text)
        .find_map(non_empty)
}

/// Texts of every element matching `selector`, blanks dropped.
pub fn all_texts(scope: ElementRef<'_>, selector: &Selector) -> Vec<String> {
    scope
        .select(selector)
        .map(element_text)
        .filter(|t| !t.is_empty())
        .collect()
}
