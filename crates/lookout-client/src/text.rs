use once_cell::sync::Lazy;
use regex::Regex;
use scraper::Html;

pub const MAX_TITLE_CHARS: usize = 100;
pub const MAX_DESCRIPTION_CHARS: usize = 200;

const TITLE_DELIMITER: &str = " - ";

static WHITESPACE_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"\s+").expect("whitespace regex"));

/// Remove markup and decode entities, keeping only text nodes.
#[must_use]
pub fn strip_html(input: &str) -> String {
    if !input.contains(['<', '&']) {
        return input.to_string();
    }
    let fragment = Html::parse_fragment(input);
    fragment.root_element().text().collect::<String>()
}

/// Collapse every run of whitespace (spaces, tabs, newlines) into one space.
#[must_use]
pub fn collapse_whitespace(input: &str) -> String {
    WHITESPACE_RE.replace_all(input.trim(), " ").into_owned()
}

/// Truncate to at most `max` characters, marking the cut with an ellipsis.
#[must_use]
pub fn truncate_chars(input: &str, max: usize) -> String {
    if input.chars().count() <= max {
        return input.to_string();
    }
    let mut truncated: String = input.chars().take(max.saturating_sub(1)).collect();
    truncated.truncate(truncated.trim_end().len());
    truncated.push('…');
    truncated
}

#[must_use]
pub fn clean_title(raw: &str) -> String {
    truncate_chars(&collapse_whitespace(&strip_html(raw)), MAX_TITLE_CHARS)
}

#[must_use]
pub fn clean_description(raw: &str) -> String {
    truncate_chars(&collapse_whitespace(&strip_html(raw)), MAX_DESCRIPTION_CHARS)
}

/// Split a topic line of the form `"Title - description"`.
///
/// Without a delimiter the whole text serves as both the (shorter) title and
/// the description.
#[must_use]
pub fn split_title(text: &str) -> (String, String) {
    match text.split_once(TITLE_DELIMITER) {
        Some((title, rest)) if !title.trim().is_empty() => {
            (clean_title(title), clean_description(rest))
        }
        _ => (clean_title(text), clean_description(text)),
    }
}
