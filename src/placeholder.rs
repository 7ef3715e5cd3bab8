use crate::models::User;
use regex::Regex;
use std::sync::OnceLock;

static PLACEHOLDER: OnceLock<Regex> = OnceLock::new();
static WHITESPACE: OnceLock<Regex> = OnceLock::new();

fn placeholder_regex() -> &'static Regex {
    PLACEHOLDER.get_or_init(|| Regex::new(r"\{\{customFields\.([a-fA-F0-9-]+)\}\}").unwrap())
}

fn whitespace_regex() -> &'static Regex {
    WHITESPACE.get_or_init(|| Regex::new(r"\s+").unwrap())
}

/// Substitute `{{customFields.<id>}}` tokens against the user's field values.
/// Unknown ids resolve to the empty string. The result is trimmed and
/// internal whitespace runs collapse to a single space.
pub fn resolve(content: &str, user: &User) -> String {
    if content.is_empty() {
        return String::new();
    }
    let substituted = placeholder_regex().replace_all(content, |caps: &regex::Captures<'_>| {
        user.field_value(&caps[1]).unwrap_or_default().to_string()
    });
    whitespace_regex()
        .replace_all(substituted.trim(), " ")
        .into_owned()
}
