//! HTML to prose normalization for work-item descriptions.
//!
//! [`normalize`] runs an ordered list of small, pure `&str -> String`
//! steps ([`STEPS`]). Each step can be tested on its own. The regex crate
//! has no look-around, so rules that depend on a neighbouring character are
//! written as short scanners instead.
//!
//! The output is plain text with consistent punctuation spacing:
//!
//! ```rust
//! use polarion_copilot::normalize::normalize;
//!
//! assert_eq!(normalize("<li>A</li><li>B</li>"), "A, B");
//! assert_eq!(normalize("Hello.World"), "Hello. World");
//! ```

use regex::{Captures, Regex};
use std::sync::LazyLock;

/// A single normalization step.
pub type Step = fn(&str) -> String;

/// The pipeline, in application order.
pub const STEPS: &[(&str, Step)] = &[
    ("decode_entities", decode_entities),
    ("strip_trailing_list_tags", strip_trailing_list_tags),
    ("list_items_to_commas", list_items_to_commas),
    ("line_breaks_to_sentences", line_breaks_to_sentences),
    ("strip_control_chars", strip_control_chars),
    ("strip_tags", strip_tags),
    ("collapse_spaces", collapse_spaces),
    ("space_after_period", space_after_period),
    ("trim_after_final_period", trim_after_final_period),
    ("space_before_capital", space_before_capital),
    ("no_space_before_period", no_space_before_period),
    ("no_space_after_open_paren", no_space_after_open_paren),
    ("trim_after_close_paren", trim_after_close_paren),
    ("no_space_before_comma", no_space_before_comma),
    ("space_after_comma", space_after_comma),
    ("trailing_period_comma", trailing_period_comma),
    ("space_after_close_paren", space_after_close_paren),
    ("space_after_colon", space_after_colon),
];

/// Convert a raw HTML description into normalized plain text.
///
/// Total and deterministic. Malformed markup is cleaned best-effort.
pub fn normalize(raw: &str) -> String {
    STEPS
        .iter()
        .fold(raw.to_string(), |text, (_, step)| step(&text))
}

fn regex(pattern: &str) -> Regex {
    Regex::new(pattern).unwrap_or_else(|e| panic!("invalid built-in pattern {pattern}: {e}"))
}

static ENTITY: LazyLock<Regex> = LazyLock::new(|| regex(r"&#?[A-Za-z0-9]+;"));
static TRAILING_LIST_TAGS: LazyLock<Regex> =
    LazyLock::new(|| regex(r"(?:\s*</?(?:ul|ol)>|\s*</li>)+\s*$"));
static LI_CLOSE: LazyLock<Regex> = LazyLock::new(|| regex(r"</li>"));
static LI_TAG: LazyLock<Regex> = LazyLock::new(|| regex(r"</?li(?:\s[^>]*)?>"));
static LINE_BREAK: LazyLock<Regex> = LazyLock::new(|| regex(r"<br\s*/?>"));
static TAG: LazyLock<Regex> = LazyLock::new(|| regex(r"<[^>]*>"));
static SPACES: LazyLock<Regex> = LazyLock::new(|| regex(r"[ \u{a0}]+"));
static PERIOD_CAPITAL: LazyLock<Regex> = LazyLock::new(|| regex(r"\.\s*([A-Z])"));
static SPACE_PERIOD: LazyLock<Regex> = LazyLock::new(|| regex(r"\s+\."));
static OPEN_PAREN_SPACE: LazyLock<Regex> = LazyLock::new(|| regex(r"\(\s+"));
static CLOSE_PAREN_SPACE: LazyLock<Regex> = LazyLock::new(|| regex(r"\)\s+"));
static SPACE_COMMA: LazyLock<Regex> = LazyLock::new(|| regex(r"\s+,"));
static TRAILING_PERIOD_COMMA: LazyLock<Regex> = LazyLock::new(|| regex(r"\.,\s*$"));

/// Decode named (HTML5) and numeric character references.
/// Unknown entities are left untouched.
pub fn decode_entities(text: &str) -> String {
    ENTITY
        .replace_all(text, |caps: &Captures| {
            let raw = &caps[0];
            match quick_xml::escape::unescape_with(raw, quick_xml::escape::resolve_html5_entity) {
                Ok(decoded) => decoded.into_owned(),
                Err(_) => raw.to_string(),
            }
        })
        .into_owned()
}

/// Drop list-closing tags at the very end, so the last item gets no comma.
pub fn strip_trailing_list_tags(text: &str) -> String {
    TRAILING_LIST_TAGS.replace(text, "").into_owned()
}

/// `</li>` becomes a comma; leftover `<li>` tags become a space.
pub fn list_items_to_commas(text: &str) -> String {
    let commas = LI_CLOSE.replace_all(text, ",");
    LI_TAG.replace_all(&commas, " ").into_owned()
}

/// A line break ends a sentence, except right after a colon.
pub fn line_breaks_to_sentences(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut last = 0;
    for m in LINE_BREAK.find_iter(text) {
        out.push_str(&text[last..m.start()]);
        if text[..m.start()].ends_with(':') {
            out.push_str(m.as_str());
        } else {
            out.push_str(". ");
        }
        last = m.end();
    }
    out.push_str(&text[last..]);
    out
}

pub fn strip_control_chars(text: &str) -> String {
    let cleaned: String = text
        .chars()
        .filter(|c| !matches!(c, '\t' | '\n' | '\r'))
        .collect();
    cleaned.trim_start().to_string()
}

pub fn strip_tags(text: &str) -> String {
    TAG.replace_all(text, "").trim_start().to_string()
}

/// Runs of spaces (including non-breaking spaces) become one space.
pub fn collapse_spaces(text: &str) -> String {
    SPACES.replace_all(text, " ").into_owned()
}

/// A period directly followed by a non-space character gets a space.
pub fn space_after_period(text: &str) -> String {
    insert_space_after(text, |c, next| {
        c == '.' && next.is_some_and(|n| !n.is_whitespace())
    })
}

pub fn trim_after_final_period(text: &str) -> String {
    let trimmed = text.trim_end();
    if trimmed.ends_with('.') {
        trimmed.to_string()
    } else {
        text.to_string()
    }
}

/// Exactly one space between a period and a following capital letter.
pub fn space_before_capital(text: &str) -> String {
    PERIOD_CAPITAL.replace_all(text, ". $1").into_owned()
}

pub fn no_space_before_period(text: &str) -> String {
    SPACE_PERIOD.replace_all(text, ".").into_owned()
}

pub fn no_space_after_open_paren(text: &str) -> String {
    OPEN_PAREN_SPACE.replace_all(text, "(").into_owned()
}

/// Whitespace after `)` is dropped unless a letter or comma follows, in
/// which case a single whitespace character is kept.
pub fn trim_after_close_paren(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut last = 0;
    for m in CLOSE_PAREN_SPACE.find_iter(text) {
        out.push_str(&text[last..m.start()]);
        out.push(')');
        let followed_by_word = text[m.end()..]
            .chars()
            .next()
            .is_some_and(|c| c.is_ascii_alphabetic() || c == ',');
        if followed_by_word {
            if let Some(ws) = m.as_str().chars().last() {
                out.push(ws);
            }
        }
        last = m.end();
    }
    out.push_str(&text[last..]);
    out
}

pub fn no_space_before_comma(text: &str) -> String {
    SPACE_COMMA.replace_all(text, ",").into_owned()
}

/// A comma not followed by whitespace gets a space, including at the end.
pub fn space_after_comma(text: &str) -> String {
    insert_space_after(text, |c, next| {
        c == ',' && !next.is_some_and(char::is_whitespace)
    })
}

pub fn trailing_period_comma(text: &str) -> String {
    TRAILING_PERIOD_COMMA.replace(text, ".").into_owned()
}

pub fn space_after_close_paren(text: &str) -> String {
    insert_space_after(text, |c, next| {
        c == ')' && next.is_some_and(|n| n.is_ascii_alphabetic())
    })
}

pub fn space_after_colon(text: &str) -> String {
    insert_space_after(text, |c, next| {
        c == ':' && next.is_some_and(|n| !n.is_whitespace())
    })
}

/// Copy `text`, inserting a space after every character for which
/// `needs_space(char, next_char)` holds.
fn insert_space_after(text: &str, needs_space: impl Fn(char, Option<char>) -> bool) -> String {
    let mut out = String::with_capacity(text.len() + 8);
    let mut chars = text.chars().peekable();
    while let Some(c) = chars.next() {
        out.push(c);
        if needs_space(c, chars.peek().copied()) {
            out.push(' ');
        }
    }
    out
}
