//! Turning generated text into structured values.
//!
//! Generators are asked for JSON, markdown sections (`## Heading`) or
//! `Label: N` score lines. These helpers pull those shapes out of free text;
//! any failure is a [`ParseError`], which classifies as malformed output.

use std::collections::BTreeMap;
use std::sync::LazyLock;

use regex::Regex;
use serde::de::DeserializeOwned;
use serde_json::Value;

use crate::error::ParseError;

static FENCED_JSON: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?s)```(?:json|JSON)?[ \t]*\n(.*?)```").expect("valid regex"));

static HEADING: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?m)^##[ \t]+(.+?)[ \t]*#*[ \t]*$").expect("valid regex"));

static SCORE_LINE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?m)^[ \t]*(?:[-*][ \t]+)?\**([A-Za-z][A-Za-z &/-]*?)\**[ \t]*:[ \t*]*(\d{1,3})[ \t*]*(?:/[ \t]*\d+)?[ \t]*$")
        .expect("valid regex")
});

static BULLET: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[ \t]*(?:[-*+]|\d+[.)])[ \t]+(.+?)[ \t]*$").expect("valid regex"));

/// Extract the JSON payload of a response: the first fenced block if there is
/// one, otherwise the outermost `{…}` or `[…]` span.
pub fn extract_json(text: &str, context: &str) -> Result<Value, ParseError> {
    if let Some(captures) = FENCED_JSON.captures(text) {
        let body = captures.get(1).map_or("", |m| m.as_str()).trim();
        return serde_json::from_str(body).map_err(|source| ParseError::InvalidJson {
            context: context.to_string(),
            source,
        });
    }

    let start = text.find(['{', '[']).ok_or_else(|| ParseError::MissingJson {
        context: context.to_string(),
    })?;
    let closer = if text[start..].starts_with('{') { '}' } else { ']' };
    let end = text.rfind(closer).filter(|&end| end > start).ok_or_else(|| {
        ParseError::MissingJson {
            context: context.to_string(),
        }
    })?;

    serde_json::from_str(&text[start..=end]).map_err(|source| ParseError::InvalidJson {
        context: context.to_string(),
        source,
    })
}

/// [`extract_json`] followed by deserialization into `T`.
pub fn extract_json_as<T: DeserializeOwned>(text: &str, context: &str) -> Result<T, ParseError> {
    let value = extract_json(text, context)?;
    serde_json::from_value(value).map_err(|source| ParseError::InvalidJson {
        context: context.to_string(),
        source,
    })
}

/// All `## Heading` sections in order, with their trimmed bodies.
pub fn sections(text: &str) -> Vec<(String, String)> {
    let headings: Vec<_> = HEADING.captures_iter(text).collect();
    let mut out = Vec::with_capacity(headings.len());

    for (i, captures) in headings.iter().enumerate() {
        let (Some(whole), Some(title)) = (captures.get(0), captures.get(1)) else {
            continue;
        };
        let body_end = headings
            .get(i + 1)
            .and_then(|next| next.get(0))
            .map_or(text.len(), |m| m.start());
        out.push((
            title.as_str().trim().to_string(),
            text[whole.end()..body_end].trim().to_string(),
        ));
    }
    out
}

/// Body of the section whose heading matches `heading` (case-insensitive).
pub fn section(text: &str, heading: &str, context: &str) -> Result<String, ParseError> {
    sections(text)
        .into_iter()
        .find(|(title, _)| title.eq_ignore_ascii_case(heading))
        .map(|(_, body)| body)
        .filter(|body| !body.is_empty())
        .ok_or_else(|| ParseError::MissingSection {
            heading: heading.to_string(),
            context: context.to_string(),
        })
}

/// Every `Label: N` line, keyed by lowercased label. Later lines win.
pub fn scores(text: &str) -> BTreeMap<String, u32> {
    SCORE_LINE
        .captures_iter(text)
        .filter_map(|c| {
            let label = c.get(1)?.as_str().trim().to_lowercase();
            let value = c.get(2)?.as_str().parse().ok()?;
            Some((label, value))
        })
        .collect()
}

/// The score for `label`, required to be within `0..=max`.
pub fn score(text: &str, label: &str, max: u32, context: &str) -> Result<u32, ParseError> {
    let value = scores(text)
        .get(&label.to_lowercase())
        .copied()
        .ok_or_else(|| ParseError::MissingField {
            field: label.to_string(),
            context: context.to_string(),
        })?;
    if value > max {
        return Err(ParseError::OutOfRange {
            field: label.to_string(),
            value: value.to_string(),
        });
    }
    Ok(value)
}

/// Bullet or numbered list items.
pub fn bullets(text: &str) -> Vec<String> {
    text.lines()
        .filter_map(|line| BULLET.captures(line))
        .filter_map(|c| c.get(1).map(|m| m.as_str().to_string()))
        .collect()
}
