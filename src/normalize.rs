//! Raw document bytes to clean plain text.
//!
//! Normalization decodes the bytes, lifts Markdown front-matter into a
//! metadata map, strips HTML markup and collapses whitespace. It never fails:
//! undecodable bytes fall back to a Latin-1 mapping and empty input yields
//! empty text.

use anyhow::{Context, Result};
use regex::Regex;
use serde::Serialize;
use serde_json::{Map, Number, Value};
use std::path::Path;
use std::sync::LazyLock;

use crate::config::NormalizeConfig;

static FRONTMATTER: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?s)\A---[ \t]*\r?\n(.*?)\r?\n---[ \t]*\r?\n").expect("valid regex"));
static SCRIPT_STYLE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?is)<script\b[^>]*>.*?</script\s*>|<style\b[^>]*>.*?</style\s*>")
        .expect("valid regex")
});
static BREAK_TAG: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)<br\s*/?>|<p\s*>|</p\s*>").expect("valid regex"));
static HR_TAG: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)<hr\s*/?>").expect("valid regex"));
static ANY_TAG: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"<[^>]+>").expect("valid regex"));
static INLINE_SPACE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"[ \t]+").expect("valid regex"));
static EXTRA_NEWLINES: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\n{3,}").expect("valid regex"));

/// Headings after this many lines are not considered as a title.
const TITLE_SCAN_LINES: usize = 10;

/// Entities decoded after tag stripping. `&amp;` goes last so an escaped
/// entity such as `&amp;lt;` decodes once, to `&lt;`.
const ENTITIES: &[(&str, &str)] = &[
    ("&lt;", "<"),
    ("&gt;", ">"),
    ("&quot;", "\""),
    ("&apos;", "'"),
    ("&#39;", "'"),
    ("&#x27;", "'"),
    ("&#x2F;", "/"),
    ("&nbsp;", " "),
    ("&amp;", "&"),
];

#[derive(Debug, Clone, Default, Serialize)]
pub struct NormalizedContent {
    pub text: String,
    pub title: Option<String>,
    /// Parsed front-matter fields.
    pub metadata: Map<String, Value>,
    pub word_count: usize,
    pub char_count: usize,
}

/// A front-matter block split off the top of a document.
#[derive(Debug)]
pub struct Frontmatter<'a> {
    pub fields: Map<String, Value>,
    /// The block between the `---` fences, unparsed.
    pub raw: &'a str,
    /// Everything after the closing fence.
    pub body: &'a str,
}

/// Split a leading `---` fenced block off `text`, if there is one.
pub fn split_frontmatter(text: &str) -> Option<Frontmatter<'_>> {
    let caps = FRONTMATTER.captures(text)?;
    let whole = caps.get(0)?;
    let raw = caps.get(1)?.as_str();
    Some(Frontmatter {
        fields: parse_frontmatter_fields(raw),
        raw,
        body: &text[whole.end()..],
    })
}

/// Front-matter fields of `text`, or an empty map.
pub fn parse_frontmatter(text: &str) -> Map<String, Value> {
    split_frontmatter(text)
        .map(|fm| fm.fields)
        .unwrap_or_default()
}

/// `key: value` lines. Comments and lines without a colon are ignored;
/// values are unquoted and coerced to bool, integer or float when they look
/// like one.
fn parse_frontmatter_fields(raw: &str) -> Map<String, Value> {
    let mut fields = Map::new();
    for line in raw.lines() {
        let line = line.trim();
        if line.starts_with('#') {
            continue;
        }
        let Some((key, value)) = line.split_once(':') else {
            continue;
        };
        let key = key.trim();
        if key.is_empty() {
            continue;
        }
        let value = value.trim().trim_matches(|c| c == '"' || c == '\'');
        fields.insert(key.to_string(), coerce_value(value));
    }
    fields
}

fn coerce_value(value: &str) -> Value {
    match value.to_ascii_lowercase().as_str() {
        "true" => return Value::Bool(true),
        "false" => return Value::Bool(false),
        _ => {}
    }
    if !value.is_empty() && value.bytes().all(|b| b.is_ascii_digit()) {
        if let Ok(n) = value.parse::<i64>() {
            return Value::Number(n.into());
        }
    }
    if value.contains('.') {
        if let Some(n) = value.parse::<f64>().ok().and_then(Number::from_f64) {
            return Value::Number(n);
        }
    }
    Value::String(value.to_string())
}

/// UTF-8 with any BOM removed, or a byte-for-byte Latin-1 reading when the
/// input is not valid UTF-8.
pub fn decode(bytes: &[u8]) -> String {
    let bytes = bytes.strip_prefix(b"\xEF\xBB\xBF").unwrap_or(bytes);
    match std::str::from_utf8(bytes) {
        Ok(s) => s.to_string(),
        Err(_) => bytes.iter().map(|&b| b as char).collect(),
    }
}

pub fn normalize(bytes: &[u8], path_hint: Option<&Path>, config: &NormalizeConfig) -> NormalizedContent {
    let decoded = decode(bytes).replace("\r\n", "\n");

    let (mut content, metadata) = match split_frontmatter(&decoded) {
        Some(fm) => {
            let mut body = fm.body.to_string();
            if config.preserve_frontmatter {
                body.push_str("\n\n--- Metadata ---\n");
                body.push_str(fm.raw);
            }
            (body, fm.fields)
        }
        None => (decoded.clone(), Map::new()),
    };

    content = strip_markup(&content);
    let text = collapse_whitespace(&content);

    let title = metadata
        .get("title")
        .and_then(|v| match v {
            Value::String(s) => Some(s.clone()),
            Value::Null => None,
            other => Some(other.to_string()),
        })
        .filter(|t| !t.is_empty())
        .or_else(|| heading_title(&text))
        .or_else(|| {
            path_hint
                .and_then(|p| p.file_stem())
                .map(|s| s.to_string_lossy().to_string())
        });

    NormalizedContent {
        word_count: text.split_whitespace().count(),
        char_count: text.chars().count(),
        text,
        title,
        metadata,
    }
}

/// Read `path` and normalize its contents.
pub async fn normalize_file(path: &Path, config: &NormalizeConfig) -> Result<NormalizedContent> {
    let bytes = tokio::fs::read(path)
        .await
        .with_context(|| format!("Failed to read {}", path.display()))?;
    Ok(normalize(&bytes, Some(path), config))
}

fn strip_markup(content: &str) -> String {
    let content = SCRIPT_STYLE.replace_all(content, "");
    let content = BREAK_TAG.replace_all(&content, "\n");
    let content = HR_TAG.replace_all(&content, "\n---\n");
    let mut content = ANY_TAG.replace_all(&content, "").into_owned();
    for (entity, replacement) in ENTITIES {
        if content.contains(entity) {
            content = content.replace(entity, replacement);
        }
    }
    content
}

fn collapse_whitespace(content: &str) -> String {
    let content = INLINE_SPACE.replace_all(content, " ");
    let content = content
        .split('\n')
        .map(str::trim_end)
        .collect::<Vec<_>>()
        .join("\n");
    EXTRA_NEWLINES
        .replace_all(&content, "\n\n")
        .trim()
        .to_string()
}

fn heading_title(text: &str) -> Option<String> {
    text.lines()
        .take(TITLE_SCAN_LINES)
        .map(str::trim)
        .find(|line| line.starts_with('#'))
        .map(|line| line.trim_start_matches('#').trim().to_string())
        .filter(|t| !t.is_empty())
}
