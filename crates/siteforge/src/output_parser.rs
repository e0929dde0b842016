//! Generation output parser
//!
//! The engine is asked for a fenced-JSON payload but real completions
//! arrive malformed in predictable ways: wrapped in prose, truncated
//! mid-object, or with no JSON at all. Parsing runs an explicit
//! ordered list of fallback strategies; the first one that yields at
//! least one file wins, and total failure preserves the raw output
//! for diagnostics.

use std::collections::BTreeMap;

use regex::Regex;
use tracing::{debug, warn};

use crate::error::{ForgeError, ForgeResult};

/// Parsed files, path → content. BTreeMap keeps iteration
/// deterministic for callers and tests.
pub type GeneratedFileSet = BTreeMap<String, String>;

struct Strategy {
    name: &'static str,
    parse: fn(&str) -> Option<GeneratedFileSet>,
}

const STRATEGIES: &[Strategy] = &[
    Strategy {
        name: "fenced_json",
        parse: parse_fenced_json,
    },
    Strategy {
        name: "largest_object",
        parse: parse_largest_object,
    },
    Strategy {
        name: "truncation_repair",
        parse: parse_truncated,
    },
    Strategy {
        name: "path_content_regex",
        parse: parse_path_content_pairs,
    },
];

/// Parse engine output into a file set, trying each strategy in order
pub fn parse_generated_files(raw: &str) -> ForgeResult<GeneratedFileSet> {
    for strategy in STRATEGIES {
        match (strategy.parse)(raw) {
            Some(files) if !files.is_empty() => {
                debug!(strategy = strategy.name, files = files.len(), "Parsed generation output");
                return Ok(files);
            }
            _ => {
                debug!(strategy = strategy.name, "Parse strategy yielded nothing, falling back");
            }
        }
    }

    warn!(bytes = raw.len(), "All parse strategies failed on generation output");
    Err(ForgeError::GenerationParse {
        reason: "no strategy produced any files".to_string(),
        raw_output: raw.to_string(),
    })
}

/// Pull the file map out of a parsed JSON value. Accepts the
/// `codeFiles`/`files` envelope as either a path→content map or a
/// list of {path, content} objects.
fn extract_files(value: &serde_json::Value) -> Option<GeneratedFileSet> {
    let container = value
        .get("codeFiles")
        .or_else(|| value.get("files"))
        .unwrap_or(value);

    let mut files = GeneratedFileSet::new();
    match container {
        serde_json::Value::Object(map) => {
            for (path, content) in map {
                if let serde_json::Value::String(content) = content {
                    if looks_like_path(path) {
                        files.insert(path.clone(), content.clone());
                    }
                }
            }
        }
        serde_json::Value::Array(items) => {
            for item in items {
                let path = item.get("path").and_then(|p| p.as_str());
                let content = item.get("content").and_then(|c| c.as_str());
                if let (Some(path), Some(content)) = (path, content) {
                    if looks_like_path(path) {
                        files.insert(path.to_string(), content.to_string());
                    }
                }
            }
        }
        _ => return None,
    }

    if files.is_empty() {
        None
    } else {
        Some(files)
    }
}

fn looks_like_path(candidate: &str) -> bool {
    !candidate.is_empty()
        && candidate.len() < 300
        && !candidate.contains(char::is_whitespace)
        && candidate.contains('.')
}

/// Tier 1: a ```json fenced block
fn parse_fenced_json(raw: &str) -> Option<GeneratedFileSet> {
    let after_open = raw.split("```json").nth(1).or_else(|| {
        // Bare fence with a JSON body also counts
        raw.split("```").nth(1).filter(|s| s.trim_start().starts_with('{'))
    })?;
    let body = after_open.split("```").next()?.trim();
    let value: serde_json::Value = serde_json::from_str(body).ok()?;
    extract_files(&value)
}

/// Tier 2: largest brace-balanced object anywhere in the text
fn parse_largest_object(raw: &str) -> Option<GeneratedFileSet> {
    let bytes = raw.as_bytes();
    let mut best: Option<&str> = None;

    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'{' {
            if let Some(end) = matching_brace(raw, i) {
                let candidate = &raw[i..=end];
                if best.map_or(true, |b| candidate.len() > b.len()) {
                    best = Some(candidate);
                }
                // Skip past this object; nested objects are already
                // covered by the outer span
                i = end + 1;
                continue;
            }
        }
        i += 1;
    }

    let value: serde_json::Value = serde_json::from_str(best?).ok()?;
    extract_files(&value)
}

/// Index of the brace closing the one at `start`, honoring strings
/// and escapes. None when the object never closes.
fn matching_brace(text: &str, start: usize) -> Option<usize> {
    let bytes = text.as_bytes();
    let mut depth = 0usize;
    let mut in_string = false;
    let mut escaped = false;

    for (i, &b) in bytes.iter().enumerate().skip(start) {
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
        match b {
            b'"' => in_string = true,
            b'{' => depth += 1,
            b'}' => {
                depth -= 1;
                if depth == 0 {
                    return Some(i);
                }
            }
            _ => {}
        }
    }
    None
}

/// Tier 3: heuristically close a truncated object by trimming to the
/// last complete "key": "value" field and appending the missing
/// closers.
fn parse_truncated(raw: &str) -> Option<GeneratedFileSet> {
    let start = raw.find('{')?;
    let body = &raw[start..];

    // Walk to the last position where a string VALUE ends cleanly. A
    // string is a value when the preceding non-whitespace character
    // was a colon; cutting after a bare key would leave invalid JSON.
    let mut last_complete: Option<usize> = None;
    let bytes = body.as_bytes();
    let mut in_string = false;
    let mut escaped = false;
    let mut string_is_value = false;
    let mut prev_nonws = 0u8;
    for (i, &b) in bytes.iter().enumerate() {
        if in_string {
            if escaped {
                escaped = false;
            } else if b == b'\\' {
                escaped = true;
            } else if b == b'"' {
                in_string = false;
                prev_nonws = b'"';
                if string_is_value {
                    last_complete = Some(i);
                }
            }
            continue;
        }
        if b == b'"' {
            in_string = true;
            string_is_value = prev_nonws == b':';
        }
        if !b.is_ascii_whitespace() {
            prev_nonws = b;
        }
    }

    let cut = last_complete?;
    let prefix = &body[..=cut];

    // Close whatever braces the prefix left open
    let mut open = 0usize;
    let mut in_string = false;
    let mut escaped = false;
    for &b in prefix.as_bytes() {
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
        match b {
            b'"' => in_string = true,
            b'{' => open += 1,
            b'}' => open = open.saturating_sub(1),
            _ => {}
        }
    }

    let mut repaired = prefix.to_string();
    repaired.extend(std::iter::repeat('}').take(open));

    let value: serde_json::Value = serde_json::from_str(&repaired).ok()?;
    extract_files(&value)
}

/// Tier 4: regex-extract "path": "content" pairs straight from the
/// raw text. Last resort for payloads with no parseable JSON object.
fn parse_path_content_pairs(raw: &str) -> Option<GeneratedFileSet> {
    // Keys that look like relative file paths with an extension
    let re = Regex::new(r#""([A-Za-z0-9_./-]+\.[A-Za-z0-9]+)"\s*:\s*("(?:[^"\\]|\\.)*")"#)
        .expect("static regex");

    let mut files = GeneratedFileSet::new();
    for caps in re.captures_iter(raw) {
        let path = caps[1].to_string();
        // The quoted capture is valid JSON string syntax; reuse
        // serde_json to decode its escapes
        if let Ok(serde_json::Value::String(content)) = serde_json::from_str(&caps[2]) {
            files.insert(path, content);
        }
    }

    if files.is_empty() {
        None
    } else {
        Some(files)
    }
}
