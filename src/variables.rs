//! Per-VU variables: `{{name}}` substitution and JSON-path extraction.
//!
//! Each virtual user owns one [`Variables`] map for the lifetime of its loop.
//! Extraction rules on a step write into it after a successful response, and
//! later requests read from it through `{{name}}` placeholders in the URL,
//! header values, query parameters and body.

use std::collections::HashMap;
use std::sync::LazyLock;

use regex::Regex;
use serde_json::Value;

use crate::config::ExtractionRule;
use crate::error::RequestError;

static PLACEHOLDER: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\{\{\s*([A-Za-z0-9_.\-]+)\s*\}\}").expect("placeholder pattern is valid")
});

/// Values captured by one virtual user, keyed by `saveAs` name.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Variables {
    values: HashMap<String, String>,
}

impl Variables {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.values.get(name).map(String::as_str)
    }

    pub fn insert(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.values.insert(name.into(), value.into());
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Replace every `{{name}}` placeholder in `input`.
    ///
    /// Whitespace inside the braces is ignored. A placeholder naming a
    /// variable this VU has not captured yet is an error; the request is
    /// never sent with a literal placeholder in it.
    pub fn substitute(&self, input: &str) -> Result<String, RequestError> {
        if !input.contains("{{") {
            return Ok(input.to_string());
        }
        let mut out = String::with_capacity(input.len());
        let mut last = 0;
        for caps in PLACEHOLDER.captures_iter(input) {
            let (Some(whole), Some(name)) = (caps.get(0), caps.get(1)) else {
                continue;
            };
            let value = self
                .get(name.as_str())
                .ok_or_else(|| RequestError::InvalidRequest {
                    message: format!("variable '{}' not found", name.as_str()),
                })?;
            out.push_str(&input[last..whole.start()]);
            out.push_str(value);
            last = whole.end();
        }
        out.push_str(&input[last..]);
        Ok(out)
    }

    /// Apply each rule to `body` in order, storing the results.
    ///
    /// Stops at the first failing rule; values captured by earlier rules in
    /// the same response are kept.
    pub fn capture(&mut self, rules: &[ExtractionRule], body: &[u8]) -> Result<(), RequestError> {
        if rules.is_empty() {
            return Ok(());
        }
        let text = String::from_utf8_lossy(body);
        let mut parsed: Option<Value> = None;
        for rule in rules {
            let path = normalize_path(&rule.json_path);
            let value = if path == "$" {
                text.to_string()
            } else {
                let root = match parsed.take() {
                    Some(root) => root,
                    None => parse_body(&text, &rule.json_path)?,
                };
                let value = lookup(&root, &path);
                parsed = Some(root);
                value?
            };
            tracing::trace!(name = %rule.save_as, path = %path, "captured variable");
            self.insert(rule.save_as.clone(), value);
        }
        Ok(())
    }
}

fn parse_body(text: &str, path: &str) -> Result<Value, RequestError> {
    serde_json::from_str(text).map_err(|_| RequestError::Extraction {
        message: format!("response is not valid JSON but path '{path}' was given"),
    })
}

/// Bring a user-supplied path into `$...` form.
///
/// `id` and `.id` both become `$.id`; `$.` means the whole body.
pub fn normalize_path(path: &str) -> String {
    let path = path.trim();
    if path.is_empty() || path == "$" || path == "$." {
        "$".to_string()
    } else if path.starts_with('$') {
        path.to_string()
    } else if path.starts_with('.') || path.starts_with('[') {
        format!("${path}")
    } else {
        format!("$.{path}")
    }
}

#[derive(Debug, PartialEq)]
enum Segment {
    Key(String),
    Index(usize),
}

fn parse_path(path: &str) -> Result<Vec<Segment>, RequestError> {
    let invalid = || RequestError::Extraction {
        message: format!("unsupported path '{path}'"),
    };
    let rest = path.strip_prefix('$').ok_or_else(invalid)?;
    let chars: Vec<char> = rest.chars().collect();
    let mut segments = Vec::new();
    let mut i = 0;
    while i < chars.len() {
        match chars[i] {
            '.' => {
                let start = i + 1;
                let mut end = start;
                while end < chars.len() && chars[end] != '.' && chars[end] != '[' {
                    end += 1;
                }
                let key: String = chars[start..end].iter().collect();
                if key.is_empty() || key == "*" {
                    return Err(invalid());
                }
                segments.push(Segment::Key(key));
                i = end;
            }
            '[' => {
                let close = chars[i..]
                    .iter()
                    .position(|c| *c == ']')
                    .map(|p| p + i)
                    .ok_or_else(invalid)?;
                let inner: String = chars[i + 1..close].iter().collect();
                let inner = inner.trim();
                let quoted = inner
                    .strip_prefix('\'')
                    .and_then(|s| s.strip_suffix('\''))
                    .or_else(|| inner.strip_prefix('"').and_then(|s| s.strip_suffix('"')));
                match quoted {
                    Some(key) => segments.push(Segment::Key(key.to_string())),
                    None => segments.push(Segment::Index(inner.parse().map_err(|_| invalid())?)),
                }
                i = close + 1;
            }
            _ => return Err(invalid()),
        }
    }
    Ok(segments)
}

/// Resolve a normalized path against a parsed document.
///
/// Strings are returned without quotes; every other value as compact JSON.
fn lookup(root: &Value, path: &str) -> Result<String, RequestError> {
    let mut current = root;
    for segment in parse_path(path)? {
        let next = match (&segment, current) {
            (Segment::Key(key), Value::Object(map)) => map.get(key),
            (Segment::Index(idx), Value::Array(items)) => items.get(*idx),
            _ => None,
        };
        current = next.ok_or_else(|| RequestError::Extraction {
            message: format!("path '{path}' not found in response"),
        })?;
    }
    Ok(match current {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    })
}
