//! JSON link extractor
//!
//! Walks a JSON document collecting every string value that parses as an
//! absolute URL. Values with a file extension are treated as assets, the
//! rest as outlinks.

use serde_json::Value;
use url::Url;

use super::{ExtractError, Extracted, LinkExtractor};

pub struct JsonExtractor;

impl JsonExtractor {
    pub fn new() -> Self {
        Self
    }
}

impl Default for JsonExtractor {
    fn default() -> Self {
        Self::new()
    }
}

impl LinkExtractor for JsonExtractor {
    fn name(&self) -> &'static str {
        "json"
    }

    fn matches(&self, content_type: &str) -> bool {
        content_type.to_ascii_lowercase().contains("json")
    }

    fn extract(&self, body: &[u8]) -> Result<Extracted, ExtractError> {
        let value: Value =
            serde_json::from_slice(body).map_err(|e| ExtractError::Parse(e.to_string()))?;

        let mut found = Vec::new();
        walk(&value, &mut found);

        let mut extracted = Extracted::default();
        for url in found {
            if has_file_extension(&url) {
                extracted.assets.push(url);
            } else {
                extracted.outlinks.push(url);
            }
        }
        Ok(extracted)
    }
}

/// Collect URL-shaped strings from a JSON text into `out`.
///
/// Used directly by the HTML extractor for embedded JSON payloads, where a
/// parse failure just means the blob was not JSON after all.
pub(crate) fn urls_from_json(text: &str, out: &mut Vec<String>) {
    if let Ok(value) = serde_json::from_str::<Value>(text) {
        walk(&value, out);
    }
}

fn walk(value: &Value, out: &mut Vec<String>) {
    match value {
        Value::String(s) => {
            if is_absolute_url(s) {
                out.push(s.clone());
            }
        }
        Value::Array(items) => {
            for item in items {
                walk(item, out);
            }
        }
        Value::Object(map) => {
            for item in map.values() {
                walk(item, out);
            }
        }
        _ => {}
    }
}

fn is_absolute_url(s: &str) -> bool {
    if !s.starts_with("http://") && !s.starts_with("https://") {
        return false;
    }
    matches!(Url::parse(s), Ok(url) if url.host_str().is_some())
}

/// True when the URL path's last segment carries a short file extension
fn has_file_extension(raw: &str) -> bool {
    let path_end = raw.find(['?', '#']).unwrap_or(raw.len());
    let path = &raw[..path_end];
    let last_segment = path.rsplit('/').next().unwrap_or("");
    match last_segment.rsplit_once('.') {
        Some((name, ext)) => {
            !name.is_empty()
                && (1..=6).contains(&ext.len())
                && ext.chars().all(|c| c.is_ascii_alphanumeric())
        }
        None => false,
    }
}
