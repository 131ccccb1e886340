//! Link extraction plugins and shared URL filtering
//!
//! Extractors are dispatched by Content-Type; each one reads the buffered
//! response body and reports raw asset and outlink strings. Resolution
//! against the base URL and all host/string filtering happen in one place
//! (`UrlFilter`) so every extractor behaves the same way. Extractor
//! failures never fail the item, they only cost the page's links.

mod html;
mod json;
mod m3u8;

pub use html::HtmlExtractor;
pub use json::JsonExtractor;
pub use m3u8::M3u8Extractor;

use thiserror::Error;
use url::Url;

#[derive(Debug, Error)]
pub enum ExtractError {
    #[error("body is not text")]
    NotText,
    #[error("parse error: {0}")]
    Parse(String),
}

/// Raw strings reported by an extractor, before resolution and filtering
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct Extracted {
    pub assets: Vec<String>,
    pub outlinks: Vec<String>,
    /// `<base href>` override for resolving the raw strings, if the page set one
    pub base: Option<String>,
}

/// A Content-Type-specific link extractor
pub trait LinkExtractor: Send + Sync {
    fn name(&self) -> &'static str;

    /// Whether this extractor handles the given Content-Type
    fn matches(&self, content_type: &str) -> bool;

    fn extract(&self, body: &[u8]) -> Result<Extracted, ExtractError>;
}

/// The registered extractors, dispatched in order
pub struct ExtractorSet {
    extractors: Vec<Box<dyn LinkExtractor>>,
}

impl ExtractorSet {
    /// The standard plugin set: HTML, JSON, M3U8
    pub fn standard(capture_alternate_pages: bool) -> Self {
        Self {
            extractors: vec![
                Box::new(HtmlExtractor::new(capture_alternate_pages)),
                Box::new(JsonExtractor::new()),
                Box::new(M3u8Extractor::new()),
            ],
        }
    }

    /// Run the first extractor matching `content_type`, if any
    pub fn dispatch(
        &self,
        content_type: &str,
        body: &[u8],
    ) -> Option<(&'static str, Result<Extracted, ExtractError>)> {
        self.extractors
            .iter()
            .find(|e| e.matches(content_type))
            .map(|e| (e.name(), e.extract(body)))
    }
}

/// Host and substring filtering rules applied to every extracted URL
#[derive(Debug, Clone, Default)]
pub struct UrlFilter {
    pub included_hosts: Vec<String>,
    pub excluded_hosts: Vec<String>,
    pub excluded_strings: Vec<String>,
}

impl UrlFilter {
    /// Resolve raw strings against `base` and apply the filtering rules:
    /// http(s) only, excluded hosts dropped, included hosts retained when
    /// the include list is non-empty, excluded substrings dropped, and
    /// duplicates removed keeping the first occurrence. Idempotent.
    pub fn apply(&self, base: &Url, raw: &[String]) -> Vec<Url> {
        let mut seen = std::collections::HashSet::new();
        let mut out = Vec::new();

        for candidate in raw {
            let trimmed = candidate.trim();
            if trimmed.is_empty() {
                continue;
            }
            let resolved = match base.join(trimmed) {
                Ok(url) => url,
                Err(_) => continue,
            };
            if !matches!(resolved.scheme(), "http" | "https") {
                continue;
            }
            let host = match resolved.host_str() {
                Some(host) => host.to_string(),
                None => continue,
            };
            if self.excluded_hosts.iter().any(|h| h == &host) {
                continue;
            }
            if !self.included_hosts.is_empty() && !self.included_hosts.iter().any(|h| h == &host) {
                continue;
            }
            let as_str = resolved.to_string();
            if self.excluded_strings.iter().any(|s| as_str.contains(s)) {
                continue;
            }
            if seen.insert(as_str) {
                out.push(resolved);
            }
        }

        out
    }
}
