//! URL record carried through the pipeline
//!
//! A `CrawlUrl` accumulates state as it traverses the stages: the raw
//! string set at discovery time, the parsed form set by the preprocessor,
//! and the response plus buffered body set by the archiver. The body is
//! buffered in full so parser dispatch can re-read it any number of times.

use std::io::Cursor;

use bytes::Bytes;
use thiserror::Error;
use url::Url;

/// Errors produced when parsing or validating a URL
#[derive(Debug, Error)]
pub enum UrlError {
    #[error("invalid url '{url}': {reason}")]
    Invalid { url: String, reason: String },
}

impl UrlError {
    pub fn invalid(url: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Invalid {
            url: url.into(),
            reason: reason.into(),
        }
    }
}

/// The slice of an HTTP response the pipeline cares about.
///
/// The full response body lives on the owning `CrawlUrl`, not here.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchedResponse {
    pub status: u16,
    pub content_type: Option<String>,
    pub location: Option<String>,
}

impl FetchedResponse {
    /// True for the redirect status codes the postprocessor expands
    pub fn is_redirect(&self) -> bool {
        matches!(self.status, 301 | 302 | 303 | 307 | 308)
    }
}

/// A URL with its fetch state, hop count and redirect depth
#[derive(Debug, Clone, Default)]
pub struct CrawlUrl {
    raw: String,
    parsed: Option<Url>,
    response: Option<FetchedResponse>,
    body: Option<Bytes>,
    redirects: u8,
    hops: u16,
}

impl CrawlUrl {
    pub fn new(raw: impl Into<String>) -> Self {
        Self {
            raw: raw.into(),
            ..Default::default()
        }
    }

    pub fn with_hops(mut self, hops: u16) -> Self {
        self.hops = hops;
        self
    }

    pub fn with_redirects(mut self, redirects: u8) -> Self {
        self.redirects = redirects;
        self
    }

    pub fn raw(&self) -> &str {
        &self.raw
    }

    /// Parse the raw string, caching the result
    pub fn parse(&mut self) -> Result<&Url, UrlError> {
        if self.parsed.is_none() {
            let parsed = Url::parse(&self.raw)
                .map_err(|e| UrlError::invalid(&self.raw, e.to_string()))?;
            self.parsed = Some(parsed);
        }
        Ok(self.parsed.as_ref().unwrap())
    }

    pub fn parsed(&self) -> Option<&Url> {
        self.parsed.as_ref()
    }

    /// Replace the raw string with a normalized form and cache its parse
    pub fn set_normalized(&mut self, url: Url) {
        self.raw = url.to_string();
        self.parsed = Some(url);
    }

    pub fn host(&self) -> Option<&str> {
        self.parsed.as_ref().and_then(|u| u.host_str())
    }

    pub fn hops(&self) -> u16 {
        self.hops
    }

    pub fn redirects(&self) -> u8 {
        self.redirects
    }

    pub fn set_response(&mut self, response: FetchedResponse) {
        self.response = Some(response);
    }

    pub fn response(&self) -> Option<&FetchedResponse> {
        self.response.as_ref()
    }

    /// The body is set exactly once by the archiver and is read-only after
    pub fn set_body(&mut self, body: Bytes) {
        self.body = Some(body);
    }

    pub fn body(&self) -> Option<&Bytes> {
        self.body.as_ref()
    }

    /// A fresh rewindable reader over the buffered body
    pub fn body_reader(&self) -> Option<Cursor<Bytes>> {
        self.body.as_ref().map(|b| Cursor::new(b.clone()))
    }
}
