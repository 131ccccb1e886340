//! M3U8 playlist extractor
//!
//! Enumerates segment URIs from media playlists and variant URIs plus
//! their alternative renditions (`URI="..."` attributes) from master
//! playlists. Everything found is an asset.

use super::{ExtractError, Extracted, LinkExtractor};

pub struct M3u8Extractor;

impl M3u8Extractor {
    pub fn new() -> Self {
        Self
    }
}

impl Default for M3u8Extractor {
    fn default() -> Self {
        Self::new()
    }
}

impl LinkExtractor for M3u8Extractor {
    fn name(&self) -> &'static str {
        "m3u8"
    }

    fn matches(&self, content_type: &str) -> bool {
        let ct = content_type.to_ascii_lowercase();
        ct.contains("application/vnd.apple.mpegurl") || ct.contains("application/x-mpegurl")
    }

    fn extract(&self, body: &[u8]) -> Result<Extracted, ExtractError> {
        let text = std::str::from_utf8(body).map_err(|_| ExtractError::NotText)?;
        if !text.trim_start().starts_with("#EXTM3U") {
            return Err(ExtractError::Parse("missing #EXTM3U header".to_string()));
        }

        let mut extracted = Extracted::default();
        for line in text.lines() {
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            if let Some(tag) = line.strip_prefix('#') {
                // Alternative renditions and I-frame streams carry their
                // playlist in a URI attribute
                if tag.starts_with("EXT-X-MEDIA") || tag.starts_with("EXT-X-I-FRAME-STREAM-INF") {
                    if let Some(uri) = attribute_uri(tag) {
                        extracted.assets.push(uri);
                    }
                }
                continue;
            }
            // Bare lines are segment URIs (media) or variant URIs (master)
            extracted.assets.push(line.to_string());
        }

        Ok(extracted)
    }
}

fn attribute_uri(tag: &str) -> Option<String> {
    let start = tag.find("URI=\"")? + "URI=\"".len();
    let rest = &tag[start..];
    let end = rest.find('"')?;
    let uri = &rest[..end];
    (!uri.is_empty()).then(|| uri.to_string())
}
