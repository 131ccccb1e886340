//! HTML link extractor
//!
//! Collects page assets (images, media, stylesheets, inline CSS URLs,
//! embedded JSON payloads) and outlinks (anchors) from an HTML document.

use regex::Regex;
use scraper::{Html, Selector};

use super::json::urls_from_json;
use super::{ExtractError, Extracted, LinkExtractor};

pub struct HtmlExtractor {
    capture_alternate_pages: bool,
    base_sel: Option<Selector>,
    img_sel: Option<Selector>,
    video_sel: Option<Selector>,
    video_source_sel: Option<Selector>,
    style_sel: Option<Selector>,
    styled_sel: Option<Selector>,
    json_script_sel: Option<Selector>,
    script_sel: Option<Selector>,
    link_sel: Option<Selector>,
    meta_sel: Option<Selector>,
    data_item_sel: Option<Selector>,
    data_preview_sel: Option<Selector>,
    anchor_sel: Option<Selector>,
    css_url_re: Regex,
}

impl HtmlExtractor {
    pub fn new(capture_alternate_pages: bool) -> Self {
        Self {
            capture_alternate_pages,
            base_sel: Selector::parse("base[href]").ok(),
            img_sel: Selector::parse("img").ok(),
            video_sel: Selector::parse("video[src]").ok(),
            video_source_sel: Selector::parse("video source[src]").ok(),
            style_sel: Selector::parse("style").ok(),
            styled_sel: Selector::parse("[style]").ok(),
            json_script_sel: Selector::parse("script[type='application/json']").ok(),
            script_sel: Selector::parse("script").ok(),
            link_sel: Selector::parse("link[href]").ok(),
            meta_sel: Selector::parse("meta[content]").ok(),
            data_item_sel: Selector::parse("[data-item]").ok(),
            data_preview_sel: Selector::parse("[data-preview]").ok(),
            anchor_sel: Selector::parse("a[href]").ok(),
            // url(...) with optional single or double quotes
            css_url_re: Regex::new(r#"url\(\s*['"]?([^'")]+)['"]?\s*\)"#)
                .expect("css url pattern compiles"),
        }
    }

    fn collect_css_urls(&self, text: &str, out: &mut Vec<String>) {
        for capture in self.css_url_re.captures_iter(text) {
            if let Some(m) = capture.get(1) {
                let url = m.as_str().trim();
                if !url.is_empty() && !url.starts_with("#wp-") && !url.starts_with("data:") {
                    out.push(url.to_string());
                }
            }
        }
    }

    /// Split a srcset value into its candidate URLs
    fn collect_srcset(value: &str, out: &mut Vec<String>) {
        for candidate in value.split(',') {
            if let Some(url) = candidate.trim().split_whitespace().next() {
                if !url.is_empty() {
                    out.push(url.to_string());
                }
            }
        }
    }
}

impl LinkExtractor for HtmlExtractor {
    fn name(&self) -> &'static str {
        "html"
    }

    fn matches(&self, content_type: &str) -> bool {
        let ct = content_type.to_ascii_lowercase();
        ct.contains("text/html") || ct.contains("application/xhtml")
    }

    fn extract(&self, body: &[u8]) -> Result<Extracted, ExtractError> {
        let text = String::from_utf8_lossy(body);
        let doc = Html::parse_document(&text);

        let mut extracted = Extracted::default();
        let assets = &mut extracted.assets;

        if let Some(sel) = &self.base_sel {
            if let Some(base) = doc.select(sel).next().and_then(|el| el.value().attr("href")) {
                extracted.base = Some(base.to_string());
            }
        }

        if let Some(sel) = &self.img_sel {
            for el in doc.select(sel) {
                for attr in ["src", "data-src", "data-lazy-src"] {
                    if let Some(link) = el.value().attr(attr) {
                        assets.push(link.to_string());
                    }
                }
                for attr in ["srcset", "data-srcset"] {
                    if let Some(value) = el.value().attr(attr) {
                        Self::collect_srcset(value, assets);
                    }
                }
            }
        }

        if let Some(sel) = &self.video_sel {
            for el in doc.select(sel) {
                if let Some(link) = el.value().attr("src") {
                    assets.push(link.to_string());
                }
            }
        }
        if let Some(sel) = &self.video_source_sel {
            for el in doc.select(sel) {
                if let Some(link) = el.value().attr("src") {
                    assets.push(link.to_string());
                }
            }
        }

        if let Some(sel) = &self.style_sel {
            for el in doc.select(sel) {
                let css: String = el.text().collect();
                self.collect_css_urls(&css, assets);
            }
        }
        if let Some(sel) = &self.styled_sel {
            for el in doc.select(sel) {
                if let Some(style) = el.value().attr("style") {
                    self.collect_css_urls(style, assets);
                }
            }
        }

        if let Some(sel) = &self.json_script_sel {
            for el in doc.select(sel) {
                let body: String = el.text().collect();
                urls_from_json(&body, assets);
            }
        }

        // Embedded JSON blobs in plain script bodies, located by brace balancing
        if let Some(sel) = &self.script_sel {
            for el in doc.select(sel) {
                if el.value().attr("type").is_some_and(|t| t == "application/json") {
                    continue; // handled above
                }
                let script: String = el.text().collect();
                if !script.contains("http") {
                    continue;
                }
                for candidate in balanced_json_objects(&script) {
                    urls_from_json(candidate, assets);
                }
            }
        }

        if let Some(sel) = &self.link_sel {
            for el in doc.select(sel) {
                let rel_alternate = el.value().attr("rel").is_some_and(|r| {
                    r.split_whitespace().any(|part| part.eq_ignore_ascii_case("alternate"))
                });
                if rel_alternate && !self.capture_alternate_pages {
                    continue;
                }
                if let Some(link) = el.value().attr("href") {
                    assets.push(link.to_string());
                }
            }
        }

        if let Some(sel) = &self.meta_sel {
            for el in doc.select(sel) {
                if let Some(content) = el.value().attr("content") {
                    if content.contains("http") {
                        assets.push(content.to_string());
                    }
                }
            }
        }

        if let Some(sel) = &self.data_item_sel {
            for el in doc.select(sel) {
                if let Some(payload) = el.value().attr("data-item") {
                    urls_from_json(payload, assets);
                }
            }
        }
        if let Some(sel) = &self.data_preview_sel {
            for el in doc.select(sel) {
                if let Some(preview) = el.value().attr("data-preview") {
                    if preview.starts_with("http") {
                        assets.push(preview.to_string());
                    }
                }
            }
        }

        if let Some(sel) = &self.anchor_sel {
            for el in doc.select(sel) {
                if let Some(link) = el.value().attr("href") {
                    extracted.outlinks.push(link.to_string());
                }
            }
        }

        Ok(extracted)
    }
}

/// Find top-level `{...}` spans in a script body, honoring string literals
/// and escapes so braces inside strings don't unbalance the scan.
fn balanced_json_objects(text: &str) -> Vec<&str> {
    let bytes = text.as_bytes();
    let mut objects = Vec::new();
    let mut start = None;
    let mut depth = 0usize;
    let mut in_string = false;
    let mut escaped = false;

    for (i, &b) in bytes.iter().enumerate() {
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
            b'"' if depth > 0 => in_string = true,
            b'{' => {
                if depth == 0 {
                    start = Some(i);
                }
                depth += 1;
            }
            b'}' => {
                if depth > 0 {
                    depth -= 1;
                    if depth == 0 {
                        if let Some(s) = start.take() {
                            objects.push(&text[s..=i]);
                        }
                    }
                }
            }
            _ => {}
        }
    }

    objects
}
