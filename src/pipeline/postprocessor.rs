//! Postprocessor stage: redirect expansion and link extraction
//!
//! Decides what an archived item produces next. A redirect response grows
//! the redirection chain (until `max_redirect`); a 200 response is handed
//! to the Content-Type extractors, whose assets become children riding
//! the same item and whose outlinks become new root items for the work
//! source. Items whose children all came back captured are completed.
//! Extractor failures never fail the item.

use std::sync::Arc;

use tokio::sync::{broadcast, mpsc, Semaphore};
use tokio::task::JoinSet;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::extractors::{ExtractorSet, UrlFilter};
use crate::models::{CrawlUrl, Item, ItemKind, ItemStatus};
use crate::pause::PauseController;
use crate::stats::CrawlStats;

use super::StageHandle;

/// Crawl-scope knobs the postprocessor needs
#[derive(Clone)]
pub struct PostprocessorConfig {
    pub max_hops: u16,
    pub max_redirect: u8,
    pub domains_crawl: bool,
    pub disable_assets_capture: bool,
    pub capture_alternate_pages: bool,
    pub filter: UrlFilter,
}

pub struct Postprocessor {
    config: PostprocessorConfig,
    extractors: ExtractorSet,
}

impl Postprocessor {
    pub fn start(
        mut input: mpsc::Receiver<Item>,
        output: mpsc::Sender<Item>,
        config: PostprocessorConfig,
        stats: Arc<CrawlStats>,
        pause: Arc<PauseController>,
        workers: usize,
    ) -> StageHandle {
        let (shutdown_tx, mut shutdown_rx) = broadcast::channel(1);
        let extractors = ExtractorSet::standard(config.capture_alternate_pages);
        let stage = Arc::new(Self { config, extractors });
        let guard = Arc::new(Semaphore::new(workers.max(1)));
        let mut pause_sub = pause.subscribe();

        let task = tokio::spawn(async move {
            let mut tasks: JoinSet<()> = JoinSet::new();
            loop {
                tokio::select! {
                    _ = shutdown_rx.recv() => {
                        while tasks.join_next().await.is_some() {}
                        break;
                    }
                    _ = pause_sub.wait_for_pause() => {
                        pause_sub.ack_and_wait_resume().await;
                    }
                    maybe_item = input.recv() => {
                        let Some(mut item) = maybe_item else {
                            while tasks.join_next().await.is_some() {}
                            break;
                        };
                        let permit = guard.clone().acquire_owned().await.expect("stage guard");
                        let stage = stage.clone();
                        let output = output.clone();
                        let stats = stats.clone();
                        tasks.spawn(async move {
                            let _permit = permit;
                            stats.postprocessor_routines.inc();
                            if !item.status().is_terminal() {
                                stage.postprocess(&mut item);
                            } else {
                                debug!(item = %item.short_id(), status = item.status().as_str(), "skipping item");
                            }
                            if output.send(item).await.is_err() {
                                warn!("postprocessor output channel closed");
                            }
                            stats.postprocessor_routines.dec();
                        });
                        while tasks.try_join_next().is_some() {}
                    }
                }
            }
            debug!("postprocessor shut down");
        });

        StageHandle::new("postprocessor", shutdown_tx, task)
    }

    #[cfg(test)]
    fn new(config: PostprocessorConfig) -> Self {
        let extractors = ExtractorSet::standard(config.capture_alternate_pages);
        Self { config, extractors }
    }

    fn postprocess(&self, item: &mut Item) {
        // A feedback pass that captured the attached children closes out
        // the whole tree
        if !item.children().is_empty() {
            self.complete_children(item);
            return;
        }

        // The node whose response we interpret: the end of the redirection
        // chain, or the item itself
        let (status, location, redirects) = {
            let target = item.deepest_redirection().unwrap_or(item);
            match target.url().response() {
                Some(response) => (
                    response.status,
                    response.location.clone(),
                    target.url().redirects(),
                ),
                None => {
                    debug!(item = %item.short_id(), "item not archived, skipping");
                    return;
                }
            }
        };

        if matches!(status, 301 | 302 | 303 | 307 | 308) {
            self.expand_redirect(item, location, redirects);
            return;
        }

        if status == 200 {
            self.extract_links(item);
        }

        if !matches!(
            item.status(),
            ItemStatus::GotChildren | ItemStatus::GotRedirected
        ) {
            item.set_status(ItemStatus::Completed);
        }
    }

    /// Children were captured on this pass; mark the tree done
    fn complete_children(&self, item: &mut Item) {
        for child in item.children_mut() {
            if child.status() == ItemStatus::Captured {
                child.set_status(ItemStatus::Completed);
            }
        }
        item.set_status(ItemStatus::PostProcessed);
        debug!(item = %item.short_id(), children = item.children().len(), "children pass complete");
    }

    fn expand_redirect(&self, item: &mut Item, location: Option<String>, redirects: u8) {
        if redirects >= self.config.max_redirect {
            warn!(item = %item.short_id(), max = self.config.max_redirect, "max redirects reached");
            item.set_status(ItemStatus::Completed);
            return;
        }

        let Some(location) = location else {
            warn!(item = %item.short_id(), "redirect without Location header");
            item.set_status(ItemStatus::Completed);
            return;
        };

        let (parent_raw, hops) = {
            let target = item.deepest_redirection().unwrap_or(item);
            (target.url().raw().to_string(), target.url().hops())
        };

        let next = Item::new(
            Uuid::new_v4(),
            CrawlUrl::new(location).with_redirects(redirects + 1).with_hops(hops),
            Some(parent_raw),
            ItemKind::Seed,
        );

        match item.deepest_redirection_mut() {
            Some(tail) => tail.set_redirection(next),
            None => item.set_redirection(next),
        }
        item.set_status(ItemStatus::GotRedirected);
        debug!(item = %item.short_id(), depth = item.redirection_depth(), "redirect expanded");
    }

    fn extract_links(&self, item: &mut Item) {
        let (content_type, body, base_url, hops, target_raw) = {
            let target = item.deepest_redirection().unwrap_or(item);
            let Some(response) = target.url().response() else {
                return;
            };
            let Some(body) = target.url().body() else {
                return;
            };
            let Some(base) = target.url().parsed() else {
                return;
            };
            (
                response.content_type.clone().unwrap_or_default(),
                body.clone(),
                base.clone(),
                target.url().hops(),
                target.url().raw().to_string(),
            )
        };

        let Some((extractor, result)) = self.extractors.dispatch(&content_type, &body) else {
            debug!(item = %item.short_id(), content_type = %content_type, "no extractor for content type");
            return;
        };

        let extracted = match result {
            Ok(extracted) => extracted,
            Err(e) => {
                warn!(item = %item.short_id(), extractor, error = %e, "extractor failed");
                return;
            }
        };

        // An in-page <base href> rebases every relative link
        let effective_base = extracted
            .base
            .as_deref()
            .and_then(|b| base_url.join(b).ok())
            .unwrap_or(base_url);

        if !self.config.disable_assets_capture {
            for url in self.config.filter.apply(&effective_base, &extracted.assets) {
                // assets ride at the parent's hop distance
                let mut child_url = CrawlUrl::new(url.to_string()).with_hops(hops);
                child_url.set_normalized(url);
                item.add_child(Item::new(
                    Uuid::new_v4(),
                    child_url,
                    Some(target_raw.clone()),
                    ItemKind::Asset,
                ));
            }
        }

        let follow_outlinks = self.config.domains_crawl || hops < self.config.max_hops;
        if follow_outlinks {
            for url in self.config.filter.apply(&effective_base, &extracted.outlinks) {
                let mut link_url = CrawlUrl::new(url.to_string()).with_hops(hops + 1);
                link_url.set_normalized(url);
                item.add_outlink(Item::new(
                    Uuid::new_v4(),
                    link_url,
                    Some(target_raw.clone()),
                    ItemKind::Seed,
                ));
            }
        }

        if !item.children().is_empty() {
            item.set_status(ItemStatus::GotChildren);
        }
        debug!(
            item = %item.short_id(),
            extractor,
            assets = item.children().len(),
            outlinks = item.outlinks().len(),
            "extraction done"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::FetchedResponse;
    use bytes::Bytes;

    fn config() -> PostprocessorConfig {
        PostprocessorConfig {
            max_hops: 1,
            max_redirect: 5,
            domains_crawl: false,
            disable_assets_capture: false,
            capture_alternate_pages: false,
            filter: UrlFilter::default(),
        }
    }

    fn archived_item(url: &str, status: u16, content_type: &str, body: &[u8]) -> Item {
        let mut item = Item::seed(url);
        item.url_mut().parse().unwrap();
        item.url_mut().set_response(FetchedResponse {
            status,
            content_type: Some(content_type.to_string()),
            location: None,
        });
        item.url_mut().set_body(Bytes::copy_from_slice(body));
        item.set_status(ItemStatus::Archived);
        item
    }

    #[test]
    fn html_page_produces_children_and_outlinks() {
        let stage = Postprocessor::new(config());
        let mut item = archived_item(
            "http://example.com/",
            200,
            "text/html",
            br#"<img src="/a.png"><a href="/b">b</a>"#,
        );

        stage.postprocess(&mut item);

        assert_eq!(item.status(), ItemStatus::GotChildren);
        assert_eq!(item.children().len(), 1);
        assert_eq!(item.children()[0].url().raw(), "http://example.com/a.png");
        assert_eq!(item.children()[0].kind(), ItemKind::Asset);
        assert_eq!(item.children()[0].url().hops(), 0);

        assert_eq!(item.outlinks().len(), 1);
        assert_eq!(item.outlinks()[0].url().raw(), "http://example.com/b");
        assert_eq!(item.outlinks()[0].url().hops(), 1);
    }

    #[test]
    fn outlinks_respect_max_hops() {
        let stage = Postprocessor::new(config());
        let mut item = archived_item(
            "http://example.com/deep",
            200,
            "text/html",
            br#"<a href="/deeper">x</a><img src="/pic.png">"#,
        );
        // already at the hop limit
        let mut url = CrawlUrl::new("http://example.com/deep").with_hops(1);
        url.parse().unwrap();
        url.set_response(item.url().response().unwrap().clone());
        url.set_body(item.url().body().unwrap().clone());
        *item.url_mut() = url;

        stage.postprocess(&mut item);

        assert!(item.outlinks().is_empty(), "hop limit must gate outlinks");
        assert_eq!(item.children().len(), 1, "assets are still captured");
    }

    #[test]
    fn domains_crawl_overrides_hop_limit() {
        let mut cfg = config();
        cfg.domains_crawl = true;
        cfg.max_hops = 0;
        let stage = Postprocessor::new(cfg);
        let mut item = archived_item(
            "http://example.com/",
            200,
            "text/html",
            br#"<a href="/next">x</a>"#,
        );

        stage.postprocess(&mut item);
        assert_eq!(item.outlinks().len(), 1);
    }

    #[test]
    fn redirect_attaches_chain_node() {
        let stage = Postprocessor::new(config());
        let mut item = Item::seed("http://r.example/1");
        item.url_mut().parse().unwrap();
        item.url_mut().set_response(FetchedResponse {
            status: 302,
            content_type: None,
            location: Some("/2".to_string()),
        });
        item.set_status(ItemStatus::Archived);

        stage.postprocess(&mut item);

        assert_eq!(item.status(), ItemStatus::GotRedirected);
        let target = item.deepest_redirection().unwrap();
        assert_eq!(target.url().raw(), "/2");
        assert_eq!(target.url().redirects(), 1);
        assert_eq!(target.parent_url(), Some("http://r.example/1"));
    }

    #[test]
    fn max_redirect_completes_item() {
        let stage = Postprocessor::new(PostprocessorConfig {
            max_redirect: 3,
            ..config()
        });

        let mut item = Item::seed("http://r.example/1");
        item.url_mut().parse().unwrap();

        // Build a chain already at the limit
        let mut tail = Item::new(
            Uuid::new_v4(),
            CrawlUrl::new("http://r.example/4").with_redirects(3),
            Some("http://r.example/3".to_string()),
            ItemKind::Seed,
        );
        tail.url_mut().parse().unwrap();
        tail.url_mut().set_response(FetchedResponse {
            status: 302,
            content_type: None,
            location: Some("/5".to_string()),
        });
        item.set_redirection(tail);
        item.set_status(ItemStatus::Archived);

        stage.postprocess(&mut item);

        assert_eq!(item.status(), ItemStatus::Completed);
        assert_eq!(item.redirection_depth(), 1, "no further node attached");
    }

    #[test]
    fn children_pass_completes_tree() {
        let stage = Postprocessor::new(config());
        let mut item = archived_item("http://example.com/", 200, "text/html", b"<html/>");
        item.set_status(ItemStatus::GotChildren);

        let mut captured = Item::new(
            Uuid::new_v4(),
            CrawlUrl::new("http://example.com/a.png"),
            Some("http://example.com/".to_string()),
            ItemKind::Asset,
        );
        captured.url_mut().set_response(FetchedResponse {
            status: 200,
            content_type: Some("image/png".to_string()),
            location: None,
        });
        captured.set_status(ItemStatus::Captured);
        item.add_child(captured);

        let mut failed = Item::new(
            Uuid::new_v4(),
            CrawlUrl::new("http://example.com/b.png"),
            Some("http://example.com/".to_string()),
            ItemKind::Asset,
        );
        failed.set_status(ItemStatus::Failed);
        item.add_child(failed);

        stage.postprocess(&mut item);

        assert_eq!(item.status(), ItemStatus::PostProcessed);
        assert_eq!(item.children()[0].status(), ItemStatus::Completed);
        assert_eq!(item.children()[1].status(), ItemStatus::Failed);
    }

    #[test]
    fn non_html_completes_without_children() {
        let stage = Postprocessor::new(config());
        let mut item = archived_item("http://example.com/x.bin", 200, "application/octet-stream", b"\x00\x01");
        stage.postprocess(&mut item);
        assert_eq!(item.status(), ItemStatus::Completed);
        assert!(item.children().is_empty());
    }

    #[test]
    fn error_status_completes_item() {
        let stage = Postprocessor::new(config());
        let mut item = archived_item("http://example.com/missing", 404, "text/html", b"gone");
        stage.postprocess(&mut item);
        assert_eq!(item.status(), ItemStatus::Completed);
    }

    #[test]
    fn base_tag_rebases_links() {
        let stage = Postprocessor::new(config());
        let mut item = archived_item(
            "http://example.com/page",
            200,
            "text/html",
            br#"<base href="http://cdn.example.com/root/"><img src="a.png">"#,
        );

        stage.postprocess(&mut item);
        assert_eq!(
            item.children()[0].url().raw(),
            "http://cdn.example.com/root/a.png"
        );
    }

    #[test]
    fn json_body_is_dispatched() {
        let stage = Postprocessor::new(config());
        let mut item = archived_item(
            "http://example.com/api",
            200,
            "application/json",
            br#"{"img": "http://example.com/a.png", "page": "http://example.com/about"}"#,
        );

        stage.postprocess(&mut item);
        assert_eq!(item.children().len(), 1);
        assert_eq!(item.outlinks().len(), 1);
    }
}
