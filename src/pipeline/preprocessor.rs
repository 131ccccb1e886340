//! Preprocessor stage: URL validation, normalization, and seencheck
//!
//! Fresh items get their own URL validated and normalized; feedback items
//! get each child and the pending redirection target validated against
//! their parent, dropping whatever fails. With the local seencheck active
//! (and HQ inactive) already-seen URLs are filtered out here.

use std::collections::HashSet;
use std::sync::Arc;

use tokio::sync::{broadcast, mpsc, Semaphore};
use tokio::task::JoinSet;
use tracing::{debug, error, warn};
use url::Url;

use crate::hq::{HqClient, HqUrl};
use crate::models::{Item, ItemStatus, UrlError};
use crate::pause::{PauseController, PauseSubscription};
use crate::seencheck::Seencheck;
use crate::stats::CrawlStats;

use super::StageHandle;

/// Validate a raw URL, resolving it against `parent` when present.
///
/// Accepts only absolute http(s) URLs with a host and no control
/// characters; returns the normalized form.
pub fn validate_url(raw: &str, parent: Option<&Url>) -> Result<Url, UrlError> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return Err(UrlError::invalid(raw, "empty url"));
    }
    if trimmed.chars().any(char::is_control) {
        return Err(UrlError::invalid(raw, "control character in url"));
    }

    let resolved = match parent {
        Some(base) => base.join(trimmed),
        None => Url::parse(trimmed),
    }
    .map_err(|e| UrlError::invalid(raw, e.to_string()))?;

    if !matches!(resolved.scheme(), "http" | "https") {
        return Err(UrlError::invalid(raw, format!("unsupported scheme '{}'", resolved.scheme())));
    }
    if resolved.host_str().map_or(true, str::is_empty) {
        return Err(UrlError::invalid(raw, "missing host"));
    }

    Ok(resolved)
}

pub struct Preprocessor {
    seencheck: Option<Arc<Seencheck>>,
    /// In HQ mode, child URLs are seenchecked remotely instead
    hq: Option<Arc<dyn HqClient>>,
    stats: Arc<CrawlStats>,
}

impl Preprocessor {
    /// Start the preprocessor loop consuming the reactor's output channel
    pub fn start(
        mut input: mpsc::Receiver<Item>,
        output: mpsc::Sender<Item>,
        seencheck: Option<Arc<Seencheck>>,
        hq: Option<Arc<dyn HqClient>>,
        stats: Arc<CrawlStats>,
        pause: Arc<PauseController>,
        workers: usize,
    ) -> StageHandle {
        let (shutdown_tx, mut shutdown_rx) = broadcast::channel(1);
        let stage = Arc::new(Self {
            seencheck,
            hq,
            stats,
        });
        let guard = Arc::new(Semaphore::new(workers.max(1)));
        let mut pause_sub: PauseSubscription = pause.subscribe();

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
                        // never closed while the stage runs
                        let permit = guard.clone().acquire_owned().await.expect("stage guard");
                        let stage = stage.clone();
                        let output = output.clone();
                        tasks.spawn(async move {
                            let _permit = permit;
                            stage.stats.preprocessor_routines.inc();
                            stage.preprocess(&mut item).await;
                            if output.send(item).await.is_err() {
                                warn!("preprocessor output channel closed");
                            }
                            stage.stats.preprocessor_routines.dec();
                        });
                        // opportunistically reap finished tasks
                        while tasks.try_join_next().is_some() {}
                    }
                }
            }
            debug!("preprocessor shut down");
        });

        StageHandle::new("preprocessor", shutdown_tx, task)
    }

    async fn preprocess(&self, item: &mut Item) {
        if item.status().is_terminal() {
            return;
        }

        if item.status() == ItemStatus::Fresh {
            self.preprocess_fresh(item);
        } else {
            self.preprocess_feedback(item).await;
        }
    }

    fn preprocess_fresh(&self, item: &mut Item) {
        match validate_url(item.url().raw(), None) {
            Ok(url) => item.url_mut().set_normalized(url),
            Err(e) => {
                warn!(item = %item.short_id(), error = %e, "dropping seed with invalid url");
                item.set_status(ItemStatus::Failed);
                return;
            }
        }

        if let Some(seencheck) = &self.seencheck {
            if !item.bypass_seencheck() && seencheck.seen(item.url().raw()) {
                debug!(item = %item.short_id(), url = item.url().raw(), "url already seen, skipping");
                self.stats.seencheck_hits.inc();
                item.set_status(ItemStatus::Completed);
                return;
            }
        }

        item.set_status(ItemStatus::PreProcessed);
    }

    async fn preprocess_feedback(&self, item: &mut Item) {
        // A redirection target attached by the postprocessor still carries
        // the raw Location value; validate it against the redirecting URL.
        // A fully captured chain falls through to the children, if any.
        let pending_redirect = item
            .deepest_redirection()
            .map(|t| (t.needs_capture(), t.url().parsed().is_none()));
        match pending_redirect {
            Some((true, true)) => {
                let (raw, parent) = {
                    let target = item.deepest_redirection().expect("checked above");
                    (
                        target.url().raw().to_string(),
                        target.parent_url().and_then(|p| Url::parse(p).ok()),
                    )
                };
                match validate_url(&raw, parent.as_ref()) {
                    Ok(url) => {
                        if let Some(target) = item.deepest_redirection_mut() {
                            target.url_mut().set_normalized(url);
                        }
                    }
                    Err(e) => {
                        warn!(item = %item.short_id(), error = %e, "dropping invalid redirect target");
                        item.set_status(ItemStatus::Completed);
                    }
                }
                return;
            }
            Some((true, false)) => return,
            _ => {}
        }

        if item.children().is_empty() {
            error!(item = %item.short_id(), "feedback item with nothing to preprocess");
            item.set_status(ItemStatus::Completed);
            return;
        }

        let parent = item.url().parsed().cloned();
        let seencheck = self.seencheck.clone();
        let stats = self.stats.clone();
        let short_id = item.short_id();
        item.children_mut().retain_mut(|child| {
            if !child.needs_capture() {
                return true;
            }
            let valid = match validate_url(child.url().raw(), parent.as_ref()) {
                Ok(url) => {
                    child.url_mut().set_normalized(url);
                    true
                }
                Err(e) => {
                    warn!(item = %short_id, error = %e, "dropping invalid child url");
                    false
                }
            };
            if !valid {
                return false;
            }
            match &seencheck {
                Some(seencheck) if !child.bypass_seencheck() => {
                    if seencheck.seen(child.url().raw()) {
                        debug!(item = %short_id, url = child.url().raw(), "child already seen, skipping");
                        stats.seencheck_hits.inc();
                        false
                    } else {
                        true
                    }
                }
                _ => true,
            }
        });

        self.hq_seencheck_children(item).await;

        // Every child was dropped: nothing left to capture on this pass,
        // and re-extracting would only rediscover the same children
        if item.children().is_empty() {
            item.set_status(ItemStatus::Completed);
        }
    }

    /// Submit child URLs to HQ as asset discoveries with seencheck; HQ
    /// answers with the subset it had not seen, the rest are dropped. An
    /// RPC failure keeps every child rather than losing assets.
    async fn hq_seencheck_children(&self, item: &mut Item) {
        let Some(hq) = &self.hq else { return };
        if item.children().is_empty() {
            return;
        }

        let urls: Vec<HqUrl> = item
            .children()
            .iter()
            .map(|child| HqUrl {
                value: child.url().raw().to_string(),
                via: child.parent_url().unwrap_or_default().to_string(),
                ..Default::default()
            })
            .collect();

        match hq.discovered(urls, "asset", false, true).await {
            Ok(fresh) => {
                let keep: HashSet<String> = fresh.into_iter().map(|u| u.value).collect();
                let before = item.children().len();
                item.children_mut().retain(|c| keep.contains(c.url().raw()));
                let dropped = (before - item.children().len()) as u64;
                if dropped > 0 {
                    debug!(item = %item.short_id(), dropped, "hq seencheck filtered children");
                    self.stats.seencheck_hits.add(dropped);
                }
            }
            Err(e) => {
                warn!(item = %item.short_id(), error = %e, "hq seencheck failed, keeping all children");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{CrawlUrl, ItemKind, ItemSource};
    use tempfile::TempDir;
    use uuid::Uuid;

    #[test]
    fn validate_accepts_absolute_http() {
        let url = validate_url("http://example.com/page", None).unwrap();
        assert_eq!(url.as_str(), "http://example.com/page");
    }

    #[test]
    fn validate_resolves_against_parent() {
        let parent = Url::parse("http://example.com/dir/index.html").unwrap();
        let url = validate_url("../up.png", Some(&parent)).unwrap();
        assert_eq!(url.as_str(), "http://example.com/up.png");

        let url = validate_url("//cdn.example.com/x.js", Some(&parent)).unwrap();
        assert_eq!(url.as_str(), "http://cdn.example.com/x.js");
    }

    #[test]
    fn validate_rejects_bad_input() {
        assert!(validate_url("", None).is_err());
        assert!(validate_url("   ", None).is_err());
        assert!(validate_url("ftp://example.com/file", None).is_err());
        assert!(validate_url("relative/only", None).is_err());
        assert!(validate_url("http://example.com/a\u{0007}b", None).is_err());
        assert!(validate_url("javascript:void(0)", None).is_err());
    }

    fn stage(seencheck: Option<Arc<Seencheck>>) -> Preprocessor {
        Preprocessor {
            seencheck,
            hq: None,
            stats: CrawlStats::shared(),
        }
    }

    #[tokio::test]
    async fn fresh_item_is_normalized() {
        let stage = stage(None);
        let mut item = Item::seed("HTTP://Example.com/page");
        stage.preprocess(&mut item).await;
        assert_eq!(item.status(), ItemStatus::PreProcessed);
        assert_eq!(item.url().raw(), "http://example.com/page");
    }

    #[tokio::test]
    async fn fresh_item_with_bad_url_fails() {
        let stage = stage(None);
        let mut item = Item::seed("not a url at all");
        stage.preprocess(&mut item).await;
        assert_eq!(item.status(), ItemStatus::Failed);
    }

    #[tokio::test]
    async fn duplicate_seed_is_filtered() {
        let dir = TempDir::new().unwrap();
        let seencheck = Arc::new(Seencheck::open(dir.path()).unwrap());
        let stage = stage(Some(seencheck));

        let mut first = Item::seed("http://example.com/page");
        stage.preprocess(&mut first).await;
        assert_eq!(first.status(), ItemStatus::PreProcessed);

        let mut second = Item::seed("http://example.com/page");
        stage.preprocess(&mut second).await;
        assert_eq!(second.status(), ItemStatus::Completed);
        assert_eq!(stage.stats.seencheck_hits.get(), 1);
    }

    #[tokio::test]
    async fn bypass_flag_skips_seencheck() {
        let dir = TempDir::new().unwrap();
        let seencheck = Arc::new(Seencheck::open(dir.path()).unwrap());
        seencheck.seen("http://example.com/page");
        let stage = stage(Some(seencheck));

        let mut item = Item::seed("http://example.com/page");
        item.set_bypass_seencheck(true);
        stage.preprocess(&mut item).await;
        assert_eq!(item.status(), ItemStatus::PreProcessed);
    }

    #[tokio::test]
    async fn invalid_children_are_dropped() {
        let stage = stage(None);
        let mut item = Item::seed("http://example.com/");
        item.url_mut().parse().unwrap();
        item.set_status(ItemStatus::GotChildren);
        item.set_source(ItemSource::Feedback);

        for raw in ["/good.png", "http://\u{0000}bad", "also fine.png"] {
            item.add_child(Item::new(
                Uuid::new_v4(),
                CrawlUrl::new(raw),
                Some("http://example.com/".to_string()),
                ItemKind::Asset,
            ));
        }

        stage.preprocess(&mut item).await;
        let urls: Vec<_> = item.children().iter().map(|c| c.url().raw()).collect();
        assert_eq!(
            urls,
            ["http://example.com/good.png", "http://example.com/also%20fine.png"]
        );
    }

    #[tokio::test]
    async fn losing_every_child_completes_the_item() {
        let dir = TempDir::new().unwrap();
        let seencheck = Arc::new(Seencheck::open(dir.path()).unwrap());
        seencheck.seen("http://example.com/dup.png");
        let stage = stage(Some(seencheck));

        let mut item = Item::seed("http://example.com/");
        item.url_mut().parse().unwrap();
        item.set_status(ItemStatus::GotChildren);
        item.set_source(ItemSource::Feedback);
        item.add_child(Item::new(
            Uuid::new_v4(),
            CrawlUrl::new("http://example.com/dup.png"),
            Some("http://example.com/".to_string()),
            ItemKind::Asset,
        ));

        stage.preprocess(&mut item).await;
        assert!(item.children().is_empty());
        assert_eq!(item.status(), ItemStatus::Completed);
    }

    #[tokio::test]
    async fn hq_seencheck_filters_children() {
        use crate::hq::HqError;

        struct EvenOnlyHq;

        #[async_trait::async_trait]
        impl HqClient for EvenOnlyHq {
            async fn feed(&self, _: usize, _: &str) -> Result<Vec<HqUrl>, HqError> {
                Ok(Vec::new())
            }
            async fn discovered(
                &self,
                urls: Vec<HqUrl>,
                kind: &str,
                _trusted: bool,
                seencheck: bool,
            ) -> Result<Vec<HqUrl>, HqError> {
                assert_eq!(kind, "asset");
                assert!(seencheck);
                Ok(urls
                    .into_iter()
                    .filter(|u| u.value.contains("even"))
                    .collect())
            }
            async fn finished(&self, _: Vec<HqUrl>, _: u64) -> Result<(), HqError> {
                Ok(())
            }
        }

        let stage = Preprocessor {
            seencheck: None,
            hq: Some(Arc::new(EvenOnlyHq)),
            stats: CrawlStats::shared(),
        };

        let mut item = Item::seed("http://example.com/");
        item.url_mut().parse().unwrap();
        item.set_status(ItemStatus::GotChildren);
        item.set_source(ItemSource::Feedback);
        for name in ["even-0.png", "odd-1.png", "even-2.png"] {
            item.add_child(Item::new(
                Uuid::new_v4(),
                CrawlUrl::new(format!("http://example.com/{name}")),
                Some("http://example.com/".to_string()),
                ItemKind::Asset,
            ));
        }

        stage.preprocess(&mut item).await;

        let urls: Vec<_> = item.children().iter().map(|c| c.url().raw()).collect();
        assert_eq!(
            urls,
            ["http://example.com/even-0.png", "http://example.com/even-2.png"]
        );
        assert_eq!(stage.stats.seencheck_hits.get(), 1);
    }

    #[tokio::test]
    async fn redirect_target_is_resolved_against_parent() {
        let stage = stage(None);
        let mut item = Item::seed("http://example.com/start");
        item.url_mut().parse().unwrap();
        item.set_status(ItemStatus::GotRedirected);
        item.set_source(ItemSource::Feedback);
        item.set_redirection(Item::new(
            Uuid::new_v4(),
            CrawlUrl::new("/next").with_redirects(1),
            Some("http://example.com/start".to_string()),
            ItemKind::Seed,
        ));

        stage.preprocess(&mut item).await;
        assert_eq!(
            item.deepest_redirection().unwrap().url().raw(),
            "http://example.com/next"
        );
    }
}
