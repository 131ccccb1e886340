//! Archiver stage: HTTP capture and WARC record submission
//!
//! Fetches every URL an item needs captured (its own URL, the pending
//! redirect target, or its child assets), buffers bodies in memory for
//! the postprocessor, and hands one capture record per response to the
//! WARC sink. Child assets fetch in parallel up to `max_concurrent_assets`,
//! and a per-domain limiter enforces the host concurrency cap plus a fixed
//! delay between consecutive requests to the same host.
//!
//! Redirects are NOT followed here; the postprocessor expands them.

use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use chrono::Utc;
use dashmap::DashMap;
use thiserror::Error;
use tokio::sync::{broadcast, mpsc, Semaphore};
use tokio::task::JoinSet;
use tracing::{debug, warn};

use crate::api::WorkerRegistry;
use crate::models::{FetchedResponse, Item, ItemKind, ItemStatus};
use crate::pause::PauseController;
use crate::stats::CrawlStats;
use crate::warc::{CaptureRecord, SharedSink};

use super::StageHandle;

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("url has no host")]
    NoHost,
}

/// Per-host concurrency cap plus fixed inter-request delay
pub struct DomainLimiter {
    max_per_domain: usize,
    delay: Duration,
    domains: DashMap<String, Arc<DomainSlot>>,
}

struct DomainSlot {
    tokens: Arc<Semaphore>,
    last_request: parking_lot::Mutex<Option<Instant>>,
}

impl DomainLimiter {
    pub fn new(max_per_domain: usize, delay: Duration) -> Self {
        Self {
            max_per_domain: max_per_domain.max(1),
            delay,
            domains: DashMap::new(),
        }
    }

    /// Wait for a slot on `host`, honoring the inter-request delay
    pub async fn acquire(&self, host: &str) -> tokio::sync::OwnedSemaphorePermit {
        let slot = self
            .domains
            .entry(host.to_string())
            .or_insert_with(|| {
                Arc::new(DomainSlot {
                    tokens: Arc::new(Semaphore::new(self.max_per_domain)),
                    last_request: parking_lot::Mutex::new(None),
                })
            })
            .clone();

        // never closed
        let permit = slot.tokens.clone().acquire_owned().await.expect("domain slot");

        if !self.delay.is_zero() {
            loop {
                let wait = {
                    let mut last = slot.last_request.lock();
                    match *last {
                        Some(at) if at.elapsed() < self.delay => Some(self.delay - at.elapsed()),
                        _ => {
                            *last = Some(Instant::now());
                            None
                        }
                    }
                };
                match wait {
                    Some(wait) => tokio::time::sleep(wait).await,
                    None => break,
                }
            }
        }

        permit
    }
}

/// What one fetch produced
struct Fetched {
    response: FetchedResponse,
    body: Bytes,
}

/// Which node of the item tree a fetch belongs to
#[derive(Debug, Clone, Copy)]
enum Target {
    Own,
    Redirection,
    Child(usize),
}

pub struct Archiver {
    client: reqwest::Client,
    limiter: Arc<DomainLimiter>,
    sink: SharedSink,
    stats: Arc<CrawlStats>,
    workers_state: Arc<WorkerRegistry>,
    max_concurrent_assets: usize,
}

impl Archiver {
    #[allow(clippy::too_many_arguments)]
    pub fn start(
        mut input: mpsc::Receiver<Item>,
        output: mpsc::Sender<Item>,
        client: reqwest::Client,
        limiter: Arc<DomainLimiter>,
        sink: SharedSink,
        stats: Arc<CrawlStats>,
        workers_state: Arc<WorkerRegistry>,
        pause: Arc<PauseController>,
        workers: usize,
        max_concurrent_assets: usize,
    ) -> StageHandle {
        let (shutdown_tx, mut shutdown_rx) = broadcast::channel(1);
        let stage = Arc::new(Self {
            client,
            limiter,
            sink,
            stats,
            workers_state,
            max_concurrent_assets: max_concurrent_assets.max(1),
        });
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
                        tasks.spawn(async move {
                            let _permit = permit;
                            stage.stats.archiver_routines.inc();
                            let worker = stage.workers_state.checkout();
                            stage
                                .workers_state
                                .update(worker, "archiving", item.url().raw());
                            if !item.status().is_terminal() {
                                stage.archive(&mut item).await;
                            }
                            if item.status() == ItemStatus::Failed {
                                stage
                                    .workers_state
                                    .record_error(worker, &format!("capture failed: {}", item.url().raw()));
                            }
                            stage.workers_state.release(worker);
                            if output.send(item).await.is_err() {
                                warn!("archiver output channel closed");
                            }
                            stage.stats.archiver_routines.dec();
                        });
                        while tasks.try_join_next().is_some() {}
                    }
                }
            }
            debug!("archiver shut down");
        });

        StageHandle::new("archiver", shutdown_tx, task)
    }

    /// Capture every pending URL of the item tree
    async fn archive(&self, item: &mut Item) {
        let mut targets: Vec<(Target, String)> = Vec::new();

        let redirect_pending = item
            .deepest_redirection()
            .map(Item::needs_capture)
            .unwrap_or(false);

        if redirect_pending {
            let redirection = item.deepest_redirection().expect("checked above");
            targets.push((Target::Redirection, redirection.url().raw().to_string()));
        } else if item.children().iter().any(Item::needs_capture) {
            for (i, child) in item.children().iter().enumerate() {
                if child.needs_capture() {
                    targets.push((Target::Child(i), child.url().raw().to_string()));
                }
            }
        } else if item.needs_capture() {
            targets.push((Target::Own, item.url().raw().to_string()));
        }

        if targets.is_empty() {
            return;
        }

        let asset_guard = Arc::new(Semaphore::new(self.max_concurrent_assets));
        let mut fetches: JoinSet<(Target, Result<Fetched, FetchError>)> = JoinSet::new();

        for (target, url) in targets {
            let client = self.client.clone();
            let guard = asset_guard.clone();
            let permit_host = match url::Url::parse(&url).ok().and_then(|u| u.host_str().map(str::to_string)) {
                Some(host) => host,
                None => {
                    warn!(url = %url, "capture target has no host");
                    continue;
                }
            };
            // per-item parallelism bound
            let permit = guard.acquire_owned().await.expect("asset guard");
            let limiter = self.limiter.clone();
            let sink = self.sink.clone();
            fetches.spawn(async move {
                let _permit = permit;
                let _domain_permit = limiter.acquire(&permit_host).await;
                let result = fetch_one(&client, &sink, &url).await;
                (target, result)
            });
        }

        let mut item_failed = false;
        while let Some(joined) = fetches.join_next().await {
            let Ok((target, result)) = joined else {
                continue;
            };
            match result {
                Ok(fetched) => {
                    let status = fetched.response.status;
                    let node = match target {
                        Target::Own => Some(&mut *item),
                        Target::Redirection => item.deepest_redirection_mut(),
                        Target::Child(i) => item.children_mut().get_mut(i),
                    };
                    let Some(node) = node else { continue };
                    node.url_mut().set_response(fetched.response);
                    node.url_mut().set_body(fetched.body);
                    node.set_status(ItemStatus::Captured);

                    match node.kind() {
                        ItemKind::Seed => self.stats.crawled_seeds.inc(),
                        ItemKind::Asset => self.stats.crawled_assets.inc(),
                    }
                    self.stats.uri_rate.mark();
                    item.incr_locally_crawled();
                    debug!(item = %item.short_id(), url = %node_url(item, target), status, "url archived");
                }
                Err(e) => {
                    self.stats.failed_captures.inc();
                    warn!(item = %item.short_id(), error = %e, "unable to execute request");
                    // Only a failed seed or redirect capture fails the item;
                    // child asset failures just lose the asset
                    match target {
                        Target::Own | Target::Redirection => item_failed = true,
                        Target::Child(i) => {
                            if let Some(child) = item.children_mut().get_mut(i) {
                                child.set_status(ItemStatus::Failed);
                            }
                        }
                    }
                }
            }
        }

        if item_failed {
            item.set_status(ItemStatus::Failed);
        } else {
            item.set_status(ItemStatus::Captured);
            // records for this pass are with the sink now
            item.set_status(ItemStatus::Archived);
        }
    }
}

fn node_url(item: &Item, target: Target) -> String {
    match target {
        Target::Own => item.url().raw().to_string(),
        Target::Redirection => item
            .deepest_redirection()
            .map(|r| r.url().raw().to_string())
            .unwrap_or_default(),
        Target::Child(i) => item
            .children()
            .get(i)
            .map(|c| c.url().raw().to_string())
            .unwrap_or_default(),
    }
}

/// Execute one GET, buffer the body, and submit the capture record
async fn fetch_one(
    client: &reqwest::Client,
    sink: &SharedSink,
    url: &str,
) -> Result<Fetched, FetchError> {
    let response = client.get(url).send().await?;

    let status = response.status().as_u16();
    let content_type = response
        .headers()
        .get(reqwest::header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);
    let location = response
        .headers()
        .get(reqwest::header::LOCATION)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);

    let body = response.bytes().await?;

    sink.submit(CaptureRecord {
        url: url.to_string(),
        status,
        content_type: content_type.clone(),
        body_len: body.len() as u64,
        captured_at: Utc::now(),
    });

    Ok(Fetched {
        response: FetchedResponse {
            status,
            content_type,
            location,
        },
        body,
    })
}

/// Build the capture HTTP client; redirects are left to the postprocessor
pub fn build_client(user_agent: &str, timeout: Duration) -> reqwest::Result<reqwest::Client> {
    reqwest::Client::builder()
        .user_agent(user_agent)
        .timeout(timeout)
        .connect_timeout(Duration::from_secs(10))
        .redirect(reqwest::redirect::Policy::none())
        .gzip(true)
        .build()
}
