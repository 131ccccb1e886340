//! Crawl HQ source adapter
//!
//! Replaces the local queue with a remote work source. Three background
//! loops: the consumer pulls URL batches via `feed` and admits them into
//! the reactor; the producer batches discovered outlinks and ships them
//! as `discovered`; the finisher batches completions and ships them as
//! `finished`. Producer and finisher retry failed shipments forever with
//! a one-second pause, and drain their tails on shutdown.
//!
//! The wire transport is behind the `HqClient` trait; `HttpHqClient` is
//! the JSON-over-HTTP implementation.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::HqConfig;
use crate::models::{CrawlUrl, Item, ItemKind, ItemSource};
use crate::reactor::Reactor;
use crate::stats::CrawlStats;

/// Batch flush window for the producer and finisher loops
const FLUSH_INTERVAL: Duration = Duration::from_secs(10);
/// Pause between retries of a failed shipment
const RETRY_DELAY: Duration = Duration::from_secs(1);
/// Consumer poll pause when workers are saturated
const SATURATION_PAUSE: Duration = Duration::from_millis(100);

#[derive(Debug, Error)]
pub enum HqError {
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("hq returned status {0}")]
    Status(u16),
}

/// A URL on the HQ wire: the `path` field encodes the hop count as one
/// "L" per hop.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HqUrl {
    #[serde(default)]
    pub id: String,
    pub value: String,
    #[serde(default)]
    pub via: String,
    #[serde(default)]
    pub path: String,
}

pub fn hops_from_path(path: &str) -> u16 {
    path.chars().filter(|c| *c == 'L').count() as u16
}

pub fn path_from_hops(hops: u16) -> String {
    "L".repeat(hops as usize)
}

/// The three RPCs the core consumes; transport is up to the implementation
#[async_trait]
pub trait HqClient: Send + Sync {
    async fn feed(&self, batch_size: usize, strategy: &str) -> Result<Vec<HqUrl>, HqError>;

    /// Report discovered URLs; with `seencheck` set, HQ answers with the
    /// subset it had not seen before
    async fn discovered(
        &self,
        urls: Vec<HqUrl>,
        kind: &str,
        trusted: bool,
        seencheck: bool,
    ) -> Result<Vec<HqUrl>, HqError>;

    async fn finished(&self, urls: Vec<HqUrl>, locally_crawled: u64) -> Result<(), HqError>;
}

/// JSON-over-HTTP client for the HQ service
pub struct HttpHqClient {
    client: reqwest::Client,
    address: String,
    project: String,
}

impl HttpHqClient {
    pub fn new(client: reqwest::Client, address: impl Into<String>, project: impl Into<String>) -> Self {
        let mut address = address.into();
        while address.ends_with('/') {
            address.pop();
        }
        Self {
            client,
            address,
            project: project.into(),
        }
    }

    fn endpoint(&self, name: &str) -> String {
        format!("{}/api/projects/{}/{}", self.address, self.project, name)
    }
}

#[derive(Serialize)]
struct FeedRequest<'a> {
    batch_size: usize,
    strategy: &'a str,
}

#[derive(Deserialize)]
struct UrlsResponse {
    #[serde(default)]
    urls: Vec<HqUrl>,
}

#[derive(Serialize)]
struct DiscoveredRequest<'a> {
    urls: &'a [HqUrl],
    kind: &'a str,
    trusted: bool,
    seencheck: bool,
}

#[derive(Serialize)]
struct FinishedRequest<'a> {
    urls: &'a [HqUrl],
    locally_crawled: u64,
}

#[async_trait]
impl HqClient for HttpHqClient {
    async fn feed(&self, batch_size: usize, strategy: &str) -> Result<Vec<HqUrl>, HqError> {
        let response = self
            .client
            .post(self.endpoint("feed"))
            .json(&FeedRequest {
                batch_size,
                strategy,
            })
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(HqError::Status(response.status().as_u16()));
        }
        Ok(response.json::<UrlsResponse>().await?.urls)
    }

    async fn discovered(
        &self,
        urls: Vec<HqUrl>,
        kind: &str,
        trusted: bool,
        seencheck: bool,
    ) -> Result<Vec<HqUrl>, HqError> {
        let response = self
            .client
            .post(self.endpoint("discovered"))
            .json(&DiscoveredRequest {
                urls: &urls,
                kind,
                trusted,
                seencheck,
            })
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(HqError::Status(response.status().as_u16()));
        }
        Ok(response.json::<UrlsResponse>().await?.urls)
    }

    async fn finished(&self, urls: Vec<HqUrl>, locally_crawled: u64) -> Result<(), HqError> {
        let response = self
            .client
            .post(self.endpoint("finished"))
            .json(&FinishedRequest {
                urls: &urls,
                locally_crawled,
            })
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(HqError::Status(response.status().as_u16()));
        }
        Ok(())
    }
}

/// Handles to the three running HQ loops
pub struct Hq {
    pub discovered_tx: mpsc::Sender<Item>,
    pub finished_tx: mpsc::Sender<Item>,
    shutdown: broadcast::Sender<()>,
    consumer: JoinHandle<()>,
    producer: JoinHandle<()>,
    finisher: JoinHandle<()>,
}

impl Hq {
    pub fn start(
        client: Arc<dyn HqClient>,
        reactor: Arc<Reactor>,
        config: HqConfig,
        workers: usize,
        stats: Arc<CrawlStats>,
    ) -> Self {
        let (shutdown, _) = broadcast::channel(1);
        let (discovered_tx, discovered_rx) = mpsc::channel(workers.max(1) * 2);
        let (finished_tx, finished_rx) = mpsc::channel(workers.max(1) * 2);

        let batch_threshold = half_of(workers);

        let consumer = tokio::spawn(consumer_loop(
            client.clone(),
            reactor,
            config.clone(),
            workers,
            stats,
            shutdown.subscribe(),
        ));
        let producer = tokio::spawn(producer_loop(
            client.clone(),
            discovered_rx,
            batch_threshold,
            shutdown.subscribe(),
        ));
        let finisher = tokio::spawn(finisher_loop(
            client,
            finished_rx,
            batch_threshold,
            shutdown.subscribe(),
        ));

        info!("hq source started");
        Self {
            discovered_tx,
            finished_tx,
            shutdown,
            consumer,
            producer,
            finisher,
        }
    }

    /// Stop all three loops, draining the producer and finisher tails
    pub async fn stop(self) {
        let _ = self.shutdown.send(());
        drop(self.discovered_tx);
        drop(self.finished_tx);
        let _ = self.consumer.await;
        let _ = self.producer.await;
        let _ = self.finisher.await;
        info!("hq source stopped");
    }
}

fn half_of(workers: usize) -> usize {
    (workers.max(1) + 1) / 2
}

/// Build a root item from one fed URL
fn item_from_feed(url: &HqUrl) -> Item {
    let hops = hops_from_path(&url.path);
    let mut item = Item::new(
        Uuid::new_v4(),
        CrawlUrl::new(url.value.clone()).with_hops(hops),
        None,
        ItemKind::Seed,
    );
    if !url.id.is_empty() {
        item.set_remote_id(url.id.clone());
    }
    item.set_source(ItemSource::Hq);
    item
}

fn url_from_item(item: &Item) -> HqUrl {
    HqUrl {
        id: item
            .remote_id()
            .map(str::to_string)
            .unwrap_or_else(|| item.id().to_string()),
        value: item.url().raw().to_string(),
        via: item.parent_url().unwrap_or_default().to_string(),
        path: path_from_hops(item.url().hops()),
    }
}

async fn consumer_loop(
    client: Arc<dyn HqClient>,
    reactor: Arc<Reactor>,
    config: HqConfig,
    workers: usize,
    stats: Arc<CrawlStats>,
    mut shutdown: broadcast::Receiver<()>,
) {
    loop {
        if shutdown.try_recv().is_ok() {
            break;
        }
        if reactor.is_frozen() {
            break;
        }

        // Back off while the workers are nearly saturated
        if !config.continuous_pull && reactor.in_flight() * 10 >= reactor.capacity() * 9 {
            tokio::time::sleep(SATURATION_PAUSE).await;
            continue;
        }

        let batch_size = if config.batch_size > 0 {
            config.batch_size
        } else {
            half_of(workers)
        };

        let batch = match client.feed(batch_size, &config.strategy).await {
            Ok(batch) => batch,
            Err(e) => {
                debug!(error = %e, "error getting new urls from hq");
                tokio::time::sleep(RETRY_DELAY).await;
                continue;
            }
        };

        if batch.is_empty() {
            tokio::time::sleep(RETRY_DELAY).await;
            continue;
        }

        stats.queued.set(batch.len() as u64);
        for url in &batch {
            let item = item_from_feed(url);
            if let Err(e) = reactor.receive_insert(item).await {
                warn!(url = %url.value, error = %e, "unable to insert hq url");
                break;
            }
        }
    }
    debug!("hq consumer shut down");
}

async fn producer_loop(
    client: Arc<dyn HqClient>,
    mut rx: mpsc::Receiver<Item>,
    threshold: usize,
    mut shutdown: broadcast::Receiver<()>,
) {
    let mut batch: Vec<HqUrl> = Vec::new();
    let mut interval = tokio::time::interval(FLUSH_INTERVAL);
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            maybe_item = rx.recv() => {
                match maybe_item {
                    Some(item) => {
                        batch.push(url_from_item(&item));
                        if batch.len() >= threshold {
                            ship_discovered(&client, &mut batch).await;
                        }
                    }
                    None => break,
                }
            }
            _ = interval.tick() => {
                if !batch.is_empty() {
                    ship_discovered(&client, &mut batch).await;
                }
            }
            _ = shutdown.recv() => break,
        }
    }

    // Drain whatever is still queued, then the final batch
    while let Ok(item) = rx.try_recv() {
        batch.push(url_from_item(&item));
    }
    if !batch.is_empty() {
        ship_discovered(&client, &mut batch).await;
    }
    debug!("hq producer shut down");
}

async fn ship_discovered(client: &Arc<dyn HqClient>, batch: &mut Vec<HqUrl>) {
    loop {
        match client.discovered(batch.clone(), "seed", false, false).await {
            Ok(_) => {
                debug!(count = batch.len(), "shipped discovered urls to hq");
                batch.clear();
                return;
            }
            Err(e) => {
                warn!(error = %e, "error sending discovered urls to hq, retrying in 1s");
                tokio::time::sleep(RETRY_DELAY).await;
            }
        }
    }
}

async fn finisher_loop(
    client: Arc<dyn HqClient>,
    mut rx: mpsc::Receiver<Item>,
    threshold: usize,
    mut shutdown: broadcast::Receiver<()>,
) {
    let mut batch: Vec<HqUrl> = Vec::new();
    let mut locally_crawled_total: u64 = 0;
    let mut interval = tokio::time::interval(FLUSH_INTERVAL);
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            maybe_item = rx.recv() => {
                match maybe_item {
                    Some(item) => {
                        locally_crawled_total += item.locally_crawled();
                        batch.push(url_from_item(&item));
                        if batch.len() >= threshold {
                            ship_finished(&client, &mut batch, &mut locally_crawled_total).await;
                        }
                    }
                    None => break,
                }
            }
            _ = interval.tick() => {
                if !batch.is_empty() {
                    ship_finished(&client, &mut batch, &mut locally_crawled_total).await;
                }
            }
            _ = shutdown.recv() => break,
        }
    }

    while let Ok(item) = rx.try_recv() {
        locally_crawled_total += item.locally_crawled();
        batch.push(url_from_item(&item));
    }
    if !batch.is_empty() {
        ship_finished(&client, &mut batch, &mut locally_crawled_total).await;
    }
    debug!("hq finisher shut down");
}

async fn ship_finished(client: &Arc<dyn HqClient>, batch: &mut Vec<HqUrl>, total: &mut u64) {
    loop {
        match client.finished(batch.clone(), *total).await {
            Ok(()) => {
                debug!(count = batch.len(), "shipped finished urls to hq");
                batch.clear();
                *total = 0;
                return;
            }
            Err(e) => {
                warn!(error = %e, "error submitting finished urls to hq, retrying in 1s");
                tokio::time::sleep(RETRY_DELAY).await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;

    #[derive(Default)]
    struct MockHq {
        feeds: Mutex<Vec<Vec<HqUrl>>>,
        discovered_calls: Mutex<Vec<Vec<HqUrl>>>,
        finished_calls: Mutex<Vec<(Vec<HqUrl>, u64)>>,
    }

    #[async_trait]
    impl HqClient for MockHq {
        async fn feed(&self, _batch_size: usize, _strategy: &str) -> Result<Vec<HqUrl>, HqError> {
            let mut feeds = self.feeds.lock();
            if feeds.is_empty() {
                Ok(Vec::new())
            } else {
                Ok(feeds.remove(0))
            }
        }

        async fn discovered(
            &self,
            urls: Vec<HqUrl>,
            _kind: &str,
            _trusted: bool,
            _seencheck: bool,
        ) -> Result<Vec<HqUrl>, HqError> {
            self.discovered_calls.lock().push(urls);
            Ok(Vec::new())
        }

        async fn finished(&self, urls: Vec<HqUrl>, locally_crawled: u64) -> Result<(), HqError> {
            self.finished_calls.lock().push((urls, locally_crawled));
            Ok(())
        }
    }

    fn hq_config() -> HqConfig {
        HqConfig {
            enabled: true,
            address: "http://hq.example".to_string(),
            ..Default::default()
        }
    }

    #[test]
    fn hop_path_round_trip() {
        assert_eq!(hops_from_path(""), 0);
        assert_eq!(hops_from_path("LLL"), 3);
        assert_eq!(path_from_hops(2), "LL");
        for hops in [0u16, 1, 7] {
            assert_eq!(hops_from_path(&path_from_hops(hops)), hops);
        }
    }

    #[test]
    fn feed_items_carry_hq_metadata() {
        let item = item_from_feed(&HqUrl {
            id: "hq-123".to_string(),
            value: "http://example.com/fed".to_string(),
            via: String::new(),
            path: "LL".to_string(),
        });
        assert_eq!(item.source(), ItemSource::Hq);
        assert_eq!(item.url().hops(), 2);
        assert_eq!(item.remote_id(), Some("hq-123"));
        assert!(item.is_seed());
    }

    #[tokio::test]
    async fn consumer_admits_fed_urls() {
        let mock = Arc::new(MockHq::default());
        mock.feeds.lock().push(vec![
            HqUrl {
                id: "1".into(),
                value: "http://example.com/a".into(),
                via: String::new(),
                path: String::new(),
            },
            HqUrl {
                id: "2".into(),
                value: "http://example.com/b".into(),
                via: String::new(),
                path: "L".into(),
            },
        ]);

        let (reactor, mut rx) = Reactor::new(8);
        let hq = Hq::start(
            mock.clone(),
            reactor.clone(),
            hq_config(),
            8,
            CrawlStats::shared(),
        );

        let first = rx.recv().await.unwrap();
        let second = rx.recv().await.unwrap();
        assert_eq!(first.url().raw(), "http://example.com/a");
        assert_eq!(second.url().hops(), 1);
        assert_eq!(reactor.in_flight(), 2);

        reactor.freeze();
        hq.stop().await;
    }

    #[tokio::test]
    async fn producer_ships_on_threshold() {
        let mock = Arc::new(MockHq::default());
        let (reactor, _rx) = Reactor::new(4);
        let hq = Hq::start(
            mock.clone(),
            reactor.clone(),
            hq_config(),
            4, // threshold = 2
            CrawlStats::shared(),
        );

        for n in 0..2 {
            let mut item = Item::seed(format!("http://example.com/{n}"));
            item.url_mut().parse().unwrap();
            hq.discovered_tx.send(item).await.unwrap();
        }

        tokio::time::timeout(Duration::from_secs(2), async {
            while mock.discovered_calls.lock().is_empty() {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("producer should flush at the batch threshold");

        assert_eq!(mock.discovered_calls.lock()[0].len(), 2);

        reactor.freeze();
        hq.stop().await;
    }

    #[tokio::test]
    async fn finisher_drains_tail_on_shutdown() {
        let mock = Arc::new(MockHq::default());
        let (reactor, _rx) = Reactor::new(8);
        let hq = Hq::start(
            mock.clone(),
            reactor.clone(),
            hq_config(),
            8, // threshold = 4, so one item stays buffered
            CrawlStats::shared(),
        );

        let mut item = Item::seed("http://example.com/done");
        item.url_mut().parse().unwrap();
        item.set_remote_id("hq-9");
        item.set_locally_crawled(3);
        hq.finished_tx.send(item).await.unwrap();

        reactor.freeze();
        hq.stop().await;

        let calls = mock.finished_calls.lock();
        assert_eq!(calls.len(), 1, "tail must flush on shutdown");
        assert_eq!(calls[0].0[0].id, "hq-9");
        assert_eq!(calls[0].1, 3);
    }
}
