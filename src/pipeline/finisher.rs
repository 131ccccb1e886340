//! Finisher stage: route items back to the reactor or to the work source
//!
//! The last stage of every pass. Outlinks collected by the postprocessor
//! are shipped to the work source (queue enqueue, or the HQ discovered
//! channel). Items that grew children or a redirect go back through the
//! reactor as feedback; everything else leaves the state table, returning
//! its token. Whatever happened earlier in the pass, every terminal item
//! is marked finished so tokens can never leak.

use std::sync::Arc;

use tokio::sync::{broadcast, mpsc, Semaphore};
use tokio::task::JoinSet;
use tracing::{debug, warn};

use crate::models::{Item, ItemSource, ItemStatus};
use crate::pause::PauseController;
use crate::queue::PersistentGroupedQueue;
use crate::reactor::Reactor;
use crate::stats::CrawlStats;

use super::StageHandle;

/// Where finished items and freshly discovered outlinks go
pub enum FinisherSink {
    /// Local queue mode: outlinks are enqueued as new seeds
    Queue(Arc<PersistentGroupedQueue>),
    /// HQ mode: outlinks and finished items are shipped by the HQ loops
    Hq {
        discovered: mpsc::Sender<Item>,
        finished: mpsc::Sender<Item>,
    },
}

pub struct Finisher {
    reactor: Arc<Reactor>,
    sink: FinisherSink,
    stats: Arc<CrawlStats>,
}

impl Finisher {
    pub fn start(
        mut input: mpsc::Receiver<Item>,
        reactor: Arc<Reactor>,
        sink: FinisherSink,
        stats: Arc<CrawlStats>,
        pause: Arc<PauseController>,
        workers: usize,
    ) -> StageHandle {
        let (shutdown_tx, mut shutdown_rx) = broadcast::channel(1);
        let stage = Arc::new(Self {
            reactor,
            sink,
            stats,
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
                        let Some(item) = maybe_item else {
                            while tasks.join_next().await.is_some() {}
                            break;
                        };
                        let permit = guard.clone().acquire_owned().await.expect("stage guard");
                        let stage = stage.clone();
                        tasks.spawn(async move {
                            let _permit = permit;
                            stage.stats.finisher_routines.inc();
                            stage.finish(item).await;
                            stage.stats.finisher_routines.dec();
                        });
                        while tasks.try_join_next().is_some() {}
                    }
                }
            }
            debug!("finisher shut down");
        });

        StageHandle::new("finisher", shutdown_tx, task)
    }

    #[cfg(test)]
    fn new(reactor: Arc<Reactor>, sink: FinisherSink, stats: Arc<CrawlStats>) -> Self {
        Self {
            reactor,
            sink,
            stats,
        }
    }

    async fn finish(&self, mut item: Item) {
        self.ship_outlinks(&mut item).await;

        if matches!(
            item.status(),
            ItemStatus::GotChildren | ItemStatus::GotRedirected
        ) {
            let id = item.id();
            match self.reactor.receive_feedback(item).await {
                Ok(()) => return,
                Err(e) => {
                    // still return the token; the item is lost either way
                    warn!(item = %id, error = %e, "feedback rejected, finishing item");
                    let _ = self.reactor.mark_as_finished(id);
                    return;
                }
            }
        }

        if item.status() == ItemStatus::PostProcessed {
            item.set_status(ItemStatus::Completed);
        }

        if let FinisherSink::Hq { finished, .. } = &self.sink {
            if item.is_seed() && finished.send(item.clone()).await.is_err() {
                warn!(item = %item.short_id(), "hq finished channel closed");
            }
        }

        let id = item.id();
        debug!(item = %item.short_id(), status = item.status().as_str(), "item terminal");
        if let Err(e) = self.reactor.mark_as_finished(id) {
            warn!(item = %id, error = %e, "finished item was not in the state table");
        }
    }

    /// Hand the pass's outlinks to the work source as new root items
    async fn ship_outlinks(&self, item: &mut Item) {
        let outlinks = item.take_outlinks();
        if outlinks.is_empty() {
            return;
        }
        debug!(item = %item.short_id(), count = outlinks.len(), "shipping outlinks");

        for mut outlink in outlinks {
            outlink.set_source(ItemSource::Queue);
            match &self.sink {
                FinisherSink::Queue(queue) => {
                    if let Err(e) = queue.enqueue(&outlink) {
                        warn!(url = outlink.url().raw(), error = %e, "unable to enqueue outlink");
                    } else {
                        self.stats.queued.set(queue.len());
                    }
                }
                FinisherSink::Hq { discovered, .. } => {
                    if discovered.send(outlink).await.is_err() {
                        warn!("hq discovered channel closed");
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue::SyncMode;
    use tempfile::TempDir;

    fn queue(dir: &TempDir) -> Arc<PersistentGroupedQueue> {
        Arc::new(PersistentGroupedQueue::open(dir.path(), SyncMode::Batch, 16).unwrap())
    }

    fn seed_item(url: &str) -> Item {
        let mut item = Item::seed(url);
        item.url_mut().parse().unwrap();
        item.set_source(ItemSource::Insert);
        item
    }

    #[tokio::test]
    async fn completed_item_leaves_state_table() {
        let (reactor, mut rx) = Reactor::new(4);
        let dir = TempDir::new().unwrap();
        let finisher = Finisher::new(
            reactor.clone(),
            FinisherSink::Queue(queue(&dir)),
            CrawlStats::shared(),
        );

        let mut item = seed_item("http://example.com/");
        item.set_status(ItemStatus::Completed);
        reactor.receive_insert(item.clone()).await.unwrap();
        let _ = rx.recv().await;

        finisher.finish(item).await;
        assert!(reactor.is_empty());
    }

    #[tokio::test]
    async fn item_with_children_feeds_back() {
        let (reactor, mut rx) = Reactor::new(4);
        let dir = TempDir::new().unwrap();
        let finisher = Finisher::new(
            reactor.clone(),
            FinisherSink::Queue(queue(&dir)),
            CrawlStats::shared(),
        );

        let mut item = seed_item("http://example.com/");
        item.set_status(ItemStatus::GotChildren);
        reactor.receive_insert(item.clone()).await.unwrap();
        let _ = rx.recv().await;

        finisher.finish(item).await;

        let fed_back = rx.recv().await.unwrap();
        assert_eq!(fed_back.source(), ItemSource::Feedback);
        assert_eq!(reactor.in_flight(), 1, "feedback keeps the item registered");
    }

    #[tokio::test]
    async fn postprocessed_becomes_completed() {
        let (reactor, mut rx) = Reactor::new(4);
        let dir = TempDir::new().unwrap();
        let finisher = Finisher::new(
            reactor.clone(),
            FinisherSink::Queue(queue(&dir)),
            CrawlStats::shared(),
        );

        let mut item = seed_item("http://example.com/");
        item.set_status(ItemStatus::PostProcessed);
        reactor.receive_insert(item.clone()).await.unwrap();
        let _ = rx.recv().await;

        finisher.finish(item).await;
        assert!(reactor.is_empty());
    }

    #[tokio::test]
    async fn outlinks_are_enqueued() {
        let (reactor, mut rx) = Reactor::new(4);
        let dir = TempDir::new().unwrap();
        let q = queue(&dir);
        let stats = CrawlStats::shared();
        let finisher = Finisher::new(reactor.clone(), FinisherSink::Queue(q.clone()), stats.clone());

        let mut item = seed_item("http://example.com/");
        item.set_status(ItemStatus::Completed);
        let mut outlink = Item::seed("http://example.com/next");
        outlink.url_mut().parse().unwrap();
        item.add_outlink(outlink);
        reactor.receive_insert(item.clone()).await.unwrap();
        let _ = rx.recv().await;

        finisher.finish(item).await;

        assert_eq!(q.len(), 1);
        assert_eq!(stats.queued.get(), 1);
        let queued = q.dequeue().unwrap();
        assert_eq!(queued.url().raw(), "http://example.com/next");
        assert!(reactor.is_empty());
    }

    #[tokio::test]
    async fn failed_item_still_returns_token() {
        let (reactor, mut rx) = Reactor::new(1);
        let dir = TempDir::new().unwrap();
        let finisher = Finisher::new(
            reactor.clone(),
            FinisherSink::Queue(queue(&dir)),
            CrawlStats::shared(),
        );

        let mut item = seed_item("http://example.com/");
        item.set_status(ItemStatus::Failed);
        reactor.receive_insert(item.clone()).await.unwrap();
        let _ = rx.recv().await;

        finisher.finish(item).await;
        assert!(reactor.is_empty(), "token must come back even for failures");
    }

    #[tokio::test]
    async fn hq_mode_ships_finished_and_outlinks() {
        let (reactor, mut rx) = Reactor::new(4);
        let (discovered_tx, mut discovered_rx) = mpsc::channel(8);
        let (finished_tx, mut finished_rx) = mpsc::channel(8);
        let finisher = Finisher::new(
            reactor.clone(),
            FinisherSink::Hq {
                discovered: discovered_tx,
                finished: finished_tx,
            },
            CrawlStats::shared(),
        );

        let mut item = seed_item("http://example.com/");
        item.set_status(ItemStatus::Completed);
        let mut outlink = Item::seed("http://example.com/next");
        outlink.url_mut().parse().unwrap();
        item.add_outlink(outlink);
        reactor.receive_insert(item.clone()).await.unwrap();
        let _ = rx.recv().await;

        finisher.finish(item).await;

        assert_eq!(
            discovered_rx.recv().await.unwrap().url().raw(),
            "http://example.com/next"
        );
        assert_eq!(finished_rx.recv().await.unwrap().url().raw(), "http://example.com/");
        assert!(reactor.is_empty());
    }
}
