//! Controller: wires the pipeline and manages its lifecycle
//!
//! Builds the job directory, the reactor, the four stages, the work
//! source (local queue or HQ), the admin API, and the watchers; feeds in
//! seeds; detects completion; and tears everything down in dependency
//! order: watchers first, then a reactor freeze, then each stage from
//! preprocessor to finisher, then the sources, and the reactor last. The
//! WARC sink is drained separately because records may still be in
//! flight to disk.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::api::{ApiServer, AppState, WorkerRegistry};
use crate::config::Config;
use crate::hq::{Hq, HqClient, HttpHqClient};
use crate::models::{Item, ItemSource, ItemStatus};
use crate::pause::PauseController;
use crate::pipeline::archiver::{build_client, Archiver, DomainLimiter};
use crate::pipeline::finisher::{Finisher, FinisherSink};
use crate::pipeline::postprocessor::{Postprocessor, PostprocessorConfig};
use crate::pipeline::preprocessor::Preprocessor;
use crate::pipeline::{stage_channel, StageHandle};
use crate::queue::{PersistentGroupedQueue, QueueError};
use crate::reactor::Reactor;
use crate::seencheck::Seencheck;
use crate::stats::{CrawlState, CrawlStats};
use crate::warc::SharedSink;

use crate::extractors::UrlFilter;

/// How often the queue consumer polls an empty queue
const QUEUE_POLL_INTERVAL: Duration = Duration::from_millis(250);
/// How often completion is evaluated
const COMPLETION_POLL_INTERVAL: Duration = Duration::from_millis(500);
/// Disk watcher cadence
const DISK_WATCH_INTERVAL: Duration = Duration::from_secs(5);
/// WARC backlog watcher cadence
const BACKLOG_WATCH_INTERVAL: Duration = Duration::from_secs(5);

/// A running crawl pipeline
pub struct Controller {
    config: Config,
    stats: Arc<CrawlStats>,
    reactor: Arc<Reactor>,
    queue: Option<Arc<PersistentGroupedQueue>>,
    seencheck: Option<Arc<Seencheck>>,
    hq: Option<Hq>,
    sink: SharedSink,
    pause: Arc<PauseController>,
    stages: Vec<StageHandle>,
    aux_shutdown: broadcast::Sender<()>,
    aux_tasks: Vec<JoinHandle<()>>,
}

impl Controller {
    /// Build and start the whole pipeline. Startup failures are fatal; no
    /// partial pipeline is ever left running.
    pub async fn start(config: Config, sink: SharedSink) -> Result<Self> {
        config.validate()?;

        let job_dir = config.crawl.job_dir();
        for dir in [
            config.crawl.logs_dir(),
            config.crawl.temp_dir(),
            config.crawl.queue_dir(),
            config.crawl.seencheck_dir(),
        ] {
            std::fs::create_dir_all(&dir)
                .with_context(|| format!("cannot create job directory '{}'", dir.display()))?;
        }
        info!(job = %config.crawl.job, dir = %job_dir.display(), "starting crawl");

        let workers = config.crawl.workers;
        let stats = CrawlStats::shared();
        let pause = PauseController::new();
        let worker_registry = WorkerRegistry::shared(workers);
        let (aux_shutdown, _) = broadcast::channel(4);

        let (reactor, reactor_rx) = Reactor::new(workers);

        let seencheck = if config.crawl.local_seencheck && !config.hq.enabled {
            Some(Arc::new(
                Seencheck::open(config.crawl.seencheck_dir())
                    .context("cannot open seencheck store")?,
            ))
        } else {
            None
        };

        let client = build_client(
            &config.crawl.user_agent,
            Duration::from_secs(config.crawl.http_timeout_secs),
        )
        .context("cannot build HTTP client")?;

        let hq_client: Option<Arc<dyn HqClient>> = if config.hq.enabled {
            Some(Arc::new(HttpHqClient::new(
                client.clone(),
                config.hq.address.clone(),
                config.hq.project.clone(),
            )))
        } else {
            None
        };

        // Stage channels
        let (pre_tx, pre_rx) = stage_channel(workers);
        let (arch_tx, arch_rx) = stage_channel(workers);
        let (post_tx, post_rx) = stage_channel(workers);

        let mut stages = Vec::new();

        stages.push(Preprocessor::start(
            reactor_rx,
            pre_tx,
            seencheck.clone(),
            hq_client.clone(),
            stats.clone(),
            pause.clone(),
            workers,
        ));

        let limiter = Arc::new(DomainLimiter::new(
            config.crawl.max_concurrent_requests_per_domain,
            Duration::from_millis(config.crawl.rate_limit_delay_ms),
        ));
        stages.push(Archiver::start(
            pre_rx,
            arch_tx,
            client.clone(),
            limiter,
            sink.clone(),
            stats.clone(),
            worker_registry.clone(),
            pause.clone(),
            workers,
            config.crawl.max_concurrent_assets,
        ));

        stages.push(Postprocessor::start(
            arch_rx,
            post_tx,
            PostprocessorConfig {
                max_hops: config.crawl.max_hops,
                max_redirect: config.crawl.max_redirect,
                domains_crawl: config.crawl.domains_crawl,
                disable_assets_capture: config.crawl.disable_assets_capture,
                capture_alternate_pages: config.crawl.capture_alternate_pages,
                filter: UrlFilter {
                    included_hosts: config.crawl.included_hosts.clone(),
                    excluded_hosts: config.crawl.excluded_hosts.clone(),
                    excluded_strings: config.crawl.excluded_strings.clone(),
                },
            },
            stats.clone(),
            pause.clone(),
            workers,
        ));

        // Work source: remote HQ or the local persistent queue
        let (queue, hq, finisher_sink) = if let Some(hq_client) = hq_client {
            info!(address = %config.hq.address, "using crawl HQ as work source");
            let hq = Hq::start(
                hq_client,
                reactor.clone(),
                config.hq.clone(),
                workers,
                stats.clone(),
            );
            let sink = FinisherSink::Hq {
                discovered: hq.discovered_tx.clone(),
                finished: hq.finished_tx.clone(),
            };
            (None, Some(hq), sink)
        } else {
            let queue = Arc::new(
                PersistentGroupedQueue::open(
                    config.crawl.queue_dir(),
                    config.queue.sync_mode,
                    config.queue.sync_every_ops,
                )
                .context("cannot open persistent queue")?,
            );
            stats.queued.set(queue.len());
            (Some(queue.clone()), None, FinisherSink::Queue(queue))
        };

        stages.push(Finisher::start(
            post_rx,
            reactor.clone(),
            finisher_sink,
            stats.clone(),
            pause.clone(),
            workers,
        ));

        let mut aux_tasks = Vec::new();

        if let Some(queue) = &queue {
            aux_tasks.push(spawn_queue_consumer(
                queue.clone(),
                reactor.clone(),
                stats.clone(),
                aux_shutdown.subscribe(),
            ));
            aux_tasks.push(spawn_queue_snapshotter(
                queue.clone(),
                Duration::from_secs(config.queue.snapshot_interval_secs),
                aux_shutdown.subscribe(),
            ));
        }

        if config.api.enabled {
            let server = ApiServer::new(
                config.api.clone(),
                AppState {
                    stats: stats.clone(),
                    workers: worker_registry,
                    prometheus: config.api.prometheus,
                },
            );
            let shutdown_rx = aux_shutdown.subscribe();
            aux_tasks.push(tokio::spawn(async move {
                if let Err(e) = server.run(shutdown_rx).await {
                    error!(error = %e, "admin API failed");
                }
            }));
        }

        aux_tasks.push(crate::watchers::start_disk_watcher(
            job_dir,
            config.crawl.min_space_required_mib * 1024 * 1024,
            DISK_WATCH_INTERVAL,
            pause.clone(),
            stats.clone(),
            aux_shutdown.subscribe(),
        ));
        aux_tasks.push(crate::watchers::start_record_backlog_watcher(
            sink.clone(),
            BACKLOG_WATCH_INTERVAL,
            aux_shutdown.subscribe(),
        ));

        Ok(Self {
            config,
            stats,
            reactor,
            queue,
            seencheck,
            hq,
            sink,
            pause,
            stages,
            aux_shutdown,
            aux_tasks,
        })
    }

    pub fn stats(&self) -> Arc<CrawlStats> {
        self.stats.clone()
    }

    pub fn pause_controller(&self) -> Arc<PauseController> {
        self.pause.clone()
    }

    /// Admit the given seed URLs as fresh root items
    pub async fn insert_seeds(&self, seeds: &[String]) -> Result<()> {
        for raw in seeds {
            let mut item = Item::seed(raw.clone());
            item.set_source(ItemSource::Insert);
            item.set_status(ItemStatus::Fresh);
            self.reactor
                .receive_insert(item)
                .await
                .map_err(|e| anyhow::anyhow!("unable to insert seed '{raw}': {e}"))?;
        }
        info!(count = seeds.len(), "seeds inserted");
        Ok(())
    }

    /// Run until the crawl drains, a time limit hits, or Ctrl-C arrives
    pub async fn run_until_done(&self) -> Result<()> {
        let soft_limit = optional_sleep(self.config.crawl.crawl_time_limit_secs);
        let hard_limit = optional_sleep(self.config.crawl.max_crawl_time_limit_secs);
        tokio::pin!(soft_limit, hard_limit);

        let mut poll = tokio::time::interval(COMPLETION_POLL_INTERVAL);
        poll.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        // completion must hold on two consecutive polls, so an item in
        // transit between the queue and the reactor is not mistaken for done
        let mut drained_polls = 0u32;

        loop {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {
                    info!("interrupt received, stopping crawl");
                    return Ok(());
                }
                _ = &mut soft_limit => {
                    info!("crawl time limit reached, stopping crawl");
                    return Ok(());
                }
                _ = &mut hard_limit => {
                    warn!("max crawl time limit reached, forcing stop");
                    return Ok(());
                }
                _ = poll.tick() => {
                    if let Some(queue) = &self.queue {
                        if queue.is_empty() && self.reactor.is_empty() && !self.pause.is_paused() {
                            drained_polls += 1;
                            if drained_polls >= 2 {
                                info!("queue and state table empty, crawl complete");
                                return Ok(());
                            }
                        } else {
                            drained_polls = 0;
                        }
                    }
                }
            }
        }
    }

    /// Ordered shutdown of the whole pipeline
    pub async fn shutdown(self) -> Result<()> {
        info!("stopping pipeline");
        self.stats.set_state(CrawlState::Finishing);

        // Watchers and aux loops first so nothing re-pauses mid-stop
        let _ = self.aux_shutdown.send(());

        // Refuse new work, then drain stage by stage in dependency order
        self.reactor.freeze();
        for stage in self.stages {
            stage.stop().await;
        }

        if let Some(hq) = self.hq {
            hq.stop().await;
        }

        for task in self.aux_tasks {
            let _ = task.await;
        }

        if let Some(queue) = &self.queue {
            if let Err(e) = queue.close() {
                warn!(error = %e, "error closing queue");
            }
        }

        if let Some(seencheck) = &self.seencheck {
            if let Err(e) = seencheck.flush() {
                warn!(error = %e, "error flushing seencheck store");
            }
        }

        self.reactor.stop();

        // Records may still be in flight to disk
        self.sink.drain();

        info!("pipeline stopped");
        Ok(())
    }
}

/// Pending forever when `secs` is zero
async fn optional_sleep(secs: u64) {
    if secs == 0 {
        std::future::pending::<()>().await;
    } else {
        tokio::time::sleep(Duration::from_secs(secs)).await;
    }
}

/// Feed queued items into the reactor as tokens free up
fn spawn_queue_consumer(
    queue: Arc<PersistentGroupedQueue>,
    reactor: Arc<Reactor>,
    stats: Arc<CrawlStats>,
    mut shutdown: broadcast::Receiver<()>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            if shutdown.try_recv().is_ok() || reactor.is_frozen() {
                break;
            }

            match queue.dequeue() {
                Ok(mut item) => {
                    stats.queued.set(queue.len());
                    item.set_source(ItemSource::Queue);
                    item.set_status(ItemStatus::Fresh);
                    // keep the parsed host so a refused item can be re-enqueued
                    if let Err(e) = item.url_mut().parse() {
                        warn!(error = %e, "skipping queued item with unparsable url");
                        continue;
                    }
                    let backup = item.clone();
                    if let Err(e) = reactor.receive_insert(item).await {
                        // dequeue was already WAL-acknowledged; put it back
                        warn!(error = %e, "reactor refused queued item, re-enqueueing");
                        if let Err(e) = queue.enqueue(&backup) {
                            error!(url = backup.url().raw(), error = %e, "item lost on shutdown");
                        }
                        break;
                    }
                }
                Err(QueueError::Empty) => {
                    tokio::time::sleep(QUEUE_POLL_INTERVAL).await;
                }
                Err(QueueError::Corrupt { host, id, source }) => {
                    warn!(host = %host, blob = %id, error = %source, "skipping corrupt queue entry");
                }
                Err(QueueError::Closed) => break,
                Err(e) => {
                    error!(error = %e, "queue dequeue failed");
                    tokio::time::sleep(Duration::from_secs(1)).await;
                }
            }
        }
        debug!("queue consumer shut down");
    })
}

/// Periodic index snapshot so recovery replays a short WAL
fn spawn_queue_snapshotter(
    queue: Arc<PersistentGroupedQueue>,
    interval: Duration,
    mut shutdown: broadcast::Receiver<()>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        // the first tick fires immediately; skip it
        ticker.tick().await;
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if let Err(e) = queue.snapshot() {
                        warn!(error = %e, "periodic queue snapshot failed");
                    }
                }
                _ = shutdown.recv() => break,
            }
        }
        debug!("queue snapshotter shut down");
    })
}
