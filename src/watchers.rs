//! Background watchers
//!
//! The disk-space watcher pauses the whole pipeline when free space under
//! the job directory falls below the configured floor and resumes it once
//! space recovers. The record-backlog watcher keeps an eye on how many
//! capture records are still queued at the WARC sink.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::pause::PauseController;
use crate::stats::{CrawlState, CrawlStats};
use crate::warc::SharedSink;

/// Watch free disk space under `path`, pausing below `min_bytes`
pub fn start_disk_watcher(
    path: PathBuf,
    min_bytes: u64,
    interval: Duration,
    pause: Arc<PauseController>,
    stats: Arc<CrawlStats>,
    mut shutdown: broadcast::Receiver<()>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        let mut paused_by_us = false;

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let free = match fs2::available_space(&path) {
                        Ok(free) => free,
                        Err(e) => {
                            warn!(path = %path.display(), error = %e, "unable to read free disk space");
                            continue;
                        }
                    };

                    if free < min_bytes && !paused_by_us {
                        warn!(
                            free_mib = free / 1024 / 1024,
                            required_mib = min_bytes / 1024 / 1024,
                            "low disk space, pausing crawl"
                        );
                        pause.pause().await;
                        stats.set_state(CrawlState::Paused);
                        paused_by_us = true;
                    } else if free >= min_bytes && paused_by_us {
                        warn!(free_mib = free / 1024 / 1024, "disk space recovered, resuming crawl");
                        pause.resume();
                        stats.set_state(CrawlState::Running);
                        paused_by_us = false;
                    }
                }
                _ = shutdown.recv() => break,
            }
        }
        debug!("disk watcher shut down");
    })
}

/// Periodically report the WARC writing backlog
pub fn start_record_backlog_watcher(
    sink: SharedSink,
    interval: Duration,
    mut shutdown: broadcast::Receiver<()>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let pending = sink.pending();
                    if pending > 0 {
                        debug!(pending, "warc records awaiting write");
                    }
                }
                _ = shutdown.recv() => break,
            }
        }
        debug!("record backlog watcher shut down");
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::warc::CountingSink;

    #[tokio::test]
    async fn disk_watcher_pauses_when_space_is_low() {
        let dir = tempfile::tempdir().unwrap();
        let pause = PauseController::new();
        let stats = CrawlStats::shared();
        let (shutdown_tx, shutdown_rx) = broadcast::channel(1);

        // Demand more space than any filesystem has
        let handle = start_disk_watcher(
            dir.path().to_path_buf(),
            u64::MAX,
            Duration::from_millis(10),
            pause.clone(),
            stats.clone(),
            shutdown_rx,
        );

        tokio::time::timeout(Duration::from_secs(2), async {
            while !pause.is_paused() {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("watcher should pause on low space");
        assert_eq!(stats.state(), CrawlState::Paused);

        let _ = shutdown_tx.send(());
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn backlog_watcher_stops_on_shutdown() {
        let (shutdown_tx, shutdown_rx) = broadcast::channel(1);
        let handle = start_record_backlog_watcher(
            CountingSink::shared(),
            Duration::from_millis(10),
            shutdown_rx,
        );
        tokio::time::sleep(Duration::from_millis(30)).await;
        let _ = shutdown_tx.send(());
        handle.await.unwrap();
    }
}
