//! The crawl pipeline stages
//!
//! Four stages connected by bounded channels: preprocess (URL validation
//! and seencheck), archive (HTTP capture + WARC records), postprocess
//! (redirects and link extraction) and finish (feedback or completion).
//! Every stage runs one select loop over its input channel, a shutdown
//! broadcast, and the pause broadcaster, spawning one bounded task per
//! item. Stopping a stage drains its in-flight tasks before returning.

pub mod archiver;
pub mod finisher;
pub mod postprocessor;
pub mod preprocessor;

use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;

use crate::models::Item;

/// Bounded channel linking two stages; capacity matches the worker count
pub fn stage_channel(capacity: usize) -> (mpsc::Sender<Item>, mpsc::Receiver<Item>) {
    mpsc::channel(capacity.max(1))
}

/// Handle to a running stage, used by the controller for ordered shutdown
pub struct StageHandle {
    name: &'static str,
    shutdown: broadcast::Sender<()>,
    task: JoinHandle<()>,
}

impl StageHandle {
    pub(crate) fn new(
        name: &'static str,
        shutdown: broadcast::Sender<()>,
        task: JoinHandle<()>,
    ) -> Self {
        Self {
            name,
            shutdown,
            task,
        }
    }

    /// Signal shutdown and wait for the stage to drain its in-flight work
    pub async fn stop(self) {
        let _ = self.shutdown.send(());
        if let Err(e) = self.task.await {
            tracing::warn!(stage = self.name, error = %e, "stage task ended abnormally");
        } else {
            tracing::debug!(stage = self.name, "stage stopped");
        }
    }
}
