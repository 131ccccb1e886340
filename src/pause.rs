//! Pause broadcaster
//!
//! Publish-subscribe pause control: any consumer may subscribe, receives
//! the pause signal at its next quiescent point (between items), sends an
//! acknowledgement, and then sleeps until resume. `pause()` only returns
//! once every live subscriber has acknowledged, so the caller knows the
//! pipeline is quiet.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, watch};
use tracing::{debug, warn};

/// How long `pause()` waits for a single acknowledgement
const ACK_TIMEOUT: Duration = Duration::from_secs(5);

/// Pause coordinator held by the controller
pub struct PauseController {
    paused_tx: watch::Sender<bool>,
    ack_tx: mpsc::Sender<()>,
    ack_rx: tokio::sync::Mutex<mpsc::Receiver<()>>,
    subscribers: Arc<AtomicUsize>,
    paused: AtomicBool,
}

impl PauseController {
    pub fn new() -> Arc<Self> {
        let (paused_tx, _) = watch::channel(false);
        let (ack_tx, ack_rx) = mpsc::channel(64);
        Arc::new(Self {
            paused_tx,
            ack_tx,
            ack_rx: tokio::sync::Mutex::new(ack_rx),
            subscribers: Arc::new(AtomicUsize::new(0)),
            paused: AtomicBool::new(false),
        })
    }

    pub fn subscribe(&self) -> PauseSubscription {
        self.subscribers.fetch_add(1, Ordering::SeqCst);
        PauseSubscription {
            paused_rx: self.paused_tx.subscribe(),
            ack_tx: self.ack_tx.clone(),
            subscribers: self.subscribers.clone(),
        }
    }

    pub fn is_paused(&self) -> bool {
        self.paused.load(Ordering::Acquire)
    }

    /// Signal pause and wait until every subscriber acknowledges
    pub async fn pause(&self) {
        if self.paused.swap(true, Ordering::AcqRel) {
            return;
        }
        let expected = self.subscribers.load(Ordering::SeqCst);
        debug!(subscribers = expected, "pausing");
        let _ = self.paused_tx.send(true);

        let mut ack_rx = self.ack_rx.lock().await;
        for _ in 0..expected {
            match tokio::time::timeout(ACK_TIMEOUT, ack_rx.recv()).await {
                Ok(Some(())) => {}
                Ok(None) => break,
                Err(_) => {
                    warn!("subscriber did not acknowledge pause in time");
                    break;
                }
            }
        }
        debug!("pipeline paused");
    }

    pub fn resume(&self) {
        if !self.paused.swap(false, Ordering::AcqRel) {
            return;
        }
        let _ = self.paused_tx.send(false);
        debug!("pipeline resumed");
    }
}

/// One consumer's view of the pause broadcaster
pub struct PauseSubscription {
    paused_rx: watch::Receiver<bool>,
    ack_tx: mpsc::Sender<()>,
    subscribers: Arc<AtomicUsize>,
}

impl PauseSubscription {
    /// Resolves when a pause begins; cancel-safe for use in `select!`
    pub async fn wait_for_pause(&mut self) {
        if self.paused_rx.wait_for(|p| *p).await.is_err() {
            // Controller gone, never resolve again
            std::future::pending::<()>().await;
        }
    }

    /// Acknowledge the pause (quiescent point reached) and sleep until resume
    pub async fn ack_and_wait_resume(&mut self) {
        let _ = self.ack_tx.send(()).await;
        let _ = self.paused_rx.wait_for(|p| !*p).await;
    }
}

impl Drop for PauseSubscription {
    fn drop(&mut self) {
        self.subscribers.fetch_sub(1, Ordering::SeqCst);
    }
}
