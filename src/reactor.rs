//! Reactor: token-bounded admission and the in-flight state table
//!
//! The reactor is the fan-out/fan-in point of the pipeline. Every root
//! item acquires one token (a semaphore permit) before entering, is
//! registered in the state table, and is emitted towards the preprocessor.
//! Feedback re-entries reuse the item's existing token; `mark_as_finished`
//! removes the table entry and the dropped permit returns the token. The
//! table therefore never holds more than `capacity` items.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tracing::debug;
use uuid::Uuid;

use crate::models::{Item, ItemSource};

#[derive(Debug, Error)]
pub enum ReactorError {
    #[error("reactor is frozen and refuses new items")]
    Frozen,
    #[error("reactor is stopped")]
    Stopped,
    #[error("item {0} is not registered in the state table")]
    NotRegistered(Uuid),
    #[error("reactor output channel is closed")]
    ChannelClosed,
}

struct StateEntry {
    source: ItemSource,
    url: String,
    _permit: OwnedSemaphorePermit,
}

/// Token-bounded dispatcher owning the authoritative in-flight table
pub struct Reactor {
    capacity: usize,
    tokens: Arc<Semaphore>,
    state: Mutex<HashMap<Uuid, StateEntry>>,
    output: mpsc::Sender<Item>,
    frozen: AtomicBool,
}

impl Reactor {
    /// Create a reactor with `capacity` tokens; the returned receiver is
    /// the pipeline's entry channel (consumed by the preprocessor).
    pub fn new(capacity: usize) -> (Arc<Self>, mpsc::Receiver<Item>) {
        let (output, rx) = mpsc::channel(capacity.max(1));
        let reactor = Arc::new(Self {
            capacity,
            tokens: Arc::new(Semaphore::new(capacity)),
            state: Mutex::new(HashMap::new()),
            output,
            frozen: AtomicBool::new(false),
        });
        (reactor, rx)
    }

    /// Admit a new root item, blocking until a token is free.
    ///
    /// The item's source must already be set (`Insert`, `Queue` or `Hq`).
    pub async fn receive_insert(&self, item: Item) -> Result<(), ReactorError> {
        if self.frozen.load(Ordering::Acquire) {
            return Err(ReactorError::Frozen);
        }

        let permit = match self.tokens.clone().acquire_owned().await {
            Ok(permit) => permit,
            // the semaphore is closed by freeze(), waking blocked inserters
            Err(_) if self.frozen.load(Ordering::Acquire) => return Err(ReactorError::Frozen),
            Err(_) => return Err(ReactorError::Stopped),
        };

        let id = item.id();
        self.state.lock().insert(
            id,
            StateEntry {
                source: item.source(),
                url: item.url().raw().to_string(),
                _permit: permit,
            },
        );

        debug!(item = %item.short_id(), url = item.url().raw(), "item admitted");

        if self.output.send(item).await.is_err() {
            self.state.lock().remove(&id);
            return Err(ReactorError::ChannelClosed);
        }
        Ok(())
    }

    /// Re-enter an in-flight item without consuming a new token
    pub async fn receive_feedback(&self, mut item: Item) -> Result<(), ReactorError> {
        let id = item.id();
        {
            let mut state = self.state.lock();
            let entry = state.get_mut(&id).ok_or(ReactorError::NotRegistered(id))?;
            entry.source = ItemSource::Feedback;
        }
        item.set_source(ItemSource::Feedback);

        debug!(item = %item.short_id(), "item fed back");

        if self.output.send(item).await.is_err() {
            return Err(ReactorError::ChannelClosed);
        }
        Ok(())
    }

    /// Remove a finished item from the state table, returning its token
    pub fn mark_as_finished(&self, id: Uuid) -> Result<(), ReactorError> {
        match self.state.lock().remove(&id) {
            Some(entry) => {
                debug!(item = %id, url = entry.url, "item finished");
                Ok(())
            }
            None => Err(ReactorError::NotRegistered(id)),
        }
    }

    /// Number of items currently somewhere in the pipeline
    pub fn in_flight(&self) -> usize {
        self.state.lock().len()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn is_empty(&self) -> bool {
        self.state.lock().is_empty()
    }

    /// Refuse new inserts but let in-flight items drain.
    ///
    /// Closing the semaphore wakes inserters blocked on a token; permits
    /// already held keep working until their items finish.
    pub fn freeze(&self) {
        self.frozen.store(true, Ordering::Release);
        self.tokens.close();
        debug!("reactor frozen");
    }

    pub fn is_frozen(&self) -> bool {
        self.frozen.load(Ordering::Acquire)
    }

    /// Stop the reactor: freeze and fail any pending token waiters
    pub fn stop(&self) {
        self.freeze();
        self.tokens.close();
        debug!("reactor stopped");
    }

    /// Snapshot of the state table for diagnostics: (id, source, url)
    pub fn state_table(&self) -> Vec<(Uuid, ItemSource, String)> {
        self.state
            .lock()
            .iter()
            .map(|(id, e)| (*id, e.source, e.url.clone()))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    /// Drive `seeds` items through insert -> feedback -> finish with a
    /// consumer pool, checking the state table drains completely.
    async fn run_cycle(tokens: usize, seeds: usize) {
        let (reactor, mut rx) = Reactor::new(tokens);

        let consumed = Arc::new(AtomicUsize::new(0));
        let max_in_flight = Arc::new(AtomicUsize::new(0));

        let consumer = {
            let reactor = reactor.clone();
            let consumed = consumed.clone();
            let max_in_flight = max_in_flight.clone();
            tokio::spawn(async move {
                while let Some(item) = rx.recv().await {
                    max_in_flight.fetch_max(reactor.in_flight(), Ordering::Relaxed);
                    if item.source() != ItemSource::Feedback {
                        reactor.receive_feedback(item).await.unwrap();
                    } else {
                        reactor.mark_as_finished(item.id()).unwrap();
                        consumed.fetch_add(1, Ordering::Relaxed);
                    }
                }
            })
        };

        for n in 0..seeds {
            let mut item = Item::seed(format!("http://example.com/{n}"));
            item.set_source(ItemSource::Insert);
            reactor.receive_insert(item).await.unwrap();
        }

        tokio::time::timeout(Duration::from_secs(10), async {
            while consumed.load(Ordering::Relaxed) < seeds {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("all seeds should finish");

        assert!(reactor.is_empty(), "state table must drain");
        assert_eq!(consumed.load(Ordering::Relaxed), seeds);
        assert!(
            max_in_flight.load(Ordering::Relaxed) <= tokens,
            "state table exceeded the token budget"
        );

        reactor.stop();
        consumer.abort();
        let _ = consumer.await;
    }

    #[tokio::test]
    async fn cycle_balanced() {
        run_cycle(50, 200).await;
    }

    #[tokio::test]
    async fn cycle_few_tokens() {
        run_cycle(3, 100).await;
    }

    #[tokio::test]
    async fn cycle_more_tokens_than_seeds() {
        run_cycle(64, 10).await;
    }

    #[tokio::test]
    async fn insert_blocks_on_exhausted_tokens() {
        let (reactor, mut rx) = Reactor::new(1);

        let mut first = Item::seed("http://example.com/1");
        first.set_source(ItemSource::Insert);
        let first_id = first.id();
        reactor.receive_insert(first).await.unwrap();

        let mut second = Item::seed("http://example.com/2");
        second.set_source(ItemSource::Insert);
        let blocked = tokio::time::timeout(
            Duration::from_millis(100),
            reactor.receive_insert(second),
        )
        .await;
        assert!(blocked.is_err(), "second insert must wait for a token");

        // Releasing the first token unblocks a retry
        reactor.mark_as_finished(first_id).unwrap();
        let _ = rx.recv().await;

        let mut third = Item::seed("http://example.com/3");
        third.set_source(ItemSource::Insert);
        reactor.receive_insert(third).await.unwrap();

        assert_eq!(reactor.in_flight(), 1);
    }

    #[tokio::test]
    async fn frozen_reactor_refuses_inserts() {
        let (reactor, _rx) = Reactor::new(4);
        reactor.freeze();

        let mut item = Item::seed("http://example.com/");
        item.set_source(ItemSource::Insert);
        assert!(matches!(
            reactor.receive_insert(item).await,
            Err(ReactorError::Frozen)
        ));
    }

    #[tokio::test]
    async fn feedback_requires_registration() {
        let (reactor, _rx) = Reactor::new(4);
        let item = Item::seed("http://example.com/");
        assert!(matches!(
            reactor.receive_feedback(item).await,
            Err(ReactorError::NotRegistered(_))
        ));
    }

    #[tokio::test]
    async fn finish_unknown_item_errors() {
        let (reactor, _rx) = Reactor::new(4);
        assert!(matches!(
            reactor.mark_as_finished(Uuid::new_v4()),
            Err(ReactorError::NotRegistered(_))
        ));
    }
}
