//! Worker state registry backing the /workers endpoints
//!
//! Archiver tasks check a slot out while they hold an item, so the API
//! reports which workers are busy, what they last touched, and the last
//! error they saw.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

/// State of one worker slot as reported by the API
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerState {
    pub worker_id: usize,
    pub status: String,
    pub last_error: String,
    pub last_seen: DateTime<Utc>,
    pub locked: bool,
}

impl WorkerState {
    fn idle(worker_id: usize) -> Self {
        Self {
            worker_id,
            status: "idle".to_string(),
            last_error: String::new(),
            last_seen: Utc::now(),
            locked: false,
        }
    }
}

/// Registry of worker slots, sized to the crawl's worker count
pub struct WorkerRegistry {
    states: DashMap<usize, WorkerState>,
    free: Mutex<Vec<usize>>,
}

impl WorkerRegistry {
    pub fn new(workers: usize) -> Self {
        let states = DashMap::new();
        let mut free = Vec::with_capacity(workers);
        for id in (0..workers).rev() {
            states.insert(id, WorkerState::idle(id));
            free.push(id);
        }
        Self {
            states,
            free: Mutex::new(free),
        }
    }

    pub fn shared(workers: usize) -> Arc<Self> {
        Arc::new(Self::new(workers))
    }

    /// Claim a slot; allocates a new one if all are busy
    pub fn checkout(&self) -> usize {
        let id = {
            let mut free = self.free.lock();
            free.pop()
        };
        match id {
            Some(id) => id,
            None => {
                let id = self.states.len();
                self.states.insert(id, WorkerState::idle(id));
                id
            }
        }
    }

    /// Update a busy slot's status line
    pub fn update(&self, id: usize, status: &str, detail: &str) {
        if let Some(mut state) = self.states.get_mut(&id) {
            state.status = if detail.is_empty() {
                status.to_string()
            } else {
                format!("{status} {detail}")
            };
            state.locked = true;
            state.last_seen = Utc::now();
        }
    }

    pub fn record_error(&self, id: usize, error: &str) {
        if let Some(mut state) = self.states.get_mut(&id) {
            state.last_error = error.to_string();
            state.last_seen = Utc::now();
        }
    }

    /// Return a slot to the free pool
    pub fn release(&self, id: usize) {
        if let Some(mut state) = self.states.get_mut(&id) {
            state.status = "idle".to_string();
            state.locked = false;
            state.last_seen = Utc::now();
        }
        self.free.lock().push(id);
    }

    pub fn get(&self, id: usize) -> Option<WorkerState> {
        self.states.get(&id).map(|s| s.value().clone())
    }

    /// All worker states, ordered by id
    pub fn all(&self) -> Vec<WorkerState> {
        let mut states: Vec<WorkerState> = self.states.iter().map(|s| s.value().clone()).collect();
        states.sort_by_key(|s| s.worker_id);
        states
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn checkout_and_release_cycle() {
        let registry = WorkerRegistry::new(2);

        let a = registry.checkout();
        let b = registry.checkout();
        assert_ne!(a, b);

        registry.update(a, "archiving", "http://example.com/");
        let state = registry.get(a).unwrap();
        assert!(state.locked);
        assert_eq!(state.status, "archiving http://example.com/");

        registry.release(a);
        let state = registry.get(a).unwrap();
        assert!(!state.locked);
        assert_eq!(state.status, "idle");

        // Released slot is reused
        assert_eq!(registry.checkout(), a);
        registry.release(a);
        registry.release(b);
    }

    #[test]
    fn overflow_allocates_new_slot() {
        let registry = WorkerRegistry::new(1);
        let a = registry.checkout();
        let b = registry.checkout();
        assert_ne!(a, b);
        assert_eq!(registry.all().len(), 2);
    }

    #[test]
    fn errors_are_recorded() {
        let registry = WorkerRegistry::new(1);
        let id = registry.checkout();
        registry.record_error(id, "connection refused");
        assert_eq!(registry.get(id).unwrap().last_error, "connection refused");
    }

    #[test]
    fn unknown_worker_is_none() {
        let registry = WorkerRegistry::new(1);
        assert!(registry.get(42).is_none());
    }
}
