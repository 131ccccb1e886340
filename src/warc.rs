//! WARC record sink seam
//!
//! Actual WARC serialization, file naming and rotation live in the
//! external writer; the pipeline only needs somewhere to hand capture
//! records and a way to observe the writing backlog so it can drain on
//! shutdown. `CountingSink` is the in-process implementation used when no
//! writer is attached (and by the tests).

use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;

use crate::stats::Counter;

/// One request/response capture handed to the WARC writer
#[derive(Debug, Clone)]
pub struct CaptureRecord {
    pub url: String,
    pub status: u16,
    pub content_type: Option<String>,
    pub body_len: u64,
    pub captured_at: DateTime<Utc>,
}

/// Destination for capture records.
///
/// Implementations must be cheap to call from many archiver tasks at once.
pub trait RecordSink: Send + Sync {
    /// Queue one record for writing
    fn submit(&self, record: CaptureRecord);

    /// Records accepted but not yet durably written
    fn pending(&self) -> usize;

    /// Block until every accepted record is durable
    fn drain(&self);
}

pub type SharedSink = Arc<dyn RecordSink>;

/// Record sink that keeps records in memory and counts submissions
#[derive(Default)]
pub struct CountingSink {
    submitted: Counter,
    records: Mutex<Vec<CaptureRecord>>,
}

impl CountingSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn shared() -> Arc<Self> {
        Arc::new(Self::new())
    }

    pub fn submitted(&self) -> u64 {
        self.submitted.get()
    }

    pub fn records(&self) -> Vec<CaptureRecord> {
        self.records.lock().clone()
    }
}

impl RecordSink for CountingSink {
    fn submit(&self, record: CaptureRecord) {
        self.submitted.inc();
        self.records.lock().push(record);
    }

    fn pending(&self) -> usize {
        0
    }

    fn drain(&self) {}
}
