//! Persistent grouped queue
//!
//! A durable FIFO of crawl items grouped by host. Blobs are appended to a
//! single append-only file; an in-memory host index tracks their
//! positions and a round-robin cursor rotates dequeues across hosts so no
//! single host is drained at a time. Every index mutation is logged to a
//! write-ahead log before it is applied, and the index is snapshotted
//! periodically so recovery only replays the WAL since the last snapshot.
//!
//! The whole queue is guarded by a single mutex. That is deliberate: the
//! queue is disk-bound and never the bottleneck next to HTTP capture.

mod encoding;
mod index;

pub use encoding::{decode_item, encode_item, DecodeError, QueuedItem};

use std::collections::HashMap;
use std::fs::{self, File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::models::Item;

use encoding::{put_uvarint, read_uvarint};
use index::{frame_wal_entry, load_snapshot, parse_wal, write_snapshot};
use index::{BlobRef, HostIndex, QueueCounters, Snapshot, WalEntry, WalOp};

const BLOB_FILE: &str = "queue.blobs";
const INDEX_FILE: &str = "queue.index";
const WAL_FILE: &str = "queue.wal";

/// When WAL appends reach the disk
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SyncMode {
    /// fsync after every append
    Always,
    /// group-commit: fsync every `sync_every_ops` appends and on snapshot
    Batch,
    /// rely on the OS page cache entirely
    Never,
}

impl Default for SyncMode {
    fn default() -> Self {
        Self::Batch
    }
}

#[derive(Debug, Error)]
pub enum QueueError {
    #[error("queue is closed")]
    Closed,
    #[error("queue is empty")]
    Empty,
    #[error("item '{0}' has no host to group under")]
    NoHost(String),
    #[error("corrupt blob {id} for host {host}: {source}")]
    Corrupt {
        host: String,
        id: Uuid,
        source: DecodeError,
    },
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Point-in-time queue statistics
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct QueueStats {
    pub total_elements: u64,
    pub unique_hosts: u64,
    pub elements_per_host: HashMap<String, u64>,
    pub enqueue_count: u64,
    pub dequeue_count: u64,
    pub first_enqueue_time: Option<DateTime<Utc>>,
    pub last_enqueue_time: Option<DateTime<Utc>>,
}

struct Inner {
    blob_file: File,
    blob_pos: u64,
    wal_file: File,
    index: HostIndex,
    counters: QueueCounters,
    ops_since_sync: u64,
    closed: bool,
}

/// Durable host-grouped FIFO with WAL-backed index
pub struct PersistentGroupedQueue {
    dir: PathBuf,
    sync_mode: SyncMode,
    sync_every_ops: u64,
    inner: Mutex<Inner>,
}

impl PersistentGroupedQueue {
    /// Open (or create) a queue in `dir`, running crash recovery if the
    /// WAL holds entries from an interrupted run.
    pub fn open(dir: impl AsRef<Path>, sync_mode: SyncMode, sync_every_ops: u64) -> Result<Self, QueueError> {
        let dir = dir.as_ref().to_path_buf();
        fs::create_dir_all(&dir)?;

        let index_path = dir.join(INDEX_FILE);
        let wal_path = dir.join(WAL_FILE);

        let wal_bytes = match fs::read(&wal_path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Vec::new(),
            Err(e) => return Err(e.into()),
        };

        let mut snapshot = load_snapshot(&index_path);
        if !wal_bytes.is_empty() {
            let entries = parse_wal(&wal_bytes);
            info!(entries = entries.len(), "recovering queue from wal");
            for entry in entries {
                match entry.op {
                    WalOp::Add => snapshot.counters.enqueue_count += 1,
                    WalOp::Pop => snapshot.counters.dequeue_count += 1,
                }
                snapshot.index.replay(entry);
            }
            // Persist the recovered state so the WAL can start empty
            write_snapshot(&index_path, &snapshot)?;
            fs::write(&wal_path, b"")?;
        }

        let blob_file = OpenOptions::new()
            .read(true)
            .append(true)
            .create(true)
            .open(dir.join(BLOB_FILE))?;
        let blob_pos = blob_file.metadata()?.len();

        let wal_file = OpenOptions::new().append(true).create(true).open(&wal_path)?;

        let Snapshot { index, counters } = snapshot;
        debug!(
            queued = index.total(),
            hosts = index.host_count(),
            "queue opened"
        );

        Ok(Self {
            dir,
            sync_mode,
            sync_every_ops: sync_every_ops.max(1),
            inner: Mutex::new(Inner {
                blob_file,
                blob_pos,
                wal_file,
                index,
                counters,
                ops_since_sync: 0,
                closed: false,
            }),
        })
    }

    /// Append an item: blob first, then WAL, then the in-memory index
    pub fn enqueue(&self, item: &Item) -> Result<(), QueueError> {
        let mut inner = self.inner.lock();
        if inner.closed {
            return Err(QueueError::Closed);
        }

        let host = item
            .url()
            .host()
            .ok_or_else(|| QueueError::NoHost(item.url().raw().to_string()))?
            .to_string();

        let body = encode_item(&QueuedItem::from_item(item));
        let mut framed = Vec::with_capacity(body.len() + 4);
        put_uvarint(&mut framed, body.len() as u64);
        framed.extend_from_slice(&body);

        let blob = BlobRef {
            id: item.id(),
            position: inner.blob_pos,
            size: framed.len() as u64,
        };

        inner.blob_file.write_all(&framed)?;

        // WAL append happens-before the index mutation; an append failure
        // leaves the in-memory state untouched (the blob becomes dead space)
        self.append_wal(
            &mut inner,
            WalEntry {
                op: WalOp::Add,
                host: host.clone(),
                blob: blob.clone(),
            },
        )?;

        inner.blob_pos += blob.size;
        inner.index.add(&host, blob);
        inner.counters.enqueue_count += 1;
        let now = Utc::now();
        inner.counters.first_enqueue_time.get_or_insert(now);
        inner.counters.last_enqueue_time = Some(now);

        Ok(())
    }

    /// Pop the next item in host rotation and decode its blob.
    ///
    /// A decode failure consumes the queue entry (the pop was already
    /// WAL-acknowledged) and is reported as an item-level `Corrupt` error,
    /// not a queue failure.
    pub fn dequeue(&self) -> Result<Item, QueueError> {
        let mut inner = self.inner.lock();
        if inner.closed {
            return Err(QueueError::Closed);
        }

        let (host, blob) = match inner.index.peek() {
            Some((host, blob)) => (host.to_string(), blob.clone()),
            None => return Err(QueueError::Empty),
        };

        self.append_wal(
            &mut inner,
            WalEntry {
                op: WalOp::Pop,
                host: host.clone(),
                blob: blob.clone(),
            },
        )?;

        inner.index.commit_pop(&host);
        inner.counters.dequeue_count += 1;

        let mut framed = vec![0u8; blob.size as usize];
        inner.blob_file.seek(SeekFrom::Start(blob.position))?;
        inner.blob_file.read_exact(&mut framed)?;

        let mut pos = 0usize;
        let item = read_uvarint(&framed, &mut pos)
            .and_then(|len| {
                let end = pos + len as usize;
                framed
                    .get(pos..end)
                    .ok_or(DecodeError::Truncated)
                    .and_then(decode_item)
            })
            .map_err(|source| {
                warn!(host = %host, blob = %blob.id, error = %source, "corrupt blob on dequeue");
                QueueError::Corrupt {
                    host: host.clone(),
                    id: blob.id,
                    source,
                }
            })?;

        Ok(item.into_item())
    }

    pub fn stats(&self) -> QueueStats {
        let inner = self.inner.lock();
        QueueStats {
            total_elements: inner.index.total(),
            unique_hosts: inner.index.host_count(),
            elements_per_host: inner.index.per_host(),
            enqueue_count: inner.counters.enqueue_count,
            dequeue_count: inner.counters.dequeue_count,
            first_enqueue_time: inner.counters.first_enqueue_time,
            last_enqueue_time: inner.counters.last_enqueue_time,
        }
    }

    pub fn len(&self) -> u64 {
        self.inner.lock().index.total()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().index.is_empty()
    }

    /// Persist the index and truncate the WAL. Runs under the queue lock;
    /// acceptable because snapshots are infrequent.
    pub fn snapshot(&self) -> Result<(), QueueError> {
        let mut inner = self.inner.lock();
        self.snapshot_locked(&mut inner)
    }

    /// Final snapshot, flush, and refusal of further operations
    pub fn close(&self) -> Result<(), QueueError> {
        let mut inner = self.inner.lock();
        if inner.closed {
            return Ok(());
        }
        inner.wal_file.sync_data()?;
        self.snapshot_locked(&mut inner)?;
        inner.blob_file.sync_data()?;
        inner.closed = true;
        info!("queue closed");
        Ok(())
    }

    fn snapshot_locked(&self, inner: &mut Inner) -> Result<(), QueueError> {
        if self.sync_mode != SyncMode::Never {
            inner.wal_file.sync_data()?;
        }

        // Serialize a snapshot without moving the live index
        let snapshot = Snapshot {
            index: std::mem::take(&mut inner.index),
            counters: inner.counters.clone(),
        };
        let result = write_snapshot(&self.dir.join(INDEX_FILE), &snapshot);
        inner.index = snapshot.index;
        result?;

        inner.wal_file.set_len(0)?;
        inner.ops_since_sync = 0;
        debug!(queued = inner.index.total(), "queue index snapshotted");
        Ok(())
    }

    fn append_wal(&self, inner: &mut Inner, entry: WalEntry) -> Result<(), QueueError> {
        let framed = frame_wal_entry(&entry);
        inner.wal_file.write_all(&framed)?;

        match self.sync_mode {
            SyncMode::Always => inner.wal_file.sync_data()?,
            SyncMode::Batch => {
                inner.ops_since_sync += 1;
                if inner.ops_since_sync >= self.sync_every_ops {
                    inner.wal_file.sync_data()?;
                    inner.ops_since_sync = 0;
                }
            }
            SyncMode::Never => {}
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn open_queue(dir: &Path) -> PersistentGroupedQueue {
        PersistentGroupedQueue::open(dir, SyncMode::Batch, 64).unwrap()
    }

    fn seed(url: &str) -> Item {
        let mut item = Item::seed(url);
        item.url_mut().parse().unwrap();
        item
    }

    #[test]
    fn enqueue_single_item() {
        let dir = TempDir::new().unwrap();
        let queue = open_queue(dir.path());

        queue.enqueue(&seed("http://example.com/")).unwrap();

        let stats = queue.stats();
        assert_eq!(stats.total_elements, 1);
        assert_eq!(stats.unique_hosts, 1);
        assert_eq!(stats.elements_per_host["example.com"], 1);
        assert_eq!(stats.enqueue_count, 1);
        assert!(stats.first_enqueue_time.is_some());
        assert!(stats.last_enqueue_time.is_some());
    }

    #[test]
    fn enqueue_multiple_hosts() {
        let dir = TempDir::new().unwrap();
        let queue = open_queue(dir.path());

        for host in ["example.org", "example.net", "example.com", "example.com"] {
            queue.enqueue(&seed(&format!("http://{host}/"))).unwrap();
        }

        let stats = queue.stats();
        assert_eq!(stats.total_elements, 4);
        assert_eq!(stats.unique_hosts, 3);
        assert_eq!(stats.elements_per_host["example.com"], 2);
    }

    #[test]
    fn enqueue_to_closed_queue() {
        let dir = TempDir::new().unwrap();
        let queue = open_queue(dir.path());
        queue.close().unwrap();

        let err = queue.enqueue(&seed("http://closed.com/")).unwrap_err();
        assert!(matches!(err, QueueError::Closed));
        let err = queue.dequeue().unwrap_err();
        assert!(matches!(err, QueueError::Closed));
    }

    #[test]
    fn dequeue_empty_queue() {
        let dir = TempDir::new().unwrap();
        let queue = open_queue(dir.path());
        assert!(matches!(queue.dequeue().unwrap_err(), QueueError::Empty));
    }

    #[test]
    fn item_without_host_is_rejected() {
        let dir = TempDir::new().unwrap();
        let queue = open_queue(dir.path());
        // never parsed, so no host is available
        let item = Item::seed("http://example.com/");
        assert!(matches!(
            queue.enqueue(&item).unwrap_err(),
            QueueError::NoHost(_)
        ));
    }

    #[test]
    fn host_fair_dequeue_order() {
        let dir = TempDir::new().unwrap();
        let queue = open_queue(dir.path());

        // A1 A2 A3 B1 C1 C2
        let urls = [
            "http://a.com/1",
            "http://a.com/2",
            "http://a.com/3",
            "http://b.com/1",
            "http://c.com/1",
            "http://c.com/2",
        ];
        for url in urls {
            queue.enqueue(&seed(url)).unwrap();
        }

        let mut order = Vec::new();
        loop {
            match queue.dequeue() {
                Ok(item) => order.push(item.url().raw().to_string()),
                Err(QueueError::Empty) => break,
                Err(e) => panic!("unexpected error: {e}"),
            }
        }
        assert_eq!(
            order,
            [
                "http://a.com/1",
                "http://b.com/1",
                "http://c.com/1",
                "http://a.com/2",
                "http://c.com/2",
                "http://a.com/3",
            ]
        );
    }

    #[test]
    fn first_dequeues_touch_distinct_hosts() {
        let dir = TempDir::new().unwrap();
        let queue = open_queue(dir.path());

        let hosts = ["a.com", "b.com", "c.com", "d.com"];
        for host in hosts {
            for n in 0..3 {
                queue.enqueue(&seed(&format!("http://{host}/{n}"))).unwrap();
            }
        }

        let mut seen = std::collections::HashSet::new();
        for _ in 0..hosts.len() {
            let item = queue.dequeue().unwrap();
            seen.insert(item.url().host().unwrap().to_string());
        }
        assert_eq!(seen.len(), hosts.len());
    }

    #[test]
    fn dequeued_item_preserves_fields() {
        let dir = TempDir::new().unwrap();
        let queue = open_queue(dir.path());

        let mut item = Item::new(
            Uuid::new_v4(),
            crate::models::CrawlUrl::new("http://example.com/deep").with_hops(4),
            Some("http://example.com/".to_string()),
            crate::models::ItemKind::Seed,
        );
        item.url_mut().parse().unwrap();
        item.set_bypass_seencheck(true);
        item.set_locally_crawled(9);
        queue.enqueue(&item).unwrap();

        let out = queue.dequeue().unwrap();
        assert_eq!(out.id(), item.id());
        assert_eq!(out.url().raw(), "http://example.com/deep");
        assert_eq!(out.url().hops(), 4);
        assert_eq!(out.parent_url(), Some("http://example.com/"));
        assert!(out.bypass_seencheck());
        assert_eq!(out.locally_crawled(), 9);
    }

    #[test]
    fn reopen_after_clean_close() {
        let dir = TempDir::new().unwrap();
        {
            let queue = open_queue(dir.path());
            for n in 0..10 {
                queue.enqueue(&seed(&format!("http://example.com/{n}"))).unwrap();
            }
            queue.close().unwrap();
        }

        let queue = open_queue(dir.path());
        let stats = queue.stats();
        assert_eq!(stats.total_elements, 10);
        assert_eq!(stats.enqueue_count, 10);
        let first = queue.dequeue().unwrap();
        assert_eq!(first.url().raw(), "http://example.com/0");
    }

    #[test]
    fn crash_recovery_replays_wal() {
        let dir = TempDir::new().unwrap();

        // Simulate a crash: drop the queue without close(), so nothing was
        // snapshotted and the whole history lives in the WAL.
        {
            let queue = PersistentGroupedQueue::open(dir.path(), SyncMode::Always, 1).unwrap();
            for host in ["a.com", "b.com"] {
                for n in 0..50 {
                    queue.enqueue(&seed(&format!("http://{host}/{n}"))).unwrap();
                }
            }
            for _ in 0..40 {
                queue.dequeue().unwrap();
            }
            // no close()
        }

        let queue = open_queue(dir.path());
        let stats = queue.stats();
        assert_eq!(stats.total_elements, 60);
        assert_eq!(stats.enqueue_count, 100);
        assert_eq!(stats.dequeue_count, 40);

        // 40 alternating pops consumed a.com/0..19 and b.com/0..19; the
        // rotation resumes with the next undelivered blob.
        let next = queue.dequeue().unwrap();
        assert_eq!(next.url().raw(), "http://a.com/20");

        // No duplicates, no omissions among the remainder
        let mut remaining: Vec<String> = vec![next.url().raw().to_string()];
        loop {
            match queue.dequeue() {
                Ok(item) => remaining.push(item.url().raw().to_string()),
                Err(QueueError::Empty) => break,
                Err(e) => panic!("unexpected error: {e}"),
            }
        }
        assert_eq!(remaining.len(), 60);
        let unique: std::collections::HashSet<_> = remaining.iter().collect();
        assert_eq!(unique.len(), 60);
        for host in ["a.com", "b.com"] {
            for n in 20..50 {
                assert!(remaining.contains(&format!("http://{host}/{n}")));
            }
        }
    }

    #[test]
    fn recovery_preserves_host_fifo() {
        let dir = TempDir::new().unwrap();
        {
            let queue = PersistentGroupedQueue::open(dir.path(), SyncMode::Always, 1).unwrap();
            for n in 0..20 {
                queue.enqueue(&seed(&format!("http://solo.com/{n}"))).unwrap();
            }
            for _ in 0..7 {
                queue.dequeue().unwrap();
            }
        }

        let queue = open_queue(dir.path());
        for n in 7..20 {
            let item = queue.dequeue().unwrap();
            assert_eq!(item.url().raw(), format!("http://solo.com/{n}"));
        }
    }

    #[test]
    fn corrupt_blob_fails_single_dequeue() {
        let dir = TempDir::new().unwrap();
        let queue = open_queue(dir.path());
        queue.enqueue(&seed("http://a.com/1")).unwrap();
        queue.enqueue(&seed("http://b.com/1")).unwrap();

        // Scribble over the first blob in place
        {
            let mut file = OpenOptions::new()
                .write(true)
                .open(dir.path().join(BLOB_FILE))
                .unwrap();
            file.seek(SeekFrom::Start(2)).unwrap();
            file.write_all(&[0xff; 8]).unwrap();
        }

        let err = queue.dequeue().unwrap_err();
        assert!(matches!(err, QueueError::Corrupt { .. }));

        // The queue itself is still usable and the rotation moved on
        let ok = queue.dequeue().unwrap();
        assert_eq!(ok.url().raw(), "http://b.com/1");
    }

    #[test]
    fn snapshot_truncates_wal() {
        let dir = TempDir::new().unwrap();
        let queue = open_queue(dir.path());
        for n in 0..5 {
            queue.enqueue(&seed(&format!("http://example.com/{n}"))).unwrap();
        }

        assert!(fs::metadata(dir.path().join(WAL_FILE)).unwrap().len() > 0);
        queue.snapshot().unwrap();
        assert_eq!(fs::metadata(dir.path().join(WAL_FILE)).unwrap().len(), 0);

        // State survives a reopen through the snapshot alone
        drop(queue);
        let queue = open_queue(dir.path());
        assert_eq!(queue.len(), 5);
    }
}
