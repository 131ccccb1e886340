//! Host index, write-ahead log entries, and snapshot I/O
//!
//! The in-memory index maps each host to the ordered list of its blob
//! references and keeps a rotation order over hosts with a dequeue cursor.
//! Every mutation is written to the WAL before it is applied; a periodic
//! snapshot persists the whole index atomically and resets the WAL.

use std::collections::{HashMap, VecDeque};
use std::fs;
use std::io::Write;
use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::warn;
use uuid::Uuid;

use super::encoding::{put_uvarint, read_uvarint};

/// Location of one encoded item in the blob file
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub(crate) struct BlobRef {
    pub id: Uuid,
    pub position: u64,
    pub size: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub(crate) enum WalOp {
    Add,
    Pop,
}

/// One WAL record, appended before the matching in-memory mutation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub(crate) struct WalEntry {
    pub op: WalOp,
    pub host: String,
    pub blob: BlobRef,
}

/// Durable counters carried across restarts in the snapshot
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub(crate) struct QueueCounters {
    pub enqueue_count: u64,
    pub dequeue_count: u64,
    pub first_enqueue_time: Option<chrono::DateTime<chrono::Utc>>,
    pub last_enqueue_time: Option<chrono::DateTime<chrono::Utc>>,
}

/// In-memory host index with round-robin dequeue cursor.
///
/// Invariant: every host present in `order` has a non-empty blob list, and
/// `order` contains each host exactly once, in first-enqueue order.
#[derive(Debug, Default, Serialize, Deserialize)]
pub(crate) struct HostIndex {
    hosts: HashMap<String, VecDeque<BlobRef>>,
    order: Vec<String>,
    cursor: usize,
}

impl HostIndex {
    /// Append a blob to a host's list, registering the host if new
    pub fn add(&mut self, host: &str, blob: BlobRef) {
        let list = self.hosts.entry(host.to_string()).or_default();
        if list.is_empty() && !self.order.iter().any(|h| h == host) {
            self.order.push(host.to_string());
        }
        list.push_back(blob);
    }

    /// The next blob the round-robin rotation would yield, without popping it
    pub fn peek(&self) -> Option<(&str, &BlobRef)> {
        let host = self.order.get(self.cursor)?;
        let blob = self.hosts.get(host).and_then(|l| l.front())?;
        Some((host.as_str(), blob))
    }

    /// Pop the head blob of `host` and advance the cursor.
    ///
    /// The cursor advances past the popped host, modulo the host-order
    /// length at that instant; if the pop emptied the host, the host is
    /// removed and the cursor index is left in place so it now names the
    /// following host (wrapping to zero past the end).
    pub fn commit_pop(&mut self, host: &str) -> Option<BlobRef> {
        let idx = self.order.iter().position(|h| h == host)?;
        let list = self.hosts.get_mut(host)?;
        let blob = list.pop_front()?;

        if list.is_empty() {
            self.hosts.remove(host);
            self.order.remove(idx);
            if self.cursor >= self.order.len() {
                self.cursor = 0;
            }
        } else {
            self.cursor = (idx + 1) % self.order.len();
        }

        Some(blob)
    }

    /// Re-apply one WAL entry during recovery
    pub fn replay(&mut self, entry: WalEntry) {
        match entry.op {
            WalOp::Add => self.add(&entry.host, entry.blob),
            WalOp::Pop => match self.commit_pop(&entry.host) {
                Some(popped) if popped.id == entry.blob.id => {}
                Some(popped) => {
                    warn!(
                        host = %entry.host,
                        expected = %entry.blob.id,
                        got = %popped.id,
                        "wal replay popped unexpected blob"
                    );
                }
                None => {
                    warn!(host = %entry.host, blob = %entry.blob.id, "wal replay pop on missing host");
                }
            },
        }
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    pub fn total(&self) -> u64 {
        self.hosts.values().map(|l| l.len() as u64).sum()
    }

    pub fn host_count(&self) -> u64 {
        self.order.len() as u64
    }

    pub fn per_host(&self) -> HashMap<String, u64> {
        self.hosts
            .iter()
            .map(|(h, l)| (h.clone(), l.len() as u64))
            .collect()
    }

    #[cfg(test)]
    pub fn order(&self) -> &[String] {
        &self.order
    }
}

/// Full durable state written by a snapshot
#[derive(Debug, Default, Serialize, Deserialize)]
pub(crate) struct Snapshot {
    pub index: HostIndex,
    pub counters: QueueCounters,
}

/// Serialize one WAL entry with its varint length frame
pub(crate) fn frame_wal_entry(entry: &WalEntry) -> Vec<u8> {
    // WalEntry contains nothing bincode can reject
    let body = bincode::serialize(entry).expect("wal entry serializes");
    let mut framed = Vec::with_capacity(body.len() + 4);
    put_uvarint(&mut framed, body.len() as u64);
    framed.extend_from_slice(&body);
    framed
}

/// Parse every intact WAL entry, discarding any partial record at the tail
pub(crate) fn parse_wal(bytes: &[u8]) -> Vec<WalEntry> {
    let mut entries = Vec::new();
    let mut pos = 0usize;

    while pos < bytes.len() {
        let start = pos;
        let len = match read_uvarint(bytes, &mut pos) {
            Ok(len) => len as usize,
            Err(_) => {
                warn!(offset = start, "discarding partial wal tail");
                break;
            }
        };
        let end = match pos.checked_add(len) {
            Some(end) if end <= bytes.len() => end,
            _ => {
                warn!(offset = start, "discarding truncated wal entry");
                break;
            }
        };
        match bincode::deserialize::<WalEntry>(&bytes[pos..end]) {
            Ok(entry) => entries.push(entry),
            Err(e) => {
                warn!(offset = start, error = %e, "discarding undecodable wal tail");
                break;
            }
        }
        pos = end;
    }

    entries
}

/// Write a snapshot atomically: temp file, fsync, rotate prior generation
/// to `.old`, rename into place.
pub(crate) fn write_snapshot(index_path: &Path, snapshot: &Snapshot) -> std::io::Result<()> {
    let temp_path = index_path.with_extension("tmp");
    let old_path = index_path.with_extension("old");

    let encoded = bincode::serialize(snapshot)
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;

    let mut temp = fs::File::create(&temp_path)?;
    temp.write_all(&encoded)?;
    temp.sync_all()?;
    drop(temp);

    match fs::remove_file(&old_path) {
        Ok(()) => {}
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => return Err(e),
    }
    if index_path.exists() {
        fs::rename(index_path, &old_path)?;
    }
    fs::rename(&temp_path, index_path)?;

    Ok(())
}

/// Load the most recent intact snapshot: current generation, then `.old`,
/// then an empty state.
pub(crate) fn load_snapshot(index_path: &Path) -> Snapshot {
    for path in [index_path.to_path_buf(), index_path.with_extension("old")] {
        match fs::read(&path) {
            Ok(bytes) => match bincode::deserialize::<Snapshot>(&bytes) {
                Ok(snapshot) => return snapshot,
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "undecodable index snapshot, trying fallback");
                }
            },
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => {
                warn!(path = %path.display(), error = %e, "unreadable index snapshot, trying fallback");
            }
        }
    }
    Snapshot::default()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn blob(n: u64) -> BlobRef {
        BlobRef {
            id: Uuid::new_v4(),
            position: n * 100,
            size: 100,
        }
    }

    #[test]
    fn round_robin_rotation() {
        let mut index = HostIndex::default();
        // A1 A2 A3 B1 C1 C2
        index.add("a.com", blob(0));
        index.add("a.com", blob(1));
        index.add("a.com", blob(2));
        index.add("b.com", blob(3));
        index.add("c.com", blob(4));
        index.add("c.com", blob(5));

        let mut hosts = Vec::new();
        while let Some((host, _)) = index.peek() {
            let host = host.to_string();
            index.commit_pop(&host).unwrap();
            hosts.push(host);
        }
        assert_eq!(hosts, ["a.com", "b.com", "c.com", "a.com", "c.com", "a.com"]);
        assert!(index.is_empty());
    }

    #[test]
    fn fifo_within_host() {
        let mut index = HostIndex::default();
        let first = blob(0);
        let second = blob(1);
        index.add("a.com", first.clone());
        index.add("a.com", second.clone());

        assert_eq!(index.commit_pop("a.com").unwrap(), first);
        assert_eq!(index.commit_pop("a.com").unwrap(), second);
    }

    #[test]
    fn host_removed_when_drained() {
        let mut index = HostIndex::default();
        index.add("a.com", blob(0));
        index.add("b.com", blob(1));

        index.commit_pop("a.com").unwrap();
        assert_eq!(index.order(), ["b.com"]);
        assert_eq!(index.host_count(), 1);
    }

    #[test]
    fn replay_reconstructs_state() {
        let mut live = HostIndex::default();
        let mut log = Vec::new();

        for n in 0..6u64 {
            let host = if n % 2 == 0 { "even.com" } else { "odd.com" };
            let b = blob(n);
            log.push(WalEntry {
                op: WalOp::Add,
                host: host.to_string(),
                blob: b.clone(),
            });
            live.add(host, b);
        }
        for _ in 0..3 {
            let (host, b) = {
                let (h, b) = live.peek().unwrap();
                (h.to_string(), b.clone())
            };
            log.push(WalEntry {
                op: WalOp::Pop,
                host: host.clone(),
                blob: b,
            });
            live.commit_pop(&host).unwrap();
        }

        let mut replayed = HostIndex::default();
        for entry in log {
            replayed.replay(entry);
        }

        assert_eq!(replayed.total(), live.total());
        assert_eq!(replayed.per_host(), live.per_host());
        // Rotation must resume from the same place
        assert_eq!(
            replayed.peek().map(|(h, b)| (h.to_string(), b.clone())),
            live.peek().map(|(h, b)| (h.to_string(), b.clone()))
        );
    }

    #[test]
    fn wal_partial_tail_discarded() {
        let entries = vec![
            WalEntry {
                op: WalOp::Add,
                host: "a.com".to_string(),
                blob: blob(0),
            },
            WalEntry {
                op: WalOp::Add,
                host: "b.com".to_string(),
                blob: blob(1),
            },
        ];
        let mut bytes = Vec::new();
        for e in &entries {
            bytes.extend(frame_wal_entry(e));
        }
        let full_len = bytes.len();
        bytes.extend_from_slice(&[0x20, 0x01, 0x02]); // looks like a frame header, body missing

        let parsed = parse_wal(&bytes);
        assert_eq!(parsed, entries);

        // Cutting into the second entry drops it entirely
        let parsed = parse_wal(&bytes[..full_len - 3]);
        assert_eq!(parsed.len(), 1);
    }

    #[test]
    fn snapshot_write_and_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("queue.index");

        let mut snapshot = Snapshot::default();
        snapshot.index.add("a.com", blob(0));
        snapshot.counters.enqueue_count = 1;
        write_snapshot(&path, &snapshot).unwrap();

        let loaded = load_snapshot(&path);
        assert_eq!(loaded.index.total(), 1);
        assert_eq!(loaded.counters.enqueue_count, 1);

        // A second snapshot keeps the prior generation as .old
        snapshot.index.add("b.com", blob(1));
        write_snapshot(&path, &snapshot).unwrap();
        assert!(path.with_extension("old").exists());

        // Corrupt the current generation: load falls back to .old
        fs::write(&path, b"garbage").unwrap();
        let fallback = load_snapshot(&path);
        assert_eq!(fallback.index.total(), 1);
    }

    #[test]
    fn load_snapshot_with_neither_generation_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let snapshot = load_snapshot(&dir.path().join("queue.index"));
        assert!(snapshot.index.is_empty());
        assert_eq!(snapshot.counters.enqueue_count, 0);
    }
}
