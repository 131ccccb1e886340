//! Local seencheck store
//!
//! Maps the xxh3 hash of a canonicalized URL to a "seen" flag. `seen` is a
//! read-mutate operation: it marks the URL and returns whether it was
//! already there, so a `true` result means "filter this URL out". Hashes
//! are appended to a flat file so the set survives restarts; a partial
//! record at the tail (crash mid-write) is ignored on load.

use std::collections::HashSet;
use std::fs::{self, File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::Path;

use anyhow::{Context, Result};
use parking_lot::Mutex;
use tracing::debug;
use xxhash_rust::xxh3::xxh3_64;

const SEEN_FILE: &str = "seen.bin";

struct Inner {
    seen: HashSet<u64>,
    writer: BufWriter<File>,
}

/// Persistent "have we seen this URL" filter
pub struct Seencheck {
    inner: Mutex<Inner>,
}

impl Seencheck {
    pub fn open(dir: impl AsRef<Path>) -> Result<Self> {
        let dir = dir.as_ref();
        fs::create_dir_all(dir)
            .with_context(|| format!("failed to create seencheck dir '{}'", dir.display()))?;
        let path = dir.join(SEEN_FILE);

        let mut seen = HashSet::new();
        match fs::read(&path) {
            Ok(bytes) => {
                for chunk in bytes.chunks_exact(8) {
                    seen.insert(u64::from_le_bytes(chunk.try_into().unwrap()));
                }
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e).context("failed to read seencheck store"),
        }

        let file = OpenOptions::new()
            .append(true)
            .create(true)
            .open(&path)
            .with_context(|| format!("failed to open seencheck store '{}'", path.display()))?;

        debug!(entries = seen.len(), "seencheck store opened");

        Ok(Self {
            inner: Mutex::new(Inner {
                seen,
                writer: BufWriter::new(file),
            }),
        })
    }

    /// Mark `url` as seen, returning whether it was already marked
    pub fn seen(&self, url: &str) -> bool {
        let hash = Self::hash(url);
        let mut inner = self.inner.lock();
        if !inner.seen.insert(hash) {
            return true;
        }
        // Append failures only cost persistence, not correctness
        let _ = inner.writer.write_all(&hash.to_le_bytes());
        false
    }

    pub fn len(&self) -> usize {
        self.inner.lock().seen.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().seen.is_empty()
    }

    /// Flush buffered hashes to disk
    pub fn flush(&self) -> Result<()> {
        self.inner
            .lock()
            .writer
            .flush()
            .context("failed to flush seencheck store")
    }

    fn hash(url: &str) -> u64 {
        xxh3_64(url.to_lowercase().as_bytes())
    }
}
