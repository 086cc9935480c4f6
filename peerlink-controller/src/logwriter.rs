//! Telemetry log files under the log directory, with a small persisted ring of
//! lines that could not be written.

use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use peerlink_core::store::write_with_retry;
use peerlink_core::{BlobStore, LogWriteError, LogWriter, RetryPolicy};

pub const FALLBACK_SLOTS: usize = 10;
pub const FALLBACK_LINE_MAX: usize = 63;

const FALLBACK_NAMESPACE: &str = "log";
const FALLBACK_KEY: &str = "fallback_logs";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FallbackEntry {
    /// Seconds since the controller started.
    pub timestamp: u32,
    pub message: String,
}

/// Fixed-size circular buffer; the oldest entry is overwritten when full.
#[derive(Debug, Default, Serialize, Deserialize)]
struct FallbackRing {
    entries: Vec<FallbackEntry>,
    next: usize,
}

impl FallbackRing {
    fn push(&mut self, entry: FallbackEntry) {
        if self.entries.len() < FALLBACK_SLOTS {
            self.entries.push(entry);
        } else {
            self.entries[self.next % FALLBACK_SLOTS] = entry;
        }
        self.next = (self.next + 1) % FALLBACK_SLOTS;
    }

    /// Bring a ring read back from storage within bounds.
    fn clamp(&mut self) {
        self.entries.truncate(FALLBACK_SLOTS);
        self.next = if self.entries.len() < FALLBACK_SLOTS {
            0
        } else {
            self.next % FALLBACK_SLOTS
        };
    }

    /// Oldest first.
    fn ordered(&self) -> Vec<FallbackEntry> {
        if self.entries.len() < FALLBACK_SLOTS {
            return self.entries.clone();
        }
        let (newer, older) = self.entries.split_at(self.next);
        older.iter().chain(newer).cloned().collect()
    }
}

fn clip(line: &str) -> String {
    if line.len() <= FALLBACK_LINE_MAX {
        return line.to_string();
    }
    let mut end = FALLBACK_LINE_MAX;
    while !line.is_char_boundary(end) {
        end -= 1;
    }
    line[..end].to_string()
}

pub struct FileLogWriter {
    root: PathBuf,
    store: Arc<dyn BlobStore>,
    retry: RetryPolicy,
    started: Instant,
    ring: Mutex<FallbackRing>,
}

impl FileLogWriter {
    /// Reload any fallback entries kept in `store`.
    pub fn open(root: impl Into<PathBuf>, store: Arc<dyn BlobStore>, retry: RetryPolicy) -> Self {
        let mut ring = match store.read_blob(FALLBACK_NAMESPACE, FALLBACK_KEY) {
            Ok(Some(bytes)) => bincode::deserialize::<FallbackRing>(&bytes).unwrap_or_else(|e| {
                warn!("discarding unreadable fallback logs: {}", e);
                FallbackRing::default()
            }),
            Ok(None) => FallbackRing::default(),
            Err(e) => {
                warn!("failed to read fallback logs: {}", e);
                FallbackRing::default()
            }
        };
        ring.clamp();
        if !ring.entries.is_empty() {
            info!("restored {} fallback log entries", ring.entries.len());
        }
        Self {
            root: root.into(),
            store,
            retry,
            started: Instant::now(),
            ring: Mutex::new(ring),
        }
    }

    /// Fallback entries, oldest first.
    pub fn fallback_entries(&self) -> Vec<FallbackEntry> {
        self.ring.lock().ordered()
    }
}

impl LogWriter for FileLogWriter {
    fn append_line(&self, path: &str, line: &str) -> Result<(), LogWriteError> {
        let path = self.root.join(path);
        if let Some(dir) = path.parent() {
            std::fs::create_dir_all(dir)?;
        }
        let mut f = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)?;
        writeln!(f, "{}", line)?;
        Ok(())
    }

    fn fallback(&self, line: &str) {
        let entry = FallbackEntry {
            timestamp: u32::try_from(self.started.elapsed().as_secs()).unwrap_or(u32::MAX),
            message: clip(line),
        };
        let mut ring = self.ring.lock();
        ring.push(entry);
        match bincode::serialize(&*ring) {
            Ok(bytes) => {
                // Errors are already logged by the retry helper.
                let _ = write_with_retry(
                    self.store.as_ref(),
                    self.retry,
                    FALLBACK_NAMESPACE,
                    FALLBACK_KEY,
                    &bytes,
                );
            }
            Err(e) => warn!("failed to encode fallback logs: {}", e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use peerlink_core::MemoryStore;

    fn entry(i: u32) -> FallbackEntry {
        FallbackEntry {
            timestamp: i,
            message: format!("line {}", i),
        }
    }

    #[test]
    fn ring_keeps_newest_ten_in_order() {
        let mut ring = FallbackRing::default();
        for i in 0..13 {
            ring.push(entry(i));
        }
        let got: Vec<u32> = ring.ordered().iter().map(|e| e.timestamp).collect();
        assert_eq!(got, (3..13).collect::<Vec<_>>());
    }

    #[test]
    fn clip_respects_char_boundary() {
        assert_eq!(clip("short"), "short");
        let long = "é".repeat(40);
        let c = clip(&long);
        assert!(c.len() <= FALLBACK_LINE_MAX);
        assert_eq!(c.chars().count(), 31);
    }

    #[test]
    fn appends_lines_under_root() {
        let dir = tempfile::tempdir().unwrap();
        let w = FileLogWriter::open(dir.path(), Arc::new(MemoryStore::new()), RetryPolicy::immediate());
        w.append_line("peers/aa:00:00:00:00:01/data/2024_03_09.log", "one").unwrap();
        w.append_line("peers/aa:00:00:00:00:01/data/2024_03_09.log", "two").unwrap();
        let text = std::fs::read_to_string(
            dir.path().join("peers/aa:00:00:00:00:01/data/2024_03_09.log"),
        )
        .unwrap();
        assert_eq!(text, "one\ntwo\n");
    }

    #[test]
    fn failed_append_lands_in_persisted_fallback() {
        let dir = tempfile::tempdir().unwrap();
        // A regular file where the log directory should be makes every append fail.
        let blocked = dir.path().join("blocked");
        std::fs::write(&blocked, b"").unwrap();
        let store: Arc<dyn BlobStore> = Arc::new(MemoryStore::new());
        let w = FileLogWriter::open(&blocked, store.clone(), RetryPolicy::immediate());
        let sample = peerlink_core::TelemetrySample {
            timestamp: 1_710_000_000,
            sensor_values: [1.0, 2.0, 3.0],
            relay_state: false,
            switch_state: true,
        };
        let peer = peerlink_core::PeerRecord {
            mac: "aa:00:00:00:00:01".parse().unwrap(),
            kind: peerlink_core::PeerKind::Sensor,
            sensor_types: vec![],
            name: "Greenhouse".into(),
            last_update: 1_710_000_000,
            active: true,
            latest: sample,
            interval_sec: 60,
        };
        let written = peerlink_core::telemetry::write_batch(&w, &[sample], &[peer]);
        assert_eq!(written, 0);
        let entries = w.fallback_entries();
        assert_eq!(entries.len(), 1);
        assert!(entries[0].message.starts_with("[INFO] [1710000000] Greenhouse"));
        assert!(entries[0].message.len() <= FALLBACK_LINE_MAX);

        let reopened = FileLogWriter::open(dir.path(), store, RetryPolicy::immediate());
        assert_eq!(reopened.fallback_entries(), entries);
    }

    #[test]
    fn stored_ring_with_bad_cursor_is_clamped() {
        let store: Arc<dyn BlobStore> = Arc::new(MemoryStore::new());
        let corrupt = FallbackRing {
            entries: (0..12).map(entry).collect(),
            next: 42,
        };
        store
            .write_blob(FALLBACK_NAMESPACE, FALLBACK_KEY, &bincode::serialize(&corrupt).unwrap())
            .unwrap();
        let dir = tempfile::tempdir().unwrap();
        let w = FileLogWriter::open(dir.path(), store, RetryPolicy::immediate());
        let got: Vec<u32> = w.fallback_entries().iter().map(|e| e.timestamp).collect();
        assert_eq!(got.len(), FALLBACK_SLOTS);
        assert_eq!(got, (2..10).chain(0..2).collect::<Vec<_>>());

        w.fallback("after reload");
        assert_eq!(w.fallback_entries().len(), FALLBACK_SLOTS);
        assert_eq!(w.fallback_entries()[FALLBACK_SLOTS - 1].message, "after reload");
    }

    #[test]
    fn short_stored_ring_resets_cursor() {
        let store: Arc<dyn BlobStore> = Arc::new(MemoryStore::new());
        let corrupt = FallbackRing {
            entries: (0..3).map(entry).collect(),
            next: 7,
        };
        store
            .write_blob(FALLBACK_NAMESPACE, FALLBACK_KEY, &bincode::serialize(&corrupt).unwrap())
            .unwrap();
        let dir = tempfile::tempdir().unwrap();
        let w = FileLogWriter::open(dir.path(), store, RetryPolicy::immediate());
        w.fallback("fourth");
        let got: Vec<String> = w.fallback_entries().into_iter().map(|e| e.message).collect();
        assert_eq!(got, ["line 0", "line 1", "line 2", "fourth"]);
    }
}
