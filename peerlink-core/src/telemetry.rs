//! Telemetry log batching: buffer samples from the logging queue and write one line
//! per sample to a per-peer, per-day log.

use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use tracing::{debug, warn};

use crate::mac::MacAddr;
use crate::protocol::TelemetrySample;
use crate::registry::PeerRecord;

/// Flush once this many samples are buffered.
pub const LOG_BATCH_SIZE: usize = 5;

/// Flush at least this often while samples are buffered. Also the queue wait.
pub const LOG_FLUSH_INTERVAL: Duration = Duration::from_secs(5);

/// Destination for formatted telemetry lines.
pub trait LogWriter: Send {
    /// Append `line` to the log identified by `path` (relative to the writer's root).
    fn append_line(&self, path: &str, line: &str) -> Result<(), LogWriteError>;

    /// Keep `line` somewhere after `append_line` failed. Default drops it.
    fn fallback(&self, _line: &str) {}
}

#[derive(Debug, thiserror::Error)]
pub enum LogWriteError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("log medium unavailable")]
    Unavailable,
}

/// Log identifier for `mac` on the UTC calendar day of `timestamp`.
pub fn log_path(mac: &MacAddr, timestamp: u32) -> String {
    let day = DateTime::<Utc>::from_timestamp(i64::from(timestamp), 0)
        .map(|d| d.format("%Y_%m_%d").to_string())
        .unwrap_or_else(|| "1970_01_01".to_string());
    format!("peers/{}/data/{}.log", mac, day)
}

pub fn format_line(name: &str, s: &TelemetrySample) -> String {
    format!(
        "[INFO] [{}] {}: sensors=[{:.2},{:.2},{:.2}], relay={}, switch={}",
        s.timestamp,
        name,
        s.sensor_values[0],
        s.sensor_values[1],
        s.sensor_values[2],
        u8::from(s.relay_state),
        u8::from(s.switch_state)
    )
}

/// Accumulates samples until the batch is full or the flush interval has passed.
pub struct LogBatcher {
    buffer: Vec<TelemetrySample>,
    batch_size: usize,
    flush_interval: Duration,
    last_flush: Instant,
}

impl LogBatcher {
    pub fn new(now: Instant) -> Self {
        Self::with_limits(now, LOG_BATCH_SIZE, LOG_FLUSH_INTERVAL)
    }

    pub fn with_limits(now: Instant, batch_size: usize, flush_interval: Duration) -> Self {
        Self {
            buffer: Vec::with_capacity(batch_size),
            batch_size: batch_size.max(1),
            flush_interval,
            last_flush: now,
        }
    }

    pub fn push(&mut self, sample: TelemetrySample) {
        self.buffer.push(sample);
    }

    pub fn len(&self) -> usize {
        self.buffer.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }

    /// True when the batch is full, or non-empty and the interval has elapsed.
    pub fn is_due(&self, now: Instant) -> bool {
        self.buffer.len() >= self.batch_size
            || (!self.buffer.is_empty()
                && now.saturating_duration_since(self.last_flush) >= self.flush_interval)
    }

    /// Take the buffered samples and restart the interval.
    pub fn take(&mut self, now: Instant) -> Vec<TelemetrySample> {
        self.last_flush = now;
        std::mem::take(&mut self.buffer)
    }
}

/// Write one line per sample. Each sample is attributed to the peer whose
/// `last_update` equals its timestamp; samples with no such peer are skipped.
/// Returns the number of lines written to the primary log.
pub fn write_batch(writer: &dyn LogWriter, samples: &[TelemetrySample], peers: &[PeerRecord]) -> usize {
    let mut written = 0;
    for sample in samples {
        let Some(peer) = peers.iter().find(|p| p.last_update == sample.timestamp) else {
            debug!("no peer for sample at {}, skipped", sample.timestamp);
            continue;
        };
        let path = log_path(&peer.mac, sample.timestamp);
        let line = format_line(&peer.name, sample);
        match writer.append_line(&path, &line) {
            Ok(()) => written += 1,
            Err(e) => {
                warn!("failed to write {}: {}", path, e);
                writer.fallback(&line);
            }
        }
    }
    written
}
