//! Durable blob storage interface and write-through retry.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tracing::{error, warn};

/// Key-value store holding opaque blobs under `(namespace, key)`.
pub trait BlobStore: Send + Sync {
    fn write_blob(&self, namespace: &str, key: &str, bytes: &[u8]) -> Result<(), StoreError>;

    /// Returns `Ok(None)` when nothing is stored under the key.
    fn read_blob(&self, namespace: &str, key: &str) -> Result<Option<Vec<u8>>, StoreError>;
}

impl<T: BlobStore + ?Sized> BlobStore for Arc<T> {
    fn write_blob(&self, namespace: &str, key: &str, bytes: &[u8]) -> Result<(), StoreError> {
        (**self).write_blob(namespace, key, bytes)
    }

    fn read_blob(&self, namespace: &str, key: &str) -> Result<Option<Vec<u8>>, StoreError> {
        (**self).read_blob(namespace, key)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("store unavailable: {0}")]
    Unavailable(String),
}

/// Volatile store. Used in tests and when no data directory is usable.
#[derive(Default)]
pub struct MemoryStore {
    blobs: Mutex<HashMap<(String, String), Vec<u8>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored blobs.
    pub fn len(&self) -> usize {
        self.blobs.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl BlobStore for MemoryStore {
    fn write_blob(&self, namespace: &str, key: &str, bytes: &[u8]) -> Result<(), StoreError> {
        self.blobs
            .lock()
            .insert((namespace.to_string(), key.to_string()), bytes.to_vec());
        Ok(())
    }

    fn read_blob(&self, namespace: &str, key: &str) -> Result<Option<Vec<u8>>, StoreError> {
        Ok(self
            .blobs
            .lock()
            .get(&(namespace.to_string(), key.to_string()))
            .cloned())
    }
}

/// Bounded retry with exponential backoff for write-through persistence.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub attempts: u32,
    pub initial_backoff: Duration,
}

impl Default for RetryPolicy {
    /// 3 attempts, backing off 100 ms then 200 ms.
    fn default() -> Self {
        Self {
            attempts: 3,
            initial_backoff: Duration::from_millis(100),
        }
    }
}

impl RetryPolicy {
    /// Same attempt count, no sleeping between attempts.
    pub fn immediate() -> Self {
        Self {
            initial_backoff: Duration::ZERO,
            ..Self::default()
        }
    }

    /// Pause before retry number `retry` (1-based); doubles each time.
    pub fn backoff(&self, retry: u32) -> Duration {
        self.initial_backoff
            .saturating_mul(1u32 << retry.saturating_sub(1).min(16))
    }
}

/// Write a blob, retrying per `policy`. Blocks the calling thread while backing off.
pub fn write_with_retry(
    store: &dyn BlobStore,
    policy: RetryPolicy,
    namespace: &str,
    key: &str,
    bytes: &[u8],
) -> Result<(), StoreError> {
    let attempts = policy.attempts.max(1);
    let mut last = None;
    for attempt in 0..attempts {
        if attempt > 0 {
            let backoff = policy.backoff(attempt);
            if !backoff.is_zero() {
                std::thread::sleep(backoff);
            }
        }
        match store.write_blob(namespace, key, bytes) {
            Ok(()) => return Ok(()),
            Err(e) => {
                warn!(
                    "write {}/{} attempt {} failed: {}",
                    namespace,
                    key,
                    attempt + 1,
                    e
                );
                last = Some(e);
            }
        }
    }
    let err = last.unwrap_or_else(|| StoreError::Unavailable("no attempts made".into()));
    error!("failed to write {}/{} after retries: {}", namespace, key, err);
    Err(err)
}


#[cfg(test)]
mod tests {
    use super::testing::FlakyStore;
    use super::*;
    use std::time::Instant;

    /// Always fails, remembering when each write was attempted.
    #[derive(Default)]
    struct ClockedStore {
        at: Mutex<Vec<Instant>>,
    }

    impl BlobStore for ClockedStore {
        fn write_blob(&self, _: &str, _: &str, _: &[u8]) -> Result<(), StoreError> {
            self.at.lock().push(Instant::now());
            Err(StoreError::Unavailable("flash busy".into()))
        }

        fn read_blob(&self, _: &str, _: &str) -> Result<Option<Vec<u8>>, StoreError> {
            Ok(None)
        }
    }

    #[test]
    fn memory_store_read_missing_is_none() {
        let store = MemoryStore::new();
        assert!(store.read_blob("peers", "peers_data").unwrap().is_none());
        store.write_blob("peers", "peers_data", b"abc").unwrap();
        assert_eq!(
            store.read_blob("peers", "peers_data").unwrap().as_deref(),
            Some(&b"abc"[..])
        );
    }

    #[test]
    fn retry_recovers_from_transient_failure() {
        let store = FlakyStore::new(2);
        write_with_retry(&store, RetryPolicy::immediate(), "ns", "k", b"v").unwrap();
        assert_eq!(store.write_count(), 3);
        assert!(store.inner.read_blob("ns", "k").unwrap().is_some());
    }

    #[test]
    fn retry_gives_up_after_attempts() {
        let store = FlakyStore::new(10);
        let r = write_with_retry(&store, RetryPolicy::immediate(), "ns", "k", b"v");
        assert!(r.is_err());
        assert_eq!(store.write_count(), 3);
    }

    #[test]
    fn default_backoff_doubles() {
        let p = RetryPolicy::default();
        assert_eq!(p.backoff(1), Duration::from_millis(100));
        assert_eq!(p.backoff(2), Duration::from_millis(200));
        assert_eq!(RetryPolicy::immediate().backoff(2), Duration::ZERO);
    }

    #[test]
    fn retries_wait_between_attempts() {
        let store = ClockedStore::default();
        let policy = RetryPolicy {
            attempts: 3,
            initial_backoff: Duration::from_millis(20),
        };
        assert!(write_with_retry(&store, policy, "ns", "k", b"v").is_err());
        let at = store.at.lock();
        assert_eq!(at.len(), 3);
        assert!(at[1] - at[0] >= Duration::from_millis(20));
        assert!(at[2] - at[1] >= Duration::from_millis(40));
    }
}
