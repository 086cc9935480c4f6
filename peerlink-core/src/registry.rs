//! Peer registry: bounded table of confirmed peers plus the blacklist.
//!
//! Both lists live behind one mutex. Every public operation takes it with a bounded
//! wait and holds it for the whole mutation, including the write-through to the
//! blob store, so a successful return means the change was handed to storage.
//! A write that still fails after retries is logged and the in-memory change stands.
//!
//! Lists are small and ordered, so membership is a linear scan.

use std::sync::mpsc::{SyncSender, TrySendError};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{error, info, warn};

use crate::error::{PeerError, PeerResult};
use crate::mac::MacAddr;
use crate::protocol::{truncate_name, PeerKind, SensorSubtype, TelemetrySample};
use crate::store::{write_with_retry, BlobStore, RetryPolicy};

/// Maximum number of confirmed peers.
pub const MAX_PEERS: usize = 10;

/// Maximum number of blacklisted addresses.
pub const MAX_BLACKLIST: usize = 10;

/// Maximum sensor subtypes per peer.
pub const MAX_SENSORS: usize = 3;

/// Reporting interval used when a peer is added with interval 0.
pub const DEFAULT_INTERVAL_SEC: u16 = 60;

/// Bounded wait for the registry lock.
pub const LOCK_TIMEOUT: Duration = Duration::from_secs(1);

pub const STORE_NAMESPACE: &str = "peers";
pub const PEERS_KEY: &str = "peers_data";
pub const BLACKLIST_KEY: &str = "blacklist";

/// One confirmed peer, as persisted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PeerRecord {
    pub mac: MacAddr,
    pub kind: PeerKind,
    pub sensor_types: Vec<SensorSubtype>,
    pub name: String,
    /// Timestamp of the latest telemetry sample; 0 until the first report.
    pub last_update: u32,
    pub active: bool,
    pub latest: TelemetrySample,
    pub interval_sec: u16,
}

/// Receiving end for telemetry samples (the logging queue). Must not block.
pub trait TelemetrySink: Send {
    /// Hand over a sample. Returns it back when the queue is full or closed.
    fn offer(&self, sample: TelemetrySample) -> Result<(), TelemetrySample>;
}

impl TelemetrySink for SyncSender<TelemetrySample> {
    fn offer(&self, sample: TelemetrySample) -> Result<(), TelemetrySample> {
        self.try_send(sample).map_err(|e| match e {
            TrySendError::Full(s) | TrySendError::Disconnected(s) => s,
        })
    }
}

struct Registry {
    peers: Vec<PeerRecord>,
    blacklist: Vec<MacAddr>,
    store: Box<dyn BlobStore>,
    retry: RetryPolicy,
    telemetry: Option<Box<dyn TelemetrySink>>,
}

impl Registry {
    fn position(&self, mac: &MacAddr) -> Option<usize> {
        self.peers.iter().position(|p| p.mac == *mac)
    }

    fn peer_mut(&mut self, mac: &MacAddr) -> PeerResult<&mut PeerRecord> {
        match self.position(mac) {
            Some(i) => Ok(&mut self.peers[i]),
            None => Err(PeerError::NotFound(*mac)),
        }
    }

    fn save_peers(&self) {
        self.save(PEERS_KEY, bincode::serialize(&self.peers));
    }

    fn save_blacklist(&self) {
        self.save(BLACKLIST_KEY, bincode::serialize(&self.blacklist));
    }

    fn save(&self, key: &str, encoded: bincode::Result<Vec<u8>>) {
        let bytes = match encoded {
            Ok(b) => b,
            Err(e) => {
                error!("failed to encode {}: {}", key, e);
                return;
            }
        };
        // Failure is already logged; the in-memory state is kept either way.
        let _ = write_with_retry(self.store.as_ref(), self.retry, STORE_NAMESPACE, key, &bytes);
    }
}

/// Handle to the process-wide registry. Cheap to clone; all clones share state.
///
/// Starts uninitialized: operations fail with `InvalidState` until [`load`](Self::load).
#[derive(Clone)]
pub struct SharedRegistry {
    inner: Arc<Mutex<Option<Registry>>>,
    lock_timeout: Duration,
}

impl Default for SharedRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl SharedRegistry {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(None)),
            lock_timeout: LOCK_TIMEOUT,
        }
    }

    /// Override the lock wait (tests).
    pub fn with_lock_timeout(mut self, timeout: Duration) -> Self {
        self.lock_timeout = timeout;
        self
    }

    /// Read the peer table and blacklist from `store` and start serving operations.
    ///
    /// Missing blobs start empty. Undecodable blobs are logged and start empty.
    /// Duplicate or over-capacity entries are dropped.
    pub fn load(
        &self,
        store: Box<dyn BlobStore>,
        telemetry: Option<Box<dyn TelemetrySink>>,
        retry: RetryPolicy,
    ) -> PeerResult<()> {
        let mut slot = self
            .inner
            .try_lock_for(self.lock_timeout)
            .ok_or(PeerError::Timeout("registry lock"))?;
        if slot.is_some() {
            warn!("registry already initialized");
            return Ok(());
        }
        let peers = sanitize_peers(load_blob::<Vec<PeerRecord>>(store.as_ref(), PEERS_KEY));
        let blacklist = sanitize_blacklist(load_blob::<Vec<MacAddr>>(store.as_ref(), BLACKLIST_KEY));
        info!(
            "registry loaded: {} peers, {} blacklisted",
            peers.len(),
            blacklist.len()
        );
        *slot = Some(Registry {
            peers,
            blacklist,
            store,
            retry,
            telemetry,
        });
        Ok(())
    }

    /// Drop the registry state. Later operations fail with `InvalidState`.
    pub fn shutdown(&self) {
        if let Some(mut slot) = self.inner.try_lock_for(self.lock_timeout) {
            *slot = None;
        } else {
            warn!("registry lock busy at shutdown");
        }
    }

    pub fn is_initialized(&self) -> bool {
        self.inner
            .try_lock_for(self.lock_timeout)
            .map(|s| s.is_some())
            .unwrap_or(false)
    }

    /// Run `f` on the registry under the lock. The guard is released on every return path.
    fn with<T>(&self, f: impl FnOnce(&mut Registry) -> PeerResult<T>) -> PeerResult<T> {
        let mut slot = self.inner.try_lock_for(self.lock_timeout).ok_or_else(|| {
            error!("failed to take registry lock");
            PeerError::Timeout("registry lock")
        })?;
        let reg = slot
            .as_mut()
            .ok_or(PeerError::InvalidState("registry not initialized"))?;
        f(reg)
    }

    /// Add a confirmed peer and persist the table.
    pub fn add_peer(
        &self,
        mac: MacAddr,
        kind: PeerKind,
        name: &str,
        sensor_types: &[SensorSubtype],
        interval_sec: u16,
    ) -> PeerResult<()> {
        if sensor_types.len() > MAX_SENSORS {
            return Err(PeerError::InvalidArgument(format!(
                "{} sensor subtypes, at most {}",
                sensor_types.len(),
                MAX_SENSORS
            )));
        }
        self.with(|reg| {
            if reg.position(&mac).is_some() {
                warn!("peer {} already exists", mac);
                return Err(PeerError::AlreadyExists(mac));
            }
            if reg.peers.len() >= MAX_PEERS {
                error!("max peer capacity reached");
                return Err(PeerError::CapacityExceeded("peer registry"));
            }
            let name = truncate_name(name);
            info!("added peer {} ({})", mac, name);
            reg.peers.push(PeerRecord {
                mac,
                kind,
                sensor_types: sensor_types.to_vec(),
                name,
                last_update: 0,
                active: true,
                latest: TelemetrySample::default(),
                interval_sec: if interval_sec > 0 {
                    interval_sec
                } else {
                    DEFAULT_INTERVAL_SEC
                },
            });
            reg.save_peers();
            Ok(())
        })
    }

    /// Record the latest telemetry from `mac` and queue it for logging.
    ///
    /// A full logging queue is logged and otherwise ignored.
    pub fn update_telemetry(&self, mac: MacAddr, sample: TelemetrySample) -> PeerResult<()> {
        self.with(|reg| {
            let peer = match reg.peer_mut(&mac) {
                Ok(p) => p,
                Err(e) => {
                    warn!("peer {} not found for telemetry update", mac);
                    return Err(e);
                }
            };
            peer.latest = sample;
            peer.last_update = sample.timestamp;
            peer.active = true;
            if let Some(sink) = &reg.telemetry {
                if sink.offer(sample).is_err() {
                    warn!("telemetry queue full, dropping sample from {}", mac);
                }
            }
            Ok(())
        })
    }

    pub fn edit_name(&self, mac: MacAddr, new_name: &str) -> PeerResult<()> {
        if new_name.trim().is_empty() {
            return Err(PeerError::InvalidArgument("name must not be empty".into()));
        }
        self.with(|reg| {
            let peer = reg.peer_mut(&mac)?;
            peer.name = truncate_name(new_name);
            info!("renamed {} to {}", mac, peer.name);
            reg.save_peers();
            Ok(())
        })
    }

    pub fn edit_interval(&self, mac: MacAddr, interval_sec: u16) -> PeerResult<()> {
        if interval_sec == 0 {
            return Err(PeerError::InvalidArgument(
                "interval must be at least 1 second".into(),
            ));
        }
        self.with(|reg| {
            reg.peer_mut(&mac)?.interval_sec = interval_sec;
            info!("interval for {} set to {} sec", mac, interval_sec);
            reg.save_peers();
            Ok(())
        })
    }

    pub fn add_to_blacklist(&self, mac: MacAddr) -> PeerResult<()> {
        self.with(|reg| {
            if reg.blacklist.contains(&mac) {
                warn!("{} already blacklisted", mac);
                return Err(PeerError::AlreadyExists(mac));
            }
            if reg.blacklist.len() >= MAX_BLACKLIST {
                error!("blacklist capacity reached");
                return Err(PeerError::CapacityExceeded("blacklist"));
            }
            reg.blacklist.push(mac);
            info!("added {} to blacklist", mac);
            reg.save_blacklist();
            Ok(())
        })
    }

    pub fn remove_from_blacklist(&self, mac: MacAddr) -> PeerResult<()> {
        self.with(|reg| {
            let Some(i) = reg.blacklist.iter().position(|m| *m == mac) else {
                warn!("{} not in blacklist", mac);
                return Err(PeerError::NotFound(mac));
            };
            reg.blacklist.remove(i);
            info!("removed {} from blacklist", mac);
            reg.save_blacklist();
            Ok(())
        })
    }

    /// False when the registry is uninitialized or the lock is not available in time.
    pub fn is_blacklisted(&self, mac: &MacAddr) -> bool {
        self.with(|reg| Ok(reg.blacklist.contains(mac)))
            .unwrap_or(false)
    }

    /// Snapshot of the peer table, in insertion order.
    pub fn peers(&self) -> PeerResult<Vec<PeerRecord>> {
        self.with(|reg| Ok(reg.peers.clone()))
    }

    pub fn peer(&self, mac: &MacAddr) -> PeerResult<PeerRecord> {
        self.with(|reg| {
            reg.position(mac)
                .map(|i| reg.peers[i].clone())
                .ok_or(PeerError::NotFound(*mac))
        })
    }

    /// Addresses of all confirmed peers.
    pub fn confirmed_macs(&self) -> PeerResult<Vec<MacAddr>> {
        self.with(|reg| Ok(reg.peers.iter().map(|p| p.mac).collect()))
    }

    pub fn blacklist(&self) -> PeerResult<Vec<MacAddr>> {
        self.with(|reg| Ok(reg.blacklist.clone()))
    }
}

fn load_blob<T: serde::de::DeserializeOwned + Default>(store: &dyn BlobStore, key: &str) -> T {
    match store.read_blob(STORE_NAMESPACE, key) {
        Ok(Some(bytes)) => match bincode::deserialize(&bytes) {
            Ok(v) => v,
            Err(e) => {
                error!("stored {} is corrupt, starting fresh: {}", key, e);
                T::default()
            }
        },
        Ok(None) => {
            info!("no {} in store, starting fresh", key);
            T::default()
        }
        Err(e) => {
            error!("failed to read {}: {}", key, e);
            T::default()
        }
    }
}

fn sanitize_peers(loaded: Vec<PeerRecord>) -> Vec<PeerRecord> {
    let mut out: Vec<PeerRecord> = Vec::with_capacity(MAX_PEERS);
    for mut p in loaded {
        if out.len() >= MAX_PEERS {
            warn!("stored peer table over capacity, dropping {}", p.mac);
            continue;
        }
        if out.iter().any(|q| q.mac == p.mac) {
            warn!("duplicate stored peer {}, dropping", p.mac);
            continue;
        }
        p.sensor_types.truncate(MAX_SENSORS);
        p.name = truncate_name(&p.name);
        out.push(p);
    }
    out
}

fn sanitize_blacklist(loaded: Vec<MacAddr>) -> Vec<MacAddr> {
    let mut out: Vec<MacAddr> = Vec::with_capacity(MAX_BLACKLIST);
    for mac in loaded {
        if out.len() < MAX_BLACKLIST && !out.contains(&mac) {
            out.push(mac);
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::testing::FlakyStore;
    use crate::store::MemoryStore;
    use std::sync::mpsc::{sync_channel, Receiver};

    fn mac(n: u8) -> MacAddr {
        MacAddr::new([0x24, 0x6f, 0x28, 0, 0, n])
    }

    fn loaded(store: Arc<MemoryStore>) -> (SharedRegistry, Receiver<TelemetrySample>) {
        let (tx, rx) = sync_channel(4);
        let reg = SharedRegistry::new();
        reg.load(Box::new(store), Some(Box::new(tx)), RetryPolicy::immediate())
            .unwrap();
        (reg, rx)
    }

    fn add_relay(reg: &SharedRegistry, n: u8) -> PeerResult<()> {
        reg.add_peer(mac(n), PeerKind::Relay, "Relay", &[], 60)
    }

    fn sample(ts: u32) -> TelemetrySample {
        TelemetrySample {
            timestamp: ts,
            sensor_values: [20.0, 45.0, 0.0],
            relay_state: true,
            switch_state: false,
        }
    }

    #[test]
    fn duplicate_add_rejected_and_size_unchanged() {
        let (reg, _rx) = loaded(Arc::new(MemoryStore::new()));
        add_relay(&reg, 1).unwrap();
        assert_eq!(add_relay(&reg, 1), Err(PeerError::AlreadyExists(mac(1))));
        assert_eq!(reg.peers().unwrap().len(), 1);
    }

    #[test]
    fn eleventh_peer_exceeds_capacity() {
        let (reg, _rx) = loaded(Arc::new(MemoryStore::new()));
        for n in 0..MAX_PEERS as u8 {
            add_relay(&reg, n).unwrap();
        }
        assert_eq!(
            add_relay(&reg, 99),
            Err(PeerError::CapacityExceeded("peer registry"))
        );
        assert_eq!(reg.peers().unwrap().len(), MAX_PEERS);
    }

    #[test]
    fn new_peer_defaults() {
        let (reg, _rx) = loaded(Arc::new(MemoryStore::new()));
        reg.add_peer(
            mac(7),
            PeerKind::Sensor,
            "Attic thermometer",
            &[SensorSubtype::Temperature],
            0,
        )
        .unwrap();
        let p = reg.peer(&mac(7)).unwrap();
        assert!(p.active);
        assert_eq!(p.last_update, 0);
        assert_eq!(p.latest, TelemetrySample::default());
        assert_eq!(p.interval_sec, DEFAULT_INTERVAL_SEC);
        assert_eq!(p.name, "Attic thermomet");
        assert_eq!(p.sensor_types, [SensorSubtype::Temperature]);
    }

    #[test]
    fn too_many_sensor_types_rejected() {
        let (reg, _rx) = loaded(Arc::new(MemoryStore::new()));
        let four = [SensorSubtype::Light; 4];
        assert!(matches!(
            reg.add_peer(mac(1), PeerKind::Sensor, "s", &four, 60),
            Err(PeerError::InvalidArgument(_))
        ));
        assert!(reg.peers().unwrap().is_empty());
    }

    #[test]
    fn blacklist_add_then_remove() {
        let (reg, _rx) = loaded(Arc::new(MemoryStore::new()));
        assert!(!reg.is_blacklisted(&mac(3)));
        reg.add_to_blacklist(mac(3)).unwrap();
        assert!(reg.is_blacklisted(&mac(3)));
        assert_eq!(
            reg.add_to_blacklist(mac(3)),
            Err(PeerError::AlreadyExists(mac(3)))
        );
        reg.remove_from_blacklist(mac(3)).unwrap();
        assert!(!reg.is_blacklisted(&mac(3)));
        assert_eq!(
            reg.remove_from_blacklist(mac(3)),
            Err(PeerError::NotFound(mac(3)))
        );
    }

    #[test]
    fn blacklist_capacity() {
        let (reg, _rx) = loaded(Arc::new(MemoryStore::new()));
        for n in 0..MAX_BLACKLIST as u8 {
            reg.add_to_blacklist(mac(n)).unwrap();
        }
        assert_eq!(
            reg.add_to_blacklist(mac(200)),
            Err(PeerError::CapacityExceeded("blacklist"))
        );
    }

    #[test]
    fn telemetry_for_unknown_peer_enqueues_nothing() {
        let (reg, rx) = loaded(Arc::new(MemoryStore::new()));
        assert_eq!(
            reg.update_telemetry(mac(9), sample(100)),
            Err(PeerError::NotFound(mac(9)))
        );
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn telemetry_updates_record_and_enqueues() {
        let (reg, rx) = loaded(Arc::new(MemoryStore::new()));
        add_relay(&reg, 1).unwrap();
        reg.update_telemetry(mac(1), sample(1_700_000_000)).unwrap();
        let p = reg.peer(&mac(1)).unwrap();
        assert_eq!(p.last_update, 1_700_000_000);
        assert_eq!(p.latest, sample(1_700_000_000));
        assert_eq!(rx.try_recv().unwrap(), sample(1_700_000_000));
    }

    #[test]
    fn full_telemetry_queue_does_not_fail_update() {
        let (tx, _rx) = sync_channel(1);
        let reg = SharedRegistry::new();
        reg.load(
            Box::new(MemoryStore::new()),
            Some(Box::new(tx)),
            RetryPolicy::immediate(),
        )
        .unwrap();
        add_relay(&reg, 1).unwrap();
        reg.update_telemetry(mac(1), sample(1)).unwrap();
        reg.update_telemetry(mac(1), sample(2)).unwrap();
        assert_eq!(reg.peer(&mac(1)).unwrap().last_update, 2);
    }

    #[test]
    fn edits_require_known_peer() {
        let (reg, _rx) = loaded(Arc::new(MemoryStore::new()));
        assert_eq!(reg.edit_name(mac(1), "Porch"), Err(PeerError::NotFound(mac(1))));
        assert_eq!(reg.edit_interval(mac(1), 30), Err(PeerError::NotFound(mac(1))));
        add_relay(&reg, 1).unwrap();
        reg.edit_name(mac(1), "Porch").unwrap();
        reg.edit_interval(mac(1), 30).unwrap();
        let p = reg.peer(&mac(1)).unwrap();
        assert_eq!(p.name, "Porch");
        assert_eq!(p.interval_sec, 30);
        assert!(matches!(
            reg.edit_name(mac(1), "  "),
            Err(PeerError::InvalidArgument(_))
        ));
        assert!(matches!(
            reg.edit_interval(mac(1), 0),
            Err(PeerError::InvalidArgument(_))
        ));
    }

    #[test]
    fn state_survives_reload() {
        let store = Arc::new(MemoryStore::new());
        {
            let (reg, _rx) = loaded(store.clone());
            add_relay(&reg, 1).unwrap();
            reg.add_peer(mac(2), PeerKind::Switch, "Hall", &[], 15).unwrap();
            reg.edit_name(mac(1), "Pump").unwrap();
            reg.add_to_blacklist(mac(5)).unwrap();
            reg.shutdown();
            assert!(!reg.is_initialized());
        }
        let (reg, _rx) = loaded(store);
        let peers = reg.peers().unwrap();
        assert_eq!(peers.len(), 2);
        assert_eq!(peers[0].name, "Pump");
        assert_eq!(peers[1].interval_sec, 15);
        assert!(reg.is_blacklisted(&mac(5)));
    }

    #[test]
    fn storage_failure_keeps_mutation() {
        let store = Arc::new(FlakyStore::new(usize::MAX));
        let reg = SharedRegistry::new();
        reg.load(Box::new(store.clone()), None, RetryPolicy::immediate())
            .unwrap();
        add_relay(&reg, 1).unwrap();
        assert_eq!(store.write_count(), 3);
        assert_eq!(reg.peers().unwrap().len(), 1);
    }

    #[test]
    fn corrupt_blob_starts_fresh() {
        let store = Arc::new(MemoryStore::new());
        store
            .write_blob(STORE_NAMESPACE, PEERS_KEY, &[0xff, 0xff, 0xff])
            .unwrap();
        let (reg, _rx) = loaded(store);
        assert!(reg.peers().unwrap().is_empty());
    }

    #[test]
    fn uninitialized_registry() {
        let reg = SharedRegistry::new();
        assert!(!reg.is_blacklisted(&mac(1)));
        assert!(matches!(add_relay(&reg, 1), Err(PeerError::InvalidState(_))));
        assert!(matches!(reg.peers(), Err(PeerError::InvalidState(_))));
    }

    #[test]
    fn contended_lock_times_out() {
        let (reg, _rx) = loaded(Arc::new(MemoryStore::new()));
        let reg = reg.with_lock_timeout(Duration::from_millis(10));
        let _held = reg.inner.lock();
        assert_eq!(add_relay(&reg, 1), Err(PeerError::Timeout("registry lock")));
        assert!(!reg.is_blacklisted(&mac(1)));
    }
}
