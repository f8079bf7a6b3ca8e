//! Constraint monitor - device-state prerequisites for downloads
//!
//! Observes network connectivity/meteredness, charging state, and storage
//! availability, and publishes a [`ConstraintSnapshot`] whenever any field
//! changes. Hosts with native constraint trackers plug in through the probe
//! traits; the polling monitor is the portable fallback.

use castload_types::ConstraintSnapshot;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// How often the polling fallback re-reads the probes.
pub const POLL_INTERVAL: Duration = Duration::from_secs(10);

/// Network connectivity and meteredness.
pub trait NetworkProbe: Send + Sync {
    fn is_connected(&self) -> bool;
    fn is_unmetered(&self) -> bool;
}

/// Charging state.
pub trait PowerProbe: Send + Sync {
    fn is_power_connected(&self) -> bool;
}

/// Storage-not-low state.
pub trait StorageProbe: Send + Sync {
    fn is_storage_available(&self) -> bool;
}

/// Probe for hosts that are always online and unmetered (desktops, tests).
pub struct AlwaysOnline;

impl NetworkProbe for AlwaysOnline {
    fn is_connected(&self) -> bool {
        true
    }

    fn is_unmetered(&self) -> bool {
        true
    }
}

/// Probe for hosts that are always on external power.
pub struct AlwaysPowered;

impl PowerProbe for AlwaysPowered {
    fn is_power_connected(&self) -> bool {
        true
    }
}

/// Fallback storage probe. There is no portable low-storage signal, so
/// storage is reported as available; actual exhaustion still surfaces as an
/// out-of-storage failure from the fetcher.
pub struct StorageAssumedAvailable;

impl StorageProbe for StorageAssumedAvailable {
    fn is_storage_available(&self) -> bool {
        true
    }
}

/// Poll-based constraint monitor combining independently-observed network,
/// power, and storage reads into one snapshot.
///
/// Emits only on change; identical consecutive snapshots are deduplicated
/// so downstream reconciliation is not churned needlessly.
pub struct PollingConstraintMonitor {
    network: Arc<dyn NetworkProbe>,
    power: Arc<dyn PowerProbe>,
    storage: Arc<dyn StorageProbe>,
    interval: Duration,
    snapshot_tx: watch::Sender<ConstraintSnapshot>,
    shutdown: CancellationToken,
}

impl PollingConstraintMonitor {
    pub fn new(
        network: Arc<dyn NetworkProbe>,
        power: Arc<dyn PowerProbe>,
        storage: Arc<dyn StorageProbe>,
    ) -> Self {
        Self::with_interval(network, power, storage, POLL_INTERVAL)
    }

    pub fn with_interval(
        network: Arc<dyn NetworkProbe>,
        power: Arc<dyn PowerProbe>,
        storage: Arc<dyn StorageProbe>,
        interval: Duration,
    ) -> Self {
        let initial = read_snapshot(&*network, &*power, &*storage);
        let (snapshot_tx, _) = watch::channel(initial);
        Self {
            network,
            power,
            storage,
            interval,
            snapshot_tx,
            shutdown: CancellationToken::new(),
        }
    }

    /// Monitor for hosts with no constraint sources: everything available,
    /// nothing ever changes.
    pub fn unconstrained() -> Self {
        Self::new(
            Arc::new(AlwaysOnline),
            Arc::new(AlwaysPowered),
            Arc::new(StorageAssumedAvailable),
        )
    }

    /// Subscribe to the live snapshot. The receiver holds the current value
    /// immediately.
    pub fn subscribe(&self) -> watch::Receiver<ConstraintSnapshot> {
        self.snapshot_tx.subscribe()
    }

    /// Start the polling loop. The loop stops when the monitor is dropped.
    pub fn start(&self) {
        let network = self.network.clone();
        let power = self.power.clone();
        let storage = self.storage.clone();
        let snapshot_tx = self.snapshot_tx.clone();
        let shutdown = self.shutdown.clone();
        let poll_interval = self.interval;

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(poll_interval);
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = ticker.tick() => {}
                }
                let snapshot = read_snapshot(&*network, &*power, &*storage);
                // send_if_modified gives us the dedup: watch notifies
                // receivers only when we report a modification.
                snapshot_tx.send_if_modified(|current| {
                    if *current == snapshot {
                        false
                    } else {
                        debug!(?snapshot, "device constraints changed");
                        *current = snapshot;
                        true
                    }
                });
            }
        });
    }
}

impl Drop for PollingConstraintMonitor {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

fn read_snapshot(
    network: &dyn NetworkProbe,
    power: &dyn PowerProbe,
    storage: &dyn StorageProbe,
) -> ConstraintSnapshot {
    let is_connected = network.is_connected();
    ConstraintSnapshot {
        is_network_available: is_connected,
        is_unmetered_available: is_connected && network.is_unmetered(),
        is_power_available: power.is_power_connected(),
        is_storage_available: storage.is_storage_available(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};

    struct FlakyNetwork {
        connected: AtomicBool,
    }

    impl NetworkProbe for FlakyNetwork {
        fn is_connected(&self) -> bool {
            self.connected.load(Ordering::Acquire)
        }

        fn is_unmetered(&self) -> bool {
            self.connected.load(Ordering::Acquire)
        }
    }

    #[tokio::test(start_paused = true)]
    async fn emits_only_on_change() {
        let network = Arc::new(FlakyNetwork {
            connected: AtomicBool::new(true),
        });
        let monitor = PollingConstraintMonitor::with_interval(
            network.clone(),
            Arc::new(AlwaysPowered),
            Arc::new(StorageAssumedAvailable),
            Duration::from_millis(10),
        );
        let mut rx = monitor.subscribe();
        monitor.start();

        assert!(rx.borrow_and_update().is_network_available);

        // Several polls with no change: the receiver must not be notified.
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!rx.has_changed().unwrap());

        network.connected.store(false, Ordering::Release);
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(rx.has_changed().unwrap());
        let snapshot = *rx.borrow_and_update();
        assert!(!snapshot.is_network_available);
        assert!(!snapshot.is_unmetered_available);
    }

    #[test]
    fn disconnected_network_is_never_unmetered() {
        struct MeteredButDown;
        impl NetworkProbe for MeteredButDown {
            fn is_connected(&self) -> bool {
                false
            }
            fn is_unmetered(&self) -> bool {
                true
            }
        }
        let snapshot = read_snapshot(&MeteredButDown, &AlwaysPowered, &StorageAssumedAvailable);
        assert!(!snapshot.is_network_available);
        assert!(!snapshot.is_unmetered_available);
    }
}
