//! ---
//! helio_section: "01-core-functionality"
//! helio_subsection: "module"
//! helio_type: "source"
//! helio_scope: "code"
//! helio_description: "Aggregation, filtering, supervision and fan-out."
//! helio_version: "v0.4.2"
//! helio_owner: "tbd"
//! ---
//! Snapshot fan-out to subscribers.
//!
//! Pull-on-demand: each subscriber consumes at its own pace and always
//! receives the latest snapshot, with intermediate updates coalesced
//! away. Concrete sinks (dashboard socket, MQTT bridge, history writer)
//! are subscribers of this interface and live outside the core.

use std::sync::Arc;

use helio_types::{Snapshot, StandardKey};
use tokio::sync::watch;

/// Key predicate applied to the snapshots a subscription yields.
pub type KeyFilter = Arc<dyn Fn(&StandardKey) -> bool + Send + Sync>;

/// Hands out subscriptions over the aggregator's snapshot stream.
#[derive(Clone)]
pub struct Publisher {
    snapshots: watch::Receiver<Arc<Snapshot>>,
}

impl Publisher {
    pub fn new(snapshots: watch::Receiver<Arc<Snapshot>>) -> Self {
        Self { snapshots }
    }

    /// Subscribe with an optional key predicate. `None` passes the full
    /// snapshot through.
    pub fn subscribe(&self, filter: Option<KeyFilter>) -> Subscription {
        Subscription {
            snapshots: self.snapshots.clone(),
            filter,
        }
    }

    /// The most recent snapshot without waiting.
    pub fn latest(&self) -> Arc<Snapshot> {
        self.snapshots.borrow().clone()
    }
}

/// One subscriber's handle on the snapshot stream.
pub struct Subscription {
    snapshots: watch::Receiver<Arc<Snapshot>>,
    filter: Option<KeyFilter>,
}

impl Subscription {
    /// Wait for the next unseen snapshot. Returns `None` once the
    /// aggregator is gone.
    pub async fn next(&mut self) -> Option<Arc<Snapshot>> {
        self.snapshots.changed().await.ok()?;
        let snapshot = self.snapshots.borrow_and_update().clone();
        Some(self.project(snapshot))
    }

    /// The latest snapshot immediately, marking it seen.
    pub fn latest(&mut self) -> Arc<Snapshot> {
        let snapshot = self.snapshots.borrow_and_update().clone();
        self.project(snapshot)
    }

    fn project(&self, snapshot: Arc<Snapshot>) -> Arc<Snapshot> {
        let Some(filter) = &self.filter else {
            return snapshot;
        };
        let filtered = Snapshot {
            values: snapshot
                .values
                .iter()
                .filter(|(key, _)| filter(key))
                .map(|(key, value)| (*key, value.clone()))
                .collect(),
            server_timestamp_ms_utc: snapshot.server_timestamp_ms_utc,
            snapshot_version: snapshot.snapshot_version,
            plugin_connection_status: snapshot.plugin_connection_status.clone(),
        };
        Arc::new(filtered)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use helio_types::Value;

    fn snapshot(version: u64, soc: f64) -> Arc<Snapshot> {
        let mut snapshot = Snapshot::empty();
        snapshot.snapshot_version = version;
        snapshot
            .values
            .insert(StandardKey::BatteryStateOfChargePercent, Value::Number(soc));
        snapshot
            .values
            .insert(StandardKey::AcPowerWatts, Value::Number(1000.0));
        snapshot.into_shared()
    }

    #[tokio::test]
    async fn slow_subscribers_see_only_the_latest() {
        let (tx, rx) = watch::channel(snapshot(1, 10.0));
        let publisher = Publisher::new(rx);
        let mut subscription = publisher.subscribe(None);

        tx.send(snapshot(2, 20.0)).unwrap();
        tx.send(snapshot(3, 30.0)).unwrap();
        tx.send(snapshot(4, 40.0)).unwrap();

        let seen = subscription.next().await.unwrap();
        assert_eq!(seen.snapshot_version, 4);
        assert_eq!(seen.get_f64(StandardKey::BatteryStateOfChargePercent), Some(40.0));
    }

    #[tokio::test]
    async fn key_filters_project_the_snapshot() {
        let (tx, rx) = watch::channel(snapshot(1, 10.0));
        let publisher = Publisher::new(rx);
        let mut subscription = publisher.subscribe(Some(Arc::new(|key: &StandardKey| {
            *key == StandardKey::BatteryStateOfChargePercent
        })));

        tx.send(snapshot(2, 55.0)).unwrap();
        let seen = subscription.next().await.unwrap();
        assert_eq!(seen.get_f64(StandardKey::BatteryStateOfChargePercent), Some(55.0));
        assert_eq!(seen.get(StandardKey::AcPowerWatts), None);
        // Version and status bookkeeping survive the projection.
        assert_eq!(seen.snapshot_version, 2);
    }

    #[tokio::test]
    async fn subscription_ends_when_publisher_drops() {
        let (tx, rx) = watch::channel(snapshot(1, 10.0));
        let publisher = Publisher::new(rx);
        let mut subscription = publisher.subscribe(None);
        drop(tx);
        assert!(subscription.next().await.is_none());
    }
}
