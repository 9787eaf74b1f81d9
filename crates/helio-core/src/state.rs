//! ---
//! helio_section: "01-core-functionality"
//! helio_subsection: "module"
//! helio_type: "source"
//! helio_scope: "code"
//! helio_description: "Aggregation, filtering, supervision and fan-out."
//! helio_version: "v0.4.2"
//! helio_owner: "tbd"
//! ---
//! The canonical merged view of the whole installation.
//!
//! Only the aggregator writes here; everyone else sees immutable
//! [`Snapshot`]s. Each key remembers which instance wrote it last and
//! when, which is what staleness and ownership decisions key off.

use std::time::Duration;

use chrono::{DateTime, Utc};
use helio_types::{ConnectionStatus, PluginStatusDetail, Snapshot, StandardKey, Value};
use indexmap::IndexMap;

#[derive(Debug, Clone)]
struct ValueEntry {
    value: Value,
    writer: String,
    wall_ts: DateTime<Utc>,
}

/// Process-wide merged state keyed by [`StandardKey`].
#[derive(Debug, Default)]
pub struct SystemState {
    values: IndexMap<StandardKey, ValueEntry>,
    last_seen_by_instance: IndexMap<String, DateTime<Utc>>,
    plugin_status: IndexMap<String, PluginStatusDetail>,
    version: u64,
}

impl SystemState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record one accepted value.
    pub fn write(&mut self, key: StandardKey, value: Value, writer: &str, wall_ts: DateTime<Utc>) {
        self.values.insert(
            key,
            ValueEntry {
                value,
                writer: writer.to_owned(),
                wall_ts,
            },
        );
    }

    /// Stamp an instance as alive at the given wall time.
    pub fn mark_seen(&mut self, instance: &str, wall_ts: DateTime<Utc>) {
        self.last_seen_by_instance.insert(instance.to_owned(), wall_ts);
    }

    pub fn set_plugin_status(&mut self, instance: &str, detail: PluginStatusDetail) {
        self.plugin_status.insert(instance.to_owned(), detail);
    }

    pub fn get(&self, key: StandardKey) -> Option<&Value> {
        self.values.get(&key).map(|entry| &entry.value)
    }

    pub fn get_f64(&self, key: StandardKey) -> Option<f64> {
        self.get(key).and_then(Value::as_f64)
    }

    /// Which instance last wrote the key.
    pub fn writer_of(&self, key: StandardKey) -> Option<&str> {
        self.values.get(&key).map(|entry| entry.writer.as_str())
    }

    pub fn last_seen(&self, instance: &str) -> Option<DateTime<Utc>> {
        self.last_seen_by_instance.get(instance).copied()
    }

    /// Whether a key's value is older than the staleness budget.
    pub fn is_stale(&self, key: StandardKey, now: DateTime<Utc>, timeout: Duration) -> bool {
        match self.values.get(&key) {
            Some(entry) => {
                let age = now.signed_duration_since(entry.wall_ts);
                age.num_milliseconds().max(0) as u128 > timeout.as_millis()
            }
            None => false,
        }
    }

    pub fn version(&self) -> u64 {
        self.version
    }

    /// Build the next snapshot; the version counter increases strictly
    /// monotonically.
    pub fn snapshot(
        &mut self,
        statuses: IndexMap<String, ConnectionStatus>,
        now: DateTime<Utc>,
    ) -> Snapshot {
        self.version += 1;
        Snapshot {
            values: self
                .values
                .iter()
                .map(|(key, entry)| (*key, entry.value.clone()))
                .collect(),
            server_timestamp_ms_utc: now.timestamp_millis(),
            snapshot_version: self.version,
            plugin_connection_status: statuses,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn versions_increase_strictly() {
        let mut state = SystemState::new();
        let now = Utc::now();
        let a = state.snapshot(IndexMap::new(), now);
        let b = state.snapshot(IndexMap::new(), now);
        assert!(b.snapshot_version > a.snapshot_version);
    }

    #[test]
    fn writer_and_staleness_are_tracked() {
        let mut state = SystemState::new();
        let wrote_at = Utc::now() - chrono::Duration::seconds(1000);
        state.write(
            StandardKey::BatteryStateOfChargePercent,
            Value::Number(80.0),
            "bms",
            wrote_at,
        );
        assert_eq!(state.writer_of(StandardKey::BatteryStateOfChargePercent), Some("bms"));
        assert!(state.is_stale(
            StandardKey::BatteryStateOfChargePercent,
            Utc::now(),
            Duration::from_secs(900)
        ));
        assert!(!state.is_stale(
            StandardKey::BatteryStateOfChargePercent,
            Utc::now(),
            Duration::from_secs(2000)
        ));
    }
}
