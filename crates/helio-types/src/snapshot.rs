//! ---
//! helio_section: "02-data-model"
//! helio_subsection: "module"
//! helio_type: "source"
//! helio_scope: "code"
//! helio_description: "Canonical keys, value variants and message types."
//! helio_version: "v0.4.2"
//! helio_owner: "tbd"
//! ---
use std::fmt;
use std::sync::Arc;

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

use crate::{StandardKey, Value};

/// Connection state of one plugin instance as seen by subscribers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionStatus {
    Connected,
    Disconnected,
    Error,
    Initializing,
}

impl ConnectionStatus {
    pub const fn as_str(&self) -> &'static str {
        match self {
            ConnectionStatus::Connected => "connected",
            ConnectionStatus::Disconnected => "disconnected",
            ConnectionStatus::Error => "error",
            ConnectionStatus::Initializing => "initializing",
        }
    }
}

impl fmt::Display for ConnectionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Per-instance health bookkeeping inside the system state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PluginStatusDetail {
    pub connected: bool,
    pub last_error: Option<String>,
    pub consecutive_failures: u32,
}

impl Default for PluginStatusDetail {
    fn default() -> Self {
        Self {
            connected: false,
            last_error: None,
            consecutive_failures: 0,
        }
    }
}

/// Immutable view of the merged system state handed to subscribers.
///
/// Serializes to the flat JSON object of the subscriber contract: one
/// property per standard key plus the bookkeeping fields.
#[derive(Debug, Clone, Serialize)]
pub struct Snapshot {
    #[serde(flatten)]
    pub values: IndexMap<StandardKey, Value>,
    pub server_timestamp_ms_utc: i64,
    pub snapshot_version: u64,
    pub plugin_connection_status: IndexMap<String, ConnectionStatus>,
}

impl Snapshot {
    /// Empty snapshot at version zero, published before the first reading.
    pub fn empty() -> Self {
        Self {
            values: IndexMap::new(),
            server_timestamp_ms_utc: 0,
            snapshot_version: 0,
            plugin_connection_status: IndexMap::new(),
        }
    }

    pub fn get(&self, key: StandardKey) -> Option<&Value> {
        self.values.get(&key)
    }

    pub fn get_f64(&self, key: StandardKey) -> Option<f64> {
        self.values.get(&key).and_then(Value::as_f64)
    }

    /// Cheap-to-clone shared handle used by the publisher fan-out.
    pub fn into_shared(self) -> Arc<Snapshot> {
        Arc::new(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn snapshot_serializes_flat() {
        let mut snapshot = Snapshot::empty();
        snapshot
            .values
            .insert(StandardKey::BatteryStateOfChargePercent, Value::Number(88.5));
        snapshot.snapshot_version = 3;
        snapshot
            .plugin_connection_status
            .insert("main_inverter".into(), ConnectionStatus::Connected);

        let json = serde_json::to_value(&snapshot).unwrap();
        assert_eq!(json["battery_state_of_charge_percent"], 88.5);
        assert_eq!(json["snapshot_version"], 3);
        assert_eq!(
            json["plugin_connection_status"]["main_inverter"],
            "connected"
        );
    }
}
