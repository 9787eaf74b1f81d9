//! ---
//! helio_section: "02-data-model"
//! helio_subsection: "module"
//! helio_type: "source"
//! helio_scope: "code"
//! helio_description: "Canonical keys, value variants and message types."
//! helio_version: "v0.4.2"
//! helio_owner: "tbd"
//! ---
use std::time::Instant;

use chrono::{DateTime, Utc};
use indexmap::IndexMap;

use crate::{StandardKey, Value};

/// Values carried by a reading, in plugin emission order.
pub type ReadingValues = IndexMap<StandardKey, Value>;

/// One atomic output of a plugin poll cycle.
#[derive(Debug, Clone)]
pub struct Reading {
    /// Configured instance name of the emitting plugin.
    pub instance_id: String,
    /// Monotonic stamp taken when the poll completed; the only clock used
    /// for elapsed-time decisions downstream.
    pub monotonic_ts: Instant,
    /// Wall-clock stamp for human-visible timestamps and persistence.
    pub wall_ts_utc: DateTime<Utc>,
    pub values: ReadingValues,
}

impl Reading {
    pub fn new(instance_id: impl Into<String>, values: ReadingValues) -> Self {
        Self {
            instance_id: instance_id.into(),
            monotonic_ts: Instant::now(),
            wall_ts_utc: Utc::now(),
            values,
        }
    }

    /// Whether the reading carries any non-static payload.
    pub fn has_dynamic_values(&self) -> bool {
        self.values.keys().any(|k| !k.is_static())
    }
}
