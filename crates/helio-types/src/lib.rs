//! ---
//! helio_section: "02-data-model"
//! helio_subsection: "module"
//! helio_type: "source"
//! helio_scope: "code"
//! helio_description: "Canonical keys, value variants and message types."
//! helio_version: "v0.4.2"
//! helio_owner: "tbd"
//! ---
//! Canonical data model for the Helio runtime.
//!
//! Everything a plugin publishes and everything a subscriber receives is
//! expressed with [`StandardKey`] and [`Value`]. Keys form a closed
//! vocabulary; anything outside it is dropped by the aggregator with a
//! warning rather than silently merged.

pub mod keys;
pub mod reading;
pub mod snapshot;
pub mod value;

pub use keys::StandardKey;
pub use reading::{Reading, ReadingValues};
pub use snapshot::{ConnectionStatus, PluginStatusDetail, Snapshot};
pub use value::Value;
