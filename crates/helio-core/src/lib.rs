//! ---
//! helio_section: "01-core-functionality"
//! helio_subsection: "module"
//! helio_type: "source"
//! helio_scope: "code"
//! helio_description: "Aggregation, filtering, supervision and fan-out."
//! helio_version: "v0.4.2"
//! helio_owner: "tbd"
//! ---
//! The core runtime: one aggregator task merges every plugin's readings
//! into the canonical system state behind an adaptive filter, a
//! supervisor keeps the workers honest, and a publisher fans versioned
//! snapshots out to subscribers.

pub mod aggregator;
pub mod filter;
pub mod publisher;
pub mod state;
pub mod supervisor;

pub use aggregator::{Aggregator, AggregatorConfig};
pub use filter::{AdaptiveFilter, FilterVerdict};
pub use publisher::{Publisher, Subscription};
pub use state::SystemState;
pub use supervisor::{
    Availability, Supervisor, SupervisorConfig, SupervisorExit, WatchdogDecision, WatchdogTracker,
};
