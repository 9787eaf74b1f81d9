//! ---
//! helio_section: "03-persistence-logging"
//! helio_subsection: "module"
//! helio_type: "source"
//! helio_scope: "code"
//! helio_description: "History persistence over SQLite."
//! helio_version: "v0.4.2"
//! helio_owner: "tbd"
//! ---
//! History persistence.
//!
//! One writer task samples the published snapshots into a local SQLite
//! database: rolling power history, on-demand full state dumps, and a
//! daily energy summary with monthly/yearly views derived in SQL.

pub mod store;
pub mod writer;

/// Result alias used throughout the persistence crate.
pub type Result<T> = std::result::Result<T, StoreError>;

/// Error type for the persistence subsystem.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// Wrapper for SQLite failures.
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    /// The database stayed busy through every retry.
    #[error("database busy after {attempts} attempts")]
    Busy { attempts: u32 },
    /// Wrapper for JSON serialization issues in state dumps.
    #[error("serialization error: {0}")]
    Json(#[from] serde_json::Error),
}

pub use store::{DailySummary, HistoryStore, HourlyBreakdown, PowerSample};
pub use writer::{HistoryWriter, WriterConfig};
