//! ---
//! helio_section: "01-core-functionality"
//! helio_subsection: "module"
//! helio_type: "source"
//! helio_scope: "code"
//! helio_description: "Shared primitives and utilities for the monitoring runtime."
//! helio_version: "v0.4.2"
//! helio_owner: "tbd"
//! ---
//! Core shared primitives for the Helio monitoring workspace.
//! This crate exposes configuration loading, logging initialisation and
//! time utilities consumed across the workspace.

pub mod config;
pub mod ini;
pub mod logging;
pub mod time;

pub use config::{
    AppConfig, DatabaseConfig, FilterConfig, GeneralConfig, InstanceConfig, InverterSystemConfig,
    LoadedAppConfig, WatchdogConfig,
};
pub use ini::IniDocument;
pub use logging::{init_tracing, LogFormat};

/// Clean shutdown.
pub const EXIT_OK: i32 = 0;
/// Fatal configuration error at startup.
pub const EXIT_CONFIG_ERROR: i32 = 1;
/// Supervisor escalation after repeated watchdog fires.
pub const EXIT_WATCHDOG_ESCALATION: i32 = 2;
/// Unrecoverable transport or protocol error during startup.
pub const EXIT_STARTUP_FAILURE: i32 = 3;
