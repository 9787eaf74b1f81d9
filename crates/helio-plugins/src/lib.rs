//! ---
//! helio_section: "05-device-plugins"
//! helio_subsection: "module"
//! helio_type: "source"
//! helio_scope: "code"
//! helio_description: "Device plugin contract, poll workers and concrete drivers."
//! helio_version: "v0.4.2"
//! helio_owner: "tbd"
//! ---
//! Device plugins.
//!
//! A plugin is a capability bundle, not a class hierarchy: connect,
//! disconnect, read static once, read dynamic every cycle, describe your
//! parameters. Device-family variation lives in data (register maps and
//! code dictionaries), never in types. The [`registry`] maps the
//! `plugin_type` config string to a constructor; the [`worker`] drives any
//! plugin through the poll state machine.

pub mod battery;
pub mod inverter;
pub mod modbus_common;
pub mod registry;
pub mod support;
pub mod worker;

use std::time::Duration;

use async_trait::async_trait;
use helio_protocol::ProtocolError;
use helio_transport::TransportError;
use helio_types::ReadingValues;

pub use registry::{PluginConstructor, PluginContext, PluginRegistry};
pub use worker::{spawn_worker, WorkerCommand, WorkerConfig, WorkerHandle, WorkerHealth};

/// Result alias for plugin operations.
pub type Result<T> = std::result::Result<T, PluginError>;

/// What kind of device a plugin fronts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceCategory {
    Inverter,
    Bms,
}

impl DeviceCategory {
    pub const fn as_str(&self) -> &'static str {
        match self {
            DeviceCategory::Inverter => "inverter",
            DeviceCategory::Bms => "bms",
        }
    }
}

/// Error kinds at the plugin boundary. Workers never see raw I/O errors;
/// everything is classified here first.
#[derive(Debug, thiserror::Error)]
pub enum PluginError {
    /// The device did not answer within the deadline.
    #[error("timeout: {0}")]
    Timeout(String),
    /// Well-formed protocol exception from the device. Not retried.
    #[error("exception response code {code}")]
    ExceptionResponse { code: u8 },
    /// Structurally valid response that fails to decode.
    #[error("decode error: {0}")]
    Decode(String),
    /// A read group failed while earlier groups already produced data.
    #[error("partial group at register {start}: {reason}")]
    PartialGroup { start: u16, reason: String },
    /// Bad or missing plugin configuration. Fatal: halts the worker.
    #[error("config error: {0}")]
    Config(String),
    /// Transport-level failure (unreachable, connection lost, ...).
    #[error("transport error: {0}")]
    Transport(String),
}

impl PluginError {
    /// Fatal errors halt the worker instead of triggering a reconnect:
    /// broken configuration, or a structural decode mismatch on a fixed
    /// register layout (a reconnect cannot change either). Single
    /// registers that fail to decode are dropped inside the driver and
    /// never surface as this variant.
    pub fn is_fatal(&self) -> bool {
        matches!(self, PluginError::Config(_) | PluginError::Decode(_))
    }

    /// Transient errors warrant a retry or reconnect.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            PluginError::Timeout(_) | PluginError::Transport(_) | PluginError::PartialGroup { .. }
        )
    }
}

impl From<TransportError> for PluginError {
    fn from(err: TransportError) -> Self {
        match err {
            TransportError::Timeout(d) | TransportError::HandshakeTimeout(d) => {
                PluginError::Timeout(format!("after {d:?}"))
            }
            other => PluginError::Transport(other.to_string()),
        }
    }
}

impl From<ProtocolError> for PluginError {
    fn from(err: ProtocolError) -> Self {
        match err {
            ProtocolError::Exception { code } => PluginError::ExceptionResponse { code },
            ProtocolError::Decode(msg) => PluginError::Decode(msg),
            ProtocolError::Transport(inner) => inner.into(),
            other => PluginError::Transport(other.to_string()),
        }
    }
}

/// Kind of a configurable plugin parameter, for UI and validation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParamKind {
    Text,
    Integer,
    Float,
    Boolean,
    /// One of a fixed set of strings.
    Choice(&'static [&'static str]),
}

/// Self-description of one plugin configuration key.
#[derive(Debug, Clone)]
pub struct ParamDescriptor {
    pub key: &'static str,
    pub description: &'static str,
    pub kind: ParamKind,
    pub required: bool,
    pub default: Option<&'static str>,
}

/// The capability contract every device plugin implements.
///
/// A plugin owns its transport exclusively. All methods run on the
/// instance's worker task, so no internal locking is needed.
#[async_trait]
pub trait DevicePlugin: Send + std::fmt::Debug {
    /// Unique type name, e.g. `deye`.
    fn name(&self) -> &'static str;

    /// Human-friendly name, e.g. `Deye / SunSynk Hybrid Inverter`.
    fn pretty_name(&self) -> &'static str;

    fn category(&self) -> DeviceCategory;

    /// Self-described configuration keys for UI and validation.
    fn configurable_params(&self) -> Vec<ParamDescriptor>;

    /// Whether a dynamic read is all-or-nothing. Defaults to false:
    /// partial groups are emitted.
    fn atomic_reads(&self) -> bool {
        false
    }

    /// Establish the transport. Idempotent; never blocks past the
    /// deadline; cleans up any half-open resource on failure.
    async fn connect(&mut self, deadline: Duration) -> Result<bool>;

    /// Always safe to call; no descriptor or port lock may leak.
    async fn disconnect(&mut self);

    fn is_connected(&self) -> bool;

    /// Read identifying data once per connection. Must include the device
    /// category and a manufacturer string.
    async fn read_static(&mut self) -> Result<ReadingValues>;

    /// Read operational data. A failure in one group does not invalidate
    /// data from earlier groups unless [`DevicePlugin::atomic_reads`] is true.
    async fn read_dynamic(&mut self) -> Result<ReadingValues>;

    /// Cumulative totals for yesterday, when the device stores them.
    /// Used to backfill the daily summary at startup.
    async fn read_yesterday_energy_summary(&mut self) -> Result<Option<ReadingValues>> {
        Ok(None)
    }
}
