//! ---
//! helio_section: "04-device-connectivity"
//! helio_subsection: "module"
//! helio_type: "source"
//! helio_scope: "code"
//! helio_description: "Byte-level device transports and reachability checks."
//! helio_version: "v0.4.2"
//! helio_owner: "tbd"
//! ---
//! Byte-stream endpoints for device communication.
//!
//! Two variants exist: TCP (Modbus-TCP gateways, RS485-to-Ethernet
//! converters) and serial (direct RS485/RS232 adapters). Every operation
//! takes an explicit deadline derived from the caller's poll budget; a
//! worker can therefore never hang on a dead link longer than its cycle
//! allows.

pub mod probe;
pub mod serial;
pub mod tcp;

use async_trait::async_trait;

pub use probe::{icmp_ping, probe_tcp_port, ProbeOutcome};
pub use serial::SerialTransport;
pub use tcp::TcpTransport;

use std::time::Duration;

/// Result alias for transport operations.
pub type Result<T> = std::result::Result<T, TransportError>;

/// Error kinds a transport can produce. Higher layers use the kind to
/// classify transient vs. permanent failures.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    /// The pre-flight probe (or connect) established the peer is not there.
    #[error("peer unreachable: {0}")]
    Unreachable(String),
    /// The connection attempt did not complete within its deadline.
    #[error("handshake timed out after {0:?}")]
    HandshakeTimeout(Duration),
    /// An I/O operation exceeded its deadline.
    #[error("operation timed out after {0:?}")]
    Timeout(Duration),
    /// Underlying I/O failure.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    /// The endpoint is not open (never connected, or closed by the peer).
    #[error("transport closed")]
    Closed,
}

impl TransportError {
    /// Every transport failure is worth a retry or reconnect; permanence
    /// lives at the plugin layer (bad config, fixed-register decode).
    pub fn is_transient(&self) -> bool {
        true
    }
}

/// A connectable byte-stream endpoint owned exclusively by one worker.
#[async_trait]
pub trait ByteTransport: Send + std::fmt::Debug {
    /// Open the endpoint. Idempotent: an already-open transport returns
    /// immediately. On failure no half-open resource may remain.
    async fn connect(&mut self, deadline: Duration) -> Result<()>;

    /// Read exactly `buf.len()` bytes before the deadline.
    async fn read_exact(&mut self, buf: &mut [u8], deadline: Duration) -> Result<()>;

    /// Write the whole buffer before the deadline.
    async fn write_all(&mut self, buf: &[u8], deadline: Duration) -> Result<()>;

    /// Discard any buffered unread bytes (stale responses after a timeout).
    async fn drain(&mut self);

    /// Close the endpoint. Always safe to call; never leaks a descriptor.
    async fn close(&mut self);

    /// Whether the endpoint is currently open.
    fn is_open(&self) -> bool;

    /// RTT observed by the most recent reachability probe, where the
    /// transport has one. Drives communication auto-tuning.
    fn measured_rtt(&self) -> Option<Duration> {
        None
    }

    /// Human-readable target for logs, e.g. `tcp://192.168.1.20:502`.
    fn describe(&self) -> String;
}
