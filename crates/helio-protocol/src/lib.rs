//! ---
//! helio_section: "04-device-connectivity"
//! helio_subsection: "module"
//! helio_type: "source"
//! helio_scope: "code"
//! helio_description: "Wire protocol codecs and register-group planning."
//! helio_version: "v0.4.2"
//! helio_owner: "tbd"
//! ---
//! Wire protocol codecs.
//!
//! Everything here is bit-exact and transport-agnostic: the Modbus RTU/TCP
//! framing, the register decoder shared by all Modbus plugins, the
//! read-group planner that fuses adjacent registers into single requests,
//! and the POWMR inv8851 vendor framing.

pub mod grouping;
pub mod inv8851;
pub mod modbus;
pub mod registers;

pub use grouping::{build_read_groups, ReadGroup};
pub use inv8851::{Inv8851Client, Inv8851Command, Inv8851Frame, Inv8851State};
pub use modbus::{crc16, ModbusClient, ModbusMode};
pub use registers::{
    decode_register, encode_register, RawValue, RegisterDescriptor, RegisterFunction, WireType,
    WordOrder,
};

use helio_transport::TransportError;

/// Result alias for codec operations.
pub type Result<T> = std::result::Result<T, ProtocolError>;

/// Error type shared by the protocol codecs.
#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    /// The device answered with a Modbus exception PDU. Not retried.
    /// [`exception_name`] maps the code to its standard description.
    #[error("modbus exception code {code}")]
    Exception { code: u8 },
    /// CRC of a received RTU frame did not match.
    #[error("crc mismatch: expected {expected:#06x}, got {actual:#06x}")]
    BadCrc { expected: u16, actual: u16 },
    /// Checksum of a received vendor frame did not match.
    #[error("checksum mismatch: expected {expected:#06x}, got {actual:#06x}")]
    BadChecksum { expected: u16, actual: u16 },
    /// A structurally valid frame disagreed with the request (transaction
    /// id, unit id, sync word, function code).
    #[error("frame mismatch: {0}")]
    FrameMismatch(String),
    /// The peer closed or stalled mid-frame.
    #[error("truncated frame: needed {needed} bytes, got {got}")]
    Truncated { needed: usize, got: usize },
    /// A structurally valid response failed to decode into a value.
    #[error("decode error: {0}")]
    Decode(String),
    /// Transport-level failure underneath the codec.
    #[error(transparent)]
    Transport(#[from] TransportError),
}

impl ProtocolError {
    /// Whether a retry within the same poll is worthwhile.
    pub fn is_transient(&self) -> bool {
        match self {
            ProtocolError::Transport(err) => err.is_transient(),
            ProtocolError::BadCrc { .. }
            | ProtocolError::BadChecksum { .. }
            | ProtocolError::Truncated { .. } => true,
            ProtocolError::Exception { .. }
            | ProtocolError::FrameMismatch(_)
            | ProtocolError::Decode(_) => false,
        }
    }
}

/// Human-readable name for a Modbus exception code.
pub fn exception_name(code: u8) -> &'static str {
    match code {
        1 => "illegal function",
        2 => "illegal data address",
        3 => "illegal data value",
        4 => "slave device failure",
        5 => "acknowledge",
        6 => "slave device busy",
        8 => "memory parity error",
        10 => "gateway path unavailable",
        11 => "gateway target device failed to respond",
        _ => "unknown exception",
    }
}
