//! ---
//! helio_section: "04-device-connectivity"
//! helio_subsection: "module"
//! helio_type: "source"
//! helio_scope: "code"
//! helio_description: "Wire protocol codecs and register-group planning."
//! helio_version: "v0.4.2"
//! helio_owner: "tbd"
//! ---
//! POWMR "inv8851" vendor framing.
//!
//! A length-prefixed binary frame:
//!
//! ```text
//! sync(2) = 88 51 | version(1) | cmd(1) | payload_len(2, LE) | payload(N) | checksum(2, LE)
//! ```
//!
//! The checksum is the 16-bit sum of every byte from `version` through the
//! end of the payload, modulo 2^16, transmitted little-endian. Protocol
//! revision 2 differs from revision 1 only in the state/config payload
//! lengths.

use std::time::Duration;

use helio_transport::ByteTransport;

use crate::{ProtocolError, Result};

/// Frame sync word on the wire.
pub const SYNC: [u8; 2] = [0x88, 0x51];

/// Largest payload the codec will accept; anything longer is a corrupt
/// length field.
pub const MAX_PAYLOAD: usize = 512;

const HEADER_LEN: usize = 6;
const TRAILER_LEN: usize = 2;

/// Commands understood by the inverter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Inv8851Command {
    /// Operational state block.
    ReadState = 0x03,
    /// Configuration block.
    ReadConfig = 0x30,
}

/// Expected state payload length in bytes for a protocol revision.
pub const fn state_payload_len(version: u8) -> usize {
    match version {
        2 => 148,
        _ => 144,
    }
}

/// Expected config payload length in bytes for a protocol revision.
pub const fn config_payload_len(version: u8) -> usize {
    match version {
        2 => 94,
        _ => 90,
    }
}

/// One decoded frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Inv8851Frame {
    pub version: u8,
    pub command: u8,
    pub payload: Vec<u8>,
}

fn checksum_over(bytes: &[u8]) -> u16 {
    bytes.iter().fold(0u16, |sum, &b| sum.wrapping_add(b as u16))
}

/// Encode a frame. Requests carry an empty payload; the command byte tells
/// the inverter which block to send.
pub fn encode_frame(version: u8, command: Inv8851Command, payload: &[u8]) -> Vec<u8> {
    let mut frame = Vec::with_capacity(HEADER_LEN + payload.len() + TRAILER_LEN);
    frame.extend_from_slice(&SYNC);
    frame.push(version);
    frame.push(command as u8);
    frame.extend_from_slice(&(payload.len() as u16).to_le_bytes());
    frame.extend_from_slice(payload);
    let sum = checksum_over(&frame[2..]);
    frame.extend_from_slice(&sum.to_le_bytes());
    frame
}

/// Decode and validate a complete frame.
pub fn decode_frame(bytes: &[u8]) -> Result<Inv8851Frame> {
    if bytes.len() < HEADER_LEN + TRAILER_LEN {
        return Err(ProtocolError::Truncated {
            needed: HEADER_LEN + TRAILER_LEN,
            got: bytes.len(),
        });
    }
    if bytes[0..2] != SYNC {
        return Err(ProtocolError::FrameMismatch(format!(
            "bad sync {:02x} {:02x}",
            bytes[0], bytes[1]
        )));
    }

    let payload_len = u16::from_le_bytes([bytes[4], bytes[5]]) as usize;
    if payload_len > MAX_PAYLOAD {
        return Err(ProtocolError::FrameMismatch(format!(
            "payload length {payload_len} exceeds limit {MAX_PAYLOAD}"
        )));
    }
    let total = HEADER_LEN + payload_len + TRAILER_LEN;
    if bytes.len() < total {
        return Err(ProtocolError::Truncated {
            needed: total,
            got: bytes.len(),
        });
    }

    let expected = checksum_over(&bytes[2..HEADER_LEN + payload_len]);
    let actual = u16::from_le_bytes([bytes[total - 2], bytes[total - 1]]);
    if expected != actual {
        return Err(ProtocolError::BadChecksum { expected, actual });
    }

    Ok(Inv8851Frame {
        version: bytes[2],
        command: bytes[3],
        payload: bytes[HEADER_LEN..HEADER_LEN + payload_len].to_vec(),
    })
}

// State payload word offsets. 16-bit words, big-endian bytes.
const W_RUN_MODE: usize = 0;
const W_SYSTEM_FLAGS: usize = 1;
const W_FAULT_FLAGS: usize = 2; // two words
const W_GRID_FLAGS: usize = 4;
const W_WARNING_FLAGS: usize = 5; // eight words
const W_PV_PARALLEL_FLAGS: usize = 13;
const W_SOFTWARE_VERSION: usize = 14;
const W_INV_VOLTAGE: usize = 21;
const W_INV_CURRENT: usize = 22;
const W_INV_FREQ: usize = 23;
const W_LOAD_VA: usize = 25;
const W_LOAD_WATT: usize = 27;
const W_LOAD_PERCENT: usize = 29;
const W_GRID_VOLTAGE: usize = 33;
const W_GRID_CURRENT: usize = 34;
const W_GRID_FREQ: usize = 35;
const W_BATT_VOLTAGE: usize = 39;
const W_BATT_CURRENT: usize = 40;
const W_BATT_TEMPERATURE: usize = 42;
const W_PV_VOLTAGE: usize = 43;
const W_PV_CURRENT: usize = 44;
const W_PV_POWER: usize = 45;
const W_BUS_VOLTAGE: usize = 46;
const W_FAN_SPEEDS: usize = 50;
const W_NTC_1_2: usize = 51;
const W_NTC_3_4: usize = 52;
const W_BMS_SOC: usize = 53;
const W_BMS_VOLTAGE: usize = 54;
const W_BMS_CURRENT: usize = 55;
const W_CELLS: usize = 56; // sixteen words

/// Decoded operational state. Scales follow the register documentation:
/// voltages in 0.1 V or 0.01 V steps, currents in 0.01 A, frequencies in
/// 0.01 Hz, cell voltages in millivolts.
#[derive(Debug, Clone, PartialEq)]
pub struct Inv8851State {
    pub run_mode: u16,
    pub system_flags: u16,
    pub fault_flags: [u16; 2],
    pub grid_flags: u16,
    pub warning_flags: [u16; 8],
    pub pv_parallel_flags: u16,
    pub software_version: i16,
    pub inv_voltage: f64,
    pub inv_current: f64,
    pub inv_freq: f64,
    pub load_va: i16,
    pub load_watt: i16,
    pub load_percent: i16,
    pub grid_voltage: f64,
    pub grid_current: f64,
    pub grid_freq: f64,
    pub batt_voltage: f64,
    pub batt_charge_current: f64,
    pub batt_temperature: f64,
    pub pv_voltage: f64,
    pub pv_current: f64,
    pub pv_power: i16,
    pub bus_voltage: f64,
    pub fan_speed_percent: [u8; 2],
    pub ntc_temperatures: [i8; 4],
    pub bms_soc: i16,
    pub bms_voltage: f64,
    pub bms_current: f64,
    /// Cell voltages in volts; zero entries mean the slot is unpopulated.
    pub cell_voltages: [f64; 16],
}

impl Inv8851State {
    /// The topology run mode lives in the third nibble of the run-mode word.
    pub fn run_mode_code(&self) -> u8 {
        ((self.run_mode >> 8) & 0x0F) as u8
    }

    /// Cell voltages for populated slots only.
    pub fn populated_cells(&self) -> Vec<f64> {
        self.cell_voltages
            .iter()
            .copied()
            .filter(|v| *v > 0.0)
            .collect()
    }

    /// Parse the state payload of either protocol revision; the revision 2
    /// trailer words are accepted and ignored.
    pub fn parse(payload: &[u8], version: u8) -> Result<Self> {
        let expected = state_payload_len(version);
        if payload.len() != expected {
            return Err(ProtocolError::Decode(format!(
                "state payload is {} bytes, expected {} for protocol v{}",
                payload.len(),
                expected,
                version
            )));
        }

        let words: Vec<u16> = payload
            .chunks_exact(2)
            .map(|pair| u16::from_be_bytes([pair[0], pair[1]]))
            .collect();

        let word = |idx: usize| words[idx];
        let signed = |idx: usize| words[idx] as i16;

        let mut fault_flags = [0u16; 2];
        for (i, slot) in fault_flags.iter_mut().enumerate() {
            *slot = word(W_FAULT_FLAGS + i);
        }
        let mut warning_flags = [0u16; 8];
        for (i, slot) in warning_flags.iter_mut().enumerate() {
            *slot = word(W_WARNING_FLAGS + i);
        }
        let mut cell_voltages = [0f64; 16];
        for (i, slot) in cell_voltages.iter_mut().enumerate() {
            *slot = signed(W_CELLS + i) as f64 * 0.001;
        }

        let fan = word(W_FAN_SPEEDS).to_be_bytes();
        let ntc_a = word(W_NTC_1_2).to_be_bytes();
        let ntc_b = word(W_NTC_3_4).to_be_bytes();

        Ok(Self {
            run_mode: word(W_RUN_MODE),
            system_flags: word(W_SYSTEM_FLAGS),
            fault_flags,
            grid_flags: word(W_GRID_FLAGS),
            warning_flags,
            pv_parallel_flags: word(W_PV_PARALLEL_FLAGS),
            software_version: signed(W_SOFTWARE_VERSION),
            inv_voltage: signed(W_INV_VOLTAGE) as f64 * 0.1,
            inv_current: signed(W_INV_CURRENT) as f64 * 0.01,
            inv_freq: signed(W_INV_FREQ) as f64 * 0.01,
            load_va: signed(W_LOAD_VA),
            load_watt: signed(W_LOAD_WATT),
            load_percent: signed(W_LOAD_PERCENT),
            grid_voltage: signed(W_GRID_VOLTAGE) as f64 * 0.1,
            grid_current: signed(W_GRID_CURRENT) as f64 * 0.01,
            grid_freq: signed(W_GRID_FREQ) as f64 * 0.01,
            batt_voltage: signed(W_BATT_VOLTAGE) as f64 * 0.01,
            batt_charge_current: signed(W_BATT_CURRENT) as f64 * 0.1,
            batt_temperature: signed(W_BATT_TEMPERATURE) as f64 * 0.1,
            pv_voltage: signed(W_PV_VOLTAGE) as f64 * 0.1,
            pv_current: signed(W_PV_CURRENT) as f64 * 0.01,
            pv_power: signed(W_PV_POWER),
            bus_voltage: signed(W_BUS_VOLTAGE) as f64 * 0.1,
            fan_speed_percent: [fan[0], fan[1]],
            ntc_temperatures: [
                ntc_a[0] as i8,
                ntc_a[1] as i8,
                ntc_b[0] as i8,
                ntc_b[1] as i8,
            ],
            bms_soc: signed(W_BMS_SOC),
            bms_voltage: signed(W_BMS_VOLTAGE) as f64 * 0.01,
            bms_current: signed(W_BMS_CURRENT) as f64 * 0.01,
            cell_voltages,
        })
    }
}

/// Client for the vendor protocol. The whole state block arrives in one
/// frame, so reads are inherently atomic.
#[derive(Debug)]
pub struct Inv8851Client {
    transport: Box<dyn ByteTransport>,
    version: u8,
}

impl Inv8851Client {
    pub fn new(transport: Box<dyn ByteTransport>, version: u8) -> Self {
        Self { transport, version }
    }

    pub async fn connect(&mut self, deadline: Duration) -> Result<()> {
        self.transport.connect(deadline).await?;
        Ok(())
    }

    pub async fn disconnect(&mut self) {
        self.transport.close().await;
    }

    pub fn is_connected(&self) -> bool {
        self.transport.is_open()
    }

    pub fn describe(&self) -> String {
        self.transport.describe()
    }

    pub fn version(&self) -> u8 {
        self.version
    }

    /// Request and parse the operational state block.
    pub async fn read_state(&mut self, deadline: Duration) -> Result<Inv8851State> {
        let payload = self
            .exchange(Inv8851Command::ReadState, state_payload_len(self.version), deadline)
            .await?;
        Inv8851State::parse(&payload, self.version)
    }

    /// Request the raw configuration block.
    pub async fn read_config(&mut self, deadline: Duration) -> Result<Vec<u8>> {
        self.exchange(Inv8851Command::ReadConfig, config_payload_len(self.version), deadline)
            .await
    }

    async fn exchange(
        &mut self,
        command: Inv8851Command,
        expected_payload: usize,
        deadline: Duration,
    ) -> Result<Vec<u8>> {
        self.transport.drain().await;

        let request = encode_frame(self.version, command, &[]);
        self.transport.write_all(&request, deadline).await?;

        let total = HEADER_LEN + expected_payload + TRAILER_LEN;
        let mut response = vec![0u8; total];
        self.transport.read_exact(&mut response, deadline).await?;

        let frame = decode_frame(&response)?;
        if frame.command != command as u8 {
            return Err(ProtocolError::FrameMismatch(format!(
                "command {:#04x} in response, expected {:#04x}",
                frame.command, command as u8
            )));
        }
        if frame.payload.len() != expected_payload {
            return Err(ProtocolError::Decode(format!(
                "payload {} bytes, expected {}",
                frame.payload.len(),
                expected_payload
            )));
        }
        Ok(frame.payload)
    }
}
