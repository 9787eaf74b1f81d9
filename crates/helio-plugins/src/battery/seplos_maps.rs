//! ---
//! helio_section: "05-device-plugins"
//! helio_subsection: "module"
//! helio_type: "source"
//! helio_scope: "code"
//! helio_description: "Device plugin contract, poll workers and concrete drivers."
//! helio_version: "v0.4.2"
//! helio_owner: "tbd"
//! ---
//! Register map for Seplos V3 BMS packs (Modbus input registers).
//!
//! Temperatures arrive in tenths of a kelvin; the plugin converts to
//! Celsius during standardisation.

use helio_protocol::{RegisterDescriptor, WireType};

const fn input(key: &'static str, addr: u16, wire: WireType) -> RegisterDescriptor {
    RegisterDescriptor::new(key, addr, wire)
}

/// Telemetry and cell blocks. Current is signed, positive while charging.
pub const SEPLOS_REGISTERS: &[RegisterDescriptor] = &[
    input("pack_voltage", 0x1000, WireType::U16).scale(0.01).unit("V"),
    input("pack_current", 0x1001, WireType::I16).scale(0.01).unit("A"),
    input("remaining_capacity", 0x1002, WireType::U16).scale(0.01).unit("Ah"),
    input("total_capacity", 0x1003, WireType::U16).scale(0.01).unit("Ah"),
    input("soc", 0x1005, WireType::U16).scale(0.1).unit("%"),
    input("soh", 0x1006, WireType::U16).scale(0.1).unit("%"),
    input("cycle_count", 0x1007, WireType::U16).unit("count"),
    input("avg_cell_voltage", 0x1008, WireType::U16).scale(0.001).unit("V"),
    input("max_cell_voltage", 0x100A, WireType::U16).scale(0.001).unit("V"),
    input("min_cell_voltage", 0x100B, WireType::U16).scale(0.001).unit("V"),
    input("max_cell_temp", 0x100C, WireType::U16).scale(0.1).unit("K"),
    input("min_cell_temp", 0x100D, WireType::U16).scale(0.1).unit("K"),
    input("cell_01_voltage", 0x1100, WireType::U16).scale(0.001).unit("V"),
    input("cell_02_voltage", 0x1101, WireType::U16).scale(0.001).unit("V"),
    input("cell_03_voltage", 0x1102, WireType::U16).scale(0.001).unit("V"),
    input("cell_04_voltage", 0x1103, WireType::U16).scale(0.001).unit("V"),
    input("cell_05_voltage", 0x1104, WireType::U16).scale(0.001).unit("V"),
    input("cell_06_voltage", 0x1105, WireType::U16).scale(0.001).unit("V"),
    input("cell_07_voltage", 0x1106, WireType::U16).scale(0.001).unit("V"),
    input("cell_08_voltage", 0x1107, WireType::U16).scale(0.001).unit("V"),
    input("cell_09_voltage", 0x1108, WireType::U16).scale(0.001).unit("V"),
    input("cell_10_voltage", 0x1109, WireType::U16).scale(0.001).unit("V"),
    input("cell_11_voltage", 0x110A, WireType::U16).scale(0.001).unit("V"),
    input("cell_12_voltage", 0x110B, WireType::U16).scale(0.001).unit("V"),
    input("cell_13_voltage", 0x110C, WireType::U16).scale(0.001).unit("V"),
    input("cell_14_voltage", 0x110D, WireType::U16).scale(0.001).unit("V"),
    input("cell_15_voltage", 0x110E, WireType::U16).scale(0.001).unit("V"),
    input("cell_16_voltage", 0x110F, WireType::U16).scale(0.001).unit("V"),
    input("temp_1", 0x1110, WireType::U16).scale(0.1).unit("K"),
    input("temp_2", 0x1111, WireType::U16).scale(0.1).unit("K"),
    input("temp_3", 0x1112, WireType::U16).scale(0.1).unit("K"),
    input("temp_4", 0x1113, WireType::U16).scale(0.1).unit("K"),
    input("alarm_word_1", 0x1300, WireType::Bitfield).unit("bitfield"),
    input("alarm_word_2", 0x1301, WireType::Bitfield).unit("bitfield"),
    input("fet_status", 0x1302, WireType::Bitfield).unit("bitfield"),
    input("pack_model", 0x1700, WireType::Ascii8).statik(),
    input("pack_serial", 0x1708, WireType::Ascii8).statik(),
    input("software_version", 0x1710, WireType::Hex).unit("hex").statik(),
];

/// Zero Celsius in the pack's deci-kelvin representation.
pub const KELVIN_OFFSET: f64 = 273.1;

pub const ALARM_WORD_1_BITS: &[(u8, &str)] = &[
    (0, "Cell over voltage"),
    (1, "Cell under voltage"),
    (2, "Pack over voltage"),
    (3, "Pack under voltage"),
    (4, "Charge over current"),
    (5, "Discharge over current"),
    (6, "Cell over temperature"),
    (7, "Cell under temperature"),
    (8, "Ambient over temperature"),
    (9, "MOSFET over temperature"),
    (10, "SOC low"),
];

pub const ALARM_WORD_2_BITS: &[(u8, &str)] = &[
    (0, "Cell voltage difference high"),
    (1, "Charge FET failure"),
    (2, "Discharge FET failure"),
    (3, "Current sensor failure"),
    (4, "Cell failure"),
    (5, "NTC failure"),
];

/// FET status word bit positions.
pub const FET_CHARGE_ON_BIT: u16 = 1 << 0;
pub const FET_DISCHARGE_ON_BIT: u16 = 1 << 1;
