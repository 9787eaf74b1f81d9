//! ---
//! helio_section: "05-device-plugins"
//! helio_subsection: "module"
//! helio_type: "source"
//! helio_scope: "code"
//! helio_description: "Device plugin contract, poll workers and concrete drivers."
//! helio_version: "v0.4.2"
//! helio_owner: "tbd"
//! ---
//! Register maps and code dictionaries for Deye / SunSynk hybrid
//! inverters. Three model series share the driver; only the data differs.

use helio_protocol::{RegisterDescriptor, WireType};

const fn holding(key: &'static str, addr: u16, wire: WireType) -> RegisterDescriptor {
    RegisterDescriptor::new(key, addr, wire).holding()
}

/// Modern single-phase hybrids (SunSynk 5K, SUN-5K-SG04LP1 and friends).
pub const MODERN_HYBRID_REGISTERS: &[RegisterDescriptor] = &[
    holding("device_serial", 3, WireType::Ascii8).statik(),
    holding("battery_temperature", 182, WireType::I16).scale(0.1).unit("C"),
    holding("bms_protocol_code", 325, WireType::Code).unit("code").statik(),
    holding("inverter_status_code", 500, WireType::Code).unit("code"),
    holding("pv1_voltage", 503, WireType::U16).scale(0.1).unit("V"),
    holding("pv1_current", 504, WireType::U16).scale(0.1).unit("A"),
    holding("pv2_voltage", 505, WireType::U16).scale(0.1).unit("V"),
    holding("pv2_current", 506, WireType::U16).scale(0.1).unit("A"),
    holding("day_energy", 514, WireType::U16).scale(0.1).unit("kWh"),
    holding("total_energy", 522, WireType::U32).scale(0.1).unit("kWh").summary(),
    holding("grid_daily_buy", 526, WireType::U16).scale(0.1).unit("kWh"),
    holding("grid_daily_sell", 527, WireType::U16).scale(0.1).unit("kWh"),
    holding("battery_daily_charge", 528, WireType::U16).scale(0.1).unit("kWh"),
    holding("battery_daily_discharge", 529, WireType::U16).scale(0.1).unit("kWh"),
    holding("grid_frequency", 533, WireType::U16).scale(0.01).unit("Hz"),
    holding("inverter_voltage", 534, WireType::U16).scale(0.1).unit("V"),
    holding("inverter_current", 535, WireType::U16).scale(0.1).unit("A"),
    holding("radiator_temp", 540, WireType::I16).scale(0.1).unit("C"),
    holding("fault_bits_1", 553, WireType::Bitfield).unit("bitfield"),
    holding("grid_power", 554, WireType::I16).unit("W"),
    holding("warning_bits_1", 555, WireType::Bitfield).unit("bitfield"),
    holding("inverter_power", 560, WireType::I16).unit("W"),
    holding("load_power", 570, WireType::I16).unit("W"),
    holding("battery_voltage", 578, WireType::U16).scale(0.1).unit("V"),
    holding("battery_current", 579, WireType::I16).scale(0.1).unit("A"),
    holding("battery_power", 582, WireType::I16).unit("W"),
    holding("battery_soc", 586, WireType::U16).unit("%"),
];

/// Older single-phase hybrids with the low-address layout.
pub const LEGACY_HYBRID_REGISTERS: &[RegisterDescriptor] = &[
    holding("device_serial", 3, WireType::Ascii8).statik(),
    holding("inverter_status_code", 59, WireType::Code).unit("code"),
    holding("battery_daily_charge", 70, WireType::U16).scale(0.1).unit("kWh"),
    holding("battery_daily_discharge", 71, WireType::U16).scale(0.1).unit("kWh"),
    holding("grid_daily_buy", 76, WireType::U16).scale(0.1).unit("kWh"),
    holding("grid_daily_sell", 77, WireType::U16).scale(0.1).unit("kWh"),
    holding("grid_frequency", 79, WireType::U16).scale(0.01).unit("Hz"),
    holding("day_energy", 108, WireType::U16).scale(0.1).unit("kWh"),
    holding("pv1_voltage", 109, WireType::U16).scale(0.1).unit("V"),
    holding("pv1_current", 110, WireType::U16).scale(0.1).unit("A"),
    holding("pv2_voltage", 111, WireType::U16).scale(0.1).unit("V"),
    holding("pv2_current", 112, WireType::U16).scale(0.1).unit("A"),
    holding("total_energy", 96, WireType::U32).scale(0.1).unit("kWh").summary(),
    holding("grid_voltage", 150, WireType::U16).scale(0.1).unit("V"),
    holding("grid_power", 169, WireType::I16).unit("W"),
    holding("load_power", 178, WireType::I16).unit("W"),
    holding("battery_temperature", 182, WireType::I16).scale(0.1).unit("C"),
    holding("battery_voltage", 183, WireType::U16).scale(0.01).unit("V"),
    holding("battery_soc", 184, WireType::U16).unit("%"),
    holding("pv1_power", 186, WireType::U16).unit("W"),
    holding("pv2_power", 187, WireType::U16).unit("W"),
    holding("battery_power", 190, WireType::I16).unit("W"),
    holding("battery_current", 191, WireType::I16).scale(0.01).unit("A"),
    holding("fault_bits_1", 103, WireType::Bitfield).unit("bitfield"),
    holding("radiator_temp", 90, WireType::I16).scale(0.1).unit("C"),
];

/// Three-phase hybrids (SG01HP3 and similar).
pub const THREE_PHASE_REGISTERS: &[RegisterDescriptor] = &[
    holding("device_serial", 3, WireType::Ascii8).statik(),
    holding("inverter_status_code", 500, WireType::Code).unit("code"),
    holding("pv1_voltage", 503, WireType::U16).scale(0.1).unit("V"),
    holding("pv1_current", 504, WireType::U16).scale(0.1).unit("A"),
    holding("pv2_voltage", 505, WireType::U16).scale(0.1).unit("V"),
    holding("pv2_current", 506, WireType::U16).scale(0.1).unit("A"),
    holding("pv3_voltage", 507, WireType::U16).scale(0.1).unit("V"),
    holding("pv3_current", 508, WireType::U16).scale(0.1).unit("A"),
    holding("pv4_voltage", 509, WireType::U16).scale(0.1).unit("V"),
    holding("pv4_current", 510, WireType::U16).scale(0.1).unit("A"),
    holding("day_energy", 514, WireType::U16).scale(0.1).unit("kWh"),
    holding("total_energy", 522, WireType::U32).scale(0.1).unit("kWh").summary(),
    holding("grid_daily_buy", 526, WireType::U16).scale(0.1).unit("kWh"),
    holding("grid_daily_sell", 527, WireType::U16).scale(0.1).unit("kWh"),
    holding("battery_daily_charge", 528, WireType::U16).scale(0.1).unit("kWh"),
    holding("battery_daily_discharge", 529, WireType::U16).scale(0.1).unit("kWh"),
    holding("grid_frequency", 533, WireType::U16).scale(0.01).unit("Hz"),
    holding("radiator_temp", 540, WireType::I16).scale(0.1).unit("C"),
    holding("fault_bits_1", 553, WireType::Bitfield).unit("bitfield"),
    holding("warning_bits_1", 555, WireType::Bitfield).unit("bitfield"),
    holding("battery_temperature", 586, WireType::I16).scale(0.1).unit("C"),
    holding("grid_l1_voltage", 598, WireType::U16).scale(0.1).unit("V"),
    holding("grid_l2_voltage", 599, WireType::U16).scale(0.1).unit("V"),
    holding("grid_l3_voltage", 600, WireType::U16).scale(0.1).unit("V"),
    holding("grid_power", 625, WireType::I16).unit("W"),
    holding("inverter_power", 636, WireType::I16).unit("W"),
    holding("load_power", 653, WireType::I16).unit("W"),
    holding("battery_power", 590, WireType::I16).unit("W"),
    holding("battery_voltage", 587, WireType::U16).scale(0.01).unit("V"),
    holding("battery_current", 591, WireType::I16).scale(0.01).unit("A"),
    holding("battery_soc", 588, WireType::U16).unit("%"),
];

/// Status register interpretation per series.
pub fn status_text_modern(code: i64) -> &'static str {
    match code {
        0 => "Standby",
        1 => "Self-check",
        2 => "Generating",
        3 => "Alarm",
        4 => "Fault",
        _ => "Unknown",
    }
}

pub fn status_text_legacy(code: i64) -> &'static str {
    match code {
        0 => "Standby",
        1 => "Self-checking",
        2 => "Generating",
        3 => "Fault",
        _ => "Unknown",
    }
}

/// Fault bits documented by the vendor. Bit positions are within the
/// first fault register.
pub const FAULT_BITS_1: &[(u8, &str)] = &[
    (2, "AC over current fault of hardware"),
    (3, "No AC grid"),
    (4, "DC over current fault of the hardware"),
    (6, "Emergency stop fault"),
    (7, "DC/DC softstart fault"),
    (8, "DC insulation impedance failure"),
    (9, "Parallel system stopped"),
    (10, "DC busbar unbalanced"),
    (11, "Aux power board failure"),
    (12, "AC line low voltage"),
    (13, "Parallel CANBus fault"),
    (14, "Working mode changed"),
    (15, "Backup battery fault"),
];

/// Warning bits documented by the vendor.
pub const WARNING_BITS_1: &[(u8, &str)] = &[
    (1, "Fan failure"),
    (2, "Grid phase wrong"),
    (10, "BMS communication fault"),
    (14, "Heat sink high temperature"),
];

/// BMS protocol codes advertised in the battery protocol register.
pub fn bms_protocol_name(code: i64) -> Option<&'static str> {
    match code {
        0 => Some("Pylontech CAN"),
        1 => Some("Sacred Sun RS485"),
        3 => Some("Dyness CAN"),
        6 => Some("GenixGreen RS485"),
        12 => Some("Pylon RS485"),
        13 => Some("Vision CAN"),
        14 => Some("Wattsonic RS485"),
        15 => Some("Unipower RS485"),
        _ => None,
    }
}
