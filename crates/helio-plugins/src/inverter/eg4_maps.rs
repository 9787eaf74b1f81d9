//! ---
//! helio_section: "05-device-plugins"
//! helio_subsection: "module"
//! helio_type: "source"
//! helio_scope: "code"
//! helio_description: "Device plugin contract, poll workers and concrete drivers."
//! helio_version: "v0.4.2"
//! helio_owner: "tbd"
//! ---
//! Register map and code dictionaries for EG4 hybrid inverters
//! (Modbus protocol V58, little-endian word order, input registers).

use helio_protocol::{RegisterDescriptor, WireType};

const fn input(key: &'static str, addr: u16, wire: WireType) -> RegisterDescriptor {
    RegisterDescriptor::new(key, addr, wire)
}

pub const EG4_REGISTERS: &[RegisterDescriptor] = &[
    input("operation_mode", 0, WireType::Code).unit("code"),
    input("pv1_voltage", 1, WireType::U16).scale(0.1).unit("V"),
    input("pv2_voltage", 2, WireType::U16).scale(0.1).unit("V"),
    input("pv3_voltage", 3, WireType::U16).scale(0.1).unit("V"),
    input("battery_voltage", 4, WireType::U16).scale(0.1).unit("V"),
    input("battery_soc_soh", 5, WireType::Hex).unit("hex"),
    input("internal_fault_code", 6, WireType::Bitfield).unit("bitfield"),
    input("pv1_power", 7, WireType::U16).unit("W"),
    input("pv2_power", 8, WireType::U16).unit("W"),
    input("pv3_power", 9, WireType::U16).unit("W"),
    input("battery_charge_power", 10, WireType::U16).unit("W"),
    input("battery_discharge_power", 11, WireType::U16).unit("W"),
    input("grid_r_voltage", 12, WireType::U16).scale(0.1).unit("V"),
    input("grid_s_voltage", 13, WireType::U16).scale(0.1).unit("V"),
    input("grid_t_voltage", 14, WireType::U16).scale(0.1).unit("V"),
    input("grid_frequency", 15, WireType::U16).scale(0.01).unit("Hz"),
    input("inverter_power", 16, WireType::U16).unit("W"),
    input("ac_charge_power", 17, WireType::U16).unit("W"),
    input("inverter_current", 18, WireType::U16).scale(0.01).unit("A"),
    input("eps_voltage", 20, WireType::U16).scale(0.1).unit("V"),
    input("eps_power", 24, WireType::U16).unit("W"),
    input("power_to_grid", 26, WireType::U16).unit("W"),
    input("power_to_user", 27, WireType::U16).unit("W"),
    input("daily_pv1_energy", 28, WireType::U16).scale(0.1).unit("kWh"),
    input("daily_pv2_energy", 29, WireType::U16).scale(0.1).unit("kWh"),
    input("daily_pv3_energy", 30, WireType::U16).scale(0.1).unit("kWh"),
    input("daily_inverter_energy", 31, WireType::U16).scale(0.1).unit("kWh"),
    input("daily_battery_charge", 33, WireType::U16).scale(0.1).unit("kWh"),
    input("daily_battery_discharge", 34, WireType::U16).scale(0.1).unit("kWh"),
    input("daily_energy_to_grid", 36, WireType::U16).scale(0.1).unit("kWh"),
    input("daily_energy_to_user", 37, WireType::U16).scale(0.1).unit("kWh"),
    input("total_pv_energy", 40, WireType::U32).scale(0.1).unit("kWh").summary(),
    input("radiator_temp_1", 64, WireType::I16).scale(0.1).unit("C"),
    input("battery_temperature", 66, WireType::I16).scale(0.1).unit("C"),
    input("serial_number", 115, WireType::Ascii8).statik(),
    input("firmware_version", 123, WireType::Hex).unit("hex").statik(),
];

/// Operation state register interpretation.
pub fn operation_mode_text(code: i64) -> &'static str {
    match code {
        0 => "Standby",
        1 => "Fault",
        2 => "Programming",
        4 => "Generating",
        8 => "Charging",
        12 => "Normal",
        16 => "Off",
        _ => "Unknown",
    }
}

/// Internal fault code bits.
pub const FAULT_BITS: &[(u8, &str)] = &[
    (0, "Internal communication fault"),
    (1, "Model fault"),
    (3, "BMS communication lost"),
    (4, "Battery reverse polarity"),
    (7, "Grid voltage out of range"),
    (8, "Grid frequency out of range"),
    (10, "Bus voltage high"),
    (12, "EPS short circuit"),
    (13, "PV over voltage"),
    (14, "Over temperature"),
];
