//! ---
//! helio_section: "05-device-plugins"
//! helio_subsection: "module"
//! helio_type: "source"
//! helio_scope: "code"
//! helio_description: "Device plugin contract, poll workers and concrete drivers."
//! helio_version: "v0.4.2"
//! helio_owner: "tbd"
//! ---
//! Dictionaries for the POWMR inv8851 vendor protocol.

/// Topology run mode, third nibble of the run-mode word.
pub fn run_mode_text(code: u8) -> &'static str {
    match code {
        0 => "Standby",
        1 => "Fault",
        2 => "Shutdown",
        3 => "Normal",
        4 => "No Battery",
        5 => "Discharging",
        6 => "Parallel Discharge",
        7 => "Bypass",
        8 => "Charging",
        9 => "Grid Discharge",
        10 => "Micro Grid Discharge",
        _ => "Unknown",
    }
}

/// System flag word bits.
pub const SYSTEM_FLAG_BITS: &[(u8, &str)] = &[
    (0, "System power"),
    (1, "Charge finished"),
    (2, "Bus OK"),
    (3, "Bus/grid voltage match"),
    (4, "No battery"),
    (5, "PV excess"),
    (6, "Floating charge"),
    (7, "System initialisation finished"),
    (12, "Equalisation charge started"),
    (13, "Equalisation charge ready"),
];

/// Grid flag word bits.
pub const GRID_FLAG_BITS: &[(u8, &str)] = &[(0, "Grid PLL OK"), (9, "Utility disabled")];

/// Fault flag word bits (first fault word).
pub const FAULT_FLAG_BITS: &[(u8, &str)] = &[
    (0, "Bus over voltage"),
    (1, "Bus under voltage"),
    (2, "Inverter over current"),
    (3, "Inverter over voltage"),
    (4, "Inverter under voltage"),
    (5, "Battery over voltage"),
    (6, "Battery under voltage"),
    (7, "Over temperature"),
    (8, "Fan blocked"),
    (9, "Output short circuit"),
    (10, "Overload"),
];
