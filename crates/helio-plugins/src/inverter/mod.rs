//! ---
//! helio_section: "05-device-plugins"
//! helio_subsection: "module"
//! helio_type: "source"
//! helio_scope: "code"
//! helio_description: "Device plugin contract, poll workers and concrete drivers."
//! helio_version: "v0.4.2"
//! helio_owner: "tbd"
//! ---
//! Inverter plugins.

pub mod deye;
pub mod deye_maps;
pub mod eg4;
pub mod eg4_maps;
pub mod powmr;
pub mod powmr_maps;
