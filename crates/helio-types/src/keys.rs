//! ---
//! helio_section: "02-data-model"
//! helio_subsection: "module"
//! helio_type: "source"
//! helio_scope: "code"
//! helio_description: "Canonical keys, value variants and message types."
//! helio_version: "v0.4.2"
//! helio_owner: "tbd"
//! ---
use std::fmt;

use serde::{Deserialize, Serialize};

macro_rules! standard_keys {
    ($($variant:ident => $name:literal,)+) => {
        /// The closed, versioned vocabulary of data keys. Plugins translate
        /// their device-specific registers into these before anything else
        /// sees the data.
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
        pub enum StandardKey {
            $($variant,)+
        }

        impl StandardKey {
            /// Wire/display name of the key.
            pub const fn as_str(&self) -> &'static str {
                match self {
                    $(StandardKey::$variant => $name,)+
                }
            }

            /// Look a key up by its wire name. Unknown names yield `None`;
            /// the caller decides whether that is a warning or an error.
            pub fn parse(name: &str) -> Option<Self> {
                match name {
                    $($name => Some(StandardKey::$variant),)+
                    _ => None,
                }
            }

            /// Every key in the vocabulary, for exhaustiveness checks.
            pub const ALL: &'static [StandardKey] = &[$(StandardKey::$variant,)+];
        }
    };
}

standard_keys! {
    // Timestamps and status, populated by the core.
    ServerTimestampMsUtc => "server_timestamp_ms_utc",
    PluginDataTimestampMsUtc => "plugin_data_timestamp_ms_utc",
    CorePluginConnectionStatus => "core_plugin_connection_status",

    // Static identification.
    StaticDeviceCategory => "static_device_category",
    StaticInverterModelName => "static_inverter_model_name",
    StaticInverterSerialNumber => "static_inverter_serial_number",
    StaticInverterFirmwareVersion => "static_inverter_firmware_version",
    StaticInverterManufacturer => "static_inverter_manufacturer",
    StaticRatedPowerAcWatts => "static_rated_power_ac_watts",
    StaticNumberOfMppts => "static_number_of_mppts",
    StaticNumberOfPhasesAc => "static_number_of_phases_ac",
    StaticBatteryModelName => "static_battery_model_name",
    StaticBatteryManufacturer => "static_battery_manufacturer",
    StaticBatterySerialNumber => "static_battery_serial_number",
    StaticBatteryFirmwareVersion => "static_battery_firmware_version",
    StaticBatteryNominalCapacityKwh => "static_battery_nominal_capacity_kwh",

    // Inverter operational status and faults.
    OperationalInverterStatusCode => "operational_inverter_status_code",
    OperationalInverterStatusText => "operational_inverter_status_text",
    OperationalInverterTemperatureCelsius => "operational_inverter_temperature_celsius",
    OperationalActiveFaultCodesList => "operational_active_fault_codes_list",
    OperationalActiveFaultMessagesList => "operational_active_fault_messages_list",
    OperationalCategorizedAlertsDict => "operational_categorized_alerts_dict",
    OperationalBatteryTimeRemainingEstimateText => "operational_battery_time_remaining_estimate_text",

    // PV input.
    PvMppt1VoltageVolts => "pv_mppt1_voltage_volts",
    PvMppt1CurrentAmps => "pv_mppt1_current_amps",
    PvMppt1PowerWatts => "pv_mppt1_power_watts",
    PvMppt2VoltageVolts => "pv_mppt2_voltage_volts",
    PvMppt2CurrentAmps => "pv_mppt2_current_amps",
    PvMppt2PowerWatts => "pv_mppt2_power_watts",
    PvMppt3VoltageVolts => "pv_mppt3_voltage_volts",
    PvMppt3CurrentAmps => "pv_mppt3_current_amps",
    PvMppt3PowerWatts => "pv_mppt3_power_watts",
    PvMppt4VoltageVolts => "pv_mppt4_voltage_volts",
    PvMppt4CurrentAmps => "pv_mppt4_current_amps",
    PvMppt4PowerWatts => "pv_mppt4_power_watts",
    PvTotalDcPowerWatts => "pv_total_dc_power_watts",
    EnergyPvDailyKwh => "energy_pv_daily_kwh",
    EnergyPvTotalLifetimeKwh => "energy_pv_total_lifetime_kwh",

    // Battery system.
    BatteryStateOfChargePercent => "battery_state_of_charge_percent",
    BatteryStateOfHealthPercent => "battery_state_of_health_percent",
    BatteryVoltageVolts => "battery_voltage_volts",
    BatteryCurrentAmps => "battery_current_amps",
    BatteryPowerWatts => "battery_power_watts",
    BatteryTemperatureCelsius => "battery_temperature_celsius",
    BatteryStatusText => "battery_status_text",
    BatteryCyclesCount => "battery_cycles_count",
    EnergyBatteryDailyChargeKwh => "energy_battery_daily_charge_kwh",
    EnergyBatteryDailyDischargeKwh => "energy_battery_daily_discharge_kwh",
    EnergyBatteryTotalChargeKwh => "energy_battery_total_charge_kwh",
    EnergyBatteryTotalDischargeKwh => "energy_battery_total_discharge_kwh",

    // BMS detail.
    BmsCellCount => "bms_cell_count",
    BmsCellVoltageMinVolts => "bms_cell_voltage_min_volts",
    BmsCellVoltageMaxVolts => "bms_cell_voltage_max_volts",
    BmsCellVoltageAverageVolts => "bms_cell_voltage_average_volts",
    BmsCellVoltageDeltaVolts => "bms_cell_voltage_delta_volts",
    BmsCellWithMinVoltageNumber => "bms_cell_with_min_voltage_number",
    BmsCellWithMaxVoltageNumber => "bms_cell_with_max_voltage_number",
    BmsTempMinCelsius => "bms_temp_min_celsius",
    BmsTempMaxCelsius => "bms_temp_max_celsius",
    BmsCellVoltagesList => "bms_cell_voltages_list",
    BmsCellTemperaturesList => "bms_cell_temperatures_list",
    BmsChargeFetOn => "bms_charge_fet_on",
    BmsDischargeFetOn => "bms_discharge_fet_on",
    BmsRemainingCapacityAh => "bms_remaining_capacity_ah",
    BmsFullCapacityAh => "bms_full_capacity_ah",
    BmsChargeCurrentLimitAmps => "bms_charge_current_limit_amps",
    BmsDischargeCurrentLimitAmps => "bms_discharge_current_limit_amps",
    BmsFaultSummaryText => "bms_fault_summary_text",
    BmsActiveAlarmsList => "bms_active_alarms_list",

    // Grid interaction.
    GridL1VoltageVolts => "grid_l1_voltage_volts",
    GridL1CurrentAmps => "grid_l1_current_amps",
    GridL2VoltageVolts => "grid_l2_voltage_volts",
    GridL3VoltageVolts => "grid_l3_voltage_volts",
    GridFrequencyHz => "grid_frequency_hz",
    GridTotalActivePowerWatts => "grid_total_active_power_watts",
    EnergyGridDailyImportKwh => "energy_grid_daily_import_kwh",
    EnergyGridDailyExportKwh => "energy_grid_daily_export_kwh",
    EnergyGridTotalImportKwh => "energy_grid_total_import_kwh",
    EnergyGridTotalExportKwh => "energy_grid_total_export_kwh",

    // Load and inverter AC output.
    LoadTotalPowerWatts => "load_total_power_watts",
    AcPowerWatts => "ac_power_watts",
    EnergyLoadDailyKwh => "energy_load_daily_kwh",
    EnergyLoadTotalKwh => "energy_load_total_kwh",

    // EPS / backup output.
    EpsL1VoltageVolts => "eps_l1_voltage_volts",
    EpsL1CurrentAmps => "eps_l1_current_amps",
    EpsTotalActivePowerWatts => "eps_total_active_power_watts",
}

impl StandardKey {
    /// Daily-energy counters subject to ceilings, spike confirmation and
    /// the midnight reset.
    pub const fn is_daily_energy(&self) -> bool {
        matches!(
            self,
            StandardKey::EnergyPvDailyKwh
                | StandardKey::EnergyBatteryDailyChargeKwh
                | StandardKey::EnergyBatteryDailyDischargeKwh
                | StandardKey::EnergyGridDailyImportKwh
                | StandardKey::EnergyGridDailyExportKwh
                | StandardKey::EnergyLoadDailyKwh
        )
    }

    /// Instantaneous power-flow keys subject to range sanity checks.
    pub const fn is_power(&self) -> bool {
        matches!(
            self,
            StandardKey::PvTotalDcPowerWatts
                | StandardKey::AcPowerWatts
                | StandardKey::BatteryPowerWatts
                | StandardKey::GridTotalActivePowerWatts
                | StandardKey::LoadTotalPowerWatts
        )
    }

    /// Static keys read once per connection.
    pub fn is_static(&self) -> bool {
        self.as_str().starts_with("static_")
    }
}

impl fmt::Display for StandardKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl Serialize for StandardKey {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for StandardKey {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let name = String::deserialize(deserializer)?;
        StandardKey::parse(&name)
            .ok_or_else(|| serde::de::Error::custom(format!("unknown standard key '{name}'")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn names_round_trip() {
        for key in StandardKey::ALL {
            assert_eq!(StandardKey::parse(key.as_str()), Some(*key));
        }
    }

    #[test]
    fn unknown_names_are_rejected() {
        assert_eq!(StandardKey::parse("made_up_key"), None);
    }

    #[test]
    fn daily_energy_set_is_exactly_six() {
        let count = StandardKey::ALL.iter().filter(|k| k.is_daily_energy()).count();
        assert_eq!(count, 6);
    }
}
