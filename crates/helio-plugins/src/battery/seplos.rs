//! ---
//! helio_section: "05-device-plugins"
//! helio_subsection: "module"
//! helio_type: "source"
//! helio_scope: "code"
//! helio_description: "Device plugin contract, poll workers and concrete drivers."
//! helio_version: "v0.4.2"
//! helio_owner: "tbd"
//! ---
//! Seplos V3 BMS plugin (Modbus RTU/TCP).

use std::collections::HashSet;
use std::time::Duration;

use async_trait::async_trait;
use helio_common::config::InstanceConfig;
use helio_protocol::WordOrder;
use helio_types::{ReadingValues, StandardKey, Value};

use super::seplos_maps::{
    self, ALARM_WORD_1_BITS, ALARM_WORD_2_BITS, FET_CHARGE_ON_BIT, FET_DISCHARGE_ON_BIT,
    KELVIN_OFFSET,
};
use crate::support::{decode_bitfield_alerts, RawReading};
use crate::modbus_common::{GroupSet, ModbusDriver};
use crate::registry::PluginContext;
use crate::{DeviceCategory, DevicePlugin, ParamDescriptor, ParamKind, Result};

const ALERT_MAPS: &[(&str, &str, &[(u8, &str)])] = &[
    ("alarm_word_1", "bms", ALARM_WORD_1_BITS),
    ("alarm_word_2", "bms", ALARM_WORD_2_BITS),
];

const CELL_KEYS: &[&str] = &[
    "cell_01_voltage",
    "cell_02_voltage",
    "cell_03_voltage",
    "cell_04_voltage",
    "cell_05_voltage",
    "cell_06_voltage",
    "cell_07_voltage",
    "cell_08_voltage",
    "cell_09_voltage",
    "cell_10_voltage",
    "cell_11_voltage",
    "cell_12_voltage",
    "cell_13_voltage",
    "cell_14_voltage",
    "cell_15_voltage",
    "cell_16_voltage",
];

const TEMP_KEYS: &[&str] = &["temp_1", "temp_2", "temp_3", "temp_4"];

pub fn construct(
    instance: &InstanceConfig,
    _context: &PluginContext,
) -> Result<Box<dyn DevicePlugin>> {
    Ok(Box::new(SeplosPlugin::new(instance)))
}

#[derive(Debug)]
pub struct SeplosPlugin {
    instance: String,
    driver: ModbusDriver,
    warned_keys: HashSet<&'static str>,
}

impl SeplosPlugin {
    fn new(instance: &InstanceConfig) -> Self {
        Self {
            instance: instance.name.clone(),
            driver: ModbusDriver::new(instance, seplos_maps::SEPLOS_REGISTERS, WordOrder::BigEndian),
            warned_keys: HashSet::new(),
        }
    }

    fn standardize(&mut self, mut raw: RawReading) -> ReadingValues {
        let mut values = ReadingValues::new();

        let voltage = raw.take_f64("pack_voltage");
        // Pack current is positive while charging; canonical battery power
        // is positive while discharging.
        let current = raw.take_f64("pack_current");
        if let Some(v) = voltage {
            values.insert(StandardKey::BatteryVoltageVolts, Value::Number(v));
        }
        if let Some(c) = current {
            values.insert(StandardKey::BatteryCurrentAmps, Value::Number(c.abs()));
        }
        if let (Some(v), Some(c)) = (voltage, current) {
            let power = -(v * c);
            values.insert(StandardKey::BatteryPowerWatts, Value::Number(power));
            values.insert(
                StandardKey::BatteryStatusText,
                Value::from(if power > 10.0 {
                    "Discharging"
                } else if power < -10.0 {
                    "Charging"
                } else {
                    "Idle"
                }),
            );
        }
        if let Some(soc) = raw.take_f64("soc") {
            values.insert(StandardKey::BatteryStateOfChargePercent, Value::Number(soc));
        }
        if let Some(soh) = raw.take_f64("soh") {
            values.insert(StandardKey::BatteryStateOfHealthPercent, Value::Number(soh));
        }
        if let Some(cycles) = raw.take_f64("cycle_count") {
            values.insert(StandardKey::BatteryCyclesCount, Value::Int(cycles as i64));
        }
        if let Some(ah) = raw.take_f64("remaining_capacity") {
            values.insert(StandardKey::BmsRemainingCapacityAh, Value::Number(ah));
        }
        if let Some(ah) = raw.take_f64("total_capacity") {
            values.insert(StandardKey::BmsFullCapacityAh, Value::Number(ah));
        }

        let cells: Vec<f64> = CELL_KEYS
            .iter()
            .filter_map(|key| raw.take_f64(key))
            .filter(|v| *v > 0.0)
            .collect();
        if !cells.is_empty() {
            let min = cells.iter().copied().fold(f64::INFINITY, f64::min);
            let max = cells.iter().copied().fold(f64::NEG_INFINITY, f64::max);
            let avg = cells.iter().sum::<f64>() / cells.len() as f64;
            let min_index = cells.iter().position(|v| *v == min).unwrap_or(0);
            let max_index = cells.iter().position(|v| *v == max).unwrap_or(0);
            values.insert(StandardKey::BmsCellCount, Value::Int(cells.len() as i64));
            values.insert(StandardKey::BmsCellVoltageMinVolts, Value::Number(min));
            values.insert(StandardKey::BmsCellVoltageMaxVolts, Value::Number(max));
            values.insert(
                StandardKey::BmsCellVoltageAverageVolts,
                Value::Number((avg * 1000.0).round() / 1000.0),
            );
            values.insert(
                StandardKey::BmsCellVoltageDeltaVolts,
                Value::Number(((max - min) * 1000.0).round() / 1000.0),
            );
            values.insert(
                StandardKey::BmsCellWithMinVoltageNumber,
                Value::Int(min_index as i64 + 1),
            );
            values.insert(
                StandardKey::BmsCellWithMaxVoltageNumber,
                Value::Int(max_index as i64 + 1),
            );
            values.insert(StandardKey::BmsCellVoltagesList, Value::NumList(cells));
        }
        // Pack-level stat registers duplicate what the cell list derives.
        for key in ["avg_cell_voltage", "max_cell_voltage", "min_cell_voltage"] {
            let _ = raw.take_f64(key);
        }

        let temps: Vec<f64> = TEMP_KEYS
            .iter()
            .filter_map(|key| raw.take_f64(key))
            .filter(|deci_k| *deci_k > 0.0)
            .map(|deci_k| ((deci_k - KELVIN_OFFSET) * 10.0).round() / 10.0)
            .collect();
        if !temps.is_empty() {
            let min = temps.iter().copied().fold(f64::INFINITY, f64::min);
            let max = temps.iter().copied().fold(f64::NEG_INFINITY, f64::max);
            values.insert(StandardKey::BmsTempMinCelsius, Value::Number(min));
            values.insert(StandardKey::BmsTempMaxCelsius, Value::Number(max));
            values.insert(StandardKey::BatteryTemperatureCelsius, Value::Number(max));
            values.insert(StandardKey::BmsCellTemperaturesList, Value::NumList(temps));
        }
        for key in ["max_cell_temp", "min_cell_temp"] {
            let _ = raw.take_f64(key);
        }

        if let Some(fets) = raw.take_u16("fet_status") {
            values.insert(
                StandardKey::BmsChargeFetOn,
                Value::Bool(fets & FET_CHARGE_ON_BIT != 0),
            );
            values.insert(
                StandardKey::BmsDischargeFetOn,
                Value::Bool(fets & FET_DISCHARGE_ON_BIT != 0),
            );
        }

        let mut alarm_words = Vec::new();
        for key in ["alarm_word_1", "alarm_word_2"] {
            if let Some(word) = raw.take_u16(key) {
                if word != 0 {
                    alarm_words.push((key, word));
                }
            }
        }
        if alarm_words.is_empty() {
            values.insert(StandardKey::BmsFaultSummaryText, Value::from("OK"));
        } else {
            let (_, alerts) = decode_bitfield_alerts(&alarm_words, ALERT_MAPS);
            let labels: Vec<String> = alerts.values().flatten().cloned().collect();
            values.insert(StandardKey::BmsFaultSummaryText, Value::Text(labels.join(", ")));
            values.insert(StandardKey::BmsActiveAlarmsList, Value::TextList(labels));
            values.insert(StandardKey::OperationalCategorizedAlertsDict, Value::Alerts(alerts));
        }

        raw.finish(&self.instance, &mut self.warned_keys);
        values
    }
}

#[async_trait]
impl DevicePlugin for SeplosPlugin {
    fn name(&self) -> &'static str {
        "seplos"
    }

    fn pretty_name(&self) -> &'static str {
        "Seplos V3 BMS"
    }

    fn category(&self) -> DeviceCategory {
        DeviceCategory::Bms
    }

    fn configurable_params(&self) -> Vec<ParamDescriptor> {
        vec![
            ParamDescriptor {
                key: "connection_type",
                description: "tcp or serial",
                kind: ParamKind::Choice(&["tcp", "serial"]),
                required: true,
                default: Some("serial"),
            },
            ParamDescriptor {
                key: "serial_port",
                description: "RS485 adapter device path",
                kind: ParamKind::Text,
                required: false,
                default: Some("/dev/ttyUSB0"),
            },
            ParamDescriptor {
                key: "baud_rate",
                description: "Serial speed",
                kind: ParamKind::Integer,
                required: false,
                default: Some("19200"),
            },
            ParamDescriptor {
                key: "slave_address",
                description: "Modbus unit id (pack 1 answers as 0)",
                kind: ParamKind::Integer,
                required: false,
                default: Some("0"),
            },
        ]
    }

    async fn connect(&mut self, deadline: Duration) -> Result<bool> {
        self.driver.connect(deadline).await
    }

    async fn disconnect(&mut self) {
        self.driver.disconnect().await;
    }

    fn is_connected(&self) -> bool {
        self.driver.is_connected()
    }

    async fn read_static(&mut self) -> Result<ReadingValues> {
        let mut raw = RawReading::new(self.driver.read_groups(GroupSet::Static).await?);
        let mut values = ReadingValues::new();
        values.insert(StandardKey::StaticDeviceCategory, Value::from("bms"));
        values.insert(StandardKey::StaticBatteryManufacturer, Value::from("Seplos"));
        if let Some(model) = raw.take_text("pack_model") {
            if !model.is_empty() {
                values.insert(StandardKey::StaticBatteryModelName, Value::Text(model));
            }
        }
        if let Some(serial) = raw.take_text("pack_serial") {
            if !serial.is_empty() {
                values.insert(StandardKey::StaticBatterySerialNumber, Value::Text(serial));
            }
        }
        if let Some(version) = raw.take_i64("software_version") {
            values.insert(
                StandardKey::StaticBatteryFirmwareVersion,
                Value::Text(format!("{version:#06x}")),
            );
        }
        raw.finish(&self.instance, &mut self.warned_keys);
        Ok(values)
    }

    async fn read_dynamic(&mut self) -> Result<ReadingValues> {
        let raw = RawReading::new(self.driver.read_groups(GroupSet::Dynamic).await?);
        Ok(self.standardize(raw))
    }
}
