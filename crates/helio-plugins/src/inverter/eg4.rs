//! ---
//! helio_section: "05-device-plugins"
//! helio_subsection: "module"
//! helio_type: "source"
//! helio_scope: "code"
//! helio_description: "Device plugin contract, poll workers and concrete drivers."
//! helio_version: "v0.4.2"
//! helio_owner: "tbd"
//! ---
//! EG4 hybrid inverter plugin (Modbus, little-endian word order, split
//! import/export registers).

use std::collections::HashSet;
use std::time::Duration;

use async_trait::async_trait;
use helio_common::config::{InstanceConfig, InverterSystemConfig};
use helio_protocol::WordOrder;
use helio_types::{ReadingValues, StandardKey, Value};

use super::eg4_maps;
use crate::support::{decode_bitfield_alerts, MpptDetector, RawReading};
use crate::modbus_common::{GroupSet, ModbusDriver};
use crate::registry::PluginContext;
use crate::{DeviceCategory, DevicePlugin, ParamDescriptor, ParamKind, Result};

const ALERT_MAPS: &[(&str, &str, &[(u8, &str)])] =
    &[("internal_fault_code", "inverter", eg4_maps::FAULT_BITS)];

pub fn construct(
    instance: &InstanceConfig,
    context: &PluginContext,
) -> Result<Box<dyn DevicePlugin>> {
    Ok(Box::new(Eg4Plugin::new(instance, context)))
}

#[derive(Debug)]
pub struct Eg4Plugin {
    instance: String,
    driver: ModbusDriver,
    system: InverterSystemConfig,
    mppt: MpptDetector,
    warned_keys: HashSet<&'static str>,
}

impl Eg4Plugin {
    fn new(instance: &InstanceConfig, context: &PluginContext) -> Self {
        Self {
            instance: instance.name.clone(),
            driver: ModbusDriver::new(instance, eg4_maps::EG4_REGISTERS, WordOrder::LittleEndian),
            system: context.system.clone(),
            mppt: MpptDetector::new(
                instance.mppt_detection_min_voltage,
                context.system.default_mppt_count.max(1),
            ),
            warned_keys: HashSet::new(),
        }
    }

    fn standardize(&mut self, mut raw: RawReading) -> ReadingValues {
        let mut values = ReadingValues::new();

        if let Some(code) = raw.take_i64("operation_mode") {
            values.insert(StandardKey::OperationalInverterStatusCode, Value::Int(code));
            values.insert(
                StandardKey::OperationalInverterStatusText,
                Value::from(eg4_maps::operation_mode_text(code)),
            );
        }

        let voltages = [
            raw.take_f64("pv1_voltage"),
            raw.take_f64("pv2_voltage"),
            raw.take_f64("pv3_voltage"),
        ];
        self.mppt.observe(&voltages);
        let powers = [
            raw.take_f64("pv1_power"),
            raw.take_f64("pv2_power"),
            raw.take_f64("pv3_power"),
        ];
        for (index, (voltage, power)) in voltages.iter().zip(powers.iter()).enumerate() {
            let (vk, pk) = match index {
                0 => (StandardKey::PvMppt1VoltageVolts, StandardKey::PvMppt1PowerWatts),
                1 => (StandardKey::PvMppt2VoltageVolts, StandardKey::PvMppt2PowerWatts),
                _ => (StandardKey::PvMppt3VoltageVolts, StandardKey::PvMppt3PowerWatts),
            };
            if let Some(v) = voltage {
                values.insert(vk, Value::Number(*v));
            }
            if let Some(p) = power {
                values.insert(pk, Value::Number(*p));
            }
        }
        let pv_total: f64 = powers.iter().flatten().sum();
        if powers.iter().any(Option::is_some) {
            values.insert(StandardKey::PvTotalDcPowerWatts, Value::Number(pv_total));
        }

        // Battery power arrives as separate charge/discharge magnitudes;
        // canonical sign is positive when discharging.
        let charge = raw.take_f64("battery_charge_power");
        let discharge = raw.take_f64("battery_discharge_power");
        if charge.is_some() || discharge.is_some() {
            let power = discharge.unwrap_or(0.0) - charge.unwrap_or(0.0);
            values.insert(StandardKey::BatteryPowerWatts, Value::Number(power));
            let status = if power > 10.0 {
                "Discharging"
            } else if power < -10.0 {
                "Charging"
            } else {
                "Idle"
            };
            values.insert(StandardKey::BatteryStatusText, Value::from(status));
        }
        if let Some(v) = raw.take_f64("battery_voltage") {
            values.insert(StandardKey::BatteryVoltageVolts, Value::Number(v));
        }
        if let Some(packed) = raw.take_i64("battery_soc_soh") {
            // Low byte SOC, high byte SOH.
            values.insert(
                StandardKey::BatteryStateOfChargePercent,
                Value::Number((packed & 0xFF) as f64),
            );
            let soh = (packed >> 8) & 0xFF;
            if soh > 0 {
                values.insert(StandardKey::BatteryStateOfHealthPercent, Value::Number(soh as f64));
            }
        }
        if let Some(t) = raw.take_f64("battery_temperature") {
            values.insert(StandardKey::BatteryTemperatureCelsius, Value::Number(t));
        }
        if let Some(t) = raw.take_f64("radiator_temp_1") {
            values.insert(StandardKey::OperationalInverterTemperatureCelsius, Value::Number(t));
        }

        if let Some(power) = raw.take_f64("inverter_power") {
            values.insert(StandardKey::AcPowerWatts, Value::Number(power));
        }
        // Split import/export registers; canonical sign is positive for
        // export.
        let to_grid = raw.take_f64("power_to_grid");
        let to_user = raw.take_f64("power_to_user");
        if to_grid.is_some() || to_user.is_some() {
            let grid = to_grid.unwrap_or(0.0) - to_user.unwrap_or(0.0);
            values.insert(StandardKey::GridTotalActivePowerWatts, Value::Number(grid));
        }
        if let Some(freq) = raw.take_f64("grid_frequency") {
            values.insert(StandardKey::GridFrequencyHz, Value::Number(freq));
        }
        for (raw_key, std_key) in [
            ("grid_r_voltage", StandardKey::GridL1VoltageVolts),
            ("grid_s_voltage", StandardKey::GridL2VoltageVolts),
            ("grid_t_voltage", StandardKey::GridL3VoltageVolts),
            ("eps_voltage", StandardKey::EpsL1VoltageVolts),
        ] {
            if let Some(v) = raw.take_f64(raw_key) {
                values.insert(std_key, Value::Number(v));
            }
        }
        if let Some(current) = raw.take_f64("inverter_current") {
            values.insert(StandardKey::GridL1CurrentAmps, Value::Number(current));
        }
        if let Some(power) = raw.take_f64("eps_power") {
            values.insert(StandardKey::EpsTotalActivePowerWatts, Value::Number(power));
        }

        // Daily PV yield is the sum of the per-string counters.
        let pv_daily: Vec<f64> = [
            raw.take_f64("daily_pv1_energy"),
            raw.take_f64("daily_pv2_energy"),
            raw.take_f64("daily_pv3_energy"),
        ]
        .into_iter()
        .flatten()
        .collect();
        if !pv_daily.is_empty() {
            values.insert(
                StandardKey::EnergyPvDailyKwh,
                Value::Number(pv_daily.iter().sum()),
            );
        }
        for (raw_key, std_key) in [
            ("daily_battery_charge", StandardKey::EnergyBatteryDailyChargeKwh),
            ("daily_battery_discharge", StandardKey::EnergyBatteryDailyDischargeKwh),
            ("daily_energy_to_grid", StandardKey::EnergyGridDailyExportKwh),
            ("daily_energy_to_user", StandardKey::EnergyGridDailyImportKwh),
            ("total_pv_energy", StandardKey::EnergyPvTotalLifetimeKwh),
        ] {
            if let Some(v) = raw.take_f64(raw_key) {
                values.insert(std_key, Value::Number(v));
            }
        }
        let _ = raw.take_f64("daily_inverter_energy");
        let _ = raw.take_f64("ac_charge_power");

        if let Some(word) = raw.take_u16("internal_fault_code") {
            if word != 0 {
                let (codes, alerts) = decode_bitfield_alerts(&[("internal_fault_code", word)], ALERT_MAPS);
                let messages: Vec<String> = alerts.values().flatten().cloned().collect();
                values.insert(
                    StandardKey::OperationalActiveFaultCodesList,
                    Value::NumList(codes.iter().map(|c| *c as f64).collect()),
                );
                values.insert(
                    StandardKey::OperationalActiveFaultMessagesList,
                    Value::TextList(messages),
                );
                values.insert(StandardKey::OperationalCategorizedAlertsDict, Value::Alerts(alerts));
            }
        }

        raw.finish(&self.instance, &mut self.warned_keys);
        values
    }
}

#[async_trait]
impl DevicePlugin for Eg4Plugin {
    fn name(&self) -> &'static str {
        "eg4"
    }

    fn pretty_name(&self) -> &'static str {
        "EG4 Hybrid Inverter"
    }

    fn category(&self) -> DeviceCategory {
        DeviceCategory::Inverter
    }

    fn configurable_params(&self) -> Vec<ParamDescriptor> {
        vec![
            ParamDescriptor {
                key: "connection_type",
                description: "tcp or serial",
                kind: ParamKind::Choice(&["tcp", "serial"]),
                required: true,
                default: Some("tcp"),
            },
            ParamDescriptor {
                key: "tcp_host",
                description: "Inverter dongle address",
                kind: ParamKind::Text,
                required: false,
                default: None,
            },
            ParamDescriptor {
                key: "tcp_port",
                description: "Modbus TCP port",
                kind: ParamKind::Integer,
                required: false,
                default: Some("502"),
            },
            ParamDescriptor {
                key: "slave_address",
                description: "Modbus unit id",
                kind: ParamKind::Integer,
                required: false,
                default: Some("1"),
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
        values.insert(StandardKey::StaticDeviceCategory, Value::from("inverter"));
        values.insert(StandardKey::StaticInverterManufacturer, Value::from("EG4"));
        values.insert(
            StandardKey::StaticInverterModelName,
            Value::from("EG4 Hybrid (V58 protocol)"),
        );
        if let Some(serial) = raw.take_text("serial_number") {
            if !serial.is_empty() {
                values.insert(StandardKey::StaticInverterSerialNumber, Value::Text(serial));
            }
        }
        if let Some(fw) = raw.take_i64("firmware_version") {
            values.insert(
                StandardKey::StaticInverterFirmwareVersion,
                Value::Text(format!("{fw:#06x}")),
            );
        }
        values.insert(StandardKey::StaticNumberOfPhasesAc, Value::Int(1));
        values.insert(
            StandardKey::StaticNumberOfMppts,
            Value::Int(self.mppt.count() as i64),
        );
        if self.system.inverter_max_ac_power_w > 0.0 {
            values.insert(
                StandardKey::StaticRatedPowerAcWatts,
                Value::Number(self.system.inverter_max_ac_power_w),
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

#[cfg(test)]
mod tests {
    use super::*;
    use helio_protocol::RawValue;
    use std::collections::HashMap;

    fn plugin() -> Eg4Plugin {
        let config: helio_common::AppConfig =
            "[general]\nplugin_instances = inv\n[plugin_inv]\nplugin_type = inverter.eg4\n"
                .parse()
                .unwrap();
        Eg4Plugin::new(&config.instances["inv"], &PluginContext::default())
    }

    fn raw(entries: &[(&'static str, RawValue)]) -> RawReading {
        let map: HashMap<&'static str, RawValue> = entries.iter().cloned().collect();
        RawReading::new(map)
    }

    #[test]
    fn split_grid_registers_become_signed_power() {
        let mut plugin = plugin();
        let values = plugin.standardize(raw(&[
            ("power_to_grid", RawValue::Int(0)),
            ("power_to_user", RawValue::Int(450)),
        ]));
        assert_eq!(
            values.get(&StandardKey::GridTotalActivePowerWatts),
            Some(&Value::Number(-450.0))
        );
    }

    #[test]
    fn split_battery_registers_become_signed_power() {
        let mut plugin = plugin();
        let values = plugin.standardize(raw(&[
            ("battery_charge_power", RawValue::Int(1200)),
            ("battery_discharge_power", RawValue::Int(0)),
        ]));
        assert_eq!(
            values.get(&StandardKey::BatteryPowerWatts),
            Some(&Value::Number(-1200.0))
        );
        assert_eq!(
            values.get(&StandardKey::BatteryStatusText),
            Some(&Value::from("Charging"))
        );
    }

    #[test]
    fn packed_soc_soh_word_splits() {
        let mut plugin = plugin();
        let values = plugin.standardize(raw(&[("battery_soc_soh", RawValue::Int(0x6350))]));
        assert_eq!(
            values.get(&StandardKey::BatteryStateOfChargePercent),
            Some(&Value::Number(80.0))
        );
        assert_eq!(
            values.get(&StandardKey::BatteryStateOfHealthPercent),
            Some(&Value::Number(99.0))
        );
    }

    #[test]
    fn per_string_daily_energy_sums() {
        let mut plugin = plugin();
        let values = plugin.standardize(raw(&[
            ("daily_pv1_energy", RawValue::Float(3.2)),
            ("daily_pv2_energy", RawValue::Float(2.8)),
        ]));
        let daily = values
            .get(&StandardKey::EnergyPvDailyKwh)
            .and_then(Value::as_f64)
            .unwrap();
        assert!((daily - 6.0).abs() < 1e-9);
    }
}
