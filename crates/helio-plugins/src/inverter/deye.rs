//! ---
//! helio_section: "05-device-plugins"
//! helio_subsection: "module"
//! helio_type: "source"
//! helio_scope: "code"
//! helio_description: "Device plugin contract, poll workers and concrete drivers."
//! helio_version: "v0.4.2"
//! helio_owner: "tbd"
//! ---
//! Deye / SunSynk hybrid inverter plugin (Modbus).

use std::collections::HashSet;
use std::time::Duration;

use async_trait::async_trait;
use helio_common::config::{InstanceConfig, InverterSystemConfig};
use helio_protocol::WordOrder;
use helio_types::{ReadingValues, StandardKey, Value};
use tracing::debug;

use super::deye_maps;
use crate::support::{decode_bitfield_alerts, MpptDetector, RawReading};
use crate::modbus_common::{GroupSet, ModbusDriver};
use crate::registry::PluginContext;
use crate::{
    DeviceCategory, DevicePlugin, ParamDescriptor, ParamKind, PluginError, Result,
};

const ALERT_MAPS: &[(&str, &str, &[(u8, &str)])] = &[
    ("fault_bits_1", "inverter", deye_maps::FAULT_BITS_1),
    ("warning_bits_1", "inverter", deye_maps::WARNING_BITS_1),
];

/// Model series selected by `deye_model_series`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DeyeSeries {
    ModernHybrid,
    LegacyHybrid,
    ThreePhase,
}

impl DeyeSeries {
    fn parse(raw: &str) -> Result<Self> {
        match raw {
            "modern_hybrid" => Ok(DeyeSeries::ModernHybrid),
            "legacy_hybrid" => Ok(DeyeSeries::LegacyHybrid),
            "three_phase" => Ok(DeyeSeries::ThreePhase),
            other => Err(PluginError::Config(format!(
                "deye_model_series must be modern_hybrid, legacy_hybrid or three_phase, got '{other}'"
            ))),
        }
    }

    fn registers(&self) -> &'static [helio_protocol::RegisterDescriptor] {
        match self {
            DeyeSeries::ModernHybrid => deye_maps::MODERN_HYBRID_REGISTERS,
            DeyeSeries::LegacyHybrid => deye_maps::LEGACY_HYBRID_REGISTERS,
            DeyeSeries::ThreePhase => deye_maps::THREE_PHASE_REGISTERS,
        }
    }

    fn word_order(&self) -> WordOrder {
        // The modern firmware puts the low word first in 32-bit counters.
        match self {
            DeyeSeries::ModernHybrid => WordOrder::LittleEndian,
            _ => WordOrder::BigEndian,
        }
    }

    fn status_text(&self, code: i64) -> &'static str {
        match self {
            DeyeSeries::LegacyHybrid => deye_maps::status_text_legacy(code),
            _ => deye_maps::status_text_modern(code),
        }
    }

    /// The modern radiator register reports tenths of a degree offset by
    /// one hundred degrees.
    fn radiator_offset(&self) -> f64 {
        match self {
            DeyeSeries::ModernHybrid => -100.0,
            _ => 0.0,
        }
    }

    fn model_label(&self) -> &'static str {
        match self {
            DeyeSeries::ModernHybrid => "Deye/SunSynk Hybrid (modern)",
            DeyeSeries::LegacyHybrid => "Deye Hybrid (legacy)",
            DeyeSeries::ThreePhase => "Deye Three-Phase Hybrid",
        }
    }

    fn phases(&self) -> i64 {
        match self {
            DeyeSeries::ThreePhase => 3,
            _ => 1,
        }
    }
}

/// Build a Deye plugin from its instance section.
pub fn construct(
    instance: &InstanceConfig,
    context: &PluginContext,
) -> Result<Box<dyn DevicePlugin>> {
    let series_raw = instance
        .raw
        .get("deye_model_series")
        .map(String::as_str)
        .unwrap_or("modern_hybrid");
    let series = DeyeSeries::parse(series_raw)?;
    Ok(Box::new(DeyePlugin::new(instance, context, series)))
}

#[derive(Debug)]
pub struct DeyePlugin {
    instance: String,
    driver: ModbusDriver,
    series: DeyeSeries,
    system: InverterSystemConfig,
    mppt: MpptDetector,
    warned_keys: HashSet<&'static str>,
}

impl DeyePlugin {
    fn new(instance: &InstanceConfig, context: &PluginContext, series: DeyeSeries) -> Self {
        Self {
            instance: instance.name.clone(),
            driver: ModbusDriver::new(instance, series.registers(), series.word_order()),
            series,
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

        let status_code = raw.take_i64("inverter_status_code");
        if let Some(code) = status_code {
            values.insert(StandardKey::OperationalInverterStatusCode, Value::Int(code));
            values.insert(
                StandardKey::OperationalInverterStatusText,
                Value::from(self.series.status_text(code)),
            );
        }

        // PV channels: power registers where the series has them, V x I
        // otherwise.
        let mut pv_total = 0.0;
        let mut any_pv = false;
        let mppt_voltages: Vec<Option<f64>> = (1..=4)
            .map(|i| raw.peek_f64(pv_key(i, "voltage")))
            .collect();
        self.mppt.observe(&mppt_voltages);

        for channel in 1..=4usize {
            let voltage = raw.take_f64(pv_key(channel, "voltage"));
            let current = raw.take_f64(pv_key(channel, "current"));
            let power = raw
                .take_f64(pv_key(channel, "power"))
                .or_else(|| match (voltage, current) {
                    (Some(v), Some(c)) => Some((v * c * 100.0).round() / 100.0),
                    _ => None,
                });
            if let (Some(vk), Some(v)) = (mppt_voltage_key(channel), voltage) {
                values.insert(vk, Value::Number(v));
            }
            if let (Some(ck), Some(c)) = (mppt_current_key(channel), current) {
                values.insert(ck, Value::Number(c));
            }
            if let (Some(pk), Some(p)) = (mppt_power_key(channel), power) {
                values.insert(pk, Value::Number(p));
                pv_total += p;
                any_pv = true;
            }
        }
        if any_pv {
            values.insert(StandardKey::PvTotalDcPowerWatts, Value::Number(pv_total));
        }

        if let Some(power) = raw.take_f64("inverter_power") {
            values.insert(StandardKey::AcPowerWatts, Value::Number(power));
        }
        if let Some(load) = raw.take_f64("load_power") {
            values.insert(StandardKey::LoadTotalPowerWatts, Value::Number(load));
        }
        // Raw grid power is positive when importing; canonical sign is
        // positive for export.
        if let Some(grid) = raw.take_f64("grid_power") {
            values.insert(StandardKey::GridTotalActivePowerWatts, Value::Number(-grid));
        }
        if let Some(freq) = raw.take_f64("grid_frequency") {
            values.insert(StandardKey::GridFrequencyHz, Value::Number(freq));
        }
        for (raw_key, std_key) in [
            ("grid_voltage", StandardKey::GridL1VoltageVolts),
            ("inverter_voltage", StandardKey::GridL1VoltageVolts),
            ("grid_l1_voltage", StandardKey::GridL1VoltageVolts),
            ("grid_l2_voltage", StandardKey::GridL2VoltageVolts),
            ("grid_l3_voltage", StandardKey::GridL3VoltageVolts),
        ] {
            if let Some(v) = raw.take_f64(raw_key) {
                values.insert(std_key, Value::Number(v));
            }
        }
        if let Some(current) = raw.take_f64("inverter_current") {
            values.insert(StandardKey::GridL1CurrentAmps, Value::Number(current));
        }

        // Battery: positive register values mean discharging, which is
        // also the canonical convention.
        if let Some(power) = raw.take_f64("battery_power") {
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
        if let Some(c) = raw.take_f64("battery_current") {
            values.insert(StandardKey::BatteryCurrentAmps, Value::Number(c.abs()));
        }
        if let Some(soc) = raw.take_f64("battery_soc") {
            values.insert(StandardKey::BatteryStateOfChargePercent, Value::Number(soc));
        }
        if let Some(t) = raw.take_f64("battery_temperature") {
            values.insert(StandardKey::BatteryTemperatureCelsius, Value::Number(t));
        }
        if let Some(t) = raw.take_f64("radiator_temp") {
            values.insert(
                StandardKey::OperationalInverterTemperatureCelsius,
                Value::Number(t + self.series.radiator_offset()),
            );
        }

        for (raw_key, std_key) in [
            ("day_energy", StandardKey::EnergyPvDailyKwh),
            ("total_energy", StandardKey::EnergyPvTotalLifetimeKwh),
            ("grid_daily_buy", StandardKey::EnergyGridDailyImportKwh),
            ("grid_daily_sell", StandardKey::EnergyGridDailyExportKwh),
            ("battery_daily_charge", StandardKey::EnergyBatteryDailyChargeKwh),
            ("battery_daily_discharge", StandardKey::EnergyBatteryDailyDischargeKwh),
        ] {
            if let Some(v) = raw.take_f64(raw_key) {
                values.insert(std_key, Value::Number(v));
            }
        }

        let mut bitfields = Vec::new();
        for key in ["fault_bits_1", "warning_bits_1"] {
            if let Some(word) = raw.take_u16(key) {
                if word != 0 {
                    bitfields.push((key, word));
                }
            }
        }
        let (codes, alerts) = decode_bitfield_alerts(&bitfields, ALERT_MAPS);
        if !codes.is_empty() {
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

        raw.finish(&self.instance, &mut self.warned_keys);
        values
    }
}

fn pv_key(channel: usize, suffix: &str) -> &'static str {
    match (channel, suffix) {
        (1, "voltage") => "pv1_voltage",
        (1, "current") => "pv1_current",
        (1, "power") => "pv1_power",
        (2, "voltage") => "pv2_voltage",
        (2, "current") => "pv2_current",
        (2, "power") => "pv2_power",
        (3, "voltage") => "pv3_voltage",
        (3, "current") => "pv3_current",
        (3, "power") => "pv3_power",
        (4, "voltage") => "pv4_voltage",
        (4, "current") => "pv4_current",
        _ => "pv4_power",
    }
}

fn mppt_voltage_key(channel: usize) -> Option<StandardKey> {
    match channel {
        1 => Some(StandardKey::PvMppt1VoltageVolts),
        2 => Some(StandardKey::PvMppt2VoltageVolts),
        3 => Some(StandardKey::PvMppt3VoltageVolts),
        4 => Some(StandardKey::PvMppt4VoltageVolts),
        _ => None,
    }
}

fn mppt_current_key(channel: usize) -> Option<StandardKey> {
    match channel {
        1 => Some(StandardKey::PvMppt1CurrentAmps),
        2 => Some(StandardKey::PvMppt2CurrentAmps),
        3 => Some(StandardKey::PvMppt3CurrentAmps),
        4 => Some(StandardKey::PvMppt4CurrentAmps),
        _ => None,
    }
}

fn mppt_power_key(channel: usize) -> Option<StandardKey> {
    match channel {
        1 => Some(StandardKey::PvMppt1PowerWatts),
        2 => Some(StandardKey::PvMppt2PowerWatts),
        3 => Some(StandardKey::PvMppt3PowerWatts),
        4 => Some(StandardKey::PvMppt4PowerWatts),
        _ => None,
    }
}

#[async_trait]
impl DevicePlugin for DeyePlugin {
    fn name(&self) -> &'static str {
        "deye"
    }

    fn pretty_name(&self) -> &'static str {
        "Deye / SunSynk Hybrid Inverter"
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
                description: "Inverter datalogger address",
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
            ParamDescriptor {
                key: "deye_model_series",
                description: "Register layout of the model family",
                kind: ParamKind::Choice(&["modern_hybrid", "legacy_hybrid", "three_phase"]),
                required: false,
                default: Some("modern_hybrid"),
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
        values.insert(StandardKey::StaticInverterManufacturer, Value::from("Deye"));
        values.insert(
            StandardKey::StaticInverterModelName,
            Value::from(self.series.model_label()),
        );
        if let Some(serial) = raw.take_text("device_serial") {
            if !serial.is_empty() {
                values.insert(StandardKey::StaticInverterSerialNumber, Value::Text(serial));
            }
        }
        if let Some(code) = raw.take_i64("bms_protocol_code") {
            if let Some(name) = deye_maps::bms_protocol_name(code) {
                values.insert(StandardKey::StaticBatteryModelName, Value::from(name));
            }
        }
        values.insert(
            StandardKey::StaticNumberOfPhasesAc,
            Value::Int(self.series.phases()),
        );
        if self.system.inverter_max_ac_power_w > 0.0 {
            values.insert(
                StandardKey::StaticRatedPowerAcWatts,
                Value::Number(self.system.inverter_max_ac_power_w),
            );
        }

        // One dynamic sweep feeds the MPPT heuristic before it settles.
        if let Ok(dynamic) = self.driver.read_groups(GroupSet::Dynamic).await {
            let probe = RawReading::new(dynamic);
            let voltages: Vec<Option<f64>> =
                (1..=4).map(|i| probe.peek_f64(pv_key(i, "voltage"))).collect();
            self.mppt.observe(&voltages);
        }
        values.insert(
            StandardKey::StaticNumberOfMppts,
            Value::Int(self.mppt.count() as i64),
        );
        debug!(instance = %self.instance, mppts = self.mppt.count(), "static data assembled");

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

    fn plugin() -> DeyePlugin {
        let config: helio_common::AppConfig =
            "[general]\nplugin_instances = inv\n[plugin_inv]\nplugin_type = inverter.deye\n"
                .parse()
                .unwrap();
        DeyePlugin::new(
            &config.instances["inv"],
            &PluginContext::default(),
            DeyeSeries::ModernHybrid,
        )
    }

    fn raw(entries: &[(&'static str, RawValue)]) -> RawReading {
        let map: HashMap<&'static str, RawValue> = entries.iter().cloned().collect();
        RawReading::new(map)
    }

    #[test]
    fn standardize_maps_core_flows() {
        let mut plugin = plugin();
        let values = plugin.standardize(raw(&[
            ("inverter_status_code", RawValue::Int(2)),
            ("pv1_voltage", RawValue::Float(240.0)),
            ("pv1_current", RawValue::Float(5.0)),
            ("inverter_power", RawValue::Int(1100)),
            ("grid_power", RawValue::Int(300)),
            ("battery_power", RawValue::Int(-800)),
            ("battery_soc", RawValue::Int(77)),
            ("day_energy", RawValue::Float(6.4)),
        ]));

        assert_eq!(
            values.get(&StandardKey::OperationalInverterStatusText),
            Some(&Value::from("Generating"))
        );
        assert_eq!(
            values.get(&StandardKey::PvMppt1PowerWatts),
            Some(&Value::Number(1200.0))
        );
        assert_eq!(
            values.get(&StandardKey::PvTotalDcPowerWatts),
            Some(&Value::Number(1200.0))
        );
        // Import 300 W becomes canonical -300 W.
        assert_eq!(
            values.get(&StandardKey::GridTotalActivePowerWatts),
            Some(&Value::Number(-300.0))
        );
        assert_eq!(
            values.get(&StandardKey::BatteryStatusText),
            Some(&Value::from("Charging"))
        );
        assert_eq!(
            values.get(&StandardKey::EnergyPvDailyKwh),
            Some(&Value::Number(6.4))
        );
    }

    #[test]
    fn fault_bits_become_categorized_alerts() {
        let mut plugin = plugin();
        let values = plugin.standardize(raw(&[("fault_bits_1", RawValue::Int(1 << 3))]));
        let alerts = values
            .get(&StandardKey::OperationalCategorizedAlertsDict)
            .and_then(Value::as_alerts)
            .unwrap();
        assert_eq!(alerts["inverter"], vec!["No AC grid".to_owned()]);
    }

    #[test]
    fn radiator_offset_applies_to_modern_series() {
        let mut plugin = plugin();
        let values = plugin.standardize(raw(&[("radiator_temp", RawValue::Float(148.3))]));
        let temp = values
            .get(&StandardKey::OperationalInverterTemperatureCelsius)
            .and_then(Value::as_f64)
            .unwrap();
        assert!((temp - 48.3).abs() < 1e-9);
    }

    #[test]
    fn unknown_raw_keys_are_dropped() {
        let mut plugin = plugin();
        let values = plugin.standardize(raw(&[("mystery_register", RawValue::Int(1))]));
        assert!(values.is_empty());
        assert!(plugin.warned_keys.contains("mystery_register"));
    }
}
