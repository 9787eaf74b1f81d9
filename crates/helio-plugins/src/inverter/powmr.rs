//! ---
//! helio_section: "05-device-plugins"
//! helio_subsection: "module"
//! helio_type: "source"
//! helio_scope: "code"
//! helio_description: "Device plugin contract, poll workers and concrete drivers."
//! helio_version: "v0.4.2"
//! helio_owner: "tbd"
//! ---
//! POWMR hybrid inverter plugin using the native inv8851 protocol over
//! RS232 or an RS232-to-TCP converter. The state block arrives as one
//! frame, so reads are atomic by construction.

use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use helio_common::config::{ConnectionKind, InstanceConfig};
use helio_protocol::{Inv8851Client, Inv8851State};
use helio_transport::{ByteTransport, SerialTransport, TcpTransport};
use helio_types::{ReadingValues, StandardKey, Value};

use super::powmr_maps;
use crate::registry::PluginContext;
use crate::{DeviceCategory, DevicePlugin, ParamDescriptor, ParamKind, PluginError, Result};

pub fn construct(
    instance: &InstanceConfig,
    _context: &PluginContext,
) -> Result<Box<dyn DevicePlugin>> {
    let version = match instance
        .raw
        .get("powmr_protocol_version")
        .map(String::as_str)
        .unwrap_or("1")
    {
        "1" => 1u8,
        "2" => 2u8,
        other => {
            return Err(PluginError::Config(format!(
                "powmr_protocol_version must be 1 or 2, got '{other}'"
            )))
        }
    };

    let transport: Box<dyn ByteTransport> = match instance.connection {
        ConnectionKind::Tcp => Box::new(TcpTransport::new(
            instance.tcp_host.clone(),
            instance.tcp_port,
        )),
        ConnectionKind::Serial => Box::new(SerialTransport::new(
            instance.serial_port.clone(),
            instance.baud_rate,
        )),
    };

    Ok(Box::new(PowmrPlugin {
        timeout: instance.modbus_timeout,
        client: Inv8851Client::new(transport, version),
    }))
}

#[derive(Debug)]
pub struct PowmrPlugin {
    client: Inv8851Client,
    timeout: Duration,
}

impl PowmrPlugin {
    fn standardize(&self, state: &Inv8851State) -> ReadingValues {
        let mut values = ReadingValues::new();

        let mode = state.run_mode_code();
        values.insert(StandardKey::OperationalInverterStatusCode, Value::Int(mode as i64));
        values.insert(
            StandardKey::OperationalInverterStatusText,
            Value::from(powmr_maps::run_mode_text(mode)),
        );

        let pv_power = state.pv_power as f64;
        values.insert(StandardKey::PvMppt1VoltageVolts, Value::Number(state.pv_voltage));
        values.insert(StandardKey::PvMppt1CurrentAmps, Value::Number(state.pv_current));
        values.insert(StandardKey::PvMppt1PowerWatts, Value::Number(pv_power));
        values.insert(StandardKey::PvTotalDcPowerWatts, Value::Number(pv_power));

        values.insert(StandardKey::AcPowerWatts, Value::Number(state.load_watt as f64));
        values.insert(
            StandardKey::LoadTotalPowerWatts,
            Value::Number(state.load_watt as f64),
        );
        values.insert(StandardKey::GridL1VoltageVolts, Value::Number(state.grid_voltage));
        values.insert(StandardKey::GridFrequencyHz, Value::Number(state.grid_freq));
        values.insert(
            StandardKey::GridTotalActivePowerWatts,
            // The inverter only ever consumes from the grid; canonical
            // sign is positive for export.
            Value::Number(-(state.grid_voltage * state.grid_current)),
        );

        // Charge current is positive when charging; canonical battery
        // power is positive when discharging.
        let battery_power = -(state.batt_voltage * state.batt_charge_current);
        values.insert(StandardKey::BatteryVoltageVolts, Value::Number(state.batt_voltage));
        values.insert(
            StandardKey::BatteryCurrentAmps,
            Value::Number(state.batt_charge_current.abs()),
        );
        values.insert(StandardKey::BatteryPowerWatts, Value::Number(battery_power));
        values.insert(
            StandardKey::BatteryStatusText,
            Value::from(if battery_power > 10.0 {
                "Discharging"
            } else if battery_power < -10.0 {
                "Charging"
            } else {
                "Idle"
            }),
        );
        values.insert(
            StandardKey::BatteryTemperatureCelsius,
            Value::Number(state.batt_temperature),
        );
        if state.bms_soc > 0 {
            values.insert(
                StandardKey::BatteryStateOfChargePercent,
                Value::Number(state.bms_soc as f64),
            );
        }

        let cells = state.populated_cells();
        if !cells.is_empty() {
            values.insert(StandardKey::BmsCellCount, Value::Int(cells.len() as i64));
            let min = cells.iter().copied().fold(f64::INFINITY, f64::min);
            let max = cells.iter().copied().fold(f64::NEG_INFINITY, f64::max);
            values.insert(StandardKey::BmsCellVoltageMinVolts, Value::Number(min));
            values.insert(StandardKey::BmsCellVoltageMaxVolts, Value::Number(max));
            values.insert(
                StandardKey::BmsCellVoltageDeltaVolts,
                Value::Number(((max - min) * 1000.0).round() / 1000.0),
            );
            values.insert(StandardKey::BmsCellVoltagesList, Value::NumList(cells));
        }

        // Hottest NTC stands in for the inverter temperature.
        let hottest = state.ntc_temperatures.iter().copied().max().unwrap_or(0);
        values.insert(
            StandardKey::OperationalInverterTemperatureCelsius,
            Value::Number(hottest as f64),
        );

        let mut alert_words = Vec::new();
        if state.system_flags != 0 {
            alert_words.push(("system_flags", "status", powmr_maps::SYSTEM_FLAG_BITS, state.system_flags));
        }
        if state.grid_flags != 0 {
            alert_words.push(("grid_flags", "grid", powmr_maps::GRID_FLAG_BITS, state.grid_flags));
        }
        if state.fault_flags[0] != 0 {
            alert_words.push(("fault_flags", "inverter", powmr_maps::FAULT_FLAG_BITS, state.fault_flags[0]));
        }
        if !alert_words.is_empty() {
            let mut categorized: BTreeMap<String, Vec<String>> = BTreeMap::new();
            let mut codes = Vec::new();
            for (_, category, labels, word) in alert_words {
                for bit in 0..16u8 {
                    if word >> bit & 1 == 0 {
                        continue;
                    }
                    codes.push(((word as f64) * 65536.0) + bit as f64);
                    let label = labels
                        .iter()
                        .find(|(b, _)| *b == bit)
                        .map(|(_, text)| (*text).to_owned())
                        .unwrap_or_else(|| format!("{category} bit {bit}"));
                    categorized.entry(category.to_owned()).or_default().push(label);
                }
            }
            for list in categorized.values_mut() {
                list.sort();
            }
            values.insert(
                StandardKey::OperationalActiveFaultCodesList,
                Value::NumList(codes),
            );
            values.insert(StandardKey::OperationalCategorizedAlertsDict, Value::Alerts(categorized));
        }

        values
    }
}

#[async_trait]
impl DevicePlugin for PowmrPlugin {
    fn name(&self) -> &'static str {
        "powmr"
    }

    fn pretty_name(&self) -> &'static str {
        "POWMR Hybrid Inverter (inv8851)"
    }

    fn category(&self) -> DeviceCategory {
        DeviceCategory::Inverter
    }

    fn atomic_reads(&self) -> bool {
        // One frame carries the whole state block.
        true
    }

    fn configurable_params(&self) -> Vec<ParamDescriptor> {
        vec![
            ParamDescriptor {
                key: "connection_type",
                description: "serial, or tcp via an RS232 converter",
                kind: ParamKind::Choice(&["serial", "tcp"]),
                required: true,
                default: Some("serial"),
            },
            ParamDescriptor {
                key: "serial_port",
                description: "RS232 adapter device path",
                kind: ParamKind::Text,
                required: false,
                default: Some("/dev/ttyUSB0"),
            },
            ParamDescriptor {
                key: "baud_rate",
                description: "Serial speed",
                kind: ParamKind::Integer,
                required: false,
                default: Some("9600"),
            },
            ParamDescriptor {
                key: "powmr_protocol_version",
                description: "inv8851 protocol revision",
                kind: ParamKind::Choice(&["1", "2"]),
                required: false,
                default: Some("1"),
            },
        ]
    }

    async fn connect(&mut self, deadline: Duration) -> Result<bool> {
        self.client.connect(deadline).await?;
        Ok(true)
    }

    async fn disconnect(&mut self) {
        self.client.disconnect().await;
    }

    fn is_connected(&self) -> bool {
        self.client.is_connected()
    }

    async fn read_static(&mut self) -> Result<ReadingValues> {
        let state = self.client.read_state(self.timeout).await?;
        let mut values = ReadingValues::new();
        values.insert(StandardKey::StaticDeviceCategory, Value::from("inverter"));
        values.insert(StandardKey::StaticInverterManufacturer, Value::from("POWMR"));
        values.insert(
            StandardKey::StaticInverterModelName,
            Value::Text(format!("POWMR inv8851 (protocol v{})", self.client.version())),
        );
        values.insert(
            StandardKey::StaticInverterFirmwareVersion,
            Value::Text(format!("{}", state.software_version)),
        );
        values.insert(StandardKey::StaticNumberOfMppts, Value::Int(1));
        values.insert(StandardKey::StaticNumberOfPhasesAc, Value::Int(1));
        Ok(values)
    }

    async fn read_dynamic(&mut self) -> Result<ReadingValues> {
        let state = self.client.read_state(self.timeout).await?;
        Ok(self.standardize(&state))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use helio_protocol::inv8851::state_payload_len;

    fn state_with(mode_nibble: u8, charge_current_raw: i16) -> Inv8851State {
        let mut payload = vec![0u8; state_payload_len(1)];
        // run mode word
        payload[0] = mode_nibble;
        payload[1] = 0;
        let set_word = |payload: &mut Vec<u8>, word: usize, value: u16| {
            let bytes = value.to_be_bytes();
            payload[word * 2] = bytes[0];
            payload[word * 2 + 1] = bytes[1];
        };
        set_word(&mut payload, 0, (mode_nibble as u16) << 8);
        set_word(&mut payload, 39, 5200); // 52.00 V
        set_word(&mut payload, 40, charge_current_raw as u16); // 0.1 A steps
        set_word(&mut payload, 43, 3200); // 320.0 V PV
        set_word(&mut payload, 45, 1500);
        set_word(&mut payload, 53, 85);
        for i in 0..4 {
            set_word(&mut payload, 56 + i, 3300 + i as u16);
        }
        Inv8851State::parse(&payload, 1).unwrap()
    }

    fn plugin() -> PowmrPlugin {
        let config: helio_common::AppConfig =
            "[general]\nplugin_instances = inv\n[plugin_inv]\nplugin_type = inverter.powmr\nconnection_type = serial\n"
                .parse()
                .unwrap();
        let Ok(boxed) = construct(&config.instances["inv"], &PluginContext::default()) else {
            panic!("construct failed");
        };
        // Re-box into the concrete type for direct standardize testing.
        let _ = boxed;
        PowmrPlugin {
            client: Inv8851Client::new(
                Box::new(SerialTransport::new("/dev/null", 9600)),
                1,
            ),
            timeout: Duration::from_secs(2),
        }
    }

    #[test]
    fn charging_state_yields_negative_battery_power() {
        let plugin = plugin();
        let state = state_with(8, 100); // Charging, 10 A
        let values = plugin.standardize(&state);
        assert_eq!(
            values.get(&StandardKey::OperationalInverterStatusText),
            Some(&Value::from("Charging"))
        );
        let power = values
            .get(&StandardKey::BatteryPowerWatts)
            .and_then(Value::as_f64)
            .unwrap();
        assert!((power + 520.0).abs() < 1e-6);
        assert_eq!(
            values.get(&StandardKey::BatteryStatusText),
            Some(&Value::from("Charging"))
        );
    }

    #[test]
    fn populated_cells_are_published_with_stats() {
        let plugin = plugin();
        let values = plugin.standardize(&state_with(3, 0));
        assert_eq!(values.get(&StandardKey::BmsCellCount), Some(&Value::Int(4)));
        let delta = values
            .get(&StandardKey::BmsCellVoltageDeltaVolts)
            .and_then(Value::as_f64)
            .unwrap();
        assert!((delta - 0.003).abs() < 1e-9);
    }

    #[test]
    fn invalid_protocol_version_is_config_error() {
        let config: helio_common::AppConfig =
            "[general]\nplugin_instances = inv\n[plugin_inv]\nplugin_type = inverter.powmr\npowmr_protocol_version = 9\n"
                .parse()
                .unwrap();
        let err = construct(&config.instances["inv"], &PluginContext::default()).unwrap_err();
        assert!(err.is_fatal());
    }
}
