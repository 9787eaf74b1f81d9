//! ---
//! helio_section: "01-core-functionality"
//! helio_subsection: "module"
//! helio_type: "source"
//! helio_scope: "code"
//! helio_description: "Aggregation, filtering, supervision and fan-out."
//! helio_version: "v0.4.2"
//! helio_owner: "tbd"
//! ---
//! The aggregator: single consumer of every worker's readings.
//!
//! Per reading it stamps receive time, routes keys (alerts are namespaced
//! per instance before merging; battery keys written by a BMS stay owned
//! by BMS instances), runs the adaptive filter, recomputes derived
//! fields, and publishes a fresh versioned snapshot. Readings of one
//! instance merge in emission order; key writes of different readings
//! never interleave because this loop is the only writer.

use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;
use std::time::Instant;

use chrono::Utc;
use helio_common::config::InverterSystemConfig;
use helio_types::{
    ConnectionStatus, PluginStatusDetail, Reading, Snapshot, StandardKey, Value,
};
use indexmap::IndexMap;
use tokio::sync::{mpsc, watch};
use tracing::{debug, info};

use crate::filter::{AdaptiveFilter, FilterVerdict};
use crate::state::SystemState;
use crate::supervisor::{Availability, HealthRegistry};

/// Marker used as the writer id for values the core derives itself.
const DERIVED_WRITER: &str = "core";

/// Battery flows below this are treated as idle in the time-remaining
/// estimate.
const IDLE_POWER_W: f64 = 25.0;

#[derive(Debug, Clone)]
pub struct AggregatorConfig {
    pub system: InverterSystemConfig,
}

/// Owns the system state and the filter; everything downstream sees only
/// snapshots.
pub struct Aggregator {
    config: AggregatorConfig,
    state: SystemState,
    filter: AdaptiveFilter,
    health: HealthRegistry,
    availability: Availability,
    snapshot_tx: watch::Sender<Arc<Snapshot>>,
    bms_instances: HashSet<String>,
    bms_owned_keys: HashSet<StandardKey>,
    alerts_by_instance: IndexMap<String, BTreeMap<String, Vec<String>>>,
}

impl Aggregator {
    pub fn new(
        config: AggregatorConfig,
        filter: AdaptiveFilter,
        health: HealthRegistry,
        availability: Availability,
        snapshot_tx: watch::Sender<Arc<Snapshot>>,
    ) -> Self {
        Self {
            config,
            state: SystemState::new(),
            filter,
            health,
            availability,
            snapshot_tx,
            bms_instances: HashSet::new(),
            bms_owned_keys: HashSet::new(),
            alerts_by_instance: IndexMap::new(),
        }
    }

    /// Consume readings until every worker is gone.
    pub async fn run(mut self, mut readings: mpsc::Receiver<Reading>) {
        info!("aggregator started");
        while let Some(reading) = readings.recv().await {
            self.process_reading(reading);
        }
        info!("aggregator stopped");
    }

    /// Merge one reading and publish the resulting snapshot.
    pub fn process_reading(&mut self, reading: Reading) {
        let received_wall = Utc::now();
        let received_mono = Instant::now();
        self.filter.expire_stale_state(received_mono);

        let instance = reading.instance_id.clone();
        if reading
            .values
            .get(&StandardKey::StaticDeviceCategory)
            .and_then(Value::as_str)
            == Some("bms")
        {
            self.bms_instances.insert(instance.clone());
        }
        let is_bms = self.bms_instances.contains(&instance);

        let mut rejected = 0usize;
        for (key, value) in reading.values.iter() {
            match key {
                // Core-populated bookkeeping never comes from a plugin.
                StandardKey::ServerTimestampMsUtc | StandardKey::CorePluginConnectionStatus => {
                    continue
                }
                // Alerts are namespaced by instance and merged below.
                StandardKey::OperationalCategorizedAlertsDict => {
                    if let Some(alerts) = value.as_alerts() {
                        self.alerts_by_instance.insert(instance.clone(), alerts.clone());
                    }
                    continue;
                }
                _ => {}
            }

            // A key a BMS has claimed is no longer writable by inverters
            // reporting second-hand battery data.
            if is_bms {
                self.bms_owned_keys.insert(*key);
            } else if self.bms_owned_keys.contains(key) {
                debug!(instance = %instance, key = key.as_str(), "key owned by a bms instance, skipping");
                continue;
            }

            match self.filter.apply(*key, value, received_mono, received_wall) {
                FilterVerdict::Accept(filtered) => {
                    self.state.write(*key, filtered, &instance, received_wall);
                }
                FilterVerdict::Reject { .. } => {
                    rejected += 1;
                }
            }
        }
        if rejected > 0 {
            debug!(instance = %instance, rejected, "values rejected by the filter this reading");
        }

        self.state.mark_seen(&instance, received_wall);
        self.recompute_derived();
        self.merge_alerts();
        self.publish(received_wall);
    }

    /// Derived quantities with documented formulas. Missing inputs mean
    /// the derivation is skipped, never guessed.
    fn recompute_derived(&mut self) {
        let now = Utc::now();

        // Load power balance: PV production plus battery discharge minus
        // what leaves through the grid (canonical grid sign is positive
        // for export).
        let direct_load = self
            .state
            .writer_of(StandardKey::LoadTotalPowerWatts)
            .is_some_and(|writer| writer != DERIVED_WRITER);
        if !direct_load {
            if let (Some(pv), Some(battery), Some(grid)) = (
                self.state.get_f64(StandardKey::PvTotalDcPowerWatts),
                self.state.get_f64(StandardKey::BatteryPowerWatts),
                self.state.get_f64(StandardKey::GridTotalActivePowerWatts),
            ) {
                let load = (pv + battery - grid).max(0.0);
                self.state
                    .write(StandardKey::LoadTotalPowerWatts, Value::Number(load), DERIVED_WRITER, now);
            }
        }

        // A zero load with real inverter output is a reporting artifact.
        let load = self.state.get_f64(StandardKey::LoadTotalPowerWatts);
        let ac = self.state.get_f64(StandardKey::AcPowerWatts);
        if let Some(ac_power) = ac {
            if ac_power > 0.0 && load.map_or(true, |l| l == 0.0) {
                self.state.write(
                    StandardKey::LoadTotalPowerWatts,
                    Value::Number(ac_power),
                    DERIVED_WRITER,
                    now,
                );
            }
        }

        // Daily load energy balance, clamped at zero.
        let direct_load_energy = self
            .state
            .writer_of(StandardKey::EnergyLoadDailyKwh)
            .is_some_and(|writer| writer != DERIVED_WRITER);
        if !direct_load_energy {
            let inputs = (
                self.state.get_f64(StandardKey::EnergyPvDailyKwh),
                self.state.get_f64(StandardKey::EnergyGridDailyExportKwh),
                self.state.get_f64(StandardKey::EnergyBatteryDailyChargeKwh),
                self.state.get_f64(StandardKey::EnergyGridDailyImportKwh),
                self.state.get_f64(StandardKey::EnergyBatteryDailyDischargeKwh),
            );
            if let (Some(pv), Some(export), Some(charge), Some(import), Some(discharge)) = inputs {
                let load_energy = (pv - export - charge + import + discharge).max(0.0);
                self.state.write(
                    StandardKey::EnergyLoadDailyKwh,
                    Value::Number(load_energy),
                    DERIVED_WRITER,
                    now,
                );
            }
        }

        let remaining = self.battery_time_remaining();
        self.state.write(
            StandardKey::OperationalBatteryTimeRemainingEstimateText,
            Value::Text(remaining),
            DERIVED_WRITER,
            now,
        );
    }

    /// Human-readable estimate of time to full (charging) or to the 20%
    /// floor (discharging).
    fn battery_time_remaining(&self) -> String {
        let soc = self.state.get_f64(StandardKey::BatteryStateOfChargePercent);
        let power = self.state.get_f64(StandardKey::BatteryPowerWatts);
        let capacity_kwh = self.config.system.battery_usable_capacity_kwh;

        let (Some(soc), Some(power)) = (soc, power) else {
            return "N/A".to_owned();
        };
        if capacity_kwh <= 0.0 {
            return "N/A".to_owned();
        }
        if power.abs() < IDLE_POWER_W {
            return "Idle".to_owned();
        }

        let (hours, label) = if power > 0.0 {
            let target = 20.0;
            if soc <= target {
                return format!("<{target}% ({soc}%)");
            }
            let energy_wh = capacity_kwh * 1000.0 * ((soc - target) / 100.0);
            (energy_wh / power, format!("(to {target}%)"))
        } else {
            if soc >= 100.0 {
                return "Full".to_owned();
            }
            let energy_wh = capacity_kwh * 1000.0 * ((100.0 - soc) / 100.0);
            (energy_wh / power.abs(), "(to 100%)".to_owned())
        };

        if hours > 100.0 {
            return format!(">100h {label}");
        }
        let minutes = (hours * 60.0) as i64;
        format!("~ {}h {}m {}", minutes / 60, minutes % 60, label)
    }

    /// Union of all instances' categorized alerts. A category with real
    /// alerts drops its "OK" placeholder.
    fn merge_alerts(&mut self) {
        if self.alerts_by_instance.is_empty() {
            return;
        }
        let mut merged: BTreeMap<String, Vec<String>> = BTreeMap::new();
        for alerts in self.alerts_by_instance.values() {
            for (category, labels) in alerts {
                let slot = merged.entry(category.clone()).or_default();
                slot.extend(labels.iter().cloned());
            }
        }
        for labels in merged.values_mut() {
            labels.sort();
            labels.dedup();
            if labels.len() > 1 {
                labels.retain(|l| l != "OK");
            }
        }
        self.state.write(
            StandardKey::OperationalCategorizedAlertsDict,
            Value::Alerts(merged),
            DERIVED_WRITER,
            Utc::now(),
        );
    }

    fn publish(&mut self, wall: chrono::DateTime<Utc>) {
        let mut statuses: IndexMap<String, ConnectionStatus> = IndexMap::new();
        let mut any_connected = false;
        {
            let registry = self.health.lock();
            for (instance, health) in registry.iter() {
                let mut status = health.status();
                if self.availability.is_offline(instance) {
                    status = ConnectionStatus::Disconnected;
                }
                any_connected |= status == ConnectionStatus::Connected;
                statuses.insert(instance.clone(), status);
                self.state.set_plugin_status(
                    instance,
                    PluginStatusDetail {
                        connected: health.is_connected(),
                        last_error: health.last_error(),
                        consecutive_failures: health.consecutive_failures(),
                    },
                );
            }
        }

        self.state.write(
            StandardKey::CorePluginConnectionStatus,
            Value::from(if any_connected { "connected" } else { "disconnected" }),
            DERIVED_WRITER,
            wall,
        );

        let snapshot = self.state.snapshot(statuses, wall);
        // Subscribers pull at their own pace; only the latest matters.
        let _ = self.snapshot_tx.send(Arc::new(snapshot));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::supervisor::new_health_registry;
    use helio_common::config::FilterConfig;
    use helio_types::ReadingValues;

    fn aggregator() -> (Aggregator, watch::Receiver<Arc<Snapshot>>) {
        let system = InverterSystemConfig {
            default_mppt_count: 2,
            pv_installed_capacity_w: 8000.0,
            inverter_max_ac_power_w: 6000.0,
            battery_usable_capacity_kwh: 10.0,
            battery_max_charge_power_w: 5000.0,
            battery_max_discharge_power_w: 5000.0,
        };
        let filter = AdaptiveFilter::new(FilterConfig::default(), system.clone(), chrono_tz::UTC);
        let (tx, rx) = watch::channel(Snapshot::empty().into_shared());
        let aggregator = Aggregator::new(
            AggregatorConfig { system },
            filter,
            new_health_registry(),
            Availability::new(),
            tx,
        );
        (aggregator, rx)
    }

    fn reading(instance: &str, pairs: &[(StandardKey, Value)]) -> Reading {
        let mut values = ReadingValues::new();
        for (key, value) in pairs {
            values.insert(*key, value.clone());
        }
        Reading::new(instance.to_owned(), values)
    }

    #[test]
    fn snapshot_versions_grow_with_each_reading() {
        let (mut aggregator, rx) = aggregator();
        aggregator.process_reading(reading(
            "inv",
            &[(StandardKey::AcPowerWatts, Value::Number(500.0))],
        ));
        let v1 = rx.borrow().snapshot_version;
        aggregator.process_reading(reading(
            "inv",
            &[(StandardKey::AcPowerWatts, Value::Number(510.0))],
        ));
        let v2 = rx.borrow().snapshot_version;
        assert!(v2 > v1);
    }

    #[test]
    fn bms_keys_win_over_inverter_reports() {
        let (mut aggregator, rx) = aggregator();
        aggregator.process_reading(reading(
            "bms",
            &[
                (StandardKey::StaticDeviceCategory, Value::from("bms")),
                (StandardKey::BatteryStateOfChargePercent, Value::Number(81.0)),
            ],
        ));
        // The inverter's second-hand SOC must not displace the BMS value.
        aggregator.process_reading(reading(
            "inv",
            &[(StandardKey::BatteryStateOfChargePercent, Value::Number(50.0))],
        ));
        assert_eq!(
            rx.borrow().get_f64(StandardKey::BatteryStateOfChargePercent),
            Some(81.0)
        );
    }

    #[test]
    fn load_power_is_derived_from_the_balance() {
        let (mut aggregator, rx) = aggregator();
        aggregator.process_reading(reading(
            "inv",
            &[
                (StandardKey::PvTotalDcPowerWatts, Value::Number(3000.0)),
                (StandardKey::BatteryPowerWatts, Value::Number(-1000.0)),
                (StandardKey::GridTotalActivePowerWatts, Value::Number(500.0)),
            ],
        ));
        // 3000 produced, 1000 into the battery, 500 exported: 1500 consumed.
        assert_eq!(rx.borrow().get_f64(StandardKey::LoadTotalPowerWatts), Some(1500.0));
    }

    #[test]
    fn zero_load_with_ac_output_is_corrected() {
        let (mut aggregator, rx) = aggregator();
        aggregator.process_reading(reading(
            "inv",
            &[
                (StandardKey::LoadTotalPowerWatts, Value::Number(0.0)),
                (StandardKey::AcPowerWatts, Value::Number(800.0)),
            ],
        ));
        assert_eq!(rx.borrow().get_f64(StandardKey::LoadTotalPowerWatts), Some(800.0));
    }

    #[test]
    fn daily_load_energy_is_derived_and_clamped() {
        let (mut aggregator, rx) = aggregator();
        aggregator.process_reading(reading(
            "inv",
            &[
                (StandardKey::EnergyPvDailyKwh, Value::Number(10.0)),
                (StandardKey::EnergyGridDailyExportKwh, Value::Number(4.0)),
                (StandardKey::EnergyBatteryDailyChargeKwh, Value::Number(3.0)),
                (StandardKey::EnergyGridDailyImportKwh, Value::Number(1.0)),
                (StandardKey::EnergyBatteryDailyDischargeKwh, Value::Number(2.0)),
            ],
        ));
        assert_eq!(rx.borrow().get_f64(StandardKey::EnergyLoadDailyKwh), Some(6.0));
    }

    #[test]
    fn alerts_merge_across_instances_and_elide_ok() {
        let (mut aggregator, rx) = aggregator();
        let mut inverter_alerts = BTreeMap::new();
        inverter_alerts.insert("grid".to_owned(), vec!["OK".to_owned()]);
        let mut bms_alerts = BTreeMap::new();
        bms_alerts.insert("grid".to_owned(), vec!["Grid overvoltage".to_owned()]);
        bms_alerts.insert("bms".to_owned(), vec!["Cell overvoltage".to_owned()]);

        aggregator.process_reading(reading(
            "inv",
            &[(StandardKey::OperationalCategorizedAlertsDict, Value::Alerts(inverter_alerts))],
        ));
        aggregator.process_reading(reading(
            "bms2",
            &[(StandardKey::OperationalCategorizedAlertsDict, Value::Alerts(bms_alerts))],
        ));

        let snapshot = rx.borrow().clone();
        let alerts = snapshot
            .get(StandardKey::OperationalCategorizedAlertsDict)
            .and_then(Value::as_alerts)
            .unwrap();
        assert_eq!(alerts["grid"], vec!["Grid overvoltage".to_owned()]);
        assert_eq!(alerts["bms"], vec!["Cell overvoltage".to_owned()]);
    }

    #[test]
    fn time_remaining_estimates_discharge_to_floor() {
        let (mut aggregator, rx) = aggregator();
        aggregator.process_reading(reading(
            "inv",
            &[
                (StandardKey::BatteryStateOfChargePercent, Value::Number(60.0)),
                (StandardKey::BatteryPowerWatts, Value::Number(2000.0)),
            ],
        ));
        let snapshot = rx.borrow().clone();
        let text = snapshot
            .get(StandardKey::OperationalBatteryTimeRemainingEstimateText)
            .and_then(Value::as_str)
            .unwrap()
            .to_owned();
        // 4 kWh above the floor at 2 kW: two hours.
        assert_eq!(text, "~ 2h 0m (to 20%)");
    }
}
