//! ---
//! helio_section: "03-persistence-logging"
//! helio_subsection: "integration-test"
//! helio_type: "test"
//! helio_scope: "code"
//! helio_description: "End-to-end pipeline: worker, aggregator, publisher, store."
//! helio_version: "v0.4.2"
//! helio_owner: "tbd"
//! ---
//! Drives a scripted plugin through the real worker, aggregator and
//! publisher, and checks the snapshot a history writer would sample.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use helio_core::aggregator::{Aggregator, AggregatorConfig};
use helio_core::filter::AdaptiveFilter;
use helio_core::publisher::Publisher;
use helio_core::supervisor::{new_health_registry, Availability};
use helio_plugins::worker::{spawn_worker, WorkerConfig};
use helio_plugins::{DeviceCategory, DevicePlugin, ParamDescriptor};
use helio_types::{ReadingValues, Snapshot, StandardKey, Value};
use tokio::sync::{broadcast, mpsc, watch};

#[derive(Debug)]
struct ScriptedInverter {
    connected: bool,
    polls: u32,
}

#[async_trait]
impl DevicePlugin for ScriptedInverter {
    fn name(&self) -> &'static str {
        "scripted"
    }
    fn pretty_name(&self) -> &'static str {
        "Scripted Inverter"
    }
    fn category(&self) -> DeviceCategory {
        DeviceCategory::Inverter
    }
    fn configurable_params(&self) -> Vec<ParamDescriptor> {
        Vec::new()
    }
    async fn connect(&mut self, _deadline: Duration) -> helio_plugins::Result<bool> {
        self.connected = true;
        Ok(true)
    }
    async fn disconnect(&mut self) {
        self.connected = false;
    }
    fn is_connected(&self) -> bool {
        self.connected
    }
    async fn read_static(&mut self) -> helio_plugins::Result<ReadingValues> {
        let mut values = ReadingValues::new();
        values.insert(StandardKey::StaticDeviceCategory, Value::from("inverter"));
        values.insert(StandardKey::StaticInverterManufacturer, Value::from("Scripted"));
        Ok(values)
    }
    async fn read_dynamic(&mut self) -> helio_plugins::Result<ReadingValues> {
        self.polls += 1;
        let mut values = ReadingValues::new();
        values.insert(
            StandardKey::OperationalInverterStatusText,
            Value::from("Generating"),
        );
        values.insert(
            StandardKey::PvTotalDcPowerWatts,
            Value::Number(1000.0 + self.polls as f64),
        );
        values.insert(StandardKey::BatteryPowerWatts, Value::Number(-250.0));
        values.insert(StandardKey::GridTotalActivePowerWatts, Value::Number(100.0));
        values.insert(
            StandardKey::EnergyPvDailyKwh,
            Value::Number(2.0 + self.polls as f64 * 0.001),
        );
        Ok(values)
    }
    async fn read_yesterday_energy_summary(
        &mut self,
    ) -> helio_plugins::Result<Option<ReadingValues>> {
        let mut values = ReadingValues::new();
        values.insert(StandardKey::EnergyPvDailyKwh, Value::Number(12.5));
        Ok(Some(values))
    }
}

fn test_system() -> helio_common::config::InverterSystemConfig {
    helio_common::config::InverterSystemConfig {
        default_mppt_count: 2,
        pv_installed_capacity_w: 8000.0,
        inverter_max_ac_power_w: 6000.0,
        battery_usable_capacity_kwh: 10.0,
        battery_max_charge_power_w: 5000.0,
        battery_max_discharge_power_w: 5000.0,
    }
}

#[tokio::test(start_paused = true)]
async fn readings_flow_from_worker_to_published_snapshot() {
    let system = test_system();
    let (readings_tx, readings_rx) = mpsc::channel(16);
    let (snapshot_tx, snapshot_rx) = watch::channel(Snapshot::empty().into_shared());
    let (shutdown_tx, _) = broadcast::channel(4);
    let (yesterday_tx, mut yesterday_rx) = mpsc::channel(4);

    let filter = AdaptiveFilter::new(Default::default(), system.clone(), chrono_tz::UTC);
    let aggregator = Aggregator::new(
        AggregatorConfig { system },
        filter,
        new_health_registry(),
        Availability::new(),
        snapshot_tx,
    );
    let aggregator_task = tokio::spawn(aggregator.run(readings_rx));

    let worker_config = WorkerConfig {
        poll_interval: Duration::from_secs(5),
        connect_timeout: Duration::from_secs(2),
        max_reconnect_attempts: 3,
        max_consecutive_waiting_polls: 5,
        stagnation_threshold: 60,
        yesterday_summaries: Some(yesterday_tx),
    };
    let handle = spawn_worker(
        "main_inverter".into(),
        Box::new(ScriptedInverter {
            connected: false,
            polls: 0,
        }),
        worker_config,
        readings_tx,
        shutdown_tx.subscribe(),
    );

    let publisher = Publisher::new(snapshot_rx);
    let mut subscription = publisher.subscribe(None);

    // First published snapshot carries merged static + dynamic + derived
    // values.
    let snapshot = subscription.next().await.expect("snapshot published");
    assert!(snapshot.snapshot_version >= 1);
    assert_eq!(
        snapshot.get(StandardKey::StaticInverterManufacturer),
        Some(&Value::from("Scripted"))
    );
    assert_eq!(snapshot.get_f64(StandardKey::PvTotalDcPowerWatts), Some(1001.0));
    // Load derived from the balance: pv + battery - grid.
    assert_eq!(snapshot.get_f64(StandardKey::LoadTotalPowerWatts), Some(651.0));

    // The device-reported yesterday totals reached the backfill channel.
    let (instance, values) = yesterday_rx.recv().await.expect("yesterday summary offered");
    assert_eq!(instance, "main_inverter");
    assert_eq!(
        values.get(&StandardKey::EnergyPvDailyKwh),
        Some(&Value::Number(12.5))
    );

    // Later snapshots keep strictly increasing versions.
    let first_version = snapshot.snapshot_version;
    let next = subscription.next().await.expect("second snapshot");
    assert!(next.snapshot_version > first_version);

    let _ = shutdown_tx.send(());
    handle.join.await.unwrap();
    drop(publisher);
    aggregator_task.abort();
}

#[tokio::test(start_paused = true)]
async fn filtered_subscription_projects_keys() {
    let system = test_system();
    let (readings_tx, readings_rx) = mpsc::channel(16);
    let (snapshot_tx, snapshot_rx) = watch::channel(Snapshot::empty().into_shared());
    let (shutdown_tx, _) = broadcast::channel(4);

    let filter = AdaptiveFilter::new(Default::default(), system.clone(), chrono_tz::UTC);
    let aggregator = Aggregator::new(
        AggregatorConfig { system },
        filter,
        new_health_registry(),
        Availability::new(),
        snapshot_tx,
    );
    let aggregator_task = tokio::spawn(aggregator.run(readings_rx));

    let handle = spawn_worker(
        "main_inverter".into(),
        Box::new(ScriptedInverter {
            connected: false,
            polls: 0,
        }),
        WorkerConfig {
            poll_interval: Duration::from_secs(5),
            connect_timeout: Duration::from_secs(2),
            max_reconnect_attempts: 3,
            max_consecutive_waiting_polls: 5,
            stagnation_threshold: 60,
            yesterday_summaries: None,
        },
        readings_tx,
        shutdown_tx.subscribe(),
    );

    let publisher = Publisher::new(snapshot_rx);
    let energy_only: helio_core::publisher::KeyFilter =
        Arc::new(|key: &StandardKey| key.is_daily_energy());
    let mut subscription = publisher.subscribe(Some(energy_only));

    let snapshot = subscription.next().await.expect("snapshot");
    assert!(snapshot.get(StandardKey::EnergyPvDailyKwh).is_some());
    assert!(snapshot.get(StandardKey::PvTotalDcPowerWatts).is_none());

    let _ = shutdown_tx.send(());
    handle.join.await.unwrap();
    aggregator_task.abort();
}
