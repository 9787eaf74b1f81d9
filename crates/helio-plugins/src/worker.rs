//! ---
//! helio_section: "05-device-plugins"
//! helio_subsection: "module"
//! helio_type: "source"
//! helio_scope: "code"
//! helio_description: "Device plugin contract, poll workers and concrete drivers."
//! helio_version: "v0.4.2"
//! helio_owner: "tbd"
//! ---
//! The per-instance poll worker.
//!
//! One tokio task per plugin instance drives the device through
//! Init → Connect → ReadStatic → ReadDynamic → Sleep. The worker owns the
//! plugin (and through it the transport) exclusively; the rest of the
//! system sees it only via the readings channel, the shared health handle
//! and the command mailbox.

use std::sync::Arc;
use std::time::{Duration, Instant};

use helio_types::{ConnectionStatus, Reading, ReadingValues, StandardKey, Value};
use parking_lot::Mutex;
use tokio::sync::{broadcast, mpsc};
use tokio::time::sleep;
use tracing::{debug, error, info, warn};

use crate::{DeviceCategory, DevicePlugin};

/// Inverter status texts that mean real power is flowing; only these are
/// subject to the stagnation check.
pub const FULLY_OPERATIONAL_STATUSES: &[&str] = &[
    "Generating",
    "Grid Sync",
    "Discharging",
    "Charging",
    "Normal",
    "No Grid",
];

/// Status texts that mean the device is idle on purpose. Polls in these
/// states still count as successful for the watchdog.
pub const WAITING_STATUSES: &[&str] = &["waiting", "standby", "idle", "off", "sleep"];

/// Reconnect backoff cap.
const MAX_BACKOFF: Duration = Duration::from_secs(60);

/// Commands the supervisor can send a worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerCommand {
    /// Drop the connection and re-establish it on the next cycle.
    Reconnect,
}

/// Worker tuning derived from the instance and general config.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    pub poll_interval: Duration,
    pub connect_timeout: Duration,
    /// Connect attempts within one cycle before the failure is surfaced.
    pub max_reconnect_attempts: u32,
    /// Consecutive waiting-status polls before a reconnect is forced.
    pub max_consecutive_waiting_polls: u32,
    /// Consecutive identical power-flow polls before the cycle is marked
    /// unsuccessful so the watchdog fires.
    pub stagnation_threshold: u32,
    /// Where to offer device-reported totals for yesterday, once per
    /// worker lifetime, for the history backfill.
    pub yesterday_summaries: Option<mpsc::Sender<(String, ReadingValues)>>,
}

impl WorkerConfig {
    /// Stagnation threshold equivalent to five minutes of identical data.
    pub fn stagnation_threshold_for(poll_interval: Duration) -> u32 {
        let secs = poll_interval.as_secs().max(1);
        ((5 * 60) / secs).max(2) as u32
    }
}

#[derive(Debug)]
struct HealthInner {
    status: ConnectionStatus,
    connected: bool,
    halted: bool,
    last_error: Option<String>,
    consecutive_failures: u32,
    last_successful_poll: Option<Instant>,
    started_at: Instant,
}

/// Shared, lock-protected health view of one worker. The supervisor reads
/// it; only the worker writes it.
#[derive(Debug)]
pub struct WorkerHealth {
    inner: Mutex<HealthInner>,
}

impl WorkerHealth {
    fn new() -> Self {
        Self {
            inner: Mutex::new(HealthInner {
                status: ConnectionStatus::Initializing,
                connected: false,
                halted: false,
                last_error: None,
                consecutive_failures: 0,
                last_successful_poll: None,
                started_at: Instant::now(),
            }),
        }
    }

    pub fn status(&self) -> ConnectionStatus {
        self.inner.lock().status
    }

    pub fn is_connected(&self) -> bool {
        self.inner.lock().connected
    }

    /// A worker that halted on a fatal error must not be recreated.
    pub fn is_halted(&self) -> bool {
        self.inner.lock().halted
    }

    pub fn last_error(&self) -> Option<String> {
        self.inner.lock().last_error.clone()
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.inner.lock().consecutive_failures
    }

    pub fn last_successful_poll(&self) -> Option<Instant> {
        self.inner.lock().last_successful_poll
    }

    pub fn started_at(&self) -> Instant {
        self.inner.lock().started_at
    }

    fn set_status(&self, status: ConnectionStatus, connected: bool) {
        let mut inner = self.inner.lock();
        inner.status = status;
        inner.connected = connected;
    }

    fn mark_success(&self) {
        let mut inner = self.inner.lock();
        inner.status = ConnectionStatus::Connected;
        inner.connected = true;
        inner.last_error = None;
        inner.consecutive_failures = 0;
        inner.last_successful_poll = Some(Instant::now());
    }

    fn mark_failure(&self, error: &str, connected: bool) {
        let mut inner = self.inner.lock();
        inner.status = if connected {
            ConnectionStatus::Error
        } else {
            ConnectionStatus::Disconnected
        };
        inner.connected = connected;
        inner.last_error = Some(error.to_owned());
        inner.consecutive_failures += 1;
    }

    fn mark_halted(&self, error: &str) {
        let mut inner = self.inner.lock();
        inner.status = ConnectionStatus::Error;
        inner.connected = false;
        inner.halted = true;
        inner.last_error = Some(error.to_owned());
    }

    /// Restart bookkeeping after a supervisor-ordered reconnect.
    fn reset_for_reconnect(&self) {
        let mut inner = self.inner.lock();
        inner.consecutive_failures = 0;
        inner.status = ConnectionStatus::Initializing;
        inner.connected = false;
    }
}

/// Handle owned by the supervisor for one running worker.
pub struct WorkerHandle {
    pub instance_id: String,
    pub health: Arc<WorkerHealth>,
    pub commands: mpsc::Sender<WorkerCommand>,
    pub join: tokio::task::JoinHandle<()>,
}

/// Spawn the poll worker for one plugin instance.
pub fn spawn_worker(
    instance_id: String,
    plugin: Box<dyn DevicePlugin>,
    config: WorkerConfig,
    readings: mpsc::Sender<Reading>,
    shutdown: broadcast::Receiver<()>,
) -> WorkerHandle {
    let health = Arc::new(WorkerHealth::new());
    let (command_tx, command_rx) = mpsc::channel(4);
    let task_health = health.clone();
    let task_instance = instance_id.clone();
    let join = tokio::spawn(async move {
        run_worker(
            task_instance,
            plugin,
            config,
            readings,
            task_health,
            command_rx,
            shutdown,
        )
        .await;
    });
    WorkerHandle {
        instance_id,
        health,
        commands: command_tx,
        join,
    }
}

async fn run_worker(
    instance_id: String,
    mut plugin: Box<dyn DevicePlugin>,
    config: WorkerConfig,
    readings: mpsc::Sender<Reading>,
    health: Arc<WorkerHealth>,
    mut commands: mpsc::Receiver<WorkerCommand>,
    mut shutdown: broadcast::Receiver<()>,
) {
    info!(instance = %instance_id, plugin = plugin.name(), "poll worker started");

    let mut static_cache: ReadingValues = ReadingValues::new();
    let mut static_ok = false;
    let mut waiting_polls: u32 = 0;
    let mut yesterday_offered = false;
    let mut stagnation = StagnationDetector::new(config.stagnation_threshold);

    'main: loop {
        let cycle_start = Instant::now();

        // Drain pending supervisor commands before the cycle.
        while let Ok(command) = commands.try_recv() {
            match command {
                WorkerCommand::Reconnect => {
                    warn!(instance = %instance_id, "reconnect ordered by supervisor");
                    plugin.disconnect().await;
                    health.reset_for_reconnect();
                    static_ok = false;
                }
            }
        }

        if !plugin.is_connected() {
            let mut attempt = 0u32;
            while !plugin.is_connected() && attempt < config.max_reconnect_attempts {
                attempt += 1;
                health.set_status(ConnectionStatus::Initializing, false);
                debug!(instance = %instance_id, attempt, "connecting");
                match plugin.connect(config.connect_timeout).await {
                    Ok(true) => {
                        info!(instance = %instance_id, "connected");
                        static_ok = false;
                        break;
                    }
                    Ok(false) => {
                        health.mark_failure("connect returned false", false);
                    }
                    Err(err) if err.is_fatal() => {
                        error!(instance = %instance_id, error = %err, "fatal error during connect, halting worker");
                        health.mark_halted(&err.to_string());
                        break 'main;
                    }
                    Err(err) => {
                        health.mark_failure(&err.to_string(), false);
                    }
                }
                let backoff = Duration::from_secs(1u64 << attempt.min(6)).min(MAX_BACKOFF);
                debug!(instance = %instance_id, attempt, backoff_s = backoff.as_secs(), "connect failed, backing off");
                tokio::select! {
                    _ = shutdown.recv() => break 'main,
                    _ = sleep(backoff) => {}
                }
            }

            if !plugin.is_connected() {
                // Connect attempts exhausted: the failure streak is
                // visible through the health handle, and the worker stays
                // passive until the supervisor tells it what to do.
                warn!(
                    instance = %instance_id,
                    attempts = attempt,
                    "connect attempts exhausted, waiting for supervisor command"
                );
                tokio::select! {
                    _ = shutdown.recv() => break 'main,
                    command = commands.recv() => {
                        match command {
                            Some(WorkerCommand::Reconnect) => {
                                info!(instance = %instance_id, "supervisor ordered reconnect");
                                health.reset_for_reconnect();
                                static_ok = false;
                            }
                            None => break 'main,
                        }
                    }
                }
                continue;
            }
        }

        if !static_ok {
            match plugin.read_static().await {
                Ok(values) => {
                    static_cache = values;
                    static_ok = true;
                    info!(
                        instance = %instance_id,
                        category = plugin.category().as_str(),
                        "static data read"
                    );
                }
                Err(err) if err.is_fatal() => {
                    error!(instance = %instance_id, error = %err, "fatal error reading static data, halting worker");
                    health.mark_halted(&err.to_string());
                    break 'main;
                }
                Err(err) => {
                    warn!(instance = %instance_id, error = %err, "static data read failed");
                }
            }
        }

        match plugin.read_dynamic().await {
            Ok(dynamic) => {
                let mut values = static_cache.clone();
                values.extend(dynamic);

                let status_text = values
                    .get(&StandardKey::OperationalInverterStatusText)
                    .and_then(Value::as_str)
                    .map(str::to_owned);

                let mut cycle_successful = true;
                if plugin.category() == DeviceCategory::Inverter {
                    if let Some(status) = status_text.as_deref() {
                        if FULLY_OPERATIONAL_STATUSES.contains(&status) {
                            waiting_polls = 0;
                            if stagnation.observe(&values) {
                                warn!(instance = %instance_id, "power flows static too long, marking cycle failed for the watchdog");
                                cycle_successful = false;
                            }
                        } else if WAITING_STATUSES.contains(&status.to_ascii_lowercase().as_str()) {
                            stagnation.reset();
                            waiting_polls += 1;
                            if waiting_polls >= config.max_consecutive_waiting_polls {
                                warn!(
                                    instance = %instance_id,
                                    polls = waiting_polls,
                                    "device stuck in waiting state, forcing reconnect"
                                );
                                plugin.disconnect().await;
                                waiting_polls = 0;
                            }
                        } else {
                            stagnation.reset();
                            waiting_polls = 0;
                        }
                    }
                }

                if cycle_successful {
                    health.mark_success();
                    let reading = Reading::new(instance_id.clone(), values);
                    if readings.send(reading).await.is_err() {
                        // Aggregator is gone; nothing left to do.
                        break 'main;
                    }

                    if !yesterday_offered {
                        yesterday_offered = true;
                        if let Some(sink) = &config.yesterday_summaries {
                            match plugin.read_yesterday_energy_summary().await {
                                Ok(Some(summary)) => {
                                    let _ = sink.send((instance_id.clone(), summary)).await;
                                }
                                Ok(None) => {}
                                Err(err) => {
                                    debug!(instance = %instance_id, error = %err, "yesterday summary read failed");
                                }
                            }
                        }
                    }
                } else {
                    health.mark_failure("stagnant data", plugin.is_connected());
                }
            }
            Err(err) if err.is_fatal() => {
                error!(instance = %instance_id, error = %err, "fatal error reading dynamic data, halting worker");
                health.mark_halted(&err.to_string());
                break 'main;
            }
            Err(err) => {
                warn!(instance = %instance_id, error = %err, "dynamic read failed");
                health.mark_failure(&err.to_string(), plugin.is_connected());
                if err.is_transient() {
                    plugin.disconnect().await;
                }
            }
        }

        let elapsed = cycle_start.elapsed();
        if elapsed >= config.poll_interval {
            warn!(
                instance = %instance_id,
                elapsed_ms = elapsed.as_millis() as u64,
                interval_ms = config.poll_interval.as_millis() as u64,
                "poll cycle overran its interval"
            );
            continue;
        }

        let remaining = config.poll_interval - elapsed;
        tokio::select! {
            _ = shutdown.recv() => break 'main,
            Some(command) = commands.recv() => {
                match command {
                    WorkerCommand::Reconnect => {
                        warn!(instance = %instance_id, "reconnect ordered by supervisor");
                        plugin.disconnect().await;
                        health.reset_for_reconnect();
                        static_ok = false;
                    }
                }
            }
            _ = sleep(remaining) => {}
        }
    }

    plugin.disconnect().await;
    health.set_status(ConnectionStatus::Disconnected, false);
    info!(instance = %instance_id, "poll worker stopped");
}

/// Detects a frozen communication link: an operational inverter whose
/// power flows are bit-identical for many consecutive polls is almost
/// certainly replaying a stale buffer.
struct StagnationDetector {
    threshold: u32,
    counter: u32,
    last: Option<[Option<String>; 3]>,
}

impl StagnationDetector {
    fn new(threshold: u32) -> Self {
        Self {
            threshold,
            counter: 0,
            last: None,
        }
    }

    /// Feed one cycle's values; returns true when stagnation is declared.
    fn observe(&mut self, values: &ReadingValues) -> bool {
        let subset = [
            values.get(&StandardKey::AcPowerWatts).map(|v| format!("{v:?}")),
            values
                .get(&StandardKey::PvTotalDcPowerWatts)
                .map(|v| format!("{v:?}")),
            values
                .get(&StandardKey::BatteryPowerWatts)
                .map(|v| format!("{v:?}")),
        ];
        if self.last.as_ref() == Some(&subset) {
            self.counter += 1;
        } else {
            self.counter = 0;
        }
        self.last = Some(subset);
        self.counter >= self.threshold
    }

    fn reset(&mut self) {
        self.counter = 0;
        self.last = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{ParamDescriptor, PluginError};
    use async_trait::async_trait;
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicBool, Ordering};

    /// Scripted plugin: each entry drives one dynamic read.
    #[derive(Debug)]
    enum Step {
        Values(Vec<(StandardKey, Value)>),
        Fail(PluginError),
    }

    #[derive(Debug)]
    struct MockPlugin {
        connected: bool,
        connect_results: VecDeque<bool>,
        steps: VecDeque<Step>,
        disconnect_seen: Arc<AtomicBool>,
    }

    impl MockPlugin {
        fn scripted(connect_results: Vec<bool>, steps: Vec<Step>) -> (Self, Arc<AtomicBool>) {
            let flag = Arc::new(AtomicBool::new(false));
            (
                Self {
                    connected: false,
                    connect_results: connect_results.into(),
                    steps: steps.into(),
                    disconnect_seen: flag.clone(),
                },
                flag,
            )
        }
    }

    #[async_trait]
    impl DevicePlugin for MockPlugin {
        fn name(&self) -> &'static str {
            "mock"
        }
        fn pretty_name(&self) -> &'static str {
            "Mock Device"
        }
        fn category(&self) -> DeviceCategory {
            DeviceCategory::Inverter
        }
        fn configurable_params(&self) -> Vec<ParamDescriptor> {
            Vec::new()
        }
        async fn connect(&mut self, _deadline: Duration) -> crate::Result<bool> {
            let ok = self.connect_results.pop_front().unwrap_or(true);
            self.connected = ok;
            Ok(ok)
        }
        async fn disconnect(&mut self) {
            self.connected = false;
            self.disconnect_seen.store(true, Ordering::SeqCst);
        }
        fn is_connected(&self) -> bool {
            self.connected
        }
        async fn read_static(&mut self) -> crate::Result<ReadingValues> {
            let mut values = ReadingValues::new();
            values.insert(StandardKey::StaticDeviceCategory, Value::from("inverter"));
            values.insert(StandardKey::StaticInverterManufacturer, Value::from("Mock"));
            Ok(values)
        }
        async fn read_dynamic(&mut self) -> crate::Result<ReadingValues> {
            match self.steps.pop_front() {
                Some(Step::Values(pairs)) => {
                    let mut values = ReadingValues::new();
                    for (key, value) in pairs {
                        values.insert(key, value);
                    }
                    Ok(values)
                }
                Some(Step::Fail(err)) => Err(err),
                None => Err(PluginError::Timeout("script exhausted".into())),
            }
        }
    }

    fn test_config() -> WorkerConfig {
        WorkerConfig {
            poll_interval: Duration::from_secs(5),
            connect_timeout: Duration::from_secs(2),
            max_reconnect_attempts: 3,
            max_consecutive_waiting_polls: 3,
            stagnation_threshold: 10,
            yesterday_summaries: None,
        }
    }

    fn generating(pv: f64) -> Step {
        Step::Values(vec![
            (StandardKey::OperationalInverterStatusText, Value::from("Generating")),
            (StandardKey::PvTotalDcPowerWatts, Value::from(pv)),
        ])
    }

    #[tokio::test(start_paused = true)]
    async fn worker_emits_static_plus_dynamic_readings() {
        let (plugin, _) = MockPlugin::scripted(vec![true], vec![generating(1500.0)]);
        let (tx, mut rx) = mpsc::channel(8);
        let (shutdown_tx, shutdown_rx) = broadcast::channel(1);

        let handle = spawn_worker("inv".into(), Box::new(plugin), test_config(), tx, shutdown_rx);

        let reading = rx.recv().await.expect("one reading");
        assert_eq!(reading.instance_id, "inv");
        assert_eq!(
            reading.values.get(&StandardKey::StaticInverterManufacturer),
            Some(&Value::from("Mock"))
        );
        assert_eq!(
            reading.values.get(&StandardKey::PvTotalDcPowerWatts),
            Some(&Value::from(1500.0))
        );
        assert_eq!(handle.health.status(), ConnectionStatus::Connected);
        assert!(handle.health.last_successful_poll().is_some());

        let _ = shutdown_tx.send(());
        handle.join.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn transient_error_disconnects_and_reconnects() {
        let (plugin, disconnected) = MockPlugin::scripted(
            vec![true, true],
            vec![
                Step::Fail(PluginError::Timeout("no answer".into())),
                generating(900.0),
            ],
        );
        let (tx, mut rx) = mpsc::channel(8);
        let (shutdown_tx, shutdown_rx) = broadcast::channel(1);

        let handle = spawn_worker("inv".into(), Box::new(plugin), test_config(), tx, shutdown_rx);

        // Second cycle succeeds after the forced reconnect.
        let reading = rx.recv().await.expect("reading after reconnect");
        assert_eq!(
            reading.values.get(&StandardKey::PvTotalDcPowerWatts),
            Some(&Value::from(900.0))
        );
        assert!(disconnected.load(Ordering::SeqCst));

        let _ = shutdown_tx.send(());
        handle.join.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn fatal_error_halts_the_worker() {
        let (plugin, _) = MockPlugin::scripted(
            vec![true],
            vec![Step::Fail(PluginError::Config("bad register map".into()))],
        );
        let (tx, _rx) = mpsc::channel(8);
        let (_shutdown_tx, shutdown_rx) = broadcast::channel(1);

        let handle = spawn_worker("inv".into(), Box::new(plugin), test_config(), tx, shutdown_rx);
        handle.join.await.unwrap();

        assert!(handle.health.is_halted());
        assert_eq!(handle.health.status(), ConnectionStatus::Error);
        assert!(handle.health.last_error().unwrap().contains("bad register map"));
    }

    #[tokio::test(start_paused = true)]
    async fn failed_connects_raise_failure_count() {
        let (plugin, _) = MockPlugin::scripted(vec![false; 50], vec![]);
        let (tx, _rx) = mpsc::channel(8);
        let (shutdown_tx, shutdown_rx) = broadcast::channel(1);

        let handle = spawn_worker("inv".into(), Box::new(plugin), test_config(), tx, shutdown_rx);

        // Let the connect attempts and backoffs play out.
        tokio::time::sleep(Duration::from_secs(30)).await;
        assert!(handle.health.consecutive_failures() >= 3);
        assert_eq!(handle.health.status(), ConnectionStatus::Disconnected);

        let _ = shutdown_tx.send(());
        handle.join.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn exhausted_worker_waits_for_supervisor_command() {
        // Three failed attempts, then a working device.
        let (plugin, _) =
            MockPlugin::scripted(vec![false, false, false, true], vec![generating(700.0)]);
        let (tx, mut rx) = mpsc::channel(8);
        let (shutdown_tx, shutdown_rx) = broadcast::channel(1);

        let handle = spawn_worker("inv".into(), Box::new(plugin), test_config(), tx, shutdown_rx);

        // Attempts and backoffs take about fourteen seconds; well past
        // that the worker must sit at exactly the attempt-limit failure
        // count, making no progress on its own.
        tokio::time::sleep(Duration::from_secs(120)).await;
        assert_eq!(handle.health.consecutive_failures(), 3);
        assert!(rx.try_recv().is_err());

        // One supervisor command wakes it up and the next connect works.
        handle.commands.send(WorkerCommand::Reconnect).await.unwrap();
        let reading = rx.recv().await.expect("reading after ordered reconnect");
        assert_eq!(
            reading.values.get(&StandardKey::PvTotalDcPowerWatts),
            Some(&Value::from(700.0))
        );
        assert_eq!(handle.health.status(), ConnectionStatus::Connected);

        let _ = shutdown_tx.send(());
        handle.join.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn structural_decode_error_halts_the_worker() {
        let (plugin, _) = MockPlugin::scripted(
            vec![true],
            vec![Step::Fail(PluginError::Decode(
                "state payload is 100 bytes, expected 144".into(),
            ))],
        );
        let (tx, _rx) = mpsc::channel(8);
        let (_shutdown_tx, shutdown_rx) = broadcast::channel(1);

        let handle = spawn_worker("inv".into(), Box::new(plugin), test_config(), tx, shutdown_rx);
        handle.join.await.unwrap();

        assert!(handle.health.is_halted());
        assert_eq!(handle.health.status(), ConnectionStatus::Error);
    }

    #[test]
    fn stagnation_triggers_after_threshold_identical_polls() {
        let mut detector = StagnationDetector::new(3);
        let mut values = ReadingValues::new();
        values.insert(StandardKey::AcPowerWatts, Value::from(500.0));
        values.insert(StandardKey::PvTotalDcPowerWatts, Value::from(1200.0));
        values.insert(StandardKey::BatteryPowerWatts, Value::from(-700.0));

        assert!(!detector.observe(&values)); // first sight
        assert!(!detector.observe(&values)); // counter 1
        assert!(!detector.observe(&values)); // counter 2
        assert!(detector.observe(&values)); // counter 3 == threshold

        // Any change resets the streak.
        values.insert(StandardKey::AcPowerWatts, Value::from(501.0));
        assert!(!detector.observe(&values));
    }
}
