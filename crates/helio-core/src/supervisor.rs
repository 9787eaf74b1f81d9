//! ---
//! helio_section: "07-resilience-fault-tolerance"
//! helio_subsection: "module"
//! helio_type: "source"
//! helio_scope: "code"
//! helio_description: "Watchdog, worker recreation and availability fan-out."
//! helio_version: "v0.4.2"
//! helio_owner: "tbd"
//! ---
//! Three independent supervision layers.
//!
//! The poll-freshness watchdog orders reconnects for stuck workers and
//! escalates to process exit after repeated fires. The liveness monitor
//! recreates workers whose tasks died unexpectedly. The availability
//! layer marks long-silent instances offline in the published snapshots.
//! The supervisor never touches the system state; it only reads worker
//! health and sends worker commands.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, Instant};

use helio_common::config::WatchdogConfig;
use helio_plugins::worker::{spawn_worker, WorkerCommand, WorkerConfig, WorkerHandle, WorkerHealth};
use helio_plugins::DevicePlugin;
use helio_types::Reading;
use indexmap::IndexMap;
use parking_lot::Mutex;
use tokio::sync::{broadcast, mpsc};
use tracing::{error, info, warn};

/// Shared view of every worker's health, read by the aggregator when it
/// stamps snapshots.
pub type HealthRegistry = Arc<Mutex<IndexMap<String, Arc<WorkerHealth>>>>;

pub fn new_health_registry() -> HealthRegistry {
    Arc::new(Mutex::new(IndexMap::new()))
}

/// Instances currently considered offline by the availability layer.
#[derive(Debug, Clone, Default)]
pub struct Availability {
    offline: Arc<Mutex<HashSet<String>>>,
}

impl Availability {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_offline(&self, instance: &str) -> bool {
        self.offline.lock().contains(instance)
    }

    fn set_offline(&self, instance: &str, offline: bool) {
        let mut set = self.offline.lock();
        if offline {
            if set.insert(instance.to_owned()) {
                warn!(instance, "instance marked offline for subscribers");
            }
        } else if set.remove(instance) {
            info!(instance, "instance back online");
        }
    }
}

/// What the watchdog decided for one instance at one evaluation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatchdogDecision {
    /// Order a disconnect + reconnect.
    Reconnect,
    /// Too many consecutive fires; the process must exit with the
    /// dedicated code.
    Escalate,
}

#[derive(Debug, Default)]
struct InstanceWatchState {
    fires: u32,
    last_fire: Option<Instant>,
}

/// Pure decision state for the poll-freshness watchdog, separated from
/// the driving loop so the schedule is testable without waiting.
#[derive(Debug)]
pub struct WatchdogTracker {
    config: WatchdogConfig,
    process_start: Instant,
    instances: HashMap<String, InstanceWatchState>,
}

impl WatchdogTracker {
    pub fn new(config: WatchdogConfig, process_start: Instant) -> Self {
        Self {
            config,
            process_start,
            instances: HashMap::new(),
        }
    }

    /// Evaluate one instance. `last_success` is the newest successful
    /// poll, `worker_started` when the current worker task began.
    pub fn decide(
        &mut self,
        instance: &str,
        last_success: Option<Instant>,
        worker_started: Instant,
        now: Instant,
    ) -> Option<WatchdogDecision> {
        if now.duration_since(self.process_start) < self.config.grace_period {
            return None;
        }

        let state = self.instances.entry(instance.to_owned()).or_default();

        // A success newer than the last fire clears the streak.
        if let (Some(success), Some(fire)) = (last_success, state.last_fire) {
            if success > fire {
                state.fires = 0;
                state.last_fire = None;
            }
        }

        // After a fire the worker gets a full timeout to come back before
        // the next decision.
        let reference = state
            .last_fire
            .or(last_success)
            .unwrap_or_else(|| worker_started + self.config.grace_period);
        if now.duration_since(reference) <= self.config.timeout {
            return None;
        }

        if state.fires >= self.config.max_plugin_reload_attempts {
            return Some(WatchdogDecision::Escalate);
        }
        state.fires += 1;
        state.last_fire = Some(now);
        Some(WatchdogDecision::Reconnect)
    }
}

/// Why the supervisor loop ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SupervisorExit {
    /// Clean shutdown was requested.
    Shutdown,
    /// Watchdog escalation: the named instance would not recover.
    WatchdogEscalation { instance: String },
}

#[derive(Debug, Clone)]
pub struct SupervisorConfig {
    pub watchdog: WatchdogConfig,
    /// Evaluation cadence.
    pub tick: Duration,
    /// How long workers get to release their transports at shutdown.
    pub shutdown_grace: Duration,
}

impl SupervisorConfig {
    pub fn new(watchdog: WatchdogConfig, shutdown_grace: Duration) -> Self {
        Self {
            watchdog,
            tick: Duration::from_secs(15),
            shutdown_grace,
        }
    }
}

/// Builds a fresh plugin for worker recreation.
pub type PluginFactory =
    Box<dyn Fn() -> helio_plugins::Result<Box<dyn DevicePlugin>> + Send + Sync>;

struct SupervisedInstance {
    factory: PluginFactory,
    worker_config: WorkerConfig,
    handle: WorkerHandle,
    worker_started: Instant,
}

/// Owns the worker handles and drives all three supervision layers.
pub struct Supervisor {
    config: SupervisorConfig,
    tracker: WatchdogTracker,
    instances: IndexMap<String, SupervisedInstance>,
    registry: HealthRegistry,
    availability: Availability,
    readings: mpsc::Sender<Reading>,
    shutdown: broadcast::Sender<()>,
}

impl Supervisor {
    pub fn new(
        config: SupervisorConfig,
        registry: HealthRegistry,
        availability: Availability,
        readings: mpsc::Sender<Reading>,
        shutdown: broadcast::Sender<()>,
    ) -> Self {
        let tracker = WatchdogTracker::new(config.watchdog.clone(), Instant::now());
        Self {
            config,
            tracker,
            instances: IndexMap::new(),
            registry,
            availability,
            readings,
            shutdown,
        }
    }

    /// Spawn and adopt the worker for one configured instance.
    pub fn adopt(
        &mut self,
        instance_id: &str,
        factory: PluginFactory,
        worker_config: WorkerConfig,
    ) -> helio_plugins::Result<()> {
        let plugin = factory()?;
        let handle = spawn_worker(
            instance_id.to_owned(),
            plugin,
            worker_config.clone(),
            self.readings.clone(),
            self.shutdown.subscribe(),
        );
        self.registry
            .lock()
            .insert(instance_id.to_owned(), handle.health.clone());
        self.instances.insert(
            instance_id.to_owned(),
            SupervisedInstance {
                factory,
                worker_config,
                handle,
                worker_started: Instant::now(),
            },
        );
        Ok(())
    }

    /// Run the supervision loop until shutdown or escalation.
    pub async fn run(mut self) -> SupervisorExit {
        let mut shutdown_rx = self.shutdown.subscribe();
        let mut ticker = tokio::time::interval(self.config.tick);
        info!(
            timeout_s = self.config.watchdog.timeout.as_secs(),
            grace_s = self.config.watchdog.grace_period.as_secs(),
            "supervisor started"
        );
        loop {
            tokio::select! {
                _ = shutdown_rx.recv() => {
                    info!("supervisor shutting down");
                    let grace = self.config.shutdown_grace;
                    self.force_stop(grace).await;
                    return SupervisorExit::Shutdown;
                }
                _ = ticker.tick() => {
                    if let Some(exit) = self.evaluate_once(Instant::now()).await {
                        return exit;
                    }
                }
            }
        }
    }

    /// One evaluation sweep over every instance.
    async fn evaluate_once(&mut self, now: Instant) -> Option<SupervisorExit> {
        let ids: Vec<String> = self.instances.keys().cloned().collect();
        for id in ids {
            // Layer 2: recreate workers whose task terminated unexpectedly.
            let finished = self.instances[&id].handle.join.is_finished();
            if finished {
                if self.instances[&id].handle.health.is_halted() {
                    // Halted on purpose (fatal config/decode error); a
                    // recreate would just halt again.
                    self.availability.set_offline(&id, true);
                    continue;
                }
                warn!(instance = %id, "worker task terminated unexpectedly, recreating");
                if let Err(err) = self.recreate(&id).await {
                    error!(instance = %id, error = %err, "worker recreation failed");
                }
                continue;
            }

            let (last_success, worker_started) = {
                let entry = &self.instances[&id];
                (entry.handle.health.last_successful_poll(), entry.worker_started)
            };

            // Layer 1: poll-freshness watchdog.
            match self.tracker.decide(&id, last_success, worker_started, now) {
                Some(WatchdogDecision::Reconnect) => {
                    warn!(instance = %id, "watchdog firing, ordering reconnect");
                    let _ = self.instances[&id]
                        .handle
                        .commands
                        .send(WorkerCommand::Reconnect)
                        .await;
                }
                Some(WatchdogDecision::Escalate) => {
                    error!(instance = %id, "watchdog escalation, giving up on this process");
                    return Some(SupervisorExit::WatchdogEscalation { instance: id });
                }
                None => {}
            }

            // Layer 3: availability for subscribers.
            let silent_for = last_success
                .map(|t| now.duration_since(t))
                .unwrap_or_else(|| now.duration_since(worker_started));
            self.availability
                .set_offline(&id, silent_for > self.config.watchdog.stale_data_timeout);
        }
        None
    }

    async fn recreate(&mut self, instance_id: &str) -> helio_plugins::Result<()> {
        let entry = self.instances.get_mut(instance_id).expect("known instance");
        let plugin = (entry.factory)()?;
        let handle = spawn_worker(
            instance_id.to_owned(),
            plugin,
            entry.worker_config.clone(),
            self.readings.clone(),
            self.shutdown.subscribe(),
        );
        self.registry
            .lock()
            .insert(instance_id.to_owned(), handle.health.clone());
        entry.handle = handle;
        entry.worker_started = Instant::now();
        info!(instance = %instance_id, "worker recreated");
        Ok(())
    }

    /// Abort any workers that outlive the shutdown grace period.
    pub async fn force_stop(self, grace: Duration) {
        let deadline = Instant::now() + grace;
        for (id, entry) in self.instances {
            let remaining = deadline.saturating_duration_since(Instant::now());
            let joined = tokio::time::timeout(remaining, entry.handle.join).await;
            if joined.is_err() {
                warn!(instance = %id, "worker did not stop within grace, aborting");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> WatchdogConfig {
        WatchdogConfig {
            timeout: Duration::from_secs(120),
            grace_period: Duration::from_secs(30),
            max_plugin_reload_attempts: 3,
            stale_data_timeout: Duration::from_secs(900),
        }
    }

    #[test]
    fn watchdog_escalates_after_three_fires() {
        let base = Instant::now();
        let mut tracker = WatchdogTracker::new(config(), base);
        let last_success = Some(base);

        // Reconnects at roughly one timeout apart, escalation on the
        // fourth evaluation past the threshold.
        assert_eq!(
            tracker.decide("inv", last_success, base, base + Duration::from_secs(121)),
            Some(WatchdogDecision::Reconnect)
        );
        assert_eq!(
            tracker.decide("inv", last_success, base, base + Duration::from_secs(242)),
            Some(WatchdogDecision::Reconnect)
        );
        assert_eq!(
            tracker.decide("inv", last_success, base, base + Duration::from_secs(363)),
            Some(WatchdogDecision::Reconnect)
        );
        assert_eq!(
            tracker.decide("inv", last_success, base, base + Duration::from_secs(484)),
            Some(WatchdogDecision::Escalate)
        );
    }

    #[test]
    fn watchdog_stays_quiet_between_fires() {
        let base = Instant::now();
        let mut tracker = WatchdogTracker::new(config(), base);
        let last_success = Some(base);
        assert_eq!(
            tracker.decide("inv", last_success, base, base + Duration::from_secs(121)),
            Some(WatchdogDecision::Reconnect)
        );
        // Fifteen seconds later the worker still has time to recover.
        assert_eq!(
            tracker.decide("inv", last_success, base, base + Duration::from_secs(136)),
            None
        );
    }

    #[test]
    fn success_after_a_fire_resets_the_streak() {
        let base = Instant::now();
        let mut tracker = WatchdogTracker::new(config(), base);
        assert_eq!(
            tracker.decide("inv", Some(base), base, base + Duration::from_secs(121)),
            Some(WatchdogDecision::Reconnect)
        );
        // The reconnect worked; a fresh poll landed.
        let fresh = Some(base + Duration::from_secs(150));
        assert_eq!(
            tracker.decide("inv", fresh, base, base + Duration::from_secs(200)),
            None
        );
        // The next stall starts counting from one again.
        assert_eq!(
            tracker.decide("inv", fresh, base, base + Duration::from_secs(275)),
            Some(WatchdogDecision::Reconnect)
        );
        assert_eq!(tracker.instances["inv"].fires, 1);
    }

    #[test]
    fn grace_period_suppresses_early_fires() {
        let base = Instant::now();
        let mut tracker = WatchdogTracker::new(config(), base);
        assert_eq!(
            tracker.decide("inv", None, base, base + Duration::from_secs(10)),
            None
        );
    }

    #[test]
    fn worker_with_no_first_poll_eventually_fires() {
        let base = Instant::now();
        let mut tracker = WatchdogTracker::new(config(), base);
        // No success ever: fires once grace + timeout elapse after start.
        assert_eq!(
            tracker.decide("inv", None, base, base + Duration::from_secs(100)),
            None
        );
        assert_eq!(
            tracker.decide("inv", None, base, base + Duration::from_secs(151)),
            Some(WatchdogDecision::Reconnect)
        );
    }

    #[test]
    fn availability_flips_both_ways() {
        let availability = Availability::new();
        availability.set_offline("inv", true);
        assert!(availability.is_offline("inv"));
        availability.set_offline("inv", false);
        assert!(!availability.is_offline("inv"));
    }
}
