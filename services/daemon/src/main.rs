//! ---
//! helio_section: "01-core-functionality"
//! helio_subsection: "service"
//! helio_type: "source"
//! helio_scope: "code"
//! helio_description: "Daemon entrypoint wiring workers, core and persistence."
//! helio_version: "v0.4.2"
//! helio_owner: "tbd"
//! ---
//! The monitoring daemon.
//!
//! Wires the configured plugin instances into poll workers, the workers
//! into the aggregator, the aggregator into the publisher and history
//! writer, and puts the supervisor in charge of the lot. Exit codes: 0
//! clean shutdown, 1 configuration error, 2 watchdog escalation, 3
//! unrecoverable startup failure.

use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use helio_common::config::AppConfig;
use helio_common::{
    init_tracing, EXIT_CONFIG_ERROR, EXIT_OK, EXIT_STARTUP_FAILURE, EXIT_WATCHDOG_ESCALATION,
};
use helio_core::aggregator::{Aggregator, AggregatorConfig};
use helio_core::filter::AdaptiveFilter;
use helio_core::publisher::Publisher;
use helio_core::supervisor::{
    new_health_registry, Availability, Supervisor, SupervisorConfig, SupervisorExit,
};
use helio_persistence::{HistoryStore, HistoryWriter, WriterConfig};
use helio_plugins::registry::{PluginContext, PluginRegistry};
use helio_plugins::worker::WorkerConfig;
use helio_types::Snapshot;
use tokio::sync::{broadcast, mpsc, watch};
use tracing::{error, info};

const DEFAULT_CONFIG_CANDIDATES: &[&str] = &[
    "config/helio.conf",
    "helio.conf",
    "/etc/helio/helio.conf",
];

#[derive(Debug, Parser)]
#[command(name = "helio-daemon", about = "Solar energy monitoring daemon")]
struct Cli {
    /// Configuration file path (overrides the search list and HELIO_CONFIG).
    #[arg(long)]
    config: Option<PathBuf>,
}

#[tokio::main]
async fn main() {
    let code = run().await;
    std::process::exit(code);
}

async fn run() -> i32 {
    let cli = Cli::parse();

    let loaded = if let Some(path) = &cli.config {
        AppConfig::load_with_source(&[path.clone()])
    } else {
        AppConfig::load_with_source(DEFAULT_CONFIG_CANDIDATES)
    };
    let loaded = match loaded {
        Ok(loaded) => loaded,
        Err(err) => {
            eprintln!("configuration error: {err:#}");
            return EXIT_CONFIG_ERROR;
        }
    };
    let config = loaded.config;

    if let Err(err) = init_tracing("helio-daemon", &config.logging) {
        eprintln!("failed to initialise logging: {err:#}");
        return EXIT_STARTUP_FAILURE;
    }
    info!(
        config = %loaded.source.display(),
        instances = config.general.plugin_instances.len(),
        "helio daemon starting"
    );

    let store = match HistoryStore::open(&config.database.db_file) {
        Ok(store) => store,
        Err(err) => {
            error!(error = %err, db = %config.database.db_file.display(), "cannot open history store");
            return EXIT_STARTUP_FAILURE;
        }
    };

    let registry = PluginRegistry::with_builtins();
    let context = PluginContext {
        system: config.inverter_system.clone(),
    };

    // Channel plumbing: bounded readings into the single aggregator,
    // coalescing snapshot fan-out, broadcast shutdown.
    let (readings_tx, readings_rx) = mpsc::channel(100);
    let (snapshot_tx, snapshot_rx) = watch::channel(Snapshot::empty().into_shared());
    let (shutdown_tx, _) = broadcast::channel(16);
    let (yesterday_tx, yesterday_rx) = mpsc::channel(8);

    let health = new_health_registry();
    let availability = Availability::new();
    let publisher = Publisher::new(snapshot_rx.clone());

    let filter = AdaptiveFilter::new(
        config.filter.clone(),
        config.inverter_system.clone(),
        config.general.local_timezone,
    );
    let aggregator = Aggregator::new(
        AggregatorConfig {
            system: config.inverter_system.clone(),
        },
        filter,
        health.clone(),
        availability.clone(),
        snapshot_tx,
    );

    let mut supervisor = Supervisor::new(
        SupervisorConfig::new(config.watchdog.clone(), config.general.shutdown_grace),
        health.clone(),
        availability.clone(),
        readings_tx.clone(),
        shutdown_tx.clone(),
    );
    // Keep our own sender alive only until every worker holds a clone.
    drop(readings_tx);

    let registry = Arc::new(registry);
    let context = Arc::new(context);
    for (name, instance) in &config.instances {
        let worker_config = WorkerConfig {
            poll_interval: config.general.poll_interval,
            connect_timeout: instance.modbus_timeout,
            max_reconnect_attempts: config.general.max_reconnect_attempts,
            max_consecutive_waiting_polls: instance.max_consecutive_waiting_polls,
            stagnation_threshold: WorkerConfig::stagnation_threshold_for(
                config.general.poll_interval,
            ),
            yesterday_summaries: Some(yesterday_tx.clone()),
        };
        let registry = registry.clone();
        let context = context.clone();
        let instance_config = instance.clone();
        let factory = Box::new(move || registry.build(&instance_config, &context));

        if let Err(err) = supervisor.adopt(name, factory, worker_config) {
            error!(instance = %name, error = %err, "cannot start plugin instance");
            return if err.is_fatal() {
                EXIT_CONFIG_ERROR
            } else {
                EXIT_STARTUP_FAILURE
            };
        }
        info!(instance = %name, plugin_type = %instance.plugin_type, "instance adopted");
    }
    drop(yesterday_tx);

    let aggregator_task = tokio::spawn(aggregator.run(readings_rx));

    let writer = HistoryWriter::new(
        store,
        WriterConfig {
            snapshot_interval: config.database.power_history_interval,
            history_max_age_hours: config.database.history_max_age_hours,
            timezone: config.general.local_timezone,
        },
    );
    let writer_task = tokio::spawn(writer.run(
        publisher.subscribe(None),
        yesterday_rx,
        shutdown_tx.subscribe(),
    ));

    let mut supervisor_task = tokio::spawn(supervisor.run());

    let exit = tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("shutdown signal received");
            let _ = shutdown_tx.send(());
            supervisor_task.await.unwrap_or(SupervisorExit::Shutdown)
        }
        result = &mut supervisor_task => {
            let exit = result.unwrap_or(SupervisorExit::Shutdown);
            // Make sure the rest of the runtime winds down too.
            let _ = shutdown_tx.send(());
            exit
        }
    };

    let _ = writer_task.await;
    aggregator_task.abort();

    match exit {
        SupervisorExit::Shutdown => {
            info!("clean shutdown complete");
            EXIT_OK
        }
        SupervisorExit::WatchdogEscalation { instance } => {
            error!(instance = %instance, "exiting after watchdog escalation");
            EXIT_WATCHDOG_ESCALATION
        }
    }
}
