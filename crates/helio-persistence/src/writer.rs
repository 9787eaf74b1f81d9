//! ---
//! helio_section: "03-persistence-logging"
//! helio_subsection: "module"
//! helio_type: "source"
//! helio_scope: "code"
//! helio_description: "History persistence over SQLite."
//! helio_version: "v0.4.2"
//! helio_owner: "tbd"
//! ---
//! The dedicated history writer task.
//!
//! Samples the latest published snapshot on a fixed interval, keeps
//! today's summary row current, prunes old rows once an hour, and
//! backfills yesterday's summary from device-reported totals when the
//! database has no row for it.

use std::time::Duration;

use chrono::Utc;
use chrono_tz::Tz;
use helio_common::time::{local_date_of, local_date_string};
use helio_core::publisher::Subscription;
use helio_types::{ReadingValues, StandardKey};
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, error, info, warn};

use crate::store::{DailySummary, HistoryStore, PowerSample};
use crate::Result;

/// Device-reported totals for yesterday, sent by a worker shortly after
/// its first successful poll.
pub type YesterdaySummary = (String, ReadingValues);

#[derive(Debug, Clone)]
pub struct WriterConfig {
    pub snapshot_interval: Duration,
    pub history_max_age_hours: u64,
    pub timezone: Tz,
}

/// Owns the store; writes are ordered by snapshot version because this
/// task is the only writer and samples versions monotonically.
pub struct HistoryWriter {
    store: HistoryStore,
    config: WriterConfig,
    last_written_version: u64,
}

impl HistoryWriter {
    pub fn new(store: HistoryStore, config: WriterConfig) -> Self {
        Self {
            store,
            config,
            last_written_version: 0,
        }
    }

    /// Run until shutdown.
    pub async fn run(
        mut self,
        mut snapshots: Subscription,
        mut yesterday_rx: mpsc::Receiver<YesterdaySummary>,
        mut shutdown: broadcast::Receiver<()>,
    ) {
        info!(
            interval_s = self.config.snapshot_interval.as_secs(),
            "history writer started"
        );
        let mut ticker = tokio::time::interval(self.config.snapshot_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        let mut prune_ticker = tokio::time::interval(Duration::from_secs(3600));

        loop {
            tokio::select! {
                _ = shutdown.recv() => {
                    // A final full-state dump helps post-mortems after an
                    // unclean field shutdown.
                    if let Err(err) = self.dump_state(&mut snapshots) {
                        warn!(error = %err, "final state dump failed");
                    }
                    info!("history writer shutting down");
                    return;
                }
                _ = ticker.tick() => {
                    if let Err(err) = self.sample(&mut snapshots) {
                        error!(error = %err, "history write failed");
                    }
                }
                _ = prune_ticker.tick() => {
                    if let Err(err) = self.store.prune(Utc::now(), self.config.history_max_age_hours) {
                        error!(error = %err, "history prune failed");
                    }
                }
                Some((instance, values)) = yesterday_rx.recv() => {
                    if let Err(err) = self.backfill_yesterday(&instance, &values) {
                        error!(instance = %instance, error = %err, "yesterday backfill failed");
                    }
                }
            }
        }
    }

    /// Write one power row and refresh today's summary from the latest
    /// snapshot.
    fn sample(&mut self, snapshots: &mut Subscription) -> Result<()> {
        let snapshot = snapshots.latest();
        if snapshot.snapshot_version == 0 {
            debug!("no data published yet, skipping sample");
            return Ok(());
        }
        if snapshot.snapshot_version <= self.last_written_version {
            debug!(
                version = snapshot.snapshot_version,
                "snapshot unchanged since last sample"
            );
            return Ok(());
        }
        self.last_written_version = snapshot.snapshot_version;

        let sample = PowerSample {
            ts_ms_utc: snapshot.server_timestamp_ms_utc,
            soc_percent: snapshot.get_f64(StandardKey::BatteryStateOfChargePercent),
            pv_w: snapshot.get_f64(StandardKey::PvTotalDcPowerWatts),
            battery_w: snapshot.get_f64(StandardKey::BatteryPowerWatts),
            load_w: snapshot.get_f64(StandardKey::LoadTotalPowerWatts),
            grid_w_signed: snapshot.get_f64(StandardKey::GridTotalActivePowerWatts),
        };
        self.store.record_power_sample(&sample)?;

        let summary = DailySummary {
            pv_yield_kwh: snapshot.get_f64(StandardKey::EnergyPvDailyKwh).unwrap_or(0.0),
            battery_charge_kwh: snapshot
                .get_f64(StandardKey::EnergyBatteryDailyChargeKwh)
                .unwrap_or(0.0),
            battery_discharge_kwh: snapshot
                .get_f64(StandardKey::EnergyBatteryDailyDischargeKwh)
                .unwrap_or(0.0),
            grid_import_kwh: snapshot
                .get_f64(StandardKey::EnergyGridDailyImportKwh)
                .unwrap_or(0.0),
            grid_export_kwh: snapshot
                .get_f64(StandardKey::EnergyGridDailyExportKwh)
                .unwrap_or(0.0),
            load_energy_kwh: snapshot.get_f64(StandardKey::EnergyLoadDailyKwh).unwrap_or(0.0),
        }
        .with_load_fallback();

        let today = helio_common::time::local_date(self.config.timezone);
        self.store.upsert_daily_summary(today, &summary)?;
        debug!(
            version = snapshot.snapshot_version,
            date = %local_date_string(self.config.timezone),
            "history sample written"
        );
        Ok(())
    }

    /// Append the full current state as one timestamped row.
    fn dump_state(&mut self, snapshots: &mut Subscription) -> Result<()> {
        let snapshot = snapshots.latest();
        if snapshot.snapshot_version == 0 {
            return Ok(());
        }
        let blob = serde_json::to_string(snapshot.as_ref())?;
        self.store
            .record_state_snapshot(snapshot.server_timestamp_ms_utc, &blob)?;
        Ok(())
    }

    /// Store yesterday's summary from device totals unless a row already
    /// exists for that date.
    fn backfill_yesterday(&mut self, instance: &str, values: &ReadingValues) -> Result<()> {
        let yesterday = local_date_of(Utc::now(), self.config.timezone)
            .pred_opt()
            .expect("calendar has a yesterday");
        if self.store.daily_summary(yesterday)?.is_some() {
            debug!(date = %yesterday, "summary already present, no backfill needed");
            return Ok(());
        }

        let get = |key: StandardKey| values.get(&key).and_then(|v| v.as_f64()).unwrap_or(0.0);
        let summary = DailySummary {
            pv_yield_kwh: get(StandardKey::EnergyPvDailyKwh),
            battery_charge_kwh: get(StandardKey::EnergyBatteryDailyChargeKwh),
            battery_discharge_kwh: get(StandardKey::EnergyBatteryDailyDischargeKwh),
            grid_import_kwh: get(StandardKey::EnergyGridDailyImportKwh),
            grid_export_kwh: get(StandardKey::EnergyGridDailyExportKwh),
            load_energy_kwh: get(StandardKey::EnergyLoadDailyKwh),
        }
        .with_load_fallback();

        if summary.is_empty() {
            warn!(instance, "device offered no usable totals for yesterday");
            return Ok(());
        }
        self.store.upsert_daily_summary(yesterday, &summary)?;
        info!(instance, date = %yesterday, "yesterday's summary backfilled from device totals");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use helio_types::{Snapshot, Value};
    use indexmap::IndexMap;
    use std::sync::Arc;
    use tokio::sync::watch;

    fn snapshot(version: u64, pv_daily: f64) -> Arc<Snapshot> {
        let mut snapshot = Snapshot::empty();
        snapshot.snapshot_version = version;
        snapshot.server_timestamp_ms_utc = Utc::now().timestamp_millis();
        snapshot.values.insert(StandardKey::PvTotalDcPowerWatts, Value::Number(1500.0));
        snapshot
            .values
            .insert(StandardKey::BatteryStateOfChargePercent, Value::Number(64.0));
        snapshot.values.insert(StandardKey::EnergyPvDailyKwh, Value::Number(pv_daily));
        snapshot.into_shared()
    }

    fn writer() -> HistoryWriter {
        HistoryWriter::new(
            HistoryStore::open_in_memory().unwrap(),
            WriterConfig {
                snapshot_interval: Duration::from_secs(60),
                history_max_age_hours: 168,
                timezone: chrono_tz::UTC,
            },
        )
    }

    #[test]
    fn sampling_writes_power_row_and_summary() {
        let mut writer = writer();
        let (tx, rx) = watch::channel(snapshot(5, 7.5));
        let publisher = helio_core::Publisher::new(rx);
        let mut subscription = publisher.subscribe(None);

        writer.sample(&mut subscription).unwrap();
        assert_eq!(writer.store.power_history_len().unwrap(), 1);
        let today = helio_common::time::local_date(chrono_tz::UTC);
        let summary = writer.store.daily_summary(today).unwrap().unwrap();
        assert_eq!(summary.pv_yield_kwh, 7.5);
        // Load fell back to the balance.
        assert_eq!(summary.load_energy_kwh, 7.5);

        // The same version does not produce a second row.
        writer.sample(&mut subscription).unwrap();
        assert_eq!(writer.store.power_history_len().unwrap(), 1);
        drop(tx);
    }

    #[test]
    fn version_zero_snapshots_are_skipped() {
        let mut writer = writer();
        let (_tx, rx) = watch::channel(Snapshot::empty().into_shared());
        let publisher = helio_core::Publisher::new(rx);
        let mut subscription = publisher.subscribe(None);
        writer.sample(&mut subscription).unwrap();
        assert_eq!(writer.store.power_history_len().unwrap(), 0);
    }

    #[test]
    fn backfill_writes_once() {
        let mut writer = writer();
        let mut values: ReadingValues = IndexMap::new();
        values.insert(StandardKey::EnergyPvDailyKwh, Value::Number(11.0));
        values.insert(StandardKey::EnergyGridDailyImportKwh, Value::Number(2.0));

        writer.backfill_yesterday("inv", &values).unwrap();
        let yesterday = local_date_of(Utc::now(), chrono_tz::UTC).pred_opt().unwrap();
        let summary = writer.store.daily_summary(yesterday).unwrap().unwrap();
        assert_eq!(summary.pv_yield_kwh, 11.0);
        assert_eq!(summary.load_energy_kwh, 13.0);

        // A second offer does not clobber the stored row.
        let mut other: ReadingValues = IndexMap::new();
        other.insert(StandardKey::EnergyPvDailyKwh, Value::Number(99.0));
        writer.backfill_yesterday("inv2", &other).unwrap();
        let summary = writer.store.daily_summary(yesterday).unwrap().unwrap();
        assert_eq!(summary.pv_yield_kwh, 11.0);
    }
}
