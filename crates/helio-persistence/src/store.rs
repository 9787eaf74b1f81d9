//! ---
//! helio_section: "03-persistence-logging"
//! helio_subsection: "module"
//! helio_type: "source"
//! helio_scope: "code"
//! helio_description: "History persistence over SQLite."
//! helio_version: "v0.4.2"
//! helio_owner: "tbd"
//! ---
use std::path::Path;
use std::time::Duration;

use chrono::{DateTime, NaiveDate, TimeZone, Utc};
use chrono_tz::Tz;
use rusqlite::{params, Connection, ErrorCode, OptionalExtension};
use tracing::{debug, info, warn};

use crate::{Result, StoreError};

/// SQLite is single-writer; short transactions plus bounded retry cover
/// the occasional reader holding the lock.
const BUSY_RETRY_ATTEMPTS: u32 = 5;
const BUSY_RETRY_BASE: Duration = Duration::from_millis(50);

/// One row of the rolling power history.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PowerSample {
    pub ts_ms_utc: i64,
    pub soc_percent: Option<f64>,
    pub pv_w: Option<f64>,
    pub battery_w: Option<f64>,
    pub load_w: Option<f64>,
    /// Signed grid power: negative importing, positive exporting.
    pub grid_w_signed: Option<f64>,
}

/// One day's energy flows.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct DailySummary {
    pub pv_yield_kwh: f64,
    pub battery_charge_kwh: f64,
    pub battery_discharge_kwh: f64,
    pub grid_import_kwh: f64,
    pub grid_export_kwh: f64,
    pub load_energy_kwh: f64,
}

impl DailySummary {
    /// Fill a missing load figure from the energy balance.
    pub fn with_load_fallback(mut self) -> Self {
        if self.load_energy_kwh <= 0.0 {
            let balance = (self.pv_yield_kwh + self.battery_discharge_kwh + self.grid_import_kwh)
                - (self.battery_charge_kwh + self.grid_export_kwh);
            self.load_energy_kwh = balance.max(0.0);
        }
        self
    }

    /// Whether every flow is effectively zero; such rows are not stored.
    pub fn is_empty(&self) -> bool {
        [
            self.pv_yield_kwh,
            self.battery_charge_kwh,
            self.battery_discharge_kwh,
            self.grid_import_kwh,
            self.grid_export_kwh,
            self.load_energy_kwh,
        ]
        .iter()
        .all(|v| *v < 0.01)
    }
}

/// Energy flow breakdown of one hour, integrated from the power history.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct HourlyBreakdown {
    pub hour: u32,
    pub battery_charge_kwh: f64,
    pub battery_discharge_kwh: f64,
    pub grid_import_kwh: f64,
    pub grid_export_kwh: f64,
    pub solar_to_load_kwh: f64,
}

/// The SQLite history store. Owned by the writer task; never shared.
pub struct HistoryStore {
    conn: Connection,
}

impl HistoryStore {
    /// Open (or create) the database, enable WAL and ensure the schema.
    pub fn open(path: &Path) -> Result<Self> {
        info!(db = %path.display(), "opening history store");
        let conn = Connection::open(path)?;
        Self::initialize(conn)
    }

    /// In-memory store for tests.
    pub fn open_in_memory() -> Result<Self> {
        Self::initialize(Connection::open_in_memory()?)
    }

    fn initialize(conn: Connection) -> Result<Self> {
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS power_history (
                 timestamp INTEGER PRIMARY KEY,
                 soc REAL,
                 pv_w REAL,
                 batt_w REAL,
                 load_w REAL,
                 grid_w_signed REAL
             );
             CREATE TABLE IF NOT EXISTS state_history (
                 timestamp INTEGER PRIMARY KEY,
                 json_blob TEXT NOT NULL
             );
             CREATE TABLE IF NOT EXISTS daily_summary (
                 date TEXT PRIMARY KEY,
                 pv_yield_kwh REAL,
                 battery_charge_kwh REAL,
                 battery_discharge_kwh REAL,
                 grid_import_kwh REAL,
                 grid_export_kwh REAL,
                 load_energy_kwh REAL
             );
             CREATE VIEW IF NOT EXISTS monthly_summary AS
                 SELECT substr(date, 1, 7) AS month,
                        SUM(pv_yield_kwh) AS pv_yield_kwh,
                        SUM(battery_charge_kwh) AS battery_charge_kwh,
                        SUM(battery_discharge_kwh) AS battery_discharge_kwh,
                        SUM(grid_import_kwh) AS grid_import_kwh,
                        SUM(grid_export_kwh) AS grid_export_kwh,
                        SUM(load_energy_kwh) AS load_energy_kwh
                 FROM daily_summary GROUP BY month;
             CREATE VIEW IF NOT EXISTS yearly_summary AS
                 SELECT substr(date, 1, 4) AS year,
                        SUM(pv_yield_kwh) AS pv_yield_kwh,
                        SUM(battery_charge_kwh) AS battery_charge_kwh,
                        SUM(battery_discharge_kwh) AS battery_discharge_kwh,
                        SUM(grid_import_kwh) AS grid_import_kwh,
                        SUM(grid_export_kwh) AS grid_export_kwh,
                        SUM(load_energy_kwh) AS load_energy_kwh
                 FROM daily_summary GROUP BY year;",
        )?;
        Ok(Self { conn })
    }

    fn with_busy_retry<T>(&self, mut op: impl FnMut(&Connection) -> rusqlite::Result<T>) -> Result<T> {
        let mut attempt = 0u32;
        loop {
            match op(&self.conn) {
                Ok(value) => return Ok(value),
                Err(err) if is_busy(&err) && attempt < BUSY_RETRY_ATTEMPTS => {
                    attempt += 1;
                    let backoff = BUSY_RETRY_BASE * 2u32.pow(attempt.min(4));
                    debug!(attempt, backoff_ms = backoff.as_millis() as u64, "database busy, retrying");
                    std::thread::sleep(backoff);
                }
                Err(err) if is_busy(&err) => {
                    return Err(StoreError::Busy {
                        attempts: attempt + 1,
                    })
                }
                Err(err) => return Err(err.into()),
            }
        }
    }

    /// Append one power snapshot row.
    pub fn record_power_sample(&self, sample: &PowerSample) -> Result<()> {
        self.with_busy_retry(|conn| {
            conn.execute(
                "INSERT OR REPLACE INTO power_history
                     (timestamp, soc, pv_w, batt_w, load_w, grid_w_signed)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![
                    sample.ts_ms_utc,
                    sample.soc_percent,
                    sample.pv_w,
                    sample.battery_w,
                    sample.load_w,
                    sample.grid_w_signed,
                ],
            )
        })?;
        Ok(())
    }

    /// Append a full state dump for debugging.
    pub fn record_state_snapshot(&self, ts_ms_utc: i64, json_blob: &str) -> Result<()> {
        self.with_busy_retry(|conn| {
            conn.execute(
                "INSERT OR REPLACE INTO state_history (timestamp, json_blob) VALUES (?1, ?2)",
                params![ts_ms_utc, json_blob],
            )
        })?;
        Ok(())
    }

    /// Insert or update the summary row for one date.
    pub fn upsert_daily_summary(&self, date: NaiveDate, summary: &DailySummary) -> Result<()> {
        if summary.is_empty() {
            debug!(date = %date, "all energy flows near zero, skipping summary row");
            return Ok(());
        }
        let date_str = date.format("%Y-%m-%d").to_string();
        self.with_busy_retry(|conn| {
            conn.execute(
                "INSERT INTO daily_summary
                     (date, pv_yield_kwh, battery_charge_kwh, battery_discharge_kwh,
                      grid_import_kwh, grid_export_kwh, load_energy_kwh)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
                 ON CONFLICT(date) DO UPDATE SET
                     pv_yield_kwh = excluded.pv_yield_kwh,
                     battery_charge_kwh = excluded.battery_charge_kwh,
                     battery_discharge_kwh = excluded.battery_discharge_kwh,
                     grid_import_kwh = excluded.grid_import_kwh,
                     grid_export_kwh = excluded.grid_export_kwh,
                     load_energy_kwh = excluded.load_energy_kwh",
                params![
                    date_str,
                    summary.pv_yield_kwh,
                    summary.battery_charge_kwh,
                    summary.battery_discharge_kwh,
                    summary.grid_import_kwh,
                    summary.grid_export_kwh,
                    summary.load_energy_kwh,
                ],
            )
        })?;
        Ok(())
    }

    pub fn daily_summary(&self, date: NaiveDate) -> Result<Option<DailySummary>> {
        let date_str = date.format("%Y-%m-%d").to_string();
        let row = self
            .conn
            .query_row(
                "SELECT pv_yield_kwh, battery_charge_kwh, battery_discharge_kwh,
                        grid_import_kwh, grid_export_kwh, load_energy_kwh
                 FROM daily_summary WHERE date = ?1",
                params![date_str],
                |row| {
                    Ok(DailySummary {
                        pv_yield_kwh: row.get(0)?,
                        battery_charge_kwh: row.get(1)?,
                        battery_discharge_kwh: row.get(2)?,
                        grid_import_kwh: row.get(3)?,
                        grid_export_kwh: row.get(4)?,
                        load_energy_kwh: row.get(5)?,
                    })
                },
            )
            .optional()?;
        Ok(row)
    }

    pub fn monthly_summary(&self, month: &str) -> Result<Option<DailySummary>> {
        let row = self
            .conn
            .query_row(
                "SELECT pv_yield_kwh, battery_charge_kwh, battery_discharge_kwh,
                        grid_import_kwh, grid_export_kwh, load_energy_kwh
                 FROM monthly_summary WHERE month = ?1",
                params![month],
                |row| {
                    Ok(DailySummary {
                        pv_yield_kwh: row.get(0)?,
                        battery_charge_kwh: row.get(1)?,
                        battery_discharge_kwh: row.get(2)?,
                        grid_import_kwh: row.get(3)?,
                        grid_export_kwh: row.get(4)?,
                        load_energy_kwh: row.get(5)?,
                    })
                },
            )
            .optional()?;
        Ok(row)
    }

    /// Delete power and state rows older than the retention window. Daily
    /// summaries are kept forever.
    pub fn prune(&self, now: DateTime<Utc>, max_age_hours: u64) -> Result<usize> {
        let cutoff_ms = (now - chrono::Duration::hours(max_age_hours as i64)).timestamp_millis();
        let deleted = self.with_busy_retry(|conn| {
            let power = conn.execute("DELETE FROM power_history WHERE timestamp < ?1", params![cutoff_ms])?;
            let state = conn.execute("DELETE FROM state_history WHERE timestamp < ?1", params![cutoff_ms])?;
            Ok(power + state)
        })?;
        if deleted > 0 {
            info!(deleted, "pruned old history rows");
        }
        Ok(deleted)
    }

    pub fn power_history_len(&self) -> Result<u64> {
        let count: u64 = self
            .conn
            .query_row("SELECT COUNT(*) FROM power_history", [], |row| row.get(0))?;
        Ok(count)
    }

    /// Integrate the power history of one local date into per-hour energy
    /// flows. Powers below the threshold are treated as noise.
    pub fn hourly_breakdown(
        &self,
        date: NaiveDate,
        timezone: Tz,
        threshold_w: f64,
    ) -> Result<Vec<HourlyBreakdown>> {
        let start_local = timezone
            .from_local_datetime(&date.and_hms_opt(0, 0, 0).expect("valid midnight"))
            .earliest();
        let Some(start_local) = start_local else {
            warn!(date = %date, "date has no local midnight, skipping breakdown");
            return Ok(Vec::new());
        };
        let start_ms = start_local.with_timezone(&Utc).timestamp_millis();
        let end_ms = (start_local + chrono::Duration::days(1))
            .with_timezone(&Utc)
            .timestamp_millis();

        let mut stmt = self.conn.prepare(
            "SELECT timestamp, pv_w, batt_w, grid_w_signed
             FROM power_history
             WHERE timestamp >= ?1 AND timestamp < ?2
             ORDER BY timestamp ASC",
        )?;
        let rows: Vec<(i64, Option<f64>, Option<f64>, Option<f64>)> = stmt
            .query_map(params![start_ms, end_ms], |row| {
                Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?))
            })?
            .collect::<rusqlite::Result<_>>()?;
        if rows.len() < 2 {
            return Ok(Vec::new());
        }

        let mut hours: Vec<HourlyBreakdown> = (0..24)
            .map(|hour| HourlyBreakdown {
                hour,
                ..HourlyBreakdown::default()
            })
            .collect();
        let threshold_kw = threshold_w / 1000.0;

        for pair in rows.windows(2) {
            let (prev_ts, prev_pv, prev_batt, prev_grid) = pair[0];
            let (curr_ts, curr_pv, curr_batt, curr_grid) = pair[1];
            let dt_hours = (curr_ts - prev_ts) as f64 / 1000.0 / 3600.0;
            if dt_hours <= 0.0 {
                continue;
            }
            let hour = Utc
                .timestamp_millis_opt(prev_ts)
                .single()
                .map(|ts| ts.with_timezone(&timezone).format("%H").to_string())
                .and_then(|h| h.parse::<usize>().ok())
                .unwrap_or(0)
                .min(23);

            let avg = |a: Option<f64>, b: Option<f64>| {
                (a.unwrap_or(0.0) + b.unwrap_or(0.0)) / 2.0 / 1000.0
            };
            let pv_kw = avg(prev_pv, curr_pv);
            let batt_kw = avg(prev_batt, curr_batt);
            let grid_kw = avg(prev_grid, curr_grid);

            let slot = &mut hours[hour];
            // Battery: positive discharging, negative charging.
            if batt_kw > threshold_kw {
                slot.battery_discharge_kwh += batt_kw * dt_hours;
            } else if batt_kw < -threshold_kw {
                slot.battery_charge_kwh += -batt_kw * dt_hours;
            }
            // Grid: positive exporting, negative importing.
            if grid_kw > threshold_kw {
                slot.grid_export_kwh += grid_kw * dt_hours;
            } else if grid_kw < -threshold_kw {
                slot.grid_import_kwh += -grid_kw * dt_hours;
            }
            // Whatever production is left after charging and exporting
            // went to the load directly.
            let solar_to_battery = (-batt_kw).max(0.0);
            let solar_to_grid = grid_kw.max(0.0);
            slot.solar_to_load_kwh += (pv_kw - solar_to_battery - solar_to_grid).max(0.0) * dt_hours;
        }
        Ok(hours)
    }
}

fn is_busy(err: &rusqlite::Error) -> bool {
    matches!(
        err,
        rusqlite::Error::SqliteFailure(e, _)
            if e.code == ErrorCode::DatabaseBusy || e.code == ErrorCode::DatabaseLocked
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample(ts_ms: i64, pv: f64, batt: f64, grid: f64) -> PowerSample {
        PowerSample {
            ts_ms_utc: ts_ms,
            soc_percent: Some(70.0),
            pv_w: Some(pv),
            battery_w: Some(batt),
            load_w: Some(500.0),
            grid_w_signed: Some(grid),
        }
    }

    #[test]
    fn power_rows_round_trip_and_prune() {
        let store = HistoryStore::open_in_memory().unwrap();
        let now = Utc::now();
        let old_ms = (now - chrono::Duration::hours(200)).timestamp_millis();
        let new_ms = now.timestamp_millis();

        store.record_power_sample(&sample(old_ms, 100.0, 0.0, 0.0)).unwrap();
        store.record_power_sample(&sample(new_ms, 200.0, 0.0, 0.0)).unwrap();
        assert_eq!(store.power_history_len().unwrap(), 2);

        store.prune(now, 168).unwrap();
        assert_eq!(store.power_history_len().unwrap(), 1);
    }

    #[test]
    fn daily_summary_upserts() {
        let store = HistoryStore::open_in_memory().unwrap();
        let date = NaiveDate::from_ymd_opt(2024, 6, 1).unwrap();
        let first = DailySummary {
            pv_yield_kwh: 5.0,
            ..DailySummary::default()
        };
        store.upsert_daily_summary(date, &first).unwrap();
        let second = DailySummary {
            pv_yield_kwh: 9.5,
            grid_export_kwh: 1.5,
            ..DailySummary::default()
        };
        store.upsert_daily_summary(date, &second).unwrap();

        let stored = store.daily_summary(date).unwrap().unwrap();
        assert_eq!(stored.pv_yield_kwh, 9.5);
        assert_eq!(stored.grid_export_kwh, 1.5);
    }

    #[test]
    fn empty_summaries_are_not_stored() {
        let store = HistoryStore::open_in_memory().unwrap();
        let date = NaiveDate::from_ymd_opt(2024, 6, 1).unwrap();
        store.upsert_daily_summary(date, &DailySummary::default()).unwrap();
        assert!(store.daily_summary(date).unwrap().is_none());
    }

    #[test]
    fn monthly_view_aggregates_days() {
        let store = HistoryStore::open_in_memory().unwrap();
        for day in 1..=3 {
            let date = NaiveDate::from_ymd_opt(2024, 6, day).unwrap();
            let summary = DailySummary {
                pv_yield_kwh: 10.0,
                load_energy_kwh: 8.0,
                ..DailySummary::default()
            };
            store.upsert_daily_summary(date, &summary).unwrap();
        }
        let month = store.monthly_summary("2024-06").unwrap().unwrap();
        assert_eq!(month.pv_yield_kwh, 30.0);
        assert_eq!(month.load_energy_kwh, 24.0);
    }

    #[test]
    fn load_fallback_uses_the_energy_balance() {
        let summary = DailySummary {
            pv_yield_kwh: 10.0,
            battery_charge_kwh: 3.0,
            battery_discharge_kwh: 2.0,
            grid_import_kwh: 1.0,
            grid_export_kwh: 4.0,
            load_energy_kwh: 0.0,
        }
        .with_load_fallback();
        assert_eq!(summary.load_energy_kwh, 6.0);
    }

    #[test]
    fn hourly_breakdown_integrates_average_power() {
        let store = HistoryStore::open_in_memory().unwrap();
        // Two samples one hour apart within hour 10 UTC: 1 kW PV,
        // 0.4 kW charging, 0.2 kW exporting.
        let base = Utc.with_ymd_and_hms(2024, 6, 1, 10, 0, 0).unwrap();
        store
            .record_power_sample(&sample(base.timestamp_millis(), 1000.0, -400.0, 200.0))
            .unwrap();
        store
            .record_power_sample(&sample(
                (base + chrono::Duration::minutes(59)).timestamp_millis(),
                1000.0,
                -400.0,
                200.0,
            ))
            .unwrap();

        let date = NaiveDate::from_ymd_opt(2024, 6, 1).unwrap();
        let hours = store.hourly_breakdown(date, chrono_tz::UTC, 2.0).unwrap();
        let slot = hours.iter().find(|h| h.hour == 10).unwrap();
        let dt = 59.0 / 60.0;
        assert!((slot.battery_charge_kwh - 0.4 * dt).abs() < 1e-9);
        assert!((slot.grid_export_kwh - 0.2 * dt).abs() < 1e-9);
        assert!((slot.solar_to_load_kwh - 0.4 * dt).abs() < 1e-9);
    }

    #[test]
    fn state_snapshots_are_stored() {
        let store = HistoryStore::open_in_memory().unwrap();
        store.record_state_snapshot(1717200000000, "{\"soc\":70}").unwrap();
        let blob: String = store
            .conn
            .query_row("SELECT json_blob FROM state_history", [], |row| row.get(0))
            .unwrap();
        assert_eq!(blob, "{\"soc\":70}");
    }
}
