//! ---
//! helio_section: "01-core-functionality"
//! helio_subsection: "module"
//! helio_type: "source"
//! helio_scope: "code"
//! helio_description: "Aggregation, filtering, supervision and fan-out."
//! helio_version: "v0.4.2"
//! helio_owner: "tbd"
//! ---
//! Adaptive spike filter.
//!
//! Daily-energy counters get the full treatment: hard ceilings against
//! unit confusion, an elapsed-time-aware spike rule with immediate
//! rejection at ten times the plausible increase, a confirmation window
//! for borderline jumps, self-correction when a lower value persists, and
//! a reset at local midnight. Instantaneous quantities only get range
//! sanity and an optional rate check. The filter is called serially by
//! the aggregator and holds no locks.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use chrono_tz::Tz;
use helio_common::config::{FilterConfig, InverterSystemConfig};
use helio_common::time::local_day_ordinal;
use helio_types::{StandardKey, Value};
use tracing::{debug, info, warn};

/// Headroom added to every allowed increase, absorbing register rounding
/// and BMS imprecision.
const INCREASE_HEADROOM_KWH: f64 = 0.1;

/// Power spikes are measured against the physical limit times this factor.
const POWER_SPIKE_FACTOR: f64 = 1.5;

/// Bounds for the elapsed time entering the spike rule.
const MIN_ELAPSED: Duration = Duration::from_secs(1);
const MAX_ELAPSED: Duration = Duration::from_secs(3600);

/// Outcome of filtering one value.
#[derive(Debug, Clone, PartialEq)]
pub enum FilterVerdict {
    Accept(Value),
    /// The proposed value was dropped; the previously accepted value (if
    /// any) stays current.
    Reject { reason: &'static str },
}

#[derive(Debug)]
struct EnergyState {
    last_accepted: f64,
    last_accept_at: Instant,
    last_touched: Instant,
    /// Local day the last acceptance happened on.
    day_ordinal: i32,
    /// Borderline spike awaiting confirmation: candidate value + streak.
    pending_spike: Option<(f64, u32)>,
    /// Persistent lower reading: value, first-seen time, streak.
    lower_streak: Option<(f64, Instant, u32)>,
}

#[derive(Debug)]
struct InstantState {
    last_accepted: f64,
    last_accept_at: Instant,
    last_touched: Instant,
}

/// The per-key rolling filter memory plus configuration.
pub struct AdaptiveFilter {
    config: FilterConfig,
    system: InverterSystemConfig,
    timezone: Tz,
    energy: HashMap<StandardKey, EnergyState>,
    instantaneous: HashMap<StandardKey, InstantState>,
    rejections: HashMap<StandardKey, u64>,
}

impl AdaptiveFilter {
    pub fn new(config: FilterConfig, system: InverterSystemConfig, timezone: Tz) -> Self {
        Self {
            config,
            system,
            timezone,
            energy: HashMap::new(),
            instantaneous: HashMap::new(),
            rejections: HashMap::new(),
        }
    }

    /// Rejections recorded for a key since startup.
    pub fn rejection_count(&self, key: StandardKey) -> u64 {
        self.rejections.get(&key).copied().unwrap_or(0)
    }

    /// Drop cache entries that have not been touched within the TTL.
    pub fn expire_stale_state(&mut self, now: Instant) {
        let ttl = self.config.state_ttl;
        self.energy.retain(|_, s| now.duration_since(s.last_touched) < ttl);
        self.instantaneous
            .retain(|_, s| now.duration_since(s.last_touched) < ttl);
    }

    /// Filter one value. Non-numeric values and keys outside the filtered
    /// sets pass through untouched.
    pub fn apply(
        &mut self,
        key: StandardKey,
        value: &Value,
        now: Instant,
        wall: DateTime<Utc>,
    ) -> FilterVerdict {
        if key.is_daily_energy() {
            return self.apply_energy(key, value, now, wall);
        }
        if key == StandardKey::BatteryStateOfChargePercent {
            return self.apply_soc(value, now);
        }
        if key.is_power() {
            return self.apply_power(key, value, now);
        }
        FilterVerdict::Accept(value.clone())
    }

    fn reject(&mut self, key: StandardKey, reason: &'static str) -> FilterVerdict {
        *self.rejections.entry(key).or_insert(0) += 1;
        FilterVerdict::Reject { reason }
    }

    fn daily_limit(&self, key: StandardKey) -> f64 {
        match key {
            StandardKey::EnergyGridDailyImportKwh => self.config.daily_limit_grid_import_kwh,
            StandardKey::EnergyGridDailyExportKwh => self.config.daily_limit_grid_export_kwh,
            StandardKey::EnergyBatteryDailyChargeKwh => self.config.daily_limit_battery_charge_kwh,
            StandardKey::EnergyBatteryDailyDischargeKwh => {
                self.config.daily_limit_battery_discharge_kwh
            }
            StandardKey::EnergyPvDailyKwh => self.config.daily_limit_pv_generation_kwh,
            StandardKey::EnergyLoadDailyKwh => self.config.daily_limit_load_consumption_kwh,
            _ => 0.0,
        }
    }

    /// Per-key base rate in kWh/s. Configured overrides win; the ceiling
    /// spread over a day is the fallback.
    fn base_rate(&self, key: StandardKey) -> f64 {
        if let Some(rate) = self.config.rate_overrides_kwh_per_s.get(key.as_str()) {
            return *rate;
        }
        self.daily_limit(key) / 86_400.0
    }

    fn apply_energy(
        &mut self,
        key: StandardKey,
        value: &Value,
        now: Instant,
        wall: DateTime<Utc>,
    ) -> FilterVerdict {
        let Some(proposed) = value.as_f64() else {
            return self.reject(key, "not numeric");
        };
        if !proposed.is_finite() || proposed < 0.0 {
            return self.reject(key, "out of domain");
        }

        let today = local_day_ordinal(wall, self.timezone);
        let limit = self.daily_limit(key);

        // Ceiling first, so unit-confused values never become a baseline.
        if limit > 0.0 && proposed > limit {
            if !self.energy.contains_key(&key) {
                warn!(
                    key = key.as_str(),
                    proposed,
                    limit_applied = limit,
                    reason = "over daily ceiling at startup",
                    "initial energy value above ceiling, starting from zero"
                );
                self.store_accept(key, 0.0, now, today);
                return FilterVerdict::Accept(Value::Number(0.0));
            }
            let state = self.energy.get_mut(&key).expect("checked above");
            state.last_touched = now;
            let last_accepted = state.last_accepted;
            warn!(
                key = key.as_str(),
                last_accepted,
                proposed,
                limit_applied = limit,
                reason = "over daily ceiling",
                "energy value rejected"
            );
            return self.reject(key, "over daily ceiling");
        }

        // Midnight rollover: the first value of a new local day is a fresh
        // baseline.
        if let Some(state) = self.energy.get(&key) {
            if state.day_ordinal != today {
                info!(key = key.as_str(), proposed, "daily reset, accepting fresh baseline");
                self.store_accept(key, proposed, now, today);
                return FilterVerdict::Accept(Value::Number(proposed));
            }
        }

        if !self.energy.contains_key(&key) {
            debug!(key = key.as_str(), proposed, "accepting initial energy value");
            self.store_accept(key, proposed, now, today);
            return FilterVerdict::Accept(Value::Number(proposed));
        }

        let (elapsed, last) = {
            let state = self.energy.get_mut(&key).expect("present");
            state.last_touched = now;
            let elapsed = now
                .duration_since(state.last_accept_at)
                .clamp(MIN_ELAPSED, MAX_ELAPSED);
            (elapsed, state.last_accepted)
        };
        let max_increase = self.base_rate(key) * elapsed.as_secs_f64() + INCREASE_HEADROOM_KWH;
        let state = self.energy.get_mut(&key).expect("present");
        let delta = proposed - last;

        if delta < 0.0 {
            // Persistent lower readings eventually rewrite a previously
            // accepted spike.
            let (streak_value, first_seen, count) = match state.lower_streak {
                Some((v, t, c)) => (v, t, c + 1),
                None => (proposed, now, 1),
            };
            state.lower_streak = Some((proposed, first_seen, count));
            let window_met = now.duration_since(first_seen) >= self.config.decrease_window;
            let samples_met = count >= self.config.min_consistent_samples;
            if window_met && samples_met {
                info!(
                    key = key.as_str(),
                    last_accepted = last,
                    proposed,
                    samples = count,
                    "persistent lower reading accepted, correcting previous value"
                );
                self.store_accept(key, proposed, now, today);
                return FilterVerdict::Accept(Value::Number(proposed));
            }
            let elapsed_s = elapsed.as_secs_f64();
            debug!(
                key = key.as_str(),
                last_accepted = last,
                proposed,
                streak_value,
                elapsed_s,
                reason = "decrease held",
                "energy decrease held for confirmation"
            );
            return self.reject(key, "decrease held");
        }
        state.lower_streak = None;

        if delta <= max_increase {
            state.pending_spike = None;
            state.last_accepted = proposed;
            state.last_accept_at = now;
            return FilterVerdict::Accept(Value::Number(proposed));
        }

        if delta > max_increase * 10.0 {
            let elapsed_s = elapsed.as_secs_f64();
            warn!(
                key = key.as_str(),
                last_accepted = last,
                proposed,
                elapsed_s,
                limit_applied = max_increase * 10.0,
                reason = "spike over 10x plausible increase",
                "energy spike rejected outright"
            );
            state.pending_spike = None;
            return self.reject(key, "spike over 10x plausible increase");
        }

        // Borderline jump: require consecutive confirming samples.
        let (candidate, count) = match state.pending_spike {
            Some((candidate, count)) if (proposed - candidate).abs() <= max_increase => {
                (proposed, count + 1)
            }
            _ => (proposed, 1),
        };
        if count >= self.config.spike_confirmation_count {
            info!(
                key = key.as_str(),
                last_accepted = last,
                proposed,
                samples = count,
                "spike confirmed as the new baseline"
            );
            state.pending_spike = None;
            state.last_accepted = proposed;
            state.last_accept_at = now;
            return FilterVerdict::Accept(Value::Number(proposed));
        }
        state.pending_spike = Some((candidate, count));
        let elapsed_s = elapsed.as_secs_f64();
        warn!(
            key = key.as_str(),
            last_accepted = last,
            proposed,
            elapsed_s,
            limit_applied = max_increase,
            streak = count,
            reason = "spike awaiting confirmation",
            "energy spike held"
        );
        self.reject(key, "spike awaiting confirmation")
    }

    fn store_accept(&mut self, key: StandardKey, value: f64, now: Instant, day: i32) {
        self.energy.insert(
            key,
            EnergyState {
                last_accepted: value,
                last_accept_at: now,
                last_touched: now,
                day_ordinal: day,
                pending_spike: None,
                lower_streak: None,
            },
        );
    }

    fn power_limit(&self, key: StandardKey) -> f64 {
        let raw = match key {
            StandardKey::PvTotalDcPowerWatts => self.system.pv_installed_capacity_w,
            StandardKey::AcPowerWatts | StandardKey::GridTotalActivePowerWatts => {
                self.system.inverter_max_ac_power_w
            }
            StandardKey::BatteryPowerWatts => self
                .system
                .battery_max_charge_power_w
                .max(self.system.battery_max_discharge_power_w),
            StandardKey::LoadTotalPowerWatts => self.system.inverter_max_ac_power_w * 1.5,
            _ => 0.0,
        };
        raw * POWER_SPIKE_FACTOR
    }

    fn apply_power(&mut self, key: StandardKey, value: &Value, now: Instant) -> FilterVerdict {
        let Some(proposed) = value.as_f64() else {
            return self.reject(key, "not numeric");
        };
        if !proposed.is_finite() {
            return self.reject(key, "out of domain");
        }

        let limit = self.power_limit(key);
        if limit > 0.0 && proposed.abs() > limit {
            warn!(
                key = key.as_str(),
                proposed,
                limit_applied = limit,
                reason = "power spike over physical limit",
                "power value rejected"
            );
            return self.reject(key, "power spike over physical limit");
        }

        // Optional per-key rate-of-change check, in watts per second.
        if let Some(rate) = self.config.rate_overrides_kwh_per_s.get(key.as_str()) {
            if let Some(state) = self.instantaneous.get(&key) {
                let elapsed = now
                    .duration_since(state.last_accept_at)
                    .clamp(MIN_ELAPSED, MAX_ELAPSED)
                    .as_secs_f64();
                let max_step = rate * elapsed;
                if (proposed - state.last_accepted).abs() > max_step {
                    warn!(
                        key = key.as_str(),
                        last_accepted = state.last_accepted,
                        proposed,
                        elapsed_s = elapsed,
                        limit_applied = max_step,
                        reason = "rate of change",
                        "power step rejected"
                    );
                    return self.reject(key, "rate of change");
                }
            }
        }

        self.instantaneous.insert(
            key,
            InstantState {
                last_accepted: proposed,
                last_accept_at: now,
                last_touched: now,
            },
        );
        FilterVerdict::Accept(Value::Number(proposed))
    }

    /// SOC moves no faster than the battery's charge power allows.
    fn apply_soc(&mut self, value: &Value, now: Instant) -> FilterVerdict {
        let key = StandardKey::BatteryStateOfChargePercent;
        let Some(proposed) = value.as_f64() else {
            return self.reject(key, "not numeric");
        };
        // Slight overage tolerated; some BMS firmware reports 100.4%.
        if !(0.0..=105.0).contains(&proposed) {
            return self.reject(key, "soc out of range");
        }

        let capacity_wh = self.system.battery_usable_capacity_kwh * 1000.0;
        let max_power = self.system.battery_max_charge_power_w;
        if let Some(state) = self.instantaneous.get(&key) {
            if capacity_wh > 0.0 && max_power > 0.0 {
                let elapsed_h = now
                    .duration_since(state.last_accept_at)
                    .clamp(MIN_ELAPSED, MAX_ELAPSED)
                    .as_secs_f64()
                    / 3600.0;
                let max_change = (max_power * elapsed_h / capacity_wh) * 100.0 * 1.5 + 1.0;
                if (proposed - state.last_accepted).abs() > max_change {
                    warn!(
                        key = key.as_str(),
                        last_accepted = state.last_accepted,
                        proposed,
                        limit_applied = max_change,
                        reason = "soc jump",
                        "soc jump rejected"
                    );
                    return self.reject(key, "soc jump");
                }
            }
        }

        self.instantaneous.insert(
            key,
            InstantState {
                last_accepted: proposed,
                last_accept_at: now,
                last_touched: now,
            },
        );
        FilterVerdict::Accept(Value::Number(proposed))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn filter() -> AdaptiveFilter {
        let system = InverterSystemConfig {
            default_mppt_count: 2,
            pv_installed_capacity_w: 8000.0,
            inverter_max_ac_power_w: 6000.0,
            battery_usable_capacity_kwh: 10.0,
            battery_max_charge_power_w: 5000.0,
            battery_max_discharge_power_w: 5000.0,
        };
        AdaptiveFilter::new(FilterConfig::default(), system, chrono_tz::UTC)
    }

    fn wall() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 6, 1, 12, 0, 0).unwrap()
    }

    fn accept_energy(f: &mut AdaptiveFilter, v: f64, at: Instant) -> FilterVerdict {
        f.apply(StandardKey::EnergyPvDailyKwh, &Value::Number(v), at, wall())
    }

    #[test]
    fn spike_sequence_rejects_only_the_outlier() {
        let mut f = filter();
        let t0 = Instant::now();
        let step = Duration::from_secs(5);

        assert!(matches!(accept_energy(&mut f, 1.000, t0), FilterVerdict::Accept(_)));
        assert!(matches!(accept_energy(&mut f, 1.005, t0 + step), FilterVerdict::Accept(_)));
        // 8.4 kWh jump in 5 s is far past ten times the plausible increase.
        assert!(matches!(
            accept_energy(&mut f, 9.400, t0 + step * 2),
            FilterVerdict::Reject { .. }
        ));
        assert!(matches!(accept_energy(&mut f, 1.010, t0 + step * 3), FilterVerdict::Accept(_)));
        assert!(matches!(accept_energy(&mut f, 1.015, t0 + step * 4), FilterVerdict::Accept(_)));
        assert_eq!(f.rejection_count(StandardKey::EnergyPvDailyKwh), 1);
    }

    #[test]
    fn elapsed_time_widens_the_budget() {
        let mut f = filter();
        f.config
            .rate_overrides_kwh_per_s
            .insert("energy_pv_daily_kwh".into(), 0.0275);
        let t0 = Instant::now();

        assert!(matches!(accept_energy(&mut f, 1.000, t0), FilterVerdict::Accept(_)));
        // 0.3 kWh after 120 s: budget is 0.0275 * 120 = 3.3 kWh.
        assert!(matches!(
            accept_energy(&mut f, 1.300, t0 + Duration::from_secs(120)),
            FilterVerdict::Accept(_)
        ));

        let mut f = filter();
        f.config
            .rate_overrides_kwh_per_s
            .insert("energy_pv_daily_kwh".into(), 0.0275);
        assert!(matches!(accept_energy(&mut f, 1.000, t0), FilterVerdict::Accept(_)));
        // The same increase after only 5 s lands in the confirmation band.
        assert!(matches!(
            accept_energy(&mut f, 1.300, t0 + Duration::from_secs(5)),
            FilterVerdict::Reject { .. }
        ));
    }

    #[test]
    fn persistent_lower_reading_corrects_a_spike() {
        let mut f = filter();
        let t0 = Instant::now();
        assert!(matches!(accept_energy(&mut f, 9.4, t0), FilterVerdict::Accept(_)));

        // Six lower samples spread over twelve minutes.
        let mut last = FilterVerdict::Reject { reason: "" };
        for i in 0..6u64 {
            let at = t0 + Duration::from_secs(60 + i * 144);
            last = accept_energy(&mut f, 2.1, at);
        }
        assert_eq!(last, FilterVerdict::Accept(Value::Number(2.1)));
        // Subsequent growth resumes from the corrected baseline.
        assert!(matches!(
            accept_energy(&mut f, 2.15, t0 + Duration::from_secs(1000)),
            FilterVerdict::Accept(_)
        ));
    }

    #[test]
    fn short_lived_decreases_are_held() {
        let mut f = filter();
        let t0 = Instant::now();
        assert!(matches!(accept_energy(&mut f, 5.0, t0), FilterVerdict::Accept(_)));
        for i in 1..=3u64 {
            assert!(matches!(
                accept_energy(&mut f, 4.0, t0 + Duration::from_secs(i * 5)),
                FilterVerdict::Reject { .. }
            ));
        }
    }

    #[test]
    fn ceiling_rejects_and_initial_over_ceiling_starts_at_zero() {
        let mut f = filter();
        let t0 = Instant::now();
        // 500 kWh "daily" reading at startup: Wh reported as kWh.
        assert_eq!(
            accept_energy(&mut f, 500.0, t0),
            FilterVerdict::Accept(Value::Number(0.0))
        );
        assert!(matches!(accept_energy(&mut f, 0.2, t0 + Duration::from_secs(5)), FilterVerdict::Accept(_)));
        assert!(matches!(
            accept_energy(&mut f, 480.0, t0 + Duration::from_secs(10)),
            FilterVerdict::Reject { .. }
        ));
    }

    #[test]
    fn confirmation_accepts_consistent_borderline_jumps() {
        let mut f = filter();
        let t0 = Instant::now();
        assert!(matches!(accept_energy(&mut f, 1.0, t0), FilterVerdict::Accept(_)));
        // ~0.5 kWh jumps in 5 s: above the budget, below ten times it.
        assert!(matches!(
            accept_energy(&mut f, 1.5, t0 + Duration::from_secs(5)),
            FilterVerdict::Reject { .. }
        ));
        assert!(matches!(
            accept_energy(&mut f, 1.52, t0 + Duration::from_secs(10)),
            FilterVerdict::Reject { .. }
        ));
        // Third consistent sample confirms the new baseline.
        assert_eq!(
            accept_energy(&mut f, 1.53, t0 + Duration::from_secs(15)),
            FilterVerdict::Accept(Value::Number(1.53))
        );
    }

    #[test]
    fn midnight_reset_accepts_a_fresh_baseline() {
        let mut f = filter();
        let t0 = Instant::now();
        let day1 = Utc.with_ymd_and_hms(2024, 6, 1, 23, 59, 0).unwrap();
        let day2 = Utc.with_ymd_and_hms(2024, 6, 2, 0, 1, 0).unwrap();
        assert!(matches!(
            f.apply(StandardKey::EnergyPvDailyKwh, &Value::Number(12.0), t0, day1),
            FilterVerdict::Accept(_)
        ));
        // A drop to near zero across midnight is the daily reset.
        assert_eq!(
            f.apply(
                StandardKey::EnergyPvDailyKwh,
                &Value::Number(0.02),
                t0 + Duration::from_secs(120),
                day2
            ),
            FilterVerdict::Accept(Value::Number(0.02))
        );
    }

    #[test]
    fn power_range_check_rejects_impossible_values() {
        let mut f = filter();
        let t0 = Instant::now();
        assert!(matches!(
            f.apply(StandardKey::PvTotalDcPowerWatts, &Value::Number(4000.0), t0, wall()),
            FilterVerdict::Accept(_)
        ));
        // 8 kW array cannot produce 20 kW.
        assert!(matches!(
            f.apply(StandardKey::PvTotalDcPowerWatts, &Value::Number(20_000.0), t0, wall()),
            FilterVerdict::Reject { .. }
        ));
    }

    #[test]
    fn soc_jump_is_rejected() {
        let mut f = filter();
        let t0 = Instant::now();
        assert!(matches!(
            f.apply(StandardKey::BatteryStateOfChargePercent, &Value::Number(50.0), t0, wall()),
            FilterVerdict::Accept(_)
        ));
        // 40 points in five seconds is physically impossible for a 10 kWh
        // pack at 5 kW.
        assert!(matches!(
            f.apply(
                StandardKey::BatteryStateOfChargePercent,
                &Value::Number(90.0),
                t0 + Duration::from_secs(5),
                wall()
            ),
            FilterVerdict::Reject { .. }
        ));
        assert!(matches!(
            f.apply(
                StandardKey::BatteryStateOfChargePercent,
                &Value::Number(50.3),
                t0 + Duration::from_secs(10),
                wall()
            ),
            FilterVerdict::Accept(_)
        ));
    }

    #[test]
    fn stale_state_expires_after_ttl() {
        let mut f = filter();
        let t0 = Instant::now();
        assert!(matches!(accept_energy(&mut f, 3.0, t0), FilterVerdict::Accept(_)));
        f.expire_stale_state(t0 + Duration::from_secs(301));
        assert!(f.energy.is_empty());
    }

    #[test]
    fn text_keys_pass_through() {
        let mut f = filter();
        let verdict = f.apply(
            StandardKey::OperationalInverterStatusText,
            &Value::from("Generating"),
            Instant::now(),
            wall(),
        );
        assert_eq!(verdict, FilterVerdict::Accept(Value::from("Generating")));
    }
}
