//! ---
//! helio_section: "01-core-functionality"
//! helio_subsection: "module"
//! helio_type: "source"
//! helio_scope: "code"
//! helio_description: "Shared primitives and utilities for the monitoring runtime."
//! helio_version: "v0.4.2"
//! helio_owner: "tbd"
//! ---
//! Clock helpers. Elapsed-time arithmetic uses the monotonic clock
//! exclusively; wall time appears only in human-visible timestamps and the
//! local-midnight rollover.

use std::time::Instant;

use chrono::{DateTime, Datelike, NaiveDate, TimeZone, Utc};
use chrono_tz::Tz;

/// Capture an instant suitable for scheduler comparisons.
pub fn monotonic_now() -> Instant {
    Instant::now()
}

/// Milliseconds since the UNIX epoch, UTC.
pub fn epoch_millis_utc() -> i64 {
    Utc::now().timestamp_millis()
}

/// Current calendar date in the configured zone.
pub fn local_date(tz: Tz) -> NaiveDate {
    Utc::now().with_timezone(&tz).date_naive()
}

/// `YYYY-MM-DD` string for the current local date.
pub fn local_date_string(tz: Tz) -> String {
    local_date(tz).format("%Y-%m-%d").to_string()
}

/// The local date of the given UTC timestamp.
pub fn local_date_of(ts: DateTime<Utc>, tz: Tz) -> NaiveDate {
    ts.with_timezone(&tz).date_naive()
}

/// UTC instant of the next local midnight after `now`.
pub fn next_local_midnight(now: DateTime<Utc>, tz: Tz) -> DateTime<Utc> {
    let local = now.with_timezone(&tz);
    let tomorrow = local.date_naive().succ_opt().unwrap_or(local.date_naive());
    // DST gaps can make exact midnight nonexistent; earliest() picks the
    // first valid instant of the day.
    let midnight = tz
        .from_local_datetime(&tomorrow.and_hms_opt(0, 0, 0).expect("valid midnight"))
        .earliest()
        .unwrap_or_else(|| local + chrono::Duration::days(1));
    midnight.with_timezone(&Utc)
}

/// A day ordinal that only changes at local midnight, used for daily
/// counter resets.
pub fn local_day_ordinal(ts: DateTime<Utc>, tz: Tz) -> i32 {
    local_date_of(ts, tz).num_days_from_ce()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn midnight_rollover_follows_the_zone() {
        let tz: Tz = "Europe/Berlin".parse().unwrap();
        // 23:30 Berlin time on 2024-06-01 is 21:30 UTC.
        let now = Utc.with_ymd_and_hms(2024, 6, 1, 21, 30, 0).unwrap();
        let midnight = next_local_midnight(now, tz);
        assert_eq!(midnight, Utc.with_ymd_and_hms(2024, 6, 1, 22, 0, 0).unwrap());
    }

    #[test]
    fn day_ordinal_changes_at_local_midnight() {
        let tz: Tz = "Europe/Berlin".parse().unwrap();
        let before = Utc.with_ymd_and_hms(2024, 6, 1, 21, 59, 0).unwrap();
        let after = Utc.with_ymd_and_hms(2024, 6, 1, 22, 1, 0).unwrap();
        assert_ne!(local_day_ordinal(before, tz), local_day_ordinal(after, tz));
    }
}
