//! Time utilities: timezone-aware "today" and transaction date windows.

use anyhow::Result;
use chrono::{DateTime, Duration, NaiveDate, Utc};
use chrono_tz::Tz;

/// Parse an IANA timezone name like "Europe/Copenhagen".
pub fn parse_tz(tz: &str) -> Result<Tz> {
    tz.parse()
        .map_err(|_| anyhow::anyhow!("invalid timezone: {tz}"))
}

/// Calendar date of `now` in `tz`. Banks book in local time.
pub fn local_date(now: DateTime<Utc>, tz: Tz) -> NaiveDate {
    now.with_timezone(&tz).date_naive()
}

/// Inclusive booking-date range requested from the aggregator
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DateWindow {
    pub from: NaiveDate,
    pub to: NaiveDate,
}

/// Window for a transaction fetch.
///
/// Starts at the date of the last successful sync, or `lookback_days` before
/// `today` on first sync. Never reaches further back than the institution's
/// `max_history_days` when known, and never starts after `today`.
pub fn sync_window(
    today: NaiveDate,
    last_success: Option<NaiveDate>,
    lookback_days: u32,
    max_history_days: Option<u32>,
) -> DateWindow {
    let mut from = last_success.unwrap_or(today - Duration::days(lookback_days.into()));
    if let Some(max) = max_history_days {
        let earliest = today - Duration::days(max.into());
        if from < earliest {
            from = earliest;
        }
    }
    if from > today {
        from = today;
    }
    DateWindow { from, to: today }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn d(y: i32, m: u32, day: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, day).unwrap()
    }

    #[test]
    fn test_local_date_crosses_midnight() {
        // 23:30 UTC is already the next day in Copenhagen (UTC+1 in winter)
        let now = Utc.with_ymd_and_hms(2026, 2, 20, 23, 30, 0).unwrap();
        let tz = parse_tz("Europe/Copenhagen").unwrap();
        assert_eq!(local_date(now, tz), d(2026, 2, 21));
    }

    #[test]
    fn test_invalid_tz() {
        assert!(parse_tz("Mars/Olympus").is_err());
    }

    #[test]
    fn test_first_sync_uses_lookback() {
        let w = sync_window(d(2026, 3, 31), None, 90, None);
        assert_eq!(w.from, d(2025, 12, 31));
        assert_eq!(w.to, d(2026, 3, 31));
    }

    #[test]
    fn test_incremental_sync_starts_at_last_success() {
        let w = sync_window(d(2026, 3, 31), Some(d(2026, 3, 28)), 90, Some(730));
        assert_eq!(w.from, d(2026, 3, 28));
    }

    #[test]
    fn test_institution_history_caps_lookback() {
        let w = sync_window(d(2026, 3, 31), None, 90, Some(30));
        assert_eq!(w.from, d(2026, 3, 1));
    }

    #[test]
    fn test_future_last_success_is_clamped() {
        let w = sync_window(d(2026, 3, 31), Some(d(2026, 4, 2)), 90, None);
        assert_eq!(w.from, d(2026, 3, 31));
    }
}
