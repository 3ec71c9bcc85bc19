//! Period bucket calculation.
//!
//! Usage is aggregated within deterministic UTC windows. Keys are plain
//! strings ("2024-03-01" for daily meters, "2024-03" for monthly) so they
//! index cleanly and sort chronologically. Both functions are pure in
//! `now`, which keeps time-travel tests trivial.

use corral_shared::types::ResetPeriod;
use time::{Date, Month, OffsetDateTime, Time};

use crate::error::{BillingError, BillingResult};

/// Bucket key for `now` under the given reset cadence.
pub fn period_key(now: OffsetDateTime, reset: ResetPeriod) -> String {
    let date = now.date();
    match reset {
        ResetPeriod::Day => format!(
            "{:04}-{:02}-{:02}",
            date.year(),
            u8::from(date.month()),
            date.day()
        ),
        ResetPeriod::Month => format!("{:04}-{:02}", date.year(), u8::from(date.month())),
    }
}

/// First instant (UTC midnight) of the bucket after the one containing `now`.
pub fn reset_at(now: OffsetDateTime, reset: ResetPeriod) -> BillingResult<OffsetDateTime> {
    let date = now.date();
    let next = match reset {
        ResetPeriod::Day => date
            .next_day()
            .ok_or_else(|| BillingError::InvalidInput("date out of range".to_string()))?,
        ResetPeriod::Month => {
            let (year, month) = match date.month() {
                Month::December => (date.year() + 1, Month::January),
                month => (date.year(), month.next()),
            };
            Date::from_calendar_date(year, month, 1)
                .map_err(|e| BillingError::InvalidInput(format!("date out of range: {e}")))?
        }
    };
    Ok(next.with_time(Time::MIDNIGHT).assume_utc())
}

#[cfg(test)]
mod tests {
    use super::*;
    use time::macros::datetime;

    #[test]
    fn day_keys_split_at_utc_midnight() {
        let before = datetime!(2024-03-01 23:59:59 UTC);
        let after = datetime!(2024-03-02 00:00:01 UTC);
        assert_eq!(period_key(before, ResetPeriod::Day), "2024-03-01");
        assert_eq!(period_key(after, ResetPeriod::Day), "2024-03-02");
    }

    #[test]
    fn month_keys_stable_within_a_month() {
        let first = datetime!(2024-03-01 23:59:59 UTC);
        let second = datetime!(2024-03-02 00:00:01 UTC);
        let next_month = datetime!(2024-04-01 00:00:00 UTC);
        assert_eq!(
            period_key(first, ResetPeriod::Month),
            period_key(second, ResetPeriod::Month)
        );
        assert_ne!(
            period_key(second, ResetPeriod::Month),
            period_key(next_month, ResetPeriod::Month)
        );
    }

    #[test]
    fn reset_at_is_next_utc_midnight() {
        let now = datetime!(2024-03-01 13:45:00 UTC);
        assert_eq!(
            reset_at(now, ResetPeriod::Day).unwrap(),
            datetime!(2024-03-02 00:00:00 UTC)
        );
    }

    #[test]
    fn reset_at_rolls_month_and_year() {
        let mid_month = datetime!(2024-06-15 08:00:00 UTC);
        assert_eq!(
            reset_at(mid_month, ResetPeriod::Month).unwrap(),
            datetime!(2024-07-01 00:00:00 UTC)
        );

        let december = datetime!(2024-12-31 23:59:59 UTC);
        assert_eq!(
            reset_at(december, ResetPeriod::Month).unwrap(),
            datetime!(2025-01-01 00:00:00 UTC)
        );
    }
}
