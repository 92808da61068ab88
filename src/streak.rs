use std::collections::BTreeSet;

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

/// Largest gap between two completions that still continues a streak.
/// Calendar dates are a whole number of days apart, so in practice a one-day
/// gap continues the streak and a two-day gap breaks it.
pub const STREAK_TOLERANCE_HOURS: i64 = 36;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreakResult {
    pub current: u32,
    pub updated_max: u32,
}

/// Derive the current streak from a habit's completion-date history.
///
/// The streak is only alive if the habit was completed on `reference_date`.
/// Duplicate dates count once and dates after `reference_date` are ignored.
pub fn compute_streak<I>(completion_dates: I, reference_date: NaiveDate, prior_max: u32) -> StreakResult
where
    I: IntoIterator<Item = NaiveDate>,
{
    let unique: BTreeSet<NaiveDate> = completion_dates
        .into_iter()
        .filter(|d| *d <= reference_date)
        .collect();

    let mut descending = unique.into_iter().rev();

    let current = match descending.next() {
        Some(latest) if latest == reference_date => {
            let mut streak = 1;
            let mut previous = latest;
            for date in descending {
                if previous.signed_duration_since(date).num_hours() > STREAK_TOLERANCE_HOURS {
                    break;
                }
                streak += 1;
                previous = date;
            }
            streak
        }
        _ => 0,
    };

    StreakResult {
        current,
        updated_max: prior_max.max(current),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn day(d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(2025, 3, d).unwrap()
    }

    #[test]
    fn test_empty_history_keeps_prior_max() {
        let result = compute_streak(Vec::new(), day(3), 4);
        assert_eq!(result, StreakResult { current: 0, updated_max: 4 });
    }

    #[test]
    fn test_consecutive_days() {
        let result = compute_streak([day(1), day(2), day(3)], day(3), 0);
        assert_eq!(result.current, 3);
        assert_eq!(result.updated_max, 3);
    }

    #[test]
    fn test_two_day_gap_breaks_streak() {
        let result = compute_streak([day(1), day(3)], day(3), 0);
        assert_eq!(result.current, 1);
    }

    #[test]
    fn test_not_completed_today_is_zero() {
        let result = compute_streak([day(1), day(2)], day(3), 2);
        assert_eq!(result, StreakResult { current: 0, updated_max: 2 });
    }

    #[test]
    fn test_duplicate_today_is_idempotent() {
        let once = compute_streak([day(2), day(3)], day(3), 0);
        let twice = compute_streak([day(2), day(3), day(3)], day(3), 0);
        assert_eq!(once, twice);
        assert_eq!(twice.current, 2);
        assert_eq!(compute_streak([day(2), day(3)], day(3), 0), once);
    }

    #[test]
    fn test_unsorted_input() {
        let result = compute_streak([day(5), day(3), day(4), day(1)], day(5), 0);
        assert_eq!(result.current, 3);
    }

    #[test]
    fn test_future_dates_ignored() {
        let result = compute_streak([day(2), day(3), day(9)], day(3), 0);
        assert_eq!(result.current, 2);
    }

    #[test]
    fn test_prior_max_not_lowered() {
        let result = compute_streak([day(3)], day(3), 10);
        assert_eq!(result, StreakResult { current: 1, updated_max: 10 });
    }

    #[test]
    fn test_streak_across_month_boundary() {
        let dates = [
            NaiveDate::from_ymd_opt(2025, 2, 27).unwrap(),
            NaiveDate::from_ymd_opt(2025, 2, 28).unwrap(),
            day(1),
        ];
        assert_eq!(compute_streak(dates, day(1), 0).current, 3);
    }
}
