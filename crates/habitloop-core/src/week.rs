//! Week-window date arithmetic.
//!
//! Habits track completion over a rolling 7-day window that resets on a
//! configurable weekday. This module holds the calendar helpers shared by
//! the streak engine and the rollover scheduler.

use chrono::{DateTime, Datelike, Duration, NaiveTime, Utc, Weekday};

/// Number of day slots in a progress window.
pub const DAYS_PER_WEEK: usize = 7;

/// Midnight (UTC) of the next occurrence of `reset_day` strictly after `now`.
///
/// If `now` already falls on `reset_day` the result is one full week ahead,
/// so a habit rolled over today is never due again until next week.
pub fn next_reset_after(now: DateTime<Utc>, reset_day: Weekday) -> DateTime<Utc> {
    let today = now.weekday().num_days_from_monday() as i64;
    let target = reset_day.num_days_from_monday() as i64;
    let mut ahead = target - today;
    if ahead <= 0 {
        ahead += 7;
    }
    (now.date_naive() + Duration::days(ahead))
        .and_time(NaiveTime::MIN)
        .and_utc()
}

/// Whole days elapsed from `earlier` to `later`, truncated toward zero.
///
/// 23 hours counts as 0 days, 25 hours as 1. Negative when the clock has
/// moved backwards; callers clamp as needed.
pub fn whole_days_between(earlier: DateTime<Utc>, later: DateTime<Utc>) -> i64 {
    (later - earlier).num_days()
}
