//! Execution window math in the deployment's fixed time zone.
//!
//! Windows are "HH:MM" pairs compared as minute-of-day integers, inclusive
//! on both ends. The scheduler fires on local hour boundaries.

use chrono::{DateTime, Duration, FixedOffset, NaiveDate, NaiveDateTime, Offset, Timelike, Utc};

use crate::rule::ExecutionWindow;

/// Parse "HH:MM" into minute-of-day.
pub fn parse_hhmm(s: &str) -> Option<u32> {
    let (h, m) = s.trim().split_once(':')?;
    let h: u32 = h.parse().ok()?;
    let m: u32 = m.parse().ok()?;
    if h < 24 && m < 60 { Some(h * 60 + m) } else { None }
}

/// Parse both ends of a window; `None` if either is malformed.
pub fn window_bounds(window: &ExecutionWindow) -> Option<(u32, u32)> {
    Some((parse_hhmm(&window.start_time)?, parse_hhmm(&window.end_time)?))
}

fn local(now: DateTime<Utc>, offset: FixedOffset) -> NaiveDateTime {
    now.with_timezone(&offset).naive_local()
}

fn to_utc(local: NaiveDateTime, offset: FixedOffset) -> DateTime<Utc> {
    let utc = local - Duration::seconds(offset.local_minus_utc() as i64);
    DateTime::from_naive_utc_and_offset(utc, Utc)
}

fn at_minute(date: NaiveDate, minute_of_day: u32, offset: FixedOffset) -> DateTime<Utc> {
    let midnight = date.and_time(chrono::NaiveTime::MIN);
    to_utc(midnight + Duration::minutes(minute_of_day as i64), offset)
}

/// Local minute-of-day of `now`.
pub fn minute_of_day(now: DateTime<Utc>, offset: FixedOffset) -> u32 {
    let t = local(now, offset);
    t.hour() * 60 + t.minute()
}

/// Whether a scheduled run may execute at `now`.
/// A disabled window is always open; a malformed one is never open.
pub fn is_open(window: &ExecutionWindow, now: DateTime<Utc>, offset: FixedOffset) -> bool {
    if !window.enabled {
        return true;
    }
    match window_bounds(window) {
        Some((start, end)) => {
            let current = minute_of_day(now, offset);
            current >= start && current <= end
        }
        None => {
            tracing::warn!(
                "Malformed execution window: '{}'-'{}'",
                window.start_time,
                window.end_time
            );
            false
        }
    }
}

/// The next local top-of-hour strictly after `now`.
pub fn next_hour_boundary(now: DateTime<Utc>, offset: FixedOffset) -> DateTime<Utc> {
    let t = local(now, offset);
    let hour_start = t.date().and_time(chrono::NaiveTime::MIN) + Duration::hours(t.hour() as i64);
    to_utc(hour_start + Duration::hours(1), offset)
}

/// When a rule will next be picked up by the scheduler.
///
/// Before the window: today's start. At or after its end: tomorrow's start.
/// Inside the window, or with no window: the next hour boundary.
pub fn next_execution_time(
    window: &ExecutionWindow,
    now: DateTime<Utc>,
    offset: FixedOffset,
) -> DateTime<Utc> {
    let next_hour = next_hour_boundary(now, offset);
    if !window.enabled {
        return next_hour;
    }
    let Some((start, end)) = window_bounds(window) else {
        return next_hour;
    };
    let today = local(now, offset).date();
    let current = minute_of_day(now, offset);
    if current < start {
        return at_minute(today, start, offset);
    }
    if current >= end {
        let tomorrow = today.succ_opt().unwrap_or(today);
        return at_minute(tomorrow, start, offset);
    }
    next_hour
}

/// Build the fixed offset from minutes east of UTC.
pub fn offset_from_minutes(minutes: i32) -> FixedOffset {
    FixedOffset::east_opt(minutes * 60).unwrap_or_else(|| {
        tracing::warn!("Invalid UTC offset {minutes}min, falling back to UTC");
        Utc.fix()
    })
}
