//! Counting-period arithmetic
//!
//! Every reset boundary in the engine comes from [`period_window`]. Days are
//! measured in the configured server offset, instants are returned in UTC.

use chrono::{DateTime, Datelike, FixedOffset, Months, NaiveDate, NaiveTime, TimeZone, Utc};
use quota_common::Period;

/// Current counting period of a principal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PeriodWindow {
    /// Most recent reset boundary at or before `now`.
    pub start: DateTime<Utc>,
    /// First reset boundary after `now`.
    pub next_reset: DateTime<Utc>,
}

impl PeriodWindow {
    /// Whether a counter last reset at `reset_at` belongs to an earlier period.
    pub fn is_stale(&self, reset_at: DateTime<Utc>) -> bool {
        reset_at < self.start
    }
}

/// Compute the counting window for `now`.
///
/// Monthly periods are anchored on the day-of-month of `anchor` (the
/// subscription start), clamped to the length of each month. Without an
/// anchor the window falls back to daily.
pub fn period_window(
    period: Period,
    anchor: Option<DateTime<Utc>>,
    now: DateTime<Utc>,
    offset: FixedOffset,
) -> Option<PeriodWindow> {
    let today = now.with_timezone(&offset).date_naive();

    match (period, anchor) {
        (Period::Monthly, Some(anchor)) => {
            let anchor_day = anchor.with_timezone(&offset).day();
            monthly_window(anchor_day, today, offset)
        }
        _ => daily_window(today, offset),
    }
}

/// Shorthand for `period_window(..).next_reset`.
pub fn next_reset_at(
    period: Period,
    anchor: Option<DateTime<Utc>>,
    now: DateTime<Utc>,
    offset: FixedOffset,
) -> Option<DateTime<Utc>> {
    period_window(period, anchor, now, offset).map(|w| w.next_reset)
}

/// Length of `month`, or `None` for a date chrono cannot represent.
pub fn days_in_month(year: i32, month: u32) -> Option<u32> {
    month_length(NaiveDate::from_ymd_opt(year, month, 1)?)
}

fn month_length(first: NaiveDate) -> Option<u32> {
    first
        .checked_add_months(Months::new(1))?
        .pred_opt()
        .map(|last| last.day())
}

fn daily_window(today: NaiveDate, offset: FixedOffset) -> Option<PeriodWindow> {
    let tomorrow = today.succ_opt()?;
    Some(PeriodWindow {
        start: start_of_day(today, offset)?,
        next_reset: start_of_day(tomorrow, offset)?,
    })
}

fn monthly_window(anchor_day: u32, today: NaiveDate, offset: FixedOffset) -> Option<PeriodWindow> {
    let this_month = today.with_day(1)?;
    let candidate = anchored_date(this_month, anchor_day)?;

    let (start, next) = if candidate <= today {
        let following = this_month.checked_add_months(Months::new(1))?;
        (candidate, anchored_date(following, anchor_day)?)
    } else {
        let preceding = this_month.checked_sub_months(Months::new(1))?;
        (anchored_date(preceding, anchor_day)?, candidate)
    };

    Some(PeriodWindow {
        start: start_of_day(start, offset)?,
        next_reset: start_of_day(next, offset)?,
    })
}

/// The anchor day in the month starting at `first`, clamped to the month's last day.
fn anchored_date(first: NaiveDate, anchor_day: u32) -> Option<NaiveDate> {
    first.with_day(anchor_day.min(month_length(first)?))
}

fn start_of_day(date: NaiveDate, offset: FixedOffset) -> Option<DateTime<Utc>> {
    offset
        .from_local_datetime(&date.and_time(NaiveTime::MIN))
        .single()
        .map(|local| local.with_timezone(&Utc))
}
