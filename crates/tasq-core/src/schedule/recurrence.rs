//! Recurrence rules: pure functions from a reference time to the next due time.
//!
//! Every rule returns a time strictly after `from`; "equal to now" is never
//! due, a full period has to elapse. Calendar rules work in the offset of
//! the input timestamp and return a timestamp in that same offset.
//!
//! # 範囲外
//! chrono の表現範囲を超える場合は `None` を返す（panic しない）。
//! scheduler はその registration をスキップしてログに残す。

use std::fmt;
use std::time::Duration;

use chrono::{
    DateTime, Datelike, FixedOffset, NaiveDate, NaiveDateTime, NaiveTime, TimeDelta, Timelike,
    Weekday,
};

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum RecurrenceError {
    #[error("interval must be positive and representable, got {0:?}")]
    InvalidInterval(Duration),

    #[error("{field} {value} out of range {min}..={max}")]
    OutOfRange {
        field: &'static str,
        value: u32,
        min: u32,
        max: u32,
    },
}

fn check(field: &'static str, value: u32, min: u32, max: u32) -> Result<u32, RecurrenceError> {
    if (min..=max).contains(&value) {
        Ok(value)
    } else {
        Err(RecurrenceError::OutOfRange {
            field,
            value,
            min,
            max,
        })
    }
}

/// A stateless cadence.
pub trait Recurrence: Send + Sync + fmt::Debug {
    /// The first due time strictly after `from`, or `None` when it falls
    /// outside the representable range.
    fn next(&self, from: DateTime<FixedOffset>) -> Option<DateTime<FixedOffset>>;
}

/// Build a timestamp from a wall-clock reading in `offset`.
fn at_local(offset: FixedOffset, local: NaiveDateTime) -> Option<DateTime<FixedOffset>> {
    let utc = local.checked_sub_signed(TimeDelta::seconds(i64::from(offset.local_minus_utc())))?;
    Some(DateTime::from_naive_utc_and_offset(utc, offset))
}

/// `candidate` if it is already after `from`, else one `period` later.
fn after(
    from: DateTime<FixedOffset>,
    candidate: DateTime<FixedOffset>,
    period: TimeDelta,
) -> Option<DateTime<FixedOffset>> {
    if candidate > from {
        Some(candidate)
    } else {
        candidate.checked_add_signed(period)
    }
}

fn hm(hour: u32, minute: u32) -> NaiveTime {
    NaiveTime::from_hms_opt(hour, minute, 0).unwrap_or_default()
}

// ========================================
// Every(duration)
// ========================================

/// Fixed interval: `from + interval`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Every {
    interval: TimeDelta,
}

impl Every {
    pub fn new(interval: Duration) -> Result<Self, RecurrenceError> {
        match TimeDelta::from_std(interval) {
            Ok(delta) if delta > TimeDelta::zero() => Ok(Self { interval: delta }),
            _ => Err(RecurrenceError::InvalidInterval(interval)),
        }
    }
}

impl Recurrence for Every {
    fn next(&self, from: DateTime<FixedOffset>) -> Option<DateTime<FixedOffset>> {
        from.checked_add_signed(self.interval)
    }
}

// ========================================
// HourlyAt(minute)
// ========================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HourlyAt {
    minute: u32,
}

impl HourlyAt {
    pub fn new(minute: u32) -> Result<Self, RecurrenceError> {
        Ok(Self {
            minute: check("minute", minute, 0, 59)?,
        })
    }
}

impl Recurrence for HourlyAt {
    fn next(&self, from: DateTime<FixedOffset>) -> Option<DateTime<FixedOffset>> {
        let local = from.naive_local();
        let candidate = local.date().and_time(hm(local.hour(), self.minute));
        after(from, at_local(*from.offset(), candidate)?, TimeDelta::hours(1))
    }
}

// ========================================
// DailyAt(hour, minute)
// ========================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DailyAt {
    hour: u32,
    minute: u32,
}

impl DailyAt {
    pub fn new(hour: u32, minute: u32) -> Result<Self, RecurrenceError> {
        Ok(Self {
            hour: check("hour", hour, 0, 23)?,
            minute: check("minute", minute, 0, 59)?,
        })
    }
}

impl Recurrence for DailyAt {
    fn next(&self, from: DateTime<FixedOffset>) -> Option<DateTime<FixedOffset>> {
        let candidate = from.date_naive().and_time(hm(self.hour, self.minute));
        after(from, at_local(*from.offset(), candidate)?, TimeDelta::days(1))
    }
}

// ========================================
// WeeklyOn(weekday, hour, minute)
// ========================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WeeklyOn {
    weekday: Weekday,
    hour: u32,
    minute: u32,
}

impl WeeklyOn {
    pub fn new(weekday: Weekday, hour: u32, minute: u32) -> Result<Self, RecurrenceError> {
        Ok(Self {
            weekday,
            hour: check("hour", hour, 0, 23)?,
            minute: check("minute", minute, 0, 59)?,
        })
    }
}

impl Recurrence for WeeklyOn {
    fn next(&self, from: DateTime<FixedOffset>) -> Option<DateTime<FixedOffset>> {
        let date = from.date_naive();
        let days_ahead = (7 + self.weekday.num_days_from_monday()
            - date.weekday().num_days_from_monday())
            % 7;
        let candidate = date
            .checked_add_signed(TimeDelta::days(i64::from(days_ahead)))?
            .and_time(hm(self.hour, self.minute));
        after(from, at_local(*from.offset(), candidate)?, TimeDelta::weeks(1))
    }
}

// ========================================
// MonthlyOn(day, hour, minute)
// ========================================

/// Day-of-month cadence. Days past the end of a month clamp to its last
/// day: `MonthlyOn(31, ..)` fires on Feb 28 or 29.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MonthlyOn {
    day: u32,
    hour: u32,
    minute: u32,
}

impl MonthlyOn {
    pub fn new(day: u32, hour: u32, minute: u32) -> Result<Self, RecurrenceError> {
        Ok(Self {
            day: check("day", day, 1, 31)?,
            hour: check("hour", hour, 0, 23)?,
            minute: check("minute", minute, 0, 59)?,
        })
    }

    fn in_month(&self, year: i32, month: u32) -> Option<NaiveDateTime> {
        let day = self.day.min(last_day_of_month(year, month));
        NaiveDate::from_ymd_opt(year, month, day).map(|d| d.and_time(hm(self.hour, self.minute)))
    }
}

fn last_day_of_month(year: i32, month: u32) -> u32 {
    (28..=31)
        .rev()
        .find(|day| NaiveDate::from_ymd_opt(year, month, *day).is_some())
        .unwrap_or(28)
}

fn following_month(year: i32, month: u32) -> (i32, u32) {
    if month == 12 {
        (year + 1, 1)
    } else {
        (year, month + 1)
    }
}

impl Recurrence for MonthlyOn {
    fn next(&self, from: DateTime<FixedOffset>) -> Option<DateTime<FixedOffset>> {
        let offset = *from.offset();
        let local = from.naive_local();
        let (mut year, mut month) = (local.year(), local.month());

        // the current month may already be past; the next one never is
        for _ in 0..2 {
            if let Some(candidate) = self.in_month(year, month).and_then(|c| at_local(offset, c)) {
                if candidate > from {
                    return Some(candidate);
                }
            }
            (year, month) = following_month(year, month);
        }
        // only reachable at the edge of chrono's date range
        None
    }
}
