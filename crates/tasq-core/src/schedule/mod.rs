//! Recurrence rules used by the scheduler.

pub mod recurrence;

pub use self::recurrence::{
    DailyAt, Every, HourlyAt, MonthlyOn, Recurrence, RecurrenceError, WeeklyOn,
};
