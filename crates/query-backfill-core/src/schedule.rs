//! Clock-aligned scheduling.
//!
//! A query with interval `I` and offset `O` fires at `k * I + O` past the
//! Unix epoch. [`next_wake`] computes the first such instant after `now`;
//! [`Scheduler`] picks the earliest one across several query definitions.

use std::time::Duration;

use chrono::{DateTime, TimeDelta, Utc};

use crate::config::QuerySpec;

/// Truncate `now` down to a multiple of `interval` since the Unix epoch.
///
/// A non-positive `interval` returns `now` unchanged.
pub fn truncate(now: DateTime<Utc>, interval: TimeDelta) -> DateTime<Utc> {
    let Some(step) = interval.num_nanoseconds().filter(|&n| n > 0) else {
        return now;
    };
    let Some(ts) = now.timestamp_nanos_opt() else {
        return now;
    };
    now - TimeDelta::nanoseconds(ts.rem_euclid(step))
}

/// The next wake-up instant for `interval`/`offset`, strictly after `now`.
///
/// `truncate(now) + interval + offset`, one more interval later if that is
/// not in the future.
pub fn next_wake(now: DateTime<Utc>, interval: TimeDelta, offset: TimeDelta) -> DateTime<Utc> {
    let mut at = truncate(now, interval) + interval + offset;
    if at <= now {
        at += interval;
    }
    at
}

/// How long to sleep from `now` until the next wake-up.
///
/// A wait longer than one day is shortened by exactly one day, which keeps
/// large positive offsets within the current day. Never negative.
pub fn next_wake_delay(now: DateTime<Utc>, interval: TimeDelta, offset: TimeDelta) -> Duration {
    let mut wait = next_wake(now, interval, offset) - now;
    if wait > TimeDelta::days(1) {
        wait -= TimeDelta::days(1);
    }
    wait.to_std().unwrap_or(Duration::ZERO)
}

/// The next cycle due across all configured queries.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Due {
    /// Index of the query definition.
    pub index: usize,
    /// Time to sleep before running it.
    pub delay: Duration,
}

/// Sequential scheduler over a fixed set of query definitions.
#[derive(Clone, Debug)]
pub struct Scheduler {
    cadences: Vec<(TimeDelta, TimeDelta)>,
}

impl Scheduler {
    /// Build a scheduler for `specs`, in configuration order.
    pub fn new(specs: &[QuerySpec]) -> Self {
        Self {
            cadences: specs.iter().map(|s| (s.interval, s.offset)).collect(),
        }
    }

    /// The definition whose next wake-up is earliest, ties going to the one
    /// configured first. `None` when there are no definitions.
    pub fn next_due(&self, now: DateTime<Utc>) -> Option<Due> {
        self.cadences
            .iter()
            .enumerate()
            .map(|(index, &(interval, offset))| Due {
                index,
                delay: next_wake_delay(now, interval, offset),
            })
            .min_by_key(|due| (due.delay, due.index))
    }
}
