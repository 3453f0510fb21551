//! Time-based trigger schedules
//!
//! A schedule divides time into slots. A scheduled definition is due when
//! the slot containing "now" is newer than the last slot it fired for, so
//! a poller that runs late (or twice) still fires each slot at most once.

use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, Duration as ChronoDuration, NaiveTime, TimeZone, Timelike, Utc};
use serde::{Deserialize, Serialize};

use crate::duration_serde::millis;

/// When a scheduled trigger or periodic job fires (UTC)
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ScheduleSpec {
    /// Every `interval`, aligned to the Unix epoch
    Interval {
        #[serde(rename = "interval_ms", with = "millis")]
        interval: Duration,
    },

    /// Once a day at `hour:minute` UTC
    Daily { hour: u32, minute: u32 },

    /// Cron expression evaluated in UTC
    ///
    /// Five fields (`min hour dom month dow`) or the six/seven field form
    /// with leading seconds, e.g. `"0 9 * * Mon-Fri"`.
    Cron { expression: String },
}

impl ScheduleSpec {
    /// Every `interval`
    pub fn every(interval: Duration) -> Self {
        Self::Interval { interval }
    }

    /// Daily at `hour:minute` UTC
    pub fn daily_at(hour: u32, minute: u32) -> Self {
        Self::Daily { hour, minute }
    }

    /// Fire on a cron expression
    pub fn cron(expression: impl Into<String>) -> Self {
        Self::Cron {
            expression: expression.into(),
        }
    }

    /// Check the schedule is well-formed
    pub fn validate(&self) -> Result<(), String> {
        match self {
            Self::Interval { interval } if interval.as_millis() == 0 => {
                Err("interval must be greater than zero".to_string())
            }
            Self::Interval { interval } if i64::try_from(interval.as_millis()).is_err() => {
                Err("interval is too large".to_string())
            }
            Self::Daily { hour, minute } if *hour > 23 || *minute > 59 => {
                Err(format!("invalid time of day {hour:02}:{minute:02}"))
            }
            Self::Cron { expression } => parse_cron(expression).map(|_| ()),
            _ => Ok(()),
        }
    }

    /// Start of the most recent slot at or before `now`
    ///
    /// `None` when the schedule has no such slot (an invalid schedule, or a
    /// cron expression that never matched before `now`).
    pub fn current_slot(&self, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
        match self {
            Self::Interval { interval } => {
                let step = i64::try_from(interval.as_millis()).ok()?.max(1);
                let millis = now.timestamp_millis();
                DateTime::from_timestamp_millis(millis - millis.rem_euclid(step))
            }
            Self::Daily { hour, minute } => {
                let time = NaiveTime::from_hms_opt(*hour, *minute, 0)?;
                let today = Utc.from_utc_datetime(&now.date_naive().and_time(time));
                if today <= now {
                    Some(today)
                } else {
                    Some(today - ChronoDuration::days(1))
                }
            }
            Self::Cron { expression } => {
                let schedule = parse_cron(expression).ok()?;
                // Cron resolution is one second; look back from just past `now`
                let just_after = now.with_nanosecond(0)? + ChronoDuration::seconds(1);
                let slot = schedule.after(&just_after).rev().find(|slot| *slot <= now);
                slot
            }
        }
    }

    /// Whether a slot newer than `last_slot` has started by `now`
    pub fn is_due(&self, last_slot: Option<DateTime<Utc>>, now: DateTime<Utc>) -> bool {
        match (self.current_slot(now), last_slot) {
            (None, _) => false,
            (Some(slot), Some(last)) => slot > last,
            (Some(_), None) => true,
        }
    }
}

fn parse_cron(expression: &str) -> Result<cron::Schedule, String> {
    let trimmed = expression.trim();
    let normalized = if trimmed.split_whitespace().count() == 5 {
        format!("0 {trimmed}")
    } else {
        trimmed.to_string()
    };
    cron::Schedule::from_str(&normalized)
        .map_err(|e| format!("invalid cron expression '{expression}': {e}"))
}
