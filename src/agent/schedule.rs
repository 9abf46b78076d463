//! Working-hours gate
//!
//! Nodes on shared workstations only take jobs outside office hours.
//! The schedule is a set of working days plus one daily window; a
//! window whose end is earlier than its start wraps past midnight.
//! Day membership is always checked against the current day, so an
//! overnight window's morning tail still requires the morning's own
//! day to be listed.

use chrono::{Datelike, Local, NaiveTime, Timelike, Weekday};
use thiserror::Error;

use crate::api::AvailableHours;

/// Schedule configuration that does not parse.
#[derive(Debug, Error)]
pub enum ScheduleError {
    /// A time of day that is not `HH:MM`.
    #[error("invalid time of day '{value}', expected HH:MM")]
    InvalidTime {
        /// The rejected value.
        value: String,
    },

    /// A day name chrono does not recognize.
    #[error("unknown day name '{value}'")]
    UnknownDay {
        /// The rejected value.
        value: String,
    },
}

/// When the node accepts new work.
#[derive(Debug, Clone)]
pub struct WorkSchedule {
    restricted: bool,
    start: NaiveTime,
    end: NaiveTime,
    days: Vec<Weekday>,
}

impl WorkSchedule {
    /// A schedule that is always open.
    #[must_use]
    pub fn unrestricted() -> Self {
        Self {
            restricted: false,
            start: NaiveTime::MIN,
            end: NaiveTime::MIN,
            days: Vec::new(),
        }
    }

    /// A schedule limited to `days`, open from `start` to `end` each
    /// listed day. `end` earlier than `start` means the window runs
    /// overnight.
    ///
    /// # Errors
    ///
    /// Returns a `ScheduleError` when a time is not `HH:MM` or a day
    /// name is unknown.
    pub fn restricted(start: &str, end: &str, days: &[String]) -> Result<Self, ScheduleError> {
        let parsed_days = days
            .iter()
            .map(|day| {
                day.parse::<Weekday>().map_err(|_| ScheduleError::UnknownDay {
                    value: day.clone(),
                })
            })
            .collect::<Result<Vec<_>, _>>()?;

        Ok(Self {
            restricted: true,
            start: parse_time(start)?,
            end: parse_time(end)?,
            days: parsed_days,
        })
    }

    /// Whether new work may start right now.
    #[must_use]
    pub fn is_open_now(&self) -> bool {
        let now = Local::now();
        let time = NaiveTime::from_hms_opt(now.hour(), now.minute(), 0)
            .unwrap_or(NaiveTime::MIN);
        self.is_open_at(now.weekday(), time)
    }

    /// Whether new work may start at the given local day and time.
    /// Both window boundaries are inclusive.
    #[must_use]
    pub fn is_open_at(&self, day: Weekday, time: NaiveTime) -> bool {
        if !self.restricted {
            return true;
        }
        if !self.days.contains(&day) {
            return false;
        }

        if self.end < self.start {
            time >= self.start || time <= self.end
        } else {
            time >= self.start && time <= self.end
        }
    }

    /// The windows advertised to the server at registration. An
    /// unrestricted schedule advertises a single all-day entry.
    #[must_use]
    pub fn available_hours(&self) -> Vec<AvailableHours> {
        if !self.restricted {
            return vec![AvailableHours {
                day_of_week: "All".to_string(),
                start_time: "00:00".to_string(),
                end_time: "23:59".to_string(),
            }];
        }

        self.days
            .iter()
            .map(|day| AvailableHours {
                day_of_week: day_name(*day).to_string(),
                start_time: self.start.format("%H:%M").to_string(),
                end_time: self.end.format("%H:%M").to_string(),
            })
            .collect()
    }
}

fn parse_time(value: &str) -> Result<NaiveTime, ScheduleError> {
    NaiveTime::parse_from_str(value, "%H:%M").map_err(|_| ScheduleError::InvalidTime {
        value: value.to_string(),
    })
}

fn day_name(day: Weekday) -> &'static str {
    match day {
        Weekday::Mon => "Monday",
        Weekday::Tue => "Tuesday",
        Weekday::Wed => "Wednesday",
        Weekday::Thu => "Thursday",
        Weekday::Fri => "Friday",
        Weekday::Sat => "Saturday",
        Weekday::Sun => "Sunday",
    }
}
