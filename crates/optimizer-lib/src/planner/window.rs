//! Off-hours windows and the recurrence rules derived from them

use crate::error::{OptimizerError, Result};
use chrono::{DateTime, Datelike, Duration, FixedOffset, NaiveTime, TimeZone, Timelike, Utc, Weekday};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

/// Largest UTC offset accepted, in minutes
const MAX_UTC_OFFSET_MINUTES: i32 = 14 * 60;

/// Day of the week, ordered Monday first
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DayOfWeek {
    Mon,
    Tue,
    Wed,
    Thu,
    Fri,
    Sat,
    Sun,
}

impl DayOfWeek {
    pub const ALL: [DayOfWeek; 7] = [
        DayOfWeek::Mon,
        DayOfWeek::Tue,
        DayOfWeek::Wed,
        DayOfWeek::Thu,
        DayOfWeek::Fri,
        DayOfWeek::Sat,
        DayOfWeek::Sun,
    ];

    /// Day number in cron notation (Sunday = 0)
    pub fn cron_index(&self) -> u32 {
        match self {
            DayOfWeek::Sun => 0,
            other => *other as u32 + 1,
        }
    }

    /// Parse a list of day expressions into a set
    ///
    /// Accepts single days (`mon`, `monday`), ranges (`mon-fri`), and the
    /// shorthands `weekdays`, `weekends` and `daily`.
    pub fn parse_set<I, S>(items: I) -> Result<BTreeSet<DayOfWeek>>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut days = BTreeSet::new();
        for item in items {
            let item = item.as_ref().trim().to_lowercase();
            match item.as_str() {
                "weekdays" => days.extend(&Self::ALL[..5]),
                "weekends" => days.extend(&Self::ALL[5..]),
                "daily" | "all" | "everyday" => days.extend(&Self::ALL),
                _ => match item.split_once('-') {
                    Some((from, to)) => {
                        let from: DayOfWeek = from.parse()?;
                        let to: DayOfWeek = to.parse()?;
                        if from > to {
                            return Err(OptimizerError::Config(format!(
                                "day range '{}' runs backwards",
                                item
                            )));
                        }
                        days.extend(Self::ALL.iter().filter(|d| **d >= from && **d <= to));
                    }
                    None => {
                        days.insert(item.parse()?);
                    }
                },
            }
        }
        Ok(days)
    }
}

impl FromStr for DayOfWeek {
    type Err = OptimizerError;

    fn from_str(s: &str) -> Result<Self> {
        let day = match s.trim().to_lowercase().as_str() {
            "mon" | "monday" => DayOfWeek::Mon,
            "tue" | "tues" | "tuesday" => DayOfWeek::Tue,
            "wed" | "wednesday" => DayOfWeek::Wed,
            "thu" | "thurs" | "thursday" => DayOfWeek::Thu,
            "fri" | "friday" => DayOfWeek::Fri,
            "sat" | "saturday" => DayOfWeek::Sat,
            "sun" | "sunday" => DayOfWeek::Sun,
            other => {
                return Err(OptimizerError::Config(format!("unknown day of week '{}'", other)))
            }
        };
        Ok(day)
    }
}

impl From<Weekday> for DayOfWeek {
    fn from(day: Weekday) -> Self {
        Self::ALL[day.num_days_from_monday() as usize]
    }
}

impl fmt::Display for DayOfWeek {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            DayOfWeek::Mon => "mon",
            DayOfWeek::Tue => "tue",
            DayOfWeek::Wed => "wed",
            DayOfWeek::Thu => "thu",
            DayOfWeek::Fri => "fri",
            DayOfWeek::Sat => "sat",
            DayOfWeek::Sun => "sun",
        };
        f.write_str(s)
    }
}

/// Parse a local wall-clock time written as `HH:MM`
pub fn parse_time(value: &str) -> Result<NaiveTime> {
    NaiveTime::parse_from_str(value.trim(), "%H:%M")
        .map_err(|e| OptimizerError::Config(format!("invalid time '{}': {}", value, e)))
}

fn utc_offset(minutes: i32) -> Result<FixedOffset> {
    if minutes.abs() > MAX_UTC_OFFSET_MINUTES {
        return Err(OptimizerError::Config(format!(
            "utc offset {} minutes is out of range",
            minutes
        )));
    }
    FixedOffset::east_opt(minutes * 60)
        .ok_or_else(|| OptimizerError::Config(format!("invalid utc offset {} minutes", minutes)))
}

/// Days on which instances run, and when they start and stop (local time)
///
/// Outside `start..stop` on the listed days, and on every other day, the
/// instances are expected to be off.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScheduleWindow {
    pub days: BTreeSet<DayOfWeek>,
    /// Local time instances are started
    pub start: NaiveTime,
    /// Local time instances are stopped, strictly after `start`
    pub stop: NaiveTime,
    pub utc_offset_minutes: i32,
}

impl Default for ScheduleWindow {
    fn default() -> Self {
        Self {
            days: DayOfWeek::ALL[..5].iter().copied().collect(),
            start: NaiveTime::from_hms_opt(7, 0, 0).unwrap_or_default(),
            stop: NaiveTime::from_hms_opt(19, 0, 0).unwrap_or_default(),
            utc_offset_minutes: 0,
        }
    }
}

impl ScheduleWindow {
    /// Build a validated window
    pub fn new(
        days: BTreeSet<DayOfWeek>,
        start: NaiveTime,
        stop: NaiveTime,
        utc_offset_minutes: i32,
    ) -> Result<Self> {
        let window = Self {
            days,
            start,
            stop,
            utc_offset_minutes,
        };
        window.validate()?;
        Ok(window)
    }

    /// Build a window from configuration strings
    pub fn parse<S: AsRef<str>>(
        days: &[S],
        start: &str,
        stop: &str,
        utc_offset_minutes: i32,
    ) -> Result<Self> {
        Self::new(
            DayOfWeek::parse_set(days)?,
            parse_time(start)?,
            parse_time(stop)?,
            utc_offset_minutes,
        )
    }

    pub fn validate(&self) -> Result<()> {
        if self.days.is_empty() {
            return Err(OptimizerError::Config(
                "schedule window has no days".to_string(),
            ));
        }
        if self.stop <= self.start {
            return Err(OptimizerError::Config(format!(
                "schedule window stop {} is not after start {}",
                self.stop.format("%H:%M"),
                self.start.format("%H:%M")
            )));
        }
        utc_offset(self.utc_offset_minutes)?;
        Ok(())
    }

    pub fn start_rule(&self) -> RecurrenceRule {
        RecurrenceRule::new(self.days.clone(), self.start, self.utc_offset_minutes)
    }

    pub fn stop_rule(&self) -> RecurrenceRule {
        RecurrenceRule::new(self.days.clone(), self.stop, self.utc_offset_minutes)
    }
}

/// Weekly recurrence at a fixed local time
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct RecurrenceRule {
    pub days: BTreeSet<DayOfWeek>,
    /// Local wall-clock time
    pub at: NaiveTime,
    pub utc_offset_minutes: i32,
    /// Same rule in cron notation, evaluated in the local offset
    pub cron: String,
}

impl RecurrenceRule {
    pub fn new(days: BTreeSet<DayOfWeek>, at: NaiveTime, utc_offset_minutes: i32) -> Self {
        let cron = cron_expression(&days, at);
        Self {
            days,
            at,
            utc_offset_minutes,
            cron,
        }
    }

    /// First instant strictly after `after` matching the rule
    ///
    /// `None` only for rules with no days or an unusable offset.
    pub fn next_occurrence(&self, after: DateTime<Utc>) -> Option<DateTime<Utc>> {
        let offset = utc_offset(self.utc_offset_minutes).ok()?;
        let local_date = after.with_timezone(&offset).date_naive();

        (0..=7)
            .map(|delta| local_date + Duration::days(delta))
            .filter(|date| self.days.contains(&DayOfWeek::from(date.weekday())))
            .filter_map(|date| offset.from_local_datetime(&date.and_time(self.at)).single())
            .map(|local| local.with_timezone(&Utc))
            .find(|candidate| *candidate > after)
    }
}

fn cron_expression(days: &BTreeSet<DayOfWeek>, at: NaiveTime) -> String {
    let mut indices: Vec<u32> = days.iter().map(DayOfWeek::cron_index).collect();
    indices.sort_unstable();
    let day_field = if indices.len() == 7 {
        "*".to_string()
    } else {
        indices
            .iter()
            .map(u32::to_string)
            .collect::<Vec<_>>()
            .join(",")
    };
    format!("{} {} * * {}", at.minute(), at.hour(), day_field)
}
