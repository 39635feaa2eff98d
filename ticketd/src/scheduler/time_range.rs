// SPDX-License-Identifier: MIT
//
// Author: Johannes Leupolz <dev@leupolz.eu>

use regex::Regex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::sync::OnceLock;
use time::{OffsetDateTime, Time};

use crate::error::ConfigError;

/// A window of the (local) time of day during which a scheduler may step.
///
/// `start` is inclusive and `end` exclusive. A window whose end lies before
/// its start wraps around midnight, e.g. `22:00-06:00`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct TimeRange {
    start: Time,
    end: Time,
}

static RANGE_PATTERN: OnceLock<Regex> = OnceLock::new();

fn range_pattern() -> &'static Regex {
    RANGE_PATTERN.get_or_init(|| {
        Regex::new(r"^\s*(\d{1,2}):(\d{2})(?::(\d{2}))?\s*-\s*(\d{1,2}):(\d{2})(?::(\d{2}))?\s*$")
            .expect("time range pattern is valid")
    })
}

impl TimeRange {
    pub fn new(start: Time, end: Time) -> Self {
        Self { start, end }
    }

    pub fn start(&self) -> Time {
        self.start
    }

    pub fn end(&self) -> Time {
        self.end
    }

    pub fn within(&self, now: Time) -> bool {
        if self.start <= self.end {
            self.start <= now && now < self.end
        } else {
            now >= self.start || now < self.end
        }
    }
}

impl FromStr for TimeRange {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || ConfigError::InvalidTimeRange(s.to_string());
        let caps = range_pattern().captures(s).ok_or_else(invalid)?;
        let field = |i: usize| -> Result<u8, ConfigError> {
            match caps.get(i) {
                Some(m) => m.as_str().parse::<u8>().map_err(|_| invalid()),
                None => Ok(0),
            }
        };
        let start = Time::from_hms(field(1)?, field(2)?, field(3)?).map_err(|_| invalid())?;
        let end = Time::from_hms(field(4)?, field(5)?, field(6)?).map_err(|_| invalid())?;
        Ok(Self { start, end })
    }
}

impl TryFrom<String> for TimeRange {
    type Error = ConfigError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<TimeRange> for String {
    fn from(range: TimeRange) -> Self {
        range.to_string()
    }
}

fn write_time(f: &mut fmt::Formatter<'_>, time: Time) -> fmt::Result {
    write!(f, "{:02}:{:02}", time.hour(), time.minute())?;
    if time.second() != 0 {
        write!(f, ":{:02}", time.second())?;
    }
    Ok(())
}

impl fmt::Display for TimeRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write_time(f, self.start)?;
        f.write_str("-")?;
        write_time(f, self.end)
    }
}

/// Current local time of day. Falls back to UTC when the local offset cannot
/// be determined (which `time` refuses to do in multi-threaded processes on
/// some platforms).
pub fn local_time_of_day() -> Time {
    OffsetDateTime::now_local()
        .unwrap_or_else(|_| OffsetDateTime::now_utc())
        .time()
}

/// True if `ranges` is non-empty and `now` falls outside every window.
pub fn is_restricted(ranges: &[TimeRange], now: Time) -> bool {
    !ranges.is_empty() && !ranges.iter().any(|range| range.within(now))
}
