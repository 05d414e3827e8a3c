//! Calendar dates and due-date arithmetic
//!
//! Dates carry no time of day. Whenever a date has to become an instant
//! (for ordering completions or measuring distances between dates) it is
//! anchored at 11:00 local time, so whole-day differences stay whole even
//! across daylight-saving transitions.

use chrono::{Datelike, Local, NaiveDate, NaiveTime, TimeZone};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Seconds in a civil day
pub const SECONDS_PER_DAY: i64 = 86_400;

/// Local hour used to turn a date into an instant
const ANCHOR_HOUR: u32 = 11;

/// Marker prefix for approximate completion dates
const APPROXIMATE_PREFIX: char = '~';

/// Calendar errors
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CalendarError {
    #[error("Invalid date '{0}': expected YYYY-MM-DD")]
    InvalidFormat(String),

    #[error("Date does not exist: {year:04}-{month:02}-{day:02}")]
    InvalidDate { year: i32, month: u32, day: u32 },

    #[error("Invalid month index: {0}")]
    InvalidMonth(u32),
}

/// A Gregorian calendar date without time of day
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct CalendarDate(NaiveDate);

impl CalendarDate {
    /// Build a date, rejecting days that do not exist (e.g. February 30)
    pub fn new(year: i32, month: u32, day: u32) -> Result<Self, CalendarError> {
        NaiveDate::from_ymd_opt(year, month, day)
            .map(Self)
            .ok_or(CalendarError::InvalidDate { year, month, day })
    }

    pub fn from_naive(date: NaiveDate) -> Self {
        Self(date)
    }

    pub fn as_naive(&self) -> NaiveDate {
        self.0
    }

    /// Today's date in the local timezone (mock-time aware)
    pub fn today() -> Self {
        Self(crate::now().date_naive())
    }

    pub fn year(&self) -> i32 {
        self.0.year()
    }

    /// Month, 1..=12
    pub fn month(&self) -> u32 {
        self.0.month()
    }

    pub fn day(&self) -> u32 {
        self.0.day()
    }

    /// Day 1 of the month after this date's month
    pub fn first_of_next_month(&self) -> Self {
        let (year, month) = if self.month() == 12 {
            (self.year() + 1, 1)
        } else {
            (self.year(), self.month() + 1)
        };
        NaiveDate::from_ymd_opt(year, month, 1)
            .map(Self)
            .unwrap_or(*self)
    }
}

impl fmt::Display for CalendarDate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.format("%Y-%m-%d"))
    }
}

impl FromStr for CalendarDate {
    type Err = CalendarError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        parse_date(s)
    }
}

impl Serialize for CalendarDate {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for CalendarDate {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let text = String::deserialize(deserializer)?;
        parse_date(&text).map_err(serde::de::Error::custom)
    }
}

/// Parse a strict `YYYY-MM-DD` date
pub fn parse_date(text: &str) -> Result<CalendarDate, CalendarError> {
    let text = text.trim();
    let parts: Vec<&str> = text.split('-').collect();
    if parts.len() != 3
        || parts[0].len() != 4
        || parts[1].len() != 2
        || parts[2].len() != 2
        || !parts.iter().all(|p| p.chars().all(|c| c.is_ascii_digit()))
    {
        return Err(CalendarError::InvalidFormat(text.to_string()));
    }

    let parse = |s: &str| {
        s.parse::<u32>()
            .map_err(|_| CalendarError::InvalidFormat(text.to_string()))
    };
    let year = parse(parts[0])? as i32;
    let month = parse(parts[1])?;
    let day = parse(parts[2])?;
    CalendarDate::new(year, month, day)
}

/// Parse a completion date, which may carry a leading `~` for "approximate".
///
/// Returns the date and whether it is approximate.
pub fn parse_completion_date(text: &str) -> Result<(CalendarDate, bool), CalendarError> {
    let text = text.trim();
    match text.strip_prefix(APPROXIMATE_PREFIX) {
        Some(rest) => Ok((parse_date(rest)?, true)),
        None => Ok((parse_date(text)?, false)),
    }
}

/// Inverse of [`parse_completion_date`]
pub fn format_completion_date(date: CalendarDate, is_approximate: bool) -> String {
    if is_approximate {
        format!("{}{}", APPROXIMATE_PREFIX, date)
    } else {
        date.to_string()
    }
}

/// Epoch seconds of the date at the 11:00 local anchor
pub fn date_to_timestamp(date: CalendarDate) -> i64 {
    let naive = date
        .0
        .and_hms_opt(ANCHOR_HOUR, 0, 0)
        .unwrap_or_else(|| date.0.and_time(NaiveTime::MIN));
    Local
        .from_local_datetime(&naive)
        .earliest()
        .map(|dt| dt.timestamp())
        .unwrap_or_else(|| naive.and_utc().timestamp())
}

/// Signed distance `a - b` in days.
///
/// Always lands on (or within an hour's fraction of) an integer for dates in
/// the same timezone.
pub fn days_between(a: CalendarDate, b: CalendarDate) -> f64 {
    (date_to_timestamp(a) - date_to_timestamp(b)) as f64 / SECONDS_PER_DAY as f64
}

/// [`days_between`] rounded to the nearest whole day
pub fn whole_days_between(a: CalendarDate, b: CalendarDate) -> i64 {
    days_between(a, b).round() as i64
}

/// Offset a date by a signed number of days.
///
/// Saturates at the input date if the result would leave chrono's range.
pub fn add_days(date: CalendarDate, days: i64) -> CalendarDate {
    date.0
        .checked_add_signed(chrono::Duration::days(days))
        .map(CalendarDate)
        .unwrap_or(date)
}

/// Which months of the year count toward scheduling
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ActiveMonths([bool; 12]);

impl ActiveMonths {
    pub fn new(months: [bool; 12]) -> Self {
        Self(months)
    }

    pub fn all() -> Self {
        Self([true; 12])
    }

    pub fn none() -> Self {
        Self([false; 12])
    }

    /// Only the listed months (1..=12) are active
    pub fn only(months: &[u32]) -> Result<Self, CalendarError> {
        let mut flags = [false; 12];
        for &month in months {
            if !(1..=12).contains(&month) {
                return Err(CalendarError::InvalidMonth(month));
            }
            flags[(month - 1) as usize] = true;
        }
        Ok(Self(flags))
    }

    /// Whether `month` (1..=12) is active
    pub fn is_active(&self, month: u32) -> bool {
        month
            .checked_sub(1)
            .and_then(|index| self.0.get(index as usize))
            .copied()
            .unwrap_or(false)
    }

    pub fn contains(&self, date: CalendarDate) -> bool {
        self.is_active(date.month())
    }

    pub fn any_active(&self) -> bool {
        self.0.iter().any(|&active| active)
    }

    pub fn as_array(&self) -> &[bool; 12] {
        &self.0
    }
}

/// Project the next due date of a recurring task.
///
/// `active_months == None` means every month is active. Only days inside
/// active months are counted toward `frequency`.
pub fn project_due_date(
    frequency: u32,
    active_months: Option<&ActiveMonths>,
    last_completion: Option<CalendarDate>,
    today: CalendarDate,
) -> CalendarDate {
    let Some(last) = last_completion else {
        return today;
    };

    let months = match active_months {
        None => return add_days(last, i64::from(frequency)),
        Some(months) if !months.any_active() => return today,
        Some(months) => months,
    };

    let mut date = last;
    for _ in 0..frequency {
        let next = add_days(date, 1);
        if next == date {
            return today;
        }
        date = next;
        while !months.contains(date) {
            let next = date.first_of_next_month();
            if next == date {
                return today;
            }
            date = next;
        }
    }
    date
}
