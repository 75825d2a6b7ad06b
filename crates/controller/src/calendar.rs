//! Wall-clock helpers for watering schedules: `HH:MM` times, weekday sets,
//! and the per-minute slot the schedule loop matches against.

use anyhow::{anyhow, Context, Result};
use time::{Date, OffsetDateTime, UtcOffset, Weekday};

const WEEK: [Weekday; 7] = [
    Weekday::Monday,
    Weekday::Tuesday,
    Weekday::Wednesday,
    Weekday::Thursday,
    Weekday::Friday,
    Weekday::Saturday,
    Weekday::Sunday,
];

/// One minute of local wall-clock time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClockSlot {
    pub date: Date,
    /// Zero-padded `HH:MM`.
    pub time: String,
    pub weekday: Weekday,
}

impl ClockSlot {
    pub fn at(now: OffsetDateTime) -> Self {
        Self {
            date: now.date(),
            time: format!("{:02}:{:02}", now.hour(), now.minute()),
            weekday: now.weekday(),
        }
    }

    /// Identifies the minute across days, so a schedule can remember the last
    /// minute it fired in.
    pub fn stamp(&self) -> String {
        format!("{} {}", self.date, self.time)
    }

    /// Exact `HH:MM` match and the weekday is one of `days`.
    pub fn matches(&self, time: &str, days: &[String]) -> bool {
        let today = self.weekday.to_string();
        self.time == time && days.iter().any(|d| *d == today)
    }
}

/// Current time in `offset`.
pub fn now_in(offset: UtcOffset) -> OffsetDateTime {
    OffsetDateTime::now_utc().to_offset(offset)
}

/// Parse `+HH:MM` / `-HH:MM` (also accepts `Z` / `UTC`).
pub fn parse_utc_offset(s: &str) -> Result<UtcOffset> {
    let s = s.trim();
    if s.eq_ignore_ascii_case("z") || s.eq_ignore_ascii_case("utc") {
        return Ok(UtcOffset::UTC);
    }
    let (sign, rest) = match s.as_bytes().first() {
        Some(b'+') => (1, &s[1..]),
        Some(b'-') => (-1, &s[1..]),
        _ => return Err(anyhow!("utc offset '{s}' must start with '+' or '-'")),
    };
    let (h, m) = rest
        .split_once(':')
        .ok_or_else(|| anyhow!("utc offset '{s}' must look like +HH:MM"))?;
    if !all_digits(h) || !all_digits(m) {
        return Err(anyhow!("utc offset '{s}' must look like +HH:MM"));
    }
    let hours: i8 = h.parse().with_context(|| format!("bad hours in utc offset '{s}'"))?;
    let minutes: i8 = m
        .parse()
        .with_context(|| format!("bad minutes in utc offset '{s}'"))?;
    UtcOffset::from_hms(sign * hours, sign * minutes, 0)
        .with_context(|| format!("utc offset '{s}' out of range"))
}

/// Normalize a 24h time of day to zero-padded `HH:MM`.
pub fn parse_time_of_day(s: &str) -> Result<String, String> {
    let s = s.trim();
    let (h, m) = s
        .split_once(':')
        .ok_or_else(|| format!("time '{s}' must look like HH:MM"))?;
    if h.is_empty() || h.len() > 2 || m.len() != 2 || !all_digits(h) || !all_digits(m) {
        return Err(format!("time '{s}' must look like HH:MM"));
    }
    let hour: u8 = h.parse().map_err(|_| format!("bad hour in time '{s}'"))?;
    let minute: u8 = m.parse().map_err(|_| format!("bad minute in time '{s}'"))?;
    if hour > 23 || minute > 59 {
        return Err(format!("time '{s}' is not a valid time of day"));
    }
    Ok(format!("{hour:02}:{minute:02}"))
}

/// `str::parse` on integers accepts a leading sign; clock fields do not.
fn all_digits(s: &str) -> bool {
    !s.is_empty() && s.bytes().all(|b| b.is_ascii_digit())
}

/// Parse weekday names (full or three-letter, any case). Items may also be
/// comma-separated lists. Returns canonical names, Monday first, no repeats.
pub fn parse_days<'a, I>(items: I) -> Result<Vec<String>, String>
where
    I: IntoIterator<Item = &'a str>,
{
    let mut found = [false; 7];
    for item in items {
        for name in item.split(',').map(str::trim).filter(|n| !n.is_empty()) {
            let idx = weekday_index(name).ok_or_else(|| format!("unknown weekday '{name}'"))?;
            found[idx] = true;
        }
    }

    let days: Vec<String> = WEEK
        .iter()
        .zip(found)
        .filter(|(_, on)| *on)
        .map(|(d, _)| d.to_string())
        .collect();

    if days.is_empty() {
        return Err("at least one weekday is required".to_string());
    }
    Ok(days)
}

/// Storage form of a parsed day list.
pub fn join_days(days: &[String]) -> String {
    days.join(",")
}

/// Inverse of [`join_days`].
pub fn split_days(stored: &str) -> Vec<String> {
    stored
        .split(',')
        .map(str::trim)
        .filter(|d| !d.is_empty())
        .map(str::to_string)
        .collect()
}

fn weekday_index(name: &str) -> Option<usize> {
    let lower = name.to_ascii_lowercase();
    WEEK.iter().position(|d| {
        let full = d.to_string().to_ascii_lowercase();
        lower == full || (lower.len() == 3 && full.starts_with(&lower))
    })
}
