//! Daily wall-clock windows
//!
//! A window is a pair of times of day. When the end is earlier than the start
//! the window wraps past midnight, and membership is decided by shifting the
//! wrap-around boundary to the adjacent day relative to "now".

use crate::error::{EngineError, EngineResult};
use chrono::{DateTime, NaiveDateTime, NaiveTime, TimeZone};
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DailyWindow {
    start: NaiveTime,
    end: NaiveTime,
}

impl DailyWindow {
    pub fn new(start: NaiveTime, end: NaiveTime) -> Self {
        Self { start, end }
    }

    /// Parse a window from two "HH:MM" strings
    pub fn parse(start: &str, end: &str) -> EngineResult<Self> {
        Ok(Self::new(parse_time_of_day(start)?, parse_time_of_day(end)?))
    }

    pub fn start(&self) -> NaiveTime {
        self.start
    }

    pub fn end(&self) -> NaiveTime {
        self.end
    }

    /// True when the end is earlier than the start
    pub fn wraps_midnight(&self) -> bool {
        self.end < self.start
    }

    /// Whether `now` falls in `[start, end)`
    pub fn contains<Tz: TimeZone>(&self, now: &DateTime<Tz>) -> bool {
        let (start, end) = self.bounds_around(now.naive_local());
        let now = now.naive_local();
        now >= start && now < end
    }

    /// Time until the window next opens or closes
    pub fn time_until_boundary<Tz: TimeZone>(&self, now: &DateTime<Tz>) -> Duration {
        let boundary = if self.contains(now) {
            self.end
        } else {
            self.start
        };
        let now = now.naive_local();
        let mut next = now.date().and_time(boundary);
        if next <= now {
            next += chrono::Duration::days(1);
        }
        (next - now).to_std().unwrap_or(Duration::ZERO)
    }

    fn bounds_around(&self, now: NaiveDateTime) -> (NaiveDateTime, NaiveDateTime) {
        let today = now.date();
        let mut start = today.and_time(self.start);
        let mut end = today.and_time(self.end);

        if self.wraps_midnight() {
            if now >= start {
                end += chrono::Duration::days(1);
            } else {
                start -= chrono::Duration::days(1);
            }
        }
        (start, end)
    }
}

impl std::fmt::Display for DailyWindow {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}-{}", self.start.format("%H:%M"), self.end.format("%H:%M"))
    }
}

fn parse_time_of_day(value: &str) -> EngineResult<NaiveTime> {
    NaiveTime::parse_from_str(value.trim(), "%H:%M")
        .map_err(|e| EngineError::Config(format!("invalid time of day '{value}': {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::FixedOffset;

    fn at(date: &str, time: &str) -> DateTime<FixedOffset> {
        DateTime::parse_from_rfc3339(&format!("{date}T{time}:00+00:00")).unwrap()
    }

    #[test]
    fn test_parse() {
        let window = DailyWindow::parse("01:37", "06:30").unwrap();
        assert_eq!(window.to_string(), "01:37-06:30");
        assert!(!window.wraps_midnight());
        assert!(DailyWindow::parse("24:10", "06:30").is_err());
        assert!(DailyWindow::parse("noon", "06:30").is_err());
    }

    #[test]
    fn test_same_day_window() {
        let window = DailyWindow::parse("01:37", "06:30").unwrap();
        assert!(!window.contains(&at("2024-05-10", "01:36")));
        assert!(window.contains(&at("2024-05-10", "01:37")));
        assert!(window.contains(&at("2024-05-10", "04:00")));
        assert!(window.contains(&at("2024-05-10", "06:29")));
        assert!(!window.contains(&at("2024-05-10", "06:30")));
        assert!(!window.contains(&at("2024-05-10", "14:00")));
    }

    #[test]
    fn test_window_across_midnight() {
        let window = DailyWindow::parse("22:00", "06:00").unwrap();
        assert!(window.wraps_midnight());
        assert!(window.contains(&at("2024-03-10", "23:30")));
        assert!(window.contains(&at("2024-03-11", "00:15")));
        assert!(window.contains(&at("2024-03-11", "05:59")));
        assert!(!window.contains(&at("2024-03-11", "06:00")));
        assert!(!window.contains(&at("2024-03-11", "12:00")));
        assert!(!window.contains(&at("2024-03-11", "21:59")));
        assert!(window.contains(&at("2024-03-11", "22:00")));
    }

    #[test]
    fn test_window_across_month_and_year_boundary() {
        let window = DailyWindow::parse("22:00", "06:00").unwrap();
        assert!(window.contains(&at("2024-01-31", "23:00")));
        assert!(window.contains(&at("2024-02-01", "03:00")));
        assert!(window.contains(&at("2023-12-31", "23:59")));
        assert!(window.contains(&at("2024-01-01", "00:01")));
        assert!(!window.contains(&at("2024-01-01", "07:00")));
    }

    #[test]
    fn test_contains_uses_local_offset() {
        let window = DailyWindow::parse("01:00", "05:00").unwrap();
        // 23:30 UTC is 02:30 at +03:00
        let now = DateTime::parse_from_rfc3339("2024-05-10T23:30:00+00:00")
            .unwrap()
            .with_timezone(&FixedOffset::east_opt(3 * 3600).unwrap());
        assert!(window.contains(&now));
    }

    #[test]
    fn test_time_until_boundary() {
        let window = DailyWindow::parse("22:00", "06:00").unwrap();
        // Outside: until the window opens
        assert_eq!(
            window.time_until_boundary(&at("2024-03-10", "21:00")),
            Duration::from_secs(3600)
        );
        // Inside before midnight: until it closes the next morning
        assert_eq!(
            window.time_until_boundary(&at("2024-03-10", "23:00")),
            Duration::from_secs(7 * 3600)
        );
        // Inside after midnight
        assert_eq!(
            window.time_until_boundary(&at("2024-03-11", "05:30")),
            Duration::from_secs(30 * 60)
        );
        // Just after closing: a full day minus the closed span
        assert_eq!(
            window.time_until_boundary(&at("2024-03-11", "06:00")),
            Duration::from_secs(16 * 3600)
        );
    }
}
