/// Market session calendar and trading-minute lookups
use std::cell::Cell;
use std::collections::HashSet;

use chrono::{DateTime, Datelike, NaiveDate, NaiveTime, Utc};
use chrono_tz::Tz;

use crate::error::{CascadeError, Result};
use crate::time::geometry::MINUTE_MS;
use crate::time::holidays::{is_trading_day, parse_holidays};
use crate::types::CalendarConfig;

/// Per-symbol trading predicate.
///
/// `None` means the calendar cannot answer for that minute (outside its
/// coverage, unrepresentable timestamp). Callers decide how to degrade.
pub trait TradingCalendar: Send + Sync {
    fn is_trading_minute(&self, open_time_ms: i64) -> Option<bool>;
}

impl<F> TradingCalendar for F
where
    F: Fn(i64) -> Option<bool> + Send + Sync,
{
    fn is_trading_minute(&self, open_time_ms: i64) -> Option<bool> {
        self(open_time_ms)
    }
}

/// Intraday trading window `[start, end)` in exchange-local time
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionWindow {
    pub start: NaiveTime,
    pub end: NaiveTime,
}

/// Weekday/holiday/session-window calendar in a fixed timezone
#[derive(Debug, Clone)]
pub struct SessionCalendar {
    timezone: Tz,
    sessions: Vec<SessionWindow>,
    weekdays_only: bool,
    holidays: HashSet<NaiveDate>,
    holiday_years: Option<(i32, i32)>,
}

impl SessionCalendar {
    pub fn new(
        timezone: Tz,
        mut sessions: Vec<SessionWindow>,
        weekdays_only: bool,
        holidays: HashSet<NaiveDate>,
        holiday_years: Option<(i32, i32)>,
    ) -> Result<Self> {
        if sessions.is_empty() {
            return Err(CascadeError::ConfigError(
                "calendar needs at least one session window".to_string(),
            ));
        }
        for window in &sessions {
            if window.start >= window.end {
                return Err(CascadeError::ConfigError(format!(
                    "session window {} - {} must start before it ends",
                    window.start, window.end
                )));
            }
        }
        if let Some((first, last)) = holiday_years {
            if first > last {
                return Err(CascadeError::ConfigError(format!(
                    "holiday_years {}..{} is empty",
                    first, last
                )));
            }
        }
        sessions.sort_by_key(|w| w.start);

        Ok(SessionCalendar {
            timezone,
            sessions,
            weekdays_only,
            holidays,
            holiday_years,
        })
    }

    pub fn from_config(config: &CalendarConfig) -> Result<Self> {
        let timezone: Tz = config.timezone.parse().map_err(|_| {
            CascadeError::ConfigError(format!("unknown timezone '{}'", config.timezone))
        })?;

        let sessions = config
            .sessions
            .iter()
            .map(|w| {
                Ok(SessionWindow {
                    start: parse_session_time(&w.start)?,
                    end: parse_session_time(&w.end)?,
                })
            })
            .collect::<Result<Vec<_>>>()?;

        let holidays = parse_holidays(&config.holidays)?;

        SessionCalendar::new(
            timezone,
            sessions,
            config.weekdays_only,
            holidays,
            config.holiday_years,
        )
    }
}

impl TradingCalendar for SessionCalendar {
    fn is_trading_minute(&self, open_time_ms: i64) -> Option<bool> {
        let utc = DateTime::<Utc>::from_timestamp_millis(open_time_ms)?;
        let local = utc.with_timezone(&self.timezone);
        let date = local.date_naive();

        if let Some((first, last)) = self.holiday_years {
            if date.year() < first || date.year() > last {
                return None;
            }
        }

        if !is_trading_day(date, &self.holidays, self.weekdays_only) {
            return Some(false);
        }

        let time = local.time();
        Some(self.sessions.iter().any(|w| time >= w.start && time < w.end))
    }
}

/// Accept "HH:MM:SS" or "HH:MM"
fn parse_session_time(value: &str) -> Result<NaiveTime> {
    NaiveTime::parse_from_str(value, "%H:%M:%S")
        .or_else(|_| NaiveTime::parse_from_str(value, "%H:%M"))
        .map_err(|e| CascadeError::ConfigError(format!("invalid session time '{}': {}", value, e)))
}

/// Optional calendar plus a tally of lookups it could not answer.
///
/// Unknown minutes count as trading, so a missing answer can only make
/// derivation stricter, never looser.
pub struct SessionProbe<'a> {
    calendar: Option<&'a dyn TradingCalendar>,
    unknown: Cell<u64>,
}

impl<'a> SessionProbe<'a> {
    pub fn new(calendar: Option<&'a dyn TradingCalendar>) -> Self {
        SessionProbe {
            calendar,
            unknown: Cell::new(0),
        }
    }

    pub fn has_calendar(&self) -> bool {
        self.calendar.is_some()
    }

    pub fn unknown_lookups(&self) -> u64 {
        self.unknown.get()
    }

    pub fn is_trading_minute(&self, open_time_ms: i64) -> bool {
        match self.calendar {
            None => true,
            Some(calendar) => match calendar.is_trading_minute(open_time_ms) {
                Some(trading) => trading,
                None => {
                    self.unknown.set(self.unknown.get() + 1);
                    true
                }
            },
        }
    }

    /// True if any minute inside `[slot_open_ms, slot_open_ms + slot_ms)` trades
    pub fn slot_is_trading(&self, slot_open_ms: i64, slot_ms: i64) -> bool {
        if self.calendar.is_none() {
            return true;
        }
        let step = MINUTE_MS.min(slot_ms).max(1);
        let mut minute = slot_open_ms;
        while minute < slot_open_ms + slot_ms {
            if self.is_trading_minute(minute) {
                return true;
            }
            minute += step;
        }
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use chrono_tz::Asia::Kolkata;

    fn nse_calendar(holiday_years: Option<(i32, i32)>) -> SessionCalendar {
        let config = CalendarConfig {
            timezone: "Asia/Kolkata".to_string(),
            sessions: vec![crate::types::SessionWindowConfig {
                start: "09:15".to_string(),
                end: "15:30".to_string(),
            }],
            weekdays_only: true,
            holidays: vec!["2025-01-26".to_string(), "2025-03-14".to_string()],
            holiday_years,
        };
        SessionCalendar::from_config(&config).unwrap()
    }

    fn ist_ms(y: i32, mo: u32, d: u32, h: u32, mi: u32) -> i64 {
        Kolkata
            .with_ymd_and_hms(y, mo, d, h, mi, 0)
            .unwrap()
            .with_timezone(&Utc)
            .timestamp_millis()
    }

    #[test]
    fn test_session_minutes() {
        let calendar = nse_calendar(None);
        // Wednesday
        assert_eq!(calendar.is_trading_minute(ist_ms(2025, 1, 15, 9, 15)), Some(true));
        assert_eq!(calendar.is_trading_minute(ist_ms(2025, 1, 15, 15, 29)), Some(true));
        assert_eq!(calendar.is_trading_minute(ist_ms(2025, 1, 15, 15, 30)), Some(false));
        assert_eq!(calendar.is_trading_minute(ist_ms(2025, 1, 15, 9, 14)), Some(false));
        // Saturday
        assert_eq!(calendar.is_trading_minute(ist_ms(2025, 1, 18, 10, 0)), Some(false));
    }

    #[test]
    fn test_holiday_and_coverage() {
        let calendar = nse_calendar(Some((2025, 2025)));
        // Holi, a Friday
        assert_eq!(calendar.is_trading_minute(ist_ms(2025, 3, 14, 10, 0)), Some(false));
        assert_eq!(calendar.is_trading_minute(ist_ms(2025, 1, 27, 10, 0)), Some(true));
        assert_eq!(calendar.is_trading_minute(ist_ms(2026, 1, 27, 10, 0)), None);
    }

    #[test]
    fn test_rejects_inverted_window() {
        let result = SessionCalendar::new(
            Kolkata,
            vec![SessionWindow {
                start: NaiveTime::from_hms_opt(15, 30, 0).unwrap(),
                end: NaiveTime::from_hms_opt(9, 15, 0).unwrap(),
            }],
            true,
            HashSet::new(),
            None,
        );
        assert!(result.is_err());
    }

    #[test]
    fn test_probe_counts_unknown_as_trading() {
        let calendar = |ms: i64| if ms < 0 { None } else { Some(ms % 120_000 == 0) };
        let probe = SessionProbe::new(Some(&calendar));

        assert!(probe.is_trading_minute(0));
        assert!(!probe.is_trading_minute(60_000));
        assert!(probe.is_trading_minute(-60_000));
        assert_eq!(probe.unknown_lookups(), 1);

        // a 3-minute slot starting at 60_000 contains the trading minute 120_000
        assert!(probe.slot_is_trading(60_000, 180_000));
        assert!(!probe.slot_is_trading(60_000, 60_000));
    }

    #[test]
    fn test_probe_without_calendar() {
        let probe = SessionProbe::new(None);
        assert!(!probe.has_calendar());
        assert!(probe.slot_is_trading(0, 300_000));
        assert_eq!(probe.unknown_lookups(), 0);
    }
}
