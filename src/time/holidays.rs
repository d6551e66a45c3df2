/// Exchange holiday handling
use chrono::{Datelike, NaiveDate, Weekday};
use std::collections::HashSet;

use crate::error::{CascadeError, Result};

/// Parse "YYYY-MM-DD" holiday dates from configuration
pub fn parse_holidays(dates: &[String]) -> Result<HashSet<NaiveDate>> {
    dates
        .iter()
        .map(|d| {
            NaiveDate::parse_from_str(d.trim(), "%Y-%m-%d")
                .map_err(|e| CascadeError::ConfigError(format!("invalid holiday '{}': {}", d, e)))
        })
        .collect()
}

/// Check if a date is a trading day (not a holiday, optionally not a weekend)
pub fn is_trading_day(date: NaiveDate, holidays: &HashSet<NaiveDate>, weekdays_only: bool) -> bool {
    if weekdays_only && matches!(date.weekday(), Weekday::Sat | Weekday::Sun) {
        return false;
    }
    !holidays.contains(&date)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_holidays() {
        let holidays = parse_holidays(&["2025-03-14".to_string(), " 2025-08-15 ".to_string()]).unwrap();
        assert_eq!(holidays.len(), 2);
        assert!(holidays.contains(&NaiveDate::from_ymd_opt(2025, 8, 15).unwrap()));

        assert!(parse_holidays(&["14/03/2025".to_string()]).is_err());
    }

    #[test]
    fn test_weekend() {
        let holidays = HashSet::new();
        let sat = NaiveDate::from_ymd_opt(2025, 1, 4).unwrap();
        assert!(!is_trading_day(sat, &holidays, true));
        // 24/7 venues trade weekends
        assert!(is_trading_day(sat, &holidays, false));
    }

    #[test]
    fn test_holiday_weekday() {
        let holidays = parse_holidays(&["2025-03-14".to_string()]).unwrap();
        let holi = NaiveDate::from_ymd_opt(2025, 3, 14).unwrap();
        let next = NaiveDate::from_ymd_opt(2025, 3, 17).unwrap();
        assert!(!is_trading_day(holi, &holidays, true));
        assert!(is_trading_day(next, &holidays, true));
    }
}
