/// Configuration loading from TOML file
use std::path::Path;

use crate::error::{CascadeError, Result};
use crate::time::parse_timeframe_label;
use crate::types::Config;

pub fn load_config<P: AsRef<Path>>(path: P) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .map_err(|e| CascadeError::ConfigError(format!("Failed to read config file: {}", e)))?;

    parse_config(&content)
}

pub fn parse_config(content: &str) -> Result<Config> {
    let config: Config = toml::from_str(content)
        .map_err(|e| CascadeError::ConfigError(format!("Failed to parse config: {}", e)))?;

    validate_config(&config)?;

    Ok(config)
}

fn validate_config(config: &Config) -> Result<()> {
    if config.symbols.is_empty() {
        return Err(CascadeError::ConfigError("symbols is empty".to_string()));
    }
    if config.symbols.iter().any(|s| s.trim().is_empty()) {
        return Err(CascadeError::ConfigError("blank symbol in symbols".to_string()));
    }

    if config.bar_store_dir.trim().is_empty() {
        return Err(CascadeError::ConfigError("bar_store_dir is empty".to_string()));
    }

    // Timeframe labels must parse even where the engine ignores them
    for label in config
        .compute_timeframes
        .iter()
        .chain(config.persist_timeframes.iter())
        .chain(config.buffer_capacity.keys())
        .chain(config.gap_budget.keys())
        .chain(config.overdue_lookback.keys())
    {
        parse_timeframe_label(label)
            .map_err(|e| CascadeError::ConfigError(format!("{}", e)))?;
    }

    if let Some(calendar) = &config.calendar {
        if calendar.sessions.is_empty() {
            return Err(CascadeError::ConfigError(
                "calendar.sessions must list at least one window".to_string(),
            ));
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"
        symbols = ["NIFTY"]
        session_anchor_s = 13500
        daily_anchor_s = -19800
        compute_timeframes = ["3m", "5m", "1d"]
        persist_timeframes = ["5m", "1d"]
        bar_store_dir = "data/bars"
        log_level = "debug"

        [calendar]
        timezone = "Asia/Kolkata"
        holidays = ["2025-03-14"]
        holiday_years = [2025, 2026]

        [[calendar.sessions]]
        start = "09:15"
        end = "15:30"
    "#;

    #[test]
    fn test_parse_sample() {
        let config = parse_config(SAMPLE).unwrap();
        assert_eq!(config.symbols, vec!["NIFTY"]);
        assert_eq!(config.daily_anchor_s, Some(-19_800));
        assert!(config.filter_pause_bars);
        let calendar = config.calendar.unwrap();
        assert!(calendar.weekdays_only);
        assert_eq!(calendar.holiday_years, Some((2025, 2026)));
        assert_eq!(calendar.sessions[0].end, "15:30");
    }

    #[test]
    fn test_rejects_empty_symbols() {
        let content = SAMPLE.replace(r#"symbols = ["NIFTY"]"#, "symbols = []");
        assert!(matches!(parse_config(&content), Err(CascadeError::ConfigError(_))));
    }

    #[test]
    fn test_rejects_bad_label() {
        let content = SAMPLE.replace(r#""3m", "5m", "1d""#, r#""3m", "5x""#);
        assert!(parse_config(&content).is_err());
    }

    #[test]
    fn test_missing_file() {
        let err = load_config("/nonexistent/candle_cascade.toml").unwrap_err();
        assert_eq!(err.error_code(), "CFG_001");
    }
}
