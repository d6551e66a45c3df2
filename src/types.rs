/// Core type definitions for the cascade engine
use std::collections::{BTreeMap, HashMap};

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{CascadeError, Result};

/// Metadata keys written on partial or degraded bars
pub mod meta {
    pub const PARTIAL: &str = "partial";
    pub const PARTIAL_CALENDAR_PAUSE: &str = "partial_calendar_pause";
    pub const BOUNDARY_PARTIAL: &str = "boundary_partial";
    pub const SOURCE_COUNT: &str = "source_count";
    pub const EXPECTED_COUNT: &str = "expected_count";
    pub const PARTIAL_REASONS: &str = "partial_reasons";
    pub const MID_SESSION_GAPS: &str = "mid_session_gaps";
    /// Set upstream on zero-activity bars standing in for a scheduled pause
    pub const PAUSE_PLACEHOLDER: &str = "pause_placeholder";

    pub const REASON_CALENDAR_PAUSE: &str = "calendar_pause";
    pub const REASON_BOUNDARY_GAP: &str = "boundary_gap";
}

/// Where a bar came from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Provenance {
    Ingested,
    Derived,
}

impl Provenance {
    pub fn as_str(&self) -> &str {
        match self {
            Provenance::Ingested => "ingested",
            Provenance::Derived => "derived",
        }
    }
}

/// OHLCV bar; `close_time_ms` is end-exclusive
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CandleBar {
    pub symbol: String,
    pub timeframe_s: i64,
    pub open_time_ms: i64,
    pub close_time_ms: i64,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: f64,
    pub complete: bool,
    pub provenance: Provenance,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub metadata: BTreeMap<String, Value>,
}

impl CandleBar {
    /// Closed, ingested bar with end-exclusive close time
    pub fn ingested(
        symbol: &str,
        timeframe_s: i64,
        open_time_ms: i64,
        open: f64,
        high: f64,
        low: f64,
        close: f64,
        volume: f64,
    ) -> Self {
        CandleBar {
            symbol: symbol.to_string(),
            timeframe_s,
            open_time_ms,
            close_time_ms: open_time_ms + timeframe_s * 1000,
            open,
            high,
            low,
            close,
            volume,
            complete: true,
            provenance: Provenance::Ingested,
            metadata: BTreeMap::new(),
        }
    }

    pub fn timeframe_ms(&self) -> i64 {
        self.timeframe_s * 1000
    }

    pub fn is_derived(&self) -> bool {
        self.provenance == Provenance::Derived
    }

    pub fn is_pause_placeholder(&self) -> bool {
        self.flag(meta::PAUSE_PLACEHOLDER)
    }

    pub fn is_partial(&self) -> bool {
        self.flag(meta::PARTIAL)
    }

    pub fn flag(&self, key: &str) -> bool {
        self.metadata.get(key).and_then(Value::as_bool).unwrap_or(false)
    }

    pub fn set_flag(&mut self, key: &str) {
        self.metadata.insert(key.to_string(), Value::Bool(true));
    }

    pub fn set_count(&mut self, key: &str, count: usize) {
        self.metadata.insert(key.to_string(), Value::from(count as u64));
    }

    pub fn count(&self, key: &str) -> Option<u64> {
        self.metadata.get(key).and_then(Value::as_u64)
    }

    /// Append a reason to `partial_reasons`, keeping it free of duplicates
    pub fn push_partial_reason(&mut self, reason: &str) {
        let entry = self
            .metadata
            .entry(meta::PARTIAL_REASONS.to_string())
            .or_insert_with(|| Value::Array(Vec::new()));

        if !entry.is_array() {
            *entry = Value::Array(Vec::new());
        }
        if let Value::Array(reasons) = entry {
            if !reasons.iter().any(|r| r.as_str() == Some(reason)) {
                reasons.push(Value::String(reason.to_string()));
            }
        }
    }

    pub fn partial_reasons(&self) -> Vec<String> {
        self.metadata
            .get(meta::PARTIAL_REASONS)
            .and_then(Value::as_array)
            .map(|reasons| {
                reasons
                    .iter()
                    .filter_map(|r| r.as_str().map(str::to_string))
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Check the bucket geometry of this bar against an anchor offset
    pub fn validate_geometry(&self, anchor_offset_ms: i64) -> Result<()> {
        let tf_ms = self.timeframe_ms();
        if tf_ms <= 0 {
            return Err(CascadeError::InvariantViolation(format!(
                "{} non-positive timeframe {}s",
                self.symbol, self.timeframe_s
            )));
        }
        if self.close_time_ms != self.open_time_ms + tf_ms {
            return Err(CascadeError::InvariantViolation(format!(
                "{} close_time_ms {} != open_time_ms {} + {}",
                self.symbol, self.close_time_ms, self.open_time_ms, tf_ms
            )));
        }
        if (self.open_time_ms - anchor_offset_ms).rem_euclid(tf_ms) != 0 {
            return Err(CascadeError::InvariantViolation(format!(
                "{} open_time_ms {} not aligned to {}s (anchor {}ms)",
                self.symbol, self.open_time_ms, self.timeframe_s, anchor_offset_ms
            )));
        }
        Ok(())
    }
}

/// Result of handing a final bar to storage
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommitOutcome {
    pub ok: bool,
    pub reason: Option<String>,
}

impl CommitOutcome {
    pub const STALE: &'static str = "stale";
    pub const DUPLICATE: &'static str = "duplicate";

    pub fn accepted() -> Self {
        CommitOutcome { ok: true, reason: None }
    }

    pub fn rejected(reason: impl Into<String>) -> Self {
        CommitOutcome {
            ok: false,
            reason: Some(reason.into()),
        }
    }

    /// Stale and duplicate rejections are ordinary re-derivation races
    pub fn is_expected_skip(&self) -> bool {
        !self.ok
            && matches!(
                self.reason.as_deref(),
                Some(CommitOutcome::STALE) | Some(CommitOutcome::DUPLICATE)
            )
    }
}

/// Deployment configuration (TOML)
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub symbols: Vec<String>,

    // Anchors (seconds)
    #[serde(default)]
    pub session_anchor_s: i64,
    #[serde(default)]
    pub daily_anchor_s: Option<i64>,

    // Cascade targets, as labels ("5m", "1d")
    pub compute_timeframes: Vec<String>,
    pub persist_timeframes: Vec<String>,
    #[serde(default = "default_filter_pause_bars")]
    pub filter_pause_bars: bool,

    // Per-timeframe tuning, keyed by label
    #[serde(default)]
    pub buffer_capacity: HashMap<String, usize>,
    #[serde(default)]
    pub gap_budget: HashMap<String, u32>,
    #[serde(default)]
    pub overdue_lookback: HashMap<String, u32>,

    // Storage
    pub bar_store_dir: String,

    // Calendar
    #[serde(default)]
    pub calendar: Option<CalendarConfig>,

    // Logging
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CalendarConfig {
    pub timezone: String,
    pub sessions: Vec<SessionWindowConfig>,
    #[serde(default = "default_weekdays_only")]
    pub weekdays_only: bool,
    #[serde(default)]
    pub holidays: Vec<String>,
    /// Years the holiday list is known to cover; other years answer "unknown"
    #[serde(default)]
    pub holiday_years: Option<(i32, i32)>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SessionWindowConfig {
    pub start: String,
    pub end: String,
}

fn default_filter_pause_bars() -> bool {
    true
}

fn default_weekdays_only() -> bool {
    true
}

fn default_log_level() -> String {
    "info".to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ingested_bar_close_time() {
        let bar = CandleBar::ingested("NIFTY", 60, 120_000, 1.0, 2.0, 0.5, 1.5, 10.0);
        assert_eq!(bar.close_time_ms, 180_000);
        assert_eq!(bar.provenance, Provenance::Ingested);
        assert!(bar.complete);
        assert!(bar.validate_geometry(0).is_ok());
    }

    #[test]
    fn test_validate_geometry_rejects_misaligned_open() {
        let mut bar = CandleBar::ingested("NIFTY", 300, 60_000, 1.0, 1.0, 1.0, 1.0, 0.0);
        assert!(bar.validate_geometry(0).is_err());
        // aligned once the anchor shifts the grid by a minute
        assert!(bar.validate_geometry(60_000).is_ok());

        bar.close_time_ms += 1;
        assert!(bar.validate_geometry(60_000).is_err());
    }

    #[test]
    fn test_partial_reasons_are_deduplicated() {
        let mut bar = CandleBar::ingested("NIFTY", 60, 0, 1.0, 1.0, 1.0, 1.0, 0.0);
        bar.push_partial_reason(meta::REASON_CALENDAR_PAUSE);
        bar.push_partial_reason(meta::REASON_BOUNDARY_GAP);
        bar.push_partial_reason(meta::REASON_CALENDAR_PAUSE);
        assert_eq!(bar.partial_reasons(), vec!["calendar_pause", "boundary_gap"]);
    }

    #[test]
    fn test_commit_outcome_classification() {
        assert!(CommitOutcome::rejected("stale").is_expected_skip());
        assert!(CommitOutcome::rejected("duplicate").is_expected_skip());
        assert!(!CommitOutcome::rejected("io_error: disk full").is_expected_skip());
        assert!(!CommitOutcome::accepted().is_expected_skip());
    }

    #[test]
    fn test_bar_serde_shape() {
        let mut bar = CandleBar::ingested("NIFTY", 60, 0, 1.0, 2.0, 0.5, 1.5, 10.0);
        bar.set_flag(meta::PAUSE_PLACEHOLDER);
        let json = serde_json::to_string(&bar).unwrap();
        assert!(json.contains("\"provenance\":\"ingested\""));

        let back: CandleBar = serde_json::from_str(&json).unwrap();
        assert!(back.is_pause_placeholder());
    }
}
