/// Pure OHLCV reduction of source bars into one coarser bar
use std::collections::BTreeMap;

use crate::error::Result;
use crate::types::{meta, CandleBar, Provenance};

/// Reduce `source_bars` (ascending) into the bar for `bucket_open_ms`.
///
/// Returns `Ok(None)` when there is nothing to aggregate, including when pause
/// filtering drops every bar. An output that breaks bucket geometry is an
/// `InvariantViolation` error.
pub fn aggregate(
    source_bars: &[CandleBar],
    symbol: &str,
    target_tf_s: i64,
    bucket_open_ms: i64,
    anchor_offset_s: i64,
    filter_pause: bool,
) -> Result<Option<CandleBar>> {
    if source_bars.is_empty() {
        return Ok(None);
    }

    let kept: Vec<&CandleBar> = source_bars
        .iter()
        .filter(|b| !(filter_pause && b.is_pause_placeholder()))
        .collect();

    let (Some(first), Some(last)) = (kept.first(), kept.last()) else {
        return Ok(None);
    };

    let mut bar = CandleBar {
        symbol: symbol.to_string(),
        timeframe_s: target_tf_s,
        open_time_ms: bucket_open_ms,
        close_time_ms: bucket_open_ms + target_tf_s * 1000,
        open: first.open,
        high: kept.iter().map(|b| b.high).fold(f64::NEG_INFINITY, f64::max),
        low: kept.iter().map(|b| b.low).fold(f64::INFINITY, f64::min),
        close: last.close,
        volume: kept.iter().map(|b| b.volume).sum(),
        complete: true,
        provenance: Provenance::Derived,
        metadata: BTreeMap::new(),
    };

    if kept.len() < source_bars.len() {
        bar.set_flag(meta::PARTIAL);
        bar.set_flag(meta::PARTIAL_CALENDAR_PAUSE);
        bar.set_count(meta::SOURCE_COUNT, kept.len());
        bar.set_count(meta::EXPECTED_COUNT, source_bars.len());
        bar.push_partial_reason(meta::REASON_CALENDAR_PAUSE);
    }

    bar.validate_geometry(anchor_offset_s * 1000)?;
    Ok(Some(bar))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::CascadeError;

    fn minute_bars() -> Vec<CandleBar> {
        vec![
            CandleBar::ingested("NIFTY", 60, 0, 10.0, 10.5, 9.8, 10.2, 100.0),
            CandleBar::ingested("NIFTY", 60, 60_000, 10.2, 11.0, 10.1, 10.9, 200.0),
            CandleBar::ingested("NIFTY", 60, 120_000, 10.9, 12.4, 10.7, 12.0, 150.0),
            CandleBar::ingested("NIFTY", 60, 180_000, 12.0, 12.1, 9.5, 13.0, 50.0),
            CandleBar::ingested("NIFTY", 60, 240_000, 13.0, 14.5, 12.8, 14.1, 75.0),
        ]
    }

    #[test]
    fn test_exact_reduction() {
        let bar = aggregate(&minute_bars(), "NIFTY", 300, 0, 0, true).unwrap().unwrap();
        assert_eq!(bar.open, 10.0);
        assert_eq!(bar.close, 14.1);
        assert_eq!(bar.high, 14.5);
        assert_eq!(bar.low, 9.5);
        assert_eq!(bar.volume, 575.0);
        assert_eq!(bar.close_time_ms, 300_000);
        assert_eq!(bar.provenance, Provenance::Derived);
        assert!(bar.complete);
        assert!(bar.metadata.is_empty());
    }

    #[test]
    fn test_pause_bars_are_filtered_and_tagged() {
        let mut bars = minute_bars();
        bars[3].set_flag(meta::PAUSE_PLACEHOLDER);
        bars[4].set_flag(meta::PAUSE_PLACEHOLDER);

        let bar = aggregate(&bars, "NIFTY", 300, 0, 0, true).unwrap().unwrap();
        assert_eq!(bar.close, 12.0);
        assert_eq!(bar.low, 9.8);
        assert!(bar.flag(meta::PARTIAL));
        assert!(bar.flag(meta::PARTIAL_CALENDAR_PAUSE));
        assert_eq!(bar.count(meta::SOURCE_COUNT), Some(3));
        assert_eq!(bar.count(meta::EXPECTED_COUNT), Some(5));
        assert_eq!(bar.partial_reasons(), vec!["calendar_pause"]);

        // with filtering off the placeholders take part
        let raw = aggregate(&bars, "NIFTY", 300, 0, 0, false).unwrap().unwrap();
        assert_eq!(raw.close, 14.1);
        assert!(!raw.is_partial());
    }

    #[test]
    fn test_empty_and_all_paused() {
        assert!(aggregate(&[], "NIFTY", 300, 0, 0, true).unwrap().is_none());

        let mut bars = minute_bars();
        for bar in bars.iter_mut() {
            bar.set_flag(meta::PAUSE_PLACEHOLDER);
        }
        assert!(aggregate(&bars, "NIFTY", 300, 0, 0, true).unwrap().is_none());
    }

    #[test]
    fn test_misaligned_bucket_is_an_invariant_violation() {
        let result = aggregate(&minute_bars(), "NIFTY", 300, 60_000, 0, true);
        assert!(matches!(result, Err(CascadeError::InvariantViolation(_))));
    }

    #[test]
    fn test_deterministic_output() {
        let mut bars = minute_bars();
        bars[2].set_flag(meta::PAUSE_PLACEHOLDER);
        let a = aggregate(&bars, "NIFTY", 300, 0, 0, true).unwrap().unwrap();
        let b = aggregate(&bars, "NIFTY", 300, 0, 0, true).unwrap().unwrap();
        assert_eq!(serde_json::to_string(&a).unwrap(), serde_json::to_string(&b).unwrap());
    }
}
