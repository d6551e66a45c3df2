/// Bounded, sorted, deduplicating window of closed bars for one (symbol, timeframe)
use std::collections::{HashMap, VecDeque};

use crate::error::{CascadeError, Result};
use crate::types::CandleBar;

/// Closed-bar buffer keyed by `open_time_ms`
#[derive(Debug, Clone)]
pub struct ClosedBarBuffer {
    timeframe_s: i64,
    capacity: usize,
    bars: HashMap<i64, CandleBar>,
    /// Sorted ascending, same key set as `bars`
    keys: VecDeque<i64>,
}

impl ClosedBarBuffer {
    pub fn new(timeframe_s: i64, capacity: usize) -> Self {
        ClosedBarBuffer {
            timeframe_s,
            capacity: capacity.max(1),
            bars: HashMap::with_capacity(capacity.max(1)),
            keys: VecDeque::with_capacity(capacity.max(1)),
        }
    }

    pub fn timeframe_s(&self) -> i64 {
        self.timeframe_s
    }

    pub fn timeframe_ms(&self) -> i64 {
        self.timeframe_s * 1000
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn len(&self) -> usize {
        self.keys.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }

    pub fn contains(&self, open_time_ms: i64) -> bool {
        self.bars.contains_key(&open_time_ms)
    }

    pub fn get(&self, open_time_ms: i64) -> Option<&CandleBar> {
        self.bars.get(&open_time_ms)
    }

    /// Insert or overwrite a bar, evicting the oldest entries past capacity
    pub fn upsert(&mut self, bar: CandleBar) -> Result<()> {
        if bar.timeframe_s != self.timeframe_s {
            return Err(CascadeError::TimeframeMismatch {
                expected: self.timeframe_s,
                actual: bar.timeframe_s,
            });
        }

        let key = bar.open_time_ms;
        if self.bars.insert(key, bar).is_some() {
            return Ok(());
        }

        match self.keys.back() {
            // Fast path: newest bar so far
            None => self.keys.push_back(key),
            Some(&last) if key > last => self.keys.push_back(key),
            _ => {
                let idx = self.keys.partition_point(|&k| k < key);
                self.keys.insert(idx, key);
            }
        }

        while self.keys.len() > self.capacity {
            if let Some(oldest) = self.keys.pop_front() {
                self.bars.remove(&oldest);
            }
        }

        Ok(())
    }

    /// Slot opens in `[start_ms, end_ms)` that must be present
    fn required_slots<'a>(
        &self,
        start_ms: i64,
        end_ms: i64,
        is_trading: Option<&'a dyn Fn(i64) -> bool>,
    ) -> impl Iterator<Item = i64> + 'a {
        let step = self.timeframe_ms();
        let count = if end_ms > start_ms {
            (end_ms - start_ms + step - 1) / step
        } else {
            0
        };
        (0..count)
            .map(move |i| start_ms + i * step)
            .filter(move |&slot| is_trading.map_or(true, |pred| pred(slot)))
    }

    /// True iff every required slot in `[start_ms, end_ms)` is present
    pub fn has_range(&self, start_ms: i64, end_ms: i64, is_trading: Option<&dyn Fn(i64) -> bool>) -> bool {
        self.required_slots(start_ms, end_ms, is_trading)
            .all(|slot| self.bars.contains_key(&slot))
    }

    /// Bars for every required slot in order, or nothing if any is absent
    pub fn range_bars(
        &self,
        start_ms: i64,
        end_ms: i64,
        is_trading: Option<&dyn Fn(i64) -> bool>,
    ) -> Vec<CandleBar> {
        let mut out = Vec::new();
        for slot in self.required_slots(start_ms, end_ms, is_trading) {
            match self.bars.get(&slot) {
                Some(bar) => out.push(bar.clone()),
                None => return Vec::new(),
            }
        }
        out
    }

    /// Number of required slots with no bar
    pub fn missing_count(
        &self,
        start_ms: i64,
        end_ms: i64,
        is_trading: Option<&dyn Fn(i64) -> bool>,
    ) -> usize {
        self.required_slots(start_ms, end_ms, is_trading)
            .filter(|slot| !self.bars.contains_key(slot))
            .count()
    }

    pub fn earliest_open_ms(&self) -> Option<i64> {
        self.keys.front().copied()
    }

    pub fn latest_open_ms(&self) -> Option<i64> {
        self.keys.back().copied()
    }

    pub fn all_bars_sorted(&self) -> Vec<CandleBar> {
        self.keys
            .iter()
            .filter_map(|k| self.bars.get(k).cloned())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bar(open_ms: i64, close: f64) -> CandleBar {
        CandleBar::ingested("NIFTY", 60, open_ms, close, close, close, close, 1.0)
    }

    #[test]
    fn test_upsert_keeps_sorted_and_unique() {
        let mut buffer = ClosedBarBuffer::new(60, 10);
        for open in [120_000, 0, 60_000, 240_000, 180_000] {
            buffer.upsert(bar(open, 1.0)).unwrap();
        }
        buffer.upsert(bar(60_000, 9.0)).unwrap();

        let opens: Vec<i64> = buffer.all_bars_sorted().iter().map(|b| b.open_time_ms).collect();
        assert_eq!(opens, vec![0, 60_000, 120_000, 180_000, 240_000]);
        assert_eq!(buffer.get(60_000).unwrap().close, 9.0);
        assert_eq!(buffer.len(), 5);
    }

    #[test]
    fn test_capacity_evicts_oldest() {
        let mut buffer = ClosedBarBuffer::new(60, 3);
        for i in 0..5 {
            buffer.upsert(bar(i * 60_000, i as f64)).unwrap();
        }
        assert_eq!(buffer.len(), 3);
        assert_eq!(buffer.earliest_open_ms(), Some(120_000));
        assert_eq!(buffer.latest_open_ms(), Some(240_000));
        assert!(!buffer.contains(0));

        // an out-of-order insert older than everything is evicted immediately
        buffer.upsert(bar(60_000, 0.0)).unwrap();
        assert_eq!(buffer.len(), 3);
        assert!(!buffer.contains(60_000));
    }

    #[test]
    fn test_rejects_other_timeframe() {
        let mut buffer = ClosedBarBuffer::new(60, 3);
        let wrong = CandleBar::ingested("NIFTY", 300, 0, 1.0, 1.0, 1.0, 1.0, 1.0);
        assert!(matches!(
            buffer.upsert(wrong),
            Err(CascadeError::TimeframeMismatch { expected: 60, actual: 300 })
        ));
        assert!(buffer.is_empty());
    }

    #[test]
    fn test_range_queries() {
        let mut buffer = ClosedBarBuffer::new(60, 100);
        for i in [0, 1, 2, 4] {
            buffer.upsert(bar(i * 60_000, i as f64)).unwrap();
        }

        assert!(buffer.has_range(0, 180_000, None));
        assert!(!buffer.has_range(0, 300_000, None));
        assert_eq!(buffer.missing_count(0, 300_000, None), 1);
        assert!(buffer.range_bars(0, 300_000, None).is_empty());
        assert_eq!(buffer.range_bars(0, 180_000, None).len(), 3);

        // slot 3 is non-trading
        let skip_three = |slot: i64| slot != 180_000;
        assert!(buffer.has_range(0, 300_000, Some(&skip_three)));
        assert_eq!(buffer.missing_count(0, 300_000, Some(&skip_three)), 0);
        let closes: Vec<f64> = buffer
            .range_bars(0, 300_000, Some(&skip_three))
            .iter()
            .map(|b| b.close)
            .collect();
        assert_eq!(closes, vec![0.0, 1.0, 2.0, 4.0]);
    }

    #[test]
    fn test_empty_range() {
        let buffer = ClosedBarBuffer::new(60, 10);
        assert!(buffer.has_range(0, 0, None));
        assert!(buffer.range_bars(0, 0, None).is_empty());
        assert_eq!(buffer.earliest_open_ms(), None);
    }
}
