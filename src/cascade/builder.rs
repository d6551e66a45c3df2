/// Two-phase construction of one coarser bar from a source buffer
use std::collections::BTreeMap;
use std::sync::Arc;

use tracing::{debug, warn};

use crate::cascade::aggregator::aggregate;
use crate::cascade::chain::CascadeChain;
use crate::data::ClosedBarBuffer;
use crate::error::Result;
use crate::time::{resolve_anchor_offset_ms, timeframe_label, AnchorConfig, SessionProbe, DAILY_TIMEFRAME_S};
use crate::types::{meta, CandleBar};

pub const DEFAULT_GAP_BUDGET: u32 = 2;
pub const DAILY_GAP_BUDGET: u32 = 30;

/// Source slots of one bucket with their trading status
struct SlotPlan {
    open_ms: i64,
    step_ms: i64,
    trading: Vec<bool>,
}

impl SlotPlan {
    fn new(open_ms: i64, ratio: u32, step_ms: i64, probe: Option<&SessionProbe<'_>>) -> Self {
        let trading = (0..ratio as i64)
            .map(|i| probe.map_or(true, |p| p.slot_is_trading(open_ms + i * step_ms, step_ms)))
            .collect();
        SlotPlan {
            open_ms,
            step_ms,
            trading,
        }
    }

    fn is_trading(&self, slot_ms: i64) -> bool {
        let idx = (slot_ms - self.open_ms).div_euclid(self.step_ms);
        usize::try_from(idx)
            .ok()
            .and_then(|i| self.trading.get(i).copied())
            .unwrap_or(false)
    }

    fn trading_slots(&self) -> Vec<i64> {
        self.trading
            .iter()
            .enumerate()
            .filter(|(_, trading)| **trading)
            .map(|(i, _)| self.open_ms + i as i64 * self.step_ms)
            .collect()
    }

    /// The session starts late or ends early inside this bucket.
    ///
    /// Strict builds of such buckets are still tagged `partial` and
    /// `boundary_partial`, so with a session calendar most 30m-and-above bars
    /// carry the tags even when `source_count == expected_count`. Equal counts
    /// mean the bucket was cut by the session, not that data is missing.
    fn trimmed_at_edges(&self) -> bool {
        self.trading.iter().any(|t| *t)
            && (self.trading.first() == Some(&false) || self.trading.last() == Some(&false))
    }
}

/// Builds target bars for one cascade table
#[derive(Debug, Clone)]
pub struct BarBuilder {
    chain: Arc<CascadeChain>,
    anchors: AnchorConfig,
    gap_budgets: BTreeMap<i64, u32>,
    default_gap_budget: u32,
}

impl BarBuilder {
    pub fn new(chain: Arc<CascadeChain>, anchors: AnchorConfig) -> Self {
        let mut gap_budgets = BTreeMap::new();
        gap_budgets.insert(DAILY_TIMEFRAME_S, DAILY_GAP_BUDGET);
        BarBuilder {
            chain,
            anchors,
            gap_budgets,
            default_gap_budget: DEFAULT_GAP_BUDGET,
        }
    }

    pub fn with_gap_budget(mut self, target_tf_s: i64, budget: u32) -> Self {
        self.gap_budgets.insert(target_tf_s, budget);
        self
    }

    pub fn with_default_gap_budget(mut self, budget: u32) -> Self {
        self.default_gap_budget = budget;
        self
    }

    pub fn gap_budget(&self, target_tf_s: i64) -> u32 {
        self.gap_budgets
            .get(&target_tf_s)
            .copied()
            .unwrap_or(self.default_gap_budget)
    }

    pub fn chain(&self) -> &CascadeChain {
        &self.chain
    }

    pub fn anchors(&self) -> &AnchorConfig {
        &self.anchors
    }

    /// Try to materialise the `target_tf_s` bar opening at `bucket_open_ms`.
    ///
    /// `Ok(None)` means "not yet": the caller retries on the next trigger or
    /// overdue sweep.
    pub fn build(
        &self,
        symbol: &str,
        target_tf_s: i64,
        source: &ClosedBarBuffer,
        bucket_open_ms: i64,
        probe: Option<&SessionProbe<'_>>,
        filter_pause: bool,
    ) -> Result<Option<CandleBar>> {
        let Some((source_s, ratio)) = self.chain.source_of(target_tf_s) else {
            debug!("No cascade source for {} {}", symbol, timeframe_label(target_tf_s));
            return Ok(None);
        };
        if source.timeframe_s() != source_s {
            warn!(
                "Buffer timeframe {} does not feed {} for {}",
                timeframe_label(source.timeframe_s()),
                timeframe_label(target_tf_s),
                symbol
            );
            return Ok(None);
        }

        let source_ms = source_s * 1000;
        let bucket_end_ms = bucket_open_ms + target_tf_s * 1000;
        let anchor_s = resolve_anchor_offset_ms(target_tf_s, &self.anchors) / 1000;
        let probe = probe.filter(|p| p.has_calendar());
        let plan = SlotPlan::new(bucket_open_ms, ratio, source_ms, probe);
        let is_trading = |slot: i64| plan.is_trading(slot);

        // Strict: every trading slot present
        if source.has_range(bucket_open_ms, bucket_end_ms, Some(&is_trading)) {
            let bars = source.range_bars(bucket_open_ms, bucket_end_ms, Some(&is_trading));
            let expected = bars.len();
            let Some(mut bar) = aggregate(&bars, symbol, target_tf_s, bucket_open_ms, anchor_s, filter_pause)? else {
                return Ok(None);
            };
            if plan.trimmed_at_edges() {
                let kept = contributing(&bars, filter_pause);
                mark_boundary_partial(&mut bar, kept, expected, 0);
            }
            return Ok(Some(bar));
        }

        if probe.is_none() {
            debug!(
                "{} {} @ {} missing {} of {} slots",
                symbol,
                timeframe_label(target_tf_s),
                bucket_open_ms,
                source.missing_count(bucket_open_ms, bucket_end_ms, None),
                ratio
            );
            return Ok(None);
        }

        // Tolerant: free gaps at the first/last trading slot, budgeted gaps elsewhere
        let trading_slots = plan.trading_slots();
        let (Some(&first), Some(&last)) = (trading_slots.first(), trading_slots.last()) else {
            return Ok(None);
        };
        let budget = self.gap_budget(target_tf_s);
        let mut collected = Vec::with_capacity(trading_slots.len());
        let mut mid_session_gaps = 0u32;

        for &slot in &trading_slots {
            match source.get(slot) {
                Some(bar) => collected.push(bar.clone()),
                None if slot == first || slot == last => {}
                None => {
                    mid_session_gaps += 1;
                    if mid_session_gaps > budget {
                        debug!(
                            "{} {} @ {} exceeds gap budget {}",
                            symbol,
                            timeframe_label(target_tf_s),
                            bucket_open_ms,
                            budget
                        );
                        return Ok(None);
                    }
                }
            }
        }

        let Some(mut bar) = aggregate(&collected, symbol, target_tf_s, bucket_open_ms, anchor_s, filter_pause)? else {
            return Ok(None);
        };
        let kept = contributing(&collected, filter_pause);
        mark_boundary_partial(&mut bar, kept, trading_slots.len(), mid_session_gaps);

        debug!(
            "Boundary-tolerant {} {} @ {}: {}/{} slots, {} mid-session gaps",
            symbol,
            timeframe_label(target_tf_s),
            bucket_open_ms,
            kept,
            trading_slots.len(),
            mid_session_gaps
        );
        Ok(Some(bar))
    }
}

fn contributing(bars: &[CandleBar], filter_pause: bool) -> usize {
    bars.iter()
        .filter(|b| !(filter_pause && b.is_pause_placeholder()))
        .count()
}

fn mark_boundary_partial(bar: &mut CandleBar, source_count: usize, expected_count: usize, mid_session_gaps: u32) {
    bar.set_flag(meta::PARTIAL);
    bar.set_flag(meta::BOUNDARY_PARTIAL);
    bar.set_count(meta::SOURCE_COUNT, source_count);
    bar.set_count(meta::EXPECTED_COUNT, expected_count);
    bar.push_partial_reason(meta::REASON_BOUNDARY_GAP);
    if mid_session_gaps > 0 {
        bar.set_count(meta::MID_SESSION_GAPS, mid_session_gaps as usize);
    }
}
