/// Which coarser buckets a newly closed source bar may complete
use crate::cascade::chain::CascadeChain;
use crate::time::{bucket_start_ms, resolve_anchor_offset_ms, AnchorConfig, SessionProbe};
use crate::types::CandleBar;

/// Open time of the last source slot expected in a target bucket.
///
/// Without a calendar (or when the nominal last slot trades) this is
/// `bucket_close - source_ms`. Otherwise it steps back one source slot at a
/// time to the last slot holding any trading minute; `None` if the whole
/// bucket is non-trading.
pub fn expected_last_slot_ms(
    bucket_open_ms: i64,
    target_ms: i64,
    source_ms: i64,
    probe: Option<&SessionProbe<'_>>,
) -> Option<i64> {
    let nominal = bucket_open_ms + target_ms - source_ms;
    let Some(probe) = probe.filter(|p| p.has_calendar()) else {
        return Some(nominal);
    };

    let mut slot = nominal;
    while slot >= bucket_open_ms {
        if probe.slot_is_trading(slot, source_ms) {
            return Some(slot);
        }
        slot -= source_ms;
    }
    None
}

/// (target timeframe, bucket open) pairs whose last expected slot is `bar`
pub fn resolve_triggers(
    chain: &CascadeChain,
    bar: &CandleBar,
    anchors: &AnchorConfig,
    probe: Option<&SessionProbe<'_>>,
) -> Vec<(i64, i64)> {
    let source_ms = bar.timeframe_ms();
    let mut triggers = Vec::new();

    for edge in chain.targets_of(bar.timeframe_s) {
        let target_ms = edge.target_s * 1000;
        let anchor_ms = resolve_anchor_offset_ms(edge.target_s, anchors);
        let bucket_open = bucket_start_ms(bar.open_time_ms, target_ms, anchor_ms);

        match expected_last_slot_ms(bucket_open, target_ms, source_ms, probe) {
            Some(last_slot) if last_slot == bar.open_time_ms => {
                triggers.push((edge.target_s, bucket_open));
            }
            _ => {}
        }
    }

    triggers
}
