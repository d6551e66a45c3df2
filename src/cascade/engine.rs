/// Multi-symbol cascade orchestrator
///
/// Owns the closed-bar buffers of every managed symbol, turns each newly closed
/// bar into the coarser bars it completes, hands final bars to storage, and
/// sweeps for buckets whose triggers were missed.
use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use serde::Serialize;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, error, info, warn};

use crate::cascade::builder::BarBuilder;
use crate::cascade::chain::CascadeChain;
use crate::cascade::triggers::{expected_last_slot_ms, resolve_triggers};
use crate::config::EngineSettings;
use crate::data::{BarCommitter, ClosedBarBuffer};
use crate::error::{CascadeError, Result};
use crate::time::{bucket_start_ms, resolve_anchor_offset_ms, timeframe_label, SessionProbe, TradingCalendar};
use crate::types::CandleBar;

/// Read-only snapshot of engine counters
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CascadeStats {
    /// Bars built, per target timeframe (seconds)
    pub derived: BTreeMap<i64, u64>,
    /// Bars accepted by storage, per target timeframe (seconds)
    pub committed: BTreeMap<i64, u64>,
    pub rejected: u64,
    pub expected_skips: u64,
    pub missing_storage: u64,
    pub cascade_invocations: u64,
    pub buffer_count: usize,
    pub calendar_unknown: u64,
    pub invariant_violations: u64,
    pub refused_derived_base: u64,
}

#[derive(Debug, Default)]
struct SymbolCounters {
    derived: BTreeMap<i64, u64>,
    committed: BTreeMap<i64, u64>,
    rejected: u64,
    expected_skips: u64,
    missing_storage: u64,
    calendar_unknown: u64,
    invariant_violations: u64,
    refused_derived_base: u64,
}

/// Everything the cascade touches for one symbol, behind one lock
struct SymbolState {
    symbol: String,
    buffers: HashMap<i64, ClosedBarBuffer>,
    storage: Option<Arc<dyn BarCommitter>>,
    calendar: Option<Arc<dyn TradingCalendar>>,
    counters: SymbolCounters,
}

impl SymbolState {
    fn new(symbol: &str) -> Self {
        SymbolState {
            symbol: symbol.to_string(),
            buffers: HashMap::new(),
            storage: None,
            calendar: None,
            counters: SymbolCounters::default(),
        }
    }

    fn has_bar(&self, tf_s: i64, open_time_ms: i64) -> bool {
        self.buffers
            .get(&tf_s)
            .is_some_and(|b| b.contains(open_time_ms))
    }

    fn buffer_bar(&mut self, bar: CandleBar, capacity: usize) {
        let tf_s = bar.timeframe_s;
        let buffer = self
            .buffers
            .entry(tf_s)
            .or_insert_with(|| ClosedBarBuffer::new(tf_s, capacity));
        if let Err(e) = buffer.upsert(bar) {
            error!("Failed to buffer {} bar: {} ({})", self.symbol, e, e.error_code());
        }
    }
}

/// The cascading derivation engine
pub struct CascadeEngine {
    settings: EngineSettings,
    chain: Arc<CascadeChain>,
    builder: BarBuilder,
    managed: HashSet<String>,
    states: RwLock<HashMap<String, Arc<Mutex<SymbolState>>>>,
    cascade_invocations: AtomicU64,
}

impl CascadeEngine {
    /// Validate settings against the table; fails before any bar is processed
    pub fn new(settings: EngineSettings, chain: CascadeChain) -> Result<Self> {
        settings.validate(&chain)?;

        let chain = Arc::new(chain);
        let builder = settings
            .gap_budget
            .iter()
            .fold(BarBuilder::new(Arc::clone(&chain), settings.anchors), |b, (tf, budget)| {
                b.with_gap_budget(*tf, *budget)
            });
        let managed = settings.symbols.iter().cloned().collect();

        info!(
            "Cascade engine ready: {} symbols, computing [{}], persisting [{}]",
            settings.symbols.len(),
            labels(&settings.compute),
            labels(&settings.persist)
        );

        Ok(CascadeEngine {
            settings,
            chain,
            builder,
            managed,
            states: RwLock::new(HashMap::new()),
            cascade_invocations: AtomicU64::new(0),
        })
    }

    /// Engine over the standard 1m-based table
    pub fn standard(settings: EngineSettings) -> Result<Self> {
        CascadeEngine::new(settings, CascadeChain::standard()?)
    }

    pub fn settings(&self) -> &EngineSettings {
        &self.settings
    }

    pub fn chain(&self) -> &CascadeChain {
        &self.chain
    }

    pub fn is_managed(&self, symbol: &str) -> bool {
        self.managed.contains(symbol)
    }

    /// Per-symbol state, created on first reference
    async fn symbol_state(&self, symbol: &str) -> Option<Arc<Mutex<SymbolState>>> {
        if !self.is_managed(symbol) {
            return None;
        }
        {
            let states = self.states.read().await;
            if let Some(state) = states.get(symbol) {
                return Some(Arc::clone(state));
            }
        }
        let mut states = self.states.write().await;
        let state = states
            .entry(symbol.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(SymbolState::new(symbol))));
        Some(Arc::clone(state))
    }

    /// Bind the committer for a symbol's final bars
    pub async fn register_storage(&self, symbol: &str, storage: Arc<dyn BarCommitter>) -> Result<()> {
        let handle = self
            .symbol_state(symbol)
            .await
            .ok_or_else(|| CascadeError::UnknownSymbol(symbol.to_string()))?;
        handle.lock().await.storage = Some(storage);
        debug!("Storage registered for {}", symbol);
        Ok(())
    }

    /// Bind the trading calendar that enables boundary-tolerant builds
    pub async fn register_calendar(&self, symbol: &str, calendar: Arc<dyn TradingCalendar>) -> Result<()> {
        let handle = self
            .symbol_state(symbol)
            .await
            .ok_or_else(|| CascadeError::UnknownSymbol(symbol.to_string()))?;
        handle.lock().await.calendar = Some(calendar);
        debug!("Calendar registered for {}", symbol);
        Ok(())
    }

    /// Feed one durably closed bar; returns every bar committed as a result
    pub async fn on_bar(&self, bar: &CandleBar) -> Vec<CandleBar> {
        if !bar.complete {
            debug!("Ignoring preview bar {} {} @ {}", bar.symbol, timeframe_label(bar.timeframe_s), bar.open_time_ms);
            return Vec::new();
        }
        let Some(handle) = self.symbol_state(&bar.symbol).await else {
            debug!("Ignoring bar for unmanaged symbol {}", bar.symbol);
            return Vec::new();
        };

        self.cascade_invocations.fetch_add(1, Ordering::Relaxed);
        let mut guard = handle.lock().await;
        let state = &mut *guard;

        if bar.timeframe_s == self.chain.base_s() && bar.is_derived() {
            warn!(
                "Refusing derived {} bar for {} @ {}",
                timeframe_label(bar.timeframe_s),
                bar.symbol,
                bar.open_time_ms
            );
            state.counters.refused_derived_base += 1;
            return Vec::new();
        }

        if self.chain.tracks(bar.timeframe_s) {
            state.buffer_bar(bar.clone(), self.settings.capacity_for(bar.timeframe_s));
        }

        let calendar = state.calendar.clone();
        let probe = SessionProbe::new(calendar.as_deref());
        let mut committed = Vec::new();
        self.run_cascade(state, bar.clone(), &probe, &mut committed);
        state.counters.calendar_unknown += probe.unknown_lookups();

        committed
    }

    /// Cold-start population: buffer history without triggering or committing
    pub async fn warmup(&self, bars: &[CandleBar]) -> usize {
        let mut by_symbol: BTreeMap<&str, Vec<&CandleBar>> = BTreeMap::new();
        for bar in bars {
            by_symbol.entry(bar.symbol.as_str()).or_default().push(bar);
        }

        let mut buffered = 0;
        for (symbol, bars) in by_symbol {
            let Some(handle) = self.symbol_state(symbol).await else {
                debug!("Skipping warmup for unmanaged symbol {}", symbol);
                continue;
            };
            let mut guard = handle.lock().await;
            let state = &mut *guard;

            for bar in bars {
                if !bar.complete || !self.chain.tracks(bar.timeframe_s) {
                    continue;
                }
                if bar.timeframe_s == self.chain.base_s() && bar.is_derived() {
                    state.counters.refused_derived_base += 1;
                    continue;
                }
                state.buffer_bar(bar.clone(), self.settings.capacity_for(bar.timeframe_s));
                buffered += 1;
            }
        }

        info!("Warmup buffered {} of {} bars", buffered, bars.len());
        buffered
    }

    /// Build and commit buckets whose last slot has passed without a trigger.
    ///
    /// Lower timeframes go first, so a caught-up bar can complete a higher one
    /// in the same sweep. Buckets already present are never rebuilt.
    pub async fn overdue_catch_up(&self, now_ms: i64) -> Vec<CandleBar> {
        let mut committed = Vec::new();
        for symbol in &self.settings.symbols {
            committed.extend(self.overdue_catch_up_symbol(symbol, now_ms).await);
        }
        committed
    }

    /// Overdue sweep for a single symbol
    pub async fn overdue_catch_up_symbol(&self, symbol: &str, now_ms: i64) -> Vec<CandleBar> {
        let Some(handle) = self.symbol_state(symbol).await else {
            return Vec::new();
        };
        let mut guard = handle.lock().await;
        let state = &mut *guard;

        let calendar = state.calendar.clone();
        let probe = SessionProbe::new(calendar.as_deref());
        let mut committed = Vec::new();

        for &target_tf in self.chain.ordering() {
            if !self.settings.computes(target_tf) {
                continue;
            }
            let Some((source_s, _)) = self.chain.source_of(target_tf) else {
                continue;
            };
            if !state.buffers.contains_key(&source_s) {
                continue;
            }

            let target_ms = target_tf * 1000;
            let source_ms = source_s * 1000;
            let anchor_ms = resolve_anchor_offset_ms(target_tf, &self.settings.anchors);
            let current = bucket_start_ms(now_ms, target_ms, anchor_ms);
            let lookback = self.settings.lookback_for(target_tf) as i64;

            // Oldest first so storage sees buckets in order
            for k in (0..=lookback).rev() {
                let bucket_open = current - k * target_ms;
                let Some(last_slot) = expected_last_slot_ms(bucket_open, target_ms, source_ms, Some(&probe)) else {
                    continue;
                };
                if last_slot + source_ms > now_ms || state.has_bar(target_tf, bucket_open) {
                    continue;
                }

                if let Some(bar) = self.derive_bucket(state, target_tf, bucket_open, &probe, &mut committed) {
                    debug!(
                        "Caught up overdue {} {} @ {}",
                        symbol,
                        timeframe_label(target_tf),
                        bucket_open
                    );
                    self.run_cascade(state, bar, &probe, &mut committed);
                }
            }
        }

        state.counters.calendar_unknown += probe.unknown_lookups();
        if !committed.is_empty() {
            info!("Overdue sweep committed {} bars for {}", committed.len(), symbol);
        }
        committed
    }

    /// Feed a time-ordered series, sweeping for overdue buckets at each close.
    ///
    /// A bucket whose closing source bar never arrives is caught up as soon as
    /// the series moves past it, before it can fall out of the lookback window.
    pub async fn replay(&self, bars: &[CandleBar]) -> Vec<CandleBar> {
        let mut committed = Vec::new();
        for bar in bars {
            committed.extend(self.on_bar(bar).await);
            if bar.complete && self.is_managed(&bar.symbol) {
                committed.extend(self.overdue_catch_up_symbol(&bar.symbol, bar.close_time_ms).await);
            }
        }
        committed
    }

    /// Counter snapshot across all symbols
    pub async fn stats(&self) -> CascadeStats {
        let handles: Vec<Arc<Mutex<SymbolState>>> = {
            let states = self.states.read().await;
            states.values().cloned().collect()
        };

        let mut stats = CascadeStats {
            cascade_invocations: self.cascade_invocations.load(Ordering::Relaxed),
            ..CascadeStats::default()
        };
        for handle in handles {
            let state = handle.lock().await;
            let counters = &state.counters;
            for (tf, n) in &counters.derived {
                *stats.derived.entry(*tf).or_default() += n;
            }
            for (tf, n) in &counters.committed {
                *stats.committed.entry(*tf).or_default() += n;
            }
            stats.rejected += counters.rejected;
            stats.expected_skips += counters.expected_skips;
            stats.missing_storage += counters.missing_storage;
            stats.calendar_unknown += counters.calendar_unknown;
            stats.invariant_violations += counters.invariant_violations;
            stats.refused_derived_base += counters.refused_derived_base;
            stats.buffer_count += state.buffers.len();
        }
        stats
    }

    /// Work-queue cascade from `seed` upward, bounded by the table height
    fn run_cascade(
        &self,
        state: &mut SymbolState,
        seed: CandleBar,
        probe: &SessionProbe<'_>,
        committed: &mut Vec<CandleBar>,
    ) {
        let max_depth = self.chain.height();
        let seed_depth = self.chain.depth_of(seed.timeframe_s).unwrap_or(0);
        let mut queue = VecDeque::from([(seed, seed_depth)]);

        while let Some((bar, depth)) = queue.pop_front() {
            for (target_tf, bucket_open) in resolve_triggers(&self.chain, &bar, &self.settings.anchors, Some(probe)) {
                if !self.settings.computes(target_tf) {
                    continue;
                }
                if depth >= max_depth {
                    warn!(
                        "Cascade depth {} reached for {} at {}",
                        depth,
                        state.symbol,
                        timeframe_label(bar.timeframe_s)
                    );
                    continue;
                }
                if let Some(derived) = self.derive_bucket(state, target_tf, bucket_open, probe, committed) {
                    queue.push_back((derived, depth + 1));
                }
            }
        }
    }

    /// Build one bucket if it is not already present; buffer it and commit it
    fn derive_bucket(
        &self,
        state: &mut SymbolState,
        target_tf: i64,
        bucket_open: i64,
        probe: &SessionProbe<'_>,
        committed: &mut Vec<CandleBar>,
    ) -> Option<CandleBar> {
        if state.has_bar(target_tf, bucket_open) {
            debug!(
                "{} {} @ {} already derived",
                state.symbol,
                timeframe_label(target_tf),
                bucket_open
            );
            return None;
        }
        let (source_s, _) = self.chain.source_of(target_tf)?;
        let source = state.buffers.get(&source_s)?;

        let built = match self.builder.build(
            &state.symbol,
            target_tf,
            source,
            bucket_open,
            Some(probe),
            self.settings.filter_pause_bars,
        ) {
            Ok(Some(bar)) => bar,
            Ok(None) => return None,
            Err(e) => {
                error!(
                    "Discarding {} {} @ {}: {} ({})",
                    state.symbol,
                    timeframe_label(target_tf),
                    bucket_open,
                    e,
                    e.error_code()
                );
                state.counters.invariant_violations += 1;
                return None;
            }
        };

        *state.counters.derived.entry(target_tf).or_default() += 1;
        state.buffer_bar(built.clone(), self.settings.capacity_for(target_tf));
        if self.settings.persists(target_tf) {
            commit(state, &built, committed);
        }
        Some(built)
    }
}

/// Hand a final bar to storage and classify the outcome
fn commit(state: &mut SymbolState, bar: &CandleBar, committed: &mut Vec<CandleBar>) {
    let Some(storage) = state.storage.clone() else {
        state.counters.missing_storage += 1;
        debug!(
            "No storage for {}; {} @ {} not persisted",
            state.symbol,
            timeframe_label(bar.timeframe_s),
            bar.open_time_ms
        );
        return;
    };

    let outcome = storage.commit_final_bar(bar);
    if outcome.ok {
        *state.counters.committed.entry(bar.timeframe_s).or_default() += 1;
        committed.push(bar.clone());
    } else if outcome.is_expected_skip() {
        state.counters.expected_skips += 1;
        debug!(
            "Storage skipped {} {} @ {}: {:?}",
            state.symbol,
            timeframe_label(bar.timeframe_s),
            bar.open_time_ms,
            outcome.reason
        );
    } else {
        state.counters.rejected += 1;
        warn!(
            "Storage rejected {} {} @ {}: {}",
            state.symbol,
            timeframe_label(bar.timeframe_s),
            bar.open_time_ms,
            outcome.reason.as_deref().unwrap_or("no reason given")
        );
    }
}

fn labels(set: &std::collections::BTreeSet<i64>) -> String {
    set.iter().map(|tf| timeframe_label(*tf)).collect::<Vec<_>>().join(", ")
}
