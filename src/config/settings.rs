/// Validated engine settings resolved from the deployment config
use std::collections::{BTreeMap, BTreeSet, HashMap};

use crate::cascade::chain::CascadeChain;
use crate::error::{CascadeError, Result};
use crate::time::{parse_timeframe_label, resolve_anchor_offset_ms, timeframe_label, AnchorConfig, DAILY_TIMEFRAME_S};
use crate::types::Config;

pub const DEFAULT_BUFFER_CAPACITY: usize = 2000;
/// Enough base bars to rebuild a full daily bucket
pub const BASE_BUFFER_CAPACITY: usize = 3000;
pub const DEFAULT_GAP_BUDGET: u32 = crate::cascade::builder::DEFAULT_GAP_BUDGET;
pub const DAILY_GAP_BUDGET: u32 = crate::cascade::builder::DAILY_GAP_BUDGET;
pub const DEFAULT_OVERDUE_LOOKBACK: u32 = 2;
pub const DAILY_OVERDUE_LOOKBACK: u32 = 1;

#[derive(Debug, Clone)]
pub struct EngineSettings {
    pub symbols: Vec<String>,
    pub anchors: AnchorConfig,
    /// Targets to derive
    pub compute: BTreeSet<i64>,
    /// Subset of `compute` handed to storage
    pub persist: BTreeSet<i64>,
    pub filter_pause_bars: bool,
    pub buffer_capacity: BTreeMap<i64, usize>,
    pub gap_budget: BTreeMap<i64, u32>,
    pub overdue_lookback: BTreeMap<i64, u32>,
}

impl EngineSettings {
    /// Compute and persist every target with default tuning
    pub fn new(symbols: &[&str], chain: &CascadeChain) -> Self {
        let targets: BTreeSet<i64> = chain.ordering().iter().copied().collect();
        let mut settings = EngineSettings {
            symbols: symbols.iter().map(|s| s.to_string()).collect(),
            anchors: AnchorConfig::default(),
            compute: targets.clone(),
            persist: targets,
            filter_pause_bars: true,
            buffer_capacity: BTreeMap::new(),
            gap_budget: BTreeMap::new(),
            overdue_lookback: BTreeMap::new(),
        };
        settings.fill_defaults(chain);
        settings
    }

    pub fn from_config(config: &Config, chain: &CascadeChain) -> Result<Self> {
        let compute = parse_label_set(&config.compute_timeframes)?;
        let persist = parse_label_set(&config.persist_timeframes)?;

        let mut settings = EngineSettings {
            symbols: config.symbols.clone(),
            anchors: AnchorConfig::new(config.session_anchor_s, config.daily_anchor_s),
            compute,
            persist,
            filter_pause_bars: config.filter_pause_bars,
            buffer_capacity: parse_label_map(&config.buffer_capacity)?,
            gap_budget: parse_label_map(&config.gap_budget)?,
            overdue_lookback: parse_label_map(&config.overdue_lookback)?,
        };
        settings.fill_defaults(chain);
        settings.validate(chain)?;
        Ok(settings)
    }

    fn fill_defaults(&mut self, chain: &CascadeChain) {
        for tf in chain.timeframes() {
            let capacity = if tf == chain.base_s() {
                BASE_BUFFER_CAPACITY
            } else {
                DEFAULT_BUFFER_CAPACITY
            };
            self.buffer_capacity.entry(tf).or_insert(capacity);
        }
        for &tf in chain.ordering() {
            let (budget, lookback) = if tf == DAILY_TIMEFRAME_S {
                (DAILY_GAP_BUDGET, DAILY_OVERDUE_LOOKBACK)
            } else {
                (DEFAULT_GAP_BUDGET, DEFAULT_OVERDUE_LOOKBACK)
            };
            self.gap_budget.entry(tf).or_insert(budget);
            if self.compute.contains(&tf) {
                self.overdue_lookback.entry(tf).or_insert(lookback);
            }
        }
    }

    /// Startup checks; any failure here is fatal
    pub fn validate(&self, chain: &CascadeChain) -> Result<()> {
        if self.symbols.is_empty() {
            return Err(CascadeError::ConfigError("no symbols configured".to_string()));
        }
        let unique: BTreeSet<&String> = self.symbols.iter().collect();
        if unique.len() != self.symbols.len() {
            return Err(CascadeError::ConfigError("duplicate symbols configured".to_string()));
        }
        if self.compute.is_empty() {
            return Err(CascadeError::ConfigError("no cascade timeframes to compute".to_string()));
        }

        for &tf in &self.compute {
            let Some((source_s, ratio)) = chain.source_of(tf) else {
                return Err(CascadeError::ConfigError(format!(
                    "{} is not a cascade target",
                    timeframe_label(tf)
                )));
            };
            if source_s != chain.base_s() && !self.compute.contains(&source_s) {
                return Err(CascadeError::ConfigError(format!(
                    "{} needs {} to be computed",
                    timeframe_label(tf),
                    timeframe_label(source_s)
                )));
            }

            let capacity = self.capacity_for(source_s);
            if capacity < ratio as usize {
                return Err(CascadeError::ConfigError(format!(
                    "buffer capacity {} for {} cannot hold one {} bucket ({} bars)",
                    capacity,
                    timeframe_label(source_s),
                    timeframe_label(tf),
                    ratio
                )));
            }

            let target_anchor = resolve_anchor_offset_ms(tf, &self.anchors);
            let source_anchor = resolve_anchor_offset_ms(source_s, &self.anchors);
            if (target_anchor - source_anchor).rem_euclid(source_s * 1000) != 0 {
                return Err(CascadeError::ConfigError(format!(
                    "anchor {}ms for {} does not line up with {} source slots",
                    target_anchor,
                    timeframe_label(tf),
                    timeframe_label(source_s)
                )));
            }

            match self.overdue_lookback.get(&tf) {
                Some(0) | None => {
                    return Err(CascadeError::ConfigError(format!(
                        "overdue lookback for {} must be at least 1",
                        timeframe_label(tf)
                    )));
                }
                Some(_) => {}
            }
        }

        if let Some(tf) = self.persist.iter().find(|tf| !self.compute.contains(tf)) {
            return Err(CascadeError::ConfigError(format!(
                "{} is persisted but not computed",
                timeframe_label(*tf)
            )));
        }

        for (tf, capacity) in &self.buffer_capacity {
            if *capacity == 0 {
                return Err(CascadeError::ConfigError(format!(
                    "buffer capacity for {} must be positive",
                    timeframe_label(*tf)
                )));
            }
        }

        let known: BTreeSet<i64> = chain.timeframes().into_iter().collect();
        for tf in self
            .buffer_capacity
            .keys()
            .chain(self.gap_budget.keys())
            .chain(self.overdue_lookback.keys())
        {
            if !known.contains(tf) {
                return Err(CascadeError::ConfigError(format!(
                    "{} is not part of the cascade",
                    timeframe_label(*tf)
                )));
            }
        }

        Ok(())
    }

    pub fn computes(&self, tf_s: i64) -> bool {
        self.compute.contains(&tf_s)
    }

    pub fn persists(&self, tf_s: i64) -> bool {
        self.persist.contains(&tf_s)
    }

    pub fn capacity_for(&self, tf_s: i64) -> usize {
        self.buffer_capacity
            .get(&tf_s)
            .copied()
            .unwrap_or(DEFAULT_BUFFER_CAPACITY)
    }

    pub fn lookback_for(&self, tf_s: i64) -> u32 {
        self.overdue_lookback.get(&tf_s).copied().unwrap_or(0)
    }
}

fn parse_label_set(labels: &[String]) -> Result<BTreeSet<i64>> {
    labels.iter().map(|l| parse_timeframe_label(l)).collect()
}

fn parse_label_map<V: Copy>(map: &HashMap<String, V>) -> Result<BTreeMap<i64, V>> {
    map.iter()
        .map(|(label, value)| Ok((parse_timeframe_label(label)?, *value)))
        .collect()
}
