/// Declarative aggregation DAG: which coarser timeframes each timeframe feeds
use std::collections::BTreeMap;

use crate::error::{CascadeError, Result};
use crate::time::{timeframe_label, DAILY_TIMEFRAME_S};

pub const BASE_TIMEFRAME_S: i64 = 60;

/// Standard edges as (source, target, bars per bucket)
const STANDARD_EDGES: &[(i64, i64, u32)] = &[
    (60, 180, 3),
    (60, 300, 5),
    (60, DAILY_TIMEFRAME_S, 1440),
    (300, 900, 3),
    (900, 1800, 2),
    (900, 14_400, 16),
    (1800, 3600, 2),
    (3600, 7200, 2),
    (3600, 10_800, 3),
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CascadeEdge {
    pub target_s: i64,
    pub ratio: u32,
}

/// Validated, immutable cascade table
#[derive(Debug, Clone)]
pub struct CascadeChain {
    base_s: i64,
    forward: BTreeMap<i64, Vec<CascadeEdge>>,
    reverse: BTreeMap<i64, (i64, u32)>,
    depth: BTreeMap<i64, usize>,
    ordering: Vec<i64>,
}

impl CascadeChain {
    pub fn standard() -> Result<Self> {
        CascadeChain::from_edges(BASE_TIMEFRAME_S, STANDARD_EDGES)
    }

    /// Build and validate a table from (source, target, ratio) edges
    pub fn from_edges(base_s: i64, edges: &[(i64, i64, u32)]) -> Result<Self> {
        if base_s <= 0 {
            return Err(CascadeError::InvalidCascadeTable(format!(
                "base timeframe must be positive, got {}s",
                base_s
            )));
        }
        if edges.is_empty() {
            return Err(CascadeError::InvalidCascadeTable("no cascade edges".to_string()));
        }

        let mut forward: BTreeMap<i64, Vec<CascadeEdge>> = BTreeMap::new();
        let mut reverse: BTreeMap<i64, (i64, u32)> = BTreeMap::new();

        for &(source_s, target_s, ratio) in edges {
            if source_s <= 0 || target_s <= 0 {
                return Err(CascadeError::InvalidCascadeTable(format!(
                    "non-positive timeframe in edge {}s -> {}s",
                    source_s, target_s
                )));
            }
            if target_s <= source_s {
                return Err(CascadeError::InvalidCascadeTable(format!(
                    "edge {} -> {} does not increase duration",
                    timeframe_label(source_s),
                    timeframe_label(target_s)
                )));
            }
            if target_s % source_s != 0 || (target_s / source_s) != ratio as i64 {
                return Err(CascadeError::InvalidCascadeTable(format!(
                    "edge {} -> {} ratio {} does not divide {}s by {}s",
                    timeframe_label(source_s),
                    timeframe_label(target_s),
                    ratio,
                    target_s,
                    source_s
                )));
            }
            if target_s == base_s {
                return Err(CascadeError::InvalidCascadeTable(
                    "the base timeframe cannot be a cascade target".to_string(),
                ));
            }
            if reverse.insert(target_s, (source_s, ratio)).is_some() {
                return Err(CascadeError::InvalidCascadeTable(format!(
                    "{} has more than one source",
                    timeframe_label(target_s)
                )));
            }
            forward
                .entry(source_s)
                .or_default()
                .push(CascadeEdge { target_s, ratio });
        }

        for targets in forward.values_mut() {
            targets.sort_by_key(|e| e.target_s);
        }

        // Every target must reach the base through its single-source chain
        let mut depth = BTreeMap::new();
        for &target_s in reverse.keys() {
            let mut hops = 0usize;
            let mut cursor = target_s;
            while cursor != base_s {
                let Some(&(source_s, _)) = reverse.get(&cursor) else {
                    return Err(CascadeError::InvalidCascadeTable(format!(
                        "{} is not connected to the base {}",
                        timeframe_label(target_s),
                        timeframe_label(base_s)
                    )));
                };
                cursor = source_s;
                hops += 1;
                if hops > reverse.len() {
                    return Err(CascadeError::InvalidCascadeTable(format!(
                        "cycle through {}",
                        timeframe_label(target_s)
                    )));
                }
            }
            depth.insert(target_s, hops);
        }

        // Dependency order: depth first, then period. The direct base -> daily
        // edge has depth 1, so the daily frame sorts ahead of every frame that
        // needs intermediate levels.
        let mut ordering: Vec<i64> = reverse.keys().copied().collect();
        ordering.sort_by_key(|tf| (depth[tf], *tf));

        Ok(CascadeChain {
            base_s,
            forward,
            reverse,
            depth,
            ordering,
        })
    }

    pub fn base_s(&self) -> i64 {
        self.base_s
    }

    pub fn targets_of(&self, source_s: i64) -> &[CascadeEdge] {
        self.forward.get(&source_s).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn source_of(&self, target_s: i64) -> Option<(i64, u32)> {
        self.reverse.get(&target_s).copied()
    }

    pub fn is_source(&self, tf_s: i64) -> bool {
        self.forward.contains_key(&tf_s)
    }

    pub fn is_target(&self, tf_s: i64) -> bool {
        self.reverse.contains_key(&tf_s)
    }

    /// Timeframes that get a buffer: the base plus every target
    pub fn tracks(&self, tf_s: i64) -> bool {
        tf_s == self.base_s || self.is_target(tf_s)
    }

    /// Non-base timeframes in dependency order
    pub fn ordering(&self) -> &[i64] {
        &self.ordering
    }

    pub fn depth_of(&self, tf_s: i64) -> Option<usize> {
        if tf_s == self.base_s {
            return Some(0);
        }
        self.depth.get(&tf_s).copied()
    }

    /// Number of derivation levels above the base
    pub fn height(&self) -> usize {
        self.depth.values().copied().max().unwrap_or(0)
    }

    /// All timeframes known to the table, ascending
    pub fn timeframes(&self) -> Vec<i64> {
        let mut all: Vec<i64> = std::iter::once(self.base_s)
            .chain(self.reverse.keys().copied())
            .collect();
        all.sort_unstable();
        all
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_standard_chain_shape() {
        let chain = CascadeChain::standard().unwrap();
        assert_eq!(chain.source_of(900), Some((300, 3)));
        assert_eq!(chain.source_of(DAILY_TIMEFRAME_S), Some((60, 1440)));
        assert_eq!(chain.source_of(60), None);
        assert_eq!(chain.targets_of(60).len(), 3);
        assert!(chain.targets_of(180).is_empty());
        assert_eq!(chain.height(), 5);
        assert!(chain.tracks(60) && chain.tracks(180) && !chain.tracks(120));
    }

    #[test]
    fn test_ordering_puts_daily_before_deep_frames() {
        let chain = CascadeChain::standard().unwrap();
        assert_eq!(
            chain.ordering(),
            &[180, 300, DAILY_TIMEFRAME_S, 900, 1800, 14_400, 3600, 7200, 10_800]
        );
        // every frame appears after its source
        for (idx, tf) in chain.ordering().iter().enumerate() {
            let (source, _) = chain.source_of(*tf).unwrap();
            if source != chain.base_s() {
                let source_idx = chain.ordering().iter().position(|t| *t == source).unwrap();
                assert!(source_idx < idx);
            }
        }
    }

    #[test]
    fn test_rejects_non_dividing_ratio() {
        let err = CascadeChain::from_edges(60, &[(60, 300, 4)]).unwrap_err();
        assert!(matches!(err, CascadeError::InvalidCascadeTable(_)));
        assert!(CascadeChain::from_edges(60, &[(60, 420, 7), (420, 900, 2)]).is_err());
    }

    #[test]
    fn test_rejects_multiple_sources_and_orphans() {
        assert!(CascadeChain::from_edges(60, &[(60, 900, 15), (300, 900, 3), (60, 300, 5)]).is_err());
        assert!(CascadeChain::from_edges(60, &[(120, 600, 5)]).is_err());
        assert!(CascadeChain::from_edges(60, &[(300, 60, 0)]).is_err());
        assert!(CascadeChain::from_edges(60, &[]).is_err());
    }
}
