/// Append-only JSONL bar store implementing the final-bar commit contract
use std::collections::{BTreeSet, HashMap};
use std::fs::{self, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use tracing::{debug, warn};

use crate::error::{CascadeError, Result};
use crate::time::timeframe_label;
use crate::types::{CandleBar, CommitOutcome};

/// Storage side of the cascade: persists one final bar per bucket.
///
/// Called while the symbol's cascade lock is held, so implementations should
/// be fast and local.
pub trait BarCommitter: Send + Sync {
    fn commit_final_bar(&self, bar: &CandleBar) -> CommitOutcome;
}

/// Committed opens remembered per series for duplicate detection
const RECENT_KEYS: usize = 4096;

#[derive(Debug, Default)]
struct SeriesState {
    watermark_ms: Option<i64>,
    recent: BTreeSet<i64>,
}

impl SeriesState {
    fn record(&mut self, open_time_ms: i64) {
        self.watermark_ms = Some(self.watermark_ms.map_or(open_time_ms, |w| w.max(open_time_ms)));
        self.recent.insert(open_time_ms);
        while self.recent.len() > RECENT_KEYS {
            self.recent.pop_first();
        }
    }
}

/// One JSONL file per (symbol, timeframe) under `root`
pub struct JsonlBarStore {
    root: PathBuf,
    series: Mutex<HashMap<(String, i64), SeriesState>>,
}

impl JsonlBarStore {
    pub fn new(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        fs::create_dir_all(&root)?;
        Ok(JsonlBarStore {
            root,
            series: Mutex::new(HashMap::new()),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn series_path(&self, symbol: &str, timeframe_s: i64) -> PathBuf {
        self.root
            .join(format!("{}_{}.jsonl", symbol, timeframe_label(timeframe_s)))
    }

    /// Rebuild watermarks for a series from its file (on startup)
    pub fn load_from_disk(&self, symbol: &str, timeframe_s: i64) -> Result<usize> {
        let bars = self.read_series(symbol, timeframe_s)?;
        let mut series = self.lock_series()?;
        let state = series
            .entry((symbol.to_string(), timeframe_s))
            .or_default();
        for bar in &bars {
            state.record(bar.open_time_ms);
        }

        debug!(
            "Loaded {} {} from disk: {} bars, watermark {:?}",
            symbol,
            timeframe_label(timeframe_s),
            bars.len(),
            state.watermark_ms
        );
        Ok(bars.len())
    }

    /// Last `n` stored bars of a series, oldest first
    pub fn load_recent(&self, symbol: &str, timeframe_s: i64, n: usize) -> Result<Vec<CandleBar>> {
        let bars = self.read_series(symbol, timeframe_s)?;
        let skip = bars.len().saturating_sub(n);
        Ok(bars.into_iter().skip(skip).collect())
    }

    fn read_series(&self, symbol: &str, timeframe_s: i64) -> Result<Vec<CandleBar>> {
        let path = self.series_path(symbol, timeframe_s);
        if !path.exists() {
            return Ok(Vec::new());
        }

        let reader = BufReader::new(fs::File::open(&path)?);
        let mut bars = Vec::new();
        for (line_no, line) in reader.lines().enumerate() {
            let line = line?;
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str::<CandleBar>(&line) {
                Ok(bar) => bars.push(bar),
                Err(e) => warn!(
                    "Skipping unreadable line {} in {}: {}",
                    line_no + 1,
                    path.display(),
                    e
                ),
            }
        }
        Ok(bars)
    }

    fn append_to_disk(&self, bar: &CandleBar) -> Result<()> {
        let path = self.series_path(&bar.symbol, bar.timeframe_s);
        let mut file = OpenOptions::new().create(true).append(true).open(&path)?;

        let json_line = serde_json::to_string(bar)?;
        file.write_all(format!("{}\n", json_line).as_bytes())?;
        file.sync_data()?;
        Ok(())
    }

    fn lock_series(&self) -> Result<std::sync::MutexGuard<'_, HashMap<(String, i64), SeriesState>>> {
        self.series
            .lock()
            .map_err(|_| CascadeError::InternalError("bar store lock poisoned".to_string()))
    }
}

impl BarCommitter for JsonlBarStore {
    fn commit_final_bar(&self, bar: &CandleBar) -> CommitOutcome {
        if !bar.complete {
            return CommitOutcome::rejected("incomplete");
        }

        let mut series = match self.lock_series() {
            Ok(series) => series,
            Err(e) => return CommitOutcome::rejected(e.to_string()),
        };
        let state = series
            .entry((bar.symbol.clone(), bar.timeframe_s))
            .or_default();

        if state.recent.contains(&bar.open_time_ms) {
            return CommitOutcome::rejected(CommitOutcome::DUPLICATE);
        }
        if state.watermark_ms.is_some_and(|w| bar.open_time_ms < w) {
            return CommitOutcome::rejected(CommitOutcome::STALE);
        }

        if let Err(e) = self.append_to_disk(bar) {
            return CommitOutcome::rejected(format!("io_error: {}", e));
        }
        state.record(bar.open_time_ms);

        debug!(
            "Committed {} {} @ {}",
            bar.symbol,
            timeframe_label(bar.timeframe_s),
            bar.open_time_ms
        );
        CommitOutcome::accepted()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scratch_dir() -> PathBuf {
        std::env::temp_dir().join(format!("candle_cascade_store_{}", uuid::Uuid::new_v4()))
    }

    fn bar(open_ms: i64) -> CandleBar {
        CandleBar::ingested("NIFTY", 300, open_ms, 1.0, 2.0, 0.5, 1.5, 10.0)
    }

    #[test]
    fn test_commit_duplicate_and_stale() {
        let dir = scratch_dir();
        let store = JsonlBarStore::new(&dir).unwrap();

        assert!(store.commit_final_bar(&bar(300_000)).ok);
        assert!(store.commit_final_bar(&bar(600_000)).ok);

        let dup = store.commit_final_bar(&bar(600_000));
        assert_eq!(dup.reason.as_deref(), Some("duplicate"));
        assert!(dup.is_expected_skip());

        let stale = store.commit_final_bar(&bar(0));
        assert_eq!(stale.reason.as_deref(), Some("stale"));

        let mut preview = bar(900_000);
        preview.complete = false;
        let rejected = store.commit_final_bar(&preview);
        assert!(!rejected.ok);
        assert!(!rejected.is_expected_skip());

        let _ = fs::remove_dir_all(dir);
    }

    #[test]
    fn test_reload_restores_watermark() {
        let dir = scratch_dir();
        {
            let store = JsonlBarStore::new(&dir).unwrap();
            for i in 0..5 {
                assert!(store.commit_final_bar(&bar(i * 300_000)).ok);
            }
        }

        let store = JsonlBarStore::new(&dir).unwrap();
        assert_eq!(store.load_from_disk("NIFTY", 300).unwrap(), 5);
        assert!(store.commit_final_bar(&bar(1_200_000)).is_expected_skip());
        assert!(store.commit_final_bar(&bar(1_500_000)).ok);

        let recent = store.load_recent("NIFTY", 300, 2).unwrap();
        let opens: Vec<i64> = recent.iter().map(|b| b.open_time_ms).collect();
        assert_eq!(opens, vec![1_200_000, 1_500_000]);

        let _ = fs::remove_dir_all(dir);
    }
}
