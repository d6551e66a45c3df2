/// Replay closed 1m bars through the cascade and persist derived bars
/// Usage: CONFIG_PATH=config.toml cargo run --release -- data/replay/nifty_1m.jsonl
use std::collections::BTreeMap;
use std::io::{BufRead, BufReader};
use std::sync::Arc;

use anyhow::Context;
use futures_util::future::join_all;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use candle_cascade::{
    config::load_config,
    data::JsonlBarStore,
    time::{SessionCalendar, TradingCalendar},
    CandleBar, CascadeChain, CascadeEngine, EngineSettings,
};

fn read_replay_input(path: &str) -> anyhow::Result<BTreeMap<String, Vec<CandleBar>>> {
    let file = std::fs::File::open(path).with_context(|| format!("opening replay input {}", path))?;
    let mut by_symbol: BTreeMap<String, Vec<CandleBar>> = BTreeMap::new();

    for (line_no, line) in BufReader::new(file).lines().enumerate() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        match serde_json::from_str::<CandleBar>(&line) {
            Ok(bar) => by_symbol.entry(bar.symbol.clone()).or_default().push(bar),
            Err(e) => warn!("Skipping line {} of {}: {}", line_no + 1, path, e),
        }
    }

    for bars in by_symbol.values_mut() {
        bars.sort_by_key(|b| b.open_time_ms);
    }
    Ok(by_symbol)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config_path = std::env::var("CONFIG_PATH").unwrap_or_else(|_| "config.toml".to_string());
    let config = load_config(&config_path).with_context(|| format!("loading {}", config_path))?;

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_level)),
        )
        .init();

    let run_id = uuid::Uuid::new_v4();
    info!("Cascade replay {} starting with {}", run_id, config_path);

    let input = std::env::var("REPLAY_INPUT")
        .ok()
        .or_else(|| std::env::args().nth(1))
        .context("no replay input: set REPLAY_INPUT or pass a path")?;

    let chain = CascadeChain::standard()?;
    let settings = EngineSettings::from_config(&config, &chain)?;
    let engine = Arc::new(CascadeEngine::new(settings, chain)?);

    let store = Arc::new(JsonlBarStore::new(&config.bar_store_dir)?);
    let calendar: Option<Arc<dyn TradingCalendar>> = match &config.calendar {
        Some(calendar_config) => Some(Arc::new(SessionCalendar::from_config(calendar_config)?)),
        None => None,
    };

    // Bind storage and calendar, then warm buffers from what is already persisted
    let mut history = Vec::new();
    for symbol in &config.symbols {
        engine.register_storage(symbol, store.clone()).await?;
        if let Some(calendar) = &calendar {
            engine.register_calendar(symbol, Arc::clone(calendar)).await?;
        }
        for &tf in &engine.settings().persist {
            store.load_from_disk(symbol, tf)?;
            history.extend(store.load_recent(symbol, tf, engine.settings().capacity_for(tf))?);
        }
    }
    engine.warmup(&history).await;

    let by_symbol = read_replay_input(&input)?;
    let replay_end_ms = by_symbol
        .values()
        .filter_map(|bars| bars.last())
        .map(|b| b.close_time_ms)
        .max();
    info!("Replaying {} symbols from {}", by_symbol.len(), input);

    let tasks = by_symbol.into_iter().map(|(symbol, bars)| {
        let engine = Arc::clone(&engine);
        tokio::spawn(async move {
            let committed = engine.replay(&bars).await.len();
            (symbol, bars.len(), committed)
        })
    });

    for result in join_all(tasks).await {
        match result {
            Ok((symbol, replayed, committed)) => {
                info!("{}: replayed {} bars, committed {} derived bars", symbol, replayed, committed)
            }
            Err(e) => error!("Replay task failed: {}", e),
        }
    }

    if let Some(now_ms) = replay_end_ms {
        let caught = engine.overdue_catch_up(now_ms).await;
        info!("Final overdue sweep committed {} bars", caught.len());
    }

    let stats = engine.stats().await;
    info!("Run {} stats: {}", run_id, serde_json::to_string(&stats)?);

    Ok(())
}
