pub mod aggregator;
pub mod builder;
pub mod chain;
pub mod engine;
pub mod triggers;

pub use aggregator::aggregate;
pub use builder::BarBuilder;
pub use chain::{CascadeChain, CascadeEdge, BASE_TIMEFRAME_S};
pub use engine::{CascadeEngine, CascadeStats};
pub use triggers::{expected_last_slot_ms, resolve_triggers};
