pub mod geometry;
pub mod session;
pub mod holidays;

pub use geometry::{
    bucket_start_ms, parse_timeframe_label, resolve_anchor_offset_ms, timeframe_label,
    timeframe_to_ms, AnchorConfig, DAILY_TIMEFRAME_S, FOUR_HOURS_S, MINUTE_MS,
};
pub use session::{SessionCalendar, SessionProbe, SessionWindow, TradingCalendar};
pub use holidays::{is_trading_day, parse_holidays};
