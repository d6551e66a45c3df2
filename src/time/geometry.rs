/// Timeframe and bucket arithmetic
use crate::error::{CascadeError, Result};

pub const MINUTE_MS: i64 = 60_000;
pub const FOUR_HOURS_S: i64 = 4 * 3600;
pub const DAILY_TIMEFRAME_S: i64 = 86_400;

/// Session alignment offsets, in seconds
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AnchorConfig {
    pub session_anchor_s: i64,
    pub daily_anchor_s: Option<i64>,
}

impl AnchorConfig {
    pub fn new(session_anchor_s: i64, daily_anchor_s: Option<i64>) -> Self {
        AnchorConfig {
            session_anchor_s,
            daily_anchor_s,
        }
    }
}

/// Convert a timeframe to milliseconds, optionally restricted to an allowlist
pub fn timeframe_to_ms(tf_s: i64, allowlist: Option<&[i64]>) -> Result<i64> {
    if tf_s <= 0 {
        return Err(CascadeError::InvalidParameter(format!(
            "timeframe must be positive, got {}s",
            tf_s
        )));
    }
    if let Some(allowed) = allowlist {
        if !allowed.contains(&tf_s) {
            return Err(CascadeError::InvalidParameter(format!(
                "timeframe {}s is not in the allowed set {:?}",
                tf_s, allowed
            )));
        }
    }
    Ok(tf_s * 1000)
}

/// Anchor offset (ms) applied to buckets of `tf_s`.
///
/// Intraday frames under 4h stay on the epoch grid. The daily frame prefers its
/// own anchor and falls back to the session anchor; everything else at 4h and
/// above uses the session anchor.
pub fn resolve_anchor_offset_ms(tf_s: i64, anchors: &AnchorConfig) -> i64 {
    if tf_s < FOUR_HOURS_S {
        return 0;
    }
    if tf_s == DAILY_TIMEFRAME_S {
        return anchors.daily_anchor_s.unwrap_or(anchors.session_anchor_s) * 1000;
    }
    anchors.session_anchor_s * 1000
}

/// Start of the bucket containing `ts_ms`
pub fn bucket_start_ms(ts_ms: i64, tf_ms: i64, anchor_offset_ms: i64) -> i64 {
    (ts_ms - anchor_offset_ms).div_euclid(tf_ms) * tf_ms + anchor_offset_ms
}

/// Short label for a timeframe: "1m", "15m", "4h", "1d", or "45s"
pub fn timeframe_label(tf_s: i64) -> String {
    if tf_s > 0 && tf_s % DAILY_TIMEFRAME_S == 0 {
        format!("{}d", tf_s / DAILY_TIMEFRAME_S)
    } else if tf_s > 0 && tf_s % 3600 == 0 {
        format!("{}h", tf_s / 3600)
    } else if tf_s > 0 && tf_s % 60 == 0 {
        format!("{}m", tf_s / 60)
    } else {
        format!("{}s", tf_s)
    }
}

/// Parse a timeframe label back to seconds
pub fn parse_timeframe_label(label: &str) -> Result<i64> {
    let label = label.trim();
    let invalid = || CascadeError::InvalidParameter(format!("invalid timeframe label '{}'", label));

    if label.len() < 2 || !label.is_ascii() {
        return Err(invalid());
    }
    let (digits, unit) = label.split_at(label.len() - 1);
    let value: i64 = digits.parse().map_err(|_| invalid())?;
    let multiplier = match unit {
        "s" => 1,
        "m" => 60,
        "h" => 3600,
        "d" => DAILY_TIMEFRAME_S,
        _ => return Err(invalid()),
    };
    if value <= 0 {
        return Err(invalid());
    }
    // must also survive conversion to milliseconds
    value
        .checked_mul(multiplier)
        .filter(|s| s.checked_mul(1000).is_some())
        .ok_or_else(invalid)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_timeframe_to_ms() {
        assert_eq!(timeframe_to_ms(300, None).unwrap(), 300_000);
        assert!(timeframe_to_ms(0, None).is_err());
        assert!(timeframe_to_ms(-60, None).is_err());

        let allowed = [60, 300];
        assert_eq!(timeframe_to_ms(60, Some(&allowed)).unwrap(), 60_000);
        assert!(matches!(
            timeframe_to_ms(900, Some(&allowed)),
            Err(CascadeError::InvalidParameter(_))
        ));
    }

    #[test]
    fn test_anchor_routing() {
        let anchors = AnchorConfig::new(13_500, Some(-19_800));
        assert_eq!(resolve_anchor_offset_ms(60, &anchors), 0);
        assert_eq!(resolve_anchor_offset_ms(10_800, &anchors), 0);
        assert_eq!(resolve_anchor_offset_ms(14_400, &anchors), 13_500_000);
        assert_eq!(resolve_anchor_offset_ms(DAILY_TIMEFRAME_S, &anchors), -19_800_000);

        // daily falls back to the session anchor
        let session_only = AnchorConfig::new(13_500, None);
        assert_eq!(resolve_anchor_offset_ms(DAILY_TIMEFRAME_S, &session_only), 13_500_000);
    }

    #[test]
    fn test_bucket_start() {
        assert_eq!(bucket_start_ms(299_999, 300_000, 0), 0);
        assert_eq!(bucket_start_ms(300_000, 300_000, 0), 300_000);

        // anchored 4h grid starting at 03:45 UTC
        let tf = 14_400_000;
        let anchor = 13_500_000;
        assert_eq!(bucket_start_ms(anchor, tf, anchor), anchor);
        assert_eq!(bucket_start_ms(anchor - 1, tf, anchor), anchor - tf);
        assert_eq!(bucket_start_ms(anchor + tf + 5, tf, anchor), anchor + tf);
    }

    #[test]
    fn test_labels_round_trip() {
        for (tf, label) in [(60, "1m"), (900, "15m"), (14_400, "4h"), (86_400, "1d"), (45, "45s")] {
            assert_eq!(timeframe_label(tf), label);
            assert_eq!(parse_timeframe_label(label).unwrap(), tf);
        }
        assert!(parse_timeframe_label("m").is_err());
        assert!(parse_timeframe_label("0m").is_err());
        assert!(parse_timeframe_label("5w").is_err());
    }

    #[test]
    fn test_oversized_labels_are_rejected() {
        assert!(parse_timeframe_label("99999999999999999d").is_err());
        assert!(parse_timeframe_label("9223372036854775s").is_err());
        assert_eq!(parse_timeframe_label("9223372036854s").unwrap(), 9_223_372_036_854);
    }
}
