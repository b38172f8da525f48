//! Time range and interval helpers used for down-sampling alignment.

use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

use crate::error::{Result, TsqError};

/// Inclusive `[start, end]` range in epoch milliseconds.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeRange {
    pub start: i64,
    pub end: i64,
}

impl TimeRange {
    pub fn new(start: i64, end: i64) -> Self {
        Self { start, end }
    }

    pub fn contains(&self, timestamp: i64) -> bool {
        timestamp >= self.start && timestamp <= self.end
    }

    /// Align both bounds down to `interval_ms` boundaries.
    pub fn truncate(&self, interval_ms: i64) -> Self {
        Self {
            start: truncate(self.start, interval_ms),
            end: truncate(self.end, interval_ms),
        }
    }
}

/// Round `timestamp` down to a multiple of `interval_ms`.
pub fn truncate(timestamp: i64, interval_ms: i64) -> i64 {
    if interval_ms <= 0 {
        return timestamp;
    }
    timestamp.saturating_sub(timestamp.rem_euclid(interval_ms))
}

/// Parse an interval literal like `10s`, `5m`, `1h`, `1d` or `500ms` into milliseconds.
///
/// # Errors
/// Returns [`TsqError::InvalidConfig`] for empty, non-positive, overflowing or
/// unknown-unit input.
pub fn parse_interval(text: &str) -> Result<i64> {
    let text = text.trim();
    let split = text
        .find(|c: char| !c.is_ascii_digit())
        .ok_or_else(|| TsqError::InvalidConfig(format!("interval '{text}' has no unit")))?;
    let (digits, unit) = text.split_at(split);
    let value: i64 = digits
        .parse()
        .map_err(|e| TsqError::InvalidConfig(format!("interval '{text}': {e}")))?;
    let factor = match unit {
        "ms" => 1,
        "s" => 1_000,
        "m" => 60_000,
        "h" => 3_600_000,
        "d" => 86_400_000,
        other => {
            return Err(TsqError::InvalidConfig(format!(
                "interval '{text}' has unknown unit '{other}'"
            )))
        }
    };
    if value <= 0 {
        return Err(TsqError::InvalidConfig(format!(
            "interval '{text}' must be positive"
        )));
    }
    value.checked_mul(factor).ok_or_else(|| {
        TsqError::InvalidConfig(format!("interval '{text}' overflows milliseconds"))
    })
}

/// Current wall clock in epoch milliseconds.
pub fn now_millis() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or_default()
}

/// Current wall clock in epoch nanoseconds.
pub fn now_nanos() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos() as i64)
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_interval_units() {
        assert_eq!(parse_interval("500ms").expect("ms"), 500);
        assert_eq!(parse_interval("10s").expect("s"), 10_000);
        assert_eq!(parse_interval("5m").expect("m"), 300_000);
        assert_eq!(parse_interval("1h").expect("h"), 3_600_000);
        assert_eq!(parse_interval("1d").expect("d"), 86_400_000);
    }

    #[test]
    fn rejects_malformed_intervals() {
        for bad in ["", "10", "s", "10x", "0s"] {
            assert!(parse_interval(bad).is_err(), "{bad} should be rejected");
        }
    }

    #[test]
    fn truncates_range_to_interval() {
        let range = TimeRange::new(12_345, 29_999).truncate(10_000);
        assert_eq!(range, TimeRange::new(10_000, 20_000));
        assert_eq!(truncate(-1, 10), -10);
        assert_eq!(truncate(7, 0), 7);
    }

    #[test]
    fn huge_interval_is_a_config_error() {
        let err = parse_interval("200000000000000d").expect_err("overflow");
        assert!(matches!(err, TsqError::InvalidConfig(msg) if msg.contains("overflows")));
    }

    #[test]
    fn truncate_saturates_at_the_lower_bound() {
        assert_eq!(truncate(i64::MIN, 10_000), i64::MIN);
        assert_eq!(truncate(i64::MAX, 1), i64::MAX);
    }
}
