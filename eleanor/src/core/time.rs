//! Shared time utilities: duration/threshold parsing for correlation rules
//! (grounded in `correlation_engine.py`'s `parse_duration`/`parse_threshold`)
//! and WebKit/Chrome timestamp conversion for the browser-history parser.

use once_cell::sync::Lazy;
use regex::Regex;

use crate::err::{EleanorError, Result};

static DURATION_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"^(\d+)([smhdw])$").unwrap());
static THRESHOLD_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"^(>=|>|<=|<|==|=)\s*(\d+)$").unwrap());

/// Parses strings like `5m`, `30s`, `2h`, `1d`, `1w` into seconds.
pub fn parse_duration(s: &str) -> Result<i64> {
    let caps = DURATION_RE
        .captures(s.trim())
        .ok_or_else(|| EleanorError::rule("duration", format!("invalid duration: {s}")))?;
    let n: i64 = caps[1].parse().map_err(|_| EleanorError::rule("duration", format!("invalid duration: {s}")))?;
    let unit = &caps[2];
    let multiplier = match unit {
        "s" => 1,
        "m" => 60,
        "h" => 3600,
        "d" => 86_400,
        "w" => 604_800,
        _ => unreachable!(),
    };
    Ok(n * multiplier)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Comparator {
    Ge,
    Gt,
    Le,
    Lt,
    Eq,
}

/// Parses strings like `>=5`, `>3`, `<=10`, `<2`, `==1`, `=1` (alias for `==`).
pub fn parse_threshold(s: &str) -> Result<(Comparator, i64)> {
    let caps = THRESHOLD_RE
        .captures(s.trim())
        .ok_or_else(|| EleanorError::rule("threshold", format!("invalid threshold: {s}")))?;
    let comparator = match &caps[1] {
        ">=" => Comparator::Ge,
        ">" => Comparator::Gt,
        "<=" => Comparator::Le,
        "<" => Comparator::Lt,
        "==" | "=" => Comparator::Eq,
        other => return Err(EleanorError::rule("threshold", format!("unknown comparator: {other}"))),
    };
    let n: i64 = caps[2].parse().map_err(|_| EleanorError::rule("threshold", format!("invalid threshold: {s}")))?;
    Ok((comparator, n))
}

pub fn check_threshold(value: i64, comparator: Comparator, threshold: i64) -> bool {
    match comparator {
        Comparator::Ge => value >= threshold,
        Comparator::Gt => value > threshold,
        Comparator::Le => value <= threshold,
        Comparator::Lt => value < threshold,
        Comparator::Eq => value == threshold,
    }
}

/// WebKit/Chrome epoch is microseconds since 1601-01-01. Used by the
/// browser-history parser to convert `visits.visit_time` columns.
pub fn webkit_timestamp_to_utc(webkit_micros: i64) -> chrono::DateTime<chrono::Utc> {
    const WEBKIT_EPOCH_OFFSET_MICROS: i64 = 11_644_473_600_000_000;
    let unix_micros = webkit_micros - WEBKIT_EPOCH_OFFSET_MICROS;
    chrono::DateTime::from_timestamp_micros(unix_micros).unwrap_or_else(|| chrono::DateTime::UNIX_EPOCH)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn duration_parses_all_units() {
        assert_eq!(parse_duration("30s").unwrap(), 30);
        assert_eq!(parse_duration("5m").unwrap(), 300);
        assert_eq!(parse_duration("2h").unwrap(), 7200);
        assert_eq!(parse_duration("1d").unwrap(), 86_400);
        assert_eq!(parse_duration("1w").unwrap(), 604_800);
        assert!(parse_duration("5x").is_err());
    }

    #[test]
    fn threshold_parses_and_aliases_eq() {
        let (c, n) = parse_threshold(">=5").unwrap();
        assert_eq!(c, Comparator::Ge);
        assert_eq!(n, 5);
        let (c, _) = parse_threshold("=1").unwrap();
        assert_eq!(c, Comparator::Eq);
    }

    #[test]
    fn webkit_epoch_converts_to_unix() {
        // 1601-01-01 + 11644473600s should be the unix epoch.
        let dt = webkit_timestamp_to_utc(11_644_473_600_000_000);
        assert_eq!(dt.timestamp(), 0);
    }
}
