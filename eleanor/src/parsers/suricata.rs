//! Suricata parser covering both its output formats: `eve.json` (one JSON
//! object per line, discriminated by `event_type`: alert, dns, http, tls,
//! flow, fileinfo, ...) and the legacy `fast.log` text alert format.

use async_stream::try_stream;
use async_trait::async_trait;
use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::Value;

use crate::core::{NormalizedEvent, RawEvent};
use crate::err::EleanorError;

use super::{EventStream, Parser, ParserCategory};

#[derive(Default)]
pub struct SuricataParser;

/// `MM/DD/YYYY-HH:MM:SS.NNNNNN  [**] [gid:sid:rev] signature [**]
/// [Classification: class] [Priority: N] {proto} src:port -> dst:port`
static FAST_LOG_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"^(\d{2}/\d{2}/\d{4}-\d{2}:\d{2}:\d{2}\.\d+)\s+\[\*\*\]\s+\[(\d+):(\d+):(\d+)\]\s+(.+?)\s+\[\*\*\]\s+\[Classification:\s*([^\]]*)\]\s+\[Priority:\s*(\d+)\]\s+\{(\w+)\}\s+(\d+\.\d+\.\d+\.\d+):(\d+)\s+->\s+(\d+\.\d+\.\d+\.\d+):(\d+)",
    )
    .unwrap()
});

fn fast_log_severity(priority: u8) -> u8 {
    match priority {
        1 => 100,
        2 => 70,
        3 => 40,
        _ => 10,
    }
}

fn build_fast_log_event(line: &str) -> Option<NormalizedEvent> {
    let caps = FAST_LOG_RE.captures(line)?;
    let timestamp = chrono::NaiveDateTime::parse_from_str(&caps[1], "%m/%d/%Y-%H:%M:%S%.f")
        .map(|dt| dt.and_utc())
        .unwrap_or_else(|_| chrono::Utc::now());

    let signature = caps[5].to_string();
    let priority: u8 = caps[7].parse().unwrap_or(4);
    let proto = caps[8].to_lowercase();
    let src_ip = caps[9].to_string();
    let src_port: u16 = caps[10].parse().unwrap_or(0);
    let dst_ip = caps[11].to_string();
    let dst_port: u16 = caps[12].parse().unwrap_or(0);

    let mut event = NormalizedEvent::new("suricata:fast_log", timestamp, serde_json::json!({"raw_line": line}));
    event.category = "ids".to_string();
    event.severity = fast_log_severity(priority);
    event.message = Some(format!("Alert: {signature} ({src_ip}:{src_port} -> {dst_ip}:{dst_port})"));
    event.action = Some(signature);
    event.source_ip = Some(src_ip);
    event.source_port = Some(src_port);
    event.destination_ip = Some(dst_ip);
    event.destination_port = Some(dst_port);
    event.network_protocol = Some(proto);
    event.set_label("gid", caps[2].to_string());
    event.set_label("signature_id", caps[3].to_string());
    event.set_label("rev", caps[4].to_string());
    event.set_label("alert_category", caps[6].trim().to_string());
    event.set_label("priority", priority.to_string());
    Some(event)
}

fn severity_for_alert(value: &Value) -> u8 {
    value
        .get("alert")
        .and_then(|a| a.get("severity"))
        .and_then(Value::as_i64)
        .map(|sev| match sev {
            1 => 90,
            2 => 50,
            3 => 20,
            _ => 10,
        })
        .unwrap_or(10)
}

fn build_event(value: &Value) -> crate::err::Result<NormalizedEvent> {
    let event_type = value
        .get("event_type")
        .and_then(Value::as_str)
        .ok_or_else(|| EleanorError::malformed_record("suricata", 0, "missing event_type"))?
        .to_string();

    // eve.json's `timestamp` is ISO8601 with a numeric offset like
    // `+0000`, not the colon-delimited `+00:00` RFC3339 requires, so
    // `parse_from_rfc3339` rejects it; fall back to an explicit format.
    let timestamp = value
        .get("timestamp")
        .and_then(Value::as_str)
        .and_then(|s| {
            chrono::DateTime::parse_from_rfc3339(s)
                .or_else(|_| chrono::DateTime::parse_from_str(s, "%Y-%m-%dT%H:%M:%S%.f%z"))
                .ok()
        })
        .map(|dt| dt.with_timezone(&chrono::Utc))
        .unwrap_or_else(chrono::Utc::now);

    let mut event = NormalizedEvent::new("suricata", timestamp, value.clone());
    event.category = if event_type == "alert" { "ids".to_string() } else { "network".to_string() };
    event.severity = if event_type == "alert" { severity_for_alert(value) } else { 0 };
    event.message = value
        .get("alert")
        .and_then(|a| a.get("signature"))
        .and_then(Value::as_str)
        .map(str::to_string)
        .or(Some(event_type.clone()));

    event.source_ip = value.get("src_ip").and_then(Value::as_str).map(str::to_string);
    event.source_port = value.get("src_port").and_then(Value::as_u64).map(|p| p as u16);
    event.destination_ip = value.get("dest_ip").and_then(Value::as_str).map(str::to_string);
    event.destination_port = value.get("dest_port").and_then(Value::as_u64).map(|p| p as u16);
    event.network_protocol = value.get("proto").and_then(Value::as_str).map(str::to_string);

    if let Some(flow) = value.get("flow") {
        event.bytes_in = flow.get("bytes_toclient").and_then(Value::as_u64);
        event.bytes_out = flow.get("bytes_toserver").and_then(Value::as_u64);
    }

    event.set_label("event_type", event_type);
    Ok(event)
}

#[async_trait]
impl Parser for SuricataParser {
    fn category(&self) -> ParserCategory {
        ParserCategory::Suricata
    }

    fn sniff(&self, sample: &[u8]) -> bool {
        std::str::from_utf8(sample)
            .ok()
            .map(|s| {
                let eve = s.contains("\"event_type\"") && (s.contains("\"alert\"") || s.contains("\"flow_id\""));
                let fast_log = s.lines().take(10).any(|l| FAST_LOG_RE.is_match(l.trim()));
                eve || fast_log
            })
            .unwrap_or(false)
    }

    fn extensions(&self) -> &'static [&'static str] {
        &["eve", "json", "log"]
    }

    fn parse(&self, raw: RawEvent) -> EventStream {
        Box::pin(try_stream! {
            let text = raw.as_str().map_err(|e| EleanorError::malformed_source(raw.source.clone(), e))?;
            let is_fast_log = text
                .lines()
                .find(|l| !l.trim().is_empty())
                .map(|first| !first.trim_start().starts_with('{'))
                .unwrap_or(false);

            if is_fast_log {
                for (idx, line) in text.lines().enumerate() {
                    let line = line.trim();
                    if line.is_empty() {
                        continue;
                    }
                    match build_fast_log_event(line) {
                        Some(mut event) => {
                            event.data_source = raw.data_source.clone();
                            yield event;
                        }
                        None => tracing::warn!(source = %raw.source, line = idx as u64, "skipping unparseable fast.log line"),
                    }
                }
            } else {
                for (idx, line) in text.lines().enumerate() {
                    let line = line.trim();
                    if line.is_empty() {
                        continue;
                    }
                    match serde_json::from_str::<Value>(line) {
                        Ok(value) => match build_event(&value) {
                            Ok(mut event) => {
                                event.data_source = raw.data_source.clone();
                                yield event;
                            }
                            Err(e) => tracing::warn!(source = %raw.source, line = idx as u64, error = %e, "skipping malformed eve record"),
                        },
                        Err(e) => tracing::warn!(source = %raw.source, line = idx as u64, error = %e, "skipping invalid JSON line"),
                    }
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn builds_alert_event() {
        let value = json!({
            "event_type": "alert",
            "timestamp": "2024-01-01T00:00:00.000000+0000",
            "src_ip": "10.0.0.1",
            "dest_ip": "10.0.0.2",
            "alert": {"signature": "ET SCAN", "severity": 1},
        });
        let event = build_event(&value).unwrap();
        assert_eq!(event.severity, 90);
        assert_eq!(event.category, "ids");
    }

    #[test]
    fn builds_fast_log_event() {
        let line = "01/15/2024-10:30:00.123456  [**] [1:2010935:2] ET SCAN Suspicious [**] [Classification: Attempted Information Leak] [Priority: 2] {TCP} 10.0.0.1:443 -> 10.0.0.2:80";
        let event = build_fast_log_event(line).unwrap();
        assert_eq!(event.severity, 70);
        assert_eq!(event.category, "ids");
        assert_eq!(event.source_ip.as_deref(), Some("10.0.0.1"));
        assert_eq!(event.source_port, Some(443));
        assert_eq!(event.destination_ip.as_deref(), Some("10.0.0.2"));
        assert_eq!(event.destination_port, Some(80));
        assert_eq!(event.network_protocol.as_deref(), Some("tcp"));
        assert_eq!(event.action.as_deref(), Some("ET SCAN Suspicious"));
    }

    #[test]
    fn sniff_detects_fast_log_lines() {
        let parser = SuricataParser;
        let sample = b"01/15/2024-10:30:00.123456  [**] [1:2010935:2] ET SCAN Suspicious [**] [Classification: Attempted Information Leak] [Priority: 2] {TCP} 10.0.0.1:443 -> 10.0.0.2:80\n";
        assert!(parser.sniff(sample));
    }
}
