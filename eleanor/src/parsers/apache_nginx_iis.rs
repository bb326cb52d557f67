//! Web server access-log parser covering Apache/Nginx combined log format
//! and IIS W3C extended log format. Both are line-oriented text formats;
//! which one a line matches decides the column layout.

use async_stream::try_stream;
use async_trait::async_trait;
use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::json;

use crate::core::{NormalizedEvent, RawEvent};
use crate::err::EleanorError;

use super::{EventStream, Parser, ParserCategory};

#[derive(Default)]
pub struct WebServerParser;

static COMBINED_LOG_PATTERN: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r#"^(?P<ip>\S+) \S+ (?P<user>\S+) \[(?P<time>[^\]]+)\] "(?P<method>\S+) (?P<path>\S+) (?P<proto>[^"]+)" (?P<status>\d+) (?P<size>\S+)(?: "(?P<referer>[^"]*)" "(?P<agent>[^"]*)")?"#,
    )
    .unwrap()
});

fn parse_apache_time(s: &str) -> Option<chrono::DateTime<chrono::Utc>> {
    chrono::DateTime::parse_from_str(s, "%d/%b/%Y:%H:%M:%S %z")
        .ok()
        .map(|dt| dt.with_timezone(&chrono::Utc))
}

fn build_event_from_combined(line: &str) -> crate::err::Result<NormalizedEvent> {
    let caps = COMBINED_LOG_PATTERN
        .captures(line)
        .ok_or_else(|| EleanorError::malformed_record("web_server", 0, "line does not match combined log format"))?;

    let timestamp = parse_apache_time(&caps["time"]).unwrap_or_else(chrono::Utc::now);
    let status: u16 = caps["status"].parse().unwrap_or(0);

    let mut event = NormalizedEvent::new("web_server", timestamp, json!({ "raw_line": line }));
    event.category = "web".to_string();
    event.severity = if status >= 500 {
        60
    } else if status >= 400 {
        30
    } else {
        0
    };
    event.source_ip = Some(caps["ip"].to_string());
    if &caps["user"] != "-" {
        event.source_user = Some(caps["user"].to_string());
    }
    event.request_method = Some(caps["method"].to_string());
    event.request = Some(caps["path"].to_string());
    event.network_protocol = Some(caps["proto"].to_string());
    event.outcome = Some(status.to_string());
    event.bytes_out = caps.name("size").and_then(|m| m.as_str().parse::<u64>().ok());
    if let Some(agent) = caps.name("agent") {
        event.set_label("user_agent", agent.as_str());
    }
    if let Some(referer) = caps.name("referer") {
        event.set_label("referer", referer.as_str());
    }
    Ok(event)
}

/// IIS W3C extended log: a `#Fields:` header line names space-separated
/// columns, data rows follow the same order.
fn build_event_from_iis(fields: &[String], line: &str) -> crate::err::Result<NormalizedEvent> {
    let cells: Vec<&str> = line.split_whitespace().collect();
    if cells.len() != fields.len() {
        return Err(EleanorError::malformed_record(
            "web_server",
            0,
            format!("iis row has {} columns, header declared {}", cells.len(), fields.len()),
        ));
    }

    let mut row = serde_json::Map::new();
    for (field, cell) in fields.iter().zip(cells.iter()) {
        row.insert(field.clone(), json!(cell));
    }

    let date = row.get("date").and_then(|v| v.as_str()).unwrap_or("");
    let time = row.get("time").and_then(|v| v.as_str()).unwrap_or("");
    let timestamp = chrono::NaiveDateTime::parse_from_str(&format!("{date} {time}"), "%Y-%m-%d %H:%M:%S")
        .map(|naive| chrono::DateTime::from_naive_utc_and_offset(naive, chrono::Utc))
        .unwrap_or_else(|_| chrono::Utc::now());

    let status = row
        .get("sc-status")
        .and_then(|v| v.as_str())
        .and_then(|s| s.parse::<u16>().ok())
        .unwrap_or(0);

    let mut event = NormalizedEvent::new("web_server", timestamp, serde_json::Value::Object(row.clone()));
    event.category = "web".to_string();
    event.severity = if status >= 500 {
        60
    } else if status >= 400 {
        30
    } else {
        0
    };
    event.source_ip = row.get("c-ip").and_then(|v| v.as_str()).map(str::to_string);
    event.destination_ip = row.get("s-ip").and_then(|v| v.as_str()).map(str::to_string);
    event.request_method = row.get("cs-method").and_then(|v| v.as_str()).map(str::to_string);
    event.request = row.get("cs-uri-stem").and_then(|v| v.as_str()).map(str::to_string);
    event.outcome = Some(status.to_string());
    Ok(event)
}

#[async_trait]
impl Parser for WebServerParser {
    fn category(&self) -> ParserCategory {
        ParserCategory::WebServer
    }

    fn sniff(&self, sample: &[u8]) -> bool {
        std::str::from_utf8(sample)
            .ok()
            .map(|s| s.starts_with("#Software: Microsoft Internet Information Services") || COMBINED_LOG_PATTERN.is_match(s.lines().next().unwrap_or("")))
            .unwrap_or(false)
    }

    fn extensions(&self) -> &'static [&'static str] {
        &["log", "access"]
    }

    fn parse(&self, raw: RawEvent) -> EventStream {
        Box::pin(try_stream! {
            let text = raw.as_str().map_err(|e| EleanorError::malformed_source(raw.source.clone(), e))?;
            let mut iis_fields: Vec<String> = Vec::new();
            let mut is_iis = false;

            for (idx, line) in text.lines().enumerate() {
                let line = line.trim();
                if line.is_empty() {
                    continue;
                }
                if line.starts_with("#Fields:") {
                    iis_fields = line.trim_start_matches("#Fields:").split_whitespace().map(str::to_string).collect();
                    is_iis = true;
                    continue;
                }
                if line.starts_with('#') {
                    continue;
                }

                let result = if is_iis {
                    build_event_from_iis(&iis_fields, line)
                } else {
                    build_event_from_combined(line)
                };

                match result {
                    Ok(mut event) => {
                        event.data_source = raw.data_source.clone();
                        yield event;
                    }
                    Err(e) => tracing::warn!(source = %raw.source, line = idx as u64, error = %e, "skipping malformed web server record"),
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_combined_log_line() {
        let line = r#"127.0.0.1 - frank [10/Oct/2023:13:55:36 +0000] "GET /apache_pb.gif HTTP/1.0" 200 2326 "-" "Mozilla/5.0""#;
        let event = build_event_from_combined(line).unwrap();
        assert_eq!(event.source_ip.as_deref(), Some("127.0.0.1"));
        assert_eq!(event.source_user.as_deref(), Some("frank"));
        assert_eq!(event.request.as_deref(), Some("/apache_pb.gif"));
        assert_eq!(event.outcome.as_deref(), Some("200"));
    }

    #[test]
    fn flags_5xx_as_higher_severity() {
        let line = r#"127.0.0.1 - - [10/Oct/2023:13:55:36 +0000] "GET / HTTP/1.1" 503 120"#;
        let event = build_event_from_combined(line).unwrap();
        assert_eq!(event.severity, 60);
    }
}
