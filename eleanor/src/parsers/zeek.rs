//! Zeek (Bro) TSV log parser. Zeek logs carry a `#fields` header line naming
//! tab-separated columns, and an epoch-seconds-with-fraction `ts` column.

use async_stream::try_stream;
use async_trait::async_trait;
use serde_json::Value;

use crate::core::{NormalizedEvent, RawEvent};
use crate::err::EleanorError;

use super::{EventStream, Parser, ParserCategory};

#[derive(Default)]
pub struct ZeekParser;

fn parse_fields_header(line: &str) -> Vec<String> {
    line.trim_start_matches("#fields")
        .split('\t')
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .collect()
}

fn build_row(fields: &[String], row: &str) -> crate::err::Result<Value> {
    let cells: Vec<&str> = row.split('\t').collect();
    if cells.len() != fields.len() {
        return Err(EleanorError::malformed_record(
            "zeek",
            0,
            format!("expected {} columns, got {}", fields.len(), cells.len()),
        ));
    }
    let mut map = serde_json::Map::new();
    for (field, cell) in fields.iter().zip(cells.iter()) {
        if *cell == "-" || *cell == "(empty)" {
            map.insert(field.clone(), Value::Null);
        } else {
            map.insert(field.clone(), Value::String(cell.to_string()));
        }
    }
    Ok(Value::Object(map))
}

fn build_event(row: &Value, log_kind: &str) -> NormalizedEvent {
    let timestamp = row
        .get("ts")
        .and_then(Value::as_str)
        .and_then(|s| s.parse::<f64>().ok())
        .and_then(|secs| chrono::DateTime::from_timestamp(secs.trunc() as i64, ((secs.fract()) * 1e9) as u32))
        .unwrap_or_else(chrono::Utc::now);

    let mut event = NormalizedEvent::new("zeek", timestamp, row.clone());
    event.category = "network".to_string();
    event.source_ip = row.get("id.orig_h").and_then(Value::as_str).map(str::to_string);
    event.source_port = row.get("id.orig_p").and_then(Value::as_str).and_then(|s| s.parse().ok());
    event.destination_ip = row.get("id.resp_h").and_then(Value::as_str).map(str::to_string);
    event.destination_port = row.get("id.resp_p").and_then(Value::as_str).and_then(|s| s.parse().ok());
    event.network_protocol = row.get("proto").and_then(Value::as_str).map(str::to_string);

    if log_kind == "conn" {
        event.bytes_in = row.get("resp_bytes").and_then(Value::as_str).and_then(|s| s.parse().ok());
        event.bytes_out = row.get("orig_bytes").and_then(Value::as_str).and_then(|s| s.parse().ok());
    }
    if log_kind == "dns" {
        event.message = row.get("query").and_then(Value::as_str).map(str::to_string);
    }
    if log_kind == "http" {
        event.request = row.get("uri").and_then(Value::as_str).map(str::to_string);
        event.request_method = row.get("method").and_then(Value::as_str).map(str::to_string);
    }

    event.set_label("zeek_log_kind", log_kind);
    event
}

#[async_trait]
impl Parser for ZeekParser {
    fn category(&self) -> ParserCategory {
        ParserCategory::Zeek
    }

    fn sniff(&self, sample: &[u8]) -> bool {
        std::str::from_utf8(sample)
            .ok()
            .map(|s| s.starts_with("#separator") || s.contains("#fields"))
            .unwrap_or(false)
    }

    fn extensions(&self) -> &'static [&'static str] {
        &["log"]
    }

    fn parse(&self, raw: RawEvent) -> EventStream {
        Box::pin(try_stream! {
            let text = raw.as_str().map_err(|e| EleanorError::malformed_source(raw.source.clone(), e))?;
            let mut fields: Vec<String> = Vec::new();
            let log_kind = raw
                .source
                .rsplit('/')
                .next()
                .unwrap_or("unknown")
                .trim_end_matches(".log")
                .to_string();

            for (idx, line) in text.lines().enumerate() {
                if line.starts_with("#fields") {
                    fields = parse_fields_header(line);
                    continue;
                }
                if line.starts_with('#') || line.trim().is_empty() {
                    continue;
                }
                if fields.is_empty() {
                    tracing::warn!(source = %raw.source, "zeek log missing #fields header, skipping body");
                    continue;
                }
                match build_row(&fields, line) {
                    Ok(row) => {
                        let mut event = build_event(&row, &log_kind);
                        event.data_source = raw.data_source.clone();
                        yield event;
                    }
                    Err(e) => tracing::warn!(source = %raw.source, line = idx as u64, error = %e, "skipping malformed zeek row"),
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_fields_header() {
        let fields = parse_fields_header("#fields\tts\tuid\tid.orig_h\tid.orig_p");
        assert_eq!(fields, vec!["ts", "uid", "id.orig_h", "id.orig_p"]);
    }

    #[test]
    fn builds_row_with_nulls() {
        let fields = vec!["ts".to_string(), "uid".to_string()];
        let row = build_row(&fields, "1700000000.123456\t-").unwrap();
        assert_eq!(row.get("uid"), Some(&Value::Null));
    }
}
