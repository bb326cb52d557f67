//! ArcSight Common Event Format parser, grounded field-for-field on
//! `original_source/backend/app/parsers/formats/cef.py`.
//!
//! Header: `CEF:Version|Device Vendor|Device Product|Device Version|
//! Signature ID|Name|Severity|Extension`. Header fields escape `\|` and
//! `\\`; extension values escape `\=`, `\n`, `\r`, `\\`.

use async_stream::try_stream;
use async_trait::async_trait;
use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::json;

use crate::core::NormalizedEvent;
use crate::core::RawEvent;
use crate::err::EleanorError;

use super::{EventStream, Parser, ParserCategory};

static CEF_HEADER_PATTERN: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^CEF:(\d+)\|([^|]*(?:\\.[^|]*)*)\|([^|]*(?:\\.[^|]*)*)\|([^|]*(?:\\.[^|]*)*)\|([^|]*(?:\\.[^|]*)*)\|([^|]*(?:\\.[^|]*)*)\|([^|]*(?:\\.[^|]*)*)\|(.*)$").unwrap()
});

static CEF_EXTENSION_PATTERN: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(\w+)=((?:[^\\=]|\\.)*?)(?=\s+\w+=|$)").unwrap()
});

static SYSLOG_PREFIX: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^(\w{3}\s+\d{1,2}\s+\d{2}:\d{2}:\d{2})\s+\S+\s+").unwrap()
});

#[derive(Default)]
pub struct CefParser;

fn unescape_header(s: &str) -> String {
    s.replace("\\|", "|").replace("\\\\", "\\")
}

fn unescape_extension_value(s: &str) -> String {
    s.replace("\\=", "=")
        .replace("\\n", "\n")
        .replace("\\r", "\r")
        .replace("\\\\", "\\")
}

/// Maps a CEF numeric/string severity onto the unified 0-100 scale, per
/// the exact table in `cef.py::_map_severity`.
fn map_severity(raw: &str) -> u8 {
    let normalized = raw.trim().to_lowercase();
    let mapped = match normalized.as_str() {
        "0" | "unknown" => Some(0),
        "1" | "low" => Some(10),
        "2" => Some(20),
        "3" | "medium" => Some(30),
        "4" => Some(40),
        "5" => Some(50),
        "6" | "high" => Some(60),
        "7" => Some(70),
        "8" => Some(80),
        "very-high" => Some(80),
        "9" => Some(90),
        "10" | "critical" => Some(100),
        _ => None,
    };
    if let Some(v) = mapped {
        return v;
    }
    normalized
        .parse::<i64>()
        .map(|n| (n * 10).clamp(0, 100) as u8)
        .unwrap_or(0)
}

fn categorize(name: &str, extensions: &std::collections::HashMap<String, String>) -> String {
    let haystack = format!(
        "{} {}",
        name.to_lowercase(),
        extensions.get("cat").cloned().unwrap_or_default().to_lowercase()
    );
    if haystack.contains("firewall") || haystack.contains("deny") || haystack.contains("block") {
        "firewall".to_string()
    } else if haystack.contains("ids") || haystack.contains("intrusion") || haystack.contains("exploit") {
        "ids".to_string()
    } else if haystack.contains("auth") || haystack.contains("login") || haystack.contains("logon") {
        "authentication".to_string()
    } else if haystack.contains("file") {
        "file".to_string()
    } else if haystack.contains("malware") || haystack.contains("virus") || haystack.contains("trojan") {
        "malware".to_string()
    } else if haystack.contains("web") || haystack.contains("http") {
        "web".to_string()
    } else {
        "process".to_string()
    }
}

fn parse_extensions(raw_extension: &str) -> std::collections::HashMap<String, String> {
    let mut map = std::collections::HashMap::new();
    for caps in CEF_EXTENSION_PATTERN.captures_iter(raw_extension) {
        let key = caps[1].to_string();
        let value = unescape_extension_value(caps[2].trim());
        map.insert(key, value);
    }
    map
}

fn extract_timestamp(ext: &std::collections::HashMap<String, String>, line: &str) -> chrono::DateTime<chrono::Utc> {
    for key in ["rt", "deviceReceiptTime", "start", "end"] {
        if let Some(v) = ext.get(key) {
            if let Ok(millis) = v.parse::<i64>() {
                if let Some(dt) = chrono::DateTime::from_timestamp_millis(millis) {
                    return dt;
                }
            }
            if let Ok(dt) = chrono::DateTime::parse_from_rfc3339(v) {
                return dt.with_timezone(&chrono::Utc);
            }
        }
    }
    if let Some(caps) = SYSLOG_PREFIX.captures(line) {
        let current_year = chrono::Utc::now().format("%Y").to_string();
        let with_year = format!("{} {}", current_year, &caps[1]);
        if let Ok(naive) = chrono::NaiveDateTime::parse_from_str(&with_year, "%Y %b %e %H:%M:%S") {
            return chrono::DateTime::from_naive_utc_and_offset(naive, chrono::Utc);
        }
    }
    chrono::Utc::now()
}

macro_rules! map_ext {
    ($event:expr, $ext:expr, $key:expr => $field:ident) => {
        if let Some(v) = $ext.get($key) {
            $event.$field = Some(v.clone());
        }
    };
    ($event:expr, $ext:expr, $key:expr => $field:ident as $t:ty) => {
        if let Some(v) = $ext.get($key) {
            if let Ok(parsed) = v.parse::<$t>() {
                $event.$field = Some(parsed);
            }
        }
    };
}

fn build_event(line: &str) -> crate::err::Result<NormalizedEvent> {
    let caps = CEF_HEADER_PATTERN
        .captures(line)
        .ok_or_else(|| EleanorError::malformed_record("cef", 0, "line does not match CEF header pattern"))?;

    let device_vendor = unescape_header(&caps[2]);
    let _device_product = unescape_header(&caps[3]);
    let _device_version = unescape_header(&caps[4]);
    let _signature_id = unescape_header(&caps[5]);
    let name = unescape_header(&caps[6]);
    let severity_raw = unescape_header(&caps[7]);
    let extension_raw = &caps[8];

    let ext = parse_extensions(extension_raw);
    let timestamp = extract_timestamp(&ext, line);

    let mut event = NormalizedEvent::new("cef", timestamp, json!({ "raw_line": line, "extensions": ext }));
    event.severity = map_severity(&severity_raw);
    event.category = categorize(&name, &ext);
    event.message = Some(name);
    event.set_label("device_vendor", device_vendor);

    map_ext!(event, ext, "src" => source_ip);
    map_ext!(event, ext, "spt" => source_port as u16);
    map_ext!(event, ext, "smac" => source_mac);
    map_ext!(event, ext, "shost" => source_host);
    map_ext!(event, ext, "shost" => host_name);
    map_ext!(event, ext, "suser" => user_name);
    map_ext!(event, ext, "suid" => source_user_id);
    map_ext!(event, ext, "sntdom" => source_domain);
    map_ext!(event, ext, "sntdom" => user_domain);

    map_ext!(event, ext, "dst" => destination_ip);
    map_ext!(event, ext, "dpt" => destination_port as u16);
    map_ext!(event, ext, "dmac" => destination_mac);
    map_ext!(event, ext, "dhost" => destination_host);
    map_ext!(event, ext, "duser" => destination_user);
    map_ext!(event, ext, "duid" => destination_user_id);
    map_ext!(event, ext, "dntdom" => destination_domain);

    map_ext!(event, ext, "proto" => network_protocol);
    map_ext!(event, ext, "in" => bytes_in as u64);
    map_ext!(event, ext, "bytesIn" => bytes_in as u64);
    map_ext!(event, ext, "out" => bytes_out as u64);
    map_ext!(event, ext, "bytesOut" => bytes_out as u64);

    map_ext!(event, ext, "sproc" => process_name);
    map_ext!(event, ext, "dproc" => destination_process_name);
    map_ext!(event, ext, "fname" => file_name);
    map_ext!(event, ext, "filePath" => file_path);
    map_ext!(event, ext, "fsize" => file_size as u64);
    map_ext!(event, ext, "fileHash" => file_hash);
    if let Some(hash) = ext.get("fileHash") {
        match hash.len() {
            32 => event.file_hash_md5 = Some(hash.clone()),
            40 => event.file_hash_sha1 = Some(hash.clone()),
            64 => event.file_hash_sha256 = Some(hash.clone()),
            _ => {}
        }
    }

    map_ext!(event, ext, "dvc" => device_host);
    map_ext!(event, ext, "dvchost" => device_host);
    map_ext!(event, ext, "dvcmac" => device_mac);
    map_ext!(event, ext, "dvcpid" => device_process_id as u32);

    map_ext!(event, ext, "request" => request);
    map_ext!(event, ext, "request" => url_full);
    map_ext!(event, ext, "requestMethod" => request_method);
    map_ext!(event, ext, "requestContext" => request_context);

    map_ext!(event, ext, "act" => action);
    map_ext!(event, ext, "outcome" => outcome);

    // `msg`, when present, overrides the CEF Name as the event message,
    // per `cef.py::_map_to_ecs`'s "Message override" step.
    if let Some(msg) = ext.get("msg") {
        if !msg.trim().is_empty() {
            event.message = Some(msg.clone());
        }
    }

    for (key, value) in ext.iter() {
        if matches!(
            key.as_str(),
            "src" | "spt" | "smac" | "shost" | "suser" | "suid" | "sntdom" | "dst" | "dpt" | "dmac" | "dhost"
                | "duser" | "duid" | "dntdom" | "proto" | "in" | "bytesIn" | "out" | "bytesOut" | "sproc" | "dproc"
                | "fname" | "filePath" | "fsize" | "fileHash" | "dvc" | "dvchost" | "dvcmac" | "dvcpid" | "request"
                | "requestMethod" | "requestContext" | "act" | "outcome" | "rt" | "start" | "end"
                | "deviceReceiptTime" | "cat" | "msg"
        ) {
            continue;
        }
        event.set_label(key.clone(), value.clone());
    }

    Ok(event)
}

#[async_trait]
impl Parser for CefParser {
    fn category(&self) -> ParserCategory {
        ParserCategory::Cef
    }

    fn sniff(&self, sample: &[u8]) -> bool {
        sample.windows(4).any(|w| w == b"CEF:")
    }

    fn extensions(&self) -> &'static [&'static str] {
        &["cef", "log"]
    }

    fn parse(&self, raw: RawEvent) -> EventStream {
        Box::pin(try_stream! {
            let text = raw.as_str().map_err(|e| EleanorError::malformed_source(raw.source.clone(), e))?;
            for (idx, line) in text.lines().enumerate() {
                let line = line.trim();
                if line.is_empty() {
                    continue;
                }
                let cef_start = match line.find("CEF:") {
                    Some(pos) => pos,
                    None => continue,
                };
                match build_event(&line[cef_start..]) {
                    Ok(mut event) => {
                        event.data_source = raw.data_source.clone();
                        yield event;
                    }
                    Err(e) => {
                        tracing::warn!(source = %raw.source, line = idx as u64, error = %e, "skipping malformed CEF record");
                    }
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn maps_known_severities() {
        assert_eq!(map_severity("critical"), 100);
        assert_eq!(map_severity("Low"), 10);
        assert_eq!(map_severity("unknown"), 0);
        assert_eq!(map_severity("very-high"), 80);
    }

    #[test]
    fn falls_back_to_numeric_clamp() {
        assert_eq!(map_severity("15"), 100);
        assert_eq!(map_severity("-3"), 0);
    }

    #[test]
    fn parses_minimal_cef_line() {
        let line = "CEF:0|Security|threatmanager|1.0|100|worm successfully stopped|10|src=10.0.0.1 dst=2.1.2.2 spt=1232";
        let event = build_event(line).unwrap();
        assert_eq!(event.source_ip.as_deref(), Some("10.0.0.1"));
        assert_eq!(event.destination_ip.as_deref(), Some("2.1.2.2"));
        assert_eq!(event.source_port, Some(1232));
        assert_eq!(event.severity, 100);
        assert_eq!(event.labels.get("device_vendor").map(String::as_str), Some("Security"));
    }

    #[test]
    fn maps_suser_to_user_name_and_msg_overrides_message() {
        let line = "CEF:0|Vendor|Product|1.0|100|User logon|3|src=10.1.1.1 spt=443 suser=alice msg=Login successful";
        let event = build_event(line).unwrap();
        assert_eq!(event.user_name.as_deref(), Some("alice"));
        assert_eq!(event.severity, 30);
        assert_eq!(event.message.as_deref(), Some("Login successful"));
    }

    #[test]
    fn unescapes_header_pipes() {
        let line = r"CEF:0|Vendor\|With Pipe|Product|1.0|100|Name|5|src=1.2.3.4";
        let event = build_event(line).unwrap();
        assert_eq!(event.labels.get("device_vendor").map(String::as_str), Some("Vendor|With Pipe"));
    }

    #[test]
    fn sniffs_hash_algorithm_by_length() {
        let sha256 = "a".repeat(64);
        let line = format!("CEF:0|Vendor|Product|1.0|100|Name|5|fileHash={sha256}");
        let event = build_event(&line).unwrap();
        assert_eq!(event.file_hash_sha256.as_deref(), Some(sha256.as_str()));
        assert_eq!(event.file_hash_md5, None);

        let md5 = "b".repeat(32);
        let line = format!("CEF:0|Vendor|Product|1.0|100|Name|5|fileHash={md5}");
        let event = build_event(&line).unwrap();
        assert_eq!(event.file_hash_md5.as_deref(), Some(md5.as_str()));
    }

    #[test]
    fn categorizes_by_keyword() {
        let mut ext = std::collections::HashMap::new();
        ext.insert("cat".to_string(), "Intrusion.Detection".to_string());
        assert_eq!(categorize("some event", &ext), "ids");
        assert_eq!(categorize("Firewall deny", &std::collections::HashMap::new()), "firewall");
        assert_eq!(categorize("plain", &std::collections::HashMap::new()), "process");
    }
}
