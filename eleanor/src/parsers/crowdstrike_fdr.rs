//! CrowdStrike Falcon Data Replicator parser. FDR ships newline-delimited
//! JSON, one event object per line, discriminated by `event_simpleName`
//! (or `name`), grounded field-for-field on
//! `original_source/backend/app/parsers/formats/crowdstrike_fdr.py`.

use async_stream::try_stream;
use async_trait::async_trait;
use once_cell::sync::Lazy;
use serde_json::Value;
use std::collections::HashMap;

use crate::core::{NormalizedEvent, RawEvent};
use crate::err::EleanorError;

use super::{EventStream, Parser, ParserCategory};

#[derive(Default)]
pub struct CrowdstrikeFdrParser;

/// `event_simpleName` to ECS category, per `FDR_EVENT_CATEGORY_MAP`.
static FDR_EVENT_CATEGORY_MAP: Lazy<HashMap<&'static str, &'static str>> = Lazy::new(|| {
    HashMap::from([
        ("ProcessRollup2", "process"),
        ("SyntheticProcessRollup2", "process"),
        ("ProcessBlocked", "intrusion_detection"),
        ("ProcessInjection", "intrusion_detection"),
        ("DirectoryCreate", "file"),
        ("DirectoryDelete", "file"),
        ("FileWritten", "file"),
        ("FileDeleted", "file"),
        ("FileRename", "file"),
        ("FileOpenInfo", "file"),
        ("RansomwareFileAccess", "intrusion_detection"),
        ("NetworkConnectIP4", "network"),
        ("NetworkConnectIP6", "network"),
        ("NetworkReceiveAcceptIP4", "network"),
        ("NetworkReceiveAcceptIP6", "network"),
        ("DnsRequest", "network"),
        ("HttpRequest", "web"),
        ("RegKeyValueSet", "registry"),
        ("RegKeyCreated", "registry"),
        ("RegKeyDeleted", "registry"),
        ("RegValueDeleted", "registry"),
        ("UserLogon", "authentication"),
        ("UserLogonFailed", "authentication"),
        ("UserLogoff", "authentication"),
        ("ScriptControlScan", "process"),
        ("AmsiScriptContent", "process"),
        ("ModuleLoad", "process"),
        ("ImageLoad", "process"),
        ("DetectionSummaryEvent", "intrusion_detection"),
        ("IncidentSummaryEvent", "intrusion_detection"),
        ("IdpDetectionSummaryEvent", "intrusion_detection"),
        ("ScheduledTaskRegistered", "configuration"),
        ("ScheduledTaskModified", "configuration"),
        ("ScheduledTaskDeleted", "configuration"),
        ("ServiceStarted", "process"),
        ("ServiceStopped", "process"),
        ("DriverLoad", "driver"),
        ("AsepValueUpdate", "configuration"),
        ("CriticalFileAccess", "file"),
    ])
});

fn category_for_event(event_name: &str) -> String {
    FDR_EVENT_CATEGORY_MAP.get(event_name).copied().unwrap_or("host").to_string()
}

/// `Severity` (1-5) maps to 20/40/60/80/80; otherwise fall back to an
/// event-type heuristic, per `_calculate_severity`.
fn calculate_severity(value: &Value, event_name: &str) -> u8 {
    if let Some(severity) = value.get("Severity").and_then(Value::as_i64) {
        return match severity {
            s if s >= 4 => 80,
            3 => 60,
            2 => 40,
            _ => 20,
        };
    }
    match event_name {
        "DetectionSummaryEvent" | "IncidentSummaryEvent" => 80,
        "ProcessBlocked" | "ProcessInjection" | "RansomwareFileAccess" => 70,
        "UserLogonFailed" => 40,
        "ProcessRollup2" | "SyntheticProcessRollup2" => 20,
        _ => 20,
    }
}

/// `timestamp|ContextTimeStamp|ProcessStartTime|UtcTime`, accepting unix
/// seconds, unix milliseconds, or ISO-8601.
fn parse_timestamp(value: &Value) -> chrono::DateTime<chrono::Utc> {
    for field in ["timestamp", "ContextTimeStamp", "ProcessStartTime", "UtcTime"] {
        let Some(raw) = value.get(field) else { continue };
        if let Some(n) = raw.as_f64() {
            let millis = if n > 1e12 { n } else { n * 1000.0 };
            if let Some(dt) = chrono::DateTime::from_timestamp_millis(millis as i64) {
                return dt;
            }
        }
        if let Some(s) = raw.as_str() {
            if let Ok(n) = s.parse::<f64>() {
                let millis = if n > 1e12 { n } else { n * 1000.0 };
                if let Some(dt) = chrono::DateTime::from_timestamp_millis(millis as i64) {
                    return dt;
                }
            }
            let normalized = s.replace('Z', "+00:00");
            if let Ok(dt) = chrono::DateTime::parse_from_rfc3339(&normalized) {
                return dt.with_timezone(&chrono::Utc);
            }
        }
    }
    chrono::Utc::now()
}

fn generate_message(value: &Value, event_name: &str) -> String {
    let computer = value.get("ComputerName").and_then(Value::as_str).unwrap_or("Unknown");
    let user = value.get("UserName").and_then(Value::as_str).unwrap_or("");
    match event_name {
        "ProcessRollup2" | "SyntheticProcessRollup2" => {
            let image = value.get("ImageFileName").and_then(Value::as_str).unwrap_or("Unknown");
            let cmd = value.get("CommandLine").and_then(Value::as_str).unwrap_or("");
            let cmd: String = cmd.chars().take(100).collect();
            format!("CrowdStrike: Process on {computer} - {image} {cmd}")
        }
        "NetworkConnectIP4" | "NetworkConnectIP6" => {
            let remote_ip = value
                .get("RemoteAddressIP4")
                .or_else(|| value.get("RemoteAddressIP6"))
                .and_then(Value::as_str)
                .unwrap_or("");
            let remote_port = value.get("RemotePort").and_then(Value::as_u64).unwrap_or(0);
            format!("CrowdStrike: Network connection from {computer} to {remote_ip}:{remote_port}")
        }
        "DnsRequest" => {
            let domain = value.get("DomainName").and_then(Value::as_str).unwrap_or("Unknown");
            format!("CrowdStrike: DNS query from {computer} for {domain}")
        }
        "UserLogon" | "UserLogonFailed" => {
            let result = if event_name == "UserLogon" { "Successful" } else { "Failed" };
            format!("CrowdStrike: {result} logon on {computer} by {user}")
        }
        _ if event_name.starts_with("File") => {
            let file_name = value.get("TargetFileName").and_then(Value::as_str).unwrap_or("Unknown");
            format!("CrowdStrike: {event_name} on {computer} - {file_name}")
        }
        _ if event_name.starts_with("Reg") => {
            let reg_key = value.get("RegObjectName").and_then(Value::as_str).unwrap_or("Unknown");
            format!("CrowdStrike: {event_name} on {computer} - {reg_key}")
        }
        "DetectionSummaryEvent" => {
            let detect_name = value.get("DetectName").and_then(Value::as_str).unwrap_or("Unknown");
            let severity = value.get("SeverityName").and_then(Value::as_str).unwrap_or("");
            format!("CrowdStrike: Detection on {computer} - {detect_name} ({severity})")
        }
        _ => format!("CrowdStrike: {event_name} on {computer}"),
    }
}

fn str_field(value: &Value, key: &str) -> Option<String> {
    value.get(key).and_then(Value::as_str).map(str::to_string)
}

fn set_label_if_present(event: &mut NormalizedEvent, value: &Value, key: &str, label: &str) {
    if let Some(s) = str_field(value, key) {
        event.set_label(label, s);
    } else if let Some(n) = value.get(key).and_then(Value::as_i64) {
        event.set_label(label, n.to_string());
    }
}

fn parse_process_fields(value: &Value, event: &mut NormalizedEvent) {
    if let Some(image) = str_field(value, "ImageFileName") {
        event.process_name = Some(image.rsplit(['/', '\\']).next().unwrap_or(&image).to_string());
        event.process_executable = Some(image);
    }
    if let Some(name) = str_field(value, "FileName") {
        event.process_name = Some(name);
    }
    if let Some(pid) = value.get("TargetProcessId").or_else(|| value.get("ContextProcessId")).and_then(Value::as_u64) {
        event.process_pid = Some(pid as u32);
    }
    if let Some(ppid) = value.get("ParentProcessId").and_then(Value::as_u64) {
        event.process_ppid = Some(ppid as u32);
    }
    if let Some(cmd) = str_field(value, "CommandLine") {
        event.process_command_line = Some(cmd);
    }
    set_label_if_present(event, value, "SHA256HashData", "process_sha256");
    set_label_if_present(event, value, "MD5HashData", "process_md5");
    set_label_if_present(event, value, "ParentProcessId", "parent_pid");
    set_label_if_present(event, value, "ParentImageFileName", "parent_executable");
    set_label_if_present(event, value, "ParentCommandLine", "parent_command_line");
    set_label_if_present(event, value, "GrandparentImageFileName", "grandparent_executable");
    set_label_if_present(event, value, "GrandparentCommandLine", "grandparent_command_line");
}

fn protocol_name(proto: i64) -> String {
    match proto {
        6 => "tcp".to_string(),
        17 => "udp".to_string(),
        1 => "icmp".to_string(),
        other => other.to_string(),
    }
}

fn parse_network_fields(value: &Value, event: &mut NormalizedEvent) {
    event.source_ip = str_field(value, "LocalAddressIP4").or_else(|| str_field(value, "LocalAddressIP6"));
    if let Some(port) = value.get("LocalPort").and_then(Value::as_u64) {
        event.source_port = Some(port as u16);
    }
    event.destination_ip = str_field(value, "RemoteAddressIP4").or_else(|| str_field(value, "RemoteAddressIP6"));
    if let Some(port) = value.get("RemotePort").and_then(Value::as_u64) {
        event.destination_port = Some(port as u16);
    }
    if let Some(proto) = value.get("Protocol").and_then(Value::as_i64) {
        event.network_protocol = Some(protocol_name(proto));
    }
    set_label_if_present(event, value, "DomainName", "dns_query");
    set_label_if_present(event, value, "QueryType", "dns_query_type");
    set_label_if_present(event, value, "RespondingDnsServer", "dns_server");
    set_label_if_present(event, value, "HttpHost", "http_host");
    set_label_if_present(event, value, "HttpMethod", "http_method");
    if let Some(path) = str_field(value, "HttpPath") {
        event.request = Some(path);
    }
}

fn parse_file_fields(value: &Value, event: &mut NormalizedEvent) {
    if let Some(path) = str_field(value, "TargetFileName") {
        event.file_name = Some(path.rsplit(['/', '\\']).next().unwrap_or(&path).to_string());
        event.file_path = Some(path);
    }
    set_label_if_present(event, value, "TargetDirectoryName", "target_directory");
    set_label_if_present(event, value, "SourceFileName", "source_file");
    if let Some(sha256) = str_field(value, "TargetFileSHA256") {
        event.file_hash_sha256 = Some(sha256);
    }
    set_label_if_present(event, value, "TargetFileMD5", "file_md5");
}

fn registry_value_type_name(code: i64) -> String {
    match code {
        1 => "REG_SZ".to_string(),
        2 => "REG_EXPAND_SZ".to_string(),
        3 => "REG_BINARY".to_string(),
        4 => "REG_DWORD".to_string(),
        7 => "REG_MULTI_SZ".to_string(),
        11 => "REG_QWORD".to_string(),
        other => other.to_string(),
    }
}

fn parse_registry_fields(value: &Value, event: &mut NormalizedEvent) {
    set_label_if_present(event, value, "RegObjectName", "registry_key");
    set_label_if_present(event, value, "RegValueName", "registry_value_name");
    if let Some(data) = str_field(value, "RegStringValue") {
        let truncated: String = data.chars().take(500).collect();
        event.set_label("registry_value_data", truncated);
    }
    if let Some(reg_type) = value.get("RegType").and_then(Value::as_i64) {
        event.set_label("registry_value_type", registry_value_type_name(reg_type));
    }
}

fn parse_detection_fields(value: &Value, event: &mut NormalizedEvent) {
    set_label_if_present(event, value, "Severity", "detection_severity");
    set_label_if_present(event, value, "SeverityName", "detection_severity_name");
    set_label_if_present(event, value, "Technique", "mitre_technique");
    set_label_if_present(event, value, "Tactic", "mitre_tactic");
    set_label_if_present(event, value, "PatternDispositionValue", "disposition");
    set_label_if_present(event, value, "DetectName", "detection_name");
    if let Some(desc) = str_field(value, "DetectDescription") {
        let truncated: String = desc.chars().take(500).collect();
        event.set_label("detection_description", truncated);
    }
    set_label_if_present(event, value, "IOC", "ioc");
    set_label_if_present(event, value, "IOCType", "ioc_type");
}

fn build_event(value: &Value) -> crate::err::Result<NormalizedEvent> {
    let event_name = value
        .get("event_simpleName")
        .and_then(Value::as_str)
        .or_else(|| value.get("name").and_then(Value::as_str))
        .ok_or_else(|| EleanorError::malformed_record("crowdstrike_fdr", 0, "missing event_simpleName"))?
        .to_string();

    let timestamp = parse_timestamp(value);
    let message = generate_message(value, &event_name);

    let mut event = NormalizedEvent::new("crowdstrike_fdr", timestamp, value.clone());
    event.category = category_for_event(&event_name);
    event.severity = calculate_severity(value, &event_name);
    event.message = Some(message);
    event.action = Some(event_name.clone());

    event.source_host = str_field(value, "ComputerName");
    event.source_user = str_field(value, "UserName");
    event.source_user_id = str_field(value, "UserSid");

    parse_process_fields(value, &mut event);
    parse_network_fields(value, &mut event);
    parse_file_fields(value, &mut event);
    parse_registry_fields(value, &mut event);
    parse_detection_fields(value, &mut event);

    event.set_label("cid", value.get("cid").and_then(Value::as_str).unwrap_or_default());
    event.set_label("aid", value.get("aid").and_then(Value::as_str).unwrap_or_default());
    set_label_if_present(&mut event, value, "event_platform", "platform");
    set_label_if_present(&mut event, value, "ConfigBuild", "sensor_version");

    Ok(event)
}

#[async_trait]
impl Parser for CrowdstrikeFdrParser {
    fn category(&self) -> ParserCategory {
        ParserCategory::CrowdstrikeFdr
    }

    fn sniff(&self, sample: &[u8]) -> bool {
        std::str::from_utf8(sample)
            .ok()
            .map(|s| {
                let has_name = s.contains("\"event_simpleName\"") || s.contains("\"name\"");
                let has_fdr_field = ["\"aid\"", "\"cid\"", "\"ComputerName\"", "\"ContextProcessId\"", "\"ParentProcessId\""]
                    .iter()
                    .any(|f| s.contains(f));
                has_name && has_fdr_field
            })
            .unwrap_or(false)
    }

    fn extensions(&self) -> &'static [&'static str] {
        &["fdr", "ndjson"]
    }

    fn parse(&self, raw: RawEvent) -> EventStream {
        Box::pin(try_stream! {
            let text = raw.as_str().map_err(|e| EleanorError::malformed_source(raw.source.clone(), e))?;
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
                        Err(e) => tracing::warn!(source = %raw.source, line = idx as u64, error = %e, "skipping malformed FDR record"),
                    },
                    Err(e) => tracing::warn!(source = %raw.source, line = idx as u64, error = %e, "skipping invalid JSON line"),
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
    fn builds_event_from_process_rollup() {
        let value = json!({
            "event_simpleName": "ProcessRollup2",
            "timestamp": "1700000000000",
            "aid": "abc123",
            "ComputerName": "HOST1",
            "UserName": "alice",
            "ImageFileName": "C:\\Windows\\System32\\cmd.exe",
            "TargetProcessId": 4242,
            "ParentProcessId": 10,
            "CommandLine": "cmd.exe /c whoami",
        });
        let event = build_event(&value).unwrap();
        assert_eq!(event.source_host.as_deref(), Some("HOST1"));
        assert_eq!(event.process_name.as_deref(), Some("cmd.exe"));
        assert_eq!(event.process_executable.as_deref(), Some("C:\\Windows\\System32\\cmd.exe"));
        assert_eq!(event.process_pid, Some(4242));
        assert_eq!(event.process_ppid, Some(10));
        assert_eq!(event.process_command_line.as_deref(), Some("cmd.exe /c whoami"));
        assert_eq!(event.category, "process");
        assert_eq!(event.severity, 20);
    }

    #[test]
    fn computes_severity_from_explicit_level() {
        let value = json!({
            "event_simpleName": "DetectionSummaryEvent",
            "timestamp": "1700000000000",
            "Severity": 4,
            "ComputerName": "HOST1",
        });
        let event = build_event(&value).unwrap();
        assert_eq!(event.severity, 80);
        assert_eq!(event.category, "intrusion_detection");
    }

    #[test]
    fn maps_network_fields_and_protocol() {
        let value = json!({
            "event_simpleName": "NetworkConnectIP4",
            "timestamp": "1700000000000",
            "ComputerName": "HOST1",
            "LocalAddressIP4": "10.0.0.5",
            "RemoteAddressIP4": "8.8.8.8",
            "RemotePort": 443,
            "Protocol": 6,
        });
        let event = build_event(&value).unwrap();
        assert_eq!(event.source_ip.as_deref(), Some("10.0.0.5"));
        assert_eq!(event.destination_ip.as_deref(), Some("8.8.8.8"));
        assert_eq!(event.destination_port, Some(443));
        assert_eq!(event.network_protocol.as_deref(), Some("tcp"));
    }

    #[test]
    fn parses_seconds_resolution_timestamp() {
        let value = json!({
            "event_simpleName": "UserLogon",
            "timestamp": 1700000000,
            "ComputerName": "HOST1",
            "UserName": "alice",
        });
        let event = build_event(&value).unwrap();
        assert_eq!(event.timestamp.timestamp(), 1700000000);
        assert_eq!(event.category, "authentication");
    }
}
