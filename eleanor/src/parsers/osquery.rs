//! osquery result-log parser. osquery's `--logger_path` results file emits
//! one JSON object per line, in one of several shapes: differential
//! (`diffResults.added`/`diffResults.removed`), snapshot (`snapshot[]`),
//! a single result row (`columns{}`), or a status/info log line. Grounded
//! field-for-field on
//! `original_source/backend/app/parsers/formats/osquery.py`.

use async_stream::try_stream;
use async_trait::async_trait;
use once_cell::sync::Lazy;
use serde_json::Value;
use std::collections::HashMap;

use crate::core::{NormalizedEvent, RawEvent};
use crate::err::EleanorError;

use super::{EventStream, Parser, ParserCategory};

#[derive(Default)]
pub struct OsqueryParser;

/// Scheduled query name to ECS category, per `OSQUERY_CATEGORY_MAP`.
/// Exact match first, then substring match, then `"default"`.
static OSQUERY_CATEGORY_MAP: Lazy<HashMap<&'static str, &'static str>> = Lazy::new(|| {
    HashMap::from([
        ("processes", "process"),
        ("process_events", "process"),
        ("process_open_sockets", "process"),
        ("process_memory_map", "process"),
        ("listening_ports", "network"),
        ("socket_events", "network"),
        ("arp_cache", "network"),
        ("routes", "network"),
        ("interface_addresses", "network"),
        ("dns_resolvers", "network"),
        ("file", "file"),
        ("file_events", "file"),
        ("hash", "file"),
        ("yara", "file"),
        ("mounts", "file"),
        ("users", "iam"),
        ("groups", "iam"),
        ("logged_in_users", "authentication"),
        ("last", "authentication"),
        ("user_ssh_keys", "authentication"),
        ("authorized_keys", "authentication"),
        ("shadow", "iam"),
        ("system_info", "host"),
        ("os_version", "host"),
        ("kernel_info", "host"),
        ("uptime", "host"),
        ("load_average", "host"),
        ("memory_info", "host"),
        ("certificates", "configuration"),
        ("browser_plugins", "package"),
        ("chrome_extensions", "package"),
        ("firefox_addons", "package"),
        ("scheduled_tasks", "process"),
        ("crontab", "process"),
        ("startup_items", "process"),
        ("launchd", "process"),
        ("services", "process"),
        ("systemd_units", "process"),
        ("registry", "configuration"),
        ("windows_events", "process"),
        ("wmi_cli_event_consumers", "process"),
        ("powershell_events", "process"),
        ("windows_security_products", "package"),
        ("apps", "package"),
        ("safari_extensions", "package"),
        ("keychain_items", "iam"),
        ("deb_packages", "package"),
        ("rpm_packages", "package"),
        ("apt_sources", "configuration"),
        ("yum_sources", "configuration"),
        ("selinux_settings", "configuration"),
        ("iptables", "network"),
    ])
});

fn category_for_query(query_name: &str) -> String {
    if let Some(cat) = OSQUERY_CATEGORY_MAP.get(query_name) {
        return cat.to_string();
    }
    let lower = query_name.to_lowercase();
    for (key, cat) in OSQUERY_CATEGORY_MAP.iter() {
        if lower.contains(key) {
            return cat.to_string();
        }
    }
    "host".to_string()
}

/// `unixTime|time|timestamp` (seconds, or ISO-8601), falling back to
/// `calendarTime`'s `"Mon Jan  2 15:04:05 2006 UTC"` format.
fn parse_timestamp(record: &Value) -> chrono::DateTime<chrono::Utc> {
    for field in ["unixTime", "time", "timestamp"] {
        let Some(raw) = record.get(field) else { continue };
        if let Some(secs) = raw.as_i64() {
            if let Some(dt) = chrono::DateTime::from_timestamp(secs, 0) {
                return dt;
            }
        }
        if let Some(s) = raw.as_str() {
            let normalized = s.replace('Z', "+00:00");
            if let Ok(dt) = chrono::DateTime::parse_from_rfc3339(&normalized) {
                return dt.with_timezone(&chrono::Utc);
            }
        }
    }
    if let Some(calendar_time) = record.get("calendarTime").and_then(Value::as_str) {
        if let Ok(naive) = chrono::NaiveDateTime::parse_from_str(calendar_time, "%a %b %e %H:%M:%S %Y UTC") {
            return chrono::DateTime::from_naive_utc_and_offset(naive, chrono::Utc);
        }
    }
    chrono::Utc::now()
}

fn row_str<'a>(row: &'a Value, keys: &[&str]) -> Option<&'a str> {
    keys.iter().find_map(|k| row.get(k).and_then(Value::as_str))
}

fn generate_message(query_name: &str, row: &Value, action: &str) -> String {
    if query_name.contains("process") {
        let name = row_str(row, &["name", "path"]).unwrap_or("?");
        let pid = row.get("pid").and_then(Value::as_str).unwrap_or("?");
        let cmdline: String = row.get("cmdline").and_then(Value::as_str).unwrap_or("").chars().take(100).collect();
        return format!("Process {action}: {name} (PID: {pid}) {cmdline}");
    }
    if query_name.contains("listening_ports") || query_name.contains("socket") {
        let port = row_str(row, &["port", "local_port"]).unwrap_or("?");
        let proto = row.get("protocol").and_then(Value::as_str).unwrap_or("?");
        let addr = row_str(row, &["address", "local_address"]).unwrap_or("*");
        return format!("Socket {action}: {addr}:{port} ({proto})");
    }
    if query_name.contains("file") {
        let path = row_str(row, &["path", "filename"]).unwrap_or("?");
        return format!("File {action}: {path}");
    }
    if query_name.contains("users") || query_name.contains("logged_in") {
        let user = row_str(row, &["username", "user"]).unwrap_or("?");
        return format!("User {action}: {user}");
    }
    if query_name.contains("hash") {
        let path = row.get("path").and_then(Value::as_str).unwrap_or("?");
        let sha256: String = row.get("sha256").and_then(Value::as_str).unwrap_or("").chars().take(16).collect();
        return format!("File hash: {path} ({sha256}...)");
    }
    if ["packages", "apps", "extensions"].iter().any(|p| query_name.contains(p)) {
        let name = row_str(row, &["name", "identifier"]).unwrap_or("?");
        let version = row.get("version").and_then(Value::as_str).unwrap_or("");
        return format!("Package {action}: {name} {version}");
    }
    format!("osquery {query_name}: {action}")
}

fn protocol_name(proto: &str) -> String {
    match proto {
        "6" => "tcp".to_string(),
        "17" => "udp".to_string(),
        "1" => "icmp".to_string(),
        other => other.to_lowercase(),
    }
}

const USEFUL_LABEL_FIELDS: &[&str] = &["version", "description", "state", "mode", "permissions", "type", "action", "status"];

fn map_fields(event: &mut NormalizedEvent, row: &Value, query_name: &str) {
    if let Some(pid) = row.get("pid").and_then(Value::as_str).and_then(|s| s.parse::<u32>().ok()) {
        event.process_pid = Some(pid);
    }
    if let Some(ppid) = row.get("parent").and_then(Value::as_str).and_then(|s| s.parse::<u32>().ok()) {
        event.process_ppid = Some(ppid);
    }
    if query_name.contains("process") {
        if let Some(name) = row.get("name").and_then(Value::as_str) {
            event.process_name = Some(name.to_string());
        } else if let Some(path) = row.get("path").and_then(Value::as_str) {
            event.process_executable = Some(path.to_string());
        }
    }
    if let Some(cmdline) = row.get("cmdline").and_then(Value::as_str) {
        event.process_command_line = Some(cmdline.to_string());
    }

    if let Some(user) = row_str(row, &["username", "user"]) {
        event.source_user = Some(user.to_string());
    }
    if let Some(uid) = row.get("uid") {
        event.source_user_id = Some(match uid.as_str() {
            Some(s) => s.to_string(),
            None => uid.to_string(),
        });
    }

    if query_name.contains("file") {
        if let Some(path) = row.get("path").and_then(Value::as_str) {
            event.file_path = Some(path.to_string());
            event.file_name = Some(path.rsplit(['/', '\\']).next().unwrap_or(path).to_string());
        }
    }

    if let Some(md5) = row.get("md5").and_then(Value::as_str) {
        event.file_hash_md5 = Some(md5.to_string());
    }
    if let Some(sha1) = row.get("sha1").and_then(Value::as_str) {
        event.file_hash_sha1 = Some(sha1.to_string());
    }
    if let Some(sha256) = row.get("sha256").and_then(Value::as_str) {
        event.file_hash_sha256 = Some(sha256.to_string());
    }

    if let Some(addr) = row_str(row, &["local_address", "address"]) {
        event.source_ip = Some(addr.to_string());
    }
    if let Some(port) = row_str(row, &["local_port", "port"]).and_then(|s| s.parse::<u16>().ok()) {
        event.source_port = Some(port);
    }
    if let Some(addr) = row.get("remote_address").and_then(Value::as_str) {
        event.destination_ip = Some(addr.to_string());
    }
    if let Some(port) = row.get("remote_port").and_then(Value::as_str).and_then(|s| s.parse::<u16>().ok()) {
        event.destination_port = Some(port);
    }
    if let Some(proto) = row.get("protocol").and_then(Value::as_str) {
        event.network_protocol = Some(protocol_name(proto));
    }

    if let Some(hostname) = row.get("hostname").and_then(Value::as_str) {
        event.source_host = Some(hostname.to_string());
    }

    for field in USEFUL_LABEL_FIELDS {
        if let Some(value) = row.get(*field) {
            let rendered = match value.as_str() {
                Some(s) => s.to_string(),
                None => value.to_string(),
            };
            event.set_label(*field, rendered);
        }
    }
}

fn create_event(row: &Value, query_name: &str, host_identifier: &str, timestamp: chrono::DateTime<chrono::Utc>, action: &str) -> NormalizedEvent {
    let message = generate_message(query_name, row, action);

    let mut event = NormalizedEvent::new("osquery", timestamp, row.clone());
    event.category = category_for_query(query_name);
    event.message = Some(message);
    event.action = Some(query_name.to_string());
    if !host_identifier.is_empty() {
        event.source_host = Some(host_identifier.to_string());
    }

    map_fields(&mut event, row, query_name);
    event.set_label("osquery_query", query_name);
    event.set_label("osquery_action", action);
    event
}

fn parse_status(record: &Value) -> Option<NormalizedEvent> {
    if record.get("severity").is_none() && record.get("message").is_none() {
        return None;
    }
    let timestamp = parse_timestamp(record);
    let host_identifier = record.get("hostIdentifier").and_then(Value::as_str).unwrap_or_default();

    let mut event = NormalizedEvent::new("osquery:status", timestamp, record.clone());
    event.category = "host".to_string();
    event.message = Some(record.get("message").and_then(Value::as_str).unwrap_or("osquery status").to_string());
    if !host_identifier.is_empty() {
        event.source_host = Some(host_identifier.to_string());
    }

    let severity = record.get("severity").and_then(Value::as_i64).unwrap_or(0);
    event.severity = match severity {
        1 => 40,
        2 => 70,
        3 => 100,
        _ => 10,
    };
    event.set_label("osquery_version", record.get("version").and_then(Value::as_str).unwrap_or_default());
    Some(event)
}

/// Dispatches a single parsed JSON record to its shape-specific builder,
/// producing zero, one, or many events (a differential record yields one
/// event per added/removed row).
fn build_events(record: &Value) -> Vec<NormalizedEvent> {
    let query_name = record.get("name").and_then(Value::as_str).unwrap_or("unknown");
    let host_identifier = record.get("hostIdentifier").and_then(Value::as_str).unwrap_or_default();
    let timestamp = parse_timestamp(record);

    if let Some(diff) = record.get("diffResults") {
        let mut events = Vec::new();
        if let Some(added) = diff.get("added").and_then(Value::as_array) {
            for row in added {
                let mut event = create_event(row, query_name, host_identifier, timestamp, "added");
                event.set_label("osquery_diff_action", "added");
                events.push(event);
            }
        }
        if let Some(removed) = diff.get("removed").and_then(Value::as_array) {
            for row in removed {
                let mut event = create_event(row, query_name, host_identifier, timestamp, "removed");
                event.set_label("osquery_diff_action", "removed");
                events.push(event);
            }
        }
        return events;
    }

    if let Some(snapshot) = record.get("snapshot").and_then(Value::as_array) {
        return snapshot.iter().map(|row| create_event(row, query_name, host_identifier, timestamp, "snapshot")).collect();
    }

    if let Some(columns) = record.get("columns") {
        return vec![create_event(columns, query_name, host_identifier, timestamp, "result")];
    }

    parse_status(record).into_iter().collect()
}

#[async_trait]
impl Parser for OsqueryParser {
    fn category(&self) -> ParserCategory {
        ParserCategory::Osquery
    }

    fn sniff(&self, sample: &[u8]) -> bool {
        std::str::from_utf8(sample)
            .ok()
            .map(|s| {
                let has_result_shape = s.contains("\"name\"")
                    && (s.contains("\"columns\"") || s.contains("\"snapshot\"") || s.contains("\"diffResults\""));
                let has_status_shape = s.contains("\"hostIdentifier\"") && s.contains("\"calendarTime\"");
                has_result_shape || has_status_shape
            })
            .unwrap_or(false)
    }

    fn extensions(&self) -> &'static [&'static str] {
        &["osquery", "json"]
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
                    Ok(record) => {
                        for mut event in build_events(&record) {
                            event.data_source = raw.data_source.clone();
                            yield event;
                        }
                    }
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
    fn builds_event_from_single_row_result() {
        let record = json!({
            "name": "process_events",
            "hostIdentifier": "host-1",
            "unixTime": 1_700_000_000,
            "action": "added",
            "columns": {"pid": "123", "name": "bash", "username": "root"},
        });
        let events = build_events(&record);
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].process_name.as_deref(), Some("bash"));
        assert_eq!(events[0].source_user.as_deref(), Some("root"));
        assert_eq!(events[0].process_pid, Some(123));
        assert_eq!(events[0].category, "process");
    }

    #[test]
    fn differential_record_yields_one_event_per_row() {
        let record = json!({
            "name": "file_events",
            "hostIdentifier": "host-1",
            "unixTime": 1_700_000_000,
            "diffResults": {
                "added": [{"path": "/etc/passwd", "sha256": "abc"}],
                "removed": [{"path": "/tmp/x"}],
            },
        });
        let events = build_events(&record);
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].file_path.as_deref(), Some("/etc/passwd"));
        assert_eq!(events[0].labels.get("osquery_diff_action").map(String::as_str), Some("added"));
        assert_eq!(events[1].file_path.as_deref(), Some("/tmp/x"));
        assert_eq!(events[1].labels.get("osquery_diff_action").map(String::as_str), Some("removed"));
    }

    #[test]
    fn snapshot_record_yields_one_event_per_row() {
        let record = json!({
            "name": "listening_ports",
            "hostIdentifier": "host-1",
            "unixTime": 1_700_000_000,
            "snapshot": [
                {"port": "22", "protocol": "6", "address": "0.0.0.0"},
                {"port": "443", "protocol": "6", "address": "0.0.0.0"},
            ],
        });
        let events = build_events(&record);
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].category, "network");
        assert_eq!(events[0].network_protocol.as_deref(), Some("tcp"));
        assert_eq!(events[0].source_port, Some(22));
    }

    #[test]
    fn status_record_maps_severity() {
        let record = json!({
            "hostIdentifier": "host-1",
            "calendarTime": "Mon Jan  2 15:04:05 2006 UTC",
            "severity": 2,
            "message": "scheduler running",
            "version": "5.9.1",
        });
        let events = build_events(&record);
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].severity, 70);
        assert_eq!(events[0].message.as_deref(), Some("scheduler running"));
    }

    #[test]
    fn unmapped_query_name_falls_back_to_host_category() {
        assert_eq!(category_for_query("totally_custom_query"), "host");
    }
}
