//! The normalized event model: a flat ECS-shaped record with a fixed set of
//! well-known semantic fields, an open `labels` map, a `tags` set, and an
//! opaque `raw` blob carrying whatever the source parser couldn't map.

use std::collections::{BTreeMap, BTreeSet};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Pre-parse wrapper around a single record pulled off a connector, before
/// any parser has touched it.
#[derive(Debug, Clone)]
pub struct RawEvent {
    pub source: String,
    pub data_source: String,
    pub line: u64,
    pub received_at: DateTime<Utc>,
    pub body: Vec<u8>,
}

impl RawEvent {
    pub fn new(source: impl Into<String>, data_source: impl Into<String>, line: u64, body: Vec<u8>) -> Self {
        Self {
            source: source.into(),
            data_source: data_source.into(),
            line,
            received_at: Utc::now(),
            body,
        }
    }

    pub fn as_str(&self) -> Result<&str, std::str::Utf8Error> {
        std::str::from_utf8(&self.body)
    }
}

/// The normalized, parser-produced event. Field names follow the CEF
/// mapping table so every parser targets the same vocabulary regardless
/// of source format.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NormalizedEvent {
    pub event_id: String,
    pub data_source: String,
    pub timestamp: DateTime<Utc>,
    pub ingested_at: DateTime<Utc>,
    pub severity: u8,
    pub category: String,
    pub message: Option<String>,
    pub action: Option<String>,
    pub outcome: Option<String>,

    pub source_ip: Option<String>,
    pub source_port: Option<u16>,
    pub source_mac: Option<String>,
    pub source_host: Option<String>,
    pub source_user: Option<String>,
    pub source_user_id: Option<String>,
    pub source_domain: Option<String>,

    pub destination_ip: Option<String>,
    pub destination_port: Option<u16>,
    pub destination_mac: Option<String>,
    pub destination_host: Option<String>,
    pub destination_user: Option<String>,
    pub destination_user_id: Option<String>,
    pub destination_domain: Option<String>,

    pub network_protocol: Option<String>,
    pub bytes_in: Option<u64>,
    pub bytes_out: Option<u64>,

    pub process_name: Option<String>,
    pub destination_process_name: Option<String>,
    pub file_name: Option<String>,
    pub file_path: Option<String>,
    pub file_size: Option<u64>,
    pub file_hash: Option<String>,
    pub file_hash_algorithm: Option<String>,

    pub device_host: Option<String>,
    pub device_mac: Option<String>,
    pub device_process_id: Option<u32>,

    pub request: Option<String>,
    pub request_method: Option<String>,
    pub request_context: Option<String>,

    pub process_pid: Option<u32>,
    pub process_ppid: Option<u32>,
    pub process_command_line: Option<String>,
    pub process_executable: Option<String>,
    pub file_hash_md5: Option<String>,
    pub file_hash_sha1: Option<String>,
    pub file_hash_sha256: Option<String>,

    /// Spec's flat ECS vocabulary (`user.name`, `host.name`, ...): unlike
    /// `source_user`/`destination_user`/`source_host` above, these are
    /// single slots with no source/destination split, matching parsers
    /// that only ever observe one "the" user or host for an event.
    pub user_name: Option<String>,
    pub user_id: Option<String>,
    pub user_domain: Option<String>,
    pub host_name: Option<String>,
    pub host_id: Option<String>,
    pub url_full: Option<String>,
    pub url_domain: Option<String>,
    pub url_path: Option<String>,
    pub network_direction: Option<String>,

    /// Open key/value extensions that have a well-known name in the source
    /// format but no fixed slot in this struct (CEF `cs1`..`cn3`, etc).
    pub labels: BTreeMap<String, String>,
    /// Free-form classification tags, e.g. attached by detection rules.
    pub tags: BTreeSet<String>,
    /// The untouched source record, preserved for fields no parser maps.
    pub raw: serde_json::Value,
}

impl NormalizedEvent {
    pub fn new(data_source: impl Into<String>, timestamp: DateTime<Utc>, raw: serde_json::Value) -> Self {
        let data_source = data_source.into();
        Self {
            event_id: Self::derive_id(&data_source, timestamp, &raw),
            data_source,
            timestamp,
            ingested_at: Utc::now(),
            severity: 0,
            category: "unknown".to_string(),
            message: None,
            action: None,
            outcome: None,
            source_ip: None,
            source_port: None,
            source_mac: None,
            source_host: None,
            source_user: None,
            source_user_id: None,
            source_domain: None,
            destination_ip: None,
            destination_port: None,
            destination_mac: None,
            destination_host: None,
            destination_user: None,
            destination_user_id: None,
            destination_domain: None,
            network_protocol: None,
            bytes_in: None,
            bytes_out: None,
            process_name: None,
            destination_process_name: None,
            file_name: None,
            file_path: None,
            file_size: None,
            file_hash: None,
            file_hash_algorithm: None,
            device_host: None,
            device_mac: None,
            device_process_id: None,
            request: None,
            request_method: None,
            request_context: None,
            process_pid: None,
            process_ppid: None,
            process_command_line: None,
            process_executable: None,
            file_hash_md5: None,
            file_hash_sha1: None,
            file_hash_sha256: None,
            user_name: None,
            user_id: None,
            user_domain: None,
            host_name: None,
            host_id: None,
            url_full: None,
            url_domain: None,
            url_path: None,
            network_direction: None,
            labels: BTreeMap::new(),
            tags: BTreeSet::new(),
            raw,
        }
    }

    /// Deterministic content-derived id, so re-ingesting the same raw
    /// record (e.g. after a connector restart) produces the same id and
    /// downstream consumers can de-duplicate.
    fn derive_id(data_source: &str, timestamp: DateTime<Utc>, raw: &serde_json::Value) -> String {
        let mut hasher = blake3::Hasher::new();
        hasher.update(data_source.as_bytes());
        hasher.update(timestamp.timestamp_nanos_opt().unwrap_or_default().to_le_bytes().as_slice());
        hasher.update(raw.to_string().as_bytes());
        let digest = hasher.finalize();
        Uuid::new_v5(&Uuid::NAMESPACE_OID, digest.as_bytes()).to_string()
    }

    pub fn set_label(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.labels.insert(key.into(), value.into());
    }

    pub fn add_tag(&mut self, tag: impl Into<String>) {
        self.tags.insert(tag.into());
    }

    /// Dot-notation field lookup used by Sigma and correlation matchers.
    /// Looks in well-known fields first (trying the literal path, then its
    /// ECS-dotted form flattened to this struct's underscore naming, e.g.
    /// `user.name` -> `user_name`), then `labels`, then `raw`.
    pub fn get_field(&self, path: &str) -> Option<serde_json::Value> {
        if let Some(v) = self.get_well_known(path) {
            return Some(v);
        }
        if path.contains('.') {
            if let Some(v) = self.get_well_known(&path.replace('.', "_")) {
                return Some(v);
            }
        }
        if let Some(v) = self.labels.get(path) {
            return Some(serde_json::Value::String(v.clone()));
        }
        get_nested(&self.raw, path)
    }

    fn get_well_known(&self, path: &str) -> Option<serde_json::Value> {
        let v = match path {
            "event_id" => serde_json::Value::String(self.event_id.clone()),
            "data_source" => serde_json::Value::String(self.data_source.clone()),
            "timestamp" => serde_json::Value::String(self.timestamp.to_rfc3339()),
            "severity" => serde_json::Value::from(self.severity),
            "category" => serde_json::Value::String(self.category.clone()),
            "message" => self.message.clone().map(serde_json::Value::String)?,
            "action" => self.action.clone().map(serde_json::Value::String)?,
            "outcome" => self.outcome.clone().map(serde_json::Value::String)?,
            "source_ip" => self.source_ip.clone().map(serde_json::Value::String)?,
            "source_port" => self.source_port.map(serde_json::Value::from)?,
            "source_host" => self.source_host.clone().map(serde_json::Value::String)?,
            "source_user" => self.source_user.clone().map(serde_json::Value::String)?,
            "destination_ip" => self.destination_ip.clone().map(serde_json::Value::String)?,
            "destination_port" => self.destination_port.map(serde_json::Value::from)?,
            "destination_host" => self.destination_host.clone().map(serde_json::Value::String)?,
            "destination_user" => self.destination_user.clone().map(serde_json::Value::String)?,
            "network_protocol" => self.network_protocol.clone().map(serde_json::Value::String)?,
            "process_name" => self.process_name.clone().map(serde_json::Value::String)?,
            "process_pid" => self.process_pid.map(serde_json::Value::from)?,
            "process_ppid" => self.process_ppid.map(serde_json::Value::from)?,
            "process_command_line" => self.process_command_line.clone().map(serde_json::Value::String)?,
            "process_executable" => self.process_executable.clone().map(serde_json::Value::String)?,
            "file_name" => self.file_name.clone().map(serde_json::Value::String)?,
            "file_path" => self.file_path.clone().map(serde_json::Value::String)?,
            "file_hash" => self.file_hash.clone().map(serde_json::Value::String)?,
            "file_hash_md5" => self.file_hash_md5.clone().map(serde_json::Value::String)?,
            "file_hash_sha1" => self.file_hash_sha1.clone().map(serde_json::Value::String)?,
            "file_hash_sha256" => self.file_hash_sha256.clone().map(serde_json::Value::String)?,
            "user_name" => self.user_name.clone().map(serde_json::Value::String)?,
            "user_id" => self.user_id.clone().map(serde_json::Value::String)?,
            "user_domain" => self.user_domain.clone().map(serde_json::Value::String)?,
            "host_name" => self.host_name.clone().map(serde_json::Value::String)?,
            "host_id" => self.host_id.clone().map(serde_json::Value::String)?,
            "url_full" => self.url_full.clone().map(serde_json::Value::String)?,
            "url_domain" => self.url_domain.clone().map(serde_json::Value::String)?,
            "url_path" => self.url_path.clone().map(serde_json::Value::String)?,
            "network_direction" => self.network_direction.clone().map(serde_json::Value::String)?,
            _ => return None,
        };
        Some(v)
    }
}

/// Dot-path walk through a JSON value, mirroring `_get_nested_value` in the
/// original correlation/playbook engines.
pub fn get_nested(value: &serde_json::Value, path: &str) -> Option<serde_json::Value> {
    let mut current = value;
    for part in path.split('.') {
        current = current.get(part)?;
    }
    Some(current.clone())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn derive_id_is_deterministic() {
        let ts = Utc::now();
        let raw = json!({"a": 1});
        let e1 = NormalizedEvent::new("cef", ts, raw.clone());
        let e2 = NormalizedEvent::new("cef", ts, raw);
        assert_eq!(e1.event_id, e2.event_id);
    }

    #[test]
    fn get_field_checks_labels_then_raw() {
        let mut e = NormalizedEvent::new("cef", Utc::now(), json!({"nested": {"x": 5}}));
        e.set_label("custom1", "hello");
        assert_eq!(e.get_field("custom1"), Some(json!("hello")));
        assert_eq!(e.get_field("nested.x"), Some(json!(5)));
        assert_eq!(e.get_field("missing"), None);
    }

    #[test]
    fn get_field_resolves_ecs_dotted_aliases_to_flat_fields() {
        let mut e = NormalizedEvent::new("cef", Utc::now(), json!({}));
        e.user_name = Some("bob".to_string());
        assert_eq!(e.get_field("user.name"), Some(json!("bob")));
        assert_eq!(e.get_field("user_name"), Some(json!("bob")));
    }
}
