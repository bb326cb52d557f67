//! The detection output and its persistence: `Alert`, and the worker pool
//! that produces alerts from the `events` stream (`worker`).

pub mod worker;

use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rusqlite::{params, Connection};
use serde::{Deserialize, Serialize};

use crate::err::{EleanorError, Result};

pub use worker::{ProcessorMetricsSnapshot, RealtimeProcessor, RealtimeProcessorConfig};

/// Alert lifecycle: open -> acknowledged -> closed, the conventional SIEM
/// alert shape.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertStatus {
    Open,
    Acknowledged,
    Closed,
}

impl AlertStatus {
    fn as_str(&self) -> &'static str {
        match self {
            Self::Open => "open",
            Self::Acknowledged => "acknowledged",
            Self::Closed => "closed",
        }
    }

    fn from_str(s: &str) -> Self {
        match s {
            "acknowledged" => Self::Acknowledged,
            "closed" => Self::Closed,
            _ => Self::Open,
        }
    }
}

/// Which detection path produced the alert, carried so operators can trace
/// an alert back to either the Sigma ruleset or a correlation rule.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertSource {
    Sigma,
    Correlation,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Alert {
    pub id: String,
    pub rule_id: String,
    pub source: AlertSource,
    pub severity: u8,
    pub status: AlertStatus,
    pub title: String,
    pub description: String,
    pub raw_event: serde_json::Value,
    pub mitre_tactics: Vec<String>,
    pub mitre_techniques: Vec<String>,
    pub tags: Vec<String>,
    pub created_at: DateTime<Utc>,
}

/// Persisted alert storage, backed by SQLite.
#[derive(Clone)]
pub struct AlertStore {
    conn: Arc<Mutex<Connection>>,
}

impl AlertStore {
    pub fn open(path: &str) -> Result<Self> {
        let conn = Connection::open(path)?;
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS alerts (
                id TEXT PRIMARY KEY,
                rule_id TEXT NOT NULL,
                source TEXT NOT NULL,
                severity INTEGER NOT NULL,
                status TEXT NOT NULL,
                title TEXT NOT NULL,
                description TEXT NOT NULL,
                raw_event TEXT NOT NULL,
                mitre_tactics TEXT NOT NULL,
                mitre_techniques TEXT NOT NULL,
                tags TEXT NOT NULL,
                created_at TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_alerts_rule ON alerts(rule_id);",
        )?;
        Ok(Self { conn: Arc::new(Mutex::new(conn)) })
    }

    pub fn insert(&self, alert: &Alert) -> Result<()> {
        self.conn.lock().execute(
            "INSERT INTO alerts
                (id, rule_id, source, severity, status, title, description, raw_event, mitre_tactics, mitre_techniques, tags, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)",
            params![
                alert.id,
                alert.rule_id,
                alert.source.as_str_db(),
                alert.severity,
                alert.status.as_str(),
                alert.title,
                alert.description,
                alert.raw_event.to_string(),
                serde_json::to_string(&alert.mitre_tactics)?,
                serde_json::to_string(&alert.mitre_techniques)?,
                serde_json::to_string(&alert.tags)?,
                alert.created_at.to_rfc3339(),
            ],
        )?;
        Ok(())
    }

    pub fn get(&self, id: &str) -> Result<Option<Alert>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT id, rule_id, source, severity, status, title, description, raw_event, mitre_tactics, mitre_techniques, tags, created_at
             FROM alerts WHERE id = ?1",
        )?;
        let mut rows = stmt.query(params![id])?;
        let Some(row) = rows.next()? else { return Ok(None) };
        Ok(Some(row_to_alert(row)?))
    }

    pub fn list_for_rule(&self, rule_id: &str) -> Result<Vec<Alert>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT id, rule_id, source, severity, status, title, description, raw_event, mitre_tactics, mitre_techniques, tags, created_at
             FROM alerts WHERE rule_id = ?1 ORDER BY created_at ASC",
        )?;
        let rows = stmt.query_map(params![rule_id], |row| Ok(row_to_alert(row)))?;
        let mut out = Vec::new();
        for r in rows {
            out.push(r??);
        }
        Ok(out)
    }
}

impl AlertSource {
    fn as_str_db(&self) -> &'static str {
        match self {
            Self::Sigma => "sigma",
            Self::Correlation => "correlation",
        }
    }

    fn from_str_db(s: &str) -> Self {
        match s {
            "correlation" => Self::Correlation,
            _ => Self::Sigma,
        }
    }
}

fn row_to_alert(row: &rusqlite::Row) -> Result<Alert> {
    let tactics: String = row.get(8)?;
    let techniques: String = row.get(9)?;
    let tags: String = row.get(10)?;
    Ok(Alert {
        id: row.get(0)?,
        rule_id: row.get(1)?,
        source: AlertSource::from_str_db(&row.get::<_, String>(2)?),
        severity: row.get(3)?,
        status: AlertStatus::from_str(&row.get::<_, String>(4)?),
        title: row.get(5)?,
        description: row.get(6)?,
        raw_event: serde_json::from_str(&row.get::<_, String>(7)?).unwrap_or(serde_json::Value::Null),
        mitre_tactics: serde_json::from_str(&tactics)?,
        mitre_techniques: serde_json::from_str(&techniques)?,
        tags: serde_json::from_str(&tags)?,
        created_at: row
            .get::<_, String>(11)?
            .parse()
            .map_err(|_| EleanorError::invalid_state("corrupt alert created_at"))?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn sample_alert() -> Alert {
        Alert {
            id: uuid::Uuid::new_v4().to_string(),
            rule_id: "rule1".to_string(),
            source: AlertSource::Sigma,
            severity: 75,
            status: AlertStatus::Open,
            title: "suspicious powershell".to_string(),
            description: "matched sigma rule rule1".to_string(),
            raw_event: json!({"process_name": "powershell.exe"}),
            mitre_tactics: vec!["TA0002".to_string()],
            mitre_techniques: vec!["T1059".to_string()],
            tags: vec!["attack.t1059".to_string()],
            created_at: Utc::now(),
        }
    }

    #[test]
    fn insert_then_get_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let store = AlertStore::open(dir.path().join("alerts.db").to_str().unwrap()).unwrap();
        let alert = sample_alert();
        store.insert(&alert).unwrap();

        let fetched = store.get(&alert.id).unwrap().unwrap();
        assert_eq!(fetched.rule_id, "rule1");
        assert_eq!(fetched.severity, 75);
        assert_eq!(fetched.mitre_techniques, vec!["T1059".to_string()]);
    }

    #[test]
    fn list_for_rule_filters_by_rule_id() {
        let dir = tempfile::tempdir().unwrap();
        let store = AlertStore::open(dir.path().join("alerts.db").to_str().unwrap()).unwrap();
        let mut a1 = sample_alert();
        a1.rule_id = "rule1".to_string();
        let mut a2 = sample_alert();
        a2.id = uuid::Uuid::new_v4().to_string();
        a2.rule_id = "rule2".to_string();
        store.insert(&a1).unwrap();
        store.insert(&a2).unwrap();

        assert_eq!(store.list_for_rule("rule1").unwrap().len(), 1);
        assert_eq!(store.list_for_rule("rule2").unwrap().len(), 1);
    }
}
