//! Append-only chain-of-custody log. Every evidence read or mutation
//! writes a row here, preserved even after the evidence bytes are deleted.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rusqlite::{params, Connection};
use serde::{Deserialize, Serialize};

use crate::err::Result;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CustodyAction {
    Uploaded,
    Accessed,
    Downloaded,
    /// Metadata-only edit; the underlying bytes are immutable.
    Modified,
    Verified,
    Deleted,
}

impl CustodyAction {
    fn as_str(&self) -> &'static str {
        match self {
            Self::Uploaded => "uploaded",
            Self::Accessed => "accessed",
            Self::Downloaded => "downloaded",
            Self::Modified => "modified",
            Self::Verified => "verified",
            Self::Deleted => "deleted",
        }
    }

    fn from_str(s: &str) -> Self {
        match s {
            "accessed" => Self::Accessed,
            "downloaded" => Self::Downloaded,
            "modified" => Self::Modified,
            "verified" => Self::Verified,
            "deleted" => Self::Deleted,
            _ => Self::Uploaded,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CustodyEvent {
    pub evidence_id: String,
    pub action: CustodyAction,
    pub actor: String,
    pub ip: Option<String>,
    pub user_agent: Option<String>,
    pub details: serde_json::Value,
    pub at: DateTime<Utc>,
}

#[derive(Clone)]
pub struct CustodyLog {
    conn: Arc<Mutex<Connection>>,
}

impl CustodyLog {
    pub fn open(conn: Arc<Mutex<Connection>>) -> Result<Self> {
        conn.lock().execute_batch(
            "CREATE TABLE IF NOT EXISTS custody_events (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                evidence_id TEXT NOT NULL,
                action TEXT NOT NULL,
                actor TEXT NOT NULL,
                ip TEXT,
                user_agent TEXT,
                details TEXT NOT NULL,
                at TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_custody_evidence ON custody_events(evidence_id);",
        )?;
        Ok(Self { conn })
    }

    pub fn append(&self, event: &CustodyEvent) -> Result<()> {
        self.conn.lock().execute(
            "INSERT INTO custody_events (evidence_id, action, actor, ip, user_agent, details, at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                event.evidence_id,
                event.action.as_str(),
                event.actor,
                event.ip,
                event.user_agent,
                event.details.to_string(),
                event.at.to_rfc3339(),
            ],
        )?;
        Ok(())
    }

    /// The full, time-ordered chain for one evidence item. Returned even
    /// after the evidence's bytes have been deleted.
    pub fn chain_for(&self, evidence_id: &str) -> Result<Vec<CustodyEvent>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT evidence_id, action, actor, ip, user_agent, details, at
             FROM custody_events WHERE evidence_id = ?1 ORDER BY at ASC, id ASC",
        )?;
        let rows = stmt.query_map(params![evidence_id], |row| {
            let details_str: String = row.get(5)?;
            Ok(CustodyEvent {
                evidence_id: row.get(0)?,
                action: CustodyAction::from_str(&row.get::<_, String>(1)?),
                actor: row.get(2)?,
                ip: row.get(3)?,
                user_agent: row.get(4)?,
                details: serde_json::from_str(&details_str).unwrap_or(serde_json::Value::Null),
                at: row.get::<_, String>(6)?.parse().unwrap_or_else(|_| Utc::now()),
            })
        })?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row?);
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn chain_is_ordered_and_survives_deletion_record() {
        let conn = Arc::new(Mutex::new(Connection::open_in_memory().unwrap()));
        let log = CustodyLog::open(conn).unwrap();

        let base = Utc::now();
        log.append(&CustodyEvent {
            evidence_id: "ev1".to_string(),
            action: CustodyAction::Uploaded,
            actor: "alice".to_string(),
            ip: Some("10.0.0.1".to_string()),
            user_agent: None,
            details: json!({}),
            at: base,
        })
        .unwrap();
        log.append(&CustodyEvent {
            evidence_id: "ev1".to_string(),
            action: CustodyAction::Deleted,
            actor: "alice".to_string(),
            ip: None,
            user_agent: None,
            details: json!({}),
            at: base + chrono::Duration::seconds(10),
        })
        .unwrap();

        let chain = log.chain_for("ev1").unwrap();
        assert_eq!(chain.len(), 2);
        assert_eq!(chain[0].action, CustodyAction::Uploaded);
        assert_eq!(chain[1].action, CustodyAction::Deleted);
    }
}
