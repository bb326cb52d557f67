//! Persisted playbook definitions, executions, and approvals. Follows the
//! `Arc<parking_lot::Mutex<Connection>>` pattern established in
//! `evidence/custody.rs`'s `CustodyLog` so a single store can be shared
//! across the engine's concurrent resumes.

use std::sync::Arc;

use parking_lot::Mutex;
use rusqlite::{params, Connection};

use crate::err::Result;

use super::model::{Approval, Playbook, PlaybookExecution};

#[derive(Clone)]
pub struct PlaybookStore {
    conn: Arc<Mutex<Connection>>,
}

impl PlaybookStore {
    pub fn open(path: &str) -> Result<Self> {
        let conn = Connection::open(path)?;
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS playbooks (
                id TEXT PRIMARY KEY,
                document TEXT NOT NULL
            );
            CREATE TABLE IF NOT EXISTS playbook_executions (
                id TEXT PRIMARY KEY,
                playbook_id TEXT NOT NULL,
                document TEXT NOT NULL
            );
            CREATE TABLE IF NOT EXISTS playbook_approvals (
                execution_id TEXT NOT NULL,
                step_id TEXT NOT NULL,
                document TEXT NOT NULL,
                PRIMARY KEY (execution_id, step_id)
            );",
        )?;
        Ok(Self { conn: Arc::new(Mutex::new(conn)) })
    }

    pub fn put_playbook(&self, playbook: &Playbook) -> Result<()> {
        let document = serde_json::to_string(playbook)?;
        self.conn.lock().execute(
            "INSERT INTO playbooks (id, document) VALUES (?1, ?2)
             ON CONFLICT(id) DO UPDATE SET document = excluded.document",
            params![playbook.id, document],
        )?;
        Ok(())
    }

    pub fn get_playbook(&self, id: &str) -> Result<Option<Playbook>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare("SELECT document FROM playbooks WHERE id = ?1")?;
        let mut rows = stmt.query(params![id])?;
        match rows.next()? {
            Some(row) => {
                let document: String = row.get(0)?;
                Ok(Some(serde_json::from_str(&document)?))
            }
            None => Ok(None),
        }
    }

    pub fn put_execution(&self, execution: &PlaybookExecution) -> Result<()> {
        let document = serde_json::to_string(execution)?;
        self.conn.lock().execute(
            "INSERT INTO playbook_executions (id, playbook_id, document) VALUES (?1, ?2, ?3)
             ON CONFLICT(id) DO UPDATE SET document = excluded.document",
            params![execution.id, execution.playbook_id, document],
        )?;
        Ok(())
    }

    pub fn get_execution(&self, id: &str) -> Result<Option<PlaybookExecution>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare("SELECT document FROM playbook_executions WHERE id = ?1")?;
        let mut rows = stmt.query(params![id])?;
        match rows.next()? {
            Some(row) => {
                let document: String = row.get(0)?;
                Ok(Some(serde_json::from_str(&document)?))
            }
            None => Ok(None),
        }
    }

    pub fn put_approval(&self, approval: &Approval) -> Result<()> {
        let document = serde_json::to_string(approval)?;
        self.conn.lock().execute(
            "INSERT INTO playbook_approvals (execution_id, step_id, document) VALUES (?1, ?2, ?3)
             ON CONFLICT(execution_id, step_id) DO UPDATE SET document = excluded.document",
            params![approval.execution_id, approval.step_id, document],
        )?;
        Ok(())
    }

    pub fn get_approval(&self, execution_id: &str, step_id: &str) -> Result<Option<Approval>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT document FROM playbook_approvals WHERE execution_id = ?1 AND step_id = ?2",
        )?;
        let mut rows = stmt.query(params![execution_id, step_id])?;
        match rows.next()? {
            Some(row) => {
                let document: String = row.get(0)?;
                Ok(Some(serde_json::from_str(&document)?))
            }
            None => Ok(None),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::playbook::model::{ExecutionStatus, Step, StepType};
    use serde_json::json;

    fn sample_playbook() -> Playbook {
        Playbook {
            id: "pb1".to_string(),
            name: "isolate host".to_string(),
            status: "active".to_string(),
            steps: vec![Step {
                id: "s1".to_string(),
                kind: StepType::Action,
                on_success: None,
                on_failure: None,
                on_approve: None,
                on_deny: None,
                params: json!({"action": "isolate", "params": {}}),
            }],
        }
    }

    #[test]
    fn put_then_get_playbook_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let store = PlaybookStore::open(dir.path().join("pb.db").to_str().unwrap()).unwrap();
        let playbook = sample_playbook();
        store.put_playbook(&playbook).unwrap();

        let fetched = store.get_playbook("pb1").unwrap().unwrap();
        assert_eq!(fetched.steps.len(), 1);
    }

    #[test]
    fn put_then_get_execution_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let store = PlaybookStore::open(dir.path().join("pb.db").to_str().unwrap()).unwrap();
        let execution = PlaybookExecution::new("pb1", json!({}), chrono::Utc::now());
        store.put_execution(&execution).unwrap();

        let fetched = store.get_execution(&execution.id).unwrap().unwrap();
        assert_eq!(fetched.status, ExecutionStatus::Pending);
    }
}
