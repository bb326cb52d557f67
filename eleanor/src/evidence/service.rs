//! Ties `ObjectStore` bytes, the `evidence` metadata row, and the
//! `CustodyLog` together behind a single operation set: upload, get,
//! download, delete, verify, custody chain — minus HTTP/auth/tenant
//! plumbing, which stays with the outer caller.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rusqlite::{params, Connection};
use serde::{Deserialize, Serialize};
use tokio::io::AsyncRead;

use crate::err::{EleanorError, Result};

use super::custody::{CustodyAction, CustodyEvent, CustodyLog};
use super::store::{ByteStream, HashTriplet, ObjectStore};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Evidence {
    pub id: String,
    pub case_id: String,
    pub storage_key: String,
    pub original_filename: String,
    pub size: u64,
    pub sha256: String,
    pub sha1: String,
    pub md5: String,
    pub mime_type: String,
    pub uploaded_by: String,
    pub uploaded_at: DateTime<Utc>,
}

/// Caller-supplied request context, logged alongside every custody event.
#[derive(Debug, Clone, Default)]
pub struct ActorContext {
    pub actor: String,
    pub ip: Option<String>,
    pub user_agent: Option<String>,
}

#[derive(Debug, Clone)]
pub struct UploadRequest {
    pub case_id: String,
    pub original_filename: String,
    pub mime_type: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct VerifyResult {
    pub evidence_id: String,
    pub integrity_valid: bool,
    pub recorded: HashTriplet,
    pub computed: HashTriplet,
}

pub struct EvidenceService<S: ObjectStore> {
    store: S,
    db: Arc<Mutex<Connection>>,
    custody: CustodyLog,
}

impl<S: ObjectStore> EvidenceService<S> {
    pub fn open(store: S, sqlite_path: &str) -> Result<Self> {
        let conn = Connection::open(sqlite_path)?;
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS evidence (
                id TEXT PRIMARY KEY,
                case_id TEXT NOT NULL,
                storage_key TEXT NOT NULL,
                original_filename TEXT NOT NULL,
                size INTEGER NOT NULL,
                sha256 TEXT NOT NULL,
                sha1 TEXT NOT NULL,
                md5 TEXT NOT NULL,
                mime_type TEXT NOT NULL,
                uploaded_by TEXT NOT NULL,
                uploaded_at TEXT NOT NULL,
                deleted INTEGER NOT NULL DEFAULT 0
            );",
        )?;
        let db = Arc::new(Mutex::new(conn));
        let custody = CustodyLog::open(db.clone())?;
        Ok(Self { store, db, custody })
    }

    /// Uploads evidence content; identity is `sha256`. The `evidence` row
    /// uses a caller-independent generated id as primary key and
    /// `storage_key` == that id so re-uploads of the same bytes under a
    /// different case/filename don't collide in the object store.
    pub async fn upload(
        &self,
        request: UploadRequest,
        reader: &mut (dyn AsyncRead + Unpin + Send),
        actor: &ActorContext,
    ) -> Result<Evidence> {
        let id = uuid::Uuid::new_v4().to_string();
        let uploaded = self.store.upload(&id, reader).await?;
        let now = Utc::now();

        let evidence = Evidence {
            id: id.clone(),
            case_id: request.case_id,
            storage_key: id.clone(),
            original_filename: request.original_filename,
            size: uploaded.size,
            sha256: uploaded.hashes.sha256.clone(),
            sha1: uploaded.hashes.sha1.clone(),
            md5: uploaded.hashes.md5.clone(),
            mime_type: request.mime_type,
            uploaded_by: actor.actor.clone(),
            uploaded_at: now,
        };

        self.db.lock().execute(
            "INSERT INTO evidence
                (id, case_id, storage_key, original_filename, size, sha256, sha1, md5, mime_type, uploaded_by, uploaded_at, deleted)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, 0)",
            params![
                evidence.id,
                evidence.case_id,
                evidence.storage_key,
                evidence.original_filename,
                evidence.size,
                evidence.sha256,
                evidence.sha1,
                evidence.md5,
                evidence.mime_type,
                evidence.uploaded_by,
                evidence.uploaded_at.to_rfc3339(),
            ],
        )?;

        self.custody.append(&CustodyEvent {
            evidence_id: evidence.id.clone(),
            action: CustodyAction::Uploaded,
            actor: actor.actor.clone(),
            ip: actor.ip.clone(),
            user_agent: actor.user_agent.clone(),
            details: serde_json::json!({"size": evidence.size, "sha256": evidence.sha256}),
            at: now,
        })?;

        Ok(evidence)
    }

    pub fn get(&self, evidence_id: &str, actor: &ActorContext) -> Result<Evidence> {
        let evidence = self.get_row(evidence_id)?;
        self.custody.append(&CustodyEvent {
            evidence_id: evidence_id.to_string(),
            action: CustodyAction::Accessed,
            actor: actor.actor.clone(),
            ip: actor.ip.clone(),
            user_agent: actor.user_agent.clone(),
            details: serde_json::json!({}),
            at: Utc::now(),
        })?;
        Ok(evidence)
    }

    pub async fn download(&self, evidence_id: &str, actor: &ActorContext) -> Result<ByteStream> {
        let evidence = self.get_row(evidence_id)?;
        let stream = self.store.stream_download(&evidence.storage_key).await?;
        self.custody.append(&CustodyEvent {
            evidence_id: evidence_id.to_string(),
            action: CustodyAction::Downloaded,
            actor: actor.actor.clone(),
            ip: actor.ip.clone(),
            user_agent: actor.user_agent.clone(),
            details: serde_json::json!({}),
            at: Utc::now(),
        })?;
        Ok(stream)
    }

    /// Updates mutable metadata (original_filename only — content and
    /// hashes are immutable). Writes a diff into the custody log.
    pub fn update_metadata(&self, evidence_id: &str, new_filename: &str, actor: &ActorContext) -> Result<Evidence> {
        let mut evidence = self.get_row(evidence_id)?;
        let old_filename = evidence.original_filename.clone();
        evidence.original_filename = new_filename.to_string();

        self.db.lock().execute(
            "UPDATE evidence SET original_filename = ?1 WHERE id = ?2",
            params![new_filename, evidence_id],
        )?;

        self.custody.append(&CustodyEvent {
            evidence_id: evidence_id.to_string(),
            action: CustodyAction::Modified,
            actor: actor.actor.clone(),
            ip: actor.ip.clone(),
            user_agent: actor.user_agent.clone(),
            details: serde_json::json!({"original_filename": {"old": old_filename, "new": new_filename}}),
            at: Utc::now(),
        })?;

        Ok(evidence)
    }

    /// Recomputes all three hashes from storage and compares against the
    /// recorded values; logs a `verified` event with the integrity result
    /// regardless of outcome.
    pub async fn verify(&self, evidence_id: &str, actor: &ActorContext) -> Result<VerifyResult> {
        let evidence = self.get_row(evidence_id)?;
        let computed = self.store.compute_hashes(&evidence.storage_key).await?;
        let recorded = HashTriplet {
            sha256: evidence.sha256.clone(),
            sha1: evidence.sha1.clone(),
            md5: evidence.md5.clone(),
        };
        let integrity_valid = computed == recorded;

        self.custody.append(&CustodyEvent {
            evidence_id: evidence_id.to_string(),
            action: CustodyAction::Verified,
            actor: actor.actor.clone(),
            ip: actor.ip.clone(),
            user_agent: actor.user_agent.clone(),
            details: serde_json::json!({
                "integrity_valid": integrity_valid,
                "recorded_sha256": recorded.sha256,
                "computed_sha256": computed.sha256,
            }),
            at: Utc::now(),
        })?;

        if !integrity_valid {
            tracing::error!(evidence_id, "evidence integrity verification failed");
        }

        Ok(VerifyResult {
            evidence_id: evidence_id.to_string(),
            integrity_valid,
            recorded,
            computed,
        })
    }

    /// Purges the bytes; every custody event tied to this id is retained
    /// and the `deleted` row is terminal — no further custody events are
    /// appended for this id after deletion.
    pub async fn delete(&self, evidence_id: &str, actor: &ActorContext) -> Result<()> {
        let evidence = self.get_row(evidence_id)?;
        self.store.delete(&evidence.storage_key).await?;
        self.db.lock().execute("UPDATE evidence SET deleted = 1 WHERE id = ?1", params![evidence_id])?;
        self.custody.append(&CustodyEvent {
            evidence_id: evidence_id.to_string(),
            action: CustodyAction::Deleted,
            actor: actor.actor.clone(),
            ip: actor.ip.clone(),
            user_agent: actor.user_agent.clone(),
            details: serde_json::json!({}),
            at: Utc::now(),
        })?;
        Ok(())
    }

    pub fn custody_chain(&self, evidence_id: &str) -> Result<Vec<CustodyEvent>> {
        self.custody.chain_for(evidence_id)
    }

    fn get_row(&self, evidence_id: &str) -> Result<Evidence> {
        let conn = self.db.lock();
        let mut stmt = conn.prepare(
            "SELECT id, case_id, storage_key, original_filename, size, sha256, sha1, md5, mime_type, uploaded_by, uploaded_at
             FROM evidence WHERE id = ?1",
        )?;
        let mut rows = stmt.query(params![evidence_id])?;
        let Some(row) = rows.next()? else {
            return Err(EleanorError::invalid_state(format!("evidence {evidence_id} not found")));
        };
        Ok(Evidence {
            id: row.get(0)?,
            case_id: row.get(1)?,
            storage_key: row.get(2)?,
            original_filename: row.get(3)?,
            size: row.get::<_, i64>(4)? as u64,
            sha256: row.get(5)?,
            sha1: row.get(6)?,
            md5: row.get(7)?,
            mime_type: row.get(8)?,
            uploaded_by: row.get(9)?,
            uploaded_at: row.get::<_, String>(10)?.parse().map_err(|_| EleanorError::invalid_state("corrupt uploaded_at"))?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::evidence::store::FsObjectStore;

    fn actor() -> ActorContext {
        ActorContext {
            actor: "alice".to_string(),
            ip: Some("10.0.0.5".to_string()),
            user_agent: Some("test-agent".to_string()),
        }
    }

    #[tokio::test]
    async fn upload_then_verify_succeeds_and_logs_custody() {
        let dir = tempfile::tempdir().unwrap();
        let store = FsObjectStore::new(dir.path().join("objects"));
        let db_path = dir.path().join("evidence.db");
        let service = EvidenceService::open(store, db_path.to_str().unwrap()).unwrap();

        let data = vec![0xABu8; 1024 * 1024];
        let mut reader = std::io::Cursor::new(data);
        let evidence = service
            .upload(
                UploadRequest {
                    case_id: "case-1".to_string(),
                    original_filename: "memdump.raw".to_string(),
                    mime_type: "application/octet-stream".to_string(),
                },
                &mut reader,
                &actor(),
            )
            .await
            .unwrap();

        let result = service.verify(&evidence.id, &actor()).await.unwrap();
        assert!(result.integrity_valid);

        let chain = service.custody_chain(&evidence.id).unwrap();
        assert_eq!(chain.len(), 2);
        assert_eq!(chain[0].action, CustodyAction::Uploaded);
        assert_eq!(chain[1].action, CustodyAction::Verified);
    }

    #[tokio::test]
    async fn delete_purges_bytes_but_keeps_custody_chain() {
        let dir = tempfile::tempdir().unwrap();
        let store = FsObjectStore::new(dir.path().join("objects"));
        let db_path = dir.path().join("evidence.db");
        let service = EvidenceService::open(store, db_path.to_str().unwrap()).unwrap();

        let mut reader = std::io::Cursor::new(b"evidence bytes".to_vec());
        let evidence = service
            .upload(
                UploadRequest {
                    case_id: "case-1".to_string(),
                    original_filename: "note.txt".to_string(),
                    mime_type: "text/plain".to_string(),
                },
                &mut reader,
                &actor(),
            )
            .await
            .unwrap();

        service.delete(&evidence.id, &actor()).await.unwrap();

        let chain = service.custody_chain(&evidence.id).unwrap();
        assert_eq!(chain.last().unwrap().action, CustodyAction::Deleted);
        // No event after the deleted event.
        let deleted_at = chain.last().unwrap().at;
        assert!(chain.iter().all(|e| e.at <= deleted_at));
    }
}
