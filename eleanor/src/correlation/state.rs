//! Persisted correlation state, backed by SQLite (see DESIGN.md for the
//! `rusqlite` grounding). State must be durable before the triggering
//! stream message is acked, so every mutation here is a direct write, not
//! a write-behind cache.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection};
use serde::{Deserialize, Serialize};

use crate::err::{EleanorError, Result};

/// States transition active -> triggered -> completed or -> expired.
/// `Triggered` is the instant a pattern's condition is first
/// satisfied (an alert-worthy match has occurred but the state may still
/// accumulate, e.g. a sequence that keeps counting within its window);
/// `Completed` is terminal once the pattern can no longer produce new
/// matches; `Expired` is terminal for windows that closed with no match.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CorrelationStateStatus {
    Active,
    Triggered,
    Completed,
    Expired,
}

impl CorrelationStateStatus {
    fn as_str(&self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::Triggered => "triggered",
            Self::Completed => "completed",
            Self::Expired => "expired",
        }
    }

    fn from_str(s: &str) -> Self {
        match s {
            "triggered" => Self::Triggered,
            "completed" => Self::Completed,
            "expired" => Self::Expired,
            _ => Self::Active,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Expired)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CorrelationState {
    pub rule_id: String,
    pub entity_key: String,
    pub status: CorrelationStateStatus,
    pub window_start: DateTime<Utc>,
    pub window_end: DateTime<Utc>,
    pub matched_event_ids: Vec<String>,
    /// Per-key occurrence counts within the window: sequence step id ->
    /// count, aggregation group -> count, current/baseline spike buckets.
    pub counts: BTreeMap<String, i64>,
    pub updated_at: DateTime<Utc>,
}

impl CorrelationState {
    pub fn matched_count(&self) -> i64 {
        self.matched_event_ids.len() as i64
    }
}

pub struct CorrelationStateStore {
    conn: Connection,
}

impl CorrelationStateStore {
    pub fn open(path: &str) -> Result<Self> {
        let conn = Connection::open(path)?;
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS correlation_state (
                rule_id TEXT NOT NULL,
                entity_key TEXT NOT NULL,
                status TEXT NOT NULL,
                window_start TEXT NOT NULL,
                window_end TEXT NOT NULL,
                matched_event_ids TEXT NOT NULL,
                counts TEXT NOT NULL DEFAULT '{}',
                updated_at TEXT NOT NULL,
                PRIMARY KEY (rule_id, entity_key)
            );",
        )?;
        Ok(Self { conn })
    }

    /// Upserts by `(rule_id, entity_key)`: the real-time dispatch path's
    /// load-bearing invariant is "first open window wins" — an existing
    /// ACTIVE row's window is never replaced, only extended with new
    /// matched events, until it completes or expires.
    pub fn upsert(&self, state: &CorrelationState) -> Result<()> {
        let matched_ids_json = serde_json::to_string(&state.matched_event_ids)?;
        let counts_json = serde_json::to_string(&state.counts)?;
        self.conn.execute(
            "INSERT INTO correlation_state
                (rule_id, entity_key, status, window_start, window_end, matched_event_ids, counts, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
             ON CONFLICT(rule_id, entity_key) DO UPDATE SET
                status = excluded.status,
                window_end = excluded.window_end,
                matched_event_ids = excluded.matched_event_ids,
                counts = excluded.counts,
                updated_at = excluded.updated_at",
            params![
                state.rule_id,
                state.entity_key,
                state.status.as_str(),
                state.window_start.to_rfc3339(),
                state.window_end.to_rfc3339(),
                matched_ids_json,
                counts_json,
                state.updated_at.to_rfc3339(),
            ],
        )?;
        Ok(())
    }

    /// Active states only, for the real-time "first open window wins"
    /// path: an entity with a non-expired active state must extend it
    /// rather than open a second overlapping window.
    pub fn get_active(&self, rule_id: &str, entity_key: &str) -> Result<Option<CorrelationState>> {
        match self.get(rule_id, entity_key)? {
            Some(s) if s.status == CorrelationStateStatus::Active || s.status == CorrelationStateStatus::Triggered => Ok(Some(s)),
            _ => Ok(None),
        }
    }

    pub fn get(&self, rule_id: &str, entity_key: &str) -> Result<Option<CorrelationState>> {
        let mut stmt = self.conn.prepare(
            "SELECT rule_id, entity_key, status, window_start, window_end, matched_event_ids, counts, updated_at
             FROM correlation_state WHERE rule_id = ?1 AND entity_key = ?2",
        )?;
        let mut rows = stmt.query(params![rule_id, entity_key])?;
        if let Some(row) = rows.next()? {
            Ok(Some(row_to_state(row)?))
        } else {
            Ok(None)
        }
    }

    /// Deletes ACTIVE/TRIGGERED rows whose window has expired, and
    /// COMPLETED/EXPIRED rows older than `completed_retention_secs`
    /// (24h by default).
    pub fn cleanup(&self, now: DateTime<Utc>, completed_retention_secs: i64) -> Result<u64> {
        let retention_cutoff = now - chrono::Duration::seconds(completed_retention_secs);
        let active_deleted = self.conn.execute(
            "DELETE FROM correlation_state WHERE status IN ('active', 'triggered') AND window_end < ?1",
            params![now.to_rfc3339()],
        )?;
        let completed_deleted = self.conn.execute(
            "DELETE FROM correlation_state WHERE status IN ('completed', 'expired') AND updated_at < ?1",
            params![retention_cutoff.to_rfc3339()],
        )?;
        Ok((active_deleted + completed_deleted) as u64)
    }
}

fn row_to_state(row: &rusqlite::Row) -> Result<CorrelationState> {
    let matched_ids_json: String = row.get(5)?;
    let matched_event_ids: Vec<String> = serde_json::from_str(&matched_ids_json)?;
    let counts_json: String = row.get(6)?;
    let counts: BTreeMap<String, i64> = serde_json::from_str(&counts_json)?;
    Ok(CorrelationState {
        rule_id: row.get(0)?,
        entity_key: row.get(1)?,
        status: CorrelationStateStatus::from_str(&row.get::<_, String>(2)?),
        window_start: parse_rfc3339(&row.get::<_, String>(3)?)?,
        window_end: parse_rfc3339(&row.get::<_, String>(4)?)?,
        matched_event_ids,
        counts,
        updated_at: parse_rfc3339(&row.get::<_, String>(7)?)?,
    })
}

fn parse_rfc3339(s: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| EleanorError::invalid_state(format!("corrupt timestamp in correlation state: {e}")))
}
