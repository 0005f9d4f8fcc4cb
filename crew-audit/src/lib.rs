#![deny(clippy::print_stdout, clippy::print_stderr)]

//! Append-only audit log. One row per attempted mutation, carrying the
//! SHA-256 of the canonical payload and the outcome. Rows are never updated
//! and never deleted.

use chrono::DateTime;
use chrono::Utc;
use serde::Deserialize;
use serde::Serialize;
use thiserror::Error;

use crew_money::payload_hash;
use crew_store::Session;
use crew_store::now_rfc3339;
use crew_store::parse_ts;

pub type AuditResult<T> = Result<T, AuditError>;

#[derive(Debug, Error)]
pub enum AuditError {
    #[error("validation error: {0}")]
    Validation(String),
    #[error("storage failure: {0}")]
    Storage(#[from] rusqlite::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditOutcome {
    Applied,
    Rejected,
    Noop,
}

impl AuditOutcome {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            AuditOutcome::Applied => "applied",
            AuditOutcome::Rejected => "rejected",
            AuditOutcome::Noop => "noop",
        }
    }

    #[must_use]
    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "applied" => Some(AuditOutcome::Applied),
            "rejected" => Some(AuditOutcome::Rejected),
            "noop" => Some(AuditOutcome::Noop),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditEntry {
    pub id: i64,
    pub actor: String,
    pub action: String,
    pub target_kind: String,
    pub target_id: Option<i64>,
    pub payload_hash: String,
    pub outcome: AuditOutcome,
    pub reason: Option<String>,
    pub ts: DateTime<Utc>,
}

/// Appends one entry inside the caller's transaction and marks the session
/// as audited.
pub fn append(
    session: &mut Session,
    actor: &str,
    action: &str,
    target_kind: &str,
    target_id: Option<i64>,
    payload: &serde_json::Value,
    outcome: AuditOutcome,
    reason: Option<&str>,
) -> AuditResult<i64> {
    if actor.trim().is_empty() {
        return Err(AuditError::Validation("actor must be provided".into()));
    }
    if action.trim().is_empty() {
        return Err(AuditError::Validation("action must be provided".into()));
    }

    session.conn().execute(
        "INSERT INTO audit_log (actor, action, target_kind, target_id, payload_hash, outcome, reason, ts)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
        rusqlite::params![
            actor,
            action,
            target_kind,
            target_id,
            payload_hash(payload),
            outcome.as_str(),
            reason,
            now_rfc3339(),
        ],
    )?;
    let id = session.conn().last_insert_rowid();
    session.mark_audited();
    Ok(id)
}

/// Entries for one target, oldest first.
pub fn by_target(
    conn: &rusqlite::Connection,
    target_kind: &str,
    target_id: i64,
) -> AuditResult<Vec<AuditEntry>> {
    let mut stmt = conn.prepare(
        "SELECT id, actor, action, target_kind, target_id, payload_hash, outcome, reason, ts
         FROM audit_log WHERE target_kind = ?1 AND target_id = ?2 ORDER BY id",
    )?;
    let rows = stmt.query_map(rusqlite::params![target_kind, target_id], map_row)?;
    Ok(rows.collect::<Result<_, _>>()?)
}

/// Most recent entries for one actor.
pub fn by_actor(
    conn: &rusqlite::Connection,
    actor: &str,
    limit: usize,
) -> AuditResult<Vec<AuditEntry>> {
    let mut stmt = conn.prepare(
        "SELECT id, actor, action, target_kind, target_id, payload_hash, outcome, reason, ts
         FROM audit_log WHERE actor = ?1 ORDER BY id DESC LIMIT ?2",
    )?;
    let rows = stmt.query_map(rusqlite::params![actor, limit as i64], map_row)?;
    Ok(rows.collect::<Result<_, _>>()?)
}

fn map_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<AuditEntry> {
    let outcome_raw: String = row.get(6)?;
    let ts_raw: String = row.get(8)?;
    Ok(AuditEntry {
        id: row.get(0)?,
        actor: row.get(1)?,
        action: row.get(2)?,
        target_kind: row.get(3)?,
        target_id: row.get(4)?,
        payload_hash: row.get(5)?,
        outcome: AuditOutcome::parse(&outcome_raw).unwrap_or(AuditOutcome::Rejected),
        reason: row.get(7)?,
        ts: parse_ts(&ts_raw),
    })
}
