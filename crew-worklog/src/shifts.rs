//! Shift lifecycle. A worker has at most one open shift; closing stamps
//! `ended_at` and the two stay in lockstep with `status`.

use chrono::DateTime;
use chrono::Utc;
use rusqlite::Connection;
use rusqlite::OptionalExtension;
use serde::Deserialize;
use serde::Serialize;

use crew_audit::AuditOutcome;
use crew_store::Session;
use crew_store::now_rfc3339;
use crew_store::parse_ts;

use crate::WorklogError;
use crate::WorklogResult;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ShiftStatus {
    Open,
    Closed,
}

impl ShiftStatus {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            ShiftStatus::Open => "open",
            ShiftStatus::Closed => "closed",
        }
    }

    #[must_use]
    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "open" => Some(ShiftStatus::Open),
            "closed" => Some(ShiftStatus::Closed),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Shift {
    pub id: i64,
    pub user_id: i64,
    pub client_id: Option<i64>,
    pub work_address: Option<String>,
    pub status: ShiftStatus,
    pub created_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
}

pub fn start(
    session: &mut Session,
    actor: &str,
    user_id: i64,
    client_id: Option<i64>,
    work_address: Option<&str>,
) -> WorklogResult<Shift> {
    if find_open(session.conn(), user_id)?.is_some() {
        return Err(WorklogError::StaleState(format!(
            "user {user_id} already has an open shift"
        )));
    }
    if let Some(client_id) = client_id {
        crate::clients::get(session.conn(), client_id)?;
    }
    session.conn().execute(
        "INSERT INTO shifts (user_id, client_id, work_address, status, created_at)
         VALUES (?1, ?2, ?3, 'open', ?4)",
        rusqlite::params![user_id, client_id, work_address, now_rfc3339()],
    )?;
    let shift_id = session.conn().last_insert_rowid();
    session.mark_mutation()?;
    crew_audit::append(
        session,
        actor,
        "shift.start",
        "shift",
        Some(shift_id),
        &serde_json::json!({"user_id": user_id, "client_id": client_id}),
        AuditOutcome::Applied,
        None,
    )?;
    session.queue_metric(
        "shift.start",
        serde_json::json!({"shift_id": shift_id, "user_id": user_id}),
    );
    get(session.conn(), shift_id)
}

pub fn end(session: &mut Session, actor: &str, user_id: i64) -> WorklogResult<Shift> {
    let open = find_open(session.conn(), user_id)?.ok_or_else(|| {
        WorklogError::StaleState(format!("user {user_id} has no open shift"))
    })?;
    session.conn().execute(
        "UPDATE shifts SET status = 'closed', ended_at = ?2 WHERE id = ?1",
        rusqlite::params![open.id, now_rfc3339()],
    )?;
    session.mark_mutation()?;
    crew_audit::append(
        session,
        actor,
        "shift.end",
        "shift",
        Some(open.id),
        &serde_json::json!({"user_id": user_id}),
        AuditOutcome::Applied,
        None,
    )?;
    session.queue_metric(
        "shift.end",
        serde_json::json!({"shift_id": open.id, "user_id": user_id}),
    );
    get(session.conn(), open.id)
}

pub fn get(conn: &Connection, shift_id: i64) -> WorklogResult<Shift> {
    conn.query_row(
        "SELECT id, user_id, client_id, work_address, status, created_at, ended_at
         FROM shifts WHERE id = ?1",
        [shift_id],
        map_shift,
    )
    .optional()?
    .ok_or_else(|| WorklogError::NotFound(format!("shift {shift_id}")))
}

pub fn find_open(conn: &Connection, user_id: i64) -> WorklogResult<Option<Shift>> {
    Ok(conn
        .query_row(
            "SELECT id, user_id, client_id, work_address, status, created_at, ended_at
             FROM shifts WHERE user_id = ?1 AND status = 'open' ORDER BY id DESC LIMIT 1",
            [user_id],
            map_shift,
        )
        .optional()?)
}

/// Shifts for one worker within an inclusive date window.
pub fn for_user(
    conn: &Connection,
    user_id: i64,
    from: Option<&str>,
    to: Option<&str>,
) -> WorklogResult<Vec<Shift>> {
    let mut stmt = conn.prepare(
        "SELECT id, user_id, client_id, work_address, status, created_at, ended_at
         FROM shifts
         WHERE user_id = ?1
           AND (?2 IS NULL OR date(created_at) >= date(?2))
           AND (?3 IS NULL OR date(created_at) <= date(?3))
         ORDER BY created_at DESC, id DESC",
    )?;
    let shifts = stmt
        .query_map(rusqlite::params![user_id, from, to], map_shift)?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(shifts)
}

fn map_shift(row: &rusqlite::Row<'_>) -> rusqlite::Result<Shift> {
    let status_raw: String = row.get(4)?;
    let created_at: String = row.get(5)?;
    let ended_at: Option<String> = row.get(6)?;
    Ok(Shift {
        id: row.get(0)?,
        user_id: row.get(1)?,
        client_id: row.get(2)?,
        work_address: row.get(3)?,
        status: ShiftStatus::parse(&status_raw).unwrap_or(ShiftStatus::Open),
        created_at: parse_ts(&created_at),
        ended_at: ended_at.as_deref().map(parse_ts),
    })
}
