//! Piecework tasks. The amount is computed by the pricing engine at
//! creation and the rule/pricing SHAs are pinned on the row.

use chrono::DateTime;
use chrono::Utc;
use rusqlite::Connection;
use rusqlite::OptionalExtension;
use rust_decimal::Decimal;
use serde::Deserialize;
use serde::Serialize;

use crew_audit::AuditOutcome;
use crew_money::Money;
use crew_pricing::PricingEngine;
use crew_store::Session;
use crew_store::now_rfc3339;
use crew_store::parse_ts;

use crate::WorklogError;
use crate::WorklogResult;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    Approved,
    Rejected,
}

impl TaskStatus {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Pending => "pending",
            TaskStatus::Approved => "approved",
            TaskStatus::Rejected => "rejected",
        }
    }

    #[must_use]
    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "pending" => Some(TaskStatus::Pending),
            "approved" => Some(TaskStatus::Approved),
            "rejected" => Some(TaskStatus::Rejected),
            _ => None,
        }
    }

    #[must_use]
    pub fn is_terminal(&self) -> bool {
        matches!(self, TaskStatus::Approved | TaskStatus::Rejected)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    pub id: i64,
    pub shift_id: i64,
    pub rate_code: String,
    pub qty: Decimal,
    pub amount: Money,
    pub pricing_sha: String,
    pub rules_sha: String,
    pub worker: String,
    pub status: TaskStatus,
    pub created_at: DateTime<Utc>,
}

pub fn add(
    session: &mut Session,
    pricing: &PricingEngine,
    actor: &str,
    shift_id: i64,
    rate_code: &str,
    qty: Decimal,
) -> WorklogResult<Task> {
    let shift = crate::shifts::get(session.conn(), shift_id)?;
    let worker: String = session
        .conn()
        .query_row(
            "SELECT name FROM users WHERE id = ?1",
            [shift.user_id],
            |row| row.get(0),
        )
        .optional()?
        .ok_or_else(|| WorklogError::NotFound(format!("user {}", shift.user_id)))?;

    let priced = pricing.price_task(rate_code, qty)?;
    session.conn().execute(
        "INSERT INTO tasks (shift_id, rate_code, qty, amount, pricing_sha, rules_sha, worker, status, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, 'pending', ?8)",
        rusqlite::params![
            shift_id,
            rate_code,
            qty.to_string(),
            priced.total_money().to_plain_string(),
            priced.pricing_sha,
            priced.rules_sha,
            worker,
            now_rfc3339(),
        ],
    )?;
    let task_id = session.conn().last_insert_rowid();
    session.mark_mutation()?;
    crew_audit::append(
        session,
        actor,
        "task.add",
        "task",
        Some(task_id),
        &serde_json::json!({
            "shift_id": shift_id,
            "rate_code": rate_code,
            "qty": qty.to_string(),
            "amount": priced.total_money().to_plain_string(),
        }),
        AuditOutcome::Applied,
        None,
    )?;
    session.queue_metric(
        "task.add",
        serde_json::json!({"task_id": task_id, "rate_code": rate_code}),
    );
    get(session.conn(), task_id)
}

pub fn get(conn: &Connection, task_id: i64) -> WorklogResult<Task> {
    conn.query_row(
        "SELECT id, shift_id, rate_code, qty, amount, pricing_sha, rules_sha, worker, status, created_at
         FROM tasks WHERE id = ?1",
        [task_id],
        map_task,
    )
    .optional()?
    .ok_or_else(|| WorklogError::NotFound(format!("task {task_id}")))
}

pub(crate) fn map_task(row: &rusqlite::Row<'_>) -> rusqlite::Result<Task> {
    let qty_raw: String = row.get(3)?;
    let amount_raw: String = row.get(4)?;
    let status_raw: String = row.get(8)?;
    let created_at: String = row.get(9)?;
    Ok(Task {
        id: row.get(0)?,
        shift_id: row.get(1)?,
        rate_code: row.get(2)?,
        qty: qty_raw.parse().unwrap_or_default(),
        amount: Money::parse(&amount_raw).unwrap_or(Money::ZERO),
        pricing_sha: row.get(5)?,
        rules_sha: row.get(6)?,
        worker: row.get(7)?,
        status: TaskStatus::parse(&status_raw).unwrap_or(TaskStatus::Pending),
        created_at: parse_ts(&created_at),
    })
}
