#![deny(clippy::print_stdout, clippy::print_stderr)]

//! Moderation inbox: tasks and expenses waiting on a foreman.
//!
//! Terminal states are absorbing. Re-sending the action an item already
//! received is a `noop`, not an error, so bot retries stay safe; asking for
//! the opposite outcome of a settled item is a state conflict.

use chrono::DateTime;
use chrono::Utc;
use rusqlite::Connection;
use rusqlite::OptionalExtension;
use serde::Deserialize;
use serde::Serialize;
use thiserror::Error;

use crew_audit::AuditOutcome;
use crew_money::Money;
use crew_pricing::PricingEngine;
use crew_store::Paginated;
use crew_store::Session;
use crew_store::parse_ts;

pub type ModerationResult<T> = Result<T, ModerationError>;

#[derive(Debug, Error)]
pub enum ModerationError {
    #[error("resource not found: {0}")]
    NotFound(String),
    #[error("state conflict: {0}")]
    StaleState(String),
    #[error("validation error: {0}")]
    Validation(String),
    #[error(transparent)]
    Pricing(#[from] crew_pricing::PricingError),
    #[error("storage failure: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error(transparent)]
    Store(#[from] crew_store::StoreError),
    #[error(transparent)]
    Audit(#[from] crew_audit::AuditError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PendingKind {
    Task,
    Expense,
}

impl PendingKind {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            PendingKind::Task => "task",
            PendingKind::Expense => "expense",
        }
    }

    #[must_use]
    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "task" => Some(PendingKind::Task),
            "expense" => Some(PendingKind::Expense),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Decision {
    Approve,
    Reject,
}

impl Decision {
    #[must_use]
    pub fn metric_kind(&self) -> &'static str {
        match self {
            Decision::Approve => "mod.approve",
            Decision::Reject => "mod.reject",
        }
    }

    fn action(&self, kind: PendingKind) -> String {
        let verb = match self {
            Decision::Approve => "approve",
            Decision::Reject => "reject",
        };
        format!("{}.{verb}", kind.as_str())
    }

    fn target_status(&self) -> &'static str {
        match self {
            Decision::Approve => "approved",
            Decision::Reject => "rejected",
        }
    }
}

/// One row of the unified inbox.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PendingItem {
    pub id: i64,
    pub kind: PendingKind,
    pub actor_name: String,
    pub summary: String,
    pub amount: Option<Money>,
    pub currency: String,
    pub created_at: DateTime<Utc>,
    pub status: String,
    pub payload_preview: serde_json::Value,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct InboxFilter {
    pub kind: Option<PendingKind>,
    /// Case-insensitive partial match on the submitting worker's name.
    pub worker: Option<String>,
    /// Inclusive bounds applied to `created_at`, `YYYY-MM-DD`.
    pub date_from: Option<String>,
    pub date_to: Option<String>,
    /// Raw status filter; when absent only non-terminal items are listed.
    pub status: Option<String>,
    pub page: Option<u32>,
    pub limit: Option<u32>,
}

const INBOX_SELECT: &str = "
SELECT id, kind, actor_name, summary, amount, currency, created_at, status, detail_a, detail_b
FROM (
    SELECT t.id AS id, 'task' AS kind, t.worker AS actor_name,
           t.rate_code AS summary, t.amount AS amount, 'ILS' AS currency,
           t.created_at AS created_at, t.status AS status,
           t.rate_code AS detail_a, t.qty AS detail_b
    FROM tasks t
    UNION ALL
    SELECT e.id, 'expense', u.name,
           e.category, e.amount, e.currency,
           e.created_at, e.status,
           e.category, e.photo_ref
    FROM expenses e
    JOIN users u ON u.id = e.worker_id
)
WHERE (:kind IS NULL OR kind = :kind)
  AND (:worker IS NULL OR instr(lower(actor_name), lower(:worker)) > 0)
  AND (:date_from IS NULL OR date(created_at) >= date(:date_from))
  AND (:date_to IS NULL OR date(created_at) <= date(:date_to))
  AND (CASE WHEN :status IS NULL
            THEN status IN ('pending', 'needs_approval')
            ELSE status = :status END)
";

/// Filtered, paginated inbox ordered newest first with id as tiebreaker.
pub fn list_inbox(
    conn: &Connection,
    filter: &InboxFilter,
) -> ModerationResult<Paginated<PendingItem>> {
    let page = filter.page.unwrap_or(1).max(1);
    let limit = filter.limit.unwrap_or(20).clamp(1, 100);
    let kind = filter.kind.map(|kind| kind.as_str().to_string());

    let count_sql = format!("SELECT COUNT(*) FROM ({INBOX_SELECT})");
    let total: u64 = conn.query_row(
        &count_sql,
        rusqlite::named_params! {
            ":kind": kind,
            ":worker": filter.worker,
            ":date_from": filter.date_from,
            ":date_to": filter.date_to,
            ":status": filter.status,
        },
        |row| row.get::<_, i64>(0).map(|count| count as u64),
    )?;

    let page_sql = format!(
        "{INBOX_SELECT} ORDER BY created_at DESC, id DESC LIMIT :limit OFFSET :offset"
    );
    let mut stmt = conn.prepare(&page_sql)?;
    let items = stmt
        .query_map(
            rusqlite::named_params! {
                ":kind": kind,
                ":worker": filter.worker,
                ":date_from": filter.date_from,
                ":date_to": filter.date_to,
                ":status": filter.status,
                ":limit": limit,
                ":offset": (page - 1) * limit,
            },
            map_pending,
        )?
        .collect::<Result<Vec<_>, _>>()?;

    Ok(Paginated {
        items,
        page,
        limit,
        total,
    })
}

fn map_pending(row: &rusqlite::Row<'_>) -> rusqlite::Result<PendingItem> {
    let kind_raw: String = row.get(1)?;
    let kind = PendingKind::parse(&kind_raw).unwrap_or(PendingKind::Task);
    let amount_raw: Option<String> = row.get(4)?;
    let created_at: String = row.get(6)?;
    let detail_a: Option<String> = row.get(8)?;
    let detail_b: Option<String> = row.get(9)?;
    let payload_preview = match kind {
        PendingKind::Task => serde_json::json!({
            "rate_code": detail_a,
            "qty": detail_b,
        }),
        PendingKind::Expense => serde_json::json!({
            "category": detail_a,
            "photo_ref": detail_b,
        }),
    };
    Ok(PendingItem {
        id: row.get(0)?,
        kind,
        actor_name: row.get(2)?,
        summary: row.get(3)?,
        amount: amount_raw.and_then(|raw| Money::parse(&raw).ok()),
        currency: row.get(5)?,
        created_at: parse_ts(&created_at),
        status: row.get(7)?,
        payload_preview,
    })
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActionOutcome {
    Applied,
    Noop,
}

/// Approves or rejects one item. Repeating the settled outcome is a noop;
/// asking for the opposite is a state conflict.
pub fn act(
    session: &mut Session,
    actor: &str,
    kind: PendingKind,
    id: i64,
    decision: Decision,
    reason: Option<&str>,
) -> ModerationResult<ActionOutcome> {
    let table = match kind {
        PendingKind::Task => "tasks",
        PendingKind::Expense => "expenses",
    };
    let current: Option<String> = session
        .conn()
        .query_row(
            &format!("SELECT status FROM {table} WHERE id = ?1"),
            [id],
            |row| row.get(0),
        )
        .optional()?;
    let current = current.ok_or_else(|| {
        ModerationError::NotFound(format!("{} {id}", kind.as_str()))
    })?;

    let target = decision.target_status();
    let terminal = matches!(current.as_str(), "approved" | "rejected");
    if terminal {
        if current == target {
            crew_audit::append(
                session,
                actor,
                &decision.action(kind),
                kind.as_str(),
                Some(id),
                &serde_json::json!({"id": id, "reason": reason}),
                AuditOutcome::Noop,
                None,
            )?;
            session.queue_metric(
                decision.metric_kind(),
                serde_json::json!({"kind": kind.as_str(), "id": id, "noop": true}),
            );
            return Ok(ActionOutcome::Noop);
        }
        return Err(ModerationError::StaleState(format!(
            "{} {id} is already {current}",
            kind.as_str()
        )));
    }

    session.conn().execute(
        &format!("UPDATE {table} SET status = ?2 WHERE id = ?1"),
        rusqlite::params![id, target],
    )?;
    session.mark_mutation()?;
    crew_audit::append(
        session,
        actor,
        &decision.action(kind),
        kind.as_str(),
        Some(id),
        &serde_json::json!({"id": id, "reason": reason}),
        AuditOutcome::Applied,
        reason,
    )?;
    session.queue_metric(
        decision.metric_kind(),
        serde_json::json!({"kind": kind.as_str(), "id": id}),
    );
    Ok(ActionOutcome::Applied)
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct BulkItemRef {
    pub kind: PendingKind,
    pub id: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BulkItemError {
    pub code: String,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BulkItemResult {
    pub kind: PendingKind,
    pub id: i64,
    pub status: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<BulkItemError>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BulkOutcome {
    pub ok: usize,
    pub failed: usize,
    pub results: Vec<BulkItemResult>,
}

/// Processes a batch in one transaction. Per-item failures are data in the
/// result array; sibling items still commit. Every item leaves one audit
/// entry and one metric event.
pub fn bulk(
    session: &mut Session,
    actor: &str,
    decision: Decision,
    items: &[BulkItemRef],
    reason: Option<&str>,
) -> ModerationResult<BulkOutcome> {
    if items.is_empty() {
        return Err(ModerationError::Validation("items must not be empty".into()));
    }

    let mut results = Vec::with_capacity(items.len());
    let mut ok = 0;
    let mut failed = 0;
    for item in items {
        let savepoint = session.savepoint()?;
        match act(session, actor, item.kind, item.id, decision, reason) {
            Ok(outcome) => {
                session.release_savepoint(&savepoint)?;
                ok += 1;
                results.push(BulkItemResult {
                    kind: item.kind,
                    id: item.id,
                    status: match outcome {
                        ActionOutcome::Applied => "applied".into(),
                        ActionOutcome::Noop => "noop".into(),
                    },
                    error: None,
                });
            }
            Err(err @ (ModerationError::NotFound(_) | ModerationError::StaleState(_))) => {
                session.rollback_to_savepoint(&savepoint)?;
                let code = match &err {
                    ModerationError::NotFound(_) => "not_found",
                    _ => "stale_state",
                };
                crew_audit::append(
                    session,
                    actor,
                    &decision.action(item.kind),
                    item.kind.as_str(),
                    Some(item.id),
                    &serde_json::json!({"id": item.id, "reason": reason}),
                    AuditOutcome::Rejected,
                    Some(code),
                )?;
                session.queue_metric(
                    decision.metric_kind(),
                    serde_json::json!({
                        "kind": item.kind.as_str(),
                        "id": item.id,
                        "error": code,
                    }),
                );
                failed += 1;
                results.push(BulkItemResult {
                    kind: item.kind,
                    id: item.id,
                    status: "error".into(),
                    error: Some(BulkItemError {
                        code: code.into(),
                        message: err.to_string(),
                    }),
                });
            }
            // Infrastructure errors abort the whole batch.
            Err(err) => return Err(err),
        }
    }

    Ok(BulkOutcome {
        ok,
        failed,
        results,
    })
}

/// Re-priced detail view of one pending item for the bot.
#[derive(Debug, Clone, Serialize)]
pub struct ItemDetails {
    pub kind: PendingKind,
    pub id: i64,
    pub actor_name: String,
    pub status: String,
    pub currency: String,
    pub total: String,
    pub fmt_total: String,
    pub pricing_sha: String,
    pub rules_sha: String,
    pub steps: Vec<crew_pricing::PricingStep>,
}

pub fn item_details(
    session: &mut Session,
    pricing: &PricingEngine,
    kind: PendingKind,
    id: i64,
) -> ModerationResult<ItemDetails> {
    let details = match kind {
        PendingKind::Task => {
            let task = crew_worklog::tasks::get(session.conn(), id)
                .map_err(|_| ModerationError::NotFound(format!("task {id}")))?;
            let priced = pricing.price_task(&task.rate_code, task.qty)?;
            ItemDetails {
                kind,
                id,
                actor_name: task.worker,
                status: task.status.as_str().into(),
                currency: crew_money::CURRENCY_ILS.into(),
                total: priced.total_money().to_plain_string(),
                fmt_total: priced.total_money().format_ils(),
                pricing_sha: priced.pricing_sha,
                rules_sha: priced.rules_sha,
                steps: priced.steps,
            }
        }
        PendingKind::Expense => {
            let expense = crew_worklog::expenses::get(session.conn(), id)
                .map_err(|_| ModerationError::NotFound(format!("expense {id}")))?;
            let worker: String = session
                .conn()
                .query_row(
                    "SELECT name FROM users WHERE id = ?1",
                    [expense.worker_id],
                    |row| row.get(0),
                )
                .optional()?
                .unwrap_or_default();
            let priced = pricing.price_expense(&expense.category, expense.amount.amount())?;
            ItemDetails {
                kind,
                id,
                actor_name: worker,
                status: expense.status.as_str().into(),
                currency: expense.currency,
                total: priced.total_money().to_plain_string(),
                fmt_total: priced.total_money().format_ils(),
                pricing_sha: priced.pricing_sha,
                rules_sha: priced.rules_sha,
                steps: priced.steps,
            }
        }
    };
    session.queue_metric(
        "bot.item.details",
        serde_json::json!({"kind": kind.as_str(), "id": id}),
    );
    Ok(details)
}
