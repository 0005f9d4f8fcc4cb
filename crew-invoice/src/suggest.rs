//! Change suggestions and their transactional apply.
//!
//! Layer one of the guard runs here before any row is written; layer two
//! re-checks every referenced row inside the apply transaction and blocks
//! the whole batch on a single forbidden kind.

use chrono::DateTime;
use chrono::Utc;
use rusqlite::Connection;
use rusqlite::OptionalExtension;
use rust_decimal::Decimal;
use serde::Deserialize;
use serde::Serialize;

use crew_audit::AuditOutcome;
use crew_money::Money;
use crew_money::canonical_json;
use crew_money::sha256_hex;
use crew_store::Session;
use crew_store::now_rfc3339;
use crew_store::parse_ts;

use crate::InvoiceError;
use crate::InvoiceResult;
use crate::guard;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SuggestionStatus {
    Open,
    Applied,
    Rejected,
}

impl SuggestionStatus {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            SuggestionStatus::Open => "open",
            SuggestionStatus::Applied => "applied",
            SuggestionStatus::Rejected => "rejected",
        }
    }

    #[must_use]
    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "open" => Some(SuggestionStatus::Open),
            "applied" => Some(SuggestionStatus::Applied),
            "rejected" => Some(SuggestionStatus::Rejected),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Suggestion {
    pub id: i64,
    pub invoice_id: i64,
    pub kind: String,
    pub payload: serde_json::Value,
    pub status: SuggestionStatus,
    pub created_at: DateTime<Utc>,
}

/// Layer one. A forbidden kind is denied with an audit entry and a
/// `suggest.forbidden` metric before any suggestion row exists; the caller
/// commits the session so the denial trail survives the 403.
pub fn suggest_change(
    session: &mut Session,
    actor: &str,
    invoice_id: i64,
    kind: &str,
    payload: serde_json::Value,
) -> InvoiceResult<Suggestion> {
    crate::get(session.conn(), invoice_id)?;

    if guard::is_forbidden(kind) {
        crew_audit::append(
            session,
            actor,
            "invoice.suggest_change",
            "invoice",
            Some(invoice_id),
            &serde_json::json!({"kind": kind, "payload": payload}),
            AuditOutcome::Rejected,
            Some(&guard::denial_reason(kind)),
        )?;
        session.queue_metric(
            "suggest.forbidden",
            serde_json::json!({"invoice_id": invoice_id, "kind": kind}),
        );
        return Err(InvoiceError::ForbiddenOp(kind.into()));
    }
    if !guard::is_allowed(kind) {
        return Err(InvoiceError::Validation(format!(
            "unknown suggestion kind {kind}"
        )));
    }

    session.conn().execute(
        "INSERT INTO invoice_suggestions (invoice_id, kind, payload_json, status, created_at)
         VALUES (?1, ?2, ?3, 'open', ?4)",
        rusqlite::params![invoice_id, kind, payload.to_string(), now_rfc3339()],
    )?;
    let suggestion_id = session.conn().last_insert_rowid();
    session.mark_mutation()?;
    crew_audit::append(
        session,
        actor,
        "invoice.suggest_change",
        "suggestion",
        Some(suggestion_id),
        &serde_json::json!({"invoice_id": invoice_id, "kind": kind, "payload": payload}),
        AuditOutcome::Applied,
        None,
    )?;
    session.queue_metric(
        "invoice.suggest",
        serde_json::json!({"invoice_id": invoice_id, "kind": kind}),
    );
    get(session.conn(), suggestion_id)
}

#[derive(Debug, Clone, Serialize)]
pub struct ApplyOutcome {
    pub applied: Vec<i64>,
    pub new_version: i64,
}

/// Layer two and the apply itself. All-or-nothing: a forbidden or missing
/// row rejects the batch, otherwise every suggestion mutates the items, the
/// totals recompute, the version bumps once, and a version row pins the
/// canonical diff.
pub fn apply_suggestions(
    session: &mut Session,
    actor: &str,
    invoice_id: i64,
    suggestion_ids: &[i64],
) -> InvoiceResult<ApplyOutcome> {
    if suggestion_ids.is_empty() {
        return Err(InvoiceError::Validation(
            "suggestion_ids must not be empty".into(),
        ));
    }
    let invoice = crate::get(session.conn(), invoice_id)?;
    if invoice.status.is_terminal() {
        return Err(InvoiceError::StaleState(format!(
            "invoice {invoice_id} is {}",
            invoice.status.as_str()
        )));
    }

    let mut loaded = Vec::with_capacity(suggestion_ids.len());
    for id in suggestion_ids {
        let suggestion = get(session.conn(), *id)?;
        if suggestion.invoice_id != invoice_id {
            return Err(InvoiceError::Validation(format!(
                "suggestion {id} does not belong to invoice {invoice_id}"
            )));
        }
        loaded.push(suggestion);
    }

    let forbidden: Vec<&Suggestion> = loaded
        .iter()
        .filter(|suggestion| guard::is_forbidden(&suggestion.kind))
        .collect();
    if !forbidden.is_empty() {
        for suggestion in &forbidden {
            crew_audit::append(
                session,
                actor,
                "invoice.apply_suggestions",
                "suggestion",
                Some(suggestion.id),
                &serde_json::json!({"invoice_id": invoice_id, "kind": suggestion.kind}),
                AuditOutcome::Rejected,
                Some(&guard::denial_reason(&suggestion.kind)),
            )?;
        }
        session.queue_metric(
            "suggest.apply_blocked",
            serde_json::json!({
                "invoice_id": invoice_id,
                "kinds": forbidden.iter().map(|s| s.kind.clone()).collect::<Vec<_>>(),
            }),
        );
        return Err(InvoiceError::ForbiddenOp(
            forbidden
                .first()
                .map(|suggestion| suggestion.kind.clone())
                .unwrap_or_default(),
        ));
    }

    for suggestion in &loaded {
        if suggestion.status != SuggestionStatus::Open {
            return Err(InvoiceError::StaleState(format!(
                "suggestion {} is {}",
                suggestion.id,
                suggestion.status.as_str()
            )));
        }
    }

    for suggestion in &loaded {
        apply_one(session, invoice_id, suggestion)?;
        session.conn().execute(
            "UPDATE invoice_suggestions SET status = 'applied' WHERE id = ?1",
            [suggestion.id],
        )?;
    }

    let (subtotal, total) = crate::reprice_totals(session, invoice_id)?;
    let new_version = invoice.version + 1;
    session.conn().execute(
        "UPDATE invoices SET version = ?2 WHERE id = ?1",
        rusqlite::params![invoice_id, new_version],
    )?;

    let diff = serde_json::json!({
        "from_version": invoice.version,
        "to_version": new_version,
        "applied": loaded
            .iter()
            .map(|suggestion| {
                serde_json::json!({
                    "id": suggestion.id,
                    "kind": suggestion.kind,
                    "payload": suggestion.payload,
                })
            })
            .collect::<Vec<_>>(),
        "subtotal": subtotal.to_plain_string(),
        "total": total.to_plain_string(),
    });
    let diff_canonical = canonical_json(&diff);
    let sha = sha256_hex(diff_canonical.as_bytes());
    session.conn().execute(
        "INSERT INTO invoice_versions (invoice_id, version, diff_json, sha, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5)",
        rusqlite::params![invoice_id, new_version, diff_canonical, sha, now_rfc3339()],
    )?;

    session.mark_mutation()?;
    crew_audit::append(
        session,
        actor,
        "invoice.apply_suggestions",
        "invoice",
        Some(invoice_id),
        &diff,
        AuditOutcome::Applied,
        None,
    )?;
    session.queue_metric(
        "invoice.apply",
        serde_json::json!({"invoice_id": invoice_id, "new_version": new_version}),
    );

    Ok(ApplyOutcome {
        applied: loaded.iter().map(|suggestion| suggestion.id).collect(),
        new_version,
    })
}

fn apply_one(
    session: &Session,
    invoice_id: i64,
    suggestion: &Suggestion,
) -> InvoiceResult<()> {
    match suggestion.kind.as_str() {
        "add_item" => {
            let payload: AddItemPayload = parse_payload(&suggestion.payload)?;
            let amount = crate::round_amount(payload.quantity, payload.unit_price);
            session.conn().execute(
                "INSERT INTO invoice_items (invoice_id, item_type, description, quantity, unit_price, amount, worker, site)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
                rusqlite::params![
                    invoice_id,
                    payload.item_type.unwrap_or_else(|| "manual".into()),
                    payload.description,
                    payload.quantity.to_string(),
                    payload.unit_price.to_plain_string(),
                    amount.to_plain_string(),
                    payload.worker,
                    payload.site,
                ],
            )?;
        }
        "update_item" => {
            let payload: UpdateItemPayload = parse_payload(&suggestion.payload)?;
            let item = item_of_invoice(session.conn(), invoice_id, payload.item_id)?;
            let quantity = payload.quantity.unwrap_or(item.quantity);
            let unit_price = payload.unit_price.unwrap_or(item.unit_price);
            let description = payload.description.unwrap_or(item.description);
            let amount = crate::round_amount(quantity, unit_price);
            session.conn().execute(
                "UPDATE invoice_items SET description = ?2, quantity = ?3, unit_price = ?4, amount = ?5
                 WHERE id = ?1",
                rusqlite::params![
                    payload.item_id,
                    description,
                    quantity.to_string(),
                    unit_price.to_plain_string(),
                    amount.to_plain_string(),
                ],
            )?;
        }
        "update_description" => {
            let payload: UpdateDescriptionPayload = parse_payload(&suggestion.payload)?;
            item_of_invoice(session.conn(), invoice_id, payload.item_id)?;
            session.conn().execute(
                "UPDATE invoice_items SET description = ?2 WHERE id = ?1",
                rusqlite::params![payload.item_id, payload.description],
            )?;
        }
        other => {
            return Err(InvoiceError::Validation(format!(
                "unknown suggestion kind {other}"
            )));
        }
    }
    Ok(())
}

#[derive(Debug, Deserialize)]
struct AddItemPayload {
    #[serde(default)]
    item_type: Option<String>,
    description: String,
    quantity: Decimal,
    unit_price: Money,
    #[serde(default)]
    worker: Option<String>,
    #[serde(default)]
    site: Option<String>,
}

#[derive(Debug, Deserialize)]
struct UpdateItemPayload {
    item_id: i64,
    #[serde(default)]
    quantity: Option<Decimal>,
    #[serde(default)]
    unit_price: Option<Money>,
    #[serde(default)]
    description: Option<String>,
}

#[derive(Debug, Deserialize)]
struct UpdateDescriptionPayload {
    item_id: i64,
    description: String,
}

fn parse_payload<T: serde::de::DeserializeOwned>(payload: &serde_json::Value) -> InvoiceResult<T> {
    serde_json::from_value(payload.clone())
        .map_err(|err| InvoiceError::Validation(format!("bad suggestion payload: {err}")))
}

fn item_of_invoice(
    conn: &Connection,
    invoice_id: i64,
    item_id: i64,
) -> InvoiceResult<crate::InvoiceItem> {
    let items = crate::items(conn, invoice_id)?;
    items
        .into_iter()
        .find(|item| item.id == item_id)
        .ok_or_else(|| {
            InvoiceError::NotFound(format!("item {item_id} on invoice {invoice_id}"))
        })
}

pub fn get(conn: &Connection, suggestion_id: i64) -> InvoiceResult<Suggestion> {
    conn.query_row(
        "SELECT id, invoice_id, kind, payload_json, status, created_at
         FROM invoice_suggestions WHERE id = ?1",
        [suggestion_id],
        map_suggestion,
    )
    .optional()?
    .ok_or_else(|| InvoiceError::NotFound(format!("suggestion {suggestion_id}")))
}

fn map_suggestion(row: &rusqlite::Row<'_>) -> rusqlite::Result<Suggestion> {
    let payload_raw: String = row.get(3)?;
    let status_raw: String = row.get(4)?;
    let created_at: String = row.get(5)?;
    Ok(Suggestion {
        id: row.get(0)?,
        invoice_id: row.get(1)?,
        kind: row.get(2)?,
        payload: serde_json::from_str(&payload_raw).unwrap_or(serde_json::Value::Null),
        status: SuggestionStatus::parse(&status_raw).unwrap_or(SuggestionStatus::Open),
        created_at: parse_ts(&created_at),
    })
}
