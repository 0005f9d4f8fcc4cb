#![deny(clippy::print_stdout, clippy::print_stderr)]

//! Invoice lifecycle: build from approved work, one-time preview tokens,
//! moderated change suggestions, and versioned applies.
//!
//! There is no delete anywhere in this module. Destructive intent is a
//! status transition, and the three destructive suggestion kinds are denied
//! twice (see [`guard`]).

use chrono::DateTime;
use chrono::NaiveDate;
use chrono::Utc;
use rusqlite::Connection;
use rusqlite::OptionalExtension;
use rust_decimal::Decimal;
use serde::Deserialize;
use serde::Serialize;
use thiserror::Error;

use crew_audit::AuditOutcome;
use crew_money::CURRENCY_ILS;
use crew_money::Money;
use crew_money::round2;
use crew_pricing::PricingEngine;
use crew_store::Session;
use crew_store::now_rfc3339;
use crew_store::parse_ts;

pub mod guard;
pub mod preview;
pub mod suggest;

pub use suggest::ApplyOutcome;
pub use suggest::Suggestion;
pub use suggest::SuggestionStatus;

pub type InvoiceResult<T> = Result<T, InvoiceError>;

#[derive(Debug, Error)]
pub enum InvoiceError {
    #[error("resource not found: {0}")]
    NotFound(String),
    #[error("state conflict: {0}")]
    StaleState(String),
    #[error("validation error: {0}")]
    Validation(String),
    #[error("operation {0} is forbidden")]
    ForbiddenOp(String),
    #[error("preview token already used")]
    Gone,
    #[error(transparent)]
    Pricing(#[from] crew_pricing::PricingError),
    #[error(transparent)]
    Money(#[from] crew_money::MoneyError),
    #[error("storage failure: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error(transparent)]
    Store(#[from] crew_store::StoreError),
    #[error(transparent)]
    Audit(#[from] crew_audit::AuditError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InvoiceStatus {
    Draft,
    Issued,
    Paid,
    Cancelled,
}

impl InvoiceStatus {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            InvoiceStatus::Draft => "draft",
            InvoiceStatus::Issued => "issued",
            InvoiceStatus::Paid => "paid",
            InvoiceStatus::Cancelled => "cancelled",
        }
    }

    #[must_use]
    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "draft" => Some(InvoiceStatus::Draft),
            "issued" => Some(InvoiceStatus::Issued),
            "paid" => Some(InvoiceStatus::Paid),
            "cancelled" => Some(InvoiceStatus::Cancelled),
            _ => None,
        }
    }

    #[must_use]
    pub fn is_terminal(&self) -> bool {
        matches!(self, InvoiceStatus::Paid | InvoiceStatus::Cancelled)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Invoice {
    pub id: i64,
    pub client_id: i64,
    pub period_from: NaiveDate,
    pub period_to: NaiveDate,
    pub currency: String,
    pub subtotal: Money,
    pub tax: Money,
    pub total: Money,
    pub status: InvoiceStatus,
    pub version: i64,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InvoiceItem {
    pub id: i64,
    pub invoice_id: i64,
    pub item_type: String,
    pub description: String,
    pub quantity: Decimal,
    pub unit_price: Money,
    pub amount: Money,
    pub worker: Option<String>,
    pub site: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct RenderedInvoice {
    pub invoice: Invoice,
    pub items: Vec<InvoiceItem>,
    pub fmt_subtotal: String,
    pub fmt_total: String,
}

/// Assembles the invoice for a client and period from approved tasks and
/// expenses. Idempotent on `(client_id, period_from, period_to)`: a second
/// build returns the stored invoice untouched.
pub fn build(
    session: &mut Session,
    pricing: &PricingEngine,
    actor: &str,
    client_id: i64,
    period_from: NaiveDate,
    period_to: NaiveDate,
    currency: Option<&str>,
) -> InvoiceResult<Invoice> {
    if let Some(currency) = currency
        && currency != CURRENCY_ILS
    {
        return Err(InvoiceError::Validation(format!(
            "currency must be {CURRENCY_ILS}, got {currency}"
        )));
    }
    if period_to < period_from {
        return Err(InvoiceError::Validation(
            "period_to must not precede period_from".into(),
        ));
    }
    let client_exists: i64 = session.conn().query_row(
        "SELECT COUNT(*) FROM clients WHERE id = ?1",
        [client_id],
        |row| row.get(0),
    )?;
    if client_exists == 0 {
        return Err(InvoiceError::NotFound(format!("client {client_id}")));
    }

    let from_raw = period_from.format("%Y-%m-%d").to_string();
    let to_raw = period_to.format("%Y-%m-%d").to_string();
    if let Some(existing) = find_by_scope(session.conn(), client_id, &from_raw, &to_raw)? {
        return Ok(existing);
    }

    // Approved tasks on this client's shifts within the period.
    let mut task_rows = Vec::new();
    {
        let mut stmt = session.conn().prepare(
            "SELECT t.rate_code, t.qty, t.worker, s.work_address
             FROM tasks t
             JOIN shifts s ON s.id = t.shift_id
             WHERE s.client_id = ?1
               AND t.status = 'approved'
               AND date(t.created_at) >= date(?2)
               AND date(t.created_at) <= date(?3)
             ORDER BY t.id",
        )?;
        let rows = stmt.query_map(
            rusqlite::params![client_id, from_raw, to_raw],
            |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, Option<String>>(3)?,
                ))
            },
        )?;
        for row in rows {
            task_rows.push(row?);
        }
    }

    let mut expense_rows = Vec::new();
    {
        let mut stmt = session.conn().prepare(
            "SELECT e.category, e.amount, u.name, s.work_address
             FROM expenses e
             JOIN shifts s ON s.id = e.shift_id
             JOIN users u ON u.id = e.worker_id
             WHERE s.client_id = ?1
               AND e.status = 'approved'
               AND e.date >= ?2
               AND e.date <= ?3
             ORDER BY e.id",
        )?;
        let rows = stmt.query_map(
            rusqlite::params![client_id, from_raw, to_raw],
            |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, Option<String>>(3)?,
                ))
            },
        )?;
        for row in rows {
            expense_rows.push(row?);
        }
    }

    struct NewItem {
        item_type: &'static str,
        description: String,
        quantity: Decimal,
        unit_price: Money,
        amount: Money,
        worker: Option<String>,
        site: Option<String>,
    }

    let mut items = Vec::new();
    for (rate_code, qty_raw, worker, site) in task_rows {
        let qty: Decimal = qty_raw
            .parse()
            .map_err(|_| InvoiceError::Validation(format!("bad qty {qty_raw}")))?;
        let unit_price = Money::new(pricing.price_task(&rate_code, Decimal::ONE)?.total);
        let amount = unit_price.checked_mul_qty(qty)?;
        items.push(NewItem {
            item_type: "task",
            description: rate_code,
            quantity: qty,
            unit_price,
            amount,
            worker: Some(worker),
            site,
        });
    }
    for (category, amount_raw, worker, site) in expense_rows {
        let amount = Money::parse(&amount_raw)?;
        items.push(NewItem {
            item_type: "expense",
            description: category,
            quantity: Decimal::ONE,
            unit_price: amount,
            amount,
            worker: Some(worker),
            site,
        });
    }

    let subtotal = Money::sum(items.iter().map(|item| item.amount))?;
    let tax = Money::ZERO;
    let total = subtotal.checked_add(tax)?;

    session.conn().execute(
        "INSERT INTO invoices (client_id, period_from, period_to, currency, subtotal, tax, total, status, version, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, 'draft', 1, ?8)",
        rusqlite::params![
            client_id,
            from_raw,
            to_raw,
            CURRENCY_ILS,
            subtotal.to_plain_string(),
            tax.to_plain_string(),
            total.to_plain_string(),
            now_rfc3339(),
        ],
    )?;
    let invoice_id = session.conn().last_insert_rowid();
    for item in &items {
        session.conn().execute(
            "INSERT INTO invoice_items (invoice_id, item_type, description, quantity, unit_price, amount, worker, site)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            rusqlite::params![
                invoice_id,
                item.item_type,
                item.description,
                item.quantity.to_string(),
                item.unit_price.to_plain_string(),
                item.amount.to_plain_string(),
                item.worker,
                item.site,
            ],
        )?;
    }

    session.mark_mutation()?;
    crew_audit::append(
        session,
        actor,
        "invoice.build",
        "invoice",
        Some(invoice_id),
        &serde_json::json!({
            "client_id": client_id,
            "period_from": from_raw,
            "period_to": to_raw,
            "items": items.len(),
            "total": total.to_plain_string(),
        }),
        AuditOutcome::Applied,
        None,
    )?;
    session.queue_metric(
        "invoice.build",
        serde_json::json!({"invoice_id": invoice_id, "items": items.len()}),
    );
    get(session.conn(), invoice_id)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransitionOutcome {
    Applied,
    Noop,
}

/// `draft -> issued -> paid`, with `cancelled` reachable from any
/// non-terminal state. Re-entering the current state is a noop.
pub fn transition(
    session: &mut Session,
    actor: &str,
    invoice_id: i64,
    target: InvoiceStatus,
) -> InvoiceResult<(Invoice, TransitionOutcome)> {
    let invoice = get(session.conn(), invoice_id)?;
    let action = match target {
        InvoiceStatus::Issued => "invoice.issue",
        InvoiceStatus::Paid => "invoice.pay",
        InvoiceStatus::Cancelled => "invoice.cancel",
        InvoiceStatus::Draft => {
            return Err(InvoiceError::Validation(
                "an invoice cannot return to draft".into(),
            ));
        }
    };

    if invoice.status == target {
        crew_audit::append(
            session,
            actor,
            action,
            "invoice",
            Some(invoice_id),
            &serde_json::json!({"status": target.as_str()}),
            AuditOutcome::Noop,
            None,
        )?;
        session.queue_metric(
            "invoice.status",
            serde_json::json!({"invoice_id": invoice_id, "status": target.as_str(), "noop": true}),
        );
        return Ok((invoice, TransitionOutcome::Noop));
    }

    let allowed = match (invoice.status, target) {
        (InvoiceStatus::Draft, InvoiceStatus::Issued)
        | (InvoiceStatus::Issued, InvoiceStatus::Paid) => true,
        (from, InvoiceStatus::Cancelled) => !from.is_terminal(),
        _ => false,
    };
    if !allowed {
        return Err(InvoiceError::StaleState(format!(
            "invoice {invoice_id} cannot move {} -> {}",
            invoice.status.as_str(),
            target.as_str()
        )));
    }

    session.conn().execute(
        "UPDATE invoices SET status = ?2 WHERE id = ?1",
        rusqlite::params![invoice_id, target.as_str()],
    )?;
    session.mark_mutation()?;
    crew_audit::append(
        session,
        actor,
        action,
        "invoice",
        Some(invoice_id),
        &serde_json::json!({"from": invoice.status.as_str(), "to": target.as_str()}),
        AuditOutcome::Applied,
        None,
    )?;
    session.queue_metric(
        "invoice.status",
        serde_json::json!({"invoice_id": invoice_id, "status": target.as_str()}),
    );
    let updated = get(session.conn(), invoice_id)?;
    Ok((updated, TransitionOutcome::Applied))
}

pub fn get(conn: &Connection, invoice_id: i64) -> InvoiceResult<Invoice> {
    conn.query_row(
        "SELECT id, client_id, period_from, period_to, currency, subtotal, tax, total, status, version, created_at
         FROM invoices WHERE id = ?1",
        [invoice_id],
        map_invoice,
    )
    .optional()?
    .ok_or_else(|| InvoiceError::NotFound(format!("invoice {invoice_id}")))
}

pub fn items(conn: &Connection, invoice_id: i64) -> InvoiceResult<Vec<InvoiceItem>> {
    let mut stmt = conn.prepare(
        "SELECT id, invoice_id, item_type, description, quantity, unit_price, amount, worker, site
         FROM invoice_items WHERE invoice_id = ?1 ORDER BY id",
    )?;
    let items = stmt
        .query_map([invoice_id], map_item)?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(items)
}

pub fn render(conn: &Connection, invoice_id: i64) -> InvoiceResult<RenderedInvoice> {
    let invoice = get(conn, invoice_id)?;
    let items = items(conn, invoice_id)?;
    Ok(RenderedInvoice {
        fmt_subtotal: invoice.subtotal.format_ils(),
        fmt_total: invoice.total.format_ils(),
        invoice,
        items,
    })
}

fn find_by_scope(
    conn: &Connection,
    client_id: i64,
    from_raw: &str,
    to_raw: &str,
) -> InvoiceResult<Option<Invoice>> {
    Ok(conn
        .query_row(
            "SELECT id, client_id, period_from, period_to, currency, subtotal, tax, total, status, version, created_at
             FROM invoices WHERE client_id = ?1 AND period_from = ?2 AND period_to = ?3",
            rusqlite::params![client_id, from_raw, to_raw],
            map_invoice,
        )
        .optional()?)
}

/// Recomputes subtotal and total from the item rows. Called inside apply.
pub(crate) fn reprice_totals(session: &Session, invoice_id: i64) -> InvoiceResult<(Money, Money)> {
    let amounts: Vec<String> = {
        let mut stmt = session
            .conn()
            .prepare("SELECT amount FROM invoice_items WHERE invoice_id = ?1")?;
        let rows = stmt.query_map([invoice_id], |row| row.get(0))?;
        rows.collect::<Result<_, _>>()?
    };
    let mut subtotal = Money::ZERO;
    for raw in amounts {
        subtotal = subtotal.checked_add(Money::parse(&raw)?)?;
    }
    let tax: Money = {
        let raw: String = session.conn().query_row(
            "SELECT tax FROM invoices WHERE id = ?1",
            [invoice_id],
            |row| row.get(0),
        )?;
        Money::parse(&raw)?
    };
    let total = subtotal.checked_add(tax)?;
    session.conn().execute(
        "UPDATE invoices SET subtotal = ?2, total = ?3 WHERE id = ?1",
        rusqlite::params![
            invoice_id,
            subtotal.to_plain_string(),
            total.to_plain_string()
        ],
    )?;
    Ok((subtotal, total))
}

pub(crate) fn round_amount(quantity: Decimal, unit_price: Money) -> Money {
    Money::new(round2(quantity * unit_price.amount()))
}

fn map_invoice(row: &rusqlite::Row<'_>) -> rusqlite::Result<Invoice> {
    let from_raw: String = row.get(2)?;
    let to_raw: String = row.get(3)?;
    let subtotal: String = row.get(5)?;
    let tax: String = row.get(6)?;
    let total: String = row.get(7)?;
    let status_raw: String = row.get(8)?;
    let created_at: String = row.get(10)?;
    Ok(Invoice {
        id: row.get(0)?,
        client_id: row.get(1)?,
        period_from: NaiveDate::parse_from_str(&from_raw, "%Y-%m-%d")
            .unwrap_or_else(|_| Utc::now().date_naive()),
        period_to: NaiveDate::parse_from_str(&to_raw, "%Y-%m-%d")
            .unwrap_or_else(|_| Utc::now().date_naive()),
        currency: row.get(4)?,
        subtotal: Money::parse(&subtotal).unwrap_or(Money::ZERO),
        tax: Money::parse(&tax).unwrap_or(Money::ZERO),
        total: Money::parse(&total).unwrap_or(Money::ZERO),
        status: InvoiceStatus::parse(&status_raw).unwrap_or(InvoiceStatus::Draft),
        version: row.get(9)?,
        created_at: parse_ts(&created_at),
    })
}

fn map_item(row: &rusqlite::Row<'_>) -> rusqlite::Result<InvoiceItem> {
    let quantity: String = row.get(4)?;
    let unit_price: String = row.get(5)?;
    let amount: String = row.get(6)?;
    Ok(InvoiceItem {
        id: row.get(0)?,
        invoice_id: row.get(1)?,
        item_type: row.get(2)?,
        description: row.get(3)?,
        quantity: quantity.parse().unwrap_or_default(),
        unit_price: Money::parse(&unit_price).unwrap_or(Money::ZERO),
        amount: Money::parse(&amount).unwrap_or(Money::ZERO),
        worker: row.get(7)?,
        site: row.get(8)?,
    })
}

#[cfg(test)]
mod tests;
