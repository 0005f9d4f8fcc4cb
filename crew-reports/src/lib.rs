#![deny(clippy::print_stdout, clippy::print_stderr)]

//! CSV exports and period reports.
//!
//! Every CSV starts with a UTF-8 BOM, uses CRLF line endings and RFC 4180
//! quoting, and renders its monetary column through the money engine.
//! Filtered exports enforce a hard row cap before a single byte of file is
//! produced.

use chrono::Datelike;
use chrono::NaiveDate;
use csv::Terminator;
use csv::WriterBuilder;
use rusqlite::Connection;
use serde::Deserialize;
use serde::Serialize;
use thiserror::Error;

use crew_money::Money;

pub const EXPORT_ROW_LIMIT: u64 = 10_000;

const UTF8_BOM: &[u8] = &[0xEF, 0xBB, 0xBF];

pub type ReportResult<T> = Result<T, ReportError>;

#[derive(Debug, Error)]
pub enum ReportError {
    #[error("resource not found: {0}")]
    NotFound(String),
    #[error("validation error: {0}")]
    Validation(String),
    #[error("export matches {total} rows, limit is {EXPORT_ROW_LIMIT}")]
    ExportLimitExceeded { total: u64 },
    #[error("storage failure: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("csv encoding failure: {0}")]
    Csv(#[from] csv::Error),
    #[error("csv buffer failure: {0}")]
    Buffer(String),
}

fn csv_writer() -> csv::Writer<Vec<u8>> {
    let mut buffer = Vec::new();
    buffer.extend_from_slice(UTF8_BOM);
    WriterBuilder::new()
        .terminator(Terminator::CRLF)
        .from_writer(buffer)
}

fn finish(writer: csv::Writer<Vec<u8>>) -> ReportResult<Vec<u8>> {
    writer
        .into_inner()
        .map_err(|err| ReportError::Buffer(err.to_string()))
}

/// Month boundaries for a `YYYY-MM` input.
fn month_bounds(month: &str) -> ReportResult<(String, String)> {
    let first = NaiveDate::parse_from_str(&format!("{month}-01"), "%Y-%m-%d")
        .map_err(|_| ReportError::Validation(format!("month must be YYYY-MM, got {month}")))?;
    let next = if first.month() == 12 {
        NaiveDate::from_ymd_opt(first.year() + 1, 1, 1)
    } else {
        NaiveDate::from_ymd_opt(first.year(), first.month() + 1, 1)
    }
    .ok_or_else(|| ReportError::Validation(format!("month out of range: {month}")))?;
    let last = next - chrono::Duration::days(1);
    Ok((
        first.format("%Y-%m-%d").to_string(),
        last.format("%Y-%m-%d").to_string(),
    ))
}

/// Approved work for one month across all clients, one line per task or
/// expense.
pub fn monthly_csv(conn: &Connection, month: &str) -> ReportResult<Vec<u8>> {
    let (from, to) = month_bounds(month)?;

    let mut writer = csv_writer();
    writer.write_record([
        "date", "kind", "worker", "client", "description", "amount", "amount_fmt",
    ])?;

    let mut stmt = conn.prepare(
        "SELECT date(t.created_at) AS day, 'task' AS kind, t.worker, COALESCE(c.name, ''),
                t.rate_code, t.amount
         FROM tasks t
         JOIN shifts s ON s.id = t.shift_id
         LEFT JOIN clients c ON c.id = s.client_id
         WHERE t.status = 'approved' AND date(t.created_at) >= date(?1) AND date(t.created_at) <= date(?2)
         UNION ALL
         SELECT e.date, 'expense', u.name, COALESCE(c.name, ''),
                e.category, e.amount
         FROM expenses e
         JOIN users u ON u.id = e.worker_id
         LEFT JOIN shifts s ON s.id = e.shift_id
         LEFT JOIN clients c ON c.id = s.client_id
         WHERE e.status = 'approved' AND e.date >= ?1 AND e.date <= ?2
         ORDER BY day, kind",
    )?;
    let rows = stmt.query_map(rusqlite::params![from, to], |row| {
        Ok((
            row.get::<_, String>(0)?,
            row.get::<_, String>(1)?,
            row.get::<_, String>(2)?,
            row.get::<_, String>(3)?,
            row.get::<_, String>(4)?,
            row.get::<_, String>(5)?,
        ))
    })?;
    for row in rows {
        let (day, kind, worker, client, description, amount_raw) = row?;
        let amount = Money::parse(&amount_raw).unwrap_or(Money::ZERO);
        writer.write_record([
            day,
            kind,
            worker,
            client,
            description,
            amount.to_plain_string(),
            amount.format_ils(),
        ])?;
    }
    finish(writer)
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ExpenseExportFilter {
    pub worker: Option<String>,
    pub category: Option<String>,
    pub status: Option<String>,
    pub date_from: Option<String>,
    pub date_to: Option<String>,
}

const EXPENSE_WHERE: &str = "
FROM expenses e
JOIN users u ON u.id = e.worker_id
WHERE (:worker IS NULL OR instr(lower(u.name), lower(:worker)) > 0)
  AND (:category IS NULL OR e.category = :category)
  AND (:status IS NULL OR e.status = :status)
  AND (:date_from IS NULL OR e.date >= :date_from)
  AND (:date_to IS NULL OR e.date <= :date_to)
";

/// Filtered expense export, capped at [`EXPORT_ROW_LIMIT`] rows.
pub fn export_expenses_csv(
    conn: &Connection,
    filter: &ExpenseExportFilter,
) -> ReportResult<Vec<u8>> {
    let params = rusqlite::named_params! {
        ":worker": filter.worker,
        ":category": filter.category,
        ":status": filter.status,
        ":date_from": filter.date_from,
        ":date_to": filter.date_to,
    };
    let total: u64 = conn.query_row(
        &format!("SELECT COUNT(*) {EXPENSE_WHERE}"),
        params,
        |row| row.get::<_, i64>(0).map(|count| count as u64),
    )?;
    if total > EXPORT_ROW_LIMIT {
        return Err(ReportError::ExportLimitExceeded { total });
    }

    let mut writer = csv_writer();
    writer.write_record([
        "id",
        "date",
        "worker",
        "category",
        "amount",
        "amount_fmt",
        "currency",
        "status",
        "ocr_status",
        "photo_ref",
    ])?;
    let mut stmt = conn.prepare(&format!(
        "SELECT e.id, e.date, u.name, e.category, e.amount, e.currency, e.status, e.ocr_status, e.photo_ref
         {EXPENSE_WHERE} ORDER BY e.id"
    ))?;
    let rows = stmt.query_map(params, |row| {
        Ok((
            row.get::<_, i64>(0)?,
            row.get::<_, String>(1)?,
            row.get::<_, String>(2)?,
            row.get::<_, String>(3)?,
            row.get::<_, String>(4)?,
            row.get::<_, String>(5)?,
            row.get::<_, String>(6)?,
            row.get::<_, String>(7)?,
            row.get::<_, Option<String>>(8)?,
        ))
    })?;
    for row in rows {
        let (id, date, worker, category, amount_raw, currency, status, ocr, photo) = row?;
        let amount = Money::parse(&amount_raw).unwrap_or(Money::ZERO);
        writer.write_record([
            id.to_string(),
            date,
            worker,
            category,
            amount.to_plain_string(),
            amount.format_ils(),
            currency,
            status,
            ocr,
            photo.unwrap_or_default(),
        ])?;
    }
    finish(writer)
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct InvoiceExportFilter {
    pub client_id: Option<i64>,
    pub status: Option<String>,
    pub period_from: Option<String>,
    pub period_to: Option<String>,
}

const INVOICE_WHERE: &str = "
FROM invoices i
JOIN clients c ON c.id = i.client_id
WHERE (:client_id IS NULL OR i.client_id = :client_id)
  AND (:status IS NULL OR i.status = :status)
  AND (:period_from IS NULL OR i.period_from >= :period_from)
  AND (:period_to IS NULL OR i.period_to <= :period_to)
";

/// Filtered invoice export, capped at [`EXPORT_ROW_LIMIT`] rows.
pub fn export_invoices_csv(
    conn: &Connection,
    filter: &InvoiceExportFilter,
) -> ReportResult<Vec<u8>> {
    let params = rusqlite::named_params! {
        ":client_id": filter.client_id,
        ":status": filter.status,
        ":period_from": filter.period_from,
        ":period_to": filter.period_to,
    };
    let total: u64 = conn.query_row(
        &format!("SELECT COUNT(*) {INVOICE_WHERE}"),
        params,
        |row| row.get::<_, i64>(0).map(|count| count as u64),
    )?;
    if total > EXPORT_ROW_LIMIT {
        return Err(ReportError::ExportLimitExceeded { total });
    }

    let mut writer = csv_writer();
    writer.write_record([
        "id",
        "client",
        "period_from",
        "period_to",
        "status",
        "version",
        "subtotal",
        "tax",
        "total",
        "total_fmt",
        "currency",
    ])?;
    let mut stmt = conn.prepare(&format!(
        "SELECT i.id, c.name, i.period_from, i.period_to, i.status, i.version, i.subtotal, i.tax, i.total, i.currency
         {INVOICE_WHERE} ORDER BY i.id"
    ))?;
    let rows = stmt.query_map(params, |row| {
        Ok((
            row.get::<_, i64>(0)?,
            row.get::<_, String>(1)?,
            row.get::<_, String>(2)?,
            row.get::<_, String>(3)?,
            row.get::<_, String>(4)?,
            row.get::<_, i64>(5)?,
            row.get::<_, String>(6)?,
            row.get::<_, String>(7)?,
            row.get::<_, String>(8)?,
            row.get::<_, String>(9)?,
        ))
    })?;
    for row in rows {
        let (id, client, from, to, status, version, subtotal_raw, tax_raw, total_raw, currency) =
            row?;
        let subtotal = Money::parse(&subtotal_raw).unwrap_or(Money::ZERO);
        let tax = Money::parse(&tax_raw).unwrap_or(Money::ZERO);
        let total = Money::parse(&total_raw).unwrap_or(Money::ZERO);
        writer.write_record([
            id.to_string(),
            client,
            from,
            to,
            status,
            version.to_string(),
            subtotal.to_plain_string(),
            tax.to_plain_string(),
            total.to_plain_string(),
            total.format_ils(),
            currency,
        ])?;
    }
    finish(writer)
}

/// Per-worker period summary for foremen and admins.
#[derive(Debug, Clone, Serialize)]
pub struct WorkerReport {
    pub user_id: i64,
    pub name: String,
    pub from: Option<String>,
    pub to: Option<String>,
    pub shift_count: u64,
    pub task_count: u64,
    pub expense_count: u64,
    pub approved_task_total: Money,
    pub approved_expense_total: Money,
    pub fmt_task_total: String,
    pub fmt_expense_total: String,
}

pub fn worker_report(
    conn: &Connection,
    user_id: i64,
    from: Option<&str>,
    to: Option<&str>,
) -> ReportResult<WorkerReport> {
    let name: String = conn
        .query_row("SELECT name FROM users WHERE id = ?1", [user_id], |row| {
            row.get(0)
        })
        .map_err(|_| ReportError::NotFound(format!("user {user_id}")))?;

    let shift_count: i64 = conn.query_row(
        "SELECT COUNT(*) FROM shifts
         WHERE user_id = :user
           AND (:from IS NULL OR date(created_at) >= date(:from))
           AND (:to IS NULL OR date(created_at) <= date(:to))",
        rusqlite::named_params! { ":user": user_id, ":from": from, ":to": to },
        |row| row.get(0),
    )?;

    let task_count: i64 = conn.query_row(
        "SELECT COUNT(*) FROM tasks t JOIN shifts s ON s.id = t.shift_id
         WHERE s.user_id = :user
           AND (:from IS NULL OR date(t.created_at) >= date(:from))
           AND (:to IS NULL OR date(t.created_at) <= date(:to))",
        rusqlite::named_params! { ":user": user_id, ":from": from, ":to": to },
        |row| row.get(0),
    )?;
    let approved_task_total = sum_money(
        conn,
        "SELECT t.amount FROM tasks t JOIN shifts s ON s.id = t.shift_id
         WHERE s.user_id = :user AND t.status = 'approved'
           AND (:from IS NULL OR date(t.created_at) >= date(:from))
           AND (:to IS NULL OR date(t.created_at) <= date(:to))",
        user_id,
        from,
        to,
    )?;

    let expense_count: i64 = conn.query_row(
        "SELECT COUNT(*) FROM expenses
         WHERE worker_id = :user
           AND (:from IS NULL OR date >= :from)
           AND (:to IS NULL OR date <= :to)",
        rusqlite::named_params! { ":user": user_id, ":from": from, ":to": to },
        |row| row.get(0),
    )?;
    let approved_expense_total = sum_money(
        conn,
        "SELECT amount FROM expenses
         WHERE worker_id = :user AND status = 'approved'
           AND (:from IS NULL OR date >= :from)
           AND (:to IS NULL OR date <= :to)",
        user_id,
        from,
        to,
    )?;

    Ok(WorkerReport {
        user_id,
        name,
        from: from.map(Into::into),
        to: to.map(Into::into),
        shift_count: shift_count as u64,
        task_count: task_count as u64,
        expense_count: expense_count as u64,
        fmt_task_total: approved_task_total.format_ils(),
        fmt_expense_total: approved_expense_total.format_ils(),
        approved_task_total,
        approved_expense_total,
    })
}

/// Sums a money column in decimal space; SQL SUM over floats never touches
/// an amount.
fn sum_money(
    conn: &Connection,
    sql: &str,
    user_id: i64,
    from: Option<&str>,
    to: Option<&str>,
) -> ReportResult<Money> {
    let mut stmt = conn.prepare(sql)?;
    let rows = stmt.query_map(
        rusqlite::named_params! { ":user": user_id, ":from": from, ":to": to },
        |row| row.get::<_, String>(0),
    )?;
    let mut total = Money::ZERO;
    for raw in rows {
        let amount = Money::parse(&raw?).unwrap_or(Money::ZERO);
        total = total + amount;
    }
    Ok(total)
}

#[cfg(test)]
mod tests;
