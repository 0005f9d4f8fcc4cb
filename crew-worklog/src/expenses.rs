//! Worker expenses. Currency is locked to ILS; amounts above the policy
//! threshold must carry a photo reference.

use chrono::DateTime;
use chrono::NaiveDate;
use chrono::Utc;
use rusqlite::Connection;
use rusqlite::OptionalExtension;
use serde::Deserialize;
use serde::Serialize;

use crew_audit::AuditOutcome;
use crew_money::CURRENCY_ILS;
use crew_money::Money;
use crew_pricing::PricingEngine;
use crew_store::Session;
use crew_store::now_rfc3339;
use crew_store::parse_ts;

use crate::ExpensePolicy;
use crate::WorklogError;
use crate::WorklogResult;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExpenseStatus {
    NeedsApproval,
    Approved,
    Rejected,
}

impl ExpenseStatus {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            ExpenseStatus::NeedsApproval => "needs_approval",
            ExpenseStatus::Approved => "approved",
            ExpenseStatus::Rejected => "rejected",
        }
    }

    #[must_use]
    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "needs_approval" => Some(ExpenseStatus::NeedsApproval),
            "approved" => Some(ExpenseStatus::Approved),
            "rejected" => Some(ExpenseStatus::Rejected),
            _ => None,
        }
    }

    #[must_use]
    pub fn is_terminal(&self) -> bool {
        matches!(self, ExpenseStatus::Approved | ExpenseStatus::Rejected)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OcrStatus {
    Off,
    Abstain,
    Ok,
}

impl OcrStatus {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            OcrStatus::Off => "off",
            OcrStatus::Abstain => "abstain",
            OcrStatus::Ok => "ok",
        }
    }

    #[must_use]
    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "off" => Some(OcrStatus::Off),
            "abstain" => Some(OcrStatus::Abstain),
            "ok" => Some(OcrStatus::Ok),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Expense {
    pub id: i64,
    pub worker_id: i64,
    pub shift_id: Option<i64>,
    pub category: String,
    pub amount: Money,
    pub currency: String,
    pub photo_ref: Option<String>,
    pub ocr_status: OcrStatus,
    pub status: ExpenseStatus,
    pub date: NaiveDate,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ExpenseCreate {
    pub worker_id: i64,
    #[serde(default)]
    pub shift_id: Option<i64>,
    pub category: String,
    pub amount: Money,
    #[serde(default)]
    pub currency: Option<String>,
    #[serde(default)]
    pub photo_ref: Option<String>,
    #[serde(default)]
    pub date: Option<NaiveDate>,
}

pub fn add(
    session: &mut Session,
    pricing: &PricingEngine,
    policy: &ExpensePolicy,
    actor: &str,
    input: ExpenseCreate,
) -> WorklogResult<Expense> {
    if let Some(currency) = input.currency.as_deref()
        && currency != CURRENCY_ILS
    {
        return Err(WorklogError::Validation(format!(
            "currency must be {CURRENCY_ILS}, got {currency}"
        )));
    }
    if input.amount.is_zero() || input.amount.is_negative() {
        return Err(WorklogError::Validation(
            "expense amount must be positive".into(),
        ));
    }
    if !pricing.has_category(&input.category) {
        return Err(crew_pricing::PricingError::UnknownCategory(input.category).into());
    }
    if input.amount.amount() > policy.photo_threshold.amount() && input.photo_ref.is_none() {
        return Err(WorklogError::PhotoRequired {
            threshold: policy.photo_threshold,
        });
    }
    if let Some(shift_id) = input.shift_id {
        crate::shifts::get(session.conn(), shift_id)?;
    }

    let ocr_status = match (policy.ocr_enabled, input.photo_ref.as_deref()) {
        (true, Some(_)) => OcrStatus::Abstain,
        _ => OcrStatus::Off,
    };
    let date = input.date.unwrap_or_else(|| Utc::now().date_naive());

    session.conn().execute(
        "INSERT INTO expenses (worker_id, shift_id, category, amount, currency, photo_ref, ocr_status, status, date, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, 'needs_approval', ?8, ?9)",
        rusqlite::params![
            input.worker_id,
            input.shift_id,
            input.category,
            input.amount.to_plain_string(),
            CURRENCY_ILS,
            input.photo_ref,
            ocr_status.as_str(),
            date.format("%Y-%m-%d").to_string(),
            now_rfc3339(),
        ],
    )?;
    let expense_id = session.conn().last_insert_rowid();
    session.mark_mutation()?;
    crew_audit::append(
        session,
        actor,
        "expense.add",
        "expense",
        Some(expense_id),
        &serde_json::json!({
            "worker_id": input.worker_id,
            "category": &input.category,
            "amount": input.amount.to_plain_string(),
        }),
        AuditOutcome::Applied,
        None,
    )?;
    session.queue_metric(
        "expense.add",
        serde_json::json!({"expense_id": expense_id, "category": input.category}),
    );
    get(session.conn(), expense_id)
}

pub fn get(conn: &Connection, expense_id: i64) -> WorklogResult<Expense> {
    conn.query_row(
        "SELECT id, worker_id, shift_id, category, amount, currency, photo_ref, ocr_status, status, date, created_at
         FROM expenses WHERE id = ?1",
        [expense_id],
        map_expense,
    )
    .optional()?
    .ok_or_else(|| WorklogError::NotFound(format!("expense {expense_id}")))
}

/// External OCR collaborators report back through this transition.
pub fn set_ocr_status(
    session: &mut Session,
    actor: &str,
    expense_id: i64,
    status: OcrStatus,
) -> WorklogResult<Expense> {
    get(session.conn(), expense_id)?;
    session.conn().execute(
        "UPDATE expenses SET ocr_status = ?2 WHERE id = ?1",
        rusqlite::params![expense_id, status.as_str()],
    )?;
    session.mark_mutation()?;
    crew_audit::append(
        session,
        actor,
        "expense.ocr",
        "expense",
        Some(expense_id),
        &serde_json::json!({"ocr_status": status.as_str()}),
        AuditOutcome::Applied,
        None,
    )?;
    session.queue_metric(
        "expense.ocr",
        serde_json::json!({"expense_id": expense_id, "ocr_status": status.as_str()}),
    );
    get(session.conn(), expense_id)
}

pub(crate) fn map_expense(row: &rusqlite::Row<'_>) -> rusqlite::Result<Expense> {
    let amount_raw: String = row.get(4)?;
    let ocr_raw: String = row.get(7)?;
    let status_raw: String = row.get(8)?;
    let date_raw: String = row.get(9)?;
    let created_at: String = row.get(10)?;
    Ok(Expense {
        id: row.get(0)?,
        worker_id: row.get(1)?,
        shift_id: row.get(2)?,
        category: row.get(3)?,
        amount: Money::parse(&amount_raw).unwrap_or(Money::ZERO),
        currency: row.get(5)?,
        photo_ref: row.get(6)?,
        ocr_status: OcrStatus::parse(&ocr_raw).unwrap_or(OcrStatus::Off),
        status: ExpenseStatus::parse(&status_raw).unwrap_or(ExpenseStatus::NeedsApproval),
        date: NaiveDate::parse_from_str(&date_raw, "%Y-%m-%d")
            .unwrap_or_else(|_| Utc::now().date_naive()),
        created_at: parse_ts(&created_at),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ExpensePolicy;
    use crew_metrics::MetricsSink;
    use crew_store::SessionMode;
    use crew_store::Store;
    use pretty_assertions::assert_eq;
    use rust_decimal_macros::dec;
    use std::io::Write;
    use std::sync::Arc;
    use tempfile::NamedTempFile;
    use tempfile::TempDir;

    const RULES: &str = "\
version: 1
rates:
  hour_electric: 800
categories:
  fuel: 1
  materials: 1
";

    fn setup(dir: &TempDir) -> (Store, Arc<MetricsSink>, PricingEngine, NamedTempFile) {
        let store = Store::open(dir.path().join("crew.db")).expect("open store");
        store.migrate().expect("migrate");
        let metrics = Arc::new(MetricsSink::new(dir.path().join("metrics")));
        let mut rules = NamedTempFile::new().expect("rules file");
        rules.write_all(RULES.as_bytes()).expect("write rules");
        let pricing = PricingEngine::load(rules.path()).expect("load rules");
        (store, metrics, pricing, rules)
    }

    fn seed_worker(store: &Store, metrics: &Arc<MetricsSink>) -> i64 {
        let session = store
            .session(SessionMode::ReadWrite, Arc::clone(metrics))
            .expect("session");
        session
            .conn()
            .execute(
                "INSERT INTO users (name, role, status, created_at, updated_at)
                 VALUES ('mosh', 'worker', 'active', ?1, ?1)",
                [now_rfc3339()],
            )
            .expect("insert user");
        let id = session.conn().last_insert_rowid();
        session.commit().expect("commit");
        id
    }

    fn policy(threshold: &str) -> ExpensePolicy {
        ExpensePolicy {
            photo_threshold: Money::parse(threshold).expect("threshold"),
            ocr_enabled: true,
        }
    }

    #[test]
    fn add_expense_defaults_to_needs_approval() {
        let dir = TempDir::new().expect("temp dir");
        let (store, metrics, pricing, _rules) = setup(&dir);
        let worker_id = seed_worker(&store, &metrics);

        let mut session = store
            .session(SessionMode::ReadWrite, Arc::clone(&metrics))
            .expect("session");
        let expense = add(
            &mut session,
            &pricing,
            &policy("400"),
            "mosh",
            ExpenseCreate {
                worker_id,
                shift_id: None,
                category: "fuel".into(),
                amount: Money::new(dec!(120.50)),
                currency: Some("ILS".into()),
                photo_ref: None,
                date: None,
            },
        )
        .expect("add expense");
        session.commit().expect("commit");

        assert_eq!(expense.status, ExpenseStatus::NeedsApproval);
        assert_eq!(expense.currency, "ILS");
        assert_eq!(expense.ocr_status, OcrStatus::Off);
        assert_eq!(expense.amount, Money::new(dec!(120.50)));
    }

    #[test]
    fn amount_over_threshold_requires_photo() {
        let dir = TempDir::new().expect("temp dir");
        let (store, metrics, pricing, _rules) = setup(&dir);
        let worker_id = seed_worker(&store, &metrics);

        let mut session = store
            .session(SessionMode::ReadWrite, Arc::clone(&metrics))
            .expect("session");
        let err = add(
            &mut session,
            &pricing,
            &policy("400"),
            "mosh",
            ExpenseCreate {
                worker_id,
                shift_id: None,
                category: "materials".into(),
                amount: Money::new(dec!(1450)),
                currency: None,
                photo_ref: None,
                date: None,
            },
        )
        .expect_err("photo required");
        assert!(matches!(err, WorklogError::PhotoRequired { .. }));

        // Same amount with a photo passes, and OCR abstains.
        let expense = add(
            &mut session,
            &pricing,
            &policy("400"),
            "mosh",
            ExpenseCreate {
                worker_id,
                shift_id: None,
                category: "materials".into(),
                amount: Money::new(dec!(1450)),
                currency: None,
                photo_ref: Some("photos/receipt-91.jpg".into()),
                date: None,
            },
        )
        .expect("add with photo");
        assert_eq!(expense.ocr_status, OcrStatus::Abstain);
    }

    #[test]
    fn foreign_currency_and_unknown_category_are_rejected() {
        let dir = TempDir::new().expect("temp dir");
        let (store, metrics, pricing, _rules) = setup(&dir);
        let worker_id = seed_worker(&store, &metrics);

        let mut session = store
            .session(SessionMode::ReadWrite, metrics)
            .expect("session");
        let err = add(
            &mut session,
            &pricing,
            &policy("400"),
            "mosh",
            ExpenseCreate {
                worker_id,
                shift_id: None,
                category: "fuel".into(),
                amount: Money::new(dec!(10)),
                currency: Some("USD".into()),
                photo_ref: None,
                date: None,
            },
        )
        .expect_err("usd rejected");
        assert!(matches!(err, WorklogError::Validation(_)));

        let err = add(
            &mut session,
            &pricing,
            &policy("400"),
            "mosh",
            ExpenseCreate {
                worker_id,
                shift_id: None,
                category: "snacks".into(),
                amount: Money::new(dec!(10)),
                currency: None,
                photo_ref: None,
                date: None,
            },
        )
        .expect_err("unknown category");
        assert!(matches!(err, WorklogError::Pricing(_)));
    }
}
