use super::*;
use crew_metrics::MetricsSink;
use crew_store::SessionMode;
use crew_store::Store;
use pretty_assertions::assert_eq;
use std::io::Write;
use std::sync::Arc;
use tempfile::NamedTempFile;
use tempfile::TempDir;

const RULES: &str = "\
version: 2
rates:
  hour_electric: 800
categories:
  fuel: 1
";

struct Fixture {
    store: Store,
    metrics: Arc<MetricsSink>,
    pricing: PricingEngine,
    _rules: NamedTempFile,
    client_id: i64,
}

fn fixture() -> (Fixture, TempDir) {
    let dir = TempDir::new().expect("temp dir");
    let store = Store::open(dir.path().join("crew.db")).expect("open store");
    store.migrate().expect("migrate");
    let metrics = Arc::new(MetricsSink::new(dir.path().join("metrics")));
    let mut rules = NamedTempFile::new().expect("rules file");
    rules.write_all(RULES.as_bytes()).expect("write rules");
    let pricing = PricingEngine::load(rules.path()).expect("load rules");

    let session = store
        .session(SessionMode::ReadWrite, Arc::clone(&metrics))
        .expect("session");
    session
        .conn()
        .execute(
            "INSERT INTO users (name, role, status, created_at, updated_at)
             VALUES ('mosh', 'worker', 'active', ?1, ?1)",
            [crew_store::now_rfc3339()],
        )
        .expect("insert user");
    let user_id = session.conn().last_insert_rowid();
    session
        .conn()
        .execute(
            "INSERT INTO clients (name, created_at) VALUES ('acme', ?1)",
            [crew_store::now_rfc3339()],
        )
        .expect("insert client");
    let client_id = session.conn().last_insert_rowid();
    session
        .conn()
        .execute(
            "INSERT INTO shifts (user_id, client_id, status, created_at)
             VALUES (?1, ?2, 'closed', ?3)",
            rusqlite::params![user_id, client_id, crew_store::now_rfc3339()],
        )
        .expect("insert shift");
    let shift_id = session.conn().last_insert_rowid();
    session
        .conn()
        .execute(
            "INSERT INTO tasks (shift_id, rate_code, qty, amount, pricing_sha, rules_sha, worker, status, created_at)
             VALUES (?1, 'hour_electric', '2', '1600.00', 'aaaaaaaaaaaa', 'bbbbbbbbbbbb', 'mosh', 'approved', ?2)",
            rusqlite::params![shift_id, crew_store::now_rfc3339()],
        )
        .expect("insert task");
    session
        .conn()
        .execute(
            "INSERT INTO expenses (worker_id, shift_id, category, amount, currency, ocr_status, status, date, created_at)
             VALUES (?1, ?2, 'fuel', '250.00', 'ILS', 'off', 'approved', date('now'), ?3)",
            rusqlite::params![user_id, shift_id, crew_store::now_rfc3339()],
        )
        .expect("insert expense");
    // A pending task must not reach the invoice.
    session
        .conn()
        .execute(
            "INSERT INTO tasks (shift_id, rate_code, qty, amount, pricing_sha, rules_sha, worker, status, created_at)
             VALUES (?1, 'hour_electric', '5', '4000.00', 'cccccccccccc', 'bbbbbbbbbbbb', 'mosh', 'pending', ?2)",
            rusqlite::params![shift_id, crew_store::now_rfc3339()],
        )
        .expect("insert pending task");
    session.commit().expect("commit");

    (
        Fixture {
            store,
            metrics,
            pricing,
            _rules: rules,
            client_id,
        },
        dir,
    )
}

fn period() -> (NaiveDate, NaiveDate) {
    let today = Utc::now().date_naive();
    (today - chrono::Duration::days(15), today + chrono::Duration::days(1))
}

fn build_invoice(fx: &Fixture) -> Invoice {
    let (from, to) = period();
    let mut session = fx
        .store
        .session(SessionMode::ReadWrite, Arc::clone(&fx.metrics))
        .expect("session");
    let invoice = build(
        &mut session,
        &fx.pricing,
        "admin",
        fx.client_id,
        from,
        to,
        Some("ILS"),
    )
    .expect("build");
    session.commit().expect("commit");
    invoice
}

#[test]
fn build_collects_only_approved_work_and_balances() {
    let (fx, _dir) = fixture();
    let invoice = build_invoice(&fx);

    assert_eq!(invoice.status, InvoiceStatus::Draft);
    assert_eq!(invoice.version, 1);
    assert_eq!(invoice.tax, Money::ZERO);
    // 2h x 800 + 250 fuel
    assert_eq!(invoice.subtotal, Money::parse("1850").expect("subtotal"));
    assert_eq!(invoice.total, invoice.subtotal);

    let conn = fx.store.raw_conn().expect("conn");
    let rows = items(&conn, invoice.id).expect("items");
    assert_eq!(rows.len(), 2);
    let item_sum = Money::sum(rows.iter().map(|item| item.amount)).expect("sum");
    assert_eq!(item_sum, invoice.subtotal);
    for item in &rows {
        assert_eq!(item.amount, crate::round_amount(item.quantity, item.unit_price));
    }
}

#[test]
fn build_is_idempotent_per_client_and_period() {
    let (fx, _dir) = fixture();
    let first = build_invoice(&fx);
    let second = build_invoice(&fx);
    assert_eq!(first.id, second.id);
    assert_eq!(second.version, 1);

    let conn = fx.store.raw_conn().expect("conn");
    let count: i64 = conn
        .query_row("SELECT COUNT(*) FROM invoices", [], |row| row.get(0))
        .expect("count");
    assert_eq!(count, 1);
}

#[test]
fn preview_token_is_single_use() {
    let (fx, _dir) = fixture();
    let invoice = build_invoice(&fx);

    let mut session = fx
        .store
        .session(SessionMode::ReadWrite, Arc::clone(&fx.metrics))
        .expect("session");
    let token = preview::issue(&mut session, "admin", invoice.id).expect("issue");
    session.commit().expect("commit");
    assert_eq!(token.len(), 64);

    let mut session = fx
        .store
        .session(SessionMode::ReadWrite, Arc::clone(&fx.metrics))
        .expect("session");
    let rendered = preview::fetch(&mut session, invoice.id, &token).expect("first fetch");
    session.commit().expect("commit");
    assert_eq!(rendered.invoice.id, invoice.id);
    assert!(rendered.fmt_total.starts_with('\u{200E}'));

    let mut session = fx
        .store
        .session(SessionMode::ReadWrite, Arc::clone(&fx.metrics))
        .expect("session");
    let err = preview::fetch(&mut session, invoice.id, &token).expect_err("second fetch");
    assert!(matches!(err, InvoiceError::Gone));
}

#[test]
fn reissue_invalidates_previous_token() {
    let (fx, _dir) = fixture();
    let invoice = build_invoice(&fx);

    let mut session = fx
        .store
        .session(SessionMode::ReadWrite, Arc::clone(&fx.metrics))
        .expect("session");
    let first = preview::issue(&mut session, "admin", invoice.id).expect("issue");
    let second = preview::issue(&mut session, "admin", invoice.id).expect("reissue");
    session.commit().expect("commit");
    assert!(first != second);

    let mut session = fx
        .store
        .session(SessionMode::ReadWrite, Arc::clone(&fx.metrics))
        .expect("session");
    assert!(matches!(
        preview::fetch(&mut session, invoice.id, &first),
        Err(InvoiceError::NotFound(_))
    ));
    preview::fetch(&mut session, invoice.id, &second).expect("new token works");
    session.commit().expect("commit");
}

#[test]
fn forbidden_kind_is_denied_before_any_write() {
    let (fx, _dir) = fixture();
    let invoice = build_invoice(&fx);

    let mut session = fx
        .store
        .session(SessionMode::ReadWrite, Arc::clone(&fx.metrics))
        .expect("session");
    let err = suggest::suggest_change(
        &mut session,
        "admin",
        invoice.id,
        "delete_item",
        serde_json::json!({"item_id": 7}),
    )
    .expect_err("forbidden");
    assert!(matches!(err, InvoiceError::ForbiddenOp(_)));
    // The denial trail still commits.
    session.commit().expect("commit");

    let conn = fx.store.raw_conn().expect("conn");
    let count: i64 = conn
        .query_row("SELECT COUNT(*) FROM invoice_suggestions", [], |row| {
            row.get(0)
        })
        .expect("count");
    assert_eq!(count, 0);
    let entries = crew_audit::by_target(&conn, "invoice", invoice.id).expect("audit");
    assert!(entries.iter().any(|entry| {
        entry.outcome == crew_audit::AuditOutcome::Rejected
            && entry.reason.as_deref() == Some("forbidden_op:delete_item")
    }));
}

#[test]
fn smuggled_forbidden_row_is_blocked_at_apply() {
    let (fx, _dir) = fixture();
    let invoice = build_invoice(&fx);

    // Simulate a row that bypassed layer one.
    let session = fx
        .store
        .session(SessionMode::ReadWrite, Arc::clone(&fx.metrics))
        .expect("session");
    session
        .conn()
        .execute(
            "INSERT INTO invoice_suggestions (invoice_id, kind, payload_json, status, created_at)
             VALUES (?1, 'update_total', '{}', 'open', ?2)",
            rusqlite::params![invoice.id, crew_store::now_rfc3339()],
        )
        .expect("insert rogue row");
    let rogue_id = session.conn().last_insert_rowid();
    session.commit().expect("commit");

    let mut session = fx
        .store
        .session(SessionMode::ReadWrite, Arc::clone(&fx.metrics))
        .expect("session");
    let err = suggest::apply_suggestions(&mut session, "admin", invoice.id, &[rogue_id])
        .expect_err("blocked");
    assert!(matches!(err, InvoiceError::ForbiddenOp(_)));
    session.commit().expect("commit");

    let conn = fx.store.raw_conn().expect("conn");
    let version: i64 = conn
        .query_row(
            "SELECT version FROM invoices WHERE id = ?1",
            [invoice.id],
            |row| row.get(0),
        )
        .expect("version");
    assert_eq!(version, 1);
}

#[test]
fn apply_bumps_version_and_records_canonical_diff() {
    let (fx, _dir) = fixture();
    let invoice = build_invoice(&fx);

    let mut session = fx
        .store
        .session(SessionMode::ReadWrite, Arc::clone(&fx.metrics))
        .expect("session");
    let suggestion = suggest::suggest_change(
        &mut session,
        "admin",
        invoice.id,
        "add_item",
        serde_json::json!({
            "description": "crane rental",
            "quantity": "1",
            "unit_price": "500.00",
        }),
    )
    .expect("suggest");
    session.commit().expect("commit");

    let mut session = fx
        .store
        .session(SessionMode::ReadWrite, Arc::clone(&fx.metrics))
        .expect("session");
    let outcome =
        suggest::apply_suggestions(&mut session, "admin", invoice.id, &[suggestion.id])
            .expect("apply");
    session.commit().expect("commit");
    assert_eq!(outcome.new_version, 2);
    assert_eq!(outcome.applied, vec![suggestion.id]);

    let conn = fx.store.raw_conn().expect("conn");
    let updated = get(&conn, invoice.id).expect("invoice");
    assert_eq!(updated.version, 2);
    assert_eq!(updated.subtotal, Money::parse("2350").expect("subtotal"));
    assert_eq!(updated.total, updated.subtotal);

    let (diff_raw, sha): (String, String) = conn
        .query_row(
            "SELECT diff_json, sha FROM invoice_versions WHERE invoice_id = ?1 AND version = 2",
            [invoice.id],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )
        .expect("version row");
    assert_eq!(sha, crew_money::sha256_hex(diff_raw.as_bytes()));
    let diff: serde_json::Value = serde_json::from_str(&diff_raw).expect("diff json");
    assert_eq!(diff["from_version"], 1);
    assert_eq!(diff["to_version"], 2);

    // An applied suggestion cannot be applied twice.
    let mut session = fx
        .store
        .session(SessionMode::ReadWrite, Arc::clone(&fx.metrics))
        .expect("session");
    assert!(matches!(
        suggest::apply_suggestions(&mut session, "admin", invoice.id, &[suggestion.id]),
        Err(InvoiceError::StaleState(_))
    ));
}

#[test]
fn lifecycle_transitions_are_idempotent() {
    let (fx, _dir) = fixture();
    let invoice = build_invoice(&fx);

    let mut session = fx
        .store
        .session(SessionMode::ReadWrite, Arc::clone(&fx.metrics))
        .expect("session");
    let (issued, outcome) =
        transition(&mut session, "admin", invoice.id, InvoiceStatus::Issued).expect("issue");
    assert_eq!(outcome, TransitionOutcome::Applied);
    assert_eq!(issued.status, InvoiceStatus::Issued);

    let (_, again) =
        transition(&mut session, "admin", invoice.id, InvoiceStatus::Issued).expect("re-issue");
    assert_eq!(again, TransitionOutcome::Noop);

    let err = transition(&mut session, "admin", invoice.id, InvoiceStatus::Draft)
        .expect_err("no return to draft");
    assert!(matches!(err, InvoiceError::Validation(_)));

    let (paid, _) =
        transition(&mut session, "admin", invoice.id, InvoiceStatus::Paid).expect("pay");
    assert_eq!(paid.status, InvoiceStatus::Paid);
    let err = transition(&mut session, "admin", invoice.id, InvoiceStatus::Cancelled)
        .expect_err("paid is terminal");
    assert!(matches!(err, InvoiceError::StaleState(_)));
    session.commit().expect("commit");
}
