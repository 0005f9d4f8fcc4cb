use super::*;
use crew_metrics::MetricsSink;
use crew_store::SessionMode;
use crew_store::Store;
use pretty_assertions::assert_eq;
use std::sync::Arc;
use tempfile::TempDir;

fn setup(dir: &TempDir) -> Store {
    let store = Store::open(dir.path().join("crew.db")).expect("open store");
    store.migrate().expect("migrate");
    store
}

fn seed_world(store: &Store, dir: &TempDir) -> (i64, i64) {
    let metrics = Arc::new(MetricsSink::new(dir.path().join("metrics")));
    let session = store
        .session(SessionMode::ReadWrite, metrics)
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
             VALUES (?1, ?2, 'fuel', '120.50', 'ILS', 'off', 'approved', date('now'), ?3)",
            rusqlite::params![user_id, shift_id, crew_store::now_rfc3339()],
        )
        .expect("insert expense");
    session
        .conn()
        .execute(
            "INSERT INTO expenses (worker_id, shift_id, category, amount, currency, ocr_status, status, date, created_at)
             VALUES (?1, ?2, 'fuel', '77.00', 'ILS', 'off', 'needs_approval', date('now'), ?3)",
            rusqlite::params![user_id, shift_id, crew_store::now_rfc3339()],
        )
        .expect("insert pending expense");
    session.commit().expect("commit");
    (user_id, client_id)
}

#[test]
fn monthly_csv_carries_bom_crlf_and_approved_rows_only() {
    let dir = TempDir::new().expect("temp dir");
    let store = setup(&dir);
    seed_world(&store, &dir);

    let conn = store.raw_conn().expect("conn");
    let month = chrono::Utc::now().format("%Y-%m").to_string();
    let bytes = monthly_csv(&conn, &month).expect("csv");

    assert_eq!(&bytes[..3], &[0xEF, 0xBB, 0xBF]);
    let body = String::from_utf8(bytes[3..].to_vec()).expect("utf8");
    assert!(body.contains("\r\n"));
    let lines: Vec<&str> = body.trim_end().split("\r\n").collect();
    // Header + one task + one approved expense; the pending one is absent.
    assert_eq!(lines.len(), 3);
    assert!(lines[0].starts_with("date,kind,worker"));
    assert!(body.contains("1600.00"));
    assert!(body.contains("120.50"));
    assert!(!body.contains("77.00"));
    assert!(body.contains('\u{20AA}'));
}

#[test]
fn bad_month_is_a_validation_error() {
    let dir = TempDir::new().expect("temp dir");
    let store = setup(&dir);
    let conn = store.raw_conn().expect("conn");
    assert!(matches!(
        monthly_csv(&conn, "2026-13"),
        Err(ReportError::Validation(_))
    ));
    assert!(matches!(
        monthly_csv(&conn, "not-a-month"),
        Err(ReportError::Validation(_))
    ));
}

#[test]
fn expense_export_respects_filters() {
    let dir = TempDir::new().expect("temp dir");
    let store = setup(&dir);
    seed_world(&store, &dir);

    let conn = store.raw_conn().expect("conn");
    let all = export_expenses_csv(&conn, &ExpenseExportFilter::default()).expect("csv");
    let body = String::from_utf8(all[3..].to_vec()).expect("utf8");
    assert_eq!(body.trim_end().split("\r\n").count(), 3);

    let approved = export_expenses_csv(
        &conn,
        &ExpenseExportFilter {
            status: Some("approved".into()),
            ..ExpenseExportFilter::default()
        },
    )
    .expect("csv");
    let body = String::from_utf8(approved[3..].to_vec()).expect("utf8");
    assert_eq!(body.trim_end().split("\r\n").count(), 2);
    assert!(body.contains("120.50"));
}

#[test]
fn export_over_limit_fails_before_writing() {
    let dir = TempDir::new().expect("temp dir");
    let store = setup(&dir);
    let (user_id, _client_id) = seed_world(&store, &dir);

    let conn = store.raw_conn().expect("conn");
    conn.execute_batch("BEGIN").expect("begin");
    {
        let now = crew_store::now_rfc3339();
        let mut stmt = conn
            .prepare(
                "INSERT INTO expenses (worker_id, category, amount, currency, ocr_status, status, date, created_at)
                 VALUES (?1, 'fuel', '1.00', 'ILS', 'off', 'approved', date('now'), ?2)",
            )
            .expect("prepare");
        for _ in 0..=EXPORT_ROW_LIMIT {
            stmt.execute(rusqlite::params![user_id, now]).expect("insert");
        }
    }
    conn.execute_batch("COMMIT").expect("commit");

    let err = export_expenses_csv(&conn, &ExpenseExportFilter::default())
        .expect_err("over limit");
    match err {
        ReportError::ExportLimitExceeded { total } => assert!(total > EXPORT_ROW_LIMIT),
        other => panic!("unexpected error {other:?}"),
    }
}

#[test]
fn worker_report_sums_approved_amounts_exactly() {
    let dir = TempDir::new().expect("temp dir");
    let store = setup(&dir);
    let (user_id, _client_id) = seed_world(&store, &dir);

    let conn = store.raw_conn().expect("conn");
    let report = worker_report(&conn, user_id, None, None).expect("report");
    assert_eq!(report.name, "mosh");
    assert_eq!(report.shift_count, 1);
    assert_eq!(report.task_count, 1);
    assert_eq!(report.expense_count, 2);
    assert_eq!(
        report.approved_task_total,
        Money::parse("1600").expect("total")
    );
    assert_eq!(
        report.approved_expense_total,
        Money::parse("120.50").expect("total")
    );
    assert!(report.fmt_task_total.starts_with("\u{200E}₪"));

    assert!(matches!(
        worker_report(&conn, 404_404, None, None),
        Err(ReportError::NotFound(_))
    ));
}
