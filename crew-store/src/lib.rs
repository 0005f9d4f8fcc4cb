#![deny(clippy::print_stdout, clippy::print_stderr)]

//! SQLite store: pooled connections, forward-only migrations, and the
//! transactional session every mutating operation runs inside.
//!
//! A session that mutates domain tables cannot commit without an audit row
//! and at least one queued metric event. Queued metrics are flushed to the
//! sink under its tail-write lock, taken before `COMMIT` and released after
//! the lines are on disk, so observers see a metric line iff the effect
//! landed.

use std::path::Path;
use std::path::PathBuf;
use std::sync::Arc;

use chrono::DateTime;
use chrono::Utc;
use r2d2_sqlite::SqliteConnectionManager;
use rusqlite::Connection;
use thiserror::Error;
use tracing::error;
use tracing::info;

use crew_metrics::MetricEvent;
use crew_metrics::MetricsSink;

mod idempotency;
mod migrations;

pub use idempotency::IdempotencyOutcome;
pub use idempotency::MAX_KEY_LEN;
pub use idempotency::ensure_idempotent;
pub use idempotency::record_response;

pub type DbPool = r2d2::Pool<SqliteConnectionManager>;
pub type DbConn = r2d2::PooledConnection<SqliteConnectionManager>;

pub type StoreResult<T> = Result<T, StoreError>;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("connection pool failure: {0}")]
    Pool(#[from] r2d2::Error),
    #[error("database failure: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("migration {version} failed: {reason}")]
    Migration { version: i64, reason: String },
    #[error("mutating session committed without an audit entry")]
    AuditMissing,
    #[error("mutating session committed without a metric event")]
    MetricMissing,
    #[error("write attempted on a read-only session")]
    ReadOnly,
    #[error("invalid idempotency key: {0}")]
    InvalidIdempotencyKey(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionMode {
    Read,
    ReadWrite,
}

/// Handle to the single relational database file.
#[derive(Clone)]
pub struct Store {
    pool: DbPool,
    path: PathBuf,
}

impl Store {
    /// Opens (creating if needed) the database at `path` with WAL mode,
    /// foreign keys, and the 5 s per-statement busy budget.
    pub fn open(path: impl AsRef<Path>) -> StoreResult<Self> {
        let path = path.as_ref().to_path_buf();
        let manager = SqliteConnectionManager::file(&path).with_init(|conn| {
            conn.execute_batch(
                "PRAGMA journal_mode = WAL;
                 PRAGMA foreign_keys = ON;
                 PRAGMA busy_timeout = 5000;",
            )
        });
        let pool = r2d2::Pool::builder().max_size(8).build(manager)?;
        Ok(Self { pool, path })
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// A raw pooled connection, outside any session discipline. Used by
    /// migrations, backup, and read-only reporting queries.
    pub fn raw_conn(&self) -> StoreResult<DbConn> {
        Ok(self.pool.get()?)
    }

    /// Applies all pending schema revisions. Returns how many ran.
    pub fn migrate(&self) -> StoreResult<usize> {
        let conn = self.raw_conn()?;
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS schema_migrations (
                version INTEGER PRIMARY KEY,
                applied_at TEXT NOT NULL
            );",
        )?;
        let head: i64 = conn.query_row(
            "SELECT COALESCE(MAX(version), 0) FROM schema_migrations",
            [],
            |row| row.get(0),
        )?;

        let mut applied = 0;
        for (version, sql) in migrations::MIGRATIONS {
            if *version <= head {
                continue;
            }
            conn.execute_batch("BEGIN IMMEDIATE")?;
            let run = conn.execute_batch(sql).and_then(|()| {
                conn.execute(
                    "INSERT INTO schema_migrations (version, applied_at) VALUES (?1, ?2)",
                    rusqlite::params![version, now_rfc3339()],
                )
            });
            match run {
                Ok(_) => {
                    conn.execute_batch("COMMIT")?;
                    info!(version, "schema revision applied");
                    applied += 1;
                }
                Err(err) => {
                    let _ = conn.execute_batch("ROLLBACK");
                    return Err(StoreError::Migration {
                        version: *version,
                        reason: err.to_string(),
                    });
                }
            }
        }
        Ok(applied)
    }

    /// Current migration head, 0 when the schema table is absent.
    pub fn migration_head(&self) -> StoreResult<i64> {
        let conn = self.raw_conn()?;
        let exists: i64 = conn.query_row(
            "SELECT COUNT(*) FROM sqlite_master WHERE type = 'table' AND name = 'schema_migrations'",
            [],
            |row| row.get(0),
        )?;
        if exists == 0 {
            return Ok(0);
        }
        Ok(conn.query_row(
            "SELECT COALESCE(MAX(version), 0) FROM schema_migrations",
            [],
            |row| row.get(0),
        )?)
    }

    /// Opens a transactional session. Read sessions start a deferred
    /// transaction; read-write sessions take the write lock up front.
    pub fn session(
        &self,
        mode: SessionMode,
        metrics: Arc<MetricsSink>,
    ) -> StoreResult<Session> {
        let conn = self.raw_conn()?;
        match mode {
            SessionMode::Read => conn.execute_batch("BEGIN DEFERRED")?,
            SessionMode::ReadWrite => conn.execute_batch("BEGIN IMMEDIATE")?,
        }
        Ok(Session {
            conn,
            mode,
            metrics,
            finished: false,
            mutated: false,
            audited: false,
            pending_metrics: Vec::new(),
            savepoint_seq: 0,
        })
    }
}

/// One transaction against the store.
pub struct Session {
    conn: DbConn,
    mode: SessionMode,
    metrics: Arc<MetricsSink>,
    finished: bool,
    mutated: bool,
    audited: bool,
    pending_metrics: Vec<MetricEvent>,
    savepoint_seq: u32,
}

impl Session {
    #[must_use]
    pub fn conn(&self) -> &Connection {
        &self.conn
    }

    #[must_use]
    pub fn mode(&self) -> SessionMode {
        self.mode
    }

    /// Flags a domain mutation. Commit will then insist on an audit row and
    /// a metric event. Fails on read sessions.
    pub fn mark_mutation(&mut self) -> StoreResult<()> {
        if self.mode == SessionMode::Read {
            return Err(StoreError::ReadOnly);
        }
        self.mutated = true;
        Ok(())
    }

    /// Called by the audit log after inserting its row.
    pub fn mark_audited(&mut self) {
        self.audited = true;
    }

    /// Queues one metric event for flush at commit.
    pub fn queue_metric(&mut self, kind: impl Into<String>, payload: serde_json::Value) {
        self.pending_metrics.push(MetricEvent::new(kind, payload));
    }

    /// Opens a nested savepoint and returns its name.
    pub fn savepoint(&mut self) -> StoreResult<String> {
        self.savepoint_seq += 1;
        let name = format!("sp_{}", self.savepoint_seq);
        self.conn.execute_batch(&format!("SAVEPOINT {name}"))?;
        Ok(name)
    }

    pub fn release_savepoint(&mut self, name: &str) -> StoreResult<()> {
        self.conn.execute_batch(&format!("RELEASE SAVEPOINT {name}"))?;
        Ok(())
    }

    pub fn rollback_to_savepoint(&mut self, name: &str) -> StoreResult<()> {
        self.conn
            .execute_batch(&format!("ROLLBACK TO SAVEPOINT {name}; RELEASE SAVEPOINT {name}"))?;
        Ok(())
    }

    /// Commits the transaction, enforcing the audit/metric invariant and
    /// flushing queued metrics under the sink's tail-write lock.
    pub fn commit(mut self) -> StoreResult<()> {
        if self.mutated && !self.audited {
            self.abort();
            return Err(StoreError::AuditMissing);
        }
        if self.mutated && self.pending_metrics.is_empty() {
            self.abort();
            return Err(StoreError::MetricMissing);
        }

        if self.pending_metrics.is_empty() {
            self.conn.execute_batch("COMMIT")?;
            self.finished = true;
            return Ok(());
        }

        let metrics = Arc::clone(&self.metrics);
        let mut tail = metrics.lock();
        if let Err(err) = self.conn.execute_batch("COMMIT") {
            drop(tail);
            self.abort();
            return Err(err.into());
        }
        self.finished = true;
        for event in &self.pending_metrics {
            if let Err(err) = tail.append(event) {
                // The transaction is already durable; losing the metric line
                // is logged, not unwound.
                error!(kind = %event.kind, error = %err, "metric flush failed after commit");
            }
        }
        Ok(())
    }

    /// Rolls back and discards queued metrics.
    pub fn rollback(mut self) {
        self.abort();
    }

    fn abort(&mut self) {
        if !self.finished {
            if let Err(err) = self.conn.execute_batch("ROLLBACK") {
                error!(error = %err, "session rollback failed");
            }
            self.finished = true;
        }
        self.pending_metrics.clear();
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.abort();
    }
}

/// One page of a listing, with the page inputs echoed back.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct Paginated<T> {
    pub items: Vec<T>,
    pub page: u32,
    pub limit: u32,
    pub total: u64,
}

#[must_use]
pub fn now_rfc3339() -> String {
    Utc::now().to_rfc3339()
}

/// Parses a stored timestamp, falling back to now on malformed data.
#[must_use]
pub fn parse_ts(raw: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(raw)
        .map(|ts| ts.with_timezone(&Utc))
        .unwrap_or_else(|_| Utc::now())
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;
    use tempfile::TempDir;

    fn open_store(dir: &TempDir) -> (Store, Arc<MetricsSink>) {
        let store = Store::open(dir.path().join("crew.db")).expect("open store");
        store.migrate().expect("migrate");
        let metrics = Arc::new(MetricsSink::new(dir.path().join("metrics")));
        (store, metrics)
    }

    fn insert_user(session: &Session, name: &str) {
        session
            .conn()
            .execute(
                "INSERT INTO users (name, role, status, created_at, updated_at)
                 VALUES (?1, 'worker', 'active', ?2, ?2)",
                rusqlite::params![name, now_rfc3339()],
            )
            .expect("insert user");
    }

    fn audit_row(session: &Session) {
        session
            .conn()
            .execute(
                "INSERT INTO audit_log (actor, action, target_kind, payload_hash, outcome, ts)
                 VALUES ('test', 'user.create', 'user', 'deadbeef', 'applied', ?1)",
                rusqlite::params![now_rfc3339()],
            )
            .expect("insert audit");
    }

    #[test]
    fn migrations_are_idempotent_and_recorded() {
        let dir = TempDir::new().expect("temp dir");
        let store = Store::open(dir.path().join("crew.db")).expect("open store");
        let first = store.migrate().expect("first migrate");
        assert_eq!(first, migrations::MIGRATIONS.len());
        let second = store.migrate().expect("second migrate");
        assert_eq!(second, 0);
        assert_eq!(
            store.migration_head().expect("head"),
            migrations::MIGRATIONS.len() as i64
        );
    }

    #[test]
    fn mutating_commit_requires_audit_entry() {
        let dir = TempDir::new().expect("temp dir");
        let (store, metrics) = open_store(&dir);

        let mut session = store
            .session(SessionMode::ReadWrite, Arc::clone(&metrics))
            .expect("session");
        insert_user(&session, "dana");
        session.mark_mutation().expect("mark mutation");
        session.queue_metric("user.create", json!({"name": "dana"}));

        let err = session.commit().expect_err("commit must fail");
        assert!(matches!(err, StoreError::AuditMissing));

        // The rollback must have discarded the insert.
        let conn = store.raw_conn().expect("conn");
        let count: i64 = conn
            .query_row("SELECT COUNT(*) FROM users", [], |row| row.get(0))
            .expect("count");
        assert_eq!(count, 0);
    }

    #[test]
    fn mutating_commit_requires_metric_event() {
        let dir = TempDir::new().expect("temp dir");
        let (store, metrics) = open_store(&dir);

        let mut session = store
            .session(SessionMode::ReadWrite, Arc::clone(&metrics))
            .expect("session");
        insert_user(&session, "dana");
        session.mark_mutation().expect("mark mutation");
        audit_row(&session);
        session.mark_audited();

        let err = session.commit().expect_err("commit must fail");
        assert!(matches!(err, StoreError::MetricMissing));
    }

    #[test]
    fn commit_flushes_queued_metrics() {
        let dir = TempDir::new().expect("temp dir");
        let (store, metrics) = open_store(&dir);

        let mut session = store
            .session(SessionMode::ReadWrite, Arc::clone(&metrics))
            .expect("session");
        insert_user(&session, "dana");
        session.mark_mutation().expect("mark mutation");
        audit_row(&session);
        session.mark_audited();
        session.queue_metric("user.create", json!({"name": "dana"}));
        session.commit().expect("commit");

        let events = metrics
            .read_day(Utc::now().date_naive())
            .expect("read metrics");
        assert_eq!(events.len(), 1);
        assert_eq!(events[0]["kind"], "user.create");
    }

    #[test]
    fn rollback_discards_queued_metrics() {
        let dir = TempDir::new().expect("temp dir");
        let (store, metrics) = open_store(&dir);

        let mut session = store
            .session(SessionMode::ReadWrite, Arc::clone(&metrics))
            .expect("session");
        insert_user(&session, "dana");
        session.mark_mutation().expect("mark mutation");
        session.queue_metric("user.create", json!({}));
        session.rollback();

        let events = metrics
            .read_day(Utc::now().date_naive())
            .expect("read metrics");
        assert!(events.is_empty());
    }

    #[test]
    fn read_sessions_reject_mutation_flag() {
        let dir = TempDir::new().expect("temp dir");
        let (store, metrics) = open_store(&dir);
        let mut session = store
            .session(SessionMode::Read, metrics)
            .expect("session");
        assert!(matches!(session.mark_mutation(), Err(StoreError::ReadOnly)));
    }

    #[test]
    fn savepoints_nest_and_roll_back_partially() {
        let dir = TempDir::new().expect("temp dir");
        let (store, metrics) = open_store(&dir);

        let mut session = store
            .session(SessionMode::ReadWrite, metrics)
            .expect("session");
        insert_user(&session, "kept");
        let sp = session.savepoint().expect("savepoint");
        insert_user(&session, "discarded");
        session.rollback_to_savepoint(&sp).expect("rollback to");
        session.mark_mutation().expect("mark mutation");
        audit_row(&session);
        session.mark_audited();
        session.queue_metric("user.create", json!({}));
        session.commit().expect("commit");

        let conn = store.raw_conn().expect("conn");
        let names: Vec<String> = conn
            .prepare("SELECT name FROM users ORDER BY name")
            .expect("prepare")
            .query_map([], |row| row.get(0))
            .expect("query")
            .collect::<Result<_, _>>()
            .expect("collect");
        assert_eq!(names, vec!["kept".to_string()]);
    }
}
