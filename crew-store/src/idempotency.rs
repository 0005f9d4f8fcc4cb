//! At-most-once registry for keyed mutations.
//!
//! The key is the primary index, so both the race guard and the fast
//! repeat lookup come from one table. The insert shares the caller's
//! transaction: the key is registered iff the domain effect commits.

use rusqlite::OptionalExtension;

use crate::Session;
use crate::StoreError;
use crate::StoreResult;
use crate::now_rfc3339;

pub const MAX_KEY_LEN: usize = 80;

/// Outcome of `ensure_idempotent`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IdempotencyOutcome {
    /// First sighting; the key row is now part of the transaction.
    Fresh,
    /// The key exists. `scope_matches` tells whether the caller sent the
    /// same canonical payload as the original request; `response_json`
    /// carries the stored result for endpoints that replay it.
    Replay {
        scope_hash: String,
        scope_matches: bool,
        response_json: Option<String>,
    },
}

/// Registers `key` for the canonical scope, or reports the stored replay.
pub fn ensure_idempotent(
    session: &mut Session,
    key: &str,
    scope: &serde_json::Value,
) -> StoreResult<IdempotencyOutcome> {
    validate_key(key)?;
    let scope_hash = crew_money::payload_hash(scope);

    let existing: Option<(String, Option<String>)> = session
        .conn()
        .query_row(
            "SELECT scope_hash, response_json FROM idempotency_keys WHERE key = ?1",
            [key],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )
        .optional()?;

    if let Some((stored_hash, response_json)) = existing {
        let scope_matches = stored_hash == scope_hash;
        return Ok(IdempotencyOutcome::Replay {
            scope_hash: stored_hash,
            scope_matches,
            response_json,
        });
    }

    session.conn().execute(
        "INSERT INTO idempotency_keys (key, scope_hash, status, created_at)
         VALUES (?1, ?2, 'applied', ?3)",
        rusqlite::params![key, scope_hash, now_rfc3339()],
    )?;
    Ok(IdempotencyOutcome::Fresh)
}

/// Stores the original response body so resource-add endpoints can replay
/// it deterministically.
pub fn record_response(
    session: &mut Session,
    key: &str,
    response: &serde_json::Value,
) -> StoreResult<()> {
    session.conn().execute(
        "UPDATE idempotency_keys SET response_json = ?2 WHERE key = ?1",
        rusqlite::params![key, response.to_string()],
    )?;
    Ok(())
}

fn validate_key(key: &str) -> StoreResult<()> {
    if key.is_empty() || key.len() > MAX_KEY_LEN {
        return Err(StoreError::InvalidIdempotencyKey(format!(
            "length must be 1..={MAX_KEY_LEN}"
        )));
    }
    if !key.bytes().all(|b| (0x20..=0x7E).contains(&b)) {
        return Err(StoreError::InvalidIdempotencyKey(
            "printable ASCII only".into(),
        ));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::SessionMode;
    use crate::Store;
    use crew_metrics::MetricsSink;
    use pretty_assertions::assert_eq;
    use serde_json::json;
    use std::sync::Arc;
    use std::time::Instant;
    use tempfile::TempDir;

    fn setup(dir: &TempDir) -> (Store, Arc<MetricsSink>) {
        let store = Store::open(dir.path().join("crew.db")).expect("open store");
        store.migrate().expect("migrate");
        (store, Arc::new(MetricsSink::new(dir.path().join("metrics"))))
    }

    #[test]
    fn first_use_registers_and_commits_with_transaction() {
        let dir = TempDir::new().expect("temp dir");
        let (store, metrics) = setup(&dir);

        let mut session = store
            .session(SessionMode::ReadWrite, Arc::clone(&metrics))
            .expect("session");
        let outcome = ensure_idempotent(&mut session, "req-1", &json!({"ids": [1, 2]}))
            .expect("ensure");
        assert_eq!(outcome, IdempotencyOutcome::Fresh);
        session.rollback();

        // Rolled back with the transaction: the key is reusable.
        let mut session = store
            .session(SessionMode::ReadWrite, metrics)
            .expect("session");
        let outcome = ensure_idempotent(&mut session, "req-1", &json!({"ids": [1, 2]}))
            .expect("ensure");
        assert_eq!(outcome, IdempotencyOutcome::Fresh);
    }

    #[test]
    fn replay_reports_stored_hash_regardless_of_payload() {
        let dir = TempDir::new().expect("temp dir");
        let (store, metrics) = setup(&dir);

        let scope = json!({"by": "admin", "ids": [1, 2, 3]});
        let mut session = store
            .session(SessionMode::ReadWrite, Arc::clone(&metrics))
            .expect("session");
        ensure_idempotent(&mut session, "req-12345", &scope).expect("ensure");
        session.commit().expect("commit");

        let mut session = store
            .session(SessionMode::ReadWrite, Arc::clone(&metrics))
            .expect("session");
        let same = ensure_idempotent(&mut session, "req-12345", &scope).expect("ensure");
        let expected_hash = crew_money::payload_hash(&scope);
        match same {
            IdempotencyOutcome::Replay {
                scope_hash,
                scope_matches,
                ..
            } => {
                assert_eq!(scope_hash, expected_hash);
                assert!(scope_matches);
            }
            other => panic!("unexpected outcome {other:?}"),
        }

        let different = ensure_idempotent(&mut session, "req-12345", &json!({"ids": [9]}))
            .expect("ensure");
        match different {
            IdempotencyOutcome::Replay { scope_matches, .. } => assert!(!scope_matches),
            other => panic!("unexpected outcome {other:?}"),
        }
    }

    #[test]
    fn scope_hash_ignores_json_key_order() {
        let dir = TempDir::new().expect("temp dir");
        let (store, metrics) = setup(&dir);

        let mut session = store
            .session(SessionMode::ReadWrite, metrics)
            .expect("session");
        ensure_idempotent(
            &mut session,
            "req-ordered",
            &json!({"a": 1, "b": {"x": true, "y": false}}),
        )
        .expect("ensure");
        let outcome = ensure_idempotent(
            &mut session,
            "req-ordered",
            &json!({"b": {"y": false, "x": true}, "a": 1}),
        )
        .expect("ensure");
        assert!(matches!(
            outcome,
            IdempotencyOutcome::Replay {
                scope_matches: true,
                ..
            }
        ));
    }

    #[test]
    fn replay_detection_is_fast_on_populated_store() {
        let dir = TempDir::new().expect("temp dir");
        let (store, metrics) = setup(&dir);

        let mut session = store
            .session(SessionMode::ReadWrite, Arc::clone(&metrics))
            .expect("session");
        for n in 0..5_000 {
            ensure_idempotent(&mut session, &format!("seed-{n}"), &json!({"n": n}))
                .expect("ensure");
        }
        session.commit().expect("commit");

        let mut session = store
            .session(SessionMode::ReadWrite, metrics)
            .expect("session");
        let started = Instant::now();
        let outcome = ensure_idempotent(&mut session, "seed-2500", &json!({"n": 2500}))
            .expect("ensure");
        let elapsed = started.elapsed();
        assert!(matches!(outcome, IdempotencyOutcome::Replay { .. }));
        assert!(
            elapsed.as_millis() <= 100,
            "repeat detection took {elapsed:?}"
        );
    }

    #[test]
    fn stored_response_replays() {
        let dir = TempDir::new().expect("temp dir");
        let (store, metrics) = setup(&dir);

        let scope = json!({"category": "fuel", "amount": "120.00"});
        let mut session = store
            .session(SessionMode::ReadWrite, Arc::clone(&metrics))
            .expect("session");
        ensure_idempotent(&mut session, "exp-1", &scope).expect("ensure");
        record_response(&mut session, "exp-1", &json!({"id": 42})).expect("record");
        session.commit().expect("commit");

        let mut session = store
            .session(SessionMode::ReadWrite, metrics)
            .expect("session");
        match ensure_idempotent(&mut session, "exp-1", &scope).expect("ensure") {
            IdempotencyOutcome::Replay {
                scope_matches,
                response_json: Some(body),
                ..
            } => {
                assert!(scope_matches);
                assert_eq!(body, r#"{"id":42}"#);
            }
            other => panic!("unexpected outcome {other:?}"),
        }
    }

    #[test]
    fn keys_are_validated() {
        let dir = TempDir::new().expect("temp dir");
        let (store, metrics) = setup(&dir);
        let mut session = store
            .session(SessionMode::ReadWrite, metrics)
            .expect("session");

        let long_key = "k".repeat(MAX_KEY_LEN + 1);
        assert!(matches!(
            ensure_idempotent(&mut session, &long_key, &json!({})),
            Err(StoreError::InvalidIdempotencyKey(_))
        ));
        assert!(matches!(
            ensure_idempotent(&mut session, "", &json!({})),
            Err(StoreError::InvalidIdempotencyKey(_))
        ));
        assert!(matches!(
            ensure_idempotent(&mut session, "bad\u{7F}key", &json!({})),
            Err(StoreError::InvalidIdempotencyKey(_))
        ));
    }
}
