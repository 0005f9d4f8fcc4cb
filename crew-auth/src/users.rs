//! Admin-managed user records. Users are soft-deactivated, never deleted.

use chrono::DateTime;
use chrono::Utc;
use rusqlite::Connection;
use rusqlite::OptionalExtension;
use serde::Deserialize;
use serde::Serialize;

use crew_audit::AuditOutcome;
use crew_money::Money;
use crew_store::Paginated;
use crew_store::Session;
use crew_store::now_rfc3339;
use crew_store::parse_ts;

use crate::AuthConfig;
use crate::AuthError;
use crate::AuthResult;
use crate::Role;
use crate::hash_secret;
use crate::pin_fingerprint;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UserStatus {
    Active,
    Inactive,
}

impl UserStatus {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            UserStatus::Active => "active",
            UserStatus::Inactive => "inactive",
        }
    }

    #[must_use]
    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "active" => Some(UserStatus::Active),
            "inactive" => Some(UserStatus::Inactive),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct User {
    pub id: i64,
    pub name: String,
    pub telegram_id: Option<i64>,
    pub role: Role,
    pub status: UserStatus,
    pub daily_rate: Option<Money>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct UserCreate {
    pub name: String,
    #[serde(default)]
    pub telegram_id: Option<i64>,
    pub role: Role,
    #[serde(default)]
    pub daily_rate: Option<Money>,
    #[serde(default)]
    pub password: Option<String>,
    #[serde(default)]
    pub pin_code: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct UserPatch {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub telegram_id: Option<i64>,
    #[serde(default)]
    pub role: Option<Role>,
    #[serde(default)]
    pub daily_rate: Option<Money>,
    #[serde(default)]
    pub password: Option<String>,
    #[serde(default)]
    pub pin_code: Option<String>,
}

pub fn create(
    session: &mut Session,
    config: &AuthConfig,
    actor: &str,
    input: UserCreate,
) -> AuthResult<User> {
    let name = input.name.trim();
    if name.is_empty() {
        return Err(AuthError::Validation("user name must be provided".into()));
    }
    if let Some(telegram_id) = input.telegram_id
        && find_by_telegram(session.conn(), telegram_id)?.is_some()
    {
        return Err(AuthError::Conflict(format!(
            "telegram_id {telegram_id} is already assigned"
        )));
    }
    if find_by_name(session.conn(), name)?.is_some() {
        return Err(AuthError::Conflict(format!("user {name} already exists")));
    }

    let now = now_rfc3339();
    session.conn().execute(
        "INSERT INTO users (name, telegram_id, role, status, daily_rate, created_at, updated_at)
         VALUES (?1, ?2, ?3, 'active', ?4, ?5, ?5)",
        rusqlite::params![
            name,
            input.telegram_id,
            input.role.as_str(),
            input.daily_rate.map(|rate| rate.to_plain_string()),
            now,
        ],
    )?;
    let user_id = session.conn().last_insert_rowid();

    let password_hash = input
        .password
        .as_deref()
        .map(hash_secret)
        .transpose()?;
    let (pin_hash, fingerprint) = match input.pin_code.as_deref() {
        Some(pin) => (
            Some(hash_secret(pin)?),
            Some(pin_fingerprint(config, pin)?),
        ),
        None => (None, None),
    };
    session.conn().execute(
        "INSERT INTO auth_credentials (user_id, password_hash, pin_hash, pin_fingerprint, updated_at)
         VALUES (?1, ?2, ?3, ?4, ?5)",
        rusqlite::params![user_id, password_hash, pin_hash, fingerprint, now],
    )?;

    session.mark_mutation()?;
    crew_audit::append(
        session,
        actor,
        "user.create",
        "user",
        Some(user_id),
        &serde_json::json!({"name": name, "role": input.role.as_str()}),
        AuditOutcome::Applied,
        None,
    )?;
    session.queue_metric(
        "user.create",
        serde_json::json!({"user_id": user_id, "role": input.role.as_str()}),
    );
    get(session.conn(), user_id)
}

pub fn patch(
    session: &mut Session,
    config: &AuthConfig,
    actor: &str,
    user_id: i64,
    input: UserPatch,
) -> AuthResult<User> {
    let existing = get(session.conn(), user_id)?;

    if let Some(telegram_id) = input.telegram_id
        && let Some(holder) = find_by_telegram(session.conn(), telegram_id)?
        && holder.id != user_id
    {
        return Err(AuthError::Conflict(format!(
            "telegram_id {telegram_id} is already assigned"
        )));
    }

    let name = match &input.name {
        Some(name) if name.trim().is_empty() => {
            return Err(AuthError::Validation("user name must not be blank".into()));
        }
        Some(name) => name.trim().to_string(),
        None => existing.name.clone(),
    };
    let role = input.role.unwrap_or(existing.role);
    let telegram_id = input.telegram_id.or(existing.telegram_id);
    let daily_rate = input.daily_rate.or(existing.daily_rate);

    session.conn().execute(
        "UPDATE users SET name = ?2, telegram_id = ?3, role = ?4, daily_rate = ?5, updated_at = ?6
         WHERE id = ?1",
        rusqlite::params![
            user_id,
            name,
            telegram_id,
            role.as_str(),
            daily_rate.map(|rate| rate.to_plain_string()),
            now_rfc3339(),
        ],
    )?;

    if let Some(password) = input.password.as_deref() {
        let hash = hash_secret(password)?;
        session.conn().execute(
            "UPDATE auth_credentials SET password_hash = ?2, updated_at = ?3 WHERE user_id = ?1",
            rusqlite::params![user_id, hash, now_rfc3339()],
        )?;
    }
    if let Some(pin) = input.pin_code.as_deref() {
        let hash = hash_secret(pin)?;
        let fingerprint = pin_fingerprint(config, pin)?;
        session.conn().execute(
            "UPDATE auth_credentials SET pin_hash = ?2, pin_fingerprint = ?3, updated_at = ?4
             WHERE user_id = ?1",
            rusqlite::params![user_id, hash, fingerprint, now_rfc3339()],
        )?;
    }

    session.mark_mutation()?;
    crew_audit::append(
        session,
        actor,
        "user.update",
        "user",
        Some(user_id),
        &serde_json::json!({"name": name}),
        AuditOutcome::Applied,
        None,
    )?;
    session.queue_metric("user.update", serde_json::json!({"user_id": user_id}));
    get(session.conn(), user_id)
}

/// Activate or deactivate. Re-applying the current status is a noop, not an
/// error, so bot retries stay safe.
pub fn set_status(
    session: &mut Session,
    actor: &str,
    user_id: i64,
    status: UserStatus,
) -> AuthResult<User> {
    let existing = get(session.conn(), user_id)?;
    let action = match status {
        UserStatus::Active => "user.activate",
        UserStatus::Inactive => "user.deactivate",
    };
    if existing.status == status {
        session.mark_mutation()?;
        crew_audit::append(
            session,
            actor,
            action,
            "user",
            Some(user_id),
            &serde_json::json!({"status": status.as_str()}),
            AuditOutcome::Noop,
            None,
        )?;
        session.queue_metric(action, serde_json::json!({"user_id": user_id, "noop": true}));
        return Ok(existing);
    }

    session.conn().execute(
        "UPDATE users SET status = ?2, updated_at = ?3 WHERE id = ?1",
        rusqlite::params![user_id, status.as_str(), now_rfc3339()],
    )?;
    session.mark_mutation()?;
    crew_audit::append(
        session,
        actor,
        action,
        "user",
        Some(user_id),
        &serde_json::json!({"status": status.as_str()}),
        AuditOutcome::Applied,
        None,
    )?;
    session.queue_metric(action, serde_json::json!({"user_id": user_id}));
    get(session.conn(), user_id)
}

pub fn get(conn: &Connection, user_id: i64) -> AuthResult<User> {
    conn.query_row(
        "SELECT id, name, telegram_id, role, status, daily_rate, created_at, updated_at
         FROM users WHERE id = ?1",
        [user_id],
        map_user,
    )
    .optional()?
    .ok_or_else(|| AuthError::NotFound(format!("user {user_id}")))
}

pub fn find_by_name(conn: &Connection, name: &str) -> AuthResult<Option<User>> {
    Ok(conn
        .query_row(
            "SELECT id, name, telegram_id, role, status, daily_rate, created_at, updated_at
             FROM users WHERE name = ?1",
            [name],
            map_user,
        )
        .optional()?)
}

pub fn find_by_telegram(conn: &Connection, telegram_id: i64) -> AuthResult<Option<User>> {
    Ok(conn
        .query_row(
            "SELECT id, name, telegram_id, role, status, daily_rate, created_at, updated_at
             FROM users WHERE telegram_id = ?1",
            [telegram_id],
            map_user,
        )
        .optional()?)
}

pub fn list(conn: &Connection, page: u32, limit: u32) -> AuthResult<Paginated<User>> {
    let page = page.max(1);
    let limit = limit.clamp(1, 100);
    let total: u64 = conn.query_row("SELECT COUNT(*) FROM users", [], |row| {
        row.get::<_, i64>(0).map(|count| count as u64)
    })?;
    let offset = (page - 1) * limit;
    let mut stmt = conn.prepare(
        "SELECT id, name, telegram_id, role, status, daily_rate, created_at, updated_at
         FROM users ORDER BY id LIMIT ?1 OFFSET ?2",
    )?;
    let items = stmt
        .query_map(rusqlite::params![limit, offset], map_user)?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(Paginated {
        items,
        page,
        limit,
        total,
    })
}

fn map_user(row: &rusqlite::Row<'_>) -> rusqlite::Result<User> {
    let role_raw: String = row.get(3)?;
    let status_raw: String = row.get(4)?;
    let daily_rate: Option<String> = row.get(5)?;
    let created_at: String = row.get(6)?;
    let updated_at: String = row.get(7)?;
    Ok(User {
        id: row.get(0)?,
        name: row.get(1)?,
        telegram_id: row.get(2)?,
        role: Role::parse(&role_raw).unwrap_or(Role::Worker),
        status: UserStatus::parse(&status_raw).unwrap_or(UserStatus::Inactive),
        daily_rate: daily_rate.and_then(|raw| Money::parse(&raw).ok()),
        created_at: parse_ts(&created_at),
        updated_at: parse_ts(&updated_at),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::AuthConfig;
    use crew_metrics::MetricsSink;
    use crew_store::SessionMode;
    use crew_store::Store;
    use pretty_assertions::assert_eq;
    use rust_decimal_macros::dec;
    use std::sync::Arc;
    use tempfile::TempDir;

    fn setup(dir: &TempDir) -> (Store, Arc<MetricsSink>, AuthConfig) {
        let store = Store::open(dir.path().join("crew.db")).expect("open store");
        store.migrate().expect("migrate");
        let metrics = Arc::new(MetricsSink::new(dir.path().join("metrics")));
        (store, metrics, AuthConfig::new("jwt-secret", "admin-secret"))
    }

    fn make(name: &str, role: Role, telegram_id: Option<i64>) -> UserCreate {
        UserCreate {
            name: name.into(),
            telegram_id,
            role,
            daily_rate: Some(Money::new(dec!(1200))),
            password: None,
            pin_code: None,
        }
    }

    #[test]
    fn create_then_list_pages_users() {
        let dir = TempDir::new().expect("temp dir");
        let (store, metrics, config) = setup(&dir);

        let mut session = store
            .session(SessionMode::ReadWrite, Arc::clone(&metrics))
            .expect("session");
        for n in 0..5 {
            create(
                &mut session,
                &config,
                "admin",
                make(&format!("worker-{n}"), Role::Worker, Some(100 + n)),
            )
            .expect("create");
        }
        session.commit().expect("commit");

        let conn = store.raw_conn().expect("conn");
        let first_page = list(&conn, 1, 2).expect("list");
        assert_eq!(first_page.total, 5);
        assert_eq!(first_page.items.len(), 2);
        assert_eq!(first_page.items[0].name, "worker-0");
        let last_page = list(&conn, 3, 2).expect("list");
        assert_eq!(last_page.items.len(), 1);
        assert_eq!(last_page.items[0].daily_rate, Some(Money::new(dec!(1200))));
    }

    #[test]
    fn duplicate_telegram_id_conflicts() {
        let dir = TempDir::new().expect("temp dir");
        let (store, metrics, config) = setup(&dir);

        let mut session = store
            .session(SessionMode::ReadWrite, metrics)
            .expect("session");
        create(
            &mut session,
            &config,
            "admin",
            make("first", Role::Worker, Some(222)),
        )
        .expect("create");
        let err = create(
            &mut session,
            &config,
            "admin",
            make("second", Role::Worker, Some(222)),
        )
        .expect_err("duplicate telegram id");
        assert!(matches!(err, AuthError::Conflict(_)));
    }

    #[test]
    fn deactivate_is_idempotent() {
        let dir = TempDir::new().expect("temp dir");
        let (store, metrics, config) = setup(&dir);

        let mut session = store
            .session(SessionMode::ReadWrite, Arc::clone(&metrics))
            .expect("session");
        let user = create(
            &mut session,
            &config,
            "admin",
            make("mosh", Role::Worker, None),
        )
        .expect("create");
        session.commit().expect("commit");

        let mut session = store
            .session(SessionMode::ReadWrite, Arc::clone(&metrics))
            .expect("session");
        let deactivated = set_status(&mut session, "admin", user.id, UserStatus::Inactive)
            .expect("deactivate");
        assert_eq!(deactivated.status, UserStatus::Inactive);
        let again = set_status(&mut session, "admin", user.id, UserStatus::Inactive)
            .expect("deactivate again");
        assert_eq!(again.status, UserStatus::Inactive);
        session.commit().expect("commit");

        let conn = store.raw_conn().expect("conn");
        let entries = crew_audit::by_target(&conn, "user", user.id).expect("audit");
        let outcomes: Vec<_> = entries.iter().map(|entry| entry.outcome).collect();
        assert!(outcomes.contains(&crew_audit::AuditOutcome::Applied));
        assert!(outcomes.contains(&crew_audit::AuditOutcome::Noop));
    }

    #[test]
    fn patch_updates_selected_fields_only() {
        let dir = TempDir::new().expect("temp dir");
        let (store, metrics, config) = setup(&dir);

        let mut session = store
            .session(SessionMode::ReadWrite, metrics)
            .expect("session");
        let user = create(
            &mut session,
            &config,
            "admin",
            make("dana", Role::Foreman, Some(333)),
        )
        .expect("create");
        let patched = patch(
            &mut session,
            &config,
            "admin",
            user.id,
            UserPatch {
                daily_rate: Some(Money::new(dec!(1500))),
                ..UserPatch::default()
            },
        )
        .expect("patch");
        assert_eq!(patched.name, "dana");
        assert_eq!(patched.telegram_id, Some(333));
        assert_eq!(patched.daily_rate, Some(Money::new(dec!(1500))));
        assert_eq!(patched.role, Role::Foreman);
    }
}
