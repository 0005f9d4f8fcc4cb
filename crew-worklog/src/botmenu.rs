//! Bot command catalog and the versioned menu configuration.
//!
//! Menu edits are optimistic: the caller sends the version it read and a
//! mismatch is a state conflict. Applying to the bot is a separate explicit
//! phase recorded on the config row.

use chrono::DateTime;
use chrono::Utc;
use rusqlite::Connection;
use serde::Deserialize;
use serde::Serialize;

use crew_audit::AuditOutcome;
use crew_store::Session;
use crew_store::now_rfc3339;
use crew_store::parse_ts;

use crate::WorklogError;
use crate::WorklogResult;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BotCommand {
    pub id: i64,
    pub role: String,
    pub command_key: String,
    pub telegram_command: String,
    pub label: String,
    pub description: String,
    pub enabled: bool,
    pub is_core: bool,
    pub position: i64,
    pub command_type: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MenuConfig {
    pub version: i64,
    pub last_updated_at: Option<DateTime<Utc>>,
    pub last_updated_by: Option<String>,
    pub last_applied_at: Option<DateTime<Utc>>,
    pub last_applied_by: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CommandUpdate {
    pub role: String,
    pub command_key: String,
    #[serde(default)]
    pub enabled: Option<bool>,
    #[serde(default)]
    pub label: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub position: Option<i64>,
}

pub fn config(conn: &Connection) -> WorklogResult<MenuConfig> {
    let config = conn.query_row(
        "SELECT version, last_updated_at, last_updated_by, last_applied_at, last_applied_by
         FROM bot_menu_config WHERE id = 1",
        [],
        |row| {
            let updated_at: Option<String> = row.get(1)?;
            let applied_at: Option<String> = row.get(3)?;
            Ok(MenuConfig {
                version: row.get(0)?,
                last_updated_at: updated_at.as_deref().map(parse_ts),
                last_updated_by: row.get(2)?,
                last_applied_at: applied_at.as_deref().map(parse_ts),
                last_applied_by: row.get(4)?,
            })
        },
    )?;
    Ok(config)
}

pub fn commands(conn: &Connection) -> WorklogResult<Vec<BotCommand>> {
    let mut stmt = conn.prepare(
        "SELECT id, role, command_key, telegram_command, label, description, enabled, is_core, position, command_type
         FROM bot_commands ORDER BY role, position, id",
    )?;
    let commands = stmt
        .query_map([], |row| {
            Ok(BotCommand {
                id: row.get(0)?,
                role: row.get(1)?,
                command_key: row.get(2)?,
                telegram_command: row.get(3)?,
                label: row.get(4)?,
                description: row.get(5)?,
                enabled: row.get::<_, i64>(6)? != 0,
                is_core: row.get::<_, i64>(7)? != 0,
                position: row.get(8)?,
                command_type: row.get(9)?,
            })
        })?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(commands)
}

/// Applies command edits under an optimistic version check and bumps the
/// config version. Core commands cannot be disabled.
pub fn update(
    session: &mut Session,
    actor: &str,
    expected_version: i64,
    updates: &[CommandUpdate],
) -> WorklogResult<MenuConfig> {
    let current = config(session.conn())?;
    if current.version != expected_version {
        return Err(WorklogError::StaleState(format!(
            "menu version is {}, update was built against {expected_version}",
            current.version
        )));
    }

    for change in updates {
        let existing: Option<(i64, bool)> = {
            let mut stmt = session.conn().prepare(
                "SELECT id, is_core FROM bot_commands WHERE role = ?1 AND command_key = ?2",
            )?;
            let mut rows = stmt.query_map(
                rusqlite::params![change.role, change.command_key],
                |row| Ok((row.get(0)?, row.get::<_, i64>(1)? != 0)),
            )?;
            rows.next().transpose()?
        };
        let Some((command_id, is_core)) = existing else {
            return Err(WorklogError::NotFound(format!(
                "bot command {}/{}",
                change.role, change.command_key
            )));
        };
        if is_core && change.enabled == Some(false) {
            return Err(WorklogError::Validation(format!(
                "core command {} cannot be disabled",
                change.command_key
            )));
        }
        session.conn().execute(
            "UPDATE bot_commands SET
                enabled = COALESCE(?2, enabled),
                label = COALESCE(?3, label),
                description = COALESCE(?4, description),
                position = COALESCE(?5, position)
             WHERE id = ?1",
            rusqlite::params![
                command_id,
                change.enabled.map(i64::from),
                change.label,
                change.description,
                change.position,
            ],
        )?;
    }

    session.conn().execute(
        "UPDATE bot_menu_config SET version = version + 1, last_updated_at = ?1, last_updated_by = ?2
         WHERE id = 1",
        rusqlite::params![now_rfc3339(), actor],
    )?;
    session.mark_mutation()?;
    crew_audit::append(
        session,
        actor,
        "botmenu.update",
        "bot_menu",
        Some(1),
        &serde_json::json!({"from_version": expected_version, "changes": updates.len()}),
        AuditOutcome::Applied,
        None,
    )?;
    session.queue_metric(
        "botmenu.update",
        serde_json::json!({"changes": updates.len()}),
    );
    config(session.conn())
}

/// Records the explicit "pushed to the bot" phase.
pub fn mark_applied(session: &mut Session, actor: &str) -> WorklogResult<MenuConfig> {
    session.conn().execute(
        "UPDATE bot_menu_config SET last_applied_at = ?1, last_applied_by = ?2 WHERE id = 1",
        rusqlite::params![now_rfc3339(), actor],
    )?;
    session.mark_mutation()?;
    crew_audit::append(
        session,
        actor,
        "botmenu.apply",
        "bot_menu",
        Some(1),
        &serde_json::json!({}),
        AuditOutcome::Applied,
        None,
    )?;
    session.queue_metric("botmenu.apply", serde_json::json!({}));
    config(session.conn())
}

/// Seeds the default per-role command catalog if the table is empty.
pub fn seed_defaults(session: &mut Session) -> WorklogResult<usize> {
    let count: i64 = session
        .conn()
        .query_row("SELECT COUNT(*) FROM bot_commands", [], |row| row.get(0))?;
    if count > 0 {
        return Ok(0);
    }
    let defaults: &[(&str, &str, &str, &str, bool)] = &[
        ("worker", "shift_start", "/shift_start", "Start shift", true),
        ("worker", "shift_end", "/shift_end", "End shift", true),
        ("worker", "task_add", "/task", "Log task", true),
        ("worker", "expense_add", "/expense", "Log expense", true),
        ("foreman", "inbox", "/inbox", "Moderation inbox", true),
        ("foreman", "approve", "/approve", "Approve items", true),
        ("foreman", "reject", "/reject", "Reject items", true),
        ("admin", "inbox", "/inbox", "Moderation inbox", true),
        ("admin", "invoices", "/invoices", "Invoices", false),
        ("admin", "reports", "/reports", "Reports", false),
    ];
    for (position, (role, key, telegram_command, label, is_core)) in defaults.iter().enumerate() {
        session.conn().execute(
            "INSERT INTO bot_commands (role, command_key, telegram_command, label, enabled, is_core, position, command_type)
             VALUES (?1, ?2, ?3, ?4, 1, ?5, ?6, 'menu')",
            rusqlite::params![role, key, telegram_command, label, i64::from(*is_core), position as i64],
        )?;
    }
    Ok(defaults.len())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crew_metrics::MetricsSink;
    use crew_store::SessionMode;
    use crew_store::Store;
    use pretty_assertions::assert_eq;
    use std::sync::Arc;
    use tempfile::TempDir;

    fn setup(dir: &TempDir) -> (Store, Arc<MetricsSink>) {
        let store = Store::open(dir.path().join("crew.db")).expect("open store");
        store.migrate().expect("migrate");
        (store, Arc::new(MetricsSink::new(dir.path().join("metrics"))))
    }

    #[test]
    fn stale_version_is_rejected() {
        let dir = TempDir::new().expect("temp dir");
        let (store, metrics) = setup(&dir);

        let mut session = store
            .session(SessionMode::ReadWrite, Arc::clone(&metrics))
            .expect("session");
        seed_defaults(&mut session).expect("seed");
        let current = config(session.conn()).expect("config");
        assert_eq!(current.version, 1);

        let updated = update(
            &mut session,
            "admin",
            1,
            &[CommandUpdate {
                role: "admin".into(),
                command_key: "reports".into(),
                enabled: Some(false),
                label: None,
                description: None,
                position: None,
            }],
        )
        .expect("update");
        assert_eq!(updated.version, 2);

        let err = update(&mut session, "admin", 1, &[]).expect_err("stale update");
        assert!(matches!(err, WorklogError::StaleState(_)));
    }

    #[test]
    fn core_commands_cannot_be_disabled() {
        let dir = TempDir::new().expect("temp dir");
        let (store, metrics) = setup(&dir);

        let mut session = store
            .session(SessionMode::ReadWrite, metrics)
            .expect("session");
        seed_defaults(&mut session).expect("seed");
        let err = update(
            &mut session,
            "admin",
            1,
            &[CommandUpdate {
                role: "worker".into(),
                command_key: "shift_start".into(),
                enabled: Some(false),
                label: None,
                description: None,
                position: None,
            }],
        )
        .expect_err("core disable");
        assert!(matches!(err, WorklogError::Validation(_)));
    }

    #[test]
    fn apply_phase_is_recorded_separately() {
        let dir = TempDir::new().expect("temp dir");
        let (store, metrics) = setup(&dir);

        let mut session = store
            .session(SessionMode::ReadWrite, Arc::clone(&metrics))
            .expect("session");
        seed_defaults(&mut session).expect("seed");
        let before = config(session.conn()).expect("config");
        assert!(before.last_applied_at.is_none());

        let after = mark_applied(&mut session, "admin").expect("apply");
        assert_eq!(after.last_applied_by.as_deref(), Some("admin"));
        assert!(after.last_applied_at.is_some());
        session.commit().expect("commit");
    }
}
