//! Billing clients. Archived, never deleted.

use chrono::DateTime;
use chrono::Utc;
use rusqlite::Connection;
use rusqlite::OptionalExtension;
use serde::Deserialize;
use serde::Serialize;

use crew_audit::AuditOutcome;
use crew_store::Session;
use crew_store::now_rfc3339;
use crew_store::parse_ts;

use crate::WorklogError;
use crate::WorklogResult;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ClientStatus {
    Active,
    Archived,
}

impl ClientStatus {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            ClientStatus::Active => "active",
            ClientStatus::Archived => "archived",
        }
    }

    #[must_use]
    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "active" => Some(ClientStatus::Active),
            "archived" => Some(ClientStatus::Archived),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Client {
    pub id: i64,
    pub name: String,
    pub contact: Option<String>,
    pub default_pricing_rule: String,
    pub status: ClientStatus,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ClientCreate {
    pub name: String,
    #[serde(default)]
    pub contact: Option<String>,
    #[serde(default)]
    pub default_pricing_rule: Option<String>,
}

pub fn create(session: &mut Session, actor: &str, input: ClientCreate) -> WorklogResult<Client> {
    let name = input.name.trim();
    if name.is_empty() {
        return Err(WorklogError::Validation("client name must be provided".into()));
    }
    session.conn().execute(
        "INSERT INTO clients (name, contact, default_pricing_rule, created_at)
         VALUES (?1, ?2, ?3, ?4)",
        rusqlite::params![
            name,
            input.contact,
            input.default_pricing_rule.unwrap_or_else(|| "hour_general".into()),
            now_rfc3339(),
        ],
    )?;
    let client_id = session.conn().last_insert_rowid();
    session.mark_mutation()?;
    crew_audit::append(
        session,
        actor,
        "client.create",
        "client",
        Some(client_id),
        &serde_json::json!({"name": name}),
        AuditOutcome::Applied,
        None,
    )?;
    session.queue_metric("client.create", serde_json::json!({"client_id": client_id}));
    get(session.conn(), client_id)
}

/// Archiving an archived client is a noop.
pub fn archive(session: &mut Session, actor: &str, client_id: i64) -> WorklogResult<Client> {
    let client = get(session.conn(), client_id)?;
    session.mark_mutation()?;
    if client.status == ClientStatus::Archived {
        crew_audit::append(
            session,
            actor,
            "client.archive",
            "client",
            Some(client_id),
            &serde_json::json!({}),
            AuditOutcome::Noop,
            None,
        )?;
        session.queue_metric(
            "client.archive",
            serde_json::json!({"client_id": client_id, "noop": true}),
        );
        return Ok(client);
    }
    session.conn().execute(
        "UPDATE clients SET status = 'archived' WHERE id = ?1",
        [client_id],
    )?;
    crew_audit::append(
        session,
        actor,
        "client.archive",
        "client",
        Some(client_id),
        &serde_json::json!({}),
        AuditOutcome::Applied,
        None,
    )?;
    session.queue_metric("client.archive", serde_json::json!({"client_id": client_id}));
    get(session.conn(), client_id)
}

pub fn get(conn: &Connection, client_id: i64) -> WorklogResult<Client> {
    conn.query_row(
        "SELECT id, name, contact, default_pricing_rule, status, created_at
         FROM clients WHERE id = ?1",
        [client_id],
        map_client,
    )
    .optional()?
    .ok_or_else(|| WorklogError::NotFound(format!("client {client_id}")))
}

pub fn list(conn: &Connection, include_archived: bool) -> WorklogResult<Vec<Client>> {
    let sql = if include_archived {
        "SELECT id, name, contact, default_pricing_rule, status, created_at
         FROM clients ORDER BY id"
    } else {
        "SELECT id, name, contact, default_pricing_rule, status, created_at
         FROM clients WHERE status = 'active' ORDER BY id"
    };
    let mut stmt = conn.prepare(sql)?;
    let clients = stmt
        .query_map([], map_client)?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(clients)
}

fn map_client(row: &rusqlite::Row<'_>) -> rusqlite::Result<Client> {
    let status_raw: String = row.get(4)?;
    let created_at: String = row.get(5)?;
    Ok(Client {
        id: row.get(0)?,
        name: row.get(1)?,
        contact: row.get(2)?,
        default_pricing_rule: row.get(3)?,
        status: ClientStatus::parse(&status_raw).unwrap_or(ClientStatus::Active),
        created_at: parse_ts(&created_at),
    })
}
