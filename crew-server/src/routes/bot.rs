//! Bot automation endpoints. The bot authenticates with the shared admin
//! secret and acts on behalf of the moderator identified by `telegram_id`.

use std::sync::Arc;

use axum::Json;
use axum::extract::Query;
use axum::extract::State;
use serde::Deserialize;
use serde_json::json;

use crew_auth::Channel;
use crew_moderation::BulkItemRef;
use crew_moderation::BulkOutcome;
use crew_moderation::Decision;
use crew_moderation::InboxFilter;
use crew_moderation::ItemDetails;
use crew_moderation::PendingItem;
use crew_moderation::PendingKind;
use crew_store::Paginated;
use crew_store::SessionMode;

use crate::AppState;
use crate::DEFAULT_BUDGET;
use crate::error::ApiError;
use crate::extract::Caller;

fn require_automation(caller: &crew_auth::AuthCaller) -> Result<(), ApiError> {
    if caller.channel == Channel::Automation {
        Ok(())
    } else {
        Err(ApiError::forbidden_role(
            "bot endpoints require the automation channel",
        ))
    }
}

/// Resolves the acting moderator from a telegram id; workers are refused.
fn moderator_by_telegram(
    conn: &rusqlite::Connection,
    telegram_id: i64,
) -> Result<crew_auth::User, ApiError> {
    let user = crew_auth::users::find_by_telegram(conn, telegram_id)?
        .ok_or_else(|| ApiError::not_found(format!("telegram user {telegram_id}")))?;
    if !user.role.can_moderate() {
        return Err(ApiError::forbidden_role(format!(
            "{} cannot moderate",
            user.role.as_str()
        )));
    }
    if user.status != crew_auth::UserStatus::Active {
        return Err(ApiError::forbidden_role("moderator is deactivated"));
    }
    Ok(user)
}

#[derive(Debug, Deserialize)]
pub struct BotInboxQuery {
    pub telegram_id: i64,
    #[serde(default)]
    pub kind: Option<PendingKind>,
    #[serde(default)]
    pub worker: Option<String>,
    #[serde(default)]
    pub date_from: Option<String>,
    #[serde(default)]
    pub date_to: Option<String>,
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default)]
    pub page: Option<u32>,
    #[serde(default)]
    pub limit: Option<u32>,
}

impl BotInboxQuery {
    fn filter(&self) -> InboxFilter {
        InboxFilter {
            kind: self.kind,
            worker: self.worker.clone(),
            date_from: self.date_from.clone(),
            date_to: self.date_to.clone(),
            status: self.status.clone(),
            page: self.page,
            limit: self.limit,
        }
    }
}

pub async fn inbox(
    State(state): State<AppState>,
    Caller(caller): Caller,
    Query(query): Query<BotInboxQuery>,
) -> Result<Json<Paginated<PendingItem>>, ApiError> {
    require_automation(&caller)?;
    state
        .run_blocking(DEFAULT_BUDGET, move |state| {
            let mut session = state
                .store
                .session(SessionMode::Read, Arc::clone(&state.metrics))?;
            let moderator = moderator_by_telegram(session.conn(), query.telegram_id)?;
            let page = crew_moderation::list_inbox(session.conn(), &query.filter())?;
            session.queue_metric(
                "bot.inbox.list",
                json!({"telegram_id": query.telegram_id, "moderator": moderator.name, "total": page.total}),
            );
            session.commit()?;
            Ok(Json(page))
        })
        .await
}

#[derive(Debug, Deserialize)]
pub struct ItemDetailsQuery {
    pub kind: String,
    pub id: i64,
}

pub async fn item_details(
    State(state): State<AppState>,
    Caller(caller): Caller,
    Query(query): Query<ItemDetailsQuery>,
) -> Result<Json<ItemDetails>, ApiError> {
    require_automation(&caller)?;
    let kind = PendingKind::parse(&query.kind)
        .ok_or_else(|| ApiError::validation(format!("unknown kind {}", query.kind)))?;
    state
        .run_blocking(DEFAULT_BUDGET, move |state| {
            let mut session = state
                .store
                .session(SessionMode::Read, Arc::clone(&state.metrics))?;
            let details =
                crew_moderation::item_details(&mut session, &state.pricing, kind, query.id)?;
            session.commit()?;
            Ok(Json(details))
        })
        .await
}

#[derive(Debug, Deserialize)]
pub struct BotBulkBody {
    pub telegram_id: i64,
    pub items: Vec<BulkItemRef>,
    #[serde(default)]
    pub reason: Option<String>,
}

pub async fn approve(
    state: State<AppState>,
    caller: Caller,
    body: Json<BotBulkBody>,
) -> Result<Json<BulkOutcome>, ApiError> {
    act(state, caller, body, Decision::Approve).await
}

pub async fn reject(
    state: State<AppState>,
    caller: Caller,
    body: Json<BotBulkBody>,
) -> Result<Json<BulkOutcome>, ApiError> {
    act(state, caller, body, Decision::Reject).await
}

async fn act(
    State(state): State<AppState>,
    Caller(caller): Caller,
    Json(body): Json<BotBulkBody>,
    decision: Decision,
) -> Result<Json<BulkOutcome>, ApiError> {
    require_automation(&caller)?;
    let budget = AppState::bulk_budget(body.items.len());
    state
        .run_blocking(budget, move |state| {
            let mut session = state
                .store
                .session(SessionMode::ReadWrite, Arc::clone(&state.metrics))?;
            let moderator = moderator_by_telegram(session.conn(), body.telegram_id)?;
            match crew_moderation::bulk(
                &mut session,
                &moderator.name,
                decision,
                &body.items,
                body.reason.as_deref(),
            ) {
                Ok(outcome) => {
                    session.commit()?;
                    Ok(Json(outcome))
                }
                Err(err) => {
                    session.rollback();
                    let api: ApiError = err.into();
                    state.record_rejection(&moderator.name, "bot.moderation", &api.code);
                    Err(api)
                }
            }
        })
        .await
}
