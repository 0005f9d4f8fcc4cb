use std::sync::Arc;

use axum::Json;
use axum::extract::Path;
use axum::extract::Query;
use axum::extract::State;
use axum::http::HeaderMap;
use serde::Deserialize;
use serde_json::json;

use crew_moderation::BulkItemRef;
use crew_moderation::BulkOutcome;
use crew_moderation::Decision;
use crew_moderation::InboxFilter;
use crew_moderation::PendingItem;
use crew_moderation::PendingKind;
use crew_store::IdempotencyOutcome;
use crew_store::Paginated;
use crew_store::SessionMode;

use crate::AppState;
use crate::error::ApiError;
use crate::extract::Caller;
use crate::extract::require_idempotency_key;

pub async fn list(
    State(state): State<AppState>,
    Caller(caller): Caller,
    Query(filter): Query<InboxFilter>,
) -> Result<Json<Paginated<PendingItem>>, ApiError> {
    caller.require_moderator()?;
    state
        .run_blocking(crate::DEFAULT_BUDGET, move |state| {
            let conn = state.store.raw_conn()?;
            let page = crew_moderation::list_inbox(&conn, &filter)?;
            Ok(Json(page))
        })
        .await
}

#[derive(Debug, Deserialize)]
pub struct KindQuery {
    pub kind: String,
}

#[derive(Debug, Default, Deserialize)]
pub struct ActionBody {
    #[serde(default)]
    pub reason: Option<String>,
}

pub async fn approve(
    state: State<AppState>,
    caller: Caller,
    path: Path<i64>,
    query: Query<KindQuery>,
    body: axum::body::Bytes,
) -> Result<Json<serde_json::Value>, ApiError> {
    single(state, caller, path, query, body, Decision::Approve).await
}

pub async fn reject(
    state: State<AppState>,
    caller: Caller,
    path: Path<i64>,
    query: Query<KindQuery>,
    body: axum::body::Bytes,
) -> Result<Json<serde_json::Value>, ApiError> {
    single(state, caller, path, query, body, Decision::Reject).await
}

async fn single(
    State(state): State<AppState>,
    Caller(caller): Caller,
    Path(id): Path<i64>,
    Query(query): Query<KindQuery>,
    body: axum::body::Bytes,
    decision: Decision,
) -> Result<Json<serde_json::Value>, ApiError> {
    caller.require_moderator()?;
    let kind = PendingKind::parse(&query.kind)
        .ok_or_else(|| ApiError::validation(format!("unknown kind {}", query.kind)))?;
    // The body is optional: an absent or empty payload means no reason.
    let reason = if body.is_empty() {
        None
    } else {
        serde_json::from_slice::<ActionBody>(&body)
            .map_err(|err| ApiError::validation(format!("bad request body: {err}")))?
            .reason
    };

    state
        .run_blocking(crate::DEFAULT_BUDGET, move |state| {
            let mut session = state
                .store
                .session(SessionMode::ReadWrite, Arc::clone(&state.metrics))?;
            match crew_moderation::act(
                &mut session,
                &caller.name,
                kind,
                id,
                decision,
                reason.as_deref(),
            ) {
                Ok(outcome) => {
                    session.commit()?;
                    let status = match outcome {
                        crew_moderation::ActionOutcome::Applied => "applied",
                        crew_moderation::ActionOutcome::Noop => "noop",
                    };
                    Ok(Json(json!({ "status": status })))
                }
                Err(err) => {
                    session.rollback();
                    let api: ApiError = err.into();
                    state.record_rejection(&caller.name, "moderation.single", &api.code);
                    Err(api)
                }
            }
        })
        .await
}

#[derive(Debug, Deserialize)]
pub struct BulkBody {
    pub items: Vec<BulkItemRef>,
    #[serde(default)]
    pub reason: Option<String>,
}

pub async fn bulk_approve(
    state: State<AppState>,
    caller: Caller,
    headers: HeaderMap,
    body: Json<BulkBody>,
) -> Result<Json<BulkOutcome>, ApiError> {
    bulk(state, caller, headers, body, Decision::Approve).await
}

pub async fn bulk_reject(
    state: State<AppState>,
    caller: Caller,
    headers: HeaderMap,
    body: Json<BulkBody>,
) -> Result<Json<BulkOutcome>, ApiError> {
    bulk(state, caller, headers, body, Decision::Reject).await
}

async fn bulk(
    State(state): State<AppState>,
    Caller(caller): Caller,
    headers: HeaderMap,
    Json(body): Json<BulkBody>,
    decision: Decision,
) -> Result<Json<BulkOutcome>, ApiError> {
    caller.require_moderator()?;
    let key = require_idempotency_key(&headers)?;
    let budget = AppState::bulk_budget(body.items.len());

    state
        .run_blocking(budget, move |state| {
            let mut session = state
                .store
                .session(SessionMode::ReadWrite, Arc::clone(&state.metrics))?;

            let scope = json!({
                "op": match decision {
                    Decision::Approve => "bulk.approve",
                    Decision::Reject => "bulk.reject",
                },
                "items": body.items,
                "reason": body.reason,
                "by": caller.name,
            });
            match crew_store::ensure_idempotent(&mut session, &key, &scope)? {
                IdempotencyOutcome::Fresh => {}
                IdempotencyOutcome::Replay { scope_hash, .. } => {
                    session.rollback();
                    state.record_rejection(
                        &caller.name,
                        "moderation.bulk",
                        "duplicate_idempotency_key",
                    );
                    return Err(ApiError::duplicate_key(scope_hash));
                }
            }

            match crew_moderation::bulk(
                &mut session,
                &caller.name,
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
                    state.record_rejection(&caller.name, "moderation.bulk", &api.code);
                    Err(api)
                }
            }
        })
        .await
}
