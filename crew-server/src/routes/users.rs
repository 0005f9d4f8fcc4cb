use std::sync::Arc;

use axum::Json;
use axum::extract::Path;
use axum::extract::Query;
use axum::extract::State;
use serde::Deserialize;

use crew_auth::User;
use crew_auth::UserCreate;
use crew_auth::UserPatch;
use crew_auth::UserStatus;
use crew_store::Paginated;
use crew_store::SessionMode;

use crate::AppState;
use crate::DEFAULT_BUDGET;
use crate::error::ApiError;
use crate::extract::Caller;

#[derive(Debug, Deserialize)]
pub struct PageQuery {
    #[serde(default)]
    pub page: Option<u32>,
    #[serde(default)]
    pub limit: Option<u32>,
}

pub async fn list(
    State(state): State<AppState>,
    Caller(caller): Caller,
    Query(query): Query<PageQuery>,
) -> Result<Json<Paginated<User>>, ApiError> {
    caller.require_admin()?;
    state
        .run_blocking(DEFAULT_BUDGET, move |state| {
            let conn = state.store.raw_conn()?;
            let page = crew_auth::users::list(
                &conn,
                query.page.unwrap_or(1),
                query.limit.unwrap_or(20),
            )?;
            Ok(Json(page))
        })
        .await
}

pub async fn create(
    State(state): State<AppState>,
    Caller(caller): Caller,
    Json(body): Json<UserCreate>,
) -> Result<Json<User>, ApiError> {
    caller.require_admin()?;
    state
        .run_blocking(DEFAULT_BUDGET, move |state| {
            let mut session = state
                .store
                .session(SessionMode::ReadWrite, Arc::clone(&state.metrics))?;
            match crew_auth::users::create(&mut session, &state.auth, &caller.name, body) {
                Ok(user) => {
                    session.commit()?;
                    Ok(Json(user))
                }
                Err(err) => {
                    session.rollback();
                    let api: ApiError = err.into();
                    state.record_rejection(&caller.name, "user.create", &api.code);
                    Err(api)
                }
            }
        })
        .await
}

pub async fn patch(
    State(state): State<AppState>,
    Caller(caller): Caller,
    Path(user_id): Path<i64>,
    Json(body): Json<UserPatch>,
) -> Result<Json<User>, ApiError> {
    caller.require_admin()?;
    state
        .run_blocking(DEFAULT_BUDGET, move |state| {
            let mut session = state
                .store
                .session(SessionMode::ReadWrite, Arc::clone(&state.metrics))?;
            match crew_auth::users::patch(&mut session, &state.auth, &caller.name, user_id, body) {
                Ok(user) => {
                    session.commit()?;
                    Ok(Json(user))
                }
                Err(err) => {
                    session.rollback();
                    let api: ApiError = err.into();
                    state.record_rejection(&caller.name, "user.update", &api.code);
                    Err(api)
                }
            }
        })
        .await
}

pub async fn activate(
    state: State<AppState>,
    caller: Caller,
    path: Path<i64>,
) -> Result<Json<User>, ApiError> {
    set_status(state, caller, path, UserStatus::Active).await
}

pub async fn deactivate(
    state: State<AppState>,
    caller: Caller,
    path: Path<i64>,
) -> Result<Json<User>, ApiError> {
    set_status(state, caller, path, UserStatus::Inactive).await
}

async fn set_status(
    State(state): State<AppState>,
    Caller(caller): Caller,
    Path(user_id): Path<i64>,
    status: UserStatus,
) -> Result<Json<User>, ApiError> {
    caller.require_admin()?;
    state
        .run_blocking(DEFAULT_BUDGET, move |state| {
            let mut session = state
                .store
                .session(SessionMode::ReadWrite, Arc::clone(&state.metrics))?;
            match crew_auth::users::set_status(&mut session, &caller.name, user_id, status) {
                Ok(user) => {
                    session.commit()?;
                    Ok(Json(user))
                }
                Err(err) => {
                    session.rollback();
                    let api: ApiError = err.into();
                    state.record_rejection(&caller.name, "user.set_status", &api.code);
                    Err(api)
                }
            }
        })
        .await
}
