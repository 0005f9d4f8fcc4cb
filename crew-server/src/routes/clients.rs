use std::sync::Arc;

use axum::Json;
use axum::extract::Path;
use axum::extract::Query;
use axum::extract::State;
use serde::Deserialize;

use crew_store::SessionMode;
use crew_worklog::Client;
use crew_worklog::clients::ClientCreate;

use crate::AppState;
use crate::DEFAULT_BUDGET;
use crate::error::ApiError;
use crate::extract::Caller;

#[derive(Debug, Deserialize)]
pub struct ClientListQuery {
    #[serde(default)]
    pub include_archived: Option<bool>,
}

pub async fn list(
    State(state): State<AppState>,
    Caller(caller): Caller,
    Query(query): Query<ClientListQuery>,
) -> Result<Json<Vec<Client>>, ApiError> {
    caller.require_admin()?;
    state
        .run_blocking(DEFAULT_BUDGET, move |state| {
            let conn = state.store.raw_conn()?;
            let clients =
                crew_worklog::clients::list(&conn, query.include_archived.unwrap_or(false))?;
            Ok(Json(clients))
        })
        .await
}

pub async fn create(
    State(state): State<AppState>,
    Caller(caller): Caller,
    Json(body): Json<ClientCreate>,
) -> Result<Json<Client>, ApiError> {
    caller.require_admin()?;
    state
        .run_blocking(DEFAULT_BUDGET, move |state| {
            let mut session = state
                .store
                .session(SessionMode::ReadWrite, Arc::clone(&state.metrics))?;
            match crew_worklog::clients::create(&mut session, &caller.name, body) {
                Ok(client) => {
                    session.commit()?;
                    Ok(Json(client))
                }
                Err(err) => {
                    session.rollback();
                    let api: ApiError = err.into();
                    state.record_rejection(&caller.name, "client.create", &api.code);
                    Err(api)
                }
            }
        })
        .await
}

pub async fn archive(
    State(state): State<AppState>,
    Caller(caller): Caller,
    Path(client_id): Path<i64>,
) -> Result<Json<Client>, ApiError> {
    caller.require_admin()?;
    state
        .run_blocking(DEFAULT_BUDGET, move |state| {
            let mut session = state
                .store
                .session(SessionMode::ReadWrite, Arc::clone(&state.metrics))?;
            match crew_worklog::clients::archive(&mut session, &caller.name, client_id) {
                Ok(client) => {
                    session.commit()?;
                    Ok(Json(client))
                }
                Err(err) => {
                    session.rollback();
                    let api: ApiError = err.into();
                    state.record_rejection(&caller.name, "client.archive", &api.code);
                    Err(api)
                }
            }
        })
        .await
}
