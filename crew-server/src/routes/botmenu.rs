use std::sync::Arc;

use axum::Json;
use axum::extract::State;
use serde::Deserialize;
use serde_json::json;

use crew_store::SessionMode;
use crew_worklog::botmenu;
use crew_worklog::botmenu::CommandUpdate;

use crate::AppState;
use crate::DEFAULT_BUDGET;
use crate::error::ApiError;
use crate::extract::Caller;

pub async fn show(
    State(state): State<AppState>,
    Caller(caller): Caller,
) -> Result<Json<serde_json::Value>, ApiError> {
    caller.require_admin()?;
    state
        .run_blocking(DEFAULT_BUDGET, move |state| {
            let conn = state.store.raw_conn()?;
            let config = botmenu::config(&conn)?;
            let commands = botmenu::commands(&conn)?;
            Ok(Json(json!({ "config": config, "commands": commands })))
        })
        .await
}

#[derive(Debug, Deserialize)]
pub struct MenuUpdateBody {
    pub version: i64,
    pub commands: Vec<CommandUpdate>,
}

pub async fn update(
    State(state): State<AppState>,
    Caller(caller): Caller,
    Json(body): Json<MenuUpdateBody>,
) -> Result<Json<serde_json::Value>, ApiError> {
    caller.require_admin()?;
    state
        .run_blocking(DEFAULT_BUDGET, move |state| {
            let mut session = state
                .store
                .session(SessionMode::ReadWrite, Arc::clone(&state.metrics))?;
            match botmenu::update(&mut session, &caller.name, body.version, &body.commands) {
                Ok(config) => {
                    session.commit()?;
                    Ok(Json(json!({ "config": config })))
                }
                Err(err) => {
                    session.rollback();
                    let api: ApiError = err.into();
                    state.record_rejection(&caller.name, "botmenu.update", &api.code);
                    Err(api)
                }
            }
        })
        .await
}

pub async fn apply(
    State(state): State<AppState>,
    Caller(caller): Caller,
) -> Result<Json<serde_json::Value>, ApiError> {
    caller.require_admin()?;
    state
        .run_blocking(DEFAULT_BUDGET, move |state| {
            let mut session = state
                .store
                .session(SessionMode::ReadWrite, Arc::clone(&state.metrics))?;
            match botmenu::mark_applied(&mut session, &caller.name) {
                Ok(config) => {
                    session.commit()?;
                    Ok(Json(json!({ "config": config })))
                }
                Err(err) => {
                    session.rollback();
                    let api: ApiError = err.into();
                    state.record_rejection(&caller.name, "botmenu.apply", &api.code);
                    Err(api)
                }
            }
        })
        .await
}
