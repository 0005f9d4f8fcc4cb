use axum::Json;
use axum::extract::State;
use serde::Deserialize;
use serde_json::json;

use crew_auth::TokenResponse;
use crew_store::SessionMode;
use std::sync::Arc;

use crate::AppState;
use crate::DEFAULT_BUDGET;
use crate::error::ApiError;
use crate::extract::Caller;

/// `{username, password}` authenticates the web channel; `{pin_code}` the
/// bot channel.
#[derive(Debug, Deserialize)]
pub struct LoginRequest {
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
    #[serde(default)]
    pub pin_code: Option<String>,
}

pub async fn login(
    State(state): State<AppState>,
    Json(body): Json<LoginRequest>,
) -> Result<Json<TokenResponse>, ApiError> {
    state
        .run_blocking(DEFAULT_BUDGET, move |state| {
            let mut session = state
                .store
                .session(SessionMode::ReadWrite, Arc::clone(&state.metrics))?;
            let outcome = match (&body.username, &body.password, &body.pin_code) {
                (Some(username), Some(password), None) => {
                    crew_auth::login_password(&mut session, &state.auth, username, password)
                }
                (None, None, Some(pin_code)) => {
                    crew_auth::login_pin(&mut session, &state.auth, pin_code)
                }
                _ => {
                    return Err(ApiError::validation(
                        "provide either username+password or pin_code",
                    ));
                }
            };
            match outcome {
                Ok(tokens) => {
                    session.commit()?;
                    Ok(Json(tokens))
                }
                Err(err) => {
                    session.rollback();
                    let api: ApiError = err.into();
                    state.record_rejection("login", "auth.login", &api.code);
                    Err(api)
                }
            }
        })
        .await
}

#[derive(Debug, Deserialize)]
pub struct RefreshRequest {
    pub refresh_token: String,
}

pub async fn refresh(
    State(state): State<AppState>,
    Json(body): Json<RefreshRequest>,
) -> Result<Json<TokenResponse>, ApiError> {
    state
        .run_blocking(DEFAULT_BUDGET, move |state| {
            let mut session = state
                .store
                .session(SessionMode::ReadWrite, Arc::clone(&state.metrics))?;
            match crew_auth::refresh(&mut session, &state.auth, &body.refresh_token) {
                Ok(tokens) => {
                    session.commit()?;
                    Ok(Json(tokens))
                }
                Err(err) => {
                    session.rollback();
                    let api: ApiError = err.into();
                    state.record_rejection("refresh", "auth.refresh", &api.code);
                    Err(api)
                }
            }
        })
        .await
}

pub async fn me(
    State(state): State<AppState>,
    Caller(caller): Caller,
) -> Result<Json<serde_json::Value>, ApiError> {
    state
        .run_blocking(DEFAULT_BUDGET, move |state| {
            let employee = match caller.user_id {
                Some(user_id) => {
                    let conn = state.store.raw_conn()?;
                    serde_json::to_value(crew_auth::users::get(&conn, user_id)?)
                        .map_err(|err| ApiError::internal(err.to_string()))?
                }
                None => json!({"name": caller.name, "role": caller.role}),
            };
            Ok(Json(json!({
                "employee": employee,
                "permissions": permissions(caller.role),
            })))
        })
        .await
}

fn permissions(role: crew_auth::Role) -> Vec<&'static str> {
    match role {
        crew_auth::Role::Admin => vec![
            "users.manage",
            "clients.manage",
            "moderation.act",
            "invoices.manage",
            "reports.read",
            "submissions.create",
            "settings.backup",
        ],
        crew_auth::Role::Foreman => vec!["moderation.act", "reports.read", "submissions.create"],
        crew_auth::Role::Worker => vec!["submissions.create"],
    }
}
