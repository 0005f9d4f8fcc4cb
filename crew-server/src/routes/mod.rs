pub mod auth;
pub mod backup;
pub mod bot;
pub mod botmenu;
pub mod clients;
pub mod exports;
pub mod invoices;
pub mod pending;
pub mod users;
pub mod worklog;

use axum::Json;
use axum::extract::State;
use serde_json::json;

use crate::AppState;

pub async fn health(State(state): State<AppState>) -> Json<serde_json::Value> {
    Json(json!({
        "status": "ok",
        "uptime_s": state.started_at.elapsed().as_secs(),
        "version": state.version,
    }))
}
