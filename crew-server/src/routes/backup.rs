use std::sync::Arc;

use axum::Json;
use axum::extract::State;
use serde::Deserialize;
use serde_json::json;

use crew_audit::AuditOutcome;
use crew_backup::BackupStatus;
use crew_backup::ManifestEntry;
use crew_store::SessionMode;

use crate::AppState;
use crate::MAX_BUDGET;
use crate::error::ApiError;
use crate::extract::Caller;

pub async fn status(
    State(state): State<AppState>,
    Caller(caller): Caller,
) -> Result<Json<BackupStatus>, ApiError> {
    caller.require_admin()?;
    state
        .run_blocking(crate::DEFAULT_BUDGET, move |state| {
            Ok(Json(crew_backup::status(&state.backups_dir)?))
        })
        .await
}

pub async fn create(
    State(state): State<AppState>,
    Caller(caller): Caller,
) -> Result<Json<ManifestEntry>, ApiError> {
    caller.require_admin()?;
    state
        .run_blocking(MAX_BUDGET, move |state| {
            match crew_backup::create(&state.store, &state.backups_dir) {
                Ok(entry) => {
                    // Backups run outside a store transaction; the trail is
                    // written after the copy lands.
                    record_backup_event(&state, &caller.name, "backup.create", &entry.file);
                    Ok(Json(entry))
                }
                Err(err) => {
                    let api: ApiError = err.into();
                    state.record_rejection(&caller.name, "backup.create", &api.code);
                    Err(api)
                }
            }
        })
        .await
}

#[derive(Debug, Deserialize)]
pub struct RestoreBody {
    pub file: String,
}

pub async fn restore(
    State(state): State<AppState>,
    Caller(caller): Caller,
    Json(body): Json<RestoreBody>,
) -> Result<Json<serde_json::Value>, ApiError> {
    caller.require_admin()?;
    state
        .run_blocking(MAX_BUDGET, move |state| {
            match crew_backup::restore(&state.store, &state.backups_dir, &body.file) {
                Ok(()) => {
                    record_backup_event(&state, &caller.name, "backup.restore", &body.file);
                    Ok(Json(json!({"status": "restored", "file": body.file})))
                }
                Err(err) => {
                    let api: ApiError = err.into();
                    state.record_rejection(&caller.name, "backup.restore", &api.code);
                    Err(api)
                }
            }
        })
        .await
}

fn record_backup_event(state: &AppState, actor: &str, action: &str, file: &str) {
    let attempt = (|| -> Result<(), String> {
        let mut session = state
            .store
            .session(SessionMode::ReadWrite, Arc::clone(&state.metrics))
            .map_err(|err| err.to_string())?;
        crew_audit::append(
            &mut session,
            actor,
            action,
            "backup",
            None,
            &json!({"file": file}),
            AuditOutcome::Applied,
            None,
        )
        .map_err(|err| err.to_string())?;
        session.queue_metric(action, json!({"file": file}));
        session.commit().map_err(|err| err.to_string())
    })();
    if let Err(err) = attempt {
        tracing::warn!(action, error = %err, "failed to audit backup event");
    }
}
