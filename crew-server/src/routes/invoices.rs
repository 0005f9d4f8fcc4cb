use std::sync::Arc;

use axum::Json;
use axum::extract::Path;
use axum::extract::Query;
use axum::extract::State;
use chrono::NaiveDate;
use serde::Deserialize;
use serde_json::json;

use crew_invoice::Invoice;
use crew_invoice::InvoiceStatus;
use crew_invoice::RenderedInvoice;
use crew_invoice::Suggestion;
use crew_store::SessionMode;

use crate::AppState;
use crate::DEFAULT_BUDGET;
use crate::error::ApiError;
use crate::extract::Caller;

#[derive(Debug, Deserialize)]
pub struct BuildBody {
    pub client_id: i64,
    pub period_from: NaiveDate,
    pub period_to: NaiveDate,
    #[serde(default)]
    pub currency: Option<String>,
}

pub async fn build(
    State(state): State<AppState>,
    Caller(caller): Caller,
    Json(body): Json<BuildBody>,
) -> Result<Json<Invoice>, ApiError> {
    caller.require_admin()?;
    state
        .run_blocking(DEFAULT_BUDGET, move |state| {
            let mut session = state
                .store
                .session(SessionMode::ReadWrite, Arc::clone(&state.metrics))?;
            match crew_invoice::build(
                &mut session,
                &state.pricing,
                &caller.name,
                body.client_id,
                body.period_from,
                body.period_to,
                body.currency.as_deref(),
            ) {
                Ok(invoice) => {
                    session.commit()?;
                    Ok(Json(invoice))
                }
                Err(err) => {
                    session.rollback();
                    let api: ApiError = err.into();
                    state.record_rejection(&caller.name, "invoice.build", &api.code);
                    Err(api)
                }
            }
        })
        .await
}

pub async fn show(
    State(state): State<AppState>,
    Caller(caller): Caller,
    Path(invoice_id): Path<i64>,
) -> Result<Json<RenderedInvoice>, ApiError> {
    caller.require_admin()?;
    state
        .run_blocking(DEFAULT_BUDGET, move |state| {
            let conn = state.store.raw_conn()?;
            Ok(Json(crew_invoice::render(&conn, invoice_id)?))
        })
        .await
}

pub async fn preview_issue(
    State(state): State<AppState>,
    Caller(caller): Caller,
    Path(invoice_id): Path<i64>,
) -> Result<Json<serde_json::Value>, ApiError> {
    caller.require_admin()?;
    state
        .run_blocking(DEFAULT_BUDGET, move |state| {
            let mut session = state
                .store
                .session(SessionMode::ReadWrite, Arc::clone(&state.metrics))?;
            match crew_invoice::preview::issue(&mut session, &caller.name, invoice_id) {
                Ok(token) => {
                    session.commit()?;
                    Ok(Json(json!({ "token": token })))
                }
                Err(err) => {
                    session.rollback();
                    let api: ApiError = err.into();
                    state.record_rejection(&caller.name, "invoice.preview_issue", &api.code);
                    Err(api)
                }
            }
        })
        .await
}

#[derive(Debug, Deserialize)]
pub struct PreviewQuery {
    pub token: String,
}

/// Token-gated: no bearer auth, the capability string is the credential.
pub async fn preview_fetch(
    State(state): State<AppState>,
    Path(invoice_id): Path<i64>,
    Query(query): Query<PreviewQuery>,
) -> Result<Json<RenderedInvoice>, ApiError> {
    state
        .run_blocking(DEFAULT_BUDGET, move |state| {
            let mut session = state
                .store
                .session(SessionMode::ReadWrite, Arc::clone(&state.metrics))?;
            match crew_invoice::preview::fetch(&mut session, invoice_id, &query.token) {
                Ok(rendered) => {
                    session.commit()?;
                    Ok(Json(rendered))
                }
                Err(err) => {
                    session.rollback();
                    let api: ApiError = err.into();
                    state.record_rejection("preview-token", "invoice.preview_fetch", &api.code);
                    Err(api)
                }
            }
        })
        .await
}

#[derive(Debug, Deserialize)]
pub struct SuggestBody {
    pub invoice_id: i64,
    #[serde(default)]
    pub token: Option<String>,
    pub kind: String,
    pub payload: serde_json::Value,
}

pub async fn suggest_change(
    State(state): State<AppState>,
    Caller(caller): Caller,
    Json(body): Json<SuggestBody>,
) -> Result<Json<Suggestion>, ApiError> {
    caller.require_admin()?;
    state
        .run_blocking(DEFAULT_BUDGET, move |state| {
            let mut session = state
                .store
                .session(SessionMode::ReadWrite, Arc::clone(&state.metrics))?;
            match crew_invoice::suggest::suggest_change(
                &mut session,
                &caller.name,
                body.invoice_id,
                &body.kind,
                body.payload,
            ) {
                Ok(suggestion) => {
                    session.commit()?;
                    Ok(Json(suggestion))
                }
                Err(err @ crew_invoice::InvoiceError::ForbiddenOp(_)) => {
                    // The denial wrote its audit entry and metric; they must
                    // survive the 403.
                    session.commit()?;
                    Err(err.into())
                }
                Err(err) => {
                    session.rollback();
                    let api: ApiError = err.into();
                    state.record_rejection(&caller.name, "invoice.suggest_change", &api.code);
                    Err(api)
                }
            }
        })
        .await
}

#[derive(Debug, Deserialize)]
pub struct ApplyBody {
    pub invoice_id: i64,
    pub suggestion_ids: Vec<i64>,
}

pub async fn apply_suggestions(
    State(state): State<AppState>,
    Caller(caller): Caller,
    Json(body): Json<ApplyBody>,
) -> Result<Json<serde_json::Value>, ApiError> {
    caller.require_admin()?;
    let budget = AppState::bulk_budget(body.suggestion_ids.len());
    state
        .run_blocking(budget, move |state| {
            let mut session = state
                .store
                .session(SessionMode::ReadWrite, Arc::clone(&state.metrics))?;
            match crew_invoice::suggest::apply_suggestions(
                &mut session,
                &caller.name,
                body.invoice_id,
                &body.suggestion_ids,
            ) {
                Ok(outcome) => {
                    session.commit()?;
                    Ok(Json(json!({
                        "applied": outcome.applied,
                        "new_version": outcome.new_version,
                    })))
                }
                Err(err @ crew_invoice::InvoiceError::ForbiddenOp(_)) => {
                    session.commit()?;
                    Err(err.into())
                }
                Err(err) => {
                    session.rollback();
                    let api: ApiError = err.into();
                    state.record_rejection(&caller.name, "invoice.apply_suggestions", &api.code);
                    Err(api)
                }
            }
        })
        .await
}

pub async fn issue(
    state: State<AppState>,
    caller: Caller,
    path: Path<i64>,
) -> Result<Json<serde_json::Value>, ApiError> {
    transition(state, caller, path, InvoiceStatus::Issued).await
}

pub async fn pay(
    state: State<AppState>,
    caller: Caller,
    path: Path<i64>,
) -> Result<Json<serde_json::Value>, ApiError> {
    transition(state, caller, path, InvoiceStatus::Paid).await
}

pub async fn cancel(
    state: State<AppState>,
    caller: Caller,
    path: Path<i64>,
) -> Result<Json<serde_json::Value>, ApiError> {
    transition(state, caller, path, InvoiceStatus::Cancelled).await
}

async fn transition(
    State(state): State<AppState>,
    Caller(caller): Caller,
    Path(invoice_id): Path<i64>,
    target: InvoiceStatus,
) -> Result<Json<serde_json::Value>, ApiError> {
    caller.require_admin()?;
    state
        .run_blocking(DEFAULT_BUDGET, move |state| {
            let mut session = state
                .store
                .session(SessionMode::ReadWrite, Arc::clone(&state.metrics))?;
            match crew_invoice::transition(&mut session, &caller.name, invoice_id, target) {
                Ok((invoice, outcome)) => {
                    session.commit()?;
                    let status = match outcome {
                        crew_invoice::TransitionOutcome::Applied => "applied",
                        crew_invoice::TransitionOutcome::Noop => "noop",
                    };
                    Ok(Json(json!({ "status": status, "invoice": invoice })))
                }
                Err(err) => {
                    session.rollback();
                    let api: ApiError = err.into();
                    state.record_rejection(&caller.name, "invoice.transition", &api.code);
                    Err(api)
                }
            }
        })
        .await
}
