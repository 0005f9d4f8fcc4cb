use std::sync::Arc;

use axum::Json;
use axum::extract::State;
use axum::http::HeaderMap;
use rust_decimal::Decimal;
use serde::Deserialize;
use serde_json::json;

use crew_money::Money;
use crew_store::IdempotencyOutcome;
use crew_store::SessionMode;
use crew_worklog::Expense;
use crew_worklog::Shift;
use crew_worklog::Task;
use crew_worklog::expenses::ExpenseCreate;

use crate::AppState;
use crate::DEFAULT_BUDGET;
use crate::error::ApiError;
use crate::extract::Caller;
use crate::extract::optional_idempotency_key;

#[derive(Debug, Deserialize)]
pub struct ExpenseAddBody {
    pub worker_id: i64,
    #[serde(default)]
    pub shift_id: Option<i64>,
    pub category: String,
    pub amount: Money,
    #[serde(default)]
    pub currency: Option<String>,
    #[serde(default)]
    pub photo_ref: Option<String>,
    #[serde(default)]
    pub date: Option<chrono::NaiveDate>,
}

/// Resource adds are replay-deterministic: the same idempotency key with
/// the same payload returns the originally created resource; a drifted
/// payload is a key-reuse conflict.
pub async fn expense_add(
    State(state): State<AppState>,
    Caller(caller): Caller,
    headers: HeaderMap,
    Json(body): Json<ExpenseAddBody>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let key = optional_idempotency_key(&headers);
    state
        .run_blocking(DEFAULT_BUDGET, move |state| {
            let mut session = state
                .store
                .session(SessionMode::ReadWrite, Arc::clone(&state.metrics))?;

            let scope = json!({
                "op": "expense.add",
                "worker_id": body.worker_id,
                "shift_id": body.shift_id,
                "category": body.category,
                "amount": body.amount,
                "currency": body.currency,
                "photo_ref": body.photo_ref,
                "date": body.date,
            });
            if let Some(key) = &key {
                match crew_store::ensure_idempotent(&mut session, key, &scope)? {
                    IdempotencyOutcome::Fresh => {}
                    IdempotencyOutcome::Replay {
                        scope_matches: true,
                        response_json: Some(stored),
                        ..
                    } => {
                        session.rollback();
                        let body: serde_json::Value = serde_json::from_str(&stored)
                            .map_err(|err| ApiError::internal(err.to_string()))?;
                        return Ok(Json(body));
                    }
                    IdempotencyOutcome::Replay { scope_hash, .. } => {
                        session.rollback();
                        return Err(ApiError::duplicate_key(scope_hash));
                    }
                }
            }

            let input = ExpenseCreate {
                worker_id: body.worker_id,
                shift_id: body.shift_id,
                category: body.category,
                amount: body.amount,
                currency: body.currency,
                photo_ref: body.photo_ref,
                date: body.date,
            };
            match crew_worklog::expenses::add(
                &mut session,
                &state.pricing,
                &state.policy,
                &caller.name,
                input,
            ) {
                Ok(expense) => {
                    let rendered = expense_json(&expense);
                    if let Some(key) = &key {
                        crew_store::record_response(&mut session, key, &rendered)?;
                    }
                    session.commit()?;
                    Ok(Json(rendered))
                }
                Err(err) => {
                    session.rollback();
                    let api: ApiError = err.into();
                    state.record_rejection(&caller.name, "expense.add", &api.code);
                    Err(api)
                }
            }
        })
        .await
}

#[derive(Debug, Deserialize)]
pub struct TaskAddBody {
    pub shift_id: i64,
    pub rate_code: String,
    pub qty: Decimal,
}

pub async fn task_add(
    State(state): State<AppState>,
    Caller(caller): Caller,
    headers: HeaderMap,
    Json(body): Json<TaskAddBody>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let key = optional_idempotency_key(&headers);
    state
        .run_blocking(DEFAULT_BUDGET, move |state| {
            let mut session = state
                .store
                .session(SessionMode::ReadWrite, Arc::clone(&state.metrics))?;

            let scope = json!({
                "op": "task.add",
                "shift_id": body.shift_id,
                "rate_code": body.rate_code,
                "qty": body.qty,
            });
            if let Some(key) = &key {
                match crew_store::ensure_idempotent(&mut session, key, &scope)? {
                    IdempotencyOutcome::Fresh => {}
                    IdempotencyOutcome::Replay {
                        scope_matches: true,
                        response_json: Some(stored),
                        ..
                    } => {
                        session.rollback();
                        let body: serde_json::Value = serde_json::from_str(&stored)
                            .map_err(|err| ApiError::internal(err.to_string()))?;
                        return Ok(Json(body));
                    }
                    IdempotencyOutcome::Replay { scope_hash, .. } => {
                        session.rollback();
                        return Err(ApiError::duplicate_key(scope_hash));
                    }
                }
            }

            match crew_worklog::tasks::add(
                &mut session,
                &state.pricing,
                &caller.name,
                body.shift_id,
                &body.rate_code,
                body.qty,
            ) {
                Ok(task) => {
                    let rendered = task_json(&task);
                    if let Some(key) = &key {
                        crew_store::record_response(&mut session, key, &rendered)?;
                    }
                    session.commit()?;
                    Ok(Json(rendered))
                }
                Err(err) => {
                    session.rollback();
                    let api: ApiError = err.into();
                    state.record_rejection(&caller.name, "task.add", &api.code);
                    Err(api)
                }
            }
        })
        .await
}

#[derive(Debug, Deserialize)]
pub struct ShiftStartBody {
    pub user_id: i64,
    #[serde(default)]
    pub client_id: Option<i64>,
    #[serde(default)]
    pub work_address: Option<String>,
}

pub async fn shift_start(
    State(state): State<AppState>,
    Caller(caller): Caller,
    Json(body): Json<ShiftStartBody>,
) -> Result<Json<Shift>, ApiError> {
    state
        .run_blocking(DEFAULT_BUDGET, move |state| {
            let mut session = state
                .store
                .session(SessionMode::ReadWrite, Arc::clone(&state.metrics))?;
            match crew_worklog::shifts::start(
                &mut session,
                &caller.name,
                body.user_id,
                body.client_id,
                body.work_address.as_deref(),
            ) {
                Ok(shift) => {
                    session.commit()?;
                    Ok(Json(shift))
                }
                Err(err) => {
                    session.rollback();
                    let api: ApiError = err.into();
                    state.record_rejection(&caller.name, "shift.start", &api.code);
                    Err(api)
                }
            }
        })
        .await
}

#[derive(Debug, Deserialize)]
pub struct ShiftEndBody {
    pub user_id: i64,
}

pub async fn shift_end(
    State(state): State<AppState>,
    Caller(caller): Caller,
    Json(body): Json<ShiftEndBody>,
) -> Result<Json<Shift>, ApiError> {
    state
        .run_blocking(DEFAULT_BUDGET, move |state| {
            let mut session = state
                .store
                .session(SessionMode::ReadWrite, Arc::clone(&state.metrics))?;
            match crew_worklog::shifts::end(&mut session, &caller.name, body.user_id) {
                Ok(shift) => {
                    session.commit()?;
                    Ok(Json(shift))
                }
                Err(err) => {
                    session.rollback();
                    let api: ApiError = err.into();
                    state.record_rejection(&caller.name, "shift.end", &api.code);
                    Err(api)
                }
            }
        })
        .await
}

fn expense_json(expense: &Expense) -> serde_json::Value {
    let mut rendered = serde_json::to_value(expense).unwrap_or(serde_json::Value::Null);
    if let Some(object) = rendered.as_object_mut() {
        object.insert("fmt_amount".into(), json!(expense.amount.format_ils()));
    }
    rendered
}

fn task_json(task: &Task) -> serde_json::Value {
    let mut rendered = serde_json::to_value(task).unwrap_or(serde_json::Value::Null);
    if let Some(object) = rendered.as_object_mut() {
        object.insert("fmt_amount".into(), json!(task.amount.format_ils()));
    }
    rendered
}
