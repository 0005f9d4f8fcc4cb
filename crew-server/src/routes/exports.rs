use axum::Json;
use axum::extract::Path;
use axum::extract::Query;
use axum::extract::State;
use axum::http::HeaderValue;
use axum::http::header::CONTENT_TYPE;
use axum::response::IntoResponse;
use axum::response::Response;
use serde::Deserialize;

use crew_reports::ExpenseExportFilter;
use crew_reports::InvoiceExportFilter;
use crew_reports::WorkerReport;

use crate::AppState;
use crate::DEFAULT_BUDGET;
use crate::error::ApiError;
use crate::extract::Caller;

const CSV_CONTENT_TYPE: &str = "text/csv; charset=utf-8";

fn csv_response(bytes: Vec<u8>) -> Response {
    let mut response = bytes.into_response();
    response.headers_mut().insert(
        CONTENT_TYPE,
        HeaderValue::from_static(CSV_CONTENT_TYPE),
    );
    response
}

#[derive(Debug, Deserialize)]
pub struct MonthQuery {
    pub month: String,
}

pub async fn monthly_csv(
    State(state): State<AppState>,
    Caller(caller): Caller,
    Query(query): Query<MonthQuery>,
) -> Result<Response, ApiError> {
    caller.require_admin()?;
    state
        .run_blocking(DEFAULT_BUDGET, move |state| {
            let conn = state.store.raw_conn()?;
            let bytes = crew_reports::monthly_csv(&conn, &query.month)?;
            Ok(csv_response(bytes))
        })
        .await
}

pub async fn expenses_csv(
    State(state): State<AppState>,
    Caller(caller): Caller,
    Query(filter): Query<ExpenseExportFilter>,
) -> Result<Response, ApiError> {
    caller.require_admin()?;
    state
        .run_blocking(DEFAULT_BUDGET, move |state| {
            let conn = state.store.raw_conn()?;
            match crew_reports::export_expenses_csv(&conn, &filter) {
                Ok(bytes) => Ok(csv_response(bytes)),
                Err(err) => {
                    let api: ApiError = err.into();
                    state.record_rejection(&caller.name, "expenses.export", &api.code);
                    Err(api)
                }
            }
        })
        .await
}

pub async fn invoices_csv(
    State(state): State<AppState>,
    Caller(caller): Caller,
    Query(filter): Query<InvoiceExportFilter>,
) -> Result<Response, ApiError> {
    caller.require_admin()?;
    state
        .run_blocking(DEFAULT_BUDGET, move |state| {
            let conn = state.store.raw_conn()?;
            match crew_reports::export_invoices_csv(&conn, &filter) {
                Ok(bytes) => Ok(csv_response(bytes)),
                Err(err) => {
                    let api: ApiError = err.into();
                    state.record_rejection(&caller.name, "invoices.export", &api.code);
                    Err(api)
                }
            }
        })
        .await
}

#[derive(Debug, Deserialize)]
pub struct WorkerReportQuery {
    #[serde(default)]
    pub from: Option<String>,
    #[serde(default)]
    pub to: Option<String>,
}

pub async fn worker_report(
    State(state): State<AppState>,
    Caller(caller): Caller,
    Path(user_id): Path<i64>,
    Query(query): Query<WorkerReportQuery>,
) -> Result<Json<WorkerReport>, ApiError> {
    caller.require_moderator()?;
    state
        .run_blocking(DEFAULT_BUDGET, move |state| {
            let conn = state.store.raw_conn()?;
            let report = crew_reports::worker_report(
                &conn,
                user_id,
                query.from.as_deref(),
                query.to.as_deref(),
            )?;
            Ok(Json(report))
        })
        .await
}
