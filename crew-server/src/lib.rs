#![deny(clippy::print_stdout, clippy::print_stderr)]

//! HTTP surface: versioned JSON endpoints over the domain crates.
//!
//! Handlers run their store work on the blocking pool under a per-request
//! deadline; bulk endpoints extend the budget with the batch size up to a
//! hard ceiling. Clients that disconnect abandon the response, already
//! committed work stays committed.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use std::time::Instant;

use axum::Router;
use axum::routing::get;
use axum::routing::post;
use tracing::info;
use tracing::warn;

use crew_audit::AuditOutcome;
use crew_auth::AuthConfig;
use crew_metrics::MetricsSink;
use crew_pricing::PricingEngine;
use crew_store::SessionMode;
use crew_store::Store;
use crew_worklog::ExpensePolicy;

pub mod config;
pub mod error;
pub mod extract;
mod routes;

pub use config::ServerConfig;
pub use error::ApiError;

pub const DEFAULT_BUDGET: Duration = Duration::from_secs(30);
pub const MAX_BUDGET: Duration = Duration::from_secs(120);

#[derive(Clone)]
pub struct AppState {
    pub store: Store,
    pub metrics: Arc<MetricsSink>,
    pub pricing: Arc<PricingEngine>,
    pub auth: Arc<AuthConfig>,
    pub policy: ExpensePolicy,
    pub backups_dir: PathBuf,
    pub started_at: Instant,
    pub version: &'static str,
}

impl AppState {
    /// Opens the store (running pending migrations) and wires the shared
    /// components from configuration.
    pub fn from_config(config: &ServerConfig) -> anyhow::Result<Self> {
        let store = Store::open(&config.db_path)?;
        store.migrate()?;
        let pricing = PricingEngine::load(&config.rules_path)?;
        let mut auth = AuthConfig::new(config.jwt_secret.clone(), config.admin_secret.clone());
        auth.access_ttl_secs = config.access_ttl_secs;
        auth.refresh_ttl_secs = config.refresh_ttl_secs;
        Ok(Self {
            store,
            metrics: Arc::new(MetricsSink::new(config.metrics_dir.clone())),
            pricing: Arc::new(pricing),
            auth: Arc::new(auth),
            policy: ExpensePolicy {
                photo_threshold: config.photo_threshold,
                ocr_enabled: config.ocr_enabled,
            },
            backups_dir: config.backups_dir.clone(),
            started_at: Instant::now(),
            version: env!("CARGO_PKG_VERSION"),
        })
    }

    /// Runs store-bound work on the blocking pool under `budget`.
    pub async fn run_blocking<T, F>(&self, budget: Duration, job: F) -> Result<T, ApiError>
    where
        T: Send + 'static,
        F: FnOnce(AppState) -> Result<T, ApiError> + Send + 'static,
    {
        let state = self.clone();
        let work = tokio::task::spawn_blocking(move || job(state));
        match tokio::time::timeout(budget, work).await {
            Ok(Ok(result)) => result,
            Ok(Err(join_err)) => Err(ApiError::internal(format!("worker panic: {join_err}"))),
            Err(_) => Err(ApiError::internal("request deadline exceeded")),
        }
    }

    /// Budget for a bulk call: one extra second per item, capped.
    #[must_use]
    pub fn bulk_budget(items: usize) -> Duration {
        let extended = DEFAULT_BUDGET + Duration::from_secs(items as u64);
        extended.min(MAX_BUDGET)
    }

    /// Best-effort audit trail for a rejected request, written outside the
    /// rolled-back transaction.
    pub fn record_rejection(&self, actor: &str, action: &str, code: &str) {
        let attempt = (|| -> Result<(), String> {
            let mut session = self
                .store
                .session(SessionMode::ReadWrite, Arc::clone(&self.metrics))
                .map_err(|err| err.to_string())?;
            crew_audit::append(
                &mut session,
                actor,
                action,
                "request",
                None,
                &serde_json::json!({"code": code}),
                AuditOutcome::Rejected,
                Some(code),
            )
            .map_err(|err| err.to_string())?;
            session.commit().map_err(|err| err.to_string())
        })();
        if let Err(err) = attempt {
            warn!(action, code, error = %err, "failed to audit rejection");
        }
    }
}

/// The full route table.
pub fn build_app(state: AppState) -> Router {
    Router::new()
        .route("/health", get(routes::health))
        .route("/api/auth/login", post(routes::auth::login))
        .route("/api/auth/refresh", post(routes::auth::refresh))
        .route("/api/auth/me", get(routes::auth::me))
        .route("/api/users", get(routes::users::list).post(routes::users::create))
        .route("/api/users/{id}", axum::routing::patch(routes::users::patch))
        .route("/api/users/{id}/activate", post(routes::users::activate))
        .route("/api/users/{id}/deactivate", post(routes::users::deactivate))
        .route(
            "/api/clients",
            get(routes::clients::list).post(routes::clients::create),
        )
        .route("/api/clients/{id}/archive", post(routes::clients::archive))
        .route("/api/admin/pending", get(routes::pending::list))
        .route("/api/admin/pending/{id}/approve", post(routes::pending::approve))
        .route("/api/admin/pending/{id}/reject", post(routes::pending::reject))
        .route(
            "/api/admin/pending/bulk.approve",
            post(routes::pending::bulk_approve),
        )
        .route(
            "/api/admin/pending/bulk.reject",
            post(routes::pending::bulk_reject),
        )
        .route("/api/expense.add", post(routes::worklog::expense_add))
        .route("/api/task.add", post(routes::worklog::task_add))
        .route("/api/v1/shift/start", post(routes::worklog::shift_start))
        .route("/api/v1/shift/end", post(routes::worklog::shift_end))
        .route("/api/invoice.build", post(routes::invoices::build))
        .route(
            "/api/invoice.preview/{id}/issue",
            post(routes::invoices::preview_issue),
        )
        .route("/api/invoice.preview/{id}", get(routes::invoices::preview_fetch))
        .route(
            "/api/invoice.suggest_change",
            post(routes::invoices::suggest_change),
        )
        .route(
            "/api/invoice.apply_suggestions",
            post(routes::invoices::apply_suggestions),
        )
        .route("/api/invoice/{id}", get(routes::invoices::show))
        .route("/api/invoice/{id}/issue", post(routes::invoices::issue))
        .route("/api/invoice/{id}/pay", post(routes::invoices::pay))
        .route("/api/invoice/{id}/cancel", post(routes::invoices::cancel))
        .route(
            "/api/admin/expenses/export",
            get(routes::exports::expenses_csv),
        )
        .route(
            "/api/admin/invoices/export",
            get(routes::exports::invoices_csv),
        )
        .route("/api/reports/monthly.csv", get(routes::exports::monthly_csv))
        .route(
            "/api/report.worker/{user_id}",
            get(routes::exports::worker_report),
        )
        .route("/api/bot/inbox", get(routes::bot::inbox))
        .route("/api/bot/item.details", get(routes::bot::item_details))
        .route("/api/bot/approve", post(routes::bot::approve))
        .route("/api/bot/reject", post(routes::bot::reject))
        .route(
            "/api/admin/bot-menu",
            get(routes::botmenu::show).put(routes::botmenu::update),
        )
        .route("/api/admin/bot-menu/apply", post(routes::botmenu::apply))
        .route("/api/settings/backup", get(routes::backup::status))
        .route("/api/settings/backup/create", post(routes::backup::create))
        .route("/api/settings/backup/restore", post(routes::backup::restore))
        .with_state(state)
}

/// Binds and serves until shutdown. SIGHUP reloads the pricing rules
/// without a restart.
pub async fn serve(config: ServerConfig) -> anyhow::Result<()> {
    let state = AppState::from_config(&config)?;

    #[cfg(unix)]
    {
        let pricing = Arc::clone(&state.pricing);
        tokio::spawn(async move {
            let mut hangup = match tokio::signal::unix::signal(
                tokio::signal::unix::SignalKind::hangup(),
            ) {
                Ok(signal) => signal,
                Err(err) => {
                    warn!(error = %err, "SIGHUP handler unavailable");
                    return;
                }
            };
            while hangup.recv().await.is_some() {
                if let Err(err) = pricing.reload() {
                    warn!(error = %err, "pricing rules reload failed");
                }
            }
        });
    }

    let app = build_app(state);
    let listener = tokio::net::TcpListener::bind(&config.bind_addr).await?;
    info!(addr = %config.bind_addr, "listening");
    axum::serve(listener, app).await?;
    Ok(())
}
