//! The uniform error envelope: `HTTP status + {detail: {code, message, …}}`.

use axum::Json;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::response::Response;
use serde_json::json;
use tracing::error;

#[derive(Debug)]
pub struct ApiError {
    pub status: StatusCode,
    pub code: String,
    pub message: String,
    pub extra: serde_json::Map<String, serde_json::Value>,
}

impl ApiError {
    #[must_use]
    pub fn new(status: StatusCode, code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            status,
            code: code.into(),
            message: message.into(),
            extra: serde_json::Map::new(),
        }
    }

    #[must_use]
    pub fn with(mut self, key: &str, value: serde_json::Value) -> Self {
        self.extra.insert(key.into(), value);
        self
    }

    #[must_use]
    pub fn validation(message: impl Into<String>) -> Self {
        Self::new(StatusCode::UNPROCESSABLE_ENTITY, "validation_error", message)
    }

    #[must_use]
    pub fn unauthorized(message: impl Into<String>) -> Self {
        Self::new(StatusCode::UNAUTHORIZED, "unauthorized", message)
    }

    #[must_use]
    pub fn forbidden_role(message: impl Into<String>) -> Self {
        Self::new(StatusCode::FORBIDDEN, "forbidden_role", message)
    }

    #[must_use]
    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(StatusCode::NOT_FOUND, "not_found", message)
    }

    #[must_use]
    pub fn stale_state(message: impl Into<String>) -> Self {
        Self::new(StatusCode::CONFLICT, "stale_state", message)
    }

    #[must_use]
    pub fn duplicate_key(scope_hash: String) -> Self {
        Self::new(
            StatusCode::CONFLICT,
            "duplicate_idempotency_key",
            "idempotency key was already used",
        )
        .with("scope_hash", json!(scope_hash))
    }

    #[must_use]
    pub fn internal(message: impl Into<String>) -> Self {
        // Full reason goes to the log; the client sees a redacted envelope.
        let detail = message.into();
        error!(%detail, "internal error");
        Self::new(
            StatusCode::INTERNAL_SERVER_ERROR,
            "internal_error",
            "internal error",
        )
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let mut detail = serde_json::Map::new();
        detail.insert("code".into(), json!(self.code));
        detail.insert("message".into(), json!(self.message));
        for (key, value) in self.extra {
            detail.insert(key, value);
        }
        (self.status, Json(json!({ "detail": detail }))).into_response()
    }
}

impl From<crew_auth::AuthError> for ApiError {
    fn from(err: crew_auth::AuthError) -> Self {
        use crew_auth::AuthError;
        match err {
            AuthError::InvalidCredentials | AuthError::TokenInvalid => {
                ApiError::unauthorized(err.to_string())
            }
            AuthError::AccessDeniedWeb => ApiError::new(
                StatusCode::UNAUTHORIZED,
                "access_denied_web",
                "web access is not available for this role",
            ),
            AuthError::MissingAdminSecret => ApiError::unauthorized("admin secret header missing"),
            AuthError::WrongAdminSecret => ApiError::new(
                StatusCode::FORBIDDEN,
                "forbidden_role",
                "admin secret mismatch",
            ),
            AuthError::ForbiddenRole(role) => {
                ApiError::forbidden_role(format!("role {role} is not permitted"))
            }
            AuthError::NotFound(what) => ApiError::not_found(what),
            AuthError::Conflict(what) => Self::new(StatusCode::CONFLICT, "stale_state", what),
            AuthError::Validation(what) => ApiError::validation(what),
            AuthError::Hash(detail) => ApiError::internal(detail),
            AuthError::Sqlite(err) => ApiError::internal(err.to_string()),
            AuthError::Store(err) => err.into(),
            AuthError::Audit(err) => ApiError::internal(err.to_string()),
        }
    }
}

impl From<crew_store::StoreError> for ApiError {
    fn from(err: crew_store::StoreError) -> Self {
        use crew_store::StoreError;
        match err {
            StoreError::InvalidIdempotencyKey(detail) => {
                ApiError::validation(format!("invalid idempotency key: {detail}"))
            }
            other => ApiError::internal(other.to_string()),
        }
    }
}

impl From<crew_worklog::WorklogError> for ApiError {
    fn from(err: crew_worklog::WorklogError) -> Self {
        use crew_worklog::WorklogError;
        match err {
            WorklogError::NotFound(what) => ApiError::not_found(what),
            WorklogError::StaleState(what) => ApiError::stale_state(what),
            WorklogError::Validation(what) => ApiError::validation(what),
            WorklogError::PhotoRequired { threshold } => ApiError::new(
                StatusCode::UNPROCESSABLE_ENTITY,
                "photo_required",
                "a photo reference is required above the expense threshold",
            )
            .with("threshold", json!(threshold.to_plain_string())),
            WorklogError::Pricing(err) => err.into(),
            WorklogError::Sqlite(err) => ApiError::internal(err.to_string()),
            WorklogError::Store(err) => err.into(),
            WorklogError::Audit(err) => ApiError::internal(err.to_string()),
            WorklogError::Money(err) => ApiError::validation(err.to_string()),
        }
    }
}

impl From<crew_pricing::PricingError> for ApiError {
    fn from(err: crew_pricing::PricingError) -> Self {
        use crew_pricing::PricingError;
        match err {
            PricingError::UnknownRateCode(_)
            | PricingError::UnknownCategory(_)
            | PricingError::NegativeQty(_) => ApiError::validation(err.to_string()),
            other => ApiError::internal(other.to_string()),
        }
    }
}

impl From<crew_moderation::ModerationError> for ApiError {
    fn from(err: crew_moderation::ModerationError) -> Self {
        use crew_moderation::ModerationError;
        match err {
            ModerationError::NotFound(what) => ApiError::not_found(what),
            ModerationError::StaleState(what) => ApiError::stale_state(what),
            ModerationError::Validation(what) => ApiError::validation(what),
            ModerationError::Pricing(err) => err.into(),
            ModerationError::Sqlite(err) => ApiError::internal(err.to_string()),
            ModerationError::Store(err) => err.into(),
            ModerationError::Audit(err) => ApiError::internal(err.to_string()),
        }
    }
}

impl From<crew_invoice::InvoiceError> for ApiError {
    fn from(err: crew_invoice::InvoiceError) -> Self {
        use crew_invoice::InvoiceError;
        match err {
            InvoiceError::NotFound(what) => ApiError::not_found(what),
            InvoiceError::StaleState(what) => ApiError::stale_state(what),
            InvoiceError::Validation(what) => ApiError::validation(what),
            InvoiceError::ForbiddenOp(kind) => ApiError::new(
                StatusCode::FORBIDDEN,
                "forbidden_op",
                format!("operation {kind} is forbidden"),
            ),
            InvoiceError::Gone => {
                ApiError::new(StatusCode::GONE, "gone", "preview token already used")
            }
            InvoiceError::Pricing(err) => err.into(),
            InvoiceError::Money(err) => ApiError::validation(err.to_string()),
            InvoiceError::Sqlite(err) => ApiError::internal(err.to_string()),
            InvoiceError::Store(err) => err.into(),
            InvoiceError::Audit(err) => ApiError::internal(err.to_string()),
        }
    }
}

impl From<crew_reports::ReportError> for ApiError {
    fn from(err: crew_reports::ReportError) -> Self {
        use crew_reports::ReportError;
        match err {
            ReportError::NotFound(what) => ApiError::not_found(what),
            ReportError::Validation(what) => ApiError::validation(what),
            ReportError::ExportLimitExceeded { total } => ApiError::new(
                StatusCode::UNPROCESSABLE_ENTITY,
                "export_limit_exceeded",
                format!(
                    "export matches {total} rows, narrow the filters below {}",
                    crew_reports::EXPORT_ROW_LIMIT
                ),
            )
            .with("total", json!(total))
            .with("limit", json!(crew_reports::EXPORT_ROW_LIMIT)),
            other => ApiError::internal(other.to_string()),
        }
    }
}

impl From<crew_backup::BackupError> for ApiError {
    fn from(err: crew_backup::BackupError) -> Self {
        use crew_backup::BackupError;
        match err {
            BackupError::NotInManifest { file } => {
                ApiError::not_found(format!("{file} has no manifest entry"))
            }
            BackupError::ChecksumMismatch { file, .. } => ApiError::new(
                StatusCode::CONFLICT,
                "stale_state",
                format!("checksum mismatch for {file}; restore refused"),
            ),
            other => ApiError::internal(other.to_string()),
        }
    }
}
