//! Request extractors: the authenticated caller and idempotency keys.

use axum::extract::FromRequestParts;
use axum::http::header::AUTHORIZATION;
use axum::http::request::Parts;

use crew_auth::AuthCaller;

use crate::AppState;
use crate::error::ApiError;

pub const ADMIN_SECRET_HEADER: &str = "x-admin-secret";
pub const IDEMPOTENCY_HEADER: &str = "x-idempotency-key";
/// Accepted alias on the resource-add endpoints.
pub const IDEMPOTENCY_HEADER_ALT: &str = "idempotency-key";

/// The caller value handlers depend on. Resolved from the automation
/// secret when its header is present, otherwise from a bearer token.
#[derive(Debug, Clone)]
pub struct Caller(pub AuthCaller);

impl FromRequestParts<AppState> for Caller {
    type Rejection = ApiError;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &AppState,
    ) -> Result<Self, Self::Rejection> {
        if parts.headers.contains_key(ADMIN_SECRET_HEADER) {
            let header = parts
                .headers
                .get(ADMIN_SECRET_HEADER)
                .and_then(|value| value.to_str().ok());
            let caller = crew_auth::caller_from_admin_secret(&state.auth, header)?;
            return Ok(Caller(caller));
        }

        let bearer = parts
            .headers
            .get(AUTHORIZATION)
            .and_then(|value| value.to_str().ok())
            .and_then(|value| value.strip_prefix("Bearer "))
            .ok_or_else(|| ApiError::unauthorized("missing bearer token"))?;
        let caller = crew_auth::verify_access(&state.auth, bearer)?;
        Ok(Caller(caller))
    }
}

/// Reads the idempotency key for bulk endpoints; absence is a validation
/// error there.
pub fn require_idempotency_key(parts: &axum::http::HeaderMap) -> Result<String, ApiError> {
    optional_idempotency_key(parts)
        .ok_or_else(|| ApiError::validation("X-Idempotency-Key header is required"))
}

/// Reads the idempotency key on resource-add endpoints, where it is
/// optional and both spellings are accepted.
pub fn optional_idempotency_key(headers: &axum::http::HeaderMap) -> Option<String> {
    for name in [IDEMPOTENCY_HEADER, IDEMPOTENCY_HEADER_ALT] {
        if let Some(value) = headers.get(name).and_then(|value| value.to_str().ok()) {
            return Some(value.to_string());
        }
    }
    None
}
