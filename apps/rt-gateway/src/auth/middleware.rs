//! Bearer-token extraction for the HTTP endpoints.

use axum::extract::FromRequestParts;
use axum::http::request::Parts;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;

use crate::auth::authenticator::GENERIC_DENIAL;
use crate::auth::principal::{Principal, Role};
use crate::auth::tokens::extract_token;
use crate::error::ApiError;
use crate::AppState;

/// Authenticated caller extracted from the `Authorization: Bearer <jwt>` header.
#[derive(Debug, Clone)]
pub struct AuthUser {
    pub principal: Principal,
    path: String,
}

impl AuthUser {
    /// Reject callers below `role` with the same generic 401 as a bad token,
    /// so a probing client cannot tell a valid token from an invalid one.
    pub fn require(&self, state: &AppState, role: Role) -> Result<&Principal, ApiError> {
        if self.principal.at_least(role) {
            return Ok(&self.principal);
        }
        state.gateway.counters().http_auth_failure();
        tracing::warn!(
            path = %self.path,
            user_id = self.principal.user_id.as_deref().unwrap_or("-"),
            role = %self.principal.role,
            required = %role,
            "bearer token lacks the required role"
        );
        Err(ApiError::unauthorized(GENERIC_DENIAL))
    }
}

/// Rejection returned when the bearer token is missing or invalid. The
/// reason is logged, never returned.
pub struct AuthError;

impl IntoResponse for AuthError {
    fn into_response(self) -> Response {
        let body = serde_json::json!({
            "error": {
                "code": "UNAUTHORIZED",
                "message": GENERIC_DENIAL
            }
        });
        (StatusCode::UNAUTHORIZED, Json(body)).into_response()
    }
}

impl FromRequestParts<AppState> for AuthUser {
    type Rejection = AuthError;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &AppState,
    ) -> Result<Self, Self::Rejection> {
        let path = parts.uri.path().to_string();
        let token = extract_token(&parts.headers).ok_or_else(|| {
            state.gateway.counters().http_auth_failure();
            tracing::debug!(%path, "missing bearer token");
            AuthError
        })?;

        let principal = state
            .authenticator
            .validator()
            .principal(&token)
            .map_err(|e| {
                state.gateway.counters().http_auth_failure();
                tracing::warn!(%path, reason = ?e, "bearer token rejected");
                AuthError
            })?;

        Ok(AuthUser { principal, path })
    }
}
