//! Rate limiting for HTTP-adjacent calls.

use std::net::SocketAddr;

use axum::extract::{ConnectInfo, Request, State};
use axum::http::{Extensions, HeaderMap, HeaderValue, StatusCode};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;
use utoipa::ToSchema;

use crate::auth::principal::Principal;
use crate::auth::tokens::extract_token;
use crate::AppState;

use super::{LimitReason, RateLimitDecision};

/// Body of a 429 response.
#[derive(Debug, Serialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct RateLimitRejection {
    pub error: String,
    pub message: String,
    pub retry_after: u64,
    pub code: String,
}

impl RateLimitRejection {
    pub fn from_decision(decision: &RateLimitDecision) -> Self {
        let (code, message) = match decision.reason {
            Some(LimitReason::Burst) => ("BURST_LIMITED", "Too many requests in a short period"),
            _ => ("RATE_LIMITED", "Rate limit exceeded"),
        };
        Self {
            error: "Too Many Requests".to_string(),
            message: message.to_string(),
            retry_after: decision.retry_after.unwrap_or(1),
            code: code.to_string(),
        }
    }
}

/// Remote address recorded by `into_make_service_with_connect_info`.
///
/// Forwarding headers are not trusted: they are client-controlled and would
/// let a caller pick its own rate-limit key.
pub fn remote_addr(extensions: &Extensions) -> String {
    extensions
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ConnectInfo(addr)| addr.ip().to_string())
        .unwrap_or_else(|| "unknown".to_string())
}

/// Write `X-RateLimit-*` (and `Retry-After` on rejection) headers.
pub fn apply_headers(headers: &mut HeaderMap, decision: &RateLimitDecision) {
    let reset_secs = (decision.reset_at.max(0) as u64).div_ceil(1000);
    headers.insert("x-ratelimit-limit", HeaderValue::from(decision.limit));
    headers.insert("x-ratelimit-remaining", HeaderValue::from(decision.remaining));
    headers.insert("x-ratelimit-reset", HeaderValue::from(reset_secs));
    if let Some(retry_after) = decision.retry_after {
        headers.insert("retry-after", HeaderValue::from(retry_after));
    }
}

/// Axum middleware applying the limiter to the wrapped routes.
///
/// The key is the bearer token's user when one validates, otherwise the
/// remote address; authorization itself is left to the route.
pub async fn rate_limit(State(state): State<AppState>, request: Request, next: Next) -> Response {
    let principal = extract_token(request.headers())
        .and_then(|token| state.authenticator.validator().principal(&token).ok())
        .unwrap_or_else(Principal::anonymous);
    let key = principal.limit_key(&remote_addr(request.extensions()));
    let path = request.uri().path().to_string();

    let decision = state.limiter.check(&key, &path, principal.role).await;

    if !decision.allowed {
        tracing::info!(%key, %path, reason = ?decision.reason, "http request rate limited");
        let mut response = (
            StatusCode::TOO_MANY_REQUESTS,
            Json(RateLimitRejection::from_decision(&decision)),
        )
            .into_response();
        apply_headers(response.headers_mut(), &decision);
        return response;
    }

    let mut response = next.run(request).await;
    apply_headers(response.headers_mut(), &decision);
    response
}
