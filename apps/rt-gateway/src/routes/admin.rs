//! Operator endpoints: rate-limiter stats and server-side publishing.

use axum::extract::State;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Deserialize;
use serde_json::Value;
use utoipa::ToSchema;

use crate::auth::middleware::AuthUser;
use crate::auth::principal::Role;
use crate::error::{ApiError, ApiErrorBody, FieldError};
use crate::gateway::events::ServerMessage;
use crate::gateway::hub::DeliveryReport;
use crate::metrics::collector::RateLimiterStats;
use crate::rate_limit::middleware::RateLimitRejection;
use crate::AppState;

const MAX_RESOURCE_ID_LEN: usize = 128;

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/admin/rate-limits", get(rate_limit_stats))
        .route("/api/v1/publish", post(publish))
}

// ---------------------------------------------------------------------------
// GET /admin/rate-limits
// ---------------------------------------------------------------------------

#[utoipa::path(
    get,
    path = "/admin/rate-limits",
    tag = "Admin",
    security(("bearer" = [])),
    responses(
        (status = 200, description = "Rate limiter entry counts", body = RateLimiterStats),
        (status = 401, description = "Authentication failed", body = ApiErrorBody),
        (status = 429, description = "Rate limited", body = RateLimitRejection),
    ),
)]
pub async fn rate_limit_stats(
    user: AuthUser,
    State(state): State<AppState>,
) -> Result<Json<RateLimiterStats>, ApiError> {
    user.require(&state, Role::Admin)?;

    let store = state.limiter.stats().await;
    Ok(Json(RateLimiterStats {
        total_entries: store.total_entries,
        active_entries: store.active_entries,
        rejections: state.limiter.rejections(),
    }))
}

// ---------------------------------------------------------------------------
// POST /api/v1/publish
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize, ToSchema)]
pub struct PublishRequest {
    /// Subscription feature, e.g. `tracking` or `commodity`.
    pub feature: String,
    /// Target resource. Without it the event goes to every connection in the
    /// namespaces serving `feature`.
    pub resource_id: Option<String>,
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub payload: Value,
}

impl PublishRequest {
    fn validate(&self) -> Result<(), ApiError> {
        let mut errors = Vec::new();
        if self.feature.trim().is_empty() {
            errors.push(FieldError {
                field: "feature".to_string(),
                message: "Feature is required".to_string(),
            });
        }
        if self.kind.trim().is_empty() {
            errors.push(FieldError {
                field: "type".to_string(),
                message: "Event type is required".to_string(),
            });
        }
        if let Some(resource_id) = &self.resource_id {
            let len = resource_id.chars().count();
            if len == 0 || len > MAX_RESOURCE_ID_LEN {
                errors.push(FieldError {
                    field: "resource_id".to_string(),
                    message: format!("Resource id must be 1-{MAX_RESOURCE_ID_LEN} characters"),
                });
            }
        }
        if !(self.payload.is_object() || self.payload.is_null()) {
            errors.push(FieldError {
                field: "payload".to_string(),
                message: "Payload must be an object".to_string(),
            });
        }
        if errors.is_empty() {
            Ok(())
        } else {
            Err(ApiError::validation(errors))
        }
    }
}

#[utoipa::path(
    post,
    path = "/api/v1/publish",
    tag = "Admin",
    security(("bearer" = [])),
    request_body = PublishRequest,
    responses(
        (status = 200, description = "Fan-out result", body = DeliveryReport),
        (status = 400, description = "Validation error", body = ApiErrorBody),
        (status = 401, description = "Authentication failed", body = ApiErrorBody),
        (status = 404, description = "No namespace serves the feature", body = ApiErrorBody),
        (status = 429, description = "Rate limited", body = RateLimitRejection),
    ),
)]
pub async fn publish(
    user: AuthUser,
    State(state): State<AppState>,
    Json(body): Json<PublishRequest>,
) -> Result<Json<DeliveryReport>, ApiError> {
    let principal = user.require(&state, Role::Moderator)?;
    body.validate()?;

    let namespaces: Vec<&str> = state
        .namespaces
        .iter()
        .filter(|policy| policy.feature == body.feature)
        .map(|policy| policy.name.as_str())
        .collect();
    if namespaces.is_empty() {
        return Err(ApiError::not_found("No namespace serves this feature"));
    }

    let payload = if body.payload.is_null() {
        Value::Object(Default::default())
    } else {
        body.payload
    };
    let message = ServerMessage::new(&body.kind, payload);

    let report = match &body.resource_id {
        Some(resource_id) => state.gateway.publish(&body.feature, resource_id, &message),
        None => namespaces
            .iter()
            .map(|ns| state.gateway.broadcast(ns, &message))
            .fold(DeliveryReport::default(), |acc, r| DeliveryReport {
                delivered: acc.delivered + r.delivered,
                failed: acc.failed + r.failed,
            }),
    };

    tracing::info!(
        user_id = principal.user_id.as_deref().unwrap_or("-"),
        feature = %body.feature,
        resource_id = body.resource_id.as_deref().unwrap_or("*"),
        kind = %body.kind,
        delivered = report.delivered,
        failed = report.failed,
        "server-side publish"
    );
    Ok(Json(report))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn request(value: Value) -> PublishRequest {
        serde_json::from_value(value).unwrap()
    }

    #[test]
    fn publish_request_reads_type_field() {
        let req = request(json!({ "feature": "tracking", "resource_id": "SHIP1", "type": "tracking.updated" }));
        assert_eq!(req.kind, "tracking.updated");
        assert!(req.payload.is_null());
        assert!(req.validate().is_ok());
    }

    #[test]
    fn validation_collects_every_field() {
        let req = request(json!({ "feature": " ", "resource_id": "", "type": "", "payload": [1] }));
        let err = req.validate().unwrap_err();
        let fields: Vec<String> = err
            .details
            .unwrap()
            .into_iter()
            .map(|f| f.field)
            .collect();
        assert_eq!(fields, ["feature", "type", "resource_id", "payload"]);
    }
}
