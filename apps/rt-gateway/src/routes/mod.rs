pub mod admin;
pub mod health;
pub mod metrics;

use axum::{middleware, Router};
use utoipa::openapi::security::{Http, HttpAuthScheme, SecurityScheme};
use utoipa::{Modify, OpenApi};

use crate::rate_limit::middleware::rate_limit;
use crate::AppState;

/// Every HTTP route. Operator endpoints sit behind the rate limiter, which
/// needs the state up front.
pub fn router(state: AppState) -> Router<AppState> {
    Router::new()
        .merge(health::router())
        .merge(metrics::router())
        .merge(crate::gateway::server::router())
        .merge(
            admin::router().route_layer(middleware::from_fn_with_state(state, rate_limit)),
        )
}

struct SecurityAddon;

impl Modify for SecurityAddon {
    fn modify(&self, openapi: &mut utoipa::openapi::OpenApi) {
        if let Some(components) = openapi.components.as_mut() {
            components.add_security_scheme(
                "bearer",
                SecurityScheme::Http(Http::new(HttpAuthScheme::Bearer)),
            );
        }
    }
}

#[derive(OpenApi)]
#[openapi(
    paths(
        // Health
        health::health,
        // Metrics
        metrics::current,
        metrics::summary,
        metrics::history,
        metrics::alerts,
        metrics::prometheus,
        // Admin
        admin::rate_limit_stats,
        admin::publish,
    ),
    components(
        schemas(
            // Error types
            crate::error::ApiErrorBody,
            crate::error::ApiErrorDetail,
            crate::error::FieldError,
            crate::rate_limit::middleware::RateLimitRejection,
            // Metrics
            crate::metrics::MetricsSnapshot,
            crate::metrics::MetricsSummary,
            crate::metrics::CounterSnapshot,
            crate::metrics::counters::NamespaceStats,
            crate::metrics::collector::IntervalStats,
            crate::metrics::collector::ResourceUsage,
            crate::metrics::collector::RateLimiterStats,
            crate::metrics::HealthStatus,
            crate::metrics::Alert,
            crate::metrics::health::AlertCategory,
            crate::metrics::health::AlertSeverity,
            crate::rate_limit::RejectionCounts,
            // Route request/response types
            health::HealthResponse,
            admin::PublishRequest,
            crate::gateway::hub::DeliveryReport,
        )
    ),
    modifiers(&SecurityAddon),
    tags(
        (name = "Health", description = "Health check"),
        (name = "Metrics", description = "Traffic, health and alert metrics"),
        (name = "Admin", description = "Operator endpoints"),
    )
)]
pub struct ApiDoc;
