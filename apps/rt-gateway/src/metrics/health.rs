//! Health scoring and alert rules. Pure functions over one interval's deltas.

use chrono::{DateTime, Utc};
use rt_common::id::{prefix, prefixed_ulid};
use serde::Serialize;
use utoipa::ToSchema;

pub const DEGRADED_BELOW: f64 = 70.0;
pub const CRITICAL_BELOW: f64 = 40.0;

const HIGH_ERROR_RATE: f64 = 0.05;
const AUTH_FAILURE_SPIKE: u64 = 10;
const MEMORY_PRESSURE_PERCENT: f64 = 90.0;
const MEMORY_PENALTY_PERCENT: f64 = 85.0;
const SUSPICIOUS_SPIKE: u64 = 5;

/// Activity observed during one interval.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct HealthInputs {
    pub messages: u64,
    pub errors: u64,
    pub auth_failures: u64,
    pub rate_limit_hits: u64,
    pub suspicious: u64,
    pub active_connections: u64,
    pub memory_percent: f64,
}

impl HealthInputs {
    /// Errors per message; zero when there was no traffic.
    pub fn error_rate(&self) -> f64 {
        if self.messages == 0 {
            0.0
        } else {
            self.errors as f64 / self.messages as f64
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, ToSchema)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Healthy,
    Degraded,
    Critical,
}

impl HealthStatus {
    pub fn from_score(score: f64) -> Self {
        if score < CRITICAL_BELOW {
            HealthStatus::Critical
        } else if score < DEGRADED_BELOW {
            HealthStatus::Degraded
        } else {
            HealthStatus::Healthy
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            HealthStatus::Healthy => "healthy",
            HealthStatus::Degraded => "degraded",
            HealthStatus::Critical => "critical",
        }
    }
}

/// Score in `[0, 100]`: penalties for errors, auth failures, rate limiting,
/// suspicious activity and memory pressure; a small bonus for live traffic.
pub fn compute_health_score(inputs: &HealthInputs) -> f64 {
    let active = inputs.active_connections.max(1) as f64;

    let error_penalty = (inputs.error_rate() * 200.0).min(30.0);
    let auth_penalty = (inputs.auth_failures as f64 / active * 50.0).min(20.0);
    let rate_limit_penalty = (inputs.rate_limit_hits as f64 / active * 10.0).min(15.0);
    let suspicious_penalty = (inputs.suspicious as f64 * 2.0).min(20.0);
    let memory_penalty = if inputs.memory_percent > MEMORY_PENALTY_PERCENT {
        10.0
    } else {
        0.0
    };
    let activity_bonus = (inputs.active_connections as f64 / 20.0).min(5.0);

    let score = 100.0 - error_penalty - auth_penalty - rate_limit_penalty - suspicious_penalty
        - memory_penalty
        + activity_bonus;
    if score.is_nan() {
        return 0.0;
    }
    score.clamp(0.0, 100.0)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum AlertCategory {
    HealthCritical,
    HealthDegraded,
    HighErrorRate,
    AuthFailureSpike,
    MemoryPressure,
    SuspiciousActivity,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, ToSchema)]
#[serde(rename_all = "lowercase")]
pub enum AlertSeverity {
    Warning,
    Critical,
}

#[derive(Debug, Clone, PartialEq, Serialize, ToSchema)]
pub struct Alert {
    pub id: String,
    pub category: AlertCategory,
    pub severity: AlertSeverity,
    pub message: String,
    pub value: f64,
    pub threshold: f64,
    pub raised_at: DateTime<Utc>,
}

impl Alert {
    fn new(
        category: AlertCategory,
        severity: AlertSeverity,
        message: String,
        value: f64,
        threshold: f64,
    ) -> Self {
        Self {
            id: prefixed_ulid(prefix::ALERT),
            category,
            severity,
            message,
            value,
            threshold,
            raised_at: Utc::now(),
        }
    }
}

/// Alerts raised by one interval. Each category appears at most once;
/// critical health replaces degraded health.
pub fn evaluate_alerts(inputs: &HealthInputs, score: f64) -> Vec<Alert> {
    let mut alerts = Vec::new();

    if score < CRITICAL_BELOW {
        alerts.push(Alert::new(
            AlertCategory::HealthCritical,
            AlertSeverity::Critical,
            format!("Health score {score:.1} is critical"),
            score,
            CRITICAL_BELOW,
        ));
    } else if score < DEGRADED_BELOW {
        alerts.push(Alert::new(
            AlertCategory::HealthDegraded,
            AlertSeverity::Warning,
            format!("Health score {score:.1} is degraded"),
            score,
            DEGRADED_BELOW,
        ));
    }

    let error_rate = inputs.error_rate();
    if error_rate > HIGH_ERROR_RATE {
        alerts.push(Alert::new(
            AlertCategory::HighErrorRate,
            AlertSeverity::Warning,
            format!("Error rate {:.1}% over the last interval", error_rate * 100.0),
            error_rate,
            HIGH_ERROR_RATE,
        ));
    }

    if inputs.auth_failures > AUTH_FAILURE_SPIKE {
        alerts.push(Alert::new(
            AlertCategory::AuthFailureSpike,
            AlertSeverity::Warning,
            format!("{} authentication failures in the last interval", inputs.auth_failures),
            inputs.auth_failures as f64,
            AUTH_FAILURE_SPIKE as f64,
        ));
    }

    if inputs.memory_percent > MEMORY_PRESSURE_PERCENT {
        alerts.push(Alert::new(
            AlertCategory::MemoryPressure,
            AlertSeverity::Critical,
            format!("Memory usage at {:.1}%", inputs.memory_percent),
            inputs.memory_percent,
            MEMORY_PRESSURE_PERCENT,
        ));
    }

    if inputs.suspicious > SUSPICIOUS_SPIKE {
        alerts.push(Alert::new(
            AlertCategory::SuspiciousActivity,
            AlertSeverity::Warning,
            format!("{} suspicious events in the last interval", inputs.suspicious),
            inputs.suspicious as f64,
            SUSPICIOUS_SPIKE as f64,
        ));
    }

    alerts
}
