//! Traffic counters, health scoring and the periodic metrics collector.

pub mod collector;
pub mod counters;
pub mod exposition;
pub mod health;

pub use collector::{MetricsCollector, MetricsSnapshot, MetricsSummary, SystemProbe};
pub use counters::{CounterSnapshot, GatewayCounters};
pub use health::{Alert, HealthStatus};
