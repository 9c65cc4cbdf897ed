//! Periodic snapshots of gateway activity, with bounded history and alerts.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use sysinfo::{Pid, System};
use utoipa::ToSchema;

use crate::config::MetricsConfig;
use crate::rate_limit::store::StoreStats;
use crate::rate_limit::{RateLimiter, RejectionCounts};
use crate::subscriptions::SubscriptionRegistry;

use super::counters::{CounterSnapshot, GatewayCounters};
use super::health::{compute_health_score, evaluate_alerts, Alert, AlertSeverity, HealthInputs, HealthStatus};

const MAX_ALERTS: usize = 100;
/// Connection swing that makes a real-time sample worth logging.
const SIGNIFICANT_CONNECTION_DELTA: u64 = 10;
const SIGNIFICANT_CONNECTION_RATIO: f64 = 0.10;

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, ToSchema)]
pub struct ResourceUsage {
    pub memory_bytes: u64,
    pub memory_percent: f64,
    pub uptime_secs: u64,
}

/// Source of process resource figures.
pub trait ResourceProbe: Send + Sync {
    fn sample(&self) -> ResourceUsage;
}

/// Reads this process's resident memory through `sysinfo`.
pub struct SystemProbe {
    system: Mutex<System>,
    pid: Pid,
    started_at: Instant,
}

impl SystemProbe {
    pub fn new() -> Self {
        Self {
            system: Mutex::new(System::new()),
            pid: Pid::from_u32(std::process::id()),
            started_at: Instant::now(),
        }
    }
}

impl Default for SystemProbe {
    fn default() -> Self {
        Self::new()
    }
}

impl ResourceProbe for SystemProbe {
    fn sample(&self) -> ResourceUsage {
        let mut sys = self.system.lock();
        sys.refresh_memory();
        sys.refresh_process(self.pid);

        let memory_bytes = sys.process(self.pid).map(|p| p.memory()).unwrap_or(0);
        let total = sys.total_memory();
        let memory_percent = if total == 0 {
            0.0
        } else {
            memory_bytes as f64 / total as f64 * 100.0
        };
        ResourceUsage {
            memory_bytes,
            memory_percent,
            uptime_secs: self.started_at.elapsed().as_secs(),
        }
    }
}

/// What happened between two snapshots.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, ToSchema)]
pub struct IntervalStats {
    pub messages: u64,
    pub errors: u64,
    pub error_rate: f64,
    pub auth_failures: u64,
    pub rate_limit_hits: u64,
    pub suspicious_activities: u64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, ToSchema)]
pub struct RateLimiterStats {
    pub total_entries: usize,
    pub active_entries: usize,
    pub rejections: RejectionCounts,
}

/// Immutable record of the gateway at one instant.
#[derive(Debug, Clone, PartialEq, Serialize, ToSchema)]
pub struct MetricsSnapshot {
    /// 1-based position in the snapshot series; 0 for live views.
    pub sequence: u64,
    pub taken_at: DateTime<Utc>,
    /// Cumulative counters since start.
    pub counters: CounterSnapshot,
    pub interval: IntervalStats,
    pub resources: ResourceUsage,
    pub rate_limiter: RateLimiterStats,
    pub subscriptions: usize,
    pub health_score: f64,
    pub status: HealthStatus,
    /// Sum of `health_score` over snapshots `1..=sequence`.
    pub score_sum: f64,
}

/// Rolled-up view over a look-back window.
#[derive(Debug, Clone, PartialEq, Serialize, ToSchema)]
pub struct MetricsSummary {
    pub window_minutes: u64,
    pub snapshots: usize,
    pub from: DateTime<Utc>,
    pub to: DateTime<Utc>,
    pub messages: u64,
    pub errors: u64,
    pub error_rate: f64,
    pub average_health_score: f64,
    pub peak_connections: u64,
    pub current_connections: u64,
    pub current_status: HealthStatus,
    pub alerts: usize,
}

#[derive(Default)]
struct Series {
    history: VecDeque<Arc<MetricsSnapshot>>,
    sequence: u64,
    score_sum: f64,
    /// Counters as of the last stored snapshot.
    baseline: CounterSnapshot,
}

pub struct MetricsCollector {
    config: MetricsConfig,
    counters: Arc<GatewayCounters>,
    limiter: Arc<RateLimiter>,
    subscriptions: Arc<SubscriptionRegistry>,
    probe: Box<dyn ResourceProbe>,
    series: Mutex<Series>,
    alerts: Mutex<VecDeque<Alert>>,
    last_sample: Mutex<CounterSnapshot>,
    /// Store entry counts as of the last sampler or snapshot tick. Live
    /// views read this instead of querying the store.
    store_stats: Mutex<StoreStats>,
}

impl MetricsCollector {
    pub fn new(
        config: MetricsConfig,
        counters: Arc<GatewayCounters>,
        limiter: Arc<RateLimiter>,
        subscriptions: Arc<SubscriptionRegistry>,
        probe: Box<dyn ResourceProbe>,
    ) -> Self {
        Self {
            config,
            counters,
            limiter,
            subscriptions,
            probe,
            series: Mutex::new(Series::default()),
            alerts: Mutex::new(VecDeque::new()),
            last_sample: Mutex::new(CounterSnapshot::default()),
            store_stats: Mutex::new(StoreStats::default()),
        }
    }

    /// Query the limiter store and cache the entry counts.
    pub async fn refresh_store_stats(&self) -> StoreStats {
        let stats = self.limiter.stats().await;
        *self.store_stats.lock() = stats;
        stats
    }

    fn limiter_stats(&self, store: StoreStats) -> RateLimiterStats {
        RateLimiterStats {
            total_entries: store.total_entries,
            active_entries: store.active_entries,
            rejections: self.limiter.rejections(),
        }
    }

    fn gather(&self, store: StoreStats) -> (CounterSnapshot, RateLimiterStats, ResourceUsage) {
        (
            self.counters.snapshot(),
            self.limiter_stats(store),
            self.probe.sample(),
        )
    }

    fn build(
        &self,
        counters: CounterSnapshot,
        baseline: &CounterSnapshot,
        rate_limiter: RateLimiterStats,
        resources: ResourceUsage,
    ) -> MetricsSnapshot {
        let inputs = HealthInputs {
            messages: counters.messages.saturating_sub(baseline.messages),
            errors: counters.errors.saturating_sub(baseline.errors),
            auth_failures: counters.auth_failures.saturating_sub(baseline.auth_failures),
            rate_limit_hits: counters
                .rate_limit_hits
                .saturating_sub(baseline.rate_limit_hits),
            suspicious: counters
                .suspicious_activities
                .saturating_sub(baseline.suspicious_activities),
            active_connections: counters.active_connections,
            memory_percent: resources.memory_percent,
        };
        let health_score = compute_health_score(&inputs);

        MetricsSnapshot {
            sequence: 0,
            taken_at: Utc::now(),
            interval: IntervalStats {
                messages: inputs.messages,
                errors: inputs.errors,
                error_rate: inputs.error_rate(),
                auth_failures: inputs.auth_failures,
                rate_limit_hits: inputs.rate_limit_hits,
                suspicious_activities: inputs.suspicious,
            },
            counters,
            resources,
            rate_limiter,
            subscriptions: self.subscriptions.subscription_count(),
            health_score,
            status: HealthStatus::from_score(health_score),
            score_sum: 0.0,
        }
    }

    /// Live view since the last stored snapshot. Not recorded. Store entry
    /// counts come from the cache, so the cost does not grow with the number
    /// of rate-limit keys.
    pub fn current(&self) -> MetricsSnapshot {
        let store = *self.store_stats.lock();
        let (counters, limiter, resources) = self.gather(store);
        let series = self.series.lock();
        let mut snapshot = self.build(counters, &series.baseline, limiter, resources);
        snapshot.score_sum = series.score_sum;
        snapshot
    }

    /// Take a full snapshot, append it to history and raise alerts.
    pub async fn snapshot(&self) -> Arc<MetricsSnapshot> {
        let store = self.refresh_store_stats().await;
        let (counters, limiter, resources) = self.gather(store);

        let snapshot = {
            let mut series = self.series.lock();
            let mut snapshot = self.build(counters, &series.baseline, limiter, resources);
            series.sequence += 1;
            series.score_sum += snapshot.health_score;
            snapshot.sequence = series.sequence;
            snapshot.score_sum = series.score_sum;
            series.baseline = snapshot.counters.clone();

            let snapshot = Arc::new(snapshot);
            series.history.push_back(Arc::clone(&snapshot));
            while series.history.len() > self.config.history_capacity.max(1) {
                series.history.pop_front();
            }
            snapshot
        };

        tracing::info!(
            sequence = snapshot.sequence,
            health_score = snapshot.health_score,
            status = snapshot.status.as_str(),
            active_connections = snapshot.counters.active_connections,
            messages = snapshot.interval.messages,
            errors = snapshot.interval.errors,
            memory_mb = snapshot.resources.memory_bytes / (1024 * 1024),
            "metrics snapshot"
        );

        let inputs = HealthInputs {
            messages: snapshot.interval.messages,
            errors: snapshot.interval.errors,
            auth_failures: snapshot.interval.auth_failures,
            rate_limit_hits: snapshot.interval.rate_limit_hits,
            suspicious: snapshot.interval.suspicious_activities,
            active_connections: snapshot.counters.active_connections,
            memory_percent: snapshot.resources.memory_percent,
        };
        self.raise(evaluate_alerts(&inputs, snapshot.health_score));

        snapshot
    }

    fn raise(&self, new_alerts: Vec<Alert>) {
        if new_alerts.is_empty() {
            return;
        }
        for alert in &new_alerts {
            match alert.severity {
                AlertSeverity::Critical => tracing::error!(
                    category = ?alert.category,
                    value = alert.value,
                    threshold = alert.threshold,
                    "{}",
                    alert.message
                ),
                AlertSeverity::Warning => tracing::warn!(
                    category = ?alert.category,
                    value = alert.value,
                    threshold = alert.threshold,
                    "{}",
                    alert.message
                ),
            }
        }
        let mut alerts = self.alerts.lock();
        alerts.extend(new_alerts);
        while alerts.len() > MAX_ALERTS {
            alerts.pop_front();
        }
    }

    /// Real-time check between snapshots. Logs only when something moved
    /// enough to matter; returns whether it logged.
    pub fn sample(&self) -> bool {
        let now = self.counters.snapshot();
        let previous = std::mem::replace(&mut *self.last_sample.lock(), now.clone());

        let connection_delta = now.active_connections.abs_diff(previous.active_connections);
        let significant_connections = connection_delta >= SIGNIFICANT_CONNECTION_DELTA
            || (previous.active_connections > 0
                && connection_delta as f64 / previous.active_connections as f64
                    >= SIGNIFICANT_CONNECTION_RATIO);
        let new_errors = now.errors.saturating_sub(previous.errors);
        let new_security = now.auth_failures.saturating_sub(previous.auth_failures)
            + now.rate_limit_hits.saturating_sub(previous.rate_limit_hits)
            + now
                .suspicious_activities
                .saturating_sub(previous.suspicious_activities);

        if !(significant_connections || new_errors > 0 || new_security > 0) {
            return false;
        }
        tracing::info!(
            active_connections = now.active_connections,
            connection_delta = now.active_connections as i64 - previous.active_connections as i64,
            new_errors,
            new_security_events = new_security,
            "gateway activity"
        );
        true
    }

    /// Up to `limit` most recent snapshots, oldest first.
    pub fn recent(&self, limit: usize) -> Vec<Arc<MetricsSnapshot>> {
        let series = self.series.lock();
        let skip = series.history.len().saturating_sub(limit);
        series.history.iter().skip(skip).cloned().collect()
    }

    pub fn latest(&self) -> Option<Arc<MetricsSnapshot>> {
        self.series.lock().history.back().cloned()
    }

    /// Up to `limit` most recent alerts, newest first.
    pub fn alerts(&self, limit: usize) -> Vec<Alert> {
        self.alerts.lock().iter().rev().take(limit).cloned().collect()
    }

    /// Summary of the snapshots taken in the last `minutes`.
    pub fn summary(&self, minutes: u64) -> Option<MetricsSummary> {
        let now = Utc::now();
        let since = i64::try_from(minutes)
            .ok()
            .and_then(chrono::Duration::try_minutes)
            .and_then(|window| now.checked_sub_signed(window))
            .unwrap_or(DateTime::<Utc>::MIN_UTC);

        let series = self.series.lock();
        let in_window: Vec<Arc<MetricsSnapshot>> = series
            .history
            .iter()
            .filter(|s| s.taken_at >= since)
            .cloned()
            .collect();
        drop(series);
        let oldest = in_window.first()?;
        let newest = in_window.last()?;

        let messages = newest
            .counters
            .messages
            .saturating_sub(oldest.counters.messages)
            .saturating_add(oldest.interval.messages);
        let errors = newest
            .counters
            .errors
            .saturating_sub(oldest.counters.errors)
            .saturating_add(oldest.interval.errors);
        let span = newest.sequence.saturating_sub(oldest.sequence).saturating_add(1) as f64;
        let average = (newest.score_sum - oldest.score_sum + oldest.health_score) / span;
        // Peak is a maximum, not a running total, so it needs every entry in
        // the window rather than just the two bounds.
        let peak = in_window
            .iter()
            .map(|s| s.counters.active_connections)
            .max()
            .unwrap_or(0);

        let alerts = self
            .alerts
            .lock()
            .iter()
            .filter(|a| a.raised_at >= since)
            .count();

        Some(MetricsSummary {
            window_minutes: minutes,
            snapshots: in_window.len(),
            from: oldest.taken_at,
            to: newest.taken_at,
            messages,
            errors,
            error_rate: if messages == 0 {
                0.0
            } else {
                errors as f64 / messages as f64
            },
            average_health_score: average,
            peak_connections: peak,
            current_connections: self.counters.active_connections(),
            current_status: newest.status,
            alerts,
        })
    }

    /// Start the real-time sampler and the snapshot task.
    pub fn spawn(self: &Arc<Self>) -> Vec<tokio::task::JoinHandle<()>> {
        let sampler = {
            let collector = Arc::clone(self);
            let every = self.config.sample_interval.max(Duration::from_secs(1));
            tokio::spawn(async move {
                let mut ticker = tokio::time::interval(every);
                ticker.tick().await;
                loop {
                    ticker.tick().await;
                    collector.refresh_store_stats().await;
                    collector.sample();
                }
            })
        };
        let snapshotter = {
            let collector = Arc::clone(self);
            let every = self.config.snapshot_interval.max(Duration::from_secs(1));
            tokio::spawn(async move {
                let mut ticker = tokio::time::interval(every);
                ticker.tick().await;
                loop {
                    ticker.tick().await;
                    collector.snapshot().await;
                }
            })
        };
        vec![sampler, snapshotter]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RateLimitConfig;
    use crate::metrics::health::AlertCategory;
    use crate::namespace::NamespaceRegistry;
    use crate::rate_limit::store::{MemoryStore, RateLimitEntry, RateLimitStore, StoreError};
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct FixedProbe(f64);

    impl ResourceProbe for FixedProbe {
        fn sample(&self) -> ResourceUsage {
            ResourceUsage {
                memory_bytes: 64 * 1024 * 1024,
                memory_percent: self.0,
                uptime_secs: 1,
            }
        }
    }

    /// Counts how often entry stats are requested.
    #[derive(Default)]
    struct CountingStore {
        inner: MemoryStore,
        stats_calls: AtomicUsize,
    }

    #[async_trait::async_trait]
    impl RateLimitStore for CountingStore {
        async fn record(
            &self,
            key: &str,
            now: i64,
            window_ms: i64,
            burst_window_ms: Option<i64>,
        ) -> Result<RateLimitEntry, StoreError> {
            self.inner.record(key, now, window_ms, burst_window_ms).await
        }

        async fn sweep(&self, now: i64, window_ms: i64) -> Result<usize, StoreError> {
            self.inner.sweep(now, window_ms).await
        }

        async fn stats(&self, now: i64, window_ms: i64) -> Result<StoreStats, StoreError> {
            self.stats_calls.fetch_add(1, Ordering::SeqCst);
            self.inner.stats(now, window_ms).await
        }
    }

    fn collector_with(history: usize, memory_percent: f64) -> (MetricsCollector, Arc<GatewayCounters>) {
        collector_over(history, memory_percent, Arc::new(MemoryStore::new()))
    }

    fn collector_over(
        history: usize,
        memory_percent: f64,
        store: Arc<dyn RateLimitStore>,
    ) -> (MetricsCollector, Arc<GatewayCounters>) {
        let namespaces = Arc::new(NamespaceRegistry::builtin());
        let counters = Arc::new(GatewayCounters::for_registry(&namespaces));
        let limiter = Arc::new(RateLimiter::new(
            RateLimitConfig::default(),
            store,
            namespaces,
        ));
        let collector = MetricsCollector::new(
            MetricsConfig {
                history_capacity: history,
                ..MetricsConfig::default()
            },
            Arc::clone(&counters),
            limiter,
            Arc::new(SubscriptionRegistry::new()),
            Box::new(FixedProbe(memory_percent)),
        );
        (collector, counters)
    }

    #[tokio::test]
    async fn snapshots_use_interval_deltas() {
        let (collector, counters) = collector_with(10, 10.0);
        counters.connection_opened("tracking");
        for _ in 0..10 {
            counters.message_received("tracking");
        }
        counters.error("tracking");

        let first = collector.snapshot().await;
        assert_eq!(first.sequence, 1);
        assert_eq!(first.interval.messages, 10);
        assert_eq!(first.interval.errors, 1);
        assert!(first.health_score < 100.0);

        let second = collector.snapshot().await;
        assert_eq!(second.interval.messages, 0);
        assert_eq!(second.counters.messages, 10);
        assert_eq!(second.health_score, 100.0);
        assert_eq!(second.score_sum, first.health_score + 100.0);
    }

    #[tokio::test]
    async fn history_is_bounded() {
        let (collector, _) = collector_with(3, 10.0);
        for _ in 0..5 {
            collector.snapshot().await;
        }
        let recent = collector.recent(10);
        assert_eq!(recent.len(), 3);
        assert_eq!(recent[0].sequence, 3);
        assert_eq!(recent[2].sequence, 5);
        assert_eq!(collector.recent(1)[0].sequence, 5);
    }

    #[tokio::test]
    async fn summary_covers_window() {
        let (collector, counters) = collector_with(10, 10.0);
        assert!(collector.summary(60).is_none());

        for _ in 0..4 {
            counters.message_received("prices");
        }
        counters.connection_opened("prices");
        counters.connection_opened("prices");
        collector.snapshot().await;

        counters.connection_closed("prices");
        for _ in 0..6 {
            counters.message_received("prices");
        }
        collector.snapshot().await;

        let summary = collector.summary(60).unwrap();
        assert_eq!(summary.snapshots, 2);
        assert_eq!(summary.messages, 10);
        assert_eq!(summary.peak_connections, 2);
        assert_eq!(summary.current_connections, 1);
        assert_eq!(summary.average_health_score, 100.0);
    }

    #[tokio::test]
    async fn alerts_are_recorded_newest_first() {
        let (collector, counters) = collector_with(10, 95.0);
        for _ in 0..11 {
            counters.auth_failure("tracking");
        }
        collector.snapshot().await;

        let categories: Vec<AlertCategory> =
            collector.alerts(10).into_iter().map(|a| a.category).collect();
        assert!(categories.contains(&AlertCategory::MemoryPressure));
        assert!(categories.contains(&AlertCategory::AuthFailureSpike));
        assert_eq!(collector.alerts(1).len(), 1);
    }

    #[test]
    fn sample_logs_only_significant_changes() {
        let (collector, counters) = collector_with(10, 10.0);
        assert!(!collector.sample());

        counters.connection_opened("tracking");
        assert!(!collector.sample());

        for _ in 0..10 {
            counters.connection_opened("tracking");
        }
        assert!(collector.sample());

        counters.message_received("tracking");
        assert!(!collector.sample());

        counters.error("tracking");
        assert!(collector.sample());

        counters.suspicious();
        assert!(collector.sample());
    }

    #[tokio::test]
    async fn current_does_not_advance_series() {
        let (collector, counters) = collector_with(10, 10.0);
        counters.message_received("tracking");
        let live = collector.current();
        assert_eq!(live.sequence, 0);
        assert_eq!(live.interval.messages, 1);
        assert!(collector.latest().is_none());
    }

    #[tokio::test]
    async fn live_views_read_cached_store_stats() {
        let store = Arc::new(CountingStore::default());
        let (collector, _) = collector_over(10, 10.0, store.clone());
        store.inner.record("ip:10.0.0.1", chrono::Utc::now().timestamp_millis(), 60_000, None).await.unwrap();

        for _ in 0..20 {
            collector.current();
        }
        assert_eq!(store.stats_calls.load(Ordering::SeqCst), 0);
        assert_eq!(collector.current().rate_limiter.total_entries, 0);

        collector.snapshot().await;
        assert_eq!(store.stats_calls.load(Ordering::SeqCst), 1);
        assert_eq!(collector.current().rate_limiter.total_entries, 1);
        assert_eq!(store.stats_calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn summary_tolerates_out_of_order_counters() {
        let (collector, counters) = collector_with(10, 10.0);
        counters.message_received("tracking");
        collector.snapshot().await;
        {
            // A reset baseline makes the newest cumulative count smaller.
            let mut series = collector.series.lock();
            let mut newest = (**series.history.back().unwrap()).clone();
            newest.sequence += 1;
            newest.counters.messages = 0;
            series.history.push_back(Arc::new(newest));
        }
        let summary = collector.summary(60).unwrap();
        assert_eq!(summary.messages, 1);
    }
}
