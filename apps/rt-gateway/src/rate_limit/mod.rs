//! Fixed-window rate limiter with role tiers and a burst window for sensitive
//! paths.

pub mod middleware;
pub mod store;

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use utoipa::ToSchema;

use crate::auth::principal::Role;
use crate::config::RateLimitConfig;
use crate::namespace::NamespaceRegistry;

use store::{RateLimitStore, StoreStats};

/// Which window rejected a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum LimitReason {
    Window,
    Burst,
}

/// Outcome of a single `check`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RateLimitDecision {
    pub allowed: bool,
    /// Primary-window budget for this key's tier.
    pub limit: u64,
    /// Requests left in the primary window.
    pub remaining: u64,
    /// When the primary window resets, epoch milliseconds.
    pub reset_at: i64,
    /// Seconds until the exhausted window resets. Set only on rejection.
    pub retry_after: Option<u64>,
    pub reason: Option<LimitReason>,
}

impl RateLimitDecision {
    fn unlimited(limit: u64, now: i64) -> Self {
        Self {
            allowed: true,
            limit,
            remaining: limit,
            reset_at: now,
            retry_after: None,
            reason: None,
        }
    }
}

/// Rejection totals, read by the metrics collector.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, ToSchema)]
pub struct RejectionCounts {
    pub window: u64,
    pub burst: u64,
}

pub struct RateLimiter {
    config: RateLimitConfig,
    store: Arc<dyn RateLimitStore>,
    namespaces: Arc<NamespaceRegistry>,
    window_rejections: AtomicU64,
    burst_rejections: AtomicU64,
}

impl RateLimiter {
    pub fn new(
        config: RateLimitConfig,
        store: Arc<dyn RateLimitStore>,
        namespaces: Arc<NamespaceRegistry>,
    ) -> Self {
        Self {
            config,
            store,
            namespaces,
            window_rejections: AtomicU64::new(0),
            burst_rejections: AtomicU64::new(0),
        }
    }

    pub fn config(&self) -> &RateLimitConfig {
        &self.config
    }

    /// Base budget for a role before namespace multipliers.
    pub fn tier_limit(&self, role: Role) -> u64 {
        match role {
            Role::SuperAdmin => self.config.super_admin_limit,
            Role::Admin => self.config.admin_limit,
            Role::Moderator => self.config.admin_limit * 3 / 4,
            Role::Standard | Role::Guest => self.config.default_limit,
        }
    }

    /// Budget multiplier and burst gating for a path. Gateway messages use
    /// `"{namespace}/{message_type}"`; anything else is an HTTP path.
    fn scope(&self, path: &str) -> (f64, bool) {
        match self.namespaces.resolve_path(path) {
            Some((policy, kind)) => (policy.tier_multiplier, policy.is_sensitive(kind)),
            None => (
                1.0,
                self.config
                    .sensitive_paths
                    .iter()
                    .any(|prefix| path.starts_with(prefix.as_str())),
            ),
        }
    }

    pub fn limit_for(&self, path: &str, role: Role) -> u64 {
        let (multiplier, _) = self.scope(path);
        ((self.tier_limit(role) as f64 * multiplier).floor() as u64).max(1)
    }

    pub async fn check(&self, key: &str, path: &str, role: Role) -> RateLimitDecision {
        self.check_at(key, path, role, chrono::Utc::now().timestamp_millis())
            .await
    }

    /// `check` with an explicit clock, in epoch milliseconds.
    pub async fn check_at(&self, key: &str, path: &str, role: Role, now: i64) -> RateLimitDecision {
        let (_, sensitive) = self.scope(path);
        let limit = self.limit_for(path, role);
        let window_ms = duration_ms(self.config.window);
        let burst_ms = duration_ms(self.config.burst_window);

        let entry = match self
            .store
            .record(key, now, window_ms, sensitive.then_some(burst_ms))
            .await
        {
            Ok(entry) => entry,
            Err(e) => {
                // Fail open: an unreachable coordination store must not take
                // the gateway down with it.
                tracing::error!(%e, %key, "rate-limit store failed, allowing request");
                return RateLimitDecision::unlimited(limit, now);
            }
        };

        let reset_at = entry.window_start + window_ms;
        let burst_reset_at = entry.burst_start + burst_ms;
        let remaining = limit.saturating_sub(entry.count);

        let reason = if sensitive && entry.burst_count > self.config.burst_limit {
            Some(LimitReason::Burst)
        } else if entry.count > limit {
            Some(LimitReason::Window)
        } else {
            None
        };

        let retry_after = match reason {
            Some(LimitReason::Burst) => {
                self.burst_rejections.fetch_add(1, Ordering::Relaxed);
                Some(ceil_secs(burst_reset_at - now))
            }
            Some(LimitReason::Window) => {
                self.window_rejections.fetch_add(1, Ordering::Relaxed);
                Some(ceil_secs(reset_at - now))
            }
            None => None,
        };

        if let Some(reason) = reason {
            tracing::debug!(%key, %path, ?reason, count = entry.count, limit, "rate limit exceeded");
        }

        RateLimitDecision {
            allowed: reason.is_none(),
            limit,
            remaining,
            reset_at,
            retry_after,
            reason,
        }
    }

    /// Remove entries stale by more than twice the window.
    pub async fn sweep(&self) -> usize {
        let now = chrono::Utc::now().timestamp_millis();
        match self.store.sweep(now, duration_ms(self.config.window)).await {
            Ok(removed) => removed,
            Err(e) => {
                tracing::warn!(%e, "rate-limit sweep failed");
                0
            }
        }
    }

    pub async fn stats(&self) -> StoreStats {
        let now = chrono::Utc::now().timestamp_millis();
        self.store
            .stats(now, duration_ms(self.config.window))
            .await
            .unwrap_or_else(|e| {
                tracing::warn!(%e, "rate-limit stats unavailable");
                StoreStats::default()
            })
    }

    pub fn rejections(&self) -> RejectionCounts {
        RejectionCounts {
            window: self.window_rejections.load(Ordering::Relaxed),
            burst: self.burst_rejections.load(Ordering::Relaxed),
        }
    }

    /// Periodically sweep stale entries so memory stays bounded regardless of
    /// how many distinct keys hit the gateway.
    pub fn spawn_sweeper(self: &Arc<Self>) -> tokio::task::JoinHandle<()> {
        let limiter = Arc::clone(self);
        let every = self.config.sweep_interval.max(Duration::from_secs(1));
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(every);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let removed = limiter.sweep().await;
                if removed > 0 {
                    tracing::debug!(removed, "swept stale rate-limit entries");
                }
            }
        })
    }
}

fn duration_ms(d: Duration) -> i64 {
    d.as_millis().min(i64::MAX as u128) as i64
}

fn ceil_secs(ms: i64) -> u64 {
    (ms.max(0) as u64).div_ceil(1000)
}

#[cfg(test)]
mod tests {
    use super::store::MemoryStore;
    use super::*;

    const HOUR_MS: i64 = 3_600_000;

    fn limiter_with(config: RateLimitConfig) -> RateLimiter {
        RateLimiter::new(
            config,
            Arc::new(MemoryStore::new()),
            Arc::new(NamespaceRegistry::builtin()),
        )
    }

    fn small_limiter() -> RateLimiter {
        limiter_with(RateLimitConfig {
            default_limit: 5,
            admin_limit: 20,
            super_admin_limit: 40,
            burst_limit: 3,
            ..RateLimitConfig::default()
        })
    }

    #[test]
    fn tiers_are_ordered() {
        let limiter = limiter_with(RateLimitConfig::default());
        assert_eq!(limiter.tier_limit(Role::SuperAdmin), 10_000);
        assert_eq!(limiter.tier_limit(Role::Admin), 5_000);
        assert_eq!(limiter.tier_limit(Role::Moderator), 3_750);
        assert_eq!(limiter.tier_limit(Role::Standard), 1_000);
        assert_eq!(limiter.tier_limit(Role::Guest), 1_000);
    }

    #[test]
    fn namespace_multiplier_scales_limit() {
        let limiter = limiter_with(RateLimitConfig::default());
        assert_eq!(limiter.limit_for("prices/subscribe", Role::Guest), 500);
        assert_eq!(limiter.limit_for("admin-activity/ping", Role::Admin), 10_000);
        assert_eq!(limiter.limit_for("/metrics", Role::Standard), 1_000);
    }

    #[tokio::test]
    async fn exactly_the_limit_is_allowed() {
        let limiter = small_limiter();
        let t0 = 10 * HOUR_MS;
        for i in 0..5 {
            let d = limiter
                .check_at("user:a", "tracking/ping", Role::Standard, t0 + i)
                .await;
            assert!(d.allowed, "request {i} should be allowed");
            assert_eq!(d.remaining, 4 - i as u64);
        }

        let d = limiter
            .check_at("user:a", "tracking/ping", Role::Standard, t0 + 10)
            .await;
        assert!(!d.allowed);
        assert_eq!(d.remaining, 0);
        assert_eq!(d.reason, Some(LimitReason::Window));
    }

    #[tokio::test]
    async fn retry_after_is_time_left_in_window_rounded_up() {
        let limiter = small_limiter();
        let t0 = 10 * HOUR_MS;
        for _ in 0..5 {
            limiter
                .check_at("user:b", "tracking/ping", Role::Standard, t0)
                .await;
        }
        // 1500.5 seconds into the window leaves 2099.5 seconds.
        let d = limiter
            .check_at("user:b", "tracking/ping", Role::Standard, t0 + 1_500_500)
            .await;
        assert!(!d.allowed);
        assert_eq!(d.retry_after, Some(2100));
        assert_eq!(d.reset_at, t0 + HOUR_MS);
    }

    #[tokio::test]
    async fn window_rollover_restores_budget() {
        let limiter = small_limiter();
        let t0 = 10 * HOUR_MS;
        for _ in 0..6 {
            limiter
                .check_at("user:c", "tracking/ping", Role::Standard, t0)
                .await;
        }
        let d = limiter
            .check_at("user:c", "tracking/ping", Role::Standard, t0 + HOUR_MS)
            .await;
        assert!(d.allowed);
        assert_eq!(d.remaining, 4);
    }

    #[tokio::test]
    async fn burst_rejection_takes_priority_on_sensitive_paths() {
        let limiter = small_limiter();
        let t0 = 10 * HOUR_MS;
        for i in 0..3 {
            let d = limiter
                .check_at("user:d", "collaboration/room.message", Role::Admin, t0 + i)
                .await;
            assert!(d.allowed);
        }
        let d = limiter
            .check_at("user:d", "collaboration/room.message", Role::Admin, t0 + 500)
            .await;
        assert!(!d.allowed);
        assert_eq!(d.reason, Some(LimitReason::Burst));
        assert!(d.remaining > 0, "primary window still has headroom");
        assert_eq!(d.retry_after, Some(1));
        assert_eq!(limiter.rejections(), RejectionCounts { window: 0, burst: 1 });

        // The burst window has passed.
        let d = limiter
            .check_at("user:d", "collaboration/room.message", Role::Admin, t0 + 1_000)
            .await;
        assert!(d.allowed);
    }

    #[tokio::test]
    async fn burst_window_ignored_for_ordinary_paths() {
        let limiter = small_limiter();
        let t0 = 10 * HOUR_MS;
        for _ in 0..5 {
            let d = limiter
                .check_at("user:e", "collaboration/room.typing", Role::Standard, t0)
                .await;
            assert!(d.allowed);
        }
    }

    #[tokio::test]
    async fn sensitive_http_prefixes_use_burst_window() {
        let limiter = small_limiter();
        let t0 = 10 * HOUR_MS;
        for _ in 0..3 {
            assert!(
                limiter
                    .check_at("ip:1.2.3.4", "/api/v1/publish", Role::Admin, t0)
                    .await
                    .allowed
            );
        }
        let d = limiter
            .check_at("ip:1.2.3.4", "/api/v1/publish", Role::Admin, t0)
            .await;
        assert_eq!(d.reason, Some(LimitReason::Burst));
    }

    #[tokio::test]
    async fn keys_are_independent() {
        let limiter = small_limiter();
        let t0 = 10 * HOUR_MS;
        for _ in 0..6 {
            limiter
                .check_at("user:f", "tracking/ping", Role::Standard, t0)
                .await;
        }
        assert!(
            limiter
                .check_at("user:g", "tracking/ping", Role::Standard, t0)
                .await
                .allowed
        );
    }

    #[tokio::test]
    async fn stats_count_total_and_active() {
        let limiter = small_limiter();
        limiter.check("user:h", "tracking/ping", Role::Standard).await;
        limiter.check("user:i", "tracking/ping", Role::Standard).await;
        let stats = limiter.stats().await;
        assert_eq!(stats.total_entries, 2);
        assert_eq!(stats.active_entries, 2);
    }
}
