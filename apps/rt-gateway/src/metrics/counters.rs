//! Live traffic and security counters, updated on the hot path.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;
use utoipa::ToSchema;

use crate::namespace::NamespaceRegistry;

#[derive(Debug, Default)]
struct NamespaceCounters {
    active: AtomicU64,
    total: AtomicU64,
    messages: AtomicU64,
    errors: AtomicU64,
    auth_failures: AtomicU64,
}

/// Point-in-time copy of one namespace's counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, ToSchema)]
pub struct NamespaceStats {
    pub active_connections: u64,
    pub total_connections: u64,
    pub messages: u64,
    pub errors: u64,
    pub auth_failures: u64,
}

/// Point-in-time copy of every counter. Totals are cumulative since start.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, ToSchema)]
pub struct CounterSnapshot {
    pub namespaces: BTreeMap<String, NamespaceStats>,
    pub active_connections: u64,
    pub total_connections: u64,
    pub messages: u64,
    pub errors: u64,
    pub auth_failures: u64,
    pub rate_limit_hits: u64,
    pub burst_limit_hits: u64,
    pub suspicious_activities: u64,
    pub messages_delivered: u64,
    pub delivery_failures: u64,
}

/// Lock-free counters. The namespace set is fixed at construction; events
/// for unknown namespaces only reach the global totals.
#[derive(Debug, Default)]
pub struct GatewayCounters {
    namespaces: HashMap<String, NamespaceCounters>,
    auth_failures: AtomicU64,
    rate_limit_hits: AtomicU64,
    burst_limit_hits: AtomicU64,
    suspicious_activities: AtomicU64,
    messages_delivered: AtomicU64,
    delivery_failures: AtomicU64,
}

impl GatewayCounters {
    pub fn new<'a>(namespaces: impl IntoIterator<Item = &'a str>) -> Self {
        Self {
            namespaces: namespaces
                .into_iter()
                .map(|name| (name.to_string(), NamespaceCounters::default()))
                .collect(),
            ..Self::default()
        }
    }

    pub fn for_registry(registry: &NamespaceRegistry) -> Self {
        Self::new(registry.names())
    }

    fn bump(&self, namespace: &str, field: impl Fn(&NamespaceCounters) -> &AtomicU64) {
        if let Some(counters) = self.namespaces.get(namespace) {
            field(counters).fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn connection_opened(&self, namespace: &str) {
        self.bump(namespace, |c| &c.active);
        self.bump(namespace, |c| &c.total);
    }

    /// Never underflows, even if called more often than `connection_opened`.
    pub fn connection_closed(&self, namespace: &str) {
        if let Some(counters) = self.namespaces.get(namespace) {
            let _ = counters
                .active
                .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |n| n.checked_sub(1));
        }
    }

    pub fn message_received(&self, namespace: &str) {
        self.bump(namespace, |c| &c.messages);
    }

    pub fn error(&self, namespace: &str) {
        self.bump(namespace, |c| &c.errors);
    }

    pub fn auth_failure(&self, namespace: &str) {
        self.auth_failures.fetch_add(1, Ordering::Relaxed);
        self.bump(namespace, |c| &c.auth_failures);
    }

    /// Rejected bearer token on an HTTP endpoint. No namespace applies.
    pub fn http_auth_failure(&self) {
        self.auth_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn rate_limited(&self, burst: bool) {
        self.rate_limit_hits.fetch_add(1, Ordering::Relaxed);
        if burst {
            self.burst_limit_hits.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn suspicious(&self) {
        self.suspicious_activities.fetch_add(1, Ordering::Relaxed);
    }

    pub fn delivered(&self, delivered: u64, failed: u64) {
        self.messages_delivered
            .fetch_add(delivered, Ordering::Relaxed);
        self.delivery_failures.fetch_add(failed, Ordering::Relaxed);
    }

    pub fn active_connections(&self) -> u64 {
        self.namespaces
            .values()
            .map(|c| c.active.load(Ordering::Relaxed))
            .sum()
    }

    pub fn snapshot(&self) -> CounterSnapshot {
        let mut snapshot = CounterSnapshot {
            auth_failures: self.auth_failures.load(Ordering::Relaxed),
            rate_limit_hits: self.rate_limit_hits.load(Ordering::Relaxed),
            burst_limit_hits: self.burst_limit_hits.load(Ordering::Relaxed),
            suspicious_activities: self.suspicious_activities.load(Ordering::Relaxed),
            messages_delivered: self.messages_delivered.load(Ordering::Relaxed),
            delivery_failures: self.delivery_failures.load(Ordering::Relaxed),
            ..CounterSnapshot::default()
        };
        for (name, c) in &self.namespaces {
            let stats = NamespaceStats {
                active_connections: c.active.load(Ordering::Relaxed),
                total_connections: c.total.load(Ordering::Relaxed),
                messages: c.messages.load(Ordering::Relaxed),
                errors: c.errors.load(Ordering::Relaxed),
                auth_failures: c.auth_failures.load(Ordering::Relaxed),
            };
            snapshot.active_connections += stats.active_connections;
            snapshot.total_connections += stats.total_connections;
            snapshot.messages += stats.messages;
            snapshot.errors += stats.errors;
            snapshot.namespaces.insert(name.clone(), stats);
        }
        snapshot
    }
}
