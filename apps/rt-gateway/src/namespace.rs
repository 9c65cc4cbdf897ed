//! Namespace registry: the static table of logical channels and their policies.

use std::collections::{BTreeSet, HashMap};

use crate::auth::principal::Role;

/// Message types every namespace accepts.
pub const COMMON_TYPES: &[&str] = &["ping", "subscribe", "unsubscribe"];

/// Immutable per-namespace policy.
#[derive(Debug, Clone)]
pub struct NamespacePolicy {
    /// Path segment under `/rt/`.
    pub name: String,
    /// Subscription feature served by `subscribe`/`unsubscribe` in this namespace.
    pub feature: String,
    /// Whether connections without a token are accepted.
    pub allow_anonymous: bool,
    /// Lowest role allowed to connect.
    pub min_role: Role,
    /// Accepted inbound message types.
    pub message_types: BTreeSet<String>,
    /// Message types gated by the burst window.
    pub sensitive_types: BTreeSet<String>,
    /// Scales every tier's primary-window budget.
    pub tier_multiplier: f64,
}

impl NamespacePolicy {
    pub fn new(name: &str, feature: &str) -> Self {
        Self {
            name: name.to_string(),
            feature: feature.to_string(),
            allow_anonymous: false,
            min_role: Role::Standard,
            message_types: COMMON_TYPES.iter().map(|t| t.to_string()).collect(),
            sensitive_types: BTreeSet::new(),
            tier_multiplier: 1.0,
        }
    }

    pub fn anonymous(mut self) -> Self {
        self.allow_anonymous = true;
        self.min_role = Role::Guest;
        self
    }

    pub fn min_role(mut self, role: Role) -> Self {
        self.min_role = role;
        self
    }

    pub fn message(mut self, kind: &str) -> Self {
        self.message_types.insert(kind.to_string());
        self
    }

    /// Accept `kind` and subject it to the burst window.
    pub fn sensitive(mut self, kind: &str) -> Self {
        self.message_types.insert(kind.to_string());
        self.sensitive_types.insert(kind.to_string());
        self
    }

    pub fn multiplier(mut self, multiplier: f64) -> Self {
        self.tier_multiplier = multiplier;
        self
    }

    pub fn accepts(&self, kind: &str) -> bool {
        self.message_types.contains(kind)
    }

    pub fn is_sensitive(&self, kind: &str) -> bool {
        self.sensitive_types.contains(kind)
    }
}

/// Read-only table of namespaces, built once at startup.
#[derive(Debug, Clone)]
pub struct NamespaceRegistry {
    policies: HashMap<String, NamespacePolicy>,
}

impl NamespaceRegistry {
    pub fn new(policies: impl IntoIterator<Item = NamespacePolicy>) -> Self {
        Self {
            policies: policies
                .into_iter()
                .map(|p| (p.name.clone(), p))
                .collect(),
        }
    }

    /// The namespaces this gateway ships with.
    pub fn builtin() -> Self {
        Self::new([
            NamespacePolicy::new("tracking", "tracking").sensitive("tracking.update"),
            NamespacePolicy::new("notifications", "user").message("notification.ack"),
            NamespacePolicy::new("collaboration", "room")
                .sensitive("room.message")
                .message("room.typing"),
            NamespacePolicy::new("prices", "commodity")
                .anonymous()
                .multiplier(0.5),
            NamespacePolicy::new("admin-activity", "activity")
                .min_role(Role::Admin)
                .sensitive("activity.report")
                .multiplier(2.0),
        ])
    }

    pub fn get(&self, name: &str) -> Option<&NamespacePolicy> {
        self.policies.get(name)
    }

    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.policies.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    pub fn iter(&self) -> impl Iterator<Item = &NamespacePolicy> {
        self.policies.values()
    }

    /// Resolve `"{namespace}/{message_type}"` (leading slash optional) to the
    /// namespace policy and the remainder of the path.
    pub fn resolve_path<'a>(&self, path: &'a str) -> Option<(&NamespacePolicy, &'a str)> {
        let trimmed = path.trim_start_matches('/');
        let (ns, rest) = trimmed.split_once('/').unwrap_or((trimmed, ""));
        self.get(ns).map(|policy| (policy, rest))
    }
}
