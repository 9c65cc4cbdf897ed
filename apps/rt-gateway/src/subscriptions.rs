//! Subscription registry: `feature:resource` → live connections, with a
//! reverse index so teardown only touches the closing connection's entries.

use std::collections::HashSet;
use std::fmt;

use dashmap::DashMap;

use crate::gateway::connection::ConnectionId;

/// A subscription target, e.g. `tracking:SHIP123`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SubscriptionKey {
    pub feature: String,
    pub resource_id: String,
}

impl SubscriptionKey {
    pub fn new(feature: impl Into<String>, resource_id: impl Into<String>) -> Self {
        Self {
            feature: feature.into(),
            resource_id: resource_id.into(),
        }
    }
}

impl fmt::Display for SubscriptionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.feature, self.resource_id)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SubscriptionError {
    #[error("connection is not registered or already closed")]
    ConnectionClosed,
}

/// Shared registry of subscriptions.
///
/// Lock order is always reverse index first, then member sets. `join` holds
/// the connection's reverse-index entry while it inserts, so it cannot
/// interleave with that connection's teardown.
pub struct SubscriptionRegistry {
    members: DashMap<SubscriptionKey, HashSet<ConnectionId>>,
    by_connection: DashMap<ConnectionId, HashSet<SubscriptionKey>>,
}

impl SubscriptionRegistry {
    pub fn new() -> Self {
        Self {
            members: DashMap::new(),
            by_connection: DashMap::new(),
        }
    }

    /// Start tracking a connection. Joins are refused for unregistered ids.
    pub fn register_connection(&self, conn: &ConnectionId) {
        self.by_connection.entry(conn.clone()).or_default();
    }

    /// Add `conn` to `feature:resource_id`. Returns false if it was already a
    /// member.
    pub fn join(
        &self,
        feature: &str,
        resource_id: &str,
        conn: &ConnectionId,
    ) -> Result<bool, SubscriptionError> {
        let mut joined = self
            .by_connection
            .get_mut(conn)
            .ok_or(SubscriptionError::ConnectionClosed)?;

        let key = SubscriptionKey::new(feature, resource_id);
        if !joined.insert(key.clone()) {
            return Ok(false);
        }
        self.members.entry(key).or_default().insert(conn.clone());
        Ok(true)
    }

    /// Remove `conn` from `feature:resource_id`. Returns false if it was not a
    /// member.
    pub fn leave(&self, feature: &str, resource_id: &str, conn: &ConnectionId) -> bool {
        let key = SubscriptionKey::new(feature, resource_id);
        let was_member = match self.by_connection.get_mut(conn) {
            Some(mut joined) => joined.remove(&key),
            None => false,
        };
        if was_member {
            self.remove_member(&key, conn);
        }
        was_member
    }

    /// Drop every subscription held by `conn`. Safe to call more than once;
    /// later calls return 0.
    pub fn on_connection_closed(&self, conn: &ConnectionId) -> usize {
        let Some((_, keys)) = self.by_connection.remove(conn) else {
            return 0;
        };
        for key in &keys {
            self.remove_member(key, conn);
        }
        keys.len()
    }

    fn remove_member(&self, key: &SubscriptionKey, conn: &ConnectionId) {
        // remove_if re-checks emptiness under the shard lock, so a concurrent
        // join that lands between the two steps is not lost.
        if let Some(mut set) = self.members.get_mut(key) {
            set.remove(conn);
        }
        self.members.remove_if(key, |_, set| set.is_empty());
    }

    pub fn members_of(&self, feature: &str, resource_id: &str) -> HashSet<ConnectionId> {
        self.members
            .get(&SubscriptionKey::new(feature, resource_id))
            .map(|set| set.value().clone())
            .unwrap_or_default()
    }

    pub fn is_member(&self, feature: &str, resource_id: &str, conn: &ConnectionId) -> bool {
        self.members
            .get(&SubscriptionKey::new(feature, resource_id))
            .is_some_and(|set| set.contains(conn))
    }

    /// Number of resources with at least one subscriber under `feature`.
    pub fn resource_count(&self, feature: &str) -> usize {
        self.members
            .iter()
            .filter(|entry| entry.key().feature == feature)
            .count()
    }

    pub fn has_resource(&self, feature: &str, resource_id: &str) -> bool {
        self.members
            .contains_key(&SubscriptionKey::new(feature, resource_id))
    }

    /// Total (connection, key) pairs.
    pub fn subscription_count(&self) -> usize {
        self.by_connection.iter().map(|entry| entry.value().len()).sum()
    }

    pub fn tracked_connections(&self) -> usize {
        self.by_connection.len()
    }

    /// True if `conn` appears anywhere in the registry.
    pub fn references(&self, conn: &ConnectionId) -> bool {
        self.by_connection.contains_key(conn)
            || self.members.iter().any(|entry| entry.value().contains(conn))
    }
}

impl Default for SubscriptionRegistry {
    fn default() -> Self {
        Self::new()
    }
}
