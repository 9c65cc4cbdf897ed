//! Message handler trait and the `(namespace, type) → handler` table.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;

use crate::namespace::{NamespacePolicy, NamespaceRegistry};

use super::connection::Connection;
use super::events::{ClientMessage, ServerMessage};
use super::features;
use super::hub::Gateway;

/// Failure reported by a handler. The hub turns it into an error frame and
/// keeps the connection open.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum HandlerError {
    #[error("forbidden: {0}")]
    Forbidden(String),
    #[error("invalid payload: {0}")]
    Invalid(String),
    #[error("not found: {0}")]
    NotFound(String),
    #[error("handler failure: {0}")]
    Internal(String),
}

pub type HandlerResult = Result<Option<ServerMessage>, HandlerError>;

/// Everything a handler may touch while processing one message.
pub struct HandlerContext<'a> {
    pub connection: &'a Arc<Connection>,
    pub policy: &'a NamespacePolicy,
    pub gateway: &'a Gateway,
}

#[async_trait]
pub trait MessageHandler: Send + Sync {
    /// Handle one validated message. `Ok(Some(_))` is sent back to the
    /// sender; `Ok(None)` sends nothing.
    async fn handle(&self, ctx: &HandlerContext<'_>, message: ClientMessage) -> HandlerResult;
}

#[derive(Default)]
pub struct HandlerRegistry {
    handlers: HashMap<(String, String), Arc<dyn MessageHandler>>,
}

impl HandlerRegistry {
    /// Built-in handlers for every type each namespace accepts.
    pub fn builtin(namespaces: &NamespaceRegistry) -> Self {
        let mut registry = Self::default();
        for policy in namespaces.iter() {
            for kind in &policy.message_types {
                if let Some(handler) = features::builtin_handler(kind) {
                    registry.insert(&policy.name, kind, handler);
                }
            }
        }
        registry
    }

    pub fn insert(&mut self, namespace: &str, kind: &str, handler: Arc<dyn MessageHandler>) {
        self.handlers
            .insert((namespace.to_string(), kind.to_string()), handler);
    }

    pub fn get(&self, namespace: &str, kind: &str) -> Option<Arc<dyn MessageHandler>> {
        self.handlers
            .get(&(namespace.to_string(), kind.to_string()))
            .cloned()
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builtin_covers_every_declared_type() {
        let namespaces = NamespaceRegistry::builtin();
        let registry = HandlerRegistry::builtin(&namespaces);
        for policy in namespaces.iter() {
            for kind in &policy.message_types {
                assert!(
                    registry.get(&policy.name, kind).is_some(),
                    "{}/{} has no handler",
                    policy.name,
                    kind
                );
            }
        }
        let declared: usize = namespaces.iter().map(|p| p.message_types.len()).sum();
        assert_eq!(registry.len(), declared);
    }

    #[test]
    fn types_are_scoped_to_their_namespace() {
        let registry = HandlerRegistry::builtin(&NamespaceRegistry::builtin());
        assert!(registry.get("collaboration", "room.message").is_some());
        assert!(registry.get("prices", "room.message").is_none());
        assert!(registry.get("tracking", "nope").is_none());
    }
}
