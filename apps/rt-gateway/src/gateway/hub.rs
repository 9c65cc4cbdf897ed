//! The Gateway: admits connections, routes their messages and fans out
//! events to subscribers.

use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::Utf8Bytes;
use dashmap::DashMap;
use futures_util::FutureExt;
use serde::Serialize;
use tokio::sync::mpsc;
use utoipa::ToSchema;

use crate::auth::authenticator::Authenticator;
use crate::config::GatewayConfig;
use crate::error::GatewayError;
use crate::metrics::counters::GatewayCounters;
use crate::namespace::NamespaceRegistry;
use crate::rate_limit::{LimitReason, RateLimiter};
use crate::subscriptions::SubscriptionRegistry;

use super::connection::{CloseReason, Connection, ConnectionId, SendFailure};
use super::events::{ClientEnvelope, ClientMessage, ServerMessage};
use super::handler::{HandlerContext, HandlerRegistry, MessageHandler};

/// Consecutive malformed frames that mark a connection as suspicious.
const MALFORMED_STREAK_LIMIT: u32 = 5;

/// Outcome of a fan-out.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, ToSchema)]
pub struct DeliveryReport {
    pub delivered: usize,
    pub failed: usize,
}

/// A connection that passed authentication but has not been attached yet.
pub struct Admission {
    pub connection: Arc<Connection>,
    pub outbound: mpsc::Receiver<Utf8Bytes>,
}

pub struct Gateway {
    config: GatewayConfig,
    namespaces: Arc<NamespaceRegistry>,
    authenticator: Arc<Authenticator>,
    limiter: Arc<RateLimiter>,
    subscriptions: Arc<SubscriptionRegistry>,
    counters: Arc<GatewayCounters>,
    handlers: HandlerRegistry,
    connections: DashMap<ConnectionId, Arc<Connection>>,
    shutting_down: AtomicBool,
}

impl Gateway {
    pub fn new(
        config: GatewayConfig,
        namespaces: Arc<NamespaceRegistry>,
        authenticator: Arc<Authenticator>,
        limiter: Arc<RateLimiter>,
        subscriptions: Arc<SubscriptionRegistry>,
        counters: Arc<GatewayCounters>,
    ) -> Self {
        let handlers = HandlerRegistry::builtin(&namespaces);
        Self {
            config,
            namespaces,
            authenticator,
            limiter,
            subscriptions,
            counters,
            handlers,
            connections: DashMap::new(),
            shutting_down: AtomicBool::new(false),
        }
    }

    /// Register or replace the handler for `kind` in `namespace`. Only types
    /// the namespace policy declares are ever dispatched.
    pub fn with_handler(
        mut self,
        namespace: &str,
        kind: &str,
        handler: impl MessageHandler + 'static,
    ) -> Self {
        self.handlers.insert(namespace, kind, Arc::new(handler));
        self
    }

    pub fn config(&self) -> &GatewayConfig {
        &self.config
    }

    pub fn namespaces(&self) -> &NamespaceRegistry {
        &self.namespaces
    }

    pub fn subscriptions(&self) -> &SubscriptionRegistry {
        &self.subscriptions
    }

    pub fn counters(&self) -> &GatewayCounters {
        &self.counters
    }

    pub fn connection(&self, id: &ConnectionId) -> Option<Arc<Connection>> {
        self.connections.get(id).map(|entry| Arc::clone(entry.value()))
    }

    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }

    pub fn is_shutting_down(&self) -> bool {
        self.shutting_down.load(Ordering::Acquire)
    }

    // -----------------------------------------------------------------------
    // Lifecycle
    // -----------------------------------------------------------------------

    /// Authenticate a connection attempt. On success the returned connection
    /// is still `PendingAuth` and not yet visible to anyone else.
    pub fn admit(
        &self,
        namespace: &str,
        token: Option<&str>,
        remote_addr: &str,
    ) -> Result<Admission, GatewayError> {
        match self.authenticator.authenticate(namespace, token) {
            Ok(principal) => {
                let (connection, outbound) = Connection::new(
                    principal,
                    namespace,
                    remote_addr,
                    self.config.outbound_capacity,
                );
                Ok(Admission {
                    connection: Arc::new(connection),
                    outbound,
                })
            }
            Err(rejection) => {
                self.counters.auth_failure(namespace);
                tracing::warn!(
                    %namespace,
                    remote_addr,
                    reason = %rejection,
                    "connection rejected"
                );
                Err(GatewayError::AuthRejected(rejection))
            }
        }
    }

    /// Make an admitted connection live: `PendingAuth → Open`, then visible
    /// to the connection table and the subscription registry. Refused while
    /// shutting down.
    pub fn attach(&self, connection: &Arc<Connection>) -> bool {
        if self.is_shutting_down() {
            connection.reject();
            return false;
        }
        if !connection.open() {
            return false;
        }
        self.subscriptions.register_connection(&connection.id);
        self.connections
            .insert(connection.id.clone(), Arc::clone(connection));
        self.counters.connection_opened(&connection.namespace);

        tracing::info!(
            conn_id = %connection.id,
            namespace = %connection.namespace,
            user_id = connection.principal.user_id.as_deref().unwrap_or("anonymous"),
            role = %connection.principal.role,
            "connection opened"
        );

        // Shutdown may have started after the check above.
        if self.is_shutting_down() {
            connection.request_close(CloseReason::ServerShutdown);
        }
        true
    }

    /// Ask a connection to close. False if it is unknown or already closing.
    pub fn close(&self, id: &ConnectionId, reason: CloseReason) -> bool {
        self.connection(id)
            .is_some_and(|connection| connection.request_close(reason))
    }

    /// Release everything held for `connection`. Only the first call does
    /// any work; subscriptions are dropped before the record leaves the
    /// table.
    pub fn teardown(&self, connection: &Connection) -> bool {
        if !connection.finish() {
            return false;
        }
        let dropped = self.subscriptions.on_connection_closed(&connection.id);
        self.connections.remove(&connection.id);
        self.counters.connection_closed(&connection.namespace);

        tracing::info!(
            conn_id = %connection.id,
            namespace = %connection.namespace,
            reason = connection.close_reason().map(|r| r.as_str()).unwrap_or("connection lost"),
            subscriptions = dropped,
            "connection closed"
        );
        true
    }

    /// Refuse new connections, ask every open one to close and wait for
    /// their tasks to tear down, bounded by the force-close timeout.
    pub async fn shutdown(&self) {
        self.shutting_down.store(true, Ordering::Release);
        let open: Vec<Arc<Connection>> = self
            .connections
            .iter()
            .map(|entry| Arc::clone(entry.value()))
            .collect();
        tracing::info!(connections = open.len(), "gateway shutting down");

        for connection in &open {
            connection.request_close(CloseReason::ServerShutdown);
        }

        let deadline = tokio::time::Instant::now() + self.config.force_close_timeout;
        while !self.connections.is_empty() && tokio::time::Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }

        // Whatever did not finish in time is released here.
        for connection in &open {
            self.teardown(connection);
        }
    }

    /// Close connections with no inbound message for longer than the idle
    /// timeout. Returns how many were asked to close.
    pub fn reap_idle(&self, now_ms: i64) -> usize {
        let idle_ms = self.config.idle_timeout.as_millis() as i64;
        let idle: Vec<Arc<Connection>> = self
            .connections
            .iter()
            .filter(|entry| now_ms - entry.value().last_activity() > idle_ms)
            .map(|entry| Arc::clone(entry.value()))
            .collect();

        idle.iter()
            .filter(|connection| {
                let closed = connection.request_close(CloseReason::IdleTimeout);
                if closed {
                    tracing::debug!(conn_id = %connection.id, "closing idle connection");
                }
                closed
            })
            .count()
    }

    pub fn spawn_reaper(self: &Arc<Self>) -> tokio::task::JoinHandle<()> {
        let gateway = Arc::clone(self);
        let every = (self.config.idle_timeout / 4).max(Duration::from_secs(1));
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(every);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let reaped = gateway.reap_idle(chrono::Utc::now().timestamp_millis());
                if reaped > 0 {
                    tracing::info!(reaped, "reaped idle connections");
                }
            }
        })
    }

    // -----------------------------------------------------------------------
    // Inbound
    // -----------------------------------------------------------------------

    /// Process one inbound text frame and return the frame to send back, if
    /// any. Never fails: every error becomes an error frame.
    pub async fn handle_text(&self, connection: &Arc<Connection>, text: &str) -> Option<String> {
        connection.touch();
        self.counters.message_received(&connection.namespace);

        match self.process(connection, text).await {
            Ok(reply) => reply.map(|message| message.to_json()),
            Err(err) => Some(self.reject_message(connection, err)),
        }
    }

    /// Binary frames are not part of the protocol.
    pub fn handle_binary(&self, connection: &Arc<Connection>) -> String {
        connection.touch();
        self.counters.message_received(&connection.namespace);
        self.note_malformed(connection);
        self.reject_message(
            connection,
            GatewayError::Malformed("binary frames are not supported".to_string()),
        )
    }

    async fn process(
        &self,
        connection: &Arc<Connection>,
        text: &str,
    ) -> Result<Option<ServerMessage>, GatewayError> {
        if text.len() > self.config.max_message_bytes {
            self.flag_suspicious(connection, "oversized message");
            return Err(GatewayError::TooLarge(text.len()));
        }

        let envelope: ClientEnvelope = match serde_json::from_str(text) {
            Ok(envelope) => {
                connection.reset_malformed();
                envelope
            }
            Err(e) => {
                self.note_malformed(connection);
                return Err(GatewayError::Malformed(e.to_string()));
            }
        };

        let key = connection.principal.limit_key(&connection.remote_addr);
        let path = format!("{}/{}", connection.namespace, envelope.kind);
        let decision = self
            .limiter
            .check(&key, &path, connection.principal.role)
            .await;
        if !decision.allowed {
            let burst = decision.reason == Some(LimitReason::Burst);
            self.counters.rate_limited(burst);
            if burst {
                self.flag_suspicious(connection, "burst limit exceeded");
            }
            return Err(GatewayError::RateLimited {
                retry_after: decision.retry_after.unwrap_or(1),
                burst,
            });
        }

        let policy = self
            .namespaces
            .get(&connection.namespace)
            .filter(|policy| policy.accepts(&envelope.kind))
            .ok_or_else(|| GatewayError::UnknownType(envelope.kind.clone()))?;
        let handler = self
            .handlers
            .get(&connection.namespace, &envelope.kind)
            .ok_or_else(|| GatewayError::UnknownType(envelope.kind.clone()))?;

        let message = ClientMessage::parse(&envelope.kind, envelope.payload)
            .map_err(|e| GatewayError::InvalidPayload(e.to_string()))?;

        let ctx = HandlerContext {
            connection,
            policy,
            gateway: self,
        };
        match AssertUnwindSafe(handler.handle(&ctx, message))
            .catch_unwind()
            .await
        {
            Ok(result) => result.map_err(GatewayError::Handler),
            Err(_) => {
                tracing::error!(
                    conn_id = %connection.id,
                    namespace = %connection.namespace,
                    kind = %envelope.kind,
                    "message handler panicked"
                );
                Err(GatewayError::HandlerPanicked)
            }
        }
    }

    fn reject_message(&self, connection: &Connection, err: GatewayError) -> String {
        self.counters.error(&connection.namespace);
        tracing::debug!(
            conn_id = %connection.id,
            namespace = %connection.namespace,
            code = ?err.code(),
            %err,
            "message rejected"
        );
        err.to_wire().to_json()
    }

    fn note_malformed(&self, connection: &Connection) {
        if connection.record_malformed() >= MALFORMED_STREAK_LIMIT {
            connection.reset_malformed();
            self.flag_suspicious(connection, "repeated malformed messages");
        }
    }

    fn flag_suspicious(&self, connection: &Connection, reason: &str) {
        self.counters.suspicious();
        tracing::warn!(
            conn_id = %connection.id,
            namespace = %connection.namespace,
            remote_addr = %connection.remote_addr,
            user_id = connection.principal.user_id.as_deref().unwrap_or("anonymous"),
            reason,
            "suspicious activity"
        );
    }

    // -----------------------------------------------------------------------
    // Outbound
    // -----------------------------------------------------------------------

    /// Send `message` to every subscriber of `feature:resource_id`.
    pub fn publish(&self, feature: &str, resource_id: &str, message: &ServerMessage) -> DeliveryReport {
        self.publish_except(feature, resource_id, message, None)
    }

    /// As [`publish`](Self::publish), skipping `except`.
    pub fn publish_except(
        &self,
        feature: &str,
        resource_id: &str,
        message: &ServerMessage,
        except: Option<&ConnectionId>,
    ) -> DeliveryReport {
        let members = self.subscriptions.members_of(feature, resource_id);
        let frame = Utf8Bytes::from(message.to_json());
        let report = self.deliver(
            members.iter().filter(|id| Some(*id) != except),
            &frame,
        );
        tracing::debug!(
            %feature,
            %resource_id,
            kind = %message.kind,
            delivered = report.delivered,
            failed = report.failed,
            "published"
        );
        report
    }

    /// Send `message` to every open connection in `namespace`.
    pub fn broadcast(&self, namespace: &str, message: &ServerMessage) -> DeliveryReport {
        let targets: Vec<ConnectionId> = self
            .connections
            .iter()
            .filter(|entry| entry.value().namespace == namespace)
            .map(|entry| entry.key().clone())
            .collect();
        let frame = Utf8Bytes::from(message.to_json());
        self.deliver(targets.iter(), &frame)
    }

    fn deliver<'a>(
        &self,
        targets: impl Iterator<Item = &'a ConnectionId>,
        frame: &Utf8Bytes,
    ) -> DeliveryReport {
        let mut report = DeliveryReport::default();
        for id in targets {
            let Some(connection) = self.connection(id) else {
                report.failed += 1;
                continue;
            };
            match connection.try_send(frame.clone()) {
                Ok(()) => report.delivered += 1,
                Err(SendFailure::QueueFull) => {
                    report.failed += 1;
                    tracing::warn!(conn_id = %id, "outbound queue full, closing slow consumer");
                    connection.request_close(CloseReason::Internal);
                }
                Err(SendFailure::Disconnected) => report.failed += 1,
            }
        }
        self.counters
            .delivered(report.delivered as u64, report.failed as u64);
        report
    }
}
