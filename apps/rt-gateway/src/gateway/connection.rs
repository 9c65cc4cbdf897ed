//! Per-connection record and its state machine.

use std::fmt;
use std::sync::atomic::{AtomicI64, AtomicU32, AtomicU8, Ordering};

use axum::extract::ws::Utf8Bytes;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rt_common::id::{prefix, prefixed_ulid};
use serde::Serialize;
use tokio::sync::{mpsc, Notify};

use crate::auth::principal::Principal;

/// Connection identifier (`conn_` prefixed ULID).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(transparent)]
pub struct ConnectionId(String);

impl ConnectionId {
    pub fn generate() -> Self {
        Self(prefixed_ulid(prefix::CONNECTION))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<String> for ConnectionId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Lifecycle of a connection. Transitions only move forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ConnState {
    PendingAuth = 0,
    Open = 1,
    Closing = 2,
    Closed = 3,
}

impl ConnState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => ConnState::PendingAuth,
            1 => ConnState::Open,
            2 => ConnState::Closing,
            _ => ConnState::Closed,
        }
    }
}

/// Why a connection is being closed, mapped to a WebSocket close code.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    /// Client went away or asked to close.
    Normal,
    ServerShutdown,
    IdleTimeout,
    HeartbeatTimeout,
    /// Outbound queue overflowed or the socket failed.
    Internal,
}

impl CloseReason {
    pub fn code(&self) -> u16 {
        match self {
            CloseReason::Normal => 1000,
            CloseReason::ServerShutdown => 1001,
            CloseReason::Internal => 4000,
            CloseReason::IdleTimeout => 4008,
            CloseReason::HeartbeatTimeout => 4009,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            CloseReason::Normal => "Normal closure",
            CloseReason::ServerShutdown => "Server shutting down",
            CloseReason::Internal => "Internal error",
            CloseReason::IdleTimeout => "Idle timeout",
            CloseReason::HeartbeatTimeout => "Heartbeat timeout",
        }
    }
}

/// Why a frame could not be queued.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendFailure {
    QueueFull,
    Disconnected,
}

/// A single client connection.
///
/// The namespace and principal are fixed at admission. Everything mutable is
/// atomic or behind a short `parking_lot` lock, so the record can be shared
/// between the connection task, the hub and the reaper.
pub struct Connection {
    pub id: ConnectionId,
    pub principal: Principal,
    pub namespace: String,
    pub remote_addr: String,
    pub opened_at: DateTime<Utc>,
    state: AtomicU8,
    last_activity: AtomicI64,
    malformed_streak: AtomicU32,
    outbound: mpsc::Sender<Utf8Bytes>,
    close_signal: Notify,
    close_reason: Mutex<Option<CloseReason>>,
}

impl Connection {
    /// Create a record in `PendingAuth` together with the receiving end of
    /// its outbound queue.
    pub fn new(
        principal: Principal,
        namespace: impl Into<String>,
        remote_addr: impl Into<String>,
        queue_capacity: usize,
    ) -> (Self, mpsc::Receiver<Utf8Bytes>) {
        let (tx, rx) = mpsc::channel(queue_capacity.max(1));
        let now = Utc::now();
        let connection = Self {
            id: ConnectionId::generate(),
            principal,
            namespace: namespace.into(),
            remote_addr: remote_addr.into(),
            opened_at: now,
            state: AtomicU8::new(ConnState::PendingAuth as u8),
            last_activity: AtomicI64::new(now.timestamp_millis()),
            malformed_streak: AtomicU32::new(0),
            outbound: tx,
            close_signal: Notify::new(),
            close_reason: Mutex::new(None),
        };
        (connection, rx)
    }

    pub fn state(&self) -> ConnState {
        ConnState::from_u8(self.state.load(Ordering::Acquire))
    }

    pub fn is_open(&self) -> bool {
        self.state() == ConnState::Open
    }

    fn transition(&self, from: ConnState, to: ConnState) -> bool {
        self.state
            .compare_exchange(from as u8, to as u8, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// `PendingAuth → Open`.
    pub fn open(&self) -> bool {
        self.transition(ConnState::PendingAuth, ConnState::Open)
    }

    /// `PendingAuth → Closed`, for connections refused before they opened.
    pub fn reject(&self) -> bool {
        self.transition(ConnState::PendingAuth, ConnState::Closed)
    }

    /// `Open → Closing`. Only the first caller wins; its reason is kept and
    /// the connection task is woken.
    pub fn request_close(&self, reason: CloseReason) -> bool {
        if !self.transition(ConnState::Open, ConnState::Closing) {
            return false;
        }
        *self.close_reason.lock() = Some(reason);
        self.close_signal.notify_one();
        true
    }

    /// Resolves once `request_close` has been called.
    pub async fn closed(&self) {
        self.close_signal.notified().await
    }

    pub fn close_reason(&self) -> Option<CloseReason> {
        *self.close_reason.lock()
    }

    /// Move to `Closed` from whatever state the connection is in. Returns
    /// true only for the caller that performed the transition; that caller
    /// owns teardown.
    pub fn finish(&self) -> bool {
        self.state.swap(ConnState::Closed as u8, Ordering::AcqRel) != ConnState::Closed as u8
    }

    pub fn touch(&self) {
        self.last_activity
            .store(Utc::now().timestamp_millis(), Ordering::Relaxed);
    }

    /// Epoch milliseconds of the last inbound message.
    pub fn last_activity(&self) -> i64 {
        self.last_activity.load(Ordering::Relaxed)
    }

    /// Bump the consecutive-malformed counter and return the new value.
    pub fn record_malformed(&self) -> u32 {
        self.malformed_streak.fetch_add(1, Ordering::Relaxed) + 1
    }

    pub fn reset_malformed(&self) {
        self.malformed_streak.store(0, Ordering::Relaxed);
    }

    /// Queue a frame without waiting.
    pub fn try_send(&self, frame: Utf8Bytes) -> Result<(), SendFailure> {
        if self.state() == ConnState::Closed {
            return Err(SendFailure::Disconnected);
        }
        self.outbound.try_send(frame).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => SendFailure::QueueFull,
            mpsc::error::TrySendError::Closed(_) => SendFailure::Disconnected,
        })
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("namespace", &self.namespace)
            .field("user_id", &self.principal.user_id)
            .field("state", &self.state())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::principal::Role;

    fn connection() -> (Connection, mpsc::Receiver<Utf8Bytes>) {
        Connection::new(Principal::user("usr_1", Role::Standard), "tracking", "127.0.0.1", 2)
    }

    #[test]
    fn ids_are_prefixed() {
        let id = ConnectionId::generate();
        assert!(rt_common::id::has_prefix(id.as_str(), prefix::CONNECTION));
    }

    #[test]
    fn state_moves_forward_only() {
        let (conn, _rx) = connection();
        assert_eq!(conn.state(), ConnState::PendingAuth);
        assert!(conn.open());
        assert!(!conn.open());
        assert!(!conn.reject());
        assert!(conn.request_close(CloseReason::IdleTimeout));
        assert_eq!(conn.state(), ConnState::Closing);
        assert!(conn.finish());
        assert_eq!(conn.state(), ConnState::Closed);
    }

    #[test]
    fn reject_skips_open() {
        let (conn, _rx) = connection();
        assert!(conn.reject());
        assert_eq!(conn.state(), ConnState::Closed);
        assert!(!conn.open());
    }

    #[test]
    fn first_close_request_wins() {
        let (conn, _rx) = connection();
        conn.open();
        assert!(conn.request_close(CloseReason::HeartbeatTimeout));
        assert!(!conn.request_close(CloseReason::ServerShutdown));
        assert_eq!(conn.close_reason(), Some(CloseReason::HeartbeatTimeout));
    }

    #[test]
    fn finish_is_won_once() {
        let (conn, _rx) = connection();
        conn.open();
        assert!(conn.finish());
        assert!(!conn.finish());
        assert!(!conn.request_close(CloseReason::Normal));
    }

    #[tokio::test]
    async fn close_signal_is_not_lost_before_waiting() {
        let (conn, _rx) = connection();
        conn.open();
        conn.request_close(CloseReason::ServerShutdown);
        tokio::time::timeout(std::time::Duration::from_secs(1), conn.closed())
            .await
            .expect("close notification should be stored");
    }

    #[test]
    fn try_send_reports_full_and_disconnected() {
        let (conn, rx) = connection();
        conn.open();
        assert!(conn.try_send(Utf8Bytes::from_static("a")).is_ok());
        assert!(conn.try_send(Utf8Bytes::from_static("b")).is_ok());
        assert_eq!(conn.try_send(Utf8Bytes::from_static("c")), Err(SendFailure::QueueFull));
        drop(rx);
        assert_eq!(conn.try_send(Utf8Bytes::from_static("d")), Err(SendFailure::Disconnected));
    }

    #[test]
    fn malformed_streak_counts_and_resets() {
        let (conn, _rx) = connection();
        assert_eq!(conn.record_malformed(), 1);
        assert_eq!(conn.record_malformed(), 2);
        conn.reset_malformed();
        assert_eq!(conn.record_malformed(), 1);
    }
}
