//! Wire-format messages exchanged over a gateway connection.
//!
//! Both directions use the envelope `{ "type": string, "payload": object }`.

use serde::{Deserialize, Serialize};
use serde_json::Value;

// ---------------------------------------------------------------------------
// Client → Server
// ---------------------------------------------------------------------------

/// Untyped inbound envelope. Parsed first so the type can be rate limited and
/// routed before its payload is validated.
#[derive(Debug, Deserialize)]
pub struct ClientEnvelope {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub payload: Value,
}

/// Message types with a typed payload.
pub const TYPED_MESSAGES: &[&str] = &[
    "ping",
    "subscribe",
    "unsubscribe",
    "tracking.update",
    "room.message",
    "room.typing",
    "notification.ack",
    "activity.report",
];

/// A validated inbound message.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "type", content = "payload")]
pub enum ClientMessage {
    #[serde(rename = "ping")]
    Ping(PingPayload),
    #[serde(rename = "subscribe")]
    Subscribe(ResourcePayload),
    #[serde(rename = "unsubscribe")]
    Unsubscribe(ResourcePayload),
    #[serde(rename = "tracking.update")]
    TrackingUpdate(TrackingUpdatePayload),
    #[serde(rename = "room.message")]
    RoomMessage(RoomMessagePayload),
    #[serde(rename = "room.typing")]
    RoomTyping(RoomTypingPayload),
    #[serde(rename = "notification.ack")]
    NotificationAck(NotificationAckPayload),
    #[serde(rename = "activity.report")]
    ActivityReport(ActivityReportPayload),
    /// A type registered at runtime; its handler owns validation.
    #[serde(skip_deserializing)]
    Other { kind: String, payload: Value },
}

impl ClientMessage {
    /// Validate `payload` against the schema for `kind`. A missing payload is
    /// treated as `{}`.
    pub fn parse(kind: &str, payload: Value) -> Result<Self, serde_json::Error> {
        let payload = match payload {
            Value::Null => Value::Object(Default::default()),
            other => other,
        };
        if !TYPED_MESSAGES.contains(&kind) {
            return Ok(ClientMessage::Other {
                kind: kind.to_string(),
                payload,
            });
        }
        serde_json::from_value(serde_json::json!({ "type": kind, "payload": payload }))
    }
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct PingPayload {
    /// Echoed back in the pong.
    #[serde(default)]
    pub nonce: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct ResourcePayload {
    pub resource_id: String,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct TrackingUpdatePayload {
    pub shipment_id: String,
    pub status: String,
    #[serde(default)]
    pub location: Option<Value>,
    #[serde(default)]
    pub eta: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct RoomMessagePayload {
    pub room_id: String,
    pub body: String,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct RoomTypingPayload {
    pub room_id: String,
    #[serde(default = "default_typing")]
    pub typing: bool,
}

fn default_typing() -> bool {
    true
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct NotificationAckPayload {
    pub notification_id: String,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct ActivityReportPayload {
    pub action: String,
    #[serde(default)]
    pub details: Value,
}

// ---------------------------------------------------------------------------
// Server → Client
// ---------------------------------------------------------------------------

/// An outbound message.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ServerMessage {
    #[serde(rename = "type")]
    pub kind: String,
    pub payload: Value,
}

impl ServerMessage {
    pub fn new(kind: impl Into<String>, payload: Value) -> Self {
        Self {
            kind: kind.into(),
            payload,
        }
    }

    pub fn pong(nonce: Option<String>) -> Self {
        Self::new(
            "pong",
            serde_json::json!({ "nonce": nonce, "timestamp": now_millis() }),
        )
    }

    pub fn to_json(&self) -> String {
        // Value and String fields cannot fail to serialize.
        serde_json::to_string(self).unwrap_or_default()
    }
}

/// Error codes carried by [`ErrorMessage`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    MessageTooLarge,
    MalformedMessage,
    RateLimited,
    BurstLimited,
    UnknownMessageType,
    InvalidPayload,
    Unauthorized,
    Forbidden,
    NotFound,
    HandlerFailure,
}

/// `{ "type": "error", "code", "message", "timestamp", "retryAfter"? }`
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorMessage {
    #[serde(rename = "type")]
    pub kind: &'static str,
    pub code: ErrorCode,
    pub message: String,
    /// RFC 3339.
    pub timestamp: chrono::DateTime<chrono::Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retry_after: Option<u64>,
}

impl ErrorMessage {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            kind: "error",
            code,
            message: message.into(),
            timestamp: chrono::Utc::now(),
            retry_after: None,
        }
    }

    pub fn with_retry_after(mut self, retry_after: Option<u64>) -> Self {
        self.retry_after = retry_after;
        self
    }

    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_default()
    }
}

pub(crate) fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn envelope_defaults_missing_payload() {
        let env: ClientEnvelope = serde_json::from_str(r#"{"type":"ping"}"#).unwrap();
        assert_eq!(env.kind, "ping");
        assert_eq!(
            ClientMessage::parse(&env.kind, env.payload).unwrap(),
            ClientMessage::Ping(PingPayload::default())
        );
    }

    #[test]
    fn envelope_requires_type() {
        assert!(serde_json::from_str::<ClientEnvelope>(r#"{"payload":{}}"#).is_err());
        assert!(serde_json::from_str::<ClientEnvelope>("not json").is_err());
    }

    #[test]
    fn typed_payloads_are_validated() {
        let msg = ClientMessage::parse("subscribe", json!({ "resource_id": "SHIP1" })).unwrap();
        assert_eq!(
            msg,
            ClientMessage::Subscribe(ResourcePayload {
                resource_id: "SHIP1".into()
            })
        );
        assert!(ClientMessage::parse("subscribe", json!({})).is_err());
        assert!(ClientMessage::parse("room.message", json!({ "room_id": 7 })).is_err());
    }

    #[test]
    fn typing_defaults_to_true() {
        let msg = ClientMessage::parse("room.typing", json!({ "room_id": "r1" })).unwrap();
        assert_eq!(
            msg,
            ClientMessage::RoomTyping(RoomTypingPayload {
                room_id: "r1".into(),
                typing: true
            })
        );
    }

    #[test]
    fn unknown_types_pass_through_untyped() {
        let msg = ClientMessage::parse("custom.thing", json!({ "x": 1 })).unwrap();
        assert_eq!(
            msg,
            ClientMessage::Other {
                kind: "custom.thing".into(),
                payload: json!({ "x": 1 })
            }
        );
    }

    #[test]
    fn error_message_shape() {
        let err = ErrorMessage::new(ErrorCode::RateLimited, "Rate limit exceeded")
            .with_retry_after(Some(30));
        let value: Value = serde_json::from_str(&err.to_json()).unwrap();
        assert_eq!(value["type"], "error");
        assert_eq!(value["code"], "RATE_LIMITED");
        assert_eq!(value["retryAfter"], 30);
        let stamp = value["timestamp"].as_str().unwrap();
        assert!(chrono::DateTime::parse_from_rfc3339(stamp).is_ok());

        let plain: Value =
            serde_json::from_str(&ErrorMessage::new(ErrorCode::NotFound, "x").to_json()).unwrap();
        assert!(plain.get("retryAfter").is_none());
    }
}
