//! Built-in handlers for the message types the shipped namespaces accept.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::json;

use crate::auth::principal::Role;

use super::events::{now_millis, ClientMessage, ServerMessage};
use super::handler::{HandlerContext, HandlerError, HandlerResult, MessageHandler};

const MAX_RESOURCE_ID_LEN: usize = 128;
const MAX_ROOM_MESSAGE_LEN: usize = 4000;

/// Feature whose resources are user ids.
const USER_FEATURE: &str = "user";
/// Every `activity.report` fans out to this resource.
const ACTIVITY_RESOURCE: &str = "all";

pub fn builtin_handler(kind: &str) -> Option<Arc<dyn MessageHandler>> {
    let handler: Arc<dyn MessageHandler> = match kind {
        "ping" => Arc::new(PingHandler),
        "subscribe" => Arc::new(SubscriptionHandler { join: true }),
        "unsubscribe" => Arc::new(SubscriptionHandler { join: false }),
        "tracking.update" => Arc::new(TrackingUpdateHandler),
        "room.message" => Arc::new(RoomMessageHandler),
        "room.typing" => Arc::new(RoomTypingHandler),
        "notification.ack" => Arc::new(NotificationAckHandler),
        "activity.report" => Arc::new(ActivityReportHandler),
        _ => return None,
    };
    Some(handler)
}

fn unexpected(message: &ClientMessage) -> HandlerError {
    HandlerError::Invalid(format!("unexpected message {message:?}"))
}

fn validate_resource_id(resource_id: &str) -> Result<(), HandlerError> {
    let len = resource_id.chars().count();
    if len == 0 || len > MAX_RESOURCE_ID_LEN {
        return Err(HandlerError::Invalid(format!(
            "resource_id must be 1-{MAX_RESOURCE_ID_LEN} characters"
        )));
    }
    Ok(())
}

fn sender_id(ctx: &HandlerContext<'_>) -> Option<String> {
    ctx.connection.principal.user_id.clone()
}

pub struct PingHandler;

#[async_trait]
impl MessageHandler for PingHandler {
    async fn handle(&self, _ctx: &HandlerContext<'_>, message: ClientMessage) -> HandlerResult {
        match message {
            ClientMessage::Ping(payload) => Ok(Some(ServerMessage::pong(payload.nonce))),
            other => Err(unexpected(&other)),
        }
    }
}

/// `subscribe` / `unsubscribe` on the namespace's feature.
pub struct SubscriptionHandler {
    join: bool,
}

#[async_trait]
impl MessageHandler for SubscriptionHandler {
    async fn handle(&self, ctx: &HandlerContext<'_>, message: ClientMessage) -> HandlerResult {
        let resource_id = match message {
            ClientMessage::Subscribe(p) | ClientMessage::Unsubscribe(p) => p.resource_id,
            other => return Err(unexpected(&other)),
        };
        validate_resource_id(&resource_id)?;

        let feature = ctx.policy.feature.as_str();
        let principal = &ctx.connection.principal;
        if feature == USER_FEATURE
            && principal.user_id.as_deref() != Some(resource_id.as_str())
            && !principal.at_least(Role::Moderator)
        {
            return Err(HandlerError::Forbidden(
                "Cannot subscribe to another user's notifications".to_string(),
            ));
        }

        let subscriptions = ctx.gateway.subscriptions();
        let conn_id = &ctx.connection.id;
        if self.join {
            let added = subscriptions
                .join(feature, &resource_id, conn_id)
                .map_err(|e| HandlerError::Internal(e.to_string()))?;
            tracing::debug!(conn_id = %conn_id, %feature, %resource_id, added, "subscribed");
            Ok(Some(ServerMessage::new(
                "subscribed",
                json!({ "feature": feature, "resource_id": resource_id }),
            )))
        } else {
            let removed = subscriptions.leave(feature, &resource_id, conn_id);
            tracing::debug!(conn_id = %conn_id, %feature, %resource_id, removed, "unsubscribed");
            Ok(Some(ServerMessage::new(
                "unsubscribed",
                json!({ "feature": feature, "resource_id": resource_id, "was_subscribed": removed }),
            )))
        }
    }
}

pub struct TrackingUpdateHandler;

#[async_trait]
impl MessageHandler for TrackingUpdateHandler {
    async fn handle(&self, ctx: &HandlerContext<'_>, message: ClientMessage) -> HandlerResult {
        let update = match message {
            ClientMessage::TrackingUpdate(payload) => payload,
            other => return Err(unexpected(&other)),
        };
        if !ctx.connection.principal.at_least(Role::Moderator) {
            return Err(HandlerError::Forbidden(
                "Tracking updates require an operator role".to_string(),
            ));
        }
        validate_resource_id(&update.shipment_id)?;

        let event = ServerMessage::new(
            "tracking.updated",
            json!({
                "shipment_id": update.shipment_id,
                "status": update.status,
                "location": update.location,
                "eta": update.eta,
                "updated_by": sender_id(ctx),
                "timestamp": now_millis(),
            }),
        );
        let report = ctx
            .gateway
            .publish(&ctx.policy.feature, &update.shipment_id, &event);

        Ok(Some(ServerMessage::new(
            "tracking.update.ack",
            json!({ "shipment_id": update.shipment_id, "delivered": report.delivered }),
        )))
    }
}

pub struct RoomMessageHandler;

#[async_trait]
impl MessageHandler for RoomMessageHandler {
    async fn handle(&self, ctx: &HandlerContext<'_>, message: ClientMessage) -> HandlerResult {
        let msg = match message {
            ClientMessage::RoomMessage(payload) => payload,
            other => return Err(unexpected(&other)),
        };
        let feature = ctx.policy.feature.as_str();
        if !ctx
            .gateway
            .subscriptions()
            .is_member(feature, &msg.room_id, &ctx.connection.id)
        {
            return Err(HandlerError::Forbidden(
                "Join the room before posting".to_string(),
            ));
        }
        let len = msg.body.chars().count();
        if len == 0 || len > MAX_ROOM_MESSAGE_LEN {
            return Err(HandlerError::Invalid(format!(
                "body must be 1-{MAX_ROOM_MESSAGE_LEN} characters"
            )));
        }

        let event = ServerMessage::new(
            "room.message",
            json!({
                "room_id": msg.room_id,
                "body": msg.body,
                "sender": sender_id(ctx),
                "timestamp": now_millis(),
            }),
        );
        let report =
            ctx.gateway
                .publish_except(feature, &msg.room_id, &event, Some(&ctx.connection.id));

        Ok(Some(ServerMessage::new(
            "room.message.sent",
            json!({ "room_id": msg.room_id, "delivered": report.delivered }),
        )))
    }
}

pub struct RoomTypingHandler;

#[async_trait]
impl MessageHandler for RoomTypingHandler {
    async fn handle(&self, ctx: &HandlerContext<'_>, message: ClientMessage) -> HandlerResult {
        let typing = match message {
            ClientMessage::RoomTyping(payload) => payload,
            other => return Err(unexpected(&other)),
        };
        let feature = ctx.policy.feature.as_str();
        if !ctx
            .gateway
            .subscriptions()
            .is_member(feature, &typing.room_id, &ctx.connection.id)
        {
            return Err(HandlerError::Forbidden("Not a member of this room".to_string()));
        }

        let event = ServerMessage::new(
            "room.typing",
            json!({
                "room_id": typing.room_id,
                "user_id": sender_id(ctx),
                "typing": typing.typing,
            }),
        );
        ctx.gateway
            .publish_except(feature, &typing.room_id, &event, Some(&ctx.connection.id));
        Ok(None)
    }
}

pub struct NotificationAckHandler;

#[async_trait]
impl MessageHandler for NotificationAckHandler {
    async fn handle(&self, _ctx: &HandlerContext<'_>, message: ClientMessage) -> HandlerResult {
        let ack = match message {
            ClientMessage::NotificationAck(payload) => payload,
            other => return Err(unexpected(&other)),
        };
        if ack.notification_id.is_empty() {
            return Err(HandlerError::Invalid("notification_id is required".to_string()));
        }
        Ok(Some(ServerMessage::new(
            "notification.acked",
            json!({ "notification_id": ack.notification_id, "timestamp": now_millis() }),
        )))
    }
}

pub struct ActivityReportHandler;

#[async_trait]
impl MessageHandler for ActivityReportHandler {
    async fn handle(&self, ctx: &HandlerContext<'_>, message: ClientMessage) -> HandlerResult {
        let report = match message {
            ClientMessage::ActivityReport(payload) => payload,
            other => return Err(unexpected(&other)),
        };
        if report.action.trim().is_empty() {
            return Err(HandlerError::Invalid("action is required".to_string()));
        }

        let event = ServerMessage::new(
            "activity.event",
            json!({
                "action": report.action,
                "details": report.details,
                "actor": sender_id(ctx),
                "timestamp": now_millis(),
            }),
        );
        let delivery = ctx
            .gateway
            .publish(&ctx.policy.feature, ACTIVITY_RESOURCE, &event);

        Ok(Some(ServerMessage::new(
            "activity.report.ack",
            json!({ "delivered": delivery.delivered }),
        )))
    }
}
