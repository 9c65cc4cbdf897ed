//! WebSocket upgrade handler and per-connection event loop.

use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::{CloseFrame, Message, Utf8Bytes, WebSocket};
use axum::extract::{Path, State, WebSocketUpgrade};
use axum::http::{Extensions, HeaderMap};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::Router;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio::time::{self, Instant};

use crate::auth::authenticator::GENERIC_DENIAL;
use crate::auth::tokens::extract_token;
use crate::error::ApiError;
use crate::rate_limit::middleware::remote_addr;
use crate::AppState;

use super::connection::{CloseReason, Connection};
use super::hub::{Admission, Gateway};

/// Subprotocol browsers use to carry a token: `Sec-WebSocket-Protocol: bearer, <token>`.
const BEARER_PROTOCOL: &str = "bearer";

type WsSink = SplitSink<WebSocket, Message>;
type WsStream = SplitStream<WebSocket>;

pub fn router() -> Router<AppState> {
    Router::new().route("/rt/{namespace}", get(ws_upgrade))
}

/// Authentication happens here, before the upgrade, so a rejected client
/// never gets a socket.
async fn ws_upgrade(
    ws: WebSocketUpgrade,
    Path(namespace): Path<String>,
    State(state): State<AppState>,
    headers: HeaderMap,
    extensions: Extensions,
) -> Response {
    if state.namespaces.get(&namespace).is_none() {
        return ApiError::not_found("Unknown namespace").into_response();
    }

    let token = extract_token(&headers);
    let admission = match state
        .gateway
        .admit(&namespace, token.as_deref(), &remote_addr(&extensions))
    {
        Ok(admission) => admission,
        Err(_) => return ApiError::unauthorized(GENERIC_DENIAL).into_response(),
    };

    // Frames somewhat over the limit still arrive so they can be answered
    // with MESSAGE_TOO_LARGE; far larger ones fail the socket.
    let hard_limit = state.config.gateway.max_message_bytes.saturating_mul(4);
    let gateway = Arc::clone(&state.gateway);
    ws.protocols([BEARER_PROTOCOL])
        .max_message_size(hard_limit)
        .max_frame_size(hard_limit)
        .on_failed_upgrade(|e| tracing::debug!(%e, "websocket upgrade failed"))
        .on_upgrade(move |socket| handle_connection(socket, gateway, admission))
}

async fn handle_connection(socket: WebSocket, gateway: Arc<Gateway>, admission: Admission) {
    let Admission {
        connection,
        outbound,
    } = admission;

    let (mut ws_tx, ws_rx) = socket.split();

    if !gateway.attach(&connection) {
        let _ = send_close(&mut ws_tx, CloseReason::ServerShutdown).await;
        return;
    }

    run_connection(&gateway, &connection, ws_tx, ws_rx, outbound).await;
    gateway.teardown(&connection);
}

/// Main loop: inbound frames are handled one at a time in arrival order;
/// queued outbound frames, the liveness probe and close requests are
/// interleaved with them.
async fn run_connection(
    gateway: &Gateway,
    connection: &Arc<Connection>,
    mut ws_tx: WsSink,
    mut ws_rx: WsStream,
    mut outbound: mpsc::Receiver<Utf8Bytes>,
) {
    let config = gateway.config().clone();

    let mut ping_timer = time::interval(config.heartbeat_interval.max(Duration::from_millis(10)));
    ping_timer.tick().await; // First tick fires immediately; skip it.
    let pong_deadline = time::sleep(config.pong_timeout);
    tokio::pin!(pong_deadline);
    let mut awaiting_pong = false;

    // Set when the peer is gone and there is nobody left to drain to.
    let mut peer_gone = false;

    loop {
        tokio::select! {
            msg = ws_rx.next() => {
                match msg {
                    Some(Ok(Message::Text(text))) => {
                        if let Some(reply) = gateway.handle_text(connection, text.as_str()).await {
                            if ws_tx.send(Message::Text(reply.into())).await.is_err() {
                                connection.request_close(CloseReason::Internal);
                                peer_gone = true;
                                break;
                            }
                        }
                    }
                    Some(Ok(Message::Binary(_))) => {
                        let reply = gateway.handle_binary(connection);
                        if ws_tx.send(Message::Text(reply.into())).await.is_err() {
                            connection.request_close(CloseReason::Internal);
                            peer_gone = true;
                            break;
                        }
                    }
                    Some(Ok(Message::Pong(_))) => awaiting_pong = false,
                    Some(Ok(Message::Ping(_))) => continue,
                    Some(Ok(Message::Close(_))) | None => {
                        connection.request_close(CloseReason::Normal);
                        peer_gone = true;
                        break;
                    }
                    Some(Err(e)) => {
                        tracing::debug!(?e, conn_id = %connection.id, "ws read error");
                        connection.request_close(CloseReason::Internal);
                        peer_gone = true;
                        break;
                    }
                }
            }

            Some(frame) = outbound.recv() => {
                if ws_tx.send(Message::Text(frame)).await.is_err() {
                    connection.request_close(CloseReason::Internal);
                    peer_gone = true;
                    break;
                }
            }

            _ = ping_timer.tick() => {
                if !awaiting_pong {
                    if ws_tx.send(Message::Ping(Default::default())).await.is_err() {
                        connection.request_close(CloseReason::Internal);
                        peer_gone = true;
                        break;
                    }
                    awaiting_pong = true;
                    pong_deadline.as_mut().reset(Instant::now() + config.pong_timeout);
                }
            }

            _ = &mut pong_deadline, if awaiting_pong => {
                tracing::debug!(conn_id = %connection.id, "no pong within timeout");
                connection.request_close(CloseReason::HeartbeatTimeout);
                awaiting_pong = false;
            }

            _ = connection.closed() => break,
        }
    }

    if peer_gone {
        return;
    }

    // Flush what was already queued, then say goodbye; never wait longer
    // than the force-close timeout.
    let reason = connection.close_reason().unwrap_or(CloseReason::Normal);
    let drain = async {
        while let Ok(frame) = outbound.try_recv() {
            if ws_tx.send(Message::Text(frame)).await.is_err() {
                return;
            }
        }
        let _ = send_close(&mut ws_tx, reason).await;
    };
    if time::timeout(config.force_close_timeout, drain).await.is_err() {
        tracing::debug!(conn_id = %connection.id, "forced close after drain timeout");
    }
}

/// Send a WebSocket close frame for `reason`.
async fn send_close(ws_tx: &mut WsSink, reason: CloseReason) -> Result<(), axum::Error> {
    let close_msg = Message::Close(Some(CloseFrame {
        code: reason.code(),
        reason: Utf8Bytes::from_static(reason.as_str()),
    }));
    ws_tx.send(close_msg).await
}
