#![allow(dead_code)]

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::Router;
use futures_util::{SinkExt, StreamExt};
use serde_json::Value;
use tokio::net::TcpStream;
use tokio::time;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::{self, Message};
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};

use rt_gateway::auth::principal::Role;
use rt_gateway::auth::tokens::TokenIssuer;
use rt_gateway::config::Config;
use rt_gateway::gateway::hub::Gateway;
use rt_gateway::namespace::NamespaceRegistry;
use rt_gateway::rate_limit::store::MemoryStore;
use rt_gateway::AppState;

pub const TEST_SECRET: &str = "integration-test-secret";

pub type WsClient = WebSocketStream<MaybeTlsStream<TcpStream>>;

pub fn test_config() -> Config {
    Config::with_secret(TEST_SECRET)
}

/// AppState over an in-memory limiter store and the built-in namespaces.
pub fn test_state() -> AppState {
    test_state_with(test_config())
}

pub fn test_state_with(config: Config) -> AppState {
    AppState::new(config, Arc::new(MemoryStore::new()))
}

/// AppState whose gateway has been adjusted, e.g. with extra handlers.
pub fn test_state_customized(config: Config, customize: impl FnOnce(Gateway) -> Gateway) -> AppState {
    AppState::assemble(
        config,
        Arc::new(MemoryStore::new()),
        NamespaceRegistry::builtin(),
        customize,
    )
}

/// Build the full application router wired to `state`.
pub fn test_app(state: &AppState) -> Router {
    rt_gateway::routes::router(state.clone()).with_state(state.clone())
}

pub fn token(user_id: &str, role: Role) -> String {
    TokenIssuer::new(TEST_SECRET).issue(user_id, role, 300)
}

pub fn bearer(token: &str) -> String {
    format!("Bearer {token}")
}

/// Start an actual TCP server for WebSocket testing. The server runs in the
/// background.
pub async fn start_server(state: &AppState) -> SocketAddr {
    let app = test_app(state);
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind");
    let addr = listener.local_addr().unwrap();

    tokio::spawn(async move {
        axum::serve(
            listener,
            app.into_make_service_with_connect_info::<SocketAddr>(),
        )
        .await
        .unwrap();
    });

    addr
}

/// Open `/rt/{namespace}`, with the token in the `Authorization` header.
pub async fn connect(
    addr: SocketAddr,
    namespace: &str,
    token: Option<&str>,
) -> Result<WsClient, tungstenite::Error> {
    let mut request = format!("ws://{addr}/rt/{namespace}").into_client_request()?;
    if let Some(token) = token {
        request.headers_mut().insert(
            "authorization",
            HeaderValue::from_str(&bearer(token)).unwrap(),
        );
    }
    let (ws, _) = tokio_tungstenite::connect_async(request).await?;
    Ok(ws)
}

/// Status code of a rejected handshake.
pub fn handshake_status(err: &tungstenite::Error) -> Option<u16> {
    match err {
        tungstenite::Error::Http(response) => Some(response.status().as_u16()),
        _ => None,
    }
}

pub async fn send_json(ws: &mut WsClient, value: Value) {
    ws.send(Message::Text(value.to_string().into()))
        .await
        .expect("send");
}

pub async fn send_raw(ws: &mut WsClient, text: &str) {
    ws.send(Message::Text(text.to_string().into()))
        .await
        .expect("send");
}

/// Next JSON frame, skipping control frames.
pub async fn recv_json(ws: &mut WsClient) -> Value {
    loop {
        let msg = time::timeout(Duration::from_secs(5), ws.next())
            .await
            .expect("timeout waiting for frame")
            .expect("stream ended")
            .expect("ws read error");
        match msg {
            Message::Text(text) => return serde_json::from_str(text.as_str()).expect("json frame"),
            Message::Ping(_) | Message::Pong(_) => continue,
            other => panic!("unexpected frame: {other:?}"),
        }
    }
}

/// Read until the server's close frame and return its code.
pub async fn recv_close_code(ws: &mut WsClient) -> Option<u16> {
    loop {
        let msg = time::timeout(Duration::from_secs(5), ws.next())
            .await
            .expect("timeout waiting for close")?;
        match msg {
            Ok(Message::Close(frame)) => return frame.map(|f| u16::from(f.code)),
            Ok(_) => continue,
            Err(_) => return None,
        }
    }
}

/// Poll `check` until it holds or two seconds pass.
pub async fn eventually(mut check: impl FnMut() -> bool) -> bool {
    for _ in 0..100 {
        if check() {
            return true;
        }
        time::sleep(Duration::from_millis(20)).await;
    }
    check()
}
