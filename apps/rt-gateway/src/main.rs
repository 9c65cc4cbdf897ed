use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;

use axum::Router;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use rt_gateway::config::Config;
use rt_gateway::rate_limit::store::{MemoryStore, RateLimitStore, RedisStore};
use rt_gateway::AppState;

#[tokio::main]
async fn main() {
    // Load .env file; a missing file is fine since env vars may be set externally
    if dotenvy::dotenv().is_err() {
        let env_path = Path::new(env!("CARGO_MANIFEST_DIR")).join(".env");
        let _ = dotenvy::from_path(env_path);
    }

    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::from_default_env())
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = Config::from_env();
    let port = config.port;

    let store: Arc<dyn RateLimitStore> = match config.redis_url.as_deref() {
        Some(url) => match RedisStore::connect(url).await {
            Ok(store) => {
                tracing::info!("rate limits shared through redis");
                Arc::new(store)
            }
            Err(e) => {
                tracing::warn!(error = %e, "redis unavailable, using in-process rate limits");
                Arc::new(MemoryStore::new())
            }
        },
        None => Arc::new(MemoryStore::new()),
    };

    let state = AppState::new(config, store);
    tracing::info!(
        namespaces = ?state.namespaces.names(),
        "rt-gateway configured"
    );

    state.limiter.spawn_sweeper();
    state.gateway.spawn_reaper();
    state.metrics.spawn();

    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    let gateway = Arc::clone(&state.gateway);
    let app = Router::new()
        .merge(rt_gateway::routes::router(state.clone()))
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state);

    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    tracing::info!(%addr, "rt-gateway listening");

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .expect("failed to bind");
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(async move {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "failed to listen for shutdown signal");
            std::future::pending::<()>().await;
        }
        tracing::info!("shutdown signal received, closing connections");
        gateway.shutdown().await;
    })
    .await
    .expect("server error");
}
