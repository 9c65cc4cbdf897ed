mod common;

use axum::http::header::CONTENT_TYPE;
use axum::http::StatusCode;
use axum_test::TestServer;
use serde_json::Value;

#[tokio::test]
async fn health_reports_status_score_and_connections() {
    let state = common::test_state();
    let server = TestServer::new(common::test_app(&state)).unwrap();

    let resp = server.get("/health").await;
    resp.assert_status_ok();
    let body: Value = resp.json();
    assert_eq!(body["status"], "healthy");
    assert_eq!(body["active_connections"], 0);
    assert!(body["health_score"].as_f64().unwrap() > 70.0);
}

#[tokio::test]
async fn live_metrics_cover_every_namespace() {
    let state = common::test_state();
    let server = TestServer::new(common::test_app(&state)).unwrap();

    let resp = server.get("/metrics").await;
    resp.assert_status_ok();
    let body: Value = resp.json();
    for ns in ["tracking", "notifications", "collaboration", "prices", "admin-activity"] {
        assert!(body["counters"]["namespaces"][ns].is_object(), "{ns} missing");
    }
    assert_eq!(body["sequence"], 0);
    assert!(body["resources"]["uptime_secs"].is_u64());
}

#[tokio::test]
async fn summary_needs_a_snapshot() {
    let state = common::test_state();
    let server = TestServer::new(common::test_app(&state)).unwrap();

    server
        .get("/metrics/summary")
        .await
        .assert_status(StatusCode::NOT_FOUND);

    state.metrics.snapshot().await;
    state.metrics.snapshot().await;

    let resp = server.get("/metrics/summary").add_query_param("minutes", 5).await;
    resp.assert_status_ok();
    let body: Value = resp.json();
    assert_eq!(body["window_minutes"], 5);
    assert_eq!(body["snapshots"], 2);
    assert_eq!(body["messages"], 0);
}

#[tokio::test]
async fn history_returns_the_newest_snapshots() {
    let state = common::test_state();
    let server = TestServer::new(common::test_app(&state)).unwrap();

    for _ in 0..3 {
        state.metrics.snapshot().await;
    }

    let all: Vec<Value> = server.get("/metrics/history").await.json();
    assert_eq!(all.len(), 3);

    let resp = server.get("/metrics/history").add_query_param("limit", 1).await;
    let latest: Vec<Value> = resp.json();
    assert_eq!(latest.len(), 1);
    assert_eq!(latest[0]["sequence"], 3);
}

#[tokio::test]
async fn alerts_start_empty() {
    let state = common::test_state();
    let server = TestServer::new(common::test_app(&state)).unwrap();

    let alerts: Vec<Value> = server.get("/metrics/alerts").await.json();
    assert!(alerts.is_empty());
}

#[tokio::test]
async fn auth_failure_spike_raises_an_alert() {
    let state = common::test_state();
    let addr = common::start_server(&state).await;
    let server = TestServer::new(common::test_app(&state)).unwrap();

    for _ in 0..11 {
        assert!(common::connect(addr, "tracking", None).await.is_err());
    }
    state.metrics.snapshot().await;

    let alerts: Vec<Value> = server.get("/metrics/alerts").await.json();
    assert!(alerts
        .iter()
        .any(|a| a["category"] == "auth_failure_spike" && a["severity"] == "warning"));
}

#[tokio::test]
async fn prometheus_scrape_uses_text_format() {
    let state = common::test_state();
    let server = TestServer::new(common::test_app(&state)).unwrap();

    let resp = server.get("/metrics/prometheus").await;
    resp.assert_status_ok();
    assert_eq!(resp.header(CONTENT_TYPE), "text/plain; version=0.0.4");
    let text = resp.text();
    assert!(text.contains("# TYPE rt_gateway_health_score gauge"));
    assert!(text.contains("rt_gateway_active_connections{namespace=\"prices\"} 0"));
}
