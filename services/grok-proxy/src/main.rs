//! Grok Proxy
//!
//! Single-binary service exposing an OpenAI-compatible chat completions API
//! backed by the grok web conversation endpoint:
//! 1. Authenticates callers by bearer API key
//! 2. Flattens the conversation and rotates upstream session cookies
//! 3. Streams upstream tokens back as chat completion chunks or one response

mod auth;
mod chat;
mod config;
mod error;
mod metrics;
mod models;
mod sse;

use anyhow::{Context, Result};
use axum::Router;
use axum::extract::State;
use axum::response::IntoResponse;
use axum::routing::{get, post};
use grok_client::GrokClient;
use grok_pool::Rotator;
use metrics_exporter_prometheus::PrometheusHandle;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use crate::auth::ApiKeys;
use crate::config::Config;
use crate::metrics::ServiceMetrics;

/// Maximum time in-flight requests get to finish after a shutdown signal.
const DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

/// Shared application state accessible from all handlers
#[derive(Clone)]
struct AppState {
    client: GrokClient,
    api_keys: ApiKeys,
    metrics: ServiceMetrics,
    prometheus: PrometheusHandle,
    /// Cancelled on shutdown; every upstream call runs under a child of it.
    shutdown: CancellationToken,
}

/// Build the axum router with all routes and shared state.
fn build_router(state: AppState, max_connections: usize) -> Router {
    let v1 = Router::new()
        .route("/models", get(chat::list_models))
        .route("/chat/completions", post(chat::chat_completions))
        .route_layer(axum::middleware::from_fn_with_state(
            state.api_keys.clone(),
            auth::require_api_key,
        ));

    Router::new()
        .route("/health", get(health_handler))
        .route("/metrics", get(metrics_handler))
        .nest("/v1", v1)
        .layer(tower::limit::ConcurrencyLimitLayer::new(max_connections))
        .with_state(state)
}

#[tokio::main]
async fn main() -> Result<()> {
    // JSON logs, LOG_LEVEL then RUST_LOG, default info
    tracing_subscriber::registry()
        .with(
            EnvFilter::try_from_env("LOG_LEVEL")
                .or_else(|_| EnvFilter::try_from_default_env())
                .unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    info!("starting grok-proxy");

    // Install before anything records
    let prometheus_handle =
        metrics::install_recorder().context("failed to install Prometheus recorder")?;

    let args: Vec<String> = std::env::args().collect();
    let cli_config_path = args
        .iter()
        .position(|a| a == "--config")
        .and_then(|i| args.get(i + 1))
        .map(|s| s.as_str());

    let config_path = Config::resolve_path(cli_config_path);
    info!(path = %config_path.display(), "loading configuration");

    let config = Config::load(&config_path)
        .with_context(|| format!("failed to load config from {}", config_path.display()))?;

    let api_keys = ApiKeys::new(config.auth.api_keys.clone());
    if api_keys.is_empty() {
        warn!("no API keys configured, every /v1 request will be rejected");
    }
    if config.credentials.cookies.is_empty() {
        warn!("credential pool is empty, upstream requests will be sent without a cookie");
    }

    let rotator = Arc::new(Rotator::new(
        config.credentials.cookies.clone(),
        config.credentials.user_agents.clone(),
    ));
    info!(
        pool_size = rotator.pool_size(),
        user_agents = config.credentials.user_agents.len(),
        upstream = %config.upstream.url,
        timeout_secs = config.upstream.timeout_secs,
        "credential pool ready"
    );

    let metrics = ServiceMetrics::new();
    let shutdown = CancellationToken::new();

    let app_state = AppState {
        client: GrokClient::new(
            reqwest::Client::new(),
            rotator,
            config.upstream.client_config(),
        ),
        api_keys,
        metrics: metrics.clone(),
        prometheus: prometheus_handle,
        shutdown: shutdown.clone(),
    };

    let app = build_router(app_state, config.proxy.max_connections);

    let listen_addr = config.proxy.listen_addr;
    let listener = TcpListener::bind(listen_addr)
        .await
        .with_context(|| format!("failed to bind to {listen_addr}"))?;
    info!(addr = %listen_addr, "accepting requests");

    let (shutdown_tx, shutdown_rx) = tokio::sync::oneshot::channel::<()>();

    let server_handle = tokio::spawn(async move {
        axum::serve(listener, app)
            .with_graceful_shutdown(async {
                let _ = shutdown_rx.await;
            })
            .await
    });

    shutdown_signal().await;

    // Live streams end on their own once the token fires; buffered
    // requests answer 503. The drain timer starts here.
    shutdown.cancel();
    let _ = shutdown_tx.send(());

    match tokio::time::timeout(DRAIN_TIMEOUT, server_handle).await {
        Ok(Ok(Ok(()))) => {
            info!("all in-flight requests drained");
        }
        Ok(Ok(Err(e))) => {
            error!(error = %e, "server error during shutdown");
        }
        Ok(Err(e)) => {
            error!(error = %e, "server task panicked");
        }
        Err(_) => {
            warn!(
                remaining = metrics.in_flight(),
                drain_timeout_secs = DRAIN_TIMEOUT.as_secs(),
                "drain timeout exceeded, forcing shutdown"
            );
        }
    }

    info!("shutdown complete");
    Ok(())
}

/// Liveness plus credential pool introspection.
async fn health_handler(State(state): State<AppState>) -> impl IntoResponse {
    let rotator = state.client.rotator();
    let body = serde_json::json!({
        "status": "healthy",
        "uptime_seconds": state.metrics.uptime_secs(),
        "requests_served": state.metrics.requests_total(),
        "errors_total": state.metrics.errors_total(),
        "in_flight": state.metrics.in_flight(),
        "credential_pool_size": rotator.pool_size(),
        "rotation_cursor": rotator.current_cursor(),
    });

    (
        axum::http::StatusCode::OK,
        [(axum::http::header::CONTENT_TYPE, "application/json")],
        body.to_string(),
    )
}

async fn metrics_handler(State(state): State<AppState>) -> impl IntoResponse {
    (
        axum::http::StatusCode::OK,
        [(
            axum::http::header::CONTENT_TYPE,
            "text/plain; version=0.0.4; charset=utf-8",
        )],
        state.prometheus.render(),
    )
}

/// Wait for SIGTERM or SIGINT.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                error!(error = %e, "failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("received SIGINT, shutting down"),
        _ = terminate => info!("received SIGTERM, shutting down"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::{Body, Bytes};
    use axum::http::{HeaderMap, Request, StatusCode};
    use common::Secret;
    use grok_client::ClientConfig;
    use std::sync::Mutex;
    use tower::ServiceExt;

    const HEL: &str = r#"{"result":{"response":{"token":"Hel"}}}"#;
    const LO: &str = r#"{"result":{"response":{"token":"lo"}}}"#;
    const KEY: &str = "sk-test";

    type Seen = Arc<Mutex<Vec<(HeaderMap, serde_json::Value)>>>;

    /// Mock upstream answering every request with `status` and `lines`.
    async fn start_upstream(status: StatusCode, lines: &'static [&'static str]) -> (String, Seen) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = format!("http://{}/", listener.local_addr().unwrap());
        let seen: Seen = Arc::default();

        let capture = seen.clone();
        let app = Router::new().fallback(move |headers: HeaderMap, body: Bytes| {
            let capture = capture.clone();
            async move {
                let json = serde_json::from_slice(&body).unwrap_or(serde_json::Value::Null);
                capture.lock().unwrap().push((headers, json));
                let mut text = lines.join("\n");
                text.push('\n');
                (status, text)
            }
        });
        tokio::spawn(async move { axum::serve(listener, app).await.unwrap() });

        (url, seen)
    }

    fn test_prometheus_handle() -> PrometheusHandle {
        metrics_exporter_prometheus::PrometheusBuilder::new()
            .build_recorder()
            .handle()
    }

    fn test_app_state(upstream_url: &str, cookies: &[&str]) -> AppState {
        let rotator = Rotator::new(
            cookies.iter().map(|c| Secret::new(c.to_string())).collect(),
            vec!["test-agent/1.0".to_string()],
        );
        AppState {
            client: GrokClient::new(
                reqwest::Client::new(),
                Arc::new(rotator),
                ClientConfig {
                    upstream_url: upstream_url.to_string(),
                    timeout: Duration::from_secs(5),
                },
            ),
            api_keys: ApiKeys::new(vec![Secret::new(KEY.to_string())]),
            metrics: ServiceMetrics::new(),
            prometheus: test_prometheus_handle(),
            shutdown: CancellationToken::new(),
        }
    }

    fn chat_request(body: serde_json::Value) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri("/v1/chat/completions")
            .header("authorization", format!("Bearer {KEY}"))
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    async fn body_json(response: axum::response::Response) -> serde_json::Value {
        let bytes = axum::body::to_bytes(response.into_body(), 1024 * 1024)
            .await
            .unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    async fn body_text(response: axum::response::Response) -> String {
        let bytes = axum::body::to_bytes(response.into_body(), 1024 * 1024)
            .await
            .unwrap();
        String::from_utf8(bytes.to_vec()).unwrap()
    }

    /// `data:` payloads of an SSE body, in order.
    fn sse_data(body: &str) -> Vec<String> {
        body.lines()
            .filter_map(|line| line.strip_prefix("data: "))
            .map(str::to_string)
            .collect()
    }

    #[tokio::test]
    async fn health_endpoint_reports_pool() {
        let state = test_app_state("http://unused", &["sso=a", "sso=b"]);
        let app = build_router(state, 100);

        let response = app
            .oneshot(Request::get("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let json = body_json(response).await;
        assert_eq!(json["status"], "healthy");
        assert_eq!(json["credential_pool_size"], 2);
        assert_eq!(json["rotation_cursor"], 0);
        assert_eq!(json["requests_served"], 0);
    }

    #[tokio::test]
    async fn health_needs_no_api_key_and_leaks_no_cookie() {
        let state = test_app_state("http://unused", &["sso=secret-cookie"]);
        let app = build_router(state, 100);

        let response = app
            .oneshot(Request::get("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert!(!body_text(response).await.contains("secret-cookie"));
    }

    #[tokio::test]
    async fn metrics_endpoint_returns_prometheus_text() {
        let state = test_app_state("http://unused", &[]);
        let app = build_router(state, 100);

        let response = app
            .oneshot(Request::get("/metrics").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            response.headers().get("content-type").unwrap(),
            "text/plain; version=0.0.4; charset=utf-8"
        );
    }

    #[tokio::test]
    async fn models_requires_api_key() {
        let app = build_router(test_app_state("http://unused", &[]), 100);

        let response = app
            .oneshot(Request::get("/v1/models").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
        let json = body_json(response).await;
        assert_eq!(json["error"]["message"], "Missing API key");
        assert_eq!(json["error"]["code"], "invalid_api_key");
    }

    #[tokio::test]
    async fn models_lists_catalog() {
        let app = build_router(test_app_state("http://unused", &[]), 100);

        let response = app
            .oneshot(
                Request::get("/v1/models")
                    .header("authorization", format!("Bearer {KEY}"))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let json = body_json(response).await;
        assert_eq!(json["object"], "list");
        assert_eq!(json["data"][0]["id"], "grok-latest");
    }

    #[tokio::test]
    async fn wrong_key_never_reaches_upstream() {
        let (url, seen) = start_upstream(StatusCode::OK, &[HEL, LO]).await;
        let app = build_router(test_app_state(&url, &["sso=a"]), 100);

        let request = Request::post("/v1/chat/completions")
            .header("authorization", "Bearer sk-wrong")
            .header("content-type", "application/json")
            .body(Body::from(
                serde_json::json!({
                    "model": "grok-3",
                    "messages": [{"role": "user", "content": "hi"}]
                })
                .to_string(),
            ))
            .unwrap();
        let response = app.oneshot(request).await.unwrap();

        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
        assert_eq!(body_json(response).await["error"]["message"], "Invalid API key");
        assert!(seen.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn buffered_completion_returns_concatenated_text() {
        let (url, seen) = start_upstream(StatusCode::OK, &[HEL, LO]).await;
        let state = test_app_state(&url, &["sso=a", "sso=b"]);
        let app = build_router(state.clone(), 100);

        let response = app
            .oneshot(chat_request(serde_json::json!({
                "model": "grok-3",
                "stream": false,
                "messages": [{"role": "user", "content": "hi"}]
            })))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let json = body_json(response).await;
        assert_eq!(json["object"], "chat.completion");
        assert_eq!(json["model"], "grok-3");
        assert_eq!(json["choices"][0]["message"]["content"], "Hello");
        assert_eq!(json["choices"][0]["finish_reason"], "stop");
        assert!(json["id"].as_str().unwrap().starts_with("chatcmpl-"));

        let seen = seen.lock().unwrap();
        assert_eq!(seen.len(), 1);
        let (headers, body) = &seen[0];
        assert_eq!(headers.get("cookie").unwrap(), "sso=a");
        assert_eq!(headers.get("user-agent").unwrap(), "test-agent/1.0");
        assert_eq!(
            body,
            &serde_json::json!({"message": "user: hi", "modelName": "grok-3"})
        );

        assert_eq!(state.client.rotator().current_cursor(), 1);
        assert_eq!(state.metrics.requests_total(), 1);
        assert_eq!(state.metrics.in_flight(), 0);
    }

    #[tokio::test]
    async fn consecutive_requests_rotate_cookies() {
        let (url, seen) = start_upstream(StatusCode::OK, &[HEL, LO]).await;
        let state = test_app_state(&url, &["sso=a", "sso=b"]);

        for _ in 0..3 {
            let response = build_router(state.clone(), 100)
                .oneshot(chat_request(serde_json::json!({
                    "model": "grok-3",
                    "messages": [{"role": "user", "content": "hi"}]
                })))
                .await
                .unwrap();
            assert_eq!(response.status(), StatusCode::OK);
        }

        let cookies: Vec<String> = seen
            .lock()
            .unwrap()
            .iter()
            .map(|(h, _)| h.get("cookie").unwrap().to_str().unwrap().to_string())
            .collect();
        assert_eq!(cookies, vec!["sso=a", "sso=b", "sso=a"]);
    }

    #[tokio::test]
    async fn streaming_completion_emits_chunks_then_done() {
        let (url, _) = start_upstream(StatusCode::OK, &[HEL, LO]).await;
        let state = test_app_state(&url, &["sso=a"]);
        let app = build_router(state.clone(), 100);

        let response = app
            .oneshot(chat_request(serde_json::json!({
                "model": "grok-3",
                "stream": true,
                "messages": [{"role": "user", "content": "hi"}]
            })))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            response.headers().get("content-type").unwrap(),
            "text/event-stream"
        );

        let frames = sse_data(&body_text(response).await);
        assert_eq!(frames.len(), 4, "two tokens, finish, DONE: {frames:?}");

        let first: serde_json::Value = serde_json::from_str(&frames[0]).unwrap();
        let second: serde_json::Value = serde_json::from_str(&frames[1]).unwrap();
        let finish: serde_json::Value = serde_json::from_str(&frames[2]).unwrap();
        assert_eq!(first["object"], "chat.completion.chunk");
        assert_eq!(first["choices"][0]["delta"]["content"], "Hel");
        assert_eq!(second["choices"][0]["delta"]["content"], "lo");
        assert_eq!(finish["choices"][0]["delta"], serde_json::json!({}));
        assert_eq!(finish["choices"][0]["finish_reason"], "stop");
        assert_eq!(first["id"], finish["id"]);
        assert_eq!(frames[3], "[DONE]");

        assert_eq!(state.metrics.in_flight(), 0);
    }

    #[tokio::test]
    async fn buffered_upstream_failure_is_generic_500() {
        let (url, _) = start_upstream(StatusCode::TOO_MANY_REQUESTS, &["rate limited"]).await;
        let state = test_app_state(&url, &["sso=a"]);
        let app = build_router(state.clone(), 100);

        let response = app
            .oneshot(chat_request(serde_json::json!({
                "model": "grok-3",
                "messages": [{"role": "user", "content": "hi"}]
            })))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);

        let text = body_text(response).await;
        let json: serde_json::Value = serde_json::from_str(&text).unwrap();
        assert_eq!(json["error"]["type"], "upstream_error");
        assert!(json["error"]["request_id"].as_str().unwrap().starts_with("req_"));
        assert!(!text.contains("429"));
        assert!(!text.contains("rate limited"));
        assert_eq!(state.metrics.errors_total(), 1);
    }

    #[tokio::test]
    async fn streaming_upstream_failure_emits_one_error_chunk_without_done() {
        let (url, _) = start_upstream(StatusCode::TOO_MANY_REQUESTS, &["rate limited"]).await;
        let app = build_router(test_app_state(&url, &["sso=a"]), 100);

        let response = app
            .oneshot(chat_request(serde_json::json!({
                "model": "grok-3",
                "stream": true,
                "messages": [{"role": "user", "content": "hi"}]
            })))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let frames = sse_data(&body_text(response).await);
        assert_eq!(frames.len(), 1, "{frames:?}");
        let error: serde_json::Value = serde_json::from_str(&frames[0]).unwrap();
        assert_eq!(error["error"]["type"], "upstream_error");
        assert!(!frames.iter().any(|f| f == "[DONE]"));
    }

    #[tokio::test]
    async fn malformed_body_is_400() {
        let app = build_router(test_app_state("http://unused", &[]), 100);

        let request = Request::post("/v1/chat/completions")
            .header("authorization", format!("Bearer {KEY}"))
            .header("content-type", "application/json")
            .body(Body::from("{not json"))
            .unwrap();
        let response = app.oneshot(request).await.unwrap();

        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert_eq!(body_json(response).await["error"]["type"], "invalid_request_error");
    }

    #[tokio::test]
    async fn empty_messages_is_400() {
        let app = build_router(test_app_state("http://unused", &[]), 100);

        let response = app
            .oneshot(chat_request(serde_json::json!({"model": "grok-3", "messages": []})))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn shutdown_cancels_buffered_request() {
        let (url, seen) = start_upstream(StatusCode::OK, &[HEL, LO]).await;
        let state = test_app_state(&url, &["sso=a"]);
        state.shutdown.cancel();
        let app = build_router(state, 100);

        let response = app
            .oneshot(chat_request(serde_json::json!({
                "model": "grok-3",
                "messages": [{"role": "user", "content": "hi"}]
            })))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
        assert!(seen.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn shutdown_ends_stream_without_frames() {
        let (url, _) = start_upstream(StatusCode::OK, &[HEL, LO]).await;
        let state = test_app_state(&url, &["sso=a"]);
        state.shutdown.cancel();
        let app = build_router(state, 100);

        let response = app
            .oneshot(chat_request(serde_json::json!({
                "model": "grok-3",
                "stream": true,
                "messages": [{"role": "user", "content": "hi"}]
            })))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert!(sse_data(&body_text(response).await).is_empty());
    }
}
