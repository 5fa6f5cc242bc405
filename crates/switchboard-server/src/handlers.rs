//! HTTP and WebSocket handlers for the Switchboard server.
//!
//! Admission runs after the upgrade so that rejections reach the client as
//! WebSocket close codes.

use crate::admin;
use crate::config::Config;
use crate::metrics;
use anyhow::{Context, Result};
use axum::{
    extract::{ws::WebSocketUpgrade, ConnectInfo, Query, State},
    http::{
        header::{AUTHORIZATION, ORIGIN},
        HeaderMap,
    },
    response::IntoResponse,
    routing::get,
    Json, Router,
};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use switchboard_admission::parse_bearer_token;
use switchboard_core::{ConnectRequest, Hub};
use switchboard_protocol::PROTOCOL_VERSION;
use switchboard_transport::WebSocketConnection;
use tokio::net::TcpListener;
use tracing::{debug, error, info, warn};

/// Shared server state.
pub struct AppState {
    pub hub: Hub,
    pub config: Config,
}

/// Build the hub with the configured token tables.
///
/// # Errors
///
/// Returns an error for invalid rules or seed rooms.
pub async fn build_hub(config: &Config) -> Result<Hub> {
    Hub::builder(config.hub.clone())
        .with_token_validator(Arc::new(config.auth.validator()))
        .with_revocation_list(Arc::new(config.auth.revocations()))
        .build()
        .await
        .context("Failed to build hub")
}

/// Routes for the WebSocket endpoint, health and admin API.
pub fn app(state: Arc<AppState>) -> Router {
    let mut router = Router::new()
        .route(&state.config.transport.websocket_path, get(ws_handler))
        .route("/health", get(health_handler));
    if state.config.admin.enabled {
        router = router.nest("/admin", admin::routes(Arc::clone(&state)));
    }
    router.with_state(state)
}

/// Run the HTTP/WebSocket server until ctrl-c.
///
/// # Errors
///
/// Returns an error if the hub cannot be built or the server fails to start.
pub async fn run_server(config: Config) -> Result<()> {
    let hub = build_hub(&config).await?;

    if config.metrics.enabled {
        if let Err(e) = metrics::start_metrics_server(config.metrics.port) {
            error!("Failed to start metrics server: {:#}", e);
        }
    }

    let maintenance = hub.spawn_maintenance();
    let grace = Duration::from_secs(config.shutdown_grace_secs);
    let addr = config.bind_addr()?;
    let path = config.transport.websocket_path.clone();
    let app = app(Arc::new(AppState {
        hub: hub.clone(),
        config,
    }));

    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to bind {}", addr))?;

    info!("Switchboard listening on {}", addr);
    info!("WebSocket endpoint: ws://{}{}", addr, path);

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal(hub, grace))
    .await?;

    for task in maintenance {
        task.abort();
    }
    info!("Server stopped");
    Ok(())
}

/// Resolves on ctrl-c once every session has closed with `going away` or
/// the grace period has passed.
async fn shutdown_signal(hub: Hub, grace: Duration) {
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!("Failed to listen for ctrl-c: {}", e);
        std::future::pending::<()>().await;
    }

    info!("Shutdown requested");
    hub.shutdown();
    if !hub.wait_idle(grace).await {
        warn!(
            remaining = hub.registry().len(),
            "Sessions still open after grace period"
        );
    }
}

/// Health check handler.
async fn health_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let stats = state.hub.stats();
    Json(serde_json::json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
        "protocol": PROTOCOL_VERSION.to_string(),
        "connections": stats.registry.connections,
        "rooms": stats.rooms,
    }))
}

/// WebSocket upgrade handler.
///
/// Query parameters: `token` and any number of `events`.
async fn ws_handler(
    ws: WebSocketUpgrade,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    Query(params): Query<Vec<(String, String)>>,
    State(state): State<Arc<AppState>>,
) -> impl IntoResponse {
    let request = connect_request(addr, &headers, params);
    debug!(remote_addr = %addr, events = request.events.len(), "WebSocket upgrade");

    ws.on_upgrade(move |socket| async move {
        let transport = WebSocketConnection::new(socket, Some(addr));
        state.hub.serve(transport, request).await;
    })
}

/// Collect the handshake inputs. A `token` query parameter wins over an
/// `Authorization: Bearer` header.
fn connect_request(
    addr: SocketAddr,
    headers: &HeaderMap,
    params: Vec<(String, String)>,
) -> ConnectRequest {
    let mut request = ConnectRequest::new(addr.ip().to_string());
    for (key, value) in params {
        match key.as_str() {
            "token" if !value.is_empty() => request.token = Some(value),
            "version" => request.version = Some(value),
            "events" => request
                .events
                .extend(value.split(',').map(str::trim).filter(|e| !e.is_empty()).map(String::from)),
            _ => {}
        }
    }

    if request.token.is_none() {
        request.token = headers
            .get(AUTHORIZATION)
            .and_then(|value| value.to_str().ok())
            .and_then(|value| parse_bearer_token(value).ok());
    }
    request.origin = headers
        .get(ORIGIN)
        .and_then(|value| value.to_str().ok())
        .map(String::from);
    request
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    fn addr() -> SocketAddr {
        SocketAddr::from(([10, 0, 0, 1], 40000))
    }

    #[test]
    fn test_connect_request_from_query() {
        let mut headers = HeaderMap::new();
        headers.insert(ORIGIN, HeaderValue::from_static("https://app.example.com"));
        let params = vec![
            ("token".to_string(), "abc".to_string()),
            ("events".to_string(), "orders.*".to_string()),
            ("events".to_string(), "billing, alerts".to_string()),
            ("version".to_string(), "1.2".to_string()),
            ("other".to_string(), "x".to_string()),
        ];

        let request = connect_request(addr(), &headers, params);
        assert_eq!(request.remote_addr, "10.0.0.1");
        assert_eq!(request.token.as_deref(), Some("abc"));
        assert_eq!(request.origin.as_deref(), Some("https://app.example.com"));
        assert_eq!(request.events, vec!["orders.*", "billing", "alerts"]);
        assert_eq!(request.version.as_deref(), Some("1.2"));
    }

    #[test]
    fn test_connect_request_bearer_fallback() {
        let mut headers = HeaderMap::new();
        headers.insert(AUTHORIZATION, HeaderValue::from_static("Bearer from-header"));

        let request = connect_request(addr(), &headers, Vec::new());
        assert_eq!(request.token.as_deref(), Some("from-header"));
        assert!(request.origin.is_none());

        let request = connect_request(
            addr(),
            &headers,
            vec![("token".to_string(), "from-query".to_string())],
        );
        assert_eq!(request.token.as_deref(), Some("from-query"));
    }

    #[tokio::test]
    async fn test_build_hub_with_tokens() {
        let config: Config = toml::from_str(
            r#"
            [[auth.tokens]]
            token = "alice-token"
            user_id = "alice"

            [[rooms]]
            name = "general"
            "#,
        )
        .unwrap();
        let hub = build_hub(&config).await.unwrap();
        assert_eq!(hub.list_rooms(false).len(), 1);

        let (conn, _channels) = hub
            .open(&ConnectRequest::new("10.0.0.1").with_token("alice-token"), "memory")
            .await
            .unwrap();
        assert_eq!(conn.label(), "alice");
    }
}
