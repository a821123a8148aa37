//! `TandemServer`: Axum HTTP + WebSocket server.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use axum::Router;
use axum::extract::State;
use axum::extract::ws::WebSocketUpgrade;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Json, Response};
use axum::routing::get;
use metrics::counter;
use metrics_exporter_prometheus::PrometheusHandle;
use tandem_core::metrics::WS_REJECTED_TOTAL;
use tandem_pairing::{BroadcastHub, ConnectionRegistry, SessionController};
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinHandle;
use tokio_util::task::TaskTracker;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

use crate::config::ServerConfig;
use crate::health::{self, HealthResponse};
use crate::shutdown::ShutdownCoordinator;
use crate::websocket::broadcast::run_broadcast_socket;
use crate::websocket::session::run_pairing_socket;

const INFO_PAGE: &str = "\
tandem signaling server

Endpoints
  GET /           this page
  GET /health     JSON status and connection counters
  GET /metrics    Prometheus metrics
  GET /ws         WebSocket, pairing mode
  GET /broadcast  WebSocket, broadcast mode

Pairing protocol (JSON text frames)
  client -> server  {\"type\":\"swap\"}   leave the current partner
                    {\"type\":\"ping\"}   keep-alive
                    {\"type\":\"<any>\", ...}  relayed to the partner
  server -> client  welcome, partner-found, waiting, partner-disconnected,
                    partner-changed, error, and relayed messages carrying
                    the sender's id in \"sender_id\"
";

/// Shared state accessible from Axum handlers.
#[derive(Clone)]
pub struct AppState {
    /// Pairing-mode state machine.
    pub controller: Arc<SessionController>,
    /// Broadcast-mode hub.
    pub broadcast: Arc<BroadcastHub>,
    /// Shutdown coordinator.
    pub shutdown: Arc<ShutdownCoordinator>,
    /// Runtime configuration.
    pub config: Arc<ServerConfig>,
    /// When the server started.
    pub start_time: Instant,
    /// Prometheus handle for `/metrics`, if a recorder is installed.
    pub metrics: Option<PrometheusHandle>,
    /// Tracks live socket tasks for graceful shutdown.
    pub sessions: TaskTracker,
    /// One permit per WebSocket across both endpoints, taken before the
    /// upgrade and held until the socket task ends.
    slots: Arc<Semaphore>,
}

impl AppState {
    fn reserve_slot(&self) -> Option<OwnedSemaphorePermit> {
        Arc::clone(&self.slots).try_acquire_owned().ok()
    }
}

/// The tandem server.
pub struct TandemServer {
    state: AppState,
}

impl TandemServer {
    /// Create a new server.
    pub fn new(config: ServerConfig, metrics: Option<PrometheusHandle>) -> Self {
        let pairing = Arc::new(ConnectionRegistry::new("pairing"));
        let broadcast = Arc::new(ConnectionRegistry::new("broadcast"));
        let slots = Arc::new(Semaphore::new(config.max_connections.min(Semaphore::MAX_PERMITS)));
        let state = AppState {
            controller: Arc::new(SessionController::new(pairing, config.session_config())),
            broadcast: Arc::new(BroadcastHub::new(broadcast, config.max_send_failures)),
            shutdown: Arc::new(ShutdownCoordinator::new()),
            config: Arc::new(config),
            start_time: Instant::now(),
            metrics,
            sessions: TaskTracker::new(),
            slots,
        };
        Self { state }
    }

    /// Build the Axum router with all routes.
    pub fn router(&self) -> Router {
        Router::new()
            .route("/", get(info_handler))
            .route("/health", get(health_handler))
            .route("/metrics", get(metrics_handler))
            .route("/ws", get(pairing_ws_handler))
            .route("/broadcast", get(broadcast_ws_handler))
            .with_state(self.state.clone())
            .layer(TraceLayer::new_for_http())
            .layer(CorsLayer::permissive())
    }

    /// Bind the configured address and serve until shutdown.
    ///
    /// Returns the bound address (useful with port `0`) and the serve task.
    pub async fn listen(&self) -> std::io::Result<(SocketAddr, JoinHandle<()>)> {
        let addr = format!("{}:{}", self.state.config.host, self.state.config.port);
        let listener = tokio::net::TcpListener::bind(&addr).await?;
        let local_addr = listener.local_addr()?;
        info!(%local_addr, "tandem server listening");

        let router = self.router();
        let token = self.state.shutdown.token();
        let handle = tokio::spawn(async move {
            if let Err(e) = axum::serve(listener, router)
                .with_graceful_shutdown(token.cancelled_owned())
                .await
            {
                warn!(error = %e, "server error");
            }
        });
        Ok((local_addr, handle))
    }

    /// Stop accepting connections and wait for every session to finish
    /// its disconnect transition, up to the configured timeout.
    pub async fn shutdown(&self) -> bool {
        self.state.controller.registry().close();
        self.state.broadcast.registry().close();
        self.state
            .shutdown
            .graceful_shutdown(&self.state.sessions, self.state.config.shutdown_timeout())
            .await
    }

    /// Get the pairing controller.
    pub fn controller(&self) -> &Arc<SessionController> {
        &self.state.controller
    }

    /// Get the broadcast hub.
    pub fn broadcast(&self) -> &Arc<BroadcastHub> {
        &self.state.broadcast
    }

    /// Get the shutdown coordinator.
    pub fn shutdown_coordinator(&self) -> &Arc<ShutdownCoordinator> {
        &self.state.shutdown
    }

    /// Get the server configuration.
    pub fn config(&self) -> &ServerConfig {
        &self.state.config
    }
}

/// GET /
async fn info_handler() -> &'static str {
    INFO_PAGE
}

/// GET /health
async fn health_handler(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(health::health_check(
        state.start_time,
        state.controller.registry().counts(),
        state.broadcast.registry().len(),
        state.shutdown.is_shutting_down(),
    ))
}

/// GET /metrics
async fn metrics_handler(State(state): State<AppState>) -> Response {
    match &state.metrics {
        Some(handle) => crate::metrics::render(handle).into_response(),
        None => (StatusCode::NOT_FOUND, "metrics recorder not installed").into_response(),
    }
}

/// Take a connection slot, or answer 503 while shutting down or at capacity.
fn reserve_upgrade(state: &AppState, mode: &'static str) -> Result<OwnedSemaphorePermit, Response> {
    if state.shutdown.is_shutting_down() {
        counter!(WS_REJECTED_TOTAL, "reason" => "shutdown").increment(1);
        return Err((StatusCode::SERVICE_UNAVAILABLE, "server shutting down").into_response());
    }
    state.reserve_slot().ok_or_else(|| {
        warn!(mode, max = state.config.max_connections, "connection limit reached");
        counter!(WS_REJECTED_TOTAL, "reason" => "capacity").increment(1);
        (StatusCode::SERVICE_UNAVAILABLE, "server at capacity").into_response()
    })
}

/// GET /ws
async fn pairing_ws_handler(ws: WebSocketUpgrade, State(state): State<AppState>) -> Response {
    let slot = match reserve_upgrade(&state, "pairing") {
        Ok(slot) => slot,
        Err(refused) => return refused,
    };
    let sessions = state.sessions.clone();
    ws.max_message_size(state.config.max_message_size)
        .on_upgrade(move |socket| {
            sessions.track_future(async move {
                run_pairing_socket(socket, state).await;
                drop(slot);
            })
        })
}

/// GET /broadcast
async fn broadcast_ws_handler(ws: WebSocketUpgrade, State(state): State<AppState>) -> Response {
    let slot = match reserve_upgrade(&state, "broadcast") {
        Ok(slot) => slot,
        Err(refused) => return refused,
    };
    let sessions = state.sessions.clone();
    ws.max_message_size(state.config.max_message_size)
        .on_upgrade(move |socket| {
            sessions.track_future(async move {
                run_broadcast_socket(socket, state).await;
                drop(slot);
            })
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::Request;
    use tower::ServiceExt;

    fn make_server() -> TandemServer {
        TandemServer::new(ServerConfig::default(), None)
    }

    async fn get_body(app: Router, uri: &str) -> (StatusCode, String) {
        let req = Request::builder().uri(uri).body(Body::empty()).unwrap();
        let resp = app.oneshot(req).await.unwrap();
        let status = resp.status();
        let body = axum::body::to_bytes(resp.into_body(), 100_000).await.unwrap();
        (status, String::from_utf8(body.to_vec()).unwrap())
    }

    #[tokio::test]
    async fn info_page_lists_endpoints() {
        let (status, body) = get_body(make_server().router(), "/").await;
        assert_eq!(status, StatusCode::OK);
        assert!(body.contains("/ws"));
        assert!(body.contains("/broadcast"));
        assert!(body.contains("partner-found"));
    }

    #[tokio::test]
    async fn health_endpoint_returns_ok() {
        let (status, body) = get_body(make_server().router(), "/health").await;
        assert_eq!(status, StatusCode::OK);
        let parsed: serde_json::Value = serde_json::from_str(&body).unwrap();
        assert_eq!(parsed["status"], "ok");
        assert_eq!(parsed["connections"], 0);
        assert_eq!(parsed["searching"], 0);
        assert_eq!(parsed["paired"], 0);
        assert_eq!(parsed["broadcast_connections"], 0);
    }

    #[tokio::test]
    async fn health_reports_shutdown() {
        let server = make_server();
        server.shutdown_coordinator().shutdown();
        let (_, body) = get_body(server.router(), "/health").await;
        let parsed: serde_json::Value = serde_json::from_str(&body).unwrap();
        assert_eq!(parsed["status"], "shutting_down");
    }

    #[tokio::test]
    async fn metrics_without_recorder_is_404() {
        let (status, _) = get_body(make_server().router(), "/metrics").await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn metrics_with_local_recorder_renders() {
        let handle = metrics_exporter_prometheus::PrometheusBuilder::new()
            .build_recorder()
            .handle();
        let server = TandemServer::new(ServerConfig::default(), Some(handle));
        let (status, _) = get_body(server.router(), "/metrics").await;
        assert_eq!(status, StatusCode::OK);
    }

    #[tokio::test]
    async fn ws_without_upgrade_headers_is_rejected() {
        let (status, _) = get_body(make_server().router(), "/ws").await;
        assert!(status.is_client_error());
    }

    #[tokio::test]
    async fn unknown_route_returns_404() {
        let (status, _) = get_body(make_server().router(), "/nonexistent").await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn cors_is_permissive() {
        let req = Request::builder()
            .uri("/health")
            .header("origin", "https://example.com")
            .body(Body::empty())
            .unwrap();
        let resp = make_server().router().oneshot(req).await.unwrap();
        assert_eq!(
            resp.headers()["access-control-allow-origin"],
            "*"
        );
    }

    #[tokio::test]
    async fn listen_binds_ephemeral_port_and_shuts_down() {
        let server = make_server();
        let (addr, handle) = server.listen().await.unwrap();
        assert_ne!(addr.port(), 0);
        assert!(server.shutdown().await);
        handle.await.unwrap();
    }

    #[test]
    fn slots_are_shared_across_modes_and_released() {
        let server = TandemServer::new(
            ServerConfig {
                max_connections: 2,
                ..ServerConfig::default()
            },
            None,
        );
        let pairing = reserve_upgrade(&server.state, "pairing").unwrap();
        let broadcast = reserve_upgrade(&server.state, "broadcast").unwrap();
        assert!(reserve_upgrade(&server.state, "pairing").is_err());

        drop(pairing);
        let again = reserve_upgrade(&server.state, "pairing").unwrap();
        drop((again, broadcast));
        assert_eq!(server.state.slots.available_permits(), 2);
    }

    #[test]
    fn concurrent_reservations_never_exceed_limit() {
        let server = TandemServer::new(
            ServerConfig {
                max_connections: 5,
                ..ServerConfig::default()
            },
            None,
        );
        let granted = std::sync::Mutex::new(Vec::new());
        std::thread::scope(|s| {
            for _ in 0..16 {
                let _ = s.spawn(|| {
                    if let Ok(slot) = reserve_upgrade(&server.state, "pairing") {
                        granted.lock().unwrap().push(slot);
                    }
                });
            }
        });
        assert_eq!(granted.lock().unwrap().len(), 5);
    }

    #[test]
    fn shutdown_refuses_upgrades() {
        let server = make_server();
        server.shutdown_coordinator().shutdown();
        let refused = reserve_upgrade(&server.state, "pairing").unwrap_err();
        assert_eq!(refused.status(), StatusCode::SERVICE_UNAVAILABLE);
    }
}
