use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::WebSocketUpgrade;
use axum::extract::State;
use axum::response::{IntoResponse, Json};
use axum::routing::get;
use axum::Router;
use chrono::{DateTime, Utc};
use murmur_core::{TokenVerifier, UpstreamCredentials};
use murmur_settings::{MurmurSettings, UpstreamSettings};
use murmur_telemetry::RelayMetrics;
use murmur_upstream::{AudioParams, DriverConfig, TtsDriver};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tower_http::cors::CorsLayer;
use tracing::{info, warn};

use crate::gateway::Gateway;
use crate::health::{self, HealthResponse};
use crate::supervisor::{self, TimeoutPolicy};

const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

/// Server configuration.
#[derive(Clone, Debug)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    pub path: String,
    pub max_send_queue: usize,
    pub max_connections: usize,
    pub timeouts: TimeoutPolicy,
}

impl ServerConfig {
    pub fn from_settings(settings: &MurmurSettings) -> Self {
        Self {
            host: settings.server.host.clone(),
            port: settings.server.port,
            path: settings.server.path.clone(),
            max_send_queue: settings.server.send_queue,
            max_connections: settings.limits.max_connections,
            timeouts: TimeoutPolicy::from(&settings.timeouts),
        }
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self::from_settings(&MurmurSettings::default())
    }
}

/// Driver configuration from the `upstream` settings block.
pub fn driver_config(upstream: &UpstreamSettings) -> DriverConfig {
    DriverConfig {
        endpoint: upstream.endpoint.clone(),
        credentials: UpstreamCredentials::new(upstream.app_key.clone(), upstream.access_key.clone()),
        event_timeout: upstream.event_timeout(),
        audio: AudioParams {
            format: upstream.audio_format.clone(),
            sample_rate: upstream.sample_rate,
            enable_timestamp: upstream.enable_timestamp,
        },
        sentence_terminator: upstream.terminator().unwrap_or('。'),
    }
}

/// Shared application state passed to Axum handlers.
#[derive(Clone)]
pub struct AppState {
    pub gateway: Arc<Gateway>,
    pub started_at: DateTime<Utc>,
}

/// Build the Axum router with all routes.
pub fn build_router(state: AppState, ws_path: &str) -> Router {
    Router::new()
        .route(ws_path, get(ws_handler))
        .route("/health", get(health_handler))
        .with_state(state)
        .layer(CorsLayer::permissive())
}

/// Bind and start serving. Returns a handle to shut it down.
pub async fn start(
    config: ServerConfig,
    driver: TtsDriver,
    verifier: Arc<dyn TokenVerifier>,
    metrics: Arc<RelayMetrics>,
) -> Result<ServerHandle, std::io::Error> {
    let gateway = Arc::new(Gateway::new(
        config.max_connections,
        config.max_send_queue,
        Arc::new(driver),
        verifier,
        metrics,
    ));
    let shutdown = CancellationToken::new();

    let supervisor = supervisor::spawn_supervisor(
        Arc::clone(&gateway),
        config.timeouts,
        shutdown.child_token(),
    );

    let state = AppState {
        gateway: Arc::clone(&gateway),
        started_at: Utc::now(),
    };
    let router = build_router(state, &config.path);
    let listener = tokio::net::TcpListener::bind((config.host.as_str(), config.port)).await?;
    let addr = listener.local_addr()?;

    info!(
        %addr,
        path = %config.path,
        max_connections = config.max_connections,
        "relay server started"
    );

    let serve_token = shutdown.clone();
    let server = tokio::spawn(async move {
        let result = axum::serve(listener, router)
            .with_graceful_shutdown(async move { serve_token.cancelled().await })
            .await;
        if let Err(e) = result {
            warn!(error = %e, "server stopped with error");
        }
    });

    Ok(ServerHandle {
        addr,
        gateway,
        shutdown,
        server,
        supervisor,
    })
}

/// Handle returned by `start()`; keeps background tasks alive.
pub struct ServerHandle {
    pub addr: SocketAddr,
    gateway: Arc<Gateway>,
    shutdown: CancellationToken,
    server: JoinHandle<()>,
    supervisor: JoinHandle<()>,
}

impl ServerHandle {
    pub fn port(&self) -> u16 {
        self.addr.port()
    }

    pub fn gateway(&self) -> &Arc<Gateway> {
        &self.gateway
    }

    /// Stop the sweep and the listener, then tear down every connection.
    pub async fn shutdown(self) {
        self.shutdown.cancel();
        let closed = self.gateway.shutdown();
        let _ = self.supervisor.await;
        if tokio::time::timeout(SHUTDOWN_GRACE, self.server).await.is_err() {
            warn!("listener did not stop within {SHUTDOWN_GRACE:?}");
        }
        info!(closed, "relay server stopped");
    }
}

/// WebSocket upgrade handler.
async fn ws_handler(ws: WebSocketUpgrade, State(state): State<AppState>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| state.gateway.accept(socket))
}

/// GET /health
async fn health_handler(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(health::health_check(&state.gateway, state.started_at))
}
