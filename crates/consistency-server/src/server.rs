//! Listener setup, router and the handle that owns the running server.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::extract::ws::WebSocketUpgrade;
use axum::extract::State;
use axum::http::{header, StatusCode};
use axum::response::IntoResponse;
use axum::routing::get;
use axum::{Json, Router};
use consistency_core::{ClientProtocol, IngestSource, JsonProtocol, Registry, SessionId};
use consistency_settings::{ClientSettings, ConsistencySettings};
use metrics_exporter_prometheus::PrometheusHandle;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tower_http::trace::TraceLayer;
use tracing::{error, info};

use crate::client;
use crate::error::ServerError;
use crate::health;
use crate::ingress::{self, IngressContext};
use crate::metrics::RESOURCES_ACTIVE;
use crate::shutdown::ShutdownCoordinator;

/// Shared application state passed to axum handlers.
#[derive(Clone)]
pub struct AppState {
    /// The subscription registry.
    pub registry: Arc<Registry>,
    /// Client channel wire format.
    pub protocol: Arc<dyn ClientProtocol>,
    /// Client channel limits and timers.
    pub client: Arc<ClientSettings>,
    /// Cancelled on shutdown; each connection derives a child token.
    pub shutdown: CancellationToken,
    /// Tracks connection tasks so shutdown can wait for their teardown.
    pub tracker: TaskTracker,
    /// Open WebSocket connections.
    pub connections: Arc<AtomicUsize>,
    /// Server start time (for uptime).
    pub start_time: Instant,
    /// Prometheus renderer, when a recorder is installed.
    pub metrics: Option<PrometheusHandle>,
}

impl AppState {
    /// State with default settings around `registry`. Handy for tests.
    pub fn new(registry: Arc<Registry>, client: ClientSettings) -> Self {
        Self {
            registry,
            protocol: Arc::new(JsonProtocol),
            client: Arc::new(client),
            shutdown: CancellationToken::new(),
            tracker: TaskTracker::new(),
            connections: Arc::new(AtomicUsize::new(0)),
            start_time: Instant::now(),
            metrics: None,
        }
    }
}

/// Build the axum router with all routes.
pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/", get(ws_handler))
        .route("/ws", get(ws_handler))
        .route("/health", get(health_handler))
        .route("/metrics", get(metrics_handler))
        .with_state(state)
        .layer(TraceLayer::new_for_http())
}

/// WebSocket upgrade handler.
async fn ws_handler(ws: WebSocketUpgrade, State(state): State<AppState>) -> impl IntoResponse {
    let max_message_bytes = state.client.max_message_bytes;
    ws.max_message_size(max_message_bytes)
        .on_upgrade(move |socket| {
            let tracker = state.tracker.clone();
            tracker.track_future(client::handle_client_connection(
                socket,
                SessionId::new(),
                state,
            ))
        })
}

async fn health_handler(State(state): State<AppState>) -> impl IntoResponse {
    Json(health::health_check(
        state.start_time,
        state.connections.load(Ordering::Relaxed),
        state.registry.resource_count(),
        state.shutdown.is_cancelled(),
    ))
}

async fn metrics_handler(State(state): State<AppState>) -> impl IntoResponse {
    let Some(handle) = state.metrics.as_ref() else {
        return (StatusCode::NOT_FOUND, "metrics recorder not installed").into_response();
    };
    metrics::gauge!(RESOURCES_ACTIVE).set(client::as_gauge(state.registry.resource_count()));
    (
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        handle.render(),
    )
        .into_response()
}

/// Configures and starts both listeners.
pub struct ServerBuilder {
    settings: ConsistencySettings,
    registry: Option<Arc<Registry>>,
    client_protocol: Arc<dyn ClientProtocol>,
    ingest_source: Arc<dyn IngestSource>,
    metrics: Option<PrometheusHandle>,
    shutdown: ShutdownCoordinator,
}

impl ServerBuilder {
    /// Builder with the JSON codec on both channels.
    pub fn new(settings: ConsistencySettings) -> Self {
        Self {
            settings,
            registry: None,
            client_protocol: Arc::new(JsonProtocol),
            ingest_source: Arc::new(JsonProtocol),
            metrics: None,
            shutdown: ShutdownCoordinator::new(),
        }
    }

    /// Replace the client channel wire format.
    #[must_use]
    pub fn client_protocol(mut self, protocol: Arc<dyn ClientProtocol>) -> Self {
        self.client_protocol = protocol;
        self
    }

    /// Replace the backend frame decoder.
    #[must_use]
    pub fn ingest_source(mut self, source: Arc<dyn IngestSource>) -> Self {
        self.ingest_source = source;
        self
    }

    /// Serve `/metrics` from this handle.
    #[must_use]
    pub fn metrics_handle(mut self, handle: PrometheusHandle) -> Self {
        self.metrics = Some(handle);
        self
    }

    /// Use an existing registry instead of a fresh one.
    #[must_use]
    pub fn registry(mut self, registry: Arc<Registry>) -> Self {
        self.registry = Some(registry);
        self
    }

    /// Share a shutdown coordinator with the caller.
    #[must_use]
    pub fn shutdown(mut self, shutdown: ShutdownCoordinator) -> Self {
        self.shutdown = shutdown;
        self
    }

    /// Bind both listeners and spawn the serving tasks.
    pub async fn start(self) -> Result<ServerHandle, ServerError> {
        let client_cfg = &self.settings.client;
        let backend_cfg = &self.settings.backend;

        let client_bind = format!("{}:{}", client_cfg.host, client_cfg.port);
        let client_listener = TcpListener::bind((client_cfg.host.as_str(), client_cfg.port))
            .await
            .map_err(|e| ServerError::bind("client", client_bind, e))?;
        let backend_bind = format!("{}:{}", backend_cfg.host, backend_cfg.port);
        let backend_listener = TcpListener::bind((backend_cfg.host.as_str(), backend_cfg.port))
            .await
            .map_err(|e| ServerError::bind("backend", backend_bind, e))?;

        let client_addr = client_listener.local_addr()?;
        let backend_addr = backend_listener.local_addr()?;

        let registry = self.registry.unwrap_or_default();
        let tracker = TaskTracker::new();
        let token = self.shutdown.token();

        let state = AppState {
            registry: Arc::clone(&registry),
            protocol: self.client_protocol,
            client: Arc::new(self.settings.client.clone()),
            shutdown: token.clone(),
            tracker: tracker.clone(),
            connections: Arc::new(AtomicUsize::new(0)),
            start_time: Instant::now(),
            metrics: self.metrics,
        };
        let router = build_router(state);

        let serve_token = token.clone();
        let http = tokio::spawn(async move {
            let result = axum::serve(client_listener, router)
                .with_graceful_shutdown(async move { serve_token.cancelled().await })
                .await;
            if let Err(e) = result {
                error!(error = %e, "client listener failed");
            }
        });

        let ingress_ctx = IngressContext {
            registry: Arc::clone(&registry),
            source: self.ingest_source,
            max_frame_bytes: self.settings.backend.max_frame_bytes,
            shutdown: token,
            tracker: tracker.clone(),
        };
        let ingress = tokio::spawn(ingress::run_ingress(backend_listener, ingress_ctx));

        info!(%client_addr, %backend_addr, "consistency server started");

        Ok(ServerHandle {
            client_addr,
            backend_addr,
            registry,
            shutdown: self.shutdown,
            tracker,
            tasks: vec![http, ingress],
        })
    }
}

/// Start a server with the default codecs.
pub async fn start(settings: ConsistencySettings) -> Result<ServerHandle, ServerError> {
    ServerBuilder::new(settings).start().await
}

/// Handle returned by [`ServerBuilder::start`]. Owns the serving tasks.
pub struct ServerHandle {
    client_addr: SocketAddr,
    backend_addr: SocketAddr,
    registry: Arc<Registry>,
    shutdown: ShutdownCoordinator,
    tracker: TaskTracker,
    tasks: Vec<JoinHandle<()>>,
}

impl ServerHandle {
    /// Address the WebSocket/HTTP listener is bound to.
    pub fn client_addr(&self) -> SocketAddr {
        self.client_addr
    }

    /// Address the backend ingress listener is bound to.
    pub fn backend_addr(&self) -> SocketAddr {
        self.backend_addr
    }

    /// The live registry.
    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    /// The coordinator whose token stops everything.
    pub fn coordinator(&self) -> &ShutdownCoordinator {
        &self.shutdown
    }

    /// Stop accepting, close every connection and wait for teardown.
    ///
    /// Returns `false` if something was still running when `timeout`
    /// expired.
    pub async fn shutdown(self, timeout: Option<Duration>) -> bool {
        let _ = self.tracker.close();
        let tracker = self.tracker.clone();
        let mut tasks = self.tasks;
        tasks.push(tokio::spawn(async move { tracker.wait().await }));

        let finished = self.shutdown.graceful_shutdown(tasks, timeout).await;
        info!(
            resources = self.registry.resource_count(),
            finished, "consistency server stopped"
        );
        finished
    }
}
