//! `ShuttleServer`: Axum HTTP + WebSocket server.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use axum::Router;
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Json, Response};
use axum::routing::{get, post};
use metrics_exporter_prometheus::PrometheusHandle;
use shuttle_auth::CredentialVerifier;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{error, info};

use crate::config::ServerConfig;
use crate::health::{self, HealthResponse};
use crate::ingest;
use crate::metrics;
use crate::shutdown::ShutdownCoordinator;
use crate::websocket::fanout::FanoutEngine;
use crate::websocket::handler;
use crate::websocket::registry::SubscriptionRegistry;

/// Shared state accessible from Axum handlers.
#[derive(Clone)]
pub struct AppState {
    /// Who is watching which bus.
    pub registry: Arc<SubscriptionRegistry>,
    /// Delivers location events to the registry's subscribers.
    pub fanout: Arc<FanoutEngine>,
    /// Checks subscriber credentials during the handshake.
    pub verifier: Arc<dyn CredentialVerifier>,
    /// Shutdown coordinator.
    pub shutdown: Arc<ShutdownCoordinator>,
    /// Server configuration.
    pub config: Arc<ServerConfig>,
    /// When the server started.
    pub start_time: Instant,
    /// Prometheus handle, when a recorder is installed.
    pub metrics: Option<PrometheusHandle>,
}

/// The shuttle broadcast server.
pub struct ShuttleServer {
    config: Arc<ServerConfig>,
    registry: Arc<SubscriptionRegistry>,
    fanout: Arc<FanoutEngine>,
    verifier: Arc<dyn CredentialVerifier>,
    shutdown: Arc<ShutdownCoordinator>,
    start_time: Instant,
    metrics: Option<PrometheusHandle>,
}

impl ShuttleServer {
    /// Create a new server.
    pub fn new(config: ServerConfig, verifier: Arc<dyn CredentialVerifier>) -> Self {
        let registry = Arc::new(SubscriptionRegistry::new(config.registry_limits()));
        let fanout = Arc::new(FanoutEngine::new(
            Arc::clone(&registry),
            config.delivery_timeout(),
        ));
        Self {
            config: Arc::new(config),
            registry,
            fanout,
            verifier,
            shutdown: Arc::new(ShutdownCoordinator::new()),
            start_time: Instant::now(),
            metrics: None,
        }
    }

    /// Serve `/metrics` from `handle`.
    #[must_use]
    pub fn with_metrics(mut self, handle: PrometheusHandle) -> Self {
        self.metrics = Some(handle);
        self
    }

    fn state(&self) -> AppState {
        AppState {
            registry: Arc::clone(&self.registry),
            fanout: Arc::clone(&self.fanout),
            verifier: Arc::clone(&self.verifier),
            shutdown: Arc::clone(&self.shutdown),
            config: Arc::clone(&self.config),
            start_time: self.start_time,
            metrics: self.metrics.clone(),
        }
    }

    /// Build the Axum router with all routes.
    pub fn router(&self) -> Router {
        let mut router = Router::new()
            .route("/", get(health_handler))
            .route("/health", get(health_handler))
            .route("/ws/subscribe/{bus_id}", get(handler::subscribe_bus));

        if self.config.global_channel {
            router = router.route("/ws", get(handler::subscribe_global));
        }
        if self.config.ingest_enabled {
            router = router.route("/buses/{bus_id}/location", post(ingest::ingest_location));
        }
        if self.metrics.is_some() {
            router = router.route("/metrics", get(metrics_handler));
        }

        router
            .layer(CorsLayer::permissive())
            .layer(TraceLayer::new_for_http())
            .with_state(self.state())
    }

    /// Bind and start serving in the background.
    ///
    /// Returns the bound address and the serve task, which finishes once
    /// the shutdown token is cancelled and in-flight requests drain.
    pub async fn listen(&self) -> std::io::Result<(SocketAddr, JoinHandle<()>)> {
        let listener = TcpListener::bind(self.config.bind_addr()).await?;
        let addr = listener.local_addr()?;
        let router = self.router();
        let token = self.shutdown.token();

        info!(
            %addr,
            per_bus = self.config.max_subscribers_per_bus,
            global_channel = self.config.global_channel,
            ingest = self.config.ingest_enabled,
            "shuttle server listening"
        );

        let handle = tokio::spawn(async move {
            let served = axum::serve(listener, router)
                .with_graceful_shutdown(async move { token.cancelled().await })
                .await;
            if let Err(e) = served {
                error!(error = %e, "server stopped with error");
            }
        });
        Ok((addr, handle))
    }

    /// Get the subscription registry.
    pub fn registry(&self) -> &Arc<SubscriptionRegistry> {
        &self.registry
    }

    /// Get the fanout engine.
    pub fn fanout(&self) -> &Arc<FanoutEngine> {
        &self.fanout
    }

    /// Get the shutdown coordinator.
    pub fn shutdown(&self) -> &Arc<ShutdownCoordinator> {
        &self.shutdown
    }

    /// Get the server configuration.
    pub fn config(&self) -> &ServerConfig {
        &self.config
    }
}

/// GET /health
async fn health_handler(State(state): State<AppState>) -> Json<HealthResponse> {
    let resp = health::health_check(
        state.start_time,
        state.registry.connection_count(),
        state.registry.channel_count(),
    );
    Json(resp)
}

/// GET /metrics
async fn metrics_handler(State(state): State<AppState>) -> Response {
    match &state.metrics {
        Some(handle) => metrics::render(handle).into_response(),
        None => StatusCode::NOT_FOUND.into_response(),
    }
}
