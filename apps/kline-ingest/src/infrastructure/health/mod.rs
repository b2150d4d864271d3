//! Health Check and Metrics Endpoint
//!
//! HTTP endpoint for health checks, per-symbol subscription status,
//! Prometheus metrics and runtime symbol management.
//!
//! # Endpoints
//!
//! - `GET /health` - JSON status, pipeline counters and symbol states
//! - `GET /healthz` - liveness probe (simple OK)
//! - `GET /readyz` - readiness probe (at least one symbol subscribed)
//! - `GET /metrics` - Prometheus metrics in text format
//! - `PUT /symbols/{symbol}` - start tracking a symbol (or revive a down one)
//! - `DELETE /symbols/{symbol}` - stop tracking a symbol and drop its series state

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::{get, put};
use axum::{Json, Router};
use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

use crate::application::services::{PipelineStats, PipelineStatsSnapshot};
use crate::domain::candle::Symbol;
use crate::infrastructure::binance::{ConnectionStatus, SubscriptionState};
use crate::infrastructure::metrics::get_metrics_handle;
use crate::infrastructure::supervisor::{
    StreamSupervisor, SupervisorError, publish_connection_gauges,
};

// =============================================================================
// Health Response Types
// =============================================================================

/// Health check response.
#[derive(Debug, Clone, Serialize)]
pub struct HealthResponse {
    /// Overall status: "healthy", "degraded", or "unhealthy".
    pub status: HealthStatus,
    /// Service version.
    pub version: String,
    /// Server uptime in seconds.
    pub uptime_secs: u64,
    /// Current time.
    pub current_time: DateTime<Utc>,
    /// Pipeline counters.
    pub pipeline: PipelineStatsSnapshot,
    /// One entry per tracked symbol.
    pub subscriptions: Vec<SubscriptionState>,
}

/// Overall health status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    /// Every symbol subscribed.
    Healthy,
    /// Some symbols subscribed.
    Degraded,
    /// No symbol subscribed.
    Unhealthy,
}

// =============================================================================
// Health Server State
// =============================================================================

/// Shared state for the health server.
pub struct HealthServerState {
    version: String,
    started_at: Instant,
    supervisor: Arc<StreamSupervisor>,
    stats: Arc<PipelineStats>,
}

impl HealthServerState {
    /// Create new health server state.
    #[must_use]
    pub fn new(
        version: String,
        supervisor: Arc<StreamSupervisor>,
        stats: Arc<PipelineStats>,
    ) -> Self {
        Self {
            version,
            started_at: Instant::now(),
            supervisor,
            stats,
        }
    }
}

// =============================================================================
// Health Server
// =============================================================================

/// Health check HTTP server.
pub struct HealthServer {
    port: u16,
    state: Arc<HealthServerState>,
    cancel: CancellationToken,
}

impl HealthServer {
    /// Create a new health server.
    #[must_use]
    pub const fn new(
        port: u16,
        state: Arc<HealthServerState>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            port,
            state,
            cancel,
        }
    }

    /// Run the health server until cancelled.
    ///
    /// # Errors
    ///
    /// Returns `HealthServerError` if binding fails or the HTTP server
    /// encounters a fatal error while running.
    pub async fn run(self) -> Result<(), HealthServerError> {
        let app = router(self.state);

        let addr = SocketAddr::from(([0, 0, 0, 0], self.port));
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|e| HealthServerError::BindFailed(self.port, e.to_string()))?;

        tracing::info!(port = self.port, "Health server listening");

        axum::serve(listener, app)
            .with_graceful_shutdown(self.cancel.cancelled_owned())
            .await
            .map_err(|e| HealthServerError::ServerFailed(e.to_string()))?;

        tracing::info!("Health server stopped");
        Ok(())
    }
}

fn router(state: Arc<HealthServerState>) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/healthz", get(liveness_handler))
        .route("/readyz", get(readiness_handler))
        .route("/metrics", get(metrics_handler))
        .route(
            "/symbols/{symbol}",
            put(add_symbol_handler).delete(remove_symbol_handler),
        )
        .with_state(state)
}

// =============================================================================
// HTTP Handlers
// =============================================================================

async fn health_handler(State(state): State<Arc<HealthServerState>>) -> impl IntoResponse {
    let response = build_health_response(&state);
    let status_code = match response.status {
        HealthStatus::Healthy | HealthStatus::Degraded => StatusCode::OK,
        HealthStatus::Unhealthy => StatusCode::SERVICE_UNAVAILABLE,
    };
    (status_code, Json(response))
}

async fn liveness_handler() -> impl IntoResponse {
    (StatusCode::OK, "OK")
}

async fn readiness_handler(State(state): State<Arc<HealthServerState>>) -> impl IntoResponse {
    let is_ready = state
        .supervisor
        .snapshot()
        .iter()
        .any(|s| s.status == ConnectionStatus::Subscribed);

    if is_ready {
        (StatusCode::OK, "READY")
    } else {
        (StatusCode::SERVICE_UNAVAILABLE, "NOT READY")
    }
}

async fn metrics_handler(State(state): State<Arc<HealthServerState>>) -> impl IntoResponse {
    publish_connection_gauges(&state.supervisor.snapshot());

    get_metrics_handle().map_or_else(
        || {
            (
                StatusCode::SERVICE_UNAVAILABLE,
                [("content-type", "text/plain")],
                "Metrics not initialized".to_string(),
            )
        },
        |handle| {
            (
                StatusCode::OK,
                [("content-type", "text/plain; version=0.0.4; charset=utf-8")],
                handle.render(),
            )
        },
    )
}

async fn add_symbol_handler(
    State(state): State<Arc<HealthServerState>>,
    Path(raw): Path<String>,
) -> impl IntoResponse {
    let symbol = match Symbol::new(&raw) {
        Ok(symbol) => symbol,
        Err(e) => return (StatusCode::BAD_REQUEST, e.to_string()),
    };
    match state.supervisor.add_symbol(symbol.clone()) {
        Ok(()) => {
            tracing::info!(symbol = %symbol, "Symbol added over HTTP");
            (StatusCode::ACCEPTED, format!("tracking {symbol}"))
        }
        Err(e) => (supervisor_error_status(&e), e.to_string()),
    }
}

async fn remove_symbol_handler(
    State(state): State<Arc<HealthServerState>>,
    Path(raw): Path<String>,
) -> impl IntoResponse {
    let symbol = match Symbol::new(&raw) {
        Ok(symbol) => symbol,
        Err(e) => return (StatusCode::BAD_REQUEST, e.to_string()),
    };
    match state.supervisor.remove_symbol(&symbol) {
        Ok(()) => {
            tracing::info!(symbol = %symbol, "Symbol removed over HTTP");
            (StatusCode::OK, format!("removed {symbol}"))
        }
        Err(e) => (supervisor_error_status(&e), e.to_string()),
    }
}

const fn supervisor_error_status(error: &SupervisorError) -> StatusCode {
    match error {
        SupervisorError::AlreadyTracked(_) => StatusCode::CONFLICT,
        SupervisorError::NotTracked(_) => StatusCode::NOT_FOUND,
        SupervisorError::Stopped => StatusCode::SERVICE_UNAVAILABLE,
        SupervisorError::EmptySymbolSet
        | SupervisorError::EventsTaken
        | SupervisorError::RemovalsTaken => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

fn build_health_response(state: &HealthServerState) -> HealthResponse {
    let subscriptions = state.supervisor.snapshot();
    HealthResponse {
        status: determine_health_status(&subscriptions),
        version: state.version.clone(),
        uptime_secs: state.started_at.elapsed().as_secs(),
        current_time: Utc::now(),
        pipeline: state.stats.snapshot(),
        subscriptions,
    }
}

fn determine_health_status(subscriptions: &[SubscriptionState]) -> HealthStatus {
    let subscribed = subscriptions
        .iter()
        .filter(|s| s.status == ConnectionStatus::Subscribed)
        .count();

    match subscribed {
        0 => HealthStatus::Unhealthy,
        n if n == subscriptions.len() => HealthStatus::Healthy,
        _ => HealthStatus::Degraded,
    }
}

// =============================================================================
// Errors
// =============================================================================

/// Health server errors.
#[derive(Debug, thiserror::Error)]
pub enum HealthServerError {
    /// Failed to bind to port.
    #[error("failed to bind to port {0}: {1}")]
    BindFailed(u16, String),

    /// Server error.
    #[error("server error: {0}")]
    ServerFailed(String),
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::candle::{Interval, SeriesKey};
    use crate::infrastructure::binance::testing::{ScriptedTransport, Step};
    use crate::infrastructure::supervisor::SupervisorConfig;
    use axum::body::Body;
    use futures::StreamExt;
    use axum::http::Request;
    use tower::ServiceExt;

    fn state(symbol: &str, status: ConnectionStatus) -> SubscriptionState {
        let mut state = SubscriptionState::new(Symbol::new(symbol).unwrap());
        state.status = status;
        state
    }

    #[test]
    fn health_status_serialization() {
        assert_eq!(
            serde_json::to_string(&HealthStatus::Healthy).unwrap(),
            "\"healthy\""
        );
        assert_eq!(
            serde_json::to_string(&HealthStatus::Unhealthy).unwrap(),
            "\"unhealthy\""
        );
    }

    #[test]
    fn determine_status_all_subscribed() {
        let states = [
            state("BTCUSDT", ConnectionStatus::Subscribed),
            state("ETHUSDT", ConnectionStatus::Subscribed),
        ];
        assert_eq!(determine_health_status(&states), HealthStatus::Healthy);
    }

    #[test]
    fn determine_status_partial() {
        let states = [
            state("BTCUSDT", ConnectionStatus::Subscribed),
            state("BADCOIN", ConnectionStatus::Down),
        ];
        assert_eq!(determine_health_status(&states), HealthStatus::Degraded);
    }

    #[test]
    fn determine_status_none_subscribed() {
        let states = [state("BTCUSDT", ConnectionStatus::Reconnecting)];
        assert_eq!(determine_health_status(&states), HealthStatus::Unhealthy);
        assert_eq!(determine_health_status(&[]), HealthStatus::Unhealthy);
    }

    fn state_for(supervisor: Arc<StreamSupervisor>) -> Arc<HealthServerState> {
        Arc::new(HealthServerState::new(
            "test".to_string(),
            supervisor,
            Arc::new(PipelineStats::default()),
        ))
    }

    fn idle_state() -> Arc<HealthServerState> {
        let supervisor =
            StreamSupervisor::new(SupervisorConfig::default(), ScriptedTransport::new());
        state_for(Arc::new(supervisor))
    }

    fn request(method: &str, uri: &str) -> Request<Body> {
        Request::builder()
            .method(method)
            .uri(uri)
            .body(Body::empty())
            .unwrap()
    }

    #[tokio::test]
    async fn liveness_always_ok() {
        let response = router(idle_state())
            .oneshot(Request::get("/healthz").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn not_ready_without_subscriptions() {
        let app = router(idle_state());

        let ready = app
            .clone()
            .oneshot(Request::get("/readyz").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(ready.status(), StatusCode::SERVICE_UNAVAILABLE);

        let health = app
            .oneshot(Request::get("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(health.status(), StatusCode::SERVICE_UNAVAILABLE);
    }

    #[tokio::test]
    async fn symbols_are_managed_at_runtime() {
        let transport = ScriptedTransport::new();
        transport.script("BTCUSDT", vec![vec![Step::Ack, Step::Hold]]);
        let supervisor = Arc::new(StreamSupervisor::new(SupervisorConfig::default(), transport));
        let mut removals = supervisor.removals().unwrap();
        let app = router(state_for(Arc::clone(&supervisor)));

        let added = app.clone().oneshot(request("PUT", "/symbols/btcusdt")).await.unwrap();
        assert_eq!(added.status(), StatusCode::ACCEPTED);
        assert_eq!(supervisor.symbols(), vec![Symbol::new("BTCUSDT").unwrap()]);

        let again = app.clone().oneshot(request("PUT", "/symbols/BTCUSDT")).await.unwrap();
        assert_eq!(again.status(), StatusCode::CONFLICT);

        let removed = app.clone().oneshot(request("DELETE", "/symbols/BTCUSDT")).await.unwrap();
        assert_eq!(removed.status(), StatusCode::OK);
        assert!(supervisor.symbols().is_empty());
        assert_eq!(
            removals.next().await,
            Some(SeriesKey {
                symbol: Symbol::new("BTCUSDT").unwrap(),
                interval: Interval::OneMinute,
            })
        );

        let missing = app.clone().oneshot(request("DELETE", "/symbols/BTCUSDT")).await.unwrap();
        assert_eq!(missing.status(), StatusCode::NOT_FOUND);

        let invalid = app.oneshot(request("PUT", "/symbols/BTC-USD")).await.unwrap();
        assert_eq!(invalid.status(), StatusCode::BAD_REQUEST);

        supervisor.stop().await;
    }
}
