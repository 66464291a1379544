//! Health Check and Metrics Endpoint
//!
//! HTTP endpoint for health checks, ingestion status reporting, and Prometheus metrics.
//! Used by container orchestrators, load balancers, and monitoring systems.
//!
//! # Endpoints
//!
//! - `GET /health` - Returns JSON health status
//! - `GET /healthz` - Kubernetes liveness probe (simple OK)
//! - `GET /readyz` - Kubernetes readiness probe (checks the alert feed)
//! - `GET /metrics` - Prometheus metrics in text format

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use axum::{Json, Router, extract::State, http::StatusCode, response::IntoResponse, routing::get};
use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

use crate::infrastructure::broadcast::DistributionHub;
use crate::infrastructure::client::{ConnectionContext, ConnectionHealth, ConnectionState};
use crate::infrastructure::metrics::get_metrics_handle;
use crate::infrastructure::poller::{Poller, PollerHealth};

/// Consecutive failures after which the feed is reported unhealthy.
const UNHEALTHY_FAILURES: u32 = 5;

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
    /// Upstream poller status (relay only).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub poller: Option<PollerHealth>,
    /// Upstream stream connection (gateway only).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub upstream: Option<ConnectionHealth>,
    /// Subscriber statistics.
    pub subscribers: SubscriberStatus,
}

/// Overall health status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    /// All systems operational.
    Healthy,
    /// Feed recovering or not yet confirmed.
    Degraded,
    /// Feed unavailable.
    Unhealthy,
}

/// Subscriber statistics.
#[derive(Debug, Clone, Serialize)]
pub struct SubscriberStatus {
    /// Registered subscribers.
    pub active: usize,
    /// Alerts published since startup.
    pub published_total: u64,
    /// Events dropped from full queues since startup.
    pub dropped_total: u64,
}

// =============================================================================
// Health Server State
// =============================================================================

/// Where alerts come from, for health reporting.
#[derive(Clone)]
pub enum FeedProbe {
    /// The relay's upstream poller.
    Poller(Arc<Poller>),
    /// The gateway's outbound stream client.
    Stream(Arc<ConnectionContext>),
}

/// Shared state for the health server.
pub struct HealthServerState {
    version: String,
    started_at: Instant,
    feed: FeedProbe,
    hub: DistributionHub,
}

impl HealthServerState {
    /// Create new health server state.
    #[must_use]
    pub fn new(version: String, feed: FeedProbe, hub: DistributionHub) -> Self {
        Self {
            version,
            started_at: Instant::now(),
            feed,
            hub,
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
    pub const fn new(port: u16, state: Arc<HealthServerState>, cancel: CancellationToken) -> Self {
        Self {
            port,
            state,
            cancel,
        }
    }

    /// Routes served by the health server.
    pub fn router(state: Arc<HealthServerState>) -> Router {
        Router::new()
            .route("/health", get(health_handler))
            .route("/healthz", get(liveness_handler))
            .route("/readyz", get(readiness_handler))
            .route("/metrics", get(metrics_handler))
            .with_state(state)
    }

    /// Run the health server until cancelled.
    ///
    /// # Errors
    ///
    /// Returns `HealthServerError` if binding fails or the HTTP server
    /// encounters a fatal error while running.
    pub async fn run(self) -> Result<(), HealthServerError> {
        let app = Self::router(self.state);

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
    let response = build_health_response(&state);

    if response.status == HealthStatus::Unhealthy {
        (StatusCode::SERVICE_UNAVAILABLE, "NOT READY")
    } else {
        (StatusCode::OK, "READY")
    }
}

async fn metrics_handler() -> impl IntoResponse {
    get_metrics_handle().map_or_else(
        || {
            (
                StatusCode::SERVICE_UNAVAILABLE,
                [("content-type", "text/plain")],
                "Metrics not initialized".to_string(),
            )
        },
        |handle| {
            let body = handle.render();
            (
                StatusCode::OK,
                [("content-type", "text/plain; version=0.0.4; charset=utf-8")],
                body,
            )
        },
    )
}

fn build_health_response(state: &HealthServerState) -> HealthResponse {
    let (status, poller, upstream) = match &state.feed {
        FeedProbe::Poller(poller) => {
            let health = poller.health();
            (poller_status(&health), Some(health), None)
        }
        FeedProbe::Stream(context) => {
            let health = context.health();
            (stream_status(&health), None, Some(health))
        }
    };
    let hub_stats = state.hub.stats();

    HealthResponse {
        status,
        version: state.version.clone(),
        uptime_secs: state.started_at.elapsed().as_secs(),
        current_time: Utc::now(),
        poller,
        upstream,
        subscribers: SubscriberStatus {
            active: hub_stats.subscribers,
            published_total: hub_stats.published_total,
            dropped_total: hub_stats.dropped_total,
        },
    }
}

fn poller_status(health: &PollerHealth) -> HealthStatus {
    match (health.consecutive_failures, health.last_success_at) {
        (0, Some(_)) => HealthStatus::Healthy,
        (failures, _) if failures >= UNHEALTHY_FAILURES => HealthStatus::Unhealthy,
        _ => HealthStatus::Degraded,
    }
}

fn stream_status(health: &ConnectionHealth) -> HealthStatus {
    match health.state {
        ConnectionState::Connected => HealthStatus::Healthy,
        ConnectionState::Disconnected => HealthStatus::Unhealthy,
        ConnectionState::Connecting | ConnectionState::Retrying
            if health.consecutive_failures >= UNHEALTHY_FAILURES =>
        {
            HealthStatus::Unhealthy
        }
        ConnectionState::Connecting | ConnectionState::Retrying => HealthStatus::Degraded,
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
