//! Alert HTTP API
//!
//! # Endpoints
//!
//! - `GET /api/alerts-stream` - Server-sent event stream of new alerts
//! - `GET /api/webhook/alerts` - Same stream, legacy path
//! - `GET /api/alerts/current` - Last accepted alert
//! - `GET /api/alerts/history?city=&limit=&since=` - Stored alerts, newest first
//! - `GET /api/alerts/city/{city}?limit=` - Stored alerts for one area
//! - `GET /api/alerts/stats` - Aggregate statistics
//! - `GET /api/alerts/match?cities=a,b&limit=` - Recent alerts matching area names

mod error;

use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;

use axum::extract::{Path, Query, State};
use axum::response::sse::{Event, Sse};
use axum::routing::get;
use axum::{Json, Router};
use chrono::{DateTime, Utc};
use futures_util::Stream;
use serde::{Deserialize, Serialize};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

pub use error::ApiError;

use crate::application::ports::{AlertStats, AlertStore, HistoryQuery};
use crate::domain::alert::Alert;
use crate::domain::matching::CityMatcher;
use crate::infrastructure::broadcast::{DistributionHub, HubEvent, Subscription};
use crate::infrastructure::persistence::run_blocking;
use crate::infrastructure::poller::Poller;
use crate::infrastructure::sse::KEEP_ALIVE;

/// Default and maximum page size for history queries.
pub const DEFAULT_HISTORY_LIMIT: usize = 50;
const MAX_HISTORY_LIMIT: usize = 100;

/// Default and maximum result size for match queries.
pub const DEFAULT_MATCH_LIMIT: usize = 10;
const MAX_MATCH_LIMIT: usize = 50;

/// Stored alerts scanned by match queries.
const MATCH_SCAN_DEPTH: usize = 500;

// =============================================================================
// Router
// =============================================================================

/// Shared state for the alert API.
#[derive(Clone)]
pub struct ApiState {
    store: Arc<dyn AlertStore>,
    hub: DistributionHub,
    poller: Arc<Poller>,
    matcher: CityMatcher,
}

impl ApiState {
    /// Create API state.
    #[must_use]
    pub fn new(
        store: Arc<dyn AlertStore>,
        hub: DistributionHub,
        poller: Arc<Poller>,
        matcher: CityMatcher,
    ) -> Self {
        Self {
            store,
            hub,
            poller,
            matcher,
        }
    }
}

/// Routes serving the live stream of `hub`.
pub fn stream_routes(hub: DistributionHub) -> Router {
    Router::new()
        .route("/api/alerts-stream", get(alert_stream))
        .route("/api/webhook/alerts", get(alert_stream))
        .with_state(hub)
}

/// Full relay API: live stream plus history queries.
pub fn api_routes(state: ApiState) -> Router {
    let queries = Router::new()
        .route("/api/alerts/current", get(current_alert))
        .route("/api/alerts/history", get(alert_history))
        .route("/api/alerts/city/{city}", get(city_history))
        .route("/api/alerts/stats", get(alert_stats))
        .route("/api/alerts/match", get(match_alerts))
        .with_state(state.clone());

    stream_routes(state.hub).merge(queries)
}

// =============================================================================
// Server
// =============================================================================

/// HTTP server for a prepared router.
pub struct ApiServer {
    port: u16,
    router: Router,
    cancel: CancellationToken,
}

impl ApiServer {
    /// Create a server.
    #[must_use]
    pub const fn new(port: u16, router: Router, cancel: CancellationToken) -> Self {
        Self {
            port,
            router,
            cancel,
        }
    }

    /// Run until cancelled.
    ///
    /// # Errors
    ///
    /// Returns `ApiServerError` if binding fails or the server stops with an
    /// error.
    pub async fn run(self) -> Result<(), ApiServerError> {
        let addr = SocketAddr::from(([0, 0, 0, 0], self.port));
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|e| ApiServerError::BindFailed(self.port, e.to_string()))?;

        tracing::info!(port = self.port, "Alert API listening");

        axum::serve(listener, self.router)
            .with_graceful_shutdown(self.cancel.cancelled_owned())
            .await
            .map_err(|e| ApiServerError::ServerFailed(e.to_string()))?;

        tracing::info!("Alert API stopped");
        Ok(())
    }
}

/// API server errors.
#[derive(Debug, thiserror::Error)]
pub enum ApiServerError {
    /// Failed to bind to port.
    #[error("failed to bind to port {0}: {1}")]
    BindFailed(u16, String),

    /// Server error.
    #[error("server error: {0}")]
    ServerFailed(String),
}

// =============================================================================
// Live Stream
// =============================================================================

async fn alert_stream(
    State(hub): State<DistributionHub>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let subscription = hub.subscribe();
    tracing::info!(
        subscriber = subscription.id(),
        subscribers = hub.subscriber_count(),
        "Stream client connected"
    );
    Sse::new(subscription_events(subscription))
}

/// Adapt a hub subscription into SSE events. The subscription is released
/// when the stream is dropped.
fn subscription_events(subscription: Subscription) -> impl Stream<Item = Result<Event, Infallible>> {
    futures_util::stream::unfold(subscription, |mut subscription| async move {
        loop {
            let event = subscription.recv().await?;
            if let Some(event) = to_sse_event(&event) {
                return Some((Ok(event), subscription));
            }
        }
    })
}

fn to_sse_event(event: &HubEvent) -> Option<Event> {
    match event {
        HubEvent::Alert(alert) => match Event::default().json_data(alert.as_ref()) {
            Ok(event) => Some(event),
            Err(e) => {
                tracing::warn!(id = %alert.id, error = %e, "Failed to encode alert");
                None
            }
        },
        HubEvent::KeepAlive => Some(Event::default().data(KEEP_ALIVE)),
    }
}

// =============================================================================
// Queries
// =============================================================================

#[derive(Debug, Deserialize)]
struct HistoryParams {
    city: Option<String>,
    limit: Option<usize>,
    since: Option<String>,
}

#[derive(Debug, Deserialize)]
struct LimitParams {
    limit: Option<usize>,
}

#[derive(Debug, Deserialize)]
struct MatchParams {
    cities: Option<String>,
    limit: Option<usize>,
}

/// List of alerts with its size.
#[derive(Debug, Serialize)]
struct AlertList {
    count: usize,
    alerts: Vec<Alert>,
}

impl From<Vec<Alert>> for AlertList {
    fn from(alerts: Vec<Alert>) -> Self {
        Self {
            count: alerts.len(),
            alerts,
        }
    }
}

#[derive(Debug, Serialize)]
struct MatchResponse {
    queries: Vec<String>,
    matched_areas: Vec<String>,
    count: usize,
    alerts: Vec<Alert>,
}

async fn current_alert(State(state): State<ApiState>) -> Result<Json<Alert>, ApiError> {
    let Some(id) = state.poller.last_alert_id() else {
        return Err(ApiError::NotFound("no alert received yet".to_string()));
    };

    let store = Arc::clone(&state.store);
    let lookup = id.clone();
    run_blocking(move || store.get_by_id(&lookup))
        .await?
        .map(Json)
        .ok_or_else(|| ApiError::NotFound(format!("alert {id}")))
}

async fn alert_history(
    State(state): State<ApiState>,
    Query(params): Query<HistoryParams>,
) -> Result<Json<AlertList>, ApiError> {
    let mut query = HistoryQuery::recent(clamp_limit(
        params.limit,
        DEFAULT_HISTORY_LIMIT,
        MAX_HISTORY_LIMIT,
    ));
    if let Some(city) = params.city.filter(|c| !c.trim().is_empty()) {
        query = query.for_area(city);
    }
    if let Some(since) = params.since {
        query = query.since(parse_since(&since)?);
    }

    Ok(Json(list_history(&state, query).await?.into()))
}

async fn city_history(
    State(state): State<ApiState>,
    Path(city): Path<String>,
    Query(params): Query<LimitParams>,
) -> Result<Json<AlertList>, ApiError> {
    let query = HistoryQuery::recent(clamp_limit(
        params.limit,
        DEFAULT_HISTORY_LIMIT,
        MAX_HISTORY_LIMIT,
    ))
    .for_area(city);

    Ok(Json(list_history(&state, query).await?.into()))
}

async fn alert_stats(State(state): State<ApiState>) -> Result<Json<AlertStats>, ApiError> {
    let store = Arc::clone(&state.store);
    Ok(Json(run_blocking(move || store.stats()).await?))
}

async fn match_alerts(
    State(state): State<ApiState>,
    Query(params): Query<MatchParams>,
) -> Result<Json<MatchResponse>, ApiError> {
    let queries: Vec<String> = params
        .cities
        .as_deref()
        .unwrap_or_default()
        .split(',')
        .map(str::trim)
        .filter(|q| !q.is_empty())
        .map(str::to_string)
        .collect();
    let limit = clamp_limit(params.limit, DEFAULT_MATCH_LIMIT, MAX_MATCH_LIMIT);

    let recent = list_history(&state, HistoryQuery::recent(MATCH_SCAN_DEPTH)).await?;

    let matched_areas = if CityMatcher::matches_everything(&queries) {
        Vec::new()
    } else {
        let known = known_areas(&recent);
        let mut areas: Vec<String> = state.matcher.resolve(&queries, &known).into_iter().collect();
        areas.sort();
        areas
    };

    let mut alerts = state.matcher.filter(&queries, recent);
    alerts.truncate(limit);

    tracing::debug!(queries = ?queries, matches = alerts.len(), "Match query");

    Ok(Json(MatchResponse {
        queries,
        matched_areas,
        count: alerts.len(),
        alerts,
    }))
}

async fn list_history(state: &ApiState, query: HistoryQuery) -> Result<Vec<Alert>, ApiError> {
    let store = Arc::clone(&state.store);
    Ok(run_blocking(move || store.list_history(&query)).await?)
}

/// Distinct normalized area keys across `alerts`, sorted.
fn known_areas(alerts: &[Alert]) -> Vec<String> {
    let mut areas: Vec<String> = alerts.iter().flat_map(Alert::area_keys).collect();
    areas.sort();
    areas.dedup();
    areas
}

fn clamp_limit(requested: Option<usize>, default: usize, max: usize) -> usize {
    requested.unwrap_or(default).clamp(1, max)
}

fn parse_since(raw: &str) -> Result<DateTime<Utc>, ApiError> {
    DateTime::parse_from_rfc3339(raw)
        .map(|ts| ts.with_timezone(&Utc))
        .map_err(|e| ApiError::BadRequest(format!("invalid since '{raw}': {e}")))
}
