//! Alert Gateway Binary
//!
//! Consumes a relay's alert stream and re-serves it to local SSE consumers.
//!
//! # Usage
//!
//! ```bash
//! UPSTREAM_STREAM_URL=http://relay:8000/api/alerts-stream cargo run --bin alert-gateway
//! ```
//!
//! # Environment Variables
//!
//! ## Required
//! - `UPSTREAM_STREAM_URL`: Relay stream endpoint
//!
//! ## Optional
//! - `API_KEY`: Sent as `X-API-Key` on every connection attempt
//! - `WATCH_CITIES`: Comma-separated area names to re-publish (default: all)
//! - `HEARTBEAT_TIMEOUT_SECS`: Reconnect after this long without a frame (default: 45)
//! - `RECONNECT_DELAY_INITIAL_MS`: First backoff delay (default: 2000)
//! - `RECONNECT_DELAY_MAX_SECS`: Backoff cap (default: 60)
//! - `RECONNECT_JITTER`: Jitter factor 0.0 to 1.0 (default: 0)
//! - `MAX_RECONNECT_ATTEMPTS`: 0 retries forever (default: 0)
//! - `GATEWAY_PORT`: Local stream port (default: 8002)
//! - `GATEWAY_HEALTH_PORT`: Health check HTTP port (default: 8083)
//! - `OTEL_ENABLED`, `OTEL_EXPORTER_OTLP_ENDPOINT`, `OTEL_SERVICE_NAME`, `RUST_LOG`

use std::sync::Arc;

use alert_relay::infrastructure::client::HttpTransport;
use alert_relay::infrastructure::http::{ApiServer, stream_routes};
use alert_relay::infrastructure::runtime::{
    await_shutdown, drain_tasks, install_crypto_provider, load_dotenv,
};
use alert_relay::infrastructure::telemetry;
use alert_relay::{
    CityMatcher, ClientConfig, ClientEvent, DistributionHub, FeedProbe, GatewayConfig,
    HealthServer, HealthServerState, ReconnectingClient, init_metrics,
};
use anyhow::Context;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// Client event channel capacity.
const EVENT_CHANNEL_CAPACITY: usize = 256;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    install_crypto_provider();
    load_dotenv();

    let _telemetry_guard = telemetry::init("alert-gateway");

    tracing::info!("Starting Alert Gateway");

    if let Err(e) = init_metrics() {
        tracing::warn!(error = %e, "Prometheus recorder unavailable");
    }

    let config = GatewayConfig::from_env().context("invalid gateway configuration")?;
    log_config(&config);

    let shutdown_token = CancellationToken::new();

    let hub = DistributionHub::new(config.hub);
    let keep_alive_task = hub.spawn_keep_alive(shutdown_token.clone());

    let mut client_config = ClientConfig::new(config.upstream_url.clone());
    client_config.backoff = config.backoff.clone();
    client_config.heartbeat_timeout = config.heartbeat_timeout;
    if let Some(key) = &config.api_key {
        client_config = client_config.with_header("X-API-Key", key.expose());
    }

    let (event_tx, event_rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
    let transport = Arc::new(HttpTransport::new().context("failed to build stream transport")?);
    let client = Arc::new(ReconnectingClient::new(client_config, transport, event_tx));

    let runner = Arc::clone(&client);
    let client_shutdown = shutdown_token.clone();
    let client_task = tokio::spawn(async move {
        if let Err(e) = runner.run().await {
            tracing::error!(error = %e, "Stream client gave up");
            client_shutdown.cancel();
        }
    });

    let relay_hub = hub.clone();
    let watch_cities = config.watch_cities.clone();
    let relay_task = tokio::spawn(async move {
        relay_events(event_rx, relay_hub, watch_cities).await;
    });

    let api_server = ApiServer::new(
        config.server.api_port,
        stream_routes(hub.clone()),
        shutdown_token.clone(),
    );
    let api_task = tokio::spawn(async move {
        if let Err(e) = api_server.run().await {
            tracing::error!(error = %e, "Gateway stream server error");
        }
    });

    let health_state = Arc::new(HealthServerState::new(
        env!("CARGO_PKG_VERSION").to_string(),
        FeedProbe::Stream(client.context()),
        hub.clone(),
    ));
    let health_server = HealthServer::new(
        config.server.health_port,
        health_state,
        shutdown_token.clone(),
    );
    let health_task = tokio::spawn(async move {
        if let Err(e) = health_server.run().await {
            tracing::error!(error = %e, "Health server error");
        }
    });

    tracing::info!("Alert gateway ready");

    await_shutdown(shutdown_token).await;

    client.stop();
    hub.close_all();
    drain_tasks(vec![
        keep_alive_task,
        client_task,
        relay_task,
        api_task,
        health_task,
    ])
    .await;

    tracing::info!("Alert gateway stopped");
    Ok(())
}

/// Re-publish alerts from the upstream client on the local hub.
async fn relay_events(
    mut rx: mpsc::Receiver<ClientEvent>,
    hub: DistributionHub,
    watch_cities: Vec<String>,
) {
    let matcher = CityMatcher::default();

    while let Some(event) = rx.recv().await {
        match event {
            ClientEvent::Connected => {
                tracing::info!("Upstream stream connected");
            }
            ClientEvent::Retrying {
                attempt,
                delay,
                cause,
            } => {
                tracing::warn!(
                    attempt,
                    delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                    cause = %cause,
                    "Upstream stream lost, retrying"
                );
            }
            ClientEvent::Alert(alert) => {
                if !matcher.matches(&watch_cities, &alert) {
                    tracing::debug!(alert_id = %alert.id, "Alert outside watched areas");
                    continue;
                }
                let reached = hub.publish(Arc::new(*alert));
                tracing::debug!(subscribers = reached, "Alert re-published");
            }
        }
    }

    tracing::info!("Upstream event channel closed");
}

fn log_config(config: &GatewayConfig) {
    tracing::info!(
        upstream = %config.upstream_url,
        authenticated = config.api_key.is_some(),
        watch_cities = ?config.watch_cities,
        port = config.server.api_port,
        health_port = config.server.health_port,
        "Configuration loaded"
    );
}
