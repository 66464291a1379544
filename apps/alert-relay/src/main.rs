//! Alert Relay Binary
//!
//! Polls the upstream alert feed and serves new alerts to SSE consumers.
//!
//! # Usage
//!
//! ```bash
//! cargo run --bin alert-relay
//! ```
//!
//! # Environment Variables
//!
//! - `OREF_ALERTS_URL`: Live alerts endpoint
//! - `OREF_HISTORY_URL`: Alert history endpoint
//! - `POLL_INTERVAL_MS`: Poll period (default: 2000)
//! - `UPSTREAM_TIMEOUT_SECS`: Upstream request timeout (default: 10)
//! - `HISTORY_SYNC_INTERVAL_SECS`: History backfill period, 0 disables (default: 300)
//! - `KNOWN_ID_CAPACITY`: Recent ids kept for deduplication (default: 1024)
//! - `DATABASE_PATH`: SQLite file (default: data/alerts.db)
//! - `SUBSCRIBER_CAPACITY`: Queued events per consumer (default: 64)
//! - `KEEP_ALIVE_INTERVAL_SECS`: Keep-alive period, 0 disables (default: 30)
//! - `API_PORT`: Alert API port (default: 8000)
//! - `HEALTH_PORT`: Health check HTTP port (default: 8082)
//! - `OTEL_ENABLED`, `OTEL_EXPORTER_OTLP_ENDPOINT`, `OTEL_SERVICE_NAME`, `RUST_LOG`

use std::sync::Arc;

use alert_relay::infrastructure::http::{ApiServer, ApiState, api_routes};
use alert_relay::infrastructure::persistence::{SqliteAlertStore, run_blocking};
use alert_relay::infrastructure::poller::Poller;
use alert_relay::infrastructure::runtime::{
    await_shutdown, drain_tasks, install_crypto_provider, load_dotenv,
};
use alert_relay::infrastructure::telemetry;
use alert_relay::infrastructure::upstream::OrefClient;
use alert_relay::{
    AlertStore, CityMatcher, DistributionHub, FeedProbe, HealthServer, HealthServerState,
    RelayConfig, init_metrics,
};
use anyhow::Context;
use tokio_util::sync::CancellationToken;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    install_crypto_provider();
    load_dotenv();

    let _telemetry_guard = telemetry::init("alert-relay");

    tracing::info!("Starting Alert Relay");

    if let Err(e) = init_metrics() {
        tracing::warn!(error = %e, "Prometheus recorder unavailable");
    }

    let config = RelayConfig::from_env().context("invalid relay configuration")?;
    log_config(&config);

    let shutdown_token = CancellationToken::new();

    let database_path = config.database_path.clone();
    let store: Arc<dyn AlertStore> = Arc::new(
        run_blocking(move || SqliteAlertStore::open(database_path))
            .await
            .context("failed to open alert store")?,
    );

    let hub = DistributionHub::new(config.hub);
    let keep_alive_task = hub.spawn_keep_alive(shutdown_token.clone());

    let source = Arc::new(
        OrefClient::new(config.upstream.clone()).context("failed to build upstream client")?,
    );
    let poller_config = config.poller.clone();
    let poller_store = Arc::clone(&store);
    let publisher = Arc::new(hub.clone());
    let poller = Arc::new(
        tokio::task::spawn_blocking(move || {
            Poller::new(poller_config, source, poller_store, publisher)
        })
        .await
        .context("poller bootstrap failed")?,
    );

    let poller_task = tokio::spawn(Arc::clone(&poller).run(shutdown_token.clone()));

    let api_state = ApiState::new(store, hub.clone(), Arc::clone(&poller), CityMatcher::default());
    let api_server = ApiServer::new(
        config.server.api_port,
        api_routes(api_state),
        shutdown_token.clone(),
    );
    let api_task = tokio::spawn(async move {
        if let Err(e) = api_server.run().await {
            tracing::error!(error = %e, "Alert API server error");
        }
    });

    let health_state = Arc::new(HealthServerState::new(
        env!("CARGO_PKG_VERSION").to_string(),
        FeedProbe::Poller(poller),
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

    tracing::info!("Alert relay ready");

    await_shutdown(shutdown_token).await;

    hub.close_all();
    drain_tasks(vec![keep_alive_task, poller_task, api_task, health_task]).await;

    tracing::info!("Alert relay stopped");
    Ok(())
}

fn log_config(config: &RelayConfig) {
    tracing::info!(
        poll_interval = ?config.poller.poll_interval,
        history_sync_secs = config.poller.history_sync_interval.as_secs(),
        database = %config.database_path.display(),
        api_port = config.server.api_port,
        health_port = config.server.health_port,
        "Configuration loaded"
    );
    tracing::debug!(
        alerts_url = %config.upstream.alerts_url,
        history_url = %config.upstream.history_url,
        "Upstream endpoints"
    );
}
