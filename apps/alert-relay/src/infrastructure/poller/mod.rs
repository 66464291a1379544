//! Upstream Poller
//!
//! Drives ingestion: fetch the open-alert snapshot on a fixed interval, keep
//! only alerts not accepted before, persist each one and then publish it.
//!
//! # Cycle
//!
//! ```text
//! Idle ──tick──▶ Fetching ──ok──▶ dedup ▶ persist ▶ publish ──▶ Idle
//!                    │
//!                    └──error──▶ count failure ──────────────▶ Idle
//! ```
//!
//! Ticks are measured from the start of the previous fetch and fetches never
//! overlap. Failures are retried on the next tick without any backoff.
//!
//! Alongside the live snapshot, a separate task periodically backfills the
//! store from the upstream history feed. Backfilled alerts are stored only.

use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use crate::application::ports::{
    AlertPublisher, AlertSource, AlertStore, AppendOutcome, StoreError, UpstreamError,
};
use crate::domain::alert::{Alert, group_history};
use crate::domain::dedup::{DEFAULT_KNOWN_ID_CAPACITY, Deduplicator};
use crate::infrastructure::metrics::{self, PollOutcome};
use crate::infrastructure::persistence::run_blocking;

// =============================================================================
// Configuration
// =============================================================================

/// Poller timing and memory settings.
#[derive(Debug, Clone)]
pub struct PollerConfig {
    /// Interval between fetch starts.
    pub poll_interval: Duration,
    /// Interval between history syncs. Zero disables history sync.
    pub history_sync_interval: Duration,
    /// Ids kept in memory for deduplication.
    pub known_id_capacity: usize,
}

impl Default for PollerConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(2),
            history_sync_interval: Duration::from_secs(300),
            known_id_capacity: DEFAULT_KNOWN_ID_CAPACITY,
        }
    }
}

// =============================================================================
// Health
// =============================================================================

/// Poller health snapshot.
#[derive(Debug, Clone, Default, Serialize)]
pub struct PollerHealth {
    /// Failed polls since the last success.
    pub consecutive_failures: u32,
    /// Polls attempted since startup.
    pub total_polls: u64,
    /// Completion time of the last successful poll.
    pub last_success_at: Option<DateTime<Utc>>,
    /// Observation time of the last accepted alert.
    pub last_alert_at: Option<DateTime<Utc>>,
    /// Id of the last accepted alert.
    pub last_alert_id: Option<String>,
}

// =============================================================================
// Poller
// =============================================================================

/// Upstream polling loop.
pub struct Poller {
    config: PollerConfig,
    source: Arc<dyn AlertSource>,
    store: Arc<dyn AlertStore>,
    publisher: Arc<dyn AlertPublisher>,
    dedup: Arc<Mutex<Deduplicator>>,
    health: RwLock<PollerHealth>,
}

impl Poller {
    /// Create a poller, seeding deduplication from `store`.
    ///
    /// A store that cannot be read leaves the poller with an empty window.
    pub fn new(
        config: PollerConfig,
        source: Arc<dyn AlertSource>,
        store: Arc<dyn AlertStore>,
        publisher: Arc<dyn AlertPublisher>,
    ) -> Self {
        let dedup = bootstrap_dedup(store.as_ref(), config.known_id_capacity);
        let health = PollerHealth {
            last_alert_id: dedup.last_seen().map(str::to_string),
            ..PollerHealth::default()
        };

        tracing::info!(
            known_ids = dedup.len(),
            window_exceeded = dedup.window_exceeded(),
            last_alert_id = ?health.last_alert_id,
            "Poller initialized"
        );

        Self {
            config,
            source,
            store,
            publisher,
            dedup: Arc::new(Mutex::new(dedup)),
            health: RwLock::new(health),
        }
    }

    /// Health snapshot.
    #[must_use]
    pub fn health(&self) -> PollerHealth {
        self.health.read().clone()
    }

    /// Id of the most recently accepted alert.
    #[must_use]
    pub fn last_alert_id(&self) -> Option<String> {
        self.health.read().last_alert_id.clone()
    }

    /// Run until cancelled.
    ///
    /// History sync runs as a separate task so a slow history fetch never
    /// delays the live snapshot cadence.
    pub async fn run(self: Arc<Self>, cancel: CancellationToken) {
        let mut poll = tokio::time::interval(self.config.poll_interval);
        poll.set_missed_tick_behavior(MissedTickBehavior::Delay);

        tracing::info!(
            interval_ms = self.config.poll_interval.as_millis(),
            history_sync_secs = self.config.history_sync_interval.as_secs(),
            "Poller started"
        );

        let history = (!self.config.history_sync_interval.is_zero())
            .then(|| tokio::spawn(Arc::clone(&self).run_history_sync(cancel.clone())));

        loop {
            tokio::select! {
                biased;
                () = cancel.cancelled() => break,
                _ = poll.tick() => {
                    // Failures are recorded in health and retried next tick.
                    let _ = self.poll_once().await;
                }
            }
        }

        if let Some(handle) = history {
            if let Err(e) = handle.await {
                tracing::error!(error = %e, "History sync task panicked");
            }
        }

        tracing::info!("Poller stopped");
    }

    async fn run_history_sync(self: Arc<Self>, cancel: CancellationToken) {
        let mut interval = tokio::time::interval(self.config.history_sync_interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                biased;
                () = cancel.cancelled() => break,
                _ = interval.tick() => {
                    let synced = tokio::select! {
                        biased;
                        () = cancel.cancelled() => break,
                        synced = self.sync_history() => synced,
                    };
                    if let Err(e) = synced {
                        tracing::warn!(error = %e, "History sync failed");
                    }
                }
            }
        }
    }

    /// Fetch one snapshot, persist new alerts and publish them.
    ///
    /// Returns the number of alerts published.
    ///
    /// # Errors
    ///
    /// Returns `UpstreamError` if the snapshot could not be fetched.
    pub async fn poll_once(&self) -> Result<usize, UpstreamError> {
        let started = Instant::now();
        self.health.write().total_polls += 1;

        let raw = match self.source.fetch_snapshot().await {
            Ok(raw) => raw,
            Err(e) => {
                let failures = {
                    let mut health = self.health.write();
                    health.consecutive_failures += 1;
                    health.consecutive_failures
                };
                metrics::record_poll(PollOutcome::Failure, started.elapsed());
                tracing::warn!(error = %e, consecutive_failures = failures, "Poll failed");
                return Err(e);
            }
        };

        let observed_at = Utc::now();
        let alerts: Vec<Alert> = raw
            .into_iter()
            .filter_map(|record| record.into_alert(observed_at))
            .collect();

        let accepted = if alerts.is_empty() {
            Vec::new()
        } else {
            self.ingest(alerts).await
        };

        for alert in &accepted {
            let delivered = self.publisher.publish(Arc::clone(alert));
            tracing::info!(
                id = %alert.id,
                kind = %alert.kind,
                areas = alert.areas.len(),
                subscribers = delivered,
                "Alert published"
            );
        }

        {
            let mut health = self.health.write();
            health.consecutive_failures = 0;
            health.last_success_at = Some(Utc::now());
            if let Some(last) = accepted.last() {
                health.last_alert_at = Some(last.observed_at);
                health.last_alert_id = Some(last.id.clone());
            }
        }
        metrics::record_poll(PollOutcome::Success, started.elapsed());

        Ok(accepted.len())
    }

    /// Fetch the history feed and store alerts not seen before.
    ///
    /// Returns the number of alerts inserted.
    ///
    /// # Errors
    ///
    /// Returns `UpstreamError` if the history could not be fetched.
    pub async fn sync_history(&self) -> Result<usize, UpstreamError> {
        let records = self.source.fetch_history().await?;
        let alerts = group_history(records);
        if alerts.is_empty() {
            tracing::debug!("History feed empty");
            return Ok(0);
        }

        let total = alerts.len();
        let store = Arc::clone(&self.store);
        let result = run_blocking(move || {
            let mut inserted = 0_usize;
            for alert in &alerts {
                match store.append(alert) {
                    Ok(AppendOutcome::Inserted) => inserted += 1,
                    Ok(AppendOutcome::Duplicate) => {}
                    Err(e) => {
                        metrics::record_store_error("history_append");
                        tracing::warn!(id = %alert.id, error = %e, "Failed to store history alert");
                    }
                }
            }
            Ok(inserted)
        })
        .await;

        let inserted = result.unwrap_or_else(|e| {
            tracing::error!(error = %e, "History sync task failed");
            0
        });
        metrics::record_history_backfilled(inserted as u64);
        tracing::info!(groups = total, inserted, "History sync complete");
        Ok(inserted)
    }

    /// Deduplicate and persist on the blocking pool. Returns the alerts that
    /// were newly inserted, in snapshot order.
    async fn ingest(&self, alerts: Vec<Alert>) -> Vec<Arc<Alert>> {
        let dedup = Arc::clone(&self.dedup);
        let store = Arc::clone(&self.store);

        let result = run_blocking(move || {
            let mut dedup = dedup.lock();
            let fresh = dedup.filter(alerts, |id| match store.contains(id) {
                Ok(found) => found,
                Err(e) => {
                    metrics::record_store_error("contains");
                    tracing::warn!(id, error = %e, "Store lookup failed, treating id as new");
                    false
                }
            });

            let mut accepted = Vec::with_capacity(fresh.len());
            for alert in fresh {
                match store.append(&alert) {
                    Ok(AppendOutcome::Inserted) => {
                        dedup.mark_accepted(&alert.id);
                        metrics::record_alert_accepted();
                        accepted.push(Arc::new(alert));
                    }
                    Ok(AppendOutcome::Duplicate) => {
                        tracing::debug!(id = %alert.id, "Alert already stored");
                        dedup.mark_accepted(&alert.id);
                    }
                    Err(e) => {
                        metrics::record_store_error("append");
                        tracing::error!(id = %alert.id, error = %e, "Failed to persist alert");
                    }
                }
            }
            Ok::<_, StoreError>(accepted)
        })
        .await;

        result.unwrap_or_else(|e| {
            tracing::error!(error = %e, "Ingest task failed");
            Vec::new()
        })
    }
}

fn bootstrap_dedup(store: &dyn AlertStore, capacity: usize) -> Deduplicator {
    let recent = store.recent_ids(capacity);
    let stats = store.stats();
    match (recent, stats) {
        (Ok(recent), Ok(stats)) => Deduplicator::bootstrap(capacity, recent, stats.total_count),
        (Err(e), _) | (_, Err(e)) => {
            tracing::warn!(error = %e, "Could not seed deduplication from store");
            Deduplicator::new(capacity)
        }
    }
}
