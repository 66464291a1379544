//! Prometheus Metrics Module
//!
//! Exposes application metrics via Prometheus format for monitoring.
//!
//! # Metrics Categories
//!
//! - **Polling**: Upstream poll outcomes and durations
//! - **Alerts**: Accepted, published, backfilled and dropped alerts
//! - **Subscribers**: Active hub subscribers
//! - **Stream client**: Outbound connection state and reconnects
//!
//! # Integration
//!
//! Metrics are exposed at `/metrics` on the health server port.

use std::sync::OnceLock;
use std::time::Duration;

use metrics::{counter, describe_counter, describe_gauge, describe_histogram, gauge, histogram};
use metrics_exporter_prometheus::{BuildError, PrometheusBuilder, PrometheusHandle};

// =============================================================================
// Global Metrics Handle
// =============================================================================

static PROMETHEUS_HANDLE: OnceLock<PrometheusHandle> = OnceLock::new();

/// Initialize the Prometheus metrics recorder.
///
/// Subsequent calls return the handle installed by the first one.
///
/// # Errors
///
/// Returns `BuildError` if the recorder cannot be installed.
pub fn init_metrics() -> Result<PrometheusHandle, BuildError> {
    if let Some(handle) = PROMETHEUS_HANDLE.get() {
        return Ok(handle.clone());
    }

    let handle = PrometheusBuilder::new().install_recorder()?;
    register_metrics();
    Ok(PROMETHEUS_HANDLE.get_or_init(|| handle).clone())
}

/// Get the Prometheus handle for rendering metrics.
///
/// Returns `None` if metrics have not been initialized.
#[must_use]
pub fn get_metrics_handle() -> Option<PrometheusHandle> {
    PROMETHEUS_HANDLE.get().cloned()
}

// =============================================================================
// Metric Registration
// =============================================================================

fn register_metrics() {
    describe_counter!(
        "alert_relay_polls_total",
        "Upstream polls by outcome (success, failure)"
    );
    describe_histogram!(
        "alert_relay_poll_duration_seconds",
        "Time to fetch and process one upstream snapshot"
    );
    describe_counter!(
        "alert_relay_alerts_accepted_total",
        "Alerts persisted from the live feed"
    );
    describe_counter!(
        "alert_relay_alerts_published_total",
        "Alerts published to the distribution hub"
    );
    describe_counter!(
        "alert_relay_alert_deliveries_total",
        "Alert deliveries queued for subscribers"
    );
    describe_counter!(
        "alert_relay_events_dropped_total",
        "Events dropped from full subscriber queues"
    );
    describe_counter!(
        "alert_relay_history_backfilled_total",
        "Alerts inserted by history sync"
    );
    describe_counter!(
        "alert_relay_store_errors_total",
        "Failed alert store operations"
    );
    describe_gauge!(
        "alert_relay_subscribers",
        "Number of registered hub subscribers"
    );
    describe_gauge!(
        "alert_relay_stream_connected",
        "Whether the outbound stream client is connected (1) or not (0)"
    );
    describe_counter!(
        "alert_relay_stream_reconnects_total",
        "Outbound stream reconnection attempts"
    );
}

// =============================================================================
// Metric Recording Functions
// =============================================================================

/// Outcome label for a poll.
#[derive(Debug, Clone, Copy)]
pub enum PollOutcome {
    /// Snapshot fetched and processed.
    Success,
    /// Fetch or decode failed.
    Failure,
}

impl PollOutcome {
    const fn as_str(self) -> &'static str {
        match self {
            Self::Success => "success",
            Self::Failure => "failure",
        }
    }
}

/// Record one poll and how long it took.
pub fn record_poll(outcome: PollOutcome, duration: Duration) {
    counter!("alert_relay_polls_total", "outcome" => outcome.as_str()).increment(1);
    histogram!("alert_relay_poll_duration_seconds").record(duration.as_secs_f64());
}

/// Record an alert accepted from the live feed.
pub fn record_alert_accepted() {
    counter!("alert_relay_alerts_accepted_total").increment(1);
}

/// Record a publish reaching `subscribers` subscribers.
pub fn record_alert_published(subscribers: usize) {
    counter!("alert_relay_alerts_published_total").increment(1);
    counter!("alert_relay_alert_deliveries_total").increment(subscribers as u64);
}

/// Record events dropped from full subscriber queues.
pub fn record_events_dropped(count: u64) {
    counter!("alert_relay_events_dropped_total").increment(count);
}

/// Record alerts inserted by history sync.
pub fn record_history_backfilled(count: u64) {
    counter!("alert_relay_history_backfilled_total").increment(count);
}

/// Record a failed store operation.
pub fn record_store_error(operation: &'static str) {
    counter!("alert_relay_store_errors_total", "operation" => operation).increment(1);
}

/// Update the subscriber gauge.
#[allow(clippy::cast_precision_loss)]
pub fn set_subscribers(count: usize) {
    gauge!("alert_relay_subscribers").set(count as f64);
}

/// Update the outbound stream connection gauge.
pub fn set_stream_connected(connected: bool) {
    gauge!("alert_relay_stream_connected").set(if connected { 1.0 } else { 0.0 });
}

/// Record an outbound stream reconnection attempt.
pub fn record_stream_reconnect() {
    counter!("alert_relay_stream_reconnects_total").increment(1);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn poll_outcome_labels() {
        assert_eq!(PollOutcome::Success.as_str(), "success");
        assert_eq!(PollOutcome::Failure.as_str(), "failure");
    }

    #[test]
    fn recording_without_recorder_is_noop() {
        record_poll(PollOutcome::Success, Duration::from_millis(5));
        record_alert_published(3);
        set_subscribers(2);
        set_stream_connected(true);
    }
}
