//! Port Interfaces
//!
//! Defines the interfaces (ports) for external systems following
//! the Hexagonal Architecture pattern. These are the contracts that
//! infrastructure adapters must implement.
//!
//! ## Driven Ports (Outbound)
//!
//! - `AlertSource`: Pull-based upstream feed of open alerts and history
//! - `AlertStore`: Durable alert history with a per-area index
//! - `AlertPublisher`: Non-blocking fan-out to live subscribers
//! - `StreamTransport`: Long-lived line streams for outbound consumers

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::domain::alert::{Alert, HistoryRecord, RawAlert};

// =============================================================================
// Alert Source
// =============================================================================

/// Errors fetching from the upstream feed. All are retried on the next tick.
#[derive(Debug, thiserror::Error)]
pub enum UpstreamError {
    /// Request could not be sent or the body could not be read.
    #[error("upstream request failed: {0}")]
    Network(String),

    /// Upstream answered with a non-success status.
    #[error("upstream returned HTTP {0}")]
    Status(u16),

    /// Body could not be decoded.
    #[error("malformed upstream payload: {0}")]
    Malformed(String),
}

/// Upstream source of emergency alerts.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait AlertSource: Send + Sync {
    /// Fetch the currently open alerts. An empty vector means none.
    async fn fetch_snapshot(&self) -> Result<Vec<RawAlert>, UpstreamError>;

    /// Fetch the recent per-area history entries.
    async fn fetch_history(&self) -> Result<Vec<HistoryRecord>, UpstreamError>;
}

// =============================================================================
// Alert Store
// =============================================================================

/// Storage failures. A duplicate id is not an error.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// The storage medium rejected the operation.
    #[error("storage I/O error: {0}")]
    Io(String),

    /// A stored record could not be decoded.
    #[error("corrupt stored record: {0}")]
    Corrupt(String),
}

/// Result of an append.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AppendOutcome {
    /// The alert was stored.
    Inserted,
    /// An alert with the same id was already stored; nothing changed.
    Duplicate,
}

/// Parameters of a history query.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HistoryQuery {
    /// Only alerts that include this area (normalized comparison).
    pub area: Option<String>,
    /// Maximum number of alerts returned.
    pub limit: usize,
    /// Only alerts observed at or after this instant.
    pub since: Option<DateTime<Utc>>,
}

impl HistoryQuery {
    /// Most recent `limit` alerts.
    #[must_use]
    pub const fn recent(limit: usize) -> Self {
        Self {
            area: None,
            limit,
            since: None,
        }
    }

    /// Restrict to alerts for `area`.
    #[must_use]
    pub fn for_area(mut self, area: impl Into<String>) -> Self {
        self.area = Some(area.into());
        self
    }

    /// Restrict to alerts observed at or after `since`.
    #[must_use]
    pub const fn since(mut self, since: DateTime<Utc>) -> Self {
        self.since = Some(since);
        self
    }
}

/// Alert count for a single area.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AreaCount {
    /// Area name as first stored.
    pub area: String,
    /// Number of alerts that included it.
    pub count: u64,
}

/// Aggregate statistics over stored alerts.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct AlertStats {
    /// Number of stored alerts.
    pub total_count: u64,
    /// Number of (alert, area) index entries.
    pub total_area_entries: u64,
    /// Alert count per kind wire name.
    pub count_by_kind: BTreeMap<String, u64>,
    /// Earliest observation.
    pub earliest: Option<DateTime<Utc>>,
    /// Latest observation.
    pub latest: Option<DateTime<Utc>>,
    /// Most frequently alerted areas, highest first.
    pub top_areas: Vec<AreaCount>,
}

/// Durable, append-only alert history.
///
/// Appends are idempotent by id. The per-area index is written atomically
/// with the alert, so an area query never observes a partial write.
pub trait AlertStore: Send + Sync {
    /// Store `alert` unless its id is already present.
    ///
    /// # Errors
    ///
    /// Returns `StoreError` if the write could not be committed.
    fn append(&self, alert: &Alert) -> Result<AppendOutcome, StoreError>;

    /// Look up an alert by id.
    ///
    /// # Errors
    ///
    /// Returns `StoreError` if the read fails.
    fn get_by_id(&self, id: &str) -> Result<Option<Alert>, StoreError>;

    /// Alerts matching `query`, newest first.
    ///
    /// # Errors
    ///
    /// Returns `StoreError` if the read fails.
    fn list_history(&self, query: &HistoryQuery) -> Result<Vec<Alert>, StoreError>;

    /// Aggregate statistics.
    ///
    /// # Errors
    ///
    /// Returns `StoreError` if the read fails.
    fn stats(&self) -> Result<AlertStats, StoreError>;

    /// Whether an alert with `id` is stored.
    ///
    /// # Errors
    ///
    /// Returns `StoreError` if the read fails.
    fn contains(&self, id: &str) -> Result<bool, StoreError>;

    /// Ids of the `limit` most recently observed alerts, newest first.
    ///
    /// # Errors
    ///
    /// Returns `StoreError` if the read fails.
    fn recent_ids(&self, limit: usize) -> Result<Vec<String>, StoreError>;
}

// =============================================================================
// Alert Publisher
// =============================================================================

/// In-process fan-out of accepted alerts.
pub trait AlertPublisher: Send + Sync {
    /// Deliver `alert` to every current subscriber without blocking.
    ///
    /// Returns the number of subscribers it was queued for.
    fn publish(&self, alert: Arc<Alert>) -> usize;
}

// =============================================================================
// Stream Transport
// =============================================================================

/// Errors from an outbound stream transport.
#[derive(Debug, Clone, thiserror::Error)]
pub enum TransportError {
    /// The stream could not be opened.
    #[error("failed to open stream: {0}")]
    Open(String),

    /// The server answered with a non-success status.
    #[error("stream endpoint returned HTTP {0}")]
    Status(u16),

    /// Reading from an open stream failed.
    #[error("stream read failed: {0}")]
    Read(String),
}

/// An open line-oriented stream. Dropping it closes the connection.
#[async_trait]
pub trait LineStream: Send {
    /// Next line without its terminator, `None` once the server closed the
    /// stream.
    async fn next_line(&mut self) -> Option<Result<String, TransportError>>;
}

/// Opens long-lived line streams.
#[async_trait]
pub trait StreamTransport: Send + Sync {
    /// Open a stream at `url`, sending `headers` verbatim.
    ///
    /// # Errors
    ///
    /// Returns `TransportError` if the connection cannot be established.
    async fn open(
        &self,
        url: &str,
        headers: &[(String, String)],
    ) -> Result<Box<dyn LineStream>, TransportError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn history_query_builders() {
        let since = Utc::now();
        let query = HistoryQuery::recent(10).for_area("Haifa").since(since);
        assert_eq!(query.limit, 10);
        assert_eq!(query.area.as_deref(), Some("Haifa"));
        assert_eq!(query.since, Some(since));
    }

    #[test]
    fn stats_serialize_snake_case() {
        let value = serde_json::to_value(AlertStats::default()).unwrap();
        assert_eq!(value["total_count"], 0);
        assert!(value["top_areas"].as_array().unwrap().is_empty());
    }
}
