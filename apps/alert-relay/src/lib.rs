#![cfg_attr(
    test,
    allow(
        clippy::unwrap_used,
        clippy::expect_used,
        clippy::float_cmp,
        clippy::significant_drop_tightening,
        clippy::too_many_lines,
        clippy::match_same_arms,
        clippy::needless_pass_by_value,
        clippy::needless_collect,
        clippy::option_if_let_else,
        clippy::default_trait_access,
        clippy::items_after_statements,
        clippy::or_fun_call
    )
)]

//! Alert Relay - Emergency Alert Ingestion and Fan-out
//!
//! Polls the upstream emergency-alert feed, keeps only alerts it has not
//! seen before, persists them, and pushes each one once to every connected
//! server-sent-event consumer. A companion gateway binary consumes the
//! relay's stream over a reconnecting client and re-serves it locally.
//!
//! # Layers (inside → outside)
//!
//! - **Domain**: Alert model and pure policies
//!   - `alert`: Alert entity, category table, upstream payload parsing
//!   - `dedup`: Known-id window over upstream snapshots
//!   - `matching`: Exact then approximate area-name matching
//!
//! - **Application**: Port definitions
//!   - `ports`: Upstream source, alert store, publisher, stream transport
//!
//! - **Infrastructure**: Adapters and external integrations
//!   - `upstream`: HTTP client for the alert feed
//!   - `poller`: Fetch, dedup, persist, publish loop
//!   - `persistence`: SQLite alert store
//!   - `broadcast`: Bounded per-subscriber fan-out hub
//!   - `http`: Alert API and SSE routes
//!   - `client`: Reconnecting outbound stream client
//!   - `health`: Health check HTTP endpoint
//!
//! # Data Flow
//!
//! ```text
//! Upstream feed ──► Poller ──► Deduplicator ──► AlertStore
//!                                   │
//!                                   ▼
//!                          DistributionHub ──► SSE consumer 1
//!                                   │      ──► SSE consumer 2
//!                                   │      ──► Gateway ──► local consumers
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::pedantic)]

// =============================================================================
// Module Declarations
// =============================================================================

/// Domain layer - Alert types and policies with no I/O.
pub mod domain;

/// Application layer - Port definitions.
pub mod application;

/// Infrastructure layer - Adapters and external integrations.
pub mod infrastructure;

// =============================================================================
// Re-exports
// =============================================================================

// Domain types
pub use domain::alert::{Alert, AlertKind, HistoryRecord, PayloadError, RawAlert};
pub use domain::dedup::Deduplicator;
pub use domain::matching::CityMatcher;

// Ports
pub use application::ports::{
    AlertPublisher, AlertSource, AlertStats, AlertStore, AppendOutcome, HistoryQuery, StoreError,
    StreamTransport, TransportError, UpstreamError,
};

// Infrastructure config
pub use infrastructure::config::{ConfigError, GatewayConfig, RelayConfig, ServerSettings};

// Health server
pub use infrastructure::health::{FeedProbe, HealthServer, HealthServerError, HealthServerState};

// Distribution hub (for integration tests)
pub use infrastructure::broadcast::{DistributionHub, HubConfig, HubEvent, HubStats, Subscription};

// Stream client
pub use infrastructure::client::{
    ClientConfig, ClientEvent, ConnectionState, DisconnectCause, ReconnectingClient,
};

// Metrics
pub use infrastructure::metrics::init_metrics;

// Telemetry
pub use infrastructure::telemetry::{TelemetryConfig, TelemetryGuard, init as init_telemetry};
