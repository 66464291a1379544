//! Infrastructure Layer - Adapters and external integrations.
//!
//! Concrete implementations of the application ports plus the servers and
//! background tasks the binaries wire together.

/// In-process fan-out of alerts to bounded subscriber queues.
pub mod broadcast;

/// Reconnecting outbound stream client.
pub mod client;

/// Configuration loaded from the environment.
pub mod config;

/// Health check HTTP endpoint.
pub mod health;

/// Alert API and SSE stream routes.
pub mod http;

/// Prometheus metrics instrumentation.
pub mod metrics;

/// SQLite alert store.
pub mod persistence;

/// Upstream polling loop.
pub mod poller;

/// Startup and shutdown helpers shared by the binaries.
pub mod runtime;

/// Server-sent-event line framing.
pub mod sse;

/// OpenTelemetry tracing integration.
pub mod telemetry;

/// HTTP client for the upstream alert feed.
pub mod upstream;
