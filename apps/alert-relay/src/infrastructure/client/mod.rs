//! Reconnecting Stream Client
//!
//! Consumes a relay's alert stream and keeps the subscription alive across
//! transport failures.
//!
//! # State Machine
//!
//! ```text
//! Disconnected ──start──▶ Connecting ──open ok──▶ Connected
//!                             ▲  │                    │
//!                             │  └──open failed──┐    │ error, close
//!                             │                  ▼    ▼ or stale
//!                             └──backoff elapsed── Retrying
//! ```
//!
//! Any state moves to `Disconnected` on [`ReconnectingClient::stop`]; no
//! further connection attempt is made afterwards. A successful open resets
//! the backoff to its base delay. Every received line refreshes the
//! liveness clock; a connection silent for longer than the heartbeat
//! timeout is abandoned and retried. An open that does not complete within
//! the same timeout counts as stale too.

pub mod backoff;
pub mod transport;

use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::Serialize;
use tokio::sync::{Notify, mpsc, watch};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

pub use backoff::{BackoffConfig, BackoffPolicy};
pub use transport::HttpTransport;

use crate::application::ports::{LineStream, StreamTransport, TransportError};
use crate::domain::alert::Alert;
use crate::infrastructure::metrics;
use crate::infrastructure::sse::{EventDecoder, StreamFrame};

/// Default liveness timeout.
pub const DEFAULT_HEARTBEAT_TIMEOUT: Duration = Duration::from_secs(45);

// =============================================================================
// Error Type
// =============================================================================

/// Errors that end the client loop.
#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    /// The configured attempt limit was reached.
    #[error("gave up after {0} consecutive connection failures")]
    RetriesExhausted(u32),
}

/// Why a connection attempt or an open connection ended.
#[derive(Debug, Clone, thiserror::Error)]
pub enum DisconnectCause {
    /// Transport failure while opening or reading.
    #[error(transparent)]
    Transport(#[from] TransportError),

    /// The server closed the stream.
    #[error("server closed the stream")]
    Closed,

    /// Nothing was received within the heartbeat timeout.
    #[error("no data for {0:?}")]
    Stale(Duration),

    /// A reconnect was requested by the owner.
    #[error("reconnect requested")]
    Requested,
}

// =============================================================================
// Connection State
// =============================================================================

/// Lifecycle state of one logical subscription.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionState {
    /// Not running.
    Disconnected,
    /// Opening a stream.
    Connecting,
    /// Stream open and being read.
    Connected,
    /// Waiting out a backoff delay.
    Retrying,
}

impl ConnectionState {
    /// Lowercase name.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Disconnected => "disconnected",
            Self::Connecting => "connecting",
            Self::Connected => "connected",
            Self::Retrying => "retrying",
        }
    }
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Point-in-time health of a subscription.
#[derive(Debug, Clone, Serialize)]
pub struct ConnectionHealth {
    /// Whether a stream is currently open.
    pub connected: bool,
    /// Current lifecycle state.
    pub state: ConnectionState,
    /// Failures since the last successful open.
    pub consecutive_failures: u32,
    /// Wall-clock time of the last received line.
    pub last_event_at: Option<DateTime<Utc>>,
    /// Delay the next failure will wait.
    pub current_backoff_ms: u64,
}

/// Shared per-subscription state.
///
/// Owned by one client; readers take snapshots through [`health`].
///
/// [`health`]: ConnectionContext::health
#[derive(Debug)]
pub struct ConnectionContext {
    state: watch::Sender<ConnectionState>,
    last_event_at: RwLock<Option<DateTime<Utc>>>,
    current_backoff: RwLock<Duration>,
    consecutive_failures: AtomicU32,
}

impl ConnectionContext {
    fn new(initial_backoff: Duration) -> Self {
        let (state, _) = watch::channel(ConnectionState::Disconnected);
        Self {
            state,
            last_event_at: RwLock::new(None),
            current_backoff: RwLock::new(initial_backoff),
            consecutive_failures: AtomicU32::new(0),
        }
    }

    /// Current state.
    #[must_use]
    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    /// Watch state transitions.
    #[must_use]
    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.state.subscribe()
    }

    /// Health snapshot.
    #[must_use]
    pub fn health(&self) -> ConnectionHealth {
        let state = self.state();
        ConnectionHealth {
            connected: state == ConnectionState::Connected,
            state,
            consecutive_failures: self.consecutive_failures.load(Ordering::Acquire),
            last_event_at: *self.last_event_at.read(),
            current_backoff_ms: u64::try_from(self.current_backoff.read().as_millis())
                .unwrap_or(u64::MAX),
        }
    }

    fn set_state(&self, next: ConnectionState) {
        let previous = self.state.send_replace(next);
        if previous != next {
            tracing::debug!(from = %previous, to = %next, "Stream client state changed");
            metrics::set_stream_connected(next == ConnectionState::Connected);
        }
    }

    fn record_event(&self) {
        *self.last_event_at.write() = Some(Utc::now());
    }

    fn on_connected(&self, backoff: Duration) {
        self.consecutive_failures.store(0, Ordering::Release);
        *self.current_backoff.write() = backoff;
        self.record_event();
        self.set_state(ConnectionState::Connected);
    }

    fn on_retry(&self, failures: u32, next_backoff: Duration) {
        self.consecutive_failures.store(failures, Ordering::Release);
        *self.current_backoff.write() = next_backoff;
        self.set_state(ConnectionState::Retrying);
    }
}

// =============================================================================
// Client Events
// =============================================================================

/// Events emitted by the client.
#[derive(Debug, Clone)]
pub enum ClientEvent {
    /// A stream was opened.
    Connected,
    /// A failure was observed and a retry is scheduled.
    Retrying {
        /// Consecutive failure count.
        attempt: u32,
        /// Wait before the next attempt.
        delay: Duration,
        /// What went wrong.
        cause: DisconnectCause,
    },
    /// An alert arrived.
    Alert(Box<Alert>),
}

// =============================================================================
// Client Configuration
// =============================================================================

/// Configuration for a stream subscription.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Stream endpoint.
    pub url: String,
    /// Headers sent verbatim on every attempt.
    pub headers: Vec<(String, String)>,
    /// Reconnection backoff.
    pub backoff: BackoffConfig,
    /// Liveness timeout.
    pub heartbeat_timeout: Duration,
}

impl ClientConfig {
    /// Configuration with default backoff and liveness timeout.
    #[must_use]
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            headers: Vec::new(),
            backoff: BackoffConfig::default(),
            heartbeat_timeout: DEFAULT_HEARTBEAT_TIMEOUT,
        }
    }

    /// Add a request header.
    #[must_use]
    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }
}

// =============================================================================
// Reconnecting Client
// =============================================================================

/// One logical subscription to an alert stream.
///
/// # Example
///
/// ```rust,no_run
/// use std::sync::Arc;
///
/// use alert_relay::infrastructure::client::{
///     ClientConfig, ClientEvent, HttpTransport, ReconnectingClient,
/// };
/// use tokio::sync::mpsc;
///
/// async fn example() -> Result<(), Box<dyn std::error::Error>> {
///     let (event_tx, mut event_rx) = mpsc::channel(64);
///     let client = Arc::new(ReconnectingClient::new(
///         ClientConfig::new("http://localhost:8000/api/alerts-stream"),
///         Arc::new(HttpTransport::new()?),
///         event_tx,
///     ));
///
///     let runner = Arc::clone(&client);
///     tokio::spawn(async move { runner.run().await });
///
///     while let Some(event) = event_rx.recv().await {
///         if let ClientEvent::Alert(alert) = event {
///             println!("{} in {:?}", alert.kind, alert.areas);
///         }
///     }
///     client.stop();
///     Ok(())
/// }
/// ```
pub struct ReconnectingClient {
    config: ClientConfig,
    transport: Arc<dyn StreamTransport>,
    event_tx: mpsc::Sender<ClientEvent>,
    context: Arc<ConnectionContext>,
    cancel: CancellationToken,
    reconnect: Notify,
}

impl ReconnectingClient {
    /// Create a client. Nothing connects until [`run`](Self::run).
    #[must_use]
    pub fn new(
        config: ClientConfig,
        transport: Arc<dyn StreamTransport>,
        event_tx: mpsc::Sender<ClientEvent>,
    ) -> Self {
        let context = Arc::new(ConnectionContext::new(config.backoff.initial_delay));
        Self {
            config,
            transport,
            event_tx,
            context,
            cancel: CancellationToken::new(),
            reconnect: Notify::new(),
        }
    }

    /// Shared connection state.
    #[must_use]
    pub fn context(&self) -> Arc<ConnectionContext> {
        Arc::clone(&self.context)
    }

    /// Stop the client. Idempotent.
    ///
    /// Closes any open stream and cancels a pending backoff wait.
    pub fn stop(&self) {
        if !self.cancel.is_cancelled() {
            tracing::info!(url = %self.config.url, "Stopping stream client");
        }
        self.cancel.cancel();
    }

    /// Whether [`stop`](Self::stop) was called.
    #[must_use]
    pub fn is_stopped(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Drop the current connection, or skip the current backoff wait, and
    /// connect again immediately.
    pub fn request_reconnect(&self) {
        self.reconnect.notify_one();
    }

    /// Run the connection loop until stopped.
    ///
    /// # Errors
    ///
    /// Returns `ClientError::RetriesExhausted` when a configured attempt
    /// limit is reached.
    pub async fn run(&self) -> Result<(), ClientError> {
        let mut backoff = BackoffPolicy::new(self.config.backoff.clone());

        loop {
            if self.cancel.is_cancelled() {
                break;
            }

            self.context.set_state(ConnectionState::Connecting);
            tracing::info!(url = %self.config.url, "Connecting to alert stream");

            // The open shares the liveness budget; a peer that accepts the
            // connection but never answers is treated as stale.
            let open_timeout = self.config.heartbeat_timeout;
            let opened = tokio::select! {
                biased;
                () = self.cancel.cancelled() => break,
                opened = tokio::time::timeout(
                    open_timeout,
                    self.transport.open(&self.config.url, &self.config.headers),
                ) => opened,
            };

            let cause = match opened {
                Err(_elapsed) => DisconnectCause::Stale(open_timeout),
                Ok(Err(e)) => DisconnectCause::Transport(e),
                Ok(Ok(stream)) => {
                    backoff.reset();
                    self.context.on_connected(backoff.current_backoff());
                    tracing::info!(url = %self.config.url, "Alert stream connected");
                    self.emit(ClientEvent::Connected).await;

                    match self.read_stream(stream).await {
                        Some(cause) => cause,
                        None => break,
                    }
                }
            };

            if self.cancel.is_cancelled() {
                break;
            }

            if matches!(cause, DisconnectCause::Requested) {
                tracing::info!("Reconnecting on request");
                continue;
            }

            let Some(delay) = backoff.next_delay() else {
                let attempts = backoff.attempt_count();
                tracing::error!(attempts, error = %cause, "Giving up on alert stream");
                self.context.set_state(ConnectionState::Disconnected);
                return Err(ClientError::RetriesExhausted(attempts));
            };
            let attempt = backoff.attempt_count();

            self.context.on_retry(attempt, backoff.current_backoff());
            metrics::record_stream_reconnect();
            tracing::warn!(
                attempt,
                delay_ms = delay.as_millis(),
                error = %cause,
                "Alert stream unavailable, retrying"
            );
            self.emit(ClientEvent::Retrying {
                attempt,
                delay,
                cause,
            })
            .await;

            tokio::select! {
                biased;
                () = self.cancel.cancelled() => break,
                () = self.reconnect.notified() => {
                    tracing::info!("Backoff skipped on request");
                }
                () = tokio::time::sleep(delay) => {}
            }
        }

        self.context.set_state(ConnectionState::Disconnected);
        tracing::info!(url = %self.config.url, "Stream client stopped");
        Ok(())
    }

    /// Read until the stream fails. Returns `None` when stopped.
    async fn read_stream(&self, mut stream: Box<dyn LineStream>) -> Option<DisconnectCause> {
        let timeout = self.config.heartbeat_timeout;
        let mut decoder = EventDecoder::new();
        let mut deadline = Instant::now() + timeout;

        loop {
            tokio::select! {
                biased;
                () = self.cancel.cancelled() => return None,
                () = self.reconnect.notified() => return Some(DisconnectCause::Requested),
                () = tokio::time::sleep_until(deadline) => {
                    return Some(DisconnectCause::Stale(timeout));
                }
                line = stream.next_line() => match line {
                    Some(Ok(line)) => {
                        deadline = Instant::now() + timeout;
                        self.context.record_event();
                        if let Some(frame) = decoder.push_line(&line) {
                            self.handle_frame(frame).await;
                            // Time spent waiting on a slow consumer is not silence.
                            deadline = Instant::now() + timeout;
                        }
                    }
                    Some(Err(e)) => return Some(DisconnectCause::Transport(e)),
                    None => return Some(DisconnectCause::Closed),
                },
            }
        }
    }

    async fn handle_frame(&self, frame: StreamFrame) {
        match frame {
            StreamFrame::Alert(alert) => {
                tracing::debug!(id = %alert.id, kind = %alert.kind, "Alert received");
                self.emit(ClientEvent::Alert(alert)).await;
            }
            StreamFrame::KeepAlive => tracing::trace!("Keep-alive received"),
            StreamFrame::Unrecognized(payload) => {
                tracing::debug!(len = payload.len(), "Ignoring unrecognized stream payload");
            }
        }
    }

    async fn emit(&self, event: ClientEvent) {
        tokio::select! {
            biased;
            () = self.cancel.cancelled() => {}
            result = self.event_tx.send(event) => {
                if result.is_err() {
                    tracing::debug!("Client event receiver dropped");
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn state_names() {
        assert_eq!(ConnectionState::Retrying.to_string(), "retrying");
        assert_eq!(
            serde_json::to_value(ConnectionState::Connected).unwrap(),
            "connected"
        );
    }

    #[test]
    fn fresh_context_is_disconnected() {
        let context = ConnectionContext::new(Duration::from_secs(2));
        let health = context.health();
        assert!(!health.connected);
        assert_eq!(health.state, ConnectionState::Disconnected);
        assert_eq!(health.consecutive_failures, 0);
        assert!(health.last_event_at.is_none());
        assert_eq!(health.current_backoff_ms, 2000);
    }

    #[test]
    fn context_tracks_retry_and_reset() {
        let context = ConnectionContext::new(Duration::from_secs(2));
        context.on_retry(3, Duration::from_secs(16));
        assert_eq!(context.state(), ConnectionState::Retrying);
        assert_eq!(context.health().consecutive_failures, 3);

        context.on_connected(Duration::from_secs(2));
        let health = context.health();
        assert!(health.connected);
        assert_eq!(health.consecutive_failures, 0);
        assert_eq!(health.current_backoff_ms, 2000);
        assert!(health.last_event_at.is_some());
    }

    #[test]
    fn config_builder_collects_headers() {
        let config = ClientConfig::new("http://relay/api/alerts-stream").with_header("X-API-Key", "k");
        assert_eq!(config.headers, vec![("X-API-Key".to_string(), "k".to_string())]);
        assert_eq!(config.heartbeat_timeout, Duration::from_secs(45));
    }

    #[test]
    fn stop_is_idempotent() {
        let (tx, _rx) = mpsc::channel(1);
        let transport = Arc::new(HttpTransport::new().unwrap());
        let client = ReconnectingClient::new(ClientConfig::new("http://127.0.0.1:1"), transport, tx);
        client.stop();
        client.stop();
        assert!(client.is_stopped());
    }
}
