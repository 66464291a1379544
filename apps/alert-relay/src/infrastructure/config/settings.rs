//! Relay and Gateway Settings
//!
//! Configuration types for both binaries, loaded from environment variables.
//! Every setting has a default except the gateway's upstream stream URL.

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use crate::domain::dedup::DEFAULT_KNOWN_ID_CAPACITY;
use crate::infrastructure::broadcast::{
    DEFAULT_KEEP_ALIVE_INTERVAL, DEFAULT_SUBSCRIBER_CAPACITY, HubConfig,
};
use crate::infrastructure::client::{BackoffConfig, DEFAULT_HEARTBEAT_TIMEOUT};
use crate::infrastructure::poller::PollerConfig;
use crate::infrastructure::upstream::{DEFAULT_ALERTS_URL, DEFAULT_HISTORY_URL, UpstreamConfig};

/// Opaque credential forwarded to the upstream relay.
#[derive(Clone, PartialEq, Eq)]
pub struct ApiKey(String);

impl ApiKey {
    /// Wrap a key.
    #[must_use]
    pub const fn new(key: String) -> Self {
        Self(key)
    }

    /// The key value.
    #[must_use]
    pub fn expose(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Debug for ApiKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("ApiKey([REDACTED])")
    }
}

/// Server port settings.
#[derive(Debug, Clone, Copy)]
pub struct ServerSettings {
    /// Alert API port.
    pub api_port: u16,
    /// Health check HTTP port.
    pub health_port: u16,
}

/// Relay configuration.
#[derive(Debug, Clone)]
pub struct RelayConfig {
    /// Upstream feed endpoints.
    pub upstream: UpstreamConfig,
    /// Poll timing.
    pub poller: PollerConfig,
    /// Alert database file.
    pub database_path: PathBuf,
    /// Distribution hub settings.
    pub hub: HubConfig,
    /// Server ports.
    pub server: ServerSettings,
}

impl RelayConfig {
    /// Create configuration from environment variables.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::InvalidValue` if a variable cannot be parsed.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Create configuration from an arbitrary variable source.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::InvalidValue` if a variable cannot be parsed.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let env = Env(lookup);

        let upstream = UpstreamConfig {
            alerts_url: env.string_or("OREF_ALERTS_URL", DEFAULT_ALERTS_URL),
            history_url: env.string_or("OREF_HISTORY_URL", DEFAULT_HISTORY_URL),
            timeout: env.secs_or("UPSTREAM_TIMEOUT_SECS", Duration::from_secs(10))?,
        };

        let poller_defaults = PollerConfig::default();
        let poller = PollerConfig {
            poll_interval: env.millis_or("POLL_INTERVAL_MS", poller_defaults.poll_interval)?,
            history_sync_interval: env.secs_or(
                "HISTORY_SYNC_INTERVAL_SECS",
                poller_defaults.history_sync_interval,
            )?,
            known_id_capacity: env.parse_or("KNOWN_ID_CAPACITY", DEFAULT_KNOWN_ID_CAPACITY)?,
        };
        if poller.poll_interval.is_zero() {
            return Err(ConfigError::InvalidValue(
                "POLL_INTERVAL_MS".to_string(),
                "must be greater than zero".to_string(),
            ));
        }

        let hub = HubConfig {
            subscriber_capacity: env.parse_or("SUBSCRIBER_CAPACITY", DEFAULT_SUBSCRIBER_CAPACITY)?,
            keep_alive_interval: env
                .secs_or("KEEP_ALIVE_INTERVAL_SECS", DEFAULT_KEEP_ALIVE_INTERVAL)?,
        };

        let server = ServerSettings {
            api_port: env.parse_or("API_PORT", 8000)?,
            health_port: env.parse_or("HEALTH_PORT", 8082)?,
        };

        Ok(Self {
            upstream,
            poller,
            database_path: PathBuf::from(env.string_or("DATABASE_PATH", "data/alerts.db")),
            hub,
            server,
        })
    }
}

/// Gateway configuration.
#[derive(Debug, Clone)]
pub struct GatewayConfig {
    /// Relay stream to consume.
    pub upstream_url: String,
    /// Credential sent as `X-API-Key`.
    pub api_key: Option<ApiKey>,
    /// Area names to re-publish; empty re-publishes everything.
    pub watch_cities: Vec<String>,
    /// Liveness timeout for the upstream stream.
    pub heartbeat_timeout: Duration,
    /// Reconnection backoff.
    pub backoff: BackoffConfig,
    /// Distribution hub settings.
    pub hub: HubConfig,
    /// Server ports.
    pub server: ServerSettings,
}

impl GatewayConfig {
    /// Create configuration from environment variables.
    ///
    /// # Errors
    ///
    /// Returns an error if `UPSTREAM_STREAM_URL` is missing or empty, or a
    /// variable cannot be parsed.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Create configuration from an arbitrary variable source.
    ///
    /// # Errors
    ///
    /// Returns an error if `UPSTREAM_STREAM_URL` is missing or empty, or a
    /// variable cannot be parsed.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let env = Env(lookup);

        let upstream_url = env
            .get("UPSTREAM_STREAM_URL")
            .ok_or_else(|| ConfigError::MissingEnvVar("UPSTREAM_STREAM_URL".to_string()))?;
        if upstream_url.trim().is_empty() {
            return Err(ConfigError::EmptyValue("UPSTREAM_STREAM_URL".to_string()));
        }

        let api_key = env
            .get("API_KEY")
            .filter(|key| !key.trim().is_empty())
            .map(ApiKey::new);

        let watch_cities = env
            .get("WATCH_CITIES")
            .map(|raw| {
                raw.split(',')
                    .map(str::trim)
                    .filter(|city| !city.is_empty())
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default();

        let backoff_defaults = BackoffConfig::default();
        let backoff = BackoffConfig {
            initial_delay: env
                .millis_or("RECONNECT_DELAY_INITIAL_MS", backoff_defaults.initial_delay)?,
            max_delay: env.secs_or("RECONNECT_DELAY_MAX_SECS", backoff_defaults.max_delay)?,
            jitter_factor: env.parse_or("RECONNECT_JITTER", backoff_defaults.jitter_factor)?,
            max_attempts: env.parse_or("MAX_RECONNECT_ATTEMPTS", backoff_defaults.max_attempts)?,
            ..backoff_defaults
        };
        if !(0.0..=1.0).contains(&backoff.jitter_factor) {
            return Err(ConfigError::InvalidValue(
                "RECONNECT_JITTER".to_string(),
                "must be between 0 and 1".to_string(),
            ));
        }

        let hub = HubConfig {
            subscriber_capacity: env.parse_or("SUBSCRIBER_CAPACITY", DEFAULT_SUBSCRIBER_CAPACITY)?,
            keep_alive_interval: env
                .secs_or("KEEP_ALIVE_INTERVAL_SECS", DEFAULT_KEEP_ALIVE_INTERVAL)?,
        };

        let server = ServerSettings {
            api_port: env.parse_or("GATEWAY_PORT", 8002)?,
            health_port: env.parse_or("GATEWAY_HEALTH_PORT", 8083)?,
        };

        Ok(Self {
            upstream_url,
            api_key,
            watch_cities,
            heartbeat_timeout: env.secs_or("HEARTBEAT_TIMEOUT_SECS", DEFAULT_HEARTBEAT_TIMEOUT)?,
            backoff,
            hub,
            server,
        })
    }
}

/// Configuration error.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// Required environment variable is missing.
    #[error("missing required environment variable: {0}")]
    MissingEnvVar(String),
    /// Environment variable has empty value.
    #[error("environment variable {0} cannot be empty")]
    EmptyValue(String),
    /// Environment variable could not be parsed.
    #[error("environment variable {0} is invalid: {1}")]
    InvalidValue(String, String),
}

/// Typed access to a variable source. Blank values count as unset.
struct Env<F>(F);

impl<F> Env<F>
where
    F: Fn(&str) -> Option<String>,
{
    fn get(&self, key: &str) -> Option<String> {
        (self.0)(key)
    }

    fn string_or(&self, key: &str, default: &str) -> String {
        self.get(key)
            .filter(|v| !v.trim().is_empty())
            .unwrap_or_else(|| default.to_string())
    }

    fn parse_or<T>(&self, key: &str, default: T) -> Result<T, ConfigError>
    where
        T: FromStr,
        T::Err: std::fmt::Display,
    {
        match self.get(key).filter(|v| !v.trim().is_empty()) {
            Some(raw) => raw
                .trim()
                .parse()
                .map_err(|e: T::Err| ConfigError::InvalidValue(key.to_string(), e.to_string())),
            None => Ok(default),
        }
    }

    fn secs_or(&self, key: &str, default: Duration) -> Result<Duration, ConfigError> {
        self.parse_or::<u64>(key, default.as_secs())
            .map(Duration::from_secs)
    }

    fn millis_or(&self, key: &str, default: Duration) -> Result<Duration, ConfigError> {
        let default_ms = u64::try_from(default.as_millis()).unwrap_or(u64::MAX);
        self.parse_or::<u64>(key, default_ms)
            .map(Duration::from_millis)
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn vars(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn relay_defaults() {
        let config = RelayConfig::from_lookup(vars(&[])).unwrap();
        assert_eq!(config.upstream.alerts_url, DEFAULT_ALERTS_URL);
        assert_eq!(config.upstream.timeout, Duration::from_secs(10));
        assert_eq!(config.poller.poll_interval, Duration::from_secs(2));
        assert_eq!(config.poller.history_sync_interval, Duration::from_secs(300));
        assert_eq!(config.poller.known_id_capacity, 1024);
        assert_eq!(config.database_path, PathBuf::from("data/alerts.db"));
        assert_eq!(config.hub.subscriber_capacity, 64);
        assert_eq!(config.hub.keep_alive_interval, Duration::from_secs(30));
        assert_eq!(config.server.api_port, 8000);
        assert_eq!(config.server.health_port, 8082);
    }

    #[test]
    fn relay_overrides() {
        let config = RelayConfig::from_lookup(vars(&[
            ("POLL_INTERVAL_MS", "500"),
            ("HISTORY_SYNC_INTERVAL_SECS", "0"),
            ("DATABASE_PATH", "/tmp/a.db"),
            ("API_PORT", " 9000 "),
        ]))
        .unwrap();
        assert_eq!(config.poller.poll_interval, Duration::from_millis(500));
        assert!(config.poller.history_sync_interval.is_zero());
        assert_eq!(config.database_path, PathBuf::from("/tmp/a.db"));
        assert_eq!(config.server.api_port, 9000);
    }

    #[test]
    fn invalid_number_is_rejected() {
        let err = RelayConfig::from_lookup(vars(&[("API_PORT", "eighty")])).unwrap_err();
        assert!(matches!(err, ConfigError::InvalidValue(key, _) if key == "API_PORT"));
    }

    #[test]
    fn zero_poll_interval_is_rejected() {
        let err = RelayConfig::from_lookup(vars(&[("POLL_INTERVAL_MS", "0")])).unwrap_err();
        assert!(matches!(err, ConfigError::InvalidValue(..)));
    }

    #[test]
    fn gateway_requires_upstream() {
        assert!(matches!(
            GatewayConfig::from_lookup(vars(&[])),
            Err(ConfigError::MissingEnvVar(_))
        ));
        assert!(matches!(
            GatewayConfig::from_lookup(vars(&[("UPSTREAM_STREAM_URL", "  ")])),
            Err(ConfigError::EmptyValue(_))
        ));
    }

    #[test]
    fn gateway_defaults_and_lists() {
        let config = GatewayConfig::from_lookup(vars(&[
            ("UPSTREAM_STREAM_URL", "http://relay:8000/api/alerts-stream"),
            ("API_KEY", "secret"),
            ("WATCH_CITIES", "Ashkelon, Sderot,,"),
        ]))
        .unwrap();
        assert_eq!(config.watch_cities, vec!["Ashkelon", "Sderot"]);
        assert_eq!(config.api_key.as_ref().map(ApiKey::expose), Some("secret"));
        assert_eq!(config.heartbeat_timeout, Duration::from_secs(45));
        assert_eq!(config.backoff.initial_delay, Duration::from_secs(2));
        assert_eq!(config.backoff.max_delay, Duration::from_secs(60));
        assert_eq!(config.backoff.max_attempts, 0);
        assert_eq!(config.server.api_port, 8002);
        assert_eq!(config.server.health_port, 8083);
    }

    #[test]
    fn gateway_rejects_out_of_range_jitter() {
        let err = GatewayConfig::from_lookup(vars(&[
            ("UPSTREAM_STREAM_URL", "http://relay"),
            ("RECONNECT_JITTER", "1.5"),
        ]))
        .unwrap_err();
        assert!(matches!(err, ConfigError::InvalidValue(..)));
    }

    #[test]
    fn api_key_redacted_debug() {
        let config = GatewayConfig::from_lookup(vars(&[
            ("UPSTREAM_STREAM_URL", "http://relay"),
            ("API_KEY", "key123"),
        ]))
        .unwrap();
        let debug = format!("{config:?}");
        assert!(!debug.contains("key123"));
        assert!(debug.contains("[REDACTED]"));
    }
}
