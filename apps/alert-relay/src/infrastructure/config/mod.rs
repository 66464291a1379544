//! Configuration Module
//!
//! Configuration loading for the relay and gateway binaries.

mod settings;

pub use settings::{ApiKey, ConfigError, GatewayConfig, RelayConfig, ServerSettings};
