//! Application Layer - Port definitions.
//!
//! Interfaces between the alert pipeline and the systems it talks to: the
//! upstream feed, the alert store, the fan-out hub and outbound streams.

/// Port interfaces for external systems.
pub mod ports;
