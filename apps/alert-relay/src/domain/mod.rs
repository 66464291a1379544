//! Domain Layer - Core alert types and policies.
//!
//! This layer holds the alert model, deduplication policy and area matching
//! with no I/O. Everything here is synchronous and deterministic.

/// Alert entity, category table and upstream wire records.
pub mod alert;

/// Known-id deduplication of upstream snapshots.
pub mod dedup;

/// Two-stage area name matching.
pub mod matching;
