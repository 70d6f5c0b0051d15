#![deny(missing_docs)]

//! Shared configuration, error types, and observability primitives for FMQ crates.
//!
//! Architecture role:
//! - defines engine/query configuration passed across layers
//! - provides common [`FmqError`] / [`Result`] contracts
//! - hosts the metrics registry used by operators and remote leaves
//!
//! Key modules:
//! - [`config`]
//! - [`error`]
//! - [`metrics`]

/// Engine and per-query configuration types.
pub mod config;
/// Shared error taxonomy.
pub mod error;
/// Metrics registry and Prometheus rendering helpers.
pub mod metrics;

pub use config::{EngineConfig, QueryOptions};
pub use error::{FmqError, Result};
pub use metrics::{global_metrics, MetricsRegistry};
