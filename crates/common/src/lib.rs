//! Shared configuration, error types, IDs, node identity and observability primitives.
//!
//! Architecture role:
//! - defines query runtime and database configuration passed across layers
//! - provides the common [`TsqError`] / [`Result`] contracts
//! - hosts metrics and optional exporter utilities
//!
//! Key modules:
//! - [`config`]
//! - [`error`]
//! - [`ids`]
//! - [`node`]
//! - [`time`]
//! - [`metrics`]
//! - `metrics_exporter` (feature-gated)
//!
//! Feature flags:
//! - `profiling`: enables the metrics HTTP exporter helpers.

pub mod config;
pub mod error;
pub mod ids;
pub mod metrics;
#[cfg(feature = "profiling")]
pub mod metrics_exporter;
pub mod node;
pub mod time;

pub use config::{DatabaseConfig, QueryConfig};
pub use error::{Result, TsqError};
pub use ids::*;
pub use metrics::MetricsRegistry;
#[cfg(feature = "profiling")]
pub use metrics_exporter::{metrics_router, run_metrics_exporter};
pub use node::Node;
pub use time::TimeRange;
