use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::time::parse_interval;

/// Broker/storage query runtime knobs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueryConfig {
    /// Age after which an unfinished task context is evicted by the reaper.
    pub task_ttl_ms: u64,
    /// Period of the task reaper sweep.
    pub reap_interval_ms: u64,
    /// How long a caller waits for a merged result before giving up.
    pub query_timeout_ms: u64,
    /// Max concurrently running stage/dispatch work items.
    pub worker_pool_size: usize,
    /// Collect per-stage stats even when the query did not ask for explain.
    pub explain_by_default: bool,
}

impl Default for QueryConfig {
    fn default() -> Self {
        Self {
            task_ttl_ms: 60_000,
            reap_interval_ms: 10_000,
            query_timeout_ms: 30_000,
            worker_pool_size: 16,
            explain_by_default: false,
        }
    }
}

impl QueryConfig {
    pub fn task_ttl(&self) -> Duration {
        Duration::from_millis(self.task_ttl_ms)
    }

    pub fn reap_interval(&self) -> Duration {
        Duration::from_millis(self.reap_interval_ms.max(1))
    }

    pub fn query_timeout(&self) -> Duration {
        Duration::from_millis(self.query_timeout_ms)
    }
}

/// Per-database options consulted by the physical planner.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DatabaseConfig {
    /// Storage intervals such as `"10s"` or `"5m"`; the first one is the default query interval.
    pub intervals: Vec<String>,
}

impl DatabaseConfig {
    pub fn new(intervals: &[&str]) -> Self {
        Self {
            intervals: intervals.iter().map(|s| s.to_string()).collect(),
        }
    }

    /// Default query interval in milliseconds.
    ///
    /// # Errors
    /// Returns [`crate::TsqError::InvalidConfig`] when no interval is configured
    /// or the first one cannot be parsed.
    pub fn default_interval_ms(&self) -> Result<i64> {
        let first = self.intervals.first().ok_or_else(|| {
            crate::TsqError::InvalidConfig("database has no configured interval".to_string())
        })?;
        parse_interval(first)
    }
}
