use std::sync::Arc;

use tsq_common::{DatabaseConfig, Result, ShardId, TimeRange};
use tsq_planner::{FieldSelect, MetadataQuery, TagFilter};

use crate::series::TimeSeries;

/// Metric identifier inside one database.
pub type MetricId = u32;
/// Series identifier inside one shard.
pub type SeriesId = u32;

/// Node-local storage engine entry point.
pub trait StorageEngine: Send + Sync {
    /// Resolve an opened database by name.
    fn database(&self, name: &str) -> Option<Arc<dyn Database>>;
}

/// One opened database on a storage node.
pub trait Database: Send + Sync {
    fn name(&self) -> &str;

    fn config(&self) -> DatabaseConfig;

    fn metadata(&self) -> Arc<dyn MetadataIndex>;

    /// Resolve a shard served by this node; `None` when the shard lives elsewhere.
    fn shard(&self, id: ShardId) -> Option<Arc<dyn Shard>>;
}

/// Database-wide metric/tag/field metadata.
///
/// Lookups return [`tsq_common::TsqError::NotFound`] for unknown names so
/// callers can tell empty results apart from failures.
pub trait MetadataIndex: Send + Sync {
    fn metric_id(&self, namespace: &str, metric_name: &str) -> Result<MetricId>;

    fn fields(&self, metric_id: MetricId) -> Result<Vec<String>>;

    fn tag_keys(&self, metric_id: MetricId) -> Result<Vec<String>>;

    /// Enumerate metadata values for a suggestion query, sorted and limited.
    fn suggest(&self, query: &MetadataQuery) -> Result<Vec<String>>;
}

/// Scan request for one shard.
#[derive(Debug, Clone)]
pub struct ScanRequest {
    pub metric_id: MetricId,
    pub series_ids: Vec<SeriesId>,
    pub fields: Vec<FieldSelect>,
    pub group_by: Vec<String>,
    /// Bucket-aligned range; a point is selected when its bucket start falls inside.
    pub time_range: TimeRange,
    pub interval_ms: i64,
}

/// One shard's series index and data.
pub trait Shard: Send + Sync {
    fn id(&self) -> ShardId;

    /// Series of `metric_id` matching `filter`; all series when `filter` is `None`.
    fn find_series(&self, metric_id: MetricId, filter: Option<&TagFilter>)
        -> Result<Vec<SeriesId>>;

    /// Read, down-sample and group the requested series.
    fn scan(&self, request: &ScanRequest) -> Result<Vec<TimeSeries>>;
}
