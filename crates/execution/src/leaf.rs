//! Storage-side stages executed by a leaf pipeline.
//!
//! Data queries unfold as
//! `metadata lookup -> [series filter] -> data scan -> aggregate`, once per
//! local shard. Metadata queries run a single suggest stage.

use std::sync::{Arc, Mutex};

use tracing::debug;
use tsq_common::{Result, ShardId, TsqError};
use tsq_planner::{AggType, FieldSelect, MetadataQuery, MetricQuery};
use tsq_storage::{Database, MetricId, ScanRequest, SeriesId, Shard, TimeSeries};

use crate::aggregation::GroupingAggregator;
use crate::stage::{Operator, PlanNode, Stage, StageType};

/// Metric id, fields and group-by keys resolved against database metadata.
#[derive(Debug, Clone, PartialEq)]
pub struct ResolvedMetric {
    pub metric_id: MetricId,
    pub fields: Vec<FieldSelect>,
    pub group_by: Vec<String>,
}

/// Shared state of one leaf data query across all of its stages.
pub struct LeafExecuteContext {
    database: Arc<dyn Database>,
    query: MetricQuery,
    shard_ids: Vec<ShardId>,
    resolved: Mutex<Option<ResolvedMetric>>,
    aggregator: Mutex<GroupingAggregator>,
}

impl LeafExecuteContext {
    pub fn new(
        database: Arc<dyn Database>,
        query: MetricQuery,
        shard_ids: Vec<ShardId>,
    ) -> Arc<Self> {
        Arc::new(Self {
            database,
            query,
            shard_ids,
            resolved: Mutex::new(None),
            aggregator: Mutex::new(GroupingAggregator::new()),
        })
    }

    pub fn query(&self) -> &MetricQuery {
        &self.query
    }

    pub fn resolved(&self) -> Option<ResolvedMetric> {
        self.resolved
            .lock()
            .expect("leaf context lock poisoned")
            .clone()
    }

    /// Drain the merged series of every shard scanned so far.
    pub fn take_result(&self) -> Vec<TimeSeries> {
        self.aggregator
            .lock()
            .expect("leaf context lock poisoned")
            .take()
    }

    fn merge(&self, partials: Vec<TimeSeries>) {
        self.aggregator
            .lock()
            .expect("leaf context lock poisoned")
            .merge_all(partials);
    }

    fn resolve(&self) -> Result<()> {
        let metadata = self.database.metadata();
        let metric_id = metadata.metric_id(&self.query.namespace, &self.query.metric_name)?;
        let known_fields = metadata.fields(metric_id)?;
        let fields = if self.query.fields.is_empty() {
            known_fields
                .into_iter()
                .map(|name| FieldSelect::new(name, AggType::Last))
                .collect()
        } else {
            for field in &self.query.fields {
                if !known_fields.contains(&field.name) {
                    return Err(TsqError::NotFound(format!(
                        "field {} of metric {}",
                        field.name, self.query.metric_name
                    )));
                }
            }
            self.query.fields.clone()
        };
        let tag_keys = metadata.tag_keys(metric_id)?;
        if let Some(missing) = self.query.group_by.iter().find(|k| !tag_keys.contains(k)) {
            return Err(TsqError::NotFound(format!(
                "tag key {missing} of metric {}",
                self.query.metric_name
            )));
        }
        *self.resolved.lock().expect("leaf context lock poisoned") = Some(ResolvedMetric {
            metric_id,
            fields,
            group_by: self.query.group_by.clone(),
        });
        Ok(())
    }
}

struct LookupOperator {
    ctx: Arc<LeafExecuteContext>,
}

impl Operator for LookupOperator {
    fn identifier(&self) -> String {
        format!(
            "lookup({}.{})",
            self.ctx.query.namespace, self.ctx.query.metric_name
        )
    }

    fn execute(&self) -> Result<()> {
        self.ctx.resolve()
    }
}

/// Resolves metric metadata, then fans out one branch per local shard.
pub struct MetadataLookupStage {
    ctx: Arc<LeafExecuteContext>,
}

impl MetadataLookupStage {
    pub fn new(ctx: Arc<LeafExecuteContext>) -> Self {
        Self { ctx }
    }
}

impl Stage for MetadataLookupStage {
    fn stage_type(&self) -> StageType {
        StageType::MetadataLookup
    }

    fn plan(&self) -> Option<PlanNode> {
        Some(PlanNode::new(Arc::new(LookupOperator {
            ctx: Arc::clone(&self.ctx),
        })))
    }

    fn next_stages(&self) -> Vec<Arc<dyn Stage>> {
        let Some(resolved) = self.ctx.resolved() else {
            return Vec::new();
        };
        let mut next: Vec<Arc<dyn Stage>> = Vec::new();
        for shard_id in &self.ctx.shard_ids {
            let Some(shard) = self.ctx.database.shard(*shard_id) else {
                debug!(
                    shard = %shard_id,
                    database = self.ctx.database.name(),
                    "shard not served locally"
                );
                continue;
            };
            if self.ctx.query.condition.is_some() {
                next.push(Arc::new(SeriesFilterStage::new(
                    Arc::clone(&self.ctx),
                    resolved.metric_id,
                    shard,
                )));
            } else {
                next.push(Arc::new(DataScanStage::new(
                    Arc::clone(&self.ctx),
                    resolved.clone(),
                    shard,
                    None,
                )));
            }
        }
        next
    }
}

struct FilterOperator {
    ctx: Arc<LeafExecuteContext>,
    metric_id: MetricId,
    shard: Arc<dyn Shard>,
    found: Arc<Mutex<Vec<SeriesId>>>,
}

impl Operator for FilterOperator {
    fn identifier(&self) -> String {
        format!("series_filter(shard={})", self.shard.id())
    }

    fn execute(&self) -> Result<()> {
        let ids = self
            .shard
            .find_series(self.metric_id, self.ctx.query.condition.as_ref())?;
        if ids.is_empty() {
            return Err(TsqError::NotFound(format!(
                "no series matched in shard {}",
                self.shard.id()
            )));
        }
        *self.found.lock().expect("filter lock poisoned") = ids;
        Ok(())
    }
}

/// Evaluates the tag condition against one shard's series index.
pub struct SeriesFilterStage {
    ctx: Arc<LeafExecuteContext>,
    metric_id: MetricId,
    shard: Arc<dyn Shard>,
    found: Arc<Mutex<Vec<SeriesId>>>,
}

impl SeriesFilterStage {
    pub fn new(ctx: Arc<LeafExecuteContext>, metric_id: MetricId, shard: Arc<dyn Shard>) -> Self {
        Self {
            ctx,
            metric_id,
            shard,
            found: Arc::new(Mutex::new(Vec::new())),
        }
    }
}

impl Stage for SeriesFilterStage {
    fn stage_type(&self) -> StageType {
        StageType::SeriesFilter
    }

    fn identifier(&self) -> String {
        format!("series_filter[{}]", self.shard.id())
    }

    fn is_async(&self) -> bool {
        true
    }

    fn plan(&self) -> Option<PlanNode> {
        Some(PlanNode::ignore_not_found(Arc::new(FilterOperator {
            ctx: Arc::clone(&self.ctx),
            metric_id: self.metric_id,
            shard: Arc::clone(&self.shard),
            found: Arc::clone(&self.found),
        })))
    }

    fn next_stages(&self) -> Vec<Arc<dyn Stage>> {
        let ids = std::mem::take(&mut *self.found.lock().expect("filter lock poisoned"));
        if ids.is_empty() {
            return Vec::new();
        }
        let Some(resolved) = self.ctx.resolved() else {
            return Vec::new();
        };
        vec![Arc::new(DataScanStage::new(
            Arc::clone(&self.ctx),
            resolved,
            Arc::clone(&self.shard),
            Some(ids),
        ))]
    }
}

struct ScanOperator {
    ctx: Arc<LeafExecuteContext>,
    resolved: ResolvedMetric,
    shard: Arc<dyn Shard>,
    series_ids: Option<Vec<SeriesId>>,
    partials: Arc<Mutex<Vec<TimeSeries>>>,
}

impl Operator for ScanOperator {
    fn identifier(&self) -> String {
        format!("data_scan(shard={})", self.shard.id())
    }

    fn execute(&self) -> Result<()> {
        let series_ids = match &self.series_ids {
            Some(ids) => ids.clone(),
            None => self.shard.find_series(self.resolved.metric_id, None)?,
        };
        if series_ids.is_empty() {
            return Ok(());
        }
        let query = &self.ctx.query;
        let series = self.shard.scan(&ScanRequest {
            metric_id: self.resolved.metric_id,
            series_ids,
            fields: self.resolved.fields.clone(),
            group_by: self.resolved.group_by.clone(),
            time_range: query.time_range,
            interval_ms: query.interval_ms,
        })?;
        *self.partials.lock().expect("scan lock poisoned") = series;
        Ok(())
    }
}

/// Reads and down-samples one shard's series.
pub struct DataScanStage {
    ctx: Arc<LeafExecuteContext>,
    resolved: ResolvedMetric,
    shard: Arc<dyn Shard>,
    series_ids: Option<Vec<SeriesId>>,
    partials: Arc<Mutex<Vec<TimeSeries>>>,
}

impl DataScanStage {
    /// `series_ids == None` scans every series of the metric.
    pub fn new(
        ctx: Arc<LeafExecuteContext>,
        resolved: ResolvedMetric,
        shard: Arc<dyn Shard>,
        series_ids: Option<Vec<SeriesId>>,
    ) -> Self {
        Self {
            ctx,
            resolved,
            shard,
            series_ids,
            partials: Arc::new(Mutex::new(Vec::new())),
        }
    }
}

impl Stage for DataScanStage {
    fn stage_type(&self) -> StageType {
        StageType::DataScan
    }

    fn identifier(&self) -> String {
        format!("data_scan[{}]", self.shard.id())
    }

    fn is_async(&self) -> bool {
        true
    }

    fn plan(&self) -> Option<PlanNode> {
        Some(PlanNode::new(Arc::new(ScanOperator {
            ctx: Arc::clone(&self.ctx),
            resolved: self.resolved.clone(),
            shard: Arc::clone(&self.shard),
            series_ids: self.series_ids.clone(),
            partials: Arc::clone(&self.partials),
        })))
    }

    fn next_stages(&self) -> Vec<Arc<dyn Stage>> {
        let partials = std::mem::take(&mut *self.partials.lock().expect("scan lock poisoned"));
        if partials.is_empty() {
            return Vec::new();
        }
        vec![Arc::new(AggregateStage::new(
            Arc::clone(&self.ctx),
            self.shard.id(),
            partials,
        ))]
    }
}

struct AggregateOperator {
    ctx: Arc<LeafExecuteContext>,
    shard_id: ShardId,
    partials: Mutex<Vec<TimeSeries>>,
}

impl Operator for AggregateOperator {
    fn identifier(&self) -> String {
        format!("aggregate(shard={})", self.shard_id)
    }

    fn execute(&self) -> Result<()> {
        let partials = std::mem::take(&mut *self.partials.lock().expect("aggregate lock poisoned"));
        self.ctx.merge(partials);
        Ok(())
    }
}

/// Merges one shard's partial series into the leaf's grouping aggregator.
pub struct AggregateStage {
    ctx: Arc<LeafExecuteContext>,
    shard_id: ShardId,
    partials: Mutex<Vec<TimeSeries>>,
}

impl AggregateStage {
    pub fn new(ctx: Arc<LeafExecuteContext>, shard_id: ShardId, partials: Vec<TimeSeries>) -> Self {
        Self {
            ctx,
            shard_id,
            partials: Mutex::new(partials),
        }
    }
}

impl Stage for AggregateStage {
    fn stage_type(&self) -> StageType {
        StageType::Aggregate
    }

    fn identifier(&self) -> String {
        format!("aggregate[{}]", self.shard_id)
    }

    fn plan(&self) -> Option<PlanNode> {
        let partials = std::mem::take(&mut *self.partials.lock().expect("aggregate lock poisoned"));
        Some(PlanNode::new(Arc::new(AggregateOperator {
            ctx: Arc::clone(&self.ctx),
            shard_id: self.shard_id,
            partials: Mutex::new(partials),
        })))
    }
}

/// Shared state of one leaf metadata query.
pub struct LeafMetadataContext {
    database: Arc<dyn Database>,
    query: MetadataQuery,
    values: Mutex<Vec<String>>,
}

impl LeafMetadataContext {
    pub fn new(database: Arc<dyn Database>, query: MetadataQuery) -> Arc<Self> {
        Arc::new(Self {
            database,
            query,
            values: Mutex::new(Vec::new()),
        })
    }

    pub fn take_result(&self) -> Vec<String> {
        std::mem::take(&mut *self.values.lock().expect("metadata context lock poisoned"))
    }
}

struct SuggestOperator {
    ctx: Arc<LeafMetadataContext>,
}

impl Operator for SuggestOperator {
    fn identifier(&self) -> String {
        format!("suggest({:?})", self.ctx.query.kind)
    }

    fn execute(&self) -> Result<()> {
        let values = self.ctx.database.metadata().suggest(&self.ctx.query)?;
        *self.ctx.values.lock().expect("metadata context lock poisoned") = values;
        Ok(())
    }
}

/// Enumerates namespaces, metrics, tag keys/values or fields.
pub struct MetadataSuggestStage {
    ctx: Arc<LeafMetadataContext>,
}

impl MetadataSuggestStage {
    pub fn new(ctx: Arc<LeafMetadataContext>) -> Self {
        Self { ctx }
    }
}

impl Stage for MetadataSuggestStage {
    fn stage_type(&self) -> StageType {
        StageType::MetadataSuggest
    }

    fn is_async(&self) -> bool {
        true
    }

    fn plan(&self) -> Option<PlanNode> {
        Some(PlanNode::new(Arc::new(SuggestOperator {
            ctx: Arc::clone(&self.ctx),
        })))
    }
}
