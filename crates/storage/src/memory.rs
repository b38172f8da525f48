//! In-memory storage engine.
//!
//! Backs embedded clusters and tests. Data is held per shard as raw points;
//! scans down-sample on the fly. Metadata is tracked database-wide.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::{Arc, RwLock};

use tsq_common::{DatabaseConfig, Result, ShardId, TsqError};
use tsq_planner::{MetadataKind, MetadataQuery, TagFilter};

use crate::engine::{
    Database, MetadataIndex, MetricId, ScanRequest, SeriesId, Shard, StorageEngine,
};
use crate::series::TimeSeries;

/// Storage engine holding [`MemoryDatabase`]s by name.
#[derive(Default)]
pub struct MemoryEngine {
    databases: RwLock<HashMap<String, Arc<MemoryDatabase>>>,
}

impl std::fmt::Debug for MemoryEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let count = self.databases.read().map(|m| m.len()).unwrap_or_default();
        f.debug_struct("MemoryEngine")
            .field("databases", &count)
            .finish()
    }
}

impl MemoryEngine {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create (or return the existing) database serving `shards`.
    pub fn create_database(
        &self,
        name: &str,
        config: DatabaseConfig,
        shards: &[ShardId],
    ) -> Arc<MemoryDatabase> {
        let mut databases = self.databases.write().expect("memory engine lock poisoned");
        Arc::clone(databases.entry(name.to_string()).or_insert_with(|| {
            Arc::new(MemoryDatabase {
                name: name.to_string(),
                config,
                metadata: Arc::new(MemoryMetadata::default()),
                shards: shards
                    .iter()
                    .map(|id| (*id, Arc::new(MemoryShard::new(*id))))
                    .collect(),
            })
        }))
    }
}

impl StorageEngine for MemoryEngine {
    fn database(&self, name: &str) -> Option<Arc<dyn Database>> {
        self.databases
            .read()
            .expect("memory engine lock poisoned")
            .get(name)
            .map(|db| Arc::clone(db) as Arc<dyn Database>)
    }
}

/// Database with a fixed shard set.
pub struct MemoryDatabase {
    name: String,
    config: DatabaseConfig,
    metadata: Arc<MemoryMetadata>,
    shards: BTreeMap<ShardId, Arc<MemoryShard>>,
}

impl MemoryDatabase {
    /// Append one point, registering metric/tag/field metadata on first sight.
    ///
    /// # Errors
    /// Returns [`TsqError::NotFound`] when `shard` is not served by this database.
    pub fn write(
        &self,
        shard: ShardId,
        namespace: &str,
        metric_name: &str,
        tags: &[(&str, &str)],
        field: &str,
        timestamp: i64,
        value: f64,
    ) -> Result<()> {
        let target = self
            .shards
            .get(&shard)
            .ok_or_else(|| TsqError::NotFound(format!("shard {shard}")))?;
        let tags: BTreeMap<String, String> = tags
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        let metric_id = self.metadata.register(namespace, metric_name, &tags, field);
        target.append(metric_id, tags, field, timestamp, value);
        Ok(())
    }
}

impl Database for MemoryDatabase {
    fn name(&self) -> &str {
        &self.name
    }

    fn config(&self) -> DatabaseConfig {
        self.config.clone()
    }

    fn metadata(&self) -> Arc<dyn MetadataIndex> {
        Arc::clone(&self.metadata) as Arc<dyn MetadataIndex>
    }

    fn shard(&self, id: ShardId) -> Option<Arc<dyn Shard>> {
        self.shards
            .get(&id)
            .map(|s| Arc::clone(s) as Arc<dyn Shard>)
    }
}

#[derive(Debug, Default)]
struct MetricMeta {
    id: MetricId,
    fields: BTreeSet<String>,
    tag_values: BTreeMap<String, BTreeSet<String>>,
}

#[derive(Debug, Default)]
struct MetadataState {
    next_metric_id: MetricId,
    // namespace -> metric name -> meta
    metrics: BTreeMap<String, BTreeMap<String, MetricMeta>>,
}

#[derive(Debug, Default)]
struct MemoryMetadata {
    state: RwLock<MetadataState>,
}

impl MemoryMetadata {
    fn register(
        &self,
        namespace: &str,
        metric_name: &str,
        tags: &BTreeMap<String, String>,
        field: &str,
    ) -> MetricId {
        let mut state = self.state.write().expect("metadata lock poisoned");
        let next_id = state.next_metric_id;
        let meta = state
            .metrics
            .entry(namespace.to_string())
            .or_default()
            .entry(metric_name.to_string())
            .or_insert_with(|| MetricMeta {
                id: next_id,
                ..MetricMeta::default()
            });
        meta.fields.insert(field.to_string());
        for (k, v) in tags {
            meta.tag_values
                .entry(k.clone())
                .or_default()
                .insert(v.clone());
        }
        let id = meta.id;
        if id == next_id {
            state.next_metric_id += 1;
        }
        id
    }

    fn with_metric<T>(&self, metric_id: MetricId, f: impl FnOnce(&MetricMeta) -> T) -> Result<T> {
        let state = self.state.read().expect("metadata lock poisoned");
        state
            .metrics
            .values()
            .flat_map(|m| m.values())
            .find(|m| m.id == metric_id)
            .map(f)
            .ok_or_else(|| TsqError::NotFound(format!("metric id {metric_id}")))
    }
}

impl MetadataIndex for MemoryMetadata {
    fn metric_id(&self, namespace: &str, metric_name: &str) -> Result<MetricId> {
        let state = self.state.read().expect("metadata lock poisoned");
        state
            .metrics
            .get(namespace)
            .and_then(|m| m.get(metric_name))
            .map(|m| m.id)
            .ok_or_else(|| TsqError::NotFound(format!("metric {namespace}.{metric_name}")))
    }

    fn fields(&self, metric_id: MetricId) -> Result<Vec<String>> {
        self.with_metric(metric_id, |m| m.fields.iter().cloned().collect())
    }

    fn tag_keys(&self, metric_id: MetricId) -> Result<Vec<String>> {
        self.with_metric(metric_id, |m| m.tag_values.keys().cloned().collect())
    }

    fn suggest(&self, query: &MetadataQuery) -> Result<Vec<String>> {
        let state = self.state.read().expect("metadata lock poisoned");
        let metric = || {
            state
                .metrics
                .get(&query.namespace)
                .and_then(|m| m.get(&query.metric_name))
        };
        let values: Vec<String> = match query.kind {
            MetadataKind::Namespace => state.metrics.keys().cloned().collect(),
            MetadataKind::Metric => state
                .metrics
                .get(&query.namespace)
                .map(|m| m.keys().cloned().collect())
                .unwrap_or_default(),
            MetadataKind::TagKey => metric()
                .map(|m| m.tag_values.keys().cloned().collect())
                .unwrap_or_default(),
            MetadataKind::TagValue => metric()
                .and_then(|m| m.tag_values.get(&query.tag_key))
                .map(|v| v.iter().cloned().collect())
                .unwrap_or_default(),
            MetadataKind::Field => metric()
                .map(|m| m.fields.iter().cloned().collect())
                .unwrap_or_default(),
        };
        let mut out = values
            .into_iter()
            .filter(|v| v.starts_with(query.prefix.as_str()))
            .collect::<Vec<_>>();
        if query.limit > 0 {
            out.truncate(query.limit);
        }
        Ok(out)
    }
}

#[derive(Debug)]
struct SeriesData {
    metric_id: MetricId,
    tags: BTreeMap<String, String>,
    fields: BTreeMap<String, Vec<(i64, f64)>>,
}

/// Shard holding raw points per series.
#[derive(Debug)]
pub struct MemoryShard {
    id: ShardId,
    series: RwLock<Vec<SeriesData>>,
}

impl MemoryShard {
    fn new(id: ShardId) -> Self {
        Self {
            id,
            series: RwLock::new(Vec::new()),
        }
    }

    fn append(
        &self,
        metric_id: MetricId,
        tags: BTreeMap<String, String>,
        field: &str,
        timestamp: i64,
        value: f64,
    ) {
        let mut series = self.series.write().expect("shard lock poisoned");
        let idx = match series
            .iter()
            .position(|s| s.metric_id == metric_id && s.tags == tags)
        {
            Some(idx) => idx,
            None => {
                series.push(SeriesData {
                    metric_id,
                    tags,
                    fields: BTreeMap::new(),
                });
                series.len() - 1
            }
        };
        series[idx]
            .fields
            .entry(field.to_string())
            .or_default()
            .push((timestamp, value));
    }
}

impl Shard for MemoryShard {
    fn id(&self) -> ShardId {
        self.id
    }

    fn find_series(
        &self,
        metric_id: MetricId,
        filter: Option<&TagFilter>,
    ) -> Result<Vec<SeriesId>> {
        let series = self.series.read().expect("shard lock poisoned");
        Ok(series
            .iter()
            .enumerate()
            .filter(|(_, s)| s.metric_id == metric_id)
            .filter(|(_, s)| filter.map_or(true, |f| f.matches(&s.tags)))
            .map(|(idx, _)| idx as SeriesId)
            .collect())
    }

    fn scan(&self, request: &ScanRequest) -> Result<Vec<TimeSeries>> {
        let series = self.series.read().expect("shard lock poisoned");
        let mut groups: BTreeMap<BTreeMap<String, String>, TimeSeries> = BTreeMap::new();
        for id in &request.series_ids {
            let Some(data) = series.get(*id as usize) else {
                continue;
            };
            if data.metric_id != request.metric_id {
                continue;
            }
            let group_tags: BTreeMap<String, String> = request
                .group_by
                .iter()
                .filter_map(|k| data.tags.get(k).map(|v| (k.clone(), v.clone())))
                .collect();
            for select in &request.fields {
                let Some(points) = data.fields.get(&select.name) else {
                    continue;
                };
                let out = groups
                    .entry(group_tags.clone())
                    .or_insert_with(|| TimeSeries::new(group_tags.clone()))
                    .field_mut(&select.name, select.agg);
                for (ts, value) in points {
                    // The range is bucket-aligned: keep every point whose bucket it covers.
                    let bucket = tsq_common::time::truncate(*ts, request.interval_ms);
                    if !request.time_range.contains(bucket) {
                        continue;
                    }
                    let value = match select.agg {
                        tsq_planner::AggType::Count => 1.0,
                        _ => *value,
                    };
                    out.add_at(bucket, *ts, value);
                }
            }
        }
        Ok(groups.into_values().filter(|s| !s.is_empty()).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tsq_common::TimeRange;
    use tsq_planner::{AggType, FieldSelect};

    fn seeded() -> Arc<MemoryDatabase> {
        let engine = MemoryEngine::new();
        let db = engine.create_database("db", DatabaseConfig::new(&["10s"]), &[ShardId(1)]);
        for (host, ts, v) in [("a", 1_000, 1.0), ("a", 2_000, 3.0), ("b", 15_000, 5.0)] {
            db.write(ShardId(1), "ns", "cpu", &[("host", host), ("dc", "eu")], "usage", ts, v)
                .expect("write");
        }
        db
    }

    #[test]
    fn scan_groups_and_downsamples() {
        let db = seeded();
        let metric_id = db.metadata().metric_id("ns", "cpu").expect("metric");
        let shard = db.shard(ShardId(1)).expect("shard");
        let series_ids = shard.find_series(metric_id, None).expect("series");
        assert_eq!(series_ids.len(), 2);

        let result = shard
            .scan(&ScanRequest {
                metric_id,
                series_ids,
                fields: vec![FieldSelect::new("usage", AggType::Sum)],
                group_by: vec!["host".to_string()],
                time_range: TimeRange::new(0, 20_000),
                interval_ms: 10_000,
            })
            .expect("scan");
        assert_eq!(result.len(), 2);
        assert_eq!(result[0].tags.get("host").map(String::as_str), Some("a"));
        assert_eq!(result[0].fields["usage"].points.get(&0), Some(&4.0));
        assert_eq!(result[1].fields["usage"].points.get(&10_000), Some(&5.0));
    }

    #[test]
    fn find_series_applies_filter() {
        let db = seeded();
        let metric_id = db.metadata().metric_id("ns", "cpu").expect("metric");
        let shard = db.shard(ShardId(1)).expect("shard");
        let ids = shard
            .find_series(metric_id, Some(&TagFilter::eq("host", "b")))
            .expect("series");
        assert_eq!(ids, vec![1]);
    }

    #[test]
    fn suggest_filters_by_prefix_and_limit() {
        let db = seeded();
        let mut q = MetadataQuery::new(MetadataKind::TagValue);
        q.namespace = "ns".to_string();
        q.metric_name = "cpu".to_string();
        q.tag_key = "host".to_string();
        assert_eq!(
            db.metadata().suggest(&q).expect("suggest"),
            vec!["a".to_string(), "b".to_string()]
        );
        q.limit = 1;
        assert_eq!(db.metadata().suggest(&q).expect("suggest").len(), 1);

        let mut keys = MetadataQuery::new(MetadataKind::TagKey);
        keys.namespace = "ns".to_string();
        keys.metric_name = "cpu".to_string();
        keys.prefix = "d".to_string();
        assert_eq!(
            db.metadata().suggest(&keys).expect("suggest"),
            vec!["dc".to_string()]
        );
    }

    #[test]
    fn unknown_metric_is_not_found() {
        let db = seeded();
        let err = db.metadata().metric_id("ns", "mem").expect_err("missing");
        assert!(err.is_not_found());
    }

    fn scan_field(db: &MemoryDatabase, agg: AggType, range: TimeRange) -> Vec<TimeSeries> {
        let metric_id = db.metadata().metric_id("ns", "cpu").expect("metric");
        let shard = db.shard(ShardId(1)).expect("shard");
        let series_ids = shard.find_series(metric_id, None).expect("series");
        shard
            .scan(&ScanRequest {
                metric_id,
                series_ids,
                fields: vec![FieldSelect::new("usage", agg)],
                group_by: Vec::new(),
                time_range: range.truncate(10_000),
                interval_ms: 10_000,
            })
            .expect("scan")
    }

    #[test]
    fn points_inside_the_last_bucket_are_kept() {
        let engine = MemoryEngine::new();
        let db = engine.create_database("db", DatabaseConfig::new(&["10s"]), &[ShardId(1)]);
        for (ts, v) in [(1_000, 1.0), (15_000, 2.0)] {
            db.write(ShardId(1), "ns", "cpu", &[("host", "a")], "usage", ts, v)
                .expect("write");
        }

        let result = scan_field(&db, AggType::Sum, TimeRange::new(0, 19_999));
        let points = &result[0].fields["usage"].points;
        assert_eq!(points.get(&0), Some(&1.0));
        assert_eq!(points.get(&10_000), Some(&2.0));

        // a range inside one interval still covers that whole bucket
        let result = scan_field(&db, AggType::Sum, TimeRange::new(0, 9_999));
        assert_eq!(result.len(), 1);
        assert_eq!(result[0].fields["usage"].points.get(&0), Some(&1.0));
    }

    #[test]
    fn last_keeps_newest_point_not_last_written() {
        let engine = MemoryEngine::new();
        let db = engine.create_database("db", DatabaseConfig::new(&["10s"]), &[ShardId(1)]);
        for (ts, v) in [(5_000, 2.0), (1_000, 1.0)] {
            db.write(ShardId(1), "ns", "cpu", &[("host", "a")], "usage", ts, v)
                .expect("write");
        }
        let result = scan_field(&db, AggType::Last, TimeRange::new(0, 10_000));
        assert_eq!(result[0].fields["usage"].points[&0], 2.0);
        assert_eq!(result[0].fields["usage"].sources[&0], 5_000);
    }
}
