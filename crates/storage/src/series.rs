use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use tsq_planner::AggType;

/// Down-sampled points of one field, keyed by bucket start timestamp.
///
/// For [`AggType::Last`] each bucket also remembers the raw timestamp its
/// value came from, so merges keep the newest point regardless of write or
/// arrival order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldSeries {
    pub agg: AggType,
    pub points: BTreeMap<i64, f64>,
    /// Bucket -> source timestamp of the kept value; `Last` only.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub sources: BTreeMap<i64, i64>,
}

impl FieldSeries {
    pub fn new(agg: AggType) -> Self {
        Self {
            agg,
            points: BTreeMap::new(),
            sources: BTreeMap::new(),
        }
    }

    /// Fold one partial bucket value in with the field aggregate.
    ///
    /// Without a raw timestamp the bucket start stands in as the source.
    pub fn add(&mut self, timestamp: i64, value: f64) {
        self.add_at(timestamp, timestamp, value);
    }

    /// Fold in a value for `bucket` that was observed at `source`.
    pub fn add_at(&mut self, bucket: i64, source: i64, value: f64) {
        if self.agg != AggType::Last {
            let agg = self.agg;
            self.points
                .entry(bucket)
                .and_modify(|v| *v = agg.merge(*v, value))
                .or_insert(value);
            return;
        }
        let kept = (self.sources.get(&bucket), self.points.get(&bucket));
        if let (Some(&seen), Some(&current)) = kept {
            // equal timestamps keep the larger value so the outcome is order-independent
            if seen > source || (seen == source && current >= value) {
                return;
            }
        }
        self.sources.insert(bucket, source);
        self.points.insert(bucket, value);
    }

    pub fn merge(&mut self, other: FieldSeries) {
        for (bucket, value) in other.points {
            let source = other.sources.get(&bucket).copied().unwrap_or(bucket);
            self.add_at(bucket, source, value);
        }
    }
}

/// One result series: a group tag set plus its fields.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TimeSeries {
    /// Group-by tag values; empty for queries without group-by.
    pub tags: BTreeMap<String, String>,
    pub fields: BTreeMap<String, FieldSeries>,
}

impl TimeSeries {
    pub fn new(tags: BTreeMap<String, String>) -> Self {
        Self {
            tags,
            fields: BTreeMap::new(),
        }
    }

    pub fn field_mut(&mut self, name: &str, agg: AggType) -> &mut FieldSeries {
        self.fields
            .entry(name.to_string())
            .or_insert_with(|| FieldSeries::new(agg))
    }

    /// Merge another partial series of the same group.
    pub fn merge(&mut self, other: TimeSeries) {
        for (name, field) in other.fields {
            match self.fields.get_mut(&name) {
                Some(existing) => existing.merge(field),
                None => {
                    self.fields.insert(name, field);
                }
            }
        }
    }

    pub fn is_empty(&self) -> bool {
        self.fields.values().all(|f| f.points.is_empty())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn merge_combines_buckets_with_field_agg() {
        let mut a = TimeSeries::new(BTreeMap::new());
        a.field_mut("usage", AggType::Max).add(0, 1.0);
        a.field_mut("usage", AggType::Max).add(10, 5.0);

        let mut b = TimeSeries::new(BTreeMap::new());
        b.field_mut("usage", AggType::Max).add(10, 3.0);
        b.field_mut("usage", AggType::Max).add(20, 7.0);
        b.field_mut("load", AggType::Sum).add(0, 2.0);

        a.merge(b);
        let usage = &a.fields["usage"].points;
        assert_eq!(usage.get(&0), Some(&1.0));
        assert_eq!(usage.get(&10), Some(&5.0));
        assert_eq!(usage.get(&20), Some(&7.0));
        assert_eq!(a.fields["load"].points.get(&0), Some(&2.0));
        assert!(!a.is_empty());
    }

    #[test]
    fn last_keeps_newest_source_in_any_order() {
        let mut newer = FieldSeries::new(AggType::Last);
        newer.add_at(0, 5_000, 2.0);
        let mut older = FieldSeries::new(AggType::Last);
        older.add_at(0, 1_000, 1.0);

        let mut forward = older.clone();
        forward.merge(newer.clone());
        let mut backward = newer;
        backward.merge(older);

        assert_eq!(forward.points[&0], 2.0);
        assert_eq!(backward.points[&0], 2.0);
        assert_eq!(forward.sources[&0], 5_000);
    }

    #[test]
    fn last_sources_survive_the_wire() {
        let mut field = FieldSeries::new(AggType::Last);
        field.add_at(10_000, 14_000, 3.0);
        let raw = serde_json::to_vec(&field).expect("encode");
        let back: FieldSeries = serde_json::from_slice(&raw).expect("decode");
        assert_eq!(back.sources[&10_000], 14_000);

        let sum = serde_json::to_string(&FieldSeries::new(AggType::Sum)).expect("encode");
        assert!(!sum.contains("sources"));
    }
}
