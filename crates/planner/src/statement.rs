//! Parsed query statements as shipped to leaves in the request payload.
//!
//! The query-language grammar lives outside this workspace; these types are
//! the already-parsed form a broker receives.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use tsq_common::{Result, TimeRange, TsqError};

/// Field-level aggregate applied during down-sampling and cross-node merge.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AggType {
    Sum,
    Count,
    Min,
    Max,
    /// Keeps the value with the newest source timestamp.
    Last,
}

impl AggType {
    /// Merge two partial values of the same bucket.
    ///
    /// `Last` carries no timestamps here and takes `incoming`; timestamped
    /// merging happens in the series model.
    pub fn merge(self, current: f64, incoming: f64) -> f64 {
        match self {
            AggType::Sum | AggType::Count => current + incoming,
            AggType::Min => current.min(incoming),
            AggType::Max => current.max(incoming),
            AggType::Last => incoming,
        }
    }
}

/// One selected field with its aggregate.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldSelect {
    pub name: String,
    pub agg: AggType,
}

impl FieldSelect {
    pub fn new(name: impl Into<String>, agg: AggType) -> Self {
        Self {
            name: name.into(),
            agg,
        }
    }
}

/// Tag predicate evaluated against a series' tag set.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum TagFilter {
    Equals { key: String, value: String },
    In { key: String, values: Vec<String> },
    Like { key: String, prefix: String },
    And(Box<TagFilter>, Box<TagFilter>),
    Or(Box<TagFilter>, Box<TagFilter>),
    Not(Box<TagFilter>),
}

impl TagFilter {
    pub fn eq(key: impl Into<String>, value: impl Into<String>) -> Self {
        TagFilter::Equals {
            key: key.into(),
            value: value.into(),
        }
    }

    pub fn matches(&self, tags: &BTreeMap<String, String>) -> bool {
        match self {
            TagFilter::Equals { key, value } => tags.get(key) == Some(value),
            TagFilter::In { key, values } => tags.get(key).is_some_and(|v| values.contains(v)),
            TagFilter::Like { key, prefix } => {
                tags.get(key).is_some_and(|v| v.starts_with(prefix.as_str()))
            }
            TagFilter::And(l, r) => l.matches(tags) && r.matches(tags),
            TagFilter::Or(l, r) => l.matches(tags) || r.matches(tags),
            TagFilter::Not(inner) => !inner.matches(tags),
        }
    }

    /// Tag keys referenced by this predicate.
    pub fn tag_keys(&self) -> Vec<String> {
        let mut keys = Vec::new();
        self.collect_keys(&mut keys);
        keys.sort();
        keys.dedup();
        keys
    }

    fn collect_keys(&self, out: &mut Vec<String>) {
        match self {
            TagFilter::Equals { key, .. }
            | TagFilter::In { key, .. }
            | TagFilter::Like { key, .. } => out.push(key.clone()),
            TagFilter::And(l, r) | TagFilter::Or(l, r) => {
                l.collect_keys(out);
                r.collect_keys(out);
            }
            TagFilter::Not(inner) => inner.collect_keys(out),
        }
    }
}

/// Metric data query.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricQuery {
    pub namespace: String,
    pub metric_name: String,
    pub fields: Vec<FieldSelect>,
    #[serde(default)]
    pub condition: Option<TagFilter>,
    #[serde(default)]
    pub group_by: Vec<String>,
    pub time_range: TimeRange,
    /// Down-sampling interval in milliseconds; `0` means "use the database default".
    #[serde(default)]
    pub interval_ms: i64,
    /// Collect per-stage stats and return them with the result.
    #[serde(default)]
    pub explain: bool,
    /// Max number of result series; `0` means unlimited.
    #[serde(default)]
    pub limit: usize,
}

impl MetricQuery {
    pub fn new(metric_name: impl Into<String>, fields: Vec<FieldSelect>, range: TimeRange) -> Self {
        Self {
            namespace: String::new(),
            metric_name: metric_name.into(),
            fields,
            condition: None,
            group_by: Vec::new(),
            time_range: range,
            interval_ms: 0,
            explain: false,
            limit: 0,
        }
    }

    pub fn has_group_by(&self) -> bool {
        !self.group_by.is_empty()
    }
}

/// What a metadata suggestion query enumerates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MetadataKind {
    Namespace,
    Metric,
    TagKey,
    TagValue,
    Field,
}

/// Metadata suggestion query.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetadataQuery {
    pub kind: MetadataKind,
    #[serde(default)]
    pub namespace: String,
    #[serde(default)]
    pub metric_name: String,
    #[serde(default)]
    pub tag_key: String,
    #[serde(default)]
    pub prefix: String,
    /// Max number of values; `0` means unlimited.
    #[serde(default)]
    pub limit: usize,
}

impl MetadataQuery {
    pub fn new(kind: MetadataKind) -> Self {
        Self {
            kind,
            namespace: String::new(),
            metric_name: String::new(),
            tag_key: String::new(),
            prefix: String::new(),
            limit: 0,
        }
    }
}

/// Statement carried in a task request payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Statement {
    Metric(MetricQuery),
    Metadata(MetadataQuery),
}

impl Statement {
    pub fn encode(&self) -> Result<Vec<u8>> {
        serde_json::to_vec(self)
            .map_err(|e| TsqError::Execution(format!("statement encode failed: {e}")))
    }

    pub fn decode(payload: &[u8]) -> Result<Self> {
        serde_json::from_slice(payload)
            .map_err(|e| TsqError::Decode(format!("statement decode failed: {e}")))
    }
}
