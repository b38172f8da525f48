use std::collections::BTreeMap;

use tsq_common::{Result, TsqError};
use tsq_storage::TimeSeries;

/// Merges partial series from shards/nodes by group tag set.
///
/// Output order is the tag-set order, so merged results are deterministic no
/// matter which partial arrives first.
#[derive(Debug, Default)]
pub struct GroupingAggregator {
    groups: BTreeMap<BTreeMap<String, String>, TimeSeries>,
}

impl GroupingAggregator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn merge(&mut self, series: TimeSeries) {
        match self.groups.get_mut(&series.tags) {
            Some(existing) => existing.merge(series),
            None => {
                self.groups.insert(series.tags.clone(), series);
            }
        }
    }

    pub fn merge_all(&mut self, series: impl IntoIterator<Item = TimeSeries>) {
        for s in series {
            self.merge(s);
        }
    }

    pub fn len(&self) -> usize {
        self.groups.len()
    }

    pub fn is_empty(&self) -> bool {
        self.groups.is_empty()
    }

    /// Drain merged groups, leaving the aggregator empty.
    pub fn take(&mut self) -> Vec<TimeSeries> {
        std::mem::take(&mut self.groups).into_values().collect()
    }

    pub fn into_series(self) -> Vec<TimeSeries> {
        self.groups.into_values().collect()
    }
}

pub fn encode_series(series: &[TimeSeries]) -> Result<Vec<u8>> {
    serde_json::to_vec(series)
        .map_err(|e| TsqError::Execution(format!("series encode failed: {e}")))
}

pub fn decode_series(payload: &[u8]) -> Result<Vec<TimeSeries>> {
    if payload.is_empty() {
        return Ok(Vec::new());
    }
    serde_json::from_slice(payload)
        .map_err(|e| TsqError::Decode(format!("series decode failed: {e}")))
}
