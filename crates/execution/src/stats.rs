//! Explain/cost statistics collected per stage, per node and per query.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use tsq_common::{Result, TsqError};

/// Terminal state of a tracked stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum StageState {
    Executing,
    Finished,
    Error,
}

/// Cost of one operator inside a stage's plan-node tree.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct OperatorStats {
    pub identifier: String,
    pub start: i64,
    pub end: i64,
    pub cost: i64,
    #[serde(default)]
    pub error: Option<String>,
}

/// Cost of one stage of a local pipeline.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageStats {
    pub identifier: String,
    pub stage_type: String,
    pub state: StageState,
    pub start: i64,
    pub end: i64,
    pub cost: i64,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub operators: Vec<OperatorStats>,
}

/// Cost breakdown reported by one storage node.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LeafNodeStats {
    pub total_cost: i64,
    /// Encoded size of the response payload sent upstream.
    pub net_payload: u64,
    pub stages: Vec<StageStats>,
}

/// Cost breakdown reported by one intermediate broker, including its leaves.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BrokerNodeStats {
    pub wait_cost: i64,
    pub total_cost: i64,
    pub net_payload: u64,
    pub leaves: BTreeMap<String, LeafNodeStats>,
}

/// Query-wide cost breakdown assembled at the root.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct QueryStats {
    pub root: String,
    pub total_cost: i64,
    /// Stats merged from intermediate brokers, keyed by broker indicator.
    pub brokers: BTreeMap<String, BrokerNodeStats>,
    /// Stats merged from leaves that reported directly, keyed by storage indicator.
    pub leaves: BTreeMap<String, LeafNodeStats>,
}

impl QueryStats {
    pub fn new(root: impl Into<String>) -> Self {
        Self {
            root: root.into(),
            ..Self::default()
        }
    }

    pub fn merge_leaf(&mut self, node: &str, stats: LeafNodeStats) {
        self.leaves.insert(node.to_string(), stats);
    }

    pub fn merge_broker(&mut self, node: &str, stats: BrokerNodeStats) {
        self.brokers.insert(node.to_string(), stats);
    }

    pub fn is_empty(&self) -> bool {
        self.brokers.is_empty() && self.leaves.is_empty()
    }
}

pub fn encode_stats<T: Serialize>(stats: &T) -> Result<Vec<u8>> {
    serde_json::to_vec(stats).map_err(|e| TsqError::Execution(format!("stats encode failed: {e}")))
}

pub fn decode_stats<T: for<'de> Deserialize<'de>>(payload: &[u8]) -> Result<T> {
    serde_json::from_slice(payload)
        .map_err(|e| TsqError::Decode(format!("stats decode failed: {e}")))
}
