use serde::{Deserialize, Serialize};
use tsq_common::{Node, Result, ShardId, TsqError};

/// Execution topology for one distributed query.
///
/// Built once by [`crate::PhysicalPlanner`], then serialized into every task
/// request so each intermediate/leaf can locate itself by node indicator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PhysicalPlan {
    /// Target database name.
    pub database: String,
    /// Originating broker.
    pub root: Root,
    /// Peer brokers that pre-merge a slice of leaves; empty for leaves-only plans.
    #[serde(default)]
    pub intermediates: Vec<Intermediate>,
    /// Storage nodes executing the local scan work.
    pub leaves: Vec<Leaf>,
}

/// Originating node and how many direct children it waits for.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Root {
    pub indicator: String,
    pub num_of_task: usize,
}

/// Broker peer that merges results from its leaves before replying to `parent`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Intermediate {
    pub parent: String,
    pub indicator: String,
    pub num_of_task: usize,
    /// Pure result sink: the node must not fan out or forward anything.
    #[serde(default)]
    pub receive_only: bool,
}

/// Storage node owning a disjoint subset of shards.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Leaf {
    /// Node that consumes this leaf's response.
    pub parent: String,
    pub indicator: String,
    pub shard_ids: Vec<ShardId>,
    pub receivers: Vec<Node>,
}

impl PhysicalPlan {
    pub fn new(database: impl Into<String>, root: Root) -> Self {
        Self {
            database: database.into(),
            root,
            intermediates: Vec::new(),
            leaves: Vec::new(),
        }
    }

    pub fn add_intermediate(&mut self, intermediate: Intermediate) {
        self.intermediates.push(intermediate);
    }

    pub fn add_leaf(&mut self, leaf: Leaf) {
        self.leaves.push(leaf);
    }

    pub fn find_leaf(&self, indicator: &str) -> Option<&Leaf> {
        self.leaves.iter().find(|l| l.indicator == indicator)
    }

    pub fn find_intermediate(&self, indicator: &str) -> Option<&Intermediate> {
        self.intermediates.iter().find(|i| i.indicator == indicator)
    }

    /// Leaves whose response is consumed by `indicator`.
    pub fn leaves_reporting_to(&self, indicator: &str) -> usize {
        self.leaves.iter().filter(|l| l.parent == indicator).count()
    }

    /// All shard ids covered by the plan, sorted.
    pub fn shard_ids(&self) -> Vec<ShardId> {
        let mut ids = self
            .leaves
            .iter()
            .flat_map(|l| l.shard_ids.iter().copied())
            .collect::<Vec<_>>();
        ids.sort();
        ids
    }

    pub fn encode(&self) -> Result<Vec<u8>> {
        serde_json::to_vec(self)
            .map_err(|e| TsqError::Execution(format!("physical plan encode failed: {e}")))
    }

    pub fn decode(payload: &[u8]) -> Result<Self> {
        serde_json::from_slice(payload)
            .map_err(|e| TsqError::Decode(format!("physical plan decode failed: {e}")))
    }
}
