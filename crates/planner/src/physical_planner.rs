//! Physical plan builder: turns a query plus cluster topology into a
//! root / intermediate / leaf task tree.
//!
//! Topology rules:
//! - intermediates are used only for group-by queries that touch more than one
//!   storage node while at least one other broker is alive; grouping needs a
//!   merge step only when results must be regrouped across storage nodes;
//! - otherwise every leaf reports straight to the root.
//!
//! Partitioning is deterministic: storage nodes and brokers are ordered by
//! indicator before slicing.

use std::collections::{BTreeMap, HashSet};

use tracing::debug;
use tsq_common::{DatabaseConfig, Node, Result, ShardId, TsqError};

use crate::physical_plan::{Intermediate, Leaf, PhysicalPlan, Root};
use crate::statement::MetricQuery;

/// Cluster view captured for one planning call.
#[derive(Debug, Clone)]
pub struct PlanContext {
    pub database: String,
    pub database_config: DatabaseConfig,
    /// Storage node indicator -> shards it serves for this query.
    pub storage_nodes: BTreeMap<String, Vec<ShardId>>,
    /// Broker building the plan (the root).
    pub current_node: Node,
    /// Live broker nodes; the current node may or may not be included.
    pub live_brokers: Vec<Node>,
}

/// Builds [`PhysicalPlan`]s from a [`PlanContext`].
#[derive(Debug)]
pub struct PhysicalPlanner {
    ctx: PlanContext,
}

impl PhysicalPlanner {
    pub fn new(ctx: PlanContext) -> Self {
        Self { ctx }
    }

    /// Plan a metric data query.
    ///
    /// Side effect: fills in the default interval when the query has none and
    /// aligns the query time range down to interval boundaries.
    ///
    /// # Errors
    /// - [`TsqError::NoAvailableStorageNode`] when no storage node holds a replica
    /// - [`TsqError::InvalidConfig`] when the default interval cannot be resolved
    pub fn plan_metric(&self, query: &mut MetricQuery) -> Result<PhysicalPlan> {
        let storage_nodes = self.storage_nodes()?;

        if query.interval_ms <= 0 {
            query.interval_ms = self.ctx.database_config.default_interval_ms()?;
        }
        query.time_range = query.time_range.truncate(query.interval_ms);

        let others = self.other_brokers();
        let need_intermediate =
            query.has_group_by() && !others.is_empty() && storage_nodes.len() > 1;

        let plan = if need_intermediate {
            self.plan_with_intermediates(&storage_nodes, &others)
        } else {
            self.plan_leaves_only(&storage_nodes)
        };
        debug!(
            database = %plan.database,
            root = %plan.root.indicator,
            intermediates = plan.intermediates.len(),
            leaves = plan.leaves.len(),
            interval_ms = query.interval_ms,
            "physical plan built"
        );
        Ok(plan)
    }

    /// Plan a metadata suggestion query; metadata never needs regrouping.
    pub fn plan_metadata(&self) -> Result<PhysicalPlan> {
        let storage_nodes = self.storage_nodes()?;
        Ok(self.plan_leaves_only(&storage_nodes))
    }

    fn root_indicator(&self) -> String {
        self.ctx.current_node.indicator()
    }

    // Storage nodes with disjoint shard sets, ordered by indicator. A shard listed
    // under several nodes stays with the first one; nodes left empty are dropped.
    fn storage_nodes(&self) -> Result<Vec<(String, Vec<ShardId>)>> {
        let mut seen = HashSet::new();
        let mut nodes = Vec::with_capacity(self.ctx.storage_nodes.len());
        for (indicator, shards) in &self.ctx.storage_nodes {
            let mut owned = shards
                .iter()
                .copied()
                .filter(|id| seen.insert(*id))
                .collect::<Vec<_>>();
            if owned.is_empty() {
                continue;
            }
            owned.sort();
            nodes.push((indicator.clone(), owned));
        }
        if nodes.is_empty() {
            return Err(TsqError::NoAvailableStorageNode(self.ctx.database.clone()));
        }
        Ok(nodes)
    }

    fn other_brokers(&self) -> Vec<Node> {
        let current = self.root_indicator();
        let mut others = self
            .ctx
            .live_brokers
            .iter()
            .filter(|n| n.indicator() != current)
            .cloned()
            .collect::<Vec<_>>();
        others.sort();
        others.dedup();
        others
    }

    fn plan_leaves_only(&self, storage_nodes: &[(String, Vec<ShardId>)]) -> PhysicalPlan {
        let root = self.root_indicator();
        let mut plan = PhysicalPlan::new(
            self.ctx.database.clone(),
            Root {
                indicator: root.clone(),
                num_of_task: storage_nodes.len(),
            },
        );
        for (indicator, shards) in storage_nodes {
            plan.add_leaf(Leaf {
                parent: root.clone(),
                indicator: indicator.clone(),
                shard_ids: shards.clone(),
                receivers: vec![self.ctx.current_node.clone()],
            });
        }
        plan
    }

    fn plan_with_intermediates(
        &self,
        storage_nodes: &[(String, Vec<ShardId>)],
        intermediates: &[Node],
    ) -> PhysicalPlan {
        let root = self.root_indicator();
        let total = storage_nodes.len();
        let parallelism = total.div_ceil(intermediates.len());

        let mut plan = PhysicalPlan::new(
            self.ctx.database.clone(),
            Root {
                indicator: root.clone(),
                num_of_task: 0,
            },
        );
        // Contiguous slices; the last intermediate takes the remainder. Brokers
        // beyond the last non-empty slice get no work and are left out.
        for (broker, slice) in intermediates.iter().zip(storage_nodes.chunks(parallelism)) {
            let indicator = broker.indicator();
            plan.add_intermediate(Intermediate {
                parent: root.clone(),
                indicator: indicator.clone(),
                num_of_task: total,
                receive_only: false,
            });
            for (leaf, shards) in slice {
                plan.add_leaf(Leaf {
                    parent: indicator.clone(),
                    indicator: leaf.clone(),
                    shard_ids: shards.clone(),
                    receivers: vec![broker.clone()],
                });
            }
        }
        plan.root.num_of_task = plan.intermediates.len();
        plan
    }
}
