use std::collections::{BTreeMap, BTreeSet};

use tsq_common::{DatabaseConfig, Node, ShardId, TimeRange, TsqError};
use tsq_planner::{AggType, FieldSelect, MetricQuery, PhysicalPlanner, PlanContext};

const ROOT: &str = "10.0.0.1:2891";

fn storage_nodes(count: u32, shards_per_node: u32) -> BTreeMap<String, Vec<ShardId>> {
    (0..count)
        .map(|n| {
            let shards = (0..shards_per_node)
                .map(|s| ShardId(n * shards_per_node + s))
                .collect();
            (format!("10.0.1.{n}:2891"), shards)
        })
        .collect()
}

fn brokers(count: u32) -> Vec<Node> {
    (1..=count)
        .map(|n| Node::new(format!("10.0.0.{n}"), 2891))
        .collect()
}

fn planner(storage: BTreeMap<String, Vec<ShardId>>, live_brokers: Vec<Node>) -> PhysicalPlanner {
    PhysicalPlanner::new(PlanContext {
        database: "metrics".to_string(),
        database_config: DatabaseConfig::new(&["10s"]),
        storage_nodes: storage,
        current_node: Node::from_indicator(ROOT).expect("root node"),
        live_brokers,
    })
}

fn query(group_by: bool) -> MetricQuery {
    let mut q = MetricQuery::new(
        "cpu",
        vec![FieldSelect::new("usage", AggType::Sum)],
        TimeRange::new(0, 3_600_000),
    );
    if group_by {
        q.group_by = vec!["host".to_string()];
    }
    q
}

fn assert_leaves_only(plan: &tsq_planner::PhysicalPlan) {
    assert!(plan.intermediates.is_empty());
    assert_eq!(plan.root.num_of_task, plan.leaves.len());
    for leaf in &plan.leaves {
        assert_eq!(leaf.parent, ROOT);
        assert_eq!(leaf.receivers.len(), 1);
        assert_eq!(leaf.receivers[0].indicator(), ROOT);
    }
}

#[test]
fn empty_storage_map_has_no_available_storage_node() {
    let err = planner(BTreeMap::new(), brokers(3))
        .plan_metric(&mut query(true))
        .expect_err("no storage");
    assert!(matches!(err, TsqError::NoAvailableStorageNode(db) if db == "metrics"));
}

#[test]
fn query_without_group_by_goes_straight_to_root() {
    let plan = planner(storage_nodes(5, 2), brokers(4))
        .plan_metric(&mut query(false))
        .expect("plan");
    assert_leaves_only(&plan);
    assert_eq!(plan.leaves.len(), 5);
}

#[test]
fn single_storage_node_group_by_query_goes_straight_to_root() {
    let plan = planner(storage_nodes(1, 3), brokers(4))
        .plan_metric(&mut query(true))
        .expect("plan");
    assert_leaves_only(&plan);
    assert_eq!(plan.leaves.len(), 1);
    assert_eq!(plan.root.num_of_task, 1);
}

#[test]
fn no_other_broker_goes_straight_to_root() {
    let plan = planner(storage_nodes(3, 1), brokers(1))
        .plan_metric(&mut query(true))
        .expect("plan");
    assert_leaves_only(&plan);
}

#[test]
fn group_by_across_storage_nodes_uses_other_brokers_as_intermediates() {
    let input = storage_nodes(5, 2);
    let plan = planner(input.clone(), brokers(4))
        .plan_metric(&mut query(true))
        .expect("plan");

    assert_eq!(plan.intermediates.len(), 3);
    assert_eq!(plan.root.num_of_task, 3);
    for intermediate in &plan.intermediates {
        assert_ne!(intermediate.indicator, ROOT);
        assert_eq!(intermediate.parent, ROOT);
        assert_eq!(intermediate.num_of_task, 5);
    }

    // Leaves partition every storage node exactly once.
    let leaf_nodes: BTreeSet<_> = plan.leaves.iter().map(|l| l.indicator.clone()).collect();
    assert_eq!(plan.leaves.len(), 5);
    assert_eq!(leaf_nodes, input.keys().cloned().collect());

    let planned_shards: BTreeSet<_> = plan
        .leaves
        .iter()
        .flat_map(|l| l.shard_ids.iter().copied())
        .collect();
    let input_shards: BTreeSet<_> = input.values().flatten().copied().collect();
    assert_eq!(planned_shards, input_shards);
    assert_eq!(plan.shard_ids().len(), input_shards.len());

    // Each leaf reports to exactly the intermediate owning its slice.
    for leaf in &plan.leaves {
        assert!(plan.find_intermediate(&leaf.parent).is_some());
        assert_eq!(leaf.receivers.len(), 1);
        assert_eq!(leaf.receivers[0].indicator(), leaf.parent);
    }
    let counts: Vec<_> = plan
        .intermediates
        .iter()
        .map(|i| plan.leaves_reporting_to(&i.indicator))
        .collect();
    assert_eq!(counts, vec![2, 2, 1]);
}

#[test]
fn partition_is_deterministic() {
    let a = planner(storage_nodes(7, 1), brokers(4))
        .plan_metric(&mut query(true))
        .expect("plan a");
    let b = planner(storage_nodes(7, 1), brokers(4).into_iter().rev().collect())
        .plan_metric(&mut query(true))
        .expect("plan b");
    assert_eq!(a, b);
}
