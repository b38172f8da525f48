use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::runtime::Handle;
use tsq_common::{
    DatabaseConfig, Node, QueryConfig, RequestId, ShardId, TaskId, TimeRange, TsqError,
};
use tsq_distributed::{
    BrokerExecutor, BrokerTaskService, InProcessNetwork, InProcessTransport,
    IntermediateTaskProcessor, LeafTaskProcessor, RequestType, StaticClusterState,
    StorageTaskService, TaskManager, TaskRequest, TaskResponse, TaskService, Transport,
};
use tsq_execution::{PipelineRegistry, RequestRegistry, WorkerPool};
use tsq_planner::{
    AggType, FieldSelect, Intermediate, Leaf, MetadataKind, MetadataQuery, MetricQuery,
    PhysicalPlan, Root, Statement,
};
use tsq_storage::{MemoryEngine, StorageEngine};

const DB: &str = "metrics";

fn broker(n: u32) -> Node {
    Node::new(format!("10.0.0.{n}"), 2891)
}

fn storage(n: u32) -> Node {
    Node::new(format!("10.0.1.{n}"), 2891)
}

/// Accepts every request and never answers.
struct SilentService;

#[async_trait]
impl TaskService for SilentService {
    async fn on_request(&self, _request: TaskRequest, _from: &str) -> tsq_common::Result<()> {
        Ok(())
    }

    async fn on_response(&self, _response: TaskResponse, _from: &str) -> tsq_common::Result<()> {
        Ok(())
    }
}

#[derive(Default)]
struct Recorder {
    responses: Mutex<Vec<(String, TaskResponse)>>,
}

#[async_trait]
impl TaskService for Recorder {
    async fn on_request(&self, _request: TaskRequest, _from: &str) -> tsq_common::Result<()> {
        Ok(())
    }

    async fn on_response(&self, response: TaskResponse, from: &str) -> tsq_common::Result<()> {
        self.responses
            .lock()
            .expect("recorder lock poisoned")
            .push((from.to_string(), response));
        Ok(())
    }
}

struct Cluster {
    network: Arc<InProcessNetwork>,
    executor: BrokerExecutor,
    brokers: Vec<Arc<TaskManager>>,
}

/// Three brokers and five storage nodes. Storage node `n` serves shard `n`
/// and holds `cpu{host=hN}` = N plus `cpu{host=shared}` = 1 at t=1s/2s.
fn start_cluster(silent_storage: bool, query_timeout_ms: u64) -> Cluster {
    let network = InProcessNetwork::new();
    let config = DatabaseConfig::new(&["10s"]);

    let mut replicas = BTreeMap::new();
    for n in 1..=5 {
        let node = storage(n);
        let indicator = node.indicator();
        let engine = MemoryEngine::new();
        let db = engine.create_database(DB, config.clone(), &[ShardId(n)]);
        let host = format!("h{n}");
        db.write(ShardId(n), "ns", "cpu", &[("host", host.as_str())], "usage", 1_000, n as f64)
            .expect("write");
        db.write(ShardId(n), "ns", "cpu", &[("host", "shared")], "usage", 2_000, 1.0)
            .expect("write");
        let engine: Arc<dyn StorageEngine> = Arc::new(engine);
        let transport: Arc<dyn Transport> =
            Arc::new(InProcessTransport::new(indicator.clone(), Arc::clone(&network)));
        let leaf = LeafTaskProcessor::new(
            &node,
            engine,
            transport,
            WorkerPool::new("leaf", 4, Handle::current()),
            Arc::new(PipelineRegistry::new()),
            Handle::current(),
        );
        network.register(&indicator, Arc::new(StorageTaskService::new(leaf)));
        replicas.insert(indicator, vec![ShardId(n)]);
    }
    if silent_storage {
        let indicator = storage(9).indicator();
        network.register(&indicator, Arc::new(SilentService));
        replicas.insert(indicator, vec![ShardId(9)]);
    }

    let mut brokers = Vec::new();
    for n in 1..=3 {
        let node = broker(n);
        let indicator = node.indicator();
        let transport: Arc<dyn Transport> =
            Arc::new(InProcessTransport::new(indicator.clone(), Arc::clone(&network)));
        let task_manager = Arc::new(TaskManager::new(node.clone(), Arc::clone(&transport)));
        let intermediate =
            IntermediateTaskProcessor::new(&node, Arc::clone(&task_manager), transport);
        network.register(
            &indicator,
            Arc::new(BrokerTaskService::new(Arc::clone(&task_manager), intermediate)),
        );
        brokers.push(task_manager);
    }

    let cluster = StaticClusterState::new(broker(1));
    cluster.set_brokers((1..=3).map(broker).collect());
    cluster.set_database(DB, config.clone(), replicas);
    cluster.set_database(
        "ghost",
        config,
        BTreeMap::from([(storage(1).indicator(), vec![ShardId(1)])]),
    );

    let executor = BrokerExecutor::new(
        Arc::new(cluster),
        Arc::clone(&brokers[0]),
        Arc::new(RequestRegistry::new(broker(1))),
        QueryConfig {
            query_timeout_ms,
            ..QueryConfig::default()
        },
    );
    Cluster {
        network,
        executor,
        brokers,
    }
}

fn cpu_query(group_by: bool) -> MetricQuery {
    let mut q = MetricQuery::new(
        "cpu",
        vec![FieldSelect::new("usage", AggType::Sum)],
        TimeRange::new(0, 20_000),
    );
    q.namespace = "ns".to_string();
    q.interval_ms = 10_000;
    if group_by {
        q.group_by = vec!["host".to_string()];
    }
    q
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn group_by_query_merges_through_intermediates() {
    let cluster = start_cluster(false, 5_000);
    let result = cluster
        .executor
        .execute_metric_query(DB, cpu_query(true))
        .await
        .expect("query");

    let hosts: Vec<_> = result.series.iter().map(|s| s.tags["host"].clone()).collect();
    assert_eq!(hosts, vec!["h1", "h2", "h3", "h4", "h5", "shared"]);
    for (i, series) in result.series.iter().take(5).enumerate() {
        assert_eq!(series.fields["usage"].points[&0], (i + 1) as f64);
    }
    // one partial per storage node, regrouped across both intermediates
    assert_eq!(result.series[5].fields["usage"].points[&0], 5.0);
    assert!(result.stats.is_none());
    assert!(cluster.executor.requests().alive().is_empty());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn plain_query_is_answered_by_leaves_directly() {
    let cluster = start_cluster(false, 5_000);
    let result = cluster
        .executor
        .execute_metric_query(DB, cpu_query(false))
        .await
        .expect("query");

    assert_eq!(result.series.len(), 1);
    assert!(result.series[0].tags.is_empty());
    // 1+2+3+4+5 plus five "shared" points
    assert_eq!(result.series[0].fields["usage"].points[&0], 20.0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn limit_truncates_merged_series() {
    let cluster = start_cluster(false, 5_000);
    let mut query = cpu_query(true);
    query.limit = 2;
    let result = cluster
        .executor
        .execute_metric_query(DB, query)
        .await
        .expect("query");
    assert_eq!(result.series.len(), 2);
    assert_eq!(result.series[0].tags["host"], "h1");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn explain_collects_stats_per_broker_and_leaf() {
    let cluster = start_cluster(false, 5_000);
    let mut query = cpu_query(true);
    query.explain = true;
    let result = cluster
        .executor
        .execute_metric_query(DB, query)
        .await
        .expect("query");

    let stats = result.stats.expect("explain stats");
    assert_eq!(stats.root, broker(1).indicator());
    assert!(stats.leaves.is_empty());
    let b2 = &stats.brokers[&broker(2).indicator()];
    let b3 = &stats.brokers[&broker(3).indicator()];
    assert_eq!(b2.leaves.len(), 3);
    assert_eq!(b3.leaves.len(), 2);
    let leaf = &b2.leaves[&storage(1).indicator()];
    assert!(leaf.net_payload > 0);
    assert!(leaf.stages.iter().any(|s| s.stage_type == "metadata_lookup"));
    assert!(leaf.stages.iter().any(|s| s.stage_type == "data_scan"));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn unknown_metric_yields_empty_result() {
    let cluster = start_cluster(false, 5_000);
    let mut query = cpu_query(true);
    query.metric_name = "mem".to_string();
    let result = cluster
        .executor
        .execute_metric_query(DB, query)
        .await
        .expect("not-found on every leaf is an empty answer");
    assert!(result.series.is_empty());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn missing_database_on_leaf_fails_the_query() {
    let cluster = start_cluster(false, 5_000);
    let err = cluster
        .executor
        .execute_metric_query("ghost", cpu_query(false))
        .await
        .expect_err("leaf has no such database");
    assert!(matches!(&err, TsqError::DatabaseNotFound(db) if db == "ghost"));
    assert!(cluster.executor.requests().alive().is_empty());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn unknown_database_fails_planning() {
    let cluster = start_cluster(false, 5_000);
    let err = cluster
        .executor
        .execute_metric_query("nope", cpu_query(false))
        .await
        .expect_err("not configured");
    assert!(matches!(err, TsqError::DatabaseNotFound(_)));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn metadata_query_merges_and_limits_values() {
    let cluster = start_cluster(false, 5_000);
    let mut query = MetadataQuery::new(MetadataKind::TagValue);
    query.namespace = "ns".to_string();
    query.metric_name = "cpu".to_string();
    query.tag_key = "host".to_string();

    let values = cluster
        .executor
        .execute_metadata_query(DB, query.clone())
        .await
        .expect("metadata");
    assert_eq!(values, vec!["h1", "h2", "h3", "h4", "h5", "shared"]);

    query.limit = 3;
    let values = cluster
        .executor
        .execute_metadata_query(DB, query)
        .await
        .expect("metadata");
    assert_eq!(values, vec!["h1", "h2", "h3"]);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn silent_leaf_times_out() {
    let cluster = start_cluster(true, 200);
    let err = cluster
        .executor
        .execute_metric_query(DB, cpu_query(false))
        .await
        .expect_err("one leaf never answers");
    assert!(matches!(err, TsqError::Timeout(_)));
    // the context stays until the reaper evicts it
    assert_eq!(cluster.brokers[0].alive(), 1);
    assert_eq!(cluster.brokers[0].evict_expired(Duration::ZERO), 1);
    assert!(cluster.executor.requests().alive().is_empty());
}

fn request(plan: &PhysicalPlan, request_type: RequestType, statement: &Statement) -> TaskRequest {
    TaskRequest {
        request_id: RequestId("client-1".to_string()),
        parent_task_id: TaskId::new("client", 1),
        request_type,
        physical_plan: plan.encode().expect("plan"),
        payload: statement.encode().expect("statement"),
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn leaf_rejects_plan_naming_another_node() {
    let cluster = start_cluster(false, 5_000);
    let recorder = Arc::new(Recorder::default());
    cluster.network.register("client:1", Arc::clone(&recorder) as Arc<dyn TaskService>);

    let mut plan = PhysicalPlan::new(
        DB,
        Root {
            indicator: "client:1".to_string(),
            num_of_task: 1,
        },
    );
    plan.add_leaf(Leaf {
        parent: "client:1".to_string(),
        indicator: storage(2).indicator(),
        shard_ids: vec![ShardId(2)],
        receivers: Vec::new(),
    });
    let transport = InProcessTransport::new("client:1", Arc::clone(&cluster.network));
    let err = transport
        .send_request(
            &storage(1).indicator(),
            request(&plan, RequestType::Data, &Statement::Metric(cpu_query(false))),
        )
        .await
        .expect_err("not a leaf of this plan");
    assert!(matches!(err, TsqError::BadPhysicalPlan(_)));

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(recorder.responses.lock().expect("recorder lock poisoned").is_empty());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn leaf_answers_direct_request() {
    let cluster = start_cluster(false, 5_000);
    let recorder = Arc::new(Recorder::default());
    cluster.network.register("client:1", Arc::clone(&recorder) as Arc<dyn TaskService>);

    let mut plan = PhysicalPlan::new(
        DB,
        Root {
            indicator: "client:1".to_string(),
            num_of_task: 1,
        },
    );
    plan.add_leaf(Leaf {
        parent: "client:1".to_string(),
        indicator: storage(3).indicator(),
        shard_ids: vec![ShardId(3)],
        receivers: Vec::new(),
    });
    let transport = InProcessTransport::new("client:1", Arc::clone(&cluster.network));
    transport
        .send_request(
            &storage(3).indicator(),
            request(&plan, RequestType::Data, &Statement::Metric(cpu_query(true))),
        )
        .await
        .expect("accepted");

    let mut waited = 0;
    while recorder.responses.lock().expect("recorder lock poisoned").is_empty() && waited < 100 {
        tokio::time::sleep(Duration::from_millis(20)).await;
        waited += 1;
    }
    let responses = recorder.responses.lock().expect("recorder lock poisoned");
    assert_eq!(responses.len(), 1);
    let (from, response) = &responses[0];
    assert_eq!(from, &storage(3).indicator());
    assert_eq!(response.task_id, TaskId::new("client", 1));
    assert!(!response.is_error());
    let series = tsq_execution::decode_series(&response.payload).expect("series");
    assert_eq!(series.len(), 2);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn receive_only_intermediate_does_nothing() {
    let cluster = start_cluster(false, 5_000);
    let mut plan = PhysicalPlan::new(
        DB,
        Root {
            indicator: broker(1).indicator(),
            num_of_task: 1,
        },
    );
    plan.add_intermediate(Intermediate {
        parent: broker(1).indicator(),
        indicator: broker(2).indicator(),
        num_of_task: 1,
        receive_only: true,
    });
    let transport = InProcessTransport::new(broker(1).indicator(), Arc::clone(&cluster.network));
    transport
        .send_request(
            &broker(2).indicator(),
            request(&plan, RequestType::Data, &Statement::Metric(cpu_query(true))),
        )
        .await
        .expect("receive-only is accepted");
    assert_eq!(cluster.brokers[1].alive(), 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn broker_not_in_plan_rejects_intermediate_request() {
    let cluster = start_cluster(false, 5_000);
    let plan = PhysicalPlan::new(
        DB,
        Root {
            indicator: broker(1).indicator(),
            num_of_task: 0,
        },
    );
    let transport = InProcessTransport::new(broker(1).indicator(), Arc::clone(&cluster.network));
    let err = transport
        .send_request(
            &broker(3).indicator(),
            request(&plan, RequestType::Data, &Statement::Metric(cpu_query(true))),
        )
        .await
        .expect_err("not an intermediate");
    assert!(matches!(err, TsqError::BadPhysicalPlan(_)));
}
