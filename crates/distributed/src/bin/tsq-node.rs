use std::collections::BTreeMap;
use std::env;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::runtime::Handle;
use tonic::transport::Server;
use tracing::info;
use tracing_subscriber::EnvFilter;
use tsq_common::{DatabaseConfig, Node, QueryConfig, ShardId};
use tsq_distributed::grpc::{GrpcTaskServer, GrpcTransport};
use tsq_distributed::{
    BrokerExecutor, BrokerTaskService, IntermediateTaskProcessor, LeafTaskProcessor,
    StaticClusterState, StorageTaskService, TaskManager, TaskService, Transport,
};
use tsq_execution::{PipelineRegistry, RequestRegistry, WorkerPool};
use tsq_planner::Statement;
use tsq_storage::{MemoryEngine, StorageEngine};

fn env_or_default(key: &str, default: &str) -> String {
    env::var(key).unwrap_or_else(|_| default.to_string())
}

fn env_usize_or_default(key: &str, default: usize) -> usize {
    env::var(key)
        .ok()
        .and_then(|v| v.parse::<usize>().ok())
        .unwrap_or(default)
}

fn env_u64_or_default(key: &str, default: u64) -> u64 {
    env::var(key)
        .ok()
        .and_then(|v| v.parse::<u64>().ok())
        .unwrap_or(default)
}

fn parse_shards(raw: &str) -> Result<Vec<ShardId>, Box<dyn std::error::Error>> {
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(|s| Ok(ShardId(s.parse::<u32>()?)))
        .collect()
}

/// `TSQ_REPLICAS` format: `host:port=1,2;host:port=3`.
fn parse_replicas(
    raw: &str,
) -> Result<BTreeMap<String, Vec<ShardId>>, Box<dyn std::error::Error>> {
    let mut out = BTreeMap::new();
    for entry in raw.split(';').map(str::trim).filter(|s| !s.is_empty()) {
        let (node, shards) = entry
            .split_once('=')
            .ok_or_else(|| format!("replica entry without '=': {entry}"))?;
        out.insert(node.trim().to_string(), parse_shards(shards)?);
    }
    Ok(out)
}

async fn run_query(executor: &BrokerExecutor, database: &str, statement: Statement) {
    let outcome = match statement {
        Statement::Metric(query) => executor
            .execute_metric_query(database, query)
            .await
            .and_then(|result| {
                serde_json::to_string_pretty(&result.series)
                    .map_err(|e| tsq_common::TsqError::Execution(e.to_string()))
            }),
        Statement::Metadata(query) => executor
            .execute_metadata_query(database, query)
            .await
            .and_then(|values| {
                serde_json::to_string_pretty(&values)
                    .map_err(|e| tsq_common::TsqError::Execution(e.to_string()))
            }),
    };
    match outcome {
        Ok(body) => println!("{body}"),
        Err(e) => tracing::error!(error = %e, "query failed"),
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let role = env_or_default("TSQ_NODE_ROLE", "broker");
    let host = env_or_default("TSQ_NODE_HOST", "127.0.0.1");
    let port = env_or_default("TSQ_GRPC_PORT", "2891").parse::<u16>()?;
    let bind = env_or_default("TSQ_GRPC_BIND", &format!("0.0.0.0:{port}"));
    let addr: SocketAddr = bind.parse()?;
    let database = env_or_default("TSQ_DATABASE", "default");
    let intervals = env_or_default("TSQ_DB_INTERVALS", "10s");
    let config = QueryConfig {
        task_ttl_ms: env_u64_or_default("TSQ_TASK_TTL_MS", 60_000),
        reap_interval_ms: env_u64_or_default("TSQ_REAP_INTERVAL_MS", 10_000),
        query_timeout_ms: env_u64_or_default("TSQ_QUERY_TIMEOUT_MS", 30_000),
        worker_pool_size: env_usize_or_default("TSQ_WORKER_POOL_SIZE", 16),
        explain_by_default: env_or_default("TSQ_EXPLAIN_BY_DEFAULT", "false") == "true",
    };

    let node = Node::new(host, port);
    let indicator = node.indicator();
    let transport: Arc<dyn Transport> = Arc::new(GrpcTransport::new(indicator.clone()));
    let db_config = DatabaseConfig {
        intervals: intervals.split(',').map(|s| s.trim().to_string()).collect(),
    };
    db_config.default_interval_ms()?;

    #[cfg(feature = "profiling")]
    {
        let metrics_bind = env_or_default("TSQ_METRICS_BIND", "0.0.0.0:9091");
        let metrics_addr: SocketAddr = metrics_bind.parse()?;
        tokio::spawn(async move {
            if let Err(e) = tsq_common::run_metrics_exporter(metrics_addr).await {
                tracing::error!(error = %e, "metrics exporter stopped");
            }
        });
    }

    let service: Arc<dyn TaskService> = match role.as_str() {
        "storage" => {
            let shards = parse_shards(&env_or_default("TSQ_SHARDS", "0"))?;
            let engine = MemoryEngine::new();
            engine.create_database(&database, db_config, &shards);
            let engine: Arc<dyn StorageEngine> = Arc::new(engine);
            let pool = WorkerPool::new("leaf", config.worker_pool_size, Handle::current());
            let leaf = LeafTaskProcessor::new(
                &node,
                engine,
                Arc::clone(&transport),
                pool,
                Arc::new(PipelineRegistry::new()),
                Handle::current(),
            )
            .with_explain_by_default(config.explain_by_default);
            info!(
                node = %indicator,
                database = %database,
                shards = ?shards,
                "storage node starting"
            );
            Arc::new(StorageTaskService::new(leaf))
        }
        "broker" => {
            let cluster = StaticClusterState::new(node.clone());
            let brokers = env_or_default("TSQ_BROKERS", &indicator)
                .split(',')
                .filter_map(|s| Node::from_indicator(s.trim()))
                .collect::<Vec<_>>();
            cluster.set_brokers(brokers);
            cluster.set_database(
                &database,
                db_config,
                parse_replicas(&env_or_default("TSQ_REPLICAS", ""))?,
            );
            let task_manager = Arc::new(TaskManager::new(node.clone(), Arc::clone(&transport)));
            task_manager.start_reaper(config.reap_interval(), config.task_ttl());
            if let Ok(path) = env::var("TSQ_QUERY_FILE") {
                let statement = Statement::decode(&std::fs::read(&path)?)?;
                let executor = BrokerExecutor::new(
                    Arc::new(cluster),
                    Arc::clone(&task_manager),
                    Arc::new(RequestRegistry::new(node.clone())),
                    config.clone(),
                );
                let delay = Duration::from_millis(env_u64_or_default("TSQ_QUERY_DELAY_MS", 1_000));
                let database = database.clone();
                tokio::spawn(async move {
                    tokio::time::sleep(delay).await;
                    run_query(&executor, &database, statement).await;
                });
            }
            let intermediate = IntermediateTaskProcessor::new(
                &node,
                Arc::clone(&task_manager),
                Arc::clone(&transport),
            );
            info!(
                node = %indicator,
                database = %database,
                task_ttl_ms = config.task_ttl_ms,
                reap_interval_ms = config.reap_interval_ms,
                "broker node starting"
            );
            Arc::new(BrokerTaskService::new(task_manager, intermediate))
        }
        other => return Err(format!("unknown TSQ_NODE_ROLE {other}").into()),
    };

    info!(node = %indicator, bind = %addr, role = %role, "tsq-node listening");
    Server::builder()
        .add_service(GrpcTaskServer::new(service).into_server())
        .serve(addr)
        .await?;
    Ok(())
}
