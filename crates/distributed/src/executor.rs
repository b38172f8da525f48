//! Broker entry point turning `database + statement` into a merged answer.

use std::sync::Arc;

use tracing::{debug, info, warn};
use tsq_common::{QueryConfig, RequestId, Result, TsqError};
use tsq_execution::{QueryStats, RequestRegistry};
use tsq_planner::{MetadataQuery, MetricQuery, PhysicalPlanner, PlanContext, Statement};
use tsq_storage::TimeSeries;

use crate::cluster::ClusterStateView;
use crate::task_context::collect_metadata;
use crate::task_manager::TaskManager;

/// Merged result of a metric query.
#[derive(Debug, Clone, Default)]
pub struct QueryResult {
    pub series: Vec<TimeSeries>,
    /// Cost breakdown, present in explain mode.
    pub stats: Option<QueryStats>,
}

/// Plans, dispatches and awaits queries arriving at a broker.
pub struct BrokerExecutor {
    cluster: Arc<dyn ClusterStateView>,
    task_manager: Arc<TaskManager>,
    requests: Arc<RequestRegistry>,
    config: QueryConfig,
}

impl BrokerExecutor {
    pub fn new(
        cluster: Arc<dyn ClusterStateView>,
        task_manager: Arc<TaskManager>,
        requests: Arc<RequestRegistry>,
        config: QueryConfig,
    ) -> Self {
        Self {
            cluster,
            task_manager,
            requests,
            config,
        }
    }

    pub fn requests(&self) -> &Arc<RequestRegistry> {
        &self.requests
    }

    /// Run a metric query across the cluster.
    ///
    /// # Errors
    /// - planning errors ([`TsqError::DatabaseNotFound`],
    ///   [`TsqError::NoAvailableStorageNode`], ...)
    /// - dispatch failures from the transport
    /// - the first error reported by any child task
    /// - [`TsqError::Timeout`] when no result arrives within `query_timeout`
    pub async fn execute_metric_query(
        &self,
        database: &str,
        mut query: MetricQuery,
    ) -> Result<QueryResult> {
        let planner = PhysicalPlanner::new(self.plan_context(database)?);
        let plan = planner.plan_metric(&mut query)?;
        query.explain = query.explain || self.config.explain_by_default;
        let explain = query.explain;
        let limit = query.limit;
        let statement = Statement::Metric(query);
        let request_id = self.requests.new_request(database, statement.clone());

        let result = async {
            let (task_id, mut rx) = self
                .task_manager
                .submit_metric_task(&plan, &request_id, &statement, explain)
                .await?;
            let event = self.await_result(&request_id, rx.recv()).await?.ok_or_else(|| {
                TsqError::Execution(format!("task {task_id} closed without a result"))
            })?;
            if let Some(err) = event.err {
                return Err(err);
            }
            let mut series = event.series;
            if limit > 0 {
                series.truncate(limit);
            }
            Ok(QueryResult {
                series,
                stats: event.stats,
            })
        }
        .await;

        self.finish(&request_id, result.as_ref().err());
        result
    }

    /// Run a metadata suggestion query; values come back sorted and de-duplicated.
    pub async fn execute_metadata_query(
        &self,
        database: &str,
        query: MetadataQuery,
    ) -> Result<Vec<String>> {
        let planner = PhysicalPlanner::new(self.plan_context(database)?);
        let plan = planner.plan_metadata()?;
        let limit = query.limit;
        let statement = Statement::Metadata(query);
        let request_id = self.requests.new_request(database, statement.clone());

        let result = async {
            let (_, rx) = self
                .task_manager
                .submit_metadata_task(&plan, &request_id, &statement)
                .await?;
            self.await_result(&request_id, collect_metadata(rx, limit))
                .await?
        }
        .await;

        self.finish(&request_id, result.as_ref().err());
        result
    }

    fn plan_context(&self, database: &str) -> Result<PlanContext> {
        let database_config = self
            .cluster
            .database_config(database)
            .ok_or_else(|| TsqError::DatabaseNotFound(database.to_string()))?;
        Ok(PlanContext {
            database: database.to_string(),
            database_config,
            storage_nodes: self.cluster.queryable_replicas(database)?,
            current_node: self.cluster.current_node(),
            live_brokers: self.cluster.live_broker_nodes(),
        })
    }

    // Timeout only stops this waiter; the task context is left to the reaper.
    async fn await_result<T>(
        &self,
        request_id: &RequestId,
        fut: impl std::future::Future<Output = T>,
    ) -> Result<T> {
        tokio::time::timeout(self.config.query_timeout(), fut)
            .await
            .map_err(|_| {
                TsqError::Timeout(format!(
                    "request {request_id} got no result within {}ms",
                    self.config.query_timeout_ms
                ))
            })
    }

    fn finish(&self, request_id: &RequestId, err: Option<&TsqError>) {
        let elapsed_ms = self
            .requests
            .complete_request(request_id)
            .map(|info| tsq_common::time::now_millis() - info.start_ms)
            .unwrap_or_default();
        match err {
            None => info!(request_id = %request_id, elapsed_ms, "query finished"),
            Some(err) if err.is_not_found() => {
                debug!(request_id = %request_id, elapsed_ms, error = %err, "query found nothing")
            }
            Some(err) => warn!(request_id = %request_id, elapsed_ms, error = %err, "query failed"),
        }
    }
}
