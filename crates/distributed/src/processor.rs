//! Server-side handlers for inbound task requests.
//!
//! Validation failures that leave no way to answer (undecodable plan, node
//! not part of the plan, no stream to the parent) are returned to the sender
//! as the request's error. Everything after that is answered upstream with
//! a terminal response so the parent's countdown always advances.

use std::sync::Arc;
use std::time::Instant;

use tokio::runtime::Handle;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};
use tsq_common::metrics::global_metrics;
use tsq_common::{Node, Result, TaskId, TsqError};
use tsq_execution::{
    BrokerNodeStats, LeafExecuteContext, LeafMetadataContext, LeafNodeStats,
    MetadataLookupStage, MetadataSuggestStage, Pipeline, PipelineRegistry, Stage, StageStats,
    WorkerPool, encode_series, encode_stats,
};
use tsq_planner::{Leaf, PhysicalPlan, Statement};
use tsq_storage::StorageEngine;

use crate::rpc::{RequestType, ResponseType, TaskRequest, TaskResponse};
use crate::task_context::{TimeSeriesEvent, collect_metadata};
use crate::task_manager::TaskManager;
use crate::transport::Transport;

/// Runs the local part of a query on a storage node.
pub struct LeafTaskProcessor {
    indicator: String,
    engine: Arc<dyn StorageEngine>,
    transport: Arc<dyn Transport>,
    pool: WorkerPool,
    pipelines: Arc<PipelineRegistry>,
    runtime: Handle,
    explain_by_default: bool,
}

impl LeafTaskProcessor {
    pub fn new(
        node: &Node,
        engine: Arc<dyn StorageEngine>,
        transport: Arc<dyn Transport>,
        pool: WorkerPool,
        pipelines: Arc<PipelineRegistry>,
        runtime: Handle,
    ) -> Self {
        Self {
            indicator: node.indicator(),
            engine,
            transport,
            pool,
            pipelines,
            runtime,
            explain_by_default: false,
        }
    }

    pub fn with_explain_by_default(mut self, explain: bool) -> Self {
        self.explain_by_default = explain;
        self
    }

    /// Validate and start executing `request`; the result is sent upstream later.
    ///
    /// # Errors
    /// - [`TsqError::Decode`] when the physical plan cannot be decoded
    /// - [`TsqError::BadPhysicalPlan`] when this node is not a leaf of the plan
    /// - [`TsqError::Transport`] when there is no stream to the leaf's parent
    pub fn process(&self, request: TaskRequest, from: &str) -> Result<()> {
        let plan = PhysicalPlan::decode(&request.physical_plan)?;
        let leaf = plan.find_leaf(&self.indicator).cloned().ok_or_else(|| {
            TsqError::BadPhysicalPlan(format!(
                "node {} is not a leaf of the plan sent by {from}",
                self.indicator
            ))
        })?;
        if !self.transport.has_stream(&leaf.parent) {
            return Err(TsqError::Transport(format!(
                "no stream for parent {}",
                leaf.parent
            )));
        }
        debug!(
            node = %self.indicator,
            request_id = %request.request_id,
            task_id = %request.parent_task_id,
            request_type = request.request_type.as_str(),
            shards = leaf.shard_ids.len(),
            "leaf task received"
        );
        if let Err(err) = self.start(&plan, &leaf, &request) {
            self.respond(
                &leaf.parent,
                TaskResponse::failure(request.parent_task_id.clone(), ResponseType::Leaf, &err),
            );
        }
        Ok(())
    }

    fn start(&self, plan: &PhysicalPlan, leaf: &Leaf, request: &TaskRequest) -> Result<()> {
        let database = self
            .engine
            .database(&plan.database)
            .ok_or_else(|| TsqError::DatabaseNotFound(plan.database.clone()))?;
        let statement = Statement::decode(&request.payload)?;
        match (request.request_type, statement) {
            (RequestType::Data, Statement::Metric(query)) => {
                let explain = query.explain || self.explain_by_default;
                let ctx = LeafExecuteContext::new(database, query, leaf.shard_ids.clone());
                let result_ctx = Arc::clone(&ctx);
                self.run(
                    request,
                    &leaf.parent,
                    explain,
                    Arc::new(MetadataLookupStage::new(ctx)),
                    move || encode_series(&result_ctx.take_result()),
                );
                Ok(())
            }
            (RequestType::Metadata, Statement::Metadata(query)) => {
                let ctx = LeafMetadataContext::new(database, query);
                let result_ctx = Arc::clone(&ctx);
                self.run(
                    request,
                    &leaf.parent,
                    false,
                    Arc::new(MetadataSuggestStage::new(ctx)),
                    move || {
                        serde_json::to_vec(&result_ctx.take_result()).map_err(|e| {
                            TsqError::Execution(format!("metadata encode failed: {e}"))
                        })
                    },
                );
                Ok(())
            }
            (request_type, _) => Err(TsqError::Decode(format!(
                "statement does not match {} request",
                request_type.as_str()
            ))),
        }
    }

    fn run(
        &self,
        request: &TaskRequest,
        parent: &str,
        explain: bool,
        root: Arc<dyn Stage>,
        take_payload: impl FnOnce() -> Result<Vec<u8>> + Send + 'static,
    ) {
        let started = Instant::now();
        let task_id = request.parent_task_id.clone();
        let request_id = request.request_id.clone();
        let parent = parent.to_string();
        let transport = Arc::clone(&self.transport);
        let pipelines = Arc::clone(&self.pipelines);
        let runtime = self.runtime.clone();
        let indicator = self.indicator.clone();

        let pipeline = Pipeline::new(
            request_id.clone(),
            explain,
            self.pool.clone(),
            move |err, stages| {
                pipelines.remove(&request_id);
                global_metrics().set_pipelines_alive(&indicator, pipelines.len() as u64);
                let response =
                    leaf_response(task_id, err, stages, explain, started, take_payload);
                runtime.spawn(async move {
                    if let Err(err) = transport.send_response(&parent, response).await {
                        global_metrics().inc_task_send_failure(&parent);
                        warn!(parent = %parent, error = %err, "leaf response send failed");
                    }
                });
            },
        );
        self.pipelines.add(Arc::clone(&pipeline));
        global_metrics().set_pipelines_alive(&self.indicator, self.pipelines.len() as u64);
        pipeline.execute(root);
    }

    fn respond(&self, parent: &str, response: TaskResponse) {
        let transport = Arc::clone(&self.transport);
        let parent = parent.to_string();
        self.runtime.spawn(async move {
            if let Err(err) = transport.send_response(&parent, response).await {
                warn!(parent = %parent, error = %err, "leaf error response send failed");
            }
        });
    }
}

fn leaf_response(
    task_id: TaskId,
    err: Option<TsqError>,
    stages: Vec<StageStats>,
    explain: bool,
    started: Instant,
    take_payload: impl FnOnce() -> Result<Vec<u8>>,
) -> TaskResponse {
    let payload = match err {
        // Nothing to read here is an empty partial, not a failure.
        Some(err) if err.is_not_found() && !matches!(err, TsqError::DatabaseNotFound(_)) => {
            debug!(task_id = %task_id, reason = %err, "leaf found no data");
            Ok(Vec::new())
        }
        Some(err) => Err(err),
        None => take_payload(),
    };
    let payload = match payload {
        Ok(payload) => payload,
        Err(err) => return TaskResponse::failure(task_id, ResponseType::Leaf, &err),
    };
    let stats = if explain {
        let stats = LeafNodeStats {
            total_cost: started.elapsed().as_nanos() as i64,
            net_payload: payload.len() as u64,
            stages,
        };
        match encode_stats(&stats) {
            Ok(raw) => Some(raw),
            Err(err) => {
                warn!(task_id = %task_id, error = %err, "leaf stats dropped");
                None
            }
        }
    } else {
        None
    };
    TaskResponse::success(task_id, ResponseType::Leaf, payload, stats)
}

/// Pre-merges a slice of leaves on a peer broker and forwards upstream.
pub struct IntermediateTaskProcessor {
    indicator: String,
    task_manager: Arc<TaskManager>,
    transport: Arc<dyn Transport>,
}

impl IntermediateTaskProcessor {
    pub fn new(node: &Node, task_manager: Arc<TaskManager>, transport: Arc<dyn Transport>) -> Self {
        Self {
            indicator: node.indicator(),
            task_manager,
            transport,
        }
    }

    /// Validate `request` and register the intermediate context.
    ///
    /// Receive-only targets return without registering or sending anything.
    ///
    /// # Errors
    /// - [`TsqError::Decode`] when the physical plan cannot be decoded
    /// - [`TsqError::BadPhysicalPlan`] when this node is not an intermediate of the plan
    /// - [`TsqError::Transport`] when there is no stream to the parent
    pub fn process(&self, request: TaskRequest, from: &str) -> Result<()> {
        let plan = PhysicalPlan::decode(&request.physical_plan)?;
        let target = plan
            .find_intermediate(&self.indicator)
            .cloned()
            .ok_or_else(|| {
                TsqError::BadPhysicalPlan(format!(
                    "node {} is not an intermediate of the plan sent by {from}",
                    self.indicator
                ))
            })?;
        if target.receive_only {
            debug!(
                node = %self.indicator,
                task_id = %request.parent_task_id,
                "receive-only target, nothing to do"
            );
            return Ok(());
        }
        if !self.transport.has_stream(&target.parent) {
            return Err(TsqError::Transport(format!(
                "no stream for parent {}",
                target.parent
            )));
        }
        let task_id = request.parent_task_id.clone();
        let parent = target.parent;
        let transport = Arc::clone(&self.transport);
        let started = Instant::now();
        match (request.request_type, Statement::decode(&request.payload)) {
            (RequestType::Data, Ok(Statement::Metric(query))) => {
                let rx = self
                    .task_manager
                    .submit_intermediate_metric_task(&plan, &request, query.explain);
                tokio::spawn(forward_metric(rx, transport, parent, task_id, started));
            }
            (RequestType::Metadata, Ok(Statement::Metadata(_))) => {
                let rx = self
                    .task_manager
                    .submit_intermediate_metadata_task(&plan, &request);
                tokio::spawn(forward_metadata(rx, transport, parent, task_id));
            }
            (request_type, decoded) => {
                let err = decoded.err().unwrap_or_else(|| {
                    TsqError::Decode(format!(
                        "statement does not match {} request",
                        request_type.as_str()
                    ))
                });
                tokio::spawn(send_upstream(
                    transport,
                    parent,
                    TaskResponse::failure(task_id, ResponseType::Intermediate, &err),
                ));
            }
        }
        Ok(())
    }
}

async fn forward_metric(
    mut rx: mpsc::Receiver<TimeSeriesEvent>,
    transport: Arc<dyn Transport>,
    parent: String,
    task_id: TaskId,
    started: Instant,
) {
    let response = match rx.recv().await {
        None => TaskResponse::failure(
            task_id.clone(),
            ResponseType::Intermediate,
            &TsqError::Execution(format!("intermediate task {task_id} evicted before completion")),
        ),
        Some(TimeSeriesEvent { err: Some(err), .. }) => {
            TaskResponse::failure(task_id, ResponseType::Intermediate, &err)
        }
        Some(TimeSeriesEvent { series, stats, .. }) => match encode_series(&series) {
            Err(err) => TaskResponse::failure(task_id, ResponseType::Intermediate, &err),
            Ok(payload) => {
                let stats = stats.and_then(|stats| {
                    let broker = BrokerNodeStats {
                        wait_cost: stats.total_cost,
                        total_cost: started.elapsed().as_nanos() as i64,
                        net_payload: payload.len() as u64,
                        leaves: stats.leaves,
                    };
                    encode_stats(&broker).ok()
                });
                TaskResponse::success(task_id, ResponseType::Intermediate, payload, stats)
            }
        },
    };
    send_upstream(transport, parent, response).await;
}

async fn forward_metadata(
    rx: mpsc::Receiver<TaskResponse>,
    transport: Arc<dyn Transport>,
    parent: String,
    task_id: TaskId,
) {
    let merged = collect_metadata(rx, 0).await.and_then(|values| {
        serde_json::to_vec(&values)
            .map_err(|e| TsqError::Execution(format!("metadata encode failed: {e}")))
    });
    let response = match merged {
        Ok(payload) => TaskResponse::success(task_id, ResponseType::Intermediate, payload, None),
        Err(err) => TaskResponse::failure(task_id, ResponseType::Intermediate, &err),
    };
    send_upstream(transport, parent, response).await;
}

async fn send_upstream(transport: Arc<dyn Transport>, parent: String, response: TaskResponse) {
    let task_id = response.task_id.clone();
    match transport.send_response(&parent, response).await {
        Ok(()) => info!(task_id = %task_id, parent = %parent, "intermediate result forwarded"),
        Err(err) => {
            global_metrics().inc_task_send_failure(&parent);
            error!(
                task_id = %task_id,
                parent = %parent,
                error = %err,
                "intermediate result forward failed"
            );
        }
    }
}
