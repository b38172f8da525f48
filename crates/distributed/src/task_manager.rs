//! Task lifecycle: id allocation, fan-out, response routing and reaping.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock, Weak};
use std::time::Duration;

use futures::future::join_all;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use tsq_common::metrics::global_metrics;
use tsq_common::{Node, RequestId, Result, TaskId, TsqError};
use tsq_planner::{PhysicalPlan, Statement};

use crate::rpc::{RequestType, TaskRequest, TaskResponse};
use crate::task_context::{
    MetadataTaskContext, MetricTaskContext, TaskContext, TaskKind, TimeSeriesEvent,
};
use crate::transport::Transport;

/// Owns every live task context on one broker.
pub struct TaskManager {
    node: Node,
    indicator: String,
    transport: Arc<dyn Transport>,
    seq: AtomicU64,
    tasks: RwLock<HashMap<TaskId, Arc<dyn TaskContext>>>,
}

impl std::fmt::Debug for TaskManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskManager")
            .field("node", &self.indicator)
            .field("alive", &self.alive())
            .finish()
    }
}

impl TaskManager {
    pub fn new(node: Node, transport: Arc<dyn Transport>) -> Self {
        let indicator = node.indicator();
        Self {
            node,
            indicator,
            transport,
            seq: AtomicU64::new(1),
            tasks: RwLock::new(HashMap::new()),
        }
    }

    pub fn node(&self) -> &Node {
        &self.node
    }

    /// Next task id, monotonic and scoped by this node's indicator.
    pub fn alloc_task_id(&self) -> TaskId {
        TaskId::new(&self.indicator, self.seq.fetch_add(1, Ordering::Relaxed))
    }

    /// Register a root metric task and fan the request out.
    ///
    /// Intermediates are addressed first so their contexts exist before any
    /// leaf can answer them. Any send failure evicts the context and fails
    /// the submission.
    pub async fn submit_metric_task(
        &self,
        plan: &PhysicalPlan,
        request_id: &RequestId,
        statement: &Statement,
        explain: bool,
    ) -> Result<(TaskId, mpsc::Receiver<TimeSeriesEvent>)> {
        let task_id = self.alloc_task_id();
        let (ctx, rx) = MetricTaskContext::new(
            task_id.clone(),
            TaskKind::Root,
            plan.root.num_of_task,
            explain,
            &self.indicator,
        );
        self.add_task(Arc::new(ctx));
        global_metrics().inc_task_created("metric");
        self.dispatch(plan, request_id, &task_id, RequestType::Data, statement)
            .await?;
        Ok((task_id, rx))
    }

    /// Register a root metadata task and fan the request out.
    pub async fn submit_metadata_task(
        &self,
        plan: &PhysicalPlan,
        request_id: &RequestId,
        statement: &Statement,
    ) -> Result<(TaskId, mpsc::Receiver<TaskResponse>)> {
        let task_id = self.alloc_task_id();
        let (ctx, rx) =
            MetadataTaskContext::new(task_id.clone(), TaskKind::Root, plan.root.num_of_task);
        self.add_task(Arc::new(ctx));
        global_metrics().inc_task_created("metadata");
        self.dispatch(plan, request_id, &task_id, RequestType::Metadata, statement)
            .await?;
        Ok((task_id, rx))
    }

    /// Register the context of an intermediate metric task; nothing is sent.
    ///
    /// Keyed by the inbound `parent_task_id` since that is the id this node's
    /// leaves answer under. Sized to the leaves reporting to this node.
    pub fn submit_intermediate_metric_task(
        &self,
        plan: &PhysicalPlan,
        request: &TaskRequest,
        explain: bool,
    ) -> mpsc::Receiver<TimeSeriesEvent> {
        let expected = plan.leaves_reporting_to(&self.indicator);
        let (ctx, rx) = MetricTaskContext::new(
            request.parent_task_id.clone(),
            TaskKind::Intermediate,
            expected,
            explain,
            &self.indicator,
        );
        self.add_pending(Arc::new(ctx));
        global_metrics().inc_task_created("intermediate_metric");
        rx
    }

    /// Register the context of an intermediate metadata task; nothing is sent.
    pub fn submit_intermediate_metadata_task(
        &self,
        plan: &PhysicalPlan,
        request: &TaskRequest,
    ) -> mpsc::Receiver<TaskResponse> {
        let expected = plan.leaves_reporting_to(&self.indicator);
        let (ctx, rx) = MetadataTaskContext::new(
            request.parent_task_id.clone(),
            TaskKind::Intermediate,
            expected,
        );
        self.add_pending(Arc::new(ctx));
        global_metrics().inc_task_created("intermediate_metadata");
        rx
    }

    pub fn add_task(&self, ctx: Arc<dyn TaskContext>) {
        self.tasks
            .write()
            .expect("task table lock poisoned")
            .insert(ctx.task_id().clone(), ctx);
    }

    // A context with no children completes at construction; keep it out of the table.
    fn add_pending(&self, ctx: Arc<dyn TaskContext>) {
        if !ctx.is_done() {
            self.add_task(ctx);
        }
    }

    pub fn remove_task(&self, task_id: &TaskId) -> Option<Arc<dyn TaskContext>> {
        self.tasks
            .write()
            .expect("task table lock poisoned")
            .remove(task_id)
    }

    pub fn get_task(&self, task_id: &TaskId) -> Option<Arc<dyn TaskContext>> {
        self.tasks
            .read()
            .expect("task table lock poisoned")
            .get(task_id)
            .cloned()
    }

    pub fn alive(&self) -> usize {
        self.tasks.read().expect("task table lock poisoned").len()
    }

    /// Route an inbound response to its task context.
    ///
    /// # Errors
    /// [`TsqError::NotFound`] when no context is registered under the task id
    /// (already completed, evicted, or never created here).
    pub fn receive(&self, response: TaskResponse, from: &str) -> Result<()> {
        global_metrics().inc_task_response(response.response_type.as_str());
        let task_id = response.task_id.clone();
        let ctx = self
            .get_task(&task_id)
            .ok_or_else(|| TsqError::NotFound(format!("task {task_id}")))?;
        ctx.receive(response, from);
        if ctx.is_done() && self.remove_task(&task_id).is_some() {
            global_metrics().inc_task_completed(ctx.kind().as_str());
            debug!(task_id = %task_id, kind = ctx.kind().as_str(), "task completed");
        }
        Ok(())
    }

    /// Drop contexts older than `ttl`; returns how many were evicted.
    pub fn evict_expired(&self, ttl: Duration) -> usize {
        let mut tasks = self.tasks.write().expect("task table lock poisoned");
        let before = tasks.len();
        tasks.retain(|_, ctx| ctx.created_at().elapsed() <= ttl);
        let evicted = before - tasks.len();
        if evicted > 0 {
            global_metrics().inc_task_evicted(evicted as u64);
            info!(node = %self.indicator, evicted, "evicted expired tasks");
        }
        evicted
    }

    /// Spawn the periodic reaper; it stops once the manager is dropped.
    pub fn start_reaper(self: &Arc<Self>, interval: Duration, ttl: Duration) -> JoinHandle<()> {
        let manager: Weak<Self> = Arc::downgrade(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                match manager.upgrade() {
                    Some(manager) => {
                        manager.evict_expired(ttl);
                    }
                    None => break,
                }
            }
        })
    }

    async fn dispatch(
        &self,
        plan: &PhysicalPlan,
        request_id: &RequestId,
        task_id: &TaskId,
        request_type: RequestType,
        statement: &Statement,
    ) -> Result<()> {
        let request = match Self::build_request(plan, request_id, task_id, request_type, statement)
        {
            Ok(request) => request,
            Err(err) => {
                self.remove_task(task_id);
                return Err(err);
            }
        };
        let intermediates = plan
            .intermediates
            .iter()
            .map(|i| i.indicator.as_str())
            .collect::<Vec<_>>();
        let leaves = plan
            .leaves
            .iter()
            .map(|l| l.indicator.as_str())
            .collect::<Vec<_>>();
        for targets in [intermediates, leaves] {
            if let Err(err) = self.send_all(&targets, &request).await {
                self.remove_task(task_id);
                return Err(err);
            }
        }
        debug!(
            task_id = %task_id,
            request_id = %request_id,
            request_type = request_type.as_str(),
            intermediates = plan.intermediates.len(),
            leaves = plan.leaves.len(),
            "task dispatched"
        );
        Ok(())
    }

    fn build_request(
        plan: &PhysicalPlan,
        request_id: &RequestId,
        task_id: &TaskId,
        request_type: RequestType,
        statement: &Statement,
    ) -> Result<TaskRequest> {
        Ok(TaskRequest {
            request_id: request_id.clone(),
            parent_task_id: task_id.clone(),
            request_type,
            physical_plan: plan.encode()?,
            payload: statement.encode()?,
        })
    }

    async fn send_all(&self, targets: &[&str], request: &TaskRequest) -> Result<()> {
        let sends = targets.iter().map(|target| {
            let transport = Arc::clone(&self.transport);
            let request = request.clone();
            async move {
                transport
                    .send_request(target, request)
                    .await
                    .map_err(|err| (*target, err))
            }
        });
        let mut first_err = None;
        for result in join_all(sends).await {
            if let Err((target, err)) = result {
                global_metrics().inc_task_send_failure(target);
                warn!(node = %self.indicator, target, error = %err, "task request send failed");
                if first_err.is_none() {
                    first_err = Some(err);
                }
            }
        }
        match first_err {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rpc::ResponseType;
    use async_trait::async_trait;
    use std::sync::Mutex;
    use tsq_common::ShardId;
    use tsq_planner::{Intermediate, Leaf, MetadataKind, MetadataQuery, Root};

    #[derive(Default)]
    struct RecordingTransport {
        requests: Mutex<Vec<String>>,
        fail_on: Option<String>,
    }

    #[async_trait]
    impl Transport for RecordingTransport {
        async fn send_request(&self, target: &str, _request: TaskRequest) -> Result<()> {
            if self.fail_on.as_deref() == Some(target) {
                return Err(TsqError::Transport(format!("no stream for target {target}")));
            }
            self.requests.lock().unwrap().push(target.to_string());
            Ok(())
        }

        async fn send_response(&self, _target: &str, _response: TaskResponse) -> Result<()> {
            Ok(())
        }

        fn has_stream(&self, target: &str) -> bool {
            self.fail_on.as_deref() != Some(target)
        }
    }

    fn plan() -> PhysicalPlan {
        let mut plan = PhysicalPlan::new(
            "db",
            Root {
                indicator: "b1:1".to_string(),
                num_of_task: 1,
            },
        );
        plan.add_intermediate(Intermediate {
            parent: "b1:1".to_string(),
            indicator: "b2:1".to_string(),
            num_of_task: 2,
            receive_only: false,
        });
        for (i, s) in ["s1:1", "s2:1"].into_iter().enumerate() {
            plan.add_leaf(Leaf {
                parent: "b2:1".to_string(),
                indicator: s.to_string(),
                shard_ids: vec![ShardId(i as u32)],
                receivers: vec![Node::new("b2", 1)],
            });
        }
        plan
    }

    fn statement() -> Statement {
        Statement::Metadata(MetadataQuery::new(MetadataKind::Namespace))
    }

    fn manager(transport: RecordingTransport) -> (TaskManager, Arc<RecordingTransport>) {
        let transport = Arc::new(transport);
        (
            TaskManager::new(Node::new("b1", 1), Arc::clone(&transport) as Arc<dyn Transport>),
            transport,
        )
    }

    #[tokio::test]
    async fn dispatches_intermediates_before_leaves() {
        let (tm, transport) = manager(RecordingTransport::default());
        let (task_id, _rx) = tm
            .submit_metric_task(&plan(), &RequestId("r".to_string()), &statement(), false)
            .await
            .expect("submit");
        assert_eq!(task_id.as_str(), "b1:1-1");
        let sent = transport.requests.lock().unwrap().clone();
        assert_eq!(sent[0], "b2:1");
        assert_eq!(sent.len(), 3);
        assert_eq!(tm.alive(), 1);
    }

    #[tokio::test]
    async fn send_failure_evicts_context() {
        let (tm, _) = manager(RecordingTransport {
            fail_on: Some("s2:1".to_string()),
            ..RecordingTransport::default()
        });
        let err = tm
            .submit_metric_task(&plan(), &RequestId("r".to_string()), &statement(), false)
            .await
            .expect_err("send failure");
        assert!(matches!(err, TsqError::Transport(_)));
        assert_eq!(tm.alive(), 0);
    }

    #[tokio::test]
    async fn receive_routes_and_removes_completed() {
        let (tm, _) = manager(RecordingTransport::default());
        let (task_id, rx) = tm
            .submit_metadata_task(&plan(), &RequestId("r".to_string()), &statement())
            .await
            .expect("submit");
        let response = TaskResponse::success(
            task_id.clone(),
            ResponseType::Intermediate,
            serde_json::to_vec(&vec!["ns"]).expect("encode"),
            None,
        );
        tm.receive(response.clone(), "b2:1").expect("receive");
        assert_eq!(tm.alive(), 0);
        assert!(tm.receive(response, "b2:1").expect_err("gone").is_not_found());
        assert_eq!(
            crate::task_context::collect_metadata(rx, 0).await.expect("collect"),
            vec!["ns"]
        );
    }

    #[tokio::test]
    async fn intermediate_context_is_keyed_by_parent_task() {
        let (tm, _) = manager(RecordingTransport::default());
        let tm = TaskManager::new(Node::new("b2", 1), Arc::clone(&tm.transport));
        let request = TaskRequest {
            request_id: RequestId("r".to_string()),
            parent_task_id: TaskId::new("b1:1", 9),
            request_type: RequestType::Data,
            physical_plan: Vec::new(),
            payload: Vec::new(),
        };
        let _rx = tm.submit_intermediate_metric_task(&plan(), &request, false);
        assert!(tm.get_task(&TaskId::new("b1:1", 9)).is_some());
    }

    #[tokio::test]
    async fn evicts_only_expired() {
        let (tm, _) = manager(RecordingTransport::default());
        let _ = tm
            .submit_metric_task(&plan(), &RequestId("r".to_string()), &statement(), false)
            .await
            .expect("submit");
        assert_eq!(tm.evict_expired(Duration::from_secs(60)), 0);
        tokio::time::sleep(Duration::from_millis(5)).await;
        assert_eq!(tm.evict_expired(Duration::from_millis(1)), 1);
        assert_eq!(tm.alive(), 0);
    }
}
