use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, warn};
use tsq_common::{Result, TsqError};

use crate::processor::{IntermediateTaskProcessor, LeafTaskProcessor};
use crate::rpc::{TaskRequest, TaskResponse};
use crate::task_manager::TaskManager;
use crate::transport::TaskService;

/// Inbound handler of a broker node: intermediate requests and child responses.
pub struct BrokerTaskService {
    task_manager: Arc<TaskManager>,
    intermediate: IntermediateTaskProcessor,
}

impl BrokerTaskService {
    pub fn new(task_manager: Arc<TaskManager>, intermediate: IntermediateTaskProcessor) -> Self {
        Self {
            task_manager,
            intermediate,
        }
    }
}

#[async_trait]
impl TaskService for BrokerTaskService {
    async fn on_request(&self, request: TaskRequest, from: &str) -> Result<()> {
        let task_id = request.parent_task_id.clone();
        self.intermediate.process(request, from).map_err(|err| {
            warn!(task_id = %task_id, from, error = %err, "intermediate request rejected");
            err
        })
    }

    async fn on_response(&self, response: TaskResponse, from: &str) -> Result<()> {
        let task_id = response.task_id.clone();
        self.task_manager.receive(response, from).map_err(|err| {
            // Late answers for reaped or already-completed tasks are expected.
            debug!(task_id = %task_id, from, error = %err, "response dropped");
            err
        })
    }
}

/// Inbound handler of a storage node: leaf requests only.
pub struct StorageTaskService {
    leaf: LeafTaskProcessor,
}

impl StorageTaskService {
    pub fn new(leaf: LeafTaskProcessor) -> Self {
        Self { leaf }
    }
}

#[async_trait]
impl TaskService for StorageTaskService {
    async fn on_request(&self, request: TaskRequest, from: &str) -> Result<()> {
        let task_id = request.parent_task_id.clone();
        self.leaf.process(request, from).map_err(|err| {
            warn!(task_id = %task_id, from, error = %err, "leaf request rejected");
            err
        })
    }

    async fn on_response(&self, response: TaskResponse, from: &str) -> Result<()> {
        Err(TsqError::Execution(format!(
            "storage node does not accept task responses (task {} from {from})",
            response.task_id
        )))
    }
}
