//! Wire messages exchanged between brokers and storage nodes.

use serde::{Deserialize, Serialize};
use tsq_common::time::now_millis;
use tsq_common::{RequestId, TaskId, TsqError};

/// What a task request asks the receiving node to run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RequestType {
    Data,
    Metadata,
}

impl RequestType {
    pub fn as_str(self) -> &'static str {
        match self {
            RequestType::Data => "data",
            RequestType::Metadata => "metadata",
        }
    }
}

/// Which tier produced a task response.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ResponseType {
    Leaf,
    Intermediate,
}

impl ResponseType {
    pub fn as_str(self) -> &'static str {
        match self {
            ResponseType::Leaf => "leaf",
            ResponseType::Intermediate => "intermediate",
        }
    }
}

/// Request fanned out by the root to intermediates and leaves.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskRequest {
    pub request_id: RequestId,
    /// Task id children must report back under.
    pub parent_task_id: TaskId,
    pub request_type: RequestType,
    /// Encoded [`tsq_planner::PhysicalPlan`].
    pub physical_plan: Vec<u8>,
    /// Encoded [`tsq_planner::Statement`].
    pub payload: Vec<u8>,
}

/// Partial result sent upstream by a leaf or an intermediate.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskResponse {
    pub task_id: TaskId,
    pub response_type: ResponseType,
    pub completed: bool,
    /// Empty on success.
    #[serde(default)]
    pub err_msg: String,
    /// [`TsqError::kind`] of the failure; empty on success.
    #[serde(default)]
    pub err_kind: String,
    pub send_time: i64,
    /// Encoded leaf/broker node stats, present in explain mode.
    #[serde(default)]
    pub stats: Option<Vec<u8>>,
    #[serde(default)]
    pub payload: Vec<u8>,
}

impl TaskResponse {
    pub fn success(
        task_id: TaskId,
        response_type: ResponseType,
        payload: Vec<u8>,
        stats: Option<Vec<u8>>,
    ) -> Self {
        Self {
            task_id,
            response_type,
            completed: true,
            err_msg: String::new(),
            err_kind: String::new(),
            send_time: now_millis(),
            stats,
            payload,
        }
    }

    pub fn failure(task_id: TaskId, response_type: ResponseType, err: &TsqError) -> Self {
        Self {
            task_id,
            response_type,
            completed: true,
            err_msg: err.to_string(),
            err_kind: err.kind().to_string(),
            send_time: now_millis(),
            stats: None,
            payload: Vec::new(),
        }
    }

    pub fn is_error(&self) -> bool {
        !self.err_msg.is_empty()
    }

    /// The typed error this response reports, if any.
    pub fn error(&self) -> Option<TsqError> {
        self.is_error().then(|| TsqError::from_remote(&self.err_kind, &self.err_msg))
    }
}
