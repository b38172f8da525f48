//! gRPC transport for task requests/responses between nodes.
//!
//! RPC schema source: `proto/tsq_task.proto`.
//!
//! - `SendRequest`: root -> intermediate/leaf fan-out
//! - `SendResponse`: leaf/intermediate -> parent results
//!
//! The sender's node indicator is carried in the [`NODE_HEADER`] metadata
//! entry so the receiving [`TaskService`] knows who is talking.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use tonic::metadata::AsciiMetadataValue;
use tonic::transport::{Channel, Endpoint};
use tonic::{Request, Response, Status};
use tsq_common::{RequestId, TaskId, TsqError};

use crate::rpc::{RequestType, ResponseType, TaskRequest, TaskResponse};
use crate::transport::{TaskService, Transport};

#[allow(missing_docs)]
pub mod v1 {
    tonic::include_proto!("tsq.task.v1");
}

pub use v1::task_service_client::TaskServiceClient;
pub use v1::task_service_server::TaskServiceServer;

/// Metadata key carrying the sender's node indicator.
pub const NODE_HEADER: &str = "x-tsq-node";

/// gRPC server adapter dispatching into a local [`TaskService`].
#[derive(Clone)]
pub struct GrpcTaskServer {
    service: Arc<dyn TaskService>,
}

impl GrpcTaskServer {
    pub fn new(service: Arc<dyn TaskService>) -> Self {
        Self { service }
    }

    pub fn into_server(self) -> TaskServiceServer<Self> {
        TaskServiceServer::new(self)
    }
}

#[tonic::async_trait]
impl v1::task_service_server::TaskService for GrpcTaskServer {
    async fn send_request(
        &self,
        request: Request<v1::TaskRequest>,
    ) -> Result<Response<v1::Ack>, Status> {
        let from = sender(&request)?;
        let req = core_request(request.into_inner())?;
        self.service
            .on_request(req, &from)
            .await
            .map_err(to_status)?;
        Ok(Response::new(v1::Ack {}))
    }

    async fn send_response(
        &self,
        request: Request<v1::TaskResponse>,
    ) -> Result<Response<v1::Ack>, Status> {
        let from = sender(&request)?;
        let resp = core_response(request.into_inner())?;
        self.service
            .on_response(resp, &from)
            .await
            .map_err(to_status)?;
        Ok(Response::new(v1::Ack {}))
    }
}

/// [`Transport`] that caches one lazily-connected client per target.
///
/// Channels connect on first use, so building a client never waits on the
/// network and the cache lock is never held across an await. An `Unavailable`
/// call drops the cached client and the next send builds a fresh one.
pub struct GrpcTransport {
    local: String,
    clients: Mutex<HashMap<String, TaskServiceClient<Channel>>>,
}

impl GrpcTransport {
    pub fn new(local: impl Into<String>) -> Self {
        Self {
            local: local.into(),
            clients: Mutex::new(HashMap::new()),
        }
    }

    fn client(&self, target: &str) -> tsq_common::Result<TaskServiceClient<Channel>> {
        let mut clients = self.clients.lock().expect("grpc client cache lock poisoned");
        if let Some(client) = clients.get(target) {
            return Ok(client.clone());
        }
        let channel = Endpoint::from_shared(format!("http://{target}"))
            .map_err(|e| TsqError::Transport(format!("no stream for target {target}: {e}")))?
            .connect_lazy();
        let client = TaskServiceClient::new(channel);
        clients.insert(target.to_string(), client.clone());
        Ok(client)
    }

    fn tagged<T>(&self, message: T) -> tsq_common::Result<Request<T>> {
        let mut request = Request::new(message);
        let value = AsciiMetadataValue::try_from(self.local.as_str()).map_err(|e| {
            TsqError::InvalidConfig(format!("bad node indicator {}: {e}", self.local))
        })?;
        request.metadata_mut().insert(NODE_HEADER, value);
        Ok(request)
    }

    fn forget(&self, target: &str) {
        self.clients
            .lock()
            .expect("grpc client cache lock poisoned")
            .remove(target);
    }
}

#[async_trait::async_trait]
impl Transport for GrpcTransport {
    async fn send_request(&self, target: &str, request: TaskRequest) -> tsq_common::Result<()> {
        let mut client = self.client(target)?;
        let outcome = client.send_request(self.tagged(proto_request(request))?).await;
        if let Err(status) = outcome {
            if status.code() == tonic::Code::Unavailable {
                self.forget(target);
            }
            return Err(map_tonic_err(status));
        }
        Ok(())
    }

    async fn send_response(&self, target: &str, response: TaskResponse) -> tsq_common::Result<()> {
        let mut client = self.client(target)?;
        let outcome = client.send_response(self.tagged(proto_response(response))?).await;
        if let Err(status) = outcome {
            if status.code() == tonic::Code::Unavailable {
                self.forget(target);
            }
            return Err(map_tonic_err(status));
        }
        Ok(())
    }

    fn has_stream(&self, target: &str) -> bool {
        self.client(target).is_ok()
    }
}

fn sender<T>(request: &Request<T>) -> Result<String, Status> {
    request
        .metadata()
        .get(NODE_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
        .ok_or_else(|| Status::invalid_argument(format!("missing {NODE_HEADER} metadata")))
}

fn proto_request(request: TaskRequest) -> v1::TaskRequest {
    v1::TaskRequest {
        request_id: request.request_id.0,
        parent_task_id: request.parent_task_id.0,
        request_type: match request.request_type {
            RequestType::Data => v1::RequestType::Data,
            RequestType::Metadata => v1::RequestType::Metadata,
        } as i32,
        physical_plan: request.physical_plan,
        payload: request.payload,
    }
}

fn core_request(request: v1::TaskRequest) -> Result<TaskRequest, Status> {
    let request_type = match v1::RequestType::try_from(request.request_type) {
        Ok(v1::RequestType::Data) => RequestType::Data,
        Ok(v1::RequestType::Metadata) => RequestType::Metadata,
        Err(_) => {
            return Err(Status::invalid_argument(format!(
                "unknown request type {}",
                request.request_type
            )));
        }
    };
    Ok(TaskRequest {
        request_id: RequestId(request.request_id),
        parent_task_id: TaskId(request.parent_task_id),
        request_type,
        physical_plan: request.physical_plan,
        payload: request.payload,
    })
}

fn proto_response(response: TaskResponse) -> v1::TaskResponse {
    v1::TaskResponse {
        task_id: response.task_id.0,
        response_type: match response.response_type {
            ResponseType::Leaf => v1::ResponseType::Leaf,
            ResponseType::Intermediate => v1::ResponseType::Intermediate,
        } as i32,
        completed: response.completed,
        err_msg: response.err_msg,
        err_kind: response.err_kind,
        send_time: response.send_time,
        stats: response.stats,
        payload: response.payload,
    }
}

fn core_response(response: v1::TaskResponse) -> Result<TaskResponse, Status> {
    let response_type = match v1::ResponseType::try_from(response.response_type) {
        Ok(v1::ResponseType::Leaf) => ResponseType::Leaf,
        Ok(v1::ResponseType::Intermediate) => ResponseType::Intermediate,
        Err(_) => {
            return Err(Status::invalid_argument(format!(
                "unknown response type {}",
                response.response_type
            )));
        }
    };
    Ok(TaskResponse {
        task_id: TaskId(response.task_id),
        response_type,
        completed: response.completed,
        err_msg: response.err_msg,
        err_kind: response.err_kind,
        send_time: response.send_time,
        stats: response.stats,
        payload: response.payload,
    })
}

fn to_status(err: TsqError) -> Status {
    match err {
        TsqError::BadPhysicalPlan(msg) => Status::failed_precondition(msg),
        TsqError::NoAvailableStorageNode(msg) => Status::unavailable(msg),
        e @ (TsqError::DatabaseNotFound(_) | TsqError::NotFound(_)) => {
            Status::not_found(e.to_string())
        }
        TsqError::Decode(msg) | TsqError::InvalidConfig(msg) => Status::invalid_argument(msg),
        TsqError::Transport(msg) => Status::unavailable(msg),
        TsqError::Timeout(msg) => Status::deadline_exceeded(msg),
        TsqError::Execution(msg) | TsqError::Panic(msg) => Status::internal(msg),
        TsqError::Io(e) => Status::internal(e.to_string()),
    }
}

fn map_tonic_err(status: Status) -> TsqError {
    match status.code() {
        tonic::Code::FailedPrecondition => TsqError::BadPhysicalPlan(status.message().to_string()),
        tonic::Code::InvalidArgument => TsqError::Decode(status.message().to_string()),
        _ => TsqError::Transport(format!("grpc call failed: {status}")),
    }
}
