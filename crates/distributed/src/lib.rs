//! Distributed query execution: dispatch, partial-result merge and task lifecycle.
//!
//! Architecture role:
//! - [`rpc`]: task request/response wire messages
//! - [`transport`]: transport/service contracts and the in-process network
//! - [`cluster`]: cluster-state view consumed by planning
//! - [`task_context`] / [`task_manager`]: countdown-and-merge contexts and their table
//! - [`processor`]: leaf and intermediate request handlers
//! - [`service`]: broker/storage inbound services
//! - [`executor`]: broker query entry point
//!
//! Feature flags:
//! - `grpc`: tonic transport, generated protobuf types and the `tsq-node` binary
//! - `profiling`: prometheus `/metrics` exporter in `tsq-node`

pub mod cluster;
pub mod executor;
#[cfg(feature = "grpc")]
pub mod grpc;
pub mod processor;
pub mod rpc;
pub mod service;
pub mod task_context;
pub mod task_manager;
pub mod transport;

pub use cluster::{ClusterStateView, StaticClusterState};
pub use executor::{BrokerExecutor, QueryResult};
pub use processor::{IntermediateTaskProcessor, LeafTaskProcessor};
pub use rpc::{RequestType, ResponseType, TaskRequest, TaskResponse};
pub use service::{BrokerTaskService, StorageTaskService};
pub use task_context::{
    MetadataTaskContext, MetricTaskContext, TaskContext, TaskKind, TimeSeriesEvent,
    collect_metadata,
};
pub use task_manager::TaskManager;
pub use transport::{InProcessNetwork, InProcessTransport, TaskService, Transport};
