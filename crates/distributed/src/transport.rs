//! Transport contracts plus the in-process implementation.
//!
//! The core only needs `send_request`/`send_response` towards a node
//! indicator; receiving is done by registering a [`TaskService`] under the
//! local indicator. [`InProcessNetwork`] wires services together without
//! sockets, the way embedded clusters and tests run.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use tsq_common::{Result, TsqError};

use crate::rpc::{TaskRequest, TaskResponse};

/// Outbound side of the task RPC layer.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Deliver `request` to `target`; the receiver's validation error is returned.
    async fn send_request(&self, target: &str, request: TaskRequest) -> Result<()>;

    async fn send_response(&self, target: &str, response: TaskResponse) -> Result<()>;

    /// Whether a stream/client to `target` can be obtained without waiting
    /// on the network.
    fn has_stream(&self, target: &str) -> bool;
}

/// Inbound side: handlers a node registers under its indicator.
#[async_trait]
pub trait TaskService: Send + Sync {
    async fn on_request(&self, request: TaskRequest, from: &str) -> Result<()>;

    async fn on_response(&self, response: TaskResponse, from: &str) -> Result<()>;
}

/// Shared in-process registry of node indicator -> service.
#[derive(Default)]
pub struct InProcessNetwork {
    services: RwLock<HashMap<String, Arc<dyn TaskService>>>,
}

impl std::fmt::Debug for InProcessNetwork {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let nodes = self
            .services
            .read()
            .map(|s| s.keys().cloned().collect::<Vec<_>>())
            .unwrap_or_default();
        f.debug_struct("InProcessNetwork")
            .field("nodes", &nodes)
            .finish()
    }
}

impl InProcessNetwork {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn register(&self, indicator: &str, service: Arc<dyn TaskService>) {
        self.services
            .write()
            .expect("in-process network lock poisoned")
            .insert(indicator.to_string(), service);
    }

    pub fn deregister(&self, indicator: &str) {
        self.services
            .write()
            .expect("in-process network lock poisoned")
            .remove(indicator);
    }

    fn service(&self, indicator: &str) -> Result<Arc<dyn TaskService>> {
        self.services
            .read()
            .expect("in-process network lock poisoned")
            .get(indicator)
            .cloned()
            .ok_or_else(|| TsqError::Transport(format!("no stream for target {indicator}")))
    }

    fn contains(&self, indicator: &str) -> bool {
        self.services
            .read()
            .expect("in-process network lock poisoned")
            .contains_key(indicator)
    }
}

/// [`Transport`] for one node attached to an [`InProcessNetwork`].
#[derive(Debug, Clone)]
pub struct InProcessTransport {
    local: String,
    network: Arc<InProcessNetwork>,
}

impl InProcessTransport {
    pub fn new(local: impl Into<String>, network: Arc<InProcessNetwork>) -> Self {
        Self {
            local: local.into(),
            network,
        }
    }
}

#[async_trait]
impl Transport for InProcessTransport {
    async fn send_request(&self, target: &str, request: TaskRequest) -> Result<()> {
        let service = self.network.service(target)?;
        service.on_request(request, &self.local).await
    }

    async fn send_response(&self, target: &str, response: TaskResponse) -> Result<()> {
        let service = self.network.service(target)?;
        service.on_response(response, &self.local).await
    }

    fn has_stream(&self, target: &str) -> bool {
        self.network.contains(target)
    }
}
