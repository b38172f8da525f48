//! Pipeline and request registries keyed by request id.
//!
//! Both are plain owned values; the node's composition root constructs them
//! and hands `Arc`s to the processors and the broker executor.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};

use tsq_common::time::now_millis;
use tsq_common::{Node, RequestId};
use tsq_planner::Statement;

use crate::pipeline::Pipeline;

/// Live local pipelines, keyed by the request they execute.
#[derive(Debug, Default)]
pub struct PipelineRegistry {
    pipelines: RwLock<HashMap<RequestId, Arc<Pipeline>>>,
}

impl PipelineRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&self, pipeline: Arc<Pipeline>) {
        self.pipelines
            .write()
            .expect("pipeline registry lock poisoned")
            .insert(pipeline.request_id().clone(), pipeline);
    }

    pub fn get(&self, request_id: &RequestId) -> Option<Arc<Pipeline>> {
        self.pipelines
            .read()
            .expect("pipeline registry lock poisoned")
            .get(request_id)
            .cloned()
    }

    pub fn remove(&self, request_id: &RequestId) -> Option<Arc<Pipeline>> {
        self.pipelines
            .write()
            .expect("pipeline registry lock poisoned")
            .remove(request_id)
    }

    /// Request ids of all registered pipelines, sorted.
    pub fn alive(&self) -> Vec<RequestId> {
        let mut ids: Vec<RequestId> = self
            .pipelines
            .read()
            .expect("pipeline registry lock poisoned")
            .keys()
            .cloned()
            .collect();
        ids.sort();
        ids
    }

    pub fn len(&self) -> usize {
        self.pipelines
            .read()
            .expect("pipeline registry lock poisoned")
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Client request accepted by a broker.
#[derive(Debug, Clone)]
pub struct RequestInfo {
    pub request_id: RequestId,
    pub database: String,
    pub statement: Statement,
    pub entry_node: Node,
    pub start_ms: i64,
}

/// In-flight client requests on one broker.
#[derive(Debug)]
pub struct RequestRegistry {
    node: Node,
    seq: AtomicU64,
    requests: RwLock<HashMap<RequestId, RequestInfo>>,
}

impl RequestRegistry {
    pub fn new(node: Node) -> Self {
        Self {
            node,
            seq: AtomicU64::new(1),
            requests: RwLock::new(HashMap::new()),
        }
    }

    /// Register a request and allocate its id (`<node>-<seq>`).
    pub fn new_request(&self, database: &str, statement: Statement) -> RequestId {
        let seq = self.seq.fetch_add(1, Ordering::Relaxed);
        let request_id = RequestId(format!("{}-{seq}", self.node.indicator()));
        let info = RequestInfo {
            request_id: request_id.clone(),
            database: database.to_string(),
            statement,
            entry_node: self.node.clone(),
            start_ms: now_millis(),
        };
        self.requests
            .write()
            .expect("request registry lock poisoned")
            .insert(request_id.clone(), info);
        request_id
    }

    pub fn complete_request(&self, request_id: &RequestId) -> Option<RequestInfo> {
        self.requests
            .write()
            .expect("request registry lock poisoned")
            .remove(request_id)
    }

    pub fn get(&self, request_id: &RequestId) -> Option<RequestInfo> {
        self.requests
            .read()
            .expect("request registry lock poisoned")
            .get(request_id)
            .cloned()
    }

    /// In-flight requests, oldest first.
    pub fn alive(&self) -> Vec<RequestInfo> {
        let mut out: Vec<RequestInfo> = self
            .requests
            .read()
            .expect("request registry lock poisoned")
            .values()
            .cloned()
            .collect();
        out.sort_by(|a, b| {
            a.start_ms
                .cmp(&b.start_ms)
                .then_with(|| a.request_id.cmp(&b.request_id))
        });
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pool::WorkerPool;
    use tokio::runtime::Handle;
    use tsq_planner::{MetadataKind, MetadataQuery};

    #[tokio::test]
    async fn pipelines_are_listed_until_removed() {
        let registry = PipelineRegistry::new();
        let pool = WorkerPool::new("test", 1, Handle::current());
        for id in ["b", "a"] {
            registry.add(Pipeline::new(
                RequestId(id.to_string()),
                false,
                pool.clone(),
                |_, _| {},
            ));
        }
        assert_eq!(
            registry.alive(),
            vec![RequestId("a".to_string()), RequestId("b".to_string())]
        );
        assert!(registry.get(&RequestId("a".to_string())).is_some());
        registry.remove(&RequestId("a".to_string()));
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn request_ids_are_scoped_by_node() {
        let registry = RequestRegistry::new(Node::new("10.0.0.1", 2891));
        let statement = Statement::Metadata(MetadataQuery::new(MetadataKind::Namespace));
        let first = registry.new_request("db", statement.clone());
        let second = registry.new_request("db", statement);
        assert_eq!(first.as_str(), "10.0.0.1:2891-1");
        assert_ne!(first, second);
        assert_eq!(registry.alive().len(), 2);
        assert_eq!(
            registry.complete_request(&first).map(|r| r.database),
            Some("db".to_string())
        );
        assert!(registry.get(&first).is_none());
    }
}
