use std::collections::{BTreeMap, HashMap};
use std::sync::RwLock;

use tsq_common::{DatabaseConfig, Node, Result, ShardId, TsqError};

/// Read-only view of cluster membership and replica placement.
pub trait ClusterStateView: Send + Sync {
    /// Storage node indicator -> shards with a queryable replica there.
    fn queryable_replicas(&self, database: &str) -> Result<BTreeMap<String, Vec<ShardId>>>;

    fn live_broker_nodes(&self) -> Vec<Node>;

    fn current_node(&self) -> Node;

    fn database_config(&self, database: &str) -> Option<DatabaseConfig>;
}

#[derive(Debug, Default)]
struct StaticState {
    brokers: Vec<Node>,
    databases: HashMap<String, (DatabaseConfig, BTreeMap<String, Vec<ShardId>>)>,
}

/// Cluster view populated explicitly, for embedded clusters and tests.
#[derive(Debug)]
pub struct StaticClusterState {
    current: Node,
    state: RwLock<StaticState>,
}

impl StaticClusterState {
    pub fn new(current: Node) -> Self {
        Self {
            current,
            state: RwLock::new(StaticState::default()),
        }
    }

    pub fn set_brokers(&self, brokers: Vec<Node>) {
        self.state
            .write()
            .expect("cluster state lock poisoned")
            .brokers = brokers;
    }

    pub fn set_database(
        &self,
        database: &str,
        config: DatabaseConfig,
        replicas: BTreeMap<String, Vec<ShardId>>,
    ) {
        self.state
            .write()
            .expect("cluster state lock poisoned")
            .databases
            .insert(database.to_string(), (config, replicas));
    }
}

impl ClusterStateView for StaticClusterState {
    fn queryable_replicas(&self, database: &str) -> Result<BTreeMap<String, Vec<ShardId>>> {
        self.state
            .read()
            .expect("cluster state lock poisoned")
            .databases
            .get(database)
            .map(|(_, replicas)| replicas.clone())
            .ok_or_else(|| TsqError::DatabaseNotFound(database.to_string()))
    }

    fn live_broker_nodes(&self) -> Vec<Node> {
        self.state
            .read()
            .expect("cluster state lock poisoned")
            .brokers
            .clone()
    }

    fn current_node(&self) -> Node {
        self.current.clone()
    }

    fn database_config(&self, database: &str) -> Option<DatabaseConfig> {
        self.state
            .read()
            .expect("cluster state lock poisoned")
            .databases
            .get(database)
            .map(|(config, _)| config.clone())
    }
}
