use std::fmt;

use serde::{Deserialize, Serialize};

/// Logical cluster node identity.
///
/// The indicator (`host:port`) is what travels in RPC metadata and physical plans.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Node {
    pub host_ip: String,
    pub grpc_port: u16,
}

impl Node {
    pub fn new(host_ip: impl Into<String>, grpc_port: u16) -> Self {
        Self {
            host_ip: host_ip.into(),
            grpc_port,
        }
    }

    /// Parse a `host:port` indicator.
    pub fn from_indicator(indicator: &str) -> Option<Self> {
        let (host, port) = indicator.rsplit_once(':')?;
        let port = port.parse().ok()?;
        Some(Self::new(host, port))
    }

    pub fn indicator(&self) -> String {
        format!("{}:{}", self.host_ip, self.grpc_port)
    }
}

impl fmt::Display for Node {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host_ip, self.grpc_port)
    }
}

#[cfg(test)]
mod tests {
    use super::Node;

    #[test]
    fn indicator_roundtrip() {
        let node = Node::new("10.0.0.1", 2891);
        assert_eq!(node.indicator(), "10.0.0.1:2891");
        assert_eq!(Node::from_indicator("10.0.0.1:2891"), Some(node));
        assert_eq!(Node::from_indicator("no-port"), None);
    }
}
