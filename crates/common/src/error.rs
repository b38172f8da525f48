use thiserror::Error;

/// Canonical error taxonomy shared by planner, execution and distributed crates.
///
/// Classification guidance:
/// - topology: [`TsqError::NoAvailableStorageNode`], [`TsqError::BadPhysicalPlan`]
/// - transport: [`TsqError::Transport`]
/// - decode: [`TsqError::Decode`]
/// - domain: [`TsqError::DatabaseNotFound`], [`TsqError::NotFound`]
/// - runtime: [`TsqError::Execution`], [`TsqError::Panic`], [`TsqError::Timeout`]
#[derive(Debug, Error)]
pub enum TsqError {
    /// The query selected no storage node holding a queryable replica.
    #[error("no available storage node for database {0}")]
    NoAvailableStorageNode(String),

    /// The receiving node is not part of the physical plan it was sent.
    ///
    /// Either the sender addressed the wrong node or the plan is stale.
    #[error("bad physical plan: {0}")]
    BadPhysicalPlan(String),

    /// Named database does not exist on this node.
    #[error("database not found: {0}")]
    DatabaseNotFound(String),

    /// Metric, field, tag or series lookup found nothing.
    #[error("not found: {0}")]
    NotFound(String),

    /// No stream/client to a target node, or the send itself failed.
    #[error("transport error: {0}")]
    Transport(String),

    /// Malformed physical plan, statement or response payload.
    #[error("decode error: {0}")]
    Decode(String),

    /// Runtime failure while executing a stage or merging results.
    #[error("execution error: {0}")]
    Execution(String),

    /// A stage panicked; the payload message is preserved.
    #[error("panic during execution: {0}")]
    Panic(String),

    /// Caller stopped waiting for a result.
    #[error("timeout: {0}")]
    Timeout(String),

    /// Invalid or inconsistent configuration.
    ///
    /// Examples:
    /// - malformed interval string in database options
    /// - invalid environment value for the node binary
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// Transparent std IO failures.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl TsqError {
    /// Domain conditions callers usually report without logging as anomalies.
    pub fn is_not_found(&self) -> bool {
        matches!(self, TsqError::NotFound(_) | TsqError::DatabaseNotFound(_))
    }

    /// Stable variant name carried on the wire next to the display text.
    pub fn kind(&self) -> &'static str {
        match self {
            TsqError::NoAvailableStorageNode(_) => "no_available_storage_node",
            TsqError::BadPhysicalPlan(_) => "bad_physical_plan",
            TsqError::DatabaseNotFound(_) => "database_not_found",
            TsqError::NotFound(_) => "not_found",
            TsqError::Transport(_) => "transport",
            TsqError::Decode(_) => "decode",
            TsqError::Execution(_) => "execution",
            TsqError::Panic(_) => "panic",
            TsqError::Timeout(_) => "timeout",
            TsqError::InvalidConfig(_) => "invalid_config",
            TsqError::Io(_) => "io",
        }
    }

    /// Rebuild an error reported by another node from its [`kind`](Self::kind)
    /// and display text.
    ///
    /// An unknown or empty kind yields [`TsqError::Execution`] holding the text
    /// as sent.
    pub fn from_remote(kind: &str, msg: &str) -> TsqError {
        let detail = |prefix: &str| msg.strip_prefix(prefix).unwrap_or(msg).to_string();
        match kind {
            "no_available_storage_node" => {
                TsqError::NoAvailableStorageNode(detail("no available storage node for database "))
            }
            "bad_physical_plan" => TsqError::BadPhysicalPlan(detail("bad physical plan: ")),
            "database_not_found" => TsqError::DatabaseNotFound(detail("database not found: ")),
            "not_found" => TsqError::NotFound(detail("not found: ")),
            "transport" => TsqError::Transport(detail("transport error: ")),
            "decode" => TsqError::Decode(detail("decode error: ")),
            "execution" => TsqError::Execution(detail("execution error: ")),
            "panic" => TsqError::Panic(detail("panic during execution: ")),
            "timeout" => TsqError::Timeout(detail("timeout: ")),
            "invalid_config" => TsqError::InvalidConfig(detail("invalid configuration: ")),
            "io" => TsqError::Io(std::io::Error::other(detail("io error: "))),
            _ => TsqError::Execution(msg.to_string()),
        }
    }
}

/// Standard result alias.
pub type Result<T> = std::result::Result<T, TsqError>;
