//! Local execution primitives shared by storage (leaf) and broker nodes.
//!
//! Architecture role:
//! - stage / plan-node / operator contracts and the [`Pipeline`] driver
//! - [`StageTracker`] state machine with explain statistics
//! - fixed-size [`WorkerPool`] for blocking stage work
//! - pipeline and request registries for introspection
//! - leaf stages (metadata lookup, series filter, data scan, aggregate, metadata suggest)
//! - grouping aggregator and stats wire model
//!
//! Key modules:
//! - [`stage`]
//! - [`pipeline`]
//! - [`tracker`]
//! - [`leaf`]
//! - [`aggregation`]
//! - [`stats`]

pub mod aggregation;
pub mod leaf;
pub mod pipeline;
pub mod pool;
pub mod registry;
pub mod stage;
pub mod stats;
pub mod tracker;

pub use aggregation::{GroupingAggregator, decode_series, encode_series};
pub use leaf::{
    AggregateStage, DataScanStage, LeafExecuteContext, LeafMetadataContext, MetadataLookupStage,
    MetadataSuggestStage, ResolvedMetric, SeriesFilterStage,
};
pub use pipeline::Pipeline;
pub use pool::WorkerPool;
pub use registry::{PipelineRegistry, RequestInfo, RequestRegistry};
pub use stage::{Operator, PlanNode, Stage, StageCompletion, StageType};
pub use stats::{
    BrokerNodeStats, LeafNodeStats, OperatorStats, QueryStats, StageState, StageStats,
    decode_stats, encode_stats,
};
pub use tracker::StageTracker;
