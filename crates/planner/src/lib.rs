//! Query statements, physical plan model and the physical plan builder.
//!
//! Architecture role:
//! - defines the parsed [`Statement`] shapes shipped in task request payloads
//! - defines the root / intermediate / leaf [`PhysicalPlan`] topology
//! - builds that topology from cluster state ([`PhysicalPlanner`])
//!
//! Key modules:
//! - [`statement`]
//! - [`physical_plan`]
//! - [`physical_planner`]

pub mod physical_plan;
pub mod physical_planner;
pub mod statement;

pub use physical_plan::{Intermediate, Leaf, PhysicalPlan, Root};
pub use physical_planner::{PhysicalPlanner, PlanContext};
pub use statement::{
    AggType, FieldSelect, MetadataKind, MetadataQuery, MetricQuery, Statement, TagFilter,
};
