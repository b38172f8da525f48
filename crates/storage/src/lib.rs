//! Storage-engine contracts consumed by leaf-side query stages.
//!
//! Architecture role:
//! - [`engine`]: database / metadata / shard traits a storage node implements
//! - [`series`]: down-sampled, grouped time-series result model
//! - [`memory`]: in-memory engine backing embedded clusters and tests

pub mod engine;
pub mod memory;
pub mod series;

pub use engine::*;
pub use memory::{MemoryDatabase, MemoryEngine};
pub use series::{FieldSeries, TimeSeries};
