//! Definition types supplied by the external definition store.
//!
//! These are plain serde types mirroring the wire shape the store
//! hands us (camelCase keys). The compiler never mutates a stored
//! definition; query-scoped overrides are applied clone-then-merge
//! (see [`metric::MetricDefinition::with_overrides`]).

pub mod datasource;
pub mod experiment;
pub mod metric;
pub mod segment;

pub use datasource::{DataSourceQueries, DataSourceSettings, ExposureQuery, IdentityJoinQuery};
pub use experiment::{
    AttributionModel, ExperimentSnapshotSettings, MetricComputedSettings, MetricSettings,
};
pub use metric::{MetricCondition, MetricDefinition, MetricType, QueryFormat};
pub use segment::{Dimension, DimensionDefinition, Segment};
