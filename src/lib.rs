//! # Uplift
//!
//! Compiles declarative A/B-experiment metric definitions into
//! warehouse-native SQL producing per-variation, per-dimension
//! sufficient statistics.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────┐
//! │        Definitions (metrics, exposure queries,           │
//! │        segments, dimensions, experiment settings)        │
//! └─────────────────────────────────────────────────────────┘
//!                          │
//!                          ▼ [compile]
//! ┌─────────────────────────────────────────────────────────┐
//! │   Ordered CTE pipeline (identity bridges, exposures,     │
//! │   metric windows, funnels, per-user aggregates)          │
//! └─────────────────────────────────────────────────────────┘
//!                          │
//!                          ▼ [sql::dialect]
//! ┌─────────────────────────────────────────────────────────┐
//! │            Warehouse-native SQL text                     │
//! └─────────────────────────────────────────────────────────┘
//!                          │
//!                          ▼ [runner + decode]
//! ┌─────────────────────────────────────────────────────────┐
//! │   Sufficient-statistic rows (users, sums, sum squares)   │
//! └─────────────────────────────────────────────────────────┘
//! ```
//!
//! Compilation is pure text assembly: no I/O, no shared mutable state,
//! and byte-identical output for identical inputs (wall-clock-dependent
//! bounds take an explicit `now`). Execution happens behind the
//! [`runner::QueryRunner`] trait; decoding of result rows is defensive
//! and never fails.

pub mod compile;
pub mod decode;
pub mod discover;
pub mod error;
pub mod model;
pub mod runner;
pub mod sql;

/// Re-exports for convenient usage.
pub mod prelude {
    pub use crate::compile::{
        ExperimentMetricQueryParams, MetricValueQueryParams, PastExperimentsQueryParams,
        QueryCompiler,
    };
    pub use crate::decode::{MetricValueRow, PastExperimentRow, StatisticRow, StatisticType};
    pub use crate::error::{CompileError, CompileResult, ConfigurationError};
    pub use crate::model::{
        AttributionModel, DataSourceSettings, Dimension, DimensionDefinition,
        ExperimentSnapshotSettings, ExposureQuery, MetricDefinition, MetricType, Segment,
    };
    pub use crate::runner::QueryRunner;
    pub use crate::sql::dialect::{Dialect, SqlDialect};
}

// Also export at crate root for convenience
pub use compile::QueryCompiler;
pub use error::{CompileError, CompileResult};
pub use sql::dialect::Dialect;
