// src/model/metric.rs
use serde::{Deserialize, Serialize};

use crate::model::experiment::ExperimentSnapshotSettings;

/// Fallback conversion window when a metric doesn't configure one.
pub const DEFAULT_CONVERSION_WINDOW_HOURS: f64 = 72.0;

/// The statistical family a metric belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MetricType {
    Binomial,
    Count,
    Duration,
    Revenue,
}

impl MetricType {
    /// Tag used in emitted SQL and result rows.
    pub fn as_str(&self) -> &'static str {
        match self {
            MetricType::Binomial => "binomial",
            MetricType::Count => "count",
            MetricType::Duration => "duration",
            MetricType::Revenue => "revenue",
        }
    }
}

/// How the metric's value rows are sourced.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum QueryFormat {
    /// The metric owns raw SQL producing value/timestamp/user-id columns.
    Sql,
    /// Value/timestamp/user-id are resolved from declared table+column names.
    Builder,
}

/// A hardcoded condition ANDed into a builder-format metric's WHERE clause.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetricCondition {
    pub column: String,
    pub operator: String,
    pub value: String,
}

/// A stored metric definition.
///
/// Immutable from the compiler's perspective: per-experiment overrides
/// are merged into a query-scoped clone via [`Self::with_overrides`],
/// never written back.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MetricDefinition {
    pub id: String,
    pub name: String,
    #[serde(rename = "type")]
    pub metric_type: MetricType,

    /// Raw metric SQL (preferred). Treated as opaque text with variable
    /// substitution only.
    #[serde(default)]
    pub sql: Option<String>,
    /// Explicit format override; defaults to `sql` when SQL text exists.
    #[serde(default)]
    pub query_format: Option<QueryFormat>,

    // Builder-format source (legacy query builder).
    #[serde(default)]
    pub table: Option<String>,
    #[serde(default)]
    pub column: Option<String>,
    #[serde(default)]
    pub timestamp_column: Option<String>,
    #[serde(default)]
    pub user_id_columns: Option<std::collections::HashMap<String, String>>,
    #[serde(default)]
    pub conditions: Vec<MetricCondition>,

    /// Identifier spaces this metric's rows can be joined on.
    #[serde(default)]
    pub user_id_types: Vec<String>,

    #[serde(default)]
    pub conversion_window_hours: Option<f64>,
    #[serde(default)]
    pub conversion_delay_hours: Option<f64>,

    /// Upper bound applied to the per-user aggregate via LEAST().
    #[serde(default)]
    pub cap: Option<f64>,
    /// Custom per-user aggregation expression (sql format only).
    #[serde(default)]
    pub aggregation: Option<String>,
    /// Exclude users whose aggregate is zero from the final rollup.
    #[serde(default)]
    pub ignore_nulls: bool,

    #[serde(default)]
    pub regression_adjustment_enabled: bool,
    #[serde(default)]
    pub regression_adjustment_days: Option<i64>,
}

impl MetricDefinition {
    /// Resolved query format: explicit setting wins, else `sql` when SQL
    /// text is present.
    pub fn query_format(&self) -> QueryFormat {
        self.query_format.unwrap_or(if self.sql.is_some() {
            QueryFormat::Sql
        } else {
            QueryFormat::Builder
        })
    }

    /// A zero window means unset and falls back to the default.
    pub fn conversion_window_hours(&self) -> f64 {
        match self.conversion_window_hours {
            Some(hours) if hours != 0.0 => hours,
            _ => DEFAULT_CONVERSION_WINDOW_HOURS,
        }
    }

    pub fn conversion_delay_hours(&self) -> f64 {
        self.conversion_delay_hours.unwrap_or(0.0)
    }

    /// Regression adjustment window, clamped to [0, 100] days.
    pub fn regression_adjustment_days(&self) -> i64 {
        self.regression_adjustment_days.unwrap_or(0).clamp(0, 100)
    }

    /// Merge the experiment's computed per-metric settings into a clone.
    ///
    /// The stored definition is left untouched, so concurrent
    /// compilations sharing it never observe partial overrides.
    pub fn with_overrides(&self, settings: &ExperimentSnapshotSettings) -> MetricDefinition {
        let mut metric = self.clone();

        let computed = settings
            .metric_settings
            .iter()
            .find(|s| s.id == metric.id)
            .and_then(|s| s.computed_settings.as_ref());

        if let Some(computed) = computed {
            metric.conversion_delay_hours = Some(computed.conversion_delay_hours);
            metric.conversion_window_hours = Some(computed.conversion_window_hours);
            metric.regression_adjustment_enabled = computed.regression_adjustment_enabled;
            metric.regression_adjustment_days = Some(computed.regression_adjustment_days);
        }

        if let Some(days) = metric.regression_adjustment_days {
            metric.regression_adjustment_days = Some(days.clamp(0, 100));
        }

        metric
    }
}
