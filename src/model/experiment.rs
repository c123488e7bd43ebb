// src/model/experiment.rs
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// How exposures are attributed to metric events.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum AttributionModel {
    /// Each metric's own conversion delay/window bounds the interval.
    #[default]
    FirstExposure,
    /// The whole experiment duration is the conversion interval; per-metric
    /// conversion-window ends are ignored.
    ExperimentDuration,
}

/// Per-experiment computed overrides for one metric.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MetricComputedSettings {
    pub conversion_window_hours: f64,
    pub conversion_delay_hours: f64,
    pub regression_adjustment_enabled: bool,
    pub regression_adjustment_days: i64,
}

/// Metric entry in an experiment snapshot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MetricSettings {
    pub id: String,
    #[serde(default)]
    pub computed_settings: Option<MetricComputedSettings>,
}

/// Settings for one experiment analysis snapshot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExperimentSnapshotSettings {
    pub experiment_id: String,
    pub start_date: DateTime<Utc>,
    pub end_date: DateTime<Utc>,
    #[serde(default)]
    pub attribution_model: AttributionModel,
    /// Only include users exposed early enough to fully convert.
    #[serde(default)]
    pub skip_partial_data: bool,
    #[serde(default)]
    pub exposure_query_id: Option<String>,
    /// Raw SQL predicate ANDed into the experiment CTE.
    #[serde(default)]
    pub query_filter: Option<String>,
    /// Experiment-level switch for regression adjustment (CUPED).
    #[serde(default)]
    pub regression_adjustment_enabled: bool,
    #[serde(default)]
    pub metric_settings: Vec<MetricSettings>,
}
