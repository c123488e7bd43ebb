//! Query compilation: declarative experiment/metric definitions in,
//! warehouse-native SQL out.
//!
//! The central type is [`QueryCompiler`], which owns a dialect and a
//! read-only view of the datasource settings. Each public method
//! compiles one query kind:
//!
//! - [`QueryCompiler::experiment_metric_query`] - per-variation,
//!   per-dimension sufficient statistics for one metric
//! - [`QueryCompiler::metric_value_query`] - overall (and optionally
//!   per-day) aggregates of one metric outside any experiment
//! - [`QueryCompiler::past_experiments_query`] - traffic-thresholded
//!   discovery of historical experiments
//! - [`QueryCompiler::test_query`] - a five-row sample wrapper for
//!   validating user-supplied SQL
//!
//! Compilation is pure text assembly: given the same definitions and
//! the same `now`, the same bytes come out.

mod identity;
mod metric;
mod value;

pub use identity::{base_id_type_and_joins, BaseIdResolution};
pub use value::{MetricValueQueryParams, PastExperimentsQueryParams};

use chrono::{DateTime, Duration, Utc};
use tracing::debug;

use crate::decode::StatisticType;
use crate::error::CompileResult;
use crate::model::{
    AttributionModel, DataSourceSettings, Dimension, DimensionDefinition, ExperimentSnapshotSettings,
    MetricDefinition, MetricType, Segment,
};
use crate::sql::dialect::{Dialect, SqlDialect};
use crate::sql::{format_sql, render_query, replace_sql_vars, Cte, SqlVars};

use metric::{
    aggregate_metric_column, metric_end, metric_min_delay, metric_start, MetricCteParams,
};

/// Sentinel dimension value for users with no dimension row.
pub const NULL_DIMENSION: &str = "__NULL_DIMENSION";

/// Sentinel variation for users exposed to more than one variation.
pub const MULTIPLE_VARIATIONS: &str = "__multiple__";

/// Inputs for one experiment metric query.
#[derive(Debug, Clone)]
pub struct ExperimentMetricQueryParams<'a> {
    pub metric: &'a MetricDefinition,
    /// Funnel of metrics a user must complete, in order, to count as
    /// activated.
    pub activation_metrics: &'a [MetricDefinition],
    /// Funnel of denominator metrics; the last one defines the ratio
    /// denominator when it is a count.
    pub denominator_metrics: &'a [MetricDefinition],
    pub settings: &'a ExperimentSnapshotSettings,
    pub segment: Option<&'a Segment>,
    pub dimension: Option<&'a Dimension>,
    /// Wall-clock reference, passed explicitly so compilation is
    /// reproducible.
    pub now: DateTime<Utc>,
}

/// Compiles definition objects into warehouse SQL for one dialect.
#[derive(Debug, Clone)]
pub struct QueryCompiler<'a> {
    pub(crate) dialect: Dialect,
    pub(crate) settings: &'a DataSourceSettings,
    /// Default schema for builder-format metric tables.
    pub(crate) schema: Option<String>,
    /// Database/catalog, required by some dialects for information
    /// schema addressing and generated table names.
    pub(crate) database: Option<String>,
}

impl<'a> QueryCompiler<'a> {
    pub fn new(dialect: Dialect, settings: &'a DataSourceSettings) -> Self {
        Self {
            dialect,
            settings,
            schema: None,
            database: None,
        }
    }

    pub fn with_schema(mut self, schema: impl Into<String>) -> Self {
        self.schema = Some(schema.into());
        self
    }

    pub fn with_database(mut self, database: impl Into<String>) -> Self {
        self.database = Some(database.into());
        self
    }

    pub fn dialect(&self) -> Dialect {
        self.dialect
    }

    /// Compile the experiment metric query: one output row per
    /// variation/dimension carrying sufficient statistics for the
    /// metric (and, where applicable, its ratio denominator and CUPED
    /// covariate).
    pub fn experiment_metric_query(
        &self,
        params: &ExperimentMetricQueryParams<'_>,
    ) -> CompileResult<String> {
        let settings = params.settings;

        // Merge per-experiment overrides into query-scoped clones.
        let metric = params.metric.with_overrides(settings);
        let activation_metrics: Vec<MetricDefinition> = params
            .activation_metrics
            .iter()
            .map(|m| m.with_overrides(settings))
            .collect();
        let denominator_metrics: Vec<MetricDefinition> = params
            .denominator_metrics
            .iter()
            .map(|m| m.with_overrides(settings))
            .collect();

        let vars = SqlVars {
            start_date: settings.start_date,
            end_date: Some(settings.end_date),
            experiment_id: Some(settings.experiment_id.clone()),
        };

        // An activation dimension without activation metrics is meaningless.
        let mut dimension = params.dimension.cloned();
        if matches!(dimension, Some(Dimension::Activation)) && activation_metrics.is_empty() {
            dimension = None;
        }
        if let Some(Dimension::User { dimension: def }) = dimension.as_mut() {
            def.sql = replace_sql_vars(&def.sql, &vars)?;
        }
        let mut segment = params.segment.cloned();
        if let Some(seg) = segment.as_mut() {
            seg.sql = replace_sql_vars(&seg.sql, &vars)?;
        }

        let exposure_query = self
            .settings
            .exposure_query(settings.exposure_query_id.as_deref())?;

        // A binomial denominator just filters; a count denominator makes
        // this a real ratio of two quantities.
        let ratio_denominator = denominator_metrics
            .last()
            .filter(|d| d.metric_type == MetricType::Count);
        let is_ratio = ratio_denominator.is_some();
        // Denominator metrics gate the numerator like a funnel. A future
        // generic-ratio mode would sum both sides across all users instead.
        let ratio_is_funnel = true;

        let cumulative_date = dimension
            .as_ref()
            .map_or(false, Dimension::is_cumulative_date);

        let is_regression_adjusted = settings.regression_adjustment_enabled
            && metric.regression_adjustment_days() > 0
            && metric.regression_adjustment_enabled
            && !is_ratio
            && metric.aggregation.is_none();
        let regression_adjustment_hours = if is_regression_adjusted {
            metric.regression_adjustment_days() as f64 * 24.0
        } else {
            0.0
        };

        let ignore_conversion_end =
            settings.attribution_model == AttributionModel::ExperimentDuration;

        // Rough scan bounds for all metric CTEs, widened for the whole
        // funnel so no stage's window is cut off.
        let ordered_metrics: Vec<&MetricDefinition> = activation_metrics
            .iter()
            .chain(denominator_metrics.iter())
            .chain(std::iter::once(&metric))
            .collect();
        let min_metric_delay = metric_min_delay(&ordered_metrics);
        let metric_start_date = metric_start(
            settings.start_date,
            min_metric_delay,
            regression_adjustment_hours,
        );
        let metric_end_date = metric_end(
            &ordered_metrics,
            Some(settings.end_date),
            ignore_conversion_end,
        );

        let mut id_objects: Vec<Vec<String>> =
            vec![vec![exposure_query.user_id_type.clone()]];
        id_objects.push(match &dimension {
            Some(Dimension::User { dimension: def }) => vec![def.user_id_type().to_string()],
            _ => vec![],
        });
        id_objects.push(
            segment
                .as_ref()
                .map(|s| vec![s.user_id_type().to_string()])
                .unwrap_or_default(),
        );
        id_objects.push(metric.user_id_types.clone());
        for m in &activation_metrics {
            id_objects.push(m.user_id_types.clone());
        }
        for m in &denominator_metrics {
            id_objects.push(m.user_id_types.clone());
        }

        let identities = self.identities_cte(
            &id_objects,
            settings.start_date,
            Some(settings.end_date),
            Some(&exposure_query.user_id_type),
            Some(&settings.experiment_id),
        )?;
        let base = identities.base_id_type.as_str();

        debug!(
            experiment = %settings.experiment_id,
            metric = %metric.id,
            base_id_type = base,
            bridges = identities.ctes.len(),
            is_ratio,
            is_regression_adjusted,
            "compiling experiment metric query"
        );

        let dimension_col = self.dimension_column(base, dimension.as_ref());

        let initial_metric = activation_metrics
            .first()
            .or_else(|| denominator_metrics.first())
            .unwrap_or(&metric);
        let initial_conversion_window_hours = initial_metric.conversion_window_hours();
        let initial_conversion_delay_hours = initial_metric.conversion_delay_hours();

        let start_date = settings.start_date;
        let end_date = self.experiment_end_date(
            settings,
            initial_conversion_window_hours + initial_conversion_delay_hours,
            params.now,
        );

        let mut ctes: Vec<Cte> = identities.ctes.clone();

        ctes.push(Cte::new(
            "__rawExperiment",
            replace_sql_vars(&exposure_query.query, &vars)?,
        ));
        ctes.push(Cte::new(
            "__experiment",
            self.experiment_cte(&ExperimentCteParams {
                settings,
                base_id_type: base,
                start_date,
                end_date: Some(end_date),
                conversion_window_hours: initial_conversion_window_hours,
                conversion_delay_hours: initial_conversion_delay_hours,
                experiment_dimension: match &dimension {
                    Some(Dimension::Experiment { id }) => Some(id),
                    _ => None,
                },
                is_regression_adjusted,
                regression_adjustment_hours,
                min_metric_delay,
                ignore_conversion_end,
            }),
        ));
        ctes.push(Cte::new(
            "__metric",
            self.metric_cte(&MetricCteParams {
                metric: &metric,
                conversion_window_hours: 0.0,
                conversion_delay_hours: 0.0,
                ignore_conversion_end,
                base_id_type: base,
                id_join_map: &identities.join_map,
                start_date: metric_start_date,
                end_date: metric_end_date,
                experiment_id: Some(&settings.experiment_id),
            })?,
        ));

        if let Some(seg) = &segment {
            ctes.push(Cte::new(
                "__segment",
                self.segment_cte(seg, base, &identities.join_map),
            ));
        }
        if let Some(Dimension::User { dimension: def }) = &dimension {
            ctes.push(Cte::new(
                "__dimension",
                self.dimension_cte(def, base, &identities.join_map),
            ));
        }

        for (i, m) in activation_metrics.iter().enumerate() {
            let next = activation_metrics
                .get(i + 1)
                .or_else(|| denominator_metrics.first())
                .unwrap_or(&metric);
            ctes.push(Cte::new(
                format!("__activationMetric{}", i),
                self.metric_cte(&MetricCteParams {
                    metric: m,
                    conversion_window_hours: next.conversion_window_hours(),
                    conversion_delay_hours: next.conversion_delay_hours(),
                    ignore_conversion_end,
                    base_id_type: base,
                    id_join_map: &identities.join_map,
                    start_date: metric_start_date,
                    end_date: metric_end_date,
                    experiment_id: Some(&settings.experiment_id),
                })?,
            ));
        }

        let has_activation = !activation_metrics.is_empty();
        let activation_dimension = matches!(dimension, Some(Dimension::Activation));

        if has_activation {
            ctes.push(Cte::new(
                "__activatedUsers",
                self.activated_users_cte(
                    base,
                    activation_metrics.len(),
                    is_regression_adjusted,
                    ignore_conversion_end,
                    "__activationMetric",
                    "__experiment",
                ),
            ));
        }

        for (i, m) in denominator_metrics.iter().enumerate() {
            let next = denominator_metrics.get(i + 1).unwrap_or(&metric);
            ctes.push(Cte::new(
                format!("__denominator{}", i),
                self.metric_cte(&MetricCteParams {
                    metric: m,
                    conversion_window_hours: next.conversion_window_hours(),
                    conversion_delay_hours: next.conversion_delay_hours(),
                    ignore_conversion_end,
                    base_id_type: base,
                    id_join_map: &identities.join_map,
                    start_date: metric_start_date,
                    end_date: metric_end_date,
                    experiment_id: Some(&settings.experiment_id),
                })?,
            ));
        }

        let has_denominator = !denominator_metrics.is_empty() && ratio_is_funnel;
        if has_denominator {
            // Denominators chain off the activated population unless the
            // dimension itself is activation membership.
            let initial_table = if !activation_dimension && has_activation {
                "__activatedUsers"
            } else {
                "__experiment"
            };
            ctes.push(Cte::new(
                "__denominatorUsers",
                self.activated_users_cte(
                    base,
                    denominator_metrics.len(),
                    false,
                    ignore_conversion_end,
                    "__denominator",
                    initial_table,
                ),
            ));
        }

        ctes.push(Cte::new(
            "__distinctUsers",
            self.distinct_users_cte(&DistinctUsersParams {
                base_id_type: base,
                dimension_col: &dimension_col,
                dimension: dimension.as_ref(),
                segment: segment.is_some(),
                has_activation,
                has_denominator,
                is_regression_adjusted,
                cumulative_date,
                ignore_conversion_end,
            }),
        ));

        if cumulative_date {
            ctes.push(Cte::new(
                "__dateRange",
                self.date_table(start_date, Some(end_date)),
            ));
        }

        ctes.push(Cte::new(
            "__userMetricJoin",
            self.user_metric_join_cte(base, ignore_conversion_end, cumulative_date),
        ));
        ctes.push(Cte::new(
            "__userMetricAgg",
            self.user_metric_agg_cte(base, &metric, cumulative_date),
        ));

        if let Some(denominator) = ratio_denominator {
            ctes.push(Cte::new(
                "__userDenominatorAgg",
                self.user_denominator_agg_cte(
                    base,
                    denominator,
                    denominator_metrics.len() - 1,
                    ignore_conversion_end,
                    cumulative_date,
                ),
            ));
        }

        if is_regression_adjusted {
            ctes.push(Cte::new(
                "__userCovariateMetric",
                self.user_covariate_metric_cte(base, &metric),
            ));
        }

        let final_select = self.final_statistics_select(&FinalSelectParams {
            base_id_type: base,
            metric: &metric,
            ratio_denominator,
            is_regression_adjusted,
            cumulative_date,
        });

        let sql = format!(
            "-- {} ({})\n{}",
            metric.name,
            metric.metric_type.as_str(),
            render_query(&ctes, &final_select)
        );
        Ok(format_sql(&sql))
    }

    /// Last allowed exposure timestamp for this analysis.
    ///
    /// With `skip_partial_data`, users exposed too recently to fully
    /// convert are excluded by capping at `now` minus the initial
    /// conversion window.
    fn experiment_end_date(
        &self,
        settings: &ExperimentSnapshotSettings,
        conversion_window_hours: f64,
        now: DateTime<Utc>,
    ) -> DateTime<Utc> {
        if settings.skip_partial_data {
            let conversion_window_end =
                now - Duration::seconds((conversion_window_hours * 3600.0).round() as i64);
            return settings.end_date.min(conversion_window_end);
        }
        settings.end_date
    }

    fn experiment_cte(&self, p: &ExperimentCteParams<'_>) -> String {
        let timestamp_col = self.dialect.cast_user_date_col("e.timestamp");
        let base = p.base_id_type;

        let mut sql = format!(
            "-- Viewed Experiment\nSELECT\n  e.{base} as {base},\n  {variation} as variation,\n  {ts} as timestamp,\n",
            base = base,
            variation = self.dialect.cast_to_string("e.variation_id"),
            ts = timestamp_col,
        );
        if p.is_regression_adjusted {
            sql += &format!(
                "  {} AS preexposure_end,\n  {} AS preexposure_start,\n",
                self.dialect.add_hours(&timestamp_col, p.min_metric_delay),
                self.dialect.add_hours(
                    &timestamp_col,
                    p.min_metric_delay - p.regression_adjustment_hours
                ),
            );
        }
        sql += &format!(
            "  {} as conversion_start",
            self.dialect
                .add_hours(&timestamp_col, p.conversion_delay_hours)
        );
        if let Some(dim) = p.experiment_dimension {
            sql += &format!(",\n  e.{} as dimension", dim);
        }
        if !p.ignore_conversion_end {
            sql += &format!(
                ",\n  {} as conversion_end",
                self.dialect.add_hours(
                    &timestamp_col,
                    p.conversion_delay_hours + p.conversion_window_hours
                )
            );
        }
        sql += &format!(
            "\nFROM\n  __rawExperiment e\nWHERE\n  e.experiment_id = '{}'\n  AND {} >= {}",
            p.settings.experiment_id,
            timestamp_col,
            self.dialect.to_timestamp(&p.start_date),
        );
        if let Some(end) = p.end_date {
            sql += &format!("\n  AND {} <= {}", timestamp_col, self.dialect.to_timestamp(&end));
        }
        if let Some(filter) = p.settings.query_filter.as_deref() {
            if !filter.trim().is_empty() {
                sql += &format!("\n  AND (\n{}\n)", filter);
            }
        }
        sql
    }

    /// Segment membership keyed on the base id type, with the entry date
    /// normalized for comparison against exposure timestamps.
    pub(crate) fn segment_cte(
        &self,
        segment: &Segment,
        base_id_type: &str,
        id_join_map: &std::collections::HashMap<String, String>,
    ) -> String {
        let date_col = self.dialect.cast_user_date_col("s.date");
        let user_id_type = segment.user_id_type();

        if user_id_type != base_id_type {
            let join_table = id_join_map
                .get(user_id_type)
                .map(String::as_str)
                .unwrap_or_default();
            return format!(
                "-- Segment ({name})\nSELECT\n  i.{base},\n  {date} as date\nFROM\n  (\n    {sql}\n  ) s\n  JOIN {join} i ON ( i.{id} = s.{id} )",
                name = segment.name,
                base = base_id_type,
                date = date_col,
                sql = segment.sql,
                join = join_table,
                id = user_id_type,
            );
        }

        if date_col != "s.date" {
            return format!(
                "-- Segment ({name})\nSELECT\n  s.{id},\n  {date} as date\nFROM\n  (\n    {sql}\n  ) s",
                name = segment.name,
                id = user_id_type,
                date = date_col,
                sql = segment.sql,
            );
        }

        format!("-- Segment ({})\n{}", segment.name, segment.sql)
    }

    fn dimension_cte(
        &self,
        dimension: &DimensionDefinition,
        base_id_type: &str,
        id_join_map: &std::collections::HashMap<String, String>,
    ) -> String {
        let user_id_type = dimension.user_id_type();

        if user_id_type != base_id_type {
            let join_table = id_join_map
                .get(user_id_type)
                .map(String::as_str)
                .unwrap_or_default();
            return format!(
                "-- Dimension ({name})\nSELECT\n  i.{base},\n  d.value\nFROM\n  (\n    {sql}\n  ) d\n  JOIN {join} i ON ( i.{id} = d.{id} )",
                name = dimension.name,
                base = base_id_type,
                sql = dimension.sql,
                join = join_table,
                id = user_id_type,
            );
        }

        format!("-- Dimension ({})\n{}", dimension.name, dimension.sql)
    }

    /// Join a funnel of staged metric CTEs so each stage's event falls
    /// inside the window opened by the previous stage.
    fn activated_users_cte(
        &self,
        base_id_type: &str,
        metric_count: usize,
        is_regression_adjusted: bool,
        ignore_conversion_end: bool,
        table_prefix: &str,
        initial_table: &str,
    ) -> String {
        let last = metric_count.saturating_sub(1);

        let mut sql = format!("SELECT\n  initial.{},\n", base_id_type);
        if is_regression_adjusted {
            sql += "  initial.preexposure_start,\n  initial.preexposure_end,\n";
        }
        sql += &format!("  t{}.conversion_start as conversion_start", last);
        if !ignore_conversion_end {
            sql += &format!(",\n  t{}.conversion_end as conversion_end", last);
        }
        sql += &format!("\nFROM\n  {} initial", initial_table);
        for i in 0..metric_count {
            let prev = if i == 0 {
                "initial".to_string()
            } else {
                format!("t{}", i - 1)
            };
            sql += &format!(
                "\n  JOIN {prefix}{i} t{i} ON (\n    t{i}.{base} = {prev}.{base}\n  )",
                prefix = table_prefix,
                i = i,
                base = base_id_type,
                prev = prev,
            );
        }
        sql += "\nWHERE\n  ";
        let conditions: Vec<String> = (0..metric_count)
            .map(|i| {
                let prev = if i == 0 {
                    "initial".to_string()
                } else {
                    format!("t{}", i - 1)
                };
                let mut cond = format!("t{}.timestamp >= {}.conversion_start", i, prev);
                if !ignore_conversion_end {
                    cond += &format!("\n  AND t{}.timestamp <= {}.conversion_end", i, prev);
                }
                cond
            })
            .collect();
        sql += &conditions.join("\n  AND ");
        sql
    }

    /// Expression producing the dimension bucket, evaluated inside the
    /// grouped one-row-per-user select.
    fn dimension_column(&self, base_id_type: &str, dimension: Option<&Dimension>) -> String {
        match dimension {
            None | Some(Dimension::DateCumulative) | Some(Dimension::DateDaily) => {
                self.dialect.cast_to_string("'All'")
            }
            Some(Dimension::Activation) => format!(
                "MAX({})",
                self.dialect.if_else(
                    &format!("a.{} IS NULL", base_id_type),
                    "'Not Activated'",
                    "'Activated'",
                )
            ),
            Some(Dimension::User { .. }) => format!(
                "COALESCE(MAX({}),'{}')",
                self.dialect.cast_to_string("d.value"),
                NULL_DIMENSION,
            ),
            Some(Dimension::Date) => format!(
                "MIN({})",
                self.dialect.format_date(&self.dialect.date_trunc("e.timestamp"))
            ),
            // Pair each dimension value with its sortable timestamp so
            // MIN picks the value of the first exposure, then strip the
            // 19-character timestamp prefix back off.
            Some(Dimension::Experiment { .. }) => format!(
                "SUBSTRING(\n  MIN(\n    CONCAT(SUBSTRING({}, 1, 19),\n      coalesce({}, {})\n    )\n  ),\n  20,\n  99999\n)",
                self.dialect.format_date_time_string("e.timestamp"),
                self.dialect.cast_to_string("e.dimension"),
                self.dialect.cast_to_string(&format!("'{}'", NULL_DIMENSION)),
            ),
        }
    }

    fn distinct_users_cte(&self, p: &DistinctUsersParams<'_>) -> String {
        let base = p.base_id_type;
        let conversion_base_activation = p.has_activation && !matches!(p.dimension, Some(Dimension::Activation));

        let mut sql = format!(
            "-- One row per user\nSELECT\n  e.{base} as {base},\n  {dim} as dimension,\n",
            base = base,
            dim = p.dimension_col,
        );
        if p.is_regression_adjusted {
            sql += "  MIN(e.preexposure_start) AS preexposure_start,\n  MIN(e.preexposure_end) AS preexposure_end,\n";
        }
        if p.cumulative_date {
            sql += &format!(
                "  MIN({}) AS first_exposure_date,\n",
                self.dialect.date_trunc("e.timestamp")
            );
        }
        sql += &format!(
            "  {} as variation,\n",
            self.dialect.if_else(
                "count(distinct e.variation) > 1",
                &format!("'{}'", MULTIPLE_VARIATIONS),
                "max(e.variation)",
            )
        );
        sql += &format!(
            "  MIN({}) as conversion_start",
            conversion_base("conversion_start", p.has_denominator, conversion_base_activation)
        );
        if !p.ignore_conversion_end {
            sql += &format!(
                ",\n  MIN({}) as conversion_end",
                conversion_base("conversion_end", p.has_denominator, conversion_base_activation)
            );
        }
        sql += "\nFROM\n  __experiment e";
        if p.segment {
            sql += &format!("\n  JOIN __segment s ON (s.{base} = e.{base})", base = base);
        }
        if matches!(p.dimension, Some(Dimension::User { .. })) {
            sql += &format!(
                "\n  LEFT JOIN __dimension d ON (d.{base} = e.{base})",
                base = base
            );
        }
        if p.has_activation {
            let left = if matches!(p.dimension, Some(Dimension::Activation)) {
                "LEFT "
            } else {
                ""
            };
            sql += &format!(
                "\n  {left}JOIN __activatedUsers a ON (\n    a.{base} = e.{base}\n  )",
                left = left,
                base = base
            );
        }
        if p.has_denominator {
            sql += &format!(
                "\n  JOIN __denominatorUsers du ON (du.{base} = e.{base})",
                base = base
            );
        }
        if p.segment {
            sql += "\nWHERE s.date <= e.timestamp";
        }
        sql += &format!("\nGROUP BY\n  e.{}", base);
        sql
    }

    /// Calendar-day series spanning the analysis range.
    fn date_table(&self, start_date: DateTime<Utc>, end_date: Option<DateTime<Utc>>) -> String {
        let end = match end_date {
            Some(end) => self.dialect.cast_to_date(&self.dialect.to_timestamp(&end)),
            None => self.dialect.current_date(),
        };
        format!(
            "SELECT {day} AS day\nFROM\n  (\n    SELECT\n      GENERATE_SERIES(\n        {start},\n        {end},\n        {step}\n      ) AS day\n  ) t",
            day = self.dialect.cast_to_date("t.day"),
            start = self
                .dialect
                .cast_to_date(&self.dialect.to_timestamp(&start_date)),
            end = end,
            step = self
                .dialect
                .add_time("", crate::sql::TimeUnit::Day, "", 1),
        )
    }

    /// Metric value scoped to each user's conversion window; NULL keeps
    /// "no data" distinguishable from a zero value until aggregation.
    fn case_when_time_filter(
        &self,
        col: &str,
        ignore_conversion_end: bool,
        cumulative_date: bool,
    ) -> String {
        let mut condition = String::from("m.timestamp >= d.conversion_start");
        if !ignore_conversion_end {
            condition += "\n  AND m.timestamp <= d.conversion_end";
        }
        if cumulative_date {
            condition += &format!("\n  AND {} <= dr.day", self.dialect.date_trunc("m.timestamp"));
        }
        self.dialect
            .if_else(&condition, &format!("COALESCE({}, 0)", col), "NULL")
    }

    fn user_metric_join_cte(
        &self,
        base_id_type: &str,
        ignore_conversion_end: bool,
        cumulative_date: bool,
    ) -> String {
        let mut sql = String::from("SELECT\n  d.variation AS variation,\n  d.dimension AS dimension,\n");
        if cumulative_date {
            sql += &format!("  {} AS day,\n", self.dialect.date_trunc("dr.day"));
        }
        sql += &format!(
            "  d.{base} AS {base},\n  {value} as value\nFROM\n  __distinctUsers d\n  LEFT JOIN __metric m ON (\n    m.{base} = d.{base}\n  )",
            base = base_id_type,
            value = self.case_when_time_filter("m.value", ignore_conversion_end, cumulative_date),
        );
        if cumulative_date {
            sql += "\n  CROSS JOIN __dateRange dr\nWHERE\n  d.first_exposure_date <= dr.day";
        }
        sql
    }

    fn user_metric_agg_cte(
        &self,
        base_id_type: &str,
        metric: &MetricDefinition,
        cumulative_date: bool,
    ) -> String {
        let day = if cumulative_date { "  day,\n" } else { "" };
        format!(
            "-- Add in the aggregate metric value for each user\nSELECT\n  variation,\n  dimension,\n{day}  {base},\n  {agg} as value\nFROM\n  __userMetricJoin\nGROUP BY\n  variation,\n  dimension,\n{day}  {base}",
            day = day,
            base = base_id_type,
            agg = aggregate_metric_column(metric),
        )
    }

    fn user_denominator_agg_cte(
        &self,
        base_id_type: &str,
        denominator: &MetricDefinition,
        last_denominator_index: usize,
        ignore_conversion_end: bool,
        cumulative_date: bool,
    ) -> String {
        let base = base_id_type;
        let mut sql = String::from("SELECT\n  d.variation AS variation,\n  d.dimension AS dimension,\n");
        if cumulative_date {
            sql += &format!("  {} AS day,\n", self.dialect.date_trunc("dr.day"));
        }
        sql += &format!(
            "  d.{base} AS {base},\n  {agg} as value\nFROM\n  __distinctUsers d\n  JOIN __denominator{i} m ON (\n    m.{base} = d.{base}\n  )",
            base = base,
            agg = aggregate_metric_column(denominator),
            i = last_denominator_index,
        );
        if cumulative_date {
            sql += "\n  CROSS JOIN __dateRange dr";
        }
        sql += "\nWHERE\n  m.timestamp >= d.conversion_start";
        if !ignore_conversion_end {
            sql += "\n  AND m.timestamp <= d.conversion_end";
        }
        if cumulative_date {
            sql += &format!(
                "\n  AND {} <= dr.day AND d.first_exposure_date <= dr.day",
                self.dialect.cast_to_date("m.timestamp")
            );
        }
        sql += "\nGROUP BY\n  d.variation,\n  d.dimension,\n";
        if cumulative_date {
            sql += &format!("  {},\n", self.dialect.date_trunc("dr.day"));
        }
        sql += &format!("  d.{}", base);
        sql
    }

    fn user_covariate_metric_cte(&self, base_id_type: &str, metric: &MetricDefinition) -> String {
        format!(
            "SELECT\n  d.variation AS variation,\n  d.dimension AS dimension,\n  d.{base} AS {base},\n  {agg} as value\nFROM\n  __distinctUsers d\n  JOIN __metric m ON (\n    m.{base} = d.{base}\n  )\nWHERE\n  m.timestamp >= d.preexposure_start\n  AND m.timestamp < d.preexposure_end\nGROUP BY\n  d.variation,\n  d.dimension,\n  d.{base}",
            base = base_id_type,
            agg = aggregate_metric_column(metric),
        )
    }

    fn final_statistics_select(&self, p: &FinalSelectParams<'_>) -> String {
        let dimension_expr = if p.cumulative_date {
            self.dialect.format_date("m.day")
        } else {
            "m.dimension".to_string()
        };
        let statistic_type =
            StatisticType::for_query(p.ratio_denominator.is_some(), p.is_regression_adjusted);

        let mut sql = format!(
            "-- One row per variation/dimension with aggregations\nSELECT\n  m.variation,\n  {dim} AS dimension,\n  COUNT(*) AS users,\n  '{stat}' as statistic_type,\n  '{mtype}' as main_metric_type,\n  SUM(COALESCE(m.value, 0)) AS main_sum,\n  SUM(POWER(COALESCE(m.value, 0), 2)) AS main_sum_squares",
            dim = dimension_expr,
            stat = statistic_type.as_str(),
            mtype = p.metric.metric_type.as_str(),
        );
        if let Some(denominator) = p.ratio_denominator {
            sql += &format!(
                ",\n  '{dtype}' as denominator_metric_type,\n  SUM(COALESCE(d.value, 0)) AS denominator_sum,\n  SUM(POWER(COALESCE(d.value, 0), 2)) AS denominator_sum_squares,\n  SUM(COALESCE(d.value, 0) * COALESCE(m.value, 0)) AS main_denominator_sum_product",
                dtype = denominator.metric_type.as_str(),
            );
        }
        if p.is_regression_adjusted {
            sql += &format!(
                ",\n  '{ctype}' as covariate_metric_type,\n  SUM(COALESCE(c.value, 0)) AS covariate_sum,\n  SUM(POWER(COALESCE(c.value, 0), 2)) AS covariate_sum_squares,\n  SUM(COALESCE(m.value, 0) * COALESCE(c.value, 0)) AS main_covariate_sum_product",
                ctype = p.metric.metric_type.as_str(),
            );
        }
        sql += "\nFROM\n  __userMetricAgg m";
        if p.ratio_denominator.is_some() {
            sql += &format!(
                "\n  LEFT JOIN __userDenominatorAgg d ON (\n    d.{base} = m.{base}{day}\n  )",
                base = p.base_id_type,
                day = if p.cumulative_date {
                    "\n    AND d.day = m.day"
                } else {
                    ""
                },
            );
        }
        if p.is_regression_adjusted {
            sql += &format!(
                "\n  LEFT JOIN __userCovariateMetric c ON (c.{base} = m.{base})",
                base = p.base_id_type
            );
        }
        if p.ratio_denominator.is_some() {
            // Funnel semantics: no denominator value means no exposure to
            // the denominator stage at all.
            sql += "\nWHERE d.value != 0";
        } else if p.metric.ignore_nulls {
            sql += "\nWHERE m.value != 0";
        }
        sql += &format!("\nGROUP BY\n  m.variation,\n  {}", dimension_expr);
        sql
    }
}

/// Alias-qualified conversion window source, by stage priority:
/// denominator users, then activated users, then raw exposures.
fn conversion_base(col: &str, has_denominator: bool, has_activation: bool) -> String {
    if has_denominator {
        return format!("du.{}", col);
    }
    if has_activation {
        return format!("a.{}", col);
    }
    format!("e.{}", col)
}

struct ExperimentCteParams<'a> {
    settings: &'a ExperimentSnapshotSettings,
    base_id_type: &'a str,
    start_date: DateTime<Utc>,
    end_date: Option<DateTime<Utc>>,
    conversion_window_hours: f64,
    conversion_delay_hours: f64,
    experiment_dimension: Option<&'a str>,
    is_regression_adjusted: bool,
    regression_adjustment_hours: f64,
    min_metric_delay: f64,
    ignore_conversion_end: bool,
}

struct DistinctUsersParams<'a> {
    base_id_type: &'a str,
    dimension_col: &'a str,
    dimension: Option<&'a Dimension>,
    segment: bool,
    has_activation: bool,
    has_denominator: bool,
    is_regression_adjusted: bool,
    cumulative_date: bool,
    ignore_conversion_end: bool,
}

struct FinalSelectParams<'a> {
    base_id_type: &'a str,
    metric: &'a MetricDefinition,
    ratio_denominator: Option<&'a MetricDefinition>,
    is_regression_adjusted: bool,
    cumulative_date: bool,
}
