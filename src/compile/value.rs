//! Non-experiment queries: standalone metric values, past-experiment
//! discovery and sample-row validation.

use chrono::{DateTime, Duration, Utc};

use crate::error::CompileResult;
use crate::model::{MetricDefinition, Segment};
use crate::sql::dialect::SqlDialect;
use crate::sql::{format_sql, render_query, replace_sql_vars, Cte, SqlVars};

use super::metric::{aggregate_metric_column, metric_end, metric_min_delay, metric_start, MetricCteParams};
use super::QueryCompiler;

/// Oldest exposure data considered when importing past experiments or
/// sampling a user-supplied query.
pub const IMPORT_LIMIT_DAYS: i64 = 365;

/// Inputs for a standalone metric value query.
#[derive(Debug, Clone)]
pub struct MetricValueQueryParams<'a> {
    /// Label embedded in the query header.
    pub name: &'a str,
    pub metric: &'a MetricDefinition,
    pub segment: Option<&'a Segment>,
    pub from: DateTime<Utc>,
    pub to: DateTime<Utc>,
    /// Also emit one row per day alongside the overall row.
    pub include_by_date: bool,
}

/// Inputs for past-experiment discovery.
#[derive(Debug, Clone)]
pub struct PastExperimentsQueryParams {
    pub from: DateTime<Utc>,
}

impl QueryCompiler<'_> {
    /// Compile the metric value query: overall user count, sum and sum
    /// of squares for one metric over a date range, outside any
    /// experiment.
    pub fn metric_value_query(&self, params: &MetricValueQueryParams<'_>) -> CompileResult<String> {
        let metric = params.metric;

        let identities = self.identities_cte(
            &[
                metric.user_id_types.clone(),
                params
                    .segment
                    .map(|s| vec![s.user_id_type().to_string()])
                    .unwrap_or_default(),
            ],
            params.from,
            Some(params.to),
            None,
            None,
        )?;
        let base = identities.base_id_type.as_str();

        let metric_start_date = metric_start(params.from, metric_min_delay(&[metric]), 0.0);
        let metric_end_date = metric_end(&[metric], Some(params.to), false);

        let aggregate = aggregate_metric_column(metric);

        let mut ctes: Vec<Cte> = identities.ctes.clone();

        if let Some(segment) = params.segment {
            ctes.push(Cte::new(
                "segment",
                self.segment_cte(segment, base, &identities.join_map),
            ));
        }

        ctes.push(Cte::new(
            "__metric",
            self.metric_cte(&MetricCteParams {
                metric,
                conversion_window_hours: 0.0,
                conversion_delay_hours: 0.0,
                ignore_conversion_end: false,
                base_id_type: base,
                id_join_map: &identities.join_map,
                start_date: metric_start_date,
                end_date: metric_end_date,
                experiment_id: None,
            })?,
        ));

        let segment_join = if params.segment.is_some() {
            format!(
                "\n  JOIN segment s ON (s.{base} = m.{base})\nWHERE s.date <= m.timestamp",
                base = base
            )
        } else {
            String::new()
        };

        ctes.push(Cte::new(
            "__userMetric",
            format!(
                "-- Add in the aggregate metric value for each user\nSELECT\n  {agg} as value\nFROM\n  __metric m{segment}\nGROUP BY\n  m.{base}",
                agg = aggregate,
                segment = segment_join,
                base = base,
            ),
        ));
        ctes.push(Cte::new(
            "__overall",
            "SELECT\n  COUNT(*) as count,\n  COALESCE(SUM(value), 0) as main_sum,\n  COALESCE(SUM(POWER(value, 2)), 0) as main_sum_squares\nFROM\n  __userMetric",
        ));

        let final_select = if params.include_by_date {
            ctes.push(Cte::new(
                "__userMetricDates",
                format!(
                    "-- Add in the aggregate metric value for each user\nSELECT\n  {day} as date,\n  {agg} as value\nFROM\n  __metric m{segment}\nGROUP BY\n  {day},\n  m.{base}",
                    day = self.dialect.date_trunc("m.timestamp"),
                    agg = aggregate,
                    segment = segment_join,
                    base = base,
                ),
            ));
            ctes.push(Cte::new(
                "__byDateOverall",
                "SELECT\n  date,\n  COUNT(*) as count,\n  COALESCE(SUM(value), 0) as main_sum,\n  COALESCE(SUM(POWER(value, 2)), 0) as main_sum_squares\nFROM\n  __userMetricDates d\nGROUP BY\n  date",
            ));
            ctes.push(Cte::new(
                "__union",
                "SELECT\n  null as date,\n  o.*\nFROM\n  __overall o\nUNION ALL\nSELECT\n  d.*\nFROM\n  __byDateOverall d",
            ));
            "SELECT\n  *\nFROM\n  __union\nORDER BY\n  date ASC".to_string()
        } else {
            "SELECT\n  o.*\nFROM\n  __overall o".to_string()
        };

        let sql = format!(
            "-- {} - {} Metric\n{}",
            params.name,
            metric.name,
            render_query(&ctes, &final_select)
        );
        Ok(format_sql(&sql))
    }

    /// Compile past-experiment discovery: union all exposure queries,
    /// threshold away trickle traffic and return one row per
    /// experiment/variation with its date range and user count.
    pub fn past_experiments_query(
        &self,
        params: &PastExperimentsQueryParams,
    ) -> CompileResult<String> {
        let vars = SqlVars {
            start_date: params.from,
            end_date: None,
            experiment_id: None,
        };

        let exposure_queries = &self.settings.queries.exposure;
        let mut ctes: Vec<Cte> = Vec::new();

        for (i, q) in exposure_queries.iter().enumerate() {
            let timestamp_col = self.dialect.cast_user_date_col("timestamp");
            let date_col = self.dialect.date_trunc(&timestamp_col);
            let experiment_name = if q.has_name_col {
                "MIN(experiment_name)".to_string()
            } else {
                "experiment_id".to_string()
            };
            let variation_name = if q.has_name_col {
                "MIN(variation_name)".to_string()
            } else {
                self.dialect.cast_to_string("variation_id")
            };
            ctes.push(Cte::new(
                format!("__exposures{}", i),
                format!(
                    "SELECT\n  {query_tag} as exposure_query,\n  experiment_id,\n  {ename} as experiment_name,\n  {vid} as variation_id,\n  {vname} as variation_name,\n  {date} as date,\n  count(distinct {uid}) as users\nFROM\n  (\n    {query}\n  ) e{i}\nWHERE\n  {ts} > {from}\nGROUP BY\n  experiment_id,\n  variation_id,\n  {date}",
                    query_tag = self.dialect.cast_to_string(&format!("'{}'", q.id)),
                    ename = experiment_name,
                    vid = self.dialect.cast_to_string("variation_id"),
                    vname = variation_name,
                    date = date_col,
                    uid = q.user_id_type,
                    query = replace_sql_vars(&q.query, &vars)?,
                    i = i,
                    ts = timestamp_col,
                    from = self.dialect.to_timestamp(&params.from),
                ),
            ));
        }

        ctes.push(Cte::new(
            "__experiments",
            (0..exposure_queries.len())
                .map(|i| format!("SELECT * FROM __exposures{}", i))
                .collect::<Vec<_>>()
                .join("\nUNION ALL\n"),
        ));
        ctes.push(Cte::new(
            "__userThresholds",
            "SELECT\n  exposure_query,\n  experiment_id,\n  MIN(experiment_name) as experiment_name,\n  variation_id,\n  MIN(variation_name) as variation_name,\n  -- It's common for a small number of tracking events to continue coming in\n  -- long after an experiment ends, so limit to days with enough traffic\n  max(users)*0.05 as threshold\nFROM\n  __experiments\nWHERE\n  -- Skip days where a variation got 5 or fewer visitors since it's probably not real traffic\n  users > 5\nGROUP BY\n  exposure_query, experiment_id, variation_id",
        ));
        ctes.push(Cte::new(
            "__variations",
            "SELECT\n  d.exposure_query,\n  d.experiment_id,\n  MIN(d.experiment_name) as experiment_name,\n  d.variation_id,\n  MIN(d.variation_name) as variation_name,\n  MIN(d.date) as start_date,\n  MAX(d.date) as end_date,\n  SUM(d.users) as users\nFROM\n  __experiments d\n  JOIN __userThresholds u ON (\n    d.exposure_query = u.exposure_query\n    AND d.experiment_id = u.experiment_id\n    AND d.variation_id = u.variation_id\n  )\nWHERE\n  d.users > u.threshold\nGROUP BY\n  d.exposure_query, d.experiment_id, d.variation_id",
        ));

        let final_select = format!(
            "SELECT\n  *\nFROM\n  __variations\nWHERE\n  -- Skip experiments at start of date range since it's likely missing data\n  {} > 2\nORDER BY\n  experiment_id ASC, variation_id ASC",
            self.dialect
                .date_diff(&self.dialect.to_timestamp(&params.from), "start_date"),
        );

        let sql = format!(
            "-- Past Experiments\n{}",
            render_query(&ctes, &final_select)
        );
        Ok(format_sql(&sql))
    }

    /// Wrap a user-supplied query so only a handful of recent rows come
    /// back, for validating the query before saving it.
    pub fn test_query(&self, query: &str, now: DateTime<Utc>) -> CompileResult<String> {
        let start_date = now - Duration::days(IMPORT_LIMIT_DAYS);
        let limited = format!(
            "WITH __table as (\n  {}\n)\n{}",
            query,
            self.dialect.select_sample_rows("__table", 5)
        );
        let substituted = replace_sql_vars(
            &limited,
            &SqlVars {
                start_date,
                end_date: None,
                experiment_id: None,
            },
        )?;
        Ok(format_sql(&substituted))
    }
}
