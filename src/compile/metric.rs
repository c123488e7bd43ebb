//! Per-metric SQL fragments: source columns, conversion windows and the
//! per-user aggregation expression.

use std::collections::HashMap;

use chrono::{DateTime, Duration, Utc};

use crate::error::CompileResult;
use crate::model::{MetricDefinition, MetricType, QueryFormat};
use crate::sql::dialect::SqlDialect;
use crate::sql::{replace_count_star, replace_sql_vars, SqlVars};

use super::QueryCompiler;

/// Resolved source columns for one metric, aliased to its CTE scan.
#[derive(Debug, Clone)]
pub(crate) struct MetricColumns {
    pub user_ids: HashMap<String, String>,
    pub timestamp: String,
    pub value: String,
}

pub(crate) fn metric_columns(metric: &MetricDefinition, alias: &str) -> MetricColumns {
    // Raw SQL source: fixed column contract (value, timestamp, one
    // column per declared identifier space).
    if metric.query_format() == QueryFormat::Sql {
        let user_ids = metric
            .user_id_types
            .iter()
            .map(|id| (id.clone(), format!("{}.{}", alias, id)))
            .collect();
        return MetricColumns {
            user_ids,
            timestamp: format!("{}.timestamp", alias),
            value: if metric.metric_type == MetricType::Binomial {
                "1".to_string()
            } else {
                format!("{}.value", alias)
            },
        };
    }

    // Legacy query builder: columns are declared table/column names.
    let mut value_col = metric.column.clone().unwrap_or_else(|| "value".to_string());
    if metric.metric_type == MetricType::Duration && value_col.contains("{alias}") {
        value_col = value_col.replace("{alias}", alias);
    } else {
        value_col = format!("{}.{}", alias, value_col);
    }
    let value = if metric.metric_type != MetricType::Binomial && metric.column.is_some() {
        value_col
    } else {
        "1".to_string()
    };

    let user_ids = metric
        .user_id_types
        .iter()
        .map(|id| {
            let col = metric
                .user_id_columns
                .as_ref()
                .and_then(|m| m.get(id))
                .cloned()
                .unwrap_or_else(|| id.clone());
            (id.clone(), format!("{}.{}", alias, col))
        })
        .collect();

    MetricColumns {
        user_ids,
        timestamp: format!(
            "{}.{}",
            alias,
            metric.timestamp_column.as_deref().unwrap_or("received_at")
        ),
        value,
    }
}

fn cap_value(cap: Option<f64>, value: &str) -> String {
    match cap {
        Some(cap) if cap != 0.0 => format!("LEAST({}, {})", cap, value),
        _ => value.to_string(),
    }
}

/// Whether a custom aggregation is a hardcoded number (e.g. "1").
fn numeric_aggregation(aggregation: &str) -> bool {
    matches!(aggregation.trim().parse::<f64>(), Ok(n) if n != 0.0 && !n.is_nan())
}

/// The per-user aggregate over the joined `value` column.
///
/// Operates on the per-user metric join where `value` is NULL for
/// users with no matching rows in their conversion window, so every
/// branch has to decide how NULLs collapse.
pub(crate) fn aggregate_metric_column(metric: &MetricDefinition) -> String {
    // Binomial metrics don't have a value, so any row converts to 1
    if metric.metric_type == MetricType::Binomial {
        return "MAX(COALESCE(value, 0))".to_string();
    }

    if metric.query_format() == QueryFormat::Sql {
        if let Some(aggregation) = metric.aggregation.as_deref() {
            // A hardcoded number floors the value, with a sentinel low
            // enough that real values always win
            if numeric_aggregation(aggregation) {
                return format!("GREATEST({}, COALESCE(value, -999999))", aggregation);
            }
            // Other custom aggregations pass through, with COUNT(*)
            // rewritten to respect the NULL convention
            return cap_value(metric.cap, &replace_count_star(aggregation, "value"));
        }
        return cap_value(metric.cap, "SUM(COALESCE(value, 0))");
    }

    // Query builder
    match metric.metric_type {
        MetricType::Count if metric.column.is_some() => {
            cap_value(metric.cap, "COUNT(DISTINCT (value))")
        }
        MetricType::Count => cap_value(metric.cap, "COUNT(value)"),
        _ => cap_value(metric.cap, "MAX(COALESCE(value, 0))"),
    }
}

fn shift_hours(date: DateTime<Utc>, hours: f64) -> DateTime<Utc> {
    date + Duration::seconds((hours * 3600.0).round() as i64)
}

/// Most negative cumulative conversion delay across a funnel of metrics.
///
/// Returns zero or a negative number of hours; a negative result widens
/// the raw metric scan backwards past the exposure date.
pub(crate) fn metric_min_delay(metrics: &[&MetricDefinition]) -> f64 {
    let mut running = 0.0;
    let mut min = 0.0;
    for metric in metrics {
        let delay = metric.conversion_delay_hours();
        if delay != 0.0 {
            let total = running + delay;
            if total < min {
                min = total;
            }
            running = total;
        }
    }
    min
}

/// Lower bound of the raw metric scan.
pub(crate) fn metric_start(
    initial: DateTime<Utc>,
    min_delay: f64,
    regression_adjustment_hours: f64,
) -> DateTime<Utc> {
    let mut start = initial;
    if min_delay < 0.0 {
        start = shift_hours(start, min_delay);
    }
    if regression_adjustment_hours > 0.0 {
        start = shift_hours(start, -regression_adjustment_hours);
    }
    start
}

/// Upper bound of the raw metric scan: the initial end pushed out by the
/// worst-case cumulative window+delay across the funnel.
pub(crate) fn metric_end(
    metrics: &[&MetricDefinition],
    initial: Option<DateTime<Utc>>,
    ignore_conversion_end: bool,
) -> Option<DateTime<Utc>> {
    let initial = initial?;
    if ignore_conversion_end {
        return Some(initial);
    }

    let mut running = 0.0;
    let mut max = 0.0;
    for metric in metrics {
        let hours = running + metric.conversion_window_hours() + metric.conversion_delay_hours();
        if hours > max {
            max = hours;
        }
        running = hours;
    }

    if max > 0.0 {
        return Some(shift_hours(initial, max));
    }
    Some(initial)
}

/// Inputs for one metric CTE.
pub(crate) struct MetricCteParams<'a> {
    pub metric: &'a MetricDefinition,
    pub conversion_window_hours: f64,
    pub conversion_delay_hours: f64,
    pub ignore_conversion_end: bool,
    pub base_id_type: &'a str,
    pub id_join_map: &'a HashMap<String, String>,
    pub start_date: DateTime<Utc>,
    pub end_date: Option<DateTime<Utc>>,
    pub experiment_id: Option<&'a str>,
}

impl QueryCompiler<'_> {
    /// One row per raw metric event, keyed on the base id type, with the
    /// conversion window bounds this event would open for a later stage.
    pub(crate) fn metric_cte(&self, p: &MetricCteParams) -> CompileResult<String> {
        let metric = p.metric;
        let format = metric.query_format();
        let cols = metric_columns(metric, "m");

        // Determine the identifier column to select from
        let mut user_id_col = cols
            .user_ids
            .get(p.base_id_type)
            .cloned()
            .unwrap_or_else(|| "user_id".to_string());
        let mut join = String::new();
        if metric.user_id_types.iter().any(|t| t == p.base_id_type) {
            user_id_col = p.base_id_type.to_string();
        } else {
            for id_type in &metric.user_id_types {
                if let Some(table) = p.id_join_map.get(id_type) {
                    user_id_col = format!("i.{}", p.base_id_type);
                    join = format!("JOIN {} i ON (i.{} = m.{})", table, id_type, id_type);
                    break;
                }
            }
        }

        let timestamp_col = self.dialect.cast_user_date_col(&cols.timestamp);

        let mut filters: Vec<String> = Vec::new();
        if format == QueryFormat::Builder {
            for c in &metric.conditions {
                filters.push(format!("m.{} {} '{}'", c.column, c.operator, c.value));
            }
        }
        // Rough date bounds so the warehouse can prune partitions
        filters.push(format!(
            "{} >= {}",
            timestamp_col,
            self.dialect.to_timestamp(&p.start_date)
        ));
        if let Some(end) = p.end_date {
            filters.push(format!("{} <= {}", timestamp_col, self.dialect.to_timestamp(&end)));
        }

        let conversion_end = if p.ignore_conversion_end {
            String::new()
        } else {
            format!(
                ",\n  {} as conversion_end",
                self.dialect.add_hours(
                    &timestamp_col,
                    p.conversion_delay_hours + p.conversion_window_hours
                )
            )
        };

        let source = match format {
            QueryFormat::Sql => {
                let vars = SqlVars {
                    start_date: p.start_date,
                    end_date: p.end_date,
                    experiment_id: p.experiment_id.map(str::to_string),
                };
                format!(
                    "(\n    {}\n  )",
                    replace_sql_vars(metric.sql.as_deref().unwrap_or(""), &vars)?
                )
            }
            QueryFormat::Builder => {
                let table = metric.table.as_deref().unwrap_or("");
                match self.schema.as_deref() {
                    Some(schema) if !table.contains('.') => format!("{}.{}", schema, table),
                    _ => table.to_string(),
                }
            }
        };

        Ok(format!(
            "-- Metric ({name})\nSELECT\n  {user_id} as {base},\n  {value} as value,\n  {ts} as timestamp,\n  {start} as conversion_start{end}\nFROM\n  {source} m\n  {join}\nWHERE {filters}",
            name = metric.name,
            user_id = user_id_col,
            base = p.base_id_type,
            value = cols.value,
            ts = timestamp_col,
            start = self.dialect.add_hours(&timestamp_col, p.conversion_delay_hours),
            end = conversion_end,
            source = source,
            join = join,
            filters = filters.join(" AND "),
        ))
    }
}
