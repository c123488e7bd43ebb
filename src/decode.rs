//! Defensive decoding of warehouse result rows.
//!
//! Warehouse drivers disagree about whether numerics come back as
//! numbers or strings, and about timestamp formats. Decoding therefore
//! never fails: a malformed field degrades to a zero or empty default
//! and the row is kept. Callers that need stricter guarantees validate
//! downstream.

use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// One untyped result row as the execution collaborator hands it back.
pub type Row = serde_json::Map<String, Value>;

/// Statistic family of an experiment metric result row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StatisticType {
    Mean,
    Ratio,
    MeanRa,
}

impl StatisticType {
    /// Tag embedded in the compiled query's final select.
    pub fn as_str(&self) -> &'static str {
        match self {
            StatisticType::Mean => "mean",
            StatisticType::Ratio => "ratio",
            StatisticType::MeanRa => "mean_ra",
        }
    }

    /// The statistic a query's shape produces. Ratio wins over
    /// regression adjustment; the two never combine.
    pub fn for_query(is_ratio: bool, is_regression_adjusted: bool) -> Self {
        if is_ratio {
            StatisticType::Ratio
        } else if is_regression_adjusted {
            StatisticType::MeanRa
        } else {
            StatisticType::Mean
        }
    }
}

/// Denominator sufficient statistics of a ratio result row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DenominatorStatistics {
    pub denominator_metric_type: String,
    pub denominator_sum: f64,
    pub denominator_sum_squares: f64,
    pub main_denominator_sum_product: f64,
}

/// Pre-exposure covariate statistics of a regression-adjusted row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CovariateStatistics {
    pub covariate_metric_type: String,
    pub covariate_sum: f64,
    pub covariate_sum_squares: f64,
    pub main_covariate_sum_product: f64,
}

/// One variation/dimension row of an experiment metric query.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatisticRow {
    pub variation: String,
    pub dimension: String,
    pub users: i64,
    pub statistic_type: String,
    pub main_metric_type: String,
    pub main_sum: f64,
    pub main_sum_squares: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub denominator: Option<DenominatorStatistics>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub covariate: Option<CovariateStatistics>,
}

/// One row of a metric value query; `date` is empty for the overall row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricValueRow {
    pub date: String,
    pub count: f64,
    pub main_sum: f64,
    pub main_sum_squares: f64,
}

/// One discovered experiment variation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PastExperimentRow {
    pub exposure_query: String,
    pub experiment_id: String,
    pub experiment_name: String,
    pub variation_id: String,
    pub variation_name: String,
    pub users: i64,
    pub start_date: String,
    pub end_date: String,
}

/// One table of the warehouse's information schema.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InformationSchemaTable {
    pub table_name: String,
    pub table_catalog: String,
    pub table_schema: String,
    pub column_count: i64,
}

/// One column of a table, from the information schema.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TableColumn {
    pub column_name: String,
    pub data_type: String,
}

fn text(row: &Row, key: &str) -> String {
    match row.get(key) {
        Some(Value::String(s)) => s.clone(),
        Some(Value::Number(n)) => n.to_string(),
        Some(Value::Bool(b)) => b.to_string(),
        _ => String::new(),
    }
}

fn float(row: &Row, key: &str) -> f64 {
    match row.get(key) {
        Some(Value::Number(n)) => n.as_f64().unwrap_or(0.0),
        Some(Value::String(s)) => s.trim().parse().unwrap_or(0.0),
        _ => 0.0,
    }
}

fn int(row: &Row, key: &str) -> i64 {
    match row.get(key) {
        Some(Value::Number(n)) => n
            .as_i64()
            .or_else(|| n.as_f64().map(|f| f as i64))
            .unwrap_or(0),
        // Some drivers return counts as decimal strings ("1234.0")
        Some(Value::String(s)) => {
            let s = s.trim();
            s.parse::<i64>()
                .ok()
                .or_else(|| s.parse::<f64>().ok().map(|f| f as i64))
                .unwrap_or(0)
        }
        _ => 0,
    }
}

/// Tolerant timestamp parse, re-emitted as ISO-8601. Unparseable input
/// degrades to an empty string.
fn date(row: &Row, key: &str) -> String {
    let raw = text(row, key);
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return String::new();
    }
    if let Ok(parsed) = DateTime::parse_from_rfc3339(trimmed) {
        return parsed.with_timezone(&Utc).to_rfc3339();
    }
    // Zoneless driver output, space- or T-separated, with or without
    // fractional seconds. Treated as UTC.
    for format in ["%Y-%m-%d %H:%M:%S%.f", "%Y-%m-%dT%H:%M:%S%.f"] {
        if let Ok(parsed) = NaiveDateTime::parse_from_str(trimmed, format) {
            return parsed.and_utc().to_rfc3339();
        }
    }
    if let Ok(parsed) = NaiveDate::parse_from_str(trimmed, "%Y-%m-%d") {
        return parsed
            .and_hms_opt(0, 0, 0)
            .map(|dt| dt.and_utc().to_rfc3339())
            .unwrap_or_default();
    }
    String::new()
}

/// Decode one experiment metric result row.
pub fn statistic_row(row: &Row) -> StatisticRow {
    let denominator = row
        .get("denominator_metric_type")
        .filter(|v| !v.is_null())
        .map(|_| DenominatorStatistics {
            denominator_metric_type: text(row, "denominator_metric_type"),
            denominator_sum: float(row, "denominator_sum"),
            denominator_sum_squares: float(row, "denominator_sum_squares"),
            main_denominator_sum_product: float(row, "main_denominator_sum_product"),
        });
    let covariate = row
        .get("covariate_metric_type")
        .filter(|v| !v.is_null())
        .map(|_| CovariateStatistics {
            covariate_metric_type: text(row, "covariate_metric_type"),
            covariate_sum: float(row, "covariate_sum"),
            covariate_sum_squares: float(row, "covariate_sum_squares"),
            main_covariate_sum_product: float(row, "main_covariate_sum_product"),
        });

    StatisticRow {
        variation: text(row, "variation"),
        dimension: text(row, "dimension"),
        users: int(row, "users"),
        statistic_type: text(row, "statistic_type"),
        main_metric_type: text(row, "main_metric_type"),
        main_sum: float(row, "main_sum"),
        main_sum_squares: float(row, "main_sum_squares"),
        denominator,
        covariate,
    }
}

/// Decode one metric value result row.
pub fn metric_value_row(row: &Row) -> MetricValueRow {
    MetricValueRow {
        date: date(row, "date"),
        count: float(row, "count"),
        main_sum: float(row, "main_sum"),
        main_sum_squares: float(row, "main_sum_squares"),
    }
}

/// Decode one past-experiment discovery row.
pub fn past_experiment_row(row: &Row) -> PastExperimentRow {
    PastExperimentRow {
        exposure_query: text(row, "exposure_query"),
        experiment_id: text(row, "experiment_id"),
        experiment_name: text(row, "experiment_name"),
        variation_id: text(row, "variation_id"),
        variation_name: text(row, "variation_name"),
        users: int(row, "users"),
        start_date: date(row, "start_date"),
        end_date: date(row, "end_date"),
    }
}

/// Decode the information-schema table listing.
pub fn information_schema_tables(rows: &[Row]) -> Vec<InformationSchemaTable> {
    rows.iter()
        .map(|row| InformationSchemaTable {
            table_name: text(row, "table_name"),
            table_catalog: text(row, "table_catalog"),
            table_schema: text(row, "table_schema"),
            column_count: int(row, "column_count"),
        })
        .collect()
}

/// Decode the column listing of one table.
pub fn table_columns(rows: &[Row]) -> Vec<TableColumn> {
    rows.iter()
        .map(|row| TableColumn {
            column_name: text(row, "column_name"),
            data_type: text(row, "data_type"),
        })
        .collect()
}
