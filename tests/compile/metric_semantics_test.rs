//! Aggregation, capping and window semantics of compiled metrics.

use chrono::{TimeZone, Utc};
use serde_json::json;

use uplift::compile::{ExperimentMetricQueryParams, QueryCompiler};
use uplift::model::{DataSourceSettings, ExperimentSnapshotSettings, MetricDefinition};
use uplift::Dialect;

fn assert_sql_contains(sql: &str, needle: &str) {
    let squish = |s: &str| s.chars().filter(|c| !c.is_whitespace()).collect::<String>();
    assert!(
        squish(sql).contains(&squish(needle)),
        "expected SQL to contain {:?}, got:\n{}",
        needle,
        sql
    );
}

fn assert_sql_lacks(sql: &str, needle: &str) {
    let squish = |s: &str| s.chars().filter(|c| !c.is_whitespace()).collect::<String>();
    assert!(
        !squish(sql).contains(&squish(needle)),
        "expected SQL to not contain {:?}, got:\n{}",
        needle,
        sql
    );
}

fn datasource() -> DataSourceSettings {
    serde_json::from_value(json!({
        "queries": {
            "exposure": [{
                "id": "user_id",
                "name": "Exposures",
                "query": "SELECT user_id, experiment_id, variation_id, timestamp FROM exposures",
                "userIdType": "user_id"
            }]
        }
    }))
    .unwrap()
}

fn settings() -> ExperimentSnapshotSettings {
    serde_json::from_value(json!({
        "experimentId": "exp_1",
        "startDate": "2024-01-01T00:00:00Z",
        "endDate": "2024-01-15T00:00:00Z",
        "exposureQueryId": "user_id",
        "metricSettings": []
    }))
    .unwrap()
}

fn metric(value: serde_json::Value) -> MetricDefinition {
    serde_json::from_value(value).unwrap()
}

fn compile(metric: &MetricDefinition) -> String {
    let ds = datasource();
    let settings = settings();
    QueryCompiler::new(Dialect::Ansi, &ds)
        .experiment_metric_query(&ExperimentMetricQueryParams {
            metric,
            activation_metrics: &[],
            denominator_metrics: &[],
            settings: &settings,
            segment: None,
            dimension: None,
            now: Utc.with_ymd_and_hms(2024, 6, 1, 0, 0, 0).unwrap(),
        })
        .unwrap()
}

#[test]
fn test_binomial_any_row_counts_as_one() {
    let sql = compile(&metric(json!({
        "id": "met_signup",
        "name": "Signed Up",
        "type": "binomial",
        "sql": "SELECT user_id, timestamp FROM signups",
        "userIdTypes": ["user_id"]
    })));

    // The raw scan selects a constant and the per-user rollup is a MAX,
    // so users convert at most once.
    assert_sql_contains(&sql, "1 as value");
    assert_sql_contains(&sql, "MAX(COALESCE(value, 0)) as value");
    assert_sql_lacks(&sql, "SUM(COALESCE(value, 0)) as value");
}

#[test]
fn test_sql_metric_default_aggregation_and_cap() {
    let uncapped = compile(&metric(json!({
        "id": "met_rev",
        "name": "Revenue",
        "type": "revenue",
        "sql": "SELECT user_id, timestamp, value FROM purchases",
        "userIdTypes": ["user_id"]
    })));
    assert_sql_contains(&uncapped, "SUM(COALESCE(value, 0)) as value");
    assert_sql_lacks(&uncapped, "LEAST(");

    let capped = compile(&metric(json!({
        "id": "met_rev",
        "name": "Revenue",
        "type": "revenue",
        "sql": "SELECT user_id, timestamp, value FROM purchases",
        "userIdTypes": ["user_id"],
        "cap": 100.0
    })));
    assert_sql_contains(&capped, "LEAST(100, SUM(COALESCE(value, 0))) as value");
}

#[test]
fn test_zero_cap_means_uncapped() {
    let sql = compile(&metric(json!({
        "id": "met_rev",
        "name": "Revenue",
        "type": "revenue",
        "sql": "SELECT user_id, timestamp, value FROM purchases",
        "userIdTypes": ["user_id"],
        "cap": 0.0
    })));
    assert_sql_lacks(&sql, "LEAST(");
}

#[test]
fn test_numeric_aggregation_floors_with_sentinel() {
    let sql = compile(&metric(json!({
        "id": "met_flag",
        "name": "Converted",
        "type": "count",
        "sql": "SELECT user_id, timestamp, value FROM events",
        "userIdTypes": ["user_id"],
        "aggregation": "1",
        "cap": 50.0
    })));

    // Window misses sink to the sentinel; the cap never applies here.
    assert_sql_contains(&sql, "GREATEST(1, COALESCE(value, -999999)) as value");
    assert_sql_lacks(&sql, "LEAST(");
}

#[test]
fn test_custom_aggregation_rewrites_count_star() {
    let sql = compile(&metric(json!({
        "id": "met_evt",
        "name": "Events",
        "type": "count",
        "sql": "SELECT user_id, timestamp, value FROM events",
        "userIdTypes": ["user_id"],
        "aggregation": "COUNT(*) / 2"
    })));
    assert_sql_contains(&sql, "COUNT(value) / 2 as value");
}

#[test]
fn test_builder_count_with_column_is_distinct() {
    let sql = compile(&metric(json!({
        "id": "met_sessions",
        "name": "Sessions",
        "type": "count",
        "table": "sessions",
        "column": "session_id",
        "userIdTypes": ["user_id"]
    })));
    assert_sql_contains(&sql, "COUNT(DISTINCT (value)) as value");
    assert_sql_contains(&sql, "m.session_id as value");
    // No timestamp column declared: the builder convention applies.
    assert_sql_contains(&sql, "m.received_at as timestamp");
}

#[test]
fn test_builder_conditions_precede_date_bounds() {
    let sql = compile(&metric(json!({
        "id": "met_orders",
        "name": "Orders",
        "type": "count",
        "table": "orders",
        "column": "order_id",
        "userIdTypes": ["user_id"],
        "conditions": [
            { "column": "status", "operator": "=", "value": "complete" }
        ]
    })));
    assert_sql_contains(
        &sql,
        "WHERE m.status = 'complete' AND m.received_at >= '2024-01-01 00:00:00'",
    );
}

#[test]
fn test_builder_table_gets_default_schema() {
    let ds = datasource();
    let settings = settings();
    let m = metric(json!({
        "id": "met_orders",
        "name": "Orders",
        "type": "count",
        "table": "orders",
        "column": "order_id",
        "userIdTypes": ["user_id"]
    }));
    let sql = QueryCompiler::new(Dialect::Ansi, &ds)
        .with_schema("analytics")
        .experiment_metric_query(&ExperimentMetricQueryParams {
            metric: &m,
            activation_metrics: &[],
            denominator_metrics: &[],
            settings: &settings,
            segment: None,
            dimension: None,
            now: Utc.with_ymd_and_hms(2024, 6, 1, 0, 0, 0).unwrap(),
        })
        .unwrap();
    assert_sql_contains(&sql, "FROM analytics.orders m");
}

#[test]
fn test_default_conversion_window_is_72_hours() {
    let sql = compile(&metric(json!({
        "id": "met_orders",
        "name": "Orders",
        "type": "count",
        "sql": "SELECT user_id, timestamp, value FROM orders",
        "userIdTypes": ["user_id"]
    })));
    // End date 2024-01-15 plus the 72h default window.
    assert_sql_contains(&sql, "'2024-01-18 00:00:00'");
}

#[test]
fn test_zero_conversion_window_falls_back_to_default() {
    let sql = compile(&metric(json!({
        "id": "met_orders",
        "name": "Orders",
        "type": "count",
        "sql": "SELECT user_id, timestamp, value FROM orders",
        "userIdTypes": ["user_id"],
        "conversionWindowHours": 0.0
    })));
    assert_sql_contains(&sql, "'2024-01-18 00:00:00'");
}

#[test]
fn test_conversion_delay_shifts_window_bounds() {
    let sql = compile(&metric(json!({
        "id": "met_retention",
        "name": "Retained",
        "type": "binomial",
        "sql": "SELECT user_id, timestamp FROM visits",
        "userIdTypes": ["user_id"],
        "conversionDelayHours": 24.0,
        "conversionWindowHours": 24.0
    })));
    // The exposure CTE opens the window after the delay and closes it
    // delay + window later.
    assert_sql_contains(&sql, "+ INTERVAL '24 hours' as conversion_start");
    assert_sql_contains(&sql, "+ INTERVAL '48 hours' as conversion_end");
}

#[test]
fn test_ignore_nulls_filters_zero_users() {
    let sql = compile(&metric(json!({
        "id": "met_rev",
        "name": "Revenue",
        "type": "revenue",
        "sql": "SELECT user_id, timestamp, value FROM purchases",
        "userIdTypes": ["user_id"],
        "ignoreNulls": true
    })));
    assert_sql_contains(&sql, "WHERE m.value != 0");
}

#[test]
fn test_template_variables_in_metric_sql() {
    let sql = compile(&metric(json!({
        "id": "met_orders",
        "name": "Orders",
        "type": "count",
        "sql": "SELECT user_id, timestamp, value FROM orders WHERE created_at >= '{{startDate}}' AND created_at <= '{{endDate}}'",
        "userIdTypes": ["user_id"]
    })));
    // The metric scan bounds, not the experiment dates, feed the template.
    assert_sql_contains(&sql, "created_at >= '2024-01-01 00:00:00'");
    assert_sql_contains(&sql, "created_at <= '2024-01-18 00:00:00'");
}
