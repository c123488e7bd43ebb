//! Identifier-space election and bridge CTEs in compiled queries.

use chrono::{TimeZone, Utc};
use serde_json::json;

use uplift::compile::{ExperimentMetricQueryParams, QueryCompiler};
use uplift::model::{DataSourceSettings, ExperimentSnapshotSettings, MetricDefinition};
use uplift::{CompileError, Dialect};

fn assert_sql_contains(sql: &str, needle: &str) {
    let squish = |s: &str| s.chars().filter(|c| !c.is_whitespace()).collect::<String>();
    assert!(
        squish(sql).contains(&squish(needle)),
        "expected SQL to contain {:?}, got:\n{}",
        needle,
        sql
    );
}

fn settings() -> ExperimentSnapshotSettings {
    serde_json::from_value(json!({
        "experimentId": "exp_bridge",
        "startDate": "2024-01-01T00:00:00Z",
        "endDate": "2024-01-15T00:00:00Z",
        "exposureQueryId": "user_id",
        "metricSettings": []
    }))
    .unwrap()
}

fn metric_on(id_space: &str) -> MetricDefinition {
    serde_json::from_value(json!({
        "id": "met_taps",
        "name": "Taps",
        "type": "count",
        "sql": format!("SELECT {}, timestamp, value FROM taps", id_space),
        "userIdTypes": [id_space],
        "conversionWindowHours": 24.0
    }))
    .unwrap()
}

fn datasource(value: serde_json::Value) -> DataSourceSettings {
    serde_json::from_value(value).unwrap()
}

fn params<'a>(
    metric: &'a MetricDefinition,
    settings: &'a ExperimentSnapshotSettings,
) -> ExperimentMetricQueryParams<'a> {
    ExperimentMetricQueryParams {
        metric,
        activation_metrics: &[],
        denominator_metrics: &[],
        settings,
        segment: None,
        dimension: None,
        now: Utc.with_ymd_and_hms(2024, 6, 1, 0, 0, 0).unwrap(),
    }
}

#[test]
fn test_declared_identity_join_bridges_metric() {
    let ds = datasource(json!({
        "queries": {
            "exposure": [{
                "id": "user_id",
                "name": "Exposures",
                "query": "SELECT user_id, experiment_id, variation_id, timestamp FROM exposures",
                "userIdType": "user_id"
            }],
            "identityJoins": [{
                "ids": ["user_id", "device_id"],
                "query": "SELECT user_id, device_id FROM devices"
            }]
        }
    }));
    let metric = metric_on("device_id");
    let settings = settings();

    let sql = QueryCompiler::new(Dialect::Ansi, &ds)
        .experiment_metric_query(&params(&metric, &settings))
        .unwrap();

    // The exposure query keys everything on user_id, so the metric's
    // device_id rows go through a shared bridge CTE.
    assert_sql_contains(&sql, "__identities0 as (");
    assert_sql_contains(&sql, "SELECT user_id, device_id FROM devices");
    assert_sql_contains(&sql, "GROUP BY\n  user_id, device_id");
    assert_sql_contains(&sql, "JOIN __identities0 i ON (i.device_id = m.device_id)");
    assert_sql_contains(&sql, "i.user_id as user_id");
}

#[test]
fn test_pageviews_fallback_bridges_anonymous_id() {
    let ds = datasource(json!({
        "queries": {
            "exposure": [{
                "id": "user_id",
                "name": "Exposures",
                "query": "SELECT user_id, experiment_id, variation_id, timestamp FROM exposures",
                "userIdType": "user_id"
            }],
            "pageviewsQuery": "SELECT user_id, anonymous_id, timestamp FROM pageviews"
        }
    }));
    let metric = metric_on("anonymous_id");
    let settings = settings();

    let sql = QueryCompiler::new(Dialect::Ansi, &ds)
        .experiment_metric_query(&params(&metric, &settings))
        .unwrap();

    assert_sql_contains(&sql, "__identities0 as (");
    assert_sql_contains(&sql, "FROM pageviews");
    // The fallback bridge is bounded to the analysis date range.
    assert_sql_contains(&sql, "i.timestamp >= '2024-01-01 00:00:00'");
    assert_sql_contains(&sql, "GROUP BY\n  user_id, anonymous_id");
}

#[test]
fn test_pageviews_fallback_only_covers_builtin_spaces() {
    // pageviews only bridges user_id and anonymous_id, so a device_id
    // metric still fails without a declared identity join.
    let ds = datasource(json!({
        "queries": {
            "exposure": [{
                "id": "user_id",
                "name": "Exposures",
                "query": "SELECT user_id, experiment_id, variation_id, timestamp FROM exposures",
                "userIdType": "user_id"
            }],
            "pageviewsQuery": "SELECT user_id, anonymous_id, timestamp FROM pageviews"
        }
    }));
    let metric = metric_on("device_id");
    let settings = settings();

    let err = QueryCompiler::new(Dialect::Ansi, &ds)
        .experiment_metric_query(&params(&metric, &settings))
        .unwrap_err();
    assert!(matches!(
        err,
        CompileError::MissingIdentityJoin { ref left, ref right }
            if left == "user_id" && right == "device_id"
    ));
}

#[test]
fn test_shared_space_needs_no_bridge() {
    let ds = datasource(json!({
        "queries": {
            "exposure": [{
                "id": "user_id",
                "name": "Exposures",
                "query": "SELECT user_id, experiment_id, variation_id, timestamp FROM exposures",
                "userIdType": "user_id"
            }]
        }
    }));
    let metric = metric_on("user_id");
    let settings = settings();

    let sql = QueryCompiler::new(Dialect::Ansi, &ds)
        .experiment_metric_query(&params(&metric, &settings))
        .unwrap();
    assert!(!sql.contains("__identities"));
}

#[test]
fn test_trivial_identity_join_query_is_ignored() {
    // A degenerate placeholder query can't bridge anything.
    let ds = datasource(json!({
        "queries": {
            "exposure": [{
                "id": "user_id",
                "name": "Exposures",
                "query": "SELECT user_id, experiment_id, variation_id, timestamp FROM exposures",
                "userIdType": "user_id"
            }],
            "identityJoins": [{
                "ids": ["user_id", "device_id"],
                "query": "SELECT"
            }]
        }
    }));
    let metric = metric_on("device_id");
    let settings = settings();

    let err = QueryCompiler::new(Dialect::Ansi, &ds)
        .experiment_metric_query(&params(&metric, &settings))
        .unwrap_err();
    assert!(matches!(err, CompileError::MissingIdentityJoin { .. }));
}
