//! Automatic metric discovery against a scripted warehouse.

use async_trait::async_trait;
use serde_json::{json, Value};

use uplift::discover::{discover_auto_metrics, DiscoveryError, MetricToCreate};
use uplift::error::ConfigurationError;
use uplift::model::{DataSourceSettings, MetricType};
use uplift::runner::{QueryExecutionError, QueryRunner};
use uplift::{CompileError, Dialect, QueryCompiler};

type Row = serde_json::Map<String, Value>;

fn rows(value: Value) -> Vec<Row> {
    match value {
        Value::Array(items) => items
            .into_iter()
            .map(|item| match item {
                Value::Object(map) => map,
                _ => panic!("fixture must be an object"),
            })
            .collect(),
        _ => panic!("fixture must be an array"),
    }
}

/// Answers the information-schema listing, then per-table column
/// queries matched by table name. Tables in `failing` error out.
struct ScriptedWarehouse {
    tables: Vec<Row>,
    columns: Vec<(&'static str, Vec<Row>)>,
    failing: Vec<&'static str>,
}

#[async_trait]
impl QueryRunner for ScriptedWarehouse {
    async fn run_query(&self, sql: &str) -> Result<Vec<Row>, QueryExecutionError> {
        if sql.contains("column_count") {
            return Ok(self.tables.clone());
        }
        for table in &self.failing {
            if sql.contains(&format!("table_name = '{}'", table)) {
                return Err(QueryExecutionError(format!("table {} unavailable", table)));
            }
        }
        for (table, columns) in &self.columns {
            if sql.contains(&format!("table_name = '{}'", table)) {
                return Ok(columns.clone());
            }
        }
        Ok(vec![])
    }
}

fn table_row(name: &str) -> Value {
    json!({
        "table_name": name,
        "table_catalog": "analytics",
        "table_schema": "tracked",
        "column_count": 4
    })
}

fn request(event: &str, has_user_id: bool) -> MetricToCreate {
    MetricToCreate {
        event: event.to_string(),
        has_user_id,
    }
}

#[tokio::test]
async fn test_discover_classifies_and_generates_metrics() {
    let ds = DataSourceSettings::default();
    let compiler = QueryCompiler::new(Dialect::Ansi, &ds).with_schema("tracked");
    let warehouse = ScriptedWarehouse {
        tables: rows(json!([table_row("purchase"), table_row("signup"), table_row("pageview")])),
        columns: vec![
            (
                "purchase",
                rows(json!([
                    { "column_name": "user_id", "data_type": "varchar" },
                    { "column_name": "revenue", "data_type": "numeric" }
                ])),
            ),
            (
                "signup",
                rows(json!([
                    { "column_name": "anonymous_id", "data_type": "varchar" }
                ])),
            ),
        ],
        failing: vec![],
    };

    let metrics = discover_auto_metrics(
        &compiler,
        &warehouse,
        &[request("purchase", true), request("signup", false)],
    )
    .await
    .unwrap();

    assert_eq!(metrics.len(), 2);

    let purchase = &metrics[0];
    assert_eq!(purchase.metric_type, MetricType::Revenue);
    assert_eq!(purchase.name, "purchase");
    assert!(purchase.id.starts_with("met_"));
    assert_eq!(purchase.user_id_types, vec!["user_id", "anonymous_id"]);
    let sql = purchase.sql.as_deref().unwrap();
    assert!(sql.contains("revenue as value"));
    assert!(sql.contains("received_at as timestamp"));
    assert!(sql.contains("FROM\n  tracked.purchase"));

    let signup = &metrics[1];
    assert_eq!(signup.metric_type, MetricType::Binomial);
    assert_eq!(signup.user_id_types, vec!["anonymous_id"]);
    let sql = signup.sql.as_deref().unwrap();
    assert!(!sql.contains("as value"));
    assert!(!sql.contains("user_id,"));

    // Generated ids are unique per metric.
    assert_ne!(purchase.id, signup.id);
}

#[tokio::test]
async fn test_discovery_skips_failed_events() {
    let ds = DataSourceSettings::default();
    let compiler = QueryCompiler::new(Dialect::Ansi, &ds).with_schema("tracked");
    let warehouse = ScriptedWarehouse {
        tables: rows(json!([table_row("purchase"), table_row("broken")])),
        columns: vec![(
            "purchase",
            rows(json!([
                { "column_name": "count", "data_type": "integer" }
            ])),
        )],
        failing: vec!["broken"],
    };

    let metrics = discover_auto_metrics(
        &compiler,
        &warehouse,
        &[
            request("broken", true),
            request("missing_table", true),
            request("purchase", true),
        ],
    )
    .await
    .unwrap();

    // The failing and unknown tables are dropped, not fatal.
    assert_eq!(metrics.len(), 1);
    assert_eq!(metrics[0].name, "purchase");
    assert_eq!(metrics[0].metric_type, MetricType::Count);
    assert!(metrics[0].sql.as_deref().unwrap().contains("count as value"));
}

#[tokio::test]
async fn test_empty_warehouse_is_fatal() {
    let ds = DataSourceSettings::default();
    let compiler = QueryCompiler::new(Dialect::Ansi, &ds);
    let warehouse = ScriptedWarehouse {
        tables: vec![],
        columns: vec![],
        failing: vec![],
    };

    let err = discover_auto_metrics(&compiler, &warehouse, &[request("purchase", true)])
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        DiscoveryError::Compile(CompileError::EmptyResult)
    ));
}

#[test]
fn test_information_schema_query_shapes() {
    let ds = DataSourceSettings::default();

    let ansi = QueryCompiler::new(Dialect::Ansi, &ds).information_schema_query();
    assert!(ansi.contains("information_schema.columns"));
    assert!(ansi.contains("count(column_name) as column_count"));

    let snowflake = QueryCompiler::new(Dialect::Snowflake, &ds).information_schema_query();
    assert!(snowflake.contains("'INFORMATION_SCHEMA'"));
}

#[test]
fn test_table_columns_query_addresses_database() {
    let ds = DataSourceSettings::default();
    let sql = QueryCompiler::new(Dialect::Snowflake, &ds)
        .table_columns_query("analytics", "tracked", "purchase")
        .unwrap();
    assert!(sql.contains("analytics.information_schema.columns"));
    assert!(sql.contains("table_name = 'purchase'"));
    assert!(sql.contains("table_schema = 'tracked'"));
    assert!(sql.contains("table_catalog = 'analytics'"));
}

#[test]
fn test_auto_metric_query_requires_database_on_snowflake() {
    let ds = DataSourceSettings::default();

    let err = QueryCompiler::new(Dialect::Snowflake, &ds)
        .with_schema("tracked")
        .auto_metric_query("purchase", MetricType::Revenue, true)
        .unwrap_err();
    assert!(matches!(
        err,
        CompileError::Configuration(ConfigurationError::MissingDatabase)
    ));

    let sql = QueryCompiler::new(Dialect::Snowflake, &ds)
        .with_database("analytics")
        .with_schema("tracked")
        .auto_metric_query("purchase", MetricType::Revenue, true)
        .unwrap();
    assert!(sql.contains("analytics.tracked.purchase"));
}
