//! Automatic metric discovery from the warehouse's information schema.
//!
//! Tracked-event tables are listed from the information schema, their
//! columns classified into a metric type, and a metric definition
//! generated for each requested event. The batch is intentionally
//! lossy: a per-event failure (missing table, column fetch error) is
//! logged and skipped rather than failing the whole batch.

use thiserror::Error;
use tracing::debug;
use uuid::Uuid;

use crate::compile::QueryCompiler;
use crate::decode::{self, TableColumn};
use crate::error::{CompileError, CompileResult};
use crate::model::{MetricDefinition, MetricType};
use crate::runner::{QueryExecutionError, QueryRunner};
use crate::sql::dialect::SqlDialect;
use crate::sql::format_sql;

/// One event table a metric should be generated for.
#[derive(Debug, Clone)]
pub struct MetricToCreate {
    /// Event name, which is also the table name.
    pub event: String,
    /// Whether the table carries a `user_id` column alongside
    /// `anonymous_id`.
    pub has_user_id: bool,
}

/// A batch-level discovery failure. Per-event failures never surface
/// here; they are skipped.
#[derive(Debug, Error)]
pub enum DiscoveryError {
    #[error(transparent)]
    Compile(#[from] CompileError),
    #[error(transparent)]
    Execution(#[from] QueryExecutionError),
}

impl QueryCompiler<'_> {
    /// List every table in the warehouse with its column count.
    pub fn information_schema_query(&self) -> String {
        let sql = format!(
            "SELECT\n  table_name as table_name,\n  table_catalog as table_catalog,\n  table_schema as table_schema,\n  count(column_name) as column_count\nFROM\n  {}\nWHERE {}\nGROUP BY table_name, table_schema, table_catalog",
            self.dialect.information_schema_from_clause(),
            self.dialect.information_schema_where_clause(),
        );
        format_sql(&sql)
    }

    /// List the columns of one table.
    pub fn table_columns_query(
        &self,
        database: &str,
        schema: &str,
        table: &str,
    ) -> CompileResult<String> {
        let from = self
            .dialect
            .information_schema_table_from_clause(database, schema)?;
        let sql = format!(
            "SELECT\n  data_type as data_type,\n  column_name as column_name\nFROM\n  {}\nWHERE\n  table_name = '{}'\n  AND table_schema = '{}'\n  AND table_catalog = '{}'",
            from, table, schema, database,
        );
        Ok(format_sql(&sql))
    }

    /// Metric SQL for one event table: identifier columns, the event
    /// timestamp, and a value column matching the classified type.
    pub fn auto_metric_query(
        &self,
        event: &str,
        metric_type: MetricType,
        has_user_id: bool,
    ) -> CompileResult<String> {
        let table = self.dialect.generate_table_name(
            self.database.as_deref(),
            self.schema.as_deref(),
            event,
        )?;

        let user_id_cols = if has_user_id {
            "user_id,\n  anonymous_id,"
        } else {
            "anonymous_id,"
        };
        let value_col = match metric_type {
            MetricType::Revenue => ",\n  revenue as value",
            MetricType::Count => ",\n  count as value",
            _ => "",
        };

        Ok(format!(
            "SELECT\n  {}\n  received_at as timestamp{}\nFROM\n  {}",
            user_id_cols, value_col, table,
        ))
    }
}

/// Classify an event table's columns into a metric type.
///
/// A `revenue` column wins, then a `count` column; a bare event table
/// becomes a binomial did-it-happen metric.
pub fn classify_metric_type(columns: &[TableColumn]) -> MetricType {
    if columns.iter().any(|c| c.column_name == "revenue") {
        MetricType::Revenue
    } else if columns.iter().any(|c| c.column_name == "count") {
        MetricType::Count
    } else {
        MetricType::Binomial
    }
}

fn generated_metric(
    event: &str,
    metric_type: MetricType,
    sql: String,
    has_user_id: bool,
) -> MetricDefinition {
    let mut user_id_types = vec!["anonymous_id".to_string()];
    if has_user_id {
        user_id_types.insert(0, "user_id".to_string());
    }
    MetricDefinition {
        id: format!("met_{}", Uuid::new_v4().simple()),
        name: event.to_string(),
        metric_type,
        sql: Some(sql),
        query_format: None,
        table: None,
        column: None,
        timestamp_column: None,
        user_id_columns: None,
        conditions: vec![],
        user_id_types,
        conversion_window_hours: None,
        conversion_delay_hours: None,
        cap: None,
        aggregation: None,
        ignore_nulls: false,
        regression_adjustment_enabled: false,
        regression_adjustment_days: None,
    }
}

/// Generate metric definitions for a batch of tracked events.
///
/// Fails only when the information schema itself cannot be listed or
/// lists zero tables; anything that goes wrong for one event skips
/// that event.
pub async fn discover_auto_metrics<R>(
    compiler: &QueryCompiler<'_>,
    runner: &R,
    requests: &[MetricToCreate],
) -> Result<Vec<MetricDefinition>, DiscoveryError>
where
    R: QueryRunner + ?Sized,
{
    let rows = runner.run_query(&compiler.information_schema_query()).await?;
    let tables = decode::information_schema_tables(&rows);
    if tables.is_empty() {
        return Err(CompileError::EmptyResult.into());
    }

    let mut metrics = Vec::new();
    for request in requests {
        let Some(table) = tables.iter().find(|t| t.table_name == request.event) else {
            debug!(event = %request.event, "no matching table, skipping metric");
            continue;
        };

        let columns_sql = match compiler.table_columns_query(
            &table.table_catalog,
            &table.table_schema,
            &table.table_name,
        ) {
            Ok(sql) => sql,
            Err(err) => {
                debug!(event = %request.event, error = %err, "skipping metric");
                continue;
            }
        };
        let columns = match runner.run_query(&columns_sql).await {
            Ok(rows) => decode::table_columns(&rows),
            Err(err) => {
                debug!(event = %request.event, error = %err, "skipping metric");
                continue;
            }
        };

        let metric_type = classify_metric_type(&columns);
        match compiler.auto_metric_query(&request.event, metric_type, request.has_user_id) {
            Ok(sql) => {
                metrics.push(generated_metric(
                    &request.event,
                    metric_type,
                    sql,
                    request.has_user_id,
                ));
            }
            Err(err) => {
                debug!(event = %request.event, error = %err, "skipping metric");
            }
        }
    }

    Ok(metrics)
}
