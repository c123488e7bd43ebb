//! The execution boundary.
//!
//! The compiler produces SQL text; a [`QueryRunner`] performs the
//! warehouse round-trip and hands back untyped rows. The typed
//! wrappers here pair one compiled query kind with its decoder. The
//! round-trip is the only suspension point in the crate; cancellation
//! and timeouts are the runner implementation's responsibility, and
//! nothing is retried here.

use async_trait::async_trait;
use thiserror::Error;
use tracing::debug;

use crate::decode::{self, MetricValueRow, PastExperimentRow, Row, StatisticRow};

/// Transport or warehouse failure reported by a runner.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("query execution failed: {0}")]
pub struct QueryExecutionError(pub String);

/// Executes finished SQL against one warehouse.
#[async_trait]
pub trait QueryRunner: Send + Sync {
    async fn run_query(&self, sql: &str) -> Result<Vec<Row>, QueryExecutionError>;
}

/// Run a compiled experiment metric query and decode its rows.
pub async fn run_experiment_metric_query<R>(
    runner: &R,
    sql: &str,
) -> Result<Vec<StatisticRow>, QueryExecutionError>
where
    R: QueryRunner + ?Sized,
{
    let rows = runner.run_query(sql).await?;
    debug!(rows = rows.len(), "experiment metric query returned");
    Ok(rows.iter().map(decode::statistic_row).collect())
}

/// Run a compiled metric value query and decode its rows.
pub async fn run_metric_value_query<R>(
    runner: &R,
    sql: &str,
) -> Result<Vec<MetricValueRow>, QueryExecutionError>
where
    R: QueryRunner + ?Sized,
{
    let rows = runner.run_query(sql).await?;
    Ok(rows.iter().map(decode::metric_value_row).collect())
}

/// Run a compiled past-experiments query and decode its rows.
pub async fn run_past_experiments_query<R>(
    runner: &R,
    sql: &str,
) -> Result<Vec<PastExperimentRow>, QueryExecutionError>
where
    R: QueryRunner + ?Sized,
{
    let rows = runner.run_query(sql).await?;
    Ok(rows.iter().map(decode::past_experiment_row).collect())
}

/// Sample rows plus how long the round-trip took.
#[derive(Debug, Clone)]
pub struct TestQueryResult {
    pub results: Vec<Row>,
    pub duration_ms: u64,
}

/// Run a compiled test query, timing the round-trip.
pub async fn run_test_query<R>(runner: &R, sql: &str) -> Result<TestQueryResult, QueryExecutionError>
where
    R: QueryRunner + ?Sized,
{
    let started = std::time::Instant::now();
    let results = runner.run_query(sql).await?;
    Ok(TestQueryResult {
        results,
        duration_ms: started.elapsed().as_millis() as u64,
    })
}
