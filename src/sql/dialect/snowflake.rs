//! Snowflake SQL dialect.
//!
//! Divergences from the ANSI defaults:
//! - `TO_VARCHAR`-based string casts and date formatting
//! - `CAST(.. AS DOUBLE)` float coercion
//! - Uppercased information-schema names
//! - Tables addressed through a database.schema pair

use super::SqlDialect;
use crate::error::ConfigurationError;

/// Snowflake SQL dialect.
#[derive(Debug, Clone, Copy)]
pub struct Snowflake;

impl SqlDialect for Snowflake {
    fn name(&self) -> &'static str {
        "snowflake"
    }

    fn cast_to_string(&self, col: &str) -> String {
        format!("TO_VARCHAR({})", col)
    }

    fn ensure_float(&self, col: &str) -> String {
        format!("CAST({} AS DOUBLE)", col)
    }

    fn format_date(&self, col: &str) -> String {
        format!("TO_VARCHAR({}, 'YYYY-MM-DD')", col)
    }

    fn format_date_time_string(&self, col: &str) -> String {
        format!("TO_VARCHAR({}, 'YYYY-MM-DD HH24:MI:SS.MS')", col)
    }

    fn information_schema_where_clause(&self) -> String {
        "table_schema NOT IN ('INFORMATION_SCHEMA')".to_string()
    }

    fn information_schema_table_from_clause(
        &self,
        database: &str,
        _schema: &str,
    ) -> Result<String, ConfigurationError> {
        Ok(format!("{}.information_schema.columns", database))
    }

    fn generate_table_name(
        &self,
        database: Option<&str>,
        schema: Option<&str>,
        table: &str,
    ) -> Result<String, ConfigurationError> {
        let database = database.ok_or(ConfigurationError::MissingDatabase)?;
        let schema = schema.ok_or(ConfigurationError::MissingSchema)?;
        Ok(format!("{}.{}.{}", database, schema, table))
    }
}
