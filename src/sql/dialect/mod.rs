//! SQL dialect definitions and syntax rules.
//!
//! This module provides a trait-based abstraction for warehouse syntax
//! differences. Each dialect implements `SqlDialect` to handle its
//! specific text forms:
//!
//! - Timestamp literals and date casts
//! - Date truncation and day differences
//! - Interval arithmetic (day/hour/minute)
//! - String/float coercion (`cast(.. as varchar)` vs `TO_VARCHAR`)
//! - Information-schema addressing
//!
//! Every operation is a pure function of its text arguments: no
//! adapter performs I/O or depends on mutable state, so compiled SQL
//! is deterministic and reproducible for retries.
//!
//! # Usage
//!
//! ```ignore
//! use uplift::sql::dialect::{Dialect, SqlDialect};
//!
//! let dialect = Dialect::Snowflake;
//! let cast = dialect.cast_to_string("variation_id"); // TO_VARCHAR(variation_id)
//! ```

mod ansi;
mod snowflake;

pub use ansi::Ansi;
pub use snowflake::Snowflake;

use std::str::FromStr;

use chrono::{DateTime, Utc};

use crate::error::{CompileError, ConfigurationError};
use crate::sql::template::sql_datetime;

/// Interval unit for date arithmetic.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimeUnit {
    Day,
    Hour,
    Minute,
}

impl TimeUnit {
    pub fn as_str(&self) -> &'static str {
        match self {
            TimeUnit::Day => "day",
            TimeUnit::Hour => "hour",
            TimeUnit::Minute => "minute",
        }
    }
}

/// SQL dialect trait - defines how warehouse-specific text is rendered.
///
/// The default implementations follow ANSI-like syntax; adapters
/// override only the operations that diverge.
pub trait SqlDialect: std::fmt::Debug {
    /// Dialect tag for display, logging and pretty-printer selection.
    fn name(&self) -> &'static str;

    // =========================================================================
    // Literals and casts
    // =========================================================================

    /// Format a timestamp literal.
    fn to_timestamp(&self, date: &DateTime<Utc>) -> String {
        format!("'{}'", sql_datetime(date))
    }

    /// Cast a column to a string.
    fn cast_to_string(&self, col: &str) -> String {
        format!("cast({} as varchar)", col)
    }

    /// Cast a column to a date.
    fn cast_to_date(&self, col: &str) -> String {
        format!("CAST({} AS DATE)", col)
    }

    /// Coerce a column to a float where integer division would truncate.
    fn ensure_float(&self, col: &str) -> String {
        col.to_string()
    }

    /// Normalize a user-supplied timestamp column before comparisons.
    ///
    /// Warehouses storing event timestamps as strings override this.
    fn cast_user_date_col(&self, col: &str) -> String {
        col.to_string()
    }

    /// Render a date column as a `YYYY-MM-DD` display string.
    fn format_date(&self, col: &str) -> String {
        col.to_string()
    }

    /// Render a timestamp column as a fixed-width sortable string.
    fn format_date_time_string(&self, col: &str) -> String {
        self.cast_to_string(col)
    }

    /// Today's date as a date-typed expression.
    fn current_date(&self) -> String {
        self.cast_to_date("CURRENT_DATE()")
    }

    // =========================================================================
    // Date arithmetic
    // =========================================================================

    /// Truncate a timestamp to the start of its day.
    fn date_trunc(&self, col: &str) -> String {
        format!("date_trunc('day', {})", col)
    }

    /// Whole-day difference between two date expressions.
    fn date_diff(&self, start_col: &str, end_col: &str) -> String {
        format!("datediff(day, {}, {})", start_col, end_col)
    }

    /// Interval addition/subtraction with an explicit unit.
    fn add_time(&self, col: &str, unit: TimeUnit, sign: &str, amount: i64) -> String {
        format!("{} {} INTERVAL '{} {}s'", col, sign, amount, unit.as_str())
    }

    /// Offset a timestamp column by a (possibly fractional) number of
    /// hours, choosing minutes as the unit when the offset is not close
    /// to a whole hour. Zero offsets return the column unchanged.
    fn add_hours(&self, col: &str, hours: f64) -> String {
        if hours == 0.0 {
            return col.to_string();
        }
        let sign = if hours > 0.0 { "+" } else { "-" };
        let hours = hours.abs();

        let rounded_hours = hours.round() as i64;
        let rounded_minutes = (hours * 60.0).round() as i64;

        let mut unit = TimeUnit::Hour;
        let mut amount = rounded_hours;

        // If not within a few minutes of an even hour, use minutes instead
        if ((rounded_minutes as f64) / 15.0).round() as i64 % 4 > 0 {
            unit = TimeUnit::Minute;
            amount = rounded_minutes;
        }

        if amount == 0 {
            return col.to_string();
        }

        self.add_time(col, unit, sign, amount)
    }

    // =========================================================================
    // Expressions
    // =========================================================================

    /// Conditional expression.
    fn if_else(&self, condition: &str, if_true: &str, if_false: &str) -> String {
        format!(
            "(CASE WHEN {} THEN {} ELSE {} END)",
            condition, if_true, if_false
        )
    }

    // =========================================================================
    // Sampling and information schema
    // =========================================================================

    /// Select a handful of rows for query validation.
    fn select_sample_rows(&self, table: &str, limit: u32) -> String {
        format!("SELECT * FROM {} LIMIT {}", table, limit)
    }

    /// FROM clause listing all columns in the warehouse.
    fn information_schema_from_clause(&self) -> String {
        "information_schema.columns".to_string()
    }

    /// Filter excluding the information schema's own tables.
    fn information_schema_where_clause(&self) -> String {
        "table_schema NOT IN ('information_schema')".to_string()
    }

    /// FROM clause listing columns of one database/schema.
    fn information_schema_table_from_clause(
        &self,
        _database: &str,
        _schema: &str,
    ) -> Result<String, ConfigurationError> {
        Ok("information_schema.columns".to_string())
    }

    /// Fully qualify a table name for generated metric SQL.
    ///
    /// Dialects that address tables through a database/schema pair
    /// override this and fail when the parts are missing.
    fn generate_table_name(
        &self,
        _database: Option<&str>,
        schema: Option<&str>,
        table: &str,
    ) -> Result<String, ConfigurationError> {
        match schema {
            Some(schema) => Ok(format!("{}.{}", schema, table)),
            None => Ok(table.to_string()),
        }
    }
}

/// Supported SQL dialects.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Dialect {
    #[default]
    Ansi,
    Snowflake,
}

impl Dialect {
    /// Get the dialect implementation.
    pub fn dialect(&self) -> &'static dyn SqlDialect {
        match self {
            Dialect::Ansi => &Ansi,
            Dialect::Snowflake => &Snowflake,
        }
    }
}

impl FromStr for Dialect {
    type Err = CompileError;

    /// Resolve a configured dialect tag. Unknown tags fail here, at
    /// formatting time, rather than being silently passed through.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "ansi" => Ok(Dialect::Ansi),
            "snowflake" => Ok(Dialect::Snowflake),
            other => Err(CompileError::UnsupportedDialect(other.to_string())),
        }
    }
}

// Implement SqlDialect for Dialect enum by delegating to concrete types
impl SqlDialect for Dialect {
    fn name(&self) -> &'static str {
        self.dialect().name()
    }

    fn to_timestamp(&self, date: &DateTime<Utc>) -> String {
        self.dialect().to_timestamp(date)
    }

    fn cast_to_string(&self, col: &str) -> String {
        self.dialect().cast_to_string(col)
    }

    fn cast_to_date(&self, col: &str) -> String {
        self.dialect().cast_to_date(col)
    }

    fn ensure_float(&self, col: &str) -> String {
        self.dialect().ensure_float(col)
    }

    fn cast_user_date_col(&self, col: &str) -> String {
        self.dialect().cast_user_date_col(col)
    }

    fn format_date(&self, col: &str) -> String {
        self.dialect().format_date(col)
    }

    fn format_date_time_string(&self, col: &str) -> String {
        self.dialect().format_date_time_string(col)
    }

    fn current_date(&self) -> String {
        self.dialect().current_date()
    }

    fn date_trunc(&self, col: &str) -> String {
        self.dialect().date_trunc(col)
    }

    fn date_diff(&self, start_col: &str, end_col: &str) -> String {
        self.dialect().date_diff(start_col, end_col)
    }

    fn add_time(&self, col: &str, unit: TimeUnit, sign: &str, amount: i64) -> String {
        self.dialect().add_time(col, unit, sign, amount)
    }

    fn add_hours(&self, col: &str, hours: f64) -> String {
        self.dialect().add_hours(col, hours)
    }

    fn if_else(&self, condition: &str, if_true: &str, if_false: &str) -> String {
        self.dialect().if_else(condition, if_true, if_false)
    }

    fn select_sample_rows(&self, table: &str, limit: u32) -> String {
        self.dialect().select_sample_rows(table, limit)
    }

    fn information_schema_from_clause(&self) -> String {
        self.dialect().information_schema_from_clause()
    }

    fn information_schema_where_clause(&self) -> String {
        self.dialect().information_schema_where_clause()
    }

    fn information_schema_table_from_clause(
        &self,
        database: &str,
        schema: &str,
    ) -> Result<String, ConfigurationError> {
        self.dialect()
            .information_schema_table_from_clause(database, schema)
    }

    fn generate_table_name(
        &self,
        database: Option<&str>,
        schema: Option<&str>,
        table: &str,
    ) -> Result<String, ConfigurationError> {
        self.dialect().generate_table_name(database, schema, table)
    }
}

impl std::fmt::Display for Dialect {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.dialect().name())
    }
}
