//! Textual variable substitution for user-supplied SQL templates.
//!
//! Templates are opaque text: no parsing or validation happens here,
//! only placeholder replacement. Supported placeholders are
//! `{{startDate}}`, `{{endDate}}` and `{{experimentId}}`, with
//! flexible inner whitespace.

use chrono::{DateTime, Utc};
use once_cell::sync::Lazy;
use regex::{Captures, Regex};

use crate::error::ConfigurationError;

static TEMPLATE_VAR: Lazy<Regex> = Lazy::new(|| Regex::new(r"\{\{\s*(\w+)\s*\}\}").unwrap());
static COUNT_STAR: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?i)count\(\s*\*\s*\)").unwrap());

/// Values available to a template.
#[derive(Debug, Clone)]
pub struct SqlVars {
    pub start_date: DateTime<Utc>,
    pub end_date: Option<DateTime<Utc>>,
    pub experiment_id: Option<String>,
}

/// Format a datetime the way warehouse SQL expects it, without quotes.
pub fn sql_datetime(date: &DateTime<Utc>) -> String {
    date.format("%Y-%m-%d %H:%M:%S").to_string()
}

/// Substitute template placeholders in a user-supplied SQL fragment.
///
/// Referencing a variable with no value available is a configuration
/// error rather than silently emitting broken SQL.
pub fn replace_sql_vars(sql: &str, vars: &SqlVars) -> Result<String, ConfigurationError> {
    let mut missing: Option<String> = None;

    let replaced = TEMPLATE_VAR.replace_all(sql, |caps: &Captures| -> String {
        let name = &caps[1];
        match name {
            "startDate" => sql_datetime(&vars.start_date),
            "endDate" => match &vars.end_date {
                Some(end) => sql_datetime(end),
                None => {
                    missing.get_or_insert_with(|| name.to_string());
                    String::new()
                }
            },
            "experimentId" => match &vars.experiment_id {
                Some(id) => id.clone(),
                None => {
                    missing.get_or_insert_with(|| name.to_string());
                    String::new()
                }
            },
            other => {
                missing.get_or_insert_with(|| other.to_string());
                String::new()
            }
        }
    });

    match missing {
        Some(name) => Err(ConfigurationError::UnknownTemplateVariable(name)),
        None => Ok(replaced.into_owned()),
    }
}

/// Rewrite `COUNT(*)` in a custom aggregation to count the value column,
/// so row counts respect the per-user metric join's NULL convention.
pub fn replace_count_star(aggregation: &str, col: &str) -> String {
    COUNT_STAR
        .replace_all(aggregation, format!("COUNT({})", col).as_str())
        .into_owned()
}
