//! SQL text assembly.
//!
//! This module provides:
//!
//! - [`dialect`] - SQL dialect implementations
//! - [`template`] - variable substitution for user-supplied fragments
//! - [`Cte`] and [`render_query`] - the ordered named-fragment composer
//! - [`format_sql`] - pretty-printing of the composed query
//!
//! Queries are assembled as an explicit ordered list of named CTE
//! fragments plus one final SELECT; each optional feature contributes
//! zero or one fragment. The composer is the single place `WITH`
//! syntax is produced, so emission order always matches dependency
//! order.

pub mod dialect;
pub mod template;

pub use dialect::{Dialect, SqlDialect, TimeUnit};
pub use template::{replace_count_star, replace_sql_vars, SqlVars};

/// One named common-table-expression fragment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Cte {
    pub name: String,
    pub sql: String,
}

impl Cte {
    pub fn new(name: impl Into<String>, sql: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            sql: sql.into(),
        }
    }
}

/// Compose CTE fragments and a final SELECT into one query string.
///
/// Fragments are emitted in the order given; each may reference only
/// fragments before it.
pub fn render_query(ctes: &[Cte], final_select: &str) -> String {
    if ctes.is_empty() {
        return final_select.to_string();
    }

    let mut out = String::from("WITH\n");
    for (i, cte) in ctes.iter().enumerate() {
        if i > 0 {
            out.push_str(",\n");
        }
        out.push_str(&cte.name);
        out.push_str(" as (");
        out.push_str(&cte.sql);
        out.push(')');
    }
    out.push('\n');
    out.push_str(final_select);
    out
}

/// Pretty-print a composed query.
///
/// Purely cosmetic: the input is already valid SQL and the output is
/// what gets handed to the execution collaborator, so this must stay
/// deterministic.
pub fn format_sql(sql: &str) -> String {
    sqlformat::format(
        sql,
        &sqlformat::QueryParams::None,
        sqlformat::FormatOptions::default(),
    )
}
