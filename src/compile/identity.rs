//! Identity resolution across heterogeneous user-identifier spaces.
//!
//! Every consumer of a query (exposure query, metric, activation and
//! denominator metrics, segment, dimension) declares the identifier
//! spaces it can be joined on. A single "base id type" is elected for
//! the whole query, and a bridging CTE is materialized once per
//! identifier space that cannot reach it directly. Bridges are keyed
//! by identifier-space pair and shared by every consumer needing them,
//! never rebuilt per consumer.

use std::collections::HashMap;

use chrono::{DateTime, Utc};

use crate::error::{CompileError, CompileResult};
use crate::sql::dialect::SqlDialect;
use crate::sql::{replace_sql_vars, Cte, SqlVars};

use super::QueryCompiler;

/// Outcome of base-id-type election.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BaseIdResolution {
    /// The identifier space the final aggregation is keyed on.
    pub base_id_type: String,
    /// Identifier spaces that need a bridge to the base type, in
    /// deterministic first-request order.
    pub joins_required: Vec<String>,
}

/// Elect the base id type and the set of bridges required.
///
/// The space directly usable by the largest number of consumers wins;
/// a caller-forced type takes precedence. Ties break by first-seen
/// order so recompilation is byte-identical. Each consumer that does
/// not support the base type contributes its most widely shared space
/// to the bridge set.
pub fn base_id_type_and_joins(
    objects: &[Vec<String>],
    forced_base_id_type: Option<&str>,
) -> BaseIdResolution {
    let consumers: Vec<&Vec<String>> = objects.iter().filter(|ids| !ids.is_empty()).collect();

    // Count how many consumers can use each id type, preserving
    // first-seen order for deterministic tie-breaking.
    let mut order: Vec<String> = Vec::new();
    let mut counts: HashMap<String, usize> = HashMap::new();
    for ids in &consumers {
        for id in ids.iter() {
            if !counts.contains_key(id) {
                order.push(id.clone());
            }
            *counts.entry(id.clone()).or_insert(0) += 1;
        }
    }

    // Strictly-greater comparison keeps the first-seen space on ties.
    let most_used = |candidates: &[String]| -> Option<String> {
        let mut best: Option<(&String, usize)> = None;
        for c in candidates {
            let n = counts[c.as_str()];
            if best.map_or(true, |(_, m)| n > m) {
                best = Some((c, n));
            }
        }
        best.map(|(c, _)| c.clone())
    };

    let base_id_type = forced_base_id_type
        .map(str::to_string)
        .or_else(|| most_used(&order))
        .unwrap_or_else(|| "user_id".to_string());

    let mut joins_required: Vec<String> = Vec::new();
    for ids in &consumers {
        if ids.contains(&base_id_type) {
            continue;
        }
        // Bridge through the consumer's most widely shared space.
        let best = most_used(ids).expect("consumer sets are non-empty");
        if !joins_required.contains(&best) {
            joins_required.push(best);
        }
    }

    BaseIdResolution {
        base_id_type,
        joins_required,
    }
}

/// Identity bridges for one query: the elected base type, the shared
/// bridge CTEs, and a map from bridged space to CTE name.
#[derive(Debug, Clone)]
pub(crate) struct IdentitiesCte {
    pub base_id_type: String,
    pub join_map: HashMap<String, String>,
    pub ctes: Vec<Cte>,
}

impl QueryCompiler<'_> {
    /// Resolve the base id type and materialize one bridge CTE per
    /// identifier space that cannot reach it.
    pub(crate) fn identities_cte(
        &self,
        objects: &[Vec<String>],
        from: DateTime<Utc>,
        to: Option<DateTime<Utc>>,
        forced_base_id_type: Option<&str>,
        experiment_id: Option<&str>,
    ) -> CompileResult<IdentitiesCte> {
        let resolution = base_id_type_and_joins(objects, forced_base_id_type);

        let mut ctes = Vec::new();
        let mut join_map = HashMap::new();

        for (i, id_type) in resolution.joins_required.iter().enumerate() {
            let table = format!("__identities{}", i);
            let sql = self.identities_query(
                &resolution.base_id_type,
                id_type,
                from,
                to,
                experiment_id,
            )?;
            join_map.insert(id_type.clone(), table.clone());
            ctes.push(Cte::new(table, sql));
        }

        Ok(IdentitiesCte {
            base_id_type: resolution.base_id_type,
            join_map,
            ctes,
        })
    }

    /// Build the bridging query between two identifier spaces: a
    /// declared identity join covering the pair, else the built-in
    /// pageviews `user_id`/`anonymous_id` bridge.
    fn identities_query(
        &self,
        id1: &str,
        id2: &str,
        from: DateTime<Utc>,
        to: Option<DateTime<Utc>>,
        experiment_id: Option<&str>,
    ) -> CompileResult<String> {
        let vars = SqlVars {
            start_date: from,
            end_date: to,
            experiment_id: experiment_id.map(str::to_string),
        };

        for join in &self.settings.queries.identity_joins {
            if join.query.len() > 6
                && join.ids.iter().any(|id| id == id1)
                && join.ids.iter().any(|id| id == id2)
            {
                return Ok(format!(
                    "\nSELECT\n  {id1},\n  {id2}\nFROM\n  (\n    {}\n  ) i\nGROUP BY\n  {id1}, {id2}\n",
                    replace_sql_vars(&join.query, &vars)?,
                ));
            }
        }

        if let Some(pageviews) = &self.settings.queries.pageviews_query {
            let builtin = ["user_id", "anonymous_id"];
            if builtin.contains(&id1) && builtin.contains(&id2) {
                let timestamp_col = self.dialect.cast_user_date_col("i.timestamp");
                let mut bounds = format!("{} >= {}", timestamp_col, self.dialect.to_timestamp(&from));
                if let Some(to) = to {
                    bounds.push_str(&format!(
                        "\n  AND {} <= {}",
                        timestamp_col,
                        self.dialect.to_timestamp(&to)
                    ));
                }
                return Ok(format!(
                    "\nSELECT\n  user_id,\n  anonymous_id\nFROM\n  (\n    {}\n  ) i\nWHERE\n  {}\nGROUP BY\n  user_id, anonymous_id\n",
                    replace_sql_vars(pageviews, &vars)?,
                    bounds,
                ));
            }
        }

        Err(CompileError::MissingIdentityJoin {
            left: id1.to_string(),
            right: id2.to_string(),
        })
    }
}
