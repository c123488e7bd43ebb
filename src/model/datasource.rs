// src/model/datasource.rs
use serde::{Deserialize, Serialize};

/// A named warehouse-query template producing one row per exposure event.
///
/// The query text accepts `{{startDate}}`, `{{endDate}}` and
/// `{{experimentId}}` placeholders and must select the columns
/// `experiment_id`, `variation_id`, `timestamp` and the identifier
/// column named by `user_id_type` (plus `experiment_name` /
/// `variation_name` when `has_name_col` is set).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExposureQuery {
    pub id: String,
    pub name: String,
    pub query: String,
    /// The identifier space this query's rows are keyed on.
    pub user_id_type: String,
    /// Whether the query carries human-readable experiment/variation names.
    #[serde(default)]
    pub has_name_col: bool,
    /// Extra columns usable as experiment-kind dimensions.
    #[serde(default)]
    pub dimensions: Vec<String>,
}

/// A bridging query mapping one identifier space to another.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IdentityJoinQuery {
    /// The identifier spaces this query can bridge between.
    pub ids: Vec<String>,
    pub query: String,
}

/// The queries block of a datasource's settings.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DataSourceQueries {
    #[serde(default)]
    pub exposure: Vec<ExposureQuery>,
    #[serde(default)]
    pub identity_joins: Vec<IdentityJoinQuery>,
    /// Built-in `user_id`/`anonymous_id` bridge of last resort.
    #[serde(default)]
    pub pageviews_query: Option<String>,
}

/// Per-organization datasource settings, read-only to the compiler.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DataSourceSettings {
    #[serde(default)]
    pub queries: DataSourceQueries,
}

impl DataSourceSettings {
    /// Look up an exposure query, falling back to the built-in
    /// `anonymous_id` query when none is named.
    pub fn exposure_query(
        &self,
        exposure_query_id: Option<&str>,
    ) -> Result<&ExposureQuery, crate::error::ConfigurationError> {
        let id = match exposure_query_id {
            Some(id) if !id.is_empty() => id,
            _ => "anonymous_id",
        };
        self.queries
            .exposure
            .iter()
            .find(|q| q.id == id)
            .ok_or_else(|| crate::error::ConfigurationError::UnknownExposureQuery(id.to_string()))
    }
}
