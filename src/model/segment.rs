// src/model/segment.rs
use serde::{Deserialize, Serialize};

/// A named membership SQL fragment keyed on one identifier space.
///
/// The query must select the identifier column and a `date` column
/// marking when each user entered the segment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Segment {
    pub id: String,
    pub name: String,
    pub sql: String,
    #[serde(default)]
    pub user_id_type: Option<String>,
}

impl Segment {
    pub fn user_id_type(&self) -> &str {
        self.user_id_type.as_deref().unwrap_or("user_id")
    }
}

/// A user-dimension SQL fragment: one `value` per identifier.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DimensionDefinition {
    pub id: String,
    pub name: String,
    pub sql: String,
    #[serde(default)]
    pub user_id_type: Option<String>,
}

impl DimensionDefinition {
    pub fn user_id_type(&self) -> &str {
        self.user_id_type.as_deref().unwrap_or("user_id")
    }
}

/// The dimension requested for a query, by kind.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum Dimension {
    /// Arbitrary SQL-derived value per user.
    User { dimension: DimensionDefinition },
    /// Built-in column of the exposure query.
    Experiment { id: String },
    /// Bucket by first exposure day.
    Date,
    /// Bucket by calendar day.
    #[serde(rename = "datedaily")]
    DateDaily,
    /// Bucket by calendar day, including all users exposed on or before it.
    #[serde(rename = "datecumulative")]
    DateCumulative,
    /// Derived from activation-metric membership.
    Activation,
}

impl Dimension {
    /// Whether results are bucketed by a calendar-day series rather than
    /// a per-user dimension value.
    pub fn is_cumulative_date(&self) -> bool {
        matches!(self, Dimension::DateDaily | Dimension::DateCumulative)
    }
}
