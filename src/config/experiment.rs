//! Experiment specification - variations, assignment source, identity rules

use super::fact_table::Relation;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// One arm of the experiment
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Variation {
    /// Value stored in the exposure source's variation column
    pub id: String,
    /// Intended traffic share (normalized across variations)
    pub weight: f64,
}

/// An identifier type and its priority in canonical id resolution
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IdTypeDecl {
    /// Identifier type name (e.g. `user_id`)
    pub name: String,
    /// Higher wins; equal priorities keep declaration order
    #[serde(default)]
    pub priority: u32,
}

/// Relation linking identifier types (e.g. `anonymous_id` ↔ `user_id`)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IdentityMapping {
    /// Source relation
    pub source: Relation,
    /// Identifier type -> column
    pub id_columns: BTreeMap<String, String>,
}

/// Identity resolution rules
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IdentityConfig {
    /// Declared identifier types
    pub id_types: Vec<IdTypeDecl>,
    /// Optional mapping relation
    #[serde(default)]
    pub mapping: Option<IdentityMapping>,
}

impl IdentityConfig {
    /// Identity config over the given types, first declared = highest priority
    #[must_use]
    pub fn ordered<I, S>(types: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let names: Vec<String> = types.into_iter().map(Into::into).collect();
        let count = u32::try_from(names.len()).unwrap_or(u32::MAX);
        let id_types = names
            .into_iter()
            .zip((0..count).rev())
            .map(|(name, priority)| IdTypeDecl { name, priority })
            .collect();
        Self {
            id_types,
            mapping: None,
        }
    }

    /// Attach a mapping relation
    #[must_use]
    pub fn with_mapping(mut self, mapping: IdentityMapping) -> Self {
        self.mapping = Some(mapping);
        self
    }

    /// Identifier type names, most preferred first
    ///
    /// Stable sort: ties keep their declaration order.
    #[must_use]
    pub fn priority_order(&self) -> Vec<&str> {
        let mut decls: Vec<&IdTypeDecl> = self.id_types.iter().collect();
        decls.sort_by(|a, b| b.priority.cmp(&a.priority));
        decls.into_iter().map(|d| d.name.as_str()).collect()
    }

    /// Whether `name` is a declared identifier type
    #[must_use]
    pub fn declares(&self, name: &str) -> bool {
        self.id_types.iter().any(|d| d.name == name)
    }
}

/// Where exposures (variation assignments) are read from
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AssignmentSource {
    /// Exposure relation
    pub source: Relation,
    /// Exposure timestamp column
    pub timestamp_column: String,
    /// Column holding the variation id
    pub variation_column: String,
    /// Identifier type -> column
    pub id_columns: BTreeMap<String, String>,
}

/// Requested result breakdown
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DimensionSpec {
    /// Value of an exposure source column at the unit's first exposure
    Column {
        /// Display name
        name: String,
        /// Exposure source column
        column: String,
    },
    /// Day of the unit's first exposure
    ExposureDate,
}

impl DimensionSpec {
    /// Display name used as `dimension_name` in results
    #[must_use]
    pub fn name(&self) -> &str {
        match self {
            Self::Column { name, .. } => name,
            Self::ExposureDate => "exposure_date",
        }
    }
}

/// Single-pass or two-phase execution
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionMode {
    /// One query per analysis step, everything computed inline
    SinglePass,
    /// Units materialized once, metrics re-aggregated against them
    Incremental {
        /// Table the units relation is materialized into
        units_table: String,
    },
}

/// Experiment to analyze
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExperimentSpec {
    /// Unique identifier
    pub id: String,
    /// Arms; the first is the baseline
    pub variations: Vec<Variation>,
    /// Exposure source
    pub assignment: AssignmentSource,
    /// Identity resolution rules
    pub identity: IdentityConfig,
    /// Breakdowns in addition to the overall result
    #[serde(default)]
    pub dimensions: Vec<DimensionSpec>,
    /// Analysis window start (inclusive)
    pub start: DateTime<Utc>,
    /// Analysis window end (inclusive)
    pub end: DateTime<Utc>,
    /// Segment id restricting the population
    #[serde(default)]
    pub segment: Option<String>,
    /// Execution mode
    pub mode: ExecutionMode,
}

impl ExperimentSpec {
    /// The baseline variation
    #[must_use]
    pub fn baseline(&self) -> Option<&Variation> {
        self.variations.first()
    }

    /// Look up a variation by id
    #[must_use]
    pub fn variation(&self, id: &str) -> Option<&Variation> {
        self.variations.iter().find(|v| v.id == id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_priority_order_stable_for_ties() {
        let identity = IdentityConfig {
            id_types: vec![
                IdTypeDecl { name: "device_id".into(), priority: 1 },
                IdTypeDecl { name: "user_id".into(), priority: 5 },
                IdTypeDecl { name: "anonymous_id".into(), priority: 1 },
            ],
            mapping: None,
        };
        assert_eq!(identity.priority_order(), vec!["user_id", "device_id", "anonymous_id"]);
    }

    #[test]
    fn test_ordered_assigns_descending_priority() {
        let identity = IdentityConfig::ordered(["user_id", "anonymous_id"]);
        assert_eq!(identity.priority_order(), vec!["user_id", "anonymous_id"]);
        assert!(identity.declares("anonymous_id"));
        assert!(!identity.declares("device_id"));
    }

    #[test]
    fn test_dimension_names() {
        let dim = DimensionSpec::Column {
            name: "browser".into(),
            column: "browser_name".into(),
        };
        assert_eq!(dim.name(), "browser");
        assert_eq!(DimensionSpec::ExposureDate.name(), "exposure_date");
    }
}
