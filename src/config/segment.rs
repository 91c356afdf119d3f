//! Segment definitions - filters applied before exposure counting

use serde::{Deserialize, Serialize};

/// How segment membership is determined
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SegmentKind {
    /// Boolean expression over the exposure source's columns
    Predicate {
        /// SQL expression
        sql: String,
    },
    /// Units appearing in a fact table (optionally filtered)
    FactTable {
        /// Fact table id
        fact_table: String,
        /// Ids of the fact table's row filters to apply
        #[serde(default)]
        filters: Vec<String>,
    },
}

/// Named population filter
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SegmentDefinition {
    /// Unique identifier
    pub id: String,
    /// Membership rule
    pub kind: SegmentKind,
}

impl SegmentDefinition {
    /// Segment defined by a predicate on exposure rows
    #[must_use]
    pub fn predicate(id: impl Into<String>, sql: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            kind: SegmentKind::Predicate { sql: sql.into() },
        }
    }

    /// Segment defined by presence in a fact table
    #[must_use]
    pub fn fact_table(id: impl Into<String>, fact_table: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            kind: SegmentKind::FactTable {
                fact_table: fact_table.into(),
                filters: Vec::new(),
            },
        }
    }
}
