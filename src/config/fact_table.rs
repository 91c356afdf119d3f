//! Fact table definitions - event-level source relations

use crate::dialect::DialectCapabilities;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Source relation of a fact table, exposure source or identity mapping
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Relation {
    /// Table or view name, optionally schema-qualified
    Table(String),
    /// A single `SELECT` statement
    Query(String),
}

impl Relation {
    /// Render for use after `FROM`
    #[must_use]
    pub fn render(&self, caps: &DialectCapabilities) -> String {
        match self {
            Self::Table(name) => caps.quote_relation(name),
            Self::Query(sql) => format!("(\n{}\n)", sql.trim().trim_end_matches(';')),
        }
    }
}

/// Semantic type of a fact table column
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ColumnType {
    /// Numeric value usable in sums and quantiles
    Number,
    /// Free text
    String,
    /// Point in time
    Timestamp,
    /// True/false flag
    Boolean,
}

/// Named row-level predicate metrics may opt into
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RowFilter {
    /// Identifier referenced from metric definitions
    pub id: String,
    /// SQL boolean expression over the fact table's columns
    pub sql: String,
}

/// Event-level relation in the warehouse
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FactTableDefinition {
    /// Unique identifier
    pub id: String,
    /// Where the rows come from
    pub source: Relation,
    /// Event timestamp column
    pub timestamp_column: String,
    /// Identifier type -> column holding it
    pub id_columns: BTreeMap<String, String>,
    /// Value columns and their semantic types
    #[serde(default)]
    pub columns: BTreeMap<String, ColumnType>,
    /// Row filters available to metrics
    #[serde(default)]
    pub filters: Vec<RowFilter>,
}

impl FactTableDefinition {
    /// Create a fact table with no identifier or value columns yet
    #[must_use]
    pub fn new(id: impl Into<String>, source: Relation, timestamp_column: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            source,
            timestamp_column: timestamp_column.into(),
            id_columns: BTreeMap::new(),
            columns: BTreeMap::new(),
            filters: Vec::new(),
        }
    }

    /// Declare the column holding identifier type `id_type`
    #[must_use]
    pub fn with_id_column(mut self, id_type: impl Into<String>, column: impl Into<String>) -> Self {
        self.id_columns.insert(id_type.into(), column.into());
        self
    }

    /// Declare a value column
    #[must_use]
    pub fn with_column(mut self, column: impl Into<String>, column_type: ColumnType) -> Self {
        self.columns.insert(column.into(), column_type);
        self
    }

    /// Add a named row filter
    #[must_use]
    pub fn with_filter(mut self, id: impl Into<String>, sql: impl Into<String>) -> Self {
        self.filters.push(RowFilter {
            id: id.into(),
            sql: sql.into(),
        });
        self
    }

    /// Look up a filter by id
    #[must_use]
    pub fn filter(&self, id: &str) -> Option<&RowFilter> {
        self.filters.iter().find(|f| f.id == id)
    }
}
