//! Query fragment builders
//!
//! Pure functions `(configuration, &DialectCapabilities) -> Fragment`. A
//! fragment is one named `SELECT` that may read other fragments by name; the
//! query assembler turns fragments into CTE chains or materialization steps.
//!
//! Identical inputs always yield byte-identical fragments: plan caching and
//! the cross-mode equivalence tests depend on it.
//!
//! ## Fragment graph
//!
//! ```text
//! __segment ─┐
//! __idmap_* ─┼─> __rawExposures ─> __exposureRank ─┐
//!            │                  └> __variationCount ┴> __unitsBase ─> __covariate_* ─> __units
//!            │
//! __units ─────────────┬─> __unitMain ─┬─> __capMain ─> __unitValues ─> (final SELECT)
//! __idmap_* ─> __factMain ┘             │
//! __factDenominator ─> __unitDenominator┘
//! ```

pub(crate) mod aggregation;
pub(crate) mod exposure;
pub(crate) mod identity;
pub(crate) mod metric_value;
pub(crate) mod segment;

pub use aggregation::columns;
pub use exposure::covariate_column;
pub use metric_value::uses_native_quantile;

use crate::config::AnalysisInput;
use crate::dialect::DialectCapabilities;
use crate::query::StepKind;
use crate::Result;
use serde::{Deserialize, Serialize};

/// Variation assigned to units exposed to more than one variation
pub const MULTIPLE_EXPOSURE_VARIATION: &str = "__multiple__";

/// Dimension value substituted for `NULL`
pub const NULL_DIMENSION_VALUE: &str = "__NULL__";

/// Name of the fragment holding one row per unit
pub const UNITS: &str = "__units";

/// A named query fragment
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Fragment {
    /// Relation name other fragments refer to
    pub name: String,
    /// `SELECT` text (no trailing semicolon)
    pub sql: String,
    /// Fragments read by `sql`
    pub depends_on: Vec<String>,
}

impl Fragment {
    /// Create a fragment
    #[must_use]
    pub fn new<I, S>(name: impl Into<String>, sql: impl Into<String>, depends_on: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            name: name.into(),
            sql: sql.into(),
            depends_on: depends_on.into_iter().map(Into::into).collect(),
        }
    }
}

/// One output query: local fragments plus the final `SELECT`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AnalysisQuery {
    /// What the query produces
    pub kind: StepKind,
    /// Fragments private to this query (the units chain is shared)
    pub fragments: Vec<Fragment>,
    /// Final `SELECT`
    pub select: String,
    /// Fragments read by `select`
    pub depends_on: Vec<String>,
    /// Output columns in order
    pub columns: Vec<String>,
}

/// All fragments for one analysis
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlanFragments {
    /// Units chain ending in [`UNITS`]
    pub units: Vec<Fragment>,
    /// Metric and traffic queries
    pub analyses: Vec<AnalysisQuery>,
}

/// Column alias of the `index`-th requested dimension
#[must_use]
pub fn dimension_alias(index: usize) -> String {
    format!("dim_{index}")
}

/// Append `fragment` unless a fragment of the same name is already listed
pub(crate) fn push_fragment(list: &mut Vec<Fragment>, fragment: Fragment) {
    if !list.iter().any(|f| f.name == fragment.name) {
        list.push(fragment);
    }
}

/// Build every fragment for a validated analysis input
///
/// # Errors
///
/// Returns [`crate::Error::ConfigValidation`] when a reference cannot be
/// resolved; callers are expected to validate first.
pub fn build_fragments(input: &AnalysisInput, caps: &DialectCapabilities) -> Result<PlanFragments> {
    let units = exposure::units_chain(input, caps)?;
    let mut analyses = Vec::with_capacity(input.metrics.len() + 1);
    for metric in &input.metrics {
        analyses.push(aggregation::metric_query(input, metric, caps)?);
    }
    analyses.push(aggregation::traffic_query(&input.experiment, caps));
    Ok(PlanFragments { units, analyses })
}
