//! Analysis results
//!
//! ## Schema Overview
//!
//! ```text
//! AnalysisReport ──< AnalysisResult (metric × dimension × variation)
//!       │                 ├── EffectEstimate (treatment variations)
//!       │                 └── QuantileEstimate (quantile metrics)
//!       └── HealthReport ──< SrmResult (overall + per dimension value)
//!                      └── MultipleExposureReport
//! ```
//!
//! Every record is an immutable value. Results are kept sorted by
//! (metric id, dimension, variation order) so a report serializes the same
//! way regardless of how cells were scheduled.

mod analysis_result;
mod health_report;

pub use analysis_result::{
    AnalysisResult, AnalysisResultBuilder, CellStatus, Decision, EffectEstimate, Interval,
    QuantileEstimate, Risk,
};
pub use health_report::{HealthReport, MultipleExposureReport, SrmResult, SrmVerdict};

use crate::config::OVERALL_DIMENSION;
use serde::{Deserialize, Serialize};

/// Dimension slice a result belongs to
///
/// The overall population is `All`/`All`; sorting puts it before any
/// breakdown whose name sorts after `All`.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct DimensionKey {
    /// Dimension display name
    pub name: String,
    /// Dimension value
    pub value: String,
}

impl DimensionKey {
    /// Create a dimension key
    #[must_use]
    pub fn new(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            value: value.into(),
        }
    }

    /// The overall population
    #[must_use]
    pub fn overall() -> Self {
        Self::new(OVERALL_DIMENSION, OVERALL_DIMENSION)
    }

    /// Check if this is the overall population.
    #[must_use]
    pub fn is_overall(&self) -> bool {
        self.name == OVERALL_DIMENSION
    }
}

impl std::fmt::Display for DimensionKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}={}", self.name, self.value)
    }
}

/// Complete output of one analysis run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnalysisReport {
    experiment_id: String,
    results: Vec<AnalysisResult>,
    health: HealthReport,
}

impl AnalysisReport {
    /// Create a report. `results` must already be in engine order.
    #[must_use]
    pub fn new(experiment_id: impl Into<String>, results: Vec<AnalysisResult>, health: HealthReport) -> Self {
        Self {
            experiment_id: experiment_id.into(),
            results,
            health,
        }
    }

    /// Get the experiment ID.
    #[must_use]
    pub fn experiment_id(&self) -> &str {
        &self.experiment_id
    }

    /// All result cells.
    #[must_use]
    pub fn results(&self) -> &[AnalysisResult] {
        &self.results
    }

    /// Health diagnostics.
    #[must_use]
    pub const fn health(&self) -> &HealthReport {
        &self.health
    }

    /// Get the number of result cells.
    #[must_use]
    pub fn len(&self) -> usize {
        self.results.len()
    }

    /// Check if the report has no result cells.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.results.is_empty()
    }

    /// Look up one cell.
    #[must_use]
    pub fn get(&self, metric_id: &str, variation_id: &str, dimension: &DimensionKey) -> Option<&AnalysisResult> {
        self.results.iter().find(|r| {
            r.metric_id() == metric_id && r.variation_id() == variation_id && r.dimension() == dimension
        })
    }

    /// Overall-population cell for a metric and variation.
    #[must_use]
    pub fn overall(&self, metric_id: &str, variation_id: &str) -> Option<&AnalysisResult> {
        self.get(metric_id, variation_id, &DimensionKey::overall())
    }

    /// All cells of a metric.
    pub fn for_metric<'a>(&'a self, metric_id: &'a str) -> impl Iterator<Item = &'a AnalysisResult> + 'a {
        self.results.iter().filter(move |r| r.metric_id() == metric_id)
    }
}
