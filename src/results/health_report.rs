//! Health report records

use super::DimensionKey;
use serde::{Deserialize, Serialize};

/// Sample-ratio mismatch verdict
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SrmVerdict {
    /// Observed split consistent with the configured weights
    Ok,
    /// Observed split deviates from the configured weights
    Mismatch,
    /// No units to test
    InsufficientData,
}

/// Chi-square goodness-of-fit test of the traffic split
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SrmResult {
    /// Population tested
    pub dimension: DimensionKey,
    /// Observed units per variation, in experiment order
    pub observed: Vec<u64>,
    /// Expected units per variation under the configured weights
    pub expected: Vec<f64>,
    /// χ² statistic
    pub chi_square: f64,
    /// P(χ²(k − 1) > statistic)
    pub p_value: f64,
    /// Verdict at the configured threshold
    pub verdict: SrmVerdict,
}

/// Units exposed to more than one variation
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct MultipleExposureReport {
    /// Units seen in more than one variation
    pub count: u64,
    /// `count` over all exposed units
    pub ratio: f64,
    /// `ratio` exceeds the configured threshold
    pub warning: bool,
}

/// Experiment health diagnostics
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HealthReport {
    /// SRM over all units
    pub srm: SrmResult,
    /// SRM per dimension value, sorted by dimension
    pub srm_by_dimension: Vec<SrmResult>,
    /// Multiple-exposure diagnostic
    pub multiple_exposures: MultipleExposureReport,
}

impl HealthReport {
    /// Whether any diagnostic calls for attention
    #[must_use]
    pub fn has_warnings(&self) -> bool {
        self.srm.verdict == SrmVerdict::Mismatch || self.multiple_exposures.warning
    }

    /// SRM result for a dimension
    #[must_use]
    pub fn srm_for(&self, dimension: &DimensionKey) -> Option<&SrmResult> {
        if dimension.is_overall() {
            return Some(&self.srm);
        }
        self.srm_by_dimension.iter().find(|s| &s.dimension == dimension)
    }
}
