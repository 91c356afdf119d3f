//! Analysis Result - one (metric, variation, dimension) cell

use super::DimensionKey;
use crate::config::EngineKind;
use serde::{Deserialize, Serialize};

/// Terminal state of a result cell
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "status")]
pub enum CellStatus {
    /// Estimates computed
    Ok,
    /// Not enough data for a meaningful estimate
    InsufficientData {
        /// Why the cell was not estimated
        reason: String,
    },
    /// Computation failed for this cell only
    Error {
        /// Failure description
        message: String,
    },
}

impl CellStatus {
    /// Shorthand for [`CellStatus::InsufficientData`]
    #[must_use]
    pub fn insufficient(reason: impl Into<String>) -> Self {
        Self::InsufficientData { reason: reason.into() }
    }

    /// Check if the cell was estimated.
    #[must_use]
    pub const fn is_ok(&self) -> bool {
        matches!(self, Self::Ok)
    }
}

/// Call made from an effect estimate
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Decision {
    /// Treatment is better than the baseline
    Winning,
    /// Treatment is worse than the baseline
    Losing,
    /// No call
    Inconclusive,
}

impl Decision {
    /// Decision from the direction of a confident effect
    ///
    /// `direction` is `Some(true)` for a confident increase, `Some(false)`
    /// for a confident decrease. Inverse metrics flip the call.
    #[must_use]
    pub const fn from_direction(direction: Option<bool>, inverse: bool) -> Self {
        match direction {
            None => Self::Inconclusive,
            Some(up) => {
                if up != inverse {
                    Self::Winning
                } else {
                    Self::Losing
                }
            }
        }
    }
}

/// Closed interval
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Interval {
    /// Lower bound
    pub lower: f64,
    /// Upper bound
    pub upper: f64,
}

impl Interval {
    /// Interval `center ± halfwidth`
    #[must_use]
    pub fn around(center: f64, halfwidth: f64) -> Self {
        Self {
            lower: center - halfwidth,
            upper: center + halfwidth,
        }
    }

    /// Whether `value` lies inside
    #[must_use]
    pub fn contains(&self, value: f64) -> bool {
        self.lower <= value && value <= self.upper
    }

    /// `upper − lower`
    #[must_use]
    pub fn width(&self) -> f64 {
        self.upper - self.lower
    }

    /// Some(true) above zero, Some(false) below zero, None when straddling
    #[must_use]
    pub fn direction(&self) -> Option<bool> {
        if self.lower > 0.0 {
            Some(true)
        } else if self.upper < 0.0 {
            Some(false)
        } else {
            None
        }
    }

    fn is_finite(&self) -> bool {
        self.lower.is_finite() && self.upper.is_finite()
    }
}

/// Expected loss of shipping each arm (Bayesian engine)
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Risk {
    /// Expected relative loss if the baseline is kept
    pub control: f64,
    /// Expected relative loss if the treatment is shipped
    pub treatment: f64,
}

/// Effect of a treatment variation against the baseline
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EffectEstimate {
    /// Treatment minus baseline
    pub absolute: f64,
    /// Standard error of `absolute`
    pub absolute_standard_error: f64,
    /// Interval for `absolute`
    pub absolute_interval: Interval,
    /// `(treatment − baseline) / baseline`
    pub relative: f64,
    /// Standard error of `relative`
    pub relative_standard_error: f64,
    /// Confidence or credible interval for `relative`
    pub relative_interval: Interval,
    /// Two-sided p-value (frequentist engine)
    pub p_value: Option<f64>,
    /// Probability the treatment is better (Bayesian engine)
    pub chance_to_win: Option<f64>,
    /// Expected loss per arm (Bayesian engine)
    pub risk: Option<Risk>,
    /// Call
    pub decision: Decision,
    /// CUPED adjustment was applied
    pub cuped_applied: bool,
    /// Intervals and p-value are sequentially valid
    pub sequential: bool,
}

impl EffectEstimate {
    /// Whether every numeric field is finite
    #[must_use]
    pub fn is_finite(&self) -> bool {
        let optional = |v: Option<f64>| v.map_or(true, f64::is_finite);
        self.absolute.is_finite()
            && self.absolute_standard_error.is_finite()
            && self.absolute_interval.is_finite()
            && self.relative.is_finite()
            && self.relative_standard_error.is_finite()
            && self.relative_interval.is_finite()
            && optional(self.p_value)
            && optional(self.chance_to_win)
            && self.risk.map_or(true, |r| r.control.is_finite() && r.treatment.is_finite())
    }
}

/// Quantile value with its approximation-error bound
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct QuantileEstimate {
    /// Quantile level
    pub q: f64,
    /// Approximate quantile
    pub value: f64,
    /// Maximum distance from the exact quantile at the sketch's rank
    pub error_bound: f64,
    /// Sampling standard error
    pub standard_error: f64,
}

/// Result for one (metric, variation, dimension) cell.
///
/// Built once by the statistics engine and never mutated. The builder
/// downgrades a cell to [`CellStatus::InsufficientData`] if any reported
/// number is not finite, so `NaN` and infinities never leave the engine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnalysisResult {
    metric_id: String,
    variation_id: String,
    dimension: DimensionKey,
    engine: EngineKind,
    status: CellStatus,
    baseline: bool,
    sample_size: u64,
    point_estimate: Option<f64>,
    effect: Option<EffectEstimate>,
    quantile: Option<QuantileEstimate>,
}

impl AnalysisResult {
    /// Create a builder for a result cell.
    #[must_use]
    pub fn builder(
        metric_id: impl Into<String>,
        variation_id: impl Into<String>,
        dimension: DimensionKey,
        engine: EngineKind,
    ) -> AnalysisResultBuilder {
        AnalysisResultBuilder::new(metric_id, variation_id, dimension, engine)
    }

    /// Get the metric ID.
    #[must_use]
    pub fn metric_id(&self) -> &str {
        &self.metric_id
    }

    /// Get the variation ID.
    #[must_use]
    pub fn variation_id(&self) -> &str {
        &self.variation_id
    }

    /// Get the dimension.
    #[must_use]
    pub const fn dimension(&self) -> &DimensionKey {
        &self.dimension
    }

    /// Get the engine that produced the cell.
    #[must_use]
    pub const fn engine(&self) -> EngineKind {
        self.engine
    }

    /// Get the cell status.
    #[must_use]
    pub const fn status(&self) -> &CellStatus {
        &self.status
    }

    /// Check if this is the baseline variation.
    #[must_use]
    pub const fn is_baseline(&self) -> bool {
        self.baseline
    }

    /// Units in this variation and dimension.
    #[must_use]
    pub const fn sample_size(&self) -> u64 {
        self.sample_size
    }

    /// Variation mean, ratio or quantile.
    #[must_use]
    pub const fn point_estimate(&self) -> Option<f64> {
        self.point_estimate
    }

    /// Effect against the baseline.
    #[must_use]
    pub const fn effect(&self) -> Option<&EffectEstimate> {
        self.effect.as_ref()
    }

    /// Quantile details (quantile metrics only).
    #[must_use]
    pub const fn quantile(&self) -> Option<&QuantileEstimate> {
        self.quantile.as_ref()
    }

    /// Sort key: metric, dimension, variation.
    #[must_use]
    pub fn key(&self) -> (&str, &DimensionKey, &str) {
        (&self.metric_id, &self.dimension, &self.variation_id)
    }
}

/// Builder for `AnalysisResult`.
#[derive(Debug)]
pub struct AnalysisResultBuilder {
    metric_id: String,
    variation_id: String,
    dimension: DimensionKey,
    engine: EngineKind,
    status: CellStatus,
    baseline: bool,
    sample_size: u64,
    point_estimate: Option<f64>,
    effect: Option<EffectEstimate>,
    quantile: Option<QuantileEstimate>,
}

impl AnalysisResultBuilder {
    /// Create a new builder with required fields.
    #[must_use]
    pub fn new(
        metric_id: impl Into<String>,
        variation_id: impl Into<String>,
        dimension: DimensionKey,
        engine: EngineKind,
    ) -> Self {
        Self {
            metric_id: metric_id.into(),
            variation_id: variation_id.into(),
            dimension,
            engine,
            status: CellStatus::Ok,
            baseline: false,
            sample_size: 0,
            point_estimate: None,
            effect: None,
            quantile: None,
        }
    }

    /// Mark as the baseline variation.
    #[must_use]
    pub const fn baseline(mut self, baseline: bool) -> Self {
        self.baseline = baseline;
        self
    }

    /// Set the unit count.
    #[must_use]
    pub const fn sample_size(mut self, n: u64) -> Self {
        self.sample_size = n;
        self
    }

    /// Set the point estimate.
    #[must_use]
    pub const fn point_estimate(mut self, value: f64) -> Self {
        self.point_estimate = Some(value);
        self
    }

    /// Set the effect estimate.
    #[must_use]
    pub fn effect(mut self, effect: EffectEstimate) -> Self {
        self.effect = Some(effect);
        self
    }

    /// Set the quantile details.
    #[must_use]
    pub const fn quantile(mut self, quantile: QuantileEstimate) -> Self {
        self.quantile = Some(quantile);
        self
    }

    /// Set a non-ok status; estimates are dropped on build.
    #[must_use]
    pub fn status(mut self, status: CellStatus) -> Self {
        self.status = status;
        self
    }

    /// Build the `AnalysisResult`.
    #[must_use]
    pub fn build(mut self) -> AnalysisResult {
        let finite = self.point_estimate.map_or(true, f64::is_finite)
            && self.effect.as_ref().map_or(true, EffectEstimate::is_finite)
            && self.quantile.map_or(true, |q| {
                q.value.is_finite() && q.error_bound.is_finite() && q.standard_error.is_finite()
            });
        if self.status.is_ok() && !finite {
            self.status = CellStatus::insufficient("estimate is not finite");
        }
        if !self.status.is_ok() {
            self.effect = None;
            if !finite {
                self.point_estimate = None;
                self.quantile = None;
            }
        }
        AnalysisResult {
            metric_id: self.metric_id,
            variation_id: self.variation_id,
            dimension: self.dimension,
            engine: self.engine,
            status: self.status,
            baseline: self.baseline,
            sample_size: self.sample_size,
            point_estimate: self.point_estimate,
            effect: self.effect,
            quantile: self.quantile,
        }
    }
}
