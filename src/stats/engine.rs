//! Per-cell evaluation
//!
//! A cell is one (metric, dimension, variation). Cells share nothing, so
//! they are evaluated in parallel when the `rayon` feature is on; the
//! output order is the cell order either way.

use super::frequentist::{self, Difference};
use super::moments::{covariance, cuped_adjust, ArmEstimate, CupedArm, Moments};
use super::bayesian;
use crate::config::{AnalysisInput, EngineKind, MetricDefinition, MetricKind, Variation};
use crate::dialect::DialectId;
use crate::results::{AnalysisResult, CellStatus, DimensionKey, QuantileEstimate};
use crate::warehouse::AggregateRow;
use crate::{Error, Result};
use std::collections::{BTreeSet, HashMap};
use tracing::warn;

#[cfg(feature = "rayon")]
use rayon::prelude::*;

/// Why a cell stopped short of an estimate
enum Skip {
    Insufficient(String),
    Failed(Error),
}

impl From<Error> for Skip {
    fn from(e: Error) -> Self {
        Self::Failed(e)
    }
}

type CellResult<T> = std::result::Result<T, Skip>;

fn insufficient<T>(reason: impl Into<String>) -> CellResult<T> {
    Err(Skip::Insufficient(reason.into()))
}

/// Estimate of one arm before comparison
struct Arm {
    units: u64,
    estimate: ArmEstimate,
    quantile: Option<QuantileEstimate>,
    cuped: Option<CupedArm>,
}

struct Cell<'a> {
    metric: &'a MetricDefinition,
    dimension: DimensionKey,
    variation: &'a Variation,
    baseline: bool,
}

type RowIndex<'a> = HashMap<(&'a str, &'a DimensionKey, &'a str), &'a AggregateRow>;

/// Turns aggregate rows into result cells
#[derive(Debug)]
pub struct StatsEngine<'a> {
    input: &'a AnalysisInput,
    rank_error: f64,
}

impl<'a> StatsEngine<'a> {
    /// Engine for an input whose rows come from `dialect`
    #[must_use]
    pub fn new(input: &'a AnalysisInput, dialect: DialectId) -> Self {
        Self {
            input,
            rank_error: dialect.capabilities().approx_quantile_rank_error,
        }
    }

    /// Evaluate every cell
    ///
    /// Each metric gets the overall dimension plus every dimension value
    /// present in its rows, and one cell per variation in experiment order.
    #[must_use]
    pub fn analyze(&self, rows: &[AggregateRow]) -> Vec<AnalysisResult> {
        let index: RowIndex<'_> = rows
            .iter()
            .map(|r| ((r.metric_id.as_str(), &r.dimension, r.variation.as_str()), r))
            .collect();

        let overall = DimensionKey::overall();
        let mut cells = Vec::new();
        for metric in &self.input.metrics {
            let mut dimensions: BTreeSet<&DimensionKey> =
                rows.iter().filter(|r| r.metric_id == metric.id).map(|r| &r.dimension).collect();
            dimensions.insert(&overall);
            for dimension in dimensions {
                for (i, variation) in self.input.experiment.variations.iter().enumerate() {
                    cells.push(Cell {
                        metric,
                        dimension: dimension.clone(),
                        variation,
                        baseline: i == 0,
                    });
                }
            }
        }

        #[cfg(feature = "rayon")]
        let results = cells.par_iter().map(|cell| self.evaluate(cell, &index)).collect();
        #[cfg(not(feature = "rayon"))]
        let results = cells.iter().map(|cell| self.evaluate(cell, &index)).collect();
        results
    }

    fn evaluate(&self, cell: &Cell<'_>, index: &RowIndex<'_>) -> AnalysisResult {
        let builder = || {
            AnalysisResult::builder(
                &cell.metric.id,
                &cell.variation.id,
                cell.dimension.clone(),
                self.input.settings.engine,
            )
            .baseline(cell.baseline)
        };
        match self.compute(cell, index) {
            Ok(result) => result,
            Err(Skip::Insufficient(reason)) => {
                let units = index
                    .get(&(cell.metric.id.as_str(), &cell.dimension, cell.variation.id.as_str()))
                    .map_or(0, |r| r.units);
                builder().sample_size(units).status(CellStatus::insufficient(reason)).build()
            }
            Err(Skip::Failed(e)) => {
                warn!(
                    metric = %cell.metric.id,
                    variation = %cell.variation.id,
                    dimension = %cell.dimension,
                    error = %e,
                    "result cell failed"
                );
                builder().status(CellStatus::Error { message: e.to_string() }).build()
            }
        }
    }

    fn compute(&self, cell: &Cell<'_>, index: &RowIndex<'_>) -> CellResult<AnalysisResult> {
        let settings = &self.input.settings;
        let metric = cell.metric;
        let lookup = |variation: &str| index.get(&(metric.id.as_str(), &cell.dimension, variation)).copied();

        let Some(row) = lookup(&cell.variation.id) else {
            return insufficient("no units");
        };
        let own = self.arm(metric, row)?;
        let mut builder = AnalysisResult::builder(&metric.id, &cell.variation.id, cell.dimension.clone(), settings.engine)
            .baseline(cell.baseline)
            .sample_size(own.units)
            .point_estimate(own.estimate.estimate);
        if let Some(quantile) = own.quantile {
            builder = builder.quantile(quantile);
        }

        let min = settings.min_sample_size;
        if cell.baseline {
            if own.units < min {
                builder = builder.status(CellStatus::insufficient(format!("fewer than {min} units")));
            }
            return Ok(builder.build());
        }

        let baseline_id = self
            .input
            .experiment
            .baseline()
            .map(|v| v.id.as_str())
            .ok_or_else(|| Error::StatisticalComputation("experiment has no baseline".to_string()))?;
        let Some(baseline_row) = lookup(baseline_id) else {
            return insufficient("baseline has no units");
        };
        if own.units < min || baseline_row.units < min {
            return insufficient(format!("fewer than {min} units in an arm"));
        }
        let control = self.arm(metric, baseline_row)?;

        let (c, t, cuped_applied) = match (&control.cuped, &own.cuped) {
            (Some(cc), Some(tc)) => match cuped_adjust(cc, tc, (control.units, own.units)) {
                Some((c, t)) => (c, t, true),
                None => (control.estimate, own.estimate, false),
            },
            _ => (control.estimate, own.estimate, false),
        };
        if !(c.is_finite() && t.is_finite()) {
            return insufficient("estimate is not finite");
        }
        if c.variance <= 0.0 || t.variance <= 0.0 {
            return insufficient("zero variance");
        }
        let Some(diff) = Difference::between(&c, &t) else {
            return insufficient("baseline estimate is zero");
        };
        if !(diff.relative_standard_error > 0.0 && diff.absolute_standard_error > 0.0) {
            return insufficient("zero variance");
        }

        let mut effect = match settings.engine {
            EngineKind::Frequentist => frequentist::estimate(
                &diff,
                settings.alpha,
                settings.sequential.as_ref(),
                control.units + own.units,
                metric.inverse,
            ),
            EngineKind::Bayesian => bayesian::estimate(&diff, settings, metric.inverse),
        };
        effect.cuped_applied = cuped_applied;
        Ok(builder.effect(effect).build())
    }

    fn arm(&self, metric: &MetricDefinition, row: &AggregateRow) -> CellResult<Arm> {
        let units = row.units;
        if units < 2 {
            return insufficient("fewer than 2 units");
        }
        match metric.kind {
            MetricKind::Ratio => {
                let sums = row.ratio.ok_or_else(|| {
                    Error::StatisticalComputation(format!("ratio metric '{}' has no denominator sums", metric.id))
                })?;
                if sums.denominator_sum == 0.0 {
                    return insufficient("zero denominator");
                }
                let (Some(numerator), Some(denominator)) = (
                    Moments::from_sums(units, row.main_sum, row.main_sum_squares),
                    Moments::from_sums(units, sums.denominator_sum, sums.denominator_sum_squares),
                ) else {
                    return insufficient("estimate is not finite");
                };
                let cov = covariance(numerator.n, row.main_sum, sums.denominator_sum, sums.main_denominator_sum_product);
                let Some(estimate) = ArmEstimate::ratio(&numerator, &denominator, cov, units) else {
                    return insufficient("zero denominator");
                };
                Ok(Arm { units, estimate, quantile: None, cuped: None })
            }
            MetricKind::Quantile => {
                let spec = metric.quantile.ok_or_else(|| {
                    Error::StatisticalComputation(format!("quantile metric '{}' has no level", metric.id))
                })?;
                let Some(summary) = &row.quantile else {
                    return insufficient("no quantile summary");
                };
                let Some(sample) = summary.estimate(
                    spec.q,
                    self.input.settings.quantile.density_bandwidth,
                    self.rank_error,
                    units,
                ) else {
                    return insufficient("quantile could not be estimated");
                };
                Ok(Arm {
                    units,
                    estimate: ArmEstimate {
                        units,
                        estimate: sample.value,
                        variance: sample.standard_error * sample.standard_error,
                    },
                    quantile: Some(QuantileEstimate {
                        q: spec.q,
                        value: sample.value,
                        error_bound: sample.error_bound,
                        standard_error: sample.standard_error,
                    }),
                    cuped: None,
                })
            }
            MetricKind::Count | MetricKind::Sum | MetricKind::Binary | MetricKind::Duration => {
                let Some(outcome) = Moments::from_sums(units, row.main_sum, row.main_sum_squares) else {
                    return insufficient("estimate is not finite");
                };
                let cuped = match (metric.covariate, row.covariate) {
                    (Some(_), Some(sums)) => Moments::from_sums(units, sums.covariate_sum, sums.covariate_sum_squares)
                        .map(|covariate| CupedArm {
                            outcome,
                            covariate,
                            covariate_sum: sums.covariate_sum,
                            covariance: covariance(
                                outcome.n,
                                row.main_sum,
                                sums.covariate_sum,
                                sums.main_covariate_sum_product,
                            ),
                        }),
                    _ => None,
                };
                Ok(Arm {
                    units,
                    estimate: ArmEstimate::mean(&outcome, units),
                    quantile: None,
                    cuped,
                })
            }
        }
    }
}

/// Evaluate rows for `input` with the engine's defaults
///
/// # Errors
///
/// Returns [`Error::ConfigValidation`] when the input has no baseline
/// variation; per-cell failures are reported inside the results
pub fn analyze(input: &AnalysisInput, dialect: DialectId, rows: &[AggregateRow]) -> Result<Vec<AnalysisResult>> {
    if input.experiment.baseline().is_none() {
        return Err(Error::config(format!("experiment '{}'", input.experiment.id), "no variations"));
    }
    Ok(StatsEngine::new(input, dialect).analyze(rows))
}
