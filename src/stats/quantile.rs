//! Mergeable quantile summaries
//!
//! [`LogSketch`] is a log-bucket sketch with relative accuracy α: values in
//! `(γ^(i-1), γ^i]` with `γ = (1 + α) / (1 − α)` share bucket `i` and are
//! represented by `2γ^i / (γ + 1)`, which is within `α·|v|` of every value
//! in the bucket. Buckets are plain counts, so merging is element-wise
//! addition: associative, commutative, and independent of how units were
//! split across partial aggregation batches.
//!
//! The same bucket index is computed in SQL by the aggregation builder
//! (`CEIL(LN(|v|) / LN(γ))`), so warehouse rows feed straight into
//! [`LogSketch::add_bucket`].

use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Log-bucket quantile sketch
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogSketch {
    relative_accuracy: f64,
    positive: BTreeMap<i32, u64>,
    negative: BTreeMap<i32, u64>,
    zero_count: u64,
}

impl LogSketch {
    /// Empty sketch with relative accuracy `alpha` in (0, 1)
    #[must_use]
    pub fn new(relative_accuracy: f64) -> Self {
        Self {
            relative_accuracy,
            positive: BTreeMap::new(),
            negative: BTreeMap::new(),
            zero_count: 0,
        }
    }

    /// Relative accuracy α
    #[must_use]
    pub fn relative_accuracy(&self) -> f64 {
        self.relative_accuracy
    }

    /// Bucket growth factor γ
    #[must_use]
    pub fn gamma(&self) -> f64 {
        (1.0 + self.relative_accuracy) / (1.0 - self.relative_accuracy)
    }

    /// ln γ, the divisor of the SQL bucket expression
    #[must_use]
    pub fn ln_gamma(&self) -> f64 {
        self.gamma().ln()
    }

    /// Bucket index of a non-zero value
    #[must_use]
    pub fn index(&self, value: f64) -> i32 {
        // |ln v| / ln γ stays far inside i32 for finite doubles and α ≥ 1e-6
        #[allow(clippy::cast_possible_truncation)]
        let index = (value.abs().ln() / self.ln_gamma()).ceil() as i32;
        index
    }

    fn representative(&self, index: i32) -> f64 {
        let gamma = self.gamma();
        2.0 * gamma.powi(index) / (gamma + 1.0)
    }

    /// Add one value; non-finite values are ignored
    pub fn add(&mut self, value: f64) {
        if !value.is_finite() {
            return;
        }
        let sign = if value > 0.0 {
            1
        } else if value < 0.0 {
            -1
        } else {
            0
        };
        let index = if sign == 0 { 0 } else { self.index(value) };
        self.add_bucket(sign, index, 1);
    }

    /// Add `count` values to a bucket (`sign` −1, 0 or 1)
    pub fn add_bucket(&mut self, sign: i8, index: i32, count: u64) {
        if count == 0 {
            return;
        }
        match sign.signum() {
            1 => *self.positive.entry(index).or_insert(0) += count,
            -1 => *self.negative.entry(index).or_insert(0) += count,
            _ => self.zero_count += count,
        }
    }

    /// Number of values added
    #[must_use]
    pub fn count(&self) -> u64 {
        self.zero_count + self.positive.values().sum::<u64>() + self.negative.values().sum::<u64>()
    }

    /// Whether no value was added
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.count() == 0
    }

    /// Merge another sketch into this one
    ///
    /// # Errors
    ///
    /// Returns [`Error::StatisticalComputation`] when the sketches were built
    /// with different relative accuracies
    pub fn merge(&mut self, other: &Self) -> Result<()> {
        if (self.relative_accuracy - other.relative_accuracy).abs() > f64::EPSILON {
            return Err(Error::StatisticalComputation(format!(
                "cannot merge sketches with relative accuracy {} and {}",
                self.relative_accuracy, other.relative_accuracy
            )));
        }
        for (&index, &count) in &other.positive {
            *self.positive.entry(index).or_insert(0) += count;
        }
        for (&index, &count) in &other.negative {
            *self.negative.entry(index).or_insert(0) += count;
        }
        self.zero_count += other.zero_count;
        Ok(())
    }

    /// Value at rank `floor(q·(n − 1))` in ascending order
    ///
    /// Within `α·|v|` of the exact value at that rank. `None` when empty.
    #[must_use]
    pub fn quantile(&self, q: f64) -> Option<f64> {
        let n = self.count();
        if n == 0 || !(0.0..=1.0).contains(&q) {
            return None;
        }
        #[allow(
            clippy::cast_precision_loss,
            clippy::cast_possible_truncation,
            clippy::cast_sign_loss
        )]
        let rank = (q * (n - 1) as f64).floor() as u64;

        let mut seen = 0u64;
        // Most negative values live in the highest negative buckets
        for (&index, &count) in self.negative.iter().rev() {
            seen += count;
            if rank < seen {
                return Some(-self.representative(index));
            }
        }
        seen += self.zero_count;
        if rank < seen {
            return Some(0.0);
        }
        for (&index, &count) in &self.positive {
            seen += count;
            if rank < seen {
                return Some(self.representative(index));
            }
        }
        None
    }

    /// Approximation-error bound for a value returned by [`Self::quantile`]
    #[must_use]
    pub fn error_bound(&self, estimate: f64) -> f64 {
        self.relative_accuracy / (1.0 - self.relative_accuracy) * estimate.abs()
    }
}

/// Quantile information returned by the warehouse for one cell
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QuantileSummary {
    /// Mergeable log-bucket sketch
    Sketch(LogSketch),
    /// Point values from the dialect's native quantile function
    Native {
        /// Quantile at `q`
        value: f64,
        /// Quantile at `q − bandwidth`
        lower: f64,
        /// Quantile at `q + bandwidth`
        upper: f64,
    },
}

/// Quantile point estimate with its uncertainty
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct QuantileSample {
    /// Estimated quantile
    pub value: f64,
    /// Bound on the approximation error of `value`
    pub error_bound: f64,
    /// Sampling standard error of `value`
    pub standard_error: f64,
    /// Units summarized
    pub count: u64,
}

impl QuantileSummary {
    /// Merge another partial summary into this one
    ///
    /// # Errors
    ///
    /// Native summaries are point values and cannot be merged
    pub fn merge(&mut self, other: &Self) -> Result<()> {
        match (self, other) {
            (Self::Sketch(a), Self::Sketch(b)) => a.merge(b),
            _ => Err(Error::StatisticalComputation(
                "native quantile summaries cannot be merged across partial batches".to_string(),
            )),
        }
    }

    /// Estimate quantile `q` from `count` units
    ///
    /// The standard error uses the sparsity estimate
    /// `(Q(q + h) − Q(q − h)) / 2h · sqrt(q(1 − q) / n)`.
    /// `rank_error` is the native function's nominal rank error.
    #[must_use]
    pub fn estimate(&self, q: f64, bandwidth: f64, rank_error: f64, count: u64) -> Option<QuantileSample> {
        if count == 0 {
            return None;
        }
        let lo_q = (q - bandwidth).max(0.001);
        let hi_q = (q + bandwidth).min(0.999);
        let (value, lower, upper, error_bound) = match self {
            Self::Sketch(sketch) => {
                let value = sketch.quantile(q)?;
                let lower = sketch.quantile(lo_q)?;
                let upper = sketch.quantile(hi_q)?;
                (value, lower, upper, sketch.error_bound(value))
            }
            Self::Native { value, lower, upper } => {
                let sparsity = (upper - lower) / (hi_q - lo_q);
                (*value, *lower, *upper, rank_error * sparsity.abs())
            }
        };
        #[allow(clippy::cast_precision_loss)]
        let n = count as f64;
        let standard_error = (upper - lower) / (hi_q - lo_q) * (q * (1.0 - q) / n).sqrt();
        let sample = QuantileSample {
            value,
            error_bound,
            standard_error: standard_error.abs(),
            count,
        };
        (sample.value.is_finite() && sample.error_bound.is_finite() && sample.standard_error.is_finite())
            .then_some(sample)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn exact(values: &mut [f64], q: f64) -> f64 {
        values.sort_by(f64::total_cmp);
        #[allow(clippy::cast_precision_loss, clippy::cast_possible_truncation, clippy::cast_sign_loss)]
        let rank = (q * (values.len() - 1) as f64).floor() as usize;
        values[rank]
    }

    #[test]
    fn test_quantile_within_relative_accuracy() {
        let mut values: Vec<f64> = (1..=1000).map(|i| f64::from(i) * 0.37).collect();
        let mut sketch = LogSketch::new(0.01);
        for &v in &values {
            sketch.add(v);
        }
        for q in [0.05, 0.5, 0.9, 0.99] {
            let truth = exact(&mut values, q);
            let estimate = sketch.quantile(q).unwrap();
            assert!((estimate - truth).abs() <= 0.01 * truth * (1.0 + 1e-9), "q = {q}");
        }
    }

    #[test]
    fn test_negative_and_zero_values_ordered() {
        let mut sketch = LogSketch::new(0.02);
        for v in [-100.0, -1.0, 0.0, 0.0, 5.0] {
            sketch.add(v);
        }
        assert!(sketch.quantile(0.0).unwrap() < -90.0);
        assert!((sketch.quantile(0.5).unwrap()).abs() < f64::EPSILON);
        assert!(sketch.quantile(1.0).unwrap() > 4.8);
    }

    #[test]
    fn test_merge_rejects_mismatched_accuracy() {
        let mut a = LogSketch::new(0.01);
        let b = LogSketch::new(0.02);
        assert!(a.merge(&b).is_err());
    }

    #[test]
    fn test_native_summaries_do_not_merge() {
        let mut a = QuantileSummary::Native { value: 1.0, lower: 0.5, upper: 1.5 };
        let b = a.clone();
        assert!(a.merge(&b).is_err());
    }

    #[test]
    fn test_estimate_reports_bound_and_standard_error() {
        let mut sketch = LogSketch::new(0.01);
        for i in 1..=10_000 {
            sketch.add(f64::from(i));
        }
        let summary = QuantileSummary::Sketch(sketch);
        let sample = summary.estimate(0.5, 0.05, 0.0, 10_000).unwrap();
        assert!((sample.value - 5000.0).abs() <= 0.01 * 5000.0 * 1.01);
        assert!(sample.error_bound > 0.0);
        // Uniform(1, 10000): density 1/10000 → se ≈ 10000 * 0.5 / 100 = 50
        assert!((sample.standard_error - 50.0).abs() < 8.0);
    }
}
