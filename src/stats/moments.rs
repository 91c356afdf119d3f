//! Per-arm estimators from sufficient statistics
//!
//! Everything here works from counts, sums, sums of squares and cross-sums;
//! no unit-level data is re-read. Variances are sample variances (`n − 1`)
//! with rounding noise below zero clamped to zero.

use serde::{Deserialize, Serialize};

/// Sample mean and variance
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Moments {
    /// Observations
    pub n: f64,
    /// Sample mean
    pub mean: f64,
    /// Sample variance (`n − 1` denominator)
    pub variance: f64,
}

impl Moments {
    /// Moments from `n`, `Σx`, `Σx²`; `None` below two observations
    #[must_use]
    pub fn from_sums(n: u64, sum: f64, sum_squares: f64) -> Option<Self> {
        if n < 2 {
            return None;
        }
        #[allow(clippy::cast_precision_loss)]
        let n = n as f64;
        let mean = sum / n;
        let variance = ((sum_squares - sum * sum / n) / (n - 1.0)).max(0.0);
        (mean.is_finite() && variance.is_finite()).then_some(Self { n, mean, variance })
    }
}

/// Sample covariance from `n`, `Σx`, `Σy`, `Σxy`
#[must_use]
pub fn covariance(n: f64, sum_x: f64, sum_y: f64, sum_xy: f64) -> f64 {
    (sum_xy - sum_x * sum_y / n) / (n - 1.0)
}

/// Point estimate of one arm and the variance of that estimate
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ArmEstimate {
    /// Units in the arm
    pub units: u64,
    /// Mean, ratio or quantile
    pub estimate: f64,
    /// Variance of `estimate`
    pub variance: f64,
}

impl ArmEstimate {
    /// Mean of per-unit values
    #[must_use]
    pub fn mean(moments: &Moments, units: u64) -> Self {
        Self {
            units,
            estimate: moments.mean,
            variance: moments.variance / moments.n,
        }
    }

    /// Ratio of means, delta-method variance
    ///
    /// `None` when the denominator mean is zero.
    #[must_use]
    pub fn ratio(numerator: &Moments, denominator: &Moments, cov: f64, units: u64) -> Option<Self> {
        let (y, x) = (numerator.mean, denominator.mean);
        if x == 0.0 {
            return None;
        }
        let estimate = y / x;
        let variance = (numerator.variance / (x * x) - 2.0 * y * cov / (x * x * x)
            + y * y * denominator.variance / (x * x * x * x))
            / numerator.n;
        Some(Self {
            units,
            estimate,
            variance: variance.max(0.0),
        })
    }

    /// Whether both fields are finite
    #[must_use]
    pub fn is_finite(&self) -> bool {
        self.estimate.is_finite() && self.variance.is_finite()
    }
}

/// Outcome and covariate sufficient statistics of one arm
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CupedArm {
    /// Outcome moments
    pub outcome: Moments,
    /// Covariate moments
    pub covariate: Moments,
    /// Σx of the covariate
    pub covariate_sum: f64,
    /// Outcome/covariate sample covariance
    pub covariance: f64,
}

/// CUPED-adjusted estimates for (control, treatment)
///
/// θ = cov(y, x) / var(x) on the control arm. Each arm's mean is shifted by
/// `θ·(x̄_arm − x̄_pooled)` and its variance becomes
/// `var_y + θ²·var_x − 2θ·cov`. Returns `None` (caller falls back to the
/// unadjusted estimate) when the control covariate has zero variance.
#[must_use]
pub fn cuped_adjust(control: &CupedArm, treatment: &CupedArm, units: (u64, u64)) -> Option<(ArmEstimate, ArmEstimate)> {
    if !(control.covariate.variance > 0.0) {
        return None;
    }
    let theta = control.covariance / control.covariate.variance;
    if !theta.is_finite() {
        return None;
    }
    let pooled = (control.covariate_sum + treatment.covariate_sum) / (control.outcome.n + treatment.outcome.n);
    let adjust = |arm: &CupedArm, units: u64| {
        let variance = (arm.outcome.variance + theta * theta * arm.covariate.variance
            - 2.0 * theta * arm.covariance)
            .max(0.0);
        ArmEstimate {
            units,
            estimate: arm.outcome.mean - theta * (arm.covariate.mean - pooled),
            variance: variance / arm.outcome.n,
        }
    };
    Some((adjust(control, units.0), adjust(treatment, units.1)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_moments_from_sums() {
        // values 1, 2, 3, 4
        let m = Moments::from_sums(4, 10.0, 30.0).unwrap();
        assert!((m.mean - 2.5).abs() < 1e-12);
        assert!((m.variance - 5.0 / 3.0).abs() < 1e-12);
        assert!(Moments::from_sums(1, 1.0, 1.0).is_none());
    }

    #[test]
    fn test_rounding_noise_clamped() {
        let m = Moments::from_sums(3, 0.3, 0.03 - 1e-18).unwrap();
        assert!(m.variance >= 0.0);
    }

    #[test]
    fn test_ratio_zero_denominator() {
        let num = Moments::from_sums(10, 5.0, 5.0).unwrap();
        let den = Moments::from_sums(10, 0.0, 0.0).unwrap();
        assert!(ArmEstimate::ratio(&num, &den, 0.0, 10).is_none());
    }

    #[test]
    fn test_cuped_reduces_variance_for_correlated_covariate() {
        // y = x + noise: strong correlation
        let arm = |n: u64, sx: f64, sxx: f64, sy: f64, syy: f64, sxy: f64| {
            let outcome = Moments::from_sums(n, sy, syy).unwrap();
            let covariate = Moments::from_sums(n, sx, sxx).unwrap();
            #[allow(clippy::cast_precision_loss)]
            let cov = covariance(n as f64, sx, sy, sxy);
            CupedArm { outcome, covariate, covariate_sum: sx, covariance: cov }
        };
        let control = arm(100, 500.0, 3500.0, 520.0, 3800.0, 3600.0);
        let treatment = arm(100, 510.0, 3600.0, 560.0, 4200.0, 3850.0);
        let (c, t) = cuped_adjust(&control, &treatment, (100, 100)).unwrap();
        assert!(c.variance < control.outcome.variance / 100.0);
        assert!(t.variance < treatment.outcome.variance / 100.0);
    }
}
