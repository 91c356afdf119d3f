//! Treatment-vs-baseline differences and z-test inference

use super::distributions::{normal_sf, two_sided_z};
use super::moments::ArmEstimate;
use super::sequential;
use crate::config::SequentialSettings;
use crate::results::{Decision, EffectEstimate, Interval};

/// Absolute and relative difference with delta-method standard errors
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Difference {
    /// `μ_t − μ_c`
    pub absolute: f64,
    /// Standard error of `absolute`
    pub absolute_standard_error: f64,
    /// `μ_t / μ_c − 1`
    pub relative: f64,
    /// Standard error of `relative`
    pub relative_standard_error: f64,
}

impl Difference {
    /// Difference of two independent arm estimates
    ///
    /// Relative variance: `v_t / μ_c² + μ_t²·v_c / μ_c⁴`. `None` when the
    /// baseline estimate is zero.
    #[must_use]
    pub fn between(control: &ArmEstimate, treatment: &ArmEstimate) -> Option<Self> {
        let (mc, mt) = (control.estimate, treatment.estimate);
        if mc == 0.0 {
            return None;
        }
        let mc2 = mc * mc;
        let relative_variance = treatment.variance / mc2 + mt * mt * control.variance / (mc2 * mc2);
        Some(Self {
            absolute: mt - mc,
            absolute_standard_error: (control.variance + treatment.variance).sqrt(),
            relative: mt / mc - 1.0,
            relative_standard_error: relative_variance.sqrt(),
        })
    }
}

/// Fixed-horizon two-sided p-value for `z`
#[must_use]
pub fn p_value(z: f64) -> f64 {
    (2.0 * normal_sf(z.abs())).min(1.0)
}

/// z-test (optionally sequential) effect estimate
///
/// `total_units` is `n_c + n_t`, the sample size the confidence sequence is
/// evaluated at.
#[must_use]
pub fn estimate(
    diff: &Difference,
    alpha: f64,
    sequential: Option<&SequentialSettings>,
    total_units: u64,
    inverse: bool,
) -> EffectEstimate {
    let z_crit = two_sided_z(alpha);
    let z = diff.relative / diff.relative_standard_error;
    let fixed_p = p_value(z);

    let (multiplier, p, sequential) = match sequential {
        Some(settings) if !settings.single_look => {
            #[allow(clippy::cast_precision_loss)]
            let n = total_units as f64;
            let multiplier = sequential::halfwidth_multiplier(n, alpha, settings.tuning_parameter).max(z_crit);
            let p = sequential::always_valid_p_value(z, n, alpha, settings.tuning_parameter).max(fixed_p);
            (multiplier, p, true)
        }
        _ => (z_crit, fixed_p, false),
    };

    let relative_interval = Interval::around(diff.relative, multiplier * diff.relative_standard_error);
    EffectEstimate {
        absolute: diff.absolute,
        absolute_standard_error: diff.absolute_standard_error,
        absolute_interval: Interval::around(diff.absolute, multiplier * diff.absolute_standard_error),
        relative: diff.relative,
        relative_standard_error: diff.relative_standard_error,
        relative_interval,
        p_value: Some(p),
        chance_to_win: None,
        risk: None,
        decision: Decision::from_direction(relative_interval.direction(), inverse),
        cuped_applied: false,
        sequential,
    }
}
