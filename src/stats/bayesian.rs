//! Normal-normal Bayesian inference on the relative effect
//!
//! The likelihood of the relative effect is `N(r̂, se²)`. With a proper prior
//! `N(μ₀, σ₀²)` the posterior is the precision-weighted combination; with
//! the flat prior it is the likelihood itself. Risk is the expected relative
//! loss of each choice: `E[max(−δ, 0)]` for shipping the treatment and
//! `E[max(δ, 0)]` for keeping the baseline (swapped for inverse metrics).

use super::distributions::{normal_cdf, normal_pdf, two_sided_z};
use super::frequentist::Difference;
use crate::config::AnalysisSettings;
use crate::results::{Decision, EffectEstimate, Interval, Risk};

/// Posterior mean and standard deviation of the relative effect
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Posterior {
    /// Posterior mean
    pub mean: f64,
    /// Posterior standard deviation
    pub stddev: f64,
}

/// Posterior of the relative effect
#[must_use]
pub fn posterior(diff: &Difference, settings: &AnalysisSettings) -> Posterior {
    let likelihood_precision = 1.0 / (diff.relative_standard_error * diff.relative_standard_error);
    if !settings.prior.proper {
        return Posterior {
            mean: diff.relative,
            stddev: diff.relative_standard_error,
        };
    }
    let prior_precision = 1.0 / (settings.prior.stddev * settings.prior.stddev);
    let precision = prior_precision + likelihood_precision;
    Posterior {
        mean: (settings.prior.mean * prior_precision + diff.relative * likelihood_precision) / precision,
        stddev: precision.recip().sqrt(),
    }
}

/// Expected losses `(keep baseline, ship treatment)` for an increase-is-good metric
fn expected_losses(post: &Posterior) -> (f64, f64) {
    let (mu, sigma) = (post.mean, post.stddev);
    let ratio = mu / sigma;
    let density = sigma * normal_pdf(ratio);
    (density + mu * normal_cdf(ratio), density - mu * normal_cdf(-ratio))
}

/// Bayesian effect estimate
#[must_use]
pub fn estimate(diff: &Difference, settings: &AnalysisSettings, inverse: bool) -> EffectEstimate {
    let post = posterior(diff, settings);
    let z = two_sided_z(settings.alpha);

    let p_increase = normal_cdf(post.mean / post.stddev);
    let chance_to_win = if inverse { 1.0 - p_increase } else { p_increase };
    let (keep, ship) = expected_losses(&post);
    let risk = if inverse {
        Risk { control: ship, treatment: keep }
    } else {
        Risk { control: keep, treatment: ship }
    };

    let decision = if chance_to_win > settings.chance_to_win_threshold {
        Decision::Winning
    } else if chance_to_win < 1.0 - settings.chance_to_win_threshold {
        Decision::Losing
    } else {
        Decision::Inconclusive
    };

    EffectEstimate {
        absolute: diff.absolute,
        absolute_standard_error: diff.absolute_standard_error,
        absolute_interval: Interval::around(diff.absolute, z * diff.absolute_standard_error),
        relative: post.mean,
        relative_standard_error: post.stddev,
        relative_interval: Interval::around(post.mean, z * post.stddev),
        p_value: None,
        chance_to_win: Some(chance_to_win),
        risk: Some(risk),
        decision,
        cuped_applied: false,
        sequential: false,
    }
}
