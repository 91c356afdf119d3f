//! Mixture-SPRT confidence sequences
//!
//! Normal mixture with mixing variance chosen so the sequence is tightest at
//! `N* = tuning_parameter` total units (Howard et al., 2021, eq. 14):
//!
//! ```text
//! ρ²         = (−2 ln α + ln(−2 ln α + 1)) / N*
//! halfwidth  = se · sqrt( 2(Nρ² + 1) / (Nρ²) · ln( sqrt(Nρ² + 1) / α ) )
//! Λ(z)       = (1 + Nρ²)^(−1/2) · exp( Nρ² / (1 + Nρ²) · z² / 2 )
//! p          = min(1, 1 / Λ)
//! ```
//!
//! Callers floor both at their fixed-horizon counterparts, so a sequential
//! interval is never narrower and a sequential p-value never smaller.

fn rho_squared(alpha: f64, tuning_parameter: f64) -> f64 {
    let log_term = -2.0 * alpha.ln();
    (log_term + (log_term + 1.0).ln()) / tuning_parameter
}

/// Half-width of the confidence sequence in units of the standard error
#[must_use]
pub fn halfwidth_multiplier(total_units: f64, alpha: f64, tuning_parameter: f64) -> f64 {
    let v = total_units * rho_squared(alpha, tuning_parameter);
    if !(v > 0.0) {
        return f64::INFINITY;
    }
    (2.0 * (v + 1.0) / v * ((v + 1.0).sqrt() / alpha).ln()).sqrt()
}

/// Always-valid p-value for a z statistic observed at `total_units`
#[must_use]
pub fn always_valid_p_value(z: f64, total_units: f64, alpha: f64, tuning_parameter: f64) -> f64 {
    let v = total_units * rho_squared(alpha, tuning_parameter);
    if !(v > 0.0) {
        return 1.0;
    }
    let log_lambda = -0.5 * (1.0 + v).ln() + v / (1.0 + v) * z * z / 2.0;
    (-log_lambda).exp().min(1.0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stats::distributions::two_sided_z;

    #[test]
    fn test_wider_than_fixed_horizon_at_typical_sizes() {
        let fixed = two_sided_z(0.05);
        for n in [100.0, 2000.0, 5000.0, 50_000.0] {
            assert!(halfwidth_multiplier(n, 0.05, 5000.0) > fixed, "n = {n}");
        }
        // N = 2000, N* = 5000, α = 0.05 → ≈ 3.12
        assert!((halfwidth_multiplier(2000.0, 0.05, 5000.0) - 3.124).abs() < 0.01);
    }

    #[test]
    fn test_p_value_bounded_and_monotone_in_z() {
        let p1 = always_valid_p_value(1.0, 2000.0, 0.05, 5000.0);
        let p3 = always_valid_p_value(3.0, 2000.0, 0.05, 5000.0);
        let p5 = always_valid_p_value(5.0, 2000.0, 0.05, 5000.0);
        assert!((p1 - 1.0).abs() < f64::EPSILON);
        assert!(p3 > p5);
        assert!(p5 > 0.0);
    }

    #[test]
    fn test_no_units_is_unbounded() {
        assert!(halfwidth_multiplier(0.0, 0.05, 5000.0).is_infinite());
        assert!((always_valid_p_value(4.0, 0.0, 0.05, 5000.0) - 1.0).abs() < f64::EPSILON);
    }
}
