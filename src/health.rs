//! Experiment health diagnostics
//!
//! Computed from the traffic step only, independent of metric results:
//! - Sample-ratio mismatch: χ² goodness-of-fit of observed units against the
//!   configured weights, overall and per dimension value
//! - Multiple exposures: units that saw more than one variation
//!
//! Neither diagnostic fails a run; findings are reported and logged.

use crate::config::{AnalysisInput, ExperimentSpec};
use crate::fragment::MULTIPLE_EXPOSURE_VARIATION;
use crate::results::{DimensionKey, HealthReport, MultipleExposureReport, SrmResult, SrmVerdict};
use crate::stats::distributions::chi_square_sf;
use crate::warehouse::TrafficRow;
use std::collections::BTreeSet;
use tracing::warn;

/// SRM test for one population
///
/// `traffic` may contain rows for other dimensions; only rows matching
/// `dimension` are counted. The multiple-exposure sentinel is excluded.
#[must_use]
pub fn sample_ratio_mismatch(
    experiment: &ExperimentSpec,
    dimension: &DimensionKey,
    traffic: &[TrafficRow],
    threshold: f64,
) -> SrmResult {
    let observed: Vec<u64> = experiment
        .variations
        .iter()
        .map(|v| {
            traffic
                .iter()
                .filter(|r| &r.dimension == dimension && r.variation == v.id)
                .map(|r| r.units)
                .sum()
        })
        .collect();
    let total: u64 = observed.iter().sum();
    let weight_total: f64 = experiment.variations.iter().map(|v| v.weight).sum();

    #[allow(clippy::cast_precision_loss)]
    let expected: Vec<f64> = experiment
        .variations
        .iter()
        .map(|v| total as f64 * v.weight / weight_total)
        .collect();

    if total == 0 || observed.len() < 2 {
        return SrmResult {
            dimension: dimension.clone(),
            observed,
            expected,
            chi_square: 0.0,
            p_value: 1.0,
            verdict: SrmVerdict::InsufficientData,
        };
    }

    #[allow(clippy::cast_precision_loss)]
    let chi_square: f64 = observed
        .iter()
        .zip(&expected)
        .filter(|(_, &e)| e > 0.0)
        .map(|(&o, &e)| {
            let d = o as f64 - e;
            d * d / e
        })
        .sum();
    #[allow(clippy::cast_precision_loss)]
    let df = (observed.len() - 1) as f64;
    let p_value = chi_square_sf(chi_square, df);
    let verdict = if p_value < threshold {
        SrmVerdict::Mismatch
    } else {
        SrmVerdict::Ok
    };
    SrmResult {
        dimension: dimension.clone(),
        observed,
        expected,
        chi_square,
        p_value,
        verdict,
    }
}

/// Sentinel-variation units over all units of the overall population
#[must_use]
pub fn multiple_exposures(traffic: &[TrafficRow], threshold: f64) -> MultipleExposureReport {
    let overall: Vec<&TrafficRow> = traffic.iter().filter(|r| r.dimension.is_overall()).collect();
    let total: u64 = overall.iter().map(|r| r.units).sum();
    let count: u64 = overall
        .iter()
        .filter(|r| r.variation == MULTIPLE_EXPOSURE_VARIATION)
        .map(|r| r.units)
        .sum();
    #[allow(clippy::cast_precision_loss)]
    let ratio = if total == 0 { 0.0 } else { count as f64 / total as f64 };
    MultipleExposureReport {
        count,
        ratio,
        warning: ratio > threshold,
    }
}

/// Full health report for a run
#[must_use]
pub fn health_report(input: &AnalysisInput, traffic: &[TrafficRow]) -> HealthReport {
    let experiment = &input.experiment;
    let threshold = input.settings.srm_threshold;

    let srm = sample_ratio_mismatch(experiment, &DimensionKey::overall(), traffic, threshold);
    let dimensions: BTreeSet<&DimensionKey> =
        traffic.iter().map(|r| &r.dimension).filter(|d| !d.is_overall()).collect();
    let srm_by_dimension: Vec<SrmResult> = dimensions
        .into_iter()
        .map(|d| sample_ratio_mismatch(experiment, d, traffic, threshold))
        .collect();
    let multiple = multiple_exposures(traffic, input.settings.multiple_exposure_threshold);

    if srm.verdict == SrmVerdict::Mismatch {
        warn!(
            experiment = %experiment.id,
            p_value = srm.p_value,
            observed = ?srm.observed,
            "sample ratio mismatch"
        );
    }
    for result in srm_by_dimension.iter().filter(|s| s.verdict == SrmVerdict::Mismatch) {
        warn!(
            experiment = %experiment.id,
            dimension = %result.dimension,
            p_value = result.p_value,
            "sample ratio mismatch in dimension"
        );
    }
    if multiple.warning {
        warn!(
            experiment = %experiment.id,
            count = multiple.count,
            ratio = multiple.ratio,
            "units exposed to more than one variation"
        );
    }

    HealthReport {
        srm,
        srm_by_dimension,
        multiple_exposures: multiple,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{
        AssignmentSource, ExecutionMode, IdentityConfig, Relation, Variation,
    };
    use chrono::{TimeZone, Utc};

    fn experiment(weights: &[f64]) -> ExperimentSpec {
        ExperimentSpec {
            id: "exp".into(),
            variations: weights
                .iter()
                .enumerate()
                .map(|(i, &weight)| Variation { id: format!("v{i}"), weight })
                .collect(),
            assignment: AssignmentSource {
                source: Relation::Table("exposures".into()),
                timestamp_column: "event_time".into(),
                variation_column: "variation".into(),
                id_columns: [("user_id".to_string(), "user_id".to_string())].into_iter().collect(),
            },
            identity: IdentityConfig::ordered(["user_id"]),
            dimensions: Vec::new(),
            start: Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap(),
            end: Utc.with_ymd_and_hms(2024, 1, 15, 0, 0, 0).unwrap(),
            segment: None,
            mode: ExecutionMode::SinglePass,
        }
    }

    fn traffic(units: &[(&str, u64)]) -> Vec<TrafficRow> {
        units
            .iter()
            .map(|&(variation, units)| TrafficRow {
                variation: variation.to_string(),
                dimension: DimensionKey::overall(),
                units,
            })
            .collect()
    }

    #[test]
    fn test_balanced_split_passes() {
        let srm = sample_ratio_mismatch(
            &experiment(&[1.0, 1.0]),
            &DimensionKey::overall(),
            &traffic(&[("v0", 10_000), ("v1", 10_010)]),
            0.001,
        );
        assert_eq!(srm.verdict, SrmVerdict::Ok);
        assert!(srm.p_value > 0.5);
    }

    #[test]
    fn test_skewed_split_flagged() {
        let srm = sample_ratio_mismatch(
            &experiment(&[1.0, 1.0]),
            &DimensionKey::overall(),
            &traffic(&[("v0", 10_000), ("v1", 7_000)]),
            0.001,
        );
        assert_eq!(srm.verdict, SrmVerdict::Mismatch);
        assert!(srm.p_value < 0.01);
        assert!((srm.chi_square - 2.0 * 1500.0 * 1500.0 / 8500.0).abs() < 1e-9);
    }

    #[test]
    fn test_uneven_weights_respected() {
        let srm = sample_ratio_mismatch(
            &experiment(&[3.0, 1.0]),
            &DimensionKey::overall(),
            &traffic(&[("v0", 7_500), ("v1", 2_500)]),
            0.001,
        );
        assert_eq!(srm.verdict, SrmVerdict::Ok);
        assert!(srm.chi_square.abs() < 1e-9);
    }

    #[test]
    fn test_no_units_is_insufficient() {
        let srm = sample_ratio_mismatch(&experiment(&[1.0, 1.0]), &DimensionKey::overall(), &[], 0.001);
        assert_eq!(srm.verdict, SrmVerdict::InsufficientData);
    }

    #[test]
    fn test_multiple_exposure_ratio() {
        let rows = traffic(&[("v0", 495), ("v1", 495), (MULTIPLE_EXPOSURE_VARIATION, 10)]);
        let report = multiple_exposures(&rows, 0.005);
        assert_eq!(report.count, 10);
        assert!((report.ratio - 0.01).abs() < 1e-12);
        assert!(report.warning);
        assert!(!multiple_exposures(&rows, 0.05).warning);
    }
}
