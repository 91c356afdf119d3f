//! Statistics engine scenarios with hand-computed expectations

mod common;

use trueno_ab::config::{
    AnalysisInput, AnalysisSettings, ExecutionMode, MetricDefinition, SequentialSettings,
};
use trueno_ab::dialect::DialectId;
use trueno_ab::health::health_report;
use trueno_ab::results::{AnalysisResult, CellStatus, Decision, DimensionKey, SrmVerdict};
use trueno_ab::stats::{self, LogSketch, QuantileSummary};
use trueno_ab::warehouse::{AggregateRow, CovariateSums, RatioSums, TrafficRow};
use trueno_ab::Error;

fn overall_row(metric: &str, variation: &str, units: u64, sum: f64, sum_squares: f64) -> AggregateRow {
    AggregateRow::new(metric, variation, DimensionKey::overall(), units, sum, sum_squares)
}

/// `n` values with mean `mean` and sample variance `variance`
fn sums(n: u64, mean: f64, variance: f64) -> (f64, f64) {
    #[allow(clippy::cast_precision_loss)]
    let nf = n as f64;
    let sum = nf * mean;
    (sum, sum * sum / nf + variance * (nf - 1.0))
}

fn only(input: &AnalysisInput, rows: &[AggregateRow], metric: &str, variation: &str) -> AnalysisResult {
    let results = stats::analyze(input, DialectId::Postgres, rows).unwrap();
    results
        .into_iter()
        .find(|r| r.metric_id() == metric && r.variation_id() == variation && r.dimension().is_overall())
        .unwrap()
}

fn conversion_rows() -> Vec<AggregateRow> {
    vec![
        overall_row("converted", "control", 1000, 500.0, 500.0),
        overall_row("converted", "treatment", 1000, 560.0, 560.0),
    ]
}

// ============================================================================
// Frequentist
// ============================================================================

#[test]
fn test_conversion_lift_is_significant() {
    let input = common::input(ExecutionMode::SinglePass);
    let result = only(&input, &conversion_rows(), "converted", "treatment");

    assert_eq!(result.status(), &CellStatus::Ok);
    assert_eq!(result.sample_size(), 1000);
    assert!((result.point_estimate().unwrap() - 0.56).abs() < 1e-12);
    let effect = result.effect().unwrap();
    assert!((effect.relative - 0.12).abs() < 1e-12);
    assert!((effect.absolute - 0.06).abs() < 1e-12);
    let p = effect.p_value.unwrap();
    assert!(p > 0.005 && p < 0.02, "p = {p}");
    assert!(effect.relative_interval.lower > 0.0);
    assert_eq!(effect.decision, Decision::Winning);
    assert!(!effect.sequential);
}

#[test]
fn test_baseline_cell_has_no_effect() {
    let input = common::input(ExecutionMode::SinglePass);
    let baseline = only(&input, &conversion_rows(), "converted", "control");
    assert!(baseline.is_baseline());
    assert!(baseline.effect().is_none());
    assert!((baseline.point_estimate().unwrap() - 0.5).abs() < 1e-12);
}

#[test]
fn test_inverse_metric_flips_the_call() {
    let input = common::input(ExecutionMode::SinglePass);
    let (cs, css) = sums(1000, 10.0, 4.0);
    let (ts, tss) = sums(1000, 11.0, 4.0);
    let rows = vec![
        overall_row("time_to_purchase", "control", 1000, cs, css),
        overall_row("time_to_purchase", "treatment", 1000, ts, tss),
    ];
    let effect = only(&input, &rows, "time_to_purchase", "treatment").effect().cloned().unwrap();
    assert!(effect.relative > 0.09);
    assert_eq!(effect.decision, Decision::Losing);
}

#[test]
fn test_sequential_is_never_tighter() {
    let fixed_input = common::input(ExecutionMode::SinglePass);
    let sequential_input = common::input(ExecutionMode::SinglePass)
        .with_settings(AnalysisSettings::default().with_sequential(SequentialSettings::default()));

    let fixed = only(&fixed_input, &conversion_rows(), "converted", "treatment");
    let sequential = only(&sequential_input, &conversion_rows(), "converted", "treatment");
    let (fixed, sequential) = (fixed.effect().unwrap(), sequential.effect().unwrap());

    assert!(sequential.sequential);
    assert!(sequential.relative_interval.width() > fixed.relative_interval.width());
    assert!(sequential.p_value.unwrap() >= fixed.p_value.unwrap());
    assert!((sequential.relative - fixed.relative).abs() < 1e-12);
}

#[test]
fn test_small_arms_are_insufficient() {
    let input = common::input(ExecutionMode::SinglePass);
    let rows = vec![
        overall_row("purchases", "control", 20, 30.0, 60.0),
        overall_row("purchases", "treatment", 20, 35.0, 75.0),
    ];
    let treatment = only(&input, &rows, "purchases", "treatment");
    assert!(matches!(treatment.status(), CellStatus::InsufficientData { .. }));
    assert!(treatment.effect().is_none());
    assert_eq!(treatment.sample_size(), 20);

    let relaxed = common::input(ExecutionMode::SinglePass)
        .with_settings(AnalysisSettings::default().with_min_sample_size(10));
    assert!(only(&relaxed, &rows, "purchases", "treatment").effect().is_some());
}

#[test]
fn test_zero_variance_is_insufficient() {
    let input = common::input(ExecutionMode::SinglePass);
    let rows = vec![
        overall_row("converted", "control", 100, 100.0, 100.0),
        overall_row("converted", "treatment", 100, 100.0, 100.0),
    ];
    let result = only(&input, &rows, "converted", "treatment");
    assert_eq!(result.status(), &CellStatus::insufficient("zero variance"));
}

#[test]
fn test_flat_treatment_arm_is_insufficient_in_both_engines() {
    // no treatment unit converted: the arm has no variance of its own
    let rows = vec![
        overall_row("converted", "control", 1000, 500.0, 500.0),
        overall_row("converted", "treatment", 1000, 0.0, 0.0),
    ];
    for settings in [AnalysisSettings::default(), AnalysisSettings::default().bayesian()] {
        let input = common::input(ExecutionMode::SinglePass).with_settings(settings);
        let result = only(&input, &rows, "converted", "treatment");
        assert_eq!(result.status(), &CellStatus::insufficient("zero variance"));
        assert!(result.effect().is_none());
    }
}

#[test]
fn test_ratio_metric_uses_delta_method() {
    let input = common::input(ExecutionMode::SinglePass);
    // revenue per order; every unit has 2 orders, so the ratio is mean / 2
    let ratio = |n: u64, amount_mean: f64| {
        let (sum, sum_squares) = sums(n, amount_mean, 25.0);
        #[allow(clippy::cast_precision_loss)]
        let nf = n as f64;
        overall_row("aov", "", n, sum, sum_squares).with_ratio(RatioSums {
            denominator_sum: 2.0 * nf,
            denominator_sum_squares: 4.0 * nf,
            main_denominator_sum_product: 2.0 * sum,
        })
    };
    let mut control = ratio(500, 40.0);
    control.variation = "control".into();
    let mut treatment = ratio(500, 44.0);
    treatment.variation = "treatment".into();

    let result = only(&input, &[control, treatment], "aov", "treatment");
    assert!((result.point_estimate().unwrap() - 22.0).abs() < 1e-9);
    let effect = result.effect().unwrap();
    assert!((effect.relative - 0.1).abs() < 1e-9);
    // constant denominator: same as a mean of amount / 2
    let expected_se = ((25.0 / 4.0 / 500.0) * 2.0_f64).sqrt();
    assert!((effect.absolute_standard_error - expected_se).abs() < 1e-9);
}

#[test]
fn test_ratio_without_denominator_sums_fails_only_that_cell() {
    let input = common::input(ExecutionMode::SinglePass);
    let mut rows = conversion_rows();
    let (s, ss) = sums(100, 40.0, 25.0);
    rows.push(overall_row("aov", "control", 100, s, ss));
    rows.push(overall_row("aov", "treatment", 100, s, ss));

    let results = stats::analyze(&input, DialectId::Postgres, &rows).unwrap();
    let aov = results
        .iter()
        .find(|r| r.metric_id() == "aov" && r.variation_id() == "treatment")
        .unwrap();
    assert!(matches!(aov.status(), CellStatus::Error { message } if message.contains("denominator")));
    let converted = results
        .iter()
        .find(|r| r.metric_id() == "converted" && r.variation_id() == "treatment")
        .unwrap();
    assert!(converted.status().is_ok());
}

#[test]
fn test_cuped_narrows_interval() {
    let input = common::input(ExecutionMode::SinglePass);
    // outcome ≈ covariate + shift, strongly correlated
    let arm = |variation: &str, shift: f64| {
        let n = 400u64;
        let values: Vec<(f64, f64)> = (0..n)
            .map(|i| {
                #[allow(clippy::cast_precision_loss)]
                let x = (i % 40) as f64;
                let noise = if i % 2 == 0 { 0.5 } else { -0.5 };
                (x, x + shift + noise)
            })
            .collect();
        let sum_y: f64 = values.iter().map(|(_, y)| y).sum();
        let sum_yy: f64 = values.iter().map(|(_, y)| y * y).sum();
        AggregateRow::new("revenue", variation, DimensionKey::overall(), n, sum_y, sum_yy).with_covariate(
            CovariateSums {
                covariate_sum: values.iter().map(|(x, _)| x).sum(),
                covariate_sum_squares: values.iter().map(|(x, _)| x * x).sum(),
                main_covariate_sum_product: values.iter().map(|(x, y)| x * y).sum(),
            },
        )
    };
    let rows = vec![arm("control", 10.0), arm("treatment", 11.0)];
    let adjusted = only(&input, &rows, "revenue", "treatment");
    let effect = adjusted.effect().unwrap();
    assert!(effect.cuped_applied);

    let plain: Vec<AggregateRow> = rows
        .iter()
        .cloned()
        .map(|mut r| {
            r.covariate = None;
            r
        })
        .collect();
    let unadjusted = only(&input, &plain, "revenue", "treatment");
    let plain_effect = unadjusted.effect().unwrap();
    assert!(!plain_effect.cuped_applied);
    assert!(effect.relative_interval.width() < plain_effect.relative_interval.width() / 5.0);
}

// ============================================================================
// Bayesian
// ============================================================================

#[test]
fn test_bayesian_chance_to_win() {
    let input = common::input(ExecutionMode::SinglePass).with_settings(AnalysisSettings::default().bayesian());
    let result = only(&input, &conversion_rows(), "converted", "treatment");
    let effect = result.effect().unwrap();

    // z ≈ 2.53 under the flat prior
    let chance = effect.chance_to_win.unwrap();
    assert!(chance > 0.99 && chance < 0.999, "chance = {chance}");
    assert!(effect.p_value.is_none());
    assert_eq!(effect.decision, Decision::Winning);
    let risk = effect.risk.unwrap();
    assert!(risk.treatment < risk.control);
    assert!(risk.treatment >= 0.0);
}

#[test]
fn test_proper_prior_shrinks_toward_prior_mean() {
    let mut settings = AnalysisSettings::default().bayesian();
    settings.prior.proper = true;
    settings.prior.stddev = 0.05;
    let input = common::input(ExecutionMode::SinglePass).with_settings(settings);
    let effect = only(&input, &conversion_rows(), "converted", "treatment").effect().cloned().unwrap();
    assert!(effect.relative > 0.0 && effect.relative < 0.12);
    assert!(effect.relative_standard_error < 0.05);
}

// ============================================================================
// Quantiles
// ============================================================================

#[test]
fn test_partial_sketches_merge_to_the_full_quantile() {
    let input = common::input(ExecutionMode::SinglePass);
    let accuracy = input.settings.quantile.relative_accuracy;
    let values: Vec<f64> = (1..=2000).map(|i| f64::from(i) * 1.7).collect();

    let sketch_of = |slice: &[f64]| {
        let mut sketch = LogSketch::new(accuracy);
        slice.iter().for_each(|&v| sketch.add(v));
        sketch
    };
    let row = |variation: &str, slice: &[f64]| {
        AggregateRow::new("p50_revenue", variation, DimensionKey::overall(), slice.len() as u64, 0.0, 0.0)
            .with_quantile(QuantileSummary::Sketch(sketch_of(slice)))
    };

    // disjoint halves of the same population, merged as partial batches
    let mut control = row("control", &values[..700]);
    control.merge(&row("control", &values[700..])).unwrap();
    let treatment = row("treatment", &values);

    let result = only(&input, &[control, treatment], "p50_revenue", "control");
    let quantile = result.quantile().unwrap();
    let truth = values[999];
    assert!((quantile.value - truth).abs() <= accuracy * truth * (1.0 + 1e-9));
    assert!(quantile.error_bound > 0.0);
    assert!(quantile.standard_error > 0.0);

    let treatment = only(
        &input,
        &[row("control", &values), row("treatment", &values)],
        "p50_revenue",
        "treatment",
    );
    assert!(treatment.effect().unwrap().relative.abs() < 1e-12);
}

// ============================================================================
// Health
// ============================================================================

fn traffic(control: u64, treatment: u64, multiple: u64) -> Vec<TrafficRow> {
    [("control", control), ("treatment", treatment), ("__multiple__", multiple)]
        .into_iter()
        .map(|(variation, units)| TrafficRow {
            variation: variation.into(),
            dimension: DimensionKey::overall(),
            units,
        })
        .collect()
}

#[test]
fn test_srm_flags_lopsided_split() {
    let input = common::input(ExecutionMode::SinglePass);
    let balanced = health_report(&input, &traffic(5000, 5050, 0));
    assert_eq!(balanced.srm.verdict, SrmVerdict::Ok);
    assert!(!balanced.has_warnings());

    let lopsided = health_report(&input, &traffic(5000, 5500, 0));
    assert_eq!(lopsided.srm.verdict, SrmVerdict::Mismatch);
    assert!(lopsided.srm.p_value < 0.001);
    assert_eq!(lopsided.srm.observed, vec![5000, 5500]);
}

#[test]
fn test_multiple_exposures_reported_not_counted() {
    let input = common::input(ExecutionMode::SinglePass);
    let report = health_report(&input, &traffic(4900, 4900, 200));
    assert_eq!(report.multiple_exposures.count, 200);
    assert!((report.multiple_exposures.ratio - 0.02).abs() < 1e-12);
    assert!(report.multiple_exposures.warning);
    // the sentinel never enters the SRM test
    assert_eq!(report.srm.observed, vec![4900, 4900]);
    assert_eq!(report.srm.verdict, SrmVerdict::Ok);
}

// ============================================================================
// Errors
// ============================================================================

#[test]
fn test_analyze_without_baseline() {
    let mut input = common::input(ExecutionMode::SinglePass);
    input.experiment.variations.clear();
    let err = stats::analyze(&input, DialectId::Postgres, &conversion_rows()).unwrap_err();
    assert!(matches!(err, Error::ConfigValidation { .. }));
}

#[test]
fn test_metrics_without_rows_are_insufficient() {
    let mut input = common::input(ExecutionMode::SinglePass);
    input.metrics.push(MetricDefinition::count("refunds", "orders"));
    let results = stats::analyze(&input, DialectId::Postgres, &conversion_rows()).unwrap();
    let refunds: Vec<_> = results.iter().filter(|r| r.metric_id() == "refunds").collect();
    assert_eq!(refunds.len(), 2);
    assert!(refunds
        .iter()
        .all(|r| r.status() == &CellStatus::insufficient("no units")));
}
