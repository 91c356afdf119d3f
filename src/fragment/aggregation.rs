//! Per-variation aggregation and traffic
//!
//! Every output query emits one `UNION ALL` branch for the overall result
//! (`dimension_name = dimension_value = 'All'`) and one per requested
//! dimension, so a single query covers every breakdown.

use super::{dimension_alias, metric_value, AnalysisQuery, Fragment, UNITS};
use crate::config::{AnalysisInput, ExperimentSpec, MetricDefinition, MetricKind, OVERALL_DIMENSION};
use crate::dialect::DialectCapabilities;
use crate::query::StepKind;
use crate::stats::LogSketch;
use crate::{Error, Result};

pub(crate) const UNIT_BUCKETS: &str = "__unitBuckets";

/// Output column names shared with the row decoder
pub mod columns {
    /// Variation id
    pub const VARIATION: &str = "variation";
    /// Dimension name (`All` for the overall branch)
    pub const DIMENSION_NAME: &str = "dimension_name";
    /// Dimension value (`All` for the overall branch)
    pub const DIMENSION_VALUE: &str = "dimension_value";
    /// Units contributing a value
    pub const USERS: &str = "users";
    /// Units in a traffic row
    pub const UNITS: &str = "units";
    /// Σ value
    pub const MAIN_SUM: &str = "main_sum";
    /// Σ value²
    pub const MAIN_SUM_SQUARES: &str = "main_sum_squares";
    /// Σ denominator
    pub const DENOMINATOR_SUM: &str = "denominator_sum";
    /// Σ denominator²
    pub const DENOMINATOR_SUM_SQUARES: &str = "denominator_sum_squares";
    /// Σ value·denominator
    pub const MAIN_DENOMINATOR_SUM_PRODUCT: &str = "main_denominator_sum_product";
    /// Σ covariate
    pub const COVARIATE_SUM: &str = "covariate_sum";
    /// Σ covariate²
    pub const COVARIATE_SUM_SQUARES: &str = "covariate_sum_squares";
    /// Σ value·covariate
    pub const MAIN_COVARIATE_SUM_PRODUCT: &str = "main_covariate_sum_product";
    /// Sketch bucket sign (-1, 0, 1)
    pub const BUCKET_SIGN: &str = "bucket_sign";
    /// Sketch bucket index
    pub const BUCKET_INDEX: &str = "bucket_index";
    /// Native quantile at the requested level
    pub const QUANTILE_VALUE: &str = "quantile_value";
    /// Native quantile at `q - bandwidth`
    pub const QUANTILE_LOWER: &str = "quantile_lower";
    /// Native quantile at `q + bandwidth`
    pub const QUANTILE_UPPER: &str = "quantile_upper";
}

struct Branch {
    name: String,
    value: String,
    group: Option<String>,
}

fn branches(experiment: &ExperimentSpec, caps: &DialectCapabilities) -> Vec<Branch> {
    let overall = caps.string_literal(OVERALL_DIMENSION);
    let mut out = vec![Branch {
        name: overall.clone(),
        value: overall,
        group: None,
    }];
    out.extend(experiment.dimensions.iter().enumerate().map(|(i, d)| Branch {
        name: caps.string_literal(d.name()),
        value: dimension_alias(i),
        group: Some(dimension_alias(i)),
    }));
    out
}

fn union(
    experiment: &ExperimentSpec,
    caps: &DialectCapabilities,
    source: &str,
    keys: &[&str],
    aggregates: &[(String, &str)],
) -> String {
    branches(experiment, caps)
        .into_iter()
        .map(|branch| {
            let mut select = vec![
                columns::VARIATION.to_string(),
                format!("{} AS {}", branch.name, columns::DIMENSION_NAME),
                format!("{} AS {}", branch.value, columns::DIMENSION_VALUE),
            ];
            select.extend(keys.iter().map(|k| (*k).to_string()));
            select.extend(aggregates.iter().map(|(expr, alias)| format!("{expr} AS {alias}")));
            let mut group = vec![columns::VARIATION.to_string()];
            group.extend(branch.group);
            group.extend(keys.iter().map(|k| (*k).to_string()));
            format!(
                "SELECT\n  {}\nFROM {source}\nGROUP BY {}",
                select.join(",\n  "),
                group.join(", ")
            )
        })
        .collect::<Vec<_>>()
        .join("\nUNION ALL\n")
}

fn bucket_fragment(input: &AnalysisInput, caps: &DialectCapabilities) -> Fragment {
    let sketch = LogSketch::new(input.settings.quantile.relative_accuracy);
    let dims: String = (0..input.experiment.dimensions.len())
        .map(|i| format!(",\n  {}", dimension_alias(i)))
        .collect();
    let index = caps.cast_integer(&format!("CEIL(LN(NULLIF(ABS(value), 0)) / {})", sketch.ln_gamma()));
    Fragment::new(
        UNIT_BUCKETS,
        format!(
            "SELECT\n  variation{dims},\n  value,\n  CASE WHEN value > 0 THEN 1 WHEN value < 0 THEN -1 ELSE 0 END AS {},\n  CASE WHEN value = 0 THEN 0 ELSE {index} END AS {}\nFROM {}",
            columns::BUCKET_SIGN,
            columns::BUCKET_INDEX,
            metric_value::UNIT_VALUES,
        ),
        [metric_value::UNIT_VALUES],
    )
}

/// Build the aggregation query for one metric
pub(crate) fn metric_query(
    input: &AnalysisInput,
    metric: &MetricDefinition,
    caps: &DialectCapabilities,
) -> Result<AnalysisQuery> {
    let mut fragments = metric_value::metric_fragments(input, metric, caps)?;

    let mut aggregates: Vec<(String, &str)> = vec![
        ("COUNT(value)".to_string(), columns::USERS),
        ("SUM(value)".to_string(), columns::MAIN_SUM),
        ("SUM(value * value)".to_string(), columns::MAIN_SUM_SQUARES),
    ];
    if metric.kind == MetricKind::Ratio {
        aggregates.push(("SUM(denominator)".to_string(), columns::DENOMINATOR_SUM));
        aggregates.push(("SUM(denominator * denominator)".to_string(), columns::DENOMINATOR_SUM_SQUARES));
        aggregates.push(("SUM(value * denominator)".to_string(), columns::MAIN_DENOMINATOR_SUM_PRODUCT));
    }
    if metric.covariate.is_some() {
        aggregates.push(("SUM(covariate)".to_string(), columns::COVARIATE_SUM));
        aggregates.push(("SUM(covariate * covariate)".to_string(), columns::COVARIATE_SUM_SQUARES));
        aggregates.push(("SUM(value * covariate)".to_string(), columns::MAIN_COVARIATE_SUM_PRODUCT));
    }

    let mut source = metric_value::UNIT_VALUES;
    let mut keys: Vec<&str> = Vec::new();
    if metric.kind == MetricKind::Quantile {
        let spec = metric.quantile.ok_or_else(|| {
            Error::config(format!("metric '{}'", metric.id), "quantile metrics need a quantile level")
        })?;
        if metric_value::uses_native_quantile(input, metric, caps) {
            let bandwidth = input.settings.quantile.density_bandwidth;
            let probes = [
                (spec.q, columns::QUANTILE_VALUE),
                ((spec.q - bandwidth).max(0.001), columns::QUANTILE_LOWER),
                ((spec.q + bandwidth).min(0.999), columns::QUANTILE_UPPER),
            ];
            for (level, alias) in probes {
                let expr = caps.approx_quantile("value", level).ok_or_else(|| {
                    Error::Assembly(format!("dialect {} has no native quantile function", caps.id))
                })?;
                aggregates.push((expr, alias));
            }
        } else {
            fragments.push(bucket_fragment(input, caps));
            source = UNIT_BUCKETS;
            keys = vec![columns::BUCKET_SIGN, columns::BUCKET_INDEX];
        }
    }

    let mut output = vec![
        columns::VARIATION.to_string(),
        columns::DIMENSION_NAME.to_string(),
        columns::DIMENSION_VALUE.to_string(),
    ];
    output.extend(keys.iter().map(|k| (*k).to_string()));
    output.extend(aggregates.iter().map(|(_, alias)| (*alias).to_string()));

    Ok(AnalysisQuery {
        kind: StepKind::Metric(metric.id.clone()),
        select: union(&input.experiment, caps, source, &keys, &aggregates),
        depends_on: vec![source.to_string()],
        fragments,
        columns: output,
    })
}

/// Units per (variation, dimension), multiple-exposure sentinel included
pub(crate) fn traffic_query(experiment: &ExperimentSpec, caps: &DialectCapabilities) -> AnalysisQuery {
    let aggregates = [("COUNT(*)".to_string(), columns::UNITS)];
    AnalysisQuery {
        kind: StepKind::Traffic,
        fragments: Vec::new(),
        select: union(experiment, caps, UNITS, &[], &aggregates),
        depends_on: vec![UNITS.to_string()],
        columns: vec![
            columns::VARIATION.to_string(),
            columns::DIMENSION_NAME.to_string(),
            columns::DIMENSION_VALUE.to_string(),
            columns::UNITS.to_string(),
        ],
    }
}

