//! Exposure resolution and the units relation
//!
//! First exposure wins: a unit's variation, first exposure time and
//! dimension values come from its earliest exposure row (ties broken by
//! variation id). Units exposed to more than one variation are kept under
//! the [`MULTIPLE_EXPOSURE_VARIATION`] sentinel so traffic diagnostics can
//! count them; metric queries skip them.

use super::{
    dimension_alias, identity, metric_value, segment, Fragment, MULTIPLE_EXPOSURE_VARIATION,
    NULL_DIMENSION_VALUE, UNITS,
};
use crate::config::{AnalysisInput, DimensionSpec, MetricDefinition, MetricKind};
use crate::dialect::DialectCapabilities;
use crate::Result;

pub(crate) const RAW_EXPOSURES: &str = "__rawExposures";
pub(crate) const EXPOSURE_RANK: &str = "__exposureRank";
pub(crate) const VARIATION_COUNT: &str = "__variationCount";
pub(crate) const UNITS_BASE: &str = "__unitsBase";

/// Column of [`UNITS`] holding a metric's pre-exposure covariate
#[must_use]
pub fn covariate_column(metric: &MetricDefinition) -> String {
    format!("cov_{}", metric.slug())
}

/// Whole minutes in `hours`, rounded to the nearest minute
pub(crate) fn hours_to_minutes(hours: f64) -> i64 {
    // Validated finite and far below i64 range
    #[allow(clippy::cast_possible_truncation)]
    let minutes = (hours * 60.0).round() as i64;
    minutes
}

fn dimension_expr(dimension: &DimensionSpec, ts: &str, caps: &DialectCapabilities) -> String {
    let raw = match dimension {
        DimensionSpec::Column { column, .. } => {
            caps.cast_string(&format!("{}.{}", identity::SOURCE_ALIAS, caps.quote_ident(column)))
        }
        DimensionSpec::ExposureDate => caps.cast_string(&caps.date_trunc_day(ts)),
    };
    format!("COALESCE({raw}, {})", caps.string_literal(NULL_DIMENSION_VALUE))
}

fn dimension_list(input: &AnalysisInput, prefix: &str) -> String {
    (0..input.experiment.dimensions.len())
        .map(|i| format!(",\n  {prefix}{}", dimension_alias(i)))
        .collect()
}

/// Build the units chain, ending in the [`UNITS`] fragment
pub(crate) fn units_chain(input: &AnalysisInput, caps: &DialectCapabilities) -> Result<Vec<Fragment>> {
    let experiment = &input.experiment;
    let assignment = &experiment.assignment;
    let object = format!("experiment '{}'", experiment.id);
    let ids = identity::source_identity(experiment, &object, &assignment.source, &assignment.id_columns, caps)?;
    let segment = segment::segment_clause(input, &ids.unit_id, caps)?;

    let mut fragments = Vec::new();
    let mut raw_deps = Vec::new();
    if let Some(mapping) = ids.mapping {
        raw_deps.push(mapping.name.clone());
        fragments.push(mapping);
    }
    for fragment in segment.fragments {
        if fragment.name == segment::SEGMENT {
            raw_deps.push(fragment.name.clone());
        }
        super::push_fragment(&mut fragments, fragment);
    }

    let ts = format!("{}.{}", identity::SOURCE_ALIAS, caps.quote_ident(&assignment.timestamp_column));
    let variation = caps.cast_string(&format!(
        "{}.{}",
        identity::SOURCE_ALIAS,
        caps.quote_ident(&assignment.variation_column)
    ));
    let dims: String = experiment
        .dimensions
        .iter()
        .enumerate()
        .map(|(i, d)| format!(",\n  {} AS {}", dimension_expr(d, &ts, caps), dimension_alias(i)))
        .collect();
    let variation_ids = experiment
        .variations
        .iter()
        .map(|v| caps.string_literal(&v.id))
        .collect::<Vec<_>>()
        .join(", ");

    let mut conditions = vec![
        format!("{ts} >= {}", caps.timestamp_literal(&experiment.start)),
        format!("{ts} <= {}", caps.timestamp_literal(&experiment.end)),
        format!("{} IS NOT NULL", ids.unit_id),
        format!("{variation} IN ({variation_ids})"),
    ];
    conditions.extend(segment.conjunct);

    fragments.push(Fragment::new(
        RAW_EXPOSURES,
        format!(
            "SELECT\n  {} AS unit_id,\n  {variation} AS variation,\n  {ts} AS exposure_time{dims}\nFROM {}\nWHERE {}",
            ids.unit_id,
            ids.from,
            conditions.join("\n  AND "),
        ),
        raw_deps,
    ));

    fragments.push(Fragment::new(
        EXPOSURE_RANK,
        format!(
            "SELECT\n  unit_id,\n  variation,\n  exposure_time{},\n  ROW_NUMBER() OVER (PARTITION BY unit_id ORDER BY exposure_time, variation) AS exposure_rank\nFROM {RAW_EXPOSURES}",
            dimension_list(input, ""),
        ),
        [RAW_EXPOSURES],
    ));

    fragments.push(Fragment::new(
        VARIATION_COUNT,
        format!(
            "SELECT\n  unit_id,\n  COUNT(DISTINCT variation) AS variation_count\nFROM {RAW_EXPOSURES}\nGROUP BY unit_id"
        ),
        [RAW_EXPOSURES],
    ));

    fragments.push(Fragment::new(
        UNITS_BASE,
        format!(
            "SELECT\n  r.unit_id,\n  CASE WHEN c.variation_count > 1 THEN {} ELSE r.variation END AS variation,\n  r.exposure_time AS first_exposure{}\nFROM {EXPOSURE_RANK} r\nJOIN {VARIATION_COUNT} c ON c.unit_id = r.unit_id\nWHERE r.exposure_rank = 1",
            caps.string_literal(MULTIPLE_EXPOSURE_VARIATION),
            dimension_list(input, "r."),
        ),
        [EXPOSURE_RANK, VARIATION_COUNT],
    ));

    let mut units_deps = vec![UNITS_BASE.to_string()];
    let mut covariate_cols = String::new();
    let mut covariate_joins = String::new();
    for (i, metric) in input.metrics.iter().enumerate() {
        let Some(covariate) = metric.covariate else {
            continue;
        };
        let slug = metric.slug();
        let fact_name = format!("__covariateFact_{slug}");
        let lower = caps.add_minutes(
            &caps.timestamp_literal(&experiment.start),
            -hours_to_minutes(covariate.lookback_hours),
        );
        for fragment in metric_value::fact_fragments(input, metric, &metric.numerator, &fact_name, &lower, caps)? {
            super::push_fragment(&mut fragments, fragment);
        }

        let aggregate = match metric.kind {
            MetricKind::Binary => "MAX(f.value)",
            _ => "SUM(f.value)",
        };
        let name = format!("__covariate_{slug}");
        fragments.push(Fragment::new(
            name.clone(),
            format!(
                "SELECT\n  u.unit_id,\n  {aggregate} AS covariate_value\nFROM {UNITS_BASE} u\nJOIN {fact_name} f ON f.unit_id = u.unit_id\nWHERE f.event_time >= {}\n  AND f.event_time < u.first_exposure\nGROUP BY u.unit_id",
                caps.add_minutes("u.first_exposure", -hours_to_minutes(covariate.lookback_hours)),
            ),
            [UNITS_BASE.to_string(), fact_name],
        ));
        covariate_cols.push_str(&format!(
            ",\n  COALESCE(c{i}.covariate_value, 0.0) AS {}",
            covariate_column(metric)
        ));
        covariate_joins.push_str(&format!("\nLEFT JOIN {name} c{i} ON c{i}.unit_id = u.unit_id"));
        units_deps.push(name);
    }

    fragments.push(Fragment::new(
        UNITS,
        format!(
            "SELECT\n  u.unit_id,\n  u.variation,\n  u.first_exposure{}{covariate_cols}\nFROM {UNITS_BASE} u{covariate_joins}",
            dimension_list(input, "u."),
        ),
        units_deps,
    ));
    Ok(fragments)
}
