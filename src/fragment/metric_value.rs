//! Metric value extraction
//!
//! Event rows become per-unit values in three hops:
//!
//! 1. `__factMain` / `__factDenominator`: canonical unit id, event time and
//!    per-event value, with row filters and the analysis bounds applied
//! 2. `__unitMain` / `__unitDenominator`: one row per unit, events inside the
//!    conversion window aggregated according to the metric kind
//! 3. `__unitValues`: caps applied by clamping, never by discarding units
//!
//! Ratio numerators and denominators are extracted independently and may
//! come from different fact tables.

use super::{dimension_alias, exposure, identity, Fragment, MULTIPLE_EXPOSURE_VARIATION, UNITS};
use crate::config::{AnalysisInput, CapPolicy, ColumnRef, ColumnSelector, MetricDefinition, MetricKind};
use crate::dialect::{float_literal, DialectCapabilities};
use crate::{Error, Result};

pub(crate) const FACT_MAIN: &str = "__factMain";
pub(crate) const FACT_DENOMINATOR: &str = "__factDenominator";
pub(crate) const UNIT_MAIN: &str = "__unitMain";
pub(crate) const UNIT_DENOMINATOR: &str = "__unitDenominator";
pub(crate) const CAP_MAIN: &str = "__capMain";
pub(crate) const UNIT_VALUES: &str = "__unitValues";

/// Whether a quantile metric uses the dialect's native quantile function
#[must_use]
pub fn uses_native_quantile(input: &AnalysisInput, metric: &MetricDefinition, caps: &DialectCapabilities) -> bool {
    metric.kind == MetricKind::Quantile
        && input.settings.quantile.prefer_native
        && caps.approx_quantile.is_some()
}

/// Event-level fragment for one column reference
///
/// Rows before `lower` or after the analysis end never reach a unit.
pub(crate) fn fact_fragments(
    input: &AnalysisInput,
    metric: &MetricDefinition,
    column: &ColumnRef,
    name: &str,
    lower: &str,
    caps: &DialectCapabilities,
) -> Result<Vec<Fragment>> {
    let object = format!("metric '{}'", metric.id);
    let fact = input.fact_table(&column.fact_table).ok_or_else(|| {
        Error::config(&object, format!("unknown fact table '{}'", column.fact_table))
    })?;
    let ids = identity::source_identity(&input.experiment, &object, &fact.source, &fact.id_columns, caps)?;

    let ts = format!("{}.{}", identity::SOURCE_ALIAS, caps.quote_ident(&fact.timestamp_column));
    let value = match &column.column {
        ColumnSelector::Rows => caps.cast_float("1"),
        ColumnSelector::Column(col) => {
            caps.cast_float(&format!("{}.{}", identity::SOURCE_ALIAS, caps.quote_ident(col)))
        }
    };
    let mut conditions = vec![
        format!("{ts} >= {lower}"),
        format!("{ts} <= {}", caps.timestamp_literal(&input.experiment.end)),
    ];
    for filter_id in &column.filters {
        let filter = fact
            .filter(filter_id)
            .ok_or_else(|| Error::config(&object, format!("unknown filter '{filter_id}'")))?;
        conditions.push(format!("({})", filter.sql.trim()));
    }

    let sql = format!(
        "SELECT\n  {} AS unit_id,\n  {ts} AS event_time,\n  {value} AS value\nFROM {}\nWHERE {}",
        ids.unit_id,
        ids.from,
        conditions.join("\n  AND "),
    );
    let mut fragments = Vec::new();
    let mut depends_on = Vec::new();
    if let Some(mapping) = ids.mapping {
        depends_on.push(mapping.name.clone());
        fragments.push(mapping);
    }
    fragments.push(Fragment::new(name, sql, depends_on));
    Ok(fragments)
}

fn unit_aggregate(kind: MetricKind, caps: &DialectCapabilities) -> String {
    match kind {
        MetricKind::Binary => "COALESCE(MAX(f.value), 0.0)".to_string(),
        MetricKind::Duration => format!(
            "MIN({})",
            caps.cast_float(&caps.seconds_between("u.first_exposure", "f.event_time"))
        ),
        MetricKind::Count | MetricKind::Sum | MetricKind::Ratio | MetricKind::Quantile => {
            "COALESCE(SUM(f.value), 0.0)".to_string()
        }
    }
}

fn window_condition(metric: &MetricDefinition, caps: &DialectCapabilities) -> String {
    let delay = exposure::hours_to_minutes(metric.window.delay_hours);
    let mut condition = format!(
        "f.unit_id = u.unit_id\n  AND f.event_time >= {}",
        caps.add_minutes("u.first_exposure", delay)
    );
    if let Some(duration) = metric.window.duration_hours {
        let end = delay + exposure::hours_to_minutes(duration);
        condition.push_str(&format!("\n  AND f.event_time <= {}", caps.add_minutes("u.first_exposure", end)));
    }
    condition
}

fn unit_fragment(
    input: &AnalysisInput,
    metric: &MetricDefinition,
    name: &str,
    fact: &str,
    kind: MetricKind,
    with_context: bool,
    caps: &DialectCapabilities,
) -> Fragment {
    let mut keys = vec!["u.unit_id".to_string()];
    if with_context {
        keys.push("u.variation".to_string());
        keys.extend((0..input.experiment.dimensions.len()).map(|i| format!("u.{}", dimension_alias(i))));
        if metric.covariate.is_some() {
            keys.push(format!("u.{}", exposure::covariate_column(metric)));
        }
    }
    let mut select = keys.clone();
    if with_context && metric.covariate.is_some() {
        if let Some(last) = select.last_mut() {
            *last = format!("{last} AS covariate");
        }
    }
    let sql = format!(
        "SELECT\n  {},\n  {} AS value\nFROM {UNITS} u\nLEFT JOIN {fact} f ON {}\nWHERE u.variation <> {}\nGROUP BY {}",
        select.join(",\n  "),
        unit_aggregate(kind, caps),
        window_condition(metric, caps),
        caps.string_literal(MULTIPLE_EXPOSURE_VARIATION),
        keys.join(", "),
    );
    Fragment::new(name, sql, [UNITS, fact])
}

/// Fragments through `__unitValues` for one metric
///
/// `__unitValues` columns: `variation`, `dim_*`, `value`, then
/// `denominator` (ratio) and `covariate` (CUPED) when present.
pub(crate) fn metric_fragments(
    input: &AnalysisInput,
    metric: &MetricDefinition,
    caps: &DialectCapabilities,
) -> Result<Vec<Fragment>> {
    let start = caps.timestamp_literal(&input.experiment.start);
    let lower = caps.add_minutes(&start, exposure::hours_to_minutes(metric.window.delay_hours));
    let mut fragments = Vec::new();
    for fragment in fact_fragments(input, metric, &metric.numerator, FACT_MAIN, &lower, caps)? {
        super::push_fragment(&mut fragments, fragment);
    }
    fragments.push(unit_fragment(input, metric, UNIT_MAIN, FACT_MAIN, metric.kind, true, caps));

    let denominator = match (metric.kind, &metric.denominator) {
        (MetricKind::Ratio, Some(denominator)) => Some(denominator),
        (MetricKind::Ratio, None) => {
            return Err(Error::config(format!("metric '{}'", metric.id), "ratio metrics need a denominator"))
        }
        _ => None,
    };
    if let Some(denominator) = denominator {
        for fragment in fact_fragments(input, metric, denominator, FACT_DENOMINATOR, &lower, caps)? {
            super::push_fragment(&mut fragments, fragment);
        }
        fragments.push(unit_fragment(
            input,
            metric,
            UNIT_DENOMINATOR,
            FACT_DENOMINATOR,
            MetricKind::Sum,
            false,
            caps,
        ));
    }

    let mut deps = vec![UNIT_MAIN.to_string()];
    let mut joins = String::new();
    let value = match metric.cap.filter(|_| metric.is_cappable()) {
        None => "m.value".to_string(),
        Some(CapPolicy::Absolute { value }) => {
            let cap = float_literal(value);
            format!("CASE WHEN m.value > {cap} THEN {cap} ELSE m.value END")
        }
        Some(CapPolicy::Percentile { p, ignore_zeros }) => {
            let filter = if ignore_zeros { "\nWHERE value <> 0" } else { "" };
            fragments.push(Fragment::new(
                CAP_MAIN,
                format!("SELECT\n  {} AS cap_value\nFROM {UNIT_MAIN}{filter}", caps.percentile("value", p)),
                [UNIT_MAIN],
            ));
            deps.push(CAP_MAIN.to_string());
            joins.push_str(&format!("\nCROSS JOIN {CAP_MAIN} c"));
            "CASE WHEN m.value > c.cap_value THEN c.cap_value ELSE m.value END".to_string()
        }
    };

    let mut columns = vec!["m.variation".to_string()];
    columns.extend((0..input.experiment.dimensions.len()).map(|i| format!("m.{}", dimension_alias(i))));
    columns.push(format!("{value} AS value"));
    if denominator.is_some() {
        columns.push("d.value AS denominator".to_string());
        joins.push_str(&format!("\nJOIN {UNIT_DENOMINATOR} d ON d.unit_id = m.unit_id"));
        deps.push(UNIT_DENOMINATOR.to_string());
    }
    if metric.covariate.is_some() {
        columns.push("m.covariate".to_string());
    }

    let mut conditions = Vec::new();
    if metric.kind == MetricKind::Duration {
        conditions.push("m.value IS NOT NULL");
    }
    if metric.quantile.is_some_and(|q| q.ignore_zeros) {
        conditions.push("m.value <> 0");
    }
    let filter = if conditions.is_empty() {
        String::new()
    } else {
        format!("\nWHERE {}", conditions.join("\n  AND "))
    };

    fragments.push(Fragment::new(
        UNIT_VALUES,
        format!(
            "SELECT\n  {}\nFROM {UNIT_MAIN} m{joins}{filter}",
            columns.join(",\n  ")
        ),
        deps,
    ));
    Ok(fragments)
}
