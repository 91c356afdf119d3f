//! Configuration validation
//!
//! Everything here runs before any query text is generated. Invalid input is
//! rejected with [`Error::ConfigValidation`], never coerced.
//!
//! User-supplied SQL (filters, segment predicates, relation queries) is
//! syntax-checked with `sqlparser` using the target warehouse's grammar.

use super::{
    AnalysisInput, ColumnRef, ColumnSelector, ColumnType, DimensionSpec, ExecutionMode,
    FactTableDefinition, MetricDefinition, MetricKind, Relation, SegmentKind,
};
use crate::dialect::DialectId;
use crate::{Error, Result};
use sqlparser::ast::Statement;
use sqlparser::dialect::{dialect_from_str, Dialect, GenericDialect};
use sqlparser::parser::Parser;
use sqlparser::tokenizer::Token;
use std::collections::HashSet;

/// Reserved dimension name for overall results
pub const OVERALL_DIMENSION: &str = "All";

fn parser_dialect(dialect: DialectId) -> Box<dyn Dialect> {
    dialect_from_str(dialect.as_str()).unwrap_or_else(|| Box::new(GenericDialect {}))
}

/// Check that `sql` is a single boolean-ish expression
pub(crate) fn check_expression(dialect: DialectId, object: &str, sql: &str) -> Result<()> {
    let grammar = parser_dialect(dialect);
    let mut parser = Parser::new(grammar.as_ref())
        .try_with_sql(sql)
        .map_err(|e| Error::config(object, format!("cannot tokenize SQL '{sql}': {e}")))?;
    parser
        .parse_expr()
        .map_err(|e| Error::config(object, format!("invalid SQL expression '{sql}': {e}")))?;
    if parser.peek_token().token != Token::EOF {
        return Err(Error::config(
            object,
            format!("trailing input after SQL expression '{sql}'"),
        ));
    }
    Ok(())
}

/// Check that a relation query is exactly one `SELECT`
pub(crate) fn check_relation(dialect: DialectId, object: &str, relation: &Relation) -> Result<()> {
    match relation {
        Relation::Table(name) => {
            if name.trim().is_empty() || name.split('.').any(|part| part.trim().is_empty()) {
                return Err(Error::config(object, format!("invalid table name '{name}'")));
            }
            Ok(())
        }
        Relation::Query(sql) => {
            let grammar = parser_dialect(dialect);
            let statements = Parser::parse_sql(grammar.as_ref(), sql)
                .map_err(|e| Error::config(object, format!("invalid SQL query: {e}")))?;
            match statements.as_slice() {
                [Statement::Query(_)] => Ok(()),
                [_] => Err(Error::config(object, "relation query must be a SELECT")),
                _ => Err(Error::config(object, "relation query must be a single statement")),
            }
        }
    }
}

fn non_empty(object: &str, field: &str, value: &str) -> Result<()> {
    if value.trim().is_empty() {
        Err(Error::config(object, format!("{field} must not be empty")))
    } else {
        Ok(())
    }
}

fn finite_non_negative(object: &str, field: &str, value: f64) -> Result<()> {
    if value.is_finite() && value >= 0.0 {
        Ok(())
    } else {
        Err(Error::config(object, format!("{field} must be a finite non-negative number, got {value}")))
    }
}

impl AnalysisInput {
    /// Validate every configuration object against each other and the dialect
    ///
    /// # Errors
    ///
    /// Returns the first [`Error::ConfigValidation`] found
    pub fn validate(&self, dialect: DialectId) -> Result<()> {
        self.settings.validate()?;
        self.validate_experiment(dialect)?;

        let mut fact_ids = HashSet::new();
        for fact in &self.fact_tables {
            if !fact_ids.insert(fact.id.as_str()) {
                return Err(Error::config(format!("fact table '{}'", fact.id), "duplicate id"));
            }
            self.validate_fact_table(dialect, fact)?;
        }

        if self.metrics.is_empty() {
            return Err(Error::config("analysis", "at least one metric is required"));
        }
        let mut metric_ids = HashSet::new();
        let mut slugs = HashSet::new();
        for metric in &self.metrics {
            let object = format!("metric '{}'", metric.id);
            non_empty(&object, "id", &metric.id)?;
            if !metric_ids.insert(metric.id.as_str()) {
                return Err(Error::config(object, "duplicate id"));
            }
            if !slugs.insert(metric.slug()) {
                return Err(Error::config(
                    object,
                    format!("id collides with another metric after normalization to '{}'", metric.slug()),
                ));
            }
            self.validate_metric(metric)?;
        }

        if let Some(segment_id) = &self.experiment.segment {
            self.validate_segment(dialect, segment_id)?;
        }
        Ok(())
    }

    fn validate_experiment(&self, dialect: DialectId) -> Result<()> {
        let exp = &self.experiment;
        let object = format!("experiment '{}'", exp.id);
        non_empty(&object, "id", &exp.id)?;

        if exp.variations.len() < 2 {
            return Err(Error::config(&object, "at least two variations are required"));
        }
        let mut seen = HashSet::new();
        for variation in &exp.variations {
            non_empty(&object, "variation id", &variation.id)?;
            if variation.id == crate::fragment::MULTIPLE_EXPOSURE_VARIATION {
                return Err(Error::config(&object, format!("variation id '{}' is reserved", variation.id)));
            }
            if !seen.insert(variation.id.as_str()) {
                return Err(Error::config(&object, format!("duplicate variation id '{}'", variation.id)));
            }
            if !(variation.weight.is_finite() && variation.weight > 0.0) {
                return Err(Error::config(
                    &object,
                    format!("variation '{}' weight must be positive", variation.id),
                ));
            }
        }

        if exp.start >= exp.end {
            return Err(Error::config(&object, "start must be before end"));
        }

        let identity = &exp.identity;
        if identity.id_types.is_empty() {
            return Err(Error::config(&object, "at least one identifier type must be declared"));
        }
        let mut names = HashSet::new();
        for decl in &identity.id_types {
            non_empty(&object, "identifier type", &decl.name)?;
            if !names.insert(decl.name.as_str()) {
                return Err(Error::config(&object, format!("identifier type '{}' declared twice", decl.name)));
            }
        }
        if let Some(mapping) = &identity.mapping {
            check_relation(dialect, "identity mapping", &mapping.source)?;
            if mapping.id_columns.len() < 2 {
                return Err(Error::config("identity mapping", "must map at least two identifier types"));
            }
            for id_type in mapping.id_columns.keys() {
                if !identity.declares(id_type) {
                    return Err(Error::config(
                        "identity mapping",
                        format!("identifier type '{id_type}' is not declared"),
                    ));
                }
            }
        }

        let assignment = &exp.assignment;
        check_relation(dialect, &object, &assignment.source)?;
        non_empty(&object, "assignment timestamp column", &assignment.timestamp_column)?;
        non_empty(&object, "assignment variation column", &assignment.variation_column)?;
        if assignment.id_columns.is_empty() {
            return Err(Error::config(&object, "assignment source needs at least one identifier column"));
        }
        for id_type in assignment.id_columns.keys() {
            if !identity.declares(id_type) {
                return Err(Error::config(
                    &object,
                    format!("assignment identifier type '{id_type}' is not declared"),
                ));
            }
        }

        let mut dimension_names = HashSet::new();
        for dimension in &exp.dimensions {
            let name = dimension.name();
            non_empty(&object, "dimension name", name)?;
            if name == OVERALL_DIMENSION {
                return Err(Error::config(&object, format!("dimension name '{name}' is reserved")));
            }
            if !dimension_names.insert(name) {
                return Err(Error::config(&object, format!("duplicate dimension '{name}'")));
            }
            if let DimensionSpec::Column { column, .. } = dimension {
                non_empty(&object, "dimension column", column)?;
            }
        }

        if let ExecutionMode::Incremental { units_table } = &exp.mode {
            check_relation(dialect, &object, &Relation::Table(units_table.clone()))?;
        }
        Ok(())
    }

    fn validate_fact_table(&self, dialect: DialectId, fact: &FactTableDefinition) -> Result<()> {
        let object = format!("fact table '{}'", fact.id);
        non_empty(&object, "id", &fact.id)?;
        check_relation(dialect, &object, &fact.source)?;
        non_empty(&object, "timestamp column", &fact.timestamp_column)?;
        if fact.id_columns.is_empty() {
            return Err(Error::config(&object, "at least one identifier column is required"));
        }
        for id_type in fact.id_columns.keys() {
            if !self.experiment.identity.declares(id_type) {
                return Err(Error::config(&object, format!("identifier type '{id_type}' is not declared")));
            }
        }
        let mut filter_ids = HashSet::new();
        for filter in &fact.filters {
            if !filter_ids.insert(filter.id.as_str()) {
                return Err(Error::config(&object, format!("duplicate filter id '{}'", filter.id)));
            }
            check_expression(dialect, &object, &filter.sql)?;
        }
        if crate::fragment::identity::resolve_source(&self.experiment, &fact.id_columns).is_none() {
            return Err(Error::config(
                &object,
                "shares no identifier type with the assignment source and cannot be mapped",
            ));
        }
        Ok(())
    }

    fn validate_column_ref(&self, object: &str, column: &ColumnRef) -> Result<()> {
        let fact = self.fact_table(&column.fact_table).ok_or_else(|| {
            Error::config(object, format!("unknown fact table '{}'", column.fact_table))
        })?;
        if let ColumnSelector::Column(name) = &column.column {
            match fact.columns.get(name) {
                Some(ColumnType::Number) => {}
                Some(other) => {
                    return Err(Error::config(
                        object,
                        format!("column '{name}' is {other:?}, expected Number"),
                    ))
                }
                None => {
                    return Err(Error::config(
                        object,
                        format!("column '{name}' is not defined on fact table '{}'", fact.id),
                    ))
                }
            }
        }
        for filter_id in &column.filters {
            if fact.filter(filter_id).is_none() {
                return Err(Error::config(
                    object,
                    format!("unknown filter '{filter_id}' on fact table '{}'", fact.id),
                ));
            }
        }
        Ok(())
    }

    fn validate_metric(&self, metric: &MetricDefinition) -> Result<()> {
        let object = format!("metric '{}'", metric.id);
        self.validate_column_ref(&object, &metric.numerator)?;

        let needs_rows = matches!(metric.kind, MetricKind::Count | MetricKind::Binary | MetricKind::Duration);
        let needs_column = matches!(metric.kind, MetricKind::Sum | MetricKind::Quantile);
        let is_rows = metric.numerator.column == ColumnSelector::Rows;
        if needs_rows && !is_rows {
            return Err(Error::config(&object, format!("{:?} metrics count rows; remove the column", metric.kind)));
        }
        if needs_column && is_rows {
            return Err(Error::config(&object, format!("{:?} metrics need a numeric column", metric.kind)));
        }

        match (metric.kind, &metric.denominator) {
            (MetricKind::Ratio, Some(denominator)) => self.validate_column_ref(&object, denominator)?,
            (MetricKind::Ratio, None) => return Err(Error::config(&object, "ratio metrics need a denominator")),
            (_, Some(_)) => return Err(Error::config(&object, "only ratio metrics take a denominator")),
            (_, None) => {}
        }

        match (metric.kind, &metric.quantile) {
            (MetricKind::Quantile, Some(spec)) => {
                if !(spec.q > 0.0 && spec.q < 1.0) {
                    return Err(Error::config(&object, format!("quantile level must be in (0, 1), got {}", spec.q)));
                }
            }
            (MetricKind::Quantile, None) => return Err(Error::config(&object, "quantile metrics need a quantile level")),
            (_, Some(_)) => return Err(Error::config(&object, "only quantile metrics take a quantile level")),
            (_, None) => {}
        }

        if let Some(cap) = &metric.cap {
            if !metric.is_cappable() {
                return Err(Error::config(&object, "binary metrics cannot be capped"));
            }
            match *cap {
                super::CapPolicy::Absolute { value } => {
                    if !value.is_finite() {
                        return Err(Error::config(&object, "absolute cap must be finite"));
                    }
                }
                super::CapPolicy::Percentile { p, .. } => {
                    if !(p > 0.0 && p <= 1.0) {
                        return Err(Error::config(&object, format!("cap percentile must be in (0, 1], got {p}")));
                    }
                }
            }
        }

        finite_non_negative(&object, "conversion delay", metric.window.delay_hours)?;
        if let Some(duration) = metric.window.duration_hours {
            if !(duration.is_finite() && duration > 0.0) {
                return Err(Error::config(&object, "conversion window duration must be positive"));
            }
        }

        if let Some(covariate) = &metric.covariate {
            if !matches!(metric.kind, MetricKind::Count | MetricKind::Sum | MetricKind::Binary) {
                return Err(Error::config(
                    &object,
                    format!("CUPED is supported for count, sum and binary metrics, not {:?}", metric.kind),
                ));
            }
            if !(covariate.lookback_hours.is_finite() && covariate.lookback_hours > 0.0) {
                return Err(Error::config(&object, "CUPED lookback must be positive"));
            }
        }
        Ok(())
    }

    fn validate_segment(&self, dialect: DialectId, segment_id: &str) -> Result<()> {
        let segment = self
            .segment(segment_id)
            .ok_or_else(|| Error::config(format!("segment '{segment_id}'"), "segment is not defined"))?;
        let object = format!("segment '{}'", segment.id);
        match &segment.kind {
            SegmentKind::Predicate { sql } => check_expression(dialect, &object, sql),
            SegmentKind::FactTable { fact_table, filters } => {
                let column = ColumnRef {
                    fact_table: fact_table.clone(),
                    column: ColumnSelector::Rows,
                    filters: filters.clone(),
                };
                self.validate_column_ref(&object, &column)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_check_expression_accepts_predicates() {
        check_expression(DialectId::Postgres, "f", "status = 'paid' AND amount > 0").unwrap();
        check_expression(DialectId::BigQuery, "f", "country IN ('US', 'CA')").unwrap();
    }

    #[test]
    fn test_check_expression_rejects_garbage() {
        assert!(check_expression(DialectId::Postgres, "f", "amount >").is_err());
        assert!(check_expression(DialectId::Postgres, "f", "a = 1 b = 2").is_err());
    }

    #[test]
    fn test_check_relation() {
        let ok = Relation::Query("SELECT user_id, event_time FROM events".into());
        check_relation(DialectId::DuckDb, "r", &ok).unwrap();
        let ddl = Relation::Query("DROP TABLE events".into());
        assert!(check_relation(DialectId::DuckDb, "r", &ddl).is_err());
        let two = Relation::Query("SELECT 1; SELECT 2".into());
        assert!(check_relation(DialectId::DuckDb, "r", &two).is_err());
        assert!(check_relation(DialectId::DuckDb, "r", &Relation::Table("a..b".into())).is_err());
    }
}
