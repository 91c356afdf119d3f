//! Segment filter
//!
//! No segment means no filter at all, never an always-false predicate.

use super::{identity, Fragment};
use crate::config::{AnalysisInput, SegmentKind};
use crate::dialect::DialectCapabilities;
use crate::{Error, Result};

/// Name of the inclusion-set fragment for fact-table segments
pub(crate) const SEGMENT: &str = "__segment";

/// Restriction applied to exposure rows
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub(crate) struct SegmentClause {
    /// Conjunct for the exposure `WHERE` clause
    pub conjunct: Option<String>,
    /// Fragments the conjunct reads
    pub fragments: Vec<Fragment>,
}

/// Build the segment restriction for the experiment's exposure rows
///
/// `exposure_unit` is the exposure source's unit id expression.
pub(crate) fn segment_clause(
    input: &AnalysisInput,
    exposure_unit: &str,
    caps: &DialectCapabilities,
) -> Result<SegmentClause> {
    let Some(segment_id) = &input.experiment.segment else {
        return Ok(SegmentClause::default());
    };
    let object = format!("segment '{segment_id}'");
    let segment = input
        .segment(segment_id)
        .ok_or_else(|| Error::config(&object, "segment is not defined"))?;

    match &segment.kind {
        SegmentKind::Predicate { sql } => Ok(SegmentClause {
            conjunct: Some(format!("({})", sql.trim())),
            fragments: Vec::new(),
        }),
        SegmentKind::FactTable { fact_table, filters } => {
            let fact = input
                .fact_table(fact_table)
                .ok_or_else(|| Error::config(&object, format!("unknown fact table '{fact_table}'")))?;
            let ids = identity::source_identity(&input.experiment, &object, &fact.source, &fact.id_columns, caps)?;

            let mut conditions = vec![format!("{} IS NOT NULL", ids.unit_id)];
            for filter_id in filters {
                let filter = fact.filter(filter_id).ok_or_else(|| {
                    Error::config(&object, format!("unknown filter '{filter_id}'"))
                })?;
                conditions.push(format!("({})", filter.sql.trim()));
            }
            let sql = format!(
                "SELECT DISTINCT\n  {} AS unit_id\nFROM {}\nWHERE {}",
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
            fragments.push(Fragment::new(SEGMENT, sql, depends_on));
            Ok(SegmentClause {
                conjunct: Some(format!("{exposure_unit} IN (SELECT unit_id FROM {SEGMENT})")),
                fragments,
            })
        }
    }
}
