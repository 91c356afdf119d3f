//! Identity resolution
//!
//! Every source row gets a canonical unit id: the first non-null identifier
//! in declared priority order, cast to the dialect's string type. The
//! ordered-priority merge is configuration, not code: reorder
//! [`IdentityConfig::id_types`](crate::config::IdentityConfig) to change it.
//!
//! A source lacking the exposure side's top-priority identifier is joined to
//! the identity mapping (deduplicated to one row per join id) on the
//! highest-priority identifier the two share.

use super::Fragment;
use crate::config::{ExperimentSpec, Relation};
use crate::dialect::DialectCapabilities;
use crate::{Error, Result};
use std::collections::BTreeMap;

/// Alias of the source relation in generated `FROM` clauses
pub(crate) const SOURCE_ALIAS: &str = "s";

/// How a source's rows obtain canonical unit ids
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum IdentityResolution {
    /// `COALESCE` over the listed identifier types of the source itself
    Direct {
        /// Shared identifier types, most preferred first
        id_types: Vec<String>,
    },
    /// Translate through the identity mapping
    Mapped {
        /// Identifier types the source itself contributes as a fallback
        id_types: Vec<String>,
        /// Identifier type used to join the mapping
        join_type: String,
    },
}

/// Identifier types of the exposure source, most preferred first
pub(crate) fn exposure_types(experiment: &ExperimentSpec) -> Vec<&str> {
    experiment
        .identity
        .priority_order()
        .into_iter()
        .filter(|t| experiment.assignment.id_columns.contains_key(*t))
        .collect()
}

/// Decide how a source with `id_columns` is matched to exposure units
///
/// Returns `None` when the source can neither be matched directly nor
/// through the mapping.
pub(crate) fn resolve_source(
    experiment: &ExperimentSpec,
    id_columns: &BTreeMap<String, String>,
) -> Option<IdentityResolution> {
    let exposure = exposure_types(experiment);
    let top = *exposure.first()?;
    let shared: Vec<String> = exposure
        .iter()
        .filter(|t| id_columns.contains_key(**t))
        .map(|t| (*t).to_string())
        .collect();

    if id_columns.contains_key(top) {
        return Some(IdentityResolution::Direct { id_types: shared });
    }

    let mapped = experiment.identity.mapping.as_ref().and_then(|mapping| {
        if !mapping.id_columns.contains_key(top) {
            return None;
        }
        experiment
            .identity
            .priority_order()
            .into_iter()
            .find(|t| id_columns.contains_key(*t) && mapping.id_columns.contains_key(*t))
            .map(|join| IdentityResolution::Mapped {
                id_types: shared.clone(),
                join_type: join.to_string(),
            })
    });
    if mapped.is_some() {
        return mapped;
    }

    if shared.is_empty() {
        None
    } else {
        Some(IdentityResolution::Direct { id_types: shared })
    }
}

/// `FROM` clause and unit id expression for one source
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct SourceIdentity {
    /// Text following `FROM` (source aliased as `s`, mapping as `idm`)
    pub from: String,
    /// Canonical unit id expression
    pub unit_id: String,
    /// Mapping fragment the `FROM` clause reads, if any
    pub mapping: Option<Fragment>,
}

pub(crate) fn coalesce(mut exprs: Vec<String>) -> String {
    if exprs.len() == 1 {
        exprs.remove(0)
    } else {
        format!("COALESCE({})", exprs.join(", "))
    }
}

fn column_exprs(
    caps: &DialectCapabilities,
    alias: &str,
    id_types: &[String],
    id_columns: &BTreeMap<String, String>,
) -> Vec<String> {
    id_types
        .iter()
        .filter_map(|t| id_columns.get(t))
        .map(|col| caps.cast_string(&format!("{alias}.{}", caps.quote_ident(col))))
        .collect()
}

fn mapping_fragment(
    experiment: &ExperimentSpec,
    join_type: &str,
    caps: &DialectCapabilities,
) -> Result<Fragment> {
    let mapping = experiment
        .identity
        .mapping
        .as_ref()
        .ok_or_else(|| Error::config("identity mapping", "mapping is not configured"))?;
    let join_col = mapping.id_columns.get(join_type).ok_or_else(|| {
        Error::config("identity mapping", format!("no column for identifier type '{join_type}'"))
    })?;
    let join_expr = caps.cast_string(&format!("m.{}", caps.quote_ident(join_col)));
    let exposure: Vec<String> = exposure_types(experiment).into_iter().map(String::from).collect();
    let unit = coalesce(column_exprs(caps, "m", &exposure, &mapping.id_columns));
    let sql = format!(
        "SELECT\n  {join_expr} AS idm_join_id,\n  MIN({unit}) AS idm_unit_id\nFROM {source} m\nWHERE m.{col} IS NOT NULL\nGROUP BY {join_expr}",
        source = mapping.source.render(caps),
        col = caps.quote_ident(join_col),
    );
    Ok(Fragment::new(format!("__idmap_{join_type}"), sql, Vec::<String>::new()))
}

/// Build the identity-resolved `FROM` clause for a source relation
///
/// # Errors
///
/// Returns [`Error::ConfigValidation`] when the source cannot be matched to
/// exposure units.
pub(crate) fn source_identity(
    experiment: &ExperimentSpec,
    object: &str,
    relation: &Relation,
    id_columns: &BTreeMap<String, String>,
    caps: &DialectCapabilities,
) -> Result<SourceIdentity> {
    let resolution = resolve_source(experiment, id_columns).ok_or_else(|| {
        Error::config(object, "shares no identifier type with the assignment source")
    })?;
    let source = format!("{} {SOURCE_ALIAS}", relation.render(caps));
    match resolution {
        IdentityResolution::Direct { id_types } => Ok(SourceIdentity {
            from: source,
            unit_id: coalesce(column_exprs(caps, SOURCE_ALIAS, &id_types, id_columns)),
            mapping: None,
        }),
        IdentityResolution::Mapped { id_types, join_type } => {
            let fragment = mapping_fragment(experiment, &join_type, caps)?;
            let join_col = id_columns.get(&join_type).ok_or_else(|| {
                Error::config(object, format!("no column for identifier type '{join_type}'"))
            })?;
            let join_expr = caps.cast_string(&format!("{SOURCE_ALIAS}.{}", caps.quote_ident(join_col)));
            let mut exprs = vec!["idm.idm_unit_id".to_string()];
            exprs.extend(column_exprs(caps, SOURCE_ALIAS, &id_types, id_columns));
            Ok(SourceIdentity {
                from: format!(
                    "{source}\nLEFT JOIN {} idm ON idm.idm_join_id = {join_expr}",
                    fragment.name
                ),
                unit_id: coalesce(exprs),
                mapping: Some(fragment),
            })
        }
    }
}
