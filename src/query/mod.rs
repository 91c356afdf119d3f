//! Query assembly
//!
//! Toyota Way Principles:
//! - Jidoka: cycles and undefined relations stop assembly before any
//!   warehouse cost is incurred
//! - Muda elimination: incremental plans materialize units once and
//!   re-aggregate against them
//!
//! An [`ExecutionPlan`] is an ordered list of [`PlanStep`]s in two phases.
//! Steps within a phase are independent; every phase 1 step happens before
//! any phase 2 step.

mod assembler;
mod cache;

pub use assembler::assemble;
pub use cache::PlanCache;

use crate::config::{AnalysisInput, ExecutionMode};
use crate::dialect::DialectId;
use crate::fragment::build_fragments;
use crate::Result;
use serde::{Deserialize, Serialize};

/// Execution phase of a plan step
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    /// Materialize the units relation (incremental mode only)
    Units,
    /// Metric and traffic aggregation
    Analysis,
}

/// What a plan step does
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepKind {
    /// Drop the units table before re-creating it
    DropUnits,
    /// Create the units table
    MaterializeUnits,
    /// Aggregate one metric (by metric id)
    Metric(String),
    /// Unit counts per variation for health diagnostics
    Traffic,
}

impl StepKind {
    /// Stable step name used in logs and errors
    #[must_use]
    pub fn step_name(&self) -> String {
        match self {
            Self::DropUnits => "drop_units".to_string(),
            Self::MaterializeUnits => "materialize_units".to_string(),
            Self::Metric(id) => format!("metric:{id}"),
            Self::Traffic => "traffic".to_string(),
        }
    }
}

/// One query to run against the warehouse
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlanStep {
    /// Unique name within the plan
    pub name: String,
    /// Phase the step belongs to
    pub phase: Phase,
    /// What the step produces
    pub kind: StepKind,
    /// Complete statement text
    pub sql: String,
    /// Output columns (empty for DDL steps)
    pub columns: Vec<String>,
    /// Relation this step writes, if any
    pub materializes: Option<String>,
}

/// Ordered steps for one analysis
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionPlan {
    /// Dialect the SQL is written in
    pub dialect: DialectId,
    /// Mode the plan was assembled for
    pub mode: ExecutionMode,
    /// Steps, phase 1 first
    pub steps: Vec<PlanStep>,
}

impl ExecutionPlan {
    /// Steps of one phase, in plan order
    pub fn phase(&self, phase: Phase) -> impl Iterator<Item = &PlanStep> {
        self.steps.iter().filter(move |s| s.phase == phase)
    }

    /// Relation materialized between phases, if any
    #[must_use]
    pub fn materialized_relation(&self) -> Option<&str> {
        self.steps.iter().find_map(|s| s.materializes.as_deref())
    }

    /// Look up a step by name
    #[must_use]
    pub fn step(&self, name: &str) -> Option<&PlanStep> {
        self.steps.iter().find(|s| s.name == name)
    }
}

/// Build fragments and assemble them for the input's execution mode
///
/// The input must already be validated.
///
/// # Errors
///
/// Returns [`crate::Error::Assembly`] for inconsistent fragment graphs and
/// [`crate::Error::ConfigValidation`] for unresolved references.
pub fn build_plan(input: &AnalysisInput, dialect: DialectId) -> Result<ExecutionPlan> {
    let caps = dialect.capabilities();
    let fragments = build_fragments(input, caps)?;
    assemble(&fragments, &input.experiment.mode, caps)
}
