//! Analysis configuration
//!
//! Plain serde data objects: experiments, metrics, fact tables, segments and
//! settings. They are read-only for the duration of a run; [`AnalysisInput`]
//! bundles them and is the unit the planner and the plan cache work with.

mod experiment;
mod fact_table;
mod metric;
mod segment;
mod settings;
mod validate;

pub use experiment::{
    AssignmentSource, DimensionSpec, ExecutionMode, ExperimentSpec, IdTypeDecl, IdentityConfig,
    IdentityMapping, Variation,
};
pub use fact_table::{ColumnType, FactTableDefinition, Relation, RowFilter};
pub use metric::{
    CapPolicy, ColumnRef, ColumnSelector, ConversionWindow, Covariate, MetricDefinition,
    MetricKind, QuantileSpec,
};
pub use segment::{SegmentDefinition, SegmentKind};
pub use settings::{AnalysisSettings, EngineKind, PriorSettings, QuantileSettings, SequentialSettings};
pub use validate::OVERALL_DIMENSION;

pub(crate) use validate::check_expression;

use serde::{Deserialize, Serialize};

/// Everything an analysis run needs besides the warehouse
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnalysisInput {
    /// Experiment under analysis
    pub experiment: ExperimentSpec,
    /// Metrics to compute
    pub metrics: Vec<MetricDefinition>,
    /// Fact tables referenced by metrics and segments
    pub fact_tables: Vec<FactTableDefinition>,
    /// Segments referenced by the experiment
    #[serde(default)]
    pub segments: Vec<SegmentDefinition>,
    /// Statistics and execution knobs
    #[serde(default)]
    pub settings: AnalysisSettings,
}

impl AnalysisInput {
    /// Bundle an experiment with its metrics and fact tables, default settings
    #[must_use]
    pub fn new(
        experiment: ExperimentSpec,
        metrics: Vec<MetricDefinition>,
        fact_tables: Vec<FactTableDefinition>,
    ) -> Self {
        Self {
            experiment,
            metrics,
            fact_tables,
            segments: Vec::new(),
            settings: AnalysisSettings::default(),
        }
    }

    /// Add a segment definition
    #[must_use]
    pub fn with_segment(mut self, segment: SegmentDefinition) -> Self {
        self.segments.push(segment);
        self
    }

    /// Replace the settings
    #[must_use]
    pub fn with_settings(mut self, settings: AnalysisSettings) -> Self {
        self.settings = settings;
        self
    }

    /// Look up a fact table by id
    #[must_use]
    pub fn fact_table(&self, id: &str) -> Option<&FactTableDefinition> {
        self.fact_tables.iter().find(|f| f.id == id)
    }

    /// Look up a segment by id
    #[must_use]
    pub fn segment(&self, id: &str) -> Option<&SegmentDefinition> {
        self.segments.iter().find(|s| s.id == id)
    }

    /// Look up a metric by id
    #[must_use]
    pub fn metric(&self, id: &str) -> Option<&MetricDefinition> {
        self.metrics.iter().find(|m| m.id == id)
    }
}
