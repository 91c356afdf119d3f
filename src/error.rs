//! Error types for trueno-ab
//!
//! Toyota Way: Clear error messages with actionable guidance (Respect for People)
//!
//! Propagation policy:
//! - Configuration and assembly errors abort before any warehouse cost is incurred
//! - Warehouse failures abort the run (retry policy belongs to the caller)
//! - Statistical errors never abort a run; they are contained in a single result cell

use crate::warehouse::WarehouseFailure;
use thiserror::Error;

/// Result type alias
pub type Result<T> = std::result::Result<T, Error>;

/// trueno-ab error types
#[derive(Error, Debug)]
pub enum Error {
    /// Malformed or contradictory metric, segment, fact table or experiment definition
    #[error("Invalid configuration for {object}: {reason}\nFix the definition before re-running the analysis.")]
    ConfigValidation {
        /// Offending configuration object (e.g. `metric 'revenue'`)
        object: String,
        /// What is wrong with it
        reason: String,
    },

    /// Dialect identifier not present in the capability table
    #[error("Unsupported dialect: {0}")]
    UnsupportedDialect(String),

    /// Fragment graph inconsistency (cycle, undefined or duplicate name)
    #[error("Query assembly failed: {0}")]
    Assembly(String),

    /// Failure propagated from the warehouse adapter
    #[error("Warehouse execution failed in step '{step}': {source}")]
    WarehouseExecution {
        /// Plan step that failed
        step: String,
        /// Adapter failure
        #[source]
        source: WarehouseFailure,
    },

    /// Warehouse rows did not match the shape the plan declared
    #[error("Result decoding failed: {0}")]
    Decode(String),

    /// Analysis cancelled at a step boundary
    #[error("Analysis cancelled after {completed_steps} completed step(s)")]
    Cancelled {
        /// Number of plan steps that finished before cancellation took effect
        completed_steps: usize,
    },

    /// Statistical computation failed for one result cell
    #[error("Statistical computation failed: {0}")]
    StatisticalComputation(String),

    /// Arrow error while reading warehouse batches
    #[error("Arrow error: {0}")]
    Arrow(#[from] arrow::error::ArrowError),
}

impl Error {
    /// Shorthand for [`Error::ConfigValidation`]
    pub fn config(object: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::ConfigValidation {
            object: object.into(),
            reason: reason.into(),
        }
    }

    /// Pipeline stage that produced this error, for top-level reporting
    #[must_use]
    pub const fn stage(&self) -> &'static str {
        match self {
            Self::ConfigValidation { .. } => "validation",
            Self::UnsupportedDialect(_) => "dialect",
            Self::Assembly(_) => "assembly",
            Self::WarehouseExecution { .. } | Self::Cancelled { .. } => "execution",
            Self::Decode(_) | Self::Arrow(_) => "decoding",
            Self::StatisticalComputation(_) => "statistics",
        }
    }
}
