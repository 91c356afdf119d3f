//! Warehouse execution contract
//!
//! The pipeline never talks to a warehouse client directly. Callers inject a
//! [`WarehouseAdapter`] that runs one statement and hands back Arrow batches:
//!
//! ```rust,no_run
//! use arrow::record_batch::RecordBatch;
//! use trueno_ab::dialect::DialectId;
//! use trueno_ab::warehouse::{WarehouseAdapter, WarehouseFailure};
//!
//! struct Client;
//!
//! impl WarehouseAdapter for Client {
//!     async fn execute(&self, query: &str, _dialect: DialectId) -> Result<Vec<RecordBatch>, WarehouseFailure> {
//!         Err(WarehouseFailure::retryable(format!("not connected ({} bytes)", query.len())))
//!     }
//! }
//! ```
//!
//! Toyota Way Principles:
//! - Jidoka: a failed statement stops the run; retry policy stays with the caller
//! - Heijunka: concurrency is bounded by the runner, not by adapters

mod rows;

pub use rows::{AggregateRow, CovariateSums, RatioSums, TrafficRow};
pub(crate) use rows::{decode_metric_rows, decode_traffic_rows};

use crate::dialect::DialectId;
use arrow::record_batch::RecordBatch;
use std::future::Future;
use thiserror::Error;

/// Failure reported by a warehouse adapter
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{message}")]
pub struct WarehouseFailure {
    /// Adapter-provided description
    pub message: String,
    /// Whether the caller may retry the statement
    pub retryable: bool,
}

impl WarehouseFailure {
    /// A failure that will not go away on retry
    #[must_use]
    pub fn permanent(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            retryable: false,
        }
    }

    /// A transient failure (timeout, rate limit, lost connection)
    #[must_use]
    pub fn retryable(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            retryable: true,
        }
    }
}

/// Executes generated SQL against a customer warehouse.
///
/// Implementations must be safe to call concurrently; the runner keeps at
/// most `max_concurrency` statements in flight.
pub trait WarehouseAdapter: Send + Sync {
    /// Execute one statement.
    ///
    /// DDL statements (drop / create of the units table) return no batches.
    fn execute(
        &self,
        query: &str,
        dialect: DialectId,
    ) -> impl Future<Output = Result<Vec<RecordBatch>, WarehouseFailure>> + Send;

    /// Best-effort cancellation of in-flight statements.
    ///
    /// The default does nothing; the runner stops issuing new statements
    /// either way.
    fn cancel(&self) -> impl Future<Output = ()> + Send {
        async {}
    }
}
