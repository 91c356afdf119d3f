//! # Trueno-AB: Warehouse-Native Experiment Analysis
//!
//! **Version**: 0.1.0
//!
//! Trueno-AB turns event-level data sitting in an analytical warehouse into
//! effect estimates for running A/B experiments. It composes dialect-aware
//! SQL from small named fragments, runs it through an injected warehouse
//! adapter, and evaluates the returned sufficient statistics with
//! frequentist, sequential or Bayesian inference.
//!
//! ## Design Principles (Toyota Way Aligned)
//!
//! - **Poka-Yoke**: configuration is validated before any SQL is generated
//! - **Muda elimination**: plans are pure and memoized per (input, dialect)
//! - **Jidoka**: a failing result cell is isolated; a failing query stops the run
//! - **Genchi Genbutsu**: identical statistics for single-pass and incremental
//!   execution, checked end to end against `DuckDB`
//!
//! ## Pipeline
//!
//! ```text
//! AnalysisInput ─► validate ─► fragment builders ─► assembler ─► ExecutionPlan
//!                                                                   │
//!              AnalysisReport ◄─ stats engine + health ◄─ WarehouseAdapter
//! ```
//!
//! ## Example Usage
//!
//! ```rust,no_run
//! use trueno_ab::config::AnalysisInput;
//! use trueno_ab::dialect::DialectId;
//! use trueno_ab::runner::{AnalysisRunner, CancellationToken};
//! # use trueno_ab::warehouse::{WarehouseAdapter, WarehouseFailure};
//! # use arrow::record_batch::RecordBatch;
//! # struct Client;
//! # impl WarehouseAdapter for Client {
//! #     async fn execute(&self, _: &str, _: DialectId) -> Result<Vec<RecordBatch>, WarehouseFailure> { Ok(vec![]) }
//! # }
//!
//! # async fn example(input: AnalysisInput) -> trueno_ab::Result<()> {
//! let runner = AnalysisRunner::new(Client, DialectId::Snowflake);
//! let report = runner.run(&input, &CancellationToken::new()).await?;
//! for result in report.results() {
//!     println!("{} {} {:?}", result.metric_id(), result.variation_id(), result.effect());
//! }
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]

pub mod config;
pub mod dialect;
pub mod error;
pub mod fragment;
pub mod health;
pub mod query;
pub mod results;
pub mod runner;
pub mod stats;
pub mod warehouse;

pub use error::{Error, Result};
