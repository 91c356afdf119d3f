//! Analysis runner: plan → execute → decode → statistics
//!
//! ```text
//! validate ─► PlanCache ─► phase 1 (units) ─► phase 2 (metrics ∥ traffic) ─► stats + health
//!                           sequential          ≤ max_concurrency in flight
//! ```
//!
//! Toyota Way Principles:
//! - Jidoka: configuration errors stop the run before any warehouse cost;
//!   a failed statement stops the run with the step that failed
//! - Heijunka: a semaphore levels warehouse load to `max_concurrency`
//! - Andon: cancellation is honoured at every step boundary

use crate::config::AnalysisInput;
use crate::dialect::DialectId;
use crate::health::health_report;
use crate::query::{ExecutionPlan, Phase, PlanCache, PlanStep, StepKind};
use crate::results::{AnalysisReport, AnalysisResult};
use crate::stats::StatsEngine;
use crate::warehouse::{decode_metric_rows, decode_traffic_rows, AggregateRow, WarehouseAdapter};
use crate::{Error, Result};
use arrow::record_batch::RecordBatch;
use futures::future::join_all;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::runtime::Handle;
use tokio::sync::{AcquireError, Semaphore};
use tracing::{debug, info, warn};

/// Cooperative cancellation flag shared between a caller and a run
#[derive(Debug, Clone, Default)]
pub struct CancellationToken {
    cancelled: Arc<AtomicBool>,
}

impl CancellationToken {
    /// Create a token that is not cancelled
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Request cancellation; takes effect before the next step starts
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    /// Check if cancellation was requested
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }
}

type StepOutput<'p> = (&'p PlanStep, Vec<RecordBatch>);

/// Runs analyses for one dialect against one warehouse
#[derive(Debug)]
pub struct AnalysisRunner<W> {
    warehouse: W,
    dialect: DialectId,
    cache: PlanCache,
}

impl<W: WarehouseAdapter> AnalysisRunner<W> {
    /// Create a runner with an empty plan cache
    #[must_use]
    pub fn new(warehouse: W, dialect: DialectId) -> Self {
        Self {
            warehouse,
            dialect,
            cache: PlanCache::new(),
        }
    }

    /// Replace the plan cache with one holding up to `capacity` plans
    #[must_use]
    pub fn with_plan_capacity(mut self, capacity: usize) -> Self {
        self.cache = PlanCache::with_capacity(capacity);
        self
    }

    /// The injected warehouse adapter
    #[must_use]
    pub const fn warehouse(&self) -> &W {
        &self.warehouse
    }

    /// Target dialect
    #[must_use]
    pub const fn dialect(&self) -> DialectId {
        self.dialect
    }

    /// Plan cache
    #[must_use]
    pub const fn cache(&self) -> &PlanCache {
        &self.cache
    }

    /// Validate the input and return its (cached) execution plan
    ///
    /// # Errors
    ///
    /// Returns [`Error::ConfigValidation`] or [`Error::Assembly`]; nothing is
    /// sent to the warehouse
    pub fn plan(&self, input: &AnalysisInput) -> Result<Arc<ExecutionPlan>> {
        input.validate(self.dialect)?;
        self.cache.get_or_build(input, self.dialect)
    }

    /// Run every phase and compute the report
    ///
    /// # Errors
    ///
    /// Planning errors, [`Error::WarehouseExecution`], [`Error::Cancelled`]
    /// and decoding errors abort the run. Statistical failures do not; they
    /// are reported per cell.
    pub async fn run(&self, input: &AnalysisInput, cancel: &CancellationToken) -> Result<AnalysisReport> {
        let plan = self.plan(input)?;
        info!(
            experiment = %input.experiment.id,
            dialect = %self.dialect,
            steps = plan.steps.len(),
            metrics = input.metrics.len(),
            "starting analysis run"
        );
        let completed = AtomicUsize::new(0);

        for step in plan.phase(Phase::Units) {
            if cancel.is_cancelled() {
                return Err(self.cancelled(&completed).await);
            }
            self.execute_step(step, &completed).await?;
        }
        if plan.materialized_relation().is_some() {
            info!(experiment = %input.experiment.id, "units materialized");
        }

        let outputs = self.execute_analysis(&plan, input.settings.max_concurrency, cancel, &completed).await?;
        self.report(input, outputs).await
    }

    /// Re-run phase 2 against an already materialized units table
    ///
    /// # Errors
    ///
    /// Returns [`Error::ConfigValidation`] unless the experiment runs in
    /// incremental mode; otherwise as [`Self::run`]
    pub async fn refresh(&self, input: &AnalysisInput, cancel: &CancellationToken) -> Result<AnalysisReport> {
        let plan = self.plan(input)?;
        let Some(units_table) = plan.materialized_relation() else {
            return Err(Error::config(
                format!("experiment '{}'", input.experiment.id),
                "refresh requires incremental execution mode",
            ));
        };
        info!(
            experiment = %input.experiment.id,
            units_table,
            "refreshing analysis against materialized units"
        );
        let completed = AtomicUsize::new(0);
        let outputs = self.execute_analysis(&plan, input.settings.max_concurrency, cancel, &completed).await?;
        self.report(input, outputs).await
    }

    async fn execute_step(&self, step: &PlanStep, completed: &AtomicUsize) -> Result<Vec<RecordBatch>> {
        debug!(step = %step.name, phase = ?step.phase, "executing step");
        let batches = self
            .warehouse
            .execute(&step.sql, self.dialect)
            .await
            .map_err(|source| Error::WarehouseExecution {
                step: step.name.clone(),
                source,
            })?;
        completed.fetch_add(1, Ordering::SeqCst);
        debug!(step = %step.name, batches = batches.len(), "step finished");
        Ok(batches)
    }

    async fn execute_analysis<'p>(
        &self,
        plan: &'p ExecutionPlan,
        max_concurrency: usize,
        cancel: &CancellationToken,
        completed: &AtomicUsize,
    ) -> Result<Vec<StepOutput<'p>>> {
        if cancel.is_cancelled() {
            return Err(self.cancelled(completed).await);
        }
        let steps: Vec<&PlanStep> = plan.phase(Phase::Analysis).collect();
        let semaphore = Semaphore::new(max_concurrency.max(1));
        let failed = AtomicBool::new(false);

        let tasks = steps.iter().map(|&step| {
            let (semaphore, failed) = (&semaphore, &failed);
            async move {
                let _permit = match semaphore.acquire().await {
                    Ok(permit) => permit,
                    Err(closed) => return Err(limiter_closed(&closed, completed)),
                };
                if cancel.is_cancelled() || failed.load(Ordering::SeqCst) {
                    return Ok(None);
                }
                match self.execute_step(step, completed).await {
                    Ok(batches) => Ok(Some((step, batches))),
                    Err(e) => {
                        failed.store(true, Ordering::SeqCst);
                        Err(e)
                    }
                }
            }
        });

        let mut outputs = Vec::with_capacity(steps.len());
        let mut failure = None;
        for result in join_all(tasks).await {
            match result {
                Ok(Some(output)) => outputs.push(output),
                Ok(None) => {}
                Err(e) => {
                    failure.get_or_insert(e);
                }
            }
        }
        if let Some(e) = failure {
            warn!(error = %e, "analysis phase failed");
            return Err(e);
        }
        if outputs.len() < steps.len() {
            return Err(self.cancelled(completed).await);
        }
        Ok(outputs)
    }

    async fn cancelled(&self, completed: &AtomicUsize) -> Error {
        let completed_steps = completed.load(Ordering::SeqCst);
        warn!(completed_steps, "analysis cancelled");
        self.warehouse.cancel().await;
        Error::Cancelled { completed_steps }
    }

    async fn report(&self, input: &AnalysisInput, outputs: Vec<StepOutput<'_>>) -> Result<AnalysisReport> {
        let relative_accuracy = input.settings.quantile.relative_accuracy;
        let mut rows = Vec::new();
        let mut traffic = Vec::new();
        for (step, batches) in outputs {
            match &step.kind {
                StepKind::Metric(id) => {
                    let metric = input
                        .metric(id)
                        .ok_or_else(|| Error::Decode(format!("step '{}' names unknown metric '{id}'", step.name)))?;
                    rows.extend(decode_metric_rows(metric, &batches, relative_accuracy)?);
                }
                StepKind::Traffic => traffic = decode_traffic_rows(&batches)?,
                StepKind::DropUnits | StepKind::MaterializeUnits => {}
            }
        }

        let results = self.compute_cells(input, rows).await?;
        let health = health_report(input, &traffic);
        info!(
            experiment = %input.experiment.id,
            cells = results.len(),
            ok = results.iter().filter(|r| r.status().is_ok()).count(),
            healthy = !health.has_warnings(),
            "analysis complete"
        );
        Ok(AnalysisReport::new(&input.experiment.id, results, health))
    }

    /// Per-cell statistics run on the blocking pool when a tokio runtime is
    /// present, so the rayon fan-out never occupies an async worker
    async fn compute_cells(&self, input: &AnalysisInput, rows: Vec<AggregateRow>) -> Result<Vec<AnalysisResult>> {
        let dialect = self.dialect;
        if Handle::try_current().is_err() {
            return Ok(StatsEngine::new(input, dialect).analyze(&rows));
        }
        let input = input.clone();
        tokio::task::spawn_blocking(move || StatsEngine::new(&input, dialect).analyze(&rows))
            .await
            .map_err(|e| Error::StatisticalComputation(format!("statistics task did not finish: {e}")))
    }
}

/// A closed limiter ends the run like a cancellation
fn limiter_closed(error: &AcquireError, completed: &AtomicUsize) -> Error {
    let completed_steps = completed.load(Ordering::SeqCst);
    warn!(%error, completed_steps, "concurrency limiter closed");
    Error::Cancelled { completed_steps }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_closed_limiter_is_an_execution_failure() {
        let semaphore = Semaphore::new(1);
        semaphore.close();
        let closed = semaphore.acquire().await.unwrap_err();
        let completed = AtomicUsize::new(2);

        let error = limiter_closed(&closed, &completed);
        assert!(matches!(error, Error::Cancelled { completed_steps: 2 }));
        assert_eq!(error.stage(), "execution");
    }

    #[test]
    fn test_token_is_shared_between_clones() {
        let token = CancellationToken::new();
        let clone = token.clone();
        assert!(!clone.is_cancelled());
        token.cancel();
        assert!(clone.is_cancelled());
    }
}
