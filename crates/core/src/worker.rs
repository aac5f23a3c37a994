//! Polling worker: claims due executions, steps them, releases them.

use crate::config::WorkerConfig;
use crate::error::{EngineError, Result};
use crate::types::{ExecutionId, WorkerId};
use crate::workflow::executor::{ExecutionEngine, StepOutcome};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// Counters for one poll cycle
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CycleReport {
    pub triggers_fired: usize,
    pub claimed: usize,
    /// Claims lost to another worker
    pub conflicts: usize,
    pub steps: usize,
    pub finished: usize,
    pub cancelled: usize,
}

pub struct Worker {
    id: WorkerId,
    engine: Arc<ExecutionEngine>,
    config: WorkerConfig,
}

impl Worker {
    pub fn new(engine: Arc<ExecutionEngine>, config: WorkerConfig) -> Self {
        Self::with_id(WorkerId::generate(), engine, config)
    }

    pub fn with_id(id: WorkerId, engine: Arc<ExecutionEngine>, config: WorkerConfig) -> Self {
        Self { id, engine, config }
    }

    pub fn id(&self) -> &WorkerId {
        &self.id
    }

    /// Poll until `shutdown` fires. A failed cycle is logged and the next
    /// tick tries again.
    pub async fn run(self, shutdown: CancellationToken) {
        tracing::info!(
            worker_id = %self.id,
            poll_interval_ms = self.config.poll_interval_ms,
            batch_size = self.config.batch_size,
            "Worker started"
        );

        loop {
            match self.run_cycle().await {
                Ok(report) if report != CycleReport::default() => {
                    tracing::debug!(worker_id = %self.id, ?report, "Worker cycle finished");
                }
                Ok(_) => {}
                Err(e) => {
                    tracing::error!(worker_id = %self.id, error = %e, "Worker cycle failed");
                }
            }

            tokio::select! {
                _ = shutdown.cancelled() => {
                    tracing::info!(worker_id = %self.id, "Worker shutting down");
                    break;
                }
                _ = tokio::time::sleep(self.config.poll_interval()) => {}
            }
        }
    }

    /// One claim / step / signal cycle. Each phase reads the engine clock.
    pub async fn run_cycle(&self) -> Result<CycleReport> {
        let mut report = CycleReport::default();
        let store = self.engine.store();
        let batch = self.config.batch_size;

        report.triggers_fired = self
            .engine
            .fire_due_triggers(self.engine.now(), batch)?
            .len();

        for execution_id in store.due_executions(self.engine.now(), batch)? {
            self.process(execution_id, &mut report).await?;
        }

        // Cancellations whose lease holder went away during the cycle
        for execution_id in store.pending_cancellations(self.engine.now(), batch)? {
            self.process(execution_id, &mut report).await?;
        }

        Ok(report)
    }

    /// Claim one execution, step it until it settles, release it.
    ///
    /// Losing the claim is not an error; the report counts it.
    pub async fn process(
        &self,
        execution_id: ExecutionId,
        report: &mut CycleReport,
    ) -> Result<Option<StepOutcome>> {
        let store = self.engine.store();
        let ttl = self.engine.config().lease_ttl();

        match store.try_claim(execution_id, &self.id, self.engine.now(), ttl) {
            Ok(_) => report.claimed += 1,
            Err(EngineError::LeaseConflict { owner, .. }) => {
                tracing::debug!(
                    worker_id = %self.id,
                    execution_id = %execution_id,
                    holder = %owner,
                    "Execution already leased, skipping"
                );
                report.conflicts += 1;
                return Ok(None);
            }
            Err(EngineError::InvalidState(reason)) => {
                tracing::debug!(execution_id = %execution_id, %reason, "Skipping execution");
                return Ok(None);
            }
            Err(e) => return Err(e),
        }

        tracing::debug!(worker_id = %self.id, execution_id = %execution_id, "Claimed execution");

        let mut last = StepOutcome::Unchanged;
        for _ in 0..self.config.max_steps_per_claim.max(1) {
            match self.engine.advance(execution_id, &self.id).await {
                Ok(outcome) => {
                    report.steps += 1;
                    last = outcome;
                    if outcome.is_terminal() {
                        report.finished += 1;
                        if outcome == StepOutcome::Cancelled {
                            report.cancelled += 1;
                        }
                        break;
                    }
                    if outcome == StepOutcome::Unchanged {
                        break;
                    }
                }
                Err(e) => {
                    tracing::warn!(
                        worker_id = %self.id,
                        execution_id = %execution_id,
                        error = %e,
                        "Advance failed"
                    );
                    break;
                }
            }
        }

        store.release(execution_id, &self.id)?;
        Ok(Some(last))
    }
}
