use super::dag::{GraphDefinition, NodeSpec};
use super::retry::{RetryDecision, RetryPolicy};
use super::state::{ExecutionState, NodeState};
use super::step_executor::{Dispatched, StepExecutor};
use crate::clock::{Clock, SystemClock};
use crate::config::EngineConfig;
use crate::error::{EngineError, Result};
use crate::handlers::{HandlerContext, HandlerRegistry};
use crate::scheduler;
use crate::storage::{ExecutionStore, StoredExecution};
use crate::types::{
    ExecutionError, ExecutionFilter, ExecutionId, ExecutionRecord, ExecutionStatus, GraphId,
    NodeError, NodeId, NodeStatus, TimeTrigger, TriggerId, TriggerSchedule, WorkerId,
};
use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

/// Result of one `advance` call
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepOutcome {
    Completed,
    Failed,
    Cancelled,
    Stalled,
    /// State moved forward; more work may be ready
    Progressed,
    /// Nothing could be done now
    Unchanged,
}

impl StepOutcome {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Completed | Self::Failed | Self::Cancelled | Self::Stalled
        )
    }

    fn terminal(status: ExecutionStatus) -> Option<Self> {
        match status {
            ExecutionStatus::Completed => Some(Self::Completed),
            ExecutionStatus::Failed => Some(Self::Failed),
            ExecutionStatus::Cancelled => Some(Self::Cancelled),
            ExecutionStatus::Stalled => Some(Self::Stalled),
            ExecutionStatus::Pending | ExecutionStatus::Running => None,
        }
    }
}

/// Read view of one execution
#[derive(Debug, Clone, Serialize)]
pub struct ExecutionDetail {
    #[serde(flatten)]
    pub record: ExecutionRecord,
    pub node_states: BTreeMap<NodeId, NodeState>,
    pub frontier: BTreeSet<NodeId>,
}

/// Drives executions forward against the shared store.
///
/// Every mutation of an execution's state goes through `advance`, which
/// requires the caller to hold the execution's lease.
pub struct ExecutionEngine {
    store: Arc<dyn ExecutionStore>,
    step_executor: StepExecutor,
    config: EngineConfig,
    clock: Arc<dyn Clock>,
    shutdown: CancellationToken,
}

impl ExecutionEngine {
    pub fn new(
        store: Arc<dyn ExecutionStore>,
        registry: Arc<HandlerRegistry>,
        config: EngineConfig,
    ) -> Self {
        let step_executor = StepExecutor::new(registry, config.default_timeout());
        Self {
            store,
            step_executor,
            config,
            clock: Arc::new(SystemClock),
            shutdown: CancellationToken::new(),
        }
    }

    /// Cancelling `shutdown` signals every in-flight handler through
    /// `HandlerContext::is_cancelled`.
    pub fn with_shutdown(mut self, shutdown: CancellationToken) -> Self {
        self.shutdown = shutdown;
        self
    }

    pub fn is_shutting_down(&self) -> bool {
        self.shutdown.is_cancelled()
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    pub fn store(&self) -> &Arc<dyn ExecutionStore> {
        &self.store
    }

    pub fn registry(&self) -> &Arc<HandlerRegistry> {
        self.step_executor.registry()
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn save_graph(&self, graph_id: &GraphId, graph: &GraphDefinition) -> Result<()> {
        self.registry().check_graph(graph)?;
        self.store.save_graph(graph_id, graph)?;
        tracing::info!(graph_id = %graph_id, "Saved graph definition");
        Ok(())
    }

    pub fn get_graph(&self, graph_id: &GraphId) -> Result<GraphDefinition> {
        self.store
            .get_graph(graph_id)?
            .ok_or_else(|| EngineError::NotFound(format!("graph {}", graph_id)))
    }

    /// Validate, snapshot the graph and persist a new execution with the
    /// entry node in its frontier.
    pub fn create_execution(
        &self,
        graph_id: &GraphId,
        graph: &GraphDefinition,
        trigger_payload: Value,
        start_after: Option<Duration>,
    ) -> Result<ExecutionRecord> {
        let stored =
            self.prepare_execution(graph_id, graph, trigger_payload, self.now(), start_after, None)?;
        self.store.insert_execution(&stored)?;

        tracing::info!(
            execution_id = %stored.record.execution_id,
            graph_id = %graph_id,
            status = %stored.record.status,
            "Created execution"
        );
        Ok(stored.record)
    }

    /// Start an execution of a stored graph
    pub fn start_execution(
        &self,
        graph_id: &GraphId,
        trigger_payload: Value,
        start_after: Option<Duration>,
    ) -> Result<ExecutionRecord> {
        let graph = self.get_graph(graph_id)?;
        self.create_execution(graph_id, &graph, trigger_payload, start_after)
    }

    fn prepare_execution(
        &self,
        graph_id: &GraphId,
        graph: &GraphDefinition,
        trigger_payload: Value,
        now: DateTime<Utc>,
        start_after: Option<Duration>,
        trigger_id: Option<TriggerId>,
    ) -> Result<StoredExecution> {
        self.registry().check_graph(graph)?;

        let delay = start_after.filter(|d| *d > Duration::zero());
        let scheduled_at = now
            .checked_add_signed(delay.unwrap_or_else(Duration::zero))
            .ok_or_else(|| EngineError::validation("start delay is out of range"))?;
        let record = ExecutionRecord {
            execution_id: ExecutionId::new(),
            graph_definition_id: graph_id.clone(),
            status: if delay.is_some() {
                ExecutionStatus::Pending
            } else {
                ExecutionStatus::Running
            },
            trigger_payload,
            created_at: now,
            updated_at: now,
            scheduled_at,
            lease_owner: None,
            lease_expires_at: None,
            cancel_requested: false,
            wake_at: None,
            error: None,
            trigger_id,
        };

        Ok(StoredExecution {
            record,
            state: ExecutionState::new(graph),
            graph: graph.clone(),
        })
    }

    pub fn get_execution(&self, execution_id: ExecutionId) -> Result<ExecutionDetail> {
        let stored = self
            .store
            .get_execution(execution_id)?
            .ok_or_else(|| EngineError::NotFound(format!("execution {}", execution_id)))?;
        Ok(ExecutionDetail {
            record: stored.record,
            node_states: stored.state.node_states,
            frontier: stored.state.frontier,
        })
    }

    pub fn list_executions(&self, filter: &ExecutionFilter) -> Result<Vec<ExecutionRecord>> {
        self.store.list_executions(filter)
    }

    /// Request cancellation. In-flight handlers see it on their cancellation
    /// token at the next heartbeat; the next `advance` moves the execution
    /// to `cancelled`.
    pub fn cancel(&self, execution_id: ExecutionId) -> Result<ExecutionRecord> {
        let now = self.now();
        let stored = self.store.update_execution(execution_id, &mut |stored| {
            if stored.record.is_terminal() {
                return Err(EngineError::InvalidState(format!(
                    "execution {} is already {}",
                    execution_id, stored.record.status
                )));
            }
            stored.record.cancel_requested = true;
            stored.record.updated_at = now;
            Ok(())
        })?;

        tracing::info!(execution_id = %execution_id, "Cancellation requested");
        Ok(stored.record)
    }

    /// Operator recovery: grant a failed node one more attempt and reopen
    /// the execution if it had already ended.
    pub fn retry_node(&self, execution_id: ExecutionId, node_id: &NodeId) -> Result<ExecutionRecord> {
        let now = self.now();
        let stored = self.store.update_execution(execution_id, &mut |stored| {
            if let (true, Some(holder)) = (
                stored.record.lease_is_live(now),
                stored.record.lease_owner.clone(),
            ) {
                return Err(EngineError::LeaseConflict {
                    execution_id,
                    owner: holder,
                });
            }
            if matches!(
                stored.record.status,
                ExecutionStatus::Completed | ExecutionStatus::Cancelled
            ) {
                return Err(EngineError::InvalidState(format!(
                    "execution {} is {}",
                    execution_id, stored.record.status
                )));
            }

            let node = stored.state.node_mut(node_id).ok_or_else(|| {
                EngineError::NotFound(format!("node {} in execution {}", node_id, execution_id))
            })?;
            if node.status != NodeStatus::Failed {
                return Err(EngineError::InvalidState(format!(
                    "node {} is {:?}, only failed nodes can be retried",
                    node_id, node.status
                )));
            }
            node.extra_attempts += 1;
            node.status = NodeStatus::RetryPending;
            node.next_retry_at = Some(now);

            stored.record.error = None;
            stored.record.wake_at = None;
            stored.record.updated_at = now;
            if matches!(
                stored.record.status,
                ExecutionStatus::Failed | ExecutionStatus::Stalled
            ) {
                stored.record.status = ExecutionStatus::Running;
            }
            Ok(())
        })?;

        tracing::info!(
            execution_id = %execution_id,
            node_id = %node_id,
            "Granted manual retry"
        );
        Ok(stored.record)
    }

    /// One scheduling step. The caller must hold the lease.
    pub async fn advance(&self, execution_id: ExecutionId, owner: &WorkerId) -> Result<StepOutcome> {
        let ttl = self.config.lease_ttl();
        let mut now = self.now();
        let mut stored = self
            .store
            .get_execution(execution_id)?
            .ok_or_else(|| EngineError::NotFound(format!("execution {}", execution_id)))?;

        match &stored.record.lease_owner {
            Some(holder) if holder == owner => {}
            Some(holder) => {
                return Err(EngineError::LeaseConflict {
                    execution_id,
                    owner: holder.clone(),
                })
            }
            None => {
                return Err(EngineError::InvalidState(format!(
                    "execution {} is not leased by {}",
                    execution_id, owner
                )))
            }
        }

        if let Some(outcome) = StepOutcome::terminal(stored.record.status) {
            return Ok(outcome);
        }

        if stored.record.cancel_requested {
            return self.finish_cancelled(owner, stored, now).await;
        }

        let initial_status = stored.record.status;
        let initial_wake = stored.record.wake_at;

        if stored.record.status == ExecutionStatus::Pending {
            if stored.record.scheduled_at > now {
                return Ok(StepOutcome::Unchanged);
            }
            stored.record.status = ExecutionStatus::Running;
        }

        let woke = stored
            .state
            .complete_due_waits(&stored.graph, now, true);
        let mut progressed = !woke.is_empty();

        let cancel = self.shutdown.child_token();
        let (dispatches, failed_early) = self.begin_ready_nodes(&mut stored, now, &cancel);
        progressed |= failed_early;

        if !dispatches.is_empty() {
            // Persist the running marks before any handler is called
            stored.record.updated_at = now;
            stored.record = self.store.commit(owner, &stored, now, ttl)?;
            if stored.record.cancel_requested {
                cancel.cancel();
            }

            let results = self
                .dispatch(execution_id, owner, &dispatches, &cancel)
                .await;
            now = self.now();

            let cancelled = stored.record.cancel_requested
                || self
                    .store
                    .get_record(execution_id)?
                    .map_or(false, |r| r.cancel_requested);

            for ((spec, _), result) in dispatches.iter().zip(results) {
                self.apply_result(&mut stored, spec, result, now, !cancelled);
            }
            progressed = true;

            if cancelled {
                stored.record.cancel_requested = true;
                return self.finish_cancelled(owner, stored, now).await;
            }
        }

        let StoredExecution {
            record,
            state,
            graph,
        } = &mut stored;

        if let Some(status) = state.evaluate(graph) {
            record.status = status;
            record.wake_at = None;
            match status {
                ExecutionStatus::Stalled if record.error.is_none() => {
                    record.error = Some(ExecutionError {
                        node_id: None,
                        kind: "stalled".to_string(),
                        message: EngineError::Stalled(execution_id).to_string(),
                    });
                }
                ExecutionStatus::Failed if record.error.is_none() => {
                    record.error = first_failure(state);
                }
                _ => {}
            }
        } else {
            record.wake_at = state.wake_at();
        }

        let changed =
            progressed || record.status != initial_status || record.wake_at != initial_wake;
        if !changed {
            return Ok(StepOutcome::Unchanged);
        }

        record.updated_at = now;
        let committed = self.store.commit(owner, &stored, now, ttl)?;

        match StepOutcome::terminal(committed.status) {
            Some(outcome) => {
                log_terminal(&committed);
                Ok(outcome)
            }
            None if progressed || committed.status != initial_status => Ok(StepOutcome::Progressed),
            None => Ok(StepOutcome::Unchanged),
        }
    }

    /// Run handlers concurrently, renewing the lease until all of them return
    async fn dispatch(
        &self,
        execution_id: ExecutionId,
        owner: &WorkerId,
        dispatches: &[(NodeSpec, HandlerContext)],
        cancel: &CancellationToken,
    ) -> Vec<Result<Dispatched>> {
        let handlers = futures::future::join_all(
            dispatches
                .iter()
                .map(|(spec, ctx)| self.step_executor.execute(spec, ctx)),
        );
        tokio::pin!(handlers);

        let period = self.config.heartbeat_interval();
        let mut heartbeat = tokio::time::interval_at(Instant::now() + period, period);
        heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                results = &mut handlers => return results,
                _ = heartbeat.tick() => self.heartbeat(execution_id, owner, cancel),
            }
        }
    }

    fn heartbeat(&self, execution_id: ExecutionId, owner: &WorkerId, cancel: &CancellationToken) {
        match self
            .store
            .renew_lease(execution_id, owner, self.now(), self.config.lease_ttl())
        {
            Ok(record) if record.cancel_requested && !cancel.is_cancelled() => {
                tracing::info!(
                    execution_id = %execution_id,
                    "Signalling cancellation to running handlers"
                );
                cancel.cancel();
            }
            Ok(_) => {}
            Err(err) => tracing::warn!(
                execution_id = %execution_id,
                error = %err,
                "Lease renewal failed"
            ),
        }
    }

    /// Move every ready node to `running` and build its dispatch context.
    /// Nodes that may not run again fail here without a dispatch; the flag
    /// reports whether that happened.
    fn begin_ready_nodes(
        &self,
        stored: &mut StoredExecution,
        now: DateTime<Utc>,
        cancel: &CancellationToken,
    ) -> (Vec<(NodeSpec, HandlerContext)>, bool) {
        let StoredExecution {
            record,
            state,
            graph,
        } = stored;

        let ready = state.take_ready(now);
        let mut admitted = Vec::with_capacity(ready.len());
        let mut failed_early = false;

        for node_id in ready {
            let (Some(spec), Some(node)) = (graph.node(&node_id), state.node(&node_id)) else {
                continue;
            };

            if node.status == NodeStatus::Running {
                if node.attempt_count >= RetryPolicy::new(spec).attempt_cap(node) {
                    let error = NodeError::permanent(
                        "abandoned",
                        format!(
                            "attempt {} was interrupted and no attempts remain",
                            node.attempt_count
                        ),
                    );
                    tracing::warn!(
                        execution_id = %record.execution_id,
                        node_id = %node_id,
                        "Node abandoned by a previous lease holder"
                    );
                    note_failure(record, &node_id, &error);
                    state.record_failure(&node_id, error, now);
                    failed_early = true;
                    continue;
                }
                tracing::warn!(
                    execution_id = %record.execution_id,
                    node_id = %node_id,
                    attempt = node.attempt_count,
                    "Re-dispatching node left running by a previous lease holder"
                );
            }

            if let Some(max) = spec.max_iterations {
                if node.iteration > max {
                    let error = NodeError::permanent(
                        "iteration_limit",
                        format!("loop head entered {} times, limit is {}", node.iteration, max),
                    );
                    tracing::warn!(
                        execution_id = %record.execution_id,
                        node_id = %node_id,
                        "Loop iteration limit reached"
                    );
                    note_failure(record, &node_id, &error);
                    state.record_failure(&node_id, error, now);
                    failed_early = true;
                    continue;
                }
            }

            admitted.push((spec.clone(), node_id));
        }

        let prior_outputs = state.prior_outputs();
        let mut dispatches = Vec::with_capacity(admitted.len());
        for (spec, node_id) in admitted {
            let attempt = state.begin_attempt(&node_id, now);
            let iteration = state.node(&node_id).map_or(1, |n| n.iteration);
            let ctx = HandlerContext {
                execution_id: record.execution_id,
                node_id: node_id.clone(),
                attempt,
                iteration,
                trigger_payload: record.trigger_payload.clone(),
                prior_outputs: prior_outputs.clone(),
                upstream: state.upstream_of(graph, &node_id),
                now,
                cancel: cancel.clone(),
            };
            dispatches.push((spec, ctx));
        }

        (dispatches, failed_early)
    }

    fn apply_result(
        &self,
        stored: &mut StoredExecution,
        spec: &NodeSpec,
        result: Result<Dispatched>,
        now: DateTime<Utc>,
        expand: bool,
    ) {
        let StoredExecution {
            record,
            state,
            graph,
        } = stored;
        let node_id = &spec.node_id;

        match result {
            Ok(Dispatched::Completed(output)) => {
                tracing::info!(
                    execution_id = %record.execution_id,
                    node_id = %node_id,
                    "Node completed"
                );
                state.record_success(graph, node_id, output, now, expand);
            }
            Ok(Dispatched::Suspended { until, output }) => {
                tracing::info!(
                    execution_id = %record.execution_id,
                    node_id = %node_id,
                    until = %until,
                    "Node waiting"
                );
                state.record_suspended(node_id, output, until, now);
            }
            Err(err) => {
                let error = err.to_node_error(spec.timeout_retriable);
                let decision = match state.node(node_id) {
                    Some(node) => RetryPolicy::new(spec).decide(node, &error, now),
                    None => RetryDecision::GiveUp,
                };

                match decision {
                    RetryDecision::Retry { at } => {
                        tracing::info!(
                            execution_id = %record.execution_id,
                            node_id = %node_id,
                            error = %error,
                            retry_at = %at,
                            "Retry scheduled"
                        );
                        state.record_retry(node_id, error, at, now);
                    }
                    RetryDecision::GiveUp => {
                        tracing::warn!(
                            execution_id = %record.execution_id,
                            node_id = %node_id,
                            error = %error,
                            "Node failed"
                        );
                        note_failure(record, node_id, &error);
                        state.record_failure(node_id, error, now);
                    }
                }
            }
        }
    }

    async fn finish_cancelled(
        &self,
        owner: &WorkerId,
        mut stored: StoredExecution,
        now: DateTime<Utc>,
    ) -> Result<StepOutcome> {
        stored.record.status = ExecutionStatus::Cancelled;
        stored.record.wake_at = None;
        stored.record.updated_at = now;
        let committed = self
            .store
            .commit(owner, &stored, now, self.config.lease_ttl())?;
        log_terminal(&committed);
        Ok(StepOutcome::Cancelled)
    }

    pub fn create_trigger(
        &self,
        graph_id: &GraphId,
        trigger_payload: Value,
        schedule: TriggerSchedule,
        first_fire_at: Option<DateTime<Utc>>,
    ) -> Result<TimeTrigger> {
        scheduler::validate_schedule(&schedule)?;
        self.get_graph(graph_id)?;

        let now = self.now();
        let next_fire_at = match first_fire_at {
            Some(at) => at,
            None => scheduler::next_fire_after(&schedule, now)?.unwrap_or(now),
        };

        let trigger = TimeTrigger {
            id: TriggerId::new(),
            graph_definition_id: graph_id.clone(),
            trigger_payload,
            schedule,
            next_fire_at,
            enabled: true,
            last_fired_at: None,
            last_execution_id: None,
            created_at: now,
        };
        self.store.save_trigger(&trigger)?;

        tracing::info!(
            trigger_id = %trigger.id,
            graph_id = %graph_id,
            next_fire_at = %trigger.next_fire_at,
            "Created time trigger"
        );
        Ok(trigger)
    }

    pub fn list_triggers(&self) -> Result<Vec<TimeTrigger>> {
        self.store.list_triggers()
    }

    pub fn set_trigger_enabled(&self, trigger_id: TriggerId, enabled: bool) -> Result<TimeTrigger> {
        let mut trigger = self
            .store
            .get_trigger(trigger_id)?
            .ok_or_else(|| EngineError::NotFound(format!("trigger {}", trigger_id)))?;

        let now = self.now();
        if enabled && !trigger.enabled && trigger.next_fire_at < now {
            if let Some(next) = scheduler::next_fire_after(&trigger.schedule, now)? {
                trigger.next_fire_at = next;
            }
        }
        trigger.enabled = enabled;
        self.store.save_trigger(&trigger)?;

        tracing::info!(trigger_id = %trigger_id, enabled, "Updated time trigger");
        Ok(trigger)
    }

    /// Start one execution for every due trigger. Each fire time starts at
    /// most one execution no matter how many workers race for it.
    pub fn fire_due_triggers(&self, now: DateTime<Utc>, limit: usize) -> Result<Vec<ExecutionId>> {
        let mut started = Vec::new();

        for trigger in self.store.due_triggers(now, limit)? {
            let prepared = self
                .store
                .get_graph(&trigger.graph_definition_id)?
                .ok_or_else(|| {
                    EngineError::NotFound(format!("graph {}", trigger.graph_definition_id))
                })
                .and_then(|graph| {
                    self.prepare_execution(
                        &trigger.graph_definition_id,
                        &graph,
                        trigger.trigger_payload.clone(),
                        now,
                        None,
                        Some(trigger.id),
                    )
                });

            let stored = match prepared {
                Ok(stored) => stored,
                Err(err @ (EngineError::NotFound(_) | EngineError::Validation(_))) => {
                    tracing::warn!(
                        trigger_id = %trigger.id,
                        error = %err,
                        "Disabling trigger that cannot start its graph"
                    );
                    let mut disabled = trigger.clone();
                    disabled.enabled = false;
                    self.store.save_trigger(&disabled)?;
                    continue;
                }
                Err(err) => return Err(err),
            };

            let mut updated = trigger.clone();
            updated.last_fired_at = Some(now);
            updated.last_execution_id = Some(stored.record.execution_id);
            match scheduler::next_fire_time(&trigger.schedule, trigger.next_fire_at, now)? {
                Some(next) => updated.next_fire_at = next,
                None => updated.enabled = false,
            }

            if self
                .store
                .fire_trigger(&updated, trigger.next_fire_at, &stored)?
            {
                tracing::info!(
                    trigger_id = %trigger.id,
                    execution_id = %stored.record.execution_id,
                    fire_time = %trigger.next_fire_at,
                    "Time trigger fired"
                );
                started.push(stored.record.execution_id);
            } else {
                tracing::debug!(trigger_id = %trigger.id, "Trigger already fired by another worker");
            }
        }

        Ok(started)
    }
}

/// Keep the first permanent error on the record
fn note_failure(record: &mut ExecutionRecord, node_id: &NodeId, error: &NodeError) {
    if record.error.is_none() {
        record.error = Some(ExecutionError {
            node_id: Some(node_id.clone()),
            kind: error.kind.clone(),
            message: error.message.clone(),
        });
    }
}

fn first_failure(state: &ExecutionState) -> Option<ExecutionError> {
    state
        .node_states
        .iter()
        .find(|(_, n)| n.status == NodeStatus::Failed)
        .map(|(id, n)| ExecutionError {
            node_id: Some(id.clone()),
            kind: n.error.as_ref().map_or("failed".to_string(), |e| e.kind.clone()),
            message: n.error.as_ref().map_or(String::new(), |e| e.message.clone()),
        })
}

fn log_terminal(record: &ExecutionRecord) {
    match record.status {
        ExecutionStatus::Completed | ExecutionStatus::Cancelled => tracing::info!(
            execution_id = %record.execution_id,
            status = %record.status,
            "Execution finished"
        ),
        _ => tracing::warn!(
            execution_id = %record.execution_id,
            status = %record.status,
            error = ?record.error,
            "Execution finished"
        ),
    }
}
