use super::{
    apply_claim, apply_renewal, is_pending_cancellation, merge_commit, needs_attention,
    sort_and_limit,
    ExecutionStore, StoredExecution,
};
use crate::error::{EngineError, Result};
use crate::types::{
    ExecutionFilter, ExecutionId, ExecutionRecord, GraphId, TimeTrigger, TriggerId, WorkerId,
};
use crate::workflow::dag::GraphDefinition;
use anyhow::anyhow;
use chrono::{DateTime, Duration, Utc};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

#[derive(Default)]
struct Inner {
    graphs: HashMap<GraphId, GraphDefinition>,
    executions: HashMap<ExecutionId, StoredExecution>,
    triggers: HashMap<TriggerId, TimeTrigger>,
}

/// Store kept in process memory, for tests and embedded use.
///
/// One lock covers everything, so every operation is a single atomic step.
#[derive(Clone, Default)]
pub struct MemoryStore {
    inner: Arc<Mutex<Inner>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> Result<MutexGuard<'_, Inner>> {
        self.inner
            .lock()
            .map_err(|_| EngineError::Storage(anyhow!("memory store lock poisoned")))
    }
}

fn not_found(execution_id: ExecutionId) -> EngineError {
    EngineError::NotFound(format!("execution {}", execution_id))
}

impl ExecutionStore for MemoryStore {
    fn save_graph(&self, graph_id: &GraphId, graph: &GraphDefinition) -> Result<()> {
        self.lock()?.graphs.insert(graph_id.clone(), graph.clone());
        Ok(())
    }

    fn get_graph(&self, graph_id: &GraphId) -> Result<Option<GraphDefinition>> {
        Ok(self.lock()?.graphs.get(graph_id).cloned())
    }

    fn insert_execution(&self, execution: &StoredExecution) -> Result<()> {
        self.lock()?
            .executions
            .insert(execution.record.execution_id, execution.clone());
        Ok(())
    }

    fn get_execution(&self, execution_id: ExecutionId) -> Result<Option<StoredExecution>> {
        Ok(self.lock()?.executions.get(&execution_id).cloned())
    }

    fn get_record(&self, execution_id: ExecutionId) -> Result<Option<ExecutionRecord>> {
        Ok(self
            .lock()?
            .executions
            .get(&execution_id)
            .map(|e| e.record.clone()))
    }

    fn list_executions(&self, filter: &ExecutionFilter) -> Result<Vec<ExecutionRecord>> {
        let mut records: Vec<ExecutionRecord> = self
            .lock()?
            .executions
            .values()
            .filter(|e| filter.matches(&e.record))
            .map(|e| e.record.clone())
            .collect();
        sort_and_limit(&mut records, filter);
        Ok(records)
    }

    fn due_executions(&self, now: DateTime<Utc>, limit: usize) -> Result<Vec<ExecutionId>> {
        let guard = self.lock()?;
        let mut due: Vec<&ExecutionRecord> = guard
            .executions
            .values()
            .map(|e| &e.record)
            .filter(|r| needs_attention(r, now))
            .collect();
        due.sort_by_key(|r| (r.created_at, r.execution_id));
        Ok(due.into_iter().take(limit).map(|r| r.execution_id).collect())
    }

    fn pending_cancellations(
        &self,
        now: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<ExecutionId>> {
        let guard = self.lock()?;
        let mut pending: Vec<&ExecutionRecord> = guard
            .executions
            .values()
            .map(|e| &e.record)
            .filter(|r| is_pending_cancellation(r, now))
            .collect();
        pending.sort_by_key(|r| (r.created_at, r.execution_id));
        Ok(pending
            .into_iter()
            .take(limit)
            .map(|r| r.execution_id)
            .collect())
    }

    fn try_claim(
        &self,
        execution_id: ExecutionId,
        owner: &WorkerId,
        now: DateTime<Utc>,
        ttl: Duration,
    ) -> Result<StoredExecution> {
        let mut guard = self.lock()?;
        let stored = guard
            .executions
            .get_mut(&execution_id)
            .ok_or_else(|| not_found(execution_id))?;
        apply_claim(&mut stored.record, owner, now, ttl)?;
        Ok(stored.clone())
    }

    fn commit(
        &self,
        owner: &WorkerId,
        execution: &StoredExecution,
        now: DateTime<Utc>,
        ttl: Duration,
    ) -> Result<ExecutionRecord> {
        let execution_id = execution.record.execution_id;
        let mut guard = self.lock()?;
        let stored = guard
            .executions
            .get_mut(&execution_id)
            .ok_or_else(|| not_found(execution_id))?;

        let record = merge_commit(&stored.record, &execution.record, owner, now, ttl)?;
        stored.record = record.clone();
        stored.state = execution.state.clone();
        Ok(record)
    }

    fn renew_lease(
        &self,
        execution_id: ExecutionId,
        owner: &WorkerId,
        now: DateTime<Utc>,
        ttl: Duration,
    ) -> Result<ExecutionRecord> {
        let mut guard = self.lock()?;
        let stored = guard
            .executions
            .get_mut(&execution_id)
            .ok_or_else(|| not_found(execution_id))?;
        apply_renewal(&mut stored.record, owner, now, ttl)?;
        Ok(stored.record.clone())
    }

    fn release(&self, execution_id: ExecutionId, owner: &WorkerId) -> Result<()> {
        let mut guard = self.lock()?;
        if let Some(stored) = guard.executions.get_mut(&execution_id) {
            if stored.record.lease_owner.as_ref() == Some(owner) {
                stored.record.lease_owner = None;
                stored.record.lease_expires_at = None;
            }
        }
        Ok(())
    }

    fn update_execution(
        &self,
        execution_id: ExecutionId,
        apply: &mut dyn FnMut(&mut StoredExecution) -> Result<()>,
    ) -> Result<StoredExecution> {
        let mut guard = self.lock()?;
        let stored = guard
            .executions
            .get_mut(&execution_id)
            .ok_or_else(|| not_found(execution_id))?;

        // Work on a copy so a rejected update leaves no trace
        let mut updated = stored.clone();
        apply(&mut updated)?;
        *stored = updated.clone();
        Ok(updated)
    }

    fn save_trigger(&self, trigger: &TimeTrigger) -> Result<()> {
        self.lock()?.triggers.insert(trigger.id, trigger.clone());
        Ok(())
    }

    fn get_trigger(&self, trigger_id: TriggerId) -> Result<Option<TimeTrigger>> {
        Ok(self.lock()?.triggers.get(&trigger_id).cloned())
    }

    fn list_triggers(&self) -> Result<Vec<TimeTrigger>> {
        let mut triggers: Vec<TimeTrigger> = self.lock()?.triggers.values().cloned().collect();
        triggers.sort_by_key(|t| (t.created_at, t.id));
        Ok(triggers)
    }

    fn due_triggers(&self, now: DateTime<Utc>, limit: usize) -> Result<Vec<TimeTrigger>> {
        let mut due: Vec<TimeTrigger> = self
            .lock()?
            .triggers
            .values()
            .filter(|t| t.is_due(now))
            .cloned()
            .collect();
        due.sort_by_key(|t| (t.next_fire_at, t.id));
        due.truncate(limit);
        Ok(due)
    }

    fn fire_trigger(
        &self,
        updated: &TimeTrigger,
        expected_fire_at: DateTime<Utc>,
        execution: &StoredExecution,
    ) -> Result<bool> {
        let mut guard = self.lock()?;
        let current = guard
            .triggers
            .get(&updated.id)
            .ok_or_else(|| EngineError::NotFound(format!("trigger {}", updated.id)))?;
        if !current.enabled || current.next_fire_at != expected_fire_at {
            return Ok(false);
        }

        guard.triggers.insert(updated.id, updated.clone());
        guard
            .executions
            .insert(execution.record.execution_id, execution.clone());
        Ok(true)
    }
}
