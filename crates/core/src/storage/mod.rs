//! Persistence for graphs, executions and time triggers.
//!
//! Every state-changing decision the engine makes is paired with a
//! conditional write on the lease owner; the helpers at the bottom hold
//! those rules so each backend applies them identically.

mod memory;
mod redb_store;

pub use memory::MemoryStore;
pub use redb_store::RedbStore;

use crate::error::{EngineError, Result};
use crate::types::{
    ExecutionFilter, ExecutionId, ExecutionRecord, GraphId, TimeTrigger, TriggerId, WorkerId,
};
use crate::workflow::dag::GraphDefinition;
use crate::workflow::state::ExecutionState;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

/// One execution as persisted: header, mutable state, graph snapshot
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoredExecution {
    pub record: ExecutionRecord,
    pub state: ExecutionState,
    pub graph: GraphDefinition,
}

/// Shared store behind the engine and every worker
pub trait ExecutionStore: Send + Sync {
    fn save_graph(&self, graph_id: &GraphId, graph: &GraphDefinition) -> Result<()>;

    fn get_graph(&self, graph_id: &GraphId) -> Result<Option<GraphDefinition>>;

    fn insert_execution(&self, execution: &StoredExecution) -> Result<()>;

    fn get_execution(&self, execution_id: ExecutionId) -> Result<Option<StoredExecution>>;

    fn get_record(&self, execution_id: ExecutionId) -> Result<Option<ExecutionRecord>>;

    /// Matching records, newest first
    fn list_executions(&self, filter: &ExecutionFilter) -> Result<Vec<ExecutionRecord>>;

    /// Executions a worker should claim now, oldest first
    fn due_executions(&self, now: DateTime<Utc>, limit: usize) -> Result<Vec<ExecutionId>>;

    /// Non-terminal executions with a cancel request and no live lease
    fn pending_cancellations(&self, now: DateTime<Utc>, limit: usize)
        -> Result<Vec<ExecutionId>>;

    /// Take the lease if it is free, expired or already ours.
    ///
    /// Fails with `LeaseConflict` when another worker holds a live lease and
    /// `InvalidState` when the execution is terminal; neither mutates.
    fn try_claim(
        &self,
        execution_id: ExecutionId,
        owner: &WorkerId,
        now: DateTime<Utc>,
        ttl: Duration,
    ) -> Result<StoredExecution>;

    /// Write record and state if `owner` still holds the lease, renewing it.
    ///
    /// A cancel request recorded since the claim is preserved.
    fn commit(
        &self,
        owner: &WorkerId,
        execution: &StoredExecution,
        now: DateTime<Utc>,
        ttl: Duration,
    ) -> Result<ExecutionRecord>;

    /// Extend the lease `owner` holds without touching state, returning the
    /// current record so the caller sees cancel requests made meanwhile
    fn renew_lease(
        &self,
        execution_id: ExecutionId,
        owner: &WorkerId,
        now: DateTime<Utc>,
        ttl: Duration,
    ) -> Result<ExecutionRecord>;

    /// Drop the lease if `owner` holds it
    fn release(&self, execution_id: ExecutionId, owner: &WorkerId) -> Result<()>;

    /// Read-modify-write of one execution outside the lease protocol
    fn update_execution(
        &self,
        execution_id: ExecutionId,
        apply: &mut dyn FnMut(&mut StoredExecution) -> Result<()>,
    ) -> Result<StoredExecution>;

    fn save_trigger(&self, trigger: &TimeTrigger) -> Result<()>;

    fn get_trigger(&self, trigger_id: TriggerId) -> Result<Option<TimeTrigger>>;

    fn list_triggers(&self) -> Result<Vec<TimeTrigger>>;

    fn due_triggers(&self, now: DateTime<Utc>, limit: usize) -> Result<Vec<TimeTrigger>>;

    /// Advance a trigger and insert the execution it starts, atomically, if
    /// its `next_fire_at` still equals `expected_fire_at`. Returns whether
    /// this caller fired it.
    fn fire_trigger(
        &self,
        updated: &TimeTrigger,
        expected_fire_at: DateTime<Utc>,
        execution: &StoredExecution,
    ) -> Result<bool>;
}

/// Whether the claim phase should look at this record at all
pub(crate) fn needs_attention(record: &ExecutionRecord, now: DateTime<Utc>) -> bool {
    record.is_due(now) || is_pending_cancellation(record, now)
}

pub(crate) fn is_pending_cancellation(record: &ExecutionRecord, now: DateTime<Utc>) -> bool {
    record.cancel_requested && !record.is_terminal() && !record.lease_is_live(now)
}

pub(crate) fn apply_claim(
    record: &mut ExecutionRecord,
    owner: &WorkerId,
    now: DateTime<Utc>,
    ttl: Duration,
) -> Result<()> {
    if record.is_terminal() {
        return Err(EngineError::InvalidState(format!(
            "execution {} is already {}",
            record.execution_id, record.status
        )));
    }
    if !record.claimable_by(owner, now) {
        return Err(EngineError::LeaseConflict {
            execution_id: record.execution_id,
            owner: record
                .lease_owner
                .clone()
                .unwrap_or_else(|| owner.clone()),
        });
    }
    record.lease_owner = Some(owner.clone());
    record.lease_expires_at = Some(now + ttl);
    Ok(())
}

fn check_owner(current: &ExecutionRecord, owner: &WorkerId) -> Result<()> {
    match &current.lease_owner {
        Some(holder) if holder == owner => Ok(()),
        Some(holder) => Err(EngineError::LeaseConflict {
            execution_id: current.execution_id,
            owner: holder.clone(),
        }),
        None => Err(EngineError::InvalidState(format!(
            "execution {} is not leased by {}",
            current.execution_id, owner
        ))),
    }
}

/// Push the lease expiry out if `owner` still holds it
pub(crate) fn apply_renewal(
    record: &mut ExecutionRecord,
    owner: &WorkerId,
    now: DateTime<Utc>,
    ttl: Duration,
) -> Result<()> {
    check_owner(record, owner)?;
    record.lease_expires_at = Some(now + ttl);
    Ok(())
}

/// Record to write for a commit, or `LeaseConflict` if the lease moved on
pub(crate) fn merge_commit(
    current: &ExecutionRecord,
    incoming: &ExecutionRecord,
    owner: &WorkerId,
    now: DateTime<Utc>,
    ttl: Duration,
) -> Result<ExecutionRecord> {
    check_owner(current, owner)?;

    let mut record = incoming.clone();
    record.cancel_requested = current.cancel_requested || incoming.cancel_requested;
    record.lease_owner = Some(owner.clone());
    record.lease_expires_at = Some(now + ttl);
    record.updated_at = now;
    Ok(record)
}

pub(crate) fn sort_and_limit(records: &mut Vec<ExecutionRecord>, filter: &ExecutionFilter) {
    records.sort_by(|a, b| {
        b.created_at
            .cmp(&a.created_at)
            .then_with(|| b.execution_id.cmp(&a.execution_id))
    });
    if let Some(limit) = filter.limit {
        records.truncate(limit);
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;
    use crate::types::ExecutionStatus;
    use serde_json::json;

    pub fn graph() -> GraphDefinition {
        GraphDefinition::from_value(json!({
            "nodes": [{"id": "a", "type": "passthrough"}, {"id": "b", "type": "passthrough"}],
            "edges": [{"from": "a", "to": "b"}],
            "entry_node_id": "a"
        }))
        .unwrap()
    }

    pub fn execution(status: ExecutionStatus, created_at: DateTime<Utc>) -> StoredExecution {
        let graph = graph();
        StoredExecution {
            record: ExecutionRecord {
                execution_id: ExecutionId::new(),
                graph_definition_id: GraphId::new("g"),
                status,
                trigger_payload: json!({}),
                created_at,
                updated_at: created_at,
                scheduled_at: created_at,
                lease_owner: None,
                lease_expires_at: None,
                cancel_requested: false,
                wake_at: None,
                error: None,
                trigger_id: None,
            },
            state: ExecutionState::new(&graph),
            graph,
        }
    }

    /// Lease protocol checks every backend must pass
    pub fn exercise_lease_protocol(store: &dyn ExecutionStore) {
        let now = Utc::now();
        let ttl = Duration::seconds(30);
        let a = WorkerId::new("worker-a");
        let b = WorkerId::new("worker-b");

        let execution = execution(ExecutionStatus::Running, now);
        let id = execution.record.execution_id;
        store.insert_execution(&execution).unwrap();
        assert_eq!(store.due_executions(now, 10).unwrap(), vec![id]);

        let claimed = store.try_claim(id, &a, now, ttl).unwrap();
        assert_eq!(claimed.record.lease_owner, Some(a.clone()));

        // Losing claimant gets a conflict and changes nothing
        let err = store.try_claim(id, &b, now, ttl).unwrap_err();
        assert!(err.is_lease_conflict());
        let record = store.get_record(id).unwrap().unwrap();
        assert_eq!(record.lease_owner, Some(a.clone()));
        assert!(store.due_executions(now, 10).unwrap().is_empty());

        // Cancel requested mid-lease survives the holder's commit
        store
            .update_execution(id, &mut |stored| {
                stored.record.cancel_requested = true;
                Ok(())
            })
            .unwrap();
        let committed = store.commit(&a, &claimed, now, ttl).unwrap();
        assert!(committed.cancel_requested);

        // Renewal keeps the lease alive past its first expiry and reports the cancel
        let renewed_at = now + Duration::seconds(20);
        let renewed = store.renew_lease(id, &a, renewed_at, ttl).unwrap();
        assert!(renewed.cancel_requested);
        assert_eq!(renewed.lease_expires_at, Some(renewed_at + ttl));
        let err = store.try_claim(id, &b, now + Duration::seconds(31), ttl).unwrap_err();
        assert!(err.is_lease_conflict());
        assert!(store.renew_lease(id, &b, renewed_at, ttl).unwrap_err().is_lease_conflict());

        // A stale holder cannot commit or renew after takeover
        let later = renewed_at + Duration::seconds(31);
        store.try_claim(id, &b, later, ttl).unwrap();
        let err = store.commit(&a, &claimed, later, ttl).unwrap_err();
        assert!(err.is_lease_conflict());
        assert!(store.renew_lease(id, &a, later, ttl).unwrap_err().is_lease_conflict());

        store.release(id, &b).unwrap();
        let record = store.get_record(id).unwrap().unwrap();
        assert!(record.lease_owner.is_none());
        assert_eq!(store.pending_cancellations(later, 10).unwrap(), vec![id]);
    }

    pub fn exercise_trigger_fire(store: &dyn ExecutionStore) {
        use crate::types::{TimeTrigger, TriggerSchedule};

        let now = Utc::now();
        let trigger = TimeTrigger {
            id: TriggerId::new(),
            graph_definition_id: GraphId::new("g"),
            trigger_payload: json!({"source": "timer"}),
            schedule: TriggerSchedule::Interval { secs: 60 },
            next_fire_at: now,
            enabled: true,
            last_fired_at: None,
            last_execution_id: None,
            created_at: now,
        };
        store.save_trigger(&trigger).unwrap();
        assert_eq!(store.due_triggers(now, 10).unwrap().len(), 1);
        assert!(store
            .due_triggers(now - Duration::seconds(1), 10)
            .unwrap()
            .is_empty());

        let first = execution(ExecutionStatus::Running, now);
        let mut updated = trigger.clone();
        updated.next_fire_at = now + Duration::seconds(60);
        updated.last_fired_at = Some(now);
        updated.last_execution_id = Some(first.record.execution_id);
        assert!(store.fire_trigger(&updated, now, &first).unwrap());

        // A second firer for the same fire time loses
        let second = execution(ExecutionStatus::Running, now);
        assert!(!store.fire_trigger(&updated, now, &second).unwrap());
        assert!(store
            .get_execution(second.record.execution_id)
            .unwrap()
            .is_none());
        assert_eq!(
            store.get_trigger(trigger.id).unwrap().unwrap().next_fire_at,
            now + Duration::seconds(60)
        );
    }
}
