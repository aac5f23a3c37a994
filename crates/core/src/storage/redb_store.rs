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
use crate::workflow::state::ExecutionState;
use anyhow::Context;
use chrono::{DateTime, Duration, Utc};
use redb::{Database, ReadableTable, Table, TableDefinition};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::Arc;

const GRAPHS_TABLE: TableDefinition<&str, &[u8]> = TableDefinition::new("graphs");
const EXECUTIONS_TABLE: TableDefinition<&str, &[u8]> = TableDefinition::new("executions");
const EXECUTION_STATES_TABLE: TableDefinition<&str, &[u8]> =
    TableDefinition::new("execution_states");
const TRIGGERS_TABLE: TableDefinition<&str, &[u8]> = TableDefinition::new("triggers");

/// Mutable state plus the graph snapshot, stored apart from the record so
/// polling only decodes headers
#[derive(Serialize, Deserialize)]
struct StateBlob {
    state: ExecutionState,
    graph: GraphDefinition,
}

#[derive(Serialize)]
struct StateBlobRef<'a> {
    state: &'a ExecutionState,
    graph: &'a GraphDefinition,
}

/// Execution store backed by a redb file.
///
/// Claims, commits and trigger fires each run in one write transaction;
/// redb serialises writers, which makes them compare-and-set operations.
#[derive(Clone)]
pub struct RedbStore {
    db: Arc<Database>,
}

impl RedbStore {
    pub fn new(path: PathBuf) -> anyhow::Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).context("Failed to create index directory")?;
        }

        let db = Database::create(&path).context("Failed to create redb database")?;

        let write_txn = db.begin_write().context("Failed to begin write transaction")?;
        {
            let _graphs = write_txn
                .open_table(GRAPHS_TABLE)
                .context("Failed to open graphs table")?;
            let _executions = write_txn
                .open_table(EXECUTIONS_TABLE)
                .context("Failed to open executions table")?;
            let _states = write_txn
                .open_table(EXECUTION_STATES_TABLE)
                .context("Failed to open execution states table")?;
            let _triggers = write_txn
                .open_table(TRIGGERS_TABLE)
                .context("Failed to open triggers table")?;
        }
        write_txn.commit().context("Failed to commit transaction")?;

        Ok(Self { db: Arc::new(db) })
    }

    fn read_all<T: DeserializeOwned>(
        &self,
        definition: TableDefinition<&str, &[u8]>,
        what: &str,
    ) -> anyhow::Result<Vec<T>> {
        let read_txn = self.db.begin_read().context("Failed to begin read")?;
        let table = read_txn
            .open_table(definition)
            .context("Failed to open table")?;

        let mut items = Vec::new();
        for item in table
            .iter()
            .with_context(|| format!("Failed to iterate {}", what))?
        {
            let (_key, value) = item.context("Failed to read item")?;
            let decoded = serde_json::from_slice(value.value())
                .with_context(|| format!("Failed to deserialize {}", what))?;
            items.push(decoded);
        }
        Ok(items)
    }

    fn read_one<T: DeserializeOwned>(
        &self,
        definition: TableDefinition<&str, &[u8]>,
        key: &str,
        what: &str,
    ) -> anyhow::Result<Option<T>> {
        let read_txn = self.db.begin_read().context("Failed to begin read")?;
        let table = read_txn
            .open_table(definition)
            .context("Failed to open table")?;
        get_value(&table, key, what)
    }

    fn write_one<T: Serialize>(
        &self,
        definition: TableDefinition<&str, &[u8]>,
        key: &str,
        value: &T,
        what: &str,
    ) -> anyhow::Result<()> {
        let write_txn = self.db.begin_write().context("Failed to begin write")?;
        {
            let mut table = write_txn
                .open_table(definition)
                .context("Failed to open table")?;
            put_value(&mut table, key, value, what)?;
        }
        write_txn.commit().context("Failed to commit")?;
        Ok(())
    }
}

fn get_value<T: DeserializeOwned>(
    table: &impl ReadableTable<&'static str, &'static [u8]>,
    key: &str,
    what: &str,
) -> anyhow::Result<Option<T>> {
    match table
        .get(key)
        .with_context(|| format!("Failed to get {}", what))?
    {
        Some(guard) => {
            let decoded = serde_json::from_slice(guard.value())
                .with_context(|| format!("Failed to deserialize {}", what))?;
            Ok(Some(decoded))
        }
        None => Ok(None),
    }
}

fn put_value<T: Serialize>(
    table: &mut Table<'_, &'static str, &'static [u8]>,
    key: &str,
    value: &T,
    what: &str,
) -> anyhow::Result<()> {
    let bytes =
        serde_json::to_vec(value).with_context(|| format!("Failed to serialize {}", what))?;
    table
        .insert(key, bytes.as_slice())
        .with_context(|| format!("Failed to insert {}", what))?;
    Ok(())
}

fn load_execution(
    records: &impl ReadableTable<&'static str, &'static [u8]>,
    states: &impl ReadableTable<&'static str, &'static [u8]>,
    key: &str,
) -> anyhow::Result<Option<StoredExecution>> {
    let Some(record) = get_value::<ExecutionRecord>(records, key, "execution")? else {
        return Ok(None);
    };
    let blob: StateBlob = get_value(states, key, "execution state")?
        .with_context(|| format!("Execution {} has no stored state", key))?;
    Ok(Some(StoredExecution {
        record,
        state: blob.state,
        graph: blob.graph,
    }))
}

fn put_state(
    states: &mut Table<'_, &'static str, &'static [u8]>,
    key: &str,
    execution: &StoredExecution,
) -> anyhow::Result<()> {
    put_value(
        states,
        key,
        &StateBlobRef {
            state: &execution.state,
            graph: &execution.graph,
        },
        "execution state",
    )
}

fn not_found(execution_id: ExecutionId) -> EngineError {
    EngineError::NotFound(format!("execution {}", execution_id))
}

impl ExecutionStore for RedbStore {
    fn save_graph(&self, graph_id: &GraphId, graph: &GraphDefinition) -> Result<()> {
        self.write_one(GRAPHS_TABLE, &graph_id.0, graph, "graph")?;
        Ok(())
    }

    fn get_graph(&self, graph_id: &GraphId) -> Result<Option<GraphDefinition>> {
        Ok(self.read_one(GRAPHS_TABLE, &graph_id.0, "graph")?)
    }

    fn insert_execution(&self, execution: &StoredExecution) -> Result<()> {
        let key = execution.record.execution_id.to_string();
        let write_txn = self.db.begin_write().context("Failed to begin write")?;
        {
            let mut records = write_txn
                .open_table(EXECUTIONS_TABLE)
                .context("Failed to open executions table")?;
            put_value(&mut records, &key, &execution.record, "execution")?;
            let mut states = write_txn
                .open_table(EXECUTION_STATES_TABLE)
                .context("Failed to open execution states table")?;
            put_state(&mut states, &key, execution)?;
        }
        write_txn.commit().context("Failed to commit")?;
        Ok(())
    }

    fn get_execution(&self, execution_id: ExecutionId) -> Result<Option<StoredExecution>> {
        let key = execution_id.to_string();
        let read_txn = self.db.begin_read().context("Failed to begin read")?;
        let records = read_txn
            .open_table(EXECUTIONS_TABLE)
            .context("Failed to open executions table")?;
        let states = read_txn
            .open_table(EXECUTION_STATES_TABLE)
            .context("Failed to open execution states table")?;
        Ok(load_execution(&records, &states, &key)?)
    }

    fn get_record(&self, execution_id: ExecutionId) -> Result<Option<ExecutionRecord>> {
        Ok(self.read_one(EXECUTIONS_TABLE, &execution_id.to_string(), "execution")?)
    }

    fn list_executions(&self, filter: &ExecutionFilter) -> Result<Vec<ExecutionRecord>> {
        let mut records: Vec<ExecutionRecord> = self
            .read_all::<ExecutionRecord>(EXECUTIONS_TABLE, "executions")?
            .into_iter()
            .filter(|r| filter.matches(r))
            .collect();
        sort_and_limit(&mut records, filter);
        Ok(records)
    }

    fn due_executions(&self, now: DateTime<Utc>, limit: usize) -> Result<Vec<ExecutionId>> {
        let mut due: Vec<ExecutionRecord> = self
            .read_all::<ExecutionRecord>(EXECUTIONS_TABLE, "executions")?
            .into_iter()
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
        let mut pending: Vec<ExecutionRecord> = self
            .read_all::<ExecutionRecord>(EXECUTIONS_TABLE, "executions")?
            .into_iter()
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
        let key = execution_id.to_string();
        let write_txn = self.db.begin_write().context("Failed to begin write")?;
        let claimed = {
            let mut records = write_txn
                .open_table(EXECUTIONS_TABLE)
                .context("Failed to open executions table")?;
            let states = write_txn
                .open_table(EXECUTION_STATES_TABLE)
                .context("Failed to open execution states table")?;

            let mut stored =
                load_execution(&records, &states, &key)?.ok_or_else(|| not_found(execution_id))?;
            apply_claim(&mut stored.record, owner, now, ttl)?;
            put_value(&mut records, &key, &stored.record, "execution")?;
            stored
        };
        write_txn.commit().context("Failed to commit claim")?;
        Ok(claimed)
    }

    fn commit(
        &self,
        owner: &WorkerId,
        execution: &StoredExecution,
        now: DateTime<Utc>,
        ttl: Duration,
    ) -> Result<ExecutionRecord> {
        let execution_id = execution.record.execution_id;
        let key = execution_id.to_string();
        let write_txn = self.db.begin_write().context("Failed to begin write")?;
        let record = {
            let mut records = write_txn
                .open_table(EXECUTIONS_TABLE)
                .context("Failed to open executions table")?;
            let current: ExecutionRecord =
                get_value(&records, &key, "execution")?.ok_or_else(|| not_found(execution_id))?;

            let record = merge_commit(&current, &execution.record, owner, now, ttl)?;
            put_value(&mut records, &key, &record, "execution")?;

            let mut states = write_txn
                .open_table(EXECUTION_STATES_TABLE)
                .context("Failed to open execution states table")?;
            put_state(&mut states, &key, execution)?;
            record
        };
        write_txn.commit().context("Failed to commit execution")?;
        Ok(record)
    }

    fn renew_lease(
        &self,
        execution_id: ExecutionId,
        owner: &WorkerId,
        now: DateTime<Utc>,
        ttl: Duration,
    ) -> Result<ExecutionRecord> {
        let key = execution_id.to_string();
        let write_txn = self.db.begin_write().context("Failed to begin write")?;
        let record = {
            let mut records = write_txn
                .open_table(EXECUTIONS_TABLE)
                .context("Failed to open executions table")?;
            let mut record: ExecutionRecord =
                get_value(&records, &key, "execution")?.ok_or_else(|| not_found(execution_id))?;
            apply_renewal(&mut record, owner, now, ttl)?;
            put_value(&mut records, &key, &record, "execution")?;
            record
        };
        write_txn.commit().context("Failed to renew lease")?;
        Ok(record)
    }

    fn release(&self, execution_id: ExecutionId, owner: &WorkerId) -> Result<()> {
        let key = execution_id.to_string();
        let write_txn = self.db.begin_write().context("Failed to begin write")?;
        {
            let mut records = write_txn
                .open_table(EXECUTIONS_TABLE)
                .context("Failed to open executions table")?;
            if let Some(mut record) = get_value::<ExecutionRecord>(&records, &key, "execution")? {
                if record.lease_owner.as_ref() == Some(owner) {
                    record.lease_owner = None;
                    record.lease_expires_at = None;
                    put_value(&mut records, &key, &record, "execution")?;
                }
            }
        }
        write_txn.commit().context("Failed to commit release")?;
        Ok(())
    }

    fn update_execution(
        &self,
        execution_id: ExecutionId,
        apply: &mut dyn FnMut(&mut StoredExecution) -> Result<()>,
    ) -> Result<StoredExecution> {
        let key = execution_id.to_string();
        let write_txn = self.db.begin_write().context("Failed to begin write")?;
        let updated = {
            let mut records = write_txn
                .open_table(EXECUTIONS_TABLE)
                .context("Failed to open executions table")?;
            let mut states = write_txn
                .open_table(EXECUTION_STATES_TABLE)
                .context("Failed to open execution states table")?;

            let mut stored =
                load_execution(&records, &states, &key)?.ok_or_else(|| not_found(execution_id))?;
            apply(&mut stored)?;
            put_value(&mut records, &key, &stored.record, "execution")?;
            put_state(&mut states, &key, &stored)?;
            stored
        };
        write_txn.commit().context("Failed to commit update")?;
        Ok(updated)
    }

    fn save_trigger(&self, trigger: &TimeTrigger) -> Result<()> {
        self.write_one(TRIGGERS_TABLE, &trigger.id.to_string(), trigger, "trigger")?;
        Ok(())
    }

    fn get_trigger(&self, trigger_id: TriggerId) -> Result<Option<TimeTrigger>> {
        Ok(self.read_one(TRIGGERS_TABLE, &trigger_id.to_string(), "trigger")?)
    }

    fn list_triggers(&self) -> Result<Vec<TimeTrigger>> {
        let mut triggers: Vec<TimeTrigger> = self.read_all(TRIGGERS_TABLE, "triggers")?;
        triggers.sort_by_key(|t| (t.created_at, t.id));
        Ok(triggers)
    }

    fn due_triggers(&self, now: DateTime<Utc>, limit: usize) -> Result<Vec<TimeTrigger>> {
        let mut due: Vec<TimeTrigger> = self
            .read_all::<TimeTrigger>(TRIGGERS_TABLE, "triggers")?
            .into_iter()
            .filter(|t| t.is_due(now))
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
        let trigger_key = updated.id.to_string();
        let execution_key = execution.record.execution_id.to_string();
        let write_txn = self.db.begin_write().context("Failed to begin write")?;
        {
            let mut triggers = write_txn
                .open_table(TRIGGERS_TABLE)
                .context("Failed to open triggers table")?;
            let current: TimeTrigger = get_value(&triggers, &trigger_key, "trigger")?
                .ok_or_else(|| EngineError::NotFound(format!("trigger {}", updated.id)))?;
            if !current.enabled || current.next_fire_at != expected_fire_at {
                return Ok(false);
            }
            put_value(&mut triggers, &trigger_key, updated, "trigger")?;

            let mut records = write_txn
                .open_table(EXECUTIONS_TABLE)
                .context("Failed to open executions table")?;
            put_value(&mut records, &execution_key, &execution.record, "execution")?;
            let mut states = write_txn
                .open_table(EXECUTION_STATES_TABLE)
                .context("Failed to open execution states table")?;
            put_state(&mut states, &execution_key, execution)?;
        }
        write_txn.commit().context("Failed to commit trigger fire")?;
        Ok(true)
    }
}
