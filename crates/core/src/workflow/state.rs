use super::dag::GraphDefinition;
use crate::types::{ExecutionStatus, NodeError, NodeId, NodeStatus};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet};

/// Resolution of one edge within an execution
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EdgeStatus {
    Unresolved,
    Satisfied,
    /// Condition evaluated false; stays that way unless a loop re-opens it
    Unsatisfied,
}

/// Diagnostics for one dispatch of a node
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AttemptRecord {
    pub attempt: u32,
    pub iteration: u32,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub error: Option<NodeError>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeState {
    pub status: NodeStatus,
    pub attempt_count: u32,
    /// Times the node has entered the frontier
    pub iteration: u32,
    /// Attempts granted by operators beyond `max_attempts`
    pub extra_attempts: u32,
    pub output: Option<Value>,
    pub error: Option<NodeError>,
    pub next_retry_at: Option<DateTime<Utc>>,
    pub history: Vec<AttemptRecord>,
}

impl Default for NodeState {
    fn default() -> Self {
        Self {
            status: NodeStatus::Pending,
            attempt_count: 0,
            iteration: 0,
            extra_attempts: 0,
            output: None,
            error: None,
            next_retry_at: None,
            history: Vec::new(),
        }
    }
}

impl NodeState {
    fn finish_attempt(&mut self, now: DateTime<Utc>, error: Option<NodeError>) {
        let attempt = self.attempt_count;
        if let Some(record) = self
            .history
            .iter_mut()
            .rev()
            .find(|r| r.attempt == attempt && r.finished_at.is_none())
        {
            record.finished_at = Some(now);
            record.error = error;
        }
    }
}

/// Mutable state of one execution, owned by the engine
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionState {
    pub node_states: BTreeMap<NodeId, NodeState>,
    /// Nodes whose dependencies are satisfied and that have not started
    pub frontier: BTreeSet<NodeId>,
    pub edge_states: Vec<EdgeStatus>,
}

impl ExecutionState {
    /// Every node pending, the entry node in the frontier
    pub fn new(graph: &GraphDefinition) -> Self {
        let mut state = Self {
            node_states: graph
                .node_ids()
                .map(|id| (id.clone(), NodeState::default()))
                .collect(),
            frontier: BTreeSet::new(),
            edge_states: vec![EdgeStatus::Unresolved; graph.edges().len()],
        };
        state.enter(graph.entry_node_id());
        state
    }

    pub fn node(&self, node_id: &NodeId) -> Option<&NodeState> {
        self.node_states.get(node_id)
    }

    pub fn node_mut(&mut self, node_id: &NodeId) -> Option<&mut NodeState> {
        self.node_states.get_mut(node_id)
    }

    pub fn status_of(&self, node_id: &NodeId) -> Option<NodeStatus> {
        self.node(node_id).map(|n| n.status)
    }

    fn enter(&mut self, node_id: &NodeId) {
        if let Some(node) = self.node_states.get_mut(node_id) {
            node.iteration += 1;
            self.frontier.insert(node_id.clone());
        }
    }

    /// Drain everything that should be dispatched now: the frontier, due
    /// retries, and nodes a previous lease holder left running.
    pub fn take_ready(&mut self, now: DateTime<Utc>) -> Vec<NodeId> {
        let mut ready: Vec<NodeId> = std::mem::take(&mut self.frontier).into_iter().collect();

        for (node_id, node) in &self.node_states {
            let due_retry = node.status == NodeStatus::RetryPending
                && node.next_retry_at.map_or(true, |at| at <= now);
            if (due_retry || node.status == NodeStatus::Running) && !ready.contains(node_id) {
                ready.push(node_id.clone());
            }
        }

        ready
    }

    /// Mark a node running and open a new attempt. Returns the attempt number.
    pub fn begin_attempt(&mut self, node_id: &NodeId, now: DateTime<Utc>) -> u32 {
        let Some(node) = self.node_states.get_mut(node_id) else {
            return 0;
        };
        node.status = NodeStatus::Running;
        node.attempt_count += 1;
        node.next_retry_at = None;
        node.history.push(AttemptRecord {
            attempt: node.attempt_count,
            iteration: node.iteration,
            started_at: now,
            finished_at: None,
            error: None,
        });
        node.attempt_count
    }

    /// Complete a node; with `expand` its outgoing edges are evaluated
    pub fn record_success(
        &mut self,
        graph: &GraphDefinition,
        node_id: &NodeId,
        output: Value,
        now: DateTime<Utc>,
        expand: bool,
    ) {
        if let Some(node) = self.node_states.get_mut(node_id) {
            node.status = NodeStatus::Completed;
            node.output = Some(output);
            node.error = None;
            node.next_retry_at = None;
            node.finish_attempt(now, None);
        }
        if expand {
            self.resolve_outgoing(graph, node_id);
        }
    }

    pub fn record_suspended(
        &mut self,
        node_id: &NodeId,
        output: Value,
        until: DateTime<Utc>,
        now: DateTime<Utc>,
    ) {
        if let Some(node) = self.node_states.get_mut(node_id) {
            node.status = NodeStatus::Waiting;
            node.output = Some(output);
            node.error = None;
            node.next_retry_at = Some(until);
            node.finish_attempt(now, None);
        }
    }

    pub fn record_retry(
        &mut self,
        node_id: &NodeId,
        error: NodeError,
        at: DateTime<Utc>,
        now: DateTime<Utc>,
    ) {
        if let Some(node) = self.node_states.get_mut(node_id) {
            node.status = NodeStatus::RetryPending;
            node.next_retry_at = Some(at);
            node.finish_attempt(now, Some(error.clone()));
            node.error = Some(error);
        }
    }

    pub fn record_failure(&mut self, node_id: &NodeId, error: NodeError, now: DateTime<Utc>) {
        if let Some(node) = self.node_states.get_mut(node_id) {
            node.status = NodeStatus::Failed;
            node.next_retry_at = None;
            node.finish_attempt(now, Some(error.clone()));
            node.error = Some(error);
        }
    }

    /// Complete waiting nodes whose hold has passed. Returns the completed ids.
    pub fn complete_due_waits(
        &mut self,
        graph: &GraphDefinition,
        now: DateTime<Utc>,
        expand: bool,
    ) -> Vec<NodeId> {
        let due: Vec<NodeId> = self
            .node_states
            .iter()
            .filter(|(_, n)| {
                n.status == NodeStatus::Waiting && n.next_retry_at.map_or(true, |at| at <= now)
            })
            .map(|(id, _)| id.clone())
            .collect();

        for node_id in &due {
            if let Some(node) = self.node_states.get_mut(node_id) {
                node.status = NodeStatus::Completed;
                node.next_retry_at = None;
            }
            if expand {
                self.resolve_outgoing(graph, node_id);
            }
        }

        due
    }

    /// Evaluate the outgoing edges of a completed node and admit newly ready
    /// downstream nodes to the frontier.
    pub fn resolve_outgoing(&mut self, graph: &GraphDefinition, node_id: &NodeId) {
        let output = self
            .node(node_id)
            .and_then(|n| n.output.clone())
            .unwrap_or(Value::Null);

        for &position in graph.outgoing(node_id) {
            let satisfied = graph
                .condition(position)
                .map_or(true, |condition| condition.evaluate(&output));
            self.edge_states[position] = if satisfied {
                EdgeStatus::Satisfied
            } else {
                EdgeStatus::Unsatisfied
            };
        }

        let mut loop_heads = Vec::new();
        for &position in graph.outgoing(node_id) {
            if self.edge_states[position] != EdgeStatus::Satisfied {
                continue;
            }
            let target = &graph.edge(position).to_node_id;
            if graph.is_back_edge(position) {
                loop_heads.push(target.clone());
            } else if self.is_ready(graph, target) {
                self.enter(target);
            }
        }

        for head in loop_heads {
            self.reenter(graph, &head);
        }
    }

    /// AND-join: every forward edge into the node is satisfied
    fn is_ready(&self, graph: &GraphDefinition, node_id: &NodeId) -> bool {
        if self.status_of(node_id) != Some(NodeStatus::Pending) || self.frontier.contains(node_id)
        {
            return false;
        }
        let mut forward = graph
            .incoming(node_id)
            .iter()
            .filter(|&&position| !graph.is_back_edge(position))
            .peekable();
        if forward.peek().is_none() {
            return false;
        }
        forward.all(|&position| self.edge_states[position] == EdgeStatus::Satisfied)
    }

    /// Re-open the forward region of a loop head and put the head back in the
    /// frontier.
    fn reenter(&mut self, graph: &GraphDefinition, head: &NodeId) {
        let region = graph.forward_region(head);

        for node_id in &region {
            if let Some(node) = self.node_states.get_mut(node_id) {
                if node.status == NodeStatus::Completed {
                    node.status = NodeStatus::Pending;
                    node.attempt_count = 0;
                    node.extra_attempts = 0;
                }
            }
        }

        for (position, edge) in graph.edges().iter().enumerate() {
            if region.contains(&edge.from_node_id)
                && self.status_of(&edge.from_node_id) == Some(NodeStatus::Pending)
            {
                self.edge_states[position] = EdgeStatus::Unresolved;
            }
        }

        if self.status_of(head) == Some(NodeStatus::Pending) && !self.frontier.contains(head) {
            self.enter(head);
        }
    }

    /// Nodes that still have work: frontier, running, retry-pending, waiting
    pub fn outstanding(&self) -> BTreeSet<NodeId> {
        let mut outstanding = self.frontier.clone();
        for (node_id, node) in &self.node_states {
            if matches!(
                node.status,
                NodeStatus::Running | NodeStatus::RetryPending | NodeStatus::Waiting
            ) {
                outstanding.insert(node_id.clone());
            }
        }
        outstanding
    }

    pub fn failed_nodes(&self) -> BTreeSet<NodeId> {
        self.node_states
            .iter()
            .filter(|(_, n)| n.status == NodeStatus::Failed)
            .map(|(id, _)| id.clone())
            .collect()
    }

    /// Earliest time-gated wake-up, when nothing can run right now
    pub fn wake_at(&self) -> Option<DateTime<Utc>> {
        let immediate = !self.frontier.is_empty()
            || self
                .node_states
                .values()
                .any(|n| n.status == NodeStatus::Running);
        if immediate {
            return None;
        }
        self.node_states
            .values()
            .filter(|n| matches!(n.status, NodeStatus::RetryPending | NodeStatus::Waiting))
            .filter_map(|n| n.next_retry_at)
            .min()
    }

    /// Terminal status the execution has reached, if any.
    ///
    /// A failure ends the execution once no outstanding node can reach a
    /// terminal node around the failed ones. Without failures the execution
    /// ends when nothing is outstanding: completed if a terminal node
    /// completed, stalled otherwise.
    pub fn evaluate(&self, graph: &GraphDefinition) -> Option<ExecutionStatus> {
        let failed = self.failed_nodes();
        let outstanding = self.outstanding();

        if !failed.is_empty() {
            let viable = outstanding
                .iter()
                .any(|node_id| graph.reaches_terminal(node_id, &failed));
            return if viable {
                None
            } else {
                Some(ExecutionStatus::Failed)
            };
        }

        if !outstanding.is_empty() {
            return None;
        }

        let reached_terminal = self
            .node_states
            .iter()
            .any(|(id, n)| n.status == NodeStatus::Completed && graph.is_terminal(id));

        Some(if reached_terminal {
            ExecutionStatus::Completed
        } else {
            ExecutionStatus::Stalled
        })
    }

    /// Outputs of every node that produced one, for handler context
    pub fn prior_outputs(&self) -> BTreeMap<NodeId, Value> {
        self.node_states
            .iter()
            .filter_map(|(id, n)| n.output.clone().map(|output| (id.clone(), output)))
            .collect()
    }

    /// Sources of the satisfied edges into `node_id`
    pub fn upstream_of(&self, graph: &GraphDefinition, node_id: &NodeId) -> Vec<NodeId> {
        graph
            .incoming(node_id)
            .iter()
            .filter(|&&position| self.edge_states[position] == EdgeStatus::Satisfied)
            .map(|&position| graph.edge(position).from_node_id.clone())
            .collect()
    }
}
