use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::str::FromStr;
use uuid::Uuid;

/// Unique identifier for one execution of a graph
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ExecutionId(pub Uuid);

impl ExecutionId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for ExecutionId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for ExecutionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for ExecutionId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Self(Uuid::parse_str(s)?))
    }
}

/// Unique identifier for a time trigger
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TriggerId(pub Uuid);

impl TriggerId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for TriggerId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for TriggerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for TriggerId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Self(Uuid::parse_str(s)?))
    }
}

/// Identifier of a stored graph definition
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct GraphId(pub String);

impl GraphId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }
}

impl std::fmt::Display for GraphId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Identifier of a node within one graph
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct NodeId(pub String);

impl NodeId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for NodeId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Identity a worker uses as lease owner
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct WorkerId(pub String);

impl WorkerId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Generate a random worker ID
    pub fn generate() -> Self {
        Self(format!("worker-{}", Uuid::new_v4()))
    }
}

impl std::fmt::Display for WorkerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Status of an execution
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
    /// Nothing errored, but no terminal node could be reached
    Stalled,
}

impl ExecutionStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Completed | Self::Failed | Self::Cancelled | Self::Stalled
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
            Self::Stalled => "stalled",
        }
    }
}

impl std::fmt::Display for ExecutionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Status of a single node within an execution
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeStatus {
    Pending,
    Running,
    Completed,
    Failed,
    RetryPending,
    /// Handler finished but the node holds until `next_retry_at` (delay nodes)
    Waiting,
}

/// Failure reported for a node attempt
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeError {
    pub kind: String,
    pub message: String,
    pub retriable: bool,
}

impl NodeError {
    pub fn retriable(kind: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            message: message.into(),
            retriable: true,
        }
    }

    pub fn permanent(kind: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            message: message.into(),
            retriable: false,
        }
    }
}

impl std::fmt::Display for NodeError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.kind, self.message)
    }
}

/// The error an operator sees on a failed or stalled execution
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionError {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub node_id: Option<NodeId>,
    pub kind: String,
    pub message: String,
}

/// Persisted header of one execution
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionRecord {
    pub execution_id: ExecutionId,
    pub graph_definition_id: GraphId,
    pub status: ExecutionStatus,
    pub trigger_payload: serde_json::Value,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    /// Earliest time a worker may pick up a pending execution
    pub scheduled_at: DateTime<Utc>,
    pub lease_owner: Option<WorkerId>,
    pub lease_expires_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub cancel_requested: bool,
    /// Set when the only outstanding work is time-gated (retries, delays)
    #[serde(default)]
    pub wake_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub error: Option<ExecutionError>,
    #[serde(default)]
    pub trigger_id: Option<TriggerId>,
}

impl ExecutionRecord {
    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// Whether some worker holds an unexpired lease at `now`
    pub fn lease_is_live(&self, now: DateTime<Utc>) -> bool {
        match (&self.lease_owner, self.lease_expires_at) {
            (Some(_), Some(expires)) => expires > now,
            _ => false,
        }
    }

    /// Whether `owner` may take (or keep) the lease at `now`
    pub fn claimable_by(&self, owner: &WorkerId, now: DateTime<Utc>) -> bool {
        !self.lease_is_live(now) || self.lease_owner.as_ref() == Some(owner)
    }

    /// Whether the claim phase should pick this execution up
    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        if self.is_terminal() || self.lease_is_live(now) {
            return false;
        }
        match self.status {
            ExecutionStatus::Pending => self.scheduled_at <= now,
            ExecutionStatus::Running => self.wake_at.map_or(true, |wake| wake <= now),
            _ => false,
        }
    }
}

/// Filters for listing executions
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ExecutionFilter {
    pub status: Option<ExecutionStatus>,
    pub created_after: Option<DateTime<Utc>>,
    pub created_before: Option<DateTime<Utc>>,
    pub limit: Option<usize>,
}

impl ExecutionFilter {
    pub fn matches(&self, record: &ExecutionRecord) -> bool {
        if let Some(status) = self.status {
            if record.status != status {
                return false;
            }
        }
        if let Some(after) = self.created_after {
            if record.created_at < after {
                return false;
            }
        }
        if let Some(before) = self.created_before {
            if record.created_at >= before {
                return false;
            }
        }
        true
    }
}

/// When a time trigger fires
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TriggerSchedule {
    /// Fire once at `next_fire_at`, then disable
    Once,
    /// Fire every `secs` seconds
    Interval { secs: u64 },
    /// Cron expression with a seconds field (e.g. "0 */5 * * * *")
    Cron { expression: String },
}

/// A stored request to start executions of a graph over time
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimeTrigger {
    pub id: TriggerId,
    pub graph_definition_id: GraphId,
    pub trigger_payload: serde_json::Value,
    pub schedule: TriggerSchedule,
    pub next_fire_at: DateTime<Utc>,
    pub enabled: bool,
    pub last_fired_at: Option<DateTime<Utc>>,
    pub last_execution_id: Option<ExecutionId>,
    pub created_at: DateTime<Utc>,
}

impl TimeTrigger {
    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.enabled && self.next_fire_at <= now
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn record(status: ExecutionStatus) -> ExecutionRecord {
        let now = Utc::now();
        ExecutionRecord {
            execution_id: ExecutionId::new(),
            graph_definition_id: GraphId::new("g"),
            status,
            trigger_payload: serde_json::Value::Null,
            created_at: now,
            updated_at: now,
            scheduled_at: now,
            lease_owner: None,
            lease_expires_at: None,
            cancel_requested: false,
            wake_at: None,
            error: None,
            trigger_id: None,
        }
    }

    #[test]
    fn test_lease_liveness() {
        let now = Utc::now();
        let mut rec = record(ExecutionStatus::Running);
        assert!(!rec.lease_is_live(now));

        rec.lease_owner = Some(WorkerId::new("a"));
        rec.lease_expires_at = Some(now + Duration::seconds(30));
        assert!(rec.lease_is_live(now));
        assert!(rec.claimable_by(&WorkerId::new("a"), now));
        assert!(!rec.claimable_by(&WorkerId::new("b"), now));

        // Expired leases can be taken over
        assert!(rec.claimable_by(&WorkerId::new("b"), now + Duration::seconds(31)));
    }

    #[test]
    fn test_due_rules() {
        let now = Utc::now();

        let mut pending = record(ExecutionStatus::Pending);
        pending.scheduled_at = now + Duration::seconds(10);
        assert!(!pending.is_due(now));
        assert!(pending.is_due(now + Duration::seconds(10)));

        let mut waiting = record(ExecutionStatus::Running);
        waiting.wake_at = Some(now + Duration::seconds(5));
        assert!(!waiting.is_due(now));
        assert!(waiting.is_due(now + Duration::seconds(5)));

        assert!(!record(ExecutionStatus::Completed).is_due(now));
        assert!(!record(ExecutionStatus::Stalled).is_due(now));
    }

    #[test]
    fn test_status_serialization() {
        let json = serde_json::to_string(&NodeStatus::RetryPending).unwrap();
        assert_eq!(json, "\"retry_pending\"");
        let status: ExecutionStatus = serde_json::from_str("\"stalled\"").unwrap();
        assert!(status.is_terminal());
    }
}
