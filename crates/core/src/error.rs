use crate::types::{ExecutionId, NodeError, NodeId, WorkerId};
use thiserror::Error;

/// Result type for engine operations.
pub type Result<T> = std::result::Result<T, EngineError>;

/// Errors surfaced by the graph model, the engine, the stores and the workers.
#[derive(Debug, Error)]
pub enum EngineError {
    /// Malformed graph or unknown node type. Never retried.
    #[error("validation error: {0}")]
    Validation(String),

    /// A handler reported a failure for a node.
    #[error("node {node_id} failed ({kind}): {message}")]
    NodeExecution {
        node_id: NodeId,
        kind: String,
        message: String,
        retriable: bool,
    },

    /// Another worker owns the execution. Benign; the caller skips it.
    #[error("execution {execution_id} is leased by {owner}")]
    LeaseConflict {
        execution_id: ExecutionId,
        owner: WorkerId,
    },

    /// A handler call exceeded its time bound.
    #[error("node {node_id} timed out after {timeout_secs}s")]
    Timeout { node_id: NodeId, timeout_secs: u64 },

    /// The frontier emptied without any terminal node completing.
    #[error("execution {0} stalled: no node is ready and no terminal node completed")]
    Stalled(ExecutionId),

    #[error("not found: {0}")]
    NotFound(String),

    /// The requested operation does not apply in the current state.
    #[error("invalid state: {0}")]
    InvalidState(String),

    #[error(transparent)]
    Storage(#[from] anyhow::Error),
}

impl EngineError {
    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation(message.into())
    }

    pub fn is_lease_conflict(&self) -> bool {
        matches!(self, Self::LeaseConflict { .. })
    }

    /// Reduce a dispatch error to what gets recorded on the node.
    ///
    /// `timeout_retriable` comes from the node spec; everything that is not a
    /// handler failure or a timeout is permanent.
    pub fn to_node_error(&self, timeout_retriable: bool) -> NodeError {
        match self {
            Self::NodeExecution {
                kind,
                message,
                retriable,
                ..
            } => NodeError {
                kind: kind.clone(),
                message: message.clone(),
                retriable: *retriable,
            },
            Self::Timeout { .. } => NodeError {
                kind: "timeout".to_string(),
                message: self.to_string(),
                retriable: timeout_retriable,
            },
            Self::Validation(message) => NodeError::permanent("validation", message.clone()),
            other => NodeError::permanent("engine", other.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_node_error_classification() {
        let timeout = EngineError::Timeout {
            node_id: NodeId::new("fetch"),
            timeout_secs: 5,
        };
        assert!(timeout.to_node_error(true).retriable);
        assert!(!timeout.to_node_error(false).retriable);

        let unknown = EngineError::validation("unknown node type 'ocr'");
        let recorded = unknown.to_node_error(true);
        assert_eq!(recorded.kind, "validation");
        assert!(!recorded.retriable);

        let handler = EngineError::NodeExecution {
            node_id: NodeId::new("call"),
            kind: "rate_limited".to_string(),
            message: "429".to_string(),
            retriable: true,
        };
        assert!(handler.to_node_error(false).retriable);
    }
}
