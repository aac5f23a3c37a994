use super::dag::NodeSpec;
use crate::error::{EngineError, Result};
use crate::handlers::{HandlerContext, HandlerRegistry, NodeOutcome};
use chrono::{DateTime, Utc};
use serde_json::Value;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::time::timeout;

/// Successful result of dispatching one node attempt
#[derive(Debug, Clone, PartialEq)]
pub enum Dispatched {
    Completed(Value),
    Suspended { until: DateTime<Utc>, output: Value },
}

/// Runs a single node attempt through its handler with a time bound
pub struct StepExecutor {
    registry: Arc<HandlerRegistry>,
    default_timeout: Duration,
}

impl StepExecutor {
    pub fn new(registry: Arc<HandlerRegistry>, default_timeout: Duration) -> Self {
        Self {
            registry,
            default_timeout,
        }
    }

    pub fn registry(&self) -> &Arc<HandlerRegistry> {
        &self.registry
    }

    /// Execute one attempt. Retry decisions belong to the caller.
    pub async fn execute(&self, spec: &NodeSpec, ctx: &HandlerContext) -> Result<Dispatched> {
        let handler = self.registry.get(&spec.node_type).ok_or_else(|| {
            EngineError::validation(format!(
                "node {} has unknown type '{}'",
                spec.node_id, spec.node_type
            ))
        })?;

        let bound = spec
            .timeout_secs
            .map(Duration::from_secs)
            .unwrap_or(self.default_timeout);

        tracing::info!(
            execution_id = %ctx.execution_id,
            node_id = %spec.node_id,
            node_type = %spec.node_type,
            attempt = ctx.attempt,
            "Dispatching node"
        );

        let start = Instant::now();
        let outcome = match timeout(bound, handler.execute(&spec.config, ctx)).await {
            Ok(outcome) => outcome,
            Err(_) => {
                tracing::warn!(
                    execution_id = %ctx.execution_id,
                    node_id = %spec.node_id,
                    "Node timed out after {:?}",
                    bound
                );
                return Err(EngineError::Timeout {
                    node_id: spec.node_id.clone(),
                    timeout_secs: bound.as_secs(),
                });
            }
        };

        tracing::debug!(
            execution_id = %ctx.execution_id,
            node_id = %spec.node_id,
            elapsed_ms = start.elapsed().as_millis() as u64,
            "Node handler returned"
        );

        match outcome {
            NodeOutcome::Success(output) => Ok(Dispatched::Completed(output)),
            NodeOutcome::Suspend { until, output } => Ok(Dispatched::Suspended { until, output }),
            NodeOutcome::Failure(error) => Err(EngineError::NodeExecution {
                node_id: spec.node_id.clone(),
                kind: error.kind,
                message: error.message,
                retriable: error.retriable,
            }),
        }
    }
}
