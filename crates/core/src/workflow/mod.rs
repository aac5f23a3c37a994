pub mod condition;
pub mod dag;
pub mod executor;
pub mod retry;
pub mod state;
pub mod step_executor;

pub use condition::Condition;
pub use dag::{Edge, GraphDefinition, GraphDocument, NodeConfig, NodeSpec};
pub use executor::{ExecutionDetail, ExecutionEngine, StepOutcome};
pub use retry::{Backoff, RetryDecision, RetryPolicy};
pub use state::{AttemptRecord, EdgeStatus, ExecutionState, NodeState};
pub use step_executor::{Dispatched, StepExecutor};
