// Core engine for Strand: workflow graphs, durable executions, leased workers

pub mod clock;
pub mod config;
pub mod error;
pub mod handlers;
pub mod scheduler;
pub mod storage;
pub mod types;
pub mod worker;
pub mod workflow;

pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{EngineConfig, WorkerConfig};
pub use error::{EngineError, Result};
pub use types::*;
pub use worker::{CycleReport, Worker};
pub use workflow::{ExecutionEngine, GraphDefinition};
