use super::ApiResult;
use crate::config::AppState;
use axum::{
    extract::{Path, Query, State},
    Json,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::str::FromStr;
use std::sync::Arc;
use strand_core::{
    workflow::{ExecutionDetail, GraphDefinition},
    EngineError, ExecutionFilter, ExecutionId, ExecutionRecord, ExecutionStatus, GraphId, NodeId,
    TimeTrigger, TriggerId, TriggerSchedule,
};

fn parse_id<T: FromStr>(raw: &str, what: &str) -> Result<T, EngineError> {
    raw.parse()
        .map_err(|_| EngineError::validation(format!("invalid {} '{}'", what, raw)))
}

/// Store or replace a graph definition
pub async fn put_graph(
    State(state): State<Arc<AppState>>,
    Path(graph_id): Path<String>,
    Json(document): Json<Value>,
) -> ApiResult<Json<GraphResponse>> {
    let graph_id = GraphId::new(graph_id);
    let graph = GraphDefinition::from_value(document)?;
    state.engine.save_graph(&graph_id, &graph)?;

    tracing::info!(graph_id = %graph_id, nodes = graph.nodes().count(), "Stored graph");

    Ok(Json(GraphResponse { graph_id, graph }))
}

/// Get a stored graph definition
pub async fn get_graph(
    State(state): State<Arc<AppState>>,
    Path(graph_id): Path<String>,
) -> ApiResult<Json<GraphResponse>> {
    let graph_id = GraphId::new(graph_id);
    let graph = state.engine.get_graph(&graph_id)?;
    Ok(Json(GraphResponse { graph_id, graph }))
}

#[derive(Debug, Serialize)]
pub struct GraphResponse {
    pub graph_id: GraphId,
    pub graph: GraphDefinition,
}

/// Start an execution of a stored graph
pub async fn create_execution(
    State(state): State<Arc<AppState>>,
    Json(req): Json<CreateExecutionRequest>,
) -> ApiResult<Json<CreateExecutionResponse>> {
    let start_after = req
        .start_after_secs
        .map(|secs| {
            strand_core::clock::seconds(secs).ok_or_else(|| {
                EngineError::validation(format!("start_after_secs {} is out of range", secs))
            })
        })
        .transpose()?;

    let record = state.engine.start_execution(
        &GraphId::new(req.graph_id),
        req.trigger_payload,
        start_after,
    )?;

    Ok(Json(CreateExecutionResponse {
        execution_id: record.execution_id,
        status: record.status,
        scheduled_at: record.scheduled_at,
    }))
}

#[derive(Debug, Serialize, Deserialize)]
pub struct CreateExecutionRequest {
    pub graph_id: String,
    #[serde(default)]
    pub trigger_payload: Value,
    /// Delay before the execution becomes claimable
    pub start_after_secs: Option<u64>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct CreateExecutionResponse {
    pub execution_id: ExecutionId,
    pub status: ExecutionStatus,
    pub scheduled_at: DateTime<Utc>,
}

/// List executions, newest first
pub async fn list_executions(
    State(state): State<Arc<AppState>>,
    Query(filter): Query<ExecutionFilter>,
) -> ApiResult<Json<ListExecutionsResponse>> {
    let executions = state.engine.list_executions(&filter)?;
    Ok(Json(ListExecutionsResponse { executions }))
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ListExecutionsResponse {
    pub executions: Vec<ExecutionRecord>,
}

/// Get one execution with its node states
pub async fn get_execution(
    State(state): State<Arc<AppState>>,
    Path(execution_id): Path<String>,
) -> ApiResult<Json<ExecutionDetail>> {
    let execution_id: ExecutionId = parse_id(&execution_id, "execution id")?;
    Ok(Json(state.engine.get_execution(execution_id)?))
}

/// Request cancellation; the next worker to claim the execution applies it
pub async fn cancel_execution(
    State(state): State<Arc<AppState>>,
    Path(execution_id): Path<String>,
) -> ApiResult<Json<ExecutionRecord>> {
    let execution_id: ExecutionId = parse_id(&execution_id, "execution id")?;
    Ok(Json(state.engine.cancel(execution_id)?))
}

/// Grant a failed node another attempt
pub async fn retry_node(
    State(state): State<Arc<AppState>>,
    Path((execution_id, node_id)): Path<(String, String)>,
) -> ApiResult<Json<ExecutionRecord>> {
    let execution_id: ExecutionId = parse_id(&execution_id, "execution id")?;
    let record = state
        .engine
        .retry_node(execution_id, &NodeId::new(node_id))?;
    Ok(Json(record))
}

/// Register a time trigger
pub async fn create_trigger(
    State(state): State<Arc<AppState>>,
    Json(req): Json<CreateTriggerRequest>,
) -> ApiResult<Json<TimeTrigger>> {
    let trigger = state.engine.create_trigger(
        &GraphId::new(req.graph_id),
        req.trigger_payload,
        req.schedule,
        req.first_fire_at,
    )?;
    Ok(Json(trigger))
}

#[derive(Debug, Serialize, Deserialize)]
pub struct CreateTriggerRequest {
    pub graph_id: String,
    #[serde(default)]
    pub trigger_payload: Value,
    pub schedule: TriggerSchedule,
    /// Defaults to the schedule's first slot after now
    pub first_fire_at: Option<DateTime<Utc>>,
}

pub async fn list_triggers(
    State(state): State<Arc<AppState>>,
) -> ApiResult<Json<ListTriggersResponse>> {
    let triggers = state.engine.list_triggers()?;
    Ok(Json(ListTriggersResponse { triggers }))
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ListTriggersResponse {
    pub triggers: Vec<TimeTrigger>,
}

pub async fn enable_trigger(
    State(state): State<Arc<AppState>>,
    Path(trigger_id): Path<String>,
) -> ApiResult<Json<TimeTrigger>> {
    let trigger_id: TriggerId = parse_id(&trigger_id, "trigger id")?;
    Ok(Json(state.engine.set_trigger_enabled(trigger_id, true)?))
}

pub async fn disable_trigger(
    State(state): State<Arc<AppState>>,
    Path(trigger_id): Path<String>,
) -> ApiResult<Json<TimeTrigger>> {
    let trigger_id: TriggerId = parse_id(&trigger_id, "trigger id")?;
    Ok(Json(state.engine.set_trigger_enabled(trigger_id, false)?))
}
