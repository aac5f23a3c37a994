use super::{ActivityHandler, HandlerContext, NodeOutcome};
use crate::workflow::dag::NodeConfig;
use serde_json::{Map, Value};

/// `config.value` rendered against the context, else the trigger payload
fn pass_value(config: &NodeConfig, ctx: &HandlerContext) -> Value {
    match config.get("value") {
        Some(template) => ctx.render(template),
        None => ctx.trigger_payload.clone(),
    }
}

pub struct PassthroughHandler;

#[async_trait::async_trait]
impl ActivityHandler for PassthroughHandler {
    fn node_type(&self) -> &str {
        "passthrough"
    }

    async fn execute(&self, config: &NodeConfig, ctx: &HandlerContext) -> NodeOutcome {
        NodeOutcome::Success(pass_value(config, ctx))
    }
}

/// Emits the value at `config.from` so conditional edges can route on it
pub struct BranchHandler;

#[async_trait::async_trait]
impl ActivityHandler for BranchHandler {
    fn node_type(&self) -> &str {
        "branch"
    }

    async fn execute(&self, config: &NodeConfig, ctx: &HandlerContext) -> NodeOutcome {
        let Some(from) = config.get("from").and_then(Value::as_str) else {
            return NodeOutcome::permanent("bad_config", "branch node needs a 'from' path");
        };
        NodeOutcome::Success(ctx.lookup(from).cloned().unwrap_or(Value::Null))
    }
}

/// Collects upstream outputs into one object keyed by node id
pub struct MergeHandler;

#[async_trait::async_trait]
impl ActivityHandler for MergeHandler {
    fn node_type(&self) -> &str {
        "merge"
    }

    async fn execute(&self, _config: &NodeConfig, ctx: &HandlerContext) -> NodeOutcome {
        let merged: Map<String, Value> = ctx
            .upstream
            .iter()
            .filter_map(|id| {
                ctx.prior_outputs
                    .get(id)
                    .map(|output| (id.to_string(), output.clone()))
            })
            .collect();
        NodeOutcome::Success(Value::Object(merged))
    }
}

/// Holds the node for `config.seconds` before its edges fire
pub struct DelayHandler;

#[async_trait::async_trait]
impl ActivityHandler for DelayHandler {
    fn node_type(&self) -> &str {
        "delay"
    }

    async fn execute(&self, config: &NodeConfig, ctx: &HandlerContext) -> NodeOutcome {
        let Some(seconds) = config.get("seconds").and_then(Value::as_u64) else {
            return NodeOutcome::permanent(
                "bad_config",
                "delay node needs a non-negative integer 'seconds'",
            );
        };
        let Some(until) = crate::clock::after(ctx.now, seconds) else {
            return NodeOutcome::permanent(
                "bad_config",
                format!("delay of {} seconds is out of range", seconds),
            );
        };
        NodeOutcome::Suspend {
            until,
            output: pass_value(config, ctx),
        }
    }
}

/// Always fails; used for operator drills and failure-path tests
pub struct FailHandler;

#[async_trait::async_trait]
impl ActivityHandler for FailHandler {
    fn node_type(&self) -> &str {
        "fail"
    }

    async fn execute(&self, config: &NodeConfig, _ctx: &HandlerContext) -> NodeOutcome {
        let kind = config
            .get("kind")
            .and_then(Value::as_str)
            .unwrap_or("failed");
        let message = config
            .get("message")
            .and_then(Value::as_str)
            .unwrap_or("node failed");
        let retriable = config
            .get("retriable")
            .and_then(Value::as_bool)
            .unwrap_or(false);

        if retriable {
            NodeOutcome::retriable(kind, message)
        } else {
            NodeOutcome::permanent(kind, message)
        }
    }
}
