//! Activity handlers: the contract between the engine and whatever a node
//! actually does.

mod builtin;

pub use builtin::{BranchHandler, DelayHandler, FailHandler, MergeHandler, PassthroughHandler};

use crate::error::{EngineError, Result};
use crate::types::{ExecutionId, NodeError, NodeId};
use crate::workflow::condition::resolve;
use crate::workflow::dag::{GraphDefinition, NodeConfig};
use chrono::{DateTime, Utc};
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// What a handler reports for one attempt
#[derive(Debug, Clone, PartialEq)]
pub enum NodeOutcome {
    Success(Value),
    Failure(NodeError),
    /// Output is final, but the node holds until `until` before its edges fire
    Suspend { until: DateTime<Utc>, output: Value },
}

impl NodeOutcome {
    pub fn retriable(kind: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Failure(NodeError::retriable(kind, message))
    }

    pub fn permanent(kind: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Failure(NodeError::permanent(kind, message))
    }
}

/// Everything a handler may read about the execution it runs in
#[derive(Debug, Clone)]
pub struct HandlerContext {
    pub execution_id: ExecutionId,
    pub node_id: NodeId,
    pub attempt: u32,
    pub iteration: u32,
    pub trigger_payload: Value,
    /// Outputs of every node that has produced one so far
    pub prior_outputs: BTreeMap<NodeId, Value>,
    /// Nodes whose satisfied edges led here
    pub upstream: Vec<NodeId>,
    pub now: DateTime<Utc>,
    pub cancel: CancellationToken,
}

impl HandlerContext {
    pub fn new(execution_id: ExecutionId, node_id: NodeId, trigger_payload: Value) -> Self {
        Self {
            execution_id,
            node_id,
            attempt: 1,
            iteration: 1,
            trigger_payload,
            prior_outputs: BTreeMap::new(),
            upstream: Vec::new(),
            now: Utc::now(),
            cancel: CancellationToken::new(),
        }
    }

    /// Cooperative cancellation check for long-running handlers
    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Look up `trigger.a.b` in the trigger payload or `<node_id>.a.b` in a
    /// prior output.
    pub fn lookup(&self, path: &str) -> Option<&Value> {
        let mut segments = path.trim().split('.');
        let root = segments.next()?;
        let rest: Vec<&str> = segments.collect();

        let base = if root == "trigger" {
            &self.trigger_payload
        } else {
            self.prior_outputs.get(&NodeId::new(root))?
        };
        resolve(base, &rest)
    }

    /// Substitute `{{path}}` placeholders in strings, recursively.
    ///
    /// A string that is exactly one placeholder takes the looked-up value
    /// with its JSON type; missing values render as null or "".
    pub fn render(&self, template: &Value) -> Value {
        match template {
            Value::String(s) => self.render_str(s),
            Value::Array(items) => Value::Array(items.iter().map(|v| self.render(v)).collect()),
            Value::Object(map) => Value::Object(
                map.iter()
                    .map(|(k, v)| (k.clone(), self.render(v)))
                    .collect(),
            ),
            other => other.clone(),
        }
    }

    fn render_str(&self, s: &str) -> Value {
        let trimmed = s.trim();
        if let Some(inner) = trimmed
            .strip_prefix("{{")
            .and_then(|rest| rest.strip_suffix("}}"))
        {
            if !inner.contains("{{") {
                return self.lookup(inner).cloned().unwrap_or(Value::Null);
            }
        }

        let mut rendered = String::with_capacity(s.len());
        let mut rest = s;
        while let Some(start) = rest.find("{{") {
            let Some(len) = rest[start..].find("}}") else {
                break;
            };
            rendered.push_str(&rest[..start]);
            let path = &rest[start + 2..start + len];
            match self.lookup(path) {
                Some(Value::String(text)) => rendered.push_str(text),
                Some(Value::Null) | None => {}
                Some(value) => rendered.push_str(&value.to_string()),
            }
            rest = &rest[start + len + 2..];
        }
        rendered.push_str(rest);
        Value::String(rendered)
    }
}

/// A unit of work bound to a `node_type`.
///
/// Handlers may be invoked more than once for the same attempt when a worker
/// loses its lease mid-dispatch; side effects must tolerate that.
#[async_trait::async_trait]
pub trait ActivityHandler: Send + Sync {
    /// The `node_type` this handler serves
    fn node_type(&self) -> &str;

    async fn execute(&self, config: &NodeConfig, ctx: &HandlerContext) -> NodeOutcome;
}

/// Maps node types to handlers. Built once at startup and shared by `Arc`.
pub struct HandlerRegistry {
    handlers: HashMap<String, Arc<dyn ActivityHandler>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self {
            handlers: HashMap::new(),
        }
    }

    /// Registry preloaded with the control-flow handlers
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        registry.register(Arc::new(PassthroughHandler));
        registry.register(Arc::new(BranchHandler));
        registry.register(Arc::new(MergeHandler));
        registry.register(Arc::new(DelayHandler));
        registry.register(Arc::new(FailHandler));
        registry
    }

    /// Register a handler, replacing any previous one for the same type
    pub fn register(&mut self, handler: Arc<dyn ActivityHandler>) {
        let node_type = handler.node_type().to_string();
        if self.handlers.insert(node_type.clone(), handler).is_some() {
            tracing::warn!(node_type = %node_type, "Replaced activity handler");
        }
    }

    pub fn get(&self, node_type: &str) -> Option<Arc<dyn ActivityHandler>> {
        self.handlers.get(node_type).cloned()
    }

    pub fn contains(&self, node_type: &str) -> bool {
        self.handlers.contains_key(node_type)
    }

    pub fn node_types(&self) -> Vec<String> {
        let mut types: Vec<String> = self.handlers.keys().cloned().collect();
        types.sort();
        types
    }

    /// Reject graphs that name a node type nobody serves
    pub fn check_graph(&self, graph: &GraphDefinition) -> Result<()> {
        for spec in graph.nodes() {
            if !self.contains(&spec.node_type) {
                return Err(EngineError::validation(format!(
                    "node {} has unknown type '{}'",
                    spec.node_id, spec.node_type
                )));
            }
        }
        Ok(())
    }
}

impl Default for HandlerRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn context() -> HandlerContext {
        let mut ctx = HandlerContext::new(
            ExecutionId::new(),
            NodeId::new("notify"),
            json!({"user": {"name": "ada", "id": 7}}),
        );
        ctx.prior_outputs
            .insert(NodeId::new("fetch"), json!({"items": ["a", "b"], "count": 2}));
        ctx
    }

    #[test]
    fn test_lookup() {
        let ctx = context();
        assert_eq!(ctx.lookup("trigger.user.name"), Some(&json!("ada")));
        assert_eq!(ctx.lookup("fetch.items.1"), Some(&json!("b")));
        assert_eq!(ctx.lookup("fetch.missing"), None);
        assert_eq!(ctx.lookup("unknown.count"), None);
    }

    #[test]
    fn test_render_templates() {
        let ctx = context();
        let rendered = ctx.render(&json!({
            "greeting": "hello {{trigger.user.name}}, {{fetch.count}} items",
            "count": "{{fetch.count}}",
            "items": ["{{fetch.items.0}}", "static"],
            "missing": "{{fetch.nothing}}",
        }));

        assert_eq!(
            rendered,
            json!({
                "greeting": "hello ada, 2 items",
                "count": 2,
                "items": ["a", "static"],
                "missing": null,
            })
        );
    }

    #[test]
    fn test_registry_checks_graph_types() {
        let registry = HandlerRegistry::with_builtins();
        assert!(registry.contains("passthrough"));
        assert_eq!(
            registry.node_types(),
            vec!["branch", "delay", "fail", "merge", "passthrough"]
        );

        let graph = GraphDefinition::from_value(json!({
            "nodes": [{"id": "a", "type": "passthrough"}, {"id": "b", "type": "ocr"}],
            "edges": [{"from": "a", "to": "b"}],
            "entry_node_id": "a"
        }))
        .unwrap();

        let err = registry.check_graph(&graph).unwrap_err();
        assert!(matches!(err, EngineError::Validation(_)));
    }
}
