use super::condition::Condition;
use super::retry::Backoff;
use crate::clock::MAX_DURATION_SECS;
use crate::error::{EngineError, Result};
use crate::types::NodeId;
use petgraph::graph::{DiGraph, NodeIndex};
use petgraph::visit::{depth_first_search, DfsEvent};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};

/// Opaque per-node configuration, interpreted only by the node's handler
pub type NodeConfig = serde_json::Map<String, serde_json::Value>;

/// Specification for a single node
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeSpec {
    #[serde(rename = "id")]
    pub node_id: NodeId,
    #[serde(rename = "type")]
    pub node_type: String,
    #[serde(default)]
    pub config: NodeConfig,
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default)]
    pub backoff: Backoff,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_secs: Option<u64>,
    #[serde(default = "default_timeout_retriable")]
    pub timeout_retriable: bool,
    /// Cap on how many times a loop head may be entered
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_iterations: Option<u32>,
}

fn default_max_attempts() -> u32 {
    1
}

fn default_timeout_retriable() -> bool {
    true
}

impl NodeSpec {
    pub fn new(node_id: impl Into<String>, node_type: impl Into<String>) -> Self {
        Self {
            node_id: NodeId::new(node_id),
            node_type: node_type.into(),
            config: NodeConfig::new(),
            max_attempts: default_max_attempts(),
            backoff: Backoff::default(),
            timeout_secs: None,
            timeout_retriable: default_timeout_retriable(),
            max_iterations: None,
        }
    }
}

/// Directed edge between two nodes
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Edge {
    #[serde(rename = "from")]
    pub from_node_id: NodeId,
    #[serde(rename = "to")]
    pub to_node_id: NodeId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub condition: Option<String>,
}

impl Edge {
    pub fn new(from: impl Into<String>, to: impl Into<String>) -> Self {
        Self {
            from_node_id: NodeId::new(from),
            to_node_id: NodeId::new(to),
            condition: None,
        }
    }

    pub fn when(mut self, condition: impl Into<String>) -> Self {
        self.condition = Some(condition.into());
        self
    }
}

/// Wire form of a graph definition
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GraphDocument {
    pub nodes: Vec<NodeSpec>,
    #[serde(default)]
    pub edges: Vec<Edge>,
    pub entry_node_id: NodeId,
}

/// Validated, immutable graph definition.
///
/// Deserializing always re-runs validation, so a stored snapshot can never
/// come back in a shape the engine would not accept.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(try_from = "GraphDocument", into = "GraphDocument")]
pub struct GraphDefinition {
    nodes: BTreeMap<NodeId, NodeSpec>,
    edges: Vec<Edge>,
    entry_node_id: NodeId,
    conditions: Vec<Option<Condition>>,
    incoming: HashMap<NodeId, Vec<usize>>,
    outgoing: HashMap<NodeId, Vec<usize>>,
    back_edges: BTreeSet<usize>,
}

impl GraphDefinition {
    /// Parse and validate a JSON graph document
    pub fn load(raw: &str) -> Result<Self> {
        let document: GraphDocument = serde_json::from_str(raw)
            .map_err(|e| EngineError::validation(format!("malformed graph document: {}", e)))?;
        Self::from_document(document)
    }

    pub fn from_value(value: serde_json::Value) -> Result<Self> {
        let document: GraphDocument = serde_json::from_value(value)
            .map_err(|e| EngineError::validation(format!("malformed graph document: {}", e)))?;
        Self::from_document(document)
    }

    pub fn from_document(document: GraphDocument) -> Result<Self> {
        let GraphDocument {
            nodes: node_list,
            edges,
            entry_node_id,
        } = document;

        if node_list.is_empty() {
            return Err(EngineError::validation("graph has no nodes"));
        }

        let mut graph: DiGraph<NodeId, usize> = DiGraph::new();
        let mut indices: HashMap<NodeId, NodeIndex> = HashMap::new();
        let mut nodes = BTreeMap::new();

        for spec in node_list {
            if spec.node_type.trim().is_empty() {
                return Err(EngineError::validation(format!(
                    "node {} has no type",
                    spec.node_id
                )));
            }
            if spec.max_attempts == 0 {
                return Err(EngineError::validation(format!(
                    "node {} declares max_attempts = 0",
                    spec.node_id
                )));
            }
            if spec.backoff.max_secs() > MAX_DURATION_SECS
                || spec.timeout_secs.map_or(false, |secs| secs > MAX_DURATION_SECS)
            {
                return Err(EngineError::validation(format!(
                    "node {} declares a backoff or timeout above {} seconds",
                    spec.node_id, MAX_DURATION_SECS
                )));
            }
            if indices.contains_key(&spec.node_id) {
                return Err(EngineError::validation(format!(
                    "duplicate node id {}",
                    spec.node_id
                )));
            }
            let index = graph.add_node(spec.node_id.clone());
            indices.insert(spec.node_id.clone(), index);
            nodes.insert(spec.node_id.clone(), spec);
        }

        let entry_index = *indices.get(&entry_node_id).ok_or_else(|| {
            EngineError::validation(format!("entry node {} is not defined", entry_node_id))
        })?;

        let mut incoming: HashMap<NodeId, Vec<usize>> = HashMap::new();
        let mut outgoing: HashMap<NodeId, Vec<usize>> = HashMap::new();
        let mut conditions = Vec::with_capacity(edges.len());

        for (position, edge) in edges.iter().enumerate() {
            let from = indices.get(&edge.from_node_id).ok_or_else(|| {
                EngineError::validation(format!(
                    "edge {} -> {} starts at an undefined node",
                    edge.from_node_id, edge.to_node_id
                ))
            })?;
            let to = indices.get(&edge.to_node_id).ok_or_else(|| {
                EngineError::validation(format!(
                    "edge {} -> {} ends at an undefined node",
                    edge.from_node_id, edge.to_node_id
                ))
            })?;

            graph.add_edge(*from, *to, position);
            outgoing
                .entry(edge.from_node_id.clone())
                .or_default()
                .push(position);
            incoming
                .entry(edge.to_node_id.clone())
                .or_default()
                .push(position);

            let condition = edge
                .condition
                .as_deref()
                .map(Condition::parse)
                .transpose()?;
            conditions.push(condition);
        }

        // Back-edges close loops; everything else is a forward dependency
        let mut back_edges = BTreeSet::new();
        depth_first_search(&graph, Some(entry_index), |event| {
            if let DfsEvent::BackEdge(u, v) = event {
                for edge in graph.edges_connecting(u, v) {
                    back_edges.insert(*edge.weight());
                }
            }
        });

        for position in &back_edges {
            let head = &edges[*position].to_node_id;
            let capped = nodes
                .get(head)
                .and_then(|spec: &NodeSpec| spec.max_iterations)
                .map_or(false, |max| max > 0);
            if !capped {
                return Err(EngineError::validation(format!(
                    "node {} is the target of loop edge {} -> {} but declares no max_iterations",
                    head, edges[*position].from_node_id, head
                )));
            }
        }

        // Without a sink no path can finish
        if !nodes.keys().any(|id| outgoing.get(id).map_or(true, Vec::is_empty)) {
            return Err(EngineError::validation(
                "graph has no terminal node (every node has outgoing edges)",
            ));
        }

        Ok(Self {
            nodes,
            edges,
            entry_node_id,
            conditions,
            incoming,
            outgoing,
            back_edges,
        })
    }

    pub fn entry_node_id(&self) -> &NodeId {
        &self.entry_node_id
    }

    pub fn node(&self, node_id: &NodeId) -> Option<&NodeSpec> {
        self.nodes.get(node_id)
    }

    pub fn nodes(&self) -> impl Iterator<Item = &NodeSpec> {
        self.nodes.values()
    }

    pub fn node_ids(&self) -> impl Iterator<Item = &NodeId> {
        self.nodes.keys()
    }

    pub fn edges(&self) -> &[Edge] {
        &self.edges
    }

    pub fn edge(&self, position: usize) -> &Edge {
        &self.edges[position]
    }

    pub fn condition(&self, position: usize) -> Option<&Condition> {
        self.conditions.get(position).and_then(Option::as_ref)
    }

    /// Edge positions pointing into `node_id`
    pub fn incoming(&self, node_id: &NodeId) -> &[usize] {
        self.incoming.get(node_id).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Edge positions leaving `node_id`
    pub fn outgoing(&self, node_id: &NodeId) -> &[usize] {
        self.outgoing.get(node_id).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn is_back_edge(&self, position: usize) -> bool {
        self.back_edges.contains(&position)
    }

    /// Terminal nodes have no outgoing edges
    pub fn is_terminal(&self, node_id: &NodeId) -> bool {
        self.outgoing(node_id).is_empty()
    }

    /// Nodes reachable from `start` over forward edges, `start` included
    pub fn forward_region(&self, start: &NodeId) -> BTreeSet<NodeId> {
        let mut seen = BTreeSet::new();
        let mut queue = VecDeque::from([start.clone()]);

        while let Some(node_id) = queue.pop_front() {
            if !seen.insert(node_id.clone()) {
                continue;
            }
            for &position in self.outgoing(&node_id) {
                if !self.is_back_edge(position) {
                    queue.push_back(self.edges[position].to_node_id.clone());
                }
            }
        }

        seen
    }

    /// Whether a terminal node is reachable from `start` without entering `blocked`
    pub fn reaches_terminal(&self, start: &NodeId, blocked: &BTreeSet<NodeId>) -> bool {
        let mut seen = BTreeSet::new();
        let mut queue = VecDeque::from([start.clone()]);

        while let Some(node_id) = queue.pop_front() {
            if blocked.contains(&node_id) || !seen.insert(node_id.clone()) {
                continue;
            }
            if self.is_terminal(&node_id) {
                return true;
            }
            for &position in self.outgoing(&node_id) {
                queue.push_back(self.edges[position].to_node_id.clone());
            }
        }

        false
    }
}

impl TryFrom<GraphDocument> for GraphDefinition {
    type Error = EngineError;

    fn try_from(document: GraphDocument) -> Result<Self> {
        Self::from_document(document)
    }
}

impl From<GraphDefinition> for GraphDocument {
    fn from(graph: GraphDefinition) -> Self {
        Self {
            nodes: graph.nodes.into_values().collect(),
            edges: graph.edges,
            entry_node_id: graph.entry_node_id,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn document(nodes: Vec<NodeSpec>, edges: Vec<Edge>, entry: &str) -> GraphDocument {
        GraphDocument {
            nodes,
            edges,
            entry_node_id: NodeId::new(entry),
        }
    }

    #[test]
    fn test_load_wire_format() {
        let raw = json!({
            "nodes": [
                {"id": "a", "type": "passthrough", "config": {"value": 1}},
                {"id": "b", "type": "branch", "config": {"from": "a"}, "max_attempts": 3},
                {"id": "c", "type": "passthrough"}
            ],
            "edges": [
                {"from": "a", "to": "b"},
                {"from": "b", "to": "c", "condition": "output == 1"}
            ],
            "entry_node_id": "a"
        })
        .to_string();

        let graph = GraphDefinition::load(&raw).unwrap();
        assert_eq!(graph.entry_node_id().as_str(), "a");
        assert_eq!(graph.node(&NodeId::new("b")).unwrap().max_attempts, 3);
        assert!(graph.condition(1).is_some());
        assert!(graph.is_terminal(&NodeId::new("c")));
        assert!(!graph.is_back_edge(0));
    }

    #[test]
    fn test_missing_entry_rejected() {
        let doc = document(vec![NodeSpec::new("a", "passthrough")], vec![], "zzz");
        let err = GraphDefinition::from_document(doc).unwrap_err();
        assert!(err.to_string().contains("entry node zzz"));
    }

    #[test]
    fn test_dangling_edge_rejected() {
        let doc = document(
            vec![NodeSpec::new("a", "passthrough")],
            vec![Edge::new("a", "ghost")],
            "a",
        );
        let err = GraphDefinition::from_document(doc).unwrap_err();
        assert!(err.to_string().contains("undefined node"));
    }

    #[test]
    fn test_duplicate_node_rejected() {
        let doc = document(
            vec![
                NodeSpec::new("a", "passthrough"),
                NodeSpec::new("a", "passthrough"),
            ],
            vec![],
            "a",
        );
        let err = GraphDefinition::from_document(doc).unwrap_err();
        assert!(err.to_string().contains("duplicate node id a"));
    }

    #[test]
    fn test_bad_condition_rejected() {
        let doc = document(
            vec![
                NodeSpec::new("a", "passthrough"),
                NodeSpec::new("b", "passthrough"),
            ],
            vec![Edge::new("a", "b").when("nonsense == 1")],
            "a",
        );
        assert!(GraphDefinition::from_document(doc).is_err());
    }

    #[test]
    fn test_out_of_range_durations_rejected() {
        let mut slow = NodeSpec::new("a", "passthrough");
        slow.timeout_secs = Some(u64::MAX);
        let err = GraphDefinition::from_document(document(vec![slow], vec![], "a")).unwrap_err();
        assert!(matches!(err, EngineError::Validation(_)));

        let mut patient = NodeSpec::new("a", "passthrough");
        patient.max_attempts = 2;
        patient.backoff = Backoff::Exponential {
            base_secs: 1,
            max_secs: 9_300_000_000_000_000,
        };
        let err = GraphDefinition::from_document(document(vec![patient], vec![], "a")).unwrap_err();
        assert!(err.to_string().contains("backoff or timeout"));

        let mut bounded = NodeSpec::new("a", "passthrough");
        bounded.backoff = Backoff::Fixed {
            secs: MAX_DURATION_SECS,
        };
        assert!(GraphDefinition::from_document(document(vec![bounded], vec![], "a")).is_ok());
    }

    #[test]
    fn test_graph_without_sink_rejected() {
        let mut a = NodeSpec::new("a", "passthrough");
        a.max_iterations = Some(3);
        let doc = document(
            vec![a, NodeSpec::new("b", "passthrough")],
            vec![Edge::new("a", "b"), Edge::new("b", "a")],
            "a",
        );
        let err = GraphDefinition::from_document(doc).unwrap_err();
        assert!(err.to_string().contains("no terminal node"));
    }

    #[test]
    fn test_uncapped_loop_rejected() {
        let doc = document(
            vec![
                NodeSpec::new("a", "passthrough"),
                NodeSpec::new("b", "passthrough"),
                NodeSpec::new("c", "passthrough"),
            ],
            vec![
                Edge::new("a", "b"),
                Edge::new("b", "a").when("output.again"),
                Edge::new("b", "c"),
            ],
            "a",
        );
        let err = GraphDefinition::from_document(doc).unwrap_err();
        assert!(err.to_string().contains("max_iterations"));
    }

    #[test]
    fn test_capped_loop_accepted() {
        let mut head = NodeSpec::new("a", "passthrough");
        head.max_iterations = Some(3);
        let doc = document(
            vec![
                head,
                NodeSpec::new("b", "passthrough"),
                NodeSpec::new("c", "passthrough"),
            ],
            vec![
                Edge::new("a", "b"),
                Edge::new("b", "a").when("output.again"),
                Edge::new("b", "c"),
            ],
            "a",
        );
        let graph = GraphDefinition::from_document(doc).unwrap();
        assert!(graph.is_back_edge(1));
        assert!(!graph.is_back_edge(0));

        let region = graph.forward_region(&NodeId::new("a"));
        assert_eq!(region.len(), 3);
    }

    #[test]
    fn test_snapshot_roundtrip_revalidates() {
        let doc = document(
            vec![
                NodeSpec::new("a", "passthrough"),
                NodeSpec::new("b", "passthrough"),
            ],
            vec![Edge::new("a", "b")],
            "a",
        );
        let graph = GraphDefinition::from_document(doc).unwrap();
        let json = serde_json::to_value(&graph).unwrap();
        let restored: GraphDefinition = serde_json::from_value(json).unwrap();
        assert_eq!(restored.edges(), graph.edges());

        let broken = json!({"nodes": [], "edges": [], "entry_node_id": "a"});
        assert!(serde_json::from_value::<GraphDefinition>(broken).is_err());
    }

    #[test]
    fn test_reaches_terminal_respects_blocked() {
        let doc = document(
            vec![
                NodeSpec::new("a", "passthrough"),
                NodeSpec::new("b", "passthrough"),
                NodeSpec::new("c", "passthrough"),
            ],
            vec![Edge::new("a", "b"), Edge::new("b", "c")],
            "a",
        );
        let graph = GraphDefinition::from_document(doc).unwrap();
        let a = NodeId::new("a");
        assert!(graph.reaches_terminal(&a, &BTreeSet::new()));
        assert!(!graph.reaches_terminal(&a, &BTreeSet::from([NodeId::new("b")])));
    }
}
