//! Flow definitions.
//!
//! Flows are authored externally and stored as [`FlowDocument`]s, the loose
//! JSON shape produced by the flow editor:
//!
//! ```json
//! {"id": "...", "nodes": [{"id", "type", "data": {"config": {}}}],
//!  "edges": [{"id", "source", "target", "sourceHandle", "data": {"condition"}}]}
//! ```
//!
//! A document is compiled into a validated [`Flow`] before anything executes.
//! Node configs become a tagged [`NodeKind`] and the graph invariants are
//! checked up front, so a malformed flow is rejected at load time instead of
//! failing halfway through a conversation.

use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};

use serde::{Deserialize, Serialize};

use crate::error::{ParleyError, Result};
use crate::types::HttpMethod;

// ── Document shape ──────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FlowDocument {
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default = "default_version")]
    pub version: u32,
    /// Node that later turns continue from after the Trigger.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub restart_node_id: Option<String>,
    pub nodes: Vec<NodeDocument>,
    #[serde(default)]
    pub edges: Vec<EdgeDocument>,
}

fn default_version() -> u32 {
    1
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeDocument {
    pub id: String,
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub data: NodeData,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NodeData {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
    #[serde(default)]
    pub config: serde_json::Value,
    /// Output names promoted to the root namespace. Absent promotes all.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub promote: Option<Vec<String>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EdgeDocument {
    pub id: String,
    pub source: String,
    pub target: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_handle: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<EdgeData>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EdgeData {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub condition: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
}

// ── Node configs ────────────────────────────────────────────────

/// Per-kind node configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "config", rename_all = "snake_case")]
pub enum NodeKind {
    #[serde(alias = "webhook")]
    Trigger(TriggerConfig),
    #[serde(alias = "gpt_conversational")]
    Converse(ConverseConfig),
    #[serde(alias = "gpt_transform")]
    Extract(ExtractConfig),
    Router(RouterConfig),
    #[serde(alias = "api_call")]
    Connector(ConnectorConfig),
    #[serde(alias = "send_message")]
    Messenger(MessengerConfig),
    #[serde(alias = "mercadopago_payment")]
    PaymentLink(PaymentLinkConfig),
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TriggerConfig {}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RouterConfig {}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConverseConfig {
    pub system_prompt: String,
    /// Keyword-matched knowledge snippets injected into the prompt.
    #[serde(default)]
    pub topics: Vec<Topic>,
    /// Extra variables the model may return alongside its reply.
    #[serde(default)]
    pub outputs: Vec<String>,
    #[serde(default)]
    pub fallback_reply: Option<String>,
    /// How many transcript entries to send. Defaults to the engine setting.
    #[serde(default)]
    pub history_window: Option<usize>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Topic {
    pub title: String,
    pub content: String,
    #[serde(default)]
    pub keywords: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExtractConfig {
    #[serde(default)]
    pub system_prompt: String,
    pub fields: Vec<FieldSpec>,
    /// Template for the text to extract from. Defaults to the transcript.
    #[serde(default)]
    pub input: Option<String>,
    #[serde(default)]
    pub history_window: Option<usize>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FieldSpec {
    pub name: String,
    #[serde(rename = "type", default)]
    pub kind: FieldType,
    #[serde(default)]
    pub required: bool,
    #[serde(default)]
    pub description: Option<String>,
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum FieldType {
    #[default]
    #[serde(alias = "text")]
    String,
    Number,
    #[serde(alias = "bool")]
    Boolean,
    Array,
    Object,
}

impl FieldType {
    pub fn json_type(&self) -> &'static str {
        match self {
            Self::String => "string",
            Self::Number => "number",
            Self::Boolean => "boolean",
            Self::Array => "array",
            Self::Object => "object",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectorConfig {
    /// Named integration (endpoint id) the call goes through.
    #[serde(alias = "endpointId")]
    pub integration: String,
    #[serde(default)]
    pub method: HttpMethod,
    #[serde(default)]
    pub path: String,
    #[serde(default, alias = "params")]
    pub query: BTreeMap<String, serde_json::Value>,
    #[serde(default)]
    pub body: Option<serde_json::Value>,
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
    /// Dot path to the result array inside the response body.
    #[serde(default)]
    pub array_path: Option<String>,
    #[serde(default)]
    pub timeout_secs: Option<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessengerConfig {
    pub message: String,
    /// Recipient template. Defaults to `{{from}}`.
    #[serde(default)]
    pub to: Option<String>,
    #[serde(default)]
    pub list: Option<ListFormat>,
}

/// Renders an array variable into `{{list}}` for the message template.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ListFormat {
    /// Path of the array variable.
    pub source: String,
    /// Per-item template; sees the item's fields plus `index` and `item`.
    pub item: String,
    #[serde(default = "default_separator")]
    pub separator: String,
    #[serde(default)]
    pub max_items: Option<usize>,
    /// Text bound to `{{list}}` when the array is empty or missing.
    #[serde(default)]
    pub empty: Option<String>,
}

fn default_separator() -> String {
    "\n".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PaymentLinkConfig {
    pub title: String,
    /// Number or template resolving to a number.
    pub amount: serde_json::Value,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub currency: Option<String>,
}

impl NodeKind {
    /// Parse a document's `type` + `data.config` pair.
    pub fn from_document(kind: &str, config: serde_json::Value) -> Result<Self> {
        let config = match config {
            serde_json::Value::Null => serde_json::Value::Object(Default::default()),
            other => other,
        };
        let tagged = serde_json::json!({ "type": kind, "config": config });
        Ok(serde_json::from_value(tagged)?)
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::Trigger(_) => "trigger",
            Self::Converse(_) => "converse",
            Self::Extract(_) => "extract",
            Self::Router(_) => "router",
            Self::Connector(_) => "connector",
            Self::Messenger(_) => "messenger",
            Self::PaymentLink(_) => "payment_link",
        }
    }

    /// Nodes whose execution is visible outside the engine. These run at
    /// most once per turn.
    pub fn is_side_effecting(&self) -> bool {
        matches!(
            self,
            Self::Connector(_) | Self::Messenger(_) | Self::PaymentLink(_)
        )
    }

    pub fn is_router(&self) -> bool {
        matches!(self, Self::Router(_))
    }

    pub fn is_trigger(&self) -> bool {
        matches!(self, Self::Trigger(_))
    }

    fn validate(&self) -> std::result::Result<(), String> {
        match self {
            Self::Trigger(_) | Self::Router(_) => Ok(()),
            Self::Converse(c) => {
                if c.system_prompt.trim().is_empty() {
                    return Err("systemPrompt is required".into());
                }
                Ok(())
            }
            Self::Extract(c) => {
                if c.fields.is_empty() {
                    return Err("at least one field is required".into());
                }
                let mut seen = HashSet::new();
                for field in &c.fields {
                    if field.name.trim().is_empty() {
                        return Err("field with empty name".into());
                    }
                    if matches!(field.name.as_str(), "complete" | "missing") {
                        return Err(format!("field name '{}' is reserved", field.name));
                    }
                    if !seen.insert(field.name.as_str()) {
                        return Err(format!("duplicate field '{}'", field.name));
                    }
                }
                Ok(())
            }
            Self::Connector(c) => {
                if c.integration.trim().is_empty() {
                    return Err("integration (endpoint id) is required".into());
                }
                Ok(())
            }
            Self::Messenger(c) => {
                if c.message.trim().is_empty() {
                    return Err("message is required".into());
                }
                Ok(())
            }
            Self::PaymentLink(c) => {
                if c.title.trim().is_empty() {
                    return Err("title is required".into());
                }
                if c.amount.is_null() {
                    return Err("amount is required".into());
                }
                Ok(())
            }
        }
    }
}

// ── Compiled flow ───────────────────────────────────────────────

/// Which of a node's outputs get promoted to the root namespace.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Promote {
    All,
    Only(Vec<String>),
}

impl Promote {
    pub fn allows(&self, key: &str) -> bool {
        match self {
            Self::All => true,
            Self::Only(keys) => keys.iter().any(|k| k == key),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Node {
    pub id: String,
    pub label: Option<String>,
    pub kind: NodeKind,
    pub promote: Promote,
}

#[derive(Debug, Clone)]
pub struct Edge {
    pub id: String,
    pub source: String,
    pub target: String,
    pub source_handle: Option<String>,
    /// `None` means the edge always matches.
    pub condition: Option<String>,
    pub label: Option<String>,
}

/// A validated, immutable flow graph.
#[derive(Debug, Clone)]
pub struct Flow {
    pub id: String,
    pub name: Option<String>,
    pub version: u32,
    pub restart_node_id: Option<String>,
    nodes: Vec<Node>,
    edges: Vec<Edge>,
    index: HashMap<String, usize>,
    trigger: usize,
}

impl Flow {
    /// Parse and validate a flow document from JSON text.
    pub fn from_json(json: &str) -> Result<Self> {
        let doc: FlowDocument = serde_json::from_str(json)?;
        Self::try_from(doc)
    }

    pub fn node(&self, id: &str) -> Option<&Node> {
        self.index.get(id).map(|&i| &self.nodes[i])
    }

    pub fn nodes(&self) -> &[Node] {
        &self.nodes
    }

    pub fn edges(&self) -> &[Edge] {
        &self.edges
    }

    pub fn edge(&self, id: &str) -> Option<&Edge> {
        self.edges.iter().find(|e| e.id == id)
    }

    /// The single entry node.
    pub fn trigger(&self) -> &Node {
        &self.nodes[self.trigger]
    }

    /// Outgoing edges of a node, in document order.
    pub fn outgoing<'a>(&'a self, node_id: &'a str) -> impl Iterator<Item = &'a Edge> + 'a {
        self.edges.iter().filter(move |e| e.source == node_id)
    }
}

impl TryFrom<FlowDocument> for Flow {
    type Error = ParleyError;

    fn try_from(doc: FlowDocument) -> Result<Self> {
        let flow_id = doc
            .id
            .clone()
            .filter(|id| !id.trim().is_empty())
            .ok_or_else(|| ParleyError::invalid_flow("<unnamed>", "missing flow id"))?;
        let invalid = |message: String| ParleyError::invalid_flow(flow_id.clone(), message);

        let mut nodes = Vec::with_capacity(doc.nodes.len());
        let mut index = HashMap::new();
        for nd in doc.nodes {
            check_node_id(&nd.id).map_err(&invalid)?;
            if index.contains_key(&nd.id) {
                return Err(invalid(format!("duplicate node id '{}'", nd.id)));
            }
            let kind = NodeKind::from_document(&nd.kind, nd.data.config)
                .map_err(|e| invalid(format!("node '{}': {}", nd.id, e)))?;
            kind.validate()
                .map_err(|e| invalid(format!("node '{}': {}", nd.id, e)))?;
            let promote = match nd.data.promote {
                Some(keys) => Promote::Only(keys),
                None => Promote::All,
            };
            index.insert(nd.id.clone(), nodes.len());
            nodes.push(Node {
                id: nd.id,
                label: nd.data.label,
                kind,
                promote,
            });
        }

        let triggers: Vec<usize> = nodes
            .iter()
            .enumerate()
            .filter(|(_, n)| n.kind.is_trigger())
            .map(|(i, _)| i)
            .collect();
        let trigger = match triggers.as_slice() {
            [only] => *only,
            [] => return Err(invalid("flow has no trigger node".into())),
            _ => return Err(invalid("flow has more than one trigger node".into())),
        };

        let mut edges = Vec::with_capacity(doc.edges.len());
        let mut edge_ids = HashSet::new();
        let mut out_degree = vec![0usize; nodes.len()];
        let mut in_degree = vec![0usize; nodes.len()];
        for ed in doc.edges {
            if !edge_ids.insert(ed.id.clone()) {
                return Err(invalid(format!("duplicate edge id '{}'", ed.id)));
            }
            let &src = index
                .get(&ed.source)
                .ok_or_else(|| invalid(format!("edge '{}' has unknown source '{}'", ed.id, ed.source)))?;
            let &dst = index
                .get(&ed.target)
                .ok_or_else(|| invalid(format!("edge '{}' has unknown target '{}'", ed.id, ed.target)))?;
            let data = ed.data.unwrap_or_default();
            let condition = data.condition.filter(|c| !c.trim().is_empty());
            if !nodes[src].kind.is_router() {
                if ed.source_handle.is_some() {
                    return Err(invalid(format!(
                        "edge '{}' has a sourceHandle but its source is not a router",
                        ed.id
                    )));
                }
                if condition.is_some() {
                    return Err(invalid(format!(
                        "edge '{}' has a condition but its source is not a router",
                        ed.id
                    )));
                }
            }
            out_degree[src] += 1;
            in_degree[dst] += 1;
            edges.push(Edge {
                id: ed.id,
                source: ed.source,
                target: ed.target,
                source_handle: ed.source_handle,
                condition,
                label: data.label,
            });
        }

        for (i, node) in nodes.iter().enumerate() {
            if !node.kind.is_router() && out_degree[i] > 1 {
                return Err(invalid(format!(
                    "node '{}' ({}) has {} outgoing edges; only routers may branch",
                    node.id,
                    node.kind.name(),
                    out_degree[i]
                )));
            }
        }
        if in_degree[trigger] != 0 {
            return Err(invalid("trigger node must not have incoming edges".into()));
        }
        if out_degree[trigger] != 1 {
            return Err(invalid("trigger node must have exactly one outgoing edge".into()));
        }

        if let Some(restart) = &doc.restart_node_id {
            match index.get(restart) {
                None => return Err(invalid(format!("restartNodeId '{}' is not a node", restart))),
                Some(&i) if i == trigger => {
                    return Err(invalid("restartNodeId must not be the trigger".into()))
                }
                Some(_) => {}
            }
        }

        if has_cycle(nodes.len(), &edges, &index) {
            return Err(invalid("flow graph contains a cycle".into()));
        }

        Ok(Self {
            id: flow_id,
            name: doc.name,
            version: doc.version,
            restart_node_id: doc.restart_node_id,
            nodes,
            edges,
            index,
            trigger,
        })
    }
}

fn check_node_id(id: &str) -> std::result::Result<(), String> {
    if id.is_empty() {
        return Err("node with empty id".into());
    }
    if id.chars().any(|c| c == '.' || c == '{' || c == '}' || c.is_whitespace()) {
        return Err(format!(
            "node id '{}' may not contain dots, braces or whitespace",
            id
        ));
    }
    Ok(())
}

/// Kahn's algorithm: any node left unprocessed sits on a cycle.
fn has_cycle(node_count: usize, edges: &[Edge], index: &HashMap<String, usize>) -> bool {
    let mut in_degree = vec![0usize; node_count];
    let mut adjacency = vec![Vec::new(); node_count];
    for edge in edges {
        let (src, dst) = (index[&edge.source], index[&edge.target]);
        adjacency[src].push(dst);
        in_degree[dst] += 1;
    }

    let mut queue: VecDeque<usize> = (0..node_count).filter(|&i| in_degree[i] == 0).collect();
    let mut processed = 0;
    while let Some(i) = queue.pop_front() {
        processed += 1;
        for &next in &adjacency[i] {
            in_degree[next] -= 1;
            if in_degree[next] == 0 {
                queue.push_back(next);
            }
        }
    }
    processed < node_count
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn doc(nodes: serde_json::Value, edges: serde_json::Value) -> FlowDocument {
        serde_json::from_value(json!({ "id": "f1", "nodes": nodes, "edges": edges })).unwrap()
    }

    fn linear() -> serde_json::Value {
        json!([
            {"id": "start", "type": "trigger", "data": {"config": {}}},
            {"id": "route", "type": "router"},
            {"id": "send", "type": "messenger", "data": {"config": {"message": "hi"}}}
        ])
    }

    #[test]
    fn test_valid_flow_compiles() {
        let flow = Flow::try_from(doc(
            linear(),
            json!([
                {"id": "e1", "source": "start", "target": "route"},
                {"id": "e2", "source": "route", "target": "send", "sourceHandle": "a",
                 "data": {"condition": "{{x}} exists"}}
            ]),
        ))
        .unwrap();

        assert_eq!(flow.id, "f1");
        assert_eq!(flow.version, 1);
        assert_eq!(flow.trigger().id, "start");
        assert!(matches!(flow.node("send").unwrap().kind, NodeKind::Messenger(_)));
        let out: Vec<_> = flow.outgoing("route").collect();
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].condition.as_deref(), Some("{{x}} exists"));
        assert_eq!(out[0].source_handle.as_deref(), Some("a"));
    }

    #[test]
    fn test_dangling_edge_rejected() {
        let err = Flow::try_from(doc(
            linear(),
            json!([{"id": "e1", "source": "start", "target": "nowhere"}]),
        ))
        .unwrap_err();
        assert!(err.to_string().contains("unknown target"));
    }

    #[test]
    fn test_non_router_branching_rejected() {
        let err = Flow::try_from(doc(
            json!([
                {"id": "start", "type": "trigger"},
                {"id": "a", "type": "router"},
                {"id": "b", "type": "router"}
            ]),
            json!([
                {"id": "e1", "source": "start", "target": "a"},
                {"id": "e2", "source": "start", "target": "b"}
            ]),
        ))
        .unwrap_err();
        assert!(err.to_string().contains("only routers may branch"));
    }

    #[test]
    fn test_condition_on_non_router_rejected() {
        let err = Flow::try_from(doc(
            linear(),
            json!([
                {"id": "e1", "source": "start", "target": "route", "data": {"condition": "{{a}} exists"}}
            ]),
        ))
        .unwrap_err();
        assert!(err.to_string().contains("not a router"));
    }

    #[test]
    fn test_trigger_rules() {
        let err = Flow::try_from(doc(linear(), json!([]))).unwrap_err();
        assert!(err.to_string().contains("exactly one outgoing edge"));

        let err = Flow::try_from(doc(
            json!([{"id": "route", "type": "router"}]),
            json!([]),
        ))
        .unwrap_err();
        assert!(err.to_string().contains("no trigger"));

        let err = Flow::try_from(doc(
            linear(),
            json!([
                {"id": "e1", "source": "start", "target": "route"},
                {"id": "e2", "source": "route", "target": "start"}
            ]),
        ))
        .unwrap_err();
        assert!(err.to_string().contains("incoming"));
    }

    #[test]
    fn test_cycle_rejected() {
        let err = Flow::try_from(doc(
            json!([
                {"id": "start", "type": "trigger"},
                {"id": "a", "type": "router"},
                {"id": "b", "type": "router"}
            ]),
            json!([
                {"id": "e1", "source": "start", "target": "a"},
                {"id": "e2", "source": "a", "target": "b"},
                {"id": "e3", "source": "b", "target": "a"}
            ]),
        ))
        .unwrap_err();
        assert!(err.to_string().contains("cycle"));
    }

    #[test]
    fn test_malformed_config_rejected() {
        let err = Flow::try_from(doc(
            json!([
                {"id": "start", "type": "trigger"},
                {"id": "call", "type": "connector", "data": {"config": {"method": "GET"}}}
            ]),
            json!([{"id": "e1", "source": "start", "target": "call"}]),
        ))
        .unwrap_err();
        assert!(err.to_string().contains("node 'call'"));

        let err = Flow::try_from(doc(
            json!([
                {"id": "start", "type": "trigger"},
                {"id": "call", "type": "connector", "data": {"config": {"integration": " "}}}
            ]),
            json!([{"id": "e1", "source": "start", "target": "call"}]),
        ))
        .unwrap_err();
        assert!(err.to_string().contains("integration"));
    }

    #[test]
    fn test_unknown_node_type_rejected() {
        let err = Flow::try_from(doc(
            json!([{"id": "start", "type": "teleporter"}]),
            json!([]),
        ))
        .unwrap_err();
        assert!(matches!(err, ParleyError::InvalidFlow { .. }));
    }

    #[test]
    fn test_restart_node_checked() {
        let mut d = doc(linear(), json!([{"id": "e1", "source": "start", "target": "route"}]));
        d.restart_node_id = Some("ghost".into());
        assert!(Flow::try_from(d.clone()).is_err());

        d.restart_node_id = Some("start".into());
        assert!(Flow::try_from(d.clone()).is_err());

        d.restart_node_id = Some("route".into());
        let flow = Flow::try_from(d).unwrap();
        assert_eq!(flow.restart_node_id.as_deref(), Some("route"));
    }

    #[test]
    fn test_node_id_with_dot_rejected() {
        let err = Flow::try_from(doc(
            json!([{"id": "a.b", "type": "trigger"}]),
            json!([]),
        ))
        .unwrap_err();
        assert!(err.to_string().contains("dots"));
    }

    #[test]
    fn test_aliases_and_promote() {
        let flow = Flow::try_from(doc(
            json!([
                {"id": "start", "type": "webhook"},
                {"id": "call", "type": "api_call",
                 "data": {"config": {"endpointId": "shop", "params": {"search": "{{q}}"}},
                          "promote": ["items"]}}
            ]),
            json!([{"id": "e1", "source": "start", "target": "call"}]),
        ))
        .unwrap();

        let call = flow.node("call").unwrap();
        match &call.kind {
            NodeKind::Connector(c) => {
                assert_eq!(c.integration, "shop");
                assert_eq!(c.method, HttpMethod::Get);
                assert_eq!(c.query["search"], json!("{{q}}"));
            }
            other => panic!("unexpected kind {:?}", other),
        }
        assert!(call.kind.is_side_effecting());
        assert!(call.promote.allows("items"));
        assert!(!call.promote.allows("body"));
        assert_eq!(flow.trigger().promote, Promote::All);
    }
}
