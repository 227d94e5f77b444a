use serde::{Deserialize, Serialize};

use tessera_core::types::{NodeId, PortId, PortKind};

/// Work a node performs, discriminated by `type`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum NodeContent {
    /// Language-model text generation.
    TextGeneration { model: String, prompt: String },
    /// Tool/action call against an external provider.
    Action {
        provider: String,
        action: String,
        #[serde(default)]
        parameters: serde_json::Value,
    },
    /// Vector-store query.
    Query {
        query: String,
        #[serde(default = "default_max_results")]
        max_results: usize,
        #[serde(default)]
        similarity_threshold: f32,
    },
    /// Uploaded files made available downstream.
    File {
        category: String,
        #[serde(default)]
        files: Vec<String>,
    },
    /// Entry point fired by an external event.
    Trigger { provider: String, event: String },
    /// Static text.
    Text { text: String },
}

fn default_max_results() -> usize {
    5
}

/// The closed set of node kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum NodeKind {
    TextGeneration,
    Action,
    Query,
    File,
    Trigger,
    Text,
}

impl std::fmt::Display for NodeKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::TextGeneration => "textGeneration",
            Self::Action => "action",
            Self::Query => "query",
            Self::File => "file",
            Self::Trigger => "trigger",
            Self::Text => "text",
        };
        f.write_str(name)
    }
}

impl NodeContent {
    pub fn kind(&self) -> NodeKind {
        match self {
            Self::TextGeneration { .. } => NodeKind::TextGeneration,
            Self::Action { .. } => NodeKind::Action,
            Self::Query { .. } => NodeKind::Query,
            Self::File { .. } => NodeKind::File,
            Self::Trigger { .. } => NodeKind::Trigger,
            Self::Text { .. } => NodeKind::Text,
        }
    }
}

/// How a retrieval failure affects the node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RetrievalPolicy {
    /// Query failure fails the generation.
    Required,
    /// Query failure is recorded in the context and the node still runs.
    BestEffort,
}

/// Retrieval dependency declared by a node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetrievalSpec {
    /// Query text; `{{accessor}}` placeholders are filled from the context.
    pub query: String,
    #[serde(default = "default_max_results")]
    pub max_results: usize,
    #[serde(default)]
    pub similarity_threshold: f32,
    /// Defaults by node kind when unset (see [`Node::retrieval_policy`]).
    #[serde(default)]
    pub policy: Option<RetrievalPolicy>,
}

impl RetrievalSpec {
    pub fn new(query: impl Into<String>) -> Self {
        Self {
            query: query.into(),
            max_results: default_max_results(),
            similarity_threshold: 0.0,
            policy: None,
        }
    }

    pub fn with_policy(mut self, policy: RetrievalPolicy) -> Self {
        self.policy = Some(policy);
        self
    }
}

/// Which side of a node a port sits on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Input,
    Output,
}

/// A typed connection point on a node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Port {
    pub id: PortId,
    pub kind: PortKind,
    #[serde(default)]
    pub label: Option<String>,
    /// Name under which a bound value appears in the input context.
    pub accessor: String,
    /// Owning node.
    pub node_id: NodeId,
}

/// Port declaration in a node template; ids are assigned on instantiation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PortSpec {
    pub kind: PortKind,
    #[serde(default)]
    pub label: Option<String>,
    #[serde(default)]
    pub accessor: Option<String>,
}

impl PortSpec {
    pub fn execution() -> Self {
        Self {
            kind: PortKind::Execution,
            label: None,
            accessor: None,
        }
    }

    pub fn data(accessor: impl Into<String>) -> Self {
        Self {
            kind: PortKind::Data,
            label: None,
            accessor: Some(accessor.into()),
        }
    }

    pub fn with_label(mut self, label: impl Into<String>) -> Self {
        self.label = Some(label.into());
        self
    }

    fn instantiate(self, node_id: &NodeId) -> Port {
        let id = PortId::new();
        let accessor = self
            .accessor
            .or_else(|| self.label.clone())
            .unwrap_or_else(|| id.to_string());
        Port {
            id,
            kind: self.kind,
            label: self.label,
            accessor,
            node_id: node_id.clone(),
        }
    }
}

/// A typed unit of work in the graph.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Node {
    pub id: NodeId,
    pub name: String,
    pub content: NodeContent,
    #[serde(default)]
    pub inputs: Vec<Port>,
    #[serde(default)]
    pub outputs: Vec<Port>,
    /// A failure of this node does not fail the act.
    #[serde(default)]
    pub best_effort: bool,
    /// Per-attempt timeout.
    #[serde(default)]
    pub timeout_ms: Option<u64>,
    #[serde(default)]
    pub retrieval: Option<RetrievalSpec>,
}

impl Node {
    pub fn kind(&self) -> NodeKind {
        self.content.kind()
    }

    /// Find a port on this node and report which side it is on.
    pub fn port(&self, port_id: &PortId) -> Option<(&Port, Direction)> {
        self.inputs
            .iter()
            .find(|p| &p.id == port_id)
            .map(|p| (p, Direction::Input))
            .or_else(|| {
                self.outputs
                    .iter()
                    .find(|p| &p.id == port_id)
                    .map(|p| (p, Direction::Output))
            })
    }

    pub fn has_port(&self, port_id: &PortId) -> bool {
        self.port(port_id).is_some()
    }

    /// Input port of the given kind, first declared wins.
    pub fn input_of_kind(&self, kind: PortKind) -> Option<&Port> {
        self.inputs.iter().find(|p| p.kind == kind)
    }

    /// Output port of the given kind, first declared wins.
    pub fn output_of_kind(&self, kind: PortKind) -> Option<&Port> {
        self.outputs.iter().find(|p| p.kind == kind)
    }

    pub fn input_by_accessor(&self, accessor: &str) -> Option<&Port> {
        self.inputs.iter().find(|p| p.accessor == accessor)
    }

    pub fn output_by_accessor(&self, accessor: &str) -> Option<&Port> {
        self.outputs.iter().find(|p| p.accessor == accessor)
    }

    pub fn data_inputs(&self) -> impl Iterator<Item = &Port> {
        self.inputs.iter().filter(|p| p.kind == PortKind::Data)
    }

    /// Effective retrieval policy: explicit, else required for query nodes
    /// and best-effort for everything else.
    pub fn retrieval_policy(&self) -> Option<RetrievalPolicy> {
        let spec = self.retrieval.as_ref()?;
        Some(spec.policy.unwrap_or(match self.kind() {
            NodeKind::Query => RetrievalPolicy::Required,
            _ => RetrievalPolicy::BestEffort,
        }))
    }
}

/// Node definition used when adding a node to a blueprint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeTemplate {
    pub name: String,
    pub content: NodeContent,
    pub inputs: Vec<PortSpec>,
    pub outputs: Vec<PortSpec>,
    #[serde(default)]
    pub best_effort: bool,
    #[serde(default)]
    pub timeout_ms: Option<u64>,
    #[serde(default)]
    pub retrieval: Option<RetrievalSpec>,
}

impl NodeTemplate {
    /// Template with the default ports for the content's kind: an execution
    /// input (except triggers), an execution output and an `output` data port.
    pub fn new(name: impl Into<String>, content: NodeContent) -> Self {
        let inputs = match content.kind() {
            NodeKind::Trigger => vec![],
            _ => vec![PortSpec::execution()],
        };
        Self {
            name: name.into(),
            content,
            inputs,
            outputs: vec![PortSpec::execution(), PortSpec::data("output")],
            best_effort: false,
            timeout_ms: None,
            retrieval: None,
        }
    }

    /// Drop the default ports.
    pub fn without_default_ports(mut self) -> Self {
        self.inputs.clear();
        self.outputs.clear();
        self
    }

    pub fn with_input(mut self, port: PortSpec) -> Self {
        self.inputs.push(port);
        self
    }

    pub fn with_output(mut self, port: PortSpec) -> Self {
        self.outputs.push(port);
        self
    }

    pub fn best_effort(mut self) -> Self {
        self.best_effort = true;
        self
    }

    pub fn with_timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.timeout_ms = Some(timeout_ms);
        self
    }

    pub fn with_retrieval(mut self, spec: RetrievalSpec) -> Self {
        self.retrieval = Some(spec);
        self
    }

    /// Assign fresh node and port ids.
    pub fn instantiate(self) -> Node {
        let id = NodeId::new();
        Node {
            inputs: self.inputs.into_iter().map(|p| p.instantiate(&id)).collect(),
            outputs: self.outputs.into_iter().map(|p| p.instantiate(&id)).collect(),
            id,
            name: self.name,
            content: self.content,
            best_effort: self.best_effort,
            timeout_ms: self.timeout_ms,
            retrieval: self.retrieval,
        }
    }
}
