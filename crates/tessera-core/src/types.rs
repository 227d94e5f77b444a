use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

macro_rules! define_id {
    ($(#[$meta:meta])* $name:ident, $prefix:literal) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Hash, Eq, PartialEq, Ord, PartialOrd, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(pub String);

        impl $name {
            pub fn new() -> Self {
                Self(format!("{}-{}", $prefix, Uuid::new_v4()))
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl From<&str> for $name {
            fn from(s: &str) -> Self {
                Self(s.to_string())
            }
        }

        impl From<String> for $name {
            fn from(s: String) -> Self {
                Self(s)
            }
        }
    };
}

define_id!(
    /// Unique node identifier.
    NodeId,
    "nd"
);
define_id!(
    /// Unique port identifier. Ports are never shared across nodes.
    PortId,
    "pt"
);
define_id!(EdgeId, "ed");
define_id!(
    /// Identifies a blueprint/workspace.
    WorkspaceId,
    "wrks"
);
define_id!(ActId, "act");
define_id!(GenerationId, "gnr");

/// Kind of a port, and of the edges that connect ports of that kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PortKind {
    /// Control-flow port: orders execution.
    Execution,
    /// Value port: carries an upstream output into a downstream context.
    Data,
}

impl std::fmt::Display for PortKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Execution => write!(f, "execution"),
            Self::Data => write!(f, "data"),
        }
    }
}

/// One entry of an execution plan.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Step {
    pub node_id: NodeId,
    /// Position in the total order.
    pub order: usize,
    /// Longest control path from a root; steps of one level share no
    /// control dependency.
    pub level: usize,
}

/// Reserved context key under which retrieval results are exposed.
pub const RETRIEVAL_KEY: &str = "$retrieval";

/// A single hit returned by the query collaborator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueryResult {
    pub content: String,
    pub score: f32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,
    #[serde(default)]
    pub metadata: serde_json::Value,
}

/// Input context of a node: upstream values bound to the node's input
/// accessor names, plus optional retrieval results.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct InputContext {
    inputs: BTreeMap<String, serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    retrieval: Option<Vec<QueryResult>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    retrieval_error: Option<String>,
}

impl InputContext {
    pub fn new() -> Self {
        Self::default()
    }

    /// Bind a value to an accessor name.
    pub fn bind(&mut self, accessor: impl Into<String>, value: serde_json::Value) {
        self.inputs.insert(accessor.into(), value);
    }

    pub fn get(&self, accessor: &str) -> Option<&serde_json::Value> {
        self.inputs.get(accessor)
    }

    /// Get a bound value as a string, if it's a string.
    pub fn get_str(&self, accessor: &str) -> Option<&str> {
        self.inputs.get(accessor).and_then(|v| v.as_str())
    }

    pub fn inputs(&self) -> &BTreeMap<String, serde_json::Value> {
        &self.inputs
    }

    pub fn set_retrieval(&mut self, results: Vec<QueryResult>) {
        self.retrieval = Some(results);
    }

    pub fn retrieval(&self) -> Option<&[QueryResult]> {
        self.retrieval.as_deref()
    }

    pub fn set_retrieval_error(&mut self, error: impl Into<String>) {
        self.retrieval_error = Some(error.into());
    }

    pub fn retrieval_error(&self) -> Option<&str> {
        self.retrieval_error.as_deref()
    }

    pub fn is_empty(&self) -> bool {
        self.inputs.is_empty() && self.retrieval.is_none()
    }

    /// Flatten into a single JSON object: accessors as keys, retrieval
    /// results under [`RETRIEVAL_KEY`].
    pub fn to_value(&self) -> serde_json::Value {
        let mut map: serde_json::Map<String, serde_json::Value> = self
            .inputs
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        if let Some(results) = &self.retrieval {
            map.insert(
                RETRIEVAL_KEY.to_string(),
                serde_json::to_value(results).unwrap_or(serde_json::Value::Null),
            );
        }
        serde_json::Value::Object(map)
    }

    /// Render `{{accessor}}` placeholders with bound values. Unknown
    /// placeholders are left untouched.
    pub fn render(&self, template: &str) -> String {
        let mut out = template.to_string();
        for (key, value) in &self.inputs {
            let display = match value {
                serde_json::Value::String(s) => s.clone(),
                other => other.to_string(),
            };
            out = out.replace(&format!("{{{{{}}}}}", key), &display);
        }
        out
    }
}
