use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::types::{EdgeId, NodeId, PortId};

/// Structural problems with a blueprint, raised while editing or planning.
///
/// These are surfaced synchronously to whoever is building the graph and are
/// never retried.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum GraphValidationError {
    #[error("STARTING_POINT_NOT_FOUND: every node has an incoming control edge")]
    StartingPointNotFound,

    #[error("ENDING_POINT_NOT_FOUND: every node has an outgoing control edge")]
    EndingPointNotFound,

    #[error("CYCLE_DETECTED: control flow cannot order {nodes:?}")]
    CycleDetected { nodes: Vec<NodeId> },

    #[error("Incompatible ports {from} -> {to}: {reason}")]
    IncompatiblePort {
        from: PortId,
        to: PortId,
        reason: String,
    },

    #[error("Control input {port} already has an incoming edge")]
    DuplicateControlEdge { port: PortId },

    #[error("Edge {from} -> {to} already exists")]
    DuplicateEdge { from: PortId, to: PortId },

    #[error("Node not found: {node}")]
    UnknownNode { node: NodeId },

    #[error("Port not found: {port}")]
    UnknownPort { port: PortId },

    #[error("Edge not found: {edge}")]
    UnknownEdge { edge: EdgeId },

    #[error("Edge {edge} references a port outside the blueprint")]
    DanglingEdge { edge: EdgeId },
}

impl GraphValidationError {
    /// Stable machine-readable code for the UI layer.
    pub fn code(&self) -> &'static str {
        match self {
            Self::StartingPointNotFound => "STARTING_POINT_NOT_FOUND",
            Self::EndingPointNotFound => "ENDING_POINT_NOT_FOUND",
            Self::CycleDetected { .. } => "CYCLE_DETECTED",
            Self::IncompatiblePort { .. } => "INCOMPATIBLE_PORT",
            Self::DuplicateControlEdge { .. } => "DUPLICATE_CONTROL_EDGE",
            Self::DuplicateEdge { .. } => "DUPLICATE_EDGE",
            Self::UnknownNode { .. } => "UNKNOWN_NODE",
            Self::UnknownPort { .. } => "UNKNOWN_PORT",
            Self::UnknownEdge { .. } => "UNKNOWN_EDGE",
            Self::DanglingEdge { .. } => "DANGLING_EDGE",
        }
    }
}

/// Failure reported by the execution capability for one attempt.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum CapabilityError {
    #[error("Rate limited (retry after {retry_after_ms:?}ms)")]
    RateLimited { retry_after_ms: Option<u64> },

    #[error("Capability call timed out")]
    Timeout,

    #[error("Remote failure: {message}")]
    Remote { message: String, retryable: bool },

    #[error("Unsupported node kind: {node_kind}")]
    Unsupported { node_kind: String },
}

impl CapabilityError {
    pub fn remote(message: impl Into<String>) -> Self {
        Self::Remote {
            message: message.into(),
            retryable: false,
        }
    }

    pub fn transient(message: impl Into<String>) -> Self {
        Self::Remote {
            message: message.into(),
            retryable: true,
        }
    }

    /// Whether another attempt may succeed.
    pub fn is_transient(&self) -> bool {
        match self {
            Self::RateLimited { .. } | Self::Timeout => true,
            Self::Remote { retryable, .. } => *retryable,
            Self::Unsupported { .. } => false,
        }
    }
}

/// Structured error stored on a failed generation.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum GenerationError {
    #[error("Upstream context error: {message}")]
    UpstreamContext { message: String },

    #[error("Unresolved dependency on node {upstream}")]
    UnresolvedDependency { upstream: NodeId },

    #[error("{error}")]
    Capability { error: CapabilityError },

    #[error("Timed out after {after_ms}ms")]
    Timeout { after_ms: u64 },

    #[error("Cancelled")]
    Cancelled,

    /// A state transition could not be recorded, or the task driving the
    /// generation died.
    #[error("Generation lost: {message}")]
    Lost { message: String },
}

impl GenerationError {
    /// Invariant violations that indicate an orchestrator bug.
    pub fn is_defect(&self) -> bool {
        matches!(self, Self::UnresolvedDependency { .. })
    }

    /// Failures that end the act even on a best-effort node.
    pub fn is_fatal(&self) -> bool {
        self.is_defect() || matches!(self, Self::Lost { .. })
    }
}

#[derive(Debug, Error)]
pub enum TesseraError {
    #[error("Graph validation failed: {0}")]
    Validation(#[from] GraphValidationError),

    #[error("Unresolved dependency: node {node} requires {upstream}")]
    UnresolvedDependency { node: NodeId, upstream: NodeId },

    #[error("Capability error: {0}")]
    Capability(#[from] CapabilityError),

    #[error("Invalid transition for {id}: {from} -> {to}")]
    InvalidTransition { id: String, from: String, to: String },

    #[error("{kind} not found: {id}")]
    NotFound { kind: &'static str, id: String },

    #[error("Act cancelled")]
    Cancelled,

    // Storage errors
    #[error("Database error: {0}")]
    Database(String),

    // Config errors
    #[error("Config error: {0}")]
    Config(String),

    #[error("Config file not found: {0}")]
    ConfigNotFound(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl TesseraError {
    pub fn not_found(kind: &'static str, id: impl std::fmt::Display) -> Self {
        Self::NotFound {
            kind,
            id: id.to_string(),
        }
    }
}

pub type Result<T> = std::result::Result<T, TesseraError>;
