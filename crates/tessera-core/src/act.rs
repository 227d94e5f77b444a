use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{GenerationError, Result, TesseraError};
use crate::types::{ActId, GenerationId, NodeId, Step, WorkspaceId};

/// Overall status of an act.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ActStatus {
    InProgress,
    Completed,
    Failed,
    Cancelled,
}

impl ActStatus {
    pub fn is_terminal(self) -> bool {
        !matches!(self, Self::InProgress)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::InProgress => "inProgress",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }
}

impl std::fmt::Display for ActStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The first fatal failure of an act, exposed to the UI layer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActError {
    #[serde(default)]
    pub generation_id: Option<GenerationId>,
    #[serde(default)]
    pub node_id: Option<NodeId>,
    pub error: GenerationError,
}

/// One end-to-end run of a workflow, or of the subgraph reachable from a
/// chosen start node.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Act {
    pub id: ActId,
    pub workspace_id: WorkspaceId,
    /// Who is billed for agent time.
    pub owner_id: String,
    pub blueprint_version: u64,
    #[serde(default)]
    pub start_node: Option<NodeId>,
    pub status: ActStatus,
    pub steps: Vec<Step>,
    /// Generations in creation order.
    #[serde(default)]
    pub generations: Vec<GenerationId>,
    pub started_at: DateTime<Utc>,
    #[serde(default)]
    pub ended_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub agent_time_ms: u64,
    #[serde(default)]
    pub error: Option<ActError>,
}

impl Act {
    pub fn new(
        workspace_id: WorkspaceId,
        owner_id: impl Into<String>,
        blueprint_version: u64,
        start_node: Option<NodeId>,
        steps: Vec<Step>,
    ) -> Self {
        Self {
            id: ActId::new(),
            workspace_id,
            owner_id: owner_id.into(),
            blueprint_version,
            start_node,
            status: ActStatus::InProgress,
            steps,
            generations: vec![],
            started_at: Utc::now(),
            ended_at: None,
            agent_time_ms: 0,
            error: None,
        }
    }

    /// Move the act to a terminal status. Only valid once.
    pub fn finish(&mut self, status: ActStatus, agent_time_ms: u64) -> Result<()> {
        if self.status.is_terminal() || !status.is_terminal() {
            return Err(TesseraError::InvalidTransition {
                id: self.id.to_string(),
                from: self.status.to_string(),
                to: status.to_string(),
            });
        }
        self.status = status;
        self.agent_time_ms = agent_time_ms;
        self.ended_at = Some(Utc::now());
        Ok(())
    }

    pub fn summary(&self) -> ActSummary {
        ActSummary {
            id: self.id.clone(),
            workspace_id: self.workspace_id.clone(),
            status: self.status,
            started_at: self.started_at,
            ended_at: self.ended_at,
            step_count: self.steps.len(),
            generation_count: self.generations.len(),
            agent_time_ms: self.agent_time_ms,
        }
    }
}

/// Listing view of an act.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActSummary {
    pub id: ActId,
    pub workspace_id: WorkspaceId,
    pub status: ActStatus,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
    pub step_count: usize,
    pub generation_count: usize,
    pub agent_time_ms: u64,
}
