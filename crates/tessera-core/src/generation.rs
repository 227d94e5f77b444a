use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{CapabilityError, GenerationError, Result, TesseraError};
use crate::types::{ActId, GenerationId, InputContext, NodeId, WorkspaceId};

/// Lifecycle state of a generation.
///
/// `Queued → Running → {Completed, Failed, Cancelled}`. `Queued` may also go
/// straight to `Failed` (context resolution failed) or `Cancelled`.
/// Terminal states never change again.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GenerationStatus {
    Queued,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl GenerationStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }

    pub fn can_transition_to(self, next: GenerationStatus) -> bool {
        use GenerationStatus::*;
        matches!(
            (self, next),
            (Queued, Running)
                | (Queued, Failed)
                | (Queued, Cancelled)
                | (Running, Completed)
                | (Running, Failed)
                | (Running, Cancelled)
        )
    }

    /// Monotonic rank used to detect persisted regressions.
    pub fn rank(self) -> u8 {
        match self {
            Self::Queued => 0,
            Self::Running => 1,
            Self::Completed | Self::Failed | Self::Cancelled => 2,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Queued => "queued",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }
}

impl std::fmt::Display for GenerationStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Which run a generation belongs to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GenerationOrigin {
    pub act_id: ActId,
    pub workspace_id: WorkspaceId,
}

/// One execution instance of a single node within one act.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Generation {
    pub id: GenerationId,
    pub node_id: NodeId,
    pub origin: GenerationOrigin,
    pub status: GenerationStatus,
    pub queued_at: DateTime<Utc>,
    #[serde(default)]
    pub started_at: Option<DateTime<Utc>>,
    /// Set on every terminal transition.
    #[serde(default)]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub context: Option<InputContext>,
    #[serde(default)]
    pub output: Option<serde_json::Value>,
    #[serde(default)]
    pub error: Option<GenerationError>,
    /// Attempts made so far (0 while queued).
    #[serde(default)]
    pub attempt: u32,
    #[serde(default)]
    pub last_attempt_error: Option<CapabilityError>,
}

impl Generation {
    /// Create a queued generation for a node.
    pub fn queued(node_id: NodeId, origin: GenerationOrigin) -> Self {
        Self {
            id: GenerationId::new(),
            node_id,
            origin,
            status: GenerationStatus::Queued,
            queued_at: Utc::now(),
            started_at: None,
            completed_at: None,
            context: None,
            output: None,
            error: None,
            attempt: 0,
            last_attempt_error: None,
        }
    }

    fn transition(&mut self, next: GenerationStatus) -> Result<()> {
        if !self.status.can_transition_to(next) {
            return Err(TesseraError::InvalidTransition {
                id: self.id.to_string(),
                from: self.status.to_string(),
                to: next.to_string(),
            });
        }
        self.status = next;
        if next.is_terminal() {
            self.completed_at = Some(Utc::now());
        }
        Ok(())
    }

    /// Context resolved and work dispatched.
    pub fn start(&mut self, context: InputContext) -> Result<()> {
        self.transition(GenerationStatus::Running)?;
        self.started_at = Some(Utc::now());
        self.context = Some(context);
        self.attempt = 1;
        Ok(())
    }

    /// Record a failed attempt and begin the next one. Identity is kept; only
    /// the attempt record is replaced.
    pub fn retry(&mut self, error: CapabilityError) -> Result<()> {
        if self.status != GenerationStatus::Running {
            return Err(TesseraError::InvalidTransition {
                id: self.id.to_string(),
                from: self.status.to_string(),
                to: GenerationStatus::Running.to_string(),
            });
        }
        self.attempt += 1;
        self.last_attempt_error = Some(error);
        Ok(())
    }

    pub fn complete(&mut self, output: serde_json::Value) -> Result<()> {
        self.transition(GenerationStatus::Completed)?;
        self.output = Some(output);
        Ok(())
    }

    pub fn fail(&mut self, error: GenerationError) -> Result<()> {
        self.transition(GenerationStatus::Failed)?;
        self.error = Some(error);
        Ok(())
    }

    pub fn cancel(&mut self) -> Result<()> {
        self.transition(GenerationStatus::Cancelled)?;
        self.error = Some(GenerationError::Cancelled);
        Ok(())
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// Wall-clock time between start and the terminal transition, in
    /// milliseconds. Zero for generations that never ran.
    pub fn duration_ms(&self) -> u64 {
        match (self.started_at, self.completed_at) {
            (Some(start), Some(end)) => (end - start).num_milliseconds().max(0) as u64,
            _ => 0,
        }
    }
}
