use std::sync::Arc;

use tracing::warn;

use tessera_core::act::{Act, ActSummary};
use tessera_core::error::{Result, TesseraError};
use tessera_core::generation::Generation;
use tessera_core::types::{ActId, GenerationId, WorkspaceId};
use tessera_graph::Blueprint;

use crate::traits::RunStore;

/// Durable record of acts and generations.
///
/// The registry observes execution and never drives it. It refuses writes
/// that would move a record backwards, so anything read from it reflects a
/// monotonic history.
#[derive(Clone)]
pub struct RunRegistry {
    store: Arc<dyn RunStore>,
}

impl RunRegistry {
    pub fn new(store: Arc<dyn RunStore>) -> Self {
        Self { store }
    }

    pub fn store(&self) -> &Arc<dyn RunStore> {
        &self.store
    }

    pub async fn save_blueprint(&self, blueprint: &Blueprint) -> Result<()> {
        self.store.put_blueprint(blueprint).await
    }

    pub async fn load_blueprint(&self, id: &WorkspaceId) -> Result<Blueprint> {
        self.store
            .get_blueprint(id)
            .await?
            .ok_or_else(|| TesseraError::not_found("Blueprint", id))
    }

    /// Persist an act. A terminal act cannot change status again.
    pub async fn record_act(&self, act: &Act) -> Result<()> {
        if let Some(stored) = self.store.get_act(&act.id).await? {
            if stored.status.is_terminal() && stored.status != act.status {
                warn!(act_id = %act.id, from = %stored.status, to = %act.status, "Rejected act regression");
                return Err(TesseraError::InvalidTransition {
                    id: act.id.to_string(),
                    from: stored.status.to_string(),
                    to: act.status.to_string(),
                });
            }
        }
        self.store.put_act(act).await
    }

    /// Persist a generation. Same-status updates (a retry bumping `attempt`)
    /// are accepted; status changes must be legal transitions.
    pub async fn record_generation(&self, generation: &Generation) -> Result<()> {
        if let Some(stored) = self.store.get_generation(&generation.id).await? {
            let (from, to) = (stored.status, generation.status);
            let allowed = if from == to {
                !from.is_terminal() || stored.attempt == generation.attempt
            } else {
                from.can_transition_to(to)
            };
            if !allowed || generation.attempt < stored.attempt {
                warn!(generation_id = %generation.id, %from, %to, "Rejected generation regression");
                return Err(TesseraError::InvalidTransition {
                    id: generation.id.to_string(),
                    from: from.to_string(),
                    to: to.to_string(),
                });
            }
        }
        self.store.put_generation(generation).await
    }

    pub async fn get_act(&self, id: &ActId) -> Result<Option<Act>> {
        self.store.get_act(id).await
    }

    pub async fn get_generation(&self, id: &GenerationId) -> Result<Option<Generation>> {
        self.store.get_generation(id).await
    }

    /// Summaries of a workspace's acts, newest first.
    pub async fn acts_for_workspace(&self, workspace_id: &WorkspaceId) -> Result<Vec<ActSummary>> {
        let mut acts = self.store.list_acts(workspace_id).await?;
        acts.sort_by(|a, b| b.started_at.cmp(&a.started_at));
        Ok(acts.iter().map(Act::summary).collect())
    }

    pub async fn generations_for_act(&self, act_id: &ActId) -> Result<Vec<Generation>> {
        self.store.list_generations(act_id).await
    }
}
