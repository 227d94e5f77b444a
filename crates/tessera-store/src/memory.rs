use std::collections::HashMap;

use futures::future::BoxFuture;
use tokio::sync::RwLock;

use tessera_core::act::Act;
use tessera_core::error::Result;
use tessera_core::generation::Generation;
use tessera_core::types::{ActId, GenerationId, WorkspaceId};
use tessera_graph::Blueprint;

use crate::traits::RunStore;

/// Process-local store. Everything is lost on exit.
#[derive(Default)]
pub struct MemoryStore {
    blueprints: RwLock<HashMap<WorkspaceId, Blueprint>>,
    acts: RwLock<HashMap<ActId, Act>>,
    generations: RwLock<HashMap<GenerationId, Generation>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl RunStore for MemoryStore {
    fn put_blueprint(&self, blueprint: &Blueprint) -> BoxFuture<'_, Result<()>> {
        let blueprint = blueprint.clone();
        Box::pin(async move {
            self.blueprints
                .write()
                .await
                .insert(blueprint.id.clone(), blueprint);
            Ok(())
        })
    }

    fn get_blueprint(&self, id: &WorkspaceId) -> BoxFuture<'_, Result<Option<Blueprint>>> {
        let id = id.clone();
        Box::pin(async move { Ok(self.blueprints.read().await.get(&id).cloned()) })
    }

    fn put_act(&self, act: &Act) -> BoxFuture<'_, Result<()>> {
        let act = act.clone();
        Box::pin(async move {
            self.acts.write().await.insert(act.id.clone(), act);
            Ok(())
        })
    }

    fn get_act(&self, id: &ActId) -> BoxFuture<'_, Result<Option<Act>>> {
        let id = id.clone();
        Box::pin(async move { Ok(self.acts.read().await.get(&id).cloned()) })
    }

    fn list_acts(&self, workspace_id: &WorkspaceId) -> BoxFuture<'_, Result<Vec<Act>>> {
        let workspace_id = workspace_id.clone();
        Box::pin(async move {
            let mut acts: Vec<Act> = self
                .acts
                .read()
                .await
                .values()
                .filter(|a| a.workspace_id == workspace_id)
                .cloned()
                .collect();
            acts.sort_by(|a, b| b.started_at.cmp(&a.started_at));
            Ok(acts)
        })
    }

    fn put_generation(&self, generation: &Generation) -> BoxFuture<'_, Result<()>> {
        let generation = generation.clone();
        Box::pin(async move {
            self.generations
                .write()
                .await
                .insert(generation.id.clone(), generation);
            Ok(())
        })
    }

    fn get_generation(&self, id: &GenerationId) -> BoxFuture<'_, Result<Option<Generation>>> {
        let id = id.clone();
        Box::pin(async move { Ok(self.generations.read().await.get(&id).cloned()) })
    }

    fn list_generations(&self, act_id: &ActId) -> BoxFuture<'_, Result<Vec<Generation>>> {
        let act_id = act_id.clone();
        Box::pin(async move {
            let mut generations: Vec<Generation> = self
                .generations
                .read()
                .await
                .values()
                .filter(|g| g.origin.act_id == act_id)
                .cloned()
                .collect();
            generations.sort_by(|a, b| a.queued_at.cmp(&b.queued_at));
            Ok(generations)
        })
    }
}
