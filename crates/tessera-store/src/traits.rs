use futures::future::BoxFuture;

use tessera_core::act::Act;
use tessera_core::error::Result;
use tessera_core::generation::Generation;
use tessera_core::types::{ActId, GenerationId, WorkspaceId};
use tessera_graph::Blueprint;

/// Persistence for blueprints and run records.
///
/// Writes are whole-record upserts keyed by id. Ordering and transition
/// rules live in [`crate::RunRegistry`]; backends only store.
pub trait RunStore: Send + Sync + 'static {
    fn put_blueprint(&self, blueprint: &Blueprint) -> BoxFuture<'_, Result<()>>;

    fn get_blueprint(&self, id: &WorkspaceId) -> BoxFuture<'_, Result<Option<Blueprint>>>;

    fn put_act(&self, act: &Act) -> BoxFuture<'_, Result<()>>;

    fn get_act(&self, id: &ActId) -> BoxFuture<'_, Result<Option<Act>>>;

    /// Acts of one workspace, newest first.
    fn list_acts(&self, workspace_id: &WorkspaceId) -> BoxFuture<'_, Result<Vec<Act>>>;

    fn put_generation(&self, generation: &Generation) -> BoxFuture<'_, Result<()>>;

    fn get_generation(&self, id: &GenerationId) -> BoxFuture<'_, Result<Option<Generation>>>;

    /// Generations created by one act, oldest first.
    fn list_generations(&self, act_id: &ActId) -> BoxFuture<'_, Result<Vec<Generation>>>;
}
