use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use tokio::sync::{watch, Semaphore};
use tokio::task::{JoinError, JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use tessera_core::act::{Act, ActError, ActStatus};
use tessera_core::config::{AppConfig, EngineConfig, RetryConfig};
use tessera_core::error::{GenerationError, Result, TesseraError};
use tessera_core::event::{ActEvent, EventBus};
use tessera_core::generation::{Generation, GenerationOrigin, GenerationStatus};
use tessera_core::stream::{OutputBuffer, OutputReader};
use tessera_core::types::{ActId, GenerationId, NodeId, Step, WorkspaceId};
use tessera_graph::{planner, Blueprint};
use tessera_store::RunRegistry;

use crate::context::ContextResolver;
use crate::generation::{GenerationEnv, GenerationTask};
use crate::traits::{ExecutionCapability, QueryClient, UsageReporter};

/// What to run: a workspace's blueprint, optionally only the part reachable
/// from one node.
#[derive(Debug, Clone)]
pub struct ActRequest {
    pub workspace_id: WorkspaceId,
    pub owner_id: String,
    pub start_node: Option<NodeId>,
}

impl ActRequest {
    pub fn new(workspace_id: WorkspaceId, owner_id: impl Into<String>) -> Self {
        Self {
            workspace_id,
            owner_id: owner_id.into(),
            start_node: None,
        }
    }

    pub fn starting_at(mut self, node: NodeId) -> Self {
        self.start_node = Some(node);
        self
    }
}

pub struct OrchestratorBuilder {
    registry: RunRegistry,
    capability: Arc<dyn ExecutionCapability>,
    query: Option<Arc<dyn QueryClient>>,
    usage: Option<Arc<dyn UsageReporter>>,
    events: Option<Arc<EventBus>>,
    engine: EngineConfig,
    retry: RetryConfig,
}

impl OrchestratorBuilder {
    pub fn config(mut self, config: &AppConfig) -> Self {
        self.engine = config.engine.clone();
        self.retry = config.retry.clone();
        self
    }

    pub fn query_client(mut self, query: Arc<dyn QueryClient>) -> Self {
        self.query = Some(query);
        self
    }

    pub fn usage_reporter(mut self, usage: Arc<dyn UsageReporter>) -> Self {
        self.usage = Some(usage);
        self
    }

    /// Publish act events on an existing bus instead of a private one.
    pub fn event_bus(mut self, events: Arc<EventBus>) -> Self {
        self.events = Some(events);
        self
    }

    pub fn build(self) -> ActOrchestrator {
        let events = self
            .events
            .unwrap_or_else(|| Arc::new(EventBus::new(self.engine.event_capacity)));
        ActOrchestrator {
            inner: Arc::new(Inner {
                registry: self.registry,
                capability: self.capability,
                resolver: ContextResolver::new(self.query),
                usage: self.usage,
                events,
                engine: self.engine,
                retry: self.retry,
                running: Mutex::new(HashMap::new()),
                buffers: Mutex::new(HashMap::new()),
            }),
        }
    }
}

struct RunningAct {
    cancel: CancellationToken,
    done: watch::Receiver<Option<Act>>,
}

struct Inner {
    registry: RunRegistry,
    capability: Arc<dyn ExecutionCapability>,
    resolver: ContextResolver,
    usage: Option<Arc<dyn UsageReporter>>,
    events: Arc<EventBus>,
    engine: EngineConfig,
    retry: RetryConfig,
    running: Mutex<HashMap<ActId, RunningAct>>,
    buffers: Mutex<HashMap<GenerationId, Arc<OutputBuffer>>>,
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    match m.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

/// Runs acts over stored blueprints.
///
/// Cheap to clone; every clone drives and observes the same set of acts.
#[derive(Clone)]
pub struct ActOrchestrator {
    inner: Arc<Inner>,
}

impl ActOrchestrator {
    pub fn builder(
        registry: RunRegistry,
        capability: Arc<dyn ExecutionCapability>,
    ) -> OrchestratorBuilder {
        OrchestratorBuilder {
            registry,
            capability,
            query: None,
            usage: None,
            events: None,
            engine: EngineConfig::default(),
            retry: RetryConfig::default(),
        }
    }

    pub fn registry(&self) -> &RunRegistry {
        &self.inner.registry
    }

    pub fn events(&self) -> Arc<EventBus> {
        self.inner.events.clone()
    }

    /// Plan a blueprint without running it.
    pub fn build_steps(&self, blueprint: &Blueprint) -> Result<Vec<Step>> {
        Ok(planner::build_steps(blueprint)?)
    }

    /// Create an act and start driving it in the background.
    pub async fn start_act(&self, request: ActRequest) -> Result<ActId> {
        let blueprint = self
            .inner
            .registry
            .load_blueprint(&request.workspace_id)
            .await?;
        blueprint.validate()?;

        let steps = match &request.start_node {
            Some(start) => planner::plan_from(&blueprint, start)?,
            None => match blueprint.steps() {
                Some(cached) => cached.to_vec(),
                None => planner::build_steps(&blueprint)?,
            },
        };

        let act = Act::new(
            request.workspace_id.clone(),
            request.owner_id,
            blueprint.version,
            request.start_node,
            steps,
        );
        self.inner.registry.record_act(&act).await?;

        let act_id = act.id.clone();
        let cancel = CancellationToken::new();
        let (done_tx, done_rx) = watch::channel(None);
        lock(&self.inner.running).insert(
            act_id.clone(),
            RunningAct {
                cancel: cancel.clone(),
                done: done_rx,
            },
        );

        info!(act_id = %act_id, workspace_id = %act.workspace_id, steps = act.steps.len(), "Act started");
        self.inner.events.publish(ActEvent::ActStarted {
            act_id: act_id.clone(),
            workspace_id: act.workspace_id.clone(),
            steps: act.steps.len(),
        });

        let driver = ActDriver::new(self.inner.clone(), act, Arc::new(blueprint), cancel);
        let inner = self.inner.clone();
        let spawned_id = act_id.clone();
        tokio::spawn(async move {
            let act = driver.run().await;
            let _ = done_tx.send(Some(act));
            lock(&inner.running).remove(&spawned_id);
        });

        Ok(act_id)
    }

    /// Start an act and wait for it to finish.
    pub async fn run_act(&self, request: ActRequest) -> Result<Act> {
        let act_id = self.start_act(request).await?;
        self.wait(&act_id).await
    }

    /// Wait for an in-flight act, or return the stored record of a finished
    /// one.
    pub async fn wait(&self, act_id: &ActId) -> Result<Act> {
        let done = lock(&self.inner.running)
            .get(act_id)
            .map(|r| r.done.clone());
        if let Some(mut done) = done {
            let finished = match done.wait_for(|a| a.is_some()).await {
                Ok(act) => (*act).clone(),
                Err(_) => None,
            };
            if let Some(act) = finished {
                return Ok(act);
            }
        }
        self.get_act(act_id)
            .await?
            .ok_or_else(|| TesseraError::not_found("Act", act_id))
    }

    pub async fn get_act(&self, act_id: &ActId) -> Result<Option<Act>> {
        self.inner.registry.get_act(act_id).await
    }

    pub async fn get_generation(&self, id: &GenerationId) -> Result<Option<Generation>> {
        self.inner.registry.get_generation(id).await
    }

    pub async fn generations(&self, act_id: &ActId) -> Result<Vec<Generation>> {
        self.inner.registry.generations_for_act(act_id).await
    }

    /// Request cancellation. Finished acts are left as they are.
    pub async fn cancel_act(&self, act_id: &ActId) -> Result<()> {
        let token = lock(&self.inner.running)
            .get(act_id)
            .map(|r| r.cancel.clone());
        match token {
            Some(token) => {
                info!(act_id = %act_id, "Cancelling act");
                token.cancel();
                Ok(())
            }
            None => match self.get_act(act_id).await? {
                Some(_) => Ok(()),
                None => Err(TesseraError::not_found("Act", act_id)),
            },
        }
    }

    /// Read a generation's streamed output from `offset`. `None` if this
    /// orchestrator never ran the generation.
    pub fn stream_output(&self, id: &GenerationId, offset: usize) -> Option<OutputReader> {
        lock(&self.inner.buffers)
            .get(id)
            .map(|buffer| buffer.reader(offset))
    }
}

/// Drives one act: schedules eligible steps, applies the failure policy and
/// records the outcome.
struct ActDriver {
    inner: Arc<Inner>,
    act: Act,
    blueprint: Arc<Blueprint>,
    plan: Arc<BTreeSet<NodeId>>,
    env: GenerationEnv,
    cancel: CancellationToken,
    /// Generation behind each spawned task.
    spawned: HashMap<tokio::task::Id, (GenerationId, NodeId)>,
}

impl ActDriver {
    fn new(inner: Arc<Inner>, act: Act, blueprint: Arc<Blueprint>, cancel: CancellationToken) -> Self {
        let plan: Arc<BTreeSet<NodeId>> =
            Arc::new(act.steps.iter().map(|s| s.node_id.clone()).collect());
        let env = GenerationEnv {
            registry: inner.registry.clone(),
            capability: inner.capability.clone(),
            resolver: inner.resolver.clone(),
            events: inner.events.clone(),
            retry: inner.retry.clone(),
            default_timeout_ms: inner.engine.default_node_timeout_ms,
            slots: Arc::new(Semaphore::new(inner.engine.max_concurrent_generations.max(1))),
        };
        Self {
            inner,
            act,
            blueprint,
            plan,
            env,
            cancel,
            spawned: HashMap::new(),
        }
    }

    async fn run(mut self) -> Act {
        let mut pending: Vec<NodeId> = self.act.steps.iter().map(|s| s.node_id.clone()).collect();
        let mut finished: HashMap<NodeId, Generation> = HashMap::new();
        let mut tasks: JoinSet<Generation> = JoinSet::new();
        let mut failure: Option<ActError> = None;
        let mut cancelled = false;

        loop {
            if self.cancel.is_cancelled() {
                cancelled = true;
            }
            if failure.is_none() && !cancelled {
                let (ready, waiting): (Vec<NodeId>, Vec<NodeId>) = pending
                    .into_iter()
                    .partition(|n| self.is_eligible(n, &finished));
                pending = waiting;
                if !ready.is_empty() {
                    let mut lost = vec![];
                    for node_id in ready {
                        if let Some(generation) = self.spawn(node_id, &finished, &mut tasks).await {
                            lost.push(generation);
                        }
                    }
                    for generation in lost {
                        self.observe(generation, &mut finished, &mut failure);
                    }
                    self.persist().await;
                    continue;
                }
            }

            if tasks.is_empty() {
                if failure.is_none() && !cancelled {
                    if let Some(stalled) = pending.first() {
                        failure = Some(self.stall_error(stalled, &finished));
                    }
                }
                break;
            }

            tokio::select! {
                _ = self.cancel.cancelled(), if !cancelled => {
                    cancelled = true;
                }
                joined = tasks.join_next_with_id() => match joined {
                    Some(Ok((task_id, generation))) => {
                        self.spawned.remove(&task_id);
                        self.observe(generation, &mut finished, &mut failure);
                    }
                    Some(Err(e)) => match self.recover(e).await {
                        Some(generation) => self.observe(generation, &mut finished, &mut failure),
                        None => {
                            failure.get_or_insert(ActError {
                                generation_id: None,
                                node_id: None,
                                error: GenerationError::Lost {
                                    message: "untracked generation task died".into(),
                                },
                            });
                        }
                    },
                    None => {}
                },
            }
        }

        let status = if cancelled {
            ActStatus::Cancelled
        } else if failure.is_some() || !pending.is_empty() {
            ActStatus::Failed
        } else {
            ActStatus::Completed
        };
        let agent_time_ms: u64 = finished.values().map(Generation::duration_ms).sum();

        self.act.error = failure;
        if let Err(e) = self.act.finish(status, agent_time_ms) {
            error!(act_id = %self.act.id, error = %e, "Illegal act transition");
        }
        self.persist().await;

        info!(
            act_id = %self.act.id,
            status = %self.act.status,
            generations = self.act.generations.len(),
            agent_time_ms,
            "Act finished"
        );
        self.inner.events.publish(ActEvent::ActFinished {
            act_id: self.act.id.clone(),
            status: self.act.status,
            agent_time_ms,
        });
        self.report_usage(agent_time_ms);
        self.evict_buffers();

        self.act
    }

    /// Control predecessors and in-plan data predecessors are all terminal.
    fn is_eligible(&self, node_id: &NodeId, finished: &HashMap<NodeId, Generation>) -> bool {
        let settled = |id: &NodeId| !self.plan.contains(id) || finished.contains_key(id);
        self.blueprint.control_predecessors(node_id).iter().all(settled)
            && self.blueprint.data_predecessors(node_id).iter().all(settled)
    }

    /// Queue a generation for `node_id` and start its task. Returns the
    /// generation, already failed, when it could not be recorded as queued.
    async fn spawn(
        &mut self,
        node_id: NodeId,
        finished: &HashMap<NodeId, Generation>,
        tasks: &mut JoinSet<Generation>,
    ) -> Option<Generation> {
        let mut generation = Generation::queued(
            node_id.clone(),
            GenerationOrigin {
                act_id: self.act.id.clone(),
                workspace_id: self.act.workspace_id.clone(),
            },
        );
        self.act.generations.push(generation.id.clone());
        if let Err(e) = self.inner.registry.record_generation(&generation).await {
            error!(generation_id = %generation.id, error = %e, "Failed to persist queued generation");
            let message = format!("failed to persist queued: {}", e);
            if let Err(e) = generation.fail(GenerationError::Lost { message }) {
                error!(generation_id = %generation.id, error = %e, "Illegal generation transition");
            }
            if let Err(e) = self.inner.registry.record_generation(&generation).await {
                error!(generation_id = %generation.id, error = %e, "Failed to persist lost generation");
            }
            return Some(generation);
        }

        debug!(act_id = %self.act.id, node_id = %node_id, generation_id = %generation.id, "Generation queued");
        self.inner.events.publish(ActEvent::GenerationQueued {
            act_id: self.act.id.clone(),
            generation_id: generation.id.clone(),
            node_id: node_id.clone(),
        });

        let buffer = OutputBuffer::new();
        lock(&self.inner.buffers).insert(generation.id.clone(), buffer.clone());

        let upstream = self
            .blueprint
            .data_predecessors(&node_id)
            .into_iter()
            .filter_map(|id| finished.get(&id).map(|g| (id, g.clone())))
            .collect();

        let generation_id = generation.id.clone();
        let task = GenerationTask {
            generation,
            blueprint: self.blueprint.clone(),
            plan: self.plan.clone(),
            upstream,
            buffer,
            cancel: self.cancel.clone(),
            env: self.env.clone(),
        };
        let handle = tasks.spawn(task.run());
        self.spawned.insert(handle.id(), (generation_id, node_id));
        None
    }

    /// A generation task panicked or was aborted before settling. Fail its
    /// generation so the stored record does not stay non-terminal.
    async fn recover(&mut self, e: JoinError) -> Option<Generation> {
        let Some((generation_id, node_id)) = self.spawned.remove(&e.id()) else {
            error!(act_id = %self.act.id, error = %e, "Unknown generation task died");
            return None;
        };
        let reason = if e.is_panic() { "panicked" } else { "was aborted" };
        error!(
            act_id = %self.act.id,
            node_id = %node_id,
            generation_id = %generation_id,
            "Generation task {}", reason
        );

        if let Some(buffer) = lock(&self.inner.buffers).get(&generation_id) {
            buffer.close();
        }

        let stored = match self.inner.registry.get_generation(&generation_id).await {
            Ok(stored) => stored,
            Err(e) => {
                error!(generation_id = %generation_id, error = %e, "Failed to load generation");
                None
            }
        };
        let mut generation = stored.unwrap_or_else(|| {
            let mut rebuilt = Generation::queued(
                node_id.clone(),
                GenerationOrigin {
                    act_id: self.act.id.clone(),
                    workspace_id: self.act.workspace_id.clone(),
                },
            );
            rebuilt.id = generation_id.clone();
            rebuilt
        });

        if !generation.is_terminal() {
            let message = format!("generation task {}", reason);
            if let Err(e) = generation.fail(GenerationError::Lost { message }) {
                error!(generation_id = %generation_id, error = %e, "Illegal generation transition");
            }
            if let Err(e) = self.inner.registry.record_generation(&generation).await {
                error!(generation_id = %generation_id, error = %e, "Failed to persist lost generation");
            }
        }
        self.inner.events.publish(ActEvent::GenerationFinished {
            act_id: self.act.id.clone(),
            generation_id,
            node_id,
            status: generation.status,
            duration_ms: generation.duration_ms(),
        });
        Some(generation)
    }

    fn observe(
        &self,
        generation: Generation,
        finished: &mut HashMap<NodeId, Generation>,
        failure: &mut Option<ActError>,
    ) {
        if generation.status == GenerationStatus::Failed {
            let best_effort = self
                .blueprint
                .node(&generation.node_id)
                .map(|n| n.best_effort)
                .unwrap_or(false);
            let fatal = generation
                .error
                .as_ref()
                .map(GenerationError::is_fatal)
                .unwrap_or(false);

            if best_effort && !fatal {
                info!(
                    act_id = %self.act.id,
                    node_id = %generation.node_id,
                    "Best-effort node failed, continuing"
                );
            } else if failure.is_none() {
                warn!(
                    act_id = %self.act.id,
                    node_id = %generation.node_id,
                    generation_id = %generation.id,
                    "Generation failed, halting act"
                );
                *failure = Some(ActError {
                    generation_id: Some(generation.id.clone()),
                    node_id: Some(generation.node_id.clone()),
                    error: generation.error.clone().unwrap_or(GenerationError::UpstreamContext {
                        message: "generation failed without an error".into(),
                    }),
                });
            }
        }
        finished.insert(generation.node_id.clone(), generation);
    }

    /// No generation is running and no pending step can ever become
    /// eligible: a data dependency cannot be satisfied in plan order.
    fn stall_error(&self, node_id: &NodeId, finished: &HashMap<NodeId, Generation>) -> ActError {
        let upstream = self
            .blueprint
            .data_predecessors(node_id)
            .into_iter()
            .chain(self.blueprint.control_predecessors(node_id))
            .find(|p| self.plan.contains(p) && !finished.contains_key(p))
            .unwrap_or_else(|| node_id.clone());
        error!(
            act_id = %self.act.id,
            node_id = %node_id,
            upstream = %upstream,
            "Act cannot make progress, dependency never settles"
        );
        ActError {
            generation_id: None,
            node_id: Some(node_id.clone()),
            error: GenerationError::UnresolvedDependency { upstream },
        }
    }

    async fn persist(&self) {
        if let Err(e) = self.inner.registry.record_act(&self.act).await {
            error!(act_id = %self.act.id, error = %e, "Failed to persist act");
        }
    }

    /// Drop this act's output buffers once the retention window passes.
    fn evict_buffers(&self) {
        let inner = Arc::downgrade(&self.inner);
        let ids = self.act.generations.clone();
        let retention = Duration::from_millis(self.inner.engine.output_retention_ms);
        tokio::spawn(async move {
            tokio::time::sleep(retention).await;
            if let Some(inner) = inner.upgrade() {
                let mut buffers = lock(&inner.buffers);
                for id in &ids {
                    buffers.remove(id);
                }
                debug!(evicted = ids.len(), "Output buffers evicted");
            }
        });
    }

    fn report_usage(&self, agent_time_ms: u64) {
        let Some(usage) = self.inner.usage.clone() else {
            return;
        };
        let owner = self.act.owner_id.clone();
        let act_id = self.act.id.clone();
        tokio::spawn(async move {
            if let Err(e) = usage.report_agent_time(&owner, agent_time_ms).await {
                warn!(act_id = %act_id, error = %e, "Failed to report agent time");
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::future::BoxFuture;
    use serde_json::json;
    use tessera_core::error::CapabilityError;
    use tessera_core::stream::OutputSink;
    use tessera_graph::{NodeContent, NodeTemplate};
    use tessera_store::MemoryStore;

    use crate::traits::InvocationRequest;

    struct Echo;

    impl ExecutionCapability for Echo {
        fn invoke(
            &self,
            request: InvocationRequest,
            output: OutputSink,
            _cancel: CancellationToken,
        ) -> BoxFuture<'_, std::result::Result<serde_json::Value, CapabilityError>> {
            Box::pin(async move {
                output.emit(request.node.name.clone());
                Ok(json!(request.node.name))
            })
        }
    }

    async fn setup() -> (ActOrchestrator, Blueprint) {
        let registry = RunRegistry::new(Arc::new(MemoryStore::new()));
        let bp = Blueprint::new(WorkspaceId::from("wrks-orch"), "orch", "owner");
        let (bp, a) = bp.add_node(NodeTemplate::new("A", NodeContent::Text { text: "a".into() }));
        let (bp, b) = bp.add_node(NodeTemplate::new("B", NodeContent::Text { text: "b".into() }));
        let (bp, _) = bp.connect_control(&a, &b).unwrap();
        registry.save_blueprint(&bp).await.unwrap();
        let orchestrator = ActOrchestrator::builder(registry, Arc::new(Echo)).build();
        (orchestrator, bp)
    }

    #[tokio::test]
    async fn test_run_act_completes_in_order() {
        let (orchestrator, bp) = setup().await;
        let act = orchestrator
            .run_act(ActRequest::new(bp.id.clone(), "owner"))
            .await
            .unwrap();

        assert_eq!(act.status, ActStatus::Completed);
        assert_eq!(act.generations.len(), 2);
        let first = orchestrator
            .get_generation(&act.generations[0])
            .await
            .unwrap()
            .unwrap();
        let second = orchestrator
            .get_generation(&act.generations[1])
            .await
            .unwrap()
            .unwrap();
        assert_eq!(first.output, Some(json!("A")));
        assert!(first.completed_at <= second.started_at);
    }

    #[tokio::test]
    async fn test_stream_output_after_completion() {
        let (orchestrator, bp) = setup().await;
        let act = orchestrator
            .run_act(ActRequest::new(bp.id.clone(), "owner"))
            .await
            .unwrap();

        let mut reader = orchestrator.stream_output(&act.generations[0], 0).unwrap();
        assert!(reader.next().await.is_some());
        assert!(reader.next().await.is_none());
    }

    #[tokio::test]
    async fn test_unknown_workspace_and_act() {
        let (orchestrator, _) = setup().await;
        let err = orchestrator
            .start_act(ActRequest::new(WorkspaceId::from("wrks-none"), "owner"))
            .await
            .unwrap_err();
        assert!(matches!(err, TesseraError::NotFound { .. }));

        let err = orchestrator
            .cancel_act(&ActId::from("act-none"))
            .await
            .unwrap_err();
        assert!(matches!(err, TesseraError::NotFound { .. }));
    }

    #[tokio::test]
    async fn test_invalid_plan_is_rejected_synchronously() {
        let registry = RunRegistry::new(Arc::new(MemoryStore::new()));
        let bp = Blueprint::new(WorkspaceId::from("wrks-empty"), "empty", "owner");
        registry.save_blueprint(&bp).await.unwrap();
        let orchestrator = ActOrchestrator::builder(registry, Arc::new(Echo)).build();

        let err = orchestrator
            .start_act(ActRequest::new(bp.id.clone(), "owner"))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            TesseraError::Validation(tessera_core::error::GraphValidationError::StartingPointNotFound)
        ));
    }
}
