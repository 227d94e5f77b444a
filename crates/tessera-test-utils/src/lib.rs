//! Mocks and fixtures shared by Tessera's tests.

use std::collections::{HashMap, VecDeque};
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::future::BoxFuture;
use serde_json::Value;
use tokio_util::sync::CancellationToken;

use tessera_core::act::Act;
use tessera_core::config::AppConfig;
use tessera_core::error::{CapabilityError, Result, TesseraError};
use tessera_core::generation::{Generation, GenerationStatus};
use tessera_core::stream::OutputSink;
use tessera_core::types::{ActId, GenerationId, NodeId, QueryResult, WorkspaceId};
use tessera_engine::traits::{
    ExecutionCapability, InvocationRequest, QueryClient, QueryRequest, UsageReporter,
};
use tessera_engine::ActOrchestrator;
use tessera_graph::{Blueprint, NodeContent, NodeTemplate, PortSpec};
use tessera_store::{MemoryStore, RunRegistry, RunStore};

// ── Capability ───────────────────────────────────────────────────

/// What one invocation of a scripted node does.
#[derive(Debug, Clone)]
pub enum Response {
    /// Return this output.
    Output(Value),
    /// Fail the attempt.
    Fail(CapabilityError),
    /// Never finish; only a timeout or cancellation ends the attempt.
    Hang,
    /// Panic inside the invocation.
    Panic,
}

fn lock<T>(m: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    match m.lock() {
        Ok(g) => g,
        Err(p) => p.into_inner(),
    }
}

/// Capability whose behaviour is scripted per node name.
///
/// Each invocation pops the next scripted response for the node; the last
/// one repeats. Unscripted nodes return their own name as output.
#[derive(Default)]
pub struct ScriptedCapability {
    scripts: Mutex<HashMap<String, VecDeque<Response>>>,
    delays: HashMap<String, Duration>,
    chunks: HashMap<String, Vec<String>>,
    invocations: Mutex<HashMap<String, u32>>,
    running: AtomicUsize,
    peak: AtomicUsize,
}

struct RunningGuard<'a> {
    running: &'a AtomicUsize,
}

impl Drop for RunningGuard<'_> {
    fn drop(&mut self) {
        self.running.fetch_sub(1, Ordering::SeqCst);
    }
}

impl ScriptedCapability {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn respond(self, node: &str, response: Response) -> Self {
        lock(&self.scripts)
            .entry(node.to_string())
            .or_default()
            .push_back(response);
        self
    }

    /// Sleep before answering, on every attempt.
    pub fn with_delay(mut self, node: &str, delay: Duration) -> Self {
        self.delays.insert(node.to_string(), delay);
        self
    }

    /// Emit these chunks to the output sink before answering.
    pub fn with_chunks(mut self, node: &str, chunks: &[&str]) -> Self {
        self.chunks
            .insert(node.to_string(), chunks.iter().map(|c| c.to_string()).collect());
        self
    }

    pub fn invocations(&self, node: &str) -> u32 {
        lock(&self.invocations).get(node).copied().unwrap_or(0)
    }

    pub fn total_invocations(&self) -> u32 {
        lock(&self.invocations).values().sum()
    }

    /// Highest number of invocations observed in flight at once.
    pub fn peak_concurrency(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }

    fn next_response(&self, node: &str) -> Response {
        let mut scripts = lock(&self.scripts);
        match scripts.get_mut(node) {
            Some(queue) if queue.len() > 1 => queue.pop_front().unwrap_or(Response::Hang),
            Some(queue) => queue
                .front()
                .cloned()
                .unwrap_or_else(|| Response::Output(Value::String(node.to_string()))),
            None => Response::Output(Value::String(node.to_string())),
        }
    }
}

impl ExecutionCapability for ScriptedCapability {
    fn invoke(
        &self,
        request: InvocationRequest,
        output: OutputSink,
        cancel: CancellationToken,
    ) -> BoxFuture<'_, std::result::Result<Value, CapabilityError>> {
        Box::pin(async move {
            let name = request.node.name.clone();
            *lock(&self.invocations).entry(name.clone()).or_insert(0) += 1;
            let now = self.running.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);
            let _guard = RunningGuard {
                running: &self.running,
            };

            let response = self.next_response(&name);
            if let Some(chunks) = self.chunks.get(&name) {
                for chunk in chunks {
                    output.emit(chunk.clone());
                }
            }
            if let Some(delay) = self.delays.get(&name) {
                tokio::select! {
                    _ = tokio::time::sleep(*delay) => {}
                    _ = cancel.cancelled() => return Err(CapabilityError::remote("cancelled")),
                }
            }

            match response {
                Response::Output(v) => Ok(v),
                Response::Fail(e) => Err(e),
                Response::Hang => {
                    cancel.cancelled().await;
                    Err(CapabilityError::remote("cancelled"))
                }
                Response::Panic => panic!("scripted panic in node {}", name),
            }
        })
    }
}

// ── Query ────────────────────────────────────────────────────────

/// Query client returning fixed hits, or failing when `failing`.
#[derive(Default)]
pub struct MockQuery {
    hits: Vec<QueryResult>,
    failing: bool,
    queries: Mutex<Vec<String>>,
}

impl MockQuery {
    pub fn with_hits(contents: &[&str]) -> Self {
        Self {
            hits: contents
                .iter()
                .map(|c| QueryResult {
                    content: c.to_string(),
                    score: 0.9,
                    source: None,
                    metadata: Value::Null,
                })
                .collect(),
            ..Self::default()
        }
    }

    pub fn failing() -> Self {
        Self {
            failing: true,
            ..Self::default()
        }
    }

    /// Rendered query texts received so far.
    pub fn queries(&self) -> Vec<String> {
        lock(&self.queries).clone()
    }
}

impl QueryClient for MockQuery {
    fn query(&self, request: QueryRequest) -> BoxFuture<'_, Result<Vec<QueryResult>>> {
        Box::pin(async move {
            lock(&self.queries).push(request.query);
            if self.failing {
                return Err(TesseraError::Database("vector index unavailable".into()));
            }
            Ok(self.hits.iter().take(request.max_results).cloned().collect())
        })
    }
}

// ── Usage ────────────────────────────────────────────────────────

/// Records every agent-time report.
#[derive(Default)]
pub struct RecordingUsage {
    reports: Mutex<Vec<(String, u64)>>,
}

impl RecordingUsage {
    pub fn reports(&self) -> Vec<(String, u64)> {
        lock(&self.reports).clone()
    }

    /// Wait up to two seconds for at least `n` reports.
    pub async fn wait_for(&self, n: usize) -> Vec<(String, u64)> {
        for _ in 0..400 {
            let reports = self.reports();
            if reports.len() >= n {
                return reports;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        self.reports()
    }
}

impl UsageReporter for RecordingUsage {
    fn report_agent_time(&self, owner_id: &str, duration_ms: u64) -> BoxFuture<'_, Result<()>> {
        let owner_id = owner_id.to_string();
        Box::pin(async move {
            lock(&self.reports).push((owner_id, duration_ms));
            Ok(())
        })
    }
}

// ── Store ────────────────────────────────────────────────────────

/// Memory store that refuses to write generations in one status.
pub struct FailingStore {
    inner: MemoryStore,
    reject: GenerationStatus,
    rejected: AtomicUsize,
}

impl FailingStore {
    pub fn rejecting(status: GenerationStatus) -> Self {
        Self {
            inner: MemoryStore::new(),
            reject: status,
            rejected: AtomicUsize::new(0),
        }
    }

    /// Generation writes refused so far.
    pub fn rejected(&self) -> usize {
        self.rejected.load(Ordering::SeqCst)
    }
}

impl RunStore for FailingStore {
    fn put_blueprint(&self, blueprint: &Blueprint) -> BoxFuture<'_, Result<()>> {
        self.inner.put_blueprint(blueprint)
    }

    fn get_blueprint(&self, id: &WorkspaceId) -> BoxFuture<'_, Result<Option<Blueprint>>> {
        self.inner.get_blueprint(id)
    }

    fn put_act(&self, act: &Act) -> BoxFuture<'_, Result<()>> {
        self.inner.put_act(act)
    }

    fn get_act(&self, id: &ActId) -> BoxFuture<'_, Result<Option<Act>>> {
        self.inner.get_act(id)
    }

    fn list_acts(&self, workspace_id: &WorkspaceId) -> BoxFuture<'_, Result<Vec<Act>>> {
        self.inner.list_acts(workspace_id)
    }

    fn put_generation(&self, generation: &Generation) -> BoxFuture<'_, Result<()>> {
        if generation.status == self.reject {
            self.rejected.fetch_add(1, Ordering::SeqCst);
            let status = generation.status;
            return Box::pin(async move {
                Err(TesseraError::Database(format!("disk full writing {} generation", status)))
            });
        }
        self.inner.put_generation(generation)
    }

    fn get_generation(&self, id: &GenerationId) -> BoxFuture<'_, Result<Option<Generation>>> {
        self.inner.get_generation(id)
    }

    fn list_generations(&self, act_id: &ActId) -> BoxFuture<'_, Result<Vec<Generation>>> {
        self.inner.list_generations(act_id)
    }
}

// ── Fixtures ─────────────────────────────────────────────────────

pub const OWNER: &str = "user-test";

pub fn text_generation(name: &str) -> NodeTemplate {
    NodeTemplate::new(
        name,
        NodeContent::TextGeneration {
            model: "test-model".into(),
            prompt: format!("{} prompt", name),
        },
    )
}

pub fn empty_blueprint(name: &str) -> Blueprint {
    Blueprint::new(WorkspaceId::from(format!("wrks-{}", name)), name, OWNER)
}

/// `A -> B` over control, plus `A.output -> B.A` over data.
pub fn chain_blueprint() -> (Blueprint, NodeId, NodeId) {
    let bp = empty_blueprint("chain");
    let (bp, a) = bp.add_node(text_generation("A"));
    let (bp, b) = bp.add_node(text_generation("B").with_input(PortSpec::data("A")));
    let (bp, _) = bp.connect_control(&a, &b).expect("control edge");
    let (bp, _) = bp.connect_data(&a, "output", &b, "A").expect("data edge");
    (bp, a, b)
}

/// `count` nodes with no edges between them.
pub fn disconnected_blueprint(count: usize) -> (Blueprint, Vec<NodeId>) {
    let mut bp = empty_blueprint("disconnected");
    let mut ids = Vec::with_capacity(count);
    for i in 0..count {
        let (next, id) = bp.add_node(text_generation(&format!("N{}", i)));
        bp = next;
        ids.push(id);
    }
    (bp, ids)
}

/// Config with millisecond backoff so retry tests stay fast.
pub fn fast_config(max_retries: u32) -> AppConfig {
    let mut config = AppConfig::default();
    config.retry.max_retries = max_retries;
    config.retry.initial_backoff_ms = 1;
    config.retry.max_backoff_ms = 5;
    config
}

/// Registry over a fresh memory store with `blueprint` saved.
pub async fn registry_with(blueprint: &Blueprint) -> RunRegistry {
    let registry = RunRegistry::new(Arc::new(MemoryStore::new()));
    registry
        .save_blueprint(blueprint)
        .await
        .expect("save blueprint");
    registry
}

/// Orchestrator over a fresh memory store holding `blueprint`.
pub async fn orchestrator_for(
    blueprint: &Blueprint,
    capability: Arc<dyn ExecutionCapability>,
    config: &AppConfig,
) -> ActOrchestrator {
    ActOrchestrator::builder(registry_with(blueprint).await, capability)
        .config(config)
        .build()
}

/// Write a config file into a fresh temp directory.
pub fn write_config(content: &str) -> (tempfile::TempDir, PathBuf) {
    let dir = tempfile::tempdir().expect("tempdir");
    let path = dir.path().join("tessera.toml");
    std::fs::write(&path, content).expect("write config");
    // Fail fast on fixtures that are not even valid TOML.
    let _: toml::Value = toml::from_str(content).expect("fixture is valid toml");
    (dir, path)
}
