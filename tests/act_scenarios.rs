use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use tokio::sync::broadcast;

use tessera_core::act::ActStatus;
use tessera_core::config::AppConfig;
use tessera_core::error::{CapabilityError, GenerationError};
use tessera_core::event::ActEvent;
use tessera_core::generation::{Generation, GenerationStatus};
use tessera_core::stream::OutputChunk;
use tessera_core::types::{ActId, NodeId};
use tessera_engine::{ActOrchestrator, ActRequest};
use tessera_graph::{Blueprint, RetrievalPolicy, RetrievalSpec};
use tessera_store::{RunRegistry, SqliteStore};
use tessera_test_utils::{
    chain_blueprint, disconnected_blueprint, fast_config, orchestrator_for, registry_with,
    text_generation, FailingStore, MockQuery, RecordingUsage, Response, ScriptedCapability, OWNER,
};

fn by_node(generations: &[Generation], node: &NodeId) -> Generation {
    generations
        .iter()
        .find(|g| &g.node_id == node)
        .cloned()
        .unwrap_or_else(|| panic!("no generation for {}", node))
}

async fn wait_until<F>(orchestrator: &ActOrchestrator, act_id: &ActId, done: F) -> Vec<Generation>
where
    F: Fn(&[Generation]) -> bool,
{
    for _ in 0..400 {
        let gens = orchestrator.generations(act_id).await.unwrap();
        if done(&gens) {
            return gens;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("condition not reached for act {}", act_id);
}

fn drain(rx: &mut broadcast::Receiver<ActEvent>) -> Vec<ActEvent> {
    let mut events = vec![];
    while let Ok(event) = rx.try_recv() {
        events.push(event);
    }
    events
}

#[tokio::test]
async fn test_data_edge_binds_upstream_output() {
    let (bp, a, b) = chain_blueprint();
    let capability = Arc::new(ScriptedCapability::new().respond("A", Response::Output(json!("hello"))));
    let orchestrator = orchestrator_for(&bp, capability.clone(), &fast_config(0)).await;

    let act = orchestrator
        .run_act(ActRequest::new(bp.id.clone(), OWNER))
        .await
        .unwrap();

    assert_eq!(act.status, ActStatus::Completed);
    assert!(act.error.is_none());
    let gens = orchestrator.generations(&act.id).await.unwrap();
    assert_eq!(gens.len(), 2);
    assert!(gens.iter().all(|g| g.status == GenerationStatus::Completed));

    let b_gen = by_node(&gens, &b);
    let ctx = b_gen.context.expect("B context");
    assert_eq!(ctx.to_value(), json!({ "A": "hello" }));
    assert_eq!(by_node(&gens, &a).output, Some(json!("hello")));
}

#[tokio::test]
async fn test_disconnected_nodes_run_concurrently() {
    let (bp, ids) = disconnected_blueprint(3);
    let mut capability = ScriptedCapability::new();
    for i in 0..3 {
        capability = capability.with_delay(&format!("N{}", i), Duration::from_millis(60));
    }
    let capability = Arc::new(capability);
    let orchestrator = orchestrator_for(&bp, capability.clone(), &fast_config(0)).await;

    let steps = orchestrator.build_steps(&bp).unwrap();
    assert_eq!(steps.len(), 3);
    assert!(steps.iter().all(|s| s.level == 0));

    let act = orchestrator
        .run_act(ActRequest::new(bp.id.clone(), OWNER))
        .await
        .unwrap();

    assert_eq!(act.status, ActStatus::Completed);
    assert_eq!(capability.peak_concurrency(), 3);
    let gens = orchestrator.generations(&act.id).await.unwrap();
    for id in &ids {
        let ctx = by_node(&gens, id).context.expect("context");
        assert!(ctx.is_empty());
    }
}

#[tokio::test]
async fn test_concurrency_limit_is_respected() {
    let (bp, _) = disconnected_blueprint(4);
    let mut capability = ScriptedCapability::new();
    for i in 0..4 {
        capability = capability.with_delay(&format!("N{}", i), Duration::from_millis(20));
    }
    let capability = Arc::new(capability);
    let mut config = fast_config(0);
    config.engine.max_concurrent_generations = 2;
    let orchestrator = orchestrator_for(&bp, capability.clone(), &config).await;

    let act = orchestrator
        .run_act(ActRequest::new(bp.id.clone(), OWNER))
        .await
        .unwrap();

    assert_eq!(act.status, ActStatus::Completed);
    assert_eq!(capability.total_invocations(), 4);
    assert!(capability.peak_concurrency() <= 2);
}

#[tokio::test]
async fn test_timeout_exhausts_retries_and_fails_act() {
    let bp = tessera_test_utils::empty_blueprint("timeout");
    let (bp, slow) = bp.add_node(text_generation("Slow").with_timeout_ms(20));
    let capability = Arc::new(ScriptedCapability::new().respond("Slow", Response::Hang));
    let orchestrator = orchestrator_for(&bp, capability.clone(), &fast_config(2)).await;
    let mut rx = orchestrator.events().subscribe();

    let act = orchestrator
        .run_act(ActRequest::new(bp.id.clone(), OWNER))
        .await
        .unwrap();

    assert_eq!(act.status, ActStatus::Failed);
    assert_eq!(capability.invocations("Slow"), 3);

    let gens = orchestrator.generations(&act.id).await.unwrap();
    assert_eq!(gens.len(), 1);
    let generation = by_node(&gens, &slow);
    assert_eq!(generation.status, GenerationStatus::Failed);
    assert_eq!(generation.attempt, 3);
    assert_eq!(generation.error, Some(GenerationError::Timeout { after_ms: 20 }));
    assert_eq!(generation.last_attempt_error, Some(CapabilityError::Timeout));

    let error = act.error.expect("act error");
    assert_eq!(error.node_id, Some(slow));
    assert_eq!(error.error, GenerationError::Timeout { after_ms: 20 });

    let lifecycle: Vec<&'static str> = drain(&mut rx)
        .iter()
        .filter_map(|e| match e {
            ActEvent::GenerationQueued { .. } => Some("queued"),
            ActEvent::GenerationStarted { .. } => Some("running"),
            ActEvent::GenerationRetrying { .. } => Some("retry"),
            ActEvent::GenerationFinished { status, .. } => Some(status.as_str()),
            _ => None,
        })
        .collect();
    assert_eq!(lifecycle, vec!["queued", "running", "retry", "retry", "failed"]);
}

#[tokio::test]
async fn test_transient_failure_is_retried_on_same_generation() {
    let bp = tessera_test_utils::empty_blueprint("flaky");
    let (bp, flaky) = bp.add_node(text_generation("Flaky"));
    let capability = Arc::new(
        ScriptedCapability::new()
            .respond("Flaky", Response::Fail(CapabilityError::RateLimited { retry_after_ms: Some(1) }))
            .respond("Flaky", Response::Output(json!("ok"))),
    );
    let orchestrator = orchestrator_for(&bp, capability.clone(), &fast_config(3)).await;

    let act = orchestrator
        .run_act(ActRequest::new(bp.id.clone(), OWNER))
        .await
        .unwrap();

    assert_eq!(act.status, ActStatus::Completed);
    assert_eq!(act.generations.len(), 1);
    let generation = by_node(&orchestrator.generations(&act.id).await.unwrap(), &flaky);
    assert_eq!(generation.attempt, 2);
    assert_eq!(generation.output, Some(json!("ok")));
    assert!(matches!(
        generation.last_attempt_error,
        Some(CapabilityError::RateLimited { .. })
    ));

    let mut reader = orchestrator.stream_output(&generation.id, 0).unwrap();
    assert_eq!(reader.next().await, Some(OutputChunk::Retry { attempt: 2 }));
    assert_eq!(reader.next().await, None);
}

#[tokio::test]
async fn test_permanent_failure_is_not_retried() {
    let (bp, a, b) = chain_blueprint();
    let capability = Arc::new(
        ScriptedCapability::new().respond("A", Response::Fail(CapabilityError::remote("bad request"))),
    );
    let orchestrator = orchestrator_for(&bp, capability.clone(), &fast_config(3)).await;

    let act = orchestrator
        .run_act(ActRequest::new(bp.id.clone(), OWNER))
        .await
        .unwrap();

    assert_eq!(act.status, ActStatus::Failed);
    assert_eq!(capability.invocations("A"), 1);
    assert_eq!(capability.invocations("B"), 0);
    let gens = orchestrator.generations(&act.id).await.unwrap();
    assert_eq!(gens.len(), 1);
    assert_eq!(by_node(&gens, &a).status, GenerationStatus::Failed);
    assert!(gens.iter().all(|g| g.node_id != b));
}

#[tokio::test]
async fn test_cancel_only_touches_non_terminal_generations() {
    let bp = tessera_test_utils::empty_blueprint("cancel");
    let (bp, quick) = bp.add_node(text_generation("Quick"));
    let (bp, stuck) = bp.add_node(text_generation("Stuck"));
    let (bp, after) = bp.add_node(text_generation("After"));
    let (bp, _) = bp.connect_control(&stuck, &after).unwrap();
    let capability = Arc::new(ScriptedCapability::new().respond("Stuck", Response::Hang));
    let orchestrator = orchestrator_for(&bp, capability.clone(), &fast_config(0)).await;

    let act_id = orchestrator
        .start_act(ActRequest::new(bp.id.clone(), OWNER))
        .await
        .unwrap();
    wait_until(&orchestrator, &act_id, |gens| {
        gens.iter().any(|g| g.node_id == quick && g.status == GenerationStatus::Completed)
            && gens.iter().any(|g| g.node_id == stuck && g.status == GenerationStatus::Running)
    })
    .await;

    orchestrator.cancel_act(&act_id).await.unwrap();
    let act = orchestrator.wait(&act_id).await.unwrap();

    assert_eq!(act.status, ActStatus::Cancelled);
    let gens = orchestrator.generations(&act_id).await.unwrap();
    assert_eq!(gens.len(), 2);
    assert_eq!(by_node(&gens, &quick).status, GenerationStatus::Completed);
    assert_eq!(by_node(&gens, &stuck).status, GenerationStatus::Cancelled);
    assert!(gens.iter().all(|g| g.node_id != after));
    assert_eq!(capability.invocations("After"), 0);

    // Cancelling a finished act is a no-op.
    orchestrator.cancel_act(&act_id).await.unwrap();
    let stored = orchestrator.get_act(&act_id).await.unwrap().unwrap();
    assert_eq!(stored.status, ActStatus::Cancelled);
}

#[tokio::test]
async fn test_failed_best_effort_upstream_leaves_consumer_unresolved() {
    let bp = tessera_test_utils::empty_blueprint("best-effort");
    let (bp, source) = bp.add_node(text_generation("Source").best_effort());
    let (bp, sink) = bp.add_node(
        text_generation("Sink").with_input(tessera_graph::PortSpec::data("Source")),
    );
    let (bp, side) = bp.add_node(text_generation("Side"));
    let (bp, _) = bp.connect_control(&source, &sink).unwrap();
    let (bp, _) = bp.connect_control(&source, &side).unwrap();
    let (bp, _) = bp.connect_data(&source, "output", &sink, "Source").unwrap();
    let capability = Arc::new(
        ScriptedCapability::new().respond("Source", Response::Fail(CapabilityError::remote("denied"))),
    );
    let orchestrator = orchestrator_for(&bp, capability.clone(), &fast_config(0)).await;

    let act = orchestrator
        .run_act(ActRequest::new(bp.id.clone(), OWNER))
        .await
        .unwrap();

    assert_eq!(capability.invocations("Sink"), 0);
    let gens = orchestrator.generations(&act.id).await.unwrap();
    assert_eq!(by_node(&gens, &side).status, GenerationStatus::Completed);
    let sink_gen = by_node(&gens, &sink);
    assert_eq!(sink_gen.status, GenerationStatus::Failed);
    assert_eq!(
        sink_gen.error,
        Some(GenerationError::UnresolvedDependency {
            upstream: source.clone()
        })
    );
    assert_eq!(act.status, ActStatus::Failed);
    assert!(matches!(
        act.error.map(|e| e.error),
        Some(GenerationError::UnresolvedDependency { .. })
    ));
}

#[tokio::test]
async fn test_best_effort_failure_alone_still_completes() {
    let (bp, a, b) = {
        let bp = tessera_test_utils::empty_blueprint("tolerated");
        let (bp, a) = bp.add_node(text_generation("A").best_effort());
        let (bp, b) = bp.add_node(text_generation("B"));
        let (bp, _) = bp.connect_control(&a, &b).unwrap();
        (bp, a, b)
    };
    let capability = Arc::new(
        ScriptedCapability::new().respond("A", Response::Fail(CapabilityError::remote("flaky tool"))),
    );
    let orchestrator = orchestrator_for(&bp, capability, &fast_config(0)).await;

    let act = orchestrator
        .run_act(ActRequest::new(bp.id.clone(), OWNER))
        .await
        .unwrap();

    assert_eq!(act.status, ActStatus::Completed);
    let gens = orchestrator.generations(&act.id).await.unwrap();
    assert_eq!(by_node(&gens, &a).status, GenerationStatus::Failed);
    assert_eq!(by_node(&gens, &b).status, GenerationStatus::Completed);
}

#[tokio::test]
async fn test_agent_time_is_summed_and_reported_once() {
    let (bp, _, _) = chain_blueprint();
    let capability = Arc::new(
        ScriptedCapability::new()
            .with_delay("A", Duration::from_millis(15))
            .with_delay("B", Duration::from_millis(15)),
    );
    let usage = Arc::new(RecordingUsage::default());
    let orchestrator = ActOrchestrator::builder(registry_with(&bp).await, capability)
        .config(&fast_config(0))
        .usage_reporter(usage.clone())
        .build();

    let act = orchestrator
        .run_act(ActRequest::new(bp.id.clone(), "billing-owner"))
        .await
        .unwrap();

    let gens = orchestrator.generations(&act.id).await.unwrap();
    let total: u64 = gens.iter().map(Generation::duration_ms).sum();
    assert_eq!(act.agent_time_ms, total);
    assert!(act.agent_time_ms >= 30);

    let reports = usage.wait_for(1).await;
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert_eq!(reports, vec![("billing-owner".to_string(), total)]);
    assert_eq!(usage.reports().len(), 1);
}

#[tokio::test]
async fn test_subgraph_run_from_start_node() {
    let (bp, a, b) = chain_blueprint();
    let (bp, c) = bp.add_node(text_generation("C"));
    let (bp, _) = bp.connect_control(&b, &c).unwrap();
    let capability = Arc::new(ScriptedCapability::new());
    let orchestrator = orchestrator_for(&bp, capability.clone(), &fast_config(0)).await;

    let act = orchestrator
        .run_act(ActRequest::new(bp.id.clone(), OWNER).starting_at(b.clone()))
        .await
        .unwrap();

    assert_eq!(act.status, ActStatus::Completed);
    assert_eq!(act.start_node, Some(b.clone()));
    let planned: Vec<NodeId> = act.steps.iter().map(|s| s.node_id.clone()).collect();
    assert_eq!(planned, vec![b.clone(), c.clone()]);
    assert_eq!(capability.invocations("A"), 0);

    let gens = orchestrator.generations(&act.id).await.unwrap();
    assert!(gens.iter().all(|g| g.node_id != a));
    // A is outside the plan, so B runs without its data input.
    assert!(by_node(&gens, &b).context.expect("context").is_empty());
}

#[tokio::test]
async fn test_retrieval_results_reach_context() {
    let bp = tessera_test_utils::empty_blueprint("retrieval");
    let (bp, a) = bp.add_node(text_generation("A"));
    let (bp, b) = bp.add_node(
        text_generation("B")
            .with_input(tessera_graph::PortSpec::data("A"))
            .with_retrieval(RetrievalSpec::new("notes on {{A}}")),
    );
    let (bp, _) = bp.connect_control(&a, &b).unwrap();
    let (bp, _) = bp.connect_data(&a, "output", &b, "A").unwrap();
    let capability = Arc::new(ScriptedCapability::new().respond("A", Response::Output(json!("rust"))));
    let query = Arc::new(MockQuery::with_hits(&["ownership", "borrowing"]));
    let orchestrator = ActOrchestrator::builder(registry_with(&bp).await, capability)
        .config(&fast_config(0))
        .query_client(query.clone())
        .build();

    let act = orchestrator
        .run_act(ActRequest::new(bp.id.clone(), OWNER))
        .await
        .unwrap();

    assert_eq!(act.status, ActStatus::Completed);
    assert_eq!(query.queries(), vec!["notes on rust".to_string()]);
    let ctx = by_node(&orchestrator.generations(&act.id).await.unwrap(), &b)
        .context
        .expect("context");
    let hits = ctx.retrieval().expect("retrieval results");
    assert_eq!(hits.len(), 2);
    assert_eq!(hits[0].content, "ownership");
}

#[tokio::test]
async fn test_required_retrieval_failure_fails_node() {
    let bp = tessera_test_utils::empty_blueprint("retrieval-required");
    let (bp, node) = bp.add_node(
        text_generation("Lookup")
            .with_retrieval(RetrievalSpec::new("anything").with_policy(RetrievalPolicy::Required)),
    );
    let capability = Arc::new(ScriptedCapability::new());
    let orchestrator = ActOrchestrator::builder(registry_with(&bp).await, capability.clone())
        .config(&fast_config(0))
        .query_client(Arc::new(MockQuery::failing()))
        .build();

    let act = orchestrator
        .run_act(ActRequest::new(bp.id.clone(), OWNER))
        .await
        .unwrap();

    assert_eq!(act.status, ActStatus::Failed);
    assert_eq!(capability.invocations("Lookup"), 0);
    let generation = by_node(&orchestrator.generations(&act.id).await.unwrap(), &node);
    assert!(matches!(
        generation.error,
        Some(GenerationError::UpstreamContext { .. })
    ));
}

#[tokio::test]
async fn test_acts_persist_in_sqlite_registry() {
    let dir = tempfile::tempdir().unwrap();
    let db = dir.path().join("runs.db");
    let (bp, _, b) = chain_blueprint();

    let act_id = {
        let registry = RunRegistry::new(Arc::new(SqliteStore::open(&db).unwrap()));
        registry.save_blueprint(&bp).await.unwrap();
        let orchestrator =
            ActOrchestrator::builder(registry, Arc::new(ScriptedCapability::new()))
                .config(&fast_config(0))
                .build();
        let act = orchestrator
            .run_act(ActRequest::new(bp.id.clone(), OWNER))
            .await
            .unwrap();
        assert_eq!(act.status, ActStatus::Completed);
        act.id
    };

    let reopened = RunRegistry::new(Arc::new(SqliteStore::open(&db).unwrap()));
    let summaries = reopened.acts_for_workspace(&bp.id).await.unwrap();
    assert_eq!(summaries.len(), 1);
    assert_eq!(summaries[0].id, act_id);
    assert_eq!(summaries[0].status, ActStatus::Completed);
    assert_eq!(summaries[0].generation_count, 2);

    let gens = reopened.generations_for_act(&act_id).await.unwrap();
    assert_eq!(gens.len(), 2);
    assert_eq!(gens[1].node_id, b);
    assert_eq!(
        gens[1].context.as_ref().and_then(|c| c.get_str("A")),
        Some("A")
    );
}

#[tokio::test]
async fn test_cancel_settles_cancelled_every_time() {
    let bp = tessera_test_utils::empty_blueprint("cancel-repeat");
    let (bp, stuck) = bp.add_node(text_generation("Stuck"));
    let capability = Arc::new(ScriptedCapability::new().respond("Stuck", Response::Hang));
    let orchestrator = orchestrator_for(&bp, capability, &fast_config(2)).await;

    for round in 0..30 {
        let act_id = orchestrator
            .start_act(ActRequest::new(bp.id.clone(), OWNER))
            .await
            .unwrap();
        wait_until(&orchestrator, &act_id, |gens| {
            gens.iter().any(|g| g.status == GenerationStatus::Running)
        })
        .await;

        orchestrator.cancel_act(&act_id).await.unwrap();
        let act = orchestrator.wait(&act_id).await.unwrap();

        assert_eq!(act.status, ActStatus::Cancelled, "round {}", round);
        let generation = by_node(&orchestrator.generations(&act_id).await.unwrap(), &stuck);
        assert_eq!(generation.status, GenerationStatus::Cancelled, "round {}", round);
        assert!(
            !matches!(generation.error, Some(GenerationError::Capability { .. })),
            "round {}: {:?}",
            round,
            generation.error
        );
    }
}

#[tokio::test]
async fn test_rejected_running_write_fails_generation_without_invoking() {
    let (bp, a, _) = chain_blueprint();
    let store = Arc::new(FailingStore::rejecting(GenerationStatus::Running));
    let registry = RunRegistry::new(store.clone());
    registry.save_blueprint(&bp).await.unwrap();
    let capability = Arc::new(ScriptedCapability::new());
    let orchestrator = ActOrchestrator::builder(registry, capability.clone())
        .config(&fast_config(0))
        .build();

    let act = orchestrator
        .run_act(ActRequest::new(bp.id.clone(), OWNER))
        .await
        .unwrap();

    assert_eq!(capability.total_invocations(), 0);
    assert!(store.rejected() >= 1);
    let gens = orchestrator.generations(&act.id).await.unwrap();
    assert_eq!(gens.len(), 1);
    let first = by_node(&gens, &a);
    assert_eq!(first.status, GenerationStatus::Failed);
    assert!(matches!(first.error, Some(GenerationError::Lost { .. })));
    assert_eq!(act.status, ActStatus::Failed);
    assert!(matches!(
        act.error.map(|e| e.error),
        Some(GenerationError::Lost { .. })
    ));
}

#[tokio::test]
async fn test_rejected_queued_write_fails_act_before_spawning() {
    let bp = tessera_test_utils::empty_blueprint("queued-write");
    let (bp, a) = bp.add_node(text_generation("A").best_effort());
    let store = Arc::new(FailingStore::rejecting(GenerationStatus::Queued));
    let registry = RunRegistry::new(store.clone());
    registry.save_blueprint(&bp).await.unwrap();
    let capability = Arc::new(ScriptedCapability::new());
    let orchestrator = ActOrchestrator::builder(registry, capability.clone())
        .config(&fast_config(0))
        .build();

    let act = orchestrator
        .run_act(ActRequest::new(bp.id.clone(), OWNER))
        .await
        .unwrap();

    assert_eq!(capability.total_invocations(), 0);
    assert_eq!(store.rejected(), 1);
    // Lost halts the act even on a best-effort node.
    assert_eq!(act.status, ActStatus::Failed);
    assert_eq!(act.generations.len(), 1);
    let stored = orchestrator
        .get_generation(&act.generations[0])
        .await
        .unwrap()
        .unwrap();
    assert_eq!(stored.node_id, a);
    assert_eq!(stored.status, GenerationStatus::Failed);
    assert!(matches!(stored.error, Some(GenerationError::Lost { .. })));
}

#[tokio::test]
async fn test_panicking_capability_fails_its_generation() {
    let (bp, a, b) = chain_blueprint();
    let capability = Arc::new(
        ScriptedCapability::new()
            .with_chunks("A", &["partial"])
            .respond("A", Response::Panic),
    );
    let orchestrator = orchestrator_for(&bp, capability.clone(), &fast_config(0)).await;

    let act = orchestrator
        .run_act(ActRequest::new(bp.id.clone(), OWNER))
        .await
        .unwrap();

    assert_eq!(act.status, ActStatus::Failed);
    assert_eq!(capability.invocations("B"), 0);
    let gens = orchestrator.generations(&act.id).await.unwrap();
    assert!(gens.iter().all(|g| g.node_id != b));
    let panicked = by_node(&gens, &a);
    assert_eq!(panicked.status, GenerationStatus::Failed);
    assert!(matches!(panicked.error, Some(GenerationError::Lost { .. })));
    let act_error = act.error.unwrap();
    assert_eq!(act_error.node_id, Some(a));
    assert_eq!(act_error.generation_id, Some(panicked.id.clone()));

    let mut reader = orchestrator.stream_output(&panicked.id, 0).unwrap();
    let drained = tokio::time::timeout(Duration::from_secs(2), async {
        let mut chunks = vec![];
        while let Some(chunk) = reader.next().await {
            chunks.push(chunk);
        }
        chunks
    })
    .await
    .expect("output stream closed");
    assert_eq!(drained, vec![OutputChunk::Delta { text: "partial".into() }]);
}

#[tokio::test]
async fn test_output_buffers_evicted_after_retention() {
    let (bp, a, _) = chain_blueprint();
    let mut config: AppConfig = fast_config(0);
    config.engine.output_retention_ms = 0;
    let orchestrator = orchestrator_for(&bp, Arc::new(ScriptedCapability::new()), &config).await;

    let act = orchestrator
        .run_act(ActRequest::new(bp.id.clone(), OWNER))
        .await
        .unwrap();
    assert_eq!(act.status, ActStatus::Completed);

    let mut evicted = false;
    for _ in 0..400 {
        if act
            .generations
            .iter()
            .all(|id| orchestrator.stream_output(id, 0).is_none())
        {
            evicted = true;
            break;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    assert!(evicted);

    // Records outlive their buffers.
    let gens = orchestrator.generations(&act.id).await.unwrap();
    assert_eq!(by_node(&gens, &a).status, GenerationStatus::Completed);
}

#[tokio::test]
async fn test_stored_plan_in_blueprint_file_is_replanned() {
    let (bp, a, b) = chain_blueprint();
    let mut raw: serde_json::Value = serde_json::from_str(&bp.to_json_pretty().unwrap()).unwrap();
    raw["state"] = json!({ "state": "built", "steps": [] });
    let loaded = Blueprint::from_json(&raw.to_string()).unwrap();
    let capability = Arc::new(ScriptedCapability::new());
    let orchestrator = orchestrator_for(&loaded, capability.clone(), &fast_config(0)).await;

    let act = orchestrator
        .run_act(ActRequest::new(loaded.id.clone(), OWNER))
        .await
        .unwrap();

    assert_eq!(act.status, ActStatus::Completed);
    assert_eq!(act.steps.len(), 2);
    assert_eq!(capability.total_invocations(), 2);
    let gens = orchestrator.generations(&act.id).await.unwrap();
    assert_eq!(by_node(&gens, &a).status, GenerationStatus::Completed);
    assert_eq!(by_node(&gens, &b).status, GenerationStatus::Completed);
}
