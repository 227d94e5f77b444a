//! Lifecycle of a single generation.
//!
//! A [`GenerationTask`] owns one queued generation and drives it to a
//! terminal state: wait for a concurrency slot, resolve context, invoke the
//! capability with per-attempt timeouts and retries, and close the output
//! buffer on every exit path. Each transition is persisted before the task
//! moves on.

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use tessera_core::config::RetryConfig;
use tessera_core::error::{CapabilityError, GenerationError, Result};
use tessera_core::event::{ActEvent, EventBus};
use tessera_core::generation::Generation;
use tessera_core::stream::{OutputBuffer, OutputChunk, OutputSink};
use tessera_core::types::{InputContext, NodeId};
use tessera_graph::Blueprint;
use tessera_store::RunRegistry;

use crate::context::ContextResolver;
use crate::retry::retry_delay;
use crate::traits::{ExecutionCapability, InvocationRequest};

/// Shared collaborators every generation of an act uses.
#[derive(Clone)]
pub struct GenerationEnv {
    pub registry: RunRegistry,
    pub capability: Arc<dyn ExecutionCapability>,
    pub resolver: ContextResolver,
    pub events: Arc<EventBus>,
    pub retry: RetryConfig,
    pub default_timeout_ms: Option<u64>,
    pub slots: Arc<Semaphore>,
}

/// One generation plus the inputs it needs to run.
pub struct GenerationTask {
    pub generation: Generation,
    pub blueprint: Arc<Blueprint>,
    pub plan: Arc<BTreeSet<NodeId>>,
    /// Terminal generations of the node's data predecessors.
    pub upstream: HashMap<NodeId, Generation>,
    pub buffer: Arc<OutputBuffer>,
    pub cancel: CancellationToken,
    pub env: GenerationEnv,
}

enum AttemptOutcome {
    Finished(std::result::Result<serde_json::Value, CapabilityError>),
    TimedOut(u64),
    Cancelled,
}

impl GenerationTask {
    /// Drive the generation to a terminal state and return it.
    pub async fn run(mut self) -> Generation {
        let permit = tokio::select! {
            biased;
            _ = self.cancel.cancelled() => None,
            permit = self.env.slots.clone().acquire_owned() => permit.ok(),
        };
        if permit.is_none() || self.cancel.is_cancelled() {
            self.settle(|g| g.cancel()).await;
            return self.finish();
        }

        let context = match self
            .env
            .resolver
            .resolve(
                &self.blueprint,
                &self.generation.node_id,
                &self.plan,
                &self.upstream,
                &self.generation.origin.workspace_id,
            )
            .await
        {
            Ok(ctx) => ctx,
            Err(e) => {
                let err = GenerationError::from(e);
                if err.is_defect() {
                    error!(
                        act_id = %self.generation.origin.act_id,
                        node_id = %self.generation.node_id,
                        generation_id = %self.generation.id,
                        error = %err,
                        "Generation dispatched with unresolved dependency"
                    );
                }
                self.settle(|g| g.fail(err)).await;
                return self.finish();
            }
        };

        if self.cancel.is_cancelled() {
            self.settle(|g| g.cancel()).await;
            return self.finish();
        }

        if !self.settle(|g| g.start(context.clone())).await {
            return self.finish();
        }
        self.env.events.publish(ActEvent::GenerationStarted {
            act_id: self.generation.origin.act_id.clone(),
            generation_id: self.generation.id.clone(),
            node_id: self.generation.node_id.clone(),
        });

        self.attempt_loop(context).await;
        self.finish()
    }

    async fn attempt_loop(&mut self, context: InputContext) {
        let Some(node) = self.blueprint.node(&self.generation.node_id).cloned() else {
            let message = format!("node {} disappeared from blueprint", self.generation.node_id);
            self.settle(|g| g.fail(GenerationError::UpstreamContext { message }))
                .await;
            return;
        };
        let timeout_ms = node.timeout_ms.or(self.env.default_timeout_ms);
        let max_retries = self.env.retry.max_retries;

        for retry_index in 0..=max_retries {
            debug!(
                generation_id = %self.generation.id,
                node_id = %node.id,
                attempt = self.generation.attempt,
                "Invoking capability"
            );
            let request = InvocationRequest {
                generation_id: self.generation.id.clone(),
                node: node.clone(),
                context: context.clone(),
                attempt: self.generation.attempt,
            };

            let error = match self.invoke(request, timeout_ms).await {
                AttemptOutcome::Finished(Ok(output)) => {
                    self.settle(|g| g.complete(output)).await;
                    return;
                }
                AttemptOutcome::Cancelled => {
                    self.settle(|g| g.cancel()).await;
                    return;
                }
                AttemptOutcome::Finished(Err(e)) if !e.is_transient() || retry_index == max_retries => {
                    self.settle(|g| g.fail(GenerationError::Capability { error: e }))
                        .await;
                    return;
                }
                AttemptOutcome::TimedOut(after_ms) if retry_index == max_retries => {
                    warn!(
                        generation_id = %self.generation.id,
                        node_id = %node.id,
                        after_ms,
                        "Generation timed out"
                    );
                    self.settle(|g| g.fail(GenerationError::Timeout { after_ms }))
                        .await;
                    return;
                }
                AttemptOutcome::Finished(Err(e)) => e,
                AttemptOutcome::TimedOut(_) => CapabilityError::Timeout,
            };

            let delay = retry_delay(&error, retry_index, &self.env.retry);
            warn!(
                generation_id = %self.generation.id,
                node_id = %node.id,
                attempt = self.generation.attempt,
                backoff_ms = delay.as_millis() as u64,
                error = %error,
                "Retrying generation"
            );
            let message = error.to_string();
            if !self.settle(|g| g.retry(error)).await {
                return;
            }
            self.buffer.push(OutputChunk::Retry {
                attempt: self.generation.attempt,
            });
            self.env.events.publish(ActEvent::GenerationRetrying {
                act_id: self.generation.origin.act_id.clone(),
                generation_id: self.generation.id.clone(),
                node_id: node.id.clone(),
                attempt: self.generation.attempt,
                error: message,
            });

            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => {
                    self.settle(|g| g.cancel()).await;
                    return;
                }
                _ = tokio::time::sleep(delay) => {}
            }
        }
    }

    async fn invoke(&self, request: InvocationRequest, timeout_ms: Option<u64>) -> AttemptOutcome {
        let sink = OutputSink::new(self.buffer.clone());
        let call = self
            .env
            .capability
            .invoke(request, sink, self.cancel.child_token());

        let bounded = async {
            match timeout_ms {
                Some(ms) => match tokio::time::timeout(Duration::from_millis(ms), call).await {
                    Ok(result) => AttemptOutcome::Finished(result),
                    Err(_) => AttemptOutcome::TimedOut(ms),
                },
                None => AttemptOutcome::Finished(call.await),
            }
        };

        let outcome = tokio::select! {
            biased;
            _ = self.cancel.cancelled() => AttemptOutcome::Cancelled,
            outcome = bounded => outcome,
        };
        // A capability that honours its child token may finish first with
        // an error; that attempt was cancelled, not failed.
        match outcome {
            AttemptOutcome::Finished(Err(_)) | AttemptOutcome::TimedOut(_)
                if self.cancel.is_cancelled() =>
            {
                AttemptOutcome::Cancelled
            }
            other => other,
        }
    }

    /// Apply a state-machine transition and persist it. The transition only
    /// takes effect once recorded; if it cannot be recorded the generation
    /// is failed as lost and `false` is returned.
    async fn settle(&mut self, transition: impl FnOnce(&mut Generation) -> Result<()>) -> bool {
        let mut next = self.generation.clone();
        if let Err(e) = transition(&mut next) {
            error!(generation_id = %self.generation.id, error = %e, "Illegal generation transition");
            self.mark_lost(format!("illegal transition: {}", e)).await;
            return false;
        }
        match self.env.registry.record_generation(&next).await {
            Ok(()) => {
                self.generation = next;
                true
            }
            Err(e) => {
                error!(
                    generation_id = %self.generation.id,
                    to = %next.status,
                    error = %e,
                    "Failed to persist generation transition"
                );
                self.mark_lost(format!("failed to persist {}: {}", next.status, e))
                    .await;
                false
            }
        }
    }

    async fn mark_lost(&mut self, message: String) {
        if self.generation.is_terminal() {
            return;
        }
        if self
            .generation
            .fail(GenerationError::Lost { message })
            .is_err()
        {
            return;
        }
        if let Err(e) = self.env.registry.record_generation(&self.generation).await {
            error!(generation_id = %self.generation.id, error = %e, "Failed to persist lost generation");
        }
    }

    fn finish(self) -> Generation {
        self.buffer.close();
        let generation = self.generation;
        info!(
            act_id = %generation.origin.act_id,
            node_id = %generation.node_id,
            generation_id = %generation.id,
            status = %generation.status,
            attempt = generation.attempt,
            "Generation finished"
        );
        self.env.events.publish(ActEvent::GenerationFinished {
            act_id: generation.origin.act_id.clone(),
            generation_id: generation.id.clone(),
            node_id: generation.node_id.clone(),
            status: generation.status,
            duration_ms: generation.duration_ms(),
        });
        generation
    }
}
