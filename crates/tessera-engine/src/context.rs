use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;

use serde_json::Value;
use thiserror::Error;
use tracing::{debug, warn};

use tessera_core::error::GenerationError;
use tessera_core::generation::{Generation, GenerationStatus};
use tessera_core::types::{InputContext, NodeId, PortId, WorkspaceId};
use tessera_graph::{Blueprint, RetrievalPolicy};

use crate::traits::{QueryClient, QueryRequest};

/// Why a node's context could not be assembled.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ResolveError {
    #[error("Node {node} is not part of the blueprint")]
    UnknownNode { node: NodeId },

    #[error("Upstream {upstream} has no completed generation")]
    Unresolved { upstream: NodeId },

    #[error("Retrieval failed: {0}")]
    Retrieval(String),
}

impl From<ResolveError> for GenerationError {
    fn from(e: ResolveError) -> Self {
        match e {
            ResolveError::Unresolved { upstream } => GenerationError::UnresolvedDependency { upstream },
            other => GenerationError::UpstreamContext {
                message: other.to_string(),
            },
        }
    }
}

/// Builds a node's [`InputContext`] from completed upstream generations and,
/// when the node asks for it, a retrieval query.
#[derive(Clone, Default)]
pub struct ContextResolver {
    query: Option<Arc<dyn QueryClient>>,
}

impl ContextResolver {
    pub fn new(query: Option<Arc<dyn QueryClient>>) -> Self {
        Self { query }
    }

    /// Assemble the context of `node_id`.
    ///
    /// `plan` is the set of nodes in the current act; data edges from nodes
    /// outside it are ignored. `upstream` holds the terminal generations of
    /// the act, keyed by node.
    pub async fn resolve(
        &self,
        blueprint: &Blueprint,
        node_id: &NodeId,
        plan: &BTreeSet<NodeId>,
        upstream: &HashMap<NodeId, Generation>,
        workspace_id: &WorkspaceId,
    ) -> Result<InputContext, ResolveError> {
        let node = blueprint
            .node(node_id)
            .ok_or_else(|| ResolveError::UnknownNode {
                node: node_id.clone(),
            })?;

        let mut context = InputContext::new();
        for port in node.data_inputs() {
            // One value per source port; a node may feed the input twice.
            let mut bound: BTreeMap<(&NodeId, &PortId), Value> = BTreeMap::new();
            for edge in blueprint.edges_into(&port.id).filter(|e| e.is_data()) {
                let source = &edge.source.node_id;
                if !plan.contains(source) {
                    continue;
                }
                let output = upstream
                    .get(source)
                    .filter(|g| g.status == GenerationStatus::Completed)
                    .and_then(|g| g.output.as_ref())
                    .ok_or_else(|| ResolveError::Unresolved {
                        upstream: source.clone(),
                    })?;
                let accessor = blueprint
                    .port(&edge.source.port_id)
                    .map(|(_, p, _)| p.accessor.as_str());
                bound.insert((source, &edge.source.port_id), select_field(output, accessor));
            }

            match bound.len() {
                0 => {}
                1 => {
                    if let Some(value) = bound.into_values().next() {
                        context.bind(port.accessor.clone(), value);
                    }
                }
                _ => context.bind(
                    port.accessor.clone(),
                    Value::Array(bound.into_values().collect()),
                ),
            }
        }

        if let Some(spec) = &node.retrieval {
            let policy = node
                .retrieval_policy()
                .unwrap_or(RetrievalPolicy::BestEffort);
            let request = QueryRequest {
                workspace_id: workspace_id.clone(),
                query: context.render(&spec.query),
                max_results: spec.max_results,
                similarity_threshold: spec.similarity_threshold,
            };
            let outcome = match &self.query {
                Some(client) => client
                    .query(request)
                    .await
                    .map_err(|e| e.to_string()),
                None => Err("no query client configured".to_string()),
            };
            match (outcome, policy) {
                (Ok(results), _) => {
                    debug!(node_id = %node_id, hits = results.len(), "Retrieval enriched context");
                    context.set_retrieval(results);
                }
                (Err(e), RetrievalPolicy::Required) => return Err(ResolveError::Retrieval(e)),
                (Err(e), RetrievalPolicy::BestEffort) => {
                    warn!(node_id = %node_id, error = %e, "Retrieval failed, continuing without it");
                    context.set_retrieval_error(e);
                }
            }
        }

        Ok(context)
    }
}

/// The upstream output field named by the source port, or the whole output.
fn select_field(output: &Value, accessor: Option<&str>) -> Value {
    match (output, accessor) {
        (Value::Object(map), Some(key)) => map.get(key).cloned().unwrap_or_else(|| output.clone()),
        _ => output.clone(),
    }
}
