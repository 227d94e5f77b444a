//! Step inference over control edges.
//!
//! Data edges never influence ordering here; the orchestrator waits on them
//! separately when deciding eligibility.

use std::collections::{BTreeMap, BTreeSet};

use tracing::debug;

use tessera_core::error::GraphValidationError;
use tessera_core::types::{NodeId, Step};

use crate::blueprint::Blueprint;

type PlanResult<T> = std::result::Result<T, GraphValidationError>;

/// Topologically order every node of the blueprint.
///
/// Checks run in a fixed order: a starting point must exist (an empty
/// blueprint has none), then an ending point, then the control graph must be
/// acyclic. Ties between ready nodes are broken by node id, so an unchanged
/// blueprint always yields the same steps.
pub fn build_steps(blueprint: &Blueprint) -> PlanResult<Vec<Step>> {
    let nodes: BTreeSet<NodeId> = blueprint.node_ids().cloned().collect();
    order(blueprint, &nodes)
}

/// Plan only the part of the blueprint reachable from `start` over control
/// and data edges. Orders and levels are renumbered for the subgraph.
pub fn plan_from(blueprint: &Blueprint, start: &NodeId) -> PlanResult<Vec<Step>> {
    if blueprint.node(start).is_none() {
        return Err(GraphValidationError::UnknownNode {
            node: start.clone(),
        });
    }
    let nodes = blueprint.reachable_from(start);
    order(blueprint, &nodes)
}

/// Node ids grouped by level, in plan order within each level.
pub fn group_levels(steps: &[Step]) -> Vec<Vec<NodeId>> {
    let mut levels: Vec<Vec<NodeId>> = Vec::new();
    let mut sorted: Vec<&Step> = steps.iter().collect();
    sorted.sort_by_key(|s| s.order);
    for step in sorted {
        if levels.len() <= step.level {
            levels.resize_with(step.level + 1, Vec::new);
        }
        levels[step.level].push(step.node_id.clone());
    }
    levels
}

/// Kahn's algorithm over the control edges between `nodes`.
fn order(blueprint: &Blueprint, nodes: &BTreeSet<NodeId>) -> PlanResult<Vec<Step>> {
    let mut in_degree: BTreeMap<&NodeId, usize> = nodes.iter().map(|n| (n, 0)).collect();
    let mut out_degree: BTreeMap<&NodeId, usize> = nodes.iter().map(|n| (n, 0)).collect();
    let mut successors: BTreeMap<&NodeId, Vec<&NodeId>> = BTreeMap::new();

    for edge in blueprint.edges().filter(|e| e.is_control()) {
        let (src, tgt) = (&edge.source.node_id, &edge.target.node_id);
        if !nodes.contains(src) || !nodes.contains(tgt) {
            continue;
        }
        if let Some(d) = in_degree.get_mut(tgt) {
            *d += 1;
        }
        if let Some(d) = out_degree.get_mut(src) {
            *d += 1;
        }
        successors.entry(src).or_default().push(tgt);
    }

    let mut ready: BTreeSet<&NodeId> = in_degree
        .iter()
        .filter(|(_, d)| **d == 0)
        .map(|(n, _)| *n)
        .collect();
    if ready.is_empty() {
        return Err(GraphValidationError::StartingPointNotFound);
    }
    if !out_degree.values().any(|d| *d == 0) {
        return Err(GraphValidationError::EndingPointNotFound);
    }

    let mut level: BTreeMap<&NodeId, usize> = BTreeMap::new();
    let mut steps = Vec::with_capacity(nodes.len());

    while let Some(node) = ready.pop_first() {
        let node_level = level.get(node).copied().unwrap_or(0);
        steps.push(Step {
            node_id: node.clone(),
            order: steps.len(),
            level: node_level,
        });

        for next in successors.get(node).into_iter().flatten() {
            let next_level = level.entry(*next).or_insert(0);
            *next_level = (*next_level).max(node_level + 1);
            if let Some(d) = in_degree.get_mut(*next) {
                *d -= 1;
                if *d == 0 {
                    ready.insert(*next);
                }
            }
        }
    }

    if steps.len() < nodes.len() {
        let placed: BTreeSet<&NodeId> = steps.iter().map(|s| &s.node_id).collect();
        let stuck: Vec<NodeId> = nodes
            .iter()
            .filter(|n| !placed.contains(n))
            .cloned()
            .collect();
        return Err(GraphValidationError::CycleDetected { nodes: stuck });
    }

    debug!(steps = steps.len(), "Planned blueprint");
    Ok(steps)
}
