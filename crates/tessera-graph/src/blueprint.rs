use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};

use serde::{Deserialize, Deserializer, Serialize, Serializer};

use tessera_core::error::{GraphValidationError, Result, TesseraError};
use tessera_core::types::{EdgeId, NodeId, PortId, PortKind, Step, WorkspaceId};

use crate::edge::{Edge, Endpoint};
use crate::node::{Direction, Node, NodeTemplate, Port};
use crate::planner;

type GraphResult<T> = std::result::Result<T, GraphValidationError>;

/// Whether the cached plan matches the current graph.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum BuildState {
    /// Edited since the last build.
    #[default]
    Dirty,
    /// Planned; steps are valid for this version.
    Built { steps: Vec<Step> },
}

/// A versioned node graph.
///
/// Blueprints are values: every mutation borrows `self` and returns a new
/// blueprint with `version` bumped and the plan cache invalidated, leaving
/// the original untouched for anyone still reading it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Blueprint {
    pub id: WorkspaceId,
    pub name: String,
    /// Caller identity billed for runs of this blueprint.
    #[serde(default)]
    pub owner_id: String,
    #[serde(default)]
    pub version: u64,
    #[serde(
        default,
        serialize_with = "serialize_nodes",
        deserialize_with = "deserialize_nodes"
    )]
    nodes: BTreeMap<NodeId, Node>,
    #[serde(
        default,
        serialize_with = "serialize_edges",
        deserialize_with = "deserialize_edges"
    )]
    edges: BTreeMap<EdgeId, Edge>,
    /// Never persisted: a loaded blueprint is always replanned.
    #[serde(skip)]
    state: BuildState,
}

impl Blueprint {
    pub fn new(id: WorkspaceId, name: impl Into<String>, owner_id: impl Into<String>) -> Self {
        Self {
            id,
            name: name.into(),
            owner_id: owner_id.into(),
            version: 0,
            nodes: BTreeMap::new(),
            edges: BTreeMap::new(),
            state: BuildState::Dirty,
        }
    }

    /// Parse a blueprint and check its invariants.
    pub fn from_json(json: &str) -> Result<Self> {
        let blueprint: Blueprint = serde_json::from_str(json)?;
        blueprint.validate()?;
        Ok(blueprint)
    }

    pub fn to_json_pretty(&self) -> Result<String> {
        serde_json::to_string_pretty(self).map_err(TesseraError::from)
    }

    // ── Queries ──────────────────────────────────────────────────

    pub fn nodes(&self) -> impl Iterator<Item = &Node> {
        self.nodes.values()
    }

    pub fn edges(&self) -> impl Iterator<Item = &Edge> {
        self.edges.values()
    }

    pub fn node(&self, id: &NodeId) -> Option<&Node> {
        self.nodes.get(id)
    }

    pub fn edge(&self, id: &EdgeId) -> Option<&Edge> {
        self.edges.get(id)
    }

    pub fn node_ids(&self) -> impl Iterator<Item = &NodeId> {
        self.nodes.keys()
    }

    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    pub fn edge_count(&self) -> usize {
        self.edges.len()
    }

    /// Locate a port anywhere in the graph.
    pub fn port(&self, port_id: &PortId) -> Option<(&Node, &Port, Direction)> {
        self.nodes
            .values()
            .find_map(|n| n.port(port_id).map(|(p, dir)| (n, p, dir)))
    }

    pub fn incoming_edges<'a>(&'a self, node_id: &'a NodeId) -> impl Iterator<Item = &'a Edge> {
        self.edges
            .values()
            .filter(move |e| &e.target.node_id == node_id)
    }

    pub fn outgoing_edges<'a>(&'a self, node_id: &'a NodeId) -> impl Iterator<Item = &'a Edge> {
        self.edges
            .values()
            .filter(move |e| &e.source.node_id == node_id)
    }

    /// Edges entering one input port.
    pub fn edges_into<'a>(&'a self, port_id: &'a PortId) -> impl Iterator<Item = &'a Edge> {
        self.edges
            .values()
            .filter(move |e| &e.target.port_id == port_id)
    }

    pub fn control_predecessors(&self, node_id: &NodeId) -> BTreeSet<NodeId> {
        self.incoming_edges(node_id)
            .filter(|e| e.is_control())
            .map(|e| e.source.node_id.clone())
            .collect()
    }

    pub fn data_predecessors(&self, node_id: &NodeId) -> BTreeSet<NodeId> {
        self.incoming_edges(node_id)
            .filter(|e| e.is_data())
            .map(|e| e.source.node_id.clone())
            .collect()
    }

    /// Nodes reachable from `start` along control and data edges, including
    /// `start` itself.
    pub fn reachable_from(&self, start: &NodeId) -> BTreeSet<NodeId> {
        let mut adjacency: HashMap<&NodeId, Vec<&NodeId>> = HashMap::new();
        for edge in self.edges.values() {
            adjacency
                .entry(&edge.source.node_id)
                .or_default()
                .push(&edge.target.node_id);
        }

        let mut seen = BTreeSet::new();
        if !self.nodes.contains_key(start) {
            return seen;
        }
        let mut queue = VecDeque::from([start]);
        while let Some(id) = queue.pop_front() {
            if !seen.insert(id.clone()) {
                continue;
            }
            for next in adjacency.get(id).into_iter().flatten() {
                queue.push_back(*next);
            }
        }
        seen
    }

    // ── Build cache ──────────────────────────────────────────────

    pub fn state(&self) -> &BuildState {
        &self.state
    }

    pub fn is_dirty(&self) -> bool {
        matches!(self.state, BuildState::Dirty)
    }

    /// Cached plan, when built.
    pub fn steps(&self) -> Option<&[Step]> {
        match &self.state {
            BuildState::Built { steps } => Some(steps),
            BuildState::Dirty => None,
        }
    }

    /// Plan the graph and return a copy carrying the cached steps.
    pub fn build(&self) -> GraphResult<Blueprint> {
        let steps = planner::build_steps(self)?;
        let mut built = self.clone();
        built.state = BuildState::Built { steps };
        Ok(built)
    }

    // ── Mutations ────────────────────────────────────────────────

    fn next_version(&self) -> Blueprint {
        let mut next = self.clone();
        next.version += 1;
        next.state = BuildState::Dirty;
        next
    }

    /// Add a node built from a template; port ids are freshly assigned.
    pub fn add_node(&self, template: NodeTemplate) -> (Blueprint, NodeId) {
        let node = template.instantiate();
        let id = node.id.clone();
        let mut next = self.next_version();
        next.nodes.insert(id.clone(), node);
        (next, id)
    }

    /// Remove a node, its ports, and every edge touching them.
    pub fn delete_node(&self, node_id: &NodeId) -> GraphResult<Blueprint> {
        if !self.nodes.contains_key(node_id) {
            return Err(GraphValidationError::UnknownNode {
                node: node_id.clone(),
            });
        }
        let mut next = self.next_version();
        next.nodes.remove(node_id);
        next.edges.retain(|_, e| !e.touches(node_id));
        Ok(next)
    }

    /// Connect an output port to an input port of the same kind.
    pub fn add_edge(&self, source: &PortId, target: &PortId) -> GraphResult<(Blueprint, EdgeId)> {
        let (src_node, src_port, src_dir) =
            self.port(source)
                .ok_or_else(|| GraphValidationError::UnknownPort {
                    port: source.clone(),
                })?;
        let (tgt_node, tgt_port, tgt_dir) =
            self.port(target)
                .ok_or_else(|| GraphValidationError::UnknownPort {
                    port: target.clone(),
                })?;

        check_ports(src_node, src_port, src_dir, tgt_node, tgt_port, tgt_dir)?;

        let edge = Edge::new(
            Endpoint {
                node_id: src_node.id.clone(),
                port_id: source.clone(),
            },
            Endpoint {
                node_id: tgt_node.id.clone(),
                port_id: target.clone(),
            },
            src_port.kind,
        );

        if self.edges.values().any(|e| e.same_route(&edge)) {
            return Err(GraphValidationError::DuplicateEdge {
                from: source.clone(),
                to: target.clone(),
            });
        }
        if edge.is_control() && self.edges_into(target).any(|e| e.is_control()) {
            return Err(GraphValidationError::DuplicateControlEdge {
                port: target.clone(),
            });
        }

        let id = edge.id.clone();
        let mut next = self.next_version();
        next.edges.insert(id.clone(), edge);
        Ok((next, id))
    }

    /// Connect the first execution output of `from` to the first execution
    /// input of `to`.
    pub fn connect_control(&self, from: &NodeId, to: &NodeId) -> GraphResult<(Blueprint, EdgeId)> {
        let source = self.first_port(from, Direction::Output, PortKind::Execution)?;
        let target = self.first_port(to, Direction::Input, PortKind::Execution)?;
        self.add_edge(&source, &target)
    }

    /// Connect a data output of `from` (by accessor) to a data input of `to`
    /// (by accessor).
    pub fn connect_data(
        &self,
        from: &NodeId,
        output: &str,
        to: &NodeId,
        input: &str,
    ) -> GraphResult<(Blueprint, EdgeId)> {
        let source = self
            .require_node(from)?
            .output_by_accessor(output)
            .map(|p| p.id.clone())
            .ok_or_else(|| GraphValidationError::UnknownPort {
                port: PortId::from(format!("{}.{}", from, output)),
            })?;
        let target = self
            .require_node(to)?
            .input_by_accessor(input)
            .map(|p| p.id.clone())
            .ok_or_else(|| GraphValidationError::UnknownPort {
                port: PortId::from(format!("{}.{}", to, input)),
            })?;
        self.add_edge(&source, &target)
    }

    /// Remove edges by id. Fails without removing anything if any id is
    /// unknown.
    pub fn delete_edges(&self, ids: &[EdgeId]) -> GraphResult<Blueprint> {
        if let Some(missing) = ids.iter().find(|id| !self.edges.contains_key(*id)) {
            return Err(GraphValidationError::UnknownEdge {
                edge: missing.clone(),
            });
        }
        let mut next = self.next_version();
        for id in ids {
            next.edges.remove(id);
        }
        Ok(next)
    }

    // ── Validation ───────────────────────────────────────────────

    /// Re-check every structural invariant. Used for blueprints that did not
    /// come through the mutation API (files, storage).
    pub fn validate(&self) -> GraphResult<()> {
        let mut control_targets: BTreeSet<&PortId> = BTreeSet::new();
        let mut routes: BTreeSet<(&PortId, &PortId)> = BTreeSet::new();

        for edge in self.edges.values() {
            let dangling = || GraphValidationError::DanglingEdge {
                edge: edge.id.clone(),
            };
            let src_node = self.nodes.get(&edge.source.node_id).ok_or_else(dangling)?;
            let tgt_node = self.nodes.get(&edge.target.node_id).ok_or_else(dangling)?;
            let (src_port, src_dir) = src_node.port(&edge.source.port_id).ok_or_else(dangling)?;
            let (tgt_port, tgt_dir) = tgt_node.port(&edge.target.port_id).ok_or_else(dangling)?;

            check_ports(src_node, src_port, src_dir, tgt_node, tgt_port, tgt_dir)?;
            if edge.kind != src_port.kind {
                return Err(GraphValidationError::IncompatiblePort {
                    from: src_port.id.clone(),
                    to: tgt_port.id.clone(),
                    reason: format!("edge kind {} does not match ports", edge.kind),
                });
            }

            if !routes.insert((&edge.source.port_id, &edge.target.port_id)) {
                return Err(GraphValidationError::DuplicateEdge {
                    from: edge.source.port_id.clone(),
                    to: edge.target.port_id.clone(),
                });
            }
            if edge.is_control() && !control_targets.insert(&edge.target.port_id) {
                return Err(GraphValidationError::DuplicateControlEdge {
                    port: edge.target.port_id.clone(),
                });
            }
        }
        Ok(())
    }

    fn require_node(&self, id: &NodeId) -> GraphResult<&Node> {
        self.nodes
            .get(id)
            .ok_or_else(|| GraphValidationError::UnknownNode { node: id.clone() })
    }

    fn first_port(&self, node: &NodeId, dir: Direction, kind: PortKind) -> GraphResult<PortId> {
        let node_ref = self.require_node(node)?;
        let port = match dir {
            Direction::Input => node_ref.input_of_kind(kind),
            Direction::Output => node_ref.output_of_kind(kind),
        };
        port.map(|p| p.id.clone())
            .ok_or_else(|| GraphValidationError::UnknownPort {
                port: PortId::from(format!("{}.{}", node, kind)),
            })
    }
}

fn check_ports(
    src_node: &Node,
    src_port: &Port,
    src_dir: Direction,
    tgt_node: &Node,
    tgt_port: &Port,
    tgt_dir: Direction,
) -> GraphResult<()> {
    let incompatible = |reason: &str| GraphValidationError::IncompatiblePort {
        from: src_port.id.clone(),
        to: tgt_port.id.clone(),
        reason: reason.to_string(),
    };

    if src_dir != Direction::Output {
        return Err(incompatible("source is not an output port"));
    }
    if tgt_dir != Direction::Input {
        return Err(incompatible("target is not an input port"));
    }
    if src_port.kind != tgt_port.kind {
        return Err(incompatible(&format!(
            "{} output cannot feed {} input",
            src_port.kind, tgt_port.kind
        )));
    }
    if src_node.id == tgt_node.id {
        return Err(incompatible("a node cannot connect to itself"));
    }
    Ok(())
}

fn serialize_nodes<S: Serializer>(
    nodes: &BTreeMap<NodeId, Node>,
    s: S,
) -> std::result::Result<S::Ok, S::Error> {
    s.collect_seq(nodes.values())
}

fn deserialize_nodes<'de, D: Deserializer<'de>>(
    d: D,
) -> std::result::Result<BTreeMap<NodeId, Node>, D::Error> {
    let list: Vec<Node> = Vec::deserialize(d)?;
    Ok(list.into_iter().map(|n| (n.id.clone(), n)).collect())
}

fn serialize_edges<S: Serializer>(
    edges: &BTreeMap<EdgeId, Edge>,
    s: S,
) -> std::result::Result<S::Ok, S::Error> {
    s.collect_seq(edges.values())
}

fn deserialize_edges<'de, D: Deserializer<'de>>(
    d: D,
) -> std::result::Result<BTreeMap<EdgeId, Edge>, D::Error> {
    let list: Vec<Edge> = Vec::deserialize(d)?;
    Ok(list.into_iter().map(|e| (e.id.clone(), e)).collect())
}
