use serde::{Deserialize, Serialize};

use tessera_core::types::{EdgeId, NodeId, PortId, PortKind};

/// One end of an edge: a port and the node that owns it.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Endpoint {
    pub node_id: NodeId,
    pub port_id: PortId,
}

/// A directed connection from an output port to an input port.
///
/// Endpoints are referenced by id, never by pointer, so blueprints stay
/// plain values.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Edge {
    pub id: EdgeId,
    /// Output port.
    pub source: Endpoint,
    /// Input port.
    pub target: Endpoint,
    /// Matches the kind of both ports.
    pub kind: PortKind,
}

impl Edge {
    pub fn new(source: Endpoint, target: Endpoint, kind: PortKind) -> Self {
        Self {
            id: EdgeId::new(),
            source,
            target,
            kind,
        }
    }

    pub fn is_control(&self) -> bool {
        self.kind == PortKind::Execution
    }

    pub fn is_data(&self) -> bool {
        self.kind == PortKind::Data
    }

    /// Whether this edge touches any port of `node_id`.
    pub fn touches(&self, node_id: &NodeId) -> bool {
        &self.source.node_id == node_id || &self.target.node_id == node_id
    }

    /// Same endpoints as `other`.
    pub fn same_route(&self, other: &Edge) -> bool {
        self.source.port_id == other.source.port_id && self.target.port_id == other.target.port_id
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn endpoint(node: &str, port: &str) -> Endpoint {
        Endpoint {
            node_id: NodeId::from(node),
            port_id: PortId::from(port),
        }
    }

    #[test]
    fn test_edge_kind_helpers() {
        let e = Edge::new(endpoint("a", "a-out"), endpoint("b", "b-in"), PortKind::Execution);
        assert!(e.is_control());
        assert!(!e.is_data());
        assert!(e.touches(&NodeId::from("a")));
        assert!(e.touches(&NodeId::from("b")));
        assert!(!e.touches(&NodeId::from("c")));
    }

    #[test]
    fn test_same_route_ignores_id() {
        let a = Edge::new(endpoint("a", "p1"), endpoint("b", "p2"), PortKind::Data);
        let b = Edge::new(endpoint("a", "p1"), endpoint("b", "p2"), PortKind::Data);
        assert_ne!(a.id, b.id);
        assert!(a.same_route(&b));
    }

    #[test]
    fn test_serialization_roundtrip() {
        let edge = Edge::new(endpoint("a", "p1"), endpoint("b", "p2"), PortKind::Data);
        let json = serde_json::to_string(&edge).unwrap();
        let parsed: Edge = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, edge);
        assert!(json.contains("\"kind\":\"data\""));
    }
}
