//! Workflow graph model and topological step planner.
//!
//! A workflow is a [`Blueprint`]: typed [`Node`]s whose [`Port`]s are joined
//! by [`Edge`]s. Execution edges order the work, data edges carry upstream
//! outputs into downstream contexts. Every mutation returns a new blueprint,
//! so a running act keeps the snapshot it was planned from.
//!
//! [`build_steps`] turns a blueprint into an ordered list of [`Step`]s.
//!
//! [`Step`]: tessera_core::Step

pub mod blueprint;
pub mod edge;
pub mod node;
pub mod planner;

pub use blueprint::{BuildState, Blueprint};
pub use edge::{Edge, Endpoint};
pub use node::{
    Direction, Node, NodeContent, NodeKind, NodeTemplate, Port, PortSpec, RetrievalPolicy,
    RetrievalSpec,
};
pub use planner::{build_steps, group_levels, plan_from};
