//! Act execution for Tessera blueprints.
//!
//! [`ActOrchestrator`] turns a planned blueprint into generations, running
//! them through an [`ExecutionCapability`] as their dependencies settle.

pub mod context;
pub mod dry_run;
pub mod generation;
pub mod orchestrator;
pub mod retry;
pub mod run_log;
pub mod traits;

pub use context::{ContextResolver, ResolveError};
pub use dry_run::DryRunCapability;
pub use orchestrator::{ActOrchestrator, ActRequest, OrchestratorBuilder};
pub use run_log::RunLogger;
pub use traits::{ExecutionCapability, InvocationRequest, QueryClient, QueryRequest, UsageReporter};
