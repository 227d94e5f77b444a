use futures::future::BoxFuture;
use tokio_util::sync::CancellationToken;

use tessera_core::error::{CapabilityError, Result};
use tessera_core::stream::OutputSink;
use tessera_core::types::{GenerationId, InputContext, QueryResult, WorkspaceId};
use tessera_graph::Node;

/// Everything a capability needs to perform one attempt of a generation.
#[derive(Debug, Clone)]
pub struct InvocationRequest {
    pub generation_id: GenerationId,
    pub node: Node,
    pub context: InputContext,
    /// 1-based attempt number.
    pub attempt: u32,
}

/// Performs the work a node describes (model call, action, query).
///
/// Partial output goes to the sink as it is produced. Implementations should
/// stop promptly once `cancel` fires; the caller stops waiting either way.
pub trait ExecutionCapability: Send + Sync + 'static {
    fn invoke(
        &self,
        request: InvocationRequest,
        output: OutputSink,
        cancel: CancellationToken,
    ) -> BoxFuture<'_, std::result::Result<serde_json::Value, CapabilityError>>;
}

#[derive(Debug, Clone, PartialEq)]
pub struct QueryRequest {
    pub workspace_id: WorkspaceId,
    pub query: String,
    pub max_results: usize,
    pub similarity_threshold: f32,
}

/// Vector-store lookup used to enrich node context.
pub trait QueryClient: Send + Sync + 'static {
    fn query(&self, request: QueryRequest) -> BoxFuture<'_, Result<Vec<QueryResult>>>;
}

/// Billing sink for agent time.
pub trait UsageReporter: Send + Sync + 'static {
    fn report_agent_time(&self, owner_id: &str, duration_ms: u64) -> BoxFuture<'_, Result<()>>;
}
