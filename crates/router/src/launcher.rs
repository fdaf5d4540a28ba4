use tandem_core::{AgentDescriptor, TaskRequest, WorkflowHandle};
use tokio::sync::OwnedSemaphorePermit;

/// Seam between admission and execution.
///
/// The router decides *whether* a request runs; a launcher decides *how*.
/// `assignment` is set for single-phase requests, which are dispatched to the
/// agent the router already picked. The launcher must keep `permit` alive
/// until the workflow reaches a terminal state.
pub trait WorkflowLauncher: Send + Sync {
    fn launch(
        &self,
        request: TaskRequest,
        assignment: Option<AgentDescriptor>,
        permit: OwnedSemaphorePermit,
    ) -> WorkflowHandle;
}
