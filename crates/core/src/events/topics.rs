//! Event topics used throughout the coordination core

/// Standard event topics
pub struct Topics;

impl Topics {
    // Workflow lifecycle events
    pub const WORKFLOW_STARTED: &'static str = "workflow.started";
    pub const WORKFLOW_COMPLETED: &'static str = "workflow.completed";
    pub const WORKFLOW_ABORTED: &'static str = "workflow.aborted";

    // Phase lifecycle events
    pub const PHASE_STARTED: &'static str = "phase.started";
    pub const PHASE_SUCCEEDED: &'static str = "phase.succeeded";
    pub const PHASE_FAILED: &'static str = "phase.failed";

    /// Admission
    pub const TASK_REJECTED: &'static str = "task.rejected";

    // Registry changes
    pub const AGENT_REGISTERED: &'static str = "agent.registered";
    pub const AGENT_DEREGISTERED: &'static str = "agent.deregistered";
    pub const AGENT_AVAILABILITY: &'static str = "agent.availability";

    // Shared memory events
    pub const MEMORY_EVICTED: &'static str = "memory.evicted";
    pub const MEMORY_PROMOTED: &'static str = "memory.promoted";

    /// Monitoring topic for dropped deliveries
    pub const BUS_BACKPRESSURE: &'static str = "bus.backpressure";

    /// Outbound lifecycle topics a front-end renders
    pub fn lifecycle() -> Vec<&'static str> {
        vec![
            Self::WORKFLOW_STARTED,
            Self::PHASE_STARTED,
            Self::PHASE_SUCCEEDED,
            Self::PHASE_FAILED,
            Self::WORKFLOW_COMPLETED,
            Self::WORKFLOW_ABORTED,
        ]
    }

    pub fn is_terminal(topic: &str) -> bool {
        topic == Self::WORKFLOW_COMPLETED || topic == Self::WORKFLOW_ABORTED
    }
}
