use crate::admission::AdmissionControl;
use crate::launcher::WorkflowLauncher;
use crate::registry::CapabilityRegistry;
use common::RejectionReason;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tandem_core::{Event, MessageBus, TaskRequest, Topics, WorkflowHandle};
use tracing::{info, warn};

/// Producer id for router events
pub const ROUTER_PRODUCER: &str = "task_router";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RouterStatus {
    pub in_flight: usize,
    pub ceiling: usize,
    pub registered_agents: usize,
    pub available_agents: usize,
}

/// Entry point for task requests: validation, capability check, admission, dispatch
pub struct TaskRouter {
    registry: Arc<CapabilityRegistry>,
    launcher: Arc<dyn WorkflowLauncher>,
    admission: AdmissionControl,
    bus: Arc<MessageBus>,
}

impl TaskRouter {
    pub fn new(
        registry: Arc<CapabilityRegistry>,
        launcher: Arc<dyn WorkflowLauncher>,
        max_concurrent_workflows: usize,
        bus: Arc<MessageBus>,
    ) -> Self {
        Self {
            registry,
            launcher,
            admission: AdmissionControl::new(max_concurrent_workflows),
            bus,
        }
    }

    /// Accept a request and start its workflow, or say why not.
    ///
    /// A rejected request never creates a workflow. Rejections are also
    /// published on `task.rejected`.
    pub fn submit(&self, request: TaskRequest) -> Result<WorkflowHandle, RejectionReason> {
        match self.admit(&request) {
            Ok(admitted) => {
                let Admitted { permit, assignment } = admitted;
                info!(
                    task_id = %request.id,
                    phases = request.phases.len(),
                    priority = ?request.priority,
                    assigned = assignment.as_ref().map(|a| a.role_id.as_str()),
                    "Task accepted"
                );
                Ok(self.launcher.launch(request, assignment, permit))
            }
            Err(reason) => {
                warn!(task_id = %request.id, reason = %reason, "Task rejected");
                self.bus.publish(Event::new(
                    Topics::TASK_REJECTED,
                    ROUTER_PRODUCER,
                    serde_json::json!({
                        "task_id": request.id,
                        "reason": reason.kind(),
                        "message": reason.to_string(),
                    }),
                ));
                Err(reason)
            }
        }
    }

    fn admit(&self, request: &TaskRequest) -> Result<Admitted, RejectionReason> {
        request.validate()?;

        if let Some(missing) = request
            .required_capabilities
            .iter()
            .find(|capability| !self.registry.has_capability(capability))
        {
            return Err(RejectionReason::ResourceUnavailable {
                capability: missing.clone(),
            });
        }

        let permit = self.admission.try_admit()?;

        // Single-phase requests go straight to one agent
        let assignment = if request.is_multi_phase() {
            None
        } else {
            request
                .phases
                .first()
                .and_then(|phase| self.registry.select(&phase.capability))
        };

        Ok(Admitted { permit, assignment })
    }

    pub fn status(&self) -> RouterStatus {
        RouterStatus {
            in_flight: self.admission.in_flight(),
            ceiling: self.admission.ceiling(),
            registered_agents: self.registry.len(),
            available_agents: self.registry.available_count(),
        }
    }

    pub fn registry(&self) -> &Arc<CapabilityRegistry> {
        &self.registry
    }
}

struct Admitted {
    permit: tokio::sync::OwnedSemaphorePermit,
    assignment: Option<tandem_core::AgentDescriptor>,
}
