//! Workflow instance state machine
//!
//! Workflow: `pending -> running -> {completed, aborted}`.
//! Phase: `pending -> running -> {succeeded, failed}`, or `skipped` when an
//! abort happens before the phase starts. A failed attempt drops the phase
//! back to `running` on retry; the phase index itself never moves backwards.

use super::agent::RoleId;
use super::task::{TaskId, TaskRequest};
use chrono::{DateTime, Utc};
use common::ValidationError;
use serde::{Deserialize, Serialize};
use std::fmt;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct WorkflowId(pub Uuid);

impl WorkflowId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for WorkflowId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for WorkflowId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkflowStatus {
    Pending,
    Running,
    Completed,
    Aborted,
}

impl WorkflowStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, WorkflowStatus::Completed | WorkflowStatus::Aborted)
    }
}

impl fmt::Display for WorkflowStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WorkflowStatus::Pending => write!(f, "pending"),
            WorkflowStatus::Running => write!(f, "running"),
            WorkflowStatus::Completed => write!(f, "completed"),
            WorkflowStatus::Aborted => write!(f, "aborted"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PhaseStatus {
    Pending,
    Running,
    Succeeded,
    Failed,
    Skipped,
}

impl PhaseStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            PhaseStatus::Succeeded | PhaseStatus::Failed | PhaseStatus::Skipped
        )
    }
}

/// Execution record of one phase
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PhaseState {
    pub phase_id: String,
    pub status: PhaseStatus,
    pub assigned_role: Option<RoleId>,
    pub attempts: u32,
    pub last_error: Option<String>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl PhaseState {
    fn pending(phase_id: &str) -> Self {
        Self {
            phase_id: phase_id.to_string(),
            status: PhaseStatus::Pending,
            assigned_role: None,
            attempts: 0,
            last_error: None,
            started_at: None,
            finished_at: None,
        }
    }
}

/// Live state of an accepted task request
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowInstance {
    pub id: WorkflowId,
    pub request: TaskRequest,
    pub status: WorkflowStatus,
    pub current_phase: usize,
    pub phases: Vec<PhaseState>,
    /// Phase id -> phase result
    pub context: serde_json::Map<String, serde_json::Value>,
    pub abort_reason: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
}

fn transition_error(reason: impl Into<String>) -> ValidationError {
    ValidationError::invalid("workflow_state", reason)
}

impl WorkflowInstance {
    pub fn new(id: WorkflowId, request: TaskRequest) -> Self {
        let now = Utc::now();
        let phases = request.phases.iter().map(|p| PhaseState::pending(&p.id)).collect();
        Self {
            id,
            request,
            status: WorkflowStatus::Pending,
            current_phase: 0,
            phases,
            context: serde_json::Map::new(),
            abort_reason: None,
            created_at: now,
            updated_at: now,
            finished_at: None,
        }
    }

    pub fn task_id(&self) -> TaskId {
        self.request.id
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    pub fn start(&mut self) -> Result<(), ValidationError> {
        if self.status != WorkflowStatus::Pending {
            return Err(transition_error(format!(
                "cannot start workflow in state {}",
                self.status
            )));
        }
        self.status = WorkflowStatus::Running;
        self.touch();
        Ok(())
    }

    /// Begin an attempt of phase `index`. Phases run strictly in order.
    ///
    /// `role` is `None` when no agent could be resolved for the attempt.
    pub fn begin_phase(
        &mut self,
        index: usize,
        role: Option<RoleId>,
    ) -> Result<u32, ValidationError> {
        if self.status != WorkflowStatus::Running {
            return Err(transition_error(format!(
                "cannot run a phase while workflow is {}",
                self.status
            )));
        }
        if index != self.current_phase {
            return Err(transition_error(format!(
                "phase {} requested but current phase is {}",
                index, self.current_phase
            )));
        }
        if self.phases[..index].iter().any(|p| !p.status.is_terminal()) {
            return Err(transition_error("predecessor phase has not finished"));
        }

        let now = Utc::now();
        let phase = &mut self.phases[index];
        match phase.status {
            PhaseStatus::Pending | PhaseStatus::Failed => {}
            other => {
                return Err(transition_error(format!(
                    "phase '{}' cannot start from {:?}",
                    phase.phase_id, other
                )))
            }
        }
        phase.status = PhaseStatus::Running;
        if role.is_some() {
            phase.assigned_role = role;
        }
        phase.attempts += 1;
        phase.started_at.get_or_insert(now);
        phase.finished_at = None;
        let attempts = phase.attempts;
        self.touch();
        Ok(attempts)
    }

    /// Record the result of the running phase and advance the index
    pub fn succeed_phase(
        &mut self,
        index: usize,
        result: serde_json::Value,
    ) -> Result<(), ValidationError> {
        self.running_phase(index)?;
        let phase = &mut self.phases[index];
        phase.status = PhaseStatus::Succeeded;
        phase.last_error = None;
        phase.finished_at = Some(Utc::now());
        let phase_id = phase.phase_id.clone();
        self.context.insert(phase_id, result);

        if index + 1 < self.phases.len() {
            self.current_phase = index + 1;
        }
        self.touch();
        Ok(())
    }

    pub fn fail_phase(&mut self, index: usize, reason: impl Into<String>) -> Result<(), ValidationError> {
        self.running_phase(index)?;
        let phase = &mut self.phases[index];
        phase.status = PhaseStatus::Failed;
        phase.last_error = Some(reason.into());
        phase.finished_at = Some(Utc::now());
        self.touch();
        Ok(())
    }

    pub fn complete(&mut self) -> Result<(), ValidationError> {
        if self.status != WorkflowStatus::Running {
            return Err(transition_error(format!(
                "cannot complete workflow in state {}",
                self.status
            )));
        }
        if self.phases.iter().any(|p| p.status != PhaseStatus::Succeeded) {
            return Err(transition_error("not every phase has succeeded"));
        }
        self.status = WorkflowStatus::Completed;
        self.finish();
        Ok(())
    }

    /// Terminate the workflow. Phases that never started become `skipped`.
    pub fn abort(&mut self, reason: impl Into<String>) -> Result<(), ValidationError> {
        if self.status.is_terminal() {
            return Err(transition_error(format!(
                "workflow already {}",
                self.status
            )));
        }
        for phase in self.phases.iter_mut() {
            if phase.status == PhaseStatus::Pending {
                phase.status = PhaseStatus::Skipped;
            }
        }
        self.status = WorkflowStatus::Aborted;
        self.abort_reason = Some(reason.into());
        self.finish();
        Ok(())
    }

    /// Share of phases that reached `succeeded` or `skipped`
    pub fn progress(&self) -> f64 {
        if self.phases.is_empty() {
            return 1.0;
        }
        let done = self
            .phases
            .iter()
            .filter(|p| matches!(p.status, PhaseStatus::Succeeded | PhaseStatus::Skipped))
            .count();
        done as f64 / self.phases.len() as f64
    }

    pub fn total_attempts(&self) -> u32 {
        self.phases.iter().map(|p| p.attempts).sum()
    }

    fn running_phase(&self, index: usize) -> Result<(), ValidationError> {
        match self.phases.get(index) {
            Some(p) if p.status == PhaseStatus::Running => Ok(()),
            Some(p) => Err(transition_error(format!(
                "phase '{}' is not running",
                p.phase_id
            ))),
            None => Err(transition_error(format!("no phase at index {}", index))),
        }
    }

    fn touch(&mut self) {
        self.updated_at = Utc::now();
    }

    fn finish(&mut self) {
        let now = Utc::now();
        self.updated_at = now;
        self.finished_at = Some(now);
    }
}

/// Submitter's handle on an accepted workflow
#[derive(Debug, Clone)]
pub struct WorkflowHandle {
    id: WorkflowId,
    task_id: TaskId,
    state: watch::Receiver<WorkflowInstance>,
    cancel: CancellationToken,
}

impl WorkflowHandle {
    pub fn new(
        state: watch::Receiver<WorkflowInstance>,
        cancel: CancellationToken,
    ) -> Self {
        let (id, task_id) = {
            let current = state.borrow();
            (current.id, current.task_id())
        };
        Self {
            id,
            task_id,
            state,
            cancel,
        }
    }

    pub fn id(&self) -> WorkflowId {
        self.id
    }

    pub fn task_id(&self) -> TaskId {
        self.task_id
    }

    pub fn snapshot(&self) -> WorkflowInstance {
        self.state.borrow().clone()
    }

    pub fn status(&self) -> WorkflowStatus {
        self.state.borrow().status
    }

    /// Cooperative: the in-flight phase finishes, no further phase starts
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn is_cancel_requested(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Wait for a terminal state and return the final instance
    pub async fn wait(&self) -> WorkflowInstance {
        let mut rx = self.state.clone();
        if rx.wait_for(|w| w.status.is_terminal()).await.is_err() {
            tracing::debug!(workflow_id = %self.id, "Workflow state sender dropped before a terminal state");
        }
        let instance = rx.borrow().clone();
        instance
    }
}
