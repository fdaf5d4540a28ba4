//! Workflow engine: sequences the phases of accepted task requests
//!
//! Each workflow runs in its own Tokio task, so a slow agent invocation only
//! holds up the workflow that made it. Per workflow:
//!
//! 1. phases run strictly in declared order
//! 2. a failed or timed-out attempt is retried with the same agent, with
//!    bounded exponential backoff, up to the configured attempt count
//! 3. exhausted attempts abort the workflow; later phases are skipped
//! 4. every workflow publishes exactly one terminal event

use crate::backoff::RetryBackoff;
use crate::provider::{CapabilityProvider, PhaseInput};
use chrono::Utc;
use common::{CancelPoint, CoordinationError, CoordinationResult, CoordinatorConfig, PhaseError};
use dashmap::DashMap;
use memory::SharedMemoryStore;
use parking_lot::Mutex;
use router::{CapabilityRegistry, WorkflowLauncher};
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tandem_core::{
    AgentDescriptor, Event, MessageBus, Phase, RoleId, TaskRequest, Topics, WorkflowHandle,
    WorkflowId, WorkflowInstance,
};
use tokio::sync::{watch, OwnedSemaphorePermit};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Producer id for workflow lifecycle events
pub const ENGINE_PRODUCER: &str = "workflow_engine";

#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Deadline for phases that don't declare their own
    pub default_phase_timeout: Duration,
    /// Total attempts per phase, the first one included
    pub max_attempts: u32,
    pub backoff: RetryBackoff,
    /// Finished workflows kept for `get`; the oldest are dropped first
    pub max_archived: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self::from(&CoordinatorConfig::default())
    }
}

impl From<&CoordinatorConfig> for EngineConfig {
    fn from(config: &CoordinatorConfig) -> Self {
        Self {
            default_phase_timeout: config.default_phase_timeout(),
            max_attempts: config.max_retries.max(1),
            backoff: RetryBackoff::new(&config.backoff),
            max_archived: config.max_finished_workflows.max(1),
        }
    }
}

struct ActiveWorkflow {
    state: watch::Receiver<WorkflowInstance>,
    cancel: CancellationToken,
}

struct EngineInner {
    config: EngineConfig,
    registry: Arc<CapabilityRegistry>,
    providers: DashMap<RoleId, Arc<dyn CapabilityProvider>>,
    memory: Arc<SharedMemoryStore>,
    bus: Arc<MessageBus>,
    active: DashMap<WorkflowId, ActiveWorkflow>,
    archive: DashMap<WorkflowId, WorkflowInstance>,
    /// Archive insertion order, oldest first
    archive_order: Mutex<VecDeque<WorkflowId>>,
}

impl EngineInner {
    fn retain_finished(&self, instance: WorkflowInstance) {
        let id = instance.id;
        let mut order = self.archive_order.lock();
        if self.archive.insert(id, instance).is_none() {
            order.push_back(id);
        }
        while order.len() > self.config.max_archived {
            if let Some(oldest) = order.pop_front() {
                self.archive.remove(&oldest);
                debug!(workflow_id = %oldest, "Archived workflow dropped");
            }
        }
    }
}

/// Runs accepted task requests as workflows. Cheap to clone.
#[derive(Clone)]
pub struct WorkflowEngine {
    inner: Arc<EngineInner>,
}

impl WorkflowEngine {
    pub fn new(
        config: EngineConfig,
        registry: Arc<CapabilityRegistry>,
        memory: Arc<SharedMemoryStore>,
        bus: Arc<MessageBus>,
    ) -> Self {
        Self {
            inner: Arc::new(EngineInner {
                config,
                registry,
                providers: DashMap::new(),
                memory,
                bus,
                active: DashMap::new(),
                archive: DashMap::new(),
                archive_order: Mutex::new(VecDeque::new()),
            }),
        }
    }

    /// Route invocations for `role` to `provider`, replacing any previous one
    pub fn register_provider(&self, role: RoleId, provider: Arc<dyn CapabilityProvider>) {
        debug!(role = %role, "Capability provider registered");
        self.inner.providers.insert(role, provider);
    }

    pub fn remove_provider(&self, role: &RoleId) -> bool {
        self.inner.providers.remove(role).is_some()
    }

    /// Ask a workflow to stop. The in-flight phase may still finish.
    pub fn cancel(&self, id: WorkflowId) -> bool {
        match self.inner.active.get(&id) {
            Some(active) => {
                info!(workflow_id = %id, "Workflow cancellation requested");
                active.cancel.cancel();
                true
            }
            None => false,
        }
    }

    pub fn cancel_all(&self) {
        for active in self.inner.active.iter() {
            active.cancel.cancel();
        }
    }

    /// Current state of an active workflow, or the archived final state
    pub fn get(&self, id: WorkflowId) -> Option<WorkflowInstance> {
        if let Some(active) = self.inner.active.get(&id) {
            return Some(active.state.borrow().clone());
        }
        self.inner.archive.get(&id).map(|w| w.clone())
    }

    pub fn active_count(&self) -> usize {
        self.inner.active.len()
    }

    pub fn archived_count(&self) -> usize {
        self.inner.archive.len()
    }

    pub fn config(&self) -> &EngineConfig {
        &self.inner.config
    }
}

impl WorkflowLauncher for WorkflowEngine {
    fn launch(
        &self,
        request: TaskRequest,
        assignment: Option<AgentDescriptor>,
        permit: OwnedSemaphorePermit,
    ) -> WorkflowHandle {
        let id = WorkflowId::new();
        let instance = WorkflowInstance::new(id, request);
        let (state_tx, state_rx) = watch::channel(instance.clone());
        let cancel = CancellationToken::new();

        self.inner.active.insert(
            id,
            ActiveWorkflow {
                state: state_rx.clone(),
                cancel: cancel.clone(),
            },
        );

        let run = WorkflowRun {
            inner: Arc::clone(&self.inner),
            instance,
            state_tx,
            cancel: cancel.clone(),
            pinned: assignment,
            permit: Some(permit),
            last_role: None,
        };
        tokio::spawn(run.run());

        WorkflowHandle::new(state_rx, cancel)
    }
}

/// State owned by one workflow's task
struct WorkflowRun {
    inner: Arc<EngineInner>,
    instance: WorkflowInstance,
    state_tx: watch::Sender<WorkflowInstance>,
    cancel: CancellationToken,
    /// Agent the router chose for a single-phase request
    pinned: Option<AgentDescriptor>,
    permit: Option<OwnedSemaphorePermit>,
    last_role: Option<RoleId>,
}

impl WorkflowRun {
    async fn run(mut self) {
        let id = self.instance.id;
        if let Err(e) = self.instance.start() {
            error!(workflow_id = %id, error = %e, "Workflow could not start");
            self.abort(e.into());
            return;
        }
        info!(
            workflow_id = %id,
            task_id = %self.instance.task_id(),
            phases = self.instance.phases.len(),
            "Workflow started"
        );
        self.publish_state();
        let phase_ids: Vec<&str> = self
            .instance
            .request
            .phases
            .iter()
            .map(|p| p.id.as_str())
            .collect();
        self.emit(
            Topics::WORKFLOW_STARTED,
            serde_json::json!({
                "task_id": self.instance.task_id(),
                "phases": phase_ids,
                "priority": self.instance.request.priority,
            }),
        );

        for index in 0..self.instance.request.phases.len() {
            let phase = self.instance.request.phases[index].clone();
            if self.cancel.is_cancelled() {
                self.abort(PhaseError::cancelled(&phase.id, CancelPoint::Before).into());
                return;
            }
            if let Err(e) = self.run_phase(index, &phase).await {
                self.abort(e);
                return;
            }
        }

        // Cancelled while the last phase was in flight
        if self.cancel.is_cancelled() {
            let last = self
                .instance
                .request
                .phases
                .last()
                .map(|p| p.id.clone())
                .unwrap_or_default();
            self.abort(PhaseError::cancelled(last, CancelPoint::After).into());
            return;
        }
        self.complete();
    }

    /// Drive one phase to a terminal state. `Err` is why the workflow aborts.
    async fn run_phase(&mut self, index: usize, phase: &Phase) -> CoordinationResult<()> {
        let id = self.instance.id;
        let max_attempts = self.inner.config.max_attempts;
        let timeout = phase
            .timeout()
            .unwrap_or(self.inner.config.default_phase_timeout);
        // Resolved once, then kept for every retry of this phase
        let mut agent: Option<AgentDescriptor> = None;

        let mut retry = 0;
        loop {
            if agent.is_none() {
                agent = self.resolve_agent(index, phase);
            }
            let role = agent.as_ref().map(|a| a.role_id.clone());

            let attempt = self.instance.begin_phase(index, role.clone())?;
            self.publish_state();
            debug!(workflow_id = %id, phase_id = %phase.id, attempt, role = ?role, "Phase attempt started");
            self.emit(
                Topics::PHASE_STARTED,
                serde_json::json!({
                    "phase_id": phase.id,
                    "index": index,
                    "capability": phase.capability,
                    "role": role,
                    "attempt": attempt,
                }),
            );

            let started = Instant::now();
            let outcome = match &role {
                Some(role) => self.invoke(role, phase, attempt, timeout).await,
                None => Err(PhaseError::NoAgent {
                    capability: phase.capability.clone(),
                }),
            };
            let latency_ms = started.elapsed().as_millis() as u64;

            match outcome {
                Ok(result) => {
                    self.instance.succeed_phase(index, result.clone())?;
                    self.publish_state();
                    self.record_episode(phase, role.as_ref(), &result);
                    info!(
                        workflow_id = %id,
                        phase_id = %phase.id,
                        role = ?role,
                        attempt,
                        latency_ms,
                        "Phase succeeded"
                    );
                    self.emit(
                        Topics::PHASE_SUCCEEDED,
                        serde_json::json!({
                            "phase_id": phase.id,
                            "index": index,
                            "role": role,
                            "previous_role": self.last_role,
                            "attempt": attempt,
                            "latency_ms": latency_ms,
                            "result": result,
                        }),
                    );
                    self.last_role = role;
                    return Ok(());
                }
                Err(failure) => {
                    let reason = failure.to_string();
                    let timed_out = failure.is_timeout();
                    self.instance.fail_phase(index, reason.clone())?;
                    self.publish_state();

                    let error = CoordinationError::from(failure);
                    let will_retry = attempt < max_attempts
                        && error.is_retryable()
                        && !self.cancel.is_cancelled();
                    warn!(
                        workflow_id = %id,
                        phase_id = %phase.id,
                        role = ?role,
                        attempt,
                        max_attempts,
                        will_retry,
                        error = %reason,
                        "Phase attempt failed"
                    );
                    self.emit(
                        Topics::PHASE_FAILED,
                        serde_json::json!({
                            "phase_id": phase.id,
                            "index": index,
                            "role": role,
                            "attempt": attempt,
                            "latency_ms": latency_ms,
                            "error": reason,
                            "timeout": timed_out,
                            "will_retry": will_retry,
                        }),
                    );

                    if !will_retry {
                        if self.cancel.is_cancelled() && attempt < max_attempts {
                            return Err(PhaseError::cancelled(&phase.id, CancelPoint::During).into());
                        }
                        return Err(error);
                    }

                    let delay = self.inner.config.backoff.delay(retry);
                    retry += 1;
                    debug!(workflow_id = %id, phase_id = %phase.id, delay_ms = delay.as_millis() as u64, "Backing off before retry");
                    tokio::select! {
                        _ = tokio::time::sleep(delay) => {}
                        _ = self.cancel.cancelled() => {
                            return Err(PhaseError::cancelled(&phase.id, CancelPoint::During).into());
                        }
                    }
                }
            }
        }
    }

    /// The pinned agent for a single-phase request, otherwise the registry's pick
    fn resolve_agent(&self, index: usize, phase: &Phase) -> Option<AgentDescriptor> {
        if index == 0 && !self.instance.request.is_multi_phase() {
            if let Some(pinned) = &self.pinned {
                if pinned.has_capability(&phase.capability) {
                    return Some(pinned.clone());
                }
            }
        }
        self.inner.registry.select(&phase.capability)
    }

    async fn invoke(
        &self,
        role: &RoleId,
        phase: &Phase,
        attempt: u32,
        timeout: Duration,
    ) -> Result<serde_json::Value, PhaseError> {
        let provider = self
            .inner
            .providers
            .get(role)
            .map(|p| Arc::clone(p.value()))
            .ok_or_else(|| {
                PhaseError::failure(&phase.id, format!("no capability provider for role '{}'", role))
            })?;

        let input = PhaseInput {
            workflow_id: self.instance.id,
            task_id: self.instance.task_id(),
            phase_id: phase.id.clone(),
            capability: phase.capability.clone(),
            attempt,
            input: phase.input.clone(),
            context: self.instance.context.clone(),
        };

        match tokio::time::timeout(timeout, provider.invoke(role, input)).await {
            Ok(Ok(result)) => Ok(result),
            Ok(Err(e)) => Err(PhaseError::failure(&phase.id, format!("{:#}", e))),
            Err(_) => Err(PhaseError::Timeout {
                phase_id: phase.id.clone(),
                timeout_ms: timeout.as_millis() as u64,
            }),
        }
    }

    /// Mirror the phase result into the episodic tier under the workflow id
    fn record_episode(&self, phase: &Phase, role: Option<&RoleId>, result: &serde_json::Value) {
        let session = self.instance.id.to_string();
        let entry = serde_json::json!({
            "phase_id": phase.id,
            "capability": phase.capability,
            "role": role,
            "result": result,
        });
        if let Err(e) = self.inner.memory.append(&session, entry) {
            warn!(workflow_id = %self.instance.id, error = %e, "Could not record phase episode");
        }
    }

    fn complete(mut self) {
        if let Err(e) = self.instance.complete() {
            error!(workflow_id = %self.instance.id, error = %e, "Workflow could not complete");
            self.abort(e.into());
            return;
        }
        info!(
            workflow_id = %self.instance.id,
            attempts = self.instance.total_attempts(),
            "Workflow completed"
        );
        let payload = self.terminal_payload();
        self.finish(Topics::WORKFLOW_COMPLETED, payload);
    }

    fn abort(mut self, error: CoordinationError) {
        let reason = error.reason();
        if let Err(e) = self.instance.abort(reason.clone()) {
            error!(workflow_id = %self.instance.id, error = %e, "Workflow abort rejected");
        }
        error!(
            workflow_id = %self.instance.id,
            reason = %reason,
            recovery = ?error.recovery_strategy(),
            "Workflow aborted"
        );
        let mut payload = self.terminal_payload();
        payload["reason"] = serde_json::json!(reason);
        payload["retryable"] = serde_json::json!(error.is_retryable());
        payload["failed_phase"] = serde_json::json!(self
            .instance
            .phases
            .iter()
            .find(|p| p.status == tandem_core::PhaseStatus::Failed)
            .map(|p| p.phase_id.clone()));
        self.finish(Topics::WORKFLOW_ABORTED, payload);
    }

    fn terminal_payload(&self) -> serde_json::Value {
        let finished = self.instance.finished_at.unwrap_or_else(Utc::now);
        let latency_ms = (finished - self.instance.request.submitted_at)
            .num_milliseconds()
            .max(0);
        serde_json::json!({
            "task_id": self.instance.task_id(),
            "status": self.instance.status,
            "context": self.instance.context,
            "phases": self.instance.phases,
            "attempts": self.instance.total_attempts(),
            "latency_ms": latency_ms,
        })
    }

    /// Archive, announce, release the admission slot, then wake waiters
    fn finish(mut self, topic: &str, payload: serde_json::Value) {
        let id = self.instance.id;
        self.inner.retain_finished(self.instance.clone());
        self.inner.active.remove(&id);
        self.emit(topic, payload);
        drop(self.permit.take());
        self.publish_state();
    }

    fn publish_state(&self) {
        self.state_tx.send_replace(self.instance.clone());
    }

    fn emit(&self, topic: &str, payload: serde_json::Value) {
        self.inner
            .bus
            .publish(Event::new(topic, ENGINE_PRODUCER, payload).correlated(self.instance.id));
    }
}
