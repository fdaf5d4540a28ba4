//! Read-only metrics built from bus traffic
//!
//! The collector subscribes to every topic and never calls back into the
//! components it observes.

use async_trait::async_trait;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, VecDeque};
use tandem_core::{Event, EventHandler, Topics, WorkflowStatus};
use tracing::debug;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LatencyMetrics {
    pub count: u64,
    pub sum_ms: u64,
    pub min_ms: u64,
    pub max_ms: u64,
}

impl LatencyMetrics {
    pub fn record(&mut self, ms: u64) {
        self.min_ms = if self.count == 0 { ms } else { self.min_ms.min(ms) };
        self.max_ms = self.max_ms.max(ms);
        self.count += 1;
        self.sum_ms += ms;
    }

    pub fn avg_ms(&self) -> f64 {
        if self.count == 0 {
            0.0
        } else {
            self.sum_ms as f64 / self.count as f64
        }
    }
}

/// Counters for one agent role
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RoleMetrics {
    pub phases_succeeded: u64,
    pub phases_failed: u64,
    pub timeouts: u64,
    pub phase_latency: LatencyMetrics,
}

impl RoleMetrics {
    pub fn success_rate(&self) -> f64 {
        let total = self.phases_succeeded + self.phases_failed;
        if total == 0 {
            0.0
        } else {
            self.phases_succeeded as f64 / total as f64
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowMetrics {
    pub status: WorkflowStatus,
    pub phases_succeeded: u32,
    pub attempts: u32,
    pub retries: u32,
    /// Submission to terminal state
    pub latency_ms: Option<u64>,
}

impl Default for WorkflowMetrics {
    fn default() -> Self {
        Self {
            status: WorkflowStatus::Running,
            phases_succeeded: 0,
            attempts: 0,
            retries: 0,
            latency_ms: None,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MetricsSnapshot {
    pub events_observed: u64,
    pub workflows_started: u64,
    pub workflows_completed: u64,
    pub workflows_aborted: u64,
    pub phases_succeeded: u64,
    pub phases_failed: u64,
    pub phase_timeouts: u64,
    pub retries: u64,
    /// Keyed by rejection kind, e.g. `overloaded`
    pub rejections: BTreeMap<String, u64>,
    pub backpressure_drops: u64,
    pub memory_evictions: u64,
    pub memory_promotions: u64,
    /// Consecutive phases of one workflow run by different roles, keyed `from->to`
    pub handoffs: BTreeMap<String, u64>,
    pub workflow_latency: LatencyMetrics,
    pub roles: BTreeMap<String, RoleMetrics>,
    pub workflows: BTreeMap<String, WorkflowMetrics>,
}

impl MetricsSnapshot {
    pub fn total_rejections(&self) -> u64 {
        self.rejections.values().sum()
    }

    pub fn role(&self, role: &str) -> Option<&RoleMetrics> {
        self.roles.get(role)
    }

    pub fn workflow(&self, id: impl ToString) -> Option<&WorkflowMetrics> {
        self.workflows.get(&id.to_string())
    }
}

const DEFAULT_RETENTION: usize = 1000;

#[derive(Default)]
struct MetricsState {
    snapshot: MetricsSnapshot,
    /// Role of the last successful phase, per running workflow
    last_role: HashMap<String, String>,
    /// Finished workflow keys, oldest first
    finished: VecDeque<String>,
}

/// Subscribes to `*` and keeps counters per role and per workflow.
///
/// Per-workflow entries of finished workflows are kept up to the retention
/// limit; aggregate counters are never dropped.
pub struct MetricsCollector {
    state: RwLock<MetricsState>,
    retention: usize,
}

impl Default for MetricsCollector {
    fn default() -> Self {
        Self::with_retention(DEFAULT_RETENTION)
    }
}

fn str_field<'a>(event: &'a Event, field: &str) -> Option<&'a str> {
    event.payload.get(field).and_then(|v| v.as_str())
}

fn u64_field(event: &Event, field: &str) -> Option<u64> {
    event.payload.get(field).and_then(|v| v.as_u64())
}

impl MetricsCollector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_retention(max_finished_workflows: usize) -> Self {
        Self {
            state: RwLock::new(MetricsState::default()),
            retention: max_finished_workflows.max(1),
        }
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        self.state.read().snapshot.clone()
    }

    /// Fold one event into the counters
    pub fn record(&self, event: &Event) {
        let mut guard = self.state.write();
        let state = &mut *guard;
        state.snapshot.events_observed += 1;
        let workflow_key = event.correlation_id.map(|id| id.to_string());

        match event.topic.as_str() {
            Topics::WORKFLOW_STARTED => {
                state.snapshot.workflows_started += 1;
                if let Some(key) = workflow_key {
                    state.snapshot.workflows.entry(key).or_default();
                }
            }
            Topics::PHASE_STARTED => {
                if let Some(key) = workflow_key {
                    state.snapshot.workflows.entry(key).or_default().attempts += 1;
                }
            }
            Topics::PHASE_SUCCEEDED => {
                state.snapshot.phases_succeeded += 1;
                let role = str_field(event, "role").map(str::to_string);
                if let Some(role) = &role {
                    let metrics = state.snapshot.roles.entry(role.clone()).or_default();
                    metrics.phases_succeeded += 1;
                    if let Some(ms) = u64_field(event, "latency_ms") {
                        metrics.phase_latency.record(ms);
                    }
                }
                if let Some(key) = workflow_key {
                    state.snapshot.workflows.entry(key.clone()).or_default().phases_succeeded += 1;
                    if let Some(role) = role {
                        if let Some(previous) = state.last_role.insert(key, role.clone()) {
                            if previous != role {
                                *state
                                    .snapshot
                                    .handoffs
                                    .entry(format!("{}->{}", previous, role))
                                    .or_default() += 1;
                            }
                        }
                    }
                }
            }
            Topics::PHASE_FAILED => {
                state.snapshot.phases_failed += 1;
                let timed_out = event
                    .payload
                    .get("timeout")
                    .and_then(|v| v.as_bool())
                    .unwrap_or(false);
                let will_retry = event
                    .payload
                    .get("will_retry")
                    .and_then(|v| v.as_bool())
                    .unwrap_or(false);
                if timed_out {
                    state.snapshot.phase_timeouts += 1;
                }
                if will_retry {
                    state.snapshot.retries += 1;
                }
                if let Some(role) = str_field(event, "role") {
                    let metrics = state.snapshot.roles.entry(role.to_string()).or_default();
                    metrics.phases_failed += 1;
                    if timed_out {
                        metrics.timeouts += 1;
                    }
                    if let Some(ms) = u64_field(event, "latency_ms") {
                        metrics.phase_latency.record(ms);
                    }
                }
                if let (Some(key), true) = (workflow_key, will_retry) {
                    state.snapshot.workflows.entry(key).or_default().retries += 1;
                }
            }
            Topics::WORKFLOW_COMPLETED | Topics::WORKFLOW_ABORTED => {
                let status = if event.topic == Topics::WORKFLOW_COMPLETED {
                    state.snapshot.workflows_completed += 1;
                    WorkflowStatus::Completed
                } else {
                    state.snapshot.workflows_aborted += 1;
                    WorkflowStatus::Aborted
                };
                let latency = u64_field(event, "latency_ms");
                if let Some(ms) = latency {
                    state.snapshot.workflow_latency.record(ms);
                }
                if let Some(key) = workflow_key {
                    state.last_role.remove(&key);
                    let metrics = state.snapshot.workflows.entry(key.clone()).or_default();
                    metrics.status = status;
                    metrics.latency_ms = latency;
                    state.finished.push_back(key);
                    while state.finished.len() > self.retention {
                        if let Some(oldest) = state.finished.pop_front() {
                            state.snapshot.workflows.remove(&oldest);
                        }
                    }
                }
            }
            Topics::TASK_REJECTED => {
                let reason = str_field(event, "reason").unwrap_or("unknown").to_string();
                *state.snapshot.rejections.entry(reason).or_default() += 1;
            }
            Topics::BUS_BACKPRESSURE => state.snapshot.backpressure_drops += 1,
            Topics::MEMORY_EVICTED => state.snapshot.memory_evictions += 1,
            Topics::MEMORY_PROMOTED => state.snapshot.memory_promotions += 1,
            other => debug!(topic = other, "Event not tracked by metrics"),
        }
    }
}

#[async_trait]
impl EventHandler for MetricsCollector {
    async fn handle(&self, event: Event) -> anyhow::Result<()> {
        self.record(&event);
        Ok(())
    }

    fn name(&self) -> String {
        "metrics_collector".to_string()
    }
}
