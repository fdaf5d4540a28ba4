use chrono::{DateTime, Utc};
use common::ValidationError;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashSet};
use std::fmt;
use std::time::Duration;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TaskId(pub Uuid);

impl TaskId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for TaskId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskPriority {
    Low,
    #[default]
    Normal,
    High,
    Critical,
}

/// One atomic step of a task, served by a single capability
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Phase {
    pub id: String,
    pub capability: String,
    pub input: serde_json::Value,
    /// Phase deadline; the engine default applies when absent
    pub timeout_ms: Option<u64>,
}

impl Phase {
    pub fn new(
        id: impl Into<String>,
        capability: impl Into<String>,
        input: serde_json::Value,
    ) -> Self {
        Self {
            id: id.into(),
            capability: capability.into(),
            input,
            timeout_ms: None,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout_ms = Some(timeout.as_millis() as u64);
        self
    }

    pub fn timeout(&self) -> Option<Duration> {
        self.timeout_ms.map(Duration::from_millis)
    }
}

/// A unit of work submitted by a front-end. Immutable once accepted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskRequest {
    pub id: TaskId,
    pub required_capabilities: BTreeSet<String>,
    pub phases: Vec<Phase>,
    pub priority: TaskPriority,
    pub submitted_at: DateTime<Utc>,
}

impl TaskRequest {
    /// Required capabilities are derived from the phases
    pub fn new(phases: Vec<Phase>) -> Self {
        let required_capabilities = phases.iter().map(|p| p.capability.clone()).collect();
        Self {
            id: TaskId::new(),
            required_capabilities,
            phases,
            priority: TaskPriority::Normal,
            submitted_at: Utc::now(),
        }
    }

    /// Single-phase convenience constructor
    pub fn single(capability: impl Into<String>, input: serde_json::Value) -> Self {
        let capability = capability.into();
        Self::new(vec![Phase::new(capability.clone(), capability, input)])
    }

    pub fn with_priority(mut self, priority: TaskPriority) -> Self {
        self.priority = priority;
        self
    }

    /// Add a capability the task needs beyond its phases
    pub fn require(mut self, capability: impl Into<String>) -> Self {
        self.required_capabilities.insert(capability.into());
        self
    }

    pub fn is_multi_phase(&self) -> bool {
        self.phases.len() > 1
    }

    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.phases.is_empty() {
            return Err(ValidationError::MissingField("phases".into()));
        }

        let mut seen = HashSet::new();
        for phase in &self.phases {
            if phase.id.trim().is_empty() {
                return Err(ValidationError::MissingField("phase.id".into()));
            }
            if !seen.insert(phase.id.as_str()) {
                return Err(ValidationError::invalid(
                    "phase.id",
                    format!("duplicate phase id '{}'", phase.id),
                ));
            }
            if phase.capability.trim().is_empty() {
                return Err(ValidationError::invalid(
                    "phase.capability",
                    format!("phase '{}' has no capability", phase.id),
                ));
            }
            if !self.required_capabilities.contains(&phase.capability) {
                return Err(ValidationError::invalid(
                    "required_capabilities",
                    format!("phase '{}' capability '{}' is not listed", phase.id, phase.capability),
                ));
            }
            if phase.timeout_ms == Some(0) {
                return Err(ValidationError::OutOfRange {
                    field: format!("phases.{}.timeout_ms", phase.id),
                    value: "0".into(),
                    min: "1".into(),
                    max: u64::MAX.to_string(),
                });
            }
        }

        Ok(())
    }
}
