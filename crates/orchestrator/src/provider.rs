//! Capability providers: the opaque agents that do phase work
//!
//! The engine never looks inside a provider. It hands over a [`PhaseInput`]
//! and waits for a JSON result or an error, under the phase deadline.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::sync::Arc;
use tandem_core::{RoleId, TaskId, WorkflowId};

/// Everything an agent gets for one phase attempt
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PhaseInput {
    pub workflow_id: WorkflowId,
    pub task_id: TaskId,
    pub phase_id: String,
    pub capability: String,
    /// 1-based attempt number
    pub attempt: u32,
    pub input: serde_json::Value,
    /// Results of the earlier phases, keyed by phase id
    pub context: serde_json::Map<String, serde_json::Value>,
}

impl PhaseInput {
    /// Result of an earlier phase
    pub fn prior(&self, phase_id: &str) -> Option<&serde_json::Value> {
        self.context.get(phase_id)
    }
}

/// A builder, strategist or custom agent backend
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait CapabilityProvider: Send + Sync {
    async fn invoke(&self, role: &RoleId, input: PhaseInput) -> anyhow::Result<serde_json::Value>;
}

/// Provider backed by an async closure
pub struct FnProvider<F> {
    f: F,
}

impl<F, Fut> FnProvider<F>
where
    F: Fn(RoleId, PhaseInput) -> Fut + Send + Sync,
    Fut: Future<Output = anyhow::Result<serde_json::Value>> + Send,
{
    pub fn new(f: F) -> Self {
        Self { f }
    }
}

#[async_trait]
impl<F, Fut> CapabilityProvider for FnProvider<F>
where
    F: Fn(RoleId, PhaseInput) -> Fut + Send + Sync,
    Fut: Future<Output = anyhow::Result<serde_json::Value>> + Send,
{
    async fn invoke(&self, role: &RoleId, input: PhaseInput) -> anyhow::Result<serde_json::Value> {
        (self.f)(role.clone(), input).await
    }
}

/// Wrap an async closure as a shareable provider
pub fn provider_fn<F, Fut>(f: F) -> Arc<dyn CapabilityProvider>
where
    F: Fn(RoleId, PhaseInput) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<serde_json::Value>> + Send + 'static,
{
    Arc::new(FnProvider::new(f))
}
