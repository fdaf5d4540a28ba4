//! Workflow orchestration for the Tandem coordination core
//!
//! - [`WorkflowEngine`] runs accepted task requests phase by phase, with
//!   per-phase timeouts, bounded retries and cooperative cancellation
//! - [`CapabilityProvider`] is the seam to the agents doing the actual work
//! - [`MetricsCollector`] derives counters from bus traffic
//! - [`Coordinator`] owns and wires all components
//!
//! # Usage
//! ```no_run
//! use orchestrator::{provider_fn, Coordinator};
//! use common::CoordinatorConfig;
//! use tandem_core::{AgentDescriptor, Phase, TaskRequest};
//! use serde_json::json;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let coordinator = Coordinator::new(CoordinatorConfig::default())?;
//!     coordinator.register_agent(
//!         AgentDescriptor::strategist(["plan"]),
//!         provider_fn(|_, input| async move { Ok(json!({ "plan_for": input.input })) }),
//!     )?;
//!
//!     let handle = coordinator
//!         .submit_task(TaskRequest::new(vec![Phase::new("plan", "plan", json!("cli"))]))?;
//!     let finished = handle.wait().await;
//!     println!("{} -> {}", finished.id, finished.status);
//!
//!     coordinator.shutdown().await;
//!     Ok(())
//! }
//! ```

pub mod backoff;
pub mod coordinator;
pub mod engine;
pub mod metrics;
pub mod provider;

pub use backoff::RetryBackoff;
pub use coordinator::{Coordinator, CoordinatorStatus};
pub use engine::{EngineConfig, WorkflowEngine, ENGINE_PRODUCER};
pub use metrics::{LatencyMetrics, MetricsCollector, MetricsSnapshot, RoleMetrics, WorkflowMetrics};
pub use provider::{provider_fn, CapabilityProvider, FnProvider, PhaseInput};
