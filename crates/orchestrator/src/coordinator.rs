//! Facade that owns and wires every component of the coordination core

use crate::engine::{EngineConfig, WorkflowEngine};
use crate::metrics::{MetricsCollector, MetricsSnapshot};
use crate::provider::CapabilityProvider;
use anyhow::{Context, Result};
use common::{CoordinatorConfig, OperationTimer, RejectionReason, ValidationError};
use memory::{MemoryConfig, MemoryStats, SharedMemoryStore};
use router::{CapabilityRegistry, RouterStatus, TaskRouter};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tandem_core::{
    AgentDescriptor, Availability, BusConfig, BusStats, MessageBus, RoleId, SubscriptionHandle,
    TaskRequest, TopicPattern, WorkflowHandle, WorkflowId, WorkflowInstance,
};
use tracing::{info, warn};

const DRAIN_POLL_INTERVAL: Duration = Duration::from_millis(10);

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CoordinatorStatus {
    pub router: RouterStatus,
    pub active_workflows: usize,
    pub finished_workflows: usize,
    pub bus: BusStats,
    pub memory: MemoryStats,
}

/// Bus, memory, registry, engine, router and metrics under one owner.
///
/// Must be created inside a Tokio runtime: the metrics subscription spawns
/// its delivery worker immediately.
pub struct Coordinator {
    config: CoordinatorConfig,
    bus: Arc<MessageBus>,
    memory: Arc<SharedMemoryStore>,
    registry: Arc<CapabilityRegistry>,
    engine: WorkflowEngine,
    router: TaskRouter,
    metrics: Arc<MetricsCollector>,
    metrics_subscription: SubscriptionHandle,
}

impl Coordinator {
    pub fn new(config: CoordinatorConfig) -> Result<Self> {
        config
            .validate()
            .context("Invalid coordinator configuration")?;

        let bus = Arc::new(MessageBus::new(BusConfig::from(&config)));
        let memory = Arc::new(
            SharedMemoryStore::new(MemoryConfig::from(&config)).with_bus(Arc::clone(&bus)),
        );
        let registry = Arc::new(CapabilityRegistry::new().with_bus(Arc::clone(&bus)));
        let engine = WorkflowEngine::new(
            EngineConfig::from(&config),
            Arc::clone(&registry),
            Arc::clone(&memory),
            Arc::clone(&bus),
        );
        let router = TaskRouter::new(
            Arc::clone(&registry),
            Arc::new(engine.clone()),
            config.max_concurrent_workflows,
            Arc::clone(&bus),
        );

        let metrics = Arc::new(MetricsCollector::with_retention(
            config.max_finished_workflows,
        ));
        let metrics_subscription = bus.subscribe(TopicPattern::All, metrics.clone());

        info!(
            max_concurrent_workflows = config.max_concurrent_workflows,
            short_term_capacity = config.short_term_capacity,
            max_retries = config.max_retries,
            "Coordinator initialized"
        );

        Ok(Self {
            config,
            bus,
            memory,
            registry,
            engine,
            router,
            metrics,
            metrics_subscription,
        })
    }

    /// Defaults overridden by `.env` and `TANDEM_*` variables
    pub fn from_env() -> Result<Self> {
        Self::new(CoordinatorConfig::from_env()?)
    }

    /// Register an agent together with the provider that does its work.
    ///
    /// The provider is in place before the descriptor becomes routable.
    pub fn register_agent(
        &self,
        descriptor: AgentDescriptor,
        provider: Arc<dyn CapabilityProvider>,
    ) -> Result<(), ValidationError> {
        descriptor.validate()?;
        let role = descriptor.role_id.clone();
        self.engine.register_provider(role.clone(), provider);
        if let Err(e) = self.registry.register(descriptor) {
            self.engine.remove_provider(&role);
            return Err(e);
        }
        Ok(())
    }

    /// Workflows already bound to this agent keep running with it
    pub fn deregister_agent(&self, role: &RoleId) -> Option<AgentDescriptor> {
        let removed = self.registry.deregister(role);
        if removed.is_some() {
            self.engine.remove_provider(role);
        }
        removed
    }

    pub fn update_availability(&self, role: &RoleId, availability: Availability) -> bool {
        self.registry.update_availability(role, availability)
    }

    pub fn submit_task(&self, request: TaskRequest) -> Result<WorkflowHandle, RejectionReason> {
        self.router.submit(request)
    }

    pub fn cancel(&self, id: WorkflowId) -> bool {
        self.engine.cancel(id)
    }

    pub fn workflow(&self, id: WorkflowId) -> Option<WorkflowInstance> {
        self.engine.get(id)
    }

    pub fn metrics(&self) -> MetricsSnapshot {
        self.metrics.snapshot()
    }

    pub fn memory(&self) -> &Arc<SharedMemoryStore> {
        &self.memory
    }

    pub fn bus(&self) -> &Arc<MessageBus> {
        &self.bus
    }

    pub fn registry(&self) -> &Arc<CapabilityRegistry> {
        &self.registry
    }

    pub fn engine(&self) -> &WorkflowEngine {
        &self.engine
    }

    pub fn config(&self) -> &CoordinatorConfig {
        &self.config
    }

    pub fn status(&self) -> CoordinatorStatus {
        CoordinatorStatus {
            router: self.router.status(),
            active_workflows: self.engine.active_count(),
            finished_workflows: self.engine.archived_count(),
            bus: self.bus.stats(),
            memory: self.memory.stats(),
        }
    }

    /// Wait until every published event has been handled, or `timeout` passes
    pub async fn flush(&self, timeout: Duration) -> bool {
        self.bus.flush(timeout).await
    }

    /// Cancel running workflows, let them reach a terminal state, then stop
    /// the bus. Waits at most one default phase timeout for the drain.
    pub async fn shutdown(&self) {
        info!(
            active_workflows = self.engine.active_count(),
            "Shutting down coordinator"
        );
        let mut timer = OperationTimer::new("coordinator_shutdown");
        timer.add_field("active_workflows", self.engine.active_count());
        self.engine.cancel_all();

        let grace = self.config.default_phase_timeout();
        let deadline = Instant::now() + grace;
        while self.engine.active_count() > 0 && Instant::now() < deadline {
            tokio::time::sleep(DRAIN_POLL_INTERVAL).await;
        }
        let remaining = self.engine.active_count();
        if remaining > 0 {
            warn!(remaining, "Workflows still running at shutdown");
        }

        let drained = self.bus.flush(grace).await;
        if !drained {
            warn!("Event deliveries still pending at shutdown");
        }
        self.bus.unsubscribe(self.metrics_subscription);
        self.bus.shutdown();

        let outcome = if remaining == 0 && drained {
            Ok(())
        } else {
            Err(format!(
                "{} workflows left running, bus drained: {}",
                remaining, drained
            ))
        };
        timer.finish_with_result(&outcome);
        info!("Coordinator shutdown complete");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provider::provider_fn;
    use serde_json::json;

    #[tokio::test]
    async fn test_invalid_config_is_rejected() {
        let config = CoordinatorConfig {
            max_concurrent_workflows: 0,
            ..CoordinatorConfig::default()
        };
        assert!(Coordinator::new(config).is_err());
    }

    #[tokio::test]
    async fn test_register_and_deregister_agent() {
        let coordinator = Coordinator::new(CoordinatorConfig::default()).unwrap();
        let provider = provider_fn(|_, _| async { Ok(json!(null)) });

        coordinator
            .register_agent(AgentDescriptor::builder(["implement"]), provider.clone())
            .unwrap();
        assert!(coordinator.registry().has_capability("implement"));

        let invalid = AgentDescriptor::new(
            "critic",
            tandem_core::AgentKind::Custom("critic".into()),
            Vec::<String>::new(),
        );
        assert!(coordinator.register_agent(invalid, provider).is_err());
        assert!(coordinator.registry().get(&"critic".into()).is_none());

        assert!(coordinator.deregister_agent(&"builder".into()).is_some());
        assert!(!coordinator.registry().has_capability("implement"));
        assert_eq!(coordinator.status().router.registered_agents, 0);

        coordinator.shutdown().await;
        assert!(coordinator.bus().is_shut_down());
    }
}
