//! Event infrastructure for the coordination core
//!
//! Topics: workflow.*, phase.*, task.rejected, agent.*, memory.*, bus.backpressure

use crate::domain::WorkflowId;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

pub mod bus;
pub mod topics;

pub use bus::*;
pub use topics::*;

/// Event represents anything published on the bus
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    pub id: Uuid,
    pub topic: String,
    /// Agent role or component that produced the event
    pub producer: String,
    pub payload: serde_json::Value,
    pub timestamp: DateTime<Utc>,
    /// Workflow this event belongs to, if any
    pub correlation_id: Option<WorkflowId>,
}

impl Event {
    pub fn new(
        topic: impl Into<String>,
        producer: impl Into<String>,
        payload: serde_json::Value,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            topic: topic.into(),
            producer: producer.into(),
            payload,
            timestamp: Utc::now(),
            correlation_id: None,
        }
    }

    pub fn correlated(mut self, workflow_id: WorkflowId) -> Self {
        self.correlation_id = Some(workflow_id);
        self
    }
}

/// Event handler trait
#[async_trait]
pub trait EventHandler: Send + Sync {
    /// Handle event. Returning an error asks the bus to deliver it again.
    async fn handle(&self, event: Event) -> anyhow::Result<()>;

    /// Get handler name
    fn name(&self) -> String;
}

/// Which topics a subscription receives
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum TopicPattern {
    /// `*`
    All,
    /// `workflow.*` matches every topic starting with `workflow.`
    Prefix(String),
    Exact(String),
}

impl TopicPattern {
    pub fn parse(pattern: &str) -> Self {
        if pattern == "*" {
            TopicPattern::All
        } else if let Some(prefix) = pattern.strip_suffix('*') {
            TopicPattern::Prefix(prefix.to_string())
        } else {
            TopicPattern::Exact(pattern.to_string())
        }
    }

    pub fn matches(&self, topic: &str) -> bool {
        match self {
            TopicPattern::All => true,
            TopicPattern::Prefix(prefix) => topic.starts_with(prefix.as_str()),
            TopicPattern::Exact(exact) => topic == exact,
        }
    }
}

impl From<&str> for TopicPattern {
    fn from(pattern: &str) -> Self {
        Self::parse(pattern)
    }
}

impl fmt::Display for TopicPattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TopicPattern::All => write!(f, "*"),
            TopicPattern::Prefix(prefix) => write!(f, "{}*", prefix),
            TopicPattern::Exact(exact) => write!(f, "{}", exact),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SubscriptionHandle(pub u64);

impl fmt::Display for SubscriptionHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "sub-{}", self.0)
    }
}

/// Bus configuration
#[derive(Debug, Clone)]
pub struct BusConfig {
    /// Bounded queue length per subscriber; the oldest event is dropped on overflow
    pub queue_size: usize,
    /// Handler invocations per event before the delivery is counted as failed
    pub max_delivery_attempts: u32,
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            queue_size: 1024,
            max_delivery_attempts: 3,
        }
    }
}

impl From<&common::CoordinatorConfig> for BusConfig {
    fn from(config: &common::CoordinatorConfig) -> Self {
        Self {
            queue_size: config.bus_queue_size,
            max_delivery_attempts: config.bus_max_delivery_attempts,
        }
    }
}

/// Event bus statistics
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BusStats {
    pub published: u64,
    /// Published with no matching subscriber
    pub unrouted: u64,
    pub delivered: u64,
    /// Dropped from a full subscriber queue
    pub dropped: u64,
    pub failed_deliveries: u64,
    pub active_subscriptions: usize,
}
