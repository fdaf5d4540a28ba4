//! Core domain models and messaging for Tandem
//!
//! This crate contains the pieces every other crate shares:
//! - AgentDescriptor, TaskRequest, Phase, WorkflowInstance, MemoryRecord, Episode
//! - Event and the topic-pattern MessageBus with bounded per-subscriber queues
//! - WorkflowHandle, the submitter's view of an accepted task

pub mod domain;
pub mod events;

pub use domain::*;
pub use events::*;

/// Re-export common types
pub use anyhow::{Error, Result};
pub use chrono::{DateTime, Utc};
pub use serde::{Deserialize, Serialize};
pub use uuid::Uuid;
