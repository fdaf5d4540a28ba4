//! Role-based task routing
//!
//! Agents advertise capability tags in the [`CapabilityRegistry`]. The
//! [`TaskRouter`] checks every incoming request against the registry and a
//! fixed in-flight ceiling, then hands accepted requests to a
//! [`WorkflowLauncher`].

mod admission;
mod launcher;
mod registry;
mod router;

pub use admission::AdmissionControl;
pub use launcher::WorkflowLauncher;
pub use registry::{CapabilityRegistry, REGISTRY_PRODUCER};
pub use router::{RouterStatus, TaskRouter, ROUTER_PRODUCER};
