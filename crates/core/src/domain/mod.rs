//! Domain models for the coordination core

pub mod agent;
pub mod memory;
pub mod task;
pub mod workflow;

pub use agent::*;
pub use memory::*;
pub use task::*;
pub use workflow::*;
