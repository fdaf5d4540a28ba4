//! Shared memory for agents and workflows
//!
//! Three tiers with distinct retention rules:
//! - short-term: capacity-bounded, least-recently-accessed eviction, optional expiry
//! - long-term: unbounded, deleted explicitly
//! - episodic: append-only per session, range queries over sequence numbers

mod episodic;
mod short_term;
mod store;

pub use episodic::EpisodicTier;
pub use short_term::{EvictionCause, Evicted, Lookup, ShortTermTier};
pub use store::{MemoryConfig, MemoryStats, SharedMemoryStore, MEMORY_PRODUCER};
