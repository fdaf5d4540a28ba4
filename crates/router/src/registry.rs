//! Capability registry: which agent role advertises which capability tags

use common::ValidationError;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tandem_core::{AgentDescriptor, Availability, Event, MessageBus, RoleId, Topics};
use tracing::{debug, info, warn};

/// Producer id for registry events
pub const REGISTRY_PRODUCER: &str = "capability_registry";

#[derive(Debug, Clone)]
struct RegistryEntry {
    descriptor: AgentDescriptor,
    /// Assignment clock value of the last selection, 0 when never assigned
    last_assigned: u64,
}

/// Maps agent roles to their advertised capabilities.
///
/// Each role id lives in its own map shard entry, so writes to one role never
/// wait on another.
pub struct CapabilityRegistry {
    agents: DashMap<RoleId, RegistryEntry>,
    assignment_clock: AtomicU64,
    bus: Option<Arc<MessageBus>>,
}

impl CapabilityRegistry {
    pub fn new() -> Self {
        Self {
            agents: DashMap::new(),
            assignment_clock: AtomicU64::new(1),
            bus: None,
        }
    }

    /// Publish `agent.*` events on `bus`
    pub fn with_bus(mut self, bus: Arc<MessageBus>) -> Self {
        self.bus = Some(bus);
        self
    }

    /// Add an agent. A descriptor with an already registered role id replaces the old one.
    pub fn register(&self, descriptor: AgentDescriptor) -> Result<(), ValidationError> {
        descriptor.validate()?;
        let role = descriptor.role_id.clone();

        let replaced = match self.agents.entry(role.clone()) {
            Entry::Occupied(mut existing) => {
                existing.get_mut().descriptor = descriptor.clone();
                true
            }
            Entry::Vacant(slot) => {
                slot.insert(RegistryEntry {
                    descriptor: descriptor.clone(),
                    last_assigned: 0,
                });
                false
            }
        };

        info!(
            role = %role,
            kind = %descriptor.kind,
            capabilities = ?descriptor.capabilities,
            replaced,
            "Agent registered"
        );
        self.emit(Event::new(
            Topics::AGENT_REGISTERED,
            REGISTRY_PRODUCER,
            serde_json::json!({
                "role_id": role,
                "kind": descriptor.kind,
                "capabilities": descriptor.capabilities,
                "availability": descriptor.availability,
                "replaced": replaced,
            }),
        ));
        Ok(())
    }

    pub fn deregister(&self, role: &RoleId) -> Option<AgentDescriptor> {
        let removed = self.agents.remove(role).map(|(_, entry)| entry.descriptor);
        match &removed {
            Some(_) => {
                info!(role = %role, "Agent deregistered");
                self.emit(Event::new(
                    Topics::AGENT_DEREGISTERED,
                    REGISTRY_PRODUCER,
                    serde_json::json!({ "role_id": role }),
                ));
            }
            None => debug!(role = %role, "Deregistration of unknown role ignored"),
        }
        removed
    }

    /// Returns false when the role is not registered
    pub fn update_availability(&self, role: &RoleId, availability: Availability) -> bool {
        let previous = match self.agents.get_mut(role) {
            Some(mut entry) => {
                let previous = entry.descriptor.availability;
                entry.descriptor.availability = availability;
                previous
            }
            None => {
                warn!(role = %role, ?availability, "Availability update for unknown role");
                return false;
            }
        };

        if previous != availability {
            debug!(role = %role, ?previous, ?availability, "Agent availability changed");
            self.emit(Event::new(
                Topics::AGENT_AVAILABILITY,
                REGISTRY_PRODUCER,
                serde_json::json!({
                    "role_id": role,
                    "previous": previous,
                    "availability": availability,
                }),
            ));
        }
        true
    }

    /// Agents advertising `tag` that are not unavailable, best candidate first.
    ///
    /// Order: idle before busy, then least recently assigned, then role id.
    pub fn find_capable(&self, tag: &str) -> Vec<AgentDescriptor> {
        let mut candidates: Vec<RegistryEntry> = self
            .agents
            .iter()
            .filter(|entry| {
                entry.descriptor.availability.is_available() && entry.descriptor.has_capability(tag)
            })
            .map(|entry| entry.value().clone())
            .collect();

        candidates.sort_by(|a, b| {
            let busy_a = a.descriptor.availability == Availability::Busy;
            let busy_b = b.descriptor.availability == Availability::Busy;
            busy_a
                .cmp(&busy_b)
                .then(a.last_assigned.cmp(&b.last_assigned))
                .then_with(|| a.descriptor.role_id.cmp(&b.descriptor.role_id))
        });

        candidates.into_iter().map(|entry| entry.descriptor).collect()
    }

    /// Pick the best candidate for `tag` and record the assignment
    pub fn select(&self, tag: &str) -> Option<AgentDescriptor> {
        for candidate in self.find_capable(tag) {
            let Some(mut entry) = self.agents.get_mut(&candidate.role_id) else {
                continue;
            };
            // Re-check under the role's lock, it may have changed since the scan
            if !entry.descriptor.availability.is_available() || !entry.descriptor.has_capability(tag) {
                continue;
            }
            entry.last_assigned = self.assignment_clock.fetch_add(1, Ordering::SeqCst);
            debug!(role = %candidate.role_id, capability = tag, "Agent selected");
            return Some(entry.descriptor.clone());
        }
        None
    }

    /// Whether any registered agent advertises `tag`, whatever its availability
    pub fn has_capability(&self, tag: &str) -> bool {
        self.agents
            .iter()
            .any(|entry| entry.descriptor.has_capability(tag))
    }

    pub fn get(&self, role: &RoleId) -> Option<AgentDescriptor> {
        self.agents.get(role).map(|entry| entry.descriptor.clone())
    }

    /// Every registered agent ordered by role id
    pub fn agents(&self) -> Vec<AgentDescriptor> {
        let mut agents: Vec<AgentDescriptor> = self
            .agents
            .iter()
            .map(|entry| entry.descriptor.clone())
            .collect();
        agents.sort_by(|a, b| a.role_id.cmp(&b.role_id));
        agents
    }

    pub fn len(&self) -> usize {
        self.agents.len()
    }

    pub fn is_empty(&self) -> bool {
        self.agents.is_empty()
    }

    pub fn available_count(&self) -> usize {
        self.agents
            .iter()
            .filter(|entry| entry.descriptor.availability.is_available())
            .count()
    }

    fn emit(&self, event: Event) {
        if let Some(bus) = &self.bus {
            bus.publish(event);
        }
    }
}

impl Default for CapabilityRegistry {
    fn default() -> Self {
        Self::new()
    }
}
