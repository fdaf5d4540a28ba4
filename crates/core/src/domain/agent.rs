use common::ValidationError;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;

/// Identifier of an agent role, e.g. "builder" or "strategist"
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RoleId(pub String);

impl RoleId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RoleId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for RoleId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for RoleId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

/// Behavioural variant of a capability provider
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentKind {
    /// Implements, generates and debugs
    Builder,
    /// Plans, analyses and decides
    Strategist,
    Custom(String),
}

impl fmt::Display for AgentKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AgentKind::Builder => write!(f, "builder"),
            AgentKind::Strategist => write!(f, "strategist"),
            AgentKind::Custom(name) => write!(f, "custom:{}", name),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Availability {
    Idle,
    Busy,
    Unavailable,
}

impl Availability {
    pub fn is_available(&self) -> bool {
        !matches!(self, Availability::Unavailable)
    }
}

/// An agent as the capability registry sees it
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgentDescriptor {
    pub role_id: RoleId,
    pub kind: AgentKind,
    pub capabilities: BTreeSet<String>,
    pub availability: Availability,
}

impl AgentDescriptor {
    pub fn new<I, S>(role_id: impl Into<RoleId>, kind: AgentKind, capabilities: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            role_id: role_id.into(),
            kind,
            capabilities: capabilities.into_iter().map(Into::into).collect(),
            availability: Availability::Idle,
        }
    }

    pub fn builder<I, S>(capabilities: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::new("builder", AgentKind::Builder, capabilities)
    }

    pub fn strategist<I, S>(capabilities: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::new("strategist", AgentKind::Strategist, capabilities)
    }

    pub fn with_availability(mut self, availability: Availability) -> Self {
        self.availability = availability;
        self
    }

    pub fn has_capability(&self, tag: &str) -> bool {
        self.capabilities.contains(tag)
    }

    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.role_id.0.trim().is_empty() {
            return Err(ValidationError::MissingField("role_id".into()));
        }
        if self.capabilities.is_empty() {
            return Err(ValidationError::invalid(
                "capabilities",
                format!("agent '{}' advertises no capabilities", self.role_id),
            ));
        }
        if self.capabilities.iter().any(|c| c.trim().is_empty()) {
            return Err(ValidationError::invalid(
                "capabilities",
                "capability tags must not be blank",
            ));
        }
        Ok(())
    }
}
