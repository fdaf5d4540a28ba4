use chrono::{DateTime, Utc};
use common::ValidationError;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Partition of the shared memory store
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MemoryTier {
    /// Capacity-bounded, LRU eviction, optional expiry
    ShortTerm,
    /// Unbounded, explicit deletion only
    LongTerm,
    /// Append-only, keyed by (session, sequence)
    Episodic,
}

impl MemoryTier {
    pub fn as_str(&self) -> &'static str {
        match self {
            MemoryTier::ShortTerm => "short_term",
            MemoryTier::LongTerm => "long_term",
            MemoryTier::Episodic => "episodic",
        }
    }
}

impl fmt::Display for MemoryTier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for MemoryTier {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().replace('-', "_").as_str() {
            "short_term" | "short" => Ok(MemoryTier::ShortTerm),
            "long_term" | "long" => Ok(MemoryTier::LongTerm),
            "episodic" => Ok(MemoryTier::Episodic),
            _ => Err(ValidationError::InvalidTier(s.to_string())),
        }
    }
}

/// A key-addressed record of the short-term or long-term tier
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MemoryRecord {
    pub key: String,
    pub value: serde_json::Value,
    pub tier: MemoryTier,
    pub created_at: DateTime<Utc>,
    pub last_accessed: DateTime<Utc>,
    pub expires_at: Option<DateTime<Utc>>,
    pub access_count: u64,
}

impl MemoryRecord {
    pub fn new(
        tier: MemoryTier,
        key: impl Into<String>,
        value: serde_json::Value,
        expires_at: Option<DateTime<Utc>>,
    ) -> Self {
        let now = Utc::now();
        Self {
            key: key.into(),
            value,
            tier,
            created_at: now,
            last_accessed: now,
            expires_at,
            access_count: 0,
        }
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.is_some_and(|at| at <= now)
    }
}

/// Composite key of an episode, rendered as `session#sequence`
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct EpisodeKey {
    pub session: String,
    pub sequence: u64,
}

impl fmt::Display for EpisodeKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}", self.session, self.sequence)
    }
}

impl FromStr for EpisodeKey {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (session, sequence) = s
            .rsplit_once('#')
            .ok_or_else(|| ValidationError::invalid("key", "episodic keys look like 'session#sequence'"))?;
        if session.is_empty() {
            return Err(ValidationError::MissingField("session".into()));
        }
        let sequence = sequence
            .parse::<u64>()
            .map_err(|_| ValidationError::invalid("key", format!("bad sequence number '{}'", sequence)))?;
        Ok(Self {
            session: session.to_string(),
            sequence,
        })
    }
}

/// One entry of the episodic tier
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Episode {
    pub session: String,
    pub sequence: u64,
    pub value: serde_json::Value,
    pub recorded_at: DateTime<Utc>,
}

impl Episode {
    pub fn key(&self) -> EpisodeKey {
        EpisodeKey {
            session: self.session.clone(),
            sequence: self.sequence,
        }
    }
}
