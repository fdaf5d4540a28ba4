use crate::episodic::EpisodicTier;
use crate::short_term::{EvictionCause, Evicted, Lookup, ShortTermTier};
use chrono::Utc;
use common::{CoordinatorConfig, MemoryError, MemoryResult, ValidationError};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::ops::RangeBounds;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tandem_core::{Episode, EpisodeKey, Event, MemoryRecord, MemoryTier, MessageBus, Topics};
use tracing::{debug, info};

/// Producer id for events the store publishes
pub const MEMORY_PRODUCER: &str = "shared_memory";

#[derive(Debug, Clone)]
pub struct MemoryConfig {
    pub short_term_capacity: usize,
    /// Expiry applied to short-term puts that don't carry their own
    pub short_term_ttl: Option<Duration>,
}

impl Default for MemoryConfig {
    fn default() -> Self {
        Self {
            short_term_capacity: 1000,
            short_term_ttl: None,
        }
    }
}

impl From<&CoordinatorConfig> for MemoryConfig {
    fn from(config: &CoordinatorConfig) -> Self {
        Self {
            short_term_capacity: config.short_term_capacity,
            short_term_ttl: config.short_term_ttl(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MemoryStats {
    pub short_term: usize,
    pub short_term_capacity: usize,
    pub long_term: usize,
    pub sessions: usize,
    pub episodes: usize,
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
    pub expirations: u64,
    pub promotions: u64,
}

#[derive(Debug, Default)]
struct Counters {
    hits: AtomicU64,
    misses: AtomicU64,
    evictions: AtomicU64,
    expirations: AtomicU64,
    promotions: AtomicU64,
}

/// Tiered key-addressed storage shared by every agent and workflow.
///
/// Writes to the same key are serialised by that key's shard lock and
/// applied last-writer-wins. Nothing is atomic across keys.
#[derive(Debug)]
pub struct SharedMemoryStore {
    config: MemoryConfig,
    short_term: ShortTermTier,
    long_term: DashMap<String, MemoryRecord>,
    episodic: EpisodicTier,
    counters: Counters,
    bus: Option<Arc<MessageBus>>,
}

fn validate_key(key: &str) -> Result<(), ValidationError> {
    if key.trim().is_empty() {
        return Err(ValidationError::MissingField("key".into()));
    }
    Ok(())
}

fn expiry_from(ttl: Duration) -> Result<chrono::DateTime<Utc>, ValidationError> {
    let out_of_range = || ValidationError::OutOfRange {
        field: "expiry".into(),
        value: format!("{}ms", ttl.as_millis()),
        min: "1ms".into(),
        max: "i64::MAX ms".into(),
    };
    if ttl.is_zero() {
        return Err(out_of_range());
    }
    let ttl = chrono::Duration::from_std(ttl).map_err(|_| out_of_range())?;
    Utc::now().checked_add_signed(ttl).ok_or_else(out_of_range)
}

impl SharedMemoryStore {
    pub fn new(config: MemoryConfig) -> Self {
        info!(
            capacity = config.short_term_capacity,
            ttl_ms = config.short_term_ttl.map(|d| d.as_millis() as u64),
            "Shared memory store created"
        );
        Self {
            short_term: ShortTermTier::new(config.short_term_capacity),
            long_term: DashMap::new(),
            episodic: EpisodicTier::new(),
            counters: Counters::default(),
            bus: None,
            config,
        }
    }

    /// Publish eviction and promotion events on `bus`
    pub fn with_bus(mut self, bus: Arc<MessageBus>) -> Self {
        self.bus = Some(bus);
        self
    }

    pub fn config(&self) -> &MemoryConfig {
        &self.config
    }

    /// Store a value in the short-term or long-term tier.
    ///
    /// Episodic records are appended with [`append`](Self::append), and
    /// long-term records never expire, so both cases are validation errors.
    pub fn put(
        &self,
        tier: MemoryTier,
        key: &str,
        value: serde_json::Value,
        expiry: Option<Duration>,
    ) -> MemoryResult<()> {
        validate_key(key)?;
        match tier {
            MemoryTier::ShortTerm => {
                let expires_at = expiry
                    .or(self.config.short_term_ttl)
                    .map(expiry_from)
                    .transpose()?;
                let record = MemoryRecord::new(tier, key, value, expires_at);
                let evicted = self.short_term.insert(record);
                debug!(tier = %tier, key, "Stored record");
                self.report_evictions(evicted);
                Ok(())
            }
            MemoryTier::LongTerm => {
                if expiry.is_some() {
                    return Err(ValidationError::invalid(
                        "expiry",
                        "long-term records persist until deleted",
                    )
                    .into());
                }
                match self.long_term.entry(key.to_string()) {
                    Entry::Occupied(mut existing) => {
                        let existing = existing.get_mut();
                        existing.value = value;
                        existing.last_accessed = Utc::now();
                    }
                    Entry::Vacant(slot) => {
                        slot.insert(MemoryRecord::new(tier, key, value, None));
                    }
                }
                debug!(tier = %tier, key, "Stored record");
                Ok(())
            }
            MemoryTier::Episodic => Err(ValidationError::invalid(
                "tier",
                "episodic tier is append-only, use append(session, value)",
            )
            .into()),
        }
    }

    /// Fetch a value. Episodic keys are written `session#sequence`.
    pub fn get(&self, tier: MemoryTier, key: &str) -> MemoryResult<serde_json::Value> {
        match tier {
            MemoryTier::Episodic => self.episode(key).map(|e| e.value),
            _ => self.get_record(tier, key).map(|r| r.value),
        }
    }

    /// Fetch the whole record of a short-term or long-term key
    pub fn get_record(&self, tier: MemoryTier, key: &str) -> MemoryResult<MemoryRecord> {
        let found = match tier {
            MemoryTier::ShortTerm => match self.short_term.touch(key) {
                Lookup::Hit(record) => Some(record),
                Lookup::Expired(record) => {
                    self.counters.expirations.fetch_add(1, Ordering::Relaxed);
                    self.announce_eviction(&record, EvictionCause::Expired);
                    None
                }
                Lookup::Miss => None,
            },
            MemoryTier::LongTerm => self.long_term.get_mut(key).map(|mut record| {
                record.last_accessed = Utc::now();
                record.access_count += 1;
                record.clone()
            }),
            MemoryTier::Episodic => {
                return Err(ValidationError::invalid(
                    "tier",
                    "episodic entries are episodes, not records",
                )
                .into())
            }
        };

        match found {
            Some(record) => {
                self.counters.hits.fetch_add(1, Ordering::Relaxed);
                Ok(record)
            }
            None => {
                self.counters.misses.fetch_add(1, Ordering::Relaxed);
                Err(MemoryError::not_found(tier.as_str(), key))
            }
        }
    }

    pub fn contains(&self, tier: MemoryTier, key: &str) -> bool {
        match tier {
            MemoryTier::ShortTerm => self.short_term.contains(key),
            MemoryTier::LongTerm => self.long_term.contains_key(key),
            MemoryTier::Episodic => key
                .parse::<EpisodeKey>()
                .map(|k| self.episodic.get(&k).is_some())
                .unwrap_or(false),
        }
    }

    /// Explicit deletion. Episodes can't be deleted.
    pub fn delete(&self, tier: MemoryTier, key: &str) -> MemoryResult<()> {
        let removed = match tier {
            MemoryTier::ShortTerm => self.short_term.remove(key).is_some(),
            MemoryTier::LongTerm => self.long_term.remove(key).is_some(),
            MemoryTier::Episodic => {
                return Err(
                    ValidationError::invalid("tier", "episodic tier is append-only").into(),
                )
            }
        };
        if !removed {
            return Err(MemoryError::not_found(tier.as_str(), key));
        }
        debug!(tier = %tier, key, "Deleted record");
        Ok(())
    }

    /// Move a record between the short-term and long-term tiers, keeping its key.
    ///
    /// The source removal decides concurrent promotions and evictions of the
    /// same key: whoever removes the record first wins and the loser gets
    /// `NotFound`. The destination is overwritten last-writer-wins.
    pub fn promote(&self, key: &str, from: MemoryTier, to: MemoryTier) -> MemoryResult<()> {
        validate_key(key)?;
        if from == to {
            return Err(ValidationError::invalid("tier", "source and destination tiers are the same").into());
        }
        if from == MemoryTier::Episodic || to == MemoryTier::Episodic {
            return Err(ValidationError::invalid(
                "tier",
                "episodes cannot be promoted or demoted",
            )
            .into());
        }

        let now = Utc::now();
        let mut record = match from {
            MemoryTier::ShortTerm => self.short_term.remove(key),
            _ => self.long_term.remove(key).map(|(_, r)| r),
        }
        .ok_or_else(|| MemoryError::not_found(from.as_str(), key))?;

        if record.is_expired(now) {
            self.counters.expirations.fetch_add(1, Ordering::Relaxed);
            self.announce_eviction(&record, EvictionCause::Expired);
            return Err(MemoryError::not_found(from.as_str(), key));
        }

        record.tier = to;
        record.last_accessed = now;
        match to {
            MemoryTier::LongTerm => {
                record.expires_at = None;
                self.long_term.insert(key.to_string(), record);
            }
            _ => {
                let evicted = self.short_term.insert(record);
                self.report_evictions(evicted);
            }
        }

        self.counters.promotions.fetch_add(1, Ordering::Relaxed);
        info!(key, from = %from, to = %to, "Record promoted");
        self.emit(Event::new(
            Topics::MEMORY_PROMOTED,
            MEMORY_PRODUCER,
            serde_json::json!({ "key": key, "from": from, "to": to }),
        ));
        Ok(())
    }

    /// Append to a session's episodic log and return the assigned sequence number
    pub fn append(&self, session: &str, value: serde_json::Value) -> MemoryResult<u64> {
        if session.trim().is_empty() {
            return Err(ValidationError::MissingField("session".into()).into());
        }
        if session.contains('#') {
            return Err(ValidationError::invalid("session", "session ids cannot contain '#'").into());
        }
        let episode = self.episodic.append(session, value);
        debug!(session, sequence = episode.sequence, "Episode appended");
        Ok(episode.sequence)
    }

    pub fn episode(&self, key: &str) -> MemoryResult<Episode> {
        let parsed: EpisodeKey = key.parse()?;
        match self.episodic.get(&parsed) {
            Some(episode) => {
                self.counters.hits.fetch_add(1, Ordering::Relaxed);
                Ok(episode)
            }
            None => {
                self.counters.misses.fetch_add(1, Ordering::Relaxed);
                Err(MemoryError::not_found(MemoryTier::Episodic.as_str(), key))
            }
        }
    }

    /// Range query over a session's sequence numbers
    pub fn episodes<R: RangeBounds<u64>>(&self, session: &str, range: R) -> Vec<Episode> {
        self.episodic.range(session, range)
    }

    pub fn latest_episodes(&self, session: &str, limit: usize) -> Vec<Episode> {
        self.episodic.latest(session, limit)
    }

    /// Drop every expired short-term record and return how many went
    pub fn purge_expired(&self) -> usize {
        let purged = self.short_term.purge_expired(Utc::now());
        for record in &purged {
            self.announce_eviction(record, EvictionCause::Expired);
        }
        let count = purged.len();
        if count > 0 {
            self.counters
                .expirations
                .fetch_add(count as u64, Ordering::Relaxed);
            debug!(count, "Purged expired short-term records");
        }
        count
    }

    /// Purge expired records, then evict least-recently-accessed ones down to capacity
    pub fn evict_if_needed(&self) -> usize {
        let purged = self.purge_expired();
        let evicted = self.short_term.enforce_capacity();
        let count = evicted.len();
        self.report_evictions(evicted);
        purged + count
    }

    pub fn len(&self, tier: MemoryTier) -> usize {
        match tier {
            MemoryTier::ShortTerm => self.short_term.len(),
            MemoryTier::LongTerm => self.long_term.len(),
            MemoryTier::Episodic => self.episodic.episode_count(),
        }
    }

    /// Short-term keys from least to most recently accessed
    pub fn short_term_keys(&self) -> Vec<String> {
        self.short_term.keys_by_recency()
    }

    pub fn stats(&self) -> MemoryStats {
        MemoryStats {
            short_term: self.short_term.len(),
            short_term_capacity: self.short_term.capacity(),
            long_term: self.long_term.len(),
            sessions: self.episodic.session_count(),
            episodes: self.episodic.episode_count(),
            hits: self.counters.hits.load(Ordering::Relaxed),
            misses: self.counters.misses.load(Ordering::Relaxed),
            evictions: self.counters.evictions.load(Ordering::Relaxed),
            expirations: self.counters.expirations.load(Ordering::Relaxed),
            promotions: self.counters.promotions.load(Ordering::Relaxed),
        }
    }

    fn report_evictions(&self, evicted: Vec<Evicted>) {
        for victim in evicted {
            match victim.cause {
                EvictionCause::Capacity => {
                    self.counters.evictions.fetch_add(1, Ordering::Relaxed)
                }
                EvictionCause::Expired => {
                    self.counters.expirations.fetch_add(1, Ordering::Relaxed)
                }
            };
            debug!(key = %victim.record.key, cause = victim.cause.as_str(), "Short-term record evicted");
            self.announce_eviction(&victim.record, victim.cause);
        }
    }

    fn announce_eviction(&self, record: &MemoryRecord, cause: EvictionCause) {
        self.emit(Event::new(
            Topics::MEMORY_EVICTED,
            MEMORY_PRODUCER,
            serde_json::json!({
                "key": record.key,
                "tier": record.tier,
                "cause": cause.as_str(),
            }),
        ));
    }

    fn emit(&self, event: Event) {
        if let Some(bus) = &self.bus {
            bus.publish(event);
        }
    }
}

impl Default for SharedMemoryStore {
    fn default() -> Self {
        Self::new(MemoryConfig::default())
    }
}
