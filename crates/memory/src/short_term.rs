use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use tandem_core::MemoryRecord;

/// Why a record left the short-term tier without being asked to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EvictionCause {
    Capacity,
    Expired,
}

impl EvictionCause {
    pub fn as_str(&self) -> &'static str {
        match self {
            EvictionCause::Capacity => "capacity",
            EvictionCause::Expired => "expired",
        }
    }
}

#[derive(Debug, Clone)]
pub struct Evicted {
    pub record: MemoryRecord,
    pub cause: EvictionCause,
}

/// Outcome of a short-term lookup
#[derive(Debug)]
pub enum Lookup {
    Hit(MemoryRecord),
    /// The record existed but its expiry had passed; it has been removed
    Expired(MemoryRecord),
    Miss,
}

#[derive(Debug)]
struct Slot {
    record: MemoryRecord,
    /// Logical access time, higher is more recent
    tick: u64,
}

/// Capacity-bounded tier evicting the least-recently-accessed record.
///
/// Records live in a sharded map, so reads and overwrites of existing keys
/// only lock their own shard. Admitting a *new* key takes the admission lock,
/// which is what keeps `len() <= capacity` under concurrent inserts.
#[derive(Debug)]
pub struct ShortTermTier {
    records: DashMap<String, Slot>,
    admission: Mutex<()>,
    capacity: usize,
    clock: AtomicU64,
}

impl ShortTermTier {
    pub fn new(capacity: usize) -> Self {
        Self {
            records: DashMap::new(),
            admission: Mutex::new(()),
            capacity: capacity.max(1),
            clock: AtomicU64::new(0),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    fn tick(&self) -> u64 {
        self.clock.fetch_add(1, Ordering::SeqCst)
    }

    /// Insert or overwrite a record, returning whatever had to leave to make room
    pub fn insert(&self, record: MemoryRecord) -> Vec<Evicted> {
        if self.overwrite(&record) {
            return Vec::new();
        }

        let _admission = self.admission.lock();
        // Another writer may have admitted the key while we waited
        if self.overwrite(&record) {
            return Vec::new();
        }

        let now = Utc::now();
        let mut evicted = Vec::new();
        while self.records.len() >= self.capacity {
            match self.evict_one(now) {
                Some(victim) => evicted.push(victim),
                None => break,
            }
        }

        let tick = self.tick();
        self.records
            .insert(record.key.clone(), Slot { record, tick });
        evicted
    }

    /// Last-writer-wins update of an existing key. Keeps the original creation time.
    fn overwrite(&self, record: &MemoryRecord) -> bool {
        let Some(mut slot) = self.records.get_mut(&record.key) else {
            return false;
        };
        let created_at = slot.record.created_at;
        let access_count = slot.record.access_count;
        slot.record = record.clone();
        slot.record.created_at = created_at;
        slot.record.access_count = access_count;
        slot.tick = self.tick();
        true
    }

    fn evict_one(&self, now: DateTime<Utc>) -> Option<Evicted> {
        loop {
            let (key, tick, cause) = self.select_victim(now)?;
            // The victim may have been touched since the scan; rescan if so
            if let Some((_, slot)) = self.records.remove_if(&key, |_, s| s.tick == tick) {
                return Some(Evicted {
                    record: slot.record,
                    cause,
                });
            }
        }
    }

    /// Expired records go first, then the oldest tick
    fn select_victim(&self, now: DateTime<Utc>) -> Option<(String, u64, EvictionCause)> {
        let mut oldest: Option<(String, u64)> = None;
        for entry in self.records.iter() {
            if entry.record.is_expired(now) {
                return Some((entry.key().clone(), entry.tick, EvictionCause::Expired));
            }
            if oldest.as_ref().map_or(true, |(_, t)| entry.tick < *t) {
                oldest = Some((entry.key().clone(), entry.tick));
            }
        }
        oldest.map(|(key, tick)| (key, tick, EvictionCause::Capacity))
    }

    /// Read a record and mark it most recently accessed
    pub fn touch(&self, key: &str) -> Lookup {
        let now = Utc::now();
        match self.records.get_mut(key) {
            None => return Lookup::Miss,
            Some(mut slot) if !slot.record.is_expired(now) => {
                slot.tick = self.tick();
                slot.record.last_accessed = now;
                slot.record.access_count += 1;
                return Lookup::Hit(slot.record.clone());
            }
            Some(_) => {}
        }

        match self.records.remove_if(key, |_, s| s.record.is_expired(now)) {
            Some((_, slot)) => Lookup::Expired(slot.record),
            None => Lookup::Miss,
        }
    }

    /// Read without affecting recency
    pub fn peek(&self, key: &str) -> Option<MemoryRecord> {
        self.records.get(key).map(|slot| slot.record.clone())
    }

    pub fn contains(&self, key: &str) -> bool {
        self.records.contains_key(key)
    }

    pub fn remove(&self, key: &str) -> Option<MemoryRecord> {
        self.records.remove(key).map(|(_, slot)| slot.record)
    }

    pub fn purge_expired(&self, now: DateTime<Utc>) -> Vec<MemoryRecord> {
        let expired: Vec<String> = self
            .records
            .iter()
            .filter(|entry| entry.record.is_expired(now))
            .map(|entry| entry.key().clone())
            .collect();

        expired
            .into_iter()
            .filter_map(|key| {
                self.records
                    .remove_if(&key, |_, s| s.record.is_expired(now))
                    .map(|(_, slot)| slot.record)
            })
            .collect()
    }

    /// Evict down to capacity
    pub fn enforce_capacity(&self) -> Vec<Evicted> {
        let _admission = self.admission.lock();
        let now = Utc::now();
        let mut evicted = Vec::new();
        while self.records.len() > self.capacity {
            match self.evict_one(now) {
                Some(victim) => evicted.push(victim),
                None => break,
            }
        }
        evicted
    }

    /// Keys ordered from least to most recently accessed
    pub fn keys_by_recency(&self) -> Vec<String> {
        let mut keys: Vec<(u64, String)> = self
            .records
            .iter()
            .map(|entry| (entry.tick, entry.key().clone()))
            .collect();
        keys.sort_unstable();
        keys.into_iter().map(|(_, key)| key).collect()
    }
}
