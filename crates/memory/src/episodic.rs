use chrono::Utc;
use dashmap::DashMap;
use std::ops::RangeBounds;
use tandem_core::{Episode, EpisodeKey};

/// Append-only log per session. Sequence numbers start at 0 and are
/// assigned here, so an episode can never be overwritten.
#[derive(Debug, Default)]
pub struct EpisodicTier {
    sessions: DashMap<String, Vec<Episode>>,
}

impl EpisodicTier {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn append(&self, session: &str, value: serde_json::Value) -> Episode {
        let mut log = self.sessions.entry(session.to_string()).or_default();
        let episode = Episode {
            session: session.to_string(),
            sequence: log.len() as u64,
            value,
            recorded_at: Utc::now(),
        };
        log.push(episode.clone());
        episode
    }

    pub fn get(&self, key: &EpisodeKey) -> Option<Episode> {
        let log = self.sessions.get(&key.session)?;
        let index = usize::try_from(key.sequence).ok()?;
        log.get(index).cloned()
    }

    pub fn range<R: RangeBounds<u64>>(&self, session: &str, range: R) -> Vec<Episode> {
        self.sessions
            .get(session)
            .map(|log| {
                log.iter()
                    .filter(|e| range.contains(&e.sequence))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default()
    }

    /// The last `limit` episodes in recording order
    pub fn latest(&self, session: &str, limit: usize) -> Vec<Episode> {
        self.sessions
            .get(session)
            .map(|log| {
                let skip = log.len().saturating_sub(limit);
                log[skip..].to_vec()
            })
            .unwrap_or_default()
    }

    pub fn session_len(&self, session: &str) -> usize {
        self.sessions.get(session).map_or(0, |log| log.len())
    }

    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }

    pub fn episode_count(&self) -> usize {
        self.sessions.iter().map(|log| log.len()).sum()
    }

    pub fn sessions(&self) -> Vec<String> {
        let mut sessions: Vec<String> = self.sessions.iter().map(|e| e.key().clone()).collect();
        sessions.sort();
        sessions
    }
}
