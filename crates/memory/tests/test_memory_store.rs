use async_trait::async_trait;
use memory::{MemoryConfig, SharedMemoryStore};
use parking_lot::Mutex;
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tandem_core::{Event, EventHandler, MemoryTier, MessageBus, Topics};

struct Collector {
    events: Mutex<Vec<Event>>,
}

#[async_trait]
impl EventHandler for Collector {
    async fn handle(&self, event: Event) -> anyhow::Result<()> {
        self.events.lock().push(event);
        Ok(())
    }

    fn name(&self) -> String {
        "memory_collector".to_string()
    }
}

fn store_with_capacity(capacity: usize) -> SharedMemoryStore {
    SharedMemoryStore::new(MemoryConfig {
        short_term_capacity: capacity,
        short_term_ttl: None,
    })
}

#[tokio::test]
async fn test_eviction_and_promotion_are_published() {
    let bus = Arc::new(MessageBus::default());
    let collector = Arc::new(Collector {
        events: Mutex::new(Vec::new()),
    });
    bus.subscribe("memory.*", collector.clone());

    let store = store_with_capacity(2).with_bus(bus.clone());
    store.put(MemoryTier::ShortTerm, "A", json!(1), None).unwrap();
    store.put(MemoryTier::ShortTerm, "B", json!(2), None).unwrap();
    store.put(MemoryTier::ShortTerm, "C", json!(3), None).unwrap();
    store
        .promote("B", MemoryTier::ShortTerm, MemoryTier::LongTerm)
        .unwrap();

    assert!(bus.flush(Duration::from_secs(1)).await);
    let events = collector.events.lock().clone();
    assert_eq!(events.len(), 2);

    assert_eq!(events[0].topic, Topics::MEMORY_EVICTED);
    assert_eq!(events[0].payload["key"], json!("A"));
    assert_eq!(events[0].payload["cause"], json!("capacity"));

    assert_eq!(events[1].topic, Topics::MEMORY_PROMOTED);
    assert_eq!(events[1].payload["from"], json!("short_term"));
    assert_eq!(events[1].payload["to"], json!("long_term"));
}

#[test]
fn test_concurrent_writers_respect_capacity() {
    let store = Arc::new(store_with_capacity(50));

    std::thread::scope(|scope| {
        for writer in 0..8 {
            let store = Arc::clone(&store);
            scope.spawn(move || {
                for n in 0..100 {
                    let key = format!("w{}-{}", writer, n);
                    store.put(MemoryTier::ShortTerm, &key, json!(n), None).unwrap();
                    assert!(store.len(MemoryTier::ShortTerm) <= 50);
                }
            });
        }
    });

    let stats = store.stats();
    assert_eq!(stats.short_term, 50);
    assert_eq!(stats.evictions, 8 * 100 - 50);
}

#[test]
fn test_concurrent_promotions_of_one_key_have_one_winner() {
    let store = Arc::new(store_with_capacity(10));
    store
        .put(MemoryTier::ShortTerm, "shared", json!("fact"), None)
        .unwrap();

    let outcomes: Vec<bool> = std::thread::scope(|scope| {
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let store = Arc::clone(&store);
                scope.spawn(move || {
                    store
                        .promote("shared", MemoryTier::ShortTerm, MemoryTier::LongTerm)
                        .is_ok()
                })
            })
            .collect();
        handles.into_iter().map(|h| h.join().unwrap()).collect()
    });

    assert_eq!(outcomes.iter().filter(|ok| **ok).count(), 1);
    assert_eq!(
        store.get(MemoryTier::LongTerm, "shared").unwrap(),
        json!("fact")
    );
    assert!(!store.contains(MemoryTier::ShortTerm, "shared"));
}

#[test]
fn test_same_key_writes_are_last_writer_wins() {
    let store = Arc::new(store_with_capacity(10));

    std::thread::scope(|scope| {
        for writer in 0..4 {
            let store = Arc::clone(&store);
            scope.spawn(move || {
                for n in 0..50 {
                    store
                        .put(MemoryTier::LongTerm, "counter", json!([writer, n]), None)
                        .unwrap();
                }
            });
        }
    });

    // Every writer's final value is a legal outcome; the key exists exactly once
    let value = store.get(MemoryTier::LongTerm, "counter").unwrap();
    assert_eq!(value[1], json!(49));
    assert_eq!(store.len(MemoryTier::LongTerm), 1);
}

#[test]
fn test_episodic_range_queries() {
    let store = store_with_capacity(4);
    for n in 0..10 {
        store.append("session-1", json!(n)).unwrap();
    }
    store.append("session-2", json!("other")).unwrap();

    let window: Vec<u64> = store
        .episodes("session-1", 4..=6)
        .iter()
        .map(|e| e.sequence)
        .collect();
    assert_eq!(window, vec![4, 5, 6]);
    assert_eq!(store.latest_episodes("session-1", 3)[0].value, json!(7));

    let stats = store.stats();
    assert_eq!(stats.sessions, 2);
    assert_eq!(stats.episodes, 11);
}
