use memory::{MemoryConfig, SharedMemoryStore};
use proptest::prelude::*;
use serde_json::json;
use tandem_core::MemoryTier;

#[derive(Debug, Clone)]
enum Op {
    Put(u8),
    Get(u8),
}

fn op() -> impl Strategy<Value = Op> {
    prop_oneof![(0u8..8).prop_map(Op::Put), (0u8..8).prop_map(Op::Get)]
}

/// Reference LRU: keys ordered from least to most recently accessed
fn touch(model: &mut Vec<String>, key: &str) {
    model.retain(|k| k != key);
    model.push(key.to_string());
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(200))]

    #[test]
    fn test_capacity_never_exceeded_and_victim_is_lru(
        capacity in 1usize..5,
        ops in prop::collection::vec(op(), 1..60)
    ) {
        let store = SharedMemoryStore::new(MemoryConfig {
            short_term_capacity: capacity,
            short_term_ttl: None,
        });
        let mut model: Vec<String> = Vec::new();

        for op in ops {
            match op {
                Op::Put(k) => {
                    let key = format!("k{}", k);
                    let expected_victim = if !model.contains(&key) && model.len() == capacity {
                        Some(model.remove(0))
                    } else {
                        None
                    };
                    store.put(MemoryTier::ShortTerm, &key, json!(k), None).unwrap();
                    touch(&mut model, &key);

                    if let Some(victim) = expected_victim {
                        prop_assert!(!store.contains(MemoryTier::ShortTerm, &victim));
                    }
                }
                Op::Get(k) => {
                    let key = format!("k{}", k);
                    let result = store.get(MemoryTier::ShortTerm, &key);
                    if model.contains(&key) {
                        prop_assert_eq!(result.unwrap(), json!(k));
                        touch(&mut model, &key);
                    } else {
                        prop_assert!(result.unwrap_err().is_not_found());
                    }
                }
            }

            prop_assert!(store.len(MemoryTier::ShortTerm) <= capacity);
        }

        prop_assert_eq!(store.short_term_keys(), model);
    }
}
