//! Sequential model check: any sequence of operations on a `SyncMap` must
//! agree with `std::collections::HashMap`, whatever the snapshot/overlay
//! state happens to be when each operation runs.

use kovan_syncmap::SyncMap;
use proptest::prelude::*;
use std::collections::HashMap;

#[derive(Debug, Clone)]
enum Op {
    Load(u8),
    Store(u8, u16),
    LoadOrStore(u8, u16),
    LoadAndDelete(u8),
    Delete(u8),
    Swap(u8, u16),
    CompareAndSwap(u8, u16, u16),
    CompareAndDelete(u8, u16),
    Range,
    Clear,
}

fn op() -> impl Strategy<Value = Op> {
    // Small key and value domains so that hits, misses and CAS matches all
    // happen often.
    let key = 0u8..16;
    let value = 0u16..4;
    prop_oneof![
        4 => key.clone().prop_map(Op::Load),
        3 => (key.clone(), value.clone()).prop_map(|(k, v)| Op::Store(k, v)),
        2 => (key.clone(), value.clone()).prop_map(|(k, v)| Op::LoadOrStore(k, v)),
        2 => key.clone().prop_map(Op::LoadAndDelete),
        2 => key.clone().prop_map(Op::Delete),
        2 => (key.clone(), value.clone()).prop_map(|(k, v)| Op::Swap(k, v)),
        2 => (key.clone(), value.clone(), value.clone())
            .prop_map(|(k, old, new)| Op::CompareAndSwap(k, old, new)),
        2 => (key.clone(), value).prop_map(|(k, old)| Op::CompareAndDelete(k, old)),
        1 => Just(Op::Range),
        1 => Just(Op::Clear),
    ]
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(256))]

    #[test]
    fn prop_matches_hashmap(ops in proptest::collection::vec(op(), 1..200)) {
        let map = SyncMap::new();
        let mut model: HashMap<u8, u16> = HashMap::new();

        for op in ops {
            match op {
                Op::Load(k) => {
                    prop_assert_eq!(map.load(&k), model.get(&k).copied());
                }
                Op::Store(k, v) => {
                    map.store(k, v);
                    model.insert(k, v);
                }
                Op::LoadOrStore(k, v) => {
                    let expected = match model.get(&k) {
                        Some(&existing) => (existing, true),
                        None => {
                            model.insert(k, v);
                            (v, false)
                        }
                    };
                    prop_assert_eq!(map.load_or_store(k, v), expected);
                }
                Op::LoadAndDelete(k) => {
                    prop_assert_eq!(map.load_and_delete(&k), model.remove(&k));
                }
                Op::Delete(k) => {
                    map.delete(&k);
                    model.remove(&k);
                }
                Op::Swap(k, v) => {
                    prop_assert_eq!(map.swap(k, v), model.insert(k, v));
                }
                Op::CompareAndSwap(k, old, new) => {
                    let expected = model.get(&k) == Some(&old);
                    if expected {
                        model.insert(k, new);
                    }
                    prop_assert_eq!(map.compare_and_swap(&k, &old, new), expected);
                }
                Op::CompareAndDelete(k, old) => {
                    let expected = model.get(&k) == Some(&old);
                    if expected {
                        model.remove(&k);
                    }
                    prop_assert_eq!(map.compare_and_delete(&k, &old), expected);
                }
                Op::Range => {
                    let mut seen = HashMap::new();
                    map.range(|k, v| {
                        seen.insert(*k, *v);
                        true
                    });
                    prop_assert_eq!(&seen, &model);
                }
                Op::Clear => {
                    map.clear();
                    model.clear();
                }
            }
        }

        prop_assert_eq!(map.len(), model.len());
        for (k, v) in &model {
            prop_assert_eq!(map.load(k), Some(*v));
        }
    }
}
