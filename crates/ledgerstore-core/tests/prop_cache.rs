use std::collections::BTreeMap;
use std::sync::Arc;

use proptest::prelude::*;

use ledgerstore_core::{
    FlushableStore, KeyValueReader, KeyValueStore, KeyValueWriter, MemStore, SwitchableSnapshot,
    WriteBackCache, WriteBatch,
};

#[derive(Debug, Clone)]
enum MiniOp {
    Put { key: u8, value: u8 },
    Del { key: u8 },
}

#[derive(Debug, Clone)]
enum Step {
    Op(MiniOp),
    Batch(Vec<MiniOp>),
    Flush,
}

const KEY_SPACE: u8 = 12;

/// Two prefixes so prefix scans have something to exclude.
fn key_bytes(key: u8) -> Vec<u8> {
    let k = key % KEY_SPACE;
    vec![if k % 2 == 0 { b'a' } else { b'b' }, b'0' + k]
}

fn value_bytes(value: u8) -> Vec<u8> {
    vec![b'0' + (value % 10)]
}

fn ref_apply(model: &mut BTreeMap<Vec<u8>, Vec<u8>>, op: &MiniOp) {
    match op {
        MiniOp::Put { key, value } => {
            model.insert(key_bytes(*key), value_bytes(*value));
        }
        MiniOp::Del { key } => {
            model.remove(&key_bytes(*key));
        }
    }
}

fn collect(iter: ledgerstore_core::KvIter) -> Vec<(Vec<u8>, Vec<u8>)> {
    iter.map(Result::unwrap).collect()
}

fn seed(store: &MemStore, model: &mut BTreeMap<Vec<u8>, Vec<u8>>, seeds: &[(u8, u8)]) {
    for (key, value) in seeds {
        store.put(&key_bytes(*key), &value_bytes(*value)).unwrap();
        model.insert(key_bytes(*key), value_bytes(*value));
    }
}

proptest! {
    #![proptest_config(ProptestConfig { cases: 64, .. ProptestConfig::default() })]

    #[test]
    fn prop_cache_matches_reference(
        seeds in prop::collection::vec((0u8..KEY_SPACE, any::<u8>()), 0..8),
        steps in prop::collection::vec(step_strategy(), 1..60),
    ) {
        let store = Arc::new(MemStore::new());
        let mut model = BTreeMap::new();
        seed(&store, &mut model, &seeds);
        let cache = WriteBackCache::new("prop", store.clone() as Arc<dyn KeyValueStore>, 32);

        for step in &steps {
            match step {
                Step::Op(MiniOp::Put { key, value }) => {
                    cache.put(&key_bytes(*key), &value_bytes(*value)).unwrap();
                }
                Step::Op(MiniOp::Del { key }) => {
                    cache.delete(&key_bytes(*key)).unwrap();
                }
                Step::Batch(ops) => {
                    let mut batch = WriteBatch::new();
                    for op in ops {
                        match op {
                            MiniOp::Put { key, value } => batch.put(&key_bytes(*key), &value_bytes(*value)),
                            MiniOp::Del { key } => batch.delete(&key_bytes(*key)),
                        }
                    }
                    cache.write(&batch).unwrap();
                }
                Step::Flush => {
                    cache.flush().unwrap();
                    prop_assert_eq!(cache.not_flushed_size_estimate(), 0);
                    prop_assert_eq!(collect(store.iter(b"", b"").unwrap()), collect(cache.iter(b"", b"").unwrap()));
                }
            }
            match step {
                Step::Op(op) => ref_apply(&mut model, op),
                Step::Batch(ops) => ops.iter().for_each(|op| ref_apply(&mut model, op)),
                Step::Flush => {}
            }

            for k in 0..KEY_SPACE {
                let key = key_bytes(k);
                prop_assert_eq!(cache.get(&key).unwrap(), model.get(&key).cloned());
                prop_assert_eq!(cache.has(&key).unwrap(), model.contains_key(&key));
            }
        }

        let expected: Vec<_> = model.iter().map(|(k, v)| (k.clone(), v.clone())).collect();
        prop_assert_eq!(collect(cache.iter(b"", b"").unwrap()), expected);

        let expected_b: Vec<_> = model.range(b"b".to_vec()..b"c".to_vec())
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        prop_assert_eq!(collect(cache.iter(b"b", b"").unwrap()), expected_b);

        let expected_from: Vec<_> = model.range(b"a4".to_vec()..b"b".to_vec())
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        prop_assert_eq!(collect(cache.iter(b"a", b"4").unwrap()), expected_from);
    }

    #[test]
    fn prop_switch_mid_scan_is_gap_free(
        seeds in prop::collection::vec((0u8..KEY_SPACE, any::<u8>()), 1..12),
        switch_after in 0usize..12,
    ) {
        let store = MemStore::new();
        let mut model = BTreeMap::new();
        seed(&store, &mut model, &seeds);

        let snap = SwitchableSnapshot::new(store.snapshot().unwrap());
        let mut iter = snap.iter(b"", b"").unwrap();
        let mut seen = Vec::new();
        for _ in 0..switch_after {
            match iter.next() {
                Some(item) => seen.push(item.unwrap().0),
                None => break,
            }
        }

        // The replacement view holds the same keys under new values.
        for key in model.keys() {
            store.put(key, b"new").unwrap();
        }
        snap.switch_to(store.snapshot().unwrap());
        seen.extend(iter.map(|item| item.unwrap().0));

        let expected: Vec<Vec<u8>> = model.keys().cloned().collect();
        prop_assert_eq!(seen, expected);
    }
}

fn step_strategy() -> impl Strategy<Value = Step> {
    let mini_op = prop_oneof![
        (0u8..KEY_SPACE, any::<u8>()).prop_map(|(key, value)| MiniOp::Put { key, value }),
        (0u8..KEY_SPACE).prop_map(|key| MiniOp::Del { key }),
    ];

    prop_oneof![
        4 => mini_op.clone().prop_map(Step::Op),
        2 => prop::collection::vec(mini_op, 1..5).prop_map(Step::Batch),
        1 => Just(Step::Flush),
    ]
}
