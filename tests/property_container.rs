//! Property-based tests for the container engine
//!
//! Random insert/remove/replace/flush sequences must keep entries and free
//! space tiling the body, and must survive a close and reopen unchanged.

use mixlib::{Container, Generation, Integrity, OpenOptions, Protection};
use proptest::prelude::*;
use std::collections::BTreeMap;
use std::io::Cursor;

#[derive(Debug, Clone)]
enum Op {
    Insert(usize),
    Remove(usize),
    Replace(usize, usize),
    Flush,
}

fn op() -> impl Strategy<Value = Op> {
    prop_oneof![
        4 => (0usize..3000).prop_map(Op::Insert),
        2 => any::<usize>().prop_map(Op::Remove),
        2 => (any::<usize>(), 0usize..3000).prop_map(|(i, n)| Op::Replace(i, n)),
        1 => Just(Op::Flush),
    ]
}

fn content(id: u32, len: usize, salt: u8) -> Vec<u8> {
    (0..len).map(|i| (id as u8) ^ (i as u8) ^ salt).collect()
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    #[test]
    fn prop_entries_and_free_space_tile_the_body(
        ops in prop::collection::vec(op(), 1..40),
        checksummed in any::<bool>(),
    ) {
        let protection = if checksummed { Protection::Checksummed } else { Protection::None };
        let mut c = Container::create(Cursor::new(Vec::new()), Generation::RedAlert, protection).unwrap();
        let mut model: BTreeMap<u32, Vec<u8>> = BTreeMap::new();
        let mut next_id = 1u32;

        for (step, op) in ops.into_iter().enumerate() {
            match op {
                Op::Insert(len) => {
                    let bytes = content(next_id, len, 0);
                    c.insert_id(next_id, &bytes).unwrap();
                    model.insert(next_id, bytes);
                    next_id += 1;
                }
                Op::Remove(i) if !model.is_empty() => {
                    let id = *model.keys().nth(i % model.len()).unwrap();
                    c.remove(id).unwrap();
                    model.remove(&id);
                }
                Op::Replace(i, len) if !model.is_empty() => {
                    let id = *model.keys().nth(i % model.len()).unwrap();
                    let bytes = content(id, len, step as u8);
                    c.replace(id, &bytes).unwrap();
                    model.insert(id, bytes);
                }
                Op::Flush => c.flush().unwrap(),
                _ => {}
            }
            prop_assert!(c.check_layout().is_ok(), "{:?}", c.check_layout());
        }

        let bytes = c.close().unwrap().into_inner();
        let mut back = Container::open(
            Cursor::new(bytes),
            OpenOptions::read_only().generation(Generation::RedAlert),
        ).unwrap();
        if checksummed {
            prop_assert_eq!(back.integrity(), Integrity::Verified);
        }
        prop_assert_eq!(back.len(), model.len());
        for (id, bytes) in &model {
            prop_assert_eq!(&back.extract(*id).unwrap(), bytes);
        }
    }

    #[test]
    fn prop_reopen_preserves_ids(names in prop::collection::btree_set("[a-z]{1,8}\\.(shp|aud|ini)", 1..20)) {
        let mut c = Container::create(Cursor::new(Vec::new()), Generation::TiberianSun, Protection::None).unwrap();
        let mut ids = Vec::new();
        for name in &names {
            ids.push((c.insert(name, name.as_bytes()).unwrap(), name.clone()));
        }
        c.write_name_table().unwrap();
        let bytes = c.close().unwrap().into_inner();

        let mut back = Container::open(Cursor::new(bytes), OpenOptions::read_only()).unwrap();
        prop_assert_eq!(back.generation(), Generation::TiberianSun);
        for (id, name) in ids {
            prop_assert_eq!(back.name_of(id), Some(name.as_str()));
            prop_assert_eq!(back.extract(id).unwrap(), name.into_bytes());
        }
    }
}
