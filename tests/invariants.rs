//! Property-style invariant suites: randomized edits checked against a
//! reference model, iterator round-trips, structural neutrality of splits
//! and merges, partial-iterator reconstruction and back-pointer soundness.

mod common;

use std::collections::BTreeMap;

use common::*;
use cowtree::extent::Extent;
use cowtree::trans::GetExtentResult;
use cowtree::tree::with_btree;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

#[test]
fn randomized_edits_match_reference_model() {
    let cache = setup();
    let mut model: BTreeMap<u64, TestValue> = BTreeMap::new();
    let mut rng = StdRng::seed_from_u64(0xC0DE_7EE_u64);

    for round in 0..400 {
        let key = rng.gen_range(0..200u64) * 5;
        if rng.gen_bool(0.6) || model.is_empty() {
            let value = val(key.wrapping_add(round));
            let ((), _) = with_tree(&cache, |tree, c| {
                let (_, inserted) = tree.insert(c, key, value)?;
                assert_eq!(inserted, !model.contains_key(&key));
                Ok(())
            });
            model.entry(key).or_insert(value);
        } else {
            let present = model.remove(&key).is_some();
            let ((), _) = with_tree(&cache, |tree, c| {
                let iter = tree.lower_bound(c, key)?;
                if !iter.is_end() && iter.get_key() == key {
                    assert!(present);
                    tree.remove(c, iter)?;
                } else {
                    assert!(!present);
                }
                Ok(())
            });
        }

        if round % 25 == 0 {
            let expected: Vec<_> = model.iter().map(|(k, v)| (*k, *v)).collect();
            assert_eq!(collect_entries(&cache), expected);
        }
    }

    let expected: Vec<_> = model.iter().map(|(k, v)| (*k, *v)).collect();
    assert_eq!(collect_entries(&cache), expected);

    with_tree_weak(&cache, |tree, c| tree.check_parent_trackers(c));
}

#[test]
fn node_ranges_partition_the_key_space() {
    let cache = setup();
    insert_all(&cache, (0..60).map(|i| i * 7));

    let root = tree_root(&cache);
    let nodes = visit_nodes(&cache);

    // Exactly one node sits at the root depth, spanning from key zero.
    let roots: Vec<_> = nodes.iter().filter(|n| n.3 == root.depth()).collect();
    assert_eq!(roots.len(), 1);
    assert_eq!(roots[0].1, 0);

    // Leaves are visited in order and tile the key space from MIN.
    let leaf_begins: Vec<u64> = nodes
        .iter()
        .filter(|n| n.3 == 1)
        .map(|n| n.1)
        .collect();
    assert!(!leaf_begins.is_empty());
    assert_eq!(leaf_begins[0], 0);
    assert!(leaf_begins.windows(2).all(|w| w[0] < w[1]));

    // Every level between leaf and root is present.
    for depth in 1..=root.depth() {
        assert!(nodes.iter().any(|n| n.3 == depth), "missing depth {depth}");
    }
}

#[test]
fn iteration_round_trip() {
    let cache = setup();
    let keys: Vec<u64> = (0..45).map(|i| i * 11).collect();
    insert_all(&cache, keys.iter().copied());

    with_tree_weak(&cache, |tree, c| {
        // Forward: begin to end, ascending, exactly once.
        let mut forward = Vec::new();
        let mut iter = tree.begin(c)?;
        assert!(iter.is_begin());
        while !iter.is_end() {
            forward.push(iter.get_key());
            iter = iter.next(c)?;
        }
        assert_eq!(forward, keys);
        assert!(tree.end(c)?.is_end());

        // Backward from the end, descending.
        let mut backward = Vec::new();
        let mut iter = tree.end(c)?;
        while !iter.is_begin() {
            iter = iter.prev(c)?;
            backward.push(iter.get_key());
        }
        backward.reverse();
        assert_eq!(backward, keys);

        // lower_bound is monotonic under next.
        let iter = tree.lower_bound(c, 57)?;
        assert_eq!(iter.get_key(), 66);
        assert_eq!(iter.next(c)?.get_key(), 77);

        // upper_bound skips an exact match.
        assert_eq!(tree.upper_bound(c, 66)?.get_key(), 77);
        Ok(())
    });
}

#[test]
fn insert_is_idempotent() {
    let cache = setup();
    insert_all(&cache, (0..30).map(|i| i * 2));

    let before_entries = collect_entries(&cache);
    let before_nodes = visit_nodes(&cache);

    let ((), stats) = with_tree(&cache, |tree, c| {
        let (iter, inserted) = tree.insert(c, 20, val_len(123, 9))?;
        assert!(!inserted);
        assert_eq!(iter.get_key(), 20);
        Ok(())
    });
    assert_eq!(stats.num_inserts, 0);
    assert_eq!(stats.extents_num_delta, 0);

    assert_eq!(collect_entries(&cache), before_entries);
    assert_eq!(visit_nodes(&cache), before_nodes);
}

#[test]
fn remove_inverts_insert() {
    // A leaf with slack: the insert/remove pair must not change structure,
    // so the whole tree (entries and node ranges) returns to its prior
    // state.
    let cache = setup();
    insert_all(&cache, [0, 10, 20]);

    let before_entries = collect_entries(&cache);
    let ranges = |cache: &_| -> Vec<(u64, u8)> {
        visit_nodes(cache).iter().map(|n| (n.1, n.3)).collect()
    };
    let before_ranges = ranges(&cache);

    with_tree(&cache, |tree, c| {
        let (_, inserted) = tree.insert(c, 15, val(15))?;
        assert!(inserted);
        Ok(())
    });
    assert_ne!(collect_entries(&cache), before_entries);

    remove_key(&cache, 15);

    assert_eq!(collect_entries(&cache), before_entries);
    assert_eq!(ranges(&cache), before_ranges);
}

#[test]
fn structural_mutations_preserve_the_entry_sequence() {
    let cache = setup();
    let mut rng = StdRng::seed_from_u64(42);

    let mut keys: Vec<u64> = (0..80).map(|i| i * 3).collect();
    for i in (1..keys.len()).rev() {
        let j = rng.gen_range(0..=i);
        keys.swap(i, j);
    }
    insert_all(&cache, keys.iter().copied());

    let mut live: Vec<u64> = keys.clone();
    live.sort_unstable();
    assert_eq!(collect_keys(&cache), live);
    assert!(tree_root(&cache).depth() >= 3);

    // Remove in insertion order; the observable sequence stays sorted and
    // complete through every split and merge.
    for key in keys {
        remove_key(&cache, key);
        live.retain(|k| *k != key);
        assert_eq!(collect_keys(&cache), live);
    }
    assert_eq!(tree_root(&cache).depth(), 1);
}

#[test]
fn update_changes_value_without_structure() {
    let cache = setup();
    insert_all(&cache, (0..20).map(|i| i * 4));

    let before_nodes = visit_nodes(&cache);
    let ((), stats) = with_tree(&cache, |tree, c| {
        let iter = tree.lower_bound(c, 32)?;
        assert_eq!(iter.get_key(), 32);
        let iter = tree.update(c, iter, val_len(777, 3))?;
        assert_eq!(iter.get_val(), val_len(777, 3));
        Ok(())
    });
    assert_eq!(stats.num_updates, 1);
    assert_eq!(stats.extents_num_delta, 0);

    with_tree_weak(&cache, |tree, c| {
        assert_eq!(tree.lower_bound(c, 32)?.get_val(), val_len(777, 3));
        Ok(())
    });
    // Same node set: updates are value-only.
    let after: Vec<_> = visit_nodes(&cache).iter().map(|n| (n.1, n.3)).collect();
    let before: Vec<_> = before_nodes.iter().map(|n| (n.1, n.3)).collect();
    assert_eq!(after, before);
}

#[test]
fn partial_iterator_reconstructs_ancestors() {
    let cache = setup();
    let keys: Vec<u64> = (0..36).map(|i| i * 2).collect();
    insert_all(&cache, keys.iter().copied());
    assert!(tree_root(&cache).depth() >= 2);

    with_tree_weak(&cache, |tree, c| {
        let full = tree.lower_bound(c, 30)?;
        let leaf = full.get_leaf_node();
        let pos = full.get_leaf_pos();

        // Rebuild the position bottom-up from the bare leaf.
        let partial = tree.make_partial_iter(c, leaf.clone(), 30, pos);
        assert_eq!(partial.get_key(), 30);
        assert_eq!(partial.get_val(), val(30));

        // Walking backward over the leaf edge forces ancestor population
        // through the parent back-reference.
        let prev = partial.prev(c)?;
        assert_eq!(prev.get_key(), 28);

        // Walking forward to the end crosses every remaining leaf.
        let mut iter = partial;
        let mut seen = vec![iter.get_key()];
        while {
            iter = iter.next(c)?;
            !iter.is_end()
        } {
            seen.push(iter.get_key());
        }
        let expected: Vec<u64> = keys.iter().copied().filter(|k| *k >= 30).collect();
        assert_eq!(seen, expected);
        Ok(())
    });
}

#[test]
fn cursor_goes_stale_on_modification() {
    let cache = setup();
    insert_all(&cache, [1, 2, 3]);

    with_tree(&cache, |tree, c| {
        // First update pulls the leaf into this transaction's write set;
        // the cursor then pins the mutable instance.
        let iter = tree.lower_bound(c, 2)?;
        let iter = tree.update(c, iter, val_len(9, 9))?;
        let cursor = iter.get_cursor();
        assert_eq!(cursor.key, 2);
        assert_eq!(cursor.val, Some(val_len(9, 9)));
        assert!(!cursor.is_stale());

        tree.update(c, iter, val_len(10, 10))?;
        assert!(cursor.is_stale());
        Ok(())
    });
}

#[test]
fn eviction_rehydrates_through_checksum_verification() {
    let cache = setup();
    let keys: Vec<u64> = (0..50).map(|i| i * 13).collect();
    insert_all(&cache, keys.iter().copied());

    cache.evict_clean();
    assert_eq!(cache.loaded_extents(), 0);

    // Every node reloads from the device: checksum checks, range asserts
    // and parent/child re-linking all run on this path.
    assert_eq!(collect_keys(&cache), keys);
    assert!(cache.loaded_extents() > 0);
    with_tree_weak(&cache, |tree, c| tree.check_parent_trackers(c));
}

#[test]
fn back_pointers_stay_sound_during_mutation() {
    let cache = setup();
    insert_all(&cache, (0..40).map(|i| i * 6));

    // Pending duplicates and fresh split outputs in the same transaction.
    let ((), _) = with_tree(&cache, |tree, c| {
        for key in [7u64, 13, 19, 23, 29] {
            tree.insert(c, key, val(key))?;
        }
        tree.check_parent_trackers(c)?;
        Ok(())
    });

    with_tree_weak(&cache, |tree, c| tree.check_parent_trackers(c));
}

#[test]
fn transaction_write_set_is_observable() {
    let cache = setup();
    insert_all(&cache, [100]);

    let ((), _) = with_tree(&cache, |tree, c| {
        let (iter, inserted) = tree.insert(c, 200, val(200))?;
        assert!(inserted);

        // The mutated leaf is a member of this transaction's write set.
        let leaf = iter.get_leaf_node();
        assert!(leaf.is_mutable());
        assert!(matches!(
            c.trans.get_extent(leaf.paddr()),
            GetExtentResult::Present(_)
        ));
        assert!(matches!(
            c.trans.get_extent(cowtree::Paddr::new(0xDEAD_0000)),
            GetExtentResult::Absent
        ));
        Ok(())
    });
}

#[test]
fn dropped_transaction_leaves_no_trace() {
    let cache = setup();
    insert_all(&cache, [1, 2, 3]);
    let before_entries = collect_entries(&cache);
    let before_extents = cache.committed_extents();

    {
        let mut trans = cache.begin();
        with_btree::<SmallTreeSpec, _>(&cache, &mut trans, |tree, c| {
            for key in 10..30 {
                tree.insert(c, key, val(key))?;
            }
            Ok(())
        })
        .unwrap();
        // trans dropped without commit: cancellation.
    }

    assert_eq!(collect_entries(&cache), before_entries);
    assert_eq!(cache.committed_extents(), before_extents);
}
