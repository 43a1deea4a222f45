//! Shared fixture for the tree integration suites: a small-node tree
//! specification (fanout 4 leaves / 6 internal slots) so structural
//! mutations trigger with few keys, plus setup and bulk-edit helpers.

#![allow(dead_code)]

use cowtree::extent::cache::ExtentCache;
use cowtree::extent::{ExtentKind, Paddr, TreeId};
use cowtree::tree::{with_btree, FixedKvTree, NodeValue};
use cowtree::trans::{OpContext, TreeStats};
use cowtree::PhyTreeRoot;
use eyre::Result;

pub use cowtree::tree::TreeSpec;

/// Test payload: an opaque blob plus a length that feeds
/// `upper_bound_right` coverage checks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TestValue {
    pub blob: u64,
    pub len: u32,
}

impl NodeValue for TestValue {
    const ENCODED_LEN: usize = 12;

    fn encode_into(&self, out: &mut [u8]) {
        out[..8].copy_from_slice(&self.blob.to_le_bytes());
        out[8..12].copy_from_slice(&self.len.to_le_bytes());
    }

    fn decode_from(buf: &[u8]) -> TestValue {
        TestValue {
            blob: u64::from_le_bytes(buf[..8].try_into().unwrap()),
            len: u32::from_le_bytes(buf[8..12].try_into().unwrap()),
        }
    }

    fn extent_len(&self) -> u32 {
        self.len
    }
}

/// 128-byte nodes: (128 - 32) / 20 = 4 leaf entries,
/// (128 - 32) / 16 = 6 internal slots. Deep trees with a handful of keys.
pub struct SmallTreeSpec;

impl TreeSpec for SmallTreeSpec {
    type Key = u64;
    type Value = TestValue;

    const TREE_ID: TreeId = TreeId::Lba;
    const INTERNAL_KIND: ExtentKind = ExtentKind::LbaInternal;
    const LEAF_KIND: ExtentKind = ExtentKind::LbaLeaf;
    const NODE_SIZE: u32 = 128;
    const LEAF_HAS_CHILDREN: bool = false;
}

pub type TestBtree = FixedKvTree<SmallTreeSpec>;

pub const LEAF_CAPACITY: usize = 4;
pub const INTERNAL_CAPACITY: usize = 6;

pub fn val(n: u64) -> TestValue {
    TestValue { blob: n.wrapping_mul(31), len: 1 }
}

pub fn val_len(n: u64, len: u32) -> TestValue {
    TestValue { blob: n, len }
}

/// A formatted store with an initialized (empty) test tree.
pub fn setup() -> ExtentCache {
    let cache = ExtentCache::new();
    cache.mkfs().unwrap();

    let mut trans = cache.begin();
    with_btree::<SmallTreeSpec, _>(&cache, &mut trans, |_tree, c| {
        TestBtree::mkfs(c)?;
        Ok(())
    })
    .unwrap();
    cache.commit(trans).unwrap();
    cache
}

/// Run `f` in a fresh transaction, commit, and return its result along
/// with the transaction's tree statistics.
pub fn with_tree<R>(
    cache: &ExtentCache,
    f: impl FnOnce(&mut TestBtree, &mut OpContext<'_>) -> Result<R>,
) -> (R, TreeStats) {
    let mut trans = cache.begin();
    let ret = with_btree::<SmallTreeSpec, _>(cache, &mut trans, f).unwrap();
    let stats = *trans.stats(TreeId::Lba);
    cache.commit(trans).unwrap();
    (ret, stats)
}

/// Run `f` in a weak (read-only) transaction without committing.
pub fn with_tree_weak<R>(
    cache: &ExtentCache,
    f: impl FnOnce(&mut TestBtree, &mut OpContext<'_>) -> Result<R>,
) -> R {
    let mut trans = cache.begin_weak();
    with_btree::<SmallTreeSpec, _>(cache, &mut trans, f).unwrap()
}

pub fn insert_all(cache: &ExtentCache, keys: impl IntoIterator<Item = u64>) {
    for key in keys {
        let ((), stats) = with_tree(cache, |tree, c| {
            let (_, inserted) = tree.insert(c, key, val(key))?;
            assert!(inserted, "key {key} already present");
            Ok(())
        });
        assert_eq!(stats.num_inserts, 1);
    }
}

pub fn remove_key(cache: &ExtentCache, key: u64) -> TreeStats {
    let ((), stats) = with_tree(cache, |tree, c| {
        let iter = tree.lower_bound(c, key)?;
        assert!(!iter.is_end() && iter.get_key() == key, "key {key} not present");
        tree.remove(c, iter)?;
        Ok(())
    });
    stats
}

/// All entries in key order, via begin-to-end iteration.
pub fn collect_entries(cache: &ExtentCache) -> Vec<(u64, TestValue)> {
    with_tree_weak(cache, |tree, c| {
        let mut out = Vec::new();
        let mut iter = tree.begin(c)?;
        while !iter.is_end() {
            out.push((iter.get_key(), iter.get_val()));
            iter = iter.next(c)?;
        }
        Ok(out)
    })
}

pub fn collect_keys(cache: &ExtentCache) -> Vec<u64> {
    collect_entries(cache).into_iter().map(|(k, _)| k).collect()
}

pub fn tree_root(cache: &ExtentCache) -> PhyTreeRoot {
    with_tree_weak(cache, |tree, _c| Ok(tree.root()))
}

/// Every node of the live tree as reported by the mapped-space visitor:
/// `(paddr, begin, length, depth, kind)`.
pub fn visit_nodes(cache: &ExtentCache) -> Vec<(Paddr, u64, u32, u8, ExtentKind)> {
    with_tree_weak(cache, |tree, c| {
        let mut nodes = Vec::new();
        tree.walk(c, &mut |paddr, begin, len, depth, kind| {
            nodes.push((paddr, begin, len, depth, kind));
        })?;
        Ok(nodes)
    })
}
