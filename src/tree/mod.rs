//! # Copy-on-Write B+Tree Engine
//!
//! This module implements the transactional B+tree at the core of the
//! object store. The tree maps fixed-size keys to fixed-size values and is
//! instantiated twice: as the logical-to-physical address map and as the
//! back-reference map.
//!
//! ## Architecture Overview
//!
//! ```text
//!                 RootBlock (paddr 0)
//!                 { location, depth } per tree
//!                        │
//!                 [Internal depth 3]        range [MIN, MAX)
//!                 /        |       \
//!        [Internal]   [Internal]  [Internal]   depth 2
//!        /   |   \       ...
//!   [Leaf] [Leaf] [Leaf]                       depth 1, key→value
//! ```
//!
//! Every node is a cache-managed extent. The committed tree is immutable;
//! a transaction mutates transaction-local duplicates (`duplicate_for_write`)
//! and freshly allocated nodes, and the cache installs them at commit.
//! Structural mutations (split, merge, root growth/collapse) always build
//! replacement nodes and retire the originals.
//!
//! ## Lookup Engine
//!
//! All positioning goes through one descent routine, `lookup`, driven by
//! two caller-supplied slot selectors (one for internal nodes, one for
//! leaves). `lower_bound`, `upper_bound`, `upper_bound_right`, `begin` and
//! `end` are thin selector wrappers. Descent fetches children through the
//! parent's atomic loaded-or-reserve protocol so that no stable extent is
//! ever materialized twice.
//!
//! ## Mutation Engine
//!
//! - `insert` normalizes the caller's hint with `find_insertion` (which may
//!   park the iterator past-the-end of a preceding leaf, deliberately
//!   violating the slot-range invariant; see `iter`), splits full nodes
//!   from the lowest non-full level downward, then journals the entry.
//! - `remove` deletes the entry and merges under-full nodes upward,
//!   rebalancing against a sibling donor or fully merging with it, and
//!   collapses the root when it is left with a single child.
//!
//! ## Liveness & Rewrite
//!
//! Garbage collection asks the tree whether an out-of-band cached node is
//! still referenced (`init_cached_extent`, `get_leaf_if_live`,
//! `get_internal_if_live`) and relocates live nodes with `rewrite_extent`,
//! which repoints the parent pivot (or the root block) at the new address
//! via `update_internal_mapping`.
//!
//! ## Drivers
//!
//! `with_btree` materializes a tree handle over the transaction's current
//! root block and runs a caller-supplied body against it; `with_btree_state`
//! additionally threads a state value through and returns it.

use std::marker::PhantomData;
use std::sync::Arc;

use eyre::Result;
use tracing::{debug, error, trace};

use crate::config::{INIT_GENERATION, MAX_DEPTH};
use crate::extent::cache::ExtentCache;
use crate::extent::root_block::{PhyTreeRoot, RootBlock};
use crate::extent::{cast, try_cast, Extent, ExtentKind, ExtentRef, Paddr, PlacementHint};
use crate::trans::{OpContext, Transaction};

pub mod internal;
pub mod iter;
pub mod leaf;
pub mod node;

pub use internal::{ChildLookup, InternalNode};
pub use iter::{TreeCursor, TreeIter};
pub use leaf::LeafNode;
pub use node::{ChildPos, NodeKey, NodeMeta, NodeValue, TreeSpec};

use iter::NodePosition;
use node::BtreeNode;

/// Mapped-space visitor: invoked per node visited during descent and per
/// leaf crossed by boundary advancement, with
/// `(paddr, begin_key, length, depth, kind)`. Drives GC scans and
/// invariant checks.
pub type Visitor<'a, S> =
    &'a mut dyn FnMut(Paddr, <S as TreeSpec>::Key, u32, u8, ExtentKind);

/// Reborrow an optional visitor for a nested call.
pub(crate) fn reborrow<'s, 'b: 's, S: TreeSpec>(
    v: &'s mut Option<Visitor<'b, S>>,
) -> Option<Visitor<'s, S>> {
    match v {
        Some(x) => Some(&mut **x),
        None => None,
    }
}

/// A per-transaction handle over one tree of the shared root block.
pub struct FixedKvTree<S: TreeSpec> {
    root_block: Arc<RootBlock>,
    _spec: PhantomData<S>,
}

impl<S: TreeSpec> FixedKvTree<S> {
    pub fn new(root_block: Arc<RootBlock>) -> FixedKvTree<S> {
        FixedKvTree { root_block, _spec: PhantomData }
    }

    /// This tree's root slot as currently seen by the transaction.
    pub fn root(&self) -> PhyTreeRoot {
        self.root_block.tree_root(S::TREE_ID)
    }

    pub fn root_block(&self) -> &Arc<RootBlock> {
        &self.root_block
    }

    /// Initialize this tree: a single empty leaf spanning the whole key
    /// space. The root block must not already carry a root for it.
    pub fn mkfs(c: &mut OpContext<'_>) -> Result<PhyTreeRoot> {
        let root_block = c.cache.get_root(c.trans)?;
        let root_block = c.cache.duplicate_root_for_write(c.trans, &root_block);
        assert!(
            !root_block.tree_root(S::TREE_ID).is_initialized(),
            "mkfs on an initialized tree"
        );

        let leaf = c.cache.alloc_new_non_data_extent::<LeafNode<S>>(
            c.trans,
            S::NODE_SIZE,
            PlacementHint::Hot,
            INIT_GENERATION,
        );
        leaf.set_range(NodeMeta::new(S::Key::MIN, S::Key::MAX, 1));

        let stats = c.trans.stats_mut(S::TREE_ID);
        stats.depth = 1;
        stats.extents_num_delta += 1;

        let root = PhyTreeRoot::new(leaf.paddr(), 1);
        root_block.update_tree_root(S::TREE_ID, |r| *r = root);
        let leaf_ref: ExtentRef = leaf.clone();
        root_block.link_root_node(S::TREE_ID, &leaf_ref);
        leaf.set_parent_node(None);
        leaf.info().set_linked(true);

        debug!(location = %root.location(), "tree mkfs complete");
        Ok(root)
    }

    /// Build a partial iterator around a leaf recovered out-of-band
    /// (cursor rehydration, liveness filtering). Ancestors populate lazily.
    pub fn make_partial_iter(
        &self,
        c: &mut OpContext<'_>,
        leaf: Arc<LeafNode<S>>,
        key: S::Key,
        pos: u16,
    ) -> TreeIter<S> {
        assert!(leaf.is_valid());
        {
            let leaf_ref: ExtentRef = leaf.clone();
            assert!(c.trans.is_weak() || c.trans.is_viewable(&leaf_ref));
        }

        let depth = self.root().depth();
        let mut ret = TreeIter::new(depth, true);
        ret.leaf.node = Some(leaf);
        ret.leaf.pos = pos;
        if ret.is_end() {
            assert!(key == S::Key::MAX);
        } else {
            assert!(key == ret.get_key());
        }
        ret
    }

    /// Least iterator with key >= `key`.
    pub fn lower_bound(&self, c: &mut OpContext<'_>, key: S::Key) -> Result<TreeIter<S>> {
        self.lower_bound_with(c, key, None, 1)
    }

    /// `lower_bound` with a mapped-space visitor and a stop depth.
    /// `min_depth > 1` leaves deeper levels unpopulated (used by
    /// `update_internal_mapping`).
    pub fn lower_bound_with(
        &self,
        c: &mut OpContext<'_>,
        key: S::Key,
        visitor: Option<Visitor<'_, S>>,
        min_depth: u8,
    ) -> Result<TreeIter<S>> {
        let iter = self.lookup(
            c,
            move |internal: &InternalNode<S>| {
                assert!(internal.len() > 0);
                let ub = internal.upper_bound(key);
                // The rightmost pivot <= key; underflow means the target
                // sits below this subtree's range.
                assert!(ub != 0, "impossible: lookup target below subtree range");
                ub - 1
            },
            move |leaf: &LeafNode<S>| leaf.lower_bound(key),
            min_depth,
            visitor,
        )?;
        trace!(pos = iter.leaf.pos, "lower_bound positioned");
        #[cfg(debug_assertions)]
        if min_depth == 1 {
            iter.assert_valid();
        }
        Ok(iter)
    }

    /// Least iterator with key > `key`.
    pub fn upper_bound(&self, c: &mut OpContext<'_>, key: S::Key) -> Result<TreeIter<S>> {
        let iter = self.lower_bound(c, key)?;
        if !iter.is_end() && iter.get_key() == key {
            iter.next(c)
        } else {
            Ok(iter)
        }
    }

    /// Least iterator `i` such that `i.key + i.val.len > key`: the
    /// predecessor of `lower_bound(key)` when its mapping still covers
    /// `key`, else `lower_bound(key)` itself.
    pub fn upper_bound_right(
        &self,
        c: &mut OpContext<'_>,
        key: S::Key,
    ) -> Result<TreeIter<S>> {
        let iter = self.lower_bound(c, key)?;
        if iter.is_begin() {
            return Ok(iter);
        }
        let prev = iter.prev(c)?;
        if prev.get_key().add_offset(prev.get_val().extent_len()) > key {
            Ok(prev)
        } else {
            Ok(iter)
        }
    }

    pub fn begin(&self, c: &mut OpContext<'_>) -> Result<TreeIter<S>> {
        self.lower_bound(c, S::Key::MIN)
    }

    pub fn end(&self, c: &mut OpContext<'_>) -> Result<TreeIter<S>> {
        self.upper_bound(c, S::Key::MAX)
    }

    /// Insert `(key, val)` positioning from scratch.
    ///
    /// Returns the iterator at the entry and whether it was inserted;
    /// `false` means an entry with this key already existed and nothing
    /// changed. Invalidates all outstanding iterators of this transaction.
    pub fn insert(
        &mut self,
        c: &mut OpContext<'_>,
        key: S::Key,
        val: S::Value,
    ) -> Result<(TreeIter<S>, bool)> {
        let iter = self.lower_bound(c, key)?;
        self.insert_at(c, iter, key, val)
    }

    /// Insert `(key, val)` with `iter` as a positioning hint
    /// (`lower_bound(key)` or the result of a neighboring operation).
    pub fn insert_at(
        &mut self,
        c: &mut OpContext<'_>,
        iter: TreeIter<S>,
        key: S::Key,
        val: S::Value,
    ) -> Result<(TreeIter<S>, bool)> {
        trace!(?key, "insert");
        let mut ret = iter;
        find_insertion(c, key, &mut ret)?;
        if !ret.at_boundary() && ret.get_key() == key {
            return Ok((ret, false));
        }

        c.trans.stats_mut(S::TREE_ID).num_inserts += 1;
        self.handle_split(c, &mut ret)?;

        if !ret.leaf.node().is_mutable() {
            let leaf_ref: ExtentRef = ret.leaf.node().clone();
            let mutable = c.cache.duplicate_for_write(c.trans, &leaf_ref);
            ret.leaf.node = Some(cast::<LeafNode<S>>(&mutable));
        }

        let pos = ret.leaf.pos as usize;
        {
            let leaf = ret.leaf.node();
            assert_eq!(pos, leaf.lower_bound(key));
            assert!(pos == leaf.len() || leaf.key_at(pos) > key);
            assert!(leaf.meta().contains(key));
            leaf.insert(pos, key, val);
        }
        Ok((ret, true))
    }

    /// Overwrite the value at `iter` (must not be end). Does not alter
    /// structure. Invalidates all outstanding iterators of this
    /// transaction.
    pub fn update(
        &mut self,
        c: &mut OpContext<'_>,
        iter: TreeIter<S>,
        val: S::Value,
    ) -> Result<TreeIter<S>> {
        assert!(!iter.is_end());
        trace!(key = ?iter.get_key(), "update");
        let mut ret = iter;
        if !ret.leaf.node().is_mutable() {
            let leaf_ref: ExtentRef = ret.leaf.node().clone();
            let mutable = c.cache.duplicate_for_write(c.trans, &leaf_ref);
            ret.leaf.node = Some(cast::<LeafNode<S>>(&mutable));
        }
        c.trans.stats_mut(S::TREE_ID).num_updates += 1;
        ret.leaf.node().update(ret.leaf.pos as usize, val);
        Ok(ret)
    }

    /// Remove the entry at `iter` (must not be end). May merge nodes up
    /// the tree and collapse the root. Invalidates all outstanding
    /// iterators of this transaction.
    pub fn remove(&mut self, c: &mut OpContext<'_>, iter: TreeIter<S>) -> Result<TreeIter<S>> {
        assert!(!iter.is_end());
        trace!(key = ?iter.get_key(), "remove");
        c.trans.stats_mut(S::TREE_ID).num_erases += 1;

        let mut ret = iter;
        if !ret.leaf.node().is_mutable() {
            let leaf_ref: ExtentRef = ret.leaf.node().clone();
            let mutable = c.cache.duplicate_for_write(c.trans, &leaf_ref);
            ret.leaf.node = Some(cast::<LeafNode<S>>(&mutable));
        }
        ret.leaf.node().remove(ret.leaf.pos as usize);

        self.handle_merge(c, &mut ret)?;

        if ret.is_end() {
            if ret.is_begin() {
                // Empty single-leaf tree; the caller observes end.
                assert!(ret.leaf.node().meta().is_root());
            } else {
                ret.handle_boundary(c, None)?;
            }
        }
        Ok(ret)
    }

    /// Whether `e` is still part of the live tree. Called when the cache
    /// rehydrates a non-logical extent; extents of unrelated kinds are
    /// vacuously live.
    pub fn init_cached_extent(
        &self,
        c: &mut OpContext<'_>,
        e: &ExtentRef,
    ) -> Result<bool> {
        if e.kind() == S::INTERNAL_KIND {
            let eint = cast::<InternalNode<S>>(e);
            let iter = self.lower_bound(c, eint.meta().begin)?;
            // Valid even if iter is at end.
            let cand_depth = eint.meta().depth;
            let live = cand_depth >= 2
                && cand_depth <= iter.get_depth()
                && Arc::ptr_eq(iter.get_internal(cand_depth).node(), &eint);
            trace!(paddr = %e.paddr(), live, "init_cached_extent internal");
            Ok(live)
        } else if e.kind() == S::LEAF_KIND {
            let eleaf = cast::<LeafNode<S>>(e);
            let iter = self.lower_bound(c, eleaf.meta().begin)?;
            let live = Arc::ptr_eq(iter.leaf.node(), &eleaf);
            trace!(paddr = %e.paddr(), live, "init_cached_extent leaf");
            Ok(live)
        } else {
            trace!(paddr = %e.paddr(), kind = ?e.kind(), "init_cached_extent other kind");
            Ok(true)
        }
    }

    /// The leaf at `key` if and only if the live tree maps it at `addr`.
    pub fn get_leaf_if_live(
        &self,
        c: &mut OpContext<'_>,
        addr: Paddr,
        key: S::Key,
        len: u32,
    ) -> Result<Option<ExtentRef>> {
        let iter = self.lower_bound(c, key)?;
        let leaf = iter.leaf.node();
        if leaf.paddr() == addr {
            trace!(%addr, ?key, len, "leaf is live");
            let leaf_ref: ExtentRef = leaf.clone();
            Ok(Some(leaf_ref))
        } else {
            trace!(%addr, ?key, len, found = %leaf.paddr(), "leaf is not live");
            Ok(None)
        }
    }

    /// The internal node at `key` if and only if the live tree contains
    /// it at `addr`.
    pub fn get_internal_if_live(
        &self,
        c: &mut OpContext<'_>,
        addr: Paddr,
        key: S::Key,
        len: u32,
    ) -> Result<Option<ExtentRef>> {
        let iter = self.lower_bound(c, key)?;
        for depth in 2..=iter.get_depth() {
            let node = iter.get_internal(depth).node();
            if node.paddr() == addr {
                trace!(%addr, ?key, len, "internal is live");
                assert_eq!(node.meta().begin, key);
                let node_ref: ExtentRef = node.clone();
                return Ok(Some(node_ref));
            }
        }
        trace!(%addr, ?key, len, "internal is not live");
        Ok(None)
    }

    /// Relocate `e`: allocate a fresh copy at a new physical address,
    /// repoint the referencing pivot (or the root block) and retire the
    /// original.
    pub fn rewrite_extent(&mut self, c: &mut OpContext<'_>, e: &ExtentRef) -> Result<()> {
        if e.kind() == S::INTERNAL_KIND {
            let old = cast::<InternalNode<S>>(e);
            self.do_rewrite(c, old)
        } else {
            assert_eq!(e.kind(), S::LEAF_KIND);
            let old = cast::<LeafNode<S>>(e);
            self.do_rewrite(c, old)
        }
    }

    fn do_rewrite<N: BtreeNode<S>>(
        &mut self,
        c: &mut OpContext<'_>,
        old: Arc<N>,
    ) -> Result<()> {
        let fresh = c.cache.alloc_new_non_data_extent::<N>(
            c.trans,
            old.length(),
            PlacementHint::Rewrite,
            old.info().generation() + 1,
        );
        fresh.rewrite_from(&old);
        trace!(from = %old.paddr(), to = %fresh.paddr(), "rewriting extent");

        let meta = fresh.meta();
        let fresh_ref: ExtentRef = fresh.clone();
        self.update_internal_mapping(
            c,
            meta.depth,
            meta.begin,
            old.paddr(),
            fresh.paddr(),
            &fresh_ref,
        )?;
        let old_ref: ExtentRef = old.clone();
        c.cache.retire_extent(c.trans, &old_ref);
        Ok(())
    }

    /// Repoint the parent pivot of the node spanning `[key, ..)` at
    /// `depth` from `old_addr` to `new_addr`. For `depth == tree depth`
    /// this updates the root block instead; `key` must then be `K::MIN`.
    pub fn update_internal_mapping(
        &mut self,
        c: &mut OpContext<'_>,
        depth: u8,
        key: S::Key,
        old_addr: Paddr,
        new_addr: Paddr,
        nextent: &ExtentRef,
    ) -> Result<()> {
        trace!(?key, depth, %old_addr, %new_addr, "update_internal_mapping");
        let iter = self.lower_bound_with(c, key, None, depth + 1)?;
        assert!(iter.get_depth() >= depth);

        if depth == iter.get_depth() {
            trace!("update at root");
            if key != S::Key::MIN {
                error!(?key, depth, "root mapping update with non-minimal key");
                panic!("impossible: root mapping update with non-minimal key");
            }
            if self.root().location() != old_addr {
                error!(
                    expected = %old_addr,
                    actual = %self.root().location(),
                    "root mapping update with mismatched address"
                );
                panic!("impossible: root mapping update with mismatched address");
            }
            self.root_block = c.cache.duplicate_root_for_write(c.trans, &self.root_block);
            self.root_block
                .update_tree_root(S::TREE_ID, |r| r.set_location(new_addr));
            self.set_root_node(nextent);
        } else {
            let entry = iter.get_internal(depth + 1);
            let parent = entry.node().clone();
            let ppos = entry.pos as usize;
            assert!(ppos < parent.len());

            if parent.key_at(ppos) != key {
                error!(
                    ?key,
                    pivot = ?parent.key_at(ppos),
                    "pivot key mismatch in mapping update"
                );
                panic!("impossible: pivot key mismatch in mapping update");
            }
            if parent.val_at(ppos) != old_addr {
                error!(
                    expected = %old_addr,
                    actual = %parent.val_at(ppos),
                    "pivot address mismatch in mapping update"
                );
                panic!("impossible: pivot address mismatch in mapping update");
            }

            let parent = if parent.is_mutable() {
                parent
            } else {
                let parent_ref: ExtentRef = parent.clone();
                let mutable = c.cache.duplicate_for_write(c.trans, &parent_ref);
                cast::<InternalNode<S>>(&mutable)
            };
            parent.update(ppos, new_addr, Some(nextent));
            // iter is now stale (neither the parent entry nor the child
            // pointer were refreshed); it is dropped here.
        }
        Ok(())
    }

    /// Full-tree scan from `begin` to `end`, driving the mapped-space
    /// visitor over every node on the way.
    pub fn walk(
        &self,
        c: &mut OpContext<'_>,
        visitor: &mut dyn FnMut(Paddr, S::Key, u32, u8, ExtentKind),
    ) -> Result<()> {
        let mut iter = self.lower_bound_with(c, S::Key::MIN, Some(&mut *visitor), 1)?;
        while !iter.is_end() {
            iter = iter.next_with(c, Some(&mut *visitor))?;
        }
        Ok(())
    }

    /// Verify back-pointer soundness over the loaded extent graph: every
    /// loaded child's parent tracker points at its tracking node or at
    /// that node's stable projection.
    pub fn check_parent_trackers(&self, c: &mut OpContext<'_>) -> Result<()> {
        if self.root().depth() > 1 {
            let root = self.get_root_node(c)?;
            self.check_tracked_children(&cast::<InternalNode<S>>(&root));
        }
        Ok(())
    }

    fn check_tracked_children(&self, node: &Arc<InternalNode<S>>) {
        for pos in 0..node.len() {
            let Some(child) = node.loaded_child(pos) else {
                continue;
            };
            if !child.is_valid() {
                continue;
            }

            let peek = if child.kind() == S::LEAF_KIND {
                cast::<LeafNode<S>>(&child).peek_parent()
            } else if child.kind() == S::INTERNAL_KIND {
                cast::<InternalNode<S>>(&child).peek_parent()
            } else {
                continue;
            };
            if let Some(parent) = peek {
                let sound = Arc::ptr_eq(&parent, node)
                    || (node.is_mutation_pending()
                        && Arc::ptr_eq(&parent, &node.get_stable_for_key(node.key_at(pos))));
                assert!(sound, "child parent tracker points at a foreign node");
            }

            if child.kind() == S::INTERNAL_KIND {
                self.check_tracked_children(&cast::<InternalNode<S>>(&child));
            }
        }
    }

    /// Link `node` as this tree's root node on the current root block.
    fn set_root_node(&self, node: &ExtentRef) {
        self.root_block.link_root_node(S::TREE_ID, node);
        if let Some(leaf) = try_cast::<LeafNode<S>>(node) {
            leaf.set_parent_node(None);
        } else if let Some(internal) = try_cast::<InternalNode<S>>(node) {
            internal.set_parent_node(None);
        }
        node.info().set_linked(true);
    }

    /// Resolve the root node through the root block: the already-loaded
    /// node via the link when possible, else a device fetch that links it.
    fn get_root_node(&self, c: &mut OpContext<'_>) -> Result<ExtentRef> {
        let root = self.root();
        assert!(root.is_initialized(), "lookup on an uninitialized tree");

        if let Some(node) = self.root_block.root_node(S::TREE_ID) {
            if node.is_valid() {
                return Ok(match c.trans.pending_extent(node.paddr()) {
                    Some(pending) => pending,
                    None => node,
                });
            }
        }

        if root.depth() > 1 {
            let node = get_internal_node::<S>(
                c,
                root.depth(),
                root.location(),
                S::Key::MIN,
                S::Key::MAX,
                None,
            )?;
            let node_ref: ExtentRef = node;
            Ok(node_ref)
        } else {
            let node = get_leaf_node::<S>(c, root.location(), S::Key::MIN, S::Key::MAX, None)?;
            let node_ref: ExtentRef = node;
            Ok(node_ref)
        }
    }

    fn lookup_root(
        &self,
        c: &mut OpContext<'_>,
        iter: &mut TreeIter<S>,
        visitor: Option<Visitor<'_, S>>,
    ) -> Result<()> {
        trace!(depth = self.root().depth(), "looking up root");
        let root_node = self.get_root_node(c)?;
        let depth = self.root().depth();

        if depth > 1 {
            let node = cast::<InternalNode<S>>(&root_node);
            if let Some(v) = visitor {
                v(node.paddr(), node.meta().begin, node.length(), depth, S::INTERNAL_KIND);
            }
            iter.get_internal_mut(depth).node = Some(node);
        } else {
            let node = cast::<LeafNode<S>>(&root_node);
            if let Some(v) = visitor {
                v(node.paddr(), node.meta().begin, node.length(), depth, S::LEAF_KIND);
            }
            iter.leaf.node = Some(node);
        }
        Ok(())
    }

    /// Root-to-leaf descent driven by the slot selectors `li` (internal
    /// levels) and `ll` (leaf level), stopping at `min_depth`.
    fn lookup(
        &self,
        c: &mut OpContext<'_>,
        li: impl Fn(&InternalNode<S>) -> usize,
        ll: impl Fn(&LeafNode<S>) -> usize,
        min_depth: u8,
        mut visitor: Option<Visitor<'_, S>>,
    ) -> Result<TreeIter<S>> {
        assert!(min_depth >= 1);
        let depth = self.root().depth();
        let mut iter = TreeIter::new(depth, false);

        self.lookup_root(c, &mut iter, reborrow::<S>(&mut visitor))?;
        if iter.get_depth() > 1 {
            let root_entry = iter.internal.last_mut().expect("missing root entry");
            root_entry.pos = li(root_entry.node()) as u16;
        } else {
            iter.leaf.pos = ll(iter.leaf.node()) as u16;
        }
        trace!(depth, "got root");

        lookup_depth_range(
            c,
            &mut iter,
            depth - 1,
            min_depth - 1,
            &li,
            &ll,
            reborrow::<S>(&mut visitor),
        )?;

        // Only update_internal_mapping stops above the leaf level; a
        // boundary there is resolved by the caller's semantics, not here.
        if min_depth == 1 && iter.at_boundary() {
            iter.handle_boundary(c, reborrow::<S>(&mut visitor))?;
        }
        Ok(iter)
    }

    /// Split full nodes along `iter`'s path, from the lowest non-full
    /// level down to the leaf, growing the root when every level is full.
    fn handle_split(&mut self, c: &mut OpContext<'_>, iter: &mut TreeIter<S>) -> Result<()> {
        let mut split_from = iter.check_split(c)?;
        trace!(split_from, depth = iter.get_depth(), "handle_split");

        if split_from == iter.get_depth() {
            #[cfg(debug_assertions)]
            assert!(iter.is_full());
            let new_depth = iter.get_depth() + 1;
            assert!(new_depth <= MAX_DEPTH, "tree depth overflow");

            let nroot = c.cache.alloc_new_non_data_extent::<InternalNode<S>>(
                c.trans,
                S::NODE_SIZE,
                PlacementHint::Hot,
                INIT_GENERATION,
            );
            nroot.set_range(NodeMeta::new(S::Key::MIN, S::Key::MAX, new_depth));
            let old_root = self
                .root_block
                .root_node(S::TREE_ID)
                .filter(|n| n.is_valid());
            nroot.insert(0, S::Key::MIN, self.root().location(), old_root.as_ref());
            iter.internal.push(NodePosition { node: Some(nroot.clone()), pos: 0 });

            let stats = c.trans.stats_mut(S::TREE_ID);
            stats.depth = new_depth;
            stats.extents_num_delta += 1;

            self.root_block = c.cache.duplicate_root_for_write(c.trans, &self.root_block);
            self.root_block.update_tree_root(S::TREE_ID, |r| {
                r.set_location(nroot.paddr());
                r.set_depth(new_depth);
            });
            let nroot_ref: ExtentRef = nroot.clone();
            self.set_root_node(&nroot_ref);
            debug!(new_depth, "root grown");
        }

        while split_from > 0 {
            let parent_entry = iter.get_internal(split_from + 1).clone();
            if !parent_entry.node().is_mutable() {
                let parent_ref: ExtentRef = parent_entry.node().clone();
                let mutable = c.cache.duplicate_for_write(c.trans, &parent_ref);
                iter.get_internal_mut(split_from + 1).node =
                    Some(cast::<InternalNode<S>>(&mutable));
            }
            let parent = iter.get_internal(split_from + 1).node().clone();
            let ppos = parent_entry.pos as usize;

            if split_from > 1 {
                let pos_entry = iter.get_internal(split_from).clone();
                trace!(
                    node = %pos_entry.node().paddr(),
                    depth = split_from,
                    "splitting internal node"
                );
                let (left, right) = split_level(c, &parent, ppos, pos_entry.node())?;

                let entry = iter.get_internal_mut(split_from);
                if (pos_entry.pos as usize) < left.len() {
                    entry.node = Some(left);
                    entry.pos = pos_entry.pos;
                } else {
                    entry.pos = pos_entry.pos - left.len() as u16;
                    entry.node = Some(right);
                    iter.get_internal_mut(split_from + 1).pos += 1;
                }
            } else {
                let pos_entry = iter.leaf.clone();
                trace!(node = %pos_entry.node().paddr(), "splitting leaf");
                let (left, right) = split_level(c, &parent, ppos, pos_entry.node())?;

                /* right.meta().begin == pivot == right's first key. Thus,
                 * if pos == left.len(), iter must stay on left with pos at
                 * the end rather than move to right with pos 0: the
                 * insertion is to the left of right's first element and
                 * thus necessarily below right's range. */
                if (pos_entry.pos as usize) <= left.len() {
                    iter.leaf.node = Some(left);
                    iter.leaf.pos = pos_entry.pos;
                } else {
                    iter.leaf.pos = pos_entry.pos - left.len() as u16;
                    iter.leaf.node = Some(right);
                    iter.get_internal_mut(split_from + 1).pos += 1;
                }
            }
            split_from -= 1;
        }
        Ok(())
    }

    /// Merge under-full nodes upward from the leaf, collapsing the root
    /// when it is left with a single child.
    fn handle_merge(&mut self, c: &mut OpContext<'_>, iter: &mut TreeIter<S>) -> Result<()> {
        if iter.get_depth() == 1 || !BtreeNode::below_min_capacity(&**iter.leaf.node()) {
            trace!(
                leaf_len = iter.leaf.node().len(),
                depth = iter.get_depth(),
                "no need to merge leaf"
            );
            return Ok(());
        }

        let mut to_merge: u8 = 1;
        loop {
            trace!(depth = to_merge, "merging");
            iter.ensure_internal(c, to_merge + 1)?;

            if to_merge > 1 {
                let mut parent_pos = iter.get_internal(to_merge + 1).clone();
                let mut pos = iter.get_internal(to_merge).clone();
                merge_level(c, to_merge, &mut parent_pos, &mut pos)?;
                *iter.get_internal_mut(to_merge + 1) = parent_pos;
                *iter.get_internal_mut(to_merge) = pos;
            } else {
                let mut parent_pos = iter.get_internal(2).clone();
                let mut pos = iter.leaf.clone();
                merge_level(c, to_merge, &mut parent_pos, &mut pos)?;
                *iter.get_internal_mut(2) = parent_pos;
                iter.leaf = pos;
            }

            to_merge += 1;
            let node = iter.get_internal(to_merge).node().clone();
            if to_merge == iter.get_depth() {
                #[cfg(debug_assertions)]
                assert!(iter.is_full());
                if node.len() == 1 {
                    debug!("collapsing root");
                    assert_eq!(iter.get_internal(to_merge).pos, 0);
                    let child_addr = node.val_at(0).maybe_relative_to(node.paddr());
                    let node_ref: ExtentRef = node.clone();
                    c.cache.retire_extent(c.trans, &node_ref);
                    iter.internal.pop();

                    let new_depth = iter.get_depth();
                    let stats = c.trans.stats_mut(S::TREE_ID);
                    stats.depth = new_depth;
                    stats.extents_num_delta -= 1;

                    self.root_block =
                        c.cache.duplicate_root_for_write(c.trans, &self.root_block);
                    self.root_block.update_tree_root(S::TREE_ID, |r| {
                        r.set_location(child_addr);
                        r.set_depth(new_depth);
                    });
                    if new_depth > 1 {
                        let top: ExtentRef = iter.get_internal(new_depth).node().clone();
                        self.set_root_node(&top);
                    } else {
                        let top: ExtentRef = iter.leaf.node().clone();
                        self.set_root_node(&top);
                    }
                } else {
                    trace!("no need to collapse root");
                }
                return Ok(());
            } else if node.below_min_capacity() {
                trace!(depth = to_merge, "next node below min, continuing");
            } else {
                trace!(depth = to_merge, "next node not below min, complete");
                return Ok(());
            }
        }
    }
}

/// Normalize an insertion hint to the exact insertion slot for `key`.
///
/// Afterwards the iterator points where `key` belongs, possibly at the
/// past-the-end slot of a leaf other than the last one. That position
/// deliberately violates the slot-range invariant; the insertion and
/// split paths depend on it.
fn find_insertion<S: TreeSpec>(
    c: &mut OpContext<'_>,
    key: S::Key,
    iter: &mut TreeIter<S>,
) -> Result<()> {
    assert!(iter.is_end() || iter.get_key() >= key);
    if !iter.is_end() && iter.get_key() == key {
        return Ok(());
    }
    if iter.leaf.node().meta().begin <= key {
        #[cfg(debug_assertions)]
        {
            if iter.leaf.pos > 0 {
                let mut p = iter.clone();
                p.leaf.pos -= 1;
                assert!(p.get_key() < key);
            }
        }
        return Ok(());
    }

    assert_eq!(iter.leaf.pos, 0);
    let mut p = iter.prev(c)?;
    assert!(p.leaf.node().meta().begin <= key);
    assert!(p.get_key() < key);
    p.leaf.pos += 1;
    assert!(p.at_boundary());
    *iter = p;
    Ok(())
}

/// Split `node` under `parent` slot `ppos` into two fresh children,
/// repointing the parent and retiring the original.
fn split_level<S: TreeSpec, N: BtreeNode<S>>(
    c: &mut OpContext<'_>,
    parent: &Arc<InternalNode<S>>,
    ppos: usize,
    node: &Arc<N>,
) -> Result<(Arc<N>, Arc<N>)> {
    let (left, right, pivot) = node.make_split_children(c);

    let left_ref: ExtentRef = left.clone();
    parent.update(ppos, left.paddr(), Some(&left_ref));
    let right_ref: ExtentRef = right.clone();
    parent.insert(ppos + 1, pivot, right.paddr(), Some(&right_ref));

    trace!(
        node = %node.paddr(),
        left = %left.paddr(),
        right = %right.paddr(),
        "split node"
    );
    let node_ref: ExtentRef = node.clone();
    c.cache.retire_extent(c.trans, &node_ref);
    c.trans.stats_mut(S::TREE_ID).extents_num_delta += 1;
    Ok((left, right))
}

/// Merge or rebalance the node in `pos` with a sibling donor under
/// `parent_pos`, translating both positions to the replacements.
fn merge_level<S: TreeSpec, N: BtreeNode<S>>(
    c: &mut OpContext<'_>,
    depth: u8,
    parent_pos: &mut NodePosition<InternalNode<S>>,
    pos: &mut NodePosition<N>,
) -> Result<()> {
    if !parent_pos.node().is_mutable() {
        let parent_ref: ExtentRef = parent_pos.node().clone();
        let mutable = c.cache.duplicate_for_write(c.trans, &parent_ref);
        parent_pos.node = Some(cast::<InternalNode<S>>(&mutable));
    }
    let parent = parent_pos.node().clone();
    let piter = parent_pos.pos as usize;
    assert!(piter < parent.len());
    assert!(parent.len() >= 2, "merge under a single-entry parent");

    // Donor is the right sibling unless this is the last slot.
    let donor_is_left = piter + 1 == parent.len();
    let donor_pos = if donor_is_left { piter - 1 } else { piter + 1 };
    let begin = parent.key_at(donor_pos);
    let end = parent.end_of_slot(donor_pos);

    trace!(parent = %parent.paddr(), node = %pos.node().paddr(), donor_is_left, "merge_level");

    let donor: Arc<N> = match parent.get_child(c.trans, donor_pos) {
        ChildLookup::Loaded(ext) => cast::<N>(&ext),
        ChildLookup::Pos(child_pos) => {
            let addr = parent.val_at(donor_pos).maybe_relative_to(parent.paddr());
            N::fetch(c, depth, addr, begin, end, Some(child_pos))?
        }
    };
    assert_eq!(donor.meta().begin, begin);
    if donor_is_left {
        assert_eq!(donor.meta().end, pos.node().meta().begin);
    } else {
        assert_eq!(donor.meta().begin, pos.node().meta().end);
    }

    let (l, r, liter, riter) = if donor_is_left {
        (donor.clone(), pos.node().clone(), donor_pos, piter)
    } else {
        (pos.node().clone(), donor.clone(), piter, donor_pos)
    };

    if donor.at_min_capacity() {
        let l_len = l.len();
        let replacement = l.make_full_merge(c, &r);

        let repl_ref: ExtentRef = replacement.clone();
        parent.update(liter, replacement.paddr(), Some(&repl_ref));
        parent.remove(riter);

        pos.node = Some(replacement);
        if donor_is_left {
            pos.pos += l_len as u16;
            parent_pos.pos -= 1;
        }

        trace!(left = %l.paddr(), right = %r.paddr(), "full merge");
        let l_ref: ExtentRef = l.clone();
        c.cache.retire_extent(c.trans, &l_ref);
        let r_ref: ExtentRef = r.clone();
        c.cache.retire_extent(c.trans, &r_ref);
        c.trans.stats_mut(S::TREE_ID).extents_num_delta -= 1;
    } else {
        let l_len = l.len();
        let pivot_idx = l.balance_pivot_idx(&r);
        let (repl_l, repl_r, pivot) = l.make_balanced(c, &r, pivot_idx);

        let repl_l_ref: ExtentRef = repl_l.clone();
        parent.update(liter, repl_l.paddr(), Some(&repl_l_ref));
        let repl_r_ref: ExtentRef = repl_r.clone();
        parent.replace(riter, pivot, repl_r.paddr(), Some(&repl_r_ref));

        if donor_is_left {
            assert!(parent_pos.pos > 0);
            parent_pos.pos -= 1;
        }

        let orig_position = if donor_is_left {
            l_len + pos.pos as usize
        } else {
            pos.pos as usize
        };
        if orig_position < repl_l.len() {
            pos.node = Some(repl_l);
            pos.pos = orig_position as u16;
        } else {
            parent_pos.pos += 1;
            pos.pos = (orig_position - repl_l.len()) as u16;
            pos.node = Some(repl_r);
        }

        trace!(left = %l.paddr(), right = %r.paddr(), "balanced merge");
        let l_ref: ExtentRef = l.clone();
        c.cache.retire_extent(c.trans, &l_ref);
        let r_ref: ExtentRef = r.clone();
        c.cache.retire_extent(c.trans, &r_ref);
    }
    Ok(())
}

/// Descend depths `(to, from]`, selecting a slot per level with `li`/`ll`
/// and fetching children through the loaded-or-reserve protocol. May
/// leave the iterator at a boundary; callers run `handle_boundary` before
/// returning control out of the engine.
pub(crate) fn lookup_depth_range<S: TreeSpec>(
    c: &mut OpContext<'_>,
    iter: &mut TreeIter<S>,
    from: u8,
    to: u8,
    li: &dyn Fn(&InternalNode<S>) -> usize,
    ll: &dyn Fn(&LeafNode<S>) -> usize,
    mut visitor: Option<Visitor<'_, S>>,
) -> Result<()> {
    trace!(from, to, "lookup_depth_range");
    let mut depth = from;
    while depth > to {
        if depth > 1 {
            lookup_internal_level(c, depth, iter, li, reborrow::<S>(&mut visitor))?;
        } else {
            lookup_leaf(c, iter, ll, reborrow::<S>(&mut visitor))?;
        }
        depth -= 1;
    }
    Ok(())
}

fn lookup_internal_level<S: TreeSpec>(
    c: &mut OpContext<'_>,
    depth: u8,
    iter: &mut TreeIter<S>,
    li: &dyn Fn(&InternalNode<S>) -> usize,
    visitor: Option<Visitor<'_, S>>,
) -> Result<()> {
    assert!(depth > 1);
    let (parent, ppos) = {
        let entry = iter.get_internal(depth + 1);
        (entry.node().clone(), entry.pos as usize)
    };
    let key = parent.key_at(ppos);

    let node = match parent.get_child(c.trans, ppos) {
        ChildLookup::Loaded(ext) => {
            trace!(parent = %parent.paddr(), pos = ppos, "got loaded child");
            let node = cast::<InternalNode<S>>(&ext);
            assert_eq!(node.meta().begin, key);
            assert!(node.meta().end > key);
            node
        }
        ChildLookup::Pos(child_pos) => {
            let begin = key;
            let end = parent.end_of_slot(ppos);
            let addr = parent.val_at(ppos).maybe_relative_to(parent.paddr());
            get_internal_node::<S>(c, depth, addr, begin, end, Some(child_pos))?
        }
    };

    let pos = li(&node);
    assert!(pos < node.len());
    if let Some(v) = visitor {
        v(node.paddr(), node.meta().begin, node.length(), depth, S::INTERNAL_KIND);
    }
    let entry = iter.get_internal_mut(depth);
    entry.node = Some(node);
    entry.pos = pos as u16;
    Ok(())
}

fn lookup_leaf<S: TreeSpec>(
    c: &mut OpContext<'_>,
    iter: &mut TreeIter<S>,
    ll: &dyn Fn(&LeafNode<S>) -> usize,
    visitor: Option<Visitor<'_, S>>,
) -> Result<()> {
    let (parent, ppos) = {
        let entry = iter.get_internal(2);
        (entry.node().clone(), entry.pos as usize)
    };
    let key = parent.key_at(ppos);

    let node = match parent.get_child(c.trans, ppos) {
        ChildLookup::Loaded(ext) => {
            trace!(parent = %parent.paddr(), pos = ppos, "got loaded leaf");
            let node = cast::<LeafNode<S>>(&ext);
            assert_eq!(node.meta().begin, key);
            assert!(node.meta().end > key);
            node
        }
        ChildLookup::Pos(child_pos) => {
            let begin = key;
            let end = parent.end_of_slot(ppos);
            let addr = parent.val_at(ppos).maybe_relative_to(parent.paddr());
            get_leaf_node::<S>(c, addr, begin, end, Some(child_pos))?
        }
    };

    let pos = ll(&node);
    if let Some(v) = visitor {
        v(node.paddr(), node.meta().begin, node.length(), 1, S::LEAF_KIND);
    }
    iter.leaf.node = Some(node);
    iter.leaf.pos = pos as u16;
    Ok(())
}

/// Load the internal node at `offset`, initializing its range and links on
/// first materialization and asserting checksum consistency.
pub(crate) fn get_internal_node<S: TreeSpec>(
    c: &mut OpContext<'_>,
    depth: u8,
    offset: Paddr,
    begin: S::Key,
    end: S::Key,
    parent_pos: Option<ChildPos<S>>,
) -> Result<Arc<InternalNode<S>>> {
    trace!(%offset, depth, ?begin, ?end, "reading internal node");
    assert!(depth > 1);

    // Root loads link through the stable root block when the current one
    // is mutation-pending; resolve the target up front.
    let root_link = match parent_pos {
        None => {
            let root_block = c.cache.get_root_fast(c.trans);
            Some(if root_block.is_mutation_pending() {
                let prior = root_block
                    .prior_instance()
                    .expect("pending root block without prior");
                cast::<RootBlock>(&prior)
            } else {
                root_block
            })
        }
        Some(_) => None,
    };

    let meta = NodeMeta::new(begin, end, depth);
    let init = |node: &Arc<InternalNode<S>>| {
        node.set_range(meta);
        match (&parent_pos, &root_link) {
            (Some(child_pos), _) => {
                let node_ref: ExtentRef = node.clone();
                child_pos.parent.link_child(&node_ref, child_pos.pos);
            }
            (None, Some(root_block)) => {
                assert!(node.meta().is_root());
                let node_ref: ExtentRef = node.clone();
                root_block.link_root_node(S::TREE_ID, &node_ref);
                node.set_parent_node(None);
                node.info().set_linked(true);
            }
            (None, None) => unreachable!(),
        }
    };

    let node = c
        .cache
        .get_absent_extent::<InternalNode<S>>(c.trans, offset, S::NODE_SIZE, &init)?;

    if node.in_extent_checksum() != node.last_committed_crc() {
        error!(
            recorded = node.in_extent_checksum(),
            actual = node.last_committed_crc(),
            "internal extent checksum inconsistent"
        );
        panic!("impossible: internal extent checksum inconsistent");
    }
    // Re-initialize a stable instance whose links were dropped; happens
    // during init_cached_extent and GC rewrites of rehydrated extents.
    if node.is_stable() && !node.is_linked() {
        init(&node);
    }

    let node_meta = node.meta();
    if node.len() > 0 {
        assert!(node_meta.begin <= node.key_at(0));
        assert!(node_meta.end > node.key_at(node.len() - 1));
    }
    assert_eq!(depth, node_meta.depth);
    assert_eq!(begin, node_meta.begin);
    assert_eq!(end, node_meta.end);
    Ok(node)
}

/// Load the leaf node at `offset`; see [`get_internal_node`].
pub(crate) fn get_leaf_node<S: TreeSpec>(
    c: &mut OpContext<'_>,
    offset: Paddr,
    begin: S::Key,
    end: S::Key,
    parent_pos: Option<ChildPos<S>>,
) -> Result<Arc<LeafNode<S>>> {
    trace!(%offset, ?begin, ?end, "reading leaf node");

    let root_link = match parent_pos {
        None => {
            let root_block = c.cache.get_root_fast(c.trans);
            Some(if root_block.is_mutation_pending() {
                let prior = root_block
                    .prior_instance()
                    .expect("pending root block without prior");
                cast::<RootBlock>(&prior)
            } else {
                root_block
            })
        }
        Some(_) => None,
    };

    let meta = NodeMeta::new(begin, end, 1);
    let init = |node: &Arc<LeafNode<S>>| {
        node.set_range(meta);
        match (&parent_pos, &root_link) {
            (Some(child_pos), _) => {
                let node_ref: ExtentRef = node.clone();
                child_pos.parent.link_child(&node_ref, child_pos.pos);
            }
            (None, Some(root_block)) => {
                assert!(node.meta().is_root());
                let node_ref: ExtentRef = node.clone();
                root_block.link_root_node(S::TREE_ID, &node_ref);
                node.set_parent_node(None);
                node.info().set_linked(true);
            }
            (None, None) => unreachable!(),
        }
    };

    let node = c
        .cache
        .get_absent_extent::<LeafNode<S>>(c.trans, offset, S::NODE_SIZE, &init)?;

    if node.in_extent_checksum() != node.last_committed_crc() {
        error!(
            recorded = node.in_extent_checksum(),
            actual = node.last_committed_crc(),
            "leaf extent checksum inconsistent"
        );
        panic!("impossible: leaf extent checksum inconsistent");
    }
    if node.is_stable() && !node.is_linked() {
        init(&node);
    }

    let node_meta = node.meta();
    if node.len() > 0 {
        assert!(node_meta.begin <= node.key_at(0));
        assert!(node_meta.end > node.key_at(node.len() - 1));
    }
    assert_eq!(1, node_meta.depth);
    assert_eq!(begin, node_meta.begin);
    assert_eq!(end, node_meta.end);
    Ok(node)
}

/// Materialize a tree handle around the transaction's current root block
/// and run `f` against it.
pub fn with_btree<S: TreeSpec, R>(
    cache: &ExtentCache,
    trans: &mut Transaction,
    f: impl FnOnce(&mut FixedKvTree<S>, &mut OpContext<'_>) -> Result<R>,
) -> Result<R> {
    let mut c = OpContext::new(cache, trans);
    let root_block = c.cache.get_root(c.trans)?;
    let mut tree = FixedKvTree::<S>::new(root_block);
    f(&mut tree, &mut c)
}

/// [`with_btree`] threading a state value through the body and returning
/// it.
pub fn with_btree_state<S: TreeSpec, State>(
    cache: &ExtentCache,
    trans: &mut Transaction,
    init: State,
    f: impl FnOnce(&mut FixedKvTree<S>, &mut OpContext<'_>, &mut State) -> Result<()>,
) -> Result<State> {
    let mut state = init;
    with_btree::<S, ()>(cache, trans, |tree, c| f(tree, c, &mut state))?;
    Ok(state)
}
