//! # Tree Iterators
//!
//! A [`TreeIter`] is a positioned root-to-leaf path: a leaf slot plus a
//! stack of ancestor slots, one per internal level. It comes in two modes:
//!
//! - **Full**: every ancestor slot is populated and consistent; `next` and
//!   `prev` navigate without re-descending from the root.
//! - **Partial**: only the leaf slot is populated. Partial iterators are
//!   built bottom-up from a leaf recovered out-of-band (liveness checks,
//!   cursor rehydration); ancestor slots are populated lazily on demand by
//!   [`TreeIter::ensure_internal`], which follows the leaf's parent
//!   back-reference instead of re-reading the path from the root.
//!
//! Debug builds track the mode explicitly and validate the populated
//! prefix on every navigation; release builds elide the tag.
//!
//! ## Boundary States
//!
//! `leaf_pos == leaf.len()` is the *boundary* state. It is transient: a
//! navigation that lands on it runs `handle_boundary`, which climbs to the
//! nearest ancestor with a successor slot and re-descends to the left-most
//! leaf of the next subtree, or, if no ancestor can advance, parks the
//! iterator as the true end. The only place a boundary position survives
//! without being the end is the insertion path: `find_insertion` parks the
//! iterator past-the-end of a preceding leaf on purpose, and the split
//! walk preserves that position. Do not normalize it away.

use std::sync::Arc;

use eyre::Result;
use smallvec::SmallVec;

use crate::tree::node::NodeValue;
use tracing::trace;

use crate::config::MAX_DEPTH;
use crate::extent::{Extent, ExtentRef};
use crate::trans::OpContext;

use super::internal::InternalNode;
use super::leaf::LeafNode;
use super::node::{BtreeNode, NodeKey, TreeSpec};

pub(crate) const INVALID_POS: u16 = u16::MAX;
const MAX_ANCESTORS: usize = (MAX_DEPTH - 1) as usize;

/// One slot of an iterator path: a node handle and a position within it.
pub(crate) struct NodePosition<N> {
    pub(crate) node: Option<Arc<N>>,
    pub(crate) pos: u16,
}

impl<N> NodePosition<N> {
    pub(crate) fn reset(&mut self) {
        self.node = None;
        self.pos = INVALID_POS;
    }

    pub(crate) fn node(&self) -> &Arc<N> {
        self.node.as_ref().expect("unpopulated iterator slot")
    }

    pub(crate) fn is_populated(&self) -> bool {
        self.node.is_some()
    }
}

impl<N> Default for NodePosition<N> {
    fn default() -> Self {
        NodePosition { node: None, pos: INVALID_POS }
    }
}

impl<N> Clone for NodePosition<N> {
    fn clone(&self) -> Self {
        NodePosition { node: self.node.clone(), pos: self.pos }
    }
}

#[cfg(debug_assertions)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum IterState {
    Partial,
    Full,
}

/// A positioned path from the root to a leaf slot.
pub struct TreeIter<S: TreeSpec> {
    /// Ancestor slots, index 0 at depth 2, rising to the root.
    pub(crate) internal: SmallVec<[NodePosition<InternalNode<S>>; MAX_ANCESTORS]>,
    pub(crate) leaf: NodePosition<LeafNode<S>>,
    #[cfg(debug_assertions)]
    pub(crate) state: IterState,
}

impl<S: TreeSpec> Clone for TreeIter<S> {
    fn clone(&self) -> Self {
        TreeIter {
            internal: self.internal.clone(),
            leaf: self.leaf.clone(),
            #[cfg(debug_assertions)]
            state: self.state,
        }
    }
}

impl<S: TreeSpec> TreeIter<S> {
    pub(crate) fn new(depth: u8, partial: bool) -> TreeIter<S> {
        assert!((1..=MAX_DEPTH).contains(&depth));
        let mut internal = SmallVec::new();
        internal.resize_with((depth - 1) as usize, NodePosition::default);
        #[cfg(not(debug_assertions))]
        let _ = partial;
        TreeIter {
            internal,
            leaf: NodePosition::default(),
            #[cfg(debug_assertions)]
            state: if partial && depth > 1 {
                IterState::Partial
            } else {
                IterState::Full
            },
        }
    }

    #[cfg(debug_assertions)]
    pub(crate) fn is_partial(&self) -> bool {
        self.state == IterState::Partial
    }

    #[cfg(debug_assertions)]
    pub(crate) fn is_full(&self) -> bool {
        self.state == IterState::Full
    }

    pub fn get_depth(&self) -> u8 {
        self.internal.len() as u8 + 1
    }

    pub(crate) fn get_internal(&self, depth: u8) -> &NodePosition<InternalNode<S>> {
        assert!(depth > 1);
        &self.internal[(depth - 2) as usize]
    }

    pub(crate) fn get_internal_mut(&mut self, depth: u8) -> &mut NodePosition<InternalNode<S>> {
        assert!(depth > 1);
        &mut self.internal[(depth - 2) as usize]
    }

    /// Key at the current position. Defined only when not at end.
    pub fn get_key(&self) -> S::Key {
        assert!(!self.is_end());
        self.leaf.node().key_at(self.leaf.pos as usize)
    }

    /// Value at the current position, with any relative physical address
    /// materialized against the owning leaf's paddr.
    pub fn get_val(&self) -> S::Value {
        assert!(!self.is_end());
        let leaf = self.leaf.node();
        self.leaf
            .node()
            .val_at(self.leaf.pos as usize)
            .maybe_relative_to(leaf.paddr())
    }

    /// External callers only observe a boundary position when it is the
    /// true end.
    pub fn is_end(&self) -> bool {
        self.at_boundary()
    }

    pub fn is_begin(&self) -> bool {
        self.leaf.pos == 0 && self.leaf.node().meta().begin == S::Key::MIN
    }

    pub(crate) fn at_boundary(&self) -> bool {
        let len = self.leaf.node().len();
        assert!(self.leaf.pos as usize <= len);
        self.leaf.pos as usize == len
    }

    pub fn get_leaf_node(&self) -> Arc<LeafNode<S>> {
        self.leaf.node().clone()
    }

    pub fn get_leaf_pos(&self) -> u16 {
        self.leaf.pos
    }

    /// The successor iterator. Must not be at end.
    pub fn next(&self, c: &mut OpContext<'_>) -> Result<TreeIter<S>> {
        self.next_with(c, None)
    }

    pub(crate) fn next_with(
        &self,
        c: &mut OpContext<'_>,
        visitor: Option<super::Visitor<'_, S>>,
    ) -> Result<TreeIter<S>> {
        #[cfg(debug_assertions)]
        self.assert_valid();
        assert!(!self.is_end());

        let mut ret = self.clone();
        ret.leaf.pos += 1;
        if ret.at_boundary() {
            ret.handle_boundary(c, visitor)?;
        }
        Ok(ret)
    }

    /// The predecessor iterator. Must not be at begin.
    pub fn prev(&self, c: &mut OpContext<'_>) -> Result<TreeIter<S>> {
        #[cfg(debug_assertions)]
        self.assert_valid();
        assert!(!self.is_begin());

        let mut ret = self.clone();
        if ret.leaf.pos > 0 {
            ret.leaf.pos -= 1;
            return Ok(ret);
        }

        let depth_with_space =
            ret.ensure_internal_bottom_up(c, 2, |it, d| it.get_internal(d).pos > 0)?;
        // Cannot walk past the root: that would mean begin().
        assert!(depth_with_space <= ret.get_depth());

        for depth in 2..depth_with_space {
            ret.get_internal_mut(depth).reset();
        }
        ret.leaf.reset();
        ret.get_internal_mut(depth_with_space).pos -= 1;
        // Descending to right-most slots cannot land on a boundary.
        super::lookup_depth_range(
            c,
            &mut ret,
            depth_with_space - 1,
            0,
            &|n: &InternalNode<S>| n.len() - 1,
            &|l: &LeafNode<S>| l.len() - 1,
            None,
        )?;
        assert!(!ret.at_boundary());
        Ok(ret)
    }

    /// Populate the ancestor slot at `depth` from the child's parent
    /// back-reference. Idempotent.
    pub(crate) fn ensure_internal(&mut self, c: &mut OpContext<'_>, depth: u8) -> Result<()> {
        assert!(depth > 1);
        assert!(((depth - 2) as usize) < self.internal.len());

        // Read and write must not be concurrent in the same transaction,
        // otherwise the nodes tracked here can become outdated unexpectedly.
        if self.get_internal(depth).is_populated() {
            let node = self.get_internal(depth).node();
            assert!(node.is_valid());
            let as_ref: ExtentRef = node.clone();
            assert!(c.trans.is_weak() || c.trans.is_viewable(&as_ref));
            return Ok(());
        }

        let (child_meta, parent) = if depth == 2 {
            let leaf = self.leaf.node();
            (leaf.meta(), leaf.get_parent_node(c.trans))
        } else {
            let child = self.get_internal(depth - 1).node();
            (child.meta(), child.get_parent_node(c.trans))
        };

        assert!(parent.is_valid());
        assert!(parent.meta().is_parent_of(&child_meta));
        {
            let as_ref: ExtentRef = parent.clone();
            assert!(c.trans.is_weak() || c.trans.is_viewable(&as_ref));
        }

        let ub = parent.upper_bound(child_meta.begin);
        assert!(ub != 0, "child range begins below its parent's range");
        let pos = (ub - 1) as u16;
        trace!(
            parent = %parent.paddr(),
            pos,
            depth,
            "found parent for partial iter"
        );

        let entry = self.get_internal_mut(depth);
        entry.node = Some(parent);
        entry.pos = pos;

        #[cfg(debug_assertions)]
        if (depth - 1) as usize == self.internal.len() {
            self.state = IterState::Full;
        }
        Ok(())
    }

    /// Populate ancestors from `start_from` upward until `stop` returns
    /// true at a populated depth; returns that depth. Walking past the
    /// root returns `get_depth() + 1`.
    pub(crate) fn ensure_internal_bottom_up(
        &mut self,
        c: &mut OpContext<'_>,
        start_from: u8,
        stop: impl Fn(&TreeIter<S>, u8) -> bool,
    ) -> Result<u8> {
        let mut depth = start_from;
        loop {
            if depth > self.get_depth() {
                return Ok(depth);
            }
            self.ensure_internal(c, depth)?;
            if stop(self, depth) {
                return Ok(depth);
            }
            depth += 1;
        }
    }

    /// Resolve a boundary position: advance to the left-most slot of the
    /// successor subtree, or stay parked as the true end.
    pub(crate) fn handle_boundary(
        &mut self,
        c: &mut OpContext<'_>,
        visitor: Option<super::Visitor<'_, S>>,
    ) -> Result<()> {
        assert!(self.at_boundary());

        let depth_with_space = self.ensure_internal_bottom_up(c, 2, |it, d| {
            let entry = it.get_internal(d);
            (entry.pos as usize + 1) < entry.node().len()
        })?;

        if depth_with_space <= self.get_depth() {
            for depth in 2..depth_with_space {
                self.get_internal_mut(depth).reset();
            }
            self.leaf.reset();
            self.get_internal_mut(depth_with_space).pos += 1;
            // Descending to left-most slots cannot land on a boundary.
            super::lookup_depth_range(
                c,
                self,
                depth_with_space - 1,
                0,
                &|_: &InternalNode<S>| 0,
                &|_: &LeafNode<S>| 0,
                visitor,
            )?;
        }
        // else: true end; the boundary position is the final state.
        Ok(())
    }

    /// Scan upward for the first level that is not at max capacity.
    /// Returns the depth to split from; `get_depth()` means the root
    /// itself is full and must grow.
    pub(crate) fn check_split(&mut self, c: &mut OpContext<'_>) -> Result<u8> {
        if !BtreeNode::at_max_capacity(&**self.leaf.node()) {
            return Ok(0);
        }

        let depth = self.ensure_internal_bottom_up(c, 2, |it, d| {
            !BtreeNode::at_max_capacity(&**it.get_internal(d).node())
        })?;
        assert!(depth > 1);
        let split_from = depth - 1;
        if split_from >= self.get_depth() {
            Ok(self.get_depth())
        } else {
            Ok(split_from)
        }
    }

    /// Externally holdable position. `handle_boundary` must have resolved
    /// any boundary state first, so this must not be the end.
    pub fn get_cursor(&self) -> TreeCursor<S> {
        assert!(!self.is_end());
        let leaf = self.leaf.node().clone();
        TreeCursor {
            modifications: leaf.modifications(),
            key: self.get_key(),
            val: Some(self.get_val()),
            pos: self.leaf.pos,
            leaf,
        }
    }

    #[cfg(debug_assertions)]
    pub(crate) fn assert_valid(&self) {
        let leaf = self.leaf.node.as_ref().expect("iterator without leaf");
        assert!(self.leaf.pos as usize <= leaf.len());

        let mut hit_partial_null = false;
        for entry in &self.internal {
            match &entry.node {
                Some(node) => {
                    assert!(!hit_partial_null);
                    assert!((entry.pos as usize) < node.len());
                }
                None => {
                    assert!(self.is_partial());
                    // The remaining ancestors must be unpopulated too.
                    hit_partial_null = true;
                }
            }
        }
    }
}

/// A detached position: leaf handle, version counter, key, value and slot.
/// Stale when the leaf has been modified since the cursor was taken.
pub struct TreeCursor<S: TreeSpec> {
    pub leaf: Arc<LeafNode<S>>,
    pub modifications: u64,
    pub key: S::Key,
    pub val: Option<S::Value>,
    pub pos: u16,
}

impl<S: TreeSpec> TreeCursor<S> {
    pub fn is_stale(&self) -> bool {
        self.leaf.modifications() != self.modifications
    }
}
