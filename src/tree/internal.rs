//! # Internal Nodes
//!
//! Internal nodes map pivot keys to child extent addresses. A slot
//! `(key, child_paddr)` says: the subtree rooted at `child_paddr` covers
//! `[key, next_slot_key_or_node_end)`. The first slot's key always equals
//! the node's own `begin`.
//!
//! ## Child Tracking
//!
//! Besides the persisted slots, an internal node keeps one in-memory child
//! slot per entry pointing (weakly) at the loaded child extent, if any.
//! [`InternalNode::get_child`] is the descent primitive built on it:
//!
//! - if the slot holds a live loaded child, the child is returned directly
//!   (mapped to the operating transaction's pending copy when one exists);
//! - otherwise the caller receives a [`ChildPos`] reservation naming this
//!   parent and slot. The fetch path hands the reservation to the cache,
//!   whose load-and-link sequence is atomic, so two racing descents can
//!   never materialize two copies of the same child.
//!
//! Linking is bidirectional: the parent's slot points at the child and the
//! child's parent back-reference points at this node. Both sides are weak;
//! neither extends the other's lifetime.
//!
//! ## Pending/Stable Duality
//!
//! Duplicating a node for write does not touch its children's parent
//! back-references: a stable child keeps pointing at the stable parent,
//! and the pending parent answers [`InternalNode::get_stable_for_key`]
//! with that stable instance. When the pending copy commits and replaces
//! the prior, `on_replace_prior` repoints the loaded children at the new
//! stable instance.

use std::any::Any;
use std::fmt;
use std::sync::{Arc, Weak};

use eyre::Result;
use parking_lot::{Mutex, RwLock};

use crate::extent::{
    cast, try_cast, Extent, ExtentInfo, ExtentKind, ExtentRef, NodeExtent, Paddr,
};
use crate::trans::{OpContext, Transaction};

use super::leaf::LeafNode;
use super::node::{
    decode_node_header, encode_node, internal_capacity, internal_entry_size, resolve_parent,
    BtreeNode, ChildPos, ChildSlot, NodeKey, NodeMeta, TreeSpec,
};

/// Result of the atomic loaded-or-reserve child lookup.
pub enum ChildLookup<S: TreeSpec> {
    /// The child is materialized; already mapped to the operating
    /// transaction's pending copy when one exists.
    Loaded(ExtentRef),
    /// Not materialized; fetch through the cache and link via the
    /// reservation.
    Pos(ChildPos<S>),
}

pub struct InternalNode<S: TreeSpec> {
    info: ExtentInfo,
    self_weak: Weak<InternalNode<S>>,
    inner: RwLock<InternalInner<S>>,
    parent: Mutex<Option<Weak<InternalNode<S>>>>,
}

struct InternalInner<S: TreeSpec> {
    meta: NodeMeta<S::Key>,
    entries: Vec<(S::Key, Paddr)>,
    children: Vec<ChildSlot>,
}

impl<S: TreeSpec> InternalNode<S> {
    pub const CAPACITY: usize = internal_capacity(S::NODE_SIZE);

    fn from_parts(
        info: ExtentInfo,
        meta: NodeMeta<S::Key>,
        entries: Vec<(S::Key, Paddr)>,
        children: Vec<ChildSlot>,
        parent: Option<Weak<InternalNode<S>>>,
    ) -> Arc<InternalNode<S>> {
        assert_eq!(info.kind(), S::INTERNAL_KIND);
        assert_eq!(entries.len(), children.len());
        Arc::new_cyclic(|self_weak| InternalNode {
            info,
            self_weak: self_weak.clone(),
            inner: RwLock::new(InternalInner { meta, entries, children }),
            parent: Mutex::new(parent),
        })
    }

    fn self_arc(&self) -> Arc<InternalNode<S>> {
        self.self_weak
            .upgrade()
            .expect("internal node outlived its own allocation")
    }

    pub fn meta(&self) -> NodeMeta<S::Key> {
        self.inner.read().meta
    }

    /// In-memory range bookkeeping; set when a node is loaded or built.
    pub(crate) fn set_range(&self, meta: NodeMeta<S::Key>) {
        assert!(meta.depth >= 2, "internal node range below depth 2");
        self.inner.write().meta = meta;
    }

    pub fn len(&self) -> usize {
        self.inner.read().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn key_at(&self, pos: usize) -> S::Key {
        self.inner.read().entries[pos].0
    }

    /// Stored child address; may be relative to this node's paddr.
    pub fn val_at(&self, pos: usize) -> Paddr {
        self.inner.read().entries[pos].1
    }

    /// First slot with key >= `key`.
    pub fn lower_bound(&self, key: S::Key) -> usize {
        self.inner.read().entries.partition_point(|(k, _)| *k < key)
    }

    /// First slot with key > `key`.
    pub fn upper_bound(&self, key: S::Key) -> usize {
        self.inner.read().entries.partition_point(|(k, _)| *k <= key)
    }

    pub fn find(&self, key: S::Key) -> Option<usize> {
        let pos = self.lower_bound(key);
        (pos < self.len() && self.key_at(pos) == key).then_some(pos)
    }

    /// The end key of the subtree under slot `pos`: the next slot's key,
    /// or this node's own end for the last slot.
    pub fn end_of_slot(&self, pos: usize) -> S::Key {
        let inner = self.inner.read();
        if pos + 1 == inner.entries.len() {
            inner.meta.end
        } else {
            inner.entries[pos + 1].0
        }
    }

    pub fn insert(&self, pos: usize, key: S::Key, paddr: Paddr, child: Option<&ExtentRef>) {
        assert!(self.is_mutable(), "insert into immutable internal node");
        let mut inner = self.inner.write();
        assert!(pos <= inner.entries.len());
        assert!(
            inner.entries.len() < Self::CAPACITY,
            "insert into full internal node"
        );
        debug_assert!(pos == 0 || inner.entries[pos - 1].0 < key);
        debug_assert!(pos == inner.entries.len() || inner.entries[pos].0 > key);
        inner.entries.insert(pos, (key, paddr));
        inner
            .children
            .insert(pos, child.map(ChildSlot::of).unwrap_or_default());
        drop(inner);
        if let Some(child) = child {
            self.adopt(child);
        }
        self.info.bump_modifications();
    }

    /// Repoint the slot at `pos` to a new child address, keeping its key.
    pub fn update(&self, pos: usize, paddr: Paddr, child: Option<&ExtentRef>) {
        assert!(self.is_mutable(), "update of immutable internal node");
        let mut inner = self.inner.write();
        inner.entries[pos].1 = paddr;
        inner.children[pos] = child.map(ChildSlot::of).unwrap_or_default();
        drop(inner);
        if let Some(child) = child {
            self.adopt(child);
        }
        self.info.bump_modifications();
    }

    /// Replace both key and child address of the slot at `pos`.
    pub fn replace(&self, pos: usize, key: S::Key, paddr: Paddr, child: Option<&ExtentRef>) {
        assert!(self.is_mutable(), "replace in immutable internal node");
        let mut inner = self.inner.write();
        inner.entries[pos] = (key, paddr);
        inner.children[pos] = child.map(ChildSlot::of).unwrap_or_default();
        drop(inner);
        if let Some(child) = child {
            self.adopt(child);
        }
        self.info.bump_modifications();
    }

    pub fn remove(&self, pos: usize) {
        assert!(self.is_mutable(), "remove from immutable internal node");
        let mut inner = self.inner.write();
        inner.entries.remove(pos);
        inner.children.remove(pos);
        drop(inner);
        self.info.bump_modifications();
    }

    /// Atomic loaded-or-reserve child lookup for slot `pos`.
    pub fn get_child(&self, trans: &Transaction, pos: usize) -> ChildLookup<S> {
        let inner = self.inner.read();
        assert!(pos < inner.entries.len());
        if let Some(child) = inner.children[pos].loaded() {
            if child.is_valid() {
                drop(inner);
                return match trans.pending_extent(child.paddr()) {
                    Some(pending) => ChildLookup::Loaded(pending),
                    None => ChildLookup::Loaded(child),
                };
            }
        }
        drop(inner);
        ChildLookup::Pos(ChildPos { parent: self.self_arc(), pos })
    }

    /// Bidirectional link: slot `pos` tracks `child`, and `child`'s parent
    /// back-reference tracks this node.
    pub fn link_child(&self, child: &ExtentRef, pos: usize) {
        let mut inner = self.inner.write();
        assert!(pos < inner.entries.len());
        inner.children[pos] = ChildSlot::of(child);
        drop(inner);
        self.adopt(child);
    }

    /// The stable projection of this mutation-pending node for key `k`.
    ///
    /// A pending node has exactly one prior instance here, so the
    /// key-dependent projection of the general protocol collapses to it.
    pub fn get_stable_for_key(&self, _key: S::Key) -> Arc<InternalNode<S>> {
        assert!(
            self.is_mutation_pending(),
            "get_stable_for_key on non-pending node"
        );
        let prior = self
            .info
            .prior_instance()
            .expect("mutation-pending node without prior instance");
        cast::<InternalNode<S>>(&prior)
    }

    /// Set `child`'s parent back-reference to this node.
    fn adopt(&self, child: &ExtentRef) {
        let weak = Some(self.self_weak.clone());
        if let Some(leaf) = try_cast::<LeafNode<S>>(child) {
            leaf.set_parent_node(weak);
        } else if let Some(internal) = try_cast::<InternalNode<S>>(child) {
            internal.set_parent_node(weak);
        } else {
            // Logical children (data extents) carry no tree parent
            // tracker; only mark them linked.
            child.info().set_linked(true);
        }
    }

    /// Repoint every loaded child's parent back-reference at this node.
    /// Runs when this instance replaces another (commit, rewrite,
    /// structural factories).
    pub(crate) fn relink_children(&self) {
        let children: Vec<ExtentRef> = {
            let inner = self.inner.read();
            inner.children.iter().filter_map(ChildSlot::loaded).collect()
        };
        for child in children {
            if child.is_valid() {
                self.adopt(&child);
            }
        }
    }

    fn snapshot(
        &self,
    ) -> (
        NodeMeta<S::Key>,
        Vec<(S::Key, Paddr)>,
        Vec<ChildSlot>,
    ) {
        let inner = self.inner.read();
        (inner.meta, inner.entries.clone(), inner.children.clone())
    }

    /// Snapshot with node-relative child addresses resolved against this
    /// node's paddr; structural copies land at a different address.
    fn snapshot_resolved(
        &self,
    ) -> (
        NodeMeta<S::Key>,
        Vec<(S::Key, Paddr)>,
        Vec<ChildSlot>,
    ) {
        let base = self.info.paddr();
        let (meta, mut entries, children) = self.snapshot();
        for (_, addr) in &mut entries {
            *addr = addr.maybe_relative_to(base);
        }
        (meta, entries, children)
    }

    fn alloc_fresh(&self, c: &mut OpContext<'_>) -> Arc<InternalNode<S>> {
        c.cache.alloc_new_non_data_extent::<InternalNode<S>>(
            c.trans,
            S::NODE_SIZE,
            self.info.hint(),
            self.info.generation(),
        )
    }

    fn fill(
        &self,
        meta: NodeMeta<S::Key>,
        entries: Vec<(S::Key, Paddr)>,
        children: Vec<ChildSlot>,
    ) {
        debug_assert!(entries.len() <= Self::CAPACITY);
        debug_assert_eq!(entries.len(), children.len());
        {
            let mut inner = self.inner.write();
            inner.meta = meta;
            inner.entries = entries;
            inner.children = children;
        }
        self.relink_children();
    }

    pub(crate) fn get_parent_node(&self, trans: &Transaction) -> Arc<InternalNode<S>> {
        resolve_parent(&self.parent, trans)
    }

    pub fn peek_parent(&self) -> Option<Arc<InternalNode<S>>> {
        BtreeNode::peek_parent_node(self)
    }

    pub(crate) fn set_parent_node(&self, parent: Option<Weak<InternalNode<S>>>) {
        BtreeNode::set_parent(self, parent)
    }

    /// Loaded child extent at `pos`, if any (invariant checking).
    pub fn loaded_child(&self, pos: usize) -> Option<ExtentRef> {
        self.inner.read().children[pos].loaded()
    }
}

impl<S: TreeSpec> fmt::Debug for InternalNode<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let inner = self.inner.read();
        f.debug_struct("InternalNode")
            .field("paddr", &self.info.paddr())
            .field("state", &self.info.state())
            .field("meta", &inner.meta)
            .field("len", &inner.entries.len())
            .finish()
    }
}

impl<S: TreeSpec> Extent for InternalNode<S> {
    fn info(&self) -> &ExtentInfo {
        &self.info
    }

    fn as_any_arc(self: Arc<Self>) -> Arc<dyn Any + Send + Sync> {
        self
    }

    fn duplicate(self: Arc<Self>, trans_id: u64) -> ExtentRef {
        let (meta, entries, children) = self.snapshot();
        let parent = self.parent.lock().clone();
        let prior: ExtentRef = self;
        let info = ExtentInfo::pending_from(prior, trans_id);
        InternalNode::from_parts(info, meta, entries, children, parent)
    }

    fn encode(&self) -> Vec<u8> {
        let inner = self.inner.read();
        let (bytes, crc) = encode_node(
            S::INTERNAL_KIND,
            inner.meta,
            inner.entries.len(),
            S::NODE_SIZE,
            |payload| {
                for (key, paddr) in &inner.entries {
                    payload.extend_from_slice(&key.to_raw().to_le_bytes());
                    payload.extend_from_slice(&paddr.to_raw().to_le_bytes());
                }
            },
        );
        drop(inner);
        self.info.set_in_extent_checksum(crc);
        bytes
    }

    fn on_replace_prior(self: Arc<Self>) {
        self.relink_children();
    }
}

impl<S: TreeSpec> NodeExtent for InternalNode<S> {
    const KIND: ExtentKind = S::INTERNAL_KIND;

    fn new_empty(info: ExtentInfo) -> Arc<InternalNode<S>> {
        InternalNode::from_parts(
            info,
            NodeMeta::new(S::Key::MIN, S::Key::MAX, 2),
            Vec::new(),
            Vec::new(),
            None,
        )
    }

    fn decode(info: ExtentInfo, bytes: &[u8]) -> Result<Arc<InternalNode<S>>> {
        let entry_size = internal_entry_size();
        let (meta, len, crc, payload) =
            decode_node_header::<S::Key>(S::INTERNAL_KIND, entry_size, bytes)?;
        eyre::ensure!(meta.depth >= 2, "internal node with depth {}", meta.depth);

        let mut entries = Vec::with_capacity(len);
        for i in 0..len {
            let at = i * entry_size;
            let key = S::Key::from_raw(u64::from_le_bytes(
                payload[at..at + 8].try_into().unwrap(),
            ));
            let paddr = Paddr::from_raw(u64::from_le_bytes(
                payload[at + 8..at + 16].try_into().unwrap(),
            ));
            entries.push((key, paddr));
        }

        let children = vec![ChildSlot::Empty; len];
        info.set_in_extent_checksum(crc);
        Ok(InternalNode::from_parts(info, meta, entries, children, None))
    }
}

impl<S: TreeSpec> BtreeNode<S> for InternalNode<S> {
    fn meta(&self) -> NodeMeta<S::Key> {
        InternalNode::meta(self)
    }

    fn len(&self) -> usize {
        InternalNode::len(self)
    }

    fn capacity(&self) -> usize {
        Self::CAPACITY
    }

    fn key_at(&self, pos: usize) -> S::Key {
        InternalNode::key_at(self, pos)
    }

    fn make_split_children(
        &self,
        c: &mut OpContext<'_>,
    ) -> (Arc<Self>, Arc<Self>, S::Key) {
        let (meta, mut entries, mut children) = self.snapshot_resolved();
        let mid = entries.len() / 2;
        assert!(mid > 0 && mid < entries.len(), "split of underfull internal node");
        let pivot = entries[mid].0;

        let right_entries = entries.split_off(mid);
        let right_children = children.split_off(mid);

        let left = self.alloc_fresh(c);
        let right = self.alloc_fresh(c);
        left.fill(NodeMeta::new(meta.begin, pivot, meta.depth), entries, children);
        right.fill(
            NodeMeta::new(pivot, meta.end, meta.depth),
            right_entries,
            right_children,
        );
        (left, right, pivot)
    }

    fn make_full_merge(&self, c: &mut OpContext<'_>, right: &Arc<Self>) -> Arc<Self> {
        let (lmeta, mut entries, mut children) = self.snapshot_resolved();
        let (rmeta, right_entries, right_children) = right.snapshot_resolved();
        assert_eq!(lmeta.end, rmeta.begin, "full merge of non-adjacent nodes");
        assert_eq!(lmeta.depth, rmeta.depth);
        entries.extend(right_entries);
        children.extend(right_children);

        let merged = self.alloc_fresh(c);
        merged.fill(
            NodeMeta::new(lmeta.begin, rmeta.end, lmeta.depth),
            entries,
            children,
        );
        merged
    }

    fn make_balanced(
        &self,
        c: &mut OpContext<'_>,
        right: &Arc<Self>,
        pivot_idx: usize,
    ) -> (Arc<Self>, Arc<Self>, S::Key) {
        let (lmeta, mut entries, mut children) = self.snapshot_resolved();
        let (rmeta, right_entries, right_children) = right.snapshot_resolved();
        assert_eq!(lmeta.end, rmeta.begin, "balance of non-adjacent nodes");
        assert_eq!(lmeta.depth, rmeta.depth);
        entries.extend(right_entries);
        children.extend(right_children);
        assert!(pivot_idx > 0 && pivot_idx < entries.len());

        let pivot = entries[pivot_idx].0;
        let new_right_entries = entries.split_off(pivot_idx);
        let new_right_children = children.split_off(pivot_idx);

        let new_left = self.alloc_fresh(c);
        let new_right = self.alloc_fresh(c);
        new_left.fill(NodeMeta::new(lmeta.begin, pivot, lmeta.depth), entries, children);
        new_right.fill(
            NodeMeta::new(pivot, rmeta.end, rmeta.depth),
            new_right_entries,
            new_right_children,
        );
        (new_left, new_right, pivot)
    }

    fn rewrite_from(&self, other: &Arc<Self>) {
        assert!(self.is_fresh(), "rewrite into non-fresh extent");
        let (meta, entries, children) = other.snapshot_resolved();
        self.fill(meta, entries, children);
    }

    fn fetch(
        c: &mut OpContext<'_>,
        depth: u8,
        paddr: Paddr,
        begin: S::Key,
        end: S::Key,
        parent_pos: Option<ChildPos<S>>,
    ) -> Result<Arc<Self>> {
        super::get_internal_node(c, depth, paddr, begin, end, parent_pos)
    }

    fn set_parent(&self, parent: Option<Weak<InternalNode<S>>>) {
        let linked = parent.is_some();
        *self.parent.lock() = parent;
        self.info.set_linked(linked);
    }

    fn peek_parent_node(&self) -> Option<Arc<InternalNode<S>>> {
        self.parent.lock().as_ref().and_then(Weak::upgrade)
    }
}
