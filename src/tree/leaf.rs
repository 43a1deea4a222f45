//! # Leaf Nodes
//!
//! Leaf nodes hold the tree's key→value entries in sorted order. A leaf is
//! a cache-managed extent: the committed version is immutable, and all
//! mutation happens on a transaction-local duplicate or a fresh extent
//! produced by the structural factories.
//!
//! ## Entry Storage
//!
//! Entries live in an ordered vector guarded by a read-write lock; the
//! serialized form (fixed-size key + fixed-size value per entry, behind the
//! common node header) is produced on commit and parsed on load. Slot
//! positions (`0..len`) are the currency iterators and the engine use to
//! address entries.
//!
//! ## Child Tracking
//!
//! When the tree's spec sets `LEAF_HAS_CHILDREN`, leaves maintain one
//! in-memory child slot per entry for loaded logical extents, mirroring the
//! internal-node child tracking. The engine maintains the slots across
//! mutation and structural copies; populating them is the concern of the
//! logical-extent layer.
//!
//! ## Structural Factories
//!
//! `make_split_children`, `make_full_merge` and `make_balanced` build fresh
//! replacement extents owned by the operating transaction; the originals
//! are retired by the caller. Loaded children tracked by the originals are
//! carried over to the replacements.

use std::any::Any;
use std::fmt;
use std::sync::{Arc, Weak};

use eyre::Result;
use parking_lot::{Mutex, RwLock};

use crate::extent::{Extent, ExtentInfo, ExtentKind, ExtentRef, NodeExtent, Paddr};
use crate::trans::OpContext;

use super::internal::InternalNode;
use super::node::{
    decode_node_header, encode_node, leaf_capacity, leaf_entry_size, resolve_parent, BtreeNode,
    ChildPos, ChildSlot, NodeKey, NodeMeta, NodeValue, TreeSpec,
};

pub struct LeafNode<S: TreeSpec> {
    info: ExtentInfo,
    inner: RwLock<LeafInner<S>>,
    parent: Mutex<Option<Weak<InternalNode<S>>>>,
}

struct LeafInner<S: TreeSpec> {
    meta: NodeMeta<S::Key>,
    entries: Vec<(S::Key, S::Value)>,
    children: Vec<ChildSlot>,
}

impl<S: TreeSpec> LeafNode<S> {
    pub const CAPACITY: usize = leaf_capacity(S::NODE_SIZE, S::Value::ENCODED_LEN);

    fn from_parts(
        info: ExtentInfo,
        meta: NodeMeta<S::Key>,
        entries: Vec<(S::Key, S::Value)>,
        children: Vec<ChildSlot>,
    ) -> Arc<LeafNode<S>> {
        assert_eq!(info.kind(), S::LEAF_KIND);
        Arc::new(LeafNode {
            info,
            inner: RwLock::new(LeafInner { meta, entries, children }),
            parent: Mutex::new(None),
        })
    }

    pub fn meta(&self) -> NodeMeta<S::Key> {
        self.inner.read().meta
    }

    /// In-memory range bookkeeping; set when a node is loaded or built.
    pub(crate) fn set_range(&self, meta: NodeMeta<S::Key>) {
        assert_eq!(meta.depth, 1, "leaf range must be at depth 1");
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

    /// Raw stored value; relative paddrs are materialized by the iterator.
    pub fn val_at(&self, pos: usize) -> S::Value {
        self.inner.read().entries[pos].1
    }

    pub fn entry_at(&self, pos: usize) -> (S::Key, S::Value) {
        self.inner.read().entries[pos]
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

    pub fn insert(&self, pos: usize, key: S::Key, val: S::Value) {
        assert!(self.is_mutable(), "insert into immutable leaf node");
        let mut inner = self.inner.write();
        assert!(pos <= inner.entries.len());
        assert!(inner.entries.len() < Self::CAPACITY, "insert into full leaf");
        debug_assert!(pos == 0 || inner.entries[pos - 1].0 < key);
        debug_assert!(pos == inner.entries.len() || inner.entries[pos].0 > key);
        inner.entries.insert(pos, (key, val));
        if S::LEAF_HAS_CHILDREN {
            inner.children.insert(pos, ChildSlot::Empty);
        }
        drop(inner);
        self.info.bump_modifications();
    }

    pub fn update(&self, pos: usize, val: S::Value) {
        assert!(self.is_mutable(), "update of immutable leaf node");
        let mut inner = self.inner.write();
        inner.entries[pos].1 = val;
        drop(inner);
        self.info.bump_modifications();
    }

    /// Replace both key and value of the entry at `pos`. The new key must
    /// preserve the slot ordering.
    pub fn replace(&self, pos: usize, key: S::Key, val: S::Value) {
        assert!(self.is_mutable(), "replace in immutable leaf node");
        let mut inner = self.inner.write();
        debug_assert!(pos == 0 || inner.entries[pos - 1].0 < key);
        debug_assert!(pos + 1 == inner.entries.len() || inner.entries[pos + 1].0 > key);
        inner.entries[pos] = (key, val);
        drop(inner);
        self.info.bump_modifications();
    }

    pub fn remove(&self, pos: usize) {
        assert!(self.is_mutable(), "remove from immutable leaf node");
        let mut inner = self.inner.write();
        inner.entries.remove(pos);
        if S::LEAF_HAS_CHILDREN {
            inner.children.remove(pos);
        }
        drop(inner);
        self.info.bump_modifications();
    }

    /// Track a loaded logical extent under the entry at `pos`.
    pub fn link_child(&self, child: &ExtentRef, pos: usize) {
        assert!(S::LEAF_HAS_CHILDREN, "leaf child tracking disabled for this tree");
        let mut inner = self.inner.write();
        assert!(pos < inner.entries.len());
        inner.children[pos] = ChildSlot::of(child);
        child.info().set_linked(true);
    }

    fn snapshot(
        &self,
    ) -> (
        NodeMeta<S::Key>,
        Vec<(S::Key, S::Value)>,
        Vec<ChildSlot>,
    ) {
        let inner = self.inner.read();
        (inner.meta, inner.entries.clone(), inner.children.clone())
    }

    /// Snapshot with node-relative physical addresses resolved against
    /// this node's paddr. Structural copies land at a different address,
    /// so relative values must not be carried over verbatim.
    fn snapshot_resolved(
        &self,
    ) -> (
        NodeMeta<S::Key>,
        Vec<(S::Key, S::Value)>,
        Vec<ChildSlot>,
    ) {
        let base = self.info.paddr();
        let (meta, mut entries, children) = self.snapshot();
        for (_, val) in &mut entries {
            *val = val.maybe_relative_to(base);
        }
        (meta, entries, children)
    }

    fn alloc_fresh(&self, c: &mut OpContext<'_>) -> Arc<LeafNode<S>> {
        c.cache.alloc_new_non_data_extent::<LeafNode<S>>(
            c.trans,
            S::NODE_SIZE,
            self.info.hint(),
            self.info.generation(),
        )
    }

    fn fill(
        &self,
        meta: NodeMeta<S::Key>,
        entries: Vec<(S::Key, S::Value)>,
        children: Vec<ChildSlot>,
    ) {
        debug_assert!(entries.len() <= Self::CAPACITY);
        let mut inner = self.inner.write();
        inner.meta = meta;
        inner.entries = entries;
        inner.children = if S::LEAF_HAS_CHILDREN {
            children
        } else {
            Vec::new()
        };
    }
}

impl<S: TreeSpec> fmt::Debug for LeafNode<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let inner = self.inner.read();
        f.debug_struct("LeafNode")
            .field("paddr", &self.info.paddr())
            .field("state", &self.info.state())
            .field("meta", &inner.meta)
            .field("len", &inner.entries.len())
            .finish()
    }
}

impl<S: TreeSpec> Extent for LeafNode<S> {
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
        Arc::new(LeafNode::<S> {
            info: ExtentInfo::pending_from(prior, trans_id),
            inner: RwLock::new(LeafInner { meta, entries, children }),
            parent: Mutex::new(parent),
        })
    }

    fn encode(&self) -> Vec<u8> {
        let inner = self.inner.read();
        let (bytes, crc) = encode_node(
            S::LEAF_KIND,
            inner.meta,
            inner.entries.len(),
            S::NODE_SIZE,
            |payload| {
                let mut buf = vec![0u8; S::Value::ENCODED_LEN];
                for (key, val) in &inner.entries {
                    payload.extend_from_slice(&key.to_raw().to_le_bytes());
                    val.encode_into(&mut buf);
                    payload.extend_from_slice(&buf);
                }
            },
        );
        drop(inner);
        self.info.set_in_extent_checksum(crc);
        bytes
    }
}

impl<S: TreeSpec> NodeExtent for LeafNode<S> {
    const KIND: ExtentKind = S::LEAF_KIND;

    fn new_empty(info: ExtentInfo) -> Arc<LeafNode<S>> {
        LeafNode::from_parts(
            info,
            NodeMeta::new(S::Key::MIN, S::Key::MAX, 1),
            Vec::new(),
            Vec::new(),
        )
    }

    fn decode(info: ExtentInfo, bytes: &[u8]) -> Result<Arc<LeafNode<S>>> {
        let entry_size = leaf_entry_size(S::Value::ENCODED_LEN);
        let (meta, len, crc, payload) =
            decode_node_header::<S::Key>(S::LEAF_KIND, entry_size, bytes)?;
        eyre::ensure!(meta.depth == 1, "leaf node with depth {}", meta.depth);

        let mut entries = Vec::with_capacity(len);
        for i in 0..len {
            let at = i * entry_size;
            let key = S::Key::from_raw(u64::from_le_bytes(
                payload[at..at + 8].try_into().unwrap(),
            ));
            let val = S::Value::decode_from(&payload[at + 8..at + entry_size]);
            entries.push((key, val));
        }

        let children = if S::LEAF_HAS_CHILDREN {
            vec![ChildSlot::Empty; len]
        } else {
            Vec::new()
        };
        info.set_in_extent_checksum(crc);
        Ok(LeafNode::from_parts(info, meta, entries, children))
    }
}

impl<S: TreeSpec> BtreeNode<S> for LeafNode<S> {
    fn meta(&self) -> NodeMeta<S::Key> {
        LeafNode::meta(self)
    }

    fn len(&self) -> usize {
        LeafNode::len(self)
    }

    fn capacity(&self) -> usize {
        Self::CAPACITY
    }

    fn key_at(&self, pos: usize) -> S::Key {
        LeafNode::key_at(self, pos)
    }

    fn make_split_children(
        &self,
        c: &mut OpContext<'_>,
    ) -> (Arc<Self>, Arc<Self>, S::Key) {
        let (meta, mut entries, mut children) = self.snapshot_resolved();
        let mid = entries.len() / 2;
        assert!(mid > 0 && mid < entries.len(), "split of underfull leaf");
        let pivot = entries[mid].0;

        let right_entries = entries.split_off(mid);
        let right_children = if S::LEAF_HAS_CHILDREN {
            children.split_off(mid)
        } else {
            Vec::new()
        };

        let left = self.alloc_fresh(c);
        let right = self.alloc_fresh(c);
        left.fill(NodeMeta::new(meta.begin, pivot, 1), entries, children);
        right.fill(
            NodeMeta::new(pivot, meta.end, 1),
            right_entries,
            right_children,
        );
        (left, right, pivot)
    }

    fn make_full_merge(&self, c: &mut OpContext<'_>, right: &Arc<Self>) -> Arc<Self> {
        let (lmeta, mut entries, mut children) = self.snapshot_resolved();
        let (rmeta, right_entries, right_children) = right.snapshot_resolved();
        assert_eq!(lmeta.end, rmeta.begin, "full merge of non-adjacent leaves");
        entries.extend(right_entries);
        children.extend(right_children);

        let merged = self.alloc_fresh(c);
        merged.fill(NodeMeta::new(lmeta.begin, rmeta.end, 1), entries, children);
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
        assert_eq!(lmeta.end, rmeta.begin, "balance of non-adjacent leaves");
        entries.extend(right_entries);
        children.extend(right_children);
        assert!(pivot_idx > 0 && pivot_idx < entries.len());

        let pivot = entries[pivot_idx].0;
        let new_right_entries = entries.split_off(pivot_idx);
        let new_right_children = if S::LEAF_HAS_CHILDREN {
            children.split_off(pivot_idx)
        } else {
            Vec::new()
        };

        let new_left = self.alloc_fresh(c);
        let new_right = self.alloc_fresh(c);
        new_left.fill(NodeMeta::new(lmeta.begin, pivot, 1), entries, children);
        new_right.fill(
            NodeMeta::new(pivot, rmeta.end, 1),
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
        assert_eq!(depth, 1);
        super::get_leaf_node(c, paddr, begin, end, parent_pos)
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

impl<S: TreeSpec> LeafNode<S> {
    /// The parent as seen by the operating transaction.
    pub(crate) fn get_parent_node(
        &self,
        trans: &crate::trans::Transaction,
    ) -> Arc<InternalNode<S>> {
        resolve_parent(&self.parent, trans)
    }

    pub fn peek_parent(&self) -> Option<Arc<InternalNode<S>>> {
        BtreeNode::peek_parent_node(self)
    }

    pub(crate) fn set_parent_node(&self, parent: Option<Weak<InternalNode<S>>>) {
        BtreeNode::set_parent(self, parent)
    }
}
