//! # Node Abstractions
//!
//! This module defines the vocabulary shared by both node types of the
//! B+tree engine: the key/value traits, the per-tree specification bundle,
//! the node range descriptor, the serialized node header, capacity math and
//! the in-memory child-slot tracking.
//!
//! ## Tree Specification
//!
//! The engine is generic over a [`TreeSpec`], which bundles what the
//! surrounding system instantiates per tree: key and value types, the
//! extent kinds its nodes carry, the node extent size, and which root-block
//! slot and statistics slot belong to it. The two production specs are the
//! LBA tree and the back-reference tree.
//!
//! ## Node Ranges
//!
//! Every node carries a [`NodeMeta`]: `(begin, end, depth)`. Invariants:
//!
//! - `begin < end`;
//! - every contained key lies in `[begin, end)`, and an internal node's
//!   first pivot equals `begin`;
//! - a child's depth is one less than its parent's;
//! - the root's range is exactly `[K::MIN, K::MAX)`.
//!
//! ## Serialized Layout
//!
//! ```text
//! +---------------------+
//! | NodeHeader (32B)    |  kind, depth, len, begin, end, payload crc
//! +---------------------+
//! | Entry[0]            |  key (8B LE) + value encoding
//! | Entry[1]            |  (internal nodes: value = child paddr, 8B)
//! | ...                 |
//! +---------------------+
//! | zero padding        |  up to the node extent size
//! +---------------------+
//! ```
//!
//! The payload CRC64 covers the entry region. It is verified against the
//! recomputed checksum on decode (mismatch is fatal corruption) and against
//! the cache's committed checksum on every fresh load.
//!
//! ## Capacity
//!
//! Fanout is derived, not configured: `(node_size - header) / entry_size`.
//! A node is at max capacity when full, below min capacity when under half
//! full (it must be merged after a removal), and at min capacity at exactly
//! half (a donor at min forces a full merge rather than a rebalance).

use std::fmt;
use std::sync::{Arc, Weak};

use eyre::Result;
use parking_lot::Mutex;
use zerocopy::little_endian::{U16, U64};
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout, Unaligned};

use crate::config::NODE_HEADER_SIZE;
use crate::extent::{crc64, Extent, ExtentKind, ExtentRef, NodeExtent, Paddr, TreeId};
use crate::trans::{OpContext, Transaction};
use crate::zerocopy_accessors;

use super::internal::InternalNode;

/// Fixed-size, totally ordered tree key with sentinel bounds.
///
/// `MIN` is the smallest representable key; `MAX` is an exclusive sentinel
/// never stored in a node. Keys serialize as raw little-endian u64.
pub trait NodeKey:
    Copy + Ord + Eq + fmt::Debug + Send + Sync + 'static
{
    const MIN: Self;
    const MAX: Self;

    fn to_raw(self) -> u64;
    fn from_raw(raw: u64) -> Self;

    /// Key `len` units past `self`; used by `upper_bound_right` to test
    /// whether a mapping starting at `self` covers a probe key.
    fn add_offset(self, len: u32) -> Self;
}

impl NodeKey for u64 {
    const MIN: u64 = 0;
    const MAX: u64 = u64::MAX;

    fn to_raw(self) -> u64 {
        self
    }

    fn from_raw(raw: u64) -> u64 {
        raw
    }

    fn add_offset(self, len: u32) -> u64 {
        self.saturating_add(u64::from(len))
    }
}

/// Fixed-size tree value.
pub trait NodeValue: Copy + PartialEq + fmt::Debug + Send + Sync + 'static {
    const ENCODED_LEN: usize;

    fn encode_into(&self, out: &mut [u8]);
    fn decode_from(buf: &[u8]) -> Self;

    /// Length of the extent this mapping covers; zero for values that do
    /// not describe extents.
    fn extent_len(&self) -> u32;

    /// Resolve any device-relative physical address in the value against
    /// the owning leaf's address. Identity for values without paddrs.
    fn maybe_relative_to(self, _base: Paddr) -> Self {
        self
    }
}

/// Per-tree bundle of the engine's type parameters.
pub trait TreeSpec: Sized + Send + Sync + 'static {
    type Key: NodeKey;
    type Value: NodeValue;

    /// Selects this tree's root-block slot and statistics slot.
    const TREE_ID: TreeId;
    const INTERNAL_KIND: ExtentKind;
    const LEAF_KIND: ExtentKind;
    const NODE_SIZE: u32;
    /// Whether leaves track loaded logical child extents in addition to
    /// their values.
    const LEAF_HAS_CHILDREN: bool;
}

/// Node range descriptor: `[begin, end)` at `depth`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NodeMeta<K> {
    pub begin: K,
    pub end: K,
    pub depth: u8,
}

impl<K: NodeKey> NodeMeta<K> {
    pub fn new(begin: K, end: K, depth: u8) -> NodeMeta<K> {
        assert!(begin < end, "empty node range");
        assert!(depth >= 1, "node depth must be at least 1");
        NodeMeta { begin, end, depth }
    }

    /// The root spans the whole key space.
    pub fn is_root(&self) -> bool {
        self.begin == K::MIN && self.end == K::MAX
    }

    pub fn is_parent_of(&self, child: &NodeMeta<K>) -> bool {
        self.depth == child.depth + 1 && self.begin <= child.begin && child.end <= self.end
    }

    pub fn contains(&self, key: K) -> bool {
        self.begin <= key && key < self.end
    }
}

#[repr(C)]
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, Immutable, KnownLayout, Unaligned)]
pub(crate) struct NodeHeader {
    kind: u8,
    depth: u8,
    len: U16,
    reserved: [u8; 4],
    begin: U64,
    end: U64,
    crc: U64,
}

const _: () = assert!(std::mem::size_of::<NodeHeader>() == NODE_HEADER_SIZE);

impl NodeHeader {
    zerocopy_accessors! {
        len: u16,
        begin: u64,
        end: u64,
        crc: u64,
    }

    pub fn kind(&self) -> u8 {
        self.kind
    }

    pub fn depth(&self) -> u8 {
        self.depth
    }
}

/// Serialize a node: header, payload, zero padding up to `node_size`.
/// Returns the bytes and the payload checksum.
pub(crate) fn encode_node<K: NodeKey>(
    kind: ExtentKind,
    meta: NodeMeta<K>,
    len: usize,
    node_size: u32,
    write_payload: impl FnOnce(&mut Vec<u8>),
) -> (Vec<u8>, u64) {
    let mut payload = Vec::with_capacity(node_size as usize - NODE_HEADER_SIZE);
    write_payload(&mut payload);
    assert!(
        payload.len() <= node_size as usize - NODE_HEADER_SIZE,
        "node payload overflows extent size"
    );
    let crc = crc64(&payload);

    let header = NodeHeader {
        kind: kind as u8,
        depth: meta.depth,
        len: U16::new(len as u16),
        reserved: [0u8; 4],
        begin: U64::new(meta.begin.to_raw()),
        end: U64::new(meta.end.to_raw()),
        crc: U64::new(crc),
    };

    let mut out = vec![0u8; node_size as usize];
    out[..NODE_HEADER_SIZE].copy_from_slice(header.as_bytes());
    out[NODE_HEADER_SIZE..NODE_HEADER_SIZE + payload.len()].copy_from_slice(&payload);
    (out, crc)
}

/// Parse and verify a serialized node. The recomputed checksum over the
/// entry region (`len * entry_size` bytes) must match the header; a
/// mismatch is unrecoverable corruption.
pub(crate) fn decode_node_header<K: NodeKey>(
    expected_kind: ExtentKind,
    entry_size: usize,
    bytes: &[u8],
) -> Result<(NodeMeta<K>, usize, u64, &[u8])> {
    eyre::ensure!(
        bytes.len() >= NODE_HEADER_SIZE,
        "node extent truncated: {} bytes",
        bytes.len()
    );
    let header = NodeHeader::ref_from_bytes(&bytes[..NODE_HEADER_SIZE])
        .map_err(|e| eyre::eyre!("failed to parse node header: {e:?}"))?;
    eyre::ensure!(
        header.kind() == expected_kind as u8,
        "node kind {} does not match expected {:?}",
        header.kind(),
        expected_kind
    );

    let len = header.len() as usize;
    let payload = &bytes[NODE_HEADER_SIZE..];
    eyre::ensure!(
        len * entry_size <= payload.len(),
        "node entry count {len} overflows payload"
    );
    let computed = crc64(&payload[..len * entry_size]);
    if computed != header.crc() {
        panic!(
            "impossible: node payload checksum mismatch, recorded {:#x}, actually {:#x}",
            header.crc(),
            computed
        );
    }

    let meta = NodeMeta::new(
        K::from_raw(header.begin()),
        K::from_raw(header.end()),
        header.depth(),
    );
    Ok((meta, len, header.crc(), payload))
}

pub(crate) const fn internal_entry_size() -> usize {
    8 + 8
}

pub(crate) const fn leaf_entry_size(val_len: usize) -> usize {
    8 + val_len
}

pub(crate) const fn internal_capacity(node_size: u32) -> usize {
    (node_size as usize - NODE_HEADER_SIZE) / internal_entry_size()
}

pub(crate) const fn leaf_capacity(node_size: u32, val_len: usize) -> usize {
    (node_size as usize - NODE_HEADER_SIZE) / leaf_entry_size(val_len)
}

/// In-memory tracking slot for a loaded child extent.
///
/// `Reserved` marks slots whose logical target is known but intentionally
/// not backed by a cached extent (reserved LBA mappings); the engine treats
/// it as absent when descending.
#[derive(Clone, Default)]
pub(crate) enum ChildSlot {
    #[default]
    Empty,
    #[allow(dead_code)]
    Reserved,
    Loaded(Weak<dyn Extent>),
}

impl ChildSlot {
    pub(crate) fn loaded(&self) -> Option<ExtentRef> {
        match self {
            ChildSlot::Loaded(weak) => weak.upgrade(),
            _ => None,
        }
    }

    pub(crate) fn of(extent: &ExtentRef) -> ChildSlot {
        ChildSlot::Loaded(Arc::downgrade(extent))
    }
}

impl fmt::Debug for ChildSlot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ChildSlot::Empty => write!(f, "Empty"),
            ChildSlot::Reserved => write!(f, "Reserved"),
            ChildSlot::Loaded(w) => match w.upgrade() {
                Some(e) => write!(f, "Loaded({})", e.paddr()),
                None => write!(f, "Loaded(dead)"),
            },
        }
    }
}

/// A parent slot handed back by `get_child` when the child is not loaded:
/// the reservation the fetch path uses to link the freshly materialized
/// child into place.
pub struct ChildPos<S: TreeSpec> {
    pub parent: Arc<InternalNode<S>>,
    pub pos: usize,
}

/// Resolve a node's parent back-pointer to the version viewable by the
/// operating transaction.
pub(crate) fn resolve_parent<S: TreeSpec>(
    tracker: &Mutex<Option<Weak<InternalNode<S>>>>,
    trans: &Transaction,
) -> Arc<InternalNode<S>> {
    let stable = tracker
        .lock()
        .as_ref()
        .and_then(Weak::upgrade)
        .expect("parent node evicted while child in use");
    assert!(stable.is_valid());
    match trans.pending_extent(stable.paddr()) {
        Some(pending) => crate::extent::cast::<InternalNode<S>>(&pending),
        None => stable,
    }
}

/// The slot-level interface shared by leaf and internal nodes. Structural
/// mutation (`merge_level`, the split walk) is written once against this
/// trait.
pub(crate) trait BtreeNode<S: TreeSpec>: NodeExtent {
    fn meta(&self) -> NodeMeta<S::Key>;
    fn len(&self) -> usize;
    fn capacity(&self) -> usize;
    fn key_at(&self, pos: usize) -> S::Key;

    fn at_max_capacity(&self) -> bool {
        self.len() == self.capacity()
    }

    fn below_min_capacity(&self) -> bool {
        self.len() < self.capacity() / 2
    }

    fn at_min_capacity(&self) -> bool {
        self.len() == self.capacity() / 2
    }

    /// Three-way split: `(left, right, pivot)`, both fresh extents owned
    /// by the operating transaction. `pivot` is `right`'s begin key.
    fn make_split_children(
        &self,
        c: &mut OpContext<'_>,
    ) -> (Arc<Self>, Arc<Self>, S::Key);

    /// Combine `self` (left) and `right` into one fresh node.
    fn make_full_merge(&self, c: &mut OpContext<'_>, right: &Arc<Self>) -> Arc<Self>;

    /// Redistribute `self` (left) and `right` around `pivot_idx`:
    /// `(new_left, new_right, new_pivot)`.
    fn make_balanced(
        &self,
        c: &mut OpContext<'_>,
        right: &Arc<Self>,
        pivot_idx: usize,
    ) -> (Arc<Self>, Arc<Self>, S::Key);

    fn balance_pivot_idx(&self, right: &Self) -> usize {
        (self.len() + right.len()) / 2
    }

    /// Copy content from `other` into this fresh extent (GC relocation).
    fn rewrite_from(&self, other: &Arc<Self>);

    /// Load the node at `paddr` with range `[begin, end)` at `depth`,
    /// linking through `parent_pos` when descending (or to the root block
    /// when `None`).
    fn fetch(
        c: &mut OpContext<'_>,
        depth: u8,
        paddr: Paddr,
        begin: S::Key,
        end: S::Key,
        parent_pos: Option<ChildPos<S>>,
    ) -> Result<Arc<Self>>;

    fn set_parent(&self, parent: Option<Weak<InternalNode<S>>>);
    fn peek_parent_node(&self) -> Option<Arc<InternalNode<S>>>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn node_meta_parent_relation() {
        let parent = NodeMeta::<u64>::new(0, u64::MAX, 2);
        let child = NodeMeta::<u64>::new(100, 200, 1);
        assert!(parent.is_parent_of(&child));
        assert!(!child.is_parent_of(&parent));

        let sibling_depth = NodeMeta::<u64>::new(100, 200, 2);
        assert!(!parent.is_parent_of(&sibling_depth));
    }

    #[test]
    fn node_meta_root_detection() {
        assert!(NodeMeta::<u64>::new(0, u64::MAX, 1).is_root());
        assert!(!NodeMeta::<u64>::new(1, u64::MAX, 1).is_root());
        assert!(!NodeMeta::<u64>::new(0, 100, 1).is_root());
    }

    #[test]
    #[should_panic(expected = "empty node range")]
    fn node_meta_rejects_empty_range() {
        NodeMeta::<u64>::new(5, 5, 1);
    }

    #[test]
    fn capacity_derivation() {
        // 4096-byte nodes: (4096 - 32) / 16 = 254 internal entries.
        assert_eq!(internal_capacity(4096), 254);
        // 12-byte values: (4096 - 32) / 20 = 203 leaf entries.
        assert_eq!(leaf_capacity(4096, 12), 203);
    }

    #[test]
    fn header_roundtrip_through_encode() {
        let meta = NodeMeta::<u64>::new(10, 500, 3);
        let (bytes, crc) = encode_node(
            ExtentKind::LbaInternal,
            meta,
            2,
            256,
            |payload| {
                payload.extend_from_slice(&1u64.to_le_bytes());
                payload.extend_from_slice(&2u64.to_le_bytes());
            },
        );
        assert_eq!(bytes.len(), 256);

        let (decoded_meta, len, header_crc, _payload) =
            decode_node_header::<u64>(ExtentKind::LbaInternal, 8, &bytes).unwrap();
        assert_eq!(decoded_meta, meta);
        assert_eq!(len, 2);
        assert_eq!(header_crc, crc);
    }

    #[test]
    fn decode_rejects_wrong_kind() {
        let meta = NodeMeta::<u64>::new(0, 100, 1);
        let (bytes, _) = encode_node(ExtentKind::LbaLeaf, meta, 0, 128, |_| {});
        assert!(decode_node_header::<u64>(ExtentKind::LbaInternal, 16, &bytes).is_err());
    }
}
