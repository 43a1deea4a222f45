//! # Root Block
//!
//! The root block is the anchor extent of the store: a single block at
//! device offset zero holding, for each tree, the physical address of the
//! current root node and the tree depth. It participates in the same
//! copy-on-write protocol as tree nodes; any operation that needs to move a
//! tree root first duplicates the root block for write and mutates the
//! duplicate.
//!
//! ## Root Record Layout
//!
//! ```text
//! +----------------------+
//! | magic (8B)           |
//! | lba_location (8B)    |  paddr of the LBA tree root node
//! | backref_location (8B)|  paddr of the backref tree root node
//! | lba_depth (1B)       |
//! | backref_depth (1B)   |
//! | reserved (6B)        |
//! +----------------------+
//! ```
//!
//! ## Root Node Links
//!
//! Besides the persisted record, the root block carries one in-memory weak
//! link per tree to the currently loaded root node. The link lets a lookup
//! discover an already-loaded root without re-reading the device, and is
//! re-established whenever a root node is loaded or the root moves. Links
//! are weak: the root block never extends a node's lifetime.

use std::any::Any;
use std::sync::{Arc, Weak};

use eyre::{ensure, Result};
use parking_lot::Mutex;
use zerocopy::little_endian::U64;
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout, Unaligned};

use crate::config::ROOT_BLOCK_SIZE;
use crate::zerocopy_accessors;

use super::{
    Extent, ExtentInfo, ExtentKind, ExtentRef, Paddr, TreeId, TREE_COUNT,
};

pub const ROOT_MAGIC: &[u8; 8] = b"cowtree\0";

/// Mutable projection of one tree's root slot: the root node's physical
/// address and the tree depth. Depth zero means the tree has not been
/// initialized yet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PhyTreeRoot {
    location: Paddr,
    depth: u8,
}

impl PhyTreeRoot {
    pub fn new(location: Paddr, depth: u8) -> PhyTreeRoot {
        PhyTreeRoot { location, depth }
    }

    pub fn location(&self) -> Paddr {
        self.location
    }

    pub fn depth(&self) -> u8 {
        self.depth
    }

    pub fn set_location(&mut self, location: Paddr) {
        self.location = location;
    }

    pub fn set_depth(&mut self, depth: u8) {
        self.depth = depth;
    }

    pub fn is_initialized(&self) -> bool {
        self.depth > 0
    }
}

impl Default for PhyTreeRoot {
    fn default() -> Self {
        PhyTreeRoot { location: Paddr::NULL, depth: 0 }
    }
}

/// The full persisted root record: one slot per tree.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RootRecord {
    slots: [PhyTreeRoot; TREE_COUNT],
}

impl RootRecord {
    pub fn tree_root(&self, id: TreeId) -> PhyTreeRoot {
        self.slots[id as usize]
    }

    pub fn set_tree_root(&mut self, id: TreeId, root: PhyTreeRoot) {
        self.slots[id as usize] = root;
    }
}

#[repr(C)]
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, Immutable, KnownLayout, Unaligned)]
struct RootRecordRepr {
    magic: [u8; 8],
    lba_location: U64,
    backref_location: U64,
    lba_depth: u8,
    backref_depth: u8,
    reserved: [u8; 6],
}

const _: () = assert!(std::mem::size_of::<RootRecordRepr>() == 32);
const _: () = assert!(std::mem::size_of::<RootRecordRepr>() <= ROOT_BLOCK_SIZE as usize);

impl RootRecordRepr {
    zerocopy_accessors! {
        lba_location: u64,
        backref_location: u64,
    }
}

/// The root block extent.
pub struct RootBlock {
    info: ExtentInfo,
    record: Mutex<RootRecord>,
    links: Mutex<[Option<Weak<dyn Extent>>; TREE_COUNT]>,
}

impl RootBlock {
    /// The root block always lives at device offset zero.
    pub fn paddr() -> Paddr {
        Paddr::new(0)
    }

    pub(crate) fn new(info: ExtentInfo, record: RootRecord) -> Arc<RootBlock> {
        assert_eq!(info.kind(), ExtentKind::RootBlock);
        Arc::new(RootBlock {
            info,
            record: Mutex::new(record),
            links: Mutex::new([None, None]),
        })
    }

    pub(crate) fn decode(info: ExtentInfo, bytes: &[u8]) -> Result<Arc<RootBlock>> {
        ensure!(
            bytes.len() >= std::mem::size_of::<RootRecordRepr>(),
            "root block truncated: {} bytes",
            bytes.len()
        );
        let repr = RootRecordRepr::ref_from_bytes(&bytes[..std::mem::size_of::<RootRecordRepr>()])
            .map_err(|e| eyre::eyre!("failed to parse root record: {e:?}"))?;
        ensure!(&repr.magic == ROOT_MAGIC, "invalid magic in root block");

        let mut record = RootRecord::default();
        record.set_tree_root(
            TreeId::Lba,
            PhyTreeRoot::new(Paddr::from_raw(repr.lba_location()), repr.lba_depth),
        );
        record.set_tree_root(
            TreeId::Backref,
            PhyTreeRoot::new(Paddr::from_raw(repr.backref_location()), repr.backref_depth),
        );
        Ok(RootBlock::new(info, record))
    }

    /// Read-only snapshot of one tree's root slot.
    pub fn tree_root(&self, id: TreeId) -> PhyTreeRoot {
        self.record.lock().tree_root(id)
    }

    /// Mutate one tree's root slot. Only legal on a pending duplicate.
    pub fn update_tree_root(&self, id: TreeId, f: impl FnOnce(&mut PhyTreeRoot)) {
        assert!(self.is_mutable(), "update_tree_root on immutable root block");
        let mut guard = self.record.lock();
        let mut root = guard.tree_root(id);
        f(&mut root);
        guard.set_tree_root(id, root);
        self.info.bump_modifications();
    }

    /// Remember `node` as tree `id`'s loaded root node.
    pub fn link_root_node(&self, id: TreeId, node: &ExtentRef) {
        self.links.lock()[id as usize] = Some(Arc::downgrade(node));
    }

    /// The loaded root node of tree `id`, if it is still alive.
    pub fn root_node(&self, id: TreeId) -> Option<ExtentRef> {
        self.links.lock()[id as usize].as_ref().and_then(Weak::upgrade)
    }
}

impl Extent for RootBlock {
    fn info(&self) -> &ExtentInfo {
        &self.info
    }

    fn as_any_arc(self: Arc<Self>) -> Arc<dyn Any + Send + Sync> {
        self
    }

    fn duplicate(self: Arc<Self>, trans_id: u64) -> ExtentRef {
        let record = *self.record.lock();
        let links = self.links.lock().clone();
        let prior: ExtentRef = self;
        Arc::new(RootBlock {
            info: ExtentInfo::pending_from(prior, trans_id),
            record: Mutex::new(record),
            links: Mutex::new(links),
        })
    }

    fn encode(&self) -> Vec<u8> {
        let record = self.record.lock();
        let lba = record.tree_root(TreeId::Lba);
        let backref = record.tree_root(TreeId::Backref);
        let repr = RootRecordRepr {
            magic: *ROOT_MAGIC,
            lba_location: U64::new(lba.location().to_raw()),
            backref_location: U64::new(backref.location().to_raw()),
            lba_depth: lba.depth(),
            backref_depth: backref.depth(),
            reserved: [0u8; 6],
        };
        let mut out = vec![0u8; ROOT_BLOCK_SIZE as usize];
        out[..std::mem::size_of::<RootRecordRepr>()].copy_from_slice(repr.as_bytes());
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::extent::ExtentState;

    fn stable_root_block() -> Arc<RootBlock> {
        RootBlock::new(
            ExtentInfo::stable(ExtentKind::RootBlock, RootBlock::paddr(), ROOT_BLOCK_SIZE),
            RootRecord::default(),
        )
    }

    #[test]
    fn root_record_defaults_to_uninitialized() {
        let rb = stable_root_block();
        let root = rb.tree_root(TreeId::Lba);
        assert!(!root.is_initialized());
        assert!(root.location().is_null());
    }

    #[test]
    fn encode_decode_roundtrip() {
        let rb = stable_root_block();
        let dup = rb.clone().duplicate(1);
        let dup = crate::extent::cast::<RootBlock>(&dup);
        dup.update_tree_root(TreeId::Lba, |r| {
            r.set_location(Paddr::new(0x2000));
            r.set_depth(3);
        });

        let bytes = dup.encode();
        let decoded = RootBlock::decode(
            ExtentInfo::stable(ExtentKind::RootBlock, RootBlock::paddr(), ROOT_BLOCK_SIZE),
            &bytes,
        )
        .unwrap();

        assert_eq!(decoded.tree_root(TreeId::Lba), dup.tree_root(TreeId::Lba));
        assert_eq!(
            decoded.tree_root(TreeId::Backref),
            dup.tree_root(TreeId::Backref)
        );
    }

    #[test]
    fn duplicate_keeps_prior_instance() {
        let rb = stable_root_block();
        let dup = rb.clone().duplicate(42);

        assert_eq!(dup.state(), ExtentState::MutationPending);
        assert_eq!(dup.info().pending_on(), 42);
        let prior = dup.prior_instance().unwrap();
        assert!(Arc::ptr_eq(
            &crate::extent::cast::<RootBlock>(&prior),
            &rb
        ));
    }

    #[test]
    #[should_panic(expected = "immutable root block")]
    fn stable_root_block_rejects_mutation() {
        let rb = stable_root_block();
        rb.update_tree_root(TreeId::Lba, |r| r.set_depth(1));
    }

    #[test]
    fn decode_rejects_bad_magic() {
        let rb = stable_root_block();
        let mut bytes = rb.encode();
        bytes[0] = b'x';
        let err = RootBlock::decode(
            ExtentInfo::stable(ExtentKind::RootBlock, RootBlock::paddr(), ROOT_BLOCK_SIZE),
            &bytes,
        );
        assert!(err.is_err());
    }
}
