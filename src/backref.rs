//! # Back-Reference Map
//!
//! The back-reference tree is the inverse of the LBA map: keyed by device
//! offset, it records which logical address references each physical
//! extent and what kind of extent lives there. Garbage collection walks it
//! to find the owners of the extents it wants to relocate.
//!
//! Back-reference leaves do not track loaded children; the map only ever
//! points *at* extents, it never owns their in-memory instances.

use crate::config::DEFAULT_NODE_SIZE;
use crate::extent::{ExtentKind, TreeId};
use crate::lba::Laddr;
use crate::tree::{FixedKvTree, NodeValue, TreeCursor, TreeIter, TreeSpec};

/// Device offset serving as the back-reference key.
pub type BackrefKey = u64;

/// One back-reference: the logical owner and kind of the extent at the
/// keyed device offset.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackrefMapping {
    pub laddr: Laddr,
    pub len: u32,
    pub kind: ExtentKind,
}

impl BackrefMapping {
    pub fn new(laddr: Laddr, len: u32, kind: ExtentKind) -> BackrefMapping {
        BackrefMapping { laddr, len, kind }
    }
}

impl NodeValue for BackrefMapping {
    const ENCODED_LEN: usize = 16;

    fn encode_into(&self, out: &mut [u8]) {
        out[..8].copy_from_slice(&self.laddr.to_le_bytes());
        out[8..12].copy_from_slice(&self.len.to_le_bytes());
        out[12] = self.kind as u8;
        out[13..16].fill(0);
    }

    fn decode_from(buf: &[u8]) -> BackrefMapping {
        BackrefMapping {
            laddr: u64::from_le_bytes(buf[..8].try_into().unwrap()),
            len: u32::from_le_bytes(buf[8..12].try_into().unwrap()),
            kind: ExtentKind::from_raw(buf[12]).expect("corrupt back-reference kind"),
        }
    }

    fn extent_len(&self) -> u32 {
        self.len
    }
}

/// Tree specification of the back-reference map.
pub struct BackrefTreeSpec;

impl TreeSpec for BackrefTreeSpec {
    type Key = BackrefKey;
    type Value = BackrefMapping;

    const TREE_ID: TreeId = TreeId::Backref;
    const INTERNAL_KIND: ExtentKind = ExtentKind::BackrefInternal;
    const LEAF_KIND: ExtentKind = ExtentKind::BackrefLeaf;
    const NODE_SIZE: u32 = DEFAULT_NODE_SIZE;
    const LEAF_HAS_CHILDREN: bool = false;
}

pub type BackrefBtree = FixedKvTree<BackrefTreeSpec>;
pub type BackrefIter = TreeIter<BackrefTreeSpec>;
pub type BackrefCursor = TreeCursor<BackrefTreeSpec>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backref_codec_roundtrip() {
        let mapping = BackrefMapping::new(0xDEAD_BEEF, 4096, ExtentKind::Data);
        let mut buf = [0u8; BackrefMapping::ENCODED_LEN];
        mapping.encode_into(&mut buf);
        assert_eq!(BackrefMapping::decode_from(&buf), mapping);
    }

    #[test]
    fn backref_codec_covers_node_kinds() {
        for kind in [
            ExtentKind::LbaInternal,
            ExtentKind::LbaLeaf,
            ExtentKind::BackrefInternal,
            ExtentKind::BackrefLeaf,
        ] {
            let mapping = BackrefMapping::new(7, 512, kind);
            let mut buf = [0u8; BackrefMapping::ENCODED_LEN];
            mapping.encode_into(&mut buf);
            assert_eq!(BackrefMapping::decode_from(&buf).kind, kind);
        }
    }
}
