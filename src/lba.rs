//! # Logical-to-Physical Address Map
//!
//! The LBA tree maps logical addresses to physical extents: each entry
//! records where a logical range currently lives on the device and how
//! long it is. It is one of the two production instantiations of the
//! generic B+tree engine (the other is the back-reference map).
//!
//! ## Relative Address Encoding
//!
//! A mapping's physical address may be stored *relative* to the leaf that
//! contains it. This keeps intra-segment references stable when a whole
//! segment is relocated: the delta survives the move unchanged. The tree
//! iterator materializes absolute addresses on read
//! (`TreeIter::get_val` resolves against the owning leaf's paddr), so
//! callers never observe the relative form.
//!
//! ## Leaf Child Tracking
//!
//! LBA leaves reserve in-memory child slots for the logical data extents
//! their mappings describe, so a loaded data extent can be reached from
//! its mapping without a cache query. Populating the slots is the data
//! path's concern; the engine maintains them across structural mutation.

use crate::config::DEFAULT_NODE_SIZE;
use crate::extent::{ExtentKind, Paddr, TreeId};
use crate::tree::{FixedKvTree, NodeValue, TreeCursor, TreeIter, TreeSpec};

/// Logical address within the object store's flat address space.
pub type Laddr = u64;

/// One logical-to-physical mapping: the physical location and length of a
/// logical range.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LbaMapping {
    pub pladdr: Paddr,
    pub len: u32,
}

impl LbaMapping {
    pub fn new(pladdr: Paddr, len: u32) -> LbaMapping {
        LbaMapping { pladdr, len }
    }

    /// Re-encode the physical address relative to `base` (the owning
    /// leaf's paddr) for storage.
    pub fn relative_to(self, base: Paddr) -> LbaMapping {
        LbaMapping { pladdr: self.pladdr.relative_to(base), len: self.len }
    }
}

impl NodeValue for LbaMapping {
    const ENCODED_LEN: usize = 12;

    fn encode_into(&self, out: &mut [u8]) {
        out[..8].copy_from_slice(&self.pladdr.to_raw().to_le_bytes());
        out[8..12].copy_from_slice(&self.len.to_le_bytes());
    }

    fn decode_from(buf: &[u8]) -> LbaMapping {
        LbaMapping {
            pladdr: Paddr::from_raw(u64::from_le_bytes(buf[..8].try_into().unwrap())),
            len: u32::from_le_bytes(buf[8..12].try_into().unwrap()),
        }
    }

    fn extent_len(&self) -> u32 {
        self.len
    }

    fn maybe_relative_to(self, base: Paddr) -> LbaMapping {
        LbaMapping { pladdr: self.pladdr.maybe_relative_to(base), len: self.len }
    }
}

/// Tree specification of the LBA map.
pub struct LbaTreeSpec;

impl TreeSpec for LbaTreeSpec {
    type Key = Laddr;
    type Value = LbaMapping;

    const TREE_ID: TreeId = TreeId::Lba;
    const INTERNAL_KIND: ExtentKind = ExtentKind::LbaInternal;
    const LEAF_KIND: ExtentKind = ExtentKind::LbaLeaf;
    const NODE_SIZE: u32 = DEFAULT_NODE_SIZE;
    const LEAF_HAS_CHILDREN: bool = true;
}

pub type LbaBtree = FixedKvTree<LbaTreeSpec>;
pub type LbaIter = TreeIter<LbaTreeSpec>;
pub type LbaCursor = TreeCursor<LbaTreeSpec>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mapping_codec_roundtrip() {
        let mapping = LbaMapping::new(Paddr::new(0x1234_5678), 4096);
        let mut buf = [0u8; LbaMapping::ENCODED_LEN];
        mapping.encode_into(&mut buf);
        assert_eq!(LbaMapping::decode_from(&buf), mapping);
    }

    #[test]
    fn mapping_codec_preserves_relative_form() {
        let base = Paddr::new(0x8000);
        let mapping = LbaMapping::new(Paddr::new(0x9000), 512).relative_to(base);
        assert!(mapping.pladdr.is_relative());

        let mut buf = [0u8; LbaMapping::ENCODED_LEN];
        mapping.encode_into(&mut buf);
        let decoded = LbaMapping::decode_from(&buf);
        assert_eq!(decoded, mapping);

        let resolved = decoded.maybe_relative_to(base);
        assert_eq!(resolved.pladdr, Paddr::new(0x9000));
        assert_eq!(resolved.len, 512);
    }

    #[test]
    fn absolute_mapping_resolution_is_identity() {
        let mapping = LbaMapping::new(Paddr::new(0x7000), 8192);
        assert_eq!(mapping.maybe_relative_to(Paddr::new(0x100)), mapping);
    }

    #[test]
    fn extent_len_feeds_coverage_checks() {
        let mapping = LbaMapping::new(Paddr::new(0x7000), 20);
        assert_eq!(mapping.extent_len(), 20);
    }
}
