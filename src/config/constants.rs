//! # cowtree Configuration Constants
//!
//! This module centralizes all configuration constants, grouping interdependent
//! values together and documenting their relationships. Constants that depend
//! on each other are co-located to prevent mismatch bugs.
//!
//! ## Dependency Graph
//!
//! ```text
//! DEFAULT_NODE_SIZE (4096 bytes)
//!       │
//!       ├─> NODE_HEADER_SIZE (32 bytes, fixed)
//!       │     Every serialized node starts with a fixed header carrying
//!       │     kind, depth, entry count, range bounds and payload CRC.
//!       │
//!       └─> per-tree fanout (derived: (node_size - header) / entry_size)
//!             Entry sizes depend on the tree's value encoding, so the
//!             fanout is computed in the node layer, not here.
//!
//! MAX_DEPTH (8)
//!       │
//!       └─> Iterator ancestor stacks are inline up to MAX_DEPTH - 1
//!           entries. A split that would grow the tree past MAX_DEPTH
//!           aborts the process.
//!
//! ROOT_BLOCK_SIZE (512 bytes)
//!       │
//!       └─> The root block occupies the device region [0, ROOT_BLOCK_SIZE)
//!           and extent allocation starts after it.
//! ```
//!
//! ## Critical Invariants
//!
//! These invariants are enforced by compile-time assertions:
//!
//! 1. `DEFAULT_NODE_SIZE > NODE_HEADER_SIZE` (a node can hold entries)
//! 2. `ROOT_BLOCK_SIZE` holds the serialized root record
//! 3. `MAX_DEPTH >= 2` (trees can grow past a single leaf)

/// Maximum depth of any tree. A split that would exceed this aborts.
pub const MAX_DEPTH: u8 = 8;

/// Serialized size of the fixed node header (kind, depth, len, range, crc).
pub const NODE_HEADER_SIZE: usize = 32;

/// Default node extent size for the production tree instantiations.
///
/// Smaller sizes are legal (tests use them to force deep trees); the only
/// hard floor is room for the header plus at least four entries so that
/// split and merge both have material to work with.
pub const DEFAULT_NODE_SIZE: u32 = 4096;

/// Device region reserved for the root block. Extent allocation begins at
/// this offset, so a paddr of zero always denotes the root block itself.
pub const ROOT_BLOCK_SIZE: u32 = 512;

/// Rewrite generation assigned to extents allocated outside of garbage
/// collection. GC bumps the generation when relocating an extent.
pub const INIT_GENERATION: u32 = 0;

const _: () = assert!(
    DEFAULT_NODE_SIZE as usize > NODE_HEADER_SIZE,
    "node size must leave room for entries after the header"
);

const _: () = assert!(MAX_DEPTH >= 2, "trees must be able to grow past a single leaf");

const _: () = assert!(
    ROOT_BLOCK_SIZE >= 64,
    "root block must hold the serialized root record"
);
