//! # cowtree - Transactional Copy-on-Write B+Tree Engine
//!
//! cowtree is the address-mapping core of an extent-based object store: a
//! transactional, copy-on-write B+tree over fixed-size keys and values,
//! instantiated as the logical-to-physical address map (LBA) and the
//! back-reference map.
//!
//! - **Copy-on-write everywhere**: committed extents are immutable; every
//!   mutation builds transaction-local duplicates or fresh extents that
//!   become visible only at commit.
//! - **One descent routine**: all positioning operations are selector
//!   closures over a single root-to-leaf lookup engine.
//! - **GC-aware**: the tree answers liveness queries for out-of-band
//!   cached nodes and relocates live nodes without touching their keys.
//!
//! ## Quick Start
//!
//! ```ignore
//! use cowtree::extent::cache::ExtentCache;
//! use cowtree::lba::{LbaBtree, LbaMapping, LbaTreeSpec};
//! use cowtree::tree::with_btree;
//! use cowtree::extent::Paddr;
//!
//! let cache = ExtentCache::new();
//! cache.mkfs()?;
//!
//! let mut trans = cache.begin();
//! with_btree::<LbaTreeSpec, _>(&cache, &mut trans, |tree, c| {
//!     LbaBtree::mkfs(c)?;
//!     Ok(())
//! })?;
//! cache.commit(trans)?;
//!
//! let mut trans = cache.begin();
//! with_btree::<LbaTreeSpec, _>(&cache, &mut trans, |tree, c| {
//!     tree.insert(c, 42, LbaMapping::new(Paddr::new(0x8000), 4096))?;
//!     let iter = tree.lower_bound(c, 42)?;
//!     assert_eq!(iter.get_key(), 42);
//!     Ok(())
//! })?;
//! cache.commit(trans)?;
//! ```
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────┐
//! │   Tree instantiations (lba, backref)     │
//! ├──────────────────────────────────────────┤
//! │   B+tree engine (tree)                   │
//! │   lookup · insert/update/remove ·        │
//! │   split/merge · liveness/rewrite · iter  │
//! ├──────────────────────────────────────────┤
//! │   Transactions (trans)                   │
//! │   pending/fresh/retired sets · stats     │
//! ├──────────────────────────────────────────┤
//! │   Extent cache (extent)                  │
//! │   CoW protocol · root block · device     │
//! └──────────────────────────────────────────┘
//! ```
//!
//! ## Concurrency Model
//!
//! Operations within one transaction are strictly sequential (`&mut
//! Transaction`); distinct transactions may run concurrently and are
//! isolated by the copy-on-write protocol. Commit is the visibility
//! boundary; dropping a transaction before commit cancels it without a
//! trace. Any mutating tree operation invalidates all outstanding
//! iterators of the same transaction.
//!
//! ## Module Overview
//!
//! - [`extent`]: physical addresses, extent states, the cache and the
//!   root block
//! - [`trans`]: transactions and per-tree statistics
//! - [`tree`]: the generic B+tree engine
//! - [`lba`]: the logical-to-physical address map instantiation
//! - [`backref`]: the back-reference map instantiation
//! - [`config`]: centralized constants

mod macros;

pub mod backref;
pub mod config;
pub mod extent;
pub mod lba;
pub mod trans;
pub mod tree;

pub use extent::cache::ExtentCache;
pub use extent::root_block::{PhyTreeRoot, RootBlock};
pub use extent::{Extent, ExtentKind, ExtentRef, ExtentState, Paddr, PlacementHint, TreeId};
pub use trans::{GetExtentResult, OpContext, Transaction, TreeStats};
pub use tree::{
    with_btree, with_btree_state, FixedKvTree, NodeKey, NodeMeta, NodeValue, TreeCursor,
    TreeIter, TreeSpec,
};
