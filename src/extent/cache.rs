//! # Extent Cache
//!
//! The extent cache owns every persisted block in the store: it allocates
//! extents, loads them from the backing device, hands out transaction-local
//! mutable duplicates, and installs a transaction's write set at commit.
//! The tree engine never touches the device directly.
//!
//! ## Architecture
//!
//! ```text
//! ExtentCache
//! ├── device          committed bytes by paddr + allocation cursor
//! ├── loaded          stable extents currently materialized in memory
//! ├── committed_crc   payload checksum recorded at commit, re-checked
//! │                   against the in-extent checksum on every fresh load
//! └── root            the stable root block (device offset 0)
//! ```
//!
//! ## Load Atomicity
//!
//! `get_absent_extent` performs the loaded-map check, the device read, the
//! decode, the caller's init hook (which links the extent into the tree's
//! parent/child graph) and the loaded-map insert under one write lock.
//! Two racing transactions can therefore never materialize two in-memory
//! copies of the same stable extent. That is the invariant the tree's `get_child`
//! reservation protocol depends on.
//!
//! ## Commit
//!
//! Commit is the visibility boundary. For each pending extent the cache
//! writes the serialized bytes at the extent's paddr, records the payload
//! checksum, retires the prior stable instance and installs the pending
//! copy as the new stable version. Explicitly retired extents are marked
//! dead and their device blocks freed. A transaction dropped before commit
//! changes nothing: its pending and fresh extents are simply discarded.
//!
//! ## Eviction
//!
//! `evict_clean` drops all loaded stable extents (the root block stays).
//! Subsequent access takes the fresh-load path: decode, checksum check and
//! re-linking via the init hook. Tests use it to exercise rehydration.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use eyre::{bail, ensure, Result};
use hashbrown::HashMap;
use parking_lot::RwLock;
use tracing::{debug, trace};

use crate::config::ROOT_BLOCK_SIZE;
use crate::trans::Transaction;

use super::root_block::{RootBlock, RootRecord};
use super::{
    cast, crc64, try_cast, Extent, ExtentInfo, ExtentKind, ExtentRef, NodeExtent, Paddr,
    PlacementHint,
};

/// In-memory backing device: committed bytes by offset plus a bump
/// allocator. Freed blocks are dropped; offsets are never reused.
struct Device {
    blocks: HashMap<u64, Box<[u8]>>,
    next_offset: u64,
}

impl Device {
    fn new() -> Device {
        Device {
            blocks: HashMap::new(),
            next_offset: ROOT_BLOCK_SIZE as u64,
        }
    }

    fn alloc(&mut self, len: u32) -> Paddr {
        let offset = self.next_offset;
        self.next_offset += u64::from(len.max(8)).next_multiple_of(8);
        Paddr::new(offset)
    }

    fn write(&mut self, paddr: Paddr, bytes: Vec<u8>) {
        self.blocks.insert(paddr.offset(), bytes.into_boxed_slice());
    }

    fn read(&self, paddr: Paddr) -> Result<&[u8]> {
        match self.blocks.get(&paddr.offset()) {
            Some(bytes) => Ok(bytes),
            None => bail!("device read of absent extent at {paddr}"),
        }
    }

    fn free(&mut self, paddr: Paddr) {
        self.blocks.remove(&paddr.offset());
    }
}

struct CacheInner {
    device: Device,
    /// Stable extents currently materialized, by raw paddr. Pending
    /// extents live in their transaction, never here.
    loaded: HashMap<u64, ExtentRef>,
    /// Payload checksum recorded at commit, by raw paddr.
    committed_crc: HashMap<u64, u64>,
    root: Option<Arc<RootBlock>>,
}

pub struct ExtentCache {
    inner: RwLock<CacheInner>,
    next_trans_id: AtomicU64,
}

impl Default for ExtentCache {
    fn default() -> Self {
        ExtentCache::new()
    }
}

impl ExtentCache {
    pub fn new() -> ExtentCache {
        ExtentCache {
            inner: RwLock::new(CacheInner {
                device: Device::new(),
                loaded: HashMap::new(),
                committed_crc: HashMap::new(),
                root: None,
            }),
            next_trans_id: AtomicU64::new(1),
        }
    }

    /// Initialize an empty store: writes a root block with uninitialized
    /// tree roots at device offset zero. Each tree is then initialized by
    /// its own `mkfs` inside a transaction.
    pub fn mkfs(&self) -> Result<Arc<RootBlock>> {
        let mut inner = self.inner.write();
        ensure!(inner.root.is_none(), "mkfs on an initialized store");

        let info = ExtentInfo::stable(ExtentKind::RootBlock, RootBlock::paddr(), ROOT_BLOCK_SIZE);
        let root = RootBlock::new(info, RootRecord::default());
        let bytes = root.encode();
        let crc = crc64(&bytes);
        root.info().set_in_extent_checksum(crc);
        root.info().set_last_committed_crc(crc);
        inner.committed_crc.insert(RootBlock::paddr().to_raw(), crc);
        inner.device.write(RootBlock::paddr(), bytes);
        inner.root = Some(root.clone());

        debug!("mkfs: root block installed");
        Ok(root)
    }

    pub fn begin(&self) -> Transaction {
        Transaction::new(self.next_trans_id.fetch_add(1, Ordering::Relaxed), false)
    }

    pub fn begin_weak(&self) -> Transaction {
        Transaction::new(self.next_trans_id.fetch_add(1, Ordering::Relaxed), true)
    }

    /// The root block as seen by `trans`: its pending duplicate if it has
    /// one, else the stable root block (loaded from the device on first
    /// access).
    pub fn get_root(&self, trans: &Transaction) -> Result<Arc<RootBlock>> {
        if let Some(root) = trans.pending_root() {
            return Ok(root);
        }
        if let Some(root) = self.inner.read().root.clone() {
            return Ok(root);
        }

        let mut inner = self.inner.write();
        if let Some(root) = inner.root.clone() {
            return Ok(root);
        }
        let bytes = inner.device.read(RootBlock::paddr())?.to_vec();
        let crc = crc64(&bytes);
        let committed = inner
            .committed_crc
            .get(&RootBlock::paddr().to_raw())
            .copied();
        assert_eq!(
            Some(crc),
            committed,
            "root block checksum inconsistent with committed crc"
        );
        let info = ExtentInfo::stable(ExtentKind::RootBlock, RootBlock::paddr(), ROOT_BLOCK_SIZE);
        info.set_in_extent_checksum(crc);
        info.set_last_committed_crc(crc);
        let root = RootBlock::decode(info, &bytes)?;
        inner.root = Some(root.clone());
        Ok(root)
    }

    /// Like [`ExtentCache::get_root`] but assumes the root block is
    /// already in memory (it always is after `mkfs` or a prior
    /// `get_root`).
    pub fn get_root_fast(&self, trans: &Transaction) -> Arc<RootBlock> {
        if let Some(root) = trans.pending_root() {
            return root;
        }
        self.inner
            .read()
            .root
            .clone()
            .expect("get_root_fast before store initialization")
    }

    /// Fetch the extent at `paddr`, materializing it from the device if it
    /// is not already loaded. `init` runs on first materialization (and is
    /// re-run by the tree when it finds a stable, unlinked instance). The
    /// check-load-link sequence is atomic.
    pub fn get_absent_extent<N: NodeExtent>(
        &self,
        trans: &mut Transaction,
        paddr: Paddr,
        len: u32,
        init: impl Fn(&Arc<N>),
    ) -> Result<Arc<N>> {
        if let Some(pending) = trans.pending_extent(paddr) {
            return Ok(cast::<N>(&pending));
        }

        let mut inner = self.inner.write();
        if let Some(loaded) = inner.loaded.get(&paddr.to_raw()) {
            return try_cast::<N>(loaded).ok_or_else(|| {
                eyre::eyre!(
                    "extent at {paddr} has kind {:?}, expected {:?}",
                    loaded.kind(),
                    N::KIND
                )
            });
        }

        trace!(%paddr, kind = ?N::KIND, "loading extent from device");
        let bytes = inner.device.read(paddr)?.to_vec();
        ensure!(
            bytes.len() == len as usize,
            "extent at {paddr} has length {}, expected {len}",
            bytes.len()
        );
        let info = ExtentInfo::stable(N::KIND, paddr, len);
        let node = N::decode(info, &bytes)?;

        let committed = inner.committed_crc.get(&paddr.to_raw()).copied();
        match committed {
            Some(crc) => node.info().set_last_committed_crc(crc),
            None => bail!("extent at {paddr} was never committed"),
        }

        init(&node);
        let as_ref: ExtentRef = node.clone();
        inner.loaded.insert(paddr.to_raw(), as_ref);
        Ok(node)
    }

    /// Allocate a fresh non-data extent owned by `trans`.
    pub fn alloc_new_non_data_extent<N: NodeExtent>(
        &self,
        trans: &mut Transaction,
        len: u32,
        hint: PlacementHint,
        generation: u32,
    ) -> Arc<N> {
        let paddr = self.inner.write().device.alloc(len);
        let info = ExtentInfo::fresh(N::KIND, paddr, len, hint, generation, trans.id());
        let node = N::new_empty(info);
        trans.record_pending(node.clone());
        trace!(%paddr, kind = ?N::KIND, "allocated fresh extent");
        node
    }

    /// The transaction-local mutable version of `e`. Idempotent: a
    /// transaction holds at most one duplicate per paddr.
    pub fn duplicate_for_write(&self, trans: &mut Transaction, e: &ExtentRef) -> ExtentRef {
        if e.is_pending() {
            assert_eq!(
                e.info().pending_on(),
                trans.id(),
                "pending extent owned by another transaction"
            );
            return e.clone();
        }
        assert!(e.is_stable(), "duplicate_for_write on {:?} extent", e.state());
        if let Some(pending) = trans.pending_extent(e.paddr()) {
            return pending;
        }
        let dup = e.clone().duplicate(trans.id());
        trans.record_pending(dup.clone());
        trace!(paddr = %e.paddr(), "duplicated extent for write");
        dup
    }

    /// The transaction-local mutable root block.
    pub fn duplicate_root_for_write(
        &self,
        trans: &mut Transaction,
        root: &Arc<RootBlock>,
    ) -> Arc<RootBlock> {
        if root.is_pending() {
            assert_eq!(root.info().pending_on(), trans.id());
            return root.clone();
        }
        if let Some(pending) = trans.pending_root() {
            return pending;
        }
        let as_ref: ExtentRef = root.clone();
        let dup = cast::<RootBlock>(&as_ref.duplicate(trans.id()));
        trans.set_pending_root(dup.clone());
        trace!("duplicated root block for write");
        dup
    }

    /// Remove `e` from the store at commit. Retiring a pending extent also
    /// retires its prior stable instance.
    pub fn retire_extent(&self, trans: &mut Transaction, e: &ExtentRef) {
        trace!(paddr = %e.paddr(), state = ?e.state(), "retire extent");
        if e.is_pending() {
            assert_eq!(e.info().pending_on(), trans.id());
            let prior = e.prior_instance();
            let dropped = trans.drop_pending(e.paddr());
            assert!(dropped.is_some(), "pending extent missing from its transaction");
            e.info().mark_retired();
            if let Some(prior) = prior {
                trans.record_retired(prior);
            }
        } else {
            assert!(e.is_stable(), "retire of {:?} extent", e.state());
            trans.record_retired(e.clone());
        }
    }

    /// Install `trans`'s write set as the new committed state.
    pub fn commit(&self, mut trans: Transaction) -> Result<()> {
        assert!(!trans.is_weak(), "commit of a weak transaction");
        let (pending, retired, pending_root) = trans.take_write_set();
        let mut inner = self.inner.write();

        for e in &retired {
            if !e.is_stable() {
                continue;
            }
            let paddr = e.paddr();
            e.info().mark_retired();
            inner.loaded.remove(&paddr.to_raw());
            inner.committed_crc.remove(&paddr.to_raw());
            inner.device.free(paddr);
            trace!(%paddr, "retired stable extent at commit");
        }

        for (raw, e) in pending {
            let paddr = Paddr::from_raw(raw);
            let bytes = e.encode();
            let crc = e.in_extent_checksum();
            inner.device.write(paddr, bytes);
            inner.committed_crc.insert(raw, crc);
            e.info().set_last_committed_crc(crc);
            let had_prior = match e.prior_instance() {
                Some(prior) => {
                    prior.info().mark_retired();
                    true
                }
                None => false,
            };
            e.info().mark_stable();
            if had_prior {
                e.clone().on_replace_prior();
            }
            inner.loaded.insert(raw, e);
        }

        if let Some(root) = pending_root {
            let bytes = root.encode();
            let crc = crc64(&bytes);
            root.info().set_in_extent_checksum(crc);
            root.info().set_last_committed_crc(crc);
            inner
                .committed_crc
                .insert(RootBlock::paddr().to_raw(), crc);
            inner.device.write(RootBlock::paddr(), bytes);
            if let Some(prior) = root.prior_instance() {
                prior.info().mark_retired();
            }
            root.info().mark_stable();
            inner.root = Some(root);
            debug!("commit installed new root block");
        }

        Ok(())
    }

    /// Debug probe: is the stable extent at `paddr` materialized?
    pub fn test_query_cache(&self, paddr: Paddr) -> Option<ExtentRef> {
        self.inner.read().loaded.get(&paddr.to_raw()).cloned()
    }

    /// Drop every loaded stable extent (the root block stays). Subsequent
    /// access re-reads the device, re-verifying checksums and re-linking.
    pub fn evict_clean(&self) {
        let mut inner = self.inner.write();
        let evicted = inner.loaded.len();
        inner.loaded.clear();
        debug!(evicted, "evicted clean extents");
    }

    /// Number of committed extents on the device, root block included
    /// (test visibility).
    pub fn committed_extents(&self) -> usize {
        self.inner.read().device.blocks.len()
    }

    /// Number of materialized stable extents (test visibility).
    pub fn loaded_extents(&self) -> usize {
        self.inner.read().loaded.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::extent::ExtentState;

    #[test]
    fn mkfs_installs_root_block() {
        let cache = ExtentCache::new();
        let root = cache.mkfs().unwrap();

        assert!(root.is_stable());
        assert_eq!(cache.committed_extents(), 1);

        let trans = cache.begin();
        let seen = cache.get_root(&trans).unwrap();
        assert!(Arc::ptr_eq(&seen, &root));
    }

    #[test]
    fn mkfs_twice_fails() {
        let cache = ExtentCache::new();
        cache.mkfs().unwrap();
        assert!(cache.mkfs().is_err());
    }

    #[test]
    fn duplicate_root_for_write_is_idempotent() {
        let cache = ExtentCache::new();
        let root = cache.mkfs().unwrap();

        let mut trans = cache.begin();
        let dup1 = cache.duplicate_root_for_write(&mut trans, &root);
        let dup2 = cache.duplicate_root_for_write(&mut trans, &root);

        assert!(Arc::ptr_eq(&dup1, &dup2));
        assert_eq!(dup1.state(), ExtentState::MutationPending);
        assert!(!Arc::ptr_eq(&dup1, &root));
    }

    #[test]
    fn commit_installs_pending_root() {
        let cache = ExtentCache::new();
        let root = cache.mkfs().unwrap();

        let mut trans = cache.begin();
        let dup = cache.duplicate_root_for_write(&mut trans, &root);
        dup.update_tree_root(crate::extent::TreeId::Lba, |r| {
            r.set_location(Paddr::new(0x1000));
            r.set_depth(1);
        });
        cache.commit(trans).unwrap();

        assert_eq!(root.state(), ExtentState::Retired);
        let trans = cache.begin();
        let current = cache.get_root(&trans).unwrap();
        assert_eq!(
            current
                .tree_root(crate::extent::TreeId::Lba)
                .location(),
            Paddr::new(0x1000)
        );
    }

    #[test]
    fn dropped_transaction_changes_nothing() {
        let cache = ExtentCache::new();
        let root = cache.mkfs().unwrap();

        {
            let mut trans = cache.begin();
            let dup = cache.duplicate_root_for_write(&mut trans, &root);
            dup.update_tree_root(crate::extent::TreeId::Lba, |r| r.set_depth(5));
            // no commit
        }

        let trans = cache.begin();
        let current = cache.get_root(&trans).unwrap();
        assert!(Arc::ptr_eq(&current, &root));
        assert_eq!(current.tree_root(crate::extent::TreeId::Lba).depth(), 0);
    }

    #[test]
    fn allocation_offsets_never_collide_with_root() {
        let cache = ExtentCache::new();
        cache.mkfs().unwrap();
        let mut inner = cache.inner.write();
        let a = inner.device.alloc(4096);
        let b = inner.device.alloc(4096);
        assert!(a.offset() >= u64::from(ROOT_BLOCK_SIZE));
        assert!(b.offset() >= a.offset() + 4096);
    }
}
