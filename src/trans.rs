//! # Transactions
//!
//! A [`Transaction`] is the unit of isolation for tree operations. It owns
//! the transaction-local extent sets of the copy-on-write protocol:
//!
//! - **pending**: mutable duplicates of stable extents, keyed by paddr
//!   (a transaction holds at most one duplicate per address);
//! - **fresh**: newly allocated extents, tracked in the same map since
//!   they also own their paddr;
//! - **retired**: extents this transaction replaced or freed;
//! - a pending duplicate of the root block, when a structural change moved
//!   a tree root.
//!
//! Nothing a transaction does is visible to other transactions until
//! [`crate::extent::cache::ExtentCache::commit`] installs the pending sets.
//! Dropping a transaction without committing cancels it: pending and fresh
//! extents are discarded and the committed store is untouched.
//!
//! ## Weak Transactions
//!
//! Read-only scans (garbage collection probes, invariant walks) run on
//! *weak* transactions. Weak transactions skip viewability assertions
//! (they may legitimately observe extents another transaction is about to
//! replace) and must not write.
//!
//! ## Statistics
//!
//! Each transaction carries one [`TreeStats`] per tree. The engine updates
//! the counters as it goes; the surrounding system folds them into global
//! statistics at commit. `extents_num_delta` tracks the net number of
//! extents allocated minus retired, which end-to-end tests use to verify
//! structural mutations balance out.

use hashbrown::HashMap;
use smallvec::SmallVec;
use std::sync::Arc;

use crate::extent::cache::ExtentCache;
use crate::extent::root_block::RootBlock;
use crate::extent::{ExtentRef, ExtentState, Paddr, TreeId, TREE_COUNT};

/// Per-tree operation counters, folded into global stats at commit.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TreeStats {
    pub depth: u8,
    pub num_inserts: u64,
    pub num_updates: u64,
    pub num_erases: u64,
    pub extents_num_delta: i64,
}

/// Result of the debug-only reverse lookup [`Transaction::get_extent`].
#[derive(Clone)]
pub enum GetExtentResult {
    Present(ExtentRef),
    Absent,
}

impl std::fmt::Debug for GetExtentResult {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            GetExtentResult::Present(_) => f.debug_tuple("Present").field(&"..").finish(),
            GetExtentResult::Absent => write!(f, "Absent"),
        }
    }
}

pub struct Transaction {
    id: u64,
    weak: bool,
    /// Pending and fresh extents by raw paddr.
    pending: HashMap<u64, ExtentRef>,
    retired: SmallVec<[ExtentRef; 16]>,
    pending_root: Option<Arc<RootBlock>>,
    stats: [TreeStats; TREE_COUNT],
}

impl Transaction {
    pub(crate) fn new(id: u64, weak: bool) -> Transaction {
        assert!(id != 0, "transaction id zero is reserved");
        Transaction {
            id,
            weak,
            pending: HashMap::new(),
            retired: SmallVec::new(),
            pending_root: None,
            stats: [TreeStats::default(); TREE_COUNT],
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    /// Weak transactions are read-only and skip viewability assertions.
    pub fn is_weak(&self) -> bool {
        self.weak
    }

    pub fn stats(&self, id: TreeId) -> &TreeStats {
        &self.stats[id as usize]
    }

    pub fn stats_mut(&mut self, id: TreeId) -> &mut TreeStats {
        &mut self.stats[id as usize]
    }

    /// This transaction's pending copy of the extent at `paddr`, if any.
    pub fn pending_extent(&self, paddr: Paddr) -> Option<ExtentRef> {
        self.pending.get(&paddr.to_raw()).cloned()
    }

    pub(crate) fn record_pending(&mut self, e: ExtentRef) {
        assert!(e.is_pending(), "record_pending on {:?} extent", e.state());
        assert_eq!(e.info().pending_on(), self.id);
        let prev = self.pending.insert(e.paddr().to_raw(), e);
        assert!(prev.is_none(), "duplicate pending extent at one paddr");
    }

    pub(crate) fn record_retired(&mut self, e: ExtentRef) {
        self.retired.push(e);
    }

    pub(crate) fn drop_pending(&mut self, paddr: Paddr) -> Option<ExtentRef> {
        self.pending.remove(&paddr.to_raw())
    }

    pub(crate) fn pending_root(&self) -> Option<Arc<RootBlock>> {
        self.pending_root.clone()
    }

    pub(crate) fn set_pending_root(&mut self, root: Arc<RootBlock>) {
        self.pending_root = Some(root);
    }

    pub fn is_retired(&self, e: &ExtentRef) -> bool {
        self.retired.iter().any(|r| Arc::ptr_eq(r, e))
    }

    /// Whether `e` is the version of its extent this transaction should
    /// observe: stable and not shadowed by a pending copy, or pending and
    /// owned by this transaction.
    pub fn is_viewable(&self, e: &ExtentRef) -> bool {
        if self.is_retired(e) {
            return false;
        }
        match e.state() {
            ExtentState::Stable => !self.pending.contains_key(&e.paddr().to_raw()),
            ExtentState::MutationPending | ExtentState::Fresh => {
                e.info().pending_on() == self.id
            }
            ExtentState::Retired => false,
        }
    }

    /// Debug-only reverse lookup into the transaction's write set.
    pub fn get_extent(&self, paddr: Paddr) -> GetExtentResult {
        match self.pending.get(&paddr.to_raw()) {
            Some(e) => GetExtentResult::Present(e.clone()),
            None => GetExtentResult::Absent,
        }
    }

    /// Number of pending/fresh extents (test visibility).
    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    pub(crate) fn take_write_set(
        &mut self,
    ) -> (
        HashMap<u64, ExtentRef>,
        SmallVec<[ExtentRef; 16]>,
        Option<Arc<RootBlock>>,
    ) {
        (
            std::mem::take(&mut self.pending),
            std::mem::take(&mut self.retired),
            self.pending_root.take(),
        )
    }
}

/// The context threaded through every tree operation: the shared cache and
/// the operating transaction.
pub struct OpContext<'a> {
    pub cache: &'a ExtentCache,
    pub trans: &'a mut Transaction,
}

impl<'a> OpContext<'a> {
    pub fn new(cache: &'a ExtentCache, trans: &'a mut Transaction) -> OpContext<'a> {
        OpContext { cache, trans }
    }
}
