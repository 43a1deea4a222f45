//! # Extent Model
//!
//! This module defines the extent abstraction shared by every cache-managed
//! block in cowtree: physical addresses, extent kinds, the copy-on-write
//! state machine, and the bookkeeping record (`ExtentInfo`) embedded in every
//! concrete extent type.
//!
//! ## Physical Addresses
//!
//! A [`Paddr`] identifies a fixed-size block on the backing device. Values
//! stored inside tree nodes may encode a paddr *relative* to the owning
//! node's own address; the high bit of the raw representation marks the
//! relative form. Relative addresses are resolved against a base with
//! [`Paddr::maybe_relative_to`] when a value is read back out of a leaf.
//!
//! ```text
//! bit 63    bits 62..0
//! +---+---------------------------+
//! | R |  offset / signed delta    |
//! +---+---------------------------+
//! R = 0: absolute device offset
//! R = 1: delta from the owning extent's paddr (mod 2^63)
//! ```
//!
//! ## Copy-on-Write States
//!
//! ```text
//!              duplicate_for_write              commit
//!  ┌────────┐ ──────────────────────> ┌─────────────────┐ ──────> Stable
//!  │ Stable │                         │ MutationPending │
//!  └────────┘ <── prior_instance ──── └─────────────────┘
//!       │                                      (prior retired at commit)
//!       │ retire_extent + commit
//!       v
//!  ┌─────────┐        alloc_new_non_data_extent         commit
//!  │ Retired │                         ┌───────┐ ─────────────> Stable
//!  └─────────┘                         │ Fresh │
//!                                      └───────┘
//! ```
//!
//! A `Stable` extent is the committed version visible to every transaction
//! and is never mutated in place. `MutationPending` and `Fresh` extents are
//! private to the transaction that created them until commit. `Retired`
//! extents are dead: `is_valid()` is false and liveness checks reject them.
//!
//! ## Thread Safety
//!
//! `ExtentInfo` uses atomics for the hot read-side fields (paddr, counters,
//! checksums) and a mutex for the state + prior-instance pair so that a
//! state transition and its back-reference update are observed together.

use std::any::Any;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

pub mod cache;
pub mod root_block;

const RELATIVE_BIT: u64 = 1 << 63;
const NULL_RAW: u64 = u64::MAX;

/// Physical address of an extent on the backing device.
///
/// May be absolute (a device offset) or relative (a signed delta from the
/// owning extent's address, used by values journaled inside tree nodes).
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Paddr(u64);

impl Paddr {
    /// Sentinel for "no address".
    pub const NULL: Paddr = Paddr(NULL_RAW);

    /// An absolute address at `offset`.
    pub fn new(offset: u64) -> Paddr {
        assert!(offset & RELATIVE_BIT == 0, "paddr offset {offset:#x} overflows");
        Paddr(offset)
    }

    pub fn is_null(&self) -> bool {
        self.0 == NULL_RAW
    }

    pub fn is_relative(&self) -> bool {
        !self.is_null() && self.0 & RELATIVE_BIT != 0
    }

    pub fn is_absolute(&self) -> bool {
        !self.is_null() && self.0 & RELATIVE_BIT == 0
    }

    /// Device offset of an absolute address.
    pub fn offset(&self) -> u64 {
        assert!(self.is_absolute(), "offset() on non-absolute paddr {self:?}");
        self.0
    }

    /// Re-encode `self` as a delta from `base`. Both must be absolute.
    ///
    /// Deltas are stored mod 2^63, so resolution wraps exactly as long as
    /// device offsets stay below 2^63 (guaranteed by [`Paddr::new`]).
    pub fn relative_to(&self, base: Paddr) -> Paddr {
        assert!(self.is_absolute() && base.is_absolute());
        Paddr(RELATIVE_BIT | (self.0.wrapping_sub(base.0) & !RELATIVE_BIT))
    }

    /// Resolve against `base` if relative; identity for absolute addresses.
    pub fn maybe_relative_to(&self, base: Paddr) -> Paddr {
        if self.is_relative() {
            assert!(base.is_absolute());
            Paddr(base.0.wrapping_add(self.0 & !RELATIVE_BIT) & !RELATIVE_BIT)
        } else {
            *self
        }
    }

    /// Raw wire representation (round-trips through [`Paddr::from_raw`]).
    pub fn to_raw(&self) -> u64 {
        self.0
    }

    pub fn from_raw(raw: u64) -> Paddr {
        Paddr(raw)
    }
}

impl fmt::Debug for Paddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_null() {
            write!(f, "paddr(null)")
        } else if self.is_relative() {
            write!(f, "paddr(+{:#x})", self.0 & !RELATIVE_BIT)
        } else {
            write!(f, "paddr({:#x})", self.0)
        }
    }
}

impl fmt::Display for Paddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Identifies which subsystem an extent belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum ExtentKind {
    RootBlock = 1,
    LbaInternal = 2,
    LbaLeaf = 3,
    BackrefInternal = 4,
    BackrefLeaf = 5,
    /// Logical data extents; opaque to the tree engine. Liveness checks
    /// treat them as vacuously live.
    Data = 6,
}

impl ExtentKind {
    pub fn from_raw(raw: u8) -> Option<ExtentKind> {
        match raw {
            1 => Some(ExtentKind::RootBlock),
            2 => Some(ExtentKind::LbaInternal),
            3 => Some(ExtentKind::LbaLeaf),
            4 => Some(ExtentKind::BackrefInternal),
            5 => Some(ExtentKind::BackrefLeaf),
            6 => Some(ExtentKind::Data),
            _ => None,
        }
    }
}

/// Which of the two trees an extent kind or root slot belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(usize)]
pub enum TreeId {
    Lba = 0,
    Backref = 1,
}

/// Number of tree root slots carried by the root block.
pub const TREE_COUNT: usize = 2;

/// Allocation placement hint, forwarded to the device allocator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PlacementHint {
    #[default]
    Hot,
    Cold,
    Rewrite,
}

/// Copy-on-write lifecycle state of an extent.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExtentState {
    /// Committed version, visible to all transactions, read-only.
    Stable,
    /// Transaction-local mutable copy of a stable extent.
    MutationPending,
    /// Newly allocated in the owning transaction.
    Fresh,
    /// Dead; replaced or freed by a committed transaction.
    Retired,
}

struct StateInner {
    state: ExtentState,
    /// Prior stable instance; populated for `MutationPending` extents.
    prior: Option<ExtentRef>,
}

/// Shared bookkeeping embedded in every concrete extent type.
pub struct ExtentInfo {
    kind: ExtentKind,
    length: u32,
    hint: PlacementHint,
    generation: u32,
    paddr: AtomicU64,
    state: Mutex<StateInner>,
    /// Transaction owning a pending/fresh copy; zero when stable.
    pending_on: AtomicU64,
    linked: AtomicBool,
    modifications: AtomicU64,
    in_extent_checksum: AtomicU64,
    last_committed_crc: AtomicU64,
}

impl ExtentInfo {
    pub fn stable(kind: ExtentKind, paddr: Paddr, length: u32) -> ExtentInfo {
        ExtentInfo::with_state(kind, paddr, length, ExtentState::Stable, None, 0)
    }

    pub fn fresh(
        kind: ExtentKind,
        paddr: Paddr,
        length: u32,
        hint: PlacementHint,
        generation: u32,
        trans_id: u64,
    ) -> ExtentInfo {
        let mut info =
            ExtentInfo::with_state(kind, paddr, length, ExtentState::Fresh, None, trans_id);
        info.hint = hint;
        info.generation = generation;
        info
    }

    pub fn pending_from(prior: ExtentRef, trans_id: u64) -> ExtentInfo {
        let mut info = ExtentInfo::with_state(
            prior.kind(),
            prior.paddr(),
            prior.length(),
            ExtentState::MutationPending,
            Some(prior.clone()),
            trans_id,
        );
        info.hint = prior.info().hint;
        info.generation = prior.info().generation;
        info.modifications = AtomicU64::new(prior.modifications());
        info.in_extent_checksum = AtomicU64::new(prior.in_extent_checksum());
        info.last_committed_crc = AtomicU64::new(prior.last_committed_crc());
        info
    }

    fn with_state(
        kind: ExtentKind,
        paddr: Paddr,
        length: u32,
        state: ExtentState,
        prior: Option<ExtentRef>,
        pending_on: u64,
    ) -> ExtentInfo {
        ExtentInfo {
            kind,
            length,
            hint: PlacementHint::default(),
            generation: 0,
            paddr: AtomicU64::new(paddr.to_raw()),
            state: Mutex::new(StateInner { state, prior }),
            pending_on: AtomicU64::new(pending_on),
            linked: AtomicBool::new(false),
            modifications: AtomicU64::new(0),
            in_extent_checksum: AtomicU64::new(0),
            last_committed_crc: AtomicU64::new(0),
        }
    }

    pub fn kind(&self) -> ExtentKind {
        self.kind
    }

    pub fn length(&self) -> u32 {
        self.length
    }

    pub fn hint(&self) -> PlacementHint {
        self.hint
    }

    pub fn generation(&self) -> u32 {
        self.generation
    }

    pub fn paddr(&self) -> Paddr {
        Paddr::from_raw(self.paddr.load(Ordering::Acquire))
    }

    pub fn state(&self) -> ExtentState {
        self.state.lock().state
    }

    pub fn prior_instance(&self) -> Option<ExtentRef> {
        self.state.lock().prior.clone()
    }

    /// Transaction id owning this pending/fresh extent; zero when none.
    pub fn pending_on(&self) -> u64 {
        self.pending_on.load(Ordering::Acquire)
    }

    pub fn is_linked(&self) -> bool {
        self.linked.load(Ordering::Acquire)
    }

    pub(crate) fn set_linked(&self, linked: bool) {
        self.linked.store(linked, Ordering::Release);
    }

    pub fn modifications(&self) -> u64 {
        self.modifications.load(Ordering::Acquire)
    }

    pub(crate) fn bump_modifications(&self) {
        self.modifications.fetch_add(1, Ordering::AcqRel);
    }

    pub fn in_extent_checksum(&self) -> u64 {
        self.in_extent_checksum.load(Ordering::Acquire)
    }

    pub(crate) fn set_in_extent_checksum(&self, crc: u64) {
        self.in_extent_checksum.store(crc, Ordering::Release);
    }

    pub fn last_committed_crc(&self) -> u64 {
        self.last_committed_crc.load(Ordering::Acquire)
    }

    pub(crate) fn set_last_committed_crc(&self, crc: u64) {
        self.last_committed_crc.store(crc, Ordering::Release);
    }

    /// Commit transition: pending/fresh becomes the stable instance.
    pub(crate) fn mark_stable(&self) {
        let mut guard = self.state.lock();
        assert!(
            matches!(guard.state, ExtentState::MutationPending | ExtentState::Fresh),
            "mark_stable on {:?} extent",
            guard.state
        );
        guard.state = ExtentState::Stable;
        guard.prior = None;
        drop(guard);
        self.pending_on.store(0, Ordering::Release);
    }

    pub(crate) fn mark_retired(&self) {
        let mut guard = self.state.lock();
        guard.state = ExtentState::Retired;
        guard.prior = None;
        drop(guard);
        self.pending_on.store(0, Ordering::Release);
        self.set_linked(false);
    }
}

/// Shared handle to a cache-managed extent.
pub type ExtentRef = Arc<dyn Extent>;

/// The uniform surface every cache-managed block exposes.
///
/// Concrete types: internal/leaf tree nodes and the root block. Most
/// accessors are provided in terms of [`Extent::info`].
pub trait Extent: Send + Sync + 'static {
    fn info(&self) -> &ExtentInfo;

    /// Downcast support; see [`cast`].
    fn as_any_arc(self: Arc<Self>) -> Arc<dyn Any + Send + Sync>;

    /// Produce the transaction-local mutable copy of this stable extent.
    /// The copy starts in `MutationPending` state with `self` as prior.
    fn duplicate(self: Arc<Self>, trans_id: u64) -> ExtentRef;

    /// Serialize for the backing device. Called at commit.
    fn encode(&self) -> Vec<u8>;

    /// Invoked at commit when this pending extent replaces its prior
    /// stable instance, after the state transition. Node types use it to
    /// repoint loaded children's parent back-references at the new stable
    /// instance.
    fn on_replace_prior(self: Arc<Self>) {}

    fn kind(&self) -> ExtentKind {
        self.info().kind()
    }

    fn paddr(&self) -> Paddr {
        self.info().paddr()
    }

    fn length(&self) -> u32 {
        self.info().length()
    }

    fn state(&self) -> ExtentState {
        self.info().state()
    }

    fn is_stable(&self) -> bool {
        self.state() == ExtentState::Stable
    }

    fn is_mutation_pending(&self) -> bool {
        self.state() == ExtentState::MutationPending
    }

    fn is_fresh(&self) -> bool {
        self.state() == ExtentState::Fresh
    }

    /// In some transaction's write set (mutation-pending or fresh).
    fn is_pending(&self) -> bool {
        matches!(
            self.state(),
            ExtentState::MutationPending | ExtentState::Fresh
        )
    }

    /// Pending extents are the only mutable ones.
    fn is_mutable(&self) -> bool {
        self.is_pending()
    }

    fn is_valid(&self) -> bool {
        self.state() != ExtentState::Retired
    }

    fn is_linked(&self) -> bool {
        self.info().is_linked()
    }

    fn modifications(&self) -> u64 {
        self.info().modifications()
    }

    fn in_extent_checksum(&self) -> u64 {
        self.info().in_extent_checksum()
    }

    fn last_committed_crc(&self) -> u64 {
        self.info().last_committed_crc()
    }

    fn prior_instance(&self) -> Option<ExtentRef> {
        self.info().prior_instance()
    }
}

/// A cache-managed extent the typed cache entry points can construct:
/// allocated empty or decoded from device bytes.
pub trait NodeExtent: Extent {
    const KIND: ExtentKind;

    /// A fresh, empty instance (cache allocation path).
    fn new_empty(info: ExtentInfo) -> Arc<Self>;

    /// Reconstruct from device bytes. Verifies the embedded payload
    /// checksum (mismatch is fatal corruption) and records it as the
    /// instance's in-extent checksum.
    fn decode(info: ExtentInfo, bytes: &[u8]) -> eyre::Result<Arc<Self>>;
}

const CRC64: crc::Crc<u64> = crc::Crc::<u64>::new(&crc::CRC_64_ECMA_182);

/// Payload checksum used for every persisted extent.
pub fn crc64(bytes: &[u8]) -> u64 {
    CRC64.checksum(bytes)
}

/// Downcast an extent handle to its concrete type.
///
/// Kind mismatches are programmer errors; callers dispatch on
/// [`Extent::kind`] before casting.
pub fn cast<T: Extent>(e: &ExtentRef) -> Arc<T> {
    try_cast(e).unwrap_or_else(|| panic!("extent kind mismatch: {:?}", e.kind()))
}

pub fn try_cast<T: Extent>(e: &ExtentRef) -> Option<Arc<T>> {
    e.clone().as_any_arc().downcast::<T>().ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn paddr_relative_roundtrip() {
        let base = Paddr::new(0x4000);
        let target = Paddr::new(0x7000);

        let rel = target.relative_to(base);
        assert!(rel.is_relative());
        assert_eq!(rel.maybe_relative_to(base), target);
    }

    #[test]
    fn paddr_relative_roundtrip_backwards() {
        let base = Paddr::new(0x7000);
        let target = Paddr::new(0x4000);

        let rel = target.relative_to(base);
        assert!(rel.is_relative());
        assert_eq!(rel.maybe_relative_to(base), target);
    }

    #[test]
    fn paddr_absolute_is_identity_under_resolution() {
        let base = Paddr::new(0x1000);
        let addr = Paddr::new(0x2000);
        assert_eq!(addr.maybe_relative_to(base), addr);
    }

    #[test]
    fn paddr_null_is_neither_absolute_nor_relative() {
        assert!(Paddr::NULL.is_null());
        assert!(!Paddr::NULL.is_absolute());
        assert!(!Paddr::NULL.is_relative());
    }

    #[test]
    fn extent_info_state_transitions() {
        let info = ExtentInfo::fresh(
            ExtentKind::LbaLeaf,
            Paddr::new(0x1000),
            4096,
            PlacementHint::Hot,
            0,
            7,
        );
        assert_eq!(info.state(), ExtentState::Fresh);
        assert_eq!(info.pending_on(), 7);

        info.mark_stable();
        assert_eq!(info.state(), ExtentState::Stable);
        assert_eq!(info.pending_on(), 0);

        info.mark_retired();
        assert_eq!(info.state(), ExtentState::Retired);
    }

    #[test]
    fn extent_kind_raw_roundtrip() {
        for kind in [
            ExtentKind::RootBlock,
            ExtentKind::LbaInternal,
            ExtentKind::LbaLeaf,
            ExtentKind::BackrefInternal,
            ExtentKind::BackrefLeaf,
            ExtentKind::Data,
        ] {
            assert_eq!(ExtentKind::from_raw(kind as u8), Some(kind));
        }
        assert_eq!(ExtentKind::from_raw(0), None);
        assert_eq!(ExtentKind::from_raw(99), None);
    }
}
