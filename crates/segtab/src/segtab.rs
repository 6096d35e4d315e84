//! The per-address-space segment table.
//!
//! A [`Segtab`] is the software radix tree that takes a virtual address to
//! the leaf PTE slot describing its page. On 64-bit targets the tree has
//! three levels (root node, interior node, leaf PTE page); on 32-bit targets
//! the root points straight at leaf pages.
//!
//! Population is lazy and MP-safe: [`reserve`](Segtab::reserve) allocates
//! missing nodes and leaf pages optimistically and publishes them with a
//! compare-and-swap, recycling its allocation through the
//! [`SegtabPool`](crate::SegtabPool) when another CPU wins the slot. Readers
//! never lock: [`lookup`](Segtab::lookup) chases acquire-loaded pointers and
//! sees either null or a fully initialized child.
//!
//! [`process`](Segtab::process) and [`destroy`](Segtab::destroy) are not safe
//! against a concurrent `reserve` on the same address space; the owning pmap
//! quiesces the space first.

use core::ptr::{self, NonNull};
use core::sync::atomic::{AtomicPtr, Ordering};

use crate::address::VirtualAddress;
use crate::arch;
use crate::node::SegtabNode;
use crate::pool::SegtabPool;
use crate::pte::{PtEntry, check_pte_page};

/// Whether an address space is the kernel's or a user process's.
///
/// The kernel space never publishes its segment table to the per-CPU user
/// fields, and looking up a direct-mapped kernel address through the tree is
/// a caller bug.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SpaceKind {
    Kernel,
    User,
}

/// Flags accepted by [`Segtab::reserve`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ReserveFlags(usize);

impl ReserveFlags {
    const CAN_FAIL: usize = 1 << 0;

    /// No flags: leaf-page exhaustion is fatal.
    pub const fn empty() -> Self {
        Self(0)
    }

    /// Allow `reserve` to return `None` when no leaf page can be allocated.
    pub const fn can_fail() -> Self {
        Self(Self::CAN_FAIL)
    }

    /// Returns whether leaf-page exhaustion may be reported to the caller.
    pub const fn is_can_fail(self) -> bool {
        self.0 & Self::CAN_FAIL != 0
    }
}

/// Callback invoked once per non-empty segment of a walk.
///
/// Receives the address space, the segment's start and end virtual addresses
/// (the end is page-aligned and no more than one segment past the start), a
/// pointer to the PTE for the start address, and the caller's flags word
/// passed through untouched.
pub type PteCallback<'a> =
    &'a mut dyn FnMut(&Segtab, VirtualAddress, VirtualAddress, NonNull<PtEntry>, usize);

/// The segment table of one address space.
///
/// Owned by the higher-level pmap. The root pointer is installed by
/// [`init`](Self::init), stays stable until [`destroy`](Self::destroy), and
/// is null outside that window.
pub struct Segtab {
    root: AtomicPtr<SegtabNode>,
    kind: SpaceKind,
    min_addr: VirtualAddress,
}

impl Segtab {
    /// Creates an empty address space of the given kind.
    ///
    /// `min_addr` is the lowest legal virtual address in the space; teardown
    /// starts its walk there.
    pub const fn new(kind: SpaceKind, min_addr: VirtualAddress) -> Self {
        Self {
            root: AtomicPtr::new(ptr::null_mut()),
            kind,
            min_addr,
        }
    }

    /// Returns whether this space is the kernel's or a user process's.
    pub fn kind(&self) -> SpaceKind {
        self.kind
    }

    /// Returns the lowest legal virtual address in this space.
    pub fn min_addr(&self) -> VirtualAddress {
        self.min_addr
    }

    /// Returns whether [`init`](Self::init) has run (and
    /// [`destroy`](Self::destroy) has not).
    pub fn is_initialized(&self) -> bool {
        !self.root.load(Ordering::Acquire).is_null()
    }

    pub(crate) fn root(&self) -> *mut SegtabNode {
        self.root.load(Ordering::Acquire)
    }

    /// Allocates and installs the root node.
    ///
    /// Infallible; waits for memory if the pool and frame source are empty.
    pub fn init(&self, pool: &SegtabPool) {
        debug_assert!(
            self.root.load(Ordering::Relaxed).is_null(),
            "init on a live address space"
        );
        let root = pool.alloc_node();
        self.root.store(root.as_ptr(), Ordering::Release);
    }

    /// Walks to the leaf PTE page covering `va`, or null if none is installed.
    fn segment(&self, va: VirtualAddress) -> *mut PtEntry {
        debug_assert!(
            self.kind != SpaceKind::Kernel || !va.is_direct_mapped(),
            "lookup of direct-mapped kernel address {va}"
        );
        let stb = self.root.load(Ordering::Acquire);
        if stb.is_null() {
            return ptr::null_mut();
        }
        #[cfg(target_pointer_width = "64")]
        let stb = {
            // SAFETY: a non-null root/interior pointer is a live node.
            let stb = unsafe { &*stb }.seg(va.xseg_index());
            if stb.is_null() {
                return ptr::null_mut();
            }
            stb
        };
        // SAFETY: as above.
        unsafe { &*stb }.pte_page(va.seg_index())
    }

    /// Returns a pointer to the PTE slot for `va`, or `None` if its segment
    /// has no leaf page.
    ///
    /// Never allocates and never locks; safe against concurrent
    /// [`reserve`](Self::reserve) calls on the same space.
    pub fn lookup(&self, va: VirtualAddress) -> Option<NonNull<PtEntry>> {
        let pte = self.segment(va);
        if pte.is_null() {
            return None;
        }
        // SAFETY: a leaf page holds PTE_PER_PAGE entries and pte_index is in range.
        NonNull::new(unsafe { pte.add(va.pte_index()) })
    }

    /// Returns a pointer to the PTE slot for `va`, installing the missing
    /// interior node and leaf page on demand.
    ///
    /// Returns `None` only when the leaf page cannot be allocated and
    /// `flags` has [`can_fail`](ReserveFlags::can_fail) set; without it,
    /// leaf exhaustion panics. Node allocation never fails (it waits for
    /// memory instead).
    ///
    /// Concurrent reserves of the same address race benignly: exactly one
    /// allocation is published per slot and losers recycle theirs, so every
    /// caller gets the same pointer back.
    pub fn reserve(
        &self,
        pool: &SegtabPool,
        va: VirtualAddress,
        flags: ReserveFlags,
    ) -> Option<NonNull<PtEntry>> {
        if let Some(pte) = self.lookup(va) {
            return Some(pte);
        }

        let root = self.root.load(Ordering::Acquire);
        assert!(!root.is_null(), "reserve on an uninitialized address space");
        // SAFETY: a non-null root is live for the space's lifetime.
        let root = unsafe { &*root };

        #[cfg(target_pointer_width = "64")]
        let stb: &SegtabNode = {
            let slot = va.xseg_index();
            let mut stb = root.seg(slot);
            if stb.is_null() {
                let new = pool.alloc_node();
                stb = match root.install_seg(slot, new.as_ptr()) {
                    Ok(()) => new.as_ptr(),
                    Err(winner) => {
                        // Another CPU populated this slot first; ours was
                        // never published and goes back to the freelist.
                        // SAFETY: the loser node is still exclusively ours.
                        unsafe { new.as_ref() }.check_empty("reserve", "lost install race");
                        pool.free_node(new);
                        winner
                    }
                };
            }
            // SAFETY: stb is either our published node or the winner's.
            unsafe { &*stb }
        };
        #[cfg(not(target_pointer_width = "64"))]
        let stb: &SegtabNode = root;

        let new_leaf = match pool.alloc_leaf() {
            Some(leaf) => leaf,
            None if flags.is_can_fail() => return None,
            None => panic!("reserve: cannot allocate page table page for va {va}"),
        };

        let slot = va.seg_index();
        let leaf = match stb.install_pte_page(slot, new_leaf.as_ptr()) {
            Ok(()) => {
                log::trace!("reserve: va {va} installed pte page in slot {slot}");
                new_leaf.as_ptr()
            }
            Err(winner) => {
                // Loser leaf is still zero; recycle it where it came from.
                pool.free_leaf(new_leaf);
                winner
            }
        };
        debug_assert_eq!(stb.pte_page(slot), leaf);

        // SAFETY: a leaf page holds PTE_PER_PAGE entries and pte_index is in range.
        NonNull::new(unsafe { leaf.add(va.pte_index()) })
    }

    /// Invokes `callback` once per segment in `[sva, eva)` that has a leaf
    /// page installed. Empty segments are skipped in O(1).
    ///
    /// Frees nothing; the callback may edit PTEs through the pointer it is
    /// given, but the leaf pages stay installed.
    pub fn process(
        &self,
        sva: VirtualAddress,
        eva: VirtualAddress,
        callback: PteCallback<'_>,
        flags: usize,
    ) {
        let eva_raw = eva.as_usize();
        let mut sva_raw = sva.as_usize();
        while sva_raw < eva_raw {
            // SAFETY: sva_raw advances from a caller-validated address toward eva.
            let sva_va = unsafe { VirtualAddress::new_unchecked(sva_raw) };
            let mut seg_end = sva_va.trunc_seg().as_usize().wrapping_add(arch::SEG_SIZE);
            // The segment boundary can wrap to zero at the top of the
            // address space; clamp to the requested end either way.
            if seg_end == 0 || seg_end > eva_raw {
                seg_end = eva_raw;
            }
            if let Some(pte) = self.lookup(sva_va) {
                // SAFETY: seg_end lies in (sva_raw, eva_raw].
                let end_va = unsafe { VirtualAddress::new_unchecked(seg_end) };
                callback(self, sva_va, end_va, pte, flags);
            }
            sva_raw = seg_end;
        }
    }

    /// Tears the whole tree down and clears the root.
    ///
    /// Every installed leaf page is audited, reported to `callback` (when
    /// supplied) as its segment range, and recycled; every node returns to
    /// the descriptor freelist. The caller must have quiesced the address
    /// space: no concurrent operation may touch it.
    ///
    /// A leaf must be fully zero by the time it is reclaimed: live mappings
    /// are removed before teardown, and a supplied callback may only record
    /// or clear entries, not plant new ones.
    pub fn destroy(&self, pool: &SegtabPool, mut callback: Option<PteCallback<'_>>, flags: usize) {
        let root = self.root.load(Ordering::Acquire);
        if root.is_null() {
            return;
        }
        #[cfg(target_pointer_width = "64")]
        let span = arch::XSEG_SIZE;
        #[cfg(not(target_pointer_width = "64"))]
        let span = arch::SEG_SIZE;

        log::trace!("destroy: releasing segment table {root:p}");
        // SAFETY: the space is quiesced, so this walk owns the whole tree.
        unsafe {
            self.release(
                pool,
                &*root,
                &mut callback,
                flags,
                self.min_addr.as_usize(),
                span,
            );
        }
        self.root.store(ptr::null_mut(), Ordering::Release);
    }

    /// Releases the subtree under `stb`, where each of its slots covers
    /// `span` bytes starting at `va`, then frees `stb` itself.
    ///
    /// # Safety
    ///
    /// `stb` must be a live node of this space's tree with no concurrent
    /// accessors.
    unsafe fn release(
        &self,
        pool: &SegtabPool,
        stb: &SegtabNode,
        callback: &mut Option<PteCallback<'_>>,
        flags: usize,
        va: usize,
        span: usize,
    ) {
        let mut va = va;
        for i in (va / span) & (arch::SEGTAB_FANOUT - 1)..arch::SEGTAB_FANOUT {
            #[cfg(target_pointer_width = "64")]
            if span > arch::SEG_SIZE {
                let child = stb.seg(i);
                if !child.is_null() {
                    // SAFETY: a non-null child slot is a live node; the
                    // quiesce contract extends to the whole subtree.
                    unsafe {
                        self.release(
                            pool,
                            &*child,
                            callback,
                            flags,
                            va,
                            span / arch::SEGTAB_FANOUT,
                        );
                    }
                    stb.clear(i);
                }
                va = va.wrapping_add(span);
                continue;
            }

            debug_assert_eq!(span, arch::SEG_SIZE);
            let pte = stb.pte_page(i);
            if !pte.is_null() {
                check_pte_page(pte, "destroy");
                if let Some(cb) = callback.as_mut() {
                    // SAFETY: va tracks the walk position inside the space.
                    let start_va = unsafe { VirtualAddress::new_unchecked(va) };
                    // SAFETY: one segment past start_va.
                    let end_va = unsafe { VirtualAddress::new_unchecked(va.wrapping_add(span)) };
                    // SAFETY: pte is non-null.
                    cb(self, start_va, end_va, unsafe { NonNull::new_unchecked(pte) }, flags);
                }
                // SAFETY: pte is non-null.
                pool.free_leaf(unsafe { NonNull::new_unchecked(pte) });
                stb.clear(i);
            }
            va = va.wrapping_add(span);
        }

        stb.check_empty(
            "destroy",
            if span == arch::SEG_SIZE {
                "release seg"
            } else {
                "release xseg"
            },
        );
        pool.free_node(NonNull::from(stb));
    }
}
