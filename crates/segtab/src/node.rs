//! Segment-table nodes.
//!
//! A node is one page-sized array of [`SEGTAB_FANOUT`](crate::arch::SEGTAB_FANOUT)
//! child slots. The same storage serves both interior levels: at the root of
//! a 64-bit tree a slot points to a child node, one level down (or at the
//! root of a 32-bit tree) it points to a leaf PTE page. Which view applies is
//! decided by the walker from its depth, never stored in the node.
//!
//! Slots are published with a release CAS and read with acquire loads, so a
//! reader that observes a non-null slot also observes the fully zeroed child
//! behind it. A slot is written at most once between teardowns: walkers never
//! replace a non-null child.

use core::sync::atomic::{AtomicPtr, Ordering};

use crate::arch::SEGTAB_FANOUT;
use crate::pte::PtEntry;

/// One node of the segment table: the root or, on 64-bit targets, an
/// interior level.
///
/// Nodes are carved out of zero-filled pool pages and never constructed by
/// value; a null `AtomicPtr` has the all-zero bit pattern, so a zeroed page
/// is a valid array of empty nodes.
#[repr(C)]
pub struct SegtabNode {
    children: [AtomicPtr<u8>; SEGTAB_FANOUT],
}

impl SegtabNode {
    /// Loads the child node in `slot` (interior view).
    #[inline]
    pub(crate) fn seg(&self, slot: usize) -> *mut SegtabNode {
        self.children[slot].load(Ordering::Acquire).cast()
    }

    /// Loads the leaf PTE page in `slot` (leaf-parent view).
    #[inline]
    pub(crate) fn pte_page(&self, slot: usize) -> *mut PtEntry {
        self.children[slot].load(Ordering::Acquire).cast()
    }

    /// Publishes `node` into an empty `slot`.
    ///
    /// Returns `Err` with the already-installed child when another CPU won
    /// the race; the caller must recycle its allocation and adopt the winner.
    #[inline]
    pub(crate) fn install_seg(
        &self,
        slot: usize,
        node: *mut SegtabNode,
    ) -> Result<(), *mut SegtabNode> {
        self.children[slot]
            .compare_exchange(
                core::ptr::null_mut(),
                node.cast(),
                Ordering::Release,
                Ordering::Acquire,
            )
            .map(|_| ())
            .map_err(|winner| winner.cast())
    }

    /// Publishes a leaf PTE page into an empty `slot`.
    ///
    /// Same contract as [`install_seg`](Self::install_seg).
    #[inline]
    pub(crate) fn install_pte_page(
        &self,
        slot: usize,
        pte: *mut PtEntry,
    ) -> Result<(), *mut PtEntry> {
        self.children[slot]
            .compare_exchange(
                core::ptr::null_mut(),
                pte.cast(),
                Ordering::Release,
                Ordering::Acquire,
            )
            .map(|_| ())
            .map_err(|winner| winner.cast())
    }

    /// Empties `slot`. Only teardown uses this; walkers never un-publish.
    #[inline]
    pub(crate) fn clear(&self, slot: usize) {
        self.children[slot].store(core::ptr::null_mut(), Ordering::Release);
    }

    /// Reads the freelist link threaded through slot 0.
    #[inline]
    pub(crate) fn link(&self) -> *mut SegtabNode {
        self.children[0].load(Ordering::Relaxed).cast()
    }

    /// Threads this node onto a freelist through slot 0.
    ///
    /// The node must otherwise be empty; the link is cleared again before the
    /// node is handed back out.
    #[inline]
    pub(crate) fn set_link(&self, next: *mut SegtabNode) {
        self.children[0].store(next.cast(), Ordering::Relaxed);
    }

    /// Checks that every slot of this node is empty.
    ///
    /// Runs under debug builds only. Used when a node crosses a trust
    /// boundary: allocated, freed, or about to be recycled after losing an
    /// installation race.
    ///
    /// # Panics
    ///
    /// Panics naming the first occupied slot; every later occupied slot is
    /// reported first.
    pub(crate) fn check_empty(&self, caller: &str, why: &str) {
        #[cfg(debug_assertions)]
        for i in 0..SEGTAB_FANOUT {
            let child = self.children[i].load(Ordering::Relaxed);
            if !child.is_null() {
                for j in i..SEGTAB_FANOUT {
                    let later = self.children[j].load(Ordering::Relaxed);
                    if !later.is_null() {
                        log::error!("{caller}: segtab slot [{j}] = {later:p}");
                    }
                }
                panic!("{caller}: segtab slot [{i}] != 0 ({child:p}): {why}");
            }
        }
        #[cfg(not(debug_assertions))]
        let _ = (caller, why);
    }
}
