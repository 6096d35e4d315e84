//! The segment-table pool: recycled nodes and cached leaf pages.
//!
//! Node descriptors are carved out of whole pool pages and kept on an
//! intrusive freelist threaded through slot 0, so one page allocation is
//! amortized over `PAGE_SIZE / size_of::<SegtabNode>()` descriptors. With the
//! `ptp-cache` feature, leaf PTE pages released at teardown are kept on a
//! second intrusive list instead of going back to the frame source.
//!
//! Both lists live behind one spin lock, and the critical sections contain
//! only pointer manipulation; allocator calls and audits happen outside the
//! lock. Everything on either list is observably zero except for the link
//! word, which is cleared before a node or page is handed back out.

use core::ptr::{self, NonNull};

#[cfg(not(feature = "ptp-cache"))]
use crate::address::PhysicalAddress;
use crate::address::VirtualAddress;
use crate::arch;
use crate::frame_source::FrameSource;
use crate::node::SegtabNode;
use crate::pte::{PtEntry, check_pte_page};

/// Wait channel name used when descriptor allocation has to sleep.
const SEGTAB_WCHAN: &str = "segtab";

struct PoolInner {
    free_nodes: *mut SegtabNode,
    free_node_count: usize,
    #[cfg(feature = "ptp-cache")]
    cached_leaves: *mut PtEntry,
    #[cfg(feature = "ptp-cache")]
    cached_leaf_count: usize,
    backing_pages: usize,
}

// SAFETY: the raw heads are only dereferenced while the lock is held, and the
// nodes/pages they reach are owned by the pool until handed out.
unsafe impl Send for PoolInner {}

/// The process-wide cache of segment-table resources.
///
/// One instance serves every address space; the kernel owns it in a `static`
/// and hands it to the engine's allocating operations. Node allocation never
/// fails: when both the freelist and the frame source are empty it waits on
/// the frame source and retries.
#[repr(align(64))] // keep the lock on its own cache line
pub struct SegtabPool {
    source: &'static dyn FrameSource,
    inner: spin::Mutex<PoolInner>,
}

impl SegtabPool {
    /// Creates an empty pool drawing pages from `source`.
    pub const fn new(source: &'static dyn FrameSource) -> Self {
        Self {
            source,
            inner: spin::Mutex::new(PoolInner {
                free_nodes: ptr::null_mut(),
                free_node_count: 0,
                #[cfg(feature = "ptp-cache")]
                cached_leaves: ptr::null_mut(),
                #[cfg(feature = "ptp-cache")]
                cached_leaf_count: 0,
                backing_pages: 0,
            }),
        }
    }

    /// Returns the number of node descriptors on the freelist.
    pub fn free_nodes(&self) -> usize {
        self.inner.lock().free_node_count
    }

    /// Returns the number of leaf PTE pages held in the cache.
    pub fn cached_leaves(&self) -> usize {
        #[cfg(feature = "ptp-cache")]
        {
            self.inner.lock().cached_leaf_count
        }
        #[cfg(not(feature = "ptp-cache"))]
        {
            0
        }
    }

    /// Returns the number of pool pages consumed for node descriptors.
    ///
    /// Descriptor pages are never returned to the frame source; they cycle
    /// through the freelist for the lifetime of the pool.
    pub fn backing_pages(&self) -> usize {
        self.inner.lock().backing_pages
    }

    /// Allocates an empty node, refilling the freelist from the frame source
    /// when it runs dry.
    ///
    /// Never fails: if the frame source is exhausted this waits for memory
    /// and retries.
    pub(crate) fn alloc_node(&self) -> NonNull<SegtabNode> {
        loop {
            let head = {
                let mut inner = self.inner.lock();
                let head = inner.free_nodes;
                if !head.is_null() {
                    // SAFETY: nodes on the freelist stay valid until handed out.
                    let node = unsafe { &*head };
                    inner.free_nodes = node.link();
                    inner.free_node_count -= 1;
                    node.set_link(ptr::null_mut());
                }
                head
            };
            if !head.is_null() {
                // SAFETY: head was just removed from the freelist.
                let node = unsafe { &*head };
                node.check_empty("alloc_node", "from free list");
                // SAFETY: head is non-null.
                return unsafe { NonNull::new_unchecked(head) };
            }

            let Some(page) = self.source.alloc_zero_page() else {
                self.source.wait_for_memory(SEGTAB_WCHAN);
                continue;
            };
            let base: *mut SegtabNode = VirtualAddress::direct_mapped(page).as_mut_ptr();
            let n = arch::PAGE_SIZE / core::mem::size_of::<SegtabNode>();
            log::trace!("segtab pool: new descriptor page {page}, {n} descriptors");

            if n > 1 {
                // Chain descriptors 1..n-1 privately, then splice the chain in
                // front of the freelist in one critical section.
                for i in 1..n - 1 {
                    // SAFETY: the page holds n nodes; i and i+1 are in bounds.
                    unsafe { (*base.add(i)).set_link(base.add(i + 1)) };
                }
                let mut inner = self.inner.lock();
                // SAFETY: n-1 is in bounds of the page.
                unsafe { (*base.add(n - 1)).set_link(inner.free_nodes) };
                // SAFETY: index 1 is in bounds since n > 1.
                inner.free_nodes = unsafe { base.add(1) };
                inner.free_node_count += n - 1;
                inner.backing_pages += 1;
            } else {
                self.inner.lock().backing_pages += 1;
            }

            // SAFETY: the page is zero-filled, so descriptor 0 is a valid empty node.
            let node = unsafe { &*base };
            node.check_empty("alloc_node", "allocated");
            // SAFETY: base points at the freshly mapped page.
            return unsafe { NonNull::new_unchecked(base) };
        }
    }

    /// Pushes an empty node back onto the freelist.
    ///
    /// The caller must have audited the node; slot 0 becomes the list link.
    pub(crate) fn free_node(&self, node: NonNull<SegtabNode>) {
        let mut inner = self.inner.lock();
        // SAFETY: the node is unreferenced by any tree once it reaches here.
        unsafe { node.as_ref().set_link(inner.free_nodes) };
        inner.free_nodes = node.as_ptr();
        inner.free_node_count += 1;
    }

    /// Obtains a zeroed leaf PTE page: from the cache when one is available,
    /// otherwise from the frame source.
    ///
    /// Returns `None` when both are empty; the caller decides whether that is
    /// fatal.
    pub(crate) fn alloc_leaf(&self) -> Option<NonNull<PtEntry>> {
        #[cfg(feature = "ptp-cache")]
        {
            let head = {
                let mut inner = self.inner.lock();
                let head = inner.cached_leaves;
                if !head.is_null() {
                    // SAFETY: word 0 of a cached page is the list link.
                    inner.cached_leaves = unsafe { *head.cast::<*mut PtEntry>() };
                    inner.cached_leaf_count -= 1;
                }
                head
            };
            if !head.is_null() {
                // SAFETY: the page is ours now; clear the link word before audit.
                unsafe { *head.cast::<usize>() = 0 };
                check_pte_page(head, "alloc_leaf");
                // SAFETY: head is non-null.
                return Some(unsafe { NonNull::new_unchecked(head) });
            }
        }

        let page = self.source.alloc_zero_page()?;
        let pte: *mut PtEntry = VirtualAddress::direct_mapped(page).as_mut_ptr();
        check_pte_page(pte, "alloc_leaf");
        // SAFETY: the direct map of a real page is non-null.
        Some(unsafe { NonNull::new_unchecked(pte) })
    }

    /// Releases a fully zeroed leaf PTE page: into the cache when enabled,
    /// otherwise back to the frame source.
    pub(crate) fn free_leaf(&self, pte: NonNull<PtEntry>) {
        check_pte_page(pte.as_ptr(), "free_leaf");
        #[cfg(feature = "ptp-cache")]
        {
            let mut inner = self.inner.lock();
            // SAFETY: the page is unreferenced; word 0 becomes the list link.
            unsafe { *pte.as_ptr().cast::<*mut PtEntry>() = inner.cached_leaves };
            inner.cached_leaves = pte.as_ptr();
            inner.cached_leaf_count += 1;
        }
        #[cfg(not(feature = "ptp-cache"))]
        {
            let virt = VirtualAddress::from_ptr(pte.as_ptr());
            self.source.free_page(PhysicalAddress::from_direct_mapped(virt));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::address::AddressTranslator;
    use crate::frame_source::EmulatedFrames;

    fn setup() {
        if AddressTranslator::try_current().is_none() {
            AddressTranslator::set_current(AddressTranslator::new(0));
        }
    }

    fn leaked_frames(pages: usize) -> &'static EmulatedFrames {
        Box::leak(Box::new(EmulatedFrames::new(pages)))
    }

    #[test]
    fn node_freelist_recycles_descriptors() {
        setup();
        let frames = leaked_frames(4);
        let pool = SegtabPool::new(frames);

        let node = pool.alloc_node();
        assert_eq!(pool.backing_pages(), 1);
        let per_page = arch::PAGE_SIZE / core::mem::size_of::<SegtabNode>();
        assert_eq!(pool.free_nodes(), per_page - 1);

        pool.free_node(node);
        assert_eq!(pool.free_nodes(), per_page);

        // The next allocation comes off the freelist, not the source.
        let outstanding = frames.outstanding();
        let again = pool.alloc_node();
        assert_eq!(frames.outstanding(), outstanding);
        assert_eq!(pool.backing_pages(), 1);
        pool.free_node(again);
    }

    #[test]
    fn freelist_handout_is_empty_again() {
        setup();
        let frames = leaked_frames(4);
        let pool = SegtabPool::new(frames);

        let node = pool.alloc_node();
        pool.free_node(node);
        let node = pool.alloc_node();
        // The link threaded through slot 0 must be gone.
        // SAFETY: the node was just handed out.
        unsafe { node.as_ref() }.check_empty("test", "recycled");
        pool.free_node(node);
    }

    #[cfg(feature = "ptp-cache")]
    #[test]
    fn leaf_cache_round_trip() {
        setup();
        let frames = leaked_frames(2);
        let pool = SegtabPool::new(frames);

        let leaf = pool.alloc_leaf().unwrap();
        assert_eq!(frames.outstanding(), 1);
        pool.free_leaf(leaf);
        assert_eq!(pool.cached_leaves(), 1);
        // Cached pages are not returned to the source.
        assert_eq!(frames.outstanding(), 1);

        let again = pool.alloc_leaf().unwrap();
        assert_eq!(again, leaf);
        assert_eq!(pool.cached_leaves(), 0);
        assert_eq!(frames.outstanding(), 1);
        check_pte_page(again.as_ptr(), "test");
        pool.free_leaf(again);
    }

    #[test]
    fn leaf_alloc_fails_when_source_dry() {
        setup();
        let frames = leaked_frames(0);
        let pool = SegtabPool::new(frames);
        assert!(pool.alloc_leaf().is_none());
    }

    #[test]
    #[should_panic(expected = "exhausted waiting on")]
    fn node_alloc_waits_when_source_dry() {
        setup();
        let frames = leaked_frames(0);
        let pool = SegtabPool::new(frames);
        let _ = pool.alloc_node();
    }

    #[test]
    #[should_panic(expected = "not 0")]
    fn free_leaf_rejects_dirty_page() {
        setup();
        let frames = leaked_frames(1);
        let pool = SegtabPool::new(frames);

        let leaf = pool.alloc_leaf().unwrap();
        // SAFETY: slot 3 is within the leaf page.
        unsafe { (*leaf.as_ptr().add(3)).set(0x42) };
        pool.free_leaf(leaf);
    }
}
