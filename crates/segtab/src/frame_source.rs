//! The external page-allocator seam.
//!
//! The engine never talks to a physical-page allocator directly; the owner of
//! the [`SegtabPool`](crate::SegtabPool) hands it a [`FrameSource`]. In a
//! kernel that is the real frame allocator; under test or the
//! `software-emulation` feature, [`EmulatedFrames`] provides host-backed
//! pages with the same contract.

use crate::address::PhysicalAddress;

/// Supplies and reclaims whole physical pages.
///
/// Implementations must return page-aligned, fully zeroed pages from
/// [`alloc_zero_page`](Self::alloc_zero_page); the engine's zero-invariants
/// are anchored on that guarantee. Pages handed to
/// [`free_page`](Self::free_page) may hold arbitrary contents.
pub trait FrameSource: Sync {
    /// Allocates one zero-filled page, or `None` when memory is exhausted.
    fn alloc_zero_page(&self) -> Option<PhysicalAddress>;

    /// Returns a page to the allocator.
    fn free_page(&self, page: PhysicalAddress);

    /// Blocks until memory is plausibly available again.
    ///
    /// Called after [`alloc_zero_page`](Self::alloc_zero_page) fails on a
    /// path that is not allowed to fail; the caller retries afterwards.
    /// `wchan` names the wait channel for diagnostics.
    fn wait_for_memory(&self, wchan: &'static str);
}

#[cfg(any(test, feature = "software-emulation"))]
mod emulated {
    use core::sync::atomic::{AtomicUsize, Ordering};

    use super::FrameSource;
    use crate::address::PhysicalAddress;
    use crate::arch;

    /// A host-backed [`FrameSource`] for tests and software emulation.
    ///
    /// Carries a fixed capacity of page-aligned host pages; "physical"
    /// addresses are the host pointers themselves, so it pairs with an
    /// identity [`AddressTranslator`](crate::AddressTranslator) (offset 0).
    /// The outstanding-page count makes leak accounting observable.
    pub struct EmulatedFrames {
        free: spin::Mutex<std::vec::Vec<usize>>,
        capacity: usize,
        outstanding: AtomicUsize,
    }

    impl EmulatedFrames {
        /// Creates an emulated source holding `capacity` pages.
        pub fn new(capacity: usize) -> Self {
            let layout = Self::page_layout();
            let free = (0..capacity)
                .map(|_| {
                    // SAFETY: layout has non-zero size.
                    let page = unsafe { std::alloc::alloc_zeroed(layout) };
                    assert!(!page.is_null(), "host allocation failed");
                    page as usize
                })
                .collect();
            Self {
                free: spin::Mutex::new(free),
                capacity,
                outstanding: AtomicUsize::new(0),
            }
        }

        /// Returns the number of pages currently handed out.
        pub fn outstanding(&self) -> usize {
            self.outstanding.load(Ordering::Acquire)
        }

        /// Returns the total number of pages this source holds.
        pub fn capacity(&self) -> usize {
            self.capacity
        }

        fn page_layout() -> std::alloc::Layout {
            std::alloc::Layout::from_size_align(arch::PAGE_SIZE, arch::PAGE_SIZE).unwrap()
        }
    }

    impl FrameSource for EmulatedFrames {
        fn alloc_zero_page(&self) -> Option<PhysicalAddress> {
            let page = self.free.lock().pop()?;
            // Pages come back from free_page with whatever the caller left in
            // them; the contract is zero-on-allocate.
            // SAFETY: page is an unshared PAGE_SIZE block owned by this source.
            unsafe { core::ptr::write_bytes(page as *mut u8, 0, arch::PAGE_SIZE) };
            self.outstanding.fetch_add(1, Ordering::AcqRel);
            Some(PhysicalAddress::new(page))
        }

        fn free_page(&self, page: PhysicalAddress) {
            assert!(
                page.is_aligned(arch::PAGE_SIZE),
                "freed page {page} not page aligned"
            );
            self.outstanding.fetch_sub(1, Ordering::AcqRel);
            self.free.lock().push(page.as_usize());
        }

        fn wait_for_memory(&self, wchan: &'static str) {
            // Emulated memory never becomes available by waiting; a real
            // kernel sleeps here until the pagedaemon frees something.
            panic!("emulated frame source exhausted waiting on {wchan:?}");
        }
    }

    impl Drop for EmulatedFrames {
        fn drop(&mut self) {
            let layout = Self::page_layout();
            for page in self.free.get_mut().drain(..) {
                // SAFETY: every entry was allocated in new() with this layout.
                unsafe { std::alloc::dealloc(page as *mut u8, layout) };
            }
        }
    }
}

#[cfg(any(test, feature = "software-emulation"))]
pub use emulated::EmulatedFrames;
