//! Software host model for testing and development.
//!
//! This model keeps the x86_64 geometry (4 KiB pages, 512-slot nodes) so that
//! segment and node boundaries behave exactly as they would in a kernel build,
//! but accepts any host address: in emulation, "physical" addresses are
//! identity-mapped host pointers handed out by an emulated frame source, and
//! host pointers carry no canonicality guarantee.

/// Base-2 logarithm of the page size (4 KiB pages).
pub const PAGE_SHIFT: usize = 12;

/// Maximum number of bits in a physical address (full host width).
pub const MAX_PHYSICAL_BITS: usize = usize::BITS as usize;

/// Maximum number of bits in a virtual address (full host width).
pub const MAX_VIRTUAL_BITS: usize = usize::BITS as usize;

/// Validates a physical address. Any host address is acceptable.
#[inline]
pub const fn validate_physical(_addr: usize) -> bool {
    true
}

/// Validates a virtual address. Any host address is acceptable.
#[inline]
pub const fn validate_virtual(_addr: usize) -> bool {
    true
}
