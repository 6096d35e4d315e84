//! Architecture-specific geometry for the segment table.
//!
//! This module conditionally selects either the hardware constants for the
//! target architecture or the software host model used for testing and
//! development.

// Use the x86_64 hardware constants when we're on x86_64 and not testing or emulating.
// NOTE: We DO include the module even during tests so that rust-analyzer can see it.
#[cfg(target_arch = "x86_64")]
mod x86_64;
#[cfg(all(target_arch = "x86_64", not(test), not(feature = "software-emulation")))]
pub use x86_64::*;

// Use the software host model ONLY when:
// - Running tests, OR
// - software-emulation feature is explicitly enabled
#[cfg(any(test, feature = "software-emulation"))]
mod software;
#[cfg(any(test, feature = "software-emulation"))]
pub use software::*;

/// Page size in bytes.
pub const PAGE_SIZE: usize = 1 << PAGE_SHIFT;

/// Number of PTE slots in one leaf page.
pub const PTE_PER_PAGE: usize = PAGE_SIZE / core::mem::size_of::<usize>();

/// Bits of virtual address covered by one leaf PTE page (one segment).
pub const SEG_SHIFT: usize = PAGE_SHIFT + PTE_PER_PAGE.trailing_zeros() as usize;

/// Size in bytes of the virtual range covered by one leaf PTE page.
pub const SEG_SIZE: usize = 1 << SEG_SHIFT;

/// Number of child slots in one segment-table node.
///
/// A node is exactly one page of pointer-width slots, so a node never
/// straddles a page boundary.
pub const SEGTAB_FANOUT: usize = PAGE_SIZE / core::mem::size_of::<usize>();

/// Bits of virtual address covered by one interior node (64-bit trees only).
#[cfg(target_pointer_width = "64")]
pub const XSEG_SHIFT: usize = SEG_SHIFT + SEGTAB_FANOUT.trailing_zeros() as usize;

/// Size in bytes of the virtual range covered by one interior node.
#[cfg(target_pointer_width = "64")]
pub const XSEG_SIZE: usize = 1 << XSEG_SHIFT;
