//! Address types for physical and virtual memory management.
//!
//! This module provides architecture-independent wrappers around physical and
//! virtual addresses, with methods to manipulate them for segment-table
//! operations, and the [`AddressTranslator`] used to map pool pages between
//! their physical and direct-mapped virtual addresses.

use core::fmt;
use core::ops::{Add, Sub};

use crate::arch;

/// Translates pool pages between physical and virtual addresses.
///
/// The segment-table engine stores its nodes and leaf PTE pages in whole
/// physical pages and reaches them through the kernel's direct map: a fixed
/// offset added to the physical address. In software emulation the frame
/// source hands out host pointers, so the offset is zero and the mapping is
/// the identity.
pub struct AddressTranslator {
    direct_map_offset: usize,
}

impl AddressTranslator {
    /// Creates a new translator with the given direct-map offset.
    pub const fn new(direct_map_offset: usize) -> Self {
        Self { direct_map_offset }
    }

    /// Sets the global address translator.
    ///
    /// This function must be called exactly once during initialization.
    ///
    /// # Panics
    ///
    /// Panics if the translator has already been set.
    pub fn set_current(translator: AddressTranslator) {
        #[cfg(not(any(test, feature = "software-emulation")))]
        {
            if ADDRESS_TRANSLATOR.get().is_some() {
                panic!("address translator already set");
            }
            ADDRESS_TRANSLATOR.call_once(|| translator);
        }

        #[cfg(any(test, feature = "software-emulation"))]
        {
            ADDRESS_TRANSLATOR.with(|t| {
                if t.get().is_some() {
                    panic!("address translator already set");
                }
                t.call_once(|| translator);
            });
        }
    }

    /// Returns a reference to the current global address translator.
    ///
    /// # Panics
    ///
    /// Panics if the translator has not been set yet.
    pub fn current() -> &'static AddressTranslator {
        Self::try_current().expect(
            "address translator not set; call AddressTranslator::set_current during initialization",
        )
    }

    /// Returns a reference to the current global address translator if it has been set.
    pub fn try_current() -> Option<&'static AddressTranslator> {
        #[cfg(not(any(test, feature = "software-emulation")))]
        {
            ADDRESS_TRANSLATOR.get()
        }

        #[cfg(any(test, feature = "software-emulation"))]
        {
            ADDRESS_TRANSLATOR.with(|t| {
                t.get().map(|translator| {
                    // SAFETY: We leak the reference to make it 'static. This is safe because:
                    // 1. In test mode, each thread has its own ADDRESS_TRANSLATOR
                    // 2. Once set, it's never modified (spin::Once guarantees this)
                    // 3. The thread-local lives for the entire duration of the thread
                    unsafe { &*(translator as *const AddressTranslator) }
                })
            })
        }
    }

    /// Translates a physical address to a virtual address.
    pub fn phys_to_virt(&self, phys: usize) -> usize {
        phys.wrapping_add(self.direct_map_offset)
    }

    /// Translates a virtual address to a physical address.
    pub fn virt_to_phys(&self, virt: usize) -> usize {
        virt.wrapping_sub(self.direct_map_offset)
    }

    /// Translates a physical address to a typed pointer.
    pub fn phys_to_ptr<T>(&self, phys: usize) -> *mut T {
        self.phys_to_virt(phys) as *mut T
    }

    /// Translates a pointer to a physical address.
    pub fn ptr_to_phys<T>(&self, ptr: *const T) -> usize {
        self.virt_to_phys(ptr as usize)
    }
}

/// Global address translator.
///
/// This is initialized once during kernel initialization. In
/// test/software-emulation mode, this is thread-local to allow each test to
/// have its own translation context.
#[cfg(not(any(test, feature = "software-emulation")))]
static ADDRESS_TRANSLATOR: spin::Once<AddressTranslator> = spin::Once::new();

#[cfg(any(test, feature = "software-emulation"))]
std::thread_local! {
    static ADDRESS_TRANSLATOR: spin::Once<AddressTranslator> = spin::Once::new();
}

/// Macro to define common address type functionality.
///
/// This macro generates the basic structure and methods common to both physical
/// and virtual address types, reducing code duplication.
macro_rules! impl_address_common {
    ($name:ident, $doc:expr) => {
        #[doc = $doc]
        #[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
        #[repr(transparent)]
        pub struct $name(usize);

        impl $name {
            /// Creates a new address without validation.
            ///
            /// # Safety
            ///
            /// The caller must ensure that the address is valid for the current architecture.
            #[inline]
            pub const unsafe fn new_unchecked(addr: usize) -> Self {
                Self(addr)
            }

            /// Creates an address from a pointer.
            #[inline]
            pub fn from_ptr<T>(ptr: *const T) -> Self {
                Self::new(ptr as usize)
            }

            /// Returns the raw address value.
            #[inline]
            pub const fn as_usize(self) -> usize {
                self.0
            }

            /// Checks if the address is aligned to the given alignment.
            ///
            /// # Panics
            ///
            /// Panics if `align` is not a power of two.
            #[inline]
            pub const fn is_aligned(self, align: usize) -> bool {
                assert!(align.is_power_of_two(), "alignment must be a power of two");
                self.0 & (align - 1) == 0
            }

            /// Aligns the address down to the given alignment.
            ///
            /// # Panics
            ///
            /// Panics if `align` is not a power of two.
            #[inline]
            pub const fn align_down(self, align: usize) -> Self {
                assert!(align.is_power_of_two(), "alignment must be a power of two");
                Self(self.0 & !(align - 1))
            }

            /// Aligns the address up to the given alignment.
            ///
            /// # Panics
            ///
            /// Panics if `align` is not a power of two.
            #[inline]
            pub const fn align_up(self, align: usize) -> Self {
                assert!(align.is_power_of_two(), "alignment must be a power of two");
                Self((self.0 + align - 1) & !(align - 1))
            }
        }

        impl fmt::Pointer for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{:p}", self.0 as *const u8)
            }
        }

        impl fmt::Debug for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}({:#x})", stringify!($name), self.0)
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{:#x}", self.0)
            }
        }

        impl From<usize> for $name {
            #[inline]
            fn from(addr: usize) -> Self {
                Self::new(addr)
            }
        }

        impl Add<usize> for $name {
            type Output = Self;

            #[inline]
            fn add(self, rhs: usize) -> Self::Output {
                Self::new(self.0 + rhs)
            }
        }

        impl Sub<usize> for $name {
            type Output = Self;

            #[inline]
            fn sub(self, rhs: usize) -> Self::Output {
                Self::new(self.0 - rhs)
            }
        }

        impl Sub<$name> for $name {
            type Output = usize;

            #[inline]
            fn sub(self, rhs: $name) -> Self::Output {
                self.0 - rhs.0
            }
        }
    };
}

impl_address_common!(
    PhysicalAddress,
    "A physical memory address.\n\n\
     This is a newtype wrapper around the architecture-dependent representation of a\n\
     physical address. It provides methods for address manipulation and alignment checks."
);

impl PhysicalAddress {
    /// Creates a new physical address.
    ///
    /// # Panics
    ///
    /// Panics if the address exceeds the architecture's maximum physical address width.
    #[inline]
    pub const fn new(addr: usize) -> Self {
        assert!(
            arch::validate_physical(addr),
            "physical address exceeds maximum width"
        );
        Self(addr)
    }

    /// Converts a direct-mapped virtual address back to a physical address.
    ///
    /// This is the unmap half of the pool-page mapping: it recovers the
    /// physical page behind a node or leaf pointer.
    ///
    /// # Panics
    ///
    /// Panics if the address translator has not been set via [`AddressTranslator::set_current`].
    #[inline]
    pub fn from_direct_mapped(virt: VirtualAddress) -> Self {
        let translator = AddressTranslator::current();
        Self::new(translator.virt_to_phys(virt.as_usize()))
    }
}

impl_address_common!(
    VirtualAddress,
    "A virtual memory address.\n\n\
     This is a newtype wrapper around the architecture-dependent representation of a\n\
     virtual address. It provides methods for address manipulation, alignment checks,\n\
     and extracting segment-table indices."
);

impl VirtualAddress {
    /// Creates a new virtual address.
    ///
    /// # Panics
    ///
    /// Panics if the address is not valid for the architecture.
    #[inline]
    pub const fn new(addr: usize) -> Self {
        assert!(arch::validate_virtual(addr), "address is not canonical");
        Self(addr)
    }

    /// Creates a virtual address from a physical address using the direct map offset.
    ///
    /// This is the map half of the pool-page mapping: nodes and leaf PTE
    /// pages are reached through the direct map rather than ephemeral
    /// mappings.
    ///
    /// # Panics
    ///
    /// Panics if the address translator has not been set via [`AddressTranslator::set_current`].
    #[inline]
    pub fn direct_mapped(phys: PhysicalAddress) -> Self {
        let translator = AddressTranslator::current();
        Self::new(translator.phys_to_virt(phys.as_usize()))
    }

    /// Returns true if this virtual address is in the direct-mapped region.
    ///
    /// A virtual address is considered direct-mapped if it is greater than or
    /// equal to the direct map offset. Returns false if the address translator
    /// has not been set.
    #[inline]
    pub fn is_direct_mapped(self) -> bool {
        AddressTranslator::try_current()
            .map(|translator| self.0 >= translator.direct_map_offset)
            .unwrap_or(false)
    }

    /// Converts the address to a pointer.
    #[inline]
    pub const fn as_ptr<T>(self) -> *const T {
        self.0 as *const T
    }

    /// Converts the address to a mutable pointer.
    #[inline]
    pub const fn as_mut_ptr<T>(self) -> *mut T {
        self.0 as *mut T
    }

    /// Returns the byte offset within the containing page.
    #[inline]
    pub const fn page_offset(self) -> usize {
        self.0 & (arch::PAGE_SIZE - 1)
    }

    /// Returns the index of this address's PTE within its leaf page.
    #[inline]
    pub const fn pte_index(self) -> usize {
        (self.0 >> arch::PAGE_SHIFT) & (arch::PTE_PER_PAGE - 1)
    }

    /// Returns the index of this address's segment within its node.
    #[inline]
    pub const fn seg_index(self) -> usize {
        (self.0 >> arch::SEG_SHIFT) & (arch::SEGTAB_FANOUT - 1)
    }

    /// Returns the index of this address's interior node within the root.
    #[cfg(target_pointer_width = "64")]
    #[inline]
    pub const fn xseg_index(self) -> usize {
        (self.0 >> arch::XSEG_SHIFT) & (arch::SEGTAB_FANOUT - 1)
    }

    /// Truncates the address to the start of its segment.
    #[inline]
    pub const fn trunc_seg(self) -> Self {
        Self(self.0 & !(arch::SEG_SIZE - 1))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    mod physical_address {
        use super::*;

        #[test]
        fn new_valid_address() {
            let addr = PhysicalAddress::new(0x1000);
            assert_eq!(addr.as_usize(), 0x1000);
        }

        #[test]
        fn alignment_check() {
            let addr = PhysicalAddress::new(arch::PAGE_SIZE * 4);
            assert!(addr.is_aligned(arch::PAGE_SIZE));
            assert!(addr.is_aligned(1));
            assert!(!addr.is_aligned(arch::PAGE_SIZE * 8));
        }

        #[test]
        fn align_down_and_up() {
            let addr = PhysicalAddress::new(0x1234);
            assert_eq!(
                addr.align_down(arch::PAGE_SIZE),
                PhysicalAddress::new(0x1000)
            );
            assert_eq!(addr.align_up(arch::PAGE_SIZE), PhysicalAddress::new(0x2000));
        }

        #[test]
        fn arithmetic_operators() {
            let addr = PhysicalAddress::new(0x1000);
            assert_eq!((addr + 0x50).as_usize(), 0x1050);
            assert_eq!((addr - 0x800).as_usize(), 0x800);
            assert_eq!(addr - PhysicalAddress::new(0x800), 0x800);
        }
    }

    mod virtual_address {
        use super::*;

        #[test]
        fn page_offset() {
            let addr = VirtualAddress::new(0x1234);
            assert_eq!(addr.page_offset(), 0x234);
        }

        #[test]
        fn pte_index_within_segment() {
            // 0x1000 is the second page of segment 0.
            assert_eq!(VirtualAddress::new(0x1000).pte_index(), 1);
            assert_eq!(VirtualAddress::new(0x2000).pte_index(), 2);
            // The index wraps at the segment boundary.
            assert_eq!(VirtualAddress::new(arch::SEG_SIZE).pte_index(), 0);
            let last = arch::SEG_SIZE - arch::PAGE_SIZE;
            assert_eq!(
                VirtualAddress::new(last).pte_index(),
                arch::PTE_PER_PAGE - 1
            );
        }

        #[test]
        fn seg_index_within_node() {
            assert_eq!(VirtualAddress::new(0x1000).seg_index(), 0);
            assert_eq!(VirtualAddress::new(arch::SEG_SIZE).seg_index(), 1);
            assert_eq!(VirtualAddress::new(3 * arch::SEG_SIZE + 0x123).seg_index(), 3);
        }

        #[test]
        #[cfg(target_pointer_width = "64")]
        fn xseg_index_within_root() {
            assert_eq!(VirtualAddress::new(0x1000).xseg_index(), 0);
            assert_eq!(VirtualAddress::new(arch::XSEG_SIZE).xseg_index(), 1);
            assert_eq!(
                VirtualAddress::new(2 * arch::XSEG_SIZE + arch::SEG_SIZE).xseg_index(),
                2
            );
        }

        #[test]
        fn trunc_seg_truncates_to_segment_start() {
            let addr = VirtualAddress::new(arch::SEG_SIZE + 0x3456);
            assert_eq!(addr.trunc_seg().as_usize(), arch::SEG_SIZE);
            assert_eq!(
                VirtualAddress::new(0x1000).trunc_seg(),
                VirtualAddress::new(0)
            );
        }

        #[test]
        fn pointer_conversion() {
            let addr = VirtualAddress::new(0x1000);
            assert_eq!(addr.as_ptr::<u8>() as usize, 0x1000);
            assert_eq!(addr.as_mut_ptr::<u8>() as usize, 0x1000);
        }
    }

    mod translator {
        use super::*;

        fn setup() {
            if AddressTranslator::try_current().is_none() {
                AddressTranslator::set_current(AddressTranslator::new(0));
            }
        }

        #[test]
        fn identity_round_trip() {
            setup();
            let phys = PhysicalAddress::new(0x1000);
            let virt = VirtualAddress::direct_mapped(phys);
            assert_eq!(virt.as_usize(), 0x1000);
            assert_eq!(PhysicalAddress::from_direct_mapped(virt), phys);
        }

        #[test]
        fn typed_pointer_translation() {
            setup();
            let translator = AddressTranslator::current();
            let ptr: *mut u64 = translator.phys_to_ptr(0x2000);
            assert_eq!(ptr as usize, 0x2000);
            assert_eq!(translator.ptr_to_phys(ptr), 0x2000);
        }

        #[test]
        #[should_panic(expected = "address translator already set")]
        fn panics_on_double_set() {
            AddressTranslator::set_current(AddressTranslator::new(0));
            AddressTranslator::set_current(AddressTranslator::new(0x1000));
        }
    }
}
